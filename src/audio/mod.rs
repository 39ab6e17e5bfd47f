//! Audio subsystem: the shared ring, the render task and its output hosts

pub mod buffer;
pub mod device;
pub mod playback;
pub mod render;

pub use buffer::{create_shared_ring, RingReader, RingSnapshot, RingWriter, SharedRing};
pub use device::{get_output_device, list_devices, AudioDevice, AudioDeviceInfo};
pub use playback::{ClockedOutput, CpalOutput, RenderHost};
pub use render::{RenderStats, RenderStatsSnapshot, RenderTask};
