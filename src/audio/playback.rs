//! Output hosts that drive a [`RenderTask`] on an audio clock
//!
//! [`CpalOutput`] hands the task to a cpal output stream running on its own
//! thread. [`ClockedOutput`] calls the task from a fixed-period thread and
//! discards the audio, for headless listeners and tests.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::{bounded, Receiver};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::device::get_output_device;
use crate::audio::render::RenderTask;
use crate::error::AudioError;

/// How long `attach` waits for the output thread to report the stream state
const STREAM_START_TIMEOUT: Duration = Duration::from_secs(3);

/// Something that can invoke a render task on a periodic clock
pub trait RenderHost: Send {
    /// Start calling `task` once per quantum
    fn attach(&mut self, task: RenderTask) -> Result<(), AudioError>;

    /// Stop calling the task and drop it. Once this returns no callback can
    /// touch the task's ring reader again.
    fn detach(&mut self);

    fn is_attached(&self) -> bool;

    /// Errors raised on the output thread while attached, if the host reports any
    fn error_receiver(&self) -> Option<Receiver<AudioError>> {
        None
    }
}

/// Render host backed by a cpal output device
pub struct CpalOutput {
    /// `None` selects the default output device
    device_id: Option<String>,

    /// Whether the output stream is running
    running: Arc<AtomicBool>,

    /// Stream thread handle
    thread_handle: Option<JoinHandle<()>>,

    /// Channel for stream errors, replaced on each attach
    error_rx: Option<Receiver<AudioError>>,

    config: StreamConfig,
}

impl CpalOutput {
    pub fn new(
        device_id: Option<&str>,
        sample_rate: u32,
        channels: u16,
        quantum_frames: Option<u32>,
    ) -> Result<Self, AudioError> {
        // Fail early if the device is missing
        let device = get_output_device(device_id)?;
        tracing::debug!("Using output device {}", device.name);

        let config = StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: match quantum_frames {
                Some(frames) => cpal::BufferSize::Fixed(frames),
                None => cpal::BufferSize::Default,
            },
        };

        Ok(Self {
            device_id: device_id.map(str::to_string),
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            error_rx: None,
            config,
        })
    }
}

impl RenderHost for CpalOutput {
    fn attach(&mut self, mut task: RenderTask) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(AudioError::AlreadyAttached);
        }

        let device = get_output_device(self.device_id.as_deref())?;
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (started_tx, started_rx) = bounded::<Result<(), AudioError>>(1);
        self.error_rx = Some(error_rx);

        let running = self.running.clone();
        let running_for_loop = self.running.clone();
        let config = self.config.clone();

        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("render-output".to_string())
            .spawn(move || {
                let cpal_device = device.into_inner();

                let stream = cpal_device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        if !running.load(Ordering::Relaxed) {
                            data.fill(0.0);
                            return;
                        }
                        task.render_interleaved(data);
                    },
                    move |err| {
                        let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
                    },
                    None,
                );

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        running_for_loop.store(false, Ordering::SeqCst);
                        let _ = started_tx.send(Err(AudioError::CpalError(e.to_string())));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    running_for_loop.store(false, Ordering::SeqCst);
                    let _ = started_tx.send(Err(AudioError::StreamError(e.to_string())));
                    return;
                }
                let _ = started_tx.send(Ok(()));

                // Keep the stream alive while attached
                while running_for_loop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }

                // Dropping the stream here detaches the callback and the task
                drop(stream);
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        self.thread_handle = Some(handle);

        match started_rx.recv_timeout(STREAM_START_TIMEOUT) {
            Ok(Ok(())) => {
                tracing::info!(
                    "Output stream started: {}Hz, {} channels",
                    self.config.sample_rate.0,
                    self.config.channels
                );
                Ok(())
            }
            Ok(Err(e)) => {
                self.detach();
                Err(e)
            }
            Err(_) => {
                self.detach();
                Err(AudioError::StreamError("output stream did not start".into()))
            }
        }
    }

    fn detach(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    fn is_attached(&self) -> bool {
        self.thread_handle.is_some() && self.running.load(Ordering::SeqCst)
    }

    fn error_receiver(&self) -> Option<Receiver<AudioError>> {
        self.error_rx.clone()
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Render host that ticks on a plain thread and discards the output
pub struct ClockedOutput {
    channels: usize,
    quantum_frames: usize,
    period: Duration,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl ClockedOutput {
    pub fn new(channels: u16, quantum_frames: usize, period: Duration) -> Self {
        Self {
            channels: channels.max(1) as usize,
            quantum_frames: quantum_frames.max(1),
            period,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
        }
    }

    /// Tick at the rate a real device would request quanta
    pub fn realtime(sample_rate: u32, channels: u16, quantum_frames: usize) -> Self {
        let period = Duration::from_secs_f64(quantum_frames as f64 / sample_rate.max(1) as f64);
        Self::new(channels, quantum_frames, period)
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

impl RenderHost for ClockedOutput {
    fn attach(&mut self, mut task: RenderTask) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(AudioError::AlreadyAttached);
        }

        let running = self.running.clone();
        let period = self.period;
        let mut quantum = vec![0.0f32; self.quantum_frames * self.channels];

        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("render-clock".to_string())
            .spawn(move || {
                let mut next_tick = Instant::now();
                while running.load(Ordering::Relaxed) {
                    task.render_interleaved(&mut quantum);

                    next_tick += period;
                    let now = Instant::now();
                    if next_tick > now {
                        thread::sleep(next_tick - now);
                    } else {
                        // Fell behind; do not try to catch up with a burst
                        next_tick = now;
                    }
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        self.thread_handle = Some(handle);
        Ok(())
    }

    fn detach(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    fn is_attached(&self) -> bool {
        self.thread_handle.is_some()
    }
}

impl Drop for ClockedOutput {
    fn drop(&mut self) {
        self.detach();
    }
}
