//! Network subsystem: WebSocket audio ingest

pub mod ingest;

pub use ingest::{CloseReason, IngestExit, IngestState, IngestStats, IngestStatsSnapshot, IngestTask, WsStream};
