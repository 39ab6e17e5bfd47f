//! Status HTTP API
//!
//! Read-only JSON view of the session registry for dashboards and scripts.

pub mod handlers;
pub mod server;

pub use handlers::ApiResponse;
pub use server::{AppState, WebServer};
