//! HTTP/WebSocket adapter over the dispatcher.

pub mod routes;

pub use routes::{ApiState, dispatch_routes};
