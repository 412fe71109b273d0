//! Structured logging for the auth gateway: `tracing` + `tracing-subscriber`,
//! configurable as human-readable or JSON, with a request-scoped span
//! carrying a request ID.

mod tracing_init;

pub use tracing_init::{TracingError, TracingGuard, init_tracing};
