//! # Observability Module
//!
//! Structured logging for the node. HTTP requests are traced by the router's
//! `TraceLayer`; connection and stream events are logged by the cable crates.

mod logging;

pub use logging::{default_directives, init_logging, LogFormat};
