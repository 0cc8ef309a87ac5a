//! Transport layer for the runner.
//!
//! HTTP via axum is the only transport.

pub mod http;

pub use http::{ServerConfig, serve};
