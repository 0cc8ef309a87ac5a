//! Worker protocol bridge.
//!
//! - **protocol**: public and worker JSON dialects plus the translation between them
//! - **codec**: decoder for the worker's concatenated-JSON completion stream

pub mod codec;
pub mod protocol;
