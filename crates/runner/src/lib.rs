//! Engine dispatcher for the model runner.
//!
//! Chooses which backend serves a model and parses the AirLLM engine's
//! command line. The binary in `main.rs` wires these to `airllm_runner`.

pub mod cli;
pub mod dispatch;
pub mod error;

pub use cli::RunnerArgs;
pub use dispatch::{Backend, Classifier, DiskSource, ModelSource, Selection, select};
pub use error::CliError;
