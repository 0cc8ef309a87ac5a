//! HTTP transport: the public load/completion/health API.

mod routes;
mod server;

pub use routes::routes;
pub use server::{ServerConfig, serve};
