pub mod handlers;
pub mod server;

pub use server::{start, AppState, ServerConfig, ServerHandle};
