pub mod body;
pub mod handlers;
pub mod middleware;
pub mod server;

pub use server::{run_server, RunningServer, ServerError};
