pub mod command;
pub mod health;
pub mod monitor;
pub mod proxy;
pub mod state;

mod process;

pub use process::{Process, ProcessConfig, StopStrategy, DEFAULT_GRACEFUL_STOP_TIMEOUT};
