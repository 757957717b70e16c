pub mod bridge;
pub mod cli;
pub mod codec;
pub mod config;
pub mod driver;
pub mod error;
pub mod handlers;
pub mod handles;
pub mod host;
pub mod peripheral;
pub mod runtime;
pub mod server;
pub mod watchdog;

pub use driver::ScriptedHmdDriver;
pub use error::BridgeError;
pub use server::{DriverContext, ServerDriver};
