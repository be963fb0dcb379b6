pub mod commands;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod router;
pub mod server;
pub mod transport;

#[cfg(test)]
pub mod test_utils;

pub use error::{GatewayError, Result};
