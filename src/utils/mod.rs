//! The `utils` module provides shared definitions used across the `mqd`
//! daemon: the error taxonomy every layer returns, and logging setup.

pub mod error;
pub mod logging;

pub use error::{BrokerError, Result};
