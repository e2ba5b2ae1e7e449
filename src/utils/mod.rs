//! The `utils` module holds the pieces shared by every other module of
//! `mqclient`: the error type and the logging bootstrap.

pub mod error;
pub mod logging;

pub use error::{MqError, Result};
