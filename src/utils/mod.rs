//! The `utils` module provides the pieces shared by every layer of
//! `litemqtt`: the error taxonomy and logging setup.

pub mod error;
pub mod logging;

pub use error::{BridgeError, ErrorKind, Operation, Result};

#[cfg(test)]
mod tests;
