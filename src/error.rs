//! Custom error types for the divider controller.
//!
//! `DividerError` is the single error type used across the crate. Following the
//! error taxonomy of the protocol engine, only a few of its variants ever reach a
//! caller:
//!
//! - **`Config`** / **`Configuration`**: the configuration could not be loaded, or it
//!   loaded but holds values the engine cannot use (e.g. 9 data bits).
//! - **`Transport`**: the serial port could not be opened. This is the only link
//!   failure that is surfaced synchronously, and only from the strict
//!   `connect` constructors.
//! - **`Busy`** / **`InvalidRequest`**: a control request was refused before anything
//!   was queued.
//!
//! Everything else (write failures, framing overruns, malformed replies, bulk
//! transfer timeouts) is logged and absorbed by the engine loops.

use crate::engine::state::CommState;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DividerError>;

/// Errors produced by the divider controller.
#[derive(Error, Debug)]
pub enum DividerError {
    /// The configuration sources could not be read or deserialized.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// The configuration parsed but failed semantic validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Underlying I/O failure on the serial link.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The serial port could not be opened.
    #[error("Failed to open serial port '{port}': {source}")]
    Transport {
        /// Port name as configured.
        port: String,
        /// Error reported by the serial driver.
        #[source]
        source: tokio_serial::Error,
    },

    /// The link is down; nothing was written.
    #[error("Serial link is down")]
    LinkDown,

    /// A bulk transfer was requested while the controller could not accept one.
    #[error("Divider is busy ({0})")]
    Busy(CommState),

    /// A control request carried an unusable payload.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// `start` was called on an engine that is already running.
    #[error("Engine already started")]
    AlreadyStarted,

    /// The engine has been shut down and cannot be restarted.
    #[error("Engine has been shut down")]
    ShutDown,

    /// The tracing subscriber could not be installed.
    #[error("Failed to initialize tracing: {0}")]
    Logging(String),
}

impl From<figment::Error> for DividerError {
    fn from(value: figment::Error) -> Self {
        DividerError::Config(Box::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_error_names_the_state() {
        let err = DividerError::Busy(CommState::UploadingFromDevice);
        assert_eq!(err.to_string(), "Divider is busy (UploadingFromDevice)");
    }

    #[test]
    fn configuration_error_keeps_message() {
        let err = DividerError::Configuration("data_bits must be 5-8".into());
        assert!(err.to_string().contains("data_bits"));
    }

    #[test]
    fn io_errors_convert_with_question_mark() {
        fn fails() -> AppResult<()> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"))?;
            Ok(())
        }
        match fails() {
            Err(DividerError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::BrokenPipe),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
