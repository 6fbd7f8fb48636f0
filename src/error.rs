//! Error handling types for tcpcom
//!
//! Every failure surfaces to callers as a [`TransportError`] delivered through
//! the nearest callback. The `code()` accessor exists for interface symmetry
//! with the callback contract and is always empty.

use std::sync::PoisonError;
use std::time::Duration;
use thiserror::Error;

/// Message reported when work is submitted to a channel after teardown.
pub const DISCONNECTED_MESSAGE: &str = "socket is disconnected";

/// Comprehensive error type for transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    /// Outbound connect failed (refused, unreachable, resolution failure)
    #[error("Connect to {target} failed: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// Outbound connect did not complete within the configured timeout
    #[error("Connect to {target} timed out after {timeout:?}")]
    ConnectTimeout { target: String, timeout: Duration },

    /// Listening socket could not be opened or stopped accepting
    #[error("Bind failed: {0}")]
    Bind(#[source] std::io::Error),

    /// Read from a connected socket failed
    #[error("Read failed: {0}")]
    Read(#[source] std::io::Error),

    /// No bytes arrived within the read timeout
    #[error("Read timed out after {0:?}")]
    ReadTimeout(Duration),

    /// Read returned zero bytes
    #[error("Connection closed by peer")]
    PeerClosed,

    /// Write or flush on a connected socket failed
    #[error("Write failed: {0}")]
    Write(#[source] std::io::Error),

    /// Work was submitted after the channel was torn down
    #[error("{}", DISCONNECTED_MESSAGE)]
    Disconnected,

    /// `start_receive` was called more than once on one channel
    #[error("Channel is already receiving")]
    AlreadyReceiving,

    /// Caller passed an unusable argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A manager was constructed outside of a tokio runtime
    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),

    /// Configuration could not be loaded or failed validation
    #[error("Invalid configuration: {message}")]
    Config { message: String },
}

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// Helper functions for common error patterns
impl TransportError {
    /// Create a connect error for `target`
    pub fn connect(target: impl Into<String>, source: std::io::Error) -> Self {
        TransportError::Connect {
            target: target.into(),
            source,
        }
    }

    /// Create a connect timeout error for `target`
    pub fn connect_timeout(target: impl Into<String>, timeout: Duration) -> Self {
        TransportError::ConnectTimeout {
            target: target.into(),
            timeout,
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        TransportError::InvalidArgument(message.into())
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        TransportError::Config {
            message: message.into(),
        }
    }

    /// Secondary error code. Always empty.
    pub fn code(&self) -> &'static str {
        ""
    }
}

/// Helper trait to recover a guard from a poisoned lock.
pub trait LockResultExt<T> {
    /// Recover the guard from a PoisonError, logging which operation hit it.
    ///
    /// Registry and channel state stay consistent across a panicking callback
    /// because callbacks never run while a lock is held.
    fn recover_poison(self, context: &str) -> T;
}

impl<T> LockResultExt<T> for std::result::Result<T, PoisonError<T>> {
    fn recover_poison(self, context: &str) -> T {
        match self {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!(
                    target: "tcpcom::lock_recovery",
                    "Recovered from poisoned lock in {}",
                    context
                );
                poisoned.into_inner()
            }
        }
    }
}
