//! Custom error types for the slow-controls poller.
//!
//! `ScError` is the single error type of the library. It follows the failure
//! taxonomy of the polling engine:
//!
//! - **`Connection`**: a crate link refused or timed out while connecting. The
//!   low-voltage crate retries these per its fallback policy and substitutes
//!   sentinel readings once the attempts are exhausted.
//! - **`ReadTimeout`**: the session is open but no terminator arrived in time.
//!   The executor converts these into an empty contribution.
//! - **`LinkClosed`**: the peer closed the session before the terminator.
//! - **`Parse`**: a reply did not match the expected grammar or field count.
//!   Only the affected board is dropped for the cycle.
//! - **`Abandoned`**: a shared-link request whose deadline expired while it
//!   waited for the link; it is dropped before reaching the crate.
//! - **`ExternalProcess`**: the bias status command failed or printed
//!   malformed output. The bias subsystem contributes nothing for the cycle.
//! - **`ChannelMap`**, **`Protocol`**, **`Config`**, **`Io`**: loader, wire and
//!   startup errors.
//!
//! No error in one subsystem or board aborts the polling of another; the
//! scheduler logs and absorbs everything except startup errors.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type ScResult<T> = std::result::Result<T, ScError>;

#[derive(Error, Debug)]
pub enum ScError {
    #[error("Connection to {endpoint} failed: {source}")]
    Connection {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No terminator from {endpoint} within {timeout:?}")]
    ReadTimeout { endpoint: String, timeout: Duration },

    #[error("Link to {0} closed before the reply terminator")]
    LinkClosed(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Request to {0} abandoned after its deadline")]
    Abandoned(String),

    #[error("External status command error: {0}")]
    ExternalProcess(String),

    #[error("Channel map error: {0}")]
    ChannelMap(String),

    #[error("Distribution protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ScError {
    /// Whether the error leaves the session usable for the next command.
    ///
    /// Parse errors do, and so does a request abandoned before it was sent;
    /// anything on the transport means the stream may be desynchronised and
    /// must be reopened.
    pub fn keeps_session(&self) -> bool {
        matches!(self, ScError::Parse(_) | ScError::Abandoned(_))
    }

    pub(crate) fn parse(msg: impl Into<String>) -> Self {
        ScError::Parse(msg.into())
    }
}

impl From<figment::Error> for ScError {
    fn from(err: figment::Error) -> Self {
        ScError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_errors_keep_the_session() {
        assert!(ScError::parse("bad").keeps_session());
        assert!(ScError::Abandoned("north".into()).keeps_session());
        assert!(!ScError::LinkClosed("north".into()).keeps_session());
        assert!(!ScError::ReadTimeout {
            endpoint: "lv".into(),
            timeout: Duration::from_millis(10),
        }
        .keeps_session());
    }

    #[test]
    fn connection_error_mentions_endpoint() {
        let err = ScError::Connection {
            endpoint: "10.20.34.98:9760".into(),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        assert!(err.to_string().contains("10.20.34.98:9760"));
    }
}
