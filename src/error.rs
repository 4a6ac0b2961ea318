//! Error types for CD-1.1 acquisition.
//!
//! Every fallible operation in the crate returns [`Cd11Error`]. Frame decoding has
//! its own [`DecodeError`] because a malformed frame is recovered locally by the
//! session receive loop and never tears a session down on its own.
//!
//! ## Error Categories
//!
//! - **Decode Errors**: malformed length, bad checksum, unknown frame type
//! - **Encode Errors**: a field does not fit its fixed wire width
//! - **Handshake Errors**: no connection response in time, or a rejection response
//! - **Socket Errors**: connection reset or I/O failure on a station socket
//! - **Authentication Errors**: trailer authentication fields failed validation
//! - **Configuration Errors**: invalid receiver or station configuration
//!
//! ## Recovery and Retry
//!
//! ```rust
//! use cd11_ingest::Cd11Error;
//! use std::time::Duration;
//!
//! let error = Cd11Error::handshake_timeout("ARCES", Duration::from_secs(10));
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for acquisition operations.
pub type Result<T, E = Cd11Error> = std::result::Result<T, E>;

/// Reasons a byte buffer failed to decode as a CD-1.1 frame.
///
/// Decoding is all-or-nothing: none of these ever accompany a partially
/// populated frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Malformed frame in {context}: {details}")]
    Malformed { context: String, details: String },

    #[error("Checksum mismatch: trailer carries {expected:#018x}, computed {computed:#018x}")]
    ChecksumMismatch { expected: u64, computed: u64 },

    #[error("Unknown frame type {0}")]
    UnknownFrameType(u32),
}

impl DecodeError {
    /// Helper constructor for structural errors.
    pub fn malformed(context: impl Into<String>, details: impl Into<String>) -> Self {
        DecodeError::Malformed { context: context.into(), details: details.into() }
    }
}

/// Main error type for acquisition operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Cd11Error {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("Cannot encode {context}: {details}")]
    Encode { context: String, details: String },

    #[error("Station {station}: no connection response within {duration:?}")]
    HandshakeTimeout { station: String, duration: Duration },

    #[error("Station {station}: connection rejected: {reason}")]
    HandshakeRejected { station: String, reason: String },

    #[error("Socket error: {context}")]
    Socket {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Authentication failed for key {key_id}: {reason}")]
    Authentication { key_id: u32, reason: String },

    #[error("Configuration error: {reason}")]
    Config {
        reason: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Downstream sink unavailable: {reason}")]
    Sink { reason: String },

    #[error("Station {station} is not registered")]
    UnknownStation { station: String },
}

impl Cd11Error {
    /// Returns whether this error is potentially recoverable through retry.
    ///
    /// The crate itself never retries; this guides the external scheduler.
    pub fn is_retryable(&self) -> bool {
        match self {
            Cd11Error::HandshakeTimeout { .. } => true,
            Cd11Error::Socket { .. } => true,
            Cd11Error::Sink { .. } => true,
            Cd11Error::Decode(_) => false,
            Cd11Error::Encode { .. } => false,
            Cd11Error::HandshakeRejected { .. } => false,
            Cd11Error::Authentication { .. } => false,
            Cd11Error::Config { .. } => false,
            Cd11Error::UnknownStation { .. } => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            Cd11Error::Decode(_) => vec![
                "Check the provider speaks CD-1.1 framing",
                "Inspect the provider for byte corruption on the link",
            ],
            Cd11Error::Encode { .. } => vec![
                "Check identifier lengths against their fixed field widths",
                "Keep timestamps within four-digit years",
            ],
            Cd11Error::HandshakeTimeout { .. } => vec![
                "Verify the connection manager address and port",
                "Check UDP reachability between receiver and connection manager",
                "Increase the handshake timeout",
            ],
            Cd11Error::HandshakeRejected { .. } => vec![
                "Check the station is present in the connection manager roster",
                "Verify station name and protocol version",
            ],
            Cd11Error::Socket { .. } => vec![
                "Check the data provider is still running",
                "Re-run the connection exchange for the station",
            ],
            Cd11Error::Authentication { .. } => vec![
                "Verify the authentication key identifier",
                "Check the station's signing configuration",
            ],
            Cd11Error::Config { .. } => vec![
                "Check the configuration file syntax",
                "Verify identifier widths and interval values",
            ],
            Cd11Error::Sink { .. } => vec![
                "Check the downstream consumer is draining its queue",
                "Increase the forward queue capacity",
            ],
            Cd11Error::UnknownStation { .. } => vec![
                "Check station name spelling",
                "Run the connection exchange before looking the station up",
            ],
        }
    }

    /// Helper constructor for encode errors.
    pub fn encode(context: impl Into<String>, details: impl Into<String>) -> Self {
        Cd11Error::Encode { context: context.into(), details: details.into() }
    }

    /// Helper constructor for handshake timeouts.
    pub fn handshake_timeout(station: impl Into<String>, duration: Duration) -> Self {
        Cd11Error::HandshakeTimeout { station: station.into(), duration }
    }

    /// Helper constructor for handshake rejections.
    pub fn handshake_rejected(station: impl Into<String>, reason: impl Into<String>) -> Self {
        Cd11Error::HandshakeRejected { station: station.into(), reason: reason.into() }
    }

    /// Helper constructor for socket errors with context.
    pub fn socket(context: impl Into<String>, source: std::io::Error) -> Self {
        Cd11Error::Socket { context: context.into(), source }
    }

    /// Helper constructor for authentication failures.
    pub fn authentication(key_id: u32, reason: impl Into<String>) -> Self {
        Cd11Error::Authentication { key_id, reason: reason.into() }
    }

    /// Helper constructor for configuration errors.
    pub fn config(reason: impl Into<String>) -> Self {
        Cd11Error::Config { reason: reason.into(), path: None, source: None }
    }

    /// Helper constructor for configuration errors tied to a file.
    pub fn config_file(
        path: PathBuf,
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Cd11Error::Config { reason: reason.into(), path: Some(path), source: Some(source) }
    }
}

impl From<std::io::Error> for Cd11Error {
    fn from(err: std::io::Error) -> Self {
        Cd11Error::Socket { context: "I/O".to_string(), source: err }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(test)]
    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
          #[test]
          fn error_messages_carry_their_context(
            station in "[A-Z0-9]{1,8}",
            reason in ".*",
            key_id in any::<u32>(),
            timeout_ms in 1u64..60000u64
          ) {
            let timeout = Cd11Error::handshake_timeout(station.clone(), Duration::from_millis(timeout_ms));
            let rejected = Cd11Error::handshake_rejected(station.clone(), reason.clone());
            let auth = Cd11Error::authentication(key_id, reason.clone());

            prop_assert!(timeout.to_string().contains(&station));
            prop_assert!(rejected.to_string().contains(&station));
            prop_assert!(rejected.to_string().contains(&reason));
            prop_assert!(auth.to_string().contains(&key_id.to_string()));
          }

          #[test]
          fn io_errors_convert_to_socket_errors(reason in ".*") {
            let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, reason.clone());
            let converted: Cd11Error = io_err.into();
            match converted {
              Cd11Error::Socket { source, .. } => prop_assert_eq!(source.to_string(), reason),
              _ => prop_assert!(false, "Expected Socket error from io::Error conversion"),
            }
          }
        }
    }

    #[test]
    fn error_traits_validation() {
        fn assert_send_sync_static<T: Send + Sync + 'static>() {}
        assert_send_sync_static::<Cd11Error>();
        assert_send_sync_static::<DecodeError>();

        let error = Cd11Error::config("bad");
        let _: &dyn std::error::Error = &error;
    }

    #[test]
    fn retry_classification() {
        assert!(Cd11Error::handshake_timeout("A", Duration::from_secs(1)).is_retryable());
        assert!(!Cd11Error::handshake_rejected("A", "unknown station").is_retryable());
        assert!(!Cd11Error::from(DecodeError::UnknownFrameType(99)).is_retryable());
        assert!(!Cd11Error::authentication(7, "key not allowed").is_retryable());
    }

    #[test]
    fn every_error_has_suggestions() {
        let errors = [
            Cd11Error::from(DecodeError::malformed("header", "short")),
            Cd11Error::encode("creator", "too long"),
            Cd11Error::handshake_timeout("A", Duration::from_secs(1)),
            Cd11Error::handshake_rejected("A", "no"),
            Cd11Error::socket("read", std::io::Error::other("reset")),
            Cd11Error::authentication(1, "no"),
            Cd11Error::config("no"),
            Cd11Error::Sink { reason: "closed".into() },
            Cd11Error::UnknownStation { station: "A".into() },
        ];
        for error in &errors {
            let suggestions = error.recovery_suggestions();
            assert!(!suggestions.is_empty(), "{error} has no suggestions");
            assert!(suggestions.iter().all(|s| s.len() > 5));
        }
    }

    #[test]
    fn decode_errors_display() {
        let err = DecodeError::ChecksumMismatch { expected: 1, computed: 2 };
        assert!(err.to_string().contains("0x0000000000000001"));
        assert_eq!(DecodeError::UnknownFrameType(42).to_string(), "Unknown frame type 42");
    }
}
