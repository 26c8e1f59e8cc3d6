//! Shared error types for the tether object bus.

use std::sync::Arc;
use thiserror::Error;

/// Top-level error type for every tether crate.
///
/// Errors are `Clone`: a settled future hands the same outcome to every reader.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// A value did not have the shape the caller asked for.
    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// Signature that was requested.
        expected: String,
        /// Signature of the value that was present.
        found: String,
    },

    /// Call arguments, a property value or a return value did not match
    /// the declared signature.
    #[error("Signature mismatch: {0}")]
    SignatureMismatch(String),

    /// No action matches the requested name or id.
    #[error("No such action: {0}")]
    NoSuchAction(String),

    /// More than one action matches the request.
    #[error("Ambiguous action: {0}")]
    AmbiguousAction(String),

    /// No signal with this name or id.
    #[error("No such signal: {0}")]
    NoSuchSignal(String),

    /// No property with this name or id.
    #[error("No such property: {0}")]
    NoSuchProperty(String),

    /// A signal or property name is declared twice on one object.
    #[error("Duplicate member: {0}")]
    DuplicateMember(String),

    /// A service name is already taken on this endpoint.
    #[error("Name already registered: {0}")]
    NameAlreadyRegistered(String),

    /// A name or object id lookup missed.
    #[error("No such name: {0}")]
    NoSuchName(String),

    /// A signature string could not be parsed.
    #[error("Invalid signature '{0}'")]
    InvalidSignature(String),

    /// The connection carrying the request went away.
    #[error("Connection closed")]
    ConnectionClosed,

    /// There is no established connection to send on.
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// A local timeout elapsed before the reply arrived.
    #[error("Timed out")]
    TimedOut,

    /// The producer canceled the operation.
    #[error("Canceled")]
    Canceled,

    /// A promise was settled a second time.
    #[error("Promise already settled")]
    PromiseAlreadySettled,

    /// A promise was dropped without being settled.
    #[error("Broken promise")]
    BrokenPromise,

    /// A frame could not be decoded.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// The handler of a remote or local action failed.
    #[error("Remote error: {0}")]
    Remote(String),

    /// Connection handshake failed.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Peers speak different protocol versions.
    #[error("Protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch {
        /// Our protocol version.
        local: u32,
        /// The peer's protocol version.
        remote: u32,
    },

    /// A frame exceeded the configured size limit.
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge {
        /// Announced frame size.
        size: u32,
        /// Configured limit.
        max: u32,
    },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl Error {
    /// Build a `TypeMismatch` from two displayable signatures.
    pub fn type_mismatch(expected: impl ToString, found: impl ToString) -> Self {
        Self::TypeMismatch {
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }

    /// Stable numeric code used to carry this error kind in an error frame.
    pub fn code(&self) -> u16 {
        match self {
            Self::TypeMismatch { .. } => 1,
            Self::SignatureMismatch(_) => 2,
            Self::NoSuchAction(_) => 3,
            Self::AmbiguousAction(_) => 4,
            Self::NoSuchSignal(_) => 5,
            Self::NoSuchProperty(_) => 6,
            Self::NameAlreadyRegistered(_) => 7,
            Self::NoSuchName(_) => 8,
            Self::InvalidSignature(_) => 9,
            Self::ConnectionClosed => 10,
            Self::NotConnected(_) => 11,
            Self::TimedOut => 12,
            Self::Canceled => 13,
            Self::PromiseAlreadySettled => 14,
            Self::BrokenPromise => 15,
            Self::MalformedFrame(_) => 16,
            Self::Remote(_) => 17,
            Self::HandshakeFailed(_) => 18,
            Self::VersionMismatch { .. } => 19,
            Self::MessageTooLarge { .. } => 20,
            Self::Config(_) => 21,
            Self::Io(_) => 22,
            Self::DuplicateMember(_) => 23,
        }
    }

    /// Detail text sent next to [`Error::code`] in an error frame.
    pub fn wire_message(&self) -> String {
        match self {
            Self::TypeMismatch { expected, found } => format!("{expected}\u{0}{found}"),
            Self::SignatureMismatch(m)
            | Self::NoSuchAction(m)
            | Self::AmbiguousAction(m)
            | Self::NoSuchSignal(m)
            | Self::NoSuchProperty(m)
            | Self::NameAlreadyRegistered(m)
            | Self::DuplicateMember(m)
            | Self::NoSuchName(m)
            | Self::InvalidSignature(m)
            | Self::NotConnected(m)
            | Self::MalformedFrame(m)
            | Self::Remote(m)
            | Self::HandshakeFailed(m)
            | Self::Config(m) => m.clone(),
            other => other.to_string(),
        }
    }

    /// Rebuild an error received in an error frame.
    ///
    /// Unknown codes and kinds that only make sense locally (I/O, version
    /// mismatch, frame limits) come back as [`Error::Remote`].
    pub fn from_wire(code: u16, message: String) -> Self {
        match code {
            1 => {
                let (expected, found) = match message.split_once('\u{0}') {
                    Some((e, f)) => (e.to_string(), f.to_string()),
                    None => (message, String::new()),
                };
                Self::TypeMismatch { expected, found }
            }
            2 => Self::SignatureMismatch(message),
            3 => Self::NoSuchAction(message),
            4 => Self::AmbiguousAction(message),
            5 => Self::NoSuchSignal(message),
            6 => Self::NoSuchProperty(message),
            7 => Self::NameAlreadyRegistered(message),
            8 => Self::NoSuchName(message),
            9 => Self::InvalidSignature(message),
            10 => Self::ConnectionClosed,
            11 => Self::NotConnected(message),
            12 => Self::TimedOut,
            13 => Self::Canceled,
            14 => Self::PromiseAlreadySettled,
            15 => Self::BrokenPromise,
            16 => Self::MalformedFrame(message),
            18 => Self::HandshakeFailed(message),
            21 => Self::Config(message),
            23 => Self::DuplicateMember(message),
            _ => Self::Remote(message),
        }
    }
}

/// Alias for results carrying a tether [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_roundtrip_keeps_kind() {
        let errors = vec![
            Error::SignatureMismatch("expected (i), got (s)".into()),
            Error::NoSuchAction("ping".into()),
            Error::NoSuchName("PingPongService".into()),
            Error::DuplicateMember("level".into()),
            Error::type_mismatch("i", "s"),
            Error::TimedOut,
            Error::Canceled,
        ];
        for err in errors {
            let back = Error::from_wire(err.code(), err.wire_message());
            assert_eq!(back.code(), err.code(), "{err}");
            assert_eq!(back.to_string(), err.to_string());
        }
    }

    #[test]
    fn test_local_only_kinds_become_remote() {
        let io = Error::from(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        match Error::from_wire(io.code(), io.wire_message()) {
            Error::Remote(msg) => assert!(msg.contains("disk")),
            other => panic!("Expected Remote, got {other:?}"),
        }
    }
}
