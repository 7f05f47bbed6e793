//! Status codes and error types.

use core::fmt;

use crate::wire::WireError;

/// Transaction status codes.
///
/// Values match the binder status space so they can be carried verbatim in
/// a reply frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum StatusCode {
    Ok = 0,
    UnknownError = i32::MIN,
    NoMemory = -12,
    InvalidOperation = -38,
    BadValue = -22,
    BadType = i32::MIN + 1,
    NameNotFound = -2,
    DeadObject = -32,
    FailedTransaction = i32::MIN + 2,
    UnknownTransaction = -74,
    WouldBlock = -11,
    UnexpectedNull = i32::MIN + 8,
}

impl StatusCode {
    /// Decode a wire value. Anything unrecognised is an [`StatusCode::UnknownError`].
    pub fn from_i32(value: i32) -> Self {
        match value {
            0 => Self::Ok,
            -12 => Self::NoMemory,
            -38 => Self::InvalidOperation,
            -22 => Self::BadValue,
            -2 => Self::NameNotFound,
            -32 => Self::DeadObject,
            -74 => Self::UnknownTransaction,
            -11 => Self::WouldBlock,
            v if v == i32::MIN + 1 => Self::BadType,
            v if v == i32::MIN + 2 => Self::FailedTransaction,
            v if v == i32::MIN + 8 => Self::UnexpectedNull,
            _ => Self::UnknownError,
        }
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::UnknownError => write!(f, "unknown error"),
            Self::NoMemory => write!(f, "no memory"),
            Self::InvalidOperation => write!(f, "invalid operation"),
            Self::BadValue => write!(f, "bad value"),
            Self::BadType => write!(f, "bad type"),
            Self::NameNotFound => write!(f, "name not found"),
            Self::DeadObject => write!(f, "dead object"),
            Self::FailedTransaction => write!(f, "failed transaction"),
            Self::UnknownTransaction => write!(f, "unknown transaction"),
            Self::WouldBlock => write!(f, "would block"),
            Self::UnexpectedNull => write!(f, "unexpected null"),
        }
    }
}

/// Error returned by every fallible protocol operation.
///
/// Compares equal to a [`StatusCode`] so call sites can write
/// `assert_eq!(err, StatusCode::DeadObject)`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}{}", .message.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
pub struct Status {
    code: StatusCode,
    message: Option<String>,
}

impl Status {
    pub fn new(code: StatusCode) -> Self {
        Self {
            code,
            message: None,
        }
    }

    pub fn with_message(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn dead_object() -> Self {
        Self::new(StatusCode::DeadObject)
    }
}

impl From<StatusCode> for Status {
    fn from(code: StatusCode) -> Self {
        Self::new(code)
    }
}

impl PartialEq<StatusCode> for Status {
    fn eq(&self, other: &StatusCode) -> bool {
        self.code == *other
    }
}

/// Errors raised by a connection while moving frames.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("malformed frame: {0}")]
    Wire(#[from] WireError),
    #[error("handshake rejected: {0}")]
    Rejected(StatusCode),
    #[error("handshake timed out")]
    HandshakeTimeout,
}

impl TransportError {
    /// True for errors that mean the peer is gone rather than misbehaving.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Closed => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

impl From<TransportError> for Status {
    fn from(e: TransportError) -> Self {
        let code = match &e {
            TransportError::Wire(_) => StatusCode::BadType,
            TransportError::FrameTooLarge { .. } => StatusCode::NoMemory,
            TransportError::Rejected(code) => *code,
            TransportError::Closed | TransportError::Io(_) | TransportError::HandshakeTimeout => {
                StatusCode::DeadObject
            }
        };
        Status::with_message(code, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values_round_trip() {
        for code in [
            StatusCode::Ok,
            StatusCode::UnknownError,
            StatusCode::NoMemory,
            StatusCode::InvalidOperation,
            StatusCode::BadValue,
            StatusCode::BadType,
            StatusCode::NameNotFound,
            StatusCode::DeadObject,
            StatusCode::FailedTransaction,
            StatusCode::UnknownTransaction,
            StatusCode::WouldBlock,
            StatusCode::UnexpectedNull,
        ] {
            assert_eq!(StatusCode::from_i32(code.as_i32()), code);
        }
    }

    #[test]
    fn unrecognised_values_are_unknown_errors() {
        assert_eq!(StatusCode::from_i32(12345), StatusCode::UnknownError);
        assert_eq!(StatusCode::from_i32(-1), StatusCode::UnknownError);
    }

    #[test]
    fn transport_errors_map_to_status() {
        let closed: Status = TransportError::Closed.into();
        assert_eq!(closed, StatusCode::DeadObject);

        let wire: Status = TransportError::Wire(WireError::UnknownCommand(99)).into();
        assert_eq!(wire, StatusCode::BadType);
    }

    #[test]
    fn status_display_includes_message() {
        let status = Status::with_message(StatusCode::BadValue, "negative length");
        assert_eq!(status.to_string(), "bad value: negative length");
        assert_eq!(Status::new(StatusCode::WouldBlock).to_string(), "would block");
    }
}
