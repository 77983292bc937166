//! Session-level error type shared by client and server.

use crate::protocol::ResponseCode;
use crate::wire::{FrameDecodeError, FrameEncodeError};

#[derive(Debug, thiserror::Error)]
pub enum ObexError {
    /// Length field inconsistent with the buffer, or a short fixed prefix.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("unexpected response code {got} (expected {expected})")]
    UnexpectedResponseCode {
        expected: &'static str,
        got: ResponseCode,
    },
    #[error("connection closed")]
    ConnectionClosed,
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("cancelled")]
    Cancelled,
    /// Value variant does not match the header ID's wire encoding.
    #[error("invalid value for header 0x{id:02X}")]
    InvalidHeader { id: u8 },
    #[error("cannot {action} while {from}")]
    InvalidState {
        from: &'static str,
        action: &'static str,
    },
    #[error("frame too large")]
    FrameTooLarge,
    #[error("io error: {0}")]
    Io(std::io::Error),
}

impl ObexError {
    /// Errors after which the byte stream can no longer be trusted.
    pub fn is_fatal_for_session(&self) -> bool {
        matches!(
            self,
            ObexError::ConnectionClosed | ObexError::Cancelled | ObexError::Io(_)
        )
    }
}

impl From<std::io::Error> for ObexError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected => ObexError::ConnectionClosed,
            _ => ObexError::Io(e),
        }
    }
}

impl From<FrameDecodeError> for ObexError {
    fn from(e: FrameDecodeError) -> Self {
        ObexError::MalformedFrame(e.to_string())
    }
}

impl From<FrameEncodeError> for ObexError {
    fn from(_: FrameEncodeError) -> Self {
        ObexError::FrameTooLarge
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eof_maps_to_connection_closed() {
        let e: ObexError = std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into();
        assert!(matches!(e, ObexError::ConnectionClosed));
        assert!(e.is_fatal_for_session());
    }

    #[test]
    fn other_io_kept() {
        let e: ObexError = std::io::Error::from(std::io::ErrorKind::PermissionDenied).into();
        assert!(matches!(e, ObexError::Io(_)));
    }

    #[test]
    fn protocol_errors_are_not_session_fatal() {
        let e = ObexError::UnexpectedResponseCode {
            expected: "0x90 or 0xA0",
            got: ResponseCode::NOT_FOUND,
        };
        assert!(!e.is_fatal_for_session());
        assert_eq!(
            e.to_string(),
            "unexpected response code 0xC4 (expected 0x90 or 0xA0)"
        );
    }
}
