//! Error types for frame decoding

use thiserror::Error;

/// Errors produced while decoding sensor frames
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame has a fixed size and the input did not match it
    #[error("Invalid frame length: expected {expected} bytes, got {got}")]
    InvalidLength {
        /// Required length
        expected: usize,
        /// Received length
        got: usize,
    },

    /// Frame is shorter than the smallest valid layout
    #[error("Frame too short: need at least {minimum} bytes, got {got}")]
    TooShort {
        /// Minimum length
        minimum: usize,
        /// Received length
        got: usize,
    },

    /// Leading opcode byte does not belong to the expected message
    #[error("Unexpected opcode: expected 0x{expected:02X}, got 0x{got:02X}")]
    UnexpectedOpcode {
        /// Opcode the decoder handles
        expected: u8,
        /// Opcode found in the frame
        got: u8,
    },

    /// Frame layout is valid but a field carries an unusable value
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),
}

impl ProtocolError {
    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            ProtocolError::InvalidLength { .. } => "INVALID_LENGTH",
            ProtocolError::TooShort { .. } => "TOO_SHORT",
            ProtocolError::UnexpectedOpcode { .. } => "UNEXPECTED_OPCODE",
            ProtocolError::MalformedFrame(_) => "MALFORMED_FRAME",
        }
    }
}

/// Result type alias for frame decoding
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = ProtocolError::InvalidLength {
            expected: 9,
            got: 8,
        };
        assert_eq!(err.error_code(), "INVALID_LENGTH");
        assert!(err.to_string().contains('9'));
    }

    #[test]
    fn test_opcode_display_is_hex() {
        let err = ProtocolError::UnexpectedOpcode {
            expected: 0x4E,
            got: 0x05,
        };
        assert_eq!(
            err.to_string(),
            "Unexpected opcode: expected 0x4E, got 0x05"
        );
    }
}
