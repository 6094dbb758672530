//! Authentication status frame

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};
use crate::opcode::Opcode;

/// Minimum length of an authentication status frame
pub const AUTH_FRAME_MIN_LEN: usize = 3;

/// Authentication status reported by the sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResult {
    /// Sensor accepted the host
    pub authenticated: bool,
    /// Sensor is bonded with the host
    pub bonded: bool,
}

impl AuthResult {
    /// Decode `[0x05, authenticated, bonded, ..]`
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < AUTH_FRAME_MIN_LEN {
            return Err(ProtocolError::TooShort {
                minimum: AUTH_FRAME_MIN_LEN,
                got: data.len(),
            });
        }
        if data[0] != Opcode::AuthChallengeRx.as_byte() {
            return Err(ProtocolError::UnexpectedOpcode {
                expected: Opcode::AuthChallengeRx.as_byte(),
                got: data[0],
            });
        }

        Ok(Self {
            authenticated: data[1] == 0x01,
            bonded: data[2] == 0x01,
        })
    }

    /// Both authenticated and bonded
    pub fn is_ready(&self) -> bool {
        self.authenticated && self.bonded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_bonded() {
        let result = AuthResult::decode(&[0x05, 0x01, 0x01]).unwrap();
        assert!(result.authenticated);
        assert!(result.bonded);
        assert!(result.is_ready());
    }

    #[test]
    fn test_decode_not_bonded() {
        let result = AuthResult::decode(&[0x05, 0x01, 0x02, 0x00]).unwrap();
        assert!(result.authenticated);
        assert!(!result.bonded);
        assert!(!result.is_ready());
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(AuthResult::decode(&[0x05, 0x01]).is_err());
        assert!(matches!(
            AuthResult::decode(&[0x4E, 0x01, 0x01]),
            Err(ProtocolError::UnexpectedOpcode { got: 0x4E, .. })
        ));
    }
}
