//! Leading opcode byte of control and authentication frames

use serde::{Deserialize, Serialize};

/// Opcodes understood by the sensor protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Opcode {
    /// Authentication status response
    AuthChallengeRx = 0x05,
    /// Session stop request
    SessionStopTx = 0x28,
    /// Current glucose reading
    GlucoseTx = 0x4E,
    /// Extended firmware version
    ExtendedVersionTx = 0x52,
    /// End of a backfill transfer
    BackfillFinished = 0x59,
}

impl Opcode {
    /// Map a raw byte to a known opcode
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x05 => Some(Opcode::AuthChallengeRx),
            0x28 => Some(Opcode::SessionStopTx),
            0x4E => Some(Opcode::GlucoseTx),
            0x52 => Some(Opcode::ExtendedVersionTx),
            0x59 => Some(Opcode::BackfillFinished),
            _ => None,
        }
    }

    /// Opcode of a frame, read from its first byte
    pub fn of(frame: &[u8]) -> Option<Self> {
        frame.first().copied().and_then(Self::from_byte)
    }

    /// Raw byte value
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Opcode::AuthChallengeRx => "auth_challenge_rx",
            Opcode::SessionStopTx => "session_stop_tx",
            Opcode::GlucoseTx => "glucose_tx",
            Opcode::ExtendedVersionTx => "extended_version_tx",
            Opcode::BackfillFinished => "backfill_finished",
        };
        write!(f, "{} (0x{:02X})", name, self.as_byte())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_byte() {
        assert_eq!(Opcode::from_byte(0x4E), Some(Opcode::GlucoseTx));
        assert_eq!(Opcode::from_byte(0x59), Some(Opcode::BackfillFinished));
        assert_eq!(Opcode::from_byte(0x00), None);
    }

    #[test]
    fn test_of_empty_frame() {
        assert_eq!(Opcode::of(&[]), None);
        assert_eq!(Opcode::of(&[0x05, 0x01]), Some(Opcode::AuthChallengeRx));
    }

    #[test]
    fn test_display() {
        assert_eq!(Opcode::GlucoseTx.to_string(), "glucose_tx (0x4E)");
    }
}
