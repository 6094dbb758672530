//! Glucose frame sent on the control characteristic
//!
//! ```text
//! offset  size  field
//!      0     1  opcode (0x4E)
//!      1     1  status (0 = ok)
//!      2     4  message timestamp, seconds since pairing (LE)
//!      6     2  sequence number (LE)
//!      8     2  reserved
//!     10     1  age of the reading in seconds
//!     11     1  reserved
//!     12     2  glucose word (LE), 0xFFFF = none, low 12 bits = mg/dL
//!     14     1  algorithm state
//!     15     1  trend, signed tenths of mg/dL/min, 0x7F = none
//!     16     2  predicted glucose (LE), same encoding as glucose
//!     18     1  flags, bit 0x10 = display only
//! ```

use bytes::{Buf, Bytes};
use serde::{Deserialize, Serialize};

use crate::algorithm::AlgorithmState;
use crate::error::{ProtocolError, Result};
use crate::opcode::Opcode;
use crate::trend::{decode_trend, GlucoseCondition, TrendType};

/// Minimum length of a glucose frame
pub const GLUCOSE_FRAME_MIN_LEN: usize = 19;

const GLUCOSE_SENTINEL: u16 = 0xFFFF;
const GLUCOSE_MASK: u16 = 0x0FFF;
const DISPLAY_ONLY_FLAG: u8 = 0x10;

/// Decoded glucose reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlucoseFrame {
    /// Timestamp of the message itself, seconds since pairing
    pub message_timestamp: u32,
    /// Sequence number
    pub sequence: u16,
    /// Seconds between the measurement and the message
    pub age: u8,
    /// Glucose in mg/dL
    pub glucose: Option<u16>,
    /// Reading is for display only and must not drive treatment
    pub display_only: bool,
    /// Algorithm state at the time of the reading
    pub algorithm_state: AlgorithmState,
    /// Rate of change in mg/dL/min
    pub trend: Option<f64>,
    /// Predicted glucose in mg/dL
    pub predicted_glucose: Option<u16>,
    /// Frame as received
    #[serde(with = "hex_bytes")]
    pub data: Bytes,
}

impl GlucoseFrame {
    /// Decode a glucose frame
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < GLUCOSE_FRAME_MIN_LEN {
            return Err(ProtocolError::TooShort {
                minimum: GLUCOSE_FRAME_MIN_LEN,
                got: data.len(),
            });
        }
        if data[0] != Opcode::GlucoseTx.as_byte() {
            return Err(ProtocolError::UnexpectedOpcode {
                expected: Opcode::GlucoseTx.as_byte(),
                got: data[0],
            });
        }
        if data[1] != 0 {
            return Err(ProtocolError::MalformedFrame(format!(
                "glucose status 0x{:02X}",
                data[1]
            )));
        }

        let mut buf = &data[2..];
        let message_timestamp = buf.get_u32_le();
        let sequence = buf.get_u16_le();
        buf.advance(2);
        let age = buf.get_u8();
        buf.advance(1);
        let glucose_word = buf.get_u16_le();
        let algorithm_state = AlgorithmState::from_byte(buf.get_u8());
        let trend = decode_trend(buf.get_u8());
        let predicted_word = buf.get_u16_le();
        let flags = buf.get_u8();

        let (glucose, display_only) = if glucose_word == GLUCOSE_SENTINEL {
            (None, false)
        } else {
            (
                Some(glucose_word & GLUCOSE_MASK),
                flags & DISPLAY_ONLY_FLAG != 0,
            )
        };
        let predicted_glucose =
            (predicted_word != GLUCOSE_SENTINEL).then_some(predicted_word & GLUCOSE_MASK);

        Ok(Self {
            message_timestamp,
            sequence,
            age,
            glucose,
            display_only,
            algorithm_state,
            trend,
            predicted_glucose,
            data: Bytes::copy_from_slice(data),
        })
    }

    /// Time of the measurement, seconds since pairing
    pub fn glucose_timestamp(&self) -> u32 {
        self.message_timestamp.saturating_sub(u32::from(self.age))
    }

    /// Reading may be used for treatment decisions
    pub fn has_reliable_glucose(&self) -> bool {
        self.algorithm_state.has_reliable_glucose()
    }

    /// Trend arrow for the reading
    pub fn trend_type(&self) -> Option<TrendType> {
        self.trend.map(TrendType::from_rate)
    }

    /// Out-of-range condition for the reading
    pub fn condition(&self) -> Option<GlucoseCondition> {
        self.glucose.and_then(GlucoseCondition::for_glucose)
    }
}

impl std::fmt::Display for GlucoseFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "GlucoseFrame(glucose: {:?}, ts: {}, seq: {}, state: {}, trend: {:?}, display_only: {})",
            self.glucose,
            self.glucose_timestamp(),
            self.sequence,
            self.algorithm_state,
            self.trend,
            self.display_only
        )
    }
}

pub(crate) mod hex_bytes {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(data))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(hex_str: &str) -> GlucoseFrame {
        GlucoseFrame::decode(&hex::decode(hex_str).unwrap()).unwrap()
    }

    #[test]
    fn test_decode_reading() {
        let message = frame("4e00c35501002601000106008a00060187000f");
        assert_eq!(message.glucose, Some(138));
        assert_eq!(message.glucose_timestamp(), 87485);
        assert!(!message.display_only);
        assert!(message.has_reliable_glucose());
    }

    #[test]
    fn test_decode_display_only() {
        let message = frame("4e000ec10d00c00b00010000680006fe63001f");
        assert_eq!(message.glucose, Some(104));
        assert_eq!(message.glucose_timestamp(), 901390);
        assert!(message.display_only);
    }

    #[test]
    fn test_decode_all_fields() {
        let message = frame("4e00a89c00008800000104008d0006038a000f");
        assert_eq!(message.glucose, Some(141));
        assert_eq!(message.message_timestamp, 40104);
        assert_eq!(message.glucose_timestamp(), 40100);
        assert_eq!(message.sequence, 136);
        assert_eq!(message.age, 4);
        assert_eq!(message.predicted_glucose, Some(138));
        assert_eq!(message.trend, Some(0.3));
        assert_eq!(message.trend_type(), Some(TrendType::Flat));
        assert_eq!(message.algorithm_state, AlgorithmState::Ok);
        assert_eq!(message.condition(), None);
    }

    #[test]
    fn test_negative_and_missing_trend() {
        let message = frame("4e00c6cc0d00ca0b00010500610006fe5b000f");
        assert_eq!(message.trend, Some(-0.2));

        let message = frame("4e00c6cc0d00ca0b000105006100067f5b000f");
        assert_eq!(message.trend, None);
        assert_eq!(message.trend_type(), None);
    }

    #[test]
    fn test_session_lifecycle_states() {
        let stopped = frame("4e00b6000000010000006600ffff017fffff00");
        assert_eq!(stopped.glucose, None);
        assert_eq!(stopped.predicted_glucose, None);
        assert_eq!(stopped.algorithm_state, AlgorithmState::Stopped);
        assert_eq!(stopped.sequence, 1);
        assert_eq!(stopped.glucose_timestamp(), 80);
        assert!(!stopped.display_only);

        let warmup = frame("4e00cd000000030000010500ffff027fffff01");
        assert_eq!(warmup.algorithm_state, AlgorithmState::Warmup);
        assert!(warmup.algorithm_state.is_in_warmup());

        let expired = frame("4e004d440e00d40b0001d46b650018036a000e");
        assert_eq!(expired.algorithm_state, AlgorithmState::Expired);
        assert_eq!(expired.sequence, 3028);
        assert_eq!(expired.glucose_timestamp(), 934777);
    }

    #[test]
    fn test_sentinel_ignores_display_flag() {
        // glucose word 0xFFFF with the display-only bit set in the flags byte
        let message = frame("4e00b6000000010000006600ffff017fffff10");
        assert_eq!(message.glucose, None);
        assert!(!message.display_only);
    }

    #[test]
    fn test_rejects_short_frame() {
        let data = hex::decode("4e00c35501002601000106008a0006018700").unwrap();
        assert_eq!(
            GlucoseFrame::decode(&data),
            Err(ProtocolError::TooShort {
                minimum: 19,
                got: 18
            })
        );
    }

    #[test]
    fn test_rejects_wrong_opcode_and_status() {
        let mut data = hex::decode("4e00c35501002601000106008a00060187000f").unwrap();
        data[1] = 0x01;
        assert!(matches!(
            GlucoseFrame::decode(&data),
            Err(ProtocolError::MalformedFrame(_))
        ));
        data[0] = 0x59;
        assert!(matches!(
            GlucoseFrame::decode(&data),
            Err(ProtocolError::UnexpectedOpcode { got: 0x59, .. })
        ));
    }

    #[test]
    fn test_serializes_raw_bytes_as_hex() {
        let message = frame("4e00a89c00008800000104008d0006038a000f");
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["data"], "4e00a89c00008800000104008d0006038a000f");
        let back: GlucoseFrame = serde_json::from_value(json).unwrap();
        assert_eq!(back, message);
    }
}
