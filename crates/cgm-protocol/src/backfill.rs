//! Backfill entries sent on the backfill characteristic
//!
//! Each notification carries exactly one historical reading:
//!
//! ```text
//! offset  size  field
//!      0     4  timestamp, seconds since pairing (LE)
//!      4     2  glucose word (LE), 0xFFFF = none,
//!               low 12 bits = mg/dL, high 4 bits != 0 = display only
//!      6     1  algorithm state
//!      7     1  reserved
//!      8     1  trend, signed tenths of mg/dL/min, 0x7F = none
//! ```

use bytes::{Buf, Bytes};
use serde::{Deserialize, Serialize};

use crate::algorithm::AlgorithmState;
use crate::error::{ProtocolError, Result};
use crate::glucose::hex_bytes;
use crate::trend::{decode_trend, GlucoseCondition, TrendType};

/// Exact length of a backfill frame
pub const BACKFILL_FRAME_LEN: usize = 9;

/// One historical reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillFrame {
    /// Seconds since pairing
    pub timestamp: u32,
    /// Glucose in mg/dL
    pub glucose: Option<u16>,
    /// Reading is for display only
    pub display_only: bool,
    /// Algorithm state at the time of the reading
    pub algorithm_state: AlgorithmState,
    /// Rate of change in mg/dL/min
    pub trend: Option<f64>,
    /// Frame as received
    #[serde(with = "hex_bytes")]
    pub data: Bytes,
}

impl BackfillFrame {
    /// Decode a backfill frame
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != BACKFILL_FRAME_LEN {
            return Err(ProtocolError::InvalidLength {
                expected: BACKFILL_FRAME_LEN,
                got: data.len(),
            });
        }

        let mut buf = data;
        let timestamp = buf.get_u32_le();
        let glucose_word = buf.get_u16_le();
        let algorithm_state = AlgorithmState::from_byte(buf.get_u8());
        buf.advance(1);
        let trend = decode_trend(buf.get_u8());

        let (glucose, display_only) = if glucose_word == 0xFFFF {
            (None, false)
        } else {
            (Some(glucose_word & 0x0FFF), glucose_word & 0xF000 != 0)
        };

        Ok(Self {
            timestamp,
            glucose,
            display_only,
            algorithm_state,
            trend,
            data: Bytes::copy_from_slice(data),
        })
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_fields() {
        // ts 0x00012345, glucose 0x0078 (120), state 6, reserved, trend -0.5
        let data = [0x45, 0x23, 0x01, 0x00, 0x78, 0x00, 0x06, 0x00, 0xFB];
        let frame = BackfillFrame::decode(&data).unwrap();
        assert_eq!(frame.timestamp, 0x0001_2345);
        assert_eq!(frame.glucose, Some(120));
        assert!(!frame.display_only);
        assert_eq!(frame.algorithm_state, AlgorithmState::Ok);
        assert!(frame.has_reliable_glucose());
        assert_eq!(frame.trend, Some(-0.5));
        assert_eq!(frame.trend_type(), Some(TrendType::Flat));
        assert_eq!(frame.data.as_ref(), &data[..]);
    }

    #[test]
    fn test_display_only_high_nibble() {
        let data = [0x10, 0x00, 0x00, 0x00, 0x2C, 0x11, 0x06, 0x00, 0x14];
        let frame = BackfillFrame::decode(&data).unwrap();
        assert_eq!(frame.glucose, Some(0x12C));
        assert!(frame.display_only);
        assert_eq!(frame.trend, Some(2.0));
    }

    #[test]
    fn test_glucose_sentinel() {
        let data = [0x10, 0x00, 0x00, 0x00, 0xFF, 0xFF, 0x02, 0x00, 0x7F];
        let frame = BackfillFrame::decode(&data).unwrap();
        assert_eq!(frame.glucose, None);
        assert!(!frame.display_only);
        assert_eq!(frame.trend, None);
        assert!(frame.algorithm_state.is_in_warmup());
        assert_eq!(frame.condition(), None);
    }

    #[test]
    fn test_rejects_other_lengths() {
        for len in [0, 1, 8, 10, 19] {
            let data = vec![0u8; len];
            assert_eq!(
                BackfillFrame::decode(&data),
                Err(ProtocolError::InvalidLength {
                    expected: 9,
                    got: len
                })
            );
        }
    }
}
