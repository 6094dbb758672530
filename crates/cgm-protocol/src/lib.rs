//! Frame codec for Dexcom G7 continuous glucose monitors
//!
//! The sensor speaks a small set of fixed-layout binary frames over BLE
//! notifications. This crate decodes them into typed readings and nothing
//! more: no I/O, no async, no state.
//!
//! # Frames
//!
//! | Frame | Characteristic | Layout |
//! |-------|----------------|--------|
//! | [`AuthResult`] | authentication | `05 <authenticated> <bonded>` |
//! | [`GlucoseFrame`] | control | opcode `0x4E`, 19 bytes |
//! | [`BackfillFrame`] | backfill | exactly 9 bytes, no opcode |
//!
//! All multi-byte integers are little-endian. Glucose words use `0xFFFF`
//! for "no value" and trend bytes use `0x7F`.
//!
//! # Example
//!
//! ```rust
//! use cgm_protocol::{GlucoseFrame, Opcode, TrendType};
//!
//! let data = [
//!     0x4e, 0x00, 0xa8, 0x9c, 0x00, 0x00, 0x88, 0x00, 0x00, 0x01,
//!     0x04, 0x00, 0x8d, 0x00, 0x06, 0x03, 0x8a, 0x00, 0x0f,
//! ];
//! assert_eq!(Opcode::of(&data), Some(Opcode::GlucoseTx));
//!
//! let frame = GlucoseFrame::decode(&data).unwrap();
//! assert_eq!(frame.glucose, Some(141));
//! assert_eq!(frame.glucose_timestamp(), 40100);
//! assert_eq!(frame.trend_type(), Some(TrendType::Flat));
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod algorithm;
pub mod auth;
pub mod backfill;
pub mod error;
pub mod glucose;
pub mod opcode;
pub mod trend;

pub use algorithm::{AlgorithmFlags, AlgorithmState};
pub use auth::{AuthResult, AUTH_FRAME_MIN_LEN};
pub use backfill::{BackfillFrame, BACKFILL_FRAME_LEN};
pub use error::{ProtocolError, Result};
pub use glucose::{GlucoseFrame, GLUCOSE_FRAME_MIN_LEN};
pub use opcode::Opcode;
pub use trend::{GlucoseCondition, TrendType, GLUCOSE_RANGE_CEILING, GLUCOSE_RANGE_FLOOR};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(BACKFILL_FRAME_LEN, 9);
        assert_eq!(GLUCOSE_FRAME_MIN_LEN, 19);
        assert_eq!(GLUCOSE_RANGE_FLOOR, 40);
        assert_eq!(GLUCOSE_RANGE_CEILING, 400);
    }
}
