//! Device-bound output reports
//!
//! Output payloads (rumble, LED) are opaque to the driver. The only rule is
//! that a payload fits the fixed report buffer.

use crate::error::{ProtocolError, Result};
use crate::report::REPORT_LEN;
use bytes::Bytes;

/// An opaque output report, at most [`REPORT_LEN`] bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputReport(Bytes);

impl OutputReport {
    pub fn new(payload: impl Into<Bytes>) -> Result<Self> {
        let payload = payload.into();
        if payload.len() > REPORT_LEN {
            return Err(ProtocolError::PayloadTooLarge {
                len: payload.len(),
                max: REPORT_LEN,
            });
        }
        Ok(Self(payload))
    }

    /// Parse a hex string such as `"00 08 00 ff ff"` or `"000800ffff"`
    pub fn from_hex(s: &str) -> Result<Self> {
        let digits: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        if !digits.is_ascii() || digits.len() % 2 != 0 {
            return Err(ProtocolError::InvalidHex(s.to_string()));
        }

        let bytes = (0..digits.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&digits[i..i + 2], 16))
            .collect::<std::result::Result<Vec<u8>, _>>()
            .map_err(|_| ProtocolError::InvalidHex(s.to_string()))?;

        Self::new(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for OutputReport {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
