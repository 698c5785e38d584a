use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Size in bytes of an `EFI_GUID` as stored in a module image.
pub const GUID_LEN: usize = 16;

/// A 16-byte GUID in its in-memory (mixed-endian) layout.
///
/// The first three fields are little-endian (`u32`, `u16`, `u16`) and the
/// trailing eight bytes are kept in order, matching `EFI_GUID`. Equality is
/// byte-for-byte over all sixteen bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GuidValue([u8; GUID_LEN]);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GuidParseError {
    #[error("expected 16 bytes, got {0}")]
    Length(usize),
    #[error("malformed GUID string '{0}'")]
    Format(String),
}

impl GuidValue {
    pub const fn from_bytes(bytes: [u8; GUID_LEN]) -> Self {
        Self(bytes)
    }

    /// Assemble a GUID from a raw slice read out of a module.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, GuidParseError> {
        let raw: [u8; GUID_LEN] =
            bytes.try_into().map_err(|_| GuidParseError::Length(bytes.len()))?;
        Ok(Self(raw))
    }

    pub fn from_fields(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        let mut raw = [0u8; GUID_LEN];
        raw[0..4].copy_from_slice(&data1.to_le_bytes());
        raw[4..6].copy_from_slice(&data2.to_le_bytes());
        raw[6..8].copy_from_slice(&data3.to_le_bytes());
        raw[8..16].copy_from_slice(&data4);
        Self(raw)
    }

    pub fn as_bytes(&self) -> &[u8; GUID_LEN] {
        &self.0
    }

    pub fn data1(&self) -> u32 {
        u32::from_le_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    pub fn data2(&self) -> u16 {
        u16::from_le_bytes([self.0[4], self.0[5]])
    }

    pub fn data3(&self) -> u16 {
        u16::from_le_bytes([self.0[6], self.0[7]])
    }

    pub fn data4(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out.copy_from_slice(&self.0[8..16]);
        out
    }
}

/// Count distinct byte values in `bytes`.
pub fn distinct_byte_count(bytes: &[u8]) -> usize {
    bytes.iter().collect::<HashSet<_>>().len()
}

/// Heuristic acceptance test for a candidate GUID region: the number of
/// distinct byte values must strictly exceed `threshold`.
pub fn looks_like_guid(bytes: &[u8], threshold: usize) -> bool {
    bytes.len() == GUID_LEN && distinct_byte_count(bytes) > threshold
}

impl fmt::Display for GuidValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d4 = self.data4();
        write!(
            f,
            "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
            self.data1(),
            self.data2(),
            self.data3(),
            d4[0],
            d4[1],
            d4[2],
            d4[3],
            d4[4],
            d4[5],
            d4[6],
            d4[7]
        )
    }
}

impl FromStr for GuidValue {
    type Err = GuidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches('{').trim_end_matches('}');
        let parts: Vec<&str> = trimmed.split('-').collect();
        let widths = [8usize, 4, 4, 4, 12];
        if parts.len() != widths.len()
            || parts.iter().zip(widths).any(|(p, w)| p.len() != w)
            || !parts.iter().all(|p| p.chars().all(|c| c.is_ascii_hexdigit()))
        {
            return Err(GuidParseError::Format(s.to_string()));
        }
        let bad = || GuidParseError::Format(s.to_string());
        let data1 = u32::from_str_radix(parts[0], 16).map_err(|_| bad())?;
        let data2 = u16::from_str_radix(parts[1], 16).map_err(|_| bad())?;
        let data3 = u16::from_str_radix(parts[2], 16).map_err(|_| bad())?;
        let tail = format!("{}{}", parts[3], parts[4]);
        let mut data4 = [0u8; 8];
        for (idx, byte) in data4.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&tail[idx * 2..idx * 2 + 2], 16).map_err(|_| bad())?;
        }
        Ok(Self::from_fields(data1, data2, data3, data4))
    }
}

impl Serialize for GuidValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GuidValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
