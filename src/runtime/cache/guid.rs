//! Globally unique resource identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 128-bit resource identity, stable across runs.
///
/// Formatted as `xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx` (lower-case hex).
/// Zero is reserved as the nil value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Guid(u128);

impl Guid {
    pub const NIL: Guid = Guid(0);

    #[inline]
    pub const fn from_u128(value: u128) -> Self {
        Self(value)
    }

    #[inline]
    pub const fn as_u128(self) -> u128 {
        self.0
    }

    /// Random, non-nil GUID.
    pub fn generate() -> Self {
        loop {
            let value: u128 = rand::random();
            if value != 0 {
                return Self(value);
            }
        }
    }

    /// Deterministic GUID derived from a name (e.g. an asset path).
    ///
    /// Uses 128-bit FNV-1a; the same name always maps to the same GUID.
    pub fn from_name(name: &str) -> Self {
        const FNV_OFFSET: u128 = 0x6c62272e07bb014262b821756295c58d;
        const FNV_PRIME: u128 = 0x0000000001000000000000000000013b;

        let mut hash = FNV_OFFSET;
        for &byte in name.as_bytes() {
            hash ^= byte as u128;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        Self(hash.max(1))
    }

    #[inline]
    pub const fn is_nil(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Guid {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let v = self.0;
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
            (v >> 96) as u32,
            (v >> 80) as u16,
            (v >> 64) as u16,
            (v >> 48) as u16,
            v & 0xffff_ffff_ffff
        )
    }
}

/// GUID text was malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid GUID '{0}': expected 32 hex digits")]
pub struct GuidParseError(pub String);

impl FromStr for Guid {
    type Err = GuidParseError;

    /// Accepts hyphenated or plain hex, optionally wrapped in braces.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches('{').trim_end_matches('}');
        let digits: String = trimmed.chars().filter(|&c| c != '-').collect();
        if digits.len() != 32 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(GuidParseError(s.to_string()));
        }
        u128::from_str_radix(&digits, 16)
            .map(Self)
            .map_err(|_| GuidParseError(s.to_string()))
    }
}

impl From<Guid> for String {
    fn from(guid: Guid) -> Self {
        guid.to_string()
    }
}

impl TryFrom<String> for Guid {
    type Error = GuidParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
