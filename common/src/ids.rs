//! Identifiers handed out by the CA engine.
//!
//! Request ids and certificate serial numbers are both drawn from persisted
//! counters, so they are plain unsigned integers underneath. Their string
//! forms differ: request ids print in decimal, serial numbers in `0x` hex.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdParseError {
    #[error("Invalid request id: {0}")]
    RequestId(String),

    #[error("Invalid serial number: {0}")]
    SerialNumber(String),

    #[error("Invalid authority id: {0}")]
    AuthorityId(String),
}

/// Parse an unsigned integer written either in decimal or as `0x`-prefixed
/// hex.
fn parse_u64(s: &str) -> Option<u64> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

/// Identifier of a request in the queue. Unique per queue and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RequestId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_u64(s)
            .map(Self)
            .ok_or_else(|| IdParseError::RequestId(s.to_string()))
    }
}

impl From<u64> for RequestId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Certificate serial number, allocated per CA instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SerialNumber(u64);

impl SerialNumber {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// Minimal big-endian encoding, as used in the certificate itself.
    pub fn to_be_bytes(self) -> Vec<u8> {
        let bytes = self.0.to_be_bytes();
        let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len() - 1);
        bytes[first..].to_vec()
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl FromStr for SerialNumber {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_u64(s)
            .map(Self)
            .ok_or_else(|| IdParseError::SerialNumber(s.to_string()))
    }
}

impl From<u64> for SerialNumber {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Names a certificate authority instance, the host CA or a sub-CA.
///
/// Always serialized as the hyphenated string form, whatever the format, so
/// that stored records and query filters agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AuthorityId(Uuid);

impl AuthorityId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn inner(&self) -> &Uuid {
        &self.0
    }
}

impl Default for AuthorityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AuthorityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AuthorityId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| IdParseError::AuthorityId(s.to_string()))
    }
}

impl Serialize for AuthorityId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.0.hyphenated().to_string())
    }
}

impl<'de> Deserialize<'de> for AuthorityId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl From<Uuid> for AuthorityId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn serial_number_prints_as_hex() {
        assert_eq!(SerialNumber::new(255).to_string(), "0xff");
    }

    #[test]
    fn serial_number_parses_hex_and_decimal() {
        assert_eq!("0x1a".parse::<SerialNumber>(), Ok(SerialNumber::new(26)));
        assert_eq!("26".parse::<SerialNumber>(), Ok(SerialNumber::new(26)));
        assert!("zz".parse::<SerialNumber>().is_err());
    }

    #[test]
    fn serial_number_minimal_bytes() {
        assert_eq!(SerialNumber::new(0).to_be_bytes(), vec![0]);
        assert_eq!(SerialNumber::new(0x0102).to_be_bytes(), vec![1, 2]);
    }

    #[test]
    fn request_id_round_trips_through_string() {
        let id = RequestId::new(42);
        assert_eq!(id.to_string().parse::<RequestId>(), Ok(id));
    }

    #[test]
    fn authority_ids_are_ordered() {
        let a: AuthorityId = "00000000-0000-0000-0000-000000000001".parse().unwrap();
        let b: AuthorityId = "00000000-0000-0000-0000-000000000002".parse().unwrap();
        assert!(a < b);
    }
}
