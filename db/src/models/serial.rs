use certa_common::{ids::SerialNumber, views::SerialRangeView};
use serde::{Deserialize, Serialize};

/// Counter name for certificate serial numbers.
pub const CERT_COUNTER: &str = "certificates";

/// Counter name for request ids.
pub const REQUEST_COUNTER: &str = "requests";

/// A persisted counter range. `next` is the next number to hand out; the
/// range is exhausted once `next > end`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbSerialRange {
    #[serde(rename = "_id")]
    pub name: String,

    pub start: u64,

    /// Inclusive
    pub end: u64,

    pub next: u64,
}

impl DbSerialRange {
    pub fn new(name: &str, start: u64, end: u64) -> Self {
        Self {
            name: name.to_string(),
            start,
            end,
            next: start,
        }
    }

    pub fn remaining(&self) -> u64 {
        if self.next > self.end {
            0
        } else {
            self.end - self.next + 1
        }
    }
}

impl From<DbSerialRange> for SerialRangeView {
    fn from(value: DbSerialRange) -> Self {
        let remaining = value.remaining();
        Self {
            counter: value.name,
            start: SerialNumber::new(value.start).to_string(),
            end: SerialNumber::new(value.end).to_string(),
            next: SerialNumber::new(value.next).to_string(),
            remaining,
        }
    }
}
