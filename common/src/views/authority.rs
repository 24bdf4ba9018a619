use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// A certificate authority, the host CA or one of its sub-CAs.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AuthorityData {
    pub id: String,

    /// Absent for the host authority.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    pub dn: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub enabled: bool,

    pub is_host_authority: bool,

    /// Subject key identifier in lowercase hex.
    pub subject_key_id: String,

    /// CA certificate in PEM format.
    pub cert_pem: String,

    pub created_at: DateTime<Utc>,
}

/// A persisted serial number range.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SerialRangeView {
    /// Counter name, `certificates` or `requests`.
    pub counter: String,

    /// First number of the range in `0x` hex.
    pub start: String,

    /// Last number of the range in `0x` hex, inclusive.
    pub end: String,

    /// Next number that will be handed out, in `0x` hex.
    pub next: String,

    /// How many numbers are left before the range is exhausted.
    pub remaining: u64,
}
