use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Request body for creating a sub-CA.
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct CreateAuthorityParams {
    /// Parent authority. The host authority when absent.
    #[serde(default)]
    pub parent_id: Option<String>,

    /// Subject DN of the new authority, e.g. `CN=Sub CA,O=Example`.
    pub dn: String,

    #[serde(default)]
    pub description: Option<String>,
}

/// Request body for resetting a serial number range.
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct SerialRangeParams {
    /// First number of the range (`0x` hex or decimal).
    pub start: String,

    /// Last number of the range, inclusive (`0x` hex or decimal).
    pub end: String,
}
