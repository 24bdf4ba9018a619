use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::types::{CertStatus, RevocationReason};

/// Query parameters for the plain certificate listing.
#[derive(Debug, Clone, Default, Deserialize, Serialize, IntoParams, ToSchema)]
pub struct CertListParams {
    pub status: Option<CertStatus>,

    pub start: Option<usize>,

    pub size: Option<usize>,
}

/// Body for the certificate search endpoint. Every criterion that is set must
/// match.
#[derive(Debug, Clone, Default, Deserialize, Serialize, ToSchema)]
pub struct CertSearchParams {
    #[serde(default)]
    pub status: Option<CertStatus>,

    #[serde(default)]
    pub authority_id: Option<String>,

    /// Case-insensitive substring of the subject DN.
    #[serde(default)]
    pub subject_contains: Option<String>,

    #[serde(default)]
    pub issuer_dn: Option<String>,

    /// Lowest serial number to include (`0x` hex or decimal).
    #[serde(default)]
    pub serial_from: Option<String>,

    /// Highest serial number to include (`0x` hex or decimal).
    #[serde(default)]
    pub serial_to: Option<String>,

    #[serde(default)]
    pub revoked_by: Option<String>,

    #[serde(default)]
    pub revocation_reason: Option<RevocationReason>,

    #[serde(default)]
    pub issued_by: Option<String>,

    #[serde(default)]
    pub start: Option<usize>,

    #[serde(default)]
    pub size: Option<usize>,
}

/// Body for the revoke action.
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct RevocationParams {
    pub reason: RevocationReason,

    /// When the key is believed to have been compromised.
    #[serde(default)]
    pub invalidity_date: Option<DateTime<Utc>>,

    #[serde(default)]
    pub comment: Option<String>,
}
