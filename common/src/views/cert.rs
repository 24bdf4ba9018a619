use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::types::{CertStatus, RevocationReason};

/// Summary of a certificate record, as returned by listings and searches.
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct CertDataInfo {
    /// Serial number in `0x` hex.
    pub id: String,

    pub subject_dn: String,

    pub issuer_dn: String,

    pub status: CertStatus,

    pub authority_id: String,

    pub not_valid_before: DateTime<Utc>,

    pub not_valid_after: DateTime<Utc>,

    pub issued_on: DateTime<Utc>,

    pub issued_by: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_on: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_by: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub revocation_reason: Option<RevocationReason>,
}

/// A single certificate with its encodings.
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct CertData {
    #[serde(flatten)]
    pub info: CertDataInfo,

    /// The certificate in PEM format.
    pub encoded: String,

    /// Base64 DER of a certs-only PKCS#7 SignedData holding the certificate
    /// and its issuer chain.
    pub pkcs7_cert_chain: String,
}

/// Results of a bounded certificate search.
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct CertSearchResults {
    pub items: Vec<CertDataInfo>,

    /// Offset of the first item within all matches.
    pub start: usize,

    /// Number of certificates matching the query, including those not
    /// returned.
    pub total: u64,

    /// Set when matches beyond this page exist or the search stopped at its
    /// time limit.
    pub truncated: bool,
}
