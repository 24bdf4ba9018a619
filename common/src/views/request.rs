use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::types::{RequestStatus, RequestType};

/// What a requester sees about their request.
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct CertRequestInfo {
    pub request_id: String,

    pub request_type: RequestType,

    pub request_status: RequestStatus,

    /// Numeric result code. Values of 5 and above are failures and come with
    /// `error_message`.
    pub result: u8,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Serial of the issued or affected certificate, once known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub authority_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,

    pub created_at: DateTime<Utc>,

    pub modified_at: DateTime<Utc>,
}

/// What an agent sees when reviewing a request.
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct CertReviewInfo {
    #[serde(flatten)]
    pub info: CertRequestInfo,

    /// Stored version, changes on every update.
    pub version: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_dn: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub validity_days: Option<u32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_names: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_algorithm: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub csr_pem: Option<String>,

    /// Serial the request acts on, for revocation and renewal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_serial: Option<String>,

    /// Extension attributes rendered as strings.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ext: BTreeMap<String, String>,
}
