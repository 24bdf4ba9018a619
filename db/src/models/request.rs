use std::collections::BTreeMap;

use bson::serde_helpers::chrono_datetime_as_bson_datetime;
use certa_common::{
    ids::{AuthorityId, RequestId, SerialNumber},
    types::{ExtValue, RequestStatus, RequestType, ResultCode, RevocationReason},
    views::{CertRequestInfo, CertReviewInfo},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::timestamp_now;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbRequest {
    #[serde(rename = "_id")]
    pub id: RequestId,

    /// Bumped on every successful update; used to detect concurrent writers.
    pub version: u64,

    pub request_type: RequestType,

    pub status: RequestStatus,

    pub result: ResultCode,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub authority_id: Option<AuthorityId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,

    /// Correlation id from the submitting system. Not carried over by clones.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,

    /// Who submitted the request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    /// Agent currently reviewing the request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,

    /// Last agent to act on the request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,

    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,

    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub modified_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub enrollment: Option<EnrollmentData>,

    /// Certificate a renewal, revocation or unrevocation acts on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_serial: Option<SerialNumber>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub revocation: Option<RevocationData>,

    /// Certificate produced or affected once the service ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_serial: Option<SerialNumber>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(default)]
    pub ext: BTreeMap<String, ExtValue>,
}

/// Everything needed to build a certificate from an enrollment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentData {
    /// PKCS#10 request in PEM format
    pub csr_pem: String,

    pub subject_dn: String,

    pub validity_days: u32,

    #[serde(default)]
    pub dns_names: Vec<String>,

    /// e.g. "rsa", "ec", "ed25519"
    pub key_algorithm: String,

    /// Key size in bits, when the algorithm has one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_size: Option<u32>,

    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevocationData {
    pub reason: RevocationReason,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalidity_date: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl DbRequest {
    /// A fresh request in BEGIN state.
    pub fn new(id: RequestId, request_type: RequestType) -> Self {
        let now = timestamp_now();
        Self {
            id,
            version: 0,
            request_type,
            status: RequestStatus::Begin,
            result: ResultCode::Pending,
            authority_id: None,
            profile_id: None,
            source_id: None,
            owner: None,
            assigned_to: None,
            agent: None,
            created_at: now,
            modified_at: now,
            enrollment: None,
            target_serial: None,
            revocation: None,
            cert_serial: None,
            error_message: None,
            ext: BTreeMap::new(),
        }
    }
}

impl From<DbRequest> for CertRequestInfo {
    fn from(value: DbRequest) -> Self {
        Self {
            request_id: value.id.to_string(),
            request_type: value.request_type,
            request_status: value.status,
            result: value.result.code(),
            error_message: value.error_message,
            cert_id: value.cert_serial.map(|s| s.to_string()),
            authority_id: value.authority_id.map(|a| a.to_string()),
            profile_id: value.profile_id,
            created_at: value.created_at,
            modified_at: value.modified_at,
        }
    }
}

impl From<DbRequest> for CertReviewInfo {
    fn from(value: DbRequest) -> Self {
        let version = value.version;
        let owner = value.owner.clone();
        let assigned_to = value.assigned_to.clone();
        let target_serial = value.target_serial.map(|s| s.to_string());
        let ext = value
            .ext
            .iter()
            .map(|(k, v)| (k.clone(), v.to_string()))
            .collect();
        let enrollment = value.enrollment.clone();

        Self {
            info: value.into(),
            version,
            owner,
            assigned_to,
            subject_dn: enrollment.as_ref().map(|e| e.subject_dn.clone()),
            validity_days: enrollment.as_ref().map(|e| e.validity_days),
            dns_names: enrollment
                .as_ref()
                .map(|e| e.dns_names.clone())
                .unwrap_or_default(),
            key_algorithm: enrollment.as_ref().map(|e| match e.key_size {
                Some(bits) => format!("{} {}", e.key_algorithm, bits),
                None => e.key_algorithm.clone(),
            }),
            csr_pem: enrollment.map(|e| e.csr_pem),
            target_serial,
            ext,
        }
    }
}
