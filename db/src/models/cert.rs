use bson::serde_helpers::chrono_datetime_as_bson_datetime;
use certa_common::{
    ids::{AuthorityId, RequestId, SerialNumber},
    types::{CertStatus, RevocationReason},
    views::CertDataInfo,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An issued certificate. Never deleted; revocation and unrevocation are the
/// only mutations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbCertRecord {
    #[serde(rename = "_id")]
    pub serial: SerialNumber,

    pub version: u64,

    pub authority_id: AuthorityId,

    pub issuer_dn: String,

    pub subject_dn: String,

    /// Certificate in PEM format
    pub cert_pem: String,

    /// Stored status, either VALID or REVOKED. Expiry is derived on read, see
    /// [`DbCertRecord::effective_status`].
    pub status: CertStatus,

    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub not_before: DateTime<Utc>,

    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub not_after: DateTime<Utc>,

    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub issued_on: DateTime<Utc>,

    pub issued_by: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,

    /// Authority key identifier of the certificate, lowercase hex
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authority_key_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub revocation: Option<RevocationInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevocationInfo {
    pub reason: RevocationReason,

    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub revoked_on: DateTime<Utc>,

    pub revoked_by: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalidity_date: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl DbCertRecord {
    /// Status as clients see it: a valid certificate past `not_after` is
    /// expired.
    pub fn effective_status(&self, now: DateTime<Utc>) -> CertStatus {
        match self.status {
            CertStatus::Valid if self.not_after < now => CertStatus::Expired,
            status => status,
        }
    }
}

impl From<DbCertRecord> for CertDataInfo {
    fn from(value: DbCertRecord) -> Self {
        let status = value.effective_status(Utc::now());
        Self {
            id: value.serial.to_string(),
            subject_dn: value.subject_dn,
            issuer_dn: value.issuer_dn,
            status,
            authority_id: value.authority_id.to_string(),
            not_valid_before: value.not_before,
            not_valid_after: value.not_after,
            issued_on: value.issued_on,
            issued_by: value.issued_by,
            request_id: value.request_id.map(|r| r.to_string()),
            revoked_on: value.revocation.as_ref().map(|r| r.revoked_on),
            revoked_by: value.revocation.as_ref().map(|r| r.revoked_by.clone()),
            revocation_reason: value.revocation.as_ref().map(|r| r.reason),
        }
    }
}
