use bson::serde_helpers::chrono_datetime_as_bson_datetime;
use certa_common::{ids::AuthorityId, views::AuthorityData};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbAuthority {
    #[serde(rename = "_id")]
    pub id: AuthorityId,

    /// None only for the host authority
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<AuthorityId>,

    pub dn: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub enabled: bool,

    pub is_host: bool,

    /// CA certificate in PEM format
    pub cert_pem: String,

    /// Subject key identifier of the CA certificate, lowercase hex
    pub subject_key_id: String,

    /// Name of the signing key inside the token
    pub key_ref: String,

    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
}

impl From<DbAuthority> for AuthorityData {
    fn from(value: DbAuthority) -> Self {
        Self {
            id: value.id.to_string(),
            parent_id: value.parent_id.map(|p| p.to_string()),
            dn: value.dn,
            description: value.description,
            enabled: value.enabled,
            is_host_authority: value.is_host,
            subject_key_id: value.subject_key_id,
            cert_pem: value.cert_pem,
            created_at: value.created_at,
        }
    }
}
