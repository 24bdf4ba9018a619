use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::types::{ExtValue, RequestStatus, RequestType};

/// Request body for a certificate enrollment.
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct EnrollmentParams {
    /// Profile the certificate is issued under, e.g. `caServerCert`.
    pub profile_id: String,

    /// Authority to issue from. The host authority when absent.
    #[serde(default)]
    pub authority_id: Option<String>,

    /// PKCS#10 certificate signing request in PEM format.
    pub csr_pem: String,

    /// Subject DN to issue to, in `CN=...,O=...` form. Taken from the CSR
    /// when absent.
    #[serde(default)]
    pub subject_dn: Option<String>,

    /// Requested validity in days. The profile default when absent.
    #[serde(default)]
    pub validity_days: Option<u32>,

    /// DNS subject alternative names.
    #[serde(default)]
    pub dns_names: Vec<String>,

    /// Free-form profile inputs, kept on the request for review.
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
}

/// Request body for renewing an existing certificate with the same key.
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct RenewalParams {
    /// Serial number of the certificate to renew (`0x` hex or decimal).
    pub serial: String,
}

/// Query parameters for the agent request queue listing.
#[derive(Debug, Clone, Default, Deserialize, Serialize, IntoParams, ToSchema)]
pub struct RequestSearchParams {
    pub status: Option<RequestStatus>,

    pub request_type: Option<RequestType>,

    pub authority_id: Option<String>,

    /// Only requests assigned to this agent.
    pub assigned_to: Option<String>,

    pub start: Option<usize>,

    pub size: Option<usize>,
}

/// Body for reject and cancel actions.
#[derive(Debug, Clone, Default, Deserialize, Serialize, ToSchema)]
pub struct ReviewParams {
    /// Reason shown to the requester.
    #[serde(default)]
    pub reason: Option<String>,
}

/// Agent edits to a pending enrollment before it is approved.
#[derive(Debug, Clone, Default, Deserialize, Serialize, ToSchema)]
pub struct UpdateRequestParams {
    #[serde(default)]
    pub subject_dn: Option<String>,

    #[serde(default)]
    pub validity_days: Option<u32>,

    #[serde(default)]
    pub dns_names: Option<Vec<String>>,

    /// Extension attributes to set.
    #[serde(default)]
    pub ext: BTreeMap<String, ExtValue>,

    /// Extension attributes to remove.
    #[serde(default)]
    pub remove_ext: Vec<String>,
}

impl UpdateRequestParams {
    pub fn is_empty(&self) -> bool {
        self.subject_dn.is_none()
            && self.validity_days.is_none()
            && self.dns_names.is_none()
            && self.ext.is_empty()
            && self.remove_ext.is_empty()
    }
}

/// Result reported for a request whose service is still pending.
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct CompletionParams {
    pub success: bool,

    /// Shown on the request when `success` is false.
    #[serde(default)]
    pub error_message: Option<String>,
}
