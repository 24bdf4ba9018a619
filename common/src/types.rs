//! Wire enums for requests and certificates.
//!
//! The string and numeric forms here are what existing clients parse, so they
//! must not change.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    _ => Err(UnknownVariant { kind: $kind, value: s.to_string() }),
                }
            }
        }
    };
}

/// Where a request is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Freshly created, not yet submitted.
    Begin,
    /// Submitted and waiting for an agent decision.
    Pending,
    Approved,
    Rejected,
    Canceled,
    /// Approved, but the service has not finished yet (for example waiting on
    /// an external system).
    SvcPending,
    Complete,
}

string_enum!(RequestStatus, "request status", {
    Begin => "begin",
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
    Canceled => "canceled",
    SvcPending => "svc_pending",
    Complete => "complete",
});

impl RequestStatus {
    /// Whether no further transition can happen from this status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Canceled | Self::Complete)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    Enrollment,
    Renewal,
    Revocation,
    Unrevocation,
}

string_enum!(RequestType, "request type", {
    Enrollment => "enrollment",
    Renewal => "renewal",
    Revocation => "revocation",
    Unrevocation => "unrevocation",
});

/// Numeric outcome of a request. Clients treat anything `>= 5` as a failure
/// that comes with an error string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum ResultCode {
    Unauthorized = 1,
    Success = 2,
    Pending = 3,
    SvcPending = 4,
    Rejected = 5,
    Error = 6,
    Exception = 7,
}

impl ResultCode {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn is_failure(self) -> bool {
        self.code() >= 5
    }
}

impl From<ResultCode> for u8 {
    fn from(value: ResultCode) -> Self {
        value.code()
    }
}

impl TryFrom<u8> for ResultCode {
    type Error = UnknownVariant;

    fn try_from(value: u8) -> Result<Self, UnknownVariant> {
        Ok(match value {
            1 => Self::Unauthorized,
            2 => Self::Success,
            3 => Self::Pending,
            4 => Self::SvcPending,
            5 => Self::Rejected,
            6 => Self::Error,
            7 => Self::Exception,
            _ => {
                return Err(UnknownVariant {
                    kind: "result code",
                    value: value.to_string(),
                });
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum CertStatus {
    Valid,
    Revoked,
    Expired,
}

impl fmt::Display for CertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Valid => "VALID",
            Self::Revoked => "REVOKED",
            Self::Expired => "EXPIRED",
        })
    }
}

impl FromStr for CertStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "VALID" => Ok(Self::Valid),
            "REVOKED" => Ok(Self::Revoked),
            "EXPIRED" => Ok(Self::Expired),
            _ => Err(UnknownVariant {
                kind: "certificate status",
                value: s.to_string(),
            }),
        }
    }
}

/// RFC 5280 CRL reason codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    Unspecified,
    KeyCompromise,
    CaCompromise,
    AffiliationChanged,
    Superseded,
    CessationOfOperation,
    CertificateHold,
    RemoveFromCrl,
    PrivilegeWithdrawn,
    AaCompromise,
}

string_enum!(RevocationReason, "revocation reason", {
    Unspecified => "unspecified",
    KeyCompromise => "key_compromise",
    CaCompromise => "ca_compromise",
    AffiliationChanged => "affiliation_changed",
    Superseded => "superseded",
    CessationOfOperation => "cessation_of_operation",
    CertificateHold => "certificate_hold",
    RemoveFromCrl => "remove_from_crl",
    PrivilegeWithdrawn => "privilege_withdrawn",
    AaCompromise => "aa_compromise",
});

impl RevocationReason {
    pub fn code(self) -> u8 {
        match self {
            Self::Unspecified => 0,
            Self::KeyCompromise => 1,
            Self::CaCompromise => 2,
            Self::AffiliationChanged => 3,
            Self::Superseded => 4,
            Self::CessationOfOperation => 5,
            Self::CertificateHold => 6,
            Self::RemoveFromCrl => 8,
            Self::PrivilegeWithdrawn => 9,
            Self::AaCompromise => 10,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Unspecified,
            1 => Self::KeyCompromise,
            2 => Self::CaCompromise,
            3 => Self::AffiliationChanged,
            4 => Self::Superseded,
            5 => Self::CessationOfOperation,
            6 => Self::CertificateHold,
            8 => Self::RemoveFromCrl,
            9 => Self::PrivilegeWithdrawn,
            10 => Self::AaCompromise,
            _ => return None,
        })
    }
}

/// A value in a request's extension attribute map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ExtValue {
    String(String),
    Bytes(Vec<u8>),
    Int(i64),
}

impl fmt::Display for ExtValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Bytes(b) => {
                for byte in b {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
            Self::Int(i) => write!(f, "{i}"),
        }
    }
}

impl From<&str> for ExtValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for ExtValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for ExtValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<Vec<u8>> for ExtValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}
