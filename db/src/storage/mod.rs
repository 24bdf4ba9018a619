use std::fmt::Debug;

use async_trait::async_trait;
use certa_common::{
    ids::{AuthorityId, RequestId, SerialNumber},
    types::{CertStatus, RequestStatus, RequestType, RevocationReason},
};
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{DbAuthority, DbCertRecord, DbRequest, DbSerialRange};

pub mod memory;
pub mod mongodb;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record not found")]
    NotFound,

    #[error("Record {id} was modified concurrently (expected version {expected})")]
    ConcurrentModification { id: String, expected: u64 },

    #[error("Record {0} already exists")]
    AlreadyExists(String),

    #[error("Serial range {0} is not configured")]
    RangeNotConfigured(String),

    #[error("Serial range {name} is exhausted (end {end:#x})")]
    RangeExhausted { name: String, end: u64 },

    #[error("Serial range {name} would reuse numbers already handed out (next is {next:#x})")]
    RangeWouldReuse { name: String, next: u64 },

    #[error("Invalid serial range: {0}")]
    InvalidRange(String),

    #[error("Query Error: {0}")]
    MongoDB(#[from] ::mongodb::error::Error),

    #[error("Encoding Error: {0}")]
    Encoding(#[from] bson::ser::Error),

    #[error(transparent)]
    Internal(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// One page of results along with the total number of matches.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
}

impl<T> Page<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
        }
    }
}

#[async_trait]
pub trait Storage:
    RequestStore + CertStore + AuthorityStore + SerialStore + Debug + Send + Sync + 'static
{
    async fn ping(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default)]
pub struct RequestFilter {
    pub status: Option<RequestStatus>,
    pub request_type: Option<RequestType>,
    pub authority_id: Option<AuthorityId>,
    pub owner: Option<String>,
    pub assigned_to: Option<String>,
}

impl RequestFilter {
    pub fn matches(&self, request: &DbRequest) -> bool {
        self.status.is_none_or(|s| request.status == s)
            && self.request_type.is_none_or(|t| request.request_type == t)
            && self
                .authority_id
                .is_none_or(|a| request.authority_id == Some(a))
            && self
                .owner
                .as_ref()
                .is_none_or(|o| request.owner.as_ref() == Some(o))
            && self
                .assigned_to
                .as_ref()
                .is_none_or(|a| request.assigned_to.as_ref() == Some(a))
    }
}

/// Persisted request records. Updates are optimistic: the caller names the
/// version it loaded and the write fails if someone else got there first.
#[async_trait]
pub trait RequestStore {
    async fn insert(&self, request: DbRequest) -> Result<DbRequest, StoreError>;

    async fn get(&self, id: RequestId) -> Result<Option<DbRequest>, StoreError>;

    /// Replace the stored record if its version is still `expected_version`.
    /// Returns the record as stored, with its version bumped.
    async fn update(
        &self,
        request: DbRequest,
        expected_version: u64,
    ) -> Result<DbRequest, StoreError>;

    async fn list(
        &self,
        filter: RequestFilter,
        start: usize,
        size: usize,
    ) -> Result<Page<DbRequest>, StoreError>;
}

#[derive(Debug, Clone, Default)]
pub struct CertFilter {
    pub status: Option<CertStatus>,
    pub authority_id: Option<AuthorityId>,
    /// Case-insensitive substring of the subject DN
    pub subject_contains: Option<String>,
    pub issuer_dn: Option<String>,
    pub serial_from: Option<SerialNumber>,
    pub serial_to: Option<SerialNumber>,
    pub revoked_by: Option<String>,
    pub revocation_reason: Option<RevocationReason>,
    pub issued_by: Option<String>,
    pub request_id: Option<RequestId>,
}

impl CertFilter {
    pub fn matches(&self, cert: &DbCertRecord, now: DateTime<Utc>) -> bool {
        self.status.is_none_or(|s| cert.effective_status(now) == s)
            && self.authority_id.is_none_or(|a| cert.authority_id == a)
            && self.subject_contains.as_ref().is_none_or(|needle| {
                cert.subject_dn
                    .to_lowercase()
                    .contains(&needle.to_lowercase())
            })
            && self
                .issuer_dn
                .as_ref()
                .is_none_or(|dn| cert.issuer_dn.eq_ignore_ascii_case(dn))
            && self.serial_from.is_none_or(|s| cert.serial >= s)
            && self.serial_to.is_none_or(|s| cert.serial <= s)
            && self.revoked_by.as_ref().is_none_or(|by| {
                cert.revocation.as_ref().map(|r| &r.revoked_by) == Some(by)
            })
            && self
                .revocation_reason
                .is_none_or(|reason| cert.revocation.as_ref().map(|r| r.reason) == Some(reason))
            && self
                .issued_by
                .as_ref()
                .is_none_or(|by| &cert.issued_by == by)
            && self
                .request_id
                .is_none_or(|id| cert.request_id == Some(id))
    }
}

/// The certificate repository.
#[async_trait]
pub trait CertStore {
    async fn insert(&self, cert: DbCertRecord) -> Result<DbCertRecord, StoreError>;

    async fn get(&self, serial: SerialNumber) -> Result<Option<DbCertRecord>, StoreError>;

    /// Replace the stored record if its version is still `expected_version`.
    async fn update(
        &self,
        cert: DbCertRecord,
        expected_version: u64,
    ) -> Result<DbCertRecord, StoreError>;

    /// Matching records in ascending serial order.
    async fn list(
        &self,
        filter: CertFilter,
        start: usize,
        size: usize,
    ) -> Result<Page<DbCertRecord>, StoreError>;
}

#[async_trait]
pub trait AuthorityStore {
    async fn insert(&self, authority: DbAuthority) -> Result<DbAuthority, StoreError>;

    async fn get(&self, id: AuthorityId) -> Result<Option<DbAuthority>, StoreError>;

    async fn list(&self) -> Result<Vec<DbAuthority>, StoreError>;

    async fn update(&self, authority: DbAuthority) -> Result<DbAuthority, StoreError>;

    async fn delete(&self, id: AuthorityId) -> Result<(), StoreError>;
}

/// Persisted counters for request ids and serial numbers.
#[async_trait]
pub trait SerialStore {
    /// Atomically hand out the next number of the named range.
    async fn next(&self, name: &str) -> Result<u64, StoreError>;

    async fn get_range(&self, name: &str) -> Result<Option<DbSerialRange>, StoreError>;

    /// Create the range if it does not exist yet. An existing range is left
    /// alone and returned.
    async fn init_range(&self, name: &str, start: u64, end: u64)
    -> Result<DbSerialRange, StoreError>;

    /// Replace the range bounds. Fails if `start` is below the next unissued
    /// number, since that would hand out a number twice.
    async fn reset_range(
        &self,
        name: &str,
        start: u64,
        end: u64,
    ) -> Result<DbSerialRange, StoreError>;
}

/// Shared validation for range bounds.
pub(crate) fn check_range(
    name: &str,
    start: u64,
    end: u64,
    existing: Option<&DbSerialRange>,
) -> Result<(), StoreError> {
    if start > end {
        return Err(StoreError::InvalidRange(format!(
            "start {start:#x} is after end {end:#x}"
        )));
    }
    // `next` runs one past `end` once the range is used up.
    if end == u64::MAX {
        return Err(StoreError::InvalidRange(format!(
            "end must be below {:#x}",
            u64::MAX
        )));
    }
    if let Some(existing) = existing {
        if start < existing.next {
            return Err(StoreError::RangeWouldReuse {
                name: name.to_string(),
                next: existing.next,
            });
        }
    }
    Ok(())
}
