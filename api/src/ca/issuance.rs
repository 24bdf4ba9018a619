//! Certificate issuance, revocation and retrieval.

use std::{
    collections::HashMap,
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use certa_common::{
    ids::{AuthorityId, RequestId, SerialNumber},
    types::{CertStatus, RevocationReason},
};
use certa_db::{
    models::{DbCertRecord, RevocationInfo, timestamp_now},
    storage::{CertFilter, CertStore, Page, Storage, StoreError},
};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::{
    authority::{Authority, AuthorityError, AuthorityRegistry},
    listener::{EngineEvent, ListenerDispatcher},
    pkcs7::{self, Pkcs7Error},
    serial::{SerialAllocator, SerialError},
    signing::{CertTemplate, CrlEntry, SigningError},
    x509::{X509Error, inspect_cert},
};

/// Highest CRL number handed out per authority.
const CRL_NUMBER_END: u64 = i64::MAX as u64 - 1;

const SEARCH_BATCH: usize = 100;

#[derive(Debug, Error)]
pub enum IssuanceError {
    #[error(transparent)]
    Authority(#[from] AuthorityError),

    #[error("Certificate {0} not found")]
    NotFound(SerialNumber),

    #[error("{0}")]
    ConflictingOperation(String),

    #[error("Reason {0} cannot be used to revoke a certificate")]
    InvalidReason(RevocationReason),

    #[error(transparent)]
    Serial(#[from] SerialError),

    #[error(transparent)]
    Signing(#[from] SigningError),

    #[error("Unreadable certificate: {0}")]
    Certificate(#[from] X509Error),

    #[error(transparent)]
    Pkcs7(#[from] Pkcs7Error),

    #[error(transparent)]
    Storage(StoreError),
}

impl From<StoreError> for IssuanceError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::ConcurrentModification { id, .. } => Self::ConflictingOperation(format!(
                "Certificate {id} was modified concurrently"
            )),
            other => Self::Storage(other),
        }
    }
}

impl IssuanceError {
    /// Whether this is a failure of the CA itself rather than of the request.
    pub fn is_internal(&self) -> bool {
        match self {
            Self::Authority(e) => e.is_internal(),
            Self::NotFound(_) | Self::ConflictingOperation(_) | Self::InvalidReason(_) => false,
            Self::Serial(_)
            | Self::Signing(_)
            | Self::Certificate(_)
            | Self::Pkcs7(_)
            | Self::Storage(_) => true,
        }
    }
}

/// `remove_from_crl` only has meaning in delta CRLs; taking a certificate off
/// hold is an unrevocation.
pub fn check_revocation_reason(reason: RevocationReason) -> Result<(), IssuanceError> {
    match reason {
        RevocationReason::RemoveFromCrl => Err(IssuanceError::InvalidReason(reason)),
        _ => Ok(()),
    }
}

/// Result of a revocation or unrevocation.
#[derive(Debug, Clone)]
pub struct RevocationOutcome {
    pub cert: DbCertRecord,
    /// Authority the operation was routed to
    pub authority_id: AuthorityId,
    /// False when the certificate was already in the requested state
    pub changed: bool,
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub items: Vec<DbCertRecord>,
    /// Every certificate matching the filter, regardless of the window
    pub total: u64,
    /// Set when matches beyond the returned ones exist, or `max_time` cut the
    /// search short
    pub truncated: bool,
}

/// Audit fields of an issuance.
#[derive(Debug, Clone, Default)]
pub struct IssueContext {
    pub profile_id: Option<String>,
    pub request_id: Option<RequestId>,
    pub issued_by: String,
}

/// A signed CRL and the revocation state it was built from.
#[derive(Debug, Clone)]
struct CachedCrl {
    pem: String,
    revision: u64,
    refresh_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct IssuanceService {
    db: Arc<dyn Storage>,
    authorities: Arc<AuthorityRegistry>,
    serials: SerialAllocator,
    dispatcher: ListenerDispatcher,
    crl_validity: chrono::Duration,
    /// Bumped on every revocation state change made through this service.
    revocations: AtomicU64,
    crls: RwLock<HashMap<AuthorityId, CachedCrl>>,
}

impl IssuanceService {
    pub fn new(
        db: Arc<dyn Storage>,
        authorities: Arc<AuthorityRegistry>,
        serials: SerialAllocator,
        dispatcher: ListenerDispatcher,
        crl_validity: chrono::Duration,
    ) -> Self {
        Self {
            db,
            authorities,
            serials,
            dispatcher,
            crl_validity,
            revocations: AtomicU64::new(0),
            crls: RwLock::new(HashMap::new()),
        }
    }

    pub fn authorities(&self) -> &Arc<AuthorityRegistry> {
        &self.authorities
    }

    /// Sign `template` with the named (or host) authority and record the
    /// certificate.
    #[instrument(skip(self, template, context), fields(subject = %template.subject_dn))]
    pub async fn issue(
        &self,
        authority_id: Option<AuthorityId>,
        template: &CertTemplate,
        context: IssueContext,
    ) -> Result<DbCertRecord, IssuanceError> {
        let authority = self.authorities.resolve(authority_id)?;
        authority.ensure_enabled()?;

        let serial = SerialNumber::new(self.serials.next().await?);
        let cert_pem = authority.signer.sign_certificate(template, serial)?;
        self.record_issued(&authority, serial, cert_pem, context).await
    }

    async fn record_issued(
        &self,
        authority: &Authority,
        serial: SerialNumber,
        cert_pem: String,
        context: IssueContext,
    ) -> Result<DbCertRecord, IssuanceError> {
        let info = inspect_cert(&cert_pem)?;
        let record = DbCertRecord {
            serial,
            version: 0,
            authority_id: authority.id(),
            issuer_dn: info.issuer_dn,
            subject_dn: info.subject_dn,
            cert_pem,
            status: CertStatus::Valid,
            not_before: info.not_before,
            not_after: info.not_after,
            issued_on: timestamp_now(),
            issued_by: context.issued_by,
            request_id: context.request_id,
            profile_id: context.profile_id,
            authority_key_id: info.authority_key_id,
            revocation: None,
        };
        let record = CertStore::insert(&*self.db, record).await?;

        info!(%serial, authority_id = %authority.id(), subject = %record.subject_dn, "Issued certificate");
        self.dispatcher.emit(EngineEvent::CertificateIssued {
            cert: record.clone(),
        });
        Ok(record)
    }

    /// Create a sub-authority under `parent` and record its CA certificate.
    #[instrument(skip(self, description))]
    pub async fn create_sub_authority(
        &self,
        parent: AuthorityId,
        dn: &str,
        description: Option<String>,
        created_by: &str,
    ) -> Result<Arc<Authority>, IssuanceError> {
        // Checked up front so no serial is spent on a request that cannot
        // succeed.
        let parent_authority = self.authorities.get(parent)?;
        parent_authority.ensure_enabled()?;
        self.authorities.ensure_unique_dn(dn)?;

        let serial = SerialNumber::new(self.serials.next().await?);
        let authority = self
            .authorities
            .create_sub_authority(parent, dn, description, serial)
            .await?;
        let context = IssueContext {
            profile_id: None,
            request_id: None,
            issued_by: created_by.to_string(),
        };
        self.record_issued(&parent_authority, serial, authority.record.cert_pem.clone(), context)
            .await?;
        Ok(authority)
    }

    /// The certificate already issued for `request_id`, if any.
    pub async fn issued_for(&self, request_id: RequestId) -> Result<Option<DbCertRecord>, IssuanceError> {
        let filter = CertFilter {
            request_id: Some(request_id),
            ..Default::default()
        };
        let page = CertStore::list(&*self.db, filter, 0, 1).await?;
        Ok(page.items.into_iter().next())
    }

    pub async fn get(&self, serial: SerialNumber) -> Result<DbCertRecord, IssuanceError> {
        CertStore::get(&*self.db, serial)
            .await?
            .ok_or(IssuanceError::NotFound(serial))
    }

    /// The authority responsible for `cert`, matched by its authority key
    /// identifier.
    fn route(&self, cert: &DbCertRecord) -> Result<Arc<Authority>, IssuanceError> {
        let authority = self
            .authorities
            .route_by_key_id(cert.authority_key_id.as_deref())?;
        if authority.id() != cert.authority_id {
            debug!(
                serial = %cert.serial,
                recorded = %cert.authority_id,
                routed = %authority.id(),
                "Certificate routed to a different authority than recorded"
            );
        }
        authority.ensure_enabled()?;
        Ok(authority)
    }

    /// Revoke a certificate. Repeating a revocation with the same reason
    /// changes nothing. A certificate on hold may be revoked again with a
    /// final reason; any other change of reason is a conflict.
    #[instrument(skip(self, comment))]
    pub async fn revoke(
        &self,
        serial: SerialNumber,
        reason: RevocationReason,
        revoker: &str,
        invalidity_date: Option<DateTime<Utc>>,
        comment: Option<String>,
    ) -> Result<RevocationOutcome, IssuanceError> {
        check_revocation_reason(reason)?;
        let cert = self.get(serial).await?;
        let authority = self.route(&cert)?;

        let revoked_on = match &cert.revocation {
            None => timestamp_now(),
            Some(existing) if existing.reason == reason => {
                debug!(%serial, "Certificate already revoked with this reason");
                return Ok(RevocationOutcome {
                    cert,
                    authority_id: authority.id(),
                    changed: false,
                });
            }
            Some(existing) if existing.reason == RevocationReason::CertificateHold => {
                existing.revoked_on
            }
            Some(existing) => {
                return Err(IssuanceError::ConflictingOperation(format!(
                    "Certificate {serial} is already revoked with reason {}",
                    existing.reason
                )));
            }
        };

        let version = cert.version;
        let mut updated = cert;
        updated.status = CertStatus::Revoked;
        updated.revocation = Some(RevocationInfo {
            reason,
            revoked_on,
            revoked_by: revoker.to_string(),
            invalidity_date,
            comment,
        });
        let cert = CertStore::update(&*self.db, updated, version).await?;
        self.revocations.fetch_add(1, Ordering::AcqRel);

        info!(%serial, %reason, authority_id = %authority.id(), "Revoked certificate");
        self.dispatcher
            .emit(EngineEvent::CertificateRevoked { cert: cert.clone() });
        Ok(RevocationOutcome {
            cert,
            authority_id: authority.id(),
            changed: true,
        })
    }

    /// Take a certificate off hold. Valid certificates are left alone.
    #[instrument(skip(self))]
    pub async fn unrevoke(
        &self,
        serial: SerialNumber,
        agent: &str,
    ) -> Result<RevocationOutcome, IssuanceError> {
        let cert = self.get(serial).await?;
        let authority = self.route(&cert)?;

        match &cert.revocation {
            None => {
                return Ok(RevocationOutcome {
                    cert,
                    authority_id: authority.id(),
                    changed: false,
                });
            }
            Some(existing) if existing.reason != RevocationReason::CertificateHold => {
                return Err(IssuanceError::ConflictingOperation(format!(
                    "Certificate {serial} is revoked with reason {} and cannot be unrevoked",
                    existing.reason
                )));
            }
            Some(_) => {}
        }

        let version = cert.version;
        let mut updated = cert;
        updated.status = CertStatus::Valid;
        updated.revocation = None;
        let cert = CertStore::update(&*self.db, updated, version).await?;
        self.revocations.fetch_add(1, Ordering::AcqRel);

        info!(%serial, agent, "Certificate taken off hold");
        self.dispatcher
            .emit(EngineEvent::CertificateUnrevoked { cert: cert.clone() });
        Ok(RevocationOutcome {
            cert,
            authority_id: authority.id(),
            changed: true,
        })
    }

    pub async fn list(
        &self,
        filter: CertFilter,
        start: usize,
        size: usize,
    ) -> Result<Page<DbCertRecord>, IssuanceError> {
        Ok(CertStore::list(&*self.db, filter, start, size).await?)
    }

    /// Collect matches in serial order, skipping the first `start`, until
    /// `max_results` are found or `max_time` has passed. The total number of
    /// matches is always reported.
    #[instrument(skip(self, filter))]
    pub async fn search(
        &self,
        filter: CertFilter,
        start: usize,
        max_results: usize,
        max_time: Duration,
    ) -> Result<SearchResult, IssuanceError> {
        let deadline = Instant::now() + max_time;
        let mut items = Vec::new();
        let mut offset = start;

        loop {
            let wanted = (max_results - items.len()).min(SEARCH_BATCH);
            let page = CertStore::list(&*self.db, filter.clone(), offset, wanted).await?;
            let total = page.total;
            let fetched = page.items.len();
            items.extend(page.items);
            offset = offset.saturating_add(fetched);

            let exhausted = fetched == 0 || offset as u64 >= total;
            if exhausted || items.len() >= max_results {
                let truncated = (offset as u64) < total;
                return Ok(SearchResult {
                    items,
                    total,
                    truncated,
                });
            }
            if Instant::now() >= deadline {
                warn!(found = items.len(), "Certificate search hit its time limit");
                return Ok(SearchResult {
                    items,
                    total,
                    truncated: true,
                });
            }
        }
    }

    /// PKCS#7 certs-only bundle of the certificate and its issuer chain.
    pub async fn chain_pkcs7(&self, serial: SerialNumber) -> Result<(DbCertRecord, Vec<u8>), IssuanceError> {
        let cert = self.get(serial).await?;
        let mut chain = vec![cert.cert_pem.clone()];
        chain.extend(self.authorities.chain_pems(cert.authority_id)?);
        let der = pkcs7::certs_only(&chain)?;
        Ok((cert, der))
    }

    /// The authority's CRL, signed again only once a revocation changed or
    /// half of the last one's validity has passed.
    pub async fn current_crl(&self, authority_id: AuthorityId) -> Result<String, IssuanceError> {
        let authority = self.authorities.get(authority_id)?;
        let revision = self.revocations.load(Ordering::Acquire);
        let now = Utc::now();

        let cached = self
            .crls
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&authority.id())
            .filter(|crl| crl.revision == revision && now < crl.refresh_at)
            .map(|crl| crl.pem.clone());
        if let Some(pem) = cached {
            debug!(%authority_id, "Serving cached CRL");
            return Ok(pem);
        }

        let pem = self.generate_crl(Some(authority.id())).await?;
        self.crls
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                authority.id(),
                CachedCrl {
                    pem: pem.clone(),
                    revision,
                    refresh_at: now + self.crl_validity / 2,
                },
            );
        Ok(pem)
    }

    /// Sign a fresh CRL over every certificate the authority has revoked.
    #[instrument(skip(self))]
    pub async fn generate_crl(&self, authority_id: Option<AuthorityId>) -> Result<String, IssuanceError> {
        let authority = self.authorities.resolve(authority_id)?;

        let filter = CertFilter {
            status: Some(CertStatus::Revoked),
            authority_id: Some(authority.id()),
            ..Default::default()
        };
        let mut entries = Vec::new();
        let mut start = 0;
        loop {
            let page = CertStore::list(&*self.db, filter.clone(), start, SEARCH_BATCH).await?;
            if page.items.is_empty() {
                break;
            }
            start += page.items.len();
            entries.extend(page.items.into_iter().filter_map(|cert| {
                cert.revocation.map(|r| CrlEntry {
                    serial: cert.serial,
                    revoked_on: r.revoked_on,
                    reason: r.reason,
                    invalidity_date: r.invalidity_date,
                })
            }));
        }

        let numbers = SerialAllocator::new(self.db.clone(), format!("crl:{}", authority.id()));
        numbers.init(1, CRL_NUMBER_END).await?;
        let crl_number = numbers.next().await?;

        let crl = authority
            .signer
            .sign_crl(&entries, crl_number, Utc::now() + self.crl_validity)?;
        info!(authority_id = %authority.id(), crl_number, entries = entries.len(), "Generated CRL");
        Ok(crl)
    }
}
