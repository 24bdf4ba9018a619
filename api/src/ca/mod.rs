//! The certificate authority engine.
//!
//! [`Engine`] owns the request queue, the issuance service and the authority
//! registry. It is built once at start-up by [`EngineBuilder`] and shared by
//! the HTTP handlers; every operation takes the [`Caller`] it acts for and
//! checks its permissions first.

pub mod authority;
pub mod issuance;
pub mod listener;
pub mod pkcs7;
pub mod policy;
pub mod profile;
pub mod queue;
pub mod scheduler;
pub mod serial;
pub mod service;
pub mod signing;
pub mod x509;

#[cfg(test)]
mod tests;

use std::{sync::Arc, time::Duration};

use certa_common::{
    caller::{Caller, CallerError, Permission},
    ids::{AuthorityId, RequestId, SerialNumber},
    params::{CreateAuthorityParams, EnrollmentParams, RevocationParams, UpdateRequestParams},
    types::{RequestStatus, RequestType},
};
use certa_db::{
    models::{CERT_COUNTER, DbAuthority, DbCertRecord, DbRequest, DbSerialRange, REQUEST_COUNTER, RevocationData},
    storage::{CertFilter, Page, RequestFilter, Storage, StoreError},
};
use thiserror::Error;
use tracing::{info, instrument};

use self::{
    authority::{AuthorityError, AuthorityRegistry},
    issuance::{IssuanceError, IssuanceService, SearchResult},
    listener::{DispatchStats, ListenerDispatcher, RequestListener, listeners_from_config},
    policy::PolicyProcessor,
    profile::{ProfileError, ProfileRegistry},
    queue::{
        ApprovalOutcome, LockedRequest, QueueError, QueueSettings, RequestQueue, ServiceCompletion,
        ServiceReport,
    },
    scheduler::{RequestScheduler, SchedulerStats, ThrottlingScheduler},
    serial::{SerialAllocator, SerialError},
    service::{RequestService, ServiceError, ServiceRegistry},
    signing::{SigningError, SoftwareToken},
    x509::{inspect_csr, parse_dn},
};
use crate::config::store::{ConfigStore, ConfigStoreError, EngineConfig, TokenConfig};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Caller(#[from] CallerError),

    #[error("Request refused by policy: {}", .0.join("; "))]
    PolicyRejected(Vec<String>),

    #[error("Request {0} is still waiting on its service")]
    ServicePending(RequestId),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Issuance(#[from] IssuanceError),

    #[error(transparent)]
    Authority(#[from] AuthorityError),

    #[error(transparent)]
    Service(ServiceError),

    #[error(transparent)]
    Serial(#[from] SerialError),

    #[error(transparent)]
    Profile(#[from] ProfileError),

    #[error(transparent)]
    Config(#[from] ConfigStoreError),

    #[error(transparent)]
    Signing(#[from] SigningError),

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error("Unknown serial counter {0}")]
    UnknownCounter(String),
}

impl EngineError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }
}

/// Snapshot of the engine's in-memory counters.
#[derive(Debug, Clone, Copy)]
pub struct EngineStats {
    pub listeners: DispatchStats,
    pub scheduler: SchedulerStats,
    pub locked_requests: usize,
}

pub struct EngineBuilder {
    db: Arc<dyn Storage>,
    config: ConfigStore,
    token: Option<Arc<SoftwareToken>>,
    listeners: Vec<Arc<dyn RequestListener>>,
    services: Vec<Arc<dyn RequestService>>,
}

impl EngineBuilder {
    pub fn new(db: Arc<dyn Storage>) -> Self {
        Self {
            db,
            config: ConfigStore::empty(),
            token: None,
            listeners: Vec::new(),
            services: Vec::new(),
        }
    }

    pub fn config(mut self, config: ConfigStore) -> Self {
        self.config = config;
        self
    }

    /// Use `token` instead of the one named by `authority.token_dir`.
    pub fn token(mut self, token: Arc<SoftwareToken>) -> Self {
        self.token = Some(token);
        self
    }

    /// A listener in addition to the configured ones.
    pub fn listener(mut self, listener: Arc<dyn RequestListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Replace the built-in service for the service's request type.
    pub fn service(mut self, service: Arc<dyn RequestService>) -> Self {
        self.services.push(service);
        self
    }

    /// Build the engine. Must run inside a tokio runtime.
    #[instrument(skip_all)]
    pub async fn build(self) -> Result<Engine, EngineError> {
        let config = self.config.engine_config()?;
        let profiles = Arc::new(ProfileRegistry::from_config(&config.profiles)?);
        let policies = PolicyProcessor::from_config(&self.config)?;

        let mut listeners = listeners_from_config(&self.config)?;
        listeners.extend(self.listeners);
        let dispatcher = ListenerDispatcher::start(
            listeners,
            config.queue.listener_workers,
            config.queue.listener_capacity,
        );

        let request_ids = SerialAllocator::new(self.db.clone(), REQUEST_COUNTER);
        request_ids
            .init(config.serial.request_start, config.serial.request_end)
            .await?;
        let cert_serials = SerialAllocator::new(self.db.clone(), CERT_COUNTER);
        cert_serials
            .init(config.serial.cert_start, config.serial.cert_end)
            .await?;

        let token = match (self.token, &config.authority.token_dir) {
            (Some(token), _) => token,
            (None, Some(dir)) => Arc::new(SoftwareToken::with_dir(dir)?),
            (None, None) => Arc::new(SoftwareToken::in_memory()),
        };
        let authorities =
            Arc::new(AuthorityRegistry::load(self.db.clone(), token.clone(), &config.authority).await?);

        let issuance = Arc::new(IssuanceService::new(
            self.db.clone(),
            authorities.clone(),
            cert_serials.clone(),
            dispatcher.clone(),
            chrono::Duration::hours(config.authority.crl_validity_hours),
        ));

        let mut services = ServiceRegistry::standard(issuance.clone(), profiles.clone());
        for service in self.services {
            services.register(service);
        }

        let scheduler = Arc::new(ThrottlingScheduler::new(config.queue.max_concurrent_services));
        let queue = RequestQueue::new(
            self.db.clone(),
            request_ids.clone(),
            policies,
            services,
            scheduler.clone() as Arc<dyn RequestScheduler>,
            dispatcher.clone(),
            QueueSettings {
                lock_timeout: Duration::from_millis(config.queue.lock_timeout_ms),
                service_timeout: Duration::from_secs(config.queue.service_timeout_secs),
            },
        );

        info!(
            profiles = profiles.list().count(),
            authorities = authorities.list().len(),
            "CA engine ready"
        );

        Ok(Engine {
            db: self.db,
            config,
            queue,
            issuance,
            authorities,
            profiles,
            token,
            request_ids,
            cert_serials,
            dispatcher,
            scheduler,
        })
    }
}

pub struct Engine {
    db: Arc<dyn Storage>,
    config: EngineConfig,
    queue: RequestQueue,
    issuance: Arc<IssuanceService>,
    authorities: Arc<AuthorityRegistry>,
    profiles: Arc<ProfileRegistry>,
    token: Arc<SoftwareToken>,
    request_ids: SerialAllocator,
    cert_serials: SerialAllocator,
    dispatcher: ListenerDispatcher,
    scheduler: Arc<ThrottlingScheduler>,
}

/// Name of `caller` once it holds `permission`.
fn authorize(caller: &Caller, permission: Permission) -> Result<String, EngineError> {
    caller.require(permission)?;
    Ok(caller.name()?)
}

pub fn parse_authority_id(value: &str) -> Result<AuthorityId, EngineError> {
    value
        .parse()
        .map_err(|e: certa_common::ids::IdParseError| EngineError::bad_request(e.to_string()))
}

pub fn parse_serial(value: &str) -> Result<SerialNumber, EngineError> {
    value
        .parse()
        .map_err(|e: certa_common::ids::IdParseError| EngineError::bad_request(e.to_string()))
}

impl Engine {
    pub fn builder(db: Arc<dyn Storage>) -> EngineBuilder {
        EngineBuilder::new(db)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tokens(&self) -> &[TokenConfig] {
        &self.config.tokens
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub fn issuance(&self) -> &IssuanceService {
        &self.issuance
    }

    pub fn authorities(&self) -> &AuthorityRegistry {
        &self.authorities
    }

    pub fn profiles(&self) -> &ProfileRegistry {
        &self.profiles
    }

    pub fn token(&self) -> &Arc<SoftwareToken> {
        &self.token
    }

    pub async fn ping(&self) -> Result<(), EngineError> {
        Ok(self.db.ping().await?)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            listeners: self.dispatcher.stats(),
            scheduler: self.scheduler.stats(),
            locked_requests: self.queue.locked_count(),
        }
    }

    /// Approve as the system agent when the profile asks for it. A policy
    /// refusal leaves the request pending for an agent.
    async fn auto_approve(&self, locked: &mut LockedRequest, auto: bool) -> Result<(), EngineError> {
        if !auto {
            return Ok(());
        }
        if let ApprovalOutcome::PolicyRejected(messages) =
            self.queue.approve(locked, Caller::SYSTEM_NAME).await?
        {
            info!(request_id = %locked.id(), ?messages, "Auto-approval refused by policy");
        }
        Ok(())
    }

    /// Submit an enrollment. Everything about the input is checked before a
    /// request is created.
    #[instrument(skip(self, caller, params), fields(profile_id = %params.profile_id))]
    pub async fn submit_enrollment(
        &self,
        caller: &Caller,
        params: EnrollmentParams,
    ) -> Result<DbRequest, EngineError> {
        let owner = authorize(caller, Permission::RequestsSubmit)?;

        let profile = self.profiles.get(&params.profile_id)?;
        profile.check_inputs(&params.inputs)?;

        let csr = inspect_csr(&params.csr_pem)
            .map_err(|e| EngineError::bad_request(format!("Invalid certificate request: {e}")))?;
        let subject_dn = params.subject_dn.unwrap_or(csr.subject_dn);
        if subject_dn.trim().is_empty() {
            return Err(EngineError::bad_request("Subject DN must not be empty"));
        }
        parse_dn(&subject_dn).map_err(|e| EngineError::bad_request(e.to_string()))?;

        let validity_days = params.validity_days.unwrap_or(profile.validity_days);
        if validity_days == 0 {
            return Err(EngineError::bad_request("Validity must be at least one day"));
        }

        let authority_id = params
            .authority_id
            .as_deref()
            .map(parse_authority_id)
            .transpose()?;
        let authority = self.authorities.resolve(authority_id)?;
        authority.ensure_enabled()?;

        let mut locked = self.queue.create(RequestType::Enrollment).await?;
        let request = locked.request_mut();
        request.owner = Some(owner);
        request.profile_id = Some(profile.id.clone());
        request.authority_id = Some(authority.id());
        request.enrollment = Some(certa_db::models::EnrollmentData {
            csr_pem: params.csr_pem,
            subject_dn,
            validity_days,
            dns_names: params.dns_names,
            key_algorithm: csr.key_algorithm,
            key_size: csr.key_size,
            inputs: params.inputs,
        });
        self.queue.mark_pending(&mut locked).await?;
        self.auto_approve(&mut locked, profile.auto_approve).await?;

        Ok(locked.into_request())
    }

    /// Submit a renewal of `serial`, reusing the enrollment data of the
    /// request that produced it.
    #[instrument(skip(self, caller))]
    pub async fn submit_renewal(
        &self,
        caller: &Caller,
        serial: SerialNumber,
    ) -> Result<DbRequest, EngineError> {
        let owner = authorize(caller, Permission::RequestsSubmit)?;

        let cert = self.issuance.get(serial).await?;
        if cert.revocation.is_some() {
            return Err(IssuanceError::ConflictingOperation(format!(
                "Certificate {serial} is revoked and cannot be renewed"
            ))
            .into());
        }
        let original_id = cert.request_id.ok_or_else(|| {
            EngineError::bad_request(format!(
                "Certificate {serial} was not issued from an enrollment request"
            ))
        })?;
        let original = self.queue.get(original_id).await?;
        if original.owner.as_deref() != Some(owner.as_str()) && !caller.can(Permission::RequestsReview)? {
            return Err(CallerError::forbidden(Permission::RequestsReview).into());
        }
        let enrollment = original.enrollment.clone().ok_or_else(|| {
            EngineError::bad_request(format!("Request {original_id} carries no enrollment data"))
        })?;
        let profile_id = cert
            .profile_id
            .clone()
            .or(original.profile_id.clone())
            .ok_or_else(|| EngineError::bad_request("Certificate has no profile"))?;
        let profile = self.profiles.get(&profile_id)?;
        let authority = self.authorities.get(cert.authority_id)?;
        authority.ensure_enabled()?;

        let mut locked = self.queue.create(RequestType::Renewal).await?;
        let request = locked.request_mut();
        request.owner = Some(owner);
        request.profile_id = Some(profile.id.clone());
        request.authority_id = Some(authority.id());
        request.target_serial = Some(serial);
        request.enrollment = Some(enrollment);
        self.queue.mark_pending(&mut locked).await?;
        self.auto_approve(&mut locked, profile.auto_approve).await?;

        Ok(locked.into_request())
    }

    /// A request as its owner or an agent sees it.
    pub async fn get_request(&self, caller: &Caller, id: RequestId) -> Result<DbRequest, EngineError> {
        if caller.is_anonymous() {
            return Err(CallerError::unauthorized(None).into());
        }
        let request = self.queue.get(id).await?;
        let is_owner = request.owner.as_deref() == Some(caller.name()?.as_str());
        if !is_owner {
            caller.require(Permission::RequestsRead)?;
        }
        Ok(request)
    }

    pub async fn list_requests(
        &self,
        caller: &Caller,
        filter: RequestFilter,
        start: usize,
        size: usize,
    ) -> Result<Page<DbRequest>, EngineError> {
        caller.require(Permission::RequestsRead)?;
        Ok(self.queue.list(filter, start, size).await?)
    }

    /// Approve a pending request and run its service.
    #[instrument(skip(self, caller))]
    pub async fn approve_request(
        &self,
        caller: &Caller,
        id: RequestId,
    ) -> Result<(DbRequest, ApprovalOutcome), EngineError> {
        let agent = authorize(caller, Permission::RequestsReview)?;
        let mut locked = self.queue.find(id).await?;
        let outcome = self.queue.approve(&mut locked, &agent).await?;
        Ok((locked.into_request(), outcome))
    }

    #[instrument(skip(self, caller, reason))]
    pub async fn reject_request(
        &self,
        caller: &Caller,
        id: RequestId,
        reason: Option<String>,
    ) -> Result<DbRequest, EngineError> {
        let agent = authorize(caller, Permission::RequestsReview)?;
        let mut locked = self.queue.find(id).await?;
        self.queue.reject(&mut locked, &agent, reason).await?;
        Ok(locked.into_request())
    }

    #[instrument(skip(self, caller, reason))]
    pub async fn cancel_request(
        &self,
        caller: &Caller,
        id: RequestId,
        reason: Option<String>,
    ) -> Result<DbRequest, EngineError> {
        let agent = authorize(caller, Permission::RequestsReview)?;
        let mut locked = self.queue.find(id).await?;
        self.queue.cancel(&mut locked, &agent, reason).await?;
        Ok(locked.into_request())
    }

    /// Assign the request to the calling agent.
    pub async fn assign_request(&self, caller: &Caller, id: RequestId) -> Result<DbRequest, EngineError> {
        let agent = authorize(caller, Permission::RequestsReview)?;
        let mut locked = self.queue.find(id).await?;
        self.queue.assign(&mut locked, &agent).await?;
        Ok(locked.into_request())
    }

    pub async fn unassign_request(&self, caller: &Caller, id: RequestId) -> Result<DbRequest, EngineError> {
        caller.require(Permission::RequestsReview)?;
        let mut locked = self.queue.find(id).await?;
        self.queue.unassign(&mut locked).await?;
        Ok(locked.into_request())
    }

    pub async fn update_request(
        &self,
        caller: &Caller,
        id: RequestId,
        changes: UpdateRequestParams,
    ) -> Result<DbRequest, EngineError> {
        caller.require(Permission::RequestsReview)?;
        if let Some(dn) = &changes.subject_dn {
            parse_dn(dn).map_err(|e| EngineError::bad_request(e.to_string()))?;
        }
        let mut locked = self.queue.find(id).await?;
        self.queue.update_pending(&mut locked, changes).await?;
        Ok(locked.into_request())
    }

    /// Complete a SVC_PENDING request with the result reported from outside.
    pub async fn complete_request(
        &self,
        caller: &Caller,
        id: RequestId,
        completion: ServiceCompletion,
    ) -> Result<DbRequest, EngineError> {
        caller.require(Permission::RequestsReview)?;
        let mut locked = self.queue.find(id).await?;
        self.queue.notify_complete(&mut locked, completion).await?;
        Ok(locked.into_request())
    }

    /// Run the service again for a request left SVC_PENDING, or for the
    /// first time for one stuck APPROVED after an interrupted approval.
    #[instrument(skip(self, caller))]
    pub async fn retry_request(
        &self,
        caller: &Caller,
        id: RequestId,
    ) -> Result<(DbRequest, ServiceReport), EngineError> {
        caller.require(Permission::RequestsReview)?;
        let mut locked = self.queue.find(id).await?;
        let report = match locked.request().status {
            RequestStatus::Approved => self.queue.process(&mut locked).await?,
            _ => self.queue.retry_service(&mut locked).await?,
        };
        Ok((locked.into_request(), report))
    }

    /// Run a revocation or unrevocation through the queue on behalf of
    /// `agent` and hand back the certificate as it ends up.
    async fn run_cert_request(
        &self,
        agent: &str,
        request_type: RequestType,
        cert: DbCertRecord,
        revocation: Option<RevocationData>,
    ) -> Result<DbCertRecord, EngineError> {
        let mut locked = self.queue.create(request_type).await?;
        let request = locked.request_mut();
        request.owner = Some(agent.to_string());
        request.authority_id = Some(cert.authority_id);
        request.target_serial = Some(cert.serial);
        request.revocation = revocation;
        self.queue.mark_pending(&mut locked).await?;

        match self.queue.approve(&mut locked, agent).await? {
            ApprovalOutcome::PolicyRejected(messages) => Err(EngineError::PolicyRejected(messages)),
            ApprovalOutcome::Serviced(ServiceReport { error: Some(e), .. }) => Err(EngineError::Service(e)),
            ApprovalOutcome::Serviced(ServiceReport { timed_out: true, .. }) => {
                Err(EngineError::ServicePending(locked.id()))
            }
            ApprovalOutcome::Serviced(_) => Ok(self.issuance.get(cert.serial).await?),
        }
    }

    #[instrument(skip(self, caller, params), fields(reason = %params.reason))]
    pub async fn revoke_certificate(
        &self,
        caller: &Caller,
        serial: SerialNumber,
        params: RevocationParams,
    ) -> Result<DbCertRecord, EngineError> {
        let agent = authorize(caller, Permission::CertsRevoke)?;
        issuance::check_revocation_reason(params.reason)?;
        let cert = self.issuance.get(serial).await?;
        let revocation = RevocationData {
            reason: params.reason,
            invalidity_date: params.invalidity_date,
            comment: params.comment,
        };
        self.run_cert_request(&agent, RequestType::Revocation, cert, Some(revocation))
            .await
    }

    #[instrument(skip(self, caller))]
    pub async fn unrevoke_certificate(
        &self,
        caller: &Caller,
        serial: SerialNumber,
    ) -> Result<DbCertRecord, EngineError> {
        let agent = authorize(caller, Permission::CertsRevoke)?;
        let cert = self.issuance.get(serial).await?;
        self.run_cert_request(&agent, RequestType::Unrevocation, cert, None)
            .await
    }

    pub async fn get_cert(&self, serial: SerialNumber) -> Result<DbCertRecord, EngineError> {
        Ok(self.issuance.get(serial).await?)
    }

    /// The certificate along with its PKCS#7 chain in DER.
    pub async fn get_cert_with_chain(
        &self,
        serial: SerialNumber,
    ) -> Result<(DbCertRecord, Vec<u8>), EngineError> {
        Ok(self.issuance.chain_pkcs7(serial).await?)
    }

    pub async fn list_certs(
        &self,
        filter: CertFilter,
        start: usize,
        size: usize,
    ) -> Result<Page<DbCertRecord>, EngineError> {
        Ok(self.issuance.list(filter, start, size).await?)
    }

    pub async fn search_certs(
        &self,
        filter: CertFilter,
        start: usize,
        max_results: usize,
        max_time: Duration,
    ) -> Result<SearchResult, EngineError> {
        Ok(self.issuance.search(filter, start, max_results, max_time).await?)
    }

    pub fn list_authorities(&self) -> Vec<DbAuthority> {
        self.authorities.list()
    }

    pub fn get_authority(&self, id: AuthorityId) -> Result<DbAuthority, EngineError> {
        Ok(self.authorities.get(id)?.record.clone())
    }

    #[instrument(skip(self, caller, params), fields(dn = %params.dn))]
    pub async fn create_authority(
        &self,
        caller: &Caller,
        params: CreateAuthorityParams,
    ) -> Result<DbAuthority, EngineError> {
        let creator = authorize(caller, Permission::AuthoritiesWrite)?;
        parse_dn(&params.dn).map_err(|e| EngineError::bad_request(e.to_string()))?;
        let parent = params
            .parent_id
            .as_deref()
            .map(parse_authority_id)
            .transpose()?
            .unwrap_or(self.authorities.host_id());

        let authority = self
            .issuance
            .create_sub_authority(parent, &params.dn, params.description, &creator)
            .await?;
        Ok(authority.record.clone())
    }

    pub async fn set_authority_enabled(
        &self,
        caller: &Caller,
        id: AuthorityId,
        enabled: bool,
    ) -> Result<DbAuthority, EngineError> {
        caller.require(Permission::AuthoritiesWrite)?;
        Ok(self.authorities.set_enabled(id, enabled).await?)
    }

    pub async fn delete_authority(&self, caller: &Caller, id: AuthorityId) -> Result<(), EngineError> {
        caller.require(Permission::AuthoritiesWrite)?;
        Ok(self.authorities.delete(id).await?)
    }

    /// The authority's current CRL in PEM. Repeated reads share one signed
    /// CRL until the revocation state changes.
    pub async fn authority_crl(&self, id: AuthorityId) -> Result<String, EngineError> {
        Ok(self.issuance.current_crl(id).await?)
    }

    fn counter(&self, name: &str) -> Result<&SerialAllocator, EngineError> {
        match name {
            CERT_COUNTER => Ok(&self.cert_serials),
            REQUEST_COUNTER => Ok(&self.request_ids),
            other => Err(EngineError::UnknownCounter(other.to_string())),
        }
    }

    pub async fn serial_range(&self, caller: &Caller, counter: &str) -> Result<DbSerialRange, EngineError> {
        caller.require(Permission::Admin)?;
        Ok(self.counter(counter)?.range().await?)
    }

    #[instrument(skip(self, caller))]
    pub async fn reset_serial_range(
        &self,
        caller: &Caller,
        counter: &str,
        start: u64,
        end: u64,
    ) -> Result<DbSerialRange, EngineError> {
        caller.require(Permission::Admin)?;
        Ok(self.counter(counter)?.reset_range(start, end).await?)
    }
}
