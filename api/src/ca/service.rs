//! Services run for approved requests, one per request type.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use certa_common::{
    caller::Caller,
    types::{RequestType, ResultCode},
};
use certa_db::models::DbRequest;
use thiserror::Error;
use tracing::debug;

use super::{
    issuance::{IssuanceError, IssuanceService, IssueContext},
    profile::ProfileRegistry,
};

pub enum ServiceOutcome {
    /// The request is finished.
    Complete,
    /// Waiting on something outside the CA; completed later through the
    /// completion notifier.
    Pending,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Issuance(#[from] IssuanceError),

    /// The request cannot be serviced as it stands.
    #[error("{0}")]
    Rejected(String),

    #[error("{0}")]
    Internal(String),
}

impl ServiceError {
    /// ERROR for failures of the request, EXCEPTION for failures of the CA.
    pub fn result_code(&self) -> ResultCode {
        match self {
            Self::Issuance(e) if e.is_internal() => ResultCode::Exception,
            Self::Issuance(_) | Self::Rejected(_) => ResultCode::Error,
            Self::Internal(_) => ResultCode::Exception,
        }
    }
}

#[async_trait]
pub trait RequestService: Send + Sync {
    fn request_type(&self) -> RequestType;

    /// Carry out an approved request. Changes made to `request` are persisted
    /// with the outcome.
    async fn service(&self, request: &mut DbRequest) -> Result<ServiceOutcome, ServiceError>;
}

/// Name recorded as the actor of a serviced request.
fn actor(request: &DbRequest) -> String {
    request
        .agent
        .clone()
        .or_else(|| request.owner.clone())
        .unwrap_or_else(|| Caller::SYSTEM_NAME.to_string())
}

pub struct EnrollmentService {
    issuance: Arc<IssuanceService>,
    profiles: Arc<ProfileRegistry>,
}

impl EnrollmentService {
    pub fn new(issuance: Arc<IssuanceService>, profiles: Arc<ProfileRegistry>) -> Self {
        Self { issuance, profiles }
    }

    async fn issue(&self, request: &mut DbRequest) -> Result<ServiceOutcome, ServiceError> {
        // A retried request whose earlier attempt got as far as recording
        // its certificate keeps that certificate.
        if let Some(cert) = self.issuance.issued_for(request.id).await? {
            debug!(request_id = %request.id, serial = %cert.serial, "Request already has a certificate");
            request.cert_serial = Some(cert.serial);
            request.authority_id = Some(cert.authority_id);
            return Ok(ServiceOutcome::Complete);
        }

        let enrollment = request
            .enrollment
            .as_ref()
            .ok_or_else(|| ServiceError::Rejected("Request carries no enrollment data".into()))?;
        let profile_id = request
            .profile_id
            .as_deref()
            .ok_or_else(|| ServiceError::Rejected("Request names no profile".into()))?;
        let profile = self
            .profiles
            .get(profile_id)
            .map_err(|e| ServiceError::Rejected(e.to_string()))?;

        let template = profile.build_template(enrollment);
        let context = IssueContext {
            profile_id: Some(profile.id.clone()),
            request_id: Some(request.id),
            issued_by: actor(request),
        };
        let cert = self
            .issuance
            .issue(request.authority_id, &template, context)
            .await?;
        request.cert_serial = Some(cert.serial);
        request.authority_id = Some(cert.authority_id);
        Ok(ServiceOutcome::Complete)
    }
}

#[async_trait]
impl RequestService for EnrollmentService {
    fn request_type(&self) -> RequestType {
        RequestType::Enrollment
    }

    async fn service(&self, request: &mut DbRequest) -> Result<ServiceOutcome, ServiceError> {
        self.issue(request).await
    }
}

/// Issues a new certificate with the enrollment data of the one being
/// renewed.
pub struct RenewalService(EnrollmentService);

impl RenewalService {
    pub fn new(issuance: Arc<IssuanceService>, profiles: Arc<ProfileRegistry>) -> Self {
        Self(EnrollmentService::new(issuance, profiles))
    }
}

#[async_trait]
impl RequestService for RenewalService {
    fn request_type(&self) -> RequestType {
        RequestType::Renewal
    }

    async fn service(&self, request: &mut DbRequest) -> Result<ServiceOutcome, ServiceError> {
        if request.target_serial.is_none() {
            return Err(ServiceError::Rejected(
                "Renewal names no certificate".into(),
            ));
        }
        self.0.issue(request).await
    }
}

pub struct RevocationService {
    issuance: Arc<IssuanceService>,
}

impl RevocationService {
    pub fn new(issuance: Arc<IssuanceService>) -> Self {
        Self { issuance }
    }
}

#[async_trait]
impl RequestService for RevocationService {
    fn request_type(&self) -> RequestType {
        RequestType::Revocation
    }

    async fn service(&self, request: &mut DbRequest) -> Result<ServiceOutcome, ServiceError> {
        let serial = request
            .target_serial
            .ok_or_else(|| ServiceError::Rejected("Revocation names no certificate".into()))?;
        let revocation = request
            .revocation
            .clone()
            .ok_or_else(|| ServiceError::Rejected("Revocation carries no reason".into()))?;

        let outcome = self
            .issuance
            .revoke(
                serial,
                revocation.reason,
                &actor(request),
                revocation.invalidity_date,
                revocation.comment,
            )
            .await?;
        request.cert_serial = Some(outcome.cert.serial);
        request.authority_id = Some(outcome.authority_id);
        Ok(ServiceOutcome::Complete)
    }
}

pub struct UnrevocationService {
    issuance: Arc<IssuanceService>,
}

impl UnrevocationService {
    pub fn new(issuance: Arc<IssuanceService>) -> Self {
        Self { issuance }
    }
}

#[async_trait]
impl RequestService for UnrevocationService {
    fn request_type(&self) -> RequestType {
        RequestType::Unrevocation
    }

    async fn service(&self, request: &mut DbRequest) -> Result<ServiceOutcome, ServiceError> {
        let serial = request
            .target_serial
            .ok_or_else(|| ServiceError::Rejected("Unrevocation names no certificate".into()))?;
        let outcome = self.issuance.unrevoke(serial, &actor(request)).await?;
        request.cert_serial = Some(outcome.cert.serial);
        request.authority_id = Some(outcome.authority_id);
        Ok(ServiceOutcome::Complete)
    }
}

#[derive(Clone, Default)]
pub struct ServiceRegistry {
    services: HashMap<RequestType, Arc<dyn RequestService>>,
}

impl ServiceRegistry {
    /// The built-in service for every request type.
    pub fn standard(issuance: Arc<IssuanceService>, profiles: Arc<ProfileRegistry>) -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(EnrollmentService::new(
            issuance.clone(),
            profiles.clone(),
        )));
        registry.register(Arc::new(RenewalService::new(issuance.clone(), profiles)));
        registry.register(Arc::new(RevocationService::new(issuance.clone())));
        registry.register(Arc::new(UnrevocationService::new(issuance)));
        registry
    }

    /// Install `service` for its request type, replacing any previous one.
    pub fn register(&mut self, service: Arc<dyn RequestService>) {
        self.services.insert(service.request_type(), service);
    }

    pub fn get(&self, request_type: RequestType) -> Option<Arc<dyn RequestService>> {
        self.services.get(&request_type).cloned()
    }
}
