//! The request queue and its state machine.
//!
//! ```text
//! BEGIN -> PENDING -> APPROVED -> (service) -> COMPLETE
//!                 \-> REJECTED              \-> SVC_PENDING -> COMPLETE
//!                 \-> CANCELED
//! ```
//!
//! Every mutation requires a [`LockedRequest`], obtained from
//! [`RequestQueue::create`] or [`RequestQueue::find`]. A transition builds the
//! next record from a copy, persists it, and only then updates the handle and
//! emits its event, so a failed write leaves both the store and the handle as
//! they were.

pub mod locks;

use std::{sync::Arc, time::Duration};

use certa_common::{
    ids::RequestId,
    params::UpdateRequestParams,
    types::{ExtValue, RequestStatus, RequestType, ResultCode},
};
use certa_db::{
    models::{DbRequest, timestamp_now},
    storage::{Page, RequestFilter, RequestStore, Storage, StoreError},
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use self::locks::{LockTable, RequestLock};
use super::{
    listener::{EngineEvent, ListenerDispatcher},
    policy::PolicyProcessor,
    scheduler::{Admission, RequestScheduler},
    serial::{SerialAllocator, SerialError},
    service::{ServiceError, ServiceOutcome, ServiceRegistry},
};

/// Extension attribute set when a service invocation timed out.
pub const SVC_TIMEOUT_EXT: &str = "svc_timeout";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Request {0} not found")]
    NotFound(RequestId),

    #[error("Timed out waiting for the lock on request {0}")]
    LockTimeout(RequestId),

    #[error("Cannot {operation} request {id} in state {status}")]
    InvalidState {
        id: RequestId,
        status: RequestStatus,
        operation: &'static str,
    },

    #[error("{0}")]
    Invalid(String),

    #[error("Request {0} was modified concurrently")]
    ConcurrentModification(RequestId),

    #[error(transparent)]
    Serial(#[from] SerialError),

    #[error(transparent)]
    Storage(StoreError),
}

impl QueueError {
    fn from_store(id: RequestId, e: StoreError) -> Self {
        match e {
            StoreError::ConcurrentModification { .. } => Self::ConcurrentModification(id),
            StoreError::NotFound => Self::NotFound(id),
            other => Self::Storage(other),
        }
    }
}

/// A request record together with the lock on its id. Dropping the handle
/// releases the lock.
#[derive(Debug)]
pub struct LockedRequest {
    record: DbRequest,
    /// Version as last read from or written to the store
    version: u64,
    _lock: RequestLock,
}

impl LockedRequest {
    pub fn id(&self) -> RequestId {
        self.record.id
    }

    pub fn request(&self) -> &DbRequest {
        &self.record
    }

    /// In-memory changes, persisted by [`RequestQueue::update`].
    pub fn request_mut(&mut self) -> &mut DbRequest {
        &mut self.record
    }

    pub fn into_request(self) -> DbRequest {
        self.record
    }
}

/// What happened when a request was handed to its service.
#[derive(Debug)]
pub struct ServiceReport {
    pub status: RequestStatus,
    pub result: ResultCode,
    pub error: Option<ServiceError>,
    pub timed_out: bool,
}

#[derive(Debug)]
pub enum ApprovalOutcome {
    /// Approved and handed to the service.
    Serviced(ServiceReport),
    /// Policies refused the approval; the request is still PENDING.
    PolicyRejected(Vec<String>),
}

/// Result reported by an external system for a SVC_PENDING request.
#[derive(Debug, Clone)]
pub enum ServiceCompletion {
    Success,
    Failed(String),
}

pub struct RequestQueue {
    db: Arc<dyn Storage>,
    ids: SerialAllocator,
    locks: Arc<LockTable>,
    lock_timeout: Duration,
    policies: PolicyProcessor,
    services: ServiceRegistry,
    scheduler: Arc<dyn RequestScheduler>,
    service_timeout: Duration,
    dispatcher: ListenerDispatcher,
}

pub struct QueueSettings {
    pub lock_timeout: Duration,
    pub service_timeout: Duration,
}

impl RequestQueue {
    pub fn new(
        db: Arc<dyn Storage>,
        ids: SerialAllocator,
        policies: PolicyProcessor,
        services: ServiceRegistry,
        scheduler: Arc<dyn RequestScheduler>,
        dispatcher: ListenerDispatcher,
        settings: QueueSettings,
    ) -> Self {
        Self {
            db,
            ids,
            locks: LockTable::new(),
            lock_timeout: settings.lock_timeout,
            policies,
            services,
            scheduler,
            service_timeout: settings.service_timeout,
            dispatcher,
        }
    }

    /// Number of request ids currently locked or waited on.
    pub fn locked_count(&self) -> usize {
        self.locks.len()
    }

    async fn lock(&self, id: RequestId) -> Result<RequestLock, QueueError> {
        self.locks
            .acquire(id, self.lock_timeout)
            .await
            .ok_or(QueueError::LockTimeout(id))
    }

    /// A new request in BEGIN state, already locked.
    #[instrument(skip(self))]
    pub async fn create(&self, request_type: RequestType) -> Result<LockedRequest, QueueError> {
        let id = RequestId::new(self.ids.next().await?);
        let lock = self.lock(id).await?;
        let record = RequestStore::insert(&*self.db, DbRequest::new(id, request_type))
            .await
            .map_err(|e| QueueError::from_store(id, e))?;
        debug!(request_id = %id, "Created request");
        Ok(LockedRequest {
            version: record.version,
            record,
            _lock: lock,
        })
    }

    /// Lock `id` and load it.
    #[instrument(skip(self))]
    pub async fn find(&self, id: RequestId) -> Result<LockedRequest, QueueError> {
        let lock = self.lock(id).await?;
        let record = RequestStore::get(&*self.db, id)
            .await
            .map_err(|e| QueueError::from_store(id, e))?
            .ok_or(QueueError::NotFound(id))?;
        Ok(LockedRequest {
            version: record.version,
            record,
            _lock: lock,
        })
    }

    /// Unlocked snapshot, for display only.
    pub async fn get(&self, id: RequestId) -> Result<DbRequest, QueueError> {
        RequestStore::get(&*self.db, id)
            .await
            .map_err(|e| QueueError::from_store(id, e))?
            .ok_or(QueueError::NotFound(id))
    }

    pub async fn list(
        &self,
        filter: RequestFilter,
        start: usize,
        size: usize,
    ) -> Result<Page<DbRequest>, QueueError> {
        RequestStore::list(&*self.db, filter, start, size)
            .await
            .map_err(QueueError::Storage)
    }

    /// Release the lock without persisting anything.
    pub fn release(&self, locked: LockedRequest) {
        debug!(request_id = %locked.id(), "Releasing request");
        drop(locked);
    }

    /// Write `next` over the locked record. The handle only changes once the
    /// write succeeded.
    async fn persist(&self, locked: &mut LockedRequest, mut next: DbRequest) -> Result<(), QueueError> {
        let id = locked.id();
        next.modified_at = timestamp_now();
        let stored = RequestStore::update(&*self.db, next, locked.version)
            .await
            .map_err(|e| QueueError::from_store(id, e))?;
        locked.version = stored.version;
        locked.record = stored;
        Ok(())
    }

    async fn transition(
        &self,
        locked: &mut LockedRequest,
        next: DbRequest,
    ) -> Result<(), QueueError> {
        let from = locked.record.status;
        self.persist(locked, next).await?;
        info!(
            request_id = %locked.id(),
            %from,
            to = %locked.record.status,
            result = locked.record.result.code(),
            "Request state changed"
        );
        self.dispatcher.emit(EngineEvent::RequestStateChanged {
            request: locked.record.clone(),
            from,
        });
        Ok(())
    }

    /// Persist the in-memory state of the handle. Fails with
    /// [`QueueError::ConcurrentModification`] if the stored record changed
    /// since it was loaded.
    #[instrument(skip_all, fields(request_id = %locked.id()))]
    pub async fn update(&self, locked: &mut LockedRequest) -> Result<(), QueueError> {
        let next = locked.record.clone();
        self.persist(locked, next).await?;
        self.dispatcher.emit(EngineEvent::RequestUpdated {
            request: locked.record.clone(),
        });
        Ok(())
    }

    fn clone_record(&self, source: &DbRequest, id: RequestId) -> DbRequest {
        let fresh = DbRequest::new(id, source.request_type);
        DbRequest {
            id,
            version: 0,
            status: RequestStatus::Begin,
            result: ResultCode::Pending,
            source_id: None,
            assigned_to: None,
            error_message: None,
            created_at: fresh.created_at,
            modified_at: fresh.modified_at,
            ..source.clone()
        }
    }

    /// Copy every attribute of `source` except its source id into a new
    /// BEGIN request.
    #[instrument(skip_all, fields(source = %source.id()))]
    pub async fn clone_request(&self, source: &LockedRequest) -> Result<LockedRequest, QueueError> {
        let id = RequestId::new(self.ids.next().await?);
        let lock = self.lock(id).await?;
        let record = RequestStore::insert(&*self.db, self.clone_record(&source.record, id))
            .await
            .map_err(|e| QueueError::from_store(id, e))?;
        debug!(request_id = %id, "Cloned request");
        Ok(LockedRequest {
            version: record.version,
            record,
            _lock: lock,
        })
    }

    pub async fn clone_and_mark_pending(
        &self,
        source: &LockedRequest,
    ) -> Result<LockedRequest, QueueError> {
        let mut clone = self.clone_request(source).await?;
        self.mark_pending(&mut clone).await?;
        Ok(clone)
    }

    fn expect_status(
        locked: &LockedRequest,
        status: RequestStatus,
        operation: &'static str,
    ) -> Result<(), QueueError> {
        if locked.record.status == status {
            Ok(())
        } else {
            Err(QueueError::InvalidState {
                id: locked.id(),
                status: locked.record.status,
                operation,
            })
        }
    }

    /// BEGIN -> PENDING, persisting any fields set on the handle.
    #[instrument(skip_all, fields(request_id = %locked.id()))]
    pub async fn mark_pending(&self, locked: &mut LockedRequest) -> Result<(), QueueError> {
        Self::expect_status(locked, RequestStatus::Begin, "submit")?;
        let mut next = locked.record.clone();
        next.status = RequestStatus::Pending;
        next.result = ResultCode::Pending;
        self.transition(locked, next).await
    }

    /// PENDING -> APPROVED, then run the service. Policy rejections leave the
    /// request PENDING with the messages in its error message.
    #[instrument(skip_all, fields(request_id = %locked.id(), agent = %agent))]
    pub async fn approve(
        &self,
        locked: &mut LockedRequest,
        agent: &str,
    ) -> Result<ApprovalOutcome, QueueError> {
        Self::expect_status(locked, RequestStatus::Pending, "approve")?;

        let messages = self.policies.evaluate(&locked.record);
        if !messages.is_empty() {
            let mut next = locked.record.clone();
            next.error_message = Some(messages.join("; "));
            self.persist(locked, next).await?;
            info!(request_id = %locked.id(), rejections = messages.len(), "Approval refused by policy");
            self.dispatcher.emit(EngineEvent::RequestUpdated {
                request: locked.record.clone(),
            });
            return Ok(ApprovalOutcome::PolicyRejected(messages));
        }

        let mut next = locked.record.clone();
        next.status = RequestStatus::Approved;
        next.agent = Some(agent.to_string());
        next.error_message = None;
        self.transition(locked, next).await?;

        Ok(ApprovalOutcome::Serviced(self.run_service(locked).await?))
    }

    /// PENDING -> REJECTED.
    #[instrument(skip_all, fields(request_id = %locked.id(), agent = %agent))]
    pub async fn reject(
        &self,
        locked: &mut LockedRequest,
        agent: &str,
        reason: Option<String>,
    ) -> Result<(), QueueError> {
        Self::expect_status(locked, RequestStatus::Pending, "reject")?;
        let mut next = locked.record.clone();
        next.status = RequestStatus::Rejected;
        next.result = ResultCode::Rejected;
        next.agent = Some(agent.to_string());
        next.error_message = Some(reason.unwrap_or_else(|| "Request rejected".to_string()));
        self.transition(locked, next).await
    }

    /// PENDING -> CANCELED.
    #[instrument(skip_all, fields(request_id = %locked.id(), agent = %agent))]
    pub async fn cancel(
        &self,
        locked: &mut LockedRequest,
        agent: &str,
        reason: Option<String>,
    ) -> Result<(), QueueError> {
        Self::expect_status(locked, RequestStatus::Pending, "cancel")?;
        let mut next = locked.record.clone();
        next.status = RequestStatus::Canceled;
        next.result = ResultCode::Rejected;
        next.agent = Some(agent.to_string());
        next.error_message = Some(reason.unwrap_or_else(|| "Request canceled".to_string()));
        self.transition(locked, next).await
    }

    async fn set_assignee(
        &self,
        locked: &mut LockedRequest,
        assignee: Option<String>,
        operation: &'static str,
    ) -> Result<(), QueueError> {
        Self::expect_status(locked, RequestStatus::Pending, operation)?;
        let mut next = locked.record.clone();
        next.assigned_to = assignee;
        self.persist(locked, next).await?;
        self.dispatcher.emit(EngineEvent::RequestUpdated {
            request: locked.record.clone(),
        });
        Ok(())
    }

    pub async fn assign(&self, locked: &mut LockedRequest, agent: &str) -> Result<(), QueueError> {
        self.set_assignee(locked, Some(agent.to_string()), "assign").await
    }

    pub async fn unassign(&self, locked: &mut LockedRequest) -> Result<(), QueueError> {
        self.set_assignee(locked, None, "unassign").await
    }

    /// Agent edits to a PENDING request before approval.
    #[instrument(skip_all, fields(request_id = %locked.id()))]
    pub async fn update_pending(
        &self,
        locked: &mut LockedRequest,
        changes: UpdateRequestParams,
    ) -> Result<(), QueueError> {
        Self::expect_status(locked, RequestStatus::Pending, "update")?;
        if changes.is_empty() {
            return Err(QueueError::Invalid("No changes given".into()));
        }

        let mut next = locked.record.clone();
        let edits_enrollment =
            changes.subject_dn.is_some() || changes.validity_days.is_some() || changes.dns_names.is_some();
        if edits_enrollment {
            let enrollment = next.enrollment.as_mut().ok_or_else(|| {
                QueueError::Invalid(format!(
                    "A {} request has no enrollment data to edit",
                    locked.record.request_type
                ))
            })?;
            if let Some(subject_dn) = changes.subject_dn {
                if subject_dn.trim().is_empty() {
                    return Err(QueueError::Invalid("Subject DN must not be empty".into()));
                }
                enrollment.subject_dn = subject_dn;
            }
            if let Some(days) = changes.validity_days {
                if days == 0 {
                    return Err(QueueError::Invalid("Validity must be at least one day".into()));
                }
                enrollment.validity_days = days;
            }
            if let Some(dns_names) = changes.dns_names {
                enrollment.dns_names = dns_names;
            }
        }
        for key in changes.remove_ext {
            next.ext.remove(&key);
        }
        next.ext.extend(changes.ext);

        self.persist(locked, next).await?;
        self.dispatcher.emit(EngineEvent::RequestUpdated {
            request: locked.record.clone(),
        });
        Ok(())
    }

    /// Run the service of an APPROVED request.
    pub async fn process(&self, locked: &mut LockedRequest) -> Result<ServiceReport, QueueError> {
        Self::expect_status(locked, RequestStatus::Approved, "process")?;
        self.run_service(locked).await
    }

    /// Run the service again for a request left SVC_PENDING.
    pub async fn retry_service(&self, locked: &mut LockedRequest) -> Result<ServiceReport, QueueError> {
        Self::expect_status(locked, RequestStatus::SvcPending, "retry")?;
        self.run_service(locked).await
    }

    /// SVC_PENDING -> COMPLETE with the result reported by the system the
    /// service was waiting on.
    #[instrument(skip_all, fields(request_id = %locked.id()))]
    pub async fn notify_complete(
        &self,
        locked: &mut LockedRequest,
        completion: ServiceCompletion,
    ) -> Result<(), QueueError> {
        Self::expect_status(locked, RequestStatus::SvcPending, "complete")?;
        let mut next = locked.record.clone();
        next.status = RequestStatus::Complete;
        next.ext.remove(SVC_TIMEOUT_EXT);
        match completion {
            ServiceCompletion::Success => {
                next.result = ResultCode::Success;
                next.error_message = None;
            }
            ServiceCompletion::Failed(message) => {
                next.result = ResultCode::Error;
                next.error_message = Some(message);
            }
        }
        self.transition(locked, next).await
    }

    #[instrument(skip_all, fields(request_id = %locked.id(), request_type = %locked.record.request_type))]
    async fn run_service(&self, locked: &mut LockedRequest) -> Result<ServiceReport, QueueError> {
        let mut working = locked.record.clone();
        let mut timed_out = false;

        let outcome = match self.services.get(working.request_type) {
            None => Err(ServiceError::Internal(format!(
                "No service handles {} requests",
                working.request_type
            ))),
            Some(service) => {
                let _admission = Admission::acquire(self.scheduler.clone(), working.id).await;
                match tokio::time::timeout(self.service_timeout, service.service(&mut working)).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        timed_out = true;
                        Ok(ServiceOutcome::Pending)
                    }
                }
            }
        };

        let mut error = None;
        // Fields the service changed are kept whatever the outcome.
        let mut next = working;
        match outcome {
            Ok(ServiceOutcome::Complete) => {
                next.status = RequestStatus::Complete;
                next.result = ResultCode::Success;
                next.error_message = None;
                next.ext.remove(SVC_TIMEOUT_EXT);
            }
            Ok(ServiceOutcome::Pending) => {
                next.status = RequestStatus::SvcPending;
                next.result = ResultCode::SvcPending;
                if timed_out {
                    warn!(
                        request_id = %next.id,
                        timeout_secs = self.service_timeout.as_secs(),
                        "Service timed out, request left pending"
                    );
                    next.ext.insert(
                        SVC_TIMEOUT_EXT.to_string(),
                        ExtValue::String(timestamp_now().to_rfc3339()),
                    );
                }
            }
            Err(e) => {
                let result = e.result_code();
                if result == ResultCode::Exception {
                    error!(request_id = %next.id, error = ?e, "Service failed");
                } else {
                    warn!(request_id = %next.id, error = %e, "Request could not be serviced");
                }
                next.status = RequestStatus::Complete;
                next.result = result;
                next.error_message = Some(e.to_string());
                error = Some(e);
            }
        }

        self.transition(locked, next).await?;
        Ok(ServiceReport {
            status: locked.record.status,
            result: locked.record.result,
            error,
            timed_out,
        })
    }
}
