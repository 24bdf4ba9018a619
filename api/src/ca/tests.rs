use std::{
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use certa_common::{
    caller::{ApiCaller, Caller, CallerKind, Permission},
    params::{CreateAuthorityParams, EnrollmentParams, RevocationParams},
    types::{ExtValue, RequestStatus, RequestType, ResultCode, RevocationReason},
};
use certa_db::{
    models::{DbCertRecord, DbRequest},
    storage::{CertFilter, CertStore, RequestFilter, RequestStore},
};
use cms::{cert::CertificateChoices, content_info::ContentInfo, signed_data::SignedData};
use der::{Decode, Encode};
use rcgen::{CertificateParams, KeyPair};
use tokio::sync::mpsc;

use super::{
    authority::AuthorityError,
    issuance::IssuanceError,
    listener::{EngineEvent, RequestListener},
    queue::{ApprovalOutcome, QueueError, SVC_TIMEOUT_EXT, ServiceCompletion},
    service::{EnrollmentService, RequestService, ServiceError, ServiceOutcome},
    x509::{parse_dn, pem_to_der},
    *,
};

struct TestCaller {
    name: String,
    permissions: Vec<Permission>,
}

impl ApiCaller for TestCaller {
    fn kind(&self) -> CallerKind {
        CallerKind::Agent
    }

    fn id(&self) -> anyhow::Result<String> {
        Ok(self.name.clone())
    }

    fn permissions(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.permissions.iter().map(|p| p.to_string()).collect())
    }
}

fn caller(name: &str, permissions: &[Permission]) -> Caller {
    Caller::Authenticated(Arc::new(TestCaller {
        name: name.to_string(),
        permissions: permissions.to_vec(),
    }))
}

fn agent() -> Caller {
    caller(
        "agent1",
        &[
            Permission::RequestsSubmit,
            Permission::RequestsRead,
            Permission::RequestsReview,
            Permission::CertsRevoke,
            Permission::AuthoritiesWrite,
            Permission::Admin,
        ],
    )
}

fn requester() -> Caller {
    caller("alice", &[Permission::RequestsSubmit])
}

fn csr(cn: &str) -> String {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(vec![cn.to_string()]).unwrap();
    params.distinguished_name = parse_dn(&format!("CN={cn}")).unwrap();
    params.serialize_request(&key).unwrap().pem().unwrap()
}

fn enrollment(cn: &str) -> EnrollmentParams {
    EnrollmentParams {
        profile_id: "caServerCert".to_string(),
        authority_id: None,
        csr_pem: csr(cn),
        subject_dn: None,
        validity_days: None,
        dns_names: vec![cn.to_string()],
        inputs: Default::default(),
    }
}

async fn engine() -> Engine {
    engine_with("", |b| b).await
}

async fn engine_with(toml: &str, customize: impl FnOnce(EngineBuilder) -> EngineBuilder) -> Engine {
    let db: Arc<dyn Storage> = Arc::new(certa_db::storage::memory::MemoryStorage::new());
    let config = ConfigStore::from_toml(toml).unwrap();
    customize(Engine::builder(db).config(config))
        .build()
        .await
        .unwrap()
}

/// Submit and approve an enrollment, returning the issued certificate.
async fn issue(engine: &Engine, params: EnrollmentParams) -> DbCertRecord {
    let request = engine.submit_enrollment(&requester(), params).await.unwrap();
    let (request, outcome) = engine.approve_request(&agent(), request.id).await.unwrap();
    assert!(matches!(outcome, ApprovalOutcome::Serviced(_)));
    assert_eq!(request.status, RequestStatus::Complete);
    assert_eq!(request.result, ResultCode::Success);
    engine.get_cert(request.cert_serial.unwrap()).await.unwrap()
}

fn revocation(reason: RevocationReason) -> RevocationParams {
    RevocationParams {
        reason,
        invalidity_date: None,
        comment: None,
    }
}

#[tokio::test]
async fn enrollment_waits_for_agent_then_issues() {
    let engine = engine().await;

    let request = engine
        .submit_enrollment(&requester(), enrollment("host.example.com"))
        .await
        .unwrap();
    assert_eq!(request.status, RequestStatus::Pending);
    assert_eq!(request.owner.as_deref(), Some("alice"));
    assert!(request.cert_serial.is_none());

    let (request, _) = engine.approve_request(&agent(), request.id).await.unwrap();
    assert_eq!(request.status, RequestStatus::Complete);
    assert_eq!(request.agent.as_deref(), Some("agent1"));

    let cert = engine.get_cert(request.cert_serial.unwrap()).await.unwrap();
    assert_eq!(cert.subject_dn, "CN=host.example.com");
    assert_eq!(cert.request_id, Some(request.id));
    assert_eq!(cert.authority_id, engine.authorities().host_id());
    assert_eq!(engine.stats().locked_requests, 0);
}

#[tokio::test]
async fn transitions_from_wrong_state_leave_status_unchanged() {
    let engine = engine().await;
    let request = engine
        .submit_enrollment(&requester(), enrollment("a.example.com"))
        .await
        .unwrap();
    engine
        .reject_request(&agent(), request.id, Some("No".into()))
        .await
        .unwrap();

    for result in [
        engine.approve_request(&agent(), request.id).await.map(|_| ()),
        engine.reject_request(&agent(), request.id, None).await.map(|_| ()),
        engine.cancel_request(&agent(), request.id, None).await.map(|_| ()),
    ] {
        assert!(matches!(
            result,
            Err(EngineError::Queue(QueueError::InvalidState {
                status: RequestStatus::Rejected,
                ..
            }))
        ));
    }

    let stored = engine.get_request(&agent(), request.id).await.unwrap();
    assert_eq!(stored.status, RequestStatus::Rejected);
    assert_eq!(stored.result, ResultCode::Rejected);
    assert_eq!(stored.error_message.as_deref(), Some("No"));
}

#[tokio::test]
async fn cancel_uses_default_message() {
    let engine = engine().await;
    let request = engine
        .submit_enrollment(&requester(), enrollment("a.example.com"))
        .await
        .unwrap();
    let canceled = engine.cancel_request(&agent(), request.id, None).await.unwrap();
    assert_eq!(canceled.status, RequestStatus::Canceled);
    assert_eq!(canceled.error_message.as_deref(), Some("Request canceled"));
}

#[tokio::test]
async fn released_request_reads_back_identically() {
    let engine = engine().await;
    let queue = engine.queue();

    let mut locked = queue.create(RequestType::Enrollment).await.unwrap();
    locked.request_mut().owner = Some("alice".into());
    locked
        .request_mut()
        .ext
        .insert("note".into(), ExtValue::String("hello".into()));
    locked
        .request_mut()
        .ext
        .insert("attempts".into(), ExtValue::Int(3));
    queue.update(&mut locked).await.unwrap();
    let snapshot = locked.request().clone();
    let id = locked.id();
    queue.release(locked);

    let found = queue.find(id).await.unwrap();
    assert_eq!(found.request(), &snapshot);
}

#[tokio::test]
async fn clone_keeps_attributes_but_not_source_id() {
    let engine = engine().await;
    let queue = engine.queue();

    let mut source = queue.create(RequestType::Enrollment).await.unwrap();
    source.request_mut().owner = Some("alice".into());
    source.request_mut().source_id = Some("ticket-42".into());
    source.request_mut().profile_id = Some("caServerCert".into());
    queue.update(&mut source).await.unwrap();

    let clone = queue.clone_and_mark_pending(&source).await.unwrap();
    assert_ne!(clone.id(), source.id());
    assert_eq!(clone.request().status, RequestStatus::Pending);
    assert_eq!(clone.request().owner.as_deref(), Some("alice"));
    assert_eq!(clone.request().profile_id.as_deref(), Some("caServerCert"));
    assert!(clone.request().source_id.is_none());
    assert!(!clone.request().status.is_terminal());

    // The source is untouched.
    assert_eq!(source.request().status, RequestStatus::Begin);
    assert_eq!(source.request().source_id.as_deref(), Some("ticket-42"));
}

#[tokio::test]
async fn held_lock_times_out_other_callers() {
    let engine = engine_with("[queue]\nlock_timeout_ms = 50\n", |b| b).await;
    let request = engine
        .submit_enrollment(&requester(), enrollment("a.example.com"))
        .await
        .unwrap();

    let held = engine.queue().find(request.id).await.unwrap();
    assert_eq!(engine.stats().locked_requests, 1);
    assert!(matches!(
        engine.approve_request(&agent(), request.id).await,
        Err(EngineError::Queue(QueueError::LockTimeout(_)))
    ));

    drop(held);
    assert_eq!(engine.stats().locked_requests, 0);
    engine.approve_request(&agent(), request.id).await.unwrap();
}

#[tokio::test]
async fn requester_cannot_approve_or_read_others() {
    let engine = engine().await;
    let request = engine
        .submit_enrollment(&requester(), enrollment("a.example.com"))
        .await
        .unwrap();

    assert!(matches!(
        engine.approve_request(&requester(), request.id).await,
        Err(EngineError::Caller(_))
    ));
    assert!(engine.get_request(&requester(), request.id).await.is_ok());

    let bob = caller("bob", &[Permission::RequestsSubmit]);
    assert!(matches!(
        engine.get_request(&bob, request.id).await,
        Err(EngineError::Caller(_))
    ));
    assert!(matches!(
        engine.get_request(&Caller::Unauthenticated, request.id).await,
        Err(EngineError::Caller(_))
    ));
}

#[tokio::test]
async fn invalid_enrollment_creates_no_request() {
    let engine = engine().await;

    let mut bad_csr = enrollment("a.example.com");
    bad_csr.csr_pem = "not a csr".into();
    assert!(matches!(
        engine.submit_enrollment(&requester(), bad_csr).await,
        Err(EngineError::BadRequest(_))
    ));

    let mut unknown_profile = enrollment("a.example.com");
    unknown_profile.profile_id = "nope".into();
    assert!(matches!(
        engine.submit_enrollment(&requester(), unknown_profile).await,
        Err(EngineError::Profile(_))
    ));

    let page = engine
        .list_requests(&agent(), RequestFilter::default(), 0, 20)
        .await
        .unwrap();
    assert_eq!(page.total, 0);
}

#[tokio::test]
async fn auto_approved_profile_issues_on_submission() {
    let toml = r#"
        [[profiles]]
        id = "autoServer"
        name = "Automatic server certificates"
        auto_approve = true
        key_usages = ["digital_signature"]
        ext_key_usages = ["server_auth"]
    "#;
    let engine = engine_with(toml, |b| b).await;

    let mut params = enrollment("auto.example.com");
    params.profile_id = "autoServer".into();
    let request = engine.submit_enrollment(&requester(), params).await.unwrap();

    assert_eq!(request.status, RequestStatus::Complete);
    assert_eq!(request.agent.as_deref(), Some(Caller::SYSTEM_NAME));
    assert!(request.cert_serial.is_some());
}

#[tokio::test]
async fn policy_rejection_keeps_request_pending() {
    let toml = r#"
        [policies.short]
        kind = "max_validity"
        max_days = 30
    "#;
    let engine = engine_with(toml, |b| b).await;
    let request = engine
        .submit_enrollment(&requester(), enrollment("a.example.com"))
        .await
        .unwrap();

    let (rejected, outcome) = engine.approve_request(&agent(), request.id).await.unwrap();
    let ApprovalOutcome::PolicyRejected(messages) = outcome else {
        panic!("expected a policy rejection");
    };
    assert_eq!(messages.len(), 1);
    assert_eq!(rejected.status, RequestStatus::Pending);
    assert_eq!(rejected.error_message, Some(messages.join("; ")));

    engine
        .update_request(
            &agent(),
            request.id,
            certa_common::params::UpdateRequestParams {
                validity_days: Some(30),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let (approved, outcome) = engine.approve_request(&agent(), request.id).await.unwrap();
    assert!(matches!(outcome, ApprovalOutcome::Serviced(_)));
    assert_eq!(approved.status, RequestStatus::Complete);
    assert!(approved.error_message.is_none());
}

struct SlowService;

#[async_trait]
impl RequestService for SlowService {
    fn request_type(&self) -> RequestType {
        RequestType::Enrollment
    }

    async fn service(&self, _request: &mut DbRequest) -> Result<ServiceOutcome, ServiceError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(ServiceOutcome::Complete)
    }
}

#[tokio::test]
async fn timed_out_service_leaves_request_svc_pending() {
    let engine = engine_with("[queue]\nservice_timeout_secs = 1\n", |b| {
        b.service(Arc::new(SlowService))
    })
    .await;
    let request = engine
        .submit_enrollment(&requester(), enrollment("slow.example.com"))
        .await
        .unwrap();

    let (request, outcome) = engine.approve_request(&agent(), request.id).await.unwrap();
    let ApprovalOutcome::Serviced(report) = outcome else {
        panic!("expected the service to run");
    };
    assert!(report.timed_out);
    assert_eq!(request.status, RequestStatus::SvcPending);
    assert_eq!(request.result, ResultCode::SvcPending);
    assert!(request.ext.contains_key(SVC_TIMEOUT_EXT));

    let done = engine
        .complete_request(&agent(), request.id, ServiceCompletion::Failed("KRA unreachable".into()))
        .await
        .unwrap();
    assert_eq!(done.status, RequestStatus::Complete);
    assert_eq!(done.result, ResultCode::Error);
    assert!(!done.ext.contains_key(SVC_TIMEOUT_EXT));
}

/// Issues through the standard enrollment service, then stalls past the
/// service timeout on its first run only.
struct StallsAfterIssuing {
    inner: OnceLock<EnrollmentService>,
    stalled: AtomicBool,
}

#[async_trait]
impl RequestService for StallsAfterIssuing {
    fn request_type(&self) -> RequestType {
        RequestType::Enrollment
    }

    async fn service(&self, request: &mut DbRequest) -> Result<ServiceOutcome, ServiceError> {
        let inner = self
            .inner
            .get()
            .ok_or_else(|| ServiceError::Internal("enrollment service not set".into()))?;
        let outcome = inner.service(request).await?;
        if !self.stalled.swap(true, Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        Ok(outcome)
    }
}

#[tokio::test]
async fn retry_after_timeout_keeps_the_certificate_already_issued() {
    let stalling = Arc::new(StallsAfterIssuing {
        inner: OnceLock::new(),
        stalled: AtomicBool::new(false),
    });
    let engine = engine_with("[queue]\nservice_timeout_secs = 1\n", |b| {
        b.service(stalling.clone())
    })
    .await;
    let _ = stalling.inner.set(EnrollmentService::new(
        engine.issuance.clone(),
        engine.profiles.clone(),
    ));

    let request = engine
        .submit_enrollment(&requester(), enrollment("slow.example.com"))
        .await
        .unwrap();
    let (request, _) = engine.approve_request(&agent(), request.id).await.unwrap();
    assert_eq!(request.status, RequestStatus::SvcPending);
    assert!(request.ext.contains_key(SVC_TIMEOUT_EXT));

    let (request, report) = engine.retry_request(&agent(), request.id).await.unwrap();
    assert!(!report.timed_out);
    assert!(report.error.is_none());
    assert_eq!(request.status, RequestStatus::Complete);
    assert_eq!(request.result, ResultCode::Success);
    assert!(!request.ext.contains_key(SVC_TIMEOUT_EXT));

    let filter = CertFilter {
        request_id: Some(request.id),
        ..Default::default()
    };
    let issued = engine.list_certs(filter, 0, 20).await.unwrap();
    assert_eq!(issued.total, 1);
    assert_eq!(request.cert_serial, Some(issued.items[0].serial));
}

#[tokio::test]
async fn retry_runs_the_service_of_a_request_stuck_approved() {
    let engine = engine().await;
    let request = engine
        .submit_enrollment(&requester(), enrollment("stuck.example.com"))
        .await
        .unwrap();
    assert!(matches!(
        engine.retry_request(&agent(), request.id).await,
        Err(EngineError::Queue(QueueError::InvalidState { operation: "retry", .. }))
    ));

    let mut locked = engine.queue.find(request.id).await.unwrap();
    locked.request_mut().status = RequestStatus::Approved;
    locked.request_mut().agent = Some("agent1".into());
    engine.queue.update(&mut locked).await.unwrap();
    engine.queue.release(locked);

    let (request, report) = engine.retry_request(&agent(), request.id).await.unwrap();
    assert!(report.error.is_none());
    assert_eq!(request.status, RequestStatus::Complete);
    assert_eq!(request.result, ResultCode::Success);
    let cert = engine.get_cert(request.cert_serial.unwrap()).await.unwrap();
    assert_eq!(cert.subject_dn, "CN=stuck.example.com");
    assert_eq!(cert.request_id, Some(request.id));

    assert!(matches!(
        engine.retry_request(&agent(), request.id).await,
        Err(EngineError::Queue(QueueError::InvalidState { .. }))
    ));
}

#[tokio::test]
async fn assignment_only_applies_to_pending_requests() {
    let engine = engine().await;
    let request = engine
        .submit_enrollment(&requester(), enrollment("a.example.com"))
        .await
        .unwrap();

    assert!(matches!(
        engine.assign_request(&requester(), request.id).await,
        Err(EngineError::Caller(_))
    ));
    let assigned = engine.assign_request(&agent(), request.id).await.unwrap();
    assert_eq!(assigned.assigned_to.as_deref(), Some("agent1"));
    assert_eq!(assigned.status, RequestStatus::Pending);
    let unassigned = engine.unassign_request(&agent(), request.id).await.unwrap();
    assert!(unassigned.assigned_to.is_none());

    engine.approve_request(&agent(), request.id).await.unwrap();
    assert!(matches!(
        engine.assign_request(&agent(), request.id).await,
        Err(EngineError::Queue(QueueError::InvalidState { operation: "assign", .. }))
    ));
    assert!(matches!(
        engine.unassign_request(&agent(), request.id).await,
        Err(EngineError::Queue(QueueError::InvalidState { operation: "unassign", .. }))
    ));
}

#[tokio::test]
async fn stale_handle_is_refused_as_concurrent_modification() {
    let engine = engine().await;
    let request = engine
        .submit_enrollment(&requester(), enrollment("a.example.com"))
        .await
        .unwrap();
    let mut locked = engine.queue.find(request.id).await.unwrap();

    let mut elsewhere = locked.request().clone();
    elsewhere.assigned_to = Some("agent2".into());
    RequestStore::update(&*engine.db, elsewhere, locked.request().version)
        .await
        .unwrap();

    locked
        .request_mut()
        .ext
        .insert("note".into(), ExtValue::String("late edit".into()));
    assert!(matches!(
        engine.queue.update(&mut locked).await,
        Err(QueueError::ConcurrentModification(id)) if id == request.id
    ));
    assert_eq!(locked.request().version, request.version);
    engine.queue.release(locked);

    let stored = engine.queue.get(request.id).await.unwrap();
    assert_eq!(stored.assigned_to.as_deref(), Some("agent2"));
    assert!(!stored.ext.contains_key("note"));
}

struct Recorder(mpsc::UnboundedSender<&'static str>);

#[async_trait]
impl RequestListener for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn on_event(&self, event: &EngineEvent) -> anyhow::Result<()> {
        let _ = self.0.send(event.kind());
        Ok(())
    }
}

struct Broken;

#[async_trait]
impl RequestListener for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    async fn on_event(&self, _event: &EngineEvent) -> anyhow::Result<()> {
        panic!("listener bug");
    }
}

#[tokio::test]
async fn failing_listener_does_not_affect_requests() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let engine = engine_with("", |b| {
        b.listener(Arc::new(Broken))
            .listener(Arc::new(Recorder(tx)))
    })
    .await;

    issue(&engine, enrollment("a.example.com")).await;

    let mut kinds = Vec::new();
    while !kinds.contains(&"certificate_issued") {
        let kind = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        kinds.push(kind);
    }
    assert!(kinds.contains(&"request_state_changed"));
    assert!(engine.stats().listeners.failed > 0);
}

#[tokio::test]
async fn revoking_twice_with_same_reason_changes_nothing() {
    let engine = engine().await;
    let cert = issue(&engine, enrollment("a.example.com")).await;

    let first = engine
        .revoke_certificate(&agent(), cert.serial, revocation(RevocationReason::KeyCompromise))
        .await
        .unwrap();
    let first_info = first.revocation.clone().unwrap();
    assert_eq!(first_info.revoked_by, "agent1");

    let other_agent = caller("agent2", &[Permission::CertsRevoke]);
    let second = engine
        .revoke_certificate(&other_agent, cert.serial, revocation(RevocationReason::KeyCompromise))
        .await
        .unwrap();
    let second_info = second.revocation.unwrap();
    assert_eq!(second_info.revoked_on, first_info.revoked_on);
    assert_eq!(second_info.revoked_by, first_info.revoked_by);
    assert_eq!(second.version, first.version);
}

#[tokio::test]
async fn hold_can_be_lifted_or_made_final() {
    let engine = engine().await;
    let cert = issue(&engine, enrollment("a.example.com")).await;

    engine
        .revoke_certificate(&agent(), cert.serial, revocation(RevocationReason::CertificateHold))
        .await
        .unwrap();
    let valid = engine.unrevoke_certificate(&agent(), cert.serial).await.unwrap();
    assert!(valid.revocation.is_none());

    let held = engine
        .revoke_certificate(&agent(), cert.serial, revocation(RevocationReason::CertificateHold))
        .await
        .unwrap();
    let compromised = engine
        .revoke_certificate(&agent(), cert.serial, revocation(RevocationReason::KeyCompromise))
        .await
        .unwrap();
    assert_eq!(
        compromised.revocation.as_ref().unwrap().revoked_on,
        held.revocation.as_ref().unwrap().revoked_on
    );

    assert!(matches!(
        engine.unrevoke_certificate(&agent(), cert.serial).await,
        Err(EngineError::Service(ServiceError::Issuance(
            IssuanceError::ConflictingOperation(_)
        )))
    ));
    assert!(matches!(
        engine
            .revoke_certificate(&agent(), cert.serial, revocation(RevocationReason::Superseded))
            .await,
        Err(EngineError::Service(ServiceError::Issuance(
            IssuanceError::ConflictingOperation(_)
        )))
    ));
}

#[tokio::test]
async fn remove_from_crl_is_not_a_revocation_reason() {
    let engine = engine().await;
    let cert = issue(&engine, enrollment("a.example.com")).await;

    assert!(matches!(
        engine
            .revoke_certificate(&agent(), cert.serial, revocation(RevocationReason::RemoveFromCrl))
            .await,
        Err(EngineError::Issuance(IssuanceError::InvalidReason(
            RevocationReason::RemoveFromCrl
        )))
    ));
    let unchanged = engine.get_cert(cert.serial).await.unwrap();
    assert!(unchanged.revocation.is_none());
    assert_eq!(unchanged.version, cert.version);

    let held = engine
        .revoke_certificate(&agent(), cert.serial, revocation(RevocationReason::CertificateHold))
        .await
        .unwrap();
    assert!(matches!(
        engine
            .revoke_certificate(&agent(), cert.serial, revocation(RevocationReason::RemoveFromCrl))
            .await,
        Err(EngineError::Issuance(IssuanceError::InvalidReason(_)))
    ));
    let still_held = engine.get_cert(cert.serial).await.unwrap();
    assert_eq!(
        still_held.revocation.map(|r| r.reason),
        Some(RevocationReason::CertificateHold)
    );
    assert_eq!(still_held.version, held.version);
}

#[tokio::test]
async fn revoking_unknown_serial_is_not_found() {
    let engine = engine().await;
    assert!(matches!(
        engine
            .revoke_certificate(
                &agent(),
                certa_common::ids::SerialNumber::new(0xdead),
                revocation(RevocationReason::Unspecified)
            )
            .await,
        Err(EngineError::Issuance(IssuanceError::NotFound(_)))
    ));
}

#[tokio::test]
async fn listing_reports_total_of_matches() {
    let engine = engine().await;
    for i in 0..5 {
        issue(&engine, enrollment(&format!("host{i}.example.com"))).await;
    }

    let filter = CertFilter {
        issued_by: Some("agent1".into()),
        ..Default::default()
    };
    let page = engine.list_certs(filter.clone(), 0, 20).await.unwrap();
    assert_eq!(page.items.len(), 5);
    assert_eq!(page.total, 5);

    let search = engine
        .search_certs(filter.clone(), 0, 3, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(search.items.len(), 3);
    assert_eq!(search.total, 5);
    assert!(search.truncated);

    let rest = engine
        .search_certs(filter.clone(), 3, 3, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(rest.items.len(), 2);
    assert_eq!(rest.total, 5);
    assert!(!rest.truncated);
    assert!(rest.items[0].serial > search.items[2].serial);

    let beyond = engine
        .search_certs(filter, usize::MAX, 3, Duration::from_secs(5))
        .await
        .unwrap();
    assert!(beyond.items.is_empty());
    assert_eq!(beyond.total, 5);
}

async fn sub_authority(engine: &Engine, dn: &str) -> DbAuthority {
    engine
        .create_authority(
            &agent(),
            CreateAuthorityParams {
                parent_id: None,
                dn: dn.to_string(),
                description: Some("Test sub-CA".into()),
            },
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn enrollment_against_disabled_sub_authority_is_a_conflict() {
    let engine = engine().await;
    let sub = sub_authority(&engine, "CN=Sub CA,O=Example").await;
    engine
        .set_authority_enabled(&agent(), sub.id, false)
        .await
        .unwrap();

    let certs_before = engine
        .list_certs(CertFilter::default(), 0, 20)
        .await
        .unwrap()
        .total;

    let mut params = enrollment("a.example.com");
    params.authority_id = Some(sub.id.to_string());
    assert!(matches!(
        engine.submit_enrollment(&requester(), params).await,
        Err(EngineError::Authority(AuthorityError::Disabled(_)))
    ));

    let requests = engine
        .list_requests(&agent(), RequestFilter::default(), 0, 20)
        .await
        .unwrap();
    assert_eq!(requests.total, 0);
    let certs = engine.list_certs(CertFilter::default(), 0, 20).await.unwrap();
    assert_eq!(certs.total, certs_before);
}

#[tokio::test]
async fn authority_disabled_after_submission_fails_the_service() {
    let engine = engine().await;
    let sub = sub_authority(&engine, "CN=Sub CA,O=Example").await;

    let mut params = enrollment("a.example.com");
    params.authority_id = Some(sub.id.to_string());
    let request = engine.submit_enrollment(&requester(), params).await.unwrap();
    engine
        .set_authority_enabled(&agent(), sub.id, false)
        .await
        .unwrap();

    let (request, outcome) = engine.approve_request(&agent(), request.id).await.unwrap();
    let ApprovalOutcome::Serviced(report) = outcome else {
        panic!("expected the service to run");
    };
    assert!(matches!(
        report.error,
        Some(ServiceError::Issuance(IssuanceError::Authority(AuthorityError::Disabled(_))))
    ));
    assert_eq!(request.status, RequestStatus::Complete);
    assert_eq!(request.result, ResultCode::Error);
    assert!(request.cert_serial.is_none());

    let filter = CertFilter {
        authority_id: Some(sub.id),
        ..Default::default()
    };
    assert_eq!(engine.list_certs(filter, 0, 20).await.unwrap().total, 0);
}

#[tokio::test]
async fn revocation_routes_to_the_issuing_sub_authority() {
    let engine = engine().await;
    let sub = sub_authority(&engine, "CN=Sub CA,O=Example").await;

    let mut params = enrollment("a.example.com");
    params.authority_id = Some(sub.id.to_string());
    let cert = issue(&engine, params).await;
    assert_eq!(cert.authority_id, sub.id);

    let host = engine.authorities().host().unwrap();
    assert_ne!(
        cert.authority_key_id.as_deref(),
        Some(host.record.subject_key_id.as_str())
    );

    let revoked = engine
        .revoke_certificate(&agent(), cert.serial, revocation(RevocationReason::Superseded))
        .await
        .unwrap();
    assert_eq!(revoked.revocation.unwrap().reason, RevocationReason::Superseded);

    let crl = engine.authority_crl(sub.id).await.unwrap();
    assert!(crl.starts_with("-----BEGIN X509 CRL-----"));
}

#[tokio::test]
async fn chain_carries_leaf_and_every_issuer() {
    let engine = engine().await;
    let sub = sub_authority(&engine, "CN=Sub CA,O=Example").await;
    let mut params = enrollment("a.example.com");
    params.authority_id = Some(sub.id.to_string());
    let cert = issue(&engine, params).await;

    let (record, der) = engine.get_cert_with_chain(cert.serial).await.unwrap();
    assert_eq!(record.serial, cert.serial);

    let info = ContentInfo::from_der(&der).unwrap();
    let signed: SignedData = info.content.decode_as().unwrap();
    let carried: Vec<Vec<u8>> = signed
        .certificates
        .unwrap()
        .0
        .iter()
        .map(|choice| match choice {
            CertificateChoices::Certificate(c) => c.to_der().unwrap(),
            _ => panic!("expected plain certificates only"),
        })
        .collect();
    assert_eq!(carried.len(), 3);

    let host = engine.authorities().host().unwrap();
    for pem in [&cert.cert_pem, &sub.cert_pem, &host.record.cert_pem] {
        let expected = pem_to_der(pem, "CERTIFICATE").unwrap();
        assert!(carried.contains(&expected));
    }
}

#[tokio::test]
async fn crl_is_reused_until_revocations_change() {
    let engine = engine().await;
    let host = engine.authorities().host_id();
    let cert = issue(&engine, enrollment("a.example.com")).await;

    let first = engine.authority_crl(host).await.unwrap();
    let again = engine.authority_crl(host).await.unwrap();
    assert_eq!(first, again);

    engine
        .revoke_certificate(&agent(), cert.serial, revocation(RevocationReason::CertificateHold))
        .await
        .unwrap();
    let after_hold = engine.authority_crl(host).await.unwrap();
    assert_ne!(after_hold, first);
    assert_eq!(engine.authority_crl(host).await.unwrap(), after_hold);

    // Repeating the same revocation changes nothing on the CRL either.
    engine
        .revoke_certificate(&agent(), cert.serial, revocation(RevocationReason::CertificateHold))
        .await
        .unwrap();
    assert_eq!(engine.authority_crl(host).await.unwrap(), after_hold);

    engine.unrevoke_certificate(&agent(), cert.serial).await.unwrap();
    assert_ne!(engine.authority_crl(host).await.unwrap(), after_hold);
}

#[tokio::test]
async fn revocation_without_matching_authority_fails_to_route() {
    let engine = engine().await;
    let cert = issue(&engine, enrollment("a.example.com")).await;

    let mut orphan = cert.clone();
    orphan.serial = certa_common::ids::SerialNumber::new(0xfff0);
    orphan.version = 0;
    orphan.authority_key_id = Some("00ff00ff".into());
    CertStore::insert(&*engine.db, orphan.clone()).await.unwrap();

    let result = engine
        .revoke_certificate(&agent(), orphan.serial, revocation(RevocationReason::KeyCompromise))
        .await;
    assert!(matches!(
        result,
        Err(EngineError::Service(ServiceError::Issuance(IssuanceError::Authority(
            AuthorityError::Routing(_)
        ))))
    ));
    assert!(engine.get_cert(orphan.serial).await.unwrap().revocation.is_none());
}

#[tokio::test]
async fn renewal_reuses_original_enrollment() {
    let engine = engine().await;
    let cert = issue(&engine, enrollment("a.example.com")).await;

    let renewal = engine.submit_renewal(&requester(), cert.serial).await.unwrap();
    assert_eq!(renewal.request_type, RequestType::Renewal);
    assert_eq!(renewal.target_serial, Some(cert.serial));
    assert_eq!(renewal.status, RequestStatus::Pending);

    let (renewal, _) = engine.approve_request(&agent(), renewal.id).await.unwrap();
    let renewed = engine.get_cert(renewal.cert_serial.unwrap()).await.unwrap();
    assert_ne!(renewed.serial, cert.serial);
    assert_eq!(renewed.subject_dn, cert.subject_dn);

    let bob = caller("bob", &[Permission::RequestsSubmit]);
    assert!(matches!(
        engine.submit_renewal(&bob, cert.serial).await,
        Err(EngineError::Caller(_))
    ));
}

#[tokio::test]
async fn serial_ranges_can_be_moved_forward_only() {
    let engine = engine().await;
    issue(&engine, enrollment("a.example.com")).await;

    let range = engine.serial_range(&agent(), CERT_COUNTER).await.unwrap();
    assert_eq!(range.next, 2);

    assert!(matches!(
        engine.reset_serial_range(&agent(), CERT_COUNTER, 1, 100).await,
        Err(EngineError::Serial(_))
    ));
    let moved = engine
        .reset_serial_range(&agent(), CERT_COUNTER, 0x1000, 0x2000)
        .await
        .unwrap();
    assert_eq!(moved.next, 0x1000);

    let cert = issue(&engine, enrollment("b.example.com")).await;
    assert_eq!(cert.serial.get(), 0x1000);

    assert!(matches!(
        engine.serial_range(&agent(), "bogus").await,
        Err(EngineError::UnknownCounter(_))
    ));
    assert!(matches!(
        engine.serial_range(&requester(), REQUEST_COUNTER).await,
        Err(EngineError::Caller(_))
    ));
}
