//! Event listeners.
//!
//! Transitions hand events to [`ListenerDispatcher::emit`], which never
//! blocks: events go into a bounded channel drained by a small worker pool.
//! A full channel drops the event and counts it. Listener errors and panics
//! are logged and go no further.

use std::{
    panic::AssertUnwindSafe,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use certa_common::types::RequestStatus;
use certa_db::models::{DbCertRecord, DbRequest};
use futures::FutureExt;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

use crate::config::store::{ConfigStore, ConfigStoreError, PluginFactory, ScopedConfig};

#[derive(Debug, Clone)]
pub enum EngineEvent {
    RequestStateChanged {
        request: DbRequest,
        from: RequestStatus,
    },
    /// Persisted change that left the status alone, e.g. an assignment.
    RequestUpdated { request: DbRequest },
    CertificateIssued { cert: DbCertRecord },
    CertificateRevoked { cert: DbCertRecord },
    CertificateUnrevoked { cert: DbCertRecord },
}

impl EngineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RequestStateChanged { .. } => "request_state_changed",
            Self::RequestUpdated { .. } => "request_updated",
            Self::CertificateIssued { .. } => "certificate_issued",
            Self::CertificateRevoked { .. } => "certificate_revoked",
            Self::CertificateUnrevoked { .. } => "certificate_unrevoked",
        }
    }
}

#[async_trait]
pub trait RequestListener: Send + Sync {
    fn name(&self) -> &str;

    async fn on_event(&self, event: &EngineEvent) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
struct DispatchCounters {
    emitted: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub emitted: u64,
    pub dropped: u64,
    /// Listener invocations that returned `Ok`
    pub delivered: u64,
    /// Listener invocations that errored or panicked
    pub failed: u64,
}

#[derive(Debug, Clone)]
pub struct ListenerDispatcher {
    tx: mpsc::Sender<Arc<EngineEvent>>,
    counters: Arc<DispatchCounters>,
}

impl ListenerDispatcher {
    /// Spawn `workers` tasks consuming a channel of `capacity` events. Must be
    /// called from within a tokio runtime.
    pub fn start(
        listeners: Vec<Arc<dyn RequestListener>>,
        workers: usize,
        capacity: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Arc<EngineEvent>>(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let listeners: Arc<[Arc<dyn RequestListener>]> = listeners.into();
        let counters = Arc::new(DispatchCounters::default());

        for worker in 0..workers.max(1) {
            let rx = rx.clone();
            let listeners = listeners.clone();
            let counters = counters.clone();
            tokio::spawn(async move {
                loop {
                    let event = { rx.lock().await.recv().await };
                    let Some(event) = event else { break };
                    for listener in listeners.iter() {
                        deliver(listener.as_ref(), event.as_ref(), &counters).await;
                    }
                }
                debug!(worker, "Listener worker stopped");
            });
        }

        Self { tx, counters }
    }

    /// Queue `event` for the listeners. Never waits.
    pub fn emit(&self, event: EngineEvent) {
        self.counters.emitted.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.tx.try_send(Arc::new(event)) {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            let kind = match &e {
                mpsc::error::TrySendError::Full(event) | mpsc::error::TrySendError::Closed(event) => {
                    event.kind()
                }
            };
            warn!(kind, "Listener queue unavailable, dropping event");
        }
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            emitted: self.counters.emitted.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

async fn deliver(listener: &dyn RequestListener, event: &EngineEvent, counters: &DispatchCounters) {
    match AssertUnwindSafe(listener.on_event(event)).catch_unwind().await {
        Ok(Ok(())) => {
            counters.delivered.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Err(e)) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            error!(listener = listener.name(), kind = event.kind(), error = ?e, "Listener failed");
        }
        Err(_) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            error!(listener = listener.name(), kind = event.kind(), "Listener panicked");
        }
    }
}

const LISTENER_KINDS: &[(&str, PluginFactory<Arc<dyn RequestListener>>)] = &[
    ("audit", AuditListener::from_config),
    ("file_publisher", FilePublisher::from_config),
];

/// Build the listeners configured under `[listeners.<name>]`.
pub fn listeners_from_config(
    store: &ConfigStore,
) -> Result<Vec<Arc<dyn RequestListener>>, ConfigStoreError> {
    store.build_plugins("listeners", LISTENER_KINDS)
}

/// Writes every event to the `certa::audit` log target.
pub struct AuditListener {
    name: String,
}

impl AuditListener {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn from_config(
        name: &str,
        _config: &ScopedConfig<'_>,
    ) -> Result<Arc<dyn RequestListener>, ConfigStoreError> {
        Ok(Arc::new(Self::new(name)))
    }
}

#[async_trait]
impl RequestListener for AuditListener {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_event(&self, event: &EngineEvent) -> anyhow::Result<()> {
        match event {
            EngineEvent::RequestStateChanged { request, from } => info!(
                target: "certa::audit",
                event = event.kind(),
                request_id = %request.id,
                request_type = %request.request_type,
                from = %from,
                to = %request.status,
                result = request.result.code(),
                agent = request.agent.as_deref(),
            ),
            EngineEvent::RequestUpdated { request } => info!(
                target: "certa::audit",
                event = event.kind(),
                request_id = %request.id,
                status = %request.status,
                assigned_to = request.assigned_to.as_deref(),
            ),
            EngineEvent::CertificateIssued { cert }
            | EngineEvent::CertificateRevoked { cert }
            | EngineEvent::CertificateUnrevoked { cert } => info!(
                target: "certa::audit",
                event = event.kind(),
                serial = %cert.serial,
                subject = %cert.subject_dn,
                authority_id = %cert.authority_id,
                reason = cert.revocation.as_ref().map(|r| r.reason.as_str()),
            ),
        }
        Ok(())
    }
}

/// Publishes certificates as `<dir>/<serial>.pem` and withdraws them again
/// on revocation.
pub struct FilePublisher {
    name: String,
    dir: PathBuf,
}

impl FilePublisher {
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
        }
    }

    fn from_config(
        name: &str,
        config: &ScopedConfig<'_>,
    ) -> Result<Arc<dyn RequestListener>, ConfigStoreError> {
        let dir: PathBuf = config.get("dir")?;
        Ok(Arc::new(Self::new(name, dir)))
    }

    fn path(&self, cert: &DbCertRecord) -> PathBuf {
        self.dir.join(format!("{}.pem", cert.serial))
    }
}

#[async_trait]
impl RequestListener for FilePublisher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_event(&self, event: &EngineEvent) -> anyhow::Result<()> {
        match event {
            EngineEvent::CertificateIssued { cert } | EngineEvent::CertificateUnrevoked { cert } => {
                tokio::fs::create_dir_all(&self.dir).await?;
                tokio::fs::write(self.path(cert), &cert.cert_pem).await?;
                debug!(serial = %cert.serial, "Published certificate");
            }
            EngineEvent::CertificateRevoked { cert } => {
                match tokio::fs::remove_file(self.path(cert)).await {
                    Ok(()) => debug!(serial = %cert.serial, "Unpublished certificate"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use certa_common::ids::RequestId;
    use certa_common::types::RequestType;

    use super::*;

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

    struct Exploding;

    #[async_trait]
    impl RequestListener for Exploding {
        fn name(&self) -> &str {
            "exploding"
        }

        async fn on_event(&self, _event: &EngineEvent) -> anyhow::Result<()> {
            panic!("listener bug");
        }
    }

    fn updated() -> EngineEvent {
        EngineEvent::RequestUpdated {
            request: DbRequest::new(RequestId::new(1), RequestType::Enrollment),
        }
    }

    #[tokio::test]
    async fn panicking_listener_does_not_stop_others() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatcher =
            ListenerDispatcher::start(vec![Arc::new(Exploding), Arc::new(Recorder(tx))], 1, 8);

        dispatcher.emit(updated());
        dispatcher.emit(updated());

        for _ in 0..2 {
            let kind = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(kind, "request_updated");
        }
        assert_eq!(dispatcher.stats().failed, 2);
    }

    struct Blocking(Arc<tokio::sync::Notify>);

    #[async_trait]
    impl RequestListener for Blocking {
        fn name(&self) -> &str {
            "blocking"
        }

        async fn on_event(&self, _event: &EngineEvent) -> anyhow::Result<()> {
            self.0.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let dispatcher = ListenerDispatcher::start(vec![Arc::new(Blocking(gate.clone()))], 1, 1);

        // One event in the worker, one in the channel, the rest dropped.
        for _ in 0..5 {
            dispatcher.emit(updated());
            tokio::task::yield_now().await;
        }
        let stats = dispatcher.stats();
        assert_eq!(stats.emitted, 5);
        assert!(stats.dropped >= 3);
        gate.notify_waiters();
    }

    #[test]
    fn unknown_listener_kind_is_rejected() {
        let store = ConfigStore::from_toml("[listeners.x]\nkind = \"ldap\"\n").unwrap();
        assert!(matches!(
            listeners_from_config(&store),
            Err(ConfigStoreError::UnknownPlugin { .. })
        ));
    }

    #[test]
    fn file_publisher_needs_dir() {
        let store = ConfigStore::from_toml("[listeners.pub]\nkind = \"file_publisher\"\n").unwrap();
        assert!(matches!(
            listeners_from_config(&store),
            Err(ConfigStoreError::NotFound(_))
        ));
    }
}
