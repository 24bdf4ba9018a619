//! In-process storage backend. Used by tests and for running the API without
//! a database; nothing survives a restart.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use certa_common::ids::{AuthorityId, RequestId, SerialNumber};
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tracing::instrument;

use crate::{
    models::{DbAuthority, DbCertRecord, DbRequest, DbSerialRange},
    storage::{
        AuthorityStore, CertFilter, CertStore, Page, RequestFilter, RequestStore, SerialStore,
        Storage, StoreError, check_range,
    },
};

#[derive(Debug, Default)]
pub struct MemoryStorage {
    requests: RwLock<BTreeMap<RequestId, DbRequest>>,
    certs: RwLock<BTreeMap<SerialNumber, DbCertRecord>>,
    authorities: RwLock<BTreeMap<AuthorityId, DbAuthority>>,
    ranges: Mutex<HashMap<String, DbSerialRange>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn paginate<T: Clone>(matches: Vec<&T>, start: usize, size: usize) -> Page<T> {
    let total = matches.len() as u64;
    let items = matches.into_iter().skip(start).take(size).cloned().collect();
    Page { items, total }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl RequestStore for MemoryStorage {
    #[instrument(skip(self, request), fields(request_id = %request.id))]
    async fn insert(&self, request: DbRequest) -> Result<DbRequest, StoreError> {
        let mut requests = self.requests.write().await;
        if requests.contains_key(&request.id) {
            return Err(StoreError::AlreadyExists(request.id.to_string()));
        }
        requests.insert(request.id, request.clone());
        Ok(request)
    }

    async fn get(&self, id: RequestId) -> Result<Option<DbRequest>, StoreError> {
        Ok(self.requests.read().await.get(&id).cloned())
    }

    #[instrument(skip(self, request), fields(request_id = %request.id))]
    async fn update(
        &self,
        mut request: DbRequest,
        expected_version: u64,
    ) -> Result<DbRequest, StoreError> {
        let mut requests = self.requests.write().await;
        let stored = requests.get_mut(&request.id).ok_or(StoreError::NotFound)?;
        if stored.version != expected_version {
            return Err(StoreError::ConcurrentModification {
                id: request.id.to_string(),
                expected: expected_version,
            });
        }
        request.version = expected_version + 1;
        *stored = request.clone();
        Ok(request)
    }

    async fn list(
        &self,
        filter: RequestFilter,
        start: usize,
        size: usize,
    ) -> Result<Page<DbRequest>, StoreError> {
        let requests = self.requests.read().await;
        let matches = requests.values().filter(|r| filter.matches(r)).collect();
        Ok(paginate(matches, start, size))
    }
}

#[async_trait]
impl CertStore for MemoryStorage {
    #[instrument(skip(self, cert), fields(serial = %cert.serial))]
    async fn insert(&self, cert: DbCertRecord) -> Result<DbCertRecord, StoreError> {
        let mut certs = self.certs.write().await;
        if certs.contains_key(&cert.serial) {
            return Err(StoreError::AlreadyExists(cert.serial.to_string()));
        }
        certs.insert(cert.serial, cert.clone());
        Ok(cert)
    }

    async fn get(&self, serial: SerialNumber) -> Result<Option<DbCertRecord>, StoreError> {
        Ok(self.certs.read().await.get(&serial).cloned())
    }

    #[instrument(skip(self, cert), fields(serial = %cert.serial))]
    async fn update(
        &self,
        mut cert: DbCertRecord,
        expected_version: u64,
    ) -> Result<DbCertRecord, StoreError> {
        let mut certs = self.certs.write().await;
        let stored = certs.get_mut(&cert.serial).ok_or(StoreError::NotFound)?;
        if stored.version != expected_version {
            return Err(StoreError::ConcurrentModification {
                id: cert.serial.to_string(),
                expected: expected_version,
            });
        }
        cert.version = expected_version + 1;
        *stored = cert.clone();
        Ok(cert)
    }

    async fn list(
        &self,
        filter: CertFilter,
        start: usize,
        size: usize,
    ) -> Result<Page<DbCertRecord>, StoreError> {
        let now = Utc::now();
        let certs = self.certs.read().await;
        let matches = certs.values().filter(|c| filter.matches(c, now)).collect();
        Ok(paginate(matches, start, size))
    }
}

#[async_trait]
impl AuthorityStore for MemoryStorage {
    async fn insert(&self, authority: DbAuthority) -> Result<DbAuthority, StoreError> {
        let mut authorities = self.authorities.write().await;
        if authorities.contains_key(&authority.id) {
            return Err(StoreError::AlreadyExists(authority.id.to_string()));
        }
        authorities.insert(authority.id, authority.clone());
        Ok(authority)
    }

    async fn get(&self, id: AuthorityId) -> Result<Option<DbAuthority>, StoreError> {
        Ok(self.authorities.read().await.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<DbAuthority>, StoreError> {
        Ok(self.authorities.read().await.values().cloned().collect())
    }

    async fn update(&self, authority: DbAuthority) -> Result<DbAuthority, StoreError> {
        let mut authorities = self.authorities.write().await;
        let stored = authorities
            .get_mut(&authority.id)
            .ok_or(StoreError::NotFound)?;
        *stored = authority.clone();
        Ok(authority)
    }

    async fn delete(&self, id: AuthorityId) -> Result<(), StoreError> {
        self.authorities
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }
}

#[async_trait]
impl SerialStore for MemoryStorage {
    async fn next(&self, name: &str) -> Result<u64, StoreError> {
        let mut ranges = self.ranges.lock().await;
        let range = ranges
            .get_mut(name)
            .ok_or_else(|| StoreError::RangeNotConfigured(name.to_string()))?;
        if range.next > range.end {
            return Err(StoreError::RangeExhausted {
                name: name.to_string(),
                end: range.end,
            });
        }
        let value = range.next;
        range.next += 1;
        Ok(value)
    }

    async fn get_range(&self, name: &str) -> Result<Option<DbSerialRange>, StoreError> {
        Ok(self.ranges.lock().await.get(name).cloned())
    }

    async fn init_range(
        &self,
        name: &str,
        start: u64,
        end: u64,
    ) -> Result<DbSerialRange, StoreError> {
        let mut ranges = self.ranges.lock().await;
        if let Some(existing) = ranges.get(name) {
            return Ok(existing.clone());
        }
        check_range(name, start, end, None)?;
        let range = DbSerialRange::new(name, start, end);
        ranges.insert(name.to_string(), range.clone());
        Ok(range)
    }

    async fn reset_range(
        &self,
        name: &str,
        start: u64,
        end: u64,
    ) -> Result<DbSerialRange, StoreError> {
        let mut ranges = self.ranges.lock().await;
        check_range(name, start, end, ranges.get(name))?;
        let range = DbSerialRange::new(name, start, end);
        ranges.insert(name.to_string(), range.clone());
        Ok(range)
    }
}

#[cfg(test)]
mod test {
    use std::{collections::HashSet, sync::Arc};

    use certa_common::types::{CertStatus, RequestStatus, RequestType};
    use chrono::Duration;

    use super::*;
    use crate::models::timestamp_now;

    fn cert(serial: u64, subject: &str) -> DbCertRecord {
        let now = timestamp_now();
        DbCertRecord {
            serial: SerialNumber::new(serial),
            version: 0,
            authority_id: AuthorityId::new(),
            issuer_dn: "CN=Test CA".into(),
            subject_dn: subject.into(),
            cert_pem: String::new(),
            status: CertStatus::Valid,
            not_before: now,
            not_after: now + Duration::days(30),
            issued_on: now,
            issued_by: "system".into(),
            request_id: None,
            profile_id: None,
            authority_key_id: None,
            revocation: None,
        }
    }

    #[tokio::test]
    async fn request_update_rejects_stale_version() {
        let stg = MemoryStorage::new();
        let req = DbRequest::new(RequestId::new(1), RequestType::Enrollment);
        RequestStore::insert(&stg, req.clone()).await.unwrap();

        let mut first = req.clone();
        first.status = RequestStatus::Pending;
        let stored = RequestStore::update(&stg, first, 0).await.unwrap();
        assert_eq!(stored.version, 1);

        let err = RequestStore::update(&stg, req, 0).await.unwrap_err();
        assert!(matches!(err, StoreError::ConcurrentModification { .. }));

        let current = RequestStore::get(&stg, RequestId::new(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.status, RequestStatus::Pending);
    }

    #[tokio::test]
    async fn request_list_reports_total_past_page() {
        let stg = MemoryStorage::new();
        for i in 1..=7 {
            let req = DbRequest::new(RequestId::new(i), RequestType::Enrollment);
            RequestStore::insert(&stg, req).await.unwrap();
        }

        let page = RequestStore::list(&stg, RequestFilter::default(), 5, 20)
            .await
            .unwrap();
        assert_eq!(page.total, 7);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].id, RequestId::new(6));

        let empty = RequestStore::list(&stg, RequestFilter::default(), 0, 0)
            .await
            .unwrap();
        assert_eq!(empty.total, 7);
        assert!(empty.items.is_empty());
    }

    #[tokio::test]
    async fn cert_list_filters_by_subject() {
        let stg = MemoryStorage::new();
        for (i, subject) in ["CN=alpha", "CN=beta", "CN=Alphabet"].iter().enumerate() {
            CertStore::insert(&stg, cert(i as u64 + 1, subject))
                .await
                .unwrap();
        }

        let filter = CertFilter {
            subject_contains: Some("ALPHA".into()),
            ..Default::default()
        };
        let page = CertStore::list(&stg, filter, 0, 20).await.unwrap();
        assert_eq!(page.total, 2);
    }

    #[tokio::test]
    async fn expired_status_is_derived() {
        let stg = MemoryStorage::new();
        let mut old = cert(1, "CN=old");
        old.not_after = timestamp_now() - Duration::days(1);
        CertStore::insert(&stg, old).await.unwrap();
        CertStore::insert(&stg, cert(2, "CN=new")).await.unwrap();

        let filter = CertFilter {
            status: Some(CertStatus::Expired),
            ..Default::default()
        };
        let page = CertStore::list(&stg, filter, 0, 20).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].serial, SerialNumber::new(1));
    }

    #[tokio::test]
    async fn serial_range_exhausts() {
        let stg = MemoryStorage::new();
        stg.init_range("certificates", 10, 11).await.unwrap();

        assert_eq!(stg.next("certificates").await.unwrap(), 10);
        assert_eq!(stg.next("certificates").await.unwrap(), 11);
        assert!(matches!(
            stg.next("certificates").await,
            Err(StoreError::RangeExhausted { .. })
        ));
    }

    #[tokio::test]
    async fn serial_range_reset_rejects_reuse() {
        let stg = MemoryStorage::new();
        stg.init_range("certificates", 1, 100).await.unwrap();
        stg.next("certificates").await.unwrap();
        stg.next("certificates").await.unwrap();

        assert!(matches!(
            stg.reset_range("certificates", 2, 200).await,
            Err(StoreError::RangeWouldReuse { next: 3, .. })
        ));
        assert!(matches!(
            stg.reset_range("certificates", 50, 10).await,
            Err(StoreError::InvalidRange(_))
        ));

        let range = stg.reset_range("certificates", 3, 200).await.unwrap();
        assert_eq!(range.next, 3);
        assert_eq!(stg.next("certificates").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn init_range_keeps_existing() {
        let stg = MemoryStorage::new();
        stg.init_range("requests", 1, 10).await.unwrap();
        stg.next("requests").await.unwrap();

        let range = stg.init_range("requests", 500, 1000).await.unwrap();
        assert_eq!(range.start, 1);
        assert_eq!(range.next, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_next_never_repeats() {
        let stg = Arc::new(MemoryStorage::new());
        stg.init_range("certificates", 1, 400).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let stg = stg.clone();
            handles.push(tokio::spawn(async move {
                let mut got = Vec::new();
                for _ in 0..50 {
                    got.push(stg.next("certificates").await.unwrap());
                }
                got
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for value in handle.await.unwrap() {
                assert!(value <= 400);
                assert!(seen.insert(value), "duplicate serial {value}");
            }
        }
        assert_eq!(seen.len(), 400);
    }
}
