use async_trait::async_trait;
use certa_common::{
    ids::{AuthorityId, RequestId, SerialNumber},
    types::CertStatus,
};
use chrono::Utc;
use futures::TryStreamExt;
use mongodb::{
    Client, Collection, Database,
    bson::{Bson, Document, doc},
    error::{ErrorKind, WriteFailure},
    options::ReturnDocument,
};
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, instrument};

use crate::{
    models::{DbAuthority, DbCertRecord, DbRequest, DbSerialRange},
    storage::{
        AuthorityStore, CertFilter, CertStore, Page, RequestFilter, RequestStore, SerialStore,
        Storage, StoreError, check_range,
    },
};

#[derive(Debug)]
pub struct MongoDBStorage(Client);

impl MongoDBStorage {
    pub async fn new(uri: &str) -> Result<Self, mongodb::error::Error> {
        let client = Client::with_uri_str(uri).await?;
        Ok(Self(client))
    }

    fn get_db(&self) -> Database {
        self.0
            .default_database()
            .unwrap_or_else(|| self.0.database("certa"))
    }

    fn requests(&self) -> Collection<DbRequest> {
        self.get_db().collection(MONGODB_COLLECTION_REQUESTS)
    }

    fn certs(&self) -> Collection<DbCertRecord> {
        self.get_db().collection(MONGODB_COLLECTION_CERTS)
    }

    fn authorities(&self) -> Collection<DbAuthority> {
        self.get_db().collection(MONGODB_COLLECTION_AUTHORITIES)
    }

    fn ranges(&self) -> Collection<DbSerialRange> {
        self.get_db().collection(MONGODB_COLLECTION_RANGES)
    }
}

pub const MONGODB_COLLECTION_REQUESTS: &str = "requests";
pub const MONGODB_COLLECTION_CERTS: &str = "certificates";
pub const MONGODB_COLLECTION_AUTHORITIES: &str = "authorities";
pub const MONGODB_COLLECTION_RANGES: &str = "serial_ranges";

const DUPLICATE_KEY: i32 = 11000;

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(e)) if e.code == DUPLICATE_KEY
    )
}

/// Counters and ids are stored as Int64.
fn int64(value: u64) -> Result<Bson, StoreError> {
    i64::try_from(value)
        .map(Bson::Int64)
        .map_err(|_| StoreError::Internal(format!("{value:#x} does not fit in Int64").into()))
}

fn escape_regex(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if "\\^$.|?*+()[]{}".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn request_filter_doc(filter: &RequestFilter) -> Document {
    let mut filter_doc = doc! {};
    if let Some(status) = filter.status {
        filter_doc.insert("status", status.as_str());
    }
    if let Some(request_type) = filter.request_type {
        filter_doc.insert("request_type", request_type.as_str());
    }
    if let Some(authority_id) = filter.authority_id {
        filter_doc.insert("authority_id", authority_id.to_string());
    }
    if let Some(owner) = &filter.owner {
        filter_doc.insert("owner", owner);
    }
    if let Some(assigned_to) = &filter.assigned_to {
        filter_doc.insert("assigned_to", assigned_to);
    }
    filter_doc
}

fn cert_filter_doc(filter: &CertFilter) -> Result<Document, StoreError> {
    let now = mongodb::bson::DateTime::from_chrono(Utc::now());
    let mut filter_doc = doc! {};

    match filter.status {
        Some(CertStatus::Valid) => {
            filter_doc.insert("status", "VALID");
            filter_doc.insert("not_after", doc! { "$gte": now });
        }
        Some(CertStatus::Expired) => {
            filter_doc.insert("status", "VALID");
            filter_doc.insert("not_after", doc! { "$lt": now });
        }
        Some(CertStatus::Revoked) => {
            filter_doc.insert("status", "REVOKED");
        }
        None => {}
    }
    if let Some(authority_id) = filter.authority_id {
        filter_doc.insert("authority_id", authority_id.to_string());
    }
    if let Some(needle) = &filter.subject_contains {
        filter_doc.insert(
            "subject_dn",
            doc! { "$regex": escape_regex(needle), "$options": "i" },
        );
    }
    if let Some(issuer) = &filter.issuer_dn {
        filter_doc.insert(
            "issuer_dn",
            doc! { "$regex": format!("^{}$", escape_regex(issuer)), "$options": "i" },
        );
    }
    let mut serial_range = doc! {};
    if let Some(from) = filter.serial_from {
        serial_range.insert("$gte", int64(from.get())?);
    }
    if let Some(to) = filter.serial_to {
        serial_range.insert("$lte", int64(to.get())?);
    }
    if !serial_range.is_empty() {
        filter_doc.insert("_id", serial_range);
    }
    if let Some(revoked_by) = &filter.revoked_by {
        filter_doc.insert("revocation.revoked_by", revoked_by);
    }
    if let Some(reason) = filter.revocation_reason {
        filter_doc.insert("revocation.reason", reason.as_str());
    }
    if let Some(issued_by) = &filter.issued_by {
        filter_doc.insert("issued_by", issued_by);
    }
    if let Some(request_id) = filter.request_id {
        filter_doc.insert("request_id", int64(request_id.get())?);
    }
    Ok(filter_doc)
}

async fn find_page<T>(
    collection: &Collection<T>,
    filter: Document,
    start: usize,
    size: usize,
) -> Result<Page<T>, StoreError>
where
    T: Serialize + DeserializeOwned + Send + Sync + Unpin,
{
    let total = collection.count_documents(filter.clone()).await?;
    let Some(limit) = page_limit(size) else {
        return Ok(Page {
            items: Vec::new(),
            total,
        });
    };
    let items = collection
        .find(filter)
        .sort(doc! { "_id": 1 })
        .skip(start as u64)
        .limit(limit)
        .await?
        .try_collect()
        .await?;
    Ok(Page { items, total })
}

/// MongoDB reads a limit of 0 as "no limit", so an empty page is never
/// queried.
fn page_limit(size: usize) -> Option<i64> {
    match size {
        0 => None,
        size => Some(i64::try_from(size).unwrap_or(i64::MAX)),
    }
}

#[async_trait]
impl Storage for MongoDBStorage {
    async fn ping(&self) -> Result<(), StoreError> {
        self.get_db().run_command(doc! { "ping": 1 }).await?;
        Ok(())
    }
}

#[async_trait]
impl RequestStore for MongoDBStorage {
    #[instrument(skip(self, request), fields(request_id = %request.id))]
    async fn insert(&self, request: DbRequest) -> Result<DbRequest, StoreError> {
        match self.requests().insert_one(&request).await {
            Ok(_) => Ok(request),
            Err(e) if is_duplicate_key(&e) => Err(StoreError::AlreadyExists(request.id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: RequestId) -> Result<Option<DbRequest>, StoreError> {
        Ok(self
            .requests()
            .find_one(doc! { "_id": int64(id.get())? })
            .await?)
    }

    #[instrument(skip(self, request), fields(request_id = %request.id))]
    async fn update(
        &self,
        mut request: DbRequest,
        expected_version: u64,
    ) -> Result<DbRequest, StoreError> {
        let id = int64(request.id.get())?;
        request.version = expected_version + 1;

        let result = self
            .requests()
            .replace_one(
                doc! { "_id": id.clone(), "version": int64(expected_version)? },
                &request,
            )
            .await?;

        if result.matched_count == 0 {
            let exists = self.requests().count_documents(doc! { "_id": id }).await? > 0;
            return Err(if exists {
                debug!(expected_version, "Request version moved on");
                StoreError::ConcurrentModification {
                    id: request.id.to_string(),
                    expected: expected_version,
                }
            } else {
                StoreError::NotFound
            });
        }

        Ok(request)
    }

    async fn list(
        &self,
        filter: RequestFilter,
        start: usize,
        size: usize,
    ) -> Result<Page<DbRequest>, StoreError> {
        find_page(&self.requests(), request_filter_doc(&filter), start, size).await
    }
}

#[async_trait]
impl CertStore for MongoDBStorage {
    #[instrument(skip(self, cert), fields(serial = %cert.serial))]
    async fn insert(&self, cert: DbCertRecord) -> Result<DbCertRecord, StoreError> {
        match self.certs().insert_one(&cert).await {
            Ok(_) => Ok(cert),
            Err(e) if is_duplicate_key(&e) => Err(StoreError::AlreadyExists(cert.serial.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, serial: SerialNumber) -> Result<Option<DbCertRecord>, StoreError> {
        Ok(self
            .certs()
            .find_one(doc! { "_id": int64(serial.get())? })
            .await?)
    }

    #[instrument(skip(self, cert), fields(serial = %cert.serial))]
    async fn update(
        &self,
        mut cert: DbCertRecord,
        expected_version: u64,
    ) -> Result<DbCertRecord, StoreError> {
        let id = int64(cert.serial.get())?;
        cert.version = expected_version + 1;

        let result = self
            .certs()
            .replace_one(
                doc! { "_id": id.clone(), "version": int64(expected_version)? },
                &cert,
            )
            .await?;

        if result.matched_count == 0 {
            let exists = self.certs().count_documents(doc! { "_id": id }).await? > 0;
            return Err(if exists {
                StoreError::ConcurrentModification {
                    id: cert.serial.to_string(),
                    expected: expected_version,
                }
            } else {
                StoreError::NotFound
            });
        }

        Ok(cert)
    }

    async fn list(
        &self,
        filter: CertFilter,
        start: usize,
        size: usize,
    ) -> Result<Page<DbCertRecord>, StoreError> {
        find_page(&self.certs(), cert_filter_doc(&filter)?, start, size).await
    }
}

#[async_trait]
impl AuthorityStore for MongoDBStorage {
    async fn insert(&self, authority: DbAuthority) -> Result<DbAuthority, StoreError> {
        match self.authorities().insert_one(&authority).await {
            Ok(_) => Ok(authority),
            Err(e) if is_duplicate_key(&e) => {
                Err(StoreError::AlreadyExists(authority.id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: AuthorityId) -> Result<Option<DbAuthority>, StoreError> {
        Ok(self
            .authorities()
            .find_one(doc! { "_id": id.to_string() })
            .await?)
    }

    async fn list(&self) -> Result<Vec<DbAuthority>, StoreError> {
        self.authorities()
            .find(doc! {})
            .sort(doc! { "created_at": 1 })
            .await?
            .try_collect()
            .await
            .map_err(StoreError::MongoDB)
    }

    async fn update(&self, authority: DbAuthority) -> Result<DbAuthority, StoreError> {
        let result = self
            .authorities()
            .replace_one(doc! { "_id": authority.id.to_string() }, &authority)
            .await?;
        if result.matched_count == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(authority)
    }

    async fn delete(&self, id: AuthorityId) -> Result<(), StoreError> {
        let result = self
            .authorities()
            .delete_one(doc! { "_id": id.to_string() })
            .await?;
        if result.deleted_count == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

#[async_trait]
impl SerialStore for MongoDBStorage {
    /// A single `findAndModify` with `$inc`, guarded by `next <= end`, so two
    /// callers can never see the same value.
    #[instrument(skip(self))]
    async fn next(&self, name: &str) -> Result<u64, StoreError> {
        let before = self
            .ranges()
            .find_one_and_update(
                doc! { "_id": name, "$expr": { "$lte": ["$next", "$end"] } },
                doc! { "$inc": { "next": 1_i64 } },
            )
            .return_document(ReturnDocument::Before)
            .await?;

        match before {
            Some(range) => Ok(range.next),
            None => match self.get_range(name).await? {
                Some(range) => Err(StoreError::RangeExhausted {
                    name: name.to_string(),
                    end: range.end,
                }),
                None => Err(StoreError::RangeNotConfigured(name.to_string())),
            },
        }
    }

    async fn get_range(&self, name: &str) -> Result<Option<DbSerialRange>, StoreError> {
        Ok(self.ranges().find_one(doc! { "_id": name }).await?)
    }

    async fn init_range(
        &self,
        name: &str,
        start: u64,
        end: u64,
    ) -> Result<DbSerialRange, StoreError> {
        check_range(name, start, end, None)?;
        self.ranges()
            .update_one(
                doc! { "_id": name },
                doc! { "$setOnInsert": {
                    "start": int64(start)?,
                    "end": int64(end)?,
                    "next": int64(start)?,
                } },
            )
            .upsert(true)
            .await?;

        self.get_range(name)
            .await?
            .ok_or_else(|| StoreError::RangeNotConfigured(name.to_string()))
    }

    #[instrument(skip(self))]
    async fn reset_range(
        &self,
        name: &str,
        start: u64,
        end: u64,
    ) -> Result<DbSerialRange, StoreError> {
        let existing = self.get_range(name).await?;
        check_range(name, start, end, existing.as_ref())?;
        let range = DbSerialRange::new(name, start, end);

        match existing {
            Some(existing) => {
                // Guard on `next` so an allocation racing with the reset is
                // not silently rewound.
                let result = self
                    .ranges()
                    .replace_one(
                        doc! { "_id": name, "next": int64(existing.next)? },
                        &range,
                    )
                    .await?;
                if result.matched_count == 0 {
                    return Err(StoreError::ConcurrentModification {
                        id: name.to_string(),
                        expected: existing.next,
                    });
                }
            }
            None => match self.ranges().insert_one(&range).await {
                Ok(_) => {}
                Err(e) if is_duplicate_key(&e) => {
                    return Err(StoreError::ConcurrentModification {
                        id: name.to_string(),
                        expected: start,
                    });
                }
                Err(e) => return Err(e.into()),
            },
        }

        Ok(range)
    }
}

#[cfg(test)]
mod test {
    use certa_common::types::RequestStatus;

    use super::*;

    #[test]
    fn regex_metacharacters_are_escaped() {
        assert_eq!(escape_regex("CN=a.b (x)"), "CN=a\\.b \\(x\\)");
    }

    #[test]
    fn request_filter_uses_wire_names() {
        let filter = RequestFilter {
            status: Some(RequestStatus::SvcPending),
            ..Default::default()
        };
        let doc = request_filter_doc(&filter);
        assert_eq!(doc.get_str("status").unwrap(), "svc_pending");
    }

    #[test]
    fn cert_filter_serial_bounds_use_id() {
        let filter = CertFilter {
            serial_from: Some(SerialNumber::new(5)),
            serial_to: Some(SerialNumber::new(9)),
            ..Default::default()
        };
        let doc = cert_filter_doc(&filter).unwrap();
        let id = doc.get_document("_id").unwrap();
        assert_eq!(id.get_i64("$gte").unwrap(), 5);
        assert_eq!(id.get_i64("$lte").unwrap(), 9);
    }

    #[test]
    fn oversized_values_are_rejected() {
        assert!(int64(u64::MAX).is_err());
    }

    #[test]
    fn empty_page_is_never_unlimited() {
        assert_eq!(page_limit(0), None);
        assert_eq!(page_limit(20), Some(20));
        assert_eq!(page_limit(usize::MAX), Some(i64::MAX));
    }
}
