//! Certificate authorities known to this instance: the host authority and any
//! number of subordinate ones.

use std::{
    collections::BTreeMap,
    sync::{Arc, PoisonError, RwLock},
};

use certa_common::ids::{AuthorityId, SerialNumber};
use certa_db::{
    models::{DbAuthority, timestamp_now},
    storage::{AuthorityStore, Storage, StoreError},
};
use thiserror::Error;
use tracing::{info, instrument, warn};

use super::{
    signing::{CertTemplate, SigningError, SigningUnit, SoftwareToken},
    x509::{X509Error, inspect_cert},
};
use crate::config::store::AuthorityConfig;

/// Token key name of the host authority.
pub const HOST_KEY_REF: &str = "host";

#[derive(Debug, Error)]
pub enum AuthorityError {
    #[error("Authority {0} not found")]
    NotFound(AuthorityId),

    #[error("Authority {0} is disabled")]
    Disabled(AuthorityId),

    #[error("{0}")]
    Conflict(String),

    #[error("No authority matches key identifier {0}")]
    Routing(String),

    #[error(transparent)]
    Signing(#[from] SigningError),

    #[error("Unreadable authority certificate: {0}")]
    Certificate(#[from] X509Error),

    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl AuthorityError {
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::Signing(_) | Self::Certificate(_) | Self::Storage(_)
        )
    }
}

/// An authority record together with the unit that signs for it.
#[derive(Debug)]
pub struct Authority {
    pub record: DbAuthority,
    pub signer: Arc<dyn SigningUnit>,
}

impl Authority {
    pub fn id(&self) -> AuthorityId {
        self.record.id
    }

    pub fn ensure_enabled(&self) -> Result<(), AuthorityError> {
        if self.record.enabled {
            Ok(())
        } else {
            Err(AuthorityError::Disabled(self.record.id))
        }
    }
}

#[derive(Debug)]
pub struct AuthorityRegistry {
    db: Arc<dyn Storage>,
    token: Arc<SoftwareToken>,
    validity_days: u32,
    host_id: AuthorityId,
    authorities: RwLock<BTreeMap<AuthorityId, Arc<Authority>>>,
}

impl AuthorityRegistry {
    /// Load every stored authority, creating the host authority on first
    /// start.
    #[instrument(skip_all)]
    pub async fn load(
        db: Arc<dyn Storage>,
        token: Arc<SoftwareToken>,
        config: &AuthorityConfig,
    ) -> Result<Self, AuthorityError> {
        let mut records = AuthorityStore::list(&*db).await?;

        if !records.iter().any(|a| a.is_host) {
            let host = Self::bootstrap_host(&db, &token, config).await?;
            records.push(host);
        }

        let mut authorities = BTreeMap::new();
        let mut host_id = None;
        for record in records {
            if record.is_host {
                if let Some(existing) = host_id {
                    return Err(AuthorityError::Conflict(format!(
                        "more than one host authority ({existing} and {})",
                        record.id
                    )));
                }
                host_id = Some(record.id);
            }
            let signer = token.unit(&record.key_ref, &record.cert_pem);
            authorities.insert(record.id, Arc::new(Authority { record, signer }));
        }
        let host_id = host_id
            .ok_or_else(|| AuthorityError::Conflict("host authority is missing".into()))?;

        info!(count = authorities.len(), %host_id, "Loaded authorities");
        Ok(Self {
            db,
            token,
            validity_days: config.validity_days,
            host_id,
            authorities: RwLock::new(authorities),
        })
    }

    async fn bootstrap_host(
        db: &Arc<dyn Storage>,
        token: &SoftwareToken,
        config: &AuthorityConfig,
    ) -> Result<DbAuthority, AuthorityError> {
        if !token.has_key(HOST_KEY_REF) {
            token.generate_key(HOST_KEY_REF)?;
        }
        let cert_pem = token.self_signed_ca(HOST_KEY_REF, &config.host_dn, config.validity_days)?;
        let cert = inspect_cert(&cert_pem)?;

        let record = DbAuthority {
            id: AuthorityId::new(),
            parent_id: None,
            dn: cert.subject_dn,
            description: Some("Host authority".to_string()),
            enabled: true,
            is_host: true,
            cert_pem,
            subject_key_id: cert.subject_key_id.unwrap_or_default(),
            key_ref: HOST_KEY_REF.to_string(),
            created_at: timestamp_now(),
        };
        let record = AuthorityStore::insert(&**db, record).await?;
        info!(authority_id = %record.id, dn = %record.dn, "Created host authority");
        Ok(record)
    }

    pub fn host_id(&self) -> AuthorityId {
        self.host_id
    }

    pub fn host(&self) -> Result<Arc<Authority>, AuthorityError> {
        self.get(self.host_id)
    }

    pub fn get(&self, id: AuthorityId) -> Result<Arc<Authority>, AuthorityError> {
        self.authorities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(AuthorityError::NotFound(id))
    }

    /// The named authority, or the host authority when none is named.
    pub fn resolve(&self, id: Option<AuthorityId>) -> Result<Arc<Authority>, AuthorityError> {
        self.get(id.unwrap_or(self.host_id))
    }

    /// Every authority, host first, the rest in creation order.
    pub fn list(&self) -> Vec<DbAuthority> {
        let mut records: Vec<DbAuthority> = self
            .authorities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|a| a.record.clone())
            .collect();
        records.sort_by_key(|a| (!a.is_host, a.created_at));
        records
    }

    /// The authority whose subject key identifier equals `key_id`. The host
    /// authority is checked first.
    pub fn route_by_key_id(&self, key_id: Option<&str>) -> Result<Arc<Authority>, AuthorityError> {
        let Some(key_id) = key_id.filter(|k| !k.is_empty()) else {
            return Err(AuthorityError::Routing("<none>".into()));
        };

        let authorities = self.authorities.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(host) = authorities.get(&self.host_id) {
            if host.record.subject_key_id.eq_ignore_ascii_case(key_id) {
                return Ok(host.clone());
            }
        }
        authorities
            .values()
            .find(|a| a.record.subject_key_id.eq_ignore_ascii_case(key_id))
            .cloned()
            .ok_or_else(|| AuthorityError::Routing(key_id.to_string()))
    }

    /// Certificates from `id` up to the host authority, as PEM.
    pub fn chain_pems(&self, id: AuthorityId) -> Result<Vec<String>, AuthorityError> {
        let authorities = self.authorities.read().unwrap_or_else(PoisonError::into_inner);
        let mut chain = Vec::new();
        let mut next = Some(id);
        while let Some(id) = next {
            let authority = authorities.get(&id).ok_or(AuthorityError::NotFound(id))?;
            chain.push(authority.record.cert_pem.clone());
            next = authority.record.parent_id;
            if chain.len() > authorities.len() {
                return Err(AuthorityError::Conflict(format!(
                    "authority {id} has a cyclic parent chain"
                )));
            }
        }
        Ok(chain)
    }

    /// Create a subordinate authority whose certificate, carrying `serial`, is
    /// signed by `parent`. Returns the new authority and its certificate.
    #[instrument(skip(self, description))]
    pub async fn create_sub_authority(
        &self,
        parent: AuthorityId,
        dn: &str,
        description: Option<String>,
        serial: SerialNumber,
    ) -> Result<Arc<Authority>, AuthorityError> {
        let parent = self.get(parent)?;
        parent.ensure_enabled()?;
        self.ensure_unique_dn(dn)?;

        let id = AuthorityId::new();
        let key_ref = format!("authority-{id}");
        self.token.generate_key(&key_ref)?;

        let template = CertTemplate::authority(dn, &key_ref, self.validity_days);
        let cert_pem = parent.signer.sign_certificate(&template, serial)?;
        let cert = inspect_cert(&cert_pem)?;

        let record = DbAuthority {
            id,
            parent_id: Some(parent.id()),
            dn: cert.subject_dn,
            description,
            enabled: true,
            is_host: false,
            cert_pem,
            subject_key_id: cert.subject_key_id.unwrap_or_default(),
            key_ref,
            created_at: timestamp_now(),
        };
        let record = AuthorityStore::insert(&*self.db, record).await?;
        let signer = self.token.unit(&record.key_ref, &record.cert_pem);
        let authority = Arc::new(Authority { record, signer });

        self.authorities
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, authority.clone());
        info!(authority_id = %id, parent_id = %parent.id(), "Created sub-authority");
        Ok(authority)
    }

    /// Refuse a DN that some authority already has, before any key or
    /// serial is spent on it.
    pub fn ensure_unique_dn(&self, dn: &str) -> Result<(), AuthorityError> {
        let normalized = normalize_dn(dn);
        let taken = self
            .authorities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .any(|a| normalize_dn(&a.record.dn) == normalized);
        if taken {
            return Err(AuthorityError::Conflict(format!(
                "An authority with DN {dn} already exists"
            )));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn set_enabled(&self, id: AuthorityId, enabled: bool) -> Result<DbAuthority, AuthorityError> {
        let current = self.get(id)?;
        if current.record.is_host && !enabled {
            return Err(AuthorityError::Conflict(
                "The host authority cannot be disabled".into(),
            ));
        }
        if current.record.enabled == enabled {
            return Ok(current.record.clone());
        }

        let mut record = current.record.clone();
        record.enabled = enabled;
        let record = AuthorityStore::update(&*self.db, record).await?;

        let authority = Arc::new(Authority {
            record: record.clone(),
            signer: current.signer.clone(),
        });
        self.authorities
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, authority);
        info!(authority_id = %id, enabled, "Authority state changed");
        Ok(record)
    }

    /// Remove a disabled, childless sub-authority.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: AuthorityId) -> Result<(), AuthorityError> {
        let authority = self.get(id)?;
        if authority.record.is_host {
            return Err(AuthorityError::Conflict(
                "The host authority cannot be deleted".into(),
            ));
        }
        if authority.record.enabled {
            return Err(AuthorityError::Conflict(format!(
                "Authority {id} must be disabled before it is deleted"
            )));
        }
        let has_children = self
            .authorities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .any(|a| a.record.parent_id == Some(id));
        if has_children {
            return Err(AuthorityError::Conflict(format!(
                "Authority {id} still has subordinate authorities"
            )));
        }

        AuthorityStore::delete(&*self.db, id).await?;
        self.authorities
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        warn!(authority_id = %id, "Authority deleted");
        Ok(())
    }
}

fn normalize_dn(dn: &str) -> String {
    dn.split(',')
        .map(|rdn| rdn.trim().to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join(",")
}
