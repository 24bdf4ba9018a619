//! Signing units.
//!
//! The engine never touches private keys directly. Each authority holds a
//! [`SigningUnit`] that turns a [`CertTemplate`] into a signed certificate
//! and a list of revoked entries into a signed CRL. [`SoftwareToken`] keeps
//! keys in memory (and optionally on disk as PEM) and hands out units bound
//! to one key.

use std::{
    collections::HashMap,
    fmt,
    path::PathBuf,
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use certa_common::{ids::SerialNumber, types::RevocationReason};
use chrono::{DateTime, Duration, Utc};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateRevocationListParams,
    CertificateSigningRequestParams, ExtendedKeyUsagePurpose, IsCa, KeyIdMethod, KeyPair,
    KeyUsagePurpose, RevokedCertParams, SanType,
};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};

use super::x509::{X509Error, parse_dn};

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("Signing unit unavailable: {0}")]
    Unavailable(String),

    #[error("Key {0} not found in token")]
    KeyNotFound(String),

    #[error("Invalid certificate template: {0}")]
    InvalidTemplate(String),

    #[error(transparent)]
    Name(#[from] X509Error),

    #[error("Signing failed: {0}")]
    Rcgen(#[from] rcgen::Error),

    #[error("Token storage error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where the subject public key of a new certificate comes from.
#[derive(Debug, Clone)]
pub enum SubjectKey {
    /// PKCS#10 request in PEM format
    Csr(String),
    /// A key held by the same token, used when creating sub-authorities
    Token(String),
}

/// Everything that goes into a certificate except the serial number and the
/// issuer.
#[derive(Debug, Clone)]
pub struct CertTemplate {
    pub subject_dn: String,
    pub subject_key: SubjectKey,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub dns_names: Vec<String>,
    pub key_usages: Vec<KeyUsagePurpose>,
    pub ext_key_usages: Vec<ExtendedKeyUsagePurpose>,
    pub is_ca: bool,
}

impl CertTemplate {
    pub fn new(subject_dn: impl Into<String>, subject_key: SubjectKey, validity_days: u32) -> Self {
        let not_before = Utc::now();
        Self {
            subject_dn: subject_dn.into(),
            subject_key,
            not_before,
            not_after: not_before + Duration::days(i64::from(validity_days)),
            dns_names: Vec::new(),
            key_usages: Vec::new(),
            ext_key_usages: Vec::new(),
            is_ca: false,
        }
    }

    /// Template for a subordinate CA certificate.
    pub fn authority(subject_dn: impl Into<String>, key_ref: &str, validity_days: u32) -> Self {
        let mut template = Self::new(subject_dn, SubjectKey::Token(key_ref.to_string()), validity_days);
        template.is_ca = true;
        template.key_usages = ca_key_usages();
        template
    }

    fn to_params(&self, serial: Option<SerialNumber>) -> Result<CertificateParams, SigningError> {
        if self.not_after <= self.not_before {
            return Err(SigningError::InvalidTemplate(
                "not_after must be later than not_before".into(),
            ));
        }

        let mut params = CertificateParams::default();
        params.distinguished_name = parse_dn(&self.subject_dn)?;
        params.not_before = to_offset(self.not_before)?;
        params.not_after = to_offset(self.not_after)?;
        params.serial_number = serial.map(|s| rcgen::SerialNumber::from(s.get()));
        params.subject_alt_names = self
            .dns_names
            .iter()
            .map(|name| Ok(SanType::DnsName(name.as_str().try_into()?)))
            .collect::<Result<_, rcgen::Error>>()?;
        params.key_usages = self.key_usages.clone();
        params.extended_key_usages = self.ext_key_usages.clone();
        params.is_ca = if self.is_ca {
            IsCa::Ca(BasicConstraints::Unconstrained)
        } else {
            IsCa::ExplicitNoCa
        };
        params.use_authority_key_identifier_extension = true;
        params.key_identifier_method = KeyIdMethod::Sha256;
        Ok(params)
    }
}

fn ca_key_usages() -> Vec<KeyUsagePurpose> {
    vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ]
}

fn to_offset(ts: DateTime<Utc>) -> Result<OffsetDateTime, SigningError> {
    OffsetDateTime::from_unix_timestamp(ts.timestamp())
        .map_err(|e| SigningError::InvalidTemplate(format!("timestamp {ts} out of range: {e}")))
}

/// One entry of a certificate revocation list.
#[derive(Debug, Clone)]
pub struct CrlEntry {
    pub serial: SerialNumber,
    pub revoked_on: DateTime<Utc>,
    pub reason: RevocationReason,
    pub invalidity_date: Option<DateTime<Utc>>,
}

fn crl_reason(reason: RevocationReason) -> rcgen::RevocationReason {
    match reason {
        RevocationReason::Unspecified => rcgen::RevocationReason::Unspecified,
        RevocationReason::KeyCompromise => rcgen::RevocationReason::KeyCompromise,
        RevocationReason::CaCompromise => rcgen::RevocationReason::CaCompromise,
        RevocationReason::AffiliationChanged => rcgen::RevocationReason::AffiliationChanged,
        RevocationReason::Superseded => rcgen::RevocationReason::Superseded,
        RevocationReason::CessationOfOperation => rcgen::RevocationReason::CessationOfOperation,
        RevocationReason::CertificateHold => rcgen::RevocationReason::CertificateHold,
        RevocationReason::RemoveFromCrl => rcgen::RevocationReason::RemoveFromCrl,
        RevocationReason::PrivilegeWithdrawn => rcgen::RevocationReason::PrivilegeWithdrawn,
        RevocationReason::AaCompromise => rcgen::RevocationReason::AaCompromise,
    }
}

/// A key able to sign on behalf of one authority.
pub trait SigningUnit: Send + Sync + fmt::Debug {
    fn key_ref(&self) -> &str;

    /// Sign `template` with this unit's key, returning the certificate PEM.
    fn sign_certificate(
        &self,
        template: &CertTemplate,
        serial: SerialNumber,
    ) -> Result<String, SigningError>;

    /// Sign a CRL over `entries`, returning its PEM.
    fn sign_crl(
        &self,
        entries: &[CrlEntry],
        crl_number: u64,
        next_update: DateTime<Utc>,
    ) -> Result<String, SigningError>;
}

/// Software key store built on rcgen.
pub struct SoftwareToken {
    keys: RwLock<HashMap<String, Arc<KeyPair>>>,
    dir: Option<PathBuf>,
    logged_in: AtomicBool,
}

impl fmt::Debug for SoftwareToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftwareToken")
            .field("dir", &self.dir)
            .field("logged_in", &self.logged_in.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl SoftwareToken {
    pub fn in_memory() -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            dir: None,
            logged_in: AtomicBool::new(true),
        }
    }

    /// A token persisting keys as `<dir>/<key_ref>.pem`.
    pub fn with_dir(dir: impl Into<PathBuf>) -> Result<Self, SigningError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            keys: RwLock::new(HashMap::new()),
            dir: Some(dir),
            logged_in: AtomicBool::new(true),
        })
    }

    pub fn login(&self) {
        self.logged_in.store(true, Ordering::SeqCst);
    }

    /// While logged out every signing operation fails with
    /// [`SigningError::Unavailable`].
    pub fn logout(&self) {
        self.logged_in.store(false, Ordering::SeqCst);
    }

    fn ensure_logged_in(&self) -> Result<(), SigningError> {
        if self.logged_in.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SigningError::Unavailable("token is logged out".into()))
        }
    }

    fn key_path(&self, key_ref: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| dir.join(format!("{key_ref}.pem")))
    }

    fn cached(&self, key_ref: &str) -> Result<Option<Arc<KeyPair>>, SigningError> {
        let keys = self
            .keys
            .read()
            .map_err(|_| SigningError::Unavailable("key table poisoned".into()))?;
        Ok(keys.get(key_ref).cloned())
    }

    fn remember(&self, key_ref: &str, key: KeyPair) -> Result<Arc<KeyPair>, SigningError> {
        let key = Arc::new(key);
        self.keys
            .write()
            .map_err(|_| SigningError::Unavailable("key table poisoned".into()))?
            .insert(key_ref.to_string(), key.clone());
        Ok(key)
    }

    /// Look a key up, falling back to the token directory.
    pub fn key(&self, key_ref: &str) -> Result<Arc<KeyPair>, SigningError> {
        self.ensure_logged_in()?;
        if let Some(key) = self.cached(key_ref)? {
            return Ok(key);
        }
        match self.key_path(key_ref) {
            Some(path) if path.exists() => {
                debug!(key_ref, ?path, "Loading key from token directory");
                let pem = std::fs::read_to_string(path)?;
                self.remember(key_ref, KeyPair::from_pem(&pem)?)
            }
            _ => Err(SigningError::KeyNotFound(key_ref.to_string())),
        }
    }

    pub fn has_key(&self, key_ref: &str) -> bool {
        self.key(key_ref).is_ok()
    }

    /// Generate a fresh ECDSA P-256 key under `key_ref`.
    #[instrument(skip(self))]
    pub fn generate_key(&self, key_ref: &str) -> Result<Arc<KeyPair>, SigningError> {
        self.ensure_logged_in()?;
        let key = KeyPair::generate()?;
        if let Some(path) = self.key_path(key_ref) {
            std::fs::write(&path, key.serialize_pem())?;
        }
        info!(key_ref, "Generated signing key");
        self.remember(key_ref, key)
    }

    /// Self-signed CA certificate for the key `key_ref`.
    pub fn self_signed_ca(
        &self,
        key_ref: &str,
        subject_dn: &str,
        validity_days: u32,
    ) -> Result<String, SigningError> {
        let key = self.key(key_ref)?;
        let template = CertTemplate::authority(subject_dn, key_ref, validity_days);
        let mut params = template.to_params(None)?;
        params.use_authority_key_identifier_extension = false;
        Ok(params.self_signed(&*key)?.pem())
    }

    /// A signing unit for the authority whose certificate is `cert_pem`.
    pub fn unit(self: &Arc<Self>, key_ref: &str, cert_pem: &str) -> Arc<dyn SigningUnit> {
        if !self.has_key(key_ref) {
            warn!(key_ref, "Signing key is not available in the token");
        }
        Arc::new(SoftwareSigningUnit {
            token: self.clone(),
            key_ref: key_ref.to_string(),
            cert_pem: cert_pem.to_string(),
        })
    }
}

#[derive(Debug)]
struct SoftwareSigningUnit {
    token: Arc<SoftwareToken>,
    key_ref: String,
    cert_pem: String,
}

impl SoftwareSigningUnit {
    /// The issuer certificate rebuilt around our key so rcgen can sign with
    /// it. Subject and key identifier come from the stored certificate.
    fn issuer(&self) -> Result<(Certificate, Arc<KeyPair>), SigningError> {
        let key = self.token.key(&self.key_ref)?;
        let cert = CertificateParams::from_ca_cert_pem(&self.cert_pem)?.self_signed(&*key)?;
        Ok((cert, key))
    }
}

impl SigningUnit for SoftwareSigningUnit {
    fn key_ref(&self) -> &str {
        &self.key_ref
    }

    #[instrument(skip(self, template), fields(key_ref = %self.key_ref))]
    fn sign_certificate(
        &self,
        template: &CertTemplate,
        serial: SerialNumber,
    ) -> Result<String, SigningError> {
        let (issuer, issuer_key) = self.issuer()?;
        let params = template.to_params(Some(serial))?;

        let cert = match &template.subject_key {
            SubjectKey::Csr(pem) => {
                let mut csr = CertificateSigningRequestParams::from_pem(pem)?;
                csr.params = params;
                csr.signed_by(&issuer, &*issuer_key)?
            }
            SubjectKey::Token(key_ref) => {
                let subject_key = self.token.key(key_ref)?;
                params.signed_by(&*subject_key, &issuer, &*issuer_key)?
            }
        };

        Ok(cert.pem())
    }

    #[instrument(skip(self, entries), fields(key_ref = %self.key_ref, entries = entries.len()))]
    fn sign_crl(
        &self,
        entries: &[CrlEntry],
        crl_number: u64,
        next_update: DateTime<Utc>,
    ) -> Result<String, SigningError> {
        let (issuer, issuer_key) = self.issuer()?;

        let revoked_certs = entries
            .iter()
            .map(|entry| {
                Ok(RevokedCertParams {
                    serial_number: rcgen::SerialNumber::from(entry.serial.get()),
                    revocation_time: to_offset(entry.revoked_on)?,
                    reason_code: Some(crl_reason(entry.reason)),
                    invalidity_date: entry.invalidity_date.map(to_offset).transpose()?,
                })
            })
            .collect::<Result<Vec<_>, SigningError>>()?;

        let params = CertificateRevocationListParams {
            this_update: to_offset(Utc::now())?,
            next_update: to_offset(next_update)?,
            crl_number: rcgen::SerialNumber::from(crl_number),
            issuing_distribution_point: None,
            revoked_certs,
            key_identifier_method: KeyIdMethod::Sha256,
        };

        Ok(params.signed_by(&issuer, &*issuer_key)?.pem()?)
    }
}
