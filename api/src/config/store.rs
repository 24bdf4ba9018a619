//! Engine configuration.
//!
//! The TOML file named on the command line is layered with `CERTA_*`
//! environment overrides through the `config` crate. [`ConfigStore`] gives
//! typed access to individual keys and keeps "not set" apart from "set to
//! something unusable"; [`EngineConfig`] is the strongly typed view of the
//! sections the engine itself reads.

use std::path::{Path, PathBuf};

use ::config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, de::DeserializeOwned};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigStoreError {
    #[error("Configuration key {0} is not set")]
    NotFound(String),

    #[error("Configuration key {key} is invalid: {reason}")]
    Invalid { key: String, reason: String },

    #[error("Unknown {section} kind {kind:?}")]
    UnknownPlugin { section: String, kind: String },

    #[error("Failed to load configuration: {0}")]
    Load(#[source] ConfigError),
}

impl ConfigStoreError {
    pub fn invalid(key: impl Into<String>, reason: impl ToString) -> Self {
        Self::Invalid {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    inner: Config,
}

impl ConfigStore {
    /// Load the configuration file (if any) and apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigStoreError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        let inner = builder
            .add_source(
                Environment::with_prefix("CERTA")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(ConfigStoreError::Load)?;
        Ok(Self { inner })
    }

    pub fn from_toml(toml: &str) -> Result<Self, ConfigStoreError> {
        let inner = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .map_err(ConfigStoreError::Load)?;
        Ok(Self { inner })
    }

    pub fn empty() -> Self {
        Self {
            inner: Config::default(),
        }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, ConfigStoreError> {
        self.inner.get::<T>(key).map_err(|e| match e {
            ConfigError::NotFound(_) => ConfigStoreError::NotFound(key.to_string()),
            e => ConfigStoreError::invalid(key, e),
        })
    }

    /// Like [`ConfigStore::get`], but an absent key yields `default`. A
    /// present but malformed value is still an error.
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T, ConfigStoreError> {
        match self.get(key) {
            Err(ConfigStoreError::NotFound(_)) => Ok(default),
            other => other,
        }
    }

    pub fn get_string(&self, key: &str) -> Result<String, ConfigStoreError> {
        self.get(key)
    }

    pub fn get_u64(&self, key: &str) -> Result<u64, ConfigStoreError> {
        self.get(key)
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, ConfigStoreError> {
        self.get(key)
    }

    pub fn get_list(&self, key: &str) -> Result<Vec<String>, ConfigStoreError> {
        self.get(key)
    }

    /// Names of the tables under `section`, sorted. An absent section has no
    /// entries.
    pub fn section_names(&self, section: &str) -> Result<Vec<String>, ConfigStoreError> {
        match self.inner.get_table(section) {
            Ok(table) => {
                let mut names: Vec<String> = table.into_keys().collect();
                names.sort();
                Ok(names)
            }
            Err(ConfigError::NotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(ConfigStoreError::invalid(section, e)),
        }
    }

    /// A view of the keys below `prefix`, handed to plugin constructors.
    pub fn scoped(&self, prefix: impl Into<String>) -> ScopedConfig<'_> {
        ScopedConfig {
            store: self,
            prefix: prefix.into(),
        }
    }

    /// Instantiate every `[<section>.<name>]` table through the factory
    /// registered for its `kind`. Tables with `enabled = false` are skipped.
    pub fn build_plugins<T>(
        &self,
        section: &str,
        registry: &[(&str, PluginFactory<T>)],
    ) -> Result<Vec<T>, ConfigStoreError> {
        let mut plugins = Vec::new();
        for name in self.section_names(section)? {
            let scoped = self.scoped(format!("{section}.{name}"));
            if !scoped.get_or("enabled", true)? {
                continue;
            }
            let kind: String = scoped.get("kind")?;
            let factory = registry
                .iter()
                .find(|(k, _)| *k == kind)
                .map(|(_, factory)| *factory)
                .ok_or_else(|| ConfigStoreError::UnknownPlugin {
                    section: section.to_string(),
                    kind: kind.clone(),
                })?;
            plugins.push(factory(&name, &scoped)?);
        }
        Ok(plugins)
    }

    pub fn engine_config(&self) -> Result<EngineConfig, ConfigStoreError> {
        let config: EngineConfig = self
            .inner
            .clone()
            .try_deserialize()
            .map_err(|e| ConfigStoreError::invalid("<root>", e))?;
        config.validate()?;
        Ok(config)
    }
}

/// Constructor for a configured plugin, given its table name and keys.
pub type PluginFactory<T> = fn(&str, &ScopedConfig<'_>) -> Result<T, ConfigStoreError>;

/// Keys relative to one configuration table, e.g. `policies.subject`.
#[derive(Debug, Clone)]
pub struct ScopedConfig<'a> {
    store: &'a ConfigStore,
    prefix: String,
}

impl ScopedConfig<'_> {
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn key(&self, key: &str) -> String {
        format!("{}.{}", self.prefix, key)
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, ConfigStoreError> {
        self.store.get(&self.key(key))
    }

    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T, ConfigStoreError> {
        self.store.get_or(&self.key(key), default)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub serial: SerialConfig,
    pub queue: QueueConfig,
    pub authority: AuthorityConfig,
    pub profiles: Vec<ProfileConfig>,
    pub tokens: Vec<TokenConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            queue: QueueConfig::default(),
            authority: AuthorityConfig::default(),
            profiles: default_profiles(),
            tokens: Vec::new(),
        }
    }
}

impl EngineConfig {
    fn validate(&self) -> Result<(), ConfigStoreError> {
        let serial = &self.serial;
        if serial.request_start == 0 {
            return Err(ConfigStoreError::invalid(
                "serial.request_start",
                "request ids start at 1",
            ));
        }
        if serial.cert_start == 0 {
            return Err(ConfigStoreError::invalid(
                "serial.cert_start",
                "certificate serial numbers must be positive",
            ));
        }
        if serial.request_start > serial.request_end {
            return Err(ConfigStoreError::invalid(
                "serial.request_start",
                "start is after serial.request_end",
            ));
        }
        if serial.cert_start > serial.cert_end {
            return Err(ConfigStoreError::invalid(
                "serial.cert_start",
                "start is after serial.cert_end",
            ));
        }
        if self.queue.listener_workers == 0 {
            return Err(ConfigStoreError::invalid(
                "queue.listener_workers",
                "at least one worker is needed",
            ));
        }
        if self.queue.max_concurrent_services == 0 {
            return Err(ConfigStoreError::invalid(
                "queue.max_concurrent_services",
                "must be positive",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub request_start: u64,
    pub request_end: u64,
    pub cert_start: u64,
    pub cert_end: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            request_start: 1,
            request_end: 10_000_000,
            cert_start: 1,
            cert_end: 0x1000_0000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Upper bound on a single service invocation.
    pub service_timeout_secs: u64,
    /// How long `find` waits for another holder of the same request.
    pub lock_timeout_ms: u64,
    pub listener_workers: usize,
    /// Events beyond this many undelivered ones are dropped.
    pub listener_capacity: usize,
    pub max_concurrent_services: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            service_timeout_secs: 30,
            lock_timeout_ms: 5_000,
            listener_workers: 2,
            listener_capacity: 1_024,
            max_concurrent_services: 16,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthorityConfig {
    /// Subject DN of the host authority created on first start.
    pub host_dn: String,
    pub validity_days: u32,
    /// Directory the software token keeps its keys in. Keys only live in
    /// memory when unset.
    pub token_dir: Option<PathBuf>,
    pub crl_validity_hours: i64,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            host_dn: "CN=Certa Host CA,O=Certa".to_string(),
            validity_days: 3650,
            token_dir: None,
            crl_validity_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProfileConfig {
    pub id: String,

    pub name: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_validity_days")]
    pub validity_days: u32,

    #[serde(default)]
    pub key_usages: Vec<String>,

    #[serde(default)]
    pub ext_key_usages: Vec<String>,

    /// Approve on submission without waiting for an agent.
    #[serde(default)]
    pub auto_approve: bool,

    /// Profile inputs the requester must supply.
    #[serde(default)]
    pub required_inputs: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_validity_days() -> u32 {
    365
}

fn default_profiles() -> Vec<ProfileConfig> {
    vec![
        ProfileConfig {
            id: "caServerCert".to_string(),
            name: "Manual Server Certificate Enrollment".to_string(),
            enabled: true,
            validity_days: 720,
            key_usages: vec![
                "digital_signature".to_string(),
                "key_encipherment".to_string(),
            ],
            ext_key_usages: vec!["server_auth".to_string()],
            auto_approve: false,
            required_inputs: Vec::new(),
        },
        ProfileConfig {
            id: "caUserCert".to_string(),
            name: "Manual User Dual-Use Certificate Enrollment".to_string(),
            enabled: true,
            validity_days: 365,
            key_usages: vec![
                "digital_signature".to_string(),
                "key_encipherment".to_string(),
            ],
            ext_key_usages: vec!["client_auth".to_string(), "email_protection".to_string()],
            auto_approve: false,
            required_inputs: Vec::new(),
        },
    ]
}

/// A static API token. Only its SHA-256 digest is kept in configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub name: String,

    /// Lowercase hex SHA-256 of the bearer token.
    pub sha256: String,

    #[serde(default)]
    pub permissions: Vec<String>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn missing_key_is_not_found() {
        let store = ConfigStore::from_toml("[queue]\nservice_timeout_secs = 5\n").unwrap();
        assert!(matches!(
            store.get_u64("queue.lock_timeout_ms"),
            Err(ConfigStoreError::NotFound(_))
        ));
        assert_eq!(store.get_u64("queue.service_timeout_secs").unwrap(), 5);
    }

    #[test]
    fn typed_getters() {
        let store = ConfigStore::from_toml(
            "[authority]\nhost_dn = \"CN=Test\"\n[listeners.audit]\nenabled = false\n[policies.k]\nallowed = [\"rsa\", \"ec\"]\n",
        )
        .unwrap();
        assert_eq!(store.get_string("authority.host_dn").unwrap(), "CN=Test");
        assert!(!store.get_bool("listeners.audit.enabled").unwrap());
        assert_eq!(store.get_list("policies.k.allowed").unwrap(), vec!["rsa", "ec"]);
        assert!(matches!(
            store.get_bool("authority.host_dn"),
            Err(ConfigStoreError::Invalid { .. })
        ));
    }

    #[test]
    fn malformed_value_is_invalid_not_missing() {
        let store = ConfigStore::from_toml("[queue]\nservice_timeout_secs = \"soon\"\n").unwrap();
        assert!(matches!(
            store.get_u64("queue.service_timeout_secs"),
            Err(ConfigStoreError::Invalid { .. })
        ));
        assert!(matches!(
            store.get_or("queue.service_timeout_secs", 1u64),
            Err(ConfigStoreError::Invalid { .. })
        ));
    }

    #[test]
    fn get_or_falls_back_when_absent() {
        let store = ConfigStore::empty();
        assert!(store.get_or("queue.listener_workers", 3usize).unwrap() == 3);
    }

    #[test]
    fn engine_config_defaults() {
        let config = ConfigStore::empty().engine_config().unwrap();
        assert_eq!(config.queue.service_timeout_secs, 30);
        assert_eq!(config.serial.request_start, 1);
        assert!(config.profiles.iter().any(|p| p.id == "caServerCert"));
    }

    #[test]
    fn engine_config_reads_sections() {
        let store = ConfigStore::from_toml(
            r#"
            [serial]
            cert_start = 16
            cert_end = 32

            [[profiles]]
            id = "caTest"
            name = "Test"
            auto_approve = true

            [[tokens]]
            name = "agent"
            sha256 = "00"
            permissions = ["requests:review"]
            "#,
        )
        .unwrap();
        let config = store.engine_config().unwrap();
        assert_eq!(config.serial.cert_start, 16);
        assert_eq!(config.profiles.len(), 1);
        assert!(config.profiles[0].auto_approve);
        assert!(config.profiles[0].enabled);
        assert_eq!(config.tokens[0].permissions, vec!["requests:review"]);
    }

    #[test]
    fn inverted_serial_range_is_rejected() {
        let store = ConfigStore::from_toml("[serial]\ncert_start = 9\ncert_end = 2\n").unwrap();
        assert!(matches!(
            store.engine_config(),
            Err(ConfigStoreError::Invalid { .. })
        ));
    }

    #[test]
    fn zero_serial_start_is_rejected() {
        for toml in ["[serial]\ncert_start = 0\n", "[serial]\nrequest_start = 0\n"] {
            let store = ConfigStore::from_toml(toml).unwrap();
            assert!(
                matches!(store.engine_config(), Err(ConfigStoreError::Invalid { .. })),
                "{toml}"
            );
        }
    }

    #[test]
    fn section_names_are_sorted() {
        let store = ConfigStore::from_toml(
            "[policies.zeta]\nkind = \"max_validity\"\n[policies.alpha]\nkind = \"key_algorithm\"\n",
        )
        .unwrap();
        assert_eq!(store.section_names("policies").unwrap(), vec!["alpha", "zeta"]);
        assert!(store.section_names("listeners").unwrap().is_empty());

        let scoped = store.scoped("policies.alpha");
        assert_eq!(scoped.get::<String>("kind").unwrap(), "key_algorithm");
    }
}
