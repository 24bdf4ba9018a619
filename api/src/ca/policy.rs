//! Approval policies.
//!
//! Policies run when an agent approves a request. Each returns zero or more
//! rejection messages; any message keeps the request PENDING.

use std::sync::Arc;

use certa_db::models::DbRequest;
use regex::Regex;
use tracing::debug;

use crate::config::store::{ConfigStore, ConfigStoreError, PluginFactory, ScopedConfig};

pub trait Policy: Send + Sync {
    fn name(&self) -> &str;

    fn evaluate(&self, request: &DbRequest) -> Vec<String>;
}

const POLICY_KINDS: &[(&str, PluginFactory<Arc<dyn Policy>>)] = &[
    ("subject_pattern", SubjectPatternPolicy::from_config),
    ("max_validity", MaxValidityPolicy::from_config),
    ("key_algorithm", KeyAlgorithmPolicy::from_config),
];

#[derive(Clone, Default)]
pub struct PolicyProcessor {
    policies: Vec<Arc<dyn Policy>>,
}

impl PolicyProcessor {
    pub fn new(policies: Vec<Arc<dyn Policy>>) -> Self {
        Self { policies }
    }

    /// Build the policies configured under `[policies.<name>]`.
    pub fn from_config(store: &ConfigStore) -> Result<Self, ConfigStoreError> {
        Ok(Self::new(store.build_plugins("policies", POLICY_KINDS)?))
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Messages from every policy that rejects `request`, in configuration
    /// order.
    pub fn evaluate(&self, request: &DbRequest) -> Vec<String> {
        let mut messages = Vec::new();
        for policy in &self.policies {
            let rejected = policy.evaluate(request);
            if !rejected.is_empty() {
                debug!(policy = policy.name(), request_id = %request.id, ?rejected, "Policy rejected request");
            }
            messages.extend(rejected);
        }
        messages
    }
}

fn applies_to(profiles: &[String], request: &DbRequest) -> bool {
    profiles.is_empty()
        || request
            .profile_id
            .as_ref()
            .is_some_and(|p| profiles.contains(p))
}

/// Subject DNs must match a regular expression.
pub struct SubjectPatternPolicy {
    name: String,
    pattern: Regex,
    /// Profiles this applies to; all when empty
    profiles: Vec<String>,
}

impl SubjectPatternPolicy {
    pub fn new(name: impl Into<String>, pattern: Regex, profiles: Vec<String>) -> Self {
        Self {
            name: name.into(),
            pattern,
            profiles,
        }
    }

    fn from_config(name: &str, config: &ScopedConfig<'_>) -> Result<Arc<dyn Policy>, ConfigStoreError> {
        let pattern: String = config.get("pattern")?;
        let pattern = Regex::new(&pattern)
            .map_err(|e| ConfigStoreError::invalid(format!("{}.pattern", config.prefix()), e))?;
        let profiles = config.get_or("profiles", Vec::new())?;
        Ok(Arc::new(Self::new(name, pattern, profiles)))
    }
}

impl Policy for SubjectPatternPolicy {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, request: &DbRequest) -> Vec<String> {
        let Some(enrollment) = &request.enrollment else {
            return Vec::new();
        };
        if !applies_to(&self.profiles, request) || self.pattern.is_match(&enrollment.subject_dn) {
            return Vec::new();
        }
        vec![format!(
            "Subject name {} is not allowed by this CA",
            enrollment.subject_dn
        )]
    }
}

/// Caps the requested validity period.
pub struct MaxValidityPolicy {
    name: String,
    max_days: u32,
}

impl MaxValidityPolicy {
    pub fn new(name: impl Into<String>, max_days: u32) -> Self {
        Self {
            name: name.into(),
            max_days,
        }
    }

    fn from_config(name: &str, config: &ScopedConfig<'_>) -> Result<Arc<dyn Policy>, ConfigStoreError> {
        Ok(Arc::new(Self::new(name, config.get("max_days")?)))
    }
}

impl Policy for MaxValidityPolicy {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, request: &DbRequest) -> Vec<String> {
        match &request.enrollment {
            Some(e) if e.validity_days > self.max_days => vec![format!(
                "Validity of {} days exceeds the maximum of {} days",
                e.validity_days, self.max_days
            )],
            _ => Vec::new(),
        }
    }
}

/// Restricts subject key algorithms and RSA key sizes.
pub struct KeyAlgorithmPolicy {
    name: String,
    allowed: Vec<String>,
    min_rsa_bits: u32,
}

impl KeyAlgorithmPolicy {
    pub fn new(name: impl Into<String>, allowed: Vec<String>, min_rsa_bits: u32) -> Self {
        Self {
            name: name.into(),
            allowed: allowed.into_iter().map(|a| a.to_ascii_lowercase()).collect(),
            min_rsa_bits,
        }
    }

    fn from_config(name: &str, config: &ScopedConfig<'_>) -> Result<Arc<dyn Policy>, ConfigStoreError> {
        let allowed = config.get_or(
            "allowed",
            vec!["rsa".to_string(), "ec".to_string(), "ed25519".to_string()],
        )?;
        let min_rsa_bits = config.get_or("min_rsa_bits", 2048)?;
        Ok(Arc::new(Self::new(name, allowed, min_rsa_bits)))
    }
}

impl Policy for KeyAlgorithmPolicy {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, request: &DbRequest) -> Vec<String> {
        let Some(enrollment) = &request.enrollment else {
            return Vec::new();
        };
        let algorithm = enrollment.key_algorithm.to_ascii_lowercase();
        let mut messages = Vec::new();
        if !self.allowed.contains(&algorithm) {
            messages.push(format!("Key algorithm {algorithm} is not allowed"));
        }
        if algorithm == "rsa" {
            match enrollment.key_size {
                Some(bits) if bits >= self.min_rsa_bits => {}
                Some(bits) => messages.push(format!(
                    "RSA key of {bits} bits is shorter than the minimum of {} bits",
                    self.min_rsa_bits
                )),
                None => messages.push("RSA key size could not be determined".to_string()),
            }
        }
        messages
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use certa_common::{ids::RequestId, types::RequestType};
    use certa_db::models::EnrollmentData;

    use super::*;

    fn enrollment(subject: &str, days: u32, algorithm: &str, bits: Option<u32>) -> DbRequest {
        let mut request = DbRequest::new(RequestId::new(1), RequestType::Enrollment);
        request.profile_id = Some("caServerCert".into());
        request.enrollment = Some(EnrollmentData {
            csr_pem: String::new(),
            subject_dn: subject.into(),
            validity_days: days,
            dns_names: Vec::new(),
            key_algorithm: algorithm.into(),
            key_size: bits,
            inputs: BTreeMap::new(),
        });
        request
    }

    fn processor(toml: &str) -> PolicyProcessor {
        PolicyProcessor::from_config(&ConfigStore::from_toml(toml).unwrap()).unwrap()
    }

    #[test]
    fn collects_messages_from_every_policy() {
        let policies = processor(
            r#"
            [policies.subject]
            kind = "subject_pattern"
            pattern = "O=Example$"

            [policies.validity]
            kind = "max_validity"
            max_days = 90

            [policies.keys]
            kind = "key_algorithm"
            "#,
        );
        assert_eq!(policies.len(), 3);

        let bad = enrollment("CN=www,O=Other", 365, "rsa", Some(1024));
        assert_eq!(policies.evaluate(&bad).len(), 3);

        let good = enrollment("CN=www,O=Example", 30, "ec", Some(256));
        assert!(policies.evaluate(&good).is_empty());
    }

    #[test]
    fn subject_pattern_is_scoped_to_profiles() {
        let policies = processor(
            r#"
            [policies.users]
            kind = "subject_pattern"
            pattern = "^UID="
            profiles = ["caUserCert"]
            "#,
        );
        assert!(policies.evaluate(&enrollment("CN=host", 1, "ec", None)).is_empty());
    }

    #[test]
    fn disabled_policy_is_skipped() {
        let policies = processor(
            "[policies.v]\nkind = \"max_validity\"\nmax_days = 1\nenabled = false\n",
        );
        assert!(policies.is_empty());
    }

    #[test]
    fn revocations_are_not_inspected() {
        let policies = processor("[policies.v]\nkind = \"max_validity\"\nmax_days = 1\n");
        let request = DbRequest::new(RequestId::new(2), RequestType::Revocation);
        assert!(policies.evaluate(&request).is_empty());
    }

    #[test]
    fn bad_pattern_is_invalid_config() {
        let store =
            ConfigStore::from_toml("[policies.s]\nkind = \"subject_pattern\"\npattern = \"(\"\n")
                .unwrap();
        assert!(matches!(
            PolicyProcessor::from_config(&store),
            Err(ConfigStoreError::Invalid { .. })
        ));
    }
}
