//! Enrollment profiles.

use std::collections::BTreeMap;

use certa_db::models::EnrollmentData;
use rcgen::{ExtendedKeyUsagePurpose, KeyUsagePurpose};
use thiserror::Error;

use super::signing::{CertTemplate, SubjectKey};
use crate::config::store::{ConfigStoreError, ProfileConfig};

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("Profile {0} not found")]
    NotFound(String),

    #[error("Profile {0} is disabled")]
    Disabled(String),

    #[error("Profile {profile} requires input {input}")]
    MissingInput { profile: String, input: String },
}

#[derive(Debug, Clone)]
pub struct Profile {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub validity_days: u32,
    pub key_usages: Vec<KeyUsagePurpose>,
    pub ext_key_usages: Vec<ExtendedKeyUsagePurpose>,
    pub auto_approve: bool,
    pub required_inputs: Vec<String>,
}

impl Profile {
    fn from_config(config: &ProfileConfig) -> Result<Self, ConfigStoreError> {
        let key = |field: &str| format!("profiles.{}.{field}", config.id);
        let key_usages = config
            .key_usages
            .iter()
            .map(|u| parse_key_usage(u).ok_or_else(|| ConfigStoreError::invalid(key("key_usages"), u)))
            .collect::<Result<_, _>>()?;
        let ext_key_usages = config
            .ext_key_usages
            .iter()
            .map(|u| {
                parse_ext_key_usage(u)
                    .ok_or_else(|| ConfigStoreError::invalid(key("ext_key_usages"), u))
            })
            .collect::<Result<_, _>>()?;

        Ok(Self {
            id: config.id.clone(),
            name: config.name.clone(),
            enabled: config.enabled,
            validity_days: config.validity_days,
            key_usages,
            ext_key_usages,
            auto_approve: config.auto_approve,
            required_inputs: config.required_inputs.clone(),
        })
    }

    pub fn check_inputs(&self, inputs: &BTreeMap<String, String>) -> Result<(), ProfileError> {
        match self
            .required_inputs
            .iter()
            .find(|input| inputs.get(*input).is_none_or(|v| v.trim().is_empty()))
        {
            Some(input) => Err(ProfileError::MissingInput {
                profile: self.id.clone(),
                input: input.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Certificate template for an approved enrollment under this profile.
    pub fn build_template(&self, enrollment: &EnrollmentData) -> CertTemplate {
        let mut template = CertTemplate::new(
            enrollment.subject_dn.clone(),
            SubjectKey::Csr(enrollment.csr_pem.clone()),
            enrollment.validity_days,
        );
        template.dns_names = enrollment.dns_names.clone();
        template.key_usages = self.key_usages.clone();
        template.ext_key_usages = self.ext_key_usages.clone();
        template
    }
}

fn parse_key_usage(name: &str) -> Option<KeyUsagePurpose> {
    Some(match name {
        "digital_signature" => KeyUsagePurpose::DigitalSignature,
        "content_commitment" | "non_repudiation" => KeyUsagePurpose::ContentCommitment,
        "key_encipherment" => KeyUsagePurpose::KeyEncipherment,
        "data_encipherment" => KeyUsagePurpose::DataEncipherment,
        "key_agreement" => KeyUsagePurpose::KeyAgreement,
        "key_cert_sign" => KeyUsagePurpose::KeyCertSign,
        "crl_sign" => KeyUsagePurpose::CrlSign,
        "encipher_only" => KeyUsagePurpose::EncipherOnly,
        "decipher_only" => KeyUsagePurpose::DecipherOnly,
        _ => return None,
    })
}

fn parse_ext_key_usage(name: &str) -> Option<ExtendedKeyUsagePurpose> {
    Some(match name {
        "any" => ExtendedKeyUsagePurpose::Any,
        "server_auth" => ExtendedKeyUsagePurpose::ServerAuth,
        "client_auth" => ExtendedKeyUsagePurpose::ClientAuth,
        "code_signing" => ExtendedKeyUsagePurpose::CodeSigning,
        "email_protection" => ExtendedKeyUsagePurpose::EmailProtection,
        "time_stamping" => ExtendedKeyUsagePurpose::TimeStamping,
        "ocsp_signing" => ExtendedKeyUsagePurpose::OcspSigning,
        _ => return None,
    })
}

#[derive(Debug, Clone, Default)]
pub struct ProfileRegistry {
    profiles: BTreeMap<String, Profile>,
}

impl ProfileRegistry {
    pub fn from_config(configs: &[ProfileConfig]) -> Result<Self, ConfigStoreError> {
        let mut profiles = BTreeMap::new();
        for config in configs {
            let profile = Profile::from_config(config)?;
            if profiles.insert(profile.id.clone(), profile).is_some() {
                return Err(ConfigStoreError::invalid(
                    "profiles",
                    format!("duplicate profile id {}", config.id),
                ));
            }
        }
        Ok(Self { profiles })
    }

    /// An enabled profile.
    pub fn get(&self, id: &str) -> Result<&Profile, ProfileError> {
        match self.profiles.get(id) {
            Some(profile) if profile.enabled => Ok(profile),
            Some(_) => Err(ProfileError::Disabled(id.to_string())),
            None => Err(ProfileError::NotFound(id.to_string())),
        }
    }

    pub fn list(&self) -> impl Iterator<Item = &Profile> {
        self.profiles.values()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::store::ConfigStore;

    fn registry() -> ProfileRegistry {
        let store = ConfigStore::from_toml(
            r#"
            [[profiles]]
            id = "caServerCert"
            name = "Server"
            key_usages = ["digital_signature", "key_encipherment"]
            ext_key_usages = ["server_auth"]
            required_inputs = ["requestor_email"]

            [[profiles]]
            id = "caOld"
            name = "Old"
            enabled = false
            "#,
        )
        .unwrap();
        ProfileRegistry::from_config(&store.engine_config().unwrap().profiles).unwrap()
    }

    #[test]
    fn disabled_and_unknown_profiles_are_distinguished() {
        let registry = registry();
        assert!(registry.get("caServerCert").is_ok());
        assert!(matches!(registry.get("caOld"), Err(ProfileError::Disabled(_))));
        assert!(matches!(registry.get("caNope"), Err(ProfileError::NotFound(_))));
        assert_eq!(registry.list().count(), 2);
    }

    #[test]
    fn required_inputs_must_be_present_and_non_empty() {
        let registry = registry();
        let profile = registry.get("caServerCert").unwrap();
        let mut inputs = BTreeMap::new();
        assert!(profile.check_inputs(&inputs).is_err());
        inputs.insert("requestor_email".to_string(), " ".to_string());
        assert!(profile.check_inputs(&inputs).is_err());
        inputs.insert("requestor_email".to_string(), "a@example.com".to_string());
        assert!(profile.check_inputs(&inputs).is_ok());
    }

    #[test]
    fn template_takes_usages_from_profile() {
        let registry = registry();
        let profile = registry.get("caServerCert").unwrap();
        let enrollment = EnrollmentData {
            csr_pem: "csr".into(),
            subject_dn: "CN=www.example.com".into(),
            validity_days: 10,
            dns_names: vec!["www.example.com".into()],
            key_algorithm: "ec".into(),
            key_size: Some(256),
            inputs: BTreeMap::new(),
        };
        let template = profile.build_template(&enrollment);
        assert_eq!(template.key_usages.len(), 2);
        assert_eq!(template.ext_key_usages, vec![ExtendedKeyUsagePurpose::ServerAuth]);
        assert_eq!((template.not_after - template.not_before).num_days(), 10);
        assert!(!template.is_ca);
    }

    #[test]
    fn unknown_usage_is_rejected() {
        let config = ProfileConfig {
            id: "x".into(),
            name: "x".into(),
            enabled: true,
            validity_days: 1,
            key_usages: vec!["sign_everything".into()],
            ext_key_usages: Vec::new(),
            auto_approve: false,
            required_inputs: Vec::new(),
        };
        assert!(matches!(
            ProfileRegistry::from_config(&[config]),
            Err(ConfigStoreError::Invalid { .. })
        ));
    }
}
