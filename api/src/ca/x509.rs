//! Reading certificates and CSRs, and turning DN strings into rcgen names.

use chrono::{DateTime, Utc};
use rcgen::{DistinguishedName, DnType};
use thiserror::Error;
use x509_parser::{
    certification_request::X509CertificationRequest,
    extensions::ParsedExtension,
    prelude::{FromDer, X509Certificate},
    public_key::PublicKey,
};

const OID_ED25519: &str = "1.3.101.112";
const OID_ED448: &str = "1.3.101.113";

#[derive(Debug, Error)]
pub enum X509Error {
    #[error("Invalid PEM: {0}")]
    Pem(String),

    #[error("Expected a {expected} PEM block, found {found}")]
    Label { expected: &'static str, found: String },

    #[error("Invalid DER: {0}")]
    Der(String),

    #[error("Invalid distinguished name {dn:?}: {reason}")]
    Dn { dn: String, reason: String },
}

/// Decode a single PEM block, checking its label.
pub fn pem_to_der(pem: &str, expected: &'static str) -> Result<Vec<u8>, X509Error> {
    let (label, der) =
        pem_rfc7468::decode_vec(pem.trim().as_bytes()).map_err(|e| X509Error::Pem(e.to_string()))?;
    if label != expected {
        return Err(X509Error::Label {
            expected,
            found: label.to_string(),
        });
    }
    Ok(der)
}

/// What the engine needs to know about a submitted PKCS#10 request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrInfo {
    pub subject_dn: String,
    pub key_algorithm: String,
    pub key_size: Option<u32>,
}

pub fn inspect_csr(csr_pem: &str) -> Result<CsrInfo, X509Error> {
    let der = pem_to_der(csr_pem, "CERTIFICATE REQUEST")?;
    let (_, csr) =
        X509CertificationRequest::from_der(&der).map_err(|e| X509Error::Der(e.to_string()))?;
    let info = &csr.certification_request_info;
    let spki = &info.subject_pki;

    let (key_algorithm, key_size) = match spki.parsed() {
        Ok(PublicKey::RSA(rsa)) => ("rsa".to_string(), Some(rsa.key_size() as u32)),
        Ok(PublicKey::EC(point)) => ("ec".to_string(), Some(point.key_size() as u32)),
        Ok(PublicKey::DSA(_)) => ("dsa".to_string(), None),
        _ => match spki.algorithm.algorithm.to_id_string().as_str() {
            OID_ED25519 => ("ed25519".to_string(), None),
            OID_ED448 => ("ed448".to_string(), None),
            other => (other.to_string(), None),
        },
    };

    Ok(CsrInfo {
        subject_dn: info.subject.to_string(),
        key_algorithm,
        key_size,
    })
}

/// Fields of an issued certificate that end up on its record.
#[derive(Debug, Clone)]
pub struct CertInfo {
    pub subject_dn: String,
    pub issuer_dn: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// Lowercase hex
    pub subject_key_id: Option<String>,
    /// Lowercase hex
    pub authority_key_id: Option<String>,
}

pub fn inspect_cert(cert_pem: &str) -> Result<CertInfo, X509Error> {
    let der = pem_to_der(cert_pem, "CERTIFICATE")?;
    let (_, cert) = X509Certificate::from_der(&der).map_err(|e| X509Error::Der(e.to_string()))?;

    let mut subject_key_id = None;
    let mut authority_key_id = None;
    for ext in cert.extensions() {
        match ext.parsed_extension() {
            ParsedExtension::SubjectKeyIdentifier(kid) => {
                subject_key_id = Some(hex::encode(kid.0));
            }
            ParsedExtension::AuthorityKeyIdentifier(aki) => {
                authority_key_id = aki.key_identifier.as_ref().map(|kid| hex::encode(kid.0));
            }
            _ => {}
        }
    }

    let timestamp = |secs: i64| {
        DateTime::<Utc>::from_timestamp(secs, 0)
            .ok_or_else(|| X509Error::Der(format!("timestamp {secs} out of range")))
    };

    Ok(CertInfo {
        subject_dn: cert.subject().to_string(),
        issuer_dn: cert.issuer().to_string(),
        not_before: timestamp(cert.validity().not_before.timestamp())?,
        not_after: timestamp(cert.validity().not_after.timestamp())?,
        subject_key_id,
        authority_key_id,
    })
}

/// Parse `CN=host,O=Example,C=US` into an rcgen name, keeping attribute
/// order.
pub fn parse_dn(dn: &str) -> Result<DistinguishedName, X509Error> {
    let invalid = |reason: &str| X509Error::Dn {
        dn: dn.to_string(),
        reason: reason.to_string(),
    };

    let mut name = DistinguishedName::new();
    for rdn in split_rdns(dn) {
        let (attr, value) = rdn
            .split_once('=')
            .ok_or_else(|| invalid("attribute without '='"))?;
        let value = value.trim();
        if value.is_empty() {
            return Err(invalid("empty attribute value"));
        }
        let ty = match attr.trim().to_ascii_uppercase().as_str() {
            "CN" => DnType::CommonName,
            "O" => DnType::OrganizationName,
            "OU" => DnType::OrganizationalUnitName,
            "C" => DnType::CountryName,
            "ST" => DnType::StateOrProvinceName,
            "L" => DnType::LocalityName,
            "DC" => DnType::CustomDnType(vec![0, 9, 2342, 19200300, 100, 1, 25]),
            "UID" => DnType::CustomDnType(vec![0, 9, 2342, 19200300, 100, 1, 1]),
            "E" | "EMAILADDRESS" => DnType::CustomDnType(vec![1, 2, 840, 113549, 1, 9, 1]),
            _ => return Err(invalid("unsupported attribute type")),
        };
        name.push(ty, value.replace("\\,", ","));
    }

    if name.iter().next().is_none() {
        return Err(invalid("no attributes"));
    }
    Ok(name)
}

/// Split on commas that are not escaped with a backslash.
fn split_rdns(dn: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, c) in dn.char_indices() {
        match c {
            '\\' if !escaped => escaped = true,
            ',' if !escaped => {
                parts.push(&dn[start..i]);
                start = i + 1;
            }
            _ => escaped = false,
        }
    }
    let last = &dn[start..];
    if !last.trim().is_empty() {
        parts.push(last);
    }
    parts
}

#[cfg(test)]
mod test {
    use rcgen::{CertificateParams, KeyPair};

    use super::*;

    #[test]
    fn parse_dn_keeps_order() {
        let dn = parse_dn("CN=host.example.com, O=Example\\, Inc, C=US").unwrap();
        let types: Vec<_> = dn.iter().map(|(ty, _)| ty.clone()).collect();
        assert_eq!(
            types,
            vec![DnType::CommonName, DnType::OrganizationName, DnType::CountryName]
        );
    }

    #[test]
    fn parse_dn_rejects_garbage() {
        assert!(parse_dn("").is_err());
        assert!(parse_dn("host.example.com").is_err());
        assert!(parse_dn("XX=nope").is_err());
        assert!(parse_dn("CN=").is_err());
    }

    #[test]
    fn inspect_csr_reads_subject_and_key() {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["host.example.com".to_string()]).unwrap();
        params.distinguished_name = parse_dn("CN=host.example.com").unwrap();
        let csr = params.serialize_request(&key).unwrap().pem().unwrap();

        let info = inspect_csr(&csr).unwrap();
        assert_eq!(info.subject_dn, "CN=host.example.com");
        assert_eq!(info.key_algorithm, "ec");
        assert_eq!(info.key_size, Some(256));
    }

    #[test]
    fn inspect_csr_rejects_wrong_label() {
        let key = KeyPair::generate().unwrap();
        let cert = CertificateParams::new(vec![])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        assert!(matches!(
            inspect_csr(&cert.pem()),
            Err(X509Error::Label { .. })
        ));
    }
}
