//! Degenerate PKCS#7 (CMS SignedData with no signers) carrying a certificate
//! chain, the `certs-only` format clients expect next to the leaf PEM.

use cms::{
    cert::CertificateChoices,
    content_info::{CmsVersion, ContentInfo},
    signed_data::{CertificateSet, EncapsulatedContentInfo, SignedData, SignerInfos},
};
use der::{
    Any, Decode, Encode,
    asn1::{ObjectIdentifier, SetOfVec},
};
use thiserror::Error;
use x509_cert::Certificate;

use super::x509::{X509Error, pem_to_der};

const ID_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.1");
const ID_SIGNED_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.2");

#[derive(Debug, Error)]
pub enum Pkcs7Error {
    #[error(transparent)]
    Pem(#[from] X509Error),

    #[error("DER error: {0}")]
    Der(#[from] der::Error),
}

/// Encode `chain_pem` (leaf first) as a certs-only SignedData, DER.
pub fn certs_only<S: AsRef<str>>(chain_pem: &[S]) -> Result<Vec<u8>, Pkcs7Error> {
    let certs = chain_pem
        .iter()
        .map(|pem| {
            let der = pem_to_der(pem.as_ref(), "CERTIFICATE")?;
            Ok(CertificateChoices::Certificate(Certificate::from_der(&der)?))
        })
        .collect::<Result<Vec<_>, Pkcs7Error>>()?;

    let signed_data = SignedData {
        version: CmsVersion::V1,
        digest_algorithms: SetOfVec::new(),
        encap_content_info: EncapsulatedContentInfo {
            econtent_type: ID_DATA,
            econtent: None,
        },
        certificates: Some(CertificateSet(SetOfVec::try_from(certs)?)),
        crls: None,
        signer_infos: SignerInfos(SetOfVec::new()),
    };

    let content_info = ContentInfo {
        content_type: ID_SIGNED_DATA,
        content: Any::encode_from(&signed_data)?,
    };

    Ok(content_info.to_der()?)
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use certa_common::ids::SerialNumber;

    use super::*;
    use crate::ca::signing::{CertTemplate, SoftwareToken};

    #[test]
    fn chain_decodes_back_with_every_certificate() {
        let token = Arc::new(SoftwareToken::in_memory());
        token.generate_key("root").unwrap();
        let root_pem = token.self_signed_ca("root", "CN=Root", 10).unwrap();
        token.generate_key("sub").unwrap();
        let sub_pem = token
            .unit("root", &root_pem)
            .sign_certificate(&CertTemplate::authority("CN=Sub", "sub", 10), SerialNumber::new(2))
            .unwrap();

        let der = certs_only(&[sub_pem, root_pem]).unwrap();

        let info = ContentInfo::from_der(&der).unwrap();
        assert_eq!(info.content_type, ID_SIGNED_DATA);
        let signed: SignedData = info.content.decode_as().unwrap();
        assert_eq!(signed.certificates.unwrap().0.len(), 2);
        assert!(signed.signer_infos.0.is_empty());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(certs_only(&["not a pem"]).is_err());
    }
}
