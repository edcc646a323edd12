//! Device identity certificate.
//!
//! Every device owns one long-lived self-signed X.509 certificate whose
//! common name is the device id. Peers pin each other's certificate at
//! pairing time; no chain verification ever happens.

use crate::{ProtocolError, Result};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{BasicConstraints, KeyUsage};
use openssl::x509::{X509Name, X509};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use tracing::{debug, info};
use uuid::Uuid;

const CERTIFICATE_FILE: &str = "certificate.pem";
const PRIVATE_KEY_FILE: &str = "privateKey.pem";

const CERT_VALIDITY_DAYS: u32 = 10 * 365;
const CERT_ORG: &str = "KDE";
const CERT_ORG_UNIT: &str = "Kde connect";

/// A loaded or freshly generated certificate plus its private key.
#[derive(Clone)]
pub struct CertificateInfo {
    /// Device id, recovered from the certificate common name.
    pub device_id: String,

    pub certificate: X509,

    pub private_key: PKey<Private>,

    /// SHA-256 fingerprint, colon-separated hex.
    pub fingerprint: String,
}

impl CertificateInfo {
    /// Load the certificate pair from `config_dir`, generating a new
    /// identity when none exists yet. The device id is whatever the
    /// certificate CN says, so it stays stable across restarts.
    pub fn load_or_generate(config_dir: impl AsRef<Path>) -> Result<Self> {
        let config_dir = config_dir.as_ref();
        fs::create_dir_all(config_dir)?;

        let cert_path = config_dir.join(CERTIFICATE_FILE);
        let key_path = config_dir.join(PRIVATE_KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            let loaded = Self::load(&cert_path, &key_path)?;
            info!(
                "Loaded certificate for device {} ({})",
                loaded.device_id, loaded.fingerprint
            );
            return Ok(loaded);
        }

        let device_id = Uuid::new_v4().simple().to_string();
        let generated = Self::generate(&device_id)?;

        fs::write(&cert_path, generated.certificate.to_pem()?)?;
        fs::write(&key_path, generated.private_key.private_key_to_pem_pkcs8()?)?;

        info!(
            "Generated certificate for device {} ({})",
            generated.device_id, generated.fingerprint
        );
        Ok(generated)
    }

    /// Generate a fresh self-signed certificate with CN = `device_id`.
    pub fn generate(device_id: &str) -> Result<Self> {
        debug!("Generating RSA key pair");
        let rsa = Rsa::generate(2048)?;
        let pkey = PKey::from_rsa(rsa)?;

        let mut builder = X509::builder()?;
        builder.set_version(2)?;

        let mut serial = BigNum::new()?;
        serial.rand(159, MsbOption::MAYBE_ZERO, false)?;
        let serial_asn1 = serial.to_asn1_integer()?;
        builder.set_serial_number(&serial_asn1)?;

        let mut name = X509Name::builder()?;
        name.append_entry_by_text("O", CERT_ORG)?;
        name.append_entry_by_text("OU", CERT_ORG_UNIT)?;
        name.append_entry_by_text("CN", device_id)?;
        let name = name.build();
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;

        let not_before = Asn1Time::days_from_now(0)?;
        let not_after = Asn1Time::days_from_now(CERT_VALIDITY_DAYS)?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;

        builder.set_pubkey(&pkey)?;
        builder.append_extension(BasicConstraints::new().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .digital_signature()
                .key_encipherment()
                .key_agreement()
                .build()?,
        )?;

        builder.sign(&pkey, MessageDigest::sha256())?;
        let certificate = builder.build();

        let fingerprint = fingerprint(&certificate)?;

        Ok(Self {
            device_id: device_id.to_string(),
            certificate,
            private_key: pkey,
            fingerprint,
        })
    }

    fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let certificate = X509::from_pem(&fs::read(cert_path)?)?;
        let private_key = PKey::private_key_from_pem(&fs::read(key_path)?)?;

        let device_id = common_name(&certificate).ok_or_else(|| {
            ProtocolError::Certificate("certificate carries no common name".to_string())
        })?;
        let fingerprint = fingerprint(&certificate)?;

        Ok(Self {
            device_id,
            certificate,
            private_key,
            fingerprint,
        })
    }

    /// PEM encoding of the certificate, as stored for trusted peers.
    pub fn to_pem(&self) -> Result<String> {
        let pem = self.certificate.to_pem()?;
        String::from_utf8(pem)
            .map_err(|_| ProtocolError::Certificate("non UTF-8 PEM output".to_string()))
    }
}

/// Extract the subject common name from a certificate.
pub fn common_name(certificate: &X509) -> Option<String> {
    certificate
        .subject_name()
        .entries_by_nid(openssl::nid::Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|cn| cn.to_string())
}

/// Encode a peer certificate as PEM for the trust store.
pub fn peer_cert_pem(certificate: &X509) -> Result<String> {
    let der = certificate.to_der()?;
    Ok(pem::encode(&pem::Pem::new("CERTIFICATE", der)))
}

fn fingerprint(certificate: &X509) -> Result<String> {
    let der = certificate.to_der()?;
    let hash = Sha256::digest(&der);
    Ok(hash
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generate() {
        let cert = CertificateInfo::generate("test_device_123").unwrap();
        assert_eq!(cert.device_id, "test_device_123");
        assert_eq!(common_name(&cert.certificate).as_deref(), Some("test_device_123"));

        // 32 hash bytes, colon separated
        assert_eq!(cert.fingerprint.split(':').count(), 32);
    }

    #[test]
    fn test_identity_is_stable_across_reload() {
        let dir = TempDir::new().unwrap();

        let first = CertificateInfo::load_or_generate(dir.path()).unwrap();
        let second = CertificateInfo::load_or_generate(dir.path()).unwrap();

        assert_eq!(first.device_id, second.device_id);
        assert_eq!(first.fingerprint, second.fingerprint);
    }

    #[test]
    fn test_peer_cert_pem_roundtrip() {
        let cert = CertificateInfo::generate("roundtrip").unwrap();
        let pem = peer_cert_pem(&cert.certificate).unwrap();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));

        let parsed = X509::from_pem(pem.as_bytes()).unwrap();
        assert_eq!(common_name(&parsed).as_deref(), Some("roundtrip"));
    }
}
