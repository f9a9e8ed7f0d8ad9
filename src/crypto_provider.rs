//! Crypto Provider
//!
//! Key generation, X.509 certificate construction and signature primitives
//! consumed by the trust bootstrapper and manifest issuer. The bootstrap
//! logic only talks to the [`CryptoProvider`] trait; [`OpenSslProvider`] is
//! the production implementation.
//!
//! # Certificate Properties
//! - **CA**: self-signed, X.509v3, `CA=true, pathlen=0` (critical),
//!   keyCertSign + cRLSign + digitalSignature
//! - **Server**: signed by the CA, `CA=false`, digitalSignature +
//!   keyEncipherment, extended key usage serverAuth
//! - **Serial Number**: random 128-bit
//! - **Signature Algorithm**: SHA-256 with RSA

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::sign::{Signer, Verifier};
use openssl::x509::extension::{BasicConstraints, ExtendedKeyUsage, KeyUsage};
use openssl::x509::{X509Builder, X509Name, X509};

use crate::configs::CaSubject;
use crate::error::{Error, Result};

const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2
const CA_PATH_LENGTH: u32 = 0;
const SERIAL_BITS: i32 = 128;

/// Key and certificate primitives used during bootstrap
pub trait CryptoProvider {
    /// Generate a fresh RSA private key
    fn generate_key(&self) -> Result<PKey<Private>>;

    /// Build a self-signed CA certificate for `key`
    fn self_signed_ca(&self, key: &PKey<Private>, subject: &CaSubject) -> Result<X509>;

    /// Build a certificate for `key` with CN `identity`, signed by the CA
    fn ca_signed_cert(
        &self,
        identity: &str,
        validity_days: u32,
        key: &PKey<Private>,
        ca_cert: &X509,
        ca_key: &PKey<Private>,
    ) -> Result<X509>;

    /// Check that `cert` carries a valid signature from `issuer`'s key
    fn verify_certificate(&self, cert: &X509, issuer: &X509) -> Result<bool> {
        let issuer_key = issuer.public_key()?;
        // Some key mismatches surface as an error stack instead of `false`
        Ok(cert.verify(&issuer_key).unwrap_or(false))
    }

    /// Check that `cert` certifies the public half of `key`
    fn key_matches_certificate(&self, key: &PKey<Private>, cert: &X509) -> Result<bool> {
        let cert_key = cert.public_key()?;
        Ok(cert_key.public_eq(key))
    }

    /// Sign `data` with `key` (SHA-256)
    fn sign(&self, key: &PKey<Private>, data: &[u8]) -> Result<Vec<u8>> {
        let mut signer = Signer::new(MessageDigest::sha256(), key)?;
        Ok(signer.sign_oneshot_to_vec(data)?)
    }

    /// Verify a signature over `data` against the public key in `cert`
    fn verify_signature(&self, cert: &X509, data: &[u8], signature: &[u8]) -> Result<bool> {
        let public_key = cert.public_key()?;
        let mut verifier = Verifier::new(MessageDigest::sha256(), &public_key)?;
        // A malformed signature is reported by openssl as an error stack rather
        // than a mismatch; both mean "does not verify".
        Ok(verifier.verify_oneshot(signature, data).unwrap_or(false))
    }
}

/// RSA/X.509 provider backed by openssl
#[derive(Debug, Clone)]
pub struct OpenSslProvider {
    key_bits: u32,
}

impl Default for OpenSslProvider {
    fn default() -> Self {
        Self { key_bits: 4096 }
    }
}

impl OpenSslProvider {
    pub fn new(key_bits: u32) -> Self {
        Self { key_bits }
    }

    pub fn key_bits(&self) -> u32 {
        self.key_bits
    }

    fn builder(
        &self,
        subject: &X509Name,
        key: &PKey<Private>,
        validity_days: u32,
    ) -> Result<X509Builder> {
        let mut builder = X509::builder()?;
        builder.set_version(X509_VERSION_3)?;

        let mut serial = BigNum::new()?;
        serial.rand(SERIAL_BITS, MsbOption::MAYBE_ZERO, false)?;
        let asn1_serial = serial.to_asn1_integer()?;
        builder.set_serial_number(&asn1_serial)?;

        builder.set_subject_name(subject)?;

        let not_before = Asn1Time::days_from_now(0)?;
        builder.set_not_before(&not_before)?;
        let not_after = Asn1Time::days_from_now(validity_days)?;
        builder.set_not_after(&not_after)?;

        builder.set_pubkey(key)?;
        Ok(builder)
    }
}

fn ca_name(subject: &CaSubject) -> Result<X509Name> {
    let mut name_builder = X509Name::builder()?;
    name_builder
        .append_entry_by_nid(Nid::COMMONNAME, &subject.common_name)
        .map_err(|e| Error::crypto(format!("failed to set CN: {}", e)))?;
    name_builder
        .append_entry_by_nid(Nid::ORGANIZATIONNAME, &subject.organization)
        .map_err(|e| Error::crypto(format!("failed to set organization: {}", e)))?;
    name_builder
        .append_entry_by_nid(Nid::ORGANIZATIONALUNITNAME, &subject.organizational_unit)
        .map_err(|e| Error::crypto(format!("failed to set organizational unit: {}", e)))?;

    let optional = [
        (Nid::LOCALITYNAME, &subject.locality),
        (Nid::STATEORPROVINCENAME, &subject.state),
        (Nid::COUNTRYNAME, &subject.country),
    ];
    for (nid, value) in optional {
        if let Some(value) = value {
            name_builder
                .append_entry_by_nid(nid, value)
                .map_err(|e| Error::crypto(format!("failed to set {:?}: {}", nid, e)))?;
        }
    }
    Ok(name_builder.build())
}

impl CryptoProvider for OpenSslProvider {
    fn generate_key(&self) -> Result<PKey<Private>> {
        let rsa = Rsa::generate(self.key_bits)
            .map_err(|e| Error::crypto(format!("failed to generate RSA keypair: {}", e)))?;
        PKey::from_rsa(rsa).map_err(|e| Error::crypto(format!("failed to create private key: {}", e)))
    }

    fn self_signed_ca(&self, key: &PKey<Private>, subject: &CaSubject) -> Result<X509> {
        let name = ca_name(subject)?;
        let mut builder = self.builder(&name, key, subject.validity_days)?;

        // Self-signed: issuer is the subject
        builder.set_issuer_name(&name)?;

        let bc = BasicConstraints::new()
            .critical()
            .ca()
            .pathlen(CA_PATH_LENGTH)
            .build()
            .map_err(|e| Error::crypto(format!("failed to build BasicConstraints: {}", e)))?;
        builder.append_extension(bc)?;

        let ku = KeyUsage::new()
            .critical()
            .key_cert_sign()
            .crl_sign()
            .digital_signature()
            .build()
            .map_err(|e| Error::crypto(format!("failed to build KeyUsage: {}", e)))?;
        builder.append_extension(ku)?;

        builder
            .sign(key, MessageDigest::sha256())
            .map_err(|e| Error::crypto(format!("failed to sign CA certificate: {}", e)))?;
        Ok(builder.build())
    }

    fn ca_signed_cert(
        &self,
        identity: &str,
        validity_days: u32,
        key: &PKey<Private>,
        ca_cert: &X509,
        ca_key: &PKey<Private>,
    ) -> Result<X509> {
        let mut name_builder = X509Name::builder()?;
        name_builder
            .append_entry_by_nid(Nid::COMMONNAME, identity)
            .map_err(|e| Error::crypto(format!("failed to set CN: {}", e)))?;
        let name = name_builder.build();

        let mut builder = self.builder(&name, key, validity_days)?;
        builder.set_issuer_name(ca_cert.subject_name())?;

        // End-entity certificate
        let bc = BasicConstraints::new()
            .critical()
            .build()
            .map_err(|e| Error::crypto(format!("failed to build BasicConstraints: {}", e)))?;
        builder.append_extension(bc)?;

        let ku = KeyUsage::new()
            .critical()
            .digital_signature()
            .key_encipherment()
            .build()
            .map_err(|e| Error::crypto(format!("failed to build KeyUsage: {}", e)))?;
        builder.append_extension(ku)?;

        let eku = ExtendedKeyUsage::new()
            .server_auth()
            .build()
            .map_err(|e| Error::crypto(format!("failed to build ExtendedKeyUsage: {}", e)))?;
        builder.append_extension(eku)?;

        builder
            .sign(ca_key, MessageDigest::sha256())
            .map_err(|e| Error::crypto(format!("failed to sign certificate: {}", e)))?;
        Ok(builder.build())
    }
}

/// Common name of a certificate's subject, if present
pub fn common_name(cert: &X509) -> Option<String> {
    cert.subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|cn| cn.to_string())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_provider() -> OpenSslProvider {
        OpenSslProvider::new(2048)
    }

    fn make_ca(provider: &OpenSslProvider, cn: &str) -> (PKey<Private>, X509) {
        let key = provider.generate_key().unwrap();
        let subject = CaSubject {
            common_name: cn.to_string(),
            ..CaSubject::default()
        };
        let cert = provider.self_signed_ca(&key, &subject).unwrap();
        (key, cert)
    }

    #[test]
    fn ca_is_self_signed() {
        let provider = test_provider();
        let (_, ca_cert) = make_ca(&provider, "Test CA");

        assert!(provider.verify_certificate(&ca_cert, &ca_cert).unwrap());
        assert_eq!(common_name(&ca_cert).as_deref(), Some("Test CA"));
    }

    #[test]
    fn server_cert_chains_only_to_its_ca() {
        let provider = test_provider();
        let (ca_key, ca_cert) = make_ca(&provider, "Test CA");
        let (_, other_ca) = make_ca(&provider, "Other CA");

        let server_key = provider.generate_key().unwrap();
        let server_cert = provider
            .ca_signed_cert("Fleet Agent Server", 365, &server_key, &ca_cert, &ca_key)
            .unwrap();

        assert!(provider.verify_certificate(&server_cert, &ca_cert).unwrap());
        assert!(!provider.verify_certificate(&server_cert, &other_ca).unwrap());
        assert!(provider
            .key_matches_certificate(&server_key, &server_cert)
            .unwrap());
        assert!(!provider.key_matches_certificate(&ca_key, &server_cert).unwrap());
        assert_eq!(
            common_name(&server_cert).as_deref(),
            Some("Fleet Agent Server")
        );
    }

    #[test]
    fn signature_detects_tampering() {
        let provider = test_provider();
        let (ca_key, ca_cert) = make_ca(&provider, "Test CA");

        let data = b"startup actions";
        let signature = provider.sign(&ca_key, data).unwrap();
        assert!(provider.verify_signature(&ca_cert, data, &signature).unwrap());
        assert!(!provider
            .verify_signature(&ca_cert, b"startup actionz", &signature)
            .unwrap());
        assert!(!provider.verify_signature(&ca_cert, data, b"short").unwrap());
    }
}
