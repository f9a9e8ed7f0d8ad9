//! Startup manifest and its signed envelope
//!
//! The manifest lists the actions a client runs on first contact with the
//! deployment. It is serialized once to JSON, and the signature covers
//! exactly those bytes; the envelope carries the bytes verbatim so that
//! clients verify what was signed, not a re-serialization.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use serde::{Deserialize, Serialize};

use crate::crypto_provider::CryptoProvider;
use crate::deployment::{DeploymentPolicy, Location};
use crate::error::{Error, Result};

/// Queue clients report their startup interrogation to
pub const STARTUP_QUEUE: &str = "Startup";
pub const CLIENT_ID_TEMPLATE: &str = "{client_id}";
const STARTUP_TICKET_LIFETIME_DAYS: i64 = 365;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StartupAction {
    /// Collect host information and upload it to `report_to`
    Interrogate { report_to: Location },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Runtime metadata handed to the client session
    #[serde(default)]
    pub session: BTreeMap<String, String>,
    pub startup_actions: Vec<StartupAction>,
    pub issued_at: DateTime<Utc>,
}

impl Manifest {
    /// The default manifest: interrogate once and report to the Startup queue
    pub fn startup(deployment: &dyn DeploymentPolicy, now: DateTime<Utc>) -> Self {
        let expires_at = now + Duration::days(STARTUP_TICKET_LIFETIME_DAYS);
        let report_to = deployment.startup_location(STARTUP_QUEUE, CLIENT_ID_TEMPLATE, expires_at);

        let mut session = BTreeMap::new();
        session.insert("live".to_string(), "API".to_string());

        Self {
            session,
            startup_actions: vec![StartupAction::Interrogate { report_to }],
            issued_at: now,
        }
    }

    /// Serialized form covered by the signature
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| Error::serialization(format!("failed to serialize manifest: {}", e)))
    }
}

/// Manifest bytes, their signature and the signing certificate
///
/// There are no setters: any change means issuing a new envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedManifest {
    data: String,
    /// Base64 RSA-SHA256 signature over `data`
    signature: String,
    /// PEM certificate of the signing server key
    server_certificate: String,
}

impl SignedManifest {
    /// Serialize and sign `manifest` with the server key
    pub fn issue(
        manifest: &Manifest,
        server_key: &PKey<Private>,
        server_cert: &X509,
        provider: &dyn CryptoProvider,
    ) -> Result<Self> {
        if !provider.key_matches_certificate(server_key, server_cert)? {
            return Err(Error::verification(
                "manifest signing key does not match the server certificate",
            ));
        }

        let bytes = manifest.canonical_bytes()?;
        let signature = provider.sign(server_key, &bytes)?;
        let data = String::from_utf8(bytes)
            .map_err(|e| Error::serialization(format!("manifest is not UTF-8: {}", e)))?;
        let server_certificate = String::from_utf8(server_cert.to_pem()?)
            .map_err(|e| Error::serialization(format!("certificate PEM is not UTF-8: {}", e)))?;

        Ok(Self {
            data,
            signature: STANDARD.encode(signature),
            server_certificate,
        })
    }

    pub fn data(&self) -> &str {
        &self.data
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn server_certificate_pem(&self) -> &str {
        &self.server_certificate
    }

    pub fn server_certificate(&self) -> Result<X509> {
        X509::from_pem(self.server_certificate.as_bytes()).map_err(|e| {
            Error::verification(format!("manifest server certificate does not parse: {}", e))
        })
    }

    /// Decode the signed manifest
    pub fn manifest(&self) -> Result<Manifest> {
        serde_json::from_str(&self.data)
            .map_err(|e| Error::serialization(format!("signed manifest data is invalid: {}", e)))
    }

    /// Check the signing certificate chains to `ca_cert` and the signature
    /// covers `data`
    pub fn verify(&self, ca_cert: &X509, provider: &dyn CryptoProvider) -> Result<()> {
        let server_cert = self.server_certificate()?;
        if !provider.verify_certificate(&server_cert, ca_cert)? {
            return Err(Error::verification(
                "manifest was signed by a certificate that does not chain to the CA",
            ));
        }

        let signature = STANDARD
            .decode(&self.signature)
            .map_err(|e| Error::verification(format!("manifest signature is not base64: {}", e)))?;
        if !provider.verify_signature(&server_cert, self.data.as_bytes(), &signature)? {
            return Err(Error::verification(
                "manifest signature does not match its contents",
            ));
        }
        Ok(())
    }

    /// Bytes handed to the publication sink
    pub fn to_publication_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| Error::serialization(format!("failed to serialize signed manifest: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::CaSubject;
    use crate::crypto_provider::tests::test_provider;
    use crate::crypto_provider::OpenSslProvider;
    use crate::deployment::HttpDeployment;

    struct Keys {
        provider: OpenSslProvider,
        ca_cert: X509,
        server_key: PKey<Private>,
        server_cert: X509,
    }

    fn keys() -> Keys {
        let provider = test_provider();
        let ca_key = provider.generate_key().unwrap();
        let ca_cert = provider
            .self_signed_ca(&ca_key, &CaSubject::default())
            .unwrap();
        let server_key = provider.generate_key().unwrap();
        let server_cert = provider
            .ca_signed_cert("Fleet Agent Server", 30, &server_key, &ca_cert, &ca_key)
            .unwrap();
        Keys {
            provider,
            ca_cert,
            server_key,
            server_cert,
        }
    }

    fn manifest() -> Manifest {
        let deployment = HttpDeployment::new(None, "127.0.0.1", 8000).unwrap();
        Manifest::startup(&deployment, Utc::now())
    }

    #[test]
    fn startup_manifest_reports_to_startup_queue() {
        let manifest = manifest();
        assert_eq!(manifest.session.get("live").map(String::as_str), Some("API"));
        assert_eq!(manifest.startup_actions.len(), 1);

        let StartupAction::Interrogate { report_to } = &manifest.startup_actions[0];
        assert_eq!(report_to.to_path(), "http://127.0.0.1:8000/upload/Startup");
        assert!(report_to.expires_at().unwrap() > manifest.issued_at + Duration::days(364));
    }

    #[test]
    fn issued_manifest_verifies_and_decodes() {
        let k = keys();
        let manifest = manifest();
        let signed =
            SignedManifest::issue(&manifest, &k.server_key, &k.server_cert, &k.provider).unwrap();

        signed.verify(&k.ca_cert, &k.provider).unwrap();
        assert_eq!(signed.manifest().unwrap(), manifest);
    }

    #[test]
    fn altered_payload_fails_verification() {
        let k = keys();
        let mut signed =
            SignedManifest::issue(&manifest(), &k.server_key, &k.server_cert, &k.provider)
                .unwrap();

        signed.data = signed.data.replacen("Startup", "Startuq", 1);
        assert!(matches!(
            signed.verify(&k.ca_cert, &k.provider),
            Err(Error::Verification(_))
        ));
    }

    #[test]
    fn foreign_ca_fails_verification() {
        let k = keys();
        let other = keys();
        let signed =
            SignedManifest::issue(&manifest(), &k.server_key, &k.server_cert, &k.provider)
                .unwrap();

        assert!(matches!(
            signed.verify(&other.ca_cert, &k.provider),
            Err(Error::Verification(_))
        ));
    }

    #[test]
    fn mismatched_signing_key_is_refused() {
        let k = keys();
        let stray = k.provider.generate_key().unwrap();
        assert!(matches!(
            SignedManifest::issue(&manifest(), &stray, &k.server_cert, &k.provider),
            Err(Error::Verification(_))
        ));
    }
}
