//! Configuration Assembler
//!
//! Builds the server configuration document from the trust material and the
//! selected deployment, and derives the client document from it. The client
//! document is a projection of the server one: [`ClientConfiguration`] has no
//! field that could hold server material, and the only way to build one from
//! a live configuration is [`Configuration::client_configuration`].

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use openssl::x509::X509;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::crypto_provider::CryptoProvider;
use crate::deployment::{ClientPolicy, DeploymentPolicy, ServerPolicy};
use crate::error::{Error, Result};
use crate::key_store::write_staged;
use crate::manifest::{Manifest, SignedManifest};
use crate::secret::SecretPem;
use crate::trust::{CaBundle, ServerBundle};

pub const SERVER_CONFIG_FILENAME: &str = "server.config.yaml";
pub const CLIENT_CONFIG_FILENAME: &str = "client.config.yaml";
pub const CLIENT_CONFIG_WARNING: &str =
    "# Warning: Do not edit this file. Edit the server config instead.\n";

/// Label every client carries
pub const DEFAULT_LABEL: &str = "All";
pub const DEFAULT_WRITEBACK_PATH: &str = "/etc/fleet-agent/agent.local.json";

const SHARED_SECRET_BYTES: usize = 16;

/// Client labels; always contains [`DEFAULT_LABEL`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct Labels(BTreeSet<String>);

impl Labels {
    pub fn normalize<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set: BTreeSet<String> = labels
            .into_iter()
            .map(Into::into)
            .map(|label| label.trim().to_string())
            .filter(|label| !label.is_empty())
            .collect();
        set.insert(DEFAULT_LABEL.to_string());
        Labels(set)
    }

    pub fn contains(&self, label: &str) -> bool {
        self.0.contains(label)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for Labels {
    fn default() -> Self {
        Labels::normalize(Vec::<String>::new())
    }
}

impl From<Vec<String>> for Labels {
    fn from(labels: Vec<String>) -> Self {
        Labels::normalize(labels)
    }
}

impl From<Labels> for Vec<String> {
    fn from(labels: Labels) -> Self {
        labels.0.into_iter().collect()
    }
}

/// Server-only part of the configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    pub policy: ServerPolicy,
    /// PEM server certificate
    pub certificate: String,
    pub private_key: SecretPem,
}

/// Everything a client needs to enroll
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSection {
    pub policy: ClientPolicy,
    pub labels: Labels,
    /// Shared deployment secret
    pub secret: SecretPem,
    /// Where the client keeps its local state
    pub writeback_path: String,
}

/// The server configuration document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    /// PEM CA certificate
    pub ca_certificate: String,
    pub server: ServerSection,
    pub client: ClientSection,
    pub manifest: Manifest,
    pub signed_manifest: SignedManifest,
}

/// The client configuration document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfiguration {
    client: ClientSection,
    ca_certificate: String,
}

impl ClientConfiguration {
    pub fn client(&self) -> &ClientSection {
        &self.client
    }

    pub fn ca_certificate_pem(&self) -> &str {
        &self.ca_certificate
    }
}

/// Inputs to [`assemble`]
pub struct AssembleInput<'a> {
    pub deployment: &'a dyn DeploymentPolicy,
    pub ca: &'a CaBundle,
    pub server: &'a ServerBundle,
    pub labels: Labels,
    pub writeback_path: String,
    /// Secret carried over from a previous configuration; a new one is
    /// generated when `None`
    pub secret: Option<SecretPem>,
}

/// Build a new configuration and sign its startup manifest
pub fn assemble(input: AssembleInput<'_>, provider: &dyn CryptoProvider) -> Result<Configuration> {
    let secret = match input.secret {
        Some(secret) => secret,
        None => {
            debug!("generating new shared secret");
            SecretPem::random_hex(SHARED_SECRET_BYTES)?
        }
    };

    let manifest = Manifest::startup(input.deployment, Utc::now());
    let signed_manifest = SignedManifest::issue(
        &manifest,
        &input.server.private_key,
        &input.server.certificate,
        provider,
    )?;

    Ok(Configuration {
        ca_certificate: pem_string(&input.ca.certificate)?,
        server: ServerSection {
            policy: input.deployment.server_policy()?,
            certificate: pem_string(&input.server.certificate)?,
            private_key: SecretPem::from_private_key(&input.server.private_key)?,
        },
        client: ClientSection {
            policy: input.deployment.client_policy(),
            labels: input.labels,
            secret,
            writeback_path: input.writeback_path,
        },
        manifest,
        signed_manifest,
    })
}

fn pem_string(cert: &X509) -> Result<String> {
    String::from_utf8(cert.to_pem()?)
        .map_err(|e| Error::serialization(format!("certificate PEM is not UTF-8: {}", e)))
}

impl Configuration {
    /// The client document: client section and CA certificate only
    pub fn client_configuration(&self) -> ClientConfiguration {
        ClientConfiguration {
            client: self.client.clone(),
            ca_certificate: self.ca_certificate.clone(),
        }
    }

    pub fn ca_certificate(&self) -> Result<X509> {
        X509::from_pem(self.ca_certificate.as_bytes())
            .map_err(|e| Error::crypto(format!("CA certificate does not parse: {}", e)))
    }

    pub fn server_certificate(&self) -> Result<X509> {
        X509::from_pem(self.server.certificate.as_bytes())
            .map_err(|e| Error::crypto(format!("server certificate does not parse: {}", e)))
    }

    /// Every embedded PEM must parse
    fn check_material(&self) -> std::result::Result<(), String> {
        self.ca_certificate().map_err(|e| e.to_string())?;
        self.server_certificate().map_err(|e| e.to_string())?;
        self.server
            .private_key
            .to_private_key()
            .map_err(|e| e.to_string())?;
        self.signed_manifest
            .server_certificate()
            .map_err(|e| e.to_string())?;
        Ok(())
    }
}

/// Reads and writes the configuration documents in the config directory
#[derive(Debug, Clone)]
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn server_path(&self) -> PathBuf {
        self.dir.join(SERVER_CONFIG_FILENAME)
    }

    pub fn client_path(&self) -> PathBuf {
        self.dir.join(CLIENT_CONFIG_FILENAME)
    }

    /// Load the server document, `None` if it does not exist
    ///
    /// A document that exists but does not parse, or whose certificates and
    /// keys do not parse, is a [`Error::ConfigurationParse`].
    pub fn load_server(&self) -> Result<Option<Configuration>> {
        let path = self.server_path();
        let Some(text) = read_document(&path)? else {
            return Ok(None);
        };

        let config: Configuration =
            serde_yaml::from_str(&text).map_err(|e| parse_error(&path, e.to_string()))?;
        config
            .check_material()
            .map_err(|reason| parse_error(&path, reason))?;

        debug!(path = %path.display(), "loaded server configuration");
        Ok(Some(config))
    }

    /// Load the client document, `None` if it does not exist
    pub fn load_client(&self) -> Result<Option<ClientConfiguration>> {
        let path = self.client_path();
        let Some(text) = read_document(&path)? else {
            return Ok(None);
        };

        let config = serde_yaml::from_str(&text).map_err(|e| parse_error(&path, e.to_string()))?;
        Ok(Some(config))
    }

    pub fn write_server(&self, config: &Configuration) -> Result<PathBuf> {
        let path = self.server_path();
        let yaml = serde_yaml::to_string(config)
            .map_err(|e| Error::serialization(format!("failed to serialize server config: {}", e)))?;
        write_staged(&path, yaml.as_bytes(), true)?;
        info!(path = %path.display(), "wrote server configuration");
        Ok(path)
    }

    pub fn write_client(&self, config: &ClientConfiguration) -> Result<PathBuf> {
        let path = self.client_path();
        let yaml = serde_yaml::to_string(config)
            .map_err(|e| Error::serialization(format!("failed to serialize client config: {}", e)))?;
        let document = format!("{}{}", CLIENT_CONFIG_WARNING, yaml);
        write_staged(&path, document.as_bytes(), false)?;
        info!(path = %path.display(), "wrote client configuration");
        Ok(path)
    }
}

fn read_document(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    fs::read_to_string(path)
        .map(Some)
        .map_err(|e| parse_error(path, e.to_string()))
}

fn parse_error(path: &Path, reason: String) -> Error {
    Error::ConfigurationParse {
        path: path.to_path_buf(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::BootstrapSettings;
    use crate::crypto_provider::tests::test_provider;
    use crate::crypto_provider::OpenSslProvider;
    use crate::deployment::HttpDeployment;
    use crate::key_store::KeyStore;
    use crate::trust::TrustBootstrapper;
    use secrecy::ExposeSecret;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: ConfigStore,
        provider: OpenSslProvider,
        ca: CaBundle,
        server: ServerBundle,
        deployment: HttpDeployment,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let keys = KeyStore::new(dir.path());
        let provider = test_provider();
        let settings = BootstrapSettings::default();
        let trust = TrustBootstrapper::new(&keys, &provider, &settings);
        let ca = trust.ensure_ca().unwrap();
        let server = trust.ensure_server_cert(&ca).unwrap();

        Fixture {
            store: ConfigStore::new(dir.path()),
            _dir: dir,
            provider,
            ca,
            server,
            deployment: HttpDeployment::new(None, "127.0.0.1", 8000).unwrap(),
        }
    }

    fn build(f: &Fixture, labels: Labels, secret: Option<SecretPem>) -> Configuration {
        assemble(
            AssembleInput {
                deployment: &f.deployment,
                ca: &f.ca,
                server: &f.server,
                labels,
                writeback_path: DEFAULT_WRITEBACK_PATH.to_string(),
                secret,
            },
            &f.provider,
        )
        .unwrap()
    }

    #[test]
    fn labels_always_include_all() {
        assert_eq!(Labels::normalize(Vec::<String>::new()).iter().collect::<Vec<_>>(), ["All"]);
        assert_eq!(
            Labels::normalize(["foo"]).iter().collect::<Vec<_>>(),
            ["All", "foo"]
        );
        assert_eq!(Labels::normalize(["All", "All", " "]).len(), 1);
    }

    #[test]
    fn deserialized_labels_are_normalized() {
        let labels: Labels = serde_yaml::from_str("- lab-machines\n").unwrap();
        assert!(labels.contains("All"));
        assert!(labels.contains("lab-machines"));
    }

    #[test]
    fn assembled_configuration_is_signed() {
        let f = fixture();
        let config = build(&f, Labels::normalize(["lab-machines"]), None);

        assert!(config.client.labels.contains("All"));
        assert!(config.client.labels.contains("lab-machines"));
        assert_eq!(config.client.secret.expose_secret().len(), SHARED_SECRET_BYTES * 2);
        config
            .signed_manifest
            .verify(&config.ca_certificate().unwrap(), &f.provider)
            .unwrap();
    }

    #[test]
    fn provided_secret_is_kept() {
        let f = fixture();
        let config = build(&f, Labels::default(), Some(SecretPem::new("00ff00ff")));
        assert_eq!(config.client.secret.expose_secret(), "00ff00ff");
    }

    #[test]
    fn client_document_holds_no_server_material() {
        let f = fixture();
        let config = build(&f, Labels::default(), None);

        f.store.write_client(&config.client_configuration()).unwrap();
        let text = fs::read_to_string(f.store.client_path()).unwrap();

        assert!(text.starts_with(CLIENT_CONFIG_WARNING));
        assert!(!text.contains("PRIVATE KEY"));
        assert!(!text.contains(config.server.certificate.lines().nth(1).unwrap()));
        assert!(text.contains(config.ca_certificate.lines().nth(1).unwrap()));
    }

    #[test]
    fn server_document_round_trips() {
        let f = fixture();
        let config = build(&f, Labels::normalize(["foo"]), None);

        assert!(f.store.load_server().unwrap().is_none());
        f.store.write_server(&config).unwrap();
        let loaded = f.store.load_server().unwrap().unwrap();

        assert_eq!(loaded.ca_certificate, config.ca_certificate);
        assert_eq!(loaded.client.labels, config.client.labels);
        assert!(loaded.client.secret.matches(&config.client.secret));
        assert_eq!(loaded.signed_manifest, config.signed_manifest);
    }

    #[test]
    fn client_secret_can_be_read_back() {
        let f = fixture();
        let config = build(&f, Labels::default(), None);
        f.store.write_client(&config.client_configuration()).unwrap();

        let client = f.store.load_client().unwrap().unwrap();
        assert!(client.client().secret.matches(&config.client.secret));
        assert_eq!(client.ca_certificate_pem(), config.ca_certificate);
    }

    #[test]
    fn garbage_server_document_is_a_parse_error() {
        let f = fixture();
        fs::write(f.store.server_path(), "ca_certificate: [unterminated").unwrap();

        assert!(matches!(
            f.store.load_server(),
            Err(Error::ConfigurationParse { .. })
        ));
    }

    #[test]
    fn corrupt_certificate_in_server_document_is_a_parse_error() {
        let f = fixture();
        let mut config = build(&f, Labels::default(), None);
        config.ca_certificate = "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n".into();
        f.store.write_server(&config).unwrap();

        assert!(matches!(
            f.store.load_server(),
            Err(Error::ConfigurationParse { .. })
        ));
    }
}
