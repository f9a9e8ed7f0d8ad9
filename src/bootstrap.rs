//! Bootstrap Orchestration
//!
//! Runs the provisioning flow as a strict sequence of states:
//!
//! ```text
//! START -> CA_READY -> SERVER_CERT_READY -> CONFIG_WRITTEN -> MANIFEST_SIGNED -> PUBLISHED -> DONE
//! ```
//!
//! Every step is fatal on failure. The error returned by [`Bootstrap::run`]
//! is an [`Error::Halted`] naming the last state that was reached, wrapping
//! the error that stopped the run.

use std::fmt;
use std::path::{Path, PathBuf};

use openssl::x509::X509;

use tracing::{info, warn};

use crate::configs::BootstrapSettings;
use crate::configuration::{
    assemble, AssembleInput, ConfigStore, Configuration, Labels, DEFAULT_WRITEBACK_PATH,
};
use crate::crypto_provider::CryptoProvider;
use crate::deployment::DeploymentPolicy;
use crate::error::{Error, Result};
use crate::key_store::{KeyStore, PairKind};
use crate::trust::{Origin, ServerBundle, TrustBootstrapper};

pub const DONE_MESSAGE: &str = "Done!";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BootstrapState {
    Start,
    CaReady,
    ServerCertReady,
    ConfigWritten,
    ManifestSigned,
    Published,
    Done,
}

impl fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BootstrapState::Start => "START",
            BootstrapState::CaReady => "CA_READY",
            BootstrapState::ServerCertReady => "SERVER_CERT_READY",
            BootstrapState::ConfigWritten => "CONFIG_WRITTEN",
            BootstrapState::ManifestSigned => "MANIFEST_SIGNED",
            BootstrapState::Published => "PUBLISHED",
            BootstrapState::Done => "DONE",
        };
        f.write_str(name)
    }
}

/// Receives human-readable progress messages
pub trait Progress {
    fn step(&mut self, message: &str);

    /// Multi-line output, such as the manifest dump
    fn block(&mut self, title: &str, body: &str);

    fn done(&mut self) {
        self.step(DONE_MESSAGE);
    }
}

/// Prints progress to stdout
#[derive(Debug, Default)]
pub struct ConsoleProgress;

impl Progress for ConsoleProgress {
    fn step(&mut self, message: &str) {
        println!("✓ {}", message);
    }

    fn block(&mut self, title: &str, body: &str) {
        println!("\n{}:\n{}", title, body.trim_end());
    }

    fn done(&mut self) {
        println!("\n{}", DONE_MESSAGE);
    }
}

/// Collects progress messages, mostly for tests
impl Progress for Vec<String> {
    fn step(&mut self, message: &str) {
        self.push(message.to_string());
    }

    fn block(&mut self, title: &str, body: &str) {
        self.push(format!("{}:\n{}", title, body));
    }
}

/// Result of a successful run
#[derive(Debug)]
pub struct BootstrapOutcome {
    pub configuration: Configuration,
    pub ca_origin: Origin,
    pub server_origin: Origin,
    /// An existing server configuration was reused
    pub config_reused: bool,
    pub server_config_path: PathBuf,
    pub client_config_path: PathBuf,
    /// Where the manifest was published; `None` when it is served from the
    /// configuration
    pub published_to: Option<String>,
}

pub struct Bootstrap<'a> {
    dir: PathBuf,
    settings: &'a BootstrapSettings,
    provider: &'a dyn CryptoProvider,
    deployment: &'a dyn DeploymentPolicy,
    labels: Labels,
    writeback_path: String,
}

impl<'a> Bootstrap<'a> {
    pub fn new(
        dir: impl Into<PathBuf>,
        settings: &'a BootstrapSettings,
        provider: &'a dyn CryptoProvider,
        deployment: &'a dyn DeploymentPolicy,
    ) -> Self {
        Self {
            dir: dir.into(),
            settings,
            provider,
            deployment,
            labels: Labels::default(),
            writeback_path: DEFAULT_WRITEBACK_PATH.to_string(),
        }
    }

    pub fn labels(mut self, labels: Labels) -> Self {
        self.labels = labels;
        self
    }

    pub fn writeback_path(mut self, path: impl Into<String>) -> Self {
        self.writeback_path = path.into();
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Run every step in order
    pub fn run(&self, progress: &mut dyn Progress) -> Result<BootstrapOutcome> {
        let mut state = BootstrapState::Start;
        self.execute(&mut state, progress).map_err(|source| {
            warn!(%state, error = %source, "bootstrap halted");
            Error::Halted {
                state,
                source: Box::new(source),
            }
        })
    }

    fn execute(
        &self,
        state: &mut BootstrapState,
        progress: &mut dyn Progress,
    ) -> Result<BootstrapOutcome> {
        let keys = KeyStore::new(&self.dir);
        let configs = ConfigStore::new(&self.dir);

        keys.check_writable()?;
        report(progress, format!("Config directory {}", self.dir.display()));

        // START -> CA_READY
        let trust = TrustBootstrapper::new(&keys, self.provider, self.settings);
        let ca = trust.ensure_ca()?;
        let ca_path = keys.cert_path(PairKind::Ca);
        match ca.origin {
            Origin::Generated => report(
                progress,
                format!("Generated new CA certificate {}", ca_path.display()),
            ),
            Origin::Reused => report(
                progress,
                format!("Reusing CA certificate {}", ca_path.display()),
            ),
        }
        advance(state, BootstrapState::CaReady);

        // CA_READY -> SERVER_CERT_READY
        let server = trust.ensure_server_cert(&ca)?;
        let server_path = keys.cert_path(PairKind::Server);
        match server.origin {
            Origin::Generated => report(
                progress,
                format!("Issued new server certificate {}", server_path.display()),
            ),
            Origin::Reused => report(
                progress,
                format!("Reusing server certificate {}", server_path.display()),
            ),
        }
        advance(state, BootstrapState::ServerCertReady);

        // SERVER_CERT_READY -> CONFIG_WRITTEN
        // Nothing is written until the configuration agrees with the key store
        let persisted_ca = keys.load_pair(PairKind::Ca)?.certificate;
        let (configuration, config_reused) = match configs.load_server()? {
            Some(existing) => {
                let found = existing.server.policy.kind();
                if found != self.deployment.kind() {
                    return Err(Error::DeploymentMismatch {
                        expected: self.deployment.kind().to_string(),
                        found: found.to_string(),
                    });
                }
                self.check_configuration(&existing, &persisted_ca, &configs)?;
                self.check_reused_server(&existing, &server, &configs)?;
                if existing.client.labels != self.labels {
                    warn!(
                        path = %configs.server_path().display(),
                        "existing configuration keeps its own labels; requested labels ignored"
                    );
                }
                report(
                    progress,
                    format!(
                        "Reusing server configuration {}",
                        configs.server_path().display()
                    ),
                );
                (existing, true)
            }
            None => {
                let secret = configs
                    .load_client()?
                    .map(|client| client.client().secret.clone());
                if secret.is_some() {
                    info!("carrying over shared secret from existing client configuration");
                }

                let assembled = assemble(
                    AssembleInput {
                        deployment: self.deployment,
                        ca: &ca,
                        server: &server,
                        labels: self.labels.clone(),
                        writeback_path: self.writeback_path.clone(),
                        secret,
                    },
                    self.provider,
                )?;
                self.check_configuration(&assembled, &persisted_ca, &configs)?;
                let path = configs.write_server(&assembled)?;

                // What clients get must be what was just written
                let reloaded = configs.load_server()?.ok_or_else(|| Error::ConfigurationParse {
                    path: path.clone(),
                    reason: "server configuration vanished after writing".to_string(),
                })?;
                report(
                    progress,
                    format!("Wrote server configuration {}", path.display()),
                );
                (reloaded, false)
            }
        };
        let client_path = configs.write_client(&configuration.client_configuration())?;
        report(
            progress,
            format!("Wrote client configuration {}", client_path.display()),
        );
        advance(state, BootstrapState::ConfigWritten);

        // CONFIG_WRITTEN -> MANIFEST_SIGNED
        configuration
            .signed_manifest
            .verify(&persisted_ca, self.provider)?;
        report(progress, "Verified signed manifest against the CA".to_string());
        advance(state, BootstrapState::ManifestSigned);

        // MANIFEST_SIGNED -> PUBLISHED
        let published_to = match self
            .deployment
            .manifest_for_server(&configuration.server.policy)?
        {
            Some(sink) => {
                let bytes = configuration.signed_manifest.to_publication_bytes()?;
                sink.write_file(&bytes)?;
                let target = sink.describe();
                report(progress, format!("Published manifest to {}", target));
                Some(target)
            }
            None => {
                report(
                    progress,
                    "Manifest is served from the server configuration".to_string(),
                );
                None
            }
        };
        advance(state, BootstrapState::Published);

        // PUBLISHED -> DONE
        let signed = configuration.signed_manifest.manifest()?;
        let manifest_yaml = serde_yaml::to_string(&signed)
            .map_err(|e| Error::serialization(format!("failed to render manifest: {}", e)))?;
        progress.block("Manifest", &manifest_yaml);
        advance(state, BootstrapState::Done);
        progress.done();

        Ok(BootstrapOutcome {
            configuration,
            ca_origin: ca.origin,
            server_origin: server.origin,
            config_reused,
            server_config_path: configs.server_path(),
            client_config_path: client_path,
            published_to,
        })
    }

    /// The configuration must embed the persisted CA and carry a manifest
    /// signed under it
    fn check_configuration(
        &self,
        configuration: &Configuration,
        persisted_ca: &X509,
        configs: &ConfigStore,
    ) -> Result<()> {
        if configuration.ca_certificate()?.to_der()? != persisted_ca.to_der()? {
            return Err(Error::verification(format!(
                "server configuration {} embeds a CA certificate other than {}",
                configs.server_path().display(),
                self.dir.join(PairKind::Ca.cert_filename()).display()
            )));
        }
        configuration
            .signed_manifest
            .verify(persisted_ca, self.provider)
    }

    /// A reused configuration must hold the server pair from the key store
    /// and the manifest that was actually signed
    fn check_reused_server(
        &self,
        configuration: &Configuration,
        server: &ServerBundle,
        configs: &ConfigStore,
    ) -> Result<()> {
        let config_path = configs.server_path();
        let cert = configuration.server_certificate()?;
        let key = configuration.server.private_key.to_private_key()?;
        if !self.provider.key_matches_certificate(&key, &cert)? {
            return Err(Error::verification(format!(
                "server configuration {} holds a private key that does not belong to its server certificate",
                config_path.display()
            )));
        }
        if cert.to_der()? != server.certificate.to_der()? {
            return Err(Error::verification(format!(
                "server configuration {} holds a different server certificate than {}; restore the original server key pair or remove {} to reassemble",
                config_path.display(),
                self.dir.join(PairKind::Server.cert_filename()).display(),
                config_path.display()
            )));
        }
        if configuration.signed_manifest.manifest()? != configuration.manifest {
            return Err(Error::verification(format!(
                "manifest section of {} does not match the signed manifest",
                config_path.display()
            )));
        }
        Ok(())
    }
}

fn report(progress: &mut dyn Progress, message: String) {
    info!("{}", message);
    progress.step(&message);
}

fn advance(state: &mut BootstrapState, next: BootstrapState) {
    debug_assert!(next > *state);
    *state = next;
    info!(state = %next, "bootstrap state reached");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto_provider::tests::test_provider;
    use crate::deployment::HttpDeployment;
    use secrecy::ExposeSecret;
    use std::fs;

    fn http() -> HttpDeployment {
        HttpDeployment::new(None, "127.0.0.1", 8000).unwrap()
    }

    #[test]
    fn state_names() {
        assert_eq!(BootstrapState::Start.to_string(), "START");
        assert_eq!(BootstrapState::ServerCertReady.to_string(), "SERVER_CERT_READY");
        assert!(BootstrapState::Published < BootstrapState::Done);
    }

    #[test]
    fn fresh_directory_runs_to_done() {
        let dir = tempfile::tempdir().unwrap();
        let settings = BootstrapSettings::default();
        let provider = test_provider();
        let deployment = http();
        let mut messages: Vec<String> = Vec::new();

        let outcome = Bootstrap::new(dir.path(), &settings, &provider, &deployment)
            .labels(Labels::normalize(["lab-machines"]))
            .run(&mut messages)
            .unwrap();

        assert_eq!(messages.last().map(String::as_str), Some(DONE_MESSAGE));
        assert!(messages.iter().any(|m| m.starts_with("Manifest:")));
        assert_eq!(outcome.ca_origin, Origin::Generated);
        assert_eq!(outcome.server_origin, Origin::Generated);
        assert!(!outcome.config_reused);
        assert!(outcome.published_to.is_none());
        assert!(outcome.server_config_path.exists());
        assert!(outcome.client_config_path.exists());
    }

    #[test]
    fn second_run_reuses_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let settings = BootstrapSettings::default();
        let provider = test_provider();
        let deployment = http();
        let bootstrap = Bootstrap::new(dir.path(), &settings, &provider, &deployment);

        let first = bootstrap.run(&mut Vec::<String>::new()).unwrap();
        let second = bootstrap.run(&mut Vec::<String>::new()).unwrap();

        assert!(second.config_reused);
        assert_eq!(second.ca_origin, Origin::Reused);
        assert_eq!(
            first.configuration.client.secret.expose_secret(),
            second.configuration.client.secret.expose_secret()
        );
        assert_eq!(
            first.configuration.signed_manifest,
            second.configuration.signed_manifest
        );
    }

    #[test]
    fn lost_server_config_keeps_client_secret() {
        let dir = tempfile::tempdir().unwrap();
        let settings = BootstrapSettings::default();
        let provider = test_provider();
        let deployment = http();
        let bootstrap = Bootstrap::new(dir.path(), &settings, &provider, &deployment);

        let first = bootstrap.run(&mut Vec::<String>::new()).unwrap();
        fs::remove_file(&first.server_config_path).unwrap();
        let second = bootstrap.run(&mut Vec::<String>::new()).unwrap();

        assert!(!second.config_reused);
        assert!(second
            .configuration
            .client
            .secret
            .matches(&first.configuration.client.secret));
    }

    #[test]
    fn ca_cert_without_key_halts_at_start() {
        let dir = tempfile::tempdir().unwrap();
        let settings = BootstrapSettings::default();
        let provider = test_provider();
        let deployment = http();
        let bootstrap = Bootstrap::new(dir.path(), &settings, &provider, &deployment);

        bootstrap.run(&mut Vec::<String>::new()).unwrap();
        fs::remove_file(dir.path().join(crate::key_store::CA_PRIVATE_KEY_FILENAME)).unwrap();

        match bootstrap.run(&mut Vec::<String>::new()) {
            Err(Error::Halted { state, source }) => {
                assert_eq!(state, BootstrapState::Start);
                assert!(matches!(*source, Error::InconsistentArtifact { .. }));
            }
            other => panic!("expected halt, got {:?}", other.map(|o| o.config_reused)),
        }
    }

    #[test]
    fn regenerated_ca_does_not_match_kept_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let settings = BootstrapSettings::default();
        let provider = test_provider();
        let deployment = http();
        let bootstrap = Bootstrap::new(dir.path(), &settings, &provider, &deployment);

        bootstrap.run(&mut Vec::<String>::new()).unwrap();
        fs::remove_file(dir.path().join(crate::key_store::CA_PRIVATE_KEY_FILENAME)).unwrap();
        fs::remove_file(dir.path().join(crate::key_store::CA_CERT_FILENAME)).unwrap();

        fs::remove_file(dir.path().join(crate::configuration::CLIENT_CONFIG_FILENAME)).unwrap();

        let err = bootstrap.run(&mut Vec::<String>::new()).unwrap_err();
        match &err {
            Error::Halted { state, .. } => assert_eq!(*state, BootstrapState::ServerCertReady),
            other => panic!("unexpected error: {}", other),
        }
        assert!(matches!(err.root(), Error::Verification(_)));
        assert!(!dir
            .path()
            .join(crate::configuration::CLIENT_CONFIG_FILENAME)
            .exists());
    }

    #[test]
    fn reissued_server_pair_does_not_match_kept_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let settings = BootstrapSettings::default();
        let provider = test_provider();
        let deployment = http();
        let bootstrap = Bootstrap::new(dir.path(), &settings, &provider, &deployment);

        let first = bootstrap.run(&mut Vec::<String>::new()).unwrap();
        let client_before = fs::read(&first.client_config_path).unwrap();
        fs::remove_file(dir.path().join(crate::key_store::SERVER_PRIVATE_KEY_FILENAME)).unwrap();
        fs::remove_file(dir.path().join(crate::key_store::SERVER_CERT_FILENAME)).unwrap();

        let mut messages: Vec<String> = Vec::new();
        let err = bootstrap.run(&mut messages).unwrap_err();

        match &err {
            Error::Halted { state, .. } => assert_eq!(*state, BootstrapState::ServerCertReady),
            other => panic!("unexpected error: {}", other),
        }
        assert!(matches!(err.root(), Error::Verification(_)));
        assert!(err.root().to_string().contains("different server certificate"));
        assert!(!messages
            .iter()
            .any(|m| m.starts_with("Reusing server configuration")));
        assert_eq!(fs::read(&first.client_config_path).unwrap(), client_before);
    }

    #[test]
    fn edited_manifest_section_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let settings = BootstrapSettings::default();
        let provider = test_provider();
        let deployment = http();
        let bootstrap = Bootstrap::new(dir.path(), &settings, &provider, &deployment);

        let first = bootstrap.run(&mut Vec::<String>::new()).unwrap();
        let document = fs::read_to_string(&first.server_config_path).unwrap();
        let edited = document.replacen("live: API", "live: Edited", 1);
        assert_ne!(document, edited);
        fs::write(&first.server_config_path, edited).unwrap();

        let err = bootstrap.run(&mut Vec::<String>::new()).unwrap_err();
        assert!(matches!(err.root(), Error::Verification(_)));
        assert!(err.root().to_string().contains("signed manifest"));
    }

    #[test]
    fn printed_manifest_is_the_signed_one() {
        let dir = tempfile::tempdir().unwrap();
        let settings = BootstrapSettings::default();
        let provider = test_provider();
        let deployment = http();
        let mut messages: Vec<String> = Vec::new();

        let outcome = Bootstrap::new(dir.path(), &settings, &provider, &deployment)
            .run(&mut messages)
            .unwrap();

        let signed = outcome.configuration.signed_manifest.manifest().unwrap();
        let expected = format!("Manifest:\n{}", serde_yaml::to_string(&signed).unwrap());
        assert!(messages.contains(&expected));
    }
}
