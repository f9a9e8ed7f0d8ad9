//! Fleet Bootstrap - Trust Bootstrap for Fleet Agent Deployments
//!
//! Provisions everything a fleet agent deployment needs before the first
//! client enrolls: a private CA, a CA-signed server certificate, a
//! server/client configuration pair, and a signed startup manifest that tells
//! clients what to do on first contact.
//!
//! # Overview
//!
//! ```text
//! CA (self-signed, pathlen=0)
//!   └── Server certificate (signed by CA, CA=false)
//!         └── Signed manifest (RSA-SHA256 over the manifest JSON)
//! ```
//!
//! All artifacts live under one configuration directory with fixed file
//! names, so running bootstrap again against the same directory finds and
//! reuses them:
//!
//! | File | Contents |
//! |---|---|
//! | `ca.private_key.pem` / `ca.cert.pem` | deployment CA |
//! | `server.private_key.pem` / `server.certificate.pem` | server identity |
//! | `server.config.yaml` | full configuration, including server secrets |
//! | `client.config.yaml` | client projection: client policy and CA certificate |
//!
//! # Guarantees
//!
//! - ✅ Existing key material is never regenerated behind the operator's back
//! - ✅ Certificates are verified against the CA before they are written
//! - ✅ The client document cannot carry server keys
//! - ✅ The manifest signature is checked against the persisted CA before publication
//! - ⚠️ One bootstrap at a time per directory; there is no locking
//!
//! # Quick Start
//!
//! ```bash
//! # Manifest served by the agent HTTP frontend
//! fleet-bootstrap initialize-http /etc/fleet-agent/deploy --labels lab-machines
//!
//! # Manifest uploaded to a storage bucket
//! fleet-bootstrap initialize-object-store /etc/fleet-agent/deploy \
//!     --bucket fleet-manifests --service-account-path sa.json
//! ```
//!
//! # Library Usage
//!
//! ```no_run
//! use fleet_bootstrap::bootstrap::Bootstrap;
//! use fleet_bootstrap::configs::BootstrapSettings;
//! use fleet_bootstrap::configuration::Labels;
//! use fleet_bootstrap::crypto_provider::OpenSslProvider;
//! use fleet_bootstrap::deployment::HttpDeployment;
//!
//! let settings = BootstrapSettings::default();
//! let provider = OpenSslProvider::new(settings.keys.bits);
//! let deployment = HttpDeployment::new(None, "127.0.0.1", 8000)?;
//!
//! let mut progress: Vec<String> = Vec::new();
//! let outcome = Bootstrap::new("/etc/fleet-agent/deploy", &settings, &provider, &deployment)
//!     .labels(Labels::normalize(["lab-machines"]))
//!     .run(&mut progress)?;
//! println!("server config at {}", outcome.server_config_path.display());
//! # Ok::<(), fleet_bootstrap::Error>(())
//! ```
//!
//! # Module Overview
//!
//! - [`trust`]: CA and server certificate provisioning
//! - [`configuration`]: configuration documents and labels
//! - [`manifest`]: startup manifest and its signed envelope
//! - [`deployment`]: object-store and HTTP deployment policies
//! - [`bootstrap`]: the state machine tying them together
//!
//! # Error Handling
//!
//! Library APIs return [`Result`] with the [`Error`] taxonomy. A failed
//! [`bootstrap::Bootstrap::run`] returns [`Error::Halted`] naming the last
//! state reached; [`Error::root`] gives the underlying cause.

pub mod bootstrap;
pub mod commands;
pub mod configs;
pub mod configuration;
pub mod crypto_provider;
pub mod deployment;
pub mod error;
pub mod key_store;
pub mod manifest;
pub mod secret;
pub mod trust;

pub use bootstrap::{Bootstrap, BootstrapOutcome, BootstrapState, Progress};
pub use error::{Error, Result};
