//! Operator settings for certificate generation
//!
//! Settings are read once at startup from an optional TOML file and passed
//! down explicitly. Every field has a default, so an empty file (or no file)
//! yields a working configuration.
//!
//! ```toml
//! [ca]
//! common_name = "Fleet Agent CA"
//! validity_days = 3650
//!
//! [server]
//! identity = "Fleet Agent Server"
//!
//! [keys]
//! bits = 4096
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

/// Identity string placed in the server certificate
pub const DEFAULT_SERVER_IDENTITY: &str = "Fleet Agent Server";

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct BootstrapSettings {
    #[serde(default)]
    pub ca: CaSubject,
    #[serde(default)]
    pub server: ServerIdentity,
    #[serde(default)]
    pub keys: KeySettings,
}

/// Distinguished name and lifetime of the deployment CA
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CaSubject {
    #[serde(default = "default_ca_cn")]
    pub common_name: String,
    #[serde(default = "default_ca_org")]
    pub organization: String,
    #[serde(default = "default_ca_ou")]
    pub organizational_unit: String,
    #[serde(default)]
    pub locality: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default = "default_ca_validity")]
    pub validity_days: u32,
}

impl Default for CaSubject {
    fn default() -> Self {
        Self {
            common_name: default_ca_cn(),
            organization: default_ca_org(),
            organizational_unit: default_ca_ou(),
            locality: None,
            state: None,
            country: None,
            validity_days: default_ca_validity(),
        }
    }
}

fn default_ca_cn() -> String {
    "Fleet Agent CA".to_string()
}

fn default_ca_org() -> String {
    "Fleet Agent".to_string()
}

fn default_ca_ou() -> String {
    "Deployment".to_string()
}

fn default_ca_validity() -> u32 {
    3650 // 10 years
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerIdentity {
    #[serde(default = "default_server_identity")]
    pub identity: String,
    #[serde(default = "default_server_validity")]
    pub validity_days: u32,
}

impl Default for ServerIdentity {
    fn default() -> Self {
        Self {
            identity: default_server_identity(),
            validity_days: default_server_validity(),
        }
    }
}

fn default_server_identity() -> String {
    DEFAULT_SERVER_IDENTITY.to_string()
}

fn default_server_validity() -> u32 {
    1825 // 5 years
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct KeySettings {
    #[serde(default = "default_key_bits")]
    pub bits: u32,
}

impl Default for KeySettings {
    fn default() -> Self {
        Self {
            bits: default_key_bits(),
        }
    }
}

fn default_key_bits() -> u32 {
    4096
}

impl BootstrapSettings {
    /// Load settings from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let settings_str = fs::read_to_string(path).map_err(|e| {
            Error::Settings(format!("failed to read {}: {}", path.display(), e))
        })?;

        let settings: BootstrapSettings = toml::from_str(&settings_str).map_err(|e| {
            Error::Settings(format!("failed to parse {}: {}", path.display(), e))
        })?;
        settings.validate()?;

        Ok(settings)
    }

    /// Load settings from `path` if given, defaults otherwise
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.keys.bits < 2048 {
            return Err(Error::Settings(format!(
                "key size {} is too small (minimum 2048)",
                self.keys.bits
            )));
        }
        if self.ca.common_name.trim().is_empty() {
            return Err(Error::Settings("CA common name must not be empty".into()));
        }
        if self.server.identity.trim().is_empty() {
            return Err(Error::Settings("server identity must not be empty".into()));
        }
        if let Some(country) = &self.ca.country {
            if country.len() != 2 || !country.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(Error::Settings(format!(
                    "country must be a two-letter code, got {:?}",
                    country
                )));
            }
        }
        Ok(())
    }
}
