//! Deployment served by the agent HTTP frontend
//!
//! The frontend answers manifest requests from the running configuration, so
//! publication is a no-op: the signed manifest only has to be present in the
//! server configuration document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use super::{ClientPolicy, DeploymentKind, DeploymentPolicy, Location, ManifestSink, ServerPolicy};
use crate::error::{Error, Result};

pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_BIND_PORT: u16 = 8000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpServerPolicy {
    /// Publicly reachable URL of the frontend
    pub base_url: String,
    pub bind_address: String,
    pub bind_port: u16,
}

#[derive(Debug, Clone)]
pub struct HttpDeployment {
    base_url: Url,
    bind_address: String,
    bind_port: u16,
}

impl HttpDeployment {
    /// `base_url` defaults to `http://{bind_address}:{bind_port}/`
    pub fn new(base_url: Option<&str>, bind_address: &str, bind_port: u16) -> Result<Self> {
        let raw = match base_url {
            Some(url) => url.to_string(),
            None => format!("http://{}:{}/", bind_address, bind_port),
        };
        // Url::join drops the last path segment unless it ends with '/'
        let raw = if raw.ends_with('/') { raw } else { format!("{}/", raw) };
        let base_url = Url::parse(&raw)
            .map_err(|e| Error::Settings(format!("invalid base URL {:?}: {}", raw, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::Settings(format!("base URL {:?} cannot hold paths", raw)));
        }

        Ok(Self {
            base_url,
            bind_address: bind_address.to_string(),
            bind_port,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        self.base_url
            .join(path)
            .map(|url| url.to_string())
            .unwrap_or_else(|_| format!("{}{}", self.base_url, path))
    }
}

impl DeploymentPolicy for HttpDeployment {
    fn kind(&self) -> DeploymentKind {
        DeploymentKind::Http
    }

    fn server_policy(&self) -> Result<ServerPolicy> {
        Ok(ServerPolicy::Http(HttpServerPolicy {
            base_url: self.base_url.to_string(),
            bind_address: self.bind_address.clone(),
            bind_port: self.bind_port,
        }))
    }

    fn client_policy(&self) -> ClientPolicy {
        ClientPolicy {
            kind: DeploymentKind::Http,
            manifest_location: Location::Http {
                url: self.endpoint("manifest"),
                path_template: None,
                expires_at: None,
            },
        }
    }

    fn startup_location(
        &self,
        queue: &str,
        path_template: &str,
        expires_at: DateTime<Utc>,
    ) -> Location {
        Location::Http {
            url: self.endpoint(&format!("upload/{}", queue)),
            path_template: Some(path_template.to_string()),
            expires_at: Some(expires_at),
        }
    }

    fn manifest_for_server<'a>(
        &'a self,
        server: &ServerPolicy,
    ) -> Result<Option<Box<dyn ManifestSink + 'a>>> {
        match server {
            ServerPolicy::Http(_) => Ok(None),
            other => Err(Error::DeploymentMismatch {
                expected: self.kind().to_string(),
                found: other.kind().to_string(),
            }),
        }
    }
}
