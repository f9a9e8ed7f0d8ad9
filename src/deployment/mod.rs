//! Deployment Policy abstraction
//!
//! A deployment policy decides how clients reach the server: it supplies the
//! server and client policy objects stored in the configuration, the location
//! clients report their startup results to, and the sink the signed manifest
//! is published through.
//!
//! # Supported Deployments
//!
//! - [`ObjectStoreDeployment`] - manifest uploaded to a cloud storage bucket
//! - [`HttpDeployment`] - manifest served live by the frontend from configuration

mod http;
mod object_store;

pub use http::{HttpDeployment, HttpServerPolicy, DEFAULT_BIND_ADDRESS, DEFAULT_BIND_PORT};
pub use object_store::{
    signed_put_url, HttpObjectStoreClient, ObjectStoreClient, ObjectStoreDeployment,
    ObjectStoreServerPolicy, ServiceAccount, DEFAULT_STORAGE_ENDPOINT, MANIFEST_OBJECT,
};

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Deployment target type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentKind {
    ObjectStore,
    Http,
}

impl fmt::Display for DeploymentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeploymentKind::ObjectStore => write!(f, "object-store"),
            DeploymentKind::Http => write!(f, "http"),
        }
    }
}

/// A place clients read from or write to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Location {
    /// Object in a storage bucket
    Object {
        endpoint: String,
        bucket: String,
        object: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path_template: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expires_at: Option<DateTime<Utc>>,
    },
    /// Endpoint on the deployment's HTTP frontend
    Http {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path_template: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expires_at: Option<DateTime<Utc>>,
    },
}

impl Location {
    /// Human-readable address of the location
    pub fn to_path(&self) -> String {
        match self {
            Location::Object {
                endpoint,
                bucket,
                object,
                ..
            } => format!("{}/{}/{}", endpoint.trim_end_matches('/'), bucket, object),
            Location::Http { url, .. } => url.clone(),
        }
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Location::Object { expires_at, .. } | Location::Http { expires_at, .. } => *expires_at,
        }
    }
}

/// Server-only half of the deployment policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerPolicy {
    ObjectStore(ObjectStoreServerPolicy),
    Http(HttpServerPolicy),
}

impl ServerPolicy {
    pub fn kind(&self) -> DeploymentKind {
        match self {
            ServerPolicy::ObjectStore(_) => DeploymentKind::ObjectStore,
            ServerPolicy::Http(_) => DeploymentKind::Http,
        }
    }
}

/// Client half of the deployment policy: where to find the manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientPolicy {
    pub kind: DeploymentKind,
    pub manifest_location: Location,
}

/// Write target for the signed manifest
pub trait ManifestSink {
    /// Where the manifest goes, for progress messages
    fn describe(&self) -> String;

    fn write_file(&self, data: &[u8]) -> Result<()>;
}

/// Deployment-specific policy objects and manifest publication
pub trait DeploymentPolicy {
    fn kind(&self) -> DeploymentKind;

    /// Policy stored in the server section of the configuration
    fn server_policy(&self) -> Result<ServerPolicy>;

    /// Policy stored in the client section of the configuration
    fn client_policy(&self) -> ClientPolicy;

    /// Location clients upload results for `queue` to
    fn startup_location(
        &self,
        queue: &str,
        path_template: &str,
        expires_at: DateTime<Utc>,
    ) -> Location;

    /// Publication sink for a configuration's server policy
    ///
    /// `None` means the manifest is served from the configuration itself and
    /// there is nothing to publish.
    fn manifest_for_server<'a>(
        &'a self,
        server: &ServerPolicy,
    ) -> Result<Option<Box<dyn ManifestSink + 'a>>>;
}
