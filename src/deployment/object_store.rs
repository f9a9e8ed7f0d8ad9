//! Deployment backed by a cloud storage bucket
//!
//! Clients fetch the manifest as a public object from the bucket. The
//! bootstrap uploads it with a V4 signed URL (`GOOG4-RSA-SHA256`) computed
//! offline from the service account's RSA key, so no token exchange is
//! needed before the upload.

use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use openssl::hash::MessageDigest;
use openssl::sign::Signer;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use url::Url;

use super::{ClientPolicy, DeploymentKind, DeploymentPolicy, Location, ManifestSink, ServerPolicy};
use crate::error::{Error, Result};
use crate::secret::SecretPem;

pub const DEFAULT_STORAGE_ENDPOINT: &str = "https://storage.googleapis.com";
pub const MANIFEST_OBJECT: &str = "manifest";

const SIGNING_ALGORITHM: &str = "GOOG4-RSA-SHA256";
const SIGNED_URL_TTL_SECS: u64 = 15 * 60;
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Everything but the RFC 3986 unreserved characters
const UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Service account credentials (the JSON key file format)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceAccount {
    pub client_email: String,
    pub private_key: SecretPem,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

impl ServiceAccount {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path).map_err(|e| Error::io(path, e))?;
        let account: ServiceAccount = serde_json::from_slice(&data).map_err(|e| {
            Error::Settings(format!(
                "invalid service account file {}: {}",
                path.display(),
                e
            ))
        })?;
        // Fail now rather than at upload time
        account.private_key.to_private_key()?;
        Ok(account)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStoreServerPolicy {
    pub bucket: String,
    pub service_account: ServiceAccount,
    #[serde(default = "default_storage_endpoint")]
    pub storage_endpoint: String,
}

fn default_storage_endpoint() -> String {
    DEFAULT_STORAGE_ENDPOINT.to_string()
}

/// Uploads objects to a bucket
pub trait ObjectStoreClient {
    fn put_object(&self, policy: &ObjectStoreServerPolicy, object: &str, data: &[u8]) -> Result<()>;
}

/// Uploads over HTTPS with signed URLs
pub struct HttpObjectStoreClient {
    http: reqwest::blocking::Client,
}

impl HttpObjectStoreClient {
    pub fn new() -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(UPLOAD_TIMEOUT)
            .build()
            .map_err(|e| Error::publication(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { http })
    }
}

impl ObjectStoreClient for HttpObjectStoreClient {
    fn put_object(&self, policy: &ObjectStoreServerPolicy, object: &str, data: &[u8]) -> Result<()> {
        let url = signed_put_url(policy, object, Utc::now())?;
        debug!(bucket = %policy.bucket, object, "uploading object");

        let response = self
            .http
            .put(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(data.to_vec())
            .send()
            .map_err(|e| Error::publication(format!("upload to {} failed: {}", policy.bucket, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(Error::publication(format!(
                "upload to {}/{} returned {}: {}",
                policy.bucket, object, status, body
            )));
        }
        Ok(())
    }
}

/// Build a V4 signed URL allowing a PUT of `object` into the policy's bucket
pub fn signed_put_url(
    policy: &ObjectStoreServerPolicy,
    object: &str,
    now: DateTime<Utc>,
) -> Result<String> {
    let endpoint = Url::parse(&policy.storage_endpoint).map_err(|e| {
        Error::Settings(format!(
            "invalid storage endpoint {:?}: {}",
            policy.storage_endpoint, e
        ))
    })?;
    let host = match (endpoint.host_str(), endpoint.port()) {
        (Some(host), Some(port)) => format!("{}:{}", host, port),
        (Some(host), None) => host.to_string(),
        (None, _) => {
            return Err(Error::Settings(format!(
                "storage endpoint {:?} has no host",
                policy.storage_endpoint
            )))
        }
    };

    let datetime = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();
    let scope = format!("{}/auto/storage/goog4_request", date);
    let credential = format!("{}/{}", policy.service_account.client_email, scope);

    let resource = format!("/{}/{}", encode(&policy.bucket), encode_path(object));
    // Parameters must appear in sorted order
    let query = [
        ("X-Goog-Algorithm", SIGNING_ALGORITHM.to_string()),
        ("X-Goog-Credential", credential),
        ("X-Goog-Date", datetime.clone()),
        ("X-Goog-Expires", SIGNED_URL_TTL_SECS.to_string()),
        ("X-Goog-SignedHeaders", "host".to_string()),
    ]
    .iter()
    .map(|(k, v)| format!("{}={}", k, encode(v)))
    .collect::<Vec<_>>()
    .join("&");

    let canonical_request = format!(
        "PUT\n{}\n{}\nhost:{}\n\nhost\nUNSIGNED-PAYLOAD",
        resource, query, host
    );
    let string_to_sign = format!(
        "{}\n{}\n{}\n{}",
        SIGNING_ALGORITHM,
        datetime,
        scope,
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let key = policy.service_account.private_key.to_private_key()?;
    let mut signer = Signer::new(MessageDigest::sha256(), &key)?;
    let signature = signer.sign_oneshot_to_vec(string_to_sign.as_bytes())?;

    Ok(format!(
        "{}://{}{}?{}&X-Goog-Signature={}",
        endpoint.scheme(),
        host,
        resource,
        query,
        hex::encode(signature)
    ))
}

fn encode(value: &str) -> String {
    utf8_percent_encode(value, UNRESERVED).to_string()
}

/// Object names keep their `/` separators
fn encode_path(object: &str) -> String {
    object.split('/').map(encode).collect::<Vec<_>>().join("/")
}

pub struct ObjectStoreDeployment {
    bucket: String,
    service_account: ServiceAccount,
    storage_endpoint: String,
    client: Box<dyn ObjectStoreClient>,
}

impl ObjectStoreDeployment {
    pub fn new(bucket: impl Into<String>, service_account: ServiceAccount) -> Result<Self> {
        Ok(Self::with_client(
            bucket,
            service_account,
            Box::new(HttpObjectStoreClient::new()?),
        ))
    }

    pub fn with_client(
        bucket: impl Into<String>,
        service_account: ServiceAccount,
        client: Box<dyn ObjectStoreClient>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            service_account,
            storage_endpoint: default_storage_endpoint(),
            client,
        }
    }

    pub fn storage_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.storage_endpoint = endpoint.into();
        self
    }

    fn location(&self, object: String) -> Location {
        Location::Object {
            endpoint: self.storage_endpoint.clone(),
            bucket: self.bucket.clone(),
            object,
            path_template: None,
            expires_at: None,
        }
    }
}

impl DeploymentPolicy for ObjectStoreDeployment {
    fn kind(&self) -> DeploymentKind {
        DeploymentKind::ObjectStore
    }

    fn server_policy(&self) -> Result<ServerPolicy> {
        if self.bucket.trim().is_empty() {
            return Err(Error::Settings("bucket name must not be empty".into()));
        }
        Ok(ServerPolicy::ObjectStore(ObjectStoreServerPolicy {
            bucket: self.bucket.clone(),
            service_account: self.service_account.clone(),
            storage_endpoint: self.storage_endpoint.clone(),
        }))
    }

    fn client_policy(&self) -> ClientPolicy {
        ClientPolicy {
            kind: DeploymentKind::ObjectStore,
            manifest_location: self.location(MANIFEST_OBJECT.to_string()),
        }
    }

    fn startup_location(
        &self,
        queue: &str,
        path_template: &str,
        expires_at: DateTime<Utc>,
    ) -> Location {
        Location::Object {
            endpoint: self.storage_endpoint.clone(),
            bucket: self.bucket.clone(),
            object: format!("tickets/{}", queue),
            path_template: Some(path_template.to_string()),
            expires_at: Some(expires_at),
        }
    }

    fn manifest_for_server<'a>(
        &'a self,
        server: &ServerPolicy,
    ) -> Result<Option<Box<dyn ManifestSink + 'a>>> {
        match server {
            ServerPolicy::ObjectStore(policy) => Ok(Some(Box::new(ObjectStoreSink {
                client: self.client.as_ref(),
                policy: policy.clone(),
            }))),
            other => Err(Error::DeploymentMismatch {
                expected: self.kind().to_string(),
                found: other.kind().to_string(),
            }),
        }
    }
}

struct ObjectStoreSink<'a> {
    client: &'a dyn ObjectStoreClient,
    policy: ObjectStoreServerPolicy,
}

impl ManifestSink for ObjectStoreSink<'_> {
    fn describe(&self) -> String {
        format!(
            "{}/{}/{}",
            self.policy.storage_endpoint.trim_end_matches('/'),
            self.policy.bucket,
            MANIFEST_OBJECT
        )
    }

    fn write_file(&self, data: &[u8]) -> Result<()> {
        self.client.put_object(&self.policy, MANIFEST_OBJECT, data)?;
        info!(bucket = %self.policy.bucket, bytes = data.len(), "manifest uploaded");
        Ok(())
    }
}
