//! Error types for fleet bootstrap

use std::path::PathBuf;

use thiserror::Error;

use crate::bootstrap::BootstrapState;

/// Main error type for bootstrap operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Expected key or certificate file is absent
    #[error("missing artifact: {}", .path.display())]
    MissingArtifact { path: PathBuf },

    /// One half of a key/certificate pair exists without the other
    #[error(
        "inconsistent artifacts: {} exists but {} is missing; restore the missing file or remove both to regenerate (this invalidates deployed clients)",
        .present.display(),
        .missing.display()
    )]
    InconsistentArtifact { present: PathBuf, missing: PathBuf },

    /// A key or certificate file exists but cannot be read or parsed
    #[error("unreadable artifact {}: {reason}", .path.display())]
    UnreadableArtifact { path: PathBuf, reason: String },

    /// Certificate chain or signature verification failed
    #[error("verification failed: {0}")]
    Verification(String),

    /// Target directory cannot be created or written to
    #[error("unable to write to config directory {}: {reason}", .path.display())]
    DirectoryPermission { path: PathBuf, reason: String },

    /// Existing configuration document could not be parsed
    #[error("unable to parse configuration {}: {reason}", .path.display())]
    ConfigurationParse { path: PathBuf, reason: String },

    /// Existing configuration was created for a different deployment type
    #[error("configuration was created for a {found} deployment but {expected} was selected")]
    DeploymentMismatch { expected: String, found: String },

    /// Crypto provider failure
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Filesystem error
    #[error("IO error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Manifest publication failed
    #[error("manifest publication failed: {0}")]
    Publication(String),

    /// Operator settings file error
    #[error("settings error: {0}")]
    Settings(String),

    /// Bootstrap halted after reaching `state`
    #[error("bootstrap halted after {state}: {source}")]
    Halted {
        state: BootstrapState,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create a verification error with the given message
    pub fn verification(msg: impl Into<String>) -> Self {
        Self::Verification(msg.into())
    }

    /// Create a crypto error with the given message
    pub fn crypto(msg: impl Into<String>) -> Self {
        Self::Crypto(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a publication error with the given message
    pub fn publication(msg: impl Into<String>) -> Self {
        Self::Publication(msg.into())
    }

    /// Wrap an IO error with the path it occurred on
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// The innermost error, looking through `Halted`
    pub fn root(&self) -> &Error {
        match self {
            Error::Halted { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(e: openssl::error::ErrorStack) -> Self {
        Error::Crypto(e.to_string())
    }
}

/// Result type for bootstrap operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inconsistent_artifact_message_names_both_files() {
        let err = Error::InconsistentArtifact {
            present: PathBuf::from("/cfg/ca.cert.pem"),
            missing: PathBuf::from("/cfg/ca.private_key.pem"),
        };
        let msg = err.to_string();
        assert!(msg.contains("/cfg/ca.cert.pem"));
        assert!(msg.contains("/cfg/ca.private_key.pem"));
    }

    #[test]
    fn root_looks_through_halted() {
        let err = Error::Halted {
            state: BootstrapState::CaReady,
            source: Box::new(Error::verification("bad signature")),
        };
        assert!(matches!(err.root(), Error::Verification(_)));
        assert!(err.to_string().contains("CA_READY"));
    }
}
