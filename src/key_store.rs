//! Key/Cert Store
//!
//! PEM-encoded key and certificate pairs kept under fixed, well-known file
//! names in the configuration directory, so that re-running bootstrap against
//! the same directory finds prior artifacts.
//!
//! A pair is written together: both halves are staged as temporary files in
//! the target directory and only then renamed into place. A pair found with
//! only one half on disk is reported as
//! [`Error::InconsistentArtifact`] and never repaired.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{Error, Result};

pub const CA_PRIVATE_KEY_FILENAME: &str = "ca.private_key.pem";
pub const CA_CERT_FILENAME: &str = "ca.cert.pem";
pub const SERVER_PRIVATE_KEY_FILENAME: &str = "server.private_key.pem";
pub const SERVER_CERT_FILENAME: &str = "server.certificate.pem";

#[cfg(unix)]
const PRIVATE_KEY_MODE: u32 = 0o600;
#[cfg(unix)]
const CERTIFICATE_MODE: u32 = 0o644;

/// Which key/certificate pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairKind {
    Ca,
    Server,
}

impl PairKind {
    pub fn key_filename(self) -> &'static str {
        match self {
            PairKind::Ca => CA_PRIVATE_KEY_FILENAME,
            PairKind::Server => SERVER_PRIVATE_KEY_FILENAME,
        }
    }

    pub fn cert_filename(self) -> &'static str {
        match self {
            PairKind::Ca => CA_CERT_FILENAME,
            PairKind::Server => SERVER_CERT_FILENAME,
        }
    }
}

/// What is on disk for a pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    Absent,
    KeyOnly,
    CertOnly,
    Complete,
}

/// A private key with its certificate
pub struct KeyCertPair {
    pub private_key: PKey<Private>,
    pub certificate: X509,
}

#[derive(Debug, Clone)]
pub struct KeyStore {
    dir: PathBuf,
}

impl KeyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn key_path(&self, kind: PairKind) -> PathBuf {
        self.dir.join(kind.key_filename())
    }

    pub fn cert_path(&self, kind: PairKind) -> PathBuf {
        self.dir.join(kind.cert_filename())
    }

    /// Make sure the directory exists and accepts new files
    pub fn check_writable(&self) -> Result<()> {
        let permission_error = |reason: String| Error::DirectoryPermission {
            path: self.dir.clone(),
            reason,
        };

        if !self.dir.exists() {
            fs::create_dir_all(&self.dir).map_err(|e| permission_error(e.to_string()))?;
        }
        if !self.dir.is_dir() {
            return Err(permission_error("not a directory".to_string()));
        }
        tempfile::tempfile_in(&self.dir).map_err(|e| permission_error(e.to_string()))?;
        Ok(())
    }

    pub fn pair_state(&self, kind: PairKind) -> PairState {
        match (self.key_path(kind).exists(), self.cert_path(kind).exists()) {
            (false, false) => PairState::Absent,
            (true, false) => PairState::KeyOnly,
            (false, true) => PairState::CertOnly,
            (true, true) => PairState::Complete,
        }
    }

    /// Load a stored pair
    ///
    /// # Errors
    /// - [`Error::MissingArtifact`] when neither file exists
    /// - [`Error::InconsistentArtifact`] when only one of them exists
    /// - [`Error::UnreadableArtifact`] when a file exists but does not parse
    pub fn load_pair(&self, kind: PairKind) -> Result<KeyCertPair> {
        let key_path = self.key_path(kind);
        let cert_path = self.cert_path(kind);

        match self.pair_state(kind) {
            PairState::Absent => Err(Error::MissingArtifact { path: key_path }),
            PairState::KeyOnly => Err(Error::InconsistentArtifact {
                present: key_path,
                missing: cert_path,
            }),
            PairState::CertOnly => Err(Error::InconsistentArtifact {
                present: cert_path,
                missing: key_path,
            }),
            PairState::Complete => {
                let private_key = read_private_key(&key_path)?;
                let certificate = read_certificate(&cert_path)?;
                debug!(?kind, dir = %self.dir.display(), "loaded key/certificate pair");
                Ok(KeyCertPair {
                    private_key,
                    certificate,
                })
            }
        }
    }

    /// Persist a pair, replacing whatever was there
    pub fn store_pair(&self, kind: PairKind, key: &PKey<Private>, cert: &X509) -> Result<()> {
        let key_pem = key.private_key_to_pem_pkcs8()?;
        let cert_pem = cert.to_pem()?;

        // Stage both halves before touching the final paths
        let staged_key = stage_in(&self.dir, &key_pem, private_mode())?;
        let staged_cert = stage_in(&self.dir, &cert_pem, public_mode())?;

        let key_path = self.key_path(kind);
        let cert_path = self.cert_path(kind);
        staged_key
            .persist(&key_path)
            .map_err(|e| Error::io(&key_path, e.error))?;
        staged_cert
            .persist(&cert_path)
            .map_err(|e| Error::io(&cert_path, e.error))?;

        debug!(?kind, dir = %self.dir.display(), "stored key/certificate pair");
        Ok(())
    }
}

/// Write `contents` to `target` through a temporary file in the same directory
pub(crate) fn write_staged(target: &Path, contents: &[u8], private: bool) -> Result<()> {
    let dir = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mode = if private { private_mode() } else { public_mode() };
    stage_in(dir, contents, mode)?
        .persist(target)
        .map_err(|e| Error::io(target, e.error))?;
    Ok(())
}

fn stage_in(dir: &Path, contents: &[u8], mode: Option<u32>) -> Result<NamedTempFile> {
    let mut staged = NamedTempFile::new_in(dir).map_err(|e| Error::io(dir, e))?;
    staged
        .write_all(contents)
        .and_then(|_| staged.as_file().sync_all())
        .map_err(|e| Error::io(staged.path(), e))?;
    set_mode(&staged, mode)?;
    Ok(staged)
}

fn read_private_key(path: &Path) -> Result<PKey<Private>> {
    let pem = read_artifact(path)?;
    PKey::private_key_from_pem(&pem).map_err(|e| Error::UnreadableArtifact {
        path: path.to_path_buf(),
        reason: format!("not a PEM private key: {}", e),
    })
}

fn read_certificate(path: &Path) -> Result<X509> {
    let pem = read_artifact(path)?;
    X509::from_pem(&pem).map_err(|e| Error::UnreadableArtifact {
        path: path.to_path_buf(),
        reason: format!("not a PEM certificate: {}", e),
    })
}

fn read_artifact(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::UnreadableArtifact {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

#[cfg(unix)]
fn private_mode() -> Option<u32> {
    Some(PRIVATE_KEY_MODE)
}

#[cfg(unix)]
fn public_mode() -> Option<u32> {
    Some(CERTIFICATE_MODE)
}

#[cfg(not(unix))]
fn private_mode() -> Option<u32> {
    None
}

#[cfg(not(unix))]
fn public_mode() -> Option<u32> {
    None
}

#[cfg(unix)]
fn set_mode(file: &NamedTempFile, mode: Option<u32>) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(mode) = mode {
        file.as_file()
            .set_permissions(fs::Permissions::from_mode(mode))
            .map_err(|e| Error::io(file.path(), e))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_file: &NamedTempFile, _mode: Option<u32>) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::CaSubject;
    use crate::crypto_provider::tests::test_provider;
    use crate::crypto_provider::CryptoProvider;

    fn sample_pair() -> (PKey<Private>, X509) {
        let provider = test_provider();
        let key = provider.generate_key().unwrap();
        let cert = provider.self_signed_ca(&key, &CaSubject::default()).unwrap();
        (key, cert)
    }

    #[test]
    fn empty_directory_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path());

        assert_eq!(store.pair_state(PairKind::Ca), PairState::Absent);
        assert!(matches!(
            store.load_pair(PairKind::Ca),
            Err(Error::MissingArtifact { .. })
        ));
    }

    #[test]
    fn stored_pair_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path());
        let (key, cert) = sample_pair();

        store.store_pair(PairKind::Server, &key, &cert).unwrap();
        let loaded = store.load_pair(PairKind::Server).unwrap();

        assert_eq!(loaded.certificate.to_der().unwrap(), cert.to_der().unwrap());
        assert!(loaded.private_key.public_eq(&key));
        assert_eq!(store.pair_state(PairKind::Ca), PairState::Absent);
    }

    #[test]
    fn half_pair_is_inconsistent() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path());
        let (key, cert) = sample_pair();
        store.store_pair(PairKind::Ca, &key, &cert).unwrap();
        fs::remove_file(store.key_path(PairKind::Ca)).unwrap();

        match store.load_pair(PairKind::Ca) {
            Err(Error::InconsistentArtifact { present, missing }) => {
                assert_eq!(present, store.cert_path(PairKind::Ca));
                assert_eq!(missing, store.key_path(PairKind::Ca));
            }
            _ => panic!("expected InconsistentArtifact"),
        }
    }

    #[test]
    fn garbage_file_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path());
        let (key, cert) = sample_pair();
        store.store_pair(PairKind::Ca, &key, &cert).unwrap();
        fs::write(store.key_path(PairKind::Ca), b"not a key").unwrap();

        assert!(matches!(
            store.load_pair(PairKind::Ca),
            Err(Error::UnreadableArtifact { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn private_key_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path());
        let (key, cert) = sample_pair();
        store.store_pair(PairKind::Ca, &key, &cert).unwrap();

        let mode = fs::metadata(store.key_path(PairKind::Ca))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("deploy").join("config");
        let store = KeyStore::new(&nested);

        store.check_writable().unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn file_in_place_of_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("config");
        fs::write(&file, b"").unwrap();

        assert!(matches!(
            KeyStore::new(&file).check_writable(),
            Err(Error::DirectoryPermission { .. })
        ));
    }
}
