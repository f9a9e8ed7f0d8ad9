//! Trust Bootstrapper
//!
//! Provisions the deployment CA and the CA-signed server certificate.
//!
//! ```text
//! CA (self-signed)        ca.private_key.pem / ca.cert.pem
//!   └── Server            server.private_key.pem / server.certificate.pem
//! ```
//!
//! Existing material is always reused; regenerating the CA would invalidate
//! every certificate it ever issued and break deployed clients. Anything
//! inconsistent on disk is a fatal error for the operator to resolve.

use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use tracing::{info, warn};

use crate::configs::BootstrapSettings;
use crate::crypto_provider::{common_name, CryptoProvider};
use crate::error::{Error, Result};
use crate::key_store::{KeyCertPair, KeyStore, PairKind, PairState};

/// Whether a bundle came from disk or was created in this run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Generated,
    Reused,
}

/// CA private key and certificate
pub struct CaBundle {
    pub private_key: PKey<Private>,
    pub certificate: X509,
    pub origin: Origin,
}

/// Server private key and CA-signed certificate
pub struct ServerBundle {
    pub private_key: PKey<Private>,
    pub certificate: X509,
    pub origin: Origin,
}

pub struct TrustBootstrapper<'a> {
    store: &'a KeyStore,
    provider: &'a dyn CryptoProvider,
    settings: &'a BootstrapSettings,
}

impl<'a> TrustBootstrapper<'a> {
    pub fn new(
        store: &'a KeyStore,
        provider: &'a dyn CryptoProvider,
        settings: &'a BootstrapSettings,
    ) -> Self {
        Self {
            store,
            provider,
            settings,
        }
    }

    /// Reuse the stored CA, or create and persist a new one if none exists
    pub fn ensure_ca(&self) -> Result<CaBundle> {
        match self.store.load_pair(PairKind::Ca) {
            Ok(KeyCertPair {
                private_key,
                certificate,
            }) => {
                if !self
                    .provider
                    .key_matches_certificate(&private_key, &certificate)?
                {
                    return Err(Error::verification(format!(
                        "CA private key {} does not belong to CA certificate {}",
                        self.store.key_path(PairKind::Ca).display(),
                        self.store.cert_path(PairKind::Ca).display()
                    )));
                }
                info!(path = %self.store.cert_path(PairKind::Ca).display(), "reusing existing CA");
                Ok(CaBundle {
                    private_key,
                    certificate,
                    origin: Origin::Reused,
                })
            }
            Err(Error::MissingArtifact { .. }) => self.generate_ca(),
            Err(e) => Err(e),
        }
    }

    fn generate_ca(&self) -> Result<CaBundle> {
        info!(dir = %self.store.dir().display(), "generating new CA");
        let private_key = self.provider.generate_key()?;
        let certificate = self
            .provider
            .self_signed_ca(&private_key, &self.settings.ca)?;

        if !self.provider.verify_certificate(&certificate, &certificate)? {
            return Err(Error::verification(
                "freshly generated CA certificate does not verify against its own key",
            ));
        }

        self.store
            .store_pair(PairKind::Ca, &private_key, &certificate)?;
        Ok(CaBundle {
            private_key,
            certificate,
            origin: Origin::Generated,
        })
    }

    /// Reuse the stored server certificate, or issue a new one from the CA
    ///
    /// A CA generated in this run always gets a fresh server certificate:
    /// anything on disk was signed by a CA that no longer exists.
    pub fn ensure_server_cert(&self, ca: &CaBundle) -> Result<ServerBundle> {
        if ca.origin == Origin::Generated {
            if self.store.pair_state(PairKind::Server) != PairState::Absent {
                warn!(
                    dir = %self.store.dir().display(),
                    "replacing server key material issued by a previous CA"
                );
            }
            return self.issue_server_cert(ca);
        }

        match self.store.load_pair(PairKind::Server) {
            Ok(pair) => self.reuse_server_cert(ca, pair),
            Err(Error::MissingArtifact { .. }) => self.issue_server_cert(ca),
            Err(e) => Err(e),
        }
    }

    fn reuse_server_cert(&self, ca: &CaBundle, pair: KeyCertPair) -> Result<ServerBundle> {
        let cert_path = self.store.cert_path(PairKind::Server);

        if !self
            .provider
            .verify_certificate(&pair.certificate, &ca.certificate)?
        {
            return Err(Error::verification(format!(
                "existing server certificate {} was not issued by the current CA {}; remove the server key and certificate to reissue",
                cert_path.display(),
                self.store.cert_path(PairKind::Ca).display()
            )));
        }
        if !self
            .provider
            .key_matches_certificate(&pair.private_key, &pair.certificate)?
        {
            return Err(Error::verification(format!(
                "server private key {} does not belong to server certificate {}",
                self.store.key_path(PairKind::Server).display(),
                cert_path.display()
            )));
        }

        info!(
            path = %cert_path.display(),
            identity = ?common_name(&pair.certificate),
            "reusing existing server certificate"
        );
        Ok(ServerBundle {
            private_key: pair.private_key,
            certificate: pair.certificate,
            origin: Origin::Reused,
        })
    }

    fn issue_server_cert(&self, ca: &CaBundle) -> Result<ServerBundle> {
        info!(identity = %self.settings.server.identity, "issuing new server certificate");
        let private_key = self.provider.generate_key()?;
        let certificate = self.provider.ca_signed_cert(
            &self.settings.server.identity,
            self.settings.server.validity_days,
            &private_key,
            &ca.certificate,
            &ca.private_key,
        )?;

        // Nothing is written unless the new certificate chains to the CA
        if !self
            .provider
            .verify_certificate(&certificate, &ca.certificate)?
        {
            return Err(Error::verification(
                "newly issued server certificate does not verify against the CA certificate",
            ));
        }

        self.store
            .store_pair(PairKind::Server, &private_key, &certificate)?;
        Ok(ServerBundle {
            private_key,
            certificate,
            origin: Origin::Generated,
        })
    }
}
