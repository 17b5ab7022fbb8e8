//! On-disk persistence layer.
//!
//! A flat directory keyed by `AccountDbId` prefixes, using `tokio::fs` for
//! all I/O. Each account/certificate gets its own PEM/CSR/JSON files rather
//! than one blob per entry, so the on-disk layout stays individually
//! inspectable and greppable in the field.

use std::path::{Path, PathBuf};

use instant_acme::AccountCredentials;
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::Config;
use crate::error::Result;
use crate::keys;

/// What the Account Manager last committed to the CA about this account:
/// its contact URIs and the terms-of-service URL it accepted. Stored
/// together under `P-acceptedTermsLocation.txt` so a single
/// comparison against the current `Account` detects drift in either field
/// without a round-trip read-back from the CA.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationState {
    pub accepted_agreement_url: String,
    pub contact_uris: Vec<String>,
}

/// A flat directory holding keypairs, registration locations, CSRs,
/// certificate chains, and the last-applied configuration.
#[derive(Debug, Clone)]
pub struct Persistence {
    root: PathBuf,
}

impl Persistence {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolves the default on-disk location under the platform's local
    /// data directory.
    pub fn default_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("acme-cert-manager")
    }

    /// Ensures the root directory exists.
    pub async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    fn path(&self, name: impl AsRef<Path>) -> PathBuf {
        self.root.join(name)
    }

    // -- account-scoped files --------------------------------------------

    /// Reads the cached account credentials. Named `*-account-keypair.pem`
    /// keeping the historical on-disk filename, though the content is the JSON
    /// [`AccountCredentials`] blob `instant-acme` hands back from account
    /// creation (account key, id, and directory) — the opaque SDK never
    /// accepts a caller-supplied account key (see [`crate::session`]), so
    /// this is the only material there is to persist under that name.
    pub async fn read_account_credentials(&self, prefix: &str) -> Result<Option<AccountCredentials>> {
        let path = self.path(format!("{prefix}-account-keypair.pem"));
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(credentials) => Ok(Some(credentials)),
                Err(e) => {
                    warn!("malformed account credentials at {path:?}: {e}");
                    Ok(None)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn write_account_credentials(&self, prefix: &str, credentials: &AccountCredentials) -> Result<()> {
        let json = serde_json::to_string_pretty(credentials)?;
        tokio::fs::write(self.path(format!("{prefix}-account-keypair.pem")), json).await?;
        Ok(())
    }

    pub async fn read_account_location(&self, prefix: &str) -> Result<Option<String>> {
        self.read_text_file(&format!("{prefix}-accountLocation.txt")).await
    }

    pub async fn write_account_location(&self, prefix: &str, location: &str) -> Result<()> {
        tokio::fs::write(self.path(format!("{prefix}-accountLocation.txt")), location).await?;
        Ok(())
    }

    pub async fn read_registration_state(&self, prefix: &str) -> Result<Option<RegistrationState>> {
        let path = self.path(format!("{prefix}-acceptedTermsLocation.txt"));
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(state) => Ok(Some(state)),
                Err(e) => {
                    warn!("malformed registration state at {path:?}: {e}");
                    Ok(None)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn write_registration_state(&self, prefix: &str, state: &RegistrationState) -> Result<()> {
        let json = serde_json::to_string_pretty(state)?;
        tokio::fs::write(self.path(format!("{prefix}-acceptedTermsLocation.txt")), json).await?;
        Ok(())
    }

    // -- certificate-scoped files -----------------------------------------

    pub async fn read_cert_keypair(&self, prefix: &str, cert_id: &str) -> Result<Option<PKey<Private>>> {
        let path = self.path(format!("{prefix}-{cert_id}-keypair.pem"));
        match tokio::fs::read(&path).await {
            Ok(bytes) => match keys::private_key_from_pem(&bytes) {
                Ok(key) => Ok(Some(key)),
                Err(e) => {
                    warn!("malformed certificate keypair at {path:?}: {e}");
                    Ok(None)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn write_cert_keypair(&self, prefix: &str, cert_id: &str, key: &PKey<Private>) -> Result<()> {
        let pem = keys::private_key_to_pem(key)?;
        tokio::fs::write(self.path(format!("{prefix}-{cert_id}-keypair.pem")), pem).await?;
        Ok(())
    }

    pub async fn read_cert_chain(&self, prefix: &str, cert_id: &str) -> Result<Option<Vec<X509>>> {
        let path = self.path(format!("{prefix}-{cert_id}-certchain.pem"));
        match tokio::fs::read(&path).await {
            Ok(bytes) => match keys::chain_from_pem(&bytes) {
                Ok(chain) if !chain.is_empty() => Ok(Some(chain)),
                Ok(_) => {
                    warn!("empty certificate chain at {path:?}");
                    Ok(None)
                }
                Err(e) => {
                    warn!("malformed certificate chain at {path:?}: {e}");
                    Ok(None)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn write_cert_chain(&self, prefix: &str, cert_id: &str, chain: &[X509]) -> Result<()> {
        let pem = keys::chain_to_pem(chain)?;
        tokio::fs::write(self.path(format!("{prefix}-{cert_id}-certchain.pem")), pem).await?;
        Ok(())
    }

    pub async fn write_csr(&self, prefix: &str, cert_id: &str, csr_der: &[u8]) -> Result<()> {
        use openssl::x509::X509Req;
        let csr = X509Req::from_der(csr_der)?;
        let pem = csr.to_pem()?;
        tokio::fs::write(self.path(format!("{prefix}-{cert_id}-cert-request.csr")), pem).await?;
        Ok(())
    }

    /// Loads a cached keypair+chain pair. Returns `Ok(None)` (not an error)
    /// for any of: missing keypair, missing chain, unparseable PEM in
    /// either file, or a keypair that no longer matches the chain's leaf —
    /// all of these mean "no cached data" to the caller, and the certificate
    /// manager will obtain fresh material instead of treating this as fatal.
    pub async fn load_cert_pair(
        &self,
        prefix: &str,
        cert_id: &str,
    ) -> Result<Option<(PKey<Private>, Vec<X509>)>> {
        let key = self.read_cert_keypair(prefix, cert_id).await?;
        let chain = self.read_cert_chain(prefix, cert_id).await?;
        match (key, chain) {
            (Some(key), Some(chain)) => {
                let leaf = &chain[0];
                if keys::public_keys_match(&key, leaf).unwrap_or(false) {
                    Ok(Some((key, chain)))
                } else {
                    warn!("cached keypair for {prefix}-{cert_id} does not match cached chain leaf");
                    Ok(None)
                }
            }
            _ => Ok(None),
        }
    }

    // -- applied configuration ---------------------------------------------

    pub async fn read_active_config(&self) -> Result<Option<Config>> {
        let path = self.path("active.json");
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(config) => Ok(Some(config)),
                Err(e) => {
                    warn!("active.json at {path:?} failed to parse: {e}");
                    Err(e.into())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn write_active_config(&self, config: &Config) -> Result<()> {
        let json = serde_json::to_string_pretty(config)?;
        tokio::fs::write(self.path("active.json"), json).await?;
        Ok(())
    }

    async fn read_text_file(&self, name: &str) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.path(name)).await {
            Ok(content) => Ok(Some(content.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RenewalTime;

    #[tokio::test]
    async fn account_credentials_are_absent_until_written() {
        let dir = tempfile::tempdir().unwrap();
        let pl = Persistence::new(dir.path());
        pl.init().await.unwrap();

        assert!(pl.read_account_credentials("acc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn registration_state_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let pl = Persistence::new(dir.path());
        pl.init().await.unwrap();

        assert!(pl.read_registration_state("acc").await.unwrap().is_none());

        let state = RegistrationState {
            accepted_agreement_url: "https://example.org/tos".to_string(),
            contact_uris: vec!["mailto:ops@example.org".to_string()],
        };
        pl.write_registration_state("acc", &state).await.unwrap();

        let reloaded = pl.read_registration_state("acc").await.unwrap().unwrap();
        assert_eq!(reloaded, state);
    }

    #[tokio::test]
    async fn missing_chain_half_of_a_pair_yields_no_cached_data() {
        let dir = tempfile::tempdir().unwrap();
        let pl = Persistence::new(dir.path());
        pl.init().await.unwrap();

        let key = keys::generate_rsa_keypair().unwrap();
        pl.write_cert_keypair("acc", "api", &key).await.unwrap();
        // No chain written: pairing invariant says this counts as absent.

        assert!(pl.load_cert_pair("acc", "api").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn matching_pair_loads() {
        let dir = tempfile::tempdir().unwrap();
        let pl = Persistence::new(dir.path());
        pl.init().await.unwrap();

        let key = keys::generate_rsa_keypair().unwrap();
        let cert = keys::build_challenge_certificate(&key, &["api.example.org".to_string()]).unwrap();
        pl.write_cert_keypair("acc", "api", &key).await.unwrap();
        pl.write_cert_chain("acc", "api", &[cert]).await.unwrap();

        let (loaded_key, loaded_chain) = pl.load_cert_pair("acc", "api").await.unwrap().unwrap();
        assert!(key.public_eq(&loaded_key));
        assert_eq!(loaded_chain.len(), 1);
    }

    #[tokio::test]
    async fn active_config_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let pl = Persistence::new(dir.path());
        pl.init().await.unwrap();

        assert!(pl.read_active_config().await.unwrap().is_none());

        let config = Config {
            renewal_check_time: RenewalTime::new(3, 0, 0).unwrap(),
            accounts: Default::default(),
        };
        pl.write_active_config(&config).await.unwrap();

        let reloaded = pl.read_active_config().await.unwrap().unwrap();
        assert_eq!(reloaded, config);
    }
}
