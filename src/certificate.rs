//! Manages the lifecycle of one configured certificate: loads cached
//! material, decides whether renewal is required, sequences per-domain
//! authorizations, builds a CSR, requests/downloads the chain, persists it,
//! and installs it in the Dynamic Certificate Store.

use instant_acme::{OrderStatus, RetryPolicy};
use tracing::info;

use crate::config::Certificate;
use crate::error::{Error, Result};
use crate::keys;
use crate::persistence::Persistence;
use crate::session::AuthorizationCache;
use crate::store::DynamicCertStore;

fn full_id(prefix: &str, cert_id: &str) -> String {
    format!("{prefix}-{cert_id}")
}

/// Loads whatever cached material is on disk and installs it in the DCS so
/// the engine serves a certificate immediately at startup, before any CA
/// interaction. Missing or malformed cache data is never an error here;
/// `update_others` is responsible for obtaining fresh material.
pub async fn update_cached(
    store: &DynamicCertStore,
    persistence: &Persistence,
    prefix: &str,
    cert_id: &str,
    new: Option<&Certificate>,
) -> Result<()> {
    let id = full_id(prefix, cert_id);

    let Some(new) = new.filter(|c| c.enabled) else {
        store.remove(&id);
        return Ok(());
    };

    if store.get(&id).is_some() {
        return Ok(());
    }

    if let Some((key, chain)) = persistence.load_cert_pair(prefix, cert_id).await? {
        info!("installing cached certificate {id} from disk");
        store.put(&id, new.default_cert, key, chain);
    }

    Ok(())
}

/// Authorizes, issues, and installs fresh certificate material when the
/// cached entry is absent, stale, or due for renewal.
pub async fn update_others(
    authorizations: &AuthorizationCache<'_>,
    store: &DynamicCertStore,
    persistence: &Persistence,
    prefix: &str,
    cert_id: &str,
    old: Option<&Certificate>,
    new: Option<&Certificate>,
    minimum_validity_days: i64,
) -> Result<()> {
    let id = full_id(prefix, cert_id);

    let Some(new) = new.filter(|c| c.enabled) else {
        return Ok(());
    };

    if Some(new) == old {
        if let Some(entry) = store.get(&id) {
            match keys::days_until_expiry(entry.leaf()) {
                Ok(days) if days >= minimum_validity_days => {
                    return Ok(());
                }
                Ok(_) => {
                    info!("certificate {id} is within its renewal window, renewing");
                }
                Err(e) => return Err(e),
            }
        }
    }

    authorizations.authorize_all(store, &new.hostnames).await?;

    // `instant-acme` 0.8's `Order::finalize()` takes no CSR argument: it
    // generates the certificate keypair itself and returns it as PEM, so
    // there is no caller-supplied key to reuse across renewals the way a
    // CSR-submission model would allow (see DESIGN.md).
    let mut order = authorizations.session().new_certificate_order(&new.hostnames).await?;

    let ready_status = order
        .poll_ready(&RetryPolicy::default())
        .await
        .map_err(Error::AcmeProtocol)?;
    if ready_status != OrderStatus::Ready {
        return Err(Error::Acme(format!(
            "order for certificate {id} did not reach ready, got {ready_status:?}"
        )));
    }

    let key_pem = order.finalize().await.map_err(Error::AcmeProtocol)?;
    let cert_key = keys::private_key_from_pem(key_pem.as_bytes())?;
    persistence.write_cert_keypair(prefix, cert_id, &cert_key).await?;

    // The literal CSR bytes submitted to the CA are generated internally by
    // `instant-acme` and never surfaced; this rebuilds an equivalent CSR
    // from the returned key purely as the on-disk renewal-auditing artifact
    // `P-<cert>-cert-request.csr` is meant to be.
    let csr = keys::build_csr(&cert_key, &new.organization, &new.hostnames)?;
    let csr_der = keys::csr_to_der(&csr)?;
    persistence.write_csr(prefix, cert_id, &csr_der).await?;

    let chain_pem = order
        .poll_certificate(&RetryPolicy::default())
        .await
        .map_err(Error::AcmeProtocol)?;
    let chain = keys::chain_from_pem(chain_pem.as_bytes())?;
    persistence.write_cert_chain(prefix, cert_id, &chain).await?;

    info!("installing freshly issued certificate {id}");
    store.put(&id, new.default_cert, cert_key, chain);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Certificate;

    fn cert(hostnames: &[&str], default_cert: bool) -> Certificate {
        Certificate {
            enabled: true,
            default_cert,
            organization: "Example Org".to_string(),
            hostnames: hostnames.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn update_cached_removes_disabled_certificate() {
        let store = DynamicCertStore::new();
        let key = keys::generate_rsa_keypair().unwrap();
        let leaf = keys::build_challenge_certificate(&key, &["a.example.org".to_string()]).unwrap();
        store.put("acc-api", false, key, vec![leaf]);

        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::new(dir.path());
        persistence.init().await.unwrap();

        update_cached(&store, &persistence, "acc", "api", None).await.unwrap();
        assert!(store.get("acc-api").is_none());
    }

    #[tokio::test]
    async fn update_cached_loads_matching_pair_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::new(dir.path());
        persistence.init().await.unwrap();

        let key = keys::generate_rsa_keypair().unwrap();
        let leaf = keys::build_challenge_certificate(&key, &["api.example.org".to_string()]).unwrap();
        persistence.write_cert_keypair("acc", "api", &key).await.unwrap();
        persistence.write_cert_chain("acc", "api", &[leaf]).await.unwrap();

        let store = DynamicCertStore::new();
        let new = cert(&["api.example.org"], true);
        update_cached(&store, &persistence, "acc", "api", Some(&new)).await.unwrap();
        assert!(store.get("acc-api").is_some());
    }

    #[tokio::test]
    async fn update_cached_does_not_reload_an_already_installed_entry() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::new(dir.path());
        persistence.init().await.unwrap();

        let store = DynamicCertStore::new();
        let key = keys::generate_rsa_keypair().unwrap();
        let leaf = keys::build_challenge_certificate(&key, &["api.example.org".to_string()]).unwrap();
        store.put("acc-api", false, key, vec![leaf]);

        // No on-disk material at all; if update_cached tried to reload it
        // would find nothing and remove the live entry. It must not even try.
        let new = cert(&["api.example.org"], false);
        update_cached(&store, &persistence, "acc", "api", Some(&new)).await.unwrap();
        assert!(store.get("acc-api").is_some());
    }
}
