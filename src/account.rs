//! Manages one CA account: registration, terms-of-service acceptance,
//! contact URIs, and the per-reconcile authorization cache; fans out to the
//! Certificate Manager for each configured certificate.

use futures::future::join_all;
use tracing::info;

use crate::certificate;
use crate::config::{map_diff, Account};
use crate::error::{AggregateError, Error, Result};
use crate::persistence::{Persistence, RegistrationState};
use crate::session::{AcmeSession, AuthorizationCache};
use crate::store::DynamicCertStore;

/// Loads whatever cached certificate material is already on disk for this
/// account's certificates, without contacting the CA.
///
/// If the account is being disabled or its `AccountDbId` is changing (a
/// `providerUrl` edit forcibly deregisters the old on-disk identity per
/// the old account's certificates are unloaded from the store
/// under the *old* prefix before the new account's certificates are loaded
/// fresh from disk under the *new* prefix. Otherwise the certificates are
/// diffed and each cached pass runs under the one shared prefix.
pub async fn update_cached(
    store: &DynamicCertStore,
    persistence: &Persistence,
    account_id: &str,
    old: Option<&Account>,
    new: Option<&Account>,
) -> Result<()> {
    let new_enabled = new.filter(|a| a.enabled);
    let old_db_id = old.map(|a| a.db_id(account_id));
    let new_db_id = new_enabled.map(|a| a.db_id(account_id));

    if new_enabled.is_none() || old_db_id != new_db_id {
        if let Some(old) = old {
            let prefix = old.db_id(account_id);
            run_cached_pass(store, persistence, &prefix, old.certificates.keys().map(|id| (id.as_str(), None))).await?;
        }
        if let Some(new) = new_enabled {
            let prefix = new.db_id(account_id);
            let pairs = new.certificates.iter().map(|(id, cert)| (id.as_str(), Some(cert)));
            run_cached_pass(store, persistence, &prefix, pairs).await?;
        }
        return Ok(());
    }

    let old = old.expect("old_db_id is Some only when old is Some");
    let prefix = new_db_id.expect("checked above");
    let diff = map_diff(&old.certificates, &new_enabled.unwrap().certificates);
    let pairs = diff.iter().map(|entry| (entry.key.as_str(), entry.new.as_ref()));
    run_cached_pass(store, persistence, &prefix, pairs).await
}

/// Runs `certificate::update_cached` for every `(cert_id, new)` pair
/// concurrently within this account, aggregating whichever fail.
async fn run_cached_pass<'a>(
    store: &DynamicCertStore,
    persistence: &Persistence,
    prefix: &str,
    pairs: impl Iterator<Item = (&'a str, Option<&'a crate::config::Certificate>)>,
) -> Result<()> {
    let futures = pairs.map(|(cert_id, new)| async move {
        let result = certificate::update_cached(store, persistence, prefix, cert_id, new).await;
        (cert_id.to_string(), result)
    });
    let results = join_all(futures).await;
    AggregateError::from_results(results)
}

/// Ensures the account is registered, reconciles registration properties,
/// and authorizes/issues/installs every configured certificate.
pub async fn update_others(
    store: &DynamicCertStore,
    persistence: &Persistence,
    account_id: &str,
    old: Option<&Account>,
    new: Option<&Account>,
) -> Result<()> {
    let Some(new) = new.filter(|a| a.enabled) else {
        return Ok(());
    };

    let prefix = new.db_id(account_id);
    let session = ensure_registration(persistence, &prefix, &new.provider_url, &new.contact_uris).await?;
    reconcile_registration_properties(persistence, &prefix, &session, new).await?;

    let old_certs = old
        .filter(|a| a.db_id(account_id) == prefix)
        .map(|a| &a.certificates);
    let empty = Default::default();
    let diff = map_diff(old_certs.unwrap_or(&empty), &new.certificates);

    let authorizations = AuthorizationCache::new(&session);
    let futures = diff.iter().map(|entry| {
        let authorizations = &authorizations;
        async move {
            let result = certificate::update_others(
                authorizations,
                store,
                persistence,
                &prefix,
                &entry.key,
                entry.old.as_ref(),
                entry.new.as_ref(),
                new.minimum_validity_days,
            )
            .await
            .map_err(|e| Error::Acme(format!("for certificate {}: {e}", entry.key)));
            (entry.key.clone(), result)
        }
    });
    let results = join_all(futures).await;
    AggregateError::from_results(results)
}

/// Binds to a cached registration, or registers a brand-new one and
/// persists its credentials and location. Account-key generation and
/// registration collapse into one step here since `instant-acme` bundles
/// them into a single call.
async fn ensure_registration(
    persistence: &Persistence,
    prefix: &str,
    provider_url: &str,
    contact_uris: &[String],
) -> Result<AcmeSession> {
    if let Some(credentials) = persistence.read_account_credentials(prefix).await? {
        let session = AcmeSession::bind(credentials).await?;
        info!("account {prefix} bound to existing registration at {}", session.location());
        Ok(session)
    } else {
        let (session, credentials) = AcmeSession::create(provider_url, contact_uris).await?;
        persistence.write_account_credentials(prefix, &credentials).await?;
        persistence.write_account_location(prefix, &session.location()).await?;
        info!("account {prefix} registered at {}", session.location());
        Ok(session)
    }
}

/// Commits an update to contacts/terms-of-service if either has drifted
/// from what was last persisted.
async fn reconcile_registration_properties(
    persistence: &Persistence,
    prefix: &str,
    session: &AcmeSession,
    account: &Account,
) -> Result<()> {
    let current = persistence.read_registration_state(prefix).await?;
    let desired = RegistrationState {
        accepted_agreement_url: account.accepted_agreement_url.clone(),
        contact_uris: account.contact_uris.clone(),
    };

    if current.as_ref() == Some(&desired) {
        return Ok(());
    }

    session.update_registration(&account.contact_uris).await?;
    persistence.write_registration_state(prefix, &desired).await?;
    info!("account {prefix} registration properties reconciled");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Certificate;
    use std::collections::BTreeMap;

    fn account(certs: BTreeMap<String, Certificate>, enabled: bool, provider_url: &str) -> Account {
        Account {
            enabled,
            provider_url: provider_url.to_string(),
            accepted_agreement_url: "https://example.org/tos".to_string(),
            contact_uris: vec!["mailto:ops@example.org".to_string()],
            minimum_validity_days: 30,
            certificates: certs,
        }
    }

    fn cert(hostnames: &[&str]) -> Certificate {
        Certificate {
            enabled: true,
            default_cert: false,
            organization: "Example Org".to_string(),
            hostnames: hostnames.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn update_cached_unloads_old_certificates_when_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::new(dir.path());
        persistence.init().await.unwrap();
        let store = DynamicCertStore::new();

        let mut certs = BTreeMap::new();
        certs.insert("api".to_string(), cert(&["api.example.org"]));
        let old = account(certs, true, "acme://example");

        let prefix = old.db_id("acc");
        let key = crate::keys::generate_rsa_keypair().unwrap();
        let leaf = crate::keys::build_challenge_certificate(&key, &["api.example.org".to_string()]).unwrap();
        store.put(&format!("{prefix}-api"), false, key, vec![leaf]);

        update_cached(&store, &persistence, "acc", Some(&old), None).await.unwrap();
        assert!(store.get(&format!("{prefix}-api")).is_none());
    }

    #[tokio::test]
    async fn update_cached_reloads_under_new_prefix_on_provider_change() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::new(dir.path());
        persistence.init().await.unwrap();
        let store = DynamicCertStore::new();

        let mut certs = BTreeMap::new();
        certs.insert("api".to_string(), cert(&["api.example.org"]));
        let old = account(certs.clone(), true, "acme://old");
        let new = account(certs, true, "acme://new");

        let old_prefix = old.db_id("acc");
        let new_prefix = new.db_id("acc");
        assert_ne!(old_prefix, new_prefix);

        let key = crate::keys::generate_rsa_keypair().unwrap();
        let leaf = crate::keys::build_challenge_certificate(&key, &["api.example.org".to_string()]).unwrap();
        store.put(&format!("{old_prefix}-api"), false, key, vec![leaf]);

        // No on-disk cache for the new prefix: the new entry should not appear.
        update_cached(&store, &persistence, "acc", Some(&old), Some(&new)).await.unwrap();
        assert!(store.get(&format!("{old_prefix}-api")).is_none());
        assert!(store.get(&format!("{new_prefix}-api")).is_none());
    }

    #[tokio::test]
    async fn update_cached_diffs_certificates_within_same_account() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::new(dir.path());
        persistence.init().await.unwrap();
        let store = DynamicCertStore::new();

        let mut old_certs = BTreeMap::new();
        old_certs.insert("api".to_string(), cert(&["api.example.org"]));
        let old = account(old_certs, true, "acme://example");

        let new = account(BTreeMap::new(), true, "acme://example");
        let prefix = old.db_id("acc");

        let key = crate::keys::generate_rsa_keypair().unwrap();
        let leaf = crate::keys::build_challenge_certificate(&key, &["api.example.org".to_string()]).unwrap();
        store.put(&format!("{prefix}-api"), false, key, vec![leaf]);

        update_cached(&store, &persistence, "acc", Some(&old), Some(&new)).await.unwrap();
        assert!(store.get(&format!("{prefix}-api")).is_none());
    }
}
