//! Thin wrapper over the ACME client SDK (`instant-acme`).
//!
//! Everything above this module talks to `AcmeSession`/`DomainAuthorization`,
//! never to `instant_acme` directly, so account/certificate/challenge
//! management stay testable without a live CA.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use instant_acme::{
    Account, AccountCredentials, Authorization, AuthorizationStatus, Challenge, ChallengeType,
    Identifier, NewOrder, Order, OrderStatus, RetryPolicy,
};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::store::DynamicCertStore;

/// An authenticated client-side context bound to one account keypair and
/// provider URL.
pub struct AcmeSession {
    account: Account,
}

impl AcmeSession {
    /// Registers a brand-new account at `directory_url`, generating a fresh
    /// account key. Returns the session alongside the [`AccountCredentials`]
    /// the caller must persist to rebind to this same account on a later
    /// reconcile or restart.
    pub async fn create(directory_url: &str, contact_uris: &[String]) -> Result<(Self, AccountCredentials)> {
        let contact_refs: Vec<&str> = contact_uris.iter().map(|s| s.as_str()).collect();
        let new_account = instant_acme::NewAccount {
            contact: &contact_refs,
            terms_of_service_agreed: true,
            only_return_existing: false,
        };

        let (account, credentials) = Account::builder()
            .map_err(Error::AcmeProtocol)?
            .create(&new_account, directory_url.to_string(), None)
            .await
            .map_err(Error::AcmeProtocol)?;
        info!("ACME account registered at {}", account.id());
        Ok((Self { account }, credentials))
    }

    /// Rebinds to an existing registration from previously persisted
    /// credentials, making no network request of its own.
    pub async fn bind(credentials: AccountCredentials) -> Result<Self> {
        let account = Account::builder()
            .map_err(Error::AcmeProtocol)?
            .from_credentials(credentials)
            .await
            .map_err(Error::AcmeProtocol)?;
        info!("bound existing ACME account at {}", account.id());
        Ok(Self { account })
    }

    pub fn location(&self) -> String {
        self.account.id().to_string()
    }

    /// Commits a contacts update against this registration, RFC 8555's
    /// "update account" POST, and re-affirms terms-of-service agreement in
    /// the same request. The agreement URL itself has no wire effect here
    /// (the CA's directory, not the account, is what names a `termsOfService`
    /// URL); the Account Manager persists it purely for its own comparison
    /// on the next reconcile. Submitted only when the Account Manager
    /// detects a difference against what it last persisted, so a session
    /// that never needs reconciling never issues this call.
    pub async fn update_registration(&self, contact_uris: &[String]) -> Result<()> {
        let contact_refs: Vec<&str> = contact_uris.iter().map(|s| s.as_str()).collect();
        self.account
            .update(&instant_acme::AccountUpdate {
                contact: Some(&contact_refs),
                terms_of_service_agreed: Some(true),
                ..Default::default()
            })
            .await
            .map_err(Error::AcmeProtocol)?;
        Ok(())
    }

    /// Opens a fresh single-identifier order and returns its lone
    /// authorization, still bound to the order so the caller can drive
    /// challenge readiness and poll status. Per RFC 8555, the CA reuses any
    /// still-valid authorization already held by the account for that
    /// identifier, so this both fetches an existing authorization and
    /// requests a new one depending on account state.
    pub async fn get_authorization(&self, domain: &str) -> Result<DomainAuthorization> {
        let identifiers = vec![Identifier::Dns(domain.to_string())];
        let mut order = self
            .account
            .new_order(&NewOrder::new(&identifiers))
            .await
            .map_err(Error::AcmeProtocol)?;

        // `Order::authorizations()` returns a stream, not a future — the
        // borrow on `order` it holds is dropped at the end of this block,
        // before `order` moves into the returned `DomainAuthorization`.
        let authorization = {
            let mut authorizations = order.authorizations();
            authorizations
                .next()
                .await
                .ok_or_else(|| Error::Acme(format!("no authorization returned for order on {domain}")))?
                .map_err(Error::AcmeProtocol)?
        };

        Ok(DomainAuthorization { order, authorization })
    }

    /// Opens a certificate order covering every hostname, to be driven
    /// (finalize + download) by `CertificateManager` once all hostnames are
    /// independently authorized via [`AcmeSession::get_authorization`].
    pub async fn new_certificate_order(&self, hostnames: &[String]) -> Result<Order> {
        let identifiers: Vec<Identifier> = hostnames.iter().map(|h| Identifier::Dns(h.clone())).collect();
        self.account
            .new_order(&NewOrder::new(&identifiers))
            .await
            .map_err(Error::AcmeProtocol)
    }
}

/// One domain's authorization, still bound to the order that produced it so
/// challenge readiness and status can be driven to completion.
pub struct DomainAuthorization {
    order: Order,
    authorization: Authorization,
}

impl DomainAuthorization {
    pub fn status(&self) -> AuthorizationStatus {
        self.authorization.status
    }

    /// Takes the TLS-ALPN-01 challenge out of this authorization, if the CA
    /// offered it. Consumes the authorization's only use of this challenge
    /// slot — called at most once per domain per reconcile.
    pub fn take_challenge(&mut self) -> Option<Challenge> {
        self.authorization.challenge(ChallengeType::TlsAlpn01)
    }

    /// Signals the CA that the challenge response has been deployed, then
    /// waits (via `instant-acme`'s own `RetryPolicy`-driven polling, which
    /// already implements the "wait a few seconds, honor retry-after"
    /// contract this engine's own retry loop describes) until the order
    /// reaches a terminal ready/invalid status.
    pub async fn drive_to_terminal_status(&mut self, mut challenge: Challenge) -> Result<AuthorizationStatus> {
        challenge.set_ready().await.map_err(Error::AcmeProtocol)?;

        let order_status = self
            .order
            .poll_ready(&RetryPolicy::default())
            .await
            .map_err(Error::AcmeProtocol)?;

        Ok(match order_status {
            OrderStatus::Ready | OrderStatus::Valid => AuthorizationStatus::Valid,
            OrderStatus::Invalid => AuthorizationStatus::Invalid,
            other => {
                warn!("order left in unexpected status {other:?} after polling to readiness");
                AuthorizationStatus::Pending
            }
        })
    }
}

/// Whether an authorization is already satisfied, never needing a challenge.
pub fn is_already_valid(authorization: &DomainAuthorization) -> bool {
    authorization.status() == AuthorizationStatus::Valid
}

/// Memoizes domain authorizations for the lifetime of one Account Manager
/// `update_others` invocation.
///
/// To avoid a reference cycle between the account and certificate layers,
/// this is handed to the Certificate/Challenge Managers as a capability of
/// its own rather than routed back through the owning `AccountManager`.
/// A per-domain `Mutex` (rather than one mutex guarding the whole map)
/// means authorizing two different hostnames, from two certificates running
/// concurrently in the same account's phase 2, never blocks on each other.
pub struct AuthorizationCache<'a> {
    session: &'a AcmeSession,
    entries: Mutex<HashMap<String, Arc<Mutex<DomainAuthorization>>>>,
}

impl<'a> AuthorizationCache<'a> {
    pub fn new(session: &'a AcmeSession) -> Self {
        Self {
            session,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The session this cache's authorizations were fetched from, for
    /// callers that also need to open certificate orders on it.
    pub fn session(&self) -> &'a AcmeSession {
        self.session
    }

    async fn entry(&self, domain: &str) -> Result<Arc<Mutex<DomainAuthorization>>> {
        if let Some(existing) = self.entries.lock().await.get(domain) {
            return Ok(existing.clone());
        }
        let fetched = self.session.get_authorization(domain).await?;
        let mut entries = self.entries.lock().await;
        let entry = entries
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(fetched)));
        Ok(entry.clone())
    }

    /// Authorizes every hostname strictly in declared order, consulting
    /// (and populating) this cache rather than re-fetching an authorization
    /// already obtained earlier in this invocation.
    pub async fn authorize_all(&self, store: &DynamicCertStore, hostnames: &[String]) -> Result<()> {
        for hostname in hostnames {
            let entry = self.entry(hostname).await?;
            let mut authorization = entry.lock().await;
            crate::challenge::authorize_domain(&mut authorization, store, hostname).await?;
        }
        Ok(())
    }
}
