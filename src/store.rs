//! The Dynamic Certificate Store.
//!
//! Holds the authoritative set of active certificate entries and publishes
//! immutable snapshots to the TLS engine via `rustls::server::ResolvesServerCert`.
//!
//! Mutation is serialized by a `parking_lot::Mutex`; publication to
//! concurrent TLS readers is a lock-free `arc_swap::ArcSwap` pointer swap,
//! so a handshake in flight always sees one complete snapshot, never a
//! partially rebuilt one.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use parking_lot::Mutex;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tracing::{debug, info, warn};

use crate::keys;

/// A runtime certificate entry: id, default flag, private key, and a
/// leaf-first certificate chain.
#[derive(Clone)]
pub struct CertEntry {
    pub id: String,
    pub default_flag: bool,
    pub private_key: PKey<Private>,
    pub chain: Vec<X509>,
}

impl CertEntry {
    pub fn leaf(&self) -> &X509 {
        &self.chain[0]
    }

    fn sans(&self) -> Vec<String> {
        let leaf = self.leaf();
        let mut names = Vec::new();
        if let Some(san) = leaf.subject_alt_names() {
            for entry in san.iter() {
                if let Some(dns) = entry.dnsname() {
                    names.push(dns.to_ascii_lowercase());
                }
            }
        }
        names
    }

    fn to_certified_key(&self) -> Result<CertifiedKey, String> {
        let mut der_chain = Vec::with_capacity(self.chain.len());
        for cert in &self.chain {
            let der = cert.to_der().map_err(|e| e.to_string())?;
            der_chain.push(rustls::pki_types::CertificateDer::from(der));
        }
        let key_der = self
            .private_key
            .private_key_to_der()
            .map_err(|e| e.to_string())?;
        let key_der = rustls::pki_types::PrivateKeyDer::try_from(key_der).map_err(|e| e.to_string())?;
        let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key_der)
            .map_err(|e| e.to_string())?;
        Ok(CertifiedKey::new(der_chain, signing_key))
    }
}

/// An immutable, published keystore snapshot: every current entry plus the
/// resolved default alias, consumable by the TLS engine.
struct PublishedSnapshot {
    /// SNI hostname -> certified key, built from every entry's chain leaf SANs.
    by_hostname: BTreeMap<String, Arc<CertifiedKey>>,
    default_key: Option<Arc<CertifiedKey>>,
}

impl PublishedSnapshot {
    fn empty() -> Self {
        Self {
            by_hostname: BTreeMap::new(),
            default_key: None,
        }
    }
}

/// The Dynamic Certificate Store.
pub struct DynamicCertStore {
    entries: Mutex<BTreeMap<String, CertEntry>>,
    default_alias: Mutex<Option<String>>,
    snapshot: ArcSwap<PublishedSnapshot>,
}

impl DynamicCertStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            default_alias: Mutex::new(None),
            snapshot: ArcSwap::from_pointee(PublishedSnapshot::empty()),
        }
    }

    /// Inserts or replaces `id`. Triggers a rebuild and publication.
    pub fn put(&self, id: &str, default_flag: bool, private_key: PKey<Private>, chain: Vec<X509>) {
        let entry = CertEntry {
            id: id.to_string(),
            default_flag,
            private_key,
            chain,
        };
        let mut entries = self.entries.lock();
        if entries.contains_key(id) {
            info!("Replacing certificate entry {id}");
        } else {
            info!("Installing certificate entry {id}");
        }
        entries.insert(id.to_string(), entry);
        self.rebuild_locked(&entries);
    }

    /// Removes `id` if present. Triggers a rebuild and publication either way.
    pub fn remove(&self, id: &str) {
        let mut entries = self.entries.lock();
        if entries.remove(id).is_some() {
            info!("Removing certificate entry {id}");
        } else {
            debug!("Nothing to remove for certificate entry {id}");
        }
        self.rebuild_locked(&entries);
    }

    /// Read-only lookup by id.
    pub fn get(&self, id: &str) -> Option<CertEntry> {
        self.entries.lock().get(id).cloned()
    }

    /// Elects which entry's alias is served as the SNI-less fallback.
    /// `None` clears the default.
    pub fn set_id_of_default_alias(&self, id: Option<&str>) {
        *self.default_alias.lock() = id.map(|s| s.to_string());
        let entries = self.entries.lock();
        self.rebuild_locked(&entries);
    }

    fn rebuild_locked(&self, entries: &BTreeMap<String, CertEntry>) {
        let default_alias = self.default_alias.lock().clone();
        let mut by_hostname = BTreeMap::new();
        let mut default_key = None;

        // Deterministic ordering by id.
        for (id, entry) in entries.iter() {
            let certified_key = match entry.to_certified_key() {
                Ok(k) => Arc::new(k),
                Err(e) => {
                    warn!("skipping malformed entry {id} while rebuilding snapshot: {e}");
                    continue;
                }
            };
            for san in entry.sans() {
                by_hostname.insert(san, certified_key.clone());
            }
            if default_alias.as_deref() == Some(id.as_str()) {
                default_key = Some(certified_key);
            }
        }

        self.snapshot.store(Arc::new(PublishedSnapshot {
            by_hostname,
            default_key,
        }));
    }
}

impl Default for DynamicCertStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ResolvesServerCert for DynamicCertStore {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let snapshot = self.snapshot.load();
        if let Some(sni) = client_hello.server_name() {
            if let Some(key) = snapshot.by_hostname.get(&sni.to_ascii_lowercase()) {
                return Some(key.clone());
            }
        }
        snapshot.default_key.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, hostnames: &[&str]) -> (PKey<Private>, Vec<X509>) {
        let key = keys::generate_rsa_keypair().unwrap();
        let names = hostnames.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let cert = keys::build_challenge_certificate(&key, &names).unwrap();
        let _ = id;
        (key, vec![cert])
    }

    #[test]
    fn put_then_get_round_trips() {
        let store = DynamicCertStore::new();
        let (key, chain) = entry("a", &["a.example.org"]);
        store.put("a", false, key, chain);
        assert!(store.get("a").is_some());
        assert!(store.get("missing").is_none());
    }

    #[test]
    fn remove_absent_is_a_noop_not_an_error() {
        let store = DynamicCertStore::new();
        store.remove("nonexistent");
        assert!(store.get("nonexistent").is_none());
    }

    #[test]
    fn default_alias_resolves_when_no_sni_matches() {
        let store = DynamicCertStore::new();
        let (key, chain) = entry("a", &["a.example.org"]);
        store.put("a", true, key, chain);
        store.set_id_of_default_alias(Some("a"));

        let snapshot = store.snapshot.load();
        assert!(snapshot.default_key.is_some());
    }

    #[test]
    fn clearing_default_alias_removes_fallback() {
        let store = DynamicCertStore::new();
        let (key, chain) = entry("a", &["a.example.org"]);
        store.put("a", true, key, chain);
        store.set_id_of_default_alias(Some("a"));
        store.set_id_of_default_alias(None);

        let snapshot = store.snapshot.load();
        assert!(snapshot.default_key.is_none());
    }

    #[test]
    fn concurrent_reads_never_see_a_torn_snapshot() {
        use std::sync::Arc as StdArc;
        use std::thread;

        let store = StdArc::new(DynamicCertStore::new());
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(thread::spawn(move || {
                let (key, chain) = entry(&format!("e{i}"), &[&format!("h{i}.example.org")]);
                store.put(&format!("e{i}"), false, key, chain);
                // A concurrent read must yield a fully-formed snapshot or none at all.
                let snapshot = store.snapshot.load();
                for (_, v) in snapshot.by_hostname.iter() {
                    let _ = v.cert.len();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
