//! Performs a single domain authorization: selects a challenge, stands up a
//! short-lived self-signed challenge certificate in the Dynamic Certificate
//! Store, triggers validation, and tears the entry down again.

use instant_acme::AuthorizationStatus;
use openssl::hash::{hash, MessageDigest};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::keys;
use crate::session::{is_already_valid, DomainAuthorization};
use crate::store::DynamicCertStore;

/// The two challenge types this engine understands, derived the way the
/// original (now withdrawn from the live protocol) TLS-SNI-01/02 challenges
/// defined them: a SAN label pair hex-derived from a SHA-256 digest.
/// `instant-acme` no longer offers these types directly (the live ACME
/// protocol replaced them with `tls-alpn-01`); the derivation is kept
/// regardless and applied to whichever TLS-handshake challenge the CA offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SniChallengeKind {
    Sni01,
    Sni02,
}

impl SniChallengeKind {
    fn name(self) -> &'static str {
        match self {
            SniChallengeKind::Sni01 => "TLS-SNI-01",
            SniChallengeKind::Sni02 => "TLS-SNI-02",
        }
    }
}

fn sha256_hex(data: &[u8]) -> Result<String> {
    let digest = hash(MessageDigest::sha256(), data)?;
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

/// Derives the `subject`/`sanB` SAN labels from the challenge's token and
/// key authorization, following the classic TLS-SNI-01/02 construction.
fn derive_sans(kind: SniChallengeKind, token: &str, key_authorization: &str) -> Result<(String, Option<String>)> {
    match kind {
        SniChallengeKind::Sni01 => {
            let z = sha256_hex(key_authorization.as_bytes())?;
            let subject = format!("{}.{}.acme.invalid", &z[0..32], &z[32..64]);
            Ok((subject, None))
        }
        SniChallengeKind::Sni02 => {
            let za = sha256_hex(token.as_bytes())?;
            let subject = format!("{}.{}.token.acme.invalid", &za[0..32], &za[32..64]);
            let zb = sha256_hex(key_authorization.as_bytes())?;
            let san_b = format!("{}.{}.ka.acme.invalid", &zb[0..32], &zb[32..64]);
            Ok((subject, Some(san_b)))
        }
    }
}

/// Performs a single domain authorization, driving the Dynamic Certificate
/// Store through the short-lived challenge install and teardown.
///
/// `authorization` is supplied by the caller (the Account Manager's
/// per-reconcile authorization cache, §4.5) rather than fetched here — this
/// function only drives one authorization to a terminal status, it does not
/// own the decision of when to fetch a fresh one versus reuse a cached one.
pub async fn authorize_domain(
    authorization: &mut DomainAuthorization,
    store: &DynamicCertStore,
    domain: &str,
) -> Result<()> {
    if is_already_valid(authorization) {
        info!("authorization for {domain} already valid");
        return Ok(());
    }

    // `instant-acme` offers TLS-ALPN-01, the one TLS-handshake challenge
    // surviving in the live protocol; the classic TLS-SNI-01 SAN derivation
    // is kept and driven through it (see DESIGN.md).
    let kind = SniChallengeKind::Sni01;
    let Some(challenge) = authorization.take_challenge() else {
        return Err(Error::ChallengeFailed {
            challenge_type: "none-supported".to_string(),
            domain: domain.to_string(),
            status: "no matching combination".to_string(),
        });
    };

    let entry_id = format!("letsencrypt-challenge-{domain}");

    // A fresh 4096-bit RSA keypair for the challenge certificate.
    let challenge_key = keys::generate_rsa_keypair()?;

    let key_authorization = challenge.key_authorization().as_str().to_string();
    let (subject, san_b) = derive_sans(kind, &challenge.token, &key_authorization)?;

    let mut san_names = vec![subject];
    if let Some(san_b) = san_b {
        san_names.push(san_b);
    }

    let challenge_cert = keys::build_challenge_certificate(&challenge_key, &san_names)?;

    // Install before triggering, so the CA's TLS probe finds it.
    store.put(&entry_id, false, challenge_key, vec![challenge_cert]);
    info!("installed {} challenge certificate for {domain}", kind.name());

    let result = authorization.drive_to_terminal_status(challenge).await;

    // Remove the challenge entry whether success or failure.
    store.remove(&entry_id);

    match result {
        Ok(AuthorizationStatus::Valid) => {
            info!("{} challenge for {domain} succeeded", kind.name());
            Ok(())
        }
        Ok(other) => {
            warn!("{} challenge for {domain} ended in {other:?}", kind.name());
            Err(Error::ChallengeFailed {
                challenge_type: kind.name().to_string(),
                domain: domain.to_string(),
                status: format!("{other:?}"),
            })
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sni01_derives_a_single_subject_label() {
        let (subject, san_b) = derive_sans(SniChallengeKind::Sni01, "tok", "keyauth").unwrap();
        assert!(subject.ends_with(".acme.invalid"));
        assert!(san_b.is_none());
    }

    #[test]
    fn sni02_derives_subject_and_san_b() {
        let (subject, san_b) = derive_sans(SniChallengeKind::Sni02, "tok", "keyauth").unwrap();
        assert!(subject.ends_with(".token.acme.invalid"));
        let san_b = san_b.unwrap();
        assert!(san_b.ends_with(".ka.acme.invalid"));
        assert_ne!(subject, san_b);
    }

    #[test]
    fn derivation_is_deterministic() {
        let a = derive_sans(SniChallengeKind::Sni01, "t", "k").unwrap();
        let b = derive_sans(SniChallengeKind::Sni01, "t", "k").unwrap();
        assert_eq!(a, b);
    }
}
