//! Key, CSR, and certificate plumbing.
//!
//! All heavy cryptographic work here (RSA keygen, CSR signing) is
//! synchronous and is expected to be driven from `tokio::task::spawn_blocking`
//! by callers so it never blocks the async runtime.

use openssl::asn1::Asn1Time;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509Builder, X509NameBuilder, X509Req, X509ReqBuilder, X509};

use crate::error::{Error, Result};

/// RSA key size used throughout: account keys, certificate keys, and
/// challenge keys are all 4096-bit RSA.
pub const RSA_KEY_BITS: u32 = 4096;

/// Generates a fresh 4096-bit RSA keypair.
pub fn generate_rsa_keypair() -> Result<PKey<Private>> {
    let rsa = Rsa::generate(RSA_KEY_BITS)?;
    Ok(PKey::from_rsa(rsa)?)
}

/// Loads a PEM-encoded private key.
pub fn private_key_from_pem(pem: &[u8]) -> Result<PKey<Private>> {
    PKey::private_key_from_pem(pem).map_err(Error::from)
}

/// Serializes a private key as PEM (PKCS#8).
pub fn private_key_to_pem(key: &PKey<Private>) -> Result<Vec<u8>> {
    key.private_key_to_pem_pkcs8().map_err(Error::from)
}

/// Parses a leaf-first chain of PEM-concatenated certificates.
pub fn chain_from_pem(pem: &[u8]) -> Result<Vec<X509>> {
    X509::stack_from_pem(pem).map_err(Error::from)
}

/// Serializes a leaf-first certificate chain as one PEM-concatenated blob.
pub fn chain_to_pem(chain: &[X509]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for cert in chain {
        out.extend(cert.to_pem()?);
    }
    Ok(out)
}

/// Builds a CSR for `hostnames`, one `subjectAltName` DNS entry per hostname,
/// `organization` set on the subject name, signed by `key`.
pub fn build_csr(key: &PKey<Private>, organization: &str, hostnames: &[String]) -> Result<X509Req> {
    let mut builder = X509ReqBuilder::new()?;
    builder.set_pubkey(key)?;

    let mut name_builder = X509NameBuilder::new()?;
    if !organization.is_empty() {
        name_builder.append_entry_by_text("O", organization)?;
    }
    if let Some(primary) = hostnames.first() {
        name_builder.append_entry_by_text("CN", primary)?;
    }
    builder.set_subject_name(&name_builder.build())?;

    let san_value = hostnames
        .iter()
        .map(|h| format!("DNS:{h}"))
        .collect::<Vec<_>>()
        .join(",");
    let context = builder.x509v3_context(None);
    let san_extension = SubjectAlternativeName::new().dns(&san_value).build(&context)?;
    let mut extensions = openssl::stack::Stack::new()?;
    extensions.push(san_extension)?;
    builder.add_extensions(&extensions)?;

    builder.sign(key, MessageDigest::sha256())?;
    Ok(builder.build())
}

/// DER encoding of a CSR, the form the ACME order's `finalize` call expects.
pub fn csr_to_der(csr: &X509Req) -> Result<Vec<u8>> {
    csr.to_der().map_err(Error::from)
}

/// Builds a short-lived, self-signed challenge certificate whose
/// `subjectAltName` carries the supplied DNS names. Used for the
/// TLS-SNI-01/02 challenge types, where the CA's handshake-level validation
/// only needs to observe a certificate bearing the expected SAN(s), not a
/// CA-issued one.
pub fn build_challenge_certificate(key: &PKey<Private>, san_names: &[String]) -> Result<X509> {
    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;

    let mut name_builder = X509NameBuilder::new()?;
    if let Some(first) = san_names.first() {
        name_builder.append_entry_by_text("CN", first)?;
    }
    let name = name_builder.build();
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;

    builder.set_pubkey(key)?;

    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(1)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;

    let serial = openssl::bn::BigNum::from_u32(1)?;
    builder.set_serial_number(&openssl::asn1::Asn1Integer::from_bn(&serial)?)?;

    let san_value = san_names
        .iter()
        .map(|h| format!("DNS:{h}"))
        .collect::<Vec<_>>()
        .join(",");
    let context = builder.x509v3_context(None, None);
    let san_extension = SubjectAlternativeName::new().dns(&san_value).build(&context)?;
    builder.append_extension(san_extension)?;

    builder.sign(key, MessageDigest::sha256())?;
    Ok(builder.build())
}

/// Days remaining until `cert`'s `notAfter`, negative if already expired.
/// Returns an error (mapped by callers to `InvalidValidityWindow`) if the
/// certificate is not yet valid, i.e. `notBefore` is still in the future.
///
/// Parsed with `x509_parser` rather than re-deriving the comparison from
/// `openssl`'s own `Asn1Time` (which has no direct subtraction and would
/// need its own day/second arithmetic) — `x509-parser` is already a
/// dependency and carries exactly this leaf-validity read.
pub fn days_until_expiry(cert: &X509) -> Result<i64> {
    let der = cert.to_der()?;
    let (_, parsed) = x509_parser::parse_x509_certificate(&der)
        .map_err(|e| Error::crypto(format!("leaf certificate failed to parse: {e}")))?;
    let validity = parsed.validity();
    let now = x509_parser::time::ASN1Time::now();

    if validity.not_before > now {
        return Err(Error::InvalidValidityWindow(
            "certificate notBefore is in the future".to_string(),
        ));
    }

    Ok((validity.not_after.timestamp() - now.timestamp()) / 86_400)
}

/// Whether the public key embedded in `csr`/`cert` match. Used to validate
/// that a cached keypair still matches its cached chain's leaf.
pub fn public_keys_match(key: &PKey<Private>, cert: &X509) -> Result<bool> {
    Ok(cert.public_key()?.public_eq(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsa_keypair_round_trips_through_pem() {
        let key = generate_rsa_keypair().unwrap();
        let pem = private_key_to_pem(&key).unwrap();
        let reloaded = private_key_from_pem(&pem).unwrap();
        assert!(key.public_eq(&reloaded));
    }

    #[test]
    fn csr_carries_every_hostname_as_san() {
        let key = generate_rsa_keypair().unwrap();
        let hostnames = vec!["a.example.org".to_string(), "b.example.org".to_string()];
        let csr = build_csr(&key, "Example Org", &hostnames).unwrap();
        let der = csr_to_der(&csr).unwrap();
        assert!(!der.is_empty());
    }

    #[test]
    fn challenge_certificate_is_self_signed_and_valid_now() {
        let key = generate_rsa_keypair().unwrap();
        let cert = build_challenge_certificate(&key, &["letsencrypt-challenge.example.org".to_string()])
            .unwrap();
        assert!(public_keys_match(&key, &cert).unwrap());
        assert!(days_until_expiry(&cert).unwrap() >= 0);
    }
}
