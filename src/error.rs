//! Error types for the ACME certificate lifecycle engine.

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the engine.
///
/// CA retry-after hints are intentionally not a variant here: they are
/// recovered locally, becoming [`crate::retry::RetryOutcome::RetryAfter`],
/// before ever reaching a caller.
#[derive(Debug, Error)]
pub enum Error {
    /// Validation failure on a supplied `Config`. Fatal for the enclosing call.
    #[error("configuration invalid: {0}")]
    ConfigInvalid(String),

    /// Read/write/exists/mkdir against the persistence layer failed.
    #[error("file I/O error: {0}")]
    FileIo(#[from] std::io::Error),

    /// Any CA-returned error other than retry-after or conflict.
    #[error("ACME protocol error: {0}")]
    AcmeProtocol(#[from] instant_acme::Error),

    /// A CA interaction failed in a way not represented by `instant_acme::Error`
    /// (e.g. an order returning no authorizations at all).
    #[error("ACME protocol error: {0}")]
    Acme(String),

    /// Terminal non-VALID challenge status. Fatal for the enclosing certificate.
    #[error("challenge {challenge_type} for {domain} ended in status {status}")]
    ChallengeFailed {
        challenge_type: String,
        domain: String,
        status: String,
    },

    /// Leaf certificate is not yet valid — a clock or CA error, not a renewal case.
    #[error("certificate for {0} is not yet valid")]
    InvalidValidityWindow(String),

    /// Public Controller called from the wrong lifecycle state.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// RSA keygen, CSR construction, or X.509 parsing failed.
    #[error("certificate/key material error: {0}")]
    Crypto(String),

    /// `active.json` or challenge state failed to (de)serialize.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Multiple independent failures collected from a fan-out.
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

impl Error {
    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(e: openssl::error::ErrorStack) -> Self {
        Error::Crypto(e.to_string())
    }
}

/// A container wrapping multiple independent, labeled failures.
///
/// Used wherever per-certificate failures need to aggregate within an
/// account, and per-account failures within a reconcile, without one
/// failure short-circuiting its siblings.
#[derive(Debug)]
pub struct AggregateError {
    pub failures: Vec<(String, Error)>,
}

impl AggregateError {
    /// Builds an aggregate from labeled results, returning `Ok(())` if none failed.
    pub fn from_results(results: Vec<(String, Result<()>)>) -> Result<()> {
        let failures: Vec<(String, Error)> = results
            .into_iter()
            .filter_map(|(label, r)| r.err().map(|e| (label, e)))
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Aggregate(AggregateError { failures }))
        }
    }
}

impl std::fmt::Display for AggregateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failure(s)", self.failures.len())?;
        for (label, err) in &self.failures {
            write!(f, "; {label}: {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_of_all_ok_is_ok() {
        let results = vec![
            ("a".to_string(), Ok(())),
            ("b".to_string(), Ok(())),
        ];
        assert!(AggregateError::from_results(results).is_ok());
    }

    #[test]
    fn aggregate_collects_every_failure() {
        let results: Vec<(String, Result<()>)> = vec![
            ("a".to_string(), Ok(())),
            ("b".to_string(), Err(Error::IllegalState("bad".into()))),
            ("c".to_string(), Err(Error::ConfigInvalid("bad".into()))),
        ];
        let err = AggregateError::from_results(results).unwrap_err();
        match err {
            Error::Aggregate(agg) => assert_eq!(agg.failures.len(), 2),
            _ => panic!("expected aggregate"),
        }
    }
}
