//! Declarative configuration schema and the diff primitive the reconciler
//! and account manager both fan out over.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Root configuration: one renewal check time-of-day plus a mapping of
/// account id to `Account`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub renewal_check_time: RenewalTime,
    #[serde(default)]
    pub accounts: BTreeMap<String, Account>,
}

impl Config {
    /// The configuration adopted before any user configuration has ever
    /// been supplied.
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Wall-clock time-of-day at which the daily renewal check fires.
/// Deliberately not a datetime type: the engine only ever needs
/// "next occurrence of this time today-or-tomorrow", not calendar math.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RenewalTime {
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl RenewalTime {
    pub fn new(hour: u8, minute: u8, second: u8) -> Result<Self> {
        if hour > 23 || minute > 59 || second > 59 {
            return Err(Error::ConfigInvalid(format!(
                "invalid renewalCheckTime {hour:02}:{minute:02}:{second:02}"
            )));
        }
        Ok(Self { hour, minute, second })
    }

    /// Seconds since midnight, used to compute the next firing instant.
    pub fn seconds_since_midnight(&self) -> u32 {
        self.hour as u32 * 3600 + self.minute as u32 * 60 + self.second as u32
    }
}

impl std::fmt::Display for RenewalTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02}:{:02}", self.hour, self.minute, self.second)
    }
}

impl Serialize for RenewalTime {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RenewalTime {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

impl RenewalTime {
    pub fn parse(raw: &str) -> Result<Self> {
        let parts: Vec<&str> = raw.split(':').collect();
        let [h, m, s] = parts[..] else {
            return Err(Error::ConfigInvalid(format!(
                "renewalCheckTime must be HH:MM:SS, got {raw:?}"
            )));
        };
        let parse_part = |p: &str| {
            p.parse::<u8>()
                .map_err(|_| Error::ConfigInvalid(format!("renewalCheckTime component {p:?} is not a number")))
        };
        Self::new(parse_part(h)?, parse_part(m)?, parse_part(s)?)
    }
}

/// One CA account: its registration parameters and the certificates it manages.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    #[serde(default)]
    pub enabled: bool,
    pub provider_url: String,
    pub accepted_agreement_url: String,
    #[serde(default)]
    pub contact_uris: Vec<String>,
    #[serde(default)]
    pub minimum_validity_days: i64,
    #[serde(default)]
    pub certificates: BTreeMap<String, Certificate>,
}

impl Account {
    /// The filename-safe, on-disk identity for this account.
    /// `account_id` is the config key this account is stored under.
    pub fn db_id(&self, account_id: &str) -> String {
        format!("{account_id}-{}", urlencoding::encode(&self.provider_url))
    }
}

/// One configured certificate: its subject material and the hostnames it covers.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub default_cert: bool,
    #[serde(default)]
    pub organization: String,
    pub hostnames: Vec<String>,
}

/// Validates a `Config`:
/// non-empty, syntactically valid hostnames per certificate; non-negative
/// `minimumValidityDays`; at most one enabled default certificate overall.
pub fn validate(config: &Config) -> Result<()> {
    let mut default_count = 0usize;

    for (account_id, account) in &config.accounts {
        if account.minimum_validity_days < 0 {
            return Err(Error::ConfigInvalid(format!(
                "account {account_id}: minimumValidityDays must be non-negative"
            )));
        }

        for (cert_id, cert) in &account.certificates {
            if cert.hostnames.is_empty() {
                return Err(Error::ConfigInvalid(format!(
                    "account {account_id}, certificate {cert_id}: hostnames must not be empty"
                )));
            }
            for hostname in &cert.hostnames {
                if !is_valid_dns_name(hostname) {
                    return Err(Error::ConfigInvalid(format!(
                        "account {account_id}, certificate {cert_id}: {hostname:?} is not a valid DNS name"
                    )));
                }
            }
            if account.enabled && cert.enabled && cert.default_cert {
                default_count += 1;
            }
        }
    }

    if default_count > 1 {
        return Err(Error::ConfigInvalid(format!(
            "at most one certificate may be marked defaultCert across the effective config, found {default_count}"
        )));
    }

    Ok(())
}

/// A conservative DNS name check: non-empty labels of letters, digits, and
/// hyphens (hyphens not leading/trailing a label), joined by dots, with an
/// optional leading `*.` wildcard label.
fn is_valid_dns_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    let mut labels = name.split('.').peekable();
    let Some(first) = labels.next() else { return false };
    let first_ok = first == "*" || is_valid_label(first);
    if !first_ok {
        return false;
    }
    for label in labels {
        if !is_valid_label(label) {
            return false;
        }
    }
    true
}

fn is_valid_label(label: &str) -> bool {
    if label.is_empty() || label.len() > 63 {
        return false;
    }
    let bytes = label.as_bytes();
    let alnum = |b: u8| b.is_ascii_alphanumeric();
    alnum(bytes[0])
        && alnum(bytes[bytes.len() - 1])
        && bytes.iter().all(|&b| alnum(b) || b == b'-')
}

/// One entry of a total diff between an old and new mapping.
#[derive(Debug, Clone)]
pub struct DiffEntry<K, V> {
    pub key: K,
    pub old: Option<V>,
    pub new: Option<V>,
}

/// Diffs two maps by key, yielding one [`DiffEntry`] per key in `old ∪ new`
/// and nothing more.
pub fn map_diff<K, V>(old: &BTreeMap<K, V>, new: &BTreeMap<K, V>) -> Vec<DiffEntry<K, V>>
where
    K: Ord + Clone,
    V: Clone,
{
    let mut keys: std::collections::BTreeSet<K> = old.keys().cloned().collect();
    keys.extend(new.keys().cloned());

    keys.into_iter()
        .map(|key| DiffEntry {
            old: old.get(&key).cloned(),
            new: new.get(&key).cloned(),
            key,
        })
        .collect()
}
