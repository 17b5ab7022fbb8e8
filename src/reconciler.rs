//! Top-level two-phase orchestrator: diffs an old vs. new configuration,
//! runs a fast cached pass across all accounts in parallel, then a
//! sequential authoritative pass that contacts the CA, and schedules the
//! daily renewal check.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::account;
use crate::config::{self, map_diff, Config};
use crate::error::{AggregateError, Result};
use crate::persistence::Persistence;
use crate::store::DynamicCertStore;

/// Invoked when the daily renewal timer fires. Modeled as a plain closure
/// capability rather than a back-reference to the owning controller
/// to avoid a reference cycle back to the owning controller.
pub type RenewalCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct TimerState {
    time: config::RenewalTime,
    handle: tokio::task::JoinHandle<()>,
}

/// Computes the duration from now until the next occurrence of `time`,
/// treating "now" as UTC wall-clock time-of-day. Ignores leap seconds and
/// DST, which is the precision a once-daily renewal check needs.
fn duration_until_next_occurrence(time: config::RenewalTime) -> Duration {
    const SECONDS_PER_DAY: u64 = 86_400;
    let now_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let now_of_day = now_secs % SECONDS_PER_DAY;
    let target = time.seconds_since_midnight() as u64;
    let delta = if target >= now_of_day {
        target - now_of_day
    } else {
        SECONDS_PER_DAY - now_of_day + target
    };
    Duration::from_secs(delta)
}

async fn run_timer_loop(time: config::RenewalTime, callback: RenewalCallback) {
    loop {
        let delay = duration_until_next_occurrence(time);
        info!("next renewal check in {delay:?} (scheduled for {time})");
        tokio::time::sleep(delay).await;
        callback().await;
    }
}

/// The top-level `update(oldConf, newConf)` orchestrator.
pub struct ConfigReconciler {
    store: Arc<DynamicCertStore>,
    persistence: Persistence,
    timer: Mutex<Option<TimerState>>,
}

impl ConfigReconciler {
    pub fn new(store: Arc<DynamicCertStore>, persistence: Persistence) -> Self {
        Self {
            store,
            persistence,
            timer: Mutex::new(None),
        }
    }

    /// Diffs `old` against `new`, runs the cached and authoritative passes,
    /// elects the default alias, and on overall success persists `new` as
    /// the active configuration.
    pub async fn update(&self, old: &Config, new: &Config, on_renewal_due: RenewalCallback) -> Result<()> {
        config::validate(new)?;
        self.reschedule_if_needed(new.renewal_check_time, on_renewal_due);

        let diff = map_diff(&old.accounts, &new.accounts);

        let store = &self.store;
        let persistence = &self.persistence;
        let phase1 = diff.iter().map(|entry| async move {
            let result =
                account::update_cached(store, persistence, &entry.key, entry.old.as_ref(), entry.new.as_ref()).await;
            (entry.key.clone(), result)
        });
        let phase1_results = join_all(phase1).await;

        let mut combined = Vec::with_capacity(diff.len() * 2);
        for (key, result) in phase1_results {
            if let Err(e) = result {
                warn!("account {key}: cached pass failed: {e}");
                combined.push((format!("{key} (cached pass)"), Err(e)));
            }
        }

        // Phase 2 is strictly sequential across accounts:
        // each account's authoritative pass awaits the previous one.
        for entry in &diff {
            let result = account::update_others(
                &self.store,
                &self.persistence,
                &entry.key,
                entry.old.as_ref(),
                entry.new.as_ref(),
            )
            .await;
            if let Err(e) = &result {
                warn!("account {}: authoritative pass failed: {e}", entry.key);
            }
            combined.push((entry.key.clone(), result));
        }

        self.apply_default_alias(new);

        let overall = AggregateError::from_results(combined);
        if overall.is_ok() {
            self.persistence.write_active_config(new).await?;
        }
        overall
    }

    /// Elects the DCS default alias from the unique enabled certificate
    /// marked `defaultCert=true`, or clears it if none exists (validation
    /// already rejects more than one).
    fn apply_default_alias(&self, new: &Config) {
        let default_id = new.accounts.iter().filter(|(_, a)| a.enabled).find_map(|(account_id, a)| {
            a.certificates
                .iter()
                .find(|(_, c)| c.enabled && c.default_cert)
                .map(|(cert_id, _)| format!("{}-{cert_id}", a.db_id(account_id)))
        });
        self.store.set_id_of_default_alias(default_id.as_deref());
    }

    fn reschedule_if_needed(&self, time: config::RenewalTime, callback: RenewalCallback) {
        let mut guard = self.timer.lock();
        let needs_reschedule = !matches!(&*guard, Some(state) if state.time == time);
        if !needs_reschedule {
            return;
        }
        if let Some(previous) = guard.take() {
            previous.handle.abort();
        }
        let handle = tokio::spawn(run_timer_loop(time, callback));
        *guard = Some(TimerState { time, handle });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_occurrence_same_time_of_day_is_almost_a_full_day_away() {
        let now_secs = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        let now_of_day = (now_secs % 86_400) as u32;
        let time = config::RenewalTime::new((now_of_day / 3600) as u8, ((now_of_day / 60) % 60) as u8, (now_of_day % 60) as u8).unwrap();
        let delay = duration_until_next_occurrence(time);
        assert!(delay.as_secs() < 2);
    }

    #[test]
    fn next_occurrence_wraps_to_tomorrow() {
        let time = config::RenewalTime::new(0, 0, 0).unwrap();
        let delay = duration_until_next_occurrence(time);
        assert!(delay.as_secs() <= 86_400);
    }

    #[tokio::test]
    async fn update_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::new(dir.path());
        persistence.init().await.unwrap();
        let store = Arc::new(DynamicCertStore::new());
        let reconciler = ConfigReconciler::new(store, persistence);

        let mut certs = std::collections::BTreeMap::new();
        certs.insert(
            "api".to_string(),
            crate::config::Certificate {
                enabled: true,
                default_cert: false,
                organization: "Org".to_string(),
                hostnames: vec![],
            },
        );
        let mut accounts = std::collections::BTreeMap::new();
        accounts.insert(
            "acc".to_string(),
            crate::config::Account {
                enabled: true,
                provider_url: "acme://example".to_string(),
                accepted_agreement_url: "https://example/tos".to_string(),
                contact_uris: vec![],
                minimum_validity_days: 30,
                certificates: certs,
            },
        );
        let bad = Config {
            renewal_check_time: config::RenewalTime::default(),
            accounts,
        };

        let noop: RenewalCallback = Arc::new(|| Box::pin(async {}));
        let result = reconciler.update(&Config::empty(), &bad, noop).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn update_of_empty_config_persists_and_clears_default() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::new(dir.path());
        persistence.init().await.unwrap();
        let store = Arc::new(DynamicCertStore::new());
        let reconciler = ConfigReconciler::new(store, persistence.clone());

        let noop: RenewalCallback = Arc::new(|| Box::pin(async {}));
        reconciler.update(&Config::empty(), &Config::empty(), noop).await.unwrap();

        let reloaded = persistence.read_active_config().await.unwrap();
        assert_eq!(reloaded, Some(Config::empty()));
    }
}
