//! The Public Controller: `start`, `start(conf)`, `reconfigure(conf)`,
//! `check()`, enforcing the `{NOT_STARTED, UPDATING, OK, FAILED}` lifecycle
//! state machine.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::persistence::Persistence;
use crate::reconciler::{ConfigReconciler, RenewalCallback};
use crate::store::DynamicCertStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NotStarted,
    Updating,
    Ok,
    Failed,
}

struct State {
    phase: Phase,
    cur: Config,
}

/// Owns the adopted `Config`, the Dynamic Certificate Store, and the
/// reconciler; enforces that only one reconcile runs at a time.
///
/// `Config cur` and the lifecycle phase share one `tokio::sync::Mutex`,
/// held across the reconcile itself since reconciliation awaits I/O
/// held across the reconcile itself since reconciliation awaits I/O.
pub struct Controller {
    store: Arc<DynamicCertStore>,
    persistence: Persistence,
    reconciler: ConfigReconciler,
    state: Mutex<State>,
}

impl Controller {
    pub fn new(store: Arc<DynamicCertStore>, persistence: Persistence) -> Arc<Self> {
        Arc::new(Self {
            reconciler: ConfigReconciler::new(Arc::clone(&store), persistence.clone()),
            store,
            persistence,
            state: Mutex::new(State {
                phase: Phase::NotStarted,
                cur: Config::empty(),
            }),
        })
    }

    /// The store this controller keeps in sync; wired into the TLS engine
    /// via its `rustls::server::ResolvesServerCert` implementation.
    pub fn store(&self) -> &Arc<DynamicCertStore> {
        &self.store
    }

    /// The configuration adopted before any configuration has ever been
    /// supplied.
    pub fn empty_conf() -> Config {
        Config::empty()
    }

    /// Loads `active.json` (or an empty config if none exists) and drives a
    /// reconcile of it against itself — a warm restart, re-installing
    /// cached certificates and renewing anything due.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.start_with(None).await
    }

    /// As [`Controller::start`], but adopts `conf` instead of the saved
    /// configuration (a fresh deploy supplying its configuration inline).
    pub async fn start_with(self: &Arc<Self>, conf: Option<Config>) -> Result<()> {
        self.begin(Phase::NotStarted).await?;
        self.persistence.init().await?;
        let saved = self.persistence.read_active_config().await?.unwrap_or_else(Config::empty);
        let target = conf.unwrap_or_else(|| saved.clone());
        self.drive(saved, target).await
    }

    /// Replaces the adopted configuration wholesale, reconciling the old
    /// and new configurations.
    pub async fn reconfigure(self: &Arc<Self>, conf: Config) -> Result<()> {
        let old = self.begin(Phase::Ok).await?;
        self.drive(old, conf).await
    }

    /// Forces a renewal pass by reconciling the current configuration
    /// against itself; also what the daily renewal timer invokes.
    pub async fn check(self: &Arc<Self>) -> Result<()> {
        let old = self.begin(Phase::Ok).await?;
        self.drive(old.clone(), old).await
    }

    /// Transitions from `expected` to `Updating`, returning the config to
    /// reconcile against. Fails with `IllegalState` if the controller isn't
    /// currently in `expected`.
    async fn begin(&self, expected: Phase) -> Result<Config> {
        let mut state = self.state.lock().await;
        if state.phase != expected {
            return Err(Error::IllegalState(format!(
                "cannot transition from {:?}, expected {:?}",
                state.phase, expected
            )));
        }
        state.phase = Phase::Updating;
        Ok(state.cur.clone())
    }

    async fn drive(self: &Arc<Self>, old: Config, new: Config) -> Result<()> {
        let callback = self.renewal_callback();
        let result = self.reconciler.update(&old, &new, callback).await;

        let mut state = self.state.lock().await;
        match &result {
            Ok(()) => {
                state.cur = new;
                state.phase = Phase::Ok;
            }
            Err(_) => {
                state.phase = Phase::Failed;
            }
        }
        result
    }

    /// The closure the reconciler's daily timer invokes. Holds its own
    /// `Arc<Controller>` clone rather than the reconciler holding a
    /// back-reference to the controller, to avoid a reconciler-to-controller
    /// reference cycle.
    fn renewal_callback(self: &Arc<Self>) -> RenewalCallback {
        let this = Arc::clone(self);
        Arc::new(move || {
            let this = Arc::clone(&this);
            Box::pin(async move {
                if let Err(e) = this.check().await {
                    warn!("scheduled renewal check failed: {e}");
                }
            })
        })
    }

    /// The currently adopted configuration.
    pub async fn current_config(&self) -> Config {
        self.state.lock().await.cur.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_controller() -> (Arc<Controller>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DynamicCertStore::new());
        let persistence = Persistence::new(dir.path());
        (Controller::new(store, persistence), dir)
    }

    #[tokio::test]
    async fn first_start_with_no_saved_state_yields_empty_config() {
        let (controller, _dir) = new_controller();
        controller.start().await.unwrap();
        assert_eq!(controller.current_config().await, Config::empty());
    }

    #[tokio::test]
    async fn reconfigure_before_start_is_illegal_state() {
        let (controller, _dir) = new_controller();
        let err = controller.reconfigure(Config::empty()).await.unwrap_err();
        assert!(matches!(err, Error::IllegalState(_)));
    }

    #[tokio::test]
    async fn check_after_start_succeeds_and_stays_ok() {
        let (controller, _dir) = new_controller();
        controller.start().await.unwrap();
        controller.check().await.unwrap();
    }

    #[tokio::test]
    async fn reconfigure_during_updating_is_rejected() {
        let (controller, _dir) = new_controller();
        controller.start().await.unwrap();

        // Simulate a reconcile in flight by forcing the phase directly.
        {
            let mut state = controller.state.lock().await;
            state.phase = Phase::Updating;
        }
        let err = controller.reconfigure(Config::empty()).await.unwrap_err();
        assert!(matches!(err, Error::IllegalState(_)));
    }
}
