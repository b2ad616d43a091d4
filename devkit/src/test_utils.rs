/*!
Test Harness pour le kernel de flotte

Assemble un kernel complet autour des doubles de test :
- store en mémoire avec pannes injectables
- prober scripté, SSH simulé, horloge fixe
- notifier enregistreur pour vérifier les événements publiés
*/

use fleet_kernel::config_ops::{ConfigOps, ConfigOpsSettings};
use fleet_kernel::health::HealthTracker;
use fleet_kernel::http::{build_router, AppState};
use fleet_kernel::models::{Host, HostStatus, HostStatusEvent};
use fleet_kernel::store::{EventQuery, HostRecordStore};
use fleet_kernel::sweep::{SweepCoordinator, SweepSettings};
use std::sync::Arc;
use std::time::Duration;
use anyhow::Result;

use crate::fixtures::FixedClock;
use crate::notifier_stub::RecordingNotifier;
use crate::prober_stub::ScriptedProber;
use crate::remote_stub::MockRemoteExecutor;
use crate::store_stub::FlakyStore;

pub const TEST_API_KEY: &str = "devkit-api-key";

pub struct FleetHarness {
    pub store: FlakyStore,
    pub prober: ScriptedProber,
    pub remote: MockRemoteExecutor,
    pub clock: FixedClock,
    pub notifier: RecordingNotifier,
    pub health: HealthTracker,
    pub sweeper: Arc<SweepCoordinator>,
    pub config_ops: Arc<ConfigOps>,
}

impl FleetHarness {
    pub fn new() -> Self {
        Self::with_settings(SweepSettings::default())
    }

    pub fn with_settings(settings: SweepSettings) -> Self {
        init_tracing();

        let store = FlakyStore::new();
        let prober = ScriptedProber::new();
        let remote = MockRemoteExecutor::new();
        let clock = FixedClock::default();

        let sweeper = SweepCoordinator::new(
            Arc::new(store.clone()),
            Arc::new(prober.clone()),
            Arc::new(clock.clone()),
            settings,
        );
        let config_ops = ConfigOps::new(
            Arc::new(store.clone()),
            Arc::new(remote.clone()),
            Arc::new(clock.clone()),
            ConfigOpsSettings::default(),
        );

        Self {
            store,
            prober,
            remote,
            clock,
            notifier: RecordingNotifier::default(),
            health: HealthTracker::new(),
            sweeper: Arc::new(sweeper),
            config_ops: Arc::new(config_ops),
        }
    }

    pub async fn add_host(&self, host: Host) -> Result<()> {
        self.store.upsert_host(host).await?;
        Ok(())
    }

    pub async fn status_of(&self, name: &str) -> Result<HostStatus> {
        Ok(self.store.get_host(name).await?.status)
    }

    /// Every logged event, newest first.
    pub async fn events(&self) -> Result<Vec<HostStatusEvent>> {
        Ok(self.store.list_events(&EventQuery::default()).await?)
    }

    /// Admin router wired to the harness doubles, keyed with [`TEST_API_KEY`].
    pub fn router(&self) -> axum::Router {
        build_router(AppState {
            store: Arc::new(self.store.clone()),
            sweeper: self.sweeper.clone(),
            config_ops: self.config_ops.clone(),
            health_tracker: self.health.clone(),
            notifier: Arc::new(self.notifier.clone()),
            clock: Arc::new(self.clock.clone()),
            api_key: Some(TEST_API_KEY.to_string()),
        })
    }

    pub fn assert_published(&self, topic: &str) -> Result<serde_json::Value> {
        match self.notifier.get_last_json_message(topic)? {
            Some(message) => Ok(message),
            None => anyhow::bail!(
                "nothing published on {} (got: {:?})",
                topic,
                self.notifier
                    .get_published_messages()
                    .iter()
                    .map(|m| m.topic.as_str())
                    .collect::<Vec<_>>()
            ),
        }
    }

    /// Attend qu'un message soit publié sur un topic (tâches de fond)
    pub async fn wait_for_message(&self, topic: &str, timeout_ms: u64) -> Result<Option<serde_json::Value>> {
        let start = std::time::Instant::now();
        while start.elapsed() < Duration::from_millis(timeout_ms) {
            if let Some(message) = self.notifier.get_last_json_message(topic)? {
                return Ok(Some(message));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tracing::warn!("[harness] timeout waiting for message on {}", topic);
        Ok(None)
    }

    /// No remote session left open.
    pub fn assert_sessions_closed(&self) -> Result<()> {
        let open = self.remote.open_sessions();
        if open != 0 {
            anyhow::bail!("{} remote session(s) still open", open);
        }
        Ok(())
    }
}

impl Default for FleetHarness {
    fn default() -> Self {
        Self::new()
    }
}

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("fleet_kernel=debug")),
        )
        .try_init()
        .ok();
}

/// Macro pour écrire un scénario sur un harness neuf
#[macro_export]
macro_rules! fleet_test {
    ($name:ident, |$harness:ident| $body:block) => {
        #[tokio::test]
        async fn $name() -> anyhow::Result<()> {
            let $harness = $crate::test_utils::FleetHarness::new();
            $body
            Ok(())
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::HostBuilder;

    #[tokio::test]
    async fn test_harness_wires_the_same_doubles() {
        let harness = FleetHarness::new();
        harness.add_host(HostBuilder::new("web-01").build()).await.unwrap();
        harness.prober.up("web-01");

        let report = harness.sweeper.sweep().await;
        assert_eq!(report.checked, 1);
        assert_eq!(harness.status_of("web-01").await.unwrap(), HostStatus::Active);
        assert_eq!(harness.prober.calls(), vec!["web-01".to_string()]);
        assert_eq!(harness.store.commit_count(), 1);
        assert!(harness.assert_sessions_closed().is_ok());
    }

    fleet_test!(test_macro_builds_a_harness, |harness| {
        assert!(harness.events().await?.is_empty());
        assert!(harness.assert_published("fleet/sweep_completed@v1").is_err());
    });
}
