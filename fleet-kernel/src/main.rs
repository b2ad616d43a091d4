/**
 * FLEET KERNEL - Point d'entrée du serveur de supervision Telegraf
 *
 * RÔLE : Orchestration des modules : config, store, sweep périodique,
 * rétention, notifications MQTT, API HTTP d'administration.
 *
 * ARCHITECTURE : sweep de joignabilité toutes les `interval_secs` + API REST
 * pour la config Telegraf et le pilotage du service via SSH.
 */

use anyhow::Context;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fleet_kernel::clock::{Clock, SystemClock};
use fleet_kernel::config::{load_config, seed_hosts};
use fleet_kernel::config_ops::ConfigOps;
use fleet_kernel::health::HealthTracker;
use fleet_kernel::http::{build_router, AppState};
use fleet_kernel::notify::{publish_sweep, EventNotifier, MqttNotifier, NoopNotifier};
use fleet_kernel::probe::TcpProber;
use fleet_kernel::retention::spawn_retention_task;
use fleet_kernel::ssh::OpenSshExecutor;
use fleet_kernel::store::{HostRecordStore, JsonStore};
use fleet_kernel::sweep::SweepCoordinator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fleet_kernel=info")))
        .init();

    let cfg = load_config().await;

    // store + hôtes déclarés
    let store: Arc<dyn HostRecordStore> = Arc::new(
        JsonStore::open(&cfg.store.path)
            .await
            .with_context(|| format!("cannot open store {}", cfg.store.path))?,
    );
    let seeded = seed_hosts(store.as_ref(), &cfg.hosts).await;
    info!("[kernel] {} hosts declared in config", seeded);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let health_tracker = HealthTracker::new();

    let notifier: Arc<dyn EventNotifier> = match &cfg.mqtt {
        Some(mqtt) => Arc::new(MqttNotifier::spawn(mqtt, health_tracker.clone())),
        None => {
            info!("[kernel] no MQTT broker configured, notifications disabled");
            Arc::new(NoopNotifier)
        }
    };

    let sweeper = Arc::new(SweepCoordinator::new(
        store.clone(),
        Arc::new(TcpProber::new(cfg.monitor.probe_timeout())),
        clock.clone(),
        cfg.monitor.sweep_settings(),
    ));
    let config_ops = Arc::new(ConfigOps::new(
        store.clone(),
        Arc::new(OpenSshExecutor::new(cfg.ssh.ssh_settings())),
        clock.clone(),
        cfg.config_ops_settings(),
    ));

    // sweep périodique
    {
        let sweeper = sweeper.clone();
        let health = health_tracker.clone();
        let notifier = notifier.clone();
        let mut ticker = tokio::time::interval(cfg.monitor.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                let report = sweeper.sweep().await;
                health.record_sweep(&report);
                publish_sweep(notifier.as_ref(), &report).await;
            }
        });
    }

    // purge des événements expirés
    spawn_retention_task(
        store.clone(),
        clock.clone(),
        cfg.retention.max_age_days,
        std::time::Duration::from_secs(cfg.retention.interval_secs.max(1)),
    );

    let app_state = AppState {
        store,
        sweeper,
        config_ops,
        health_tracker,
        notifier,
        clock,
        api_key: std::env::var("FLEET_API_KEY").ok(),
    };
    if app_state.api_key.is_none() {
        error!("[kernel] FLEET_API_KEY not set, only /health will answer");
    }

    let app = build_router(app_state);
    let listener = TcpListener::bind(&cfg.http.bind)
        .await
        .with_context(|| format!("cannot bind {}", cfg.http.bind))?;
    info!("[kernel] listening on http://{}", cfg.http.bind);
    axum::serve(listener, app).await.context("http server stopped")?;
    Ok(())
}
