/**
 * FLEET SWEEP - Vérification périodique de tous les hôtes surveillés
 *
 * ROLE :
 * Une passe complète : liste les hôtes (statut != Disabled), lance un probe
 * par hôte sur un pool borné, draine les résultats dans l'ordre d'arrivée,
 * réconcilie chaque résultat et commit toutes les écritures en une fois.
 *
 * FONCTIONNEMENT :
 * - Phase parallèle : JoinSet + Semaphore (largeur `workers`), plafond
 *   `task_ceiling` par tâche compté à partir de l'obtention du slot
 * - Phase séquentielle : reconcile + staging dans le WriteBatch, sur la
 *   tâche du sweep uniquement (aucun verrou sur la logique de décision)
 * - Commit : un seul commit_batch ; en cas d'échec rien n'est appliqué
 *
 * Un hôte en erreur (prober en échec, panic, plafond dépassé) passe en
 * Unknown sans bloquer les autres. Le sweep ne remonte jamais d'erreur.
 */

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::{FleetError, StoreError};
use crate::models::{HostStatus, HostStatusEvent, HostSummary, ProbeResult};
use crate::probe::{Prober, ProbeTarget};
use crate::reconcile::{reconcile, ReconcileDecision};
use crate::store::{HostRecordStore, WriteBatch};

pub const MONITORING_SOURCE: &str = "Realtime monitoring";

#[derive(Debug, Clone)]
pub struct SweepSettings {
    pub workers: usize,
    pub task_ceiling: Duration,
    pub source: String,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            workers: 20,
            task_ceiling: Duration::from_secs(15),
            source: MONITORING_SOURCE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SweepOutcome {
    Committed,
    NothingToCheck,
    LoadFailed { reason: String },
    CommitFailed { reason: String },
}

/// A logged status change. Only reported once its batch is committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusTransition {
    pub host: String,
    pub old_status: HostStatus,
    pub new_status: HostStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub checked: usize,
    pub changed: usize,
    pub logged: usize,
    pub errored: usize,
    pub elapsed_ms: u64,
    pub outcome: SweepOutcome,
    pub transitions: Vec<StatusTransition>,
}

impl SweepReport {
    fn empty(outcome: SweepOutcome) -> Self {
        Self {
            checked: 0,
            changed: 0,
            logged: 0,
            errored: 0,
            elapsed_ms: 0,
            outcome,
            transitions: Vec::new(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self.outcome,
            SweepOutcome::LoadFailed { .. } | SweepOutcome::CommitFailed { .. }
        )
    }
}

/// Why a probe task produced no result for its host.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeTaskError {
    #[error("probe failed: {0}")]
    Failed(String),
    #[error("probe task panicked: {0}")]
    Panicked(String),
    #[error("probe task exceeded its {0:?} ceiling")]
    DeadlineExceeded(Duration),
    #[error("worker pool closed")]
    PoolClosed,
}

/// Result of an on-demand single host check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostCheck {
    pub host: String,
    pub previous_status: HostStatus,
    pub status: HostStatus,
    pub response_time_ms: Option<f64>,
    pub logged: bool,
    pub error: Option<String>,
}

pub struct SweepCoordinator {
    store: Arc<dyn HostRecordStore>,
    prober: Arc<dyn Prober>,
    clock: Arc<dyn Clock>,
    settings: SweepSettings,
}

#[derive(Default)]
struct Tally {
    checked: usize,
    changed: usize,
    logged: usize,
    errored: usize,
    transitions: Vec<StatusTransition>,
}

impl SweepCoordinator {
    pub fn new(
        store: Arc<dyn HostRecordStore>,
        prober: Arc<dyn Prober>,
        clock: Arc<dyn Clock>,
        settings: SweepSettings,
    ) -> Self {
        Self {
            store,
            prober,
            clock,
            settings,
        }
    }

    pub async fn sweep(&self) -> SweepReport {
        let started = Instant::now();

        let hosts = match self.store.list_monitorable().await {
            Ok(hosts) => hosts,
            Err(e) => {
                error!("[sweep] could not list monitorable hosts: {}", e);
                return SweepReport::empty(SweepOutcome::LoadFailed { reason: e.to_string() });
            }
        };
        if hosts.is_empty() {
            info!("[sweep] no hosts found for monitoring");
            return SweepReport::empty(SweepOutcome::NothingToCheck);
        }

        info!("[sweep] monitoring {} hosts with {} workers", hosts.len(), self.settings.workers);

        let limiter = Arc::new(Semaphore::new(self.settings.workers.max(1)));
        let mut pending: HashSet<String> = HashSet::with_capacity(hosts.len());
        let mut tasks = JoinSet::new();
        for host in hosts.iter().cloned() {
            pending.insert(host.name.clone());
            tasks.spawn(run_probe_task(
                host,
                self.prober.clone(),
                self.clock.clone(),
                limiter.clone(),
                self.settings.task_ceiling,
            ));
        }

        let mut batch = WriteBatch::new();
        let mut tally = Tally::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((host, outcome)) => {
                    pending.remove(&host.name);
                    self.stage(&host, outcome, &mut batch, &mut tally);
                }
                Err(e) => error!("[sweep] probe task lost: {}", e),
            }
        }

        // hosts whose task never reported back
        for host in hosts.iter().filter(|h| pending.contains(&h.name)) {
            self.stage(host, Err(ProbeTaskError::PoolClosed), &mut batch, &mut tally);
        }

        let writes = batch.len();
        let outcome = match self.store.commit_batch(batch).await {
            Ok(()) => {
                info!(
                    "[sweep] committed {} writes for {} hosts ({} changed, {} errored)",
                    writes, tally.checked, tally.changed, tally.errored
                );
                SweepOutcome::Committed
            }
            Err(e) => {
                error!("[sweep] commit failed, discarding {} writes: {}", writes, e);
                tally.transitions.clear();
                SweepOutcome::CommitFailed { reason: e.to_string() }
            }
        };

        SweepReport {
            checked: tally.checked,
            changed: tally.changed,
            logged: tally.logged,
            errored: tally.errored,
            elapsed_ms: started.elapsed().as_millis() as u64,
            outcome,
            transitions: tally.transitions,
        }
    }

    /// Checks one host right away and commits its writes on their own.
    pub async fn check_host(&self, name: &str) -> Result<HostCheck, FleetError> {
        let host = match self.store.get_host(name).await {
            Ok(host) => host.summary(),
            Err(StoreError::UnknownHost(_)) => return Err(FleetError::NotFound(format!("host '{name}'"))),
            Err(e) => return Err(e.into()),
        };
        if !host.status.is_monitorable() {
            return Err(FleetError::validation("status", format!("host '{name}' is disabled")));
        }

        let limiter = Arc::new(Semaphore::new(1));
        let (host, outcome) = run_probe_task(
            host,
            self.prober.clone(),
            self.clock.clone(),
            limiter,
            self.settings.task_ceiling,
        )
        .await;

        let mut check = HostCheck {
            host: host.name.clone(),
            previous_status: host.status,
            status: HostStatus::Unknown,
            response_time_ms: None,
            logged: false,
            error: None,
        };
        match &outcome {
            Ok(result) => {
                let decision = reconcile(Some(host.status), result);
                check.status = decision.new_status;
                check.response_time_ms = Some(result.latency_ms);
                check.logged = decision.must_log;
            }
            Err(e) => check.error = Some(e.to_string()),
        }

        let mut batch = WriteBatch::new();
        let mut tally = Tally::default();
        self.stage(&host, outcome, &mut batch, &mut tally);
        self.store.commit_batch(batch).await?;
        Ok(check)
    }

    /// Sequential part: turns one task result into staged writes.
    fn stage(
        &self,
        host: &HostSummary,
        outcome: Result<ProbeResult, ProbeTaskError>,
        batch: &mut WriteBatch,
        tally: &mut Tally,
    ) {
        tally.checked += 1;

        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                warn!("[sweep] {}: check failed ({}) -> Unknown", host.name, e);
                batch.set_status(&host.name, HostStatus::Unknown, self.clock.now());
                tally.errored += 1;
                return;
            }
        };

        let decision = reconcile(Some(host.status), &result);
        self.apply_decision(host, &result, &decision, batch);

        if decision.must_persist_status {
            tally.changed += 1;
        }
        if decision.must_log {
            tally.logged += 1;
            tally.transitions.push(StatusTransition {
                host: host.name.clone(),
                old_status: host.status,
                new_status: decision.new_status,
                at: result.checked_at,
            });
            info!(
                "[sweep] {}: status changed {} -> {} ({:.2}ms)",
                host.name, host.status, decision.new_status, result.latency_ms
            );
        } else if decision.must_persist_status {
            info!("[sweep] {}: status set to {} ({:.2}ms)", host.name, decision.new_status, result.latency_ms);
        } else {
            debug!("[sweep] {}: status unchanged {} ({:.2}ms)", host.name, decision.new_status, result.latency_ms);
        }
    }

    fn apply_decision(
        &self,
        host: &HostSummary,
        result: &ProbeResult,
        decision: &ReconcileDecision,
        batch: &mut WriteBatch,
    ) {
        if !decision.must_persist_status {
            batch.touch(&host.name, result.checked_at);
            return;
        }
        batch.set_status(&host.name, decision.new_status, result.checked_at);
        if decision.must_log {
            batch.insert_event(HostStatusEvent::status_change(
                &host.name,
                host.status,
                decision.new_status,
                result.latency_ms,
                Some(result.checked_at),
                &self.settings.source,
            ));
        }
    }
}

/// Parallel part: waits for a worker slot, then probes under the ceiling.
/// The probe runs in its own task so a panic is caught as a `JoinError`.
async fn run_probe_task(
    host: HostSummary,
    prober: Arc<dyn Prober>,
    clock: Arc<dyn Clock>,
    limiter: Arc<Semaphore>,
    ceiling: Duration,
) -> (HostSummary, Result<ProbeResult, ProbeTaskError>) {
    let Ok(_permit) = limiter.acquire_owned().await else {
        return (host, Err(ProbeTaskError::PoolClosed));
    };

    let target = ProbeTarget::from(&host);
    let mut handle = tokio::spawn(async move { prober.probe(&target).await });

    let outcome = match tokio::time::timeout(ceiling, &mut handle).await {
        Ok(Ok(Ok(probe))) => Ok(ProbeResult {
            host: host.name.clone(),
            reachable: probe.reachable,
            latency_ms: probe.latency_ms,
            checked_at: clock.now(),
        }),
        Ok(Ok(Err(e))) => Err(ProbeTaskError::Failed(format!("{e:#}"))),
        Ok(Err(join)) => Err(ProbeTaskError::Panicked(join.to_string())),
        Err(_) => {
            handle.abort();
            Err(ProbeTaskError::DeadlineExceeded(ceiling))
        }
    };
    (host, outcome)
}
