/*!
Prober scripté : comportement choisi par hôte, sans réseau.
*/

use async_trait::async_trait;
use fleet_kernel::probe::{ProbeOutcome, ProbeTarget, Prober};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum ProbeBehaviour {
    Up { latency_ms: f64 },
    Down,
    /// The prober itself returns an error.
    Fail(String),
    /// Never answers; only the task ceiling ends it.
    Hang,
    Panic,
    /// Answers up after a delay.
    Slow(Duration),
}

#[derive(Clone, Default)]
pub struct ScriptedProber {
    behaviours: Arc<Mutex<HashMap<String, ProbeBehaviour>>>,
    calls: Arc<Mutex<Vec<String>>>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

/// Counts a probe as in flight until dropped, aborted probes included.
struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, host: &str, behaviour: ProbeBehaviour) -> &Self {
        self.behaviours.lock().insert(host.to_string(), behaviour);
        self
    }

    pub fn up(&self, host: &str) -> &Self {
        self.set(host, ProbeBehaviour::Up { latency_ms: 2.5 })
    }

    pub fn down(&self, host: &str) -> &Self {
        self.set(host, ProbeBehaviour::Down)
    }

    /// Hosts probed so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Highest number of probes seen running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(&self, target: &ProbeTarget) -> anyhow::Result<ProbeOutcome> {
        self.calls.lock().push(target.host.clone());
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        let _in_flight = InFlight(self.in_flight.clone());

        // unscripted hosts look unreachable
        let behaviour = self
            .behaviours
            .lock()
            .get(&target.host)
            .cloned()
            .unwrap_or(ProbeBehaviour::Down);

        match behaviour {
            ProbeBehaviour::Up { latency_ms } => Ok(ProbeOutcome {
                reachable: true,
                latency_ms,
            }),
            ProbeBehaviour::Down => Ok(ProbeOutcome {
                reachable: false,
                latency_ms: 0.0,
            }),
            ProbeBehaviour::Fail(reason) => anyhow::bail!(reason),
            ProbeBehaviour::Hang => std::future::pending().await,
            ProbeBehaviour::Panic => panic!("scripted probe panic for {}", target.host),
            ProbeBehaviour::Slow(delay) => {
                tokio::time::sleep(delay).await;
                Ok(ProbeOutcome {
                    reachable: true,
                    latency_ms: delay.as_secs_f64() * 1000.0,
                })
            }
        }
    }
}
