//! Status reconciliation: fresh probe result + recorded status -> what to write.
//!
//! Two separate decisions come out of a reconcile. Persisting the status is
//! needed whenever it changed or the prior one was `Unknown`; logging an event
//! only when a known status changed. Everything else is a timestamp touch.

use serde::Serialize;

use crate::models::{HostStatus, ProbeResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconcileDecision {
    pub new_status: HostStatus,
    pub must_persist_status: bool,
    pub must_log: bool,
}

impl ReconcileDecision {
    pub fn is_touch_only(&self) -> bool {
        !self.must_persist_status
    }
}

/// `prior = None` means the recorded status is not known and counts as `Unknown`.
pub fn reconcile(prior: Option<HostStatus>, probe: &ProbeResult) -> ReconcileDecision {
    let prior = prior.unwrap_or(HostStatus::Unknown);
    let new_status = if probe.reachable {
        HostStatus::Active
    } else {
        HostStatus::Down
    };
    let changed = new_status != prior;
    let prior_known = prior != HostStatus::Unknown;

    ReconcileDecision {
        new_status,
        must_persist_status: changed || !prior_known,
        must_log: changed && prior_known,
    }
}
