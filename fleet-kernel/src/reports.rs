//! Read-side views over the host records and the status event log.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use time::{Duration, OffsetDateTime};

use crate::clock::{checked_days_before, Clock};
use crate::error::{FleetError, StoreError};
use crate::models::{EventType, HostStatusEvent, HostSummary};
use crate::store::{EventQuery, HostRecordStore};

pub const HOST_LOGS_LIMIT: usize = 50;
pub const RECENT_CHANGES_DAYS: i64 = 7;
const REALTIME_WINDOW: Duration = Duration::hours(1);
const REALTIME_CHANGES_LIMIT: usize = 20;
const TOP_HOSTS: usize = 10;

#[derive(Debug, Clone, Serialize)]
pub struct RealtimeStatus {
    pub hosts: Vec<HostSummary>,
    pub recent_changes: Vec<HostStatusEvent>,
    pub status_counts: BTreeMap<String, usize>,
    pub total_hosts: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountEntry {
    pub key: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogStatistics {
    pub total_logs: usize,
    pub recent_activity: usize,
    pub event_types: Vec<CountEntry>,
    pub top_hosts: Vec<CountEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyReport {
    #[serde(with = "time::serde::rfc3339")]
    pub since: OffsetDateTime,
    pub total_changes: usize,
    pub hosts: BTreeMap<String, Vec<HostStatusEvent>>,
}

/// Dashboard view: every host, the last hour of changes and per-status counts.
pub async fn realtime_status(store: &dyn HostRecordStore, clock: &dyn Clock) -> Result<RealtimeStatus, StoreError> {
    let now = clock.now();
    let mut hosts = store.list_hosts().await?;
    hosts.sort_by(|a, b| a.hostname.cmp(&b.hostname).then_with(|| a.name.cmp(&b.name)));

    let recent_changes = store
        .list_events(
            &EventQuery::default()
                .of_type(EventType::StatusChange)
                .since(now - REALTIME_WINDOW)
                .limit(REALTIME_CHANGES_LIMIT),
        )
        .await?;

    let mut status_counts = BTreeMap::new();
    for host in &hosts {
        *status_counts.entry(host.status.as_str().to_string()).or_insert(0) += 1;
    }

    Ok(RealtimeStatus {
        total_hosts: hosts.len(),
        hosts,
        recent_changes,
        status_counts,
        timestamp: now,
    })
}

pub async fn host_logs(
    store: &dyn HostRecordStore,
    host: &str,
    limit: Option<usize>,
) -> Result<Vec<HostStatusEvent>, StoreError> {
    // unknown host -> UnknownHost rather than an empty list
    store.get_host(host).await?;
    store
        .list_events(&EventQuery::default().for_host(host).limit(limit.unwrap_or(HOST_LOGS_LIMIT)))
        .await
}

pub async fn recent_status_changes(
    store: &dyn HostRecordStore,
    clock: &dyn Clock,
    days: Option<i64>,
) -> Result<Vec<HostStatusEvent>, FleetError> {
    let days = days.unwrap_or(RECENT_CHANGES_DAYS);
    let since = checked_days_before(clock.now(), days)
        .ok_or_else(|| FleetError::validation("days", format!("{days} days reaches past the calendar")))?;
    Ok(store
        .list_events(&EventQuery::default().of_type(EventType::StatusChange).since(since))
        .await?)
}

pub async fn log_statistics(store: &dyn HostRecordStore, clock: &dyn Clock) -> Result<LogStatistics, StoreError> {
    let events = store.list_events(&EventQuery::default()).await?;
    let yesterday = clock.now() - Duration::hours(24);

    let mut by_type: HashMap<&str, usize> = HashMap::new();
    let mut by_host: HashMap<&str, usize> = HashMap::new();
    for event in &events {
        *by_type.entry(event.event_type.as_str()).or_insert(0) += 1;
        *by_host.entry(event.host.as_str()).or_insert(0) += 1;
    }

    let mut top_hosts = ranked(by_host);
    top_hosts.truncate(TOP_HOSTS);

    Ok(LogStatistics {
        total_logs: events.len(),
        recent_activity: events.iter().filter(|e| e.timestamp >= yesterday).count(),
        event_types: ranked(by_type),
        top_hosts,
    })
}

/// Status changes from the last 24 hours, grouped per host (oldest first).
pub async fn daily_report(store: &dyn HostRecordStore, clock: &dyn Clock) -> Result<DailyReport, StoreError> {
    let since = clock.now() - Duration::hours(24);
    let events = store
        .list_events(
            &EventQuery::default()
                .of_type(EventType::StatusChange)
                .since(since)
                .order(crate::store::EventOrder::OldestFirst),
        )
        .await?;

    let total_changes = events.len();
    let mut hosts: BTreeMap<String, Vec<HostStatusEvent>> = BTreeMap::new();
    for event in events {
        hosts.entry(event.host.clone()).or_default().push(event);
    }

    Ok(DailyReport {
        since,
        total_changes,
        hosts,
    })
}

/// Count descending, then key ascending.
fn ranked(counts: HashMap<&str, usize>) -> Vec<CountEntry> {
    let mut entries: Vec<CountEntry> = counts
        .into_iter()
        .map(|(key, count)| CountEntry {
            key: key.to_string(),
            count,
        })
        .collect();
    entries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
    entries
}
