/**
 * HOST RECORD STORE - Persistance des hôtes et du journal de statut
 *
 * ROLE :
 * Interface unique vers les deux tables logiques du système : Hosts (une
 * ligne par hôte, statut + horodatage mutables) et HostStatusEvents
 * (append-mostly, ordonné dans le temps, purgé par ancienneté).
 *
 * FONCTIONNEMENT :
 * - HostRecordStore = trait consommé par le sweep, les config ops et l'API
 * - WriteBatch = écritures bufferisées d'un sweep, appliquées en une seule fois
 * - EventQuery = filtres (hôte, type, fenêtre temporelle) + tri + limite
 * - JsonStore = implémentation fichier JSON (NamedTempFile + fsync + persist)
 *
 * ATOMICITÉ :
 * commit_batch applique toutes les écritures sur une copie du snapshot,
 * persiste la copie, puis la publie. Une écriture invalide ou une erreur IO
 * laisse l'état précédent intact.
 */

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::models::{EventType, Host, HostStatus, HostStatusEvent, HostSummary, SecretRef};

#[derive(Debug, Clone, PartialEq)]
pub enum HostWrite {
    SetStatus {
        host: String,
        status: HostStatus,
        at: OffsetDateTime,
    },
    Touch {
        host: String,
        at: OffsetDateTime,
    },
    InsertEvent(HostStatusEvent),
}

/// Writes staged by one sweep pass, committed as a unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    writes: Vec<HostWrite>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&mut self, host: &str, status: HostStatus, at: OffsetDateTime) {
        self.writes.push(HostWrite::SetStatus {
            host: host.to_string(),
            status,
            at,
        });
    }

    pub fn touch(&mut self, host: &str, at: OffsetDateTime) {
        self.writes.push(HostWrite::Touch {
            host: host.to_string(),
            at,
        });
    }

    pub fn insert_event(&mut self, event: HostStatusEvent) {
        self.writes.push(HostWrite::InsertEvent(event));
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn into_writes(self) -> Vec<HostWrite> {
        self.writes
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventQuery {
    pub host: Option<String>,
    pub event_type: Option<EventType>,
    /// Inclusive lower bound.
    pub since: Option<OffsetDateTime>,
    /// Exclusive upper bound.
    pub before: Option<OffsetDateTime>,
    pub order: EventOrder,
    pub limit: Option<usize>,
}

impl EventQuery {
    pub fn for_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn of_type(mut self, event_type: EventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn since(mut self, since: OffsetDateTime) -> Self {
        self.since = Some(since);
        self
    }

    pub fn before(mut self, before: OffsetDateTime) -> Self {
        self.before = Some(before);
        self
    }

    pub fn order(mut self, order: EventOrder) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, event: &HostStatusEvent) -> bool {
        if let Some(host) = &self.host {
            if &event.host != host {
                return false;
            }
        }
        if let Some(event_type) = self.event_type {
            if event.event_type != event_type {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.timestamp < since {
                return false;
            }
        }
        if let Some(before) = self.before {
            if event.timestamp >= before {
                return false;
            }
        }
        true
    }
}

#[async_trait]
pub trait HostRecordStore: Send + Sync {
    async fn list_hosts(&self) -> Result<Vec<HostSummary>, StoreError>;

    /// Hosts a sweep should check (everything but `Disabled`).
    async fn list_monitorable(&self) -> Result<Vec<HostSummary>, StoreError> {
        let hosts = self.list_hosts().await?;
        Ok(hosts.into_iter().filter(|h| h.status.is_monitorable()).collect())
    }

    async fn get_host(&self, name: &str) -> Result<Host, StoreError>;

    async fn upsert_host(&self, host: Host) -> Result<(), StoreError>;

    /// All writes succeed or none do.
    async fn commit_batch(&self, batch: WriteBatch) -> Result<(), StoreError>;

    async fn set_status(&self, host: &str, status: HostStatus, at: OffsetDateTime) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        batch.set_status(host, status, at);
        self.commit_batch(batch).await
    }

    async fn set_timestamp(&self, host: &str, at: OffsetDateTime) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        batch.touch(host, at);
        self.commit_batch(batch).await
    }

    async fn insert_event(&self, event: HostStatusEvent) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        batch.insert_event(event);
        self.commit_batch(batch).await
    }

    async fn list_events(&self, query: &EventQuery) -> Result<Vec<HostStatusEvent>, StoreError>;

    /// Returns the number of events removed.
    async fn delete_events(&self, older_than: OffsetDateTime) -> Result<usize, StoreError>;

    async fn resolve_secret(&self, handle: &SecretRef) -> Result<String, StoreError> {
        resolve_secret_handle(handle).await
    }
}

/// `env:NAME`, `file:/path`, or an inline literal.
pub async fn resolve_secret_handle(handle: &SecretRef) -> Result<String, StoreError> {
    let raw = handle.0.trim();
    let value = if let Some(var) = raw.strip_prefix("env:") {
        std::env::var(var).map_err(|_| StoreError::SecretUnavailable(raw.to_string()))?
    } else if let Some(path) = raw.strip_prefix("file:") {
        tokio::fs::read_to_string(path)
            .await
            .map_err(|_| StoreError::SecretUnavailable(raw.to_string()))?
    } else {
        raw.to_string()
    };

    let value = value.trim_end_matches(['\r', '\n']).to_string();
    if value.is_empty() {
        return Err(StoreError::SecretUnavailable(raw.to_string()));
    }
    Ok(value)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreSnapshot {
    hosts: BTreeMap<String, Host>,
    events: Vec<HostStatusEvent>,
}

impl StoreSnapshot {
    fn apply(&mut self, write: HostWrite) -> Result<(), StoreError> {
        match write {
            HostWrite::SetStatus { host, status, at } => {
                let record = self.hosts.get_mut(&host).ok_or(StoreError::UnknownHost(host))?;
                record.status = status;
                record.last_status_check = Some(at);
            }
            HostWrite::Touch { host, at } => {
                let record = self.hosts.get_mut(&host).ok_or(StoreError::UnknownHost(host))?;
                record.last_status_check = Some(at);
            }
            HostWrite::InsertEvent(event) => {
                if !self.hosts.contains_key(&event.host) {
                    return Err(StoreError::UnknownHost(event.host));
                }
                self.events.push(event);
            }
        }
        Ok(())
    }
}

/// JSON-file backed store. `in_memory()` skips the file entirely.
pub struct JsonStore {
    path: Option<PathBuf>,
    data: RwLock<StoreSnapshot>,
}

impl JsonStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: RwLock::new(StoreSnapshot::default()),
        }
    }

    /// Loads the store file, starting fresh if it does not exist yet.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let snapshot = if path.exists() {
            let content = tokio::fs::read_to_string(&path).await?;
            if content.trim().is_empty() {
                StoreSnapshot::default()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            info!("[store] no existing store at {}, starting fresh", path.display());
            StoreSnapshot::default()
        };

        info!(
            "[store] loaded {} hosts and {} events from {}",
            snapshot.hosts.len(),
            snapshot.events.len(),
            path.display()
        );

        Ok(Self {
            path: Some(path),
            data: RwLock::new(snapshot),
        })
    }

    async fn persist(&self, snapshot: &StoreSnapshot) -> Result<(), StoreError> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        let content = serde_json::to_vec_pretty(snapshot)?;
        tokio::task::spawn_blocking(move || write_atomically(&path, &content))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
    }
}

/// Unique temp file next to the target, synced, then renamed over it.
fn write_atomically(path: &Path, content: &[u8]) -> Result<(), StoreError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
    Ok(())
}

#[async_trait]
impl HostRecordStore for JsonStore {
    async fn list_hosts(&self) -> Result<Vec<HostSummary>, StoreError> {
        let data = self.data.read().await;
        Ok(data.hosts.values().map(Host::summary).collect())
    }

    async fn get_host(&self, name: &str) -> Result<Host, StoreError> {
        let data = self.data.read().await;
        data.hosts
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::UnknownHost(name.to_string()))
    }

    async fn upsert_host(&self, host: Host) -> Result<(), StoreError> {
        let mut data = self.data.write().await;
        let mut next = data.clone();
        next.hosts.insert(host.name.clone(), host);
        self.persist(&next).await?;
        *data = next;
        Ok(())
    }

    async fn commit_batch(&self, batch: WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let count = batch.len();

        // write guard held across apply + persist: commits never interleave
        let mut data = self.data.write().await;
        let mut next = data.clone();
        for write in batch.into_writes() {
            next.apply(write)?;
        }
        self.persist(&next).await?;
        *data = next;

        debug!("[store] committed batch of {} writes", count);
        Ok(())
    }

    async fn list_events(&self, query: &EventQuery) -> Result<Vec<HostStatusEvent>, StoreError> {
        let data = self.data.read().await;
        let mut events: Vec<HostStatusEvent> = data.events.iter().filter(|e| query.matches(e)).cloned().collect();
        match query.order {
            EventOrder::NewestFirst => events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp)),
            EventOrder::OldestFirst => events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp)),
        }
        if let Some(limit) = query.limit {
            events.truncate(limit);
        }
        Ok(events)
    }

    async fn delete_events(&self, older_than: OffsetDateTime) -> Result<usize, StoreError> {
        let mut data = self.data.write().await;
        let mut next = data.clone();
        let before = next.events.len();
        next.events.retain(|e| e.timestamp >= older_than);
        let removed = before - next.events.len();
        if removed > 0 {
            self.persist(&next).await?;
            *data = next;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AuthMethod, Credential, DEFAULT_CONFIG_PATH};
    use std::net::Ipv4Addr;
    use time::macros::datetime;

    fn host(name: &str, status: HostStatus) -> Host {
        Host {
            name: name.into(),
            hostname: format!("{name}.lan"),
            address: Ipv4Addr::new(10, 0, 0, 10),
            ssh_port: 22,
            ssh_user: "ops".into(),
            credential: Credential {
                method: AuthMethod::Password,
                password: Some(SecretRef("inline-secret".into())),
                private_key: None,
            },
            config_path: DEFAULT_CONFIG_PATH.into(),
            status,
            last_status_check: None,
            auto_update_config: false,
        }
    }

    fn event(host: &str, at: OffsetDateTime) -> HostStatusEvent {
        HostStatusEvent::status_change(host, HostStatus::Active, HostStatus::Down, 3.0, Some(at), "test")
    }

    #[tokio::test]
    async fn test_list_monitorable_skips_disabled() {
        let store = JsonStore::in_memory();
        store.upsert_host(host("a", HostStatus::Active)).await.unwrap();
        store.upsert_host(host("b", HostStatus::Disabled)).await.unwrap();
        store.upsert_host(host("c", HostStatus::Inactive)).await.unwrap();

        let names: Vec<String> = store.list_monitorable().await.unwrap().into_iter().map(|h| h.name).collect();
        assert_eq!(names, vec!["a".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn test_commit_batch_is_all_or_nothing() {
        let store = JsonStore::in_memory();
        store.upsert_host(host("a", HostStatus::Active)).await.unwrap();
        let at = datetime!(2026-03-01 12:00 UTC);

        let mut batch = WriteBatch::new();
        batch.set_status("a", HostStatus::Down, at);
        batch.insert_event(event("a", at));
        batch.touch("ghost", at);

        let err = store.commit_batch(batch).await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownHost(ref h) if h == "ghost"));

        let a = store.get_host("a").await.unwrap();
        assert_eq!(a.status, HostStatus::Active);
        assert_eq!(a.last_status_check, None);
        assert!(store.list_events(&EventQuery::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_event_for_missing_host_rejected() {
        let store = JsonStore::in_memory();
        let err = store.insert_event(event("nobody", datetime!(2026-03-01 12:00 UTC))).await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownHost(_)));
    }

    #[tokio::test]
    async fn test_list_events_filters_and_order() {
        let store = JsonStore::in_memory();
        store.upsert_host(host("a", HostStatus::Active)).await.unwrap();
        store.upsert_host(host("b", HostStatus::Active)).await.unwrap();

        let mut batch = WriteBatch::new();
        batch.insert_event(event("a", datetime!(2026-03-01 10:00 UTC)));
        batch.insert_event(event("a", datetime!(2026-03-01 12:00 UTC)));
        batch.insert_event(event("b", datetime!(2026-03-01 11:00 UTC)));
        store.commit_batch(batch).await.unwrap();

        let all = store.list_events(&EventQuery::default()).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].timestamp, datetime!(2026-03-01 12:00 UTC));

        let only_a = store
            .list_events(&EventQuery::default().for_host("a").order(EventOrder::OldestFirst))
            .await
            .unwrap();
        assert_eq!(only_a.len(), 2);
        assert_eq!(only_a[0].timestamp, datetime!(2026-03-01 10:00 UTC));

        let window = store
            .list_events(
                &EventQuery::default()
                    .since(datetime!(2026-03-01 11:00 UTC))
                    .of_type(EventType::StatusChange)
                    .limit(1),
            )
            .await
            .unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].host, "a");
    }

    #[tokio::test]
    async fn test_delete_events_older_than() {
        let store = JsonStore::in_memory();
        store.upsert_host(host("a", HostStatus::Active)).await.unwrap();
        let mut batch = WriteBatch::new();
        batch.insert_event(event("a", datetime!(2026-02-01 00:00 UTC)));
        batch.insert_event(event("a", datetime!(2026-03-01 00:00 UTC)));
        store.commit_batch(batch).await.unwrap();

        let removed = store.delete_events(datetime!(2026-02-15 00:00 UTC)).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.list_events(&EventQuery::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.json");
        let at = datetime!(2026-03-01 12:00 UTC);
        {
            let store = JsonStore::open(&path).await.unwrap();
            store.upsert_host(host("a", HostStatus::Unknown)).await.unwrap();
            store.set_status("a", HostStatus::Active, at).await.unwrap();
        }

        let reopened = JsonStore::open(&path).await.unwrap();
        let a = reopened.get_host("a").await.unwrap();
        assert_eq!(a.status, HostStatus::Active);
        assert_eq!(a.last_status_check, Some(at));
    }

    #[tokio::test]
    async fn test_concurrent_writers_leave_a_single_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.json");
        let first = JsonStore::open(&path).await.unwrap();
        let second = JsonStore::open(&path).await.unwrap();

        let writes_a = async {
            for i in 0..20 {
                first.upsert_host(host(&format!("a-{i}"), HostStatus::Unknown)).await.unwrap();
            }
        };
        let writes_b = async {
            for i in 0..20 {
                second.upsert_host(host(&format!("b-{i}"), HostStatus::Unknown)).await.unwrap();
            }
        };
        tokio::join!(writes_a, writes_b);

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["fleet.json".to_string()]);

        // last writer wins, but the file is always a complete document
        let reopened = JsonStore::open(&path).await.unwrap();
        assert_eq!(reopened.list_hosts().await.unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_resolve_secret_handles() {
        std::env::set_var("FLEET_STORE_TEST_SECRET", "s3cret\n");
        let resolved = resolve_secret_handle(&SecretRef("env:FLEET_STORE_TEST_SECRET".into())).await.unwrap();
        assert_eq!(resolved, "s3cret");

        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("id_rsa");
        std::fs::write(&key, "-----BEGIN KEY-----\nabc\n-----END KEY-----\n").unwrap();
        let resolved = resolve_secret_handle(&SecretRef(format!("file:{}", key.display()))).await.unwrap();
        assert!(resolved.ends_with("-----END KEY-----"));

        assert!(resolve_secret_handle(&SecretRef("env:FLEET_STORE_TEST_MISSING".into())).await.is_err());
        assert_eq!(resolve_secret_handle(&SecretRef("plain".into())).await.unwrap(), "plain");
    }
}
