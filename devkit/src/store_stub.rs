/*!
Store défaillant : délègue à un `JsonStore` en mémoire, avec des pannes
programmables sur le commit et sur le listing des hôtes.
*/

use async_trait::async_trait;
use fleet_kernel::error::StoreError;
use fleet_kernel::models::{Host, HostStatusEvent, HostSummary};
use fleet_kernel::store::{EventQuery, HostRecordStore, JsonStore, WriteBatch};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use time::OffsetDateTime;

#[derive(Clone)]
pub struct FlakyStore {
    inner: Arc<JsonStore>,
    failing_commits: Arc<AtomicUsize>,
    fail_listing: Arc<AtomicBool>,
    commits: Arc<AtomicUsize>,
    rejected: Arc<AtomicUsize>,
}

impl Default for FlakyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::wrap(Arc::new(JsonStore::in_memory()))
    }

    pub fn wrap(inner: Arc<JsonStore>) -> Self {
        Self {
            inner,
            failing_commits: Arc::new(AtomicUsize::new(0)),
            fail_listing: Arc::new(AtomicBool::new(false)),
            commits: Arc::new(AtomicUsize::new(0)),
            rejected: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The next `n` calls to `commit_batch` fail without applying anything.
    pub fn fail_next_commits(&self, n: usize) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    pub fn fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    /// Successful commits.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rejected_count(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HostRecordStore for FlakyStore {
    async fn list_hosts(&self) -> Result<Vec<HostSummary>, StoreError> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("host table unavailable")));
        }
        self.inner.list_hosts().await
    }

    async fn get_host(&self, name: &str) -> Result<Host, StoreError> {
        self.inner.get_host(name).await
    }

    async fn upsert_host(&self, host: Host) -> Result<(), StoreError> {
        self.inner.upsert_host(host).await
    }

    async fn commit_batch(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let armed = self
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Commit(format!(
                "injected failure, {} writes dropped",
                batch.len()
            )));
        }
        self.inner.commit_batch(batch).await?;
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_events(&self, query: &EventQuery) -> Result<Vec<HostStatusEvent>, StoreError> {
        self.inner.list_events(query).await
    }

    async fn delete_events(&self, older_than: OffsetDateTime) -> Result<usize, StoreError> {
        self.inner.delete_events(older_than).await
    }
}
