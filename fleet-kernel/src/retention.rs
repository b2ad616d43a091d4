use std::sync::Arc;
use std::time::Duration as StdDuration;
use time::Duration;
use tracing::{error, info};

use crate::clock::{checked_before, Clock};
use crate::error::FleetError;
use crate::store::HostRecordStore;

/// Deletes events strictly older than `now - max_age`; returns how many went.
pub async fn purge_expired_events(
    store: &dyn HostRecordStore,
    clock: &dyn Clock,
    max_age: Duration,
) -> Result<usize, FleetError> {
    let cutoff = checked_before(clock.now(), max_age)
        .ok_or_else(|| FleetError::validation("days", format!("{} days reaches past the calendar", max_age.whole_days())))?;
    let removed = store.delete_events(cutoff).await?;
    if removed > 0 {
        info!("[retention] removed {} events older than {}", removed, cutoff);
    }
    Ok(removed)
}

/// Periodic purge; the first run happens one `every` after start.
pub fn spawn_retention_task(
    store: Arc<dyn HostRecordStore>,
    clock: Arc<dyn Clock>,
    max_age_days: u32,
    every: StdDuration,
) {
    let max_age = Duration::days(i64::from(max_age_days));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = purge_expired_events(store.as_ref(), clock.as_ref(), max_age).await {
                error!("[retention] purge failed: {}", e);
            }
        }
    });
}
