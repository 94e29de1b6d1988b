//! Retention cleaner for purging old probe history.

use crate::db::Store;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Background task deleting records and ledger entries past the retention horizon.
pub struct RetentionCleaner {
    store: Store,
    retention: ChronoDuration,
    every: Duration,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

/// Rows removed by one cleaning pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub records: usize,
    pub messages: usize,
}

impl RetentionCleaner {
    pub fn new(store: Store, retention_days: u32, every: Duration) -> Self {
        Self {
            store,
            retention: ChronoDuration::days(i64::from(retention_days)),
            every,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the cleaner background task. The first pass runs immediately.
    pub async fn start(&self) {
        let (tx, mut rx) = tokio::sync::broadcast::channel(1);
        *self.stop.lock().await = Some(tx);

        let store = self.store.clone();
        let retention = self.retention;
        let mut interval = tokio::time::interval(self.every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        let cutoff = Utc::now() - retention;
                        if let Err(e) = clean_before(&store, cutoff) {
                            tracing::error!("RetentionCleaner: cleanup failed, retrying next tick: {}", e);
                        }
                    }
                }
            }
        });
    }

    /// Stop the cleaner.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }
}

/// Delete everything older than the cutoff.
pub fn clean_before(store: &Store, cutoff: DateTime<Utc>) -> Result<CleanupReport, crate::db::DbError> {
    let report = CleanupReport {
        records: store.delete_records_before(cutoff)?,
        messages: store.delete_unmatched_seen_before(cutoff)?,
    };

    if report.records > 0 || report.messages > 0 {
        tracing::info!(
            "RetentionCleaner: removed {} records and {} unmatched messages older than {}",
            report.records,
            report.messages,
            cutoff
        );
    }
    Ok(report)
}
