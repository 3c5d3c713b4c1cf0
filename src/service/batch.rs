use std::sync::Arc;
use std::time::Duration;

use cyder_tools::log::{debug, error, info};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use strum::Display;
use tokio::task::JoinHandle;

use crate::service::store::{AccountStore, ChannelDirectory, StoreError, TokenStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BatchUpdateType {
    TokenQuota,
    AccountQuota,
    AccountUsedQuota,
    AccountRequestCount,
    ChannelUsedQuota,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchUpdateRecord {
    pub kind: BatchUpdateType,
    pub id: i64,
    pub delta: i64,
}

/// Pending signed deltas, coalesced per `(kind, id)`.
///
/// Quota kinds carry the change to the remaining balance (negative = charge);
/// usage kinds carry the increment to the counter.
#[derive(Debug, Default)]
pub struct BatchUpdater {
    pending: DashMap<(BatchUpdateType, i64), i64>,
}

impl BatchUpdater {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, kind: BatchUpdateType, id: i64, delta: i64) {
        if delta == 0 {
            return;
        }
        *self.pending.entry((kind, id)).or_insert(0) += delta;
    }

    pub fn pending_delta(&self, kind: BatchUpdateType, id: i64) -> i64 {
        self.pending.get(&(kind, id)).map(|d| *d).unwrap_or(0)
    }

    /// Queues a charge of `amount` if `stored` plus what is already pending
    /// covers it, all under the entry lock. Returns the balance left after the
    /// charge.
    pub fn try_reserve(&self, kind: BatchUpdateType, id: i64, stored: i64, amount: i64) -> Option<i64> {
        match self.pending.entry((kind, id)) {
            Entry::Occupied(mut entry) => {
                let available = stored + *entry.get();
                if available < amount {
                    return None;
                }
                *entry.get_mut() -= amount;
                Some(available - amount)
            }
            Entry::Vacant(entry) => {
                if stored < amount {
                    return None;
                }
                if amount != 0 {
                    entry.insert(-amount);
                }
                Some(stored - amount)
            }
        }
    }

    /// Removes and returns every pending record. A record is handed out once.
    pub fn drain(&self) -> Vec<BatchUpdateRecord> {
        let keys: Vec<(BatchUpdateType, i64)> = self.pending.iter().map(|e| *e.key()).collect();
        keys.into_iter()
            .filter_map(|key| self.pending.remove(&key))
            .filter(|(_, delta)| *delta != 0)
            .map(|((kind, id), delta)| BatchUpdateRecord { kind, id, delta })
            .collect()
    }

    pub fn snapshot(&self) -> Vec<BatchUpdateRecord> {
        self.pending
            .iter()
            .map(|e| {
                let (kind, id) = *e.key();
                BatchUpdateRecord { kind, id, delta: *e.value() }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Applies every pending record. Records that fail are put back so the
    /// next flush retries them. Returns how many records were applied.
    pub async fn flush(
        &self,
        tokens: &dyn TokenStore,
        accounts: &dyn AccountStore,
        directory: &dyn ChannelDirectory,
    ) -> usize {
        let records = self.drain();
        if records.is_empty() {
            return 0;
        }
        let total = records.len();
        let mut applied = 0;
        for record in records {
            match apply_record(&record, tokens, accounts, directory).await {
                Ok(()) => applied += 1,
                Err(e) => {
                    error!(
                        "failed to apply batch update {} #{} ({}): {}",
                        record.kind, record.id, record.delta, e
                    );
                    self.add(record.kind, record.id, record.delta);
                }
            }
        }
        debug!("batch flush applied {}/{} records", applied, total);
        applied
    }

    pub fn spawn_flush_task(
        self: Arc<Self>,
        interval: Duration,
        tokens: Arc<dyn TokenStore>,
        accounts: Arc<dyn AccountStore>,
        directory: Arc<dyn ChannelDirectory>,
    ) -> JoinHandle<()> {
        info!("batch update enabled, flushing every {:?}", interval);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.flush(tokens.as_ref(), accounts.as_ref(), directory.as_ref()).await;
            }
        })
    }
}

async fn apply_record(
    record: &BatchUpdateRecord,
    tokens: &dyn TokenStore,
    accounts: &dyn AccountStore,
    directory: &dyn ChannelDirectory,
) -> Result<(), StoreError> {
    match record.kind {
        BatchUpdateType::TokenQuota => tokens.adjust_token_quota(record.id, record.delta).await,
        BatchUpdateType::AccountQuota => accounts.adjust_account_quota(record.id, record.delta).await,
        BatchUpdateType::AccountUsedQuota => accounts.add_account_usage(record.id, record.delta, 0).await,
        BatchUpdateType::AccountRequestCount => accounts.add_account_usage(record.id, 0, record.delta).await,
        BatchUpdateType::ChannelUsedQuota => directory.add_channel_used_quota(record.id, record.delta).await,
    }
}
