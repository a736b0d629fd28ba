//! In-memory record store.
//!
//! Mirrors the SQL semantics of [`SqlxRecordStore`](super::SqlxRecordStore)
//! over a plain map. Used by the engine's unit tests and handy for embedding
//! tests in applications; not intended for production (nothing survives a
//! restart).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::error::{OutboxError, OutboxResult};
use crate::record::{OutboxRecord, RecordStatus};
use crate::store::RecordStore;

#[derive(Default)]
pub struct InMemoryRecordStore {
    records: Mutex<HashMap<Uuid, OutboxRecord>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a single record, if present.
    pub fn get(&self, id: Uuid) -> Option<OutboxRecord> {
        self.records.lock().unwrap().get(&id).cloned()
    }

    /// Snapshot of all records, in creation order.
    pub fn snapshot(&self) -> Vec<OutboxRecord> {
        let mut records: Vec<OutboxRecord> =
            self.records.lock().unwrap().values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        records
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn save(&self, record: &OutboxRecord) -> OutboxResult<()> {
        self.records
            .lock()
            .unwrap()
            .insert(record.id, record.clone());
        Ok(())
    }

    async fn find_eligible_keys_in_partitions(
        &self,
        partitions: &[i32],
        batch_size: i64,
        skip_keys_with_prior_failures: bool,
    ) -> OutboxResult<Vec<String>> {
        let now = Utc::now();
        let records = self.records.lock().unwrap();

        // min created_at of the qualifying eligible records, per key
        let mut oldest_per_key: HashMap<&str, DateTime<Utc>> = HashMap::new();
        for record in records.values() {
            if !partitions.contains(&record.partition) || !record.is_eligible(now) {
                continue;
            }
            if skip_keys_with_prior_failures {
                let blocked = records.values().any(|prior| {
                    prior.key == record.key
                        && prior.created_at < record.created_at
                        && prior.status != RecordStatus::Completed
                });
                if blocked {
                    continue;
                }
            }
            oldest_per_key
                .entry(record.key.as_str())
                .and_modify(|oldest| {
                    if record.created_at < *oldest {
                        *oldest = record.created_at;
                    }
                })
                .or_insert(record.created_at);
        }

        let mut keys: Vec<(DateTime<Utc>, String)> = oldest_per_key
            .into_iter()
            .map(|(key, oldest)| (oldest, key.to_string()))
            .collect();
        keys.sort();
        keys.truncate(batch_size.max(0) as usize);
        Ok(keys.into_iter().map(|(_, key)| key).collect())
    }

    async fn find_incomplete_records_by_key(&self, key: &str) -> OutboxResult<Vec<OutboxRecord>> {
        let records = self.records.lock().unwrap();
        let mut incomplete: Vec<OutboxRecord> = records
            .values()
            .filter(|r| r.key == key && r.status == RecordStatus::New)
            .cloned()
            .collect();
        incomplete.sort_by_key(|r| r.created_at);
        Ok(incomplete)
    }

    async fn count_by_status(&self, status: RecordStatus) -> OutboxResult<i64> {
        let records = self.records.lock().unwrap();
        Ok(records.values().filter(|r| r.status == status).count() as i64)
    }

    async fn count_by_partition(
        &self,
        partition: i32,
        status: RecordStatus,
    ) -> OutboxResult<i64> {
        let records = self.records.lock().unwrap();
        Ok(records
            .values()
            .filter(|r| r.partition == partition && r.status == status)
            .count() as i64)
    }

    async fn pending_per_partition(&self, partitions: &[i32]) -> OutboxResult<Vec<(i32, i64)>> {
        let records = self.records.lock().unwrap();
        let mut pending: HashMap<i32, i64> = HashMap::new();
        for record in records.values() {
            if partitions.contains(&record.partition) && record.status == RecordStatus::New {
                *pending.entry(record.partition).or_default() += 1;
            }
        }
        Ok(pending.into_iter().collect())
    }

    async fn delete_by_id(&self, id: Uuid) -> OutboxResult<()> {
        self.records
            .lock()
            .unwrap()
            .remove(&id)
            .map(|_| ())
            .ok_or(OutboxError::RecordNotFound(id))
    }

    async fn delete_by_status(&self, status: RecordStatus) -> OutboxResult<u64> {
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|_, r| r.status != status);
        Ok((before - records.len()) as u64)
    }

    async fn delete_by_key_and_status(
        &self,
        key: &str,
        status: RecordStatus,
    ) -> OutboxResult<u64> {
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|_, r| !(r.key == key && r.status == status));
        Ok((before - records.len()) as u64)
    }

    async fn replay_failed_since(&self, since: DateTime<Utc>) -> OutboxResult<u64> {
        let mut records = self.records.lock().unwrap();
        let mut requeued = 0;
        for record in records.values_mut() {
            if record.status == RecordStatus::Failed && record.created_at >= since {
                record.status = RecordStatus::New;
                record.failure_count = 0;
                record.failure_reason = None;
                record.next_retry_at = Utc::now();
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    async fn replay_failed_by_key(&self, key: &str) -> OutboxResult<u64> {
        let mut records = self.records.lock().unwrap();
        let mut requeued = 0;
        for record in records.values_mut() {
            if record.status == RecordStatus::Failed && record.key == key {
                record.status = RecordStatus::New;
                record.failure_count = 0;
                record.failure_reason = None;
                record.next_retry_at = Utc::now();
                requeued += 1;
            }
        }
        Ok(requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ContextMap;

    fn record(key: &str, partition: i32) -> OutboxRecord {
        let mut r = OutboxRecord::new(key, "t", "{}", ContextMap::new(), "h", 64);
        r.partition = partition;
        r
    }

    #[tokio::test]
    async fn eligible_keys_are_ordered_oldest_first() {
        let store = InMemoryRecordStore::new();
        let mut newer = record("newer", 1);
        let mut older = record("older", 1);
        older.created_at = older.created_at - chrono::Duration::seconds(10);
        newer.created_at = newer.created_at - chrono::Duration::seconds(5);
        store.save(&newer).await.unwrap();
        store.save(&older).await.unwrap();

        let keys = store
            .find_eligible_keys_in_partitions(&[1], 10, true)
            .await
            .unwrap();
        assert_eq!(keys, vec!["older".to_string(), "newer".to_string()]);
    }

    #[tokio::test]
    async fn batch_size_limits_returned_keys() {
        let store = InMemoryRecordStore::new();
        for i in 0..5 {
            let mut r = record(&format!("k{i}"), 1);
            r.created_at = r.created_at - chrono::Duration::seconds(10 - i);
            store.save(&r).await.unwrap();
        }
        let keys = store
            .find_eligible_keys_in_partitions(&[1], 2, true)
            .await
            .unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys, vec!["k0".to_string(), "k1".to_string()]);
    }

    #[tokio::test]
    async fn keys_outside_owned_partitions_are_invisible() {
        let store = InMemoryRecordStore::new();
        store.save(&record("mine", 1)).await.unwrap();
        store.save(&record("other", 2)).await.unwrap();

        let keys = store
            .find_eligible_keys_in_partitions(&[1], 10, true)
            .await
            .unwrap();
        assert_eq!(keys, vec!["mine".to_string()]);
    }

    #[tokio::test]
    async fn prior_failed_record_blocks_the_key_when_skipping() {
        let store = InMemoryRecordStore::new();
        let mut failed = record("k", 1);
        failed.created_at = failed.created_at - chrono::Duration::seconds(10);
        failed.mark_failed();
        let eligible = record("k", 1);
        store.save(&failed).await.unwrap();
        store.save(&eligible).await.unwrap();

        let strict = store
            .find_eligible_keys_in_partitions(&[1], 10, true)
            .await
            .unwrap();
        assert!(strict.is_empty());

        let relaxed = store
            .find_eligible_keys_in_partitions(&[1], 10, false)
            .await
            .unwrap();
        assert_eq!(relaxed, vec!["k".to_string()]);
    }

    #[tokio::test]
    async fn future_retry_time_hides_the_record() {
        let store = InMemoryRecordStore::new();
        let mut r = record("k", 1);
        r.next_retry_at = Utc::now() + chrono::Duration::seconds(60);
        store.save(&r).await.unwrap();

        let keys = store
            .find_eligible_keys_in_partitions(&[1], 10, true)
            .await
            .unwrap();
        assert!(keys.is_empty());
    }

    #[tokio::test]
    async fn replay_requeues_failed_records() {
        let store = InMemoryRecordStore::new();
        let mut r = record("k", 1);
        r.failure_count = 4;
        r.mark_failed();
        store.save(&r).await.unwrap();

        let requeued = store.replay_failed_by_key("k").await.unwrap();
        assert_eq!(requeued, 1);
        let replayed = store.get(r.id).unwrap();
        assert_eq!(replayed.status, RecordStatus::New);
        assert_eq!(replayed.failure_count, 0);
        assert!(replayed.failure_reason.is_none());
    }
}
