//! Tick-time dispatch: eligible keys fan out to per-key workers.
//!
//! Distinct keys run in parallel on the shared executor; the same key never
//! runs twice at once on this instance because each key is guarded by an
//! in-flight entry for as long as its worker lives. Cluster-wide the
//! partition assignment already guarantees a single owner per key.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::OutboxResult;
use crate::processor::ProcessorChain;
use crate::store::RecordStore;

/// Processes every due record of one key, in creation order.
pub struct KeyWorker<S: RecordStore> {
    store: Arc<S>,
    chain: Arc<ProcessorChain<S>>,
    stop_on_first_failure: bool,
    shutdown: Arc<AtomicBool>,
}

impl<S: RecordStore> KeyWorker<S> {
    pub fn new(
        store: Arc<S>,
        chain: Arc<ProcessorChain<S>>,
        stop_on_first_failure: bool,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            chain,
            stop_on_first_failure,
            shutdown,
        }
    }

    /// Dispatch the key's due records.
    ///
    /// Under `stop_on_first_failure` the key halts for this tick as soon as
    /// a record does not complete; otherwise later records of the key still
    /// get their attempt. Store errors abandon the key until the next tick.
    pub async fn process_key(&self, key: &str) {
        let records = match self.store.find_incomplete_records_by_key(key).await {
            Ok(records) => records,
            Err(e) => {
                warn!(record_key = %key, error = ?e, "Failed to load records for key");
                return;
            }
        };

        for record in records {
            if self.shutdown.load(Ordering::SeqCst) {
                debug!(record_key = %key, "Shutdown requested, stopping key worker");
                return;
            }

            if !record.is_eligible(chrono::Utc::now()) {
                // a not-yet-due record blocks the rest of the key under
                // strict ordering; without it the others still get a shot
                if self.stop_on_first_failure {
                    break;
                }
                continue;
            }

            let outcome = self.chain.dispatch(record).await;
            if self.stop_on_first_failure && !outcome.is_completed() {
                debug!(record_key = %key, "Key halted for this tick");
                break;
            }
        }
    }
}

/// Fans eligible keys out to workers on each scheduler tick.
pub struct Scheduler<S: RecordStore> {
    store: Arc<S>,
    worker: Arc<KeyWorker<S>>,
    batch_size: i64,
    stop_on_first_failure: bool,
    in_flight: Arc<DashMap<String, ()>>,
    semaphore: Option<Arc<Semaphore>>,
    shutdown: Arc<AtomicBool>,
}

impl<S: RecordStore + 'static> Scheduler<S> {
    pub fn new(
        store: Arc<S>,
        chain: Arc<ProcessorChain<S>>,
        batch_size: i64,
        stop_on_first_failure: bool,
        executor_concurrency_limit: i64,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let worker = Arc::new(KeyWorker::new(
            Arc::clone(&store),
            chain,
            stop_on_first_failure,
            Arc::clone(&shutdown),
        ));
        let semaphore = if executor_concurrency_limit > 0 {
            Some(Arc::new(Semaphore::new(executor_concurrency_limit as usize)))
        } else {
            None
        };
        Self {
            store,
            worker,
            batch_size,
            stop_on_first_failure,
            in_flight: Arc::new(DashMap::new()),
            semaphore,
            shutdown,
        }
    }

    /// Select this tick's keys and spawn a worker per key into `join_set`.
    ///
    /// Returns the number of workers spawned. Keys already in flight from a
    /// previous tick are skipped; acquiring an executor permit applies
    /// backpressure before each spawn.
    pub async fn run_tick(
        &self,
        partitions: &[i32],
        join_set: &mut JoinSet<()>,
    ) -> OutboxResult<usize> {
        if partitions.is_empty() {
            return Ok(0);
        }

        let keys = self
            .store
            .find_eligible_keys_in_partitions(partitions, self.batch_size, self.stop_on_first_failure)
            .await?;

        let mut spawned = 0;
        for key in keys {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            if self.in_flight.insert(key.clone(), ()).is_some() {
                debug!(record_key = %key, "Key still in flight, skipping this tick");
                continue;
            }

            let permit = match &self.semaphore {
                Some(semaphore) => match Arc::clone(semaphore).acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        self.in_flight.remove(&key);
                        break;
                    }
                },
                None => None,
            };

            let worker = Arc::clone(&self.worker);
            let in_flight = Arc::clone(&self.in_flight);
            join_set.spawn(async move {
                let _permit = permit;
                worker.process_key(&key).await;
                in_flight.remove(&key);
            });
            spawned += 1;
        }

        if spawned > 0 {
            debug!(spawned, "Dispatched key workers");
        }

        Ok(spawned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::OutboxPayload;
    use crate::error::DispatchError;
    use crate::handler::HandlerRegistry;
    use crate::record::{ContextMap, OutboxRecord, RecordStatus};
    use crate::retry::RetryPolicy;
    use crate::store::InMemoryRecordStore;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    impl OutboxPayload for Ping {
        fn record_type() -> &'static str {
            "ping"
        }
    }

    fn record_with_offset(key: &str, handler: &str, n: u32, offset_secs: i64) -> OutboxRecord {
        let mut record = OutboxRecord::new(
            key,
            "ping",
            format!(r#"{{"n":{n}}}"#),
            ContextMap::new(),
            handler,
            64,
        );
        record.created_at = record.created_at - chrono::Duration::seconds(offset_secs);
        record.next_retry_at = record.created_at;
        record
    }

    fn worker_with(
        registry: HandlerRegistry,
        stop_on_first_failure: bool,
    ) -> (Arc<InMemoryRecordStore>, KeyWorker<InMemoryRecordStore>) {
        let store = Arc::new(InMemoryRecordStore::new());
        let chain = Arc::new(ProcessorChain::new(
            Arc::clone(&store),
            Arc::new(registry),
            false,
            None,
        ));
        let worker = KeyWorker::new(
            Arc::clone(&store),
            chain,
            stop_on_first_failure,
            Arc::new(AtomicBool::new(false)),
        );
        (store, worker)
    }

    #[tokio::test]
    async fn records_of_a_key_dispatch_in_creation_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut registry = HandlerRegistry::new(RetryPolicy::default());
        registry
            .register_typed::<Ping, _, _>("pings", None, move |ping, _| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(ping.n);
                    Ok(())
                }
            })
            .unwrap();
        let (store, worker) = worker_with(registry, true);

        for (n, offset) in [(1, 30), (2, 20), (3, 10)] {
            store
                .save(&record_with_offset("k", "pings", n, offset))
                .await
                .unwrap();
        }

        worker.process_key("k").await;

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(
            store.count_by_status(RecordStatus::Completed).await.unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn stop_on_first_failure_halts_the_key() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut registry = HandlerRegistry::new(RetryPolicy::default());
        registry
            .register_typed::<Ping, _, _>(
                "pings",
                Some(RetryPolicy::fixed(Duration::from_secs(60), 5)),
                move |ping, _| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        if ping.n == 1 {
                            Err(DispatchError::new("first record is broken"))
                        } else {
                            Ok(())
                        }
                    }
                },
            )
            .unwrap();
        let (store, worker) = worker_with(registry, true);

        for (n, offset) in [(1, 30), (2, 20), (3, 10)] {
            store
                .save(&record_with_offset("k", "pings", n, offset))
                .await
                .unwrap();
        }

        worker.process_key("k").await;

        // only the first record got an attempt
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.count_by_status(RecordStatus::New).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn without_stop_on_first_failure_later_records_still_run() {
        let mut registry = HandlerRegistry::new(RetryPolicy::default());
        registry
            .register_typed::<Ping, _, _>(
                "pings",
                Some(RetryPolicy::fixed(Duration::from_secs(60), 5)),
                |ping, _| async move {
                    if ping.n == 1 {
                        Err(DispatchError::new("first record is broken"))
                    } else {
                        Ok(())
                    }
                },
            )
            .unwrap();
        let (store, worker) = worker_with(registry, false);

        for (n, offset) in [(1, 30), (2, 20), (3, 10)] {
            store
                .save(&record_with_offset("k", "pings", n, offset))
                .await
                .unwrap();
        }

        worker.process_key("k").await;

        assert_eq!(
            store.count_by_status(RecordStatus::Completed).await.unwrap(),
            2
        );
        assert_eq!(store.count_by_status(RecordStatus::New).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn shutdown_flag_stops_the_worker_between_records() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let store = Arc::new(InMemoryRecordStore::new());
        let mut registry = HandlerRegistry::new(RetryPolicy::default());
        let flag = Arc::clone(&shutdown);
        registry
            .register_typed::<Ping, _, _>("pings", None, move |_, _| {
                let flag = flag.clone();
                async move {
                    // request shutdown from inside the first dispatch
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();
        let chain = Arc::new(ProcessorChain::new(
            Arc::clone(&store),
            Arc::new(registry),
            false,
            None,
        ));
        let worker = KeyWorker::new(Arc::clone(&store), chain, true, Arc::clone(&shutdown));

        for (n, offset) in [(1, 30), (2, 20)] {
            store
                .save(&record_with_offset("k", "pings", n, offset))
                .await
                .unwrap();
        }

        worker.process_key("k").await;

        // second record was never attempted
        assert_eq!(
            store.count_by_status(RecordStatus::Completed).await.unwrap(),
            1
        );
        assert_eq!(store.count_by_status(RecordStatus::New).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn run_tick_skips_keys_already_in_flight() {
        let mut registry = HandlerRegistry::new(RetryPolicy::default());
        registry
            .register_typed::<Ping, _, _>("pings", None, |_, _| async { Ok(()) })
            .unwrap();
        let store = Arc::new(InMemoryRecordStore::new());
        let chain = Arc::new(ProcessorChain::new(
            Arc::clone(&store),
            Arc::new(registry),
            false,
            None,
        ));
        let scheduler = Scheduler::new(
            Arc::clone(&store),
            chain,
            100,
            true,
            -1,
            Arc::new(AtomicBool::new(false)),
        );

        store
            .save(&record_with_offset("k", "pings", 1, 10))
            .await
            .unwrap();

        // simulate a worker from a previous tick still holding the key
        scheduler.in_flight.insert("k".to_string(), ());

        let mut join_set = JoinSet::new();
        let spawned = scheduler
            .run_tick(&[crate::record::partition_for_key("k", 64)], &mut join_set)
            .await
            .unwrap();
        assert_eq!(spawned, 0);

        scheduler.in_flight.remove("k");
        let spawned = scheduler
            .run_tick(&[crate::record::partition_for_key("k", 64)], &mut join_set)
            .await
            .unwrap();
        assert_eq!(spawned, 1);

        while join_set.join_next().await.is_some() {}
        assert_eq!(
            store.count_by_status(RecordStatus::Completed).await.unwrap(),
            1
        );
        // the in-flight guard is released once the worker finishes
        assert!(scheduler.in_flight.is_empty());
    }

    #[tokio::test]
    async fn run_tick_with_no_partitions_is_a_no_op() {
        let registry = HandlerRegistry::new(RetryPolicy::default());
        let store = Arc::new(InMemoryRecordStore::new());
        let chain = Arc::new(ProcessorChain::new(
            Arc::clone(&store),
            Arc::new(registry),
            false,
            None,
        ));
        let scheduler = Scheduler::new(
            Arc::clone(&store),
            chain,
            100,
            true,
            4,
            Arc::new(AtomicBool::new(false)),
        );

        let mut join_set = JoinSet::new();
        assert_eq!(scheduler.run_tick(&[], &mut join_set).await.unwrap(), 0);
    }
}
