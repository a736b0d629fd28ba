//! Engine lifecycle: wires the store, registry, coordinator and scheduler
//! together and runs the background loops.

use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::OutboxConfig;
use crate::context::ContextProvider;
use crate::error::OutboxResult;
use crate::handler::HandlerRegistry;
use crate::instance::InstanceRegistry;
use crate::metrics::OutboxMetrics;
use crate::partition::PartitionCoordinator;
use crate::processor::ProcessorChain;
use crate::record::RecordStatus;
use crate::scheduler::Scheduler;
use crate::store::{RecordStore, SqlxRecordStore};
use crate::Outbox;

/// The delivery engine.
///
/// `start()` registers this instance in the cluster and spawns two loops: a
/// heartbeat/cleanup timer and the scheduler tick loop. `shutdown()` stops
/// both, waits out the graceful deadline for outstanding key workers, then
/// abandons partitions and deregisters.
///
/// ```no_run
/// use outbox::{HandlerRegistry, OutboxConfig, OutboxEngine, OutboxPayload};
/// use serde::{Deserialize, Serialize};
/// use sqlx::PgPool;
///
/// #[derive(Serialize, Deserialize)]
/// struct OrderCreated {
///     order_id: String,
/// }
///
/// impl OutboxPayload for OrderCreated {}
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let pool = PgPool::connect("postgresql://localhost/app").await?;
///
///     let config = OutboxConfig::from_env();
///     let mut handlers = HandlerRegistry::new(config.default_retry_policy());
///     handlers.register_typed::<OrderCreated, _, _>("order-handler", None, |order, _| async move {
///         println!("processing {}", order.order_id);
///         Ok(())
///     })?;
///
///     let engine = OutboxEngine::new(pool.clone(), config, handlers, Vec::new())?;
///     engine.start().await?;
///
///     // schedule inside a business transaction
///     let outbox = engine.outbox();
///     let mut tx = pool.begin().await?;
///     outbox
///         .schedule_keyed(&mut tx, &OrderCreated { order_id: "o1".into() }, "o1")
///         .await?;
///     tx.commit().await?;
///
///     engine.shutdown().await;
///     Ok(())
/// }
/// ```
pub struct OutboxEngine {
    config: OutboxConfig,
    store: Arc<SqlxRecordStore>,
    handlers: Arc<HandlerRegistry>,
    instances: Arc<InstanceRegistry>,
    coordinator: Arc<PartitionCoordinator>,
    scheduler: Arc<Scheduler<SqlxRecordStore>>,
    providers: Vec<Arc<dyn ContextProvider>>,
    metrics: Option<OutboxMetrics>,
    shutdown: Arc<AtomicBool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl OutboxEngine {
    /// Build an engine without metrics.
    pub fn new(
        pool: PgPool,
        config: OutboxConfig,
        handlers: HandlerRegistry,
        providers: Vec<Arc<dyn ContextProvider>>,
    ) -> OutboxResult<Self> {
        Self::build(pool, config, handlers, providers, None)
    }

    /// Build an engine that also refreshes Prometheus gauges on every tick.
    pub fn new_with_metrics(
        pool: PgPool,
        config: OutboxConfig,
        handlers: HandlerRegistry,
        providers: Vec<Arc<dyn ContextProvider>>,
        metrics: OutboxMetrics,
    ) -> OutboxResult<Self> {
        Self::build(pool, config, handlers, providers, Some(metrics))
    }

    fn build(
        pool: PgPool,
        config: OutboxConfig,
        handlers: HandlerRegistry,
        providers: Vec<Arc<dyn ContextProvider>>,
        metrics: Option<OutboxMetrics>,
    ) -> OutboxResult<Self> {
        config.validate()?;

        let store = Arc::new(SqlxRecordStore::new(pool.clone()));
        let handlers = Arc::new(handlers);
        let instances = Arc::new(InstanceRegistry::new(
            pool.clone(),
            config.instance.hostname.clone(),
            i32::from(config.instance.port),
            config.stale_instance_timeout_secs,
        ));
        let coordinator = Arc::new(PartitionCoordinator::new(
            pool,
            Arc::clone(&instances),
            config.total_partitions,
        ));
        let shutdown = Arc::new(AtomicBool::new(false));
        let chain = Arc::new(ProcessorChain::new(
            Arc::clone(&store),
            Arc::clone(&handlers),
            config.delete_completed_records,
            metrics.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            chain,
            config.batch_size,
            config.stop_on_first_failure,
            config.executor_concurrency_limit,
            Arc::clone(&shutdown),
        ));

        Ok(Self {
            config,
            store,
            handlers,
            instances,
            coordinator,
            scheduler,
            providers,
            metrics,
            shutdown,
            loops: Mutex::new(Vec::new()),
        })
    }

    /// The scheduling façade bound to this engine's store and registry.
    pub fn outbox(&self) -> Outbox {
        Outbox::new(
            Arc::clone(&self.store),
            Arc::clone(&self.handlers),
            self.providers.clone(),
            self.config.total_partitions,
        )
    }

    pub fn instance_id(&self) -> uuid::Uuid {
        self.instances.current_instance_id()
    }

    /// Register in the cluster and start the background loops.
    pub async fn start(&self) -> OutboxResult<()> {
        self.instances.register_instance().await?;

        let heartbeat = {
            let instances = Arc::clone(&self.instances);
            let shutdown = Arc::clone(&self.shutdown);
            let interval = self.config.heartbeat_interval();
            tokio::spawn(async move {
                loop {
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    instances.perform_heartbeat_and_cleanup().await;
                    tokio::time::sleep(interval).await;
                }
            })
        };

        let tick_loop = {
            let scheduler = Arc::clone(&self.scheduler);
            let coordinator = Arc::clone(&self.coordinator);
            let instances = Arc::clone(&self.instances);
            let store = Arc::clone(&self.store);
            let metrics = self.metrics.clone();
            let shutdown = Arc::clone(&self.shutdown);
            let poll_interval = self.config.poll_interval();
            let total_partitions = self.config.total_partitions;
            tokio::spawn(async move {
                let mut workers = JoinSet::new();
                loop {
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    // reap workers finished since the last tick
                    while workers.try_join_next().is_some() {}

                    if let Err(e) = coordinator.rebalance().await {
                        warn!(error = ?e, "Partition rebalance failed");
                    }
                    let partitions = match coordinator.assigned_partition_numbers().await {
                        Ok(partitions) => partitions,
                        Err(e) => {
                            warn!(error = ?e, "Failed to read assigned partitions");
                            Vec::new()
                        }
                    };
                    if !partitions.is_empty() {
                        if let Err(e) = scheduler.run_tick(&partitions, &mut workers).await {
                            error!(error = ?e, "Scheduler tick failed");
                        }
                    }

                    if let Some(metrics) = &metrics {
                        refresh_metrics(
                            metrics,
                            store.as_ref(),
                            &coordinator,
                            &instances,
                            &partitions,
                            total_partitions,
                        )
                        .await;
                    }

                    tokio::time::sleep(poll_interval).await;
                }
                // let outstanding key workers finish
                while workers.join_next().await.is_some() {}
            })
        };

        self.loops.lock().unwrap().extend([heartbeat, tick_loop]);

        info!(
            instance_id = %self.instances.current_instance_id(),
            poll_interval_ms = self.config.poll_interval_ms,
            batch_size = self.config.batch_size,
            total_partitions = self.config.total_partitions,
            handlers = self.handlers.len(),
            "Outbox engine started"
        );

        Ok(())
    }

    /// Stop accepting work, drain workers, abandon partitions, deregister.
    ///
    /// Waits at most the configured graceful deadline for outstanding
    /// workers before aborting them.
    pub async fn shutdown(&self) {
        info!(
            instance_id = %self.instances.current_instance_id(),
            "Outbox engine shutting down"
        );
        self.shutdown.store(true, Ordering::SeqCst);

        let handles: Vec<JoinHandle<()>> = self.loops.lock().unwrap().drain(..).collect();
        let abort_handles: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(self.config.graceful_shutdown_timeout(), drain)
            .await
            .is_err()
        {
            warn!("Graceful shutdown deadline exceeded, aborting outstanding workers");
            for handle in abort_handles {
                handle.abort();
            }
        }

        if let Err(e) = self.coordinator.release_assignments().await {
            warn!(error = ?e, "Failed to release partition assignments on shutdown");
        }
        if let Err(e) = self.instances.graceful_shutdown().await {
            warn!(error = ?e, "Failed to deregister instance on shutdown");
        }

        info!("Outbox engine stopped");
    }
}

async fn refresh_metrics(
    metrics: &OutboxMetrics,
    store: &SqlxRecordStore,
    coordinator: &PartitionCoordinator,
    instances: &InstanceRegistry,
    assigned: &[i32],
    total_partitions: i32,
) {
    for (status, label) in [
        (RecordStatus::New, "new"),
        (RecordStatus::Completed, "completed"),
        (RecordStatus::Failed, "failed"),
    ] {
        match store.count_by_status(status).await {
            Ok(count) => metrics.records_count.with_label_values(&[label]).set(count),
            Err(e) => debug!(error = ?e, status = label, "Failed to count records"),
        }
    }

    metrics.partitions_assigned.set(assigned.len() as i64);

    match store.pending_per_partition(assigned).await {
        Ok(pending) => metrics.set_pending(&pending, assigned.len()),
        Err(e) => debug!(error = ?e, "Failed to compute pending counts"),
    }

    match instances.get_active_instances().await {
        Ok(active) => metrics.cluster_instances.set(active.len() as i64),
        Err(e) => debug!(error = ?e, "Failed to count active instances"),
    }

    match coordinator.unassigned_partitions().await {
        Ok(unassigned) => metrics.set_unassigned(&unassigned, total_partitions),
        Err(e) => debug!(error = ?e, "Failed to compute unassigned partitions"),
    }
}
