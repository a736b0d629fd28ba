//! Prometheus gauges for records, partitions and cluster membership.

use prometheus::{Gauge, IntCounterVec, IntGauge, IntGaugeVec, Opts};
use tracing::warn;

/// Outbox metrics, registered against the default registry.
///
/// Gauges are refreshed once per scheduler tick from store and coordinator
/// stats; the dispatch counter is bumped by the processor chain.
#[derive(Clone)]
pub struct OutboxMetrics {
    /// `outbox_records_count{status=new|completed|failed}`
    pub records_count: IntGaugeVec,

    /// `outbox_partitions_assigned_count`
    pub partitions_assigned: IntGauge,

    /// `outbox_partitions_pending_records_total`
    pub pending_records_total: IntGauge,

    /// `outbox_partitions_pending_records_max`
    pub pending_records_max: IntGauge,

    /// `outbox_partitions_pending_records_avg`
    pub pending_records_avg: Gauge,

    /// `outbox_cluster_instances_total`
    pub cluster_instances: IntGauge,

    /// `outbox_cluster_partitions_unassigned_count`
    pub partitions_unassigned: IntGauge,

    /// `outbox_cluster_partitions_unassigned_flag{partition=n}`
    pub partition_unassigned_flag: IntGaugeVec,

    /// `outbox_records_dispatched_total{outcome=completed|retried|failed}`
    pub dispatched: IntCounterVec,
}

impl OutboxMetrics {
    pub fn new(service: &str) -> Self {
        let registry = prometheus::default_registry();

        let records_count = IntGaugeVec::new(
            Opts::new(
                "outbox_records_count",
                "Number of outbox records by status",
            )
            .const_label("service", service.to_string()),
            &["status"],
        )
        .expect("valid metric opts for outbox_records_count");

        let partitions_assigned = IntGauge::with_opts(
            Opts::new(
                "outbox_partitions_assigned_count",
                "Number of partitions assigned to this instance",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for outbox_partitions_assigned_count");

        let pending_records_total = IntGauge::with_opts(
            Opts::new(
                "outbox_partitions_pending_records_total",
                "Pending records across the partitions assigned to this instance",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for outbox_partitions_pending_records_total");

        let pending_records_max = IntGauge::with_opts(
            Opts::new(
                "outbox_partitions_pending_records_max",
                "Pending records in the most loaded assigned partition",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for outbox_partitions_pending_records_max");

        let pending_records_avg = Gauge::with_opts(
            Opts::new(
                "outbox_partitions_pending_records_avg",
                "Average pending records per assigned partition",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for outbox_partitions_pending_records_avg");

        let cluster_instances = IntGauge::with_opts(
            Opts::new(
                "outbox_cluster_instances_total",
                "Number of active instances in the cluster",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for outbox_cluster_instances_total");

        let partitions_unassigned = IntGauge::with_opts(
            Opts::new(
                "outbox_cluster_partitions_unassigned_count",
                "Number of partitions without a claim from an active instance",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for outbox_cluster_partitions_unassigned_count");

        let partition_unassigned_flag = IntGaugeVec::new(
            Opts::new(
                "outbox_cluster_partitions_unassigned_flag",
                "1 when the partition has no claim from an active instance",
            )
            .const_label("service", service.to_string()),
            &["partition"],
        )
        .expect("valid metric opts for outbox_cluster_partitions_unassigned_flag");

        let dispatched = IntCounterVec::new(
            Opts::new(
                "outbox_records_dispatched_total",
                "Dispatch attempts by outcome",
            )
            .const_label("service", service.to_string()),
            &["outcome"],
        )
        .expect("valid metric opts for outbox_records_dispatched_total");

        for metric in [
            Box::new(records_count.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(partitions_assigned.clone()),
            Box::new(pending_records_total.clone()),
            Box::new(pending_records_max.clone()),
            Box::new(pending_records_avg.clone()),
            Box::new(cluster_instances.clone()),
            Box::new(partitions_unassigned.clone()),
            Box::new(partition_unassigned_flag.clone()),
            Box::new(dispatched.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register outbox metric: {}", e);
            }
        }

        Self {
            records_count,
            partitions_assigned,
            pending_records_total,
            pending_records_max,
            pending_records_avg,
            cluster_instances,
            partitions_unassigned,
            partition_unassigned_flag,
            dispatched,
        }
    }

    /// Refresh the pending-record gauges from per-partition counts.
    pub fn set_pending(&self, per_partition: &[(i32, i64)], assigned_partitions: usize) {
        let total: i64 = per_partition.iter().map(|(_, n)| n).sum();
        let max: i64 = per_partition.iter().map(|(_, n)| *n).max().unwrap_or(0);
        self.pending_records_total.set(total);
        self.pending_records_max.set(max);
        let avg = if assigned_partitions == 0 {
            0.0
        } else {
            total as f64 / assigned_partitions as f64
        };
        self.pending_records_avg.set(avg);
    }

    /// Refresh the unassigned-partition gauges.
    pub fn set_unassigned(&self, unassigned: &[i32], total_partitions: i32) {
        self.partitions_unassigned.set(unassigned.len() as i64);
        for partition in 0..total_partitions {
            let flag = i64::from(unassigned.contains(&partition));
            self.partition_unassigned_flag
                .with_label_values(&[&partition.to_string()])
                .set(flag);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_construct_and_survive_duplicate_registration() {
        let first = OutboxMetrics::new("outbox-test");
        // second construction warns but must not panic
        let _second = OutboxMetrics::new("outbox-test");

        first
            .records_count
            .with_label_values(&["new"])
            .set(3);
        first.dispatched.with_label_values(&["completed"]).inc();
    }

    #[test]
    fn pending_gauges_aggregate_per_partition_counts() {
        let metrics = OutboxMetrics::new("outbox-pending-test");
        metrics.set_pending(&[(0, 4), (1, 6), (2, 0)], 4);
        assert_eq!(metrics.pending_records_total.get(), 10);
        assert_eq!(metrics.pending_records_max.get(), 6);
        assert!((metrics.pending_records_avg.get() - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn unassigned_flags_follow_the_partition_list() {
        let metrics = OutboxMetrics::new("outbox-unassigned-test");
        metrics.set_unassigned(&[1, 3], 4);
        assert_eq!(metrics.partitions_unassigned.get(), 2);
        assert_eq!(
            metrics
                .partition_unassigned_flag
                .with_label_values(&["1"])
                .get(),
            1
        );
        assert_eq!(
            metrics
                .partition_unassigned_flag
                .with_label_values(&["0"])
                .get(),
            0
        );
    }
}
