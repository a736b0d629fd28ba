//! Cluster-wide partition assignment.
//!
//! Each partition number maps to exactly one active instance. The target
//! assignment is a pure function of the sorted active set
//! (`owner(p) = instances[p mod n]`), so every instance computes the same
//! picture independently. Persistence makes the assignment observable and
//! stable across ticks; claims are conditional so a partition is never
//! dual-owned while memberships shift.

use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{OutboxError, OutboxResult};
use crate::instance::InstanceRegistry;

/// A persisted `(partition → instance)` claim.
#[derive(Debug, Clone)]
pub struct PartitionAssignment {
    pub partition_no: i32,
    pub instance_id: Uuid,
    pub assigned_at: DateTime<Utc>,
}

/// Deterministic owner of a partition given the sorted active set.
///
/// Returns `None` when the cluster is empty.
pub fn target_owner(partition: i32, sorted_instances: &[Uuid]) -> Option<Uuid> {
    if sorted_instances.is_empty() {
        None
    } else {
        Some(sorted_instances[partition as usize % sorted_instances.len()])
    }
}

/// Owns the `outbox_partition_assignment` rows and reconciles them with the
/// deterministic target on every scheduler tick.
pub struct PartitionCoordinator {
    pool: PgPool,
    registry: Arc<InstanceRegistry>,
    total_partitions: i32,
}

impl PartitionCoordinator {
    pub fn new(pool: PgPool, registry: Arc<InstanceRegistry>, total_partitions: i32) -> Self {
        Self {
            pool,
            registry,
            total_partitions,
        }
    }

    pub fn total_partitions(&self) -> i32 {
        self.total_partitions
    }

    /// Reconcile persisted claims with the deterministic target assignment.
    ///
    /// This instance only writes its own claims: it releases partitions it
    /// holds but no longer targets, and claims targeted partitions whose
    /// current owner is itself, absent, or no longer active. Partitions
    /// whose new owner has not claimed them yet stay unassigned until that
    /// owner's next tick; they are reported, never stolen.
    pub async fn rebalance(&self) -> OutboxResult<()> {
        let self_id = self.registry.current_instance_id();
        let active: Vec<Uuid> = self
            .registry
            .get_active_instances()
            .await?
            .into_iter()
            .map(|i| i.id)
            .collect();

        if active.is_empty() {
            debug!("No active instances, skipping rebalance");
            return Ok(());
        }

        let mut to_claim: Vec<i32> = Vec::new();
        let mut to_release: Vec<i32> = Vec::new();
        let persisted = self.load_assignments().await?;
        let owned: HashMap<i32, Uuid> = persisted
            .iter()
            .map(|a| (a.partition_no, a.instance_id))
            .collect();

        for partition in 0..self.total_partitions {
            let target = target_owner(partition, &active);
            let current = owned.get(&partition).copied();
            match (target, current) {
                (Some(target), current) if target == self_id => {
                    if current != Some(self_id) {
                        to_claim.push(partition);
                    }
                }
                (Some(_), Some(current)) if current == self_id => {
                    // yield: we hold a claim we no longer target
                    to_release.push(partition);
                }
                _ => {}
            }
        }

        if to_claim.is_empty() && to_release.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin rebalance transaction")?;

        if !to_release.is_empty() {
            sqlx::query(
                r#"
                DELETE FROM outbox_partition_assignment
                WHERE instance_id = $1 AND partition_no = ANY($2)
                "#,
            )
            .bind(self_id)
            .bind(&to_release)
            .execute(&mut *tx)
            .await
            .context("Failed to release partitions")?;
        }

        for partition in &to_claim {
            // CAS-like claim: never overwrite a live peer's assignment
            sqlx::query(
                r#"
                INSERT INTO outbox_partition_assignment (partition_no, instance_id, assigned_at)
                VALUES ($1, $2, NOW())
                ON CONFLICT (partition_no) DO UPDATE SET
                    instance_id = EXCLUDED.instance_id,
                    assigned_at = NOW()
                WHERE outbox_partition_assignment.instance_id = $2
                   OR outbox_partition_assignment.instance_id <> ALL($3)
                "#,
            )
            .bind(partition)
            .bind(self_id)
            .bind(&active)
            .execute(&mut *tx)
            .await
            .context("Failed to claim partition")?;
        }

        tx.commit()
            .await
            .context("Failed to commit rebalance transaction")?;

        info!(
            instance_id = %self_id,
            claimed = to_claim.len(),
            released = to_release.len(),
            "Partition assignment reconciled"
        );

        Ok(())
    }

    /// Partitions whose persisted owner is the local instance.
    pub async fn assigned_partition_numbers(&self) -> OutboxResult<Vec<i32>> {
        let rows = sqlx::query(
            r#"
            SELECT partition_no FROM outbox_partition_assignment
            WHERE instance_id = $1
            ORDER BY partition_no ASC
            "#,
        )
        .bind(self.registry.current_instance_id())
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch assigned partitions")?;

        rows.into_iter()
            .map(|row| row.try_get("partition_no").map_err(OutboxError::from))
            .collect()
    }

    /// Drop every claim held by the local instance. Called on graceful
    /// shutdown so peers can take over without waiting out the heartbeat.
    pub async fn release_assignments(&self) -> OutboxResult<()> {
        let result = sqlx::query(
            r#"DELETE FROM outbox_partition_assignment WHERE instance_id = $1"#,
        )
        .bind(self.registry.current_instance_id())
        .execute(&self.pool)
        .await
        .context("Failed to release partition assignments")?;

        info!(
            instance_id = %self.registry.current_instance_id(),
            released = result.rows_affected(),
            "Partition assignments released"
        );

        Ok(())
    }

    /// Partitions without a claim from a currently active instance.
    /// Surfaced in metrics; harmless, their owner claims them next tick.
    pub async fn unassigned_partitions(&self) -> OutboxResult<Vec<i32>> {
        let active: Vec<Uuid> = self
            .registry
            .get_active_instances()
            .await?
            .into_iter()
            .map(|i| i.id)
            .collect();
        let persisted = self.load_assignments().await?;
        let owned: HashMap<i32, Uuid> = persisted
            .iter()
            .map(|a| (a.partition_no, a.instance_id))
            .collect();

        Ok((0..self.total_partitions)
            .filter(|partition| match owned.get(partition) {
                Some(owner) => !active.contains(owner),
                None => true,
            })
            .collect())
    }

    async fn load_assignments(&self) -> OutboxResult<Vec<PartitionAssignment>> {
        let rows = sqlx::query(
            r#"
            SELECT partition_no, instance_id, assigned_at
            FROM outbox_partition_assignment
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to load partition assignments")?;

        rows.into_iter()
            .map(|row| {
                Ok(PartitionAssignment {
                    partition_no: row.try_get("partition_no")?,
                    instance_id: row.try_get("instance_id")?,
                    assigned_at: row.try_get("assigned_at")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(OutboxError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = (0..n).map(|_| Uuid::new_v4()).collect();
        ids.sort();
        ids
    }

    #[test]
    fn empty_cluster_owns_nothing() {
        assert_eq!(target_owner(0, &[]), None);
        assert_eq!(target_owner(63, &[]), None);
    }

    #[test]
    fn single_instance_owns_every_partition() {
        let instances = ids(1);
        for partition in 0..64 {
            assert_eq!(target_owner(partition, &instances), Some(instances[0]));
        }
    }

    #[test]
    fn partitions_round_robin_over_the_sorted_set() {
        let instances = ids(3);
        for partition in 0..64 {
            assert_eq!(
                target_owner(partition, &instances),
                Some(instances[partition as usize % 3])
            );
        }
    }

    #[test]
    fn every_instance_computes_the_same_assignment() {
        let instances = ids(5);
        let mut shuffled = instances.clone();
        shuffled.reverse();
        shuffled.sort(); // any instance sorts before computing
        for partition in 0..64 {
            assert_eq!(
                target_owner(partition, &instances),
                target_owner(partition, &shuffled)
            );
        }
    }

    #[test]
    fn all_partitions_are_covered_when_cluster_is_non_empty() {
        let instances = ids(4);
        for partition in 0..256 {
            assert!(target_owner(partition, &instances).is_some());
        }
    }
}
