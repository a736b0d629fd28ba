//! Cluster membership: instance registration, heartbeat, stale cleanup.
//!
//! Liveness is database-only; there is no peer network traffic. Each
//! instance owns its own row's mutations, except that any live instance may
//! evict a peer whose heartbeat went stale. Every loop entry point catches
//! and logs its own failures so the scheduler never dies with it.

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Row};
use std::fmt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::OutboxResult;

/// Lifecycle status of a cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Active,
    ShuttingDown,
    Dead,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Active => "ACTIVE",
            InstanceStatus::ShuttingDown => "SHUTTING_DOWN",
            InstanceStatus::Dead => "DEAD",
        }
    }

    pub fn from_db(value: &str) -> anyhow::Result<Self> {
        match value {
            "ACTIVE" => Ok(InstanceStatus::Active),
            "SHUTTING_DOWN" => Ok(InstanceStatus::ShuttingDown),
            "DEAD" => Ok(InstanceStatus::Dead),
            other => Err(anyhow::anyhow!("unknown instance status: {other}")),
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A running member of the delivery cluster.
#[derive(Debug, Clone)]
pub struct OutboxInstance {
    pub id: Uuid,
    pub hostname: String,
    pub port: i32,
    pub status: InstanceStatus,
    pub last_heartbeat_at: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

/// Registry of cluster members, backed by the `outbox_instance` table.
pub struct InstanceRegistry {
    pool: PgPool,
    instance_id: Uuid,
    hostname: String,
    port: i32,
    stale_timeout: Duration,
}

impl InstanceRegistry {
    /// Create the registry for this process. The instance id is generated
    /// once and identifies the process for its whole lifetime.
    pub fn new(
        pool: PgPool,
        hostname: impl Into<String>,
        port: i32,
        stale_instance_timeout_secs: i64,
    ) -> Self {
        Self {
            pool,
            instance_id: Uuid::new_v4(),
            hostname: hostname.into(),
            port,
            stale_timeout: Duration::seconds(stale_instance_timeout_secs),
        }
    }

    pub fn current_instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Insert the local instance row. Idempotent across retries: a replayed
    /// insert refreshes the heartbeat instead of failing.
    pub async fn register_instance(&self) -> OutboxResult<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox_instance (id, hostname, port, status, last_heartbeat_at, registered_at)
            VALUES ($1, $2, $3, 'ACTIVE', NOW(), NOW())
            ON CONFLICT (id) DO UPDATE SET
                status = 'ACTIVE',
                last_heartbeat_at = NOW()
            "#,
        )
        .bind(self.instance_id)
        .bind(&self.hostname)
        .bind(self.port)
        .execute(&self.pool)
        .await
        .context("Failed to register instance")?;

        info!(
            instance_id = %self.instance_id,
            hostname = %self.hostname,
            port = self.port,
            "Instance registered"
        );

        Ok(())
    }

    /// Heartbeat the local row and evict stale peers. Invoked on a timer;
    /// never fails into the caller, the next tick recovers.
    pub async fn perform_heartbeat_and_cleanup(&self) {
        if let Err(e) = self.heartbeat().await {
            warn!(
                instance_id = %self.instance_id,
                error = ?e,
                "Heartbeat failed"
            );
        }
        self.cleanup_stale_instances().await;
    }

    async fn heartbeat(&self) -> OutboxResult<()> {
        let result = sqlx::query(
            r#"UPDATE outbox_instance SET last_heartbeat_at = NOW() WHERE id = $1"#,
        )
        .bind(self.instance_id)
        .execute(&self.pool)
        .await
        .context("Failed to update heartbeat")?;

        if result.rows_affected() == 0 {
            // our row was evicted (e.g. after a long GC pause); re-register
            warn!(
                instance_id = %self.instance_id,
                "Own instance row missing, re-registering"
            );
            self.register_instance().await?;
        } else {
            debug!(instance_id = %self.instance_id, "Heartbeat updated");
        }

        Ok(())
    }

    /// Evict peers whose heartbeat is older than the stale timeout.
    /// Cleanup is best-effort: failures on one peer do not stop the rest.
    async fn cleanup_stale_instances(&self) {
        let cutoff = Utc::now() - self.stale_timeout;
        let stale = match self.find_stale_instances(cutoff).await {
            Ok(stale) => stale,
            Err(e) => {
                warn!(error = ?e, "Failed to query stale instances");
                return;
            }
        };

        for stale_id in stale {
            if let Err(e) = self.evict(stale_id).await {
                warn!(
                    stale_instance_id = %stale_id,
                    error = ?e,
                    "Failed to evict stale instance"
                );
            } else {
                info!(
                    stale_instance_id = %stale_id,
                    "Evicted stale instance"
                );
            }
        }
    }

    async fn find_stale_instances(&self, cutoff: DateTime<Utc>) -> OutboxResult<Vec<Uuid>> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM outbox_instance
            WHERE last_heartbeat_at < $1 AND id <> $2
            "#,
        )
        .bind(cutoff)
        .bind(self.instance_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch stale instances")?;

        rows.into_iter()
            .map(|row| row.try_get("id").map_err(crate::error::OutboxError::from))
            .collect()
    }

    async fn evict(&self, stale_id: Uuid) -> OutboxResult<()> {
        sqlx::query(r#"UPDATE outbox_instance SET status = 'DEAD' WHERE id = $1"#)
            .bind(stale_id)
            .execute(&self.pool)
            .await
            .context("Failed to mark instance dead")?;

        sqlx::query(r#"DELETE FROM outbox_instance WHERE id = $1"#)
            .bind(stale_id)
            .execute(&self.pool)
            .await
            .context("Failed to delete dead instance")?;

        Ok(())
    }

    /// Transition the local instance to SHUTTING_DOWN and remove its row.
    pub async fn graceful_shutdown(&self) -> OutboxResult<()> {
        sqlx::query(r#"UPDATE outbox_instance SET status = 'SHUTTING_DOWN' WHERE id = $1"#)
            .bind(self.instance_id)
            .execute(&self.pool)
            .await
            .context("Failed to mark instance shutting down")?;

        sqlx::query(r#"DELETE FROM outbox_instance WHERE id = $1"#)
            .bind(self.instance_id)
            .execute(&self.pool)
            .await
            .context("Failed to deregister instance")?;

        info!(instance_id = %self.instance_id, "Instance deregistered");

        Ok(())
    }

    /// All instances currently marked ACTIVE, ordered by id for
    /// deterministic partition assignment.
    pub async fn get_active_instances(&self) -> OutboxResult<Vec<OutboxInstance>> {
        let rows = sqlx::query(
            r#"
            SELECT id, hostname, port, status, last_heartbeat_at, registered_at
            FROM outbox_instance
            WHERE status = 'ACTIVE'
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch active instances")?;

        rows.iter()
            .map(|row| {
                let status: String = row.try_get("status")?;
                Ok(OutboxInstance {
                    id: row.try_get("id")?,
                    hostname: row.try_get("hostname")?,
                    port: row.try_get("port")?,
                    status: InstanceStatus::from_db(&status)?,
                    last_heartbeat_at: row.try_get("last_heartbeat_at")?,
                    registered_at: row.try_get("registered_at")?,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()
            .context("Failed to parse instance rows")
            .map_err(Into::into)
    }

    pub async fn is_instance_active(&self, id: Uuid) -> OutboxResult<bool> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM outbox_instance WHERE id = $1 AND status = 'ACTIVE'
            ) AS active
            "#,
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to check instance liveness")?;

        Ok(row.try_get("active").unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_db_representation() {
        for status in [
            InstanceStatus::Active,
            InstanceStatus::ShuttingDown,
            InstanceStatus::Dead,
        ] {
            assert_eq!(InstanceStatus::from_db(status.as_str()).unwrap(), status);
        }
        assert!(InstanceStatus::from_db("GONE").is_err());
    }
}
