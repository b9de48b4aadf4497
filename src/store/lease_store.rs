//! Persistent store of lease rows.
//!
//! The single-active-lease invariant is structural: `UNIQUE (tenant_id,
//! task_id)` plus deletion on release and sweep means at most one lease row
//! exists per task. Claiming locks candidate task rows with `FOR UPDATE SKIP
//! LOCKED` so concurrent workers partition the queue instead of serialising
//! on it; the capability-subset check is pushed into the claim predicate so
//! non-matching rows are never locked at all.

use chrono::{DateTime, Duration, Utc};
use sqlx::PgConnection;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::config::AsyncGateConfig;
use crate::error::{EngineError, Result};
use crate::models::Lease;

const LEASE_COLUMNS: &str =
    "tenant_id, lease_id, task_id, worker_id, acquired_at, expires_at, renewal_count";

#[derive(Debug, Clone)]
pub struct LeaseStore {
    config: AsyncGateConfig,
}

impl LeaseStore {
    pub fn new(config: AsyncGateConfig) -> Self {
        Self { config }
    }

    /// Atomically claim up to `max_tasks` eligible queued tasks for a
    /// worker. Must be called inside a transaction: the row locks taken by
    /// the candidate select are held until the caller commits, which is what
    /// makes the lease insert plus `queued -> leased` flip atomic per task.
    ///
    /// Ordering is `(priority DESC, created_at ASC)` with `task_id` breaking
    /// ties for determinism.
    #[instrument(skip(self, conn, capabilities), fields(tenant_id = %tenant_id, worker_id = worker_id))]
    pub async fn claim_next(
        &self,
        conn: &mut PgConnection,
        tenant_id: Uuid,
        worker_id: &str,
        capabilities: &[String],
        max_tasks: i64,
        ttl_seconds: Option<i64>,
    ) -> Result<Vec<Lease>> {
        let now = Utc::now();
        let ttl = ttl_seconds
            .unwrap_or(self.config.default_lease_ttl_seconds)
            .clamp(1, self.config.max_lease_ttl_seconds);
        let expires_at = now + Duration::seconds(ttl);
        let capabilities_json = serde_json::to_value(capabilities)?;

        let candidates: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT task_id FROM asyncgate_tasks
            WHERE tenant_id = $1
              AND status = 'queued'
              AND (next_eligible_at IS NULL OR next_eligible_at <= $2)
              AND (
                    requirements->'capabilities' IS NULL
                 OR requirements->'capabilities' = '[]'::jsonb
                 OR requirements->'capabilities' <@ $3::jsonb
              )
            ORDER BY priority DESC, created_at ASC, task_id ASC
            LIMIT $4
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(tenant_id)
        .bind(now)
        .bind(&capabilities_json)
        .bind(max_tasks)
        .fetch_all(&mut *conn)
        .await?;

        let mut leases = Vec::with_capacity(candidates.len());
        for (task_id,) in candidates {
            let lease_id = Uuid::new_v4();
            sqlx::query(
                r#"
                INSERT INTO asyncgate_leases
                    (tenant_id, lease_id, task_id, worker_id, acquired_at, expires_at, renewal_count)
                VALUES ($1, $2, $3, $4, $5, $6, 0)
                "#,
            )
            .bind(tenant_id)
            .bind(lease_id)
            .bind(task_id)
            .bind(worker_id)
            .bind(now)
            .bind(expires_at)
            .execute(&mut *conn)
            .await?;

            sqlx::query(
                r#"
                UPDATE asyncgate_tasks SET status = 'leased', updated_at = $3
                WHERE tenant_id = $1 AND task_id = $2 AND status = 'queued'
                "#,
            )
            .bind(tenant_id)
            .bind(task_id)
            .bind(now)
            .execute(&mut *conn)
            .await?;

            leases.push(Lease {
                lease_id,
                tenant_id,
                task_id,
                worker_id: worker_id.to_string(),
                acquired_at: now,
                expires_at,
                renewal_count: 0,
            });
        }

        if !leases.is_empty() {
            debug!(claimed = leases.len(), "Claimed tasks for worker");
        }

        Ok(leases)
    }

    /// The lease iff it matches task, id, and worker and is unexpired.
    /// Pure read; authority checks in mutating operations are re-asserted by
    /// compare-and-set predicates at write time.
    pub async fn validate(
        &self,
        conn: &mut PgConnection,
        tenant_id: Uuid,
        task_id: Uuid,
        lease_id: Uuid,
        worker_id: &str,
    ) -> Result<Option<Lease>> {
        let row = sqlx::query_as::<_, LeaseRow>(&format!(
            r#"
            SELECT {LEASE_COLUMNS} FROM asyncgate_leases
            WHERE tenant_id = $1 AND task_id = $2 AND lease_id = $3
              AND worker_id = $4 AND expires_at > $5
            "#
        ))
        .bind(tenant_id)
        .bind(task_id)
        .bind(lease_id)
        .bind(worker_id)
        .bind(Utc::now())
        .fetch_optional(&mut *conn)
        .await?;

        Ok(row.map(Lease::from))
    }

    /// Extend a valid lease, respecting the renewal-count and absolute
    /// lifetime caps. The update predicate re-checks `expires_at > now` so a
    /// lease that expired between validation and write cannot resurrect: the
    /// sweeper wins that race and this returns `LeaseInvalidOrExpired`.
    #[instrument(skip(self, conn), fields(tenant_id = %tenant_id, task_id = %task_id, lease_id = %lease_id))]
    pub async fn renew(
        &self,
        conn: &mut PgConnection,
        tenant_id: Uuid,
        task_id: Uuid,
        lease_id: Uuid,
        worker_id: &str,
        extend_by_seconds: Option<i64>,
    ) -> Result<Lease> {
        let now = Utc::now();
        let extend_by = extend_by_seconds
            .unwrap_or(self.config.default_lease_ttl_seconds)
            .clamp(1, self.config.max_lease_ttl_seconds);

        let current = sqlx::query_as::<_, LeaseRow>(&format!(
            r#"
            SELECT {LEASE_COLUMNS} FROM asyncgate_leases
            WHERE tenant_id = $1 AND task_id = $2 AND lease_id = $3 AND worker_id = $4
            "#
        ))
        .bind(tenant_id)
        .bind(task_id)
        .bind(lease_id)
        .bind(worker_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(EngineError::LeaseInvalidOrExpired { task_id, lease_id })?;

        if current.expires_at <= now {
            return Err(EngineError::LeaseInvalidOrExpired { task_id, lease_id });
        }
        if current.renewal_count + 1 > self.config.max_lease_renewals {
            return Err(EngineError::RenewalLimitExceeded {
                lease_id,
                renewal_count: current.renewal_count,
            });
        }
        let new_expires_at = now + Duration::seconds(extend_by);
        let lifetime = new_expires_at - current.acquired_at;
        if lifetime.num_seconds() > self.config.max_lease_lifetime_seconds {
            return Err(EngineError::LifetimeExceeded { lease_id });
        }

        let row = sqlx::query_as::<_, LeaseRow>(&format!(
            r#"
            UPDATE asyncgate_leases
            SET expires_at = $5, renewal_count = renewal_count + 1
            WHERE tenant_id = $1 AND task_id = $2 AND lease_id = $3 AND worker_id = $4
              AND expires_at > $6
            RETURNING {LEASE_COLUMNS}
            "#
        ))
        .bind(tenant_id)
        .bind(task_id)
        .bind(lease_id)
        .bind(worker_id)
        .bind(new_expires_at)
        .bind(now)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(EngineError::LeaseInvalidOrExpired { task_id, lease_id })?;

        Ok(Lease::from(row))
    }

    /// Remove the active lease for a task, if any.
    pub async fn release(
        &self,
        conn: &mut PgConnection,
        tenant_id: Uuid,
        task_id: Uuid,
    ) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM asyncgate_leases WHERE tenant_id = $1 AND task_id = $2")
            .bind(tenant_id)
            .bind(task_id)
            .execute(&mut *conn)
            .await?;
        Ok(deleted.rows_affected() > 0)
    }

    /// Expired leases across all tenants, oldest expiry first. Sweeper only.
    pub async fn get_expired(
        &self,
        conn: &mut PgConnection,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Lease>> {
        let rows = sqlx::query_as::<_, LeaseRow>(&format!(
            r#"
            SELECT {LEASE_COLUMNS} FROM asyncgate_leases
            WHERE expires_at <= $1
            ORDER BY expires_at ASC
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *conn)
        .await?;

        Ok(rows.into_iter().map(Lease::from).collect())
    }
}

#[derive(sqlx::FromRow)]
struct LeaseRow {
    tenant_id: Uuid,
    lease_id: Uuid,
    task_id: Uuid,
    worker_id: String,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    renewal_count: i32,
}

impl From<LeaseRow> for Lease {
    fn from(row: LeaseRow) -> Self {
        Lease {
            lease_id: row.lease_id,
            tenant_id: row.tenant_id,
            task_id: row.task_id,
            worker_id: row.worker_id,
            acquired_at: row.acquired_at,
            expires_at: row.expires_at,
            renewal_count: row.renewal_count,
        }
    }
}
