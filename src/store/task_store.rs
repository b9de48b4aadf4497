//! Persistent store of task rows.
//!
//! Enforces the task state machine (all transitions are conditional updates
//! predicated on the expected source state) and idempotent creation (the
//! duplicate-key race resolves by catching the unique violation and
//! re-reading on a fresh statement snapshot).

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde_json::Value;
use sqlx::{Acquire, PgConnection};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::config::AsyncGateConfig;
use crate::error::{is_unique_violation, EngineError, Result};
use crate::models::{
    Principal, PrincipalKind, Task, TaskOutcome, TaskRequirements, TaskResult, TaskSpec, TaskStatus,
};

const TASK_COLUMNS: &str = "tenant_id, task_id, task_type, payload, created_by_kind, \
     created_by_id, requirements, priority, status, attempt, max_attempts, \
     retry_backoff_seconds, idempotency_key, created_at, updated_at, next_eligible_at, \
     progress, result_outcome, result_data, result_error, result_artifacts, completed_at";

/// Optional predicates for task listing.
#[derive(Debug, Clone, Default)]
pub struct TaskFilters {
    pub status: Option<TaskStatus>,
    pub task_type: Option<String>,
    pub created_by_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TaskStore {
    config: AsyncGateConfig,
}

impl TaskStore {
    pub fn new(config: AsyncGateConfig) -> Self {
        Self { config }
    }

    /// Insert a new queued task. If `idempotency_key` matches an existing
    /// task in the tenant, that task is returned and nothing is inserted.
    ///
    /// Runs the insert inside its own nested transaction so a unique
    /// violation aborts only the insert; the follow-up read is a new
    /// statement and therefore sees a fresh snapshot under READ COMMITTED,
    /// including the row the concurrent winner committed.
    #[instrument(skip(self, conn, spec), fields(tenant_id = %tenant_id))]
    pub async fn create(
        &self,
        conn: &mut PgConnection,
        tenant_id: Uuid,
        created_by: &Principal,
        spec: &TaskSpec,
        idempotency_key: Option<&str>,
    ) -> Result<Task> {
        let now = Utc::now();
        let task_id = Uuid::new_v4();
        let next_eligible_at = spec
            .delay_seconds
            .filter(|d| *d > 0)
            .map(|d| now + Duration::seconds(d));
        let requirements = serde_json::to_value(&spec.requirements)?;

        let mut sp = conn.begin().await?;

        let insert = sqlx::query_as::<_, TaskRow>(&format!(
            r#"
            INSERT INTO asyncgate_tasks (
                tenant_id, task_id, task_type, payload, created_by_kind, created_by_id,
                requirements, priority, status, attempt, max_attempts,
                retry_backoff_seconds, idempotency_key, created_at, updated_at, next_eligible_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'queued', 1, $9, $10, $11, $12, $12, $13)
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(tenant_id)
        .bind(task_id)
        .bind(&spec.task_type)
        .bind(&spec.payload)
        .bind(created_by.kind.to_string())
        .bind(&created_by.id)
        .bind(&requirements)
        .bind(spec.priority.unwrap_or(self.config.default_priority))
        .bind(spec.max_attempts.unwrap_or(self.config.default_max_attempts).max(1))
        .bind(
            spec.retry_backoff_seconds
                .unwrap_or(self.config.default_retry_backoff_seconds),
        )
        .bind(idempotency_key)
        .bind(now)
        .bind(next_eligible_at)
        .fetch_one(&mut *sp)
        .await;

        match insert {
            Ok(row) => {
                sp.commit().await?;
                row_to_task(row)
            }
            Err(e) if is_unique_violation(&e, "uq_asyncgate_task_idempotency") => {
                sp.rollback().await?;
                let key = idempotency_key.ok_or_else(|| EngineError::Database {
                    operation: "create_task".to_string(),
                    reason: e.to_string(),
                })?;
                debug!(key = key, "Idempotency key collision, re-reading existing task");
                self.get_by_idempotency_key(conn, tenant_id, key)
                    .await?
                    .ok_or_else(|| EngineError::IdempotencyConflict {
                        key: key.to_string(),
                    })
            }
            Err(e) => {
                sp.rollback().await?;
                Err(e.into())
            }
        }
    }

    pub async fn get(
        &self,
        conn: &mut PgConnection,
        tenant_id: Uuid,
        task_id: Uuid,
    ) -> Result<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM asyncgate_tasks WHERE tenant_id = $1 AND task_id = $2"
        ))
        .bind(tenant_id)
        .bind(task_id)
        .fetch_optional(&mut *conn)
        .await?;

        row.map(row_to_task).transpose()
    }

    pub async fn get_by_idempotency_key(
        &self,
        conn: &mut PgConnection,
        tenant_id: Uuid,
        key: &str,
    ) -> Result<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM asyncgate_tasks WHERE tenant_id = $1 AND idempotency_key = $2"
        ))
        .bind(tenant_id)
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?;

        row.map(row_to_task).transpose()
    }

    /// List tasks newest first. Pagination is keyed by `(created_at,
    /// task_id)` tuple comparison so pages stay stable under concurrent
    /// inserts; the cursor is the last returned task id.
    pub async fn list(
        &self,
        conn: &mut PgConnection,
        tenant_id: Uuid,
        filters: &TaskFilters,
        cursor: Option<Uuid>,
        limit: i64,
    ) -> Result<(Vec<Task>, Option<Uuid>)> {
        let cursor_position = match cursor {
            Some(cursor_id) => self.cursor_position(conn, tenant_id, cursor_id).await?,
            None => None,
        };
        let (cursor_at, cursor_id) = cursor_position.unzip();

        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            r#"
            SELECT {TASK_COLUMNS} FROM asyncgate_tasks
            WHERE tenant_id = $1
              AND ($2::text IS NULL OR status = $2)
              AND ($3::text IS NULL OR task_type = $3)
              AND ($4::text IS NULL OR created_by_id = $4)
              AND ($5::timestamptz IS NULL OR (created_at, task_id) < ($5, $6))
            ORDER BY created_at DESC, task_id DESC
            LIMIT $7
            "#
        ))
        .bind(tenant_id)
        .bind(filters.status.map(|s| s.to_string()))
        .bind(filters.task_type.as_deref())
        .bind(filters.created_by_id.as_deref())
        .bind(cursor_at)
        .bind(cursor_id)
        .bind(limit + 1)
        .fetch_all(&mut *conn)
        .await?;

        let has_more = rows.len() as i64 > limit;
        let tasks = rows
            .into_iter()
            .take(limit as usize)
            .map(row_to_task)
            .collect::<Result<Vec<_>>>()?;
        let next_cursor = if has_more {
            tasks.last().map(|t| t.task_id)
        } else {
            None
        };

        Ok((tasks, next_cursor))
    }

    async fn cursor_position(
        &self,
        conn: &mut PgConnection,
        tenant_id: Uuid,
        cursor_id: Uuid,
    ) -> Result<Option<(DateTime<Utc>, Uuid)>> {
        let row: Option<(DateTime<Utc>,)> = sqlx::query_as(
            "SELECT created_at FROM asyncgate_tasks WHERE tenant_id = $1 AND task_id = $2",
        )
        .bind(tenant_id)
        .bind(cursor_id)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(row.map(|(created_at,)| (created_at, cursor_id)))
    }

    /// Conditional state update. Returns whether the transition occurred;
    /// a concurrent writer that moved the task out of `expected_from` first
    /// makes this a no-op rather than an error.
    #[instrument(skip(self, conn, result), fields(tenant_id = %tenant_id, task_id = %task_id))]
    pub async fn transition(
        &self,
        conn: &mut PgConnection,
        tenant_id: Uuid,
        task_id: Uuid,
        expected_from: TaskStatus,
        to: TaskStatus,
        result: Option<&TaskResult>,
    ) -> Result<bool> {
        if !expected_from.can_transition_to(to) {
            return Err(EngineError::InvalidStateTransition {
                task_id,
                from: expected_from.to_string(),
                to: to.to_string(),
            });
        }

        let now = Utc::now();
        let updated = match result {
            Some(result) => {
                sqlx::query(
                    r#"
                    UPDATE asyncgate_tasks
                    SET status = $3, updated_at = $4,
                        result_outcome = $5, result_data = $6, result_error = $7,
                        result_artifacts = $8, completed_at = $9,
                        next_eligible_at = NULL
                    WHERE tenant_id = $1 AND task_id = $2 AND status = $10
                    "#,
                )
                .bind(tenant_id)
                .bind(task_id)
                .bind(to.to_string())
                .bind(now)
                .bind(result.outcome.to_string())
                .bind(&result.result)
                .bind(&result.error)
                .bind(&result.artifacts)
                .bind(result.completed_at)
                .bind(expected_from.to_string())
                .execute(&mut *conn)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE asyncgate_tasks
                    SET status = $3, updated_at = $4
                    WHERE tenant_id = $1 AND task_id = $2 AND status = $5
                    "#,
                )
                .bind(tenant_id)
                .bind(task_id)
                .bind(to.to_string())
                .bind(now)
                .bind(expected_from.to_string())
                .execute(&mut *conn)
                .await?
            }
        };

        Ok(updated.rows_affected() > 0)
    }

    /// Requeue after a retryable worker failure. Increments `attempt` and
    /// applies exponential backoff with jitter; flips to `failed` instead
    /// when the increment would exceed `max_attempts`.
    #[instrument(skip(self, conn), fields(tenant_id = %tenant_id, task_id = %task_id))]
    pub async fn requeue_with_backoff(
        &self,
        conn: &mut PgConnection,
        tenant_id: Uuid,
        task_id: Uuid,
    ) -> Result<Task> {
        let task = self
            .get(conn, tenant_id, task_id)
            .await?
            .ok_or(EngineError::TaskNotFound { task_id })?;

        let next_attempt = task.attempt + 1;
        if next_attempt > task.max_attempts {
            let result = TaskResult {
                outcome: TaskOutcome::Failed,
                result: None,
                error: Some(serde_json::json!({
                    "reason": "max_attempts_exhausted",
                    "attempt": task.attempt,
                    "max_attempts": task.max_attempts,
                })),
                artifacts: None,
                completed_at: Utc::now(),
            };
            self.transition(conn, tenant_id, task_id, task.status, TaskStatus::Failed, Some(&result))
                .await?;
            return self
                .get(conn, tenant_id, task_id)
                .await?
                .ok_or(EngineError::TaskNotFound { task_id });
        }

        let now = Utc::now();
        let backoff = retry_backoff_seconds(
            task.retry_backoff_seconds,
            next_attempt,
            self.config.max_retry_backoff_seconds,
        );
        let jitter_ms = rand::thread_rng().gen_range(0..=(backoff * 100).max(1));
        let next_eligible_at = now + Duration::seconds(backoff) + Duration::milliseconds(jitter_ms);

        sqlx::query(
            r#"
            UPDATE asyncgate_tasks
            SET status = 'queued', attempt = $3, next_eligible_at = $4, updated_at = $5
            WHERE tenant_id = $1 AND task_id = $2 AND status = 'leased'
            "#,
        )
        .bind(tenant_id)
        .bind(task_id)
        .bind(next_attempt)
        .bind(next_eligible_at)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        self.get(conn, tenant_id, task_id)
            .await?
            .ok_or(EngineError::TaskNotFound { task_id })
    }

    /// Store the latest progress snapshot for a task. History lives in the
    /// receipt stream; this column carries only the current value, read
    /// back on task fetches.
    pub async fn update_progress(
        &self,
        conn: &mut PgConnection,
        tenant_id: Uuid,
        task_id: Uuid,
        progress: &Value,
    ) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE asyncgate_tasks
            SET progress = $3, updated_at = $4
            WHERE tenant_id = $1 AND task_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(task_id)
        .bind(progress)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;

        Ok(updated.rows_affected() > 0)
    }

    /// Requeue after lease expiry. Lease expiry is lost authority, not
    /// failure, so `attempt` is untouched; a small jitter spreads requeue
    /// eligibility when many leases expire in one sweep.
    #[instrument(skip(self, conn), fields(tenant_id = %tenant_id, task_id = %task_id))]
    pub async fn requeue_on_expiry(
        &self,
        conn: &mut PgConnection,
        tenant_id: Uuid,
        task_id: Uuid,
    ) -> Result<bool> {
        let now = Utc::now();
        let jitter_ms = rand::thread_rng().gen_range(0..=5000);
        let next_eligible_at = now + Duration::milliseconds(jitter_ms);

        let updated = sqlx::query(
            r#"
            UPDATE asyncgate_tasks
            SET status = 'queued', next_eligible_at = $3, updated_at = $4
            WHERE tenant_id = $1 AND task_id = $2 AND status = 'leased'
            "#,
        )
        .bind(tenant_id)
        .bind(task_id)
        .bind(next_eligible_at)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        Ok(updated.rows_affected() > 0)
    }
}

/// Exponential backoff: `base * 2^(attempt-1)`, capped.
pub fn retry_backoff_seconds(base_seconds: i32, attempt: i32, cap_seconds: i64) -> i64 {
    let exponent = (attempt - 1).clamp(0, 30) as u32;
    let backoff = (base_seconds.max(0) as i64).saturating_mul(1i64 << exponent);
    backoff.min(cap_seconds)
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    tenant_id: Uuid,
    task_id: Uuid,
    task_type: String,
    payload: Value,
    created_by_kind: String,
    created_by_id: String,
    requirements: Value,
    priority: i32,
    status: String,
    attempt: i32,
    max_attempts: i32,
    retry_backoff_seconds: i32,
    idempotency_key: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    next_eligible_at: Option<DateTime<Utc>>,
    progress: Option<Value>,
    result_outcome: Option<String>,
    result_data: Option<Value>,
    result_error: Option<Value>,
    result_artifacts: Option<Value>,
    completed_at: Option<DateTime<Utc>>,
}

fn row_to_task(row: TaskRow) -> Result<Task> {
    let status: TaskStatus = row.status.parse().map_err(decode_error)?;
    let created_by_kind: PrincipalKind = row.created_by_kind.parse().map_err(decode_error)?;
    let requirements: TaskRequirements = serde_json::from_value(row.requirements)?;

    let result = match (row.result_outcome, row.completed_at) {
        (Some(outcome), Some(completed_at)) => Some(TaskResult {
            outcome: outcome.parse().map_err(decode_error)?,
            result: row.result_data,
            error: row.result_error,
            artifacts: row.result_artifacts,
            completed_at,
        }),
        _ => None,
    };

    Ok(Task {
        task_id: row.task_id,
        tenant_id: row.tenant_id,
        task_type: row.task_type,
        payload: row.payload,
        created_by: Principal {
            kind: created_by_kind,
            id: row.created_by_id,
        },
        requirements,
        priority: row.priority,
        status,
        attempt: row.attempt,
        max_attempts: row.max_attempts,
        retry_backoff_seconds: row.retry_backoff_seconds,
        idempotency_key: row.idempotency_key,
        created_at: row.created_at,
        updated_at: row.updated_at,
        next_eligible_at: row.next_eligible_at,
        progress: row.progress,
        result,
    })
}

fn decode_error(e: String) -> EngineError {
    EngineError::Database {
        operation: "decode".to_string(),
        reason: e,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        assert_eq!(retry_backoff_seconds(15, 1, 900), 15);
        assert_eq!(retry_backoff_seconds(15, 2, 900), 30);
        assert_eq!(retry_backoff_seconds(15, 3, 900), 60);
        assert_eq!(retry_backoff_seconds(15, 7, 900), 900);
        assert_eq!(retry_backoff_seconds(15, 40, 900), 900);
    }

    #[test]
    fn backoff_handles_degenerate_inputs() {
        assert_eq!(retry_backoff_seconds(0, 5, 900), 0);
        assert_eq!(retry_backoff_seconds(15, 0, 900), 15);
    }
}
