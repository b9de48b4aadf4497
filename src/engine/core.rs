//! # Task Engine
//!
//! The orchestration layer composing the three stores. Every operation that
//! mutates task state and emits receipts runs inside a savepoint-scoped
//! atomic block: the outer transaction brackets the operation, a nested
//! transaction (Postgres SAVEPOINT) brackets the mutation-plus-receipts so
//! partial states are never observable. Read-only validation (lease
//! ownership, task existence, authorization) happens before the savepoint to
//! keep lock windows short.
//!
//! The engine behaves identically regardless of facade: HTTP and in-process
//! tool bindings both compile to these operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Acquire, PgPool, Row};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::{AsyncGateConfig, ConfigSnapshot};
use crate::engine::obligations::{ObligationQuery, OpenObligationsPage};
use crate::error::{EngineError, Result};
use crate::models::{
    bodies, Lease, Principal, PrincipalKind, Receipt, ReceiptSpec, ReceiptType, Task, TaskOutcome,
    TaskResult, TaskSpec, TaskStatus,
};
use crate::store::receipt_ledger::ReceiptFilters;
use crate::store::{LeaseStore, ReceiptLedger, TaskFilters, TaskStore};

/// A claimed task together with its fresh lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimedWork {
    pub task: Task,
    pub lease: Lease,
}

/// Outcome of a worker `fail` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailOutcome {
    pub requeued: bool,
    pub next_eligible_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPage {
    pub tasks: Vec<Task>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptPage {
    pub receipts: Vec<Receipt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct TaskEngine {
    pool: PgPool,
    config: AsyncGateConfig,
    tasks: TaskStore,
    leases: LeaseStore,
    receipts: ReceiptLedger,
    obligations: ObligationQuery,
}

impl TaskEngine {
    pub fn new(pool: PgPool, config: AsyncGateConfig) -> Self {
        Self {
            tasks: TaskStore::new(config.clone()),
            leases: LeaseStore::new(config.clone()),
            receipts: ReceiptLedger::new(config.clone()),
            obligations: ObligationQuery::new(config.clone()),
            pool,
            config,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn config(&self) -> &AsyncGateConfig {
        &self.config
    }

    // =========================================================================
    // Agent-facing operations
    // =========================================================================

    /// Create a task and record the `task.assigned` obligation to its owner.
    /// Idempotent under `idempotency_key`: replays return the original task
    /// and the receipt emission dedups by content hash.
    #[instrument(skip(self, spec), fields(tenant_id = %tenant_id, principal = %principal))]
    pub async fn create_task(
        &self,
        tenant_id: Uuid,
        principal: &Principal,
        spec: TaskSpec,
        idempotency_key: Option<&str>,
    ) -> Result<Task> {
        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.begin().await?;

        let mut sp = tx.begin().await?;
        let task = self
            .tasks
            .create(&mut sp, tenant_id, principal, &spec, idempotency_key)
            .await?;

        let requirements = serde_json::to_value(&task.requirements)?;
        self.receipts
            .create(
                &mut sp,
                tenant_id,
                ReceiptSpec::new(ReceiptType::TaskAssigned, Principal::asyncgate(), principal.clone())
                    .with_task(task.task_id)
                    .with_body(bodies::task_assigned(&task.task_type, &requirements)),
            )
            .await?;
        sp.commit().await?;
        tx.commit().await?;

        info!(task_id = %task.task_id, task_type = %task.task_type, "Task created");
        Ok(task)
    }

    pub async fn get_task(&self, tenant_id: Uuid, task_id: Uuid) -> Result<Task> {
        let mut conn = self.pool.acquire().await?;
        self.tasks
            .get(&mut conn, tenant_id, task_id)
            .await?
            .ok_or(EngineError::TaskNotFound { task_id })
    }

    pub async fn list_tasks(
        &self,
        tenant_id: Uuid,
        filters: &TaskFilters,
        cursor: Option<Uuid>,
        limit: Option<i64>,
    ) -> Result<TaskPage> {
        let limit = self.config.clamp_list_limit(limit);
        let mut conn = self.pool.acquire().await?;
        let (tasks, next_cursor) = self
            .tasks
            .list(&mut conn, tenant_id, filters, cursor, limit)
            .await?;
        Ok(TaskPage { tasks, next_cursor })
    }

    /// Cancel a task. Only the creating principal (or a system principal)
    /// may cancel; terminal tasks are sinks and refuse.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, task_id = %task_id, principal = %principal))]
    pub async fn cancel_task(
        &self,
        tenant_id: Uuid,
        principal: &Principal,
        task_id: Uuid,
        reason: Option<&str>,
    ) -> Result<Task> {
        let mut conn = self.pool.acquire().await?;

        let task = self
            .tasks
            .get(&mut conn, tenant_id, task_id)
            .await?
            .ok_or(EngineError::TaskNotFound { task_id })?;

        if principal.kind != PrincipalKind::System && *principal != task.created_by {
            return Err(EngineError::Unauthorized {
                reason: format!(
                    "{principal} may not cancel task owned by {}",
                    task.created_by
                ),
            });
        }
        if task.is_terminal() {
            return Err(EngineError::InvalidStateTransition {
                task_id,
                from: task.status.to_string(),
                to: TaskStatus::Canceled.to_string(),
            });
        }

        let mut tx = conn.begin().await?;
        let mut sp = tx.begin().await?;

        self.leases.release(&mut sp, tenant_id, task_id).await?;

        let result = TaskResult {
            outcome: TaskOutcome::Canceled,
            result: None,
            error: reason.map(|r| serde_json::json!({ "reason": r })),
            artifacts: None,
            completed_at: Utc::now(),
        };
        let transitioned = self
            .tasks
            .transition(
                &mut sp,
                tenant_id,
                task_id,
                task.status,
                TaskStatus::Canceled,
                Some(&result),
            )
            .await?;
        if !transitioned {
            return Err(EngineError::InvalidStateTransition {
                task_id,
                from: task.status.to_string(),
                to: TaskStatus::Canceled.to_string(),
            });
        }

        let assigned = self
            .receipts
            .latest_of_type_for_task(&mut sp, tenant_id, task_id, ReceiptType::TaskAssigned)
            .await?;
        let parents = assigned.map(|r| vec![r.receipt_id]).unwrap_or_default();
        self.receipts
            .create(
                &mut sp,
                tenant_id,
                ReceiptSpec::new(
                    ReceiptType::TaskCanceled,
                    Principal::asyncgate(),
                    task.created_by.clone(),
                )
                .with_task(task_id)
                .with_parents(parents)
                .with_body(bodies::task_canceled(reason)),
            )
            .await?;
        self.emit_result_ready(&mut sp, tenant_id, task_id, &task.created_by, TaskStatus::Canceled)
            .await?;

        sp.commit().await?;
        tx.commit().await?;

        info!(task_id = %task_id, "Task canceled");
        self.get_task(tenant_id, task_id).await
    }

    pub async fn list_receipts(
        &self,
        tenant_id: Uuid,
        principal: &Principal,
        filters: &ReceiptFilters,
        since: Option<Uuid>,
        limit: Option<i64>,
    ) -> Result<ReceiptPage> {
        let limit = self.config.clamp_list_limit(limit);
        let mut conn = self.pool.acquire().await?;
        let (receipts, next_cursor) = self
            .receipts
            .list_for_recipient(&mut conn, tenant_id, principal, filters, since, limit)
            .await?;
        Ok(ReceiptPage {
            receipts,
            next_cursor,
        })
    }

    pub async fn get_receipt(&self, tenant_id: Uuid, receipt_id: Uuid) -> Result<Option<Receipt>> {
        let mut conn = self.pool.acquire().await?;
        self.receipts.get(&mut conn, tenant_id, receipt_id).await
    }

    pub async fn list_receipts_by_parent(
        &self,
        tenant_id: Uuid,
        parent_id: Uuid,
        limit: Option<i64>,
    ) -> Result<Vec<Receipt>> {
        let limit = self.config.clamp_list_limit(limit);
        let mut conn = self.pool.acquire().await?;
        self.receipts
            .list_by_parent(&mut conn, tenant_id, parent_id, limit)
            .await
    }

    pub async fn get_latest_terminator(
        &self,
        tenant_id: Uuid,
        parent_id: Uuid,
    ) -> Result<Option<Receipt>> {
        let mut conn = self.pool.acquire().await?;
        self.receipts
            .get_latest_terminator(&mut conn, tenant_id, parent_id)
            .await
    }

    /// Acknowledge a receipt. Append-only telemetry: records a non-terminal
    /// `receipt.acknowledged` carrying the target both in `parents` and in
    /// the body, never a mutable flag.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, receipt_id = %receipt_id))]
    pub async fn ack_receipt(
        &self,
        tenant_id: Uuid,
        principal: &Principal,
        receipt_id: Uuid,
    ) -> Result<Receipt> {
        let mut conn = self.pool.acquire().await?;
        self.receipts
            .create(
                &mut conn,
                tenant_id,
                ReceiptSpec::new(
                    ReceiptType::ReceiptAcknowledged,
                    principal.clone(),
                    Principal::asyncgate(),
                )
                .with_parents(vec![receipt_id])
                .with_body(bodies::receipt_acknowledged(receipt_id)),
            )
            .await
    }

    /// Open obligations for a principal: obligation-creating receipts with
    /// no legally terminating child. Flat list plus cursor, nothing else.
    pub async fn list_open_obligations(
        &self,
        tenant_id: Uuid,
        principal: &Principal,
        since: Option<Uuid>,
        limit: Option<i64>,
    ) -> Result<OpenObligationsPage> {
        let mut conn = self.pool.acquire().await?;
        self.obligations
            .list_open(&mut conn, &self.receipts, tenant_id, principal, since, limit)
            .await
    }

    // =========================================================================
    // Worker-facing operations
    // =========================================================================

    /// Claim up to `max_tasks` eligible tasks. Deliberately emits no
    /// per-task receipts: the claim loop stays cheap, and the authoritative
    /// record is the owner's `task.assigned` remaining open until a
    /// discharge appears.
    #[instrument(skip(self, capabilities), fields(tenant_id = %tenant_id, worker_id = worker_id))]
    pub async fn lease_next(
        &self,
        tenant_id: Uuid,
        worker_id: &str,
        capabilities: &[String],
        max_tasks: i64,
        ttl_seconds: Option<i64>,
    ) -> Result<Vec<ClaimedWork>> {
        let max_tasks = max_tasks.clamp(1, 10);

        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.begin().await?;
        let leases = self
            .leases
            .claim_next(&mut tx, tenant_id, worker_id, capabilities, max_tasks, ttl_seconds)
            .await?;

        let mut work = Vec::with_capacity(leases.len());
        for lease in leases {
            let task = self
                .tasks
                .get(&mut tx, tenant_id, lease.task_id)
                .await?
                .ok_or(EngineError::TaskNotFound {
                    task_id: lease.task_id,
                })?;
            work.push(ClaimedWork { task, lease });
        }
        tx.commit().await?;

        debug!(claimed = work.len(), "lease_next complete");
        Ok(work)
    }

    /// Extend a lease. Single compare-and-set; no receipts.
    pub async fn renew_lease(
        &self,
        tenant_id: Uuid,
        worker_id: &str,
        task_id: Uuid,
        lease_id: Uuid,
        extend_by_seconds: Option<i64>,
    ) -> Result<Lease> {
        let mut conn = self.pool.acquire().await?;
        self.leases
            .renew(&mut conn, tenant_id, task_id, lease_id, worker_id, extend_by_seconds)
            .await
    }

    /// Record a progress update. Gated on a valid lease so non-owning
    /// workers cannot corrupt the progress stream. In one savepoint: the
    /// task's current-progress snapshot is replaced (read back by
    /// `get_task`) and a `task.progress` receipt keeps the history;
    /// terminates nothing.
    #[instrument(skip(self, progress), fields(tenant_id = %tenant_id, task_id = %task_id))]
    pub async fn report_progress(
        &self,
        tenant_id: Uuid,
        worker_id: &str,
        task_id: Uuid,
        lease_id: Uuid,
        progress: Value,
    ) -> Result<Receipt> {
        let mut conn = self.pool.acquire().await?;
        self.leases
            .validate(&mut conn, tenant_id, task_id, lease_id, worker_id)
            .await?
            .ok_or(EngineError::LeaseInvalidOrExpired { task_id, lease_id })?;

        let mut tx = conn.begin().await?;
        let mut sp = tx.begin().await?;

        let updated = self
            .tasks
            .update_progress(&mut sp, tenant_id, task_id, &progress)
            .await?;
        if !updated {
            return Err(EngineError::TaskNotFound { task_id });
        }
        let receipt = self
            .receipts
            .create(
                &mut sp,
                tenant_id,
                ReceiptSpec::new(
                    ReceiptType::TaskProgress,
                    Principal::worker(worker_id),
                    Principal::asyncgate(),
                )
                .with_task(task_id)
                .with_lease(lease_id)
                .with_body(bodies::task_progress(&progress)),
            )
            .await?;

        sp.commit().await?;
        tx.commit().await?;
        Ok(receipt)
    }

    /// Mark a task succeeded. In one savepoint: task `leased -> succeeded`,
    /// lease released, `task.completed` parented on the most recent
    /// `task.assigned`, `task.result_ready` to the owner. If the block fails
    /// the task stays `leased` so the worker or the sweeper can retry
    /// cleanly.
    #[instrument(skip(self, result, artifacts, delivery_proof), fields(tenant_id = %tenant_id, task_id = %task_id, worker_id = worker_id))]
    pub async fn complete(
        &self,
        tenant_id: Uuid,
        worker_id: &str,
        task_id: Uuid,
        lease_id: Uuid,
        result: Value,
        artifacts: Option<Value>,
        delivery_proof: Option<Value>,
    ) -> Result<()> {
        let mut conn = self.pool.acquire().await?;

        // Read-only validation outside the savepoint.
        self.leases
            .validate(&mut conn, tenant_id, task_id, lease_id, worker_id)
            .await?
            .ok_or(EngineError::LeaseInvalidOrExpired { task_id, lease_id })?;
        let task = self
            .tasks
            .get(&mut conn, tenant_id, task_id)
            .await?
            .ok_or(EngineError::TaskNotFound { task_id })?;
        if !task.status.can_transition_to(TaskStatus::Succeeded) {
            return Err(EngineError::InvalidStateTransition {
                task_id,
                from: task.status.to_string(),
                to: TaskStatus::Succeeded.to_string(),
            });
        }

        let mut tx = conn.begin().await?;
        let mut sp = tx.begin().await?;

        let task_result = TaskResult {
            outcome: TaskOutcome::Succeeded,
            result: Some(result.clone()),
            error: None,
            artifacts: artifacts.clone(),
            completed_at: Utc::now(),
        };
        let transitioned = self
            .tasks
            .transition(
                &mut sp,
                tenant_id,
                task_id,
                TaskStatus::Leased,
                TaskStatus::Succeeded,
                Some(&task_result),
            )
            .await?;
        if !transitioned {
            // Raced the sweeper; the compare-and-set makes us the no-op side.
            return Err(EngineError::LeaseInvalidOrExpired { task_id, lease_id });
        }

        self.leases.release(&mut sp, tenant_id, task_id).await?;

        let assigned = self
            .receipts
            .latest_of_type_for_task(&mut sp, tenant_id, task_id, ReceiptType::TaskAssigned)
            .await?;
        let parents = assigned.map(|r| vec![r.receipt_id]).unwrap_or_default();
        self.receipts
            .create(
                &mut sp,
                tenant_id,
                ReceiptSpec::new(
                    ReceiptType::TaskCompleted,
                    Principal::worker(worker_id),
                    task.created_by.clone(),
                )
                .with_task(task_id)
                .with_lease(lease_id)
                .with_parents(parents)
                .with_body(bodies::task_completed(
                    &result,
                    artifacts.as_ref(),
                    delivery_proof.as_ref(),
                )),
            )
            .await?;
        self.emit_result_ready(&mut sp, tenant_id, task_id, &task.created_by, TaskStatus::Succeeded)
            .await?;

        sp.commit().await?;
        tx.commit().await?;

        info!(task_id = %task_id, "Task completed");
        Ok(())
    }

    /// Mark a task failed. Retryable failures with attempts remaining
    /// requeue with backoff and emit `task.failed` carrying a `requeued`
    /// marker; otherwise the task goes terminal. Either way the attempt
    /// ledger and the lease release happen in one savepoint.
    #[instrument(skip(self, error), fields(tenant_id = %tenant_id, task_id = %task_id, worker_id = worker_id, retryable = retryable))]
    pub async fn fail(
        &self,
        tenant_id: Uuid,
        worker_id: &str,
        task_id: Uuid,
        lease_id: Uuid,
        error: Value,
        retryable: bool,
    ) -> Result<FailOutcome> {
        let mut conn = self.pool.acquire().await?;

        self.leases
            .validate(&mut conn, tenant_id, task_id, lease_id, worker_id)
            .await?
            .ok_or(EngineError::LeaseInvalidOrExpired { task_id, lease_id })?;
        let task = self
            .tasks
            .get(&mut conn, tenant_id, task_id)
            .await?
            .ok_or(EngineError::TaskNotFound { task_id })?;
        if task.is_terminal() {
            return Err(EngineError::InvalidStateTransition {
                task_id,
                from: task.status.to_string(),
                to: TaskStatus::Failed.to_string(),
            });
        }

        let should_requeue = retryable && task.attempt < task.max_attempts;

        let mut tx = conn.begin().await?;
        let mut sp = tx.begin().await?;

        self.leases.release(&mut sp, tenant_id, task_id).await?;

        let assigned = self
            .receipts
            .latest_of_type_for_task(&mut sp, tenant_id, task_id, ReceiptType::TaskAssigned)
            .await?;
        let parents = assigned.map(|r| vec![r.receipt_id]).unwrap_or_default();

        let outcome = if should_requeue {
            let requeued_task = self.tasks.requeue_with_backoff(&mut sp, tenant_id, task_id).await?;
            self.receipts
                .create(
                    &mut sp,
                    tenant_id,
                    ReceiptSpec::new(
                        ReceiptType::TaskFailed,
                        Principal::worker(worker_id),
                        task.created_by.clone(),
                    )
                    .with_task(task_id)
                    .with_lease(lease_id)
                    .with_parents(parents)
                    .with_body(bodies::task_failed(&error, retryable, true, requeued_task.attempt)),
                )
                .await?;
            FailOutcome {
                requeued: true,
                next_eligible_at: requeued_task.next_eligible_at,
            }
        } else {
            let result = TaskResult {
                outcome: TaskOutcome::Failed,
                result: None,
                error: Some(error.clone()),
                artifacts: None,
                completed_at: Utc::now(),
            };
            let transitioned = self
                .tasks
                .transition(
                    &mut sp,
                    tenant_id,
                    task_id,
                    TaskStatus::Leased,
                    TaskStatus::Failed,
                    Some(&result),
                )
                .await?;
            if !transitioned {
                return Err(EngineError::LeaseInvalidOrExpired { task_id, lease_id });
            }
            self.receipts
                .create(
                    &mut sp,
                    tenant_id,
                    ReceiptSpec::new(
                        ReceiptType::TaskFailed,
                        Principal::worker(worker_id),
                        task.created_by.clone(),
                    )
                    .with_task(task_id)
                    .with_lease(lease_id)
                    .with_parents(parents)
                    .with_body(bodies::task_failed(&error, retryable, false, task.attempt)),
                )
                .await?;
            self.emit_result_ready(&mut sp, tenant_id, task_id, &task.created_by, TaskStatus::Failed)
                .await?;
            FailOutcome {
                requeued: false,
                next_eligible_at: None,
            }
        };

        sp.commit().await?;
        tx.commit().await?;

        info!(task_id = %task_id, requeued = outcome.requeued, "Task failure recorded");
        Ok(outcome)
    }

    // =========================================================================
    // System operations
    // =========================================================================

    /// Expire stale leases and requeue their tasks. Called by the sweeper.
    ///
    /// Each lease is processed in its own atomic block so one poisonous
    /// lease cannot halt the rest of the batch; failures are logged and the
    /// loop continues. Requeue-on-expiry never touches `attempt`: expiry is
    /// lost authority, not failure.
    #[instrument(skip(self))]
    pub async fn expire_leases(&self, batch_size: i64) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        let expired = self
            .leases
            .get_expired(&mut conn, Utc::now(), batch_size)
            .await?;

        let mut count = 0u64;
        for lease in expired {
            match self.expire_one(&mut conn, &lease).await {
                Ok(true) => count += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(
                        lease_id = %lease.lease_id,
                        task_id = %lease.task_id,
                        error = %e,
                        "Failed to expire lease; continuing batch"
                    );
                }
            }
        }

        Ok(count)
    }

    async fn expire_one(&self, conn: &mut sqlx::PgConnection, lease: &Lease) -> Result<bool> {
        let task = match self.tasks.get(conn, lease.tenant_id, lease.task_id).await? {
            Some(task) => task,
            None => return Ok(false),
        };

        let mut tx = conn.begin().await?;

        if task.is_terminal() {
            // Stale row left by a crashed release; just clean it up.
            self.leases.release(&mut tx, lease.tenant_id, lease.task_id).await?;
            tx.commit().await?;
            return Ok(false);
        }

        let requeued = self
            .tasks
            .requeue_on_expiry(&mut tx, lease.tenant_id, lease.task_id)
            .await?;
        self.leases.release(&mut tx, lease.tenant_id, lease.task_id).await?;

        if requeued {
            self.receipts
                .create(
                    &mut tx,
                    lease.tenant_id,
                    ReceiptSpec::new(
                        ReceiptType::LeaseExpired,
                        Principal::asyncgate(),
                        task.created_by.clone(),
                    )
                    .with_task(lease.task_id)
                    .with_lease(lease.lease_id)
                    .with_body(bodies::lease_expired(&lease.worker_id, task.attempt)),
                )
                .await?;
        }

        tx.commit().await?;

        if requeued {
            warn!(
                lease_id = %lease.lease_id,
                task_id = %lease.task_id,
                worker_id = %lease.worker_id,
                "Lease expired; task requeued without consuming an attempt"
            );
        }
        Ok(requeued)
    }

    /// Liveness probe against the store.
    pub async fn health(&self) -> Result<bool> {
        let row = sqlx::query("SELECT 1 AS health").fetch_one(&self.pool).await?;
        let health: i32 = row.get("health");
        Ok(health == 1)
    }

    /// Operational settings snapshot.
    pub fn config_snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot::from(&self.config)
    }

    // =========================================================================
    // Internal helpers
    // =========================================================================

    async fn emit_result_ready(
        &self,
        conn: &mut sqlx::PgConnection,
        tenant_id: Uuid,
        task_id: Uuid,
        owner: &Principal,
        status: TaskStatus,
    ) -> Result<Receipt> {
        self.receipts
            .create(
                conn,
                tenant_id,
                ReceiptSpec::new(ReceiptType::TaskResultReady, Principal::asyncgate(), owner.clone())
                    .with_task(task_id)
                    .with_body(bodies::task_result_ready(&status.to_string())),
            )
            .await
    }
}
