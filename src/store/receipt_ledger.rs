//! Append-only store of receipts with parent links.
//!
//! Validation pipeline on append, in order: size caps; locatability policy
//! for `task.completed`; parent existence and legal-terminator checks;
//! content hash; insert with hash dedup. Receipts are never modified or
//! deleted.
//!
//! The locatability rule is the one policy decision the ledger owns: a
//! `task.completed` whose body carries neither `artifacts` nor a
//! `delivery_proof` is recorded with `parents := []` (so it discharges
//! nothing) and a companion `system.anomaly.locatability_missing` receipt is
//! emitted to the task owner. In strict mode the receipt is rejected
//! instead.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Acquire, PgConnection};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::canonical::{canonical_json, receipt_hash};
use crate::config::AsyncGateConfig;
use crate::error::{is_unique_violation, EngineError, Result};
use crate::models::{bodies, AnomalyKind, Principal, PrincipalKind, Receipt, ReceiptSpec, ReceiptType};
use crate::termination::{can_terminate, is_terminal_type, obligation_type_names};

const RECEIPT_COLUMNS: &str = "tenant_id, receipt_id, receipt_type, from_kind, from_id, \
     to_kind, to_id, task_id, lease_id, parents, body, hash, created_at";

/// Optional predicates for receipt listing.
#[derive(Debug, Clone, Default)]
pub struct ReceiptFilters {
    pub receipt_type: Option<ReceiptType>,
    pub task_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct ReceiptLedger {
    config: AsyncGateConfig,
}

impl ReceiptLedger {
    pub fn new(config: AsyncGateConfig) -> Self {
        Self { config }
    }

    /// Validate and append a receipt. Re-emitting identical content returns
    /// the already-stored receipt (idempotent emission by content hash).
    #[instrument(skip(self, conn, spec), fields(tenant_id = %tenant_id, receipt_type = %spec.receipt_type))]
    pub async fn create(
        &self,
        conn: &mut PgConnection,
        tenant_id: Uuid,
        spec: ReceiptSpec,
    ) -> Result<Receipt> {
        // (1) caps: parents length, canonical body size, artifact count
        if spec.parents.len() > self.config.max_receipt_parents {
            return Err(EngineError::Validation {
                reason: format!(
                    "too many parents: {} > {}",
                    spec.parents.len(),
                    self.config.max_receipt_parents
                ),
            });
        }
        let body_canonical = canonical_json(&spec.body);
        if body_canonical.len() > self.config.max_receipt_body_bytes {
            return Err(EngineError::Validation {
                reason: format!(
                    "body too large: {} bytes > {}",
                    body_canonical.len(),
                    self.config.max_receipt_body_bytes
                ),
            });
        }
        if let Some(artifacts) = spec.body.get("artifacts").and_then(Value::as_array) {
            if artifacts.len() > self.config.max_receipt_artifacts {
                return Err(EngineError::Validation {
                    reason: format!(
                        "too many artifacts: {} > {}",
                        artifacts.len(),
                        self.config.max_receipt_artifacts
                    ),
                });
            }
        }

        // Locatability policy. Lenient mode strips the discharge linkage and
        // leaves the obligation open; strict mode rejects outright.
        let mut parents = spec.parents.clone();
        let mut stripped = false;
        if spec.receipt_type == ReceiptType::TaskCompleted && !body_is_locatable(&spec.body) {
            if self.config.strict_locatability {
                return Err(EngineError::Validation {
                    reason: "task.completed requires an artifacts list or a delivery_proof"
                        .to_string(),
                });
            }
            warn!(
                task_id = ?spec.task_id,
                "task.completed without locatability; recording with stripped parents"
            );
            parents.clear();
            stripped = true;
        }

        // (3) terminal receipts must discharge something real: non-empty
        // parents, each existing in-tenant, each legally terminable by this
        // type. Principal identity of parent vs child is deliberately not
        // compared.
        if !stripped && is_terminal_type(spec.receipt_type) && parents.is_empty() {
            return Err(EngineError::Validation {
                reason: format!("terminal receipt type {} requires parents", spec.receipt_type),
            });
        }
        if !parents.is_empty() {
            let parent_rows = self.fetch_parent_summaries(conn, tenant_id, &parents).await?;
            for parent_id in &parents {
                let parent = parent_rows
                    .iter()
                    .find(|p| p.receipt_id == *parent_id)
                    .ok_or_else(|| EngineError::Validation {
                        reason: format!("unknown parent receipt: {parent_id}"),
                    })?;
                if is_terminal_type(spec.receipt_type)
                    && !can_terminate(spec.receipt_type, parent.receipt_type)
                {
                    return Err(EngineError::Validation {
                        reason: format!(
                            "{} cannot terminate {}",
                            spec.receipt_type, parent.receipt_type
                        ),
                    });
                }
            }
        }

        // (2)/(5) content hash over the post-normalisation parents, so the
        // stored hash always describes the stored row; then insert-or-fetch.
        let hash = receipt_hash(
            spec.receipt_type,
            spec.task_id,
            &spec.from,
            &spec.to,
            spec.lease_id,
            &parents,
            &spec.body,
        );
        let receipt = self
            .insert_with_dedup(conn, tenant_id, &spec, &parents, &hash)
            .await?;

        if stripped {
            let recipient = self.resolve_task_owner(conn, tenant_id, &spec).await?;
            let anomaly = ReceiptSpec::new(
                ReceiptType::SystemAnomaly(AnomalyKind::LocatabilityMissing),
                Principal::asyncgate(),
                recipient,
            )
            .with_body(bodies::locatability_missing(spec.task_id, receipt.receipt_id));
            let anomaly = match spec.task_id {
                Some(task_id) => anomaly.with_task(task_id),
                None => anomaly,
            };
            let anomaly_hash = receipt_hash(
                anomaly.receipt_type,
                anomaly.task_id,
                &anomaly.from,
                &anomaly.to,
                anomaly.lease_id,
                &anomaly.parents,
                &anomaly.body,
            );
            self.insert_with_dedup(conn, tenant_id, &anomaly, &[], &anomaly_hash)
                .await?;
        }

        Ok(receipt)
    }

    async fn insert_with_dedup(
        &self,
        conn: &mut PgConnection,
        tenant_id: Uuid,
        spec: &ReceiptSpec,
        parents: &[Uuid],
        hash: &str,
    ) -> Result<Receipt> {
        if let Some(existing) = self.get_by_hash(conn, tenant_id, hash).await? {
            debug!(hash = hash, "Receipt dedup hit, returning existing");
            return Ok(existing);
        }

        let receipt_id = Uuid::new_v4();
        let now = Utc::now();
        let parents_json =
            Value::Array(parents.iter().map(|p| Value::String(p.to_string())).collect());

        // Nested savepoint so a dedup race aborts only the insert and the
        // connection stays usable for the follow-up read.
        let mut sp = conn.begin().await?;
        let insert = sqlx::query_as::<_, ReceiptRow>(&format!(
            r#"
            INSERT INTO asyncgate_receipts (
                tenant_id, receipt_id, receipt_type, from_kind, from_id,
                to_kind, to_id, task_id, lease_id, parents, body, hash, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING {RECEIPT_COLUMNS}
            "#
        ))
        .bind(tenant_id)
        .bind(receipt_id)
        .bind(spec.receipt_type.to_string())
        .bind(spec.from.kind.to_string())
        .bind(&spec.from.id)
        .bind(spec.to.kind.to_string())
        .bind(&spec.to.id)
        .bind(spec.task_id)
        .bind(spec.lease_id)
        .bind(&parents_json)
        .bind(&spec.body)
        .bind(hash)
        .bind(now)
        .fetch_one(&mut *sp)
        .await;

        match insert {
            Ok(row) => {
                sp.commit().await?;
                row_to_receipt(row)
            }
            Err(e) if is_unique_violation(&e, "uq_asyncgate_receipt_hash") => {
                sp.rollback().await?;
                // Lost the emission race; the winner's row is equivalent.
                self.get_by_hash(conn, tenant_id, hash)
                    .await?
                    .ok_or_else(|| EngineError::Database {
                        operation: "receipt_dedup".to_string(),
                        reason: e.to_string(),
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
        receipt_id: Uuid,
    ) -> Result<Option<Receipt>> {
        let row = sqlx::query_as::<_, ReceiptRow>(&format!(
            "SELECT {RECEIPT_COLUMNS} FROM asyncgate_receipts WHERE tenant_id = $1 AND receipt_id = $2"
        ))
        .bind(tenant_id)
        .bind(receipt_id)
        .fetch_optional(&mut *conn)
        .await?;

        row.map(row_to_receipt).transpose()
    }

    async fn get_by_hash(
        &self,
        conn: &mut PgConnection,
        tenant_id: Uuid,
        hash: &str,
    ) -> Result<Option<Receipt>> {
        let row = sqlx::query_as::<_, ReceiptRow>(&format!(
            "SELECT {RECEIPT_COLUMNS} FROM asyncgate_receipts WHERE tenant_id = $1 AND hash = $2"
        ))
        .bind(tenant_id)
        .bind(hash)
        .fetch_optional(&mut *conn)
        .await?;

        row.map(row_to_receipt).transpose()
    }

    /// Receipts addressed to a principal, oldest first, paginated by
    /// `(created_at, receipt_id)` after the cursor receipt.
    pub async fn list_for_recipient(
        &self,
        conn: &mut PgConnection,
        tenant_id: Uuid,
        to: &Principal,
        filters: &ReceiptFilters,
        since: Option<Uuid>,
        limit: i64,
    ) -> Result<(Vec<Receipt>, Option<Uuid>)> {
        let cursor = match since {
            Some(id) => self.cursor_position(conn, tenant_id, id).await?,
            None => None,
        };
        let (cursor_at, cursor_id) = cursor.unzip();

        let rows = sqlx::query_as::<_, ReceiptRow>(&format!(
            r#"
            SELECT {RECEIPT_COLUMNS} FROM asyncgate_receipts
            WHERE tenant_id = $1 AND to_kind = $2 AND to_id = $3
              AND ($4::text IS NULL OR receipt_type = $4)
              AND ($5::uuid IS NULL OR task_id = $5)
              AND ($6::timestamptz IS NULL OR (created_at, receipt_id) > ($6, $7))
            ORDER BY created_at ASC, receipt_id ASC
            LIMIT $8
            "#
        ))
        .bind(tenant_id)
        .bind(to.kind.to_string())
        .bind(&to.id)
        .bind(filters.receipt_type.map(|t| t.to_string()))
        .bind(filters.task_id)
        .bind(cursor_at)
        .bind(cursor_id)
        .bind(limit + 1)
        .fetch_all(&mut *conn)
        .await?;

        let has_more = rows.len() as i64 > limit;
        let receipts = rows
            .into_iter()
            .take(limit as usize)
            .map(row_to_receipt)
            .collect::<Result<Vec<_>>>()?;
        let next_cursor = if has_more {
            receipts.last().map(|r| r.receipt_id)
        } else {
            None
        };

        Ok((receipts, next_cursor))
    }

    /// Children referencing `parent_id`, oldest first. Retries can produce
    /// several terminators for one obligation; callers wanting the canonical
    /// outcome use [`Self::get_latest_terminator`].
    pub async fn list_by_parent(
        &self,
        conn: &mut PgConnection,
        tenant_id: Uuid,
        parent_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Receipt>> {
        let rows = sqlx::query_as::<_, ReceiptRow>(&format!(
            r#"
            SELECT {RECEIPT_COLUMNS} FROM asyncgate_receipts
            WHERE tenant_id = $1 AND parents ? $2
            ORDER BY created_at ASC, receipt_id ASC
            LIMIT $3
            "#
        ))
        .bind(tenant_id)
        .bind(parent_id.to_string())
        .bind(limit)
        .fetch_all(&mut *conn)
        .await?;

        rows.into_iter().map(row_to_receipt).collect()
    }

    /// Constant-time probe: does any receipt reference `parent_id`?
    /// Hot path of the obligation query; relies on the GIN index on
    /// `parents`.
    pub async fn has_terminator(
        &self,
        conn: &mut PgConnection,
        tenant_id: Uuid,
        parent_id: Uuid,
    ) -> Result<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM asyncgate_receipts
                WHERE tenant_id = $1 AND parents ? $2
            )
            "#,
        )
        .bind(tenant_id)
        .bind(parent_id.to_string())
        .fetch_one(&mut *conn)
        .await?;

        Ok(exists)
    }

    /// Most recent child that legally terminates `parent_id`, or None.
    pub async fn get_latest_terminator(
        &self,
        conn: &mut PgConnection,
        tenant_id: Uuid,
        parent_id: Uuid,
    ) -> Result<Option<Receipt>> {
        let parent = match self.get(conn, tenant_id, parent_id).await? {
            Some(parent) => parent,
            None => return Ok(None),
        };

        let rows = sqlx::query_as::<_, ReceiptRow>(&format!(
            r#"
            SELECT {RECEIPT_COLUMNS} FROM asyncgate_receipts
            WHERE tenant_id = $1 AND parents ? $2
            ORDER BY created_at DESC, receipt_id DESC
            LIMIT 50
            "#
        ))
        .bind(tenant_id)
        .bind(parent_id.to_string())
        .fetch_all(&mut *conn)
        .await?;

        for row in rows {
            let receipt = row_to_receipt(row)?;
            if can_terminate(receipt.receipt_type, parent.receipt_type) {
                return Ok(Some(receipt));
            }
        }
        Ok(None)
    }

    /// Most recent receipt of a given type for a task. Used to locate the
    /// `task.assigned` a discharge should parent.
    pub async fn latest_of_type_for_task(
        &self,
        conn: &mut PgConnection,
        tenant_id: Uuid,
        task_id: Uuid,
        receipt_type: ReceiptType,
    ) -> Result<Option<Receipt>> {
        let row = sqlx::query_as::<_, ReceiptRow>(&format!(
            r#"
            SELECT {RECEIPT_COLUMNS} FROM asyncgate_receipts
            WHERE tenant_id = $1 AND task_id = $2 AND receipt_type = $3
            ORDER BY created_at DESC, receipt_id DESC
            LIMIT 1
            "#
        ))
        .bind(tenant_id)
        .bind(task_id)
        .bind(receipt_type.to_string())
        .fetch_optional(&mut *conn)
        .await?;

        row.map(row_to_receipt).transpose()
    }

    /// Obligation-creating receipts addressed to a principal, oldest first,
    /// starting strictly after the cursor position.
    pub async fn obligation_candidates(
        &self,
        conn: &mut PgConnection,
        tenant_id: Uuid,
        to: &Principal,
        after: Option<(DateTime<Utc>, Uuid)>,
        fetch_limit: i64,
    ) -> Result<Vec<Receipt>> {
        let (cursor_at, cursor_id) = after.unzip();

        let rows = sqlx::query_as::<_, ReceiptRow>(&format!(
            r#"
            SELECT {RECEIPT_COLUMNS} FROM asyncgate_receipts
            WHERE tenant_id = $1 AND to_kind = $2 AND to_id = $3
              AND receipt_type = ANY($4)
              AND ($5::timestamptz IS NULL OR (created_at, receipt_id) > ($5, $6))
            ORDER BY created_at ASC, receipt_id ASC
            LIMIT $7
            "#
        ))
        .bind(tenant_id)
        .bind(to.kind.to_string())
        .bind(&to.id)
        .bind(obligation_type_names())
        .bind(cursor_at)
        .bind(cursor_id)
        .bind(fetch_limit)
        .fetch_all(&mut *conn)
        .await?;

        rows.into_iter().map(row_to_receipt).collect()
    }

    /// One batched probe: the type and parents of every receipt referencing
    /// any of `parent_ids`. Replaces one probe per candidate (the N+1 shape
    /// that makes bootstrap a denial-of-service vector).
    pub async fn children_referencing(
        &self,
        conn: &mut PgConnection,
        tenant_id: Uuid,
        parent_ids: &[Uuid],
    ) -> Result<Vec<(ReceiptType, Vec<Uuid>)>> {
        if parent_ids.is_empty() {
            return Ok(Vec::new());
        }
        let id_strings: Vec<String> = parent_ids.iter().map(|id| id.to_string()).collect();

        let rows: Vec<(String, Value)> = sqlx::query_as(
            r#"
            SELECT receipt_type, parents FROM asyncgate_receipts
            WHERE tenant_id = $1 AND parents ?| $2
            "#,
        )
        .bind(tenant_id)
        .bind(&id_strings)
        .fetch_all(&mut *conn)
        .await?;

        rows.into_iter()
            .map(|(type_str, parents)| {
                let receipt_type: ReceiptType = type_str.parse().map_err(decode_error)?;
                Ok((receipt_type, parents_from_json(&parents)?))
            })
            .collect()
    }

    /// Resolve the `(created_at, receipt_id)` position of a cursor receipt.
    /// Unknown cursors are ignored rather than erroring so retention never
    /// strands a paginating client.
    pub async fn cursor_position(
        &self,
        conn: &mut PgConnection,
        tenant_id: Uuid,
        cursor_id: Uuid,
    ) -> Result<Option<(DateTime<Utc>, Uuid)>> {
        let row: Option<(DateTime<Utc>,)> = sqlx::query_as(
            "SELECT created_at FROM asyncgate_receipts WHERE tenant_id = $1 AND receipt_id = $2",
        )
        .bind(tenant_id)
        .bind(cursor_id)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(row.map(|(created_at,)| (created_at, cursor_id)))
    }

    async fn fetch_parent_summaries(
        &self,
        conn: &mut PgConnection,
        tenant_id: Uuid,
        parent_ids: &[Uuid],
    ) -> Result<Vec<ParentSummary>> {
        let rows: Vec<(Uuid, String, String, String)> = sqlx::query_as(
            r#"
            SELECT receipt_id, receipt_type, to_kind, to_id FROM asyncgate_receipts
            WHERE tenant_id = $1 AND receipt_id = ANY($2)
            "#,
        )
        .bind(tenant_id)
        .bind(parent_ids)
        .fetch_all(&mut *conn)
        .await?;

        rows.into_iter()
            .map(|(receipt_id, type_str, to_kind, to_id)| {
                Ok(ParentSummary {
                    receipt_id,
                    receipt_type: type_str.parse().map_err(decode_error)?,
                    to: Principal {
                        kind: to_kind.parse().map_err(decode_error)?,
                        id: to_id,
                    },
                })
            })
            .collect()
    }

    /// Addressee for the companion anomaly receipt: the `to` of the task's
    /// most recent `task.assigned` (the owner), falling back to the
    /// completing receipt's author when no assignment exists.
    async fn resolve_task_owner(
        &self,
        conn: &mut PgConnection,
        tenant_id: Uuid,
        spec: &ReceiptSpec,
    ) -> Result<Principal> {
        if let Some(task_id) = spec.task_id {
            if let Some(assigned) = self
                .latest_of_type_for_task(conn, tenant_id, task_id, ReceiptType::TaskAssigned)
                .await?
            {
                return Ok(assigned.to);
            }
        }
        if let Some(parent_id) = spec.parents.first() {
            let summaries = self
                .fetch_parent_summaries(conn, tenant_id, &[*parent_id])
                .await?;
            if let Some(parent) = summaries.first() {
                return Ok(parent.to.clone());
            }
        }
        Ok(spec.from.clone())
    }
}

struct ParentSummary {
    receipt_id: Uuid,
    receipt_type: ReceiptType,
    to: Principal,
}

fn body_is_locatable(body: &Value) -> bool {
    let has_artifacts = body
        .get("artifacts")
        .and_then(Value::as_array)
        .map(|a| !a.is_empty())
        .unwrap_or(false);
    let has_proof = body.get("delivery_proof").map(Value::is_object).unwrap_or(false);
    has_artifacts || has_proof
}

#[derive(sqlx::FromRow)]
struct ReceiptRow {
    tenant_id: Uuid,
    receipt_id: Uuid,
    receipt_type: String,
    from_kind: String,
    from_id: String,
    to_kind: String,
    to_id: String,
    task_id: Option<Uuid>,
    lease_id: Option<Uuid>,
    parents: Value,
    body: Value,
    hash: String,
    created_at: DateTime<Utc>,
}

fn row_to_receipt(row: ReceiptRow) -> Result<Receipt> {
    let receipt_type: ReceiptType = row.receipt_type.parse().map_err(decode_error)?;
    let from_kind: PrincipalKind = row.from_kind.parse().map_err(decode_error)?;
    let to_kind: PrincipalKind = row.to_kind.parse().map_err(decode_error)?;

    Ok(Receipt {
        receipt_id: row.receipt_id,
        tenant_id: row.tenant_id,
        receipt_type,
        from: Principal {
            kind: from_kind,
            id: row.from_id,
        },
        to: Principal {
            kind: to_kind,
            id: row.to_id,
        },
        task_id: row.task_id,
        lease_id: row.lease_id,
        parents: parents_from_json(&row.parents)?,
        body: row.body,
        hash: row.hash,
        created_at: row.created_at,
    })
}

fn parents_from_json(value: &Value) -> Result<Vec<Uuid>> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .ok_or_else(|| decode_error("non-string parent entry".to_string()))
                    .and_then(|s| {
                        Uuid::parse_str(s).map_err(|e| decode_error(format!("bad parent uuid: {e}")))
                    })
            })
            .collect(),
        _ => Err(decode_error("parents is not an array".to_string())),
    }
}

fn decode_error(e: String) -> EngineError {
    EngineError::Database {
        operation: "decode".to_string(),
        reason: e,
    }
}
