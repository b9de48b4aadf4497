//! # Obligation Query
//!
//! Derives the set of open obligations for a principal: obligation-creating
//! receipts addressed to them with no legally terminating child in the
//! ledger. This is the agent bootstrap primitive.
//!
//! The termination check is batched: one candidate fetch, then one probe for
//! every receipt referencing any candidate, then an in-process intersection.
//! A per-candidate probe would be an N+1 pattern and a denial-of-service
//! vector on the bootstrap path; the candidate hard cap is the second line
//! of defence against tenants with huge open backlogs.
//!
//! Output is a flat list plus cursor. No bucketing: categorisation is the
//! caller's responsibility, and the shape is pinned by a permanent
//! regression test.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::config::AsyncGateConfig;
use crate::error::Result;
use crate::models::{Principal, Receipt, ReceiptType};
use crate::store::ReceiptLedger;
use crate::termination::can_terminate;

/// Candidates fetched per requested item, before the hard cap.
const CANDIDATE_FACTOR: i64 = 3;

/// The bootstrap response shape. Exactly these fields; nothing bucketed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenObligationsPage {
    pub open_obligations: Vec<Receipt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct ObligationQuery {
    config: AsyncGateConfig,
}

impl ObligationQuery {
    pub fn new(config: AsyncGateConfig) -> Self {
        Self { config }
    }

    #[instrument(skip(self, conn, ledger), fields(tenant_id = %tenant_id, principal = %principal))]
    pub async fn list_open(
        &self,
        conn: &mut PgConnection,
        ledger: &ReceiptLedger,
        tenant_id: Uuid,
        principal: &Principal,
        since: Option<Uuid>,
        limit: Option<i64>,
    ) -> Result<OpenObligationsPage> {
        let limit = self.config.clamp_list_limit(limit);
        let fetch_limit = (limit * CANDIDATE_FACTOR)
            .min(self.config.obligation_candidate_hard_cap)
            .max(limit);

        let after = match since {
            Some(cursor_id) => ledger.cursor_position(conn, tenant_id, cursor_id).await?,
            None => None,
        };

        // (1) candidate obligations addressed to the principal
        let candidates = ledger
            .obligation_candidates(conn, tenant_id, principal, after, fetch_limit)
            .await?;
        if candidates.is_empty() {
            return Ok(OpenObligationsPage {
                open_obligations: Vec::new(),
                cursor: None,
            });
        }

        // (2) one batched probe for receipts referencing any candidate
        let candidate_ids: Vec<Uuid> = candidates.iter().map(|r| r.receipt_id).collect();
        let candidate_types: HashMap<Uuid, ReceiptType> = candidates
            .iter()
            .map(|r| (r.receipt_id, r.receipt_type))
            .collect();
        let children = ledger
            .children_referencing(conn, tenant_id, &candidate_ids)
            .await?;

        // (3) candidates with a legally terminating child are closed
        let mut terminated: HashSet<Uuid> = HashSet::new();
        for (child_type, parents) in children {
            for parent_id in parents {
                if let Some(parent_type) = candidate_types.get(&parent_id) {
                    if can_terminate(child_type, *parent_type) {
                        terminated.insert(parent_id);
                    }
                }
            }
        }

        // (4) survivors up to the requested page size
        let open_obligations: Vec<Receipt> = candidates
            .into_iter()
            .filter(|r| !terminated.contains(&r.receipt_id))
            .take(limit as usize)
            .collect();
        let cursor = if open_obligations.len() as i64 == limit {
            open_obligations.last().map(|r| r.receipt_id)
        } else {
            None
        };

        debug!(
            open = open_obligations.len(),
            terminated = terminated.len(),
            "Obligation query complete"
        );

        Ok(OpenObligationsPage {
            open_obligations,
            cursor,
        })
    }
}
