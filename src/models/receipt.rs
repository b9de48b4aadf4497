use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::principal::Principal;

/// Anomaly subtypes carried in the `system.anomaly.*` receipt family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnomalyKind {
    /// A `task.completed` receipt arrived without artifacts or a delivery
    /// proof; the contract was recorded but the obligation stays open.
    LocatabilityMissing,
    MaxAttemptsExceeded,
    RepeatedLeaseExpiry,
    ExcessiveRenewals,
}

impl AnomalyKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::LocatabilityMissing => "locatability_missing",
            Self::MaxAttemptsExceeded => "max_attempts_exceeded",
            Self::RepeatedLeaseExpiry => "repeated_lease_expiry",
            Self::ExcessiveRenewals => "excessive_renewals",
        }
    }
}

impl std::str::FromStr for AnomalyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "locatability_missing" => Ok(Self::LocatabilityMissing),
            "max_attempts_exceeded" => Ok(Self::MaxAttemptsExceeded),
            "repeated_lease_expiry" => Ok(Self::RepeatedLeaseExpiry),
            "excessive_renewals" => Ok(Self::ExcessiveRenewals),
            _ => Err(format!("Invalid anomaly kind: {s}")),
        }
    }
}

/// The ledger's public protocol. The string forms are bit-exact wire values;
/// anomaly subtypes are encoded in the type string itself
/// (`system.anomaly.locatability_missing`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ReceiptType {
    /// Obligation-creating: the substrate owes the addressee an outcome.
    TaskAssigned,
    TaskProgress,
    /// Terminal for `task.assigned`; requires locatability.
    TaskCompleted,
    /// Terminal for `task.assigned`.
    TaskFailed,
    /// Terminal for `task.assigned`.
    TaskCanceled,
    /// Notification to the owner that a terminal result is retrievable.
    TaskResultReady,
    /// Lost authority, not failure: the obligation stays open.
    LeaseExpired,
    ReceiptAcknowledged,
    SystemAnomaly(AnomalyKind),
}

impl fmt::Display for ReceiptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TaskAssigned => write!(f, "task.assigned"),
            Self::TaskProgress => write!(f, "task.progress"),
            Self::TaskCompleted => write!(f, "task.completed"),
            Self::TaskFailed => write!(f, "task.failed"),
            Self::TaskCanceled => write!(f, "task.canceled"),
            Self::TaskResultReady => write!(f, "task.result_ready"),
            Self::LeaseExpired => write!(f, "lease.expired"),
            Self::ReceiptAcknowledged => write!(f, "receipt.acknowledged"),
            Self::SystemAnomaly(kind) => write!(f, "system.anomaly.{}", kind.as_str()),
        }
    }
}

impl std::str::FromStr for ReceiptType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task.assigned" => Ok(Self::TaskAssigned),
            "task.progress" => Ok(Self::TaskProgress),
            "task.completed" => Ok(Self::TaskCompleted),
            "task.failed" => Ok(Self::TaskFailed),
            "task.canceled" => Ok(Self::TaskCanceled),
            "task.result_ready" => Ok(Self::TaskResultReady),
            "lease.expired" => Ok(Self::LeaseExpired),
            "receipt.acknowledged" => Ok(Self::ReceiptAcknowledged),
            other => match other.strip_prefix("system.anomaly.") {
                Some(kind) => Ok(Self::SystemAnomaly(kind.parse()?)),
                None => Err(format!("Invalid receipt type: {other}")),
            },
        }
    }
}

impl From<ReceiptType> for String {
    fn from(value: ReceiptType) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for ReceiptType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// An immutable contract record. Never modified, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub receipt_id: Uuid,
    pub tenant_id: Uuid,
    pub receipt_type: ReceiptType,
    pub from: Principal,
    pub to: Principal,
    pub task_id: Option<Uuid>,
    pub lease_id: Option<Uuid>,
    /// Causal linkage: terminators reference the obligation they discharge.
    pub parents: Vec<Uuid>,
    pub body: Value,
    /// Content hash over type, entities, sorted parents, and canonical body.
    /// Backs idempotent emission; not a cryptographic attestation.
    pub hash: String,
    pub created_at: DateTime<Utc>,
}

/// Parameters for appending a receipt to the ledger.
#[derive(Debug, Clone)]
pub struct ReceiptSpec {
    pub receipt_type: ReceiptType,
    pub from: Principal,
    pub to: Principal,
    pub task_id: Option<Uuid>,
    pub lease_id: Option<Uuid>,
    pub parents: Vec<Uuid>,
    pub body: Value,
}

impl ReceiptSpec {
    pub fn new(receipt_type: ReceiptType, from: Principal, to: Principal) -> Self {
        Self {
            receipt_type,
            from,
            to,
            task_id: None,
            lease_id: None,
            parents: Vec::new(),
            body: Value::Object(serde_json::Map::new()),
        }
    }

    pub fn with_task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_lease(mut self, lease_id: Uuid) -> Self {
        self.lease_id = Some(lease_id);
        self
    }

    pub fn with_parents(mut self, parents: Vec<Uuid>) -> Self {
        self.parents = parents;
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }
}

/// Standard receipt body shapes. Keys that would be null are omitted so the
/// locatability check sees genuine absence rather than `null`.
pub mod bodies {
    use serde_json::{json, Map, Value};
    use uuid::Uuid;

    pub fn task_assigned(task_type: &str, requirements: &Value) -> Value {
        json!({
            "instructions": format!("Execute task type: {task_type}"),
            "requirements": requirements,
        })
    }

    pub fn task_completed(
        result: &Value,
        artifacts: Option<&Value>,
        delivery_proof: Option<&Value>,
    ) -> Value {
        let mut body = Map::new();
        body.insert("result".to_string(), result.clone());
        if let Some(artifacts) = artifacts {
            body.insert("artifacts".to_string(), artifacts.clone());
        }
        if let Some(proof) = delivery_proof {
            body.insert("delivery_proof".to_string(), proof.clone());
        }
        Value::Object(body)
    }

    pub fn task_failed(error: &Value, retryable: bool, requeued: bool, attempt: i32) -> Value {
        json!({
            "error": error,
            "retryable": retryable,
            "requeued": requeued,
            "attempt": attempt,
        })
    }

    pub fn task_canceled(reason: Option<&str>) -> Value {
        json!({ "reason": reason })
    }

    pub fn task_progress(progress: &Value) -> Value {
        json!({ "progress": progress })
    }

    pub fn task_result_ready(status: &str) -> Value {
        json!({ "status": status })
    }

    pub fn lease_expired(previous_worker_id: &str, attempt: i32) -> Value {
        json!({
            "previous_worker_id": previous_worker_id,
            "attempt": attempt,
            "requeued": true,
        })
    }

    pub fn receipt_acknowledged(receipt_id: Uuid) -> Value {
        json!({ "acknowledged_receipt_id": receipt_id.to_string() })
    }

    pub fn locatability_missing(task_id: Option<Uuid>, completed_receipt_id: Uuid) -> Value {
        json!({
            "kind": "locatability_missing",
            "task_id": task_id.map(|id| id.to_string()),
            "completed_receipt_id": completed_receipt_id.to_string(),
            "recommended_action": "re-run complete with artifacts or a delivery proof",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receipt_type_wire_strings() {
        assert_eq!(ReceiptType::TaskAssigned.to_string(), "task.assigned");
        assert_eq!(ReceiptType::TaskResultReady.to_string(), "task.result_ready");
        assert_eq!(
            ReceiptType::SystemAnomaly(AnomalyKind::LocatabilityMissing).to_string(),
            "system.anomaly.locatability_missing"
        );
    }

    #[test]
    fn receipt_type_parse_round_trip() {
        for raw in [
            "task.assigned",
            "task.progress",
            "task.completed",
            "task.failed",
            "task.canceled",
            "task.result_ready",
            "lease.expired",
            "receipt.acknowledged",
            "system.anomaly.locatability_missing",
            "system.anomaly.repeated_lease_expiry",
        ] {
            let parsed: ReceiptType = raw.parse().unwrap();
            assert_eq!(parsed.to_string(), raw);
        }
        assert!("task.exploded".parse::<ReceiptType>().is_err());
        assert!("system.anomaly.unknown_kind".parse::<ReceiptType>().is_err());
    }

    #[test]
    fn receipt_type_serde_uses_wire_string() {
        let json = serde_json::to_string(&ReceiptType::TaskCompleted).unwrap();
        assert_eq!(json, "\"task.completed\"");
        let parsed: ReceiptType = serde_json::from_str("\"lease.expired\"").unwrap();
        assert_eq!(parsed, ReceiptType::LeaseExpired);
    }

    #[test]
    fn completed_body_omits_absent_locators() {
        let body = bodies::task_completed(&serde_json::json!({"ok": true}), None, None);
        assert!(body.get("artifacts").is_none());
        assert!(body.get("delivery_proof").is_none());

        let artifacts = serde_json::json!([{"type": "mem", "key": "k1"}]);
        let body = bodies::task_completed(&serde_json::json!({}), Some(&artifacts), None);
        assert_eq!(body["artifacts"], artifacts);
    }
}
