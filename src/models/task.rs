use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::principal::Principal;

/// Task lifecycle status. Terminal states are sinks: once a task reaches
/// `Succeeded`, `Failed`, or `Canceled` it never transitions again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a worker claim.
    Queued,
    /// Exclusively claimed by a worker under an unexpired lease.
    Leased,
    /// Completed successfully.
    Succeeded,
    /// Terminally failed (retries exhausted or non-retryable).
    Failed,
    /// Canceled by its owner.
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    /// Table-driven state machine. `Leased -> Queued` covers both lease
    /// expiry and retryable failure; cancellation is reachable from any
    /// non-terminal state.
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        match self {
            Self::Queued => matches!(to, Self::Leased | Self::Canceled),
            Self::Leased => matches!(
                to,
                Self::Succeeded | Self::Failed | Self::Queued | Self::Canceled
            ),
            Self::Succeeded | Self::Failed | Self::Canceled => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Leased => write!(f, "leased"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "leased" => Ok(Self::Leased),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            _ => Err(format!("Invalid task status: {s}")),
        }
    }
}

/// Outcome tag inside a terminal result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Succeeded,
    Failed,
    Canceled,
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

impl std::str::FromStr for TaskOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            _ => Err(format!("Invalid task outcome: {s}")),
        }
    }
}

/// Execution requirements matched against worker capabilities at claim time.
/// A task is claimable by a worker iff `capabilities` is a subset of the
/// worker's advertised set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskRequirements {
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Terminal outcome record. Present on a task iff its status is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub outcome: TaskOutcome,
    pub result: Option<Value>,
    pub error: Option<Value>,
    pub artifacts: Option<Value>,
    pub completed_at: DateTime<Utc>,
}

/// A unit of delegated work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    pub tenant_id: Uuid,
    #[serde(rename = "type")]
    pub task_type: String,
    pub payload: Value,
    pub created_by: Principal,
    pub requirements: TaskRequirements,
    pub priority: i32,
    pub status: TaskStatus,
    /// Current attempt number, starting at 1. Incremented only on retryable
    /// failure, never on lease expiry.
    pub attempt: i32,
    pub max_attempts: i32,
    pub retry_backoff_seconds: i32,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_eligible_at: Option<DateTime<Utc>>,
    /// Latest progress snapshot reported by the leasing worker, if any.
    pub progress: Option<Value>,
    pub result: Option<TaskResult>,
}

impl Task {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Creation parameters accepted by the engine's `create_task`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub requirements: TaskRequirements,
    pub priority: Option<i32>,
    pub max_attempts: Option<i32>,
    pub retry_backoff_seconds: Option<i32>,
    /// Initial delay before the task becomes eligible for claiming.
    pub delay_seconds: Option<i64>,
}

impl TaskSpec {
    pub fn new(task_type: impl Into<String>, payload: Value) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
            requirements: TaskRequirements::default(),
            priority: None,
            max_attempts: None,
            retry_backoff_seconds: None,
            delay_seconds: None,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.requirements.capabilities = capabilities;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_sinks() {
        for terminal in [TaskStatus::Succeeded, TaskStatus::Failed, TaskStatus::Canceled] {
            assert!(terminal.is_terminal());
            for target in [
                TaskStatus::Queued,
                TaskStatus::Leased,
                TaskStatus::Succeeded,
                TaskStatus::Failed,
                TaskStatus::Canceled,
            ] {
                assert!(!terminal.can_transition_to(target));
            }
        }
    }

    #[test]
    fn queued_transitions() {
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Leased));
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Canceled));
        assert!(!TaskStatus::Queued.can_transition_to(TaskStatus::Succeeded));
        assert!(!TaskStatus::Queued.can_transition_to(TaskStatus::Failed));
    }

    #[test]
    fn leased_transitions() {
        assert!(TaskStatus::Leased.can_transition_to(TaskStatus::Succeeded));
        assert!(TaskStatus::Leased.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::Leased.can_transition_to(TaskStatus::Queued));
        assert!(TaskStatus::Leased.can_transition_to(TaskStatus::Canceled));
    }

    #[test]
    fn status_string_round_trip() {
        assert_eq!(TaskStatus::Leased.to_string(), "leased");
        assert_eq!("succeeded".parse::<TaskStatus>().unwrap(), TaskStatus::Succeeded);
        assert!("running".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn requirements_deserialize_with_missing_fields() {
        let reqs: TaskRequirements = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(reqs.capabilities.is_empty());

        let reqs: TaskRequirements =
            serde_json::from_value(serde_json::json!({"capabilities": ["echo"]})).unwrap();
        assert_eq!(reqs.capabilities, vec!["echo"]);
    }
}
