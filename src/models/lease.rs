use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A time-bounded exclusive claim on a task. At most one lease row exists
/// per task at any instant; the row is deleted on release and on sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub lease_id: Uuid,
    pub tenant_id: Uuid,
    pub task_id: Uuid,
    pub worker_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub renewal_count: i32,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// A lease is valid for a caller iff it is unexpired and owned by them.
    pub fn is_valid_for(&self, worker_id: &str, now: DateTime<Utc>) -> bool {
        !self.is_expired(now) && self.worker_id == worker_id
    }
}
