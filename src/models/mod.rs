pub mod lease;
pub mod principal;
pub mod receipt;
pub mod task;

pub use lease::Lease;
pub use principal::{Principal, PrincipalKind};
pub use receipt::{bodies, AnomalyKind, Receipt, ReceiptSpec, ReceiptType};
pub use task::{Task, TaskOutcome, TaskRequirements, TaskResult, TaskSpec, TaskStatus};
