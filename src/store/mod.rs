pub mod lease_store;
pub mod receipt_ledger;
pub mod task_store;

pub use lease_store::LeaseStore;
pub use receipt_ledger::ReceiptLedger;
pub use task_store::{TaskFilters, TaskStore};
