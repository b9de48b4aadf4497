pub mod core;
pub mod obligations;

pub use core::{ClaimedWork, FailOutcome, ReceiptPage, TaskEngine, TaskPage};
pub use obligations::{ObligationQuery, OpenObligationsPage};
