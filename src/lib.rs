//! # AsyncGate
//!
//! A durable, multi-tenant task substrate. Ephemeral agents delegate units
//! of work to external workers and recover the results later without holding
//! any in-process state. AsyncGate is a ledger, not a scheduler or an
//! orchestrator: it records obligations, hands out time-bounded exclusive
//! leases to execute them, and records outcomes as immutable receipts.
//!
//! ## Architecture
//!
//! - [`store::TaskStore`]: task rows, state machine, idempotent creation
//! - [`store::LeaseStore`]: lease rows, single-active-lease invariant,
//!   renewal and lifetime caps
//! - [`store::ReceiptLedger`]: append-only receipts with parent links and
//!   content-hash dedup
//! - [`termination`]: the static truth table of which receipt types
//!   discharge which obligations
//! - [`engine::TaskEngine`]: composes the stores under savepoint-scoped
//!   atomic blocks
//! - [`engine::ObligationQuery`]: batched derivation of open obligations
//! - [`sweeper::LeaseSweeper`]: background expiry of stale leases
//!
//! The persistent store is the sole source of truth; there is no in-process
//! cache of task, lease, or receipt state.

pub mod canonical;
pub mod config;
pub mod database;
pub mod engine;
pub mod error;
pub mod logging;
pub mod models;
pub mod store;
pub mod sweeper;
pub mod termination;

pub use config::AsyncGateConfig;
pub use engine::TaskEngine;
pub use error::{EngineError, Result};
pub use sweeper::LeaseSweeper;
