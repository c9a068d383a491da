//! Pluggable data-access layer for a YCSB-style benchmark harness.
//!
//! - [`db::Db`]: the operation contract every backend implements
//! - [`transaction::TransactionDb`] / [`batch::BatchDb`]: optional
//!   capability extensions, discovered through [`db::Db::capabilities`]
//! - [`registry::Registry`]: backend name -> constructor
//! - [`harness::run_workers`]: per-worker `init_thread` / `cleanup_thread`
//!   lifecycle

pub mod backends;
pub mod batch;
pub mod codec;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod harness;
pub mod registry;
pub mod transaction;
pub mod verify;

pub use batch::{BatchDb, FieldMap};
pub use config::DbConfig;
pub use context::{CallContext, WorkerContext};
pub use db::{Capabilities, Capability, Db};
pub use error::{BatchFailure, ConfigError, DbError, DbResult};
pub use registry::{DbCreator, Registry};
pub use transaction::{Transaction, TransactionDb, TxnState};
