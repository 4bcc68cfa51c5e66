pub mod compression;
pub mod config;
pub mod cycle;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod ledger;
pub mod linker;
pub mod merge;
pub mod models;
pub mod remote;
pub mod s3;
pub mod scheduler;
pub mod schema;
pub mod state;
pub mod storage;
pub mod tenants;
pub mod tunnel;

pub use cycle::{run_cycle, CycleOutcome, CycleReport};
pub use scheduler::Scheduler;
