//! On-demand challenge instance lifecycle manager
//!
//! Runs as multiple stateless replicas behind a shared store; the only
//! thing replicas coordinate through is the lock space. The crate is the
//! concurrency core of the platform - the transport surface, scenario
//! packaging and the provisioning engine itself live elsewhere and consume
//! the traits exposed here.
//!
//! ## Module Structure
//!
//! - `lock/`: hierarchical reader-writer locking (local and distributed)
//! - `fanout`: the two-barrier lock-handoff task group
//! - `pool`: warm-pool size reconciliation
//! - `renewal`: instance renewal eligibility
//! - `model/`: Challenge and Instance records
//! - `store/`: persistence trait plus the SQLite backend
//! - `provision/`: provisioning engine trait surface
//! - `service/`: the lifecycle operations tying it all together
//! - `config`, `errors`: configuration and the error taxonomy

/// Service configuration
pub mod config;

/// Error taxonomy and fan-out aggregation
pub mod errors;

/// Two-barrier fan-out task group
pub mod fanout;

/// Hierarchical distributed reader-writer locking
pub mod lock;

/// Persisted domain records
pub mod model;

/// Warm-pool size reconciliation
pub mod pool;

/// Provisioning engine surface
pub mod provision;

/// Instance renewal eligibility
pub mod renewal;

/// Lifecycle operations
pub mod service;

/// Data persistence layer
pub mod store;

pub use config::{LockBackend, ServiceConfig};
pub use errors::{Error, Result};
pub use model::{Challenge, ChallengePatch, Instance, PoolBounds, UpdateStrategy};
pub use service::{ChallengeSummary, CreateChallenge, LifecycleManager};
