//! Credential pool for the rate-limited, multi-region upstream
//!
//! Holds a set of session tokens, each pinned to one upstream region, and
//! routes every inbound request to one of them. The pool is persisted to a
//! JSON file and kept healthy by a background checker.
//!
//! Token lifecycle:
//! 1. Operator adds a token (optionally with region, model allow-list and
//!    capability tags) → entry stored enabled, liveness unknown
//! 2. Health check confirms liveness → entry becomes routable; credit and
//!    discovered capabilities are recorded
//! 3. Failed checks increment a counter → at the threshold the entry is
//!    auto-disabled and leaves rotation
//! 4. A successful manual check re-enables it
//! 5. Operator removes the token
//!
//! Region-prefixed tokens (`us-...`) are a retired format: they are refused
//! on add, dropped on load and rejected with a dedicated error when a caller
//! supplies one.

pub mod config;
pub mod entry;
pub mod error;
pub mod health;
pub mod manager;
pub mod metrics;
pub mod selector;
pub mod store;

#[cfg(test)]
mod testing;

pub use config::PoolConfig;
pub use entry::{DynamicCapabilities, TaskType, TokenEntry};
pub use error::{Error, Result};
pub use health::{HealthCheckReport, spawn_health_check_task};
pub use manager::{AddTokensReport, AmbientToken, NewToken, PoolManager, PoolSummary};
pub use selector::{PickError, PickRejection, PickRequest, PickedToken, SelectionStrategy};
pub use store::{PoolCounts, PoolStore};
