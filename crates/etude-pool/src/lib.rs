//! # etude-pool
//!
//! A bounded pool of reusable backend connections, shared by the worker
//! threads of an Etude server.
//!
//! ## Features
//! - **Bounded**: `idle + active` never exceeds the configured maximum.
//! - **Timeouts**: `acquire` waits at most the given duration.
//! - **RAII handles**: a connection goes back to the pool when its
//!   [`PooledConnection`] drops, after a liveness probe.
//! - **Supervised**: a background thread keeps `min` connections warm,
//!   health-checks idle ones and evicts those unused for too long.

pub mod error;
pub mod pool;

pub use error::{PoolError, PoolResult};
pub use pool::{ManageConnection, Pool, PoolConfig, PoolState, PooledConnection};
