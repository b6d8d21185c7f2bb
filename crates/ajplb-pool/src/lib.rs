//! Per-worker pool of AJP endpoints.
//!
//! An [`Endpoint`] is one connection slot to one backend. A
//! [`ConnectionPool`] bounds how many of them a worker may hold, hands them
//! out to concurrent requests and evicts idle ones during maintenance.

pub mod endpoint;
pub mod pool;

pub use endpoint::Endpoint;
pub use pool::{ConnectionPool, PoolConfig, PoolStats, PooledEndpoint};
