//! Connection pooling.

pub mod multiplexer;

pub use multiplexer::{ConnectionPool, PoolKey, PoolStats};
