//! Policies consulted by the dispatcher.
//!
//! - [`RetryPolicy`]: whether and when a temporarily failed message is
//!   retried
//! - [`PoolResolver`]: which IP pool a message should draw its address
//!   from

pub mod pool;
pub mod retry;

pub use pool::{PoolResolver, PoolRule, ServerPoolRules, ServerPools};
pub use retry::RetryPolicy;
