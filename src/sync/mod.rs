//! Managed resource synchronization.
//!
//! Wraps remote fetch functions with conditional fetching, request
//! deduplication, interval refresh, bounded retry, and manual invalidation,
//! writing results through to the persistent cache.

mod coordinator;
mod policy;

pub use coordinator::{FetchFn, FetchOutcome, RequestCoordinator, ResourceState, ResourceSubscription};
pub use policy::RefreshPolicy;
