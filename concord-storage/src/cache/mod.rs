//! Concurrent multi-index entity cache.
//!
//! Every registered instance is reachable through its primary key value and
//! through each secondary and foreign key value derived from its current
//! state. All views share the one `Arc` per primary key, so a lookup through
//! any index returns the identical instance.
//!
//! # Singleflight
//!
//! Concurrent misses on the same (index, key value) pair share one loader
//! invocation. Waiters receive the loader's instance, its "not found" or its
//! failure. Unrelated keys never wait on each other.
//!
//! # Example
//!
//! ```ignore
//! let cache = ConcurrentMultiCache::<Server>::new(Arc::new(EntityModel::of::<Server>()?));
//! let server = cache
//!     .find(cache.model().primary_key(), "42", || async { load_server(42).await })
//!     .await?;
//! ```

pub mod multi;
pub mod stats;

pub use multi::ConcurrentMultiCache;
pub use stats::CacheStats;
