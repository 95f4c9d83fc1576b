//! Concord Storage - Entity Cache and Storage Collaborators
//!
//! The concurrent multi-index entity cache, the lazy result cursor, the
//! per-type persistent cache API and the process registry, together with
//! the storage collaborator contract they drive and an in-memory
//! implementation of it.

use async_trait::async_trait;
use concord_core::{PersistResult, Record};

pub mod cache;
pub mod cursor;
pub mod memory;
pub mod persistent;
pub mod query;
pub mod registry;

pub use cache::{CacheStats, ConcurrentMultiCache};
pub use cursor::{cursor_pair, CursorPopulator, ForwardCursor};
pub use memory::MemoryStorage;
pub use persistent::PersistentCache;
pub use query::{Criterion, OrderBy, Query};
pub use registry::CacheRegistry;

/// Opens transactions against the backing store.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Begin a transaction. Writes in a read-only transaction fail.
    async fn begin(&self, read_only: bool) -> PersistResult<Box<dyn Transaction>>;
}

/// One unit of work against the backing store.
///
/// Every operation names the datasource it targets, so a transaction may
/// read from a replica and write to a primary. Dropping a transaction
/// without committing discards its writes.
#[async_trait]
pub trait Transaction: Send {
    fn is_read_only(&self) -> bool;

    /// Count rows of `entity` selected by the query's criteria.
    async fn count_rows(&mut self, datasource: &str, entity: &str, query: &Query) -> PersistResult<u64>;

    /// Insert a row. The returned record echoes the stored row, including
    /// a generated value for `primary_field` when none was supplied.
    async fn create_row(
        &mut self,
        datasource: &str,
        entity: &str,
        primary_field: &str,
        record: Record,
    ) -> PersistResult<Record>;

    /// Rows of `entity` selected by the query, in the query's order.
    async fn load_rows(&mut self, datasource: &str, entity: &str, query: &Query) -> PersistResult<Vec<Record>>;

    /// Overwrite the fields present in `record` on the row whose
    /// `primary_field` matches.
    async fn update_row(
        &mut self,
        datasource: &str,
        entity: &str,
        primary_field: &str,
        record: Record,
    ) -> PersistResult<()>;

    /// Delete rows selected by the query's criteria; returns the number
    /// removed.
    async fn delete_rows(&mut self, datasource: &str, entity: &str, query: &Query) -> PersistResult<u64>;

    async fn commit(self: Box<Self>) -> PersistResult<()>;

    async fn rollback(self: Box<Self>) -> PersistResult<()>;
}
