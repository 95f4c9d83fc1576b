//! In-memory storage collaborator.
//!
//! Tables are keyed by (datasource, entity) and hold rows by the text of
//! their primary key. Transactions buffer writes and apply them on commit;
//! reads inside a transaction see committed rows overlaid with its own
//! pending writes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use concord_core::{raw_text, PersistResult, Record, StorageError};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::query::{sort_records, Query};
use crate::{Storage, Transaction};

type TableId = (String, String);

#[derive(Debug, Clone)]
struct StoredRow {
    /// Insertion sequence; unordered loads return rows in this order.
    seq: u64,
    record: Record,
}

type Table = BTreeMap<String, StoredRow>;

#[derive(Debug, Default)]
struct Inner {
    tables: RwLock<BTreeMap<TableId, Table>>,
    key_sequence: AtomicI64,
    row_sequence: AtomicU64,
    loads: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

/// Transactional in-memory [`Storage`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a committed row directly, bypassing transactions.
    pub async fn insert_row(&self, datasource: &str, entity: &str, primary_field: &str, record: Record) {
        let pk = record.get(primary_field).map(raw_text).unwrap_or_default();
        let row = StoredRow {
            seq: self.inner.row_sequence.fetch_add(1, Ordering::Relaxed),
            record,
        };
        self.inner
            .tables
            .write()
            .await
            .entry(table_id(datasource, entity))
            .or_default()
            .insert(pk, row);
    }

    /// Committed rows of one table, in insertion order.
    pub async fn rows(&self, datasource: &str, entity: &str) -> Vec<Record> {
        let tables = self.inner.tables.read().await;
        let mut rows: Vec<StoredRow> = tables
            .get(&table_id(datasource, entity))
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default();
        rows.sort_by_key(|r| r.seq);
        rows.into_iter().map(|r| r.record).collect()
    }

    /// Datasources holding at least one table.
    pub async fn datasources(&self) -> Vec<String> {
        let tables = self.inner.tables.read().await;
        let mut names: Vec<String> = tables.keys().map(|(ds, _)| ds.clone()).collect();
        names.dedup();
        names
    }

    /// Number of `load_rows` calls served.
    pub fn load_count(&self) -> u64 {
        self.inner.loads.load(Ordering::SeqCst)
    }

    pub fn commit_count(&self) -> u64 {
        self.inner.commits.load(Ordering::SeqCst)
    }

    pub fn rollback_count(&self) -> u64 {
        self.inner.rollbacks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn begin(&self, read_only: bool) -> PersistResult<Box<dyn Transaction>> {
        trace!(read_only, "Begin memory transaction");
        Ok(Box::new(MemoryTransaction {
            inner: Arc::clone(&self.inner),
            read_only,
            pending: BTreeMap::new(),
        }))
    }
}

fn table_id(datasource: &str, entity: &str) -> TableId {
    (datasource.to_string(), entity.to_string())
}

/// `None` marks a pending delete.
type PendingTable = BTreeMap<String, Option<StoredRow>>;

struct MemoryTransaction {
    inner: Arc<Inner>,
    read_only: bool,
    pending: BTreeMap<TableId, PendingTable>,
}

impl MemoryTransaction {
    fn ensure_writable(&self, datasource: &str) -> PersistResult<()> {
        if self.read_only {
            return Err(StorageError::ReadOnly {
                datasource: datasource.to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Rows visible to this transaction, keyed by primary key text.
    async fn visible(&self, datasource: &str, entity: &str) -> Table {
        let id = table_id(datasource, entity);
        let mut table = self
            .inner
            .tables
            .read()
            .await
            .get(&id)
            .cloned()
            .unwrap_or_default();
        if let Some(pending) = self.pending.get(&id) {
            for (pk, row) in pending {
                match row {
                    Some(row) => {
                        table.insert(pk.clone(), row.clone());
                    }
                    None => {
                        table.remove(pk);
                    }
                }
            }
        }
        table
    }

    /// Rows matching every criterion, in insertion order.
    async fn select(
        &self,
        datasource: &str,
        entity: &str,
        query: &Query,
        operation: &str,
    ) -> PersistResult<Vec<(String, Record)>> {
        let mut joined = BTreeMap::new();
        for criterion in query.criteria.iter().filter(|c| c.join_entity.is_some()) {
            let target = criterion.join_entity.as_deref().unwrap_or_default();
            if !joined.contains_key(target) {
                let rows: Vec<Record> = self
                    .visible(datasource, target)
                    .await
                    .into_values()
                    .map(|r| r.record)
                    .collect();
                joined.insert(target.to_string(), rows);
            }
        }

        let mut rows: Vec<(String, StoredRow)> = self.visible(datasource, entity).await.into_iter().collect();
        rows.sort_by_key(|(_, r)| r.seq);

        let mut selected = Vec::new();
        for (pk, row) in rows {
            let mut matched = true;
            for criterion in &query.criteria {
                let hit = match &criterion.join_entity {
                    None => criterion.matches(&row.record),
                    Some(target) => {
                        let join = query.joins.iter().find(|j| &j.entity == target).ok_or_else(|| {
                            StorageError::Backend {
                                entity: entity.to_string(),
                                operation: operation.to_string(),
                                reason: format!("no join declared for {target}"),
                            }
                        })?;
                        let local = row.record.get(&join.local_field).unwrap_or(&Value::Null);
                        joined.get(target).is_some_and(|candidates| {
                            candidates.iter().any(|other| {
                                other.get(&join.join_field) == Some(local)
                                    && !local.is_null()
                                    && criterion.matches(other)
                            })
                        })
                    }
                };
                if !hit {
                    matched = false;
                    break;
                }
            }
            if matched {
                selected.push((pk, row.record));
            }
        }
        Ok(selected)
    }

    fn stage(&mut self, datasource: &str, entity: &str, pk: String, row: Option<StoredRow>) {
        self.pending
            .entry(table_id(datasource, entity))
            .or_default()
            .insert(pk, row);
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    fn is_read_only(&self) -> bool {
        self.read_only
    }

    async fn count_rows(&mut self, datasource: &str, entity: &str, query: &Query) -> PersistResult<u64> {
        Ok(self.select(datasource, entity, query, "count_rows").await?.len() as u64)
    }

    async fn create_row(
        &mut self,
        datasource: &str,
        entity: &str,
        primary_field: &str,
        mut record: Record,
    ) -> PersistResult<Record> {
        self.ensure_writable(datasource)?;
        let existing = self.visible(datasource, entity).await;
        if record.get(primary_field).map_or(true, Value::is_null) {
            let generated = loop {
                let candidate = self.inner.key_sequence.fetch_add(1, Ordering::SeqCst) + 1;
                if !existing.contains_key(&candidate.to_string()) {
                    break candidate;
                }
            };
            record.insert(primary_field.to_string(), Value::from(generated));
        }
        let pk = record.get(primary_field).map(raw_text).unwrap_or_default();
        if existing.contains_key(&pk) {
            return Err(StorageError::Backend {
                entity: entity.to_string(),
                operation: "create_row".to_string(),
                reason: format!("duplicate primary key {pk}"),
            }
            .into());
        }
        let row = StoredRow {
            seq: self.inner.row_sequence.fetch_add(1, Ordering::Relaxed),
            record: record.clone(),
        };
        self.stage(datasource, entity, pk, Some(row));
        Ok(record)
    }

    async fn load_rows(&mut self, datasource: &str, entity: &str, query: &Query) -> PersistResult<Vec<Record>> {
        self.inner.loads.fetch_add(1, Ordering::SeqCst);
        let mut rows: Vec<Record> = self
            .select(datasource, entity, query, "load_rows")
            .await?
            .into_iter()
            .map(|(_, r)| r)
            .collect();
        if let Some(order) = &query.order {
            sort_records(&mut rows, order);
        }
        debug!(datasource, entity, rows = rows.len(), "Loaded rows");
        Ok(rows)
    }

    async fn update_row(
        &mut self,
        datasource: &str,
        entity: &str,
        primary_field: &str,
        record: Record,
    ) -> PersistResult<()> {
        self.ensure_writable(datasource)?;
        let pk = record.get(primary_field).map(raw_text).unwrap_or_default();
        let mut row = self
            .visible(datasource, entity)
            .await
            .remove(&pk)
            .ok_or_else(|| StorageError::MissingRow {
                entity: entity.to_string(),
                key: pk.clone(),
            })?;
        row.record.extend(record);
        self.stage(datasource, entity, pk, Some(row));
        Ok(())
    }

    async fn delete_rows(&mut self, datasource: &str, entity: &str, query: &Query) -> PersistResult<u64> {
        self.ensure_writable(datasource)?;
        let doomed = self.select(datasource, entity, query, "delete_rows").await?;
        let count = doomed.len() as u64;
        for (pk, _) in doomed {
            self.stage(datasource, entity, pk, None);
        }
        Ok(count)
    }

    async fn commit(self: Box<Self>) -> PersistResult<()> {
        let this = *self;
        if !this.pending.is_empty() {
            let mut tables = this.inner.tables.write().await;
            for (id, pending) in this.pending {
                let table = tables.entry(id).or_default();
                for (pk, row) in pending {
                    match row {
                        Some(row) => {
                            table.insert(pk, row);
                        }
                        None => {
                            table.remove(&pk);
                        }
                    }
                }
            }
        }
        this.inner.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> PersistResult<()> {
        self.inner.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
