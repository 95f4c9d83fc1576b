//! Per-type persistent cache: the application-facing API.
//!
//! Reads go through the [`ConcurrentMultiCache`], so every instance handed
//! out is the single registered instance for its primary key. Writes run in
//! caller-supplied transactions against the storage collaborator and then
//! update the cache.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use concord_core::{
    to_primitive, Entity, EntityModel, FieldValue, Operator, PersistConfig, PersistResult, Record, SearchTerm,
    SearchValue, State, StorageError, ValidationError,
};
use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::{CacheStats, ConcurrentMultiCache};
use crate::cursor::{spawn_cursor, ForwardCursor};
use crate::query::{criteria_for, Criterion, OrderBy, Query};
use crate::{Storage, Transaction};

/// Predicate applied to materialized instances before they are returned.
pub type ResultFilter<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

pub struct PersistentCache<T: Entity> {
    model: Arc<EntityModel>,
    cache: ConcurrentMultiCache<T>,
    storage: Arc<dyn Storage>,
    config: Arc<PersistConfig>,
    key_sequence: AtomicI64,
}

impl<T: Entity> PersistentCache<T> {
    pub fn new(model: EntityModel, storage: Arc<dyn Storage>, config: Arc<PersistConfig>) -> Self {
        let model = Arc::new(model.with_strict_migration(config.strict_migration));
        Self {
            cache: ConcurrentMultiCache::new(Arc::clone(&model)),
            model,
            storage,
            config,
            key_sequence: AtomicI64::new(0),
        }
    }

    pub fn model(&self) -> &Arc<EntityModel> {
        &self.model
    }

    /// The underlying identity cache.
    pub fn cache(&self) -> &ConcurrentMultiCache<T> {
        &self.cache
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn read_datasource(&self) -> &str {
        self.config.read_datasource(self.model.type_name())
    }

    pub fn write_datasource(&self) -> &str {
        self.config.write_datasource(self.model.type_name())
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Instance by primary key value; `None` when no row exists.
    pub async fn get(&self, value: impl Into<FieldValue>) -> PersistResult<Option<Arc<T>>> {
        let value = value.into();
        let field = self.model.primary_field();
        let Some(key_value) = self.model.render_key_part(field, &value)? else {
            return Ok(None);
        };
        let terms = [SearchTerm::eq(field, value)];
        self.cache
            .find(self.model.primary_key(), &key_value, || self.load_first(&terms))
            .await
    }

    /// First instance matching `terms`.
    ///
    /// Equality terms that match one index and select a single key value are
    /// answered from the cache; anything else falls back to [`find`](Self::find).
    pub async fn find_one(&self, terms: &[SearchTerm]) -> PersistResult<Option<Arc<T>>> {
        let indexable = terms.iter().all(|t| {
            t.join_entity.is_none()
                && (t.operator == Operator::Equals || matches!(t.value, SearchValue::Range(_)))
        });
        if let Some(key) = self.model.index().match_index(terms).filter(|_| indexable) {
            let mut values = self.model.term_key_values(key, terms, Some(2))?.into_iter();
            match (values.next(), values.next()) {
                (None, _) => return Ok(None),
                (Some(value), None) => {
                    return self.cache.find(key, &value, || self.load_first(terms)).await;
                }
                _ => {}
            }
        }
        Ok(self.find(terms, None, None).await?.into_iter().next())
    }

    /// Every instance matching `terms`, optionally filtered and ordered.
    pub async fn find(
        &self,
        terms: &[SearchTerm],
        filter: Option<ResultFilter<T>>,
        order: Option<OrderBy>,
    ) -> PersistResult<Vec<Arc<T>>> {
        let rows = self.load_rows(&self.query(terms, order)?).await?;
        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let item = self.cache.find_record(row).await?;
            if filter.as_ref().map_or(true, |accept| accept(&item)) {
                items.push(item);
            }
        }
        Ok(items)
    }

    /// Like [`find`](Self::find), streamed through a cursor populated by a
    /// background task.
    pub fn find_as_cursor(
        self: &Arc<Self>,
        terms: Vec<SearchTerm>,
        filter: Option<ResultFilter<T>>,
        order: Option<OrderBy>,
    ) -> ForwardCursor<Arc<T>> {
        let this = Arc::clone(self);
        let name = format!("{}.find", self.model.type_name());
        spawn_cursor(name, self.config.cursor_buffer, move |mut populator| async move {
            let rows = match this.query(&terms, order) {
                Ok(query) => this.load_rows(&query).await,
                Err(err) => Err(err),
            };
            let rows = match rows {
                Ok(rows) => rows,
                Err(err) => return populator.set_load_error(err).await,
            };
            for row in rows {
                match this.cache.find_record(row).await {
                    Ok(item) => {
                        if filter.as_ref().map_or(true, |accept| accept(&item)) && !populator.push(item).await {
                            return;
                        }
                    }
                    Err(err) => return populator.set_load_error(err).await,
                }
            }
            populator.complete().await;
        })
    }

    pub async fn list(&self) -> PersistResult<Vec<Arc<T>>> {
        self.find(&[], None, None).await
    }

    pub async fn list_ordered(&self, descending: bool, fields: &[&str]) -> PersistResult<Vec<Arc<T>>> {
        self.find(&[], None, Some(OrderBy::new(fields.iter().copied(), descending)))
            .await
    }

    pub fn list_as_cursor(self: &Arc<Self>, order: Option<OrderBy>) -> ForwardCursor<Arc<T>> {
        self.find_as_cursor(Vec::new(), None, order)
    }

    pub async fn count(&self) -> PersistResult<u64> {
        self.count_matching(&[]).await
    }

    pub async fn count_matching(&self, terms: &[SearchTerm]) -> PersistResult<u64> {
        let query = self.query(terms, None)?;
        let mut tx = self.storage.begin(true).await?;
        let result = tx
            .count_rows(self.read_datasource(), self.model.entity_name(), &query)
            .await;
        finish(tx, result).await
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Insert a new row and return its registered instance.
    pub async fn create(&self, tx: &mut dyn Transaction, state: State) -> PersistResult<Arc<T>> {
        let record = self.model.to_record(&self.model.normalize_state(&state)?)?;
        let echoed = tx
            .create_row(
                self.write_datasource(),
                self.model.entity_name(),
                self.model.primary_field(),
                record,
            )
            .await?;
        if echoed.get(self.model.primary_field()).map_or(true, Value::is_null) {
            return Err(StorageError::MissingGeneratedKey {
                entity: self.model.entity_name().to_string(),
                field: self.model.primary_field().to_string(),
            }
            .into());
        }
        let item = self.cache.find_record(echoed).await?;
        debug!(entity = %self.model.type_name(), "Created");
        Ok(item)
    }

    /// Apply `changes` to `item`'s row and re-register the updated instance.
    ///
    /// Changes are brought to their declared field types and the updated
    /// instance is built before anything is written, so a rejected change
    /// leaves the transaction untouched.
    pub async fn update(&self, tx: &mut dyn Transaction, item: &T, changes: State) -> PersistResult<Arc<T>> {
        let mut state = item.to_state();
        state.merge(self.model.normalize_state(&changes)?);
        if self.model.key_value(self.model.primary_key(), &state).is_none() {
            return Err(ValidationError::RequiredFieldMissing {
                field: self.model.primary_field().to_string(),
            }
            .into());
        }
        let updated = T::from_state(state.clone())?;
        let mut record = self.model.to_record(&state)?;
        // Nulls must reach storage to clear a column.
        for field in self.model.persistent_fields() {
            if state.get(&field.name).is_some_and(FieldValue::is_null) {
                record.insert(field.name.clone(), Value::Null);
            }
        }
        tx.update_row(
            self.write_datasource(),
            self.model.entity_name(),
            self.model.primary_field(),
            record,
        )
        .await?;
        let updated = self.cache.cache(updated)?;
        debug!(entity = %self.model.type_name(), "Updated");
        Ok(updated)
    }

    /// Apply `changes` to every instance matching `terms`.
    pub async fn update_all(
        &self,
        tx: &mut dyn Transaction,
        changes: State,
        terms: &[SearchTerm],
    ) -> PersistResult<Vec<Arc<T>>> {
        let items = self.find(terms, None, None).await?;
        let mut updated = Vec::with_capacity(items.len());
        for item in items {
            updated.push(self.update(tx, &item, changes.clone()).await?);
        }
        Ok(updated)
    }

    /// Delete `item`'s row and release it from the cache.
    pub async fn remove(&self, tx: &mut dyn Transaction, item: &T) -> PersistResult<()> {
        let state = item.to_state();
        let key = state
            .get(self.model.primary_field())
            .filter(|v| !v.is_null())
            .map(to_primitive)
            .ok_or_else(|| ValidationError::RequiredFieldMissing {
                field: self.model.primary_field().to_string(),
            })?;
        let query = Query::new().with_criteria(vec![Criterion::eq(self.model.primary_field(), key)]);
        tx.delete_rows(self.write_datasource(), self.model.entity_name(), &query)
            .await?;
        self.cache.release(item);
        Ok(())
    }

    /// Delete every row matching `terms` and release matching cached
    /// instances. Returns the number of rows deleted.
    pub async fn remove_matching(&self, tx: &mut dyn Transaction, terms: &[SearchTerm]) -> PersistResult<u64> {
        let query = self.query(terms, None)?;
        let removed = tx
            .delete_rows(self.write_datasource(), self.model.entity_name(), &query)
            .await?;

        let criteria = &query.criteria;
        if criteria.iter().any(|c| c.join_entity.is_some()) {
            // Cannot evaluate joined criteria in memory.
            self.cache.release_all();
        } else {
            for item in self.cache.values() {
                // An instance that cannot be rendered is released too.
                let matched = self
                    .model
                    .to_record(&item.to_state())
                    .map_or(true, |record| criteria.iter().all(|c| c.matches(&record)));
                if matched {
                    self.cache.release(&item);
                }
            }
        }
        debug!(entity = %self.model.type_name(), removed, "Removed matching");
        Ok(removed)
    }

    /// Next process-local key value for this entity type.
    pub fn next_key_value(&self) -> i64 {
        self.key_sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn release_all(&self) {
        self.cache.release_all();
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    fn query(&self, terms: &[SearchTerm], order: Option<OrderBy>) -> PersistResult<Query> {
        Ok(Query::new()
            .with_criteria(criteria_for(&self.model, terms)?)
            .with_order(order)
            .with_joins(self.model.joins().to_vec()))
    }

    async fn load_rows(&self, query: &Query) -> PersistResult<Vec<Record>> {
        let mut tx = self.storage.begin(true).await?;
        let result = tx
            .load_rows(self.read_datasource(), self.model.entity_name(), query)
            .await;
        finish(tx, result).await
    }

    async fn load_first(&self, terms: &[SearchTerm]) -> PersistResult<Option<T>> {
        let rows = self.load_rows(&self.query(terms, None)?).await?;
        match rows.into_iter().next() {
            Some(row) => self.model.materialize::<T>(row).map(Some),
            None => Ok(None),
        }
    }
}

impl<T: Entity> std::fmt::Debug for PersistentCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentCache")
            .field("entity", &self.model.type_name())
            .field("cache", &self.cache)
            .finish()
    }
}

/// Commit on success, roll back on failure.
async fn finish<R>(tx: Box<dyn Transaction>, result: PersistResult<R>) -> PersistResult<R> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback) = tx.rollback().await {
                warn!(error = %rollback, "Rollback failed");
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStorage;
    use concord_core::{EntityDescriptor, FieldDef, FieldType, Key, PersistError};
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq)]
    struct Disk {
        disk_id: i64,
        label: String,
        size_gb: i32,
    }

    impl Entity for Disk {
        fn descriptor() -> EntityDescriptor {
            EntityDescriptor::new("Disk")
                .with_field(FieldDef::new("diskId", FieldType::Long).primary())
                .with_field(FieldDef::new("label", FieldType::Text).secondary())
                .with_field(FieldDef::new("sizeGb", FieldType::Int))
        }

        fn from_state(mut state: State) -> PersistResult<Self> {
            Ok(Self {
                disk_id: state.take("diskId")?,
                label: state.take("label")?,
                size_gb: state.take("sizeGb")?,
            })
        }

        fn to_state(&self) -> State {
            State::new()
                .with("diskId", self.disk_id)
                .with("label", self.label.clone())
                .with("sizeGb", self.size_gb)
        }
    }

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => unreachable!("test records are objects"),
        }
    }

    async fn disks() -> (MemoryStorage, PersistentCache<Disk>) {
        let storage = MemoryStorage::new();
        for (id, label, size) in [(1, "boot", 20), (2, "data", 500), (3, "logs", 50)] {
            storage
                .insert_row(
                    "default",
                    "disk",
                    "diskId",
                    record(json!({"diskId": id, "label": label, "sizeGb": size})),
                )
                .await;
        }
        let cache = PersistentCache::new(
            EntityModel::of::<Disk>().unwrap(),
            Arc::new(storage.clone()),
            Arc::new(PersistConfig::default()),
        );
        (storage, cache)
    }

    #[tokio::test]
    async fn test_get_loads_once_then_hits() {
        let (storage, disks) = disks().await;
        let first = disks.get(2i64).await.unwrap().unwrap();
        let second = disks.get("2").await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(storage.load_count(), 1);
        assert!(disks.get(99i64).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_one_uses_secondary_index() {
        let (storage, disks) = disks().await;
        let by_label = disks.find_one(&[SearchTerm::eq("label", "logs")]).await.unwrap().unwrap();
        let again = disks.find_one(&[SearchTerm::eq("label", "logs")]).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&by_label, &again));
        assert_eq!(storage.load_count(), 1);
        let by_id = disks.get(3i64).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&by_label, &by_id));
    }

    #[tokio::test]
    async fn test_find_with_filter_and_order() {
        let (_, disks) = disks().await;
        let big: ResultFilter<Disk> = Arc::new(|d: &Disk| d.size_gb >= 50);
        let found = disks
            .find(&[], Some(big), Some(OrderBy::new(["sizeGb"], true)))
            .await
            .unwrap();
        let labels: Vec<&str> = found.iter().map(|d| d.label.as_str()).collect();
        assert_eq!(labels, vec!["data", "logs"]);

        let ordered = disks.list_ordered(false, &["label"]).await.unwrap();
        assert_eq!(ordered[0].label, "boot");
        assert_eq!(disks.count().await.unwrap(), 3);
        assert_eq!(
            disks
                .count_matching(&[SearchTerm::new("sizeGb", Operator::LessThan, 100)])
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_create_update_remove() {
        let (storage, disks) = disks().await;
        let mut tx = storage.begin(false).await.unwrap();
        let created = disks
            .create(tx.as_mut(), State::new().with("label", "scratch").with("sizeGb", 10))
            .await
            .unwrap();
        assert_eq!(created.label, "scratch");

        let updated = disks
            .update(tx.as_mut(), &created, State::new().with("label", "tmp"))
            .await
            .unwrap();
        assert!(disks.cache().peek(&Key::new(["label"]), "scratch").unwrap().is_none());
        let by_label = disks.cache().peek(&Key::new(["label"]), "tmp").unwrap().unwrap();
        assert!(Arc::ptr_eq(&by_label, &updated));

        disks.remove(tx.as_mut(), &updated).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(disks.count().await.unwrap(), 3);
        assert_eq!(disks.cache().len(), 0);
    }

    #[tokio::test]
    async fn test_update_retypes_changes_before_writing() {
        let (storage, disks) = disks().await;
        let disk = disks.get(1i64).await.unwrap().unwrap();

        let mut tx = storage.begin(false).await.unwrap();
        let updated = disks
            .update(tx.as_mut(), &disk, State::new().with("sizeGb", 40i64))
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(updated.size_gb, 40);
        assert_eq!(storage.rows("default", "disk").await[0]["sizeGb"], json!(40));
        assert!(Arc::ptr_eq(&updated, &disks.get(1i64).await.unwrap().unwrap()));
    }

    #[tokio::test]
    async fn test_rejected_update_writes_nothing() {
        let (storage, disks) = disks().await;
        let disk = disks.get(1i64).await.unwrap().unwrap();

        let mut tx = storage.begin(false).await.unwrap();
        let unknown = disks
            .update(tx.as_mut(), &disk, State::new().with("sizeGb", 30).with("vendor", "acme"))
            .await
            .unwrap_err();
        assert!(matches!(
            unknown,
            PersistError::Validation(ValidationError::UnknownField { .. })
        ));
        let unparsable = disks
            .update(tx.as_mut(), &disk, State::new().with("sizeGb", "huge"))
            .await
            .unwrap_err();
        assert!(matches!(unparsable, PersistError::Coercion(_)));
        tx.commit().await.unwrap();

        assert_eq!(storage.rows("default", "disk").await[0]["sizeGb"], json!(20));
        assert!(Arc::ptr_eq(&disk, &disks.get(1i64).await.unwrap().unwrap()));
    }

    #[tokio::test]
    async fn test_remove_matching_purges_cache() {
        let (storage, disks) = disks().await;
        disks.list().await.unwrap();
        assert_eq!(disks.cache().len(), 3);

        let mut tx = storage.begin(false).await.unwrap();
        let removed = disks
            .remove_matching(tx.as_mut(), &[SearchTerm::new("sizeGb", Operator::GreaterThan, 30)])
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(disks.cache().len(), 1);
        assert_eq!(disks.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cursor_streams_list() {
        let (_, disks) = disks().await;
        let disks = Arc::new(disks);
        let items = disks
            .list_as_cursor(Some(OrderBy::new(["diskId"], false)))
            .collect()
            .await
            .unwrap();
        let ids: Vec<i64> = items.iter().map(|d| d.disk_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_next_key_value_is_monotonic() {
        let disks = PersistentCache::<Disk>::new(
            EntityModel::of::<Disk>().unwrap(),
            Arc::new(MemoryStorage::new()),
            Arc::new(PersistConfig::default()),
        );
        assert_eq!(disks.next_key_value(), 1);
        assert_eq!(disks.next_key_value(), 2);
    }
}
