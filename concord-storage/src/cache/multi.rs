//! Identity cache keyed by every index of an entity type.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use concord_core::{
    ConfigError, Entity, EntityModel, Key, PersistError, PersistResult, Record, ValidationError,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::{debug, error, trace};

use super::stats::{CacheStats, StatsCounters};

/// Index slot: 0 is the primary index, `n` is secondary index `n - 1`.
type Slot = usize;

const PRIMARY: Slot = 0;

type LoadOutcome<T> = PersistResult<Option<Arc<T>>>;

struct CacheEntry<T> {
    item: Arc<T>,
    /// Secondary key values the item is registered under, by secondary slot.
    keys: Vec<(usize, String)>,
}

struct SecondaryView {
    key: Key,
    /// Key value to the primary key values registered under it.
    entries: DashMap<String, BTreeSet<String>>,
}

/// Multi-index identity cache for one entity type.
///
/// Lock order is primary shard, then secondary shard. Readers never hold a
/// secondary guard while touching the primary map.
pub struct ConcurrentMultiCache<T: Entity> {
    model: Arc<EntityModel>,
    primary: DashMap<String, CacheEntry<T>>,
    secondary: Vec<SecondaryView>,
    loading: DashMap<(Slot, String), Arc<OnceCell<LoadOutcome<T>>>>,
    counters: StatsCounters,
}

impl<T: Entity> ConcurrentMultiCache<T> {
    pub fn new(model: Arc<EntityModel>) -> Self {
        let secondary = model
            .index()
            .secondary()
            .iter()
            .map(|key| SecondaryView {
                key: key.clone(),
                entries: DashMap::new(),
            })
            .collect();
        Self {
            model,
            primary: DashMap::new(),
            secondary,
            loading: DashMap::new(),
            counters: StatsCounters::default(),
        }
    }

    pub fn model(&self) -> &Arc<EntityModel> {
        &self.model
    }

    /// Instance registered under `value` of `key`, loading it on a miss.
    ///
    /// Concurrent misses on the same key run `loader` once. A loader result
    /// of `None` means "not found" and is not cached.
    pub async fn find<F, Fut>(&self, key: &Key, value: &str, loader: F) -> PersistResult<Option<Arc<T>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PersistResult<Option<T>>>,
    {
        let slot = self.slot(key)?;
        if let Some(item) = self.lookup(slot, value) {
            self.counters.hit();
            trace!(entity = %self.model.type_name(), index = %key, key = %value, "Cache hit");
            return Ok(Some(item));
        }
        self.counters.miss();

        let flight = (slot, value.to_string());
        let cell = Arc::clone(
            self.loading
                .entry(flight.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .value(),
        );

        let outcome = cell
            .get_or_init(move || async move {
                // Registered by a load that finished after our lookup.
                if let Some(item) = self.lookup(slot, value) {
                    return Ok(Some(item));
                }
                self.counters.load();
                debug!(entity = %self.model.type_name(), index = %key, key = %value, "Cache miss, loading");
                match loader().await {
                    Ok(Some(item)) => self.register(Arc::new(item), false).map(Some),
                    Ok(None) => Ok(None),
                    Err(err) => {
                        self.counters.load_failure();
                        error!(
                            entity = %self.model.type_name(),
                            index = %key,
                            key = %value,
                            error = %err,
                            "Cache load failed"
                        );
                        Err(err)
                    }
                }
            })
            .await
            .clone();

        self.loading
            .remove_if(&flight, |_, current| Arc::ptr_eq(current, &cell));
        outcome
    }

    /// Instance for a raw stored record.
    ///
    /// The record is migrated, validated and coerced first; an instance
    /// already registered under its primary key wins over the record.
    pub async fn find_record(&self, record: Record) -> PersistResult<Arc<T>> {
        let state = self.model.coerce_record(record)?;
        let primary = self.model.primary_key();
        let value = self
            .model
            .key_value(primary, &state)
            .ok_or_else(|| self.missing_primary())?;

        let fallback = state.clone();
        let found = self
            .find(primary, &value, move || async move { T::from_state(state).map(Some) })
            .await?;
        match found {
            Some(item) => Ok(item),
            // Shared a flight with a loader that found nothing.
            None => self.register(Arc::new(T::from_state(fallback)?), false),
        }
    }

    /// Register `item` under its current key values, replacing whatever was
    /// registered for its primary key.
    pub fn cache(&self, item: T) -> PersistResult<Arc<T>> {
        self.register(Arc::new(item), true)
    }

    /// Remove the instance with `item`'s primary key from every view.
    pub fn release(&self, item: &T) -> bool {
        match self.model.key_value(self.model.primary_key(), &item.to_state()) {
            Some(value) => self.release_key(&value),
            None => false,
        }
    }

    /// Remove the instance registered under a primary key value.
    pub fn release_key(&self, primary_value: &str) -> bool {
        match self.primary.entry(primary_value.to_string()) {
            Entry::Occupied(occupied) => {
                self.unindex(primary_value, &occupied.get().keys);
                occupied.remove();
                trace!(entity = %self.model.type_name(), key = %primary_value, "Released");
                true
            }
            Entry::Vacant(_) => false,
        }
    }

    pub fn release_all(&self) {
        let keys: Vec<String> = self.primary.iter().map(|e| e.key().clone()).collect();
        for key in &keys {
            self.release_key(key);
        }
        debug!(entity = %self.model.type_name(), released = keys.len(), "Released all");
    }

    /// Registered instance without loading.
    pub fn peek(&self, key: &Key, value: &str) -> PersistResult<Option<Arc<T>>> {
        Ok(self.lookup(self.slot(key)?, value))
    }

    /// Every registered instance under `value` of `key`.
    pub fn peek_all(&self, key: &Key, value: &str) -> PersistResult<Vec<Arc<T>>> {
        let slot = self.slot(key)?;
        if slot == PRIMARY {
            return Ok(self.lookup(slot, value).into_iter().collect());
        }
        Ok(self
            .candidates(slot, value)
            .iter()
            .filter_map(|pk| self.verified(slot, value, pk))
            .collect())
    }

    /// Snapshot of every registered instance.
    pub fn values(&self) -> Vec<Arc<T>> {
        self.primary.iter().map(|e| Arc::clone(&e.item)).collect()
    }

    pub fn len(&self) -> usize {
        self.primary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.counters.snapshot(self.primary.len())
    }

    fn slot(&self, key: &Key) -> PersistResult<Slot> {
        if key == self.model.primary_key() {
            return Ok(PRIMARY);
        }
        self.secondary
            .iter()
            .position(|view| &view.key == key)
            .map(|i| i + 1)
            .ok_or_else(|| {
                ConfigError::UnknownIndex {
                    entity: self.model.type_name().to_string(),
                    index: key.to_string(),
                }
                .into()
            })
    }

    fn lookup(&self, slot: Slot, value: &str) -> Option<Arc<T>> {
        if slot == PRIMARY {
            return self.primary.get(value).map(|e| Arc::clone(&e.item));
        }
        self.candidates(slot, value)
            .iter()
            .find_map(|pk| self.verified(slot, value, pk))
    }

    fn candidates(&self, slot: Slot, value: &str) -> Vec<String> {
        self.secondary[slot - 1]
            .entries
            .get(value)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The entry for `pk`, if it is still registered under `value`.
    fn verified(&self, slot: Slot, value: &str, pk: &str) -> Option<Arc<T>> {
        let entry = self.primary.get(pk)?;
        entry
            .keys
            .iter()
            .any(|(i, v)| *i == slot - 1 && v == value)
            .then(|| Arc::clone(&entry.item))
    }

    fn register(&self, item: Arc<T>, overwrite: bool) -> PersistResult<Arc<T>> {
        let state = item.to_state();
        let pk = self
            .model
            .key_value(self.model.primary_key(), &state)
            .ok_or_else(|| self.missing_primary())?;
        let keys: Vec<(usize, String)> = self
            .secondary
            .iter()
            .enumerate()
            .filter_map(|(i, view)| self.model.key_value(&view.key, &state).map(|v| (i, v)))
            .collect();

        match self.primary.entry(pk.clone()) {
            Entry::Occupied(mut occupied) => {
                if !overwrite {
                    return Ok(Arc::clone(&occupied.get().item));
                }
                let previous = std::mem::replace(
                    occupied.get_mut(),
                    CacheEntry {
                        item: Arc::clone(&item),
                        keys: keys.clone(),
                    },
                );
                self.unindex(&pk, &previous.keys);
                self.index(&pk, &keys);
            }
            Entry::Vacant(vacant) => {
                self.index(&pk, &keys);
                vacant.insert(CacheEntry {
                    item: Arc::clone(&item),
                    keys,
                });
            }
        }
        trace!(entity = %self.model.type_name(), key = %pk, overwrite, "Registered");
        Ok(item)
    }

    fn index(&self, pk: &str, keys: &[(usize, String)]) {
        for (i, value) in keys {
            self.secondary[*i]
                .entries
                .entry(value.clone())
                .or_default()
                .insert(pk.to_string());
        }
    }

    fn unindex(&self, pk: &str, keys: &[(usize, String)]) {
        for (i, value) in keys {
            if let Entry::Occupied(mut occupied) = self.secondary[*i].entries.entry(value.clone()) {
                occupied.get_mut().remove(pk);
                if occupied.get().is_empty() {
                    occupied.remove();
                }
            }
        }
    }

    fn missing_primary(&self) -> PersistError {
        ValidationError::RequiredFieldMissing {
            field: self.model.primary_field().to_string(),
        }
        .into()
    }
}

impl<T: Entity> std::fmt::Debug for ConcurrentMultiCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentMultiCache")
            .field("entity", &self.model.type_name())
            .field("entries", &self.primary.len())
            .field("in_flight", &self.loading.len())
            .finish()
    }
}
