//! Process registry of per-type persistent caches.
//!
//! One registry is built at startup and handed to whoever needs cache
//! access. Each entity type's model and cache are built on first request
//! and kept for the registry's lifetime.

use std::any::{Any, TypeId};
use std::sync::Arc;

use concord_core::{ConfigError, Entity, EntityModel, PersistConfig, PersistResult};
use dashmap::DashMap;
use tracing::debug;

use crate::persistent::PersistentCache;
use crate::{Storage, Transaction};

type AnyCache = Arc<dyn Any + Send + Sync>;

pub struct CacheRegistry {
    storage: Arc<dyn Storage>,
    config: Arc<PersistConfig>,
    caches: DashMap<TypeId, AnyCache>,
}

impl CacheRegistry {
    pub fn new(storage: Arc<dyn Storage>, config: PersistConfig) -> PersistResult<Self> {
        config.validate()?;
        Ok(Self {
            storage,
            config: Arc::new(config),
            caches: DashMap::new(),
        })
    }

    pub fn config(&self) -> &PersistConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// The cache for `T`, built on first request.
    ///
    /// Concurrent first requests may each build a cache; the first one
    /// installed wins and the others are discarded.
    pub fn cache_for<T: Entity>(&self) -> PersistResult<Arc<PersistentCache<T>>> {
        let type_id = TypeId::of::<T>();
        if let Some(existing) = self.caches.get(&type_id).map(|e| Arc::clone(e.value())) {
            return downcast::<T>(existing);
        }

        let model = EntityModel::of::<T>()?;
        let built: AnyCache = Arc::new(PersistentCache::<T>::new(
            model,
            Arc::clone(&self.storage),
            Arc::clone(&self.config),
        ));
        let installed = Arc::clone(
            self.caches
                .entry(type_id)
                .or_insert_with(|| Arc::clone(&built))
                .value(),
        );
        if Arc::ptr_eq(&installed, &built) {
            debug!(entity = %std::any::type_name::<T>(), "Registered entity cache");
        } else {
            debug!(entity = %std::any::type_name::<T>(), "Discarded concurrently built entity cache");
        }
        downcast::<T>(installed)
    }

    /// Whether a cache for `T` has been built.
    pub fn is_registered<T: Entity>(&self) -> bool {
        self.caches.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.caches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }

    /// Open a transaction for writes through any registered cache.
    pub async fn transaction(&self, read_only: bool) -> PersistResult<Box<dyn Transaction>> {
        self.storage.begin(read_only).await
    }
}

fn downcast<T: Entity>(cache: AnyCache) -> PersistResult<Arc<PersistentCache<T>>> {
    cache.downcast::<PersistentCache<T>>().map_err(|_| {
        ConfigError::InvalidValue {
            field: "registry".to_string(),
            value: std::any::type_name::<T>().to_string(),
            reason: "registered cache has a different entity type".to_string(),
        }
        .into()
    })
}

impl std::fmt::Debug for CacheRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheRegistry")
            .field("config", &self.config)
            .field("caches", &self.caches.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStorage;
    use concord_core::{EntityDescriptor, FieldDef, FieldType, State};

    #[derive(Debug)]
    struct Zone {
        code: String,
    }

    impl Entity for Zone {
        fn descriptor() -> EntityDescriptor {
            EntityDescriptor::new("Zone").with_field(FieldDef::new("code", FieldType::Text).primary())
        }

        fn from_state(mut state: State) -> PersistResult<Self> {
            Ok(Self {
                code: state.take("code")?,
            })
        }

        fn to_state(&self) -> State {
            State::new().with("code", self.code.clone())
        }
    }

    struct Unkeyed;

    impl Entity for Unkeyed {
        fn descriptor() -> EntityDescriptor {
            EntityDescriptor::new("Unkeyed").with_field(FieldDef::new("name", FieldType::Text))
        }

        fn from_state(_: State) -> PersistResult<Self> {
            Ok(Self)
        }

        fn to_state(&self) -> State {
            State::new()
        }
    }

    fn registry() -> CacheRegistry {
        CacheRegistry::new(Arc::new(MemoryStorage::new()), PersistConfig::default()).unwrap()
    }

    #[test]
    fn test_cache_is_memoized_per_type() {
        let registry = registry();
        assert!(!registry.is_registered::<Zone>());
        let first = registry.cache_for::<Zone>().unwrap();
        let second = registry.cache_for::<Zone>().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(registry.is_registered::<Zone>());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_type_without_primary_key_is_rejected() {
        let registry = registry();
        assert!(registry.cache_for::<Unkeyed>().unwrap_err().is_config());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = PersistConfig::default().with_cursor_buffer(0);
        assert!(CacheRegistry::new(Arc::new(MemoryStorage::new()), config).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_first_requests_share_one_cache() {
        let registry = Arc::new(registry());
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move { registry.cache_for::<Zone>().unwrap() }));
        }
        let mut caches = Vec::new();
        for task in tasks {
            caches.push(task.await.unwrap());
        }
        assert!(caches.iter().all(|c| Arc::ptr_eq(c, &caches[0])));
    }

    #[tokio::test]
    async fn test_transaction_from_registry() {
        let registry = registry();
        let tx = registry.transaction(true).await.unwrap();
        assert!(tx.is_read_only());
        tx.rollback().await.unwrap();
    }
}
