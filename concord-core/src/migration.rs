//! Schema migration chain.
//!
//! Records stored under an older schema version are walked forward one
//! [`SchemaMapper`] at a time until they reach the entity's current version
//! or no mapper accepts the version they are at.

use std::fmt;
use std::sync::Arc;

use tracing::{trace, warn};

use crate::error::{ConfigError, PersistResult};
use crate::Record;

/// A version-to-version record transform.
pub trait SchemaMapper: Send + Sync {
    fn source_version(&self) -> &str;

    fn target_version(&self) -> &str;

    /// Rewrite a record stored at `source_version` into `target_version` form.
    fn map(&self, record: Record) -> PersistResult<Record>;
}

type MapFn = dyn Fn(Record) -> PersistResult<Record> + Send + Sync;

/// Schema mapper backed by a closure.
pub struct FnMapper {
    source: String,
    target: String,
    map: Box<MapFn>,
}

impl FnMapper {
    pub fn new<F>(source: impl Into<String>, target: impl Into<String>, map: F) -> Self
    where
        F: Fn(Record) -> PersistResult<Record> + Send + Sync + 'static,
    {
        Self {
            source: source.into(),
            target: target.into(),
            map: Box::new(map),
        }
    }
}

impl SchemaMapper for FnMapper {
    fn source_version(&self) -> &str {
        &self.source
    }

    fn target_version(&self) -> &str {
        &self.target
    }

    fn map(&self, record: Record) -> PersistResult<Record> {
        (self.map)(record)
    }
}

impl fmt::Debug for FnMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnMapper")
            .field("source", &self.source)
            .field("target", &self.target)
            .finish()
    }
}

/// Outcome of walking a record through the chain.
#[derive(Debug, Clone, PartialEq)]
pub struct Migrated {
    pub record: Record,
    /// Version the record ended at.
    pub version: String,
    /// Number of mappers applied.
    pub applied: usize,
}

/// The ordered mappers of one entity type, ending at its current version.
#[derive(Clone)]
pub struct MigrationChain {
    entity: String,
    current: String,
    mappers: Vec<Arc<dyn SchemaMapper>>,
}

impl MigrationChain {
    pub fn new(entity: impl Into<String>, current: impl Into<String>, mappers: Vec<Arc<dyn SchemaMapper>>) -> Self {
        Self {
            entity: entity.into(),
            current: current.into(),
            mappers,
        }
    }

    pub fn current_version(&self) -> &str {
        &self.current
    }

    /// Version names compare case-insensitively.
    pub fn is_current(&self, version: &str) -> bool {
        version.eq_ignore_ascii_case(&self.current)
    }

    /// Mapper accepting records at `version`, if any.
    pub fn mapper_for(&self, version: &str) -> Option<&Arc<dyn SchemaMapper>> {
        if self.is_current(version) {
            return None;
        }
        self.mappers
            .iter()
            .find(|m| m.source_version().eq_ignore_ascii_case(version))
    }

    /// Walk `record`, stored at `from`, toward the current version.
    ///
    /// A record already at the current version is returned untouched. When
    /// no mapper accepts an intermediate version the walk stops there and
    /// the caller decides whether a partial migration is acceptable. A chain
    /// that applies more mappers than it holds is cyclic.
    pub fn migrate(&self, mut record: Record, from: &str) -> PersistResult<Migrated> {
        let mut version = from.to_string();
        let mut applied = 0usize;

        while !self.is_current(&version) {
            let Some(mapper) = self.mapper_for(&version) else {
                warn!(
                    entity = %self.entity,
                    version = %version,
                    current = %self.current,
                    "No schema mapper for stored version"
                );
                break;
            };
            if applied >= self.mappers.len() {
                return Err(ConfigError::CyclicMigration {
                    entity: self.entity.clone(),
                    version,
                }
                .into());
            }
            trace!(
                entity = %self.entity,
                from = %version,
                to = %mapper.target_version(),
                "Applying schema mapper"
            );
            record = mapper.map(record)?;
            version = mapper.target_version().to_string();
            applied += 1;
        }

        Ok(Migrated {
            record,
            version,
            applied,
        })
    }
}

impl fmt::Debug for MigrationChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationChain")
            .field("entity", &self.entity)
            .field("current", &self.current)
            .field(
                "mappers",
                &self
                    .mappers
                    .iter()
                    .map(|m| format!("{}->{}", m.source_version(), m.target_version()))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PersistError;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn rename(source: &str, target: &str, from: &'static str, to: &'static str) -> Arc<dyn SchemaMapper> {
        Arc::new(FnMapper::new(source, target, move |mut record: Record| {
            if let Some(v) = record.remove(from) {
                record.insert(to.to_string(), v);
            }
            Ok(record)
        }))
    }

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => unreachable!("test records are objects"),
        }
    }

    #[test]
    fn test_chain_applies_mappers_in_order() {
        let chain = MigrationChain::new(
            "Server",
            "V2",
            vec![rename("V1", "V2", "host", "hostName"), rename("V0", "V1", "name", "host")],
        );
        let migrated = chain.migrate(record(json!({"name": "web-1"})), "V0").unwrap();
        assert_eq!(migrated.applied, 2);
        assert_eq!(migrated.version, "V2");
        assert_eq!(migrated.record, record(json!({"hostName": "web-1"})));
    }

    #[test]
    fn test_current_version_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let chain = MigrationChain::new(
            "Server",
            "V2",
            vec![Arc::new(FnMapper::new("V1", "V2", move |r| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(r)
            })) as Arc<dyn SchemaMapper>],
        );
        let migrated = chain.migrate(record(json!({"a": 1})), "v2").unwrap();
        assert_eq!(migrated.applied, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_missing_mapper_stops_at_reached_version() {
        let chain = MigrationChain::new("Server", "V3", vec![rename("V0", "V1", "a", "b")]);
        let migrated = chain.migrate(record(json!({"a": 1})), "V0").unwrap();
        assert_eq!(migrated.version, "V1");
        assert_eq!(migrated.applied, 1);
        assert!(!chain.is_current(&migrated.version));
    }

    #[test]
    fn test_cycle_is_a_config_error() {
        let chain = MigrationChain::new(
            "Server",
            "V9",
            vec![rename("V0", "V1", "a", "b"), rename("V1", "V0", "b", "a")],
        );
        let err = chain.migrate(record(json!({"a": 1})), "V0").unwrap_err();
        assert!(matches!(
            err,
            PersistError::Config(ConfigError::CyclicMigration { .. })
        ));
    }

    #[test]
    fn test_mapper_lookup_ignores_case() {
        let chain = MigrationChain::new("Server", "V1", vec![rename("v0", "V1", "a", "b")]);
        assert!(chain.mapper_for("V0").is_some());
        assert!(chain.mapper_for("V1").is_none());
    }

    #[test]
    fn test_mapper_failure_propagates() {
        let failing: Arc<dyn SchemaMapper> = Arc::new(FnMapper::new("V0", "V1", |_| {
            Err(ConfigError::InvalidValue {
                field: "legacy".to_string(),
                value: "?".to_string(),
                reason: "unsupported".to_string(),
            }
            .into())
        }));
        let chain = MigrationChain::new("Server", "V1", vec![failing]);
        assert!(chain.migrate(Record::new(), "V0").is_err());
    }
}
