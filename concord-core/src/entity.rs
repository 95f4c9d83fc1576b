//! Entity declarations and the flattened per-type model.
//!
//! An [`Entity`] describes itself once through an [`EntityDescriptor`].
//! [`EntityModel::build`] flattens inherited fields, derives the index
//! model and the migration chain, and from then on owns every conversion
//! between stored records and typed state.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::coerce::{coerce, key_text, normalize, raw_text, to_primitive};
use crate::error::{ConfigError, PersistResult, ValidationError};
use crate::field::FieldDef;
use crate::index::{expand_key_values, IndexModel, Key, SearchTerm, KEY_SEPARATOR};
use crate::migration::{MigrationChain, SchemaMapper};
use crate::value::{FieldValue, State};
use crate::Record;

/// Reserved record field carrying the schema version a record was stored at.
pub const SCHEMA_VERSION_FIELD: &str = "SCHEMA_VERSION";

/// Schema version of entities that never declare one.
pub const DEFAULT_SCHEMA_VERSION: &str = "0";

/// A typed record managed by the cache.
pub trait Entity: Sized + Send + Sync + 'static {
    /// Field table, indexes, schema version and mappers of the type.
    fn descriptor() -> EntityDescriptor;

    /// Build an instance from coerced state.
    fn from_state(state: State) -> PersistResult<Self>;

    /// Current typed state of the instance.
    fn to_state(&self) -> State;
}

/// Join to another entity type, handed to the storage collaborator on loads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityJoin {
    pub entity: String,
    pub local_field: String,
    pub join_field: String,
}

impl EntityJoin {
    pub fn new(entity: impl Into<String>, local_field: impl Into<String>, join_field: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            local_field: local_field.into(),
            join_field: join_field.into(),
        }
    }
}

/// Declarative description of an entity type.
pub struct EntityDescriptor {
    type_name: String,
    entity_name: Option<String>,
    schema_version: String,
    fields: Vec<FieldDef>,
    parent: Option<Box<EntityDescriptor>>,
    mappers: Vec<Arc<dyn SchemaMapper>>,
    joins: Vec<EntityJoin>,
}

impl EntityDescriptor {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            entity_name: None,
            schema_version: DEFAULT_SCHEMA_VERSION.to_string(),
            fields: Vec::new(),
            parent: None,
            mappers: Vec::new(),
            joins: Vec::new(),
        }
    }

    /// Storage entity name; defaults to the snake_case type name.
    pub fn with_entity_name(mut self, name: impl Into<String>) -> Self {
        self.entity_name = Some(name.into());
        self
    }

    pub fn with_schema_version(mut self, version: impl Into<String>) -> Self {
        self.schema_version = version.into();
        self
    }

    pub fn with_field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_fields(mut self, fields: impl IntoIterator<Item = FieldDef>) -> Self {
        self.fields.extend(fields);
        self
    }

    /// Inherit the fields and joins of `parent`. Fields declared here
    /// override parent fields of the same name.
    pub fn inherit(mut self, parent: EntityDescriptor) -> Self {
        self.parent = Some(Box::new(parent));
        self
    }

    pub fn with_mapper(mut self, mapper: impl SchemaMapper + 'static) -> Self {
        self.mappers.push(Arc::new(mapper));
        self
    }

    pub fn with_join(mut self, join: EntityJoin) -> Self {
        self.joins.push(join);
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Own fields first, then each ancestor's fields not already declared.
    fn flatten(&self) -> (Vec<FieldDef>, Vec<EntityJoin>) {
        let mut fields = self.fields.clone();
        let mut joins = self.joins.clone();
        let mut ancestor = self.parent.as_deref();
        while let Some(parent) = ancestor {
            for field in &parent.fields {
                if !fields.iter().any(|f| f.name == field.name) {
                    fields.push(field.clone());
                }
            }
            for join in &parent.joins {
                if !joins.contains(join) {
                    joins.push(join.clone());
                }
            }
            ancestor = parent.parent.as_deref();
        }
        (fields, joins)
    }
}

impl fmt::Debug for EntityDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityDescriptor")
            .field("type_name", &self.type_name)
            .field("entity_name", &self.entity_name)
            .field("schema_version", &self.schema_version)
            .field("fields", &self.fields)
            .field("parent", &self.parent)
            .field("mappers", &self.mappers.len())
            .field("joins", &self.joins)
            .finish()
    }
}

/// Storage name for a type name: last path segment, snake_case.
///
/// `ServerImage` becomes `server_image`.
pub fn entity_name_for(type_name: &str) -> String {
    let short = type_name.rsplit("::").next().unwrap_or(type_name);
    let mut name = String::with_capacity(short.len() + 4);
    for (i, c) in short.chars().enumerate() {
        if c.is_uppercase() {
            if i != 0 {
                name.push('_');
            }
            name.extend(c.to_lowercase());
        } else {
            name.push(c);
        }
    }
    name
}

/// Flattened, validated model of one entity type.
#[derive(Debug)]
pub struct EntityModel {
    type_name: String,
    entity_name: String,
    fields: Vec<FieldDef>,
    index: IndexModel,
    migration: MigrationChain,
    joins: Vec<EntityJoin>,
    strict_migration: bool,
}

impl EntityModel {
    pub fn build(descriptor: EntityDescriptor) -> PersistResult<Self> {
        let (fields, joins) = descriptor.flatten();
        let index = IndexModel::derive(&descriptor.type_name, &fields)?;
        for join in &joins {
            if !fields.iter().any(|f| f.name == join.local_field) {
                return Err(ConfigError::UnknownIndexField {
                    entity: descriptor.type_name.clone(),
                    field: join.local_field.clone(),
                }
                .into());
            }
        }
        let migration = MigrationChain::new(
            descriptor.type_name.clone(),
            descriptor.schema_version.clone(),
            descriptor.mappers,
        );
        let entity_name = descriptor
            .entity_name
            .unwrap_or_else(|| entity_name_for(&descriptor.type_name));

        Ok(Self {
            type_name: descriptor.type_name,
            entity_name,
            fields,
            index,
            migration,
            joins,
            strict_migration: false,
        })
    }

    pub fn of<T: Entity>() -> PersistResult<Self> {
        Self::build(T::descriptor())
    }

    /// Fail loads whose migration stops below the current version.
    pub fn with_strict_migration(mut self, strict: bool) -> Self {
        self.strict_migration = strict;
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    pub fn schema_version(&self) -> &str {
        self.migration.current_version()
    }

    pub fn index(&self) -> &IndexModel {
        &self.index
    }

    pub fn migration(&self) -> &MigrationChain {
        &self.migration
    }

    pub fn joins(&self) -> &[EntityJoin] {
        &self.joins
    }

    pub fn primary_key(&self) -> &Key {
        self.index.primary()
    }

    pub fn primary_field(&self) -> &str {
        self.index.primary_field()
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn persistent_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| !f.transient)
    }

    /// Run the field's validator, if any, against a non-null stored value.
    pub fn validate(&self, field: &FieldDef, raw: &Value) -> PersistResult<()> {
        if let Some(validator) = &field.validator {
            if !raw.is_null() {
                let text = raw_text(raw);
                if !validator.validate(&text) {
                    warn!(
                        entity = %self.type_name,
                        field = %field.name,
                        value = %text,
                        "Stored value rejected by field validator"
                    );
                    return Err(ValidationError::Rejected {
                        field: field.name.clone(),
                        value: text,
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    /// Migrate, validate and coerce a stored record into typed state.
    ///
    /// A record without a schema version is taken to be current.
    pub fn coerce_record(&self, mut record: Record) -> PersistResult<State> {
        let stored_version = match record.remove(SCHEMA_VERSION_FIELD) {
            None | Some(Value::Null) => self.schema_version().to_string(),
            Some(version) => raw_text(&version),
        };
        let migrated = self.migration.migrate(record, &stored_version)?;
        if self.strict_migration && !self.migration.is_current(&migrated.version) {
            return Err(ConfigError::IncompleteMigration {
                entity: self.type_name.clone(),
                reached: migrated.version,
                current: self.schema_version().to_string(),
            }
            .into());
        }

        let record = migrated.record;
        let mut state = State::new();
        for field in self.persistent_fields() {
            let raw = record.get(&field.name).unwrap_or(&Value::Null);
            self.validate(field, raw)?;
            state.insert(field.name.clone(), coerce(&field.name, raw, &field.field_type)?);
        }
        Ok(state)
    }

    /// Build a typed instance from a stored record.
    pub fn materialize<T: Entity>(&self, record: Record) -> PersistResult<T> {
        T::from_state(self.coerce_record(record)?)
    }

    /// Render typed state as a stored record stamped with the current
    /// schema version. Transient and null fields are left out; measured
    /// values are stored in their field's declared unit.
    pub fn to_record(&self, state: &State) -> PersistResult<Record> {
        let mut record = Record::new();
        for field in self.persistent_fields() {
            if let Some(value) = state.get(&field.name).filter(|v| !v.is_null()) {
                let typed = normalize(&field.name, value, &field.field_type)?;
                record.insert(field.name.clone(), to_primitive(&typed));
            }
        }
        record.insert(
            SCHEMA_VERSION_FIELD.to_string(),
            Value::String(self.schema_version().to_string()),
        );
        Ok(record)
    }

    /// Bring caller-supplied field values to the declared field types.
    ///
    /// Every name must be a declared field, transient ones included.
    pub fn normalize_state(&self, changes: &State) -> PersistResult<State> {
        let mut normalized = State::new();
        for (name, value) in changes.iter() {
            let def = self.field(name).ok_or_else(|| ValidationError::UnknownField {
                entity: self.type_name.clone(),
                field: name.clone(),
            })?;
            normalized.insert(name.clone(), normalize(name, value, &def.field_type)?);
        }
        Ok(normalized)
    }

    /// Key value of `state` under `key`; `None` when any key field is null.
    pub fn key_value(&self, key: &Key, state: &State) -> Option<String> {
        let mut parts = Vec::with_capacity(key.fields().len());
        for field in key.fields() {
            parts.push(key_text(state.get(field)?)?);
        }
        Some(parts.join(KEY_SEPARATOR))
    }

    /// Key value of a stored record, computed on the coerced field values so
    /// it agrees with [`key_value`](Self::key_value) of the materialized state.
    pub fn record_key_value(&self, key: &Key, record: &Record) -> PersistResult<Option<String>> {
        let mut parts = Vec::with_capacity(key.fields().len());
        for field in key.fields() {
            let raw = record.get(field).unwrap_or(&Value::Null);
            let typed = match self.field(field) {
                Some(def) => coerce(field, raw, &def.field_type)?,
                None => return Ok(None),
            };
            match key_text(&typed) {
                Some(part) => parts.push(part),
                None => return Ok(None),
            }
        }
        Ok(Some(parts.join(KEY_SEPARATOR)))
    }

    /// Key text of one search value, normalized through the field's type.
    pub fn render_key_part(&self, field: &str, value: &FieldValue) -> PersistResult<Option<String>> {
        match self.field(field) {
            Some(def) => Ok(key_text(&coerce(field, &to_primitive(value), &def.field_type)?)),
            None => Ok(key_text(value)),
        }
    }

    /// Key values of `key` selected by `terms`, at most `limit` of them.
    pub fn term_key_values(
        &self,
        key: &Key,
        terms: &[SearchTerm],
        limit: Option<usize>,
    ) -> PersistResult<BTreeSet<String>> {
        expand_key_values(key, terms, limit, |field, value| self.render_key_part(field, value))
    }

    /// Every key value `state` is registered under, primary key first.
    pub fn all_key_values(&self, state: &State) -> Vec<(Key, String)> {
        self.index
            .keys()
            .filter_map(|key| self.key_value(key, state).map(|v| (key.clone(), v)))
            .collect()
    }
}
