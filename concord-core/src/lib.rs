//! Concord Core - Entity Model and Value Engine
//!
//! Pure types and pure algorithms shared by every concord crate: the field
//! table an entity declares, the index model derived from it, the value
//! coercion engine and the schema migration chain. Nothing in this crate
//! performs I/O or holds shared state.

pub mod coerce;
pub mod config;
pub mod entity;
pub mod error;
pub mod field;
pub mod index;
pub mod migration;
pub mod uom;
pub mod value;

/// A stored record: flat field name to storage primitive map.
pub type Record = serde_json::Map<String, serde_json::Value>;

pub use coerce::{coerce, key_text, normalize, raw_text, to_primitive};
pub use config::{PersistConfig, RouteConfig, DEFAULT_DATASOURCE};
pub use entity::{
    entity_name_for, Entity, EntityDescriptor, EntityJoin, EntityModel, DEFAULT_SCHEMA_VERSION,
    SCHEMA_VERSION_FIELD,
};
pub use error::{
    ConfigError, CoercionError, CursorError, PersistError, PersistResult, StorageError,
    ValidationError,
};
pub use field::{
    EnumType, FieldDef, FieldType, FieldValidator, IndexDecl, IndexKind, ObjectCodec, ObjectType,
    Validator,
};
pub use index::{expand_key_values, IndexModel, Key, Operator, SearchTerm, SearchValue, KEY_SEPARATOR};
pub use migration::{FnMapper, Migrated, MigrationChain, SchemaMapper};
pub use uom::{Dimension, Measured, Unit};
pub use value::{
    CurrencyCode, FieldValue, FromFieldValue, FromPrimitive, Locale, OpaqueValue, PersistEnum,
    State, TimeZoneId, ToPrimitive,
};
