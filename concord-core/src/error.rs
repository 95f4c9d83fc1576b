//! Error types for concord operations

use thiserror::Error;

/// Storage collaborator errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage operation {operation} failed for {entity}: {reason}")]
    Backend {
        entity: String,
        operation: String,
        reason: String,
    },

    #[error("Transaction failed on {datasource}: {reason}")]
    TransactionFailed { datasource: String, reason: String },

    #[error("Write attempted in read-only transaction on {datasource}")]
    ReadOnly { datasource: String },

    #[error("Row for {entity} with key {key} not found")]
    MissingRow { entity: String, key: String },

    #[error("Create for {entity} did not echo a value for primary key {field}")]
    MissingGeneratedKey { entity: String, field: String },
}

/// Errors raised while converting stored values into typed fields.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoercionError {
    #[error("Unable to map {field} as {target} using {value}")]
    Unmappable {
        field: String,
        target: String,
        value: String,
    },

    #[error("Value {value} for {field} is not a member of enum {target}")]
    UnknownEnumName {
        field: String,
        target: String,
        value: String,
    },

    #[error("Unable to parse {value} for {field} as {target}: {reason}")]
    Parse {
        field: String,
        target: String,
        value: String,
        reason: String,
    },

    #[error("Cannot convert {field} from {from} to {to}: incompatible units")]
    UnitMismatch {
        field: String,
        from: String,
        to: String,
    },
}

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Value {value} for {field} is not valid")]
    Rejected { field: String, value: String },

    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Field {field} holds {found}, expected {expected}")]
    TypeMismatch {
        field: String,
        expected: String,
        found: String,
    },

    #[error("{entity} declares no field {field}")]
    UnknownField { entity: String, field: String },
}

/// Configuration errors. These are never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("No primary key field identified for: {entity}")]
    NoPrimaryIndex { entity: String },

    #[error("More than one primary key declared for {entity}: {fields:?}")]
    MultiplePrimaryIndexes { entity: String, fields: Vec<String> },

    #[error("Index on {entity} names unknown field {field}")]
    UnknownIndexField { entity: String, field: String },

    #[error("Index {index} is not declared for {entity}")]
    UnknownIndex { entity: String, index: String },

    #[error("No conversion capability in {target} for mapping {field}")]
    NoConversion { field: String, target: String },

    #[error("Schema mapper chain for {entity} cycles at version {version}")]
    CyclicMigration { entity: String, version: String },

    #[error("Schema migration for {entity} stopped at {reached}, current is {current}")]
    IncompleteMigration {
        entity: String,
        reached: String,
        current: String,
    },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to read configuration: {reason}")]
    Unreadable { reason: String },
}

/// Result cursor errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CursorError {
    #[error("Cursor {name} producer stopped before completing")]
    ProducerDropped { name: String },
}

/// Master error type for all concord errors.
///
/// Cloneable so a single load failure can be delivered to every caller
/// waiting on the same key.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PersistError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Coercion error: {0}")]
    Coercion(#[from] CoercionError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Cursor error: {0}")]
    Cursor(#[from] CursorError),
}

impl PersistError {
    /// Configuration errors are fatal and must never be retried.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

/// Result type alias for concord operations.
pub type PersistResult<T> = Result<T, PersistError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display_backend() {
        let err = StorageError::Backend {
            entity: "server".to_string(),
            operation: "load_rows".to_string(),
            reason: "connection reset".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("load_rows"));
        assert!(msg.contains("server"));
        assert!(msg.contains("connection reset"));
    }

    #[test]
    fn test_coercion_error_names_field_target_and_value() {
        let err = CoercionError::Unmappable {
            field: "cpuCount".to_string(),
            target: "int".to_string(),
            value: "four".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("cpuCount"));
        assert!(msg.contains("int"));
        assert!(msg.contains("four"));
    }

    #[test]
    fn test_config_error_display_no_primary() {
        let err = ConfigError::NoPrimaryIndex {
            entity: "Server".to_string(),
        };
        assert!(format!("{}", err).contains("No primary key field identified for: Server"));
    }

    #[test]
    fn test_validation_error_display_rejected() {
        let err = ValidationError::Rejected {
            field: "owner".to_string(),
            value: "nobody".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("owner"));
        assert!(msg.contains("nobody"));
    }

    #[test]
    fn test_persist_error_from_variants() {
        let storage = PersistError::from(StorageError::ReadOnly {
            datasource: "primary".to_string(),
        });
        assert!(matches!(storage, PersistError::Storage(_)));

        let coercion = PersistError::from(CoercionError::UnknownEnumName {
            field: "state".to_string(),
            target: "ServerState".to_string(),
            value: "EXPLODED".to_string(),
        });
        assert!(matches!(coercion, PersistError::Coercion(_)));

        let validation = PersistError::from(ValidationError::RequiredFieldMissing {
            field: "name".to_string(),
        });
        assert!(matches!(validation, PersistError::Validation(_)));

        let config = PersistError::from(ConfigError::NoPrimaryIndex {
            entity: "Server".to_string(),
        });
        assert!(config.is_config());

        let cursor = PersistError::from(CursorError::ProducerDropped {
            name: "Server.find".to_string(),
        });
        assert!(matches!(cursor, PersistError::Cursor(_)));
        assert!(!cursor.is_config());
    }
}
