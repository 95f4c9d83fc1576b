//! Persistence layer configuration.
//!
//! Loaded from TOML or built programmatically. Datasource routing mirrors
//! read-replica/primary setups: an entity may read from one datasource and
//! write to another, and a side left unset falls back to the other side.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, PersistResult};

/// Datasource used when nothing more specific is configured.
pub const DEFAULT_DATASOURCE: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
    pub read: Option<String>,
    pub write: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PersistConfig {
    /// Datasource for entities without a route.
    #[serde(default = "default_datasource")]
    pub default_datasource: String,
    /// Per entity type routes, keyed by type name.
    #[serde(default)]
    pub routes: BTreeMap<String, RouteConfig>,
    /// Fail loads whose schema migration stops below the current version.
    #[serde(default)]
    pub strict_migration: bool,
    /// Bound on buffered cursor items; unbounded when absent.
    #[serde(default)]
    pub cursor_buffer: Option<usize>,
}

fn default_datasource() -> String {
    DEFAULT_DATASOURCE.to_string()
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            default_datasource: default_datasource(),
            routes: BTreeMap::new(),
            strict_migration: false,
            cursor_buffer: None,
        }
    }
}

impl PersistConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_datasource(mut self, name: impl Into<String>) -> Self {
        self.default_datasource = name.into();
        self
    }

    /// Route one entity type's reads and writes.
    pub fn with_route(mut self, entity: impl Into<String>, read: Option<&str>, write: Option<&str>) -> Self {
        self.routes.insert(
            entity.into(),
            RouteConfig {
                read: read.map(str::to_string),
                write: write.map(str::to_string),
            },
        );
        self
    }

    pub fn with_strict_migration(mut self, strict: bool) -> Self {
        self.strict_migration = strict;
        self
    }

    pub fn with_cursor_buffer(mut self, buffer: usize) -> Self {
        self.cursor_buffer = Some(buffer);
        self
    }

    pub fn from_toml_str(contents: &str) -> PersistResult<Self> {
        let config: PersistConfig = toml::from_str(contents).map_err(|e| ConfigError::Unreadable {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> PersistResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
            reason: format!("{}: {}", path.display(), e),
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> PersistResult<()> {
        if self.default_datasource.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "default_datasource".to_string(),
                value: self.default_datasource.clone(),
                reason: "must not be empty".to_string(),
            }
            .into());
        }
        for (entity, route) in &self.routes {
            for (side, name) in [("read", &route.read), ("write", &route.write)] {
                if let Some(name) = name.as_deref().filter(|n| n.trim().is_empty()) {
                    return Err(ConfigError::InvalidValue {
                        field: format!("routes.{entity}.{side}"),
                        value: name.to_string(),
                        reason: "must not be empty".to_string(),
                    }
                    .into());
                }
            }
        }
        if self.cursor_buffer == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "cursor_buffer".to_string(),
                value: "0".to_string(),
                reason: "must be > 0".to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Datasource `entity` reads from.
    pub fn read_datasource(&self, entity: &str) -> &str {
        self.routes
            .get(entity)
            .and_then(|r| r.read.as_deref().or(r.write.as_deref()))
            .unwrap_or(self.default_datasource.as_str())
    }

    /// Datasource `entity` writes to.
    pub fn write_datasource(&self, entity: &str) -> &str {
        self.routes
            .get(entity)
            .and_then(|r| r.write.as_deref().or(r.read.as_deref()))
            .unwrap_or(self.default_datasource.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PersistError;

    #[test]
    fn test_defaults() {
        let config = PersistConfig::default();
        assert_eq!(config.default_datasource, "default");
        assert!(!config.strict_migration);
        assert_eq!(config.cursor_buffer, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_routes_fall_back_to_other_side() {
        let config = PersistConfig::new()
            .with_default_datasource("primary")
            .with_route("Server", Some("replica"), None)
            .with_route("Region", None, Some("writer"));

        assert_eq!(config.read_datasource("Server"), "replica");
        assert_eq!(config.write_datasource("Server"), "replica");
        assert_eq!(config.read_datasource("Region"), "writer");
        assert_eq!(config.read_datasource("Image"), "primary");
        assert_eq!(config.write_datasource("Image"), "primary");
    }

    #[test]
    fn test_from_toml() {
        let config = PersistConfig::from_toml_str(
            r#"
            default_datasource = "main"
            strict_migration = true
            cursor_buffer = 64

            [routes.Server]
            read = "replica"
            write = "main"
            "#,
        )
        .unwrap();
        assert_eq!(config.default_datasource, "main");
        assert!(config.strict_migration);
        assert_eq!(config.cursor_buffer, Some(64));
        assert_eq!(config.read_datasource("Server"), "replica");
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let err = PersistConfig::from_toml_str("cache_size = 10").unwrap_err();
        assert!(matches!(err, PersistError::Config(ConfigError::Unreadable { .. })));
    }

    #[test]
    fn test_validate_rejects_zero_buffer_and_blank_routes() {
        let err = PersistConfig::new().with_cursor_buffer(0).validate().unwrap_err();
        assert!(err.is_config());

        let err = PersistConfig::new()
            .with_route("Server", Some(" "), None)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("routes.Server.read"));
    }
}
