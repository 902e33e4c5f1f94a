//! World tuning parameters, loadable from TOML.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{EcsError, EcsResult};

/// Capacity and growth settings applied when a [`World`](crate::World) is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    /// Initial reservation for entity slots, locations and relationships
    pub entity_capacity: usize,
    /// Initial capacity of every new component column
    pub column_capacity: usize,
    /// Geometric growth factor of component columns (at least 2)
    pub growth_factor: usize,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            entity_capacity: 256,
            column_capacity: 16,
            growth_factor: 2,
        }
    }
}

impl WorldConfig {
    pub fn from_toml_str(content: &str) -> EcsResult<Self> {
        let config: Self = toml::from_str(content)?;
        Ok(config.sanitized())
    }

    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> EcsResult<Self> {
        let path = path.as_ref();
        let content =
            fs::read_to_string(path).map_err(|e| EcsError::ConfigRead(path.to_path_buf(), e))?;
        let config = Self::from_toml_str(&content)?;
        info!("Loaded world config from {:?}", path);
        Ok(config)
    }

    /// Load from a TOML file, falling back to defaults on any failure.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            info!("No world config at {:?}, using defaults", path);
            return Self::default();
        }
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!("{}, using defaults", e);
                Self::default()
            }
        }
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    pub(crate) fn sanitized(mut self) -> Self {
        if self.growth_factor < 2 {
            warn!(
                "growth_factor {} is too small, clamping to 2",
                self.growth_factor
            );
            self.growth_factor = 2;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = WorldConfig::default();
        assert_eq!(config.entity_capacity, 256);
        assert_eq!(config.column_capacity, 16);
        assert_eq!(config.growth_factor, 2);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = WorldConfig::from_toml_str("column_capacity = 64").unwrap();
        assert_eq!(config.column_capacity, 64);
        assert_eq!(config.entity_capacity, 256);
    }

    #[test]
    fn growth_factor_is_clamped() {
        let config = WorldConfig::from_toml_str("growth_factor = 1").unwrap();
        assert_eq!(config.growth_factor, 2);
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = WorldConfig::from_toml_str("entity_capacity = \"lots\"").unwrap_err();
        assert!(matches!(err, EcsError::ConfigParse(_)));
    }

    #[test]
    fn missing_file_falls_back() {
        let path = std::env::temp_dir().join("strata-ecs-no-such-config.toml");
        assert!(matches!(
            WorldConfig::load(&path),
            Err(EcsError::ConfigRead(..))
        ));
        assert_eq!(WorldConfig::load_or_default(&path), WorldConfig::default());
    }

    #[test]
    fn file_roundtrip() {
        let path = std::env::temp_dir().join(format!(
            "strata-ecs-config-{}.toml",
            std::process::id()
        ));
        let config = WorldConfig {
            entity_capacity: 1024,
            column_capacity: 8,
            growth_factor: 3,
        };
        fs::write(&path, config.to_toml_string().unwrap()).unwrap();
        let loaded = WorldConfig::load(&path).unwrap();
        let _ = fs::remove_file(&path);
        assert_eq!(loaded, config);
    }
}
