//! Layered configuration: embedded defaults, then `dicom-index.toml`, then
//! `DICOM_INDEX__SECTION__KEY` environment variables.

use dicom_core::Tag;
use serde::Deserialize;

use crate::models::{parse_tag, ResourceType};
use crate::registry::MainDicomTagsRegistry;

const DEFAULTS: &str = include_str!("defaults.toml");

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub find: FindConfig,
    pub registry: RegistryConfig,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let _ = dotenvy::dotenv();

        config::Config::builder()
            .add_source(config::File::from_str(DEFAULTS, config::FileFormat::Toml))
            .add_source(config::File::with_name("dicom-index.toml").required(false))
            .add_source(
                config::Environment::with_prefix("DICOM_INDEX")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }

    /// The embedded defaults alone, ignoring files and environment.
    pub fn defaults() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from_str(DEFAULTS, config::FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.database.path.trim().is_empty() {
            return Err("database.path must not be empty".to_string());
        }
        if self.database.max_connections == 0 {
            return Err("database.max_connections must be at least 1".to_string());
        }
        if self.database.is_in_memory() && self.database.max_connections != 1 {
            return Err("an in-memory database requires database.max_connections = 1".to_string());
        }
        if !matches!(
            self.logging.file_rotation.as_str(),
            "daily" | "hourly" | "minutely" | "never"
        ) {
            return Err(format!(
                "logging.file_rotation must be daily, hourly, minutely or never, got {}",
                self.logging.file_rotation
            ));
        }
        self.registry.extra_tags().map_err(|e| e.to_string())?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
    /// When false the backend advertises no native find.
    pub enable_native_find: bool,
    pub escape_brackets: bool,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn in_memory() -> Self {
        Self {
            path: ":memory:".to_string(),
            enable_native_find: true,
            escape_brackets: false,
            max_connections: 1,
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.path == ":memory:"
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FindConfig {
    pub database_limit: u64,
    pub allow_storage_access: bool,
    pub case_sensitive_pn: bool,
    pub stable_age_seconds: u64,
}

impl Default for FindConfig {
    fn default() -> Self {
        Self {
            database_limit: 100,
            allow_storage_access: true,
            case_sensitive_pn: false,
            stable_age_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub extra_main_dicom_tags: ExtraMainDicomTags,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtraMainDicomTags {
    #[serde(default)]
    pub patient: Vec<String>,
    #[serde(default)]
    pub study: Vec<String>,
    #[serde(default)]
    pub series: Vec<String>,
    #[serde(default)]
    pub instance: Vec<String>,
}

impl RegistryConfig {
    pub fn extra_tags(&self) -> crate::Result<Vec<(ResourceType, Tag)>> {
        let extra = &self.extra_main_dicom_tags;
        let per_level = [
            (ResourceType::Patient, &extra.patient),
            (ResourceType::Study, &extra.study),
            (ResourceType::Series, &extra.series),
            (ResourceType::Instance, &extra.instance),
        ];

        let mut tags = Vec::new();
        for (level, names) in per_level {
            for name in names {
                tags.push((level, parse_tag(name)?));
            }
        }
        Ok(tags)
    }

    pub fn build(&self) -> crate::Result<MainDicomTagsRegistry> {
        Ok(MainDicomTagsRegistry::with_extra_tags(self.extra_tags()?))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter level when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
    pub file_enabled: bool,
    pub file_directory: String,
    pub file_prefix: String,
    /// daily, hourly, minutely or never
    pub file_rotation: String,
}
