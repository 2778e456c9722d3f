//! Configuration loader and path helpers.
//!
//! Uses Figment to merge defaults + `config.toml` + `config.<env>.toml` +
//! `APP_*` env vars (nested keys separated by `__`, e.g. `APP_MAP__CACHE_TTL_SECS`).

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSettings {
    pub text_index_dir: String,
    pub vector_db_dir: String,
    pub datasets_dir: String,
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            text_index_dir: "../dev_data/indexes/tantivy".to_string(),
            vector_db_dir: "../dev_data/indexes/lancedb".to_string(),
            datasets_dir: "../dev_data/datasets".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapSettings {
    pub cache_ttl_secs: u64,
    pub max_cached_sessions: usize,
    pub question_top_k: usize,
    pub min_points_for_reduction: usize,
    pub poll_interval_ms: u64,
}

impl Default for MapSettings {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 3600,
            max_cached_sessions: 256,
            question_top_k: 5,
            min_points_for_reduction: 6,
            poll_interval_ms: 250,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSettings {
    pub batch_size: usize,
}

impl Default for FieldSettings {
    fn default() -> Self {
        Self { batch_size: 256 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingSettings {
    pub use_fake: bool,
    pub model_dir: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default)]
    pub data: DataSettings,
    #[serde(default)]
    pub map: MapSettings,
    #[serde(default)]
    pub fields: FieldSettings,
    #[serde(default)]
    pub embedding: EmbeddingSettings,
}

pub struct Config {
    figment: Figment,
}

impl Config {
    pub fn load() -> Result<Self> {
        let env_name = env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());

        let mut figment = Figment::from(Serialized::defaults(AppSettings::default())).merge(Toml::file("config.toml"));
        match env_name.as_str() {
            "dev" | "development" => figment = figment.merge(Toml::file("config.dev.toml")),
            "prod" | "production" => figment = figment.merge(Toml::file("config.prod.toml")),
            "test" | "testing" => figment = figment.merge(Toml::file("config.test.toml")),
            _ => tracing::warn!(env = %env_name, "unknown RUST_ENV, using base config only"),
        }
        figment = figment.merge(Env::prefixed("APP_").split("__"));

        let config = Self { figment };
        config.validate()?;
        Ok(config)
    }

    /// Builds a config from an explicit figment; used by tests and embedders.
    pub fn from_figment(figment: Figment) -> Self {
        Self { figment }
    }

    pub fn get<T>(&self, key: &str) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.figment
            .extract_inner(key)
            .map_err(|e| Error::InvalidConfig(format!("Failed to get '{key}': {e}")))
    }

    pub fn settings(&self) -> Result<AppSettings> {
        self.figment.extract().map_err(|e| Error::InvalidConfig(e.to_string()))
    }

    fn validate(&self) -> Result<()> {
        let settings = self.settings()?;
        if settings.fields.batch_size == 0 {
            return Err(Error::InvalidConfig("fields.batch_size must be positive".into()));
        }
        if settings.map.min_points_for_reduction < 2 {
            return Err(Error::InvalidConfig("map.min_points_for_reduction must be at least 2".into()));
        }
        Ok(())
    }
}

/// Expand a user-provided path string:
/// - Expands leading '~' to the user's home directory
/// - Expands ${VAR} and $VAR environment variables
/// - Returns a PathBuf without attempting to canonicalize
pub fn expand_path<S: AsRef<str>>(input: S) -> PathBuf {
    let s = input.as_ref();
    let expanded_env = shellexpand::env(s).unwrap_or(std::borrow::Cow::Borrowed(s));
    let expanded = shellexpand::tilde(&expanded_env);
    PathBuf::from(expanded.as_ref())
}

/// Resolve a possibly relative path against a given base directory after expansion.
pub fn resolve_with_base<S: AsRef<str>>(base: &Path, p: S) -> PathBuf {
    let p = expand_path(p);
    if p.is_absolute() { p } else { base.join(p) }
}
