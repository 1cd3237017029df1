use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use replay_core::{InMemoryTable, Table, TableConfig};
use serde::{Deserialize, Serialize};

use crate::service::ServiceOptions;

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub service: ServiceOptions,
    #[serde(default)]
    pub tables: Vec<TableConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            service: ServiceOptions::default(),
            tables: vec![TableConfig::named("default")],
        }
    }
}

impl ServerConfig {
    /// Defaults shipped in `config/default.toml`.
    ///
    /// # Errors
    ///
    /// Only if the embedded file is malformed.
    pub fn embedded() -> Result<Self> {
        toml::from_str(DEFAULT_CONFIG).context("embedded default config is invalid")
    }

    /// Overlay `other` on top of `self`. A table list in `other` replaces the
    /// current one entirely.
    pub fn merge(&mut self, other: &Self) {
        if other.service.max_sample_response_bytes > 0 {
            self.service.max_sample_response_bytes = other.service.max_sample_response_bytes;
        }
        if !other.tables.is_empty() {
            self.tables.clone_from(&other.tables);
        }
    }

    /// # Errors
    ///
    /// Describes the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.service.max_sample_response_bytes == 0 {
            bail!("service.max_sample_response_bytes must be > 0");
        }
        if self.tables.is_empty() {
            bail!("at least one table must be configured");
        }

        let mut names = HashSet::new();
        for table in &self.tables {
            if table.name.is_empty() {
                bail!("table names must not be empty");
            }
            if !names.insert(table.name.as_str()) {
                bail!("table {} is configured more than once", table.name);
            }
            if table.max_size == 0 {
                bail!("table {}: max_size must be > 0", table.name);
            }
            if table.default_flexible_batch_size == 0 {
                bail!("table {}: default_flexible_batch_size must be > 0", table.name);
            }
            if table.max_times_sampled < 0 {
                bail!("table {}: max_times_sampled must be >= 0", table.name);
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn build_tables(&self) -> Vec<Arc<dyn Table>> {
        self.tables
            .iter()
            .map(|config| Arc::new(InMemoryTable::new(config.clone())) as Arc<dyn Table>)
            .collect()
    }
}

pub struct ConfigManager {
    path: Option<PathBuf>,
    config: ServerConfig,
}

impl ConfigManager {
    /// Embedded defaults only.
    ///
    /// # Errors
    ///
    /// See [`ServerConfig::embedded`].
    pub fn defaults() -> Result<Self> {
        Ok(Self {
            path: None,
            config: ServerConfig::embedded()?,
        })
    }

    /// Embedded defaults with the file at `path` merged over them, if it
    /// exists.
    ///
    /// # Errors
    ///
    /// Unreadable or unparsable files and configs failing validation.
    pub fn load_with_path<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let mut config = ServerConfig::embedded()?;

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("failed to read config at {}", path.display()))?;
            let user_config: ServerConfig = toml::from_str(&contents)
                .with_context(|| format!("invalid config at {}", path.display()))?;
            config.merge(&user_config);
        }
        config
            .validate()
            .with_context(|| format!("invalid config at {}", path.display()))?;

        Ok(Self {
            path: Some(path),
            config,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}
