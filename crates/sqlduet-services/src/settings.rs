//! Persisted settings for the data access layer
//!
//! Settings live in a TOML file under the user's config directory. Every field
//! has a default, so a missing file or a partial file is always valid.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlduet_connection::BusyPolicy;
use sqlduet_query::BatchOptions;
use sqlduet_schema::DEFAULT_MAX_CHARS;
use std::path::{Path, PathBuf};

use crate::{ServiceError, ServiceResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DuetSettings {
    pub session: SessionSettings,
    pub batch: BatchSettings,
    pub catalog: CatalogSettings,
    pub mutation: MutationSettings,
    pub context: ContextSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SessionSettings {
    /// What a second operation does while the session is busy
    pub busy_policy: BusyPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BatchSettings {
    /// Per-statement timeout; 0 disables it
    pub statement_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogSettings {
    /// Refresh the catalog after a batch in which a schema change succeeded
    pub refresh_after_ddl: bool,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            refresh_after_ddl: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MutationSettings {
    /// Match updated rows on the primary key alone instead of the full prior row
    pub trust_primary_key: bool,
    /// Maximum identifiers bound into one DELETE statement
    pub delete_chunk_size: usize,
}

impl Default for MutationSettings {
    fn default() -> Self {
        Self {
            trust_primary_key: false,
            delete_chunk_size: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextSettings {
    /// Upper bound on the formatted schema context, in characters
    pub max_chars: usize,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            max_chars: DEFAULT_MAX_CHARS,
        }
    }
}

impl DuetSettings {
    /// Default location: `<config dir>/sqlduet/settings.toml`
    pub fn settings_file() -> Result<PathBuf> {
        dirs::config_dir()
            .context("Could not determine config directory")
            .map(|p| p.join("sqlduet").join("settings.toml"))
    }

    /// Load settings from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {:?}", path))?;
        let settings: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse settings file {:?}", path))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Settings from the default location, falling back to defaults on any error
    pub fn load_or_default() -> Self {
        let loaded = Self::settings_file().and_then(|path| Self::load(&path));
        match loaded {
            Ok(settings) => settings,
            Err(err) => {
                tracing::warn!("Failed to load settings, using defaults: {:#}", err);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize settings")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write settings to {:?}", path))?;
        Ok(())
    }

    pub fn validate(&self) -> ServiceResult<()> {
        if self.mutation.delete_chunk_size == 0 {
            return Err(ServiceError::Settings(
                "mutation.delete_chunk_size must be at least 1".into(),
            ));
        }
        if self.context.max_chars == 0 {
            return Err(ServiceError::Settings(
                "context.max_chars must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Batch options carrying the configured statement timeout
    pub fn batch_options(&self, atomic: bool) -> BatchOptions {
        BatchOptions::new()
            .with_atomic(atomic)
            .with_statement_timeout_ms(self.batch.statement_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let settings = DuetSettings::default();
        assert_eq!(settings.session.busy_policy, BusyPolicy::Queue);
        assert_eq!(settings.batch.statement_timeout_ms, 0);
        assert!(settings.catalog.refresh_after_ddl);
        assert!(!settings.mutation.trust_primary_key);
        assert_eq!(settings.mutation.delete_chunk_size, 500);
        assert_eq!(settings.context.max_chars, 16_000);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(
            &path,
            "[session]\nbusy_policy = \"reject\"\n\n[mutation]\ndelete_chunk_size = 50\n",
        )
        .unwrap();

        let settings = DuetSettings::load(&path).unwrap();
        assert_eq!(settings.session.busy_policy, BusyPolicy::Reject);
        assert_eq!(settings.mutation.delete_chunk_size, 50);
        assert!(!settings.mutation.trust_primary_key);
        assert!(settings.catalog.refresh_after_ddl);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::TempDir::new().unwrap();
        let settings = DuetSettings::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(settings, DuetSettings::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("settings.toml");
        let mut settings = DuetSettings::default();
        settings.batch.statement_timeout_ms = 2_500;
        settings.mutation.trust_primary_key = true;

        settings.save(&path).unwrap();
        assert_eq!(DuetSettings::load(&path).unwrap(), settings);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "[mutation]\ndelete_chunk_size = 0\n").unwrap();
        let err = DuetSettings::load(&path).unwrap_err();
        assert!(err.to_string().contains("delete_chunk_size"));

        std::fs::write(&path, "[session]\nbusy_policy = \"sometimes\"\n").unwrap();
        assert!(DuetSettings::load(&path).is_err());
    }

    #[test]
    fn test_batch_options() {
        let mut settings = DuetSettings::default();
        assert_eq!(settings.batch_options(true).statement_timeout(), None);
        assert!(!settings.batch_options(false).atomic);

        settings.batch.statement_timeout_ms = 750;
        assert_eq!(
            settings.batch_options(true).statement_timeout(),
            Some(std::time::Duration::from_millis(750))
        );
    }
}
