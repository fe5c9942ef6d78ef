// ABOUTME: Configuration loading and validation for packrat sessions.
// ABOUTME: Reads PACKRAT_* environment variables for volume sizes and journal filters.

use thiserror::Error;

use crate::journal::{DEFAULT_COMMIT_MARKER, DEFAULT_TRASH_DIR, ResumeFilters};

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("PACKRAT_VOLUME_SIZES entry {0:?} is not a size like 650M")]
    InvalidVolumeSize(String),

    #[error("PACKRAT_VOLUME_SIZES entry {0:?} must be greater than zero")]
    ZeroVolumeSize(String),
}

/// Session configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackratConfig {
    pub volume_sizes: Vec<u64>,
    pub trash_dirs: Vec<String>,
    pub stats_filter: String,
    pub commit_marker: String,
}

impl Default for PackratConfig {
    fn default() -> Self {
        Self {
            volume_sizes: vec![u64::MAX],
            trash_dirs: vec![DEFAULT_TRASH_DIR.to_string()],
            stats_filter: String::new(),
            commit_marker: DEFAULT_COMMIT_MARKER.to_string(),
        }
    }
}

impl PackratConfig {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// Environment variables:
    /// - PACKRAT_VOLUME_SIZES: comma-separated volume capacities with optional
    ///   K/M/G suffix (default: one unlimited volume)
    /// - PACKRAT_TRASH_DIRS: comma-separated trash prefixes (default: Trash/)
    /// - PACKRAT_STATS_FILTER: prefix of entries counted as recovered (default: all)
    /// - PACKRAT_COMMIT_MARKER: name of the commit marker entry (default: __coc__)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from any key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let volume_sizes = match lookup("PACKRAT_VOLUME_SIZES").filter(|v| !v.trim().is_empty()) {
            Some(raw) => parse_size_list(&raw)?,
            None => defaults.volume_sizes,
        };

        let trash_dirs = lookup("PACKRAT_TRASH_DIRS")
            .map(|raw| split_list(&raw))
            .unwrap_or(defaults.trash_dirs);

        let stats_filter = lookup("PACKRAT_STATS_FILTER").unwrap_or(defaults.stats_filter);

        let commit_marker = lookup("PACKRAT_COMMIT_MARKER")
            .filter(|m| !m.is_empty())
            .unwrap_or(defaults.commit_marker);

        Ok(Self {
            volume_sizes,
            trash_dirs,
            stats_filter,
            commit_marker,
        })
    }

    /// The replay filters this configuration describes.
    pub fn resume_filters(&self) -> ResumeFilters {
        ResumeFilters {
            trash_dirs: self.trash_dirs.clone(),
            stats_filter: self.stats_filter.clone(),
            commit_marker: self.commit_marker.clone(),
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `"650M, 1G"` style lists into byte counts.
pub fn parse_size_list(raw: &str) -> Result<Vec<u64>, ConfigError> {
    split_list(raw).iter().map(|s| parse_size(s)).collect()
}

/// Parse one size with an optional binary K/M/G suffix.
pub fn parse_size(raw: &str) -> Result<u64, ConfigError> {
    let trimmed = raw.trim();
    let (digits, shift) = match trimmed.char_indices().last() {
        Some((at, 'k' | 'K')) => (&trimmed[..at], 10),
        Some((at, 'm' | 'M')) => (&trimmed[..at], 20),
        Some((at, 'g' | 'G')) => (&trimmed[..at], 30),
        _ => (trimmed, 0),
    };

    let value: u64 = digits
        .parse()
        .map_err(|_| ConfigError::InvalidVolumeSize(raw.to_string()))?;
    if value == 0 {
        return Err(ConfigError::ZeroVolumeSize(raw.to_string()));
    }
    value
        .checked_mul(1u64 << shift)
        .ok_or_else(|| ConfigError::InvalidVolumeSize(raw.to_string()))
}
