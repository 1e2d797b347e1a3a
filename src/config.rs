// ⚙️ Engine Configuration - TOML, every field defaulted
//
// [canonicalizer]
// exact_threshold = 0.93
// prefix_threshold = 0.88
// cache_capacity = 4096
// vendor_table = "vendors.json"   # optional, built-in table otherwise
//
// [resolver]
// org_window_days = 45
//
// [diff]
// duplicates_include_unchanged = false

use crate::entities::vendor::{
    MatchThresholds, VendorCanonicalizer, VendorTable, DEFAULT_CACHE_CAPACITY,
    DEFAULT_EXACT_THRESHOLD, DEFAULT_PREFIX_THRESHOLD,
};
use anyhow::{bail, Context as AnyhowContext, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_ORG_WINDOW_DAYS: i64 = 45;
/// A century; wider windows cannot be subtracted from a timestamp
pub const MAX_ORG_WINDOW_DAYS: i64 = 36_500;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub canonicalizer: CanonicalizerConfig,

    #[serde(default)]
    pub resolver: ResolverConfig,

    #[serde(default)]
    pub diff: DiffConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalizerConfig {
    #[serde(default = "default_exact_threshold")]
    pub exact_threshold: f64,

    #[serde(default = "default_prefix_threshold")]
    pub prefix_threshold: f64,

    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// JSON vendor table; the built-in table is used when unset
    #[serde(default)]
    pub vendor_table: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Day window bounding the organization-wide lookup
    #[serde(default = "default_org_window_days")]
    pub org_window_days: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffConfig {
    /// Also count staging duplicates whose rows came out unchanged
    #[serde(default)]
    pub duplicates_include_unchanged: bool,
}

fn default_exact_threshold() -> f64 {
    DEFAULT_EXACT_THRESHOLD
}

fn default_prefix_threshold() -> f64 {
    DEFAULT_PREFIX_THRESHOLD
}

fn default_cache_capacity() -> usize {
    DEFAULT_CACHE_CAPACITY
}

fn default_org_window_days() -> i64 {
    DEFAULT_ORG_WINDOW_DAYS
}

impl Default for CanonicalizerConfig {
    fn default() -> Self {
        CanonicalizerConfig {
            exact_threshold: DEFAULT_EXACT_THRESHOLD,
            prefix_threshold: DEFAULT_PREFIX_THRESHOLD,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            vendor_table: None,
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            org_window_days: DEFAULT_ORG_WINDOW_DAYS,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(content).context("Failed to parse config TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let c = &self.canonicalizer;
        for (name, value) in [("exact_threshold", c.exact_threshold), ("prefix_threshold", c.prefix_threshold)] {
            if !(0.0..=1.0).contains(&value) {
                bail!("canonicalizer.{} must be within 0.0..=1.0, got {}", name, value);
            }
        }
        if c.prefix_threshold > c.exact_threshold {
            bail!(
                "canonicalizer.prefix_threshold ({}) must not exceed exact_threshold ({})",
                c.prefix_threshold,
                c.exact_threshold
            );
        }
        if self.resolver.org_window_days <= 0 {
            bail!("resolver.org_window_days must be positive");
        }
        if self.resolver.org_window_days > MAX_ORG_WINDOW_DAYS {
            bail!(
                "resolver.org_window_days must be at most {}, got {}",
                MAX_ORG_WINDOW_DAYS,
                self.resolver.org_window_days
            );
        }
        Ok(())
    }

    pub fn thresholds(&self) -> MatchThresholds {
        MatchThresholds {
            exact: self.canonicalizer.exact_threshold,
            prefix: self.canonicalizer.prefix_threshold,
        }
    }

    /// Build the vendor canonicalizer this configuration describes
    pub fn build_canonicalizer(&self) -> Result<VendorCanonicalizer> {
        let table = match &self.canonicalizer.vendor_table {
            Some(path) => VendorTable::from_file(path)?,
            None => VendorTable::with_defaults(),
        };
        VendorCanonicalizer::new(&table, self.thresholds(), self.canonicalizer.cache_capacity)
    }
}
