//! Pool configuration loading and resolution.
//!
//! A raw config is a two-level document: top-level integer entries are
//! default worker-type counts, top-level mapping entries are per-environment
//! override sections. Resolution flattens that against the active
//! environment into a single worker-type -> count mapping.
//!
//! File sources are template-expanded before parsing, so counts can be
//! computed from the deployment environment (`{{ env.WORKERS }}` and
//! friends) instead of hardcoded.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::env::EnvProbe;

/// Resolved worker-type -> desired process count mapping.
///
/// Keys are opaque identity strings. A comma-joined key like `"foo,bar"`
/// is one worker type with one count; splitting it into queue names is the
/// job runner's business, never the pool's.
pub type WorkerCounts = BTreeMap<String, usize>;

/// One top-level entry of a raw, unresolved config document.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum RawEntry {
    /// Default count for a worker type, applied in every environment.
    Count(usize),
    /// Override section for one named environment.
    Section(BTreeMap<String, usize>),
}

/// Raw two-level config document, keyed by worker type or environment name.
pub type RawConfig = BTreeMap<String, RawEntry>;

/// Where the raw config document comes from.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// In-memory document, used as-is.
    Inline(RawConfig),
    /// Template-expandable YAML file.
    File(PathBuf),
    /// No source at all; resolves to an empty pool.
    Absent,
}

impl ConfigSource {
    fn load_raw(&self) -> Result<RawConfig, ConfigLoadError> {
        match self {
            Self::Absent => Ok(RawConfig::new()),
            Self::Inline(raw) => Ok(raw.clone()),
            Self::File(path) => load_file(path),
        }
    }
}

/// Failure to produce a raw config document from a file source.
///
/// Surfaced synchronously at construction time and never retried here; the
/// caller decides between aborting startup and falling back to defaults.
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to expand config template {path}")]
    Template {
        path: PathBuf,
        #[source]
        source: minijinja::Error,
    },

    #[error("failed to parse config file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Conventional config file locations, checked in order.
pub const CONFIG_FILE_CANDIDATES: &[&str] = &["resque-pool.yml", "config/resque-pool.yml"];

/// Pick the config file path for this process.
///
/// `RESQUE_POOL_CONFIG` wins when set, even if the file it names does not
/// exist - loading surfaces that as an error instead of silently falling
/// back. Otherwise the first existing conventional location is used.
pub fn choose_config_file() -> Option<PathBuf> {
    let explicit = std::env::var("RESQUE_POOL_CONFIG")
        .ok()
        .filter(|value| !value.is_empty());
    choose_config_file_from(explicit.as_deref(), CONFIG_FILE_CANDIDATES)
}

fn choose_config_file_from(explicit: Option<&str>, candidates: &[&str]) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(PathBuf::from(path));
    }
    candidates
        .iter()
        .map(PathBuf::from)
        .find(|candidate| candidate.exists())
}

fn load_file(path: &Path) -> Result<RawConfig, ConfigLoadError> {
    let template = std::fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let vars: BTreeMap<String, String> = std::env::vars().collect();
    let rendered =
        expand_template(&template, &vars).map_err(|source| ConfigLoadError::Template {
            path: path.to_path_buf(),
            source,
        })?;

    // A blank or all-comments document parses as null; that is an empty
    // pool, not an error.
    let raw: Option<RawConfig> =
        serde_yaml::from_str(&rendered).map_err(|source| ConfigLoadError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    Ok(raw.unwrap_or_default())
}

// Render the document as a template with the process environment exposed
// as `env`, e.g. `workers: {{ env.WORKER_COUNT }}`.
fn expand_template(
    source: &str,
    vars: &BTreeMap<String, String>,
) -> Result<String, minijinja::Error> {
    let env = minijinja::Environment::new();
    env.render_str(source, minijinja::context! { env => vars })
}

/// Flatten a raw document against the active environment.
///
/// Defaults first, then the matching environment section overlaid on top.
/// Sections for any other environment are ignored entirely - their entries
/// never leak into the result.
pub fn resolve(raw: &RawConfig, active_env: Option<&str>) -> WorkerCounts {
    let mut counts = WorkerCounts::new();

    for (worker_type, entry) in raw {
        if let RawEntry::Count(count) = entry {
            counts.insert(worker_type.clone(), *count);
        }
    }

    if let Some(name) = active_env
        && let Some(RawEntry::Section(overrides)) = raw.get(name)
    {
        for (worker_type, count) in overrides {
            counts.insert(worker_type.clone(), *count);
        }
    }

    counts
}

/// Resolved, immutable pool configuration.
///
/// The active environment is frozen at construction; picking up ambient
/// changes means building a new `PoolConfig` from the same source.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    environment: Option<String>,
    worker_counts: WorkerCounts,
}

impl PoolConfig {
    pub fn from_source(source: &ConfigSource, probe: &EnvProbe) -> Result<Self, ConfigLoadError> {
        let raw = source.load_raw()?;
        let environment = probe.active_environment().map(str::to_owned);
        let worker_counts = resolve(&raw, environment.as_deref());

        tracing::debug!(
            environment = environment.as_deref().unwrap_or("none"),
            worker_types = worker_counts.len(),
            total_workers = worker_counts.values().sum::<usize>(),
            "resolved pool configuration"
        );

        Ok(Self {
            environment,
            worker_counts,
        })
    }

    /// The environment the config was resolved against, if any.
    pub fn environment(&self) -> Option<&str> {
        self.environment.as_deref()
    }

    pub fn worker_counts(&self) -> &WorkerCounts {
        &self.worker_counts
    }

    /// Desired count for one worker type; `None` if the type is unknown.
    pub fn count_for(&self, worker_type: &str) -> Option<usize> {
        self.worker_counts.get(worker_type).copied()
    }

    pub fn total_workers(&self) -> usize {
        self.worker_counts.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.worker_counts.is_empty()
    }
}
