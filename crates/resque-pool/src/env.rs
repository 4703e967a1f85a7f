//! Active-environment detection.
//!
//! A pool runs against at most one named environment (e.g. "test",
//! "production"). The probe bundles every ambient signal that can name it,
//! so precedence is an explicit pure function instead of scattered reads of
//! process-wide state.

/// Snapshot of the ambient signals that can select the active environment.
///
/// Checked in strict order: [`app_env`](Self::app_env),
/// [`framework_env`](Self::framework_env), `RESQUE_ENV`, `RACK_ENV`,
/// `RAILS_ENV`. The first present, non-empty value wins; with none set the
/// pool runs in defaults-only mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvProbe {
    /// Environment name defined by the host application itself.
    /// Takes precedence over everything else.
    pub app_env: Option<String>,
    /// Environment reported by an embedding framework, when one is loaded.
    pub framework_env: Option<String>,
    /// `RESQUE_ENV` environment variable.
    pub resque_env: Option<String>,
    /// `RACK_ENV` environment variable.
    pub rack_env: Option<String>,
    /// `RAILS_ENV` environment variable.
    pub rails_env: Option<String>,
}

impl EnvProbe {
    /// Capture the probe from the real process environment.
    ///
    /// Only the three environment variables are read here; the host
    /// application injects `app_env`/`framework_env` via the builders when
    /// it has them.
    pub fn from_process_env() -> Self {
        Self {
            app_env: None,
            framework_env: None,
            resque_env: env_var("RESQUE_ENV"),
            rack_env: env_var("RACK_ENV"),
            rails_env: env_var("RAILS_ENV"),
        }
    }

    pub fn with_app_env(mut self, name: impl Into<String>) -> Self {
        self.app_env = Some(name.into());
        self
    }

    pub fn with_framework_env(mut self, name: impl Into<String>) -> Self {
        self.framework_env = Some(name.into());
        self
    }

    /// The active environment name, or `None` for defaults-only mode.
    ///
    /// Pure read of the snapshot. Callers that want the value frozen (the
    /// config resolver does) must capture it at construction; later ambient
    /// changes are not observed through an old probe.
    pub fn active_environment(&self) -> Option<&str> {
        [
            &self.app_env,
            &self.framework_env,
            &self.resque_env,
            &self.rack_env,
            &self.rails_env,
        ]
        .into_iter()
        .filter_map(|signal| signal.as_deref())
        .find(|name| !name.is_empty())
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}
