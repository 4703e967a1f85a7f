//! resque-pool: pool manager core for Resque-style background workers.
//!
//! Two small mechanisms make up the core: resolving a layered,
//! environment-sensitive configuration into worker-type counts, and handing
//! out stable minimal slot indices to live worker processes. The
//! [`PoolManager`] composes both behind a process-control seam the host
//! implements.

mod config;
mod env;
pub mod logging;
mod manager;
mod slots;

pub use config::{
    CONFIG_FILE_CANDIDATES, ConfigLoadError, ConfigSource, PoolConfig, RawConfig, RawEntry,
    WorkerCounts, choose_config_file, resolve,
};
pub use env::EnvProbe;
pub use manager::{PoolCommand, PoolManager, WorkerExit, WorkerId, WorkerSpawner};
pub use slots::SlotAllocator;
