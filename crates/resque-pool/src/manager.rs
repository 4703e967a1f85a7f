//! Pool manager - keeps live workers matched to the resolved configuration.
//!
//! The manager owns the resolved config and the slot registry. Process
//! control lives behind [`WorkerSpawner`]; fork/exec and signal delivery
//! are the host's business. Collaborators drive the manager through two
//! channels: commands (reload, shutdown) and worker-exit notifications
//! from whatever reaps children.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::{ConfigLoadError, ConfigSource, PoolConfig};
use crate::env::EnvProbe;
use crate::slots::SlotAllocator;

/// Opaque identifier for a spawned worker process (the OS pid).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(u32);

impl WorkerId {
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn as_raw(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-control seam implemented by the host.
#[async_trait]
pub trait WorkerSpawner: Send + Sync + 'static {
    /// Start one worker of the given type, returning its process id.
    async fn spawn(&self, worker_type: &str) -> anyhow::Result<WorkerId>;

    /// Ask a worker to stop. `graceful` lets it finish its current job;
    /// otherwise it is terminated immediately.
    async fn stop(&self, id: WorkerId, graceful: bool) -> anyhow::Result<()>;
}

/// Commands the external signal layer maps onto the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolCommand {
    /// Re-resolve configuration from the constructed source and reconcile.
    Reload,
    /// Stop every worker and exit the run loop.
    Shutdown { graceful: bool },
}

/// Notification that a worker process has been reaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    pub id: WorkerId,
    /// Exit status when the reaper has one.
    pub status: Option<i32>,
}

#[derive(Debug)]
struct LiveWorker {
    worker_type: String,
    slot_index: usize,
    /// Stop already requested; excluded from desired-count accounting so
    /// reconcile does not signal it twice.
    stopping: bool,
}

/// Supervises one pool of workers against a [`PoolConfig`].
///
/// Single-owner: every mutation goes through `&mut self`, and the run loop
/// is the only long-lived caller. The slot registry therefore needs no
/// internal locking.
pub struct PoolManager<S> {
    source: ConfigSource,
    probe: EnvProbe,
    config: PoolConfig,
    spawner: Arc<S>,
    slots: SlotAllocator<WorkerId>,
    live: HashMap<WorkerId, LiveWorker>,
}

impl<S: WorkerSpawner> PoolManager<S> {
    /// Resolve configuration from `source` and build an idle manager.
    ///
    /// No workers are started here; that happens on the first reconcile
    /// pass inside [`run`](Self::run).
    pub fn new(
        source: ConfigSource,
        probe: EnvProbe,
        spawner: Arc<S>,
    ) -> Result<Self, ConfigLoadError> {
        let config = PoolConfig::from_source(&source, &probe)?;

        tracing::info!(
            environment = config.environment().unwrap_or("none"),
            worker_types = config.worker_counts().len(),
            total_workers = config.total_workers(),
            "pool manager created"
        );

        Ok(Self {
            source,
            probe,
            config,
            spawner,
            slots: SlotAllocator::new(),
            live: HashMap::new(),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Live workers as (id, worker type, slot index).
    pub fn live_workers(&self) -> impl Iterator<Item = (WorkerId, &str, usize)> {
        self.live
            .iter()
            .map(|(id, worker)| (*id, worker.worker_type.as_str(), worker.slot_index))
    }

    /// Run until a shutdown command arrives or the command channel closes.
    ///
    /// `exits` carries reap notifications from the host; each one frees the
    /// worker's slot index and triggers a reconcile pass so the pool heals
    /// back to the desired counts.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<PoolCommand>,
        mut exits: mpsc::Receiver<WorkerExit>,
    ) {
        self.reconcile().await;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(PoolCommand::Reload) => self.reload().await,
                    Some(PoolCommand::Shutdown { graceful }) => {
                        self.shutdown(graceful, &mut exits).await;
                        break;
                    }
                    // Command channel gone means the host is going away.
                    None => {
                        self.shutdown(true, &mut exits).await;
                        break;
                    }
                },
                exit = exits.recv() => match exit {
                    Some(exit) => {
                        self.handle_exit(exit);
                        self.reconcile().await;
                    }
                    None => {
                        tracing::error!("exit channel closed, stopping pool");
                        self.shutdown(true, &mut exits).await;
                        break;
                    }
                },
            }
        }

        tracing::info!("pool manager exited");
    }

    // Bring live workers in line with the desired counts: spawn what is
    // missing, stop what is excess or no longer configured.
    async fn reconcile(&mut self) {
        let desired: Vec<(String, usize)> = self
            .config
            .worker_counts()
            .iter()
            .map(|(worker_type, count)| (worker_type.clone(), *count))
            .collect();

        for (worker_type, want) in &desired {
            let have = self.active_count(worker_type);

            for _ in have..*want {
                self.spawn_one(worker_type).await;
            }

            if have > *want {
                self.stop_excess(worker_type, have - *want).await;
            }
        }

        let orphaned: Vec<WorkerId> = self
            .live
            .iter()
            .filter(|(_, worker)| {
                !worker.stopping && self.config.count_for(&worker.worker_type).is_none()
            })
            .map(|(id, _)| *id)
            .collect();

        for id in orphaned {
            self.stop_worker(id, true).await;
        }
    }

    fn active_count(&self, worker_type: &str) -> usize {
        self.live
            .values()
            .filter(|worker| worker.worker_type == worker_type && !worker.stopping)
            .count()
    }

    async fn spawn_one(&mut self, worker_type: &str) {
        match self.spawner.spawn(worker_type).await {
            Ok(id) => {
                let slot_index = self.slots.reserve(id);
                self.live.insert(
                    id,
                    LiveWorker {
                        worker_type: worker_type.to_string(),
                        slot_index,
                        stopping: false,
                    },
                );
                tracing::info!(worker = %id, worker_type, slot = slot_index, "worker started");
            }
            // Left for the next reconcile pass to retry.
            Err(error) => {
                tracing::error!(worker_type, error = %error, "failed to spawn worker");
            }
        }
    }

    // Stop the highest slot indices first so the low, stable indices keep
    // their owners.
    async fn stop_excess(&mut self, worker_type: &str, excess: usize) {
        let mut candidates: Vec<(WorkerId, usize)> = self
            .live
            .iter()
            .filter(|(_, worker)| worker.worker_type == worker_type && !worker.stopping)
            .map(|(id, worker)| (*id, worker.slot_index))
            .collect();
        candidates.sort_by_key(|(_, slot_index)| std::cmp::Reverse(*slot_index));

        for (id, _) in candidates.into_iter().take(excess) {
            self.stop_worker(id, true).await;
        }
    }

    async fn stop_worker(&mut self, id: WorkerId, graceful: bool) {
        let Some(worker) = self.live.get_mut(&id) else {
            return;
        };
        worker.stopping = true;
        let worker_type = worker.worker_type.clone();

        match self.spawner.stop(id, graceful).await {
            Ok(()) => {
                tracing::info!(worker = %id, worker_type, graceful, "worker stop requested");
            }
            Err(error) => {
                tracing::warn!(worker = %id, worker_type, error = %error, "failed to stop worker");
            }
        }
    }

    fn handle_exit(&mut self, exit: WorkerExit) {
        match self.live.remove(&exit.id) {
            Some(worker) => {
                let slot_index = self.slots.release(&exit.id);
                tracing::info!(
                    worker = %exit.id,
                    worker_type = %worker.worker_type,
                    slot = slot_index,
                    status = exit.status,
                    "worker exited"
                );
            }
            None => {
                tracing::warn!(worker = %exit.id, "exit notification for unknown worker");
            }
        }
    }

    async fn reload(&mut self) {
        match PoolConfig::from_source(&self.source, &self.probe) {
            Ok(config) => {
                self.config = config;
                tracing::info!(
                    worker_types = self.config.worker_counts().len(),
                    total_workers = self.config.total_workers(),
                    "pool configuration reloaded"
                );
                self.reconcile().await;
            }
            // Keep running on the previous configuration; the operator can
            // fix the file and reload again.
            Err(error) => {
                tracing::error!(error = %error, "config reload failed, keeping previous configuration");
            }
        }
    }

    async fn shutdown(&mut self, graceful: bool, exits: &mut mpsc::Receiver<WorkerExit>) {
        tracing::info!(graceful, live = self.live.len(), "pool shutting down");

        let ids: Vec<WorkerId> = self.live.keys().copied().collect();
        for id in ids {
            self.stop_worker(id, graceful).await;
        }

        while !self.live.is_empty() {
            match exits.recv().await {
                Some(exit) => self.handle_exit(exit),
                None => {
                    tracing::warn!(
                        remaining = self.live.len(),
                        "exit channel closed before all workers were reaped"
                    );
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use crate::config::{RawConfig, RawEntry};

    #[derive(Default)]
    struct RecordingSpawner {
        next_pid: AtomicU32,
        fail_spawns: AtomicBool,
        spawned: Mutex<Vec<(String, WorkerId)>>,
        stopped: Mutex<Vec<(WorkerId, bool)>>,
    }

    #[async_trait]
    impl WorkerSpawner for RecordingSpawner {
        async fn spawn(&self, worker_type: &str) -> anyhow::Result<WorkerId> {
            if self.fail_spawns.load(Ordering::SeqCst) {
                anyhow::bail!("fork failed");
            }
            let id = WorkerId::new(100 + self.next_pid.fetch_add(1, Ordering::SeqCst));
            self.spawned
                .lock()
                .unwrap()
                .push((worker_type.to_string(), id));
            Ok(id)
        }

        async fn stop(&self, id: WorkerId, graceful: bool) -> anyhow::Result<()> {
            self.stopped.lock().unwrap().push((id, graceful));
            Ok(())
        }
    }

    fn inline_source(counts: &[(&str, usize)]) -> ConfigSource {
        let raw: RawConfig = counts
            .iter()
            .map(|(worker_type, count)| (worker_type.to_string(), RawEntry::Count(*count)))
            .collect();
        ConfigSource::Inline(raw)
    }

    fn manager_for(
        source: ConfigSource,
    ) -> (PoolManager<RecordingSpawner>, Arc<RecordingSpawner>) {
        let spawner = Arc::new(RecordingSpawner::default());
        let manager =
            PoolManager::new(source, EnvProbe::default(), Arc::clone(&spawner)).unwrap();
        (manager, spawner)
    }

    #[tokio::test]
    async fn reconcile_spawns_configured_counts() {
        let (mut manager, spawner) = manager_for(inline_source(&[("indexing", 2), ("mail", 1)]));

        manager.reconcile().await;

        assert_eq!(spawner.spawned.lock().unwrap().len(), 3);

        let mut per_type: BTreeMap<&str, usize> = BTreeMap::new();
        for (_, worker_type, _) in manager.live_workers() {
            *per_type.entry(worker_type).or_default() += 1;
        }
        assert_eq!(per_type, BTreeMap::from([("indexing", 2), ("mail", 1)]));

        // Pool-wide slot indices start at zero with no gaps.
        let mut indices: Vec<usize> =
            manager.live_workers().map(|(_, _, index)| index).collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn reconcile_is_stable_when_counts_match() {
        let (mut manager, spawner) = manager_for(inline_source(&[("indexing", 2)]));

        manager.reconcile().await;
        manager.reconcile().await;

        assert_eq!(spawner.spawned.lock().unwrap().len(), 2);
        assert!(spawner.stopped.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn exited_worker_frees_its_slot_for_the_respawn() {
        let (mut manager, _spawner) = manager_for(inline_source(&[("indexing", 2)]));
        manager.reconcile().await;

        let (first, _, first_index) = manager
            .live_workers()
            .min_by_key(|(_, _, index)| *index)
            .unwrap();
        assert_eq!(first_index, 0);

        manager.handle_exit(WorkerExit {
            id: first,
            status: Some(0),
        });
        manager.reconcile().await;

        // Replacement takes over the freed minimal index.
        let mut indices: Vec<usize> =
            manager.live_workers().map(|(_, _, index)| index).collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1]);
        assert!(manager.live_workers().all(|(id, _, _)| id != first));
    }

    #[tokio::test]
    async fn reload_stops_excess_workers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resque-pool.yml");
        std::fs::write(&path, "indexing: 2\n").unwrap();

        let (mut manager, spawner) = manager_for(ConfigSource::File(path.clone()));
        manager.reconcile().await;
        assert_eq!(manager.live_workers().count(), 2);

        std::fs::write(&path, "indexing: 1\n").unwrap();
        manager.reload().await;

        let stopped = spawner.stopped.lock().unwrap().clone();
        assert_eq!(stopped.len(), 1);
        assert!(stopped[0].1, "excess workers are stopped gracefully");

        // The worker holding the highest slot index is the one let go.
        let victim = stopped[0].0;
        let victim_index = manager
            .live_workers()
            .find(|(id, _, _)| *id == victim)
            .map(|(_, _, index)| index)
            .unwrap();
        assert_eq!(victim_index, 1);

        manager.handle_exit(WorkerExit {
            id: victim,
            status: Some(0),
        });
        assert_eq!(manager.live_workers().count(), 1);
    }

    #[tokio::test]
    async fn reload_failure_keeps_previous_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resque-pool.yml");
        std::fs::write(&path, "indexing: 2\n").unwrap();

        let (mut manager, spawner) = manager_for(ConfigSource::File(path.clone()));
        manager.reconcile().await;

        std::fs::write(&path, "indexing: [broken\n").unwrap();
        manager.reload().await;

        assert_eq!(manager.config().count_for("indexing"), Some(2));
        assert_eq!(manager.live_workers().count(), 2);
        assert!(spawner.stopped.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn workers_of_removed_types_are_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resque-pool.yml");
        std::fs::write(&path, "indexing: 1\nmail: 1\n").unwrap();

        let (mut manager, spawner) = manager_for(ConfigSource::File(path.clone()));
        manager.reconcile().await;

        std::fs::write(&path, "indexing: 1\n").unwrap();
        manager.reload().await;

        let stopped = spawner.stopped.lock().unwrap().clone();
        assert_eq!(stopped.len(), 1);
        let (victim, _) = stopped[0];
        let victim_type = manager
            .live_workers()
            .find(|(id, _, _)| *id == victim)
            .map(|(_, worker_type, _)| worker_type.to_string())
            .unwrap();
        assert_eq!(victim_type, "mail");
    }

    #[tokio::test]
    async fn spawn_failure_is_retried_on_next_reconcile() {
        let (mut manager, spawner) = manager_for(inline_source(&[("indexing", 1)]));

        spawner.fail_spawns.store(true, Ordering::SeqCst);
        manager.reconcile().await;
        assert_eq!(manager.live_workers().count(), 0);

        spawner.fail_spawns.store(false, Ordering::SeqCst);
        manager.reconcile().await;
        assert_eq!(manager.live_workers().count(), 1);
    }

    #[tokio::test]
    async fn unknown_exit_notification_is_ignored() {
        let (mut manager, _spawner) = manager_for(inline_source(&[("indexing", 1)]));
        manager.reconcile().await;

        manager.handle_exit(WorkerExit {
            id: WorkerId::new(9999),
            status: None,
        });

        assert_eq!(manager.live_workers().count(), 1);
    }

    #[tokio::test]
    async fn shutdown_stops_everything_and_drains_exits() {
        let (mut manager, spawner) = manager_for(inline_source(&[("indexing", 2), ("mail", 1)]));
        manager.reconcile().await;

        let ids: Vec<WorkerId> = manager.live_workers().map(|(id, _, _)| id).collect();
        let (exit_tx, mut exit_rx) = mpsc::channel(8);
        for id in &ids {
            exit_tx
                .send(WorkerExit {
                    id: *id,
                    status: Some(0),
                })
                .await
                .unwrap();
        }

        manager.shutdown(false, &mut exit_rx).await;

        let stopped = spawner.stopped.lock().unwrap().clone();
        assert_eq!(stopped.len(), 3);
        assert!(stopped.iter().all(|(_, graceful)| !graceful));
        assert_eq!(manager.live_workers().count(), 0);
        assert!(manager.slots.is_empty());
    }

    #[tokio::test]
    async fn run_exits_on_shutdown_command() {
        let (manager, _spawner) = manager_for(ConfigSource::Absent);
        let (command_tx, command_rx) = mpsc::channel(1);
        let (_exit_tx, exit_rx) = mpsc::channel(1);

        let handle = tokio::spawn(manager.run(command_rx, exit_rx));
        command_tx
            .send(PoolCommand::Shutdown { graceful: true })
            .await
            .unwrap();

        handle.await.unwrap();
    }
}
