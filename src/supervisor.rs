//! Workspace-keyed worker process registry.
//!
//! One worker per workspace key, started on first use and tracked until it
//! exits. A monitor task per worker (bounded by a small pool) awaits the
//! process and retires its registry entry, so callers observing a missing
//! entry can respawn transparently.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, Semaphore};

use crate::bridge::channel::Channel;
use crate::bridge::protocol::Request;

/// Channel bound to a spawned worker's pipe pair.
pub type WorkerChannel = Channel<ChildStdout, ChildStdin>;

/// Monitors beyond this many live workers wait their turn; the workers
/// themselves run immediately, only exit observation is delayed.
const MONITOR_POOL_SIZE: usize = 10;

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("empty worker command")]
    EmptyCommand,

    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("worker spawned without {0} pipe")]
    MissingPipe(&'static str),

    #[error("supervisor is shut down")]
    ShutDown,
}

/// How to start a worker: its command line and the directory it runs in.
#[derive(Debug, Clone)]
pub struct WorkerLaunch {
    pub command: Vec<String>,
    pub cwd: PathBuf,
}

impl WorkerLaunch {
    pub fn new(command: Vec<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command,
            cwd: cwd.into(),
        }
    }
}

struct WorkerEntry {
    pid: Option<u32>,
    channel: Arc<WorkerChannel>,
}

/// Registry of live workers, one per workspace key.
pub struct ProcessSupervisor {
    entries: Mutex<HashMap<String, WorkerEntry>>,
    monitors: Arc<Semaphore>,
    shut_down: AtomicBool,
}

impl ProcessSupervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            monitors: Arc::new(Semaphore::new(MONITOR_POOL_SIZE)),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub async fn is_registered(&self, workspace: &str) -> bool {
        self.entries.lock().await.contains_key(workspace)
    }

    /// Returns the workspace's live channel, starting a worker first if none
    /// is registered. The registry lock spans lookup and spawn, so two
    /// concurrent callers cannot both start a worker for the same key.
    pub async fn get_or_start(
        self: &Arc<Self>,
        workspace: &str,
        launch: &WorkerLaunch,
    ) -> Result<Arc<WorkerChannel>, SpawnError> {
        let mut entries = self.entries.lock().await;
        // Checked under the registry lock: shutdown sets the flag before it
        // snapshots entries, so a worker registered while the flag is clear
        // is always in the snapshot and gets its exit signal.
        if self.is_shut_down() {
            return Err(SpawnError::ShutDown);
        }
        if let Some(entry) = entries.get(workspace) {
            return Ok(Arc::clone(&entry.channel));
        }

        let (program, args) = launch
            .command
            .split_first()
            .ok_or(SpawnError::EmptyCommand)?;
        tracing::info!(workspace = %workspace, command = %program, "Starting worker");
        let mut child = Command::new(program)
            .args(args)
            .current_dir(&launch.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            // Worker diagnostics share our stderr; stdout is the transport.
            .stderr(Stdio::inherit())
            .spawn()?;

        let child_stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
        let child_stdout = child
            .stdout
            .take()
            .ok_or(SpawnError::MissingPipe("stdout"))?;
        let channel = Arc::new(Channel::new(child_stdout, child_stdin));
        let pid = child.id();

        entries.insert(
            workspace.to_string(),
            WorkerEntry {
                pid,
                channel: Arc::clone(&channel),
            },
        );
        tracing::debug!(workspace = %workspace, pid, "Worker registered");

        tokio::spawn(Arc::clone(self).monitor(workspace.to_string(), child, Arc::clone(&channel)));

        Ok(channel)
    }

    /// Removes the workspace entry if it still belongs to `channel`, then
    /// closes the channel. A respawned successor under the same key is left
    /// alone, so a stale caller cannot knock out a fresh worker.
    pub async fn retire(&self, workspace: &str, channel: &Arc<WorkerChannel>) {
        {
            let mut entries = self.entries.lock().await;
            if let Some(entry) = entries.get(workspace) {
                if Arc::ptr_eq(&entry.channel, channel) {
                    let pid = entry.pid;
                    entries.remove(workspace);
                    tracing::debug!(workspace = %workspace, pid, "Worker entry retired");
                }
            }
        }
        channel.close().await;
    }

    /// Signals every live worker to exit. Exactly-once; later calls are
    /// no-ops. Best-effort: does not wait for workers to die, and delivery
    /// failures are swallowed because a worker may already be gone.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Supervisor shutting down");

        let channels: Vec<(String, Arc<WorkerChannel>)> = {
            let entries = self.entries.lock().await;
            entries
                .iter()
                .map(|(key, entry)| (key.clone(), Arc::clone(&entry.channel)))
                .collect()
        };

        for (workspace, channel) in channels {
            if let Err(e) = channel.send(&Request::exit()).await {
                tracing::debug!(workspace = %workspace, error = %e, "Exit signal not delivered");
            }
        }

        // No new monitor may start waiting; running ones keep their permits
        // and reap normally as workers exit.
        self.monitors.close();
    }

    async fn monitor(self: Arc<Self>, workspace: String, mut child: Child, channel: Arc<WorkerChannel>) {
        let _permit = match Arc::clone(&self.monitors).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                tracing::warn!(workspace = %workspace, "Shut down before monitoring began");
                return;
            }
        };

        match child.wait().await {
            Ok(status) => {
                tracing::info!(workspace = %workspace, %status, "Worker exited");
            }
            Err(e) => {
                tracing::warn!(workspace = %workspace, error = %e, "Wait for worker failed");
            }
        }

        self.retire(&workspace, &channel).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cat_launch() -> WorkerLaunch {
        WorkerLaunch::new(vec!["cat".to_string()], std::env::temp_dir())
    }

    async fn wait_until_unregistered(supervisor: &ProcessSupervisor, workspace: &str) -> bool {
        for _ in 0..100 {
            if !supervisor.is_registered(workspace).await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test]
    async fn get_or_start_is_idempotent_per_workspace() {
        let supervisor = ProcessSupervisor::new();
        let launch = cat_launch();

        let first = supervisor.get_or_start("ws-a", &launch).await.unwrap();
        let second = supervisor.get_or_start("ws-a", &launch).await.unwrap();
        let other = supervisor.get_or_start("ws-b", &launch).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));

        first.close().await;
        other.close().await;
    }

    #[tokio::test]
    async fn monitor_retires_entry_when_worker_exits() {
        let supervisor = ProcessSupervisor::new();

        let channel = supervisor.get_or_start("ws", &cat_launch()).await.unwrap();
        assert!(supervisor.is_registered("ws").await);

        // cat exits when its stdin closes.
        channel.close().await;
        assert!(wait_until_unregistered(&supervisor, "ws").await);

        // The key is free for a fresh worker.
        let respawned = supervisor.get_or_start("ws", &cat_launch()).await.unwrap();
        assert!(!Arc::ptr_eq(&channel, &respawned));
        respawned.close().await;
    }

    #[tokio::test]
    async fn stale_retire_leaves_successor_alone() {
        let supervisor = ProcessSupervisor::new();

        let first = supervisor.get_or_start("ws", &cat_launch()).await.unwrap();
        supervisor.retire("ws", &first).await;
        assert!(wait_until_unregistered(&supervisor, "ws").await);

        let second = supervisor.get_or_start("ws", &cat_launch()).await.unwrap();

        // A late retire against the dead predecessor must not remove the
        // successor's entry.
        supervisor.retire("ws", &first).await;
        assert!(supervisor.is_registered("ws").await);

        second.close().await;
    }

    #[tokio::test]
    async fn shutdown_refuses_new_workers_and_is_idempotent() {
        let supervisor = ProcessSupervisor::new();

        supervisor.shutdown().await;
        supervisor.shutdown().await;

        assert!(supervisor.is_shut_down());
        assert!(matches!(
            supervisor.get_or_start("ws", &cat_launch()).await,
            Err(SpawnError::ShutDown)
        ));
    }

    #[tokio::test]
    async fn get_or_start_parked_across_shutdown_is_refused() {
        let supervisor = ProcessSupervisor::new();

        // Park a get_or_start on the registry lock, then shut down before
        // the lock is released. The parked caller must be refused rather
        // than register a worker the exit broadcast already missed.
        let held = supervisor.entries.lock().await;

        let racing = tokio::spawn({
            let supervisor = Arc::clone(&supervisor);
            async move { supervisor.get_or_start("ws", &cat_launch()).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let closing = tokio::spawn({
            let supervisor = Arc::clone(&supervisor);
            async move { supervisor.shutdown().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(held);

        assert!(matches!(racing.await.unwrap(), Err(SpawnError::ShutDown)));
        closing.await.unwrap();
        assert!(!supervisor.is_registered("ws").await);
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let supervisor = ProcessSupervisor::new();
        let launch = WorkerLaunch::new(Vec::new(), std::env::temp_dir());

        assert!(matches!(
            supervisor.get_or_start("ws", &launch).await,
            Err(SpawnError::EmptyCommand)
        ));
    }

    #[tokio::test]
    async fn unspawnable_command_surfaces_io_error() {
        let supervisor = ProcessSupervisor::new();
        let launch = WorkerLaunch::new(
            vec!["definitely-not-a-real-worker".to_string()],
            std::env::temp_dir(),
        );

        assert!(matches!(
            supervisor.get_or_start("ws", &launch).await,
            Err(SpawnError::Spawn(_))
        ));
    }
}
