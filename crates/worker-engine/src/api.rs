//! Public API types for the in-process `bundle-worker` engine.

use std::path::PathBuf;
use std::time::Duration;

use bundle_worker_core::identity::WorkerIdentity;
use reqwest::Url;
use serde::{Deserialize, Serialize};

/// Configuration for the in-process worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Bundle service base URL (e.g. `http://127.0.0.1:2900/`).
    pub server_url: Url,

    /// Identity (id + tag) this worker registers under.
    pub identity: WorkerIdentity,

    /// Root of the worker's on-disk state: run directories, the dependency
    /// cache, and the persisted run records all live under it.
    pub work_dir: PathBuf,

    /// Directory replaced by the code tarball during self-upgrade.
    pub code_dir: PathBuf,

    /// CPU core identifiers this worker may pin runs to.
    pub cpus: Vec<u32>,

    /// GPU device identifiers, or `None` to auto-detect via the container
    /// runtime at startup.
    pub gpus: Option<Vec<u32>>,

    /// Installed memory of this machine, in bytes.
    pub memory_bytes: u64,

    /// Byte quota for the dependency cache.
    pub dependency_quota_bytes: u64,

    /// Byte quota for locally cached container images; `None` disables
    /// image reclamation.
    pub image_quota_bytes: Option<u64>,

    /// Prefix of the two user-defined container networks
    /// (`<prefix>_ext` with egress, `<prefix>_int` without).
    pub network_prefix: String,

    /// How long a graceful container stop may take before force-kill.
    pub grace_period: Duration,

    /// Sleep between failed check-in attempts.
    pub checkin_retry: Duration,

    /// Cadence of the dependency and image cache reclamation passes.
    pub cleanup_interval: Duration,
}

impl WorkerConfig {
    /// Default container network prefix.
    pub const DEFAULT_NETWORK_PREFIX: &'static str = "codalab_worker_network";

    /// Default graceful-stop grace period.
    pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

    /// Default sleep between failed check-ins.
    pub const DEFAULT_CHECKIN_RETRY: Duration = Duration::from_secs(1);

    /// Default cache reclamation cadence.
    pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

    /// Default dependency cache quota (10 GB).
    pub const DEFAULT_DEPENDENCY_QUOTA: u64 = 10 * 1000 * 1000 * 1000;
}

/// Logical state of one run. Transitions only move forward; `Finished` and
/// `Failed` are absorbing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    /// Image being ensured, working directory being created.
    Preparing,
    /// Dependencies being downloaded and materialized.
    Staging,
    /// Container launched and being monitored.
    Running,
    /// Output directory being archived and uploaded.
    Uploading,
    /// Terminal metadata being reported.
    Finalizing,
    /// Terminal: run completed and was reported.
    Finished,
    /// Terminal: run failed; the failure message says why.
    Failed,
}

impl std::fmt::Display for RunStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.status_str())
    }
}

impl RunStage {
    pub(crate) fn is_terminal(self) -> bool {
        matches!(self, RunStage::Finished | RunStage::Failed)
    }

    pub(crate) fn status_str(self) -> &'static str {
        match self {
            RunStage::Preparing => "preparing",
            RunStage::Staging => "staging",
            RunStage::Running => "running",
            RunStage::Uploading => "uploading",
            RunStage::Finalizing => "finalizing",
            RunStage::Finished => "finished",
            RunStage::Failed => "failed",
        }
    }
}

/// Accumulated resource usage of one run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunUsage {
    /// Wall-clock seconds since the container started.
    pub time_seconds: u64,
    /// Peak observed memory usage in bytes.
    pub memory_max_bytes: u64,
    /// Bytes used by the run's working directory.
    pub disk_bytes: u64,
}

/// Terminal result of one run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunOutcome {
    /// Run (bundle) UUID.
    pub uuid: String,
    /// Terminal stage (`Finished` or `Failed`).
    pub stage: RunStage,
    /// Container exit code, when the container ran to an exit.
    pub exit_code: Option<i64>,
    /// Reason the run failed, including kill reasons.
    pub failure_message: Option<String>,
}

/// Snapshot of one live run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSnapshot {
    /// Run (bundle) UUID.
    pub uuid: String,
    /// Current stage.
    pub stage: RunStage,
    /// Command line the run executes.
    pub command: String,
    /// Latest resource usage.
    pub usage: RunUsage,
}

/// Current worker state snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusSnapshot {
    /// Whether a drain has been requested.
    pub draining: bool,
    /// Free CPU cores.
    pub cpus_free: usize,
    /// Configured CPU cores.
    pub cpus_total: usize,
    /// Free GPU devices.
    pub gpus_free: usize,
    /// Configured GPU devices.
    pub gpus_total: usize,
    /// Per-run snapshots.
    pub runs: Vec<RunSnapshot>,
}

/// Worker event stream payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum WorkerEvent {
    /// Worker started.
    Started,
    /// An informational message (e.g. connectivity restored).
    Info {
        /// Message text.
        message: String,
    },
    /// A run assignment was accepted.
    RunAssigned {
        /// Run UUID.
        uuid: String,
    },
    /// A run moved to a new stage.
    RunStage {
        /// Run UUID.
        uuid: String,
        /// New stage.
        stage: RunStage,
    },
    /// A run reached a terminal state.
    RunFinished {
        /// Terminal result.
        outcome: RunOutcome,
    },
    /// A drain was requested (signal or upgrade); no new runs accepted.
    DrainRequested,
    /// The service asked this worker to upgrade itself after draining.
    UpgradeRequested,
    /// A warning from the worker.
    Warning {
        /// Warning message.
        message: String,
    },
    /// A non-fatal error from the worker.
    Error {
        /// Error message.
        message: String,
    },
    /// Worker stopped.
    Stopped,
}

/// Why the worker exited its main loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Clean drain; the supervisor should not restart.
    Clean,
    /// Drain triggered by an upgrade; new code is in place and the
    /// supervisor should restart the worker (exit code 123).
    Upgrade,
}

/// Handle to a running in-process worker instance.
pub struct WorkerHandle {
    pub(crate) inner: std::sync::Arc<crate::engine::WorkerInner>,
    pub(crate) join: tokio::task::JoinHandle<anyhow::Result<WorkerExit>>,
}

impl WorkerHandle {
    /// Subscribe to the worker event stream.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkerEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Get the latest worker snapshot.
    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner.snapshot_rx.borrow().clone()
    }

    /// Request a graceful drain (finish live runs, accept no new ones).
    pub fn request_drain(&self) {
        self.inner.request_drain();
    }

    /// Wait for the worker to stop, returning how it exited.
    pub async fn wait(self) -> anyhow::Result<WorkerExit> {
        match self.join.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("worker task join error: {err}")),
        }
    }
}

/// Start a new in-process worker instance.
pub fn start_worker(config: WorkerConfig) -> WorkerHandle {
    crate::engine::start_worker(config)
}
