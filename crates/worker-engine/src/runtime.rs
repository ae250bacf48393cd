use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

/// Failure surfaced by the container runtime adapter.
///
/// Transient failures are worth retrying with backoff; permanent ones abort
/// the operation that triggered them.
#[derive(Debug, thiserror::Error)]
pub(crate) enum RuntimeError {
    #[error("transient runtime error: {0:#}")]
    Transient(anyhow::Error),
    #[error("runtime error: {0:#}")]
    Permanent(anyhow::Error),
    #[error("container {0} no longer exists")]
    ContainerMissing(String),
}

impl RuntimeError {
    pub(crate) fn is_transient(&self) -> bool {
        matches!(self, RuntimeError::Transient(_))
    }
}

/// A host path mounted into the container.
#[derive(Debug, Clone)]
pub(crate) struct BindMount {
    pub(crate) host: PathBuf,
    pub(crate) container: String,
    pub(crate) read_only: bool,
}

/// Everything needed to create and start one run container.
#[derive(Debug, Clone)]
pub(crate) struct ContainerSpec {
    pub(crate) image: String,
    /// Shell command line, executed via `/bin/sh -c`.
    pub(crate) command: String,
    /// Container-side working directory (the run directory mount point).
    pub(crate) working_dir: String,
    pub(crate) binds: Vec<BindMount>,
    pub(crate) cpuset: BTreeSet<u32>,
    pub(crate) gpus: BTreeSet<u32>,
    pub(crate) memory_bytes: u64,
    /// User-defined network the container joins.
    pub(crate) network: String,
}

/// Externally observed container state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ContainerStatus {
    Running,
    Exited {
        exit_code: Option<i64>,
        oom_killed: bool,
    },
    Missing,
}

/// New output bytes past previously seen offsets.
#[derive(Debug, Clone, Default)]
pub(crate) struct OutputTail {
    pub(crate) stdout: Bytes,
    pub(crate) stderr: Bytes,
}

/// One point-in-time resource usage sample.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ResourceSample {
    pub(crate) memory_bytes: u64,
}

/// A locally present container image.
#[derive(Debug, Clone)]
pub(crate) struct ImageInfo {
    pub(crate) reference: String,
    pub(crate) size_bytes: u64,
}

/// Capability surface the worker requires of a container engine.
///
/// Purely mechanical; policy (quotas, retries, state machines) lives in the
/// callers.
#[async_trait]
pub(crate) trait ContainerRuntime: Send + Sync + 'static {
    /// Create the named user-defined network if it does not exist.
    async fn ensure_network(&self, name: &str, internal: bool) -> Result<(), RuntimeError>;

    async fn pull_image(&self, reference: &str) -> Result<(), RuntimeError>;
    async fn list_images(&self) -> Result<Vec<ImageInfo>, RuntimeError>;
    async fn remove_image(&self, reference: &str) -> Result<(), RuntimeError>;

    /// Whether the image (and, when given, the exact digest) is present.
    async fn image_present(
        &self,
        reference: &str,
        digest: Option<&str>,
    ) -> Result<bool, RuntimeError>;

    /// Create and start a container, returning the engine's identifier.
    async fn start_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn container_status(&self, id: &str) -> Result<ContainerStatus, RuntimeError>;

    /// Fetch output produced after the given byte offsets.
    ///
    /// Offsets index the full stdout/stderr history of the container, so a
    /// restarted worker resumes tailing exactly where it stopped.
    async fn tail_output(
        &self,
        id: &str,
        stdout_offset: u64,
        stderr_offset: u64,
    ) -> Result<OutputTail, RuntimeError>;

    async fn container_stats(&self, id: &str) -> Result<ResourceSample, RuntimeError>;

    /// Graceful stop; the engine force-kills after `grace` expires.
    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError>;

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Address of the container on the named user-defined network.
    async fn container_ip(&self, id: &str, network: &str) -> Result<String, RuntimeError>;

    /// Identifiers of accelerator devices available on this host.
    async fn gpu_inventory(&self) -> Result<Vec<u32>, RuntimeError>;
}
