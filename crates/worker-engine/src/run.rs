use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, watch};

use crate::api::{RunOutcome, RunStage, RunUsage, WorkerEvent};
use crate::backend::{
    BundleAssignment, BundleContentsKind, BundleService, RequestedResources, RunMetadataUpdate,
};
use crate::deps::{Acquired, DependencyCache, DependencyKey, DownloadStatus};
use crate::fsutil::{self, CopyOutcome, Progress};
use crate::images::ImageCache;
use crate::pool::ResourcePool;
use crate::runtime::{BindMount, ContainerRuntime, ContainerSpec, ContainerStatus, RuntimeError};
use crate::state::StateStore;

const CONTAINER_WORKING_DIR: &str = "/workspace";

const POLL_START: Duration = Duration::from_secs(1);
const POLL_GROWTH: f64 = 1.1;
const POLL_CAP_SECS: f64 = 60.0;

const DISK_SAMPLE_EVERY: u32 = 5;
const METADATA_REPORT_INTERVAL: Duration = Duration::from_secs(10);
const DOWNLOAD_PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

const UPLOAD_ATTEMPTS: u32 = 5;
const FINAL_REPORT_ATTEMPTS: u32 = 5;

/// Serializable source of truth for one run; the live driver is a view
/// over it. Holding this record (plus the shared collaborators) is enough
/// to rebind to a still-running container after a worker restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RunRecord {
    pub(crate) uuid: String,
    pub(crate) bundle: BundleAssignment,
    pub(crate) resources: RequestedResources,
    pub(crate) working_dir: PathBuf,
    pub(crate) cpuset: BTreeSet<u32>,
    pub(crate) gpuset: BTreeSet<u32>,
    #[serde(default)]
    pub(crate) container_id: Option<String>,
    pub(crate) stage: RunStage,
    #[serde(default)]
    pub(crate) stdout_offset: u64,
    #[serde(default)]
    pub(crate) stderr_offset: u64,
    #[serde(default)]
    pub(crate) started_at: Option<i64>,
    #[serde(default)]
    pub(crate) usage: RunUsage,
}

impl RunRecord {
    pub(crate) fn new(
        bundle: BundleAssignment,
        resources: RequestedResources,
        working_dir: PathBuf,
        cpuset: BTreeSet<u32>,
        gpuset: BTreeSet<u32>,
    ) -> Self {
        Self {
            uuid: bundle.uuid.clone(),
            bundle,
            resources,
            working_dir,
            cpuset,
            gpuset,
            container_id: None,
            stage: RunStage::Preparing,
            stdout_offset: 0,
            stderr_offset: 0,
            started_at: None,
            usage: RunUsage::default(),
        }
    }
}

/// Reason-carrying kill request, observed cooperatively by the driver.
pub(crate) struct KillFlag {
    reason: Mutex<Option<String>>,
    tx: watch::Sender<bool>,
}

impl KillFlag {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            reason: Mutex::new(None),
            tx,
        }
    }

    /// Set the flag; the first reason wins.
    pub(crate) fn kill(&self, reason: &str) {
        {
            let mut slot = self.reason.lock().expect("kill flag lock poisoned");
            if slot.is_none() {
                *slot = Some(reason.to_string());
            }
        }
        self.tx.send_replace(true);
    }

    pub(crate) fn reason(&self) -> Option<String> {
        self.reason.lock().expect("kill flag lock poisoned").clone()
    }

    pub(crate) fn is_killed(&self) -> bool {
        self.reason().is_some()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Shared collaborators handed to every run driver and out-of-band task.
pub(crate) struct RunContext {
    pub(crate) service: Arc<dyn BundleService>,
    pub(crate) runtime: Arc<dyn ContainerRuntime>,
    pub(crate) images: Arc<ImageCache>,
    pub(crate) deps: Arc<DependencyCache>,
    pub(crate) pool: Arc<ResourcePool>,
    pub(crate) state: Arc<StateStore>,
    pub(crate) events: broadcast::Sender<WorkerEvent>,
    pub(crate) finished_tx: mpsc::UnboundedSender<RunOutcome>,
    pub(crate) grace_period: Duration,
    pub(crate) network_ext: String,
    pub(crate) network_int: String,
}

impl RunContext {
    fn network_for(&self, resources: &RequestedResources) -> String {
        if resources.request_network {
            self.network_ext.clone()
        } else {
            self.network_int.clone()
        }
    }
}

/// Drive one run to a terminal state. Never returns early; every exit path
/// releases resources and notifies the worker.
pub(crate) async fn drive(ctx: Arc<RunContext>, kill: Arc<KillFlag>, record: RunRecord) {
    let driver = Driver {
        ctx,
        kill,
        record,
        exit_code: None,
        oom_killed: false,
    };
    driver.run().await;
}

struct Driver {
    ctx: Arc<RunContext>,
    kill: Arc<KillFlag>,
    record: RunRecord,
    exit_code: Option<i64>,
    oom_killed: bool,
}

impl Driver {
    async fn run(mut self) {
        let failure = self.execute().await.err();
        self.finalize(failure).await;
    }

    /// Enter the state machine at the record's current stage, so resumed
    /// records continue where the previous process stopped.
    async fn execute(&mut self) -> Result<(), String> {
        match self.record.stage {
            RunStage::Finished | RunStage::Failed => Ok(()),
            RunStage::Running => {
                self.monitor().await?;
                self.upload().await
            }
            RunStage::Uploading | RunStage::Finalizing => self.upload().await,
            RunStage::Preparing | RunStage::Staging => {
                self.prepare().await?;
                self.stage_deps().await?;
                self.launch().await?;
                self.monitor().await?;
                self.upload().await
            }
        }
    }

    async fn set_stage(&mut self, stage: RunStage) {
        // Stages only move forward; a resumed record re-entering an earlier
        // step keeps its later stage.
        if stage <= self.record.stage {
            return;
        }
        self.record.stage = stage;
        self.store_record();
        let _ = self.ctx.events.send(WorkerEvent::RunStage {
            uuid: self.record.uuid.clone(),
            stage,
        });

        let update = RunMetadataUpdate {
            run_status: Some(stage.status_str().to_string()),
            ..Default::default()
        };
        if let Err(err) = self
            .ctx
            .service
            .update_run_metadata(&self.record.uuid, &update)
            .await
        {
            log::debug!("metadata update failed for {}: {err}", self.record.uuid);
        }
    }

    fn store_record(&self) {
        let record = self.record.clone();
        self.ctx
            .state
            .update_run(&self.record.uuid, move |stored| *stored = record);
    }

    async fn save_state(&self) {
        if let Err(err) = self.ctx.state.save().await {
            log::warn!("state save failed: {err:#}");
        }
    }

    async fn prepare(&mut self) -> Result<(), String> {
        self.set_stage(RunStage::Preparing).await;

        let digest = self.record.bundle.docker_image_digest.clone();
        self.ctx
            .images
            .ensure(&self.record.bundle.docker_image, digest.as_deref())
            .await
            .map_err(|err| format!("Image pull failed: {err}"))?;

        tokio::fs::create_dir_all(&self.record.working_dir)
            .await
            .map_err(|err| format!("Failed to create working directory: {err}"))?;
        Ok(())
    }

    async fn stage_deps(&mut self) -> Result<(), String> {
        self.set_stage(RunStage::Staging).await;

        for dep in self.record.bundle.dependencies.clone() {
            if let Some(reason) = self.kill.reason() {
                return Err(reason);
            }

            let key = DependencyKey::new(&dep.parent_uuid, &dep.parent_path);
            match self.ctx.deps.acquire(&key, &self.record.uuid) {
                Acquired::Ready { .. } => {}
                Acquired::MustDownload { path } => {
                    match self.download_dependency(&key, &path).await {
                        Ok(()) => self.ctx.deps.finish_download(&key, Ok(())).await,
                        Err(message) => {
                            self.ctx
                                .deps
                                .finish_download(&key, Err(message.clone()))
                                .await;
                            return Err(message);
                        }
                    }
                }
                Acquired::Wait { mut done, .. } => {
                    let mut kill_rx = self.kill.subscribe();
                    kill_rx.borrow_and_update();
                    loop {
                        if let Some(reason) = self.kill.reason() {
                            return Err(reason);
                        }
                        let status = done.borrow_and_update().clone();
                        match status {
                            DownloadStatus::Ready => break,
                            DownloadStatus::Failed(message) => return Err(message),
                            DownloadStatus::InProgress => {
                                tokio::select! {
                                    res = done.changed() => {
                                        if res.is_err() {
                                            return Err("Dependency download aborted".to_string());
                                        }
                                    }
                                    _ = kill_rx.changed() => {}
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Stream one dependency payload to disk, reporting progress upstream
    /// and honoring the kill flag at chunk granularity.
    async fn download_dependency(
        &mut self,
        key: &DependencyKey,
        dest: &Path,
    ) -> Result<(), String> {
        log::debug!(
            "downloading dependency {}/{}",
            key.parent_uuid,
            key.parent_path
        );
        let (kind, stream) = self
            .ctx
            .service
            .get_bundle_contents(&key.parent_uuid, &key.parent_path)
            .await
            .map_err(|err| format!("Dependency download failed: {err}"))?;

        let download_path = match kind {
            BundleContentsKind::File => dest.to_path_buf(),
            BundleContentsKind::Directory => {
                PathBuf::from(format!("{}.partial.tar.gz", dest.display()))
            }
        };

        let progress = Arc::new(AtomicU64::new(0));
        let reporter = {
            let service = self.ctx.service.clone();
            let uuid = self.record.uuid.clone();
            let progress = progress.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(DOWNLOAD_PROGRESS_INTERVAL).await;
                    let update = RunMetadataUpdate {
                        bytes_downloaded: Some(progress.load(Ordering::Relaxed)),
                        ..Default::default()
                    };
                    if let Err(err) = service.update_run_metadata(&uuid, &update).await {
                        log::debug!("download progress report failed for {uuid}: {err}");
                    }
                }
            })
        };

        let copied = {
            let kill = self.kill.clone();
            let progress = progress.clone();
            let result = async {
                let mut file = tokio::fs::File::create(&download_path)
                    .await
                    .map_err(|err| format!("Dependency download failed: {err}"))?;
                let outcome = fsutil::copy_with_progress(stream, &mut file, move |copied| {
                    progress.store(copied, Ordering::Relaxed);
                    if kill.is_killed() {
                        Progress::Cancel
                    } else {
                        Progress::Continue
                    }
                })
                .await
                .map_err(|err| format!("Dependency download failed: {err:#}"))?;

                match outcome {
                    CopyOutcome::Completed(_) => Ok(()),
                    CopyOutcome::Cancelled(_) => Err(self
                        .kill
                        .reason()
                        .unwrap_or_else(|| "Run killed".to_string())),
                }
            }
            .await;
            reporter.abort();
            result
        };

        match copied {
            Ok(()) => {
                log::debug!(
                    "finished downloading dependency {}/{}",
                    key.parent_uuid,
                    key.parent_path
                );
                if kind == BundleContentsKind::Directory {
                    let archive = download_path.clone();
                    let target = dest.to_path_buf();
                    let unpack = tokio::task::spawn_blocking(move || {
                        let res = fsutil::un_tar_gz(&archive, &target);
                        fsutil::remove_path(&archive);
                        res
                    })
                    .await;
                    match unpack {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(err)) => Err(format!("Dependency unpack failed: {err:#}")),
                        Err(err) => Err(format!("Dependency unpack failed: {err}")),
                    }
                } else {
                    Ok(())
                }
            }
            Err(message) => {
                let partial = download_path.clone();
                tokio::task::spawn_blocking(move || fsutil::remove_path(&partial))
                    .await
                    .ok();
                Err(message)
            }
        }
    }

    async fn launch(&mut self) -> Result<(), String> {
        // The record is durable before the externally visible container
        // start, so a crash in between resumes instead of double-counting.
        self.save_state().await;

        let mut binds = vec![BindMount {
            host: self.record.working_dir.clone(),
            container: CONTAINER_WORKING_DIR.to_string(),
            read_only: false,
        }];
        for dep in &self.record.bundle.dependencies {
            let key = DependencyKey::new(&dep.parent_uuid, &dep.parent_path);
            let host = self
                .ctx
                .deps
                .ready_path(&key)
                .ok_or_else(|| format!("Dependency {} vanished before launch", dep.child_path))?;
            let container =
                fsutil::resolve_subpath(Path::new(CONTAINER_WORKING_DIR), &dep.child_path)
                    .map_err(|err| format!("Invalid dependency mount: {err}"))?;
            binds.push(BindMount {
                host,
                container: container.to_string_lossy().into_owned(),
                read_only: true,
            });
        }

        let spec = ContainerSpec {
            image: self.record.bundle.docker_image.clone(),
            command: self.record.bundle.command.clone(),
            working_dir: CONTAINER_WORKING_DIR.to_string(),
            binds,
            cpuset: self.record.cpuset.clone(),
            gpus: self.record.gpuset.clone(),
            memory_bytes: self.record.resources.request_memory_bytes,
            network: self.ctx.network_for(&self.record.resources),
        };

        let id = self
            .ctx
            .runtime
            .start_container(&spec)
            .await
            .map_err(|err| format!("Container launch failed: {err}"))?;
        self.record.container_id = Some(id);
        self.record.started_at = Some(chrono::Utc::now().timestamp());
        self.set_stage(RunStage::Running).await;
        self.save_state().await;
        Ok(())
    }

    async fn monitor(&mut self) -> Result<(), String> {
        let container_id = self
            .record
            .container_id
            .clone()
            .ok_or_else(|| "Run record has no container".to_string())?;
        if self.record.started_at.is_none() {
            self.record.started_at = Some(chrono::Utc::now().timestamp());
        }

        let mut kill_rx = self.kill.subscribe();
        let mut delay = POLL_START;
        let mut iteration: u32 = 0;
        let mut stop_sent = false;
        let mut last_report = Instant::now();

        loop {
            iteration = iteration.wrapping_add(1);

            if self.kill.is_killed() && !stop_sent {
                stop_sent = true;
                if let Err(err) = self
                    .ctx
                    .runtime
                    .stop_container(&container_id, self.ctx.grace_period)
                    .await
                {
                    log::debug!("graceful stop of {container_id} failed: {err}");
                }
            }

            match self.ctx.runtime.container_status(&container_id).await {
                Ok(ContainerStatus::Running) => {}
                Ok(ContainerStatus::Exited {
                    exit_code,
                    oom_killed,
                }) => {
                    self.exit_code = exit_code;
                    self.oom_killed = oom_killed;
                    self.tail_once(&container_id).await;
                    self.sample_usage(&container_id, true).await;
                    self.store_record();
                    self.save_state().await;
                    return Ok(());
                }
                Ok(ContainerStatus::Missing) => {
                    return Err("Container disappeared unexpectedly".to_string());
                }
                Err(RuntimeError::ContainerMissing(_)) => {
                    return Err("Container disappeared unexpectedly".to_string());
                }
                Err(err) if err.is_transient() => {
                    log::debug!("container status poll failed, will retry: {err}");
                }
                Err(err) => return Err(format!("Container runtime error: {err}")),
            }

            if self.tail_once(&container_id).await {
                delay = POLL_START;
            }
            self.sample_usage(&container_id, iteration % DISK_SAMPLE_EVERY == 0)
                .await;
            self.enforce_limits();
            self.store_record();
            self.save_state().await;

            if last_report.elapsed() >= METADATA_REPORT_INTERVAL {
                last_report = Instant::now();
                let update = RunMetadataUpdate {
                    run_status: Some(RunStage::Running.status_str().to_string()),
                    time: Some(self.record.usage.time_seconds),
                    memory: Some(self.record.usage.memory_max_bytes),
                    data_size: Some(self.record.usage.disk_bytes),
                    ..Default::default()
                };
                if let Err(err) = self
                    .ctx
                    .service
                    .update_run_metadata(&self.record.uuid, &update)
                    .await
                {
                    log::debug!("metadata update failed for {}: {err}", self.record.uuid);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = kill_rx.changed() => {}
            }
            delay = Duration::from_secs_f64((delay.as_secs_f64() * POLL_GROWTH).min(POLL_CAP_SECS));
        }
    }

    /// Append output produced past the persisted offsets to the stdout and
    /// stderr files in the working directory. Returns whether anything new
    /// arrived.
    async fn tail_once(&mut self, container_id: &str) -> bool {
        let tail = match self
            .ctx
            .runtime
            .tail_output(
                container_id,
                self.record.stdout_offset,
                self.record.stderr_offset,
            )
            .await
        {
            Ok(tail) => tail,
            Err(err) => {
                log::debug!("log tail failed for {container_id}: {err}");
                return false;
            }
        };

        let mut produced = false;
        if !tail.stdout.is_empty() {
            produced = true;
            self.append_output("stdout", &tail.stdout).await;
            self.record.stdout_offset += tail.stdout.len() as u64;
        }
        if !tail.stderr.is_empty() {
            produced = true;
            self.append_output("stderr", &tail.stderr).await;
            self.record.stderr_offset += tail.stderr.len() as u64;
        }
        produced
    }

    async fn append_output(&self, name: &str, data: &[u8]) {
        let path = self.record.working_dir.join(name);
        let res = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            file.write_all(data).await?;
            file.flush().await
        }
        .await;
        if let Err(err) = res {
            log::warn!("failed to append {name} for {}: {err}", self.record.uuid);
        }
    }

    async fn sample_usage(&mut self, container_id: &str, sample_disk: bool) {
        if let Some(started_at) = self.record.started_at {
            let elapsed = chrono::Utc::now().timestamp() - started_at;
            self.record.usage.time_seconds = u64::try_from(elapsed).unwrap_or(0);
        }

        match self.ctx.runtime.container_stats(container_id).await {
            Ok(sample) => {
                self.record.usage.memory_max_bytes =
                    self.record.usage.memory_max_bytes.max(sample.memory_bytes);
            }
            Err(err) => log::debug!("stats sample failed for {container_id}: {err}"),
        }

        if sample_disk {
            let dir = self.record.working_dir.clone();
            if let Ok(size) = tokio::task::spawn_blocking(move || fsutil::path_size(&dir)).await {
                self.record.usage.disk_bytes = size;
            }
        }
    }

    fn enforce_limits(&self) {
        let resources = &self.record.resources;
        let usage = &self.record.usage;
        if resources.request_time_seconds > 0 && usage.time_seconds > resources.request_time_seconds
        {
            self.kill.kill("Time limit exceeded");
        }
        if resources.request_memory_bytes > 0
            && usage.memory_max_bytes > resources.request_memory_bytes
        {
            self.kill.kill("Memory limit exceeded");
        }
        if resources.request_disk_bytes > 0 && usage.disk_bytes > resources.request_disk_bytes {
            self.kill.kill("Disk limit exceeded");
        }
    }

    async fn upload(&mut self) -> Result<(), String> {
        self.set_stage(RunStage::Uploading).await;

        let dir = self.record.working_dir.clone();
        if let Ok(size) = tokio::task::spawn_blocking(move || fsutil::path_size(&dir)).await {
            self.record.usage.disk_bytes = size;
            self.store_record();
        }

        let archive = output_archive_path(&self.record);
        {
            let src = self.record.working_dir.clone();
            let dest = archive.clone();
            let packed =
                tokio::task::spawn_blocking(move || fsutil::tar_gz_directory(&src, &dest)).await;
            match packed {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(format!("Upload failed: {err:#}")),
                Err(err) => return Err(format!("Upload failed: {err}")),
            }
        }

        let mut attempt: u32 = 0;
        let result = loop {
            match self
                .ctx
                .service
                .upload_run_output(&self.record.uuid, &archive)
                .await
            {
                Ok(()) => break Ok(()),
                Err(err) => {
                    attempt += 1;
                    if !err.is_transient() || attempt >= UPLOAD_ATTEMPTS {
                        break Err(format!("Upload failed: {err}"));
                    }
                    let backoff = Duration::from_secs(1 << (attempt - 1).min(4));
                    log::debug!(
                        "output upload failed for {} (attempt {attempt}): {err}; retrying in {}s",
                        self.record.uuid,
                        backoff.as_secs()
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        };

        tokio::task::spawn_blocking(move || fsutil::remove_path(&archive))
            .await
            .ok();
        result
    }

    /// Report the terminal state, release everything, and notify the
    /// worker. Local resources are released even when reporting fails.
    async fn finalize(mut self, failure: Option<String>) {
        let failure_message = failure.or_else(|| self.kill.reason()).or_else(|| {
            self.oom_killed
                .then(|| "Memory limit exceeded (out of memory)".to_string())
        });
        let final_stage = if failure_message.is_some() {
            RunStage::Failed
        } else {
            RunStage::Finished
        };

        self.set_stage(RunStage::Finalizing).await;

        let update = RunMetadataUpdate {
            run_status: Some(final_stage.status_str().to_string()),
            exitcode: self.exit_code,
            failure_message: failure_message.clone(),
            time: Some(self.record.usage.time_seconds),
            memory: Some(self.record.usage.memory_max_bytes),
            data_size: Some(self.record.usage.disk_bytes),
            ..Default::default()
        };
        let mut attempt: u32 = 0;
        loop {
            match self
                .ctx
                .service
                .update_run_metadata(&self.record.uuid, &update)
                .await
            {
                Ok(()) => break,
                Err(err) => {
                    attempt += 1;
                    if attempt >= FINAL_REPORT_ATTEMPTS {
                        log::warn!("completion report failed for {}: {err}", self.record.uuid);
                        break;
                    }
                    tokio::time::sleep(Duration::from_secs(1 << (attempt - 1).min(4))).await;
                }
            }
        }

        if let Some(container_id) = &self.record.container_id {
            if let Err(err) = self.ctx.runtime.remove_container(container_id).await {
                log::debug!("container cleanup failed for {container_id}: {err}");
            }
        }
        for dep in &self.record.bundle.dependencies {
            let key = DependencyKey::new(&dep.parent_uuid, &dep.parent_path);
            self.ctx.deps.release(&key, &self.record.uuid);
        }
        self.ctx
            .pool
            .release(&self.record.cpuset, &self.record.gpuset);

        self.record.stage = final_stage;
        self.store_record();
        let _ = self.ctx.events.send(WorkerEvent::RunStage {
            uuid: self.record.uuid.clone(),
            stage: final_stage,
        });
        let _ = self.ctx.finished_tx.send(RunOutcome {
            uuid: self.record.uuid.clone(),
            stage: final_stage,
            exit_code: self.exit_code,
            failure_message,
        });
    }
}

fn output_archive_path(record: &RunRecord) -> PathBuf {
    let name = format!("{}.tar.gz", record.uuid);
    match record.working_dir.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

/// Answer a read/netcat request whose run is unknown to this worker.
pub(crate) async fn read_run_missing(service: Arc<dyn BundleService>, socket_id: u64) {
    let socket = match service.open_socket(socket_id).await {
        Ok(socket) => socket,
        Err(err) => {
            log::debug!("cannot open requester socket {socket_id}: {err}");
            return;
        }
    };
    let header = serde_json::json!({
        "error_code": 404,
        "error_message": "Run not found on this worker",
    });
    if let Err(err) = socket.send_json(&header).await {
        log::debug!("requester socket {socket_id} reply failed: {err}");
    }
}

/// Stream a subpath of the run's working directory back to the requester.
/// Directories travel as gzipped tarballs. Failures are reported on the
/// socket and never fail the run.
pub(crate) async fn read(ctx: Arc<RunContext>, record: RunRecord, socket_id: u64, path: String) {
    let socket = match ctx.service.open_socket(socket_id).await {
        Ok(socket) => socket,
        Err(err) => {
            log::debug!("cannot open requester socket {socket_id}: {err}");
            return;
        }
    };

    let target = match fsutil::resolve_subpath(&record.working_dir, &path) {
        Ok(target) => target,
        Err(err) => {
            let header = serde_json::json!({"error_code": 400, "error_message": err.to_string()});
            let _ = socket.send_json(&header).await;
            return;
        }
    };
    let meta = match tokio::fs::metadata(&target).await {
        Ok(meta) => meta,
        Err(_) => {
            let header = serde_json::json!({
                "error_code": 404,
                "error_message": format!("no such path in run: {path}"),
            });
            let _ = socket.send_json(&header).await;
            return;
        }
    };

    if meta.is_dir() {
        let archive = record
            .working_dir
            .parent()
            .unwrap_or(Path::new("."))
            .join(format!("{}.read.{socket_id}.tar.gz", record.uuid));
        let src = target.clone();
        let dest = archive.clone();
        let packed =
            tokio::task::spawn_blocking(move || fsutil::tar_gz_directory(&src, &dest)).await;
        match packed {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let header =
                    serde_json::json!({"error_code": 500, "error_message": err.to_string()});
                let _ = socket.send_json(&header).await;
                return;
            }
            Err(err) => {
                log::debug!("read pack task failed: {err}");
                return;
            }
        }
        let header = serde_json::json!({"target_type": "directory"});
        if socket.send_json(&header).await.is_ok() {
            stream_file_to_socket(&*socket, &archive).await;
        }
        tokio::task::spawn_blocking(move || fsutil::remove_path(&archive))
            .await
            .ok();
    } else {
        let header = serde_json::json!({"target_type": "file", "size": meta.len()});
        if socket.send_json(&header).await.is_ok() {
            stream_file_to_socket(&*socket, &target).await;
        }
    }
}

async fn stream_file_to_socket(socket: &dyn crate::backend::RequesterSocket, path: &Path) {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(err) => {
            log::debug!("cannot open {} for read: {err}", path.display());
            return;
        }
    };
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        match file.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if socket.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                log::debug!("read of {} failed: {err}", path.display());
                break;
            }
        }
    }
}

/// Bridge the requester socket to a TCP connection into the run's
/// container, sending `message` first. The bridge stays up until either
/// side closes: the requester hanging up (`recv` resolving `None`) or the
/// container end reaching EOF.
pub(crate) async fn netcat(
    ctx: Arc<RunContext>,
    record: RunRecord,
    socket_id: u64,
    port: u16,
    message: String,
) {
    let socket = match ctx.service.open_socket(socket_id).await {
        Ok(socket) => socket,
        Err(err) => {
            log::debug!("cannot open requester socket {socket_id}: {err}");
            return;
        }
    };

    let error_header = |message: String| serde_json::json!({
        "error_code": 500,
        "error_message": message,
    });

    let Some(container_id) = record.container_id.clone() else {
        let _ = socket
            .send_json(&error_header("run has no container".to_string()))
            .await;
        return;
    };
    let network = ctx.network_for(&record.resources);
    let ip = match ctx.runtime.container_ip(&container_id, &network).await {
        Ok(ip) => ip,
        Err(err) => {
            let _ = socket.send_json(&error_header(err.to_string())).await;
            return;
        }
    };

    let stream = match tokio::net::TcpStream::connect((ip.as_str(), port)).await {
        Ok(stream) => stream,
        Err(err) => {
            let _ = socket
                .send_json(&error_header(format!("connect {ip}:{port}: {err}")))
                .await;
            return;
        }
    };
    let (mut tcp_rx, mut tcp_tx) = stream.into_split();
    if !message.is_empty() && tcp_tx.write_all(message.as_bytes()).await.is_err() {
        return;
    }

    // Each direction is one persistent loop; an in-flight `recv` is never
    // dropped just because the container produced output. Whichever side
    // finishes first tears the bridge down.
    let to_requester = async {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match tcp_rx.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if socket.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                        break;
                    }
                }
            }
        }
    };
    let to_container = async {
        loop {
            match socket.recv().await {
                Ok(Some(data)) => {
                    if tcp_tx.write_all(&data).await.is_err() {
                        break;
                    }
                }
                Ok(None) | Err(_) => {
                    let _ = tcp_tx.shutdown().await;
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = to_requester => {}
        _ = to_container => {}
    }
}

/// Write a small control file under the run's working directory.
pub(crate) async fn write_file(
    record: &RunRecord,
    subpath: &str,
    contents: &str,
) -> anyhow::Result<()> {
    let target = fsutil::resolve_subpath(&record.working_dir, subpath)?;
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(target, contents).await?;
    Ok(())
}
