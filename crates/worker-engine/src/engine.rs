use std::collections::HashMap;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;

use crate::api::{
    RunSnapshot, StatusSnapshot, WorkerConfig, WorkerEvent, WorkerExit, WorkerHandle,
};
use crate::backend::{
    BundleAssignment, BundleService, CheckinRequest, HttpBundleService, RequestedResources,
    ServerMessage, ServiceError, VERSION,
};
use crate::deps::{DependencyCache, DependencyKey};
use crate::docker::DockerRuntime;
use crate::fsutil::{self, Progress};
use crate::images::ImageCache;
use crate::pool::ResourcePool;
use crate::run::{self, KillFlag, RunContext, RunRecord};
use crate::runtime::ContainerRuntime;
use crate::state::StateStore;

pub(crate) struct WorkerInner {
    pub(crate) event_tx: broadcast::Sender<WorkerEvent>,
    pub(crate) snapshot_rx: watch::Receiver<StatusSnapshot>,
    exiting: AtomicBool,
    should_upgrade: AtomicBool,
    notify: tokio::sync::Notify,
}

impl WorkerInner {
    pub(crate) fn request_drain(&self) {
        if !self.exiting.swap(true, Ordering::SeqCst) {
            let _ = self.event_tx.send(WorkerEvent::DrainRequested);
            self.notify.notify_waiters();
        }
    }

    fn is_draining(&self) -> bool {
        self.exiting.load(Ordering::SeqCst)
    }

    fn set_upgrade(&self) {
        self.should_upgrade.store(true, Ordering::SeqCst);
    }

    fn should_upgrade(&self) -> bool {
        self.should_upgrade.load(Ordering::SeqCst)
    }
}

fn initial_snapshot(cfg: &WorkerConfig) -> StatusSnapshot {
    let gpus = cfg.gpus.as_ref().map(Vec::len).unwrap_or(0);
    StatusSnapshot {
        draining: false,
        cpus_free: cfg.cpus.len(),
        cpus_total: cfg.cpus.len(),
        gpus_free: gpus,
        gpus_total: gpus,
        runs: Vec::new(),
    }
}

fn make_handle(
    cfg: &WorkerConfig,
) -> (Arc<WorkerInner>, watch::Sender<StatusSnapshot>) {
    let (event_tx, _) = broadcast::channel::<WorkerEvent>(1024);
    let (snapshot_tx, snapshot_rx) = watch::channel(initial_snapshot(cfg));
    let inner = Arc::new(WorkerInner {
        event_tx,
        snapshot_rx,
        exiting: AtomicBool::new(false),
        should_upgrade: AtomicBool::new(false),
        notify: tokio::sync::Notify::new(),
    });
    (inner, snapshot_tx)
}

pub(crate) fn start_worker(cfg: WorkerConfig) -> WorkerHandle {
    let (inner, snapshot_tx) = make_handle(&cfg);

    let join = tokio::spawn({
        let inner = inner.clone();
        async move {
            let service: Arc<dyn BundleService> =
                match HttpBundleService::new(cfg.server_url.clone()) {
                    Ok(service) => Arc::new(service),
                    Err(err) => {
                        let _ = inner.event_tx.send(WorkerEvent::Error {
                            message: format!("build http client: {err:#}"),
                        });
                        let _ = inner.event_tx.send(WorkerEvent::Stopped);
                        return Err(err);
                    }
                };
            let runtime: Arc<dyn ContainerRuntime> = match DockerRuntime::connect() {
                Ok(runtime) => Arc::new(runtime),
                Err(err) => {
                    let _ = inner.event_tx.send(WorkerEvent::Error {
                        message: format!("{err:#}"),
                    });
                    let _ = inner.event_tx.send(WorkerEvent::Stopped);
                    return Err(err);
                }
            };
            run_worker_supervised(inner, snapshot_tx, cfg, service, runtime).await
        }
    });
    WorkerHandle { inner, join }
}

/// Start the worker with injected collaborators.
#[cfg(test)]
pub(crate) fn start_worker_with(
    cfg: WorkerConfig,
    service: Arc<dyn BundleService>,
    runtime: Arc<dyn ContainerRuntime>,
) -> WorkerHandle {
    let (inner, snapshot_tx) = make_handle(&cfg);
    let join = tokio::spawn(run_worker_supervised(
        inner.clone(),
        snapshot_tx,
        cfg,
        service,
        runtime,
    ));
    WorkerHandle { inner, join }
}

async fn run_worker_supervised(
    inner: Arc<WorkerInner>,
    snapshot_tx: watch::Sender<StatusSnapshot>,
    cfg: WorkerConfig,
    service: Arc<dyn BundleService>,
    runtime: Arc<dyn ContainerRuntime>,
) -> anyhow::Result<WorkerExit> {
    let result = run_worker(inner.clone(), snapshot_tx, cfg, service, runtime).await;
    if let Err(err) = &result {
        let _ = inner.event_tx.send(WorkerEvent::Error {
            message: format!("worker error: {err:#}"),
        });
    }
    let _ = inner.event_tx.send(WorkerEvent::Stopped);
    result
}

async fn run_worker(
    inner: Arc<WorkerInner>,
    snapshot_tx: watch::Sender<StatusSnapshot>,
    cfg: WorkerConfig,
    service: Arc<dyn BundleService>,
    runtime: Arc<dyn ContainerRuntime>,
) -> anyhow::Result<WorkerExit> {
    tokio::fs::create_dir_all(cfg.work_dir.join("runs")).await?;

    let network_ext = format!("{}_ext", cfg.network_prefix);
    let network_int = format!("{}_int", cfg.network_prefix);
    runtime
        .ensure_network(&network_ext, false)
        .await
        .map_err(|err| anyhow::anyhow!("create network {network_ext}: {err}"))?;
    runtime
        .ensure_network(&network_int, true)
        .await
        .map_err(|err| anyhow::anyhow!("create network {network_int}: {err}"))?;

    let gpus = match &cfg.gpus {
        Some(gpus) => gpus.clone(),
        None => match runtime.gpu_inventory().await {
            Ok(gpus) => gpus,
            Err(err) => {
                let _ = inner.event_tx.send(WorkerEvent::Warning {
                    message: format!("gpu detection failed, assuming none: {err}"),
                });
                Vec::new()
            }
        },
    };

    let pool = Arc::new(ResourcePool::new(
        cfg.cpus.iter().copied(),
        gpus.iter().copied(),
    ));
    let deps = Arc::new(DependencyCache::open(
        &cfg.work_dir,
        cfg.dependency_quota_bytes,
    )?);
    let images = Arc::new(ImageCache::new(runtime.clone(), cfg.image_quota_bytes));
    let state = Arc::new(StateStore::open(&cfg.work_dir)?);

    let (finished_tx, finished_rx) = mpsc::unbounded_channel();
    let ctx = Arc::new(RunContext {
        service: service.clone(),
        runtime: runtime.clone(),
        images: images.clone(),
        deps: deps.clone(),
        pool: pool.clone(),
        state: state.clone(),
        events: inner.event_tx.clone(),
        finished_tx,
        grace_period: cfg.grace_period,
        network_ext,
        network_int,
    });

    let code_dir = cfg.code_dir.clone();
    let cleanup_interval = cfg.cleanup_interval;

    let mut rt = WorkerRuntime {
        cfg,
        inner: inner.clone(),
        snapshot_tx,
        ctx,
        service: service.clone(),
        pool,
        deps: deps.clone(),
        state,
        live: HashMap::new(),
        run_join: JoinSet::new(),
        oob_join: JoinSet::new(),
        finished_rx,
        checkin_task: None,
        checkin_backoff: None,
        last_checkin_successful: false,
    };

    // Resume before the first check-in, so advertised capacity already
    // accounts for cores owned by still-running containers.
    rt.resume_previous_runs();
    rt.save_state().await;

    let deps_cleanup = tokio::spawn({
        let deps = deps.clone();
        async move { deps.run_cleanup(cleanup_interval).await }
    });
    let images_cleanup = rt.cfg.image_quota_bytes.is_some().then(|| {
        tokio::spawn({
            let images = images.clone();
            async move { images.run_cleanup(cleanup_interval).await }
        })
    });

    rt.run().await;

    if let Err(err) = service.check_out(&rt.cfg.identity.id).await {
        let _ = inner.event_tx.send(WorkerEvent::Warning {
            message: format!("checkout failed: {err}"),
        });
    }
    rt.save_state().await;
    rt.push_snapshot();

    deps_cleanup.abort();
    if let Some(task) = images_cleanup {
        task.abort();
    }

    if inner.should_upgrade() {
        self_upgrade(service.as_ref(), &code_dir).await;
        Ok(WorkerExit::Upgrade)
    } else {
        Ok(WorkerExit::Clean)
    }
}

struct WorkerRuntime {
    cfg: WorkerConfig,
    inner: Arc<WorkerInner>,
    snapshot_tx: watch::Sender<StatusSnapshot>,
    ctx: Arc<RunContext>,
    service: Arc<dyn BundleService>,
    pool: Arc<ResourcePool>,
    deps: Arc<DependencyCache>,
    state: Arc<StateStore>,

    live: HashMap<String, Arc<KillFlag>>,
    run_join: JoinSet<()>,
    oob_join: JoinSet<()>,
    finished_rx: mpsc::UnboundedReceiver<crate::api::RunOutcome>,

    checkin_task: Option<tokio::task::JoinHandle<Result<Option<ServerMessage>, ServiceError>>>,
    checkin_backoff: Option<Pin<Box<tokio::time::Sleep>>>,
    last_checkin_successful: bool,
}

impl WorkerRuntime {
    async fn run(&mut self) {
        let _ = self.inner.event_tx.send(WorkerEvent::Started);
        self.push_snapshot();

        loop {
            if self.inner.is_draining() && self.live.is_empty() {
                if let Some(task) = self.checkin_task.take() {
                    task.abort();
                }
                self.checkin_backoff = None;
                break;
            }

            self.maybe_start_checkin();

            tokio::select! {
                res = async {
                    match self.checkin_task.as_mut() {
                        Some(task) => task.await,
                        None => std::future::pending::<Result<Result<Option<ServerMessage>, ServiceError>, tokio::task::JoinError>>().await,
                    }
                } => {
                    self.checkin_task = None;
                    self.handle_checkin_result(res).await;
                }
                outcome_opt = self.finished_rx.recv() => {
                    if let Some(outcome) = outcome_opt {
                        self.handle_run_finished(outcome).await;
                    }
                }
                _ = self.inner.notify.notified() => {}
                _ = async {
                    match self.checkin_backoff.as_mut() {
                        Some(sleep) => sleep.as_mut().await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    self.checkin_backoff = None;
                }
                res_opt = self.run_join.join_next(), if !self.run_join.is_empty() => {
                    if let Some(Err(err)) = res_opt {
                        let _ = self.inner.event_tx.send(WorkerEvent::Error {
                            message: format!("run task failed: {err}"),
                        });
                    }
                }
                res_opt = self.oob_join.join_next(), if !self.oob_join.is_empty() => {
                    if let Some(Err(err)) = res_opt {
                        log::debug!("out-of-band task failed: {err}");
                    }
                }
            }

            self.push_snapshot();
        }
    }

    fn maybe_start_checkin(&mut self) {
        if self.checkin_task.is_some() || self.checkin_backoff.is_some() {
            return;
        }
        let service = self.service.clone();
        let worker_id = self.cfg.identity.id.clone();
        let request = self.build_checkin_request();
        self.checkin_task = Some(tokio::spawn(async move {
            service.check_in(&worker_id, &request).await
        }));
    }

    fn build_checkin_request(&self) -> CheckinRequest {
        let allocated: u64 = self
            .state
            .map_runs(|record| record.resources.request_memory_bytes)
            .into_iter()
            .sum();
        CheckinRequest {
            version: VERSION,
            will_upgrade: self.inner.should_upgrade(),
            tag: self.cfg.identity.tag.clone(),
            cpus: self.pool.cpus_total(),
            gpus: self.pool.gpus_total(),
            memory_bytes: self.cfg.memory_bytes.saturating_sub(allocated),
            dependencies: self.deps.ready_deps(),
        }
    }

    async fn handle_checkin_result(
        &mut self,
        res: Result<Result<Option<ServerMessage>, ServiceError>, tokio::task::JoinError>,
    ) {
        match res {
            Ok(Ok(message)) => {
                if !self.last_checkin_successful {
                    self.last_checkin_successful = true;
                    let _ = self.inner.event_tx.send(WorkerEvent::Info {
                        message: "Connected! Successful check in.".to_string(),
                    });
                }
                if let Some(message) = message {
                    self.dispatch(message).await;
                }
                self.save_state().await;
            }
            Ok(Err(err)) => {
                if self.last_checkin_successful {
                    let _ = self.inner.event_tx.send(WorkerEvent::Warning {
                        message: format!("check-in failed, retrying: {err}"),
                    });
                } else {
                    log::debug!("check-in failed: {err}");
                }
                self.last_checkin_successful = false;
                self.checkin_backoff =
                    Some(Box::pin(tokio::time::sleep(self.cfg.checkin_retry)));
            }
            Err(err) => {
                log::debug!("check-in task join error: {err}");
                self.last_checkin_successful = false;
                self.checkin_backoff =
                    Some(Box::pin(tokio::time::sleep(self.cfg.checkin_retry)));
            }
        }
    }

    async fn dispatch(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Run { bundle, resources } => {
                self.handle_run(bundle, resources).await;
            }
            ServerMessage::Read {
                socket_id,
                uuid,
                path,
                read_args: _,
            } => match self.state.get(&uuid) {
                Some(record) => {
                    let ctx = self.ctx.clone();
                    self.oob_join.spawn(run::read(ctx, record, socket_id, path));
                }
                None => {
                    let service = self.service.clone();
                    self.oob_join.spawn(run::read_run_missing(service, socket_id));
                }
            },
            ServerMessage::Netcat {
                socket_id,
                uuid,
                port,
                message,
            } => match self.state.get(&uuid) {
                Some(record) => {
                    let ctx = self.ctx.clone();
                    self.oob_join
                        .spawn(run::netcat(ctx, record, socket_id, port, message));
                }
                None => {
                    let service = self.service.clone();
                    self.oob_join.spawn(run::read_run_missing(service, socket_id));
                }
            },
            ServerMessage::Write {
                uuid,
                subpath,
                string,
            } => {
                if let Some(record) = self.state.get(&uuid) {
                    self.oob_join.spawn(async move {
                        if let Err(err) = run::write_file(&record, &subpath, &string).await {
                            log::debug!("write to run {} failed: {err:#}", record.uuid);
                        }
                    });
                }
            }
            ServerMessage::Kill { uuid } => {
                if let Some(kill) = self.live.get(&uuid) {
                    kill.kill("Kill requested");
                }
            }
            ServerMessage::Upgrade => {
                self.inner.set_upgrade();
                let _ = self.inner.event_tx.send(WorkerEvent::UpgradeRequested);
                self.inner.request_drain();
            }
        }
    }

    async fn handle_run(&mut self, bundle: BundleAssignment, resources: RequestedResources) {
        if self.inner.is_draining() {
            log::debug!("draining, declining run {}", bundle.uuid);
            return;
        }
        if self.live.contains_key(&bundle.uuid) {
            log::debug!("already executing run {}", bundle.uuid);
            return;
        }

        let allocated: u64 = self
            .state
            .map_runs(|record| record.resources.request_memory_bytes)
            .into_iter()
            .sum();
        if allocated + resources.request_memory_bytes > self.cfg.memory_bytes {
            log::debug!("insufficient memory for run {}", bundle.uuid);
            return;
        }
        let Some((cpuset, gpuset)) = self
            .pool
            .try_allocate(resources.request_cpus, resources.request_gpus)
        else {
            log::debug!(
                "unsuccessful allocation of cpu and gpu sets for run {}",
                bundle.uuid
            );
            return;
        };

        let working_dir = self.cfg.work_dir.join("runs").join(&bundle.uuid);
        let record = RunRecord::new(bundle, resources, working_dir, cpuset, gpuset);
        let uuid = record.uuid.clone();

        // Durable before any externally visible side effect.
        self.state.add_run(record.clone());
        self.save_state().await;

        let kill = Arc::new(KillFlag::new());
        self.live.insert(uuid.clone(), kill.clone());
        self.run_join.spawn(run::drive(self.ctx.clone(), kill, record));
        let _ = self.inner.event_tx.send(WorkerEvent::RunAssigned { uuid });
    }

    async fn handle_run_finished(&mut self, outcome: crate::api::RunOutcome) {
        self.live.remove(&outcome.uuid);
        self.state.finish_run(&outcome.uuid);
        self.save_state().await;
        let _ = self
            .inner
            .event_tx
            .send(WorkerEvent::RunFinished { outcome });
    }

    fn resume_previous_runs(&mut self) {
        for record in self.state.load_previous_runs() {
            if record.stage.is_terminal() {
                self.state.finish_run(&record.uuid);
                continue;
            }

            self.pool.adopt(&record.cpuset, &record.gpuset);
            for dep in &record.bundle.dependencies {
                let key = DependencyKey::new(&dep.parent_uuid, &dep.parent_path);
                self.deps.readopt(&key, &record.uuid);
            }

            let kill = Arc::new(KillFlag::new());
            self.live.insert(record.uuid.clone(), kill.clone());
            let _ = self.inner.event_tx.send(WorkerEvent::Info {
                message: format!("resuming run {}", record.uuid),
            });
            self.run_join.spawn(run::drive(self.ctx.clone(), kill, record));
        }
    }

    async fn save_state(&self) {
        if let Err(err) = self.state.save().await {
            log::warn!("state save failed: {err:#}");
        }
    }

    fn push_snapshot(&self) {
        let runs = self.state.map_runs(|record| RunSnapshot {
            uuid: record.uuid.clone(),
            stage: record.stage,
            command: record.bundle.command.clone(),
            usage: record.usage,
        });
        let snap = StatusSnapshot {
            draining: self.inner.is_draining(),
            cpus_free: self.pool.cpus_free(),
            cpus_total: self.pool.cpus_total(),
            gpus_free: self.pool.gpus_free(),
            gpus_total: self.pool.gpus_total(),
            runs,
        };
        let _ = self.snapshot_tx.send(snap);
    }
}

/// Replace the worker's own code directory with a fresh tarball from the
/// service. Retries forever: the worker has already drained and cannot
/// usefully revert.
async fn self_upgrade(service: &dyn BundleService, code_dir: &Path) {
    log::debug!("upgrading");
    loop {
        let attempt = async {
            let stream = service.get_code().await.map_err(anyhow::Error::from)?;

            let archive = code_dir.with_extension("new.tar.gz");
            let mut file = tokio::fs::File::create(&archive).await?;
            fsutil::copy_with_progress(stream, &mut file, |_| Progress::Continue).await?;
            drop(file);

            let code_dir = code_dir.to_path_buf();
            tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
                fsutil::remove_path(&code_dir);
                fsutil::un_tar_gz(&archive, &code_dir)?;
                fsutil::remove_path(&archive);
                Ok(())
            })
            .await??;
            Ok::<(), anyhow::Error>(())
        }
        .await;

        match attempt {
            Ok(()) => break,
            Err(err) => {
                log::warn!("upgrade failed, retrying: {err:#}");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::RunStage;
    use crate::backend::BundleDependency;
    use crate::testutil::{make_code_tarball, FakeBundleService, FakeContainerPlan, FakeRuntime};
    use bundle_worker_core::identity::WorkerIdentity;
    use bytes::Bytes;
    use std::collections::BTreeSet;
    use std::time::Instant;

    fn test_config(dir: &Path) -> WorkerConfig {
        WorkerConfig {
            server_url: reqwest::Url::parse("http://127.0.0.1:9/").unwrap(),
            identity: WorkerIdentity {
                id: "w-test".to_string(),
                tag: None,
            },
            work_dir: dir.join("work"),
            code_dir: dir.join("code"),
            cpus: vec![0, 1, 2, 3],
            gpus: Some(Vec::new()),
            memory_bytes: 16 << 30,
            dependency_quota_bytes: 1 << 30,
            image_quota_bytes: None,
            network_prefix: WorkerConfig::DEFAULT_NETWORK_PREFIX.to_string(),
            grace_period: Duration::from_secs(1),
            checkin_retry: Duration::from_millis(50),
            cleanup_interval: Duration::from_millis(200),
        }
    }

    fn run_message(uuid: &str, cpus: usize, deps: Vec<BundleDependency>) -> ServerMessage {
        ServerMessage::Run {
            bundle: BundleAssignment {
                uuid: uuid.to_string(),
                command: "echo hi".to_string(),
                dependencies: deps,
                docker_image: "ubuntu:22.04".to_string(),
                docker_image_digest: None,
            },
            resources: RequestedResources {
                request_cpus: cpus,
                ..Default::default()
            },
        }
    }

    async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        cond()
    }

    const LONG: Duration = Duration::from_secs(60);

    #[tokio::test(flavor = "multi_thread")]
    async fn happy_path_runs_reports_and_releases() {
        let dir = tempfile::tempdir().unwrap();
        let service = Arc::new(FakeBundleService::new());
        let runtime = Arc::new(FakeRuntime::new());
        service.push_message(run_message("0xrun1", 2, Vec::new()));

        let handle =
            start_worker_with(test_config(dir.path()), service.clone(), runtime.clone());

        assert!(
            wait_until(LONG, || service.uploads().contains(&"0xrun1".to_string())).await,
            "run output never uploaded"
        );
        assert!(
            wait_until(LONG, || {
                let snap = handle.snapshot();
                snap.runs.is_empty() && snap.cpus_free == 4
            })
            .await,
            "pool did not return to full capacity"
        );

        // Container stdout was tailed into the working directory.
        let stdout = std::fs::read(dir.path().join("work/runs/0xrun1/stdout")).unwrap();
        assert_eq!(stdout, b"hi\n");

        // Exactly one completion report.
        assert_eq!(service.status_report_count("0xrun1", "finished"), 1);
        assert_eq!(service.status_report_count("0xrun1", "failed"), 0);

        handle.request_drain();
        let exit = handle.wait().await.unwrap();
        assert_eq!(exit, WorkerExit::Clean);
        assert_eq!(service.checkout_count(), 1);

        // State file holds no live runs.
        let raw = std::fs::read_to_string(dir.path().join("work/state.json")).unwrap();
        let index: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(index["runs"].as_array().unwrap().len(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_runs_share_a_single_dependency_download() {
        let dir = tempfile::tempdir().unwrap();
        let service = Arc::new(FakeBundleService::new());
        let runtime = Arc::new(FakeRuntime::new());

        // Slow enough that all three runs overlap in staging.
        service.set_file_contents(
            "0xparent",
            "data",
            vec![Bytes::from(vec![7u8; 1024]); 20],
            Duration::from_millis(20),
        );
        let dep = BundleDependency {
            parent_uuid: "0xparent".to_string(),
            parent_path: "data".to_string(),
            child_path: "data".to_string(),
        };
        for uuid in ["0xr1", "0xr2", "0xr3"] {
            service.push_message(run_message(uuid, 1, vec![dep.clone()]));
        }

        let handle =
            start_worker_with(test_config(dir.path()), service.clone(), runtime.clone());

        assert!(
            wait_until(LONG, || service.uploads().len() == 3).await,
            "not all runs uploaded: {:?}",
            service.uploads()
        );
        assert_eq!(service.fetch_count("0xparent", "data"), 1);
        for uuid in ["0xr1", "0xr2", "0xr3"] {
            assert!(
                wait_until(LONG, || service.status_report_count(uuid, "finished") == 1).await,
                "run {uuid} never reported finished"
            );
        }

        // The shared entry is advertised on later check-ins.
        assert!(wait_until(LONG, || {
            service
                .last_checkin()
                .map(|req| {
                    req.dependencies.iter().any(|dep| {
                        dep.parent_uuid == "0xparent" && dep.parent_path == "data"
                    })
                })
                .unwrap_or(false)
        })
        .await);

        handle.request_drain();
        assert_eq!(handle.wait().await.unwrap(), WorkerExit::Clean);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resumed_run_rebinds_and_reports_once() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        std::fs::create_dir_all(cfg.work_dir.join("runs/0xres")).unwrap();

        // Persist a mid-RUNNING record the way a previous process would
        // have, with part of the output already tailed.
        {
            let store = StateStore::open(&cfg.work_dir).unwrap();
            let mut record = RunRecord::new(
                BundleAssignment {
                    uuid: "0xres".to_string(),
                    command: "echo resumed".to_string(),
                    dependencies: Vec::new(),
                    docker_image: "ubuntu:22.04".to_string(),
                    docker_image_digest: None,
                },
                RequestedResources {
                    request_cpus: 2,
                    ..Default::default()
                },
                cfg.work_dir.join("runs/0xres"),
                BTreeSet::from([0, 1]),
                BTreeSet::new(),
            );
            record.stage = RunStage::Running;
            record.container_id = Some("ctr-resumed".to_string());
            record.stdout_offset = 4;
            store.add_run(record);
            store.save().await.unwrap();
        }
        std::fs::write(cfg.work_dir.join("runs/0xres/stdout"), b"old ").unwrap();

        let service = Arc::new(FakeBundleService::new());
        let runtime = Arc::new(FakeRuntime::new());
        runtime.seed_container(
            "ctr-resumed",
            FakeContainerPlan {
                polls_until_exit: 1,
                exit_code: 0,
                stdout: b"old and new\n".to_vec(),
                stderr: Vec::new(),
            },
        );

        let handle = start_worker_with(cfg.clone(), service.clone(), runtime.clone());

        assert!(
            wait_until(LONG, || service.uploads().contains(&"0xres".to_string())).await,
            "resumed run never uploaded"
        );
        assert!(
            wait_until(LONG, || {
                service.status_report_count("0xres", "finished") == 1
            })
            .await,
            "resumed run never reported finished"
        );

        // Tail continued from the persisted offset: no duplicated bytes.
        let stdout = std::fs::read(cfg.work_dir.join("runs/0xres/stdout")).unwrap();
        assert_eq!(stdout, b"old and new\n");

        assert!(wait_until(LONG, || handle.snapshot().cpus_free == 4).await);
        handle.request_drain();
        assert_eq!(handle.wait().await.unwrap(), WorkerExit::Clean);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn kill_during_staging_aborts_download_and_releases() {
        let dir = tempfile::tempdir().unwrap();
        let service = Arc::new(FakeBundleService::new());
        let runtime = Arc::new(FakeRuntime::new());

        // A download that would take ~20s uninterrupted.
        service.set_file_contents(
            "0xparent",
            "big",
            vec![Bytes::from(vec![1u8; 4096]); 400],
            Duration::from_millis(50),
        );
        service.push_message(run_message(
            "0xkilled",
            1,
            vec![BundleDependency {
                parent_uuid: "0xparent".to_string(),
                parent_path: "big".to_string(),
                child_path: "big".to_string(),
            }],
        ));

        let handle =
            start_worker_with(test_config(dir.path()), service.clone(), runtime.clone());

        assert!(
            wait_until(LONG, || service.fetch_count("0xparent", "big") == 1).await,
            "download never started"
        );
        service.push_message(ServerMessage::Kill {
            uuid: "0xkilled".to_string(),
        });

        assert!(
            wait_until(LONG, || {
                service.failure_message("0xkilled").as_deref() == Some("Kill requested")
            })
            .await,
            "kill never reported"
        );
        assert_eq!(service.status_report_count("0xkilled", "failed"), 1);
        assert!(service.uploads().is_empty());
        assert_eq!(runtime.containers_started(), 0);

        // Resources released and the aborted entry is not advertised.
        assert!(wait_until(LONG, || {
            let snap = handle.snapshot();
            snap.runs.is_empty() && snap.cpus_free == 4
        })
        .await);
        assert!(wait_until(LONG, || {
            service
                .last_checkin()
                .map(|req| req.dependencies.is_empty())
                .unwrap_or(false)
        })
        .await);

        handle.request_drain();
        assert_eq!(handle.wait().await.unwrap(), WorkerExit::Clean);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn upgrade_drains_fetches_code_and_exits_123() {
        let dir = tempfile::tempdir().unwrap();
        let service = Arc::new(FakeBundleService::new());
        let runtime = Arc::new(FakeRuntime::new());

        service.set_code(make_code_tarball(&[("worker.bin", b"v2")]));
        service.push_message(run_message("0xlast", 1, Vec::new()));
        service.push_message(ServerMessage::Upgrade);
        // Dispatched after the upgrade: must be declined.
        service.push_message(run_message("0xlate", 1, Vec::new()));

        let handle =
            start_worker_with(test_config(dir.path()), service.clone(), runtime.clone());

        let exit = handle.wait().await.unwrap();
        assert_eq!(exit, WorkerExit::Upgrade);

        // The in-flight run finished; the late one never started.
        assert_eq!(service.uploads(), vec!["0xlast".to_string()]);
        assert_eq!(service.status_report_count("0xlate", "finished"), 0);
        assert_eq!(service.checkout_count(), 1);

        // New code is in place.
        let code = std::fs::read(dir.path().join("code/worker.bin")).unwrap();
        assert_eq!(code, b"v2");
    }
}
