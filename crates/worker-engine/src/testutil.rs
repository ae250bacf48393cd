//! Fake bundle service and container runtime used by engine tests.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;

use crate::backend::{
    BundleAssignment, BundleContentsKind, BundleService, CheckinRequest, RequestedResources,
    RequesterSocket, RunMetadataUpdate, ServerMessage, ServiceError,
};
use crate::fsutil::ByteStream;
use crate::run::RunRecord;
use crate::runtime::{
    ContainerRuntime, ContainerSpec, ContainerStatus, ImageInfo, OutputTail, ResourceSample,
    RuntimeError,
};

pub(crate) fn test_record(uuid: &str) -> RunRecord {
    RunRecord::new(
        BundleAssignment {
            uuid: uuid.to_string(),
            command: "echo hi".to_string(),
            dependencies: Vec::new(),
            docker_image: "ubuntu:22.04".to_string(),
            docker_image_digest: None,
        },
        RequestedResources {
            request_cpus: 1,
            ..Default::default()
        },
        PathBuf::from(format!("/nonexistent/runs/{uuid}")),
        BTreeSet::new(),
        BTreeSet::new(),
    )
}

/// Assemble a [`RunContext`](crate::run::RunContext) over the fakes for
/// driving run operations directly.
pub(crate) fn test_run_context(
    service: Arc<FakeBundleService>,
    runtime: Arc<FakeRuntime>,
    work_dir: &Path,
) -> Arc<crate::run::RunContext> {
    let (events, _) = tokio::sync::broadcast::channel(64);
    let (finished_tx, _finished_rx) = tokio::sync::mpsc::unbounded_channel();
    Arc::new(crate::run::RunContext {
        service,
        runtime: runtime.clone(),
        images: Arc::new(crate::images::ImageCache::new(runtime, None)),
        deps: Arc::new(crate::deps::DependencyCache::open(work_dir, 1 << 30).unwrap()),
        pool: Arc::new(crate::pool::ResourcePool::new(0..4, std::iter::empty())),
        state: Arc::new(crate::state::StateStore::open(work_dir).unwrap()),
        events,
        finished_tx,
        grace_period: Duration::from_secs(1),
        network_ext: "codalab_worker_network_ext".to_string(),
        network_int: "codalab_worker_network_int".to_string(),
    })
}

/// Build a small gzipped tarball in memory.
pub(crate) fn make_code_tarball(files: &[(&str, &[u8])]) -> Vec<u8> {
    let enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(enc);
    for (name, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *contents).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

struct FakeContents {
    kind: BundleContentsKind,
    chunks: Vec<Bytes>,
    chunk_delay: Duration,
}

#[derive(Default)]
struct ServiceLog {
    metadata: Vec<(String, serde_json::Value)>,
    uploads: Vec<String>,
    last_checkin: Option<CheckinRequest>,
}

/// In-memory [`BundleService`] recording everything the worker does.
pub(crate) struct FakeBundleService {
    messages: Mutex<VecDeque<ServerMessage>>,
    contents: Mutex<HashMap<(String, String), FakeContents>>,
    fetches: Mutex<HashMap<(String, String), usize>>,
    log: Mutex<ServiceLog>,
    checkins: AtomicUsize,
    checkouts: AtomicUsize,
    code: Mutex<Option<Vec<u8>>>,
    sockets: Mutex<HashMap<u64, Arc<FakeSocketState>>>,
}

impl FakeBundleService {
    pub(crate) fn new() -> Self {
        Self {
            messages: Mutex::new(VecDeque::new()),
            contents: Mutex::new(HashMap::new()),
            fetches: Mutex::new(HashMap::new()),
            log: Mutex::new(ServiceLog::default()),
            checkins: AtomicUsize::new(0),
            checkouts: AtomicUsize::new(0),
            code: Mutex::new(None),
            sockets: Mutex::new(HashMap::new()),
        }
    }

    /// Shared state of a requester socket, created on first use so tests
    /// can script it before (or after) the worker opens it.
    pub(crate) fn socket_state(&self, socket_id: u64) -> Arc<FakeSocketState> {
        self.sockets
            .lock()
            .unwrap()
            .entry(socket_id)
            .or_default()
            .clone()
    }

    pub(crate) fn push_message(&self, message: ServerMessage) {
        self.messages.lock().unwrap().push_back(message);
    }

    pub(crate) fn set_file_contents(
        &self,
        parent_uuid: &str,
        path: &str,
        chunks: Vec<Bytes>,
        chunk_delay: Duration,
    ) {
        self.contents.lock().unwrap().insert(
            (parent_uuid.to_string(), path.to_string()),
            FakeContents {
                kind: BundleContentsKind::File,
                chunks,
                chunk_delay,
            },
        );
    }

    pub(crate) fn set_code(&self, tarball: Vec<u8>) {
        *self.code.lock().unwrap() = Some(tarball);
    }

    pub(crate) fn fetch_count(&self, parent_uuid: &str, path: &str) -> usize {
        self.fetches
            .lock()
            .unwrap()
            .get(&(parent_uuid.to_string(), path.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn uploads(&self) -> Vec<String> {
        self.log.lock().unwrap().uploads.clone()
    }

    pub(crate) fn last_checkin(&self) -> Option<CheckinRequest> {
        self.log.lock().unwrap().last_checkin.clone()
    }

    pub(crate) fn checkout_count(&self) -> usize {
        self.checkouts.load(Ordering::SeqCst)
    }

    /// Number of metadata reports for `uuid` carrying the given
    /// `run_status`.
    pub(crate) fn status_report_count(&self, uuid: &str, status: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .metadata
            .iter()
            .filter(|(report_uuid, value)| {
                report_uuid == uuid && value["run_status"] == status
            })
            .count()
    }

    /// Last reported failure message for `uuid`, if any.
    pub(crate) fn failure_message(&self, uuid: &str) -> Option<String> {
        self.log
            .lock()
            .unwrap()
            .metadata
            .iter()
            .rev()
            .filter(|(report_uuid, _)| report_uuid == uuid)
            .find_map(|(_, value)| {
                value["failure_message"].as_str().map(str::to_string)
            })
    }
}

#[async_trait]
impl BundleService for FakeBundleService {
    async fn check_in(
        &self,
        _worker_id: &str,
        request: &CheckinRequest,
    ) -> Result<Option<ServerMessage>, ServiceError> {
        self.checkins.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().last_checkin = Some(request.clone());

        let message = self.messages.lock().unwrap().pop_front();
        if message.is_none() {
            // Stand-in for the server's long-poll hold.
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        Ok(message)
    }

    async fn check_out(&self, _worker_id: &str) -> Result<(), ServiceError> {
        self.checkouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_bundle_contents(
        &self,
        parent_uuid: &str,
        path: &str,
    ) -> Result<(BundleContentsKind, ByteStream), ServiceError> {
        let key = (parent_uuid.to_string(), path.to_string());
        *self.fetches.lock().unwrap().entry(key.clone()).or_insert(0) += 1;

        let contents = self.contents.lock().unwrap();
        let Some(found) = contents.get(&key) else {
            return Err(ServiceError::Status {
                status: 404,
                body: format!("no such bundle contents: {parent_uuid}/{path}"),
            });
        };

        let delay = found.chunk_delay;
        let chunks: Vec<std::io::Result<Bytes>> =
            found.chunks.iter().cloned().map(Ok).collect();
        let stream = futures::stream::iter(chunks)
            .then(move |chunk| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                chunk
            })
            .boxed();
        Ok((found.kind, stream))
    }

    async fn update_run_metadata(
        &self,
        uuid: &str,
        update: &RunMetadataUpdate,
    ) -> Result<(), ServiceError> {
        let value = serde_json::to_value(update)
            .map_err(|err| ServiceError::Invalid(err.to_string()))?;
        self.log
            .lock()
            .unwrap()
            .metadata
            .push((uuid.to_string(), value));
        Ok(())
    }

    async fn upload_run_output(&self, uuid: &str, archive: &Path) -> Result<(), ServiceError> {
        if !archive.exists() {
            return Err(ServiceError::Invalid(format!(
                "missing archive: {}",
                archive.display()
            )));
        }
        self.log.lock().unwrap().uploads.push(uuid.to_string());
        Ok(())
    }

    async fn open_socket(
        &self,
        socket_id: u64,
    ) -> Result<Box<dyn RequesterSocket>, ServiceError> {
        Ok(Box::new(FakeSocket {
            state: self.socket_state(socket_id),
        }))
    }

    async fn get_code(&self) -> Result<ByteStream, ServiceError> {
        let code = self.code.lock().unwrap().clone();
        let Some(code) = code else {
            return Err(ServiceError::Status {
                status: 404,
                body: "no code tarball configured".to_string(),
            });
        };
        let chunks: Vec<std::io::Result<Bytes>> = vec![Ok(Bytes::from(code))];
        Ok(futures::stream::iter(chunks).boxed())
    }
}

/// Scriptable requester-socket state shared between a test and the
/// [`FakeSocket`] the worker talks to.
#[derive(Default)]
pub(crate) struct FakeSocketState {
    sent: Mutex<Vec<Bytes>>,
    recv_script: Mutex<VecDeque<(Duration, Option<Bytes>)>>,
}

impl FakeSocketState {
    /// Script the next `recv` resolution: after `delay`, yield `item`
    /// (`None` = the requester hangs up).
    pub(crate) fn push_recv(&self, delay: Duration, item: Option<Bytes>) {
        self.recv_script.lock().unwrap().push_back((delay, item));
    }

    pub(crate) fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub(crate) fn sent_bytes(&self) -> Vec<u8> {
        let sent = self.sent.lock().unwrap();
        sent.iter().flat_map(|chunk| chunk.iter().copied()).collect()
    }
}

struct FakeSocket {
    state: Arc<FakeSocketState>,
}

#[async_trait]
impl RequesterSocket for FakeSocket {
    async fn send(&self, data: Bytes) -> Result<(), ServiceError> {
        self.state.sent.lock().unwrap().push(data);
        Ok(())
    }

    async fn recv(&self) -> Result<Option<Bytes>, ServiceError> {
        // Peek-sleep-pop so a cancelled call leaves the script intact.
        let delay = {
            let script = self.state.recv_script.lock().unwrap();
            script.front().map(|(delay, _)| *delay)
        };
        match delay {
            Some(delay) => {
                tokio::time::sleep(delay).await;
                let item = self.state.recv_script.lock().unwrap().pop_front();
                Ok(item.and_then(|(_, item)| item))
            }
            None => {
                // Nothing scripted: the requester stays quiet.
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(None)
            }
        }
    }
}

/// Scripted behavior of the next started fake container.
#[derive(Debug, Clone)]
pub(crate) struct FakeContainerPlan {
    /// Status polls answered `Running` before the container exits.
    pub(crate) polls_until_exit: u32,
    pub(crate) exit_code: i64,
    pub(crate) stdout: Vec<u8>,
    pub(crate) stderr: Vec<u8>,
}

impl Default for FakeContainerPlan {
    fn default() -> Self {
        Self {
            polls_until_exit: 1,
            exit_code: 0,
            stdout: b"hi\n".to_vec(),
            stderr: Vec::new(),
        }
    }
}

struct FakeContainer {
    plan: FakeContainerPlan,
    polls: u32,
    stopped: bool,
}

/// In-memory [`ContainerRuntime`].
pub(crate) struct FakeRuntime {
    images: Mutex<HashMap<String, u64>>,
    protected: Mutex<HashSet<String>>,
    pulls: AtomicUsize,
    containers: Mutex<HashMap<String, FakeContainer>>,
    started: AtomicUsize,
    next_plan: Mutex<FakeContainerPlan>,
    specs: Mutex<Vec<ContainerSpec>>,
}

impl FakeRuntime {
    pub(crate) fn new() -> Self {
        Self {
            images: Mutex::new(HashMap::new()),
            protected: Mutex::new(HashSet::new()),
            pulls: AtomicUsize::new(0),
            containers: Mutex::new(HashMap::new()),
            started: AtomicUsize::new(0),
            next_plan: Mutex::new(FakeContainerPlan::default()),
            specs: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn pull_count(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    pub(crate) fn containers_started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub(crate) fn seed_image(&self, reference: &str, size_bytes: u64) {
        self.images
            .lock()
            .unwrap()
            .insert(reference.to_string(), size_bytes);
    }

    pub(crate) fn protect_image(&self, reference: &str) {
        self.protected.lock().unwrap().insert(reference.to_string());
    }

    /// Register an already-running container, as left behind by a previous
    /// worker process.
    pub(crate) fn seed_container(&self, id: &str, plan: FakeContainerPlan) {
        self.containers.lock().unwrap().insert(
            id.to_string(),
            FakeContainer {
                plan,
                polls: 0,
                stopped: false,
            },
        );
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ensure_network(&self, _name: &str, _internal: bool) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn pull_image(&self, reference: &str) -> Result<(), RuntimeError> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        self.seed_image(reference, 1000);
        Ok(())
    }

    async fn list_images(&self) -> Result<Vec<ImageInfo>, RuntimeError> {
        let mut images: Vec<ImageInfo> = self
            .images
            .lock()
            .unwrap()
            .iter()
            .map(|(reference, size)| ImageInfo {
                reference: reference.clone(),
                size_bytes: *size,
            })
            .collect();
        images.sort_by(|a, b| a.reference.cmp(&b.reference));
        Ok(images)
    }

    async fn remove_image(&self, reference: &str) -> Result<(), RuntimeError> {
        if self.protected.lock().unwrap().contains(reference) {
            return Err(RuntimeError::Permanent(anyhow::anyhow!(
                "image {reference} is in use"
            )));
        }
        self.images.lock().unwrap().remove(reference);
        Ok(())
    }

    async fn image_present(
        &self,
        reference: &str,
        _digest: Option<&str>,
    ) -> Result<bool, RuntimeError> {
        Ok(self.images.lock().unwrap().contains_key(reference))
    }

    async fn start_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let n = self.started.fetch_add(1, Ordering::SeqCst);
        let id = format!("fake-{n}");
        let plan = self.next_plan.lock().unwrap().clone();
        self.containers.lock().unwrap().insert(
            id.clone(),
            FakeContainer {
                plan,
                polls: 0,
                stopped: false,
            },
        );
        self.specs.lock().unwrap().push(spec.clone());
        Ok(id)
    }

    async fn container_status(&self, id: &str) -> Result<ContainerStatus, RuntimeError> {
        let mut containers = self.containers.lock().unwrap();
        let Some(container) = containers.get_mut(id) else {
            return Ok(ContainerStatus::Missing);
        };
        if container.stopped {
            return Ok(ContainerStatus::Exited {
                exit_code: Some(137),
                oom_killed: false,
            });
        }
        container.polls += 1;
        if container.polls > container.plan.polls_until_exit {
            return Ok(ContainerStatus::Exited {
                exit_code: Some(container.plan.exit_code),
                oom_killed: false,
            });
        }
        Ok(ContainerStatus::Running)
    }

    async fn tail_output(
        &self,
        id: &str,
        stdout_offset: u64,
        stderr_offset: u64,
    ) -> Result<OutputTail, RuntimeError> {
        let containers = self.containers.lock().unwrap();
        let Some(container) = containers.get(id) else {
            return Err(RuntimeError::ContainerMissing(id.to_string()));
        };
        let slice = |full: &[u8], offset: u64| {
            let skip = (offset as usize).min(full.len());
            Bytes::copy_from_slice(&full[skip..])
        };
        Ok(OutputTail {
            stdout: slice(&container.plan.stdout, stdout_offset),
            stderr: slice(&container.plan.stderr, stderr_offset),
        })
    }

    async fn container_stats(&self, _id: &str) -> Result<ResourceSample, RuntimeError> {
        Ok(ResourceSample { memory_bytes: 1000 })
    }

    async fn stop_container(&self, id: &str, _grace: Duration) -> Result<(), RuntimeError> {
        if let Some(container) = self.containers.lock().unwrap().get_mut(id) {
            container.stopped = true;
        }
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.containers.lock().unwrap().remove(id);
        Ok(())
    }

    async fn container_ip(&self, _id: &str, _network: &str) -> Result<String, RuntimeError> {
        Ok("127.0.0.1".to_string())
    }

    async fn gpu_inventory(&self) -> Result<Vec<u32>, RuntimeError> {
        Ok(Vec::new())
    }
}
