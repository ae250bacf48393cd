use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;

use crate::fsutil::ByteStream;

/// Control protocol version, bumped on wire changes.
pub(crate) const VERSION: u32 = 18;

/// Failure talking to the bundle service.
#[derive(Debug, thiserror::Error)]
pub(crate) enum ServiceError {
    #[error("http {status}: {body}")]
    Status { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid response: {0}")]
    Invalid(String),
}

impl ServiceError {
    pub(crate) fn is_transient(&self) -> bool {
        match self {
            ServiceError::Transport(_) => true,
            ServiceError::Status { status, .. } => *status >= 500,
            ServiceError::Invalid(_) => false,
        }
    }
}

/// One declared dependency of a bundle: mount `parent_path` of bundle
/// `parent_uuid` at `child_path` inside the run's working directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct BundleDependency {
    pub(crate) parent_uuid: String,
    #[serde(default)]
    pub(crate) parent_path: String,
    pub(crate) child_path: String,
}

/// A bundle dispatched to this worker for execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct BundleAssignment {
    pub(crate) uuid: String,
    pub(crate) command: String,
    #[serde(default)]
    pub(crate) dependencies: Vec<BundleDependency>,
    pub(crate) docker_image: String,
    #[serde(default)]
    pub(crate) docker_image_digest: Option<String>,
}

/// Resource envelope requested for a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct RequestedResources {
    #[serde(default)]
    pub(crate) request_cpus: usize,
    #[serde(default)]
    pub(crate) request_gpus: usize,
    #[serde(default)]
    pub(crate) request_memory_bytes: u64,
    #[serde(default)]
    pub(crate) request_disk_bytes: u64,
    #[serde(default)]
    pub(crate) request_time_seconds: u64,
    #[serde(default)]
    pub(crate) request_network: bool,
}

/// Ready dependency advertised during check-in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct DependencyKeyDto {
    pub(crate) parent_uuid: String,
    pub(crate) parent_path: String,
}

/// Check-in payload. Field names are part of the wire contract.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct CheckinRequest {
    pub(crate) version: u32,
    pub(crate) will_upgrade: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) tag: Option<String>,
    pub(crate) cpus: usize,
    pub(crate) gpus: usize,
    pub(crate) memory_bytes: u64,
    pub(crate) dependencies: Vec<DependencyKeyDto>,
}

/// Envelope returned by a successful check-in: at most one command.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ServerMessage {
    Run {
        bundle: BundleAssignment,
        resources: RequestedResources,
    },
    Read {
        socket_id: u64,
        uuid: String,
        path: String,
        #[serde(default)]
        read_args: serde_json::Value,
    },
    Netcat {
        socket_id: u64,
        uuid: String,
        port: u16,
        message: String,
    },
    Write {
        uuid: String,
        subpath: String,
        string: String,
    },
    Kill {
        uuid: String,
    },
    Upgrade,
}

/// Incremental or final metadata reported for a run.
#[derive(Debug, Clone, Default, Serialize)]
pub(crate) struct RunMetadataUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) run_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) bytes_downloaded: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) exitcode: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) failure_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) memory: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) data_size: Option<u64>,
}

/// Payload kind of a fetched bundle subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BundleContentsKind {
    File,
    /// Delivered as a gzipped tarball.
    Directory,
}

/// Duplex channel back to the client that requested a read or netcat.
///
/// Both directions take `&self` so a bridge can pump them concurrently.
/// `recv` waits while no data is pending and resolves `Ok(None)` only when
/// the requester has closed its end.
#[async_trait]
pub(crate) trait RequesterSocket: Send + Sync {
    async fn send(&self, data: Bytes) -> Result<(), ServiceError>;
    async fn recv(&self) -> Result<Option<Bytes>, ServiceError>;

    async fn send_json(&self, value: &serde_json::Value) -> Result<(), ServiceError> {
        let raw = serde_json::to_vec(value)
            .map_err(|err| ServiceError::Invalid(format!("encode header: {err}")))?;
        self.send(Bytes::from(raw)).await
    }
}

/// Wire contract the worker consumes from the central bundle service.
///
/// All operations are idempotent or tolerate replay; callers own retry
/// policy.
#[async_trait]
pub(crate) trait BundleService: Send + Sync + 'static {
    async fn check_in(
        &self,
        worker_id: &str,
        request: &CheckinRequest,
    ) -> Result<Option<ServerMessage>, ServiceError>;

    async fn check_out(&self, worker_id: &str) -> Result<(), ServiceError>;

    async fn get_bundle_contents(
        &self,
        parent_uuid: &str,
        path: &str,
    ) -> Result<(BundleContentsKind, ByteStream), ServiceError>;

    async fn update_run_metadata(
        &self,
        uuid: &str,
        update: &RunMetadataUpdate,
    ) -> Result<(), ServiceError>;

    /// Upload the run's output directory as a gzipped tarball on disk.
    async fn upload_run_output(&self, uuid: &str, archive: &Path) -> Result<(), ServiceError>;

    async fn open_socket(&self, socket_id: u64)
        -> Result<Box<dyn RequesterSocket>, ServiceError>;

    /// Gzipped tarball of the worker's own code, for self-upgrade.
    async fn get_code(&self) -> Result<ByteStream, ServiceError>;
}

/// HTTP implementation of [`BundleService`].
pub(crate) struct HttpBundleService {
    http: reqwest::Client,
    base: Url,
}

impl HttpBundleService {
    pub(crate) fn new(base: Url) -> anyhow::Result<Self> {
        // No global timeout: bundle downloads and uploads may stream for a
        // long time. Connect attempts still fail fast.
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self { http, base })
    }

    fn url(&self, path: &str) -> Result<Url, ServiceError> {
        self.base
            .join(path)
            .map_err(|err| ServiceError::Invalid(format!("bad url {path:?}: {err}")))
    }
}

async fn check_status(res: reqwest::Response) -> Result<reqwest::Response, ServiceError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    Err(ServiceError::Status {
        status: status.as_u16(),
        body,
    })
}

fn into_byte_stream(res: reqwest::Response) -> ByteStream {
    res.bytes_stream()
        .map(|chunk| chunk.map_err(std::io::Error::other))
        .boxed()
}

#[async_trait]
impl BundleService for HttpBundleService {
    async fn check_in(
        &self,
        worker_id: &str,
        request: &CheckinRequest,
    ) -> Result<Option<ServerMessage>, ServiceError> {
        let url = self.url(&format!("worker/{worker_id}/checkin"))?;
        let res = self.http.post(url).json(request).send().await?;
        let res = check_status(res).await?;
        Ok(res.json().await?)
    }

    async fn check_out(&self, worker_id: &str) -> Result<(), ServiceError> {
        let url = self.url(&format!("worker/{worker_id}/checkout"))?;
        let res = self.http.post(url).send().await?;
        check_status(res).await?;
        Ok(())
    }

    async fn get_bundle_contents(
        &self,
        parent_uuid: &str,
        path: &str,
    ) -> Result<(BundleContentsKind, ByteStream), ServiceError> {
        let url = self.url(&format!("bundle/{parent_uuid}/contents"))?;
        let res = self
            .http
            .get(url)
            .query(&[("path", path)])
            .send()
            .await?;
        let res = check_status(res).await?;

        let kind = match res
            .headers()
            .get("Target-Type")
            .and_then(|v| v.to_str().ok())
        {
            Some("directory") => BundleContentsKind::Directory,
            _ => BundleContentsKind::File,
        };
        Ok((kind, into_byte_stream(res)))
    }

    async fn update_run_metadata(
        &self,
        uuid: &str,
        update: &RunMetadataUpdate,
    ) -> Result<(), ServiceError> {
        let url = self.url(&format!("run/{uuid}/metadata"))?;
        let res = self.http.put(url).json(update).send().await?;
        check_status(res).await?;
        Ok(())
    }

    async fn upload_run_output(&self, uuid: &str, archive: &Path) -> Result<(), ServiceError> {
        let url = self.url(&format!("run/{uuid}/output"))?;
        let file = tokio::fs::File::open(archive)
            .await
            .map_err(|err| ServiceError::Invalid(format!("open {}: {err}", archive.display())))?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let res = self
            .http
            .put(url)
            .header("Content-Type", "application/gzip")
            .body(body)
            .send()
            .await?;
        check_status(res).await?;
        Ok(())
    }

    async fn open_socket(
        &self,
        socket_id: u64,
    ) -> Result<Box<dyn RequesterSocket>, ServiceError> {
        let url = self.url(&format!("socket/{socket_id}"))?;
        Ok(Box::new(HttpSocket {
            http: self.http.clone(),
            url,
        }))
    }

    async fn get_code(&self) -> Result<ByteStream, ServiceError> {
        let url = self.url("worker/code")?;
        let res = self.http.get(url).send().await?;
        let res = check_status(res).await?;
        Ok(into_byte_stream(res))
    }
}

struct HttpSocket {
    http: reqwest::Client,
    url: Url,
}

/// Pause between polls of a requester socket with nothing pending.
const SOCKET_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(200);

#[async_trait]
impl RequesterSocket for HttpSocket {
    async fn send(&self, data: Bytes) -> Result<(), ServiceError> {
        let res = self.http.post(self.url.clone()).body(data).send().await?;
        check_status(res).await?;
        Ok(())
    }

    /// Polls the socket endpoint. 204 (or an empty 2xx body) means nothing
    /// is pending yet; only 410 means the requester hung up.
    async fn recv(&self) -> Result<Option<Bytes>, ServiceError> {
        loop {
            let res = self.http.get(self.url.clone()).send().await?;
            match res.status().as_u16() {
                410 => return Ok(None),
                204 => {}
                _ => {
                    let res = check_status(res).await?;
                    let body = res.bytes().await?;
                    if !body.is_empty() {
                        return Ok(Some(body));
                    }
                }
            }
            tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkin_payload_uses_contract_field_names() {
        let request = CheckinRequest {
            version: VERSION,
            will_upgrade: false,
            tag: Some("gpu-box".to_string()),
            cpus: 4,
            gpus: 1,
            memory_bytes: 8 << 30,
            dependencies: vec![DependencyKeyDto {
                parent_uuid: "0xparent".to_string(),
                parent_path: "data".to_string(),
            }],
        };

        let value = serde_json::to_value(&request).unwrap();
        let obj = value.as_object().unwrap();
        for key in ["version", "will_upgrade", "tag", "cpus", "gpus", "memory_bytes", "dependencies"] {
            assert!(obj.contains_key(key), "missing field {key}");
        }
        let dep = value["dependencies"][0].as_object().unwrap();
        assert_eq!(dep.len(), 2);
        assert_eq!(dep["parent_uuid"], "0xparent");
        assert_eq!(dep["parent_path"], "data");
    }

    #[test]
    fn checkin_payload_omits_absent_tag() {
        let request = CheckinRequest {
            version: VERSION,
            will_upgrade: true,
            tag: None,
            cpus: 0,
            gpus: 0,
            memory_bytes: 0,
            dependencies: Vec::new(),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.as_object().unwrap().get("tag").is_none());
    }

    #[test]
    fn parses_run_message() {
        let raw = serde_json::json!({
            "type": "run",
            "bundle": {
                "uuid": "0xabc",
                "command": "echo hi",
                "dependencies": [
                    {"parent_uuid": "0xdef", "parent_path": "data", "child_path": "input"}
                ],
                "docker_image": "ubuntu:22.04"
            },
            "resources": {
                "request_cpus": 2,
                "request_gpus": 0,
                "request_memory_bytes": 1024,
                "request_network": true
            }
        });

        let msg: ServerMessage = serde_json::from_value(raw).unwrap();
        match msg {
            ServerMessage::Run { bundle, resources } => {
                assert_eq!(bundle.uuid, "0xabc");
                assert_eq!(bundle.dependencies.len(), 1);
                assert_eq!(bundle.dependencies[0].child_path, "input");
                assert_eq!(bundle.docker_image_digest, None);
                assert_eq!(resources.request_cpus, 2);
                assert!(resources.request_network);
                assert_eq!(resources.request_time_seconds, 0);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn parses_control_messages() {
        let read: ServerMessage = serde_json::from_value(serde_json::json!({
            "type": "read",
            "socket_id": 7,
            "uuid": "0xabc",
            "path": "stdout",
            "read_args": {"type": "stream"}
        }))
        .unwrap();
        assert!(matches!(read, ServerMessage::Read { socket_id: 7, .. }));

        let netcat: ServerMessage = serde_json::from_value(serde_json::json!({
            "type": "netcat",
            "socket_id": 9,
            "uuid": "0xabc",
            "port": 8080,
            "message": "ping"
        }))
        .unwrap();
        assert!(matches!(netcat, ServerMessage::Netcat { port: 8080, .. }));

        let write: ServerMessage = serde_json::from_value(serde_json::json!({
            "type": "write",
            "uuid": "0xabc",
            "subpath": "flags/stop",
            "string": "1"
        }))
        .unwrap();
        assert!(matches!(write, ServerMessage::Write { .. }));

        let kill: ServerMessage =
            serde_json::from_value(serde_json::json!({"type": "kill", "uuid": "0xabc"})).unwrap();
        assert!(matches!(kill, ServerMessage::Kill { .. }));

        let upgrade: ServerMessage =
            serde_json::from_value(serde_json::json!({"type": "upgrade"})).unwrap();
        assert!(matches!(upgrade, ServerMessage::Upgrade));
    }

    #[test]
    fn null_checkin_response_is_no_message() {
        let msg: Option<ServerMessage> = serde_json::from_str("null").unwrap();
        assert!(msg.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn socket_recv_polls_through_quiet_periods_until_close() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // One canned HTTP exchange per connection; `connection: close` makes
        // the client reconnect for every poll.
        let responses = [
            "HTTP/1.1 204 No Content\r\nconnection: close\r\n\r\n",
            "HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
            "HTTP/1.1 200 OK\r\ncontent-length: 4\r\nconnection: close\r\n\r\ndata",
            "HTTP/1.1 410 Gone\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        ];

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            for response in responses {
                let (mut sock, _) = listener.accept().await.unwrap();
                let mut request = Vec::new();
                let mut chunk = [0u8; 1024];
                loop {
                    let n = sock.read(&mut chunk).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    request.extend_from_slice(&chunk[..n]);
                    if request.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                sock.write_all(response.as_bytes()).await.unwrap();
            }
        });

        let service =
            HttpBundleService::new(Url::parse(&format!("http://{addr}/")).unwrap()).unwrap();
        let socket = service.open_socket(7).await.unwrap();

        // Quiet polls (204, then an empty 200) must not read as a close.
        let first = tokio::time::timeout(std::time::Duration::from_secs(30), socket.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.as_deref(), Some(b"data".as_slice()));

        // 410 is the explicit close signal.
        let second = tokio::time::timeout(std::time::Duration::from_secs(30), socket.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second, None);

        server.await.unwrap();
    }

    #[test]
    fn metadata_update_skips_absent_fields() {
        let update = RunMetadataUpdate {
            run_status: Some("running".to_string()),
            time: Some(12),
            ..Default::default()
        };
        let value = serde_json::to_value(&update).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), 2);
        assert_eq!(obj["run_status"], "running");
        assert_eq!(obj["time"], 12);
    }
}
