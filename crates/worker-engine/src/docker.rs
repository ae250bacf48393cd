use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, DeviceRequest, HostConfig, NetworkCreateRequest};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptionsBuilder, InspectContainerOptions,
    ListImagesOptionsBuilder, ListNetworksOptions, LogsOptionsBuilder,
    RemoveContainerOptionsBuilder, RemoveImageOptions, StartContainerOptions, StatsOptions,
    StopContainerOptionsBuilder,
};
use bollard::Docker;
use bytes::Bytes;
use futures::StreamExt;

use crate::runtime::{
    ContainerRuntime, ContainerSpec, ContainerStatus, ImageInfo, OutputTail, ResourceSample,
    RuntimeError,
};

/// [`ContainerRuntime`] backed by the Docker engine HTTP API.
pub(crate) struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub(crate) fn connect() -> anyhow::Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|err| anyhow!("failed to connect to docker: {err}"))?;
        Ok(Self { docker })
    }

    async fn collect_stream(
        &self,
        id: &str,
        want_stdout: bool,
        offset: u64,
    ) -> Result<Bytes, RuntimeError> {
        let options = LogsOptionsBuilder::new()
            .follow(false)
            .stdout(want_stdout)
            .stderr(!want_stdout)
            .tail("all")
            .build();

        let mut stream = self.docker.logs(id, Some(options));
        let mut buf: Vec<u8> = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk.map_err(|err| classify_container(err, id))? {
                LogOutput::StdOut { message } if want_stdout => buf.extend_from_slice(&message),
                LogOutput::StdErr { message } if !want_stdout => buf.extend_from_slice(&message),
                _ => {}
            }
        }

        let skip = usize::try_from(offset).unwrap_or(usize::MAX).min(buf.len());
        Ok(Bytes::from(buf.split_off(skip)))
    }
}

/// Append the implicit `latest` tag so references compare against the
/// engine's `repo_tags` form.
fn normalize_reference(reference: &str) -> String {
    if reference.contains('@') || reference.rsplit('/').next().is_some_and(|last| last.contains(':'))
    {
        reference.to_string()
    } else {
        format!("{reference}:latest")
    }
}

fn classify(err: BollardError) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => {
            if status_code >= 500 {
                RuntimeError::Transient(anyhow!("docker {status_code}: {message}"))
            } else {
                RuntimeError::Permanent(anyhow!("docker {status_code}: {message}"))
            }
        }
        // Transport-level failures (socket gone, timeout) are worth retrying.
        other => RuntimeError::Transient(anyhow::Error::new(other)),
    }
}

fn classify_container(err: BollardError, id: &str) -> RuntimeError {
    if let BollardError::DockerResponseServerError {
        status_code: 404, ..
    } = err
    {
        return RuntimeError::ContainerMissing(id.to_string());
    }
    classify(err)
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ensure_network(&self, name: &str, internal: bool) -> Result<(), RuntimeError> {
        let networks = self
            .docker
            .list_networks(None::<ListNetworksOptions>)
            .await
            .map_err(classify)?;
        let exists = networks
            .iter()
            .any(|n| matches!(&n.name, Some(existing) if existing == name));
        if exists {
            log::debug!("docker network already exists, not creating: {name}");
            return Ok(());
        }

        log::debug!("creating docker network: {name}");
        self.docker
            .create_network(NetworkCreateRequest {
                name: name.to_string(),
                internal: Some(internal),
                ..Default::default()
            })
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn pull_image(&self, reference: &str) -> Result<(), RuntimeError> {
        let options = CreateImageOptionsBuilder::new().from_image(reference).build();
        let mut pulling = self.docker.create_image(Some(options), None, None);
        while let Some(result) = pulling.next().await {
            result.map_err(classify)?;
        }
        Ok(())
    }

    async fn list_images(&self) -> Result<Vec<ImageInfo>, RuntimeError> {
        let options = ListImagesOptionsBuilder::new().all(false).build();
        let images = self
            .docker
            .list_images(Some(options))
            .await
            .map_err(classify)?;

        Ok(images
            .into_iter()
            .filter_map(|image| {
                let reference = image.repo_tags.first()?.clone();
                Some(ImageInfo {
                    reference,
                    size_bytes: u64::try_from(image.size).unwrap_or(0),
                })
            })
            .collect())
    }

    async fn remove_image(&self, reference: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_image(reference, None::<RemoveImageOptions>, None)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn image_present(
        &self,
        reference: &str,
        digest: Option<&str>,
    ) -> Result<bool, RuntimeError> {
        let wanted = normalize_reference(reference);
        let options = ListImagesOptionsBuilder::new().all(false).build();
        let images = self
            .docker
            .list_images(Some(options))
            .await
            .map_err(classify)?;

        for image in images {
            if !image.repo_tags.iter().any(|tag| *tag == wanted) {
                continue;
            }
            match digest {
                None => return Ok(true),
                Some(digest) => {
                    if image.repo_digests.iter().any(|d| d.ends_with(digest)) {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    async fn start_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let mut binds = Vec::with_capacity(spec.binds.len());
        for bind in &spec.binds {
            let mode = if bind.read_only { ":ro" } else { "" };
            binds.push(format!("{}:{}{mode}", bind.host.display(), bind.container));
        }

        let cpuset = spec
            .cpuset
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let device_requests = if spec.gpus.is_empty() {
            None
        } else {
            Some(vec![DeviceRequest {
                driver: Some("nvidia".to_string()),
                device_ids: Some(spec.gpus.iter().map(u32::to_string).collect()),
                capabilities: Some(vec![vec!["gpu".to_string()]]),
                ..Default::default()
            }])
        };

        let host_config = HostConfig {
            binds: Some(binds),
            memory: Some(i64::try_from(spec.memory_bytes).unwrap_or(i64::MAX)),
            cpuset_cpus: Some(cpuset),
            network_mode: Some(spec.network.clone()),
            device_requests,
            ..Default::default()
        };

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                spec.command.clone(),
            ]),
            working_dir: Some(spec.working_dir.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let id = self
            .docker
            .create_container(None::<CreateContainerOptions>, body)
            .await
            .map_err(classify)?
            .id;
        self.docker
            .start_container(&id, None::<StartContainerOptions>)
            .await
            .map_err(|err| classify_container(err, &id))?;
        Ok(id)
    }

    async fn container_status(&self, id: &str) -> Result<ContainerStatus, RuntimeError> {
        let inspect = match self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => inspect,
            Err(err) => {
                return match classify_container(err, id) {
                    RuntimeError::ContainerMissing(_) => Ok(ContainerStatus::Missing),
                    other => Err(other),
                };
            }
        };

        let Some(state) = inspect.state else {
            return Ok(ContainerStatus::Missing);
        };
        if state.running == Some(true) {
            return Ok(ContainerStatus::Running);
        }
        Ok(ContainerStatus::Exited {
            exit_code: state.exit_code,
            oom_killed: state.oom_killed.unwrap_or(false),
        })
    }

    async fn tail_output(
        &self,
        id: &str,
        stdout_offset: u64,
        stderr_offset: u64,
    ) -> Result<OutputTail, RuntimeError> {
        let stdout = self.collect_stream(id, true, stdout_offset).await?;
        let stderr = self.collect_stream(id, false, stderr_offset).await?;
        Ok(OutputTail { stdout, stderr })
    }

    async fn container_stats(&self, id: &str) -> Result<ResourceSample, RuntimeError> {
        let mut stream = self
            .docker
            .stats(
                id,
                Some(StatsOptions {
                    stream: false,
                    one_shot: true,
                }),
            )
            .take(1);

        let mut sample = ResourceSample::default();
        while let Some(stats) = stream.next().await {
            let stats = stats.map_err(|err| classify_container(err, id))?;
            sample.memory_bytes = stats
                .memory_stats
                .as_ref()
                .and_then(|m| m.usage)
                .unwrap_or(0);
        }
        Ok(sample)
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError> {
        let timeout = i32::try_from(grace.as_secs()).unwrap_or(i32::MAX);
        let options = StopContainerOptionsBuilder::new().t(timeout).build();
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // Already stopped or already gone: the goal is achieved.
            Err(BollardError::DockerResponseServerError {
                status_code: 304 | 404,
                ..
            }) => Ok(()),
            Err(err) => Err(classify(err)),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptionsBuilder::new().force(true).build();
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(err) => Err(classify(err)),
        }
    }

    async fn container_ip(&self, id: &str, network: &str) -> Result<String, RuntimeError> {
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|err| classify_container(err, id))?;

        inspect
            .network_settings
            .and_then(|settings| settings.networks)
            .and_then(|networks| networks.get(network).cloned())
            .and_then(|endpoint| endpoint.ip_address)
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| {
                RuntimeError::Permanent(anyhow!("container {id} has no address on {network}"))
            })
    }

    async fn gpu_inventory(&self) -> Result<Vec<u32>, RuntimeError> {
        let output = tokio::process::Command::new("nvidia-smi")
            .args(["--query-gpu=index", "--format=csv,noheader"])
            .output()
            .await;

        let output = match output {
            Ok(output) if output.status.success() => output,
            // No nvidia-smi or no driver: a CPU-only host.
            _ => return Ok(Vec::new()),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .filter_map(|line| line.trim().parse::<u32>().ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_untagged_references() {
        assert_eq!(normalize_reference("ubuntu"), "ubuntu:latest");
        assert_eq!(normalize_reference("ubuntu:22.04"), "ubuntu:22.04");
        assert_eq!(
            normalize_reference("registry.example.com:5000/team/tool"),
            "registry.example.com:5000/team/tool:latest"
        );
        assert_eq!(
            normalize_reference("ubuntu@sha256:abcd"),
            "ubuntu@sha256:abcd"
        );
    }
}
