//! Container runtime adapter.
//!
//! The platform only touches containers through the [`ContainerRuntime`]
//! contract; [`DockerRuntime`] implements it against the Docker daemon via
//! bollard. Tests substitute their own implementations.

use std::{
    collections::HashMap,
    path::Path,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::{
    body_full,
    models::{
        ContainerCreateBody, ContainerInspectResponse, ContainerStateStatusEnum, HealthStatusEnum,
        HostConfig, PortBinding,
    },
    query_parameters::{
        CreateContainerOptions, ImportImageOptions, InspectContainerOptions, ListContainersOptions,
        LogsOptions, RemoveContainerOptions, StartContainerOptions,
    },
    Docker,
};
use bytes::Bytes;
use futures_util::StreamExt;
use tracing::{debug, info};

/// Port the function processor listens on inside its container.
pub const FUNCTION_CONTAINER_HTTP_PORT: u16 = 8080;

const HTTP_PORT_BINDING_KEY: &str = "8080/tcp";

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Cap on captured container logs; diagnostics, not archival.
const MAX_LOG_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct VolumeBinding {
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RunContainerOptions {
    pub container_name: String,
    /// Host port to container port.
    pub ports: HashMap<u16, u16>,
    pub env: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub volumes: Vec<VolumeBinding>,
    pub network: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct GetContainerOptions {
    /// Exact container name to match.
    pub name: Option<String>,
    /// All given labels must be present on the container.
    pub labels: HashMap<String, String>,
    /// Include stopped containers.
    pub stopped: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerPortBinding {
    pub host_ip: String,
    pub host_port: String,
}

#[derive(Debug, Clone, Default)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
    /// Keyed by `<port>/<proto>`, e.g. `8080/tcp`.
    pub port_bindings: HashMap<String, Vec<ContainerPortBinding>>,
}

impl ContainerInfo {
    /// Host port bound to the function's HTTP trigger port, if any.
    pub fn http_host_port(&self) -> Option<u16> {
        self.port_bindings
            .get(HTTP_PORT_BINDING_KEY)?
            .first()?
            .host_port
            .parse()
            .ok()
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start a container, returning its id.
    async fn run_container(&self, image: &str, options: RunContainerOptions) -> Result<String>;

    /// Force-remove a container. Errors if it does not exist.
    async fn remove_container(&self, id_or_name: &str) -> Result<()>;

    async fn get_containers(&self, options: GetContainerOptions) -> Result<Vec<ContainerInfo>>;

    /// Wait until the container reports healthy (or, for images without a
    /// healthcheck, running). Errors on timeout or when the container
    /// exits first.
    async fn await_container_health(&self, id_or_name: &str, timeout: Duration) -> Result<()>;

    /// Last log lines of a container, stdout and stderr interleaved.
    async fn get_container_logs(&self, id_or_name: &str) -> Result<String>;

    /// Load an image archive into the runtime.
    async fn load_image(&self, archive_path: &Path) -> Result<()>;
}

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the default Docker socket.
    pub fn new() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?;
        Ok(Self { docker })
    }

    /// Connect to a specific Docker address.
    ///
    /// Supported address formats:
    /// - Unix socket: `unix:///var/run/docker.sock` or `/var/run/docker.sock`
    /// - HTTP: `http://localhost:2375` or `tcp://localhost:2375`
    /// - HTTPS: `https://localhost:2376` (requires TLS setup)
    pub fn with_address(address: &str) -> Result<Self> {
        let docker = if address.starts_with("http://") || address.starts_with("tcp://") {
            let addr = address
                .trim_start_matches("http://")
                .trim_start_matches("tcp://");
            Docker::connect_with_http(
                &format!("http://{}", addr),
                120,
                bollard::API_DEFAULT_VERSION,
            )
            .context("Failed to connect to Docker daemon via HTTP")?
        } else if address.starts_with("https://") {
            // picks up DOCKER_HOST / DOCKER_CERT_PATH env vars
            Docker::connect_with_defaults()
                .context("Failed to connect to Docker daemon via HTTPS")?
        } else {
            let socket_path = address.trim_start_matches("unix://");
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .context("Failed to connect to Docker daemon via Unix socket")?
        };
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn run_container(&self, image: &str, options: RunContainerOptions) -> Result<String> {
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        for (host_port, container_port) in &options.ports {
            let key = format!("{}/tcp", container_port);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(host_port.to_string()),
                }]),
            );
        }

        let binds: Vec<String> = options.volumes.iter().map(format_bind).collect();

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            binds: if binds.is_empty() { None } else { Some(binds) },
            network_mode: options.network.clone(),
            ..Default::default()
        };

        let body = ContainerCreateBody {
            image: Some(image.to_string()),
            env: Some(format_env(&options.env)),
            labels: Some(options.labels.clone()),
            exposed_ports: if exposed_ports.is_empty() {
                None
            } else {
                Some(exposed_ports)
            },
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: Some(options.container_name.clone()),
            platform: String::new(),
        };

        let response = self
            .docker
            .create_container(Some(create_options), body)
            .await
            .with_context(|| format!("Failed to create container {}", options.container_name))?;

        if let Err(e) = self
            .docker
            .start_container(&options.container_name, None::<StartContainerOptions>)
            .await
        {
            // The container is intentionally left in place for inspection;
            // best-effort log capture goes into the error.
            let logs = self
                .get_container_logs(&options.container_name)
                .await
                .unwrap_or_default();
            let log_context = if logs.is_empty() {
                String::new()
            } else {
                format!("\nContainer logs:\n{}", logs)
            };
            return Err(e).with_context(|| {
                format!(
                    "Failed to start container {}{}",
                    options.container_name, log_context
                )
            });
        }

        info!(
            container = %options.container_name,
            container_id = %response.id,
            image = %image,
            "Container started"
        );

        Ok(response.id)
    }

    async fn remove_container(&self, id_or_name: &str) -> Result<()> {
        self.docker
            .remove_container(
                id_or_name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .with_context(|| format!("Failed to remove container {}", id_or_name))?;
        Ok(())
    }

    async fn get_containers(&self, options: GetContainerOptions) -> Result<Vec<ContainerInfo>> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        if let Some(name) = &options.name {
            filters.insert("name".to_string(), vec![name.clone()]);
        }
        if !options.labels.is_empty() {
            filters.insert(
                "label".to_string(),
                options
                    .labels
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect(),
            );
        }

        let list_options = ListContainersOptions {
            all: options.stopped,
            filters: Some(filters),
            ..Default::default()
        };

        let summaries = self
            .docker
            .list_containers(Some(list_options))
            .await
            .context("Failed to list containers")?;

        let mut containers = Vec::new();
        for summary in summaries {
            let Some(id) = summary.id else { continue };

            // the docker name filter matches substrings; enforce exactness
            if let Some(wanted) = &options.name {
                let names = summary.names.unwrap_or_default();
                if !names.iter().any(|n| n.trim_start_matches('/') == wanted) {
                    continue;
                }
            }

            match self
                .docker
                .inspect_container(&id, None::<InspectContainerOptions>)
                .await
            {
                Ok(inspect) => containers.push(container_info_from_inspect(id, inspect)),
                // removed between list and inspect
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                }) => continue,
                Err(e) => return Err(e).context("Failed to inspect container"),
            }
        }

        Ok(containers)
    }

    async fn await_container_health(&self, id_or_name: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            match self
                .docker
                .inspect_container(id_or_name, None::<InspectContainerOptions>)
                .await
            {
                Ok(inspect) => {
                    if let Some(state) = inspect.state {
                        let health = state.health.as_ref().and_then(|h| h.status);
                        match health {
                            Some(HealthStatusEnum::HEALTHY) => return Ok(()),
                            Some(HealthStatusEnum::NONE)
                            | Some(HealthStatusEnum::EMPTY)
                            | None => {
                                // no healthcheck configured: running is as
                                // healthy as it gets
                                if state.running.unwrap_or(false) {
                                    return Ok(());
                                }
                            }
                            // starting or unhealthy: keep polling, the
                            // container may still come up
                            _ => {}
                        }
                        if matches!(
                            state.status,
                            Some(ContainerStateStatusEnum::EXITED)
                                | Some(ContainerStateStatusEnum::DEAD)
                        ) {
                            anyhow::bail!(
                                "Container {} exited before becoming healthy",
                                id_or_name
                            );
                        }
                    }
                }
                // missing containers are retried until the deadline: during
                // a deploy the container may not be visible yet
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                }) => {}
                Err(e) => return Err(e).context("Failed to inspect container health"),
            }

            if Instant::now() >= deadline {
                anyhow::bail!(
                    "Container {} did not become healthy within {:?}",
                    id_or_name,
                    timeout
                );
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
    }

    async fn get_container_logs(&self, id_or_name: &str) -> Result<String> {
        let options = LogsOptions {
            stdout: true,
            stderr: true,
            tail: "100".to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.logs(id_or_name, Some(options));
        let mut output = String::new();

        while let Some(result) = stream.next().await {
            match result {
                Ok(log_output) => {
                    let line = log_output.to_string();
                    if output.len() + line.len() > MAX_LOG_BYTES {
                        output.push_str(&line[..MAX_LOG_BYTES.saturating_sub(output.len())]);
                        output.push_str("\n... (truncated)");
                        break;
                    }
                    output.push_str(&line);
                }
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                }) => break,
                Err(e) => return Err(e).context("Failed to fetch container logs"),
            }
        }

        Ok(output)
    }

    async fn load_image(&self, archive_path: &Path) -> Result<()> {
        let archive = tokio::fs::read(archive_path)
            .await
            .with_context(|| format!("Failed to read image archive {}", archive_path.display()))?;

        let options = ImportImageOptions {
            quiet: true,
            ..Default::default()
        };

        debug!(
            archive = %archive_path.display(),
            size_bytes = archive.len(),
            "Loading image archive"
        );

        let mut stream = self
            .docker
            .import_image(options, body_full(Bytes::from(archive)), None);
        while let Some(result) = stream.next().await {
            result.context("Failed to load image archive")?;
        }

        Ok(())
    }
}

fn format_env(env: &HashMap<String, String>) -> Vec<String> {
    env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
}

fn format_bind(volume: &VolumeBinding) -> String {
    if volume.read_only {
        format!("{}:{}:ro", volume.host_path, volume.container_path)
    } else {
        format!("{}:{}", volume.host_path, volume.container_path)
    }
}

fn container_info_from_inspect(id: String, inspect: ContainerInspectResponse) -> ContainerInfo {
    let name = inspect
        .name
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_default();
    let labels = inspect
        .config
        .and_then(|c| c.labels)
        .unwrap_or_default();

    let mut port_bindings: HashMap<String, Vec<ContainerPortBinding>> = HashMap::new();
    if let Some(bindings) = inspect.host_config.and_then(|hc| hc.port_bindings) {
        for (key, binding) in bindings {
            let bindings: Vec<ContainerPortBinding> = binding
                .unwrap_or_default()
                .into_iter()
                .map(|b| ContainerPortBinding {
                    host_ip: b.host_ip.unwrap_or_default(),
                    host_port: b.host_port.unwrap_or_default(),
                })
                .collect();
            port_bindings.insert(key, bindings);
        }
    }

    ContainerInfo {
        id,
        name,
        labels,
        port_bindings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_host_port() {
        let mut info = ContainerInfo::default();
        assert_eq!(info.http_host_port(), None);

        info.port_bindings.insert(
            "8080/tcp".to_string(),
            vec![ContainerPortBinding {
                host_ip: String::new(),
                host_port: "34567".to_string(),
            }],
        );
        assert_eq!(info.http_host_port(), Some(34567));

        info.port_bindings
            .insert("8080/tcp".to_string(), Vec::new());
        assert_eq!(info.http_host_port(), None);
    }

    #[test]
    fn test_format_bind() {
        let ro = VolumeBinding {
            host_path: "/tmp/processor-config-abc".to_string(),
            container_path: "/etc/nuclio/config/processor/processor.yaml".to_string(),
            read_only: true,
        };
        assert_eq!(
            format_bind(&ro),
            "/tmp/processor-config-abc:/etc/nuclio/config/processor/processor.yaml:ro"
        );

        let rw = VolumeBinding {
            host_path: "/data".to_string(),
            container_path: "/var/data".to_string(),
            read_only: false,
        };
        assert_eq!(format_bind(&rw), "/data:/var/data");
    }
}
