//! Function lifecycle engine.
//!
//! Drives a function from requested to ready through an explicit phase
//! machine: validating, building, deploying, then ready or failed. The
//! building upsert is the commit point — every failure past it is recorded
//! on the function record, never swallowed.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use tokio::sync::oneshot;
use tracing::warn;

use crate::{
    builder::ImageBuilder,
    docker::{
        ContainerRuntime, GetContainerOptions, RunContainerOptions, VolumeBinding,
        FUNCTION_CONTAINER_HTTP_PORT,
    },
    errors::PlatformError,
    functionconfig::{
        truncate_status_message, FunctionConfig, FunctionRecord, FunctionState, FunctionStatus,
        LABEL_ANNOTATIONS, LABEL_FUNCTION_NAME, LABEL_FUNCTION_SPEC, LABEL_NAMESPACE,
        LABEL_PLATFORM, PLATFORM_NAME,
    },
    logstream::{DeployLogStream, DeployLogStreams},
    network,
    store::{FunctionFilter, LocalStore},
};

/// Where the processor configuration is mounted inside every function
/// container.
pub const PROCESSOR_CONFIG_CONTAINER_PATH: &str = "/etc/nuclio/config/processor/processor.yaml";

const ERROR_STACK_DEPTH: usize = 20;

/// Phases of a create call, in order. Failures after `Building` has been
/// committed always land in `Failed` with the record moved to the error
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployPhase {
    Validating,
    Building,
    Deploying,
    Ready,
    Failed,
}

impl DeployPhase {
    fn as_str(&self) -> &'static str {
        match self {
            DeployPhase::Validating => "validating",
            DeployPhase::Building => "building",
            DeployPhase::Deploying => "deploying",
            DeployPhase::Ready => "ready",
            DeployPhase::Failed => "failed",
        }
    }
}

pub struct CreateFunctionOptions {
    pub function_config: FunctionConfig,
    /// Image archive to load into the runtime before deploying.
    pub input_image_file: Option<PathBuf>,
    /// Fired once the record is committed and prior containers are gone,
    /// so async callers can proceed while the build runs.
    pub creation_state_updated: Option<oneshot::Sender<()>>,
}

impl CreateFunctionOptions {
    pub fn new(function_config: FunctionConfig) -> Self {
        Self {
            function_config,
            input_image_file: None,
            creation_state_updated: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateFunctionResult {
    pub port: u16,
    pub container_id: String,
    pub image: String,
}

pub struct FunctionDeployer {
    store: Arc<LocalStore>,
    runtime: Arc<dyn ContainerRuntime>,
    builder: Arc<dyn ImageBuilder>,
    log_streams: Arc<DeployLogStreams>,
    default_readiness_timeout: Duration,
}

impl FunctionDeployer {
    pub fn new(
        store: Arc<LocalStore>,
        runtime: Arc<dyn ContainerRuntime>,
        builder: Arc<dyn ImageBuilder>,
        log_streams: Arc<DeployLogStreams>,
        default_readiness_timeout: Duration,
    ) -> Self {
        Self {
            store,
            runtime,
            builder,
            log_streams,
            default_readiness_timeout,
        }
    }

    pub async fn create_function(
        &self,
        options: CreateFunctionOptions,
    ) -> Result<CreateFunctionResult, PlatformError> {
        let CreateFunctionOptions {
            mut function_config,
            input_image_file,
            creation_state_updated,
        } = options;

        // bind the per-invocation log sink; it outlives the call so readers
        // can drain it later
        let logger = self
            .log_streams
            .create(&function_config.meta.unique_id());

        self.enter_phase(&logger, DeployPhase::Validating);
        validate(&function_config)?;

        // the local backend has no registries
        function_config.spec.run_registry = None;
        function_config.spec.build_registry = None;

        if let Some(archive) = &input_image_file {
            logger.info(format!("Loading image archive from {}", archive.display()));
            self.runtime
                .load_image(archive)
                .await
                .map_err(PlatformError::runtime)?;
        }

        // prior record, if any; its presence means this is a redeploy
        let existing = self
            .store
            .get_functions(&FunctionFilter {
                name: Some(function_config.meta.name.clone()),
                namespace: Some(function_config.meta.namespace.clone()),
            })
            .await
            .into_iter()
            .next();
        if existing.is_some() {
            logger.debug("Function record exists, redeploying");
        }

        // commit point: from here on every failure is recorded on the record
        self.enter_phase(&logger, DeployPhase::Building);
        self.store.begin_function_build(&function_config).await?;

        match self
            .run_to_ready(&function_config, creation_state_updated, &logger)
            .await
        {
            Ok(result) => {
                self.enter_phase(&logger, DeployPhase::Ready);
                Ok(result)
            }
            Err(err) => {
                self.enter_phase(&logger, DeployPhase::Failed);
                self.report_failure(&function_config, &err, &logger).await;
                Err(err)
            }
        }
    }

    /// Steps between the building commit and the ready upsert.
    async fn run_to_ready(
        &self,
        config: &FunctionConfig,
        creation_state_updated: Option<oneshot::Sender<()>>,
        logger: &DeployLogStream,
    ) -> Result<CreateFunctionResult, PlatformError> {
        let previous_http_port = self
            .delete_previous_containers(config, logger)
            .await
            .map_err(PlatformError::runtime)?;

        // unblock async callers waiting on the record commit
        if let Some(tx) = creation_state_updated {
            let _ = tx.send(());
        }

        let build_result = self
            .builder
            .build(logger, config)
            .await
            .map_err(|source| PlatformError::BuildFailed { source })?;

        self.enter_phase(logger, DeployPhase::Deploying);

        let http_port = self
            .resolve_http_port(&config.spec, previous_http_port, logger)
            .map_err(PlatformError::runtime)?;

        let processor_config_path = self
            .write_processor_config(config, logger)
            .map_err(PlatformError::runtime)?;

        let mut volumes = vec![VolumeBinding {
            host_path: processor_config_path.to_string_lossy().to_string(),
            container_path: PROCESSOR_CONFIG_CONTAINER_PATH.to_string(),
            read_only: true,
        }];
        for volume in &config.spec.volumes {
            volumes.push(VolumeBinding {
                host_path: volume.host_path.clone(),
                container_path: volume.mount_path.clone(),
                read_only: false,
            });
        }

        let run_options = RunContainerOptions {
            container_name: config.meta.container_name(),
            ports: HashMap::from([(http_port, FUNCTION_CONTAINER_HTTP_PORT)]),
            env: config.spec.env.clone(),
            labels: build_labels(config),
            volumes,
            network: config.spec.network.clone(),
        };

        let container_id = self
            .runtime
            .run_container(&build_result.image, run_options)
            .await
            .map_err(|source| PlatformError::DeployFailed {
                message: "Failed to run function container".to_string(),
                source,
            })?;

        let readiness_timeout = if config.spec.readiness_timeout_seconds == 0 {
            self.default_readiness_timeout
        } else {
            Duration::from_secs(config.spec.readiness_timeout_seconds)
        };
        logger.info(format!(
            "Waiting for function to be ready (timeout {}s)",
            readiness_timeout.as_secs()
        ));

        if let Err(source) = self
            .runtime
            .await_container_health(&container_id, readiness_timeout)
            .await
        {
            // the failed container is deliberately left running so it can
            // be inspected; only capture its logs into the message
            let message = match self.runtime.get_container_logs(&container_id).await {
                Ok(logs) => format!("Function wasn't ready in time. Logs:\n{}", logs),
                Err(log_err) => format!(
                    "Function wasn't ready in time (couldn't fetch logs: {:#})",
                    log_err
                ),
            };
            return Err(PlatformError::DeployFailed { message, source });
        }

        self.store
            .create_or_update_function(FunctionRecord {
                config: config.clone(),
                status: FunctionStatus {
                    state: FunctionState::Ready,
                    http_port,
                    ..Default::default()
                },
            })
            .await
            .map_err(PlatformError::runtime)?;

        logger.info(format!(
            "Function deployed, container {} listening on port {}",
            container_id, http_port
        ));

        Ok(CreateFunctionResult {
            port: http_port,
            container_id,
            image: build_result.image,
        })
    }

    /// Remove leftovers of previous deployments of this identity, returning
    /// the host HTTP port the first of them was bound to (0 when none).
    async fn delete_previous_containers(
        &self,
        config: &FunctionConfig,
        logger: &DeployLogStream,
    ) -> Result<u16> {
        logger.info("Cleaning up before deployment");

        let containers = self
            .runtime
            .get_containers(GetContainerOptions {
                name: Some(config.meta.container_name()),
                stopped: true,
                ..Default::default()
            })
            .await
            .context("Failed to look up previous function containers")?;

        if containers.is_empty() {
            return Ok(0);
        }

        logger.info("Function already deployed, removing previous containers");

        let previous_http_port = containers[0].http_host_port().unwrap_or(0);
        for container in &containers {
            self.runtime
                .remove_container(&container.id)
                .await
                .context("Failed to delete previous function container")?;
        }

        Ok(previous_http_port)
    }

    /// Host HTTP port precedence: spec, previous deployment, port broker.
    fn resolve_http_port(
        &self,
        spec: &crate::functionconfig::FunctionSpec,
        previous_http_port: u16,
        logger: &DeployLogStream,
    ) -> Result<u16> {
        if let Some(port) = spec.http_port {
            logger.debug(format!("Configuration specified HTTP port {}", port));
            return Ok(port);
        }

        if previous_http_port != 0 {
            logger.debug(format!(
                "Reusing previous deployment's HTTP port {}",
                previous_http_port
            ));
            return Ok(previous_http_port);
        }

        let port = network::allocate_free_local_port()?;
        logger.debug(format!("Found free local port {}", port));
        Ok(port)
    }

    /// Serialize the function config into a file under /tmp, to be
    /// bind-mounted into the container. /tmp is required for the mount to
    /// work on macOS container runtimes.
    fn write_processor_config(
        &self,
        config: &FunctionConfig,
        logger: &DeployLogStream,
    ) -> Result<PathBuf> {
        let document =
            serde_yaml::to_string(config).context("Failed to serialize processor configuration")?;

        let file = tempfile::Builder::new()
            .prefix("processor-config-")
            .tempfile_in("/tmp")
            .context("Failed to create temporary processor configuration file")?;
        std::fs::write(file.path(), &document)
            .context("Failed to write processor configuration")?;
        let (_, path) = file
            .keep()
            .context("Failed to persist processor configuration file")?;

        logger.debug(format!(
            "Wrote processor configuration to {}:\n{}",
            path.display(),
            document
        ));

        Ok(path)
    }

    /// Record the terminal error state. Failing to record is logged but
    /// never masks the original error.
    async fn report_failure(
        &self,
        config: &FunctionConfig,
        err: &PlatformError,
        logger: &DeployLogStream,
    ) {
        logger.warn(format!("Create function failed: {:#}", err));

        let mut message = format_error_stack(err);
        truncate_status_message(&mut message);

        if let Err(store_err) = self
            .store
            .create_or_update_function(FunctionRecord {
                config: config.clone(),
                status: FunctionStatus {
                    state: FunctionState::Error,
                    message,
                    ..Default::default()
                },
            })
            .await
        {
            warn!(
                function = %config.meta.unique_id(),
                error = %store_err,
                "Failed to record function error state"
            );
        }
    }

    fn enter_phase(&self, logger: &DeployLogStream, phase: DeployPhase) {
        logger.debug(format!("Entering {} phase", phase.as_str()));
    }
}

fn validate(config: &FunctionConfig) -> Result<(), PlatformError> {
    if !config.meta.is_complete() {
        return Err(PlatformError::Validation(
            "Function name and namespace are required".to_string(),
        ));
    }
    if !is_valid_resource_name(&config.meta.name) {
        return Err(PlatformError::Validation(format!(
            "Function name {:?} must be a lowercase alphanumeric DNS label",
            config.meta.name
        )));
    }
    if config.spec.http_port == Some(0) {
        return Err(PlatformError::Validation(
            "Function HTTP port must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn is_valid_resource_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}

/// Container labels for one deploy: the reserved identity set, the spec
/// and annotations as JSON, then user labels. User labels win collisions
/// against reserved keys, with a warning.
fn build_labels(config: &FunctionConfig) -> HashMap<String, String> {
    let mut labels = HashMap::from([
        (LABEL_PLATFORM.to_string(), PLATFORM_NAME.to_string()),
        (
            LABEL_NAMESPACE.to_string(),
            config.meta.namespace.clone(),
        ),
        (LABEL_FUNCTION_NAME.to_string(), config.meta.name.clone()),
        (
            LABEL_FUNCTION_SPEC.to_string(),
            serde_json::to_string(&config.spec).unwrap_or_default(),
        ),
    ]);

    if !config.meta.annotations.is_empty() {
        if let Ok(encoded) = serde_json::to_string(&config.meta.annotations) {
            labels.insert(LABEL_ANNOTATIONS.to_string(), encoded);
        }
    }

    for (key, value) in &config.meta.labels {
        if labels.contains_key(key) {
            warn!(
                function = %config.meta.unique_id(),
                label = %key,
                "User label shadows a reserved platform label"
            );
        }
        labels.insert(key.clone(), value.clone());
    }

    labels
}

/// Flatten the error chain into the status message, bounded in depth.
fn format_error_stack(err: &PlatformError) -> String {
    let mut out = err.to_string();
    let mut source = std::error::Error::source(err);
    let mut depth = 0;
    while let Some(cause) = source {
        if depth >= ERROR_STACK_DEPTH {
            break;
        }
        out.push_str("\nCaused by: ");
        out.push_str(&cause.to_string());
        source = cause.source();
        depth += 1;
    }
    out
}
