//! The local platform facade.
//!
//! Wires the record store, the container runtime, the lifecycle engine and
//! the health reconciler together, and exposes CRUD for functions,
//! projects and function events.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    builder::ImageBuilder,
    config::PlatformConfig,
    deployer::{CreateFunctionOptions, CreateFunctionResult, FunctionDeployer},
    docker::{ContainerRuntime, GetContainerOptions},
    errors::PlatformError,
    functionconfig::{
        FunctionConfig, FunctionEventConfig, FunctionEventMeta, FunctionMeta, FunctionRecord,
        ProjectConfig, ProjectMeta, LABEL_FUNCTION_NAME, LABEL_NAMESPACE, LABEL_PLATFORM,
        LABEL_PROJECT_NAME, PLATFORM_NAME,
    },
    logstream::DeployLogStreams,
    network,
    reconciler::HealthReconciler,
    store::{FunctionEventFilter, FunctionFilter, LocalStore, ProjectFilter},
};

#[derive(Debug, Clone, Default)]
pub struct GetFunctionsOptions {
    pub name: Option<String>,
    pub namespace: Option<String>,
    /// Label selectors; only `nuclio.io/project-name` is honored and is
    /// applied client-side.
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct UpdateFunctionOptions {
    pub function_config: FunctionConfig,
}

#[derive(Debug, Clone)]
pub struct DeleteFunctionOptions {
    pub meta: FunctionMeta,
}

pub struct Platform {
    config: PlatformConfig,
    store: Arc<LocalStore>,
    runtime: Arc<dyn ContainerRuntime>,
    deployer: FunctionDeployer,
    log_streams: Arc<DeployLogStreams>,
    reconciler: Arc<HealthReconciler>,
    reconciler_cancel: CancellationToken,
    reconciler_handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Platform {
    pub async fn new(
        config: PlatformConfig,
        runtime: Arc<dyn ContainerRuntime>,
        builder: Arc<dyn ImageBuilder>,
    ) -> anyhow::Result<Self> {
        let store = Arc::new(LocalStore::new(&config.store_path).await?);
        let log_streams = Arc::new(DeployLogStreams::new());

        let deployer = FunctionDeployer::new(
            store.clone(),
            runtime.clone(),
            builder,
            log_streams.clone(),
            Duration::from_secs(config.default_readiness_timeout_secs),
        );

        let reconciler = Arc::new(HealthReconciler::new(
            store.clone(),
            runtime.clone(),
            vec![network::DEFAULT_NAMESPACE.to_string()],
            Duration::from_secs(config.healthiness.interval_secs),
            Duration::from_secs(config.healthiness.timeout_secs),
        ));

        let reconciler_cancel = CancellationToken::new();
        let reconciler_handle = if config.healthiness.enabled {
            debug!("Igniting function container health reconciler");
            Some(reconciler.clone().spawn(reconciler_cancel.clone()))
        } else {
            None
        };

        Ok(Self {
            config,
            store,
            runtime,
            deployer,
            log_streams,
            reconciler,
            reconciler_cancel,
            reconciler_handle: tokio::sync::Mutex::new(reconciler_handle),
        })
    }

    pub async fn create_function(
        &self,
        options: CreateFunctionOptions,
    ) -> Result<CreateFunctionResult, PlatformError> {
        self.deployer.create_function(options).await
    }

    /// The local backend redeploys through `create_function`; update is a
    /// recorded no-op.
    pub async fn update_function(
        &self,
        options: UpdateFunctionOptions,
    ) -> Result<(), PlatformError> {
        debug!(
            function = %options.function_config.meta.unique_id(),
            "Update function is a no-op on the local platform"
        );
        Ok(())
    }

    pub async fn delete_function(
        &self,
        options: DeleteFunctionOptions,
    ) -> Result<(), PlatformError> {
        let meta = &options.meta;

        // record first; missing records propagate as not-found, other store
        // failures do not block cleanup of events and containers
        match self.store.delete_function(meta).await {
            Ok(()) => {}
            Err(PlatformError::NotFound) => return Err(PlatformError::NotFound),
            Err(err) => {
                warn!(
                    function = %meta.unique_id(),
                    error = %err,
                    "Failed to delete function from store"
                );
            }
        }

        self.delete_function_events_for(meta).await?;

        let containers = self
            .runtime
            .get_containers(GetContainerOptions {
                labels: HashMap::from([
                    (LABEL_PLATFORM.to_string(), PLATFORM_NAME.to_string()),
                    (LABEL_NAMESPACE.to_string(), meta.namespace.clone()),
                    (LABEL_FUNCTION_NAME.to_string(), meta.name.clone()),
                ]),
                stopped: true,
                ..Default::default()
            })
            .await
            .map_err(PlatformError::runtime)?;

        // zero containers is fine: delete is idempotent
        for container in &containers {
            self.runtime
                .remove_container(&container.id)
                .await
                .map_err(PlatformError::runtime)?;
        }

        self.log_streams.remove(&meta.unique_id());

        info!(function = %meta.unique_id(), "Function deleted");
        Ok(())
    }

    /// Delete the function's events concurrently; the first failure aborts
    /// the remaining deletions and is returned.
    async fn delete_function_events_for(
        &self,
        meta: &FunctionMeta,
    ) -> Result<(), PlatformError> {
        let events = self
            .store
            .get_function_events(&FunctionEventFilter {
                namespace: Some(meta.namespace.clone()),
                labels: HashMap::from([(
                    LABEL_FUNCTION_NAME.to_string(),
                    meta.name.clone(),
                )]),
                ..Default::default()
            })
            .await;

        if events.is_empty() {
            return Ok(());
        }
        info!(
            function = %meta.unique_id(),
            count = events.len(),
            "Deleting function events"
        );

        let mut join_set = JoinSet::new();
        for event in events {
            let store = self.store.clone();
            join_set.spawn(async move { store.delete_function_event(&event.meta).await });
        }

        let mut first_error: Option<PlatformError> = None;
        while let Some(result) = join_set.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                        join_set.abort_all();
                    }
                }
                Err(join_err) => {
                    if !join_err.is_cancelled() && first_error.is_none() {
                        first_error = Some(PlatformError::runtime(anyhow::Error::new(join_err)));
                        join_set.abort_all();
                    }
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Read records matching the filter, applying the project label
    /// client-side and draining any pending deploy logs into the status.
    pub async fn get_functions(
        &self,
        options: &GetFunctionsOptions,
    ) -> Result<Vec<FunctionRecord>, PlatformError> {
        let project_name = options.labels.get(LABEL_PROJECT_NAME);

        let records = self
            .store
            .get_functions(&FunctionFilter {
                name: options.name.clone(),
                namespace: options.namespace.clone(),
            })
            .await;

        let mut functions = Vec::with_capacity(records.len());
        for mut record in records {
            if let Some(project_name) = project_name {
                if record.config.meta.labels.get(LABEL_PROJECT_NAME) != Some(project_name) {
                    continue;
                }
            }

            if let Some(stream) = self.log_streams.get(&record.config.meta.unique_id()) {
                record.status.logs.extend(stream.drain());
            }

            functions.push(record);
        }

        Ok(functions)
    }

    pub async fn create_project(&self, project: ProjectConfig) -> Result<(), PlatformError> {
        self.store
            .create_or_update_project(project)
            .await
            .map_err(PlatformError::runtime)
    }

    pub async fn update_project(&self, project: ProjectConfig) -> Result<(), PlatformError> {
        self.store
            .create_or_update_project(project)
            .await
            .map_err(PlatformError::runtime)
    }

    /// A project can only be deleted once no function carries its label.
    pub async fn delete_project(&self, meta: &ProjectMeta) -> Result<(), PlatformError> {
        let functions = self
            .store
            .get_functions(&FunctionFilter {
                namespace: Some(meta.namespace.clone()),
                name: None,
            })
            .await;
        if functions
            .iter()
            .any(|f| f.config.meta.labels.get(LABEL_PROJECT_NAME) == Some(&meta.name))
        {
            return Err(PlatformError::Conflict {
                namespace: meta.namespace.clone(),
                name: meta.name.clone(),
                reason: "project still contains functions".to_string(),
            });
        }

        self.store.delete_project(meta).await
    }

    pub async fn get_projects(
        &self,
        filter: &ProjectFilter,
    ) -> Result<Vec<ProjectConfig>, PlatformError> {
        Ok(self.store.get_projects(filter).await)
    }

    pub async fn create_function_event(
        &self,
        event: FunctionEventConfig,
    ) -> Result<(), PlatformError> {
        self.store
            .create_or_update_function_event(event)
            .await
            .map_err(PlatformError::runtime)
    }

    pub async fn update_function_event(
        &self,
        event: FunctionEventConfig,
    ) -> Result<(), PlatformError> {
        self.store
            .create_or_update_function_event(event)
            .await
            .map_err(PlatformError::runtime)
    }

    pub async fn delete_function_event(
        &self,
        meta: &FunctionEventMeta,
    ) -> Result<(), PlatformError> {
        self.store.delete_function_event(meta).await
    }

    pub async fn get_function_events(
        &self,
        filter: &FunctionEventFilter,
    ) -> Result<Vec<FunctionEventConfig>, PlatformError> {
        Ok(self.store.get_function_events(filter).await)
    }

    /// Run one reconciliation sweep immediately, regardless of the timer.
    pub async fn check_function_health(&self) {
        self.reconciler.sweep().await;
    }

    pub fn get_name(&self) -> &'static str {
        PLATFORM_NAME
    }

    pub fn get_namespaces(&self) -> Vec<String> {
        vec![network::DEFAULT_NAMESPACE.to_string()]
    }

    pub fn resolve_default_namespace(&self, namespace: &str) -> String {
        network::resolve_default_namespace(namespace)
    }

    pub fn get_external_ip_addresses(&self) -> Vec<String> {
        network::external_ip_addresses(&self.config.external_ip_addresses)
    }

    pub fn get_default_invoke_ip_addresses(&self) -> Vec<String> {
        network::default_invoke_ip_addresses()
    }

    /// Stop background work. Idempotent.
    pub async fn close(&self) {
        self.reconciler_cancel.cancel();
        if let Some(handle) = self.reconciler_handle.lock().await.take() {
            let _ = handle.await;
        }
    }
}
