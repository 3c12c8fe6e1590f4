//! Periodic function container health reconciliation.
//!
//! Detects drift between declared ready state and observed container
//! health. The reconciler may only demote ready functions to error; it
//! never promotes, never deletes records and never touches containers —
//! recovery is CreateFunction's sole authority.

use std::{sync::Arc, time::Duration};

use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    docker::ContainerRuntime,
    functionconfig::{FunctionRecord, FunctionState, FunctionStatus},
    store::{FunctionFilter, LocalStore},
};

pub const UNHEALTHY_MESSAGE: &str = "Container is not healthy";

pub struct HealthReconciler {
    store: Arc<LocalStore>,
    runtime: Arc<dyn ContainerRuntime>,
    namespaces: Vec<String>,
    interval: Duration,
    check_timeout: Duration,
}

impl HealthReconciler {
    pub fn new(
        store: Arc<LocalStore>,
        runtime: Arc<dyn ContainerRuntime>,
        namespaces: Vec<String>,
        interval: Duration,
        check_timeout: Duration,
    ) -> Self {
        Self {
            store,
            runtime,
            namespaces,
            interval,
            check_timeout,
        }
    }

    /// Run sweeps until cancelled. Sweeps are serial; when one outruns the
    /// interval the missed ticks are dropped, not queued.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // first tick fires after one full interval
            ticker.reset();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Function health reconciler stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                }
            }
        })
    }

    /// One pass over all ready functions. Failures on individual functions
    /// are logged and never abort the sweep.
    pub async fn sweep(&self) {
        let mut marked_unhealthy = 0usize;
        let mut failed_to_mark = 0usize;

        for namespace in &self.namespaces {
            let functions = self
                .store
                .get_functions(&FunctionFilter {
                    namespace: Some(namespace.clone()),
                    name: None,
                })
                .await;

            for record in functions {
                // only declared-ready functions are checked; building and
                // errored records are left alone
                if record.status.state != FunctionState::Ready {
                    continue;
                }

                let container_name = record.config.meta.container_name();
                match self
                    .runtime
                    .await_container_health(&container_name, self.check_timeout)
                    .await
                {
                    Ok(()) => {
                        debug!(
                            function = %record.unique_id(),
                            container = %container_name,
                            "Function container is healthy"
                        );
                    }
                    Err(err) => {
                        warn!(
                            function = %record.unique_id(),
                            container = %container_name,
                            error = format!("{:#}", err),
                            "Function container is not healthy, marking function as errored"
                        );
                        if self.mark_unhealthy(record).await {
                            marked_unhealthy += 1;
                        } else {
                            failed_to_mark += 1;
                        }
                    }
                }
            }
        }

        if marked_unhealthy > 0 {
            info!(count = marked_unhealthy, "Marked functions as unhealthy");
        }
        if failed_to_mark > 0 {
            warn!(count = failed_to_mark, "Failed to mark functions as unhealthy");
        }
    }

    async fn mark_unhealthy(&self, mut record: FunctionRecord) -> bool {
        record.status = FunctionStatus {
            state: FunctionState::Error,
            message: UNHEALTHY_MESSAGE.to_string(),
            ..Default::default()
        };
        let unique_id = record.unique_id();
        match self.store.create_or_update_function(record).await {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    function = %unique_id,
                    error = %err,
                    "Failed to record unhealthy function state"
                );
                false
            }
        }
    }
}
