//! File-backed record store.
//!
//! Keeps function, project and function-event records in memory behind a
//! mutex and persists the whole map to a JSON file after every mutation.
//! All upserts linearize through the mutex, which gives read-your-writes
//! within the process and per-identity ordering across concurrent callers.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    errors::PlatformError,
    functionconfig::{
        FunctionConfig, FunctionEventConfig, FunctionEventMeta, FunctionMeta, FunctionRecord,
        FunctionState, FunctionStatus, ProjectConfig, ProjectMeta,
    },
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreContents {
    #[serde(default)]
    functions: HashMap<String, FunctionRecord>,
    #[serde(default)]
    projects: HashMap<String, ProjectConfig>,
    #[serde(default)]
    function_events: HashMap<String, FunctionEventConfig>,
}

#[derive(Debug, Clone, Default)]
pub struct FunctionFilter {
    pub name: Option<String>,
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ProjectFilter {
    pub name: Option<String>,
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FunctionEventFilter {
    pub name: Option<String>,
    pub namespace: Option<String>,
    /// All given labels must match the event's labels.
    pub labels: HashMap<String, String>,
}

pub struct LocalStore {
    path: PathBuf,
    state: Mutex<StoreContents>,
}

impl LocalStore {
    /// Open the store at `path`, loading existing contents if present.
    /// A corrupt file is logged and replaced with a fresh store.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            match Self::load_from_file(&path).await {
                Ok(contents) => {
                    info!(
                        path = %path.display(),
                        functions = contents.functions.len(),
                        projects = contents.projects.len(),
                        function_events = contents.function_events.len(),
                        "Loaded local store"
                    );
                    contents
                }
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to load local store, starting fresh"
                    );
                    StoreContents::default()
                }
            }
        } else {
            StoreContents::default()
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    async fn load_from_file(path: &Path) -> Result<StoreContents> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .context("Failed to read store file")?;
        serde_json::from_str(&contents).context("Failed to parse store file")
    }

    async fn save_to_file(&self) -> Result<()> {
        let state = self.state.lock().await;
        let contents = serde_json::to_string_pretty(&*state).context("Failed to serialize store")?;
        tokio::fs::write(&self.path, contents)
            .await
            .context("Failed to write store file")?;
        Ok(())
    }

    pub async fn create_or_update_function(&self, record: FunctionRecord) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            state.functions.insert(record.unique_id(), record);
        }
        self.save_to_file().await
    }

    /// Commit a new deployment for the identity by upserting the record in
    /// the building state.
    ///
    /// Compare-and-swap: refuses while another deployment for the same
    /// identity is already in flight, so a racing second create fails fast
    /// with a retryable conflict instead of silently stacking.
    pub async fn begin_function_build(
        &self,
        config: &FunctionConfig,
    ) -> Result<(), PlatformError> {
        {
            let mut state = self.state.lock().await;
            let unique_id = config.meta.unique_id();
            if let Some(existing) = state.functions.get(&unique_id) {
                if existing.status.state == FunctionState::Building {
                    return Err(PlatformError::Conflict {
                        namespace: config.meta.namespace.clone(),
                        name: config.meta.name.clone(),
                        reason: "a deployment is already in progress".to_string(),
                    });
                }
            }
            state.functions.insert(
                unique_id,
                FunctionRecord {
                    config: config.clone(),
                    status: FunctionStatus {
                        state: FunctionState::Building,
                        ..Default::default()
                    },
                },
            );
        }
        self.save_to_file().await.map_err(PlatformError::runtime)
    }

    pub async fn get_functions(&self, filter: &FunctionFilter) -> Vec<FunctionRecord> {
        let state = self.state.lock().await;
        state
            .functions
            .values()
            .filter(|record| {
                matches_opt(&filter.name, &record.config.meta.name)
                    && matches_opt(&filter.namespace, &record.config.meta.namespace)
            })
            .cloned()
            .collect()
    }

    pub async fn delete_function(&self, meta: &FunctionMeta) -> Result<(), PlatformError> {
        {
            let mut state = self.state.lock().await;
            if state.functions.remove(&meta.unique_id()).is_none() {
                return Err(PlatformError::NotFound);
            }
        }
        self.save_to_file().await.map_err(PlatformError::runtime)
    }

    pub async fn create_or_update_project(&self, project: ProjectConfig) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            state.projects.insert(project.meta.unique_id(), project);
        }
        self.save_to_file().await
    }

    pub async fn get_projects(&self, filter: &ProjectFilter) -> Vec<ProjectConfig> {
        let state = self.state.lock().await;
        state
            .projects
            .values()
            .filter(|project| {
                matches_opt(&filter.name, &project.meta.name)
                    && matches_opt(&filter.namespace, &project.meta.namespace)
            })
            .cloned()
            .collect()
    }

    pub async fn delete_project(&self, meta: &ProjectMeta) -> Result<(), PlatformError> {
        {
            let mut state = self.state.lock().await;
            if state.projects.remove(&meta.unique_id()).is_none() {
                return Err(PlatformError::NotFound);
            }
        }
        self.save_to_file().await.map_err(PlatformError::runtime)
    }

    pub async fn create_or_update_function_event(
        &self,
        event: FunctionEventConfig,
    ) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            state.function_events.insert(event.meta.unique_id(), event);
        }
        self.save_to_file().await
    }

    pub async fn get_function_events(
        &self,
        filter: &FunctionEventFilter,
    ) -> Vec<FunctionEventConfig> {
        let state = self.state.lock().await;
        state
            .function_events
            .values()
            .filter(|event| {
                matches_opt(&filter.name, &event.meta.name)
                    && matches_opt(&filter.namespace, &event.meta.namespace)
                    && filter
                        .labels
                        .iter()
                        .all(|(k, v)| event.meta.labels.get(k) == Some(v))
            })
            .cloned()
            .collect()
    }

    pub async fn delete_function_event(
        &self,
        meta: &FunctionEventMeta,
    ) -> Result<(), PlatformError> {
        {
            let mut state = self.state.lock().await;
            if state.function_events.remove(&meta.unique_id()).is_none() {
                return Err(PlatformError::NotFound);
            }
        }
        self.save_to_file().await.map_err(PlatformError::runtime)
    }
}

fn matches_opt(wanted: &Option<String>, actual: &str) -> bool {
    match wanted {
        Some(wanted) if !wanted.is_empty() => wanted == actual,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn record(namespace: &str, name: &str, state: FunctionState) -> FunctionRecord {
        FunctionRecord {
            config: FunctionConfig {
                meta: FunctionMeta::new(namespace, name),
                ..Default::default()
            },
            status: FunctionStatus {
                state,
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_upsert_get_delete_roundtrip() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path().join("store.json")).await.unwrap();

        store
            .create_or_update_function(record("nuclio", "echo", FunctionState::Ready))
            .await
            .unwrap();

        let all = store.get_functions(&FunctionFilter::default()).await;
        assert_eq!(all.len(), 1);

        let by_name = store
            .get_functions(&FunctionFilter {
                name: Some("echo".to_string()),
                namespace: Some("nuclio".to_string()),
            })
            .await;
        assert_eq!(by_name.len(), 1);
        assert_eq!(by_name[0].status.state, FunctionState::Ready);

        store
            .delete_function(&FunctionMeta::new("nuclio", "echo"))
            .await
            .unwrap();
        assert!(store.get_functions(&FunctionFilter::default()).await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_missing_function_is_not_found() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path().join("store.json")).await.unwrap();

        let err = store
            .delete_function(&FunctionMeta::new("nuclio", "ghost"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_begin_build_rejects_concurrent_build() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path().join("store.json")).await.unwrap();

        let config = FunctionConfig {
            meta: FunctionMeta::new("nuclio", "echo"),
            ..Default::default()
        };

        store.begin_function_build(&config).await.unwrap();

        let err = store.begin_function_build(&config).await.unwrap_err();
        assert!(matches!(err, PlatformError::Conflict { .. }));
        assert!(err.is_retryable());

        // once the first deployment reaches a terminal state, a new build
        // may begin
        store
            .create_or_update_function(record("nuclio", "echo", FunctionState::Error))
            .await
            .unwrap();
        store.begin_function_build(&config).await.unwrap();
    }

    #[tokio::test]
    async fn test_contents_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");

        {
            let store = LocalStore::new(&path).await.unwrap();
            store
                .create_or_update_function(record("nuclio", "echo", FunctionState::Ready))
                .await
                .unwrap();
            store
                .create_or_update_project(ProjectConfig {
                    meta: ProjectMeta {
                        name: "default".to_string(),
                        namespace: "nuclio".to_string(),
                        ..Default::default()
                    },
                    ..Default::default()
                })
                .await
                .unwrap();
        }

        let store = LocalStore::new(&path).await.unwrap();
        assert_eq!(store.get_functions(&FunctionFilter::default()).await.len(), 1);
        assert_eq!(store.get_projects(&ProjectFilter::default()).await.len(), 1);
    }

    #[tokio::test]
    async fn test_function_event_label_filter() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path().join("store.json")).await.unwrap();

        for (event_name, function_name) in [("ping", "echo"), ("pong", "echo"), ("other", "hello")]
        {
            store
                .create_or_update_function_event(FunctionEventConfig {
                    meta: FunctionEventMeta {
                        name: event_name.to_string(),
                        namespace: "nuclio".to_string(),
                        labels: HashMap::from([(
                            crate::functionconfig::LABEL_FUNCTION_NAME.to_string(),
                            function_name.to_string(),
                        )]),
                    },
                    ..Default::default()
                })
                .await
                .unwrap();
        }

        let echo_events = store
            .get_function_events(&FunctionEventFilter {
                namespace: Some("nuclio".to_string()),
                labels: HashMap::from([(
                    crate::functionconfig::LABEL_FUNCTION_NAME.to_string(),
                    "echo".to_string(),
                )]),
                ..Default::default()
            })
            .await;
        assert_eq!(echo_events.len(), 2);
    }
}
