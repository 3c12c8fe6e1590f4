//! Per-function deploy log streams.
//!
//! Every create call binds a sink keyed by the function identity. The
//! lifecycle engine tees its progress lines into the sink and into the
//! process log; readers drain pending entries into the function status
//! without blocking the writer.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// One structured deploy log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: String,
    pub message: String,
    #[serde(rename = "timeMs")]
    pub time_ms: u64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Sink of deploy log entries for a single function.
pub struct DeployLogStream {
    function: String,
    entries: Mutex<Vec<LogEntry>>,
}

impl DeployLogStream {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn debug(&self, message: impl Into<String>) {
        let message = message.into();
        debug!(function = %self.function, "{}", message);
        self.push("debug", message);
    }

    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        info!(function = %self.function, "{}", message);
        self.push("info", message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        warn!(function = %self.function, "{}", message);
        self.push("warn", message);
    }

    fn push(&self, level: &str, message: String) {
        self.entries.lock().unwrap().push(LogEntry {
            level: level.to_string(),
            message,
            time_ms: now_ms(),
        });
    }

    /// Remove and return all pending entries.
    pub fn drain(&self) -> Vec<LogEntry> {
        std::mem::take(&mut *self.entries.lock().unwrap())
    }
}

/// Process-wide registry of deploy log streams keyed by function unique id.
#[derive(Default)]
pub struct DeployLogStreams {
    streams: RwLock<HashMap<String, Arc<DeployLogStream>>>,
}

impl DeployLogStreams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a fresh stream for the identity, replacing any previous one.
    pub fn create(&self, unique_id: &str) -> Arc<DeployLogStream> {
        let stream = Arc::new(DeployLogStream::new(unique_id));
        self.streams
            .write()
            .unwrap()
            .insert(unique_id.to_string(), stream.clone());
        stream
    }

    pub fn get(&self, unique_id: &str) -> Option<Arc<DeployLogStream>> {
        self.streams.read().unwrap().get(unique_id).cloned()
    }

    pub fn remove(&self, unique_id: &str) {
        self.streams.write().unwrap().remove(unique_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_removes_entries() {
        let stream = DeployLogStream::new("nuclio:echo");
        stream.info("deploying");
        stream.warn("slow image pull");

        let drained = stream.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].level, "info");
        assert_eq!(drained[0].message, "deploying");
        assert_eq!(drained[1].level, "warn");

        assert!(stream.drain().is_empty());
    }

    #[test]
    fn test_registry_replaces_stream_per_create() {
        let registry = DeployLogStreams::new();
        let first = registry.create("nuclio:echo");
        first.info("first deploy");

        let second = registry.create("nuclio:echo");
        assert!(second.drain().is_empty());

        let current = registry.get("nuclio:echo").unwrap();
        current.info("second deploy");
        assert_eq!(current.drain().len(), 1);
    }

    #[test]
    fn test_registry_remove() {
        let registry = DeployLogStreams::new();
        registry.create("nuclio:echo");
        registry.remove("nuclio:echo");
        assert!(registry.get("nuclio:echo").is_none());
    }
}
