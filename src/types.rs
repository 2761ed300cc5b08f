//! RayOS Dataflow
//!
//! Core data structures shared by the scheduler, resources and queues.

use crate::error::{DataflowError, DataflowResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Unique identifier for a buffer or pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId(pub Uuid);

impl ResourceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ResourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a submitted work item.
///
/// Ids are handed out in submission order by the owning scheduler, so
/// comparing two ids tells which item was submitted first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkItemId(pub u64);

impl std::fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic id source, one per scheduler
#[derive(Debug, Default)]
pub(crate) struct IdSequence(AtomicU64);

impl IdSequence {
    pub(crate) fn next(&self) -> WorkItemId {
        WorkItemId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// Work item lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkItemState {
    /// Waiting on conflicting predecessors
    Pending,
    /// All predecessors finished, waiting for a worker
    Ready,
    Running,
    Done,
    Failed,
}

impl WorkItemState {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkItemState::Done | WorkItemState::Failed)
    }
}

/// Which kind of resource an access is made against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceKind {
    Buffer,
    Pipe,
    /// Anonymous per-item scratch memory, not backed by a resource
    Scratch,
}

/// Runtime configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Log kernel start/stop at info level instead of trace
    pub trace_kernels: bool,
    /// Prefix used to name worker threads
    pub thread_name_prefix: String,
    /// Maximum number of work items running at once (0 = unbounded).
    ///
    /// Blocking pipe endpoints must run concurrently with their counterpart;
    /// a bound below the number of live blocking endpoints can deadlock.
    pub max_running_items: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            trace_kernels: false,
            thread_name_prefix: "dataflow-worker".to_string(),
            max_running_items: 0,
        }
    }
}

impl RuntimeConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(content: &str) -> DataflowResult<Self> {
        toml::from_str(content).map_err(|e| DataflowError::Config(e.to_string()))
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> DataflowResult<Self> {
        let path = path.as_ref();
        log::info!("Loading runtime config from: {}", path.display());
        let content = std::fs::read_to_string(path)
            .map_err(|e| DataflowError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }
}

/// Snapshot of scheduler counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStatistics {
    /// Work items ever submitted
    pub total_items: u64,
    pub completed_items: u64,
    pub failed_items: u64,
    /// Submitted but not yet running
    pub pending_items: u64,
    pub running_items: u64,
    /// Resources with an entry in the outstanding map
    pub tracked_resources: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_item_ids_follow_submission_order() {
        let seq = IdSequence::default();
        let first = seq.next();
        let second = seq.next();
        assert!(first < second);
    }

    #[test]
    fn test_terminal_states() {
        assert!(WorkItemState::Done.is_terminal());
        assert!(WorkItemState::Failed.is_terminal());
        assert!(!WorkItemState::Pending.is_terminal());
        assert!(!WorkItemState::Ready.is_terminal());
        assert!(!WorkItemState::Running.is_terminal());
    }

    #[test]
    fn test_config_defaults_fill_missing_keys() {
        let config = RuntimeConfig::from_toml_str("trace_kernels = true\n").unwrap();
        assert!(config.trace_kernels);
        assert_eq!(config.thread_name_prefix, "dataflow-worker");
        assert_eq!(config.max_running_items, 0);
    }

    #[test]
    fn test_config_rejects_bad_toml() {
        let err = RuntimeConfig::from_toml_str("max_running_items = \"many\"").unwrap_err();
        assert!(matches!(err, DataflowError::Config(_)));
    }
}
