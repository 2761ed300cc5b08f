//! Error types for access validation, pipes and kernel failures.

use crate::access::{AccessMode, AccessTarget};
use crate::types::{ResourceKind, WorkItemId};

pub type DataflowResult<T> = std::result::Result<T, DataflowError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DataflowError {
    /// The (mode, target) pair is not valid for this resource or context
    #[error("invalid access {mode:?}/{target:?} on {kind:?}: {reason}")]
    InvalidAccessTarget {
        mode: AccessMode,
        target: AccessTarget,
        kind: ResourceKind,
        reason: &'static str,
    },

    #[error("range [{offset}, {offset}+{range}) exceeds extent {extent} in dimension {dim}")]
    RangeOutOfBounds {
        dim: usize,
        offset: usize,
        range: usize,
        extent: usize,
    },

    #[error("index {index:?} outside accessor range {range:?}")]
    IndexOutOfBounds { index: Vec<usize>, range: Vec<usize> },

    #[error("extent {extent:?} holds {expected} elements, got {actual}")]
    ExtentMismatch {
        extent: Vec<usize>,
        expected: usize,
        actual: usize,
    },

    #[error("write through a {mode:?}/{target:?} accessor")]
    ReadOnlyAccess { mode: AccessMode, target: AccessTarget },

    /// Expected outcome of a non-blocking reservation; retry later
    #[error("cannot reserve {requested} pipe slots ({available} available)")]
    ReservationUnavailable { requested: usize, available: usize },

    #[error("resource belongs to a different scheduler")]
    ForeignResource,

    #[error("command group did not set a kernel")]
    EmptyCommandGroup,

    #[error("work item {id} failed: {source}")]
    Kernel {
        id: WorkItemId,
        #[source]
        source: KernelError,
    },

    #[error("{} submitted work item(s) failed", .failures.len())]
    ItemsFailed { failures: Vec<(WorkItemId, KernelError)> },

    #[error("config error: {0}")]
    Config(String),
}

/// Failure reported by a kernel body
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    #[error("{0}")]
    Failed(String),

    #[error("accessor error: {0}")]
    Access(Box<DataflowError>),

    #[error("kernel panicked: {0}")]
    Panicked(String),

    #[error("failed to start worker: {0}")]
    Spawn(String),
}

impl KernelError {
    pub fn failed(message: impl Into<String>) -> Self {
        KernelError::Failed(message.into())
    }
}

impl From<DataflowError> for KernelError {
    fn from(err: DataflowError) -> Self {
        KernelError::Access(Box::new(err))
    }
}

/// Collapse collected failures into a single result
pub(crate) fn aggregate(failures: Vec<(WorkItemId, KernelError)>) -> DataflowResult<()> {
    if failures.is_empty() {
        Ok(())
    } else {
        Err(DataflowError::ItemsFailed { failures })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessor_errors_convert_into_kernel_errors() {
        fn body() -> Result<(), KernelError> {
            Err(DataflowError::IndexOutOfBounds {
                index: vec![4],
                range: vec![3],
            })?;
            Ok(())
        }

        assert!(matches!(body(), Err(KernelError::Access(_))));
    }

    #[test]
    fn test_aggregate() {
        assert!(aggregate(Vec::new()).is_ok());

        let err = aggregate(vec![(WorkItemId(3), KernelError::failed("boom"))]).unwrap_err();
        assert_eq!(err.to_string(), "1 submitted work item(s) failed");
    }
}
