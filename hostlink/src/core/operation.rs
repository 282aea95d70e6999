//! Bookkeeping for one discovery or execution run.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Discovery,
    Execution,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Discovery => f.write_str("discovery"),
            Self::Execution => f.write_str("execution"),
        }
    }
}

/// Completion state of a single operation.
///
/// `completed` only moves false -> true, and only through [`Self::try_complete`],
/// so exactly one caller ever wins the right to deliver the completion callback.
#[derive(Debug)]
pub struct OperationState {
    kind: OperationKind,
    completed: AtomicBool,
}

impl OperationState {
    pub fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            completed: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Mark the operation completed. Returns `true` for the first caller only.
    pub fn try_complete(&self) -> bool {
        self.completed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
