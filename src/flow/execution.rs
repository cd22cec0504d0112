use std::cmp::Ordering;

use serde::Serialize;

use crate::status::FlowExecutionStatus;

/// Outcome of running a flow: the last state executed and its status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowExecution {
    pub name: String,
    pub status: FlowExecutionStatus,
}

impl FlowExecution {
    pub fn new(name: impl Into<String>, status: FlowExecutionStatus) -> Self {
        Self {
            name: name.into(),
            status,
        }
    }
}

impl PartialOrd for FlowExecution {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FlowExecution {
    fn cmp(&self, other: &Self) -> Ordering {
        self.status
            .cmp(&other.status)
            .then_with(|| self.name.cmp(&other.name))
    }
}

/// Folds the outcomes of parallel branches into one status.
pub trait FlowExecutionAggregator: Send + Sync {
    fn aggregate(&self, executions: &[FlowExecution]) -> FlowExecutionStatus;
}

/// Keeps the highest ranked status, UNKNOWN when there is nothing to
/// aggregate. Commutative, so branch completion order does not matter.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaxValueFlowExecutionAggregator;

impl FlowExecutionAggregator for MaxValueFlowExecutionAggregator {
    fn aggregate(&self, executions: &[FlowExecution]) -> FlowExecutionStatus {
        executions
            .iter()
            .map(|e| &e.status)
            .max()
            .cloned()
            .unwrap_or_else(FlowExecutionStatus::unknown)
    }
}
