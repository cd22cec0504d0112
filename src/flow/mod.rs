//! Job flow state machine.
//!
//! A [`Flow`] is a graph of [`State`]s routed by [`StateTransition`]s
//! matched against each state's exit code. Errors raised while handling a
//! state propagate out of [`Flow::start`] unchanged; the job decides what
//! they mean.

pub mod builder;
pub mod definition;
pub mod execution;
pub mod executor;
pub mod simple;
pub mod state;
pub mod transition;

pub use builder::{FlowBuilder, TransitionBuilder};
pub use definition::{FlowDefinition, FlowRegistry, StateDefinition, StateKind, TransitionDefinition};
pub use execution::{FlowExecution, FlowExecutionAggregator, MaxValueFlowExecutionAggregator};
pub use executor::{FlowExecutor, JobFlowExecutor};
pub use simple::{Flow, SimpleFlow};
pub use state::{
    DecisionState, EndState, FlowState, JobExecutionDecider, PauseState, SplitState, State,
    StepState,
};
pub use transition::StateTransition;
