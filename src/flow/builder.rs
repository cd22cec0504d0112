use std::collections::HashSet;
use std::sync::Arc;

use super::simple::SimpleFlow;
use super::state::{EndState, State, StepState};
use super::transition::StateTransition;
use crate::error::Result;
use crate::status::FlowExecutionStatus;
use crate::step::Step;

/// Fluent construction of a [`SimpleFlow`].
///
/// ```text
/// FlowBuilder::new("job")
///     .start(load)
///     .on("FAILED").to(cleanup)
///     .from(load).on("*").to(report)
///     .build()
/// ```
///
/// States left without an outgoing transition end the flow on any exit code.
pub struct FlowBuilder {
    name: String,
    states: Vec<Arc<dyn State>>,
    names: HashSet<String>,
    transitions: Vec<StateTransition>,
    current: Option<String>,
    start: Option<String>,
    end_count: usize,
}

impl FlowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            states: Vec::new(),
            names: HashSet::new(),
            transitions: Vec::new(),
            current: None,
            start: None,
            end_count: 0,
        }
    }

    fn add_state(&mut self, state: Arc<dyn State>) -> String {
        let name = state.name().to_string();
        if self.names.insert(name.clone()) {
            self.states.push(state);
        }
        name
    }

    fn add_transition(&mut self, pattern: &str, next: Option<String>) {
        if let Some(current) = &self.current {
            let transition = match next {
                Some(next) => StateTransition::new(current.clone(), pattern, next),
                None => StateTransition::end(current.clone(), pattern),
            };
            self.transitions.push(transition);
        }
    }

    fn end_state(&mut self, status: FlowExecutionStatus, abandon: bool) -> Arc<dyn State> {
        self.end_count += 1;
        let name = format!("{}.{}{}", self.name, status.name(), self.end_count);
        Arc::new(EndState::new(name, status).with_abandon(abandon))
    }

    /// Sets the explicit start state and makes it current.
    pub fn start(mut self, state: Arc<dyn State>) -> Self {
        let name = self.add_state(state);
        self.start = Some(name.clone());
        self.current = Some(name);
        self
    }

    pub fn start_step(self, step: Arc<dyn Step>) -> Self {
        self.start(Arc::new(StepState::new(step)))
    }

    /// Unconditional transition from the current state to `state`.
    pub fn next(mut self, state: Arc<dyn State>) -> Self {
        if self.current.is_none() {
            return self.start(state);
        }
        let name = self.add_state(state);
        self.add_transition(StateTransition::WILDCARD, Some(name.clone()));
        self.current = Some(name);
        self
    }

    pub fn next_step(self, step: Arc<dyn Step>) -> Self {
        self.next(Arc::new(StepState::new(step)))
    }

    /// Makes a state current without adding a transition to it.
    pub fn from(mut self, state: Arc<dyn State>) -> Self {
        let name = self.add_state(state);
        self.current = Some(name);
        self
    }

    pub fn on(self, pattern: impl Into<String>) -> TransitionBuilder {
        TransitionBuilder {
            builder: self,
            pattern: pattern.into(),
        }
    }

    pub fn build(mut self) -> Result<SimpleFlow> {
        let routed: HashSet<String> = self
            .transitions
            .iter()
            .map(|t| t.state_name().to_string())
            .collect();
        for state in &self.states {
            if !routed.contains(state.name()) {
                self.transitions
                    .push(StateTransition::end(state.name(), StateTransition::WILDCARD));
            }
        }
        SimpleFlow::new(self.name, self.states, self.transitions, self.start.as_deref())
    }
}

/// The pending `on(pattern)` of a [`FlowBuilder`].
pub struct TransitionBuilder {
    builder: FlowBuilder,
    pattern: String,
}

impl TransitionBuilder {
    /// Routes to `state`, which becomes current.
    pub fn to(mut self, state: Arc<dyn State>) -> FlowBuilder {
        let name = self.builder.add_state(state);
        self.builder.add_transition(&self.pattern, Some(name.clone()));
        self.builder.current = Some(name);
        self.builder
    }

    pub fn to_step(self, step: Arc<dyn Step>) -> FlowBuilder {
        self.to(Arc::new(StepState::new(step)))
    }

    /// Ends the flow with the matched exit code as its status.
    pub fn end(mut self) -> FlowBuilder {
        self.builder.add_transition(&self.pattern, None);
        self.builder
    }

    /// Ends the flow with `status`, which also becomes the job's exit code.
    pub fn end_with(self, status: impl Into<String>) -> FlowBuilder {
        let status = FlowExecutionStatus::new(status.into());
        self.route_to_end(status, false)
    }

    pub fn fail(self) -> FlowBuilder {
        self.route_to_end(FlowExecutionStatus::failed(), false)
    }

    pub fn stop(self) -> FlowBuilder {
        self.route_to_end(FlowExecutionStatus::stopped(), false)
    }

    /// Stops the job; a restart continues at `restart`. The step that led
    /// here is abandoned so the restart does not replay it.
    pub fn stop_and_restart(mut self, restart: Arc<dyn State>) -> FlowBuilder {
        let end = self.builder.end_state(FlowExecutionStatus::stopped(), true);
        let end_name = self.builder.add_state(end);
        self.builder.add_transition(&self.pattern, Some(end_name.clone()));
        let current = self.builder.current.replace(end_name);
        let mut builder = self.builder.next(restart);
        builder.current = current;
        builder
    }

    fn route_to_end(mut self, status: FlowExecutionStatus, abandon: bool) -> FlowBuilder {
        let end = self.builder.end_state(status, abandon);
        let end_name = self.builder.add_state(end);
        self.builder.add_transition(&self.pattern, Some(end_name));
        self.builder
    }
}
