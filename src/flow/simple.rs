use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info};

use super::execution::FlowExecution;
use super::executor::FlowExecutor;
use super::state::State;
use super::transition::StateTransition;
use crate::error::{BatchError, Result};
use crate::status::FlowExecutionStatus;

/// A named graph of states that can be started or resumed at a state.
pub trait Flow: Send + Sync {
    fn name(&self) -> &str;

    fn start(&self, executor: &Arc<dyn FlowExecutor>) -> Result<FlowExecution>;

    /// Runs from `state_name` until an end transition is taken or a state
    /// reports PAUSED.
    fn resume(&self, state_name: &str, executor: &Arc<dyn FlowExecutor>) -> Result<FlowExecution>;

    fn state(&self, name: &str) -> Option<Arc<dyn State>>;

    fn state_names(&self) -> Vec<String>;
}

/// A flow whose routing is a validated table of [`StateTransition`]s.
pub struct SimpleFlow {
    name: String,
    start: String,
    states: HashMap<String, Arc<dyn State>>,
    order: Vec<String>,
    transitions: HashMap<String, Vec<StateTransition>>,
}

impl std::fmt::Debug for SimpleFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleFlow")
            .field("name", &self.name)
            .field("start", &self.start)
            .field("states", &self.order)
            .finish()
    }
}

impl SimpleFlow {
    /// Validates the transition table and builds the flow.
    ///
    /// Without an explicit `start`, the start state is the single state that
    /// is not the target of any transition.
    pub fn new(
        name: impl Into<String>,
        states: Vec<Arc<dyn State>>,
        transitions: Vec<StateTransition>,
        start: Option<&str>,
    ) -> Result<Self> {
        let name = name.into();
        let config_error = |msg: String| BatchError::FlowConfig(format!("flow {name}: {msg}"));

        if transitions.is_empty() {
            return Err(config_error("no state transitions".to_string()));
        }

        let mut by_name: HashMap<String, Arc<dyn State>> = HashMap::new();
        let mut order = Vec::new();
        for state in states {
            let state_name = state.name().to_string();
            if by_name.insert(state_name.clone(), state).is_some() {
                return Err(config_error(format!("duplicate state {state_name}")));
            }
            order.push(state_name);
        }

        let mut table: HashMap<String, Vec<StateTransition>> = HashMap::new();
        let mut has_end = false;
        for transition in &transitions {
            if !by_name.contains_key(transition.state_name()) {
                return Err(config_error(format!("unknown state in [{transition}]")));
            }
            match transition.next() {
                Some(next) if !by_name.contains_key(next) => {
                    return Err(config_error(format!("missing state for [{transition}]")));
                }
                Some(_) => {}
                None => has_end = true,
            }
            let routes = table.entry(transition.state_name().to_string()).or_default();
            if routes.iter().any(|t| t.pattern() == transition.pattern()) {
                return Err(config_error(format!(
                    "state {} has two transitions on {}",
                    transition.state_name(),
                    transition.pattern()
                )));
            }
            routes.push(transition.clone());
        }
        if !has_end {
            return Err(config_error(
                "no end transition; at least one transition must have no next state".to_string(),
            ));
        }
        if let Some(orphan) = order.iter().find(|s| !table.contains_key(*s)) {
            return Err(config_error(format!("state {orphan} has no transitions")));
        }
        for routes in table.values_mut() {
            routes.sort_by(|a, b| a.specificity(b));
        }

        let start = match start {
            Some(start) if by_name.contains_key(start) => start.to_string(),
            Some(start) => {
                return Err(config_error(format!("start state {start} does not exist")));
            }
            None => Self::find_start(&order, &transitions).map_err(config_error)?,
        };

        Ok(Self {
            name,
            start,
            states: by_name,
            order,
            transitions: table,
        })
    }

    fn find_start(
        order: &[String],
        transitions: &[StateTransition],
    ) -> std::result::Result<String, String> {
        let targets: HashSet<&str> = transitions.iter().filter_map(|t| t.next()).collect();
        let candidates: Vec<&String> = order
            .iter()
            .filter(|s| !targets.contains(s.as_str()))
            .collect();
        match candidates.as_slice() {
            [start] => Ok((*start).clone()),
            [] => Err("no start state could be located (every state has incoming links)".to_string()),
            [first, second, ..] => Err(format!(
                "multiple possible start states found: [{first}, {second}]; name one explicitly"
            )),
        }
    }

    pub fn start_state(&self) -> &str {
        &self.start
    }

    pub fn transitions(&self) -> impl Iterator<Item = &StateTransition> {
        self.order
            .iter()
            .filter_map(|s| self.transitions.get(s))
            .flatten()
    }

    /// The state to run after `state_name` ended with `status`, or `None` when
    /// an end transition matched.
    fn next_state(
        &self,
        state_name: &str,
        status: &FlowExecutionStatus,
    ) -> Result<Option<Arc<dyn State>>> {
        let routes = self.transitions.get(state_name).ok_or_else(|| {
            BatchError::FlowExecution(format!(
                "No transitions found in flow={} for state={state_name}",
                self.name
            ))
        })?;
        let Some(transition) = routes.iter().find(|t| t.matches(status.name())) else {
            return Err(BatchError::FlowExecution(format!(
                "Next state not found in flow={} for state={state_name} with exit status={status}",
                self.name
            )));
        };
        let Some(next) = transition.next() else {
            return Ok(None);
        };
        self.states.get(next).cloned().map(Some).ok_or_else(|| {
            BatchError::FlowExecution(format!(
                "Next state not specified in flow={} for next={next}",
                self.name
            ))
        })
    }
}

impl Flow for SimpleFlow {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self, executor: &Arc<dyn FlowExecutor>) -> Result<FlowExecution> {
        self.resume(&self.start, executor)
    }

    fn resume(&self, state_name: &str, executor: &Arc<dyn FlowExecutor>) -> Result<FlowExecution> {
        let mut state = self.state(state_name).ok_or_else(|| {
            BatchError::FlowExecution(format!(
                "State {state_name} not found in flow={}",
                self.name
            ))
        })?;
        info!(flow = %self.name, state = state_name, "flow running");

        loop {
            let status = state.handle(executor)?;
            debug!(flow = %self.name, state = state.name(), status = %status, "state finished");
            let halt = status.is_paused() || (state.is_end_state() && status.is_stop());
            if halt {
                return Ok(FlowExecution::new(state.name(), status));
            }
            match self.next_state(state.name(), &status)? {
                Some(next) => state = next,
                None => return Ok(FlowExecution::new(state.name(), status)),
            }
        }
    }

    fn state(&self, name: &str) -> Option<Arc<dyn State>> {
        self.states.get(name).cloned()
    }

    fn state_names(&self) -> Vec<String> {
        self.order.clone()
    }
}
