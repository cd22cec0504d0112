//! Declarative flows loaded from TOML.
//!
//! ```toml
//! name = "nightly"
//!
//! [[states]]
//! name = "load"
//! kind = "step"
//! on = [{ pattern = "FAILED", to = "cleanup" }, { pattern = "*" }]
//!
//! [[states]]
//! name = "cleanup"
//! kind = "step"
//! ```
//!
//! A transition without `to` ends the flow. States without transitions end
//! the flow on any exit code. Step, decider and sub-flow names are resolved
//! against a [`FlowRegistry`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::simple::{Flow, SimpleFlow};
use super::state::{
    DecisionState, EndState, FlowState, JobExecutionDecider, PauseState, SplitState, State,
    StepState,
};
use super::executor::FlowExecutor;
use super::transition::StateTransition;
use crate::error::{BatchError, Result};
use crate::status::FlowExecutionStatus;
use crate::step::Step;
use crate::task::TaskExecutor;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub name: String,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub states: Vec<StateDefinition>,
    /// Sub-flows usable by `flow` and `split` states of this definition.
    #[serde(default)]
    pub flows: Vec<FlowDefinition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateKind {
    Step,
    Decision,
    Flow,
    Split,
    End,
    Pause,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDefinition {
    pub name: String,
    pub kind: StateKind,
    /// Registry name of the step, decider or flow; defaults to `name`.
    #[serde(default, rename = "ref")]
    pub reference: Option<String>,
    /// Branches of a split.
    #[serde(default)]
    pub flows: Vec<String>,
    /// Status of an end state, COMPLETED when absent.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub abandon: bool,
    #[serde(default)]
    pub on: Vec<TransitionDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionDefinition {
    #[serde(default = "default_pattern")]
    pub pattern: String,
    #[serde(default)]
    pub to: Option<String>,
}

fn default_pattern() -> String {
    StateTransition::WILDCARD.to_string()
}

/// Named steps, deciders and flows a [`FlowDefinition`] can refer to.
#[derive(Clone, Default)]
pub struct FlowRegistry {
    steps: HashMap<String, Arc<dyn Step>>,
    deciders: HashMap<String, Arc<dyn JobExecutionDecider>>,
    flows: HashMap<String, Arc<dyn Flow>>,
    task_executor: Option<Arc<dyn TaskExecutor>>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_step(mut self, step: Arc<dyn Step>) -> Self {
        self.steps.insert(step.name().to_string(), step);
        self
    }

    pub fn with_decider(
        mut self,
        name: impl Into<String>,
        decider: Arc<dyn JobExecutionDecider>,
    ) -> Self {
        self.deciders.insert(name.into(), decider);
        self
    }

    pub fn with_flow(mut self, flow: Arc<dyn Flow>) -> Self {
        self.flows.insert(flow.name().to_string(), flow);
        self
    }

    /// Executor for split branches; inline when unset.
    pub fn with_task_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.task_executor = Some(executor);
        self
    }

    fn lookup<T: ?Sized>(map: &HashMap<String, Arc<T>>, what: &str, name: &str) -> Result<Arc<T>> {
        map.get(name)
            .cloned()
            .ok_or_else(|| BatchError::FlowConfig(format!("no {what} named {name} is registered")))
    }
}

/// Stand-in used when validating a definition without a registry.
struct Unresolved(String);

impl State for Unresolved {
    fn name(&self) -> &str {
        &self.0
    }

    fn handle(&self, _executor: &Arc<dyn FlowExecutor>) -> Result<FlowExecutionStatus> {
        Err(BatchError::FlowExecution(format!(
            "state {} was built for validation only",
            self.0
        )))
    }
}

impl FlowDefinition {
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_toml(&std::fs::read_to_string(path)?)
    }

    /// Resolves every reference against `registry` and builds the flow.
    pub fn build(&self, registry: &FlowRegistry) -> Result<SimpleFlow> {
        let mut registry = registry.clone();
        for sub in &self.flows {
            let flow: Arc<dyn Flow> = Arc::new(sub.build(&registry)?);
            registry = registry.with_flow(flow);
        }
        let states = self
            .states
            .iter()
            .map(|s| s.build(&registry))
            .collect::<Result<Vec<_>>>()?;
        self.assemble(states)
    }

    /// Checks the routing of this definition and its sub-flows without
    /// resolving any step, decider or flow reference.
    pub fn validate(&self) -> Result<SimpleFlow> {
        for sub in &self.flows {
            sub.validate()?;
        }
        let states = self
            .states
            .iter()
            .map(|s| {
                s.build_terminal()
                    .unwrap_or_else(|| Arc::new(Unresolved(s.name.clone())))
            })
            .collect();
        self.assemble(states)
    }

    fn assemble(&self, states: Vec<Arc<dyn State>>) -> Result<SimpleFlow> {
        let mut transitions = Vec::new();
        for state in &self.states {
            if state.on.is_empty() {
                transitions.push(StateTransition::end(&state.name, StateTransition::WILDCARD));
            }
            for route in &state.on {
                transitions.push(match &route.to {
                    Some(next) => StateTransition::new(&state.name, &route.pattern, next),
                    None => StateTransition::end(&state.name, &route.pattern),
                });
            }
        }
        SimpleFlow::new(&self.name, states, transitions, self.start.as_deref())
    }
}

impl StateDefinition {
    fn reference(&self) -> &str {
        self.reference.as_deref().unwrap_or(&self.name)
    }

    /// End and pause states need nothing from a registry.
    fn build_terminal(&self) -> Option<Arc<dyn State>> {
        match self.kind {
            StateKind::End => {
                let status = FlowExecutionStatus::new(
                    self.status.as_deref().unwrap_or(FlowExecutionStatus::COMPLETED),
                );
                let mut end = EndState::new(&self.name, status).with_abandon(self.abandon);
                if let Some(code) = &self.code {
                    end = end.with_code(code);
                }
                Some(Arc::new(end))
            }
            StateKind::Pause => Some(Arc::new(PauseState::new(&self.name))),
            _ => None,
        }
    }

    fn build(&self, registry: &FlowRegistry) -> Result<Arc<dyn State>> {
        if let Some(state) = self.build_terminal() {
            return Ok(state);
        }
        let state: Arc<dyn State> = match self.kind {
            StateKind::Step => {
                let step = FlowRegistry::lookup(&registry.steps, "step", self.reference())?;
                Arc::new(StepState::named(&self.name, step))
            }
            StateKind::Decision => {
                let decider = FlowRegistry::lookup(&registry.deciders, "decider", self.reference())?;
                Arc::new(DecisionState::new(&self.name, decider))
            }
            StateKind::Flow => {
                let flow = FlowRegistry::lookup(&registry.flows, "flow", self.reference())?;
                Arc::new(FlowState::new(&self.name, flow))
            }
            StateKind::Split => {
                if self.flows.is_empty() {
                    return Err(BatchError::FlowConfig(format!(
                        "split {} has no flows",
                        self.name
                    )));
                }
                let flows = self
                    .flows
                    .iter()
                    .map(|f| FlowRegistry::lookup(&registry.flows, "flow", f))
                    .collect::<Result<Vec<_>>>()?;
                let mut split = SplitState::new(&self.name, flows);
                if let Some(executor) = &registry.task_executor {
                    split = split.with_task_executor(executor.clone());
                }
                Arc::new(split)
            }
            StateKind::End | StateKind::Pause => {
                return Err(BatchError::FlowConfig(format!(
                    "state {} cannot be resolved",
                    self.name
                )));
            }
        };
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::error::Failure;
    use crate::execution::{StepContext, StepContribution};
    use crate::flow::test_support::executor;
    use crate::status::ExitStatus;
    use crate::step::{RepeatStatus, TaskletStep};

    const NIGHTLY: &str = r#"
name = "nightly"

[[flows]]
name = "left"
[[flows.states]]
name = "left.report"
kind = "step"
ref = "report"

[[flows]]
name = "right"
[[flows.states]]
name = "right.report"
kind = "step"
ref = "report"

[[states]]
name = "load"
kind = "step"
on = [{ pattern = "FAILED", to = "failed" }, { pattern = "*", to = "fan-out" }]

[[states]]
name = "fan-out"
kind = "split"
flows = ["left", "right"]

[[states]]
name = "failed"
kind = "end"
status = "FAILED"
"#;

    fn tasklet(name: &str, code: &'static str) -> Arc<dyn Step> {
        Arc::new(TaskletStep::new(
            name,
            move |c: &mut StepContribution, _: &StepContext| -> std::result::Result<RepeatStatus, Failure> {
                c.set_exit_status(ExitStatus::new(code));
                Ok(RepeatStatus::Finished)
            },
        ))
    }

    #[test]
    fn builds_and_runs_a_toml_flow() {
        let definition = FlowDefinition::from_toml(NIGHTLY).unwrap();
        let registry = FlowRegistry::new()
            .with_step(tasklet("load", "COMPLETED"))
            .with_step(tasklet("report", "COMPLETED"));
        let flow = definition.build(&registry).unwrap();
        assert_eq!(flow.start_state(), "load");

        let exec = executor();
        let result = flow.start(&exec).unwrap();
        assert_eq!(result.name, "fan-out");
        assert_eq!(result.status, FlowExecutionStatus::completed());
        assert_eq!(exec.job_execution().step_executions().len(), 3);
    }

    #[test]
    fn failed_step_routes_to_failed_end() {
        let definition = FlowDefinition::from_toml(NIGHTLY).unwrap();
        let registry = FlowRegistry::new()
            .with_step(tasklet("load", "FAILED"))
            .with_step(tasklet("report", "COMPLETED"));
        let result = definition.build(&registry).unwrap().start(&executor()).unwrap();
        assert_eq!(result.name, "failed");
        assert_eq!(result.status, FlowExecutionStatus::failed());
    }

    #[test]
    fn unknown_reference_is_a_config_error() {
        let definition = FlowDefinition::from_toml(NIGHTLY).unwrap();
        let err = definition.build(&FlowRegistry::new()).unwrap_err();
        assert!(err.to_string().contains("no step named report"));
    }

    #[test]
    fn validate_checks_routing_only() {
        let definition = FlowDefinition::from_toml(NIGHTLY).unwrap();
        let flow = definition.validate().unwrap();
        assert_eq!(flow.state_names(), ["load", "fan-out", "failed"]);

        let broken = FlowDefinition::from_toml(
            r#"
name = "broken"
[[states]]
name = "a"
kind = "step"
on = [{ pattern = "*", to = "nowhere" }]
"#,
        )
        .unwrap();
        assert!(matches!(broken.validate(), Err(BatchError::FlowConfig(_))));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(NIGHTLY.as_bytes()).unwrap();
        let definition = FlowDefinition::from_path(file.path()).unwrap();
        assert_eq!(definition.name, "nightly");
        assert_eq!(definition.flows.len(), 2);
        assert_eq!(definition.states[1].kind, StateKind::Split);
    }
}
