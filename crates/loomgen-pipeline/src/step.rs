//! Step trait, lifecycle states, and runtime-parameter introspection.

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;
use serde::{Deserialize, Serialize};

use loomgen_types::{Batch, LoomError, Result};

/// Batch size a step requests from each upstream producer unless configured
/// otherwise.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Lazy output sequence of a step: batches in emission order, the final one
/// carrying `last == true`. Restartable only by constructing a fresh step.
pub type BatchStream = Pin<Box<dyn Stream<Item = Result<Batch>> + Send>>;

// ---------------------------------------------------------------------------
// StepState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Unloaded,
    Loaded,
    Running,
    Finished,
    Failed,
}

// ---------------------------------------------------------------------------
// RuntimeParameterInfo
// ---------------------------------------------------------------------------

/// Introspection entry for one runtime-tunable step parameter, consumed by
/// external tooling to present and validate overrides before a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeParameterInfo {
    pub name: String,
    pub optional: bool,
    pub description: String,
}

impl RuntimeParameterInfo {
    pub fn new(name: &str, optional: bool, description: &str) -> Self {
        Self {
            name: name.to_string(),
            optional,
            description: description.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// StepCore — shared declared state + lifecycle
// ---------------------------------------------------------------------------

/// The declared, user-settable state every step carries: name, field
/// mappings, batch size, and the lifecycle state machine
/// `unloaded → loaded → running → finished` (with `failed` reachable from
/// `loaded` or `running`).
#[derive(Debug, Clone)]
pub struct StepCore {
    pub name: String,
    /// Renames applied to upstream fields on the way in: upstream name → expected name.
    pub input_mappings: HashMap<String, String>,
    /// Renames applied to produced fields on the way out: produced name → published name.
    pub output_mappings: HashMap<String, String>,
    pub batch_size: usize,
    state: StepState,
}

impl StepCore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input_mappings: HashMap::new(),
            output_mappings: HashMap::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            state: StepState::Unloaded,
        }
    }

    pub fn state(&self) -> StepState {
        self.state
    }

    /// Transition `unloaded → loaded`. Loading twice or out of order is an error.
    pub fn begin_load(&mut self) -> Result<()> {
        match self.state {
            StepState::Unloaded => {
                self.state = StepState::Loaded;
                Ok(())
            }
            other => Err(LoomError::Pipeline {
                step: self.name.clone(),
                message: format!("load() called in state {other:?}"),
            }),
        }
    }

    /// Transition `loaded → running`. Processing before `load`, or processing
    /// a step that already ran, is an error; restart requires a fresh step.
    pub fn begin_process(&mut self) -> Result<()> {
        match self.state {
            StepState::Loaded => {
                self.state = StepState::Running;
                Ok(())
            }
            StepState::Unloaded => Err(LoomError::Pipeline {
                step: self.name.clone(),
                message: "process() called before load()".into(),
            }),
            other => Err(LoomError::Pipeline {
                step: self.name.clone(),
                message: format!(
                    "process() called in state {other:?}; construct a fresh step to restart"
                ),
            }),
        }
    }

    pub fn finish(&mut self) {
        self.state = StepState::Finished;
    }

    pub fn fail(&mut self) {
        self.state = StepState::Failed;
    }
}

// ---------------------------------------------------------------------------
// Step trait
// ---------------------------------------------------------------------------

/// The unit of pipeline work: transforms input batches into a lazy output
/// batch sequence, exposes its configuration, and declares its input/output
/// fields and runtime-tunable parameters.
#[async_trait]
pub trait Step: Send {
    fn core(&self) -> &StepCore;
    fn core_mut(&mut self) -> &mut StepCore;

    fn name(&self) -> &str {
        &self.core().name
    }

    fn state(&self) -> StepState {
        self.core().state()
    }

    /// Generator steps take no upstream input and produce seed batches.
    fn is_generator(&self) -> bool {
        false
    }

    /// Field names this step requires on incoming records (post input-mapping).
    fn inputs(&self) -> Vec<String> {
        Vec::new()
    }

    /// Field names this step adds to outgoing records (pre output-mapping).
    fn outputs(&self) -> Vec<String>;

    fn input_mappings(&self) -> &HashMap<String, String> {
        &self.core().input_mappings
    }

    fn output_mappings(&self) -> &HashMap<String, String> {
        &self.core().output_mappings
    }

    fn batch_size(&self) -> usize {
        self.core().batch_size
    }

    fn runtime_parameters_info(&self) -> Vec<RuntimeParameterInfo> {
        Vec::new()
    }

    /// Override one runtime-tunable parameter before a run.
    fn set_runtime_parameter(&mut self, name: &str, _value: &serde_json::Value) -> Result<()> {
        Err(LoomError::Configuration {
            step: self.name().to_string(),
            message: format!("unknown runtime parameter '{name}'"),
        })
    }

    /// One-time setup before any `process` call.
    async fn load(&mut self) -> Result<()> {
        self.core_mut().begin_load()
    }

    /// Consume the (possibly empty) upstream batches and return the lazy
    /// output sequence. Callable exactly once, after `load`.
    fn process(&mut self, inputs: Vec<Batch>) -> Result<BatchStream>;

    fn mark_finished(&mut self) {
        self.core_mut().finish();
    }

    fn mark_failed(&mut self) {
        self.core_mut().fail();
    }

    /// Serialize this step's constructor state plus its `type_info` tag.
    fn dump(&self) -> serde_json::Value;
}

/// Field names a step publishes downstream: declared outputs with the step's
/// output mappings applied.
pub fn effective_outputs(step: &dyn Step) -> Vec<String> {
    step.outputs()
        .into_iter()
        .map(|field| {
            step.output_mappings()
                .get(&field)
                .cloned()
                .unwrap_or(field)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_happy_path() {
        let mut core = StepCore::new("demo");
        assert_eq!(core.state(), StepState::Unloaded);
        core.begin_load().unwrap();
        assert_eq!(core.state(), StepState::Loaded);
        core.begin_process().unwrap();
        assert_eq!(core.state(), StepState::Running);
        core.finish();
        assert_eq!(core.state(), StepState::Finished);
    }

    #[test]
    fn process_before_load_is_an_error() {
        let mut core = StepCore::new("demo");
        let err = core.begin_process().unwrap_err();
        assert!(err.to_string().contains("before load()"));
        assert!(err.to_string().contains("demo"));
    }

    #[test]
    fn double_load_is_an_error() {
        let mut core = StepCore::new("demo");
        core.begin_load().unwrap();
        assert!(core.begin_load().is_err());
    }

    #[test]
    fn finished_step_cannot_reprocess() {
        let mut core = StepCore::new("demo");
        core.begin_load().unwrap();
        core.begin_process().unwrap();
        core.finish();
        let err = core.begin_process().unwrap_err();
        assert!(err.to_string().contains("fresh step"));
    }

    #[test]
    fn failed_state_reachable_from_running() {
        let mut core = StepCore::new("demo");
        core.begin_load().unwrap();
        core.begin_process().unwrap();
        core.fail();
        assert_eq!(core.state(), StepState::Failed);
        assert!(core.begin_process().is_err());
    }

    #[test]
    fn runtime_parameter_info_round_trip() {
        let info = RuntimeParameterInfo::new("seed", true, "Random seed.");
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["name"], "seed");
        assert_eq!(json["optional"], true);
        let back: RuntimeParameterInfo = serde_json::from_value(json).unwrap();
        assert_eq!(back, info);
    }
}
