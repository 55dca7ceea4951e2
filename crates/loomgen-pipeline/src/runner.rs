//! Pipeline runner: drives the graph in topological order, routing batches
//! between steps with buffering, mapping renames, and cancellation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_stream::StreamExt;

use loomgen_types::{Batch, LoomError, Record, Result};

use crate::graph::PipelineGraph;
use crate::step::{BatchStream, RuntimeParameterInfo, Step};

// ---------------------------------------------------------------------------
// CancelToken
// ---------------------------------------------------------------------------

/// Shared cancellation flag. Once set, no further step is started and no
/// further batch is accepted; in-flight generation calls complete or time
/// out naturally and their partial output is discarded.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Per-step runtime parameter overrides: step name → parameter name → value.
pub type RuntimeOverrides = HashMap<String, HashMap<String, serde_json::Value>>;

/// The result of a completed pipeline run: records produced by each leaf step.
#[derive(Debug)]
pub struct PipelineOutput {
    pub records_by_step: HashMap<String, Vec<Record>>,
}

/// User-facing pipeline: owns the step graph and executes it.
pub struct Pipeline {
    name: String,
    graph: PipelineGraph,
    cancel: CancelToken,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            graph: PipelineGraph::new(),
            cancel: CancelToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_step(&mut self, step: Box<dyn Step>) -> Result<()> {
        self.graph.add_step(step)
    }

    pub fn connect(&mut self, from: &str, to: &str) -> Result<()> {
        self.graph.connect(from, to)
    }

    pub fn graph(&self) -> &PipelineGraph {
        &self.graph
    }

    /// A handle external code can use to cancel this pipeline's run.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Runtime-parameter introspection for every step, keyed by step name.
    pub fn runtime_parameters_info(&self) -> HashMap<String, Vec<RuntimeParameterInfo>> {
        self.graph
            .step_names()
            .into_iter()
            .filter_map(|name| {
                let step = self.graph.step(&name)?;
                Some((name, step.runtime_parameters_info()))
            })
            .collect()
    }

    pub async fn run(&mut self) -> Result<PipelineOutput> {
        self.run_with(RuntimeOverrides::new()).await
    }

    /// Validate, apply runtime overrides, load every step, then execute the
    /// steps as sequential stages in topological order.
    pub async fn run_with(&mut self, overrides: RuntimeOverrides) -> Result<PipelineOutput> {
        self.graph.validate()?;
        let order = self.graph.topological_order()?;

        self.apply_overrides(overrides)?;

        for name in &order {
            tracing::debug!(pipeline = %self.name, step = %name, "Loading step");
            let step = self.graph.step_mut(name).ok_or_else(|| missing_step(name))?;
            step.load().await?;
        }

        // Published records of every completed step, post output-mapping.
        let mut published: HashMap<String, Vec<Record>> = HashMap::new();

        for name in &order {
            if self.cancel.is_cancelled() {
                return Err(cancelled(name));
            }

            let predecessors = self.graph.predecessors(name);
            let step = self.graph.step_mut(name).ok_or_else(|| missing_step(name))?;

            let input_batches = if step.is_generator() {
                Vec::new()
            } else {
                let mut incoming: Vec<Record> = Vec::new();
                for upstream in &predecessors {
                    incoming.extend(published.get(upstream).cloned().unwrap_or_default());
                }
                let mappings = step.input_mappings().clone();
                for record in &mut incoming {
                    for (from, to) in &mappings {
                        record.rename(from, to.clone());
                    }
                }
                regroup(incoming, step.batch_size())
            };

            tracing::info!(
                pipeline = %self.name,
                step = %name,
                input_batches = input_batches.len(),
                "Running step"
            );

            let mut stream = match step.process(input_batches) {
                Ok(stream) => stream,
                Err(e) => {
                    step.mark_failed();
                    return Err(e);
                }
            };

            let drained = drain(&mut stream, &self.cancel, name).await;
            let step = self.graph.step_mut(name).ok_or_else(|| missing_step(name))?;
            match drained {
                Ok(mut records) => {
                    step.mark_finished();
                    let mappings = step.output_mappings().clone();
                    for record in &mut records {
                        for (from, to) in &mappings {
                            record.rename(from, to.clone());
                        }
                    }
                    tracing::debug!(step = %name, records = records.len(), "Step finished");
                    published.insert(name.clone(), records);
                }
                Err(e) => {
                    step.mark_failed();
                    return Err(e);
                }
            }
        }

        let records_by_step = self
            .graph
            .leaves()
            .into_iter()
            .filter_map(|leaf| {
                let records = published.remove(&leaf)?;
                Some((leaf, records))
            })
            .collect();
        Ok(PipelineOutput { records_by_step })
    }

    fn apply_overrides(&mut self, overrides: RuntimeOverrides) -> Result<()> {
        for (step_name, params) in overrides {
            let step = self
                .graph
                .step_mut(&step_name)
                .ok_or_else(|| LoomError::Configuration {
                    step: step_name.clone(),
                    message: "unknown step in runtime parameter overrides".into(),
                })?;
            let known: Vec<String> = step
                .runtime_parameters_info()
                .into_iter()
                .map(|info| info.name)
                .collect();
            for (param, value) in params {
                if !known.contains(&param) {
                    return Err(LoomError::Configuration {
                        step: step_name.clone(),
                        message: format!("unknown runtime parameter '{param}'"),
                    });
                }
                step.set_runtime_parameter(&param, &value)?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn missing_step(name: &str) -> LoomError {
    LoomError::Pipeline {
        step: name.to_string(),
        message: "step vanished from the graph mid-run".into(),
    }
}

fn cancelled(name: &str) -> LoomError {
    LoomError::Pipeline {
        step: name.to_string(),
        message: "pipeline run cancelled; partial output discarded".into(),
    }
}

/// Split records into batches of `batch_size`, flagging the final (possibly
/// short) batch as terminal. An empty input still yields one terminal batch
/// so the consumer observes end-of-input.
pub fn regroup(records: Vec<Record>, batch_size: usize) -> Vec<Batch> {
    let batch_size = batch_size.max(1);
    if records.is_empty() {
        return vec![Batch::terminal(Vec::new())];
    }
    let mut batches: Vec<Batch> = records
        .chunks(batch_size)
        .map(|chunk| Batch::new(chunk.to_vec(), false))
        .collect();
    if let Some(last) = batches.last_mut() {
        last.last = true;
    }
    batches
}

/// Drain a step's output stream, enforcing the never-emit-after-terminal
/// invariant and honoring cancellation between batches.
async fn drain(stream: &mut BatchStream, cancel: &CancelToken, step: &str) -> Result<Vec<Record>> {
    let mut records = Vec::new();
    let mut saw_terminal = false;
    while let Some(item) = stream.next().await {
        let batch = item?;
        if saw_terminal {
            return Err(LoomError::Pipeline {
                step: step.to_string(),
                message: "step emitted a batch after its terminal batch".into(),
            });
        }
        if cancel.is_cancelled() {
            return Err(cancelled(step));
        }
        saw_terminal = batch.last;
        records.extend(batch.records);
    }
    Ok(records)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{StepCore, StepState};
    use serde_json::json;

    /// Generator emitting a fixed set of records in one terminal batch.
    struct Seed {
        core: StepCore,
        records: Vec<Record>,
    }

    impl Seed {
        fn boxed(name: &str, records: Vec<Record>) -> Box<dyn Step> {
            Box::new(Self {
                core: StepCore::new(name),
                records,
            })
        }
    }

    impl Step for Seed {
        fn core(&self) -> &StepCore {
            &self.core
        }
        fn core_mut(&mut self) -> &mut StepCore {
            &mut self.core
        }
        fn is_generator(&self) -> bool {
            true
        }
        fn outputs(&self) -> Vec<String> {
            self.records
                .first()
                .map(|r| r.field_names().map(String::from).collect())
                .unwrap_or_default()
        }
        fn process(&mut self, _inputs: Vec<Batch>) -> Result<BatchStream> {
            self.core.begin_process()?;
            let records = self.records.clone();
            Ok(Box::pin(tokio_stream::once(Ok(Batch::terminal(records)))))
        }
        fn dump(&self) -> serde_json::Value {
            json!({})
        }
    }

    /// Transform appending a marker field to every record.
    struct Tag {
        core: StepCore,
        field: String,
    }

    impl Tag {
        fn boxed(name: &str, field: &str) -> Box<dyn Step> {
            Box::new(Self {
                core: StepCore::new(name),
                field: field.to_string(),
            })
        }
    }

    impl Step for Tag {
        fn core(&self) -> &StepCore {
            &self.core
        }
        fn core_mut(&mut self) -> &mut StepCore {
            &mut self.core
        }
        fn inputs(&self) -> Vec<String> {
            vec!["instruction".into()]
        }
        fn outputs(&self) -> Vec<String> {
            vec![self.field.clone()]
        }
        fn process(&mut self, inputs: Vec<Batch>) -> Result<BatchStream> {
            self.core.begin_process()?;
            let field = self.field.clone();
            let stream = async_stream::try_stream! {
                for batch in inputs {
                    let mut records = batch.records;
                    for record in &mut records {
                        record.set(field.clone(), json!(true));
                    }
                    yield Batch::new(records, batch.last);
                }
            };
            Ok(Box::pin(stream))
        }
        fn dump(&self) -> serde_json::Value {
            json!({})
        }
    }

    /// Misbehaving step that keeps emitting after its terminal batch.
    struct Overrunner {
        core: StepCore,
    }

    impl Step for Overrunner {
        fn core(&self) -> &StepCore {
            &self.core
        }
        fn core_mut(&mut self) -> &mut StepCore {
            &mut self.core
        }
        fn is_generator(&self) -> bool {
            true
        }
        fn outputs(&self) -> Vec<String> {
            vec!["x".into()]
        }
        fn process(&mut self, _inputs: Vec<Batch>) -> Result<BatchStream> {
            self.core.begin_process()?;
            let stream = async_stream::try_stream! {
                yield Batch::terminal(vec![Record::from_pairs([("x", json!(1))])]);
                yield Batch::terminal(vec![Record::from_pairs([("x", json!(2))])]);
            };
            Ok(Box::pin(stream))
        }
        fn dump(&self) -> serde_json::Value {
            json!({})
        }
    }

    fn seed_records(n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| Record::from_pairs([("instruction", json!(format!("item-{i}")))]))
            .collect()
    }

    #[test]
    fn regroup_chunks_and_flags_terminal() {
        let batches = regroup(seed_records(5), 2);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 2);
        assert!(!batches[0].last);
        assert_eq!(batches[2].len(), 1);
        assert!(batches[2].last);
    }

    #[test]
    fn regroup_empty_input_yields_terminal_batch() {
        let batches = regroup(vec![], 10);
        assert_eq!(batches.len(), 1);
        assert!(batches[0].last);
        assert!(batches[0].is_empty());
    }

    #[tokio::test]
    async fn linear_pipeline_routes_records() {
        let mut pipeline = Pipeline::new("unit");
        pipeline
            .add_step(Seed::boxed("seed", seed_records(3)))
            .unwrap();
        pipeline.add_step(Tag::boxed("tag", "tagged")).unwrap();
        pipeline.connect("seed", "tag").unwrap();

        let output = pipeline.run().await.unwrap();
        let records = &output.records_by_step["tag"];
        assert_eq!(records.len(), 3);
        for record in records {
            assert_eq!(record.get("tagged"), Some(&json!(true)));
        }
        assert_eq!(
            pipeline.graph().step("tag").unwrap().state(),
            StepState::Finished
        );
    }

    #[tokio::test]
    async fn output_contains_only_leaf_steps() {
        let mut pipeline = Pipeline::new("unit");
        pipeline
            .add_step(Seed::boxed("seed", seed_records(1)))
            .unwrap();
        pipeline.add_step(Tag::boxed("tag", "tagged")).unwrap();
        pipeline.connect("seed", "tag").unwrap();

        let output = pipeline.run().await.unwrap();
        assert!(output.records_by_step.contains_key("tag"));
        assert!(!output.records_by_step.contains_key("seed"));
    }

    #[tokio::test]
    async fn emitting_after_terminal_batch_fails_the_run() {
        let mut pipeline = Pipeline::new("unit");
        pipeline
            .add_step(Box::new(Overrunner {
                core: StepCore::new("bad"),
            }))
            .unwrap();

        let err = pipeline.run().await.unwrap_err();
        assert!(err.to_string().contains("after its terminal batch"));
        assert_eq!(
            pipeline.graph().step("bad").unwrap().state(),
            StepState::Failed
        );
    }

    #[tokio::test]
    async fn cancellation_before_run_discards_everything() {
        let mut pipeline = Pipeline::new("unit");
        pipeline
            .add_step(Seed::boxed("seed", seed_records(2)))
            .unwrap();
        pipeline.cancel_token().cancel();

        let err = pipeline.run().await.unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }

    #[tokio::test]
    async fn unknown_override_step_is_a_configuration_error() {
        let mut pipeline = Pipeline::new("unit");
        pipeline
            .add_step(Seed::boxed("seed", seed_records(1)))
            .unwrap();

        let overrides: RuntimeOverrides =
            HashMap::from([("ghost".to_string(), HashMap::new())]);
        let err = pipeline.run_with(overrides).await.unwrap_err();
        assert!(matches!(err, LoomError::Configuration { .. }));
    }

    #[tokio::test]
    async fn unknown_override_parameter_is_a_configuration_error() {
        let mut pipeline = Pipeline::new("unit");
        pipeline
            .add_step(Seed::boxed("seed", seed_records(1)))
            .unwrap();

        let overrides: RuntimeOverrides = HashMap::from([(
            "seed".to_string(),
            HashMap::from([("nope".to_string(), json!(1))]),
        )]);
        let err = pipeline.run_with(overrides).await.unwrap_err();
        match err {
            LoomError::Configuration { step, message } => {
                assert_eq!(step, "seed");
                assert!(message.contains("nope"));
            }
            other => panic!("expected Configuration error, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn validation_failure_prevents_execution() {
        let mut pipeline = Pipeline::new("unit");
        pipeline.add_step(Tag::boxed("tag", "tagged")).unwrap();

        let err = pipeline.run().await.unwrap_err();
        assert!(matches!(err, LoomError::GraphValidation(_)));
        // The step never ran: still unloaded.
        assert_eq!(
            pipeline.graph().step("tag").unwrap().state(),
            StepState::Unloaded
        );
    }

    #[tokio::test]
    async fn input_mappings_rename_at_the_boundary() {
        let mut pipeline = Pipeline::new("unit");
        pipeline
            .add_step(Seed::boxed(
                "seed",
                vec![Record::from_pairs([("prompt", json!("hello"))])],
            ))
            .unwrap();
        let mut tag = Tag {
            core: StepCore::new("tag"),
            field: "tagged".to_string(),
        };
        tag.core
            .input_mappings
            .insert("prompt".into(), "instruction".into());
        pipeline.add_step(Box::new(tag)).unwrap();
        pipeline.connect("seed", "tag").unwrap();

        let output = pipeline.run().await.unwrap();
        let record = &output.records_by_step["tag"][0];
        assert_eq!(record.get("instruction"), Some(&json!("hello")));
        assert!(!record.contains("prompt"));
    }

    #[tokio::test]
    async fn output_mappings_rename_on_the_way_out() {
        let mut pipeline = Pipeline::new("unit");
        let mut seed = Seed {
            core: StepCore::new("seed"),
            records: vec![Record::from_pairs([("text", json!("hello"))])],
        };
        seed.core
            .output_mappings
            .insert("text".into(), "instruction".into());
        pipeline.add_step(Box::new(seed)).unwrap();

        let output = pipeline.run().await.unwrap();
        let record = &output.records_by_step["seed"][0];
        assert_eq!(record.get("instruction"), Some(&json!("hello")));
    }
}
