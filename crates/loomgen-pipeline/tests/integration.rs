//! End-to-end integration tests for the Loomgen pipeline engine.
//!
//! Each test exercises the full path: build steps -> wire graph -> validate
//! -> run -> verify emitted records.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use loomgen_llm::{Conversation, DynAdapter, GenerationAdapter, GenerationParams};
use loomgen_pipeline::evol::EvolInstructGenerator;
use loomgen_pipeline::steps::{LoadData, TextGeneration};
use loomgen_pipeline::{Pipeline, Step, StepRegistry};
use loomgen_types::{LoomError, Record, Result};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Adapter that always answers with a fixed string.
struct StubAdapter {
    reply: String,
    model: String,
}

impl StubAdapter {
    fn arc(reply: &str, model: &str) -> Arc<DynAdapter> {
        Arc::new(DynAdapter::new(Self {
            reply: reply.to_string(),
            model: model.to_string(),
        }))
    }
}

#[async_trait]
impl GenerationAdapter for StubAdapter {
    async fn generate(
        &self,
        _conversation: &Conversation,
        _params: &GenerationParams,
    ) -> Result<String> {
        Ok(self.reply.clone())
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dump(&self) -> Value {
        json!({ "type_info": { "module": "integration", "name": "StubAdapter" } })
    }
}

/// Adapter that fails every call with a transient backend error.
struct BrokenAdapter;

#[async_trait]
impl GenerationAdapter for BrokenAdapter {
    async fn generate(
        &self,
        _conversation: &Conversation,
        _params: &GenerationParams,
    ) -> Result<String> {
        Err(LoomError::Backend {
            provider: "broken".into(),
            status: 503,
            message: "always down".into(),
            retryable: true,
        })
    }

    fn model_name(&self) -> &str {
        "broken"
    }

    fn dump(&self) -> Value {
        json!({ "type_info": { "module": "integration", "name": "BrokenAdapter" } })
    }
}

fn seed_records(instructions: &[&str]) -> Vec<Record> {
    instructions
        .iter()
        .map(|i| Record::from_pairs([("instruction", json!(i))]))
        .collect()
}

// ---------------------------------------------------------------------------
// Test 1: Generator -> LLM task pipeline end to end
// ---------------------------------------------------------------------------

#[tokio::test]
async fn load_data_into_text_generation_pipeline() {
    let mut pipeline = Pipeline::new("e2e");
    let load = LoadData::builder()
        .name("load")
        .pipeline(&pipeline)
        .data(seed_records(&["write a haiku", "explain rust lifetimes"]))
        .build()
        .unwrap();
    let generate = TextGeneration::builder()
        .name("generate")
        .pipeline(&pipeline)
        .llm(StubAdapter::arc("generated text", "stub-model"))
        .build()
        .unwrap();

    pipeline.add_step(Box::new(load)).unwrap();
    pipeline.add_step(Box::new(generate)).unwrap();
    pipeline.connect("load", "generate").unwrap();

    let output = pipeline.run().await.expect("pipeline should succeed");
    let records = &output.records_by_step["generate"];
    assert_eq!(records.len(), 2);
    for record in records {
        assert_eq!(record.get("generation"), Some(&json!("generated text")));
        assert_eq!(record.get("model_name"), Some(&json!("stub-model")));
    }
    // Input fields survive the pass-through.
    assert_eq!(records[0].get("instruction"), Some(&json!("write a haiku")));
}

// ---------------------------------------------------------------------------
// Test 2: Evolution generator feeding an answer step
// ---------------------------------------------------------------------------

#[tokio::test]
async fn evol_generator_feeds_downstream_task() {
    let mut pipeline = Pipeline::new("e2e");
    let evolve = EvolInstructGenerator::builder()
        .name("evolve")
        .pipeline(&pipeline)
        .llm(StubAdapter::arc("evolved instruction", "stub-model"))
        .num_instructions(3)
        .seed_instructions(vec!["seed".into()])
        .min_length(1)
        .max_length(100)
        .build()
        .unwrap();
    let answer = TextGeneration::builder()
        .name("answer")
        .pipeline(&pipeline)
        .llm(StubAdapter::arc("an answer", "stub-model"))
        .build()
        .unwrap();

    pipeline.add_step(Box::new(evolve)).unwrap();
    pipeline.add_step(Box::new(answer)).unwrap();
    pipeline.connect("evolve", "answer").unwrap();

    let output = pipeline.run().await.expect("pipeline should succeed");
    let records = &output.records_by_step["answer"];
    assert_eq!(records.len(), 3);
    for record in records {
        assert_eq!(
            record.get("instruction"),
            Some(&json!("evolved instruction"))
        );
        assert_eq!(record.get("generation"), Some(&json!("an answer")));
    }
}

// ---------------------------------------------------------------------------
// Test 3: Unsatisfied input field fails at build time, never executes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn missing_input_field_fails_validation_before_execution() {
    // A -> B -> C where B requires a field A does not produce. LoadData emits
    // records whose only field is "prompt"; TextGeneration requires
    // "instruction".
    let mut pipeline = Pipeline::new("e2e");
    let load = LoadData::builder()
        .name("a")
        .pipeline(&pipeline)
        .data(vec![Record::from_pairs([("prompt", json!("hi"))])])
        .build()
        .unwrap();
    let b = TextGeneration::builder()
        .name("b")
        .pipeline(&pipeline)
        .llm(StubAdapter::arc("x", "stub-model"))
        .build()
        .unwrap();
    let c = TextGeneration::builder()
        .name("c")
        .pipeline(&pipeline)
        .llm(StubAdapter::arc("x", "stub-model"))
        .build()
        .unwrap();

    pipeline.add_step(Box::new(load)).unwrap();
    pipeline.add_step(Box::new(b)).unwrap();
    pipeline.add_step(Box::new(c)).unwrap();
    pipeline.connect("a", "b").unwrap();
    pipeline.connect("b", "c").unwrap();

    let err = pipeline.run().await.unwrap_err();
    match &err {
        LoomError::GraphValidation(message) => {
            assert!(message.contains("Step 'b' requires inputs"));
            assert!(message.contains("instruction"));
        }
        other => panic!("expected GraphValidation, got: {other:?}"),
    }
    // Validation failed before any step was loaded or run.
    assert_eq!(
        pipeline.graph().step("a").unwrap().state(),
        loomgen_pipeline::StepState::Unloaded
    );
}

// ---------------------------------------------------------------------------
// Test 4: Input mapping satisfies a renamed upstream field
// ---------------------------------------------------------------------------

#[tokio::test]
async fn input_mapping_bridges_renamed_field() {
    let mut pipeline = Pipeline::new("e2e");
    let load = LoadData::builder()
        .name("load")
        .pipeline(&pipeline)
        .data(vec![Record::from_pairs([("prompt", json!("evolve me"))])])
        .build()
        .unwrap();
    let generate = TextGeneration::builder()
        .name("generate")
        .pipeline(&pipeline)
        .llm(StubAdapter::arc("done", "stub-model"))
        .input_mappings(HashMap::from([(
            "prompt".to_string(),
            "instruction".to_string(),
        )]))
        .build()
        .unwrap();

    pipeline.add_step(Box::new(load)).unwrap();
    pipeline.add_step(Box::new(generate)).unwrap();
    pipeline.connect("load", "generate").unwrap();

    let output = pipeline.run().await.expect("pipeline should succeed");
    let record = &output.records_by_step["generate"][0];
    assert_eq!(record.get("instruction"), Some(&json!("evolve me")));
    assert_eq!(record.get("generation"), Some(&json!("done")));
}

// ---------------------------------------------------------------------------
// Test 5: Failing adapter degrades items, pipeline still completes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn broken_adapter_never_aborts_the_pipeline() {
    let mut pipeline = Pipeline::new("e2e");
    let evolve = EvolInstructGenerator::builder()
        .name("evolve")
        .pipeline(&pipeline)
        .llm(Arc::new(DynAdapter::new(BrokenAdapter)))
        .num_instructions(2)
        .seed_instructions(vec!["first".into(), "second".into()])
        .min_length(1)
        .max_length(100)
        .build()
        .unwrap();
    pipeline.add_step(Box::new(evolve)).unwrap();

    let output = pipeline.run().await.expect("run should not abort");
    let records = &output.records_by_step["evolve"];
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].get("instruction"), Some(&json!("first")));
    assert_eq!(records[1].get("instruction"), Some(&json!("second")));
}

// ---------------------------------------------------------------------------
// Test 6: Runtime overrides flow through Pipeline::run_with
// ---------------------------------------------------------------------------

#[tokio::test]
async fn runtime_overrides_change_step_behavior() {
    let mut pipeline = Pipeline::new("e2e");
    let evolve = EvolInstructGenerator::builder()
        .name("evolve")
        .pipeline(&pipeline)
        .llm(StubAdapter::arc("a rather long evolved instruction", "stub"))
        .num_instructions(1)
        .seed_instructions(vec!["seed".into()])
        .min_length(1)
        .max_length(1000)
        .build()
        .unwrap();
    pipeline.add_step(Box::new(evolve)).unwrap();

    // Tighten max_length so the stub's reply gets rejected and the seed wins.
    let overrides = HashMap::from([(
        "evolve".to_string(),
        HashMap::from([("max_length".to_string(), json!(5))]),
    )]);
    let output = pipeline.run_with(overrides).await.unwrap();
    assert_eq!(
        output.records_by_step["evolve"][0].get("instruction"),
        Some(&json!("seed"))
    );
}

// ---------------------------------------------------------------------------
// Test 7: Descriptor round trip through the registry, then run
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dumped_step_reloads_and_runs_identically() {
    let scratch = Pipeline::new("scratch");
    let original = EvolInstructGenerator::builder()
        .name("evolve")
        .pipeline(&scratch)
        .llm(StubAdapter::arc("output", "test"))
        .num_instructions(1)
        .seed_instructions(vec!["test".into()])
        .min_length(1)
        .max_length(10)
        .build()
        .unwrap();
    let descriptor = original.dump();

    let mut registry = StepRegistry::with_defaults();
    registry.adapters_mut().register(
        "integration",
        "StubAdapter",
        Box::new(|_| Ok(StubAdapter::arc("output", "test"))),
    );
    let reloaded = registry.load(&descriptor).unwrap();
    assert_eq!(reloaded.dump(), descriptor);

    let mut pipeline = Pipeline::new("e2e");
    pipeline.add_step(reloaded).unwrap();
    let output = pipeline.run().await.unwrap();
    assert_eq!(
        output.records_by_step["evolve"],
        vec![Record::from_pairs([
            ("instruction", json!("output")),
            ("model_name", json!("test")),
        ])]
    );
}

// ---------------------------------------------------------------------------
// Test 8: Runtime-parameter introspection across the pipeline
// ---------------------------------------------------------------------------

#[test]
fn pipeline_exposes_runtime_parameter_info() {
    let mut pipeline = Pipeline::new("e2e");
    let evolve = EvolInstructGenerator::builder()
        .name("evolve")
        .pipeline(&pipeline)
        .llm(StubAdapter::arc("output", "test"))
        .num_instructions(1)
        .build()
        .unwrap();
    pipeline.add_step(Box::new(evolve)).unwrap();

    let info = pipeline.runtime_parameters_info();
    let evolve_params = &info["evolve"];
    assert!(evolve_params.iter().any(|p| p.name == "seed"));
    assert!(evolve_params.iter().any(|p| p.name == "generation_kwargs"));
    assert!(evolve_params.iter().all(|p| !p.description.is_empty()));
}
