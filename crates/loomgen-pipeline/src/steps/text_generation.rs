use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use loomgen_llm::{generate_bounded, ChatMessage, Conversation, DynAdapter, GenerationParams};
use loomgen_types::{Batch, LoomError, Result};

use crate::descriptor::{mappings_field, u64_field, AdapterRegistry};
use crate::runner::Pipeline;
use crate::step::{BatchStream, RuntimeParameterInfo, Step, StepCore};

// ---------------------------------------------------------------------------
// TextGeneration
// ---------------------------------------------------------------------------

/// LLM task step: one generation call per input record. Adds a `generation`
/// field with the completion and a `model_name` field for provenance. A
/// failed call degrades that record (null generation) without aborting the
/// batch.
pub struct TextGeneration {
    core: StepCore,
    llm: Arc<DynAdapter>,
    system_prompt: Option<String>,
    generation_kwargs: GenerationParams,
    concurrency: usize,
}

impl TextGeneration {
    pub fn builder() -> TextGenerationBuilder {
        TextGenerationBuilder::default()
    }

    pub(crate) fn from_descriptor(
        descriptor: &Value,
        adapters: &AdapterRegistry,
    ) -> Result<Box<dyn Step>> {
        let name = descriptor["name"]
            .as_str()
            .ok_or_else(|| LoomError::Other("step descriptor is missing 'name'".into()))?;
        let llm = adapters.load(&descriptor["llm"])?;
        let generation_kwargs = if descriptor["generation_kwargs"].is_object() {
            serde_json::from_value(descriptor["generation_kwargs"].clone())?
        } else {
            GenerationParams::default()
        };

        let mut core = StepCore::new(name);
        core.input_mappings = mappings_field(descriptor, "input_mappings")?;
        core.output_mappings = mappings_field(descriptor, "output_mappings")?;
        core.batch_size = u64_field(descriptor, "batch_size", core.batch_size as u64)? as usize;

        Ok(Box::new(Self {
            core,
            llm,
            system_prompt: descriptor["system_prompt"].as_str().map(String::from),
            generation_kwargs,
            concurrency: u64_field(descriptor, "concurrency", 8)? as usize,
        }))
    }
}

#[async_trait]
impl Step for TextGeneration {
    fn core(&self) -> &StepCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StepCore {
        &mut self.core
    }

    fn inputs(&self) -> Vec<String> {
        vec!["instruction".to_string()]
    }

    fn outputs(&self) -> Vec<String> {
        vec!["generation".to_string(), "model_name".to_string()]
    }

    fn runtime_parameters_info(&self) -> Vec<RuntimeParameterInfo> {
        vec![RuntimeParameterInfo::new(
            "generation_kwargs",
            true,
            "Generation parameters forwarded to the adapter's generate calls.",
        )]
    }

    fn set_runtime_parameter(&mut self, name: &str, value: &Value) -> Result<()> {
        match name {
            "generation_kwargs" => {
                let params: GenerationParams =
                    serde_json::from_value(value.clone()).map_err(|e| {
                        LoomError::Configuration {
                            step: self.core.name.clone(),
                            message: format!("invalid 'generation_kwargs': {e}"),
                        }
                    })?;
                params.validate()?;
                self.generation_kwargs = params;
                Ok(())
            }
            other => Err(LoomError::Configuration {
                step: self.core.name.clone(),
                message: format!("unknown runtime parameter '{other}'"),
            }),
        }
    }

    fn process(&mut self, inputs: Vec<Batch>) -> Result<BatchStream> {
        self.core.begin_process()?;
        let llm = Arc::clone(&self.llm);
        let model_name = self.llm.model_name().to_string();
        let system_prompt = self.system_prompt.clone();
        let params = self.generation_kwargs.clone();
        let concurrency = self.concurrency;

        let stream = async_stream::try_stream! {
            for batch in inputs {
                let conversations: Vec<Conversation> = batch
                    .records
                    .iter()
                    .map(|record| {
                        let instruction = record
                            .get("instruction")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default();
                        let mut conversation = Vec::new();
                        if let Some(ref prompt) = system_prompt {
                            conversation.push(ChatMessage::system(prompt.clone()));
                        }
                        conversation.push(ChatMessage::user(instruction));
                        conversation
                    })
                    .collect();

                let results = generate_bounded(&llm, &params, concurrency, conversations).await;
                let mut records = batch.records;
                for (record, result) in records.iter_mut().zip(results) {
                    match result {
                        Ok(text) => record.set("generation", json!(text)),
                        Err(e) => {
                            tracing::warn!(error = %e, "Generation failed for record");
                            record.set("generation", Value::Null);
                        }
                    }
                    record.set("model_name", json!(model_name.clone()));
                }
                yield Batch::new(records, batch.last);
            }
        };
        Ok(Box::pin(stream))
    }

    fn dump(&self) -> Value {
        json!({
            "name": self.core.name,
            "input_mappings": self.core.input_mappings,
            "output_mappings": self.core.output_mappings,
            "batch_size": self.core.batch_size,
            "llm": self.llm.dump(),
            "system_prompt": self.system_prompt,
            "generation_kwargs": serde_json::to_value(&self.generation_kwargs).unwrap_or(Value::Null),
            "concurrency": self.concurrency,
            "runtime_parameters_info": serde_json::to_value(self.runtime_parameters_info()).unwrap_or(Value::Null),
            "type_info": {
                "module": "loomgen_pipeline::steps",
                "name": "TextGeneration",
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct TextGenerationBuilder {
    name: Option<String>,
    pipeline: Option<String>,
    llm: Option<Arc<DynAdapter>>,
    system_prompt: Option<String>,
    generation_kwargs: Option<GenerationParams>,
    concurrency: Option<usize>,
    batch_size: Option<usize>,
    input_mappings: HashMap<String, String>,
    output_mappings: HashMap<String, String>,
}

impl TextGenerationBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn pipeline(mut self, pipeline: &Pipeline) -> Self {
        self.pipeline = Some(pipeline.name().to_string());
        self
    }

    pub fn llm(mut self, llm: Arc<DynAdapter>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn generation_kwargs(mut self, params: GenerationParams) -> Self {
        self.generation_kwargs = Some(params);
        self
    }

    pub fn concurrency(mut self, limit: usize) -> Self {
        self.concurrency = Some(limit);
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    pub fn input_mappings(mut self, mappings: HashMap<String, String>) -> Self {
        self.input_mappings = mappings;
        self
    }

    pub fn output_mappings(mut self, mappings: HashMap<String, String>) -> Self {
        self.output_mappings = mappings;
        self
    }

    pub fn build(self) -> Result<TextGeneration> {
        let name = self.name.ok_or_else(|| LoomError::Configuration {
            step: "<unnamed>".into(),
            message: "missing required field 'name'".into(),
        })?;
        let llm = self.llm.ok_or_else(|| LoomError::Configuration {
            step: name.clone(),
            message: "missing required field 'llm'".into(),
        })?;
        if self.pipeline.is_none() {
            return Err(LoomError::Configuration {
                step: name,
                message: "hasn't received a pipeline".into(),
            });
        }

        let mut core = StepCore::new(name);
        core.input_mappings = self.input_mappings;
        core.output_mappings = self.output_mappings;
        if let Some(size) = self.batch_size {
            core.batch_size = size;
        }

        Ok(TextGeneration {
            core,
            llm,
            system_prompt: self.system_prompt,
            generation_kwargs: self.generation_kwargs.unwrap_or_default(),
            concurrency: self.concurrency.unwrap_or(8),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
