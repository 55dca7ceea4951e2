//! Instruction evolution: iterative mutation-and-regeneration of seed
//! instructions through a generation adapter, with acceptance filtering.

mod templates;

pub use templates::{
    dump_templates, load_templates, MutationTemplate, SEED_INSTRUCTION_PROMPT,
};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use serde_json::{json, Value};

use loomgen_llm::{generate_bounded, ChatMessage, Conversation, DynAdapter, GenerationParams};
use loomgen_types::{Batch, LoomError, Record, Result};

use crate::descriptor::{AdapterRegistry, bool_field, mappings_field, string_list_field, u64_field};
use crate::runner::Pipeline;
use crate::step::{BatchStream, RuntimeParameterInfo, Step, StepCore};

// ---------------------------------------------------------------------------
// EvolInstructGenerator
// ---------------------------------------------------------------------------

/// Generator step that evolves seed instructions over a configured number of
/// mutation rounds.
///
/// Each of the `num_instructions` lineages independently goes through
/// `num_rounds` of: pick a mutation template (seeded-uniform), render it,
/// generate, and keep the result only when its byte length lies within
/// `[min_length, max_length]`. A failed or rejected round carries the
/// lineage's previous instruction forward; the batch is never aborted.
pub struct EvolInstructGenerator {
    core: StepCore,
    llm: Arc<DynAdapter>,
    num_instructions: usize,
    num_rounds: usize,
    seed_instructions: Vec<String>,
    generate_answers: bool,
    group_generations: bool,
    num_generations: usize,
    generation_kwargs: GenerationParams,
    min_length: usize,
    max_length: usize,
    seed: u64,
    concurrency: usize,
    mutation_templates: Vec<MutationTemplate>,
}

impl EvolInstructGenerator {
    pub fn builder() -> EvolInstructGeneratorBuilder {
        EvolInstructGeneratorBuilder::default()
    }

    pub(crate) fn from_descriptor(
        descriptor: &Value,
        adapters: &AdapterRegistry,
    ) -> Result<Box<dyn Step>> {
        let name = descriptor["name"].as_str().ok_or_else(|| {
            LoomError::Other("step descriptor is missing 'name'".into())
        })?;
        let llm = adapters.load(&descriptor["llm"])?;
        let generation_kwargs = if descriptor["generation_kwargs"].is_object() {
            serde_json::from_value(descriptor["generation_kwargs"].clone())?
        } else {
            GenerationParams::default()
        };
        let mutation_templates = if descriptor["mutation_templates"].is_object() {
            load_templates(&descriptor["mutation_templates"])?
        } else {
            MutationTemplate::all().to_vec()
        };

        let mut core = StepCore::new(name);
        core.input_mappings = mappings_field(descriptor, "input_mappings")?;
        core.output_mappings = mappings_field(descriptor, "output_mappings")?;
        core.batch_size = u64_field(descriptor, "batch_size", core.batch_size as u64)? as usize;

        Ok(Box::new(Self {
            core,
            llm,
            num_instructions: u64_field(descriptor, "num_instructions", 1)? as usize,
            num_rounds: u64_field(descriptor, "num_rounds", 1)? as usize,
            seed_instructions: string_list_field(descriptor, "seed_instructions")?,
            generate_answers: bool_field(descriptor, "generate_answers", false)?,
            group_generations: bool_field(descriptor, "group_generations", false)?,
            num_generations: u64_field(descriptor, "num_generations", 1)? as usize,
            generation_kwargs,
            min_length: u64_field(descriptor, "min_length", 256)? as usize,
            max_length: u64_field(descriptor, "max_length", 1024)? as usize,
            seed: u64_field(descriptor, "seed", 42)?,
            concurrency: u64_field(descriptor, "concurrency", 8)? as usize,
            mutation_templates,
        }))
    }

    fn plan(&self) -> EvolPlan {
        EvolPlan {
            llm: Arc::clone(&self.llm),
            model_name: self.llm.model_name().to_string(),
            templates: self.mutation_templates.clone(),
            seeds: self.seed_instructions.clone(),
            num_instructions: self.num_instructions,
            num_rounds: self.num_rounds,
            generate_answers: self.generate_answers,
            group_generations: self.group_generations,
            num_generations: self.num_generations.max(1),
            params: self.generation_kwargs.clone(),
            min_length: self.min_length,
            max_length: self.max_length,
            seed: self.seed,
            concurrency: self.concurrency,
        }
    }
}

#[async_trait]
impl Step for EvolInstructGenerator {
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
        let mut outputs = if self.group_generations {
            vec!["instructions".to_string()]
        } else {
            vec!["instruction".to_string()]
        };
        if self.generate_answers {
            outputs.push(if self.group_generations {
                "answers".to_string()
            } else {
                "answer".to_string()
            });
        }
        outputs.push("model_name".to_string());
        outputs
    }

    fn runtime_parameters_info(&self) -> Vec<RuntimeParameterInfo> {
        vec![
            RuntimeParameterInfo::new(
                "num_generations",
                true,
                "The number of generations to be produced per evolved instruction.",
            ),
            RuntimeParameterInfo::new(
                "generation_kwargs",
                true,
                "Generation parameters forwarded to the adapter's generate calls.",
            ),
            RuntimeParameterInfo::new(
                "min_length",
                true,
                "Length (in bytes) an evolved instruction must reach to be kept.",
            ),
            RuntimeParameterInfo::new(
                "max_length",
                true,
                "Length (in bytes) an evolved instruction must not exceed to be kept.",
            ),
            RuntimeParameterInfo::new(
                "seed",
                true,
                "Seed for the random source that picks a mutation template each round.",
            ),
        ]
    }

    fn set_runtime_parameter(&mut self, name: &str, value: &Value) -> Result<()> {
        let step_name = self.core.name.clone();
        let bad = move |message: String| LoomError::Configuration {
            step: step_name.clone(),
            message,
        };
        match name {
            "num_generations" => {
                self.num_generations = value
                    .as_u64()
                    .filter(|&n| n >= 1)
                    .ok_or_else(|| bad("'num_generations' must be a positive integer".into()))?
                    as usize;
            }
            "generation_kwargs" => {
                let params: GenerationParams = serde_json::from_value(value.clone())
                    .map_err(|e| bad(format!("invalid 'generation_kwargs': {e}")))?;
                params.validate()?;
                self.generation_kwargs = params;
            }
            "min_length" => {
                self.min_length = value
                    .as_u64()
                    .ok_or_else(|| bad("'min_length' must be an integer".into()))?
                    as usize;
            }
            "max_length" => {
                self.max_length = value
                    .as_u64()
                    .ok_or_else(|| bad("'max_length' must be an integer".into()))?
                    as usize;
            }
            "seed" => {
                self.seed = value
                    .as_u64()
                    .ok_or_else(|| bad("'seed' must be an integer".into()))?;
            }
            other => return Err(bad(format!("unknown runtime parameter '{other}'"))),
        }
        Ok(())
    }

    fn process(&mut self, _inputs: Vec<Batch>) -> Result<BatchStream> {
        self.core.begin_process()?;
        let plan = self.plan();
        let stream = async_stream::try_stream! {
            let records = evolve(plan).await?;
            yield Batch::terminal(records);
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
            "num_instructions": self.num_instructions,
            "num_rounds": self.num_rounds,
            "seed_instructions": self.seed_instructions,
            "generate_answers": self.generate_answers,
            "group_generations": self.group_generations,
            "num_generations": self.num_generations,
            "mutation_templates": dump_templates(&self.mutation_templates),
            "generation_kwargs": serde_json::to_value(&self.generation_kwargs).unwrap_or(Value::Null),
            "min_length": self.min_length,
            "max_length": self.max_length,
            "seed": self.seed,
            "concurrency": self.concurrency,
            "runtime_parameters_info": serde_json::to_value(self.runtime_parameters_info()).unwrap_or(Value::Null),
            "type_info": {
                "module": "loomgen_pipeline::evol",
                "name": "EvolInstructGenerator",
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct EvolInstructGeneratorBuilder {
    name: Option<String>,
    llm: Option<Arc<DynAdapter>>,
    pipeline: Option<String>,
    num_instructions: Option<usize>,
    num_rounds: usize,
    seed_instructions: Vec<String>,
    generate_answers: bool,
    group_generations: bool,
    num_generations: usize,
    generation_kwargs: Option<GenerationParams>,
    min_length: Option<usize>,
    max_length: Option<usize>,
    seed: Option<u64>,
    concurrency: Option<usize>,
    batch_size: Option<usize>,
    input_mappings: HashMap<String, String>,
    output_mappings: HashMap<String, String>,
    mutation_templates: Option<Vec<MutationTemplate>>,
}

impl EvolInstructGeneratorBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn llm(mut self, llm: Arc<DynAdapter>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// Bind the step to the pipeline it will run in. Building without a
    /// bound pipeline fails with a configuration error.
    pub fn pipeline(mut self, pipeline: &Pipeline) -> Self {
        self.pipeline = Some(pipeline.name().to_string());
        self
    }

    pub fn num_instructions(mut self, n: usize) -> Self {
        self.num_instructions = Some(n);
        self
    }

    pub fn num_rounds(mut self, n: usize) -> Self {
        self.num_rounds = n;
        self
    }

    pub fn seed_instructions(mut self, seeds: Vec<String>) -> Self {
        self.seed_instructions = seeds;
        self
    }

    pub fn generate_answers(mut self, enabled: bool) -> Self {
        self.generate_answers = enabled;
        self
    }

    pub fn group_generations(mut self, enabled: bool) -> Self {
        self.group_generations = enabled;
        self
    }

    pub fn num_generations(mut self, n: usize) -> Self {
        self.num_generations = n;
        self
    }

    pub fn generation_kwargs(mut self, params: GenerationParams) -> Self {
        self.generation_kwargs = Some(params);
        self
    }

    pub fn min_length(mut self, bytes: usize) -> Self {
        self.min_length = Some(bytes);
        self
    }

    pub fn max_length(mut self, bytes: usize) -> Self {
        self.max_length = Some(bytes);
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
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

    pub fn mutation_templates(mut self, templates: Vec<MutationTemplate>) -> Self {
        self.mutation_templates = Some(templates);
        self
    }

    pub fn build(self) -> Result<EvolInstructGenerator> {
        let name = self.name.ok_or_else(|| LoomError::Configuration {
            step: "<unnamed>".into(),
            message: "missing required field 'name'".into(),
        })?;
        let missing = |field: &str| LoomError::Configuration {
            step: name.clone(),
            message: format!("missing required field '{field}'"),
        };
        let llm = self.llm.ok_or_else(|| missing("llm"))?;
        let num_instructions = self.num_instructions.ok_or_else(|| missing("num_instructions"))?;
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

        Ok(EvolInstructGenerator {
            core,
            llm,
            num_instructions,
            num_rounds: self.num_rounds.max(1),
            seed_instructions: self.seed_instructions,
            generate_answers: self.generate_answers,
            group_generations: self.group_generations,
            num_generations: self.num_generations.max(1),
            generation_kwargs: self.generation_kwargs.unwrap_or_default(),
            min_length: self.min_length.unwrap_or(256),
            max_length: self.max_length.unwrap_or(1024),
            seed: self.seed.unwrap_or(42),
            concurrency: self.concurrency.unwrap_or(8),
            mutation_templates: self
                .mutation_templates
                .unwrap_or_else(|| MutationTemplate::all().to_vec()),
        })
    }
}

// ---------------------------------------------------------------------------
// Evolution algorithm
// ---------------------------------------------------------------------------

struct EvolPlan {
    llm: Arc<DynAdapter>,
    model_name: String,
    templates: Vec<MutationTemplate>,
    seeds: Vec<String>,
    num_instructions: usize,
    num_rounds: usize,
    generate_answers: bool,
    group_generations: bool,
    num_generations: usize,
    params: GenerationParams,
    min_length: usize,
    max_length: usize,
    seed: u64,
    concurrency: usize,
}

async fn evolve(plan: EvolPlan) -> Result<Vec<Record>> {
    if plan.templates.is_empty() {
        return Err(LoomError::Other("mutation template set is empty".into()));
    }

    let mut rng = ChaCha8Rng::seed_from_u64(plan.seed);

    let mut lineages: Vec<String> = if plan.seeds.is_empty() {
        let prompts: Vec<Conversation> = (0..plan.num_instructions)
            .map(|_| vec![ChatMessage::user(SEED_INSTRUCTION_PROMPT)])
            .collect();
        generate_bounded(&plan.llm, &plan.params, plan.concurrency, prompts)
            .await
            .into_iter()
            .enumerate()
            .map(|(lineage, result)| match result {
                Ok(seed) => seed,
                Err(e) => {
                    tracing::warn!(lineage, error = %e, "Seed synthesis failed; starting from an empty instruction");
                    String::new()
                }
            })
            .collect()
    } else {
        (0..plan.num_instructions)
            .map(|i| plan.seeds[i % plan.seeds.len()].clone())
            .collect()
    };

    for round in 0..plan.num_rounds {
        // Template draws are consumed for every lineage, in lineage order,
        // before any generation call is issued; concurrent generation cannot
        // reorder them.
        let picks: Vec<MutationTemplate> = lineages
            .iter()
            .map(|_| plan.templates[rng.random_range(0..plan.templates.len())])
            .collect();
        let prompts: Vec<Conversation> = lineages
            .iter()
            .zip(&picks)
            .map(|(instruction, template)| vec![ChatMessage::user(template.render(instruction))])
            .collect();

        let results = generate_bounded(&plan.llm, &plan.params, plan.concurrency, prompts).await;
        for (lineage, result) in results.into_iter().enumerate() {
            match result {
                Ok(candidate) => {
                    let bytes = candidate.len();
                    if bytes >= plan.min_length && bytes <= plan.max_length {
                        lineages[lineage] = candidate;
                    } else {
                        tracing::debug!(
                            lineage,
                            round,
                            bytes,
                            "Discarding evolved instruction outside length bounds"
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        lineage,
                        round,
                        error = %e,
                        "Evolution call failed; keeping previous instruction"
                    );
                }
            }
        }
    }

    // One generation per lineage per requested generation count.
    let generations: Vec<(usize, String)> = lineages
        .iter()
        .enumerate()
        .flat_map(|(lineage, instruction)| {
            std::iter::repeat(instruction.clone())
                .take(plan.num_generations)
                .map(move |instruction| (lineage, instruction))
        })
        .collect();

    let answers: Vec<Option<String>> = if plan.generate_answers {
        let prompts: Vec<Conversation> = generations
            .iter()
            .map(|(_, instruction)| vec![ChatMessage::user(instruction.clone())])
            .collect();
        generate_bounded(&plan.llm, &plan.params, plan.concurrency, prompts)
            .await
            .into_iter()
            .enumerate()
            .map(|(index, result)| match result {
                Ok(answer) => Some(answer),
                Err(e) => {
                    tracing::warn!(index, error = %e, "Answer generation failed");
                    None
                }
            })
            .collect()
    } else {
        vec![None; generations.len()]
    };

    let mut records = Vec::new();
    if plan.group_generations {
        for lineage in 0..lineages.len() {
            let mut instructions = Vec::new();
            let mut lineage_answers = Vec::new();
            for ((owner, instruction), answer) in generations.iter().zip(&answers) {
                if *owner == lineage {
                    instructions.push(json!(instruction));
                    lineage_answers.push(answer.as_ref().map(|a| json!(a)).unwrap_or(Value::Null));
                }
            }
            let mut record = Record::new();
            record.set("instructions", Value::Array(instructions));
            if plan.generate_answers {
                record.set("answers", Value::Array(lineage_answers));
            }
            record.set("model_name", json!(plan.model_name));
            records.push(record);
        }
    } else {
        for ((_, instruction), answer) in generations.iter().zip(&answers) {
            let mut record = Record::new();
            record.set("instruction", json!(instruction));
            if plan.generate_answers {
                record.set(
                    "answer",
                    answer.as_ref().map(|a| json!(a)).unwrap_or(Value::Null),
                );
            }
            record.set("model_name", json!(plan.model_name));
            records.push(record);
        }
    }
    Ok(records)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
