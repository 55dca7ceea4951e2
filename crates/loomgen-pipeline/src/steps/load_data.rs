use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{json, Value};

use loomgen_types::{Batch, LoomError, Record, Result};

use crate::descriptor::{mappings_field, u64_field, AdapterRegistry};
use crate::runner::Pipeline;
use crate::step::{BatchStream, Step, StepCore};

// ---------------------------------------------------------------------------
// LoadData
// ---------------------------------------------------------------------------

/// Generator step that re-emits construction-time records in
/// `batch_size`-sized batches, the final one flagged terminal.
pub struct LoadData {
    core: StepCore,
    data: Vec<Record>,
}

impl LoadData {
    pub fn builder() -> LoadDataBuilder {
        LoadDataBuilder::default()
    }

    pub(crate) fn from_descriptor(
        descriptor: &Value,
        _adapters: &AdapterRegistry,
    ) -> Result<Box<dyn Step>> {
        let name = descriptor["name"]
            .as_str()
            .ok_or_else(|| LoomError::Other("step descriptor is missing 'name'".into()))?;
        let data: Vec<Record> = serde_json::from_value(
            descriptor.get("data").cloned().unwrap_or(json!([])),
        )?;

        let mut core = StepCore::new(name);
        core.input_mappings = mappings_field(descriptor, "input_mappings")?;
        core.output_mappings = mappings_field(descriptor, "output_mappings")?;
        core.batch_size = u64_field(descriptor, "batch_size", core.batch_size as u64)? as usize;

        Ok(Box::new(Self { core, data }))
    }
}

#[async_trait]
impl Step for LoadData {
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
        self.data
            .first()
            .map(|record| record.field_names().map(String::from).collect())
            .unwrap_or_default()
    }

    fn process(&mut self, _inputs: Vec<Batch>) -> Result<BatchStream> {
        self.core.begin_process()?;
        let data = self.data.clone();
        let batch_size = self.core.batch_size.max(1);
        let stream = async_stream::try_stream! {
            if data.is_empty() {
                yield Batch::terminal(Vec::new());
            } else {
                let total = data.len().div_ceil(batch_size);
                for (index, chunk) in data.chunks(batch_size).enumerate() {
                    yield Batch::new(chunk.to_vec(), index + 1 == total);
                }
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
            "data": serde_json::to_value(&self.data).unwrap_or(Value::Null),
            "runtime_parameters_info": [],
            "type_info": {
                "module": "loomgen_pipeline::steps",
                "name": "LoadData",
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct LoadDataBuilder {
    name: Option<String>,
    pipeline: Option<String>,
    data: Option<Vec<Record>>,
    batch_size: Option<usize>,
    output_mappings: HashMap<String, String>,
}

impl LoadDataBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn pipeline(mut self, pipeline: &Pipeline) -> Self {
        self.pipeline = Some(pipeline.name().to_string());
        self
    }

    pub fn data(mut self, data: Vec<Record>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    pub fn output_mappings(mut self, mappings: HashMap<String, String>) -> Self {
        self.output_mappings = mappings;
        self
    }

    pub fn build(self) -> Result<LoadData> {
        let name = self.name.ok_or_else(|| LoomError::Configuration {
            step: "<unnamed>".into(),
            message: "missing required field 'name'".into(),
        })?;
        let data = self.data.ok_or_else(|| LoomError::Configuration {
            step: name.clone(),
            message: "missing required field 'data'".into(),
        })?;
        if self.pipeline.is_none() {
            return Err(LoomError::Configuration {
                step: name,
                message: "hasn't received a pipeline".into(),
            });
        }

        let mut core = StepCore::new(name);
        core.output_mappings = self.output_mappings;
        if let Some(size) = self.batch_size {
            core.batch_size = size;
        }
        Ok(LoadData { core, data })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
