//! Descriptor serialization: restorable step/adapter descriptors with
//! type-identity resolution.
//!
//! A descriptor is a JSON mapping of constructor state plus a
//! `type_info: {module, name}` tag naming the concrete type. Registries
//! resolve the tag back to a constructor, so polymorphic fields (which
//! adapter backs a step, which step variant a pipeline node is) reconstruct
//! exactly without hardcoding.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use loomgen_llm::{AdapterConfig, DynAdapter, OpenAiAdapter};
use loomgen_types::{LoomError, Result};

use crate::evol::EvolInstructGenerator;
use crate::step::Step;
use crate::steps::{LoadData, TextGeneration};

// ---------------------------------------------------------------------------
// type_info
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeInfo {
    pub module: String,
    pub name: String,
}

impl TypeInfo {
    fn key(&self) -> String {
        format!("{}.{}", self.module, self.name)
    }
}

/// Read the `type_info` tag out of a descriptor.
pub fn read_type_info(descriptor: &Value) -> Result<TypeInfo> {
    let info = descriptor.get("type_info").ok_or_else(|| {
        LoomError::Other("descriptor is missing 'type_info'".into())
    })?;
    let module = info["module"]
        .as_str()
        .ok_or_else(|| LoomError::Other("'type_info' is missing 'module'".into()))?;
    let name = info["name"]
        .as_str()
        .ok_or_else(|| LoomError::Other("'type_info' is missing 'name'".into()))?;
    Ok(TypeInfo {
        module: module.to_string(),
        name: name.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Descriptor field helpers
// ---------------------------------------------------------------------------

pub(crate) fn u64_field(descriptor: &Value, key: &str, default: u64) -> Result<u64> {
    match descriptor.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v.as_u64().ok_or_else(|| {
            LoomError::Other(format!("descriptor field '{key}' must be an unsigned integer"))
        }),
    }
}

pub(crate) fn bool_field(descriptor: &Value, key: &str, default: bool) -> Result<bool> {
    match descriptor.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v.as_bool().ok_or_else(|| {
            LoomError::Other(format!("descriptor field '{key}' must be a boolean"))
        }),
    }
}

pub(crate) fn mappings_field(
    descriptor: &Value,
    key: &str,
) -> Result<HashMap<String, String>> {
    match descriptor.get(key) {
        None | Some(Value::Null) => Ok(HashMap::new()),
        Some(v) => serde_json::from_value(v.clone()).map_err(|e| {
            LoomError::Other(format!("descriptor field '{key}' must map field names: {e}"))
        }),
    }
}

pub(crate) fn string_list_field(descriptor: &Value, key: &str) -> Result<Vec<String>> {
    match descriptor.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(v) => serde_json::from_value(v.clone()).map_err(|e| {
            LoomError::Other(format!("descriptor field '{key}' must be a list of strings: {e}"))
        }),
    }
}

// ---------------------------------------------------------------------------
// AdapterRegistry
// ---------------------------------------------------------------------------

pub type AdapterCtor = Box<dyn Fn(&Value) -> Result<Arc<DynAdapter>> + Send + Sync>;

/// Resolves adapter `type_info` tags back to constructors.
pub struct AdapterRegistry {
    ctors: HashMap<String, AdapterCtor>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            ctors: HashMap::new(),
        }
    }

    /// Registry pre-loaded with the built-in adapters.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(
            "loomgen_llm::openai",
            "OpenAiAdapter",
            Box::new(openai_from_descriptor),
        );
        registry
    }

    pub fn register(&mut self, module: &str, name: &str, ctor: AdapterCtor) {
        self.ctors.insert(format!("{module}.{name}"), ctor);
    }

    pub fn load(&self, descriptor: &Value) -> Result<Arc<DynAdapter>> {
        let info = read_type_info(descriptor)?;
        let ctor = self.ctors.get(&info.key()).ok_or_else(|| {
            LoomError::UnresolvableType {
                module: info.module.clone(),
                name: info.name.clone(),
            }
        })?;
        ctor(descriptor)
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn openai_from_descriptor(descriptor: &Value) -> Result<Arc<DynAdapter>> {
    let mut config = AdapterConfig {
        // The credential is never part of a descriptor; the environment
        // supplies the default at load time.
        api_key: std::env::var("OPENAI_API_KEY").unwrap_or_default(),
        ..AdapterConfig::default()
    };
    if let Some(model) = descriptor["model"].as_str() {
        config.model = model.to_string();
    }
    if let Some(url) = descriptor["base_url"].as_str() {
        config.base_url = url.to_string();
    }
    if let Some(secs) = descriptor["timeout_secs"].as_u64() {
        config.timeout = Duration::from_secs(secs);
    }
    if let Some(attempts) = descriptor["max_attempts"].as_u64() {
        config.max_attempts = attempts as usize;
    }
    Ok(Arc::new(DynAdapter::new(OpenAiAdapter::new(config)?)))
}

// ---------------------------------------------------------------------------
// StepRegistry
// ---------------------------------------------------------------------------

pub type StepCtor = Box<dyn Fn(&Value, &AdapterRegistry) -> Result<Box<dyn Step>> + Send + Sync>;

/// Resolves step `type_info` tags back to constructors. `load(dump(step))`
/// reconstructs a step field-for-field equal to the original.
pub struct StepRegistry {
    ctors: HashMap<String, StepCtor>,
    adapters: AdapterRegistry,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self {
            ctors: HashMap::new(),
            adapters: AdapterRegistry::new(),
        }
    }

    /// Registry pre-loaded with the built-in steps and adapters.
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            ctors: HashMap::new(),
            adapters: AdapterRegistry::with_defaults(),
        };
        registry.register(
            "loomgen_pipeline::steps",
            "LoadData",
            Box::new(LoadData::from_descriptor),
        );
        registry.register(
            "loomgen_pipeline::steps",
            "TextGeneration",
            Box::new(TextGeneration::from_descriptor),
        );
        registry.register(
            "loomgen_pipeline::evol",
            "EvolInstructGenerator",
            Box::new(EvolInstructGenerator::from_descriptor),
        );
        registry
    }

    pub fn register(&mut self, module: &str, name: &str, ctor: StepCtor) {
        self.ctors.insert(format!("{module}.{name}"), ctor);
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    pub fn adapters_mut(&mut self) -> &mut AdapterRegistry {
        &mut self.adapters
    }

    pub fn load(&self, descriptor: &Value) -> Result<Box<dyn Step>> {
        let info = read_type_info(descriptor)?;
        let ctor = self.ctors.get(&info.key()).ok_or_else(|| {
            LoomError::UnresolvableType {
                module: info.module.clone(),
                name: info.name.clone(),
            }
        })?;
        ctor(descriptor, &self.adapters)
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Pipeline descriptors
// ---------------------------------------------------------------------------

use crate::runner::Pipeline;

/// Serialize a whole pipeline: its name, every step's descriptor, and the
/// step connections.
pub fn dump_pipeline(pipeline: &Pipeline) -> Value {
    let steps: Vec<Value> = pipeline
        .graph()
        .step_names()
        .iter()
        .filter_map(|name| pipeline.graph().step(name).map(|s| s.dump()))
        .collect();
    let connections: Vec<Value> = pipeline
        .graph()
        .edges()
        .iter()
        .map(|(from, to)| serde_json::json!({ "from": from, "to": to }))
        .collect();
    serde_json::json!({
        "name": pipeline.name(),
        "steps": steps,
        "connections": connections,
    })
}

impl StepRegistry {
    /// Reconstruct a pipeline from its descriptor, resolving every step's
    /// type identity through this registry.
    pub fn load_pipeline(&self, descriptor: &Value) -> Result<Pipeline> {
        let name = descriptor["name"].as_str().unwrap_or("pipeline");
        let mut pipeline = Pipeline::new(name);
        let steps = descriptor["steps"].as_array().ok_or_else(|| {
            LoomError::Other("pipeline descriptor is missing 'steps'".into())
        })?;
        for step_descriptor in steps {
            pipeline.add_step(self.load(step_descriptor)?)?;
        }
        if let Some(connections) = descriptor["connections"].as_array() {
            for connection in connections {
                let from = connection["from"].as_str().ok_or_else(|| {
                    LoomError::Other("pipeline connection is missing 'from'".into())
                })?;
                let to = connection["to"].as_str().ok_or_else(|| {
                    LoomError::Other("pipeline connection is missing 'to'".into())
                })?;
                pipeline.connect(from, to)?;
            }
        }
        Ok(pipeline)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
