//! CLI binary for running and validating Loomgen pipelines.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use loomgen_pipeline::{RuntimeOverrides, StepRegistry};

#[derive(Parser)]
#[command(name = "loomgen", version, about = "Pipeline runner for LLM-driven text generation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline from a descriptor file
    Run {
        /// Path to the pipeline descriptor JSON
        pipeline: PathBuf,

        /// Runtime parameter overrides as step.param=value (value parsed as JSON)
        #[arg(short, long)]
        param: Vec<String>,

        /// Write leaf records as JSON lines to this file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate a pipeline descriptor without running it
    Validate {
        /// Path to the pipeline descriptor JSON
        pipeline: PathBuf,
    },

    /// Show the runtime-tunable parameters of every step
    Info {
        /// Path to the pipeline descriptor JSON
        pipeline: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run {
            pipeline,
            param,
            output,
        } => cmd_run(&pipeline, &param, output.as_deref()).await?,
        Commands::Validate { pipeline } => cmd_validate(&pipeline)?,
        Commands::Info { pipeline } => cmd_info(&pipeline)?,
    }
    Ok(())
}

fn load_pipeline(path: &Path) -> anyhow::Result<loomgen_pipeline::Pipeline> {
    let raw = std::fs::read_to_string(path)?;
    let descriptor: serde_json::Value = serde_json::from_str(&raw)?;
    let registry = StepRegistry::with_defaults();
    Ok(registry.load_pipeline(&descriptor)?)
}

/// Parse `step.param=value` override flags. The value is parsed as JSON,
/// falling back to a plain string.
fn parse_overrides(params: &[String]) -> anyhow::Result<RuntimeOverrides> {
    let mut overrides: RuntimeOverrides = HashMap::new();
    for entry in params {
        let (target, raw_value) = entry
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("override '{entry}' is not of the form step.param=value"))?;
        let (step, param) = target
            .split_once('.')
            .ok_or_else(|| anyhow::anyhow!("override target '{target}' is not of the form step.param"))?;
        let value = serde_json::from_str(raw_value)
            .unwrap_or_else(|_| serde_json::Value::String(raw_value.to_string()));
        overrides
            .entry(step.to_string())
            .or_default()
            .insert(param.to_string(), value);
    }
    Ok(overrides)
}

async fn cmd_run(path: &Path, params: &[String], output: Option<&Path>) -> anyhow::Result<()> {
    let mut pipeline = load_pipeline(path)?;
    let overrides = parse_overrides(params)?;

    tracing::info!(pipeline = %pipeline.name(), "Starting pipeline run");
    let result = pipeline.run_with(overrides).await?;

    let mut lines = Vec::new();
    for (step, records) in &result.records_by_step {
        for record in records {
            let mut line = serde_json::Map::new();
            line.insert("step".into(), serde_json::Value::String(step.clone()));
            line.insert("record".into(), serde_json::to_value(record)?);
            lines.push(serde_json::Value::Object(line));
        }
    }

    match output {
        Some(path) => {
            let mut file = std::fs::File::create(path)?;
            for line in &lines {
                writeln!(file, "{line}")?;
            }
            tracing::info!(records = lines.len(), path = %path.display(), "Wrote output records");
        }
        None => {
            let stdout = std::io::stdout();
            let mut handle = stdout.lock();
            for line in &lines {
                writeln!(handle, "{line}")?;
            }
        }
    }
    Ok(())
}

fn cmd_validate(path: &Path) -> anyhow::Result<()> {
    let pipeline = load_pipeline(path)?;
    pipeline.graph().validate()?;
    println!(
        "Pipeline '{}' is valid: {} steps, {} connections",
        pipeline.name(),
        pipeline.graph().len(),
        pipeline.graph().edges().len()
    );
    Ok(())
}

fn cmd_info(path: &Path) -> anyhow::Result<()> {
    let pipeline = load_pipeline(path)?;
    let info = pipeline.runtime_parameters_info();
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_overrides_splits_step_and_param() {
        let overrides =
            parse_overrides(&["evolve.seed=7".to_string(), "evolve.max_length=100".to_string()])
                .unwrap();
        let evolve = &overrides["evolve"];
        assert_eq!(evolve["seed"], serde_json::json!(7));
        assert_eq!(evolve["max_length"], serde_json::json!(100));
    }

    #[test]
    fn parse_overrides_falls_back_to_string_values() {
        let overrides = parse_overrides(&["step.mode=fast".to_string()]).unwrap();
        assert_eq!(overrides["step"]["mode"], serde_json::json!("fast"));
    }

    #[test]
    fn parse_overrides_rejects_malformed_entries() {
        assert!(parse_overrides(&["no-equals".to_string()]).is_err());
        assert!(parse_overrides(&["nodot=1".to_string()]).is_err());
    }
}
