use anyhow::{anyhow, Result};
use include_dir::{include_dir, Dir};
use jsonschema::{Draft, JSONSchema};
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

static SCHEMAS_DIR: Dir = include_dir!("$CARGO_MANIFEST_DIR/../../schemas");

pub const ARTIFACT_SUBMISSION_SCHEMA: &str = "artifact_submission_v1.json";
pub const PARSER_OUTPUT_SCHEMA: &str = "parser_output_v1.json";
pub const EPISODE_CONFIG_SCHEMA: &str = "episode_config_v1.json";

pub fn schema_names() -> Vec<String> {
    SCHEMAS_DIR
        .files()
        .filter_map(|f| {
            f.path()
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
        })
        .collect()
}

pub fn load_schema(name: &str) -> Result<Value> {
    if let Some(file) = SCHEMAS_DIR.get_file(name) {
        let data = std::str::from_utf8(file.contents())?;
        return Ok(serde_json::from_str(data)?);
    }

    // Dev fallback: allow newly added schema files before this crate is rebuilt.
    let fs_path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../schemas")
        .join(name);
    if fs_path.exists() {
        let data = fs::read_to_string(fs_path)?;
        return Ok(serde_json::from_str(&data)?);
    }

    Err(anyhow!("schema not found: {}", name))
}

pub fn compile_schema(name: &str) -> Result<JSONSchema> {
    let schema = load_schema(name)?;
    let schema = Box::leak(Box::new(schema));
    let compiled = JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(schema)?;
    Ok(compiled)
}

fn cached_schema(name: &str, slot: &'static OnceLock<JSONSchema>) -> Result<&'static JSONSchema> {
    if let Some(compiled) = slot.get() {
        return Ok(compiled);
    }
    let compiled = compile_schema(name)?;
    Ok(slot.get_or_init(|| compiled))
}

fn validate_against(
    name: &str,
    slot: &'static OnceLock<JSONSchema>,
    instance: &Value,
) -> Result<()> {
    let compiled = cached_schema(name, slot)?;
    let outcome = compiled.validate(instance);
    if let Err(errors) = outcome {
        let details: Vec<String> = errors
            .map(|e| format!("{} at {}", e, e.instance_path))
            .collect();
        return Err(anyhow!(
            "instance does not satisfy {}: {}",
            name,
            details.join("; ")
        ));
    }
    Ok(())
}

static ARTIFACT_SUBMISSION_COMPILED: OnceLock<JSONSchema> = OnceLock::new();
static PARSER_OUTPUT_COMPILED: OnceLock<JSONSchema> = OnceLock::new();
static EPISODE_CONFIG_COMPILED: OnceLock<JSONSchema> = OnceLock::new();

/// Checks the injector's submit_artifact arguments before an artifact record
/// is built from them.
pub fn validate_artifact_submission(instance: &Value) -> Result<()> {
    validate_against(
        ARTIFACT_SUBMISSION_SCHEMA,
        &ARTIFACT_SUBMISSION_COMPILED,
        instance,
    )
}

/// Checks that test-parser stdout is a single JSON object with string values.
/// Status strings themselves are interpreted downstream; unknown values map
/// to an error status rather than failing schema validation.
pub fn validate_parser_output(instance: &Value) -> Result<()> {
    validate_against(PARSER_OUTPUT_SCHEMA, &PARSER_OUTPUT_COMPILED, instance)
}

pub fn validate_episode_config(instance: &Value) -> Result<()> {
    validate_against(EPISODE_CONFIG_SCHEMA, &EPISODE_CONFIG_COMPILED, instance)
}
