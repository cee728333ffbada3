//! Plan files: YAML on disk, checked against an embedded JSON Schema.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use jsonschema::Draft;
use serde_json::Value;
use tracing::debug;

use crate::core::plan::Plan;
use crate::errors::StackError;

const PLAN_SCHEMA: &str = include_str!("../../schemas/plan.schema.json");

/// Parse a YAML plan document.
///
/// YAML syntax errors, schema violations and type mismatches all surface as
/// [`StackError::PlanParse`].
pub fn parse_plan(text: &str) -> Result<Plan> {
    let document: Value = serde_yaml::from_str(text).map_err(|err| plan_parse(err.to_string()))?;
    validate_schema(&document)?;
    let plan: Plan =
        serde_json::from_value(document).map_err(|err| plan_parse(err.to_string()))?;
    debug!(steps = plan.len(), "parsed plan");
    Ok(plan)
}

pub fn load_plan(path: &Path) -> Result<Plan> {
    let text =
        fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))?;
    parse_plan(&text).with_context(|| format!("load plan {}", path.display()))
}

/// Render a plan as YAML.
pub fn render_plan(plan: &Plan) -> Result<String> {
    serde_yaml::to_string(plan).context("serialize plan yaml")
}

/// Atomically write a plan to disk (temp file + rename).
pub fn write_plan(path: &Path, plan: &Plan) -> Result<()> {
    let contents = render_plan(plan)?;
    let parent = path
        .parent()
        .with_context(|| format!("plan path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("yaml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp plan {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace plan {}", path.display()))?;
    Ok(())
}

fn validate_schema(instance: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(PLAN_SCHEMA).context("parse plan schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile plan schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| {
            let location = err.instance_path().to_string();
            if location.is_empty() {
                err.to_string()
            } else {
                format!("{location}: {err}")
            }
        })
        .collect();
    if !messages.is_empty() {
        return Err(plan_parse(messages.join("; ")));
    }
    Ok(())
}

fn plan_parse(message: String) -> anyhow::Error {
    StackError::PlanParse { message }.into()
}
