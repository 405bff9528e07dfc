//! Validation of user-generated aggregation pipelines.
//!
//! Only the custom-pipeline tool goes through here. Policy: a stage
//! allow-list, a forbidden-operator scan at every nesting depth, lookup
//! ownership against the caller's own connections, and a forced terminal
//! row limit.

use serde_json::{json, Value};

use sheetsight_core::error::codes;
use sheetsight_core::{Error, Result};

pub const MAX_LIMIT: u64 = 1000;

const ALLOWED_STAGES: &[&str] = &[
    "$match", "$group", "$sort", "$limit", "$project", "$lookup", "$unwind", "$count",
];
const FORBIDDEN_OPERATORS: &[&str] = &["$out", "$merge", "$delete"];

#[derive(Debug, Default, Clone, Copy)]
pub struct PipelineValidator;

impl PipelineValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate and sanitize a pipeline, returning the form that may be
    /// executed. Errors name the offending stage.
    pub fn validate(&self, pipeline: &[Value], user_connection_ids: &[String]) -> Result<Vec<Value>> {
        if pipeline.is_empty() {
            return Err(Error::validation(
                codes::BAD_PIPELINE,
                "pipeline cannot be empty",
            ));
        }

        let mut sanitized: Vec<Value> = Vec::with_capacity(pipeline.len() + 1);
        for stage in pipeline {
            let obj = stage.as_object().filter(|o| o.len() == 1).ok_or_else(|| {
                Error::validation(
                    codes::BAD_PIPELINE,
                    "each pipeline stage must be an object with exactly one operator",
                )
            })?;
            let (name, spec) = obj.iter().next().expect("len checked");

            if let Some(forbidden) = find_forbidden_operator(stage) {
                return Err(Error::validation(
                    codes::FORBIDDEN_STAGE,
                    format!("operator '{forbidden}' is not allowed in stage '{name}'"),
                ));
            }
            if !ALLOWED_STAGES.contains(&name.as_str()) {
                return Err(Error::validation(
                    codes::UNSUPPORTED_STAGE,
                    format!(
                        "stage '{name}' is not supported; allowed stages: {}",
                        ALLOWED_STAGES.join(", ")
                    ),
                ));
            }

            match name.as_str() {
                "$lookup" => {
                    validate_lookup(spec, user_connection_ids)?;
                    sanitized.push(stage.clone());
                }
                "$limit" => {
                    let limit = spec.as_u64().filter(|n| *n >= 1).ok_or_else(|| {
                        Error::validation(
                            codes::BAD_LIMIT,
                            "$limit must be a positive integer",
                        )
                    })?;
                    sanitized.push(json!({"$limit": limit.min(MAX_LIMIT)}));
                }
                _ => sanitized.push(stage.clone()),
            }
        }

        // Force a terminal row cap: clamp a user-supplied trailing $limit,
        // append one otherwise.
        let ends_with_limit = sanitized
            .last()
            .and_then(Value::as_object)
            .is_some_and(|o| o.contains_key("$limit"));
        if !ends_with_limit {
            sanitized.push(json!({"$limit": MAX_LIMIT}));
        }

        Ok(sanitized)
    }
}

/// Depth-first scan for forbidden operators anywhere inside a stage.
fn find_forbidden_operator(value: &Value) -> Option<&'static str> {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                if let Some(found) = FORBIDDEN_OPERATORS.iter().find(|op| *op == key) {
                    return Some(found);
                }
                if let Some(found) = find_forbidden_operator(nested) {
                    return Some(found);
                }
            }
            None
        }
        Value::Array(items) => items.iter().find_map(find_forbidden_operator),
        _ => None,
    }
}

fn validate_lookup(spec: &Value, user_connection_ids: &[String]) -> Result<()> {
    let from = spec
        .get("from")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            Error::validation(codes::BAD_PIPELINE, "$lookup must specify a 'from' value")
        })?;
    if !user_connection_ids.iter().any(|id| id == from) {
        return Err(Error::validation(
            codes::FORBIDDEN_LOOKUP,
            format!("$lookup references '{from}', which is not one of your connections"),
        ));
    }
    Ok(())
}
