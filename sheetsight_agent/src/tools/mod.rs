//! The five stateless data-query tools exposed to the agent.
//!
//! Every tool resolves `connection_name` against the caller's own
//! connections before any read, so one user's agent can never touch
//! another user's rows. Results are serialized strings the model consumes
//! as tool output; failures come back as `{"error": ...}` payloads with
//! `is_error` set so the loop can count them.

mod queries;

use std::sync::Arc;

use serde_json::{json, Value};

use sheetsight_core::models::DataType;
use sheetsight_core::store::{ConnectionStore, RowQuery, SheetRowStore};
use sheetsight_core::Result;

use crate::validator::PipelineValidator;

pub const TOOL_GET_DATA_SCHEMA: &str = "get_data_schema";
pub const TOOL_AGGREGATE_DATA: &str = "aggregate_data";
pub const TOOL_GET_TOP_ITEMS: &str = "get_top_items";
pub const TOOL_COMPARE_PERIODS: &str = "compare_periods";
pub const TOOL_EXECUTE_AGGREGATION: &str = "execute_aggregation";

pub const TOOL_NAMES: &[&str] = &[
    TOOL_GET_DATA_SCHEMA,
    TOOL_AGGREGATE_DATA,
    TOOL_GET_TOP_ITEMS,
    TOOL_COMPARE_PERIODS,
    TOOL_EXECUTE_AGGREGATION,
];

#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub name: String,
    pub data_type: DataType,
    pub sample_values: Vec<Value>,
}

/// One connection as the agent sees it: name, fields, and samples.
#[derive(Debug, Clone)]
pub struct ConnectionSchema {
    pub connection_id: String,
    pub connection_name: String,
    pub sync_enabled: bool,
    pub fields: Vec<FieldInfo>,
}

/// Load the caller's connections with field schemas and up to three sample
/// values per field, drawn from the most recent synced rows.
pub async fn load_user_connections(
    user_id: &str,
    connections: &Arc<dyn ConnectionStore>,
    rows: &Arc<dyn SheetRowStore>,
) -> Result<Vec<ConnectionSchema>> {
    let owned = connections.find_connections_by_user(user_id).await?;
    let mut out = Vec::with_capacity(owned.len());
    for connection in owned {
        let mut query = RowQuery::all_rows(&connection.id);
        query.sort_desc = true;
        query.limit = 3;
        let sample = rows.find_rows(&query).await?;

        let fields = connection
            .column_mappings
            .iter()
            .map(|mapping| {
                let sample_values = sample
                    .rows
                    .iter()
                    .filter_map(|row| row.data.get(&mapping.system_field).cloned())
                    .filter(|v| !matches!(v, Value::Null))
                    .take(3)
                    .collect();
                FieldInfo {
                    name: mapping.system_field.clone(),
                    data_type: mapping.data_type,
                    sample_values,
                }
            })
            .collect();

        out.push(ConnectionSchema {
            connection_id: connection.id,
            connection_name: connection.tab_name,
            sync_enabled: connection.sync_enabled,
            fields,
        });
    }
    Ok(out)
}

/// Render the schema block embedded in the data-agent system prompt.
pub fn format_schema_context(connections: &[ConnectionSchema]) -> String {
    if connections.is_empty() {
        return "No data sources available. The user needs to set up data sync first.".to_string();
    }
    let mut lines = Vec::new();
    for connection in connections {
        lines.push(format!("### {}", connection.connection_name));
        if connection.fields.is_empty() {
            lines.push("  (no field information available)".to_string());
        } else {
            lines.push("Fields:".to_string());
            for field in &connection.fields {
                let samples = if field.sample_values.is_empty() {
                    String::new()
                } else {
                    let rendered: Vec<String> = field
                        .sample_values
                        .iter()
                        .map(|v| match v {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .collect();
                    format!(" (e.g., {})", rendered.join(", "))
                };
                lines.push(format!(
                    "  - {} ({:?}){samples}",
                    field.name, field.data_type
                ));
            }
        }
        lines.push(String::new());
    }
    lines.join("\n")
}

/// Outcome of one tool invocation, as fed back to the model.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub(crate) fn ok(value: &Value) -> Self {
        Self {
            content: serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string()),
            is_error: false,
        }
    }

    pub(crate) fn error(message: impl Into<String>) -> Self {
        Self {
            content: json!({ "error": message.into() }).to_string(),
            is_error: true,
        }
    }
}

/// The tool set bound to one request's caller.
pub struct DataTools {
    pub(crate) connections: Vec<ConnectionSchema>,
    pub(crate) rows: Arc<dyn SheetRowStore>,
    pub(crate) validator: PipelineValidator,
}

impl DataTools {
    pub fn new(connections: Vec<ConnectionSchema>, rows: Arc<dyn SheetRowStore>) -> Self {
        Self {
            connections,
            rows,
            validator: PipelineValidator::new(),
        }
    }

    /// Dispatch by tool name. Unknown names come back as a polite
    /// tool-error so the model can self-correct.
    #[tracing::instrument(level = "debug", skip(self, args))]
    pub async fn execute(&self, name: &str, args: &Value) -> ToolResult {
        match name {
            TOOL_GET_DATA_SCHEMA => self.get_data_schema(args),
            TOOL_AGGREGATE_DATA => self.aggregate_data(args).await,
            TOOL_GET_TOP_ITEMS => self.get_top_items(args).await,
            TOOL_COMPARE_PERIODS => self.compare_periods(args).await,
            TOOL_EXECUTE_AGGREGATION => self.execute_aggregation(args).await,
            unknown => ToolResult::error(format!(
                "Unknown tool '{unknown}'. Available tools: {}",
                TOOL_NAMES.join(", ")
            )),
        }
    }

    pub(crate) fn find_connection(&self, name: &str) -> Option<&ConnectionSchema> {
        self.connections
            .iter()
            .find(|c| c.connection_name.eq_ignore_ascii_case(name))
    }

    pub(crate) fn connection_names(&self) -> Vec<&str> {
        self.connections
            .iter()
            .map(|c| c.connection_name.as_str())
            .collect()
    }

    pub(crate) fn connection_ids(&self) -> Vec<String> {
        self.connections
            .iter()
            .map(|c| c.connection_id.clone())
            .collect()
    }
}

/// Function-call schemas advertised to the model.
pub fn tool_schemas() -> Vec<Value> {
    vec![
        function_schema(
            TOOL_GET_DATA_SCHEMA,
            "List the user's data connections with field names, types, and sample values. \
             Use this before querying unfamiliar data.",
            json!({
                "type": "object",
                "properties": {
                    "connection_name": {
                        "type": "string",
                        "description": "Optional connection to describe; omit for all connections."
                    }
                }
            }),
        ),
        function_schema(
            TOOL_AGGREGATE_DATA,
            "Aggregate data with sum, count, avg, min, or max, optionally grouped and \
             filtered by field values or a date range.",
            json!({
                "type": "object",
                "properties": {
                    "connection_name": {"type": "string"},
                    "operation": {"type": "string", "enum": ["sum", "count", "avg", "min", "max"]},
                    "field": {"type": "string", "description": "Field to aggregate (required except for count)."},
                    "group_by": {"type": "string"},
                    "filters": {"type": "object", "description": "Equality filters, e.g. {\"order_status\": \"completed\"}."},
                    "date_field": {"type": "string"},
                    "date_from": {"type": "string", "description": "YYYY-MM-DD"},
                    "date_to": {"type": "string", "description": "YYYY-MM-DD"}
                },
                "required": ["connection_name", "operation"]
            }),
        ),
        function_schema(
            TOOL_GET_TOP_ITEMS,
            "Rank rows or groups and return the top N. Use for best sellers, biggest \
             customers, highest values.",
            json!({
                "type": "object",
                "properties": {
                    "connection_name": {"type": "string"},
                    "sort_field": {"type": "string"},
                    "sort_order": {"type": "string", "enum": ["asc", "desc"]},
                    "limit": {"type": "integer"},
                    "group_by": {"type": "string"},
                    "aggregate_field": {"type": "string", "description": "Field summed per group when group_by is set."},
                    "filters": {"type": "object"}
                },
                "required": ["connection_name", "sort_field"]
            }),
        ),
        function_schema(
            TOOL_COMPARE_PERIODS,
            "Compare an aggregate between two date ranges; returns both values, the \
             difference, and the percentage change.",
            json!({
                "type": "object",
                "properties": {
                    "connection_name": {"type": "string"},
                    "operation": {"type": "string", "enum": ["sum", "count", "avg"]},
                    "field": {"type": "string"},
                    "date_field": {"type": "string"},
                    "period1_from": {"type": "string", "description": "YYYY-MM-DD"},
                    "period1_to": {"type": "string", "description": "YYYY-MM-DD"},
                    "period2_from": {"type": "string", "description": "YYYY-MM-DD"},
                    "period2_to": {"type": "string", "description": "YYYY-MM-DD"},
                    "group_by": {"type": "string"}
                },
                "required": ["connection_name", "operation", "date_field",
                             "period1_from", "period1_to", "period2_from", "period2_to"]
            }),
        ),
        function_schema(
            TOOL_EXECUTE_AGGREGATION,
            "Run a custom aggregation pipeline for queries the simpler tools cannot \
             express. The pipeline is validated and capped at 1000 rows. All user \
             fields live under the 'data.' prefix.",
            json!({
                "type": "object",
                "properties": {
                    "connection_name": {"type": "string"},
                    "pipeline": {"type": "array", "items": {"type": "object"}},
                    "description": {"type": "string", "description": "What the pipeline computes."}
                },
                "required": ["connection_name", "pipeline", "description"]
            }),
        ),
    ]
}

fn function_schema(name: &str, description: &str, parameters: Value) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": name,
            "description": description,
            "parameters": parameters,
        }
    })
}
