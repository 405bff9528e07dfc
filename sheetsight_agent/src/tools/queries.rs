//! Implementations of the five data-query tools.

use chrono::NaiveDate;
use serde_json::{json, Map, Value};

use super::{DataTools, ToolResult};
use crate::validator::MAX_LIMIT;

const VALID_OPERATIONS: &[&str] = &["sum", "count", "avg", "min", "max"];
const COMPARE_OPERATIONS: &[&str] = &["sum", "count", "avg"];
const DEFAULT_TOP_LIMIT: u64 = 10;

fn str_arg<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn parse_iso_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()
}

impl DataTools {
    fn resolve(&self, args: &Value) -> Result<&super::ConnectionSchema, ToolResult> {
        let Some(name) = str_arg(args, "connection_name") else {
            return Err(ToolResult::error("connection_name is required"));
        };
        self.find_connection(name).ok_or_else(|| {
            ToolResult::error(format!(
                "Connection '{name}' not found. Available connections: {}",
                self.connection_names().join(", ")
            ))
        })
    }

    pub(super) fn get_data_schema(&self, args: &Value) -> ToolResult {
        if self.connections.is_empty() {
            return ToolResult::error(
                "No data connections found. Please set up data sync first.",
            );
        }
        if let Some(name) = str_arg(args, "connection_name") {
            let Some(connection) = self.find_connection(name) else {
                return ToolResult::error(format!(
                    "Connection '{name}' not found. Available connections: {}",
                    self.connection_names().join(", ")
                ));
            };
            return ToolResult::ok(&json!({
                "connection_name": connection.connection_name,
                "connection_id": connection.connection_id,
                "sync_enabled": connection.sync_enabled,
                "fields": connection.fields.iter().map(|f| json!({
                    "name": f.name,
                    "type": format!("{:?}", f.data_type).to_lowercase(),
                    "sample_values": f.sample_values,
                })).collect::<Vec<_>>(),
            }));
        }
        let all: Vec<Value> = self
            .connections
            .iter()
            .map(|c| {
                json!({
                    "connection_name": c.connection_name,
                    "connection_id": c.connection_id,
                    "sync_enabled": c.sync_enabled,
                    "field_count": c.fields.len(),
                    "fields": c.fields.iter().map(|f| f.name.clone()).collect::<Vec<_>>(),
                })
            })
            .collect();
        ToolResult::ok(&Value::Array(all))
    }

    /// Shared match stage: connection scoping, equality filters, and an
    /// optional date range on `data.<date_field>`.
    fn build_match(
        connection_id: &str,
        args: &Value,
        date_from: Option<&str>,
        date_to: Option<&str>,
    ) -> Result<Value, ToolResult> {
        let mut stage = Map::new();
        stage.insert("connection_id".into(), json!(connection_id));
        if let Some(filters) = args.get("filters").and_then(Value::as_object) {
            for (key, value) in filters {
                stage.insert(format!("data.{key}"), value.clone());
            }
        }
        if date_from.is_some() || date_to.is_some() {
            let Some(date_field) = str_arg(args, "date_field") else {
                return Err(ToolResult::error(
                    "date_field is required when filtering by date",
                ));
            };
            let mut range = Map::new();
            if let Some(from) = date_from {
                let Some(date) = parse_iso_date(from) else {
                    return Err(ToolResult::error(format!(
                        "invalid date '{from}', expected YYYY-MM-DD"
                    )));
                };
                range.insert("$gte".into(), json!(date.to_string()));
            }
            if let Some(to) = date_to {
                let Some(date) = parse_iso_date(to) else {
                    return Err(ToolResult::error(format!(
                        "invalid date '{to}', expected YYYY-MM-DD"
                    )));
                };
                range.insert("$lte".into(), json!(date.to_string()));
            }
            stage.insert(format!("data.{date_field}"), Value::Object(range));
        }
        Ok(json!({ "$match": stage }))
    }

    fn aggregate_pipeline(
        connection_id: &str,
        args: &Value,
        operation: &str,
        field: Option<&str>,
        group_by: Option<&str>,
        date_from: Option<&str>,
        date_to: Option<&str>,
    ) -> Result<Vec<Value>, ToolResult> {
        let mut pipeline = vec![Self::build_match(connection_id, args, date_from, date_to)?];

        let mut group = Map::new();
        group.insert(
            "_id".into(),
            match group_by {
                Some(g) => json!(format!("$data.{g}")),
                None => Value::Null,
            },
        );
        let accumulator = match operation {
            "count" => json!({"$sum": 1}),
            op => {
                let field = field.expect("validated by caller");
                let reference = json!(format!("$data.{field}"));
                match op {
                    "sum" => json!({"$sum": reference}),
                    "avg" => json!({"$avg": reference}),
                    "min" => json!({"$min": reference}),
                    "max" => json!({"$max": reference}),
                    _ => unreachable!("validated by caller"),
                }
            }
        };
        group.insert("result".into(), accumulator);
        pipeline.push(json!({ "$group": group }));

        if group_by.is_some() {
            pipeline.push(json!({"$sort": {"result": -1}}));
        }
        let mut project = Map::new();
        project.insert("_id".into(), json!(0));
        project.insert("result".into(), json!(1));
        if let Some(g) = group_by {
            project.insert(g.to_string(), json!("$_id"));
        }
        pipeline.push(json!({ "$project": project }));
        pipeline.push(json!({"$limit": MAX_LIMIT}));
        Ok(pipeline)
    }

    pub(super) async fn aggregate_data(&self, args: &Value) -> ToolResult {
        let connection = match self.resolve(args) {
            Ok(c) => c,
            Err(err) => return err,
        };
        let Some(operation) = str_arg(args, "operation") else {
            return ToolResult::error("operation is required");
        };
        if !VALID_OPERATIONS.contains(&operation) {
            return ToolResult::error(format!(
                "Invalid operation '{operation}'. Valid operations: {}",
                VALID_OPERATIONS.join(", ")
            ));
        }
        let field = str_arg(args, "field");
        if operation != "count" && field.is_none() {
            return ToolResult::error(format!("field is required for '{operation}'"));
        }
        let group_by = str_arg(args, "group_by");

        let pipeline = match Self::aggregate_pipeline(
            &connection.connection_id,
            args,
            operation,
            field,
            group_by,
            str_arg(args, "date_from"),
            str_arg(args, "date_to"),
        ) {
            Ok(p) => p,
            Err(err) => return err,
        };
        match self.rows.aggregate(&pipeline).await {
            Ok(results) => ToolResult::ok(&json!({
                "connection_name": connection.connection_name,
                "operation": operation,
                "field": field,
                "group_by": group_by,
                "results": results,
            })),
            Err(err) => ToolResult::error(format!("Query failed: {err}")),
        }
    }

    pub(super) async fn get_top_items(&self, args: &Value) -> ToolResult {
        let connection = match self.resolve(args) {
            Ok(c) => c,
            Err(err) => return err,
        };
        let Some(sort_field) = str_arg(args, "sort_field") else {
            return ToolResult::error("sort_field is required");
        };
        let sort_order = str_arg(args, "sort_order").unwrap_or("desc");
        if sort_order != "asc" && sort_order != "desc" {
            return ToolResult::error("sort_order must be 'asc' or 'desc'");
        }
        let direction = if sort_order == "desc" { -1 } else { 1 };
        let limit = args
            .get("limit")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_TOP_LIMIT)
            .clamp(1, MAX_LIMIT);
        let group_by = str_arg(args, "group_by");
        let aggregate_field = str_arg(args, "aggregate_field");

        let mut pipeline = match Self::build_match(&connection.connection_id, args, None, None) {
            Ok(stage) => vec![stage],
            Err(err) => return err,
        };
        if let Some(group) = group_by {
            let mut group_stage = Map::new();
            group_stage.insert("_id".into(), json!(format!("$data.{group}")));
            let metric_key = if aggregate_field.is_some() { "total" } else { "count" };
            group_stage.insert(
                metric_key.to_string(),
                match aggregate_field {
                    Some(field) => json!({"$sum": format!("$data.{field}")}),
                    None => json!({"$sum": 1}),
                },
            );
            pipeline.push(json!({ "$group": group_stage }));
            let mut sort = Map::new();
            sort.insert(metric_key.to_string(), json!(direction));
            pipeline.push(json!({ "$sort": sort }));
            let mut project = Map::new();
            project.insert("_id".into(), json!(0));
            project.insert(group.to_string(), json!("$_id"));
            project.insert(metric_key.to_string(), json!(1));
            pipeline.push(json!({ "$project": project }));
        } else {
            let mut sort = Map::new();
            sort.insert(format!("data.{sort_field}"), json!(direction));
            pipeline.push(json!({ "$sort": sort }));
            pipeline.push(json!({"$project": {"_id": 0, "row_number": 1, "data": 1}}));
        }
        pipeline.push(json!({"$limit": limit}));

        match self.rows.aggregate(&pipeline).await {
            Ok(results) => ToolResult::ok(&json!({
                "connection_name": connection.connection_name,
                "sort_field": sort_field,
                "sort_order": sort_order,
                "limit": limit,
                "results": results,
            })),
            Err(err) => ToolResult::error(format!("Query failed: {err}")),
        }
    }

    pub(super) async fn compare_periods(&self, args: &Value) -> ToolResult {
        let connection = match self.resolve(args) {
            Ok(c) => c,
            Err(err) => return err,
        };
        let Some(operation) = str_arg(args, "operation") else {
            return ToolResult::error("operation is required");
        };
        if !COMPARE_OPERATIONS.contains(&operation) {
            return ToolResult::error(format!(
                "Invalid operation '{operation}' for comparison. Valid operations: {}",
                COMPARE_OPERATIONS.join(", ")
            ));
        }
        let field = str_arg(args, "field");
        if operation != "count" && field.is_none() {
            return ToolResult::error(format!("field is required for '{operation}'"));
        }
        if str_arg(args, "date_field").is_none() {
            return ToolResult::error("date_field is required");
        }
        let bounds = [
            "period1_from",
            "period1_to",
            "period2_from",
            "period2_to",
        ];
        for key in bounds {
            let Some(raw) = str_arg(args, key) else {
                return ToolResult::error(format!("{key} is required"));
            };
            if parse_iso_date(raw).is_none() {
                return ToolResult::error(format!("invalid date '{raw}' for {key}"));
            }
        }
        let group_by = str_arg(args, "group_by");

        let mut period_values = [0.0f64; 2];
        let mut period_results: [Vec<Value>; 2] = [Vec::new(), Vec::new()];
        for (i, (from_key, to_key)) in [("period1_from", "period1_to"), ("period2_from", "period2_to")]
            .into_iter()
            .enumerate()
        {
            let pipeline = match Self::aggregate_pipeline(
                &connection.connection_id,
                args,
                operation,
                field,
                group_by,
                str_arg(args, from_key),
                str_arg(args, to_key),
            ) {
                Ok(p) => p,
                Err(err) => return err,
            };
            let results = match self.rows.aggregate(&pipeline).await {
                Ok(results) => results,
                Err(err) => return ToolResult::error(format!("Query failed: {err}")),
            };
            period_values[i] = results
                .iter()
                .filter_map(|doc| doc.get("result").and_then(Value::as_f64))
                .sum();
            period_results[i] = results;
        }

        let [period1_value, period2_value] = period_values;
        let difference = period2_value - period1_value;
        let percentage_change = if period1_value == 0.0 {
            Value::Null
        } else {
            json!((period2_value - period1_value) / period1_value * 100.0)
        };

        let mut response = json!({
            "connection_name": connection.connection_name,
            "operation": operation,
            "period1": {"from": str_arg(args, "period1_from"), "to": str_arg(args, "period1_to")},
            "period2": {"from": str_arg(args, "period2_from"), "to": str_arg(args, "period2_to")},
            "period1_value": period1_value,
            "period2_value": period2_value,
            "difference": difference,
            "percentage_change": percentage_change,
        });
        if group_by.is_some() {
            let obj = response.as_object_mut().expect("built as object");
            obj.insert("period1_results".into(), Value::Array(period_results[0].clone()));
            obj.insert("period2_results".into(), Value::Array(period_results[1].clone()));
        }
        ToolResult::ok(&response)
    }

    pub(super) async fn execute_aggregation(&self, args: &Value) -> ToolResult {
        let connection = match self.resolve(args) {
            Ok(c) => c,
            Err(err) => return err,
        };
        let pipeline: Vec<Value> = match args.get("pipeline") {
            Some(Value::Array(stages)) => stages.clone(),
            Some(Value::String(raw)) => match serde_json::from_str(raw) {
                Ok(Value::Array(stages)) => stages,
                _ => return ToolResult::error("pipeline must be a JSON array of stages"),
            },
            _ => return ToolResult::error("pipeline must be an array of stages"),
        };

        let sanitized = match self.validator.validate(&pipeline, &self.connection_ids()) {
            Ok(p) => p,
            Err(err) => return ToolResult::error(err.to_string()),
        };

        // Connection scoping always comes first so a user pipeline cannot
        // widen its own read set.
        let mut scoped = Vec::with_capacity(sanitized.len() + 1);
        scoped.push(json!({"$match": {"connection_id": connection.connection_id}}));
        scoped.extend(sanitized);

        match self.rows.aggregate(&scoped).await {
            Ok(results) => ToolResult::ok(&json!({
                "connection_name": connection.connection_name,
                "description": str_arg(args, "description"),
                "row_count": results.len(),
                "results": results,
            })),
            Err(err) => ToolResult::error(format!("Pipeline execution failed: {err}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{load_user_connections, DataTools};
    use super::*;
    use chrono::Utc;
    use sheetsight_core::models::{ColumnMapping, Connection, DataType, SheetRow};
    use sheetsight_core::store::{ConnectionStore, MemoryDocumentStore, SheetRowStore};
    use std::sync::Arc;

    async fn seeded_tools() -> DataTools {
        let store = Arc::new(MemoryDocumentStore::new());
        let now = Utc::now();
        store
            .insert_connection(Connection {
                id: "conn_orders".into(),
                user_id: "u1".into(),
                sheet_id: "s1".into(),
                tab_name: "Orders".into(),
                column_mappings: vec![
                    ColumnMapping {
                        system_field: "order_id".into(),
                        sheet_column: "A".into(),
                        data_type: DataType::String,
                        required: false,
                    },
                    ColumnMapping {
                        system_field: "platform".into(),
                        sheet_column: "B".into(),
                        data_type: DataType::String,
                        required: false,
                    },
                    ColumnMapping {
                        system_field: "total_amount".into(),
                        sheet_column: "C".into(),
                        data_type: DataType::Number,
                        required: false,
                    },
                    ColumnMapping {
                        system_field: "order_date".into(),
                        sheet_column: "D".into(),
                        data_type: DataType::Date,
                        required: false,
                    },
                ],
                header_row: 1,
                data_start_row: 2,
                sync_enabled: true,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        // Another user's connection: must be invisible to u1's tools.
        store
            .insert_connection(Connection {
                id: "conn_other".into(),
                user_id: "u2".into(),
                sheet_id: "s2".into(),
                tab_name: "Orders".into(),
                column_mappings: vec![],
                header_row: 1,
                data_start_row: 2,
                sync_enabled: true,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        let orders: &[(&str, f64, &str)] = &[
            ("Shopee", 5_000_000.0, "2024-01-05"),
            ("Shopee", 5_000_000.0, "2024-01-20"),
            ("Lazada", 2_000_000.0, "2024-01-25"),
            ("Shopee", 12_000_000.0, "2024-02-10"),
        ];
        for (i, (platform, amount, date)) in orders.iter().enumerate() {
            store
                .upsert_row(SheetRow {
                    connection_id: "conn_orders".into(),
                    row_number: (i + 2) as u64,
                    data: json!({
                        "order_id": format!("O{i}"),
                        "platform": platform,
                        "total_amount": amount,
                        "order_date": date,
                    }),
                    raw: json!({}),
                    synced_at: now,
                })
                .await
                .unwrap();
        }

        let conn_store: Arc<dyn ConnectionStore> = store.clone();
        let row_store: Arc<dyn SheetRowStore> = store.clone();
        let connections = load_user_connections("u1", &conn_store, &row_store)
            .await
            .unwrap();
        assert_eq!(connections.len(), 1, "only u1's connections are loaded");
        DataTools::new(connections, row_store)
    }

    fn parsed(result: &ToolResult) -> Value {
        serde_json::from_str(&result.content).unwrap()
    }

    #[tokio::test]
    async fn schema_tool_lists_fields_and_samples() {
        let tools = seeded_tools().await;
        let result = tools
            .execute("get_data_schema", &json!({"connection_name": "orders"}))
            .await;
        assert!(!result.is_error);
        let value = parsed(&result);
        assert_eq!(value["connection_name"], json!("Orders"));
        let fields = value["fields"].as_array().unwrap();
        assert_eq!(fields.len(), 4);
        assert!(fields[2]["sample_values"].as_array().unwrap().len() <= 3);
    }

    #[tokio::test]
    async fn aggregate_sums_with_date_filter() {
        let tools = seeded_tools().await;
        let result = tools
            .execute(
                "aggregate_data",
                &json!({
                    "connection_name": "Orders",
                    "operation": "sum",
                    "field": "total_amount",
                    "date_field": "order_date",
                    "date_from": "2024-01-01",
                    "date_to": "2024-01-31",
                }),
            )
            .await;
        assert!(!result.is_error, "{}", result.content);
        let value = parsed(&result);
        assert_eq!(value["results"][0]["result"], json!(12_000_000));
    }

    #[tokio::test]
    async fn compare_periods_matches_expected_change() {
        let tools = seeded_tools().await;
        let result = tools
            .execute(
                "compare_periods",
                &json!({
                    "connection_name": "Orders",
                    "operation": "sum",
                    "field": "total_amount",
                    "date_field": "order_date",
                    "period1_from": "2024-01-01",
                    "period1_to": "2024-01-31",
                    "period2_from": "2024-02-01",
                    "period2_to": "2024-02-29",
                }),
            )
            .await;
        assert!(!result.is_error, "{}", result.content);
        let value = parsed(&result);
        assert_eq!(value["period1_value"], json!(12_000_000.0));
        assert_eq!(value["period2_value"], json!(12_000_000.0));
        assert_eq!(value["difference"], json!(0.0));
        assert_eq!(value["percentage_change"], json!(0.0));
    }

    #[tokio::test]
    async fn compare_periods_null_change_when_first_period_empty() {
        let tools = seeded_tools().await;
        let result = tools
            .execute(
                "compare_periods",
                &json!({
                    "connection_name": "Orders",
                    "operation": "sum",
                    "field": "total_amount",
                    "date_field": "order_date",
                    "period1_from": "2020-01-01",
                    "period1_to": "2020-01-31",
                    "period2_from": "2024-01-01",
                    "period2_to": "2024-01-31",
                }),
            )
            .await;
        let value = parsed(&result);
        assert_eq!(value["percentage_change"], Value::Null);
    }

    #[tokio::test]
    async fn top_items_grouped_by_platform() {
        let tools = seeded_tools().await;
        let result = tools
            .execute(
                "get_top_items",
                &json!({
                    "connection_name": "Orders",
                    "sort_field": "total",
                    "limit": 2,
                    "group_by": "platform",
                    "aggregate_field": "total_amount",
                }),
            )
            .await;
        assert!(!result.is_error, "{}", result.content);
        let value = parsed(&result);
        let results = value["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["platform"], json!("Shopee"));
        assert_eq!(results[0]["total"], json!(22_000_000));
    }

    #[tokio::test]
    async fn unknown_connection_and_tool_are_polite_errors() {
        let tools = seeded_tools().await;
        let result = tools
            .execute("aggregate_data", &json!({"connection_name": "Nope", "operation": "count"}))
            .await;
        assert!(result.is_error);
        assert!(result.content.contains("Available connections"));

        let result = tools.execute("drop_tables", &json!({})).await;
        assert!(result.is_error);
        assert!(result.content.contains("Unknown tool"));
    }

    #[tokio::test]
    async fn custom_pipeline_is_validated_and_scoped() {
        let tools = seeded_tools().await;
        let result = tools
            .execute(
                "execute_aggregation",
                &json!({
                    "connection_name": "Orders",
                    "description": "orders per platform",
                    "pipeline": [
                        {"$group": {"_id": "$data.platform", "orders": {"$sum": 1}}},
                        {"$sort": {"orders": -1}}
                    ],
                }),
            )
            .await;
        assert!(!result.is_error, "{}", result.content);
        let value = parsed(&result);
        assert_eq!(value["row_count"], json!(2));
        assert_eq!(value["results"][0]["_id"], json!("Shopee"));

        let rejected = tools
            .execute(
                "execute_aggregation",
                &json!({
                    "connection_name": "Orders",
                    "description": "exfiltrate",
                    "pipeline": [{"$out": "elsewhere"}],
                }),
            )
            .await;
        assert!(rejected.is_error);
        assert!(rejected.content.contains("FORBIDDEN_STAGE"));
    }
}
