//! Per-sheet-type aggregation strategies.
//!
//! A strategy declares which operations its sheet type supports and builds
//! the aggregation pipelines the store executes. Date values in the mapped
//! documents are ISO `YYYY-MM-DD` strings, so range filters compare
//! lexicographically.

use chrono::NaiveDate;
use serde_json::{json, Map, Value};

use super::detector::SheetType;
use super::{Granularity, TimeSeriesMetrics, TopMetric};

pub trait SheetStrategy: Send + Sync {
    fn sheet_type(&self) -> SheetType;
    fn searchable_fields(&self) -> &'static [&'static str];
    fn sortable_fields(&self) -> &'static [&'static str];

    fn supports_time_series(&self) -> bool {
        false
    }
    fn supports_distribution(&self) -> bool {
        false
    }
    fn distribution_fields(&self) -> &'static [&'static str] {
        &[]
    }
    fn supports_top(&self) -> bool {
        false
    }
    fn top_fields(&self) -> &'static [&'static str] {
        &[]
    }
    fn top_metrics(&self) -> &'static [TopMetric] {
        &[]
    }
    /// Field the date-range filter applies to, when the type has one.
    fn date_field(&self) -> Option<&'static str> {
        None
    }

    fn summary_pipeline(
        &self,
        connection_id: &str,
        date_from: Option<NaiveDate>,
        date_to: Option<NaiveDate>,
    ) -> Vec<Value>;

    /// Shape the summary response from the pipeline's first document (or
    /// the zero shape when the pipeline produced nothing).
    fn summary_response(&self, first: Option<&Value>) -> Value;

    fn time_series_pipeline(
        &self,
        _connection_id: &str,
        _date_from: NaiveDate,
        _date_to: NaiveDate,
        _granularity: Granularity,
        _metrics: TimeSeriesMetrics,
    ) -> Option<Vec<Value>> {
        None
    }

    fn distribution_pipeline(
        &self,
        _connection_id: &str,
        _field: &str,
        _date_from: Option<NaiveDate>,
        _date_to: Option<NaiveDate>,
    ) -> Option<Vec<Value>> {
        None
    }

    fn top_pipeline(
        &self,
        _connection_id: &str,
        _field: &str,
        _limit: u64,
        _metric: TopMetric,
        _date_from: Option<NaiveDate>,
        _date_to: Option<NaiveDate>,
    ) -> Option<Vec<Value>> {
        None
    }
}

pub fn strategy_for(sheet_type: SheetType) -> &'static dyn SheetStrategy {
    match sheet_type {
        SheetType::Orders => &OrdersStrategy,
        SheetType::OrderItems => &OrderItemsStrategy,
        SheetType::Customers => &CustomersStrategy,
        SheetType::Products => &ProductsStrategy,
    }
}

fn iso(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn match_stage(
    connection_id: &str,
    date_field: Option<&str>,
    date_from: Option<NaiveDate>,
    date_to: Option<NaiveDate>,
) -> Value {
    let mut stage = Map::new();
    stage.insert("connection_id".into(), json!(connection_id));
    if let Some(field) = date_field {
        if date_from.is_some() || date_to.is_some() {
            let mut range = Map::new();
            if let Some(from) = date_from {
                range.insert("$gte".into(), json!(iso(from)));
            }
            if let Some(to) = date_to {
                range.insert("$lte".into(), json!(iso(to)));
            }
            stage.insert(format!("data.{field}"), Value::Object(range));
        }
    }
    json!({ "$match": stage })
}

// ---------------------------------------------------------------------------

pub struct OrdersStrategy;

impl SheetStrategy for OrdersStrategy {
    fn sheet_type(&self) -> SheetType {
        SheetType::Orders
    }

    fn searchable_fields(&self) -> &'static [&'static str] {
        &["order_id", "platform", "order_status", "customer_id"]
    }

    fn sortable_fields(&self) -> &'static [&'static str] {
        &[
            "order_id",
            "platform",
            "order_status",
            "order_date",
            "subtotal",
            "total_amount",
        ]
    }

    fn supports_time_series(&self) -> bool {
        true
    }

    fn supports_distribution(&self) -> bool {
        true
    }

    fn distribution_fields(&self) -> &'static [&'static str] {
        &["platform", "order_status"]
    }

    fn supports_top(&self) -> bool {
        true
    }

    fn top_fields(&self) -> &'static [&'static str] {
        &["platform"]
    }

    fn top_metrics(&self) -> &'static [TopMetric] {
        &[TopMetric::Count, TopMetric::Amount]
    }

    fn date_field(&self) -> Option<&'static str> {
        Some("order_date")
    }

    fn summary_pipeline(
        &self,
        connection_id: &str,
        date_from: Option<NaiveDate>,
        date_to: Option<NaiveDate>,
    ) -> Vec<Value> {
        vec![
            match_stage(connection_id, self.date_field(), date_from, date_to),
            json!({"$group": {
                "_id": null,
                "total_count": {"$sum": 1},
                "total_amount": {"$sum": {"$toDouble": "$data.total_amount"}},
                "avg_amount": {"$avg": {"$toDouble": "$data.total_amount"}},
            }}),
        ]
    }

    fn summary_response(&self, first: Option<&Value>) -> Value {
        match first {
            Some(doc) => json!({
                "total_count": doc.get("total_count").cloned().unwrap_or(json!(0)),
                "total_amount": doc.get("total_amount").cloned().unwrap_or(json!(0.0)),
                "avg_amount": match doc.get("avg_amount") {
                    Some(Value::Null) | None => json!(0.0),
                    Some(v) => v.clone(),
                },
            }),
            None => json!({"total_count": 0, "total_amount": 0.0, "avg_amount": 0.0}),
        }
    }

    fn time_series_pipeline(
        &self,
        connection_id: &str,
        date_from: NaiveDate,
        date_to: NaiveDate,
        granularity: Granularity,
        metrics: TimeSeriesMetrics,
    ) -> Option<Vec<Value>> {
        let mut group = Map::new();
        group.insert(
            "_id".into(),
            json!({"$dateTrunc": {"date": "$data.order_date", "unit": granularity.as_str()}}),
        );
        let mut project = Map::new();
        project.insert("_id".into(), json!(0));
        project.insert("date".into(), json!("$_id"));
        if metrics.wants_count() {
            group.insert("count".into(), json!({"$sum": 1}));
            project.insert("count".into(), json!(1));
        }
        if metrics.wants_amount() {
            group.insert(
                "total_amount".into(),
                json!({"$sum": {"$toDouble": "$data.total_amount"}}),
            );
            project.insert("total_amount".into(), json!(1));
        }
        Some(vec![
            match_stage(connection_id, self.date_field(), Some(date_from), Some(date_to)),
            json!({ "$group": group }),
            json!({"$sort": {"_id": 1}}),
            json!({ "$project": project }),
        ])
    }

    fn distribution_pipeline(
        &self,
        connection_id: &str,
        field: &str,
        date_from: Option<NaiveDate>,
        date_to: Option<NaiveDate>,
    ) -> Option<Vec<Value>> {
        Some(vec![
            match_stage(connection_id, self.date_field(), date_from, date_to),
            json!({"$group": {"_id": format!("$data.{field}"), "count": {"$sum": 1}}}),
            json!({"$group": {
                "_id": null,
                "items": {"$push": {"value": "$_id", "count": "$count"}},
                "total": {"$sum": "$count"},
            }}),
            json!({"$unwind": "$items"}),
            json!({"$project": {
                "_id": 0,
                "value": "$items.value",
                "count": "$items.count",
                "percentage": {"$round": [
                    {"$multiply": [{"$divide": ["$items.count", "$total"]}, 100]},
                    1,
                ]},
            }}),
            json!({"$sort": {"count": -1}}),
        ])
    }

    fn top_pipeline(
        &self,
        connection_id: &str,
        field: &str,
        limit: u64,
        metric: TopMetric,
        date_from: Option<NaiveDate>,
        date_to: Option<NaiveDate>,
    ) -> Option<Vec<Value>> {
        let sort_field = match metric {
            TopMetric::Amount => "total_amount",
            _ => "count",
        };
        let mut sort = Map::new();
        sort.insert(sort_field.to_string(), json!(-1));
        Some(vec![
            match_stage(connection_id, self.date_field(), date_from, date_to),
            json!({"$group": {
                "_id": format!("$data.{field}"),
                "count": {"$sum": 1},
                "total_amount": {"$sum": {"$toDouble": "$data.total_amount"}},
            }}),
            json!({ "$sort": sort }),
            json!({"$limit": limit}),
            json!({"$project": {"_id": 0, "value": "$_id", "count": 1, "total_amount": 1}}),
        ])
    }
}

// ---------------------------------------------------------------------------

pub struct OrderItemsStrategy;

impl SheetStrategy for OrderItemsStrategy {
    fn sheet_type(&self) -> SheetType {
        SheetType::OrderItems
    }

    fn searchable_fields(&self) -> &'static [&'static str] {
        &["order_item_id", "order_id", "product_id", "product_name"]
    }

    fn sortable_fields(&self) -> &'static [&'static str] {
        &[
            "order_item_id",
            "order_id",
            "product_id",
            "product_name",
            "quantity",
            "unit_price",
            "final_price",
            "line_total",
        ]
    }

    fn supports_top(&self) -> bool {
        true
    }

    fn top_fields(&self) -> &'static [&'static str] {
        &["product_name"]
    }

    fn top_metrics(&self) -> &'static [TopMetric] {
        &[TopMetric::Count, TopMetric::Quantity]
    }

    fn summary_pipeline(
        &self,
        connection_id: &str,
        _date_from: Option<NaiveDate>,
        _date_to: Option<NaiveDate>,
    ) -> Vec<Value> {
        vec![
            match_stage(connection_id, None, None, None),
            json!({"$group": {
                "_id": null,
                "total_quantity": {"$sum": {"$toDouble": "$data.quantity"}},
                "total_line_total": {"$sum": {"$toDouble": "$data.line_total"}},
                "unique_products": {"$addToSet": "$data.product_id"},
            }}),
            json!({"$project": {
                "_id": 0,
                "total_quantity": 1,
                "total_line_total": 1,
                "unique_products": {"$size": "$unique_products"},
            }}),
        ]
    }

    fn summary_response(&self, first: Option<&Value>) -> Value {
        match first {
            Some(doc) => json!({
                "total_quantity": doc.get("total_quantity").cloned().unwrap_or(json!(0)),
                "total_line_total": doc.get("total_line_total").cloned().unwrap_or(json!(0.0)),
                "unique_products": doc.get("unique_products").cloned().unwrap_or(json!(0)),
            }),
            None => json!({
                "total_quantity": 0,
                "total_line_total": 0.0,
                "unique_products": 0,
            }),
        }
    }

    fn top_pipeline(
        &self,
        connection_id: &str,
        field: &str,
        limit: u64,
        metric: TopMetric,
        _date_from: Option<NaiveDate>,
        _date_to: Option<NaiveDate>,
    ) -> Option<Vec<Value>> {
        let sort_field = match metric {
            TopMetric::Quantity => "total_quantity",
            _ => "count",
        };
        let mut sort = Map::new();
        sort.insert(sort_field.to_string(), json!(-1));
        Some(vec![
            match_stage(connection_id, None, None, None),
            json!({"$group": {
                "_id": format!("$data.{field}"),
                "count": {"$sum": 1},
                "total_quantity": {"$sum": {"$toDouble": "$data.quantity"}},
            }}),
            json!({ "$sort": sort }),
            json!({"$limit": limit}),
            json!({"$project": {"_id": 0, "value": "$_id", "count": 1, "total_quantity": 1}}),
        ])
    }
}

// ---------------------------------------------------------------------------

pub struct CustomersStrategy;

impl SheetStrategy for CustomersStrategy {
    fn sheet_type(&self) -> SheetType {
        SheetType::Customers
    }

    fn searchable_fields(&self) -> &'static [&'static str] {
        &["customer_id", "customer_name", "phone"]
    }

    fn sortable_fields(&self) -> &'static [&'static str] {
        &["customer_id", "customer_name", "phone"]
    }

    fn summary_pipeline(
        &self,
        connection_id: &str,
        _date_from: Option<NaiveDate>,
        _date_to: Option<NaiveDate>,
    ) -> Vec<Value> {
        vec![
            match_stage(connection_id, None, None, None),
            json!({"$count": "total_count"}),
        ]
    }

    fn summary_response(&self, first: Option<&Value>) -> Value {
        json!({
            "total_count": first
                .and_then(|doc| doc.get("total_count").cloned())
                .unwrap_or(json!(0)),
        })
    }
}

pub struct ProductsStrategy;

impl SheetStrategy for ProductsStrategy {
    fn sheet_type(&self) -> SheetType {
        SheetType::Products
    }

    fn searchable_fields(&self) -> &'static [&'static str] {
        &["product_id", "product_name"]
    }

    fn sortable_fields(&self) -> &'static [&'static str] {
        &["product_id", "product_name"]
    }

    fn summary_pipeline(
        &self,
        connection_id: &str,
        _date_from: Option<NaiveDate>,
        _date_to: Option<NaiveDate>,
    ) -> Vec<Value> {
        vec![
            match_stage(connection_id, None, None, None),
            json!({"$count": "total_count"}),
        ]
    }

    fn summary_response(&self, first: Option<&Value>) -> Value {
        json!({
            "total_count": first
                .and_then(|doc| doc.get("total_count").cloned())
                .unwrap_or(json!(0)),
        })
    }
}
