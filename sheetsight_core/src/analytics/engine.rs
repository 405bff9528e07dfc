//! The analytics engine: resolves a connection to its strategy, validates
//! the request against what that strategy supports, and serves results
//! through the cache layer.

use std::sync::Arc;

use chrono::NaiveDate;
use serde_json::{json, Value};

use super::cache::{AnalyticsCache, CacheParams};
use super::detector::detect_sheet_type;
use super::strategies::{strategy_for, SheetStrategy};
use super::{Granularity, SortOrder, TimeSeriesMetrics, TopMetric};
use crate::error::codes;
use crate::models::Connection;
use crate::store::{ConnectionStore, RowQuery, SearchFilter, SheetRowStore};
use crate::{Error, Result};

pub const TOP_LIMIT_DEFAULT: u64 = 10;
pub const TOP_LIMIT_MAX: u64 = 50;
pub const PAGE_SIZE_MAX: u64 = 100;

#[derive(Debug, Clone)]
pub struct DataRequest {
    pub page: u64,
    pub page_size: u64,
    pub search: Option<String>,
    pub sort_by: Option<String>,
    pub sort_order: SortOrder,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

impl Default for DataRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 20,
            search: None,
            sort_by: None,
            sort_order: SortOrder::Desc,
            date_from: None,
            date_to: None,
        }
    }
}

pub struct AnalyticsEngine {
    connections: Arc<dyn ConnectionStore>,
    rows: Arc<dyn SheetRowStore>,
    cache: AnalyticsCache,
}

impl AnalyticsEngine {
    pub fn new(
        connections: Arc<dyn ConnectionStore>,
        rows: Arc<dyn SheetRowStore>,
        cache: AnalyticsCache,
    ) -> Self {
        Self {
            connections,
            rows,
            cache,
        }
    }

    /// Ownership mismatches answer not-found, same as a missing connection,
    /// so callers cannot probe for other users' connection ids.
    async fn connection_and_strategy(
        &self,
        connection_id: &str,
        user_id: &str,
    ) -> Result<(Connection, &'static dyn SheetStrategy)> {
        let connection = self
            .connections
            .find_connection(connection_id)
            .await?
            .filter(|c| c.user_id == user_id)
            .ok_or_else(|| Error::NotFound("connection not found".into()))?;
        let strategy = strategy_for(detect_sheet_type(&connection.tab_name));
        Ok((connection, strategy))
    }

    fn validate_range(date_from: Option<NaiveDate>, date_to: Option<NaiveDate>) -> Result<()> {
        if let (Some(from), Some(to)) = (date_from, date_to) {
            if from > to {
                return Err(Error::validation(
                    codes::BAD_RANGE,
                    "date_from must not be after date_to",
                ));
            }
        }
        Ok(())
    }

    fn date_params(params: &mut CacheParams, from: Option<NaiveDate>, to: Option<NaiveDate>) {
        params.insert(
            "date_from".into(),
            from.map(|d| d.to_string()).unwrap_or_default(),
        );
        params.insert(
            "date_to".into(),
            to.map(|d| d.to_string()).unwrap_or_default(),
        );
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn summary(
        &self,
        connection_id: &str,
        user_id: &str,
        date_from: Option<NaiveDate>,
        date_to: Option<NaiveDate>,
    ) -> Result<Value> {
        Self::validate_range(date_from, date_to)?;
        let (_, strategy) = self.connection_and_strategy(connection_id, user_id).await?;

        let mut params = CacheParams::new();
        Self::date_params(&mut params, date_from, date_to);
        if let Some(cached) = self.cache.get(connection_id, "summary", &params).await {
            return Ok(cached);
        }

        let pipeline = strategy.summary_pipeline(connection_id, date_from, date_to);
        let results = self.rows.aggregate(&pipeline).await?;
        let data = strategy.summary_response(results.first());

        self.cache.set(connection_id, "summary", &params, &data).await;
        Ok(data)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn time_series(
        &self,
        connection_id: &str,
        user_id: &str,
        date_from: NaiveDate,
        date_to: NaiveDate,
        granularity: Granularity,
        metrics: TimeSeriesMetrics,
    ) -> Result<Value> {
        Self::validate_range(Some(date_from), Some(date_to))?;
        let (_, strategy) = self.connection_and_strategy(connection_id, user_id).await?;
        if !strategy.supports_time_series() {
            return Err(Error::validation(
                codes::FEATURE_UNSUPPORTED,
                format!(
                    "time series not supported for sheet type '{}'",
                    strategy.sheet_type().as_str()
                ),
            ));
        }

        let mut params = CacheParams::new();
        Self::date_params(&mut params, Some(date_from), Some(date_to));
        params.insert("granularity".into(), granularity.as_str().into());
        params.insert("metrics".into(), metrics.as_str().into());
        if let Some(cached) = self.cache.get(connection_id, "time-series", &params).await {
            return Ok(cached);
        }

        let pipeline = strategy
            .time_series_pipeline(connection_id, date_from, date_to, granularity, metrics)
            .expect("supports_time_series implies a pipeline");
        let results = self.rows.aggregate(&pipeline).await?;
        let data = json!({
            "granularity": granularity.as_str(),
            "data": results,
        });

        self.cache
            .set(connection_id, "time-series", &params, &data)
            .await;
        Ok(data)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn distribution(
        &self,
        connection_id: &str,
        user_id: &str,
        field: &str,
        date_from: Option<NaiveDate>,
        date_to: Option<NaiveDate>,
    ) -> Result<Value> {
        Self::validate_range(date_from, date_to)?;
        let (_, strategy) = self.connection_and_strategy(connection_id, user_id).await?;
        if !strategy.supports_distribution() {
            return Err(Error::validation(
                codes::FEATURE_UNSUPPORTED,
                format!(
                    "distribution not supported for sheet type '{}'",
                    strategy.sheet_type().as_str()
                ),
            ));
        }
        if !strategy.distribution_fields().contains(&field) {
            return Err(Error::validation(
                codes::FIELD_UNSUPPORTED,
                format!("field '{field}' not supported for distribution"),
            ));
        }

        let mut params = CacheParams::new();
        params.insert("field".into(), field.into());
        Self::date_params(&mut params, date_from, date_to);
        if let Some(cached) = self.cache.get(connection_id, "distribution", &params).await {
            return Ok(cached);
        }

        let pipeline = strategy
            .distribution_pipeline(connection_id, field, date_from, date_to)
            .expect("supports_distribution implies a pipeline");
        let results = self.rows.aggregate(&pipeline).await?;
        let data = json!({ "field": field, "data": results });

        self.cache
            .set(connection_id, "distribution", &params, &data)
            .await;
        Ok(data)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn top(
        &self,
        connection_id: &str,
        user_id: &str,
        field: &str,
        limit: Option<u64>,
        metric: TopMetric,
        date_from: Option<NaiveDate>,
        date_to: Option<NaiveDate>,
    ) -> Result<Value> {
        Self::validate_range(date_from, date_to)?;
        let limit = limit.unwrap_or(TOP_LIMIT_DEFAULT);
        if limit < 1 || limit > TOP_LIMIT_MAX {
            return Err(Error::validation(
                codes::BAD_LIMIT,
                format!("limit must be between 1 and {TOP_LIMIT_MAX}, got {limit}"),
            ));
        }
        let (_, strategy) = self.connection_and_strategy(connection_id, user_id).await?;
        if !strategy.supports_top() {
            return Err(Error::validation(
                codes::FEATURE_UNSUPPORTED,
                format!(
                    "top not supported for sheet type '{}'",
                    strategy.sheet_type().as_str()
                ),
            ));
        }
        if !strategy.top_fields().contains(&field) {
            return Err(Error::validation(
                codes::FIELD_UNSUPPORTED,
                format!("field '{field}' not supported for top"),
            ));
        }
        if !strategy.top_metrics().contains(&metric) {
            return Err(Error::validation(
                codes::FIELD_UNSUPPORTED,
                format!(
                    "metric '{}' not supported for sheet type '{}'",
                    metric.as_str(),
                    strategy.sheet_type().as_str()
                ),
            ));
        }

        let mut params = CacheParams::new();
        params.insert("field".into(), field.into());
        params.insert("limit".into(), limit.to_string());
        params.insert("metric".into(), metric.as_str().into());
        Self::date_params(&mut params, date_from, date_to);
        if let Some(cached) = self.cache.get(connection_id, "top", &params).await {
            return Ok(cached);
        }

        let pipeline = strategy
            .top_pipeline(connection_id, field, limit, metric, date_from, date_to)
            .expect("supports_top implies a pipeline");
        let results = self.rows.aggregate(&pipeline).await?;
        let data = json!({
            "field": field,
            "metric": metric.as_str(),
            "data": results,
        });

        self.cache.set(connection_id, "top", &params, &data).await;
        Ok(data)
    }

    /// Paginated raw rows with optional search, sort, and (orders only)
    /// date-range filter. Served straight from the store, never cached.
    #[tracing::instrument(level = "debug", skip(self, request))]
    pub async fn data(
        &self,
        connection_id: &str,
        user_id: &str,
        request: DataRequest,
    ) -> Result<Value> {
        Self::validate_range(request.date_from, request.date_to)?;
        let (_, strategy) = self.connection_and_strategy(connection_id, user_id).await?;

        if let Some(sort_by) = &request.sort_by {
            if !strategy.sortable_fields().contains(&sort_by.as_str()) {
                return Err(Error::validation(
                    codes::FIELD_UNSUPPORTED,
                    format!("field '{sort_by}' not supported for sorting"),
                ));
            }
        }

        let page = request.page.max(1);
        let page_size = request.page_size.clamp(1, PAGE_SIZE_MAX);

        let search = request
            .search
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(|raw| SearchFilter {
                pattern: regex::escape(raw.trim()),
                fields: strategy
                    .searchable_fields()
                    .iter()
                    .map(|f| f.to_string())
                    .collect(),
            });

        let query = RowQuery {
            connection_id: connection_id.to_string(),
            search,
            date_field: strategy.date_field().map(str::to_string),
            date_from: request.date_from,
            date_to: request.date_to,
            sort_by: request.sort_by.clone(),
            sort_desc: request.sort_order == SortOrder::Desc,
            skip: (page - 1) * page_size,
            limit: page_size,
        };
        let page_result = self.rows.find_rows(&query).await?;

        let total = page_result.total;
        let total_pages = total.div_ceil(page_size);
        let data: Vec<Value> = page_result
            .rows
            .iter()
            .map(|row| {
                json!({
                    "row_number": row.row_number,
                    "data": row.data,
                    "synced_at": row.synced_at.to_rfc3339(),
                })
            })
            .collect();

        Ok(json!({
            "data": data,
            "total": total,
            "page": page,
            "page_size": page_size,
            "total_pages": total_pages,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::cache::AnalyticsCache;
    use crate::cache::MemoryCache;
    use crate::models::SheetRow;
    use crate::store::MemoryDocumentStore;
    use chrono::Utc;

    async fn seed_orders(store: &Arc<MemoryDocumentStore>) {
        let now = Utc::now();
        store
            .insert_connection(Connection {
                id: "conn_a".into(),
                user_id: "u1".into(),
                sheet_id: "s1".into(),
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
            ("Shopee", 1000.0, "2024-01-01"),
            ("Shopee", 2000.0, "2024-01-08"),
            ("Lazada", 2000.0, "2024-01-08"),
            ("Tiki", 1000.0, "2024-01-15"),
        ];
        for (i, (platform, amount, date)) in orders.iter().enumerate() {
            store
                .upsert_row(SheetRow {
                    connection_id: "conn_a".into(),
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
    }

    fn engine(store: &Arc<MemoryDocumentStore>) -> AnalyticsEngine {
        AnalyticsEngine::new(
            store.clone(),
            store.clone(),
            AnalyticsCache::new(Arc::new(MemoryCache::new())),
        )
    }

    #[tokio::test]
    async fn summary_counts_and_averages() {
        let store = Arc::new(MemoryDocumentStore::new());
        seed_orders(&store).await;
        let engine = engine(&store);

        let summary = engine.summary("conn_a", "u1", None, None).await.unwrap();
        assert_eq!(summary["total_count"], json!(4));
        assert_eq!(summary["total_amount"], json!(6000));
        assert_eq!(summary["avg_amount"].as_f64().unwrap(), 1500.0);
    }

    #[tokio::test]
    async fn ownership_mismatch_is_not_found() {
        let store = Arc::new(MemoryDocumentStore::new());
        seed_orders(&store).await;
        let engine = engine(&store);
        let err = engine.summary("conn_a", "someone_else", None, None).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn distribution_percentages_sum_to_hundred() {
        let store = Arc::new(MemoryDocumentStore::new());
        seed_orders(&store).await;
        let engine = engine(&store);

        let dist = engine
            .distribution("conn_a", "u1", "platform", None, None)
            .await
            .unwrap();
        let data = dist["data"].as_array().unwrap();
        assert_eq!(data.len(), 3);
        assert_eq!(data[0]["value"], json!("Shopee"));
        assert_eq!(data[0]["count"], json!(2));
        assert_eq!(data[0]["percentage"], json!(50));
        let sum: f64 = data.iter().map(|d| d["percentage"].as_f64().unwrap()).sum();
        assert!((sum - 100.0).abs() < 0.1);
    }

    #[tokio::test]
    async fn top_orders_by_amount_descending() {
        let store = Arc::new(MemoryDocumentStore::new());
        seed_orders(&store).await;
        let engine = engine(&store);

        let top = engine
            .top("conn_a", "u1", "platform", Some(2), TopMetric::Amount, None, None)
            .await
            .unwrap();
        let data = top["data"].as_array().unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data[0]["value"], json!("Shopee"));
        assert_eq!(data[0]["total_amount"], json!(3000));
        assert_eq!(data[1]["value"], json!("Lazada"));

        let err = engine
            .top("conn_a", "u1", "platform", Some(99), TopMetric::Amount, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(codes::BAD_LIMIT));
    }

    #[tokio::test]
    async fn time_series_truncates_to_unique_periods() {
        let store = Arc::new(MemoryDocumentStore::new());
        seed_orders(&store).await;
        let engine = engine(&store);

        let series = engine
            .time_series(
                "conn_a",
                "u1",
                NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
                Granularity::Week,
                TimeSeriesMetrics::Both,
            )
            .await
            .unwrap();
        let data = series["data"].as_array().unwrap();
        assert_eq!(data.len(), 3);
        let dates: Vec<&str> = data.iter().map(|d| d["date"].as_str().unwrap()).collect();
        assert_eq!(dates, vec!["2024-01-01", "2024-01-08", "2024-01-15"]);
        assert_eq!(data[1]["count"], json!(2));
        assert_eq!(data[1]["total_amount"], json!(4000));
    }

    #[tokio::test]
    async fn validation_codes_for_bad_requests() {
        let store = Arc::new(MemoryDocumentStore::new());
        seed_orders(&store).await;
        let now = Utc::now();
        store
            .insert_connection(Connection {
                id: "conn_c".into(),
                user_id: "u1".into(),
                sheet_id: "s1".into(),
                tab_name: "Customers".into(),
                column_mappings: vec![],
                header_row: 1,
                data_start_row: 2,
                sync_enabled: true,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        let engine = engine(&store);

        let err = engine
            .summary(
                "conn_a",
                "u1",
                NaiveDate::from_ymd_opt(2024, 2, 1),
                NaiveDate::from_ymd_opt(2024, 1, 1),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(codes::BAD_RANGE));

        let err = engine
            .time_series(
                "conn_c",
                "u1",
                NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
                Granularity::Day,
                TimeSeriesMetrics::Both,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(codes::FEATURE_UNSUPPORTED));

        let err = engine
            .distribution("conn_a", "u1", "customer_id", None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(codes::FIELD_UNSUPPORTED));
    }

    #[tokio::test]
    async fn data_pagination_properties() {
        let store = Arc::new(MemoryDocumentStore::new());
        seed_orders(&store).await;
        let engine = engine(&store);

        let page1 = engine
            .data(
                "conn_a",
                "u1",
                DataRequest {
                    page: 1,
                    page_size: 3,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page1["total"], json!(4));
        assert_eq!(page1["total_pages"], json!(2));
        assert_eq!(page1["data"].as_array().unwrap().len(), 3);

        let page2 = engine
            .data(
                "conn_a",
                "u1",
                DataRequest {
                    page: 2,
                    page_size: 3,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page2["data"].as_array().unwrap().len(), 1);

        let beyond = engine
            .data(
                "conn_a",
                "u1",
                DataRequest {
                    page: 5,
                    page_size: 3,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(beyond["data"].as_array().unwrap().len(), 0);
        assert_eq!(beyond["total"], json!(4));
        assert_eq!(beyond["total_pages"], json!(2));

        // page_size is clamped to [1, 100].
        let clamped = engine
            .data(
                "conn_a",
                "u1",
                DataRequest {
                    page: 1,
                    page_size: 1000,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(clamped["page_size"], json!(100));
    }

    #[tokio::test]
    async fn data_search_is_case_insensitive_and_escaped() {
        let store = Arc::new(MemoryDocumentStore::new());
        seed_orders(&store).await;
        let engine = engine(&store);

        let found = engine
            .data(
                "conn_a",
                "u1",
                DataRequest {
                    search: Some("shopee".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(found["total"], json!(2));

        // Regex metacharacters in the input are literal.
        let none = engine
            .data(
                "conn_a",
                "u1",
                DataRequest {
                    search: Some(".*".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(none["total"], json!(0));
    }

    #[tokio::test]
    async fn invalidation_makes_summary_recompute() {
        let store = Arc::new(MemoryDocumentStore::new());
        seed_orders(&store).await;
        let cache = AnalyticsCache::new(Arc::new(MemoryCache::new()));
        let engine = AnalyticsEngine::new(store.clone(), store.clone(), cache.clone());

        let before = engine.summary("conn_a", "u1", None, None).await.unwrap();
        assert_eq!(before["total_count"], json!(4));

        store
            .upsert_row(SheetRow {
                connection_id: "conn_a".into(),
                row_number: 99,
                data: json!({"order_id": "O99", "platform": "Tiki", "total_amount": 1.0,
                             "order_date": "2024-01-20"}),
                raw: json!({}),
                synced_at: Utc::now(),
            })
            .await
            .unwrap();

        // Still cached.
        let stale = engine.summary("conn_a", "u1", None, None).await.unwrap();
        assert_eq!(stale["total_count"], json!(4));

        cache.invalidate("conn_a").await;
        let fresh = engine.summary("conn_a", "u1", None, None).await.unwrap();
        assert_eq!(fresh["total_count"], json!(5));
    }
}
