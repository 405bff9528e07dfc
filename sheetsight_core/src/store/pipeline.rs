//! Interpreter for the aggregation-stage subset the engine and tools emit.
//!
//! The persistent store executes pipelines natively; this module gives the
//! in-memory backend the same contract. Supported stages: `$match`,
//! `$group`, `$sort`, `$skip`, `$limit`, `$project`, `$unwind`, `$count`,
//! `$lookup`. Unknown stages are an error rather than a silent no-op so a
//! strategy bug cannot masquerade as an empty result.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{Datelike, Duration, NaiveDate};
use regex::RegexBuilder;
use serde_json::{json, Map, Value};

use crate::error::codes;
use crate::{Error, Result};

/// Execute `stages` over `docs`. `collections` resolves `$lookup.from`
/// (keyed by connection id) against sibling row sets.
pub fn run_pipeline(
    docs: Vec<Value>,
    stages: &[Value],
    collections: &HashMap<String, Vec<Value>>,
) -> Result<Vec<Value>> {
    let mut current = docs;
    for stage in stages {
        let obj = stage
            .as_object()
            .filter(|o| o.len() == 1)
            .ok_or_else(|| bad_pipeline("each stage must be an object with one operator"))?;
        let (op, spec) = obj.iter().next().expect("len checked");
        current = match op.as_str() {
            "$match" => apply_match(current, spec)?,
            "$group" => apply_group(current, spec)?,
            "$sort" => apply_sort(current, spec)?,
            "$skip" => apply_skip(current, spec)?,
            "$limit" => apply_limit(current, spec)?,
            "$project" => apply_project(current, spec)?,
            "$unwind" => apply_unwind(current, spec)?,
            "$count" => apply_count(current, spec)?,
            "$lookup" => apply_lookup(current, spec, collections)?,
            other => {
                return Err(Error::validation(
                    codes::UNSUPPORTED_STAGE,
                    format!("unsupported pipeline stage '{other}'"),
                ))
            }
        };
    }
    Ok(current)
}

fn bad_pipeline(message: impl Into<String>) -> Error {
    Error::validation(codes::BAD_PIPELINE, message)
}

// ---------------------------------------------------------------------------
// value helpers

/// Dotted-path lookup inside a document.
pub fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

pub fn to_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Emit integral floats as JSON integers so counts stay counts.
pub fn num_value(v: f64) -> Value {
    if v.fract() == 0.0 && v.abs() < 9_007_199_254_740_992.0 {
        json!(v as i64)
    } else {
        json!(v)
    }
}

/// Total order over the value shapes we store: null < numbers < strings <
/// everything else. A string paired with a number is compared numerically
/// when it parses.
pub fn cmp_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Number(_) => 1,
            Value::String(_) => 2,
            Value::Bool(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => to_number(a)
            .partial_cmp(&to_number(b))
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Number(_), Value::String(s)) => match s.trim().parse::<f64>() {
            Ok(parsed) => to_number(a)
                .unwrap_or(f64::NAN)
                .partial_cmp(&parsed)
                .unwrap_or(Ordering::Equal),
            Err(_) => rank(a).cmp(&rank(b)),
        },
        (Value::String(_), Value::Number(_)) => cmp_values(b, a).reverse(),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

fn parse_date(value: &Value) -> Option<NaiveDate> {
    let s = value.as_str()?;
    let head = s.get(..10)?;
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

// ---------------------------------------------------------------------------
// expressions

fn eval_expr(doc: &Value, expr: &Value) -> Result<Value> {
    match expr {
        Value::String(s) if s.starts_with('$') => {
            Ok(get_path(doc, &s[1..]).cloned().unwrap_or(Value::Null))
        }
        Value::Object(map) => {
            if map.len() == 1 {
                let (op, arg) = map.iter().next().expect("len checked");
                if op.starts_with('$') {
                    return eval_operator(doc, op, arg);
                }
            }
            // Literal object: evaluate each member.
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(k.clone(), eval_expr(doc, v)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn eval_operator(doc: &Value, op: &str, arg: &Value) -> Result<Value> {
    match op {
        "$toDouble" => {
            let v = eval_expr(doc, arg)?;
            Ok(to_number(&v).map(num_value).unwrap_or(Value::Null))
        }
        "$size" => {
            let v = eval_expr(doc, arg)?;
            Ok(json!(v.as_array().map(|a| a.len()).unwrap_or(0)))
        }
        "$round" => {
            let parts = arg
                .as_array()
                .filter(|p| !p.is_empty())
                .ok_or_else(|| bad_pipeline("$round takes [expr, digits]"))?;
            let value = to_number(&eval_expr(doc, &parts[0])?).unwrap_or(0.0);
            let digits = parts
                .get(1)
                .and_then(to_number_opt)
                .unwrap_or(0.0)
                .max(0.0) as i32;
            let factor = 10f64.powi(digits);
            Ok(num_value((value * factor).round() / factor))
        }
        "$multiply" => {
            let parts = arg
                .as_array()
                .ok_or_else(|| bad_pipeline("$multiply takes an array"))?;
            let mut acc = 1.0;
            for part in parts {
                acc *= to_number(&eval_expr(doc, part)?).unwrap_or(0.0);
            }
            Ok(num_value(acc))
        }
        "$divide" => {
            let parts = arg
                .as_array()
                .filter(|p| p.len() == 2)
                .ok_or_else(|| bad_pipeline("$divide takes [numerator, denominator]"))?;
            let num = to_number(&eval_expr(doc, &parts[0])?).unwrap_or(0.0);
            let den = to_number(&eval_expr(doc, &parts[1])?).unwrap_or(0.0);
            if den == 0.0 {
                Ok(Value::Null)
            } else {
                Ok(json!(num / den))
            }
        }
        "$dateTrunc" => {
            let spec = arg
                .as_object()
                .ok_or_else(|| bad_pipeline("$dateTrunc takes {date, unit}"))?;
            let date_val = eval_expr(
                doc,
                spec.get("date")
                    .ok_or_else(|| bad_pipeline("$dateTrunc missing 'date'"))?,
            )?;
            let unit = spec.get("unit").and_then(Value::as_str).unwrap_or("day");
            match parse_date(&date_val) {
                Some(date) => Ok(json!(truncate_date(date, unit)?
                    .format("%Y-%m-%d")
                    .to_string())),
                None => Ok(Value::Null),
            }
        }
        other => Err(Error::validation(
            codes::UNSUPPORTED_STAGE,
            format!("unsupported expression operator '{other}'"),
        )),
    }
}

fn to_number_opt(v: &Value) -> Option<f64> {
    to_number(v)
}

/// Period truncation: week starts Monday, month snaps to day 1, year to
/// January 1.
fn truncate_date(date: NaiveDate, unit: &str) -> Result<NaiveDate> {
    match unit {
        "day" => Ok(date),
        "week" => {
            let back = date.weekday().num_days_from_monday() as i64;
            Ok(date - Duration::days(back))
        }
        "month" => Ok(date.with_day(1).expect("day 1 always valid")),
        "year" => Ok(NaiveDate::from_ymd_opt(date.year(), 1, 1).expect("jan 1 always valid")),
        other => Err(bad_pipeline(format!("unknown truncation unit '{other}'"))),
    }
}

// ---------------------------------------------------------------------------
// stages

fn apply_match(docs: Vec<Value>, spec: &Value) -> Result<Vec<Value>> {
    let filter = spec
        .as_object()
        .ok_or_else(|| bad_pipeline("$match takes an object"))?;
    let mut out = Vec::new();
    for doc in docs {
        if matches_filter(&doc, filter)? {
            out.push(doc);
        }
    }
    Ok(out)
}

pub fn matches_filter(doc: &Value, filter: &Map<String, Value>) -> Result<bool> {
    for (path, cond) in filter {
        let actual = get_path(doc, path).cloned().unwrap_or(Value::Null);
        if !matches_condition(&actual, cond)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn matches_condition(actual: &Value, cond: &Value) -> Result<bool> {
    let Some(obj) = cond.as_object() else {
        return Ok(actual == cond);
    };
    let has_ops = obj.keys().any(|k| k.starts_with('$'));
    if !has_ops {
        return Ok(actual == cond);
    }
    for (op, operand) in obj {
        let ok = match op.as_str() {
            "$gte" => cmp_values(actual, operand) != Ordering::Less,
            "$lte" => cmp_values(actual, operand) != Ordering::Greater,
            "$gt" => cmp_values(actual, operand) == Ordering::Greater,
            "$lt" => cmp_values(actual, operand) == Ordering::Less,
            "$ne" => actual != operand,
            "$in" => operand
                .as_array()
                .map(|arr| arr.contains(actual))
                .unwrap_or(false),
            "$regex" => {
                let pattern = operand
                    .as_str()
                    .ok_or_else(|| bad_pipeline("$regex takes a string"))?;
                let insensitive = obj
                    .get("$options")
                    .and_then(Value::as_str)
                    .is_some_and(|o| o.contains('i'));
                let re = RegexBuilder::new(pattern)
                    .case_insensitive(insensitive)
                    .build()
                    .map_err(|e| bad_pipeline(format!("invalid $regex: {e}")))?;
                actual.as_str().is_some_and(|s| re.is_match(s))
            }
            "$options" => true, // consumed by $regex
            other => return Err(bad_pipeline(format!("unsupported match operator '{other}'"))),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

#[derive(Default)]
struct Accumulator {
    sum: f64,
    count: u64,
    numeric_count: u64,
    min: Option<Value>,
    max: Option<Value>,
    set: Vec<Value>,
    pushed: Vec<Value>,
}

fn apply_group(docs: Vec<Value>, spec: &Value) -> Result<Vec<Value>> {
    let spec = spec
        .as_object()
        .ok_or_else(|| bad_pipeline("$group takes an object"))?;
    let id_expr = spec
        .get("_id")
        .ok_or_else(|| bad_pipeline("$group requires _id"))?;

    // First-seen group order; pipelines sort explicitly afterwards.
    let mut keys: Vec<Value> = Vec::new();
    let mut groups: Vec<HashMap<String, Accumulator>> = Vec::new();

    for doc in &docs {
        let key = eval_expr(doc, id_expr)?;
        let idx = match keys.iter().position(|k| k == &key) {
            Some(i) => i,
            None => {
                keys.push(key);
                groups.push(HashMap::new());
                groups.len() - 1
            }
        };
        for (field, acc_spec) in spec.iter().filter(|(k, _)| *k != "_id") {
            let acc_obj = acc_spec
                .as_object()
                .filter(|o| o.len() == 1)
                .ok_or_else(|| bad_pipeline("accumulator must be a single-operator object"))?;
            let (op, arg) = acc_obj.iter().next().expect("len checked");
            let acc = groups[idx].entry(field.clone()).or_default();
            match op.as_str() {
                "$sum" => {
                    acc.count += 1;
                    if let Some(n) = to_number(&eval_expr(doc, arg)?) {
                        acc.sum += n;
                        acc.numeric_count += 1;
                    }
                }
                "$avg" => {
                    if let Some(n) = to_number(&eval_expr(doc, arg)?) {
                        acc.sum += n;
                        acc.numeric_count += 1;
                    }
                }
                "$min" => {
                    let v = eval_expr(doc, arg)?;
                    if !v.is_null() {
                        let replace = acc
                            .min
                            .as_ref()
                            .map(|m| cmp_values(&v, m) == Ordering::Less)
                            .unwrap_or(true);
                        if replace {
                            acc.min = Some(v);
                        }
                    }
                }
                "$max" => {
                    let v = eval_expr(doc, arg)?;
                    if !v.is_null() {
                        let replace = acc
                            .max
                            .as_ref()
                            .map(|m| cmp_values(&v, m) == Ordering::Greater)
                            .unwrap_or(true);
                        if replace {
                            acc.max = Some(v);
                        }
                    }
                }
                "$addToSet" => {
                    let v = eval_expr(doc, arg)?;
                    if !acc.set.contains(&v) {
                        acc.set.push(v);
                    }
                }
                "$push" => acc.pushed.push(eval_expr(doc, arg)?),
                other => {
                    return Err(bad_pipeline(format!("unsupported accumulator '{other}'")))
                }
            }
        }
    }

    let mut out = Vec::with_capacity(keys.len());
    for (key, accs) in keys.into_iter().zip(groups) {
        let mut doc = Map::new();
        doc.insert("_id".to_string(), key);
        for (field, acc_spec) in spec.iter().filter(|(k, _)| *k != "_id") {
            let op = acc_spec
                .as_object()
                .and_then(|o| o.keys().next().cloned())
                .expect("validated above");
            let acc = accs.get(field).expect("populated per doc");
            let value = match op.as_str() {
                "$sum" => num_value(acc.sum),
                "$avg" => {
                    if acc.numeric_count == 0 {
                        Value::Null
                    } else {
                        json!(acc.sum / acc.numeric_count as f64)
                    }
                }
                "$min" => acc.min.clone().unwrap_or(Value::Null),
                "$max" => acc.max.clone().unwrap_or(Value::Null),
                "$addToSet" => Value::Array(acc.set.clone()),
                "$push" => Value::Array(acc.pushed.clone()),
                _ => unreachable!("validated above"),
            };
            doc.insert(field.clone(), value);
        }
        out.push(Value::Object(doc));
    }
    Ok(out)
}

fn apply_sort(mut docs: Vec<Value>, spec: &Value) -> Result<Vec<Value>> {
    let spec = spec
        .as_object()
        .ok_or_else(|| bad_pipeline("$sort takes an object"))?;
    let keys: Vec<(String, bool)> = spec
        .iter()
        .map(|(path, dir)| (path.clone(), dir.as_i64().unwrap_or(1) < 0))
        .collect();
    docs.sort_by(|a, b| {
        for (path, desc) in &keys {
            let va = get_path(a, path).cloned().unwrap_or(Value::Null);
            let vb = get_path(b, path).cloned().unwrap_or(Value::Null);
            let ord = cmp_values(&va, &vb);
            if ord != Ordering::Equal {
                return if *desc { ord.reverse() } else { ord };
            }
        }
        Ordering::Equal
    });
    Ok(docs)
}

fn apply_skip(docs: Vec<Value>, spec: &Value) -> Result<Vec<Value>> {
    let n = spec
        .as_u64()
        .ok_or_else(|| bad_pipeline("$skip takes a non-negative integer"))?;
    Ok(docs.into_iter().skip(n as usize).collect())
}

fn apply_limit(docs: Vec<Value>, spec: &Value) -> Result<Vec<Value>> {
    let n = spec
        .as_u64()
        .ok_or_else(|| bad_pipeline("$limit takes a non-negative integer"))?;
    Ok(docs.into_iter().take(n as usize).collect())
}

fn apply_project(docs: Vec<Value>, spec: &Value) -> Result<Vec<Value>> {
    let spec = spec
        .as_object()
        .ok_or_else(|| bad_pipeline("$project takes an object"))?;
    let exclude_id = spec.get("_id").and_then(Value::as_i64) == Some(0);

    let mut out = Vec::with_capacity(docs.len());
    for doc in docs {
        let mut projected = Map::new();
        if !exclude_id {
            if let Some(id) = get_path(&doc, "_id") {
                projected.insert("_id".to_string(), id.clone());
            }
        }
        for (field, rule) in spec {
            if field == "_id" {
                continue;
            }
            match rule {
                Value::Number(n) if n.as_i64() == Some(1) => {
                    if let Some(v) = get_path(&doc, field) {
                        projected.insert(field.clone(), v.clone());
                    }
                }
                Value::Number(n) if n.as_i64() == Some(0) => {}
                other => {
                    let v = eval_expr(&doc, other)?;
                    projected.insert(field.clone(), v);
                }
            }
        }
        out.push(Value::Object(projected));
    }
    Ok(out)
}

fn apply_unwind(docs: Vec<Value>, spec: &Value) -> Result<Vec<Value>> {
    let path = spec
        .as_str()
        .and_then(|s| s.strip_prefix('$'))
        .ok_or_else(|| bad_pipeline("$unwind takes a '$path' string"))?;
    let mut out = Vec::new();
    for doc in docs {
        let Some(Value::Array(items)) = get_path(&doc, path).cloned() else {
            continue;
        };
        for item in items {
            let mut clone = doc.clone();
            set_path(&mut clone, path, item);
            out.push(clone);
        }
    }
    Ok(out)
}

fn set_path(doc: &mut Value, path: &str, value: Value) {
    let mut parts = path.split('.').peekable();
    let mut current = doc;
    while let Some(part) = parts.next() {
        let Some(obj) = current.as_object_mut() else {
            return;
        };
        if parts.peek().is_none() {
            obj.insert(part.to_string(), value);
            return;
        }
        current = obj
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

fn apply_count(docs: Vec<Value>, spec: &Value) -> Result<Vec<Value>> {
    let name = spec
        .as_str()
        .ok_or_else(|| bad_pipeline("$count takes a field name"))?;
    if docs.is_empty() {
        return Ok(vec![]);
    }
    Ok(vec![json!({ name: docs.len() })])
}

fn apply_lookup(
    docs: Vec<Value>,
    spec: &Value,
    collections: &HashMap<String, Vec<Value>>,
) -> Result<Vec<Value>> {
    let spec = spec
        .as_object()
        .ok_or_else(|| bad_pipeline("$lookup takes an object"))?;
    let from = spec
        .get("from")
        .and_then(Value::as_str)
        .ok_or_else(|| bad_pipeline("$lookup requires 'from'"))?;
    let local = spec
        .get("localField")
        .and_then(Value::as_str)
        .ok_or_else(|| bad_pipeline("$lookup requires 'localField'"))?;
    let foreign = spec
        .get("foreignField")
        .and_then(Value::as_str)
        .ok_or_else(|| bad_pipeline("$lookup requires 'foreignField'"))?;
    let target = spec
        .get("as")
        .and_then(Value::as_str)
        .ok_or_else(|| bad_pipeline("$lookup requires 'as'"))?;

    let foreign_docs = collections.get(from).cloned().unwrap_or_default();
    let mut out = Vec::with_capacity(docs.len());
    for mut doc in docs {
        let local_val = get_path(&doc, local).cloned().unwrap_or(Value::Null);
        let matched: Vec<Value> = foreign_docs
            .iter()
            .filter(|fd| get_path(fd, foreign).cloned().unwrap_or(Value::Null) == local_val)
            .cloned()
            .collect();
        set_path(&mut doc, target, Value::Array(matched));
        out.push(doc);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(platform: &str, amount: f64, date: &str) -> Value {
        json!({
            "connection_id": "c1",
            "data": {"platform": platform, "total_amount": amount, "order_date": date}
        })
    }

    fn no_lookups() -> HashMap<String, Vec<Value>> {
        HashMap::new()
    }

    #[test]
    fn group_sums_and_averages() {
        let docs = vec![
            order("Shopee", 100.0, "2024-01-01"),
            order("Lazada", 200.0, "2024-01-02"),
        ];
        let stages = vec![json!({"$group": {
            "_id": null,
            "total_count": {"$sum": 1},
            "total_amount": {"$sum": {"$toDouble": "$data.total_amount"}},
            "avg_amount": {"$avg": {"$toDouble": "$data.total_amount"}},
        }})];
        let out = run_pipeline(docs, &stages, &no_lookups()).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["total_count"], json!(2));
        assert_eq!(out[0]["total_amount"], json!(300));
        assert_eq!(out[0]["avg_amount"].as_f64().unwrap(), 150.0);
    }

    #[test]
    fn distribution_percentages_sum_to_hundred() {
        let mut docs = Vec::new();
        for _ in 0..450 {
            docs.push(order("Shopee", 1.0, "2024-01-01"));
        }
        for _ in 0..350 {
            docs.push(order("Lazada", 1.0, "2024-01-01"));
        }
        for _ in 0..200 {
            docs.push(order("Tiki", 1.0, "2024-01-01"));
        }
        let stages = vec![
            json!({"$group": {"_id": "$data.platform", "count": {"$sum": 1}}}),
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
        ];
        let out = run_pipeline(docs, &stages, &no_lookups()).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0]["value"], json!("Shopee"));
        assert_eq!(out[0]["percentage"], json!(45));
        let sum: f64 = out.iter().map(|d| d["percentage"].as_f64().unwrap()).sum();
        assert!((sum - 100.0).abs() < 0.1);
    }

    #[test]
    fn date_trunc_week_starts_monday() {
        // 2024-01-07 is a Sunday; its week began Monday 2024-01-01.
        let doc = order("Shopee", 1.0, "2024-01-07");
        let out = eval_expr(
            &doc,
            &json!({"$dateTrunc": {"date": "$data.order_date", "unit": "week"}}),
        )
        .unwrap();
        assert_eq!(out, json!("2024-01-01"));

        let doc = order("Shopee", 1.0, "2024-02-15");
        let month = eval_expr(
            &doc,
            &json!({"$dateTrunc": {"date": "$data.order_date", "unit": "month"}}),
        )
        .unwrap();
        assert_eq!(month, json!("2024-02-01"));
        let year = eval_expr(
            &doc,
            &json!({"$dateTrunc": {"date": "$data.order_date", "unit": "year"}}),
        )
        .unwrap();
        assert_eq!(year, json!("2024-01-01"));
    }

    #[test]
    fn match_supports_ranges_and_regex() {
        let docs = vec![
            order("Shopee", 100.0, "2024-01-05"),
            order("Lazada", 200.0, "2024-02-05"),
        ];
        let stages = vec![json!({"$match": {
            "data.order_date": {"$gte": "2024-01-01", "$lte": "2024-01-31"},
            "data.platform": {"$regex": "shop", "$options": "i"},
        }})];
        let out = run_pipeline(docs, &stages, &no_lookups()).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["data"]["platform"], json!("Shopee"));
    }

    #[test]
    fn sort_limit_orders_descending() {
        let docs = vec![
            order("Tiki", 1000.0, "2024-01-01"),
            order("Shopee", 3000.0, "2024-01-01"),
            order("Lazada", 2000.0, "2024-01-01"),
        ];
        let stages = vec![
            json!({"$sort": {"data.total_amount": -1}}),
            json!({"$limit": 2}),
        ];
        let out = run_pipeline(docs, &stages, &no_lookups()).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["data"]["platform"], json!("Shopee"));
        assert_eq!(out[1]["data"]["platform"], json!("Lazada"));
    }

    #[test]
    fn unknown_stage_is_an_error() {
        let err = run_pipeline(vec![], &[json!({"$out": "x"})], &no_lookups()).unwrap_err();
        assert_eq!(err.code(), Some(codes::UNSUPPORTED_STAGE));
    }
}
