//! Mapping between sheet columns and system fields.
//!
//! A mapping's `sheet_column` is either a column letter (`A`..`Z`, `AA`..)
//! indexed directly, or a header-name string resolved against the header
//! row. Missing required columns fail the whole sync; coercion failures
//! never do (the original string is kept).

use chrono::NaiveDate;
use serde_json::{json, Map, Value};

use crate::error::codes;
use crate::models::{ColumnMapping, DataType};
use crate::{Error, Result};

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d", "%d/%m/%Y", "%m/%d/%Y", "%Y/%m/%d", "%d-%m-%Y", "%m-%d-%Y",
];

#[derive(Debug, Default, Clone, Copy)]
pub struct ColumnMapper;

impl ColumnMapper {
    pub fn new() -> Self {
        Self
    }

    /// `A` -> 0, `B` -> 1, ..., `Z` -> 25, `AA` -> 26, ...
    pub fn column_letter_to_index(letter: &str) -> usize {
        let mut result = 0usize;
        for ch in letter.to_ascii_uppercase().bytes() {
            result = result * 26 + (ch - b'A' + 1) as usize;
        }
        result - 1
    }

    /// Short uppercase runs (`A`..`ZZZ`) are column letters; anything else,
    /// including mixed-case words like `Total`, is a header name.
    pub fn is_column_letter(value: &str) -> bool {
        (1..=3).contains(&value.len()) && value.bytes().all(|b| b.is_ascii_uppercase())
    }

    /// Resolve a mapping's column reference to a 0-based index.
    ///
    /// Header names matching more than one header cell are ambiguous and
    /// rejected; `Ok(None)` means the reference matched nothing.
    pub fn resolve_column(
        &self,
        sheet_column: &str,
        headers: &[String],
    ) -> Result<Option<usize>> {
        if Self::is_column_letter(sheet_column) {
            return Ok(Some(Self::column_letter_to_index(sheet_column)));
        }
        let mut positions = headers.iter().enumerate().filter(|(_, h)| *h == sheet_column);
        let first = positions.next().map(|(i, _)| i);
        if first.is_some() && positions.next().is_some() {
            return Err(Error::validation(
                codes::DUPLICATE_HEADER,
                format!("header '{sheet_column}' appears more than once in the header row"),
            ));
        }
        Ok(first)
    }

    /// Fail fast before any row is processed.
    pub fn validate_required_columns(
        &self,
        headers: &[String],
        mappings: &[ColumnMapping],
    ) -> Result<()> {
        for mapping in mappings.iter().filter(|m| m.required) {
            if self.resolve_column(&mapping.sheet_column, headers)?.is_none() {
                return Err(Error::validation(
                    codes::MISSING_REQUIRED_COLUMN,
                    format!(
                        "required column '{}' for field '{}' not found in sheet",
                        mapping.sheet_column, mapping.system_field
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Coerce a cell to its declared type; the original string survives any
    /// failed conversion.
    pub fn coerce(value: &str, data_type: DataType) -> Value {
        if value.is_empty() {
            return json!(value);
        }
        match data_type {
            DataType::String => json!(value),
            DataType::Number => match value.replace(',', ".").trim().parse::<f64>() {
                Ok(n) => json!(n),
                Err(_) => json!(value),
            },
            DataType::Integer => match value.replace(',', ".").trim().parse::<f64>() {
                Ok(n) => json!(n as i64),
                Err(_) => json!(value),
            },
            DataType::Date => {
                for format in DATE_FORMATS {
                    if let Ok(date) = NaiveDate::parse_from_str(value.trim(), format) {
                        return json!(date.format("%Y-%m-%d").to_string());
                    }
                }
                json!(value)
            }
        }
    }

    /// Map one sheet row into the system-field document.
    pub fn map_row(
        &self,
        row: &[String],
        headers: &[String],
        mappings: &[ColumnMapping],
    ) -> Result<Value> {
        let mut out = Map::new();
        for mapping in mappings {
            let Some(index) = self.resolve_column(&mapping.sheet_column, headers)? else {
                if mapping.required {
                    return Err(Error::validation(
                        codes::MISSING_REQUIRED_COLUMN,
                        format!(
                            "required column '{}' for field '{}' not found in sheet",
                            mapping.sheet_column, mapping.system_field
                        ),
                    ));
                }
                continue;
            };
            let cell = row.get(index).map(String::as_str).unwrap_or("");
            out.insert(
                mapping.system_field.clone(),
                Self::coerce(cell, mapping.data_type),
            );
        }
        Ok(Value::Object(out))
    }

    /// Raw cells keyed by header name, padded with empty strings.
    pub fn raw_row(&self, row: &[String], headers: &[String]) -> Value {
        let mut out = Map::new();
        for (i, header) in headers.iter().enumerate() {
            out.insert(
                header.clone(),
                json!(row.get(i).map(String::as_str).unwrap_or("")),
            );
        }
        Value::Object(out)
    }
}
