//! Per-sheet-type analytics: strategy table, cache layer, and the engine
//! serving dashboard queries.

pub mod cache;
pub mod detector;
pub mod engine;
pub mod strategies;

pub use cache::AnalyticsCache;
pub use detector::{detect_sheet_type, SheetType};
pub use engine::AnalyticsEngine;
pub use strategies::{strategy_for, SheetStrategy};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Day,
    Week,
    Month,
    Year,
}

impl Granularity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Year => "year",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeSeriesMetrics {
    Count,
    Amount,
    Both,
}

impl TimeSeriesMetrics {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Amount => "amount",
            Self::Both => "both",
        }
    }

    pub fn wants_count(self) -> bool {
        matches!(self, Self::Count | Self::Both)
    }

    pub fn wants_amount(self) -> bool {
        matches!(self, Self::Amount | Self::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopMetric {
    Count,
    Amount,
    Quantity,
}

impl TopMetric {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Amount => "amount",
            Self::Quantity => "quantity",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}
