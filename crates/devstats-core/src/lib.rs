//! Core domain model for devstats: persisted entities plus the raw, wide and
//! normalized records that flow through the ingestion pipeline.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "devstats-core";

/// Tag prepended to every year column of a wide frame (`YR2021`).
pub const YEAR_LABEL_PREFIX: &str = "YR";

/// Label used for the year column of `year` in a wide frame.
pub fn year_label(year: i32) -> String {
    format!("{YEAR_LABEL_PREFIX}{year}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Country {
    pub code: String,
    pub name: String,
    pub region: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Indicator {
    pub code: String,
    pub name: String,
    pub description: String,
}

/// One stored observation. Unique per (country, indicator, year).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticValue {
    pub country_code: String,
    pub indicator_code: String,
    pub year: i32,
    pub value: Option<f64>,
}

/// Entry of the external catalog listing, before any filtering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEntity {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub region: Option<String>,
}

/// Indicator metadata as reported by the external source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndicatorMetadata {
    pub code: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub source_note: String,
}

/// Untyped cell of a wide frame. Numbers may arrive as text.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Number(f64),
    Text(String),
    #[default]
    Missing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WideRow {
    pub entity_id: String,
    /// Year label (`YR2020`) to raw cell.
    pub cells: BTreeMap<String, RawValue>,
}

/// Wide time-series response for one indicator: one row per entity, one
/// column per requested year.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WideFrame {
    pub indicator_code: String,
    pub rows: Vec<WideRow>,
}

impl WideFrame {
    pub fn new(indicator_code: impl Into<String>) -> Self {
        Self {
            indicator_code: indicator_code.into(),
            rows: Vec::new(),
        }
    }

    pub fn cell_count(&self) -> usize {
        self.rows.iter().map(|r| r.cells.len()).sum()
    }
}

/// Row-wise observation ready for upsert, scoped to one indicator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRow {
    pub country_code: String,
    pub year: i32,
    pub value: f64,
}

/// Non-null value of one indicator for one country/year, with the country
/// name resolved for labelling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub country_code: String,
    pub country_name: String,
    pub year: i32,
    pub value: f64,
}

/// Two indicator values aligned on (country, year).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonPoint {
    pub label: String,
    pub country_code: String,
    pub year: i32,
    pub value_a: f64,
    pub value_b: f64,
}

/// Flat row of the tabular export: a statistic joined with its country and
/// indicator metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRow {
    pub country_name: String,
    pub country_code: String,
    pub region: String,
    pub indicator_name: String,
    pub indicator_code: String,
    pub year: i32,
    pub value: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn year_label_uses_fixed_prefix() {
        assert_eq!(year_label(2021), "YR2021");
    }

    #[test]
    fn raw_value_accepts_numbers_text_and_null() {
        let cells: Vec<RawValue> =
            serde_json::from_str(r#"[12.5, "7.25", null, 3]"#).expect("parse cells");
        assert_eq!(
            cells,
            vec![
                RawValue::Number(12.5),
                RawValue::Text("7.25".into()),
                RawValue::Missing,
                RawValue::Number(3.0),
            ]
        );
    }
}
