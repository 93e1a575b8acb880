//! External statistics source contract + World Bank and fixture implementations.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use devstats_core::{year_label, IndicatorMetadata, RawEntity, RawValue, WideFrame, WideRow};
use devstats_storage::{FetchError, HttpFetcher};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "devstats-adapters";

pub const WORLD_BANK_API_BASE: &str = "https://api.worldbank.org/v2";

/// Region id the World Bank API assigns to aggregate entries.
const WB_AGGREGATE_REGION_ID: &str = "NA";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("source reported an error for {url}: {message}")]
    Api { url: String, message: String },
    #[error("malformed payload from {url}: {reason}")]
    Payload { url: String, reason: String },
    #[error("{what} not found in source")]
    NotFound { what: String },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Everything the ingestion pipeline needs from the outside world.
#[async_trait]
pub trait StatisticsSource: Send + Sync {
    fn source_id(&self) -> &str;

    /// Catalog listing of every entity the source knows, countries and
    /// aggregates alike.
    async fn list_entities(&self) -> Result<Vec<RawEntity>, AdapterError>;

    async fn indicator_metadata(&self, code: &str) -> Result<IndicatorMetadata, AdapterError>;

    /// Wide frame for `code` with one `YR<year>` column per requested year.
    async fn indicator_frame(&self, code: &str, years: &[i32]) -> Result<WideFrame, AdapterError>;
}

#[derive(Debug)]
pub struct WorldBankSource {
    http: HttpFetcher,
    base_url: String,
    per_page: u32,
}

impl WorldBankSource {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            per_page: 1000,
        }
    }

    async fn fetch_all_pages<T: DeserializeOwned>(&self, url_base: &str) -> Result<Vec<T>, AdapterError> {
        let mut out = Vec::new();
        let mut page = 1u32;
        loop {
            let url = format!("{url_base}&per_page={}&page={page}", self.per_page);
            let body: JsonValue = self.http.fetch_json(&url).await?;
            let (meta, records) = split_page::<T>(&url, body)?;
            debug!(url = %url, page, pages = meta.pages, records = records.len(), "fetched page");
            out.extend(records);
            if page >= meta.pages {
                break;
            }
            page += 1;
        }
        Ok(out)
    }
}

#[async_trait]
impl StatisticsSource for WorldBankSource {
    fn source_id(&self) -> &str {
        "worldbank"
    }

    async fn list_entities(&self) -> Result<Vec<RawEntity>, AdapterError> {
        let url = format!("{}/country?format=json", self.base_url);
        let economies: Vec<WbEconomy> = self.fetch_all_pages(&url).await?;
        Ok(economies.into_iter().map(WbEconomy::into_raw_entity).collect())
    }

    async fn indicator_metadata(&self, code: &str) -> Result<IndicatorMetadata, AdapterError> {
        let url = format!("{}/indicator/{code}?format=json", self.base_url);
        let body: JsonValue = self.http.fetch_json(&url).await?;
        let (_meta, records) = split_page::<WbIndicator>(&url, body)?;
        records
            .into_iter()
            .find(|r| r.id == code)
            .map(|r| IndicatorMetadata {
                code: r.id,
                name: r.name,
                source_note: r.source_note.unwrap_or_default(),
            })
            .ok_or_else(|| AdapterError::NotFound {
                what: format!("indicator {code}"),
            })
    }

    async fn indicator_frame(&self, code: &str, years: &[i32]) -> Result<WideFrame, AdapterError> {
        let (Some(first), Some(last)) = (years.iter().min(), years.iter().max()) else {
            return Err(AdapterError::Message(format!(
                "no years requested for indicator {code}"
            )));
        };
        let url = format!(
            "{}/country/all/indicator/{code}?format=json&date={first}:{last}",
            self.base_url
        );
        let observations: Vec<WbObservation> = self.fetch_all_pages(&url).await?;
        Ok(pivot_observations(code, years, observations))
    }
}

#[derive(Debug, Clone, Deserialize)]
struct WbPageMeta {
    #[serde(deserialize_with = "lenient_u32")]
    pages: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct WbRef {
    #[serde(default)]
    id: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Clone, Deserialize)]
struct WbEconomy {
    id: String,
    name: String,
    region: Option<WbRef>,
}

impl WbEconomy {
    fn into_raw_entity(self) -> RawEntity {
        let region = self
            .region
            .filter(|r| r.id != WB_AGGREGATE_REGION_ID)
            .map(|r| r.value.trim().to_string())
            .filter(|v| !v.is_empty());
        RawEntity {
            id: self.id,
            name: self.name,
            region,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct WbIndicator {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(rename = "sourceNote", default)]
    source_note: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct WbObservation {
    country: WbRef,
    #[serde(rename = "countryiso3code", default)]
    country_iso3: String,
    date: String,
    #[serde(default)]
    value: RawValue,
}

fn lenient_u32<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = JsonValue::deserialize(deserializer)?;
    match &value {
        JsonValue::Number(n) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| serde::de::Error::custom(format!("invalid page count {n}"))),
        JsonValue::String(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid page count {s:?}"))),
        other => Err(serde::de::Error::custom(format!("invalid page count {other}"))),
    }
}

/// World Bank responses are `[meta, records]`, `[meta, null]` when empty, or
/// `[{"message": [...]}]` on error.
fn split_page<T: DeserializeOwned>(url: &str, body: JsonValue) -> Result<(WbPageMeta, Vec<T>), AdapterError> {
    let JsonValue::Array(mut parts) = body else {
        return Err(AdapterError::Payload {
            url: url.to_string(),
            reason: "expected a top-level array".into(),
        });
    };

    if let Some(message) = parts.first().and_then(|m| m.get("message")) {
        return Err(AdapterError::Api {
            url: url.to_string(),
            message: api_message_text(message),
        });
    }
    if parts.is_empty() {
        return Err(AdapterError::Payload {
            url: url.to_string(),
            reason: "empty response".into(),
        });
    }

    let records = if parts.len() > 1 { parts.remove(1) } else { JsonValue::Null };
    let meta: WbPageMeta = serde_json::from_value(parts.remove(0)).map_err(|e| AdapterError::Payload {
        url: url.to_string(),
        reason: format!("page metadata: {e}"),
    })?;
    let records = match records {
        JsonValue::Null => Vec::new(),
        other => serde_json::from_value(other).map_err(|e| AdapterError::Payload {
            url: url.to_string(),
            reason: format!("records: {e}"),
        })?,
    };
    Ok((meta, records))
}

fn api_message_text(message: &JsonValue) -> String {
    message
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|m| m.get("value").and_then(JsonValue::as_str))
                .map(str::trim)
                .collect::<Vec<_>>()
                .join("; ")
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| message.to_string())
}

/// Pivot long observations into one row per entity with a column for every
/// requested year; years the source did not report are `Missing`.
fn pivot_observations(code: &str, years: &[i32], observations: Vec<WbObservation>) -> WideFrame {
    let labels: Vec<String> = years.iter().copied().map(year_label).collect();
    let mut rows: BTreeMap<String, BTreeMap<String, RawValue>> = BTreeMap::new();

    for obs in observations {
        let Ok(year) = obs.date.trim().parse::<i32>() else {
            continue;
        };
        if !years.contains(&year) {
            continue;
        }
        let entity_id = if obs.country_iso3.is_empty() {
            obs.country.id
        } else {
            obs.country_iso3
        };
        let cells = rows.entry(entity_id).or_insert_with(|| {
            labels
                .iter()
                .map(|l| (l.clone(), RawValue::Missing))
                .collect()
        });
        cells.insert(year_label(year), obs.value);
    }

    WideFrame {
        indicator_code: code.to_string(),
        rows: rows
            .into_iter()
            .map(|(entity_id, cells)| WideRow { entity_id, cells })
            .collect(),
    }
}

/// Offline capture of a source: catalog, metadata and frames in one file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub fixture_id: String,
    pub source_id: String,
    pub fetched_at: DateTime<Utc>,
    pub entities: Vec<RawEntity>,
    pub indicators: Vec<IndicatorMetadata>,
    pub frames: Vec<WideFrame>,
    #[serde(default)]
    pub notes: Option<String>,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Serves a `FixtureBundle` through the `StatisticsSource` contract.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    bundle: FixtureBundle,
}

impl FixtureSource {
    pub fn new(bundle: FixtureBundle) -> Self {
        Self { bundle }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load_fixture_bundle(path)?))
    }

    pub fn bundle(&self) -> &FixtureBundle {
        &self.bundle
    }
}

#[async_trait]
impl StatisticsSource for FixtureSource {
    fn source_id(&self) -> &str {
        &self.bundle.source_id
    }

    async fn list_entities(&self) -> Result<Vec<RawEntity>, AdapterError> {
        Ok(self.bundle.entities.clone())
    }

    async fn indicator_metadata(&self, code: &str) -> Result<IndicatorMetadata, AdapterError> {
        self.bundle
            .indicators
            .iter()
            .find(|m| m.code == code)
            .cloned()
            .ok_or_else(|| AdapterError::NotFound {
                what: format!("indicator {code}"),
            })
    }

    async fn indicator_frame(&self, code: &str, years: &[i32]) -> Result<WideFrame, AdapterError> {
        let frame = self
            .bundle
            .frames
            .iter()
            .find(|f| f.indicator_code == code)
            .ok_or_else(|| AdapterError::NotFound {
                what: format!("time series for {code}"),
            })?;
        let labels: Vec<String> = years.iter().copied().map(year_label).collect();
        // Columns the fixture does not recognise as year labels are kept so
        // the normalizer sees them exactly as captured.
        let rows = frame
            .rows
            .iter()
            .map(|row| WideRow {
                entity_id: row.entity_id.clone(),
                cells: row
                    .cells
                    .iter()
                    .filter(|(label, _)| {
                        labels.contains(label) || !label.starts_with(devstats_core::YEAR_LABEL_PREFIX)
                    })
                    .map(|(label, value)| (label.clone(), value.clone()))
                    .collect(),
            })
            .collect();
        Ok(WideFrame {
            indicator_code: frame.indicator_code.clone(),
            rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture_bundle_path() -> PathBuf {
        workspace_root()
            .join("fixtures")
            .join("worldbank")
            .join("sample")
            .join("bundle.json")
    }

    #[test]
    fn economies_page_maps_aggregates_to_missing_region() {
        let body: JsonValue = serde_json::from_str(
            r#"[
                {"page": 1, "pages": 1, "per_page": "1000", "total": 2},
                [
                    {"id": "ABW", "iso2Code": "AW", "name": "Aruba",
                     "region": {"id": "LCN", "iso2code": "ZJ", "value": "Latin America & Caribbean "}},
                    {"id": "AFE", "iso2Code": "ZH", "name": "Africa Eastern and Southern",
                     "region": {"id": "NA", "iso2code": "NA", "value": "Aggregates"}}
                ]
            ]"#,
        )
        .unwrap();
        let (meta, economies) = split_page::<WbEconomy>("test://country", body).unwrap();
        assert_eq!(meta.pages, 1);
        let entities: Vec<RawEntity> = economies.into_iter().map(WbEconomy::into_raw_entity).collect();
        assert_eq!(entities[0].region.as_deref(), Some("Latin America & Caribbean"));
        assert_eq!(entities[1].id, "AFE");
        assert_eq!(entities[1].region, None);
    }

    #[test]
    fn api_error_payload_is_reported() {
        let body: JsonValue = serde_json::from_str(
            r#"[{"message": [{"id": "120", "key": "Invalid value", "value": "The provided parameter value is not valid"}]}]"#,
        )
        .unwrap();
        let err = split_page::<WbIndicator>("test://indicator/BAD", body).unwrap_err();
        match err {
            AdapterError::Api { message, .. } => {
                assert_eq!(message, "The provided parameter value is not valid")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_data_page_yields_no_records() {
        let body: JsonValue = serde_json::from_str(
            r#"[{"page": 0, "pages": 0, "per_page": 1000, "total": 0}, null]"#,
        )
        .unwrap();
        let (meta, records) = split_page::<WbObservation>("test://data", body).unwrap();
        assert_eq!(meta.pages, 0);
        assert!(records.is_empty());
    }

    #[test]
    fn observations_pivot_into_wide_frame() {
        let body: JsonValue = serde_json::from_str(
            r#"[
                {"page": 1, "pages": 1, "per_page": 1000, "total": 4},
                [
                    {"indicator": {"id": "SP.POP.TOTL", "value": "Population, total"},
                     "country": {"id": "US", "value": "United States"},
                     "countryiso3code": "USA", "date": "2021", "value": 331893745},
                    {"indicator": {"id": "SP.POP.TOTL", "value": "Population, total"},
                     "country": {"id": "US", "value": "United States"},
                     "countryiso3code": "USA", "date": "2020", "value": null},
                    {"indicator": {"id": "SP.POP.TOTL", "value": "Population, total"},
                     "country": {"id": "XK", "value": "Kosovo"},
                     "countryiso3code": "", "date": "2021", "value": 1786038},
                    {"indicator": {"id": "SP.POP.TOTL", "value": "Population, total"},
                     "country": {"id": "US", "value": "United States"},
                     "countryiso3code": "USA", "date": "2018", "value": 1.0}
                ]
            ]"#,
        )
        .unwrap();
        let (_meta, observations) = split_page::<WbObservation>("test://data", body).unwrap();
        let frame = pivot_observations("SP.POP.TOTL", &[2020, 2021], observations);

        assert_eq!(frame.rows.len(), 2);
        let usa = frame.rows.iter().find(|r| r.entity_id == "USA").unwrap();
        assert_eq!(usa.cells.len(), 2);
        assert_eq!(usa.cells["YR2020"], RawValue::Missing);
        assert_eq!(usa.cells["YR2021"], RawValue::Number(331893745.0));
        assert!(frame.rows.iter().any(|r| r.entity_id == "XK"));
    }

    #[test]
    fn page_count_accepts_numeric_strings() {
        let meta: WbPageMeta = serde_json::from_str(r#"{"pages": "3"}"#).unwrap();
        assert_eq!(meta.pages, 3);
    }

    #[tokio::test]
    async fn fixture_source_serves_bundle() {
        let source = FixtureSource::from_path(fixture_bundle_path()).unwrap();
        assert_eq!(source.source_id(), "worldbank");

        let entities = source.list_entities().await.unwrap();
        assert!(entities.iter().any(|e| e.id == "USA"));
        assert!(entities.iter().any(|e| e.id == "WLD"));

        let meta = source.indicator_metadata("SP.POP.TOTL").await.unwrap();
        assert!(!meta.source_note.is_empty());

        let frame = source.indicator_frame("SP.POP.TOTL", &[2020]).await.unwrap();
        assert!(frame
            .rows
            .iter()
            .all(|r| r.cells.keys().all(|label| label == "YR2020")));
    }

    #[tokio::test]
    async fn fixture_source_reports_missing_indicator() {
        let source = FixtureSource::from_path(fixture_bundle_path()).unwrap();
        let err = source.indicator_metadata("NOT.A.CODE").await.unwrap_err();
        assert!(matches!(err, AdapterError::NotFound { .. }));
        let err = source.indicator_frame("NOT.A.CODE", &[2020]).await.unwrap_err();
        assert!(matches!(err, AdapterError::NotFound { .. }));
    }
}
