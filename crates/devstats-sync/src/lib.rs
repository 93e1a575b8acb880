//! Ingestion pipeline, comparison joiner and tabular export.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use arrow_array::{Float64Array, Int32Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use devstats_adapters::{FixtureSource, StatisticsSource, WorldBankSource, WORLD_BANK_API_BASE};
use devstats_core::{
    ComparisonPoint, Country, ExportRow, Indicator, NormalizedRow, RawEntity, RawValue,
    SeriesPoint, WideFrame, YEAR_LABEL_PREFIX,
};
use devstats_storage::{EntityStore, HttpClientConfig, HttpFetcher, StoreCounts, StoreError, UpsertOutcome};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "devstats-sync";

pub const DEFAULT_YEARS: (i32, i32) = (2019, 2023);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceMode {
    Api,
    Fixture,
}

impl FromStr for SourceMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "api" => Ok(SourceMode::Api),
            "fixture" => Ok(SourceMode::Fixture),
            other => bail!("unknown source mode {other:?} (expected `api` or `fixture`)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub source_mode: SourceMode,
    pub fixture_path: PathBuf,
    pub api_base: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub indicator_pause: Duration,
    pub years: Vec<i32>,
    pub catalog_path: PathBuf,
    pub workspace_root: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://devstats.db".to_string(),
            source_mode: SourceMode::Api,
            fixture_path: PathBuf::from("fixtures/worldbank/sample/bundle.json"),
            api_base: WORLD_BANK_API_BASE.to_string(),
            user_agent: "devstats-bot/0.1".to_string(),
            http_timeout_secs: 30,
            indicator_pause: Duration::from_secs(2),
            years: (DEFAULT_YEARS.0..=DEFAULT_YEARS.1).collect(),
            catalog_path: PathBuf::from("indicators.yaml"),
            workspace_root: PathBuf::from("."),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            source_mode: std::env::var("DEVSTATS_SOURCE_MODE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.source_mode),
            fixture_path: std::env::var("DEVSTATS_FIXTURE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.fixture_path),
            api_base: std::env::var("DEVSTATS_API_BASE").unwrap_or(defaults.api_base),
            user_agent: std::env::var("DEVSTATS_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("DEVSTATS_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            indicator_pause: std::env::var("DEVSTATS_INDICATOR_PAUSE_SECS")
                .ok()
                .and_then(|v| parse_pause(&v))
                .unwrap_or(defaults.indicator_pause),
            years: std::env::var("DEVSTATS_YEARS")
                .ok()
                .and_then(|v| parse_years(&v).ok())
                .unwrap_or(defaults.years),
            catalog_path: std::env::var("DEVSTATS_CATALOG")
                .map(PathBuf::from)
                .unwrap_or(defaults.catalog_path),
            workspace_root: std::env::var("DEVSTATS_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
        }
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }
}

/// Seconds as a pause length; `None` for negative, non-finite or
/// out-of-range input.
pub fn parse_pause(input: &str) -> Option<Duration> {
    let secs = input.trim().parse::<f64>().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

/// Parse `2019:2023` (inclusive) or `2019,2021,2023` into a sorted,
/// de-duplicated year list.
pub fn parse_years(input: &str) -> Result<Vec<i32>> {
    let input = input.trim();
    let mut years = if let Some((start, end)) = input.split_once(':') {
        let start: i32 = start.trim().parse().with_context(|| format!("bad start year in {input:?}"))?;
        let end: i32 = end.trim().parse().with_context(|| format!("bad end year in {input:?}"))?;
        if start > end {
            bail!("year range {input:?} is reversed");
        }
        (start..=end).collect::<Vec<_>>()
    } else {
        input
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| part.parse::<i32>().with_context(|| format!("bad year {part:?}")))
            .collect::<Result<Vec<_>>>()?
    };
    years.sort_unstable();
    years.dedup();
    if years.is_empty() {
        bail!("no years in {input:?}");
    }
    Ok(years)
}

// ---------------------------------------------------------------------------
// Indicator catalog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IndicatorCatalog {
    #[serde(default)]
    pub version: u32,
    pub indicators: Vec<IndicatorSpec>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IndicatorSpec {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl IndicatorCatalog {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let catalog: Self = serde_yaml::from_str(raw).context("parsing indicator catalog")?;
        let mut seen = HashSet::new();
        for spec in &catalog.indicators {
            if spec.code.trim().is_empty() {
                bail!("indicator catalog has an entry with a blank code");
            }
            if !seen.insert(spec.code.as_str()) {
                bail!("indicator {} listed twice in catalog", spec.code);
            }
        }
        Ok(catalog)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("loading {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &IndicatorSpec> {
        self.indicators.iter().filter(|spec| spec.enabled)
    }
}

// ---------------------------------------------------------------------------
// Ingestion filter
// ---------------------------------------------------------------------------

/// Identifier prefixes the World Bank uses for regional, income and lending
/// groupings.
pub const AGGREGATE_PREFIXES: &[&str] = &[
    "REG", "INX", "EMU", "EAS", "ECS", "EUU", "ARB", "CEB", "CSS", "EAP", "ECA", "EAR", "FCS",
    "HIC", "HPC", "IBD", "IBT", "IDA", "IDB", "IDX", "LAC", "LCN", "LDC", "LIC", "LMC", "LMY",
    "LTE", "MEA", "MIC", "MNA", "NAC", "OED", "OSS", "PRE", "PSS", "PST", "SAS", "SSA", "SSF",
    "SST", "TEA", "TEC", "TLA", "TMN", "TSA", "TSS", "UMC", "WLD",
];

/// Matched against the lower-cased display name.
pub const REJECTED_NAME_FRAGMENTS: &[&str] = &["region", "union", "income", "aggregate"];

pub const UNKNOWN_REGION: &str = "Unknown";

pub const COUNTRY_CODE_LEN: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    AggregatePrefix(&'static str),
    CodeLength(usize),
    MissingRegion,
    AggregateName(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityDecision {
    Accept(Country),
    Reject(RejectReason),
    Malformed(String),
}

pub fn classify_entity(raw: &RawEntity) -> EntityDecision {
    if raw.id.trim().is_empty() {
        return EntityDecision::Malformed("missing identifier".to_string());
    }

    if let Some(prefix) = AGGREGATE_PREFIXES.iter().find(|p| raw.id.starts_with(**p)) {
        return EntityDecision::Reject(RejectReason::AggregatePrefix(*prefix));
    }

    let len = raw.id.chars().count();
    if len != COUNTRY_CODE_LEN {
        return EntityDecision::Reject(RejectReason::CodeLength(len));
    }

    let region = match raw.region.as_deref().map(str::trim) {
        Some(region) if !region.is_empty() && region != UNKNOWN_REGION => region,
        _ => return EntityDecision::Reject(RejectReason::MissingRegion),
    };

    let lowered = raw.name.to_lowercase();
    if let Some(fragment) = REJECTED_NAME_FRAGMENTS.iter().find(|f| lowered.contains(**f)) {
        return EntityDecision::Reject(RejectReason::AggregateName(*fragment));
    }

    EntityDecision::Accept(Country {
        code: raw.id.clone(),
        name: raw.name.trim().to_string(),
        region: region.to_string(),
    })
}

pub fn is_real_country(raw: &RawEntity) -> bool {
    matches!(classify_entity(raw), EntityDecision::Accept(_))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CountryIngestSummary {
    pub seen: usize,
    pub saved: usize,
    pub rejected: usize,
    pub malformed: usize,
    pub failed: usize,
}

/// Filter the catalog listing and upsert every genuine country in one
/// transaction.
pub async fn ingest_countries(
    store: &EntityStore,
    entities: &[RawEntity],
) -> Result<CountryIngestSummary, StoreError> {
    let mut summary = CountryIngestSummary {
        seen: entities.len(),
        ..Default::default()
    };
    let mut batch = store.begin().await?;

    for raw in entities {
        match classify_entity(raw) {
            EntityDecision::Accept(country) => match batch.upsert_country(&country).await {
                Ok(()) => {
                    summary.saved += 1;
                    debug!(code = %country.code, name = %country.name, "saved country");
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    summary.failed += 1;
                    warn!(code = %country.code, error = %err, "failed to save country");
                }
            },
            EntityDecision::Reject(reason) => {
                summary.rejected += 1;
                debug!(id = %raw.id, name = %raw.name, ?reason, "skipping non-country entity");
            }
            EntityDecision::Malformed(reason) => {
                summary.malformed += 1;
                warn!(id = %raw.id, %reason, "skipping malformed catalog entry");
            }
        }
    }

    batch.commit().await?;
    Ok(summary)
}

// ---------------------------------------------------------------------------
// Value normalizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Error)]
pub enum NormalizeError {
    #[error("malformed year label {0:?}")]
    YearLabel(String),
    #[error("value {raw:?} is not numeric")]
    NotNumeric { raw: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    UnknownCountry,
    MissingValue,
    NotNumeric,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    Row(NormalizedRow),
    Skip(SkipReason),
    Fail(NormalizeError),
}

/// One (entity, year label, raw value) triple of a melted wide frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeltedCell<'a> {
    pub entity_id: &'a str,
    pub year_label: &'a str,
    pub value: &'a RawValue,
}

pub fn melt(frame: &WideFrame) -> impl Iterator<Item = MeltedCell<'_>> {
    frame.rows.iter().flat_map(|row| {
        row.cells.iter().map(move |(label, value)| MeltedCell {
            entity_id: row.entity_id.as_str(),
            year_label: label.as_str(),
            value,
        })
    })
}

/// `YR2021` -> 2021. A bare year is accepted too.
pub fn parse_year_label(label: &str) -> Result<i32, NormalizeError> {
    let digits = label.strip_prefix(YEAR_LABEL_PREFIX).unwrap_or(label).trim();
    digits
        .parse::<i32>()
        .map_err(|_| NormalizeError::YearLabel(label.to_string()))
}

/// `Ok(None)` for missing or NaN values.
pub fn coerce_value(raw: &RawValue) -> Result<Option<f64>, NormalizeError> {
    let value = match raw {
        RawValue::Missing => return Ok(None),
        RawValue::Number(n) => *n,
        RawValue::Text(text) => {
            let text = text.trim();
            if text.is_empty() {
                return Ok(None);
            }
            text.parse::<f64>().map_err(|_| NormalizeError::NotNumeric {
                raw: text.to_string(),
            })?
        }
    };
    Ok((!value.is_nan()).then_some(value))
}

pub fn normalize_cell(known_countries: &HashSet<String>, cell: &MeltedCell<'_>) -> RowOutcome {
    if !known_countries.contains(cell.entity_id) {
        return RowOutcome::Skip(SkipReason::UnknownCountry);
    }

    let year = match parse_year_label(cell.year_label) {
        Ok(year) => year,
        Err(err) => return RowOutcome::Fail(err),
    };

    match coerce_value(cell.value) {
        Ok(Some(value)) => RowOutcome::Row(NormalizedRow {
            country_code: cell.entity_id.to_string(),
            year,
            value,
        }),
        Ok(None) => RowOutcome::Skip(SkipReason::MissingValue),
        Err(err) => {
            debug!(country = cell.entity_id, year, error = %err, "skipping non-numeric value");
            RowOutcome::Skip(SkipReason::NotNumeric)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizeReport {
    pub rows: Vec<NormalizedRow>,
    pub cells: usize,
    pub unknown_country: usize,
    pub missing: usize,
    pub non_numeric: usize,
    pub failed: usize,
}

impl NormalizeReport {
    pub fn skipped(&self) -> usize {
        self.unknown_country + self.missing + self.non_numeric
    }

    fn record(&mut self, outcome: RowOutcome) {
        self.cells += 1;
        match outcome {
            RowOutcome::Row(row) => self.rows.push(row),
            RowOutcome::Skip(SkipReason::UnknownCountry) => self.unknown_country += 1,
            RowOutcome::Skip(SkipReason::MissingValue) => self.missing += 1,
            RowOutcome::Skip(SkipReason::NotNumeric) => self.non_numeric += 1,
            RowOutcome::Fail(_) => self.failed += 1,
        }
    }
}

pub fn normalize_frame(frame: &WideFrame, known_countries: &HashSet<String>) -> NormalizeReport {
    let mut report = NormalizeReport::default();
    for cell in melt(frame) {
        let outcome = normalize_cell(known_countries, &cell);
        if let RowOutcome::Fail(err) = &outcome {
            warn!(
                indicator = %frame.indicator_code,
                country = cell.entity_id,
                error = %err,
                "skipping row"
            );
        }
        report.record(outcome);
    }
    report
}

// ---------------------------------------------------------------------------
// Upsert engine
// ---------------------------------------------------------------------------

pub const PROGRESS_EVERY: usize = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertSummary {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
}

impl UpsertSummary {
    pub fn changed(&self) -> usize {
        self.created + self.updated
    }
}

/// Changed-value count across every indicator of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunProgress {
    changed: usize,
}

impl RunProgress {
    pub fn changed(&self) -> usize {
        self.changed
    }

    /// Returns true when this change crossed a `PROGRESS_EVERY` boundary.
    fn record_change(&mut self) -> bool {
        self.changed += 1;
        let due = self.changed % PROGRESS_EVERY == 0;
        if due {
            info!(changed = self.changed, "progress");
        }
        due
    }
}

/// Write one indicator's rows in a single transaction. A fatal store error
/// drops the batch, which rolls back everything written for the indicator.
pub async fn upsert_indicator_values(
    store: &EntityStore,
    indicator_code: &str,
    rows: &[NormalizedRow],
) -> Result<UpsertSummary, StoreError> {
    upsert_indicator_values_tracked(store, indicator_code, rows, &mut RunProgress::default()).await
}

/// Same as `upsert_indicator_values`, counting changes into `progress`.
pub async fn upsert_indicator_values_tracked(
    store: &EntityStore,
    indicator_code: &str,
    rows: &[NormalizedRow],
    progress: &mut RunProgress,
) -> Result<UpsertSummary, StoreError> {
    let mut summary = UpsertSummary::default();
    let mut batch = store.begin().await?;

    for row in rows {
        match batch.upsert_value(indicator_code, row).await {
            Ok(outcome) => {
                match outcome {
                    UpsertOutcome::Created => summary.created += 1,
                    UpsertOutcome::Updated => summary.updated += 1,
                    UpsertOutcome::Unchanged => summary.unchanged += 1,
                }
                if outcome.is_change() {
                    debug!(
                        country = %row.country_code,
                        year = row.year,
                        value = row.value,
                        ?outcome,
                        "saved value"
                    );
                    progress.record_change();
                }
            }
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                summary.failed += 1;
                warn!(
                    indicator = indicator_code,
                    country = %row.country_code,
                    year = row.year,
                    error = %err,
                    "failed to save value"
                );
            }
        }
    }

    batch.commit().await?;
    Ok(summary)
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorStatus {
    Completed,
    MetadataFailed,
    FetchFailed,
    WriteFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndicatorReport {
    pub code: String,
    pub status: IndicatorStatus,
    pub cells: usize,
    pub rows: usize,
    pub skipped: usize,
    pub failed_rows: usize,
    pub upsert: UpsertSummary,
    pub error: Option<String>,
}

impl IndicatorReport {
    fn failed(code: &str, status: IndicatorStatus, error: String) -> Self {
        Self {
            code: code.to_string(),
            status,
            cells: 0,
            rows: 0,
            skipped: 0,
            failed_rows: 0,
            upsert: UpsertSummary::default(),
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestRunSummary {
    pub run_id: Uuid,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub countries: CountryIngestSummary,
    pub indicators_saved: usize,
    pub indicators_failed: usize,
    pub values_changed: usize,
    pub totals: StoreCounts,
    pub indicators: Vec<IndicatorReport>,
}

impl IngestRunSummary {
    /// Plain-text report printed at the end of an ingest run.
    pub fn render_text(&self) -> String {
        let mut lines = vec![
            format!("Ingest run {} ({})", self.run_id, self.source_id),
            format!("Countries saved: {}", self.countries.saved),
            format!(
                "Indicators saved: {} (failed: {})",
                self.indicators_saved, self.indicators_failed
            ),
            format!("Values changed: {}", self.values_changed),
        ];
        for report in &self.indicators {
            let mut line = format!(
                "- {}: {:?}, {} created, {} updated, {} unchanged",
                report.code,
                report.status,
                report.upsert.created,
                report.upsert.updated,
                report.upsert.unchanged
            );
            if let Some(err) = &report.error {
                line.push_str(&format!(" ({err})"));
            }
            lines.push(line);
        }
        lines.push(format!(
            "Database totals: {} countries, {} indicators, {} values",
            self.totals.countries, self.totals.indicators, self.totals.values
        ));
        lines.join("\n")
    }
}

pub struct IngestPipeline {
    config: SyncConfig,
    catalog: IndicatorCatalog,
    source: Box<dyn StatisticsSource>,
    store: EntityStore,
}

impl IngestPipeline {
    pub fn new(
        config: SyncConfig,
        catalog: IndicatorCatalog,
        source: Box<dyn StatisticsSource>,
        store: EntityStore,
    ) -> Self {
        Self {
            config,
            catalog,
            source,
            store,
        }
    }

    pub async fn run_once(&self) -> Result<IngestRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest_run", %run_id, source = self.source.source_id());
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<IngestRunSummary> {
        let started_at = Utc::now();

        info!("fetching countries");
        let entities = match self.source.list_entities().await {
            Ok(entities) => entities,
            Err(err) => {
                error!(error = %err, "failed to fetch country catalog");
                return Err(anyhow::Error::new(err).context("fetching country catalog"));
            }
        };
        let countries = ingest_countries(&self.store, &entities)
            .await
            .context("saving countries")?;
        info!(
            saved = countries.saved,
            rejected = countries.rejected,
            malformed = countries.malformed,
            "countries saved"
        );

        let mut reports = Vec::new();
        let mut ready = Vec::new();
        info!("fetching indicator metadata");
        for spec in self.catalog.enabled() {
            match self.save_indicator(spec).await {
                Ok(()) => ready.push(spec),
                Err(err) => {
                    error!(indicator = %spec.code, error = %format!("{err:#}"), "failed to save indicator");
                    reports.push(IndicatorReport::failed(
                        &spec.code,
                        IndicatorStatus::MetadataFailed,
                        format!("{err:#}"),
                    ));
                }
            }
        }

        let known_countries = self
            .store
            .country_codes()
            .await
            .context("loading country codes")?;
        let mut progress = RunProgress::default();
        for (idx, spec) in ready.iter().enumerate() {
            if idx > 0 && !self.config.indicator_pause.is_zero() {
                tokio::time::sleep(self.config.indicator_pause).await;
            }
            let span = info_span!("indicator", code = %spec.code);
            let report = self
                .process_indicator(spec, &known_countries, &mut progress)
                .instrument(span)
                .await;
            reports.push(report);
        }

        let indicators_saved = reports
            .iter()
            .filter(|r| r.status == IndicatorStatus::Completed)
            .count();
        let values_changed = reports.iter().map(|r| r.upsert.changed()).sum();
        let totals = self.store.counts().await.context("counting rows")?;
        let summary = IngestRunSummary {
            run_id,
            source_id: self.source.source_id().to_string(),
            started_at,
            finished_at: Utc::now(),
            countries,
            indicators_saved,
            indicators_failed: reports.len() - indicators_saved,
            values_changed,
            totals,
            indicators: reports,
        };
        info!(
            indicators_saved = summary.indicators_saved,
            indicators_failed = summary.indicators_failed,
            values_changed = summary.values_changed,
            "ingest run finished"
        );
        Ok(summary)
    }

    async fn save_indicator(&self, spec: &IndicatorSpec) -> Result<()> {
        let metadata = self
            .source
            .indicator_metadata(&spec.code)
            .await
            .with_context(|| format!("fetching metadata for {}", spec.code))?;
        let name = if spec.name.trim().is_empty() {
            metadata.name
        } else {
            spec.name.clone()
        };
        let indicator = Indicator {
            code: spec.code.clone(),
            name,
            description: metadata.source_note,
        };
        self.store
            .upsert_indicator(&indicator)
            .await
            .with_context(|| format!("saving indicator {}", spec.code))?;
        debug!(code = %indicator.code, name = %indicator.name, "saved indicator");
        Ok(())
    }

    async fn process_indicator(
        &self,
        spec: &IndicatorSpec,
        known_countries: &HashSet<String>,
        progress: &mut RunProgress,
    ) -> IndicatorReport {
        info!(name = %spec.name, "fetching values");
        let frame = match self.source.indicator_frame(&spec.code, &self.config.years).await {
            Ok(frame) => frame,
            Err(err) => {
                error!(error = %err, "failed to fetch time series");
                return IndicatorReport::failed(&spec.code, IndicatorStatus::FetchFailed, err.to_string());
            }
        };

        let normalized = normalize_frame(&frame, known_countries);
        debug!(
            cells = normalized.cells,
            rows = normalized.rows.len(),
            skipped = normalized.skipped(),
            failed = normalized.failed,
            "normalized frame"
        );

        let mut report = IndicatorReport {
            code: spec.code.clone(),
            status: IndicatorStatus::Completed,
            cells: normalized.cells,
            rows: normalized.rows.len(),
            skipped: normalized.skipped(),
            failed_rows: normalized.failed,
            upsert: UpsertSummary::default(),
            error: None,
        };

        match upsert_indicator_values_tracked(&self.store, &spec.code, &normalized.rows, progress).await {
            Ok(upsert) => {
                info!(
                    created = upsert.created,
                    updated = upsert.updated,
                    unchanged = upsert.unchanged,
                    failed = upsert.failed,
                    "indicator saved"
                );
                report.upsert = upsert;
            }
            Err(err) => {
                error!(error = %err, "indicator batch rolled back");
                report.status = IndicatorStatus::WriteFailed;
                report.error = Some(err.to_string());
            }
        }
        report
    }
}

pub fn build_source(config: &SyncConfig) -> Result<Box<dyn StatisticsSource>> {
    match config.source_mode {
        SourceMode::Api => {
            let http = HttpFetcher::new(HttpClientConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
            })?;
            Ok(Box::new(WorldBankSource::new(http, config.api_base.clone())))
        }
        SourceMode::Fixture => {
            let path = config.resolve(&config.fixture_path);
            let source = FixtureSource::from_path(&path)
                .with_context(|| format!("loading fixture source {}", path.display()))?;
            Ok(Box::new(source))
        }
    }
}

pub async fn run_ingest_once_from_env() -> Result<IngestRunSummary> {
    let config = SyncConfig::from_env();
    let catalog = IndicatorCatalog::from_path(config.resolve(&config.catalog_path))?;
    let store = EntityStore::open(&config.database_url)
        .await
        .with_context(|| format!("opening {}", config.database_url))?;
    let source = build_source(&config)?;
    IngestPipeline::new(config, catalog, source, store).run_once().await
}

// ---------------------------------------------------------------------------
// Comparison
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct CompareRequest {
    #[serde(default)]
    pub indicator_a: String,
    #[serde(default)]
    pub indicator_b: String,
    #[serde(default)]
    pub countries: Vec<String>,
}

#[derive(Debug, Error)]
pub enum CompareError {
    #[error("Please select both indicators and at least one country")]
    MissingSelection,
    #[error("No data available for the selected combination")]
    NoData,
    #[error("No matching data points found for the selected combination")]
    NoMatches,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CompareError {
    /// Errors caused by the request rather than the store.
    pub fn is_user_error(&self) -> bool {
        !matches!(self, CompareError::Store(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Comparison {
    pub indicator_a: Indicator,
    pub indicator_b: Indicator,
    pub points: Vec<ComparisonPoint>,
}

impl Comparison {
    pub fn title(&self) -> String {
        format!(
            "Comparison of {} vs {}",
            self.indicator_a.name, self.indicator_b.name
        )
    }
}

/// Pair every A point with the B point for the same (country, year). Output
/// follows A's order; unmatched A points are dropped.
pub fn join_series(a: &[SeriesPoint], b: &[SeriesPoint]) -> Vec<ComparisonPoint> {
    let lookup: HashMap<(&str, i32), f64> = b
        .iter()
        .map(|point| ((point.country_code.as_str(), point.year), point.value))
        .collect();

    a.iter()
        .filter_map(|point| {
            lookup
                .get(&(point.country_code.as_str(), point.year))
                .map(|value_b| ComparisonPoint {
                    label: format!("{} ({})", point.country_name, point.year),
                    country_code: point.country_code.clone(),
                    year: point.year,
                    value_a: point.value,
                    value_b: *value_b,
                })
        })
        .collect()
}

pub async fn compare(store: &EntityStore, request: &CompareRequest) -> Result<Comparison, CompareError> {
    let code_a = request.indicator_a.trim();
    let code_b = request.indicator_b.trim();
    let mut countries: Vec<String> = Vec::new();
    for code in request.countries.iter().map(|c| c.trim()).filter(|c| !c.is_empty()) {
        if !countries.iter().any(|seen| seen == code) {
            countries.push(code.to_string());
        }
    }
    if code_a.is_empty() || code_b.is_empty() || countries.is_empty() {
        return Err(CompareError::MissingSelection);
    }

    let series_a = store.series(code_a, &countries).await?;
    let series_b = store.series(code_b, &countries).await?;
    if series_a.is_empty() || series_b.is_empty() {
        return Err(CompareError::NoData);
    }

    let points = join_series(&series_a, &series_b);
    if points.is_empty() {
        return Err(CompareError::NoMatches);
    }

    Ok(Comparison {
        indicator_a: indicator_or_code(store, code_a).await?,
        indicator_b: indicator_or_code(store, code_b).await?,
        points,
    })
}

async fn indicator_or_code(store: &EntityStore, code: &str) -> Result<Indicator, StoreError> {
    Ok(store.indicator(code).await?.unwrap_or_else(|| Indicator {
        code: code.to_string(),
        name: code.to_string(),
        description: String::new(),
    }))
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

pub const EXPORT_COLUMNS: [&str; 7] = [
    "Country",
    "Country Code",
    "Region",
    "Indicator",
    "Indicator Code",
    "Year",
    "Value",
];

pub const CSV_FILE_NAME: &str = "statistics.csv";
pub const PARQUET_FILE_NAME: &str = "statistics.parquet";
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportManifest {
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
    pub row_count: usize,
    pub files: Vec<ExportManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Flat rows as CSV with a header line. Missing values are empty cells.
pub fn render_csv(rows: &[ExportRow]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(EXPORT_COLUMNS).context("writing csv header")?;
    for row in rows {
        let year = row.year.to_string();
        let value = row.value.map(|v| v.to_string()).unwrap_or_default();
        writer
            .write_record([
                row.country_name.as_str(),
                row.country_code.as_str(),
                row.region.as_str(),
                row.indicator_name.as_str(),
                row.indicator_code.as_str(),
                year.as_str(),
                value.as_str(),
            ])
            .with_context(|| format!("writing csv row for {} {}", row.country_code, row.year))?;
    }
    writer
        .into_inner()
        .map_err(|err| anyhow!("flushing csv writer: {}", err.error()))
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn string_column(rows: &[ExportRow], field: impl Fn(&ExportRow) -> &String) -> StringArray {
    StringArray::from(rows.iter().map(|r| field(r).as_str()).collect::<Vec<_>>())
}

fn write_statistics_parquet(path: &Path, rows: &[ExportRow]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("country_name", DataType::Utf8, false),
        ArrowField::new("country_code", DataType::Utf8, false),
        ArrowField::new("region", DataType::Utf8, false),
        ArrowField::new("indicator_name", DataType::Utf8, false),
        ArrowField::new("indicator_code", DataType::Utf8, false),
        ArrowField::new("year", DataType::Int32, false),
        ArrowField::new("value", DataType::Float64, true),
    ]));

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(string_column(rows, |r| &r.country_name)),
            Arc::new(string_column(rows, |r| &r.country_code)),
            Arc::new(string_column(rows, |r| &r.region)),
            Arc::new(string_column(rows, |r| &r.indicator_name)),
            Arc::new(string_column(rows, |r| &r.indicator_code)),
            Arc::new(Int32Array::from(rows.iter().map(|r| r.year).collect::<Vec<_>>())),
            Arc::new(Float64Array::from(rows.iter().map(|r| r.value).collect::<Vec<_>>())),
        ],
    )
    .context("building statistics record batch")?;
    write_parquet(path, batch)
}

async fn manifest_entry(path: &Path) -> Result<ExportManifestFile> {
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let digest = Sha256::digest(&bytes);
    Ok(ExportManifestFile {
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        path: path.display().to_string(),
        sha256: hex::encode(digest),
        bytes: bytes.len() as u64,
    })
}

/// Write CSV and Parquet snapshots of every statistic plus a manifest with
/// their checksums into `out_dir`.
pub async fn export_snapshot(store: &EntityStore, out_dir: &Path) -> Result<ExportManifest> {
    let rows = store.export_rows().await.context("loading export rows")?;
    fs::create_dir_all(out_dir)
        .await
        .with_context(|| format!("creating {}", out_dir.display()))?;

    let csv_path = out_dir.join(CSV_FILE_NAME);
    fs::write(&csv_path, render_csv(&rows)?)
        .await
        .with_context(|| format!("writing {}", csv_path.display()))?;

    let parquet_path = out_dir.join(PARQUET_FILE_NAME);
    write_statistics_parquet(&parquet_path, &rows)?;

    let manifest = ExportManifest {
        schema_version: 1,
        generated_at: Utc::now(),
        row_count: rows.len(),
        files: vec![
            manifest_entry(&csv_path).await?,
            manifest_entry(&parquet_path).await?,
        ],
    };
    let manifest_path = out_dir.join(MANIFEST_FILE_NAME);
    fs::write(&manifest_path, serde_json::to_vec_pretty(&manifest)?)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    info!(rows = rows.len(), dir = %out_dir.display(), "export written");
    Ok(manifest)
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

pub const SAMPLE_SIZE: u32 = 5;

/// Row counts and samples of what the store holds.
pub async fn database_report(store: &EntityStore) -> Result<String> {
    let counts = store.counts().await?;
    let mut lines = vec![format!("Number of Countries: {}", counts.countries)];

    lines.push("Sample Countries:".to_string());
    for country in store.sample_countries(SAMPLE_SIZE).await? {
        lines.push(format!("- {}: {} ({})", country.code, country.name, country.region));
    }

    lines.push(String::new());
    lines.push(format!("Number of Indicators: {}", counts.indicators));
    lines.push("All Indicators:".to_string());
    for indicator in store.indicators().await? {
        lines.push(format!("- {}: {}", indicator.code, indicator.name));
    }

    lines.push(String::new());
    lines.push(format!("Number of Statistical Values: {}", counts.values));
    lines.push("Sample Statistics:".to_string());
    for row in store.sample_rows(SAMPLE_SIZE).await? {
        let value = row
            .value
            .map(|v| v.to_string())
            .unwrap_or_else(|| "-".to_string());
        lines.push(format!(
            "- {}, {}, Year: {}, Value: {}",
            row.country_name, row.indicator_name, row.year, value
        ));
    }

    Ok(lines.join("\n"))
}
