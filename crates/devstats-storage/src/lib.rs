//! Relational entity store (SQLite via sqlx) + HTTP fetch utilities for devstats.

use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use devstats_core::{Country, ExportRow, Indicator, NormalizedRow, SeriesPoint, StatisticValue};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{QueryBuilder, Row, Sqlite, Transaction};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "devstats-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    /// Errors that leave the connection or transaction unusable. A batch that
    /// hits one of these must be abandoned rather than skipped past.
    pub fn is_fatal(&self) -> bool {
        match self {
            StoreError::Database(err) => matches!(
                err,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::Protocol(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            StoreError::Migrate(_) => true,
        }
    }
}

/// Result of writing one statistic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

impl UpsertOutcome {
    pub fn is_change(self) -> bool {
        !matches!(self, UpsertOutcome::Unchanged)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub countries: i64,
    pub indicators: i64,
    pub values: i64,
}

#[derive(Debug, Clone)]
pub struct EntityStore {
    pool: SqlitePool,
}

impl EntityStore {
    /// Connect to `database_url` and apply pending migrations.
    pub async fn open(database_url: &str) -> Result<Self, StoreError> {
        let store = Self::connect(database_url).await?;
        store.migrate().await?;
        Ok(store)
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        info!(database_url, "entity store connected");
        Ok(Self { pool })
    }

    /// Single-connection in-memory store; the database lives as long as the pool.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Open a write batch. Nothing it writes is visible until `commit`;
    /// dropping it rolls everything back.
    pub async fn begin(&self) -> Result<WriteBatch, StoreError> {
        Ok(WriteBatch {
            tx: self.pool.begin().await?,
        })
    }

    pub async fn upsert_indicator(&self, indicator: &Indicator) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO indicators (code, name, description)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (code) DO UPDATE
               SET name = excluded.name,
                   description = excluded.description
            "#,
        )
        .bind(&indicator.code)
        .bind(&indicator.name)
        .bind(&indicator.description)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn country_codes(&self) -> Result<HashSet<String>, StoreError> {
        let codes: Vec<String> = sqlx::query_scalar("SELECT code FROM countries")
            .fetch_all(&self.pool)
            .await?;
        Ok(codes.into_iter().collect())
    }

    pub async fn countries(&self) -> Result<Vec<Country>, StoreError> {
        let rows = sqlx::query("SELECT code, name, region FROM countries ORDER BY name, code")
            .fetch_all(&self.pool)
            .await?;
        let countries = rows.iter().map(country_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(countries)
    }

    pub async fn sample_countries(&self, limit: u32) -> Result<Vec<Country>, StoreError> {
        let rows = sqlx::query("SELECT code, name, region FROM countries ORDER BY code LIMIT ?1")
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        let countries = rows.iter().map(country_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(countries)
    }

    pub async fn indicators(&self) -> Result<Vec<Indicator>, StoreError> {
        let rows = sqlx::query("SELECT code, name, description FROM indicators ORDER BY name, code")
            .fetch_all(&self.pool)
            .await?;
        let indicators = rows.iter().map(indicator_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(indicators)
    }

    pub async fn indicator(&self, code: &str) -> Result<Option<Indicator>, StoreError> {
        let row = sqlx::query("SELECT code, name, description FROM indicators WHERE code = ?1")
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(indicator_from_row).transpose()?)
    }

    pub async fn statistic_value(
        &self,
        country_code: &str,
        indicator_code: &str,
        year: i32,
    ) -> Result<Option<StatisticValue>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT country_code, indicator_code, year, value
              FROM statistic_values
             WHERE country_code = ?1
               AND indicator_code = ?2
               AND year = ?3
            "#,
        )
        .bind(country_code)
        .bind(indicator_code)
        .bind(year)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        Ok(Some(StatisticValue {
            country_code: row.try_get("country_code")?,
            indicator_code: row.try_get("indicator_code")?,
            year: row.try_get("year")?,
            value: row.try_get("value")?,
        }))
    }

    /// Non-null values of one indicator restricted to `country_codes`, in
    /// insertion order.
    pub async fn series(
        &self,
        indicator_code: &str,
        country_codes: &[String],
    ) -> Result<Vec<SeriesPoint>, StoreError> {
        if country_codes.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb = QueryBuilder::<Sqlite>::new(
            r#"
            SELECT s.country_code, c.name AS country_name, s.year, s.value
              FROM statistic_values s
              JOIN countries c ON c.code = s.country_code
             WHERE s.value IS NOT NULL
               AND s.indicator_code = "#,
        );
        qb.push_bind(indicator_code.to_string());
        qb.push(" AND s.country_code IN (");
        let mut codes = qb.separated(", ");
        for code in country_codes {
            codes.push_bind(code.clone());
        }
        codes.push_unseparated(") ORDER BY s.id");

        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(SeriesPoint {
                country_code: row.try_get("country_code")?,
                country_name: row.try_get("country_name")?,
                year: row.try_get("year")?,
                value: row.try_get("value")?,
            });
        }
        Ok(out)
    }

    pub async fn counts(&self) -> Result<StoreCounts, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT (SELECT COUNT(*) FROM countries)        AS countries,
                   (SELECT COUNT(*) FROM indicators)       AS indicators,
                   (SELECT COUNT(*) FROM statistic_values) AS statistic_values
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(StoreCounts {
            countries: row.try_get("countries")?,
            indicators: row.try_get("indicators")?,
            values: row.try_get("statistic_values")?,
        })
    }

    /// Every statistic joined with its country and indicator.
    pub async fn export_rows(&self) -> Result<Vec<ExportRow>, StoreError> {
        self.flat_rows(None).await
    }

    pub async fn sample_rows(&self, limit: u32) -> Result<Vec<ExportRow>, StoreError> {
        self.flat_rows(Some(limit)).await
    }

    async fn flat_rows(&self, limit: Option<u32>) -> Result<Vec<ExportRow>, StoreError> {
        // LIMIT -1 means unbounded in SQLite.
        let limit = limit.map(i64::from).unwrap_or(-1);
        let rows = sqlx::query(
            r#"
            SELECT c.name AS country_name,
                   c.code AS country_code,
                   c.region,
                   i.name AS indicator_name,
                   i.code AS indicator_code,
                   s.year,
                   s.value
              FROM statistic_values s
              JOIN countries c ON c.code = s.country_code
              JOIN indicators i ON i.code = s.indicator_code
             ORDER BY c.name, i.name, s.year
             LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(ExportRow {
                country_name: row.try_get("country_name")?,
                country_code: row.try_get("country_code")?,
                region: row.try_get("region")?,
                indicator_name: row.try_get("indicator_name")?,
                indicator_code: row.try_get("indicator_code")?,
                year: row.try_get("year")?,
                value: row.try_get("value")?,
            });
        }
        Ok(out)
    }

    /// Delete a country; its statistics go with it.
    pub async fn delete_country(&self, code: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM countries WHERE code = ?1")
            .bind(code)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Delete an indicator; its statistics go with it.
    pub async fn delete_indicator(&self, code: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM indicators WHERE code = ?1")
            .bind(code)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// All-or-nothing group of writes backed by one transaction.
#[derive(Debug)]
pub struct WriteBatch {
    tx: Transaction<'static, Sqlite>,
}

impl WriteBatch {
    pub async fn upsert_country(&mut self, country: &Country) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO countries (code, name, region)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (code) DO UPDATE
               SET name = excluded.name,
                   region = excluded.region
            "#,
        )
        .bind(&country.code)
        .bind(&country.name)
        .bind(&country.region)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    /// Create the (country, indicator, year) row if absent, otherwise update
    /// it only when the stored value differs.
    pub async fn upsert_value(
        &mut self,
        indicator_code: &str,
        row: &NormalizedRow,
    ) -> Result<UpsertOutcome, StoreError> {
        let existing: Option<Option<f64>> = sqlx::query_scalar(
            r#"
            SELECT value
              FROM statistic_values
             WHERE country_code = ?1
               AND indicator_code = ?2
               AND year = ?3
            "#,
        )
        .bind(&row.country_code)
        .bind(indicator_code)
        .bind(row.year)
        .fetch_optional(&mut *self.tx)
        .await?;

        match existing {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO statistic_values (country_code, indicator_code, year, value)
                    VALUES (?1, ?2, ?3, ?4)
                    "#,
                )
                .bind(&row.country_code)
                .bind(indicator_code)
                .bind(row.year)
                .bind(row.value)
                .execute(&mut *self.tx)
                .await?;
                Ok(UpsertOutcome::Created)
            }
            Some(previous) if previous == Some(row.value) => Ok(UpsertOutcome::Unchanged),
            Some(_) => {
                sqlx::query(
                    r#"
                    UPDATE statistic_values
                       SET value = ?4
                     WHERE country_code = ?1
                       AND indicator_code = ?2
                       AND year = ?3
                    "#,
                )
                .bind(&row.country_code)
                .bind(indicator_code)
                .bind(row.year)
                .bind(row.value)
                .execute(&mut *self.tx)
                .await?;
                Ok(UpsertOutcome::Updated)
            }
        }
    }

    pub async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

fn country_from_row(row: &SqliteRow) -> Result<Country, sqlx::Error> {
    Ok(Country {
        code: row.try_get("code")?,
        name: row.try_get("name")?,
        region: row.try_get("region")?,
    })
}

fn indicator_from_row(row: &SqliteRow) -> Result<Indicator, sqlx::Error> {
    Ok(Indicator {
        code: row.try_get("code")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
    })
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed json from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    /// Single GET; any non-success status is an error. No retries.
    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        debug!(url, "http fetch");
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            final_url,
            body,
        })
    }

    pub async fn fetch_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let resp = self.fetch_bytes(url).await?;
        serde_json::from_slice(&resp.body).map_err(|source| FetchError::Decode {
            url: resp.final_url,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn store() -> EntityStore {
        EntityStore::open_in_memory().await.expect("in-memory store")
    }

    fn country(code: &str, name: &str) -> Country {
        Country {
            code: code.to_string(),
            name: name.to_string(),
            region: "Test Region".to_string(),
        }
    }

    fn indicator(code: &str, name: &str) -> Indicator {
        Indicator {
            code: code.to_string(),
            name: name.to_string(),
            description: String::new(),
        }
    }

    fn row(country_code: &str, year: i32, value: f64) -> NormalizedRow {
        NormalizedRow {
            country_code: country_code.to_string(),
            year,
            value,
        }
    }

    async fn seeded() -> EntityStore {
        let s = store().await;
        let mut batch = s.begin().await.unwrap();
        batch.upsert_country(&country("USA", "United States")).await.unwrap();
        batch.upsert_country(&country("FRA", "France")).await.unwrap();
        batch.commit().await.unwrap();
        s.upsert_indicator(&indicator("SP.POP.TOTL", "Population, total"))
            .await
            .unwrap();
        s
    }

    #[tokio::test]
    async fn country_upsert_updates_by_code() {
        let s = seeded().await;
        let mut batch = s.begin().await.unwrap();
        batch
            .upsert_country(&Country {
                code: "USA".into(),
                name: "United States of America".into(),
                region: "North America".into(),
            })
            .await
            .unwrap();
        batch.commit().await.unwrap();

        let countries = s.countries().await.unwrap();
        assert_eq!(countries.len(), 2);
        let usa = countries.iter().find(|c| c.code == "USA").unwrap();
        assert_eq!(usa.name, "United States of America");
        assert_eq!(usa.region, "North America");
    }

    #[tokio::test]
    async fn value_upsert_creates_updates_and_skips_equal() {
        let s = seeded().await;
        let mut batch = s.begin().await.unwrap();
        let first = batch.upsert_value("SP.POP.TOTL", &row("USA", 2020, 1.5)).await.unwrap();
        let same = batch.upsert_value("SP.POP.TOTL", &row("USA", 2020, 1.5)).await.unwrap();
        let changed = batch.upsert_value("SP.POP.TOTL", &row("USA", 2020, 2.5)).await.unwrap();
        batch.commit().await.unwrap();

        assert_eq!(first, UpsertOutcome::Created);
        assert_eq!(same, UpsertOutcome::Unchanged);
        assert_eq!(changed, UpsertOutcome::Updated);

        let stored = s.statistic_value("USA", "SP.POP.TOTL", 2020).await.unwrap().unwrap();
        assert_eq!(stored.value, Some(2.5));
        assert_eq!(s.counts().await.unwrap().values, 1);
    }

    #[tokio::test]
    async fn dropped_batch_rolls_back() {
        let s = seeded().await;
        {
            let mut batch = s.begin().await.unwrap();
            batch.upsert_value("SP.POP.TOTL", &row("USA", 2020, 1.0)).await.unwrap();
            batch.upsert_value("SP.POP.TOTL", &row("FRA", 2020, 2.0)).await.unwrap();
        }
        assert_eq!(s.counts().await.unwrap().values, 0);
    }

    #[tokio::test]
    async fn explicit_rollback_discards_batch() {
        let s = seeded().await;
        let mut batch = s.begin().await.unwrap();
        batch.upsert_value("SP.POP.TOTL", &row("USA", 2020, 1.0)).await.unwrap();
        batch.rollback().await.unwrap();
        assert_eq!(s.counts().await.unwrap().values, 0);
        assert!(s.statistic_value("USA", "SP.POP.TOTL", 2020).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_country_write_is_a_non_fatal_error() {
        let s = seeded().await;
        let mut batch = s.begin().await.unwrap();
        let err = batch
            .upsert_value("SP.POP.TOTL", &row("ZZZ", 2020, 1.0))
            .await
            .unwrap_err();
        assert!(!err.is_fatal());
        batch.upsert_value("SP.POP.TOTL", &row("USA", 2020, 1.0)).await.unwrap();
        batch.commit().await.unwrap();
        assert_eq!(s.counts().await.unwrap().values, 1);
    }

    #[tokio::test]
    async fn deleting_country_or_indicator_cascades() {
        let s = seeded().await;
        s.upsert_indicator(&indicator("SP.DYN.LE00.IN", "Life expectancy at birth (years)"))
            .await
            .unwrap();
        let mut batch = s.begin().await.unwrap();
        batch.upsert_value("SP.POP.TOTL", &row("USA", 2020, 1.0)).await.unwrap();
        batch.upsert_value("SP.POP.TOTL", &row("FRA", 2020, 2.0)).await.unwrap();
        batch.upsert_value("SP.DYN.LE00.IN", &row("FRA", 2020, 82.0)).await.unwrap();
        batch.commit().await.unwrap();

        assert_eq!(s.delete_country("USA").await.unwrap(), 1);
        assert_eq!(s.counts().await.unwrap().values, 2);

        assert_eq!(s.delete_indicator("SP.POP.TOTL").await.unwrap(), 1);
        let counts = s.counts().await.unwrap();
        assert_eq!(counts.values, 1);
        assert_eq!(counts.countries, 1);
        assert_eq!(counts.indicators, 1);
    }

    #[tokio::test]
    async fn series_filters_by_country_and_skips_nulls() {
        let s = seeded().await;
        let mut batch = s.begin().await.unwrap();
        batch.upsert_value("SP.POP.TOTL", &row("USA", 2019, 1.0)).await.unwrap();
        batch.upsert_value("SP.POP.TOTL", &row("FRA", 2019, 2.0)).await.unwrap();
        batch.upsert_value("SP.POP.TOTL", &row("USA", 2020, 3.0)).await.unwrap();
        batch.commit().await.unwrap();
        sqlx::query("UPDATE statistic_values SET value = NULL WHERE year = 2020")
            .execute(&s.pool)
            .await
            .unwrap();

        let usa = s.series("SP.POP.TOTL", &["USA".to_string()]).await.unwrap();
        assert_eq!(usa.len(), 1);
        assert_eq!(usa[0].country_name, "United States");
        assert_eq!(usa[0].year, 2019);

        let both = s
            .series("SP.POP.TOTL", &["USA".to_string(), "FRA".to_string()])
            .await
            .unwrap();
        let codes: Vec<_> = both.iter().map(|p| p.country_code.as_str()).collect();
        assert_eq!(codes, vec!["USA", "FRA"]);

        assert!(s.series("SP.POP.TOTL", &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn export_rows_join_metadata() {
        let s = seeded().await;
        let mut batch = s.begin().await.unwrap();
        batch.upsert_value("SP.POP.TOTL", &row("FRA", 2021, 67.0)).await.unwrap();
        batch.upsert_value("SP.POP.TOTL", &row("USA", 2021, 331.0)).await.unwrap();
        batch.commit().await.unwrap();

        let rows = s.export_rows().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].country_name, "France");
        assert_eq!(rows[0].indicator_name, "Population, total");
        assert_eq!(rows[0].region, "Test Region");
        assert_eq!(rows[0].value, Some(67.0));

        assert_eq!(s.sample_rows(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn file_store_persists_across_reopen() {
        let dir = tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("devstats.db").display());

        let first = EntityStore::open(&url).await.unwrap();
        first
            .upsert_indicator(&indicator("SP.POP.TOTL", "Population, total"))
            .await
            .unwrap();
        drop(first);

        let second = EntityStore::open(&url).await.unwrap();
        let found = second.indicator("SP.POP.TOTL").await.unwrap();
        assert_eq!(found.map(|i| i.name), Some("Population, total".to_string()));
    }
}
