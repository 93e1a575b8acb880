//! Axum JSON API over the entity store: listings, comparison and CSV export.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use devstats_core::{ComparisonPoint, Country, ExportRow, Indicator};
use devstats_storage::EntityStore;
use devstats_sync::{compare, render_csv, CompareError, CompareRequest, SyncConfig, CSV_FILE_NAME};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "devstats-web";

pub const DEFAULT_PORT: u16 = 8000;

#[derive(Clone)]
pub struct AppState {
    pub store: EntityStore,
}

impl AppState {
    pub fn new(store: EntityStore) -> Self {
        Self { store }
    }
}

#[derive(Debug, Serialize)]
struct IndexPayload {
    countries: Vec<Country>,
    indicators: Vec<Indicator>,
}

/// Comparison as served to chart clients.
#[derive(Debug, Serialize)]
pub struct ComparisonPayload {
    pub title: String,
    pub indicator_a: Indicator,
    pub indicator_b: Indicator,
    pub points: Vec<ComparisonPoint>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/countries", get(countries_handler))
        .route("/api/indicators", get(indicators_handler))
        .route("/api/data", get(data_handler))
        .route("/compare", post(compare_handler))
        .route("/export", get(export_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("DEVSTATS_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_PORT);
    let config = SyncConfig::from_env();
    let store = EntityStore::open(&config.database_url).await?;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, database = %config.database_url, "serving");
    axum::serve(listener, app(AppState::new(store))).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let countries = match state.store.countries().await {
        Ok(countries) => countries,
        Err(err) => return server_error(err.into()),
    };
    match state.store.indicators().await {
        Ok(indicators) => Json(IndexPayload {
            countries,
            indicators,
        })
        .into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn countries_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.countries().await {
        Ok(countries) => Json(countries).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn indicators_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.indicators().await {
        Ok(indicators) => Json(indicators).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn data_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.export_rows().await {
        Ok(rows) => Json::<Vec<ExportRow>>(rows).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn compare_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CompareRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            warn!(error = %rejection.body_text(), "unreadable compare request");
            return unprocessable(&CompareError::MissingSelection);
        }
    };
    match compare(&state.store, &request).await {
        Ok(comparison) => Json(ComparisonPayload {
            title: comparison.title(),
            indicator_a: comparison.indicator_a,
            indicator_b: comparison.indicator_b,
            points: comparison.points,
        })
        .into_response(),
        Err(err) if err.is_user_error() => unprocessable(&err),
        Err(err) => server_error(err.into()),
    }
}

fn unprocessable(err: &CompareError) -> Response {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}

async fn export_handler(State(state): State<Arc<AppState>>) -> Response {
    let rows = match state.store.export_rows().await {
        Ok(rows) => rows,
        Err(err) => return server_error(err.into()),
    };
    match render_csv(&rows) {
        Ok(body) => (
            [
                (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{CSV_FILE_NAME}\""),
                ),
            ],
            body,
        )
            .into_response(),
        Err(err) => server_error(err),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %format!("{err:#}"), "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": format!("Server error: {err}") })),
    )
        .into_response()
}
