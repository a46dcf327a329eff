//! Axum JSON API for production summaries and calculation settings.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{Datelike, Utc};
use crs_core::{ProductionSummaryRecord, Scope};
use crs_storage::{StoreError, SummaryStore};
use crs_sync::{EngineContext, ProductionSumEngine, SettingsResolver, SyncError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub mod auth;

pub use auth::{AuthError, Authenticator, Principal, StaticTokenAuthenticator};

pub const CRATE_NAME: &str = "crs-web";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ProductionSumEngine>,
    pub summaries: Arc<dyn SummaryStore>,
    pub settings: SettingsResolver,
    pub auth: Arc<dyn Authenticator>,
    /// Year treated as "now" by the group ranking; the UTC clock when unset.
    pub current_year: Option<i32>,
}

impl AppState {
    pub fn new(
        engine: Arc<ProductionSumEngine>,
        summaries: Arc<dyn SummaryStore>,
        settings: SettingsResolver,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            engine,
            summaries,
            settings,
            auth,
            current_year: None,
        }
    }

    pub fn with_current_year(mut self, year: i32) -> Self {
        self.current_year = Some(year);
        self
    }

    fn current_year(&self) -> i32 {
        self.current_year.unwrap_or_else(|| Utc::now().year())
    }

    pub fn from_context(context: &EngineContext, auth: Arc<dyn Authenticator>) -> Self {
        Self::new(
            Arc::clone(&context.engine),
            Arc::clone(&context.summaries),
            context.settings.clone(),
            auth,
        )
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Unauthorized(#[from] AuthError),
    #[error("{0} parameter is required")]
    MissingParameter(&'static str),
    #[error("invalid {0} parameter")]
    InvalidParameter(&'static str),
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Settings(inner) => ApiError::InvalidSettings(inner.to_string()),
            SyncError::SettingsPatchNotObject => {
                ApiError::InvalidSettings("settings patch must be a JSON object".to_string())
            }
            other => ApiError::Internal(other.into()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Internal(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::Unauthorized(err) => {
                warn!(error = %err, "request rejected");
                (StatusCode::UNAUTHORIZED, json!({ "error": err.to_string() }))
            }
            ApiError::MissingParameter(_) | ApiError::InvalidParameter(_) => {
                (StatusCode::BAD_REQUEST, json!({ "error": self.to_string() }))
            }
            ApiError::InvalidSettings(message) => (
                StatusCode::BAD_REQUEST,
                json!({ "success": false, "error": "invalid settings", "message": message }),
            ),
            ApiError::Internal(err) => {
                error!(error = ?err, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "Internal Server Error" }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupQuery {
    group_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct YearQuery {
    year: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreatedRow {
    year: String,
    group_id: String,
    material_type: Option<String>,
    material_amount: f64,
    charcoal_produced: f64,
    charcoal_volume: f64,
    co2_reduction: f64,
    carbon_content: f64,
    ipcc_long_term: f64,
}

impl From<&ProductionSummaryRecord> for CreatedRow {
    fn from(row: &ProductionSummaryRecord) -> Self {
        Self {
            year: row.year.clone(),
            group_id: row.group_id.clone(),
            material_type: row.material_type.clone(),
            material_amount: row.material_amount,
            charcoal_produced: row.charcoal_produced,
            charcoal_volume: row.charcoal_volume,
            co2_reduction: row.co2_reduction,
            carbon_content: row.carbon_content,
            ipcc_long_term: row.ipcc_long_term,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreatedResponse {
    message: &'static str,
    group_id: String,
    total_records: usize,
    data: Vec<CreatedRow>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StoredRow {
    id: String,
    #[serde(flatten)]
    values: CreatedRow,
    created_at: String,
    updated_at: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StoredResponse {
    group_id: String,
    total_records: usize,
    data: Vec<StoredRow>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRanking {
    pub group_id: String,
    pub yearly_charcoal: f64,
    pub yearly_charcoal_volume: f64,
    #[serde(rename = "yearlyCO2Reduction")]
    pub yearly_co2_reduction: f64,
    #[serde(rename = "yearlyCO2ReductionShortTerm")]
    pub yearly_co2_reduction_short_term: f64,
    #[serde(rename = "yearlyCO2ReductionLongTerm")]
    pub yearly_co2_reduction_long_term: f64,
}

/// All-time standing of a group. Summary rows are yearly, so the current
/// year's totals stand in for "this month".
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupStanding {
    pub group_id: String,
    pub this_month_charcoal: f64,
    #[serde(rename = "thisMonthCO2Reduction")]
    pub this_month_co2_reduction: f64,
    #[serde(rename = "thisYearCO2Reduction")]
    pub this_year_co2_reduction: f64,
    #[serde(rename = "totalCO2ReductionShortTerm")]
    pub total_co2_reduction_short_term: f64,
    #[serde(rename = "totalCO2ReductionLongTerm")]
    pub total_co2_reduction_long_term: f64,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/production-sum",
            get(list_production_sum_handler).post(create_production_sum_handler),
        )
        .route(
            "/yearly-group-ranking-from-sum",
            get(yearly_group_ranking_handler),
        )
        .route("/group-ranking-from-sum", get(group_ranking_handler))
        .route(
            "/calc-settings",
            get(get_calc_settings_handler).post(save_calc_settings_handler),
        )
        .with_state(Arc::new(state))
}

pub fn port_from_env() -> u16 {
    std::env::var("CRS_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Json<JsonValue> {
    Json(json!({ "status": "ok" }))
}

fn required_group(query: GroupQuery) -> Result<String, ApiError> {
    query
        .group_id
        .map(|g| g.trim().to_string())
        .filter(|g| !g.is_empty())
        .ok_or(ApiError::MissingParameter("groupId"))
}

async fn create_production_sum_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<GroupQuery>,
) -> Result<Json<CreatedResponse>, ApiError> {
    let principal = state.auth.authenticate(&headers)?;
    let group_id = required_group(query)?;
    info!(subject = %principal.subject, group_id = %group_id, "production sum requested");

    let summary = state.engine.run(Scope::Group(group_id.clone())).await?;
    let data = summary.rows.iter().map(CreatedRow::from).collect::<Vec<_>>();
    Ok(Json(CreatedResponse {
        message: "Production sum data created successfully",
        group_id,
        total_records: data.len(),
        data,
    }))
}

/// Summary rows for a table that has never been written are an empty set.
async fn list_summaries_or_empty(
    store: &dyn SummaryStore,
    group_id: Option<&str>,
) -> Result<Vec<ProductionSummaryRecord>, StoreError> {
    match store.list_summaries(group_id).await {
        Err(StoreError::NotFound(_)) => Ok(Vec::new()),
        other => other,
    }
}

fn year_number(year: &str) -> Option<i32> {
    year.trim().parse().ok()
}

async fn list_production_sum_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<GroupQuery>,
) -> Result<Json<StoredResponse>, ApiError> {
    state.auth.authenticate(&headers)?;
    let group_id = required_group(query)?;

    let mut rows = list_summaries_or_empty(state.summaries.as_ref(), Some(group_id.as_str())).await?;
    rows.sort_by(|a, b| {
        year_number(&b.year)
            .unwrap_or_default()
            .cmp(&year_number(&a.year).unwrap_or_default())
            .then_with(|| a.row_key.cmp(&b.row_key))
    });

    let data = rows
        .iter()
        .map(|row| StoredRow {
            id: row.row_key.clone(),
            values: CreatedRow::from(row),
            created_at: row.created_at.to_rfc3339(),
            updated_at: row.updated_at.to_rfc3339(),
        })
        .collect::<Vec<_>>();
    Ok(Json(StoredResponse {
        group_id,
        total_records: data.len(),
        data,
    }))
}

/// Per-group totals of the summary rows for `year`, highest CO2 reduction first.
pub fn rank_groups(rows: &[ProductionSummaryRecord], year: i32) -> Vec<GroupRanking> {
    let mut by_group: BTreeMap<&str, GroupRanking> = BTreeMap::new();
    for row in rows.iter().filter(|r| year_number(&r.year) == Some(year)) {
        let entry = by_group
            .entry(row.group_id.as_str())
            .or_insert_with(|| GroupRanking {
                group_id: row.group_id.clone(),
                ..Default::default()
            });
        entry.yearly_charcoal += row.charcoal_produced;
        entry.yearly_charcoal_volume += row.charcoal_volume;
        entry.yearly_co2_reduction += row.co2_reduction;
        entry.yearly_co2_reduction_short_term += row.co2_reduction;
        entry.yearly_co2_reduction_long_term += row.ipcc_long_term;
    }

    let mut ranking = by_group.into_values().collect::<Vec<_>>();
    ranking.sort_by(|a, b| b.yearly_co2_reduction.total_cmp(&a.yearly_co2_reduction));
    ranking
}

async fn yearly_group_ranking_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<YearQuery>,
) -> Result<Json<JsonValue>, ApiError> {
    state.auth.authenticate(&headers)?;
    let raw = query
        .year
        .filter(|y| !y.trim().is_empty())
        .ok_or(ApiError::MissingParameter("year"))?;
    let year = year_number(&raw).ok_or(ApiError::InvalidParameter("year"))?;

    let rows = list_summaries_or_empty(state.summaries.as_ref(), None).await?;
    Ok(Json(json!({ "year": year, "data": rank_groups(&rows, year) })))
}

/// Per-group totals over every summary row, highest short-term CO2 reduction
/// first.
pub fn standings(rows: &[ProductionSummaryRecord], current_year: i32) -> Vec<GroupStanding> {
    let mut by_group: BTreeMap<&str, GroupStanding> = BTreeMap::new();
    for row in rows {
        let entry = by_group
            .entry(row.group_id.as_str())
            .or_insert_with(|| GroupStanding {
                group_id: row.group_id.clone(),
                ..Default::default()
            });
        entry.total_co2_reduction_short_term += row.co2_reduction;
        entry.total_co2_reduction_long_term += row.ipcc_long_term;
        if year_number(&row.year) == Some(current_year) {
            entry.this_year_co2_reduction += row.co2_reduction;
            entry.this_month_charcoal += row.charcoal_produced;
            entry.this_month_co2_reduction += row.co2_reduction;
        }
    }

    let mut ranking = by_group.into_values().collect::<Vec<_>>();
    ranking.sort_by(|a, b| {
        b.total_co2_reduction_short_term
            .total_cmp(&a.total_co2_reduction_short_term)
    });
    ranking
}

async fn group_ranking_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<GroupStanding>>, ApiError> {
    state.auth.authenticate(&headers)?;
    let rows = list_summaries_or_empty(state.summaries.as_ref(), None).await?;
    Ok(Json(standings(&rows, state.current_year())))
}

async fn get_calc_settings_handler(State(state): State<Arc<AppState>>) -> Json<JsonValue> {
    let doc = state.settings.load_document().await;
    Json(json!({
        "success": true,
        "settings": doc.settings,
        "isDefault": doc.is_default,
        "lastUpdated": doc.last_updated,
    }))
}

async fn save_calc_settings_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<JsonValue>, ApiError> {
    let principal = state.auth.authenticate(&headers)?;
    let patch: JsonValue = serde_json::from_slice(&body)
        .map_err(|err| ApiError::InvalidSettings(format!("body is not valid JSON: {err}")))?;

    let doc = state.settings.save(patch).await?;
    info!(subject = %principal.subject, "calc settings updated");
    Ok(Json(json!({
        "success": true,
        "settings": doc.settings,
        "lastUpdated": doc.last_updated,
    })))
}
