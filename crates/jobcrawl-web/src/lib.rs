//! Read-only JSON API over stored job records.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use jobcrawl_core::{JobFilter, JobPage, JobRecord, PageRequest, Pagination};
use jobcrawl_storage::{JobStore, StoreError};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
}

impl AppState {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }
}

/// Raw query strings; every value is parsed leniently by the handlers.
#[derive(Debug, Default)]
struct JobsQuery {
    page: Option<String>,
    limit: Option<String>,
    company: Option<String>,
    location: Option<String>,
    from_date: Option<String>,
}

impl JobsQuery {
    /// First value wins for a repeated key; unknown keys are ignored.
    fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        let mut query = Self::default();
        for (key, value) in pairs {
            let slot = match key.as_str() {
                "page" => &mut query.page,
                "limit" => &mut query.limit,
                "company" => &mut query.company,
                "location" => &mut query.location,
                "fromDate" => &mut query.from_date,
                _ => continue,
            };
            slot.get_or_insert(value);
        }
        query
    }

    fn page_request(&self) -> PageRequest {
        PageRequest::new(lenient_int(self.page.as_deref()), lenient_int(self.limit.as_deref()))
    }

    fn filter(&self) -> JobFilter {
        JobFilter::new(
            self.company.as_deref().map(str::trim).map(String::from),
            self.location.as_deref().map(str::trim).map(String::from),
            self.from_date.as_deref().and_then(parse_from_date),
        )
    }
}

fn lenient_int(value: Option<&str>) -> Option<i64> {
    value.and_then(|v| v.trim().parse().ok())
}

/// RFC 3339 timestamp or a bare `YYYY-MM-DD` (midnight UTC). Anything else
/// is treated as no bound.
fn parse_from_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

#[derive(Debug, Serialize)]
struct JobsResponse {
    status: &'static str,
    data: Vec<JobRecord>,
    pagination: Pagination,
}

impl From<JobPage> for JobsResponse {
    fn from(page: JobPage) -> Self {
        Self {
            status: "success",
            data: page.jobs,
            pagination: page.pagination,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    status: &'static str,
    message: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/jobs", get(list_jobs_handler))
        .route("/api/jobs/filter", get(filter_jobs_handler))
        .with_state(state)
}

pub async fn serve(store: Arc<dyn JobStore>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "job API listening");
    axum::serve(listener, app(AppState::new(store))).await?;
    Ok(())
}

async fn list_jobs_handler(State(state): State<AppState>, Query(pairs): Query<Vec<(String, String)>>) -> Response {
    let query = JobsQuery::from_pairs(pairs);
    match state.store.list(query.page_request()).await {
        Ok(page) => Json(JobsResponse::from(page)).into_response(),
        Err(err) => server_error(err),
    }
}

async fn filter_jobs_handler(State(state): State<AppState>, Query(pairs): Query<Vec<(String, String)>>) -> Response {
    let query = JobsQuery::from_pairs(pairs);
    match state.store.list_filtered(&query.filter(), query.page_request()).await {
        Ok(page) => Json(JobsResponse::from(page)).into_response(),
        Err(err) => server_error(err),
    }
}

fn server_error(err: StoreError) -> Response {
    error!(error = %err, "job query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            status: "error",
            message: err.to_string(),
        }),
    )
        .into_response()
}
