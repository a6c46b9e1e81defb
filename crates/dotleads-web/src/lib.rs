//! HTTP trigger for DOT leads runs.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use dotleads_core::{format_date, parse_target_date};
use dotleads_sync::RunTrigger;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "dotleads-web";
pub const DEFAULT_PORT: u16 = 8000;

#[derive(Clone)]
pub struct AppState {
    pub trigger: Arc<dyn RunTrigger>,
}

impl AppState {
    pub fn new(trigger: Arc<dyn RunTrigger>) -> Self {
        Self { trigger }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RunRequest {
    #[serde(default)]
    date: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/run", post(run_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(trigger: Arc<dyn RunTrigger>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "http trigger listening");
    axum::serve(listener, app(AppState::new(trigger))).await?;
    Ok(())
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn run_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let target_date = match parse_run_request(&body) {
        Ok(date) => date,
        Err(reason) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "status": "error",
                    "error": reason,
                    "message": "Invalid request",
                })),
            )
                .into_response();
        }
    };

    match state.trigger.trigger(target_date).await {
        Ok(summary) => (
            StatusCode::OK,
            Json(json!({
                "status": "success",
                "message": "DOT Leads Automation completed successfully",
                "date": format_date(summary.target_date),
                "summary": summary,
            })),
        )
            .into_response(),
        Err(err) => {
            let message = format!("{err:#}");
            error!(error = %message, "triggered run failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "status": "error",
                    "error": message,
                    "message": "DOT Leads Automation failed",
                })),
            )
                .into_response()
        }
    }
}

/// Empty body or missing `date` means "yesterday".
fn parse_run_request(body: &[u8]) -> Result<Option<NaiveDate>, String> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let request: RunRequest =
        serde_json::from_slice(body).map_err(|err| format!("invalid JSON body: {err}"))?;
    match request.date.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
        None => Ok(None),
        Some(raw) => parse_target_date(raw)
            .map(Some)
            .map_err(|_| format!("invalid date '{raw}', expected YYYY-MM-DD")),
    }
}
