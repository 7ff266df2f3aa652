//! HTTP surface: the respond links embedded in outbound messages, plus
//! health and metrics.
//!
//! Every protocol outcome renders as a 200 page. Only store failures give a
//! 500, and that page never shows the underlying error.

use crate::claim::ClaimResolver;
use crate::error::DispatchError;
use crate::metrics::METRICS;
use crate::templates::escape_html;
use anyhow::Context;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::str::FromStr;
use tracing::{error, info};
use vetdispatch_ids::CaseId;
use vetdispatch_protocol::{ActionKind, ResponseOutcome};

#[derive(Clone)]
pub struct AppState {
    resolver: ClaimResolver,
}

impl AppState {
    pub fn new(resolver: ClaimResolver) -> Self {
        Self { resolver }
    }
}

/// Query string of a respond link. Both fields are optional so a mangled
/// link still reaches the handler and gets a friendly page.
#[derive(Debug, Deserialize)]
pub struct RespondParams {
    pub token: Option<String>,
    pub action: Option<String>,
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    version: &'static str,
}

/// Page-rendering errors. Outcomes are not errors; this is only the store.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<DispatchError> for HttpError {
    fn from(err: DispatchError) -> Self {
        HttpError::Internal(err.to_string())
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let HttpError::Internal(detail) = &self;
        error!(detail = %detail, "Respond endpoint failed");
        page(
            StatusCode::INTERNAL_SERVER_ERROR,
            "ERROR",
            "Something went wrong",
            "We could not record your response. Please try the link again in a few minutes.",
        )
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/cases/:case_id/respond", get(respond))
        .route("/health", get(health))
        .route("/metrics", get(metrics_json))
        .route("/metrics/prometheus", get(metrics_prometheus))
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve(
    bind_addr: &str,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    info!(addr = %bind_addr, "Respond endpoint listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server failed")?;
    Ok(())
}

async fn respond(
    State(state): State<AppState>,
    Path(case_id): Path<String>,
    Query(params): Query<RespondParams>,
) -> Result<Response, HttpError> {
    let parsed = (
        CaseId::parse(&case_id).ok(),
        params.token.as_deref().map(str::trim).filter(|t| !t.is_empty()),
        params
            .action
            .as_deref()
            .and_then(|a| ActionKind::from_str(a).ok()),
    );

    let outcome = match parsed {
        (Some(case_id), Some(token), Some(action)) => {
            state.resolver.respond(&case_id, token, action).await?
        }
        _ => {
            METRICS.inc_tokens_invalid();
            ResponseOutcome::InvalidLink
        }
    };

    Ok(outcome_page(outcome))
}

async fn health() -> Json<HealthBody> {
    Json(HealthBody {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn metrics_json() -> impl IntoResponse {
    Json(METRICS.snapshot())
}

async fn metrics_prometheus() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        METRICS.prometheus_format(),
    )
}

pub fn outcome_page(outcome: ResponseOutcome) -> Response {
    page(
        StatusCode::OK,
        outcome.code(),
        outcome.headline(),
        outcome.detail(),
    )
}

fn page(status: StatusCode, code: &str, headline: &str, detail: &str) -> Response {
    let body = format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n\
         <meta name=\"dispatch-outcome\" content=\"{code}\">\n<title>{headline}</title>\n</head>\n\
         <body>\n<h1>{headline}</h1>\n<p>{detail}</p>\n</body>\n</html>\n",
        code = escape_html(code),
        headline = escape_html(headline),
        detail = escape_html(detail),
    );
    // Links are single-use; never let a proxy replay the page.
    (status, [(header::CACHE_CONTROL, "no-store")], Html(body)).into_response()
}
