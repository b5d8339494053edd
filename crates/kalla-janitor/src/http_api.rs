//! Cron HTTP surface: the two endpoints the platform cron invoker hits.
//!
//! Both routes accept only the cron invoker (identified by a header that the
//! ingress strips from external traffic) or a super-administrator bearer
//! token. Everyone else gets 401 before any reaping logic runs.

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use kalla_reaper::{AggregatorLaunch, ReapOutcome, StaleJobReaper, StuckJobReporter};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::metrics::JanitorMetrics;

pub const REPORT_STUCK_PATH: &str = "/cron/mail/admin/job_status";
pub const REAP_PATH: &str = "/cron/jobs/cleanup";

// ---------------------------------------------------------------------------
// Authorization
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller {
    Cron,
    SuperAdmin,
}

#[derive(Debug, Clone)]
pub struct CronAuth {
    cron_header: String,
    superadmin_token: Option<String>,
}

impl CronAuth {
    pub fn new(cron_header: impl Into<String>, superadmin_token: Option<String>) -> Self {
        Self {
            cron_header: cron_header.into().to_ascii_lowercase(),
            superadmin_token,
        }
    }

    pub fn authorize(&self, headers: &HeaderMap) -> Option<Caller> {
        if headers.contains_key(self.cron_header.as_str()) {
            return Some(Caller::Cron);
        }

        let expected = self.superadmin_token.as_deref()?;
        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))?;
        (presented == expected).then_some(Caller::SuperAdmin)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

async fn require_cron_or_superadmin(
    State(state): State<Arc<CronState>>,
    req: Request,
    next: Next,
) -> Response {
    match state.auth.authorize(req.headers()) {
        Some(caller) => {
            tracing::debug!("Cron request from {:?} to {}", caller, req.uri().path());
            next.run(req).await
        }
        None => {
            warn!("Rejected unauthorized request to {}", req.uri().path());
            error_response(
                StatusCode::UNAUTHORIZED,
                "You do not have the credentials to access this page.",
            )
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub struct CronState {
    pub reporter: StuckJobReporter,
    pub reaper: StaleJobReaper,
    pub auth: CronAuth,
    pub metrics: JanitorMetrics,
    pub stuck_threshold_ms: i64,
    pub max_jobs_to_report: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReportResponse {
    pub total: usize,
    pub listed: usize,
    pub subject: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReapResponse {
    pub max_start_time_ms: i64,
    pub pipelines_seen: usize,
    pub pipelines_cleaned: usize,
    pub jobs_marked: usize,
    pub ambiguous: usize,
    pub errors: Vec<String>,
    pub aggregator: String,
    pub aggregator_job_id: Option<String>,
}

impl From<ReapOutcome> for ReapResponse {
    fn from(outcome: ReapOutcome) -> Self {
        let aggregator_job_id = match &outcome.aggregator {
            AggregatorLaunch::Enqueued { job_id } => Some(job_id.clone()),
            _ => None,
        };
        Self {
            max_start_time_ms: outcome.max_start_time_ms,
            pipelines_seen: outcome.pipelines_seen,
            pipelines_cleaned: outcome.pipelines_cleaned,
            jobs_marked: outcome.jobs_marked,
            ambiguous: outcome.ambiguous,
            aggregator: outcome.aggregator.label().to_string(),
            errors: outcome.errors,
            aggregator_job_id,
        }
    }
}

/// GET /cron/mail/admin/job_status: mail admins about stuck jobs.
async fn report_stuck_jobs(State(state): State<Arc<CronState>>) -> Response {
    match state
        .reporter
        .report(state.stuck_threshold_ms, state.max_jobs_to_report)
        .await
    {
        Ok(report) => {
            state.metrics.stuck_jobs.set(report.total as i64);
            state.metrics.alerts_sent.inc();
            Json(ReportResponse {
                total: report.total,
                listed: report.listed,
                subject: report.subject,
            })
            .into_response()
        }
        Err(e) => {
            state.metrics.alerts_failed.inc();
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// GET /cron/jobs/cleanup: run one reap pass.
async fn reap_stale_jobs(State(state): State<Arc<CronState>>) -> Response {
    let now_ms = chrono::Utc::now().timestamp_millis();
    match state.reaper.reap(now_ms).await {
        Ok(outcome) => {
            state.metrics.record_reap(&outcome);
            Json(ReapResponse::from(outcome)).into_response()
        }
        Err(e) => {
            error!("Reap pass failed: {}", e);
            state.metrics.reap_failures.inc();
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// Build the cron router.
pub fn cron_router(state: Arc<CronState>) -> Router {
    Router::new()
        .route(REPORT_STUCK_PATH, get(report_stuck_jobs))
        .route(REAP_PATH, get(reap_stale_jobs))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_cron_or_superadmin,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
