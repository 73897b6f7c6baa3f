use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use clickfit_storage::Database;

use crate::ingest::{Clock, Ingestor};
use crate::{reprocess, telemetry, webhook, workouts};

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    webhook_secret: Option<Arc<[u8]>>,
    clock: Clock,
    ingestor: Ingestor,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        storage: Database,
        webhook_secret: Option<Arc<[u8]>>,
        ingestor: Ingestor,
    ) -> Self {
        Self {
            metrics,
            storage,
            webhook_secret,
            clock: Arc::new(Utc::now),
            ingestor,
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock.clone();
        self.ingestor = self.ingestor.with_clock(clock);
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn webhook_secret(&self) -> Option<&[u8]> {
        self.webhook_secret.as_deref()
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn ingestor(&self) -> &Ingestor {
        &self.ingestor
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/api/webhook", get(webhook::liveness).post(webhook::handle))
        .route(
            "/api/reprocess",
            get(reprocess::liveness).post(reprocess::handle),
        )
        .route("/api/workouts", get(workouts::recent))
        .route("/api/workouts/totals", get(workouts::totals))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> Response {
    let body = telemetry::render_metrics(state.metrics());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        Body::from(body),
    )
        .into_response()
}
