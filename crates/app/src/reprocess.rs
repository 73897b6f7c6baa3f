use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    Json,
};
use chrono::{DateTime, SecondsFormat, Utc};
use metrics::counter;
use serde::{de, Deserialize, Deserializer};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use clickfit_storage::{ProcessingResult, WebhookLogFilter, WebhookLogRow};

use crate::problem::ProblemResponse;
use crate::router::AppState;

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 500;

/// Selection of stored webhook deliveries to run through ingestion again.
#[derive(Debug, Deserialize)]
pub struct ReprocessRequest {
    #[serde(default, deserialize_with = "optional_log_id")]
    pub log_id: Option<i64>,
    #[serde(default, deserialize_with = "log_ids")]
    pub ids: Vec<i64>,
    #[serde(default)]
    pub workout_id: Option<String>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default = "default_only_unprocessed")]
    pub only_unprocessed: bool,
    #[serde(default)]
    pub limit: Option<i64>,
}

fn default_only_unprocessed() -> bool {
    true
}

/// Log ids arrive as JSON numbers or numeric strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum LogId {
    Number(i64),
    Text(String),
}

impl LogId {
    fn parse<E: de::Error>(self) -> Result<i64, E> {
        match self {
            Self::Number(id) => Ok(id),
            Self::Text(text) => text
                .trim()
                .parse()
                .map_err(|_| E::custom(format!("invalid log id `{text}`"))),
        }
    }
}

fn optional_log_id<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<LogId>::deserialize(deserializer)?
        .map(LogId::parse)
        .transpose()
}

fn log_ids<'de, D>(deserializer: D) -> Result<Vec<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<Vec<LogId>>::deserialize(deserializer)?
        .unwrap_or_default()
        .into_iter()
        .map(LogId::parse)
        .collect()
}

impl ReprocessRequest {
    fn explicit_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.log_id.into_iter().chain(self.ids.iter().copied()).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    fn filter(&self) -> WebhookLogFilter {
        WebhookLogFilter {
            since: self.since,
            only_unprocessed: self.only_unprocessed,
            limit: self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT),
        }
    }
}

pub async fn liveness(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "mode": "reprocess",
        "ts": state.now().to_rfc3339_opts(SecondsFormat::Millis, true),
    }))
}

pub async fn handle(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, ProblemResponse> {
    let request = parse_request(&body)?;
    let rows = select_rows(&state, &request).await?;

    if rows.is_empty() {
        return Ok(Json(json!({
            "results": [],
            "note": "no webhook logs matched the filter",
        })));
    }

    let mut results = Vec::with_capacity(rows.len());
    for row in rows {
        results.push(rerun(&state, row).await);
    }

    Ok(Json(json!({ "results": results })))
}

fn parse_request(body: &[u8]) -> Result<ReprocessRequest, ProblemResponse> {
    let body = if body.iter().all(u8::is_ascii_whitespace) {
        &b"{}"[..]
    } else {
        body
    };
    serde_json::from_slice(body).map_err(|err| {
        ProblemResponse::new(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            format!("failed to parse reprocess request: {err}"),
        )
    })
}

async fn select_rows(
    state: &AppState,
    request: &ReprocessRequest,
) -> Result<Vec<WebhookLogRow>, ProblemResponse> {
    let logs = state.storage().webhook_logs();
    let explicit = request.explicit_ids();

    if !explicit.is_empty() {
        let rows = logs.fetch_by_ids(&explicit).await.map_err(storage_problem)?;
        if rows.is_empty() {
            return Err(ProblemResponse::new(
                StatusCode::NOT_FOUND,
                "not_found",
                "no webhook logs exist for the requested ids",
            ));
        }
        return Ok(rows);
    }

    if let Some(workout_id) = request.workout_id.as_deref() {
        let message_id = state
            .storage()
            .workouts()
            .message_id_for(workout_id)
            .await
            .map_err(storage_problem)?;
        let rows = match message_id {
            Some(message_id) => logs
                .fetch_by_message_id(&message_id)
                .await
                .map_err(storage_problem)?,
            None => Vec::new(),
        };
        if rows.is_empty() {
            return Err(ProblemResponse::new(
                StatusCode::NOT_FOUND,
                "not_found",
                format!("no webhook logs exist for workout {workout_id}"),
            ));
        }
        return Ok(rows);
    }

    logs.list_filtered(&request.filter())
        .await
        .map_err(storage_problem)
}

async fn rerun(state: &AppState, row: WebhookLogRow) -> Value {
    let outcome = state.ingestor().process_raw(&row.body).await;
    let (success, info) = match &outcome {
        Ok(report) => (true, json!(report)),
        Err(err) => (false, err.to_info()),
    };
    counter!("reprocess_rows_total", "result" => if success { "success" } else { "failure" })
        .increment(1);

    let error_text = (!success).then(|| info.to_string());
    let result = match &error_text {
        None => ProcessingResult::Processed { at: state.now() },
        Some(error) => ProcessingResult::Failed { error },
    };
    match state
        .storage()
        .webhook_logs()
        .record_reprocess(row.id, result)
        .await
    {
        Ok(attempts) => {
            info!(stage = "reprocess", log_id = row.id, success, attempts, "webhook log reprocessed");
        }
        Err(err) => {
            warn!(stage = "reprocess", log_id = row.id, error = %err, "failed to record reprocess outcome");
        }
    }

    json!({ "id": row.id, "success": success, "info": info })
}

fn storage_problem(err: impl std::fmt::Display) -> ProblemResponse {
    error!(stage = "reprocess", error = %err, "failed to load webhook logs");
    ProblemResponse::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        "storage_error",
        err.to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Method, Request},
        response::Response,
    };
    use http_body_util::BodyExt;
    use sqlx::query_as;
    use std::sync::Arc;
    use tower::ServiceExt;

    use clickfit_storage::{Database, NewWebhookLog};

    use crate::router::app_router;
    use crate::test_support::{
        fixed_now, running_guess, setup_db, test_state, FakeAnalyzer, FakeFetcher,
    };

    fn text_body(message_id: &str) -> String {
        json!({
            "payload": {"data": {"id": message_id, "userid": "u-9", "text_content": "yoga 30 min"}}
        })
        .to_string()
    }

    async fn store_log(db: &Database, message_id: Option<&str>, body: &str) -> i64 {
        db.webhook_logs()
            .insert(NewWebhookLog {
                message_id,
                headers_json: "{}",
                body,
                valid_signature: false,
                received_at: fixed_now(),
            })
            .await
            .expect("log insert")
    }

    fn state(db: &Database) -> AppState {
        test_state(
            db,
            None,
            Arc::new(FakeAnalyzer::with_text(running_guess())),
            Arc::new(FakeFetcher::default()),
        )
    }

    async fn post(state: AppState, body: &str) -> Response {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/reprocess")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request");
        app_router(state).oneshot(request).await.expect("response")
    }

    async fn json_body(response: Response) -> Value {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        serde_json::from_slice(&bytes).expect("json body")
    }

    async fn log_state(db: &Database, id: i64) -> (Option<String>, Option<String>, i64) {
        query_as(
            "SELECT processed_at, last_error, reprocess_attempts FROM webhook_logs WHERE id = ?",
        )
        .bind(id)
        .fetch_one(db.pool())
        .await
        .expect("log row")
    }

    #[tokio::test]
    async fn reprocesses_single_log() {
        let (db, _dir) = setup_db().await;
        let id = store_log(&db, Some("r-1"), &text_body("r-1")).await;

        let response = post(state(&db), &json!({"log_id": id}).to_string()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["results"][0]["id"], id);
        assert_eq!(json["results"][0]["success"], true);
        assert_eq!(json["results"][0]["info"]["source"], "text");

        let (processed_at, last_error, attempts) = log_state(&db, id).await;
        assert!(processed_at.is_some());
        assert!(last_error.is_none());
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn accepts_numeric_string_ids() {
        let (db, _dir) = setup_db().await;
        let first = store_log(&db, Some("r-s1"), &text_body("r-s1")).await;
        let second = store_log(&db, Some("r-s2"), &text_body("r-s2")).await;

        let body = json!({"log_id": first.to_string(), "ids": [format!(" {second} ")]});
        let json = json_body(post(state(&db), &body.to_string()).await).await;
        let results = json["results"].as_array().expect("results");
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["id"], first);
        assert_eq!(results[1]["id"], second);

        let response = post(state(&db), r#"{"log_id": "twelve"}"#).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let (db, _dir) = setup_db().await;
        let response = post(state(&db), r#"{"ids": [41, 42]}"#).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn batch_skips_processed_rows_by_default() {
        let (db, _dir) = setup_db().await;
        let done = store_log(&db, Some("r-done"), &text_body("r-done")).await;
        let pending = store_log(&db, Some("r-pending"), &text_body("r-pending")).await;
        db.webhook_logs()
            .record_result(done, ProcessingResult::Processed { at: fixed_now() })
            .await
            .expect("mark processed");

        let json = json_body(post(state(&db), "").await).await;
        let results = json["results"].as_array().expect("results");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["id"], pending);

        let json = json_body(post(state(&db), r#"{"only_unprocessed": false, "limit": 1}"#).await).await;
        let results = json["results"].as_array().expect("results");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["id"], done);
    }

    #[tokio::test]
    async fn failed_rerun_records_error() {
        let (db, _dir) = setup_db().await;
        let id = store_log(&db, None, "{\"payload\": 1}").await;

        let json = json_body(post(state(&db), &json!({"ids": [id]}).to_string()).await).await;
        assert_eq!(json["results"][0]["success"], false);
        assert_eq!(json["results"][0]["info"]["error"], "invalid_payload");

        let (processed_at, last_error, attempts) = log_state(&db, id).await;
        assert!(processed_at.is_none());
        assert!(last_error.expect("error").contains("invalid_payload"));
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn workout_id_resolves_to_its_deliveries() {
        let (db, _dir) = setup_db().await;
        let body = text_body("r-w");
        let state = state(&db);
        state.ingestor().process_raw(&body).await.expect("ingest");
        let log_id = store_log(&db, Some("r-w"), &body).await;
        let (workout_id,): (String,) =
            query_as("SELECT id FROM workouts WHERE clickup_message_id = 'r-w'")
                .fetch_one(db.pool())
                .await
                .expect("workout");

        let json = json_body(post(state.clone(), &json!({"workout_id": workout_id}).to_string()).await).await;
        assert_eq!(json["results"][0]["id"], log_id);
        assert_eq!(json["results"][0]["info"]["duplicate"], true);

        let response = post(state, r#"{"workout_id": "missing"}"#).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn empty_selection_returns_note() {
        let (db, _dir) = setup_db().await;
        let json = json_body(post(state(&db), r#"{"since": "2030-01-01T00:00:00Z"}"#).await).await;
        assert_eq!(json["results"], json!([]));
        assert!(json["note"].is_string());
    }

    #[tokio::test]
    async fn invalid_request_is_bad_request() {
        let (db, _dir) = setup_db().await;
        let response = post(state(&db), r#"{"limit": "many"}"#).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn limit_is_clamped() {
        let request: ReprocessRequest =
            serde_json::from_str(r#"{"limit": 10000}"#).expect("request");
        assert_eq!(request.filter().limit, MAX_LIMIT);
        assert!(request.filter().only_unprocessed);

        let request: ReprocessRequest = serde_json::from_str(r#"{"limit": 0}"#).expect("request");
        assert_eq!(request.filter().limit, 1);

        let request: ReprocessRequest = serde_json::from_str("{}").expect("request");
        assert_eq!(request.filter().limit, DEFAULT_LIMIT);
    }

    #[tokio::test]
    async fn get_reports_mode() {
        let (db, _dir) = setup_db().await;
        let request = Request::builder()
            .uri("/api/reprocess")
            .body(Body::empty())
            .expect("request");
        let response = app_router(state(&db)).oneshot(request).await.expect("response");
        let json = json_body(response).await;
        assert_eq!(json["mode"], "reprocess");
        assert_eq!(json["ok"], true);
    }
}
