use std::time::Instant;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::SecondsFormat;
use hmac::{Hmac, Mac};
use metrics::{counter, histogram};
use serde_json::{json, Map, Value};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use clickfit_core::payload::peek_message_id;
use clickfit_storage::{NewWebhookLog, ProcessingResult};

use crate::ingest::IngestError;
use crate::problem::ProblemResponse;
use crate::router::AppState;

const HEADER_SIGNATURE: &str = "x-signature";

pub async fn liveness(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "ts": state.now().to_rfc3339_opts(SecondsFormat::Millis, true),
    }))
}

pub async fn handle(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProblemResponse> {
    let start = Instant::now();
    let result = accept(&state, &headers, &body).await;

    let status = match &result {
        Ok(response) => response.status(),
        Err(problem) => problem.status(),
    };
    histogram!("webhook_ack_latency_seconds", "status" => status.as_u16().to_string())
        .record(start.elapsed().as_secs_f64());
    result
}

async fn accept(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, ProblemResponse> {
    let signature = match headers.get(HEADER_SIGNATURE) {
        Some(value) => match value.to_str() {
            Ok(value) => Some(value),
            Err(_) if state.webhook_secret().is_some_and(|secret| !secret.is_empty()) => {
                return Err(reject_signature("signature header is not visible ASCII".to_string()));
            }
            Err(_) => None,
        },
        None => None,
    };

    verify_signature(state.webhook_secret(), signature, body).map_err(reject_signature)?;

    counter!("webhook_ingress_total").increment(1);

    let body = std::str::from_utf8(body).map_err(|_| {
        ProblemResponse::new(
            StatusCode::BAD_REQUEST,
            "invalid_payload",
            "request body must be valid UTF-8",
        )
    })?;

    let valid_signature = state.webhook_secret().is_some() && signature.is_some();
    let log_id = log_delivery(state, headers, body, valid_signature).await;

    let outcome = state.ingestor().process_raw(body).await;

    if let Some(id) = log_id {
        let info = outcome.as_ref().err().map(|err| err.to_info().to_string());
        let result = match &info {
            None => ProcessingResult::Processed { at: state.now() },
            Some(error) => ProcessingResult::Failed { error },
        };
        if let Err(err) = state.storage().webhook_logs().record_result(id, result).await {
            warn!(stage = "storage", log_id = id, error = %err, "failed to record webhook outcome");
        }
    }

    match outcome {
        Ok(report) => {
            info!(
                stage = "ingress",
                message_id = %report.message_id,
                source = report.source.as_str(),
                duplicate = report.duplicate,
                "webhook processed"
            );
            Ok((
                StatusCode::OK,
                Json(json!({ "success": true, "info": report })),
            )
                .into_response())
        }
        Err(err) => Err(problem_for(&err)),
    }
}

/// Maps a terminal ingestion failure onto an HTTP problem.
pub fn problem_for(err: &IngestError) -> ProblemResponse {
    if err.is_client_error() {
        warn!(stage = "ingress", error = %err, "rejected malformed webhook payload");
        ProblemResponse::new(StatusCode::BAD_REQUEST, err.kind(), err.to_string())
    } else {
        ProblemResponse::new(StatusCode::INTERNAL_SERVER_ERROR, err.kind(), err.to_string())
            .with_info(err.to_info())
    }
}

/// Stores the raw delivery; failing to log never fails the request.
async fn log_delivery(
    state: &AppState,
    headers: &HeaderMap,
    body: &str,
    valid_signature: bool,
) -> Option<i64> {
    let headers_json = headers_to_json(headers).to_string();
    let message_id = peek_message_id(body);
    let record = NewWebhookLog {
        message_id: message_id.as_deref(),
        headers_json: &headers_json,
        body,
        valid_signature,
        received_at: state.now(),
    };

    match state.storage().webhook_logs().insert(record).await {
        Ok(id) => Some(id),
        Err(err) => {
            warn!(stage = "storage", error = %err, "failed to log webhook delivery");
            None
        }
    }
}

fn headers_to_json(headers: &HeaderMap) -> Value {
    let mut map = Map::new();
    for (name, value) in headers {
        map.insert(
            name.as_str().to_string(),
            Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
        );
    }
    Value::Object(map)
}

/// Checks `provided` (hex HMAC-SHA256 of `body`) against `secret`.
///
/// Verification only happens when both a non-empty secret and a signature are
/// present; otherwise the delivery passes through.
fn reject_signature(err: String) -> ProblemResponse {
    counter!("webhook_invalid_signature_total").increment(1);
    warn!(stage = "ingress", error = %err, "rejected webhook signature");
    ProblemResponse::new(StatusCode::UNAUTHORIZED, "invalid_signature", err)
}

pub fn verify_signature(
    secret: Option<&[u8]>,
    provided: Option<&str>,
    body: &[u8],
) -> Result<(), String> {
    let (Some(secret), Some(provided)) = (secret, provided) else {
        return Ok(());
    };
    if secret.is_empty() {
        return Ok(());
    }

    let provided_bytes =
        hex::decode(provided.trim()).map_err(|_| "signature is not valid hex".to_string())?;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret)
        .map_err(|_| "failed to initialize signature verifier".to_string())?;
    mac.update(body);
    let expected = mac.finalize().into_bytes();
    let expected_bytes: &[u8] = expected.as_ref();

    if expected_bytes.ct_eq(provided_bytes.as_slice()).into() {
        Ok(())
    } else {
        Err("signature mismatch".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{HeaderValue, Method, Request},
    };
    use http_body_util::BodyExt;
    use sqlx::{query_as, query_scalar};
    use std::sync::Arc;
    use tower::ServiceExt;

    use crate::router::app_router;
    use crate::test_support::{running_guess, setup_db, test_state, FakeAnalyzer, FakeFetcher};

    const SECRET: &str = "test-secret";

    fn sign(secret: &str, body: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac");
        mac.update(body.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn image_body(message_id: &str) -> String {
        json!({
            "event": "taskCommentPosted",
            "payload": {
                "data": {
                    "id": message_id,
                    "userid": 1001,
                    "text_content": "Intervals ![shot](https://cdn.example/watch.png)",
                    "comment": [
                        {"text": "Intervals "},
                        {"type": "image", "image": {"url": "https://cdn.example/watch.png"}}
                    ]
                }
            }
        })
        .to_string()
    }

    async fn call_webhook(state: AppState, signature: Option<&str>, body: String) -> Response {
        let mut request = Request::builder()
            .method(Method::POST)
            .uri("/api/webhook")
            .body(Body::from(body))
            .expect("request");
        request.headers_mut().insert(
            axum::http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        if let Some(signature) = signature {
            request.headers_mut().insert(
                HEADER_SIGNATURE,
                HeaderValue::from_str(signature).expect("signature header"),
            );
        }

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

    #[test]
    fn signature_matches_and_single_bit_flip_fails() {
        let valid = sign("s", "b");
        assert_eq!(verify_signature(Some(b"s"), Some(&valid), b"b"), Ok(()));
        assert_eq!(
            verify_signature(Some(b"s"), Some(&valid.to_uppercase()), b"b"),
            Ok(())
        );

        let digest = hex::decode(&valid).expect("hex");
        for byte in 0..digest.len() {
            for bit in 0..8 {
                let mut flipped = digest.clone();
                flipped[byte] ^= 1 << bit;
                let header = hex::encode(&flipped);
                assert!(
                    verify_signature(Some(b"s"), Some(&header), b"b").is_err(),
                    "flip of byte {byte} bit {bit} should fail"
                );
            }
        }
    }

    #[test]
    fn signature_check_is_skipped_without_secret_or_header() {
        assert_eq!(verify_signature(None, Some("zz"), b"b"), Ok(()));
        assert_eq!(verify_signature(Some(b"s"), None, b"b"), Ok(()));
        assert_eq!(verify_signature(Some(b""), Some("zz"), b"b"), Ok(()));
        assert!(verify_signature(Some(b"s"), Some("not-hex"), b"b").is_err());
    }

    #[tokio::test]
    async fn signed_delivery_stores_workout_and_log() {
        let (db, _dir) = setup_db().await;
        let state = test_state(
            &db,
            Some(SECRET),
            Arc::new(FakeAnalyzer::with_image(running_guess())),
            Arc::new(FakeFetcher::default()),
        );
        let body = image_body("c-100");
        let signature = sign(SECRET, &body);

        let response = call_webhook(state, Some(&signature), body).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["info"]["source"], "image");
        assert_eq!(json["info"]["image_url"], "https://cdn.example/watch.png");
        assert_eq!(json["info"]["user_name"], "user-1001");

        let (image_url, raw_message): (Option<String>, String) =
            query_as("SELECT image_url, raw_message FROM workouts WHERE clickup_message_id = 'c-100'")
                .fetch_one(db.pool())
                .await
                .expect("workout row");
        assert_eq!(image_url.as_deref(), Some("https://cdn.example/watch.png"));
        assert_eq!(raw_message, "Intervals");

        let (message_id, valid_signature, processed_at, headers_json): (
            Option<String>,
            bool,
            Option<String>,
            String,
        ) = query_as(
            "SELECT message_id, valid_signature, processed_at, headers_json FROM webhook_logs",
        )
        .fetch_one(db.pool())
        .await
        .expect("log row");
        assert_eq!(message_id.as_deref(), Some("c-100"));
        assert!(valid_signature);
        assert!(processed_at.is_some());
        assert!(headers_json.contains(HEADER_SIGNATURE));
    }

    #[tokio::test]
    async fn rejects_invalid_signature() {
        let (db, _dir) = setup_db().await;
        let state = test_state(
            &db,
            Some(SECRET),
            Arc::new(FakeAnalyzer::with_image(running_guess())),
            Arc::new(FakeFetcher::default()),
        );
        let body = image_body("c-bad");
        let mut signature = sign(SECRET, &body);
        signature.replace_range(0..1, if signature.starts_with('0') { "1" } else { "0" });

        let response = call_webhook(state, Some(&signature), body).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers()[axum::http::header::CONTENT_TYPE],
            "application/problem+json"
        );

        let (logs, workouts): (i64, i64) = query_as(
            "SELECT (SELECT COUNT(*) FROM webhook_logs), (SELECT COUNT(*) FROM workouts)",
        )
        .fetch_one(db.pool())
        .await
        .expect("counts");
        assert_eq!((logs, workouts), (0, 0));
    }

    #[tokio::test]
    async fn rejects_non_ascii_signature_header() {
        let (db, _dir) = setup_db().await;
        let state = test_state(
            &db,
            Some(SECRET),
            Arc::new(FakeAnalyzer::with_image(running_guess())),
            Arc::new(FakeFetcher::default()),
        );
        let mut request = Request::builder()
            .method(Method::POST)
            .uri("/api/webhook")
            .body(Body::from(image_body("c-latin1")))
            .expect("request");
        request.headers_mut().insert(
            HEADER_SIGNATURE,
            HeaderValue::from_bytes(b"\xe9forged").expect("opaque header"),
        );

        let response = app_router(state).oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = json_body(response).await;
        assert_eq!(json["type"], "invalid_signature");

        let workouts: i64 = query_scalar("SELECT COUNT(*) FROM workouts")
            .fetch_one(db.pool())
            .await
            .expect("count");
        assert_eq!(workouts, 0);
    }

    #[tokio::test]
    async fn unsigned_delivery_passes_when_secret_missing() {
        let (db, _dir) = setup_db().await;
        let state = test_state(
            &db,
            None,
            Arc::new(FakeAnalyzer::with_image(running_guess())),
            Arc::new(FakeFetcher::default()),
        );

        let response = call_webhook(state, Some("deadbeef"), image_body("c-open")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let (valid_signature,): (bool,) = query_as("SELECT valid_signature FROM webhook_logs")
            .fetch_one(db.pool())
            .await
            .expect("log row");
        assert!(!valid_signature);
    }

    #[tokio::test]
    async fn malformed_payload_is_bad_request() {
        let (db, _dir) = setup_db().await;
        let state = test_state(
            &db,
            None,
            Arc::new(FakeAnalyzer::default()),
            Arc::new(FakeFetcher::default()),
        );

        let response = call_webhook(state, None, r#"{"payload": {}}"#.to_string()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = json_body(response).await;
        assert_eq!(json["type"], "invalid_payload");

        let (processed_at, last_error): (Option<String>, Option<String>) =
            query_as("SELECT processed_at, last_error FROM webhook_logs")
                .fetch_one(db.pool())
                .await
                .expect("log row");
        assert!(processed_at.is_none());
        assert!(last_error.expect("error recorded").contains("invalid_payload"));
    }

    #[tokio::test]
    async fn repeated_delivery_reports_duplicate() {
        let (db, _dir) = setup_db().await;
        let state = test_state(
            &db,
            Some(SECRET),
            Arc::new(FakeAnalyzer::with_image(running_guess())),
            Arc::new(FakeFetcher::default()),
        );
        let body = image_body("c-dup");
        let signature = sign(SECRET, &body);

        let first = call_webhook(state.clone(), Some(&signature), body.clone()).await;
        assert_eq!(json_body(first).await["info"]["duplicate"], false);
        let second = call_webhook(state, Some(&signature), body).await;
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(json_body(second).await["info"]["duplicate"], true);

        let (count,): (i64,) = query_as("SELECT COUNT(*) FROM workouts")
            .fetch_one(db.pool())
            .await
            .expect("count");
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn storage_failure_returns_diagnostics() {
        let (db, _dir) = setup_db().await;
        sqlx::query(
            "CREATE TRIGGER reject_workouts BEFORE INSERT ON workouts \
             BEGIN SELECT RAISE(ABORT, 'storage offline'); END",
        )
        .execute(db.pool())
        .await
        .expect("trigger");
        let state = test_state(
            &db,
            None,
            Arc::new(FakeAnalyzer::default()),
            Arc::new(FakeFetcher::failing(&["https://cdn.example/watch.png"])),
        );

        let response = call_webhook(state, None, image_body("c-down")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = json_body(response).await;
        assert_eq!(json["type"], "storage_error");
        assert_eq!(
            json["info"]["diagnostics"]["reason"],
            "all_candidates_failed"
        );
        assert_eq!(json["info"]["diagnostics"]["errors"][0]["step"], "download");
    }

    #[tokio::test]
    async fn get_reports_liveness() {
        let (db, _dir) = setup_db().await;
        let state = test_state(
            &db,
            None,
            Arc::new(FakeAnalyzer::default()),
            Arc::new(FakeFetcher::default()),
        );
        let request = Request::builder()
            .uri("/api/webhook")
            .body(Body::empty())
            .expect("request");

        let response = app_router(state).oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["ok"], true);
        assert_eq!(json["ts"], "2024-05-04T07:30:00.000Z");
    }
}
