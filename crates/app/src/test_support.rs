use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::TempDir;

use clickfit_core::adapter::{AdapterError, ImageFetcher, WorkoutAnalyzer};
use clickfit_core::types::WorkoutGuess;
use clickfit_storage::Database;

use crate::ingest::{Clock, Ingestor};
use crate::router::AppState;
use crate::telemetry;

pub const FIXED_NOW: &str = "2024-05-04T07:30:00Z";

pub async fn setup_db() -> (Database, TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
    let db = Database::connect(&url).await.expect("connect");
    db.run_migrations().await.expect("migrations");
    (db, dir)
}

pub fn fixed_now() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(FIXED_NOW)
        .expect("fixed time")
        .with_timezone(&Utc)
}

pub fn fixed_clock() -> Clock {
    let now = fixed_now();
    Arc::new(move || now)
}

pub fn running_guess() -> WorkoutGuess {
    WorkoutGuess {
        activity_type: Some("Running".to_string()),
        duration_minutes: Some(42.0),
        calories_burned: Some(410.0),
        heart_rate_avg: Some(151.0),
        distance_km: Some(7.456),
    }
}

/// Builds application state around the given fakes with a fixed clock.
pub fn test_state(
    db: &Database,
    secret: Option<&str>,
    analyzer: Arc<dyn WorkoutAnalyzer>,
    fetcher: Arc<dyn ImageFetcher>,
) -> AppState {
    let metrics = telemetry::init_metrics().expect("metrics init");
    let ingestor = Ingestor::new(db.clone(), analyzer, fetcher, fixed_clock());
    let secret = secret.map(|value| Arc::from(value.as_bytes().to_vec().into_boxed_slice()));
    AppState::new(metrics, db.clone(), secret, ingestor).with_clock(fixed_clock())
}

/// Analyzer returning canned guesses; a missing guess fails like a reply
/// without JSON.
#[derive(Default)]
pub struct FakeAnalyzer {
    image: Option<WorkoutGuess>,
    text: Option<WorkoutGuess>,
    image_calls: AtomicUsize,
    text_calls: AtomicUsize,
}

impl FakeAnalyzer {
    pub fn with_image(guess: WorkoutGuess) -> Self {
        Self {
            image: Some(guess),
            ..Self::default()
        }
    }

    pub fn with_text(guess: WorkoutGuess) -> Self {
        Self {
            text: Some(guess),
            ..Self::default()
        }
    }

    pub fn image_calls(&self) -> usize {
        self.image_calls.load(Ordering::SeqCst)
    }

    pub fn text_calls(&self) -> usize {
        self.text_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkoutAnalyzer for FakeAnalyzer {
    async fn analyze_image(
        &self,
        _image_base64: &str,
        _text_hint: &str,
    ) -> Result<WorkoutGuess, AdapterError> {
        self.image_calls.fetch_add(1, Ordering::SeqCst);
        self.image
            .clone()
            .ok_or_else(|| AdapterError::Malformed("no workout in image".to_string()))
    }

    async fn analyze_text(&self, _text: &str) -> Result<WorkoutGuess, AdapterError> {
        self.text_calls.fetch_add(1, Ordering::SeqCst);
        self.text
            .clone()
            .ok_or_else(|| AdapterError::Malformed("no workout in text".to_string()))
    }
}

/// Fetcher that serves every url except the ones marked as failing.
#[derive(Default)]
pub struct FakeFetcher {
    failing: Vec<String>,
    requested: Mutex<Vec<String>>,
}

impl FakeFetcher {
    pub fn failing(urls: &[&str]) -> Self {
        Self {
            failing: urls.iter().map(|url| url.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().expect("fetch log poisoned").clone()
    }
}

#[async_trait]
impl ImageFetcher for FakeFetcher {
    async fn fetch_base64(&self, url: &str) -> Result<String, AdapterError> {
        self.requested
            .lock()
            .expect("fetch log poisoned")
            .push(url.to_string());
        if self.failing.iter().any(|failing| failing == url) {
            return Err(AdapterError::Network("connection reset".to_string()));
        }
        Ok("aGVsbG8=".to_string())
    }
}
