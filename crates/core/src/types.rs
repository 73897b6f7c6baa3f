use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Structured workout description returned by an extraction adapter.
///
/// Every field is optional because model output is loosely shaped. Numeric
/// fields accept JSON numbers as well as numeric strings; anything else is
/// treated as absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkoutGuess {
    #[serde(default, deserialize_with = "lenient_string")]
    pub activity_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub duration_minutes: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub calories_burned: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub heart_rate_avg: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub distance_km: Option<f64>,
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(text)) => Some(text),
        Some(Value::Number(number)) => Some(number.to_string()),
        _ => None,
    })
}

fn lenient_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(number)) => number.as_f64(),
        Some(Value::String(text)) => text.trim().parse::<f64>().ok(),
        _ => None,
    })
}

/// Workout fields after clamping, ready to be persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedWorkout {
    pub activity_type: String,
    pub duration_minutes: u32,
    pub calories_burned: u32,
    pub heart_rate_avg: Option<u32>,
    pub distance_km: Option<f64>,
}

impl NormalizedWorkout {
    /// Placeholder stored when neither image nor text analysis produced a result.
    pub fn minimal_fallback() -> Self {
        Self {
            activity_type: UNKNOWN_ACTIVITY.to_string(),
            duration_minutes: 0,
            calories_burned: 0,
            heart_rate_avg: None,
            distance_km: None,
        }
    }
}

pub const UNKNOWN_ACTIVITY: &str = "unknown";

/// Which tier of the ingestion pipeline produced the persisted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkoutSource {
    Image,
    Text,
    Fallback,
}

impl WorkoutSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Text => "text",
            Self::Fallback => "fallback",
        }
    }
}

/// Step at which an image candidate was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStep {
    Validate,
    Download,
    Analyze,
    Insert,
}

impl CandidateStep {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::Download => "download",
            Self::Analyze => "analyze",
            Self::Insert => "insert",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateFailure {
    pub image_url: String,
    pub step: CandidateStep,
    pub error: String,
}

/// Why the minimal fallback record had to be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    NoAttachments,
    NoUsableImage,
    AllCandidatesFailed,
}

/// Non-fatal details accumulated during one ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Diagnostics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FallbackReason>,
    pub errors: Vec<CandidateFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_error: Option<String>,
    pub image_count: usize,
    pub videos_count: usize,
    pub invalid_count: usize,
}

/// Successful outcome of an ingestion run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReport {
    pub message_id: String,
    pub user_id: String,
    pub user_name: String,
    pub source: WorkoutSource,
    pub image_url: Option<String>,
    pub duplicate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub diagnostics: Diagnostics,
}
