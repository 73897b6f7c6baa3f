use std::{borrow::Cow, sync::Arc};

use chrono::{DateTime, Utc};
use metrics::counter;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use clickfit_core::adapter::{ImageFetcher, WorkoutAnalyzer};
use clickfit_core::attachments::{is_likely_video, is_valid_http_url};
use clickfit_core::normalizer::Normalizer;
use clickfit_core::payload::{ClickUpMessage, PayloadError};
use clickfit_core::types::{
    CandidateFailure, CandidateStep, Diagnostics, FallbackReason, IngestReport,
    NormalizedWorkout, WorkoutSource,
};
use clickfit_storage::{
    Database, NewWorkout, UserMappingError, WorkoutError, WorkoutInsertOutcome,
};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Turns one raw ClickUp delivery into at most one stored workout.
///
/// The live webhook and the reprocess endpoint share this type so both paths
/// apply identical fallback rules.
#[derive(Clone)]
pub struct Ingestor {
    storage: Database,
    analyzer: Arc<dyn WorkoutAnalyzer>,
    fetcher: Arc<dyn ImageFetcher>,
    clock: Clock,
}

/// Position in the fallback chain once the user is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    TryImage(usize),
    TextFallback,
    MinimalFallback,
}

/// Per-run values threaded through the stages.
struct Run<'a> {
    message: &'a ClickUpMessage,
    now: DateTime<Utc>,
    diagnostics: Diagnostics,
}

impl Ingestor {
    pub fn new(
        storage: Database,
        analyzer: Arc<dyn WorkoutAnalyzer>,
        fetcher: Arc<dyn ImageFetcher>,
        clock: Clock,
    ) -> Self {
        Self {
            storage,
            analyzer,
            fetcher,
            clock,
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub async fn process_raw(&self, raw: &str) -> Result<IngestReport, IngestError> {
        let message = ClickUpMessage::parse(raw)?;
        let user_name = self.resolve_user(&message.user_id).await?;

        let attachments = &message.attachments;
        let mut run = Run {
            message: &message,
            now: (self.clock)(),
            diagnostics: Diagnostics {
                image_count: attachments.images.len(),
                videos_count: attachments.videos.len(),
                invalid_count: attachments.invalid.len(),
                ..Diagnostics::default()
            },
        };

        let mut stage = if attachments.images.is_empty() {
            Stage::TextFallback
        } else {
            Stage::TryImage(0)
        };

        loop {
            stage = match stage {
                Stage::TryImage(index) => match attachments.images.get(index) {
                    None => Stage::TextFallback,
                    Some(url) => match self.try_image(&run, url).await {
                        Ok(outcome) => {
                            return Ok(self.finish(
                                run,
                                user_name,
                                WorkoutSource::Image,
                                Some(url.clone()),
                                outcome,
                            ));
                        }
                        Err(failure) => {
                            counter!("ingest_candidate_failures_total", "step" => failure.step.as_str())
                                .increment(1);
                            warn!(
                                stage = "ingest",
                                message_id = %message.message_id,
                                image_url = %failure.image_url,
                                step = failure.step.as_str(),
                                error = %failure.error,
                                "image candidate failed"
                            );
                            run.diagnostics.errors.push(failure);
                            Stage::TryImage(index + 1)
                        }
                    },
                },
                Stage::TextFallback => {
                    if message.text.is_empty() {
                        Stage::MinimalFallback
                    } else {
                        match self.try_text(&run).await {
                            Ok(outcome) => {
                                return Ok(self.finish(
                                    run,
                                    user_name,
                                    WorkoutSource::Text,
                                    None,
                                    outcome,
                                ));
                            }
                            Err(err) => {
                                warn!(stage = "ingest", message_id = %message.message_id, error = %err, "text fallback failed");
                                run.diagnostics.text_error = Some(err);
                                Stage::MinimalFallback
                            }
                        }
                    }
                }
                Stage::MinimalFallback => {
                    run.diagnostics.reason = Some(fallback_reason(&message));
                    let workout = NormalizedWorkout::minimal_fallback();
                    return match self.insert(&run, &workout, None).await {
                        Ok(outcome) => Ok(self.finish(
                            run,
                            user_name,
                            WorkoutSource::Fallback,
                            None,
                            outcome,
                        )),
                        Err(err) => {
                            counter!("ingest_outcome_total", "source" => "failed").increment(1);
                            error!(stage = "ingest", message_id = %message.message_id, error = %err, "fallback insert failed");
                            Err(IngestError::FallbackInsert {
                                diagnostics: run.diagnostics,
                                error: err,
                            })
                        }
                    };
                }
            };
        }
    }

    async fn resolve_user(&self, user_id: &str) -> Result<String, IngestError> {
        let repo = self.storage.team_users();
        let lookup = match repo.fetch_name(user_id).await {
            Ok(Some(name)) => Ok(name),
            Ok(None) => {
                let placeholder = format!("user-{user_id}");
                repo.ensure(user_id, &placeholder, (self.clock)()).await
            }
            Err(err) => Err(err),
        };

        lookup.map_err(|source| {
            error!(stage = "storage", %user_id, error = %source, "user resolution failed");
            IngestError::UserResolution {
                user_id: user_id.to_string(),
                source,
            }
        })
    }

    async fn try_image(
        &self,
        run: &Run<'_>,
        url: &str,
    ) -> Result<WorkoutInsertOutcome, CandidateFailure> {
        let fail = |step: CandidateStep, error: String| CandidateFailure {
            image_url: url.to_string(),
            step,
            error,
        };

        if !is_valid_http_url(url) {
            return Err(fail(CandidateStep::Validate, "not an http(s) url".to_string()));
        }
        if is_likely_video(url) {
            return Err(fail(CandidateStep::Validate, "video attachment".to_string()));
        }

        let image = self
            .fetcher
            .fetch_base64(url)
            .await
            .map_err(|err| fail(CandidateStep::Download, err.to_string()))?;

        let guess = self
            .analyzer
            .analyze_image(&image, &run.message.text)
            .await
            .map_err(|err| fail(CandidateStep::Analyze, err.to_string()))?;

        let workout = Normalizer::normalize(&guess);
        self.insert(run, &workout, Some(url))
            .await
            .map_err(|err| fail(CandidateStep::Insert, err.to_string()))
    }

    async fn try_text(&self, run: &Run<'_>) -> Result<WorkoutInsertOutcome, String> {
        let guess = self
            .analyzer
            .analyze_text(&run.message.text)
            .await
            .map_err(|err| err.to_string())?;
        let workout = Normalizer::normalize(&guess);
        self.insert(run, &workout, None)
            .await
            .map_err(|err| err.to_string())
    }

    async fn insert(
        &self,
        run: &Run<'_>,
        workout: &NormalizedWorkout,
        image_url: Option<&str>,
    ) -> Result<WorkoutInsertOutcome, WorkoutError> {
        let record = NewWorkout {
            id: Cow::Owned(Uuid::new_v4().to_string()),
            user_id: &run.message.user_id,
            workout,
            date: run.now.date_naive(),
            raw_message: &run.message.text,
            image_url,
            clickup_message_id: &run.message.message_id,
            created_at: run.now,
        };
        self.storage.workouts().insert(record).await
    }

    fn finish(
        &self,
        run: Run<'_>,
        user_name: String,
        source: WorkoutSource,
        image_url: Option<String>,
        outcome: WorkoutInsertOutcome,
    ) -> IngestReport {
        let duplicate = outcome.is_duplicate();
        counter!("ingest_outcome_total", "source" => source.as_str()).increment(1);
        info!(
            stage = "ingest",
            message_id = %run.message.message_id,
            user_id = %run.message.user_id,
            source = source.as_str(),
            duplicate,
            candidate_failures = run.diagnostics.errors.len(),
            "workout stored"
        );

        IngestReport {
            message_id: run.message.message_id.clone(),
            user_id: run.message.user_id.clone(),
            user_name,
            source,
            image_url,
            duplicate,
            note: duplicate.then(|| "message already ingested; existing record kept".to_string()),
            diagnostics: run.diagnostics,
        }
    }
}

fn fallback_reason(message: &ClickUpMessage) -> FallbackReason {
    let attachments = &message.attachments;
    if attachments.is_empty() {
        FallbackReason::NoAttachments
    } else if attachments.images.is_empty() {
        FallbackReason::NoUsableImage
    } else {
        FallbackReason::AllCandidatesFailed
    }
}

/// Terminal ingestion failures; everything else degrades to a fallback.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid payload: {0}")]
    Payload(#[from] PayloadError),
    #[error("failed to resolve user {user_id}: {source}")]
    UserResolution {
        user_id: String,
        #[source]
        source: UserMappingError,
    },
    #[error("failed to store fallback record: {error}")]
    FallbackInsert {
        diagnostics: Diagnostics,
        #[source]
        error: WorkoutError,
    },
}

impl IngestError {
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Payload(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Payload(_) => "invalid_payload",
            Self::UserResolution { .. } => "user_resolution_failed",
            Self::FallbackInsert { .. } => "storage_error",
        }
    }

    /// JSON description stored on webhook logs and returned to callers.
    pub fn to_info(&self) -> Value {
        match self {
            Self::FallbackInsert { diagnostics, .. } => json!({
                "error": self.kind(),
                "detail": self.to_string(),
                "diagnostics": diagnostics,
            }),
            _ => json!({
                "error": self.kind(),
                "detail": self.to_string(),
            }),
        }
    }
}
