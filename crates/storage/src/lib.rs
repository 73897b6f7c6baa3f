use std::{borrow::Cow, str::FromStr, time::Duration};

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::Serialize;
use sqlx::{
    migrate::MigrateError,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    QueryBuilder, Row, Sqlite, SqlitePool,
};
use thiserror::Error;
use uuid::Uuid;

use clickfit_core::types::NormalizedWorkout;

/// SQLite extended result codes that signal a uniqueness violation.
const SQLITE_CONSTRAINT_UNIQUE: &str = "2067";
const SQLITE_CONSTRAINT_PRIMARYKEY: &str = "1555";

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StorageError::Options)?
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(5000));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(StorageError::Connect)?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle for the ClickUp user to display name mapping.
    pub fn team_users(&self) -> UserMappingRepository {
        UserMappingRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for persisted workouts.
    pub fn workouts(&self) -> WorkoutRepository {
        WorkoutRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for the raw webhook delivery log.
    pub fn webhook_logs(&self) -> WebhookLogRepository {
        WebhookLogRepository {
            pool: self.pool.clone(),
        }
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid sqlite connection options: {0}")]
    Options(sqlx::Error),
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => matches!(
            db_err.code().as_deref(),
            Some(SQLITE_CONSTRAINT_UNIQUE) | Some(SQLITE_CONSTRAINT_PRIMARYKEY)
        ),
        _ => false,
    }
}

/// Repository for the `team_users` table.
#[derive(Clone)]
pub struct UserMappingRepository {
    pool: SqlitePool,
}

impl UserMappingRepository {
    /// Looks up the display name stored for a ClickUp user id.
    pub async fn fetch_name(&self, user_id: &str) -> Result<Option<String>, UserMappingError> {
        let row = sqlx::query("SELECT user_name FROM team_users WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| row.get("user_name")))
    }

    /// Inserts the mapping when absent and returns the name the table holds
    /// afterwards.
    ///
    /// A single upsert statement keeps concurrent first sightings of the same
    /// user from tripping the primary key; an existing name is never replaced.
    pub async fn ensure(
        &self,
        user_id: &str,
        placeholder_name: &str,
        now: DateTime<Utc>,
    ) -> Result<String, UserMappingError> {
        let timestamp = to_rfc3339(now);
        let row = sqlx::query(
            "INSERT INTO team_users (user_id, user_name, created_at, updated_at) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(user_id) DO UPDATE SET user_name = team_users.user_name \
             RETURNING user_name",
        )
        .bind(user_id)
        .bind(placeholder_name)
        .bind(&timestamp)
        .bind(&timestamp)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("user_name"))
    }
}

/// Errors that can occur while resolving user mappings.
#[derive(Debug, Error)]
pub enum UserMappingError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository responsible for the `workouts` table.
#[derive(Clone)]
pub struct WorkoutRepository {
    pool: SqlitePool,
}

impl WorkoutRepository {
    /// Inserts a workout; a second insert for the same ClickUp message id
    /// reports [`WorkoutInsertOutcome::Duplicate`] instead of failing.
    pub async fn insert(&self, record: NewWorkout<'_>) -> Result<WorkoutInsertOutcome, WorkoutError> {
        let workout = record.workout;
        let result = sqlx::query(
            "INSERT INTO workouts \
             (id, user_id, activity_type, date, duration_minutes, calories_burned, heart_rate_avg, \
              distance_km, raw_message, image_url, clickup_message_id, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(record.user_id)
        .bind(&workout.activity_type)
        .bind(record.date)
        .bind(i64::from(workout.duration_minutes))
        .bind(i64::from(workout.calories_burned))
        .bind(workout.heart_rate_avg.map(i64::from))
        .bind(workout.distance_km)
        .bind(record.raw_message)
        .bind(record.image_url)
        .bind(record.clickup_message_id)
        .bind(to_rfc3339(record.created_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(WorkoutInsertOutcome::Inserted),
            Err(err) if is_unique_violation(&err) => Ok(WorkoutInsertOutcome::Duplicate),
            Err(err) => Err(WorkoutError::Database(err)),
        }
    }

    /// Returns the ClickUp message id a workout was ingested from.
    pub async fn message_id_for(&self, workout_id: &str) -> Result<Option<String>, WorkoutError> {
        let row = sqlx::query("SELECT clickup_message_id FROM workouts WHERE id = ?")
            .bind(workout_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.get("clickup_message_id")))
    }

    /// Lists the most recent workouts together with the author's display name.
    pub async fn list_recent(&self, limit: i64) -> Result<Vec<WorkoutWithUser>, WorkoutError> {
        let rows = sqlx::query_as::<_, WorkoutWithUser>(
            r#"
SELECT w.id,
       w.user_id,
       COALESCE(u.user_name, 'user-' || w.user_id) AS user_name,
       w.activity_type,
       w.date,
       w.duration_minutes,
       w.calories_burned,
       w.heart_rate_avg,
       w.distance_km,
       w.raw_message,
       w.image_url,
       w.clickup_message_id,
       w.created_at
  FROM workouts AS w
  LEFT JOIN team_users AS u
    ON u.user_id = w.user_id
 ORDER BY w.created_at DESC, w.id
 LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Aggregates workouts per user, highest calorie total first.
    pub async fn user_totals(&self) -> Result<Vec<UserTotals>, WorkoutError> {
        let rows = sqlx::query_as::<_, UserTotals>(
            r#"
SELECT w.user_id,
       COALESCE(u.user_name, 'user-' || w.user_id) AS user_name,
       COUNT(*) AS workout_count,
       COALESCE(SUM(w.duration_minutes), 0) AS total_duration_minutes,
       COALESCE(SUM(w.calories_burned), 0) AS total_calories,
       COALESCE(SUM(w.distance_km), 0.0) AS total_distance_km
  FROM workouts AS w
  LEFT JOIN team_users AS u
    ON u.user_id = w.user_id
 GROUP BY w.user_id
 ORDER BY total_calories DESC, w.user_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

/// Data required to create a new entry in `workouts`.
#[derive(Clone)]
pub struct NewWorkout<'a> {
    pub id: Cow<'a, str>,
    pub user_id: &'a str,
    pub workout: &'a NormalizedWorkout,
    pub date: NaiveDate,
    pub raw_message: &'a str,
    pub image_url: Option<&'a str>,
    pub clickup_message_id: &'a str,
    pub created_at: DateTime<Utc>,
}

impl<'a> NewWorkout<'a> {
    pub fn with_generated_id(self) -> Self {
        Self {
            id: Cow::Owned(Uuid::new_v4().to_string()),
            ..self
        }
    }
}

/// Result of attempting to insert into `workouts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkoutInsertOutcome {
    Inserted,
    Duplicate,
}

impl WorkoutInsertOutcome {
    pub fn is_duplicate(self) -> bool {
        matches!(self, Self::Duplicate)
    }
}

/// Error type for operations on the `workouts` repository.
#[derive(Debug, Error)]
pub enum WorkoutError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Workout row joined with the author's display name.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WorkoutWithUser {
    pub id: String,
    pub user_id: String,
    pub user_name: String,
    pub activity_type: String,
    pub date: NaiveDate,
    pub duration_minutes: i64,
    pub calories_burned: i64,
    pub heart_rate_avg: Option<i64>,
    pub distance_km: Option<f64>,
    pub raw_message: String,
    pub image_url: Option<String>,
    pub clickup_message_id: String,
    pub created_at: DateTime<Utc>,
}

/// Per-user aggregate over all stored workouts.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct UserTotals {
    pub user_id: String,
    pub user_name: String,
    pub workout_count: i64,
    pub total_duration_minutes: i64,
    pub total_calories: i64,
    pub total_distance_km: f64,
}

/// Repository for the `webhook_logs` table.
#[derive(Clone)]
pub struct WebhookLogRepository {
    pool: SqlitePool,
}

const WEBHOOK_LOG_COLUMNS: &str = "id, message_id, body, valid_signature, created_at, \
                                   processed_at, last_error, reprocess_attempts";

impl WebhookLogRepository {
    /// Stores a raw delivery and returns its row id.
    pub async fn insert(&self, record: NewWebhookLog<'_>) -> Result<i64, WebhookLogError> {
        let row = sqlx::query(
            "INSERT INTO webhook_logs (message_id, headers_json, body, valid_signature, created_at) \
             VALUES (?, ?, ?, ?, ?) \
             RETURNING id",
        )
        .bind(record.message_id)
        .bind(record.headers_json)
        .bind(record.body)
        .bind(record.valid_signature)
        .bind(to_rfc3339(record.received_at))
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("id"))
    }

    /// Records the outcome of the live processing run.
    pub async fn record_result(
        &self,
        id: i64,
        result: ProcessingResult<'_>,
    ) -> Result<(), WebhookLogError> {
        let (processed_at, last_error) = result.columns();
        sqlx::query("UPDATE webhook_logs SET processed_at = ?, last_error = ? WHERE id = ?")
            .bind(processed_at)
            .bind(last_error)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Records the outcome of a reprocess run and bumps the attempt counter.
    pub async fn record_reprocess(
        &self,
        id: i64,
        result: ProcessingResult<'_>,
    ) -> Result<i64, WebhookLogError> {
        let (processed_at, last_error) = result.columns();
        let row = sqlx::query(
            "UPDATE webhook_logs \
             SET reprocess_attempts = reprocess_attempts + 1, \
                 processed_at = ?, \
                 last_error = ? \
             WHERE id = ? \
             RETURNING reprocess_attempts",
        )
        .bind(processed_at)
        .bind(last_error)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| row.get("reprocess_attempts"))
            .ok_or(WebhookLogError::NotFound(id))
    }

    /// Loads the rows with the given ids, ordered by id.
    pub async fn fetch_by_ids(&self, ids: &[i64]) -> Result<Vec<WebhookLogRow>, WebhookLogError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {WEBHOOK_LOG_COLUMNS} FROM webhook_logs WHERE id IN ("
        ));
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(") ORDER BY id");

        let rows = builder
            .build_query_as::<WebhookLogRow>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Loads every delivery recorded for a ClickUp message id.
    pub async fn fetch_by_message_id(
        &self,
        message_id: &str,
    ) -> Result<Vec<WebhookLogRow>, WebhookLogError> {
        let rows = sqlx::query_as::<_, WebhookLogRow>(&format!(
            "SELECT {WEBHOOK_LOG_COLUMNS} FROM webhook_logs WHERE message_id = ? ORDER BY id"
        ))
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Lists rows matching a reprocess filter, oldest first.
    pub async fn list_filtered(
        &self,
        filter: &WebhookLogFilter,
    ) -> Result<Vec<WebhookLogRow>, WebhookLogError> {
        let since = filter.since.map(to_rfc3339);
        let rows = sqlx::query_as::<_, WebhookLogRow>(&format!(
            "SELECT {WEBHOOK_LOG_COLUMNS} FROM webhook_logs \
             WHERE (? IS NULL OR created_at >= ?) \
               AND (? = 0 OR processed_at IS NULL) \
             ORDER BY id \
             LIMIT ?"
        ))
        .bind(&since)
        .bind(&since)
        .bind(filter.only_unprocessed)
        .bind(filter.limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

/// Data required to log a raw webhook delivery.
pub struct NewWebhookLog<'a> {
    pub message_id: Option<&'a str>,
    pub headers_json: &'a str,
    pub body: &'a str,
    pub valid_signature: bool,
    pub received_at: DateTime<Utc>,
}

/// Outcome written back onto a webhook log row.
#[derive(Debug, Clone, Copy)]
pub enum ProcessingResult<'a> {
    Processed { at: DateTime<Utc> },
    Failed { error: &'a str },
}

impl ProcessingResult<'_> {
    fn columns(&self) -> (Option<String>, Option<&str>) {
        match self {
            Self::Processed { at } => (Some(to_rfc3339(*at)), None),
            Self::Failed { error } => (None, Some(*error)),
        }
    }
}

/// Selection criteria for batch reprocessing.
#[derive(Debug, Clone)]
pub struct WebhookLogFilter {
    pub since: Option<DateTime<Utc>>,
    pub only_unprocessed: bool,
    pub limit: i64,
}

/// Stored raw delivery.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WebhookLogRow {
    pub id: i64,
    pub message_id: Option<String>,
    pub body: String,
    pub valid_signature: bool,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub reprocess_attempts: i64,
}

/// Errors that can occur on the webhook log.
#[derive(Debug, Error)]
pub enum WebhookLogError {
    #[error("webhook log {0} does not exist")]
    NotFound(i64),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}
