mod ingest;
mod problem;
mod reprocess;
mod router;
mod telemetry;
#[cfg(test)]
mod test_support;
mod webhook;
mod workouts;

use std::{net::SocketAddr, sync::Arc};

use chrono::Utc;
use reqwest::Client;
use tracing::{info, warn};

use clickfit_core::adapter::{DisabledAnalyzer, WorkoutAnalyzer};
use clickfit_providers::{ClickUpClient, GeminiClient};
use clickfit_storage::Database;
use clickfit_util::{load_env_file, AppConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;
    info!(stage = "app", config = ?config, "configuration loaded");

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;

    let http = Client::builder().timeout(config.http_timeout).build()?;

    let analyzer: Arc<dyn WorkoutAnalyzer> = match config.gemini_api_key.clone() {
        Some(api_key) => Arc::new(GeminiClient::new(
            api_key,
            config.gemini_model.clone(),
            config.gemini_base_url.clone(),
            http.clone(),
        )),
        None => {
            warn!(stage = "app", "GEMINI_API_KEY not set; workouts will be stored as minimal records");
            Arc::new(DisabledAnalyzer)
        }
    };
    let fetcher = Arc::new(ClickUpClient::new(config.clickup_api_token.clone(), http));

    if config.webhook_secret.is_none() {
        warn!(stage = "app", "CLICKUP_WEBHOOK_SECRET not set; webhook signatures are not verified");
    }
    let webhook_secret = config
        .webhook_secret
        .as_ref()
        .map(|secret| Arc::from(secret.as_bytes().to_vec().into_boxed_slice()));

    let ingestor = ingest::Ingestor::new(database.clone(), analyzer, fetcher, Arc::new(Utc::now));
    let state = router::AppState::new(metrics, database, webhook_secret, ingestor);

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
