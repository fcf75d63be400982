use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

mod analysis;
mod app;
mod auth;
mod config;
mod db;
mod meals;
mod state;
mod storage;
#[cfg(test)]
mod testing;
mod worker;

use crate::analysis::detector::HttpDishDetector;
use crate::analysis::estimator::HttpNutritionEstimator;
use crate::analysis::image_source::StoreImageSource;
use crate::analysis::MealAnalyzer;
use crate::config::AppConfig;
use crate::state::AppState;
use crate::storage::{Storage, StorageClient};
use crate::worker::{Dispatcher, JobQueue};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "mealscan=debug,axum=info,tower_http=info".to_string());
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let config = Arc::new(AppConfig::from_env()?);

    let db = db::connect(&config.database_url).await?;
    db::migrate(&db).await?;

    let storage = Arc::new(Storage::new(&config.storage).await?) as Arc<dyn StorageClient>;

    let (queue, rx) = JobQueue::new(config.analysis.queue_capacity);
    let state = AppState::init(config.clone(), db, storage.clone(), queue.clone());

    let analyzer = Arc::new(MealAnalyzer::new(
        state.repo.clone(),
        Arc::new(StoreImageSource::new(storage, config.analysis.fetch_timeout)?),
        Arc::new(HttpDishDetector::new(&config.detector).context("detector client")?),
        Arc::new(HttpNutritionEstimator::new(&config.estimator).context("estimator client")?),
        config.analysis.dish_concurrency,
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        queue.clone(),
        state.repo.clone(),
        analyzer,
        &config.analysis,
    ));

    let shutdown = CancellationToken::new();
    let workers = worker::spawn_workers(dispatcher, rx, config.analysis.workers, shutdown.clone());
    worker::recover(state.repo.clone(), queue).await?;
    tracing::info!(workers = workers.len(), "analysis workers running");

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "could not listen for shutdown signal");
            }
            tracing::info!("shutdown requested");
            shutdown.cancel();
        }
    });

    app::serve(app::build_app(state), shutdown.clone()).await?;

    shutdown.cancel();
    for handle in workers {
        let _ = handle.await;
    }
    Ok(())
}
