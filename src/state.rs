use crate::analysis::{AnalysisRepo, PgAnalysisRepo};
use crate::config::AppConfig;
use crate::storage::StorageClient;
use crate::worker::JobQueue;
use sqlx::PgPool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub storage: Arc<dyn StorageClient>,
    pub repo: Arc<dyn AnalysisRepo>,
    pub queue: JobQueue,
}

impl AppState {
    pub fn init(
        config: Arc<AppConfig>,
        db: PgPool,
        storage: Arc<dyn StorageClient>,
        queue: JobQueue,
    ) -> Self {
        let repo = Arc::new(PgAnalysisRepo::new(db)) as Arc<dyn AnalysisRepo>;
        Self::from_parts(config, storage, repo, queue)
    }

    pub fn from_parts(
        config: Arc<AppConfig>,
        storage: Arc<dyn StorageClient>,
        repo: Arc<dyn AnalysisRepo>,
        queue: JobQueue,
    ) -> Self {
        Self {
            config,
            storage,
            repo,
            queue,
        }
    }
}
