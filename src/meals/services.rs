use bytes::Bytes;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use super::dto::MealResult;
use crate::analysis::repo_types::{AnalysisJob, Meal, NewMeal};
use crate::analysis::types::MealType;
use crate::state::AppState;
use crate::storage::meal_image_key;
use crate::worker::{correlation_id, EnqueueError};

pub struct UploadItem {
    pub body: Bytes,
    pub content_type: &'static str,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("analysis job {0} is still running for this meal")]
    Busy(Uuid),
    #[error("blob storage unavailable: {0:#}")]
    Storage(anyhow::Error),
    #[error(transparent)]
    Queue(#[from] EnqueueError),
    #[error(transparent)]
    Repo(#[from] anyhow::Error),
}

/// Store the photo, create its meal and queue the first analysis.
pub async fn create_meal_with_image(
    state: &AppState,
    user_id: Uuid,
    image: UploadItem,
    meal_type: MealType,
) -> Result<(Meal, AnalysisJob), SubmitError> {
    let meal_id = Uuid::new_v4();
    let key = meal_image_key(user_id, meal_id, image.content_type);
    state
        .storage
        .put_object(&key, image.body, image.content_type)
        .await
        .map_err(SubmitError::Storage)?;

    let meal = match state
        .repo
        .create_meal(NewMeal {
            id: meal_id,
            user_id,
            image_ref: key.clone(),
            meal_type,
        })
        .await
    {
        Ok(meal) => meal,
        Err(e) => {
            if let Err(del) = state.storage.delete_object(&key).await {
                warn!(error = %del, %key, "could not remove orphaned upload");
            }
            return Err(SubmitError::Repo(e));
        }
    };

    let job = submit_analysis(state, meal.id, false).await?;
    Ok((meal, job))
}

/// Create a PENDING job for `meal_id` and queue it.
///
/// A job that cannot be queued is failed right away so it never lingers as PENDING.
pub async fn submit_analysis(
    state: &AppState,
    meal_id: Uuid,
    clear_previous: bool,
) -> Result<AnalysisJob, SubmitError> {
    if let Some(active) = state.repo.active_job(meal_id).await? {
        return Err(SubmitError::Busy(active.id));
    }

    let job = state
        .repo
        .create_job(meal_id, &correlation_id(), clear_previous)
        .await?;

    if let Err(e) = state.queue.enqueue(job.id) {
        warn!(job_id = %job.id, error = %e, "could not queue analysis");
        state.repo.fail_job(job.id, &e.to_string(), &[]).await?;
        return Err(e.into());
    }

    info!(%meal_id, job_id = %job.id, external_job_id = %job.external_job_id, "analysis queued");
    Ok(job)
}

/// Cancel the meal's active job, if any.
pub async fn cancel_active(state: &AppState, meal_id: Uuid) -> anyhow::Result<Option<AnalysisJob>> {
    let Some(job) = state.repo.active_job(meal_id).await? else {
        return Ok(None);
    };

    // A worker holding the job records the failure itself; otherwise it is
    // still waiting in the queue and can be failed directly.
    if !state.queue.cancel(job.id) {
        state.repo.fail_job(job.id, "analysis cancelled", &[]).await?;
    }
    info!(%meal_id, job_id = %job.id, "analysis cancellation requested");
    Ok(Some(job))
}

/// Build the poll payload for one of `user_id`'s meals from a single
/// consistent read. A meal with a queued or running analysis reports pending,
/// even when an earlier run left totals behind.
pub async fn meal_result(
    state: &AppState,
    user_id: Uuid,
    meal_id: Uuid,
) -> anyhow::Result<Option<MealResult>> {
    let Some(snapshot) = state.repo.meal_snapshot(meal_id).await? else {
        return Ok(None);
    };
    if snapshot.meal.user_id != user_id {
        return Ok(None);
    }
    let result = match snapshot.meal.totals {
        Some(totals) if !snapshot.has_active_job => {
            MealResult::done(&snapshot.meal, totals, snapshot.items)
        }
        _ => MealResult::pending(meal_id),
    };
    Ok(Some(result))
}
