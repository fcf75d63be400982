use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Redirect},
    routing::{get, post},
    Json, Router,
};
use image::ImageFormat;
use tracing::{error, instrument, warn};
use uuid::Uuid;

use super::dto::{
    image_path, AnalyseRequest, JobAccepted, JobView, MealListItem, MealResult, MealStatus,
    Pagination, UploadResponse,
};
use super::services::{
    cancel_active, create_meal_with_image, meal_result, submit_analysis, SubmitError, UploadItem,
};
use crate::analysis::repo_types::Meal;
use crate::analysis::types::MealType;
use crate::auth::extractors::AuthUser;
use crate::state::AppState;
use crate::worker::EnqueueError;

const PRESIGN_SECONDS: u64 = 600;

pub fn read_routes() -> Router<AppState> {
    Router::new()
        .route("/meals", get(list_meals))
        .route("/meals/:id", get(get_meal))
        .route("/meals/:id/image", get(get_meal_image))
        .route("/meals/:id/jobs", get(list_jobs))
}

pub fn write_routes(upload_max_bytes: usize) -> Router<AppState> {
    Router::new()
        .route("/meals", post(upload_meal))
        .route("/meals/:id/analyse", post(reanalyse_meal))
        .route("/meals/:id/cancel", post(cancel_analysis))
        .layer(DefaultBodyLimit::max(upload_max_bytes))
}

type ApiError = (StatusCode, String);

/// POST /meals, multipart with an `image` file and an optional `meal_type`.
#[instrument(skip(state, mp))]
pub async fn upload_meal(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    mut mp: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let mut image = None;
    let mut meal_type = MealType::default();

    while let Some(field) = mp.next_field().await.map_err(bad_multipart)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("image") => {
                let declared = field.content_type().map(str::to_string);
                let body = field.bytes().await.map_err(bad_multipart)?;
                image = Some(validate_image(declared.as_deref(), body)?);
            }
            Some("meal_type") => {
                let text = field.text().await.map_err(bad_multipart)?;
                let text = text.trim();
                if !text.is_empty() {
                    meal_type = text
                        .to_ascii_lowercase()
                        .parse::<MealType>()
                        .map_err(|e| (StatusCode::BAD_REQUEST, format!("{e}")))?;
                }
            }
            _ => {}
        }
    }
    let image = image.ok_or((StatusCode::BAD_REQUEST, "image file is required".to_string()))?;

    let (meal, job) = create_meal_with_image(&state, user_id, image, meal_type)
        .await
        .map_err(submit_error)?;

    let location = format!("/api/v1/meals/{}", meal.id);
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, location)],
        Json(UploadResponse {
            meal_id: meal.id,
            job_id: job.id,
            status: MealStatus::Pending,
            message: "Meal uploaded successfully. Analysis started.".into(),
            image_url: image_path(meal.id),
        }),
    ))
}

/// Accept JPEG or PNG only, judged by the bytes, not the declared type.
fn validate_image(declared: Option<&str>, body: bytes::Bytes) -> Result<UploadItem, ApiError> {
    if let Some(ct) = declared {
        if !ct.starts_with("image/") && ct != "application/octet-stream" {
            return Err((StatusCode::BAD_REQUEST, format!("unsupported content type {ct}")));
        }
    }
    if body.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "image file is empty".into()));
    }
    let content_type = match image::guess_format(&body) {
        Ok(ImageFormat::Jpeg) => "image/jpeg",
        Ok(ImageFormat::Png) => "image/png",
        _ => {
            return Err((
                StatusCode::BAD_REQUEST,
                "image must be a JPEG or PNG file".into(),
            ))
        }
    };
    Ok(UploadItem { body, content_type })
}

#[instrument(skip(state))]
pub async fn list_meals(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Query(p): Query<Pagination>,
) -> Result<Json<Vec<MealListItem>>, ApiError> {
    let (limit, offset) = p.clamped();
    let meals = state
        .repo
        .list_meals(user_id, limit, offset)
        .await
        .map_err(internal)?;
    Ok(Json(meals.into_iter().map(MealListItem::from).collect()))
}

/// Poll endpoint: `pending` until the meal has totals, then the full result.
#[instrument(skip(state))]
pub async fn get_meal(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<MealResult>, ApiError> {
    match meal_result(&state, user_id, id).await.map_err(internal)? {
        Some(result) => Ok(Json(result)),
        None => Err((StatusCode::NOT_FOUND, "Meal not found".into())),
    }
}

/// 307 to a presigned URL of the meal photo.
#[instrument(skip(state))]
pub async fn get_meal_image(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Redirect, ApiError> {
    let meal = owned_meal(&state, user_id, id).await?;
    let url = state
        .storage
        .presign_get(&meal.image_ref, PRESIGN_SECONDS)
        .await
        .map_err(internal)?;
    Ok(Redirect::temporary(&url))
}

#[instrument(skip(state))]
pub async fn list_jobs(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<JobView>>, ApiError> {
    owned_meal(&state, user_id, id).await?;
    let jobs = state.repo.list_jobs(id).await.map_err(internal)?;
    Ok(Json(jobs.into_iter().map(JobView::from).collect()))
}

/// Re-run the pipeline. The body is optional.
#[instrument(skip(state, body))]
pub async fn reanalyse_meal(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<Uuid>,
    body: Option<Json<AnalyseRequest>>,
) -> Result<(StatusCode, Json<JobAccepted>), ApiError> {
    owned_meal(&state, user_id, id).await?;
    let Json(req) = body.unwrap_or_default();
    let job = submit_analysis(&state, id, req.clear_previous)
        .await
        .map_err(submit_error)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(JobAccepted {
            job_id: job.id,
            status: job.status,
        }),
    ))
}

#[instrument(skip(state))]
pub async fn cancel_analysis(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<JobAccepted>), ApiError> {
    owned_meal(&state, user_id, id).await?;
    match cancel_active(&state, id).await.map_err(internal)? {
        Some(job) => Ok((
            StatusCode::ACCEPTED,
            Json(JobAccepted {
                job_id: job.id,
                status: job.status,
            }),
        )),
        None => Err((StatusCode::NOT_FOUND, "no active analysis".into())),
    }
}

/// Meals of other users are reported as missing.
async fn owned_meal(state: &AppState, user_id: Uuid, id: Uuid) -> Result<Meal, ApiError> {
    match state.repo.get_meal(id).await {
        Ok(Some(meal)) if meal.user_id == user_id => Ok(meal),
        Ok(_) => Err((StatusCode::NOT_FOUND, "Meal not found".into())),
        Err(e) => {
            error!(error = %e, %user_id, %id, "meal lookup failed");
            Err((StatusCode::INTERNAL_SERVER_ERROR, "internal error".into()))
        }
    }
}

fn submit_error(e: SubmitError) -> ApiError {
    match e {
        SubmitError::Busy(_) => (StatusCode::CONFLICT, e.to_string()),
        SubmitError::Queue(EnqueueError::Full) | SubmitError::Storage(_) => {
            warn!(error = %e, "analysis submission rejected");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
        SubmitError::Queue(EnqueueError::Closed) | SubmitError::Repo(_) => {
            error!(error = %e, "analysis submission failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error".into())
        }
    }
}

fn bad_multipart(e: MultipartError) -> ApiError {
    (e.status(), e.body_text())
}

fn internal(e: anyhow::Error) -> ApiError {
    error!(error = %e, "request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error".into())
}
