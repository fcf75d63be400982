use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::analysis::repo_types::{AnalysisJob, FoodItem, Meal, SkippedDish};
use crate::analysis::types::{JobStatus, MealType, Nutrition, PortionSize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MealStatus {
    Pending,
    Done,
}

/// Poll payload. Pending meals carry only `status` and `meal_id`.
#[derive(Debug, Serialize)]
pub struct MealResult {
    pub status: MealStatus,
    pub meal_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meal_type: Option<MealType>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub timestamp: Option<OffsetDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_nutrition: Option<Nutrition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub food_items: Option<Vec<FoodItemView>>,
}

#[derive(Debug, Serialize)]
pub struct FoodItemView {
    pub name: String,
    pub portion_size: PortionSize,
    pub nutrition: Nutrition,
}

impl From<FoodItem> for FoodItemView {
    fn from(item: FoodItem) -> Self {
        Self {
            name: item.name,
            portion_size: item.portion_size,
            nutrition: item.nutrition,
        }
    }
}

impl MealResult {
    pub fn pending(meal_id: Uuid) -> Self {
        Self {
            status: MealStatus::Pending,
            meal_id,
            meal_type: None,
            timestamp: None,
            image_url: None,
            total_nutrition: None,
            food_items: None,
        }
    }

    /// `items` must be the rows of the job that produced `totals`.
    pub fn done(meal: &Meal, totals: Nutrition, items: Vec<FoodItem>) -> Self {
        Self {
            status: MealStatus::Done,
            meal_id: meal.id,
            meal_type: Some(meal.meal_type),
            timestamp: Some(meal.created_at),
            image_url: Some(image_path(meal.id)),
            total_nutrition: Some(totals),
            food_items: Some(items.into_iter().map(FoodItemView::from).collect()),
        }
    }
}

/// Stable API path that redirects to a fresh presigned URL.
pub fn image_path(meal_id: Uuid) -> String {
    format!("/api/v1/meals/{}/image", meal_id)
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub meal_id: Uuid,
    pub job_id: Uuid,
    pub status: MealStatus,
    pub message: String,
    pub image_url: String,
}

#[derive(Debug, Serialize)]
pub struct MealListItem {
    pub id: Uuid,
    pub meal_type: MealType,
    pub status: MealStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub total_nutrition: Option<Nutrition>,
}

impl From<Meal> for MealListItem {
    fn from(m: Meal) -> Self {
        Self {
            id: m.id,
            meal_type: m.meal_type,
            status: if m.totals.is_some() {
                MealStatus::Done
            } else {
                MealStatus::Pending
            },
            created_at: m.created_at,
            total_nutrition: m.totals,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Pagination {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    20
}

impl Pagination {
    pub fn clamped(&self) -> (i64, i64) {
        (self.limit.clamp(1, 100), self.offset.max(0))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct AnalyseRequest {
    #[serde(default)]
    pub clear_previous: bool,
}

#[derive(Debug, Serialize)]
pub struct JobAccepted {
    pub job_id: Uuid,
    pub status: JobStatus,
}

#[derive(Debug, Serialize)]
pub struct JobView {
    pub job_id: Uuid,
    pub external_job_id: String,
    pub status: JobStatus,
    pub attempts: i32,
    pub clear_previous: bool,
    pub error: Option<String>,
    pub skipped_dishes: Vec<SkippedDish>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl From<AnalysisJob> for JobView {
    fn from(j: AnalysisJob) -> Self {
        Self {
            job_id: j.id,
            external_job_id: j.external_job_id,
            status: j.status,
            attempts: j.attempts,
            clear_previous: j.clear_previous,
            error: j.error_message,
            skipped_dishes: j.skipped_dishes,
            created_at: j.created_at,
            updated_at: j.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pending_payload_has_only_status_and_id() {
        let id = Uuid::new_v4();
        let v = serde_json::to_value(MealResult::pending(id)).unwrap();
        assert_eq!(v, json!({"status": "pending", "meal_id": id}));
    }

    #[test]
    fn done_payload_shape() {
        let meal = Meal {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            image_ref: "meals/u/m.png".into(),
            meal_type: MealType::Breakfast,
            totals: None,
            analysis_job_id: None,
            created_at: OffsetDateTime::UNIX_EPOCH,
        };
        let totals = Nutrition::from_array([1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let v = serde_json::to_value(MealResult::done(&meal, totals, vec![])).unwrap();
        assert_eq!(v["status"], "done");
        assert_eq!(v["meal_type"], "breakfast");
        assert_eq!(v["timestamp"], "1970-01-01T00:00:00Z");
        assert_eq!(v["total_nutrition"]["carbohydrates"], 3.0);
        assert_eq!(v["food_items"], json!([]));
        assert_eq!(v["image_url"], format!("/api/v1/meals/{}/image", meal.id));
    }

    #[test]
    fn pagination_is_clamped() {
        let p = Pagination { limit: 10_000, offset: -3 };
        assert_eq!(p.clamped(), (100, 0));
    }
}
