use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use super::types::{JobStatus, MealType, Nutrition, PortionSize};

/// A meal photo and, once analysed, its nutrition totals.
///
/// `totals` and `analysis_job_id` are set together by the job that produced
/// them; a meal never carries a partial set of totals.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Meal {
    pub id: Uuid,
    pub user_id: Uuid,
    pub image_ref: String,
    pub meal_type: MealType,
    pub totals: Option<Nutrition>,
    pub analysis_job_id: Option<Uuid>,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewMeal {
    pub id: Uuid,
    pub user_id: Uuid,
    pub image_ref: String,
    pub meal_type: MealType,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FoodItem {
    pub id: Uuid,
    pub meal_id: Uuid,
    pub analysis_job_id: Uuid,
    pub position: i32,
    pub name: String,
    pub portion_size: PortionSize,
    pub nutrition: Nutrition,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewFoodItem {
    pub position: i32,
    pub name: String,
    pub portion_size: PortionSize,
    pub nutrition: Nutrition,
}

/// Why one detected dish did not make it into the totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedDish {
    pub position: i32,
    pub label: String,
    pub stage: String,
    pub kind: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisJob {
    pub id: Uuid,
    pub meal_id: Uuid,
    pub external_job_id: String,
    pub status: JobStatus,
    pub attempts: i32,
    pub clear_previous: bool,
    pub error_message: Option<String>,
    pub skipped_dishes: Vec<SkippedDish>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Result of trying to move a job from PENDING to STARTED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// Another job for the same meal is STARTED.
    Busy,
    /// The job is no longer PENDING (cancelled, or already handled).
    NotPending(JobStatus),
}

/// Everything written when a run succeeds.
#[derive(Debug, Clone)]
pub struct CompletedRun {
    pub job_id: Uuid,
    pub meal_id: Uuid,
    pub totals: Nutrition,
    pub skipped: Vec<SkippedDish>,
    pub clear_previous: bool,
}

/// A meal read in one snapshot together with what the poll needs to render it.
#[derive(Debug, Clone)]
pub struct MealSnapshot {
    pub meal: Meal,
    /// A PENDING or STARTED job exists for the meal.
    pub has_active_job: bool,
    /// Rows of `meal.analysis_job_id`, ordered by position.
    pub items: Vec<FoodItem>,
}

// ---- rows ----

#[derive(Debug, FromRow)]
pub struct MealRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub image_ref: String,
    pub meal_type: String,
    pub total_calories: Option<f64>,
    pub total_protein: Option<f64>,
    pub total_carbohydrates: Option<f64>,
    pub total_fat: Option<f64>,
    pub total_fiber: Option<f64>,
    pub total_sugar: Option<f64>,
    pub analysis_job_id: Option<Uuid>,
    pub created_at: OffsetDateTime,
}

impl TryFrom<MealRow> for Meal {
    type Error = anyhow::Error;

    fn try_from(r: MealRow) -> Result<Self, Self::Error> {
        let fields = [
            r.total_calories,
            r.total_protein,
            r.total_carbohydrates,
            r.total_fat,
            r.total_fiber,
            r.total_sugar,
        ];
        let totals = match fields {
            [Some(a), Some(b), Some(c), Some(d), Some(e), Some(f)] => {
                Some(Nutrition::from_array([a, b, c, d, e, f]))
            }
            [None, None, None, None, None, None] => None,
            _ => anyhow::bail!("meal {} has partially set totals", r.id),
        };
        Ok(Self {
            id: r.id,
            user_id: r.user_id,
            image_ref: r.image_ref,
            meal_type: r.meal_type.parse()?,
            totals,
            analysis_job_id: r.analysis_job_id,
            created_at: r.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub struct FoodItemRow {
    pub id: Uuid,
    pub meal_id: Uuid,
    pub analysis_job_id: Uuid,
    pub position: i32,
    pub name: String,
    pub portion_size: String,
    pub calories: f64,
    pub protein: f64,
    pub carbohydrates: f64,
    pub fat: f64,
    pub fiber: f64,
    pub sugar: f64,
    pub created_at: OffsetDateTime,
}

impl TryFrom<FoodItemRow> for FoodItem {
    type Error = anyhow::Error;

    fn try_from(r: FoodItemRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: r.id,
            meal_id: r.meal_id,
            analysis_job_id: r.analysis_job_id,
            position: r.position,
            name: r.name,
            portion_size: r.portion_size.parse()?,
            nutrition: Nutrition::from_array([
                r.calories,
                r.protein,
                r.carbohydrates,
                r.fat,
                r.fiber,
                r.sugar,
            ]),
            created_at: r.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub struct AnalysisJobRow {
    pub id: Uuid,
    pub meal_id: Uuid,
    pub external_job_id: String,
    pub status: String,
    pub attempts: i32,
    pub clear_previous: bool,
    pub error_message: Option<String>,
    pub skipped_dishes: Json<Vec<SkippedDish>>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl TryFrom<AnalysisJobRow> for AnalysisJob {
    type Error = anyhow::Error;

    fn try_from(r: AnalysisJobRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: r.id,
            meal_id: r.meal_id,
            external_job_id: r.external_job_id,
            status: r.status.parse()?,
            attempts: r.attempts,
            clear_previous: r.clear_previous,
            error_message: r.error_message,
            skipped_dishes: r.skipped_dishes.0,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> MealRow {
        MealRow {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            image_ref: "meals/a.png".into(),
            meal_type: "dinner".into(),
            total_calories: None,
            total_protein: None,
            total_carbohydrates: None,
            total_fat: None,
            total_fiber: None,
            total_sugar: None,
            analysis_job_id: None,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn all_null_totals_map_to_none() {
        let meal = Meal::try_from(row()).unwrap();
        assert_eq!(meal.totals, None);
        assert_eq!(meal.meal_type, MealType::Dinner);
    }

    #[test]
    fn all_set_totals_map_to_some() {
        let mut r = row();
        r.total_calories = Some(1.0);
        r.total_protein = Some(2.0);
        r.total_carbohydrates = Some(3.0);
        r.total_fat = Some(4.0);
        r.total_fiber = Some(5.0);
        r.total_sugar = Some(6.0);
        let meal = Meal::try_from(r).unwrap();
        assert_eq!(meal.totals.unwrap().to_array(), [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn partial_totals_are_rejected() {
        let mut r = row();
        r.total_calories = Some(1.0);
        assert!(Meal::try_from(r).is_err());
    }

    #[test]
    fn unknown_meal_type_is_rejected() {
        let mut r = row();
        r.meal_type = "brunch".into();
        assert!(Meal::try_from(r).is_err());
    }
}
