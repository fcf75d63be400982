use anyhow::Context;
use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use super::repo_types::{
    AnalysisJob, AnalysisJobRow, CompletedRun, FoodItem, FoodItemRow, Meal, MealRow,
    MealSnapshot, NewFoodItem, NewMeal, SkippedDish, StartOutcome,
};
use super::types::JobStatus;

/// Durable state behind the pipeline and the poll API.
///
/// Every status change is conditional on the current status, so callers learn
/// about lost races instead of overwriting a terminal job.
#[async_trait]
pub trait AnalysisRepo: Send + Sync {
    async fn create_meal(&self, meal: NewMeal) -> anyhow::Result<Meal>;
    async fn get_meal(&self, meal_id: Uuid) -> anyhow::Result<Option<Meal>>;
    async fn list_meals(&self, user_id: Uuid, limit: i64, offset: i64) -> anyhow::Result<Vec<Meal>>;
    /// Meal, active-job flag and the food items behind its totals, all from
    /// the same snapshot so a concurrent completion cannot mix two runs.
    async fn meal_snapshot(&self, meal_id: Uuid) -> anyhow::Result<Option<MealSnapshot>>;

    async fn create_job(
        &self,
        meal_id: Uuid,
        external_job_id: &str,
        clear_previous: bool,
    ) -> anyhow::Result<AnalysisJob>;
    async fn get_job(&self, job_id: Uuid) -> anyhow::Result<Option<AnalysisJob>>;
    /// Newest first.
    async fn list_jobs(&self, meal_id: Uuid) -> anyhow::Result<Vec<AnalysisJob>>;
    /// The newest PENDING or STARTED job of a meal.
    async fn active_job(&self, meal_id: Uuid) -> anyhow::Result<Option<AnalysisJob>>;
    async fn pending_jobs(&self) -> anyhow::Result<Vec<AnalysisJob>>;

    /// Count one dispatch attempt; returns the new total.
    async fn bump_attempts(&self, job_id: Uuid) -> anyhow::Result<i32>;
    async fn start_job(&self, job_id: Uuid, meal_id: Uuid) -> anyhow::Result<StartOutcome>;
    /// Totals, meal link and SUCCESS in one transaction.
    async fn complete_job(&self, run: CompletedRun) -> anyhow::Result<()>;
    /// Move a PENDING or STARTED job to FAILURE. Returns false if it was already terminal.
    async fn fail_job(
        &self,
        job_id: Uuid,
        message: &str,
        skipped: &[SkippedDish],
    ) -> anyhow::Result<bool>;
    /// Fail every STARTED job; used at boot, when no worker can still own one.
    async fn fail_orphaned_jobs(&self, message: &str) -> anyhow::Result<u64>;

    async fn insert_food_item(
        &self,
        meal_id: Uuid,
        job_id: Uuid,
        item: NewFoodItem,
    ) -> anyhow::Result<FoodItem>;
    /// Ordered by position.
    async fn list_job_food_items(&self, job_id: Uuid) -> anyhow::Result<Vec<FoodItem>>;
    async fn discard_job_food_items(&self, job_id: Uuid) -> anyhow::Result<u64>;
}

const MEAL_COLUMNS: &str = "id, user_id, image_ref, meal_type, total_calories, total_protein, \
     total_carbohydrates, total_fat, total_fiber, total_sugar, analysis_job_id, created_at";

const JOB_COLUMNS: &str = "id, meal_id, external_job_id, status, attempts, clear_previous, \
     error_message, skipped_dishes, created_at, updated_at";

const ITEM_COLUMNS: &str = "id, meal_id, analysis_job_id, position, name, portion_size, \
     calories, protein, carbohydrates, fat, fiber, sugar, created_at";

#[derive(Clone)]
pub struct PgAnalysisRepo {
    db: PgPool,
}

impl PgAnalysisRepo {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

fn meals(rows: Vec<MealRow>) -> anyhow::Result<Vec<Meal>> {
    rows.into_iter().map(Meal::try_from).collect()
}

fn jobs(rows: Vec<AnalysisJobRow>) -> anyhow::Result<Vec<AnalysisJob>> {
    rows.into_iter().map(AnalysisJob::try_from).collect()
}

#[async_trait]
impl AnalysisRepo for PgAnalysisRepo {
    async fn create_meal(&self, meal: NewMeal) -> anyhow::Result<Meal> {
        let row = sqlx::query_as::<_, MealRow>(&format!(
            r#"
            INSERT INTO meals (id, user_id, image_ref, meal_type)
            VALUES ($1, $2, $3, $4)
            RETURNING {MEAL_COLUMNS}
            "#
        ))
        .bind(meal.id)
        .bind(meal.user_id)
        .bind(&meal.image_ref)
        .bind(meal.meal_type.as_str())
        .fetch_one(&self.db)
        .await
        .context("insert meal")?;
        row.try_into()
    }

    async fn get_meal(&self, meal_id: Uuid) -> anyhow::Result<Option<Meal>> {
        let row = sqlx::query_as::<_, MealRow>(&format!(
            "SELECT {MEAL_COLUMNS} FROM meals WHERE id = $1"
        ))
        .bind(meal_id)
        .fetch_optional(&self.db)
        .await
        .context("get meal")?;
        row.map(Meal::try_from).transpose()
    }

    async fn list_meals(&self, user_id: Uuid, limit: i64, offset: i64) -> anyhow::Result<Vec<Meal>> {
        let rows = sqlx::query_as::<_, MealRow>(&format!(
            r#"
            SELECT {MEAL_COLUMNS}
              FROM meals
             WHERE user_id = $1
             ORDER BY created_at DESC
             LIMIT $2 OFFSET $3
            "#
        ))
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.db)
        .await
        .context("list meals")?;
        meals(rows)
    }

    async fn meal_snapshot(&self, meal_id: Uuid) -> anyhow::Result<Option<MealSnapshot>> {
        let mut tx = self.db.begin().await.context("begin tx")?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await
            .context("set snapshot isolation")?;

        let row = sqlx::query_as::<_, MealRow>(&format!(
            "SELECT {MEAL_COLUMNS} FROM meals WHERE id = $1"
        ))
        .bind(meal_id)
        .fetch_optional(&mut *tx)
        .await
        .context("get meal")?;
        let Some(row) = row else {
            tx.commit().await.context("commit tx")?;
            return Ok(None);
        };
        let meal = Meal::try_from(row)?;

        let has_active_job: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM analysis_jobs
                 WHERE meal_id = $1 AND status IN ('PENDING', 'STARTED')
            )
            "#,
        )
        .bind(meal_id)
        .fetch_one(&mut *tx)
        .await
        .context("check active job")?;

        let items = match meal.analysis_job_id {
            Some(job_id) => {
                let rows = sqlx::query_as::<_, FoodItemRow>(&format!(
                    r#"
                    SELECT {ITEM_COLUMNS}
                      FROM food_items
                     WHERE analysis_job_id = $1
                     ORDER BY position ASC
                    "#
                ))
                .bind(job_id)
                .fetch_all(&mut *tx)
                .await
                .context("list food items")?;
                rows.into_iter()
                    .map(FoodItem::try_from)
                    .collect::<anyhow::Result<Vec<_>>>()?
            }
            None => Vec::new(),
        };

        tx.commit().await.context("commit tx")?;
        Ok(Some(MealSnapshot {
            meal,
            has_active_job,
            items,
        }))
    }

    async fn create_job(
        &self,
        meal_id: Uuid,
        external_job_id: &str,
        clear_previous: bool,
    ) -> anyhow::Result<AnalysisJob> {
        let row = sqlx::query_as::<_, AnalysisJobRow>(&format!(
            r#"
            INSERT INTO analysis_jobs (id, meal_id, external_job_id, status, clear_previous)
            VALUES ($1, $2, $3, 'PENDING', $4)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(meal_id)
        .bind(external_job_id)
        .bind(clear_previous)
        .fetch_one(&self.db)
        .await
        .context("insert analysis job")?;
        row.try_into()
    }

    async fn get_job(&self, job_id: Uuid) -> anyhow::Result<Option<AnalysisJob>> {
        let row = sqlx::query_as::<_, AnalysisJobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM analysis_jobs WHERE id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.db)
        .await
        .context("get analysis job")?;
        row.map(AnalysisJob::try_from).transpose()
    }

    async fn list_jobs(&self, meal_id: Uuid) -> anyhow::Result<Vec<AnalysisJob>> {
        let rows = sqlx::query_as::<_, AnalysisJobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
              FROM analysis_jobs
             WHERE meal_id = $1
             ORDER BY created_at DESC
            "#
        ))
        .bind(meal_id)
        .fetch_all(&self.db)
        .await
        .context("list analysis jobs")?;
        jobs(rows)
    }

    async fn active_job(&self, meal_id: Uuid) -> anyhow::Result<Option<AnalysisJob>> {
        let row = sqlx::query_as::<_, AnalysisJobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
              FROM analysis_jobs
             WHERE meal_id = $1 AND status IN ('PENDING', 'STARTED')
             ORDER BY created_at DESC
             LIMIT 1
            "#
        ))
        .bind(meal_id)
        .fetch_optional(&self.db)
        .await
        .context("get active analysis job")?;
        row.map(AnalysisJob::try_from).transpose()
    }

    async fn pending_jobs(&self) -> anyhow::Result<Vec<AnalysisJob>> {
        let rows = sqlx::query_as::<_, AnalysisJobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
              FROM analysis_jobs
             WHERE status = 'PENDING'
             ORDER BY created_at ASC
            "#
        ))
        .fetch_all(&self.db)
        .await
        .context("list pending jobs")?;
        jobs(rows)
    }

    async fn bump_attempts(&self, job_id: Uuid) -> anyhow::Result<i32> {
        let attempts: i32 = sqlx::query_scalar(
            r#"
            UPDATE analysis_jobs
               SET attempts = attempts + 1, updated_at = now()
             WHERE id = $1
         RETURNING attempts
            "#,
        )
        .bind(job_id)
        .fetch_one(&self.db)
        .await
        .context("bump job attempts")?;
        Ok(attempts)
    }

    async fn start_job(&self, job_id: Uuid, meal_id: Uuid) -> anyhow::Result<StartOutcome> {
        // The partial unique index on (meal_id) WHERE status = 'STARTED' backs
        // up the NOT EXISTS guard when two workers race.
        let result = sqlx::query(
            r#"
            UPDATE analysis_jobs
               SET status = 'STARTED', updated_at = now()
             WHERE id = $1
               AND status = 'PENDING'
               AND NOT EXISTS (
                   SELECT 1 FROM analysis_jobs
                    WHERE meal_id = $2 AND status = 'STARTED' AND id <> $1
               )
            "#,
        )
        .bind(job_id)
        .bind(meal_id)
        .execute(&self.db)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 1 => return Ok(StartOutcome::Started),
            Ok(_) => {}
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Ok(StartOutcome::Busy)
            }
            Err(e) => return Err(e).context("start analysis job"),
        }

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM analysis_jobs WHERE id = $1")
                .bind(job_id)
                .fetch_optional(&self.db)
                .await
                .context("read job status")?;
        match status {
            None => anyhow::bail!("analysis job {} not found", job_id),
            Some(s) => match s.parse::<JobStatus>()? {
                JobStatus::Pending => Ok(StartOutcome::Busy),
                other => Ok(StartOutcome::NotPending(other)),
            },
        }
    }

    async fn complete_job(&self, run: CompletedRun) -> anyhow::Result<()> {
        let mut tx = self.db.begin().await.context("begin tx")?;

        let updated = sqlx::query(
            r#"
            UPDATE analysis_jobs
               SET status = 'SUCCESS', skipped_dishes = $2, error_message = NULL,
                   updated_at = now()
             WHERE id = $1 AND status = 'STARTED'
            "#,
        )
        .bind(run.job_id)
        .bind(Json(&run.skipped))
        .execute(&mut *tx)
        .await
        .context("mark job success")?;
        anyhow::ensure!(
            updated.rows_affected() == 1,
            "analysis job {} is no longer STARTED",
            run.job_id
        );

        let t = run.totals;
        sqlx::query(
            r#"
            UPDATE meals
               SET total_calories = $2, total_protein = $3, total_carbohydrates = $4,
                   total_fat = $5, total_fiber = $6, total_sugar = $7,
                   analysis_job_id = $8
             WHERE id = $1
            "#,
        )
        .bind(run.meal_id)
        .bind(t.calories)
        .bind(t.protein)
        .bind(t.carbohydrates)
        .bind(t.fat)
        .bind(t.fiber)
        .bind(t.sugar)
        .bind(run.job_id)
        .execute(&mut *tx)
        .await
        .context("write meal totals")?;

        if run.clear_previous {
            sqlx::query("DELETE FROM food_items WHERE meal_id = $1 AND analysis_job_id <> $2")
                .bind(run.meal_id)
                .bind(run.job_id)
                .execute(&mut *tx)
                .await
                .context("clear previous food items")?;
        }

        tx.commit().await.context("commit tx")?;
        Ok(())
    }

    async fn fail_job(
        &self,
        job_id: Uuid,
        message: &str,
        skipped: &[SkippedDish],
    ) -> anyhow::Result<bool> {
        let done = sqlx::query(
            r#"
            UPDATE analysis_jobs
               SET status = 'FAILURE', error_message = $2, skipped_dishes = $3,
                   updated_at = now()
             WHERE id = $1 AND status IN ('PENDING', 'STARTED')
            "#,
        )
        .bind(job_id)
        .bind(message)
        .bind(Json(skipped))
        .execute(&self.db)
        .await
        .context("mark job failure")?;
        Ok(done.rows_affected() == 1)
    }

    async fn fail_orphaned_jobs(&self, message: &str) -> anyhow::Result<u64> {
        let done = sqlx::query(
            r#"
            UPDATE analysis_jobs
               SET status = 'FAILURE', error_message = $1, updated_at = now()
             WHERE status = 'STARTED'
            "#,
        )
        .bind(message)
        .execute(&self.db)
        .await
        .context("fail orphaned jobs")?;
        Ok(done.rows_affected())
    }

    async fn insert_food_item(
        &self,
        meal_id: Uuid,
        job_id: Uuid,
        item: NewFoodItem,
    ) -> anyhow::Result<FoodItem> {
        let n = item.nutrition;
        let row = sqlx::query_as::<_, FoodItemRow>(&format!(
            r#"
            INSERT INTO food_items (id, meal_id, analysis_job_id, position, name, portion_size,
                                    calories, protein, carbohydrates, fat, fiber, sugar)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING {ITEM_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(meal_id)
        .bind(job_id)
        .bind(item.position)
        .bind(&item.name)
        .bind(item.portion_size.as_str())
        .bind(n.calories)
        .bind(n.protein)
        .bind(n.carbohydrates)
        .bind(n.fat)
        .bind(n.fiber)
        .bind(n.sugar)
        .fetch_one(&self.db)
        .await
        .context("insert food item")?;
        row.try_into()
    }

    async fn list_job_food_items(&self, job_id: Uuid) -> anyhow::Result<Vec<FoodItem>> {
        let rows = sqlx::query_as::<_, FoodItemRow>(&format!(
            r#"
            SELECT {ITEM_COLUMNS}
              FROM food_items
             WHERE analysis_job_id = $1
             ORDER BY position ASC
            "#
        ))
        .bind(job_id)
        .fetch_all(&self.db)
        .await
        .context("list food items")?;
        rows.into_iter().map(FoodItem::try_from).collect()
    }

    async fn discard_job_food_items(&self, job_id: Uuid) -> anyhow::Result<u64> {
        let done = sqlx::query("DELETE FROM food_items WHERE analysis_job_id = $1")
            .bind(job_id)
            .execute(&self.db)
            .await
            .context("discard food items")?;
        Ok(done.rows_affected())
    }
}
