use std::sync::Arc;

use futures::{stream, StreamExt, TryStreamExt};
use image::DynamicImage;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::aggregate::aggregate;
use super::detector::DishDetector;
use super::error::{AnalysisError, AnalysisResult};
use super::estimator::NutritionEstimator;
use super::image_source::ImageSource;
use super::region::extract_region_async;
use super::repo::AnalysisRepo;
use super::repo_types::{AnalysisJob, CompletedRun, FoodItem, NewFoodItem, SkippedDish};
use super::types::{Detection, DishEstimate, JobStatus, Nutrition};

/// Summary of a successful run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub job_id: Uuid,
    pub meal_id: Uuid,
    pub dishes_detected: usize,
    pub items_stored: usize,
    pub skipped: Vec<SkippedDish>,
    pub totals: Nutrition,
}

enum DishOutcome {
    Stored(FoodItem),
    Skipped(SkippedDish),
}

struct Analysed {
    dishes_detected: usize,
    items_stored: usize,
    totals: Nutrition,
}

/// Drives one analysis job end to end: fetch, detect, crop and estimate each
/// dish, aggregate, persist.
pub struct MealAnalyzer {
    repo: Arc<dyn AnalysisRepo>,
    images: Arc<dyn ImageSource>,
    detector: Arc<dyn DishDetector>,
    estimator: Arc<dyn NutritionEstimator>,
    dish_concurrency: usize,
}

impl MealAnalyzer {
    pub fn new(
        repo: Arc<dyn AnalysisRepo>,
        images: Arc<dyn ImageSource>,
        detector: Arc<dyn DishDetector>,
        estimator: Arc<dyn NutritionEstimator>,
        dish_concurrency: usize,
    ) -> Self {
        Self {
            repo,
            images,
            detector,
            estimator,
            dish_concurrency: dish_concurrency.max(1),
        }
    }

    /// Run a job the caller has already moved to STARTED and drive it to a
    /// terminal state.
    ///
    /// Returns the error that failed the job, after it has been recorded.
    #[instrument(skip(self, job, cancel), fields(job_id = %job.id, meal_id = %job.meal_id))]
    pub async fn run(&self, job: &AnalysisJob, cancel: &CancellationToken) -> AnalysisResult<RunReport> {
        if !job.status.can_transition_to(JobStatus::Success) {
            return Err(AnalysisError::Persistence(format!(
                "job {} is {}, expected STARTED",
                job.id, job.status
            )));
        }

        let mut skipped = Vec::new();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AnalysisError::Cancelled),
            r = self.analyse(job, &mut skipped) => r,
        };

        let analysed = match result {
            Ok(a) => a,
            Err(e) => return self.fail(job, e, &skipped).await,
        };

        let run = CompletedRun {
            job_id: job.id,
            meal_id: job.meal_id,
            totals: analysed.totals,
            skipped: skipped.clone(),
            clear_previous: job.clear_previous,
        };
        // Last point a cancel is honoured. Once the completion write is issued
        // the job commits as SUCCESS even if a cancel lands meanwhile.
        if cancel.is_cancelled() {
            return self.fail(job, AnalysisError::Cancelled, &skipped).await;
        }
        if let Err(e) = self.repo.complete_job(run).await {
            return self
                .fail(job, AnalysisError::persistence(format!("{e:#}")), &skipped)
                .await;
        }

        info!(
            dishes = analysed.dishes_detected,
            stored = analysed.items_stored,
            skipped = skipped.len(),
            calories = analysed.totals.calories,
            "meal analysed"
        );
        Ok(RunReport {
            job_id: job.id,
            meal_id: job.meal_id,
            dishes_detected: analysed.dishes_detected,
            items_stored: analysed.items_stored,
            skipped,
            totals: analysed.totals,
        })
    }

    async fn analyse(
        &self,
        job: &AnalysisJob,
        skipped: &mut Vec<SkippedDish>,
    ) -> AnalysisResult<Analysed> {
        let meal = self
            .repo
            .get_meal(job.meal_id)
            .await
            .map_err(|e| AnalysisError::persistence(format!("{e:#}")))?
            .ok_or_else(|| AnalysisError::Persistence(format!("meal {} not found", job.meal_id)))?;

        let image = self.images.fetch(&meal.image_ref).await?;
        let detections = self.detector.detect(&image).await?;
        let dishes_detected = detections.len();

        let outcomes: Vec<DishOutcome> = stream::iter(detections.into_iter().enumerate())
            .map(|(index, dish)| {
                let pixels = image.pixels.clone();
                async move {
                    let position = dish_position(index)?;
                    self.process_dish(job, pixels, position, dish).await
                }
            })
            .buffer_unordered(self.dish_concurrency)
            .try_collect()
            .await?;

        let mut items_stored = 0;
        for outcome in outcomes {
            match outcome {
                DishOutcome::Stored(_) => items_stored += 1,
                DishOutcome::Skipped(s) => skipped.push(s),
            }
        }
        skipped.sort_by_key(|s| s.position);

        let items = self
            .repo
            .list_job_food_items(job.id)
            .await
            .map_err(|e| AnalysisError::persistence(format!("{e:#}")))?;
        if items.len() != items_stored {
            return Err(AnalysisError::Persistence(format!(
                "expected {} food items for job, found {}",
                items_stored,
                items.len()
            )));
        }
        let totals = aggregate(items.iter().map(|i| &i.nutrition))?;

        Ok(Analysed {
            dishes_detected,
            items_stored,
            totals,
        })
    }

    /// Crop, estimate and store one dish. Per-dish failures become a skip;
    /// persistence failures propagate and end the run.
    async fn process_dish(
        &self,
        job: &AnalysisJob,
        pixels: Arc<DynamicImage>,
        position: i32,
        dish: Detection,
    ) -> AnalysisResult<DishOutcome> {
        let estimate = match self.crop_and_estimate(pixels, &dish).await {
            Ok(e) => e,
            Err(e) if e.is_per_dish() => {
                warn!(
                    position,
                    dish = %dish.label,
                    stage = e.stage().as_str(),
                    error = %e,
                    "dish skipped"
                );
                return Ok(DishOutcome::Skipped(SkippedDish {
                    position,
                    label: dish.label,
                    stage: e.stage().as_str().to_string(),
                    kind: e.kind().to_string(),
                    error: e.to_string(),
                }));
            }
            Err(e) => return Err(e),
        };

        let item = self
            .repo
            .insert_food_item(
                job.meal_id,
                job.id,
                NewFoodItem {
                    position,
                    name: dish.label,
                    portion_size: estimate.portion,
                    nutrition: estimate.nutrition,
                },
            )
            .await
            .map_err(|e| AnalysisError::persistence(format!("{e:#}")))?;
        Ok(DishOutcome::Stored(item))
    }

    async fn crop_and_estimate(
        &self,
        pixels: Arc<DynamicImage>,
        dish: &Detection,
    ) -> AnalysisResult<DishEstimate> {
        let crop = extract_region_async(pixels, dish.bbox).await?;
        self.estimator.estimate(&crop, &dish.label).await
    }

    async fn fail(
        &self,
        job: &AnalysisJob,
        err: AnalysisError,
        skipped: &[SkippedDish],
    ) -> AnalysisResult<RunReport> {
        error!(stage = err.stage().as_str(), kind = err.kind(), error = %err, "analysis failed");

        // Rows of a failed run are never shown, but drop them so the table
        // only holds rows of runs that produced totals.
        match self.repo.discard_job_food_items(job.id).await {
            Ok(0) => {}
            Ok(n) => info!(discarded = n, "food items of failed run discarded"),
            Err(e) => warn!(error = %e, "could not discard food items of failed run"),
        }

        match self.repo.fail_job(job.id, &err.to_string(), skipped).await {
            Ok(true) => {}
            Ok(false) => warn!("job was already terminal when recording failure"),
            Err(e) => error!(error = %e, "could not record job failure"),
        }
        Err(err)
    }
}

/// Detection index as stored in `food_items.position`.
fn dish_position(index: usize) -> AnalysisResult<i32> {
    i32::try_from(index)
        .map_err(|_| AnalysisError::DetectionParse(format!("detection index {index} out of range")))
}
