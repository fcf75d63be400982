//! Meal photo analysis: fetch, detect, crop, estimate, aggregate, persist.

pub mod aggregate;
pub mod detector;
pub mod error;
pub mod estimator;
pub mod image_source;
mod inference;
pub mod orchestrator;
pub mod region;
pub mod repo;
pub mod repo_types;
pub mod types;

pub use error::{AnalysisError, AnalysisResult};
pub use orchestrator::MealAnalyzer;
pub use repo::{AnalysisRepo, PgAnalysisRepo};
