use std::time::Duration;

use thiserror::Error;

/// Every way one analysis run can go wrong.
///
/// Variants carry the message that ends up in `analysis_jobs.error_message`,
/// so the `Display` text is written for humans reading job history.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("image fetch failed: {0}")]
    Fetch(String),

    #[error("image decode failed: {0}")]
    Decode(String),

    #[error("bounding box ({x}, {y}, {width}, {height}) lies outside the {image_width}x{image_height} image")]
    EmptyRegion {
        x: f64,
        y: f64,
        width: f64,
        height: f64,
        image_width: u32,
        image_height: u32,
    },

    #[error("dish crop could not be encoded: {0}")]
    RegionEncode(String),

    #[error("detection service error: {0}")]
    DetectionService(String),

    #[error("detection service timed out after {0:?}")]
    DetectionTimeout(Duration),

    #[error("detection response invalid: {0}")]
    DetectionParse(String),

    #[error("nutrition service error: {0}")]
    EstimationService(String),

    #[error("nutrition service timed out after {0:?}")]
    EstimationTimeout(Duration),

    #[error("nutrition response invalid: {0}")]
    EstimationParse(String),

    #[error("aggregation failed: {0}")]
    Aggregation(String),

    #[error("persistence failed: {0}")]
    Persistence(String),

    #[error("analysis cancelled")]
    Cancelled,

    #[error("another analysis is already running for meal {0}")]
    Conflict(uuid::Uuid),
}

/// Pipeline stage an error originated in; used for log fields and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetch,
    Crop,
    Detect,
    Estimate,
    Aggregate,
    Persist,
    Dispatch,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Fetch => "fetch",
            Stage::Crop => "crop",
            Stage::Detect => "detect",
            Stage::Estimate => "estimate",
            Stage::Aggregate => "aggregate",
            Stage::Persist => "persist",
            Stage::Dispatch => "dispatch",
        }
    }
}

impl AnalysisError {
    pub fn stage(&self) -> Stage {
        match self {
            AnalysisError::Fetch(_) | AnalysisError::Decode(_) => Stage::Fetch,
            AnalysisError::EmptyRegion { .. } | AnalysisError::RegionEncode(_) => Stage::Crop,
            AnalysisError::DetectionService(_)
            | AnalysisError::DetectionTimeout(_)
            | AnalysisError::DetectionParse(_) => Stage::Detect,
            AnalysisError::EstimationService(_)
            | AnalysisError::EstimationTimeout(_)
            | AnalysisError::EstimationParse(_) => Stage::Estimate,
            AnalysisError::Aggregation(_) => Stage::Aggregate,
            AnalysisError::Persistence(_) => Stage::Persist,
            AnalysisError::Cancelled | AnalysisError::Conflict(_) => Stage::Dispatch,
        }
    }

    /// Errors scoped to a single dish: the dish is skipped and the run continues.
    pub fn is_per_dish(&self) -> bool {
        matches!(self.stage(), Stage::Crop | Stage::Estimate)
    }

    /// Short machine-readable name, stable across message wording changes.
    pub fn kind(&self) -> &'static str {
        match self {
            AnalysisError::Fetch(_) => "fetch_error",
            AnalysisError::Decode(_) => "decode_error",
            AnalysisError::EmptyRegion { .. } => "empty_region",
            AnalysisError::RegionEncode(_) => "region_encode_error",
            AnalysisError::DetectionService(_) => "detection_service_error",
            AnalysisError::DetectionTimeout(_) => "detection_timeout",
            AnalysisError::DetectionParse(_) => "detection_parse_error",
            AnalysisError::EstimationService(_) => "estimation_service_error",
            AnalysisError::EstimationTimeout(_) => "estimation_timeout",
            AnalysisError::EstimationParse(_) => "estimation_parse_error",
            AnalysisError::Aggregation(_) => "aggregation_error",
            AnalysisError::Persistence(_) => "persistence_error",
            AnalysisError::Cancelled => "cancelled",
            AnalysisError::Conflict(_) => "conflict",
        }
    }

    pub fn persistence(err: impl std::fmt::Display) -> Self {
        AnalysisError::Persistence(err.to_string())
    }
}

pub type AnalysisResult<T> = Result<T, AnalysisError>;
