use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Rectangle in pixel coordinates, origin at the image's top-left corner.
///
/// Detectors report real-valued and sometimes off-image boxes; clamping happens
/// in [`crate::analysis::region`], not here.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// One dish found by the detector.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub label: String,
    pub bbox: BoundingBox,
}

/// The six nutrition fields tracked per dish and per meal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Nutrition {
    pub calories: f64,
    pub protein: f64,
    pub carbohydrates: f64,
    pub fat: f64,
    pub fiber: f64,
    pub sugar: f64,
}

impl Nutrition {
    pub const FIELDS: [&'static str; 6] =
        ["calories", "protein", "carbohydrates", "fat", "fiber", "sugar"];

    pub fn to_array(self) -> [f64; 6] {
        [
            self.calories,
            self.protein,
            self.carbohydrates,
            self.fat,
            self.fiber,
            self.sugar,
        ]
    }

    pub fn from_array(v: [f64; 6]) -> Self {
        Self {
            calories: v[0],
            protein: v[1],
            carbohydrates: v[2],
            fat: v[3],
            fiber: v[4],
            sugar: v[5],
        }
    }
}

/// Estimator output for one dish.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DishEstimate {
    pub nutrition: Nutrition,
    pub portion: PortionSize,
}

#[derive(Debug)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} '{}'", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

macro_rules! text_enum {
    ($name:ident, $kind:literal, $case:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = $case)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant { kind: $kind, value: other.to_string() }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum!(MealType, "meal type", "lowercase", {
    Breakfast => "breakfast",
    Lunch => "lunch",
    Dinner => "dinner",
    Snack => "snack",
});

impl Default for MealType {
    fn default() -> Self {
        MealType::Lunch
    }
}

text_enum!(PortionSize, "portion size", "lowercase", {
    Less => "less",
    Normal => "normal",
    More => "more",
});

impl Default for PortionSize {
    fn default() -> Self {
        PortionSize::Normal
    }
}

text_enum!(JobStatus, "job status", "UPPERCASE", {
    Pending => "PENDING",
    Started => "STARTED",
    Success => "SUCCESS",
    Failure => "FAILURE",
});

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failure)
    }

    /// Forward-only transitions. `Pending -> Failure` covers jobs cancelled
    /// or abandoned before a worker picked them up.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Started)
                | (JobStatus::Pending, JobStatus::Failure)
                | (JobStatus::Started, JobStatus::Success)
                | (JobStatus::Started, JobStatus::Failure)
        )
    }
}
