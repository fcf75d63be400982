use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, instrument};

use super::error::{AnalysisError, AnalysisResult};
use super::image_source::SourceImage;
use super::inference::{encode_image, require_number, CallError, InferenceClient};
use super::types::{BoundingBox, Detection};
use crate::config::InferenceConfig;

#[async_trait]
pub trait DishDetector: Send + Sync {
    /// Find the dishes in a whole meal photo. An empty list is a valid answer.
    async fn detect(&self, image: &SourceImage) -> AnalysisResult<Vec<Detection>>;
}

pub struct HttpDishDetector {
    client: InferenceClient,
}

impl HttpDishDetector {
    pub fn new(cfg: &InferenceConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: InferenceClient::new(cfg)?,
        })
    }
}

#[async_trait]
impl DishDetector for HttpDishDetector {
    #[instrument(skip(self, image), fields(image = ?image))]
    async fn detect(&self, image: &SourceImage) -> AnalysisResult<Vec<Detection>> {
        let body = json!({
            "image": encode_image(&image.encoded),
            "mime_type": image.mime_type(),
        });
        let value = self.client.post_json(&body).await.map_err(|e| match e {
            CallError::Timeout(d) => AnalysisError::DetectionTimeout(d),
            CallError::Service(msg) => AnalysisError::DetectionService(msg),
            CallError::Parse(msg) => AnalysisError::DetectionParse(msg),
        })?;
        let detections = parse_detections(&value)?;
        info!(dishes = detections.len(), "dishes detected");
        Ok(detections)
    }
}

/// Validate a detector response into detections.
///
/// Accepts a bare array or `{"detections": [...]}`; each entry needs a string
/// `name` (or `label`) and a `box` given as `[x, y, w, h]` or as an object.
pub fn parse_detections(value: &Value) -> AnalysisResult<Vec<Detection>> {
    let entries = match value {
        Value::Array(items) => items,
        Value::Object(map) => match map.get("detections") {
            Some(Value::Array(items)) => items,
            Some(other) => {
                return Err(AnalysisError::DetectionParse(format!(
                    "'detections' is not an array: {other}"
                )))
            }
            None => {
                return Err(AnalysisError::DetectionParse(
                    "response has no 'detections' array".into(),
                ))
            }
        },
        other => {
            return Err(AnalysisError::DetectionParse(format!(
                "unexpected response shape: {other}"
            )))
        }
    };

    entries
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            parse_entry(entry).map_err(|msg| AnalysisError::DetectionParse(format!("detection {i}: {msg}")))
        })
        .collect()
}

fn parse_entry(entry: &Value) -> Result<Detection, String> {
    if !entry.is_object() {
        return Err(format!("expected an object, got {entry}"));
    }
    let label = entry
        .get("name")
        .or_else(|| entry.get("label"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or("missing dish name")?
        .to_string();

    let raw_box = entry.get("box").ok_or("missing box")?;
    let bbox = match raw_box {
        Value::Array(parts) => {
            if parts.len() != 4 {
                return Err(format!("box must have 4 numbers, got {}", parts.len()));
            }
            let mut nums = [0.0; 4];
            for (slot, part) in nums.iter_mut().zip(parts) {
                *slot = part
                    .as_f64()
                    .filter(|n| n.is_finite())
                    .ok_or_else(|| format!("box value {part} is not a number"))?;
            }
            BoundingBox {
                x: nums[0],
                y: nums[1],
                width: nums[2],
                height: nums[3],
            }
        }
        Value::Object(_) => BoundingBox {
            x: require_number(raw_box, "x")?,
            y: require_number(raw_box, "y")?,
            width: require_number(raw_box, "width")?,
            height: require_number(raw_box, "height")?,
        },
        other => return Err(format!("box has unexpected shape: {other}")),
    };

    Ok(Detection { label, bbox })
}
