use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use super::error::{AnalysisError, AnalysisResult};
use super::inference::{encode_image, require_number, CallError, InferenceClient};
use super::types::{DishEstimate, Nutrition, PortionSize};
use crate::config::InferenceConfig;

#[async_trait]
pub trait NutritionEstimator: Send + Sync {
    /// Estimate nutrition for one cropped dish (PNG bytes).
    async fn estimate(&self, crop_png: &[u8], label: &str) -> AnalysisResult<DishEstimate>;
}

pub struct HttpNutritionEstimator {
    client: InferenceClient,
}

impl HttpNutritionEstimator {
    pub fn new(cfg: &InferenceConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: InferenceClient::new(cfg)?,
        })
    }
}

#[async_trait]
impl NutritionEstimator for HttpNutritionEstimator {
    #[instrument(skip(self, crop_png), fields(crop_bytes = crop_png.len()))]
    async fn estimate(&self, crop_png: &[u8], label: &str) -> AnalysisResult<DishEstimate> {
        let body = json!({
            "image": encode_image(crop_png),
            "mime_type": "image/png",
            "label": label,
        });
        let value = self.client.post_json(&body).await.map_err(|e| match e {
            CallError::Timeout(d) => AnalysisError::EstimationTimeout(d),
            CallError::Service(msg) => AnalysisError::EstimationService(msg),
            CallError::Parse(msg) => AnalysisError::EstimationParse(msg),
        })?;
        let estimate = parse_estimate(&value)?;
        debug!(calories = estimate.nutrition.calories, portion = %estimate.portion, "dish estimated");
        Ok(estimate)
    }
}

/// Validate an estimator response.
///
/// The six fields may sit at the top level or under `"nutrition"`. Every field
/// must be present, finite and non-negative; nothing is clamped.
pub fn parse_estimate(value: &Value) -> AnalysisResult<DishEstimate> {
    if !value.is_object() {
        return Err(AnalysisError::EstimationParse(format!(
            "expected an object, got {value}"
        )));
    }
    let fields = match value.get("nutrition") {
        Some(nested) if nested.is_object() => nested,
        Some(other) => {
            return Err(AnalysisError::EstimationParse(format!(
                "'nutrition' is not an object: {other}"
            )))
        }
        None => value,
    };

    let mut nums = [0.0; 6];
    for (slot, key) in nums.iter_mut().zip(Nutrition::FIELDS) {
        let n = require_number(fields, key).map_err(AnalysisError::EstimationParse)?;
        if n < 0.0 {
            return Err(AnalysisError::EstimationParse(format!(
                "field '{key}' is negative: {n}"
            )));
        }
        *slot = n;
    }

    let portion = match value.get("portion_size") {
        None | Some(Value::Null) => PortionSize::default(),
        Some(Value::String(s)) => s
            .to_ascii_lowercase()
            .parse::<PortionSize>()
            .map_err(|e| AnalysisError::EstimationParse(format!("{e}")))?,
        Some(other) => {
            return Err(AnalysisError::EstimationParse(format!(
                "portion_size is not a string: {other}"
            )))
        }
    };

    Ok(DishEstimate {
        nutrition: Nutrition::from_array(nums),
        portion,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use std::time::Duration;

    fn full() -> Value {
        json!({
            "calories": 420, "protein": 12.5, "carbohydrates": 60,
            "fat": 14.2, "fiber": 3, "sugar": 0
        })
    }

    #[test]
    fn parses_flat_record_with_default_portion() {
        let e = parse_estimate(&full()).unwrap();
        assert_eq!(e.nutrition.calories, 420.0);
        assert_eq!(e.nutrition.fat, 14.2);
        assert_eq!(e.nutrition.sugar, 0.0);
        assert_eq!(e.portion, PortionSize::Normal);
    }

    #[test]
    fn parses_nested_record_with_portion() {
        let v = json!({"nutrition": full(), "portion_size": "More"});
        let e = parse_estimate(&v).unwrap();
        assert_eq!(e.nutrition.protein, 12.5);
        assert_eq!(e.portion, PortionSize::More);
    }

    #[test]
    fn negative_values_are_rejected_not_clamped() {
        let mut v = full();
        v["fiber"] = json!(-0.5);
        let err = parse_estimate(&v).unwrap_err();
        assert!(matches!(err, AnalysisError::EstimationParse(ref m) if m.contains("fiber")));
    }

    #[test]
    fn missing_or_non_numeric_fields_are_rejected() {
        for key in Nutrition::FIELDS {
            let mut v = full();
            v.as_object_mut().unwrap().remove(key);
            assert!(parse_estimate(&v).is_err(), "missing {key}");
        }
        let mut v = full();
        v["protein"] = json!("12g");
        assert!(parse_estimate(&v).is_err());
    }

    #[test]
    fn unknown_portion_is_rejected() {
        let mut v = full();
        v["portion_size"] = json!("huge");
        assert!(parse_estimate(&v).is_err());
        assert!(parse_estimate(&json!([1, 2])).is_err());
    }

    #[tokio::test]
    async fn http_estimator_sends_label() {
        let app = Router::new().route(
            "/estimate",
            post(|Json(body): Json<Value>| async move {
                let label = body["label"].as_str().unwrap_or_default().to_string();
                let calories = if label == "pasta" { 600 } else { 0 };
                Json(json!({
                    "calories": calories, "protein": 1, "carbohydrates": 2,
                    "fat": 3, "fiber": 4, "sugar": 5
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let estimator = HttpNutritionEstimator::new(&InferenceConfig {
            url: format!("http://{addr}/estimate"),
            api_key: None,
            timeout: Duration::from_secs(5),
        })
        .unwrap();
        let e = estimator.estimate(b"png", "pasta").await.unwrap();
        assert_eq!(e.nutrition.calories, 600.0);
        assert_eq!(e.nutrition.sugar, 5.0);
    }

    #[tokio::test]
    async fn slow_estimator_times_out() {
        let app = Router::new().route(
            "/estimate",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Json(json!({}))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let estimator = HttpNutritionEstimator::new(&InferenceConfig {
            url: format!("http://{addr}/estimate"),
            api_key: None,
            timeout: Duration::from_millis(100),
        })
        .unwrap();
        let err = estimator.estimate(b"png", "x").await.unwrap_err();
        assert!(matches!(err, AnalysisError::EstimationTimeout(_)));
    }
}
