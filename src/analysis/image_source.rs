use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use image::{DynamicImage, GenericImageView, ImageFormat};
use tracing::{debug, instrument};

use super::error::{AnalysisError, AnalysisResult};
use crate::storage::StorageClient;

/// A fetched and decoded meal photo.
#[derive(Clone)]
pub struct SourceImage {
    pub pixels: Arc<DynamicImage>,
    pub encoded: Bytes,
    pub format: ImageFormat,
}

impl SourceImage {
    pub fn dimensions(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }

    pub fn mime_type(&self) -> &'static str {
        match self.format {
            ImageFormat::Jpeg => "image/jpeg",
            _ => "image/png",
        }
    }
}

impl std::fmt::Debug for SourceImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (w, h) = self.dimensions();
        f.debug_struct("SourceImage")
            .field("width", &w)
            .field("height", &h)
            .field("format", &self.format)
            .field("bytes", &self.encoded.len())
            .finish()
    }
}

#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn fetch(&self, reference: &str) -> AnalysisResult<SourceImage>;
}

/// Resolves storage keys through the blob store and `http(s)://` references over HTTP.
pub struct StoreImageSource {
    storage: Arc<dyn StorageClient>,
    http: reqwest::Client,
    timeout: Duration,
}

impl StoreImageSource {
    pub fn new(storage: Arc<dyn StorageClient>, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            storage,
            http,
            timeout,
        })
    }

    async fn fetch_bytes(&self, reference: &str) -> AnalysisResult<Bytes> {
        if is_url(reference) {
            let resp = self
                .http
                .get(reference)
                .send()
                .await
                .map_err(|e| AnalysisError::Fetch(e.to_string()))?;
            if !resp.status().is_success() {
                return Err(AnalysisError::Fetch(format!(
                    "GET {} returned {}",
                    reference,
                    resp.status()
                )));
            }
            resp.bytes()
                .await
                .map_err(|e| AnalysisError::Fetch(e.to_string()))
        } else {
            self.storage
                .get_object(reference)
                .await
                .map_err(|e| AnalysisError::Fetch(format!("{e:#}")))
        }
    }
}

#[async_trait]
impl ImageSource for StoreImageSource {
    #[instrument(skip(self))]
    async fn fetch(&self, reference: &str) -> AnalysisResult<SourceImage> {
        let bytes = tokio::time::timeout(self.timeout, self.fetch_bytes(reference))
            .await
            .map_err(|_| {
                AnalysisError::Fetch(format!("timed out after {:?} fetching {}", self.timeout, reference))
            })??;
        debug!(bytes = bytes.len(), "image fetched");
        decode_async(bytes).await
    }
}

fn is_url(reference: &str) -> bool {
    reference.starts_with("http://") || reference.starts_with("https://")
}

/// Decode JPEG or PNG bytes. Anything else is a [`AnalysisError::Decode`].
pub fn decode(encoded: Bytes) -> AnalysisResult<SourceImage> {
    let format = image::guess_format(&encoded)
        .map_err(|e| AnalysisError::Decode(e.to_string()))?;
    if !matches!(format, ImageFormat::Jpeg | ImageFormat::Png) {
        return Err(AnalysisError::Decode(format!(
            "unsupported image format {:?}",
            format
        )));
    }
    let pixels = image::load_from_memory_with_format(&encoded, format)
        .map_err(|e| AnalysisError::Decode(e.to_string()))?;
    Ok(SourceImage {
        pixels: Arc::new(pixels),
        encoded,
        format,
    })
}

pub async fn decode_async(encoded: Bytes) -> AnalysisResult<SourceImage> {
    tokio::task::spawn_blocking(move || decode(encoded))
        .await
        .map_err(|e| AnalysisError::Decode(format!("decode task failed: {e}")))?
}
