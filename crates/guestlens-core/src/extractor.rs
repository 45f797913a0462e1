//! Descriptor extraction: image source in, detections out.

use crate::detector::DetectorError;
use crate::landmarks::LandmarkError;
use crate::models::{ModelLoadError, ModelLoader};
use crate::recognizer::RecognizerError;
use crate::source::{FetchError, ImageFetcher, ImageSource};
use crate::types::Detection;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Faces below this detector confidence are dropped.
pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.4;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("failed to fetch image: {0}")]
    Fetch(#[from] FetchError),
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error(transparent)]
    Model(#[from] ModelLoadError),
    #[error("face detection failed: {0}")]
    Detector(#[from] DetectorError),
    #[error("landmark prediction failed: {0}")]
    Landmarks(#[from] LandmarkError),
    #[error("descriptor extraction failed: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("inference task failed: {0}")]
    TaskFailed(String),
}

impl ExtractError {
    /// The models could not be loaded; every further extraction will fail
    /// the same way until a reload succeeds.
    pub fn is_model_failure(&self) -> bool {
        matches!(self, ExtractError::Model(_))
    }
}

/// Extracts every face descriptor from an image.
///
/// An image without faces yields `Ok(vec![])`.
#[async_trait]
pub trait FaceExtractor: Send + Sync {
    async fn extract_all_faces(&self, source: &ImageSource) -> Result<Vec<Detection>, ExtractError>;
}

/// [`FaceExtractor`] backed by the ONNX face models.
pub struct DescriptorExtractor {
    loader: Arc<ModelLoader>,
    fetcher: ImageFetcher,
    min_confidence: f32,
}

impl DescriptorExtractor {
    pub fn new(loader: Arc<ModelLoader>, fetcher: ImageFetcher) -> Self {
        Self {
            loader,
            fetcher,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
        }
    }

    pub fn with_min_confidence(mut self, min_confidence: f32) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    pub fn min_confidence(&self) -> f32 {
        self.min_confidence
    }
}

#[async_trait]
impl FaceExtractor for DescriptorExtractor {
    async fn extract_all_faces(&self, source: &ImageSource) -> Result<Vec<Detection>, ExtractError> {
        let models = self.loader.ensure_ready().await?;
        let acquired = self.fetcher.acquire(source).await?;
        let min_confidence = self.min_confidence;

        let detections = tokio::task::spawn_blocking(move || {
            let image = acquired.decode()?.to_rgb8();
            models.analyze(&image, min_confidence)
        })
        .await
        .map_err(|e| ExtractError::TaskFailed(e.to_string()))??;

        tracing::debug!(%source, faces = detections.len(), "extracted face descriptors");
        Ok(detections)
    }
}
