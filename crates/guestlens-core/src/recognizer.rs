//! MobileFaceNet face embedder via ONNX Runtime.
//!
//! Extracts 128-dimensional face descriptors from aligned 112×112 face crops.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::types::{DescriptorError, FaceBox, FaceDescriptor, DESCRIPTOR_LEN};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const EMBEDDER_MEAN: f32 = 127.5;
const EMBEDDER_STD: f32 = 128.0;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face has no keypoints; the detector must return keypoints for alignment")]
    NoKeypoints,
    #[error("invalid descriptor: {0}")]
    Descriptor(#[from] DescriptorError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Computes the descriptor of one detected face.
pub trait DescriptorEmbedder: Send {
    fn embed(&mut self, image: &RgbImage, face: &FaceBox) -> Result<FaceDescriptor, RecognizerError>;
}

/// MobileFaceNet-based embedder.
pub struct MobileFaceNet {
    session: Session,
}

impl MobileFaceNet {
    /// Load the embedding ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            "loaded MobileFaceNet model"
        );

        Ok(Self { session })
    }

    /// Convert an aligned 112×112 RGB crop into a normalized NCHW tensor.
    fn preprocess(aligned: &RgbImage) -> Array4<f32> {
        let size = ALIGNED_SIZE as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for (x, y, pixel) in aligned.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - EMBEDDER_MEAN) / EMBEDDER_STD;
            }
        }

        tensor
    }
}

impl DescriptorEmbedder for MobileFaceNet {
    fn embed(&mut self, image: &RgbImage, face: &FaceBox) -> Result<FaceDescriptor, RecognizerError> {
        let keypoints = face.keypoints.as_ref().ok_or(RecognizerError::NoKeypoints)?;

        let aligned = alignment::align_face(image, keypoints);
        let input = Self::preprocess(&aligned);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != DESCRIPTOR_LEN {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {DESCRIPTOR_LEN}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(FaceDescriptor::try_from(l2_normalize(raw.to_vec()))?)
    }
}

/// Scale to unit length; a zero vector is returned unchanged.
fn l2_normalize(raw: Vec<f32>) -> Vec<f32> {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw
    }
}
