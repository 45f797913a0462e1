//! 106-point facial landmark predictor via ONNX Runtime.
//!
//! Runs the InsightFace `2d106det` model on a square crop centred on the
//! detected face and maps the predicted points back to image coordinates.

use crate::alignment::{crop_transform, invert_point, warp_affine, Similarity};
use crate::types::FaceBox;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const LANDMARK_INPUT_SIZE: u32 = 192;
const LANDMARK_CROP_EXPAND: f32 = 1.5;
const LANDMARK_POINTS: usize = 106;
// 2d106det normalizes internally; it takes raw pixel values.
const LANDMARK_MEAN: f32 = 0.0;
const LANDMARK_STD: f32 = 1.0;

#[derive(Error, Debug)]
pub enum LandmarkError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Predicts landmark points for one detected face, in image coordinates.
pub trait LandmarkPredictor: Send {
    fn predict(&mut self, image: &RgbImage, face: &FaceBox) -> Result<Vec<(f32, f32)>, LandmarkError>;
}

/// InsightFace 2d106det landmark model.
pub struct Landmark106 {
    session: Session,
}

impl Landmark106 {
    pub fn load(model_path: &Path) -> Result<Self, LandmarkError> {
        if !model_path.exists() {
            return Err(LandmarkError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = %model_path.display(), "loaded 2d106det landmark model");

        Ok(Self { session })
    }

    fn to_tensor(crop: &RgbImage) -> Array4<f32> {
        let size = LANDMARK_INPUT_SIZE as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in crop.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - LANDMARK_MEAN) / LANDMARK_STD;
            }
        }
        tensor
    }
}

impl LandmarkPredictor for Landmark106 {
    fn predict(&mut self, image: &RgbImage, face: &FaceBox) -> Result<Vec<(f32, f32)>, LandmarkError> {
        let matrix = crop_transform(face, LANDMARK_INPUT_SIZE, LANDMARK_CROP_EXPAND);
        let crop = warp_affine(image, &matrix, LANDMARK_INPUT_SIZE);
        let input = Self::to_tensor(&crop);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| LandmarkError::InferenceFailed(format!("landmark extraction: {e}")))?;

        decode_landmarks(raw, &matrix)
    }
}

/// Convert raw model output in [-1, 1] crop space to image coordinates.
fn decode_landmarks(raw: &[f32], matrix: &Similarity) -> Result<Vec<(f32, f32)>, LandmarkError> {
    if raw.len() != LANDMARK_POINTS * 2 {
        return Err(LandmarkError::InferenceFailed(format!(
            "expected {} landmark values, got {}",
            LANDMARK_POINTS * 2,
            raw.len()
        )));
    }

    let half = LANDMARK_INPUT_SIZE as f32 / 2.0;
    Ok(raw
        .chunks_exact(2)
        .map(|p| invert_point(matrix, ((p[0] + 1.0) * half, (p[1] + 1.0) * half)))
        .collect())
}
