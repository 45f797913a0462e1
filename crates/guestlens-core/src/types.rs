use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of values in a face descriptor.
pub const DESCRIPTOR_LEN: usize = 128;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("descriptor must have 128 values, got {0}")]
    WrongLength(usize),
    #[error("descriptor value at index {0} is not finite")]
    NonFinite(usize),
}

/// Raw detector output in image pixel space, with optional five-point keypoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point keypoints: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub keypoints: Option<[(f32, f32); 5]>,
}

impl FaceBox {
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// Face bounding box in whole pixels, clamped to the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn from_face_box(face: &FaceBox, image_width: u32, image_height: u32) -> Self {
        let clamp_x = |v: f32| v.round().clamp(0.0, image_width as f32) as u32;
        let clamp_y = |v: f32| v.round().clamp(0.0, image_height as f32) as u32;

        let x0 = clamp_x(face.x);
        let y0 = clamp_y(face.y);
        let x1 = clamp_x(face.x + face.width);
        let y1 = clamp_y(face.y + face.height);

        Self {
            x: x0,
            y: y0,
            width: x1.saturating_sub(x0),
            height: y1.saturating_sub(y0),
        }
    }
}

/// 128-dimensional face embedding.
///
/// Only constructible through the length-checked `TryFrom<Vec<f32>>`, so every
/// descriptor in the system has exactly [`DESCRIPTOR_LEN`] finite values.
/// Serialized as a plain JSON array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct FaceDescriptor(Vec<f32>);

impl FaceDescriptor {
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// Euclidean distance between two descriptors.
    pub fn euclidean_distance(&self, other: &FaceDescriptor) -> f32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

impl TryFrom<Vec<f32>> for FaceDescriptor {
    type Error = DescriptorError;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        if values.len() != DESCRIPTOR_LEN {
            return Err(DescriptorError::WrongLength(values.len()));
        }
        if let Some(idx) = values.iter().position(|v| !v.is_finite()) {
            return Err(DescriptorError::NonFinite(idx));
        }
        Ok(Self(values))
    }
}

impl From<FaceDescriptor> for Vec<f32> {
    fn from(descriptor: FaceDescriptor) -> Self {
        descriptor.0
    }
}

/// One located face within an image.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    pub descriptor: FaceDescriptor,
    pub bounding_box: BoundingBox,
    /// Position within this image's detections (descending confidence).
    pub face_index: usize,
    pub confidence: f32,
    pub landmarks: Vec<(f32, f32)>,
}

/// Index entry for one face in one event photo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoDescriptorRecord {
    pub photo_id: String,
    pub photo_name: String,
    pub photo_url: String,
    pub face_index: usize,
    pub descriptor: FaceDescriptor,
    pub bounding_box: BoundingBox,
}

impl PhotoDescriptorRecord {
    pub fn from_detection(photo_id: &str, photo_name: &str, photo_url: &str, detection: Detection) -> Self {
        Self {
            photo_id: photo_id.to_string(),
            photo_name: photo_name.to_string(),
            photo_url: photo_url.to_string(),
            face_index: detection.face_index,
            descriptor: detection.descriptor,
            bounding_box: detection.bounding_box,
        }
    }
}

/// Result of comparing two descriptors against a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    pub is_same_person: bool,
    pub distance: f32,
    /// `round((1 - distance) * 100)`. An approximate confidence, not a
    /// probability, and not bounded to [0, 100].
    pub similarity: i32,
}
