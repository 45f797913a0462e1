//! guestlens-core: face descriptor extraction and comparison.
//!
//! Uses SCRFD for face detection, a 106-point landmark predictor and a
//! 128-dimensional MobileFaceNet embedder, all running via ONNX Runtime
//! for CPU inference.

pub mod alignment;
pub mod detector;
pub mod extractor;
pub mod landmarks;
pub mod matcher;
pub mod models;
pub mod recognizer;
pub mod source;
pub mod types;

#[cfg(test)]
mod testing;

pub use detector::{FaceDetector, ScrfdDetector};
pub use extractor::{DescriptorExtractor, ExtractError, FaceExtractor, DEFAULT_MIN_CONFIDENCE};
pub use landmarks::{LandmarkPredictor, Landmark106};
pub use matcher::{compare, EuclideanMatcher, Matcher, PhotoMatch, DEFAULT_MATCH_THRESHOLD};
pub use models::{
    default_model_dir, FaceModels, ModelAsset, ModelAssets, ModelLoadError, ModelLoader,
    ModelSource, OnnxModelSource,
};
pub use recognizer::{DescriptorEmbedder, MobileFaceNet};
pub use source::{AcquiredImage, FetchError, ImageFetcher, ImageSource};
pub use types::{
    BoundingBox, DescriptorError, Detection, FaceBox, FaceDescriptor, MatchResult,
    PhotoDescriptorRecord, DESCRIPTOR_LEN,
};
