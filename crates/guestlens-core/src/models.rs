//! Face model assets and the once-only loader.
//!
//! [`ModelLoader`] moves through three states: uninitialized, initializing
//! (one shared in-flight load that every concurrent caller joins) and ready.
//! A failed load puts it back to uninitialized so the next caller retries.

use crate::detector::{FaceDetector, ScrfdDetector};
use crate::extractor::ExtractError;
use crate::landmarks::{Landmark106, LandmarkPredictor};
use crate::recognizer::{DescriptorEmbedder, MobileFaceNet};
use crate::types::{BoundingBox, Detection};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use image::RgbImage;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Failure to make the face models available. Cheap to clone so every
/// caller joined on one load receives it.
#[derive(Error, Debug, Clone)]
#[error("failed to load face model {asset}: {cause}")]
pub struct ModelLoadError {
    pub asset: String,
    #[source]
    pub cause: Arc<dyn std::error::Error + Send + Sync>,
}

impl ModelLoadError {
    pub fn new(asset: impl Into<String>, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self {
            asset: asset.into(),
            cause: Arc::new(cause),
        }
    }
}

#[derive(Error, Debug)]
pub enum ModelAssetError {
    #[error("not found at {0} and no download location configured")]
    Missing(PathBuf),
    #[error("download failed: {0}")]
    Download(#[from] reqwest::Error),
    #[error("download returned HTTP {0}")]
    Status(reqwest::StatusCode),
    #[error("sha256 mismatch: expected {expected}, got {actual}")]
    Checksum { expected: String, actual: String },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("blocking task failed: {0}")]
    TaskFailed(String),
}

/// Loaded detector, landmark predictor and embedder.
///
/// The three networks share one lock; inference for an image runs start to
/// finish under it.
pub struct FaceModels {
    pipeline: Mutex<Pipeline>,
}

struct Pipeline {
    detector: Box<dyn FaceDetector>,
    landmarks: Box<dyn LandmarkPredictor>,
    embedder: Box<dyn DescriptorEmbedder>,
}

impl FaceModels {
    pub fn new(
        detector: Box<dyn FaceDetector>,
        landmarks: Box<dyn LandmarkPredictor>,
        embedder: Box<dyn DescriptorEmbedder>,
    ) -> Self {
        Self {
            pipeline: Mutex::new(Pipeline {
                detector,
                landmarks,
                embedder,
            }),
        }
    }

    /// Detect every face at or above `min_confidence`, then predict its
    /// landmarks and descriptor. Face indices follow descending confidence.
    pub fn analyze(&self, image: &RgbImage, min_confidence: f32) -> Result<Vec<Detection>, ExtractError> {
        let mut pipeline = self.pipeline.lock().unwrap_or_else(PoisonError::into_inner);
        let Pipeline {
            detector,
            landmarks,
            embedder,
        } = &mut *pipeline;

        let mut faces: Vec<_> = detector
            .detect(image, min_confidence)?
            .into_iter()
            .filter(|face| face.confidence >= min_confidence)
            .collect();
        faces.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut detections = Vec::with_capacity(faces.len());
        for (face_index, face) in faces.iter().enumerate() {
            let points = landmarks.predict(image, face)?;
            let descriptor = embedder.embed(image, face)?;
            detections.push(Detection {
                descriptor,
                bounding_box: BoundingBox::from_face_box(face, image.width(), image.height()),
                face_index,
                confidence: face.confidence,
                landmarks: points,
            });
        }

        Ok(detections)
    }
}

/// Somewhere face models can be loaded from.
#[async_trait]
pub trait ModelSource: Send + Sync {
    async fn load(&self) -> Result<FaceModels, ModelLoadError>;
}

type LoadFuture = Shared<BoxFuture<'static, Result<Arc<FaceModels>, ModelLoadError>>>;

enum LoadState {
    Uninitialized,
    Initializing { generation: u64, future: LoadFuture },
    Ready(Arc<FaceModels>),
}

struct LoaderInner {
    state: LoadState,
    next_generation: u64,
}

/// Loads face models once and hands out shared references.
pub struct ModelLoader {
    source: Arc<dyn ModelSource>,
    inner: Mutex<LoaderInner>,
}

impl ModelLoader {
    pub fn new(source: Arc<dyn ModelSource>) -> Self {
        Self {
            source,
            inner: Mutex::new(LoaderInner {
                state: LoadState::Uninitialized,
                next_generation: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LoaderInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.lock().state, LoadState::Ready(_))
    }

    /// Return the loaded models, loading them first if needed.
    ///
    /// Callers arriving while a load is in flight await that same load.
    pub async fn ensure_ready(&self) -> Result<Arc<FaceModels>, ModelLoadError> {
        let (generation, future) = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            match &inner.state {
                LoadState::Ready(models) => return Ok(Arc::clone(models)),
                LoadState::Initializing { generation, future } => (*generation, future.clone()),
                LoadState::Uninitialized => {
                    let generation = inner.next_generation;
                    inner.next_generation += 1;

                    let source = Arc::clone(&self.source);
                    let future = async move { source.load().await.map(Arc::new) }
                        .boxed()
                        .shared();
                    inner.state = LoadState::Initializing {
                        generation,
                        future: future.clone(),
                    };
                    tracing::info!(generation, "loading face models");
                    (generation, future)
                }
            }
        };

        let result = future.await;

        let mut inner = self.lock();
        let current = matches!(
            &inner.state,
            LoadState::Initializing { generation: g, .. } if *g == generation
        );
        if current {
            inner.state = match &result {
                Ok(models) => {
                    tracing::info!(generation, "face models ready");
                    LoadState::Ready(Arc::clone(models))
                }
                Err(err) => {
                    tracing::warn!(generation, error = %err, "face model load failed; will retry on next use");
                    LoadState::Uninitialized
                }
            };
        }

        result
    }
}

/// One model file and its optional SHA-256 digest (lowercase hex).
#[derive(Debug, Clone)]
pub struct ModelAsset {
    pub file_name: String,
    pub sha256: Option<String>,
}

impl ModelAsset {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            sha256: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelAssets {
    pub detector: ModelAsset,
    pub landmarks: ModelAsset,
    pub embedder: ModelAsset,
}

impl Default for ModelAssets {
    fn default() -> Self {
        Self {
            detector: ModelAsset::new("det_500m.onnx"),
            landmarks: ModelAsset::new("2d106det.onnx"),
            embedder: ModelAsset::new("mobilefacenet.onnx"),
        }
    }
}

/// Default directory for model files: `$XDG_DATA_HOME/guestlens/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("guestlens")
        .join("models")
}

/// Loads ONNX models from a local directory, downloading missing files from
/// a base URL when one is configured.
pub struct OnnxModelSource {
    model_dir: PathBuf,
    base_url: Option<String>,
    assets: ModelAssets,
    client: reqwest::Client,
}

impl OnnxModelSource {
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
            base_url: None,
            assets: ModelAssets::default(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_assets(mut self, assets: ModelAssets) -> Self {
        self.assets = assets;
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    async fn ensure_asset(&self, asset: &ModelAsset) -> Result<PathBuf, ModelLoadError> {
        self.fetch_asset(asset)
            .await
            .map_err(|e| ModelLoadError::new(&asset.file_name, e))
    }

    async fn fetch_asset(&self, asset: &ModelAsset) -> Result<PathBuf, ModelAssetError> {
        let path = self.model_dir.join(&asset.file_name);

        if tokio::fs::try_exists(&path).await? {
            if let Some(expected) = &asset.sha256 {
                verify_sha256(expected, &tokio::fs::read(&path).await?)?;
            }
            tracing::debug!(path = %path.display(), "model asset present");
            return Ok(path);
        }

        let base = self
            .base_url
            .as_deref()
            .ok_or_else(|| ModelAssetError::Missing(path.clone()))?;
        let url = format!("{}/{}", base.trim_end_matches('/'), asset.file_name);

        tracing::info!(%url, "downloading model asset");
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(ModelAssetError::Status(response.status()));
        }
        let bytes = response.bytes().await?;

        if let Some(expected) = &asset.sha256 {
            verify_sha256(expected, &bytes)?;
        }

        tokio::fs::create_dir_all(&self.model_dir).await?;
        let dir = self.model_dir.clone();
        let target = path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&dir, &target, &bytes))
            .await
            .map_err(|e| ModelAssetError::TaskFailed(e.to_string()))??;

        tracing::info!(path = %path.display(), "model asset saved");
        Ok(path)
    }
}

#[async_trait]
impl ModelSource for OnnxModelSource {
    async fn load(&self) -> Result<FaceModels, ModelLoadError> {
        let detector_path = self.ensure_asset(&self.assets.detector).await?;
        let landmarks_path = self.ensure_asset(&self.assets.landmarks).await?;
        let embedder_path = self.ensure_asset(&self.assets.embedder).await?;

        tokio::task::spawn_blocking(move || {
            let detector = ScrfdDetector::load(&detector_path)
                .map_err(|e| ModelLoadError::new(detector_path.display().to_string(), e))?;
            let landmarks = Landmark106::load(&landmarks_path)
                .map_err(|e| ModelLoadError::new(landmarks_path.display().to_string(), e))?;
            let embedder = MobileFaceNet::load(&embedder_path)
                .map_err(|e| ModelLoadError::new(embedder_path.display().to_string(), e))?;
            Ok(FaceModels::new(
                Box::new(detector),
                Box::new(landmarks),
                Box::new(embedder),
            ))
        })
        .await
        .map_err(|e| ModelLoadError::new("onnx sessions", ModelAssetError::TaskFailed(e.to_string())))?
    }
}

fn verify_sha256(expected: &str, bytes: &[u8]) -> Result<(), ModelAssetError> {
    let actual = format!("{:x}", Sha256::digest(bytes));
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(ModelAssetError::Checksum {
            expected: expected.to_string(),
            actual,
        })
    }
}

/// Write through a temp file in `dir` so a partial download never appears
/// under the final name.
fn write_atomically(dir: &Path, target: &Path, bytes: &[u8]) -> Result<(), ModelAssetError> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.persist(target).map_err(|e| ModelAssetError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{face_box, stub_models, FileServer};
    use axum::http::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingSource {
        loads: AtomicUsize,
        fail_first: usize,
    }

    impl CountingSource {
        fn new(fail_first: usize) -> Arc<Self> {
            Arc::new(Self {
                loads: AtomicUsize::new(0),
                fail_first,
            })
        }
    }

    #[async_trait]
    impl ModelSource for CountingSource {
        async fn load(&self) -> Result<FaceModels, ModelLoadError> {
            let n = self.loads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if n < self.fail_first {
                return Err(ModelLoadError::new(
                    "det_500m.onnx",
                    std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection reset"),
                ));
            }
            Ok(stub_models(vec![face_box(10.0, 0.9)]))
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_load() {
        let source = CountingSource::new(0);
        let loader = ModelLoader::new(source.clone());

        let results = futures::future::join_all((0..5).map(|_| loader.ensure_ready())).await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
        assert!(loader.is_ready());

        let first = results[0].as_ref().unwrap();
        assert!(results.iter().all(|r| Arc::ptr_eq(r.as_ref().unwrap(), first)));
    }

    #[tokio::test]
    async fn test_ready_loader_does_not_reload() {
        let source = CountingSource::new(0);
        let loader = ModelLoader::new(source.clone());

        loader.ensure_ready().await.unwrap();
        loader.ensure_ready().await.unwrap();
        loader.ensure_ready().await.unwrap();
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_load_is_shared_then_retried() {
        let source = CountingSource::new(1);
        let loader = ModelLoader::new(source.clone());

        let results = futures::future::join_all((0..3).map(|_| loader.ensure_ready())).await;
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
        for result in &results {
            let err = result.as_ref().err().expect("joined callers see the failure");
            assert_eq!(err.asset, "det_500m.onnx");
            assert!(err.to_string().contains("connection reset"));
        }
        assert!(!loader.is_ready());

        loader.ensure_ready().await.expect("retry after failure succeeds");
        assert_eq!(source.loads.load(Ordering::SeqCst), 2);
        assert!(loader.is_ready());
    }

    #[tokio::test]
    async fn test_missing_asset_without_base_url() {
        let dir = tempfile::tempdir().unwrap();
        let source = OnnxModelSource::new(dir.path());

        let err = source.load().await.err().expect("no models on disk");
        assert_eq!(err.asset, "det_500m.onnx");
        assert!(err.to_string().contains("no download location"));
    }

    #[tokio::test]
    async fn test_present_asset_checksum_verified() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("det_500m.onnx"), b"not really onnx").unwrap();

        let mut assets = ModelAssets::default();
        assets.detector.sha256 = Some("00".repeat(32));
        let source = OnnxModelSource::new(dir.path()).with_assets(assets);

        let err = source.load().await.err().expect("digest mismatch");
        assert!(err.to_string().contains("sha256 mismatch"));
    }

    #[test]
    fn test_verify_sha256() {
        // sha256("abc")
        let digest = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
        assert!(verify_sha256(digest, b"abc").is_ok());
        assert!(verify_sha256(&digest.to_uppercase(), b"abc").is_ok());
        assert!(matches!(
            verify_sha256(digest, b"abd"),
            Err(ModelAssetError::Checksum { .. })
        ));
    }

    #[test]
    fn test_write_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("model.onnx");
        write_atomically(dir.path(), &target, b"weights").unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"weights");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    fn sha256_hex(bytes: &[u8]) -> String {
        format!("{:x}", Sha256::digest(bytes))
    }

    #[tokio::test]
    async fn test_download_lands_in_model_dir() {
        let server = FileServer::start().await;
        server.put("/models/det_500m.onnx", StatusCode::OK, b"detector weights".to_vec());
        server.put("/models/2d106det.onnx", StatusCode::OK, b"landmark weights".to_vec());
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("models");

        let mut assets = ModelAssets::default();
        assets.detector.sha256 = Some(sha256_hex(b"detector weights"));
        assets.landmarks.sha256 = Some("00".repeat(32));
        let source = OnnxModelSource::new(&model_dir)
            .with_base_url(format!("{}/models/", server.base_url))
            .with_assets(assets.clone());

        let path = source.fetch_asset(&assets.detector).await.unwrap();
        assert_eq!(path, model_dir.join("det_500m.onnx"));
        assert_eq!(std::fs::read(&path).unwrap(), b"detector weights");
        assert_eq!(std::fs::read_dir(&model_dir).unwrap().count(), 1);

        let err = source.fetch_asset(&assets.landmarks).await.unwrap_err();
        assert!(matches!(err, ModelAssetError::Checksum { .. }));
        assert!(!model_dir.join("2d106det.onnx").exists());

        // Present now, so no second download.
        source.fetch_asset(&assets.detector).await.unwrap();
        assert_eq!(
            server.requests(),
            vec!["/models/det_500m.onnx", "/models/2d106det.onnx"]
        );
    }

    #[tokio::test]
    async fn test_download_failure_then_retry() {
        let server = FileServer::start().await;
        server.put("/det_500m.onnx", StatusCode::INTERNAL_SERVER_ERROR, Vec::new());
        server.put("/2d106det.onnx", StatusCode::INTERNAL_SERVER_ERROR, Vec::new());
        let dir = tempfile::tempdir().unwrap();
        let source = OnnxModelSource::new(dir.path()).with_base_url(server.base_url.clone());
        let loader = ModelLoader::new(Arc::new(source));

        let err = loader.ensure_ready().await.err().expect("server error");
        assert_eq!(err.asset, "det_500m.onnx");
        assert!(err.to_string().contains("HTTP 500"));
        assert!(!loader.is_ready());

        server.put("/det_500m.onnx", StatusCode::OK, b"detector weights".to_vec());
        let err = loader.ensure_ready().await.err().expect("landmarks still failing");
        assert_eq!(err.asset, "2d106det.onnx");
        assert!(err.to_string().contains("HTTP 500"));
        assert!(dir.path().join("det_500m.onnx").exists());
        assert_eq!(
            server.requests(),
            vec!["/det_500m.onnx", "/det_500m.onnx", "/2d106det.onnx"]
        );
    }
}
