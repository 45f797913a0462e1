//! Inference stubs and a local file server shared by unit tests.

use crate::detector::{DetectorError, FaceDetector};
use crate::landmarks::{LandmarkError, LandmarkPredictor};
use crate::models::FaceModels;
use crate::recognizer::{DescriptorEmbedder, RecognizerError};
use crate::types::{FaceBox, FaceDescriptor, DESCRIPTOR_LEN};
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::Router;
use image::RgbImage;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub(crate) fn face_box(x: f32, confidence: f32) -> FaceBox {
    FaceBox {
        x,
        y: 4.0,
        width: 20.0,
        height: 24.0,
        confidence,
        keypoints: Some([(x + 5.0, 10.0), (x + 15.0, 10.0), (x + 10.0, 15.0), (x + 6.0, 20.0), (x + 14.0, 20.0)]),
    }
}

/// Returns its faces unfiltered, whatever the requested confidence.
pub(crate) struct StubDetector(pub Vec<FaceBox>);

impl FaceDetector for StubDetector {
    fn detect(&mut self, _image: &RgbImage, _min_confidence: f32) -> Result<Vec<FaceBox>, DetectorError> {
        Ok(self.0.clone())
    }
}

pub(crate) struct StubLandmarks;

impl LandmarkPredictor for StubLandmarks {
    fn predict(&mut self, _image: &RgbImage, face: &FaceBox) -> Result<Vec<(f32, f32)>, LandmarkError> {
        Ok(face.keypoints.map(|k| k.to_vec()).unwrap_or_default())
    }
}

/// Encodes the face's x position in the first descriptor value.
pub(crate) struct StubEmbedder;

impl DescriptorEmbedder for StubEmbedder {
    fn embed(&mut self, _image: &RgbImage, face: &FaceBox) -> Result<FaceDescriptor, RecognizerError> {
        let mut values = vec![0.0; DESCRIPTOR_LEN];
        values[0] = face.x / 100.0;
        Ok(FaceDescriptor::try_from(values)?)
    }
}

pub(crate) fn stub_models(faces: Vec<FaceBox>) -> FaceModels {
    FaceModels::new(
        Box::new(StubDetector(faces)),
        Box::new(StubLandmarks),
        Box::new(StubEmbedder),
    )
}

/// PNG bytes of a small uniform image.
pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = image::DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, image::Rgb([90, 120, 150])));
    let mut buf = Vec::new();
    image
        .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
        .expect("encode png");
    buf
}

/// Serves fixed responses by path on `127.0.0.1` and records every request
/// path. Unknown paths get a 404.
pub(crate) struct FileServer {
    pub base_url: String,
    files: Mutex<HashMap<String, (StatusCode, Vec<u8>)>>,
    requests: Mutex<Vec<String>>,
}

impl FileServer {
    pub(crate) async fn start() -> Arc<Self> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(Self {
            base_url: format!("http://{addr}"),
            files: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        });

        let app = Router::new().fallback(serve_file).with_state(server.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        server
    }

    pub(crate) fn put(&self, path: &str, status: StatusCode, body: Vec<u8>) {
        self.files.lock().unwrap().insert(path.to_string(), (status, body));
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    pub(crate) fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

async fn serve_file(State(server): State<Arc<FileServer>>, uri: Uri) -> (StatusCode, Vec<u8>) {
    let path = uri.path().to_string();
    server.requests.lock().unwrap().push(path.clone());
    server
        .files
        .lock()
        .unwrap()
        .get(&path)
        .cloned()
        .unwrap_or((StatusCode::NOT_FOUND, Vec::new()))
}
