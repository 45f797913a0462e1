//! In-process stand-ins for the studio endpoint and the face extractor.

use crate::api::{ApiError, EventSummary, GalleryPhoto, GuestDetails, GuestMatch, StudioApi};
use async_trait::async_trait;
use guestlens_core::{
    BoundingBox, Detection, ExtractError, FaceDescriptor, FaceExtractor, ImageSource,
    PhotoDescriptorRecord, DESCRIPTOR_LEN,
};
use std::collections::HashMap;
use std::sync::Mutex;

/// Descriptor with `value` in its first component.
pub(crate) fn descriptor(value: f32) -> FaceDescriptor {
    let mut values = vec![0.0; DESCRIPTOR_LEN];
    values[0] = value;
    FaceDescriptor::try_from(values).unwrap()
}

pub(crate) fn detection(face_index: usize, value: f32, confidence: f32) -> Detection {
    Detection {
        descriptor: descriptor(value),
        bounding_box: BoundingBox {
            x: 1,
            y: 2,
            width: 10,
            height: 12,
        },
        face_index,
        confidence,
        landmarks: Vec::new(),
    }
}

pub(crate) fn photo(id: &str) -> GalleryPhoto {
    GalleryPhoto {
        id: id.to_string(),
        name: format!("{id}.jpg"),
        url: format!("https://photos.example.com/{id}.jpg"),
    }
}

pub(crate) fn guest_match(ids: &[&str]) -> GuestMatch {
    GuestMatch {
        guest_id: "G1".to_string(),
        token: "T1".to_string(),
        total_matches: ids.len(),
        matched_photo_ids: ids.iter().map(|s| s.to_string()).collect(),
    }
}

/// How a stubbed extraction for one URL turns out.
pub(crate) enum Extraction {
    Faces(Vec<Detection>),
    Undecodable,
    ModelsMissing,
}

/// Extractor answering by image URL; byte and path sources use `default`.
pub(crate) struct StubExtractor {
    pub by_url: HashMap<String, Extraction>,
    pub default: Vec<Detection>,
}

impl StubExtractor {
    pub fn new() -> Self {
        Self {
            by_url: HashMap::new(),
            default: Vec::new(),
        }
    }

    pub fn with(mut self, photo: &GalleryPhoto, extraction: Extraction) -> Self {
        self.by_url.insert(photo.url.clone(), extraction);
        self
    }

    pub fn with_default(mut self, detections: Vec<Detection>) -> Self {
        self.default = detections;
        self
    }
}

#[async_trait]
impl FaceExtractor for StubExtractor {
    async fn extract_all_faces(&self, source: &ImageSource) -> Result<Vec<Detection>, ExtractError> {
        let ImageSource::Url(url) = source else {
            return Ok(self.default.clone());
        };
        match self.by_url.get(url) {
            Some(Extraction::Faces(faces)) => Ok(faces.clone()),
            Some(Extraction::Undecodable) => Err(ExtractError::Decode(image::ImageError::IoError(
                std::io::Error::new(std::io::ErrorKind::InvalidData, "not an image"),
            ))),
            Some(Extraction::ModelsMissing) => Err(ExtractError::Model(guestlens_core::ModelLoadError::new(
                "det_500m.onnx",
                std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
            ))),
            None => Ok(Vec::new()),
        }
    }
}

/// Calls recorded by [`StubApi`].
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    ListEvents,
    EventPhotos(String),
    SaveDescriptors { event_id: String, count: usize },
    MatchSelfie { event_id: String, guest: GuestDetails, selfie_data: String },
    PhotoDescriptors(String),
    RegisterGuest { event_id: String, matched: Vec<String> },
}

/// Scripted [`StudioApi`]. Each operation pops its next scripted answer and
/// falls back to a benign default once the script runs out.
#[derive(Default)]
pub(crate) struct StubApi {
    pub calls: Mutex<Vec<Call>>,
    pub events: Mutex<Vec<Result<Vec<EventSummary>, ApiError>>>,
    pub photos: Vec<GalleryPhoto>,
    pub index: Vec<PhotoDescriptorRecord>,
    pub save: Mutex<Vec<Result<(), ApiError>>>,
    pub matches: Mutex<Vec<Result<GuestMatch, ApiError>>>,
}

impl StubApi {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn next_match(&self) -> Result<GuestMatch, ApiError> {
        let mut matches = self.matches.lock().unwrap();
        if matches.is_empty() {
            Ok(guest_match(&[]))
        } else {
            matches.remove(0)
        }
    }
}

#[async_trait]
impl StudioApi for StubApi {
    async fn list_events(&self) -> Result<Vec<EventSummary>, ApiError> {
        self.record(Call::ListEvents);
        let mut events = self.events.lock().unwrap();
        if events.is_empty() {
            Ok(Vec::new())
        } else {
            events.remove(0)
        }
    }

    async fn event_photos(&self, event_id: &str) -> Result<Vec<GalleryPhoto>, ApiError> {
        self.record(Call::EventPhotos(event_id.to_string()));
        Ok(self.photos.clone())
    }

    async fn save_photo_descriptors(
        &self,
        event_id: &str,
        records: &[PhotoDescriptorRecord],
    ) -> Result<(), ApiError> {
        self.record(Call::SaveDescriptors {
            event_id: event_id.to_string(),
            count: records.len(),
        });
        let mut save = self.save.lock().unwrap();
        if save.is_empty() {
            Ok(())
        } else {
            save.remove(0)
        }
    }

    async fn match_guest_selfie(
        &self,
        event_id: &str,
        guest: &GuestDetails,
        selfie_data: &str,
    ) -> Result<GuestMatch, ApiError> {
        self.record(Call::MatchSelfie {
            event_id: event_id.to_string(),
            guest: guest.clone(),
            selfie_data: selfie_data.to_string(),
        });
        self.next_match()
    }

    async fn photo_descriptors(&self, event_id: &str) -> Result<Vec<PhotoDescriptorRecord>, ApiError> {
        self.record(Call::PhotoDescriptors(event_id.to_string()));
        Ok(self.index.clone())
    }

    async fn register_guest(
        &self,
        event_id: &str,
        _guest: &GuestDetails,
        _descriptor: &FaceDescriptor,
        matched_photo_ids: &[String],
    ) -> Result<GuestMatch, ApiError> {
        self.record(Call::RegisterGuest {
            event_id: event_id.to_string(),
            matched: matched_photo_ids.to_vec(),
        });
        let mut answer = self.next_match()?;
        if answer.matched_photo_ids.is_empty() {
            answer.matched_photo_ids = matched_photo_ids.to_vec();
            answer.total_matches = matched_photo_ids.len();
        }
        Ok(answer)
    }
}
