//! Ways of matching a guest's selfie against an event.

use crate::api::{ApiError, GuestDetails, GuestMatch, StudioApi};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use guestlens_core::{
    EuclideanMatcher, ExtractError, FaceExtractor, ImageSource, Matcher, DEFAULT_MATCH_THRESHOLD,
};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MatchError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("could not read selfie: {0}")]
    Extract(#[from] ExtractError),
    #[error("no face found in the selfie")]
    NoFaceInSelfie,
}

/// A captured selfie image.
#[derive(Debug, Clone, PartialEq)]
pub struct Selfie {
    pub bytes: Vec<u8>,
    pub mime: String,
}

impl Selfie {
    pub fn new(bytes: Vec<u8>, mime: impl Into<String>) -> Self {
        Self {
            bytes,
            mime: mime.into(),
        }
    }

    /// Read a selfie from disk, taking the media type from the extension.
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let mime = match path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("png") => "image/png",
            Some("webp") => "image/webp",
            _ => "image/jpeg",
        };
        Ok(Self::new(std::fs::read(path)?, mime))
    }

    /// `data:<mime>;base64,<payload>`
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime, STANDARD.encode(&self.bytes))
    }
}

/// Matches a guest's selfie against an event's photos and registers the guest.
#[async_trait]
pub trait MatchStrategy: Send + Sync {
    async fn match_guest(
        &self,
        event_id: &str,
        guest: &GuestDetails,
        selfie: &Selfie,
    ) -> Result<GuestMatch, MatchError>;
}

/// Sends the raw selfie to the endpoint, which extracts and matches it.
pub struct RemoteSelfieMatch {
    api: Arc<dyn StudioApi>,
}

impl RemoteSelfieMatch {
    pub fn new(api: Arc<dyn StudioApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl MatchStrategy for RemoteSelfieMatch {
    async fn match_guest(
        &self,
        event_id: &str,
        guest: &GuestDetails,
        selfie: &Selfie,
    ) -> Result<GuestMatch, MatchError> {
        let matched = self
            .api
            .match_guest_selfie(event_id, guest, &selfie.data_url())
            .await?;
        tracing::info!(event_id, matches = matched.total_matches, "selfie matched remotely");
        Ok(matched)
    }
}

/// Extracts the selfie descriptor here and matches it against the event's
/// descriptor index, leaving only registration to the endpoint.
pub struct LocalDescriptorMatch {
    api: Arc<dyn StudioApi>,
    extractor: Arc<dyn FaceExtractor>,
    threshold: f32,
}

impl LocalDescriptorMatch {
    pub fn new(api: Arc<dyn StudioApi>, extractor: Arc<dyn FaceExtractor>) -> Self {
        Self {
            api,
            extractor,
            threshold: DEFAULT_MATCH_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }
}

#[async_trait]
impl MatchStrategy for LocalDescriptorMatch {
    async fn match_guest(
        &self,
        event_id: &str,
        guest: &GuestDetails,
        selfie: &Selfie,
    ) -> Result<GuestMatch, MatchError> {
        let detections = self
            .extractor
            .extract_all_faces(&ImageSource::Bytes(selfie.bytes.clone()))
            .await?;
        let probe = detections
            .into_iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
            .ok_or(MatchError::NoFaceInSelfie)?;

        let index = self.api.photo_descriptors(event_id).await?;
        let matches = EuclideanMatcher.find_matches(&probe.descriptor, &index, self.threshold);
        let ids: Vec<String> = matches.into_iter().map(|m| m.photo_id).collect();
        tracing::info!(event_id, indexed = index.len(), matches = ids.len(), "selfie matched locally");

        Ok(self
            .api
            .register_guest(event_id, guest, &probe.descriptor, &ids)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{detection, guest_match, Call, StubApi, StubExtractor};
    use guestlens_core::PhotoDescriptorRecord;

    fn asha() -> GuestDetails {
        GuestDetails {
            name: "Asha".into(),
            phone: "9999999999".into(),
            email: None,
        }
    }

    fn record(photo_id: &str, face_index: usize, value: f32) -> PhotoDescriptorRecord {
        PhotoDescriptorRecord::from_detection(photo_id, "x.jpg", "https://x", detection(face_index, value, 0.9))
    }

    #[test]
    fn test_data_url() {
        let selfie = Selfie::new(vec![0xff, 0xd8, 0xff], "image/jpeg");
        assert_eq!(selfie.data_url(), "data:image/jpeg;base64,/9j/");
    }

    #[test]
    fn test_mime_from_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("me.PNG");
        std::fs::write(&path, b"png").unwrap();
        assert_eq!(Selfie::from_path(&path).unwrap().mime, "image/png");
    }

    #[tokio::test]
    async fn test_remote_sends_data_url() {
        let api = Arc::new(StubApi::default());
        api.matches.lock().unwrap().push(Ok(guest_match(&["P1", "P2"])));
        let strategy = RemoteSelfieMatch::new(api.clone());

        let selfie = Selfie::new(vec![1, 2, 3], "image/png");
        let matched = strategy.match_guest("E1", &asha(), &selfie).await.unwrap();

        assert_eq!(matched.matched_photo_ids, vec!["P1", "P2"]);
        assert_eq!(
            api.calls(),
            vec![Call::MatchSelfie {
                event_id: "E1".into(),
                guest: asha(),
                selfie_data: "data:image/png;base64,AQID".into(),
            }]
        );
    }

    #[tokio::test]
    async fn test_local_matches_best_face_against_index() {
        let api = Arc::new(StubApi {
            index: vec![
                record("P3", 0, 0.9),
                record("P1", 0, 0.1),
                record("P2", 0, 0.5),
                record("P1", 1, 0.3),
            ],
            ..Default::default()
        });
        // The confident face is the guest; the other is a bystander.
        let extractor = StubExtractor::new().with_default(vec![detection(0, 0.1, 0.95), detection(1, 0.9, 0.5)]);
        let strategy = LocalDescriptorMatch::new(api.clone(), Arc::new(extractor));

        let matched = strategy
            .match_guest("E1", &asha(), &Selfie::new(vec![0], "image/jpeg"))
            .await
            .unwrap();

        assert_eq!(matched.matched_photo_ids, vec!["P1", "P2"]);
        assert_eq!(
            api.calls(),
            vec![
                Call::PhotoDescriptors("E1".into()),
                Call::RegisterGuest {
                    event_id: "E1".into(),
                    matched: vec!["P1".into(), "P2".into()],
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_local_threshold() {
        let api = Arc::new(StubApi {
            index: vec![record("P1", 0, 0.1), record("P2", 0, 0.5)],
            ..Default::default()
        });
        let extractor = StubExtractor::new().with_default(vec![detection(0, 0.1, 0.95)]);
        let strategy = LocalDescriptorMatch::new(api, Arc::new(extractor)).with_threshold(0.2);

        let matched = strategy
            .match_guest("E1", &asha(), &Selfie::new(vec![0], "image/jpeg"))
            .await
            .unwrap();
        assert_eq!(matched.matched_photo_ids, vec!["P1"]);
    }

    #[tokio::test]
    async fn test_local_selfie_without_face() {
        let api = Arc::new(StubApi::default());
        let strategy = LocalDescriptorMatch::new(api.clone(), Arc::new(StubExtractor::new()));

        let err = strategy
            .match_guest("E1", &asha(), &Selfie::new(vec![0], "image/jpeg"))
            .await
            .unwrap_err();

        assert!(matches!(err, MatchError::NoFaceInSelfie));
        assert!(api.calls().is_empty());
    }
}
