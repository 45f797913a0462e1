//! Client for the remote studio endpoint.
//!
//! Every call is a `POST` of `{"action": ..., ...}` to one endpoint URL. The
//! response carries `success` and an optional `message`; `success: false` is
//! a rejection and surfaces as [`ApiError::Rejected`].

use async_trait::async_trait;
use guestlens_core::{FaceDescriptor, PhotoDescriptorRecord};
use reqwest::{Client, StatusCode};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("endpoint returned HTTP {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("malformed response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("{0}")]
    Rejected(String),
}

impl ApiError {
    /// Whether repeating the same call may succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            ApiError::Transport(_) => true,
            ApiError::Status { status, .. } => {
                status.is_server_error()
                    || *status == StatusCode::TOO_MANY_REQUESTS
                    || *status == StatusCode::REQUEST_TIMEOUT
            }
            ApiError::Decode(_) | ApiError::Rejected(_) => false,
        }
    }
}

/// Event as listed by the endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSummary {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

/// Photo as listed in an event gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryPhoto {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
}

/// Contact details a guest registers with.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GuestDetails {
    pub name: String,
    pub phone: String,
    /// Sent as an empty string when absent.
    #[serde(serialize_with = "email_or_empty")]
    pub email: Option<String>,
}

fn email_or_empty<S: serde::Serializer>(email: &Option<String>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(email.as_deref().unwrap_or_default())
}

/// The endpoint's answer to a guest registration.
#[derive(Debug, Clone, PartialEq)]
pub struct GuestMatch {
    pub guest_id: String,
    pub token: String,
    pub total_matches: usize,
    pub matched_photo_ids: Vec<String>,
}

/// Operations of the remote studio endpoint.
#[async_trait]
pub trait StudioApi: Send + Sync {
    /// `getEvents`
    async fn list_events(&self) -> Result<Vec<EventSummary>, ApiError>;

    /// `getEventPhotosFromGallery`
    async fn event_photos(&self, event_id: &str) -> Result<Vec<GalleryPhoto>, ApiError>;

    /// `savePhotoDescriptors`
    async fn save_photo_descriptors(
        &self,
        event_id: &str,
        records: &[PhotoDescriptorRecord],
    ) -> Result<(), ApiError>;

    /// `matchGuestSelfieSimple`: the endpoint extracts and matches the selfie.
    async fn match_guest_selfie(
        &self,
        event_id: &str,
        guest: &GuestDetails,
        selfie_data: &str,
    ) -> Result<GuestMatch, ApiError>;

    /// `getPhotoDescriptors`
    async fn photo_descriptors(&self, event_id: &str) -> Result<Vec<PhotoDescriptorRecord>, ApiError>;

    /// `registerGuestMatches`: registers a guest matched on this side.
    async fn register_guest(
        &self,
        event_id: &str,
        guest: &GuestDetails,
        descriptor: &FaceDescriptor,
        matched_photo_ids: &[String],
    ) -> Result<GuestMatch, ApiError>;
}

#[derive(Serialize)]
struct ActionRequest<'a, T> {
    action: &'a str,
    #[serde(flatten)]
    payload: T,
}

#[derive(Serialize)]
struct NoPayload {}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EventRef<'a> {
    event_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SaveDescriptors<'a> {
    event_id: &'a str,
    descriptors: &'a [PhotoDescriptorRecord],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SelfieMatch<'a> {
    event_id: &'a str,
    #[serde(flatten)]
    guest: &'a GuestDetails,
    selfie_data: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterMatches<'a> {
    event_id: &'a str,
    #[serde(flatten)]
    guest: &'a GuestDetails,
    descriptor: &'a FaceDescriptor,
    matched_photo_ids: &'a [String],
}

#[derive(Deserialize)]
struct Outcome {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct Events {
    #[serde(default)]
    events: Vec<EventSummary>,
}

#[derive(Deserialize)]
struct Photos {
    #[serde(default)]
    photos: Vec<GalleryPhoto>,
}

#[derive(Deserialize)]
struct Descriptors {
    #[serde(default)]
    descriptors: Vec<PhotoDescriptorRecord>,
}

#[derive(Deserialize)]
struct MatchedPhoto {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Matches {
    guest_id: String,
    token: String,
    #[serde(default)]
    total_matches: Option<usize>,
    #[serde(default)]
    matched_photos: Vec<MatchedPhoto>,
}

impl From<Matches> for GuestMatch {
    fn from(m: Matches) -> Self {
        let matched_photo_ids: Vec<String> = m.matched_photos.into_iter().map(|p| p.id).collect();
        Self {
            guest_id: m.guest_id,
            token: m.token,
            total_matches: m.total_matches.unwrap_or(matched_photo_ids.len()),
            matched_photo_ids,
        }
    }
}

/// [`StudioApi`] over HTTP.
#[derive(Clone)]
pub struct HttpStudioClient {
    http: Client,
    endpoint: String,
}

impl HttpStudioClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(timeout)
            .build()?;
        Ok(Self::with_client(endpoint, http))
    }

    pub fn with_client(endpoint: impl Into<String>, http: Client) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn call<P, R>(&self, action: &str, payload: P) -> Result<R, ApiError>
    where
        P: Serialize + Send,
        R: DeserializeOwned + Send,
    {
        let request = ActionRequest { action, payload };
        let response = self.http.post(&self.endpoint).json(&request).send().await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ApiError::Status { status, body });
        }

        let value: serde_json::Value = serde_json::from_str(&body)?;
        let outcome = Outcome::deserialize(&value)?;
        if !outcome.success {
            let message = outcome
                .message
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| format!("{action} was rejected"));
            tracing::debug!(action, %message, "endpoint rejected request");
            return Err(ApiError::Rejected(message));
        }
        Ok(R::deserialize(&value)?)
    }
}

#[async_trait]
impl StudioApi for HttpStudioClient {
    async fn list_events(&self) -> Result<Vec<EventSummary>, ApiError> {
        let events: Events = self.call("getEvents", NoPayload {}).await?;
        Ok(events.events)
    }

    async fn event_photos(&self, event_id: &str) -> Result<Vec<GalleryPhoto>, ApiError> {
        let photos: Photos = self
            .call("getEventPhotosFromGallery", EventRef { event_id })
            .await?;
        Ok(photos.photos)
    }

    async fn save_photo_descriptors(
        &self,
        event_id: &str,
        records: &[PhotoDescriptorRecord],
    ) -> Result<(), ApiError> {
        let _: IgnoredAny = self
            .call(
                "savePhotoDescriptors",
                SaveDescriptors {
                    event_id,
                    descriptors: records,
                },
            )
            .await?;
        Ok(())
    }

    async fn match_guest_selfie(
        &self,
        event_id: &str,
        guest: &GuestDetails,
        selfie_data: &str,
    ) -> Result<GuestMatch, ApiError> {
        let matches: Matches = self
            .call(
                "matchGuestSelfieSimple",
                SelfieMatch {
                    event_id,
                    guest,
                    selfie_data,
                },
            )
            .await?;
        Ok(matches.into())
    }

    async fn photo_descriptors(&self, event_id: &str) -> Result<Vec<PhotoDescriptorRecord>, ApiError> {
        let descriptors: Descriptors = self.call("getPhotoDescriptors", EventRef { event_id }).await?;
        Ok(descriptors.descriptors)
    }

    async fn register_guest(
        &self,
        event_id: &str,
        guest: &GuestDetails,
        descriptor: &FaceDescriptor,
        matched_photo_ids: &[String],
    ) -> Result<GuestMatch, ApiError> {
        let matches: Matches = self
            .call(
                "registerGuestMatches",
                RegisterMatches {
                    event_id,
                    guest,
                    descriptor,
                    matched_photo_ids,
                },
            )
            .await?;
        Ok(matches.into())
    }
}

/// Bounded automatic retry for transient endpoint failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Run `op` until it succeeds, fails with a non-retriable error, or the
    /// attempts are used up. The last error is returned.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retriable() && attempt < attempts => {
                    tracing::warn!(what, attempt, attempts, error = %e, "retrying");
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            delay: Duration::from_millis(1),
        }
    }

    fn unavailable() -> ApiError {
        ApiError::Status {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: String::new(),
        }
    }

    #[test]
    fn test_retriable_classification() {
        assert!(unavailable().is_retriable());
        assert!(!ApiError::Rejected("bad phone".into()).is_retriable());
        assert!(!ApiError::Status {
            status: StatusCode::BAD_REQUEST,
            body: String::new()
        }
        .is_retriable());
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = quick()
            .run("getEvents", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(unavailable())
            })
            .await;

        assert!(matches!(result, Err(ApiError::Status { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_recovers() {
        let calls = AtomicU32::new(0);
        let result = quick()
            .run("getEvents", || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(unavailable())
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = quick()
            .run("getEvents", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ApiError::Rejected("no".into()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_request_body_shape() {
        let guest = GuestDetails {
            name: "Asha".into(),
            phone: "9999999999".into(),
            email: None,
        };
        let body = serde_json::to_value(ActionRequest {
            action: "matchGuestSelfieSimple",
            payload: SelfieMatch {
                event_id: "E1",
                guest: &guest,
                selfie_data: "data:image/jpeg;base64,AAAA",
            },
        })
        .unwrap();

        assert_eq!(
            body,
            serde_json::json!({
                "action": "matchGuestSelfieSimple",
                "eventId": "E1",
                "name": "Asha",
                "phone": "9999999999",
                "email": "",
                "selfieData": "data:image/jpeg;base64,AAAA",
            })
        );

        let body = serde_json::to_value(ActionRequest {
            action: "getEvents",
            payload: NoPayload {},
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({ "action": "getEvents" }));
    }

    #[test]
    fn test_match_response_defaults_total_to_matched_len() {
        let matches: Matches = serde_json::from_value(serde_json::json!({
            "success": true,
            "guestId": "G1",
            "token": "T1",
            "matchedPhotos": [{ "id": "P1", "url": "x" }, { "id": "P2" }],
        }))
        .unwrap();

        let m = GuestMatch::from(matches);
        assert_eq!(m.total_matches, 2);
        assert_eq!(m.matched_photo_ids, vec!["P1", "P2"]);
    }
}
