//! Guest registration: pick an event, enter details, capture a selfie,
//! submit for matching.

use crate::api::{ApiError, EventSummary, GuestDetails, RetryPolicy, StudioApi};
use crate::session::{GuestSession, SessionCache, SessionError};
use crate::strategy::{MatchError, MatchStrategy, Selfie};
use chrono::Utc;
use guestlens_core::ExtractError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Pause between a completed registration and showing the gallery, so the
/// guest can read the match count.
pub const REDIRECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStep {
    SelectEvent,
    EnterDetails,
    CaptureSelfie,
    Done,
}

#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("a selfie is required")]
    MissingSelfie,
    #[error("cannot {action} at step {step:?}")]
    WrongStep {
        step: RegistrationStep,
        action: &'static str,
    },
    #[error("could not reach the studio: {0}")]
    Network(#[source] ApiError),
    #[error("{0}")]
    Rejected(String),
    #[error("no face found in the selfie, please retake it")]
    NoFaceInSelfie,
    #[error("could not process the selfie: {0}")]
    Selfie(#[source] ExtractError),
    #[error("failed to store guest session: {0}")]
    Session(#[from] SessionError),
}

impl RegistrationError {
    /// Whether submitting again unchanged may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, RegistrationError::Network(e) if e.is_retriable())
    }
}

impl From<ApiError> for RegistrationError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Rejected(message) => RegistrationError::Rejected(message),
            e => RegistrationError::Network(e),
        }
    }
}

impl From<MatchError> for RegistrationError {
    fn from(e: MatchError) -> Self {
        match e {
            MatchError::Api(e) => e.into(),
            MatchError::Extract(e) => RegistrationError::Selfie(e),
            MatchError::NoFaceInSelfie => RegistrationError::NoFaceInSelfie,
        }
    }
}

/// One guest's way through registration.
///
/// Input is validated before anything is sent; a failed submit leaves the
/// flow where it was so the guest can try again.
pub struct RegistrationFlow {
    api: Arc<dyn StudioApi>,
    strategy: Arc<dyn MatchStrategy>,
    sessions: Arc<SessionCache>,
    retry: RetryPolicy,
    step: RegistrationStep,
    event_id: Option<String>,
    guest: Option<GuestDetails>,
    selfie: Option<Selfie>,
    session: Option<GuestSession>,
}

impl RegistrationFlow {
    pub fn new(
        api: Arc<dyn StudioApi>,
        strategy: Arc<dyn MatchStrategy>,
        sessions: Arc<SessionCache>,
    ) -> Self {
        Self {
            api,
            strategy,
            sessions,
            retry: RetryPolicy::default(),
            step: RegistrationStep::SelectEvent,
            event_id: None,
            guest: None,
            selfie: None,
            session: None,
        }
    }

    /// Start with the event already chosen, as when following an event link.
    pub fn for_event(
        event_id: &str,
        api: Arc<dyn StudioApi>,
        strategy: Arc<dyn MatchStrategy>,
        sessions: Arc<SessionCache>,
    ) -> Result<Self, RegistrationError> {
        let mut flow = Self::new(api, strategy, sessions);
        flow.select_event(event_id)?;
        Ok(flow)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn step(&self) -> RegistrationStep {
        self.step
    }

    pub fn event_id(&self) -> Option<&str> {
        self.event_id.as_deref()
    }

    /// The session created by a successful submit.
    pub fn session(&self) -> Option<&GuestSession> {
        self.session.as_ref()
    }

    /// Events open for registration, retrying transient failures.
    pub async fn available_events(&self) -> Result<Vec<EventSummary>, RegistrationError> {
        let api = Arc::clone(&self.api);
        let events = self
            .retry
            .run("getEvents", || {
                let api = Arc::clone(&api);
                async move { api.list_events().await }
            })
            .await?;
        Ok(events)
    }

    pub fn select_event(&mut self, event_id: &str) -> Result<(), RegistrationError> {
        self.expect_step(RegistrationStep::SelectEvent, "select an event")?;
        let event_id = event_id.trim();
        if event_id.is_empty() {
            return Err(RegistrationError::MissingField("event"));
        }
        self.event_id = Some(event_id.to_string());
        self.step = RegistrationStep::EnterDetails;
        Ok(())
    }

    pub fn enter_details(
        &mut self,
        name: &str,
        phone: &str,
        email: Option<&str>,
    ) -> Result<(), RegistrationError> {
        self.expect_step(RegistrationStep::EnterDetails, "enter details")?;
        let name = name.trim();
        let phone = phone.trim();
        if name.is_empty() {
            return Err(RegistrationError::MissingField("name"));
        }
        if phone.is_empty() {
            return Err(RegistrationError::MissingField("phone"));
        }
        let email = email.map(str::trim).filter(|e| !e.is_empty()).map(str::to_string);

        self.guest = Some(GuestDetails {
            name: name.to_string(),
            phone: phone.to_string(),
            email,
        });
        self.step = RegistrationStep::CaptureSelfie;
        Ok(())
    }

    /// Keep `selfie` as the capture to submit, replacing any earlier one.
    pub fn capture_selfie(&mut self, selfie: Selfie) -> Result<(), RegistrationError> {
        self.expect_step(RegistrationStep::CaptureSelfie, "capture a selfie")?;
        if selfie.bytes.is_empty() {
            return Err(RegistrationError::MissingSelfie);
        }
        self.selfie = Some(selfie);
        Ok(())
    }

    /// Match the selfie, store the resulting session and finish.
    ///
    /// Zero matches is a successful registration.
    pub async fn submit(&mut self) -> Result<&GuestSession, RegistrationError> {
        self.expect_step(RegistrationStep::CaptureSelfie, "submit")?;
        let (Some(event_id), Some(guest)) = (self.event_id.as_deref(), self.guest.as_ref()) else {
            return Err(RegistrationError::WrongStep {
                step: self.step,
                action: "submit",
            });
        };
        let Some(selfie) = self.selfie.as_ref() else {
            return Err(RegistrationError::MissingSelfie);
        };

        let matched = match self.strategy.match_guest(event_id, guest, selfie).await {
            Ok(matched) => matched,
            Err(e) => {
                tracing::warn!(event_id, error = %e, "registration failed");
                return Err(e.into());
            }
        };

        let session = GuestSession::from_match(event_id, &guest.name, matched, Utc::now());
        self.sessions.save(&session)?;
        tracing::info!(
            event_id,
            guest_id = %session.guest_id,
            matched = session.matched_count,
            "guest registered"
        );

        self.step = RegistrationStep::Done;
        Ok(&*self.session.insert(session))
    }

    fn expect_step(&self, step: RegistrationStep, action: &'static str) -> Result<(), RegistrationError> {
        if self.step == step {
            Ok(())
        } else {
            Err(RegistrationError::WrongStep {
                step: self.step,
                action,
            })
        }
    }
}
