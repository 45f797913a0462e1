//! guestlens-studio: event photo indexing, guest registration and the
//! matched-photo gallery, on top of a remote studio endpoint.

pub mod api;
pub mod batch;
pub mod gallery;
pub mod registration;
pub mod session;
pub mod strategy;

#[cfg(test)]
mod testing;

pub use api::{
    ApiError, EventSummary, GalleryPhoto, GuestDetails, GuestMatch, HttpStudioClient, RetryPolicy,
    StudioApi,
};
pub use batch::{BatchError, BatchProcessor, BatchProgress, BatchReport, IndexOutcome, SkippedPhoto};
pub use gallery::{filter_matched, open_guest_gallery, resolve_access, GalleryAccess, GalleryError, GuestGallery};
pub use registration::{RegistrationError, RegistrationFlow, RegistrationStep, REDIRECT_DELAY};
pub use session::{GuestSession, SessionCache, SessionError, SESSION_KEY, SESSION_TTL_HOURS};
pub use strategy::{LocalDescriptorMatch, MatchError, MatchStrategy, RemoteSelfieMatch, Selfie};
