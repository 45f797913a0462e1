//! Which gallery photos a guest gets to see.

use crate::api::{ApiError, GalleryPhoto, StudioApi};
use crate::session::{GuestSession, SessionCache, SessionError};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("failed to list gallery photos: {0}")]
    Api(#[from] ApiError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum GalleryAccess {
    Matched(GuestSession),
    NeedsRegistration,
}

/// A guest's view of an event gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct GuestGallery {
    pub session: GuestSession,
    pub photos: Vec<GalleryPhoto>,
}

/// Look up the stored session for `event_id`. Expired sessions and sessions
/// for another event are cleared.
pub fn resolve_access(cache: &SessionCache, event_id: &str) -> Result<GalleryAccess, GalleryError> {
    resolve_access_at(cache, event_id, Utc::now())
}

pub fn resolve_access_at(
    cache: &SessionCache,
    event_id: &str,
    now: DateTime<Utc>,
) -> Result<GalleryAccess, GalleryError> {
    let Some(session) = cache.load()? else {
        return Ok(GalleryAccess::NeedsRegistration);
    };
    if SessionCache::is_valid_at(&session, Some(event_id), now) {
        return Ok(GalleryAccess::Matched(session));
    }

    tracing::info!(
        stored_event = %session.event_id,
        event_id,
        "discarding stale guest session"
    );
    cache.clear()?;
    Ok(GalleryAccess::NeedsRegistration)
}

/// The photos the session matched, in gallery order.
pub fn filter_matched(photos: &[GalleryPhoto], session: &GuestSession) -> Vec<GalleryPhoto> {
    let matched: HashSet<&str> = session.matched_photo_ids.iter().map(String::as_str).collect();
    photos
        .iter()
        .filter(|p| matched.contains(p.id.as_str()))
        .cloned()
        .collect()
}

/// The guest's matched photos for `event_id`, or `None` when the guest has
/// to register first.
pub async fn open_guest_gallery(
    api: &dyn StudioApi,
    cache: &SessionCache,
    event_id: &str,
) -> Result<Option<GuestGallery>, GalleryError> {
    let GalleryAccess::Matched(session) = resolve_access(cache, event_id)? else {
        return Ok(None);
    };
    let all = api.event_photos(event_id).await?;
    let photos = filter_matched(&all, &session);
    tracing::debug!(event_id, listed = all.len(), shown = photos.len(), "guest gallery opened");
    Ok(Some(GuestGallery { session, photos }))
}
