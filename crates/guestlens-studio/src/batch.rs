//! Batch indexing of an event's photos.

use crate::api::{ApiError, GalleryPhoto, StudioApi};
use guestlens_core::{ExtractError, FaceExtractor, ImageSource, ModelLoadError, PhotoDescriptorRecord};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("face models unavailable: {0}")]
    Model(#[from] ModelLoadError),
    #[error("failed to save photo descriptors: {0}")]
    Persist(#[from] ApiError),
}

/// Progress after each photo of a batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchProgress {
    /// Photos attempted so far, skipped ones included.
    pub processed: usize,
    pub total: usize,
    pub photos_with_faces: usize,
    pub total_faces: usize,
}

impl BatchProgress {
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        (self.processed * 100 / self.total) as u8
    }
}

/// A photo left out of the index.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedPhoto {
    pub photo_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    /// Photos attempted, skipped ones included.
    pub photos_processed: usize,
    pub photos_with_faces: usize,
    pub total_faces: usize,
    /// One record per detected face, grouped by photo in input order.
    pub records: Vec<PhotoDescriptorRecord>,
    pub skipped: Vec<SkippedPhoto>,
    /// Set when the run stopped early on request.
    pub cancelled: bool,
}

/// How indexing an event ended.
#[derive(Debug)]
pub enum IndexOutcome {
    /// Records were found and accepted by the endpoint.
    Saved(BatchReport),
    /// Nothing to save; the endpoint was not called.
    NoFacesFound(BatchReport),
    /// Stopped before every photo was processed; the stored index is left
    /// as it was.
    Cancelled(BatchReport),
}

impl IndexOutcome {
    pub fn report(&self) -> &BatchReport {
        match self {
            IndexOutcome::Saved(report)
            | IndexOutcome::NoFacesFound(report)
            | IndexOutcome::Cancelled(report) => report,
        }
    }
}

/// Extracts descriptors from photo sets, one photo at a time.
pub struct BatchProcessor {
    extractor: Arc<dyn FaceExtractor>,
    cancel: CancellationToken,
}

impl BatchProcessor {
    pub fn new(extractor: Arc<dyn FaceExtractor>) -> Self {
        Self {
            extractor,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that stops the current and later runs between photos.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Extract every face of every photo, in order.
    ///
    /// A photo that cannot be fetched, decoded or analyzed is skipped. Only a
    /// model load failure ends the run early with an error.
    pub async fn process_photo_set<F>(
        &self,
        photos: &[GalleryPhoto],
        mut progress: F,
    ) -> Result<BatchReport, BatchError>
    where
        F: FnMut(&BatchProgress) + Send,
    {
        let mut report = BatchReport::default();

        for photo in photos {
            if self.cancel.is_cancelled() {
                tracing::info!(processed = report.photos_processed, total = photos.len(), "batch cancelled");
                report.cancelled = true;
                break;
            }

            let source = ImageSource::Url(photo.url.clone());
            match self.extractor.extract_all_faces(&source).await {
                Ok(detections) => {
                    tracing::debug!(photo_id = %photo.id, faces = detections.len(), "photo processed");
                    if !detections.is_empty() {
                        report.photos_with_faces += 1;
                        report.total_faces += detections.len();
                    }
                    report.records.extend(detections.into_iter().map(|d| {
                        PhotoDescriptorRecord::from_detection(&photo.id, &photo.name, &photo.url, d)
                    }));
                }
                Err(ExtractError::Model(e)) => {
                    tracing::error!(photo_id = %photo.id, error = %e, "face models unavailable, aborting batch");
                    return Err(BatchError::Model(e));
                }
                Err(e) => {
                    tracing::warn!(photo_id = %photo.id, error = %e, "skipping photo");
                    report.skipped.push(SkippedPhoto {
                        photo_id: photo.id.clone(),
                        reason: e.to_string(),
                    });
                }
            }

            report.photos_processed += 1;
            progress(&BatchProgress {
                processed: report.photos_processed,
                total: photos.len(),
                photos_with_faces: report.photos_with_faces,
                total_faces: report.total_faces,
            });
        }

        tracing::info!(
            photos = report.photos_processed,
            with_faces = report.photos_with_faces,
            faces = report.total_faces,
            skipped = report.skipped.len(),
            "batch finished"
        );
        Ok(report)
    }

    /// Index an event's photos and hand the records to the endpoint.
    pub async fn index_event<F>(
        &self,
        api: &dyn StudioApi,
        event_id: &str,
        photos: &[GalleryPhoto],
        progress: F,
    ) -> Result<IndexOutcome, BatchError>
    where
        F: FnMut(&BatchProgress) + Send,
    {
        let report = self.process_photo_set(photos, progress).await?;
        if report.cancelled {
            tracing::warn!(
                event_id,
                processed = report.photos_processed,
                total = photos.len(),
                "indexing cancelled, keeping the stored index"
            );
            return Ok(IndexOutcome::Cancelled(report));
        }
        if report.records.is_empty() {
            tracing::info!(event_id, "no faces found, nothing to save");
            return Ok(IndexOutcome::NoFacesFound(report));
        }

        api.save_photo_descriptors(event_id, &report.records).await?;
        tracing::info!(event_id, records = report.records.len(), "photo descriptors saved");
        Ok(IndexOutcome::Saved(report))
    }
}
