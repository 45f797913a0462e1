//! Descriptor comparison.
//!
//! Two descriptors belong to the same person when their Euclidean distance
//! is below the threshold. Lowering the threshold trades missed matches for
//! fewer false matches.

use crate::types::{FaceDescriptor, MatchResult, PhotoDescriptorRecord};
use std::collections::HashMap;

/// Maximum descriptor distance still classified as the same person.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Compare two descriptors against `threshold`.
pub fn compare(a: &FaceDescriptor, b: &FaceDescriptor, threshold: f32) -> MatchResult {
    let distance = a.euclidean_distance(b);
    MatchResult {
        is_same_person: distance < threshold,
        distance,
        similarity: ((1.0 - distance) * 100.0).round() as i32,
    }
}

/// One photo matched by a probe descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct PhotoMatch {
    pub photo_id: String,
    /// Smallest distance over all faces in the photo.
    pub distance: f32,
    pub face_index: usize,
}

/// Strategy for finding the photos a probe descriptor appears in.
pub trait Matcher {
    fn find_matches(
        &self,
        probe: &FaceDescriptor,
        index: &[PhotoDescriptorRecord],
        threshold: f32,
    ) -> Vec<PhotoMatch>;
}

/// Euclidean matcher over a photo descriptor index.
///
/// Each photo is reported at most once with its best face. Results are
/// ordered by ascending distance, ties broken by photo id.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn find_matches(
        &self,
        probe: &FaceDescriptor,
        index: &[PhotoDescriptorRecord],
        threshold: f32,
    ) -> Vec<PhotoMatch> {
        let mut best: HashMap<&str, PhotoMatch> = HashMap::new();

        for record in index {
            let result = compare(probe, &record.descriptor, threshold);
            if !result.is_same_person {
                continue;
            }
            let better = best
                .get(record.photo_id.as_str())
                .map_or(true, |prev| result.distance < prev.distance);
            if better {
                best.insert(
                    &record.photo_id,
                    PhotoMatch {
                        photo_id: record.photo_id.clone(),
                        distance: result.distance,
                        face_index: record.face_index,
                    },
                );
            }
        }

        let mut matches: Vec<PhotoMatch> = best.into_values().collect();
        matches.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.photo_id.cmp(&b.photo_id))
        });
        matches
    }
}
