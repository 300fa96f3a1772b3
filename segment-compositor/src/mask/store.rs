use std::collections::BTreeMap;

use tracing::{debug, warn};

use super::rle;
use super::types::{Mask, MaskBatch, ObjectId, Tracklet};

/// Which masks a clear request removes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearScope {
    /// Every frame and every tracklet
    All,
    /// All objects on one frame
    Frame(usize),
    /// One object on every frame, tracklet included
    Object(ObjectId),
    /// One object on one frame
    FrameObject { frame_index: usize, object_id: ObjectId },
}

/// Latest known masks per frame, plus the tracklets seen so far
///
/// Batches arrive from the mask stream in any frame order; a later mask for
/// the same object and frame replaces the earlier one.
#[derive(Debug, Default)]
pub struct MaskStore {
    frames: BTreeMap<usize, Vec<Mask>>,
    tracklets: Vec<Tracklet>,
}

impl MaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a batch. Masks without a bounding box get one computed from
    /// the payload; masks whose payload does not decode are dropped.
    pub fn apply_batch(&mut self, batch: MaskBatch) -> usize {
        let frame_index = batch.frame_index;
        let mut accepted = 0;
        for mut mask in batch.masks {
            if mask.bbox.is_none() {
                match rle::bounding_box(&mask.rle) {
                    Ok(bbox) => mask.bbox = bbox,
                    Err(e) => {
                        warn!(frame = frame_index, object = %mask.object_id, error = %e, "dropping undecodable mask");
                        continue;
                    }
                }
            }
            self.ensure_tracklet(mask.object_id);

            let masks = self.frames.entry(frame_index).or_default();
            match masks.iter_mut().find(|m| m.object_id == mask.object_id) {
                Some(existing) => *existing = mask,
                None => {
                    masks.push(mask);
                    masks.sort_by_key(|m| m.object_id);
                }
            }
            accepted += 1;
        }
        debug!(frame = frame_index, accepted, "mask batch stored");
        accepted
    }

    pub fn masks_for(&self, frame_index: usize) -> &[Mask] {
        self.frames
            .get(&frame_index)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn tracklets(&self) -> &[Tracklet] {
        &self.tracklets
    }

    pub fn ensure_tracklet(&mut self, id: ObjectId) -> Tracklet {
        match self.tracklets.binary_search_by_key(&id, |t| t.id) {
            Ok(i) => self.tracklets[i],
            Err(i) => {
                let tracklet = Tracklet::new(id);
                self.tracklets.insert(i, tracklet);
                tracklet
            }
        }
    }

    pub fn clear(&mut self, scope: ClearScope) {
        match scope {
            ClearScope::All => {
                self.frames.clear();
                self.tracklets.clear();
            }
            ClearScope::Frame(frame_index) => {
                self.frames.remove(&frame_index);
            }
            ClearScope::Object(object_id) => {
                for masks in self.frames.values_mut() {
                    masks.retain(|m| m.object_id != object_id);
                }
                self.frames.retain(|_, masks| !masks.is_empty());
                self.tracklets.retain(|t| t.id != object_id);
            }
            ClearScope::FrameObject { frame_index, object_id } => {
                if let Some(masks) = self.frames.get_mut(&frame_index) {
                    masks.retain(|m| m.object_id != object_id);
                    if masks.is_empty() {
                        self.frames.remove(&frame_index);
                    }
                }
            }
        }
    }

    /// Frames holding at least one mask
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn mask_count(&self) -> usize {
        self.frames.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::{BoundingBox, RleCounts, RleMask};

    fn mask(object: u32, runs: Vec<u32>) -> Mask {
        Mask {
            object_id: ObjectId(object),
            rle: RleMask {
                size: [4, 4],
                counts: RleCounts::Runs(runs),
            },
            bbox: None,
        }
    }

    fn batch(frame_index: usize, masks: Vec<Mask>) -> MaskBatch {
        MaskBatch { frame_index, masks }
    }

    #[test]
    fn test_apply_batch_upserts_by_object() {
        let mut store = MaskStore::new();
        store.apply_batch(batch(3, vec![mask(2, vec![0, 16]), mask(1, vec![5, 2, 9])]));
        store.apply_batch(batch(3, vec![mask(2, vec![16])]));

        let masks = store.masks_for(3);
        assert_eq!(masks.len(), 2);
        assert_eq!(masks[0].object_id, ObjectId(1));
        assert_eq!(masks[1].rle.counts, RleCounts::Runs(vec![16]));
        assert_eq!(store.tracklets().len(), 2);
        assert!(store.masks_for(4).is_empty());
    }

    #[test]
    fn test_missing_bbox_is_computed() {
        let mut store = MaskStore::new();
        store.apply_batch(batch(0, vec![mask(1, vec![5, 2, 9])]));
        assert_eq!(
            store.masks_for(0)[0].bbox,
            Some(BoundingBox::new(0.25, 0.25, 0.25, 0.5))
        );
    }

    #[test]
    fn test_malformed_mask_is_skipped() {
        let mut store = MaskStore::new();
        let accepted = store.apply_batch(batch(0, vec![mask(1, vec![3]), mask(2, vec![16])]));
        assert_eq!(accepted, 1);
        assert_eq!(store.masks_for(0)[0].object_id, ObjectId(2));
    }

    #[test]
    fn test_clear_scopes() {
        let mut store = MaskStore::new();
        for frame in 0..3 {
            store.apply_batch(batch(frame, vec![mask(1, vec![16]), mask(2, vec![16])]));
        }
        assert_eq!(store.mask_count(), 6);

        store.clear(ClearScope::FrameObject {
            frame_index: 0,
            object_id: ObjectId(1),
        });
        assert_eq!(store.masks_for(0).len(), 1);

        store.clear(ClearScope::Object(ObjectId(2)));
        assert_eq!(store.frame_count(), 2);
        assert_eq!(store.tracklets().len(), 1);

        store.clear(ClearScope::Frame(1));
        assert_eq!(store.mask_count(), 1);

        store.clear(ClearScope::All);
        assert_eq!(store.mask_count(), 0);
        assert!(store.tracklets().is_empty());
    }
}
