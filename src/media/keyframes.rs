// Key frame selection
//
// Ranks scored frames by dissimilarity plus a small bias toward earlier frames,
// keeps the top N, then returns them in chronological order.

use crate::constants::KEYFRAME_BIAS;

use super::{FrameBatch, ScoredFrame};

/// Ranking score. First frames of a batch always rank highest.
pub fn priority(frame: &ScoredFrame, max_frames: usize) -> f64 {
    if frame.is_must_keep() {
        return f64::INFINITY;
    }
    frame.dissimilarity + KEYFRAME_BIAS * (max_frames as f64 - frame.frame.index as f64)
}

/// Pick at most `max_frames` frames across all batches.
///
/// Ties in priority keep source order. The result is sorted by frame position,
/// then by source order.
pub fn select(batches: Vec<FrameBatch>, max_frames: usize) -> Vec<ScoredFrame> {
    if max_frames == 0 {
        return Vec::new();
    }

    let mut candidates: Vec<(usize, ScoredFrame)> = batches
        .into_iter()
        .flat_map(|batch| batch.frames)
        .enumerate()
        .collect();

    // Stable sort: equal priorities stay in source order
    candidates.sort_by(|(_, a), (_, b)| {
        priority(b, max_frames).total_cmp(&priority(a, max_frames))
    });
    candidates.truncate(max_frames);

    candidates.sort_by(|(oa, a), (ob, b)| {
        a.frame
            .position
            .cmp(&b.frame.position)
            .then(oa.cmp(ob))
    });

    candidates.into_iter().map(|(_, frame)| frame).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{Frame, MUST_KEEP};
    use image::{DynamicImage, RgbImage};

    fn scored(source: &str, index: usize, position: u64, dissimilarity: f64) -> ScoredFrame {
        let image = DynamicImage::ImageRgb8(RgbImage::new(4, 4));
        ScoredFrame {
            frame: Frame::from_image(source, index, position, image),
            dissimilarity,
        }
    }

    fn batch(source: &str, scores: &[f64]) -> FrameBatch {
        FrameBatch {
            source: source.to_string(),
            frames: scores
                .iter()
                .enumerate()
                .map(|(i, d)| scored(source, i, i as u64, *d))
                .collect(),
        }
    }

    #[test]
    fn test_selects_most_distinct_in_order() {
        let b = batch("clip", &[MUST_KEEP, 0.10, 0.50, 0.05, 0.90, 0.20, 0.30, 0.15]);
        let picked = select(vec![b], 3);

        let indices: Vec<usize> = picked.iter().map(|f| f.frame.index).collect();
        assert_eq!(indices, vec![0, 2, 4]);
    }

    #[test]
    fn test_short_batch_returns_everything() {
        let b = batch("clip", &[MUST_KEEP, 0.3]);
        assert_eq!(select(vec![b], 5).len(), 2);
    }

    #[test]
    fn test_zero_frames_requested() {
        let b = batch("clip", &[MUST_KEEP, 0.3, 0.4]);
        assert!(select(vec![b], 0).is_empty());
    }

    #[test]
    fn test_first_frame_always_kept() {
        let b = batch("clip", &[MUST_KEEP, 0.99, 0.98, 0.97]);
        let picked = select(vec![b], 1);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].frame.index, 0);
    }

    #[test]
    fn test_equal_scores_prefer_earlier_frames() {
        let b = batch("clip", &[MUST_KEEP, 0.2, 0.2, 0.2, 0.2]);
        let picked = select(vec![b], 3);
        let indices: Vec<usize> = picked.iter().map(|f| f.frame.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_batches_merge_by_position() {
        let cam_a = FrameBatch {
            source: "a".to_string(),
            frames: vec![
                scored("a", 0, 0, MUST_KEEP),
                scored("a", 1, 2000, 0.8),
            ],
        };
        let cam_b = FrameBatch {
            source: "b".to_string(),
            frames: vec![
                scored("b", 0, 10, MUST_KEEP),
                scored("b", 1, 1000, 0.7),
                scored("b", 2, 3000, 0.01),
            ],
        };

        let picked = select(vec![cam_a, cam_b], 4);
        let order: Vec<(String, u64)> = picked
            .iter()
            .map(|f| (f.frame.source.clone(), f.frame.position))
            .collect();
        assert_eq!(
            order,
            vec![
                ("a".to_string(), 0),
                ("b".to_string(), 10),
                ("b".to_string(), 1000),
                ("a".to_string(), 2000),
            ]
        );
    }
}
