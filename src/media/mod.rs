// Media ingestion
// Turns still images, video and live sources into an ordered list of encoded frames.

pub mod decoder;
pub mod encode;
pub mod fetch;
pub mod keyframes;
pub mod pipeline;
pub mod recorder;
pub mod similarity;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage};
use serde::Serialize;

use crate::constants::SCORE_MAX_WIDTH;
use crate::error::Result;
use crate::jobs::pool::WorkerPool;

/// Dissimilarity carried by the first frame of every batch. Always retained.
pub const MUST_KEEP: f64 = f64::INFINITY;

/// A decoded still with its grayscale matrix. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Frame {
    pub source: String,
    /// Position within the source's batch (decode or poll order)
    pub index: usize,
    /// Chronological key: frame number for video, milliseconds since start for recordings
    pub position: u64,
    pub image: Arc<DynamicImage>,
    pub gray: Arc<GrayImage>,
}

impl Frame {
    pub fn from_image(source: impl Into<String>, index: usize, position: u64, image: DynamicImage) -> Self {
        let gray = grayscale(&image);
        Self {
            source: source.into(),
            index,
            position,
            image: Arc::new(image),
            gray: Arc::new(gray),
        }
    }

    /// Decode an encoded still (JPEG, PNG, ...) into a frame.
    pub fn decode(source: impl Into<String>, index: usize, position: u64, bytes: &[u8]) -> Result<Self> {
        let image = image::load_from_memory(bytes)?;
        Ok(Self::from_image(source, index, position, image))
    }
}

/// Grayscale matrix used for scoring, downsized to bound scorer cost.
fn grayscale(image: &DynamicImage) -> GrayImage {
    let gray = image.to_luma8();
    if gray.width() <= SCORE_MAX_WIDTH {
        return gray;
    }
    let height = ((gray.height() as f64 * SCORE_MAX_WIDTH as f64) / gray.width() as f64)
        .round()
        .max(1.0) as u32;
    image::imageops::resize(&gray, SCORE_MAX_WIDTH, height, FilterType::Triangle)
}

#[derive(Debug, Clone)]
pub struct ScoredFrame {
    pub frame: Frame,
    /// 1 - similarity to the predecessor; `MUST_KEEP` for a batch's first frame
    pub dissimilarity: f64,
}

impl ScoredFrame {
    pub fn is_must_keep(&self) -> bool {
        self.dissimilarity == MUST_KEEP
    }
}

/// Ordered frames from one video or stream source.
#[derive(Debug, Clone, Default)]
pub struct FrameBatch {
    pub source: String,
    pub frames: Vec<ScoredFrame>,
}

impl FrameBatch {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Score consecutive frames against each other on the worker pool.
    pub fn score(pool: &WorkerPool, source: impl Into<String>, frames: Vec<Frame>) -> Result<Self> {
        let pairs: Vec<(Option<Arc<GrayImage>>, Frame)> = frames
            .iter()
            .enumerate()
            .map(|(i, frame)| {
                let previous = if i == 0 { None } else { Some(Arc::clone(&frames[i - 1].gray)) };
                (previous, frame.clone())
            })
            .collect();

        let scored = pool.map(pairs, |(previous, frame)| {
            let dissimilarity = match previous {
                Some(prev) => 1.0 - similarity::score(&prev, &frame.gray),
                None => MUST_KEEP,
            };
            Ok(ScoredFrame { frame, dissimilarity })
        })?;

        Ok(Self {
            source: source.into(),
            frames: scored,
        })
    }
}

/// Final pipeline output unit.
#[derive(Debug, Clone, Serialize)]
pub struct EncodedFrame {
    pub label: String,
    /// JPEG bytes
    #[serde(skip)]
    pub payload: Vec<u8>,
    pub target_width: u32,
}
