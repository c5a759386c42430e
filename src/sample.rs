use crate::stream::StreamType;
use image::{GrayImage, ImageBuffer, Luma, RgbImage};
use std::collections::BTreeMap;
use std::time::Instant;

/// 16-bit depth map in device units
pub type DepthImage = ImageBuffer<Luma<u16>, Vec<u16>>;

/// One captured frame of a single stream
#[derive(Debug, Clone)]
pub enum Image {
    Rgb(RgbImage),
    Depth(DepthImage),
    Gray(GrayImage),
}

impl Image {
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            Image::Rgb(img) => img.dimensions(),
            Image::Depth(img) => img.dimensions(),
            Image::Gray(img) => img.dimensions(),
        }
    }
}

/// Captured frames for one cycle.
///
/// Samples are owned by the pipeline and handed out behind `Arc`; a sample
/// obtained between `acquire_frame` and `release_frame` describes that cycle
/// only and is never mutated afterwards.
#[derive(Debug, Clone)]
pub struct Sample {
    sequence: u64,
    timestamp: Instant,
    frames: BTreeMap<StreamType, Image>,
}

impl Sample {
    pub fn new(sequence: u64, timestamp: Instant) -> Self {
        Self {
            sequence,
            timestamp,
            frames: BTreeMap::new(),
        }
    }

    pub fn with_frame(mut self, stream: StreamType, image: Image) -> Self {
        self.frames.insert(stream, image);
        self
    }

    pub fn insert(&mut self, stream: StreamType, image: Image) {
        self.frames.insert(stream, image);
    }

    /// Monotonic cycle number assigned by the pipeline
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// When the pipeline requested this capture
    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    pub fn frame(&self, stream: StreamType) -> Option<&Image> {
        self.frames.get(&stream)
    }

    pub fn color(&self) -> Option<&RgbImage> {
        match self.frames.get(&StreamType::Color) {
            Some(Image::Rgb(img)) => Some(img),
            _ => None,
        }
    }

    pub fn depth(&self) -> Option<&DepthImage> {
        match self.frames.get(&StreamType::Depth) {
            Some(Image::Depth(img)) => Some(img),
            _ => None,
        }
    }

    pub fn streams(&self) -> impl Iterator<Item = StreamType> + '_ {
        self.frames.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub(crate) fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    /// Copy of this sample holding only the given streams
    pub fn restricted<I>(&self, streams: I) -> Sample
    where
        I: IntoIterator<Item = StreamType>,
    {
        let mut out = Sample::new(self.sequence, self.timestamp);
        for stream in streams {
            if let Some(image) = self.frames.get(&stream) {
                out.frames.insert(stream, image.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restricted_keeps_cycle_identity() {
        let now = Instant::now();
        let sample = Sample::new(7, now)
            .with_frame(StreamType::Color, Image::Rgb(RgbImage::new(4, 2)))
            .with_frame(StreamType::Depth, Image::Depth(DepthImage::new(4, 2)));

        let color_only = sample.restricted([StreamType::Color, StreamType::Ir]);
        assert_eq!(color_only.sequence(), 7);
        assert_eq!(color_only.timestamp(), now);
        assert!(color_only.color().is_some());
        assert!(color_only.depth().is_none());
        assert_eq!(color_only.streams().collect::<Vec<_>>(), vec![StreamType::Color]);
    }
}
