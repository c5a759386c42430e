use super::types::Module;
use crate::sample::Sample;
use crate::stream::{StreamDesc, StreamType};
use anyhow::{bail, Result};
use std::any::Any;

/// Foreground summary for one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlobResult {
    /// Sequence of the sample this result was computed from
    pub sequence: u64,
    pub pixel_count: u64,
    /// (min_x, min_y, max_x, max_y), inclusive
    pub bounds: (u32, u32, u32, u32),
    pub centroid: (f32, f32),
}

/// Reference blob module
///
/// Marks foreground pixels and reports their extent. With a depth stream the
/// foreground is everything nearer than `max_depth`; without one it is every
/// color pixel brighter than `luma_threshold`.
pub struct BlobModule {
    luma_threshold: u8,
    max_depth: u16,
    use_depth: bool,
    result: Option<BlobResult>,
}

impl BlobModule {
    pub fn new() -> Self {
        Self {
            luma_threshold: 128,
            max_depth: 1000,
            use_depth: false,
            result: None,
        }
    }

    pub fn with_depth(max_depth: u16) -> Self {
        Self {
            max_depth,
            use_depth: true,
            ..Self::new()
        }
    }

    pub fn with_luma_threshold(mut self, threshold: u8) -> Self {
        self.luma_threshold = threshold;
        self
    }

    /// Most recent result, `None` when the last frame had no foreground
    pub fn result(&self) -> Option<BlobResult> {
        self.result
    }
}

impl Default for BlobModule {
    fn default() -> Self {
        Self::new()
    }
}

/// Running extent of foreground pixels
struct Extent {
    count: u64,
    sum_x: u64,
    sum_y: u64,
    min: (u32, u32),
    max: (u32, u32),
}

impl Extent {
    fn new() -> Self {
        Self {
            count: 0,
            sum_x: 0,
            sum_y: 0,
            min: (u32::MAX, u32::MAX),
            max: (0, 0),
        }
    }

    fn add(&mut self, x: u32, y: u32) {
        self.count += 1;
        self.sum_x += x as u64;
        self.sum_y += y as u64;
        self.min = (self.min.0.min(x), self.min.1.min(y));
        self.max = (self.max.0.max(x), self.max.1.max(y));
    }

    fn finish(self, sequence: u64) -> Option<BlobResult> {
        if self.count == 0 {
            return None;
        }
        Some(BlobResult {
            sequence,
            pixel_count: self.count,
            bounds: (self.min.0, self.min.1, self.max.0, self.max.1),
            centroid: (
                self.sum_x as f32 / self.count as f32,
                self.sum_y as f32 / self.count as f32,
            ),
        })
    }
}

fn luma(r: u8, g: u8, b: u8) -> u8 {
    (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32).clamp(0.0, 255.0) as u8
}

impl Module for BlobModule {
    fn required_streams(&self) -> Vec<StreamDesc> {
        if self.use_depth {
            vec![StreamDesc::new(StreamType::Depth)]
        } else {
            vec![StreamDesc::new(StreamType::Color)]
        }
    }

    fn process(&mut self, sample: &Sample) -> Result<()> {
        let _span = tracing::debug_span!("blob", sequence = sample.sequence()).entered();

        let mut extent = Extent::new();
        if self.use_depth {
            let Some(depth) = sample.depth() else {
                bail!("sample {} has no depth frame", sample.sequence());
            };
            for (x, y, pixel) in depth.enumerate_pixels() {
                // Zero is "no reading"
                if pixel[0] != 0 && pixel[0] < self.max_depth {
                    extent.add(x, y);
                }
            }
        } else {
            let Some(color) = sample.color() else {
                bail!("sample {} has no color frame", sample.sequence());
            };
            for (x, y, pixel) in color.enumerate_pixels() {
                if luma(pixel[0], pixel[1], pixel[2]) > self.luma_threshold {
                    extent.add(x, y);
                }
            }
        }

        self.result = extent.finish(sample.sequence());
        Ok(())
    }

    fn reset_state(&mut self) {
        self.result = None;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
