use super::{CaptureBackend, CaptureError, DeviceInfo};
use crate::sample::{DepthImage, Image, Sample};
use crate::stream::{StreamDesc, StreamRequest, StreamType};
use anyhow::{bail, Context, Result};
use image::{GrayImage, Luma, Rgb, RgbImage};
use std::time::{Duration, Instant};

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_FPS: f32 = 30.0;

/// Test-pattern source
///
/// Produces a dark gradient with a bright square that sweeps across the frame,
/// plus matching depth (square at 600mm, background at 2m) and IR frames.
/// Frames are paced at the requested rate.
pub struct SyntheticCapture {
    name: String,
    streams: Vec<StreamDesc>,
    frame_duration: Duration,
    next_due: Option<Instant>,
    frame_index: u64,
    open: bool,
}

impl SyntheticCapture {
    pub fn new() -> Self {
        Self {
            name: "synthetic".to_string(),
            streams: Vec::new(),
            frame_duration: Duration::from_secs_f32(1.0 / DEFAULT_FPS),
            next_due: None,
            frame_index: 0,
            open: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn square(&self, width: u32, height: u32) -> (u32, u32, u32) {
        let side = (width.min(height) / 4).max(1);
        let span = width.saturating_sub(side).max(1) as u64;
        let x = (self.frame_index * 8 % span) as u32;
        let y = (height - side.min(height)) / 2;
        (x, y, side)
    }

    fn render(&self, desc: &StreamDesc) -> Image {
        let (width, height) = (desc.width, desc.height);
        let (sx, sy, side) = self.square(width, height);
        let inside = |x: u32, y: u32| x >= sx && x < sx + side && y >= sy && y < sy + side;

        match desc.stream {
            StreamType::Color => Image::Rgb(RgbImage::from_fn(width, height, |x, y| {
                if inside(x, y) {
                    Rgb([240, 240, 240])
                } else {
                    let shade = (x * 64 / width.max(1)) as u8;
                    Rgb([shade, shade / 2, 32])
                }
            })),
            StreamType::Depth => Image::Depth(DepthImage::from_fn(width, height, |x, y| {
                Luma([if inside(x, y) { 600 } else { 2000 }])
            })),
            _ => Image::Gray(GrayImage::from_fn(width, height, |x, y| {
                Luma([if inside(x, y) { 200 } else { 20 }])
            })),
        }
    }
}

impl Default for SyntheticCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureBackend for SyntheticCapture {
    fn open(&mut self, request: &StreamRequest) -> Result<DeviceInfo> {
        if request.is_empty() {
            bail!("no streams requested");
        }

        let mut profile = StreamRequest::default();
        let mut fps = 0.0f32;
        for desc in &request.streams {
            let mut desc = *desc;
            if desc.width == 0 {
                desc.width = DEFAULT_WIDTH;
                desc.height = DEFAULT_HEIGHT;
            }
            if desc.fps == 0.0 {
                desc.fps = DEFAULT_FPS;
            }
            fps = fps.max(desc.fps);
            profile.streams.push(desc);
        }

        let frame_duration = Duration::try_from_secs_f32(1.0 / fps)
            .with_context(|| format!("cannot pace frames at {fps} fps"))?;

        tracing::info!(
            "Opening synthetic device {} with {} stream(s) at {} fps",
            self.name,
            profile.streams.len(),
            fps
        );

        self.streams = profile.streams.clone();
        self.frame_duration = frame_duration;
        self.next_due = None;
        self.open = true;

        Ok(DeviceInfo {
            name: self.name.clone(),
            profile,
        })
    }

    fn read_sample(&mut self, timeout: Duration) -> Result<Option<Sample>, CaptureError> {
        if !self.open {
            return Err(CaptureError::Disconnected);
        }

        let now = Instant::now();
        let due = *self.next_due.get_or_insert(now);
        if due > now {
            let wait = due - now;
            if wait > timeout {
                std::thread::sleep(timeout);
                return Ok(None);
            }
            std::thread::sleep(wait);
        }

        let mut sample = Sample::new(self.frame_index, Instant::now());
        for desc in &self.streams {
            sample.insert(desc.stream, self.render(desc));
        }

        self.frame_index += 1;
        self.next_due = Some(due.max(now) + self.frame_duration);
        Ok(Some(sample))
    }

    fn flush(&mut self) {
        self.next_due = None;
    }

    fn close(&mut self) {
        if self.open {
            tracing::info!("Closing synthetic device {}", self.name);
        }
        self.open = false;
        self.streams.clear();
    }
}
