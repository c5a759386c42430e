use super::{CaptureBackend, CaptureError, DeviceInfo};
use crate::sample::{Image, Sample};
use crate::stream::{StreamRequest, StreamType};
use anyhow::{anyhow, bail, Context, Result};
use image::RgbImage;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{CameraIndex, RequestedFormat, RequestedFormatType, Resolution};
use nokhwa::Camera;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// A decoded frame and the moment the camera handed it over
type FrameResult = std::result::Result<(RgbImage, Instant), anyhow::Error>;

/// Color-only webcam backend
///
/// The camera handle stays on its own reader thread; frames cross over a
/// two-slot channel so a slow pipeline drops to the newest frames.
pub struct WebcamCapture {
    device_index: u32,
    frames: Option<Receiver<FrameResult>>,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl WebcamCapture {
    pub fn new(device_index: u32) -> Self {
        Self {
            device_index,
            frames: None,
            stop: Arc::new(AtomicBool::new(false)),
            reader: None,
        }
    }
}

fn open_camera(device_index: u32, width: u32, height: u32) -> Result<Camera> {
    let index = CameraIndex::Index(device_index);
    let format = if width == 0 {
        RequestedFormatType::AbsoluteHighestResolution
    } else {
        RequestedFormatType::HighestResolution(Resolution::new(width, height))
    };
    let requested = RequestedFormat::new::<RgbFormat>(format);

    let mut camera = Camera::new(index, requested).context("Failed to open camera")?;

    camera
        .open_stream()
        .context("Failed to open camera stream")?;

    Ok(camera)
}

impl CaptureBackend for WebcamCapture {
    fn open(&mut self, request: &StreamRequest) -> Result<DeviceInfo> {
        if let Some(other) = request
            .streams
            .iter()
            .find(|desc| desc.stream != StreamType::Color)
        {
            bail!("webcam only delivers color, {} was requested", other.stream);
        }
        let Some(color) = request.get(StreamType::Color).copied() else {
            bail!("no color stream requested");
        };

        tracing::info!(
            "Initializing webcam {} at {}x{}",
            self.device_index,
            color.width,
            color.height
        );

        self.close();
        self.stop = Arc::new(AtomicBool::new(false));

        let (ready_tx, ready_rx) = mpsc::channel::<Result<(u32, u32, f32)>>();
        let (frame_tx, frame_rx) = mpsc::sync_channel::<FrameResult>(2);
        let stop = Arc::clone(&self.stop);
        let device_index = self.device_index;

        let reader = std::thread::Builder::new()
            .name(format!("webcam-{device_index}"))
            .spawn(move || {
                let mut camera = match open_camera(device_index, color.width, color.height) {
                    Ok(camera) => camera,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let format = camera.camera_format();
                let _ = ready_tx.send(Ok((
                    format.resolution().width(),
                    format.resolution().height(),
                    format.frame_rate() as f32,
                )));

                while !stop.load(Ordering::Relaxed) {
                    let frame = camera
                        .frame()
                        .context("Failed to capture frame")
                        .and_then(|frame| {
                            let captured_at = Instant::now();
                            let decoded = frame
                                .decode_image::<RgbFormat>()
                                .context("Failed to decode frame")?;
                            let (width, height) = (decoded.width(), decoded.height());
                            let image = RgbImage::from_raw(width, height, decoded.into_raw())
                                .context("Decoded frame has the wrong size")?;
                            Ok((image, captured_at))
                        });
                    let failed = frame.is_err();
                    if frame_tx.send(frame).is_err() || failed {
                        break;
                    }
                }
                let _ = camera.stop_stream();
            })
            .context("Failed to spawn webcam reader")?;

        let (width, height, fps) = ready_rx
            .recv()
            .map_err(|_| anyhow!("webcam reader exited during open"))??;

        tracing::info!("Webcam initialized successfully ({}x{} @ {} fps)", width, height, fps);

        self.frames = Some(frame_rx);
        self.reader = Some(reader);

        let mut profile = StreamRequest::default();
        profile.streams.push(color.with_size(width, height).with_fps(fps));
        Ok(DeviceInfo {
            name: format!("webcam {}", self.device_index),
            profile,
        })
    }

    fn read_sample(&mut self, timeout: Duration) -> std::result::Result<Option<Sample>, CaptureError> {
        let Some(frames) = &self.frames else {
            return Err(CaptureError::Disconnected);
        };

        match frames.recv_timeout(timeout) {
            Ok(Ok((image, captured_at))) => Ok(Some(
                Sample::new(0, captured_at).with_frame(StreamType::Color, Image::Rgb(image)),
            )),
            Ok(Err(err)) => Err(CaptureError::Failed(err)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(CaptureError::Disconnected),
        }
    }

    fn flush(&mut self) {
        if let Some(frames) = &self.frames {
            while frames.try_recv().is_ok() {}
        }
    }

    fn close(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        // Dropping the receiver unblocks a reader parked on a full channel
        self.frames = None;
        if let Some(reader) = self.reader.take() {
            tracing::info!("Closing webcam {}", self.device_index);
            let _ = reader.join();
        }
    }
}

impl Drop for WebcamCapture {
    fn drop(&mut self) {
        self.close();
    }
}
