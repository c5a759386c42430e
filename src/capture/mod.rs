mod synthetic;
#[cfg(feature = "webcam")]
mod v4l_capture;

pub use synthetic::SyntheticCapture;
#[cfg(feature = "webcam")]
pub use v4l_capture::WebcamCapture;

use crate::sample::Sample;
use crate::stream::StreamRequest;
use std::time::Duration;
use thiserror::Error;

/// Description of an opened capture device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub name: String,
    /// Profile the device actually delivers, one entry per open stream
    pub profile: StreamRequest,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("device disconnected")]
    Disconnected,
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Trait for camera capture backends
///
/// The pipeline is the only caller; it owns the backend for its lifetime.
pub trait CaptureBackend: Send {
    /// Open the device for every stream in `request`
    fn open(&mut self, request: &StreamRequest) -> anyhow::Result<DeviceInfo>;

    /// Read the next sample
    ///
    /// Returns `Ok(None)` when nothing arrived within `timeout`, so the
    /// caller can check for cancellation and try again. The timestamp must be
    /// the capture time; the pipeline drops samples stamped before a flush
    /// and overwrites the sequence.
    fn read_sample(&mut self, timeout: Duration) -> Result<Option<Sample>, CaptureError>;

    /// Drop any frames buffered on the device side. Best effort: stale
    /// frames that survive are discarded by their timestamp.
    fn flush(&mut self) {}

    /// Release the device. Must tolerate being called when not open.
    fn close(&mut self);
}
