//! Frame-synchronized capture and module pipeline.
//!
//! A [`SenseManager`] owns one capture backend and a set of processing
//! modules. Callers enable raw streams and modules, call `init`, then either
//! pull frames with `acquire_frame`/`release_frame` or let `stream_frames`
//! push them through a [`Handler`].

pub mod capture;
pub mod config;
pub mod error;
pub mod handler;
pub mod manager;
pub mod module;
pub mod sample;
pub mod session;
pub mod stream;

pub use capture::{CaptureBackend, CaptureError, DeviceInfo, SyntheticCapture};
pub use config::SenseConfig;
pub use error::{Error, Result, Status};
pub use handler::Handler;
pub use manager::{timeout_from_millis, SenseManager, TIMEOUT_INFINITE};
pub use module::{Module, ModuleDesc, ModuleId, ModuleInstance, ModuleKind};
pub use sample::{DepthImage, Image, Sample};
pub use session::{ModuleRegistry, Session};
pub use stream::{StreamDesc, StreamGroup, StreamOption, StreamRequest, StreamType};
