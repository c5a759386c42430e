#![allow(dead_code)]

use anyhow::{bail, Result};
use image::{GrayImage, Luma, Rgb, RgbImage};
use sensepipe::{
    CaptureBackend, CaptureError, DepthImage, DeviceInfo, Handler, Image, Module, ModuleId,
    ModuleInstance, ModuleKind, Sample, SenseConfig, SenseManager, Session, Status, StreamDesc,
    StreamRequest, StreamType,
};
use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

/// Knobs shared between a test and its scripted backend
#[derive(Default)]
pub struct Control {
    /// `Some(n)`: only n more frames may be produced
    pub credits: Mutex<Option<u32>>,
    /// Report a disconnect once this many frames were produced
    pub disconnect_after: Mutex<Option<u64>>,
    /// Reject every open after the first
    pub fail_reopen: AtomicBool,
    pub opens: AtomicU32,
    /// Capture times of frames waiting in the device buffer. Served before
    /// live frames and untouched by flush.
    pub backlog: Mutex<VecDeque<Instant>>,
}

/// Pixel value of frames served from the backlog
pub const BACKLOG_TAG: u8 = 0;
/// Pixel value of frames captured on demand
pub const LIVE_TAG: u8 = 255;

impl Control {
    pub fn grant(&self, frames: u32) {
        let mut credits = self.credits.lock().unwrap();
        *credits = Some(credits.unwrap_or(0) + frames);
    }

    pub fn block(&self) {
        *self.credits.lock().unwrap() = Some(0);
    }

    /// Buffer `frames` frames captured now
    pub fn preload(&self, frames: usize) {
        let now = Instant::now();
        self.backlog.lock().unwrap().extend(std::iter::repeat(now).take(frames));
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.lock().unwrap().len()
    }
}

/// Backend that renders tiny frames for every requested stream
pub struct ScriptedCapture {
    control: Arc<Control>,
    streams: Vec<StreamType>,
    open: bool,
    produced: u64,
}

impl ScriptedCapture {
    pub fn new(control: Arc<Control>) -> Self {
        Self {
            control,
            streams: Vec::new(),
            open: false,
            produced: 0,
        }
    }

    fn render(&mut self, captured_at: Instant, tag: u8) -> Sample {
        self.produced += 1;
        let mut sample = Sample::new(0, captured_at);
        for stream in &self.streams {
            let image = match stream {
                StreamType::Color => Image::Rgb(RgbImage::from_pixel(8, 6, Rgb([tag; 3]))),
                StreamType::Depth => Image::Depth(DepthImage::from_pixel(8, 6, Luma([u16::from(tag)]))),
                _ => Image::Gray(GrayImage::from_pixel(8, 6, Luma([tag]))),
            };
            sample.insert(*stream, image);
        }
        sample
    }
}

impl CaptureBackend for ScriptedCapture {
    fn open(&mut self, request: &StreamRequest) -> Result<DeviceInfo> {
        let opens = self.control.opens.fetch_add(1, Ordering::SeqCst);
        if opens > 0 && self.control.fail_reopen.load(Ordering::SeqCst) {
            bail!("device busy");
        }
        let mut profile = StreamRequest::default();
        for desc in &request.streams {
            profile.streams.push(desc.with_size(8, 6).with_fps(1000.0));
        }
        self.streams = request.streams.iter().map(|d| d.stream).collect();
        self.open = true;
        Ok(DeviceInfo {
            name: "scripted".to_string(),
            profile,
        })
    }

    fn read_sample(&mut self, timeout: Duration) -> Result<Option<Sample>, CaptureError> {
        if !self.open {
            return Err(CaptureError::Disconnected);
        }
        {
            let mut disconnect = self.control.disconnect_after.lock().unwrap();
            if disconnect.is_some_and(|n| self.produced >= n) {
                *disconnect = None;
                self.open = false;
                return Err(CaptureError::Disconnected);
            }
        }
        let buffered = self.control.backlog.lock().unwrap().pop_front();
        if let Some(captured_at) = buffered {
            return Ok(Some(self.render(captured_at, BACKLOG_TAG)));
        }
        let exhausted = {
            let mut credits = self.control.credits.lock().unwrap();
            match credits.as_mut() {
                Some(0) => true,
                Some(n) => {
                    *n -= 1;
                    false
                }
                None => false,
            }
        };
        if exhausted {
            std::thread::sleep(timeout.min(Duration::from_millis(2)));
            return Ok(None);
        }

        std::thread::sleep(Duration::from_millis(1));
        Ok(Some(self.render(Instant::now(), LIVE_TAG)))
    }

    fn close(&mut self) {
        self.open = false;
    }
}

/// Module that records the sequences it processed
pub struct Probe {
    pub seen: Vec<u64>,
    fail_on: Option<u64>,
}

impl Probe {
    pub fn new() -> Self {
        Self {
            seen: Vec::new(),
            fail_on: None,
        }
    }

    pub fn failing_on(sequence: u64) -> Self {
        Self {
            seen: Vec::new(),
            fail_on: Some(sequence),
        }
    }
}

impl Module for Probe {
    fn required_streams(&self) -> Vec<StreamDesc> {
        vec![StreamDesc::new(StreamType::Color)]
    }

    fn process(&mut self, sample: &Sample) -> Result<()> {
        if self.fail_on == Some(sample.sequence()) {
            bail!("probe told to fail on {}", sample.sequence());
        }
        self.seen.push(sample.sequence());
        Ok(())
    }

    fn reset_state(&mut self) {
        self.seen.clear();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Module that finishes a frame only when the test sends a permit
pub struct Gate {
    permits: Arc<Mutex<Receiver<()>>>,
    pub seen: Vec<u64>,
}

impl Module for Gate {
    fn required_streams(&self) -> Vec<StreamDesc> {
        vec![StreamDesc::new(StreamType::Color)]
    }

    fn process(&mut self, sample: &Sample) -> Result<()> {
        if self.permits.lock().unwrap().recv().is_err() {
            bail!("gate closed");
        }
        self.seen.push(sample.sequence());
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub fn register_probe(session: &mut Session, kind: ModuleKind) {
    session.register(kind, "probe", || Ok(Box::new(Probe::new()) as Box<dyn Module>));
}

/// Register a gate module for `kind`; send on the returned channel to let
/// one frame through.
pub fn register_gate(session: &mut Session, kind: ModuleKind) -> Sender<()> {
    let (tx, rx) = mpsc::channel();
    let permits = Arc::new(Mutex::new(rx));
    session.register(kind, "gate", move || {
        Ok(Box::new(Gate {
            permits: Arc::clone(&permits),
            seen: Vec::new(),
        }) as Box<dyn Module>)
    });
    tx
}

pub fn fast_config() -> SenseConfig {
    SenseConfig {
        capture_poll: Duration::from_millis(10),
        reconnect_interval: Duration::from_millis(10),
        max_reconnect_attempts: 3,
    }
}

pub fn manager(session: Session) -> (SenseManager, Arc<Control>) {
    let control = Arc::new(Control::default());
    let session = Arc::new(session);
    let manager = session.create_sense_manager(Box::new(ScriptedCapture::new(Arc::clone(&control))));
    (manager, control)
}

/// Handler that logs every callback as a short string
#[derive(Default)]
pub struct Recorder {
    pub events: Mutex<Vec<String>>,
    /// Fail `on_new_sample` for this sequence
    pub abort_at: Option<u64>,
    /// Keep streaming through device loss
    pub accept_disconnect: bool,
    /// Close this manager from `on_new_sample` at `close_at`
    pub close_target: OnceLock<Weak<SenseManager>>,
    pub close_at: Option<u64>,
}

impl Recorder {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

fn label(id: ModuleId) -> String {
    match id.group_index(8) {
        Some(index) => format!("group{index}"),
        None => id.to_string(),
    }
}

impl Handler for Recorder {
    fn on_connect(&self, _device: &DeviceInfo, connected: bool) -> Result<()> {
        self.push(format!("connect:{connected}"));
        if !connected && !self.accept_disconnect {
            bail!("disconnected");
        }
        Ok(())
    }

    fn on_module_set_profile(&self, id: ModuleId, module: Option<&ModuleInstance>) -> Result<()> {
        self.push(format!("profile:{}:{}", label(id), module.is_some()));
        Ok(())
    }

    fn on_module_processed_frame(&self, id: ModuleId, _module: &ModuleInstance, sample: &Sample) -> Result<()> {
        self.push(format!("processed:{}:{}", label(id), sample.sequence()));
        Ok(())
    }

    fn on_new_sample(&self, id: ModuleId, sample: &Sample) -> Result<()> {
        self.push(format!("sample:{}:{}", label(id), sample.sequence()));
        if self.close_at == Some(sample.sequence()) {
            if let Some(manager) = self.close_target.get().and_then(Weak::upgrade) {
                manager.close();
            }
        }
        if self.abort_at == Some(sample.sequence()) {
            bail!("abort requested at {}", sample.sequence());
        }
        Ok(())
    }

    fn on_status(&self, id: ModuleId, status: Status) {
        self.push(format!("status:{}:{:?}", label(id), status));
    }
}

/// Poll `f` until it holds or `limit` passes
pub fn eventually(limit: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    f()
}
