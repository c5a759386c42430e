use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use sensepipe::module::{BlobModule, BlobResult};
use sensepipe::{
    CaptureBackend, DeviceInfo, Error, Handler, ModuleId, ModuleInstance, ModuleKind, Sample,
    SenseManager, Session, StreamDesc, StreamGroup, StreamType, SyntheticCapture,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Source {
    /// Generated test pattern
    Synthetic,
    /// Physical webcam (needs the `webcam` feature)
    Webcam,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DriveMode {
    /// acquire_frame / release_frame from this thread
    Pull,
    /// stream_frames with handler callbacks on the pipeline thread
    Push,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Capture source
    #[arg(long, value_enum, default_value_t = Source::Synthetic)]
    source: Source,

    /// Input webcam device index
    #[arg(short, long, default_value_t = 0)]
    input_device: u32,

    /// Capture resolution width
    #[arg(long, default_value_t = 640)]
    width: u32,

    /// Capture resolution height
    #[arg(long, default_value_t = 480)]
    height: u32,

    /// Target frames per second
    #[arg(long, default_value_t = 30.0)]
    fps: f32,

    /// Also request a depth stream, synchronized with color
    #[arg(long)]
    depth: bool,

    /// Enable the blob module
    #[arg(long)]
    blob: bool,

    /// How to drive the pipeline
    #[arg(long, value_enum, default_value_t = DriveMode::Pull)]
    mode: DriveMode,

    /// Pull mode: wait for every module before returning a frame
    #[arg(long)]
    wait_all: bool,

    /// Pull mode: acquire timeout in milliseconds (-1 blocks indefinitely)
    #[arg(long, default_value_t = 5000, allow_negative_numbers = true)]
    timeout_ms: i32,

    /// Stop after this many frames (0 runs until killed)
    #[arg(long, default_value_t = 300)]
    frames: u64,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    tracing::info!("sensepipe starting");
    tracing::info!("Capture: {}x{} @ {} fps", args.width, args.height, args.fps);
    tracing::info!("Mode: {:?}", args.mode);

    let backend = open_backend(&args)?;
    let session = Arc::new(Session::with_builtin_modules());
    let manager = session.create_sense_manager(backend);

    let mut group = StreamGroup::single(
        StreamDesc::new(StreamType::Color)
            .with_size(args.width, args.height)
            .with_fps(args.fps),
    );
    if args.depth {
        group = group.with(StreamDesc::new(StreamType::Depth).with_size(args.width, args.height));
    }
    let group_id = manager
        .enable_streams(group)
        .context("Failed to enable streams")?;

    if args.blob {
        let provider = if args.depth { "blob-depth" } else { "blob-luma" };
        manager
            .enable_named(ModuleKind::Blob, provider)
            .context("Failed to enable blob module")?;
    }

    match args.mode {
        DriveMode::Pull => {
            manager.init(None).context("Failed to initialize pipeline")?;
            log_device(manager.device_info());
            run_pull(&manager, group_id, &args)?;
        }
        DriveMode::Push => {
            let handler = Arc::new(LogHandler::default());
            manager
                .init(Some(handler.clone() as Arc<dyn Handler>))
                .context("Failed to initialize pipeline")?;
            log_device(manager.device_info());
            run_push(&manager, &handler, args.frames)?;
        }
    }

    manager.close();
    Ok(())
}

fn open_backend(args: &Args) -> Result<Box<dyn CaptureBackend>> {
    match args.source {
        Source::Synthetic => Ok(Box::new(SyntheticCapture::new())),
        #[cfg(feature = "webcam")]
        Source::Webcam => Ok(Box::new(sensepipe::capture::WebcamCapture::new(args.input_device))),
        #[cfg(not(feature = "webcam"))]
        Source::Webcam => bail!(
            "webcam {} requested but this build has no webcam support (enable the `webcam` feature)",
            args.input_device
        ),
    }
}

fn log_device(device: Option<DeviceInfo>) {
    if let Some(device) = device {
        for stream in &device.profile.streams {
            tracing::info!(
                "Device {}: {} {}x{} @ {} fps",
                device.name,
                stream.stream,
                stream.width,
                stream.height,
                stream.fps
            );
        }
    }
}

fn log_blob(sequence: u64, blob: Option<BlobResult>) {
    match blob {
        Some(blob) => tracing::info!(
            "Frame {}: blob {} px, bounds={:?}, centroid=({:.1}, {:.1})",
            sequence,
            blob.pixel_count,
            blob.bounds,
            blob.centroid.0,
            blob.centroid.1
        ),
        None => tracing::debug!("Frame {}: no blob", sequence),
    }
}

fn run_pull(manager: &SenseManager, group_id: ModuleId, args: &Args) -> Result<()> {
    let timeout = sensepipe::timeout_from_millis(args.timeout_ms);
    let mut frame_count = 0u64;
    let mut total_wait = Duration::ZERO;
    let started = Instant::now();

    tracing::info!("Starting pull loop (wait_all={})", args.wait_all);

    while args.frames == 0 || frame_count < args.frames {
        let wait_start = Instant::now();
        match manager.acquire_frame(args.wait_all, timeout) {
            Ok(()) => {}
            Err(Error::Timeout) => {
                tracing::warn!("No frame within {} ms, retrying", args.timeout_ms);
                continue;
            }
            Err(err) => return Err(err).context("Failed to acquire frame"),
        }
        total_wait += wait_start.elapsed();

        let sequence = manager
            .query_sample(group_id)
            .map(|sample| sample.sequence())
            .unwrap_or_default();
        if args.blob {
            if let Some(blob) = manager.query_as(ModuleKind::Blob.id(), |m: &BlobModule| m.result()) {
                log_blob(sequence, blob);
            }
        }

        manager.release_frame().context("Failed to release frame")?;
        frame_count += 1;

        // Log stats every 30 frames
        if frame_count % 30 == 0 {
            let avg_wait_ms = total_wait.as_secs_f64() * 1000.0 / frame_count as f64;
            let actual_fps = frame_count as f64 / started.elapsed().as_secs_f64();
            tracing::info!(
                "Frame {}: wait={:.1}ms, fps={:.1}",
                frame_count,
                avg_wait_ms,
                actual_fps
            );
        }
    }

    Ok(())
}

#[derive(Default)]
struct LogHandler {
    samples: AtomicU64,
}

impl Handler for LogHandler {
    fn on_connect(&self, device: &DeviceInfo, connected: bool) -> Result<()> {
        tracing::info!(
            "Device {} {}",
            device.name,
            if connected { "connected" } else { "disconnected" }
        );
        if !connected {
            bail!("device {} disconnected", device.name);
        }
        Ok(())
    }

    fn on_module_set_profile(&self, id: ModuleId, _module: Option<&ModuleInstance>) -> Result<()> {
        tracing::info!("Configured {}", id);
        Ok(())
    }

    fn on_module_processed_frame(&self, _id: ModuleId, module: &ModuleInstance, sample: &Sample) -> Result<()> {
        if let Some(blob) = module.with(|m: &BlobModule| m.result()) {
            log_blob(sample.sequence(), blob);
        }
        Ok(())
    }

    fn on_new_sample(&self, _id: ModuleId, sample: &Sample) -> Result<()> {
        let count = self.samples.fetch_add(1, Ordering::Relaxed) + 1;
        if count % 30 == 0 {
            tracing::info!("Frame {}: sample {}", count, sample.sequence());
        }
        Ok(())
    }

    fn on_status(&self, id: ModuleId, status: sensepipe::Status) {
        tracing::warn!("{} reported {}", id, status);
    }
}

fn run_push(manager: &SenseManager, handler: &LogHandler, frames: u64) -> Result<()> {
    manager
        .stream_frames(false)
        .context("Failed to start streaming")?;
    tracing::info!("Streaming on the pipeline thread");

    while frames == 0 || handler.samples.load(Ordering::Relaxed) < frames {
        std::thread::sleep(Duration::from_millis(50));
        if !manager.is_streaming() {
            bail!("pipeline stopped streaming");
        }
    }

    Ok(())
}
