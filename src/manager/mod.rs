mod cycle;
mod engine;

use crate::capture::{CaptureBackend, DeviceInfo};
use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::module::{Module, ModuleDesc, ModuleId, ModuleInstance, ModuleKind};
use crate::sample::Sample;
use crate::session::Session;
use crate::stream::{StreamDesc, StreamGroup, StreamOption, StreamRequest, StreamType};
use cycle::{stale_results, Cycle, Snapshot};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

/// Timeout sentinel for callers that speak in raw milliseconds
pub const TIMEOUT_INFINITE: i32 = -1;

/// Convert a millisecond timeout to the form `acquire_frame` takes.
/// Negative values block indefinitely.
pub fn timeout_from_millis(timeout_ms: i32) -> Option<Duration> {
    u64::try_from(timeout_ms).ok().map(Duration::from_millis)
}

/// How the pipeline is being driven
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// Caller advances with acquire/release
    Pull,
    /// Internal loop with handler callbacks
    Push,
}

impl Mode {
    pub(crate) fn label(self) -> &'static str {
        match self {
            Mode::Pull => "pull",
            Mode::Push => "push",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Configured,
    Initializing,
    Initialized,
    Streaming(Mode),
    /// Loop ended on a fatal error; only close is useful now
    Stopped(Mode),
}

#[derive(Debug, Clone, Default)]
struct Setup {
    groups: Vec<StreamGroup>,
    modules: Vec<ModuleDesc>,
    /// Modules paused before init; applied at every init
    paused: HashSet<ModuleId>,
}

/// Everything fixed at init and read by the loop
pub(crate) struct Runtime {
    pub modules: Vec<ModuleInstance>,
    pub groups: Vec<StreamGroup>,
    pub handler: Option<Arc<dyn Handler>>,
    pub request: StreamRequest,
}

pub(crate) struct State {
    phase: Phase,
    runtime: Option<Arc<Runtime>>,
    pub stop: bool,
    /// A frame is between acquire and release
    pub held: bool,
    /// An acquire is waiting
    acquiring: bool,
    pub cycle: Option<Cycle>,
    pub published: Option<Snapshot>,
    pub epoch: u64,
    pub sequence: u64,
    pub flush_device: bool,
    /// Samples captured before this instant are discarded
    pub flushed_at: Option<Instant>,
    failure: Option<Error>,
    pub connected: bool,
    pub device: Option<DeviceInfo>,
    loop_running: bool,
    loop_thread: Option<ThreadId>,
    /// Thread running `init`, while the phase is `Initializing`
    init_thread: Option<ThreadId>,
    teardown_pending: bool,
    pub paused: HashSet<ModuleId>,
    pub last_processed: HashMap<ModuleId, Arc<Sample>>,
}

impl State {
    fn new() -> Self {
        Self {
            phase: Phase::Configured,
            runtime: None,
            stop: false,
            held: false,
            acquiring: false,
            cycle: None,
            published: None,
            epoch: 0,
            sequence: 0,
            flush_device: false,
            flushed_at: None,
            failure: None,
            connected: false,
            device: None,
            loop_running: false,
            loop_thread: None,
            init_thread: None,
            teardown_pending: false,
            paused: HashSet::new(),
            last_processed: HashMap::new(),
        }
    }

    /// Back to a fresh configured state
    fn reset(&mut self) {
        *self = State::new();
    }
}

pub(crate) struct Shared {
    pub session: Arc<Session>,
    pub state: Mutex<State>,
    pub wake: Condvar,
    pub backend: Mutex<Box<dyn CaptureBackend>>,
}

impl Shared {
    pub fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn wait<'a>(&self, guard: MutexGuard<'a, State>) -> MutexGuard<'a, State> {
        self.wake.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait until notified or `deadline` passes; `false` once the deadline is hit
    pub fn wait_until<'a>(
        &self,
        guard: MutexGuard<'a, State>,
        deadline: Instant,
    ) -> (MutexGuard<'a, State>, bool) {
        let now = Instant::now();
        if now >= deadline {
            return (guard, false);
        }
        let (guard, _) = self
            .wake
            .wait_timeout(guard, deadline - now)
            .unwrap_or_else(PoisonError::into_inner);
        (guard, true)
    }

    pub fn backend(&self) -> MutexGuard<'_, Box<dyn CaptureBackend>> {
        self.backend.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the end of a loop run; tears down if close was requested from
    /// inside that loop. A worker loop parks its error for the next pull
    /// call, a blocking loop hands it back to its caller.
    fn loop_finished(&self, mode: Mode, result: Result<()>, park_failure: bool) -> Result<()> {
        let (teardown, result) = {
            let mut state = self.lock();
            state.loop_running = false;
            state.loop_thread = None;
            let result = match result {
                Err(err) if !state.stop => {
                    tracing::error!("Pipeline aborted: {}", ErrorChain(&err));
                    state.phase = Phase::Stopped(mode);
                    if park_failure {
                        state.failure = Some(err);
                        Ok(())
                    } else {
                        Err(err)
                    }
                }
                Err(err) => {
                    tracing::debug!("Loop error after close: {}", ErrorChain(&err));
                    if park_failure {
                        Ok(())
                    } else {
                        Err(err)
                    }
                }
                Ok(()) => Ok(()),
            };
            self.wake.notify_all();
            (std::mem::take(&mut state.teardown_pending), result)
        };
        if teardown {
            self.teardown();
        }
        result
    }

    fn teardown(&self) {
        let runtime = self.lock().runtime.clone();
        self.backend().close();
        if let Some(runtime) = runtime {
            for module in &runtime.modules {
                module.lock().reset_state();
            }
            let device = self.lock().device.clone();
            if let (Some(handler), Some(device)) = (&runtime.handler, device) {
                let _ = handler.on_connect(&device, false);
            }
        }
        let mut state = self.lock();
        state.reset();
        self.wake.notify_all();
        tracing::info!("Pipeline closed");
    }
}

/// Formats an error with its source chain for logging
struct ErrorChain<'a>(&'a Error);

impl std::fmt::Display for ErrorChain<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = std::error::Error::source(self.0);
        while let Some(err) = source {
            write!(f, ": {err}")?;
            source = std::error::Error::source(err);
        }
        Ok(())
    }
}

/// The pipeline controller
///
/// Configure streams and modules, `init`, then drive the pipeline either with
/// `acquire_frame`/`release_frame` (pull) or `stream_frames` (push). The
/// two modes are exclusive until `close`.
///
/// All methods take `&self`; wrap the manager in an `Arc` to call `close`
/// from another thread while `stream_frames(true)` blocks.
pub struct SenseManager {
    shared: Arc<Shared>,
    setup: Mutex<Setup>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SenseManager {
    pub fn new(session: Arc<Session>, backend: Box<dyn CaptureBackend>) -> Self {
        Self {
            shared: Arc::new(Shared {
                session,
                state: Mutex::new(State::new()),
                wake: Condvar::new(),
                backend: Mutex::new(backend),
            }),
            setup: Mutex::new(Setup::default()),
            worker: Mutex::new(None),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.shared.session
    }

    fn setup(&self) -> MutexGuard<'_, Setup> {
        self.setup.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_configurable(&self) -> Result<()> {
        match self.shared.lock().phase {
            Phase::Configured => Ok(()),
            _ => Err(Error::AlreadyInitialized),
        }
    }

    /// Request a group of raw streams delivered together. Each call makes an
    /// independent group; the returned id queries that group's sample.
    pub fn enable_streams(&self, group: StreamGroup) -> Result<ModuleId> {
        self.ensure_configurable()?;
        group.validate()?;
        let mut setup = self.setup();
        let id = ModuleId::stream_group(setup.groups.len() as u32);
        tracing::debug!("Enabled stream group {} ({} stream(s))", id, group.streams().len());
        setup.groups.push(group);
        Ok(id)
    }

    /// Request a single raw stream. Zero width, height or fps means "any".
    pub fn enable_stream(
        &self,
        stream: StreamType,
        width: u32,
        height: u32,
        fps: f32,
        options: StreamOption,
    ) -> Result<ModuleId> {
        let desc = StreamDesc::new(stream)
            .with_size(width, height)
            .with_fps(fps)
            .with_options(options);
        self.enable_streams(StreamGroup::single(desc))
    }

    pub fn enable_module(&self, desc: ModuleDesc) -> Result<()> {
        self.ensure_configurable()?;

        let registry = self.shared.session.registry();
        let known = match &desc.friendly_name {
            Some(name) => registry.providers(desc.id).iter().any(|p| *p == name.as_str()),
            None => registry.contains(desc.id),
        };
        if !known {
            return Err(Error::ModuleUnavailable {
                id: desc.id,
                name: desc.friendly_name,
            });
        }

        let mut setup = self.setup();
        if setup.modules.iter().any(|m| m.id == desc.id) {
            return Err(Error::DuplicateModule(desc.id));
        }
        tracing::debug!("Enabled module {}", desc.id);
        setup.modules.push(desc);
        Ok(())
    }

    pub fn enable(&self, kind: ModuleKind) -> Result<()> {
        self.enable_module(ModuleDesc::new(kind))
    }

    pub fn enable_named(&self, kind: ModuleKind, name: &str) -> Result<()> {
        self.enable_module(ModuleDesc::named(kind, name))
    }

    /// Stop or resume feeding a module. A paused module keeps its last
    /// result queryable and is not waited for.
    ///
    /// Before `init` this is configuration and holds for every later run.
    /// Afterwards it lasts until `close`.
    pub fn pause_module(&self, id: ModuleId, pause: bool) -> Result<()> {
        let mut setup = self.setup();
        if !setup.modules.iter().any(|m| m.id == id) {
            return Err(Error::UnknownModule(id));
        }
        let mut state = self.shared.lock();
        let paused = if state.phase == Phase::Configured {
            &mut setup.paused
        } else {
            &mut state.paused
        };
        if pause {
            paused.insert(id);
        } else {
            paused.remove(&id);
        }
        tracing::debug!("Module {} {}", id, if pause { "paused" } else { "resumed" });
        self.shared.wake.notify_all();
        Ok(())
    }

    pub fn pause(&self, kind: ModuleKind, pause: bool) -> Result<()> {
        self.pause_module(kind.id(), pause)
    }

    /// Open the device and configure every enabled module.
    pub fn init(&self, handler: Option<Arc<dyn Handler>>) -> Result<()> {
        {
            let setup = self.setup();
            let mut state = self.shared.lock();
            if state.phase != Phase::Configured {
                return Err(Error::AlreadyInitialized);
            }
            state.phase = Phase::Initializing;
            state.stop = false;
            state.init_thread = Some(std::thread::current().id());
            state.paused = setup.paused.clone();
        }

        let result = self.open_pipeline(handler);
        let mut state = self.shared.lock();
        state.init_thread = None;
        self.shared.wake.notify_all();
        match result {
            Ok((runtime, device)) if state.stop => {
                // A callback closed the pipeline before init finished
                state.phase = Phase::Configured;
                state.stop = false;
                state.paused.clear();
                drop(state);
                self.shared.backend().close();
                for module in &runtime.modules {
                    module.lock().reset_state();
                }
                if let Some(handler) = &runtime.handler {
                    let _ = handler.on_connect(&device, false);
                }
                tracing::info!("Pipeline closed during init");
                Err(Error::Closed)
            }
            Ok((runtime, device)) => {
                state.phase = Phase::Initialized;
                state.runtime = Some(Arc::new(runtime));
                state.device = Some(device);
                state.connected = true;
                tracing::info!("Pipeline initialized");
                Ok(())
            }
            Err(err) => {
                state.phase = Phase::Configured;
                state.paused.clear();
                tracing::error!("Pipeline init failed: {}", ErrorChain(&err));
                Err(err)
            }
        }
    }

    fn open_pipeline(&self, handler: Option<Arc<dyn Handler>>) -> Result<(Runtime, DeviceInfo)> {
        let setup = self.setup().clone();
        if setup.groups.is_empty() && setup.modules.is_empty() {
            return Err(Error::NothingEnabled);
        }

        let registry = self.shared.session.registry();
        let modules = setup
            .modules
            .iter()
            .map(|desc| Ok(ModuleInstance::new(desc.id, registry.create(desc)?)))
            .collect::<Result<Vec<_>>>()?;

        let mut request = StreamRequest::default();
        for desc in setup.groups.iter().flat_map(|g| g.streams()) {
            request.merge(*desc)?;
        }
        for module in &modules {
            for desc in module.lock().required_streams() {
                desc.validate()?;
                request.merge(desc)?;
            }
        }

        let device = self.shared.backend().open(&request).map_err(Error::Device)?;
        tracing::info!("Opened capture device {}", device.name);

        if let Some(handler) = &handler {
            // Ignored during init
            let _ = handler.on_connect(&device, true);
        }

        let configured = (|| -> Result<()> {
            for module in &modules {
                module
                    .lock()
                    .set_profile(&device.profile)
                    .map_err(|source| Error::ModuleProfile {
                        id: module.id(),
                        source,
                    })?;
                if let Some(handler) = &handler {
                    handler
                        .on_module_set_profile(module.id(), Some(module))
                        .map_err(|source| Error::HandlerAbort {
                            stage: "on_module_set_profile",
                            source,
                        })?;
                }
            }
            if let Some(handler) = &handler {
                for index in 0..setup.groups.len() {
                    handler
                        .on_module_set_profile(ModuleId::stream_group(index as u32), None)
                        .map_err(|source| Error::HandlerAbort {
                            stage: "on_module_set_profile",
                            source,
                        })?;
                }
            }
            Ok(())
        })();

        if let Err(err) = configured {
            self.shared.backend().close();
            if let Some(handler) = &handler {
                let _ = handler.on_connect(&device, false);
            }
            return Err(err);
        }

        let runtime = Runtime {
            modules,
            groups: setup.groups,
            handler,
            request,
        };
        Ok((runtime, device))
    }

    /// Enter `mode`, starting the loop bookkeeping. Returns the runtime when
    /// the caller must start a loop, `None` when the mode is already running.
    fn enter_mode(&self, mode: Mode) -> Result<Option<Arc<Runtime>>> {
        let mut state = self.shared.lock();
        let phase = state.phase;
        match phase {
            Phase::Configured | Phase::Initializing => Err(Error::NotInitialized),
            Phase::Initialized => {
                state.phase = Phase::Streaming(mode);
                state.loop_running = true;
                state.stop = false;
                Ok(state.runtime.clone())
            }
            Phase::Streaming(active) | Phase::Stopped(active) if active != mode => Err(Error::ModeConflict {
                active: active.label(),
            }),
            Phase::Streaming(_) => Ok(None),
            Phase::Stopped(_) => Err(state.failure.take().unwrap_or(Error::Closed)),
        }
    }

    fn spawn_loop(&self, runtime: Arc<Runtime>, mode: Mode) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name(format!("sense-{}", mode.label()))
            .spawn(move || {
                shared.lock().loop_thread = Some(std::thread::current().id());
                let result = engine::run(&shared, &runtime, mode);
                if let (Err(err), Some(handler)) = (&result, &runtime.handler) {
                    handler.on_status(ModuleId::CAPTURE, err.status());
                }
                let _ = shared.loop_finished(mode, result, true);
            });

        match spawned {
            Ok(handle) => {
                let previous = self
                    .worker
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .replace(handle);
                if let Some(previous) = previous {
                    let _ = previous.join();
                }
                Ok(())
            }
            Err(err) => {
                let mut state = self.shared.lock();
                state.loop_running = false;
                state.phase = Phase::Initialized;
                Err(Error::Device(anyhow::Error::from(err).context("failed to spawn pipeline thread")))
            }
        }
    }

    /// Run the capture/process loop with handler callbacks.
    ///
    /// Blocking: returns when `close` is called (`Ok`), the device is lost
    /// or a handler fails (`Err`). Non-blocking: the loop runs on its own
    /// thread and this returns immediately.
    pub fn stream_frames(&self, blocking: bool) -> Result<()> {
        let Some(runtime) = self.enter_mode(Mode::Push)? else {
            return Err(Error::ModeConflict {
                active: Mode::Push.label(),
            });
        };

        if !blocking {
            return self.spawn_loop(runtime, Mode::Push);
        }

        self.shared.lock().loop_thread = Some(std::thread::current().id());
        let result = engine::run(&self.shared, &runtime, Mode::Push);
        self.shared.loop_finished(Mode::Push, result, false)
    }

    /// Wait for the next frame and pause the pipeline on it.
    ///
    /// With `wait_all` the call returns once every unpaused module has
    /// processed the current sample; otherwise as soon as anything new is
    /// ready. `timeout` of `None` blocks indefinitely; an elapsed timeout
    /// returns `Error::Timeout` and leaves the pipeline running.
    pub fn acquire_frame(&self, wait_all: bool, timeout: Option<Duration>) -> Result<()> {
        if let Some(runtime) = self.enter_mode(Mode::Pull)? {
            self.spawn_loop(runtime, Mode::Pull)?;
        }

        let shared = &self.shared;
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = shared.lock();
        if state.held || state.acquiring {
            return Err(Error::FrameAlreadyAcquired);
        }
        state.acquiring = true;

        let result = loop {
            if let Some(err) = state.failure.take() {
                break Err(err);
            }
            if state.stop || !matches!(state.phase, Phase::Streaming(Mode::Pull)) {
                break Err(Error::Closed);
            }

            let epoch = state.epoch;
            let current = &mut *state;
            if current.cycle.as_ref().is_some_and(|c| c.epoch == epoch && c.exhausted()) {
                // Nothing new can arrive on this sample; let the next capture start
                current.cycle = None;
                shared.wake.notify_all();
            } else if let Some(cycle) = current.cycle.as_mut().filter(|c| c.epoch == epoch) {
                if cycle.deliverable(wait_all) {
                    cycle.deliver();
                    let snapshot = cycle.snapshot(stale_results(&current.paused, &current.last_processed));
                    tracing::debug!(
                        "Acquired sample {} ({} module(s) ready)",
                        snapshot.sample.sequence(),
                        snapshot.ready.len()
                    );
                    current.published = Some(snapshot);
                    current.held = true;
                    break Ok(());
                }
            }

            state = match deadline {
                None => shared.wait(state),
                Some(deadline) => {
                    let (guard, waiting) = shared.wait_until(state, deadline);
                    if !waiting {
                        state = guard;
                        break Err(Error::Timeout);
                    }
                    guard
                }
            };
        };

        state.acquiring = false;
        result
    }

    pub fn acquire_frame_blocking(&self, wait_all: bool) -> Result<()> {
        self.acquire_frame(wait_all, None)
    }

    /// Resume the pipeline after `acquire_frame`.
    pub fn release_frame(&self) -> Result<()> {
        let mut state = self.shared.lock();
        if !state.held {
            return Err(Error::NoFrameAcquired);
        }
        state.held = false;
        state.published = None;
        // A cycle that finished during the hold is kept for one more acquire
        let epoch = state.epoch;
        if state
            .cycle
            .as_ref()
            .is_some_and(|c| c.epoch != epoch || c.exhausted())
        {
            state.cycle = None;
        }
        self.shared.wake.notify_all();
        Ok(())
    }

    /// Discard buffered samples so the next acquire sees a capture started
    /// after this call.
    pub fn flush_frame(&self) {
        let mut state = self.shared.lock();
        state.epoch += 1;
        state.flush_device = true;
        state.flushed_at = Some(Instant::now());
        if !state.held {
            state.cycle = None;
        }
        tracing::debug!("Flushed pipeline (epoch {})", state.epoch);
        self.shared.wake.notify_all();
    }

    /// Stop streaming, release the device and return to the configured
    /// state. Safe to call repeatedly and from handler callbacks.
    pub fn close(&self) {
        {
            let mut state = self.shared.lock();
            if state.phase == Phase::Configured && !state.loop_running {
                return;
            }
            state.stop = true;
            state.held = false;
            self.shared.wake.notify_all();

            let current = Some(std::thread::current().id());
            if state.loop_running && state.loop_thread == current {
                // Called from a callback; the loop finishes the teardown
                state.teardown_pending = true;
                return;
            }
            if state.phase == Phase::Initializing && state.init_thread == current {
                // Called from an init callback; init unwinds
                return;
            }
            while state.loop_running || state.phase == Phase::Initializing {
                state = self.shared.wait(state);
            }
            if state.phase == Phase::Configured {
                return;
            }
        }

        if let Some(worker) = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = worker.join();
        }
        self.shared.teardown();
    }

    /// Device connection status; false outside init..close
    pub fn is_connected(&self) -> bool {
        self.shared.lock().connected
    }

    /// Whether a capture/process loop is currently running
    pub fn is_streaming(&self) -> bool {
        let state = self.shared.lock();
        state.loop_running && matches!(state.phase, Phase::Streaming(_))
    }

    /// The opened device and the profile it delivers
    pub fn device_info(&self) -> Option<DeviceInfo> {
        self.shared.lock().device.clone()
    }

    /// Sample for a module, a stream group, or `ModuleId::DEFAULT_SAMPLE`
    /// for the merged sample. `None` when it is not available for the
    /// current frame.
    pub fn query_sample(&self, id: ModuleId) -> Option<Arc<Sample>> {
        let state = self.shared.lock();
        let snapshot = state.published.as_ref()?;

        if id == ModuleId::DEFAULT_SAMPLE {
            return Some(Arc::clone(&snapshot.sample));
        }
        if let Some(index) = id.group_index(snapshot.groups.len()) {
            return Some(Arc::clone(&snapshot.groups[index]));
        }
        snapshot.result_of(id).cloned()
    }

    pub fn query_default_sample(&self) -> Option<Arc<Sample>> {
        self.query_sample(ModuleId::DEFAULT_SAMPLE)
    }

    pub fn query_sample_of(&self, kind: ModuleKind) -> Option<Arc<Sample>> {
        self.query_sample(kind.id())
    }

    /// Module handle, `None` when the module has not finished the current
    /// frame (or is not enabled)
    pub fn query_module(&self, id: ModuleId) -> Option<ModuleInstance> {
        let state = self.shared.lock();
        let snapshot = state.published.as_ref()?;
        let runtime = state.runtime.as_ref()?;

        snapshot.result_of(id)?;
        runtime.modules.iter().find(|m| m.id() == id).cloned()
    }

    pub fn query(&self, kind: ModuleKind) -> Option<ModuleInstance> {
        self.query_module(kind.id())
    }

    /// Typed access to a ready module
    pub fn query_as<T, R>(&self, id: ModuleId, f: impl FnOnce(&T) -> R) -> Option<R>
    where
        T: Module,
    {
        self.query_module(id)?.with(f)
    }

    /// Modules with a result for the current frame, in completion order
    pub fn ready_modules(&self) -> Vec<ModuleId> {
        self.shared
            .lock()
            .published
            .as_ref()
            .map(|s| s.ready.clone())
            .unwrap_or_default()
    }
}

impl Drop for SenseManager {
    fn drop(&mut self) {
        self.close();
    }
}
