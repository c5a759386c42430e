use super::cycle::{stale_results, Cycle};
use super::{Mode, Runtime, Shared};
use crate::capture::{CaptureError, DeviceInfo};
use crate::error::{Error, Result, Status};
use crate::handler::Handler;
use crate::module::{ModuleId, ModuleInstance};
use crate::sample::Sample;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn notify<F>(runtime: &Runtime, stage: &'static str, f: F) -> Result<()>
where
    F: FnOnce(&dyn Handler) -> anyhow::Result<()>,
{
    match &runtime.handler {
        Some(handler) => f(handler.as_ref()).map_err(|source| Error::HandlerAbort { stage, source }),
        None => Ok(()),
    }
}

/// Per-stage timing, logged every 30 cycles
#[derive(Default)]
struct Stats {
    cycles: u64,
    capture: Duration,
    process: Duration,
}

impl Stats {
    fn record(&mut self, capture: Duration, process: Duration) {
        self.cycles += 1;
        self.capture += capture;
        self.process += process;

        if self.cycles % 30 == 0 {
            let avg_capture_ms = self.capture.as_secs_f64() * 1000.0 / self.cycles as f64;
            let avg_process_ms = self.process.as_secs_f64() * 1000.0 / self.cycles as f64;
            tracing::debug!(
                "Cycle {}: capture={:.1}ms, process={:.1}ms",
                self.cycles,
                avg_capture_ms,
                avg_process_ms
            );
        }
    }
}

/// Drive capture/process cycles until close or a fatal error.
///
/// Pull mode holds each finished cycle until the caller releases it and
/// stops between modules while a frame is acquired. Push mode runs freely
/// and keeps the published snapshot on the live cycle.
pub(crate) fn run(shared: &Shared, runtime: &Runtime, mode: Mode) -> Result<()> {
    let poll = shared.session.config().capture_poll;
    let mut stats = Stats::default();

    tracing::info!("Streaming started in {} mode", mode.label());

    'cycles: loop {
        // Wait until the previous cycle is consumed
        let (epoch, requested_at, flush) = {
            let mut state = shared.lock();
            while !state.stop && mode == Mode::Pull && state.cycle.is_some() {
                state = shared.wait(state);
            }
            if state.stop {
                break;
            }
            (state.epoch, Instant::now(), std::mem::take(&mut state.flush_device))
        };

        if flush {
            shared.backend().flush();
        }

        let read = shared.backend().read_sample(poll);
        let mut sample = match read {
            Ok(Some(sample)) => sample,
            Ok(None) => continue,
            Err(CaptureError::Disconnected) => {
                reconnect(shared, runtime)?;
                continue;
            }
            Err(CaptureError::Failed(err)) => return Err(Error::Device(err)),
        };
        let capture_time = requested_at.elapsed();

        let (sample, groups, expected) = {
            let mut state = shared.lock();
            if state.stop {
                break;
            }
            if state.epoch != epoch {
                tracing::debug!("Discarding sample requested before flush");
                continue;
            }
            if state.flushed_at.is_some_and(|at| sample.timestamp() < at) {
                tracing::debug!("Discarding sample captured before flush");
                continue;
            }

            state.sequence += 1;
            sample.set_sequence(state.sequence);
            let sample = Arc::new(sample);
            let groups: Vec<Arc<Sample>> = runtime
                .groups
                .iter()
                .map(|group| Arc::new(sample.restricted(group.stream_types())))
                .collect();
            let expected: Vec<ModuleId> = runtime
                .modules
                .iter()
                .map(ModuleInstance::id)
                .filter(|id| !state.paused.contains(id))
                .collect();

            let cycle = Cycle::new(Arc::clone(&sample), groups.clone(), epoch, expected.clone());
            if mode == Mode::Push {
                state.published = Some(cycle.snapshot(stale_results(&state.paused, &state.last_processed)));
            }
            state.cycle = Some(cycle);
            shared.wake.notify_all();
            (sample, groups, expected)
        };

        let _span = tracing::debug_span!("cycle", sequence = sample.sequence()).entered();
        let process_start = Instant::now();

        for module in runtime.modules.iter().filter(|m| expected.contains(&m.id())) {
            let id = module.id();

            {
                let mut state = shared.lock();
                while state.held && !state.stop {
                    state = shared.wait(state);
                }
                if state.stop {
                    break 'cycles;
                }
                if state.epoch != epoch {
                    tracing::debug!("Abandoning sample {} after flush", sample.sequence());
                    if state.cycle.as_ref().is_some_and(|c| c.epoch == epoch) {
                        state.cycle = None;
                    }
                    continue 'cycles;
                }
                if state.paused.contains(&id) {
                    if let Some(cycle) = state.cycle.as_mut() {
                        cycle.mark_skipped();
                    }
                    shared.wake.notify_all();
                    continue;
                }
            }

            let outcome = {
                let _span = tracing::debug_span!("module", %id).entered();
                module.lock().process(&sample)
            };

            {
                let mut state = shared.lock();
                let state = &mut *state;
                if let Some(cycle) = state.cycle.as_mut().filter(|c| c.epoch == epoch) {
                    if outcome.is_ok() {
                        cycle.mark_ready(id);
                    } else {
                        cycle.mark_skipped();
                    }
                    if mode == Mode::Push {
                        state.published = Some(cycle.snapshot(stale_results(&state.paused, &state.last_processed)));
                    }
                }
                if outcome.is_ok() {
                    state.last_processed.insert(id, Arc::clone(&sample));
                }
                shared.wake.notify_all();
            }

            match outcome {
                Ok(()) => notify(runtime, "on_module_processed_frame", |h| {
                    h.on_module_processed_frame(id, module, &sample)
                })?,
                Err(err) => {
                    tracing::warn!("Module {} failed on sample {}: {:#}", id, sample.sequence(), err);
                    if let Some(handler) = &runtime.handler {
                        handler.on_status(id, Status::ProcessFailed);
                    }
                }
            }
        }

        for (index, group) in groups.iter().enumerate() {
            notify(runtime, "on_new_sample", |h| {
                h.on_new_sample(ModuleId::stream_group(index as u32), group)
            })?;
        }

        if mode == Mode::Push {
            shared.lock().cycle = None;
        }

        stats.record(capture_time, process_start.elapsed());
    }

    tracing::info!("Streaming stopped after {} cycle(s)", stats.cycles);
    Ok(())
}

/// Handle a lost device: ask the handler, then try to reopen it.
/// Returns `Ok` once reconnected or when close interrupts the wait.
fn reconnect(shared: &Shared, runtime: &Runtime) -> Result<()> {
    let device = {
        let mut state = shared.lock();
        state.connected = false;
        state.device.clone()
    }
    .unwrap_or_else(|| DeviceInfo {
        name: "capture".to_string(),
        profile: runtime.request.clone(),
    });

    tracing::warn!("Capture device {} lost", device.name);

    let Some(handler) = &runtime.handler else {
        return Err(Error::DeviceLost);
    };
    handler.on_status(ModuleId::CAPTURE, Status::DeviceLost);
    if let Err(err) = handler.on_connect(&device, false) {
        tracing::warn!("Handler gave up on {}: {:#}", device.name, err);
        return Err(Error::DeviceLost);
    }

    let config = shared.session.config();
    for attempt in 1..=config.max_reconnect_attempts {
        let deadline = Instant::now() + config.reconnect_interval;
        let mut state = shared.lock();
        loop {
            if state.stop {
                return Ok(());
            }
            let (guard, waiting) = shared.wait_until(state, deadline);
            state = guard;
            if !waiting {
                break;
            }
        }
        drop(state);

        let reopened = {
            let mut backend = shared.backend();
            backend.close();
            backend.open(&runtime.request)
        };
        match reopened {
            Ok(info) => {
                tracing::info!("Reconnected to {} after {} attempt(s)", info.name, attempt);
                {
                    let mut state = shared.lock();
                    state.connected = true;
                    state.device = Some(info.clone());
                }
                return handler
                    .on_connect(&info, true)
                    .map_err(|source| Error::HandlerAbort {
                        stage: "on_connect",
                        source,
                    });
            }
            Err(err) => {
                tracing::warn!("Reconnect attempt {} failed: {:#}", attempt, err);
            }
        }
    }

    Err(Error::DeviceLost)
}
