mod common;

use common::{manager, register_gate, register_probe, Probe, Recorder, LIVE_TAG};
use sensepipe::{
    Error, Handler, Module, ModuleId, ModuleKind, Sample, Session, StreamDesc, StreamGroup, StreamOption,
    StreamType, SyntheticCapture,
};
use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

const WAIT: Option<Duration> = Some(Duration::from_secs(5));

fn probes(kinds: &[ModuleKind]) -> Session {
    let mut session = Session::with_config(common::fast_config());
    for kind in kinds {
        register_probe(&mut session, *kind);
    }
    session
}

#[test]
fn test_color_and_face_round_trip() {
    let (manager, _control) = manager(probes(&[ModuleKind::Face]));
    manager
        .enable_stream(StreamType::Color, 640, 480, 0.0, StreamOption::Any)
        .unwrap();
    manager.enable(ModuleKind::Face).unwrap();
    manager.init(None).unwrap();
    assert!(manager.is_connected());

    manager.acquire_frame(true, WAIT).unwrap();
    let face = manager.query(ModuleKind::Face).expect("face module is ready");
    assert_eq!(face.id(), ModuleKind::Face.id());
    let seen = manager.query_as(ModuleKind::Face.id(), |probe: &Probe| probe.seen.clone());
    let sample = manager.query_sample_of(ModuleKind::Face).unwrap();
    assert_eq!(seen, Some(vec![sample.sequence()]));
    assert!(sample.color().is_some());
    manager.release_frame().unwrap();

    manager.close();
    assert!(!manager.is_connected());
    assert!(manager.query(ModuleKind::Face).is_none());
    assert!(manager.query_default_sample().is_none());
}

#[test]
fn test_wait_all_reports_every_enabled_module() {
    let kinds = [ModuleKind::Face, ModuleKind::Hand, ModuleKind::Tracker];
    let (manager, _control) = manager(probes(&kinds));
    for kind in kinds {
        manager.enable(kind).unwrap();
    }
    manager.init(None).unwrap();

    for _ in 0..5 {
        manager.acquire_frame(true, WAIT).unwrap();
        let ready = manager.ready_modules();
        assert_eq!(ready, kinds.map(|k| k.id()).to_vec());
        let sequence = manager.query_default_sample().unwrap().sequence();
        for kind in kinds {
            assert!(manager.query(kind).is_some());
            assert_eq!(manager.query_sample_of(kind).unwrap().sequence(), sequence);
        }
        assert!(manager.query(ModuleKind::Blob).is_none());
        manager.release_frame().unwrap();
    }
}

#[test]
fn test_sequences_increase_across_frames() {
    let (manager, _control) = manager(probes(&[ModuleKind::Face]));
    manager.enable(ModuleKind::Face).unwrap();
    manager.init(None).unwrap();

    let mut last = 0;
    for _ in 0..10 {
        manager.acquire_frame_blocking(true).unwrap();
        let sequence = manager.query_default_sample().unwrap().sequence();
        assert!(sequence > last);
        last = sequence;
        manager.release_frame().unwrap();
    }
}

#[test]
fn test_acquire_and_release_must_pair() {
    let (manager, _control) = manager(probes(&[ModuleKind::Face]));
    manager.enable(ModuleKind::Face).unwrap();
    manager.init(None).unwrap();

    assert!(matches!(manager.release_frame(), Err(Error::NoFrameAcquired)));
    manager.acquire_frame(true, WAIT).unwrap();
    assert!(matches!(
        manager.acquire_frame(true, WAIT),
        Err(Error::FrameAlreadyAcquired)
    ));
    manager.release_frame().unwrap();
    assert!(matches!(manager.release_frame(), Err(Error::NoFrameAcquired)));
}

#[test]
fn test_timeout_leaves_pipeline_running() {
    let (manager, control) = manager(probes(&[ModuleKind::Face]));
    manager.enable(ModuleKind::Face).unwrap();
    manager.init(None).unwrap();
    control.block();

    let started = Instant::now();
    let result = manager.acquire_frame(true, Some(Duration::ZERO));
    assert!(matches!(result, Err(Error::Timeout)));
    assert!(started.elapsed() < Duration::from_secs(1));

    let started = Instant::now();
    let result = manager.acquire_frame(true, Some(Duration::from_millis(30)));
    assert!(matches!(result, Err(ref err) if err.is_recoverable()));
    assert!(started.elapsed() >= Duration::from_millis(30));

    control.grant(1);
    manager.acquire_frame(true, WAIT).unwrap();
    assert!(manager.query(ModuleKind::Face).is_some());
    manager.release_frame().unwrap();
}

#[test]
fn test_partial_readiness_then_same_sample_complete() {
    let mut session = probes(&[ModuleKind::Face]);
    let permits = register_gate(&mut session, ModuleKind::Hand);
    let (manager, _control) = manager(session);
    manager.enable(ModuleKind::Face).unwrap();
    manager.enable(ModuleKind::Hand).unwrap();
    manager.init(None).unwrap();

    manager.acquire_frame(false, WAIT).unwrap();
    assert_eq!(manager.ready_modules(), vec![ModuleKind::Face.id()]);
    assert!(manager.query(ModuleKind::Hand).is_none());
    assert!(manager.query_sample_of(ModuleKind::Hand).is_none());
    let first = manager.query_sample_of(ModuleKind::Face).unwrap().sequence();
    manager.release_frame().unwrap();

    permits.send(()).unwrap();
    manager.acquire_frame(true, WAIT).unwrap();
    assert_eq!(
        manager.ready_modules(),
        vec![ModuleKind::Face.id(), ModuleKind::Hand.id()]
    );
    assert_eq!(manager.query_sample_of(ModuleKind::Hand).unwrap().sequence(), first);
    manager.release_frame().unwrap();

    drop(permits);
    manager.close();
}

#[test]
fn test_flush_discards_older_captures() {
    let (manager, control) = manager(probes(&[ModuleKind::Face]));
    manager.enable(ModuleKind::Face).unwrap();
    manager.init(None).unwrap();

    // Frames buffered by the device survive its (no-op) flush
    control.block();
    control.preload(5);
    std::thread::sleep(Duration::from_millis(5));
    let flushed_at = Instant::now();
    manager.flush_frame();
    control.grant(1);

    manager.acquire_frame(true, WAIT).unwrap();
    let sample = manager.query_default_sample().unwrap();
    assert!(sample.timestamp() >= flushed_at);
    assert_eq!(sample.color().unwrap().get_pixel(0, 0).0, [LIVE_TAG; 3]);
    assert_eq!(sample.sequence(), 1);
    assert_eq!(control.backlog_len(), 0);
    manager.release_frame().unwrap();
}

#[test]
fn test_flush_while_streaming() {
    let (manager, control) = manager(probes(&[ModuleKind::Face]));
    manager.enable(ModuleKind::Face).unwrap();
    manager.init(None).unwrap();

    manager.acquire_frame(true, WAIT).unwrap();
    let before = manager.query_default_sample().unwrap().sequence();
    control.block();
    control.preload(3);
    std::thread::sleep(Duration::from_millis(5));
    manager.flush_frame();
    let flushed_at = Instant::now();
    manager.release_frame().unwrap();
    control.grant(1);

    manager.acquire_frame(true, WAIT).unwrap();
    let sample = manager.query_default_sample().unwrap();
    assert_eq!(sample.sequence(), before + 1);
    assert!(sample.timestamp() >= flushed_at);
    assert_eq!(sample.color().unwrap().get_pixel(0, 0).0, [LIVE_TAG; 3]);
    manager.release_frame().unwrap();
}

#[test]
fn test_paused_module_keeps_stale_result() {
    let (manager, _control) = manager(probes(&[ModuleKind::Face, ModuleKind::Hand]));
    manager.enable(ModuleKind::Face).unwrap();
    manager.enable(ModuleKind::Hand).unwrap();
    manager.pause(ModuleKind::Hand, true).unwrap();
    manager.init(None).unwrap();

    // Never processed: nothing to report yet
    manager.acquire_frame(true, WAIT).unwrap();
    assert_eq!(manager.ready_modules(), vec![ModuleKind::Face.id()]);
    assert!(manager.query(ModuleKind::Hand).is_none());
    manager.pause(ModuleKind::Hand, false).unwrap();
    manager.release_frame().unwrap();

    manager.acquire_frame(true, WAIT).unwrap();
    let resumed = manager.query_sample_of(ModuleKind::Hand).unwrap().sequence();
    manager.pause(ModuleKind::Hand, true).unwrap();
    manager.release_frame().unwrap();

    manager.acquire_frame(true, WAIT).unwrap();
    assert_eq!(manager.ready_modules(), vec![ModuleKind::Face.id()]);
    assert!(manager.query_default_sample().unwrap().sequence() > resumed);
    assert!(manager.query(ModuleKind::Hand).is_some());
    assert_eq!(manager.query_sample_of(ModuleKind::Hand).unwrap().sequence(), resumed);
    manager.release_frame().unwrap();

    assert!(matches!(
        manager.pause(ModuleKind::Blob, true),
        Err(Error::UnknownModule(_))
    ));
}

#[test]
fn test_pauses_during_a_run_end_at_close() {
    let kinds = [ModuleKind::Face, ModuleKind::Hand];
    let (manager, _control) = manager(probes(&kinds));
    manager.enable(ModuleKind::Face).unwrap();
    manager.enable(ModuleKind::Hand).unwrap();
    manager.pause(ModuleKind::Hand, true).unwrap();
    manager.init(None).unwrap();

    manager.acquire_frame(true, WAIT).unwrap();
    assert_eq!(manager.ready_modules(), vec![ModuleKind::Face.id()]);
    manager.pause(ModuleKind::Hand, false).unwrap();
    manager.release_frame().unwrap();

    manager.acquire_frame(true, WAIT).unwrap();
    assert_eq!(manager.ready_modules(), kinds.map(|k| k.id()).to_vec());
    manager.pause(ModuleKind::Face, true).unwrap();
    manager.release_frame().unwrap();

    manager.acquire_frame(true, WAIT).unwrap();
    assert_eq!(manager.ready_modules(), vec![ModuleKind::Hand.id()]);
    assert!(manager.query(ModuleKind::Face).is_some());
    manager.release_frame().unwrap();
    manager.close();

    // Pausing Face and resuming Hand were runtime changes; the pre-init
    // pause of Hand is configuration and applies again
    manager.init(None).unwrap();
    manager.acquire_frame(true, WAIT).unwrap();
    assert_eq!(manager.ready_modules(), vec![ModuleKind::Face.id()]);
    assert!(manager.query(ModuleKind::Hand).is_none());
    assert_eq!(manager.query_default_sample().unwrap().sequence(), 1);
    manager.release_frame().unwrap();
}

#[test]
fn test_snapshot_is_stable_while_held() {
    let mut session = probes(&[ModuleKind::Face]);
    let permits = register_gate(&mut session, ModuleKind::Hand);
    let (manager, _control) = manager(session);
    manager.enable(ModuleKind::Face).unwrap();
    manager.enable(ModuleKind::Hand).unwrap();
    manager.init(None).unwrap();

    permits.send(()).unwrap();
    manager.acquire_frame(true, WAIT).unwrap();
    let first = manager.query_default_sample().unwrap().sequence();
    manager.release_frame().unwrap();

    manager.acquire_frame(false, WAIT).unwrap();
    assert_eq!(manager.ready_modules(), vec![ModuleKind::Face.id()]);
    assert!(manager.query_sample_of(ModuleKind::Hand).is_none());

    // Hand has a result from the first frame, but pausing it now must not
    // change what this acquire shows
    manager.pause(ModuleKind::Hand, true).unwrap();
    assert!(manager.query_sample_of(ModuleKind::Hand).is_none());
    assert!(manager.query(ModuleKind::Hand).is_none());
    assert_eq!(manager.ready_modules(), vec![ModuleKind::Face.id()]);
    manager.release_frame().unwrap();

    // Hand may already be waiting at its gate; closing the gate ends that
    // sample either way, and the next acquire sees the pause
    drop(permits);
    manager.acquire_frame(true, WAIT).unwrap();
    assert_eq!(manager.ready_modules(), vec![ModuleKind::Face.id()]);
    assert_eq!(manager.query_sample_of(ModuleKind::Hand).unwrap().sequence(), first);
    manager.release_frame().unwrap();
    manager.close();
}

#[test]
fn test_repeat_partial_acquire_waits_for_a_new_sample() {
    let mut session = probes(&[ModuleKind::Face]);
    let permits = register_gate(&mut session, ModuleKind::Hand);
    let (manager, _control) = manager(session);
    manager.enable(ModuleKind::Face).unwrap();
    manager.enable(ModuleKind::Hand).unwrap();
    manager.init(None).unwrap();

    manager.acquire_frame(false, WAIT).unwrap();
    let first = manager.query_default_sample().unwrap().sequence();
    manager.release_frame().unwrap();

    // Hand fails on the held sample, so nothing new arrives on it
    drop(permits);
    manager.acquire_frame(false, WAIT).unwrap();
    assert!(manager.query_default_sample().unwrap().sequence() > first);
    assert_eq!(manager.ready_modules(), vec![ModuleKind::Face.id()]);
    manager.release_frame().unwrap();
}

/// Module asking for a stream descriptor it cannot get
struct Demanding(StreamDesc);

impl Module for Demanding {
    fn required_streams(&self) -> Vec<StreamDesc> {
        vec![self.0]
    }

    fn process(&mut self, _sample: &Sample) -> anyhow::Result<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[test]
fn test_unusable_rates_fail_init() {
    let mut session = Session::with_config(common::fast_config());
    session.register(ModuleKind::Face, "nan", || {
        Ok(Box::new(Demanding(StreamDesc::new(StreamType::Color).with_fps(f32::NAN))) as Box<dyn Module>)
    });
    let (manager, control) = manager(session);
    manager.enable(ModuleKind::Face).unwrap();
    assert!(matches!(manager.init(None), Err(Error::InvalidStream(_))));
    assert_eq!(control.opens.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert!(!manager.is_connected());

    let session = Arc::new(Session::with_config(common::fast_config()));
    let manager = session.create_sense_manager(Box::new(SyntheticCapture::new()));
    manager
        .enable_stream(StreamType::Color, 0, 0, 1e-30, StreamOption::Any)
        .unwrap();
    assert!(matches!(manager.init(None), Err(Error::Device(_))));
    assert!(matches!(manager.acquire_frame(true, WAIT), Err(Error::NotInitialized)));
}

#[test]
fn test_stream_groups_are_restricted() {
    let (manager, _control) = manager(Session::with_config(common::fast_config()));
    let both = manager
        .enable_streams(
            StreamGroup::single(StreamDesc::new(StreamType::Color)).with(StreamDesc::new(StreamType::Depth)),
        )
        .unwrap();
    let ir = manager
        .enable_stream(StreamType::Ir, 0, 0, 0.0, StreamOption::Any)
        .unwrap();
    assert_eq!(both, ModuleId::stream_group(0));
    assert_eq!(ir, ModuleId::stream_group(1));
    manager.init(None).unwrap();

    let profile = manager.device_info().unwrap().profile;
    assert!(profile.get(StreamType::Depth).is_some());

    manager.acquire_frame(false, WAIT).unwrap();
    let group = manager.query_sample(both).unwrap();
    assert!(group.color().is_some());
    assert!(group.depth().is_some());
    assert!(group.frame(StreamType::Ir).is_none());

    let ir_sample = manager.query_sample(ir).unwrap();
    assert_eq!(ir_sample.streams().collect::<Vec<_>>(), vec![StreamType::Ir]);
    assert_eq!(ir_sample.sequence(), group.sequence());

    let merged = manager.query_default_sample().unwrap();
    assert_eq!(merged.streams().count(), 3);
    manager.release_frame().unwrap();
}

#[test]
fn test_configuration_errors() {
    let (manager, _control) = manager(probes(&[ModuleKind::Face]));
    assert!(manager.session().registry().contains(ModuleKind::Face.id()));
    assert!(matches!(manager.init(None), Err(Error::NothingEnabled)));
    assert!(matches!(
        manager.acquire_frame(true, WAIT),
        Err(Error::NotInitialized)
    ));
    assert!(matches!(
        manager.enable(ModuleKind::Hand),
        Err(Error::ModuleUnavailable { .. })
    ));
    assert!(matches!(
        manager.enable_named(ModuleKind::Face, "gpu"),
        Err(Error::ModuleUnavailable { .. })
    ));

    manager.enable_named(ModuleKind::Face, "probe").unwrap();
    assert!(matches!(
        manager.enable(ModuleKind::Face),
        Err(Error::DuplicateModule(_))
    ));
    manager.init(None).unwrap();

    assert!(matches!(
        manager.enable_stream(StreamType::Color, 0, 0, 0.0, StreamOption::Any),
        Err(Error::AlreadyInitialized)
    ));
    assert!(matches!(manager.init(None), Err(Error::AlreadyInitialized)));
}

#[test]
fn test_modes_are_exclusive() {
    let (manager, _control) = manager(probes(&[ModuleKind::Face]));
    manager.enable(ModuleKind::Face).unwrap();
    manager.init(None).unwrap();

    manager.acquire_frame(true, WAIT).unwrap();
    manager.release_frame().unwrap();
    assert!(matches!(
        manager.stream_frames(false),
        Err(Error::ModeConflict { active: "pull" })
    ));
    assert!(matches!(
        manager.stream_frames(true),
        Err(Error::ModeConflict { active: "pull" })
    ));
}

#[test]
fn test_module_failure_is_not_fatal() {
    let mut session = Session::with_config(common::fast_config());
    session.register(ModuleKind::Face, "flaky", || {
        Ok(Box::new(Probe::failing_on(1)) as Box<dyn sensepipe::Module>)
    });
    let (manager, _control) = manager(session);
    let recorder = Arc::new(Recorder::default());
    manager.enable(ModuleKind::Face).unwrap();
    manager.init(Some(recorder.clone() as Arc<dyn Handler>)).unwrap();

    manager.acquire_frame(true, WAIT).unwrap();
    assert_eq!(manager.query_default_sample().unwrap().sequence(), 1);
    assert!(manager.query(ModuleKind::Face).is_none());
    manager.release_frame().unwrap();
    assert!(common::eventually(Duration::from_secs(2), || {
        recorder.events().iter().any(|e| e == "status:face:ProcessFailed")
    }));

    manager.acquire_frame(true, WAIT).unwrap();
    assert!(manager.query(ModuleKind::Face).is_some());
    manager.release_frame().unwrap();
}

#[test]
fn test_device_loss_surfaces_on_acquire() {
    let (manager, control) = manager(probes(&[ModuleKind::Face]));
    manager.enable(ModuleKind::Face).unwrap();
    manager.init(None).unwrap();
    *control.disconnect_after.lock().unwrap() = Some(2);

    let mut delivered = 0;
    let err = loop {
        match manager.acquire_frame(true, WAIT) {
            Ok(()) => {
                delivered += 1;
                manager.release_frame().unwrap();
            }
            Err(err) => break err,
        }
        assert!(delivered <= 2);
    };
    assert!(matches!(err, Error::DeviceLost));
    assert_eq!(delivered, 2);
    assert!(!manager.is_connected());
    assert!(matches!(manager.acquire_frame(true, WAIT), Err(Error::Closed)));

    manager.close();
    manager.init(None).unwrap();
    manager.acquire_frame(true, WAIT).unwrap();
    manager.release_frame().unwrap();
}

#[test]
fn test_close_is_idempotent() {
    let (manager, control) = manager(probes(&[ModuleKind::Face]));
    manager.close();
    manager.enable(ModuleKind::Face).unwrap();
    manager.init(None).unwrap();
    manager.acquire_frame(true, WAIT).unwrap();

    manager.close();
    manager.close();
    assert!(matches!(manager.release_frame(), Err(Error::NoFrameAcquired)));
    assert_eq!(control.opens.load(std::sync::atomic::Ordering::SeqCst), 1);

    // Configuration survives close
    manager.init(None).unwrap();
    manager.acquire_frame(true, WAIT).unwrap();
    assert!(manager.query(ModuleKind::Face).is_some());
    manager.release_frame().unwrap();
}
