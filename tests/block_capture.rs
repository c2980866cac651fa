use std::sync::Arc;
use std::thread;
use std::time::Duration;

use picoscope_rs::sim::{SimConfig, SimFault, SimulatedSdk};
use picoscope_rs::{
    BlockSettings, CaptureMode, Channel, ChannelConfig, Downsampling, ErrorKind, LoopExit,
    PicoScope, PicoStatus, PollSchedule, Resolution, SessionStatus, SimpleTrigger, VoltageRange,
};

const SERIAL: &str = "SIM0001";

fn open(config: SimConfig) -> (Arc<SimulatedSdk>, PicoScope<SimulatedSdk>) {
    let sdk = Arc::new(SimulatedSdk::new(config));
    let scope = PicoScope::open(sdk.clone(), None).unwrap();
    (sdk, scope)
}

fn fast() -> PollSchedule {
    PollSchedule::every(Duration::ZERO).with_timeout(Duration::from_secs(5))
}

#[test]
fn full_cycle_takes_exactly_n_polls() {
    let (sdk, mut scope) = open(SimConfig::default().ready_after(7));
    scope
        .configure_channel(ChannelConfig::new(Channel::A).range(VoltageRange::V2))
        .unwrap();
    let interval = scope.configure_timebase(1e-6).unwrap();
    scope
        .allocate_and_bind(Channel::A, 0, 1000, CaptureMode::Block)
        .unwrap();

    scope.arm_block(BlockSettings::new(1000)).unwrap();
    assert_eq!(scope.session_status(), SessionStatus::Armed);
    let exit = scope.wait_ready(&fast()).unwrap();
    assert_eq!(exit, LoopExit::Completed(()));
    assert_eq!(scope.session_status(), SessionStatus::Ready);
    assert_eq!(sdk.is_ready_calls(SERIAL), 7);

    let result = scope.fetch().unwrap();
    assert_eq!(scope.session_status(), SessionStatus::Idle);
    assert_eq!(result.len(), 1000);
    assert_eq!(result.mode(), CaptureMode::Block);
    assert!((result.sample_interval() - interval).abs() < f64::EPSILON);

    let a = result.channel(Channel::A).unwrap();
    for (i, (raw, volts)) in a.raw.iter().zip(&a.volts).enumerate() {
        assert_eq!(*raw, SimulatedSdk::expected_sample(Channel::A, i as u64, Resolution::Bits8));
        assert!((volts - f64::from(*raw) / 127.0 * 2.0).abs() < 1e-12);
    }
    assert!(!scope.buffers().is_locked());
}

#[test]
fn arming_without_bound_buffer_stays_idle() {
    let (sdk, mut scope) = open(SimConfig::default());
    scope.configure_channel(ChannelConfig::new(Channel::A)).unwrap();
    scope.configure_channel(ChannelConfig::new(Channel::B)).unwrap();
    scope.configure_timebase(1e-6).unwrap();
    scope
        .allocate_and_bind(Channel::A, 0, 100, CaptureMode::Block)
        .unwrap();

    let err = scope.arm_block(BlockSettings::new(100)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(scope.session_status(), SessionStatus::Idle);
    assert!(!sdk.is_running(SERIAL));
}

#[test]
fn fetch_before_ready_touches_nothing() {
    let (_sdk, mut scope) = open(SimConfig::default().ready_after(10));
    scope.configure_channel(ChannelConfig::new(Channel::A)).unwrap();
    scope.configure_timebase(1e-6).unwrap();
    scope
        .allocate_and_bind(Channel::A, 0, 100, CaptureMode::Block)
        .unwrap();
    scope.arm_block(BlockSettings::new(100)).unwrap();

    let err = scope.fetch().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StateViolation);
    assert_eq!(scope.session_status(), SessionStatus::Armed);
    let buffer = scope.buffers().bound(Channel::A, 0).unwrap();
    assert!(buffer.samples().iter().all(|s| *s == 0));
}

#[test]
fn busy_device_is_absorbed_by_polling() {
    let config = SimConfig::default()
        .ready_after(4)
        .fault(SimFault::BusyPolls { polls: 2 });
    let (sdk, mut scope) = open(config);
    scope.configure_channel(ChannelConfig::new(Channel::A)).unwrap();
    scope.configure_timebase(1e-6).unwrap();
    scope
        .allocate_and_bind(Channel::A, 0, 100, CaptureMode::Block)
        .unwrap();

    let result = scope
        .capture_block(BlockSettings::new(100), &fast())
        .unwrap()
        .completed()
        .unwrap();
    assert_eq!(result.len(), 100);
    assert_eq!(sdk.is_ready_calls(SERIAL), 4);
}

#[test]
fn timeout_is_device_not_responding_and_stops() {
    let (sdk, mut scope) = open(SimConfig::default().ready_after(u32::MAX));
    scope.configure_channel(ChannelConfig::new(Channel::A)).unwrap();
    scope.configure_timebase(1e-6).unwrap();
    scope
        .allocate_and_bind(Channel::A, 0, 100, CaptureMode::Block)
        .unwrap();

    let schedule = PollSchedule::every(Duration::from_millis(1)).with_timeout(Duration::from_millis(20));
    let err = scope
        .capture_block(BlockSettings::new(100), &schedule)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceNotResponding);
    assert_eq!(scope.session_status(), SessionStatus::Idle);
    assert_eq!(sdk.stop_calls(SERIAL), 1);
    assert!(!sdk.is_running(SERIAL));
    assert!(!scope.buffers().is_locked());
}

#[test]
fn trigger_index_and_pre_trigger_split() {
    let (_sdk, mut scope) = open(SimConfig::default());
    scope.configure_channel(ChannelConfig::new(Channel::A)).unwrap();
    scope.configure_timebase(1e-6).unwrap();
    scope
        .configure_trigger(SimpleTrigger::on(Channel::A).rising(0.25))
        .unwrap();
    scope
        .allocate_and_bind(Channel::A, 0, 300, CaptureMode::Block)
        .unwrap();

    let settings = BlockSettings::new(200).with_pre_trigger(100);
    let result = scope
        .capture_block(settings, &fast())
        .unwrap()
        .completed()
        .unwrap();
    assert_eq!(result.len(), 300);
    let trigger = result.trigger().unwrap();
    assert!(trigger.triggered);
    assert_eq!(trigger.trigger_index, 100);
}

#[test]
fn capture_into_segment() {
    let (_sdk, mut scope) = open(SimConfig::default());
    scope.configure_channel(ChannelConfig::new(Channel::A)).unwrap();
    let per_segment = scope.set_segments(4).unwrap();
    assert_eq!(per_segment, 1_000_000);
    scope.configure_timebase(1e-6).unwrap();
    scope
        .allocate_and_bind(Channel::A, 2, 500, CaptureMode::Block)
        .unwrap();

    let err = scope.arm_block(BlockSettings::new(500)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let result = scope
        .capture_block(BlockSettings::new(500).in_segment(2), &fast())
        .unwrap()
        .completed()
        .unwrap();
    assert_eq!(result.len(), 500);
    assert!(scope
        .allocate(Channel::A, 4, 10, CaptureMode::Block)
        .is_err());
}

#[test]
fn over_range_flags_only_that_channel() {
    let (_sdk, mut scope) = open(SimConfig::default().fault(SimFault::OverRange { channel: Channel::B }));
    for channel in [Channel::A, Channel::B] {
        scope.configure_channel(ChannelConfig::new(channel)).unwrap();
        scope
            .allocate_and_bind(channel, 0, 100, CaptureMode::Block)
            .unwrap();
    }
    scope.configure_timebase(1e-6).unwrap();
    let result = scope
        .capture_block(BlockSettings::new(100), &fast())
        .unwrap()
        .completed()
        .unwrap();
    assert!(!result.channel(Channel::A).unwrap().overflow);
    assert!(result.channel(Channel::B).unwrap().overflow);
    assert!(!result.has_loss());
}

#[test]
fn twelve_bit_mode_limits_channels() {
    let sdk = Arc::new(SimulatedSdk::new(SimConfig::default()));
    let mut scope = PicoScope::open_with_resolution(sdk, None, Resolution::Bits12).unwrap();
    for channel in [Channel::A, Channel::B, Channel::C] {
        scope.configure_channel(ChannelConfig::new(channel)).unwrap();
    }
    let err = scope.configure_timebase(1e-6).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    scope.disable_channel(Channel::C).unwrap();
    scope.configure_timebase(1e-6).unwrap();
    scope
        .allocate_and_bind(Channel::A, 0, 10, CaptureMode::Block)
        .unwrap();
    assert_eq!(scope.buffers().bound(Channel::A, 0).unwrap().byte_len(), 20);
}

#[test]
fn background_job_returns_scope_with_result() {
    let (sdk, mut scope) = open(SimConfig::default().ready_after(3));
    scope.configure_channel(ChannelConfig::new(Channel::A)).unwrap();
    scope.configure_timebase(1e-6).unwrap();
    scope
        .allocate_and_bind(Channel::A, 0, 100, CaptureMode::Block)
        .unwrap();

    let mut job = scope
        .run_block_in_background(BlockSettings::new(100), PollSchedule::every(Duration::from_millis(1)))
        .unwrap();
    let (scope, result) = loop {
        match job.try_get_result() {
            Ok(outcome) => break outcome,
            Err(pending) => {
                job = pending;
                thread::sleep(Duration::from_millis(1));
            }
        }
    };
    assert_eq!(result.unwrap().completed().unwrap().len(), 100);
    assert_eq!(scope.session_status(), SessionStatus::Idle);
    assert_eq!(sdk.is_ready_calls(SERIAL), 3);
}

#[test]
fn background_job_cancel_stops_device() {
    let (sdk, mut scope) = open(SimConfig::default().ready_after(u32::MAX));
    scope.configure_channel(ChannelConfig::new(Channel::A)).unwrap();
    scope.configure_timebase(1e-6).unwrap();
    scope
        .allocate_and_bind(Channel::A, 0, 100, CaptureMode::Block)
        .unwrap();

    let job = scope
        .run_block_in_background(BlockSettings::new(100), PollSchedule::every(Duration::from_millis(1)))
        .unwrap();
    thread::sleep(Duration::from_millis(10));
    let (mut scope, result) = job.cancel();
    assert_eq!(result.unwrap(), LoopExit::Cancelled);
    assert_eq!(scope.session_status(), SessionStatus::Idle);
    assert!(!sdk.is_running(SERIAL));

    // The next arm starts from a clean stop flag.
    scope.arm_block(BlockSettings::new(100)).unwrap();
    assert_eq!(scope.poll().unwrap(), SessionStatus::Polling);
}

#[test]
fn background_arm_failure_returns_scope() {
    let (_sdk, mut scope) = open(SimConfig::default());
    scope.configure_channel(ChannelConfig::new(Channel::A)).unwrap();
    scope.configure_timebase(1e-6).unwrap();
    let Err((scope, err)) = scope.run_block_in_background(BlockSettings::new(100), PollSchedule::default())
    else {
        unreachable!("arming without buffers must fail");
    };
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert!(scope.is_open());
}

#[test]
fn result_converts_to_dataframe() {
    let (_sdk, mut scope) = open(SimConfig::default());
    scope.configure_channel(ChannelConfig::new(Channel::A)).unwrap();
    scope.configure_channel(ChannelConfig::new(Channel::D)).unwrap();
    scope.configure_timebase(1e-6).unwrap();
    scope
        .allocate_and_bind(Channel::A, 0, 64, CaptureMode::Block)
        .unwrap();
    scope
        .allocate_and_bind(Channel::D, 0, 64, CaptureMode::Block)
        .unwrap();
    let result = scope
        .capture_block(BlockSettings::new(64), &fast())
        .unwrap()
        .completed()
        .unwrap();
    let df = result.to_dataframe().unwrap();
    assert_eq!(df.height(), 64);
    let names: Vec<String> = df.get_column_names().iter().map(|n| n.to_string()).collect();
    assert_eq!(names, ["time", "A_raw", "A_volts", "D_raw", "D_volts"]);
}

#[test]
fn aggregate_block_returns_min_and_max() {
    let (_sdk, mut scope) = open(SimConfig::default());
    scope.configure_channel(ChannelConfig::new(Channel::A)).unwrap();
    scope.configure_timebase(1e-6).unwrap();
    scope
        .allocate_and_bind_aggregate(Channel::A, 0, 100, CaptureMode::Block)
        .unwrap();
    let ds = Downsampling::aggregate(10);
    scope
        .arm_block(BlockSettings::new(1000).with_downsampling(ds))
        .unwrap();
    scope.wait_ready(&fast()).unwrap();
    let result = scope.fetch().unwrap();
    assert_eq!(result.len(), 100);
    let a = result.channel(Channel::A).unwrap();
    let raw_min = a.raw_min.as_ref().unwrap();
    for (i, (hi, lo)) in a.raw.iter().zip(raw_min).enumerate() {
        assert_eq!(*hi, SimulatedSdk::expected_downsampled(Channel::A, i as u64, ds, Resolution::Bits8));
        assert_eq!(*lo, SimulatedSdk::expected_minimum(Channel::A, i as u64, ds, Resolution::Bits8));
    }
    let df = result.to_dataframe().unwrap();
    assert!(df.column("A_min_volts").is_ok());
}

#[test]
fn failed_retrieval_stops_device_and_frees_buffers() {
    let (sdk, mut scope) = open(SimConfig::default().fault(SimFault::RetrievalFails {
        status: PicoStatus::DEVICE_NOT_FUNCTIONING,
    }));
    scope.configure_channel(ChannelConfig::new(Channel::A)).unwrap();
    scope.configure_timebase(1e-6).unwrap();
    scope
        .allocate_and_bind(Channel::A, 0, 100, CaptureMode::Block)
        .unwrap();
    scope.arm_block(BlockSettings::new(100)).unwrap();
    scope.wait_ready(&fast()).unwrap();

    let err = scope.fetch().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HardwareFault);
    assert_eq!(sdk.stop_calls(SERIAL), 1);
    assert!(!sdk.is_running(SERIAL));
    assert!(!scope.buffers().is_locked());
}

