use std::sync::Arc;

use picoscope_rs::sim::{SimConfig, SimulatedSdk};
use picoscope_rs::{
    BlockSettings, CaptureMode, Channel, ChannelConfig, Coupling, DeviceRegistry, ErrorKind,
    PicoScope, Resolution, ScopeConnector, SessionStatus, StreamingSettings, UnitInfo,
    VoltageRange,
};

const SERIAL: &str = "SIM0001";

fn configured(sdk: &Arc<SimulatedSdk>) -> PicoScope<SimulatedSdk> {
    let mut scope = PicoScope::open(sdk.clone(), None).unwrap();
    scope.configure_channel(ChannelConfig::new(Channel::A)).unwrap();
    scope.configure_channel(ChannelConfig::new(Channel::B)).unwrap();
    scope.configure_timebase(1e-6).unwrap();
    scope
}

#[test]
fn open_reports_identity() {
    let sdk = Arc::new(SimulatedSdk::new(SimConfig::default()));
    let scope = PicoScope::open(sdk.clone(), None).unwrap();
    assert!(scope.is_open());
    assert_eq!(scope.serial(), SERIAL);
    assert_eq!(scope.resolution(), Resolution::Bits8);
    assert_eq!(scope.unit_info(UnitInfo::BatchAndSerial).unwrap(), SERIAL);
    assert_eq!(scope.adc_limits().unwrap(), (-127, 127));
    scope.ping().unwrap();
    assert_eq!(scope.session_status(), SessionStatus::Idle);
    assert_eq!(sdk.open_units(), 1);
}

#[test]
fn close_during_streaming_releases_everything() {
    let sdk = Arc::new(SimulatedSdk::new(SimConfig::default().samples_per_poll(10)));
    let mut scope = configured(&sdk);
    scope.allocate_and_bind(Channel::A, 0, 100, CaptureMode::Streaming).unwrap();
    scope.allocate_and_bind(Channel::B, 0, 100, CaptureMode::Streaming).unwrap();
    scope.arm_streaming(StreamingSettings::new()).unwrap();
    scope.poll_streaming().unwrap();
    assert!(sdk.is_running(SERIAL));
    assert_eq!(sdk.bound_buffers(SERIAL), 2);

    scope.close().unwrap();
    assert!(!scope.is_open());
    assert_eq!(sdk.stop_calls(SERIAL), 1);
    assert_eq!(sdk.open_units(), 0);
    assert!(scope.buffers().is_empty());
    assert!(!scope.buffers().is_locked());
    assert_eq!(scope.session_status(), SessionStatus::Idle);

    scope.close().unwrap();
    assert_eq!(sdk.stop_calls(SERIAL), 1);
}

#[test]
fn closed_handle_is_invalid_argument() {
    let sdk = Arc::new(SimulatedSdk::new(SimConfig::default()));
    let mut scope = configured(&sdk);
    scope.close().unwrap();
    assert_eq!(scope.ping().unwrap_err().kind(), ErrorKind::InvalidArgument);
    let err = scope.arm_block(BlockSettings::new(10)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    let err = scope
        .configure_channel(ChannelConfig::new(Channel::C))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn reopen_starts_clean() {
    let sdk = Arc::new(SimulatedSdk::new(SimConfig::default().ready_after(100)));
    {
        let mut scope = configured(&sdk);
        scope.allocate_and_bind(Channel::A, 0, 100, CaptureMode::Block).unwrap();
        scope.allocate_and_bind(Channel::B, 0, 100, CaptureMode::Block).unwrap();
        scope.arm_block(BlockSettings::new(100)).unwrap();
        scope.poll().unwrap();
        // dropped while armed
    }
    assert_eq!(sdk.open_units(), 0);
    assert_eq!(sdk.stop_calls(SERIAL), 1);

    let mut scope = configured(&sdk);
    assert_eq!(scope.session_status(), SessionStatus::Idle);
    assert!(scope.buffers().is_empty());
    assert_eq!(sdk.bound_buffers(SERIAL), 0);
    assert!(!sdk.is_running(SERIAL));
    let err = scope.arm_block(BlockSettings::new(100)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(scope.session_status(), SessionStatus::Idle);
}

#[test]
fn unplugged_unit_stops_responding() {
    let sdk = Arc::new(SimulatedSdk::new(SimConfig::default()));
    let mut scope = configured(&sdk);
    sdk.unplug(SERIAL);
    assert_eq!(scope.ping().unwrap_err().kind(), ErrorKind::DeviceNotResponding);
    assert!(ScopeConnector::get_available_devices(sdk.as_ref())
        .unwrap()
        .is_empty());
    scope.close().unwrap();
    let err = PicoScope::open(sdk, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceNotResponding);
}

#[test]
fn configuration_rejected_before_the_device() {
    let sdk = Arc::new(SimulatedSdk::new(SimConfig::default()));
    let mut scope = PicoScope::open(sdk, None).unwrap();
    let fifty_ohm = ChannelConfig::new(Channel::A)
        .range(VoltageRange::V20)
        .coupling(Coupling::Dc50Ohm);
    let err = scope.configure_channel(fifty_ohm).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert!(!scope.config().channel(Channel::A).enabled);

    let (low, high) = scope
        .analog_offset_limits(VoltageRange::V1, Coupling::Dc)
        .unwrap();
    let too_far = ChannelConfig::new(Channel::A)
        .range(VoltageRange::V1)
        .offset(high * 2.0);
    let err = scope.configure_channel(too_far).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert!(low < 0.0);
    scope
        .configure_channel(ChannelConfig::new(Channel::A).range(VoltageRange::V1).offset(high))
        .unwrap();
    assert!((scope.config().channel(Channel::A).offset - high).abs() < 1e-12);
}

#[test]
fn resolution_change_needs_matching_buffers() {
    let sdk = Arc::new(SimulatedSdk::new(SimConfig::default()));
    let mut scope = configured(&sdk);
    let id = scope.allocate_and_bind(Channel::A, 0, 100, CaptureMode::Block).unwrap();
    let err = scope.set_resolution(Resolution::Bits12).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(scope.resolution(), Resolution::Bits8);

    scope.release(id).unwrap();
    scope.set_resolution(Resolution::Bits12).unwrap();
    assert_eq!(scope.resolution(), Resolution::Bits12);
    assert_eq!(scope.adc_limits().unwrap(), (-32512, 32512));
    let id = scope.allocate(Channel::A, 0, 100, CaptureMode::Block).unwrap();
    assert_eq!(scope.buffers().get(id).unwrap().sample_width(), 2);
}

#[test]
fn registry_keeps_one_scope_per_unit() {
    let sdk = Arc::new(SimulatedSdk::new(SimConfig::default().serials(&["GX001", "GX002"])));
    let mut registry = DeviceRegistry::new(sdk.clone());
    registry.open("GX001", Resolution::Bits8).unwrap();
    registry.open("GX002", Resolution::Bits8).unwrap();
    assert_eq!(registry.len(), 2);
    assert_eq!(
        registry.open("GX002", Resolution::Bits8).unwrap_err().kind(),
        ErrorKind::StateViolation
    );
    assert_eq!(
        registry.open("GX404", Resolution::Bits8).unwrap_err().kind(),
        ErrorKind::DeviceNotResponding
    );

    let scope = registry.get_mut("GX001").unwrap();
    scope.configure_channel(ChannelConfig::new(Channel::A)).unwrap();
    scope.configure_timebase(1e-6).unwrap();
    scope.allocate_and_bind(Channel::A, 0, 100, CaptureMode::Streaming).unwrap();
    scope.arm_streaming(StreamingSettings::new()).unwrap();
    assert!(sdk.is_running("GX001"));
    assert!(!sdk.is_running("GX002"));

    registry.close_all().unwrap();
    assert!(registry.is_empty());
    assert_eq!(sdk.open_units(), 0);
    assert_eq!(sdk.stop_calls("GX001"), 1);
}
