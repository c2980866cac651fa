//! A deterministic in-process instrument.
//!
//! `SimulatedSdk` implements [`NativeSdk`] the way a 6000E-class unit behaves
//! at the call boundary: status codes, timebase rounding, block readiness
//! after a number of polls, streaming into caller buffers that must be handed
//! back when full. Each sample is a pure function of channel and absolute
//! sample index, see [`SimulatedSdk::expected_sample`], so tests can check
//! retrieved data without keeping a copy.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::channel_config::{Bandwidth, Channel, ChannelFlags, Coupling, Resolution, VoltageRange};
use crate::native::{
    BufferAction, BufferRole, ChannelTarget, Downsampling, DownsamplingMode, NativeSdk,
    NativeTrigger, RawHandle, StreamingLatest, StreamingWindow, TriggerInfo, UnitInfo,
};
use crate::status::PicoStatus;

const FAST_CLOCK_HZ: f64 = 5.0e9;
const SLOW_CLOCK_HZ: f64 = 156.25e6;
const FAST_TIMEBASES: u32 = 5;

/// Behaviour injected into the simulated unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFault {
    /// Streaming poll number `poll` (1-based, per run) reports lost samples on `channel`.
    StreamingOverflow { poll: u64, channel: Channel },
    /// The unit stops responding once it has answered `polls` readiness or streaming polls.
    Disconnect { after_polls: u64 },
    /// Block retrieval flags `channel` as over range.
    OverRange { channel: Channel },
    /// The first `polls` readiness queries of a block capture answer BUSY.
    BusyPolls { polls: u32 },
    /// Opening any unit fails with `status`.
    OpenFails { status: PicoStatus },
    /// Block retrieval answers `status` instead of data.
    RetrievalFails { status: PicoStatus },
    /// `stop` answers `status` and the capture keeps running.
    StopFails { status: PicoStatus },
    /// Unregistering a buffer of `channel` is refused.
    ClearFails { channel: Channel },
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub serials: Vec<String>,
    /// Block captures report ready on this readiness query (1-based).
    pub ready_after_polls: u32,
    /// Samples per channel delivered by each streaming poll.
    pub samples_per_poll: usize,
    /// Device memory in samples per channel, shared by all segments.
    pub memory_samples: u64,
    /// `set_data_buffer` rejects buffers larger than this.
    pub max_buffer_bytes: usize,
    pub faults: Vec<SimFault>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            serials: vec!["SIM0001".to_string()],
            ready_after_polls: 1,
            samples_per_poll: 1000,
            memory_samples: 4_000_000,
            max_buffer_bytes: 64 * 1024 * 1024,
            faults: Vec::new(),
        }
    }
}

impl SimConfig {
    #[must_use]
    pub fn serials(mut self, serials: &[&str]) -> Self {
        self.serials = serials.iter().map(ToString::to_string).collect();
        self
    }

    #[must_use]
    pub fn ready_after(mut self, polls: u32) -> Self {
        self.ready_after_polls = polls;
        self
    }

    #[must_use]
    pub fn samples_per_poll(mut self, samples: usize) -> Self {
        self.samples_per_poll = samples;
        self
    }

    #[must_use]
    pub fn max_buffer_bytes(mut self, bytes: usize) -> Self {
        self.max_buffer_bytes = bytes;
        self
    }

    #[must_use]
    pub fn fault(mut self, fault: SimFault) -> Self {
        self.faults.push(fault);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Run {
    Idle,
    Block {
        pre: u64,
        post: u64,
        segment: u64,
        polls: u32,
        ready: bool,
    },
    Streaming {
        downsampling: Downsampling,
        produced: u64,
        dev_pos: usize,
        limit: Option<u64>,
        trigger_at: Option<u64>,
        polls: u64,
        auto_stopped: bool,
        full: bool,
    },
    Stopped {
        produced: u64,
    },
}

#[derive(Debug)]
struct SimUnit {
    serial: String,
    resolution: Resolution,
    enabled: ChannelFlags,
    segments: u64,
    bound: HashMap<(Channel, u64, BufferRole), usize>,
    trigger: Option<NativeTrigger>,
    run: Run,
    polls: u64,
    disconnected: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct SimStats {
    is_ready_calls: u64,
    stop_calls: u64,
    opens: u64,
}

#[derive(Debug, Default)]
struct SimState {
    next_handle: RawHandle,
    units: HashMap<RawHandle, SimUnit>,
    stats: HashMap<String, SimStats>,
    unplugged: Vec<String>,
}

#[derive(Debug)]
pub struct SimulatedSdk {
    config: SimConfig,
    state: Mutex<SimState>,
}

fn timebase_interval(timebase: u32) -> f64 {
    if timebase < FAST_TIMEBASES {
        f64::from(1u32 << timebase) / FAST_CLOCK_HZ
    } else {
        f64::from(timebase - 4) / SLOW_CLOCK_HZ
    }
}

fn interval_timebase(interval: f64) -> u32 {
    if interval < timebase_interval(FAST_TIMEBASES) {
        (interval * FAST_CLOCK_HZ).log2().round().clamp(0.0, 4.0) as u32
    } else {
        (interval * SLOW_CLOCK_HZ + 4.0)
            .round()
            .clamp(f64::from(FAST_TIMEBASES), f64::from(u32::MAX)) as u32
    }
}

fn minimum_timebase(enabled: ChannelFlags, resolution: Resolution) -> u32 {
    let base = match enabled.count() {
        0 | 1 => 0,
        2 => 1,
        3 | 4 => 2,
        _ => 3,
    };
    match resolution {
        Resolution::Bits8 => base,
        Resolution::Bits10 => base.max(2),
        Resolution::Bits12 => 3,
    }
}

fn adc_limits(resolution: Resolution) -> (i16, i16) {
    match resolution {
        Resolution::Bits8 => (-127, 127),
        Resolution::Bits10 | Resolution::Bits12 => (-32512, 32512),
    }
}

fn downsampled(
    channel: Channel,
    index: u64,
    ds: Downsampling,
    role: BufferRole,
    resolution: Resolution,
) -> i16 {
    let ratio = ds.effective_ratio().max(1);
    let first = index * ratio;
    let bucket = (first..first + ratio).map(|i| SimulatedSdk::expected_sample(channel, i, resolution));
    match (ds.mode, role) {
        (DownsamplingMode::Raw | DownsamplingMode::Decimate, _) => {
            SimulatedSdk::expected_sample(channel, first, resolution)
        }
        (DownsamplingMode::Average, _) => {
            let sum: i64 = bucket.map(i64::from).sum();
            (sum / ratio as i64) as i16
        }
        (DownsamplingMode::Aggregate, BufferRole::Primary) => bucket.max().unwrap_or_default(),
        (DownsamplingMode::Aggregate, BufferRole::Min) => bucket.min().unwrap_or_default(),
    }
}

/// Aggregate downsampling needs a `Min` target next to every primary one.
fn pairs_complete(targets: &[ChannelTarget<'_>], downsampling: Downsampling) -> bool {
    !downsampling.needs_min_buffers()
        || targets
            .iter()
            .filter(|t| t.role == BufferRole::Primary)
            .all(|p| {
                targets
                    .iter()
                    .any(|m| m.channel == p.channel && m.role == BufferRole::Min)
            })
}

impl SimulatedSdk {
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SimState {
                next_handle: 1,
                ..SimState::default()
            }),
        }
    }

    /// Raw sample the unit produces on `channel` at absolute `index`.
    pub fn expected_sample(channel: Channel, index: u64, resolution: Resolution) -> i16 {
        let phase = (index * 37 + channel.index() as u64 * 1000) % 2000;
        let centred = phase as i16 - 1000;
        match resolution {
            Resolution::Bits8 => centred / 10,
            Resolution::Bits10 | Resolution::Bits12 => centred * 32,
        }
    }

    /// Value of output sample `index` after `downsampling`.
    pub fn expected_downsampled(
        channel: Channel,
        index: u64,
        downsampling: Downsampling,
        resolution: Resolution,
    ) -> i16 {
        downsampled(channel, index, downsampling, BufferRole::Primary, resolution)
    }

    /// Bucket minimum of output sample `index` under aggregate downsampling.
    pub fn expected_minimum(
        channel: Channel,
        index: u64,
        downsampling: Downsampling,
        resolution: Resolution,
    ) -> i16 {
        downsampled(channel, index, downsampling, BufferRole::Min, resolution)
    }

    /// Simulate pulling the cable on every open unit with `serial`.
    pub fn unplug(&self, serial: &str) {
        let mut state = self.state();
        state.unplugged.push(serial.to_string());
        for unit in state.units.values_mut().filter(|u| u.serial == serial) {
            unit.disconnected = true;
        }
    }

    pub fn open_units(&self) -> usize {
        self.state().units.len()
    }

    pub fn is_ready_calls(&self, serial: &str) -> u64 {
        self.state().stats.get(serial).map_or(0, |s| s.is_ready_calls)
    }

    pub fn stop_calls(&self, serial: &str) -> u64 {
        self.state().stats.get(serial).map_or(0, |s| s.stop_calls)
    }

    pub fn opens(&self, serial: &str) -> u64 {
        self.state().stats.get(serial).map_or(0, |s| s.opens)
    }

    /// Buffers registered with open units of `serial`.
    pub fn bound_buffers(&self, serial: &str) -> usize {
        self.state()
            .units
            .values()
            .filter(|u| u.serial == serial)
            .map(|u| u.bound.len())
            .sum()
    }

    /// Trigger currently programmed into an open unit of `serial`.
    pub fn trigger(&self, serial: &str) -> Option<NativeTrigger> {
        self.state()
            .units
            .values()
            .find(|u| u.serial == serial)
            .and_then(|u| u.trigger)
    }

    /// Whether an open unit of `serial` is capturing.
    pub fn is_running(&self, serial: &str) -> bool {
        self.state().units.values().any(|u| {
            u.serial == serial && matches!(u.run, Run::Block { .. } | Run::Streaming { .. })
        })
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn fault_disconnect_after(&self) -> Option<u64> {
        self.config.faults.iter().find_map(|f| match f {
            SimFault::Disconnect { after_polls } => Some(*after_polls),
            _ => None,
        })
    }

    fn busy_polls(&self) -> u32 {
        self.config
            .faults
            .iter()
            .find_map(|f| match f {
                SimFault::BusyPolls { polls } => Some(*polls),
                _ => None,
            })
            .unwrap_or(0)
    }

    fn injected_status(&self, pick: impl Fn(&SimFault) -> Option<PicoStatus>) -> Option<PicoStatus> {
        self.config.faults.iter().find_map(pick)
    }

    fn streaming_overflow(&self, poll: u64, channel: Channel) -> bool {
        self.config
            .faults
            .contains(&SimFault::StreamingOverflow { poll, channel })
    }

    fn over_range(&self) -> ChannelFlags {
        self.config
            .faults
            .iter()
            .filter_map(|f| match f {
                SimFault::OverRange { channel } => Some(*channel),
                _ => None,
            })
            .collect()
    }

    /// Count a poll against the disconnect fault. Returns false once the unit is gone.
    fn answer_poll(&self, unit: &mut SimUnit) -> bool {
        unit.polls += 1;
        if self
            .fault_disconnect_after()
            .is_some_and(|after| unit.polls > after)
        {
            unit.disconnected = true;
        }
        !unit.disconnected
    }
}

impl NativeSdk for SimulatedSdk {
    fn enumerate_units(&self) -> (PicoStatus, Vec<String>) {
        let state = self.state();
        let serials = self
            .config
            .serials
            .iter()
            .filter(|s| !state.unplugged.contains(s))
            .cloned()
            .collect();
        (PicoStatus::OK, serials)
    }

    fn open_unit(&self, serial: Option<&str>, resolution: Resolution) -> (PicoStatus, RawHandle) {
        if let Some(SimFault::OpenFails { status }) = self
            .config
            .faults
            .iter()
            .find(|f| matches!(f, SimFault::OpenFails { .. }))
        {
            return (*status, -1);
        }
        let mut state = self.state();
        let found = self
            .config
            .serials
            .iter()
            .filter(|s| !state.unplugged.contains(s))
            .find(|s| serial.is_none_or(|wanted| wanted == s.as_str()))
            .cloned();
        let Some(serial) = found else {
            return (PicoStatus::NOT_FOUND, 0);
        };

        let handle = state.next_handle;
        state.next_handle = state.next_handle.wrapping_add(1).max(1);
        state.stats.entry(serial.clone()).or_default().opens += 1;
        state.units.insert(
            handle,
            SimUnit {
                serial,
                resolution,
                enabled: ChannelFlags::empty(),
                segments: 1,
                bound: HashMap::new(),
                trigger: None,
                run: Run::Idle,
                polls: 0,
                disconnected: false,
            },
        );
        (PicoStatus::OK, handle)
    }

    fn close_unit(&self, handle: RawHandle) -> PicoStatus {
        match self.state().units.remove(&handle) {
            Some(_) => PicoStatus::OK,
            None => PicoStatus::INVALID_HANDLE,
        }
    }

    fn ping_unit(&self, handle: RawHandle) -> PicoStatus {
        match self.state().units.get(&handle) {
            Some(unit) if unit.disconnected => PicoStatus::NOT_RESPONDING,
            Some(_) => PicoStatus::OK,
            None => PicoStatus::INVALID_HANDLE,
        }
    }

    fn get_unit_info(&self, handle: RawHandle, info: UnitInfo) -> (PicoStatus, String) {
        let state = self.state();
        let Some(unit) = state.units.get(&handle) else {
            return (PicoStatus::INVALID_HANDLE, String::new());
        };
        let value = match info {
            UnitInfo::DriverVersion => "Simulated driver 1.0",
            UnitInfo::UsbVersion => "3.0",
            UnitInfo::HardwareVersion => "1",
            UnitInfo::VariantInfo => "6824E",
            UnitInfo::BatchAndSerial => unit.serial.as_str(),
            UnitInfo::CalibrationDate => "01Jan26",
            UnitInfo::FirmwareVersion => "1.7.0.0",
        };
        (PicoStatus::OK, value.to_string())
    }

    fn set_device_resolution(&self, handle: RawHandle, resolution: Resolution) -> PicoStatus {
        let mut state = self.state();
        let Some(unit) = state.units.get_mut(&handle) else {
            return PicoStatus::INVALID_HANDLE;
        };
        if unit.run != Run::Idle && !matches!(unit.run, Run::Stopped { .. }) {
            return PicoStatus::INVALID_STATE;
        }
        unit.resolution = resolution;
        PicoStatus::OK
    }

    fn get_adc_limits(&self, handle: RawHandle, resolution: Resolution) -> (PicoStatus, i16, i16) {
        if !self.state().units.contains_key(&handle) {
            return (PicoStatus::INVALID_HANDLE, 0, 0);
        }
        let (min, max) = adc_limits(resolution);
        (PicoStatus::OK, min, max)
    }

    fn set_channel_on(
        &self,
        handle: RawHandle,
        channel: Channel,
        coupling: Coupling,
        range: VoltageRange,
        analog_offset: f64,
        _bandwidth: Bandwidth,
    ) -> PicoStatus {
        let mut state = self.state();
        let Some(unit) = state.units.get_mut(&handle) else {
            return PicoStatus::INVALID_HANDLE;
        };
        if !range.supports(coupling) {
            return PicoStatus::INVALID_VOLTAGE_RANGE;
        }
        if analog_offset.abs() > range.offset_limit(coupling) {
            return PicoStatus::INVALID_ANALOGUE_OFFSET;
        }
        unit.enabled.insert(channel);
        PicoStatus::OK
    }

    fn set_channel_off(&self, handle: RawHandle, channel: Channel) -> PicoStatus {
        let mut state = self.state();
        let Some(unit) = state.units.get_mut(&handle) else {
            return PicoStatus::INVALID_HANDLE;
        };
        unit.enabled.remove(channel);
        PicoStatus::OK
    }

    fn get_analogue_offset_limits(
        &self,
        handle: RawHandle,
        range: VoltageRange,
        coupling: Coupling,
    ) -> (PicoStatus, f64, f64) {
        if !self.state().units.contains_key(&handle) {
            return (PicoStatus::INVALID_HANDLE, 0.0, 0.0);
        }
        if !range.supports(coupling) {
            return (PicoStatus::INVALID_VOLTAGE_RANGE, 0.0, 0.0);
        }
        let limit = range.offset_limit(coupling);
        (PicoStatus::OK, -limit, limit)
    }

    fn get_timebase(&self, handle: RawHandle, timebase: u32, segment: u64) -> (PicoStatus, f64, u64) {
        let state = self.state();
        let Some(unit) = state.units.get(&handle) else {
            return (PicoStatus::INVALID_HANDLE, 0.0, 0);
        };
        if segment >= unit.segments {
            return (PicoStatus::SEGMENT_OUT_OF_RANGE, 0.0, 0);
        }
        if timebase < minimum_timebase(unit.enabled, unit.resolution) {
            return (PicoStatus::INVALID_TIMEBASE, 0.0, 0);
        }
        (
            PicoStatus::OK,
            timebase_interval(timebase),
            self.config.memory_samples / unit.segments,
        )
    }

    fn get_minimum_timebase(
        &self,
        enabled: ChannelFlags,
        resolution: Resolution,
    ) -> (PicoStatus, u32, f64) {
        if enabled.count() > resolution.max_enabled_channels() {
            return (PicoStatus::INVALID_NUMBER_CHANNELS_FOR_RESOLUTION, 0, 0.0);
        }
        let timebase = minimum_timebase(enabled, resolution);
        (PicoStatus::OK, timebase, timebase_interval(timebase))
    }

    fn nearest_sample_interval(
        &self,
        enabled: ChannelFlags,
        interval: f64,
        resolution: Resolution,
    ) -> (PicoStatus, u32, f64) {
        if !interval.is_finite() || interval <= 0.0 {
            return (PicoStatus::INVALID_SAMPLE_INTERVAL, 0, 0.0);
        }
        if enabled.count() > resolution.max_enabled_channels() {
            return (PicoStatus::INVALID_NUMBER_CHANNELS_FOR_RESOLUTION, 0, 0.0);
        }
        let timebase = interval_timebase(interval).max(minimum_timebase(enabled, resolution));
        (PicoStatus::OK, timebase, timebase_interval(timebase))
    }

    fn memory_segments(&self, handle: RawHandle, segments: u64) -> (PicoStatus, u64) {
        let mut state = self.state();
        let Some(unit) = state.units.get_mut(&handle) else {
            return (PicoStatus::INVALID_HANDLE, 0);
        };
        if segments == 0 || segments > self.config.memory_samples {
            return (PicoStatus::TOO_MANY_SEGMENTS, 0);
        }
        unit.segments = segments;
        (PicoStatus::OK, self.config.memory_samples / segments)
    }

    fn set_simple_trigger(&self, handle: RawHandle, trigger: Option<&NativeTrigger>) -> PicoStatus {
        let mut state = self.state();
        let Some(unit) = state.units.get_mut(&handle) else {
            return PicoStatus::INVALID_HANDLE;
        };
        if let Some(t) = trigger {
            if !unit.enabled.contains(t.source) {
                return PicoStatus::INVALID_TRIGGER_CHANNEL;
            }
        }
        unit.trigger = trigger.copied();
        PicoStatus::OK
    }

    fn set_data_buffer(
        &self,
        handle: RawHandle,
        channel: Channel,
        segment: u64,
        role: BufferRole,
        samples: usize,
        sample_width: usize,
        action: BufferAction,
    ) -> PicoStatus {
        let mut state = self.state();
        let Some(unit) = state.units.get_mut(&handle) else {
            return PicoStatus::INVALID_HANDLE;
        };
        if segment >= unit.segments {
            return PicoStatus::SEGMENT_OUT_OF_RANGE;
        }
        match action {
            BufferAction::Clear => {
                if self.config.faults.contains(&SimFault::ClearFails { channel }) {
                    return PicoStatus::INVALID_BUFFER;
                }
                unit.bound.remove(&(channel, segment, role));
            }
            BufferAction::Add => {
                if samples == 0 {
                    return PicoStatus::INVALID_PARAMETER;
                }
                if samples.saturating_mul(sample_width) > self.config.max_buffer_bytes {
                    return PicoStatus::INVALID_BUFFER;
                }
                unit.bound.insert((channel, segment, role), samples);
                if let Run::Streaming { full, dev_pos, .. } = &mut unit.run {
                    if *full {
                        *full = false;
                        *dev_pos = 0;
                    }
                }
            }
        }
        PicoStatus::OK
    }

    fn run_block(
        &self,
        handle: RawHandle,
        pre_trigger: u64,
        post_trigger: u64,
        timebase: u32,
        segment: u64,
    ) -> (PicoStatus, f64) {
        let mut state = self.state();
        let Some(unit) = state.units.get_mut(&handle) else {
            return (PicoStatus::INVALID_HANDLE, 0.0);
        };
        if unit.disconnected {
            return (PicoStatus::NOT_RESPONDING, 0.0);
        }
        if matches!(unit.run, Run::Block { .. } | Run::Streaming { .. }) {
            return (PicoStatus::INVALID_STATE, 0.0);
        }
        if unit.enabled.is_empty() {
            return (PicoStatus::INVALID_CHANNEL, 0.0);
        }
        if segment >= unit.segments {
            return (PicoStatus::SEGMENT_OUT_OF_RANGE, 0.0);
        }
        let length = pre_trigger + post_trigger;
        if length == 0 || length > self.config.memory_samples / unit.segments {
            return (PicoStatus::TOO_MANY_SAMPLES, 0.0);
        }
        if timebase < minimum_timebase(unit.enabled, unit.resolution) {
            return (PicoStatus::INVALID_TIMEBASE, 0.0);
        }
        unit.run = Run::Block {
            pre: pre_trigger,
            post: post_trigger,
            segment,
            polls: 0,
            ready: false,
        };
        let indisposed_ms = length as f64 * timebase_interval(timebase) * 1e3;
        (PicoStatus::OK, indisposed_ms)
    }

    fn is_ready(&self, handle: RawHandle) -> (PicoStatus, bool) {
        let busy_polls = self.busy_polls();
        let ready_after = self.config.ready_after_polls.max(1);
        let mut state = self.state();
        let SimState { units, stats, .. } = &mut *state;
        let Some(unit) = units.get_mut(&handle) else {
            return (PicoStatus::INVALID_HANDLE, false);
        };
        stats.entry(unit.serial.clone()).or_default().is_ready_calls += 1;
        if !self.answer_poll(unit) {
            return (PicoStatus::NOT_RESPONDING, false);
        }
        match &mut unit.run {
            Run::Block { polls, ready, .. } => {
                *polls += 1;
                if *polls >= ready_after {
                    *ready = true;
                    (PicoStatus::OK, true)
                } else if *polls <= busy_polls {
                    (PicoStatus::BUSY, false)
                } else {
                    (PicoStatus::OK, false)
                }
            }
            Run::Streaming { .. } => (PicoStatus::OK, false),
            Run::Idle | Run::Stopped { .. } => (PicoStatus::CANCELLED, false),
        }
    }

    fn get_values(
        &self,
        handle: RawHandle,
        start: u64,
        targets: &mut [ChannelTarget<'_>],
        downsampling: Downsampling,
        segment: u64,
    ) -> (PicoStatus, usize, ChannelFlags) {
        let state = self.state();
        let Some(unit) = state.units.get(&handle) else {
            return (PicoStatus::INVALID_HANDLE, 0, ChannelFlags::empty());
        };
        let Run::Block {
            pre,
            post,
            segment: captured,
            ready: true,
            ..
        } = unit.run
        else {
            return (PicoStatus::DATA_NOT_AVAILABLE, 0, ChannelFlags::empty());
        };
        if segment != captured {
            return (PicoStatus::SEGMENT_OUT_OF_RANGE, 0, ChannelFlags::empty());
        }
        if downsampling.ratio == 0 {
            return (PicoStatus::INVALID_SAMPLERATIO, 0, ChannelFlags::empty());
        }
        if let Some(status) = self.injected_status(|f| match f {
            SimFault::RetrievalFails { status } => Some(*status),
            _ => None,
        }) {
            return (status, 0, ChannelFlags::empty());
        }
        if targets
            .iter()
            .any(|t| !unit.bound.contains_key(&(t.channel, segment, t.role)))
            || !pairs_complete(targets, downsampling)
        {
            return (PicoStatus::BUFFERS_NOT_SET, 0, ChannelFlags::empty());
        }

        let available = ((pre + post).saturating_sub(start) / downsampling.effective_ratio()) as usize;
        let n = targets
            .iter()
            .map(|t| t.samples.len())
            .fold(available, usize::min);
        let first = start / downsampling.effective_ratio();
        for target in targets.iter_mut() {
            let (channel, role) = (target.channel, target.role);
            for (i, slot) in target.samples[..n].iter_mut().enumerate() {
                *slot = downsampled(channel, first + i as u64, downsampling, role, unit.resolution);
            }
        }
        let over_range: ChannelFlags = self
            .over_range()
            .iter()
            .filter(|c| unit.enabled.contains(*c))
            .collect();
        (PicoStatus::OK, n, over_range)
    }

    fn get_trigger_info(&self, handle: RawHandle, segment: u64) -> (PicoStatus, TriggerInfo) {
        let state = self.state();
        let none = TriggerInfo {
            segment,
            trigger_index: 0,
            triggered: false,
        };
        let Some(unit) = state.units.get(&handle) else {
            return (PicoStatus::INVALID_HANDLE, none);
        };
        match (unit.run, unit.trigger) {
            (Run::Block { pre, ready: true, .. }, Some(_)) => (
                PicoStatus::OK,
                TriggerInfo {
                    segment,
                    trigger_index: pre,
                    triggered: true,
                },
            ),
            (Run::Block { ready: true, .. }, None) => (PicoStatus::OK, none),
            _ => (PicoStatus::DATA_NOT_AVAILABLE, none),
        }
    }

    fn run_streaming(
        &self,
        handle: RawHandle,
        interval: f64,
        pre_trigger: u64,
        post_trigger: u64,
        auto_stop: bool,
        downsampling: Downsampling,
    ) -> (PicoStatus, f64) {
        let mut state = self.state();
        let Some(unit) = state.units.get_mut(&handle) else {
            return (PicoStatus::INVALID_HANDLE, 0.0);
        };
        if unit.disconnected {
            return (PicoStatus::NOT_RESPONDING, 0.0);
        }
        if matches!(unit.run, Run::Block { .. } | Run::Streaming { .. }) {
            return (PicoStatus::INVALID_STATE, 0.0);
        }
        if !interval.is_finite() || interval <= 0.0 {
            return (PicoStatus::INVALID_SAMPLE_INTERVAL, 0.0);
        }
        if downsampling.ratio == 0 {
            return (PicoStatus::INVALID_SAMPLERATIO, 0.0);
        }
        if unit.enabled.is_empty() {
            return (PicoStatus::INVALID_CHANNEL, 0.0);
        }
        let needs_min = downsampling.needs_min_buffers();
        if unit.enabled.iter().any(|c| {
            !unit.bound.contains_key(&(c, 0, BufferRole::Primary))
                || (needs_min && !unit.bound.contains_key(&(c, 0, BufferRole::Min)))
        }) {
            return (PicoStatus::BUFFERS_NOT_SET, 0.0);
        }
        if auto_stop && pre_trigger + post_trigger == 0 {
            return (PicoStatus::TOO_FEW_REQUESTED_STREAMING_SAMPLES, 0.0);
        }
        let timebase = interval_timebase(interval).max(minimum_timebase(unit.enabled, unit.resolution));
        let ratio = downsampling.effective_ratio();
        unit.run = Run::Streaming {
            downsampling,
            produced: 0,
            dev_pos: 0,
            limit: auto_stop.then(|| (pre_trigger + post_trigger) / ratio),
            trigger_at: unit.trigger.map(|_| pre_trigger / ratio),
            polls: 0,
            auto_stopped: false,
            full: false,
        };
        (PicoStatus::OK, timebase_interval(timebase))
    }

    fn get_streaming_latest_values(
        &self,
        handle: RawHandle,
        targets: &mut [ChannelTarget<'_>],
    ) -> (PicoStatus, StreamingLatest) {
        let samples_per_poll = self.config.samples_per_poll;
        let mut state = self.state();
        let Some(unit) = state.units.get_mut(&handle) else {
            return (PicoStatus::INVALID_HANDLE, StreamingLatest::default());
        };
        if !self.answer_poll(unit) {
            return (PicoStatus::NOT_RESPONDING, StreamingLatest::default());
        }
        let enabled = unit.enabled;
        let resolution = unit.resolution;
        let Run::Streaming {
            downsampling,
            produced,
            dev_pos,
            limit,
            trigger_at,
            polls,
            auto_stopped,
            full,
        } = &mut unit.run
        else {
            return (PicoStatus::INVALID_CALL, StreamingLatest::default());
        };
        *polls += 1;
        let poll = *polls;

        if *full {
            return (PicoStatus::WAITING_FOR_DATA_BUFFERS, StreamingLatest::default());
        }
        if *auto_stopped {
            let latest = StreamingLatest {
                windows: Vec::new(),
                auto_stopped: true,
                trigger_at: trigger_at.filter(|t| *t < *produced),
            };
            return (PicoStatus::OK, latest);
        }
        if targets.iter().any(|t| !enabled.contains(t.channel)) {
            return (PicoStatus::INVALID_CHANNEL, StreamingLatest::default());
        }
        if !pairs_complete(targets, *downsampling) {
            return (PicoStatus::BUFFERS_NOT_SET, StreamingLatest::default());
        }
        let Some(capacity) = targets.iter().map(|t| t.samples.len()).min() else {
            return (PicoStatus::BUFFERS_NOT_SET, StreamingLatest::default());
        };

        let remaining = limit.map_or(u64::MAX, |l| l.saturating_sub(*produced));
        let n = samples_per_poll
            .min(capacity.saturating_sub(*dev_pos))
            .min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let start = *dev_pos;
        let mut windows = Vec::with_capacity(targets.len());
        for target in targets.iter_mut() {
            let (channel, role) = (target.channel, target.role);
            for (k, slot) in target.samples[start..start + n].iter_mut().enumerate() {
                *slot = downsampled(channel, *produced + k as u64, *downsampling, role, resolution);
            }
            if role == BufferRole::Min {
                continue;
            }
            windows.push(StreamingWindow {
                channel: target.channel,
                start_index: start,
                no_of_samples: n,
                overflow: self.streaming_overflow(poll, target.channel),
            });
        }
        *produced += n as u64;
        *dev_pos += n;
        *auto_stopped = limit.is_some_and(|l| *produced >= l);
        let status = if *dev_pos >= capacity {
            *full = true;
            PicoStatus::WAITING_FOR_DATA_BUFFERS
        } else {
            PicoStatus::OK
        };
        let latest = StreamingLatest {
            windows,
            auto_stopped: *auto_stopped,
            trigger_at: trigger_at.filter(|t| *t < *produced),
        };
        (status, latest)
    }

    fn no_of_streaming_values(&self, handle: RawHandle) -> (PicoStatus, u64) {
        let state = self.state();
        let Some(unit) = state.units.get(&handle) else {
            return (PicoStatus::INVALID_HANDLE, 0);
        };
        match unit.run {
            Run::Streaming { produced, .. } | Run::Stopped { produced } => (PicoStatus::OK, produced),
            _ => (PicoStatus::NOT_USED_IN_THIS_CAPTURE_MODE, 0),
        }
    }

    fn stop(&self, handle: RawHandle) -> PicoStatus {
        let mut state = self.state();
        let SimState { units, stats, .. } = &mut *state;
        let Some(unit) = units.get_mut(&handle) else {
            return PicoStatus::INVALID_HANDLE;
        };
        stats.entry(unit.serial.clone()).or_default().stop_calls += 1;
        if let Some(status) = self.injected_status(|f| match f {
            SimFault::StopFails { status } => Some(*status),
            _ => None,
        }) {
            return status;
        }
        unit.run = match unit.run {
            Run::Streaming { produced, .. } | Run::Stopped { produced } => Run::Stopped { produced },
            Run::Block { .. } | Run::Idle => Run::Idle,
        };
        PicoStatus::OK
    }
}
