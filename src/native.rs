//! The call surface of the vendor instrument library.
//!
//! Every call returns a [`PicoStatus`] alongside its outputs; nothing here
//! interprets it. Sample buffers are not registered by address. Instead the
//! caller lends its buffers as [`ChannelTarget`]s at the moment data moves,
//! and `set_data_buffer` only tells the device how many samples a
//! `(channel, segment)` slot holds.

use crate::channel_config::{Bandwidth, Channel, ChannelFlags, Coupling, Resolution, VoltageRange};
use crate::status::PicoStatus;
use crate::trigger_config::ThresholdDirection;

/// Handle value handed out by the library. Valid handles are positive:
/// 0 means no unit was found, negative means the unit failed to open.
pub type RawHandle = i16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitInfo {
    DriverVersion,
    UsbVersion,
    HardwareVersion,
    VariantInfo,
    BatchAndSerial,
    CalibrationDate,
    FirmwareVersion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DownsamplingMode {
    #[default]
    Raw,
    Decimate,
    Average,
    /// Minimum and maximum of each bucket, written to a pair of buffers.
    Aggregate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Downsampling {
    pub mode: DownsamplingMode,
    pub ratio: u64,
}

impl Default for Downsampling {
    fn default() -> Self {
        Self::RAW
    }
}

impl Downsampling {
    pub const RAW: Self = Self {
        mode: DownsamplingMode::Raw,
        ratio: 1,
    };

    pub fn decimate(ratio: u64) -> Self {
        Self {
            mode: DownsamplingMode::Decimate,
            ratio,
        }
    }

    pub fn average(ratio: u64) -> Self {
        Self {
            mode: DownsamplingMode::Average,
            ratio,
        }
    }

    pub fn aggregate(ratio: u64) -> Self {
        Self {
            mode: DownsamplingMode::Aggregate,
            ratio,
        }
    }

    /// Ratio actually applied: `Raw` ignores the configured ratio.
    pub fn effective_ratio(self) -> u64 {
        match self.mode {
            DownsamplingMode::Raw => 1,
            DownsamplingMode::Decimate | DownsamplingMode::Average | DownsamplingMode::Aggregate => {
                self.ratio
            }
        }
    }

    /// Whether each channel needs a [`BufferRole::Min`] buffer besides its primary one.
    pub fn needs_min_buffers(self) -> bool {
        self.mode == DownsamplingMode::Aggregate
    }
}

/// Which buffer of a `(channel, segment)` slot a call refers to. Aggregate
/// downsampling fills a pair: maxima go to `Primary`, minima to `Min`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum BufferRole {
    #[default]
    Primary,
    Min,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferAction {
    Add,
    Clear,
}

/// Trigger settings in device units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeTrigger {
    pub source: Channel,
    pub threshold: i16,
    pub direction: ThresholdDirection,
    /// Samples between the trigger event and the start of the capture.
    pub delay: u64,
    /// Fire anyway after this many microseconds, 0 waits forever.
    pub auto_trigger_us: u32,
}

/// A caller-owned buffer lent to the library for one call.
#[derive(Debug)]
pub struct ChannelTarget<'a> {
    pub channel: Channel,
    pub role: BufferRole,
    pub samples: &'a mut [i16],
}

/// One channel's newly written region after a streaming poll. A `Min`
/// buffer, when lent, is written at the same positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamingWindow {
    pub channel: Channel,
    /// Index into the channel's buffer where the new samples start.
    pub start_index: usize,
    pub no_of_samples: usize,
    /// The device lost samples before this window.
    pub overflow: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamingLatest {
    pub windows: Vec<StreamingWindow>,
    pub auto_stopped: bool,
    /// Absolute sample index of the trigger, once it fired.
    pub trigger_at: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerInfo {
    pub segment: u64,
    pub trigger_index: u64,
    pub triggered: bool,
}

/// Native capability surface, one method per library entry point.
pub trait NativeSdk: Send + Sync {
    fn enumerate_units(&self) -> (PicoStatus, Vec<String>);
    fn open_unit(&self, serial: Option<&str>, resolution: Resolution) -> (PicoStatus, RawHandle);
    fn close_unit(&self, handle: RawHandle) -> PicoStatus;
    fn ping_unit(&self, handle: RawHandle) -> PicoStatus;
    fn get_unit_info(&self, handle: RawHandle, info: UnitInfo) -> (PicoStatus, String);

    fn set_device_resolution(&self, handle: RawHandle, resolution: Resolution) -> PicoStatus;
    fn get_adc_limits(&self, handle: RawHandle, resolution: Resolution) -> (PicoStatus, i16, i16);

    fn set_channel_on(
        &self,
        handle: RawHandle,
        channel: Channel,
        coupling: Coupling,
        range: VoltageRange,
        analog_offset: f64,
        bandwidth: Bandwidth,
    ) -> PicoStatus;
    fn set_channel_off(&self, handle: RawHandle, channel: Channel) -> PicoStatus;
    fn get_analogue_offset_limits(
        &self,
        handle: RawHandle,
        range: VoltageRange,
        coupling: Coupling,
    ) -> (PicoStatus, f64, f64);

    /// Interval in seconds and samples available per segment for `timebase`.
    fn get_timebase(&self, handle: RawHandle, timebase: u32, segment: u64) -> (PicoStatus, f64, u64);
    /// Fastest timebase and its interval for a channel set, without a handle.
    fn get_minimum_timebase(
        &self,
        enabled: ChannelFlags,
        resolution: Resolution,
    ) -> (PicoStatus, u32, f64);
    /// Timebase closest to `interval` seconds and the interval it yields.
    fn nearest_sample_interval(
        &self,
        enabled: ChannelFlags,
        interval: f64,
        resolution: Resolution,
    ) -> (PicoStatus, u32, f64);
    fn memory_segments(&self, handle: RawHandle, segments: u64) -> (PicoStatus, u64);

    fn set_simple_trigger(&self, handle: RawHandle, trigger: Option<&NativeTrigger>) -> PicoStatus;

    fn set_data_buffer(
        &self,
        handle: RawHandle,
        channel: Channel,
        segment: u64,
        role: BufferRole,
        samples: usize,
        sample_width: usize,
        action: BufferAction,
    ) -> PicoStatus;

    /// Start a block capture. Returns the estimated milliseconds the device
    /// will be busy.
    fn run_block(
        &self,
        handle: RawHandle,
        pre_trigger: u64,
        post_trigger: u64,
        timebase: u32,
        segment: u64,
    ) -> (PicoStatus, f64);
    fn is_ready(&self, handle: RawHandle) -> (PicoStatus, bool);
    /// Copy captured samples into `targets`. Returns the samples per channel
    /// written and the channels that went over range.
    fn get_values(
        &self,
        handle: RawHandle,
        start: u64,
        targets: &mut [ChannelTarget<'_>],
        downsampling: Downsampling,
        segment: u64,
    ) -> (PicoStatus, usize, ChannelFlags);
    fn get_trigger_info(&self, handle: RawHandle, segment: u64) -> (PicoStatus, TriggerInfo);

    /// Start streaming. Returns the interval in seconds the device settled on.
    fn run_streaming(
        &self,
        handle: RawHandle,
        interval: f64,
        pre_trigger: u64,
        post_trigger: u64,
        auto_stop: bool,
        downsampling: Downsampling,
    ) -> (PicoStatus, f64);
    fn get_streaming_latest_values(
        &self,
        handle: RawHandle,
        targets: &mut [ChannelTarget<'_>],
    ) -> (PicoStatus, StreamingLatest);
    fn no_of_streaming_values(&self, handle: RawHandle) -> (PicoStatus, u64);

    fn stop(&self, handle: RawHandle) -> PicoStatus;
}
