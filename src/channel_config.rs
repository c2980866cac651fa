use std::fmt;

use crate::device_handle::DeviceHandle;
use crate::native::{NativeSdk, NativeTrigger, RawHandle};
use crate::status::{check, OpContext, Result, ScopeError};
use crate::trigger_config::SimpleTrigger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    A,
    B,
    C,
    D,
    E,
    F,
    G,
    H,
}

impl Channel {
    pub const ALL: [Self; 8] = [
        Self::A,
        Self::B,
        Self::C,
        Self::D,
        Self::E,
        Self::F,
        Self::G,
        Self::H,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn flag(self) -> ChannelFlags {
        ChannelFlags(1 << self.index())
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = (b'A' + self.index() as u8) as char;
        write!(f, "{c}")
    }
}

/// Set of channels, one bit per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ChannelFlags(u8);

impl ChannelFlags {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn contains(self, channel: Channel) -> bool {
        self.0 & channel.flag().0 != 0
    }

    pub fn insert(&mut self, channel: Channel) {
        self.0 |= channel.flag().0;
    }

    #[must_use]
    pub fn with(mut self, channel: Channel) -> Self {
        self.insert(channel);
        self
    }

    pub fn remove(&mut self, channel: Channel) {
        self.0 &= !channel.flag().0;
    }

    pub fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = Channel> {
        Channel::ALL.into_iter().filter(move |c| self.contains(*c))
    }
}

impl FromIterator<Channel> for ChannelFlags {
    fn from_iter<I: IntoIterator<Item = Channel>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), Self::with)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coupling {
    Ac,
    Dc,
    Dc50Ohm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Bandwidth {
    #[default]
    Full,
    Bw20MHz,
    Bw25MHz,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VoltageRange {
    Mv10,
    Mv20,
    Mv50,
    Mv100,
    Mv200,
    Mv500,
    V1,
    V2,
    V5,
    V10,
    V20,
}

impl VoltageRange {
    pub const ALL: [Self; 11] = [
        Self::Mv10,
        Self::Mv20,
        Self::Mv50,
        Self::Mv100,
        Self::Mv200,
        Self::Mv500,
        Self::V1,
        Self::V2,
        Self::V5,
        Self::V10,
        Self::V20,
    ];

    /// Full-scale voltage, i.e. the volts represented by the maximum ADC count.
    pub fn full_scale(self) -> f64 {
        match self {
            Self::Mv10 => 0.01,
            Self::Mv20 => 0.02,
            Self::Mv50 => 0.05,
            Self::Mv100 => 0.1,
            Self::Mv200 => 0.2,
            Self::Mv500 => 0.5,
            Self::V1 => 1.0,
            Self::V2 => 2.0,
            Self::V5 => 5.0,
            Self::V10 => 10.0,
            Self::V20 => 20.0,
        }
    }

    pub fn supports(self, coupling: Coupling) -> bool {
        coupling != Coupling::Dc50Ohm || self <= Self::V5
    }

    /// Largest analog offset magnitude accepted for this range and coupling.
    pub fn offset_limit(self, coupling: Coupling) -> f64 {
        match self {
            Self::Mv10 | Self::Mv20 | Self::Mv50 | Self::Mv100 | Self::Mv200 | Self::Mv500 => 1.25,
            Self::V1 | Self::V2 | Self::V5 if coupling == Coupling::Dc50Ohm => 5.0,
            Self::V1 | Self::V2 | Self::V5 => 12.5,
            Self::V10 | Self::V20 => 20.0,
        }
    }
}

impl fmt::Display for VoltageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.full_scale();
        if v < 1.0 {
            write!(f, "±{}mV", (v * 1000.0).round())
        } else {
            write!(f, "±{v}V")
        }
    }
}

/// ADC bit depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Resolution {
    #[default]
    Bits8,
    Bits10,
    Bits12,
}

impl Resolution {
    pub fn bits(self) -> u8 {
        match self {
            Self::Bits8 => 8,
            Self::Bits10 => 10,
            Self::Bits12 => 12,
        }
    }

    /// Bytes per sample in a host buffer.
    pub fn sample_width(self) -> usize {
        match self {
            Self::Bits8 => 1,
            Self::Bits10 | Self::Bits12 => 2,
        }
    }

    pub fn max_enabled_channels(self) -> usize {
        match self {
            Self::Bits8 | Self::Bits10 => Channel::ALL.len(),
            Self::Bits12 => 2,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-bit", self.bits())
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CaptureConfigError {
    #[error("Range {range} is not available with {coupling:?} coupling")]
    RangeNotSupported {
        range: VoltageRange,
        coupling: Coupling,
    },

    #[error("Analog offset {offset} V outside ±{limit} V for this range")]
    OffsetOutOfRange { offset: f64, limit: f64 },

    #[error("Sample interval must be a positive number of seconds, got {0}")]
    InvalidInterval(f64),

    #[error("No channel is enabled")]
    NoChannelsEnabled,

    #[error("Timebase has not been set since the channel set last changed")]
    TimebaseNotSet,

    #[error("{enabled} channels enabled but {resolution} mode allows at most {max}")]
    TooManyChannels {
        enabled: usize,
        resolution: Resolution,
        max: usize,
    },

    #[error("Trigger threshold outside the source channel's range")]
    VoltageOutOfRange,

    #[error("Trigger source channel {0} is disabled")]
    TriggerChannelDisabled(Channel),

    #[error("Buffer capacity must be at least one sample")]
    ZeroCapacity,

    #[error("Channel {0} is disabled")]
    ChannelDisabled(Channel),

    #[error("Segment {segment} out of range, device has {segments} segments")]
    SegmentOutOfRange { segment: u64, segments: u64 },

    #[error("Segment count must be at least one")]
    ZeroSegments,

    #[error("Downsampling ratio must be at least one")]
    ZeroDownsamplingRatio,

    #[error("Capture length must be at least one sample")]
    EmptyCapture,

    #[error("Capture of {requested} samples exceeds the {max} available per segment")]
    CaptureTooLong { requested: u64, max: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelConfig {
    pub channel: Channel,
    pub enabled: bool,
    pub range: VoltageRange,
    pub coupling: Coupling,
    /// Analog offset in volts, added to the input before digitisation.
    pub offset: f64,
    pub bandwidth: Bandwidth,
}

impl ChannelConfig {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            enabled: true,
            range: VoltageRange::V1,
            coupling: Coupling::Dc,
            offset: 0.0,
            bandwidth: Bandwidth::Full,
        }
    }

    fn disabled(channel: Channel) -> Self {
        Self {
            enabled: false,
            ..Self::new(channel)
        }
    }

    #[must_use]
    pub fn range(mut self, range: VoltageRange) -> Self {
        self.range = range;
        self
    }

    #[must_use]
    pub fn coupling(mut self, coupling: Coupling) -> Self {
        self.coupling = coupling;
        self
    }

    #[must_use]
    pub fn offset(mut self, volts: f64) -> Self {
        self.offset = volts;
        self
    }

    #[must_use]
    pub fn bandwidth(mut self, bandwidth: Bandwidth) -> Self {
        self.bandwidth = bandwidth;
        self
    }

    pub fn validate(&self) -> std::result::Result<(), CaptureConfigError> {
        if !self.range.supports(self.coupling) {
            return Err(CaptureConfigError::RangeNotSupported {
                range: self.range,
                coupling: self.coupling,
            });
        }
        let limit = self.range.offset_limit(self.coupling);
        if !self.offset.is_finite() || self.offset.abs() > limit {
            return Err(CaptureConfigError::OffsetOutOfRange {
                offset: self.offset,
                limit,
            });
        }
        Ok(())
    }
}

/// Sampling configuration as corrected by the hardware.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimebaseConfig {
    pub requested_interval: f64,
    /// Authoritative interval in seconds. All timing math uses this value.
    pub actual_interval: f64,
    pub timebase: u32,
    pub max_samples: u64,
}

/// Converts raw ADC counts of one channel to volts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelScaling {
    pub full_scale: f64,
    pub offset: f64,
    pub adc_max: i16,
}

impl ChannelScaling {
    pub fn to_volts(&self, raw: i16) -> f64 {
        f64::from(raw) / f64::from(self.adc_max) * self.full_scale - self.offset
    }

    /// Inverse of [`Self::to_volts`], `None` when `volts` is not representable.
    pub fn to_adc(&self, volts: f64) -> Option<i16> {
        let counts = ((volts + self.offset) / self.full_scale * f64::from(self.adc_max)).round();
        let max = f64::from(self.adc_max);
        (counts.is_finite() && counts.abs() <= max).then_some(counts as i16)
    }
}

/// Configuration frozen at arm time. Retrieval scales with this, never with
/// whatever the registry holds by the time data is fetched.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionSnapshot {
    pub channels: Vec<ChannelConfig>,
    pub timebase: TimebaseConfig,
    pub trigger: Option<NativeTrigger>,
    pub resolution: Resolution,
    pub adc_max: i16,
}

impl AcquisitionSnapshot {
    pub fn enabled(&self) -> ChannelFlags {
        self.channels.iter().map(|c| c.channel).collect()
    }

    pub fn scaling(&self, channel: Channel) -> Option<ChannelScaling> {
        self.channels
            .iter()
            .find(|c| c.channel == channel)
            .map(|c| ChannelScaling {
                full_scale: c.range.full_scale(),
                offset: c.offset,
                adc_max: self.adc_max,
            })
    }
}

/// Channel, timebase and trigger settings of one device.
///
/// Every setter validates locally first and only then pushes the value to
/// the hardware; a rejected value never reaches the device.
#[derive(Debug, Clone)]
pub struct ConfigRegistry {
    channels: [ChannelConfig; 8],
    timebase: Option<TimebaseConfig>,
    /// The trigger as asked for, and its counts under the current source setting.
    trigger: Option<(SimpleTrigger, NativeTrigger)>,
    segments: u64,
}

impl Default for ConfigRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigRegistry {
    pub fn new() -> Self {
        Self {
            channels: Channel::ALL.map(ChannelConfig::disabled),
            timebase: None,
            trigger: None,
            segments: 1,
        }
    }

    pub fn channel(&self, channel: Channel) -> &ChannelConfig {
        &self.channels[channel.index()]
    }

    pub fn enabled_channels(&self) -> ChannelFlags {
        self.channels
            .iter()
            .filter(|c| c.enabled)
            .map(|c| c.channel)
            .collect()
    }

    pub fn timebase(&self) -> Option<&TimebaseConfig> {
        self.timebase.as_ref()
    }

    pub fn trigger(&self) -> Option<&NativeTrigger> {
        self.trigger.as_ref().map(|(_, native)| native)
    }

    pub fn simple_trigger(&self) -> Option<&SimpleTrigger> {
        self.trigger.as_ref().map(|(simple, _)| simple)
    }

    pub fn segments(&self) -> u64 {
        self.segments
    }

    pub fn set_channel<S: NativeSdk>(
        &mut self,
        device: &DeviceHandle<S>,
        config: ChannelConfig,
    ) -> Result<()> {
        config.validate()?;
        let handle = device.raw("set_channel_on")?;
        let retrigger = self.retarget_trigger(device, &config, handle)?;
        log::debug!(
            "Enabling channel {} at {} {:?}, offset {} V",
            config.channel,
            config.range,
            config.coupling,
            config.offset
        );
        check(
            device.sdk().set_channel_on(
                handle,
                config.channel,
                config.coupling,
                config.range,
                config.offset,
                config.bandwidth,
            ),
            || OpContext::on("set_channel_on", handle).with_channel(config.channel),
        )?;
        let was_enabled = self.channel(config.channel).enabled;
        self.channels[config.channel.index()] = ChannelConfig {
            enabled: true,
            ..config
        };
        if !was_enabled {
            self.invalidate_timebase();
        }
        if let Some((simple, native)) = retrigger {
            log::debug!(
                "Trigger on {} moved to {} counts for the new setting",
                native.source,
                native.threshold
            );
            check(device.sdk().set_simple_trigger(handle, Some(&native)), || {
                OpContext::on("set_simple_trigger", handle).with_channel(native.source)
            })?;
            self.trigger = Some((simple, native));
        }
        Ok(())
    }

    /// Threshold counts of a trigger sourced from `config.channel` once
    /// `config` applies. `None` when nothing needs to change.
    fn retarget_trigger<S: NativeSdk>(
        &self,
        device: &DeviceHandle<S>,
        config: &ChannelConfig,
        handle: RawHandle,
    ) -> Result<Option<(SimpleTrigger, NativeTrigger)>> {
        let Some((simple, current)) = self.trigger.filter(|(s, _)| s.source() == config.channel)
        else {
            return Ok(None);
        };
        let (_, adc_max) = device.adc_limits()?;
        let scaling = ChannelScaling {
            full_scale: config.range.full_scale(),
            offset: config.offset,
            adc_max,
        };
        let native = simple.into_native(&scaling).map_err(|e| {
            ScopeError::invalid(
                OpContext::on("set_channel_on", handle).with_channel(config.channel),
                format!("trigger at {} V: {e}", simple.volts()),
            )
        })?;
        Ok((native != current).then_some((simple, native)))
    }

    pub fn disable_channel<S: NativeSdk>(
        &mut self,
        device: &DeviceHandle<S>,
        channel: Channel,
    ) -> Result<()> {
        let handle = device.raw("set_channel_off")?;
        log::debug!("Disabling channel {channel}");
        check(device.sdk().set_channel_off(handle, channel), || {
            OpContext::on("set_channel_off", handle).with_channel(channel)
        })?;
        if self.channel(channel).enabled {
            self.channels[channel.index()].enabled = false;
            self.invalidate_timebase();
        }
        if self.trigger.is_some_and(|(t, _)| t.source() == channel) {
            log::warn!("Trigger source {channel} disabled, trigger dropped");
            check(device.sdk().set_simple_trigger(handle, None), || {
                OpContext::on("set_simple_trigger", handle).with_channel(channel)
            })?;
            self.trigger = None;
        }
        Ok(())
    }

    /// Ask the hardware for the interval nearest to `requested` seconds and
    /// return the interval it will actually use.
    pub fn set_timebase<S: NativeSdk>(
        &mut self,
        device: &DeviceHandle<S>,
        requested: f64,
    ) -> Result<f64> {
        if !requested.is_finite() || requested <= 0.0 {
            return Err(CaptureConfigError::InvalidInterval(requested).into());
        }
        let enabled = self.enabled_channels();
        if enabled.is_empty() {
            return Err(CaptureConfigError::NoChannelsEnabled.into());
        }
        let handle = device.raw("set_timebase")?;
        let sdk = device.sdk();
        let (status, timebase, _) =
            sdk.nearest_sample_interval(enabled, requested, device.resolution());
        check(status, || OpContext::on("nearest_sample_interval", handle))?;
        let (status, actual_interval, max_samples) = sdk.get_timebase(handle, timebase, 0);
        check(status, || OpContext::on("get_timebase", handle))?;

        log::debug!(
            "Requested interval {requested:e} s, hardware uses {actual_interval:e} s (timebase {timebase})"
        );
        self.timebase = Some(TimebaseConfig {
            requested_interval: requested,
            actual_interval,
            timebase,
            max_samples,
        });
        Ok(actual_interval)
    }

    /// Fastest interval the current channel set and resolution allow.
    pub fn minimum_interval<S: NativeSdk>(&self, device: &DeviceHandle<S>) -> Result<f64> {
        let enabled = self.enabled_channels();
        if enabled.is_empty() {
            return Err(CaptureConfigError::NoChannelsEnabled.into());
        }
        let (status, _, interval) = device
            .sdk()
            .get_minimum_timebase(enabled, device.resolution());
        check(status, || OpContext::new("get_minimum_timebase_stateless"))?;
        Ok(interval)
    }

    pub fn set_trigger<S: NativeSdk>(
        &mut self,
        device: &DeviceHandle<S>,
        trigger: SimpleTrigger,
    ) -> Result<()> {
        let source = self.channel(trigger.source());
        if !source.enabled {
            return Err(CaptureConfigError::TriggerChannelDisabled(source.channel).into());
        }
        let (_, adc_max) = device.adc_limits()?;
        let scaling = ChannelScaling {
            full_scale: source.range.full_scale(),
            offset: source.offset,
            adc_max,
        };
        let native = trigger.into_native(&scaling)?;
        let handle = device.raw("set_simple_trigger")?;
        log::debug!(
            "Trigger on {} {:?} at {} counts",
            native.source,
            native.direction,
            native.threshold
        );
        check(device.sdk().set_simple_trigger(handle, Some(&native)), || {
            OpContext::on("set_simple_trigger", handle).with_channel(native.source)
        })?;
        self.trigger = Some((trigger, native));
        Ok(())
    }

    pub fn disable_trigger<S: NativeSdk>(&mut self, device: &DeviceHandle<S>) -> Result<()> {
        let handle = device.raw("set_simple_trigger")?;
        check(device.sdk().set_simple_trigger(handle, None), || {
            OpContext::on("set_simple_trigger", handle)
        })?;
        self.trigger = None;
        Ok(())
    }

    /// Split device memory into `segments` partitions. Returns the samples
    /// available per segment.
    pub fn set_segments<S: NativeSdk>(
        &mut self,
        device: &DeviceHandle<S>,
        segments: u64,
    ) -> Result<u64> {
        if segments == 0 {
            return Err(CaptureConfigError::ZeroSegments.into());
        }
        let handle = device.raw("memory_segments")?;
        let (status, max_samples) = device.sdk().memory_segments(handle, segments);
        check(status, || OpContext::on("memory_segments", handle))?;
        log::debug!("{segments} segments of {max_samples} samples");
        self.segments = segments;
        self.invalidate_timebase();
        Ok(max_samples)
    }

    pub(crate) fn check_segment(&self, segment: u64) -> std::result::Result<(), CaptureConfigError> {
        if segment >= self.segments {
            return Err(CaptureConfigError::SegmentOutOfRange {
                segment,
                segments: self.segments,
            });
        }
        Ok(())
    }

    pub(crate) fn invalidate_timebase(&mut self) {
        if self.timebase.take().is_some() {
            log::debug!("Channel set changed, timebase must be set again");
        }
    }

    /// Freeze the settings for one capture.
    pub fn snapshot<S: NativeSdk>(&self, device: &DeviceHandle<S>) -> Result<AcquisitionSnapshot> {
        let enabled = self.enabled_channels();
        if enabled.is_empty() {
            return Err(CaptureConfigError::NoChannelsEnabled.into());
        }
        let resolution = device.resolution();
        if enabled.count() > resolution.max_enabled_channels() {
            return Err(CaptureConfigError::TooManyChannels {
                enabled: enabled.count(),
                resolution,
                max: resolution.max_enabled_channels(),
            }
            .into());
        }
        let timebase = self.timebase.ok_or(CaptureConfigError::TimebaseNotSet)?;
        let (_, adc_max) = device.adc_limits()?;
        Ok(AcquisitionSnapshot {
            channels: self.channels.iter().filter(|c| c.enabled).copied().collect(),
            timebase,
            trigger: self.trigger.map(|(_, native)| native),
            resolution,
            adc_max,
        })
    }
}
