use polars::prelude::*;

use crate::buffers::CaptureMode;
use crate::channel_config::{AcquisitionSnapshot, Channel};
use crate::native::TriggerInfo;

const TIME_COLUMN_NAME: &str = "time";

/// Why samples are missing from a streaming retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossCause {
    /// The device reported it could not keep up.
    DeviceReported,
    /// The host buffer wrapped before the samples were fetched.
    BufferWrapped,
}

/// Data-quality warning on a successful retrieval: `samples` samples of
/// `channel` starting at absolute index `first_sample` are lost or suspect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverflowLoss {
    pub channel: Channel,
    pub first_sample: u64,
    pub samples: u64,
    pub cause: LossCause,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelWaveform {
    pub channel: Channel,
    /// Samples, or the bucket maxima of an aggregate capture.
    pub raw: Vec<i16>,
    pub volts: Vec<f64>,
    /// Bucket minima, only set for aggregate captures.
    pub raw_min: Option<Vec<i16>>,
    pub volts_min: Option<Vec<f64>>,
    /// Over range in block mode, any loss in streaming mode.
    pub overflow: bool,
}

/// One channel's samples as they came off the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RawChannel {
    pub channel: Channel,
    pub raw: Vec<i16>,
    pub raw_min: Option<Vec<i16>>,
    pub overflow: bool,
}

/// Retrieved data of one capture or one streaming window. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformResult {
    mode: CaptureMode,
    sample_interval: f64,
    first_sample_index: u64,
    trigger: Option<TriggerInfo>,
    channels: Vec<ChannelWaveform>,
    warnings: Vec<OverflowLoss>,
    total_samples: Option<u64>,
}

impl WaveformResult {
    /// Scale raw samples with the settings frozen at arm time.
    pub(crate) fn assemble(
        mode: CaptureMode,
        snapshot: &AcquisitionSnapshot,
        sample_interval: f64,
        first_sample_index: u64,
        raw: Vec<RawChannel>,
    ) -> Self {
        #[cfg(feature = "cpu-profiling")]
        let _span = tracy_client::Client::running()
            .map(|c| c.span(tracy_client::span_location!("WaveformResult::assemble"), 0));

        let channels = raw
            .into_iter()
            .map(|c| {
                let scaling = snapshot.scaling(c.channel);
                let to_volts = |raw: &[i16]| {
                    scaling.map_or_else(
                        || vec![f64::NAN; raw.len()],
                        |s| raw.iter().map(|r| s.to_volts(*r)).collect(),
                    )
                };
                ChannelWaveform {
                    channel: c.channel,
                    volts: to_volts(&c.raw),
                    volts_min: c.raw_min.as_deref().map(to_volts),
                    raw: c.raw,
                    raw_min: c.raw_min,
                    overflow: c.overflow,
                }
            })
            .collect();
        Self {
            mode,
            sample_interval,
            first_sample_index,
            trigger: None,
            channels,
            warnings: Vec::new(),
            total_samples: None,
        }
    }

    pub(crate) fn with_trigger(mut self, trigger: TriggerInfo) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub(crate) fn with_warnings(mut self, warnings: Vec<OverflowLoss>) -> Self {
        self.warnings = warnings;
        self
    }

    pub(crate) fn with_total(mut self, total: u64) -> Self {
        self.total_samples = Some(total);
        self
    }

    pub fn mode(&self) -> CaptureMode {
        self.mode
    }

    /// Seconds between consecutive samples of this result, downsampling included.
    pub fn sample_interval(&self) -> f64 {
        self.sample_interval
    }

    /// Absolute index of the first sample since the capture started.
    pub fn first_sample_index(&self) -> u64 {
        self.first_sample_index
    }

    pub fn trigger(&self) -> Option<&TriggerInfo> {
        self.trigger.as_ref()
    }

    pub fn channels(&self) -> &[ChannelWaveform] {
        &self.channels
    }

    pub fn channel(&self, channel: Channel) -> Option<&ChannelWaveform> {
        self.channels.iter().find(|c| c.channel == channel)
    }

    pub fn warnings(&self) -> &[OverflowLoss] {
        &self.warnings
    }

    pub fn has_loss(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Samples the device produced over the whole streaming run. Only set on
    /// the final window.
    pub fn total_samples(&self) -> Option<u64> {
        self.total_samples
    }

    /// Samples per channel.
    pub fn len(&self) -> usize {
        self.channels.first().map_or(0, |c| c.raw.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One row per sample: `time` in seconds from the capture start, then a
    /// `<ch>_raw` and a `<ch>_volts` column per channel. Aggregate captures
    /// add `<ch>_min_raw` and `<ch>_min_volts`.
    pub fn to_dataframe(&self) -> PolarsResult<DataFrame> {
        #[cfg(feature = "cpu-profiling")]
        let _span = tracy_client::Client::running()
            .map(|c| c.span(tracy_client::span_location!("WaveformResult::to_dataframe"), 0));

        let time: Vec<f64> = (0..self.len() as u64)
            .map(|i| (self.first_sample_index + i) as f64 * self.sample_interval)
            .collect();
        let mut columns = vec![Column::new(TIME_COLUMN_NAME.into(), time)];
        for c in &self.channels {
            let raw: Vec<i32> = c.raw.iter().map(|r| i32::from(*r)).collect();
            columns.push(Column::new(format!("{}_raw", c.channel).into(), raw));
            columns.push(Column::new(format!("{}_volts", c.channel).into(), c.volts.clone()));
            if let (Some(raw_min), Some(volts_min)) = (&c.raw_min, &c.volts_min) {
                let raw_min: Vec<i32> = raw_min.iter().map(|r| i32::from(*r)).collect();
                columns.push(Column::new(format!("{}_min_raw", c.channel).into(), raw_min));
                columns.push(Column::new(format!("{}_min_volts", c.channel).into(), volts_min.clone()));
            }
        }
        DataFrame::new(columns)
    }
}
