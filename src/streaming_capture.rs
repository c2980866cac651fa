//! Continuous capture into circular host buffers.
//!
//! The device writes each channel's samples into the bound buffer and,
//! once it reaches the end, refuses to continue until the buffers are handed
//! back; the controller then re-registers them and the device wraps to
//! index 0. Every sample the caller does not fetch before it is overwritten
//! is reported as an [`OverflowLoss`], never dropped silently. The device
//! wraps all channels at the same position, so every circular buffer of a
//! run has the same capacity.

use std::fmt;
use std::task::Poll;
use std::time::{Duration, Instant};

use crate::buffers::{BufferAllocator, CaptureMode};
use crate::channel_config::{AcquisitionSnapshot, CaptureConfigError, Channel};
use crate::device_handle::DeviceHandle;
use crate::native::{BufferRole, Downsampling, NativeSdk, TriggerInfo};
use crate::session::SessionStatus;
use crate::status::{check, check_poll, OpContext, Result, ScopeError};
use crate::waveform::{LossCause, OverflowLoss, RawChannel, WaveformResult};

/// Streaming buffers always live in segment 0.
const STREAMING_SEGMENT: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamingProgress {
    /// Samples per channel received so far.
    pub samples: u64,
    pub elapsed: Duration,
    pub polls: u64,
}

/// Host-side condition ending a streaming run with `AutoStopped`.
pub trait AutoStopCondition: Send + fmt::Debug {
    fn is_met(&self, progress: &StreamingProgress) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleCountReached(pub u64);

impl AutoStopCondition for SampleCountReached {
    fn is_met(&self, progress: &StreamingProgress) -> bool {
        progress.samples >= self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationElapsed(pub Duration);

impl AutoStopCondition for DurationElapsed {
    fn is_met(&self, progress: &StreamingProgress) -> bool {
        progress.elapsed >= self.0
    }
}

#[derive(Debug, Default)]
pub struct StreamingSettings {
    /// Requested interval in seconds. Defaults to the configured timebase.
    pub interval: Option<f64>,
    pub auto_stop: Vec<Box<dyn AutoStopCondition>>,
    /// Ask the firmware to stop by itself after this many samples.
    pub device_auto_stop: Option<u64>,
    pub pre_trigger: u64,
    pub downsampling: Downsampling,
}

impl StreamingSettings {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn interval(mut self, seconds: f64) -> Self {
        self.interval = Some(seconds);
        self
    }

    #[must_use]
    pub fn stop_when(mut self, condition: impl AutoStopCondition + 'static) -> Self {
        self.auto_stop.push(Box::new(condition));
        self
    }

    #[must_use]
    pub fn device_auto_stop(mut self, samples: u64) -> Self {
        self.device_auto_stop = Some(samples);
        self
    }

    #[must_use]
    pub fn with_pre_trigger(mut self, samples: u64) -> Self {
        self.pre_trigger = samples;
        self
    }

    #[must_use]
    pub fn with_downsampling(mut self, downsampling: Downsampling) -> Self {
        self.downsampling = downsampling;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelProgress {
    pub channel: Channel,
    pub new_samples: u64,
    /// Samples were lost on this channel during this poll.
    pub overflow: bool,
}

/// Outcome of one streaming poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingPoll {
    pub status: SessionStatus,
    pub channels: Vec<ChannelProgress>,
}

impl StreamingPoll {
    fn quiet(status: SessionStatus) -> Self {
        Self {
            status,
            channels: Vec::new(),
        }
    }

    pub fn new_samples(&self, channel: Channel) -> u64 {
        self.channels
            .iter()
            .find(|c| c.channel == channel)
            .map_or(0, |c| c.new_samples)
    }

    pub fn has_new_samples(&self) -> bool {
        self.channels.iter().any(|c| c.new_samples > 0)
    }

    pub fn overflowed(&self) -> bool {
        self.channels.iter().any(|c| c.overflow)
    }
}

#[derive(Debug)]
pub struct StreamingCapture {
    status: SessionStatus,
    settings: StreamingSettings,
    snapshot: AcquisitionSnapshot,
    actual_interval: f64,
    started: Instant,
    polls: u64,
    samples: u64,
    pending: Vec<OverflowLoss>,
    trigger_at: Option<u64>,
    total: Option<u64>,
}

impl StreamingCapture {
    pub(crate) fn arm<S: NativeSdk>(
        device: &DeviceHandle<S>,
        buffers: &mut BufferAllocator,
        snapshot: AcquisitionSnapshot,
        settings: StreamingSettings,
    ) -> Result<Self> {
        if settings.downsampling.ratio == 0 {
            return Err(CaptureConfigError::ZeroDownsamplingRatio.into());
        }
        if settings.device_auto_stop == Some(0) {
            return Err(CaptureConfigError::EmptyCapture.into());
        }
        let requested = settings.interval.unwrap_or(snapshot.timebase.actual_interval);
        if !requested.is_finite() || requested <= 0.0 {
            return Err(CaptureConfigError::InvalidInterval(requested).into());
        }
        let handle = device.raw("run_streaming")?;
        let roles: &[BufferRole] = if settings.downsampling.needs_min_buffers() {
            &[BufferRole::Primary, BufferRole::Min]
        } else {
            &[BufferRole::Primary]
        };
        let mut window = None;
        for channel in snapshot.enabled().iter() {
            let context = || OpContext::on("run_streaming", handle).with_channel(channel);
            for role in roles {
                let Some(buffer) = buffers.bound_as(channel, STREAMING_SEGMENT, *role) else {
                    return Err(ScopeError::invalid(
                        context(),
                        format!("no {role:?} circular buffer bound"),
                    ));
                };
                match window {
                    None => window = Some(buffer.capacity()),
                    Some(size) if size != buffer.capacity() => {
                        return Err(ScopeError::invalid(
                            context(),
                            format!(
                                "circular buffers differ in size: {} samples here, {size} elsewhere",
                                buffer.capacity()
                            ),
                        ))
                    }
                    Some(_) => {}
                }
            }
        }
        let window = window.unwrap_or_default();

        let post_trigger = settings
            .device_auto_stop
            .map_or(window as u64, |n| n.saturating_sub(settings.pre_trigger));
        log::debug!(
            "Starting streaming at {requested:e} s into {window}-sample windows, device auto-stop {:?}",
            settings.device_auto_stop
        );
        let (status, actual_interval) = device.sdk().run_streaming(
            handle,
            requested,
            settings.pre_trigger,
            post_trigger,
            settings.device_auto_stop.is_some(),
            settings.downsampling,
        );
        check(status, || OpContext::on("run_streaming", handle))?;
        buffers.lock(STREAMING_SEGMENT);
        log::debug!("Streaming running at {actual_interval:e} s");

        Ok(Self {
            status: SessionStatus::Running,
            settings,
            snapshot,
            actual_interval,
            started: Instant::now(),
            polls: 0,
            samples: 0,
            pending: Vec::new(),
            trigger_at: None,
            total: None,
        })
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn snapshot(&self) -> &AcquisitionSnapshot {
        &self.snapshot
    }

    /// Interval the device settled on. Authoritative over the requested one.
    pub fn actual_interval(&self) -> f64 {
        self.actual_interval
    }

    pub fn polls(&self) -> u64 {
        self.polls
    }

    /// Samples per channel received from the device so far.
    pub fn samples_collected(&self) -> u64 {
        self.samples
    }

    pub fn total_samples(&self) -> Option<u64> {
        self.total
    }

    fn progress(&self) -> StreamingProgress {
        StreamingProgress {
            samples: self.samples,
            elapsed: self.started.elapsed(),
            polls: self.polls,
        }
    }

    /// Ask the device for new samples. Terminal sessions answer with an empty
    /// poll so callers can keep a single loop.
    #[tracing::instrument(level = "trace", skip_all)]
    pub(crate) fn poll<S: NativeSdk>(
        &mut self,
        device: &DeviceHandle<S>,
        buffers: &mut BufferAllocator,
    ) -> Result<StreamingPoll> {
        #[cfg(feature = "cpu-profiling")]
        let _span = tracy_client::Client::running()
            .map(|c| c.span(tracy_client::span_location!("StreamingCapture::poll"), 0));

        match self.status {
            SessionStatus::Running => {}
            SessionStatus::Stopped | SessionStatus::AutoStopped => {
                return Ok(StreamingPoll::quiet(self.status))
            }
            other => {
                return Err(ScopeError::state(
                    OpContext::new("get_streaming_latest_values"),
                    format!("streaming capture is {other}"),
                ))
            }
        }
        let handle = device.raw("get_streaming_latest_values")?;
        self.polls += 1;
        let needs_min = self.settings.downsampling.needs_min_buffers();
        let (status, latest) = {
            let mut targets = buffers.targets(STREAMING_SEGMENT, self.snapshot.enabled(), needs_min);
            device.sdk().get_streaming_latest_values(handle, &mut targets)
        };
        let buffers_full = status.is_buffers_full();
        if !buffers_full {
            match check_poll(status, || OpContext::on("get_streaming_latest_values", handle)) {
                Ok(Poll::Ready(())) => {}
                Ok(Poll::Pending) => return Ok(StreamingPoll::quiet(self.status)),
                Err(e) => return Err(self.abort(device, buffers, e)),
            }
        }

        let mut report = StreamingPoll::quiet(SessionStatus::Running);
        for window in &latest.windows {
            let new_samples = window.no_of_samples as u64;
            let Some(buffer) = buffers.bound_mut(window.channel, STREAMING_SEGMENT, BufferRole::Primary)
            else {
                continue;
            };
            let first = buffer.write_cursor();
            buffer.advance_write(new_samples);
            let wrapped = buffer.skip_overwritten();
            if needs_min {
                if let Some(min) = buffers.bound_mut(window.channel, STREAMING_SEGMENT, BufferRole::Min) {
                    min.advance_write(new_samples);
                    min.skip_overwritten();
                }
            }
            let mut overflow = false;
            if window.overflow {
                overflow = true;
                self.pending.push(OverflowLoss {
                    channel: window.channel,
                    first_sample: first,
                    samples: new_samples,
                    cause: LossCause::DeviceReported,
                });
            }
            if let Some((first_lost, lost)) = wrapped {
                overflow = true;
                self.pending.push(OverflowLoss {
                    channel: window.channel,
                    first_sample: first_lost,
                    samples: lost,
                    cause: LossCause::BufferWrapped,
                });
            }
            if overflow {
                log::warn!(
                    "Streaming overflow on channel {} around sample {first}",
                    window.channel
                );
            }
            report.channels.push(ChannelProgress {
                channel: window.channel,
                new_samples,
                overflow,
            });
        }
        let new_samples = latest.windows.first().map_or(0, |w| w.no_of_samples as u64);
        self.samples += new_samples;
        if self.trigger_at.is_none() {
            self.trigger_at = latest.trigger_at;
        }
        tracing::trace!(
            polls = self.polls,
            new_samples,
            overflow = report.overflowed(),
            "streaming poll"
        );

        if buffers_full {
            log::debug!("Device buffers full after {} samples, handing them back", self.samples);
            if let Err(e) = buffers.reload(device, STREAMING_SEGMENT) {
                return Err(self.abort(device, buffers, e));
            }
        }

        if latest.auto_stopped {
            log::debug!("Device auto-stopped after {} samples", self.samples);
            self.finish(device, SessionStatus::AutoStopped)?;
        } else {
            let progress = self.progress();
            let met = self
                .settings
                .auto_stop
                .iter()
                .find(|c| c.is_met(&progress))
                .map(|c| format!("{c:?}"));
            if let Some(condition) = met {
                log::debug!("Auto-stop condition {condition} met");
                self.finish(device, SessionStatus::AutoStopped)?;
            }
        }
        report.status = self.status;
        Ok(report)
    }

    /// Hand out every sample received since the last fetch. Valid while
    /// running and once more after the run ended.
    pub(crate) fn fetch(&mut self, buffers: &mut BufferAllocator) -> Result<WaveformResult> {
        #[cfg(feature = "cpu-profiling")]
        let _span = tracy_client::Client::running()
            .map(|c| c.span(tracy_client::span_location!("StreamingCapture::fetch"), 0));

        match self.status {
            SessionStatus::Running | SessionStatus::Stopped | SessionStatus::AutoStopped => {}
            other => {
                return Err(ScopeError::state(
                    OpContext::new("fetch"),
                    format!("streaming capture is {other}, nothing to retrieve"),
                ))
            }
        }
        let enabled = self.snapshot.enabled();
        let first_sample_index = enabled
            .iter()
            .find_map(|c| buffers.bound(c, STREAMING_SEGMENT))
            .map_or(0, |b| b.read_cursor());
        let warnings = std::mem::take(&mut self.pending);
        let needs_min = self.settings.downsampling.needs_min_buffers();
        let raw = enabled
            .iter()
            .filter_map(|channel| {
                let raw = buffers
                    .bound_mut(channel, STREAMING_SEGMENT, BufferRole::Primary)?
                    .drain_unread();
                let raw_min = if needs_min {
                    buffers
                        .bound_mut(channel, STREAMING_SEGMENT, BufferRole::Min)
                        .map(|b| b.drain_unread())
                } else {
                    None
                };
                Some(RawChannel {
                    channel,
                    raw,
                    raw_min,
                    overflow: warnings.iter().any(|w| w.channel == channel),
                })
            })
            .collect();
        let interval = self.actual_interval * self.settings.downsampling.effective_ratio() as f64;
        let mut result = WaveformResult::assemble(
            CaptureMode::Streaming,
            &self.snapshot,
            interval,
            first_sample_index,
            raw,
        )
        .with_warnings(warnings);
        if let Some(trigger_index) = self.trigger_at {
            result = result.with_trigger(TriggerInfo {
                segment: STREAMING_SEGMENT,
                trigger_index,
                triggered: true,
            });
        }
        if self.status.is_terminal() {
            if let Some(total) = self.total {
                result = result.with_total(total);
            }
        }
        Ok(result)
    }

    /// Caller-initiated stop. Unfetched samples stay available.
    pub(crate) fn stop<S: NativeSdk>(&mut self, device: &DeviceHandle<S>) -> Result<()> {
        if self.status != SessionStatus::Running {
            return Ok(());
        }
        self.finish(device, SessionStatus::Stopped)
    }

    /// Stop the device and only then report the run as ended. A device that
    /// refuses to stop leaves the capture `Errored`.
    fn finish<S: NativeSdk>(&mut self, device: &DeviceHandle<S>, status: SessionStatus) -> Result<()> {
        let stopped = device.raw("stop").and_then(|handle| {
            check(device.sdk().stop(handle), || OpContext::on("stop", handle)).map(|()| handle)
        });
        let handle = match stopped {
            Ok(handle) => handle,
            Err(e) => {
                log::warn!("Streaming could not be stopped, unfetched samples dropped: {e}");
                self.status = SessionStatus::Errored;
                self.pending.clear();
                return Err(e);
            }
        };
        self.status = status;
        let (status, total) = device.sdk().no_of_streaming_values(handle);
        check(status, || OpContext::on("no_of_streaming_values", handle))?;
        log::debug!("Streaming {} after {total} samples", self.status);
        self.total = Some(total);
        Ok(())
    }

    /// End the run after a device failure. Samples not yet fetched are
    /// counted and dropped.
    fn abort<S: NativeSdk>(
        &mut self,
        device: &DeviceHandle<S>,
        buffers: &BufferAllocator,
        cause: ScopeError,
    ) -> ScopeError {
        self.status = SessionStatus::Errored;
        self.pending.clear();
        let discarded_samples = buffers.unread_in(STREAMING_SEGMENT);
        let cleanup = device
            .raw("stop")
            .and_then(|h| check(device.sdk().stop(h), || OpContext::on("stop", h)));
        log::warn!("Streaming aborted, {discarded_samples} unfetched samples lost: {cause}");
        ScopeError::SessionAborted {
            cause: Box::new(cause.with_cleanup(cleanup)),
            discarded_samples,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel_config::{Channel, ChannelConfig, ConfigRegistry, Resolution};
    use crate::sim::{SimConfig, SimFault, SimulatedSdk};
    use crate::status::{ErrorKind, PicoStatus};
    use std::sync::Arc;

    struct Bench {
        device: DeviceHandle<SimulatedSdk>,
        registry: ConfigRegistry,
        buffers: BufferAllocator,
    }

    fn bench(config: SimConfig, window: usize) -> Bench {
        let sdk = Arc::new(SimulatedSdk::new(config));
        let device = DeviceHandle::open(sdk, None, Resolution::Bits8).unwrap();
        let mut registry = ConfigRegistry::new();
        registry
            .set_channel(&device, ChannelConfig::new(Channel::A))
            .unwrap();
        registry.set_timebase(&device, 1e-6).unwrap();
        let mut buffers = BufferAllocator::new();
        let id = buffers
            .allocate(&registry, Resolution::Bits8, Channel::A, 0, window, CaptureMode::Streaming)
            .unwrap();
        buffers.bind(&device, id).unwrap();
        Bench {
            device,
            registry,
            buffers,
        }
    }

    fn arm(b: &mut Bench, settings: StreamingSettings) -> StreamingCapture {
        let snapshot = b.registry.snapshot(&b.device).unwrap();
        StreamingCapture::arm(&b.device, &mut b.buffers, snapshot, settings).unwrap()
    }

    fn assert_sequence(result: &WaveformResult) {
        let a = result.channel(Channel::A).unwrap();
        for (i, raw) in a.raw.iter().enumerate() {
            let index = result.first_sample_index() + i as u64;
            assert_eq!(*raw, SimulatedSdk::expected_sample(Channel::A, index, Resolution::Bits8));
        }
    }

    #[test]
    fn test_fetch_while_running_advances_cursor() {
        let mut b = bench(SimConfig::default().samples_per_poll(30), 100);
        let mut capture = arm(&mut b, StreamingSettings::new());
        let poll = capture.poll(&b.device, &mut b.buffers).unwrap();
        assert_eq!(poll.new_samples(Channel::A), 30);
        let first = capture.fetch(&mut b.buffers).unwrap();
        assert_eq!(first.len(), 30);
        assert_eq!(first.first_sample_index(), 0);

        capture.poll(&b.device, &mut b.buffers).unwrap();
        let second = capture.fetch(&mut b.buffers).unwrap();
        assert_eq!(second.first_sample_index(), 30);
        assert_eq!(second.len(), 30);
        assert_sequence(&second);
        assert!(!second.has_loss());
    }

    #[test]
    fn test_buffer_reload_wraps_without_loss() {
        let mut b = bench(SimConfig::default().samples_per_poll(40), 100);
        let mut capture = arm(&mut b, StreamingSettings::new());
        let mut received = 0;
        for _ in 0..10 {
            capture.poll(&b.device, &mut b.buffers).unwrap();
            let window = capture.fetch(&mut b.buffers).unwrap();
            assert_eq!(window.first_sample_index(), received);
            assert_sequence(&window);
            assert!(!window.has_loss());
            received += window.len() as u64;
        }
        assert_eq!(received, capture.samples_collected());
        assert!(received > 100);
    }

    #[test]
    fn test_unfetched_wrap_reports_loss() {
        let mut b = bench(SimConfig::default().samples_per_poll(40), 100);
        let mut capture = arm(&mut b, StreamingSettings::new());
        for _ in 0..4 {
            capture.poll(&b.device, &mut b.buffers).unwrap();
        }
        // 40 + 40 + 20 fill the buffer, the reload wraps and 40 more overwrite.
        assert_eq!(capture.samples_collected(), 140);
        let window = capture.fetch(&mut b.buffers).unwrap();
        assert_eq!(window.len(), 100);
        assert_eq!(window.first_sample_index(), 40);
        assert_eq!(
            window.warnings(),
            &[OverflowLoss {
                channel: Channel::A,
                first_sample: 0,
                samples: 40,
                cause: LossCause::BufferWrapped,
            }]
        );
        assert_sequence(&window);
    }

    #[test]
    fn test_device_overflow_flags_only_its_window() {
        let config = SimConfig::default().samples_per_poll(10).fault(SimFault::StreamingOverflow {
            poll: 2,
            channel: Channel::A,
        });
        let mut b = bench(config, 100);
        let mut capture = arm(&mut b, StreamingSettings::new());

        capture.poll(&b.device, &mut b.buffers).unwrap();
        let clean = capture.fetch(&mut b.buffers).unwrap();
        assert!(!clean.has_loss());

        let poll = capture.poll(&b.device, &mut b.buffers).unwrap();
        assert!(poll.overflowed());
        let lossy = capture.fetch(&mut b.buffers).unwrap();
        assert_eq!(lossy.warnings().len(), 1);
        assert_eq!(lossy.warnings()[0].first_sample, 10);
        assert_eq!(lossy.warnings()[0].cause, LossCause::DeviceReported);
        assert!(lossy.channel(Channel::A).unwrap().overflow);

        capture.poll(&b.device, &mut b.buffers).unwrap();
        let after = capture.fetch(&mut b.buffers).unwrap();
        assert!(!after.has_loss());
        assert_sequence(&after);
    }

    #[test]
    fn test_host_auto_stop_keeps_final_window() {
        let mut b = bench(SimConfig::default().samples_per_poll(25), 200);
        let mut capture = arm(&mut b, StreamingSettings::new().stop_when(SampleCountReached(50)));
        assert_eq!(capture.poll(&b.device, &mut b.buffers).unwrap().status, SessionStatus::Running);
        let last = capture.poll(&b.device, &mut b.buffers).unwrap();
        assert_eq!(last.status, SessionStatus::AutoStopped);
        let window = capture.fetch(&mut b.buffers).unwrap();
        assert_eq!(window.len(), 50);
        assert_eq!(window.total_samples(), Some(50));
    }

    #[test]
    fn test_device_auto_stop() {
        let mut b = bench(SimConfig::default().samples_per_poll(30), 200);
        let mut capture = arm(&mut b, StreamingSettings::new().device_auto_stop(75));
        let mut status = SessionStatus::Running;
        for _ in 0..5 {
            status = capture.poll(&b.device, &mut b.buffers).unwrap().status;
        }
        assert_eq!(status, SessionStatus::AutoStopped);
        assert_eq!(capture.fetch(&mut b.buffers).unwrap().len(), 75);
    }

    #[test]
    fn test_disconnect_discards_unfetched() {
        let config = SimConfig::default()
            .samples_per_poll(10)
            .fault(SimFault::Disconnect { after_polls: 2 });
        let mut b = bench(config, 100);
        let mut capture = arm(&mut b, StreamingSettings::new());
        capture.poll(&b.device, &mut b.buffers).unwrap();
        capture.poll(&b.device, &mut b.buffers).unwrap();
        let err = capture.poll(&b.device, &mut b.buffers).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceNotResponding);
        assert!(matches!(
            err,
            ScopeError::SessionAborted {
                discarded_samples: 20,
                ..
            }
        ));
        assert_eq!(capture.status(), SessionStatus::Errored);
        let err = capture.fetch(&mut b.buffers).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateViolation);
    }

    #[test]
    fn test_unequal_buffers_refused_at_arm() {
        let mut b = bench(SimConfig::default().samples_per_poll(40), 100);
        b.registry
            .set_channel(&b.device, ChannelConfig::new(Channel::B))
            .unwrap();
        b.registry.set_timebase(&b.device, 1e-6).unwrap();
        let id = b
            .buffers
            .allocate(&b.registry, Resolution::Bits8, Channel::B, 0, 150, CaptureMode::Streaming)
            .unwrap();
        b.buffers.bind(&b.device, id).unwrap();
        let snapshot = b.registry.snapshot(&b.device).unwrap();
        let err = StreamingCapture::arm(&b.device, &mut b.buffers, snapshot, StreamingSettings::new())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(!b.buffers.is_locked());
        assert!(!b.device.sdk().is_running("SIM0001"));
    }

    #[test]
    fn test_failed_stop_is_errored() {
        let config = SimConfig::default().samples_per_poll(10).fault(SimFault::StopFails {
            status: PicoStatus::NOT_RESPONDING,
        });
        let mut b = bench(config, 100);
        let mut capture = arm(&mut b, StreamingSettings::new());
        capture.poll(&b.device, &mut b.buffers).unwrap();
        let err = capture.stop(&b.device).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceNotResponding);
        assert_eq!(capture.status(), SessionStatus::Errored);
        assert!(capture.total_samples().is_none());
        assert_eq!(capture.fetch(&mut b.buffers).unwrap_err().kind(), ErrorKind::StateViolation);
    }

    #[test]
    fn test_aggregate_streams_max_and_min() {
        let mut b = bench(SimConfig::default().samples_per_poll(30), 100);
        let id = b
            .buffers
            .allocate_min(&b.registry, Resolution::Bits8, Channel::A, 0, 100, CaptureMode::Streaming)
            .unwrap();
        b.buffers.bind(&b.device, id).unwrap();
        let ds = Downsampling::aggregate(4);
        let mut capture = arm(&mut b, StreamingSettings::new().with_downsampling(ds));
        let mut received = 0;
        for _ in 0..5 {
            capture.poll(&b.device, &mut b.buffers).unwrap();
            let window = capture.fetch(&mut b.buffers).unwrap();
            assert!(!window.has_loss());
            let a = window.channel(Channel::A).unwrap();
            let min = a.raw_min.as_ref().unwrap();
            assert_eq!(min.len(), a.raw.len());
            for (i, (hi, lo)) in a.raw.iter().zip(min).enumerate() {
                let index = window.first_sample_index() + i as u64;
                assert_eq!(*hi, SimulatedSdk::expected_downsampled(Channel::A, index, ds, Resolution::Bits8));
                assert_eq!(*lo, SimulatedSdk::expected_minimum(Channel::A, index, ds, Resolution::Bits8));
            }
            received += window.len();
        }
        assert!(received > 100);
    }
}
