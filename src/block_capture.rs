use std::task::Poll;
use std::time::Duration;

use crate::buffers::{BufferAllocator, CaptureMode};
use crate::channel_config::{AcquisitionSnapshot, CaptureConfigError};
use crate::device_handle::DeviceHandle;
use crate::native::{BufferRole, Downsampling, NativeSdk, RawHandle};
use crate::session::SessionStatus;
use crate::status::{check, check_poll, OpContext, Result, ScopeError};
use crate::waveform::{RawChannel, WaveformResult};
use crate::worker::{poll_until, LoopExit, PollSchedule, StopHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSettings {
    pub pre_trigger: u64,
    pub post_trigger: u64,
    pub segment: u64,
    pub downsampling: Downsampling,
}

impl BlockSettings {
    /// Capture `samples` samples after the trigger, no pre-trigger part.
    pub fn new(samples: u64) -> Self {
        Self {
            pre_trigger: 0,
            post_trigger: samples,
            segment: 0,
            downsampling: Downsampling::RAW,
        }
    }

    #[must_use]
    pub fn with_pre_trigger(mut self, samples: u64) -> Self {
        self.pre_trigger = samples;
        self
    }

    #[must_use]
    pub fn in_segment(mut self, segment: u64) -> Self {
        self.segment = segment;
        self
    }

    #[must_use]
    pub fn with_downsampling(mut self, downsampling: Downsampling) -> Self {
        self.downsampling = downsampling;
        self
    }

    /// Samples the device records per channel.
    pub fn capture_length(&self) -> u64 {
        self.pre_trigger + self.post_trigger
    }

    /// Samples per channel after downsampling.
    pub fn output_length(&self) -> u64 {
        self.capture_length() / self.downsampling.effective_ratio().max(1)
    }

    fn validate(&self, snapshot: &AcquisitionSnapshot) -> std::result::Result<(), CaptureConfigError> {
        if self.downsampling.ratio == 0 {
            return Err(CaptureConfigError::ZeroDownsamplingRatio);
        }
        if self.output_length() == 0 {
            return Err(CaptureConfigError::EmptyCapture);
        }
        if self.capture_length() > snapshot.timebase.max_samples {
            return Err(CaptureConfigError::CaptureTooLong {
                requested: self.capture_length(),
                max: snapshot.timebase.max_samples,
            });
        }
        Ok(())
    }
}

/// One bounded acquisition: arm, poll until ready, fetch.
#[derive(Debug)]
pub struct BlockCapture {
    status: SessionStatus,
    settings: BlockSettings,
    snapshot: AcquisitionSnapshot,
    polls: u32,
    time_indisposed: Duration,
}

fn stop_device<S: NativeSdk>(device: &DeviceHandle<S>, handle: RawHandle) -> Result<()> {
    check(device.sdk().stop(handle), || OpContext::on("stop", handle))
}

impl BlockCapture {
    /// Start the capture. Every enabled channel needs a bound buffer in the
    /// capture's segment large enough for the downsampled length, and a
    /// `Min` buffer as well when aggregating.
    pub(crate) fn arm<S: NativeSdk>(
        device: &DeviceHandle<S>,
        buffers: &mut BufferAllocator,
        snapshot: AcquisitionSnapshot,
        settings: BlockSettings,
    ) -> Result<Self> {
        settings.validate(&snapshot)?;
        let handle = device.raw("run_block")?;
        let needed = settings.output_length();
        let roles: &[BufferRole] = if settings.downsampling.needs_min_buffers() {
            &[BufferRole::Primary, BufferRole::Min]
        } else {
            &[BufferRole::Primary]
        };
        for channel in snapshot.enabled().iter() {
            let context = || OpContext::on("run_block", handle).with_channel(channel);
            for role in roles {
                match buffers.bound_as(channel, settings.segment, *role) {
                    None => {
                        return Err(ScopeError::invalid(
                            context(),
                            format!("no {role:?} buffer bound in segment {}", settings.segment),
                        ))
                    }
                    Some(buffer) if (buffer.capacity() as u64) < needed => {
                        return Err(ScopeError::invalid(
                            context(),
                            format!("buffer holds {} samples, capture needs {needed}", buffer.capacity()),
                        ))
                    }
                    Some(_) => {}
                }
            }
        }

        log::debug!(
            "Running block capture: {} pre + {} post samples, timebase {}, segment {}",
            settings.pre_trigger,
            settings.post_trigger,
            snapshot.timebase.timebase,
            settings.segment
        );
        let (status, indisposed_ms) = device.sdk().run_block(
            handle,
            settings.pre_trigger,
            settings.post_trigger,
            snapshot.timebase.timebase,
            settings.segment,
        );
        check(status, || OpContext::on("run_block", handle))?;
        buffers.lock(settings.segment);

        Ok(Self {
            status: SessionStatus::Armed,
            settings,
            snapshot,
            polls: 0,
            time_indisposed: Duration::try_from_secs_f64(indisposed_ms / 1e3).unwrap_or_default(),
        })
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn settings(&self) -> &BlockSettings {
        &self.settings
    }

    pub fn snapshot(&self) -> &AcquisitionSnapshot {
        &self.snapshot
    }

    /// Readiness queries issued so far.
    pub fn polls(&self) -> u32 {
        self.polls
    }

    /// How long the device said it would be busy capturing.
    pub fn time_indisposed(&self) -> Duration {
        self.time_indisposed
    }

    /// Timeout used when the caller's schedule has none.
    pub fn default_timeout(&self) -> Duration {
        self.time_indisposed * 10 + Duration::from_secs(1)
    }

    /// One readiness query. A busy device is `Pending`, not an error.
    pub(crate) fn poll<S: NativeSdk>(&mut self, device: &DeviceHandle<S>) -> Result<Poll<()>> {
        match self.status {
            SessionStatus::Ready => return Ok(Poll::Ready(())),
            SessionStatus::Armed | SessionStatus::Polling => {}
            other => {
                return Err(ScopeError::state(
                    OpContext::new("is_ready"),
                    format!("block capture is {other}"),
                ))
            }
        }
        let handle = device.raw("is_ready")?;
        self.polls += 1;
        self.status = SessionStatus::Polling;
        let (status, ready) = device.sdk().is_ready(handle);
        tracing::trace!(polls = self.polls, ready, "block poll");
        match check_poll(status, || OpContext::on("is_ready", handle)) {
            Ok(Poll::Ready(())) if ready => {
                log::debug!("Block capture ready after {} polls", self.polls);
                self.status = SessionStatus::Ready;
                Ok(Poll::Ready(()))
            }
            Ok(_) => Ok(Poll::Pending),
            Err(e) => {
                self.status = SessionStatus::Errored;
                Err(e.with_cleanup(stop_device(device, handle)))
            }
        }
    }

    /// Poll on `schedule` until the capture is ready, `stop` is raised or the
    /// timeout passes. Timeout and cancellation both stop the device and leave
    /// the capture `Idle`; a timeout is reported as `DeviceNotResponding`.
    #[tracing::instrument(level = "debug", skip_all)]
    pub(crate) fn wait_ready<S: NativeSdk>(
        &mut self,
        device: &DeviceHandle<S>,
        schedule: &PollSchedule,
        stop: &StopHandle,
    ) -> Result<LoopExit<()>> {
        let schedule = schedule.or_timeout(self.default_timeout());
        match poll_until(&schedule, stop, || self.poll(device))? {
            LoopExit::Completed(()) => Ok(LoopExit::Completed(())),
            LoopExit::Cancelled => {
                log::debug!("Block capture cancelled after {} polls", self.polls);
                self.stop(device)?;
                Ok(LoopExit::Cancelled)
            }
            LoopExit::TimedOut => {
                let handle = device.raw("is_ready")?;
                let err = ScopeError::DeviceNotResponding {
                    context: OpContext::on("is_ready", handle),
                    reason: format!(
                        "not ready after {} polls within {:?}",
                        self.polls,
                        schedule.timeout.unwrap_or_default()
                    ),
                };
                log::warn!("{err}");
                Err(err.with_cleanup(self.stop(device)))
            }
        }
    }

    /// Copy the captured samples out. Only valid once the capture is ready;
    /// in any other state nothing is touched. A failed transfer stops the
    /// device and leaves the capture `Errored`.
    pub(crate) fn fetch<S: NativeSdk>(
        &mut self,
        device: &DeviceHandle<S>,
        buffers: &mut BufferAllocator,
    ) -> Result<WaveformResult> {
        #[cfg(feature = "cpu-profiling")]
        let _span = tracy_client::Client::running()
            .map(|c| c.span(tracy_client::span_location!("BlockCapture::fetch"), 0));

        if self.status != SessionStatus::Ready {
            return Err(ScopeError::state(
                OpContext::new("get_values"),
                format!("block capture is {}, data is available once ready", self.status),
            ));
        }
        let handle = device.raw("get_values")?;
        let segment = self.settings.segment;
        let downsampling = self.settings.downsampling;
        let (status, samples, over_range) = {
            let mut targets = buffers.targets(
                segment,
                self.snapshot.enabled(),
                downsampling.needs_min_buffers(),
            );
            device
                .sdk()
                .get_values(handle, 0, &mut targets, downsampling, segment)
        };
        if let Err(e) = check(status, || OpContext::on("get_values", handle)) {
            return Err(self.fail(device, handle, e));
        }

        let trigger = if self.snapshot.trigger.is_some() {
            let (status, info) = device.sdk().get_trigger_info(handle, segment);
            if let Err(e) = check(status, || OpContext::on("get_trigger_info", handle)) {
                return Err(self.fail(device, handle, e));
            }
            Some(info)
        } else {
            None
        };

        let copy_out = |channel, role| {
            buffers.bound_as(channel, segment, role).map(|b| {
                let n = samples.min(b.capacity());
                b.samples()[..n].to_vec()
            })
        };
        let raw = self
            .snapshot
            .enabled()
            .iter()
            .filter_map(|channel| {
                copy_out(channel, BufferRole::Primary).map(|raw| RawChannel {
                    channel,
                    raw,
                    raw_min: downsampling
                        .needs_min_buffers()
                        .then(|| copy_out(channel, BufferRole::Min))
                        .flatten(),
                    overflow: over_range.contains(channel),
                })
            })
            .collect();
        let interval =
            self.snapshot.timebase.actual_interval * self.settings.downsampling.effective_ratio() as f64;
        let mut result = WaveformResult::assemble(CaptureMode::Block, &self.snapshot, interval, 0, raw);
        if let Some(info) = trigger {
            result = result.with_trigger(info);
        }
        if !over_range.is_empty() {
            log::warn!("Channels over range: {:?}", over_range.iter().collect::<Vec<_>>());
        }
        log::debug!("Fetched {samples} samples per channel");
        self.status = SessionStatus::Idle;
        Ok(result)
    }

    fn fail<S: NativeSdk>(
        &mut self,
        device: &DeviceHandle<S>,
        handle: RawHandle,
        cause: ScopeError,
    ) -> ScopeError {
        self.status = SessionStatus::Errored;
        log::warn!("Block retrieval failed, stopping the device: {cause}");
        cause.with_cleanup(stop_device(device, handle))
    }

    /// Abort the capture and discard partial data. A no-op when idle.
    pub(crate) fn stop<S: NativeSdk>(&mut self, device: &DeviceHandle<S>) -> Result<()> {
        if self.status == SessionStatus::Idle {
            return Ok(());
        }
        self.status = SessionStatus::Idle;
        let handle = device.raw("stop")?;
        stop_device(device, handle)
    }
}
