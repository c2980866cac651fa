use std::sync::Arc;
use std::time::Duration;

use crate::block_capture::{BlockCapture, BlockSettings};
use crate::buffers::{BufferAllocator, BufferId, CaptureMode};
use crate::channel_config::{
    Channel, ChannelConfig, ConfigRegistry, Coupling, Resolution, VoltageRange,
};
use crate::device_handle::DeviceHandle;
use crate::native::{NativeSdk, UnitInfo};
use crate::session::{CaptureSession, SessionStatus};
use crate::status::{OpContext, Result, ScopeError};
use crate::streaming_capture::{StreamingCapture, StreamingPoll, StreamingSettings};
use crate::trigger_config::SimpleTrigger;
use crate::waveform::WaveformResult;
use crate::worker::{BlockCaptureJob, LoopExit, PollSchedule, StopHandle, StreamingJob};

/// One open instrument with its settings, buffers and the capture in flight.
///
/// Configuration, binding and arming go through `&mut self`, so they are
/// sequenced per device by construction. The only thing another thread may
/// do is raise the [`StopHandle`].
#[derive(Debug)]
pub struct PicoScope<S: NativeSdk> {
    device: DeviceHandle<S>,
    config: ConfigRegistry,
    buffers: BufferAllocator,
    session: CaptureSession,
    stop: StopHandle,
}

impl<S: NativeSdk> PicoScope<S> {
    /// Open the unit with `serial`, or the first one found, in 8-bit mode.
    pub fn open(sdk: Arc<S>, serial: Option<&str>) -> Result<Self> {
        Self::open_with_resolution(sdk, serial, Resolution::default())
    }

    pub fn open_with_resolution(
        sdk: Arc<S>,
        serial: Option<&str>,
        resolution: Resolution,
    ) -> Result<Self> {
        let device = DeviceHandle::open(sdk, serial, resolution)?;
        Ok(Self {
            device,
            config: ConfigRegistry::new(),
            buffers: BufferAllocator::new(),
            session: CaptureSession::Idle,
            stop: StopHandle::new(),
        })
    }

    pub fn serial(&self) -> &str {
        self.device.serial()
    }

    pub fn resolution(&self) -> Resolution {
        self.device.resolution()
    }

    pub fn is_open(&self) -> bool {
        self.device.is_open()
    }

    pub fn session(&self) -> &CaptureSession {
        &self.session
    }

    pub fn session_status(&self) -> SessionStatus {
        self.session.status()
    }

    /// Handle another thread can use to stop the capture at its next poll.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn config(&self) -> &ConfigRegistry {
        &self.config
    }

    pub fn buffers(&self) -> &BufferAllocator {
        &self.buffers
    }

    pub fn unit_info(&self, info: UnitInfo) -> Result<String> {
        self.device.unit_info(info)
    }

    pub fn ping(&self) -> Result<()> {
        self.device.ping()
    }

    pub fn adc_limits(&self) -> Result<(i16, i16)> {
        self.device.adc_limits()
    }

    pub fn analog_offset_limits(&self, range: VoltageRange, coupling: Coupling) -> Result<(f64, f64)> {
        self.device.analog_offset_limits(range, coupling)
    }

    fn ensure_inactive(&self, operation: &'static str) -> Result<()> {
        let status = self.session.status();
        if status.is_active() {
            return Err(ScopeError::state(
                OpContext::new(operation),
                format!("capture session is {status}"),
            ));
        }
        Ok(())
    }

    /// Switch the ADC resolution. Buffers sized for another sample width
    /// must be released first.
    pub fn set_resolution(&mut self, resolution: Resolution) -> Result<()> {
        let status = self.session.status();
        if status.is_active() {
            return Err(ScopeError::invalid(
                OpContext::new("set_device_resolution"),
                format!("capture in progress ({status})"),
            ));
        }
        if let Some(id) = self
            .buffers
            .iter()
            .find(|b| b.sample_width() != resolution.sample_width())
            .map(|b| b.id())
        {
            return Err(ScopeError::invalid(
                OpContext::new("set_device_resolution"),
                format!("buffer {id} holds samples of another width, release it first"),
            ));
        }
        self.discard_finished();
        self.device.set_resolution(resolution)?;
        self.config.invalidate_timebase();
        Ok(())
    }

    pub fn configure_channel(&mut self, config: ChannelConfig) -> Result<()> {
        self.ensure_inactive("set_channel_on")?;
        self.config.set_channel(&self.device, config)
    }

    pub fn disable_channel(&mut self, channel: Channel) -> Result<()> {
        self.ensure_inactive("set_channel_off")?;
        self.config.disable_channel(&self.device, channel)
    }

    /// Returns the interval the hardware will actually use.
    pub fn configure_timebase(&mut self, interval: f64) -> Result<f64> {
        self.ensure_inactive("set_timebase")?;
        self.config.set_timebase(&self.device, interval)
    }

    pub fn minimum_interval(&self) -> Result<f64> {
        self.config.minimum_interval(&self.device)
    }

    /// Returns the samples available per segment.
    pub fn set_segments(&mut self, segments: u64) -> Result<u64> {
        self.ensure_inactive("memory_segments")?;
        self.config.set_segments(&self.device, segments)
    }

    pub fn configure_trigger(&mut self, trigger: SimpleTrigger) -> Result<()> {
        self.ensure_inactive("set_simple_trigger")?;
        self.config.set_trigger(&self.device, trigger)
    }

    pub fn disable_trigger(&mut self) -> Result<()> {
        self.ensure_inactive("set_simple_trigger")?;
        self.config.disable_trigger(&self.device)
    }

    pub fn allocate(
        &mut self,
        channel: Channel,
        segment: u64,
        capacity: usize,
        mode: CaptureMode,
    ) -> Result<BufferId> {
        self.buffers.allocate(
            &self.config,
            self.device.resolution(),
            channel,
            segment,
            capacity,
            mode,
        )
    }

    pub fn bind(&mut self, id: BufferId) -> Result<()> {
        self.buffers.bind(&self.device, id)
    }

    /// Allocate a buffer and register it with the device in one step. The
    /// buffer is freed again if the device rejects it.
    pub fn allocate_and_bind(
        &mut self,
        channel: Channel,
        segment: u64,
        capacity: usize,
        mode: CaptureMode,
    ) -> Result<BufferId> {
        let id = self.allocate(channel, segment, capacity, mode)?;
        if let Err(e) = self.buffers.bind(&self.device, id) {
            let cleanup = self.buffers.release(&self.device, id);
            return Err(e.with_cleanup(cleanup));
        }
        Ok(id)
    }

    /// Allocate and bind the maximum and minimum buffers an aggregate
    /// capture of `channel` writes to. Returns `(max, min)`.
    pub fn allocate_and_bind_aggregate(
        &mut self,
        channel: Channel,
        segment: u64,
        capacity: usize,
        mode: CaptureMode,
    ) -> Result<(BufferId, BufferId)> {
        let max = self.allocate_and_bind(channel, segment, capacity, mode)?;
        let min = self
            .buffers
            .allocate_min(
                &self.config,
                self.device.resolution(),
                channel,
                segment,
                capacity,
                mode,
            )
            .and_then(|min| match self.buffers.bind(&self.device, min) {
                Ok(()) => Ok(min),
                Err(e) => Err(e.with_cleanup(self.buffers.release(&self.device, min))),
            });
        match min {
            Ok(min) => Ok((max, min)),
            Err(e) => Err(e.with_cleanup(self.buffers.release(&self.device, max))),
        }
    }

    pub fn release(&mut self, id: BufferId) -> Result<()> {
        self.buffers.release(&self.device, id)
    }

    pub fn release_all(&mut self) -> Result<()> {
        self.buffers.release_all(&self.device)
    }

    /// Refuse to arm over an active capture; drop a finished one.
    fn prepare_arm(&mut self, operation: &'static str) -> Result<()> {
        self.device.raw(operation)?;
        self.ensure_inactive(operation)?;
        self.discard_finished();
        self.stop.reset();
        Ok(())
    }

    fn discard_finished(&mut self) {
        let status = self.session.status();
        if status.is_terminal() {
            log::warn!("Discarding {status} capture session on {}", self.device.serial());
        }
        self.session = CaptureSession::Idle;
        self.buffers.unlock();
    }

    /// Return to `Idle` once a controller is done, and give the buffers
    /// back to the caller after a failure.
    fn settle(&mut self) {
        match self.session.status() {
            SessionStatus::Idle => {
                self.session = CaptureSession::Idle;
                self.buffers.unlock();
            }
            SessionStatus::Errored => self.buffers.unlock(),
            _ => {}
        }
    }

    #[tracing::instrument(level = "debug", skip_all)]
    pub fn arm_block(&mut self, settings: BlockSettings) -> Result<()> {
        self.prepare_arm("run_block")?;
        let snapshot = self.config.snapshot(&self.device)?;
        let capture = BlockCapture::arm(&self.device, &mut self.buffers, snapshot, settings)?;
        self.session = CaptureSession::Block(capture);
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    pub fn arm_streaming(&mut self, settings: StreamingSettings) -> Result<()> {
        self.prepare_arm("run_streaming")?;
        let snapshot = self.config.snapshot(&self.device)?;
        let capture = StreamingCapture::arm(&self.device, &mut self.buffers, snapshot, settings)?;
        self.session = CaptureSession::Streaming(capture);
        Ok(())
    }

    /// One poll of whatever capture is armed. A raised stop flag ends the
    /// capture here instead of polling.
    pub fn poll(&mut self) -> Result<SessionStatus> {
        let result = match &mut self.session {
            CaptureSession::Idle => Err(ScopeError::state(
                OpContext::new("poll"),
                "no capture armed",
            )),
            CaptureSession::Block(block) => {
                if self.stop.is_stop_requested() {
                    log::debug!("Stop requested, cancelling block capture");
                    block.stop(&self.device).map(|()| block.status())
                } else {
                    block.poll(&self.device).map(|_| block.status())
                }
            }
            CaptureSession::Streaming(_) => self.poll_streaming().map(|p| p.status),
        };
        self.settle();
        result
    }

    /// Poll a streaming capture and report the new samples per channel.
    pub fn poll_streaming(&mut self) -> Result<StreamingPoll> {
        let CaptureSession::Streaming(streaming) = &mut self.session else {
            return Err(ScopeError::state(
                OpContext::new("get_streaming_latest_values"),
                format!("no streaming capture armed ({})", self.session.status()),
            ));
        };
        if self.stop.is_stop_requested() && streaming.status() == SessionStatus::Running {
            log::debug!("Stop requested, ending streaming run");
            streaming.stop(&self.device)?;
        }
        let result = streaming.poll(&self.device, &mut self.buffers);
        self.settle();
        result
    }

    /// Block until an armed block capture is ready, cancelled or timed out.
    pub fn wait_ready(&mut self, schedule: &PollSchedule) -> Result<LoopExit<()>> {
        let CaptureSession::Block(block) = &mut self.session else {
            return Err(ScopeError::state(
                OpContext::new("is_ready"),
                format!("no block capture armed ({})", self.session.status()),
            ));
        };
        let result = block.wait_ready(&self.device, schedule, &self.stop);
        self.settle();
        result
    }

    /// Retrieve the captured data. A block capture is done afterwards; a
    /// streaming capture is done after the fetch that follows its end.
    pub fn fetch(&mut self) -> Result<WaveformResult> {
        let mut finished = false;
        let result = match &mut self.session {
            CaptureSession::Idle => Err(ScopeError::state(
                OpContext::new("fetch"),
                "no capture armed",
            )),
            CaptureSession::Block(block) => block.fetch(&self.device, &mut self.buffers),
            CaptureSession::Streaming(streaming) => {
                let window = streaming.fetch(&mut self.buffers);
                finished = window.is_ok() && streaming.status().is_terminal();
                window
            }
        };
        if finished {
            self.session = CaptureSession::Idle;
        }
        self.settle();
        result
    }

    /// Stop the capture. Block data is discarded; streaming data not yet
    /// fetched stays available for one more [`fetch`](Self::fetch).
    pub fn stop(&mut self) -> Result<()> {
        let result = match &mut self.session {
            CaptureSession::Idle => Ok(()),
            CaptureSession::Block(block) => block.stop(&self.device),
            CaptureSession::Streaming(streaming) => streaming.stop(&self.device),
        };
        self.settle();
        result
    }

    /// Arm, wait and fetch in one call.
    pub fn capture_block(
        &mut self,
        settings: BlockSettings,
        schedule: &PollSchedule,
    ) -> Result<LoopExit<WaveformResult>> {
        self.arm_block(settings)?;
        self.complete_block(schedule)
    }

    pub(crate) fn complete_block(&mut self, schedule: &PollSchedule) -> Result<LoopExit<WaveformResult>> {
        Ok(match self.wait_ready(schedule)? {
            LoopExit::Completed(()) => LoopExit::Completed(self.fetch()?),
            LoopExit::Cancelled => LoopExit::Cancelled,
            LoopExit::TimedOut => LoopExit::TimedOut,
        })
    }

    /// Release everything the session and the device hold. Safe to call
    /// more than once. An active capture is stopped first.
    pub fn close(&mut self) -> Result<()> {
        if !self.device.is_open() {
            return Ok(());
        }
        let mut result = Ok(());
        if self.session.is_active() {
            log::warn!(
                "Closing {} with a {} capture, forcing stop",
                self.device.serial(),
                self.session.status()
            );
            result = match &mut self.session {
                CaptureSession::Idle => Ok(()),
                CaptureSession::Block(block) => block.stop(&self.device),
                CaptureSession::Streaming(streaming) => streaming.stop(&self.device),
            };
        }
        self.session = CaptureSession::Idle;
        self.buffers.unlock();
        let released = self.buffers.release_all(&self.device);
        let closed = self.device.close();
        for step in [released, closed] {
            result = match result {
                Ok(()) => step,
                Err(e) => Err(e.with_cleanup(step)),
            };
        }
        result
    }
}

impl<S: NativeSdk + 'static> PicoScope<S> {
    /// Arm here, then wait and fetch on a worker thread.
    pub fn run_block_in_background(
        mut self,
        settings: BlockSettings,
        schedule: PollSchedule,
    ) -> std::result::Result<BlockCaptureJob<S>, (Self, ScopeError)> {
        if let Err(e) = self.arm_block(settings) {
            return Err((self, e));
        }
        Ok(BlockCaptureJob::spawn(self, schedule))
    }

    /// Arm here, then poll every `cadence` on a worker thread that sends each
    /// new window to the returned job.
    pub fn stream_in_background(
        mut self,
        settings: StreamingSettings,
        cadence: Duration,
    ) -> std::result::Result<StreamingJob<S>, (Self, ScopeError)> {
        if let Err(e) = self.arm_streaming(settings) {
            return Err((self, e));
        }
        Ok(StreamingJob::spawn(self, cadence))
    }
}

impl<S: NativeSdk> Drop for PicoScope<S> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("Failed to close {}: {e}", self.device.serial());
        }
    }
}
