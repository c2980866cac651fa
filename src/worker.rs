//! Poll loops and the background workers built on them.
//!
//! Cancellation is cooperative: a [`StopHandle`] only raises a flag, and the
//! loop that owns the scope observes it between polls. Nothing tears down
//! buffers behind the back of a reader.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::task::Poll;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::native::NativeSdk;
use crate::pico_scope::PicoScope;
use crate::status::Result;
use crate::waveform::WaveformResult;

/// Cross-thread stop request. Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Poll cadence and an optional overall timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    pub cadence: Duration,
    pub timeout: Option<Duration>,
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self::every(Duration::from_millis(1))
    }
}

impl PollSchedule {
    pub fn every(cadence: Duration) -> Self {
        Self {
            cadence,
            timeout: None,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Keep the caller's timeout, or fall back to `timeout`.
    #[must_use]
    pub fn or_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = self.timeout.or(Some(timeout));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit<T> {
    Completed(T),
    Cancelled,
    TimedOut,
}

impl<T> LoopExit<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            Self::Cancelled | Self::TimedOut => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// Call `poll` on `schedule` until it is ready, `stop` is raised or the
/// timeout passes. The stop flag is checked before every poll and the
/// timeout after it. Errors end the loop immediately.
pub fn poll_until<T>(
    schedule: &PollSchedule,
    stop: &StopHandle,
    mut poll: impl FnMut() -> Result<Poll<T>>,
) -> Result<LoopExit<T>> {
    let start = Instant::now();
    loop {
        if stop.is_stop_requested() {
            return Ok(LoopExit::Cancelled);
        }
        if let Poll::Ready(value) = poll()? {
            return Ok(LoopExit::Completed(value));
        }
        if schedule.timeout.is_some_and(|t| start.elapsed() >= t) {
            return Ok(LoopExit::TimedOut);
        }
        thread::sleep(schedule.cadence);
    }
}

fn join<T>(handle: JoinHandle<T>) -> T {
    match handle.join() {
        Ok(value) => value,
        Err(payload) => std::panic::resume_unwind(payload),
    }
}

pub type BlockOutcome<S> = (PicoScope<S>, Result<LoopExit<WaveformResult>>);

/// A block capture waiting for the device on a worker thread. The scope comes
/// back with the result.
#[derive(Debug)]
pub struct BlockCaptureJob<S: NativeSdk + 'static> {
    handle: JoinHandle<BlockOutcome<S>>,
    stop: StopHandle,
}

impl<S: NativeSdk + 'static> BlockCaptureJob<S> {
    pub(crate) fn spawn(mut scope: PicoScope<S>, schedule: PollSchedule) -> Self {
        let stop = scope.stop_handle();
        let handle = thread::spawn(move || {
            let result = scope.complete_block(&schedule);
            (scope, result)
        });
        Self { handle, stop }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// The outcome if the worker is done, the job itself otherwise.
    pub fn try_get_result(self) -> std::result::Result<BlockOutcome<S>, Self> {
        if self.handle.is_finished() {
            Ok(join(self.handle))
        } else {
            Err(self)
        }
    }

    pub fn wait(self) -> BlockOutcome<S> {
        join(self.handle)
    }

    /// Stop at the next poll point and hand the scope back.
    pub fn cancel(self) -> BlockOutcome<S> {
        self.stop.request_stop();
        self.wait()
    }
}

#[derive(Debug)]
pub struct StreamingOutcome<S: NativeSdk> {
    pub scope: PicoScope<S>,
    pub result: Result<()>,
    /// Windows fetched by the worker but not yet received.
    pub remaining: Vec<WaveformResult>,
}

/// A streaming run polled on a worker thread. Every window it fetches is sent
/// over a channel; the last one carries the run's total sample count.
#[derive(Debug)]
pub struct StreamingJob<S: NativeSdk + 'static> {
    handle: JoinHandle<(PicoScope<S>, Result<()>)>,
    windows: mpsc::Receiver<WaveformResult>,
    stop: StopHandle,
}

impl<S: NativeSdk + 'static> StreamingJob<S> {
    pub(crate) fn spawn(mut scope: PicoScope<S>, cadence: Duration) -> Self {
        let stop = scope.stop_handle();
        let (sender, windows) = mpsc::channel();
        let handle = thread::spawn(move || {
            let result = stream_windows(&mut scope, &sender, cadence);
            (scope, result)
        });
        Self {
            handle,
            windows,
            stop,
        }
    }

    pub fn windows(&self) -> &mpsc::Receiver<WaveformResult> {
        &self.windows
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<WaveformResult> {
        self.windows.recv_timeout(timeout).ok()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the run to end by itself.
    pub fn finish(self) -> StreamingOutcome<S> {
        let (scope, result) = join(self.handle);
        StreamingOutcome {
            scope,
            result,
            remaining: self.windows.try_iter().collect(),
        }
    }

    pub fn cancel(self) -> StreamingOutcome<S> {
        self.stop.request_stop();
        self.finish()
    }
}

#[tracing::instrument(level = "debug", skip_all)]
fn stream_windows<S: NativeSdk>(
    scope: &mut PicoScope<S>,
    sender: &mpsc::Sender<WaveformResult>,
    cadence: Duration,
) -> Result<()> {
    loop {
        let poll = scope.poll_streaming()?;
        let finished = poll.status.is_terminal();
        if poll.has_new_samples() || finished {
            let window = scope.fetch()?;
            if sender.send(window).is_err() {
                log::warn!("Window receiver dropped, stopping streaming");
                scope.stop()?;
                if scope.session_status().is_terminal() {
                    scope.fetch()?;
                }
                return Ok(());
            }
        }
        if finished {
            return Ok(());
        }
        thread::sleep(cadence);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{OpContext, ScopeError};
    use std::cell::Cell;

    #[test]
    fn test_poll_until_completes() {
        let calls = Cell::new(0);
        let exit = poll_until(&PollSchedule::every(Duration::ZERO), &StopHandle::new(), || {
            calls.set(calls.get() + 1);
            Ok(if calls.get() == 3 {
                Poll::Ready(calls.get())
            } else {
                Poll::Pending
            })
        })
        .unwrap();
        assert_eq!(exit, LoopExit::Completed(3));
    }

    #[test]
    fn test_stop_checked_before_poll() {
        let stop = StopHandle::new();
        stop.clone().request_stop();
        let exit = poll_until(&PollSchedule::default(), &stop, || -> Result<Poll<()>> {
            Err(ScopeError::state(OpContext::new("never"), "polled after stop"))
        })
        .unwrap();
        assert_eq!(exit, LoopExit::Cancelled);
        stop.reset();
        assert!(!stop.is_stop_requested());
    }

    #[test]
    fn test_timeout() {
        let schedule = PollSchedule::every(Duration::from_millis(1)).with_timeout(Duration::from_millis(5));
        let exit = poll_until(&schedule, &StopHandle::new(), || Ok(Poll::<()>::Pending)).unwrap();
        assert_eq!(exit, LoopExit::TimedOut);
    }

    #[test]
    fn test_or_timeout_keeps_caller_value() {
        let caller = PollSchedule::default().with_timeout(Duration::from_secs(2));
        assert_eq!(caller.or_timeout(Duration::from_secs(9)).timeout, Some(Duration::from_secs(2)));
        assert_eq!(
            PollSchedule::default().or_timeout(Duration::from_secs(9)).timeout,
            Some(Duration::from_secs(9))
        );
    }
}
