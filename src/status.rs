//! Translation of native status codes into typed outcomes.
//!
//! Every call into the instrument SDK returns a 32-bit status word. This module
//! is the only place that looks at those words: [`PicoStatus::kind`] sorts them
//! into the closed [`StatusKind`] set, and [`check`] / [`check_poll`] turn them
//! into `Result`s that the rest of the crate propagates with `?`.

use std::fmt;
use std::task::Poll;

use crate::channel_config::{CaptureConfigError, Channel};
use crate::native::RawHandle;

/// Raw status word returned by a native call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PicoStatus(pub u32);

impl PicoStatus {
    pub const OK: Self = Self(0x0000_0000);
    pub const MAX_UNITS_OPENED: Self = Self(0x0000_0001);
    pub const MEMORY_FAIL: Self = Self(0x0000_0002);
    pub const NOT_FOUND: Self = Self(0x0000_0003);
    pub const FW_FAIL: Self = Self(0x0000_0004);
    pub const OPEN_OPERATION_IN_PROGRESS: Self = Self(0x0000_0005);
    pub const OPERATION_FAILED: Self = Self(0x0000_0006);
    pub const NOT_RESPONDING: Self = Self(0x0000_0007);
    pub const CONFIG_FAIL: Self = Self(0x0000_0008);
    pub const INVALID_HANDLE: Self = Self(0x0000_000C);
    pub const INVALID_PARAMETER: Self = Self(0x0000_000D);
    pub const INVALID_TIMEBASE: Self = Self(0x0000_000E);
    pub const INVALID_VOLTAGE_RANGE: Self = Self(0x0000_000F);
    pub const INVALID_CHANNEL: Self = Self(0x0000_0010);
    pub const INVALID_TRIGGER_CHANNEL: Self = Self(0x0000_0011);
    pub const STREAMING_FAILED: Self = Self(0x0000_0014);
    pub const BLOCK_MODE_FAILED: Self = Self(0x0000_0015);
    pub const NULL_PARAMETER: Self = Self(0x0000_0016);
    pub const DATA_NOT_AVAILABLE: Self = Self(0x0000_0018);
    pub const ETS_NOT_SUPPORTED: Self = Self(0x0000_001A);
    pub const BUFFER_STALL: Self = Self(0x0000_001C);
    pub const TOO_MANY_SAMPLES: Self = Self(0x0000_001D);
    pub const TOO_MANY_SEGMENTS: Self = Self(0x0000_001E);
    pub const DEVICE_SAMPLING: Self = Self(0x0000_0024);
    pub const NO_SAMPLES_AVAILABLE: Self = Self(0x0000_0025);
    pub const SEGMENT_OUT_OF_RANGE: Self = Self(0x0000_0026);
    pub const BUSY: Self = Self(0x0000_0027);
    pub const INVALID_SAMPLE_INTERVAL: Self = Self(0x0000_002B);
    pub const INVALID_BUFFER: Self = Self(0x0000_0037);
    pub const CANCELLED: Self = Self(0x0000_003A);
    pub const INVALID_CALL: Self = Self(0x0000_003C);
    pub const INVALID_SAMPLERATIO: Self = Self(0x0000_0040);
    pub const INVALID_STATE: Self = Self(0x0000_0041);
    pub const INVALID_COUPLING: Self = Self(0x0000_0045);
    pub const BUFFERS_NOT_SET: Self = Self(0x0000_0046);
    pub const RATIO_MODE_NOT_SUPPORTED: Self = Self(0x0000_0047);
    pub const INTERFACE_NOT_CONNECTED: Self = Self(0x0000_004A);
    pub const FPGA_FAIL: Self = Self(0x0000_004E);
    pub const INVALID_ANALOGUE_OFFSET: Self = Self(0x0000_0050);
    pub const NOT_USED_IN_THIS_CAPTURE_MODE: Self = Self(0x0000_005E);
    pub const COUPLING_NOT_SUPPORTED: Self = Self(0x0000_010C);
    pub const BANDWIDTH_NOT_SUPPORTED: Self = Self(0x0000_010D);
    pub const NOT_SUPPORTED_BY_THIS_DEVICE: Self = Self(0x0000_011F);
    pub const INVALID_DEVICE_RESOLUTION: Self = Self(0x0000_0120);
    pub const INVALID_NUMBER_CHANNELS_FOR_RESOLUTION: Self = Self(0x0000_0121);
    pub const TIMEOUT: Self = Self(0x0000_0143);
    pub const DEVICE_NOT_FUNCTIONING: Self = Self(0x0000_0144);
    pub const INTERNAL_ERROR: Self = Self(0x0000_0145);
    pub const RESOLUTION_NOT_SUPPORTED_BY_VARIANT: Self = Self(0x0000_017B);
    pub const WAITING_FOR_DATA_BUFFERS: Self = Self(0x0000_0197);
    pub const HARDWARE_CAPTURE_TIMEOUT: Self = Self(0x0000_6000);
    pub const HARDWARE_READY_TIMEOUT: Self = Self(0x0000_6001);
    pub const HARDWARE_CAPTURING_CALL_STOP: Self = Self(0x0000_6002);
    pub const TOO_FEW_REQUESTED_STREAMING_SAMPLES: Self = Self(0x0000_7000);

    pub fn is_ok(self) -> bool {
        self == Self::OK
    }

    /// The streaming "buffers full" signal. Not an error: the bound buffers
    /// must be handed back before the device writes past their end.
    pub fn is_buffers_full(self) -> bool {
        self == Self::WAITING_FOR_DATA_BUFFERS
    }

    pub fn kind(self) -> StatusKind {
        match self {
            Self::OK | Self::WAITING_FOR_DATA_BUFFERS => StatusKind::Ok,

            Self::BUSY
            | Self::OPEN_OPERATION_IN_PROGRESS
            | Self::NO_SAMPLES_AVAILABLE
            | Self::DEVICE_SAMPLING => StatusKind::Retryable,

            Self::INVALID_HANDLE
            | Self::INVALID_PARAMETER
            | Self::INVALID_TIMEBASE
            | Self::INVALID_VOLTAGE_RANGE
            | Self::INVALID_CHANNEL
            | Self::INVALID_TRIGGER_CHANNEL
            | Self::NULL_PARAMETER
            | Self::TOO_MANY_SAMPLES
            | Self::TOO_MANY_SEGMENTS
            | Self::SEGMENT_OUT_OF_RANGE
            | Self::INVALID_SAMPLE_INTERVAL
            | Self::INVALID_CALL
            | Self::INVALID_SAMPLERATIO
            | Self::INVALID_STATE
            | Self::INVALID_COUPLING
            | Self::BUFFERS_NOT_SET
            | Self::INVALID_ANALOGUE_OFFSET
            | Self::INVALID_DEVICE_RESOLUTION
            | Self::INVALID_NUMBER_CHANNELS_FOR_RESOLUTION
            | Self::TOO_FEW_REQUESTED_STREAMING_SAMPLES => StatusKind::InvalidArgument,

            Self::NOT_FOUND
            | Self::MAX_UNITS_OPENED
            | Self::NOT_RESPONDING
            | Self::INTERFACE_NOT_CONNECTED
            | Self::TIMEOUT
            | Self::HARDWARE_CAPTURE_TIMEOUT
            | Self::HARDWARE_READY_TIMEOUT => StatusKind::DeviceNotResponding,

            Self::ETS_NOT_SUPPORTED
            | Self::RATIO_MODE_NOT_SUPPORTED
            | Self::NOT_USED_IN_THIS_CAPTURE_MODE
            | Self::COUPLING_NOT_SUPPORTED
            | Self::BANDWIDTH_NOT_SUPPORTED
            | Self::NOT_SUPPORTED_BY_THIS_DEVICE
            | Self::RESOLUTION_NOT_SUPPORTED_BY_VARIANT => StatusKind::NotSupported,

            _ => StatusKind::HardwareFault,
        }
    }

    fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::OK => "OK",
            Self::MAX_UNITS_OPENED => "MAX_UNITS_OPENED",
            Self::MEMORY_FAIL => "MEMORY_FAIL",
            Self::NOT_FOUND => "NOT_FOUND",
            Self::FW_FAIL => "FW_FAIL",
            Self::OPEN_OPERATION_IN_PROGRESS => "OPEN_OPERATION_IN_PROGRESS",
            Self::OPERATION_FAILED => "OPERATION_FAILED",
            Self::NOT_RESPONDING => "NOT_RESPONDING",
            Self::CONFIG_FAIL => "CONFIG_FAIL",
            Self::INVALID_HANDLE => "INVALID_HANDLE",
            Self::INVALID_PARAMETER => "INVALID_PARAMETER",
            Self::INVALID_TIMEBASE => "INVALID_TIMEBASE",
            Self::INVALID_VOLTAGE_RANGE => "INVALID_VOLTAGE_RANGE",
            Self::INVALID_CHANNEL => "INVALID_CHANNEL",
            Self::INVALID_TRIGGER_CHANNEL => "INVALID_TRIGGER_CHANNEL",
            Self::STREAMING_FAILED => "STREAMING_FAILED",
            Self::BLOCK_MODE_FAILED => "BLOCK_MODE_FAILED",
            Self::NULL_PARAMETER => "NULL_PARAMETER",
            Self::DATA_NOT_AVAILABLE => "DATA_NOT_AVAILABLE",
            Self::ETS_NOT_SUPPORTED => "ETS_NOT_SUPPORTED",
            Self::BUFFER_STALL => "BUFFER_STALL",
            Self::TOO_MANY_SAMPLES => "TOO_MANY_SAMPLES",
            Self::TOO_MANY_SEGMENTS => "TOO_MANY_SEGMENTS",
            Self::DEVICE_SAMPLING => "DEVICE_SAMPLING",
            Self::NO_SAMPLES_AVAILABLE => "NO_SAMPLES_AVAILABLE",
            Self::SEGMENT_OUT_OF_RANGE => "SEGMENT_OUT_OF_RANGE",
            Self::BUSY => "BUSY",
            Self::INVALID_SAMPLE_INTERVAL => "INVALID_SAMPLE_INTERVAL",
            Self::INVALID_BUFFER => "INVALID_BUFFER",
            Self::CANCELLED => "CANCELLED",
            Self::INVALID_CALL => "INVALID_CALL",
            Self::INVALID_SAMPLERATIO => "INVALID_SAMPLERATIO",
            Self::INVALID_STATE => "INVALID_STATE",
            Self::INVALID_COUPLING => "INVALID_COUPLING",
            Self::BUFFERS_NOT_SET => "BUFFERS_NOT_SET",
            Self::RATIO_MODE_NOT_SUPPORTED => "RATIO_MODE_NOT_SUPPORTED",
            Self::INTERFACE_NOT_CONNECTED => "INTERFACE_NOT_CONNECTED",
            Self::FPGA_FAIL => "FPGA_FAIL",
            Self::INVALID_ANALOGUE_OFFSET => "INVALID_ANALOGUE_OFFSET",
            Self::NOT_USED_IN_THIS_CAPTURE_MODE => "NOT_USED_IN_THIS_CAPTURE_MODE",
            Self::COUPLING_NOT_SUPPORTED => "COUPLING_NOT_SUPPORTED",
            Self::BANDWIDTH_NOT_SUPPORTED => "BANDWIDTH_NOT_SUPPORTED",
            Self::NOT_SUPPORTED_BY_THIS_DEVICE => "NOT_SUPPORTED_BY_THIS_DEVICE",
            Self::INVALID_DEVICE_RESOLUTION => "INVALID_DEVICE_RESOLUTION",
            Self::INVALID_NUMBER_CHANNELS_FOR_RESOLUTION => {
                "INVALID_NUMBER_CHANNELS_FOR_RESOLUTION"
            }
            Self::TIMEOUT => "TIMEOUT",
            Self::DEVICE_NOT_FUNCTIONING => "DEVICE_NOT_FUNCTIONING",
            Self::INTERNAL_ERROR => "INTERNAL_ERROR",
            Self::RESOLUTION_NOT_SUPPORTED_BY_VARIANT => "RESOLUTION_NOT_SUPPORTED_BY_VARIANT",
            Self::WAITING_FOR_DATA_BUFFERS => "WAITING_FOR_DATA_BUFFERS",
            Self::HARDWARE_CAPTURE_TIMEOUT => "HARDWARE_CAPTURE_TIMEOUT",
            Self::HARDWARE_READY_TIMEOUT => "HARDWARE_READY_TIMEOUT",
            Self::HARDWARE_CAPTURING_CALL_STOP => "HARDWARE_CAPTURING_CALL_STOP",
            Self::TOO_FEW_REQUESTED_STREAMING_SAMPLES => "TOO_FEW_REQUESTED_STREAMING_SAMPLES",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for PicoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} (0x{:08X})", self.0),
            None => write!(f, "unknown status 0x{:08X}", self.0),
        }
    }
}

/// Closed classification of a native status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Ok,
    /// Device busy or not ready yet. Only meaningful inside a polling loop.
    Retryable,
    InvalidArgument,
    DeviceNotResponding,
    HardwareFault,
    NotSupported,
}

/// Kind of a [`ScopeError`], as seen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    DeviceNotResponding,
    HardwareFault,
    NotSupported,
    StateViolation,
    /// Streaming samples lost to circular-buffer wraparound. Surfaces as a
    /// warning on a successful retrieval; see [`crate::waveform::OverflowLoss`].
    OverflowLoss,
    /// Transient. Absorbed by polling loops, never returned to the caller.
    Retryable,
}

/// Where an error happened: enough to diagnose it without re-deriving state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpContext {
    pub operation: &'static str,
    pub handle: Option<RawHandle>,
    pub channel: Option<Channel>,
}

impl OpContext {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            handle: None,
            channel: None,
        }
    }

    pub fn on(operation: &'static str, handle: RawHandle) -> Self {
        Self {
            operation,
            handle: Some(handle),
            channel: None,
        }
    }

    #[must_use]
    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.channel = Some(channel);
        self
    }
}

impl fmt::Display for OpContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.operation)?;
        match (self.handle, self.channel) {
            (Some(h), Some(c)) => write!(f, " (handle {h}, channel {c})"),
            (Some(h), None) => write!(f, " (handle {h})"),
            (None, Some(c)) => write!(f, " (channel {c})"),
            (None, None) => Ok(()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScopeError {
    #[error("Invalid argument in {context}: {reason}")]
    InvalidArgument { context: OpContext, reason: String },

    #[error("Invalid capture configuration: {0}")]
    InvalidConfig(#[from] CaptureConfigError),

    #[error("Device not responding during {context}: {reason}")]
    DeviceNotResponding { context: OpContext, reason: String },

    #[error("Hardware fault during {context}: {status}")]
    HardwareFault { context: OpContext, status: PicoStatus },

    #[error("Not supported: {context} returned {status}")]
    NotSupported { context: OpContext, status: PicoStatus },

    #[error("State violation in {context}: {reason}")]
    StateViolation { context: OpContext, reason: String },

    #[error("Capture aborted, {discarded_samples} unfetched samples lost: {cause}")]
    SessionAborted {
        cause: Box<ScopeError>,
        discarded_samples: u64,
    },

    #[error("{original}; cleanup also failed: {cleanup}")]
    CleanupFailed {
        original: Box<ScopeError>,
        cleanup: Box<ScopeError>,
    },
}

impl ScopeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. } | Self::InvalidConfig(_) => ErrorKind::InvalidArgument,
            Self::DeviceNotResponding { .. } => ErrorKind::DeviceNotResponding,
            Self::HardwareFault { .. } => ErrorKind::HardwareFault,
            Self::NotSupported { .. } => ErrorKind::NotSupported,
            Self::StateViolation { .. } => ErrorKind::StateViolation,
            Self::SessionAborted { cause, .. } => cause.kind(),
            Self::CleanupFailed { original, .. } => original.kind(),
        }
    }

    pub(crate) fn state(context: OpContext, reason: impl Into<String>) -> Self {
        Self::StateViolation {
            context,
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid(context: OpContext, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            context,
            reason: reason.into(),
        }
    }

    /// Attach the failure of a best-effort cleanup without masking `self`.
    #[must_use]
    pub(crate) fn with_cleanup(self, cleanup: Result<()>) -> Self {
        match cleanup {
            Ok(()) => self,
            Err(cleanup) => Self::CleanupFailed {
                original: Box::new(self),
                cleanup: Box::new(cleanup),
            },
        }
    }

    fn from_status(status: PicoStatus, kind: StatusKind, context: OpContext) -> Self {
        match kind {
            StatusKind::InvalidArgument => Self::InvalidArgument {
                context,
                reason: status.to_string(),
            },
            StatusKind::DeviceNotResponding => Self::DeviceNotResponding {
                context,
                reason: status.to_string(),
            },
            // Retryable outside a polling loop: the device stayed busy for a
            // call that has no loop to absorb it.
            StatusKind::Retryable => Self::DeviceNotResponding {
                context,
                reason: format!("device busy: {status}"),
            },
            StatusKind::NotSupported => Self::NotSupported { context, status },
            StatusKind::HardwareFault | StatusKind::Ok => Self::HardwareFault { context, status },
        }
    }
}

pub type Result<T> = std::result::Result<T, ScopeError>;

/// Check the status of a one-shot native call.
pub fn check(status: PicoStatus, context: impl FnOnce() -> OpContext) -> Result<()> {
    match status.kind() {
        StatusKind::Ok => Ok(()),
        kind => Err(ScopeError::from_status(status, kind, context())),
    }
}

/// Check the status of a readiness query inside a polling loop.
///
/// `Retryable` maps to `Poll::Pending`; everything else is terminal.
pub fn check_poll(status: PicoStatus, context: impl FnOnce() -> OpContext) -> Result<Poll<()>> {
    match status.kind() {
        StatusKind::Ok => Ok(Poll::Ready(())),
        StatusKind::Retryable => Ok(Poll::Pending),
        kind => Err(ScopeError::from_status(status, kind, context())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(PicoStatus::OK.kind(), StatusKind::Ok);
        assert_eq!(PicoStatus::BUSY.kind(), StatusKind::Retryable);
        assert_eq!(PicoStatus::INVALID_VOLTAGE_RANGE.kind(), StatusKind::InvalidArgument);
        assert_eq!(PicoStatus::NOT_FOUND.kind(), StatusKind::DeviceNotResponding);
        assert_eq!(PicoStatus::FPGA_FAIL.kind(), StatusKind::HardwareFault);
        assert_eq!(PicoStatus::ETS_NOT_SUPPORTED.kind(), StatusKind::NotSupported);
        assert_eq!(PicoStatus(0xDEAD_BEEF).kind(), StatusKind::HardwareFault);
    }

    #[test]
    fn test_check_poll_absorbs_retryable() {
        let ctx = || OpContext::on("is_ready", 1);
        assert_eq!(check_poll(PicoStatus::BUSY, ctx).ok(), Some(Poll::Pending));
        assert_eq!(check_poll(PicoStatus::OK, ctx).ok(), Some(Poll::Ready(())));
        let err = check_poll(PicoStatus::NOT_RESPONDING, ctx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceNotResponding);
    }

    #[test]
    fn test_check_retryable_outside_loop_is_terminal() {
        let err = check(PicoStatus::BUSY, || OpContext::on("set_channel_on", 1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceNotResponding);
    }

    #[test]
    fn test_error_context_display() {
        let err = check(PicoStatus::INVALID_CHANNEL, || {
            OpContext::on("set_channel_on", 7).with_channel(Channel::C)
        })
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("set_channel_on (handle 7, channel C)"), "{msg}");
        assert!(msg.contains("INVALID_CHANNEL"), "{msg}");
    }

    #[test]
    fn test_cleanup_keeps_original_first() {
        let original = ScopeError::DeviceNotResponding {
            context: OpContext::new("wait_ready"),
            reason: "timeout".into(),
        };
        let cleanup = Err(ScopeError::HardwareFault {
            context: OpContext::new("stop"),
            status: PicoStatus::INTERNAL_ERROR,
        });
        let err = original.with_cleanup(cleanup);
        assert_eq!(err.kind(), ErrorKind::DeviceNotResponding);
        let msg = err.to_string();
        assert!(msg.find("timeout").unwrap() < msg.find("INTERNAL_ERROR").unwrap());
    }

    #[test]
    fn test_unknown_status_display() {
        assert_eq!(PicoStatus(0x1234_5678).to_string(), "unknown status 0x12345678");
        assert_eq!(PicoStatus::BUSY.to_string(), "BUSY (0x00000027)");
    }
}
