use std::fmt;

use crate::block_capture::BlockCapture;
use crate::buffers::CaptureMode;
use crate::streaming_capture::StreamingCapture;

/// Lifecycle state of a capture session.
///
/// Block: `Idle → Armed → Polling → Ready → Idle`, or `Errored`.
/// Streaming: `Idle → Armed → Running → Stopped | AutoStopped | Errored`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    Idle,
    Armed,
    Polling,
    Ready,
    Running,
    Stopped,
    AutoStopped,
    Errored,
}

impl SessionStatus {
    /// The device owns the bound buffers in these states.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Armed | Self::Polling | Self::Ready | Self::Running)
    }

    /// Finished streaming sessions that may still hold unfetched samples.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::AutoStopped | Self::Errored)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Armed => "armed",
            Self::Polling => "polling",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::AutoStopped => "auto-stopped",
            Self::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// The one capture a device may have at a time.
#[derive(Debug, Default)]
pub enum CaptureSession {
    #[default]
    Idle,
    Block(BlockCapture),
    Streaming(StreamingCapture),
}

impl CaptureSession {
    pub fn status(&self) -> SessionStatus {
        match self {
            Self::Idle => SessionStatus::Idle,
            Self::Block(block) => block.status(),
            Self::Streaming(streaming) => streaming.status(),
        }
    }

    pub fn mode(&self) -> Option<CaptureMode> {
        match self {
            Self::Idle => None,
            Self::Block(_) => Some(CaptureMode::Block),
            Self::Streaming(_) => Some(CaptureMode::Streaming),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status().is_active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_and_terminal_states() {
        for status in [
            SessionStatus::Armed,
            SessionStatus::Polling,
            SessionStatus::Ready,
            SessionStatus::Running,
        ] {
            assert!(status.is_active(), "{status}");
            assert!(!status.is_terminal(), "{status}");
        }
        for status in [
            SessionStatus::Stopped,
            SessionStatus::AutoStopped,
            SessionStatus::Errored,
        ] {
            assert!(!status.is_active(), "{status}");
            assert!(status.is_terminal(), "{status}");
        }
        assert!(!SessionStatus::Idle.is_active());
        assert_eq!(CaptureSession::default().status(), SessionStatus::Idle);
    }
}
