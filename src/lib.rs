//! # PicoScope RS
//!
//! A mid-level acquisition driver for PicoScope-style USB oscilloscopes.
//!
//! The crate sits between a vendor SDK, seen through the [`NativeSdk`] trait,
//! and an application that wants waveforms. It owns the device lifecycle,
//! validates configuration before it reaches the hardware, manages the host
//! buffers the device writes into and drives block and streaming captures
//! through their polling loops.
//!
//! ## Features
//!
//! - **Typed status handling**: every native status code is mapped to a closed
//!   set of error kinds with the operation, handle and channel attached
//! - **Configuration registry**: range, coupling and offset tables checked
//!   locally; the hardware-corrected sample interval is what gets used
//! - **Arena buffers**: allocated, bound and released explicitly, locked while
//!   a capture owns them
//! - **Block and streaming capture**: explicit state machines, overflow loss
//!   reported as a warning on a successful retrieval
//! - **Background workers**: captures run on a worker thread and can be
//!   stopped from any other thread
//! - **DataFrame output**: results convert to `polars` frames with a time axis
//! - **Simulated instrument**: [`sim::SimulatedSdk`] for tests and demos
//!
//! ## Examples
//!
//! ### Block Capture
//!
//! ```rust,no_run
//! use picoscope_rs::sim::{SimConfig, SimulatedSdk};
//! use picoscope_rs::{
//!     BlockSettings, CaptureMode, Channel, ChannelConfig, PicoScope, PollSchedule, VoltageRange,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let sdk = Arc::new(SimulatedSdk::new(SimConfig::default()));
//! let mut scope = PicoScope::open(sdk, None)?;
//!
//! scope.configure_channel(ChannelConfig::new(Channel::A).range(VoltageRange::V2))?;
//! let interval = scope.configure_timebase(1e-6)?;
//! scope.allocate_and_bind(Channel::A, 0, 10_000, CaptureMode::Block)?;
//!
//! let schedule = PollSchedule::every(Duration::from_millis(1));
//! if let Some(result) = scope.capture_block(BlockSettings::new(10_000), &schedule)?.completed() {
//!     println!("{} samples every {interval:e} s", result.len());
//! }
//! scope.close()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Simple Trigger
//!
//! ```rust
//! use picoscope_rs::{Channel, SimpleTrigger};
//! use std::time::Duration;
//!
//! let trigger = SimpleTrigger::on(Channel::A)
//!     .delay(100)
//!     .auto_trigger(Duration::from_millis(50))
//!     .rising(0.5);
//! assert_eq!(trigger.source(), Channel::A);
//! ```
//!
//! ### Streaming in the Background
//!
//! ```rust,no_run
//! use picoscope_rs::sim::{SimConfig, SimulatedSdk};
//! use picoscope_rs::{
//!     CaptureMode, Channel, ChannelConfig, PicoScope, SampleCountReached, StreamingSettings,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let sdk = Arc::new(SimulatedSdk::new(SimConfig::default()));
//! let mut scope = PicoScope::open(sdk, None)?;
//! scope.configure_channel(ChannelConfig::new(Channel::A))?;
//! scope.configure_timebase(1e-6)?;
//! scope.allocate_and_bind(Channel::A, 0, 50_000, CaptureMode::Streaming)?;
//!
//! let settings = StreamingSettings::new().stop_when(SampleCountReached(1_000_000));
//! let job = scope
//!     .stream_in_background(settings, Duration::from_millis(5))
//!     .map_err(|(_, e)| e)?;
//! for window in job.windows() {
//!     if window.has_loss() {
//!         eprintln!("lost samples: {:?}", window.warnings());
//!     }
//! }
//! let outcome = job.finish();
//! outcome.result?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Device Discovery
//!
//! ```rust,no_run
//! use picoscope_rs::sim::{SimConfig, SimulatedSdk};
//! use picoscope_rs::{Resolution, ScopeConnector};
//! use std::sync::Arc;
//!
//! let sdk = Arc::new(SimulatedSdk::new(SimConfig::default().serials(&["GX001", "GX002"])));
//! for serial in ScopeConnector::get_available_devices(sdk.as_ref())? {
//!     println!("Found unit {serial}");
//! }
//! let scope = ScopeConnector::connect(sdk, Some("GX002"), Resolution::Bits12)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod block_capture;
pub mod buffers;
pub mod channel_config;
pub mod device_handle;
pub mod native;
pub mod pico_scope;
pub mod scope_connector;
pub mod session;
pub mod sim;
pub mod status;
pub mod streaming_capture;
pub mod trigger_config;
pub mod waveform;
pub mod worker;

// Re-export the main types for convenience
pub use status::{check, check_poll, ErrorKind, OpContext, PicoStatus, Result, ScopeError, StatusKind};

pub use native::{
    BufferAction, BufferRole, ChannelTarget, Downsampling, DownsamplingMode, NativeSdk,
    NativeTrigger, RawHandle, StreamingLatest, StreamingWindow, TriggerInfo, UnitInfo,
};

pub use channel_config::{
    AcquisitionSnapshot, Bandwidth, CaptureConfigError, Channel, ChannelConfig, ChannelFlags,
    ChannelScaling, ConfigRegistry, Coupling, Resolution, TimebaseConfig, VoltageRange,
};

pub use trigger_config::{SimpleTrigger, SimpleTriggerBuilder, ThresholdDirection};

pub use device_handle::DeviceHandle;

pub use buffers::{BufferAllocator, BufferId, CaptureBuffer, CaptureMode};

pub use block_capture::{BlockCapture, BlockSettings};

pub use streaming_capture::{
    AutoStopCondition, ChannelProgress, DurationElapsed, SampleCountReached, StreamingCapture,
    StreamingPoll, StreamingProgress, StreamingSettings,
};

pub use waveform::{ChannelWaveform, LossCause, OverflowLoss, WaveformResult};

pub use session::{CaptureSession, SessionStatus};

pub use worker::{
    poll_until, BlockCaptureJob, BlockOutcome, LoopExit, PollSchedule, StopHandle, StreamingJob,
    StreamingOutcome,
};

pub use pico_scope::PicoScope;

pub use scope_connector::{DeviceRegistry, ScopeConnector};
