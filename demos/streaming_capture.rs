// Continuous streaming example
//
// Streams one channel into a small circular buffer on a worker thread and
// reports each window as it arrives. A second thread stops the run after the
// requested time, the way a Ctrl+C handler would.

use clap::Parser;
use picoscope_rs::sim::{SimConfig, SimulatedSdk};
use picoscope_rs::{
    CaptureMode, Channel, ChannelConfig, Downsampling, PicoScope, SampleCountReached,
    StreamingSettings,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "streaming_capture")]
#[command(version = "1.0")]
#[command(about = "Stream samples from a PicoScope until stopped")]
struct Args {
    /// Run time in milliseconds before the stop request
    #[arg(short, long, default_value_t = 500)]
    time_frame: u64,

    /// Stop on its own after this many samples
    #[arg(short, long)]
    max_samples: Option<u64>,

    /// Circular buffer size per channel, in samples
    #[arg(short, long, default_value_t = 50_000)]
    window: usize,

    /// Poll cadence in milliseconds
    #[arg(short, long, default_value_t = 5)]
    cadence: u64,

    /// Keep the average of every N samples
    #[arg(short, long, default_value_t = 1)]
    average: u64,

    /// Enable verbose logging
    #[arg(short, long, help = "Show debug information and detailed logs")]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    println!("PicoScope Streaming Example");
    println!("===========================\n");

    let sdk = Arc::new(SimulatedSdk::new(SimConfig::default().samples_per_poll(2_000)));
    let mut scope = PicoScope::open(sdk, None)?;
    scope.configure_channel(ChannelConfig::new(Channel::A))?;
    scope.configure_timebase(1e-6)?;
    scope.allocate_and_bind(Channel::A, 0, args.window, CaptureMode::Streaming)?;

    let mut settings = StreamingSettings::new();
    if args.average > 1 {
        settings = settings.with_downsampling(Downsampling::average(args.average));
    }
    if let Some(max) = args.max_samples {
        settings = settings.stop_when(SampleCountReached(max));
    }

    let job = scope
        .stream_in_background(settings, Duration::from_millis(args.cadence))
        .map_err(|(_, e)| e)?;

    let stop = job.stop_handle();
    let time_frame = Duration::from_millis(args.time_frame);
    std::thread::spawn(move || {
        std::thread::sleep(time_frame);
        stop.request_stop();
    });

    let start = Instant::now();
    let mut received = 0u64;
    let mut lost = 0u64;
    for window in job.windows() {
        received += window.len() as u64;
        lost += window.warnings().iter().map(|w| w.samples).sum::<u64>();
        let volts = window
            .channel(Channel::A)
            .and_then(|c| c.volts.last().copied())
            .unwrap_or_default();
        println!(
            "[{:>6.1} ms] samples {}..{} | last {volts:+.3} V{}",
            start.elapsed().as_secs_f64() * 1e3,
            window.first_sample_index(),
            window.first_sample_index() + window.len() as u64,
            if window.has_loss() { " | LOSS" } else { "" }
        );
        if let Some(total) = window.total_samples() {
            println!("\nDevice produced {total} samples in total");
        }
    }

    let outcome = job.finish();
    outcome.result?;
    println!("Received {received} samples, lost {lost}");
    println!(
        "Effective rate: {:.0} samples/s",
        received as f64 / start.elapsed().as_secs_f64()
    );

    let mut scope = outcome.scope;
    scope.close()?;
    Ok(())
}
