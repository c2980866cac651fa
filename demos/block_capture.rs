// Triggered block capture example
//
// Configures two channels and a rising-edge trigger, captures a block and
// prints it as a DataFrame. Optionally runs the capture on a worker thread.

use clap::Parser;
use picoscope_rs::sim::{SimConfig, SimulatedSdk};
use picoscope_rs::{
    BlockSettings, CaptureMode, Channel, ChannelConfig, Coupling, LoopExit, PicoScope,
    PollSchedule, SimpleTrigger, VoltageRange, WaveformResult,
};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "block_capture")]
#[command(version = "1.0")]
#[command(about = "Capture one triggered block from a PicoScope")]
struct Args {
    /// Samples per channel
    #[arg(short = 'n', long, default_value_t = 10_000)]
    samples: u64,

    /// Requested sample interval in microseconds
    #[arg(short, long, default_value_t = 1.0)]
    interval_us: f64,

    /// Share of the block captured before the trigger, in percent
    #[arg(short, long, default_value_t = 10)]
    pre_trigger: u64,

    /// Trigger threshold on channel A in volts
    #[arg(short, long, default_value_t = 0.5)]
    level: f64,

    /// Run the capture on a worker thread
    #[arg(short, long)]
    background: bool,

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

    println!("PicoScope Block Capture Example");
    println!("===============================\n");

    let sdk = Arc::new(SimulatedSdk::new(SimConfig::default().ready_after(20)));
    let mut scope = PicoScope::open(sdk, None)?;
    println!("Connected to {}", scope.serial());

    scope.configure_channel(ChannelConfig::new(Channel::A).range(VoltageRange::V2))?;
    scope.configure_channel(
        ChannelConfig::new(Channel::B)
            .range(VoltageRange::Mv500)
            .coupling(Coupling::Ac),
    )?;
    let actual = scope.configure_timebase(args.interval_us * 1e-6)?;
    println!(
        "Requested {:e} s, device samples every {actual:e} s",
        args.interval_us * 1e-6
    );

    scope.configure_trigger(
        SimpleTrigger::on(Channel::A)
            .auto_trigger(Duration::from_millis(100))
            .rising(args.level),
    )?;

    let samples = args.samples as usize;
    scope.allocate_and_bind(Channel::A, 0, samples, CaptureMode::Block)?;
    scope.allocate_and_bind(Channel::B, 0, samples, CaptureMode::Block)?;

    let settings =
        BlockSettings::new(args.samples).with_pre_trigger(args.samples * args.pre_trigger.min(100) / 100);
    let schedule = PollSchedule::every(Duration::from_millis(1)).with_timeout(Duration::from_secs(5));

    let (mut scope, exit) = if args.background {
        println!("Capturing on a worker thread...");
        let job = scope
            .run_block_in_background(settings, schedule)
            .map_err(|(_, e)| e)?;
        job.wait()
    } else {
        println!("Capturing...");
        let exit = scope.capture_block(settings, &schedule);
        (scope, exit)
    };

    match exit? {
        LoopExit::Completed(result) => print_result(&result)?,
        LoopExit::Cancelled => println!("Capture cancelled"),
        LoopExit::TimedOut => println!("Device did not become ready in time"),
    }

    scope.close()?;
    Ok(())
}

fn print_result(result: &WaveformResult) -> Result<(), Box<dyn std::error::Error>> {
    println!("\nCaptured {} samples per channel", result.len());
    println!("Sample interval: {:e} s", result.sample_interval());
    if let Some(trigger) = result.trigger() {
        if trigger.triggered {
            println!("Triggered at sample {}", trigger.trigger_index);
        }
    }
    for channel in result.channels() {
        let (min, max) = channel
            .volts
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
        println!(
            "  Channel {}: {min:.3} V to {max:.3} V{}",
            channel.channel,
            if channel.overflow { " (over range)" } else { "" }
        );
    }

    let df = result.to_dataframe()?;
    println!("\n{}", df.head(Some(5)));
    Ok(())
}
