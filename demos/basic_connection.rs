// Device discovery and connection example
//
// Lists the attached units, opens one and prints what it reports about itself.
// Runs against the simulated instrument so it works without hardware.

use clap::Parser;
use picoscope_rs::sim::{SimConfig, SimulatedSdk};
use picoscope_rs::{
    Channel, ChannelConfig, Coupling, DeviceRegistry, Resolution, ScopeConnector, UnitInfo,
    VoltageRange,
};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "basic_connection")]
#[command(version = "1.0")]
#[command(about = "Discover and open PicoScope units")]
struct Args {
    /// Serial number to open, the first unit if omitted
    #[arg(short, long)]
    serial: Option<String>,

    /// ADC resolution in bits
    #[arg(short, long, default_value = "8", value_parser = ["8", "10", "12"])]
    bits: String,

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

    let resolution = match args.bits.as_str() {
        "10" => Resolution::Bits10,
        "12" => Resolution::Bits12,
        _ => Resolution::Bits8,
    };

    println!("PicoScope Device Discovery Example");
    println!("==================================\n");

    let sdk = Arc::new(SimulatedSdk::new(
        SimConfig::default().serials(&["SIM0001", "SIM0002"]),
    ));

    println!("1. Discovering attached units...");
    let devices = ScopeConnector::get_available_devices(sdk.as_ref())?;
    if devices.is_empty() {
        println!("No units found. Please connect a device and try again.");
        return Ok(());
    }
    println!("Found {} unit(s):", devices.len());
    for (i, serial) in devices.iter().enumerate() {
        println!("  {}. {serial}", i + 1);
    }

    println!("\n2. Opening unit at {} bits...", resolution.bits());
    let mut scope = ScopeConnector::connect(sdk.clone(), args.serial.as_deref(), resolution)?;
    println!("Connected to {}", scope.serial());

    println!("\n3. Unit information:");
    for info in [
        UnitInfo::VariantInfo,
        UnitInfo::BatchAndSerial,
        UnitInfo::FirmwareVersion,
        UnitInfo::DriverVersion,
        UnitInfo::CalibrationDate,
    ] {
        println!("  {info:?}: {}", scope.unit_info(info)?);
    }
    let (min, max) = scope.adc_limits()?;
    println!("  ADC limits: {min}..={max}");
    let (low, high) = scope.analog_offset_limits(VoltageRange::V1, Coupling::Dc)?;
    println!("  Offset range at 1 V DC: {low} V to {high} V");
    scope.configure_channel(ChannelConfig::new(Channel::A))?;
    println!("  Fastest interval with channel A: {:e} s", scope.minimum_interval()?);

    println!("\n4. Checking the link...");
    scope.ping()?;
    println!("Unit responds");
    scope.close()?;

    println!("\n5. Opening every unit at once...");
    let mut registry = DeviceRegistry::new(sdk);
    for serial in &devices {
        registry.open(serial, resolution)?;
    }
    println!("Open: {:?}", registry.serials().collect::<Vec<_>>());
    registry.close_all()?;

    println!("\nConnection test completed successfully!");
    Ok(())
}
