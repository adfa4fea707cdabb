use chrono::{TimeDelta, Utc};
use clap::{ArgAction, Parser, Subcommand};
use color_eyre::eyre::Result;
use embedded_hal::i2c::I2c;
use powersched::config::ScheduleConfig;
use powersched::detect::HardwareArgs;
use powersched::power::{RegisterPowerManager, SysfsPowerManager};
use powersched::*;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, instrument};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Inspect and program RTC power alarms", long_about = None)]
struct Cli {
    /// More output, repeat for more detail
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    #[command(flatten)]
    hardware: HardwareArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show clocks, alarms and the last power-on reason
    Status,
    /// Arm the startup alarm relative to the device clock
    SetStartup {
        /// Seconds from now, negative disarms the alarm
        #[arg(allow_negative_numbers = true)]
        seconds: i64,
    },
    /// Arm the shutdown alarm relative to the device clock
    SetShutdown {
        /// Seconds from now, negative disarms the alarm
        #[arg(allow_negative_numbers = true)]
        seconds: i64,
    },
    /// Acknowledge fired alarms
    ClearFlags,
    /// Copy the system clock into the device clock
    SyncClock,
    /// Evaluate a schedule file against the system clock
    Plan {
        /// Schedule file
        #[arg(short, long, default_value = "schedule.yml")]
        schedule: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RUST_LOG")
                .unwrap_or_else(|_| EnvFilter::new(format!("powersched={level}"))),
        )
        .compact()
        .init();

    color_eyre::install()?;
    debug!("Parsed command line arguments");

    let command = cli.command.unwrap_or(Commands::Status);
    if let Commands::Plan { schedule } = &command {
        plan(schedule);
        return Ok(());
    }

    let Some(kind) = detect_hardware(&cli.hardware) else {
        error!("No supported power management hardware detected");
        std::process::exit(Error::NoHardware.exit_code());
    };
    info!("Using {} hardware", kind);

    let outcome = match kind {
        HardwareKind::RegisterHat => cli
            .hardware
            .open_bus()
            .and_then(|bus| RegisterPowerManager::new(bus, cli.hardware.addr))
            .and_then(|mut device| {
                if matches!(command, Commands::Status) {
                    print_firmware(&mut device)?;
                }
                execute(&mut device, &command)
            }),
        HardwareKind::OnboardRtc => SysfsPowerManager::new(&cli.hardware.rtc_path)
            .and_then(|mut device| execute(&mut device, &command)),
    };

    if let Err(e) = outcome {
        error!("{}", e);
        eprintln!("{e}");
        std::process::exit(e.exit_code());
    }
    Ok(())
}

/// Runs one command against any backend
#[instrument(skip(device, command))]
fn execute<P: PowerManager>(device: &mut P, command: &Commands) -> powersched::Result<()> {
    match command {
        Commands::Status => print_status(device)?,
        Commands::SetStartup { seconds } => {
            let at = relative_to_device(device, *seconds)?;
            device.set_startup(at)?;
            println!("Startup: {}", describe(device.get_startup()?));
        }
        Commands::SetShutdown { seconds } => {
            let at = relative_to_device(device, *seconds)?;
            device.set_shutdown(at)?;
            println!("Shutdown: {}", describe(device.get_shutdown()?));
        }
        Commands::ClearFlags => {
            device.clear_alarm_flags()?;
            println!("Alarm flags cleared");
        }
        Commands::SyncClock => {
            device.set_device_time(Utc::now())?;
            println!("Device time: {}", device.device_time()?);
        }
        Commands::Plan { schedule } => plan(schedule),
    }
    Ok(())
}

/// `None` for negative offsets
fn relative_to_device<P: PowerManager>(
    device: &mut P,
    seconds: i64,
) -> powersched::Result<Option<Timestamp>> {
    if seconds < 0 {
        return Ok(None);
    }
    Ok(Some(device.device_time()? + TimeDelta::seconds(seconds)))
}

fn describe(ts: Option<Timestamp>) -> String {
    ts.map_or_else(|| "disabled".to_string(), |ts| ts.to_string())
}

fn print_firmware<I2C: I2c>(device: &mut RegisterPowerManager<I2C>) -> powersched::Result<()> {
    let (ctrl1, ctrl2) = device.rtc_control()?;
    println!(
        "Firmware:    id {:#04x}, revision {:#04x}",
        device.firmware_id()?,
        device.firmware_revision()?
    );
    println!("RTC control: {:#010b} {:#010b}", ctrl1, ctrl2);
    Ok(())
}

fn print_status<P: PowerManager>(device: &mut P) -> powersched::Result<()> {
    let device_time = device.device_time()?;
    println!("Device time: {}", device_time);
    println!("System time: {}", Utc::now());
    println!(
        "In sync:     {}",
        device.clock_matches_system(power::DEFAULT_CLOCK_TOLERANCE)?
    );
    println!("Reason:      {}", device.power_on_reason()?);
    println!("Startup:     {}", describe(device.get_startup()?));
    println!("Shutdown:    {}", describe(device.get_shutdown()?));
    Ok(())
}

fn plan(path: &Path) {
    let config = ScheduleConfig::load(path);
    let schedule = ScheduleSet::from_config(&config);
    let now = Utc::now();

    println!("Now:         {}", now);
    println!("Force on:    {}", schedule.force_on());
    println!("Active:      {}", schedule.active(now));
    println!("Startup:     {}", describe(schedule.next_startup(now)));
    println!("Shutdown:    {}", describe(schedule.next_shutdown(now)));
    for entry in schedule.entries() {
        println!(
            "  {}: active {}, next start {}, next stop {}",
            entry,
            entry.active(now),
            describe(entry.next_start(now)),
            describe(entry.next_stop(now))
        );
    }
}
