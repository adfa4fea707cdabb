use clap::{ArgAction, Parser};
use color_eyre::eyre::Result;
use powersched::config::ScheduleConfig;
use powersched::detect::HardwareArgs;
use powersched::power::{RegisterPowerManager, SystemHalt, SysfsPowerManager};
use powersched::*;
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, info_span, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Keep RTC power alarms in line with a schedule", long_about = None)]
struct Cli {
    /// More output, repeat for more detail
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Schedule file
    #[arg(short, long, default_value = "schedule.yml")]
    schedule: PathBuf,

    #[command(flatten)]
    hardware: HardwareArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("RUST_LOG").unwrap_or_else(|_| {
            EnvFilter::new(format!("powersched={level},powerschedd={level}"))
        }))
        .compact()
        .init();

    color_eyre::install()?;

    let Some(kind) = detect_hardware(&cli.hardware) else {
        error!("No supported power management hardware detected, terminating");
        std::process::exit(Error::NoHardware.exit_code());
    };
    let config = ScheduleConfig::load(&cli.schedule);

    let outcome = match kind {
        HardwareKind::RegisterHat => {
            match cli
                .hardware
                .open_bus()
                .and_then(|bus| RegisterPowerManager::new(bus, cli.hardware.addr))
            {
                Ok(device) => serve(device, kind, &config).await,
                Err(e) => Err(e),
            }
        }
        HardwareKind::OnboardRtc => match SysfsPowerManager::new(&cli.hardware.rtc_path) {
            Ok(device) => serve(device, kind, &config).await,
            Err(e) => Err(e),
        },
    };

    if let Err(e) = outcome {
        error!("{}", e);
        std::process::exit(e.exit_code());
    }
    info!("Bye");
    Ok(())
}

/// Runs the daemon until a termination signal arrives or the system halts
async fn serve<P: PowerManager>(
    device: P,
    kind: HardwareKind,
    config: &ScheduleConfig,
) -> powersched::Result<()> {
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        match wait_for_termination().await {
            Ok(name) => {
                warn!("Caught {}, terminating", name);
                let _ = stop_tx.send(true);
            }
            Err(e) => {
                error!("Cannot listen for termination signals: {}", e);
                // keep the sender so the daemon is not told to stop
                std::future::pending::<()>().await;
            }
        }
    });

    let span = info_span!("powerschedd", hardware = %kind);
    let mut daemon = Daemon::new(device, SystemHalt, DaemonOptions::default(), span);
    daemon.run(config, stop_rx).await
}

async fn wait_for_termination() -> std::io::Result<&'static str> {
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = terminate.recv() => Ok("SIGTERM"),
        _ = interrupt.recv() => Ok("SIGINT"),
    }
}
