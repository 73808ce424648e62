use std::process::ExitCode;

use clap::Parser;
use log::error;

use heartrate_monitor::{init_logging, run, RunOptions};

/// Connect to a BLE heart rate belt and stream its measurements.
#[derive(Debug, Parser)]
#[command(name = "heartrate-monitor", version)]
struct Cli {
    /// Advertised name of the peripheral to connect to (overrides the
    /// configured name).
    #[arg(short, long)]
    device: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match run(RunOptions {
        device_name: cli.device,
    })
    .await
    {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        }
    }
}
