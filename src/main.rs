use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use spike_console_runtime::config::DEFAULT_HUB_PORT;

/// Operator console for a small wheeled robot: keyboard teleop,
/// calibration, recording and replay.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Run against the built-in simulator instead of a hub
    #[arg(long)]
    simulate: bool,

    /// Serial port of the robot hub
    #[arg(long, default_value = DEFAULT_HUB_PORT)]
    port: String,

    /// Directory for saved runs
    #[arg(long)]
    runs_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let args = Args::parse();
    if let Err(e) = spike_console_runtime::runtime::run(args.simulate, &args.port, args.runs_dir).await
    {
        eprintln!("Console error: {}", e);
        std::process::exit(1);
    }
}
