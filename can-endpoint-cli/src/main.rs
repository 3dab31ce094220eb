//! CAN Bus Endpoint CLI Application
//!
//! Command-line front end for the can-endpoint library. It stands up one
//! simulated node on a SocketCAN interface:
//! - Periodic transmission of the message bundle from a values file
//! - One-shot or payload-swapping value modifications
//! - Receive filtering by target node, with last-seen recording
//! - Value persistence across runs

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use can_endpoint::{BusConfig, ManagerConfig, MessageManager, SignalValues};

mod config;

/// CAN Endpoint - Simulate a transmitting CAN node from DBC definitions
#[derive(Parser, Debug)]
#[command(name = "can-endpoint-cli")]
#[command(about = "Periodic CAN transmission endpoint driven by DBC signal definitions", long_about = None)]
#[command(version)]
struct Args {
    /// Path to the DBC signal database
    #[arg(long, value_name = "FILE")]
    dbc: Option<PathBuf>,

    /// Path to the initial-values JSON file
    #[arg(long, value_name = "FILE")]
    initial_values: Option<PathBuf>,

    /// Persist last-modified values to this file on shutdown
    #[arg(long, value_name = "FILE")]
    save_values: Option<PathBuf>,

    /// SocketCAN interface to open
    #[arg(short, long, value_name = "IFACE", default_value = "vcan0")]
    channel: String,

    /// Nominal bitrate in bit/s (informational on SocketCAN)
    #[arg(long, value_name = "BPS", default_value_t = 500_000)]
    bitrate: u32,

    /// Receive only messages sent by this node (can be repeated)
    #[arg(short, long, value_name = "NODE")]
    target: Vec<String>,

    /// Transmission period for messages without a declared cycle time
    #[arg(long, value_name = "MS", default_value_t = 500)]
    period_ms: u64,

    /// Record the most recent received frame per id
    #[arg(long)]
    record: bool,

    /// Log every received frame at debug level
    #[arg(long)]
    log_frames: bool,

    /// Stop (and persist values) after this many seconds
    #[arg(short, long, value_name = "SECS")]
    duration_secs: Option<u64>,

    /// Apply a value change after startup, e.g. 0x101:SigA=5,SigRaw=100
    /// (can be repeated)
    #[arg(short, long, value_name = "SPEC")]
    modify: Vec<String>,

    /// Send modifications as one-shot events instead of payload swaps
    #[arg(long)]
    event: bool,

    /// Path to configuration file (endpoint.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbosity level (can be repeated: -v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(args.verbose, args.quiet);

    log::info!("CAN Endpoint CLI v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using endpoint library v{}", can_endpoint::VERSION);

    if args.config.is_none() && args.dbc.is_none() {
        // No arguments - show help
        println!("CAN Endpoint - No input specified");
        println!("\nQuick Start:");
        println!("  can-endpoint-cli --dbc powertrain.dbc --initial-values values.json");
        println!("  can-endpoint-cli --config endpoint.toml");
        println!("\nUse --help for more options");
        return Ok(());
    }

    let manager_config = match &args.config {
        Some(config_path) => {
            log::info!("Loading configuration from {:?}", config_path);
            config::load_config(config_path)?.into_manager_config()
        }
        None => manager_config_from_args(&args)?,
    };

    run(manager_config, &args)
}

/// Build the library configuration from command-line flags alone.
fn manager_config_from_args(args: &Args) -> Result<ManagerConfig> {
    let dbc = match &args.dbc {
        Some(path) => path.clone(),
        None => bail!("--dbc is required (or use --config)"),
    };
    let initial_values = match &args.initial_values {
        Some(path) => path.clone(),
        None => bail!("--initial-values is required (or use --config)"),
    };

    let mut config = ManagerConfig::new(dbc, initial_values)
        .with_bus(BusConfig::new(args.channel.as_str()).with_bitrate(args.bitrate))
        .with_default_period(Duration::from_millis(args.period_ms))
        .with_recording(args.record)
        .with_frame_logging(args.log_frames);

    for name in &args.target {
        config = config.add_target_name(name.as_str());
    }
    if let Some(path) = &args.save_values {
        config = config.with_save_path(path);
    }

    Ok(config)
}

/// Bring the endpoint up, apply requested modifications and run it.
fn run(manager_config: ManagerConfig, args: &Args) -> Result<()> {
    let record = manager_config.record_last_frames;
    let manager = MessageManager::open(manager_config)
        .context("failed to bring up the endpoint")?;

    manager.start();

    for spec in &args.modify {
        let (frame_id, values) = parse_modify_spec(spec)
            .with_context(|| format!("invalid --modify spec '{}'", spec))?;
        if let Err(err) = manager.modify(&frame_id, &values, args.event) {
            log::error!("Modify {} failed: {}", frame_id, err);
        }
    }

    match args.duration_secs {
        Some(secs) => {
            log::info!("Running for {} second(s)", secs);
            std::thread::sleep(Duration::from_secs(secs));
        }
        None => {
            log::info!("Running until interrupted; values persist only on timed runs");
            loop {
                std::thread::sleep(Duration::from_secs(3600));
            }
        }
    }

    manager.stop().context("shutdown persistence failed")?;

    if record {
        print_receive_summary(&manager)?;
    }

    Ok(())
}

/// Print the last-seen frames as a JSON summary, decoded where possible.
fn print_receive_summary(manager: &MessageManager) -> Result<()> {
    let seen = manager.last_seen()?;
    log::info!("Observed {} distinct frame id(s)", seen.len());

    let mut summary = serde_json::Map::new();
    for (id, received) in &seen {
        let mut entry = serde_json::Map::new();
        entry.insert(
            "timestamp".to_string(),
            serde_json::Value::String(received.timestamp.to_rfc3339()),
        );
        if let Ok(values) = manager.decode_frame(&received.frame) {
            entry.insert("signals".to_string(), serde_json::to_value(values)?);
        }
        summary.insert(format!("0x{:x}", id), serde_json::Value::Object(entry));
    }

    println!("{}", serde_json::to_string_pretty(&serde_json::Value::Object(summary))?);
    Ok(())
}

/// Parse `0x101:SigA=5,SigRaw=100` into a frame id and a value map.
fn parse_modify_spec(spec: &str) -> Result<(String, SignalValues)> {
    let (frame_id, assignments) = spec
        .split_once(':')
        .context("expected '<frame id>:<signal>=<value>[,...]'")?;

    let mut values = SignalValues::new();
    for assignment in assignments.split(',') {
        let (name, value) = assignment
            .split_once('=')
            .with_context(|| format!("expected '<signal>=<value>' in '{}'", assignment))?;
        let value: f64 = value
            .trim()
            .parse()
            .with_context(|| format!("'{}' is not a number", value))?;
        values.insert(name.trim().to_string(), value);
    }

    Ok((frame_id.trim().to_string(), values))
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
