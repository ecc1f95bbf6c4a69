//! Binary entrypoint for the dashlink CLI.
//!
//! Commands:
//! - `ports` - list connectable serial ports and the emulator
//! - `info` - print device identity
//! - `ping [-n <count>]` - measure round-trip latency
//! - `monitor [--rate <hz>] [--json] [--seconds <n>]` - stream telemetry
//! - `get-config [--out <file>]` - download the device configuration
//! - `set-config --file <path> [--save]` - upload a configuration
//! - `restart` - restart the device
//! - `init` - write a starter `dashlink.toml`
//!
//! Every device command accepts `--emulator` to run against the built-in
//! device double instead of real hardware.

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::warn;

use dashlink::config::Config;
use dashlink::link::{ConnectionStats, DeviceEvent, DeviceLink};
use dashlink::telemetry::{format_lap_time, TelemetryFrame};

#[derive(Parser)]
#[command(name = "dashlink")]
#[command(about = "Configuration and telemetry link for racing-dashboard devices")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "dashlink.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Use the built-in emulated dashboard instead of a serial port
    #[arg(long, global = true)]
    emulator: bool,

    /// Serial port path (auto-detect when omitted)
    #[arg(short, long, global = true)]
    port: Option<String>,

    /// Baud rate (overrides the config file)
    #[arg(short, long, global = true)]
    baud: Option<u32>,
}

#[derive(Subcommand)]
enum Commands {
    /// List connectable ports, hardware and emulated
    Ports,
    /// Print device identity and link statistics
    Info,
    /// Measure round-trip latency
    Ping {
        /// Number of pings to send
        #[arg(short = 'n', long, default_value_t = 4)]
        count: u32,
    },
    /// Subscribe to telemetry and stream it to stdout
    Monitor {
        /// Telemetry rate in Hz (overrides the config file)
        #[arg(short, long)]
        rate: Option<u16>,
        /// Emit one JSON object per record instead of text
        #[arg(long)]
        json: bool,
        /// How long to stream before unsubscribing
        #[arg(short, long, default_value_t = 10)]
        seconds: u64,
    },
    /// Download the device configuration
    GetConfig {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        out: Option<String>,
    },
    /// Upload a configuration to the device
    SetConfig {
        /// File holding the configuration payload
        #[arg(short, long)]
        file: String,
        /// Also persist it to flash afterwards
        #[arg(long)]
        save: bool,
    },
    /// Restart the device (no acknowledgement is awaited)
    Restart,
    /// Write a starter configuration file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match Config::load(&cli.config).await {
        Ok(config) => config,
        Err(e) => {
            if !matches!(cli.command, Commands::Init) {
                eprintln!(
                    "note: {} not usable ({}), continuing with defaults",
                    cli.config, e
                );
            }
            Config::default()
        }
    };
    init_logging(&config, cli.verbose);

    match &cli.command {
        Commands::Init => {
            Config::create_default(&cli.config).await?;
            println!("wrote {}", cli.config);
            Ok(())
        }
        Commands::Ports => {
            let ports = DeviceLink::list_all_connections();
            if ports.is_empty() {
                println!("no ports found");
                return Ok(());
            }
            for port in ports {
                let marker = if port.is_dashboard { " [dashboard]" } else { "" };
                println!("{:<20} {}{}", port.port, port.description, marker);
            }
            Ok(())
        }
        Commands::Info => {
            let mut link = connect(&cli, &config).await?;
            match link.device_info() {
                Some(info) => {
                    println!("firmware:  {}", info.firmware_version);
                    println!("serial:    {}", info.serial_number);
                    println!("hardware:  {}", info.hardware_version);
                }
                None => println!("device did not identify itself"),
            }
            print_stats(&link.stats());
            link.disconnect().await;
            Ok(())
        }
        Commands::Ping { count } => {
            let mut link = connect(&cli, &config).await?;
            let mut failures = 0u32;
            for i in 0..*count {
                match link.ping().await {
                    Some(rtt) => println!("reply {}: time={:.2} ms", i + 1, rtt),
                    None => {
                        failures += 1;
                        println!("reply {}: timeout", i + 1);
                    }
                }
            }
            link.disconnect().await;
            if failures == *count && *count > 0 {
                return Err(anyhow!("device never answered"));
            }
            Ok(())
        }
        Commands::Monitor {
            rate,
            json,
            seconds,
        } => {
            let mut link = connect(&cli, &config).await?;
            let rate = rate.unwrap_or(config.telemetry.rate_hz);
            let mut events = link.subscribe();
            if !link.subscribe_telemetry(rate).await {
                link.disconnect().await;
                return Err(anyhow!("telemetry subscription was not acknowledged"));
            }

            let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(*seconds);
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    event = events.recv() => match event {
                        Some(DeviceEvent::Telemetry(t)) => print_telemetry(&t, *json)?,
                        Some(DeviceEvent::Log { level, message }) => {
                            eprintln!("device log [{}] {}", level, message);
                        }
                        Some(DeviceEvent::DeviceError(message)) => warn!("{}", message),
                        Some(DeviceEvent::State(state)) => log::info!("link {}", state),
                        None => break,
                    }
                }
            }

            link.unsubscribe_telemetry().await;
            print_stats(&link.stats());
            link.disconnect().await;
            Ok(())
        }
        Commands::GetConfig { out } => {
            let mut link = connect(&cli, &config).await?;
            let result = link.get_configuration().await;
            link.disconnect().await;
            let data = result.ok_or_else(|| anyhow!("configuration download failed"))?;
            match out {
                Some(path) => {
                    tokio::fs::write(path, &data).await?;
                    println!("wrote {} bytes to {}", data.len(), path);
                }
                None => println!("{}", String::from_utf8_lossy(&data)),
            }
            Ok(())
        }
        Commands::SetConfig { file, save } => {
            let data = tokio::fs::read(file).await?;
            if file.ends_with(".json") && serde_json::from_slice::<serde_json::Value>(&data).is_err()
            {
                warn!("{} is not well-formed JSON, uploading anyway", file);
            }
            let mut link = connect(&cli, &config).await?;
            if !link.set_configuration(&data).await {
                link.disconnect().await;
                return Err(anyhow!("configuration upload failed"));
            }
            println!("uploaded {} bytes", data.len());
            if *save {
                if link.save_to_flash().await {
                    println!("saved to flash");
                } else {
                    link.disconnect().await;
                    return Err(anyhow!("save to flash was not acknowledged"));
                }
            }
            link.disconnect().await;
            Ok(())
        }
        Commands::Restart => {
            let mut link = connect(&cli, &config).await?;
            let sent = link.restart_device().await;
            link.disconnect().await;
            if sent {
                println!("restart requested");
                Ok(())
            } else {
                Err(anyhow!("failed to send restart"))
            }
        }
    }
}

async fn connect(cli: &Cli, config: &Config) -> Result<DeviceLink> {
    let mut link = DeviceLink::new();
    let connected = if cli.emulator {
        link.connect_emulator().await
    } else {
        connect_serial(&mut link, cli, config).await?
    };
    if !connected {
        return Err(anyhow!("connection failed"));
    }
    Ok(link)
}

#[cfg(feature = "serial")]
async fn connect_serial(link: &mut DeviceLink, cli: &Cli, config: &Config) -> Result<bool> {
    let port = cli.port.clone().or_else(|| config.link.port.clone());
    let baud = cli.baud.unwrap_or(config.link.baud_rate);
    Ok(link.connect_serial(port.as_deref(), baud).await)
}

#[cfg(not(feature = "serial"))]
async fn connect_serial(_link: &mut DeviceLink, _cli: &Cli, _config: &Config) -> Result<bool> {
    Err(anyhow!(
        "serial support not compiled in; rerun with --emulator"
    ))
}

fn print_telemetry(t: &TelemetryFrame, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(t)?);
        return Ok(());
    }
    println!(
        "[{:>9.3}s] rpm {:>5}  {:>3} km/h  gear {}  thr {:>3}%  brk {:>3}%  lap {}",
        f64::from(t.timestamp_ms) / 1000.0,
        t.rpm,
        t.speed_kmh,
        t.gear,
        t.throttle_percent,
        t.brake_percent,
        format_lap_time(t.lap_time_ms),
    );
    if t.has_faults() {
        warn!("active faults: {}", t.fault_names().join(", "));
    }
    Ok(())
}

fn print_stats(stats: &ConnectionStats) {
    println!(
        "link: {} pkts / {} B sent, {} pkts / {} B received, {} errors",
        stats.packets_sent,
        stats.bytes_sent,
        stats.packets_received,
        stats.bytes_received,
        stats.errors
    );
}

fn init_logging(config: &Config, verbosity: u8) {
    let level = match verbosity {
        0 => config
            .logging
            .level
            .parse()
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp_millis()
        .init();
}
