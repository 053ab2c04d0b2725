// tools/cbt_cli/main.rs
//
// Command-line front end for a CAN Bus Triple on a serial port.
//
//   cbt_cli --port /dev/ttyACM0 info
//   cbt_cli settings --json
//   cbt_cli send 1 7DF 02010C
//   cbt_cli monitor --bus 1

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use canbus_triple::io::channel::list_ports;
use canbus_triple::{tlog, CanMode, CbtController, IoError, LinkConfig, LinkEvent};

#[derive(Parser)]
#[command(name = "cbt_cli")]
#[command(author, version, about = "CAN Bus Triple command-line tool", long_about = None)]
struct Cli {
    /// Serial device (overrides the config file)
    #[arg(short, long, global = true)]
    port: Option<String>,

    /// Config file (default: <config dir>/canbus-triple/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Command timeout in milliseconds
    #[arg(short, long, global = true)]
    timeout: Option<u64>,

    /// Print every byte exchanged with the device
    #[arg(long, global = true)]
    trace: bool,

    /// Also write the log to a timestamped file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show device name and firmware version
    Info,

    /// Read and decode the EEPROM settings
    Settings {
        /// Print as JSON instead of key/value text
        #[arg(long)]
        json: bool,
    },

    /// Print the raw EEPROM image as hex
    Dump,

    /// Show the CAN mode of a bus
    Mode { bus: u8 },

    /// Change the CAN mode of a bus (configuration, normal, sleep, listen, loopback)
    SetMode { bus: u8, mode: String },

    /// Set the bit rate of a bus (device units, e.g. 500)
    Bitrate { bus: u8, rate: u32 },

    /// Enable or disable forwarding of a bus' traffic
    Log {
        bus: u8,

        /// Disable logging
        #[arg(long)]
        off: bool,

        #[arg(long, value_parser = parse_number, default_value = "0")]
        filter1: u32,

        #[arg(long, value_parser = parse_number, default_value = "0")]
        filter2: u32,

        /// Mask for filter1; enables masked filtering
        #[arg(long, value_parser = parse_number)]
        mask1: Option<u32>,

        #[arg(long, value_parser = parse_number, default_value = "0")]
        mask2: u32,
    },

    /// Transmit a CAN frame: ID and data as hex (e.g. `send 1 7DF 02010C`)
    Send { bus: u8, id: String, data: Option<String> },

    /// Send raw hex bytes and print the first response
    Raw { bytes: String },

    /// Print received CAN frames until Ctrl-C
    Monitor {
        /// Enable logging on this bus first
        #[arg(long)]
        bus: Option<u8>,
    },

    /// List available serial ports
    Ports,
}

fn parse_number(s: &str) -> Result<u32, String> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .map_err(|e| format!("invalid number '{}': {}", s, e))
}

fn parse_hex(s: &str) -> Result<Vec<u8>, IoError> {
    let s: String = s.chars().filter(|c| !c.is_whitespace() && *c != ':').collect();
    let s = s.trim_start_matches("0x");
    // Allow odd-length identifiers such as 7DF
    let padded = if s.len() % 2 == 1 { format!("0{}", s) } else { s.to_string() };
    hex::decode(&padded).map_err(|e| IoError::validation(format!("invalid hex '{}': {}", s, e)))
}

fn load_config(cli: &Cli) -> Result<LinkConfig, IoError> {
    let mut config = match cli.config.as_ref().cloned().or_else(LinkConfig::default_path) {
        Some(path) => LinkConfig::load_or_default(&path)?,
        None => LinkConfig::default(),
    };
    if let Some(port) = &cli.port {
        config.port = port.clone();
    }
    if let Some(timeout) = cli.timeout {
        config.command_timeout_ms = timeout;
    }
    config.trace |= cli.trace;
    Ok(config)
}

async fn run(cli: Cli) -> Result<(), IoError> {
    if let Commands::Ports = cli.command {
        let ports = list_ports().map_err(|e| IoError::connection("serial", e))?;
        if ports.is_empty() {
            println!("No serial ports found");
        }
        for port in ports {
            let product = port.product.unwrap_or_default();
            match (port.vid, port.pid) {
                (Some(vid), Some(pid)) => {
                    println!("{}  {} {:04X}:{:04X} {}", port.port_name, port.port_type, vid, pid, product)
                }
                _ => println!("{}  {}", port.port_name, port.port_type),
            }
        }
        return Ok(());
    }

    let config = load_config(&cli)?;
    let trace = config.trace;
    let ctl = CbtController::serial(config);

    if trace {
        let mut events = ctl.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if let LinkEvent::Trace { direction, text } = event {
                    tlog!("[trace] {:?} {}", direction, text);
                }
            }
        });
    }

    match cli.command {
        Commands::Info => {
            for (key, value) in ctl.system_info().await? {
                println!("{}: {}", key, value);
            }
        }
        Commands::Settings { json } => {
            let settings = ctl.settings().await?;
            if json {
                let text = serde_json::to_string_pretty(&settings)
                    .map_err(|e| IoError::format(format!("Failed to serialize settings: {}", e)))?;
                println!("{}", text);
            } else {
                print!("{}", settings);
            }
        }
        Commands::Dump => {
            let image = ctl.dump_eeprom().await?;
            for (row, chunk) in image.chunks(32).enumerate() {
                println!("{:03X}: {}", row * 32, hex::encode_upper(chunk));
            }
        }
        Commands::Mode { bus } => {
            println!("Bus {}: {}", bus, ctl.can_mode(bus).await?);
        }
        Commands::SetMode { bus, mode } => {
            let mode = CanMode::from_name(&mode);
            ctl.set_can_mode(bus, mode).await?;
            println!("Bus {}: {}", bus, mode);
        }
        Commands::Bitrate { bus, rate } => {
            for (key, value) in ctl.set_bit_rate(bus, rate).await? {
                println!("{}: {}", key, value);
            }
        }
        Commands::Log {
            bus,
            off,
            filter1,
            filter2,
            mask1,
            mask2,
        } => {
            let ok = match (off, mask1) {
                (true, _) => ctl.disable_log(bus).await?,
                (false, Some(mask1)) => ctl.enable_log_with_mask(bus, filter1, mask1, filter2, mask2).await?,
                (false, None) => ctl.enable_log(bus, filter1, filter2).await?,
            };
            println!("{}", if ok { "OK" } else { "ERROR" });
        }
        Commands::Send { bus, id, data } => {
            let id = parse_hex(&id)?;
            let data = match data {
                Some(data) => parse_hex(&data)?,
                None => Vec::new(),
            };
            ctl.send_can_packet(bus, &id, &data).await?;
        }
        Commands::Raw { bytes } => {
            let bytes = parse_hex(&bytes)?;
            println!("{}", ctl.send_command(&bytes).await?);
        }
        Commands::Monitor { bus } => {
            let mut events = ctl.subscribe();
            ctl.connect()?;
            if let Some(bus) = bus {
                if !ctl.enable_log(bus, 0, 0).await? {
                    tlog!("[cbt_cli] Device refused to enable logging on bus {}", bus);
                }
            }

            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(LinkEvent::CanMessage(msg)) => println!(
                            "{} bus {} {} [{}] {}",
                            msg.time(),
                            msg.bus(),
                            msg.hex_id(),
                            msg.data().len(),
                            msg.hex_data()
                        ),
                        Ok(LinkEvent::StatusChanged(false)) => {
                            tlog!("[cbt_cli] Link closed");
                            break;
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tlog!("[cbt_cli] Dropped {} events", n);
                        }
                        Err(_) => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }

            if let Some(bus) = bus {
                let _ = ctl.disable_log(bus).await;
            }
            ctl.disconnect();
        }
        Commands::Ports => {}
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Some(dir) = &cli.log_dir {
        if let Err(e) = canbus_triple::logging::init_file_logging(dir) {
            eprintln!("{}", e);
        }
    }

    let result = run(cli).await;
    canbus_triple::logging::stop_file_logging();

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
