//! `cubeflash`: flash and poke cube controller nodes over the control bus.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use cubebus_master::bus::command::{BlGetInfo, DetectOpenLeds, GetStatus, GetVersion, InfoKind};
use cubebus_master::bus::{Address, Bus, BusHandle};
use cubebus_master::flasher::{BinImageLoader, Flasher};
use cubebus_master::iodev::{SerialIoDevice, SimBus};
use cubebus_master::tracing::init_journald_or_stdout;

const DEFAULT_BAUD: u32 = 250_000;

/// Firmware flashing and diagnostics for LED-cube controller nodes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Serial port of the RS-485 adapter (default: $CUBEBUS_PORT)
    #[arg(short, long)]
    port: Option<String>,

    /// Baud rate (default: $CUBEBUS_BAUD or 250000)
    #[arg(short, long)]
    baud: Option<u32>,

    /// Drive a simulated bus instead of real hardware
    #[arg(long)]
    dummy: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Flash a raw firmware image onto every node on the bus
    Flash {
        /// Firmware image file
        image: PathBuf,
    },
    /// Check whether a node responds
    Ping {
        /// Node address (0-31)
        node: u8,
    },
    /// Print a node's firmware version
    Version {
        /// Node address (0-31)
        node: u8,
    },
    /// Run the open-circuit LED detection on a node
    Leds {
        /// Node address (0-31)
        node: u8,
    },
    /// Query flash geometry from a node sitting in its bootloader
    Info {
        /// Node address (0-31)
        node: u8,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_journald_or_stdout();
    let args = Args::parse();
    let bus = connect(&args)?;

    match args.command {
        Command::Flash { image } => flash(bus, image).await,
        Command::Ping { node } => ping(bus, node_addr(node)?).await,
        Command::Version { node } => version(bus, node_addr(node)?).await,
        Command::Leds { node } => leds(bus, node_addr(node)?).await,
        Command::Info { node } => info(bus, node_addr(node)?).await,
    }
}

fn connect(args: &Args) -> Result<BusHandle> {
    if args.dummy {
        return Ok(Bus::spawn(SimBus::demo()));
    }
    let port = args
        .port
        .clone()
        .or_else(|| env::var("CUBEBUS_PORT").ok())
        .context("no serial port given; use --port, CUBEBUS_PORT, or --dummy")?;
    let baud = args
        .baud
        .or_else(|| env::var("CUBEBUS_BAUD").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(DEFAULT_BAUD);
    let device =
        SerialIoDevice::open(&port, baud).with_context(|| format!("failed to open {port}"))?;
    Ok(Bus::spawn(device))
}

fn node_addr(raw: u8) -> Result<Address> {
    Ok(Address::new(raw)?)
}

async fn flash(bus: BusHandle, image: PathBuf) -> Result<()> {
    let mut flasher = Flasher::new(bus, Arc::new(BinImageLoader));
    let report = flasher.flash_file(&image).await?;

    for node in &report.flashed {
        println!("node {node}: flashed");
    }
    for (node, reason) in &report.failed {
        println!("node {node}: {reason}");
    }
    println!(
        "{} flashed, {} failed",
        report.flashed.len(),
        report.failed.len()
    );
    if report.flashed.is_empty() {
        bail!("no node was flashed");
    }
    Ok(())
}

async fn ping(bus: BusHandle, node: Address) -> Result<()> {
    match bus.send::<GetStatus>(node, ()).await {
        Ok(status) => {
            println!("node {node}: alive, status 0x{status:08x}");
            Ok(())
        }
        Err(err) => bail!("node {node}: {err}"),
    }
}

async fn version(bus: BusHandle, node: Address) -> Result<()> {
    let version = bus
        .send::<GetVersion>(node, ())
        .await
        .map_err(|err| anyhow::anyhow!("node {node}: {err}"))?;
    println!("node {node}: firmware {}.{}", version >> 16, version & 0xFFFF);
    Ok(())
}

async fn leds(bus: BusHandle, node: Address) -> Result<()> {
    let mask = bus
        .send::<DetectOpenLeds>(node, ())
        .await
        .map_err(|err| anyhow::anyhow!("node {node}: {err}"))?;
    if mask == 0 {
        println!("node {node}: no open LED circuits");
    } else {
        println!("node {node}: open LED circuits 0b{mask:032b}");
    }
    Ok(())
}

async fn info(bus: BusHandle, node: Address) -> Result<()> {
    let mut values = [0u32; 5];
    for (slot, kind) in values.iter_mut().zip(InfoKind::ALL) {
        *slot = bus
            .send::<BlGetInfo>(node, kind)
            .await
            .map_err(|err| anyhow::anyhow!("node {node}: {err}"))?;
    }
    println!(
        "node {node}: flash 0x{:08x}..0x{:08x}, word {} B, row {} B, page {} B",
        values[0], values[1], values[2], values[3], values[4]
    );
    Ok(())
}
