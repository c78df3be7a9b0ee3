// src/bin/sniff.rs

use anyhow::{Context, Result};
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use medtronic_lib::RadioOps;
use medtronic_lib::companion::CompanionPacket;
use medtronic_lib::config::parse_frequency;
use medtronic_lib::hw::linux::open_spidev;
use medtronic_lib::packet;
use medtronic_lib::radio::{AnyRadio, Chip, DEFAULT_FREQUENCY};
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Print every frame heard on the pump channel until Ctrl-C.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long, default_value = "/dev/spidev0.0")]
    spi: String,
    #[arg(long, default_value = "cc1101")]
    chip: Chip,
    #[arg(short, long, value_parser = parse_frequency, default_value_t = DEFAULT_FREQUENCY)]
    frequency: u32,
    /// Also print frames that fail to decode.
    #[arg(long)]
    raw: bool,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let filter = EnvFilter::builder()
        .with_default_directive(args.verbose.tracing_level_filter().into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let spi = open_spidev(&args.spi).with_context(|| format!("Failed to open {}", args.spi))?;
    let mut radio = AnyRadio::open_polled(args.chip, spi, args.frequency)
        .await
        .with_context(|| format!("No {} answered on {}", args.chip, args.spi))?;
    info!("Listening on {} Hz, press Ctrl-C to stop", radio.frequency()?);

    let mut frames = 0u64;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            received = radio.receive(Duration::from_secs(1)) => {
                let (bytes, rssi) = received?;
                if bytes.is_empty() {
                    continue;
                }
                match packet::decode(&bytes) {
                    Ok(frame) => {
                        frames += 1;
                        match CompanionPacket::parse(&frame) {
                            Ok(parsed) => println!("{rssi:>4} dBm  {}  {:?}", hex::encode(&frame), parsed),
                            Err(e) => println!("{rssi:>4} dBm  {}  ({e})", hex::encode(&frame)),
                        }
                    }
                    Err(e) if args.raw => println!("{rssi:>4} dBm  raw {}  ({e})", hex::encode(&bytes)),
                    Err(e) => debug!("Dropped {} bytes: {}", bytes.len(), e),
                }
            }
        }
    }

    let stats = radio.statistics();
    info!(frames, ?stats, "Stopped");
    if let Err(e) = radio.close() {
        warn!("Failed to idle the radio: {}", e);
    }
    Ok(())
}
