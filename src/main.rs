use anyhow::{Context, Result};
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use medtronic_lib::RadioOps;
use medtronic_lib::config::parse_frequency;
use medtronic_lib::hw::linux::open_spidev;
use medtronic_lib::radio::{AnyRadio, Chip, DEFAULT_FREQUENCY};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Check that a transceiver answers on the SPI bus and dump its registers.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long, default_value = "/dev/spidev0.0")]
    spi: String,
    #[arg(long, default_value = "cc1101")]
    chip: Chip,
    /// Carrier to tune to, in Hz or MHz.
    #[arg(short, long, value_parser = parse_frequency, default_value_t = DEFAULT_FREQUENCY)]
    frequency: u32,
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
        .with(tracing_subscriber::fmt::layer().with_target(false).without_time())
        .init();

    if let Err(e) = run(args).await {
        error!("Probe failed: {:?}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn run(args: Args) -> Result<()> {
    info!("Opening {} on {}...", args.chip, args.spi);
    let spi = open_spidev(&args.spi).with_context(|| format!("Failed to open {}", args.spi))?;
    let mut radio = AnyRadio::open_polled(args.chip, spi, args.frequency)
        .await
        .with_context(|| format!("No {} answered on {}", args.chip, args.spi))?;

    let tuned = radio.frequency()?;
    info!(requested = args.frequency, tuned, "Found {}", radio.chip());

    for (addr, value) in radio.dump_registers()? {
        println!("{addr:#04x}  {value:#04x}  {value:08b}");
    }

    radio.close()?;
    Ok(())
}
