use anyhow::{Context, Result, anyhow};
use chrono::{Local, NaiveDateTime, TimeDelta};
use clap::{Parser, Subcommand, ValueEnum};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use medtronic_lib::companion::{Remote, RemoteButton};
use medtronic_lib::config::{ENV_FREQUENCY, ENV_PUMP_ID, ENV_REMOTE_ID, SessionConfig, parse_frequency};
use medtronic_lib::error::PartialDecode;
use medtronic_lib::hw::linux::{SpidevDevice, open_spidev};
use medtronic_lib::radio::{AnyRadio, Chip};
use medtronic_lib::schedule::Schedule;
use medtronic_lib::session::{Button, Session};
use medtronic_lib::tune::SearchBand;
use medtronic_lib::{Insulin, RadioOps};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

mod logging;

type PumpSession = Session<AnyRadio<SpidevDevice>>;

/// Talk to a Medtronic pump over a CC1101 or RFM69HCW transceiver.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// SPI device the transceiver is wired to.
    #[arg(long, default_value = "/dev/spidev0.0")]
    spi: String,
    /// Transceiver chip (cc1101 or rfm69).
    #[arg(long, default_value = "cc1101")]
    chip: Chip,
    /// Six-digit pump serial; overrides MEDTRONIC_PUMP_ID.
    #[arg(short, long)]
    pump_id: Option<String>,
    /// Carrier frequency in Hz or MHz; overrides MEDTRONIC_FREQUENCY.
    #[arg(short, long)]
    frequency: Option<String>,
    /// Six-digit remote id; overrides MEDTRONIC_REMOTE_ID.
    #[arg(long)]
    remote_id: Option<String>,
    /// Per-attempt reply timeout in milliseconds.
    #[arg(long, default_value_t = 500)]
    timeout_ms: u64,
    /// Attempts per query command.
    #[arg(long, default_value_t = 3)]
    retries: usize,
    /// Skip the wakeup exchange before the command.
    #[arg(long)]
    no_wakeup: bool,
    /// Print results as JSON.
    #[arg(long)]
    json: bool,
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Wake the pump's receiver and do nothing else.
    Wakeup,
    Model,
    /// Serial number as stored in the pump.
    Id,
    Firmware,
    Clock,
    /// Set the pump clock (default: local time now).
    SetClock {
        /// "YYYY-MM-DD HH:MM:SS"
        time: Option<String>,
    },
    Battery,
    Reservoir,
    Status,
    Settings,
    TempBasal,
    /// Carb and glucose units.
    Units,
    Basal {
        #[arg(value_enum, default_value_t = Pattern::Standard)]
        pattern: Pattern,
    },
    CarbRatios,
    Sensitivities,
    Targets,
    /// History records from the last `hours` of pump time.
    History {
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },
    /// CGM records from the last `hours` of pump time.
    Cgm {
        #[arg(long, default_value_t = 3)]
        hours: i64,
    },
    /// Deliver a normal bolus.
    Bolus {
        #[arg(value_parser = parse_units)]
        units: Insulin,
    },
    /// Absolute temp basal in U/h for a multiple of 30 minutes.
    TempRate {
        #[arg(value_parser = parse_units)]
        rate: Insulin,
        minutes: u32,
    },
    /// Percent temp basal for a multiple of 30 minutes.
    TempPercent { percent: u8, minutes: u32 },
    CancelTemp,
    Suspend,
    Resume,
    Press {
        #[arg(value_enum)]
        button: PumpButton,
    },
    SelectPattern {
        #[arg(value_enum)]
        pattern: Pattern,
    },
    /// Search for the carrier with the strongest reply.
    Tune {
        #[arg(long, default_value = "916.0", value_parser = parse_frequency)]
        low: u32,
        #[arg(long, default_value = "917.0", value_parser = parse_frequency)]
        high: u32,
    },
    /// Emulate the RF remote.
    Remote {
        #[arg(value_enum)]
        button: RemoteKey,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Pattern {
    Standard,
    A,
    B,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PumpButton {
    Esc,
    Act,
    Up,
    Down,
}

impl From<PumpButton> for Button {
    fn from(button: PumpButton) -> Self {
        match button {
            PumpButton::Esc => Button::Esc,
            PumpButton::Act => Button::Act,
            PumpButton::Up => Button::Up,
            PumpButton::Down => Button::Down,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RemoteKey {
    Suspend,
    Bolus,
    Act,
}

impl From<RemoteKey> for RemoteButton {
    fn from(key: RemoteKey) -> Self {
        match key {
            RemoteKey::Suspend => RemoteButton::Suspend,
            RemoteKey::Bolus => RemoteButton::Bolus,
            RemoteKey::Act => RemoteButton::Act,
        }
    }
}

/// Insulin in units with up to three decimals, e.g. `1.5`.
fn parse_units(s: &str) -> Result<Insulin, String> {
    let units: f64 = s.trim().parse().map_err(|_| format!("{s:?} is not a number of units"))?;
    if !units.is_finite() || units < 0.0 || units > 100.0 {
        return Err(format!("{units} U is out of range"));
    }
    Ok(Insulin((units * 1000.0).round() as i32))
}

/// Flags first, then the process environment.
fn session_config(cli: &Cli) -> Result<SessionConfig> {
    let lookup = |name: &str| {
        let flag = match name {
            ENV_PUMP_ID => cli.pump_id.clone(),
            ENV_FREQUENCY => cli.frequency.clone(),
            ENV_REMOTE_ID => cli.remote_id.clone(),
            _ => None,
        };
        flag.or_else(|| std::env::var(name).ok())
    };
    let config = SessionConfig::from_lookup(lookup)
        .context("Pass --pump-id or set MEDTRONIC_PUMP_ID")?
        .with_timeout(Duration::from_millis(cli.timeout_ms))?
        .with_retries(cli.retries);
    Ok(config)
}

struct Printer {
    json: bool,
}

impl Printer {
    fn value<T: Serialize + fmt::Debug>(&self, value: &T) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            println!("{value:#?}");
        }
        Ok(())
    }

    fn line<T: Serialize + fmt::Display>(&self, value: &T) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string(value)?);
        } else {
            println!("{value}");
        }
        Ok(())
    }

    fn schedule<T: Serialize + fmt::Debug>(&self, schedule: &Schedule<T>) -> Result<()> {
        if self.json {
            return self.value(schedule);
        }
        for entry in schedule.entries() {
            println!("{}  {:?}", entry.start.format("%H:%M"), entry.value);
        }
        Ok(())
    }

    fn records<T: Serialize + fmt::Debug>(&self, records: &[T], line: impl Fn(&T) -> String) -> Result<()> {
        if self.json {
            return self.value(&records);
        }
        for record in records {
            println!("{}", line(record));
        }
        Ok(())
    }
}

fn time_or_dash(time: Option<NaiveDateTime>) -> String {
    time.map_or_else(|| "-------------------".to_string(), |t| t.format("%Y-%m-%d %H:%M:%S").to_string())
}

/// Print what was decoded before a failure, then fail with its cause.
fn partial<T: fmt::Debug>(out: &Printer, result: Result<Vec<T>, PartialDecode<T>>) -> Result<Vec<T>>
where
    T: Serialize,
{
    match result {
        Ok(records) => Ok(records),
        Err(partial) => {
            warn!("Decoding stopped after {} records", partial.records.len());
            out.records(&partial.records, |r| format!("{r:?}"))?;
            Err(anyhow!(partial.error))
        }
    }
}

async fn run(command: Command, session: &mut PumpSession, out: &Printer) -> Result<()> {
    match command {
        Command::Wakeup => info!("Pump {} is listening", session.config().pump_id),
        Command::Model => out.line(&session.model().await?)?,
        Command::Id => out.line(&session.pump_id().await?)?,
        Command::Firmware => out.line(&session.firmware_version().await?)?,
        Command::Clock => out.line(&session.clock().await?)?,
        Command::SetClock { time } => {
            let time = match time {
                Some(text) => NaiveDateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S")
                    .with_context(|| format!("Invalid time {text:?}"))?,
                None => Local::now().naive_local(),
            };
            session.set_clock(time).await?;
            info!("Pump clock set to {}", time);
        }
        Command::Battery => out.value(&session.battery().await?)?,
        Command::Reservoir => out.line(&session.reservoir().await?)?,
        Command::Status => out.value(&session.status().await?)?,
        Command::Settings => out.value(&session.settings().await?)?,
        Command::TempBasal => out.value(&session.temp_basal().await?)?,
        Command::Units => {
            let carbs = session.carb_units().await?;
            let glucose = session.glucose_units().await?;
            out.value(&(carbs, glucose))?;
        }
        Command::Basal { pattern } => {
            let schedule = match pattern {
                Pattern::Standard => session.basal_rates().await?,
                Pattern::A => session.basal_pattern_a().await?,
                Pattern::B => session.basal_pattern_b().await?,
            };
            out.schedule(&schedule)?;
        }
        Command::CarbRatios => {
            let ratios = session.carb_ratios().await?;
            info!("Carb ratios in {} per unit", ratios.units);
            out.schedule(&ratios.schedule)?;
        }
        Command::Sensitivities => {
            let sensitivities = session.insulin_sensitivities().await?;
            info!("Sensitivities in {} per unit", sensitivities.units);
            out.schedule(&sensitivities.schedule)?;
        }
        Command::Targets => {
            let targets = session.glucose_targets().await?;
            info!("Targets in {}", targets.units);
            out.schedule(&targets.schedule)?;
        }
        Command::History { hours } => {
            let since = session.clock().await? - TimeDelta::hours(hours);
            let records = partial(out, session.history_records(since).await)?;
            out.records(&records, |r| format!("{}  {:<24} {:?}", time_or_dash(r.time), r.kind, r.info))?;
        }
        Command::Cgm { hours } => {
            let since = session.clock().await? - TimeDelta::hours(hours);
            let records = partial(out, session.cgm_records(since).await)?;
            out.records(&records, |r| format!("{}  {:<16} {:?}", time_or_dash(r.time), r.kind, r.info))?;
        }
        Command::Bolus { units } => {
            session.bolus(units).await?;
            info!("Bolus of {} U accepted", units);
        }
        Command::TempRate { rate, minutes } => {
            session.set_absolute_temp_basal(rate, minutes).await?;
            info!("Temp basal {} U/h for {} min", rate, minutes);
        }
        Command::TempPercent { percent, minutes } => {
            session.set_percent_temp_basal(percent, minutes).await?;
            info!("Temp basal {}% for {} min", percent, minutes);
        }
        Command::CancelTemp => session.cancel_temp_basal().await?,
        Command::Suspend => session.suspend().await?,
        Command::Resume => session.resume().await?,
        Command::Press { button } => session.press_button(button.into()).await?,
        Command::SelectPattern { pattern } => session.select_basal_pattern(pattern as u8).await?,
        Command::Tune { low, high } => {
            let band = SearchBand {
                low,
                high,
                ..SearchBand::default()
            };
            let hz = session.tune(band).await?;
            out.line(&hz)?;
        }
        Command::Remote { button } => {
            let id = session
                .config()
                .remote_id
                .ok_or_else(|| anyhow!("Pass --remote-id or set MEDTRONIC_REMOTE_ID"))?;
            Remote::new(id).press(session.radio_mut(), button.into()).await?;
        }
    }
    Ok(())
}

async fn execute(wakeup: bool, command: Command, session: &mut PumpSession, out: &Printer) -> Result<()> {
    if wakeup {
        session.wakeup().await?;
    }
    run(command, session, out).await
}

/// Commands that address the pump directly and need it awake first.
fn needs_wakeup(command: &Command) -> bool {
    !matches!(command, Command::Remote { .. } | Command::Tune { .. })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = logging::setup_logging(cli.log_file.clone(), &cli.verbose)?;

    let config = session_config(&cli)?;
    let spi = open_spidev(&cli.spi).with_context(|| format!("Failed to open {}", cli.spi))?;
    let radio = AnyRadio::open_polled(cli.chip, spi, config.frequency)
        .await
        .with_context(|| format!("No {} on {}", cli.chip, cli.spi))?;
    let mut session = Session::new(radio, config)?;
    let out = Printer { json: cli.json };

    let wakeup = !cli.no_wakeup && needs_wakeup(&cli.command);
    let result = tokio::select! {
        result = execute(wakeup, cli.command, &mut session, &out) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted");
            Ok(())
        }
    };

    debug!("Session: {:?}, radio: {:?}", session.stats(), session.radio().statistics());
    session.close()?;
    result
}
