//! CLI definition and dispatch.

use chrono::NaiveDateTime;
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;

use crate::adapters::alert_sinks::{JsonlAlertSink, LogAlertSink};
use crate::adapters::csv_adapter::CsvAdapter;
use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::domain::account::ExternalFlags;
use crate::domain::alert::DeliveryStatus;
use crate::domain::engine::{Boundary, Engine, TickInputs, TickReport};
use crate::domain::error::CycleError;
use crate::domain::instrument::CycleLevel;
use crate::domain::ohlcv::OhlcvBar;
use crate::domain::settings::{load_settings, Settings};
use crate::ports::alert_port::AlertPort;
use crate::ports::config_port::ConfigPort;
use crate::ports::data_port::DataPort;
use crate::ports::persistence_port::PersistencePort;

#[derive(Parser, Debug)]
#[command(name = "cyclewatch", about = "Market cycle tracker and signal engine")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Replay CSV bars through the engine, one tick per timestamp
    Replay {
        #[arg(short, long)]
        config: PathBuf,
        /// Directory of <INSTRUMENT>.csv files
        #[arg(short, long)]
        data: PathBuf,
        /// Bars per instrument used for backfill (overrides [engine] warmup)
        #[arg(long)]
        warmup: Option<usize>,
        /// External flags, e.g. "drawdown_confirmed=true,volatility_rank_ok=false"
        #[arg(long)]
        flags: Option<String>,
        /// Append delivered alerts as JSON lines to this file
        #[arg(long)]
        alerts: Option<PathBuf>,
    },
    /// Show persisted cycle state
    Status {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        instrument: Option<String>,
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate a configuration file
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Acknowledge an active signal
    Ack {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        rule: String,
        #[arg(long)]
        instrument: String,
    },
}

pub fn run(cli: Cli) -> ExitCode {
    match cli.command {
        Command::Replay {
            config,
            data,
            warmup,
            flags,
            alerts,
        } => run_replay(&config, &data, warmup, flags.as_deref(), alerts.as_ref()),
        Command::Status {
            config,
            instrument,
            json,
        } => run_status(&config, instrument.as_deref(), json),
        Command::Validate { config } => run_validate(&config),
        Command::Ack {
            config,
            rule,
            instrument,
        } => run_ack(&config, &rule, &instrument),
    }
}

pub fn load_config(path: &PathBuf) -> Result<FileConfigAdapter, ExitCode> {
    FileConfigAdapter::from_file(path).map_err(|e| {
        let err = CycleError::ConfigParse {
            file: path.display().to_string(),
            reason: e.to_string(),
        };
        eprintln!("error: {err}");
        ExitCode::from(&err)
    })
}

fn fail(err: &CycleError) -> ExitCode {
    eprintln!("error: {err}");
    err.into()
}

fn load(path: &PathBuf) -> Result<(FileConfigAdapter, Settings), ExitCode> {
    let adapter = load_config(path)?;
    let settings = load_settings(&adapter).map_err(|e| fail(&e))?;
    for err in &settings.rule_errors {
        eprintln!("warning: {err}");
    }
    Ok((adapter, settings))
}

#[cfg(feature = "sqlite")]
pub fn open_store(config: &dyn ConfigPort) -> Result<Option<Box<dyn PersistencePort>>, CycleError> {
    use crate::adapters::sqlite_adapter::SqliteAdapter;

    if config.get_string("sqlite", "path").is_none() {
        return Ok(None);
    }
    Ok(Some(Box::new(SqliteAdapter::from_config(config)?)))
}

#[cfg(not(feature = "sqlite"))]
pub fn open_store(config: &dyn ConfigPort) -> Result<Option<Box<dyn PersistencePort>>, CycleError> {
    match config.get_string("sqlite", "path") {
        None => Ok(None),
        Some(_) => Err(CycleError::ConfigInvalid {
            section: "sqlite".into(),
            key: "path".into(),
            reason: "built without sqlite support".into(),
        }),
    }
}

fn require_store(config: &dyn ConfigPort) -> Result<Box<dyn PersistencePort>, CycleError> {
    open_store(config)?.ok_or_else(|| CycleError::ConfigMissing {
        section: "sqlite".into(),
        key: "path".into(),
    })
}

/// Split each instrument's history into its first `warmup` bars and the rest.
pub fn split_warmup(
    history: BTreeMap<String, Vec<OhlcvBar>>,
    warmup: usize,
) -> (BTreeMap<String, Vec<OhlcvBar>>, BTreeMap<String, Vec<OhlcvBar>>) {
    let mut head = BTreeMap::new();
    let mut tail = BTreeMap::new();
    for (id, mut bars) in history {
        let rest = bars.split_off(warmup.min(bars.len()));
        if !bars.is_empty() {
            head.insert(id.clone(), bars);
        }
        if !rest.is_empty() {
            tail.insert(id, rest);
        }
    }
    (head, tail)
}

/// One tick per distinct timestamp, each carrying every instrument's bars
/// stamped with it.
pub fn group_by_timestamp(
    bars: BTreeMap<String, Vec<OhlcvBar>>,
) -> BTreeMap<NaiveDateTime, BTreeMap<String, Vec<OhlcvBar>>> {
    let mut ticks: BTreeMap<NaiveDateTime, BTreeMap<String, Vec<OhlcvBar>>> = BTreeMap::new();
    for (id, series) in bars {
        for bar in series {
            ticks
                .entry(bar.timestamp)
                .or_default()
                .entry(id.clone())
                .or_default()
                .push(bar);
        }
    }
    ticks
}

fn print_report(report: &TickReport) {
    for issue in &report.data_issues {
        eprintln!("warning: {issue}");
    }
    for failure in &report.rule_failures {
        eprintln!(
            "warning: rule {} on {}: {}",
            failure.rule_id, failure.instrument, failure.error
        );
    }
    for signal in &report.signals {
        println!(
            "{}  SIGNAL  {:<8} {:<12} {} ({}) close={:.2}",
            signal.timestamp,
            signal.severity,
            signal.action,
            signal.instrument,
            signal.rule_id,
            signal.payload.get("close").copied().unwrap_or(f64::NAN),
        );
    }
    for alert in &report.alerts {
        match alert.status {
            DeliveryStatus::Delivered => println!(
                "{}  ALERT   {:<8} {}  {}",
                alert.timestamp, alert.severity, alert.key, alert.message
            ),
            DeliveryStatus::Failed => eprintln!(
                "warning: alert {} not delivered: {}",
                alert.key,
                alert.error.as_deref().unwrap_or("unknown error")
            ),
            DeliveryStatus::Pending | DeliveryStatus::Suppressed => {}
        }
    }
}

fn run_replay(
    config_path: &PathBuf,
    data_path: &PathBuf,
    warmup_override: Option<usize>,
    flags_arg: Option<&str>,
    alerts_path: Option<&PathBuf>,
) -> ExitCode {
    // Stage 1: Load config and settings
    eprintln!("Loading config from {}", config_path.display());
    let (adapter, settings) = match load(config_path) {
        Ok(loaded) => loaded,
        Err(code) => return code,
    };

    let mut flags = settings.flags.clone();
    if let Some(arg) = flags_arg {
        match ExternalFlags::parse_list(arg) {
            Ok(parsed) => flags.merge(&parsed),
            Err(reason) => {
                return fail(&CycleError::ConfigInvalid {
                    section: "cli".into(),
                    key: "flags".into(),
                    reason,
                });
            }
        }
    }
    let portfolio = settings.portfolio.clone();
    let warmup = warmup_override.unwrap_or(settings.warmup);

    // Stage 2: Open state store and alert sink
    let store = match open_store(&adapter) {
        Ok(s) => s,
        Err(e) => return fail(&e),
    };
    let sink: Box<dyn AlertPort> = match alerts_path {
        Some(path) => match JsonlAlertSink::append_to(path) {
            Ok(s) => Box::new(s),
            Err(e) => return fail(&e),
        },
        None => Box::new(LogAlertSink),
    };

    let mut engine = match store.as_deref() {
        Some(port) => match Engine::resume(settings, port) {
            Ok(e) => e,
            Err(e) => return fail(&e),
        },
        None => Engine::new(settings),
    };
    let resumed = engine.snapshot().tick > 0;

    // Stage 3: Fetch bars newer than the persisted state
    let feed = CsvAdapter::new(data_path.clone());
    let ids: Vec<String> = engine.settings().registry.ids().map(str::to_string).collect();
    let mut history = BTreeMap::new();
    for id in &ids {
        match feed.fetch_bars_checked(id, engine.last_timestamp(id)) {
            Ok((bars, issues)) => {
                for issue in &issues {
                    eprintln!("warning: {issue}");
                }
                if !bars.is_empty() {
                    history.insert(id.clone(), bars);
                }
            }
            Err(e) => eprintln!("warning: skipping {} ({})", id, e),
        }
    }
    if history.is_empty() {
        eprintln!("No new bars for {} instruments", ids.len());
        return ExitCode::SUCCESS;
    }

    // Stage 4: Backfill, unless continuing from persisted state
    let live = if resumed || warmup == 0 {
        history
    } else {
        let (head, tail) = split_warmup(history, warmup);
        let report = engine.backfill(&head, store.as_deref());
        print_report(&report);
        if let Some(e) = &report.persistence_error {
            return fail(e);
        }
        eprintln!(
            "Backfilled {} bars ({} transitions)",
            report.accepted.values().sum::<usize>(),
            report.transitions.len()
        );
        tail
    };

    // Stage 5: Live ticks
    let ticks = group_by_timestamp(live);
    eprintln!("Replaying {} ticks", ticks.len());
    let inputs = TickInputs {
        portfolio: &portfolio,
        flags: &flags,
    };
    let boundary = Boundary {
        sink: sink.as_ref(),
        persistence: store.as_deref(),
    };

    let mut signals = 0usize;
    let mut delivered = 0usize;
    let mut persistence_failure = None;
    for bars in ticks.values() {
        let report = engine.tick(bars, &inputs, &boundary);
        print_report(&report);
        signals += report.signals.len();
        delivered += report
            .alerts
            .iter()
            .filter(|a| a.status == DeliveryStatus::Delivered)
            .count();
        let committed = report.committed;
        if let Some(e) = report.persistence_error {
            eprintln!("error: {e}");
            persistence_failure = Some(e);
        }
        if !committed {
            eprintln!("Stopping replay at tick {}; rerun to resume", report.tick);
            break;
        }
    }

    eprintln!(
        "\nDone: {} signals, {} alerts delivered, {} active",
        signals,
        delivered,
        engine.get_active_signals().len()
    );
    match persistence_failure {
        Some(e) => (&e).into(),
        None => ExitCode::SUCCESS,
    }
}

fn run_status(config_path: &PathBuf, instrument: Option<&str>, json: bool) -> ExitCode {
    let (adapter, settings) = match load(config_path) {
        Ok(loaded) => loaded,
        Err(code) => return code,
    };
    let engine = match require_store(&adapter).and_then(|s| Engine::resume(settings, s.as_ref())) {
        Ok(e) => e,
        Err(e) => return fail(&e),
    };

    let ids: Vec<String> = match instrument {
        Some(id) => vec![id.to_uppercase()],
        None => engine.settings().registry.ids().map(str::to_string).collect(),
    };
    let statuses: Vec<_> = ids
        .iter()
        .flat_map(|id| {
            CycleLevel::ALL
                .iter()
                .filter_map(|level| engine.get_cycle_state(id, *level))
                .collect::<Vec<_>>()
        })
        .collect();
    if statuses.is_empty() {
        eprintln!("error: no tracked cycles match");
        return ExitCode::from(2);
    }

    if json {
        match serde_json::to_string_pretty(&statuses) {
            Ok(text) => println!("{text}"),
            Err(e) => {
                eprintln!("error: {e}");
                return ExitCode::from(1);
            }
        }
        return ExitCode::SUCCESS;
    }

    println!("Tick {}", engine.snapshot().tick);
    for status in &statuses {
        let phase = status
            .phase
            .map_or_else(|| "unseeded".to_string(), |p| format!("{p:?}").to_lowercase());
        let elapsed = status.cycle.as_ref().map_or(0, |c| c.elapsed_count);
        let degraded = if status.degraded { " DEGRADED" } else { "" };
        println!(
            "  {:<6} {:<6} {:<12} bar {:>3}  score {}  weak {}  closed {}{}",
            status.instrument,
            status.level.to_string(),
            phase,
            elapsed,
            status.score,
            status.weak_streak,
            status.closed_cycles,
            degraded,
        );
        if let Some(err) = &status.last_error {
            println!("         last error: {err}");
        }
    }
    for id in &ids {
        if let Some(c) = engine.get_confirmation_score(id) {
            println!(
                "  {} confirmation: {} level, candidate bar {}, score {}/4",
                id, c.level, c.candidate_index, c.score
            );
        }
    }
    let active = engine.get_active_signals();
    if !active.is_empty() {
        println!("Active signals:");
        for s in active {
            println!("  {} {} {} ({})", s.timestamp, s.action, s.instrument, s.rule_id);
        }
    }
    ExitCode::SUCCESS
}

fn run_validate(config_path: &PathBuf) -> ExitCode {
    let adapter = match load_config(config_path) {
        Ok(a) => a,
        Err(code) => return code,
    };
    let settings = match load_settings(&adapter) {
        Ok(s) => s,
        Err(e) => return fail(&e),
    };
    if let Some(first) = settings.rule_errors.first() {
        for err in &settings.rule_errors {
            eprintln!("error: {err}");
        }
        return first.into();
    }
    if let Err(e) = open_store(&adapter) {
        return fail(&e);
    }

    println!("Configuration OK: {}", config_path.display());
    for instrument in settings.registry.instruments() {
        let levels: Vec<String> = instrument.levels.keys().map(|l| l.to_string()).collect();
        println!("  {} ({}): {}", instrument.id, instrument.unit, levels.join(", "));
    }
    println!("  {} rules", settings.rules.len());
    ExitCode::SUCCESS
}

fn run_ack(config_path: &PathBuf, rule: &str, instrument: &str) -> ExitCode {
    let (adapter, settings) = match load(config_path) {
        Ok(loaded) => loaded,
        Err(code) => return code,
    };
    let store = match require_store(&adapter) {
        Ok(s) => s,
        Err(e) => return fail(&e),
    };
    let mut engine = match Engine::resume(settings, store.as_ref()) {
        Ok(e) => e,
        Err(e) => return fail(&e),
    };
    match engine.acknowledge_signal(rule, instrument, Some(store.as_ref())) {
        Ok(true) => {
            println!("Acknowledged {} on {}", rule, instrument.to_uppercase());
            ExitCode::SUCCESS
        }
        Ok(false) => {
            eprintln!("No active signal for {} on {}", rule, instrument.to_uppercase());
            ExitCode::SUCCESS
        }
        Err(e) => fail(&e),
    }
}
