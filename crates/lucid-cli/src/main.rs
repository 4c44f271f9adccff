use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use lucid_core::{
    Clock, ClockFormatter, DetectionSettings, EngineConfig, HeartRateSample, HistorySink,
    JsonlHistorySink, LogEntry, ManualClock, MemoryHistorySink, PredictionModel,
    RemEvaluationResult, SleepPhaseEngine, StageSample, StaticHistorySource, StillnessState,
    Strictness, SupportSample, Timed,
};

#[derive(Parser)]
#[command(name = "lucid-cli", about = "Replay recorded nights through the sleep-phase engine")]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive the engine across a recorded night
    Replay {
        #[arg(long)]
        night: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, default_value_t = 60)]
        step_secs: u64,
        #[arg(long)]
        strictness: Option<Strictness>,
        #[arg(long)]
        history_out: Option<PathBuf>,
    },
    /// Rebuild a prediction model from stage history
    Calibrate {
        #[arg(long)]
        history: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the effective configuration as TOML
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
        /// Write to this path instead of stdout
        #[arg(long)]
        write: Option<PathBuf>,
    },
}

/// A recorded night. Samples are released to the engine once their end
/// time has passed on the replay clock.
#[derive(Debug, Deserialize)]
struct NightRecording {
    start_us: i64,
    end_us: i64,
    #[serde(default)]
    session_start_us: Option<i64>,
    #[serde(default)]
    settings: Option<DetectionSettings>,
    #[serde(default)]
    stages: Vec<StageSample>,
    #[serde(default)]
    heart_rate: Vec<HeartRateSample>,
    #[serde(default)]
    support: Vec<SupportSample>,
    #[serde(default)]
    stillness: Vec<StillnessUpdate>,
    /// Past nights used to calibrate the prediction model
    #[serde(default)]
    history: Vec<StageSample>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct StillnessUpdate {
    at_us: i64,
    #[serde(flatten)]
    state: StillnessState,
}

impl Timed for StillnessUpdate {
    fn start_us(&self) -> i64 {
        self.at_us
    }
    fn end_us(&self) -> i64 {
        self.at_us
    }
}

/// Samples ordered by end time, released as the clock passes them.
struct Feed<T> {
    items: Vec<T>,
    next: usize,
}

impl<T: Timed + Copy> Feed<T> {
    fn new(mut items: Vec<T>) -> Self {
        items.sort_by_key(|s| s.end_us());
        Self { items, next: 0 }
    }

    fn due(&mut self, now_us: i64) -> &[T] {
        let from = self.next;
        while self.next < self.items.len() && self.items[self.next].end_us() <= now_us {
            self.next += 1;
        }
        &self.items[from..self.next]
    }
}

#[derive(Debug)]
struct ReplaySummary {
    evaluations: usize,
    rem_evaluations: usize,
    entries: Vec<LogEntry>,
    model: PredictionModel,
}

fn init_logging() {
    let mut filter = EnvFilter::from_default_env();
    if let Ok(d) = "lucid_core=info".parse() {
        filter = filter.add_directive(d);
    }
    if let Ok(d) = "lucid_cli=info".parse() {
        filter = filter.add_directive(d);
    }
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

async fn replay(
    night: NightRecording,
    config: EngineConfig,
    step_secs: u64,
    strictness: Option<Strictness>,
) -> Result<ReplaySummary, Box<dyn std::error::Error>> {
    if night.end_us < night.start_us {
        return Err("recording ends before it starts".into());
    }
    let step_us = (step_secs.max(1) as i64) * 1_000_000;
    let formatter = ClockFormatter::with_offset_minutes(config.display.utc_offset_minutes);
    let clock = Arc::new(ManualClock::new(night.start_us));

    let mut settings = night.settings.clone().unwrap_or_default();
    if let Some(s) = strictness {
        settings.strictness = s;
    }

    let mut engine = SleepPhaseEngine::new(config, clock.clone()).with_settings(settings);
    if !night.history.is_empty() {
        let source = Arc::new(StaticHistorySource::new(night.history.clone()));
        engine = engine.with_history_source(source, tokio::runtime::Handle::current());
    }
    let sink = MemoryHistorySink::new();
    engine.set_history_sink(Box::new(sink.clone()));

    let printer_clock = clock.clone();
    let mut last_description: Option<String> = None;
    engine.add_observer(Box::new(move |result: &RemEvaluationResult| {
        if last_description.as_deref() != Some(result.description.as_str()) {
            println!(
                "[{}] {}{}",
                formatter.time(printer_clock.now_us()),
                if result.is_rem { "* " } else { "  " },
                result.description
            );
            last_description = Some(result.description.clone());
        }
    }));

    engine.start(night.session_start_us);
    if let Some(refresher) = engine.refresher_mut() {
        refresher.join().await;
        info!("Calibrated model: {:?}", engine.prediction_model());
    }

    let mut stages = Feed::new(night.stages);
    let mut heart_rate = Feed::new(night.heart_rate);
    let mut support = Feed::new(night.support);
    let mut stillness = Feed::new(night.stillness);

    let mut summary = ReplaySummary {
        evaluations: 0,
        rem_evaluations: 0,
        entries: Vec::new(),
        model: engine.prediction_model(),
    };

    let mut now = night.start_us;
    while now <= night.end_us {
        clock.set(now);
        if let Some(update) = stillness.due(now).last() {
            engine.update_stillness(update.state);
        }
        for s in stages.due(now) {
            engine.ingest_stage(*s);
        }
        for s in heart_rate.due(now) {
            engine.ingest_heart_rate(*s);
        }
        for s in support.due(now) {
            engine.ingest_support(*s);
        }
        if let Some(result) = engine.tick() {
            summary.evaluations += 1;
            summary.rem_evaluations += usize::from(result.is_rem);
        }
        now += step_us;
    }
    engine.stop();

    summary.entries = sink.entries();
    summary.model = engine.prediction_model();
    Ok(summary)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let cli = Cli::parse();
    match cli.cmd {
        Commands::Replay {
            night,
            config,
            step_secs,
            strictness,
            history_out,
        } => {
            let cfg = EngineConfig::load_layered(config.as_deref())?;
            let formatter = ClockFormatter::with_offset_minutes(cfg.display.utc_offset_minutes);
            let recording: NightRecording = load_json(&night)?;
            info!("Replaying {}", night.display());

            let summary = replay(recording, cfg, step_secs, strictness).await?;
            println!();
            for entry in &summary.entries {
                println!("{}  {}", formatter.time(entry.timestamp_us), entry.note);
            }
            println!(
                "{} evaluations, {} positive",
                summary.evaluations, summary.rem_evaluations
            );
            println!(
                "model: latency={}min cycle={}min duration={}min{}",
                summary.model.rem_latency_us / 60_000_000,
                summary.model.rem_cycle_us / 60_000_000,
                summary.model.rem_duration_us / 60_000_000,
                if summary.model.is_calibrated() { "" } else { " (built-in)" }
            );

            if let Some(path) = history_out {
                let mut out = JsonlHistorySink::open(&path)?;
                for entry in &summary.entries {
                    out.record(entry)?;
                }
                info!("Wrote {} entries to {}", summary.entries.len(), path.display());
            }
        }
        Commands::Calibrate { history, config } => {
            let cfg = EngineConfig::load_layered(config.as_deref())?;
            let samples: Vec<StageSample> = load_json(&history)?;
            let previous = PredictionModel::builtin(&cfg.prediction);
            let model = PredictionModel::rebuild(&samples, &previous, &cfg);
            if !model.is_calibrated() {
                warn!("No REM windows in history, printing the built-in model");
            }
            println!("{}", serde_json::to_string_pretty(&model)?);
        }
        Commands::Config { config, write } => {
            let cfg = EngineConfig::load_layered(config.as_deref())?;
            match write {
                Some(path) => {
                    cfg.save_to_file(&path)?;
                    info!("Saved configuration to {}", path.display());
                }
                None => print!("{}", cfg.to_toml_string()?),
            }
        }
    }
    Ok(())
}
