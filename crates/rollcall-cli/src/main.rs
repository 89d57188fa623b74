use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use rollcall_core::model::is_trained;
use rollcall_core::{
    BlazeFaceDetector, Classifier, FsSampleStore, Identity, Recognizer, SampleStore, TrainedModel, Trainer,
    TrainingGate,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod enrollment;
mod ledger;

use config::Config;
use ledger::{Ledger, NewIdentity, Period};

/// Days covered by `report daily` when `--days` is not given.
const DEFAULT_REPORT_DAYS: u32 = 30;

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-identification attendance")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a person and store their face samples
    Enroll {
        /// Display name
        #[arg(short, long)]
        name: String,
        #[arg(long, default_value = "")]
        roll: String,
        #[arg(long, default_value = "")]
        class: String,
        #[arg(long, default_value = "")]
        section: String,
        #[arg(long, default_value = "")]
        registration: String,
        /// Face images, stored as samples 0..n in the given order
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Retrain the classifier from every stored sample
    Train,
    /// Identify the face in an image
    Identify {
        image: PathBuf,
        /// Minimum confidence to accept (default: ROLLCALL_CONFIDENCE_THRESHOLD)
        #[arg(short, long)]
        threshold: Option<f32>,
        /// Record an attendance event on a match
        #[arg(long)]
        record: bool,
    },
    /// Remove a person, their samples and their attendance history
    Remove {
        /// Identity to remove
        id: i64,
    },
    /// Mark a person present without face identification
    Mark {
        /// Identity to mark present
        id: i64,
    },
    /// List enrolled people
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show attendance events
    Attendance {
        #[arg(short, long, value_enum, default_value = "all")]
        period: Period,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Attendance reports
    Report {
        #[command(subcommand)]
        kind: ReportKind,
    },
    /// Show configuration and model status as JSON
    Status,
}

#[derive(Subcommand)]
enum ReportKind {
    /// Presence rate per class and section
    Classes {
        #[arg(short, long, value_enum, default_value = "today")]
        period: Period,
    },
    /// Total attendance and last seen per person
    People,
    /// Attendance events per day
    Daily {
        #[arg(short, long, default_value_t = DEFAULT_REPORT_DAYS)]
        days: u32,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();
    tracing::debug!(?config, "configuration loaded");

    match cli.command {
        Commands::Enroll {
            name,
            roll,
            class,
            section,
            registration,
            images,
        } => {
            let new = NewIdentity {
                name,
                roll_number: roll,
                class,
                section,
                registration_number: registration,
            };
            enroll(&config, &new, &images)
        }
        Commands::Train => train(&config),
        Commands::Identify {
            image,
            threshold,
            record,
        } => identify(&config, &image, threshold.unwrap_or(config.confidence_threshold), record),
        Commands::Remove { id } => remove(&config, Identity(id)),
        Commands::Mark { id } => mark(&config, Identity(id)),
        Commands::List { json } => list(&config, json),
        Commands::Attendance { period, json } => attendance(&config, period, json),
        Commands::Report { kind } => report(&config, kind),
        Commands::Status => status(&config),
    }
}

fn open_ledger(config: &Config) -> Result<Ledger> {
    Ledger::open(&config.db_path).with_context(|| format!("opening ledger {}", config.db_path.display()))
}

fn open_store(config: &Config) -> Result<FsSampleStore> {
    FsSampleStore::open(&config.dataset_dir)
        .with_context(|| format!("opening sample store {}", config.dataset_dir.display()))
}

fn load_detector(config: &Config) -> Result<BlazeFaceDetector> {
    BlazeFaceDetector::load(&config.detector_model, config.detection_confidence)
        .with_context(|| format!("loading face detector {}", config.detector_model.display()))
}

/// Decode an image file into an RGB frame.
fn load_frame(path: &Path) -> Result<image::RgbImage> {
    let decoded = image::open(path).with_context(|| format!("reading image {}", path.display()))?;
    Ok(decoded.into_rgb8())
}

fn enroll(config: &Config, new: &NewIdentity, images: &[PathBuf]) -> Result<()> {
    // Every image must decode before the identity is created.
    let frames = images
        .iter()
        .map(|p| load_frame(p))
        .collect::<Result<Vec<_>>>()?;

    let mut ledger = open_ledger(config)?;
    let store = open_store(config)?;
    let mut detector = load_detector(config)?;

    let enrolled = enrollment::enroll(&mut ledger, &store, &mut detector, new, &frames)?;

    println!("Enrolled {} as identity {}", new.name, enrolled.id);
    println!("Photos with a usable face: {}/{}", enrolled.valid, enrolled.total);
    println!("Run `rollcall train` to include them in the model.");
    Ok(())
}

fn train(config: &Config) -> Result<()> {
    let store = Arc::new(open_store(config)?);
    let detector = load_detector(config)?;

    let job = Trainer::new(store, detector, &config.model_path, TrainingGate::new()).spawn()?;
    for update in job.progress().iter() {
        println!("[{:>3}%] {}", update.percent, update.message);
    }
    let report = job.wait()?;

    println!(
        "Trained on {} sample(s) across {} identities, {} skipped",
        report.samples_used,
        report.classes.len(),
        report.samples_skipped()
    );
    let missing = report.identities - report.classes.len();
    if missing > 0 {
        println!("{missing} enrolled identities had no usable face and will not be recognised");
    }
    Ok(())
}

fn identify(config: &Config, image: &Path, threshold: f32, record: bool) -> Result<()> {
    let frame = load_frame(image)?;
    let mut recognizer = Recognizer::open(load_detector(config)?, &config.model_path)?;
    if !recognizer.is_trained() {
        bail!("no trained model at {}; run `rollcall train` first", config.model_path.display());
    }

    let prediction = recognizer.predict(&frame, threshold)?;
    let Some(id) = prediction.identity else {
        println!("No match (confidence {:.2}, threshold {threshold:.2})", prediction.confidence);
        return Ok(());
    };

    let ledger = open_ledger(config)?;
    let Some(person) = ledger.get_identity(id)? else {
        tracing::warn!(%id, "model recognised an identity missing from the ledger; retrain to drop it");
        println!("Matched identity {id}, which is no longer enrolled");
        return Ok(());
    };

    println!("{} (identity {id}, confidence {:.2})", person.name, prediction.confidence);
    if record {
        ledger.record_attendance(id, &person.name, Local::now().naive_local())?;
        println!("Attendance recorded");
    }
    Ok(())
}

fn remove(config: &Config, id: Identity) -> Result<()> {
    let mut ledger = open_ledger(config)?;
    let store = open_store(config)?;

    let existed = ledger.delete_identity(id)?;
    store.delete(id)?;

    if existed {
        println!("Removed identity {id}; retrain to drop it from the model");
    } else {
        println!("No identity {id}");
    }
    Ok(())
}

fn mark(config: &Config, id: Identity) -> Result<()> {
    let ledger = open_ledger(config)?;
    let Some(person) = ledger.get_identity(id)? else {
        bail!("no identity {id}");
    };

    ledger.record_attendance(id, &person.name, Local::now().naive_local())?;
    println!("Attendance marked for {} (identity {id})", person.name);
    Ok(())
}

fn list(config: &Config, json: bool) -> Result<()> {
    let ledger = open_ledger(config)?;
    let store = open_store(config)?;

    let people = ledger.list_identities()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&people)?);
        return Ok(());
    }
    if people.is_empty() {
        println!("No one enrolled");
        return Ok(());
    }

    for person in people {
        let samples = store.list_samples(person.id)?.len();
        println!(
            "{:>5}  {:<24} roll={:<8} class={}{:<4} samples={samples}",
            person.id.get(), person.name, person.roll_number, person.class, person.section
        );
    }
    Ok(())
}

fn attendance(config: &Config, period: Period, json: bool) -> Result<()> {
    let ledger = open_ledger(config)?;
    let records = ledger.attendance(period)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("No attendance recorded");
        return Ok(());
    }

    for r in records {
        println!(
            "{}  {}  {:>5}  {}",
            r.timestamp.format("%Y-%m-%d"),
            r.timestamp.format("%H:%M:%S"),
            r.identity.get(),
            r.name
        );
    }
    Ok(())
}

fn report(config: &Config, kind: ReportKind) -> Result<()> {
    let ledger = open_ledger(config)?;
    match kind {
        ReportKind::Classes { period } => {
            for c in ledger.class_attendance(period)? {
                println!(
                    "class={:<6} section={:<4} present={:>4}/{:<4} {:>6.2}%",
                    c.class,
                    c.section,
                    c.present,
                    c.total,
                    c.rate()
                );
            }
        }
        ReportKind::People => {
            for s in ledger.attendance_summary()? {
                let last = s
                    .last_seen
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{:>5}  {:<24} roll={:<8} class={}{:<4} events={:<5} last={last}",
                    s.id.get(),
                    s.name,
                    s.roll_number,
                    s.class,
                    s.section,
                    s.events
                );
            }
        }
        ReportKind::Daily { days } => {
            for (day, count) in ledger.daily_counts(days)? {
                println!("{}  {count}", day.format("%d %b"));
            }
        }
    }
    Ok(())
}

fn status(config: &Config) -> Result<()> {
    let ledger = open_ledger(config)?;
    let model = if is_trained(&config.model_path) {
        TrainedModel::load(&config.model_path)?
    } else {
        None
    };

    let model_json = match &model {
        Some(m) => serde_json::json!({
            "trained_at": m.trained_at,
            "samples": m.sample_count,
            "classes": m.classes(),
            "trees": m.forest().n_trees(),
        }),
        None => serde_json::Value::Null,
    };

    let out = serde_json::json!({
        "config": config,
        "trained": model.is_some(),
        "model": model_json,
        "identities": ledger.count_identities()?,
        "present_today": ledger.count_present_today()?,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
