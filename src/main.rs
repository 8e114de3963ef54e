use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use chrono::NaiveDate;
use clap::{ArgGroup, Parser, Subcommand};
use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fatigue_forecast::aggregate::DateRange;
use fatigue_forecast::config::PipelineConfig;
use fatigue_forecast::metrics::ScoringMetric;
use fatigue_forecast::models::SubjectData;
use fatigue_forecast::store::ModelStore;
use fatigue_forecast::synth::{synthetic_cohort, SynthConfig};
use fatigue_forecast::{db, ingest, report, training};

#[derive(Parser)]
#[command(name = "fatigue-forecast")]
#[command(about = "Per-cohort fatigue forecasting from biometrics and weather", long_about = None)]
struct Cli {
    /// TOML pipeline configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Model store directory (overrides the configuration)
    #[arg(long, global = true)]
    store_dir: Option<PathBuf>,
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a synthetic cohort as observation, label and membership CSVs
    Synth {
        #[arg(long, default_value = "synthetic")]
        out_dir: PathBuf,
        #[arg(long, default_value = "general")]
        cohort: String,
        #[arg(long, default_value_t = 16)]
        subjects: usize,
        #[arg(long, default_value_t = 60)]
        days: usize,
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// Train and store models for one or all configured cohorts
    #[command(group(
        ArgGroup::new("source")
            .args(["observations", "database"])
            .required(true)
            .multiple(false)
    ))]
    Train {
        /// Train only this cohort (default: every configured cohort)
        #[arg(long)]
        cohort: Option<String>,
        #[arg(long, requires = "labels")]
        observations: Option<PathBuf>,
        #[arg(long)]
        labels: Option<PathBuf>,
        /// subject_id,cohort CSV; without it every subject joins the cohort
        #[arg(long)]
        subjects: Option<PathBuf>,
        /// Read from Postgres at DATABASE_URL instead of CSV files
        #[arg(long)]
        database: bool,
        #[arg(long)]
        start: Option<NaiveDate>,
        #[arg(long)]
        end: Option<NaiveDate>,
        #[arg(long)]
        n_iter: Option<usize>,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        scoring: Option<ScoringMetric>,
    },
    /// Predict from a JSON feature vector ({"names": [...], "values": [...]})
    Predict {
        #[arg(long)]
        cohort: String,
        #[arg(long)]
        input: PathBuf,
    },
    /// Generate a markdown report for a stored bundle
    Report {
        #[arg(long)]
        cohort: String,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// List cohorts with a stored bundle
    Cohorts,
}

#[derive(Deserialize)]
struct PredictRequest {
    #[serde(default)]
    names: Option<Vec<String>>,
    values: Vec<f64>,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("fatigue_forecast={default},sqlx=warn")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn date_range(start: Option<NaiveDate>, end: Option<NaiveDate>) -> anyhow::Result<Option<DateRange>> {
    match (start, end) {
        (None, None) => Ok(None),
        (Some(start), Some(end)) if start <= end => Ok(Some(DateRange::new(start, end))),
        (Some(start), Some(end)) => bail!("--start {start} is after --end {end}"),
        _ => bail!("--start and --end must be given together"),
    }
}

async fn load_database(
    range: Option<DateRange>,
) -> anyhow::Result<(BTreeMap<String, SubjectData>, BTreeMap<String, String>)> {
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to read observations from Postgres")?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    let observations = db::fetch_observations(&pool, None, range).await?;
    let reports = db::fetch_reports(&pool, None, range).await?;
    let membership = db::fetch_membership(&pool).await?;
    info!(
        observations = observations.len(),
        reports = reports.len(),
        subjects = membership.len(),
        "loaded data from Postgres"
    );
    Ok((ingest::group_by_subject(observations, reports), membership))
}

fn load_csv(
    observations: &Path,
    labels: &Path,
    subjects: Option<&Path>,
) -> anyhow::Result<(BTreeMap<String, SubjectData>, Option<BTreeMap<String, String>>)> {
    let observations = ingest::read_observations(observations)?;
    let reports = ingest::read_labels(labels)?;
    let membership = subjects.map(ingest::read_membership).transpose()?;
    Ok((ingest::group_by_subject(observations, reports), membership))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = PipelineConfig::load_or_default(cli.config.as_deref())
        .context("failed to load pipeline configuration")?;
    if let Some(store_dir) = cli.store_dir {
        config.store_dir = store_dir;
    }
    let store = ModelStore::new(&config.store_dir);

    match cli.command {
        Commands::Synth {
            out_dir,
            cohort,
            subjects,
            days,
            seed,
        } => {
            let catalog = config.catalog()?;
            let generated = synthetic_cohort(
                &catalog,
                &SynthConfig {
                    subjects,
                    days,
                    seed,
                    prefix: format!("{cohort}-"),
                    ..SynthConfig::default()
                },
            );
            std::fs::create_dir_all(&out_dir)
                .with_context(|| format!("failed to create {}", out_dir.display()))?;
            let observations = ingest::write_observations(
                &out_dir.join("observations.csv"),
                generated.values().flat_map(|data| &data.observations),
            )?;
            let labels = ingest::write_labels(
                &out_dir.join("labels.csv"),
                generated.values().flat_map(|data| &data.reports),
            )?;
            ingest::write_membership(
                &out_dir.join("subjects.csv"),
                generated.keys().map(|id| (id.as_str(), cohort.as_str())),
            )?;
            println!(
                "Wrote {observations} observations and {labels} labels for {} subjects to {}.",
                generated.len(),
                out_dir.display()
            );
        }
        Commands::Train {
            cohort,
            observations,
            labels,
            subjects,
            database,
            start,
            end,
            n_iter,
            seed,
            scoring,
        } => {
            if let Some(n_iter) = n_iter {
                config.training.n_iter = n_iter;
            }
            if let Some(seed) = seed {
                config.training.seed = seed;
            }
            if let Some(scoring) = scoring {
                config.training.scoring = scoring;
            }
            config.validate()?;
            let catalog = config.catalog()?;
            let range = date_range(start, end)?;
            let cohorts = config.resolve_cohorts(cohort.as_deref())?;

            let (data, membership) = if database {
                let (data, membership) = load_database(range).await?;
                (data, Some(membership))
            } else {
                let observations = observations.context("--observations is required")?;
                let labels = labels.context("--labels is required")?;
                load_csv(&observations, &labels, subjects.as_deref())?
            };

            let mut failures = 0usize;
            for cohort in cohorts {
                let members = ingest::select_cohort(&data, membership.as_ref(), &cohort);
                if members.is_empty() {
                    info!(%cohort, "no subjects in cohort; skipping");
                    continue;
                }
                let (catalog, training, store) =
                    (catalog.clone(), config.training.clone(), store.clone());
                let name = cohort.clone();
                let result = tokio::task::spawn_blocking(move || {
                    training::train_and_store(&catalog, &training, &name, &members, range, &store)
                })
                .await
                .context("training task panicked")?;
                match result {
                    Ok(bundle) => println!(
                        "{cohort}: bundle v{} selected {} (macro-F1 {:.3}) across {} subjects.",
                        bundle.version,
                        bundle.selected,
                        bundle.selected_evaluation().mean.macro_f1,
                        bundle.subject_count
                    ),
                    Err(failure) => {
                        error!(%cohort, %failure, "cohort training failed");
                        failures += 1;
                    }
                }
            }
            if failures > 0 {
                bail!("{failures} cohort(s) failed to train");
            }
        }
        Commands::Predict { cohort, input } => {
            let catalog = config.catalog()?;
            let bundle = store
                .load_checked(&cohort, &catalog)
                .with_context(|| format!("no usable bundle for cohort '{cohort}'"))?;
            let raw = std::fs::read_to_string(&input)
                .with_context(|| format!("failed to read {}", input.display()))?;
            let request: PredictRequest =
                serde_json::from_str(&raw).context("invalid prediction request")?;
            let prediction = match &request.names {
                Some(names) => bundle.predict_named(names, &request.values)?,
                None => bundle.predict_values(&request.values)?,
            };
            println!("{}", serde_json::to_string_pretty(&prediction)?);
        }
        Commands::Report { cohort, out } => {
            let bundle = store.load(&cohort)?;
            std::fs::write(&out, report::build_report(&bundle))?;
            println!("Report written to {}.", out.display());
        }
        Commands::Cohorts => {
            let cohorts = store.cohorts()?;
            if cohorts.is_empty() {
                println!("No stored bundles under {}.", store.root().display());
                return Ok(());
            }
            for cohort in cohorts {
                let bundle = store.load(&cohort)?;
                println!(
                    "- {} v{} trained {} ({}, {} samples)",
                    cohort,
                    bundle.version,
                    bundle.trained_at.format("%Y-%m-%d %H:%M"),
                    bundle.selected,
                    bundle.sample_count
                );
            }
        }
    }

    Ok(())
}
