//! Randomized hyperparameter search under leave-one-subject-out validation,
//! soft-voting ensembling and final model selection for one cohort.

use std::collections::BTreeMap;
use std::time::Instant;

use ndarray::Array2;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::aggregate::DateRange;
use crate::catalog::{FeatureCatalog, CLASS_COUNT};
use crate::config::TrainingConfig;
use crate::cv::{leave_one_subject_out, Fold};
use crate::ensemble::{predicted_classes, soft_vote, SoftVotingEnsemble};
use crate::error::{CohortTrainingFailure, ConvergenceError, PipelineError, TrainingStage};
use crate::features::build_cohort_dataset;
use crate::learners::{Classifier, FittedModel, HyperParams, ModelFamily};
use crate::metrics::ClassificationMetrics;
use crate::models::{CohortDataset, SubjectAudit, SubjectData};
use crate::scaler::StandardScaler;
use crate::store::{ModelArtifactBundle, ModelStore};

/// Marks the full-data refit in seed derivation.
const REFIT: u64 = u64::MAX;

/// splitmix64 over a seed and a path of stream identifiers.
pub fn derive_seed(seed: u64, path: &[u64]) -> u64 {
    let mut state = seed;
    for part in path {
        state = state.wrapping_add(0x9E37_79B9_7F4A_7C15).wrapping_add(*part);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        state = z ^ (z >> 31);
    }
    state
}

fn family_stream(family: ModelFamily) -> u64 {
    family as u64 + 1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoldMetrics {
    pub held_out: String,
    pub samples: usize,
    pub metrics: ClassificationMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEvaluation {
    pub folds: Vec<FoldMetrics>,
    pub mean: ClassificationMetrics,
}

impl ModelEvaluation {
    fn from_folds(folds: Vec<FoldMetrics>) -> Self {
        let all: Vec<ClassificationMetrics> = folds.iter().map(|fold| fold.metrics).collect();
        Self {
            mean: ClassificationMetrics::mean(&all),
            folds,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunedFamily {
    pub family: ModelFamily,
    pub draw: usize,
    pub params: HyperParams,
    pub search_score: f64,
    pub failed_draws: usize,
    pub evaluation: ModelEvaluation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "family")]
pub enum ModelChoice {
    Ensemble,
    Family(ModelFamily),
}

impl std::fmt::Display for ModelChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ensemble => f.write_str("soft_voting_ensemble"),
            Self::Family(family) => write!(f, "{family}"),
        }
    }
}

/// Everything a successful cohort run produces.
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub cohort: String,
    pub seed: u64,
    pub feature_names: Vec<String>,
    pub scaler: StandardScaler,
    pub families: Vec<TunedFamily>,
    pub ensemble: SoftVotingEnsemble<FittedModel>,
    pub ensemble_evaluation: ModelEvaluation,
    pub selected: ModelChoice,
    pub sample_count: usize,
    pub subject_count: usize,
    pub audit: BTreeMap<String, SubjectAudit>,
}

/// A fold with its scaler already fit on the training partition.
struct PreparedFold {
    held_out: String,
    x_train: Array2<f64>,
    y_train: Vec<usize>,
    x_test: Array2<f64>,
    y_test: Vec<usize>,
}

fn prepare_fold(dataset: &CohortDataset, fold: &Fold) -> PreparedFold {
    let (x_train, y_train) = dataset.matrix(&fold.train);
    let (x_test, y_test) = dataset.matrix(&fold.test);
    let scaler = StandardScaler::fit(x_train.view());
    PreparedFold {
        held_out: fold.held_out.clone(),
        x_train: scaler.transform(x_train.view()),
        y_train,
        x_test: scaler.transform(x_test.view()),
        y_test,
    }
}

/// Held-out probabilities and metrics of one configuration across all folds.
struct DrawEvaluation {
    fold_probas: Vec<Array2<f64>>,
    fold_metrics: Vec<ClassificationMetrics>,
    score: f64,
}

fn evaluate_draw(
    params: &HyperParams,
    draw: usize,
    folds: &[PreparedFold],
    config: &TrainingConfig,
) -> Result<DrawEvaluation, ConvergenceError> {
    let family = family_stream(params.family());
    let per_fold: Vec<Result<(Array2<f64>, ClassificationMetrics), ConvergenceError>> = folds
        .par_iter()
        .enumerate()
        .map(|(fold_idx, fold)| {
            let seed = derive_seed(config.seed, &[family, draw as u64, fold_idx as u64]);
            let mut model = params.build(CLASS_COUNT, seed);
            model.fit(fold.x_train.view(), &fold.y_train)?;
            let proba = model.predict_proba(fold.x_test.view());
            if proba.iter().any(|p| !p.is_finite()) {
                return Err(ConvergenceError::NonFinite {
                    quantity: "probabilities",
                    iteration: 0,
                });
            }
            let metrics =
                ClassificationMetrics::compute(&fold.y_test, &predicted_classes(proba.view()));
            Ok((proba, metrics))
        })
        .collect();

    let mut fold_probas = Vec::with_capacity(folds.len());
    let mut fold_metrics = Vec::with_capacity(folds.len());
    for result in per_fold {
        let (proba, metrics) = result?;
        fold_probas.push(proba);
        fold_metrics.push(metrics);
    }
    let score = ClassificationMetrics::mean(&fold_metrics).score(config.scoring);
    Ok(DrawEvaluation {
        fold_probas,
        fold_metrics,
        score,
    })
}

struct FamilySearch {
    family: ModelFamily,
    draw: usize,
    params: HyperParams,
    best: DrawEvaluation,
    failed_draws: usize,
}

/// The family's `n_iter` configurations, drawn from its own seed stream.
fn sample_draws(family: ModelFamily, config: &TrainingConfig) -> Vec<HyperParams> {
    let mut rng = SmallRng::seed_from_u64(derive_seed(config.seed, &[family_stream(family)]));
    (0..config.n_iter).map(|_| family.sample(&mut rng)).collect()
}

/// Scores every draw and keeps the best mean fold score; equal scores keep
/// the lowest draw index. Failed draws are skipped with a warning. `None`
/// when every draw failed.
fn search_family(
    family: ModelFamily,
    draws: &[HyperParams],
    folds: &[PreparedFold],
    config: &TrainingConfig,
) -> Option<FamilySearch> {
    let results: Vec<Result<DrawEvaluation, ConvergenceError>> = draws
        .par_iter()
        .enumerate()
        .map(|(idx, params)| evaluate_draw(params, idx, folds, config))
        .collect();

    let mut failed_draws = 0;
    let mut best: Option<(usize, DrawEvaluation)> = None;
    for (idx, result) in results.into_iter().enumerate() {
        match result {
            Ok(evaluation) if evaluation.score.is_finite() => {
                debug!(%family, draw = idx, score = evaluation.score, "scored draw");
                if best.as_ref().map_or(true, |(_, b)| evaluation.score > b.score) {
                    best = Some((idx, evaluation));
                }
            }
            Ok(_) => {
                failed_draws += 1;
                warn!(%family, draw = idx, "skipping draw with non-finite score");
            }
            Err(error) => {
                failed_draws += 1;
                warn!(%family, draw = idx, %error, "skipping draw that failed to fit");
            }
        }
    }

    best.map(|(draw, best)| FamilySearch {
        family,
        draw,
        params: draws[draw].clone(),
        best,
        failed_draws,
    })
}

/// Highest macro-F1, then accuracy; the ensemble wins remaining ties.
fn select_model(families: &[TunedFamily], ensemble: &ModelEvaluation) -> ModelChoice {
    let mut choice = ModelChoice::Ensemble;
    let mut best = ensemble.mean;
    for tuned in families {
        let candidate = tuned.evaluation.mean;
        let better = candidate.macro_f1 > best.macro_f1
            || (candidate.macro_f1 == best.macro_f1 && candidate.accuracy > best.accuracy);
        if better {
            choice = ModelChoice::Family(tuned.family);
            best = candidate;
        }
    }
    choice
}

/// Trains, evaluates and selects the models for one cohort.
pub fn train_cohort(
    dataset: &CohortDataset,
    config: &TrainingConfig,
) -> Result<TrainingOutcome, CohortTrainingFailure> {
    train_with_draws(dataset, config, |family| sample_draws(family, config))
}

fn train_with_draws<D>(
    dataset: &CohortDataset,
    config: &TrainingConfig,
    draws_for: D,
) -> Result<TrainingOutcome, CohortTrainingFailure>
where
    D: Fn(ModelFamily) -> Vec<HyperParams>,
{
    let started = Instant::now();
    let fail = |stage, reason: String| CohortTrainingFailure {
        cohort: dataset.cohort.clone(),
        seed: config.seed,
        stage,
        reason,
    };

    if dataset.is_empty() {
        return Err(fail(TrainingStage::Dataset, "no labeled samples".into()));
    }
    let subjects: Vec<&str> = dataset.samples.iter().map(|s| s.subject_id()).collect();
    let folds = leave_one_subject_out(&subjects);
    if folds.len() < 2 {
        return Err(fail(
            TrainingStage::Dataset,
            format!(
                "leave-one-subject-out needs at least two subjects, found {}",
                folds.len()
            ),
        ));
    }
    info!(
        cohort = %dataset.cohort,
        samples = dataset.len(),
        folds = folds.len(),
        n_iter = config.n_iter,
        scoring = %config.scoring,
        "starting cohort training"
    );

    let prepared: Vec<PreparedFold> = folds.par_iter().map(|fold| prepare_fold(dataset, fold)).collect();

    let searches: Vec<FamilySearch> = ModelFamily::ALL
        .iter()
        .filter_map(|&family| {
            let draws = draws_for(family);
            let search = search_family(family, &draws, &prepared, config);
            if search.is_none() {
                warn!(%family, "every draw failed; family dropped from the ensemble");
            }
            search
        })
        .collect();
    if searches.is_empty() {
        return Err(fail(
            TrainingStage::Search,
            "every hyperparameter draw of every model family failed".into(),
        ));
    }

    let families: Vec<TunedFamily> = searches
        .iter()
        .map(|search| {
            let folds = prepared
                .iter()
                .zip(&search.best.fold_metrics)
                .map(|(fold, metrics)| FoldMetrics {
                    held_out: fold.held_out.clone(),
                    samples: fold.y_test.len(),
                    metrics: *metrics,
                })
                .collect();
            TunedFamily {
                family: search.family,
                draw: search.draw,
                params: search.params.clone(),
                search_score: search.best.score,
                failed_draws: search.failed_draws,
                evaluation: ModelEvaluation::from_folds(folds),
            }
        })
        .collect();

    let uniform = vec![1.0; searches.len()];
    let ensemble_folds = prepared
        .iter()
        .enumerate()
        .map(|(idx, fold)| {
            let probas: Vec<Array2<f64>> = searches
                .iter()
                .map(|search| search.best.fold_probas[idx].clone())
                .collect();
            let combined = soft_vote(&probas, &uniform)
                .ok_or_else(|| fail(TrainingStage::Evaluation, "no fold probabilities".into()))?;
            Ok(FoldMetrics {
                held_out: fold.held_out.clone(),
                samples: fold.y_test.len(),
                metrics: ClassificationMetrics::compute(
                    &fold.y_test,
                    &predicted_classes(combined.view()),
                ),
            })
        })
        .collect::<Result<Vec<_>, CohortTrainingFailure>>()?;
    let ensemble_evaluation = ModelEvaluation::from_folds(ensemble_folds);

    let (x_full, y_full) = dataset.full_matrix();
    let scaler = StandardScaler::fit(x_full.view());
    let x_scaled = scaler.transform(x_full.view());
    let mut members = Vec::with_capacity(families.len());
    for tuned in &families {
        let seed = derive_seed(
            config.seed,
            &[family_stream(tuned.family), tuned.draw as u64, REFIT],
        );
        let mut model = tuned.params.build(CLASS_COUNT, seed);
        model
            .fit(x_scaled.view(), &y_full)
            .map_err(|error| fail(TrainingStage::Refit, format!("{}: {error}", tuned.family)))?;
        members.push(model);
    }
    let ensemble = SoftVotingEnsemble::uniform(members);

    let selected = select_model(&families, &ensemble_evaluation);
    for tuned in &families {
        info!(
            family = %tuned.family,
            macro_f1 = tuned.evaluation.mean.macro_f1,
            accuracy = tuned.evaluation.mean.accuracy,
            failed_draws = tuned.failed_draws,
            "tuned family"
        );
    }
    info!(
        cohort = %dataset.cohort,
        ensemble_macro_f1 = ensemble_evaluation.mean.macro_f1,
        %selected,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "cohort training complete"
    );

    Ok(TrainingOutcome {
        cohort: dataset.cohort.clone(),
        seed: config.seed,
        feature_names: dataset.feature_names.clone(),
        scaler,
        families,
        ensemble,
        ensemble_evaluation,
        selected,
        sample_count: dataset.len(),
        subject_count: folds.len(),
        audit: dataset.audit.clone(),
    })
}

/// Builds the cohort dataset, trains it and persists the resulting bundle.
pub fn train_and_store(
    catalog: &FeatureCatalog,
    config: &TrainingConfig,
    cohort: &str,
    subjects: &BTreeMap<String, SubjectData>,
    range: Option<DateRange>,
    store: &ModelStore,
) -> Result<ModelArtifactBundle, PipelineError> {
    let dataset = build_cohort_dataset(catalog, cohort, subjects, range);
    let outcome = train_cohort(&dataset, config)?;
    let counts = dataset.class_counts(catalog.class_labels().len());
    let mut bundle = ModelArtifactBundle::from_outcome(outcome, catalog, config, counts);
    store.save(&mut bundle).map_err(|error| CohortTrainingFailure {
        cohort: cohort.to_string(),
        seed: config.seed,
        stage: TrainingStage::Persist,
        reason: error.to_string(),
    })?;
    Ok(bundle)
}
