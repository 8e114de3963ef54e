use std::fmt::Write;

use crate::metrics::ClassificationMetrics;
use crate::models::SubjectAudit;
use crate::store::ModelArtifactBundle;
use crate::training::{ModelChoice, ModelEvaluation};

fn metric_row(output: &mut String, name: &str, metrics: &ClassificationMetrics, selected: bool) {
    let marker = if selected { " **selected**" } else { "" };
    let _ = writeln!(
        output,
        "| {name}{marker} | {:.3} | {:.3} | {:.3} |",
        metrics.macro_f1, metrics.weighted_f1, metrics.accuracy
    );
}

/// Per-fold macro-F1 of every model, one row per held-out subject.
fn fold_table(output: &mut String, bundle: &ModelArtifactBundle) {
    let mut columns: Vec<(String, &ModelEvaluation)> = bundle
        .families
        .iter()
        .map(|tuned| (tuned.family.to_string(), &tuned.evaluation))
        .collect();
    columns.push((ModelChoice::Ensemble.to_string(), &bundle.ensemble_evaluation));

    let header: Vec<&str> = columns.iter().map(|(name, _)| name.as_str()).collect();
    let _ = writeln!(output, "| held-out subject | samples | {} |", header.join(" | "));
    let _ = writeln!(output, "|---|---:|{}", "---:|".repeat(columns.len()));

    for (idx, fold) in bundle.ensemble_evaluation.folds.iter().enumerate() {
        let scores: Vec<String> = columns
            .iter()
            .map(|(_, evaluation)| {
                evaluation
                    .folds
                    .get(idx)
                    .map_or_else(|| "-".to_string(), |f| format!("{:.3}", f.metrics.macro_f1))
            })
            .collect();
        let _ = writeln!(
            output,
            "| {} | {} | {} |",
            fold.held_out,
            fold.samples,
            scores.join(" | ")
        );
    }
}

fn audit_totals(bundle: &ModelArtifactBundle) -> SubjectAudit {
    bundle
        .audit
        .values()
        .fold(SubjectAudit::default(), |mut total, audit| {
            total.daily_records += audit.daily_records;
            total.rejected_observations += audit.rejected_observations;
            total.dropped_dates += audit.dropped_dates;
            total.excluded_samples += audit.excluded_samples;
            total.unlabeled_samples += audit.unlabeled_samples;
            total
        })
}

pub fn build_report(bundle: &ModelArtifactBundle) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Fatigue Model Report: {}", bundle.cohort);
    let _ = writeln!(
        output,
        "Bundle v{} (run {}) trained {} with seed {}, {} draws per family, scored by {}.",
        bundle.version,
        bundle.run_id,
        bundle.trained_at.format("%Y-%m-%d %H:%M UTC"),
        bundle.seed,
        bundle.n_iter,
        bundle.scoring
    );
    let _ = writeln!(
        output,
        "Catalog v{} ({} features, fingerprint `{}`).",
        bundle.catalog_version,
        bundle.feature_names.len(),
        &bundle.catalog_fingerprint[..bundle.catalog_fingerprint.len().min(12)]
    );
    let _ = writeln!(output);

    let _ = writeln!(output, "## Data");
    let _ = writeln!(
        output,
        "- {} labeled samples from {} subjects",
        bundle.sample_count, bundle.subject_count
    );
    let distribution: Vec<String> = bundle
        .class_labels
        .iter()
        .zip(&bundle.class_counts)
        .map(|(label, count)| format!("{label} {count}"))
        .collect();
    if !distribution.is_empty() {
        let _ = writeln!(output, "- Class balance: {}", distribution.join(", "));
    }
    let totals = audit_totals(bundle);
    let _ = writeln!(
        output,
        "- {} daily records, {} rejected observations, {} under-covered dates dropped",
        totals.daily_records, totals.rejected_observations, totals.dropped_dates
    );
    let _ = writeln!(
        output,
        "- {} dates excluded for insufficient history, {} without a usable label",
        totals.excluded_samples, totals.unlabeled_samples
    );
    let _ = writeln!(output);

    let _ = writeln!(output, "## Leave-One-Subject-Out Performance");
    let _ = writeln!(output, "| model | macro-F1 | weighted-F1 | accuracy |");
    let _ = writeln!(output, "|---|---:|---:|---:|");
    for tuned in &bundle.families {
        metric_row(
            &mut output,
            tuned.family.name(),
            &tuned.evaluation.mean,
            bundle.selected == ModelChoice::Family(tuned.family),
        );
    }
    metric_row(
        &mut output,
        &ModelChoice::Ensemble.to_string(),
        &bundle.ensemble_evaluation.mean,
        bundle.selected == ModelChoice::Ensemble,
    );
    let _ = writeln!(output);

    let _ = writeln!(output, "## Tuned Hyperparameters");
    for tuned in &bundle.families {
        let params = serde_json::to_string(&tuned.params).unwrap_or_else(|_| "?".to_string());
        let _ = writeln!(
            output,
            "- {}: draw {} (search score {:.3}, {} failed draws) `{}`",
            tuned.family, tuned.draw, tuned.search_score, tuned.failed_draws, params
        );
    }
    let _ = writeln!(output);

    let _ = writeln!(output, "## Per-Fold Macro-F1");
    if bundle.ensemble_evaluation.folds.is_empty() {
        let _ = writeln!(output, "No folds recorded for this bundle.");
    } else {
        fold_table(&mut output, bundle);
    }
    let _ = writeln!(output);

    let _ = writeln!(output, "## Subject Audit");
    let noisy: Vec<(&String, &SubjectAudit)> = bundle
        .audit
        .iter()
        .filter(|(_, audit)| {
            audit.rejected_observations > 0 || audit.dropped_dates > 0 || audit.excluded_samples > 0
        })
        .collect();
    if noisy.is_empty() {
        let _ = writeln!(output, "No subject lost observations or dates.");
    } else {
        for (subject, audit) in noisy {
            let _ = writeln!(
                output,
                "- {}: {} rejected observations, {} dropped dates, {} excluded dates",
                subject, audit.rejected_observations, audit.dropped_dates, audit.excluded_samples
            );
        }
    }

    output
}
