//! Versioned per-cohort model artifacts on disk.
//!
//! Layout: `<root>/<cohort>/bundle.json`. A save serialises into a uniquely
//! named temp file next to the bundle, syncs it and renames it over the old
//! file, so readers see either the previous bundle or the new one.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::catalog::FeatureCatalog;
use crate::config::{is_valid_cohort, TrainingConfig};
use crate::ensemble::SoftVotingEnsemble;
use crate::error::ArtifactStoreError;
use crate::learners::{FittedModel, ModelFamily};
use crate::metrics::ScoringMetric;
use crate::models::SubjectAudit;
use crate::scaler::StandardScaler;
use crate::training::{ModelChoice, ModelEvaluation, TrainingOutcome, TunedFamily};

pub const BUNDLE_FORMAT_VERSION: u32 = 1;
pub const BUNDLE_FILE: &str = "bundle.json";

/// Everything needed to reproduce, audit and serve one training run.
///
/// The ensemble members are the refit family models, in the same order as
/// `families`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifactBundle {
    pub format_version: u32,
    pub version: u64,
    pub run_id: Uuid,
    pub cohort: String,
    pub trained_at: DateTime<Utc>,
    pub seed: u64,
    pub n_iter: usize,
    pub scoring: ScoringMetric,
    pub catalog_version: u32,
    pub catalog_fingerprint: String,
    pub feature_names: Vec<String>,
    pub class_labels: Vec<String>,
    pub scaler: StandardScaler,
    pub families: Vec<TunedFamily>,
    pub ensemble: SoftVotingEnsemble<FittedModel>,
    pub ensemble_evaluation: ModelEvaluation,
    pub selected: ModelChoice,
    pub sample_count: usize,
    pub subject_count: usize,
    pub class_counts: Vec<usize>,
    pub audit: BTreeMap<String, SubjectAudit>,
}

impl ModelArtifactBundle {
    /// Packages a training outcome. The version is assigned on save.
    pub fn from_outcome(
        outcome: TrainingOutcome,
        catalog: &FeatureCatalog,
        config: &TrainingConfig,
        class_counts: Vec<usize>,
    ) -> Self {
        Self {
            format_version: BUNDLE_FORMAT_VERSION,
            version: 0,
            run_id: Uuid::new_v4(),
            cohort: outcome.cohort,
            trained_at: Utc::now(),
            seed: outcome.seed,
            n_iter: config.n_iter,
            scoring: config.scoring,
            catalog_version: catalog.version,
            catalog_fingerprint: catalog.fingerprint(),
            feature_names: outcome.feature_names,
            class_labels: catalog.class_labels().to_vec(),
            scaler: outcome.scaler,
            families: outcome.families,
            ensemble: outcome.ensemble,
            ensemble_evaluation: outcome.ensemble_evaluation,
            selected: outcome.selected,
            sample_count: outcome.sample_count,
            subject_count: outcome.subject_count,
            class_counts,
            audit: outcome.audit,
        }
    }

    pub fn family_model(&self, family: ModelFamily) -> Option<&FittedModel> {
        self.ensemble
            .members()
            .iter()
            .find(|model| model.family() == family)
    }

    pub fn selected_evaluation(&self) -> &ModelEvaluation {
        match self.selected {
            ModelChoice::Ensemble => &self.ensemble_evaluation,
            ModelChoice::Family(family) => self
                .families
                .iter()
                .find(|tuned| tuned.family == family)
                .map_or(&self.ensemble_evaluation, |tuned| &tuned.evaluation),
        }
    }
}

#[derive(Deserialize)]
struct VersionHeader {
    version: u64,
}

#[derive(Debug, Clone)]
pub struct ModelStore {
    root: PathBuf,
}

impl ModelStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn cohort_dir(&self, cohort: &str) -> Result<PathBuf, ArtifactStoreError> {
        if !is_valid_cohort(cohort) {
            return Err(ArtifactStoreError::InvalidCohort(cohort.to_string()));
        }
        Ok(self.root.join(cohort))
    }

    pub fn bundle_path(&self, cohort: &str) -> Result<PathBuf, ArtifactStoreError> {
        Ok(self.cohort_dir(cohort)?.join(BUNDLE_FILE))
    }

    /// Version of the bundle currently at `path`, or 0 when there is none.
    /// An unreadable bundle fails the save rather than resetting the count.
    fn previous_version(&self, path: &Path) -> Result<u64, ArtifactStoreError> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(source) => {
                return Err(ArtifactStoreError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_reader::<_, VersionHeader>(BufReader::new(file))
            .map(|header| header.version)
            .map_err(|source| {
                warn!(path = %path.display(), %source, "previous bundle is unreadable; refusing to overwrite");
                ArtifactStoreError::Serialization {
                    path: path.to_path_buf(),
                    source,
                }
            })
    }

    /// Writes `bundle` as the cohort's current artifact and returns its path.
    ///
    /// Sets `bundle.version` to the previous version plus one. On failure,
    /// including an unreadable previous bundle, the file on disk is left
    /// untouched.
    pub fn save(&self, bundle: &mut ModelArtifactBundle) -> Result<PathBuf, ArtifactStoreError> {
        let dir = self.cohort_dir(&bundle.cohort)?;
        fs::create_dir_all(&dir).map_err(|source| ArtifactStoreError::Io {
            path: dir.clone(),
            source,
        })?;
        let target = dir.join(BUNDLE_FILE);
        bundle.version = self.previous_version(&target)? + 1;

        replace_atomically(&target, |writer, path| {
            serde_json::to_writer_pretty(writer, &*bundle).map_err(|source| {
                ArtifactStoreError::Serialization {
                    path: path.to_path_buf(),
                    source,
                }
            })
        })?;

        info!(
            cohort = %bundle.cohort,
            version = bundle.version,
            run_id = %bundle.run_id,
            path = %target.display(),
            "saved model bundle"
        );
        Ok(target)
    }

    pub fn load(&self, cohort: &str) -> Result<ModelArtifactBundle, ArtifactStoreError> {
        let path = self.bundle_path(cohort)?;
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Err(ArtifactStoreError::NotFound(cohort.to_string()))
            }
            Err(source) => return Err(ArtifactStoreError::Io { path, source }),
        };
        serde_json::from_reader(BufReader::new(file))
            .map_err(|source| ArtifactStoreError::Serialization { path, source })
    }

    /// Loads a bundle and rejects it unless it was trained for `cohort`
    /// against exactly this catalog's slot order.
    pub fn load_checked(
        &self,
        cohort: &str,
        catalog: &FeatureCatalog,
    ) -> Result<ModelArtifactBundle, ArtifactStoreError> {
        let bundle = self.load(cohort)?;
        let stale = |reason: String| ArtifactStoreError::Stale {
            cohort: cohort.to_string(),
            reason,
        };
        if bundle.format_version != BUNDLE_FORMAT_VERSION {
            return Err(stale(format!(
                "format version {} (expected {BUNDLE_FORMAT_VERSION})",
                bundle.format_version
            )));
        }
        if bundle.cohort != cohort {
            return Err(stale(format!("bundle belongs to cohort '{}'", bundle.cohort)));
        }
        if bundle.catalog_fingerprint != catalog.fingerprint() {
            return Err(stale(format!(
                "catalog fingerprint {} does not match current catalog v{}",
                bundle.catalog_fingerprint, catalog.version
            )));
        }
        if bundle.feature_names != catalog.slot_names() {
            return Err(stale("feature order differs from the current catalog".into()));
        }
        Ok(bundle)
    }

    /// Cohorts with a stored bundle, sorted.
    pub fn cohorts(&self) -> Result<Vec<String>, ArtifactStoreError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(ArtifactStoreError::Io {
                    path: self.root.clone(),
                    source,
                })
            }
        };
        let mut cohorts = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| ArtifactStoreError::Io {
                path: self.root.clone(),
                source,
            })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_valid_cohort(&name) && entry.path().join(BUNDLE_FILE).is_file() {
                cohorts.push(name);
            }
        }
        cohorts.sort();
        Ok(cohorts)
    }
}

/// Runs `write` against a fresh temp file beside `target`, syncs it and
/// renames it into place. The temp file is removed on any failure.
fn replace_atomically<F>(target: &Path, write: F) -> Result<(), ArtifactStoreError>
where
    F: FnOnce(&mut BufWriter<File>, &Path) -> Result<(), ArtifactStoreError>,
{
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let temp = dir.join(format!(".{BUNDLE_FILE}.{}.tmp", Uuid::new_v4()));
    let io_error = |path: &Path| {
        let path = path.to_path_buf();
        move |source| ArtifactStoreError::Io { path, source }
    };

    let result = (|| -> Result<(), ArtifactStoreError> {
        let file = File::create(&temp).map_err(io_error(&temp))?;
        let mut writer = BufWriter::new(file);
        write(&mut writer, &temp)?;
        writer.flush().map_err(io_error(&temp))?;
        writer.get_ref().sync_all().map_err(io_error(&temp))?;
        drop(writer);
        fs::rename(&temp, target).map_err(io_error(target))?;
        #[cfg(unix)]
        File::open(dir)
            .and_then(|handle| handle.sync_all())
            .map_err(io_error(dir))?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }
    result
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::features::build_cohort_dataset;
    use crate::synth::{synthetic_cohort, SynthConfig};
    use crate::training::train_cohort;
    use tempfile::TempDir;

    /// A small trained bundle over the default catalog.
    pub(crate) fn trained_bundle(cohort: &str) -> ModelArtifactBundle {
        let catalog = FeatureCatalog::default();
        let subjects = synthetic_cohort(
            &catalog,
            &SynthConfig {
                subjects: 3,
                days: 24,
                ..SynthConfig::default()
            },
        );
        let dataset = build_cohort_dataset(&catalog, cohort, &subjects, None);
        let config = TrainingConfig {
            n_iter: 1,
            ..TrainingConfig::default()
        };
        let outcome = train_cohort(&dataset, &config).unwrap();
        let counts = dataset.class_counts(catalog.class_labels().len());
        ModelArtifactBundle::from_outcome(outcome, &catalog, &config, counts)
    }

    fn temp_files(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".tmp"))
            .collect()
    }

    #[test]
    fn save_increments_version_and_roundtrips() {
        let root = TempDir::new().unwrap();
        let store = ModelStore::new(root.path());
        let mut bundle = trained_bundle("worker");

        store.save(&mut bundle).unwrap();
        assert_eq!(bundle.version, 1);
        store.save(&mut bundle).unwrap();
        assert_eq!(bundle.version, 2);

        let loaded = store.load("worker").unwrap();
        assert_eq!(loaded, bundle);
        assert_eq!(store.cohorts().unwrap(), vec!["worker".to_string()]);
        assert!(temp_files(&root.path().join("worker")).is_empty());
    }

    #[test]
    fn failed_write_keeps_previous_bundle() {
        let root = TempDir::new().unwrap();
        let store = ModelStore::new(root.path());
        let mut bundle = trained_bundle("student");
        let path = store.save(&mut bundle).unwrap();
        let before = fs::read(&path).unwrap();

        let result = replace_atomically(&path, |writer, temp| {
            writer.write_all(b"{\"truncated\":").unwrap();
            Err(ArtifactStoreError::Io {
                path: temp.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
            })
        });

        assert!(matches!(result, Err(ArtifactStoreError::Io { .. })));
        assert_eq!(fs::read(&path).unwrap(), before);
        assert!(temp_files(path.parent().unwrap()).is_empty());
        assert_eq!(store.load("student").unwrap().version, 1);
    }

    #[test]
    fn unreadable_previous_bundle_blocks_the_save() {
        let root = TempDir::new().unwrap();
        let store = ModelStore::new(root.path());
        let mut bundle = trained_bundle("worker");
        let path = store.save(&mut bundle).unwrap();
        store.save(&mut bundle).unwrap();
        assert_eq!(bundle.version, 2);

        fs::write(&path, b"{\"version\": ").unwrap();
        let result = store.save(&mut bundle);
        assert!(matches!(result, Err(ArtifactStoreError::Serialization { .. })));
        assert_eq!(fs::read(&path).unwrap(), b"{\"version\": ");
        assert!(temp_files(path.parent().unwrap()).is_empty());
    }

    #[test]
    fn load_checked_rejects_foreign_catalogs_and_cohorts() {
        let root = TempDir::new().unwrap();
        let store = ModelStore::new(root.path());
        let mut bundle = trained_bundle("general");
        store.save(&mut bundle).unwrap();

        let catalog = FeatureCatalog::default();
        assert!(store.load_checked("general", &catalog).is_ok());

        let mut shifted = catalog.clone();
        shifted.lags = vec![0, 1, 3];
        assert!(matches!(
            store.load_checked("general", &shifted),
            Err(ArtifactStoreError::Stale { .. })
        ));

        // A bundle copied under another cohort's directory is not served.
        let foreign = root.path().join("worker");
        fs::create_dir_all(&foreign).unwrap();
        fs::copy(root.path().join("general").join(BUNDLE_FILE), foreign.join(BUNDLE_FILE)).unwrap();
        assert!(matches!(
            store.load_checked("worker", &catalog),
            Err(ArtifactStoreError::Stale { .. })
        ));
    }

    #[test]
    fn missing_and_invalid_cohorts() {
        let root = TempDir::new().unwrap();
        let store = ModelStore::new(root.path().join("absent"));
        assert!(store.cohorts().unwrap().is_empty());
        assert!(matches!(store.load("student"), Err(ArtifactStoreError::NotFound(_))));
        assert!(matches!(
            store.load("../student"),
            Err(ArtifactStoreError::InvalidCohort(_))
        ));
    }
}
