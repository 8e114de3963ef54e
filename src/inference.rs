//! Serving a stored bundle: feature-contract checks, then scaling and the
//! selected model.

use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ensemble::argmax_benign;
use crate::error::ContractViolation;
use crate::learners::Classifier;
use crate::models::FeatureVector;
use crate::store::ModelArtifactBundle;
use crate::training::ModelChoice;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub predicted_class: usize,
    pub label: String,
    pub confidence: f64,
    pub class_probabilities: Vec<f64>,
}

/// Rejects a request that does not match the trained slot contract.
pub fn check_contract(
    feature_names: &[String],
    names: Option<&[String]>,
    values: &[f64],
) -> Result<(), ContractViolation> {
    if values.len() != feature_names.len() {
        return Err(ContractViolation::LengthMismatch {
            expected: feature_names.len(),
            actual: values.len(),
        });
    }
    if let Some(names) = names {
        if names.len() != feature_names.len() {
            return Err(ContractViolation::LengthMismatch {
                expected: feature_names.len(),
                actual: names.len(),
            });
        }
        if let Some((position, (expected, found))) = feature_names
            .iter()
            .zip(names)
            .enumerate()
            .find(|(_, (expected, found))| expected != found)
        {
            return Err(ContractViolation::OrderMismatch {
                position,
                expected: expected.clone(),
                found: found.clone(),
            });
        }
    }
    if let Some(position) = values.iter().position(|v| !v.is_finite()) {
        return Err(ContractViolation::NonFinite {
            position,
            name: feature_names[position].clone(),
        });
    }
    Ok(())
}

/// Clamps to non-negative and renormalises; an all-zero row becomes uniform.
pub fn normalize_probabilities(row: ArrayView1<'_, f64>) -> Vec<f64> {
    let clamped: Vec<f64> = row
        .iter()
        .map(|&p| if p.is_finite() { p.max(0.0) } else { 0.0 })
        .collect();
    let total: f64 = clamped.iter().sum();
    if total > 0.0 {
        clamped.iter().map(|p| p / total).collect()
    } else {
        vec![1.0 / clamped.len().max(1) as f64; clamped.len()]
    }
}

fn to_prediction(row: ArrayView1<'_, f64>, class_labels: &[String]) -> Prediction {
    let probabilities = normalize_probabilities(row);
    let predicted_class = argmax_benign(ArrayView1::from(&probabilities[..]));
    Prediction {
        predicted_class,
        label: class_labels
            .get(predicted_class)
            .cloned()
            .unwrap_or_else(|| predicted_class.to_string()),
        confidence: probabilities.get(predicted_class).copied().unwrap_or(0.0),
        class_probabilities: probabilities,
    }
}

/// Scores already-scaled inputs with any classifier after checking the
/// contract. The model is not touched when the check fails.
pub fn predict_with<C: Classifier>(
    model: &C,
    feature_names: &[String],
    class_labels: &[String],
    names: Option<&[String]>,
    scaled: impl FnOnce(&[f64]) -> Array2<f64>,
    values: &[f64],
) -> Result<Prediction, ContractViolation> {
    check_contract(feature_names, names, values)?;
    let x = scaled(values);
    let proba = model.predict_proba(x.view());
    Ok(to_prediction(proba.row(0), class_labels))
}

impl ModelArtifactBundle {
    fn scale(&self, values: &[f64]) -> Array2<f64> {
        let row = self.scaler.transform_row(ArrayView1::from(values));
        row.insert_axis(ndarray::Axis(0))
    }

    /// Predicts the fatigue class for a vector in catalog slot order.
    pub fn predict(&self, vector: &FeatureVector) -> Result<Prediction, ContractViolation> {
        self.predict_checked(None, &vector.values)
    }

    pub fn predict_values(&self, values: &[f64]) -> Result<Prediction, ContractViolation> {
        self.predict_checked(None, values)
    }

    /// Predicts from a named vector; names must match the trained order.
    pub fn predict_named(
        &self,
        names: &[String],
        values: &[f64],
    ) -> Result<Prediction, ContractViolation> {
        self.predict_checked(Some(names), values)
    }

    fn predict_checked(
        &self,
        names: Option<&[String]>,
        values: &[f64],
    ) -> Result<Prediction, ContractViolation> {
        let scaled = |values: &[f64]| self.scale(values);
        let family = match self.selected {
            ModelChoice::Family(family) => self.family_model(family),
            ModelChoice::Ensemble => None,
        };
        let (names_ref, labels) = (&self.feature_names, &self.class_labels);
        let prediction = match family {
            Some(model) => predict_with(model, names_ref, labels, names, scaled, values)?,
            None => predict_with(&self.ensemble, names_ref, labels, names, scaled, values)?,
        };
        debug!(
            cohort = %self.cohort,
            model = %self.selected,
            class = prediction.predicted_class,
            confidence = prediction.confidence,
            "prediction"
        );
        Ok(prediction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::FeatureCatalog;
    use crate::ensemble::tests::FixedProba;
    use crate::features::build_cohort_dataset;
    use crate::synth::{synthetic_cohort, SynthConfig};
    use proptest::prelude::*;

    fn names(width: usize) -> Vec<String> {
        (0..width).map(|i| format!("f{i}")).collect()
    }

    fn labels() -> Vec<String> {
        vec!["Low".into(), "Medium".into(), "High".into()]
    }

    fn unscaled(values: &[f64]) -> Array2<f64> {
        Array2::from_shape_vec((1, values.len()), values.to_vec()).unwrap()
    }

    #[test]
    fn short_vector_is_rejected_before_any_model_call() {
        let model = FixedProba::new(vec![0.2, 0.3, 0.5]);
        let result = predict_with(&model, &names(48), &labels(), None, unscaled, &[0.0; 40]);
        assert_eq!(
            result,
            Err(ContractViolation::LengthMismatch {
                expected: 48,
                actual: 40
            })
        );
        assert_eq!(model.calls.get(), 0);
    }

    #[test]
    fn reordered_names_and_non_finite_values_are_rejected() {
        let model = FixedProba::new(vec![0.2, 0.3, 0.5]);
        let expected = names(4);
        let mut swapped = expected.clone();
        swapped.swap(1, 2);
        assert_eq!(
            predict_with(&model, &expected, &labels(), Some(swapped.as_slice()), unscaled, &[0.0; 4]),
            Err(ContractViolation::OrderMismatch {
                position: 1,
                expected: "f1".into(),
                found: "f2".into()
            })
        );
        assert_eq!(
            predict_with(&model, &expected, &labels(), None, unscaled, &[0.0, f64::NAN, 0.0, 0.0]),
            Err(ContractViolation::NonFinite {
                position: 1,
                name: "f1".into()
            })
        );
        assert_eq!(model.calls.get(), 0);

        let prediction =
            predict_with(&model, &expected, &labels(), Some(expected.as_slice()), unscaled, &[0.0; 4]).unwrap();
        assert_eq!(prediction.predicted_class, 2);
        assert_eq!(prediction.label, "High");
        assert_eq!(model.calls.get(), 1);
    }

    #[test]
    fn negative_scores_are_clamped_and_renormalised() {
        let model = FixedProba::new(vec![-0.2, 0.5, 1.5]);
        let prediction = predict_with(&model, &names(1), &labels(), None, unscaled, &[1.0]).unwrap();
        assert_eq!(prediction.class_probabilities, vec![0.0, 0.25, 0.75]);
        assert_eq!(prediction.confidence, 0.75);

        let ties = FixedProba::new(vec![0.4, 0.4, 0.2]);
        let prediction = predict_with(&ties, &names(1), &labels(), None, unscaled, &[1.0]).unwrap();
        assert_eq!(prediction.predicted_class, 0);
    }

    #[test]
    fn stored_bundle_serves_catalog_vectors() {
        let bundle = crate::store::tests::trained_bundle("student");
        let catalog = FeatureCatalog::default();
        let subjects = synthetic_cohort(&catalog, &SynthConfig { subjects: 1, days: 12, seed: 3, ..SynthConfig::default() });
        let dataset = build_cohort_dataset(&catalog, "student", &subjects, None);
        let sample = &dataset.samples[0].features;

        let by_vector = bundle.predict(sample).unwrap();
        let by_name = bundle.predict_named(&catalog.slot_names(), &sample.values).unwrap();
        assert_eq!(by_vector, by_name);
        assert!((by_vector.class_probabilities.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert!(matches!(
            bundle.predict_named(&catalog.slot_names()[..40].to_vec(), &sample.values[..40]),
            Err(ContractViolation::LengthMismatch { expected: 48, actual: 40 })
        ));
    }

    proptest! {
        #[test]
        fn probabilities_always_form_a_distribution(
            row in prop::collection::vec(-5.0f64..5.0, 3)
        ) {
            let model = FixedProba::new(row);
            let prediction = predict_with(&model, &names(2), &labels(), None, unscaled, &[0.5, -0.5]).unwrap();
            let total: f64 = prediction.class_probabilities.iter().sum();
            prop_assert!((total - 1.0).abs() < 1e-9);
            prop_assert!(prediction.class_probabilities.iter().all(|p| (0.0..=1.0).contains(p)));
            prop_assert!(prediction.predicted_class < 3);
            prop_assert_eq!(
                prediction.confidence,
                prediction.class_probabilities[prediction.predicted_class]
            );
        }
    }
}
