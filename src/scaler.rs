use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

const MIN_SCALE: f64 = 1e-12;

/// Per-column standardisation fit on a training partition only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl StandardScaler {
    /// Zero-variance columns keep a unit scale so they map to 0.
    pub fn fit(x: ArrayView2<'_, f64>) -> Self {
        let width = x.ncols();
        if x.nrows() == 0 {
            return Self {
                mean: vec![0.0; width],
                scale: vec![1.0; width],
            };
        }
        let mean = x.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(width));
        let std = x.std_axis(Axis(0), 0.0);
        Self {
            mean: mean.to_vec(),
            scale: std
                .iter()
                .map(|&s| if s.is_finite() && s > MIN_SCALE { s } else { 1.0 })
                .collect(),
        }
    }

    pub fn width(&self) -> usize {
        self.mean.len()
    }

    pub fn transform(&self, x: ArrayView2<'_, f64>) -> Array2<f64> {
        let mut out = x.to_owned();
        for (col, mut column) in out.axis_iter_mut(Axis(1)).enumerate() {
            let (mean, scale) = (self.mean[col], self.scale[col]);
            column.mapv_inplace(|v| (v - mean) / scale);
        }
        out
    }

    pub fn transform_row(&self, row: ArrayView1<'_, f64>) -> Array1<f64> {
        Array1::from_shape_fn(row.len(), |col| (row[col] - self.mean[col]) / self.scale[col])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn standardizes_columns_and_keeps_constant_columns_finite() {
        let x = array![[1.0, 5.0], [3.0, 5.0], [5.0, 5.0]];
        let scaler = StandardScaler::fit(x.view());
        let z = scaler.transform(x.view());
        assert!((z[[0, 0]] + 1.224_744_871).abs() < 1e-6);
        assert_eq!(z[[1, 0]], 0.0);
        assert!(z.column(1).iter().all(|v| *v == 0.0));

        let row = scaler.transform_row(array![3.0, 7.0].view());
        assert_eq!(row[0], 0.0);
        assert_eq!(row[1], 2.0);
    }
}
