//! Z-score standardization and design-matrix construction

use super::dataset::DataSet;
use super::params::Algorithm;
use crate::error::{DcpError, Result};
use nalgebra::{DMatrix, DVector};

/// Standard deviations below this are treated as a constant column
const MIN_SIGMA: f64 = 1e-12;

/// A party's design matrix ready for training
#[derive(Debug, Clone)]
pub struct Prepared {
    /// `m × (1 + d)`, first column is the bias
    pub x: DMatrix<f64>,
    /// Standardized (linear) or 0/1 (logistic) label, tag party only
    pub y: Option<DVector<f64>>,
    pub xbars: Vec<f64>,
    pub sigmas: Vec<f64>,
    /// `(mean, std)` of the label for linear de-standardization
    pub label_stats: Option<(f64, f64)>,
}

fn mean_std(values: impl Iterator<Item = f64> + Clone) -> (f64, f64) {
    let n = values.clone().count().max(1) as f64;
    let mean = values.clone().sum::<f64>() / n;
    let var = values.map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    let std = var.sqrt();
    (mean, if std < MIN_SIGMA { 1.0 } else { std })
}

/// Standardize features (and a linear label), prepend the bias column
pub fn standardize(ds: &DataSet, algorithm: Algorithm) -> Result<Prepared> {
    if ds.is_empty() {
        return Err(DcpError::GetTrainSet("empty training set".into()));
    }
    let d = ds.features.len();
    let (xbars, sigmas): (Vec<f64>, Vec<f64>) = (0..d)
        .map(|j| mean_std(ds.rows.iter().map(move |r| r[j])))
        .unzip();
    let x = design_matrix(ds, &xbars, &sigmas)?;

    let (y, label_stats) = match &ds.labels {
        Some(labels) if algorithm.is_logistic() => (Some(DVector::from_vec(labels.clone())), None),
        Some(labels) => {
            let (mean, std) = mean_std(labels.iter().copied());
            let y = DVector::from_iterator(labels.len(), labels.iter().map(|v| (v - mean) / std));
            (Some(y), Some((mean, std)))
        }
        None => (None, None),
    };

    Ok(Prepared {
        x,
        y,
        xbars,
        sigmas,
        label_stats,
    })
}

/// Apply known statistics to rows, e.g. at prediction time
pub fn design_matrix(ds: &DataSet, xbars: &[f64], sigmas: &[f64]) -> Result<DMatrix<f64>> {
    let d = ds.features.len();
    if xbars.len() != d || sigmas.len() != d {
        return Err(DcpError::Param(format!(
            "dataset has {} features, statistics cover {}",
            d,
            xbars.len()
        )));
    }
    let m = ds.len();
    let mut x = DMatrix::from_element(m, d + 1, 1.0);
    for (i, row) in ds.rows.iter().enumerate() {
        if row.len() != d {
            return Err(DcpError::Param(format!("row {} has {} values, expected {}", i, row.len(), d)));
        }
        for j in 0..d {
            x[(i, j + 1)] = (row[j] - xbars[j]) / sigmas[j];
        }
    }
    Ok(x)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset(labels: Option<Vec<f64>>) -> DataSet {
        DataSet {
            id_name: "id".into(),
            ids: vec!["1".into(), "2".into(), "3".into()],
            features: vec!["a".into(), "k".into()],
            rows: vec![vec![1.0, 7.0], vec![2.0, 7.0], vec![3.0, 7.0]],
            label: labels.as_ref().map(|_| "y".to_string()),
            labels,
        }
    }

    #[test]
    fn test_bias_and_zscore() {
        let p = standardize(&dataset(None), Algorithm::LinRegVL).unwrap();
        assert_eq!(p.x.ncols(), 3);
        assert!(p.x.column(0).iter().all(|v| (*v - 1.0).abs() < 1e-12));
        let col = p.x.column(1);
        assert!(col.iter().sum::<f64>().abs() < 1e-12);
        assert!((p.xbars[0] - 2.0).abs() < 1e-12);
        // constant column keeps sigma 1 and becomes zero
        assert_eq!(p.sigmas[1], 1.0);
        assert!(p.x.column(2).iter().all(|v| v.abs() < 1e-12));
    }

    #[test]
    fn test_logistic_label_untouched() {
        let p = standardize(&dataset(Some(vec![1.0, 0.0, 1.0])), Algorithm::LogRegVL).unwrap();
        assert_eq!(p.y.unwrap().as_slice(), &[1.0, 0.0, 1.0]);
        assert!(p.label_stats.is_none());
    }

    #[test]
    fn test_linear_label_standardized() {
        let p = standardize(&dataset(Some(vec![10.0, 20.0, 30.0])), Algorithm::LinRegVL).unwrap();
        let (mean, _) = p.label_stats.unwrap();
        assert!((mean - 20.0).abs() < 1e-12);
        assert!(p.y.unwrap().sum().abs() < 1e-12);
    }

    #[test]
    fn test_statistics_mismatch() {
        assert!(design_matrix(&dataset(None), &[0.0], &[1.0]).is_err());
    }
}
