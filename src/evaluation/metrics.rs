//! Evaluation metrics for regression and binary classification

use crate::error::{DcpError, Result};
use crate::vfl::{Algorithm, PredictResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassificationMetrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub auc: f64,
}

/// Metrics of one fold
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum FoldMetrics {
    Regression { rmse: f64 },
    Classification(ClassificationMetrics),
}

/// Aggregate over all folds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Summary {
    Regression { rmse_mean: f64, rmse_std: f64 },
    Classification(ClassificationMetrics),
}

pub fn rmse(predicted: &[f64], truth: &[f64]) -> Result<f64> {
    check_lengths(predicted.len(), truth.len())?;
    let sum: f64 = predicted
        .iter()
        .zip(truth)
        .map(|(p, t)| (p - t) * (p - t))
        .sum();
    Ok((sum / predicted.len() as f64).sqrt())
}

fn check_lengths(predicted: usize, truth: usize) -> Result<()> {
    if predicted != truth || predicted == 0 {
        return Err(DcpError::GetPredictSet(format!(
            "{} predictions for {} labels",
            predicted, truth
        )));
    }
    Ok(())
}

/// Area under the ROC curve by the rank-sum formula, ties averaged.
/// A fold holding a single class scores 0.5.
pub fn auc(scores: &[f64], labels: &[f64]) -> Result<f64> {
    check_lengths(scores.len(), labels.len())?;
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|a, b| scores[*a].total_cmp(&scores[*b]));

    let mut ranks = vec![0.0; scores.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        let avg = (i + j) as f64 / 2.0 + 1.0;
        for k in i..=j {
            ranks[order[k]] = avg;
        }
        i = j + 1;
    }

    let positives = labels.iter().filter(|l| **l >= 0.5).count();
    let negatives = labels.len() - positives;
    if positives == 0 || negatives == 0 {
        return Ok(0.5);
    }
    let pos_rank_sum: f64 = labels
        .iter()
        .zip(&ranks)
        .filter(|(l, _)| **l >= 0.5)
        .map(|(_, r)| r)
        .sum();
    let p = positives as f64;
    Ok((pos_rank_sum - p * (p + 1.0) / 2.0) / (p * negatives as f64))
}

pub fn classification(probs: &[f64], labels: &[f64], threshold: f64) -> Result<ClassificationMetrics> {
    check_lengths(probs.len(), labels.len())?;
    let (mut tp, mut fp, mut tn, mut fn_) = (0usize, 0usize, 0usize, 0usize);
    for (p, l) in probs.iter().zip(labels) {
        match (*p >= threshold, *l >= 0.5) {
            (true, true) => tp += 1,
            (true, false) => fp += 1,
            (false, false) => tn += 1,
            (false, true) => fn_ += 1,
        }
    }
    let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };
    let precision = ratio(tp, tp + fp);
    let recall = ratio(tp, tp + fn_);
    let f1 = if precision + recall == 0.0 {
        0.0
    } else {
        2.0 * precision * recall / (precision + recall)
    };
    Ok(ClassificationMetrics {
        accuracy: ratio(tp + tn, probs.len()),
        precision,
        recall,
        f1,
        auc: auc(probs, labels)?,
    })
}

/// Metrics of one prediction; `None` on the party without labels
pub fn evaluate(result: &PredictResult, threshold: f64) -> Result<Option<FoldMetrics>> {
    let labels = match &result.labels {
        Some(l) => l,
        None => return Ok(None),
    };
    let metrics = match result.algorithm {
        Algorithm::LinRegVL => FoldMetrics::Regression {
            rmse: rmse(&result.values, labels)?,
        },
        Algorithm::LogRegVL => {
            FoldMetrics::Classification(classification(&result.values, labels, threshold)?)
        }
    };
    Ok(Some(metrics))
}

/// Mean and population std of RMSE, or averaged classification metrics
pub fn aggregate(folds: &[FoldMetrics]) -> Result<Summary> {
    if folds.is_empty() {
        return Err(DcpError::Param("no fold metrics to aggregate".into()));
    }
    let n = folds.len() as f64;
    match folds[0] {
        FoldMetrics::Regression { .. } => {
            let values = folds
                .iter()
                .map(|f| match f {
                    FoldMetrics::Regression { rmse } => Ok(*rmse),
                    _ => Err(DcpError::Internal("mixed fold metric kinds".into())),
                })
                .collect::<Result<Vec<f64>>>()?;
            let mean = values.iter().sum::<f64>() / n;
            let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
            Ok(Summary::Regression {
                rmse_mean: mean,
                rmse_std: var.sqrt(),
            })
        }
        FoldMetrics::Classification(_) => {
            let mut acc = ClassificationMetrics {
                accuracy: 0.0,
                precision: 0.0,
                recall: 0.0,
                f1: 0.0,
                auc: 0.0,
            };
            for f in folds {
                let m = match f {
                    FoldMetrics::Classification(m) => m,
                    _ => return Err(DcpError::Internal("mixed fold metric kinds".into())),
                };
                acc.accuracy += m.accuracy / n;
                acc.precision += m.precision / n;
                acc.recall += m.recall / n;
                acc.f1 += m.f1 / n;
                acc.auc += m.auc / n;
            }
            Ok(Summary::Classification(acc))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rmse() {
        assert!((rmse(&[1.0, 3.0], &[1.0, 1.0]).unwrap() - 2f64.sqrt()).abs() < 1e-12);
        assert!(rmse(&[1.0], &[]).is_err());
    }

    #[test]
    fn test_auc_perfect_and_inverted() {
        let labels = [0.0, 0.0, 1.0, 1.0];
        assert_eq!(auc(&[0.1, 0.2, 0.8, 0.9], &labels).unwrap(), 1.0);
        assert_eq!(auc(&[0.9, 0.8, 0.2, 0.1], &labels).unwrap(), 0.0);
        assert_eq!(auc(&[0.5, 0.5, 0.5, 0.5], &labels).unwrap(), 0.5);
        assert_eq!(auc(&[0.3, 0.4], &[1.0, 1.0]).unwrap(), 0.5);
    }

    #[test]
    fn test_classification_counts() {
        let m = classification(&[0.9, 0.7, 0.2, 0.6], &[1.0, 0.0, 0.0, 1.0], 0.5).unwrap();
        assert_eq!(m.accuracy, 0.75);
        assert!((m.precision - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(m.recall, 1.0);
        assert!((m.f1 - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_aggregate_regression() {
        let s = aggregate(&[
            FoldMetrics::Regression { rmse: 1.0 },
            FoldMetrics::Regression { rmse: 3.0 },
        ])
        .unwrap();
        assert_eq!(
            s,
            Summary::Regression {
                rmse_mean: 2.0,
                rmse_std: 1.0
            }
        );
        assert!(aggregate(&[]).is_err());
    }

    #[test]
    fn test_evaluate_without_labels() {
        let r = PredictResult {
            task_id: "t".into(),
            algorithm: Algorithm::LinRegVL,
            ids: vec!["1".into()],
            values: vec![1.0],
            labels: None,
        };
        assert_eq!(evaluate(&r, 0.5).unwrap(), None);
    }
}
