//! Evaluation rules and deterministic fold construction
//!
//! Both parties hold the aligned rows in the same order and seed the
//! shuffle from the task id, so each party computes identical folds
//! without exchanging row indices.

use crate::crypto::sha256;
use crate::error::{DcpError, Result};
use crate::vfl::DataSet;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// How the aligned rows are segmented
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum EvalRule {
    /// One fold holding out `percent_lo` percent of the rows
    RandomSplit { percent_lo: u32 },
    /// `folds` ∈ {5, 10}
    KFold { folds: usize, shuffle: bool },
    /// Leave-one-out
    Loo,
}

impl EvalRule {
    pub fn validate(&self) -> Result<()> {
        match self {
            EvalRule::RandomSplit { percent_lo } if *percent_lo == 0 || *percent_lo >= 100 => Err(
                DcpError::Param(format!("hold-out percentage {} out of range", percent_lo)),
            ),
            EvalRule::KFold { folds, .. } if *folds != 5 && *folds != 10 => {
                Err(DcpError::Param(format!("k-fold needs 5 or 10 folds, got {}", folds)))
            }
            _ => Ok(()),
        }
    }
}

/// Row indices of one fold, both sides ascending
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fold {
    pub index: usize,
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

fn rng_for(seed: &str) -> StdRng {
    StdRng::from_seed(sha256(seed.as_bytes()))
}

/// Build the folds of `rule` over `rows` rows, seeded by `seed`
pub fn split_indices(rule: &EvalRule, rows: usize, seed: &str) -> Result<Vec<Fold>> {
    rule.validate()?;
    let mut order: Vec<usize> = (0..rows).collect();
    let folds = match rule {
        EvalRule::RandomSplit { percent_lo } => {
            let test_len = ((rows as f64) * (*percent_lo as f64) / 100.0).round() as usize;
            let test_len = test_len.max(1);
            if rows < 2 || test_len >= rows {
                return Err(DcpError::DataSetSplit(format!(
                    "{} rows cannot hold out {}%",
                    rows, percent_lo
                )));
            }
            order.shuffle(&mut rng_for(seed));
            vec![make_fold(0, &order, 0..test_len)]
        }
        EvalRule::KFold { folds, shuffle } => {
            if rows < *folds {
                return Err(DcpError::DataSetSplit(format!(
                    "{} rows cannot form {} folds",
                    rows, folds
                )));
            }
            if *shuffle {
                order.shuffle(&mut rng_for(seed));
            }
            let base = rows / folds;
            let extra = rows % folds;
            let mut start = 0;
            (0..*folds)
                .map(|i| {
                    let len = base + usize::from(i < extra);
                    let fold = make_fold(i, &order, start..start + len);
                    start += len;
                    fold
                })
                .collect()
        }
        EvalRule::Loo => {
            if rows < 2 {
                return Err(DcpError::DataSetSplit(format!(
                    "leave-one-out needs at least 2 rows, got {}",
                    rows
                )));
            }
            (0..rows).map(|i| make_fold(i, &order, i..i + 1)).collect()
        }
    };
    Ok(folds)
}

fn make_fold(index: usize, order: &[usize], test_range: std::ops::Range<usize>) -> Fold {
    let mut test: Vec<usize> = order[test_range.clone()].to_vec();
    let mut train: Vec<usize> = order[..test_range.start]
        .iter()
        .chain(order[test_range.end..].iter())
        .copied()
        .collect();
    test.sort_unstable();
    train.sort_unstable();
    Fold { index, train, test }
}

/// Materialise the train and test sets of a fold
pub fn split_dataset(data: &DataSet, fold: &Fold) -> Result<(DataSet, DataSet)> {
    let train = data
        .select(&fold.train)
        .map_err(|e| DcpError::GetTrainSet(format!("fold {}: {}", fold.index, e)))?;
    let test = data
        .select(&fold.test)
        .map_err(|e| DcpError::GetPredictSet(format!("fold {}: {}", fold.index, e)))?;
    Ok((train, test))
}
