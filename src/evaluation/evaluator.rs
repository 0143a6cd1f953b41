//! Offline evaluation of a training task
//!
//! For every fold `i` the evaluator trains `{task}_{i}_train_Eva` on the
//! training rows, then scores the held-out rows with
//! `{task}_{i}_predict_Eva`. Once each fold has an outcome it aggregates
//! the metrics into one report.

use super::metrics::{self, FoldMetrics, Summary};
use super::split::{self, EvalRule, Fold};
use super::EvalCommand;
use crate::error::{DcpError, Result};
use crate::vfl::{DataSet, Model, PredictResult, Role, TrainTask};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Train,
    Predict,
}

/// Outcome of one fold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoldOutcome {
    pub index: usize,
    pub test_rows: usize,
    /// `None` on the party without labels or when the fold failed
    pub metrics: Option<FoldMetrics>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalReport {
    pub task_id: String,
    pub rule: EvalRule,
    pub folds: Vec<FoldOutcome>,
    pub summary: Option<Summary>,
}

#[derive(Debug)]
pub struct Evaluator {
    task: TrainTask,
    rule: EvalRule,
    data: DataSet,
    folds: Vec<Fold>,
    children: HashMap<String, (usize, Stage)>,
    outcomes: BTreeMap<usize, FoldOutcome>,
    reported: bool,
}

impl Evaluator {
    pub fn new(task: &TrainTask, data: DataSet) -> Result<Self> {
        let rule = task
            .eval_params
            .as_ref()
            .filter(|p| p.enable)
            .map(|p| p.rule.clone())
            .ok_or_else(|| DcpError::StartTask(format!("{}: evaluation disabled", task.task_id)))?;
        let folds = split::split_indices(&rule, data.len(), &task.task_id)?;
        let mut children = HashMap::new();
        for f in &folds {
            children.insert(train_task_id(&task.task_id, f.index), (f.index, Stage::Train));
            children.insert(predict_task_id(&task.task_id, f.index), (f.index, Stage::Predict));
        }
        Ok(Self {
            task: task.clone(),
            rule,
            data,
            folds,
            children,
            outcomes: BTreeMap::new(),
            reported: false,
        })
    }

    pub fn task_id(&self) -> &str {
        &self.task.task_id
    }

    pub fn fold_count(&self) -> usize {
        self.folds.len()
    }

    /// Fold and stage of a child task id
    pub fn child(&self, task_id: &str) -> Option<(usize, Stage)> {
        self.children.get(task_id).copied()
    }

    pub fn is_done(&self) -> bool {
        self.reported
    }

    /// Start the training task of every fold
    pub fn start(&self) -> Result<Vec<EvalCommand>> {
        info!(
            "[{}] evaluation with {:?}: {} folds over {} rows",
            self.task.task_id,
            self.rule,
            self.folds.len(),
            self.data.len()
        );
        self.folds
            .iter()
            .map(|fold| {
                let (train, _) = split::split_dataset(&self.data, fold)?;
                let mut task = self.task.clone();
                task.task_id = train_task_id(&self.task.task_id, fold.index);
                task.eval_params = None;
                task.lival_params = None;
                Ok(EvalCommand::StartTrain {
                    task,
                    role: Role::EvalLearner,
                    data: train,
                })
            })
            .collect()
    }

    /// A fold's model is trained; score its held-out rows
    pub fn on_trained(&mut self, fold: usize, model: Model) -> Result<Vec<EvalCommand>> {
        let f = self
            .folds
            .get(fold)
            .ok_or_else(|| DcpError::NotFound(format!("{}: fold {}", self.task.task_id, fold)))?;
        let (_, test) = split::split_dataset(&self.data, f)?;
        Ok(vec![EvalCommand::StartPredict {
            task_id: predict_task_id(&self.task.task_id, fold),
            model,
            data: test,
        }])
    }

    /// Record a fold's predictions; later arrivals for the same fold are dropped
    pub fn save_predict_out(&mut self, fold: usize, result: &PredictResult) -> Result<Vec<EvalCommand>> {
        if self.outcomes.contains_key(&fold) {
            warn!("[{}] duplicate predictions for fold {} dropped", self.task.task_id, fold);
            return Ok(Vec::new());
        }
        let metrics = metrics::evaluate(result, self.task.params.threshold)?;
        self.outcomes.insert(
            fold,
            FoldOutcome {
                index: fold,
                test_rows: result.values.len(),
                metrics,
                error: None,
            },
        );
        Ok(self.try_report())
    }

    /// A fold's train or predict task failed
    pub fn on_failed(&mut self, fold: usize, error: &str) -> Vec<EvalCommand> {
        if self.outcomes.contains_key(&fold) {
            return Vec::new();
        }
        warn!("[{}] fold {} failed: {}", self.task.task_id, fold, error);
        let test_rows = self.folds.get(fold).map(|f| f.test.len()).unwrap_or(0);
        self.outcomes.insert(
            fold,
            FoldOutcome {
                index: fold,
                test_rows,
                metrics: None,
                error: Some(error.to_string()),
            },
        );
        self.try_report()
    }

    fn try_report(&mut self) -> Vec<EvalCommand> {
        if self.reported || self.outcomes.len() < self.folds.len() {
            return Vec::new();
        }
        self.reported = true;
        let folds: Vec<FoldOutcome> = self.outcomes.values().cloned().collect();
        let collected: Vec<FoldMetrics> = folds.iter().filter_map(|f| f.metrics).collect();
        let summary = if collected.is_empty() {
            None
        } else {
            match metrics::aggregate(&collected) {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!("[{}] cannot aggregate metrics: {}", self.task.task_id, e);
                    None
                }
            }
        };
        info!("[{}] evaluation finished: {:?}", self.task.task_id, summary);
        vec![EvalCommand::Report(EvalReport {
            task_id: self.task.task_id.clone(),
            rule: self.rule.clone(),
            folds,
            summary,
        })]
    }
}

pub fn train_task_id(task_id: &str, fold: usize) -> String {
    format!("{}_{}_train_Eva", task_id, fold)
}

pub fn predict_task_id(task_id: &str, fold: usize) -> String {
    format!("{}_{}_predict_Eva", task_id, fold)
}
