//! Live evaluation interleaved with training
//!
//! The aligned rows are split once into a training part and a hold-out
//! part. An inner learner (`{task}_LiveEval`) trains on the training part
//! alongside the main learner. Both pause every `trigger_interval` rounds;
//! at each pause the inner model scores the hold-out rows
//! (`{task}_LiveEval_predict_{round}`) and the main learner is released
//! once the scores are back.

use super::metrics::{self, FoldMetrics};
use super::split::{self, EvalRule};
use super::EvalCommand;
use crate::error::{DcpError, Result};
use crate::vfl::{DataSet, Model, PredictResult, Role, TrainMessage, TrainPayload, TrainTask};
use log::{info, warn};
use serde::{Deserialize, Serialize};

/// What a main-learner pause asks of the evaluator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveTrigger {
    /// First pause: create and start the inner learner
    SetAndRun,
    /// Later pauses: advance the inner learner to the next pause round
    GoOn { from_round: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveRecord {
    pub round: u64,
    pub metrics: Option<FoldMetrics>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveEvalReport {
    pub task_id: String,
    pub records: Vec<LiveRecord>,
}

#[derive(Debug, Clone)]
enum InnerState {
    NotStarted,
    Running,
    Paused { round: u64, model: Model },
    Finished { model: Model },
    Stopped,
}

pub struct LiveEvaluator {
    task: TrainTask,
    local: String,
    interval: u64,
    train_set: DataSet,
    test_set: DataSet,
    inner: InnerState,
    main_paused: Option<u64>,
    predicting: Option<u64>,
    records: Vec<LiveRecord>,
    done: bool,
}

impl LiveEvaluator {
    pub fn new(task: &TrainTask, local: &str, data: DataSet) -> Result<Self> {
        let params = task
            .lival_params
            .as_ref()
            .filter(|p| p.enable)
            .ok_or_else(|| DcpError::StartTask(format!("{}: live evaluation disabled", task.task_id)))?;
        let rule = EvalRule::RandomSplit {
            percent_lo: params.percent_lo,
        };
        let folds = split::split_indices(&rule, data.len(), &inner_task_id(&task.task_id))?;
        let fold = folds
            .first()
            .ok_or_else(|| DcpError::DataSetSplit(format!("{}: no hold-out fold", task.task_id)))?;
        let (train_set, test_set) = split::split_dataset(&data, fold)?;
        Ok(Self {
            task: task.clone(),
            local: local.to_string(),
            interval: params.trigger_interval,
            train_set,
            test_set,
            inner: InnerState::NotStarted,
            main_paused: None,
            predicting: None,
            records: Vec::new(),
            done: false,
        })
    }

    pub fn task_id(&self) -> &str {
        &self.task.task_id
    }

    pub fn inner_task_id(&self) -> String {
        inner_task_id(&self.task.task_id)
    }

    /// Round of the predict task id, if `task_id` is one of ours
    pub fn predict_round(&self, task_id: &str) -> Option<u64> {
        task_id
            .strip_prefix(&format!("{}_predict_", self.inner_task_id()))
            .and_then(|r| r.parse().ok())
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    fn continue_msg(&self, task_id: String, pause_round: u64) -> EvalCommand {
        EvalCommand::SendLocal(TrainMessage {
            task_id,
            from: self.local.clone(),
            to: self.local.clone(),
            loop_round: pause_round,
            payload: TrainPayload::MsgContinueLoop { pause_round },
        })
    }

    /// The main learner paused at `round`
    pub fn on_main_paused(&mut self, round: u64) -> Result<Vec<EvalCommand>> {
        if self.done {
            return Ok(vec![self.continue_msg(self.task.task_id.clone(), round)]);
        }
        if let Some(pending) = self.main_paused {
            return Err(DcpError::TriggerTooMuch(format!(
                "{}: pause at {} while round {} is pending",
                self.task.task_id, round, pending
            )));
        }
        self.main_paused = Some(round);
        let trigger = match &self.inner {
            InnerState::NotStarted => LiveTrigger::SetAndRun,
            InnerState::Paused { round: at, .. } if *at < round => LiveTrigger::GoOn { from_round: *at },
            _ => return Ok(self.try_predict()),
        };
        info!("[{}] live evaluation trigger {:?} at round {}", self.task.task_id, trigger, round);
        let mut out = Vec::new();
        match trigger {
            LiveTrigger::SetAndRun => {
                let mut inner = self.task.clone();
                inner.task_id = self.inner_task_id();
                inner.eval_params = None;
                self.inner = InnerState::Running;
                out.push(EvalCommand::StartTrain {
                    task: inner,
                    role: Role::LiveEvalInnerLearner,
                    data: self.train_set.clone(),
                });
            }
            LiveTrigger::GoOn { from_round } => {
                self.inner = InnerState::Running;
                out.push(self.continue_msg(self.inner_task_id(), from_round));
            }
        }
        Ok(out)
    }

    pub fn on_inner_paused(&mut self, round: u64, model: Model) -> Vec<EvalCommand> {
        if matches!(self.inner, InnerState::Stopped) {
            return Vec::new();
        }
        self.inner = InnerState::Paused { round, model };
        self.try_predict()
    }

    pub fn on_inner_finished(&mut self, model: Model) -> Vec<EvalCommand> {
        self.inner = InnerState::Finished { model };
        self.try_predict()
    }

    /// The inner learner failed; keep releasing the main learner unscored
    pub fn on_inner_failed(&mut self, error: &str) -> Vec<EvalCommand> {
        warn!("[{}] live evaluation learner failed: {}", self.task.task_id, error);
        self.inner = InnerState::Stopped;
        self.release_unscored(error)
    }

    fn release_unscored(&mut self, error: &str) -> Vec<EvalCommand> {
        match self.main_paused.take() {
            Some(round) if self.predicting.is_none() => {
                self.records.push(LiveRecord {
                    round,
                    metrics: None,
                    error: Some(error.to_string()),
                });
                vec![self.continue_msg(self.task.task_id.clone(), round)]
            }
            other => {
                self.main_paused = other;
                Vec::new()
            }
        }
    }

    fn try_predict(&mut self) -> Vec<EvalCommand> {
        let round = match (self.main_paused, self.predicting) {
            (Some(r), None) => r,
            _ => return Vec::new(),
        };
        let model = match &self.inner {
            InnerState::Paused { round: at, model } if *at == round => model.clone(),
            InnerState::Finished { model } => model.clone(),
            InnerState::Stopped => return self.release_unscored("live evaluation learner stopped"),
            _ => return Vec::new(),
        };
        self.predicting = Some(round);
        vec![EvalCommand::StartPredict {
            task_id: predict_task_id(&self.task.task_id, round),
            model,
            data: self.test_set.clone(),
        }]
    }

    /// Scores for the pause at `round` are back; release the main learner
    pub fn on_predicted(&mut self, round: u64, result: &PredictResult) -> Vec<EvalCommand> {
        let record = match metrics::evaluate(result, self.task.params.threshold) {
            Ok(metrics) => LiveRecord {
                round,
                metrics,
                error: None,
            },
            Err(e) => LiveRecord {
                round,
                metrics: None,
                error: Some(e.to_string()),
            },
        };
        info!("[{}] live evaluation at round {}: {:?}", self.task.task_id, round, record.metrics);
        self.finish_round(round, record)
    }

    pub fn on_predict_failed(&mut self, round: u64, error: &str) -> Vec<EvalCommand> {
        warn!("[{}] live prediction at round {} failed: {}", self.task.task_id, round, error);
        let record = LiveRecord {
            round,
            metrics: None,
            error: Some(error.to_string()),
        };
        self.finish_round(round, record)
    }

    fn finish_round(&mut self, round: u64, record: LiveRecord) -> Vec<EvalCommand> {
        if self.predicting != Some(round) {
            warn!("[{}] unexpected live result for round {}", self.task.task_id, round);
            return Vec::new();
        }
        self.predicting = None;
        self.main_paused = None;
        self.records.push(record);
        vec![self.continue_msg(self.task.task_id.clone(), round)]
    }

    /// The main learner ended; stop the inner learner and report
    pub fn on_main_finished(&mut self) -> Vec<EvalCommand> {
        if self.done {
            return Vec::new();
        }
        self.done = true;
        let mut out = Vec::new();
        if matches!(self.inner, InnerState::Running | InnerState::Paused { .. }) {
            out.push(EvalCommand::Stop {
                task_id: self.inner_task_id(),
            });
        }
        self.inner = InnerState::Stopped;
        out.push(EvalCommand::LiveReport(LiveEvalReport {
            task_id: self.task.task_id.clone(),
            records: self.records.clone(),
        }));
        out
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }
}

pub fn inner_task_id(task_id: &str) -> String {
    format!("{}_LiveEval", task_id)
}

pub fn predict_task_id(task_id: &str, round: u64) -> String {
    format!("{}_LiveEval_predict_{}", task_id, round)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfl::{Algorithm, LiveEvalParams, TrainParams};
    use nalgebra::DVector;

    fn task() -> TrainTask {
        TrainTask {
            task_id: "job".into(),
            algorithm: Algorithm::LinRegVL,
            params: TrainParams::default(),
            peer: "peer".into(),
            eval_params: None,
            lival_params: Some(LiveEvalParams {
                enable: true,
                trigger_interval: 2,
                percent_lo: 20,
            }),
        }
    }

    fn data() -> DataSet {
        DataSet {
            id_name: "id".into(),
            ids: (0..10).map(|i| i.to_string()).collect(),
            features: vec!["x".into()],
            rows: (0..10).map(|i| vec![i as f64]).collect(),
            label: Some("y".into()),
            labels: Some((0..10).map(|i| i as f64).collect()),
        }
    }

    fn model() -> Model {
        Model::from_theta(
            Algorithm::LinRegVL,
            &DVector::from_vec(vec![0.0, 1.0]),
            &["x".to_string()],
            &[0.0],
            &[1.0],
            Some(("y", 0.0, 1.0)),
            None,
            "id",
        )
    }

    fn result(n: usize) -> PredictResult {
        PredictResult {
            task_id: "p".into(),
            algorithm: Algorithm::LinRegVL,
            ids: vec![String::new(); n],
            values: vec![1.0; n],
            labels: Some(vec![1.0; n]),
        }
    }

    fn continued(cmds: &[EvalCommand], task_id: &str, round: u64) -> bool {
        cmds.iter().any(|c| match c {
            EvalCommand::SendLocal(m) => {
                m.task_id == task_id
                    && matches!(m.payload, TrainPayload::MsgContinueLoop { pause_round } if pause_round == round)
            }
            _ => false,
        })
    }

    #[test]
    fn test_pause_cycle() {
        let mut live = LiveEvaluator::new(&task(), "A", data()).unwrap();
        let cmds = live.on_main_paused(2).unwrap();
        match &cmds[0] {
            EvalCommand::StartTrain { task, role, data } => {
                assert_eq!(task.task_id, "job_LiveEval");
                assert_eq!(*role, Role::LiveEvalInnerLearner);
                assert_eq!(data.len(), 8);
            }
            other => panic!("unexpected {:?}", other),
        }
        let cmds = live.on_inner_paused(2, model());
        match &cmds[0] {
            EvalCommand::StartPredict { task_id, data, .. } => {
                assert_eq!(task_id, "job_LiveEval_predict_2");
                assert_eq!(data.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(live.predict_round("job_LiveEval_predict_2"), Some(2));
        let cmds = live.on_predicted(2, &result(2));
        assert!(continued(&cmds, "job", 2));

        // second trigger advances the inner learner
        let cmds = live.on_main_paused(4).unwrap();
        assert!(continued(&cmds, "job_LiveEval", 2));
        assert!(live.on_inner_paused(4, model()).len() == 1);
        assert!(continued(&live.on_predict_failed(4, "peer gone"), "job", 4));

        let cmds = live.on_main_finished();
        assert!(matches!(&cmds[0], EvalCommand::Stop { task_id } if task_id == "job_LiveEval"));
        match &cmds[1] {
            EvalCommand::LiveReport(report) => {
                assert_eq!(report.records.len(), 2);
                assert_eq!(report.records[0].metrics, Some(FoldMetrics::Regression { rmse: 0.0 }));
                assert!(report.records[1].error.is_some());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_finished_inner_model_is_reused() {
        let mut live = LiveEvaluator::new(&task(), "A", data()).unwrap();
        live.on_main_paused(2).unwrap();
        live.on_inner_paused(2, model());
        live.on_predicted(2, &result(2));
        live.on_main_paused(4).unwrap();
        let cmds = live.on_inner_finished(model());
        assert!(matches!(&cmds[0], EvalCommand::StartPredict { task_id, .. } if task_id == "job_LiveEval_predict_4"));
    }

    #[test]
    fn test_double_trigger_rejected() {
        let mut live = LiveEvaluator::new(&task(), "A", data()).unwrap();
        live.on_main_paused(2).unwrap();
        let err = live.on_main_paused(4).unwrap_err();
        assert_eq!(err.code(), 10012);
    }

    #[test]
    fn test_inner_failure_releases_main() {
        let mut live = LiveEvaluator::new(&task(), "A", data()).unwrap();
        live.on_main_paused(2).unwrap();
        let cmds = live.on_inner_failed("boom");
        assert!(continued(&cmds, "job", 2));
        // later pauses pass straight through
        assert!(continued(&live.on_main_paused(4).unwrap(), "job", 4));
    }
}
