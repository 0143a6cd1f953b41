//! Training task description and hyper-parameters

use crate::error::{DcpError, Result};
use crate::evaluation::split::EvalRule;
use serde::{Deserialize, Serialize};

/// Supported two-party algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    /// Linear regression, vertical partition
    LinRegVL,
    /// Logistic regression, vertical partition
    LogRegVL,
}

impl Algorithm {
    pub fn is_logistic(&self) -> bool {
        matches!(self, Algorithm::LogRegVL)
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Algorithm::LinRegVL => write!(f, "LinReg_VL"),
            Algorithm::LogRegVL => write!(f, "LogReg_VL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RegMode {
    #[default]
    None,
    /// L1 penalty, `(λ/m)·sgn(θ)`
    Lasso,
    /// L2 penalty, `(λ/m)·θ`
    Ridge,
}

/// Hyper-parameters shared by both parties of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainParams {
    /// Learning rate
    pub alpha: f64,
    /// Regularization strength
    pub lambda: f64,
    pub reg_mode: RegMode,
    /// Convergence threshold on the cost delta
    pub amplitude: f64,
    /// Decimal digits of fixed-point precision
    pub accuracy: u32,
    pub id_name: String,
    /// Label column (only present on the tag party)
    pub label: String,
    /// Positive class value for logistic regression
    pub label_name: Option<String>,
    pub is_tag_part: bool,
    /// 0 = full batch
    pub batch_size: usize,
    pub max_rounds: u64,
    /// Decision threshold for logistic prediction
    pub threshold: f64,
}

impl Default for TrainParams {
    fn default() -> Self {
        Self {
            alpha: 0.1,
            lambda: 0.0,
            reg_mode: RegMode::None,
            amplitude: 1e-4,
            accuracy: 10,
            id_name: "id".to_string(),
            label: String::new(),
            label_name: None,
            is_tag_part: false,
            batch_size: 0,
            max_rounds: 2000,
            threshold: 0.5,
        }
    }
}

impl TrainParams {
    pub fn validate(&self, algorithm: Algorithm) -> Result<()> {
        if !(self.alpha > 0.0 && self.alpha.is_finite()) {
            return Err(DcpError::Param(format!("alpha must be positive, got {}", self.alpha)));
        }
        if self.lambda < 0.0 {
            return Err(DcpError::Param("lambda must not be negative".into()));
        }
        if self.amplitude <= 0.0 {
            return Err(DcpError::Param("amplitude must be positive".into()));
        }
        if self.accuracy == 0 || self.accuracy > 15 {
            return Err(DcpError::Param(format!(
                "accuracy {} outside 1..=15",
                self.accuracy
            )));
        }
        if self.id_name.is_empty() {
            return Err(DcpError::Param("id_name is empty".into()));
        }
        if self.is_tag_part && self.label.is_empty() {
            return Err(DcpError::Param("label party must name its label column".into()));
        }
        if self.is_tag_part && algorithm.is_logistic() && self.label_name.is_none() {
            return Err(DcpError::Param("logistic regression needs label_name".into()));
        }
        if self.max_rounds == 0 {
            return Err(DcpError::Param("max_rounds must be positive".into()));
        }
        Ok(())
    }
}

/// Offline evaluation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalParams {
    pub enable: bool,
    pub rule: EvalRule,
}

/// Interleaved evaluation during training
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveEvalParams {
    pub enable: bool,
    /// Pause every N rounds
    pub trigger_interval: u64,
    /// Percentage of aligned rows held out for validation
    pub percent_lo: u32,
}

impl Default for LiveEvalParams {
    fn default() -> Self {
        Self {
            enable: false,
            trigger_interval: 5,
            percent_lo: 10,
        }
    }
}

/// How a learner treats the stop signal and who it reports to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Task started by a user request
    UserLearner,
    /// Fold task spawned by an Evaluator
    EvalLearner,
    /// Validation twin spawned by a LiveEvaluator; ignores user stop
    LiveEvalInnerLearner,
}

impl Role {
    pub fn honours_stop(&self) -> bool {
        !matches!(self, Role::LiveEvalInnerLearner)
    }
}

/// Everything needed to start one party's half of a training task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainTask {
    pub task_id: String,
    pub algorithm: Algorithm,
    pub params: TrainParams,
    /// Address of the other party
    pub peer: String,
    pub eval_params: Option<EvalParams>,
    pub lival_params: Option<LiveEvalParams>,
}

impl TrainTask {
    pub fn validate(&self) -> Result<()> {
        if self.task_id.is_empty() {
            return Err(DcpError::Param("task id is empty".into()));
        }
        if self.peer.is_empty() {
            return Err(DcpError::Param("task has no peer".into()));
        }
        self.params.validate(self.algorithm)?;
        if let Some(lp) = &self.lival_params {
            if lp.enable && (lp.trigger_interval == 0 || lp.percent_lo == 0 || lp.percent_lo >= 100) {
                return Err(DcpError::Param("invalid live evaluation parameters".into()));
            }
        }
        Ok(())
    }

    /// Interval at which the main learner pauses for live evaluation
    pub fn pause_interval(&self) -> Option<u64> {
        self.lival_params
            .as_ref()
            .filter(|lp| lp.enable)
            .map(|lp| lp.trigger_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_params_validate_for_feature_party() {
        assert!(TrainParams::default().validate(Algorithm::LinRegVL).is_ok());
    }

    #[test]
    fn test_label_party_requirements() {
        let mut p = TrainParams {
            is_tag_part: true,
            ..TrainParams::default()
        };
        assert!(p.validate(Algorithm::LinRegVL).is_err());
        p.label = "y".into();
        assert!(p.validate(Algorithm::LinRegVL).is_ok());
        assert!(p.validate(Algorithm::LogRegVL).is_err());
        p.label_name = Some("yes".into());
        assert!(p.validate(Algorithm::LogRegVL).is_ok());
    }

    #[test]
    fn test_inner_learner_ignores_stop() {
        assert!(Role::UserLearner.honours_stop());
        assert!(Role::EvalLearner.honours_stop());
        assert!(!Role::LiveEvalInnerLearner.honours_stop());
    }

    #[test]
    fn test_pause_interval_only_when_enabled() {
        let mut task = TrainTask {
            task_id: "t".into(),
            algorithm: Algorithm::LinRegVL,
            params: TrainParams::default(),
            peer: "peer".into(),
            eval_params: None,
            lival_params: Some(LiveEvalParams::default()),
        };
        assert_eq!(task.pause_interval(), None);
        task.lival_params = Some(LiveEvalParams {
            enable: true,
            ..LiveEvalParams::default()
        });
        assert_eq!(task.pause_interval(), Some(5));
    }
}
