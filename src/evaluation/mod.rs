//! Model evaluation: offline folds and live hold-out scoring
//!
//! `Evaluator` and `LiveEvaluator` are pure orchestration state machines:
//! they consume learner/predictor outcomes and return `EvalCommand`s that the
//! MPC node executes (start sibling tasks, release paused learners, report).

pub mod evaluator;
pub mod live;
pub mod metrics;
pub mod split;

pub use evaluator::{EvalReport, Evaluator, FoldOutcome};
pub use live::{LiveEvalReport, LiveEvaluator, LiveRecord, LiveTrigger};
pub use metrics::{ClassificationMetrics, FoldMetrics, Summary};
pub use split::{EvalRule, Fold};

use crate::vfl::{DataSet, Model, Role, TrainMessage, TrainTask};

/// Work requested from the node by an evaluator
#[derive(Debug, Clone)]
pub enum EvalCommand {
    /// Start a learner on pre-aligned rows (delivered as `MsgTrainSet`)
    StartTrain {
        task: TrainTask,
        role: Role,
        data: DataSet,
    },
    /// Start a predictor on pre-aligned rows
    StartPredict {
        task_id: String,
        model: Model,
        data: DataSet,
    },
    /// Message to a local learner
    SendLocal(TrainMessage),
    /// Stop a child task regardless of its role
    Stop { task_id: String },
    Report(EvalReport),
    LiveReport(LiveEvalReport),
}
