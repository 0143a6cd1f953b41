//! Sinks for task outcomes

use crate::error::{ErrorBody, Result};
use crate::evaluation::{EvalReport, LiveEvalReport};
use crate::vfl::{Model, PredictResult};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

/// Where final task results go
pub trait ResultHandler: Send + Sync {
    fn save_model(&self, task_id: &str, model: &Model) -> Result<()>;
    fn save_predict_result(&self, result: &PredictResult) -> Result<()>;
    fn save_predict_and_evaluate_result(&self, report: &EvalReport) -> Result<()>;
    fn save_live_evaluate_result(&self, report: &LiveEvalReport) -> Result<()>;
    /// Final failed result of a task
    fn save_failure(&self, task_id: &str, error: &ErrorBody) -> Result<()>;
}

/// Everything a node has produced so far
#[derive(Debug, Default, Clone)]
pub struct Outcomes {
    pub models: HashMap<String, Model>,
    pub predictions: HashMap<String, PredictResult>,
    pub evaluations: HashMap<String, EvalReport>,
    pub live_evaluations: HashMap<String, LiveEvalReport>,
    pub failures: HashMap<String, ErrorBody>,
}

/// In-memory results with async waiting, used by tests and the demo
#[derive(Debug, Default)]
pub struct MemoryResults {
    outcomes: Mutex<Outcomes>,
    changed: Notify,
}

impl MemoryResults {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, f: impl FnOnce(&mut Outcomes)) -> Result<()> {
        if let Ok(mut o) = self.outcomes.lock() {
            f(&mut o);
        }
        self.changed.notify_waiters();
        Ok(())
    }

    pub fn snapshot(&self) -> Outcomes {
        self.outcomes.lock().map(|o| o.clone()).unwrap_or_default()
    }

    /// Wait until `pick` finds something, or give up after `deadline`
    pub async fn wait_for<T>(&self, deadline: Duration, pick: impl Fn(&Outcomes) -> Option<T>) -> Option<T> {
        let wait = async {
            loop {
                let notified = self.changed.notified();
                if let Some(found) = self.outcomes.lock().ok().and_then(|o| pick(&o)) {
                    return found;
                }
                notified.await;
            }
        };
        tokio::time::timeout(deadline, wait).await.ok()
    }
}

impl ResultHandler for MemoryResults {
    fn save_model(&self, task_id: &str, model: &Model) -> Result<()> {
        self.update(|o| {
            o.models.insert(task_id.to_string(), model.clone());
        })
    }

    fn save_predict_result(&self, result: &PredictResult) -> Result<()> {
        self.update(|o| {
            o.predictions.insert(result.task_id.clone(), result.clone());
        })
    }

    fn save_predict_and_evaluate_result(&self, report: &EvalReport) -> Result<()> {
        self.update(|o| {
            o.evaluations.insert(report.task_id.clone(), report.clone());
        })
    }

    fn save_live_evaluate_result(&self, report: &LiveEvalReport) -> Result<()> {
        self.update(|o| {
            o.live_evaluations.insert(report.task_id.clone(), report.clone());
        })
    }

    fn save_failure(&self, task_id: &str, error: &ErrorBody) -> Result<()> {
        self.update(|o| {
            o.failures.insert(task_id.to_string(), error.clone());
        })
    }
}

/// JSON files under one directory: `<task_id>.<kind>.json`
#[derive(Debug, Clone)]
pub struct FileResults {
    dir: PathBuf,
}

impl FileResults {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self { dir: dir.to_path_buf() })
    }

    pub fn path(&self, task_id: &str, kind: &str) -> PathBuf {
        self.dir.join(format!("{}.{}.json", task_id, kind))
    }

    fn write<T: Serialize>(&self, task_id: &str, kind: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(value)?;
        std::fs::write(self.path(task_id, kind), json)?;
        Ok(())
    }
}

impl ResultHandler for FileResults {
    fn save_model(&self, task_id: &str, model: &Model) -> Result<()> {
        model.save(&self.path(task_id, "model"))
    }

    fn save_predict_result(&self, result: &PredictResult) -> Result<()> {
        self.write(&result.task_id, "predict", result)
    }

    fn save_predict_and_evaluate_result(&self, report: &EvalReport) -> Result<()> {
        self.write(&report.task_id, "evaluation", report)
    }

    fn save_live_evaluate_result(&self, report: &LiveEvalReport) -> Result<()> {
        self.write(&report.task_id, "live_evaluation", report)
    }

    fn save_failure(&self, task_id: &str, error: &ErrorBody) -> Result<()> {
        self.write(task_id, "failure", error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DcpError;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_wait_for_failure() {
        let results = Arc::new(MemoryResults::new());
        let writer = results.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer
                .save_failure("t", &DcpError::RpcConnect("gone".into()).body())
                .unwrap();
        });
        let body = results
            .wait_for(Duration::from_secs(5), |o| o.failures.get("t").cloned())
            .await
            .unwrap();
        assert_eq!(body.code, 10006);
        assert!(results
            .wait_for(Duration::from_millis(10), |o| o.models.get("t").cloned())
            .await
            .is_none());
    }

    #[test]
    fn test_file_results_layout() {
        let dir = std::env::temp_dir().join(format!("dcp-results-{}", uuid::Uuid::new_v4()));
        let results = FileResults::new(&dir).unwrap();
        results
            .save_failure("job", &DcpError::NotFound("x".into()).body())
            .unwrap();
        let text = std::fs::read_to_string(results.path("job", "failure")).unwrap();
        assert!(text.contains("10002"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
