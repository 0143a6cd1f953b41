//! MPC node: routes `Step` requests to task actors and coordinates
//! evaluators
//!
//! Inbound steps for a task that is not registered yet are stashed (the
//! peer may start a few messages earlier) and flushed when the task
//! registers. A coordinator task owns every `Evaluator` and `LiveEvaluator`
//! of the node and reacts to the events reported by actors.

use super::actor::{self, ActorContext, Inbound, StopKind, TaskEvent, TaskHandle};
use super::registry::Registry;
use super::result::ResultHandler;
use super::transport::Transport;
use super::wire::{StepAck, StepRequest};
use crate::error::{DcpError, ErrorBody, Result};
use crate::evaluation::evaluator::{self, Stage};
use crate::evaluation::{EvalCommand, Evaluator, LiveEvaluator};
use crate::network::Handler;
use crate::vfl::{
    DataSet, Learner, LearnerEvent, Model, Predictor, Role, TrainMessage, TrainPayload, TrainTask,
};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

/// Node settings
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address peers use to reach this node
    pub local: String,
    pub learner_limit: usize,
    /// Size of each Paillier prime
    pub paillier_bits: usize,
    pub inbox_capacity: usize,
    /// Steps kept for tasks that are not registered yet
    pub orphan_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            local: "127.0.0.1:7000".into(),
            learner_limit: 21,
            paillier_bits: 512,
            inbox_capacity: 64,
            orphan_capacity: 1024,
        }
    }
}

/// Bounded FIFO of undeliverable steps
#[derive(Default)]
struct OrphanStash {
    queue: VecDeque<(String, Inbound)>,
}

impl OrphanStash {
    fn push(&mut self, task_id: &str, msg: Inbound, capacity: usize) {
        if self.queue.len() >= capacity {
            if let Some((dropped, _)) = self.queue.pop_front() {
                warn!("orphan stash full, dropping a step of task {}", dropped);
            }
        }
        self.queue.push_back((task_id.to_string(), msg));
    }

    fn take(&mut self, task_id: &str) -> Vec<Inbound> {
        let (mine, rest): (VecDeque<_>, VecDeque<_>) =
            self.queue.drain(..).partition(|(id, _)| id == task_id);
        self.queue = rest;
        mine.into_iter().map(|(_, m)| m).collect()
    }
}

/// Shared state of a node; also the receiving side of its transport
pub struct NodeInner {
    config: NodeConfig,
    registry: Registry<TaskHandle>,
    ctx: ActorContext,
    results: Arc<dyn ResultHandler>,
    /// Descriptions of the training tasks started on this node
    tasks: Mutex<HashMap<String, TrainTask>>,
    routing: AsyncMutex<OrphanStash>,
}

/// Handle to a running MPC node
#[derive(Clone)]
pub struct MpcNode {
    inner: Arc<NodeInner>,
}

impl MpcNode {
    /// Create the node and spawn its coordinator
    pub fn start(config: NodeConfig, transport: Arc<dyn Transport>, results: Arc<dyn ResultHandler>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let ctx = ActorContext {
            local: config.local.clone(),
            transport,
            events: events_tx,
            inbox_capacity: config.inbox_capacity,
        };
        let inner = Arc::new(NodeInner {
            registry: Registry::spawn(config.learner_limit),
            config,
            ctx,
            results,
            tasks: Mutex::new(HashMap::new()),
            routing: AsyncMutex::new(OrphanStash::default()),
        });
        tokio::spawn(Coordinator::new(inner.clone()).run(events_rx));
        info!("[{}] mpc node started", inner.config.local);
        Self { inner }
    }

    pub fn local(&self) -> &str {
        &self.inner.config.local
    }

    /// Receiving side for transports
    pub fn handler(&self) -> Arc<NodeInner> {
        self.inner.clone()
    }

    /// Start this party's half of a user training task on raw rows
    pub async fn start_train(&self, task: TrainTask, data: DataSet) -> Result<()> {
        task.validate()?;
        self.inner.start_learner(task, Role::UserLearner, Some(data)).await
    }

    /// Start this party's half of a prediction task
    pub async fn start_predict(
        &self,
        task_id: &str,
        peer: &str,
        model: Model,
        data: DataSet,
        pre_aligned: bool,
    ) -> Result<()> {
        self.inner
            .start_predictor(task_id, peer, model, data, pre_aligned)
            .await
    }

    /// User stop; live-evaluation inner learners keep running
    pub async fn stop_task(&self, task_id: &str) -> Result<()> {
        let handle = self
            .inner
            .registry
            .get(task_id)
            .await?
            .ok_or_else(|| DcpError::NotFound(format!("task {}", task_id)))?;
        handle.stop(StopKind::User).await;
        Ok(())
    }

    pub async fn running_tasks(&self) -> Result<Vec<String>> {
        self.inner.registry.task_ids().await
    }
}

impl NodeInner {
    /// Register `handle`, then start its actor and flush early steps
    async fn register(&self, handle: TaskHandle, run: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        let task_id = handle.task_id.clone();
        let stashed = {
            let mut stash = self.routing.lock().await;
            self.registry.insert(&task_id, handle.clone()).await?;
            stash.take(&task_id)
        };
        tokio::spawn(run);
        if !stashed.is_empty() {
            debug!("[{}] flushing {} early steps", task_id, stashed.len());
        }
        for msg in stashed {
            handle.deliver(msg).await?;
        }
        Ok(())
    }

    async fn start_learner(&self, task: TrainTask, role: Role, data: Option<DataSet>) -> Result<()> {
        let learner = Learner::new(&task, role, &self.config.local, data, self.config.paillier_bits)?;
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.entry(task.task_id.clone()).or_insert_with(|| task.clone());
        }
        let (handle, run) = actor::learner_actor(learner, task.algorithm, task.peer.clone(), self.ctx.clone());
        self.register(handle, run).await?;
        info!("[{}] {:?} started with peer {}", task.task_id, role, task.peer);
        Ok(())
    }

    async fn start_predictor(
        &self,
        task_id: &str,
        peer: &str,
        model: Model,
        data: DataSet,
        pre_aligned: bool,
    ) -> Result<()> {
        let algorithm = model.algorithm;
        let predictor = Predictor::new(task_id, &self.config.local, peer, model, data, pre_aligned);
        let (handle, run) = actor::predictor_actor(predictor, algorithm, peer.to_string(), self.ctx.clone());
        self.register(handle, run).await?;
        info!("[{}] prediction started with peer {}", task_id, peer);
        Ok(())
    }

    async fn route(&self, task_id: &str, msg: Inbound) -> Result<bool> {
        let handle = {
            let mut stash = self.routing.lock().await;
            match self.registry.get(task_id).await? {
                Some(h) => h,
                None => {
                    debug!("[{}] task not registered yet, stashing step", task_id);
                    stash.push(task_id, msg, self.config.orphan_capacity);
                    return Ok(false);
                }
            }
        };
        handle.deliver(msg).await?;
        Ok(true)
    }

    fn task(&self, task_id: &str) -> Option<TrainTask> {
        self.tasks.lock().ok().and_then(|t| t.get(task_id).cloned())
    }

    fn forget_task(&self, task_id: &str) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.remove(task_id);
        }
    }
}

#[async_trait]
impl Handler for NodeInner {
    type Request = StepRequest;
    type Response = StepAck;

    async fn handle(&self, _from: &str, request: StepRequest) -> Result<StepAck> {
        let (task_id, msg) = match &request {
            StepRequest::Train(r) => (r.task_id.clone(), Inbound::Train(r.message()?)),
            StepRequest::Predict(r) => (r.task_id.clone(), Inbound::Predict(r.message()?)),
        };
        let delivered = self.route(&task_id, msg).await?;
        Ok(StepAck { delivered })
    }
}

#[derive(Debug, Clone, Copy)]
enum Parent {
    Eval(usize, Stage),
    LiveInner,
    LivePredict(u64),
}

/// Owner of the node's evaluators
struct Coordinator {
    node: Arc<NodeInner>,
    evaluators: HashMap<String, Evaluator>,
    live: HashMap<String, LiveEvaluator>,
    /// child task id → (parent task id, relation)
    parents: HashMap<String, (String, Parent)>,
}

impl Coordinator {
    fn new(node: Arc<NodeInner>) -> Self {
        Self {
            node,
            evaluators: HashMap::new(),
            live: HashMap::new(),
            parents: HashMap::new(),
        }
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<TaskEvent>) {
        while let Some(event) = events.recv().await {
            self.on_event(event).await;
        }
        debug!("[{}] coordinator stopped", self.node.config.local);
    }

    fn results(&self) -> &dyn ResultHandler {
        self.node.results.as_ref()
    }

    async fn finish_task(&self, task_id: &str) {
        if let Err(e) = self.node.registry.remove(task_id).await {
            warn!("[{}] cannot unregister: {}", task_id, e);
        }
    }

    fn save_failure(&self, task_id: &str, body: &ErrorBody) {
        if let Err(e) = self.results().save_failure(task_id, body) {
            warn!("[{}] cannot save failure: {}", task_id, e);
        }
    }

    /// Drop the bookkeeping of a task that has ended
    async fn forget(&mut self, task_id: &str) {
        self.parents.remove(task_id);
        self.release_task(task_id).await;
    }

    /// Drop a task description once neither the task nor an evaluator of it runs
    async fn release_task(&self, task_id: &str) {
        if self.evaluators.contains_key(task_id) || self.live.contains_key(task_id) {
            return;
        }
        if matches!(self.node.registry.get(task_id).await, Ok(None)) {
            self.node.forget_task(task_id);
        }
    }

    /// Drop the relations of `parent`'s children that no longer run
    async fn forget_children(&mut self, parent: &str) {
        let children: Vec<String> = self
            .parents
            .iter()
            .filter(|(_, (p, _))| p == parent)
            .map(|(child, _)| child.clone())
            .collect();
        for child in children {
            if matches!(self.node.registry.get(&child).await, Ok(None)) {
                self.parents.remove(&child);
            }
        }
        self.release_task(parent).await;
    }

    async fn on_event(&mut self, event: TaskEvent) {
        match event {
            TaskEvent::Learner {
                task_id,
                role,
                event,
            } => match event {
                LearnerEvent::Aligned { data } => self.on_aligned(&task_id, data).await,
                LearnerEvent::Paused { round, model } => self.on_paused(&task_id, role, round, model).await,
                LearnerEvent::Finished { model } => {
                    self.finish_task(&task_id).await;
                    self.on_trained(&task_id, role, model).await;
                    self.forget(&task_id).await;
                }
            },
            TaskEvent::Predicted { task_id, result } => {
                self.finish_task(&task_id).await;
                let cmds = match self.parents.remove(&task_id) {
                    Some((parent, Parent::Eval(fold, _))) => match self.evaluators.get_mut(&parent) {
                        Some(ev) => ev.save_predict_out(fold, &result).unwrap_or_else(|e| {
                            ev.on_failed(fold, &e.to_string())
                        }),
                        None => Vec::new(),
                    },
                    Some((parent, Parent::LivePredict(round))) => self
                        .live
                        .get_mut(&parent)
                        .map(|l| l.on_predicted(round, &result))
                        .unwrap_or_default(),
                    _ => {
                        if let Err(e) = self.results().save_predict_result(&result) {
                            warn!("[{}] cannot save predictions: {}", task_id, e);
                        }
                        Vec::new()
                    }
                };
                self.execute(cmds).await;
                self.forget(&task_id).await;
            }
            TaskEvent::Failed {
                task_id,
                role,
                error,
            } => {
                self.finish_task(&task_id).await;
                error!("[{}] task failed: {}", task_id, error);
                self.save_failure(&task_id, &error.body());
                self.on_child_ended(&task_id, role, &error.to_string()).await;
                self.forget(&task_id).await;
            }
            TaskEvent::Stopped { task_id, role } => {
                self.finish_task(&task_id).await;
                self.on_child_ended(&task_id, role, "stopped").await;
                self.forget(&task_id).await;
            }
        }
    }

    async fn on_aligned(&mut self, task_id: &str, data: DataSet) {
        let task = match self.node.task(task_id) {
            Some(t) => t,
            None => return,
        };
        let mut cmds = Vec::new();
        if task.eval_params.as_ref().is_some_and(|p| p.enable) {
            match Evaluator::new(&task, data.clone()).and_then(|ev| Ok((ev.start()?, ev))) {
                Ok((start, ev)) => {
                    for f in 0..ev.fold_count() {
                        for stage in [Stage::Train, Stage::Predict] {
                            let child = match stage {
                                Stage::Train => evaluator::train_task_id(task_id, f),
                                Stage::Predict => evaluator::predict_task_id(task_id, f),
                            };
                            self.parents
                                .insert(child, (task_id.to_string(), Parent::Eval(f, stage)));
                        }
                    }
                    self.evaluators.insert(task_id.to_string(), ev);
                    cmds.extend(start);
                }
                Err(e) => {
                    warn!("[{}] evaluation not started: {}", task_id, e);
                    self.save_failure(&format!("{}_Eva", task_id), &e.body());
                }
            }
        }
        if task.lival_params.as_ref().is_some_and(|p| p.enable) {
            match LiveEvaluator::new(&task, &self.node.config.local, data) {
                Ok(live) => {
                    self.parents
                        .insert(live.inner_task_id(), (task_id.to_string(), Parent::LiveInner));
                    self.live.insert(task_id.to_string(), live);
                }
                Err(e) => {
                    warn!("[{}] live evaluation not started: {}", task_id, e);
                    self.save_failure(&format!("{}_LiveEval", task_id), &e.body());
                }
            }
        }
        self.execute(cmds).await;
    }

    async fn on_paused(&mut self, task_id: &str, role: Role, round: u64, model: Model) {
        let cmds = match role {
            Role::UserLearner => match self.live.get_mut(task_id) {
                Some(live) => live.on_main_paused(round).unwrap_or_else(|e| {
                    warn!("[{}] {}", task_id, e);
                    Vec::new()
                }),
                None => vec![release(task_id, &self.node.config.local, round)],
            },
            Role::LiveEvalInnerLearner => match self.parents.get(task_id) {
                Some((parent, Parent::LiveInner)) => self
                    .live
                    .get_mut(parent)
                    .map(|l| l.on_inner_paused(round, model))
                    .unwrap_or_default(),
                _ => vec![release(task_id, &self.node.config.local, round)],
            },
            Role::EvalLearner => vec![release(task_id, &self.node.config.local, round)],
        };
        self.execute(cmds).await;
    }

    async fn on_trained(&mut self, task_id: &str, role: Role, model: Model) {
        let cmds = match (role, self.parents.get(task_id).cloned()) {
            (Role::EvalLearner, Some((parent, Parent::Eval(fold, _)))) => {
                match self.evaluators.get_mut(&parent) {
                    Some(ev) => ev
                        .on_trained(fold, model)
                        .unwrap_or_else(|e| ev.on_failed(fold, &e.to_string())),
                    None => Vec::new(),
                }
            }
            (Role::LiveEvalInnerLearner, Some((parent, Parent::LiveInner))) => self
                .live
                .get_mut(&parent)
                .map(|l| l.on_inner_finished(model))
                .unwrap_or_default(),
            _ => {
                if let Err(e) = self.results().save_model(task_id, &model) {
                    warn!("[{}] cannot save model: {}", task_id, e);
                }
                self.live
                    .get_mut(task_id)
                    .map(|l| l.on_main_finished())
                    .unwrap_or_default()
            }
        };
        self.execute(cmds).await;
    }

    async fn on_child_ended(&mut self, task_id: &str, role: Option<Role>, reason: &str) {
        let cmds = match self.parents.get(task_id).cloned() {
            Some((parent, Parent::Eval(fold, _))) => self
                .evaluators
                .get_mut(&parent)
                .map(|ev| ev.on_failed(fold, reason))
                .unwrap_or_default(),
            Some((parent, Parent::LiveInner)) => self
                .live
                .get_mut(&parent)
                .map(|l| l.on_inner_failed(reason))
                .unwrap_or_default(),
            Some((parent, Parent::LivePredict(round))) => self
                .live
                .get_mut(&parent)
                .map(|l| l.on_predict_failed(round, reason))
                .unwrap_or_default(),
            None if role == Some(Role::UserLearner) => self
                .live
                .get_mut(task_id)
                .map(|l| l.on_main_finished())
                .unwrap_or_default(),
            None => Vec::new(),
        };
        self.execute(cmds).await;
    }

    async fn execute(&mut self, cmds: Vec<EvalCommand>) {
        let mut queue: VecDeque<EvalCommand> = cmds.into();
        while let Some(cmd) = queue.pop_front() {
            match cmd {
                EvalCommand::StartTrain { task, role, data } => {
                    let task_id = task.task_id.clone();
                    let started = self.node.start_learner(task, role, None).await;
                    let delivered = match started {
                        Ok(()) => {
                            let msg = TrainMessage {
                                task_id: task_id.clone(),
                                from: self.node.config.local.clone(),
                                to: self.node.config.local.clone(),
                                loop_round: 0,
                                payload: TrainPayload::MsgTrainSet { train_set: data },
                            };
                            self.node.route(&task_id, Inbound::Train(msg)).await.map(|_| ())
                        }
                        Err(e) => Err(e),
                    };
                    if let Err(e) = delivered {
                        warn!("[{}] cannot start: {}", task_id, e);
                        self.save_failure(&task_id, &e.body());
                        self.finish_task(&task_id).await;
                        queue.extend(self.child_failed_cmds(&task_id, &e.to_string()));
                        self.forget(&task_id).await;
                    }
                }
                EvalCommand::StartPredict {
                    task_id,
                    model,
                    data,
                } => {
                    let parent = self.parent_for_predict(&task_id);
                    let peer = match parent.as_ref().and_then(|(p, _)| self.node.task(p)) {
                        Some(t) => t.peer,
                        None => {
                            warn!("[{}] prediction without a parent task", task_id);
                            continue;
                        }
                    };
                    if let Some((p, rel)) = parent {
                        self.parents.insert(task_id.clone(), (p, rel));
                    }
                    if let Err(e) = self.node.start_predictor(&task_id, &peer, model, data, true).await {
                        warn!("[{}] cannot start: {}", task_id, e);
                        self.save_failure(&task_id, &e.body());
                        queue.extend(self.child_failed_cmds(&task_id, &e.to_string()));
                        self.forget(&task_id).await;
                    }
                }
                EvalCommand::SendLocal(msg) => {
                    let task_id = msg.task_id.clone();
                    if let Err(e) = self.node.route(&task_id, Inbound::Train(msg)).await {
                        debug!("[{}] local message not delivered: {}", task_id, e);
                    }
                }
                EvalCommand::Stop { task_id } => {
                    if let Ok(Some(handle)) = self.node.registry.get(&task_id).await {
                        handle.stop(StopKind::Force).await;
                    }
                }
                EvalCommand::Report(report) => {
                    if let Err(e) = self.results().save_predict_and_evaluate_result(&report) {
                        warn!("[{}] cannot save evaluation: {}", report.task_id, e);
                    }
                    self.evaluators.remove(&report.task_id);
                    self.forget_children(&report.task_id).await;
                }
                EvalCommand::LiveReport(report) => {
                    if let Err(e) = self.results().save_live_evaluate_result(&report) {
                        warn!("[{}] cannot save live evaluation: {}", report.task_id, e);
                    }
                    self.live.remove(&report.task_id);
                    self.forget_children(&report.task_id).await;
                }
            }
        }
    }

    fn parent_for_predict(&self, task_id: &str) -> Option<(String, Parent)> {
        if let Some(found) = self.parents.get(task_id) {
            return Some(found.clone());
        }
        self.live.iter().find_map(|(parent, live)| {
            live.predict_round(task_id)
                .map(|round| (parent.clone(), Parent::LivePredict(round)))
        })
    }

    fn child_failed_cmds(&mut self, task_id: &str, reason: &str) -> Vec<EvalCommand> {
        match self.parents.get(task_id).cloned() {
            Some((parent, Parent::Eval(fold, _))) => self
                .evaluators
                .get_mut(&parent)
                .map(|ev| ev.on_failed(fold, reason))
                .unwrap_or_default(),
            Some((parent, Parent::LiveInner)) => self
                .live
                .get_mut(&parent)
                .map(|l| l.on_inner_failed(reason))
                .unwrap_or_default(),
            Some((parent, Parent::LivePredict(round))) => self
                .live
                .get_mut(&parent)
                .map(|l| l.on_predict_failed(round, reason))
                .unwrap_or_default(),
            None => Vec::new(),
        }
    }
}

fn release(task_id: &str, local: &str, round: u64) -> EvalCommand {
    EvalCommand::SendLocal(TrainMessage {
        task_id: task_id.to_string(),
        from: local.to_string(),
        to: local.to_string(),
        loop_round: round,
        payload: TrainPayload::MsgContinueLoop { pause_round: round },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::EvalRule;
    use crate::mpc::result::MemoryResults;
    use crate::mpc::transport::{LocalTransport, StepHandler};
    use crate::vfl::{Algorithm, EvalParams, LiveEvalParams, TrainParams};
    use std::time::Duration;

    struct Pair {
        a: MpcNode,
        b: MpcNode,
        results_a: Arc<MemoryResults>,
        results_b: Arc<MemoryResults>,
        _handlers: Vec<Arc<StepHandler>>,
    }

    fn pair() -> Pair {
        let net = LocalTransport::new();
        let results_a = Arc::new(MemoryResults::new());
        let results_b = Arc::new(MemoryResults::new());
        let config = |local: &str| NodeConfig {
            local: local.into(),
            paillier_bits: 128,
            ..NodeConfig::default()
        };
        let a = MpcNode::start(config("A"), Arc::new(net.endpoint("A")), results_a.clone());
        let b = MpcNode::start(config("B"), Arc::new(net.endpoint("B")), results_b.clone());
        let ha: Arc<StepHandler> = a.handler();
        let hb: Arc<StepHandler> = b.handler();
        net.register("A", Arc::downgrade(&ha));
        net.register("B", Arc::downgrade(&hb));
        Pair {
            a,
            b,
            results_a,
            results_b,
            _handlers: vec![ha, hb],
        }
    }

    fn task(task_id: &str, peer: &str, tag: bool) -> TrainTask {
        TrainTask {
            task_id: task_id.into(),
            algorithm: Algorithm::LinRegVL,
            params: TrainParams {
                alpha: 0.5,
                label: "y".into(),
                is_tag_part: tag,
                max_rounds: 25,
                ..TrainParams::default()
            },
            peer: peer.into(),
            eval_params: None,
            lival_params: None,
        }
    }

    /// Party A holds `f`, party B holds `g` and `y = 2f + 3g + 1`
    fn datasets(n: usize) -> (DataSet, DataSet) {
        let ids: Vec<String> = (0..n).map(|i| format!("u{}", i)).collect();
        let f: Vec<f64> = (0..n).map(|i| (i % 7) as f64).collect();
        let g: Vec<f64> = (0..n).map(|i| ((i * 3) % 5) as f64).collect();
        let y = f.iter().zip(&g).map(|(f, g)| 2.0 * f + 3.0 * g + 1.0).collect();
        let a = DataSet {
            id_name: "id".into(),
            ids: ids.clone(),
            features: vec!["f".into()],
            rows: f.iter().map(|v| vec![*v]).collect(),
            label: None,
            labels: None,
        };
        // B lists its rows in reverse order; PSI realigns them
        let mut b_ids = ids;
        b_ids.reverse();
        let mut g_rows: Vec<Vec<f64>> = g.iter().map(|v| vec![*v]).collect();
        g_rows.reverse();
        let mut y_rows: Vec<f64> = y;
        y_rows.reverse();
        let b = DataSet {
            id_name: "id".into(),
            ids: b_ids,
            features: vec!["g".into()],
            rows: g_rows,
            label: Some("y".into()),
            labels: Some(y_rows),
        };
        (a, b)
    }

    const WAIT: Duration = Duration::from_secs(120);

    /// Wait until the node keeps no task descriptions
    async fn settled(node: &MpcNode) -> bool {
        for _ in 0..200 {
            if node.inner.tasks.lock().unwrap().is_empty() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_nodes_train_a_model() {
        let p = pair();
        let (da, db) = datasets(8);
        p.a.start_train(task("t1", "B", false), da).await.unwrap();
        p.b.start_train(task("t1", "A", true), db).await.unwrap();

        let ma = p.results_a.wait_for(WAIT, |o| o.models.get("t1").cloned()).await.unwrap();
        let mb = p.results_b.wait_for(WAIT, |o| o.models.get("t1").cloned()).await.unwrap();
        assert_eq!(ma.rounds, mb.rounds);
        assert!(mb.is_tag_part && !ma.is_tag_part);
        assert!(mb.final_cost < 0.1, "cost {}", mb.final_cost);
        // finished tasks leave the registry
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(p.a.running_tasks().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_evaluation_reports_on_both_nodes() {
        let p = pair();
        let (da, db) = datasets(10);
        let eval = Some(EvalParams {
            enable: true,
            rule: EvalRule::RandomSplit { percent_lo: 20 },
        });
        let mut ta = task("ev", "B", false);
        ta.eval_params = eval.clone();
        let mut tb = task("ev", "A", true);
        tb.eval_params = eval;
        p.a.start_train(ta, da).await.unwrap();
        p.b.start_train(tb, db).await.unwrap();

        let rb = p.results_b.wait_for(WAIT, |o| o.evaluations.get("ev").cloned()).await.unwrap();
        let ra = p.results_a.wait_for(WAIT, |o| o.evaluations.get("ev").cloned()).await.unwrap();
        assert_eq!(rb.folds.len(), 1);
        assert_eq!(rb.folds[0].test_rows, 2);
        assert!(rb.folds[0].error.is_none(), "{:?}", rb.folds[0].error);
        assert!(rb.summary.is_some());
        // only the label party can score
        assert!(ra.summary.is_none());
        assert!(p.results_b.snapshot().models.contains_key("ev"));
        // fold tasks and the parent description are dropped once reported
        assert!(settled(&p.a).await);
        assert!(settled(&p.b).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_live_evaluation_records_pauses() {
        let p = pair();
        let (da, db) = datasets(10);
        let lival = Some(LiveEvalParams {
            enable: true,
            trigger_interval: 10,
            percent_lo: 20,
        });
        let mut ta = task("lv", "B", false);
        ta.lival_params = lival.clone();
        // run every round up to max_rounds
        ta.params.amplitude = 1e-12;
        let mut tb = task("lv", "A", true);
        tb.lival_params = lival;
        tb.params.amplitude = 1e-12;
        p.a.start_train(ta, da).await.unwrap();
        p.b.start_train(tb, db).await.unwrap();

        let report = p
            .results_b
            .wait_for(WAIT, |o| o.live_evaluations.get("lv").cloned())
            .await
            .unwrap();
        let model = p.results_b.snapshot().models.get("lv").cloned().unwrap();
        let rounds: Vec<u64> = report.records.iter().map(|r| r.round).collect();
        assert_eq!(rounds, vec![10, 20]);
        assert!(report.records.iter().all(|r| r.metrics.is_some()));
        assert_eq!(model.rounds, 25);
        assert!(p
            .results_a
            .wait_for(WAIT, |o| o.live_evaluations.get("lv").cloned())
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_unreachable_peer_fails_task() {
        let results = Arc::new(MemoryResults::new());
        let net = LocalTransport::new();
        let node = MpcNode::start(
            NodeConfig {
                local: "A".into(),
                paillier_bits: 128,
                ..NodeConfig::default()
            },
            Arc::new(net.endpoint("A")),
            results.clone(),
        );
        let (da, _) = datasets(4);
        node.start_train(task("lost", "nowhere", false), da).await.unwrap();
        let body = results
            .wait_for(WAIT, |o| o.failures.get("lost").cloned())
            .await
            .unwrap();
        assert_eq!(body.code, 10005);
    }

    #[tokio::test]
    async fn test_ended_children_are_forgotten() {
        let results = Arc::new(MemoryResults::new());
        let net = LocalTransport::new();
        let node = MpcNode::start(
            NodeConfig {
                local: "A".into(),
                paillier_bits: 128,
                ..NodeConfig::default()
            },
            Arc::new(net.endpoint("A")),
            results.clone(),
        );
        let mut coordinator = Coordinator::new(node.handler());
        for id in ["job", "job_LiveEval"] {
            node.inner.tasks.lock().unwrap().insert(id.into(), task(id, "B", false));
        }
        coordinator
            .parents
            .insert("job_LiveEval".into(), ("job".into(), Parent::LiveInner));
        coordinator
            .parents
            .insert("job_LiveEval_predict_10".into(), ("job".into(), Parent::LivePredict(10)));

        coordinator
            .on_event(TaskEvent::Failed {
                task_id: "job_LiveEval_predict_10".into(),
                role: None,
                error: DcpError::Internal("peer gone".into()),
            })
            .await;
        coordinator
            .on_event(TaskEvent::Stopped {
                task_id: "job_LiveEval".into(),
                role: Some(Role::LiveEvalInnerLearner),
            })
            .await;
        assert!(coordinator.parents.is_empty());
        assert!(node.inner.task("job_LiveEval").is_none());
        assert!(node.inner.task("job").is_some());

        coordinator
            .on_event(TaskEvent::Stopped {
                task_id: "job".into(),
                role: Some(Role::UserLearner),
            })
            .await;
        assert!(node.inner.task("job").is_none());
        assert!(results.snapshot().failures.contains_key("job_LiveEval_predict_10"));
    }

    #[tokio::test]
    async fn test_duplicate_task_rejected() {
        let p = pair();
        let (da, _) = datasets(4);
        p.a.start_train(task("dup", "B", false), da.clone()).await.unwrap();
        let err = p.a.start_train(task("dup", "B", false), da).await.unwrap_err();
        assert_eq!(err.code(), 10003);
        p.a.stop_task("dup").await.unwrap();
    }

    #[tokio::test]
    async fn test_early_steps_are_stashed() {
        let mut stash = OrphanStash::default();
        let msg = |task: &str| {
            Inbound::Train(TrainMessage {
                task_id: task.into(),
                from: "B".into(),
                to: "A".into(),
                loop_round: 0,
                payload: TrainPayload::MsgPsiIntersect,
            })
        };
        stash.push("x", msg("x"), 2);
        stash.push("y", msg("y"), 2);
        stash.push("x", msg("x"), 2);
        // capacity 2: the oldest step was dropped
        assert_eq!(stash.take("x").len(), 1);
        assert_eq!(stash.take("y").len(), 1);
        assert!(stash.take("y").is_empty());
    }
}
