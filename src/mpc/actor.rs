//! Per-task actors
//!
//! Each learner or predictor runs in its own tokio task that owns the state
//! machine. Peer messages arrive through a bounded inbox; self-dispatched
//! messages go through a local queue that is drained first. Transitions run
//! on the blocking pool because they are CPU-bound (Paillier, PSI), and the
//! state machine is moved in and out of the worker so no lock is held across
//! network I/O.

use super::transport::Transport;
use super::wire::StepRequest;
use crate::error::{DcpError, Result};
use crate::vfl::{
    Algorithm, Learner, LearnerEvent, Outbound, PredictMessage, PredictOutbound, PredictResult,
    Predictor, Role, TrainMessage,
};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Message routed to a task actor
#[derive(Debug, Clone)]
pub enum Inbound {
    Train(TrainMessage),
    Predict(PredictMessage),
}

/// Kind of cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    /// User request; ignored by live-evaluation inner learners
    User,
    /// Issued by the owning evaluator
    Force,
}

/// Registry entry of a running task
#[derive(Debug, Clone)]
pub struct TaskHandle {
    pub task_id: String,
    /// `None` for prediction tasks
    pub role: Option<Role>,
    inbox: mpsc::Sender<Inbound>,
    stop: mpsc::Sender<StopKind>,
}

impl TaskHandle {
    pub async fn deliver(&self, msg: Inbound) -> Result<()> {
        self.inbox
            .send(msg)
            .await
            .map_err(|_| DcpError::NotFound(format!("task {} has ended", self.task_id)))
    }

    pub async fn stop(&self, kind: StopKind) {
        if self.stop.send(kind).await.is_err() {
            debug!("[{}] stop after task end", self.task_id);
        }
    }
}

/// Outcome reported by actors to the node
#[derive(Debug)]
pub enum TaskEvent {
    Learner {
        task_id: String,
        role: Role,
        event: LearnerEvent,
    },
    Predicted {
        task_id: String,
        result: PredictResult,
    },
    Failed {
        task_id: String,
        role: Option<Role>,
        error: DcpError,
    },
    Stopped {
        task_id: String,
        role: Option<Role>,
    },
}

/// Services shared by every actor of a node
#[derive(Clone)]
pub struct ActorContext {
    pub local: String,
    pub transport: Arc<dyn Transport>,
    pub events: mpsc::UnboundedSender<TaskEvent>,
    pub inbox_capacity: usize,
}

impl ActorContext {
    fn report(&self, event: TaskEvent) {
        if self.events.send(event).is_err() {
            warn!("[{}] node event channel closed", self.local);
        }
    }
}

enum Next<M> {
    Message(M),
    Stop(StopKind),
    Closed,
}

async fn next_message<M>(
    local: &mut VecDeque<M>,
    inbox: &mut mpsc::Receiver<Inbound>,
    stop: &mut mpsc::Receiver<StopKind>,
    unwrap: impl Fn(Inbound) -> Option<M>,
) -> Next<M> {
    if let Ok(kind) = stop.try_recv() {
        return Next::Stop(kind);
    }
    if let Some(m) = local.pop_front() {
        return Next::Message(m);
    }
    loop {
        tokio::select! {
            biased;
            kind = stop.recv() => match kind {
                Some(kind) => return Next::Stop(kind),
                None => return Next::Closed,
            },
            inbound = inbox.recv() => match inbound {
                Some(inbound) => match unwrap(inbound) {
                    Some(m) => return Next::Message(m),
                    None => continue,
                },
                None => return Next::Closed,
            },
        }
    }
}

/// Build the actor of a training task. Nothing runs until the returned
/// future is spawned, so the handle can be registered first.
pub fn learner_actor(
    learner: Learner,
    algorithm: Algorithm,
    peer: String,
    ctx: ActorContext,
) -> (TaskHandle, impl Future<Output = ()> + Send + 'static) {
    let (inbox_tx, inbox_rx) = mpsc::channel(ctx.inbox_capacity.max(1));
    let (stop_tx, stop_rx) = mpsc::channel(4);
    let handle = TaskHandle {
        task_id: learner.task_id().to_string(),
        role: Some(learner.role()),
        inbox: inbox_tx,
        stop: stop_tx,
    };
    (handle, run_learner(learner, algorithm, peer, ctx, inbox_rx, stop_rx))
}

async fn run_learner(
    learner: Learner,
    algorithm: Algorithm,
    peer: String,
    ctx: ActorContext,
    inbox: mpsc::Receiver<Inbound>,
    stop: mpsc::Receiver<StopKind>,
) {
    let task_id = learner.task_id().to_string();
    let role = learner.role();
    match drive_learner(learner, algorithm, &peer, &ctx, inbox, stop).await {
        Ok(true) => debug!("[{}] learner actor done", task_id),
        Ok(false) => {
            info!("[{}] learner stopped", task_id);
            ctx.report(TaskEvent::Stopped {
                task_id,
                role: Some(role),
            });
        }
        Err(e) => {
            warn!("[{}] learner failed: {}", task_id, e);
            ctx.report(TaskEvent::Failed {
                error: e.with_task(&task_id),
                task_id,
                role: Some(role),
            });
        }
    }
}

/// Returns `Ok(true)` when training finished, `Ok(false)` when stopped
async fn drive_learner(
    mut learner: Learner,
    algorithm: Algorithm,
    peer: &str,
    ctx: &ActorContext,
    mut inbox: mpsc::Receiver<Inbound>,
    mut stop: mpsc::Receiver<StopKind>,
) -> Result<bool> {
    let task_id = learner.task_id().to_string();
    let role = learner.role();
    let mut local: VecDeque<TrainMessage> = VecDeque::new();
    let mut ahead: Vec<TrainMessage> = Vec::new();

    let (l, out) = tokio::task::spawn_blocking(move || {
        let out = learner.start();
        (learner, out)
    })
    .await?;
    learner = l;
    let mut pending = out?;

    loop {
        let finished = dispatch_train(pending, algorithm, peer, &task_id, role, ctx, &mut local).await?;
        if finished || learner.is_finished() {
            return Ok(true);
        }

        let msg = loop {
            let next = next_message(&mut local, &mut inbox, &mut stop, |i| match i {
                Inbound::Train(m) => Some(m),
                Inbound::Predict(_) => {
                    warn!("[{}] prediction message sent to a learner", task_id);
                    None
                }
            })
            .await;
            match next {
                Next::Message(m) => {
                    if m.kind().is_round_scoped() {
                        if m.loop_round == learner.round() + 1 {
                            ahead.push(m);
                            continue;
                        }
                        if m.loop_round != learner.round() {
                            debug!(
                                "[{}] dropping {:?} of round {} at round {}",
                                task_id,
                                m.kind(),
                                m.loop_round,
                                learner.round()
                            );
                            continue;
                        }
                    }
                    break m;
                }
                Next::Stop(StopKind::User) if !role.honours_stop() => {
                    info!("[{}] user stop ignored by {:?}", task_id, role);
                }
                Next::Stop(_) => return Ok(false),
                Next::Closed => return Ok(false),
            }
        };

        let round_before = learner.round();
        let (l, out) = tokio::task::spawn_blocking(move || {
            let out = learner.handle(msg);
            (learner, out)
        })
        .await?;
        learner = l;
        pending = out?;

        if learner.round() != round_before {
            let round = learner.round();
            let (ready, later): (Vec<_>, Vec<_>) =
                ahead.drain(..).partition(|m| m.loop_round == round);
            ahead = later;
            local.extend(ready);
        }
    }
}

/// Send peer messages, queue local ones, report events.
/// Returns true once the learner reported `Finished`.
async fn dispatch_train(
    outs: Vec<Outbound>,
    algorithm: Algorithm,
    peer: &str,
    task_id: &str,
    role: Role,
    ctx: &ActorContext,
    local: &mut VecDeque<TrainMessage>,
) -> Result<bool> {
    let mut finished = false;
    for out in outs {
        match out {
            Outbound::Peer(m) => {
                let step = StepRequest::train(algorithm, &m)?;
                ctx.transport.step(peer, step).await?;
            }
            Outbound::Local(m) => local.push_back(m),
            Outbound::Event(event) => {
                finished |= matches!(event, LearnerEvent::Finished { .. });
                ctx.report(TaskEvent::Learner {
                    task_id: task_id.to_string(),
                    role,
                    event,
                });
            }
        }
    }
    Ok(finished)
}

/// Build the actor of a prediction task
pub fn predictor_actor(
    predictor: Predictor,
    algorithm: Algorithm,
    peer: String,
    ctx: ActorContext,
) -> (TaskHandle, impl Future<Output = ()> + Send + 'static) {
    let (inbox_tx, inbox_rx) = mpsc::channel(ctx.inbox_capacity.max(1));
    let (stop_tx, stop_rx) = mpsc::channel(4);
    let handle = TaskHandle {
        task_id: predictor.task_id().to_string(),
        role: None,
        inbox: inbox_tx,
        stop: stop_tx,
    };
    let run = async move {
        let task_id = predictor.task_id().to_string();
        match drive_predictor(predictor, algorithm, &peer, &ctx, inbox_rx, stop_rx).await {
            Ok(Some(result)) => ctx.report(TaskEvent::Predicted { task_id, result }),
            Ok(None) => ctx.report(TaskEvent::Stopped { task_id, role: None }),
            Err(e) => {
                warn!("[{}] prediction failed: {}", task_id, e);
                ctx.report(TaskEvent::Failed {
                    error: e.with_task(&task_id),
                    task_id,
                    role: None,
                })
            }
        }
    };
    (handle, run)
}

async fn drive_predictor(
    mut predictor: Predictor,
    algorithm: Algorithm,
    peer: &str,
    ctx: &ActorContext,
    mut inbox: mpsc::Receiver<Inbound>,
    mut stop: mpsc::Receiver<StopKind>,
) -> Result<Option<PredictResult>> {
    let task_id = predictor.task_id().to_string();
    let mut local: VecDeque<PredictMessage> = VecDeque::new();

    let (p, out) = tokio::task::spawn_blocking(move || {
        let out = predictor.start();
        (predictor, out)
    })
    .await?;
    predictor = p;
    let mut pending = out?;

    loop {
        let mut result = None;
        for out in pending {
            match out {
                PredictOutbound::Peer(m) => {
                    let step = StepRequest::predict(algorithm, &m)?;
                    ctx.transport.step(peer, step).await?;
                }
                PredictOutbound::Local(m) => local.push_back(m),
                PredictOutbound::Finished(r) => result = Some(r),
            }
        }
        if result.is_some() {
            return Ok(result);
        }

        let next = next_message(&mut local, &mut inbox, &mut stop, |i| match i {
            Inbound::Predict(m) => Some(m),
            Inbound::Train(_) => {
                warn!("[{}] training message sent to a predictor", task_id);
                None
            }
        })
        .await;
        let msg = match next {
            Next::Message(m) => m,
            Next::Stop(_) | Next::Closed => return Ok(None),
        };
        let (p, out) = tokio::task::spawn_blocking(move || {
            let out = predictor.handle(msg);
            (predictor, out)
        })
        .await?;
        predictor = p;
        pending = out?;
    }
}
