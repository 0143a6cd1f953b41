//! Per-task training state machine
//!
//! `Learner::handle` is a pure transition: it consumes one message and
//! returns what must happen next (messages to the peer, messages to itself,
//! events for the orchestrator). All I/O lives in the actor that drives it.
//!
//! ```text
//! START_PSI → END_PSI → START_TRAIN → (HUP → CAL_LOCAL → EXCHANGE_PART
//!   → CAL_ENC → EXCHANGE_ENC → DEC_LOCAL → EXCHANGE_DEC → UPD_COST_GRAD
//!   → STATUS → CHECK_STATUS)* → END_TRAIN
//! ```
//!
//! Peer messages may arrive before the local side reaches the state that
//! consumes them; they are stored in the round scratch and picked up by the
//! `try_*` guards once both inputs of a step are present.

use super::dataset::DataSet;
use super::gradient::{self, LocalPart, Masks, PartBundle};
use super::message::{MaskedValue, MessageType, TrainMessage, TrainPayload};
use super::model::Model;
use super::params::{Algorithm, Role, TrainParams, TrainTask};
use super::preprocess::{self, Prepared};
use crate::crypto::paillier::{self, Ciphertext, FixedPoint, PublicKey, SecretKey};
use crate::error::{DcpError, Result};
use crate::psi::Psi;
use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use std::collections::HashSet;
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainState {
    StartPsi,
    EndPsi,
    StartTrain,
    Hup,
    CalLocal,
    ExchangePart,
    CalEnc,
    ExchangeEnc,
    DecLocal,
    ExchangeDec,
    UpdCostGrad,
    Status,
    CheckStatus,
    EndTrain,
}

/// Notifications for the orchestrator
#[derive(Debug, Clone)]
pub enum LearnerEvent {
    /// Rows are aligned with the peer; evaluation may split them
    Aligned { data: DataSet },
    /// Waiting at a pause round until `MsgContinueLoop`
    Paused { round: u64, model: Model },
    Finished { model: Model },
}

/// Result of one transition
#[derive(Debug, Clone)]
pub enum Outbound {
    Peer(TrainMessage),
    Local(TrainMessage),
    Event(LearnerEvent),
}

/// Inputs gathered during one loop round
#[derive(Debug, Default)]
struct RoundScratch {
    batch: Option<Range<usize>>,
    local: Option<LocalPart>,
    peer_part: Option<PartBundle>,
    masks: Option<Masks>,
    peer_enc: Option<(Vec<Ciphertext>, Ciphertext)>,
    opened: Option<(Vec<MaskedValue>, MaskedValue)>,
    stopped: Option<bool>,
    peer_stopped: Option<bool>,
}

pub struct Learner {
    task_id: String,
    role: Role,
    algorithm: Algorithm,
    params: TrainParams,
    local: String,
    peer: String,
    pause_interval: Option<u64>,
    key_bits: usize,
    fp: FixedPoint,

    state: TrainState,
    round: u64,
    psi: Option<Psi>,
    raw: Option<DataSet>,
    aligned: Option<DataSet>,
    prepared: Option<Prepared>,
    keys: Option<SecretKey>,
    peer_pk: Option<PublicKey>,
    theta: DVector<f64>,
    prev_cost: Option<f64>,
    paused_at: Option<u64>,
    released_round: Option<u64>,
    scratch: RoundScratch,
    /// Peer steps already applied, keyed by round and kind
    seen: HashSet<(u64, MessageType)>,
}

impl std::fmt::Debug for Learner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Learner")
            .field("task_id", &self.task_id)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("round", &self.round)
            .finish()
    }
}

impl Learner {
    /// Create one party's learner. `data` is the party's raw rows; `None`
    /// means the rows arrive pre-aligned through `MsgTrainSet`.
    pub fn new(
        task: &TrainTask,
        role: Role,
        local: &str,
        data: Option<DataSet>,
        key_bits: usize,
    ) -> Result<Self> {
        task.validate()?;
        let pause_interval = match role {
            Role::EvalLearner => None,
            _ => task.pause_interval(),
        };
        Ok(Self {
            task_id: task.task_id.clone(),
            role,
            algorithm: task.algorithm,
            params: task.params.clone(),
            local: local.to_string(),
            peer: task.peer.clone(),
            pause_interval,
            key_bits,
            fp: FixedPoint::new(task.params.accuracy),
            state: TrainState::StartPsi,
            round: 0,
            psi: None,
            raw: data,
            aligned: None,
            prepared: None,
            keys: None,
            peer_pk: None,
            theta: DVector::zeros(0),
            prev_cost: None,
            paused_at: None,
            released_round: None,
            scratch: RoundScratch::default(),
            seen: HashSet::new(),
        })
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> TrainState {
        self.state
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn is_finished(&self) -> bool {
        self.state == TrainState::EndTrain
    }

    fn msg(&self, to: &str, payload: TrainPayload) -> TrainMessage {
        TrainMessage {
            task_id: self.task_id.clone(),
            from: self.local.clone(),
            to: to.to_string(),
            loop_round: self.round,
            payload,
        }
    }

    fn to_peer(&self, payload: TrainPayload) -> Outbound {
        Outbound::Peer(self.msg(&self.peer, payload))
    }

    fn to_self(&self, payload: TrainPayload) -> Outbound {
        Outbound::Local(self.msg(&self.local, payload))
    }

    /// Kick off the task: PSI for raw rows, nothing for pre-aligned learners
    pub fn start(&mut self) -> Result<Vec<Outbound>> {
        let raw = match self.raw.take() {
            Some(raw) => raw,
            None => return Ok(Vec::new()),
        };
        let psi = Psi::new(raw.ids.clone())?;
        let enc_ids = psi.own_encrypted().to_vec();
        info!("[{}] psi started with {} local ids", self.task_id, enc_ids.len());
        self.psi = Some(psi);
        self.raw = Some(raw);
        Ok(vec![self.to_peer(TrainPayload::MsgPsiEnc { enc_ids })])
    }

    /// Apply one message
    pub fn handle(&mut self, msg: TrainMessage) -> Result<Vec<Outbound>> {
        if self.state == TrainState::EndTrain {
            debug!("[{}] ignoring {:?} after end of training", self.task_id, msg.kind());
            return Ok(Vec::new());
        }
        if msg.kind().is_round_scoped() && msg.loop_round != self.round {
            warn!(
                "[{}] dropping {:?} for round {} at round {}",
                self.task_id,
                msg.kind(),
                msg.loop_round,
                self.round
            );
            return Ok(Vec::new());
        }
        if msg.from == self.peer && !self.seen.insert((msg.loop_round, msg.kind())) {
            warn!(
                "[{}] dropping repeated {:?} for round {}",
                self.task_id,
                msg.kind(),
                msg.loop_round
            );
            return Ok(Vec::new());
        }
        match msg.payload {
            TrainPayload::MsgPsiEnc { enc_ids } => self.on_psi_enc(enc_ids),
            TrainPayload::MsgPsiReEnc { re_enc_ids } => self.on_psi_re_enc(re_enc_ids),
            TrainPayload::MsgPsiIntersect => self.on_psi_intersect(),
            TrainPayload::MsgTrainSet { train_set } => self.on_train_set(train_set),
            TrainPayload::MsgHomoPubkey { homo_pubkey } => self.on_homo_pubkey(homo_pubkey),
            TrainPayload::MsgTrainHup => self.on_hup(),
            TrainPayload::MsgTrainLoop => self.on_loop(),
            TrainPayload::MsgCheckPauseRound => self.on_check_pause(),
            TrainPayload::MsgContinueLoop { pause_round } => self.on_continue(pause_round),
            TrainPayload::MsgTrainCalLocalGradCost => self.on_cal_local(),
            TrainPayload::MsgTrainPartBytes { part_bytes } => {
                self.scratch.peer_part = Some(part_bytes);
                Ok(self.try_cal_enc())
            }
            TrainPayload::MsgTrainCalEncGradCost => self.on_cal_enc(),
            TrainPayload::MsgTrainEncGradCost { enc_grad, enc_cost } => {
                self.scratch.peer_enc = Some((enc_grad, enc_cost));
                Ok(self.try_dec())
            }
            TrainPayload::MsgTrainDecLocalGradCost => self.on_dec_local(),
            TrainPayload::MsgTrainGradAndCost {
                grad_bytes,
                cost_bytes,
            } => {
                self.scratch.opened = Some((grad_bytes, cost_bytes));
                Ok(self.try_upd())
            }
            TrainPayload::MsgTrainUpdCostGrad => self.on_upd_cost_grad(),
            TrainPayload::MsgTrainStatus { stopped } => {
                self.scratch.peer_stopped = Some(stopped);
                Ok(self.try_check())
            }
            TrainPayload::MsgTrainCheckStatus => self.on_check_status(),
            TrainPayload::MsgTrainModels => self.on_models(),
        }
    }

    // ---- PSI ----------------------------------------------------------

    fn psi_mut(&mut self) -> Result<&mut Psi> {
        let task_id = self.task_id.clone();
        self.psi
            .as_mut()
            .ok_or_else(|| DcpError::PsiIntersectParts(format!("{}: psi not started", task_id)))
    }

    fn on_psi_enc(&mut self, enc_ids: Vec<Vec<u8>>) -> Result<Vec<Outbound>> {
        if self.state != TrainState::StartPsi {
            return Err(DcpError::Param(format!("{}: psi message after psi", self.task_id)));
        }
        let peer = self.peer.clone();
        let re_enc_ids = self.psi_mut()?.re_encrypt(&peer, enc_ids)?;
        Ok(vec![
            self.to_peer(TrainPayload::MsgPsiReEnc { re_enc_ids }),
            self.to_self(TrainPayload::MsgPsiIntersect),
        ])
    }

    fn on_psi_re_enc(&mut self, re_enc_ids: Vec<Vec<u8>>) -> Result<Vec<Outbound>> {
        if self.state != TrainState::StartPsi {
            return Err(DcpError::Param(format!("{}: psi message after psi", self.task_id)));
        }
        self.psi_mut()?.set_own_final(re_enc_ids)?;
        Ok(vec![self.to_self(TrainPayload::MsgPsiIntersect)])
    }

    fn on_psi_intersect(&mut self) -> Result<Vec<Outbound>> {
        if self.state != TrainState::StartPsi {
            return Ok(Vec::new());
        }
        let intersection = match self.psi_mut()?.intersect_parts()? {
            Some(i) => i,
            None => return Ok(Vec::new()),
        };
        if intersection.rows.is_empty() {
            return Err(DcpError::PsiIntersectParts(format!(
                "{}: empty intersection",
                self.task_id
            )));
        }
        let raw = self
            .raw
            .take()
            .ok_or_else(|| DcpError::Internal("raw rows missing after psi".into()))?;
        let aligned = raw.select(&intersection.rows).map_err(|e| {
            DcpError::PsiRearrangeFile(format!("{}: {}", self.task_id, e))
        })?;
        if aligned.ids != intersection.ids {
            return Err(DcpError::PsiRearrangeFile(format!(
                "{}: aligned ids differ from intersection",
                self.task_id
            )));
        }
        self.psi = None;
        self.on_aligned(aligned)
    }

    fn on_train_set(&mut self, train_set: DataSet) -> Result<Vec<Outbound>> {
        if self.state != TrainState::StartPsi || self.psi.is_some() {
            return Err(DcpError::Param(format!(
                "{}: train set delivered to a learner running psi",
                self.task_id
            )));
        }
        self.on_aligned(train_set)
    }

    fn on_aligned(&mut self, data: DataSet) -> Result<Vec<Outbound>> {
        if data.has_label() != self.params.is_tag_part {
            return Err(DcpError::GetTrainSet(format!(
                "{}: label presence does not match party role",
                self.task_id
            )));
        }
        self.state = TrainState::EndPsi;
        info!("[{}] {} aligned rows", self.task_id, data.len());
        let mut out = Vec::new();
        if self.role == Role::UserLearner {
            out.push(Outbound::Event(LearnerEvent::Aligned { data: data.clone() }));
        }

        let prepared = preprocess::standardize(&data, self.algorithm)?;
        self.theta = DVector::zeros(prepared.x.ncols());
        self.prepared = Some(prepared);
        self.aligned = Some(data);
        let keys = paillier::generate_keypair(self.key_bits)?;
        let homo_pubkey = keys.public_key().clone();
        self.keys = Some(keys);
        self.state = TrainState::StartTrain;
        out.push(self.to_peer(TrainPayload::MsgHomoPubkey { homo_pubkey }));
        out.extend(self.try_hup());
        Ok(out)
    }

    // ---- handshake ----------------------------------------------------

    fn on_homo_pubkey(&mut self, pk: PublicKey) -> Result<Vec<Outbound>> {
        if let Some(existing) = &self.peer_pk {
            if *existing != pk {
                return Err(DcpError::Param(format!(
                    "{}: peer changed its homomorphic key",
                    self.task_id
                )));
            }
            return Ok(Vec::new());
        }
        if pk.bits() < 128 {
            return Err(DcpError::Param(format!("{}: peer key too short", self.task_id)));
        }
        self.peer_pk = Some(pk);
        Ok(self.try_hup())
    }

    fn try_hup(&mut self) -> Vec<Outbound> {
        if self.state == TrainState::StartTrain && self.peer_pk.is_some() && self.keys.is_some() {
            self.state = TrainState::Hup;
            return vec![self.to_self(TrainPayload::MsgTrainHup)];
        }
        Vec::new()
    }

    fn on_hup(&mut self) -> Result<Vec<Outbound>> {
        if self.state != TrainState::Hup {
            return Err(self.unexpected("MsgTrainHup"));
        }
        info!("[{}] keys exchanged, training starts", self.task_id);
        Ok(vec![self.to_self(TrainPayload::MsgTrainLoop)])
    }

    // ---- loop round ---------------------------------------------------

    fn unexpected(&self, what: &str) -> DcpError {
        DcpError::Internal(format!(
            "{}: {} in state {:?} round {}",
            self.task_id, what, self.state, self.round
        ))
    }

    fn on_loop(&mut self) -> Result<Vec<Outbound>> {
        if !matches!(self.state, TrainState::Hup | TrainState::CheckStatus) {
            return Err(self.unexpected("MsgTrainLoop"));
        }
        self.state = TrainState::Hup;
        Ok(vec![self.to_self(TrainPayload::MsgCheckPauseRound)])
    }

    fn needs_pause(&self) -> bool {
        match self.pause_interval {
            Some(interval) => {
                self.round > 0
                    && self.round % interval == 0
                    && self.released_round != Some(self.round)
            }
            None => false,
        }
    }

    fn on_check_pause(&mut self) -> Result<Vec<Outbound>> {
        if self.state != TrainState::Hup {
            return Err(self.unexpected("MsgCheckPauseRound"));
        }
        if self.needs_pause() {
            self.paused_at = Some(self.round);
            info!("[{}] paused at round {}", self.task_id, self.round);
            let model = self.snapshot()?;
            return Ok(vec![Outbound::Event(LearnerEvent::Paused {
                round: self.round,
                model,
            })]);
        }
        self.state = TrainState::CalLocal;
        Ok(vec![self.to_self(TrainPayload::MsgTrainCalLocalGradCost)])
    }

    fn on_continue(&mut self, pause_round: u64) -> Result<Vec<Outbound>> {
        self.released_round = Some(pause_round);
        if self.paused_at == Some(pause_round) && self.state == TrainState::Hup {
            self.paused_at = None;
            info!("[{}] released at round {}", self.task_id, pause_round);
            self.state = TrainState::CalLocal;
            return Ok(vec![self.to_self(TrainPayload::MsgTrainCalLocalGradCost)]);
        }
        debug!(
            "[{}] continue for round {} while not paused there",
            self.task_id, pause_round
        );
        Ok(Vec::new())
    }

    fn batch(&self) -> Result<(DMatrix<f64>, Option<DVector<f64>>, Range<usize>)> {
        let prepared = self
            .prepared
            .as_ref()
            .ok_or_else(|| self.unexpected("batch before alignment"))?;
        let range = gradient::batch_range(prepared.x.nrows(), self.params.batch_size, self.round);
        let x = prepared.x.rows(range.start, range.len()).into_owned();
        let y = prepared
            .y
            .as_ref()
            .map(|y| y.rows(range.start, range.len()).into_owned());
        Ok((x, y, range))
    }

    fn on_cal_local(&mut self) -> Result<Vec<Outbound>> {
        if self.state != TrainState::CalLocal {
            return Err(self.unexpected("MsgTrainCalLocalGradCost"));
        }
        let (x, y, range) = self.batch()?;
        let part = gradient::local_part(
            self.algorithm,
            &x,
            &self.theta,
            y.as_ref(),
            self.params.reg_mode,
            self.params.lambda,
        )?;
        let keys = self
            .keys
            .as_ref()
            .ok_or_else(|| self.unexpected("local part without keys"))?;
        let bundle = gradient::encrypt_part(keys.public_key(), &self.fp, &part)?;
        self.scratch.local = Some(part);
        self.scratch.batch = Some(range);
        self.state = TrainState::ExchangePart;
        let mut out = vec![self.to_peer(TrainPayload::MsgTrainPartBytes { part_bytes: bundle })];
        out.extend(self.try_cal_enc());
        Ok(out)
    }

    fn try_cal_enc(&mut self) -> Vec<Outbound> {
        if self.state == TrainState::ExchangePart
            && self.scratch.local.is_some()
            && self.scratch.peer_part.is_some()
        {
            self.state = TrainState::CalEnc;
            return vec![self.to_self(TrainPayload::MsgTrainCalEncGradCost)];
        }
        Vec::new()
    }

    fn on_cal_enc(&mut self) -> Result<Vec<Outbound>> {
        if self.state != TrainState::CalEnc {
            return Err(self.unexpected("MsgTrainCalEncGradCost"));
        }
        let (x, _, _) = self.batch()?;
        let peer_pk = self
            .peer_pk
            .as_ref()
            .ok_or_else(|| self.unexpected("encrypted step without peer key"))?;
        let (local, peer_part) = match (&self.scratch.local, &self.scratch.peer_part) {
            (Some(l), Some(p)) => (l, p),
            _ => return Err(self.unexpected("encrypted step without parts")),
        };
        let (enc_grad, enc_cost, masks) =
            gradient::masked_grad_and_cost(peer_pk, &self.fp, &x, local, peer_part)?;
        self.scratch.masks = Some(masks);
        self.state = TrainState::ExchangeEnc;
        let mut out = vec![self.to_peer(TrainPayload::MsgTrainEncGradCost { enc_grad, enc_cost })];
        out.extend(self.try_dec());
        Ok(out)
    }

    fn try_dec(&mut self) -> Vec<Outbound> {
        if self.state == TrainState::ExchangeEnc && self.scratch.peer_enc.is_some() {
            self.state = TrainState::DecLocal;
            return vec![self.to_self(TrainPayload::MsgTrainDecLocalGradCost)];
        }
        Vec::new()
    }

    fn on_dec_local(&mut self) -> Result<Vec<Outbound>> {
        if self.state != TrainState::DecLocal {
            return Err(self.unexpected("MsgTrainDecLocalGradCost"));
        }
        let keys = self
            .keys
            .as_ref()
            .ok_or_else(|| self.unexpected("decrypt without keys"))?;
        let (enc_grad, enc_cost) = self
            .scratch
            .peer_enc
            .take()
            .ok_or_else(|| self.unexpected("decrypt without ciphertexts"))?;
        let grads = gradient::decrypt_masked(keys, &enc_grad)?;
        let cost = keys.decrypt(&enc_cost)?;
        self.state = TrainState::ExchangeDec;
        let mut out = vec![self.to_peer(TrainPayload::MsgTrainGradAndCost {
            grad_bytes: grads.into_iter().map(MaskedValue).collect(),
            cost_bytes: MaskedValue(cost),
        })];
        out.extend(self.try_upd());
        Ok(out)
    }

    fn try_upd(&mut self) -> Vec<Outbound> {
        if self.state == TrainState::ExchangeDec && self.scratch.opened.is_some() {
            self.state = TrainState::UpdCostGrad;
            return vec![self.to_self(TrainPayload::MsgTrainUpdCostGrad)];
        }
        Vec::new()
    }

    fn on_upd_cost_grad(&mut self) -> Result<Vec<Outbound>> {
        if self.state != TrainState::UpdCostGrad {
            return Err(self.unexpected("MsgTrainUpdCostGrad"));
        }
        let peer_pk = self
            .peer_pk
            .as_ref()
            .ok_or_else(|| self.unexpected("update without peer key"))?;
        let (grad_bytes, cost_bytes) = self
            .scratch
            .opened
            .take()
            .ok_or_else(|| self.unexpected("update without decrypted values"))?;
        let masks = self
            .scratch
            .masks
            .take()
            .ok_or_else(|| self.unexpected("update without masks"))?;
        if grad_bytes.len() != masks.grad.len() {
            return Err(DcpError::Encoding(format!(
                "{}: peer returned {} gradients, expected {}",
                self.task_id,
                grad_bytes.len(),
                masks.grad.len()
            )));
        }
        let m = self.scratch.batch.as_ref().map(|r| r.len()).unwrap_or(1);
        let grad: Vec<f64> = grad_bytes
            .iter()
            .zip(masks.grad.iter())
            .map(|(v, r)| gradient::unmask(peer_pk, &self.fp, &v.0, r, m))
            .collect();
        let cost = gradient::unmask(peer_pk, &self.fp, &cost_bytes.0, &masks.cost, m);
        if !cost.is_finite() || grad.iter().any(|g| !g.is_finite()) {
            return Err(DcpError::Internal(format!(
                "{}: cost diverged at round {}",
                self.task_id, self.round
            )));
        }

        self.theta = gradient::update_theta(
            &self.theta,
            &grad,
            self.params.alpha,
            self.params.lambda,
            self.params.reg_mode,
            m,
        )?;
        let stopped = match self.prev_cost {
            Some(prev) if self.round >= 1 => (cost - prev).abs() < self.params.amplitude,
            _ => false,
        };
        info!("[{}] round {} cost={:.6} stopped={}", self.task_id, self.round, cost, stopped);
        self.prev_cost = Some(cost);
        self.scratch.stopped = Some(stopped);
        self.state = TrainState::Status;
        let mut out = vec![self.to_peer(TrainPayload::MsgTrainStatus { stopped })];
        out.extend(self.try_check());
        Ok(out)
    }

    fn try_check(&mut self) -> Vec<Outbound> {
        if self.state == TrainState::Status && self.scratch.peer_stopped.is_some() {
            self.state = TrainState::CheckStatus;
            return vec![self.to_self(TrainPayload::MsgTrainCheckStatus)];
        }
        Vec::new()
    }

    fn on_check_status(&mut self) -> Result<Vec<Outbound>> {
        if self.state != TrainState::CheckStatus {
            return Err(self.unexpected("MsgTrainCheckStatus"));
        }
        let both_stopped =
            self.scratch.stopped == Some(true) && self.scratch.peer_stopped == Some(true);
        let exhausted = self.round + 1 >= self.params.max_rounds;
        if both_stopped || exhausted {
            if exhausted && !both_stopped {
                info!("[{}] reached max rounds {}", self.task_id, self.params.max_rounds);
            }
            return Ok(vec![self.to_self(TrainPayload::MsgTrainModels)]);
        }
        self.round += 1;
        self.scratch = RoundScratch::default();
        let round = self.round;
        self.seen.retain(|(r, kind)| !kind.is_round_scoped() || *r >= round);
        Ok(vec![self.to_self(TrainPayload::MsgTrainLoop)])
    }

    fn on_models(&mut self) -> Result<Vec<Outbound>> {
        if self.state != TrainState::CheckStatus {
            return Err(self.unexpected("MsgTrainModels"));
        }
        let model = self.snapshot()?;
        self.state = TrainState::EndTrain;
        info!(
            "[{}] training finished after {} rounds, cost={:.6}",
            self.task_id, model.rounds, model.final_cost
        );
        Ok(vec![Outbound::Event(LearnerEvent::Finished { model })])
    }

    /// Model built from the current coefficients
    pub fn snapshot(&self) -> Result<Model> {
        let (prepared, data) = match (&self.prepared, &self.aligned) {
            (Some(p), Some(d)) => (p, d),
            _ => return Err(self.unexpected("model before alignment")),
        };
        let label = match (&data.label, prepared.label_stats) {
            (Some(name), Some((mean, std))) => Some((name.as_str(), mean, std)),
            (Some(name), None) => Some((name.as_str(), 0.0, 1.0)),
            _ => None,
        };
        let mut model = Model::from_theta(
            self.algorithm,
            &self.theta,
            &data.features,
            &prepared.xbars,
            &prepared.sigmas,
            label,
            self.params.label_name.clone(),
            &self.params.id_name,
        );
        model.rounds = self.round + 1;
        model.final_cost = self.prev_cost.unwrap_or(f64::NAN);
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfl::params::LiveEvalParams;
    use std::collections::VecDeque;

    fn task(id: &str, peer: &str, tag: bool, algorithm: Algorithm) -> TrainTask {
        TrainTask {
            task_id: id.into(),
            algorithm,
            params: TrainParams {
                alpha: 0.5,
                amplitude: 1e-6,
                accuracy: 8,
                is_tag_part: tag,
                label: if tag { "y".into() } else { String::new() },
                label_name: Some("1".into()),
                max_rounds: 15,
                ..TrainParams::default()
            },
            peer: peer.into(),
            eval_params: None,
            lival_params: None,
        }
    }

    fn data(ids: &[&str], rows: Vec<Vec<f64>>, labels: Option<Vec<f64>>) -> DataSet {
        DataSet {
            id_name: "id".into(),
            ids: ids.iter().map(|s| s.to_string()).collect(),
            features: (0..rows[0].len()).map(|j| format!("f{}", j)).collect(),
            rows,
            label: labels.as_ref().map(|_| "y".to_string()),
            labels,
        }
    }

    /// Deliver messages between two learners until both are idle
    fn pump(a: &mut Learner, b: &mut Learner, mut queue: VecDeque<(bool, TrainMessage)>) -> Vec<(bool, LearnerEvent)> {
        let mut events = Vec::new();
        let mut steps = 0;
        while let Some((to_a, msg)) = queue.pop_front() {
            steps += 1;
            assert!(steps < 10_000, "protocol did not settle");
            let learner = if to_a { &mut *a } else { &mut *b };
            for out in learner.handle(msg).unwrap() {
                match out {
                    Outbound::Peer(m) => queue.push_back((!to_a, m)),
                    Outbound::Local(m) => queue.push_back((to_a, m)),
                    Outbound::Event(e) => events.push((to_a, e)),
                }
            }
        }
        events
    }

    fn start_both(a: &mut Learner, b: &mut Learner) -> VecDeque<(bool, TrainMessage)> {
        let mut queue = VecDeque::new();
        for out in a.start().unwrap() {
            if let Outbound::Peer(m) = out {
                queue.push_back((false, m));
            }
        }
        for out in b.start().unwrap() {
            if let Outbound::Peer(m) = out {
                queue.push_back((true, m));
            }
        }
        queue
    }

    #[test]
    fn test_two_party_linear_training_converges() {
        // y = 2·f0 + 3·g0 + 1 on aligned rows; party B holds g0 and y
        let xs = [0.0, 1.0, 2.0, 3.0, 4.0, 5.0];
        let gs = [1.0, 0.0, 2.0, 1.0, 3.0, 2.0];
        let ids: Vec<String> = (0..6).map(|i| i.to_string()).collect();
        let id_refs: Vec<&str> = ids.iter().map(|s| s.as_str()).collect();
        let a_rows = xs.iter().map(|v| vec![*v]).collect();
        let b_rows = gs.iter().map(|v| vec![*v]).collect();
        let y = xs.iter().zip(gs.iter()).map(|(x, g)| 2.0 * x + 3.0 * g + 1.0).collect();

        let mut a = Learner::new(
            &task("lin", "B", false, Algorithm::LinRegVL),
            Role::UserLearner,
            "A",
            Some(data(&id_refs, a_rows, None)),
            128,
        )
        .unwrap();
        let mut b = Learner::new(
            &task("lin", "A", true, Algorithm::LinRegVL),
            Role::UserLearner,
            "B",
            Some(data(&id_refs, b_rows, Some(y))),
            128,
        )
        .unwrap();

        let queue = start_both(&mut a, &mut b);
        let events = pump(&mut a, &mut b, queue);
        assert!(a.is_finished() && b.is_finished());
        assert_eq!(a.round(), b.round());
        let aligned = events
            .iter()
            .filter(|(_, e)| matches!(e, LearnerEvent::Aligned { .. }))
            .count();
        assert_eq!(aligned, 2);

        let costs: Vec<f64> = events
            .iter()
            .filter_map(|(_, e)| match e {
                LearnerEvent::Finished { model } => Some(model.final_cost),
                _ => None,
            })
            .collect();
        assert_eq!(costs.len(), 2);
        assert!((costs[0] - costs[1]).abs() < 1e-6);
        // standardized label starts with cost 0.5, full batch descent must shrink it
        assert!(costs[0] < 0.1, "cost {}", costs[0]);
    }

    fn finished_models(events: &[(bool, LearnerEvent)]) -> (Model, Model) {
        let pick = |side: bool| {
            events
                .iter()
                .find_map(|(to_a, e)| match e {
                    LearnerEvent::Finished { model } if *to_a == side => Some(model.clone()),
                    _ => None,
                })
                .unwrap()
        };
        (pick(true), pick(false))
    }

    /// Plain full-batch gradient descent over the joined design matrix
    fn centralized_descent(
        xa: &DMatrix<f64>,
        xb: &DMatrix<f64>,
        y: &DVector<f64>,
        alpha: f64,
        rounds: usize,
    ) -> (DVector<f64>, DVector<f64>) {
        let m = y.len() as f64;
        let mut ta = DVector::zeros(xa.ncols());
        let mut tb = DVector::zeros(xb.ncols());
        for _ in 0..rounds {
            let r = xa * &ta + xb * &tb - y;
            let ga = xa.transpose() * &r / m;
            let gb = xb.transpose() * &r / m;
            ta -= ga * alpha;
            tb -= gb * alpha;
        }
        (ta, tb)
    }

    #[test]
    fn test_linear_coefficients_match_centralized_descent() {
        let (da, db) = descent_data();
        let (mut a, mut b) = descent_pair(&da, &db);
        let queue = start_both(&mut a, &mut b);
        let events = pump(&mut a, &mut b, queue);
        assert_matches_centralized(&events, &da, &db);
    }

    #[test]
    fn test_repeated_peer_steps_are_applied_once() {
        let (da, db) = descent_data();
        let (mut a, mut b) = descent_pair(&da, &db);
        let mut queue = start_both(&mut a, &mut b);
        // a retried delivery hands every peer step over twice
        let mut events = Vec::new();
        let mut steps = 0;
        while let Some((to_a, msg)) = queue.pop_front() {
            steps += 1;
            assert!(steps < 20_000, "protocol did not settle");
            let learner = if to_a { &mut a } else { &mut b };
            for out in learner.handle(msg).unwrap() {
                match out {
                    Outbound::Peer(m) => {
                        queue.push_back((!to_a, m.clone()));
                        queue.push_back((!to_a, m));
                    }
                    Outbound::Local(m) => queue.push_back((to_a, m)),
                    Outbound::Event(e) => events.push((to_a, e)),
                }
            }
        }
        assert_matches_centralized(&events, &da, &db);
    }

    /// A holds `f0, f1`; B holds `g0` and a noisy linear label
    fn descent_data() -> (DataSet, DataSet) {
        let f0 = [0.5, 1.0, 2.5, 3.0, 4.5, 5.0, 6.5, 7.0];
        let f1 = [2.0, -1.0, 0.5, 1.5, -2.0, 3.0, 0.0, 1.0];
        let g0 = [1.0, 0.0, 2.0, 1.0, 3.0, 2.0, 4.0, 0.5];
        let ids: Vec<String> = (0..8).map(|i| i.to_string()).collect();
        let id_refs: Vec<&str> = ids.iter().map(|s| s.as_str()).collect();
        let a_rows: Vec<Vec<f64>> = (0..8).map(|i| vec![f0[i], f1[i]]).collect();
        let b_rows: Vec<Vec<f64>> = (0..8).map(|i| vec![g0[i]]).collect();
        let y: Vec<f64> = (0..8)
            .map(|i| 1.5 * f0[i] - 2.0 * f1[i] + 0.7 * g0[i] + 3.0 + 0.1 * (i % 3) as f64)
            .collect();
        (data(&id_refs, a_rows, None), data(&id_refs, b_rows, Some(y)))
    }

    fn descent_pair(da: &DataSet, db: &DataSet) -> (Learner, Learner) {
        let configure = |mut t: TrainTask| {
            t.params.alpha = 0.1;
            t.params.amplitude = 1e-15;
            t.params.accuracy = 10;
            t.params.max_rounds = 10;
            t
        };
        let mut a = Learner::new(
            &configure(task("ref", "B", false, Algorithm::LinRegVL)),
            Role::UserLearner,
            "A",
            Some(da.clone()),
            128,
        )
        .unwrap();
        let mut b = Learner::new(
            &configure(task("ref", "A", true, Algorithm::LinRegVL)),
            Role::UserLearner,
            "B",
            Some(db.clone()),
            128,
        )
        .unwrap();
        (a, b)
    }

    /// Both halves ran 10 rounds and agree with plain gradient descent
    fn assert_matches_centralized(events: &[(bool, LearnerEvent)], da: &DataSet, db: &DataSet) {
        let (ma, mb) = finished_models(events);
        assert_eq!(ma.rounds, 10);
        assert_eq!(mb.rounds, 10);

        let pa = preprocess::standardize(da, Algorithm::LinRegVL).unwrap();
        let pb = preprocess::standardize(db, Algorithm::LinRegVL).unwrap();
        let (ta, tb) = centralized_descent(&pa.x, &pb.x, pb.y.as_ref().unwrap(), 0.1, 10);
        let got_a = ma.theta_vector().unwrap();
        let got_b = mb.theta_vector().unwrap();
        for (got, want) in got_a.iter().zip(ta.iter()).chain(got_b.iter().zip(tb.iter())) {
            assert!((got - want).abs() < 1e-6, "theta {} vs centralized {}", got, want);
        }
        assert!(ta.iter().chain(tb.iter()).any(|t| t.abs() > 0.01));
    }

    /// Grid points with `|f + g| >= 1`, labelled by the sign of `f + g`
    fn grid(values: &[f64]) -> (Vec<String>, Vec<f64>, Vec<f64>, Vec<f64>) {
        let (mut ids, mut fs, mut gs, mut ys) = (Vec::new(), Vec::new(), Vec::new(), Vec::new());
        for f in values {
            for g in values {
                if (f + g).abs() < 1.0 {
                    continue;
                }
                ids.push(format!("{}:{}", f, g));
                fs.push(*f);
                gs.push(*g);
                ys.push(if f + g > 0.0 { 1.0 } else { 0.0 });
            }
        }
        (ids, fs, gs, ys)
    }

    #[test]
    fn test_logistic_model_classifies_held_out_rows() {
        let (ids, fs, gs, ys) = grid(&[-3.0, -2.0, -1.0, 0.0, 1.0, 2.0, 3.0]);
        let id_refs: Vec<&str> = ids.iter().map(|s| s.as_str()).collect();
        let da = data(&id_refs, fs.iter().map(|v| vec![*v]).collect(), None);
        let db = data(&id_refs, gs.iter().map(|v| vec![*v]).collect(), Some(ys));
        let mut a = Learner::new(
            &task("sep", "B", false, Algorithm::LogRegVL),
            Role::UserLearner,
            "A",
            Some(da),
            128,
        )
        .unwrap();
        let mut b = Learner::new(
            &task("sep", "A", true, Algorithm::LogRegVL),
            Role::UserLearner,
            "B",
            Some(db),
            128,
        )
        .unwrap();
        let queue = start_both(&mut a, &mut b);
        let events = pump(&mut a, &mut b, queue);
        let (ma, mb) = finished_models(&events);

        let (vids, vfs, vgs, vys) = grid(&[-2.5, -1.5, -0.5, 0.5, 1.5, 2.5]);
        let vid_refs: Vec<&str> = vids.iter().map(|s| s.as_str()).collect();
        let va = data(&vid_refs, vfs.iter().map(|v| vec![*v]).collect(), None);
        let vb = data(&vid_refs, vgs.iter().map(|v| vec![*v]).collect(), Some(vys.clone()));
        let peer = ma.partial_scores(&va).unwrap();
        let own = mb.partial_scores(&vb).unwrap();
        let probs = mb.finish_scores(&own, &peer).unwrap();
        let hits = probs
            .iter()
            .zip(&vys)
            .filter(|(p, y)| (if **p >= 0.5 { 1.0 } else { 0.0 }) == **y)
            .count();
        assert!(vys.len() >= 20);
        assert!(
            hits as f64 >= 0.95 * vys.len() as f64,
            "accuracy {}/{}",
            hits,
            vys.len()
        );
    }

    #[test]
    fn test_pause_round_waits_for_continue() {
        let ids = ["1", "2", "3", "4"];
        let mut ta = task("live", "B", false, Algorithm::LogRegVL);
        ta.lival_params = Some(LiveEvalParams {
            enable: true,
            trigger_interval: 2,
            percent_lo: 10,
        });
        let mut tb = task("live", "A", true, Algorithm::LogRegVL);
        tb.lival_params = ta.lival_params.clone();

        let mut a = Learner::new(&ta, Role::EvalLearner, "A", None, 128).unwrap();
        let mut b = Learner::new(&tb, Role::LiveEvalInnerLearner, "B", None, 128).unwrap();
        let train_a = data(&ids, vec![vec![0.1], vec![0.9], vec![0.2], vec![0.8]], None);
        let train_b = data(
            &ids,
            vec![vec![1.0], vec![0.0], vec![1.0], vec![0.0]],
            Some(vec![0.0, 1.0, 0.0, 1.0]),
        );
        let mut queue = VecDeque::new();
        queue.push_back((true, a.msg("A", TrainPayload::MsgTrainSet { train_set: train_a })));
        queue.push_back((false, b.msg("B", TrainPayload::MsgTrainSet { train_set: train_b })));
        let events = pump(&mut a, &mut b, queue);

        // evaluation learners never pause; the inner learner pauses at round 2
        assert!(!events.iter().any(|(to_a, _)| *to_a));
        let paused: Vec<u64> = events
            .iter()
            .filter_map(|(_, e)| match e {
                LearnerEvent::Paused { round, .. } => Some(*round),
                _ => None,
            })
            .collect();
        assert_eq!(paused, vec![2]);
        assert_eq!(b.round(), 2);
        assert!(!b.is_finished());

        let mut queue = VecDeque::new();
        queue.push_back((false, b.msg("B", TrainPayload::MsgContinueLoop { pause_round: 2 })));
        let events = pump(&mut a, &mut b, queue);
        assert!(events
            .iter()
            .any(|(_, e)| matches!(e, LearnerEvent::Paused { round: 4, .. })));
    }

    #[test]
    fn test_stale_round_messages_are_dropped() {
        let mut a = Learner::new(
            &task("t", "B", false, Algorithm::LinRegVL),
            Role::UserLearner,
            "A",
            None,
            128,
        )
        .unwrap();
        let mut msg = a.msg("A", TrainPayload::MsgTrainStatus { stopped: true });
        msg.loop_round = 7;
        assert!(a.handle(msg).unwrap().is_empty());
    }

    #[test]
    fn test_empty_intersection_fails() {
        let mut a = Learner::new(
            &task("e", "B", false, Algorithm::LinRegVL),
            Role::UserLearner,
            "A",
            Some(data(&["1"], vec![vec![1.0]], None)),
            128,
        )
        .unwrap();
        let mut b = Learner::new(
            &task("e", "A", true, Algorithm::LinRegVL),
            Role::UserLearner,
            "B",
            Some(data(&["2"], vec![vec![1.0]], Some(vec![1.0]))),
            128,
        )
        .unwrap();
        let mut queue = start_both(&mut a, &mut b);
        let mut failed = false;
        while let Some((to_a, msg)) = queue.pop_front() {
            let learner = if to_a { &mut a } else { &mut b };
            match learner.handle(msg) {
                Ok(outs) => {
                    for out in outs {
                        match out {
                            Outbound::Peer(m) => queue.push_back((!to_a, m)),
                            Outbound::Local(m) => queue.push_back((to_a, m)),
                            Outbound::Event(_) => {}
                        }
                    }
                }
                Err(e) => {
                    assert_eq!(e.code(), 10013);
                    failed = true;
                }
            }
        }
        assert!(failed);
    }
}
