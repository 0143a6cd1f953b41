//! Two-party prediction with trained model halves
//!
//! After an optional PSI, each party scores its own columns. The non-label
//! party sends its partial scores to the label party, which combines them,
//! applies the link function and returns the final values.

use super::dataset::DataSet;
use super::message::{PredictMessage, PredictMessageType, PredictPayload};
use super::model::Model;
use super::params::Algorithm;
use crate::error::{DcpError, Result};
use crate::psi::Psi;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Output delivered to both parties
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictResult {
    pub task_id: String,
    pub algorithm: Algorithm,
    pub ids: Vec<String>,
    /// Probabilities (logistic) or label-scale values (linear)
    pub values: Vec<f64>,
    /// Ground truth of the scored rows, label party only
    pub labels: Option<Vec<f64>>,
}

impl PredictResult {
    /// Hard classes for a logistic result
    pub fn classes(&self, threshold: f64) -> Vec<f64> {
        self.values
            .iter()
            .map(|p| if *p >= threshold { 1.0 } else { 0.0 })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub enum PredictOutbound {
    Peer(PredictMessage),
    Local(PredictMessage),
    Finished(PredictResult),
}

pub struct Predictor {
    task_id: String,
    local: String,
    peer: String,
    model: Model,
    raw: Option<DataSet>,
    pre_aligned: bool,
    psi: Option<Psi>,
    aligned: Option<DataSet>,
    own_scores: Option<Vec<f64>>,
    peer_scores: Option<Vec<f64>>,
    /// Peer steps already applied
    seen: HashSet<PredictMessageType>,
    done: bool,
}

impl Predictor {
    /// `pre_aligned` skips PSI (rows already in the peer's order)
    pub fn new(
        task_id: &str,
        local: &str,
        peer: &str,
        model: Model,
        data: DataSet,
        pre_aligned: bool,
    ) -> Self {
        Self {
            task_id: task_id.to_string(),
            local: local.to_string(),
            peer: peer.to_string(),
            model,
            raw: Some(data),
            pre_aligned,
            psi: None,
            aligned: None,
            own_scores: None,
            peer_scores: None,
            seen: HashSet::new(),
            done: false,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn is_finished(&self) -> bool {
        self.done
    }

    fn msg(&self, to: &str, payload: PredictPayload) -> PredictMessage {
        PredictMessage {
            task_id: self.task_id.clone(),
            from: self.local.clone(),
            to: to.to_string(),
            payload,
        }
    }

    pub fn start(&mut self) -> Result<Vec<PredictOutbound>> {
        if self.pre_aligned {
            self.aligned = self.raw.take();
            return Ok(vec![PredictOutbound::Local(
                self.msg(&self.local, PredictPayload::MsgPredictHup),
            )]);
        }
        let ids = self
            .raw
            .as_ref()
            .map(|d| d.ids.clone())
            .ok_or_else(|| DcpError::GetPredictSet("prediction rows missing".into()))?;
        let psi = Psi::new(ids)?;
        let enc_ids = psi.own_encrypted().to_vec();
        self.psi = Some(psi);
        Ok(vec![PredictOutbound::Peer(
            self.msg(&self.peer, PredictPayload::MsgPsiEnc { enc_ids }),
        )])
    }

    pub fn handle(&mut self, msg: PredictMessage) -> Result<Vec<PredictOutbound>> {
        if self.done {
            return Ok(Vec::new());
        }
        if msg.from == self.peer && !self.seen.insert(msg.kind()) {
            warn!("[{}] dropping repeated {:?}", self.task_id, msg.kind());
            return Ok(Vec::new());
        }
        match msg.payload {
            PredictPayload::MsgPsiEnc { enc_ids } => {
                let peer = self.peer.clone();
                let re_enc_ids = self.psi_mut()?.re_encrypt(&peer, enc_ids)?;
                Ok(vec![
                    PredictOutbound::Peer(self.msg(&self.peer, PredictPayload::MsgPsiReEnc { re_enc_ids })),
                    PredictOutbound::Local(self.msg(&self.local, PredictPayload::MsgPsiIntersect)),
                ])
            }
            PredictPayload::MsgPsiReEnc { re_enc_ids } => {
                self.psi_mut()?.set_own_final(re_enc_ids)?;
                Ok(vec![PredictOutbound::Local(
                    self.msg(&self.local, PredictPayload::MsgPsiIntersect),
                )])
            }
            PredictPayload::MsgPsiIntersect => self.on_intersect(),
            PredictPayload::MsgPredictHup => self.on_hup(),
            PredictPayload::MsgPredictPart { scores } => {
                if !self.model.is_tag_part {
                    return Err(DcpError::Param(format!(
                        "{}: partial scores sent to the non-label party",
                        self.task_id
                    )));
                }
                self.peer_scores = Some(scores);
                self.try_finish()
            }
            PredictPayload::MsgPredictResult { values } => {
                let aligned = self.aligned_ref()?;
                if values.len() != aligned.len() {
                    return Err(DcpError::GetPredictSet(format!(
                        "{}: {} results for {} rows",
                        self.task_id,
                        values.len(),
                        aligned.len()
                    )));
                }
                let result = PredictResult {
                    task_id: self.task_id.clone(),
                    algorithm: self.model.algorithm,
                    ids: aligned.ids.clone(),
                    values,
                    labels: None,
                };
                self.done = true;
                Ok(vec![PredictOutbound::Finished(result)])
            }
        }
    }

    fn psi_mut(&mut self) -> Result<&mut Psi> {
        let task_id = self.task_id.clone();
        self.psi
            .as_mut()
            .ok_or_else(|| DcpError::PsiIntersectParts(format!("{}: psi not started", task_id)))
    }

    fn aligned_ref(&self) -> Result<&DataSet> {
        self.aligned
            .as_ref()
            .ok_or_else(|| DcpError::GetPredictSet(format!("{}: rows not aligned", self.task_id)))
    }

    fn on_intersect(&mut self) -> Result<Vec<PredictOutbound>> {
        if self.aligned.is_some() {
            return Ok(Vec::new());
        }
        let intersection = match self.psi_mut()?.intersect_parts()? {
            Some(i) => i,
            None => return Ok(Vec::new()),
        };
        let raw = self
            .raw
            .take()
            .ok_or_else(|| DcpError::Internal("prediction rows missing after psi".into()))?;
        let aligned = raw
            .select(&intersection.rows)
            .map_err(|e| DcpError::PsiRearrangeFile(format!("{}: {}", self.task_id, e)))?;
        info!("[{}] {} rows aligned for prediction", self.task_id, aligned.len());
        self.aligned = Some(aligned);
        self.psi = None;
        Ok(vec![PredictOutbound::Local(
            self.msg(&self.local, PredictPayload::MsgPredictHup),
        )])
    }

    fn on_hup(&mut self) -> Result<Vec<PredictOutbound>> {
        let scores = self.model.partial_scores(self.aligned_ref()?)?;
        if self.model.is_tag_part {
            self.own_scores = Some(scores);
            self.try_finish()
        } else {
            Ok(vec![PredictOutbound::Peer(
                self.msg(&self.peer, PredictPayload::MsgPredictPart { scores }),
            )])
        }
    }

    fn try_finish(&mut self) -> Result<Vec<PredictOutbound>> {
        let (own, peer) = match (&self.own_scores, &self.peer_scores) {
            (Some(o), Some(p)) => (o, p),
            _ => return Ok(Vec::new()),
        };
        let values = self.model.finish_scores(own, peer)?;
        let aligned = self.aligned_ref()?;
        let result = PredictResult {
            task_id: self.task_id.clone(),
            algorithm: self.model.algorithm,
            ids: aligned.ids.clone(),
            values: values.clone(),
            labels: aligned.labels.clone(),
        };
        self.done = true;
        info!("[{}] prediction finished for {} rows", self.task_id, values.len());
        Ok(vec![
            PredictOutbound::Peer(self.msg(&self.peer, PredictPayload::MsgPredictResult { values })),
            PredictOutbound::Finished(result),
        ])
    }
}
