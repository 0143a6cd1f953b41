//! `Step` RPC payloads exchanged between MPC nodes

use crate::crypto::bytes_hex;
use crate::error::{DcpError, Result};
use crate::vfl::{Algorithm, PredictMessage, TrainMessage};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainRequest {
    pub task_id: String,
    pub algorithm: Algorithm,
    /// Serialized `TrainMessage`
    #[serde(with = "bytes_hex")]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictRequest {
    pub task_id: String,
    pub algorithm: Algorithm,
    /// Serialized `PredictMessage`
    #[serde(with = "bytes_hex")]
    pub payload: Vec<u8>,
}

/// Argument of the single `Step` RPC
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum StepRequest {
    Train(TrainRequest),
    Predict(PredictRequest),
}

impl StepRequest {
    pub fn train(algorithm: Algorithm, msg: &TrainMessage) -> Result<Self> {
        Ok(StepRequest::Train(TrainRequest {
            task_id: msg.task_id.clone(),
            algorithm,
            payload: msg.to_bytes()?,
        }))
    }

    pub fn predict(algorithm: Algorithm, msg: &PredictMessage) -> Result<Self> {
        Ok(StepRequest::Predict(PredictRequest {
            task_id: msg.task_id.clone(),
            algorithm,
            payload: msg.to_bytes()?,
        }))
    }

    pub fn task_id(&self) -> &str {
        match self {
            StepRequest::Train(r) => &r.task_id,
            StepRequest::Predict(r) => &r.task_id,
        }
    }
}

impl TrainRequest {
    pub fn message(&self) -> Result<TrainMessage> {
        let msg = TrainMessage::from_bytes(&self.payload)?;
        if msg.task_id != self.task_id {
            return Err(DcpError::Param(format!(
                "payload of task {} routed as {}",
                msg.task_id, self.task_id
            )));
        }
        Ok(msg)
    }
}

impl PredictRequest {
    pub fn message(&self) -> Result<PredictMessage> {
        let msg = PredictMessage::from_bytes(&self.payload)?;
        if msg.task_id != self.task_id {
            return Err(DcpError::Param(format!(
                "payload of task {} routed as {}",
                msg.task_id, self.task_id
            )));
        }
        Ok(msg)
    }
}

/// Acknowledgement of a delivered step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepAck {
    /// False when the task was unknown and the message was stashed
    pub delivered: bool,
}
