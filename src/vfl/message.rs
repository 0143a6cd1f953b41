//! Messages exchanged by the two halves of a training or prediction task
//!
//! Every protocol step is one variant of a tagged enum; the variant name is
//! the message kind. A message is either dispatched to the sending learner
//! itself or delivered to the peer through the MPC transport.

use super::dataset::DataSet;
use super::gradient::PartBundle;
use crate::crypto::paillier::{Ciphertext, PublicKey};
use crate::crypto::{bigint_hex, vec_bytes_hex};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

/// Kinds of training messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    MsgPsiEnc,
    MsgPsiReEnc,
    MsgPsiIntersect,
    MsgTrainHup,
    MsgHomoPubkey,
    MsgTrainLoop,
    MsgTrainCalLocalGradCost,
    MsgTrainPartBytes,
    MsgTrainCalEncGradCost,
    MsgTrainEncGradCost,
    MsgTrainDecLocalGradCost,
    MsgTrainGradAndCost,
    MsgTrainUpdCostGrad,
    MsgTrainStatus,
    MsgTrainCheckStatus,
    MsgTrainModels,
    MsgContinueLoop,
    MsgTrainSet,
    MsgCheckPauseRound,
}

/// A decrypted, still masked residue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskedValue(#[serde(with = "bigint_hex")] pub BigUint);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum TrainPayload {
    MsgPsiEnc {
        #[serde(with = "vec_bytes_hex")]
        enc_ids: Vec<Vec<u8>>,
    },
    MsgPsiReEnc {
        #[serde(with = "vec_bytes_hex")]
        re_enc_ids: Vec<Vec<u8>>,
    },
    MsgPsiIntersect,
    MsgTrainHup,
    MsgHomoPubkey {
        homo_pubkey: PublicKey,
    },
    MsgTrainLoop,
    MsgTrainCalLocalGradCost,
    MsgTrainPartBytes {
        part_bytes: PartBundle,
    },
    MsgTrainCalEncGradCost,
    MsgTrainEncGradCost {
        enc_grad: Vec<Ciphertext>,
        enc_cost: Ciphertext,
    },
    MsgTrainDecLocalGradCost,
    MsgTrainGradAndCost {
        grad_bytes: Vec<MaskedValue>,
        cost_bytes: MaskedValue,
    },
    MsgTrainUpdCostGrad,
    MsgTrainStatus {
        stopped: bool,
    },
    MsgTrainCheckStatus,
    MsgTrainModels,
    MsgContinueLoop {
        pause_round: u64,
    },
    MsgTrainSet {
        train_set: DataSet,
    },
    MsgCheckPauseRound,
}

impl TrainPayload {
    pub fn kind(&self) -> MessageType {
        match self {
            TrainPayload::MsgPsiEnc { .. } => MessageType::MsgPsiEnc,
            TrainPayload::MsgPsiReEnc { .. } => MessageType::MsgPsiReEnc,
            TrainPayload::MsgPsiIntersect => MessageType::MsgPsiIntersect,
            TrainPayload::MsgTrainHup => MessageType::MsgTrainHup,
            TrainPayload::MsgHomoPubkey { .. } => MessageType::MsgHomoPubkey,
            TrainPayload::MsgTrainLoop => MessageType::MsgTrainLoop,
            TrainPayload::MsgTrainCalLocalGradCost => MessageType::MsgTrainCalLocalGradCost,
            TrainPayload::MsgTrainPartBytes { .. } => MessageType::MsgTrainPartBytes,
            TrainPayload::MsgTrainCalEncGradCost => MessageType::MsgTrainCalEncGradCost,
            TrainPayload::MsgTrainEncGradCost { .. } => MessageType::MsgTrainEncGradCost,
            TrainPayload::MsgTrainDecLocalGradCost => MessageType::MsgTrainDecLocalGradCost,
            TrainPayload::MsgTrainGradAndCost { .. } => MessageType::MsgTrainGradAndCost,
            TrainPayload::MsgTrainUpdCostGrad => MessageType::MsgTrainUpdCostGrad,
            TrainPayload::MsgTrainStatus { .. } => MessageType::MsgTrainStatus,
            TrainPayload::MsgTrainCheckStatus => MessageType::MsgTrainCheckStatus,
            TrainPayload::MsgTrainModels => MessageType::MsgTrainModels,
            TrainPayload::MsgContinueLoop { .. } => MessageType::MsgContinueLoop,
            TrainPayload::MsgTrainSet { .. } => MessageType::MsgTrainSet,
            TrainPayload::MsgCheckPauseRound => MessageType::MsgCheckPauseRound,
        }
    }
}

impl MessageType {
    /// Messages whose `loop_round` orders them against the local round
    pub fn is_round_scoped(&self) -> bool {
        !matches!(
            self,
            MessageType::MsgPsiEnc
                | MessageType::MsgPsiReEnc
                | MessageType::MsgPsiIntersect
                | MessageType::MsgHomoPubkey
                | MessageType::MsgTrainSet
                | MessageType::MsgContinueLoop
        )
    }
}

/// One training message with routing header
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainMessage {
    pub task_id: String,
    pub from: String,
    pub to: String,
    pub loop_round: u64,
    pub payload: TrainPayload,
}

impl TrainMessage {
    pub fn kind(&self) -> MessageType {
        self.payload.kind()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

/// Kinds of prediction messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PredictMessageType {
    MsgPsiEnc,
    MsgPsiReEnc,
    MsgPsiIntersect,
    MsgPredictHup,
    MsgPredictPart,
    MsgPredictResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum PredictPayload {
    MsgPsiEnc {
        #[serde(with = "vec_bytes_hex")]
        enc_ids: Vec<Vec<u8>>,
    },
    MsgPsiReEnc {
        #[serde(with = "vec_bytes_hex")]
        re_enc_ids: Vec<Vec<u8>>,
    },
    MsgPsiIntersect,
    MsgPredictHup,
    /// Partial scores `u = X·θ` of the non-label party
    MsgPredictPart {
        scores: Vec<f64>,
    },
    /// Final predictions computed by the label party
    MsgPredictResult {
        values: Vec<f64>,
    },
}

impl PredictPayload {
    pub fn kind(&self) -> PredictMessageType {
        match self {
            PredictPayload::MsgPsiEnc { .. } => PredictMessageType::MsgPsiEnc,
            PredictPayload::MsgPsiReEnc { .. } => PredictMessageType::MsgPsiReEnc,
            PredictPayload::MsgPsiIntersect => PredictMessageType::MsgPsiIntersect,
            PredictPayload::MsgPredictHup => PredictMessageType::MsgPredictHup,
            PredictPayload::MsgPredictPart { .. } => PredictMessageType::MsgPredictPart,
            PredictPayload::MsgPredictResult { .. } => PredictMessageType::MsgPredictResult,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictMessage {
    pub task_id: String,
    pub from: String,
    pub to: String,
    pub payload: PredictPayload,
}

impl PredictMessage {
    pub fn kind(&self) -> PredictMessageType {
        self.payload.kind()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_train_message_bytes() {
        let msg = TrainMessage {
            task_id: "t1".into(),
            from: "a".into(),
            to: "b".into(),
            loop_round: 3,
            payload: TrainPayload::MsgPsiEnc {
                enc_ids: vec![vec![2, 0xab], vec![3]],
            },
        };
        let bytes = msg.to_bytes().unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("\"type\":\"MsgPsiEnc\""));
        assert!(text.contains("02ab"));
        let decoded = TrainMessage::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.kind(), MessageType::MsgPsiEnc);
        assert_eq!(decoded.loop_round, 3);
        match decoded.payload {
            TrainPayload::MsgPsiEnc { enc_ids } => assert_eq!(enc_ids[0], vec![2, 0xab]),
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn test_unit_payload_and_status() {
        let bytes = TrainMessage {
            task_id: "t".into(),
            from: "a".into(),
            to: "b".into(),
            loop_round: 0,
            payload: TrainPayload::MsgTrainStatus { stopped: true },
        }
        .to_bytes()
        .unwrap();
        let decoded = TrainMessage::from_bytes(&bytes).unwrap();
        assert!(matches!(decoded.payload, TrainPayload::MsgTrainStatus { stopped: true }));
        assert!(MessageType::MsgTrainStatus.is_round_scoped());
        assert!(!MessageType::MsgHomoPubkey.is_round_scoped());
    }

    #[test]
    fn test_predict_message_kind() {
        let msg = PredictMessage {
            task_id: "p".into(),
            from: "a".into(),
            to: "b".into(),
            payload: PredictPayload::MsgPredictPart { scores: vec![0.5] },
        };
        let decoded = PredictMessage::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.kind(), PredictMessageType::MsgPredictPart);
    }
}
