//! Vertical Federated Learning: two-party regression over Paillier
//!
//! Each party holds a disjoint set of columns for the same (PSI-aligned)
//! rows. Gradients are exchanged homomorphically encrypted and masked so
//! neither party learns the other's features, residuals or labels.

pub mod dataset;
pub mod gradient;
pub mod learner;
pub mod message;
pub mod model;
pub mod params;
pub mod predictor;
pub mod preprocess;

pub use dataset::DataSet;
pub use learner::{Learner, LearnerEvent, Outbound, TrainState};
pub use message::{MessageType, PredictMessage, PredictPayload, TrainMessage, TrainPayload};
pub use model::Model;
pub use params::{Algorithm, EvalParams, LiveEvalParams, RegMode, Role, TrainParams, TrainTask};
pub use predictor::{PredictOutbound, PredictResult, Predictor};
