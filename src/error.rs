//! Error taxonomy shared by every subsystem
//!
//! Each variant is a *kind* of failure with a stable numeric code, so that
//! callers (CLI, HTTP handlers, peer nodes) can act on the kind without
//! parsing messages. `to_json` renders the `{code, msg}` body returned to users.

use serde::{Deserialize, Serialize};

/// Crate-wide error type
#[derive(Debug, thiserror::Error)]
pub enum DcpError {
    /// Invalid arguments, bad config, malformed message
    #[error("invalid parameter: {0}")]
    Param(String),

    /// Task / peer / slice / material missing
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate task id, duplicate blob key
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Marshal / decrypt / decode failure
    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("no peer found: {0}")]
    RpcFindNoPeer(String),

    #[error("rpc connect failed: {0}")]
    RpcConnect(String),

    /// Admission control rejected a new task
    #[error("too much tasks: {0}")]
    TooMuchTasks(String),

    /// Not enough rows for the requested evaluation rule
    #[error("dataset split failed: {0}")]
    DataSetSplit(String),

    #[error("get train set failed: {0}")]
    GetTrainSet(String),

    #[error("get predict set failed: {0}")]
    GetPredictSet(String),

    #[error("start task failed: {0}")]
    StartTask(String),

    #[error("too many triggers: {0}")]
    TriggerTooMuch(String),

    #[error("psi intersect parts failed: {0}")]
    PsiIntersectParts(String),

    #[error("psi rearrange file failed: {0}")]
    PsiRearrangeFile(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Error raised while driving a specific task
    #[error("task {task_id}: {source}")]
    InTask {
        task_id: String,
        #[source]
        source: Box<DcpError>,
    },

    #[error("unknown error: {0}")]
    Unknown(String),
}

pub type Result<T> = std::result::Result<T, DcpError>;

/// Body returned to users on failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: u32,
    pub msg: String,
}

impl DcpError {
    /// Stable numeric code of the error kind
    pub fn code(&self) -> u32 {
        match self {
            DcpError::Param(_) => 10001,
            DcpError::NotFound(_) => 10002,
            DcpError::AlreadyExists(_) => 10003,
            DcpError::Encoding(_) => 10004,
            DcpError::RpcFindNoPeer(_) => 10005,
            DcpError::RpcConnect(_) => 10006,
            DcpError::TooMuchTasks(_) => 10007,
            DcpError::DataSetSplit(_) => 10008,
            DcpError::GetTrainSet(_) => 10009,
            DcpError::GetPredictSet(_) => 10010,
            DcpError::StartTask(_) => 10011,
            DcpError::TriggerTooMuch(_) => 10012,
            DcpError::PsiIntersectParts(_) => 10013,
            DcpError::PsiRearrangeFile(_) => 10014,
            DcpError::Internal(_) | DcpError::Io(_) => 10500,
            DcpError::InTask { source, .. } => source.code(),
            DcpError::Unknown(_) => 10999,
        }
    }

    /// Wrap this error with the id of the task it happened in
    pub fn with_task(self, task_id: &str) -> Self {
        match self {
            already @ DcpError::InTask { .. } => already,
            other => DcpError::InTask {
                task_id: task_id.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, skipping task context
    pub fn kind(&self) -> &DcpError {
        match self {
            DcpError::InTask { source, .. } => source.kind(),
            other => other,
        }
    }

    /// Transport failures worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), DcpError::RpcConnect(_) | DcpError::Io(_))
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code(),
            msg: self.to_string(),
        }
    }

    /// Rebuild an error reported by a remote node
    pub fn from_body(body: ErrorBody) -> Self {
        let ErrorBody { code, msg } = body;
        match code {
            10001 => DcpError::Param(msg),
            10002 => DcpError::NotFound(msg),
            10003 => DcpError::AlreadyExists(msg),
            10004 => DcpError::Encoding(msg),
            10005 => DcpError::RpcFindNoPeer(msg),
            10006 => DcpError::RpcConnect(msg),
            10007 => DcpError::TooMuchTasks(msg),
            10008 => DcpError::DataSetSplit(msg),
            10009 => DcpError::GetTrainSet(msg),
            10010 => DcpError::GetPredictSet(msg),
            10011 => DcpError::StartTask(msg),
            10012 => DcpError::TriggerTooMuch(msg),
            10013 => DcpError::PsiIntersectParts(msg),
            10014 => DcpError::PsiRearrangeFile(msg),
            10500 => DcpError::Internal(msg),
            _ => DcpError::Unknown(msg),
        }
    }

    /// JSON `{code, msg}` rendering for user-visible failures
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.body())
            .unwrap_or_else(|_| format!("{{\"code\":{},\"msg\":\"\"}}", self.code()))
    }
}

impl From<serde_json::Error> for DcpError {
    fn from(e: serde_json::Error) -> Self {
        DcpError::Encoding(e.to_string())
    }
}

impl From<csv::Error> for DcpError {
    fn from(e: csv::Error) -> Self {
        DcpError::Param(format!("csv: {}", e))
    }
}

impl From<config::ConfigError> for DcpError {
    fn from(e: config::ConfigError) -> Self {
        DcpError::Param(format!("config: {}", e))
    }
}

impl From<hex::FromHexError> for DcpError {
    fn from(e: hex::FromHexError) -> Self {
        DcpError::Encoding(format!("hex: {}", e))
    }
}

impl From<ark_serialize::SerializationError> for DcpError {
    fn from(e: ark_serialize::SerializationError) -> Self {
        DcpError::Encoding(format!("pairing element: {}", e))
    }
}

impl From<tokio::task::JoinError> for DcpError {
    fn from(e: tokio::task::JoinError) -> Self {
        DcpError::Internal(format!("worker task: {}", e))
    }
}
