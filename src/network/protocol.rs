//! Wire envelope and frame codec
//!
//! Every request and every reply travels as one JSON envelope inside a
//! length-delimited frame: a `u32` big-endian byte count, then the body.

use crate::error::{DcpError, ErrorBody, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Current envelope version
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest accepted frame body
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// A message with its routing envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Unique message ID
    pub id: String,
    /// Address of the sender
    pub from: String,
    pub body: T,
    pub timestamp: DateTime<Utc>,
    pub version: u32,
}

impl<T: Serialize + DeserializeOwned> Envelope<T> {
    pub fn new(from: impl Into<String>, body: T) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            from: from.into(),
            body,
            timestamp: Utc::now(),
            version: PROTOCOL_VERSION,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let env: Self = serde_json::from_slice(data)?;
        if env.version != PROTOCOL_VERSION {
            return Err(DcpError::Encoding(format!(
                "unsupported protocol version {}",
                env.version
            )));
        }
        Ok(env)
    }
}

/// Answer to one request, sent back on the same connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", content = "body")]
pub enum Reply<T> {
    Ok(T),
    Err(ErrorBody),
}

impl<T> Reply<T> {
    pub fn from_result(result: Result<T>) -> Self {
        match result {
            Ok(v) => Reply::Ok(v),
            Err(e) => Reply::Err(e.body()),
        }
    }

    pub fn into_result(self) -> Result<T> {
        match self {
            Reply::Ok(v) => Ok(v),
            Reply::Err(body) => Err(DcpError::from_body(body)),
        }
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> Result<()> {
    if body.len() > MAX_FRAME_LEN {
        return Err(DcpError::Param(format!("frame of {} bytes too large", body.len())));
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Next frame body, or `None` when the peer closed the stream between frames
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(DcpError::Encoding(format!("frame of {} bytes too large", len)));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    enum Ping {
        Ping { seq: u32 },
    }

    #[test]
    fn test_envelope_roundtrip() {
        let env = Envelope::new("peer-123", Ping::Ping { seq: 4 });
        let decoded: Envelope<Ping> = Envelope::from_bytes(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.id, env.id);
        assert_eq!(decoded.from, "peer-123");
        assert_eq!(decoded.body, Ping::Ping { seq: 4 });
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut env = Envelope::new("p", Ping::Ping { seq: 1 });
        env.version = 9;
        let bytes = serde_json::to_vec(&env).unwrap();
        assert!(Envelope::<Ping>::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_reply_carries_error_code() {
        let reply: Reply<()> = Reply::from_result(Err(DcpError::NotFound("task t".into())));
        let json = serde_json::to_string(&reply).unwrap();
        let back: Reply<()> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.into_result().unwrap_err().code(), 10002);
    }

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"hello").await.unwrap();
        write_frame(&mut a, b"").await.unwrap();
        drop(a);
        assert_eq!(read_frame(&mut b).await.unwrap(), Some(b"hello".to_vec()));
        assert_eq!(read_frame(&mut b).await.unwrap(), Some(Vec::new()));
        assert_eq!(read_frame(&mut b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32((MAX_FRAME_LEN + 1) as u32).await.unwrap();
        assert!(read_frame(&mut b).await.is_err());
    }
}
