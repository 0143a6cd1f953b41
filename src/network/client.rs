//! Client side of the framed request/response protocol

use super::protocol::{read_frame, write_frame, Envelope, Reply};
use crate::error::{DcpError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// One open connection to a `Server`
#[derive(Debug)]
pub struct Connection {
    addr: String,
    stream: TcpStream,
}

impl Connection {
    pub async fn connect(addr: &str, deadline: Duration) -> Result<Self> {
        let stream = timeout(deadline, TcpStream::connect(addr))
            .await
            .map_err(|_| DcpError::RpcConnect(format!("connect to {} timed out", addr)))?
            .map_err(|e| DcpError::RpcConnect(format!("connect to {}: {}", addr, e)))?;
        stream.set_nodelay(true)?;
        Ok(Self {
            addr: addr.to_string(),
            stream,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send one request and wait for its reply within `deadline`.
    ///
    /// Transport failures surface as `RpcConnect`; failures reported by the
    /// remote handler keep their original kind.
    pub async fn call<Req, Resp>(&mut self, from: &str, request: Req, deadline: Duration) -> Result<Resp>
    where
        Req: Serialize + DeserializeOwned,
        Resp: Serialize + DeserializeOwned,
    {
        let bytes = Envelope::new(from, request).to_bytes()?;
        let addr = self.addr.clone();
        let exchange = async {
            write_frame(&mut self.stream, &bytes).await?;
            read_frame(&mut self.stream).await
        };
        let frame = timeout(deadline, exchange)
            .await
            .map_err(|_| DcpError::RpcConnect(format!("call to {} timed out", addr)))?
            .map_err(|e| DcpError::RpcConnect(format!("call to {}: {}", addr, e)))?
            .ok_or_else(|| DcpError::RpcConnect(format!("{} closed the connection", addr)))?;
        let reply: Envelope<Reply<Resp>> = Envelope::from_bytes(&frame)?;
        reply.body.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::server::{Handler, Server};
    use async_trait::async_trait;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::sync::watch;

    struct Doubler;

    #[async_trait]
    impl Handler for Doubler {
        type Request = i64;
        type Response = i64;

        async fn handle(&self, _from: &str, request: i64) -> Result<i64> {
            if request < 0 {
                return Err(DcpError::Param("negative".into()));
            }
            Ok(request * 2)
        }
    }

    #[tokio::test]
    async fn test_call_roundtrip_and_remote_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (stop_tx, stop_rx) = watch::channel(false);
        let server = tokio::spawn(Server::new("srv", Arc::new(Doubler)).run(listener, stop_rx));

        let mut conn = Connection::connect(&addr, Duration::from_secs(3)).await.unwrap();
        let out: i64 = conn.call("cli", 21i64, Duration::from_secs(3)).await.unwrap();
        assert_eq!(out, 42);
        let err = conn
            .call::<i64, i64>("cli", -1, Duration::from_secs(3))
            .await
            .unwrap_err();
        assert_eq!(err.code(), 10001);
        assert!(!err.is_transient());

        stop_tx.send(true).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let err = Connection::connect(&addr, Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_transient());
    }
}
