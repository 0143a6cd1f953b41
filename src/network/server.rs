//! Framed request/response server over TCP
//!
//! One tokio task per connection reads request envelopes, hands each body to
//! the `Handler` and writes the reply envelope back on the same stream.

use super::protocol::{read_frame, write_frame, Envelope, Reply};
use crate::error::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Service logic behind a `Server`
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    type Request: DeserializeOwned + Serialize + Send + 'static;
    type Response: DeserializeOwned + Serialize + Send + 'static;

    async fn handle(&self, from: &str, request: Self::Request) -> Result<Self::Response>;
}

pub struct Server<H: Handler> {
    local: String,
    handler: Arc<H>,
}

impl<H: Handler> Server<H> {
    pub fn new(local: impl Into<String>, handler: Arc<H>) -> Self {
        Self {
            local: local.into(),
            handler,
        }
    }

    /// Accept connections until `shutdown` flips to true
    pub async fn run(self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("[{}] listening on {}", self.local, listener.local_addr()?);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, remote) = accepted?;
                    debug!("[{}] connection from {}", self.local, remote);
                    let handler = self.handler.clone();
                    let local = self.local.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, &local, handler).await {
                            warn!("[{}] connection from {} closed: {}", local, remote, e);
                        }
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("[{}] server stopped", self.local);
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn serve_connection<H: Handler>(mut stream: TcpStream, local: &str, handler: Arc<H>) -> Result<()> {
    stream.set_nodelay(true)?;
    while let Some(frame) = read_frame(&mut stream).await? {
        let reply = match Envelope::<H::Request>::from_bytes(&frame) {
            Ok(env) => Reply::from_result(handler.handle(&env.from, env.body).await),
            Err(e) => Reply::Err(e.body()),
        };
        let out = Envelope::new(local, reply).to_bytes()?;
        write_frame(&mut stream, &out).await?;
    }
    Ok(())
}
