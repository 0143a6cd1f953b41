//! Task registry actor
//!
//! A single task owns the `task_id → handle` map; every other component
//! talks to it through a command channel with oneshot replies, so inserts,
//! lookups and removals are serialized without a shared lock.

use crate::error::{DcpError, Result};
use log::debug;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};

enum Command<H> {
    Insert {
        task_id: String,
        handle: H,
        reply: oneshot::Sender<Result<()>>,
    },
    Get {
        task_id: String,
        reply: oneshot::Sender<Option<H>>,
    },
    Remove {
        task_id: String,
        reply: oneshot::Sender<Option<H>>,
    },
    List {
        reply: oneshot::Sender<Vec<String>>,
    },
}

/// Handle to the registry actor
pub struct Registry<H> {
    tx: mpsc::Sender<Command<H>>,
}

impl<H> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<H: Clone + Send + 'static> Registry<H> {
    /// Spawn the actor; at most `limit` tasks may be registered at once
    pub fn spawn(limit: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Command<H>>(256);
        tokio::spawn(async move {
            let mut tasks: HashMap<String, H> = HashMap::new();
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    Command::Insert {
                        task_id,
                        handle,
                        reply,
                    } => {
                        let result = if tasks.contains_key(&task_id) {
                            Err(DcpError::AlreadyExists(format!("task {}", task_id)))
                        } else if tasks.len() >= limit {
                            Err(DcpError::TooMuchTasks(format!(
                                "{} tasks running, limit {}",
                                tasks.len(),
                                limit
                            )))
                        } else {
                            debug!("registered task {}", task_id);
                            tasks.insert(task_id, handle);
                            Ok(())
                        };
                        let _ = reply.send(result);
                    }
                    Command::Get { task_id, reply } => {
                        let _ = reply.send(tasks.get(&task_id).cloned());
                    }
                    Command::Remove { task_id, reply } => {
                        let _ = reply.send(tasks.remove(&task_id));
                    }
                    Command::List { reply } => {
                        let mut ids: Vec<String> = tasks.keys().cloned().collect();
                        ids.sort();
                        let _ = reply.send(ids);
                    }
                }
            }
        });
        Self { tx }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command<H>) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| DcpError::Internal("registry stopped".into()))?;
        rx.await
            .map_err(|_| DcpError::Internal("registry dropped a reply".into()))
    }

    pub async fn insert(&self, task_id: &str, handle: H) -> Result<()> {
        let task_id = task_id.to_string();
        self.request(|reply| Command::Insert {
            task_id,
            handle,
            reply,
        })
        .await?
    }

    pub async fn get(&self, task_id: &str) -> Result<Option<H>> {
        let task_id = task_id.to_string();
        self.request(|reply| Command::Get { task_id, reply }).await
    }

    pub async fn remove(&self, task_id: &str) -> Result<Option<H>> {
        let task_id = task_id.to_string();
        self.request(|reply| Command::Remove { task_id, reply }).await
    }

    pub async fn task_ids(&self) -> Result<Vec<String>> {
        self.request(|reply| Command::List { reply }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_get_remove() {
        let reg: Registry<u32> = Registry::spawn(4);
        reg.insert("a", 1).await.unwrap();
        reg.insert("b", 2).await.unwrap();
        assert_eq!(reg.get("a").await.unwrap(), Some(1));
        assert_eq!(reg.task_ids().await.unwrap(), vec!["a", "b"]);
        assert_eq!(reg.remove("a").await.unwrap(), Some(1));
        assert_eq!(reg.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_duplicate_and_limit() {
        let reg: Registry<u32> = Registry::spawn(2);
        reg.insert("a", 1).await.unwrap();
        assert_eq!(reg.insert("a", 9).await.unwrap_err().code(), 10003);
        reg.insert("b", 2).await.unwrap();
        assert_eq!(reg.insert("c", 3).await.unwrap_err().code(), 10007);
        reg.remove("b").await.unwrap();
        reg.insert("c", 3).await.unwrap();
    }
}
