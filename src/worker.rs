//! Worker thread hosting one engine.
//!
//! The host and engine are single-threaded, so they live on a dedicated thread
//! running a current-thread tokio runtime. Other threads reach it through a
//! cloneable [`WorkerHandle`].

use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::engine::{Engine, EngineResult};
use crate::error::{Error, Result};
use crate::host::{Host, Sink};
use crate::messages::Reply;
use crate::settings::Settings;

enum Envelope {
    Message {
        client_id: String,
        text: String,
        outbox: UnboundedSender<Reply>,
    },
    Disconnect {
        client_id: String,
    },
    Shutdown,
}

pub struct Worker;

impl Worker {
    /// Starts the worker thread. `factory` runs on that thread when a client
    /// sends `init`.
    pub fn spawn<F>(settings: Settings, factory: F) -> std::io::Result<WorkerHandle>
    where
        F: Fn(Option<&[u8]>) -> EngineResult<Rc<dyn Engine>> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let thread = std::thread::Builder::new()
            .name("livepivot-worker".to_string())
            .spawn(move || {
                let host = Host::new(settings, Box::new(factory));
                runtime.block_on(run(host, rx));
            })?;

        Ok(WorkerHandle {
            tx,
            thread: Arc::new(Mutex::new(Some(thread))),
        })
    }
}

async fn run(mut host: Host, mut rx: UnboundedReceiver<Envelope>) {
    log::debug!("Worker started");
    while let Some(envelope) = rx.recv().await {
        match envelope {
            Envelope::Message {
                client_id,
                text,
                outbox,
            } => {
                let sink: Sink = Rc::new(move |reply| {
                    if outbox.send(reply).is_err() {
                        log::debug!("Dropped reply for a closed outbox");
                    }
                });
                host.handle_raw(&client_id, &text, &sink);
            }
            Envelope::Disconnect { client_id } => {
                log::debug!("Client {} disconnected", client_id);
                host.disconnect(&client_id);
            }
            Envelope::Shutdown => break,
        }
    }
    log::debug!("Worker stopped");
}

/// Sending side of a worker. Clones share the same worker.
#[derive(Clone)]
pub struct WorkerHandle {
    tx: UnboundedSender<Envelope>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl WorkerHandle {
    fn send(&self, envelope: Envelope) -> Result<()> {
        self.tx
            .send(envelope)
            .map_err(|_| Error::protocol("worker has stopped"))
    }

    /// Queues a text frame from `client_id`; replies go to `outbox`.
    pub fn post(&self, client_id: &str, text: impl Into<String>, outbox: UnboundedSender<Reply>) -> Result<()> {
        self.send(Envelope::Message {
            client_id: client_id.to_string(),
            text: text.into(),
            outbox,
        })
    }

    /// Drops the client's subscriptions and deletes its views.
    pub fn disconnect(&self, client_id: &str) -> Result<()> {
        self.send(Envelope::Disconnect {
            client_id: client_id.to_string(),
        })
    }

    /// Stops the worker after the queued messages and waits for its thread.
    pub fn shutdown(&self) {
        if self.send(Envelope::Shutdown).is_err() {
            log::debug!("Worker already stopped");
        }
        let thread = match self.thread.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(thread) = thread {
            if thread.join().is_err() {
                log::error!("Worker thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;
    use serde_json::json;

    fn spawn() -> WorkerHandle {
        Worker::spawn(Settings::default(), |_: Option<&[u8]>| {
            Ok(Rc::new(MemoryEngine::new()) as Rc<dyn Engine>)
        })
        .unwrap()
    }

    #[test]
    fn test_round_trip() {
        let worker = spawn();
        let (tx, mut rx) = mpsc::unbounded_channel();
        worker.post("c1", json!({"id": 1, "cmd": "init"}).to_string(), tx.clone()).unwrap();
        worker
            .post(
                "c1",
                json!({"id": 2, "cmd": "table", "name": "t", "data": {"x": "integer"}}).to_string(),
                tx.clone(),
            )
            .unwrap();
        worker
            .post(
                "c1",
                json!({"id": 3, "cmd": "table_method", "name": "t", "method": "schema"}).to_string(),
                tx,
            )
            .unwrap();

        let replies: Vec<Reply> = (0..3).filter_map(|_| rx.blocking_recv()).collect();
        assert_eq!(replies.iter().map(|r| r.id).collect::<Vec<_>>(), vec![Some(1), Some(2), Some(3)]);
        assert_eq!(replies[2].data, Some(json!({"x": "integer"})));
        worker.shutdown();
    }

    #[test]
    fn test_post_after_shutdown_fails() {
        let worker = spawn();
        worker.shutdown();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            worker.post("c1", "{}", tx),
            Err(Error::Protocol { .. })
        ));
    }
}
