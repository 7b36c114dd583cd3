//! The push subsystem: a queue of outbound deliveries consumed by a bounded
//! pool of workers.
use crate::{activity::Message, client::HttpClient, store::Instance, util::host_from_uri};
use std::sync::{Arc, Mutex};
use tokio::{
    sync::mpsc::{unbounded_channel, UnboundedSender},
    task::{JoinHandle, JoinSet},
};
use tracing::{info, warn};

/// One queued delivery.
#[derive(Debug, Clone)]
pub struct PostItem {
    pub inbox: String,
    pub message: Message,
    pub instance: Option<Instance>,
}

impl PostItem {
    pub fn domain(&self) -> String {
        host_from_uri(&self.inbox).unwrap_or_else(|_| self.inbox.clone())
    }
}

/// Accepts deliveries from any task and fans them out to at most
/// `worker_count` concurrent signed POSTs. Errors never escape a delivery;
/// the contract of a push worker is "try and log".
pub struct Pusher {
    tx: Mutex<Option<UnboundedSender<PostItem>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Pusher {
    pub fn start(client: Arc<HttpClient>, worker_count: usize) -> Self {
        let (tx, mut rx) = unbounded_channel::<PostItem>();

        let handle = tokio::spawn(async move {
            let mut join_set = JoinSet::new();

            while let Some(item) = rx.recv().await {
                let client = Arc::clone(&client);
                let task = async move {
                    client
                        .post(&item.inbox, &item.message, item.instance.as_ref())
                        .await;
                };

                if worker_count > 0 {
                    // cap in-flight deliveries at the worker count
                    while join_set.len() >= worker_count {
                        join_set.join_next().await;
                    }

                    join_set.spawn(task);
                } else {
                    tokio::spawn(task);
                }
            }

            // sender dropped: drain in-flight deliveries, then stop
            while join_set.join_next().await.is_some() {}

            info!("push workers stopped");
        });

        Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn push_message(&self, inbox: String, message: Message, instance: Option<Instance>) {
        self.push(PostItem {
            inbox,
            message,
            instance,
        });
    }

    pub fn push(&self, item: PostItem) {
        let guard = self.tx.lock().unwrap();

        match guard.as_ref() {
            Some(tx) => {
                if tx.send(item).is_err() {
                    warn!("push queue is closed, dropping delivery");
                }
            }
            None => warn!("pusher is shut down, dropping delivery"),
        }
    }

    /// Close the queue and wait for in-flight deliveries to finish.
    pub async fn shutdown(&self) {
        let tx = self.tx.lock().unwrap().take();
        drop(tx);

        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// A pusher whose queue is never consumed by workers; the receiver end
    /// is handed back so tests can assert on what would have been sent.
    #[cfg(test)]
    pub fn collector() -> (Self, tokio::sync::mpsc::UnboundedReceiver<PostItem>) {
        let (tx, rx) = unbounded_channel();

        (
            Self {
                tx: Mutex::new(Some(tx)),
                handle: Mutex::new(None),
            },
            rx,
        )
    }
}
