//! Bounded event handling.
//!
//! Events are sharded over a fixed set of workers by service identity, so
//! all events of one service run one after another in arrival order while
//! different services proceed in parallel.  Each worker owns a bounded
//! queue; a full queue makes the event pump wait.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use log::{debug, error, info};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::labels;
use crate::registry::Dispatcher;
use crate::types::ContainerEvent;

pub struct WorkerPool {
    queues: Vec<mpsc::Sender<ContainerEvent>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(dispatcher: Arc<Dispatcher>, workers: usize, capacity: usize) -> Self {
        let workers = workers.max(1);
        let mut queues = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for index in 0..workers {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            queues.push(tx);
            handles.push(tokio::spawn(run_worker(index, rx, Arc::clone(&dispatcher))));
        }

        Self { queues, handles }
    }

    /// Queues `event` on the worker owning its service.
    pub async fn submit(&self, event: ContainerEvent) -> anyhow::Result<()> {
        let service = labels::identity(&event.container).service;
        let index = shard(&service, self.queues.len());
        self.queues[index]
            .send(event)
            .await
            .map_err(|_| anyhow::anyhow!("worker {} stopped", index))
    }

    /// Stops accepting events and waits for queued ones to finish.
    pub async fn shutdown(self) {
        drop(self.queues);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Event worker panicked: {}", e);
            }
        }
    }
}

fn shard(service: &str, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    service.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}

async fn run_worker(
    index: usize,
    mut rx: mpsc::Receiver<ContainerEvent>,
    dispatcher: Arc<Dispatcher>,
) {
    debug!("Event worker {} started", index);
    while let Some(event) = rx.recv().await {
        handle_event(&dispatcher, &event).await;
    }
    debug!("Event worker {} stopped", index);
}

/// Dispatches one event. Failures are logged and the event dropped.
pub async fn handle_event(dispatcher: &Dispatcher, event: &ContainerEvent) {
    if let Err(e) = dispatcher.dispatch(event).await {
        error!(
            "{} {} ({}): {}; event dropped",
            event.kind.as_str(),
            event.container.name,
            event.container.id,
            e
        );
    }
}

/// Forwards events from the runtime into the pool until the runtime side
/// closes its channel.
pub async fn pump(mut events: mpsc::Receiver<ContainerEvent>, pool: &WorkerPool) {
    while let Some(event) = events.recv().await {
        if let Err(e) = pool.submit(event).await {
            error!("Failed to queue event: {}", e);
            return;
        }
    }
    info!("Event channel closed, no more events to dispatch");
}
