//! Per-conversation turn serialization
//!
//! Turns for one conversation run strictly one after another; turns for
//! different conversations run concurrently. Each conversation key gets its
//! own worker task and bounded queue. Idle workers exit and are recreated on
//! the next activity.

use crate::activity::Activity;
use crate::adapter::{Adapter, Bot, TurnReport};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_QUEUE_DEPTH: usize = 32;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// A turn waiting in a conversation queue
struct TurnRequest {
    activity: Activity,
    cancel: CancellationToken,
    reply: oneshot::Sender<Result<TurnReport>>,
}

impl TurnRequest {
    async fn run(self, adapter: &Adapter, bot: &dyn Bot) {
        let result = adapter
            .process_activity_with_cancellation(self.activity, bot, self.cancel)
            .await;
        // The caller may have stopped waiting
        let _ = self.reply.send(result);
    }
}

/// Handle to a running worker
struct WorkerHandle {
    tx: mpsc::Sender<TurnRequest>,
    generation: u64,
    senders: Arc<AtomicUsize>,
}

/// Marks a sender that has looked up a worker and not yet finished sending.
/// Taken under the map lock, so a worker holding the write lock sees every
/// sender that could still reach its queue.
struct PendingSend(Arc<AtomicUsize>);

impl PendingSend {
    fn new(worker: &WorkerHandle) -> Self {
        worker.senders.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(&worker.senders))
    }
}

impl Drop for PendingSend {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

type Workers = Arc<RwLock<HashMap<String, WorkerHandle>>>;

/// Routes activities to per-conversation workers
pub struct TurnDispatcher {
    adapter: Arc<Adapter>,
    bot: Arc<dyn Bot>,
    workers: Workers,
    next_generation: AtomicU64,
    queue_depth: usize,
    idle_timeout: Duration,
}

impl TurnDispatcher {
    pub fn new(adapter: Arc<Adapter>, bot: Arc<dyn Bot>) -> Self {
        Self {
            adapter,
            bot,
            workers: Arc::new(RwLock::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
            queue_depth: DEFAULT_QUEUE_DEPTH,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    /// Bound on queued turns per conversation; senders wait when it is full
    #[must_use]
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Number of live conversation workers
    pub async fn worker_count(&self) -> usize {
        self.workers.read().await.len()
    }

    pub async fn dispatch(&self, activity: Activity) -> Result<TurnReport> {
        self.dispatch_with_cancellation(activity, CancellationToken::new())
            .await
    }

    /// Queue a turn behind any earlier turns of the same conversation and
    /// wait for its outcome
    pub async fn dispatch_with_cancellation(
        &self,
        activity: Activity,
        cancel: CancellationToken,
    ) -> Result<TurnReport> {
        let key = conversation_key(&activity)?;
        let (reply, outcome) = oneshot::channel();
        let mut request = TurnRequest {
            activity,
            cancel,
            reply,
        };

        let mut retried = false;
        loop {
            match self.enqueue(&key, request).await {
                Ok(()) => break,
                Err(returned) if !retried => {
                    tracing::warn!(conversation = %key, "Turn worker gone, retrying");
                    retried = true;
                    request = returned;
                }
                Err(_) => {
                    return Err(Error::InvalidOperation(format!(
                        "no turn worker available for {key}"
                    )))
                }
            }
        }

        outcome.await.map_err(|_| {
            Error::InvalidOperation(format!("turn worker for {key} stopped before replying"))
        })?
    }

    /// Hand the request to the conversation's worker, starting one if needed.
    /// Gives the request back when the worker's queue is closed.
    async fn enqueue(
        &self,
        key: &str,
        request: TurnRequest,
    ) -> std::result::Result<(), TurnRequest> {
        let existing = self
            .workers
            .read()
            .await
            .get(key)
            .map(|w| (w.tx.clone(), w.generation, PendingSend::new(w)));
        let (tx, generation, pending) = match existing {
            Some(found) => found,
            None => {
                let mut workers = self.workers.write().await;
                let worker = workers
                    .entry(key.to_string())
                    .or_insert_with(|| self.spawn_worker(key));
                (worker.tx.clone(), worker.generation, PendingSend::new(worker))
            }
        };

        // No lock is held while waiting for queue space
        let sent = tx.send(request).await;
        drop(pending);
        match sent {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(request)) => {
                self.forget(key, generation).await;
                Err(request)
            }
        }
    }

    /// Drop a dead worker's entry unless a newer worker replaced it
    async fn forget(&self, key: &str, generation: u64) {
        let mut workers = self.workers.write().await;
        if workers.get(key).is_some_and(|w| w.generation == generation) {
            workers.remove(key);
        }
    }

    fn spawn_worker(&self, key: &str) -> WorkerHandle {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let senders = Arc::new(AtomicUsize::new(0));
        let worker = Worker {
            key: key.to_string(),
            generation,
            rx,
            senders: Arc::clone(&senders),
            adapter: Arc::clone(&self.adapter),
            bot: Arc::clone(&self.bot),
            workers: Arc::clone(&self.workers),
            idle_timeout: self.idle_timeout,
        };
        tokio::spawn(worker.run());
        tracing::debug!(conversation = %key, generation, "Turn worker started");
        WorkerHandle {
            tx,
            generation,
            senders,
        }
    }
}

struct Worker {
    key: String,
    generation: u64,
    rx: mpsc::Receiver<TurnRequest>,
    senders: Arc<AtomicUsize>,
    adapter: Arc<Adapter>,
    bot: Arc<dyn Bot>,
    workers: Workers,
    idle_timeout: Duration,
}

impl Worker {
    async fn run(mut self) {
        loop {
            match tokio::time::timeout(self.idle_timeout, self.rx.recv()).await {
                Ok(Some(request)) => request.run(&self.adapter, self.bot.as_ref()).await,
                Ok(None) => break,
                Err(_) => {
                    if self.retire().await {
                        break;
                    }
                }
            }
        }
        tracing::debug!(conversation = %self.key, generation = self.generation, "Turn worker stopped");
    }

    /// Unregister unless a turn is queued or a sender is on its way. New
    /// senders need the map lock to find this worker, so once the entry is
    /// gone nothing else can reach the queue.
    async fn retire(&mut self) -> bool {
        let mut workers = self.workers.write().await;
        if self.senders.load(Ordering::Acquire) > 0 {
            return false;
        }
        if let Ok(request) = self.rx.try_recv() {
            drop(workers);
            request.run(&self.adapter, self.bot.as_ref()).await;
            return false;
        }
        if workers
            .get(&self.key)
            .is_some_and(|w| w.generation == self.generation)
        {
            workers.remove(&self.key);
        }
        self.rx.close();
        true
    }
}

/// Serialization key: `{channelId}/{conversationId}`
pub fn conversation_key(activity: &Activity) -> Result<String> {
    let channel = activity
        .channel()
        .ok_or_else(|| Error::InvalidActivity("missing channel id".to_string()))?;
    let conversation = activity
        .conversation_id()
        .ok_or_else(|| Error::InvalidActivity("missing conversation id".to_string()))?;
    Ok(format!("{channel}/{conversation}"))
}
