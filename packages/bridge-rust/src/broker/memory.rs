//! In-process broker backend.
//!
//! [`MemoryBroker`] holds the queues; each [`MemoryChannel`] is one client
//! channel onto it with its own delivery tags, unacknowledged set and
//! exclusive queues. Closing a channel requeues its unacknowledged
//! deliveries, deletes its exclusive queues and ends its consumer streams,
//! which is how tests simulate a lost connection.
//!
//! Messages published to a queue that does not exist are dropped, matching
//! the AMQP default exchange.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::MessageProperties;
use dashmap::DashMap;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::trace;

use super::{
    Broker, ConsumeOptions, Connector, DeclaredQueue, Delivery, DeliveryStream, QueueOptions,
};
use crate::error::BrokerError;

/// Buffer between a queue pump and its consumer stream.
const CONSUMER_BUFFER: usize = 32;

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    properties: MessageProperties,
}

#[derive(Debug)]
struct MemoryQueue {
    options: QueueOptions,
    ready: Mutex<VecDeque<StoredMessage>>,
    notify: Notify,
}

impl MemoryQueue {
    fn new(options: QueueOptions) -> Self {
        Self {
            options,
            ready: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    fn push_back(&self, message: StoredMessage) {
        self.ready.lock().push_back(message);
        self.notify.notify_waiters();
    }

    fn push_front(&self, message: StoredMessage) {
        self.ready.lock().push_front(message);
        self.notify.notify_waiters();
    }

    /// Waits for the next ready message, or `None` once `open` turns false.
    async fn next_message(&self, open: &AtomicBool) -> Option<StoredMessage> {
        loop {
            // Registered before checking state so a concurrent push is never missed.
            let notified = self.notify.notified();
            if !open.load(Ordering::Acquire) {
                return None;
            }
            if let Some(message) = self.ready.lock().pop_front() {
                return Some(message);
            }
            notified.await;
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryBroker
// ---------------------------------------------------------------------------

/// Shared queue state. Cloning yields another handle onto the same queues.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    queues: Arc<DashMap<String, Arc<MemoryQueue>>>,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new channel onto this broker.
    #[must_use]
    pub fn channel(&self) -> MemoryChannel {
        MemoryChannel {
            state: Arc::new(ChannelState {
                broker: self.clone(),
                open: AtomicBool::new(true),
                next_tag: AtomicU64::new(1),
                unacked: DashMap::new(),
                exclusive: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Returns `true` if `name` has been declared and not deleted.
    #[must_use]
    pub fn queue_exists(&self, name: &str) -> bool {
        self.queues.contains_key(name)
    }

    /// Messages ready for delivery in `name`, or `None` if it does not exist.
    #[must_use]
    pub fn ready_count(&self, name: &str) -> Option<usize> {
        self.queue(name).map(|q| q.ready.lock().len())
    }

    /// Returns `true` if `name` was declared durable.
    #[must_use]
    pub fn is_durable(&self, name: &str) -> Option<bool> {
        self.queue(name).map(|q| q.options.durable)
    }

    fn queue(&self, name: &str) -> Option<Arc<MemoryQueue>> {
        self.queues.get(name).map(|q| Arc::clone(q.value()))
    }

    fn wake_all(&self) {
        for queue in self.queues.iter() {
            queue.notify.notify_waiters();
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryChannel
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Unacked {
    queue: String,
    message: StoredMessage,
    _permit: Option<OwnedSemaphorePermit>,
}

#[derive(Debug)]
struct ChannelState {
    broker: MemoryBroker,
    open: AtomicBool,
    next_tag: AtomicU64,
    unacked: DashMap<u64, Unacked>,
    exclusive: Mutex<Vec<String>>,
}

/// One client channel onto a [`MemoryBroker`].
#[derive(Debug, Clone)]
pub struct MemoryChannel {
    state: Arc<ChannelState>,
}

impl MemoryChannel {
    /// Closes the channel as a dropped connection would.
    pub fn close(&self) {
        if !self.state.open.swap(false, Ordering::AcqRel) {
            return;
        }

        let tags: Vec<u64> = self.state.unacked.iter().map(|e| *e.key()).collect();
        for tag in tags {
            if let Some((_, unacked)) = self.state.unacked.remove(&tag) {
                if let Some(queue) = self.state.broker.queue(&unacked.queue) {
                    queue.push_front(unacked.message);
                }
            }
        }

        let exclusive: Vec<String> = self.state.exclusive.lock().drain(..).collect();
        for name in exclusive {
            if let Some((_, queue)) = self.state.broker.queues.remove(&name) {
                queue.notify.notify_waiters();
            }
        }

        self.state.broker.wake_all();
    }

    /// Deliveries handed out on this channel and not yet acknowledged.
    #[must_use]
    pub fn unacked_count(&self) -> usize {
        self.state.unacked.len()
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.state.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }
}

/// Moves messages from a queue into one consumer's stream.
async fn pump(
    state: Arc<ChannelState>,
    queue_name: String,
    queue: Arc<MemoryQueue>,
    options: ConsumeOptions,
    tx: mpsc::Sender<Result<Delivery, BrokerError>>,
) {
    let limit = if options.no_ack {
        None
    } else {
        options
            .prefetch
            .map(|n| Arc::new(Semaphore::new(usize::from(n.max(1)))))
    };

    loop {
        let permit = match &limit {
            Some(semaphore) => tokio::select! {
                permit = Arc::clone(semaphore).acquire_owned() => match permit {
                    Ok(permit) => Some(permit),
                    Err(_) => break,
                },
                () = tx.closed() => break,
            },
            None => None,
        };

        let message = tokio::select! {
            message = queue.next_message(&state.open) => match message {
                Some(message) => message,
                None => break,
            },
            () = tx.closed() => break,
        };

        let delivery_tag = state.next_tag.fetch_add(1, Ordering::Relaxed);
        let delivery = Delivery {
            delivery_tag,
            body: message.body.clone(),
            properties: message.properties.clone(),
        };
        if !options.no_ack {
            state.unacked.insert(
                delivery_tag,
                Unacked {
                    queue: queue_name.clone(),
                    message: message.clone(),
                    _permit: permit,
                },
            );
        }

        if !state.open.load(Ordering::Acquire) {
            // Closed mid-delivery: `close` may already have drained the unacked set.
            state.unacked.remove(&delivery_tag);
            queue.push_front(message);
            break;
        }

        if tx.send(Ok(delivery)).await.is_err() {
            // Consumer went away: put the message back for the next one.
            state.unacked.remove(&delivery_tag);
            queue.push_front(message);
            break;
        }
    }
    trace!(queue = %queue_name, "memory consumer stopped");
}

#[async_trait]
impl Broker for MemoryChannel {
    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<DeclaredQueue, BrokerError> {
        self.ensure_open()?;
        let name = if name.is_empty() {
            format!("amq.gen-{}", uuid::Uuid::new_v4().simple())
        } else {
            name.to_string()
        };

        let queue = Arc::clone(
            self.state
                .broker
                .queues
                .entry(name.clone())
                .or_insert_with(|| {
                    if options.exclusive {
                        self.state.exclusive.lock().push(name.clone());
                    }
                    Arc::new(MemoryQueue::new(options))
                })
                .value(),
        );
        let message_count = u32::try_from(queue.ready.lock().len()).unwrap_or(u32::MAX);
        Ok(DeclaredQueue {
            name,
            message_count,
        })
    }

    async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        match self.state.broker.queue(queue) {
            Some(target) => target.push_back(StoredMessage {
                body: body.to_vec(),
                properties: properties.clone(),
            }),
            None => trace!(queue, "unroutable message dropped"),
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError> {
        self.ensure_open()?;
        let target = self
            .state
            .broker
            .queue(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;

        let (tx, rx) = mpsc::channel(CONSUMER_BUFFER);
        tokio::spawn(pump(
            Arc::clone(&self.state),
            queue.to_string(),
            target,
            options,
            tx,
        ));

        Ok(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.state
            .unacked
            .remove(&delivery_tag)
            .map(|_| ())
            .ok_or(BrokerError::UnknownDeliveryTag(delivery_tag))
    }

    async fn message_count(&self, queue: &str) -> Result<u32, BrokerError> {
        self.ensure_open()?;
        self.state
            .broker
            .ready_count(queue)
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))
    }

    fn is_open(&self) -> bool {
        self.state.open.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// MemoryConnector
// ---------------------------------------------------------------------------

/// Hands out fresh [`MemoryChannel`]s, optionally failing the first attempts.
#[derive(Debug)]
pub struct MemoryConnector {
    broker: MemoryBroker,
    failures_left: AtomicU32,
    attempts: AtomicU32,
    current: Mutex<Option<MemoryChannel>>,
}

impl MemoryConnector {
    #[must_use]
    pub fn new(broker: MemoryBroker) -> Self {
        Self {
            broker,
            failures_left: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
            current: Mutex::new(None),
        }
    }

    /// Makes the next `n` connection attempts fail.
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Total connection attempts, successful or not.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Closes the most recently opened channel, simulating a dropped connection.
    pub fn drop_connection(&self) {
        if let Some(channel) = self.current.lock().as_ref() {
            channel.close();
        }
    }

    /// The broker this connector opens channels onto.
    #[must_use]
    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn Broker>, BrokerError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(BrokerError::Unreachable(
                "memory broker refused connection".to_string(),
            ));
        }

        let channel = self.broker.channel();
        *self.current.lock() = Some(channel.clone());
        Ok(Arc::new(channel))
    }

    fn endpoint(&self) -> String {
        "memory://".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
