use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{error, warn};

use super::{
    AckMode, BusError, ExchangeKind, MessageBus, MessageHandler, RpcHandler, SubscribeOptions,
    SubscriptionHandle,
};

#[derive(Debug, Clone)]
struct Delivery {
    payload: Bytes,
    reply_to: Option<String>,
    correlation_id: Option<String>,
}

#[derive(Debug)]
struct ExchangeState {
    kind: ExchangeKind,
    /// (queue, binding key) pairs, deduplicated at bind time.
    bindings: Vec<(String, String)>,
}

/// In-process broker with the same topology and acknowledgment semantics as
/// [`AmqpBus`]: exchanges route to bound queues, each queue feeds at most one
/// consumer, prefetch bounds unacknowledged in-flight deliveries, and RPC
/// replies flow through a private per-bus reply queue matched by correlation
/// id. Backs the test suite; requires a running tokio runtime.
pub struct MemoryBus {
    exchanges: DashMap<String, ExchangeState>,
    senders: Arc<DashMap<String, mpsc::UnboundedSender<Delivery>>>,
    receivers: DashMap<String, mpsc::UnboundedReceiver<Delivery>>,
    pending: Arc<DashMap<String, oneshot::Sender<Bytes>>>,
    reply_queue: String,
}

impl MemoryBus {
    pub fn new() -> Arc<Self> {
        let bus = Arc::new(Self {
            exchanges: DashMap::new(),
            senders: Arc::new(DashMap::new()),
            receivers: DashMap::new(),
            pending: Arc::new(DashMap::new()),
            reply_queue: format!("amq.gen-{}", uuid::Uuid::new_v4()),
        });

        // Private reply queue, consumed for the bus lifetime.
        bus.declare_queue(&bus.reply_queue);
        let mut rx = bus
            .take_receiver(&bus.reply_queue)
            .expect("reply queue was just declared");
        let pending = Arc::clone(&bus.pending);
        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                match delivery.correlation_id {
                    None => warn!("Received reply without correlation id"),
                    Some(id) => match pending.remove(&id) {
                        Some((_, tx)) => {
                            let _ = tx.send(delivery.payload);
                        }
                        None => warn!(correlation_id = %id, "No pending request for reply"),
                    },
                }
            }
        });

        bus
    }

    /// Number of requests still waiting for a reply. Test observability.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    fn declare_queue(&self, name: &str) {
        if let Entry::Vacant(slot) = self.senders.entry(name.to_string()) {
            let (tx, rx) = mpsc::unbounded_channel();
            slot.insert(tx);
            self.receivers.insert(name.to_string(), rx);
        }
    }

    fn take_receiver(&self, name: &str) -> Option<mpsc::UnboundedReceiver<Delivery>> {
        self.receivers.remove(name).map(|(_, rx)| rx)
    }

    fn declare_topology(&self, exchange: &str, kind: ExchangeKind, queue: &str) {
        if !queue.is_empty() {
            self.declare_queue(queue);
        }

        let mut state = self
            .exchanges
            .entry(exchange.to_string())
            .or_insert_with(|| ExchangeState {
                kind,
                bindings: Vec::new(),
            });

        if !queue.is_empty()
            && !state
                .bindings
                .iter()
                .any(|(q, key)| q == queue && key == queue)
        {
            state.bindings.push((queue.to_string(), queue.to_string()));
        }
    }

    fn route(&self, exchange: &str, routing_key: &str, delivery: Delivery) {
        // The default exchange routes straight to the queue named by the key.
        if exchange.is_empty() {
            deliver(&self.senders, routing_key, delivery);
            return;
        }

        let targets: Vec<String> = match self.exchanges.get(exchange) {
            Some(state) => match state.kind {
                ExchangeKind::Fanout => state.bindings.iter().map(|(q, _)| q.clone()).collect(),
                ExchangeKind::Direct => state
                    .bindings
                    .iter()
                    .filter(|(_, key)| key == routing_key)
                    .map(|(q, _)| q.clone())
                    .collect(),
            },
            None => {
                warn!(exchange = %exchange, "Publish to undeclared exchange; dropping");
                return;
            }
        };

        for queue in targets {
            deliver(&self.senders, &queue, delivery.clone());
        }
    }
}

fn deliver(
    senders: &DashMap<String, mpsc::UnboundedSender<Delivery>>,
    queue: &str,
    delivery: Delivery,
) {
    match senders.get(queue) {
        Some(tx) => {
            let _ = tx.send(delivery);
        }
        None => warn!(queue = %queue, "Dropping message for undeclared queue"),
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        queue: &str,
        payload: Bytes,
    ) -> Result<(), BusError> {
        self.declare_topology(exchange, kind, queue);
        self.route(
            exchange,
            queue,
            Delivery {
                payload,
                reply_to: None,
                correlation_id: None,
            },
        );
        Ok(())
    }

    async fn request(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        queue: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, BusError> {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();

        match self.pending.entry(correlation_id.clone()) {
            Entry::Occupied(_) => {
                return Err(BusError::CorrelationCollision(correlation_id));
            }
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }

        self.declare_topology(exchange, kind, queue);
        self.route(
            exchange,
            queue,
            Delivery {
                payload,
                reply_to: Some(self.reply_queue.clone()),
                correlation_id: Some(correlation_id.clone()),
            },
        );

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                self.pending.remove(&correlation_id);
                Err(BusError::ReplyDropped)
            }
            Err(_) => {
                self.pending.remove(&correlation_id);
                Err(BusError::RequestTimeout(timeout))
            }
        }
    }

    async fn subscribe(
        &self,
        options: SubscribeOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionHandle, BusError> {
        self.declare_topology(&options.exchange, options.kind, &options.queue);
        let mut rx = self.take_receiver(&options.queue).ok_or_else(|| {
            BusError::Transport(format!("queue '{}' already has a consumer", options.queue))
        })?;

        let queue = options.queue;
        let ack = options.ack;
        let in_flight = Arc::new(Semaphore::new(options.prefetch.max(1) as usize));

        let task = tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                let permit = Arc::clone(&in_flight)
                    .acquire_owned()
                    .await
                    .expect("in-flight semaphore never closes");
                let handler = Arc::clone(&handler);
                let queue = queue.clone();

                match ack {
                    AckMode::OnDispatch => {
                        // Acked on dispatch: the in-flight slot frees before
                        // the handler finishes, so prefetch does not
                        // backpressure slow handlers.
                        tokio::spawn(async move {
                            if let Err(e) = handler.handle(delivery.payload).await {
                                error!(error = %e, queue = %queue, "Message handler failed");
                            }
                        });
                        drop(permit);
                    }
                    AckMode::OnSuccess => {
                        tokio::spawn(async move {
                            if let Err(e) = handler.handle(delivery.payload).await {
                                error!(
                                    error = %e, queue = %queue,
                                    "Message handler failed; rejecting delivery"
                                );
                            }
                            drop(permit);
                        });
                    }
                }
            }
        });

        Ok(SubscriptionHandle::new(task))
    }

    async fn subscribe_rpc(
        &self,
        options: SubscribeOptions,
        handler: Arc<dyn RpcHandler>,
    ) -> Result<SubscriptionHandle, BusError> {
        self.declare_topology(&options.exchange, options.kind, &options.queue);
        let mut rx = self.take_receiver(&options.queue).ok_or_else(|| {
            BusError::Transport(format!("queue '{}' already has a consumer", options.queue))
        })?;

        let queue = options.queue;
        let senders = Arc::clone(&self.senders);
        let in_flight = Arc::new(Semaphore::new(options.prefetch.max(1) as usize));

        let task = tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                let permit = Arc::clone(&in_flight)
                    .acquire_owned()
                    .await
                    .expect("in-flight semaphore never closes");
                let handler = Arc::clone(&handler);
                let senders = Arc::clone(&senders);
                let queue = queue.clone();

                tokio::spawn(async move {
                    match handler.handle(delivery.payload).await {
                        Ok(response) => match delivery.reply_to {
                            Some(reply_to) => deliver(
                                &senders,
                                &reply_to,
                                Delivery {
                                    payload: response,
                                    reply_to: None,
                                    correlation_id: delivery.correlation_id,
                                },
                            ),
                            None => {
                                warn!(queue = %queue, "RPC request without reply-to; dropping response");
                            }
                        },
                        Err(e) => {
                            error!(error = %e, queue = %queue, "RPC handler failed; no reply sent");
                        }
                    }
                    drop(permit);
                });
            }
        });

        Ok(SubscriptionHandle::new(task))
    }
}
