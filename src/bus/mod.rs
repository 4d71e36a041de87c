mod amqp;
mod memory;

pub use amqp::AmqpBus;
pub use memory::MemoryBus;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Correlation id collision: {0}")]
    CorrelationCollision(String),
    #[error("Request timed out after {0:?}")]
    RequestTimeout(Duration),
    #[error("Reply channel closed before a response arrived")]
    ReplyDropped,
}

/// Exchange routing semantics, mirroring the broker's exchange types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Deliver to queues whose binding key equals the routing key.
    Direct,
    /// Deliver one copy to every bound queue.
    Fanout,
}

/// When a delivery is acknowledged to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// Ack as soon as the handler is dispatched. A handler failure is logged
    /// and the delivery is never redelivered, so handlers must be idempotent
    /// and tolerant of lost side effects.
    #[default]
    OnDispatch,
    /// Ack only after the handler returns Ok; a failed handler's delivery is
    /// rejected without requeue. Trades throughput for not discarding the
    /// broker's redelivery safety net mid-handler.
    OnSuccess,
}

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub exchange: String,
    pub kind: ExchangeKind,
    pub queue: String,
    /// Maximum unacknowledged deliveries in flight.
    pub prefetch: u16,
    pub ack: AckMode,
}

impl SubscribeOptions {
    pub fn fanout(exchange: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            kind: ExchangeKind::Fanout,
            queue: queue.into(),
            prefetch: 5,
            ack: AckMode::default(),
        }
    }

    pub fn direct(exchange: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            kind: ExchangeKind::Direct,
            ..Self::fanout(exchange, queue)
        }
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_ack(mut self, ack: AckMode) -> Self {
        self.ack = ack;
        self
    }
}

/// Fire-and-forget message consumer.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, payload: Bytes) -> anyhow::Result<()>;
}

/// Request/response consumer: the returned bytes are published back to the
/// requester's reply queue under the original correlation id.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn handle(&self, payload: Bytes) -> anyhow::Result<Bytes>;
}

/// A running subscription's consumer task. Aborting stops consumption
/// without touching broker topology.
#[derive(Debug)]
pub struct SubscriptionHandle {
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub(crate) fn new(task: JoinHandle<()>) -> Self {
        Self { task }
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Abstraction over an AMQP-style broker: idempotent exchange/queue/binding
/// declaration, durable publish, correlation-based RPC, and bounded-prefetch
/// subscriptions with per-message acknowledgment.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Fire-and-forget publish. Declares topology, publishes with persistent
    /// delivery, and returns once the broker has accepted the message (not
    /// once anyone has processed it). Errors surface to the caller and are
    /// not retried here.
    async fn publish(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        queue: &str,
        payload: Bytes,
    ) -> Result<(), BusError>;

    /// Publish a request and wait for the correlated reply. The pending
    /// entry is removed on reply, timeout, and every error path.
    async fn request(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        queue: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, BusError>;

    /// Consume a queue, dispatching each delivery to `handler` on its own
    /// task so a slow handler does not block subsequent deliveries.
    async fn subscribe(
        &self,
        options: SubscribeOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionHandle, BusError>;

    /// Consume a queue as an RPC server: each handler result is published to
    /// the delivery's reply-to address with its correlation id. A failed
    /// handler acknowledges the delivery but sends no reply.
    async fn subscribe_rpc(
        &self,
        options: SubscribeOptions,
        handler: Arc<dyn RpcHandler>,
    ) -> Result<SubscriptionHandle, BusError>;
}

/// Publish a JSON-serialized message.
pub async fn publish_json<T: Serialize>(
    bus: &dyn MessageBus,
    exchange: &str,
    kind: ExchangeKind,
    queue: &str,
    message: &T,
) -> Result<(), BusError> {
    let payload = serde_json::to_vec(message)?;
    bus.publish(exchange, kind, queue, Bytes::from(payload)).await
}

/// JSON request/response over [`MessageBus::request`].
pub async fn request_json<T, R>(
    bus: &dyn MessageBus,
    exchange: &str,
    kind: ExchangeKind,
    queue: &str,
    message: &T,
    timeout: Duration,
) -> Result<R, BusError>
where
    T: Serialize,
    R: DeserializeOwned,
{
    let payload = serde_json::to_vec(message)?;
    let reply = bus
        .request(exchange, kind, queue, Bytes::from(payload), timeout)
        .await?;
    Ok(serde_json::from_slice(&reply)?)
}
