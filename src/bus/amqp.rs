use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::{
    AckMode, BusError, ExchangeKind, MessageBus, MessageHandler, RpcHandler, SubscribeOptions,
    SubscriptionHandle,
};

impl From<lapin::Error> for BusError {
    fn from(e: lapin::Error) -> Self {
        BusError::Transport(e.to_string())
    }
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        }
    }
}

/// AMQP message bus.
///
/// One connection for the bus lifetime. Publishes open a short-lived channel
/// each; every subscription holds a long-lived channel. The bus owns a single
/// private, server-named reply queue consumed continuously: incoming replies
/// are matched against the pending-request table by correlation id, and an
/// unmatched reply is logged and dropped.
pub struct AmqpBus {
    connection: Connection,
    reply_queue: String,
    pending: Arc<DashMap<String, oneshot::Sender<Bytes>>>,
    reply_task: JoinHandle<()>,
}

impl AmqpBus {
    pub async fn connect(uri: &str) -> Result<Self, BusError> {
        let connection = Connection::connect(uri, ConnectionProperties::default()).await?;

        let reply_channel = connection.create_channel().await?;
        let queue = reply_channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        let reply_queue = queue.name().as_str().to_string();

        let consumer = reply_channel
            .basic_consume(
                &reply_queue,
                "reply",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let pending: Arc<DashMap<String, oneshot::Sender<Bytes>>> = Arc::new(DashMap::new());
        let reply_task = tokio::spawn(consume_replies(consumer, Arc::clone(&pending)));

        info!(reply_queue = %reply_queue, "Connected to AMQP broker");

        Ok(Self {
            connection,
            reply_queue,
            pending,
            reply_task,
        })
    }

    async fn declare_topology(
        &self,
        channel: &Channel,
        exchange: &str,
        kind: ExchangeKind,
        queue: &str,
    ) -> Result<(), BusError> {
        channel
            .exchange_declare(
                exchange,
                kind.into(),
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        // An empty queue name means "publish to the exchange only": fanout
        // broadcasts have no single destination queue to declare.
        if !queue.is_empty() {
            channel
                .queue_declare(
                    queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;
            channel
                .queue_bind(
                    queue,
                    exchange,
                    queue,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }

        Ok(())
    }

    async fn publish_on_new_channel(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        queue: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), BusError> {
        let channel = self.connection.create_channel().await?;
        self.declare_topology(&channel, exchange, kind, queue).await?;

        channel
            .basic_publish(
                exchange,
                queue,
                BasicPublishOptions::default(),
                payload,
                properties.with_delivery_mode(2),
            )
            .await?
            .await?;

        Ok(())
    }
}

impl Drop for AmqpBus {
    fn drop(&mut self) {
        self.reply_task.abort();
    }
}

/// Reply-queue consumer loop: route each reply to its waiting requester.
async fn consume_replies(
    mut consumer: lapin::Consumer,
    pending: Arc<DashMap<String, oneshot::Sender<Bytes>>>,
) {
    while let Some(delivery) = consumer.next().await {
        let mut delivery = match delivery {
            Ok(d) => d,
            Err(e) => {
                error!(error = %e, "Reply consumer error");
                continue;
            }
        };

        let correlation_id = delivery
            .properties
            .correlation_id()
            .as_ref()
            .map(|s| s.as_str().to_string());

        match correlation_id {
            None => warn!("Received reply without correlation id"),
            Some(id) => match pending.remove(&id) {
                Some((_, tx)) => {
                    let _ = tx.send(Bytes::from(std::mem::take(&mut delivery.data)));
                }
                None => warn!(correlation_id = %id, "No pending request for reply"),
            },
        }

        if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
            error!(error = %e, "Failed to ack reply");
        }
    }
}

#[async_trait]
impl MessageBus for AmqpBus {
    async fn publish(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        queue: &str,
        payload: Bytes,
    ) -> Result<(), BusError> {
        self.publish_on_new_channel(exchange, kind, queue, &payload, BasicProperties::default())
            .await
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

        let properties = BasicProperties::default()
            .with_reply_to(ShortString::from(self.reply_queue.clone()))
            .with_correlation_id(ShortString::from(correlation_id.clone()));

        if let Err(e) = self
            .publish_on_new_channel(exchange, kind, queue, &payload, properties)
            .await
        {
            self.pending.remove(&correlation_id);
            return Err(e);
        }

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
        let channel = self.connection.create_channel().await?;
        channel
            .basic_qos(options.prefetch, BasicQosOptions::default())
            .await?;
        self.declare_topology(&channel, &options.exchange, options.kind, &options.queue)
            .await?;

        let mut consumer = channel
            .basic_consume(
                &options.queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!(exchange = %options.exchange, queue = %options.queue, "Subscribed");

        let queue = options.queue;
        let ack = options.ack;
        let task = tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                let mut delivery = match delivery {
                    Ok(d) => d,
                    Err(e) => {
                        error!(error = %e, queue = %queue, "Consumer error");
                        continue;
                    }
                };

                let payload = Bytes::from(std::mem::take(&mut delivery.data));
                let handler = Arc::clone(&handler);
                let queue = queue.clone();

                match ack {
                    AckMode::OnDispatch => {
                        tokio::spawn(async move {
                            if let Err(e) = handler.handle(payload).await {
                                error!(error = %e, queue = %queue, "Message handler failed");
                            }
                        });
                        if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                            error!(error = %e, "Failed to ack delivery");
                        }
                    }
                    AckMode::OnSuccess => {
                        tokio::spawn(async move {
                            match handler.handle(payload).await {
                                Ok(()) => {
                                    if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                                        error!(error = %e, "Failed to ack delivery");
                                    }
                                }
                                Err(e) => {
                                    error!(
                                        error = %e, queue = %queue,
                                        "Message handler failed; rejecting delivery"
                                    );
                                    let nack = BasicNackOptions {
                                        requeue: false,
                                        ..Default::default()
                                    };
                                    if let Err(e) = delivery.nack(nack).await {
                                        error!(error = %e, "Failed to nack delivery");
                                    }
                                }
                            }
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
        let channel = self.connection.create_channel().await?;
        channel
            .basic_qos(options.prefetch, BasicQosOptions::default())
            .await?;
        self.declare_topology(&channel, &options.exchange, options.kind, &options.queue)
            .await?;

        let mut consumer = channel
            .basic_consume(
                &options.queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!(exchange = %options.exchange, queue = %options.queue, "Subscribed (RPC)");

        let queue = options.queue;
        let task = tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                let mut delivery = match delivery {
                    Ok(d) => d,
                    Err(e) => {
                        error!(error = %e, queue = %queue, "RPC consumer error");
                        continue;
                    }
                };

                let payload = Bytes::from(std::mem::take(&mut delivery.data));
                let reply_to = delivery
                    .properties
                    .reply_to()
                    .as_ref()
                    .map(|s| s.as_str().to_string());
                let correlation_id = delivery.properties.correlation_id().clone();

                let handler = Arc::clone(&handler);
                let channel = channel.clone();
                let queue = queue.clone();

                tokio::spawn(async move {
                    match handler.handle(payload).await {
                        Ok(response) => {
                            if let Some(reply_to) = reply_to {
                                let mut properties = BasicProperties::default();
                                if let Some(id) = correlation_id {
                                    properties = properties.with_correlation_id(id);
                                }

                                // Replies route through the default exchange:
                                // the server-named reply queue is only
                                // reachable by its own name.
                                let publish = channel
                                    .basic_publish(
                                        "",
                                        &reply_to,
                                        BasicPublishOptions::default(),
                                        &response,
                                        properties,
                                    )
                                    .await;
                                match publish {
                                    Ok(confirm) => {
                                        if let Err(e) = confirm.await {
                                            error!(error = %e, queue = %queue, "Failed to publish RPC reply");
                                        }
                                    }
                                    Err(e) => {
                                        error!(error = %e, queue = %queue, "Failed to publish RPC reply");
                                    }
                                }
                            } else {
                                warn!(queue = %queue, "RPC request without reply-to; dropping response");
                            }
                        }
                        Err(e) => {
                            error!(error = %e, queue = %queue, "RPC handler failed; no reply sent");
                        }
                    }

                    if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                        error!(error = %e, "Failed to ack RPC delivery");
                    }
                });
            }
        });

        Ok(SubscriptionHandle::new(task))
    }
}
