use std::sync::{Arc, Weak};
use std::time::Duration;

use lapin::options::{BasicPublishOptions, ExchangeDeclareOptions, ExchangeDeleteOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, ExchangeKind};
use tokio::sync::{watch, Mutex as TokioMutex};

use crate::binding::{EndpointKind, EndpointRef};
use crate::config::anonymous_queue_name;
use crate::connection::{await_init, Connection, ConnectionShared, InitState};
use crate::consumer::{ActivateCallback, ConsumerOptions, DecodedCallback, RawCallback};
use crate::error::FacadeError;
use crate::message::{Message, Payload};
use crate::queue::{Queue, QueueOptions};
use crate::rpc;

#[derive(Clone, Debug, Default)]
pub struct ExchangeOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    /// Routes unroutable messages to this exchange instead of dropping them,
    /// per spec.md §3's `alternateExchange` option.
    pub alternate_exchange: Option<String>,
    pub arguments: FieldTable,
}

impl ExchangeOptions {
    fn declare_arguments(&self) -> FieldTable {
        let mut table = self.arguments.clone();
        if let Some(alternate) = &self.alternate_exchange {
            table.insert(
                "x-alternate-exchange".into(),
                AMQPValue::LongString(alternate.as_str().into()),
            );
        }
        table
    }
}

pub(crate) struct ExchangeState {
    name: String,
    kind: ExchangeKind,
    options: ExchangeOptions,
    conn: Weak<ConnectionShared>,
    channel: TokioMutex<Option<Channel>>,
    init_tx: watch::Sender<InitState>,
    consumer_queue: TokioMutex<Option<Queue>>,
}

/// A named AMQP exchange. Consumption isn't a native exchange operation in
/// AMQP 0-9-1 — `activate_consumer`/`start_consumer` transparently allocate
/// a private, exclusive, auto-delete queue bound to this exchange and run
/// the consumer on that queue, per spec.md §6.
#[derive(Clone)]
pub struct Exchange {
    shared: Arc<ExchangeState>,
}

impl Exchange {
    pub(crate) fn new(conn: Weak<ConnectionShared>, name: String, kind: ExchangeKind, options: ExchangeOptions) -> Self {
        let (init_tx, _) = watch::channel(InitState::Pending);
        let shared = Arc::new(ExchangeState {
            name,
            kind,
            options,
            conn,
            channel: TokioMutex::new(None),
            init_tx,
            consumer_queue: TokioMutex::new(None),
        });
        Self { shared }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub async fn initialized(&self) -> Result<(), FacadeError> {
        await_init(self.shared.init_tx.subscribe()).await
    }

    fn connection(&self) -> Result<Arc<ConnectionShared>, FacadeError> {
        self.shared.conn.upgrade().ok_or(FacadeError::ChannelClosed)
    }

    pub(crate) async fn channel_handle(&self) -> Result<Channel, FacadeError> {
        self.shared
            .channel
            .lock()
            .await
            .clone()
            .ok_or(FacadeError::ChannelClosed)
    }

    pub(crate) async fn initialize(&self) -> Result<(), FacadeError> {
        let result = self.initialize_inner().await;
        match &result {
            Ok(()) => {
                let _ = self.shared.init_tx.send(InitState::Ready);
            }
            Err(e) => {
                // spec.md §4.2: a declaration failure removes the entity from
                // the registry so a doomed name does not poison it for
                // redeclaration.
                if let Ok(conn) = self.connection() {
                    conn.remove_exchange(&self.shared.name).await;
                }
                let _ = self.shared.init_tx.send(InitState::Failed(Arc::new(e.clone())));
            }
        }
        result
    }

    async fn initialize_inner(&self) -> Result<(), FacadeError> {
        let conn = self.connection()?;
        let channel = conn.open_channel().await?;
        channel
            .exchange_declare(
                &self.shared.name,
                self.shared.kind.clone(),
                ExchangeDeclareOptions {
                    durable: self.shared.options.durable,
                    auto_delete: self.shared.options.auto_delete,
                    internal: self.shared.options.internal,
                    ..Default::default()
                },
                self.shared.options.declare_arguments(),
            )
            .await?;
        let mut guard = self.shared.channel.lock().await;
        *guard = Some(channel);
        Ok(())
    }

    /// Publishes with `routing_key`. On a synchronous publish failure
    /// (typical signal: the channel went stale from a silent link drop),
    /// triggers `Connection::rebuild_all` and, once it settles, re-looks-up
    /// the exchange by name in the registry and retransmits exactly once —
    /// the at-least-once retry policy spec.md §4.2/§9 describes.
    pub async fn publish(
        &self,
        routing_key: &str,
        payload: impl Into<Payload>,
        properties: BasicProperties,
    ) -> Result<(), FacadeError> {
        let payload = payload.into();
        match self.try_publish(routing_key, payload.clone(), properties.clone()).await {
            Ok(()) => Ok(()),
            Err(_) => {
                let conn = self.connection()?;
                let _ = Connection::from_shared(conn.clone()).trigger_rebuild().await;
                let exchange = conn
                    .get_exchange(&self.shared.name)
                    .await
                    .ok_or_else(|| FacadeError::NotFound(self.shared.name.clone()))?;
                exchange.try_publish(routing_key, payload, properties).await
            }
        }
    }

    async fn try_publish(
        &self,
        routing_key: &str,
        payload: Payload,
        properties: BasicProperties,
    ) -> Result<(), FacadeError> {
        let channel = self.channel_handle().await?;
        let (body, properties) = payload.encode(properties.with_delivery_mode(2));
        channel
            .basic_publish(&self.shared.name, routing_key, BasicPublishOptions::default(), &body, properties)
            .await?
            .await?;
        Ok(())
    }

    pub async fn rpc(
        &self,
        routing_key: &str,
        payload: impl Into<Payload>,
        properties: BasicProperties,
        timeout: Duration,
    ) -> Result<Message, FacadeError> {
        let channel = self.channel_handle().await?;
        rpc::call(&channel, &self.shared.name, routing_key, payload.into(), properties, timeout).await
    }

    pub async fn bind(
        &self,
        destination: EndpointRef,
        pattern: impl Into<String>,
        args: FieldTable,
    ) -> Result<crate::binding::Binding, FacadeError> {
        let conn = Connection::from_shared(self.connection()?);
        let binding = conn
            .declare_binding(self.shared.name.clone(), destination, pattern, args)
            .await;
        binding.initialized().await?;
        Ok(binding)
    }

    pub async fn unbind(&self, destination: EndpointRef, pattern: impl Into<String>) -> Result<(), FacadeError> {
        let conn = Connection::from_shared(self.connection()?);
        let pattern = pattern.into();
        let id = crate::binding::binding_id(&self.shared.name, &destination, &pattern);
        match conn.get_binding(&id).await {
            Some(binding) => binding.delete().await,
            None => Err(FacadeError::NotFound(id)),
        }
    }

    async fn private_queue(&self, pattern: &str, args: FieldTable) -> Result<Queue, FacadeError> {
        {
            let guard = self.shared.consumer_queue.lock().await;
            if let Some(queue) = guard.as_ref() {
                return Ok(queue.clone());
            }
        }
        let conn = Connection::from_shared(self.connection()?);
        let queue_name = anonymous_queue_name(&self.shared.name);
        let queue = conn
            .declare_queue(
                queue_name,
                QueueOptions {
                    durable: false,
                    exclusive: true,
                    auto_delete: true,
                    arguments: FieldTable::default(),
                },
            )
            .await;
        queue.initialized().await?;
        let binding = conn
            .declare_binding(self.shared.name.clone(), EndpointRef::Queue(queue.name().await), pattern, args)
            .await;
        binding.initialized().await?;
        let mut guard = self.shared.consumer_queue.lock().await;
        *guard = Some(queue.clone());
        Ok(queue)
    }

    pub async fn activate_consumer(
        &self,
        pattern: impl Into<String>,
        callback: ActivateCallback,
        options: ConsumerOptions,
    ) -> Result<(), FacadeError> {
        let queue = self.private_queue(&pattern.into(), FieldTable::default()).await?;
        queue.activate_consumer(callback, options).await
    }

    pub async fn start_consumer(
        &self,
        pattern: impl Into<String>,
        callback: DecodedCallback,
        options: ConsumerOptions,
    ) -> Result<(), FacadeError> {
        let queue = self.private_queue(&pattern.into(), FieldTable::default()).await?;
        queue.start_consumer(callback, options).await
    }

    pub async fn start_consumer_raw(
        &self,
        pattern: impl Into<String>,
        callback: RawCallback,
        options: ConsumerOptions,
    ) -> Result<(), FacadeError> {
        let queue = self.private_queue(&pattern.into(), FieldTable::default()).await?;
        queue.start_consumer_raw(callback, options).await
    }

    pub async fn stop_consumer(&self) -> Result<(), FacadeError> {
        let guard = self.shared.consumer_queue.lock().await;
        match guard.as_ref() {
            Some(queue) => queue.stop_consumer().await,
            None => Err(FacadeError::NoConsumerDefined),
        }
    }

    /// Removes every Binding touching this exchange, deletes the exchange
    /// from the broker, and removes it from the registry, per spec.md
    /// §4.2's `delete`.
    pub async fn delete(&self) -> Result<(), FacadeError> {
        self.teardown(true).await
    }

    /// Same as `delete` but skips the broker-side `exchangeDelete`, per
    /// spec.md §4.2's `close`.
    pub async fn close(&self) -> Result<(), FacadeError> {
        self.teardown(false).await
    }

    async fn teardown(&self, delete_broker_side: bool) -> Result<(), FacadeError> {
        let conn = self.connection()?;
        conn.remove_bindings_containing(EndpointKind::Exchange, &self.shared.name)
            .await?;
        if let Some(queue) = self.shared.consumer_queue.lock().await.take() {
            let _ = queue.delete().await;
        }
        if delete_broker_side {
            if let Ok(channel) = self.channel_handle().await {
                channel
                    .exchange_delete(&self.shared.name, ExchangeDeleteOptions::default())
                    .await?;
            }
        }
        conn.remove_exchange(&self.shared.name).await;
        Ok(())
    }

    /// Normalizes `message` and publishes it with `routing_key`, per
    /// spec.md §4.2's `Message.sendTo` delegation — the content is already
    /// encoded by `Message::new`, so this simply forwards the bytes through
    /// the same rebuild-and-retransmit publish path.
    pub async fn send(&self, routing_key: &str, message: Message) -> Result<(), FacadeError> {
        let properties = message.properties().clone();
        self.publish(routing_key, message.content().to_vec(), properties).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::test_support::TestSetup;

    #[test]
    fn declare_exchange_is_idempotent_by_name() {
        let setup = TestSetup::new();
        let conn = setup.connection.clone();
        setup.block_on(async move {
            let a = conn
                .declare_exchange("facade-test-exchange-idempotent", ExchangeKind::Topic, ExchangeOptions::default())
                .await;
            let b = conn
                .declare_exchange("facade-test-exchange-idempotent", ExchangeKind::Topic, ExchangeOptions::default())
                .await;
            assert_eq!(a.name(), b.name());
        });
    }

    #[test]
    fn publish_through_exchange_reaches_bound_queue() {
        let setup = TestSetup::new();
        let conn = setup.connection.clone();
        setup.block_on(async move {
            let exchange = conn
                .declare_exchange("facade-test-fanout", ExchangeKind::Fanout, ExchangeOptions::default())
                .await;
            exchange.initialized().await.unwrap();

            let queue = conn
                .declare_queue(
                    "facade-test-fanout-queue",
                    QueueOptions {
                        exclusive: true,
                        auto_delete: true,
                        ..Default::default()
                    },
                )
                .await;
            queue.initialized().await.unwrap();
            exchange
                .bind(EndpointRef::Queue(queue.name().await), "", FieldTable::default())
                .await
                .unwrap();

            let (tx, mut rx) = mpsc::channel(1);
            let tx = Arc::new(tx);
            queue
                .start_consumer_raw(
                    Arc::new(move |message: Message| {
                        let tx = tx.clone();
                        Box::pin(async move {
                            let _ = tx.send(message.content().to_vec()).await;
                            None
                        })
                    }),
                    ConsumerOptions::default(),
                )
                .await
                .unwrap();

            exchange.publish("", Payload::from("fanned out"), BasicProperties::default()).await.unwrap();

            let received = tokio::time::timeout(StdDuration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for delivery")
                .expect("consumer channel closed");
            assert_eq!(received, b"fanned out");
        });
    }

    #[test]
    fn activate_consumer_without_prior_registration_allocates_private_queue() {
        let setup = TestSetup::new();
        let conn = setup.connection.clone();
        setup.block_on(async move {
            let exchange = conn
                .declare_exchange("facade-test-direct-consumer", ExchangeKind::Direct, ExchangeOptions::default())
                .await;
            exchange.initialized().await.unwrap();

            let (tx, mut rx) = mpsc::channel(1);
            let tx = Arc::new(tx);
            exchange
                .activate_consumer(
                    "greetings",
                    Arc::new(move |message: Message| {
                        let tx = tx.clone();
                        Box::pin(async move {
                            let _ = message.ack().await;
                            let _ = tx.send(message.content().to_vec()).await;
                            None
                        })
                    }),
                    ConsumerOptions::default(),
                )
                .await
                .unwrap();

            exchange
                .publish("greetings", Payload::from("hi"), BasicProperties::default())
                .await
                .unwrap();

            let received = tokio::time::timeout(StdDuration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for delivery")
                .expect("consumer channel closed");
            assert_eq!(received, b"hi");
        });
    }
}
