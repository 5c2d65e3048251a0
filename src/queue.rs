use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use lapin::options::{
    BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel};
use tokio::sync::{watch, Mutex as TokioMutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::binding::EndpointKind;
use crate::connection::{await_init, ConnectionShared, InitState};
use crate::consumer::{ActivateCallback, Consumer, ConsumerOptions, ConsumerState, DecodedCallback, RawCallback, Reply};
use crate::error::FacadeError;
use crate::message::{Message, Payload};
use crate::rpc;

#[derive(Clone, Debug, Default)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    /// Milliseconds after which an unconsumed message is dropped or
    /// dead-lettered, per spec.md §3's `messageTtl`.
    pub message_ttl: Option<i32>,
    /// Milliseconds of inactivity after which the broker deletes this
    /// queue, per spec.md §3's `expires`.
    pub expires: Option<i32>,
    /// Exchange messages are routed to when rejected, expired, or the
    /// queue overflows, per spec.md §3's `deadLetterExchange`.
    pub dead_letter_exchange: Option<String>,
    /// Caps the number of ready messages the queue retains, per spec.md
    /// §3's `maxLength`.
    pub max_length: Option<i32>,
    pub arguments: FieldTable,
}

impl QueueOptions {
    fn declare_arguments(&self) -> FieldTable {
        let mut table = self.arguments.clone();
        if let Some(ttl) = self.message_ttl {
            table.insert("x-message-ttl".into(), AMQPValue::LongInt(ttl));
        }
        if let Some(expires) = self.expires {
            table.insert("x-expires".into(), AMQPValue::LongInt(expires));
        }
        if let Some(dlx) = &self.dead_letter_exchange {
            table.insert("x-dead-letter-exchange".into(), AMQPValue::LongString(dlx.as_str().into()));
        }
        if let Some(max_length) = self.max_length {
            table.insert("x-max-length".into(), AMQPValue::LongInt(max_length));
        }
        table
    }
}

struct ConsumerRegistration {
    consumer: Consumer,
    options: ConsumerOptions,
    #[allow(dead_code)]
    state: ConsumerState,
    consumer_tag: Option<String>,
    handle: Option<JoinHandle<()>>,
}

pub(crate) struct QueueState {
    requested_name: String,
    actual_name: RwLock<String>,
    options: QueueOptions,
    conn: Weak<ConnectionShared>,
    channel: TokioMutex<Option<Channel>>,
    init_tx: watch::Sender<InitState>,
    consumer: TokioMutex<Option<ConsumerRegistration>>,
}

/// A durable or transient message queue. An empty `requested_name` asks the
/// broker to generate a unique name (an anonymous queue), per spec.md §4.2.
#[derive(Clone)]
pub struct Queue {
    shared: Arc<QueueState>,
}

impl Queue {
    pub(crate) fn new(conn: Weak<ConnectionShared>, name: String, options: QueueOptions) -> Self {
        let (init_tx, _) = watch::channel(InitState::Pending);
        let shared = Arc::new(QueueState {
            actual_name: RwLock::new(name.clone()),
            requested_name: name,
            options,
            conn,
            channel: TokioMutex::new(None),
            init_tx,
            consumer: TokioMutex::new(None),
        });
        Self { shared }
    }

    pub async fn name(&self) -> String {
        self.shared.actual_name.read().await.clone()
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

    /// (Re)declares the queue against the current link and, if a consumer
    /// was previously registered, restarts it — this is what makes a
    /// consumer survive a reconnect, per spec.md §4.3.
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
                    conn.remove_queue(&self.shared.requested_name).await;
                }
                let _ = self.shared.init_tx.send(InitState::Failed(Arc::new(e.clone())));
            }
        }
        result
    }

    async fn initialize_inner(&self) -> Result<(), FacadeError> {
        let conn = self.connection()?;
        let channel = conn.open_channel().await?;
        let declared = channel
            .queue_declare(
                &self.shared.requested_name,
                QueueDeclareOptions {
                    durable: self.shared.options.durable,
                    exclusive: self.shared.options.exclusive,
                    auto_delete: self.shared.options.auto_delete,
                    ..Default::default()
                },
                self.shared.options.declare_arguments(),
            )
            .await?;
        {
            let mut name_guard = self.shared.actual_name.write().await;
            *name_guard = declared.name().to_string();
        }
        {
            let mut channel_guard = self.shared.channel.lock().await;
            *channel_guard = Some(channel);
        }
        self.reinitialize_consumer().await;
        Ok(())
    }

    /// Publishes to the default exchange with the queue's own name as
    /// routing key. On a synchronous publish failure (typical signal: the
    /// channel went stale from a silent link drop), triggers
    /// `Connection::rebuild_all` and, once it settles, re-looks-up the queue
    /// by name in the registry and retransmits exactly once — the
    /// at-least-once retry policy spec.md §4.2/§9 describes.
    pub async fn publish(&self, payload: impl Into<Payload>, properties: BasicProperties) -> Result<(), FacadeError> {
        let payload = payload.into();
        match self.try_publish(payload.clone(), properties.clone()).await {
            Ok(()) => Ok(()),
            Err(_) => {
                let conn = self.connection()?;
                let _ = crate::connection::Connection::from_shared(conn.clone())
                    .trigger_rebuild()
                    .await;
                let queue = conn
                    .get_queue(&self.shared.requested_name)
                    .await
                    .ok_or_else(|| FacadeError::NotFound(self.shared.requested_name.clone()))?;
                queue.try_publish(payload, properties).await
            }
        }
    }

    async fn try_publish(&self, payload: Payload, properties: BasicProperties) -> Result<(), FacadeError> {
        let channel = self.channel_handle().await?;
        let name = self.name().await;
        let (body, properties) = payload.encode(properties.with_delivery_mode(2));
        channel
            .basic_publish("", &name, BasicPublishOptions::default(), &body, properties)
            .await?
            .await?;
        Ok(())
    }

    /// Publishes a message and awaits a single reply via the broker's
    /// direct reply-to pseudo-queue, per spec.md §4.4.
    pub async fn rpc(
        &self,
        payload: impl Into<Payload>,
        properties: BasicProperties,
        timeout: Duration,
    ) -> Result<Message, FacadeError> {
        let channel = self.channel_handle().await?;
        let name = self.name().await;
        rpc::call(&channel, "", &name, payload.into(), properties, timeout).await
    }

    /// Binds this queue as the destination of `source`'s routing pattern.
    pub async fn bind(
        &self,
        source: impl Into<String>,
        pattern: impl Into<String>,
        args: FieldTable,
    ) -> Result<crate::binding::Binding, FacadeError> {
        let conn = crate::connection::Connection::from_shared(self.connection()?);
        let destination = crate::binding::EndpointRef::Queue(self.name().await);
        let binding = conn.declare_binding(source, destination, pattern, args).await;
        binding.initialized().await?;
        Ok(binding)
    }

    pub async fn unbind(&self, source: impl Into<String>, pattern: impl Into<String>) -> Result<(), FacadeError> {
        let conn = crate::connection::Connection::from_shared(self.connection()?);
        let source = source.into();
        let pattern = pattern.into();
        let destination = crate::binding::EndpointRef::Queue(self.name().await);
        let id = crate::binding::binding_id(&source, &destination, &pattern);
        match conn.get_binding(&id).await {
            Some(binding) => binding.delete().await,
            None => Err(FacadeError::NotFound(id)),
        }
    }

    pub async fn activate_consumer(
        &self,
        callback: ActivateCallback,
        options: ConsumerOptions,
    ) -> Result<(), FacadeError> {
        self.start_consumer_internal(Consumer::Activate(callback), options).await
    }

    pub async fn start_consumer(
        &self,
        callback: DecodedCallback,
        options: ConsumerOptions,
    ) -> Result<(), FacadeError> {
        self.start_consumer_internal(Consumer::StartDecoded(callback), options)
            .await
    }

    pub async fn start_consumer_raw(
        &self,
        callback: RawCallback,
        options: ConsumerOptions,
    ) -> Result<(), FacadeError> {
        self.start_consumer_internal(Consumer::StartRaw(callback), options).await
    }

    async fn start_consumer_internal(
        &self,
        consumer: Consumer,
        options: ConsumerOptions,
    ) -> Result<(), FacadeError> {
        {
            let mut slot = self.shared.consumer.lock().await;
            if slot.is_some() {
                return Err(FacadeError::ConsumerAlreadyDefined);
            }
            *slot = Some(ConsumerRegistration {
                consumer: consumer.clone(),
                options: options.clone(),
                state: ConsumerState::Starting,
                consumer_tag: None,
                handle: None,
            });
        }
        self.initialize_consumer(consumer, options).await
    }

    async fn initialize_consumer(&self, consumer: Consumer, options: ConsumerOptions) -> Result<(), FacadeError> {
        let channel = self.channel_handle().await?;
        let name = self.name().await;
        let consumer_tag = format!("ctag-{}", uuid::Uuid::new_v4());
        let mut lapin_consumer = channel
            .basic_consume(
                &name,
                &consumer_tag,
                BasicConsumeOptions {
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    ..Default::default()
                },
                options.arguments.clone(),
            )
            .await?;

        let no_ack = options.no_ack;
        let channel_for_loop = channel.clone();
        let consumer_for_loop = consumer.clone();
        let handle = tokio::spawn(async move {
            while let Some(delivery_result) = lapin_consumer.next().await {
                let delivery = match delivery_result {
                    Ok(d) => d,
                    Err(e) => {
                        warn!(error = %e, "consumer delivery error");
                        continue;
                    }
                };
                let message = Message::from_delivery(&delivery, channel_for_loop.clone());
                dispatch(consumer_for_loop.clone(), message, no_ack, channel_for_loop.clone()).await;
            }
        });

        let mut slot = self.shared.consumer.lock().await;
        if let Some(registration) = slot.as_mut() {
            registration.state = ConsumerState::Active;
            registration.consumer_tag = Some(consumer_tag);
            registration.handle = Some(handle);
        }
        Ok(())
    }

    async fn reinitialize_consumer(&self) {
        let existing = {
            let slot = self.shared.consumer.lock().await;
            slot.as_ref().map(|r| (r.consumer.clone(), r.options.clone()))
        };
        if let Some((consumer, options)) = existing {
            if let Err(e) = self.initialize_consumer(consumer, options).await {
                error!(error = %e, "consumer reinitialize failed");
            }
        }
    }

    pub async fn stop_consumer(&self) -> Result<(), FacadeError> {
        let mut slot = self.shared.consumer.lock().await;
        match slot.take() {
            Some(registration) => {
                if let Some(handle) = registration.handle {
                    handle.abort();
                }
                if let Some(tag) = registration.consumer_tag {
                    if let Ok(channel) = self.channel_handle().await {
                        let _ = channel.basic_cancel(&tag, BasicCancelOptions::default()).await;
                    }
                }
                Ok(())
            }
            None => Err(FacadeError::NoConsumerDefined),
        }
    }

    /// Cancels any active consumer, removes every Binding touching this
    /// queue, deletes the queue from the broker, and removes it from the
    /// registry, per spec.md §4.2's `delete`.
    pub async fn delete(&self) -> Result<(), FacadeError> {
        self.teardown(true).await
    }

    /// Same as `delete` but skips the broker-side `queueDelete`, per
    /// spec.md §4.2's `close`.
    pub async fn close(&self) -> Result<(), FacadeError> {
        self.teardown(false).await
    }

    async fn teardown(&self, delete_broker_side: bool) -> Result<(), FacadeError> {
        let _ = self.stop_consumer().await;
        let conn = self.connection()?;
        let name = self.name().await;
        conn.remove_bindings_containing(EndpointKind::Queue, &name).await?;
        if delete_broker_side {
            if let Ok(channel) = self.channel_handle().await {
                channel.queue_delete(&name, QueueDeleteOptions::default()).await?;
            }
        }
        conn.remove_queue(&self.shared.requested_name).await;
        Ok(())
    }

    /// Normalizes `message` and publishes it to this queue, per spec.md
    /// §4.2's `Message.sendTo` delegation — the content is already encoded
    /// by `Message::new`, so this forwards the bytes through the same
    /// rebuild-and-retransmit publish path.
    pub async fn send(&self, message: Message) -> Result<(), FacadeError> {
        let properties = message.properties().clone();
        self.publish(message.content().to_vec(), properties).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::test_support::TestSetup;

    #[test]
    fn declare_queue_is_idempotent_by_name() {
        let setup = TestSetup::new();
        let conn = setup.connection.clone();
        setup.block_on(async move {
            let a = conn.declare_queue("facade-test-idempotent", QueueOptions::default()).await;
            let b = conn.declare_queue("facade-test-idempotent", QueueOptions::default()).await;
            assert_eq!(a.name().await, b.name().await);
        });
    }

    #[test]
    fn publish_and_consume_roundtrip() {
        let setup = TestSetup::new();
        let conn = setup.connection.clone();
        setup.block_on(async move {
            let queue = conn
                .declare_queue(
                    "facade-test-roundtrip",
                    QueueOptions {
                        exclusive: true,
                        auto_delete: true,
                        ..Default::default()
                    },
                )
                .await;
            queue.initialized().await.unwrap();

            let (tx, mut rx) = mpsc::channel(1);
            let tx = Arc::new(tx);
            queue
                .start_consumer(
                    Arc::new(move |value: serde_json::Value| {
                        let tx = tx.clone();
                        Box::pin(async move {
                            let _ = tx.send(value).await;
                            None
                        })
                    }),
                    ConsumerOptions::default(),
                )
                .await
                .unwrap();

            queue
                .publish(Payload::json(&serde_json::json!({"hello": "world"})).unwrap(), BasicProperties::default())
                .await
                .unwrap();

            let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for delivery")
                .expect("consumer channel closed");
            assert_eq!(received, serde_json::json!({"hello": "world"}));
        });
    }

    /// Testable property 2 from spec.md §8 (stated there for Exchange, and
    /// symmetric for Queue): a declaration failure removes the entity from
    /// the registry so the name is free for a working redeclaration.
    #[test]
    fn failed_declaration_removes_the_queue_from_the_registry() {
        let setup = TestSetup::new();
        let conn = setup.connection.clone();
        setup.block_on(async move {
            let durable = conn
                .declare_queue("facade-test-declare-failure", QueueOptions { durable: true, ..Default::default() })
                .await;
            durable.initialized().await.unwrap();
            durable.close().await.unwrap();
            assert!(conn.get_queue("facade-test-declare-failure").await.is_none());

            let conflicting = conn
                .declare_queue(
                    "facade-test-declare-failure",
                    QueueOptions {
                        durable: false,
                        exclusive: true,
                        auto_delete: true,
                        ..Default::default()
                    },
                )
                .await;
            assert!(conflicting.initialized().await.is_err());
            assert!(conn.get_queue("facade-test-declare-failure").await.is_none());
        });
    }

    #[test]
    fn stop_consumer_without_one_registered_errors() {
        let setup = TestSetup::new();
        let conn = setup.connection.clone();
        setup.block_on(async move {
            let queue = conn
                .declare_queue(
                    "facade-test-no-consumer",
                    QueueOptions {
                        exclusive: true,
                        auto_delete: true,
                        ..Default::default()
                    },
                )
                .await;
            queue.initialized().await.unwrap();
            let err = queue.stop_consumer().await.unwrap_err();
            assert!(matches!(err, FacadeError::NoConsumerDefined));
        });
    }

    /// Scenario 5 from spec.md §8: an RPC call against a server queue whose
    /// consumer doubles its input resolves with the doubled value, via the
    /// broker's direct reply-to pseudo-queue.
    #[test]
    fn rpc_resolves_with_the_consumer_callbacks_reply() {
        let setup = TestSetup::new();
        let conn = setup.connection.clone();
        setup.block_on(async move {
            let server_queue = conn
                .declare_queue(
                    "facade-test-rpc-server",
                    QueueOptions {
                        exclusive: true,
                        auto_delete: true,
                        ..Default::default()
                    },
                )
                .await;
            server_queue.initialized().await.unwrap();
            server_queue
                .activate_consumer(
                    Arc::new(move |message: Message| {
                        Box::pin(async move {
                            let _ = message.ack().await;
                            let input: i64 = message.get_content().unwrap_or_default();
                            Some(Payload::json(&(input * 2)).unwrap())
                        })
                    }),
                    ConsumerOptions::default(),
                )
                .await
                .unwrap();

            let reply = server_queue
                .rpc(Payload::json(&21).unwrap(), BasicProperties::default(), Duration::from_secs(5))
                .await
                .unwrap();
            let value: i64 = reply.get_content().unwrap();
            assert_eq!(value, 42);
        });
    }
}

/// Runs a delivered message through its consumer callback, then, if the
/// delivery carried a `reply_to` and the callback (didn't panic and)
/// returned a reply, sends it there via `sendToQueue` (spec.md §4.3). A
/// panicking callback produces neither an automatic nack nor a reply — only
/// logged, per spec.md §7 — and the legacy shapes still auto-ack regardless
/// of the panic, matching the behavior spec.md §9's third open question
/// flags rather than silently changing it.
async fn dispatch(consumer: Consumer, message: Message, no_ack: bool, channel: Channel) {
    let reply_to = message.reply_to();
    match consumer {
        Consumer::Activate(callback) => {
            let outcome = AssertUnwindSafe(callback(message)).catch_unwind().await;
            send_reply_if_any(&channel, reply_to, outcome).await;
        }
        Consumer::StartDecoded(callback) => {
            let ack_handle = message.ack_handle().cloned();
            let value: serde_json::Value = message.get_content().unwrap_or(serde_json::Value::Null);
            let outcome = AssertUnwindSafe(callback(value)).catch_unwind().await;
            if !no_ack {
                if let Some(handle) = ack_handle {
                    let _ = handle.ack().await;
                }
            }
            send_reply_if_any(&channel, reply_to, outcome).await;
        }
        Consumer::StartRaw(callback) => {
            let ack_handle = message.ack_handle().cloned();
            let outcome = AssertUnwindSafe(callback(message)).catch_unwind().await;
            if !no_ack {
                if let Some(handle) = ack_handle {
                    let _ = handle.ack().await;
                }
            }
            send_reply_if_any(&channel, reply_to, outcome).await;
        }
    }
}

async fn send_reply_if_any(
    channel: &Channel,
    reply_to: Option<ShortString>,
    outcome: Result<Reply, Box<dyn std::any::Any + Send>>,
) {
    let reply = match outcome {
        Ok(reply) => reply,
        Err(panic) => {
            // spec.md §4.3/§7: callback exceptions are caught and logged;
            // the delivery is otherwise unaffected (no automatic nack).
            error!(panic = %panic_message(&panic), "consumer callback panicked");
            return;
        }
    };
    let (Some(reply), Some(reply_to)) = (reply, reply_to) else {
        return;
    };
    let (body, properties) = reply.encode(BasicProperties::default());
    if let Err(e) = channel
        .basic_publish("", reply_to.as_str(), BasicPublishOptions::default(), &body, properties)
        .await
    {
        error!(error = %e, "failed to send consumer reply");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
