use std::time::Duration;

use futures::StreamExt;
use lapin::options::{BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel};

use crate::error::FacadeError;
use crate::message::{Message, Payload};

/// Fixed pseudo-queue name RabbitMQ reserves for direct reply-to RPC.
const DIRECT_REPLY_TO: &str = "amq.rabbitmq.reply-to";

/// Publishes `payload` with `reply_to` set to the broker's direct reply-to
/// pseudo-queue, and awaits exactly one reply delivery, per spec.md §4.4.
/// The reply-to consumer is `no_ack` by construction (RabbitMQ requires it).
/// On the first delivery (or on timeout) the subscription is cancelled
/// explicitly rather than left to an implicit drop, per spec.md §4.2's "on
/// the first delivery, cancels the subscription and resolves".
pub(crate) async fn call(
    channel: &Channel,
    exchange: &str,
    routing_key: &str,
    payload: Payload,
    properties: BasicProperties,
    timeout: Duration,
) -> Result<Message, FacadeError> {
    let consumer_tag = format!("rpc-{}", uuid::Uuid::new_v4());
    let mut reply_consumer = channel
        .basic_consume(
            DIRECT_REPLY_TO,
            &consumer_tag,
            BasicConsumeOptions {
                no_ack: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    let properties = properties.with_reply_to(DIRECT_REPLY_TO.into());
    let (body, properties) = payload.encode(properties);
    channel
        .basic_publish(exchange, routing_key, BasicPublishOptions::default(), &body, properties)
        .await?
        .await?;

    let outcome = tokio::time::timeout(timeout, reply_consumer.next()).await;
    let _ = channel.basic_cancel(&consumer_tag, BasicCancelOptions::default()).await;

    match outcome {
        Ok(Some(Ok(delivery))) => Ok(Message::from_delivery(&delivery, channel.clone())),
        Ok(Some(Err(e))) => Err(FacadeError::from(e)),
        Ok(None) => Err(FacadeError::ChannelClosed),
        Err(_) => Err(FacadeError::Timeout(format!(
            "rpc call on {exchange:?}/{routing_key:?} timed out after {timeout:?}"
        ))),
    }
}
