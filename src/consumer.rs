use std::sync::Arc;

use futures::future::BoxFuture;
use lapin::types::FieldTable;

use crate::message::{Message, Payload};

/// Every consumer callback may optionally return a reply payload; when the
/// originating delivery carried a `reply_to`, it is normalized and sent
/// there via `sendToQueue`, per spec.md §4.3. Returning `None` sends no
/// reply, matching a delivery without `reply_to` or a callback with
/// nothing to say back.
pub type Reply = Option<Payload>;

/// Callback shape for `activate_consumer`: the caller owns ack/nack/reject.
pub type ActivateCallback = Arc<dyn Fn(Message) -> BoxFuture<'static, Reply> + Send + Sync>;

/// Callback shape for legacy `start_consumer` with `raw_message = false`:
/// receives the JSON-decoded payload, delivery is auto-acked unless
/// `no_ack` is set.
pub type DecodedCallback =
    Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, Reply> + Send + Sync>;

/// Callback shape for legacy `start_consumer` with `raw_message = true`:
/// receives the raw `Message` (un-decoded), same auto-ack behavior as
/// `DecodedCallback`.
pub type RawCallback = Arc<dyn Fn(Message) -> BoxFuture<'static, Reply> + Send + Sync>;

/// The three consumer registration shapes from spec.md §4.3 / §9 ("three
/// distinct registration operations rather than one overloaded one with
/// flags" — expressed here as an enum tag rather than three separate methods,
/// since the methods themselves (`activate_consumer`, `start_consumer`) still
/// need to be distinct entry points on `Exchange`/`Queue`; this enum only
/// distinguishes the stored, re-invocable shape across rebuilds).
#[derive(Clone)]
pub(crate) enum Consumer {
    Activate(ActivateCallback),
    StartDecoded(DecodedCallback),
    StartRaw(RawCallback),
}

#[derive(Clone, Debug, Default)]
pub struct ConsumerOptions {
    pub no_ack: bool,
    pub exclusive: bool,
    pub arguments: FieldTable,
}

/// Inactive → Starting → Active → Cancelling → Inactive, per spec.md §4.3.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ConsumerState {
    Inactive,
    Starting,
    Active,
    Cancelling,
}
