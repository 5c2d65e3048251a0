//! Declarative, self-healing client facade over an AMQP 0-9-1 broker.
//!
//! `Connection` supervises a single broker link; `Exchange`, `Queue`, and
//! `Binding` are declared against it and transparently rebuild themselves
//! whenever the link is lost and re-established.

mod binding;
mod config;
mod connection;
mod consumer;
mod error;
mod exchange;
mod message;
mod queue;
mod rpc;
mod topology;

#[cfg(test)]
mod test_support;

pub use binding::{binding_id, Binding, EndpointKind, EndpointRef};
pub use config::{ReconnectStrategy, SocketOptions};
pub use connection::Connection;
pub use consumer::{ActivateCallback, ConsumerOptions, DecodedCallback, RawCallback, Reply};
pub use error::FacadeError;
pub use exchange::{Exchange, ExchangeOptions};
pub use message::{AckHandle, DeliveryFields, Message, Payload};
pub use queue::{Queue, QueueOptions};
pub use topology::{BindingSpec, Destination, ExchangeSpec, QueueSpec, Topology};

pub use lapin::types::FieldTable;
pub use lapin::{BasicProperties, ExchangeKind};
