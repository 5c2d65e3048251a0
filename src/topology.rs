use lapin::types::FieldTable;
use lapin::ExchangeKind;

use crate::exchange::ExchangeOptions;
use crate::queue::QueueOptions;

/// A binding's destination, named rather than referenced — see
/// `binding::EndpointRef` for why.
pub use crate::binding::EndpointRef as Destination;

#[derive(Clone, Debug)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub options: ExchangeOptions,
}

#[derive(Clone, Debug)]
pub struct QueueSpec {
    pub name: String,
    pub options: QueueOptions,
}

#[derive(Clone, Debug)]
pub struct BindingSpec {
    pub source: String,
    pub destination: Destination,
    pub pattern: String,
    pub args: FieldTable,
}

/// A declarative bundle of exchanges, queues, and bindings that can be
/// handed to `Connection::declare_topology` in one call, per spec.md §4.5 —
/// the bulk-declaration alternative to calling `declare_exchange` /
/// `declare_queue` / `declare_binding` one at a time.
#[derive(Clone, Debug, Default)]
pub struct Topology {
    pub exchanges: Vec<ExchangeSpec>,
    pub queues: Vec<QueueSpec>,
    pub bindings: Vec<BindingSpec>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exchange(mut self, name: impl Into<String>, kind: ExchangeKind, options: ExchangeOptions) -> Self {
        self.exchanges.push(ExchangeSpec {
            name: name.into(),
            kind,
            options,
        });
        self
    }

    pub fn queue(mut self, name: impl Into<String>, options: QueueOptions) -> Self {
        self.queues.push(QueueSpec { name: name.into(), options });
        self
    }

    pub fn binding(
        mut self,
        source: impl Into<String>,
        destination: Destination,
        pattern: impl Into<String>,
        args: FieldTable,
    ) -> Self {
        self.bindings.push(BindingSpec {
            source: source.into(),
            destination,
            pattern: pattern.into(),
            args,
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_accumulates_specs_in_declaration_order() {
        let topology = Topology::new()
            .exchange("events", ExchangeKind::Topic, ExchangeOptions::default())
            .queue("events.orders", QueueOptions::default())
            .binding(
                "events",
                Destination::Queue("events.orders".to_string()),
                "orders.#",
                FieldTable::default(),
            );

        assert_eq!(topology.exchanges.len(), 1);
        assert_eq!(topology.queues.len(), 1);
        assert_eq!(topology.bindings.len(), 1);
        assert_eq!(topology.bindings[0].source, "events");
    }
}
