use std::sync::{Arc, Weak};

use lapin::options::{ExchangeBindOptions, ExchangeUnbindOptions, QueueBindOptions, QueueUnbindOptions};
use lapin::types::FieldTable;
use tokio::sync::watch;

use crate::connection::{ConnectionShared, InitState};
use crate::error::FacadeError;

/// Tag distinguishing whether a Binding's destination (or a Topology
/// binding-spec's destination) is an Exchange or a Queue, per spec.md §9's
/// "polymorphic destination ... tagged variant with two arms" design note.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointKind {
    Exchange,
    Queue,
}

impl EndpointKind {
    fn label(self) -> &'static str {
        match self {
            EndpointKind::Exchange => "Exchange",
            EndpointKind::Queue => "Queue",
        }
    }
}

/// A destination named by stable string identity rather than by direct
/// reference, per spec.md §9's "arena + stable identifier" recommendation —
/// avoids reference cycles between Connection, Binding, and its endpoints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EndpointRef {
    Exchange(String),
    Queue(String),
}

impl EndpointRef {
    pub fn kind(&self) -> EndpointKind {
        match self {
            EndpointRef::Exchange(_) => EndpointKind::Exchange,
            EndpointRef::Queue(_) => EndpointKind::Queue,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            EndpointRef::Exchange(n) | EndpointRef::Queue(n) => n,
        }
    }
}

/// Identity key from spec.md §3: `"[source]to{Exchange|Queue}[dest]pattern"`.
pub fn binding_id(source: &str, destination: &EndpointRef, pattern: &str) -> String {
    format!(
        "[{source}]to{}[{}]{pattern}",
        destination.kind().label(),
        destination.name()
    )
}

pub(crate) struct BindingState {
    id: String,
    source: String,
    destination: EndpointRef,
    pattern: String,
    args: FieldTable,
    conn: Weak<ConnectionShared>,
    init_tx: watch::Sender<InitState>,
}

/// Directed edge from a source exchange to a destination queue or exchange.
/// Holds only a `Weak` back-reference to the owning connection: the strong
/// direction of ownership runs Connection → Binding, never the reverse, so
/// dropping a Connection can't be held up by bindings that still exist.
#[derive(Clone)]
pub struct Binding {
    shared: Arc<BindingState>,
}

impl Binding {
    pub(crate) fn new(
        conn: Weak<ConnectionShared>,
        source: String,
        destination: EndpointRef,
        pattern: String,
        args: FieldTable,
    ) -> Self {
        let id = binding_id(&source, &destination, &pattern);
        let (init_tx, _) = watch::channel(InitState::Pending);
        let shared = Arc::new(BindingState {
            id,
            source,
            destination,
            pattern,
            args,
            conn,
            init_tx,
        });
        Self { shared }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn source(&self) -> &str {
        &self.shared.source
    }

    pub fn destination(&self) -> &EndpointRef {
        &self.shared.destination
    }

    pub async fn initialized(&self) -> Result<(), FacadeError> {
        crate::connection::await_init(self.shared.init_tx.subscribe()).await
    }

    fn connection(&self) -> Result<Arc<ConnectionShared>, FacadeError> {
        self.shared.conn.upgrade().ok_or(FacadeError::ChannelClosed)
    }

    /// Awaits the destination's `initialized`, then issues
    /// `bindQueue`/`bindExchange`. On failure removes self from the
    /// registry and rejects, per spec.md §4.4.
    pub(crate) async fn initialize(&self) -> Result<(), FacadeError> {
        let result = self.initialize_inner().await;
        match &result {
            Ok(()) => {
                let _ = self.shared.init_tx.send(InitState::Ready);
            }
            Err(e) => {
                if let Ok(conn) = self.connection() {
                    conn.remove_binding(&self.shared.id).await;
                }
                let _ = self.shared.init_tx.send(InitState::Failed(Arc::new(e.clone())));
            }
        }
        result
    }

    async fn initialize_inner(&self) -> Result<(), FacadeError> {
        let conn = self.connection()?;
        match &self.shared.destination {
            EndpointRef::Queue(name) => {
                let queue = conn
                    .get_queue(name)
                    .await
                    .ok_or_else(|| FacadeError::NotFound(name.clone()))?;
                queue.initialized().await?;
                let channel = queue.channel_handle().await?;
                channel
                    .queue_bind(
                        name,
                        &self.shared.source,
                        &self.shared.pattern,
                        QueueBindOptions::default(),
                        self.shared.args.clone(),
                    )
                    .await?;
            }
            EndpointRef::Exchange(name) => {
                let exchange = conn
                    .get_exchange(name)
                    .await
                    .ok_or_else(|| FacadeError::NotFound(name.clone()))?;
                exchange.initialized().await?;
                let channel = exchange.channel_handle().await?;
                channel
                    .exchange_bind(
                        name,
                        &self.shared.source,
                        &self.shared.pattern,
                        ExchangeBindOptions::default(),
                        self.shared.args.clone(),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Symmetric unbind; on success removes self from the registry.
    pub async fn delete(&self) -> Result<(), FacadeError> {
        let conn = self.connection()?;
        match &self.shared.destination {
            EndpointRef::Queue(name) => {
                if let Some(queue) = conn.get_queue(name).await {
                    if let Ok(channel) = queue.channel_handle().await {
                        channel
                            .queue_unbind(
                                name,
                                &self.shared.source,
                                &self.shared.pattern,
                                self.shared.args.clone(),
                            )
                            .await?;
                    }
                }
            }
            EndpointRef::Exchange(name) => {
                if let Some(exchange) = conn.get_exchange(name).await {
                    if let Ok(channel) = exchange.channel_handle().await {
                        channel
                            .exchange_unbind(
                                name,
                                &self.shared.source,
                                &self.shared.pattern,
                                ExchangeUnbindOptions::default(),
                                self.shared.args.clone(),
                            )
                            .await?;
                    }
                }
            }
        }
        conn.remove_binding(&self.shared.id).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_id_matches_spec_format() {
        let dest = EndpointRef::Queue("q1".to_string());
        assert_eq!(binding_id("e1", &dest, "k"), "[e1]toQueue[q1]k");

        let dest = EndpointRef::Exchange("e2".to_string());
        assert_eq!(binding_id("e1", &dest, ""), "[e1]toExchange[e2]");
    }

    #[test]
    fn same_triple_produces_same_id_different_triple_differs() {
        let a = binding_id("e1", &EndpointRef::Queue("q1".to_string()), "k");
        let b = binding_id("e1", &EndpointRef::Queue("q1".to_string()), "k");
        let c = binding_id("e1", &EndpointRef::Queue("q1".to_string()), "other");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
