use std::time::Duration;

use lapin::ConnectionProperties;

/// Opaque transport configuration passed through to the underlying AMQP
/// library's connection properties, mirroring the teacher's pattern of
/// accepting a `rabbit_uri` plus unopinionated connection-level options.
#[derive(Clone, Debug, Default)]
pub struct SocketOptions {
    pub connection_name: Option<String>,
}

impl SocketOptions {
    pub(crate) fn to_properties(&self) -> ConnectionProperties {
        let props = ConnectionProperties::default();
        match &self.connection_name {
            Some(name) => props.with_connection_name(name.clone().into()),
            None => props,
        }
    }
}

/// `retries == 0` means "retry forever", matching spec.md's documented
/// behavior verbatim.
#[derive(Clone, Copy, Debug)]
pub struct ReconnectStrategy {
    pub retries: u32,
    pub interval: Duration,
}

impl Default for ReconnectStrategy {
    fn default() -> Self {
        Self {
            retries: 0,
            interval: Duration::from_millis(500),
        }
    }
}

impl ReconnectStrategy {
    /// True while another attempt should be scheduled after a failure at
    /// `retry` (zero-based attempt count already made).
    pub(crate) fn should_retry(&self, retry: u32) -> bool {
        self.retries == 0 || self.retries > retry
    }
}

fn application_name() -> String {
    std::env::var("APPLICATIONNAME").unwrap_or_else(|_| "rust-amqp-facade".to_string())
}

fn host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string())
}

/// Name of the private queue an Exchange transparently allocates for its own
/// `activate_consumer`/`start_consumer`, per spec.md §6:
/// `"<exchange>.<appName>.<hostname>.<pid>"`.
pub(crate) fn anonymous_queue_name(exchange_name: &str) -> String {
    format!(
        "{}.{}.{}.{}",
        exchange_name,
        application_name(),
        host_name(),
        std::process::id()
    )
}
