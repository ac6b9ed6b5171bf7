use prometheus::{
    register_counter_with_registry, register_gauge_with_registry, Counter, Gauge, Registry,
};
use std::sync::Arc;

pub struct RelayMetrics {
    pub keys_published: Counter,
    pub messages_persisted: Counter,
    pub persist_failures: Counter,
    pub pushes_delivered: Counter,
    pub pushes_dropped: Counter,
    pub active_connections: Gauge,
    pub registry: Arc<Registry>,
}

impl RelayMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Arc::new(Registry::new());

        let keys_published = register_counter_with_registry!(
            "duet_relay_keys_published_total",
            "Total number of public keys published",
            registry
        )?;

        let messages_persisted = register_counter_with_registry!(
            "duet_relay_messages_persisted_total",
            "Total number of ciphertext messages persisted",
            registry
        )?;

        let persist_failures = register_counter_with_registry!(
            "duet_relay_persist_failures_total",
            "Total number of messages that failed to persist",
            registry
        )?;

        let pushes_delivered = register_counter_with_registry!(
            "duet_relay_pushes_delivered_total",
            "Total number of live pushes queued to a connection",
            registry
        )?;

        let pushes_dropped = register_counter_with_registry!(
            "duet_relay_pushes_dropped_total",
            "Total number of live pushes dropped on a full or closed queue",
            registry
        )?;

        let active_connections = register_gauge_with_registry!(
            "duet_relay_active_connections",
            "Number of open live connections",
            registry
        )?;

        Ok(Self {
            keys_published,
            messages_persisted,
            persist_failures,
            pushes_delivered,
            pushes_dropped,
            active_connections,
            registry,
        })
    }

    pub fn export_prometheus(&self) -> Result<String, prometheus::Error> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
