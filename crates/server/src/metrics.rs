#![cfg(feature = "metrics")]

use anyhow::Result;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct MetricsContext {
    registry: Registry,
    pub http_requests_total: IntCounterVec,
    pub push_deliveries_total: IntCounterVec,
    pub chat_connections: IntGauge,
}

impl MetricsContext {
    pub fn init() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new(
                "planora_http_requests_total",
                "Number of HTTP responses served, labeled by route and status",
            ),
            &["route", "status"],
        )?;
        registry.register(Box::new(http_requests_total.clone()))?;

        let push_deliveries_total = IntCounterVec::new(
            Opts::new(
                "planora_push_deliveries_total",
                "Chat push attempts, labeled by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(push_deliveries_total.clone()))?;

        let chat_connections = IntGauge::new(
            "planora_chat_connections",
            "Currently open chat WebSocket connections",
        )?;
        registry.register(Box::new(chat_connections.clone()))?;

        Ok(Arc::new(Self {
            registry,
            http_requests_total,
            push_deliveries_total,
            chat_connections,
        }))
    }

    pub fn record_push_delivery(&self, outcome: &'static str) {
        self.push_deliveries_total
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn websocket_opened(&self) {
        self.chat_connections.inc();
    }

    pub fn websocket_closed(&self) {
        self.chat_connections.dec();
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}
