//! Metrics module
//!
//! Per-device Prometheus counters. Each device owns a private [`Registry`]
//! so several devices can live in one process without name collisions.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::domain::BlockKind;
use crate::error::{Error, Result};

const NAMESPACE: &str = "blockverity";

/// Counters exported by a verity device
#[derive(Clone)]
pub struct VerityMetrics {
    registry: Registry,
    requests: IntCounterVec,
    blocks_verified: IntCounter,
    zero_blocks: IntCounter,
    corruptions: IntCounterVec,
    fec_corrected: IntCounterVec,
    fec_failures: IntCounter,
    in_flight: IntGauge,
}

impl VerityMetrics {
    /// Create and register all counters, labelled with the device name.
    pub fn new(device: &str) -> Result<Self> {
        let labels = [("device".to_string(), device.to_string())]
            .into_iter()
            .collect();
        let registry = Registry::new_custom(Some(NAMESPACE.to_string()), Some(labels))
            .map_err(metrics_error)?;

        let requests = IntCounterVec::new(
            Opts::new("requests_total", "Read requests by outcome"),
            &["outcome"],
        )
        .map_err(metrics_error)?;
        let blocks_verified = IntCounter::new(
            "blocks_verified_total",
            "Data blocks whose digest matched the hash tree",
        )
        .map_err(metrics_error)?;
        let zero_blocks = IntCounter::new(
            "zero_blocks_total",
            "Data blocks served as zeros without reading",
        )
        .map_err(metrics_error)?;
        let corruptions = IntCounterVec::new(
            Opts::new("corruptions_total", "Unrecovered verification failures"),
            &["kind"],
        )
        .map_err(metrics_error)?;
        let fec_corrected = IntCounterVec::new(
            Opts::new("fec_corrected_blocks_total", "Blocks recovered by FEC"),
            &["kind"],
        )
        .map_err(metrics_error)?;
        let fec_failures = IntCounter::new(
            "fec_failures_total",
            "FEC decode attempts that did not recover the block",
        )
        .map_err(metrics_error)?;
        let in_flight = IntGauge::new("requests_in_flight", "Requests being verified")
            .map_err(metrics_error)?;

        registry
            .register(Box::new(requests.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(blocks_verified.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(zero_blocks.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(corruptions.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(fec_corrected.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(fec_failures.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(in_flight.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            requests,
            blocks_verified,
            zero_blocks,
            corruptions,
            fec_corrected,
            fec_failures,
            in_flight,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_request(&self, outcome: &str) {
        self.requests.with_label_values(&[outcome]).inc();
    }

    pub fn record_verified(&self) {
        self.blocks_verified.inc();
    }

    pub fn record_zero_block(&self) {
        self.zero_blocks.inc();
    }

    pub fn record_corruption(&self, kind: BlockKind) {
        self.corruptions.with_label_values(&[kind.as_str()]).inc();
    }

    pub fn record_fec_corrected(&self, kind: BlockKind) {
        self.fec_corrected.with_label_values(&[kind.as_str()]).inc();
    }

    pub fn record_fec_failure(&self) {
        self.fec_failures.inc();
    }

    pub fn request_started(&self) {
        self.in_flight.inc();
    }

    pub fn request_finished(&self) {
        self.in_flight.dec();
    }

    pub fn blocks_verified(&self) -> u64 {
        self.blocks_verified.get()
    }

    pub fn zero_blocks(&self) -> u64 {
        self.zero_blocks.get()
    }

    pub fn fec_corrected(&self, kind: BlockKind) -> u64 {
        self.fec_corrected.with_label_values(&[kind.as_str()]).get()
    }

    pub fn fec_failures(&self) -> u64 {
        self.fec_failures.get()
    }

    pub fn corruptions(&self, kind: BlockKind) -> u64 {
        self.corruptions.with_label_values(&[kind.as_str()]).get()
    }

    /// Render all counters in the Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}

impl std::fmt::Debug for VerityMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerityMetrics")
            .field("blocks_verified", &self.blocks_verified.get())
            .field("zero_blocks", &self.zero_blocks.get())
            .field("fec_failures", &self.fec_failures.get())
            .finish()
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = VerityMetrics::new("vda").unwrap();
        metrics.record_verified();
        metrics.record_verified();
        metrics.record_corruption(BlockKind::Data);
        metrics.record_fec_corrected(BlockKind::Metadata);

        assert_eq!(metrics.blocks_verified(), 2);
        assert_eq!(metrics.corruptions(BlockKind::Data), 1);
        assert_eq!(metrics.corruptions(BlockKind::Metadata), 0);
        assert_eq!(metrics.fec_corrected(BlockKind::Metadata), 1);
    }

    #[test]
    fn test_encode_uses_namespace_and_device_label() {
        let metrics = VerityMetrics::new("vda").unwrap();
        metrics.record_request("ok");

        let text = metrics.encode().unwrap();
        assert!(text.contains("blockverity_requests_total"));
        assert!(text.contains("device=\"vda\""));
    }

    #[test]
    fn test_devices_do_not_collide() {
        let a = VerityMetrics::new("a").unwrap();
        let b = VerityMetrics::new("b").unwrap();
        a.record_zero_block();
        assert_eq!(a.zero_blocks(), 1);
        assert_eq!(b.zero_blocks(), 0);
    }
}
