//! Engine Metrics
//!
//! Counters owned by the engine plus the exporter that maps driver-produced
//! samples onto gauge vectors. Everything lives in one registry that the
//! metrics endpoint encodes on demand.

use crate::domain::ports::MetricSample;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use prometheus::{Encoder, GaugeVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::collections::{BTreeMap, HashMap};

const NAMESPACE: &str = "quota_reconciler";

/// Engine-owned metrics registry
pub struct EngineMetrics {
    registry: Registry,
    audit_publish_success: IntCounterVec,
    audit_publish_failure: IntCounterVec,
    scrape_failures: IntCounterVec,
    /// Gauge vectors for driver samples, registered on first sight
    driver_gauges: Mutex<BTreeMap<String, GaugeVec>>,
}

impl EngineMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let audit_publish_success = IntCounterVec::new(
            Opts::new(
                "successful_auditevent_publish",
                "Counter for successful audit event publish to the audit sink.",
            )
            .namespace(NAMESPACE),
            &["os_cluster"],
        )?;
        let audit_publish_failure = IntCounterVec::new(
            Opts::new(
                "failed_auditevent_publish",
                "Counter for failed audit event publish to the audit sink.",
            )
            .namespace(NAMESPACE),
            &["os_cluster"],
        )?;
        let scrape_failures = IntCounterVec::new(
            Opts::new("scrape_failures", "Counter for failed driver scrapes.")
                .namespace(NAMESPACE),
            &["os_cluster", "kind"],
        )?;

        registry.register(Box::new(audit_publish_success.clone()))?;
        registry.register(Box::new(audit_publish_failure.clone()))?;
        registry.register(Box::new(scrape_failures.clone()))?;

        Ok(Self {
            registry,
            audit_publish_success,
            audit_publish_failure,
            scrape_failures,
            driver_gauges: Mutex::new(BTreeMap::new()),
        })
    }

    /// Make the audit counters of a cluster visible with value 0
    pub fn init_audit_counters(&self, cluster_id: &str) {
        self.audit_publish_success.with_label_values(&[cluster_id]).inc_by(0);
        self.audit_publish_failure.with_label_values(&[cluster_id]).inc_by(0);
    }

    pub fn record_audit_publish(&self, cluster_id: &str, success: bool) {
        let counter = if success {
            &self.audit_publish_success
        } else {
            &self.audit_publish_failure
        };
        counter.with_label_values(&[cluster_id]).inc();
    }

    pub fn audit_publish_count(&self, cluster_id: &str, success: bool) -> u64 {
        let counter = if success {
            &self.audit_publish_success
        } else {
            &self.audit_publish_failure
        };
        counter.with_label_values(&[cluster_id]).get()
    }

    /// `kind` is one of `capacity`, `quota` or `rates`
    pub fn record_scrape_failure(&self, cluster_id: &str, kind: &str) {
        self.scrape_failures
            .with_label_values(&[cluster_id, kind])
            .inc();
    }

    pub fn scrape_failure_count(&self, cluster_id: &str, kind: &str) -> u64 {
        self.scrape_failures
            .with_label_values(&[cluster_id, kind])
            .get()
    }

    // =========================================================================
    // Driver Samples
    // =========================================================================

    /// Set gauges from driver samples
    ///
    /// A sample whose label names disagree with an earlier sample of the same
    /// name is rejected.
    pub fn export_samples(&self, samples: &[MetricSample]) -> Result<()> {
        let mut gauges = self.driver_gauges.lock();
        for sample in samples {
            let gauge = match gauges.get(&sample.name) {
                Some(gauge) => gauge.clone(),
                None => {
                    let label_names: Vec<&str> =
                        sample.labels.keys().map(String::as_str).collect();
                    let gauge = GaugeVec::new(
                        Opts::new(sample.name.clone(), sample.help.clone()),
                        &label_names,
                    )?;
                    self.registry.register(Box::new(gauge.clone()))?;
                    gauges.insert(sample.name.clone(), gauge.clone());
                    gauge
                }
            };

            let labels: HashMap<&str, &str> = sample
                .labels
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            gauge.get_metric_with(&labels)?.set(sample.value);
        }
        Ok(())
    }

    /// Render all metrics in the text exposition format
    pub fn encode_text(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}
