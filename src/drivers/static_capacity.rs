//! Static Capacity Driver
//!
//! Reports capacity values listed in the endpoint parameters. Used for
//! resources whose capacity is known up front but should still flow
//! through the regular capacity scrape.

use super::parse_params;
use crate::domain::model::{AzCapacity, OpaqueBlob, UNKNOWN_AZ};
use crate::domain::ports::{
    CapacityData, CapacityDriver, CapacityReport, CapacityScrape, EndpointConfig, MetricSample,
};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

pub const DRIVER_ID: &str = "static";

#[derive(Debug, Clone, Default, Deserialize)]
struct StaticCapacityParams {
    #[serde(default)]
    resources: Vec<StaticCapacityEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct StaticCapacityEntry {
    service: String,
    resource: String,
    capacity: u64,
    /// AZ name → capacity and usage; an empty name means "not placed"
    #[serde(default)]
    per_az: BTreeMap<String, AzCapacity>,
    #[serde(default)]
    subcapacities: Vec<serde_json::Value>,
}

/// Serialized metrics of one scrape
#[derive(Debug, Serialize, Deserialize)]
struct ReportedCapacity {
    service: String,
    resource: String,
    capacity: u64,
}

pub struct StaticCapacityDriver {
    capacitor_id: String,
    entries: Vec<StaticCapacityEntry>,
}

impl StaticCapacityDriver {
    pub fn new(capacitor_id: &str, endpoint: &EndpointConfig) -> Result<Self> {
        let params: StaticCapacityParams = parse_params(DRIVER_ID, &endpoint.params)?;
        Ok(Self {
            capacitor_id: capacitor_id.to_string(),
            entries: params.resources,
        })
    }
}

#[async_trait]
impl CapacityDriver for StaticCapacityDriver {
    async fn init(&self, _endpoint: &EndpointConfig) -> Result<()> {
        debug!(
            "Static capacitor {} serves {} resources",
            self.capacitor_id,
            self.entries.len()
        );
        Ok(())
    }

    fn id(&self) -> &str {
        &self.capacitor_id
    }

    async fn scrape(&self, _endpoint: &EndpointConfig) -> Result<CapacityScrape> {
        let mut capacities = CapacityReport::new();
        let mut reported = Vec::with_capacity(self.entries.len());

        for entry in &self.entries {
            let capacity_per_az = if entry.per_az.is_empty() {
                None
            } else {
                let mut per_az: BTreeMap<String, AzCapacity> = BTreeMap::new();
                for (az, value) in &entry.per_az {
                    let az = if az.is_empty() { UNKNOWN_AZ } else { az.as_str() };
                    let slot = per_az.entry(az.to_string()).or_default();
                    slot.capacity += value.capacity;
                    slot.usage += value.usage;
                }
                Some(per_az)
            };

            capacities
                .entry(entry.service.clone())
                .or_default()
                .insert(
                    entry.resource.clone(),
                    CapacityData {
                        capacity: entry.capacity,
                        capacity_per_az,
                        subcapacities: entry.subcapacities.clone(),
                    },
                );
            reported.push(ReportedCapacity {
                service: entry.service.clone(),
                resource: entry.resource.clone(),
                capacity: entry.capacity,
            });
        }

        Ok(CapacityScrape {
            capacities,
            serialized_metrics: OpaqueBlob::from_json(&reported)?,
        })
    }

    fn collect_metrics(&self, cluster_id: &str, metrics: &OpaqueBlob) -> Result<Vec<MetricSample>> {
        if metrics.is_empty() {
            return Ok(Vec::new());
        }
        let reported: Vec<ReportedCapacity> = metrics.parse_json()?;
        Ok(reported
            .into_iter()
            .map(|r| {
                MetricSample::gauge(
                    "quota_reconciler_static_capacity",
                    "Capacity reported by a static capacitor.",
                    r.capacity as f64,
                )
                .with_label("os_cluster", cluster_id)
                .with_label("capacitor", self.capacitor_id.clone())
                .with_label("service", r.service)
                .with_label("resource", r.resource)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn endpoint() -> EndpointConfig {
        EndpointConfig {
            params: json!({
                "resources": [
                    {
                        "service": "storage",
                        "resource": "capacity",
                        "capacity": 500,
                        "per_az": {
                            "az-a": {"capacity": 300, "usage": 20},
                            "": {"capacity": 200, "usage": 5}
                        }
                    },
                    {"service": "compute", "resource": "cores", "capacity": 64}
                ]
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_scrape_buckets_unplaced_data() {
        let driver = StaticCapacityDriver::new("manual", &endpoint()).unwrap();
        let scrape = driver.scrape(&endpoint()).await.unwrap();

        let storage = &scrape.capacities["storage"]["capacity"];
        assert_eq!(storage.capacity, 500);
        let per_az = storage.capacity_per_az.as_ref().unwrap();
        assert_eq!(per_az[UNKNOWN_AZ], AzCapacity { capacity: 200, usage: 5 });
        assert_eq!(per_az["az-a"].capacity, 300);

        assert!(scrape.capacities["compute"]["cores"].capacity_per_az.is_none());
    }

    #[tokio::test]
    async fn test_metrics_from_blob() {
        let driver = StaticCapacityDriver::new("manual", &endpoint()).unwrap();
        let scrape = driver.scrape(&endpoint()).await.unwrap();

        let samples = driver.collect_metrics("west", &scrape.serialized_metrics).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].labels["os_cluster"], "west");
        assert_eq!(samples[0].value, 500.0);
        assert!(driver.collect_metrics("west", &OpaqueBlob::empty()).unwrap().is_empty());
    }

    #[test]
    fn test_missing_params_mean_no_resources() {
        let driver = StaticCapacityDriver::new("manual", &EndpointConfig::default()).unwrap();
        assert!(driver.entries.is_empty());
        assert_eq!(driver.id(), "manual");
    }
}
