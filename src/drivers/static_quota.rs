//! Static Quota Driver
//!
//! An in-memory quota backend seeded from the endpoint parameters. Quotas
//! written through `set_quota` are kept and reported by later scrapes, so the
//! engine sees the same propagation cycle as with a remote backend.

use super::parse_params;
use crate::domain::model::OpaqueBlob;
use crate::domain::ports::{
    EndpointConfig, MetricSample, OwnerIds, ProjectScrape, QuotaDriver, RateInfo, RateScrape,
    ResourceData, ResourceInfo, ServiceInfo,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

pub const DRIVER_ID: &str = "static";

#[derive(Debug, Clone, Default, Deserialize)]
struct StaticQuotaParams {
    #[serde(default)]
    product_name: Option<String>,
    #[serde(default)]
    area: Option<String>,
    #[serde(default)]
    resources: Vec<ResourceInfo>,
    #[serde(default)]
    rates: Vec<RateInfo>,
    /// project UUID → resource → initial backend state
    #[serde(default)]
    projects: BTreeMap<String, BTreeMap<String, StaticResourceData>>,
    /// rate → amount added to the counter on every rate scrape
    #[serde(default)]
    rate_increments: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
struct StaticResourceData {
    #[serde(default)]
    quota: i64,
    #[serde(default)]
    usage: u64,
    #[serde(default)]
    physical_usage: Option<u64>,
}

/// Rate scrape state; counters are decimal strings to hold full u128 values
#[derive(Debug, Default, Serialize, Deserialize)]
struct RateState {
    counters: BTreeMap<String, String>,
}

pub struct StaticQuotaDriver {
    info: ServiceInfo,
    resources: Vec<ResourceInfo>,
    rates: Vec<RateInfo>,
    rate_increments: BTreeMap<String, u64>,
    /// Backend state per project UUID
    projects: RwLock<BTreeMap<String, BTreeMap<String, StaticResourceData>>>,
}

impl StaticQuotaDriver {
    pub fn new(service_type: &str, endpoint: &EndpointConfig) -> Result<Self> {
        let params: StaticQuotaParams = parse_params(DRIVER_ID, &endpoint.params)?;
        Ok(Self {
            info: ServiceInfo {
                service_type: service_type.to_string(),
                product_name: params
                    .product_name
                    .unwrap_or_else(|| service_type.to_string()),
                area: params.area.unwrap_or_else(|| service_type.to_string()),
            },
            resources: params.resources,
            rates: params.rates,
            rate_increments: params.rate_increments,
            projects: RwLock::new(params.projects),
        })
    }

    fn error(&self, operation: &str, reason: impl std::fmt::Display) -> Error {
        Error::driver(&format!("{}/{}", DRIVER_ID, self.info.service_type), operation, reason)
    }
}

#[async_trait]
impl QuotaDriver for StaticQuotaDriver {
    async fn init(&self, _endpoint: &EndpointConfig) -> Result<()> {
        for resource in &self.resources {
            if resource.name.is_empty() {
                return Err(self.error("init", "resource without a name"));
            }
        }
        debug!(
            "Static quota driver for {} serves {} resources",
            self.info.service_type,
            self.resources.len()
        );
        Ok(())
    }

    fn service_info(&self) -> ServiceInfo {
        self.info.clone()
    }

    fn resources(&self) -> Vec<ResourceInfo> {
        self.resources.clone()
    }

    fn rates(&self) -> Vec<RateInfo> {
        self.rates.clone()
    }

    async fn scrape(&self, _endpoint: &EndpointConfig, owner: &OwnerIds) -> Result<ProjectScrape> {
        let projects = self.projects.read();
        let backend = projects.get(&owner.project_uuid);

        let mut resources = BTreeMap::new();
        let mut usage = BTreeMap::new();
        for info in &self.resources {
            let data = backend
                .and_then(|b| b.get(&info.name))
                .copied()
                .unwrap_or_default();
            usage.insert(info.name.clone(), data.usage);
            resources.insert(
                info.name.clone(),
                ResourceData {
                    quota: data.quota,
                    usage: data.usage,
                    physical_usage: data.physical_usage,
                    subresources: Vec::new(),
                },
            );
        }

        Ok(ProjectScrape {
            resources,
            serialized_metrics: OpaqueBlob::from_json(&usage)?,
        })
    }

    async fn scrape_rates(
        &self,
        _endpoint: &EndpointConfig,
        _owner: &OwnerIds,
        previous_state: &OpaqueBlob,
    ) -> Result<RateScrape> {
        let mut state: RateState = if previous_state.is_empty() {
            RateState::default()
        } else {
            previous_state.parse_json()?
        };

        let mut usage = BTreeMap::new();
        for rate in &self.rates {
            let previous = match state.counters.get(&rate.name) {
                Some(text) => text
                    .parse::<u128>()
                    .map_err(|e| self.error("scrape_rates", e))?,
                None => 0,
            };
            let increment = self.rate_increments.get(&rate.name).copied().unwrap_or(0);
            let current = previous.saturating_add(u128::from(increment));
            state.counters.insert(rate.name.clone(), current.to_string());
            usage.insert(rate.name.clone(), current);
        }

        Ok(RateScrape {
            usage,
            state: OpaqueBlob::from_json(&state)?,
        })
    }

    async fn set_quota(
        &self,
        _endpoint: &EndpointConfig,
        owner: &OwnerIds,
        quotas: &BTreeMap<String, u64>,
    ) -> Result<()> {
        for name in quotas.keys() {
            match self.resources.iter().find(|r| &r.name == name) {
                None => return Err(self.error("set_quota", format!("no such resource: {}", name))),
                Some(info) if info.externally_managed => {
                    return Err(self.error(
                        "set_quota",
                        format!("quota for {} is managed by the backend", name),
                    ))
                }
                Some(_) => {}
            }
        }

        let mut projects = self.projects.write();
        let backend = projects.entry(owner.project_uuid.clone()).or_default();
        for (name, quota) in quotas {
            let quota = i64::try_from(*quota).map_err(|e| self.error("set_quota", e))?;
            backend.entry(name.clone()).or_default().quota = quota;
        }

        info!(
            "Set {} quotas for project {} in {}",
            quotas.len(),
            owner.project_uuid,
            self.info.service_type
        );
        Ok(())
    }

    fn collect_metrics(
        &self,
        cluster_id: &str,
        owner: &OwnerIds,
        metrics: &OpaqueBlob,
    ) -> Result<Vec<MetricSample>> {
        if metrics.is_empty() {
            return Ok(Vec::new());
        }
        let usage: BTreeMap<String, u64> = metrics.parse_json()?;
        Ok(usage
            .into_iter()
            .map(|(resource, value)| {
                MetricSample::gauge(
                    "quota_reconciler_static_usage",
                    "Usage reported by a static quota backend.",
                    value as f64,
                )
                .with_label("os_cluster", cluster_id)
                .with_label("domain_id", owner.domain_uuid.clone())
                .with_label("project_id", owner.project_uuid.clone())
                .with_label("service", self.info.service_type.clone())
                .with_label("resource", resource)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn driver() -> StaticQuotaDriver {
        let endpoint = EndpointConfig {
            params: json!({
                "product_name": "nova",
                "resources": [
                    {"name": "cores"},
                    {"name": "ram", "unit": "MiB"},
                    {"name": "instances_external", "externally_managed": true}
                ],
                "rates": [{"name": "api_calls"}],
                "rate_increments": {"api_calls": 7},
                "projects": {
                    "p-1": {"cores": {"quota": 10, "usage": 4}}
                }
            }),
            ..Default::default()
        };
        StaticQuotaDriver::new("compute", &endpoint).unwrap()
    }

    fn owner(project: &str) -> OwnerIds {
        OwnerIds {
            domain_uuid: "d-1".into(),
            project_uuid: project.into(),
        }
    }

    #[tokio::test]
    async fn test_scrape_reports_every_resource() {
        let driver = driver();
        assert_eq!(driver.service_info().product_name, "nova");

        let scrape = driver.scrape(&EndpointConfig::default(), &owner("p-1")).await.unwrap();
        assert_eq!(scrape.resources["cores"].quota, 10);
        assert_eq!(scrape.resources["cores"].usage, 4);
        assert_eq!(scrape.resources["ram"].quota, 0);
        assert_eq!(scrape.resources.len(), 3);
    }

    #[tokio::test]
    async fn test_set_quota_is_visible_on_next_scrape() {
        let driver = driver();
        let endpoint = EndpointConfig::default();
        driver
            .set_quota(&endpoint, &owner("p-2"), &BTreeMap::from([("ram".to_string(), 2048)]))
            .await
            .unwrap();

        let scrape = driver.scrape(&endpoint, &owner("p-2")).await.unwrap();
        assert_eq!(scrape.resources["ram"].quota, 2048);
    }

    #[tokio::test]
    async fn test_set_quota_rejects_externally_managed() {
        let driver = driver();
        let quotas = BTreeMap::from([("instances_external".to_string(), 5)]);
        assert_matches!(
            driver.set_quota(&EndpointConfig::default(), &owner("p-1"), &quotas).await,
            Err(Error::Driver { .. })
        );
    }

    #[tokio::test]
    async fn test_rate_counters_round_trip_through_state() {
        let driver = driver();
        let endpoint = EndpointConfig::default();

        let first = driver
            .scrape_rates(&endpoint, &owner("p-1"), &OpaqueBlob::empty())
            .await
            .unwrap();
        assert_eq!(first.usage["api_calls"], 7);

        let second = driver
            .scrape_rates(&endpoint, &owner("p-1"), &first.state)
            .await
            .unwrap();
        assert_eq!(second.usage["api_calls"], 14);

        let big = OpaqueBlob::from_json(&json!({
            "counters": {"api_calls": "340282366920938463463374607431768211000"}
        }))
        .unwrap();
        let third = driver.scrape_rates(&endpoint, &owner("p-1"), &big).await.unwrap();
        assert_eq!(third.usage["api_calls"], 340282366920938463463374607431768211007);
    }

    #[tokio::test]
    async fn test_usage_metrics() {
        let driver = driver();
        let scrape = driver.scrape(&EndpointConfig::default(), &owner("p-1")).await.unwrap();
        let samples = driver
            .collect_metrics("west", &owner("p-1"), &scrape.serialized_metrics)
            .unwrap();
        let cores = samples
            .iter()
            .find(|s| s.labels["resource"] == "cores")
            .unwrap();
        assert_eq!(cores.value, 4.0);
        assert_eq!(cores.labels["project_id"], "p-1");
    }
}
