//! Engine configuration
//!
//! Loaded once at startup from a YAML file.

use crate::domain::model::Cluster;
use crate::domain::ports::{DiscoveredProject, EndpointConfig};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    pub database: DatabaseConfiguration,
    pub clusters: BTreeMap<String, ClusterConfiguration>,
    /// Permission rule → roles granted that rule
    #[serde(default)]
    pub policy: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfiguration {
    /// Schema version the engine waits for before starting
    pub expected_schema_version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfiguration {
    pub services: Vec<ServiceConfiguration>,
    #[serde(default)]
    pub capacitors: Vec<CapacitorConfiguration>,
    #[serde(default)]
    pub audit: AuditConfiguration,
    #[serde(default)]
    pub scrape: ScrapeConfiguration,
    #[serde(default)]
    pub discovery: DiscoveryConfiguration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfiguration {
    #[serde(rename = "type")]
    pub service_type: String,
    /// Capacity of this service is shared with other clusters
    #[serde(default)]
    pub shared: bool,
    /// Quota driver ID
    pub driver: String,
    #[serde(default)]
    pub endpoint: EndpointConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacitorConfiguration {
    pub id: String,
    /// Capacity driver ID
    pub driver: String,
    #[serde(default)]
    pub endpoint: EndpointConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditConfiguration {
    #[serde(default)]
    pub enabled: bool,
    /// Suppress the local log record of each event
    #[serde(default)]
    pub silent: bool,
    #[serde(default)]
    pub sink: Option<AuditSinkConfiguration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditSinkConfiguration {
    pub url: String,
    #[serde(default = "default_queue_name")]
    pub queue_name: String,
    #[serde(default = "default_sink_timeout")]
    pub timeout_secs: u64,
}

fn default_queue_name() -> String {
    "notifications.info".to_string()
}

fn default_sink_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeConfiguration {
    #[serde(default = "default_capacity_interval")]
    pub capacity_interval_secs: u64,
    #[serde(default = "default_project_interval")]
    pub project_interval_secs: u64,
    /// Services not scraped for this long are flagged stale
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
}

impl Default for ScrapeConfiguration {
    fn default() -> Self {
        Self {
            capacity_interval_secs: default_capacity_interval(),
            project_interval_secs: default_project_interval(),
            stale_after_secs: default_stale_after(),
        }
    }
}

fn default_capacity_interval() -> u64 { 900 }
fn default_project_interval() -> u64 { 1800 }
fn default_stale_after() -> u64 { 3600 }

/// Domains and projects known without an identity backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryConfiguration {
    #[serde(default)]
    pub domains: Vec<StaticDomainConfiguration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticDomainConfiguration {
    pub uuid: String,
    pub name: String,
    #[serde(default)]
    pub projects: Vec<DiscoveredProject>,
}

impl Configuration {
    /// Load and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Configuration = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.clusters.is_empty() {
            return Err(Error::Configuration("no clusters configured".into()));
        }

        for (cluster_id, cluster) in &self.clusters {
            let mut seen = BTreeSet::new();
            for service in &cluster.services {
                if !seen.insert(service.service_type.as_str()) {
                    return Err(Error::Configuration(format!(
                        "cluster {}: service type {} configured twice",
                        cluster_id, service.service_type
                    )));
                }
            }

            let mut seen = BTreeSet::new();
            for capacitor in &cluster.capacitors {
                if !seen.insert(capacitor.id.as_str()) {
                    return Err(Error::Configuration(format!(
                        "cluster {}: capacitor {} configured twice",
                        cluster_id, capacitor.id
                    )));
                }
            }

            let scrape = &cluster.scrape;
            if scrape.capacity_interval_secs == 0 || scrape.project_interval_secs == 0 {
                return Err(Error::Configuration(format!(
                    "cluster {}: scrape intervals must be positive",
                    cluster_id
                )));
            }

            if cluster.audit.enabled && cluster.audit.sink.is_none() {
                return Err(Error::Configuration(format!(
                    "cluster {}: audit trail enabled without a sink",
                    cluster_id
                )));
            }
        }

        Ok(())
    }
}

impl ClusterConfiguration {
    /// Build the cluster record described by this configuration
    pub fn to_cluster(&self, cluster_id: &str) -> Cluster {
        Cluster {
            id: cluster_id.to_string(),
            service_types: self
                .services
                .iter()
                .map(|s| s.service_type.clone())
                .collect(),
            shared_service_types: self
                .services
                .iter()
                .filter(|s| s.shared)
                .map(|s| s.service_type.clone())
                .collect(),
        }
    }
}
