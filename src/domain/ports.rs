//! Domain Ports - Capability traits at the engine boundary
//!
//! Backend drivers, the audit sink and the discovery source are plugins
//! behind these traits. The engine only ever talks to them through the
//! types defined here.

use crate::audit::AuditEvent;
use crate::domain::model::{AzCapacity, OpaqueBlob};
use crate::domain::units::Unit;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

// =============================================================================
// Endpoint Configuration
// =============================================================================

/// Static per-cluster, per-driver endpoint record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Base URL of the backend API, if the driver talks to one
    #[serde(default)]
    pub url: Option<String>,
    /// Backend region
    #[serde(default)]
    pub region: Option<String>,
    /// Driver-specific parameters
    #[serde(default)]
    pub params: serde_json::Value,
}

// =============================================================================
// Metric Samples
// =============================================================================

/// One gauge sample produced by a driver from its serialized metrics
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub name: String,
    pub help: String,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}

impl MetricSample {
    pub fn gauge(name: impl Into<String>, help: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            labels: BTreeMap::new(),
            value,
        }
    }

    pub fn with_label(mut self, key: &str, value: impl Into<String>) -> Self {
        self.labels.insert(key.to_string(), value.into());
        self
    }
}

// =============================================================================
// Capacity Driver Port
// =============================================================================

/// Capacity of one resource as reported by a capacity driver
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapacityData {
    pub capacity: u64,
    pub capacity_per_az: Option<BTreeMap<String, AzCapacity>>,
    pub subcapacities: Vec<serde_json::Value>,
}

/// service type → resource name → capacity
pub type CapacityReport = BTreeMap<String, BTreeMap<String, CapacityData>>;

/// Result of one capacity scrape
#[derive(Debug, Clone, Default)]
pub struct CapacityScrape {
    pub capacities: CapacityReport,
    pub serialized_metrics: OpaqueBlob,
}

/// Port for capacity sources
///
/// Scrapes are read-only. Data that cannot be placed in an availability zone
/// goes into [`crate::domain::model::UNKNOWN_AZ`] instead of being dropped.
#[async_trait]
pub trait CapacityDriver: Send + Sync {
    /// Validate configuration and connectivity
    async fn init(&self, endpoint: &EndpointConfig) -> Result<()>;

    /// Driver identifier
    fn id(&self) -> &str;

    /// Report capacity for the resources this driver knows about
    async fn scrape(&self, endpoint: &EndpointConfig) -> Result<CapacityScrape>;

    /// Turn serialized metrics from a previous scrape into samples
    fn collect_metrics(&self, _cluster_id: &str, _metrics: &OpaqueBlob) -> Result<Vec<MetricSample>> {
        Ok(Vec::new())
    }
}

// =============================================================================
// Quota Driver Port
// =============================================================================

/// Identity of a backend service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    #[serde(rename = "type")]
    pub service_type: String,
    pub product_name: String,
    pub area: String,
}

/// Descriptor of one resource of a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub name: String,
    #[serde(default)]
    pub unit: Unit,
    /// Resource tracks usage only
    #[serde(default)]
    pub no_quota: bool,
    /// Quota granted without approval on first scrape, if the backend has it
    #[serde(default)]
    pub auto_approve_initial_quota: u64,
    /// Quota is authoritative in the backend and never pushed from here
    #[serde(default)]
    pub externally_managed: bool,
    #[serde(default)]
    pub category: Option<String>,
}

impl ResourceInfo {
    pub fn new(name: impl Into<String>, unit: Unit) -> Self {
        Self {
            name: name.into(),
            unit,
            no_quota: false,
            auto_approve_initial_quota: 0,
            externally_managed: false,
            category: None,
        }
    }

    pub fn tracks_quota(&self) -> bool {
        !self.no_quota
    }
}

/// Descriptor of one rate of a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateInfo {
    pub name: String,
    #[serde(default)]
    pub unit: Unit,
}

/// Quota and usage of one resource as seen by the backend
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceData {
    /// Negative values mean "unlimited"
    pub quota: i64,
    pub usage: u64,
    pub physical_usage: Option<u64>,
    pub subresources: Vec<serde_json::Value>,
}

/// Result of one project scrape
#[derive(Debug, Clone, Default)]
pub struct ProjectScrape {
    pub resources: BTreeMap<String, ResourceData>,
    pub serialized_metrics: OpaqueBlob,
}

/// Result of one rate scrape
#[derive(Debug, Clone, Default)]
pub struct RateScrape {
    /// rate name → cumulative counter
    pub usage: BTreeMap<String, u128>,
    /// State handed back on the next rate scrape
    pub state: OpaqueBlob,
}

/// Backend identifiers of the project being scraped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerIds {
    pub domain_uuid: String,
    pub project_uuid: String,
}

/// Port for per-service quota backends
#[async_trait]
pub trait QuotaDriver: Send + Sync {
    /// Validate configuration and connectivity
    async fn init(&self, endpoint: &EndpointConfig) -> Result<()>;

    fn service_info(&self) -> ServiceInfo;

    /// Resources of this service, in display order
    fn resources(&self) -> Vec<ResourceInfo>;

    fn rates(&self) -> Vec<RateInfo> {
        Vec::new()
    }

    /// Read current quota and usage of one project
    async fn scrape(&self, endpoint: &EndpointConfig, owner: &OwnerIds) -> Result<ProjectScrape>;

    /// Read cumulative rate counters; `previous_state` is the state returned
    /// by the previous call for this project (empty on the first call)
    async fn scrape_rates(
        &self,
        _endpoint: &EndpointConfig,
        _owner: &OwnerIds,
        previous_state: &OpaqueBlob,
    ) -> Result<RateScrape> {
        Ok(RateScrape {
            usage: BTreeMap::new(),
            state: previous_state.clone(),
        })
    }

    /// Write quotas into the backend
    async fn set_quota(
        &self,
        endpoint: &EndpointConfig,
        owner: &OwnerIds,
        quotas: &BTreeMap<String, u64>,
    ) -> Result<()>;

    /// Turn serialized metrics from a previous scrape into samples
    fn collect_metrics(
        &self,
        _cluster_id: &str,
        _owner: &OwnerIds,
        _metrics: &OpaqueBlob,
    ) -> Result<Vec<MetricSample>> {
        Ok(Vec::new())
    }
}

// =============================================================================
// Audit Sink Port
// =============================================================================

/// Port for the external message sink receiving audit events
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Publish one event durably; an error means the event was not accepted
    async fn publish(&self, event: &AuditEvent) -> Result<()>;

    fn name(&self) -> &str;
}

// =============================================================================
// Discovery Port
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDomain {
    pub uuid: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredProject {
    pub uuid: String,
    pub name: String,
    #[serde(default)]
    pub parent_uuid: Option<String>,
}

/// Port for the identity backend listing domains and projects
#[async_trait]
pub trait DomainDiscoverer: Send + Sync {
    async fn list_domains(&self) -> Result<Vec<DiscoveredDomain>>;

    async fn list_projects(&self, domain: &DiscoveredDomain) -> Result<Vec<DiscoveredProject>>;
}

// =============================================================================
// Caller Identity
// =============================================================================

/// Identity of an API caller plus the rules it was granted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Token {
    pub user_id: String,
    pub user_name: String,
    pub user_domain_id: String,
    pub user_domain_name: String,
    pub project_id: Option<String>,
    pub granted_rules: BTreeSet<String>,
}

impl Token {
    /// Check whether the caller holds `rule` (e.g. `domain:raise`)
    pub fn check(&self, rule: &str) -> bool {
        self.granted_rules.contains(rule)
    }

    pub fn with_rules<'a>(mut self, rules: impl IntoIterator<Item = &'a str>) -> Self {
        self.granted_rules
            .extend(rules.into_iter().map(str::to_string));
        self
    }
}

/// Origin of an API request, as recorded in audit events
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Remote address, possibly with port
    pub remote_addr: String,
    pub user_agent: String,
    pub request_path: String,
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type CapacityDriverRef = Arc<dyn CapacityDriver>;
pub type QuotaDriverRef = Arc<dyn QuotaDriver>;
pub type AuditSinkRef = Arc<dyn AuditSink>;
pub type DomainDiscovererRef = Arc<dyn DomainDiscoverer>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_check() {
        let token = Token::default().with_rules(["domain:raise", "project:lower"]);
        assert!(token.check("domain:raise"));
        assert!(!token.check("domain:lower"));
    }

    #[test]
    fn test_resource_info_deserialization() {
        let info: ResourceInfo =
            serde_json::from_str(r#"{"name": "capacity", "unit": "GiB"}"#).unwrap();
        assert_eq!(info.unit, Unit::Gibibytes);
        assert!(info.tracks_quota());
        assert!(!info.externally_managed);
    }
}
