//! Test doubles for drivers and audit sinks

use crate::audit::AuditEvent;
use crate::config::{
    AuditConfiguration, CapacitorConfiguration, ClusterConfiguration, DiscoveryConfiguration,
    ScrapeConfiguration, ServiceConfiguration,
};
use crate::domain::model::{AzCapacity, OpaqueBlob};
use crate::domain::ports::*;
use crate::domain::units::Unit;
use crate::drivers::{ClusterDrivers, DriverFactory};
use crate::error::{Error, Result};
use crate::metrics::EngineMetrics;
use crate::reconciler::Reconciler;
use crate::store::HierarchyStore;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};

// =============================================================================
// Audit Sinks
// =============================================================================

/// Keeps every published event, or fails every publish
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<AuditEvent>>,
    fail: bool,
}

impl RecordingSink {
    pub fn failing() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl AuditSink for RecordingSink {
    async fn publish(&self, event: &AuditEvent) -> Result<()> {
        if self.fail {
            return Err(Error::AuditPublish("sink rejected event".into()));
        }
        self.events.lock().push(event.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

/// Blocks every publish until opened
pub struct GatedSink {
    gate: Semaphore,
    started: Notify,
    published: AtomicUsize,
}

impl GatedSink {
    pub fn new() -> Self {
        Self {
            gate: Semaphore::new(0),
            started: Notify::new(),
            published: AtomicUsize::new(0),
        }
    }

    pub async fn wait_until_publishing(&self) {
        self.started.notified().await;
    }

    /// Let all current and future publishes through
    pub fn open(&self) {
        self.gate.close();
    }

    pub fn published(&self) -> usize {
        self.published.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuditSink for GatedSink {
    async fn publish(&self, _event: &AuditEvent) -> Result<()> {
        self.started.notify_one();
        // a closed semaphore means the gate is open
        let _ = self.gate.acquire().await;
        self.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        "gated"
    }
}

// =============================================================================
// Quota Driver
// =============================================================================

/// Controllable quota backend
///
/// Default resources: `capacity` (B), `capacity_portion` (usage only),
/// `things` and `external_things` (externally managed).
pub struct FakeQuotaDriver {
    service_type: String,
    resources: Vec<ResourceInfo>,
    /// project UUID → resource → backend data
    data: Mutex<BTreeMap<String, BTreeMap<String, ResourceData>>>,
    pub fail_scrape: AtomicBool,
    pub fail_set_quota: AtomicBool,
    omitted: Mutex<Vec<String>>,
    set_quota_calls: Mutex<Vec<(String, BTreeMap<String, u64>)>>,
}

impl FakeQuotaDriver {
    pub fn new(service_type: &str) -> Self {
        let mut capacity_portion = ResourceInfo::new("capacity_portion", Unit::Bytes);
        capacity_portion.no_quota = true;
        let mut external_things = ResourceInfo::new("external_things", Unit::None);
        external_things.externally_managed = true;

        Self::with_resources(
            service_type,
            vec![
                ResourceInfo::new("capacity", Unit::Bytes),
                capacity_portion,
                ResourceInfo::new("things", Unit::None),
                external_things,
            ],
        )
    }

    pub fn with_resources(service_type: &str, resources: Vec<ResourceInfo>) -> Self {
        Self {
            service_type: service_type.to_string(),
            resources,
            data: Mutex::new(BTreeMap::new()),
            fail_scrape: AtomicBool::new(false),
            fail_set_quota: AtomicBool::new(false),
            omitted: Mutex::new(Vec::new()),
            set_quota_calls: Mutex::new(Vec::new()),
        }
    }

    /// Set what the backend reports for one project resource
    pub fn set_backend(&self, project_uuid: &str, resource: &str, quota: i64, usage: u64) {
        self.data
            .lock()
            .entry(project_uuid.to_string())
            .or_default()
            .insert(
                resource.to_string(),
                ResourceData {
                    quota,
                    usage,
                    ..Default::default()
                },
            );
    }

    /// Leave a resource out of every following scrape
    pub fn omit_resource(&self, resource: &str) {
        self.omitted.lock().push(resource.to_string());
    }

    pub fn set_quota_calls(&self) -> Vec<(String, BTreeMap<String, u64>)> {
        self.set_quota_calls.lock().clone()
    }
}

#[async_trait]
impl QuotaDriver for FakeQuotaDriver {
    async fn init(&self, _endpoint: &EndpointConfig) -> Result<()> {
        Ok(())
    }

    fn service_info(&self) -> ServiceInfo {
        ServiceInfo {
            service_type: self.service_type.clone(),
            product_name: format!("fake-{}", self.service_type),
            area: "testing".into(),
        }
    }

    fn resources(&self) -> Vec<ResourceInfo> {
        self.resources.clone()
    }

    fn rates(&self) -> Vec<RateInfo> {
        vec![RateInfo {
            name: "requests".into(),
            unit: Unit::None,
        }]
    }

    async fn scrape(&self, _endpoint: &EndpointConfig, owner: &OwnerIds) -> Result<ProjectScrape> {
        if self.fail_scrape.load(Ordering::SeqCst) {
            return Err(Error::driver("fake", "scrape", "backend unreachable"));
        }
        let data = self.data.lock();
        let project = data.get(&owner.project_uuid);
        let omitted = self.omitted.lock();
        let resources = self
            .resources
            .iter()
            .filter(|info| !omitted.contains(&info.name))
            .map(|info| {
                let value = project
                    .and_then(|p| p.get(&info.name))
                    .cloned()
                    .unwrap_or_default();
                (info.name.clone(), value)
            })
            .collect();
        Ok(ProjectScrape {
            resources,
            serialized_metrics: OpaqueBlob::empty(),
        })
    }

    async fn scrape_rates(
        &self,
        _endpoint: &EndpointConfig,
        _owner: &OwnerIds,
        previous_state: &OpaqueBlob,
    ) -> Result<RateScrape> {
        if self.fail_scrape.load(Ordering::SeqCst) {
            return Err(Error::driver("fake", "scrape_rates", "backend unreachable"));
        }
        let previous: u128 = if previous_state.is_empty() {
            0
        } else {
            previous_state.parse_json::<String>()?.parse().unwrap_or(0)
        };
        let current = previous + u128::from(u64::MAX);
        Ok(RateScrape {
            usage: BTreeMap::from([("requests".to_string(), current)]),
            state: OpaqueBlob::from_json(&current.to_string())?,
        })
    }

    async fn set_quota(
        &self,
        _endpoint: &EndpointConfig,
        owner: &OwnerIds,
        quotas: &BTreeMap<String, u64>,
    ) -> Result<()> {
        self.set_quota_calls
            .lock()
            .push((owner.project_uuid.clone(), quotas.clone()));
        if self.fail_set_quota.load(Ordering::SeqCst) {
            return Err(Error::driver("fake", "set_quota", "backend refused quota"));
        }
        let mut data = self.data.lock();
        let project = data.entry(owner.project_uuid.clone()).or_default();
        for (name, quota) in quotas {
            project.entry(name.clone()).or_default().quota = *quota as i64;
        }
        Ok(())
    }
}

// =============================================================================
// Capacity Driver
// =============================================================================

/// Controllable capacity source
pub struct FakeCapacityDriver {
    id: String,
    report: Mutex<CapacityReport>,
    pub fail: AtomicBool,
}

impl FakeCapacityDriver {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            report: Mutex::new(CapacityReport::new()),
            fail: AtomicBool::new(false),
        }
    }

    /// Report `capacity` for a resource, optionally split over AZs
    pub fn report(
        &self,
        service_type: &str,
        resource: &str,
        capacity: u64,
        per_az: &[(&str, u64, u64)],
    ) {
        let capacity_per_az = (!per_az.is_empty()).then(|| {
            per_az
                .iter()
                .map(|(az, capacity, usage)| {
                    (
                        az.to_string(),
                        AzCapacity {
                            capacity: *capacity,
                            usage: *usage,
                        },
                    )
                })
                .collect()
        });
        self.report
            .lock()
            .entry(service_type.to_string())
            .or_default()
            .insert(
                resource.to_string(),
                CapacityData {
                    capacity,
                    capacity_per_az,
                    subcapacities: vec![serde_json::json!({"source": self.id})],
                },
            );
    }

    pub fn clear(&self) {
        self.report.lock().clear();
    }
}

#[async_trait]
impl CapacityDriver for FakeCapacityDriver {
    async fn init(&self, _endpoint: &EndpointConfig) -> Result<()> {
        Ok(())
    }

    fn id(&self) -> &str {
        &self.id
    }

    async fn scrape(&self, _endpoint: &EndpointConfig) -> Result<CapacityScrape> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::driver(&self.id, "scrape", "pool scanner timed out"));
        }
        Ok(CapacityScrape {
            capacities: self.report.lock().clone(),
            serialized_metrics: OpaqueBlob::new(self.id.clone()),
        })
    }
}

// =============================================================================
// Cluster Fixture
// =============================================================================

/// Cluster wired to test doubles
pub struct TestCluster {
    id: String,
    config: ClusterConfiguration,
    factory: DriverFactory,
}

impl TestCluster {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            config: ClusterConfiguration {
                services: Vec::new(),
                capacitors: Vec::new(),
                audit: AuditConfiguration::default(),
                scrape: ScrapeConfiguration::default(),
                discovery: DiscoveryConfiguration::default(),
            },
            factory: DriverFactory::new(),
        }
    }

    pub fn service(mut self, service_type: &str, driver: Arc<FakeQuotaDriver>, shared: bool) -> Self {
        let driver_id = format!("fake-{}", service_type);
        self.factory
            .register_quota(&driver_id, move |_, _| Ok(driver.clone() as QuotaDriverRef));
        self.config.services.push(ServiceConfiguration {
            service_type: service_type.to_string(),
            shared,
            driver: driver_id,
            endpoint: EndpointConfig::default(),
        });
        self
    }

    pub fn capacitor(mut self, driver: Arc<FakeCapacityDriver>) -> Self {
        let driver_id = format!("fake-{}", driver.id());
        let capacitor_id = driver.id().to_string();
        self.factory
            .register_capacity(&driver_id, move |_, _| Ok(driver.clone() as CapacityDriverRef));
        self.config.capacitors.push(CapacitorConfiguration {
            id: capacitor_id,
            driver: driver_id,
            endpoint: EndpointConfig::default(),
        });
        self
    }

    pub fn config(&self) -> &ClusterConfiguration {
        &self.config
    }

    pub fn drivers(&self) -> ClusterDrivers {
        ClusterDrivers::from_config(&self.id, &self.config, &self.factory)
            .expect("test drivers are registered")
    }

    pub fn reconciler(&self, store: Arc<HierarchyStore>) -> Reconciler {
        Reconciler::new(
            store,
            self.drivers(),
            Arc::new(EngineMetrics::new().expect("metrics registry")),
            self.config.scrape.clone(),
        )
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Caller holding the given rules
pub fn token_with(rules: &[&str]) -> Token {
    Token {
        user_id: "u-1".into(),
        user_name: "operator".into(),
        user_domain_id: "default".into(),
        user_domain_name: "Default".into(),
        project_id: None,
        granted_rules: Default::default(),
    }
    .with_rules(rules.iter().copied())
}

pub fn request(path: &str) -> RequestContext {
    RequestContext {
        remote_addr: "10.0.0.1:40000".into(),
        user_agent: "test-client".into(),
        request_path: path.into(),
    }
}
