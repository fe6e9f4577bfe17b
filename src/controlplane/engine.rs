//! Engine - per-cluster wiring of reconcilers, editors and discovery
//!
//! The engine owns one reconciler and one editor per configured cluster and
//! is the single entry point used by the REST API and the scheduler.

use crate::audit::AuditPipeline;
use crate::config::Configuration;
use crate::domain::ports::{DomainDiscovererRef, OwnerIds};
use crate::drivers::{ClusterDrivers, DriverFactory, StaticDiscoverer};
use crate::edits::{build_domain_report, DomainReport, QuotaEditor};
use crate::error::{Error, Result};
use crate::metrics::EngineMetrics;
use crate::reconciler::{DiscoverySummary, Reconciler};
use crate::store::HierarchyStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Cluster id accepted as an alias for the caller's current cluster
pub const CURRENT_CLUSTER: &str = "current";

// =============================================================================
// Cluster Runtime
// =============================================================================

/// Everything the engine runs for one cluster
pub struct ClusterRuntime {
    pub reconciler: Arc<Reconciler>,
    pub editor: QuotaEditor,
    discoverer: DomainDiscovererRef,
}

impl ClusterRuntime {
    pub fn id(&self) -> &str {
        self.reconciler.cluster_id()
    }
}

// =============================================================================
// Engine
// =============================================================================

pub struct Engine {
    store: Arc<HierarchyStore>,
    metrics: Arc<EngineMetrics>,
    clusters: BTreeMap<String, ClusterRuntime>,
    default_cluster: String,
}

impl Engine {
    /// Build drivers, reconcilers and editors for every configured cluster
    pub fn new(
        config: &Configuration,
        store: Arc<HierarchyStore>,
        metrics: Arc<EngineMetrics>,
        audit: Arc<AuditPipeline>,
        factory: &DriverFactory,
        default_cluster: Option<&str>,
    ) -> Result<Self> {
        let mut clusters = BTreeMap::new();
        for (cluster_id, cluster_config) in &config.clusters {
            let drivers = ClusterDrivers::from_config(cluster_id, cluster_config, factory)?;
            let reconciler = Arc::new(Reconciler::new(
                store.clone(),
                drivers,
                metrics.clone(),
                cluster_config.scrape.clone(),
            ));
            let editor = QuotaEditor::new(store.clone(), reconciler.clone(), audit.clone());
            let discoverer: DomainDiscovererRef =
                Arc::new(StaticDiscoverer::new(&cluster_config.discovery));

            clusters.insert(
                cluster_id.clone(),
                ClusterRuntime {
                    reconciler,
                    editor,
                    discoverer,
                },
            );
        }

        let default_cluster = match default_cluster {
            Some(id) if clusters.contains_key(id) => id.to_string(),
            Some(id) => {
                return Err(Error::Configuration(format!(
                    "default cluster {} is not configured",
                    id
                )))
            }
            None => clusters
                .keys()
                .next()
                .cloned()
                .ok_or_else(|| Error::Configuration("no clusters configured".into()))?,
        };

        Ok(Self {
            store,
            metrics,
            clusters,
            default_cluster,
        })
    }

    /// Replace the discoverer of one cluster
    pub fn set_discoverer(&mut self, cluster_id: &str, discoverer: DomainDiscovererRef) -> Result<()> {
        let cluster = self
            .clusters
            .get_mut(cluster_id)
            .ok_or_else(|| Error::not_found("cluster", cluster_id))?;
        cluster.discoverer = discoverer;
        Ok(())
    }

    /// Initialize drivers and bring the store in line with the configuration
    pub async fn init(&self) -> Result<()> {
        for (cluster_id, cluster) in &self.clusters {
            cluster.reconciler.drivers().init_all().await?;
            cluster.reconciler.check_consistency().await?;
            info!("Cluster {} initialized", cluster_id);
        }
        Ok(())
    }

    pub fn store(&self) -> &Arc<HierarchyStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    pub fn default_cluster(&self) -> &str {
        &self.default_cluster
    }

    pub fn clusters(&self) -> impl Iterator<Item = &ClusterRuntime> {
        self.clusters.values()
    }

    pub fn cluster(&self, cluster_id: &str) -> Result<&ClusterRuntime> {
        self.clusters
            .get(cluster_id)
            .ok_or_else(|| Error::not_found("cluster", cluster_id))
    }

    /// Resolve a cluster id from a request path, where `current` names the
    /// cluster the request was routed to
    pub fn resolve_cluster(&self, requested: &str, current: Option<&str>) -> Result<&ClusterRuntime> {
        if requested == CURRENT_CLUSTER {
            self.cluster(current.unwrap_or(&self.default_cluster))
        } else {
            self.cluster(requested)
        }
    }

    pub async fn domain_report(&self, cluster_id: &str, domain_uuid: &str) -> Result<DomainReport> {
        let cluster = self.cluster(cluster_id)?;
        let tx = self.store.begin().await?;
        let report = tx
            .domain_by_uuid(cluster_id, domain_uuid)
            .map(|domain| build_domain_report(&tx, cluster.reconciler.drivers(), &domain));
        tx.rollback();
        report.ok_or_else(|| Error::not_found("domain", domain_uuid))
    }

    /// Run discovery for one cluster
    pub async fn discover(&self, cluster_id: &str) -> Result<DiscoverySummary> {
        let cluster = self.cluster(cluster_id)?;
        cluster
            .reconciler
            .scan_domains(cluster.discoverer.as_ref())
            .await
    }

    /// Run discovery for every cluster; a failing cluster does not stop the others
    pub async fn discover_all(&self) -> usize {
        let mut discovered = 0;
        for cluster_id in self.clusters.keys() {
            match self.discover(cluster_id).await {
                Ok(summary) => discovered += summary.new_domains.len(),
                Err(e) => warn!("Discovery failed for cluster {}: {}", cluster_id, e),
            }
        }
        discovered
    }

    /// Export driver metrics of the latest scrapes into the registry
    pub async fn collect_metrics(&self) -> Result<()> {
        let mut samples = Vec::new();
        let tx = self.store.begin().await?;

        for (cluster_id, cluster) in &self.clusters {
            let drivers = cluster.reconciler.drivers();

            for row in tx.cluster_capacitors(cluster_id) {
                let Some(capacitor) = drivers.capacitors().iter().find(|c| c.id == row.capacitor_id) else {
                    continue;
                };
                match capacitor.driver.collect_metrics(cluster_id, &row.serialized_metrics) {
                    Ok(mut collected) => samples.append(&mut collected),
                    Err(e) => warn!("Failed to collect metrics of capacitor {}: {}", row.capacitor_id, e),
                }
            }

            for service in tx.project_services_in_cluster(cluster_id) {
                let Some(driver) = drivers.service(&service.service_type) else {
                    continue;
                };
                let Some(project) = tx.project(service.project_id) else {
                    continue;
                };
                let Some(domain) = tx.domain(project.domain_id) else {
                    continue;
                };
                let owner = OwnerIds {
                    domain_uuid: domain.uuid,
                    project_uuid: project.uuid,
                };
                match driver
                    .driver
                    .collect_metrics(cluster_id, &owner, &service.serialized_metrics)
                {
                    Ok(mut collected) => samples.append(&mut collected),
                    Err(e) => warn!(
                        "Failed to collect {} metrics of project {}: {}",
                        service.service_type, owner.project_uuid, e
                    ),
                }
            }
        }
        tx.rollback();

        self.metrics.export_samples(&samples)
    }
}
