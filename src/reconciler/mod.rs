//! Reconciliation Engine
//!
//! Pulls facts from the drivers of one cluster and merges them into the
//! hierarchy store:
//! - Capacity scrape and merge across capacitors
//! - Project quota/usage and rate scrapes
//! - Backend quota propagation
//! - Domain/project discovery and the consistency check
//! - Staleness marking
//!
//! Driver calls never happen while a store transaction is open.

mod capacity;
mod consistency;
mod discovery;
mod projects;
mod staleness;

pub use capacity::{merge_capacity, CapacityScanSummary};
pub use discovery::DiscoverySummary;
pub use projects::ProjectScanSummary;

use crate::config::ScrapeConfiguration;
use crate::domain::model::{Domain, Project, ProjectService, RowId};
use crate::domain::ports::OwnerIds;
use crate::drivers::ClusterDrivers;
use crate::error::{Error, Result};
use crate::metrics::EngineMetrics;
use crate::store::{HierarchyStore, Transaction};
use std::sync::Arc;

/// Reconciler for one cluster
pub struct Reconciler {
    store: Arc<HierarchyStore>,
    drivers: ClusterDrivers,
    metrics: Arc<EngineMetrics>,
    scrape: ScrapeConfiguration,
}

impl Reconciler {
    pub fn new(
        store: Arc<HierarchyStore>,
        drivers: ClusterDrivers,
        metrics: Arc<EngineMetrics>,
        scrape: ScrapeConfiguration,
    ) -> Self {
        Self {
            store,
            drivers,
            metrics,
            scrape,
        }
    }

    pub fn cluster_id(&self) -> &str {
        &self.drivers.cluster.id
    }

    pub fn drivers(&self) -> &ClusterDrivers {
        &self.drivers
    }

    pub fn scrape_config(&self) -> &ScrapeConfiguration {
        &self.scrape
    }
}

/// Project, its domain and one of its services, loaded together
pub(crate) struct ProjectContext {
    pub domain: Domain,
    pub project: Project,
    pub service: Option<ProjectService>,
}

impl ProjectContext {
    pub fn load(tx: &Transaction, project_id: RowId, service_type: &str) -> Result<Self> {
        let project = tx
            .project(project_id)
            .ok_or_else(|| Error::not_found("project", project_id.to_string()))?;
        let domain = tx
            .domain(project.domain_id)
            .ok_or_else(|| Error::not_found("domain", project.domain_id.to_string()))?;
        let service = tx.project_service(project.id, service_type);
        Ok(Self {
            domain,
            project,
            service,
        })
    }

    pub fn owner(&self) -> OwnerIds {
        OwnerIds {
            domain_uuid: self.domain.uuid.clone(),
            project_uuid: self.project.uuid.clone(),
        }
    }
}
