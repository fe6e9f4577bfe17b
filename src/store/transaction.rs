//! Store transactions
//!
//! A transaction holds the store lock for its whole lifetime and works on a
//! private copy of all tables. `commit` publishes the copy; dropping an
//! uncommitted transaction discards it, on every exit path.

use crate::domain::model::*;
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};

// =============================================================================
// Tables
// =============================================================================

#[derive(Debug, Clone, Default)]
pub(crate) struct Tables {
    next_id: RowId,
    cluster_capacitors: BTreeMap<(String, String), ClusterCapacitor>,
    cluster_services: BTreeMap<RowId, ClusterService>,
    cluster_resources: BTreeMap<(RowId, String), ClusterResource>,
    domains: BTreeMap<RowId, Domain>,
    domain_services: BTreeMap<RowId, DomainService>,
    domain_resources: BTreeMap<(RowId, String), DomainResource>,
    projects: BTreeMap<RowId, Project>,
    project_services: BTreeMap<RowId, ProjectService>,
    project_resources: BTreeMap<(RowId, String), ProjectResource>,
    project_rates: BTreeMap<(RowId, String), ProjectRate>,
}

fn duplicate(table: &str, detail: String) -> Error {
    Error::ConstraintViolation {
        table: table.to_string(),
        detail,
    }
}

// =============================================================================
// Transaction
// =============================================================================

/// Scoped transaction on the hierarchy store
pub struct Transaction {
    guard: OwnedMutexGuard<Tables>,
    working: Tables,
    available: Arc<AtomicBool>,
    finished: bool,
}

impl Transaction {
    pub(crate) fn new(guard: OwnedMutexGuard<Tables>, available: Arc<AtomicBool>) -> Self {
        let working = guard.clone();
        Self {
            guard,
            working,
            available,
            finished: false,
        }
    }

    /// Publish all changes made in this transaction
    pub fn commit(mut self) -> Result<()> {
        if !self.available.load(Ordering::Acquire) {
            return Err(Error::StorageUnavailable(
                "connection lost before commit".into(),
            ));
        }
        *self.guard = std::mem::take(&mut self.working);
        self.finished = true;
        Ok(())
    }

    /// Discard all changes made in this transaction
    pub fn rollback(mut self) {
        self.finished = true;
        debug!("Transaction rolled back");
    }

    fn next_id(&mut self) -> RowId {
        self.working.next_id += 1;
        self.working.next_id
    }

    // =========================================================================
    // Cluster Capacitors
    // =========================================================================

    pub fn cluster_capacitor(&self, cluster_id: &str, capacitor_id: &str) -> Option<ClusterCapacitor> {
        self.working
            .cluster_capacitors
            .get(&(cluster_id.to_string(), capacitor_id.to_string()))
            .cloned()
    }

    pub fn cluster_capacitors(&self, cluster_id: &str) -> Vec<ClusterCapacitor> {
        self.working
            .cluster_capacitors
            .values()
            .filter(|c| c.cluster_id == cluster_id)
            .cloned()
            .collect()
    }

    pub fn save_cluster_capacitor(&mut self, capacitor: ClusterCapacitor) {
        let key = (capacitor.cluster_id.clone(), capacitor.capacitor_id.clone());
        self.working.cluster_capacitors.insert(key, capacitor);
    }

    // =========================================================================
    // Cluster Services & Resources
    // =========================================================================

    pub fn cluster_service(&self, owner_id: &str, service_type: &str) -> Option<ClusterService> {
        self.working
            .cluster_services
            .values()
            .find(|s| s.cluster_id == owner_id && s.service_type == service_type)
            .cloned()
    }

    pub fn cluster_services(&self, owner_id: &str) -> Vec<ClusterService> {
        self.working
            .cluster_services
            .values()
            .filter(|s| s.cluster_id == owner_id)
            .cloned()
            .collect()
    }

    pub fn insert_cluster_service(&mut self, owner_id: &str, service_type: &str) -> Result<ClusterService> {
        if self.cluster_service(owner_id, service_type).is_some() {
            return Err(duplicate(
                "cluster_services",
                format!("{}/{} exists", owner_id, service_type),
            ));
        }
        let service = ClusterService {
            id: self.next_id(),
            cluster_id: owner_id.to_string(),
            service_type: service_type.to_string(),
            scraped_at: None,
            stale: false,
        };
        self.working.cluster_services.insert(service.id, service.clone());
        Ok(service)
    }

    pub fn update_cluster_service(&mut self, service: &ClusterService) -> Result<()> {
        match self.working.cluster_services.get_mut(&service.id) {
            Some(row) => {
                *row = service.clone();
                Ok(())
            }
            None => Err(Error::not_found("cluster_service", service.id.to_string())),
        }
    }

    pub fn cluster_resource(&self, service_id: RowId, name: &str) -> Option<ClusterResource> {
        self.working
            .cluster_resources
            .get(&(service_id, name.to_string()))
            .cloned()
    }

    pub fn cluster_resources(&self, service_id: RowId) -> Vec<ClusterResource> {
        self.working
            .cluster_resources
            .values()
            .filter(|r| r.service_id == service_id)
            .cloned()
            .collect()
    }

    pub fn save_cluster_resource(&mut self, resource: ClusterResource) {
        let key = (resource.service_id, resource.name.clone());
        self.working.cluster_resources.insert(key, resource);
    }

    pub fn delete_cluster_resource(&mut self, service_id: RowId, name: &str) -> bool {
        self.working
            .cluster_resources
            .remove(&(service_id, name.to_string()))
            .is_some()
    }

    // =========================================================================
    // Domains
    // =========================================================================

    pub fn domain(&self, id: RowId) -> Option<Domain> {
        self.working.domains.get(&id).cloned()
    }

    pub fn domain_by_uuid(&self, cluster_id: &str, uuid: &str) -> Option<Domain> {
        self.working
            .domains
            .values()
            .find(|d| d.cluster_id == cluster_id && d.uuid == uuid)
            .cloned()
    }

    pub fn domains(&self, cluster_id: &str) -> Vec<Domain> {
        self.working
            .domains
            .values()
            .filter(|d| d.cluster_id == cluster_id)
            .cloned()
            .collect()
    }

    pub fn insert_domain(&mut self, cluster_id: &str, uuid: &str, name: &str) -> Result<Domain> {
        if self.domain_by_uuid(cluster_id, uuid).is_some() {
            return Err(duplicate("domains", format!("{} exists in {}", uuid, cluster_id)));
        }
        let domain = Domain {
            id: self.next_id(),
            cluster_id: cluster_id.to_string(),
            name: name.to_string(),
            uuid: uuid.to_string(),
        };
        self.working.domains.insert(domain.id, domain.clone());
        Ok(domain)
    }

    pub fn domain_service(&self, domain_id: RowId, service_type: &str) -> Option<DomainService> {
        self.working
            .domain_services
            .values()
            .find(|s| s.domain_id == domain_id && s.service_type == service_type)
            .cloned()
    }

    pub fn domain_services(&self, domain_id: RowId) -> Vec<DomainService> {
        self.working
            .domain_services
            .values()
            .filter(|s| s.domain_id == domain_id)
            .cloned()
            .collect()
    }

    pub fn insert_domain_service(&mut self, domain_id: RowId, service_type: &str) -> Result<DomainService> {
        if self.domain_service(domain_id, service_type).is_some() {
            return Err(duplicate(
                "domain_services",
                format!("{}/{} exists", domain_id, service_type),
            ));
        }
        let service = DomainService {
            id: self.next_id(),
            domain_id,
            service_type: service_type.to_string(),
        };
        self.working.domain_services.insert(service.id, service.clone());
        Ok(service)
    }

    pub fn domain_resource(&self, service_id: RowId, name: &str) -> Option<DomainResource> {
        self.working
            .domain_resources
            .get(&(service_id, name.to_string()))
            .cloned()
    }

    pub fn domain_resources(&self, service_id: RowId) -> Vec<DomainResource> {
        self.working
            .domain_resources
            .values()
            .filter(|r| r.service_id == service_id)
            .cloned()
            .collect()
    }

    pub fn save_domain_resource(&mut self, resource: DomainResource) {
        let key = (resource.service_id, resource.name.clone());
        self.working.domain_resources.insert(key, resource);
    }

    // =========================================================================
    // Projects
    // =========================================================================

    pub fn project(&self, id: RowId) -> Option<Project> {
        self.working.projects.get(&id).cloned()
    }

    pub fn project_by_uuid(&self, domain_id: RowId, uuid: &str) -> Option<Project> {
        self.working
            .projects
            .values()
            .find(|p| p.domain_id == domain_id && p.uuid == uuid)
            .cloned()
    }

    pub fn projects(&self, domain_id: RowId) -> Vec<Project> {
        self.working
            .projects
            .values()
            .filter(|p| p.domain_id == domain_id)
            .cloned()
            .collect()
    }

    pub fn insert_project(
        &mut self,
        domain_id: RowId,
        uuid: &str,
        name: &str,
        parent_uuid: Option<&str>,
    ) -> Result<Project> {
        if self.project_by_uuid(domain_id, uuid).is_some() {
            return Err(duplicate("projects", format!("{} exists in {}", uuid, domain_id)));
        }
        let project = Project {
            id: self.next_id(),
            domain_id,
            name: name.to_string(),
            uuid: uuid.to_string(),
            parent_uuid: parent_uuid.map(str::to_string),
        };
        self.working.projects.insert(project.id, project.clone());
        Ok(project)
    }

    pub fn project_service(&self, project_id: RowId, service_type: &str) -> Option<ProjectService> {
        self.working
            .project_services
            .values()
            .find(|s| s.project_id == project_id && s.service_type == service_type)
            .cloned()
    }

    pub fn project_services(&self, project_id: RowId) -> Vec<ProjectService> {
        self.working
            .project_services
            .values()
            .filter(|s| s.project_id == project_id)
            .cloned()
            .collect()
    }

    /// Project services of every project in the cluster
    pub fn project_services_in_cluster(&self, cluster_id: &str) -> Vec<ProjectService> {
        self.working
            .project_services
            .values()
            .filter(|s| {
                self.working
                    .projects
                    .get(&s.project_id)
                    .and_then(|p| self.working.domains.get(&p.domain_id))
                    .is_some_and(|d| d.cluster_id == cluster_id)
            })
            .cloned()
            .collect()
    }

    pub fn insert_project_service(&mut self, project_id: RowId, service_type: &str) -> Result<ProjectService> {
        if self.project_service(project_id, service_type).is_some() {
            return Err(duplicate(
                "project_services",
                format!("{}/{} exists", project_id, service_type),
            ));
        }
        let service = ProjectService {
            id: self.next_id(),
            project_id,
            service_type: service_type.to_string(),
            scraped_at: None,
            stale: false,
            scrape_duration_secs: 0.0,
            rates_scraped_at: None,
            rates_stale: false,
            rates_scrape_duration_secs: 0.0,
            rates_scrape_state: OpaqueBlob::empty(),
            serialized_metrics: OpaqueBlob::empty(),
        };
        self.working.project_services.insert(service.id, service.clone());
        Ok(service)
    }

    pub fn update_project_service(&mut self, service: &ProjectService) -> Result<()> {
        match self.working.project_services.get_mut(&service.id) {
            Some(row) => {
                *row = service.clone();
                Ok(())
            }
            None => Err(Error::not_found("project_service", service.id.to_string())),
        }
    }

    pub fn project_resource(&self, service_id: RowId, name: &str) -> Option<ProjectResource> {
        self.working
            .project_resources
            .get(&(service_id, name.to_string()))
            .cloned()
    }

    pub fn project_resources(&self, service_id: RowId) -> Vec<ProjectResource> {
        self.working
            .project_resources
            .values()
            .filter(|r| r.service_id == service_id)
            .cloned()
            .collect()
    }

    pub fn save_project_resource(&mut self, resource: ProjectResource) {
        let key = (resource.service_id, resource.name.clone());
        self.working.project_resources.insert(key, resource);
    }

    pub fn project_rates(&self, service_id: RowId) -> Vec<ProjectRate> {
        self.working
            .project_rates
            .values()
            .filter(|r| r.service_id == service_id)
            .cloned()
            .collect()
    }

    pub fn save_project_rate(&mut self, rate: ProjectRate) {
        let key = (rate.service_id, rate.name.clone());
        self.working.project_rates.insert(key, rate);
    }

    // =========================================================================
    // Aggregates
    // =========================================================================

    /// Project resources of one service type and resource across a domain
    pub fn project_resources_in_domain(
        &self,
        domain_id: RowId,
        service_type: &str,
        resource_name: &str,
    ) -> Vec<ProjectResource> {
        self.projects(domain_id)
            .iter()
            .filter_map(|p| self.project_service(p.id, service_type))
            .filter_map(|s| self.project_resource(s.id, resource_name))
            .collect()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            info!("Implicit rollback done");
        }
    }
}
