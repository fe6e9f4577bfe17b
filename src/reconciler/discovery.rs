//! Domain and project discovery
//!
//! Registers domains and projects reported by the identity backend. Known
//! identifiers are left alone, so repeated scans never duplicate rows or
//! touch existing quotas.

use super::Reconciler;
use crate::domain::model::{Domain, DomainResource, Project, ProjectResource};
use crate::domain::ports::{DiscoveredProject, DomainDiscoverer};
use crate::drivers::ClusterDrivers;
use crate::error::Result;
use crate::store::Transaction;
use tracing::info;

/// Identifiers registered by one discovery scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoverySummary {
    pub new_domains: Vec<String>,
    pub new_projects: Vec<String>,
}

/// Create missing services and resources of a domain
pub(crate) fn ensure_domain_services(tx: &mut Transaction, drivers: &ClusterDrivers, domain: &Domain) -> Result<()> {
    for (service_type, service) in drivers.services() {
        let row = match tx.domain_service(domain.id, service_type) {
            Some(row) => row,
            None => tx.insert_domain_service(domain.id, service_type)?,
        };
        for info in service.driver.resources() {
            if !info.tracks_quota() || tx.domain_resource(row.id, &info.name).is_some() {
                continue;
            }
            tx.save_domain_resource(DomainResource {
                service_id: row.id,
                name: info.name,
                quota: 0,
            });
        }
    }
    Ok(())
}

/// Create missing services and resources of a project
pub(crate) fn ensure_project_services(tx: &mut Transaction, drivers: &ClusterDrivers, project: &Project) -> Result<()> {
    for (service_type, service) in drivers.services() {
        let row = match tx.project_service(project.id, service_type) {
            Some(row) => row,
            None => tx.insert_project_service(project.id, service_type)?,
        };
        for info in service.driver.resources() {
            if tx.project_resource(row.id, &info.name).is_some() {
                continue;
            }
            tx.save_project_resource(ProjectResource::new(row.id, info.name.clone(), info.tracks_quota()));
        }
    }
    Ok(())
}

/// Register a project if its UUID is unknown in the domain
pub(crate) fn ensure_project(
    tx: &mut Transaction,
    drivers: &ClusterDrivers,
    domain: &Domain,
    discovered: &DiscoveredProject,
) -> Result<(Project, bool)> {
    if let Some(project) = tx.project_by_uuid(domain.id, &discovered.uuid) {
        return Ok((project, false));
    }
    let project = tx.insert_project(
        domain.id,
        &discovered.uuid,
        &discovered.name,
        discovered.parent_uuid.as_deref(),
    )?;
    ensure_project_services(tx, drivers, &project)?;
    Ok((project, true))
}

impl Reconciler {
    /// Register all domains and projects the discoverer knows about
    pub async fn scan_domains(&self, discoverer: &dyn DomainDiscoverer) -> Result<DiscoverySummary> {
        let cluster_id = self.cluster_id();

        let mut listing = Vec::new();
        for domain in discoverer.list_domains().await? {
            let projects = discoverer.list_projects(&domain).await?;
            listing.push((domain, projects));
        }

        let mut summary = DiscoverySummary::default();
        let mut tx = self.store.begin().await?;
        for (discovered, projects) in listing {
            let domain = match tx.domain_by_uuid(cluster_id, &discovered.uuid) {
                Some(domain) => domain,
                None => {
                    let domain = tx.insert_domain(cluster_id, &discovered.uuid, &discovered.name)?;
                    ensure_domain_services(&mut tx, &self.drivers, &domain)?;
                    info!("Discovered domain {} ({}) in cluster {}", domain.uuid, domain.name, cluster_id);
                    summary.new_domains.push(domain.uuid.clone());
                    domain
                }
            };

            for discovered_project in &projects {
                let (project, created) = ensure_project(&mut tx, &self.drivers, &domain, discovered_project)?;
                if created {
                    info!("Discovered project {} ({}) in domain {}", project.uuid, project.name, domain.uuid);
                    summary.new_projects.push(project.uuid);
                }
            }
        }
        tx.commit()?;

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DiscoveryConfiguration, StaticDomainConfiguration};
    use crate::drivers::StaticDiscoverer;
    use crate::store::HierarchyStore;
    use crate::testing::{FakeQuotaDriver, TestCluster};
    use std::sync::Arc;

    fn discoverer(projects: &[&str]) -> StaticDiscoverer {
        StaticDiscoverer::new(&DiscoveryConfiguration {
            domains: vec![StaticDomainConfiguration {
                uuid: "d-1".into(),
                name: "alpha".into(),
                projects: projects
                    .iter()
                    .map(|uuid| DiscoveredProject {
                        uuid: uuid.to_string(),
                        name: format!("project {}", uuid),
                        parent_uuid: None,
                    })
                    .collect(),
            }],
        })
    }

    #[tokio::test]
    async fn test_discovery_creates_hierarchy() {
        let store = HierarchyStore::with_schema_version(1);
        let reconciler = TestCluster::new("west")
            .service("shared", Arc::new(FakeQuotaDriver::new("shared")), false)
            .reconciler(store.clone());

        let summary = reconciler.scan_domains(&discoverer(&["p-1", "p-2"])).await.unwrap();
        assert_eq!(summary.new_domains, vec!["d-1".to_string()]);
        assert_eq!(summary.new_projects.len(), 2);

        let tx = store.begin().await.unwrap();
        let domain = tx.domain_by_uuid("west", "d-1").unwrap();
        let service = tx.domain_service(domain.id, "shared").unwrap();
        // usage-only resources carry no domain quota
        assert_eq!(tx.domain_resources(service.id).len(), 3);

        let project = tx.project_by_uuid(domain.id, "p-1").unwrap();
        let service = tx.project_service(project.id, "shared").unwrap();
        let resources = tx.project_resources(service.id);
        assert_eq!(resources.len(), 4);
        let portion = resources.iter().find(|r| r.name == "capacity_portion").unwrap();
        assert_eq!(portion.quota, None);
    }

    #[tokio::test]
    async fn test_rediscovery_is_idempotent() {
        let store = HierarchyStore::with_schema_version(1);
        let reconciler = TestCluster::new("west")
            .service("shared", Arc::new(FakeQuotaDriver::new("shared")), false)
            .reconciler(store.clone());

        reconciler.scan_domains(&discoverer(&["p-1"])).await.unwrap();
        {
            let mut tx = store.begin().await.unwrap();
            let domain = tx.domain_by_uuid("west", "d-1").unwrap();
            let service = tx.domain_service(domain.id, "shared").unwrap();
            let mut things = tx.domain_resource(service.id, "things").unwrap();
            things.quota = 25;
            tx.save_domain_resource(things);
            tx.commit().unwrap();
        }

        let summary = reconciler.scan_domains(&discoverer(&["p-1", "p-3"])).await.unwrap();
        assert!(summary.new_domains.is_empty());
        assert_eq!(summary.new_projects, vec!["p-3".to_string()]);

        let tx = store.begin().await.unwrap();
        assert_eq!(tx.domains("west").len(), 1);
        let domain = tx.domain_by_uuid("west", "d-1").unwrap();
        assert_eq!(tx.domain_services(domain.id).len(), 1);
        assert_eq!(tx.projects(domain.id).len(), 2);
        let service = tx.domain_service(domain.id, "shared").unwrap();
        assert_eq!(tx.domain_resource(service.id, "things").unwrap().quota, 25);
    }
}
