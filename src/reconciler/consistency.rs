//! Consistency check
//!
//! Brings service and resource rows in line with the configured service
//! types. Missing rows are created. Rows of types no longer enabled keep
//! their quotas, and their project services are marked stale. Runs at
//! startup before the first scrape.

use super::discovery::{ensure_domain_services, ensure_project_services};
use super::Reconciler;
use crate::error::Result;
use tracing::{info, warn};

impl Reconciler {
    pub async fn check_consistency(&self) -> Result<()> {
        let cluster = &self.drivers.cluster;
        let mut tx = self.store.begin().await?;

        for service_type in &cluster.service_types {
            let owner_id = cluster.service_owner_id(service_type);
            if tx.cluster_service(owner_id, service_type).is_none() {
                tx.insert_cluster_service(owner_id, service_type)?;
                info!("Created cluster service {} for {}", service_type, owner_id);
            }
        }

        for domain in tx.domains(&cluster.id) {
            for service in tx.domain_services(domain.id) {
                if !cluster.has_service(&service.service_type) {
                    warn!(
                        "Keeping service {} of domain {}: not enabled in cluster {}",
                        service.service_type, domain.uuid, cluster.id
                    );
                }
            }
            ensure_domain_services(&mut tx, &self.drivers, &domain)?;

            for project in tx.projects(domain.id) {
                for mut service in tx.project_services(project.id) {
                    if !cluster.has_service(&service.service_type) && !service.stale {
                        warn!(
                            "Marking service {} of project {} stale: not enabled in cluster {}",
                            service.service_type, project.uuid, cluster.id
                        );
                        service.stale = true;
                        service.rates_stale = true;
                        tx.update_project_service(&service)?;
                    }
                }
                ensure_project_services(&mut tx, &self.drivers, &project)?;
            }
        }

        tx.commit()
    }
}
