//! Project scrapes and backend quota propagation

use super::{ProjectContext, Reconciler};
use crate::domain::model::{ProjectRate, ProjectResource, RowId};
use crate::error::{Error, Result};
use chrono::Utc;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Outcome of scraping every project of a cluster
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectScanSummary {
    pub scraped: usize,
    pub failed: usize,
    pub rates_failed: usize,
}

impl Reconciler {
    /// Scrape quota and usage of one project service
    ///
    /// A failed scrape marks the service stale and keeps all stored values.
    /// After a successful scrape, quotas the backend has not caught up with
    /// are pushed to it.
    pub async fn scrape_project(&self, project_id: RowId, service_type: &str) -> Result<()> {
        let service_driver = self.drivers.require_service(service_type)?;

        let tx = self.store.begin().await?;
        let ctx = ProjectContext::load(&tx, project_id, service_type)?;
        tx.rollback();
        let owner = ctx.owner();

        let started = Instant::now();
        let result = service_driver
            .driver
            .scrape(&service_driver.endpoint, &owner)
            .await;
        let duration = started.elapsed().as_secs_f64();

        let mut tx = self.store.begin().await?;
        let mut service = match tx.project_service(project_id, service_type) {
            Some(service) => service,
            None => tx.insert_project_service(project_id, service_type)?,
        };

        let scrape = match result {
            Ok(scrape) => scrape,
            Err(e) => {
                warn!(
                    "Scrape of {} for project {} failed: {}",
                    service_type, owner.project_uuid, e
                );
                self.metrics.record_scrape_failure(self.cluster_id(), "quota");
                service.stale = true;
                service.scrape_duration_secs = duration;
                tx.update_project_service(&service)?;
                tx.commit()?;
                return Err(e);
            }
        };

        let mut needs_sync = false;
        for info in service_driver.driver.resources() {
            // an unreported resource keeps its stored row as is
            let Some(data) = scrape.resources.get(&info.name).cloned() else {
                warn!(
                    "Backend of {} did not report {} for project {}",
                    service_type, info.name, owner.project_uuid
                );
                continue;
            };

            let existing = tx.project_resource(service.id, &info.name);
            let is_new = existing.is_none();
            let mut resource = existing
                .unwrap_or_else(|| ProjectResource::new(service.id, info.name.clone(), info.tracks_quota()));

            resource.usage = data.usage;
            resource.physical_usage = data.physical_usage;
            resource.subresources = data.subresources;
            resource.backend_quota = Some(data.quota);

            if info.tracks_quota() {
                if info.externally_managed {
                    match u64::try_from(data.quota) {
                        Ok(quota) => resource.quota = Some(quota),
                        Err(_) => warn!(
                            "Backend of {} reports unlimited quota for {} in project {}, keeping {:?}",
                            service_type, info.name, owner.project_uuid, resource.quota
                        ),
                    }
                } else if is_new
                    && info.auto_approve_initial_quota > 0
                    && u64::try_from(data.quota).ok() == Some(info.auto_approve_initial_quota)
                {
                    debug!(
                        "Auto-approving initial quota {} for {}/{} in project {}",
                        info.auto_approve_initial_quota, service_type, info.name, owner.project_uuid
                    );
                    resource.quota = Some(info.auto_approve_initial_quota);
                }
                resource.desired_backend_quota = resource.quota;
                needs_sync |= !info.externally_managed && resource.needs_backend_sync();
            } else {
                resource.quota = None;
                resource.desired_backend_quota = None;
            }

            tx.save_project_resource(resource);
        }

        service.scraped_at = Some(Utc::now());
        service.stale = false;
        service.scrape_duration_secs = duration;
        service.serialized_metrics = scrape.serialized_metrics;
        tx.update_project_service(&service)?;
        tx.commit()?;

        debug!(
            "Scraped {} for project {} in {:.3}s",
            service_type, owner.project_uuid, duration
        );

        if needs_sync {
            if let Err(e) = self.apply_project_quota(project_id, service_type).await {
                warn!(
                    "Quota sync of {} for project {} failed: {}",
                    service_type, owner.project_uuid, e
                );
            }
        }
        Ok(())
    }

    /// Push stored quotas of one project service into the backend
    ///
    /// Externally managed and usage-only resources are never sent. Returns
    /// whether anything was pushed.
    pub async fn apply_project_quota(&self, project_id: RowId, service_type: &str) -> Result<bool> {
        let service_driver = self.drivers.require_service(service_type)?;

        let tx = self.store.begin().await?;
        let ctx = ProjectContext::load(&tx, project_id, service_type)?;
        let service = ctx
            .service
            .as_ref()
            .ok_or_else(|| Error::not_found("project_service", format!("{}/{}", ctx.project.uuid, service_type)))?;
        let resources = tx.project_resources(service.id);
        tx.rollback();

        let mut quotas = BTreeMap::new();
        let mut lagging = false;
        for resource in &resources {
            let Some(quota) = resource.quota else { continue };
            match self.drivers.resource_info(service_type, &resource.name) {
                Some(info) if !info.externally_managed => {
                    lagging |= resource.needs_backend_sync();
                    quotas.insert(resource.name.clone(), quota);
                }
                _ => {}
            }
        }
        if !lagging {
            return Ok(false);
        }

        let owner = ctx.owner();
        service_driver
            .driver
            .set_quota(&service_driver.endpoint, &owner, &quotas)
            .await?;

        let mut tx = self.store.begin().await?;
        for (name, quota) in &quotas {
            if let Some(mut resource) = tx.project_resource(service.id, name) {
                resource.backend_quota = i64::try_from(*quota).ok();
                tx.save_project_resource(resource);
            }
        }
        tx.commit()?;

        info!(
            "Applied {} quotas of {} to project {}",
            quotas.len(),
            service_type,
            owner.project_uuid
        );
        Ok(true)
    }

    /// Scrape cumulative rate counters of one project service
    pub async fn scrape_project_rates(&self, project_id: RowId, service_type: &str) -> Result<()> {
        let service_driver = self.drivers.require_service(service_type)?;
        let rates = service_driver.driver.rates();
        if rates.is_empty() {
            return Ok(());
        }

        let tx = self.store.begin().await?;
        let ctx = ProjectContext::load(&tx, project_id, service_type)?;
        tx.rollback();
        let owner = ctx.owner();
        let previous_state = ctx
            .service
            .as_ref()
            .map(|s| s.rates_scrape_state.clone())
            .unwrap_or_default();

        let started = Instant::now();
        let result = service_driver
            .driver
            .scrape_rates(&service_driver.endpoint, &owner, &previous_state)
            .await;
        let duration = started.elapsed().as_secs_f64();

        let mut tx = self.store.begin().await?;
        let mut service = match tx.project_service(project_id, service_type) {
            Some(service) => service,
            None => tx.insert_project_service(project_id, service_type)?,
        };
        service.rates_scrape_duration_secs = duration;

        match result {
            Ok(scrape) => {
                for rate in &rates {
                    tx.save_project_rate(ProjectRate {
                        service_id: service.id,
                        name: rate.name.clone(),
                        usage: scrape.usage.get(&rate.name).copied(),
                    });
                }
                service.rates_scrape_state = scrape.state;
                service.rates_scraped_at = Some(Utc::now());
                service.rates_stale = false;
                tx.update_project_service(&service)?;
                tx.commit()
            }
            Err(e) => {
                warn!(
                    "Rate scrape of {} for project {} failed: {}",
                    service_type, owner.project_uuid, e
                );
                self.metrics.record_scrape_failure(self.cluster_id(), "rates");
                service.rates_stale = true;
                tx.update_project_service(&service)?;
                tx.commit()?;
                Err(e)
            }
        }
    }

    /// Scrape quota, usage and rates of every project in the cluster
    pub async fn scrape_all_projects(&self) -> Result<ProjectScanSummary> {
        let tx = self.store.begin().await?;
        let mut targets = Vec::new();
        for domain in tx.domains(self.cluster_id()) {
            for project in tx.projects(domain.id) {
                targets.push(project.id);
            }
        }
        tx.rollback();

        let service_types: Vec<String> = self.drivers.services().map(|(t, _)| t.clone()).collect();
        let mut summary = ProjectScanSummary::default();
        for project_id in targets {
            for service_type in &service_types {
                match self.scrape_project(project_id, service_type).await {
                    Ok(()) => summary.scraped += 1,
                    Err(_) => summary.failed += 1,
                }
                if self.scrape_project_rates(project_id, service_type).await.is_err() {
                    summary.rates_failed += 1;
                }
            }
        }

        info!(
            "Scraped projects of cluster {}: {} ok, {} failed, {} rate failures",
            self.cluster_id(),
            summary.scraped,
            summary.failed,
            summary.rates_failed
        );
        Ok(summary)
    }
}
