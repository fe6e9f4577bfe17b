//! Staleness marking
//!
//! Services whose last successful scrape is older than the configured
//! threshold are flagged stale. Their values are kept.

use super::Reconciler;
use crate::error::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

fn is_overdue(scraped_at: Option<DateTime<Utc>>, threshold: DateTime<Utc>) -> bool {
    scraped_at.map_or(true, |at| at < threshold)
}

impl Reconciler {
    /// Flag overdue services as stale; returns how many were flagged
    pub async fn mark_stale(&self, now: DateTime<Utc>) -> Result<usize> {
        let threshold = now - Duration::seconds(self.scrape.stale_after_secs as i64);
        let cluster = &self.drivers.cluster;
        let mut flagged = 0;
        let mut tx = self.store.begin().await?;

        for service_type in &cluster.service_types {
            let owner_id = cluster.service_owner_id(service_type);
            if let Some(mut service) = tx.cluster_service(owner_id, service_type) {
                if !service.stale && is_overdue(service.scraped_at, threshold) {
                    service.stale = true;
                    tx.update_cluster_service(&service)?;
                    flagged += 1;
                }
            }
        }

        for mut service in tx.project_services_in_cluster(&cluster.id) {
            let mut changed = false;
            if !service.stale && is_overdue(service.scraped_at, threshold) {
                service.stale = true;
                changed = true;
            }
            if !service.rates_stale && is_overdue(service.rates_scraped_at, threshold) {
                service.rates_stale = true;
                changed = true;
            }
            if changed {
                tx.update_project_service(&service)?;
                flagged += 1;
            }
        }

        tx.commit()?;
        if flagged > 0 {
            debug!("Flagged {} services stale in cluster {}", flagged, cluster.id);
        }
        Ok(flagged)
    }
}
