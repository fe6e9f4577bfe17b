//! Capacity scrape and merge
//!
//! All capacitors of a cluster are scraped concurrently. Their reports are
//! summed per (service, resource) key and replace the stored capacity for
//! every reported key. Keys last reported by a capacitor that failed this
//! time keep their previous value, as do manually maintained records.

use super::Reconciler;
use crate::domain::model::{ClusterCapacitor, ClusterResource, ResourceKey};
use crate::domain::ports::{CapacityData, CapacityReport};
use crate::error::Result;
use chrono::Utc;
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Outcome of one capacity scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapacityScanSummary {
    /// Resources whose capacity was replaced
    pub updated: usize,
    /// Resources kept because a capacitor reporting them failed
    pub protected: usize,
    /// Resources kept because an operator maintains them
    pub manual: usize,
    pub failed_capacitors: Vec<String>,
}

/// Sum capacity reports per key
///
/// Capacity and per-AZ capacity/usage accumulate independently;
/// subcapacities are concatenated in report order.
pub fn merge_capacity<'a, I>(reports: I) -> BTreeMap<ResourceKey, CapacityData>
where
    I: IntoIterator<Item = &'a CapacityReport>,
{
    let mut merged: BTreeMap<ResourceKey, CapacityData> = BTreeMap::new();

    for report in reports {
        for (service_type, resources) in report {
            for (resource_name, data) in resources {
                let slot = merged
                    .entry(ResourceKey::new(service_type.clone(), resource_name.clone()))
                    .or_default();
                slot.capacity = slot.capacity.saturating_add(data.capacity);

                if let Some(per_az) = &data.capacity_per_az {
                    let merged_az = slot.capacity_per_az.get_or_insert_with(BTreeMap::new);
                    for (az, value) in per_az {
                        let az_slot = merged_az.entry(az.clone()).or_default();
                        az_slot.capacity = az_slot.capacity.saturating_add(value.capacity);
                        az_slot.usage = az_slot.usage.saturating_add(value.usage);
                    }
                }

                slot.subcapacities.extend(data.subcapacities.iter().cloned());
            }
        }
    }

    merged
}

impl Reconciler {
    /// Scrape all capacitors of the cluster and store the merged result
    pub async fn scan_capacity(&self) -> Result<CapacityScanSummary> {
        let cluster = &self.drivers.cluster;

        let results = join_all(self.drivers.capacitors().iter().map(|capacitor| async move {
            let started = Instant::now();
            let result = capacitor.driver.scrape(&capacitor.endpoint).await;
            (capacitor, result, started.elapsed())
        }))
        .await;

        let now = Utc::now();
        let mut summary = CapacityScanSummary::default();
        let mut protected = BTreeSet::new();
        let mut reports = Vec::new();
        let mut tx = self.store.begin().await?;

        for (capacitor, result, duration) in results {
            match result {
                Ok(scrape) => {
                    let reported_resources = scrape
                        .capacities
                        .iter()
                        .flat_map(|(service_type, resources)| {
                            resources
                                .keys()
                                .map(move |name| ResourceKey::new(service_type.clone(), name.clone()))
                        })
                        .collect();
                    tx.save_cluster_capacitor(ClusterCapacitor {
                        cluster_id: cluster.id.clone(),
                        capacitor_id: capacitor.id.clone(),
                        scraped_at: Some(now),
                        scrape_duration_secs: duration.as_secs_f64(),
                        serialized_metrics: scrape.serialized_metrics,
                        reported_resources,
                    });
                    reports.push(scrape.capacities);
                }
                Err(e) => {
                    warn!(
                        "Scrape of capacitor {} in cluster {} failed: {}",
                        capacitor.id, cluster.id, e
                    );
                    self.metrics.record_scrape_failure(&cluster.id, "capacity");
                    if let Some(previous) = tx.cluster_capacitor(&cluster.id, &capacitor.id) {
                        protected.extend(previous.reported_resources);
                    }
                    summary.failed_capacitors.push(capacitor.id.clone());
                }
            }
        }

        let mut fresh_services = BTreeSet::new();
        for (key, data) in merge_capacity(&reports) {
            if !cluster.has_service(&key.service_type) {
                warn!(
                    "Discarding capacity for {}: service is not enabled in cluster {}",
                    key, cluster.id
                );
                continue;
            }
            if protected.contains(&key) {
                debug!("Keeping last known capacity for {}", key);
                summary.protected += 1;
                continue;
            }

            let owner_id = cluster.service_owner_id(&key.service_type);
            let service = match tx.cluster_service(owner_id, &key.service_type) {
                Some(service) => service,
                None => tx.insert_cluster_service(owner_id, &key.service_type)?,
            };
            if tx
                .cluster_resource(service.id, &key.resource_name)
                .is_some_and(|existing| existing.is_manual())
            {
                debug!("Keeping manually maintained capacity for {}", key);
                summary.manual += 1;
                continue;
            }

            tx.save_cluster_resource(ClusterResource {
                service_id: service.id,
                name: key.resource_name.clone(),
                capacity: data.capacity,
                capacity_per_az: data.capacity_per_az.unwrap_or_default(),
                subcapacities: data.subcapacities,
                comment: String::new(),
            });
            summary.updated += 1;
            fresh_services.insert(key.service_type);
        }

        for service_type in fresh_services {
            if protected.iter().any(|k| k.service_type == service_type) {
                continue;
            }
            let owner_id = cluster.service_owner_id(&service_type);
            if let Some(mut service) = tx.cluster_service(owner_id, &service_type) {
                service.scraped_at = Some(now);
                service.stale = false;
                tx.update_cluster_service(&service)?;
            }
        }

        tx.commit()?;
        info!(
            "Scanned capacity for cluster {}: {} updated, {} protected, {} manual",
            cluster.id, summary.updated, summary.protected, summary.manual
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{AzCapacity, SHARED_OWNER_ID};
    use crate::testing::{FakeCapacityDriver, FakeQuotaDriver, TestCluster};
    use crate::store::HierarchyStore;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn report(per_az: &[(&str, u64, u64)], capacity: u64) -> CapacityReport {
        let capacity_per_az = (!per_az.is_empty()).then(|| {
            per_az
                .iter()
                .map(|(az, c, u)| (az.to_string(), AzCapacity { capacity: *c, usage: *u }))
                .collect()
        });
        BTreeMap::from([(
            "storage".to_string(),
            BTreeMap::from([(
                "capacity".to_string(),
                CapacityData {
                    capacity,
                    capacity_per_az,
                    subcapacities: vec![serde_json::json!({"capacity": capacity})],
                },
            )]),
        )])
    }

    #[test]
    fn test_merge_sums_overlapping_azs() {
        let first = report(&[("az-a", 100, 10), ("az-b", 50, 5)], 150);
        let second = report(&[("az-a", 30, 3), ("unknown", 20, 2)], 50);

        let merged = merge_capacity([&first, &second]);
        let data = &merged[&ResourceKey::new("storage", "capacity")];

        assert_eq!(data.capacity, 200);
        let per_az = data.capacity_per_az.as_ref().unwrap();
        assert_eq!(per_az["az-a"], AzCapacity { capacity: 130, usage: 13 });
        assert_eq!(per_az["az-b"], AzCapacity { capacity: 50, usage: 5 });
        assert_eq!(per_az["unknown"], AzCapacity { capacity: 20, usage: 2 });
        assert_eq!(data.subcapacities.len(), 2);
    }

    #[test]
    fn test_merge_without_az_data() {
        let merged = merge_capacity([&report(&[], 10), &report(&[], 15)]);
        let data = &merged[&ResourceKey::new("storage", "capacity")];
        assert_eq!(data.capacity, 25);
        assert!(data.capacity_per_az.is_none());
    }

    struct Fixture {
        store: Arc<HierarchyStore>,
        first: Arc<FakeCapacityDriver>,
        second: Arc<FakeCapacityDriver>,
        reconciler: Reconciler,
    }

    fn fixture(shared: bool) -> Fixture {
        let store = HierarchyStore::with_schema_version(1);
        let first = Arc::new(FakeCapacityDriver::new("pools"));
        let second = Arc::new(FakeCapacityDriver::new("nodes"));
        let cluster = TestCluster::new("west")
            .service("storage", Arc::new(FakeQuotaDriver::new("storage")), shared)
            .service("compute", Arc::new(FakeQuotaDriver::new("compute")), false)
            .capacitor(first.clone())
            .capacitor(second.clone());
        let reconciler = cluster.reconciler(store.clone());
        Fixture {
            store,
            first,
            second,
            reconciler,
        }
    }

    async fn stored(store: &HierarchyStore, owner: &str, service_type: &str, name: &str) -> Option<ClusterResource> {
        let tx = store.begin().await.unwrap();
        let service = tx.cluster_service(owner, service_type)?;
        let resource = tx.cluster_resource(service.id, name);
        tx.rollback();
        resource
    }

    #[tokio::test]
    async fn test_scan_stores_merged_capacity() {
        let f = fixture(false);
        f.first.report("storage", "capacity", 150, &[("az-a", 100, 10), ("az-b", 50, 5)]);
        f.second.report("storage", "capacity", 50, &[("az-a", 30, 3), ("unknown", 20, 2)]);

        let summary = f.reconciler.scan_capacity().await.unwrap();
        assert_eq!(summary.updated, 1);

        let resource = stored(&f.store, "west", "storage", "capacity").await.unwrap();
        assert_eq!(resource.capacity, 200);
        assert_eq!(resource.capacity_per_az["az-a"], AzCapacity { capacity: 130, usage: 13 });
        assert_eq!(resource.subcapacities.len(), 2);

        let tx = f.store.begin().await.unwrap();
        let capacitor = tx.cluster_capacitor("west", "pools").unwrap();
        assert!(capacitor.scraped_at.is_some());
        assert!(capacitor
            .reported_resources
            .contains(&ResourceKey::new("storage", "capacity")));
        assert!(tx.cluster_service("west", "storage").unwrap().scraped_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_capacitor_protects_its_keys() {
        let f = fixture(false);
        f.first.report("storage", "capacity", 100, &[]);
        f.first.report("compute", "things", 8, &[]);
        f.second.report("storage", "capacity", 50, &[]);
        f.reconciler.scan_capacity().await.unwrap();

        f.first.report("storage", "capacity", 400, &[]);
        f.first.report("compute", "things", 16, &[]);
        f.second.fail.store(true, Ordering::SeqCst);

        let summary = f.reconciler.scan_capacity().await.unwrap();
        assert_eq!(summary.failed_capacitors, vec!["nodes".to_string()]);
        assert_eq!(summary.protected, 1);
        assert_eq!(f.reconciler.metrics.scrape_failure_count("west", "capacity"), 1);

        // no partial sum from the surviving capacitor
        let storage = stored(&f.store, "west", "storage", "capacity").await.unwrap();
        assert_eq!(storage.capacity, 150);
        let things = stored(&f.store, "west", "compute", "things").await.unwrap();
        assert_eq!(things.capacity, 16);
    }

    #[tokio::test]
    async fn test_manual_capacity_is_kept() {
        let f = fixture(false);
        {
            let mut tx = f.store.begin().await.unwrap();
            let service = tx.insert_cluster_service("west", "storage").unwrap();
            tx.save_cluster_resource(ClusterResource {
                service_id: service.id,
                name: "capacity".into(),
                capacity: 42,
                capacity_per_az: BTreeMap::new(),
                subcapacities: Vec::new(),
                comment: "counted by hand".into(),
            });
            tx.commit().unwrap();
        }
        f.first.report("storage", "capacity", 1000, &[]);

        let summary = f.reconciler.scan_capacity().await.unwrap();
        assert_eq!(summary.manual, 1);
        let resource = stored(&f.store, "west", "storage", "capacity").await.unwrap();
        assert_eq!(resource.capacity, 42);
    }

    #[tokio::test]
    async fn test_shared_and_unknown_services() {
        let f = fixture(true);
        f.first.report("storage", "capacity", 10, &[]);
        f.first.report("dns", "zones", 10, &[]);

        let summary = f.reconciler.scan_capacity().await.unwrap();
        assert_eq!(summary.updated, 1);
        assert!(stored(&f.store, SHARED_OWNER_ID, "storage", "capacity").await.is_some());
        assert!(stored(&f.store, "west", "storage", "capacity").await.is_none());
    }
}
