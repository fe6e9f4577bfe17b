//! Domain reports

use crate::domain::model::Domain;
use crate::domain::units::Unit;
use crate::drivers::ClusterDrivers;
use crate::store::Transaction;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomainReport {
    pub id: String,
    pub name: String,
    pub services: BTreeMap<String, DomainServiceReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomainServiceReport {
    pub area: String,
    pub resources: BTreeMap<String, DomainResourceReport>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DomainResourceReport {
    #[serde(skip_serializing_if = "is_countable")]
    pub unit: Unit,
    /// Absent for usage-only resources
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<u64>,
    pub projects_quota: u64,
    pub usage: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub physical_usage: Option<u64>,
    /// Cluster capacity, where known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<u64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub externally_managed: bool,
}

fn is_countable(unit: &Unit) -> bool {
    *unit == Unit::None
}

/// Aggregate quota, usage and capacity of a domain as seen by `tx`
pub fn build_domain_report(tx: &Transaction, drivers: &ClusterDrivers, domain: &Domain) -> DomainReport {
    let cluster = &drivers.cluster;
    let mut services = BTreeMap::new();

    for (service_type, service) in drivers.services() {
        let domain_service = tx.domain_service(domain.id, service_type);
        let cluster_service = tx.cluster_service(cluster.service_owner_id(service_type), service_type);

        let mut resources = BTreeMap::new();
        for info in service.driver.resources() {
            let project_resources = tx.project_resources_in_domain(domain.id, service_type, &info.name);
            let physical: Vec<u64> = project_resources.iter().filter_map(|r| r.physical_usage).collect();

            let quota = match (&domain_service, info.tracks_quota()) {
                (Some(s), true) => Some(tx.domain_resource(s.id, &info.name).map_or(0, |r| r.quota)),
                (None, true) => Some(0),
                (_, false) => None,
            };

            resources.insert(
                info.name.clone(),
                DomainResourceReport {
                    unit: info.unit,
                    quota,
                    projects_quota: project_resources.iter().filter_map(|r| r.quota).sum(),
                    usage: project_resources.iter().map(|r| r.usage).sum(),
                    physical_usage: (!physical.is_empty()).then(|| physical.iter().sum()),
                    capacity: cluster_service
                        .as_ref()
                        .and_then(|s| tx.cluster_resource(s.id, &info.name))
                        .map(|r| r.capacity),
                    externally_managed: info.externally_managed,
                },
            );
        }

        services.insert(
            service_type.clone(),
            DomainServiceReport {
                area: service.driver.service_info().area,
                resources,
            },
        );
    }

    DomainReport {
        id: domain.uuid.clone(),
        name: domain.name.clone(),
        services,
    }
}
