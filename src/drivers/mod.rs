//! Driver Registry
//!
//! Capacity and quota drivers are selected by driver ID from configuration
//! and constructed once at startup. Both registries come with a built-in
//! `static` driver: capacity read from configuration, and a quota backend
//! held in memory.

pub mod discovery;
pub mod static_capacity;
pub mod static_quota;

pub use discovery::StaticDiscoverer;
pub use static_capacity::StaticCapacityDriver;
pub use static_quota::StaticQuotaDriver;

use crate::config::ClusterConfiguration;
use crate::domain::model::Cluster;
use crate::domain::ports::{
    CapacityDriverRef, EndpointConfig, QuotaDriverRef, ResourceInfo,
};
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

type CapacityConstructor =
    Box<dyn Fn(&str, &EndpointConfig) -> Result<CapacityDriverRef> + Send + Sync>;
type QuotaConstructor =
    Box<dyn Fn(&str, &EndpointConfig) -> Result<QuotaDriverRef> + Send + Sync>;

/// Decode driver parameters; missing parameters decode as the default
pub(crate) fn parse_params<T>(driver: &str, params: &serde_json::Value) -> Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    if params.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(params.clone()).map_err(|e| {
        Error::Configuration(format!("invalid parameters for driver {}: {}", driver, e))
    })
}

// =============================================================================
// Driver Factory
// =============================================================================

/// Constructs drivers by ID
#[derive(Default)]
pub struct DriverFactory {
    capacity: BTreeMap<String, CapacityConstructor>,
    quota: BTreeMap<String, QuotaConstructor>,
}

impl DriverFactory {
    /// Factory without any drivers
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory with the built-in drivers registered
    pub fn with_builtins() -> Self {
        let mut factory = Self::new();
        factory.register_capacity("static", |capacitor_id, endpoint| {
            Ok(Arc::new(StaticCapacityDriver::new(capacitor_id, endpoint)?) as CapacityDriverRef)
        });
        factory.register_quota("static", |service_type, endpoint| {
            Ok(Arc::new(StaticQuotaDriver::new(service_type, endpoint)?) as QuotaDriverRef)
        });
        factory
    }

    /// Register a capacity driver; the constructor receives the capacitor ID
    pub fn register_capacity<F>(&mut self, driver_id: &str, constructor: F)
    where
        F: Fn(&str, &EndpointConfig) -> Result<CapacityDriverRef> + Send + Sync + 'static,
    {
        self.capacity
            .insert(driver_id.to_lowercase(), Box::new(constructor));
    }

    /// Register a quota driver; the constructor receives the service type
    pub fn register_quota<F>(&mut self, driver_id: &str, constructor: F)
    where
        F: Fn(&str, &EndpointConfig) -> Result<QuotaDriverRef> + Send + Sync + 'static,
    {
        self.quota.insert(driver_id.to_lowercase(), Box::new(constructor));
    }

    pub fn create_capacity(
        &self,
        driver_id: &str,
        capacitor_id: &str,
        endpoint: &EndpointConfig,
    ) -> Result<CapacityDriverRef> {
        let constructor = self
            .capacity
            .get(&driver_id.to_lowercase())
            .ok_or_else(|| Error::UnknownDriver {
                driver: driver_id.to_string(),
            })?;
        constructor(capacitor_id, endpoint)
    }

    pub fn create_quota(
        &self,
        driver_id: &str,
        service_type: &str,
        endpoint: &EndpointConfig,
    ) -> Result<QuotaDriverRef> {
        let constructor = self
            .quota
            .get(&driver_id.to_lowercase())
            .ok_or_else(|| Error::UnknownDriver {
                driver: driver_id.to_string(),
            })?;
        constructor(service_type, endpoint)
    }
}

// =============================================================================
// Cluster Drivers
// =============================================================================

/// Quota driver of one service type, with its endpoint
#[derive(Clone)]
pub struct ServiceDriver {
    pub driver: QuotaDriverRef,
    pub endpoint: EndpointConfig,
}

/// Capacity driver of one capacitor, with its endpoint
#[derive(Clone)]
pub struct CapacitorDriver {
    pub id: String,
    pub driver: CapacityDriverRef,
    pub endpoint: EndpointConfig,
}

/// All drivers configured for one cluster
#[derive(Clone)]
pub struct ClusterDrivers {
    pub cluster: Cluster,
    services: BTreeMap<String, ServiceDriver>,
    capacitors: Vec<CapacitorDriver>,
}

impl ClusterDrivers {
    pub fn from_config(
        cluster_id: &str,
        config: &ClusterConfiguration,
        factory: &DriverFactory,
    ) -> Result<Self> {
        let mut services = BTreeMap::new();
        for service in &config.services {
            let driver = factory.create_quota(&service.driver, &service.service_type, &service.endpoint)?;
            services.insert(
                service.service_type.clone(),
                ServiceDriver {
                    driver,
                    endpoint: service.endpoint.clone(),
                },
            );
        }

        let mut capacitors = Vec::with_capacity(config.capacitors.len());
        for capacitor in &config.capacitors {
            let driver = factory.create_capacity(&capacitor.driver, &capacitor.id, &capacitor.endpoint)?;
            capacitors.push(CapacitorDriver {
                id: capacitor.id.clone(),
                driver,
                endpoint: capacitor.endpoint.clone(),
            });
        }

        Ok(Self {
            cluster: config.to_cluster(cluster_id),
            services,
            capacitors,
        })
    }

    /// Initialize every driver, failing on the first error
    pub async fn init_all(&self) -> Result<()> {
        for (service_type, service) in &self.services {
            service.driver.init(&service.endpoint).await?;
            info!(
                "Initialized quota driver for {} in cluster {}",
                service_type, self.cluster.id
            );
        }
        for capacitor in &self.capacitors {
            capacitor.driver.init(&capacitor.endpoint).await?;
            info!(
                "Initialized capacity driver {} in cluster {}",
                capacitor.id, self.cluster.id
            );
        }
        Ok(())
    }

    pub fn service(&self, service_type: &str) -> Option<&ServiceDriver> {
        self.services.get(service_type)
    }

    /// Service driver or an error naming the missing service
    pub fn require_service(&self, service_type: &str) -> Result<&ServiceDriver> {
        self.service(service_type)
            .ok_or_else(|| Error::ServiceNotConfigured {
                cluster_id: self.cluster.id.clone(),
                service_type: service_type.to_string(),
            })
    }

    pub fn services(&self) -> impl Iterator<Item = (&String, &ServiceDriver)> {
        self.services.iter()
    }

    pub fn capacitors(&self) -> &[CapacitorDriver] {
        &self.capacitors
    }

    pub fn resource_info(&self, service_type: &str, resource_name: &str) -> Option<ResourceInfo> {
        self.service(service_type)?
            .driver
            .resources()
            .into_iter()
            .find(|r| r.name == resource_name)
    }
}
