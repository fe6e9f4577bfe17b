//! Hierarchy Records
//!
//! Rows of the Cluster → Domain → Project → Service → Resource tree. Children
//! reference their parent by row ID; parents never own their children, which
//! are always loaded from the hierarchy store on demand.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::Result;

/// Row identifier assigned by the hierarchy store
pub type RowId = i64;

/// Owner ID under which services of shared service types are stored
pub const SHARED_OWNER_ID: &str = "shared";

/// Availability zone for data that a driver could not place
pub const UNKNOWN_AZ: &str = "unknown";

// =============================================================================
// Opaque Blob
// =============================================================================

/// Driver-owned serialized state, passed through the engine verbatim
///
/// The engine never interprets the content; each driver defines its own
/// encoding (usually JSON).
#[derive(Clone, Default, PartialEq, Eq)]
pub struct OpaqueBlob(Bytes);

impl OpaqueBlob {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self(data.into())
    }

    pub fn empty() -> Self {
        Self(Bytes::new())
    }

    /// Encode a driver-defined structure as JSON
    pub fn from_json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self(Bytes::from(serde_json::to_vec(value)?)))
    }

    /// Decode a driver-defined JSON structure
    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.0)?)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for OpaqueBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpaqueBlob({} bytes)", self.0.len())
    }
}

// =============================================================================
// Resource Key
// =============================================================================

/// (service type, resource name) pair
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub service_type: String,
    pub resource_name: String,
}

impl ResourceKey {
    pub fn new(service_type: impl Into<String>, resource_name: impl Into<String>) -> Self {
        Self {
            service_type: service_type.into(),
            resource_name: resource_name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service_type, self.resource_name)
    }
}

// =============================================================================
// Cluster
// =============================================================================

/// Root of the hierarchy, defined by configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    pub id: String,
    /// Enabled service types
    pub service_types: BTreeSet<String>,
    /// Service types whose capacity is shared across clusters
    pub shared_service_types: BTreeSet<String>,
}

impl Cluster {
    pub fn has_service(&self, service_type: &str) -> bool {
        self.service_types.contains(service_type)
    }

    pub fn is_service_shared(&self, service_type: &str) -> bool {
        self.shared_service_types.contains(service_type)
    }

    /// Owner ID of the cluster-level service record for `service_type`
    pub fn service_owner_id(&self, service_type: &str) -> &str {
        if self.is_service_shared(service_type) {
            SHARED_OWNER_ID
        } else {
            &self.id
        }
    }
}

/// Capacity and usage within one availability zone
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AzCapacity {
    pub capacity: u64,
    pub usage: u64,
}

/// Bookkeeping for one capacity driver of one cluster
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterCapacitor {
    pub cluster_id: String,
    pub capacitor_id: String,
    pub scraped_at: Option<DateTime<Utc>>,
    pub scrape_duration_secs: f64,
    pub serialized_metrics: OpaqueBlob,
    /// Keys reported by the last successful scrape
    pub reported_resources: BTreeSet<ResourceKey>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterService {
    pub id: RowId,
    pub cluster_id: String,
    pub service_type: String,
    pub scraped_at: Option<DateTime<Utc>>,
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterResource {
    pub service_id: RowId,
    pub name: String,
    pub capacity: u64,
    pub capacity_per_az: BTreeMap<String, AzCapacity>,
    pub subcapacities: Vec<serde_json::Value>,
    /// Non-empty for manually maintained capacity
    pub comment: String,
}

impl ClusterResource {
    /// Whether an operator maintains this record (as opposed to a driver)
    pub fn is_manual(&self) -> bool {
        !self.comment.is_empty()
    }
}

// =============================================================================
// Domain
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Domain {
    pub id: RowId,
    pub cluster_id: String,
    pub name: String,
    pub uuid: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainService {
    pub id: RowId,
    pub domain_id: RowId,
    pub service_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainResource {
    pub service_id: RowId,
    pub name: String,
    pub quota: u64,
}

// =============================================================================
// Project
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub id: RowId,
    pub domain_id: RowId,
    pub name: String,
    pub uuid: String,
    pub parent_uuid: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectService {
    pub id: RowId,
    pub project_id: RowId,
    pub service_type: String,
    pub scraped_at: Option<DateTime<Utc>>,
    pub stale: bool,
    pub scrape_duration_secs: f64,
    pub rates_scraped_at: Option<DateTime<Utc>>,
    pub rates_stale: bool,
    pub rates_scrape_duration_secs: f64,
    pub rates_scrape_state: OpaqueBlob,
    pub serialized_metrics: OpaqueBlob,
}

/// Quota is `None` for resources that only track usage
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectResource {
    pub service_id: RowId,
    pub name: String,
    pub quota: Option<u64>,
    pub usage: u64,
    pub physical_usage: Option<u64>,
    /// Last quota confirmed by the backend (negative means unlimited)
    pub backend_quota: Option<i64>,
    pub desired_backend_quota: Option<u64>,
    pub subresources: Vec<serde_json::Value>,
}

impl ProjectResource {
    pub fn new(service_id: RowId, name: impl Into<String>, tracks_quota: bool) -> Self {
        Self {
            service_id,
            name: name.into(),
            quota: tracks_quota.then_some(0),
            usage: 0,
            physical_usage: None,
            backend_quota: None,
            desired_backend_quota: None,
            subresources: Vec::new(),
        }
    }

    /// Whether the backend lags behind the quota stored here
    pub fn needs_backend_sync(&self) -> bool {
        match self.quota {
            Some(quota) => self.backend_quota != i64::try_from(quota).ok(),
            None => false,
        }
    }
}

/// Cumulative usage counter of a rate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectRate {
    pub service_id: RowId,
    pub name: String,
    pub usage: Option<u128>,
}
