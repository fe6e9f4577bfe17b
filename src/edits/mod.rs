//! Operator Edits
//!
//! Validation and application of quota and capacity changes requested
//! through the API. Every request is all-or-nothing: all problems are
//! collected, and a single one aborts the whole transaction. Audit events
//! are emitted only after the outcome is final.

mod cluster;
mod domain;
mod project;
mod report;

pub use cluster::{CapacityRequest, ResourceCapacityRequest, ServiceCapacityRequest};
pub use domain::DomainQuotaOptions;
pub use project::ProjectEditOutcome;
pub use report::{build_domain_report, DomainReport, DomainResourceReport, DomainServiceReport};

use crate::audit::{AuditPipeline, TargetRenderer};
use crate::domain::ports::{RequestContext, ResourceInfo, Token};
use crate::domain::units::InputValue;
use crate::drivers::ClusterDrivers;
use crate::reconciler::Reconciler;
use crate::store::HierarchyStore;
use std::collections::BTreeMap;
use std::sync::Arc;

/// service type → resource name → requested quota
pub type QuotaRequest = BTreeMap<String, BTreeMap<String, InputValue>>;

/// HTTP status recorded for changes rejected by validation
const REJECTED_STATUS: u16 = 422;
const ACCEPTED_STATUS: u16 = 200;

/// Applies operator edits within one cluster
pub struct QuotaEditor {
    store: Arc<HierarchyStore>,
    reconciler: Arc<Reconciler>,
    audit: Arc<AuditPipeline>,
}

impl QuotaEditor {
    pub fn new(store: Arc<HierarchyStore>, reconciler: Arc<Reconciler>, audit: Arc<AuditPipeline>) -> Self {
        Self {
            store,
            reconciler,
            audit,
        }
    }

    fn drivers(&self) -> &ClusterDrivers {
        self.reconciler.drivers()
    }

    fn cluster_id(&self) -> &str {
        self.reconciler.cluster_id()
    }

    async fn emit<T: TargetRenderer>(&self, request: &RequestContext, token: &Token, status: u16, targets: &[T]) {
        let events = targets
            .iter()
            .map(|target| self.audit.event(request, token, status, target))
            .collect();
        self.audit.emit_all(self.cluster_id(), events).await;
    }
}

/// Accepted and rejected changes of one request
struct EditBatch<T> {
    accepted: Vec<T>,
    rejected: Vec<T>,
    errors: Vec<String>,
}

impl<T> EditBatch<T> {
    fn new() -> Self {
        Self {
            accepted: Vec::new(),
            rejected: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Resolve the descriptor of a quota resource, or say why it cannot be edited
fn quota_resource_info(
    drivers: &ClusterDrivers,
    service_type: &str,
    resource_name: &str,
) -> std::result::Result<ResourceInfo, String> {
    if drivers.service(service_type).is_none() {
        return Err("no such service".to_string());
    }
    match drivers.resource_info(service_type, resource_name) {
        Some(info) if info.tracks_quota() => Ok(info),
        Some(_) => Err("resource does not track quota".to_string()),
        None => Err("no such resource".to_string()),
    }
}
