//! Cluster capacity edits
//!
//! Operators may maintain capacity by hand for resources no capacitor
//! reports. A manual record carries a comment; records written by the
//! capacity scan have none and cannot be edited here.

use super::{EditBatch, QuotaEditor, ACCEPTED_STATUS, REJECTED_STATUS};
use crate::audit::CapacityEventTarget;
use crate::domain::model::{ClusterResource, RowId};
use crate::domain::ports::{RequestContext, Token};
use crate::domain::units::{Unit, ValueWithUnit};
use crate::error::{Error, Result};
use crate::store::Transaction;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::info;

pub const RULE_EDIT: &str = "cluster:edit";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CapacityRequest {
    #[serde(default)]
    pub services: Vec<ServiceCapacityRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServiceCapacityRequest {
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(default)]
    pub resources: Vec<ResourceCapacityRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResourceCapacityRequest {
    pub name: String,
    /// Negative to delete the manual record
    pub capacity: i64,
    /// Defaults to the resource's own unit
    #[serde(default)]
    pub unit: Option<Unit>,
    #[serde(default)]
    pub comment: String,
}

/// Pending change of one capacity record
enum CapacityWrite {
    Save(ClusterResource),
    Delete { service_id: RowId, name: String },
}

impl QuotaEditor {
    /// Insert, update or delete manually maintained capacity records
    pub async fn set_cluster_capacity(
        &self,
        request: &CapacityRequest,
        token: &Token,
        ctx: &RequestContext,
    ) -> Result<()> {
        if !token.check(RULE_EDIT) {
            return Err(Error::Forbidden {
                rule: RULE_EDIT.to_string(),
            });
        }

        let mut tx = self.store.begin().await?;
        let mut batch = EditBatch::new();
        let mut writes = Vec::new();

        for service in &request.services {
            for resource in &service.resources {
                let mut target = CapacityEventTarget {
                    cluster_id: self.cluster_id().to_string(),
                    service_type: service.service_type.clone(),
                    resource_name: resource.name.clone(),
                    comment: resource.comment.clone(),
                    ..Default::default()
                };

                match self.plan_capacity_write(&tx, &service.service_type, resource, &mut target) {
                    Ok(Some(write)) => {
                        writes.push(write);
                        batch.accepted.push(target);
                    }
                    Ok(None) => {}
                    Err(reason) => {
                        batch.errors.push(format!(
                            "cannot set {}/{} capacity: {}",
                            service.service_type, resource.name, reason
                        ));
                        target.reject_reason = reason;
                        batch.rejected.push(target);
                    }
                }
            }
        }

        if batch.has_errors() {
            tx.rollback();
            self.emit(ctx, token, REJECTED_STATUS, &batch.rejected).await;
            return Err(Error::Validation(batch.errors));
        }

        for write in writes {
            match write {
                CapacityWrite::Save(resource) => tx.save_cluster_resource(resource),
                CapacityWrite::Delete { service_id, name } => {
                    tx.delete_cluster_resource(service_id, &name);
                }
            }
        }
        tx.commit()?;

        for target in &batch.accepted {
            info!(
                "Set capacity {}/{} = {} -> {} in cluster {} by user {} ({})",
                target.service_type,
                target.resource_name,
                target.old_capacity,
                target.new_capacity,
                target.cluster_id,
                token.user_id,
                token.user_name
            );
        }
        self.emit(ctx, token, ACCEPTED_STATUS, &batch.accepted).await;
        Ok(())
    }

    /// Decide what to write for one requested capacity, if anything
    fn plan_capacity_write(
        &self,
        tx: &Transaction,
        service_type: &str,
        request: &ResourceCapacityRequest,
        target: &mut CapacityEventTarget,
    ) -> std::result::Result<Option<CapacityWrite>, String> {
        let cluster = &self.drivers().cluster;
        if !cluster.has_service(service_type) {
            return Err("no such service".to_string());
        }
        let service = tx
            .cluster_service(cluster.service_owner_id(service_type), service_type)
            .ok_or_else(|| "no such service".to_string())?;
        let info = self
            .drivers()
            .resource_info(service_type, &request.name)
            .ok_or_else(|| "no such resource".to_string())?;
        target.unit = info.unit;

        let existing = tx.cluster_resource(service.id, &request.name);
        match &existing {
            None if request.capacity < 0 => return Ok(None),
            Some(record) if !record.is_manual() => {
                return Err("capacity for this resource is maintained automatically".to_string())
            }
            Some(record) => target.old_capacity = record.capacity,
            None => {}
        }

        if request.capacity < 0 {
            return Ok(Some(CapacityWrite::Delete {
                service_id: service.id,
                name: request.name.clone(),
            }));
        }
        if request.comment.is_empty() {
            return Err("comment is missing".to_string());
        }

        let value = ValueWithUnit::new(request.capacity as u64, request.unit.unwrap_or(info.unit));
        let capacity = value.convert_to(info.unit).map_err(|e| e.to_string())?;
        target.new_capacity = capacity;

        let record = match existing {
            Some(record) => ClusterResource {
                capacity,
                comment: request.comment.clone(),
                ..record
            },
            None => ClusterResource {
                service_id: service.id,
                name: request.name.clone(),
                capacity,
                capacity_per_az: BTreeMap::new(),
                subcapacities: Vec::new(),
                comment: request.comment.clone(),
            },
        };
        Ok(Some(CapacityWrite::Save(record)))
    }
}
