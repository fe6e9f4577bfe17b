//! Audit event targets
//!
//! Each kind of change renders its own target section. The attachment
//! carries before/after values as a JSON document wrapped in a string, since
//! the downstream audit service does not accept objects there.

use super::event::{Attachment, Resource, TargetRenderer};
use crate::domain::units::Unit;
use serde::Serialize;

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct AttachmentContent {
    #[serde(skip_serializing_if = "is_zero")]
    old_quota: u64,
    #[serde(skip_serializing_if = "is_zero")]
    new_quota: u64,
    #[serde(skip_serializing_if = "is_zero")]
    old_capacity: u64,
    #[serde(skip_serializing_if = "is_zero")]
    new_capacity: u64,
    #[serde(skip_serializing_if = "is_countable")]
    unit: Unit,
    #[serde(skip_serializing_if = "String::is_empty")]
    comment: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    reject_reason: String,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

fn is_countable(unit: &Unit) -> bool {
    *unit == Unit::None
}

impl AttachmentContent {
    fn into_attachment(self) -> Attachment {
        // serializing a plain struct of numbers and strings cannot fail
        let content = serde_json::to_string(&self).unwrap_or_default();
        Attachment {
            name: "payload".to_string(),
            type_uri: "mime:application/json".to_string(),
            content,
        }
    }
}

// =============================================================================
// Quota Change
// =============================================================================

/// Change of one domain or project quota
#[derive(Debug, Clone, Default)]
pub struct QuotaEventTarget {
    pub domain_id: String,
    /// Empty for domain quota changes
    pub project_id: String,
    pub service_type: String,
    pub resource_name: String,
    pub old_quota: u64,
    pub new_quota: u64,
    pub unit: Unit,
    pub reject_reason: String,
}

impl TargetRenderer for QuotaEventTarget {
    fn render(&self) -> Resource {
        let id = if self.project_id.is_empty() {
            self.domain_id.clone()
        } else {
            self.project_id.clone()
        };

        Resource {
            type_uri: format!("service/{}/{}/quota", self.service_type, self.resource_name),
            id,
            domain_id: self.domain_id.clone(),
            project_id: self.project_id.clone(),
            attachments: vec![AttachmentContent {
                old_quota: self.old_quota,
                new_quota: self.new_quota,
                unit: self.unit,
                reject_reason: self.reject_reason.clone(),
                ..Default::default()
            }
            .into_attachment()],
            ..Default::default()
        }
    }
}

// =============================================================================
// Capacity Change
// =============================================================================

/// Change of one manually maintained cluster capacity
#[derive(Debug, Clone, Default)]
pub struct CapacityEventTarget {
    pub cluster_id: String,
    pub service_type: String,
    pub resource_name: String,
    pub old_capacity: u64,
    /// Zero when the record is deleted
    pub new_capacity: u64,
    pub unit: Unit,
    pub comment: String,
    pub reject_reason: String,
}

impl TargetRenderer for CapacityEventTarget {
    fn render(&self) -> Resource {
        Resource {
            type_uri: format!(
                "service/{}/{}/capacity",
                self.service_type, self.resource_name
            ),
            id: self.cluster_id.clone(),
            attachments: vec![AttachmentContent {
                old_capacity: self.old_capacity,
                new_capacity: self.new_capacity,
                unit: self.unit,
                comment: self.comment.clone(),
                reject_reason: self.reject_reason.clone(),
                ..Default::default()
            }
            .into_attachment()],
            ..Default::default()
        }
    }
}
