//! Project quota edits
//!
//! Project quotas are bounded by their domain: the sum over all projects of
//! a domain may not exceed the domain quota, and a project quota may not
//! drop below current usage. Committed quotas are pushed to the backend
//! afterwards; a failed push leaves the committed quota in place.

use super::{quota_resource_info, EditBatch, QuotaEditor, QuotaRequest, ACCEPTED_STATUS, REJECTED_STATUS};
use crate::audit::QuotaEventTarget;
use crate::domain::ports::{RequestContext, Token};
use crate::error::{Error, Result};
use std::collections::BTreeSet;
use tracing::{info, warn};

pub const RULE_RAISE: &str = "project:raise";
pub const RULE_LOWER: &str = "project:lower";

/// Result of a committed project edit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectEditOutcome {
    /// Backend pushes that failed; the database already holds the new quotas
    pub backend_errors: Vec<String>,
}

impl ProjectEditOutcome {
    pub fn is_applied(&self) -> bool {
        self.backend_errors.is_empty()
    }
}

impl QuotaEditor {
    /// Apply a project quota request and push the result to the backends
    pub async fn set_project_quotas(
        &self,
        domain_uuid: &str,
        project_uuid: &str,
        request: &QuotaRequest,
        token: &Token,
        ctx: &RequestContext,
    ) -> Result<ProjectEditOutcome> {
        let can_raise = token.check(RULE_RAISE);
        let can_lower = token.check(RULE_LOWER);
        if !can_raise && !can_lower {
            return Err(Error::Forbidden {
                rule: RULE_RAISE.to_string(),
            });
        }

        let mut tx = self.store.begin().await?;
        let domain = tx
            .domain_by_uuid(self.cluster_id(), domain_uuid)
            .ok_or_else(|| Error::not_found("domain", domain_uuid))?;
        let project = tx
            .project_by_uuid(domain.id, project_uuid)
            .ok_or_else(|| Error::not_found("project", project_uuid))?;

        let mut batch = EditBatch::new();
        let mut writes = Vec::new();

        for (service_type, resources) in request {
            for (resource_name, value) in resources {
                let mut target = QuotaEventTarget {
                    domain_id: domain.uuid.clone(),
                    project_id: project.uuid.clone(),
                    service_type: service_type.clone(),
                    resource_name: resource_name.clone(),
                    ..Default::default()
                };
                let mut reject = |target: QuotaEventTarget, reason: String| {
                    batch.errors.push(format!(
                        "cannot change {}/{} quota: {}",
                        service_type, resource_name, reason
                    ));
                    batch.rejected.push(QuotaEventTarget {
                        reject_reason: reason,
                        ..target
                    });
                };

                let info = match quota_resource_info(self.drivers(), service_type, resource_name) {
                    Ok(info) => info,
                    Err(reason) => {
                        reject(target, reason);
                        continue;
                    }
                };
                target.unit = info.unit;

                let existing = tx
                    .project_service(project.id, service_type)
                    .and_then(|s| tx.project_resource(s.id, resource_name));
                let Some(mut resource) = existing else {
                    reject(target, "no such resource".to_string());
                    continue;
                };
                let old_quota = resource.quota.unwrap_or(0);
                target.old_quota = old_quota;

                if info.externally_managed {
                    reject(target, "quota for this resource is managed externally".to_string());
                    continue;
                }

                let new_quota = match value.to_canonical(info.unit) {
                    Ok(quota) => quota,
                    Err(e) => {
                        reject(target, e.to_string());
                        continue;
                    }
                };
                target.new_quota = new_quota;
                if new_quota == old_quota {
                    continue;
                }

                if new_quota > old_quota {
                    if !can_raise {
                        reject(target, "user is not allowed to raise quotas in this project".to_string());
                        continue;
                    }
                    let domain_quota = tx
                        .domain_service(domain.id, service_type)
                        .and_then(|s| tx.domain_resource(s.id, resource_name))
                        .map_or(0, |r| r.quota);
                    let projects_quota: u64 = tx
                        .project_resources_in_domain(domain.id, service_type, resource_name)
                        .iter()
                        .filter_map(|r| r.quota)
                        .sum();
                    let others = projects_quota.saturating_sub(old_quota);
                    if others.saturating_add(new_quota) > domain_quota {
                        reject(
                            target,
                            format!(
                                "domain quota exceeded (maximum acceptable project quota is {})",
                                info.unit.format(domain_quota.saturating_sub(others))
                            ),
                        );
                        continue;
                    }
                } else {
                    if !can_lower {
                        reject(target, "user is not allowed to lower quotas in this project".to_string());
                        continue;
                    }
                    if new_quota < resource.usage {
                        reject(
                            target,
                            format!(
                                "quota may not be lower than current usage ({})",
                                info.unit.format(resource.usage)
                            ),
                        );
                        continue;
                    }
                }

                resource.quota = Some(new_quota);
                resource.desired_backend_quota = Some(new_quota);
                writes.push((service_type.clone(), resource));
                batch.accepted.push(target);
            }
        }

        if batch.has_errors() {
            tx.rollback();
            self.emit(ctx, token, REJECTED_STATUS, &batch.rejected).await;
            return Err(Error::Validation(batch.errors));
        }

        let mut touched = BTreeSet::new();
        for (service_type, resource) in writes {
            tx.save_project_resource(resource);
            touched.insert(service_type);
        }
        tx.commit()?;

        for target in &batch.accepted {
            info!(
                "Set quota {}/{} = {} -> {} for project {} by user {} ({})",
                target.service_type,
                target.resource_name,
                target.old_quota,
                target.new_quota,
                project.uuid,
                token.user_id,
                token.user_name
            );
        }
        self.emit(ctx, token, ACCEPTED_STATUS, &batch.accepted).await;

        let mut outcome = ProjectEditOutcome::default();
        for service_type in touched {
            if let Err(e) = self.reconciler.apply_project_quota(project.id, &service_type).await {
                warn!(
                    "Failed to apply {} quota of project {} to backend: {}",
                    service_type, project.uuid, e
                );
                outcome
                    .backend_errors
                    .push(format!("could not apply {} quota to backend: {}", service_type, e));
            }
        }
        Ok(outcome)
    }
}
