//! Domain quota edits
//!
//! Raising a domain quota only needs permission; capacity is advisory and
//! does not cap it. Lowering additionally requires that the domain quota
//! stays at or above the sum of the quotas its projects hold.

use super::{quota_resource_info, report, EditBatch, QuotaEditor, QuotaRequest, ACCEPTED_STATUS, REJECTED_STATUS};
use crate::audit::QuotaEventTarget;
use crate::domain::ports::{RequestContext, Token};
use crate::error::{Error, Result};
use tracing::{info, warn};

pub const RULE_RAISE: &str = "domain:raise";
pub const RULE_LOWER: &str = "domain:lower";
/// Allows lowering below the sum of project quotas when explicitly requested
pub const RULE_LOWER_OVERRIDE: &str = "domain:lower_override";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DomainQuotaOptions {
    /// Skip the project quota check on lowering; needs `domain:lower_override`
    pub bypass_project_check: bool,
}

impl QuotaEditor {
    /// Apply a domain quota request and return the resulting report
    pub async fn set_domain_quotas(
        &self,
        domain_uuid: &str,
        request: &QuotaRequest,
        options: DomainQuotaOptions,
        token: &Token,
        ctx: &RequestContext,
    ) -> Result<report::DomainReport> {
        let can_raise = token.check(RULE_RAISE);
        let can_lower = token.check(RULE_LOWER);
        if !can_raise && !can_lower {
            return Err(Error::Forbidden {
                rule: RULE_RAISE.to_string(),
            });
        }
        if options.bypass_project_check && !token.check(RULE_LOWER_OVERRIDE) {
            return Err(Error::Forbidden {
                rule: RULE_LOWER_OVERRIDE.to_string(),
            });
        }

        let mut tx = self.store.begin().await?;
        let domain = tx
            .domain_by_uuid(self.cluster_id(), domain_uuid)
            .ok_or_else(|| Error::not_found("domain", domain_uuid))?;

        // read inside the transaction that performs the writes
        let before = report::build_domain_report(&tx, self.drivers(), &domain);

        let mut batch = EditBatch::new();
        let mut writes = Vec::new();

        for (service_type, resources) in request {
            for (resource_name, value) in resources {
                let mut target = QuotaEventTarget {
                    domain_id: domain.uuid.clone(),
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
                    .domain_service(domain.id, service_type)
                    .and_then(|s| tx.domain_resource(s.id, resource_name));
                let Some(mut resource) = existing else {
                    reject(target, "no such resource".to_string());
                    continue;
                };
                target.old_quota = resource.quota;

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
                if new_quota == resource.quota {
                    continue;
                }

                if new_quota > resource.quota {
                    if !can_raise {
                        reject(target, "user is not allowed to raise quotas in this domain".to_string());
                        continue;
                    }
                } else {
                    if !can_lower {
                        reject(target, "user is not allowed to lower quotas in this domain".to_string());
                        continue;
                    }
                    let projects_quota = before
                        .services
                        .get(service_type)
                        .and_then(|s| s.resources.get(resource_name))
                        .map_or(0, |r| r.projects_quota);
                    if new_quota < projects_quota {
                        if options.bypass_project_check {
                            warn!(
                                "Lowering {}/{} quota of domain {} below project quotas ({}) by override of {}",
                                service_type,
                                resource_name,
                                domain.uuid,
                                info.unit.format(projects_quota),
                                token.user_id
                            );
                        } else {
                            reject(
                                target,
                                format!(
                                    "domain quota may not be smaller than sum of project quotas in that domain ({})",
                                    info.unit.format(projects_quota)
                                ),
                            );
                            continue;
                        }
                    }
                }

                resource.quota = new_quota;
                writes.push(resource);
                batch.accepted.push(target);
            }
        }

        if batch.has_errors() {
            tx.rollback();
            self.emit(ctx, token, REJECTED_STATUS, &batch.rejected).await;
            return Err(Error::Validation(batch.errors));
        }

        for resource in writes {
            tx.save_domain_resource(resource);
        }
        let after = report::build_domain_report(&tx, self.drivers(), &domain);
        tx.commit()?;

        for target in &batch.accepted {
            info!(
                "Set quota {}/{} = {} -> {} for domain {} by user {} ({})",
                target.service_type,
                target.resource_name,
                target.old_quota,
                target.new_quota,
                domain.uuid,
                token.user_id,
                token.user_name
            );
        }
        self.emit(ctx, token, ACCEPTED_STATUS, &batch.accepted).await;

        Ok(after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditPipeline, Observer};
    use crate::domain::model::{DomainResource, ProjectResource, RowId};
    use crate::domain::units::{InputValue, Unit, ValueWithUnit};
    use crate::edits::QuotaEditor;
    use crate::metrics::EngineMetrics;
    use crate::store::HierarchyStore;
    use crate::testing::{request, token_with, FakeQuotaDriver, RecordingSink, TestCluster};
    use assert_matches::assert_matches;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        store: Arc<HierarchyStore>,
        sink: Arc<RecordingSink>,
        editor: QuotaEditor,
        domain_id: RowId,
    }

    /// Domain d-1 with things quota 20 and projects holding 10 and 5
    async fn fixture() -> Fixture {
        let store = HierarchyStore::with_schema_version(1);
        let cluster = TestCluster::new("west").service("shared", Arc::new(FakeQuotaDriver::new("shared")), false);
        let reconciler = Arc::new(cluster.reconciler(store.clone()));

        let metrics = Arc::new(EngineMetrics::new().unwrap());
        let sink = Arc::new(RecordingSink::default());
        let mut audit = AuditPipeline::new(Observer::new("test"), metrics);
        audit.enable_cluster("west", sink.clone(), true);

        let domain_id = {
            let mut tx = store.begin().await.unwrap();
            let domain = tx.insert_domain("west", "d-1", "alpha").unwrap();
            let service = tx.insert_domain_service(domain.id, "shared").unwrap();
            for (name, quota) in [("things", 20), ("capacity", 1 << 30), ("external_things", 3)] {
                tx.save_domain_resource(DomainResource {
                    service_id: service.id,
                    name: name.into(),
                    quota,
                });
            }
            for (uuid, quota) in [("p-1", 10), ("p-2", 5)] {
                let project = tx.insert_project(domain.id, uuid, uuid, None).unwrap();
                let service = tx.insert_project_service(project.id, "shared").unwrap();
                let mut things = ProjectResource::new(service.id, "things", true);
                things.quota = Some(quota);
                tx.save_project_resource(things);
            }
            tx.commit().unwrap();
            domain.id
        };

        Fixture {
            editor: QuotaEditor::new(store.clone(), reconciler, Arc::new(audit)),
            store,
            sink,
            domain_id,
        }
    }

    fn quota_request(items: &[(&str, InputValue)]) -> QuotaRequest {
        BTreeMap::from([(
            "shared".to_string(),
            items
                .iter()
                .map(|(name, value)| (name.to_string(), value.clone()))
                .collect(),
        )])
    }

    async fn domain_quota(f: &Fixture, name: &str) -> u64 {
        let tx = f.store.begin().await.unwrap();
        let service = tx.domain_service(f.domain_id, "shared").unwrap();
        let quota = tx.domain_resource(service.id, name).unwrap().quota;
        tx.rollback();
        quota
    }

    async fn wait_for_events(sink: &RecordingSink, count: usize) {
        for _ in 0..200 {
            if sink.events().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} audit events", count);
    }

    #[tokio::test]
    async fn test_lowering_below_project_sum_is_rejected() {
        let f = fixture().await;
        let token = token_with(&[RULE_RAISE, RULE_LOWER]);

        let err = f
            .editor
            .set_domain_quotas(
                "d-1",
                &quota_request(&[("things", InputValue::Number(12))]),
                DomainQuotaOptions::default(),
                &token,
                &request("/v1/domains/d-1"),
            )
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot change shared/things quota: domain quota may not be smaller than sum of project quotas in that domain (15)"
        );
        assert_eq!(domain_quota(&f, "things").await, 20);

        wait_for_events(&f.sink, 1).await;
        let event = &f.sink.events()[0];
        assert_eq!(event.outcome, "failure");
        assert_eq!(event.reason.reason_code, "422");
        assert!(event.target.attachments[0].content.contains("rejectReason"));
    }

    #[tokio::test]
    async fn test_lowering_to_project_sum_or_above_succeeds() {
        let f = fixture().await;
        let token = token_with(&[RULE_LOWER]);

        let report = f
            .editor
            .set_domain_quotas(
                "d-1",
                &quota_request(&[("things", InputValue::Number(16))]),
                DomainQuotaOptions::default(),
                &token,
                &request("/v1/domains/d-1"),
            )
            .await
            .unwrap();
        assert_eq!(report.services["shared"].resources["things"].quota, Some(16));
        assert_eq!(domain_quota(&f, "things").await, 16);

        wait_for_events(&f.sink, 1).await;
        let event = &f.sink.events()[0];
        assert_eq!(event.outcome, "success");
        assert_eq!(event.target.attachments[0].content, r#"{"oldQuota":20,"newQuota":16}"#);
    }

    #[tokio::test]
    async fn test_request_is_all_or_nothing() {
        let f = fixture().await;
        let token = token_with(&[RULE_RAISE, RULE_LOWER]);
        let request_body = quota_request(&[
            ("capacity", InputValue::Text("2 GiB".into())),
            ("things", InputValue::Number(1)),
        ]);

        let err = f
            .editor
            .set_domain_quotas("d-1", &request_body, DomainQuotaOptions::default(), &token, &request("/"))
            .await
            .unwrap_err();
        assert_matches!(&err, Error::Validation(messages) if messages.len() == 1);
        assert!(err.to_string().starts_with("cannot change shared/things quota"));

        assert_eq!(domain_quota(&f, "capacity").await, 1 << 30);
        assert_eq!(domain_quota(&f, "things").await, 20);
    }

    #[tokio::test]
    async fn test_permissions_per_direction() {
        let f = fixture().await;

        let raise_only = token_with(&[RULE_RAISE]);
        let err = f
            .editor
            .set_domain_quotas("d-1", &quota_request(&[("things", InputValue::Number(18))]), Default::default(), &raise_only, &request("/"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("user is not allowed to lower quotas"));

        let raised = f
            .editor
            .set_domain_quotas("d-1", &quota_request(&[("things", InputValue::Number(500))]), Default::default(), &raise_only, &request("/"))
            .await
            .unwrap();
        assert_eq!(raised.services["shared"].resources["things"].quota, Some(500));

        let nobody = token_with(&[]);
        assert_matches!(
            f.editor
                .set_domain_quotas("d-1", &quota_request(&[]), Default::default(), &nobody, &request("/"))
                .await,
            Err(Error::Forbidden { .. })
        );
    }

    #[tokio::test]
    async fn test_validation_collects_every_problem() {
        let f = fixture().await;
        let token = token_with(&[RULE_RAISE, RULE_LOWER]);
        let request_body = quota_request(&[
            ("capacity", InputValue::Structured(ValueWithUnit::new(1536, Unit::Mebibytes))),
            ("external_things", InputValue::Number(10)),
            ("capacity_portion", InputValue::Number(1)),
            ("nonexistent", InputValue::Number(1)),
            ("things", InputValue::Number(3)),
        ]);

        let err = f
            .editor
            .set_domain_quotas("d-1", &request_body, Default::default(), &token, &request("/"))
            .await
            .unwrap_err();
        let messages = err.messages();
        assert_eq!(messages.len(), 4);
        assert!(messages.iter().any(|m| m.contains("quota for this resource is managed externally")));
        assert!(messages.iter().any(|m| m.contains("resource does not track quota")));
        assert!(messages.iter().any(|m| m.contains("no such resource")));
        assert!(messages.iter().any(|m| m.contains("sum of project quotas")));
        // 1536 MiB is exactly representable in bytes
        assert!(!messages.iter().any(|m| m.contains("shared/capacity ")));

        assert_matches!(
            f.editor
                .set_domain_quotas(
                    "d-1",
                    &BTreeMap::from([("dns".to_string(), BTreeMap::from([("zones".to_string(), InputValue::Number(1))]))]),
                    Default::default(),
                    &token,
                    &request("/"),
                )
                .await,
            Err(Error::Validation(messages)) if messages == vec!["cannot change dns/zones quota: no such service".to_string()]
        );
    }

    #[tokio::test]
    async fn test_override_allows_lowering_below_projects() {
        let f = fixture().await;
        let options = DomainQuotaOptions {
            bypass_project_check: true,
        };

        let plain = token_with(&[RULE_LOWER]);
        assert_matches!(
            f.editor
                .set_domain_quotas("d-1", &quota_request(&[("things", InputValue::Number(12))]), options, &plain, &request("/"))
                .await,
            Err(Error::Forbidden { .. })
        );

        let privileged = token_with(&[RULE_LOWER, RULE_LOWER_OVERRIDE]);
        f.editor
            .set_domain_quotas("d-1", &quota_request(&[("things", InputValue::Number(12))]), options, &privileged, &request("/"))
            .await
            .unwrap();
        assert_eq!(domain_quota(&f, "things").await, 12);
    }

    #[tokio::test]
    async fn test_unknown_domain() {
        let f = fixture().await;
        let token = token_with(&[RULE_RAISE]);
        assert_matches!(
            f.editor
                .set_domain_quotas("d-9", &quota_request(&[]), Default::default(), &token, &request("/"))
                .await,
            Err(Error::NotFound { .. })
        );
    }
}
