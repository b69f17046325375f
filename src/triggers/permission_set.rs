//! Permission-set lifecycle trigger.

use serde::{Deserialize, Serialize};

use super::{TriggerReport, Triggers};
use crate::assignment::{Action, RequestContext};
use crate::catalog::{PermissionSetDiff, PermissionSetRecord};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PermissionSetEvent {
    /// A catalog record was written. `old` is the previous image when the
    /// feed provides one.
    Changed {
        #[serde(default)]
        old: Option<PermissionSetRecord>,
        new: PermissionSetRecord,
    },
    Deleted { name: String },
}

impl Triggers {
    pub async fn handle_permission_set_event(
        &self,
        event: &PermissionSetEvent,
        context: RequestContext,
    ) -> TriggerReport {
        let result = self
            .bounded("permission_set", self.apply_permission_set_event(event, &context))
            .await;
        self.guard("permission_set", event, &context, result).await
    }

    async fn apply_permission_set_event(
        &self,
        event: &PermissionSetEvent,
        context: &RequestContext,
    ) -> Result<TriggerReport> {
        let (old, new) = match event {
            PermissionSetEvent::Deleted { name } => {
                self.permission_sets.remove(name)?;
                tracing::info!(permission_set = %name, "permission set removed from catalog");
                return Ok(TriggerReport::default());
            }
            PermissionSetEvent::Changed { old, new } => (old, new),
        };

        let previous = self.permission_sets.put(new.clone())?;
        let old = old.as_ref().or(previous.as_ref());
        let diff = PermissionSetDiff::compute(old, new);

        if !diff.became_provisioned {
            tracing::info!(
                permission_set = %new.name,
                changed = ?diff.changed,
                "permission set updated, no new provisioning"
            );
            return Ok(TriggerReport::default());
        }

        let links = self.links.by_permission_set_name(&new.name)?;
        tracing::info!(
            permission_set = %new.name,
            links = links.len(),
            "permission set provisioned, releasing deferred links"
        );
        let mut report = TriggerReport::default();
        self.route_links("permission_set", &links, Action::Create, context, &mut report)
            .await;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixture::{Fixture, READ_ONLY_ID};
    use super::*;
    use crate::assignment::PermissionSetId;
    use crate::catalog::PermissionSetCatalog;
    use crate::clients::ApiError;
    use crate::config::{DirectoryConfig, DirectoryMode};

    fn provisioned() -> PermissionSetRecord {
        PermissionSetRecord::provisioned("ReadOnly", PermissionSetId::new(READ_ONLY_ID))
    }

    #[tokio::test]
    async fn test_deferred_links_released_on_provisioning() {
        let mut f = Fixture::new();
        f.cache_group("Engineers", "g-1");
        f.catalog.put(PermissionSetRecord::pending("ReadOnly")).unwrap();
        f.add_link("account.123456789012.ReadOnly.Engineers.ssofile");
        f.add_link("account.210987654321.ReadOnly.Engineers.ssofile");
        f.add_link("ou_id.ou-ab12-cdefgh34.ReadOnly.Engineers.ssofile");

        let report = f
            .triggers
            .handle_permission_set_event(
                &PermissionSetEvent::Changed {
                    old: None,
                    new: provisioned(),
                },
                RequestContext::root(),
            )
            .await;
        assert_eq!(report.dispatched, 2);
        assert_eq!(report.expanding, 1);
        assert_eq!(f.drain_dispatches().len(), 2);
        assert_eq!(
            f.catalog.get("ReadOnly").unwrap().unwrap().provisioned_id(),
            Some(&PermissionSetId::new(READ_ONLY_ID))
        );
    }

    #[tokio::test]
    async fn test_attribute_update_does_not_dispatch() {
        let mut f = Fixture::new();
        f.cache_group("Engineers", "g-1");
        f.provision("ReadOnly", READ_ONLY_ID);
        f.add_link("account.123456789012.ReadOnly.Engineers.ssofile");

        let mut updated = provisioned();
        updated.session_duration = Some("PT4H".into());
        let report = f
            .triggers
            .handle_permission_set_event(
                &PermissionSetEvent::Changed {
                    old: Some(provisioned()),
                    new: updated,
                },
                RequestContext::root(),
            )
            .await;
        assert_eq!(report, TriggerReport::default());
        assert!(f.drain_dispatches().is_empty());
    }

    #[tokio::test]
    async fn test_missing_old_image_falls_back_to_catalog() {
        let mut f = Fixture::new();
        f.cache_group("Engineers", "g-1");
        f.provision("ReadOnly", READ_ONLY_ID);
        f.add_link("account.123456789012.ReadOnly.Engineers.ssofile");

        f.triggers
            .handle_permission_set_event(
                &PermissionSetEvent::Changed {
                    old: None,
                    new: provisioned(),
                },
                RequestContext::root(),
            )
            .await;
        assert!(f.drain_dispatches().is_empty());
    }

    #[tokio::test]
    async fn test_deleted_permission_set_leaves_catalog() {
        let f = Fixture::new();
        f.provision("ReadOnly", READ_ONLY_ID);
        f.triggers
            .handle_permission_set_event(
                &PermissionSetEvent::Deleted {
                    name: "ReadOnly".into(),
                },
                RequestContext::root(),
            )
            .await;
        assert!(f.catalog.get("ReadOnly").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failing_link_does_not_block_the_others() {
        let mut f = Fixture::with_directory(DirectoryConfig {
            mode: DirectoryMode::Integrated,
            domain_name: Some("example.com".into()),
        });
        f.cache_group("Engineers", "g-1");
        f.catalog.put(PermissionSetRecord::pending("ReadOnly")).unwrap();
        f.add_link("account.123456789012.ReadOnly.Auditors.ssofile");
        f.add_link("account.123456789012.ReadOnly.Engineers.ssofile");
        f.add_link("account.210987654321.ReadOnly.Engineers.ssofile");
        f.directory.inject_failure(ApiError::AccessDenied {
            reason: "not authorized".into(),
        });

        let report = f
            .triggers
            .handle_permission_set_event(
                &PermissionSetEvent::Changed {
                    old: None,
                    new: provisioned(),
                },
                RequestContext::root(),
            )
            .await;
        assert_eq!(report.failed_links, 1);
        assert_eq!(report.dispatched, 2);
        assert!(!report.failed);

        let dispatches = f.drain_dispatches();
        assert!(dispatches.iter().all(|d| d.principal_id == "g-1"));

        let notifications = f.sink.notifications();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].handler, "permission_set");
        assert_eq!(
            notifications[0].event_detail["descriptor"],
            "account.123456789012.ReadOnly.Auditors.ssofile"
        );
    }
}
