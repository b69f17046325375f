//! Directory (principal) lifecycle trigger.

use serde::{Deserialize, Serialize};

use super::{TriggerReport, Triggers};
use crate::assignment::{Action, PrincipalType, RequestContext};
use crate::catalog::PrincipalCacheEntry;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PrincipalEvent {
    GroupCreated { group_id: String, display_name: String },
    /// The display name is optional; without it the name comes from the
    /// cache or the directory.
    GroupDeleted {
        group_id: String,
        #[serde(default)]
        display_name: Option<String>,
    },
    /// User events carry only the id; the name is described from the
    /// directory.
    UserCreated { user_id: String },
    UserDeleted {
        user_id: String,
        #[serde(default)]
        user_name: Option<String>,
    },
}

impl Triggers {
    pub async fn handle_principal_event(
        &self,
        event: &PrincipalEvent,
        context: RequestContext,
    ) -> TriggerReport {
        let result = self
            .bounded("principal", self.apply_principal_event(event, &context))
            .await;
        self.guard("principal", event, &context, result).await
    }

    async fn apply_principal_event(
        &self,
        event: &PrincipalEvent,
        context: &RequestContext,
    ) -> Result<TriggerReport> {
        match event {
            PrincipalEvent::GroupCreated {
                group_id,
                display_name,
            } => {
                self.principal_created(display_name, PrincipalType::Group, group_id, context)
                    .await
            }
            PrincipalEvent::UserCreated { user_id } => {
                let identity_store_id = &self.instance.get().await?.identity_store_id;
                let name = self
                    .directory
                    .describe_principal(identity_store_id, PrincipalType::User, user_id)
                    .await?;
                match name {
                    Some(name) => {
                        self.principal_created(&name, PrincipalType::User, user_id, context)
                            .await
                    }
                    None => {
                        tracing::warn!(%user_id, "created user not found in directory, ignoring");
                        Ok(TriggerReport::default())
                    }
                }
            }
            PrincipalEvent::GroupDeleted {
                group_id,
                display_name,
            } => {
                self.principal_deleted(PrincipalType::Group, group_id, display_name.as_deref())
                    .await
            }
            PrincipalEvent::UserDeleted { user_id, user_name } => {
                self.principal_deleted(PrincipalType::User, user_id, user_name.as_deref())
                    .await
            }
        }
    }

    async fn principal_created(
        &self,
        name: &str,
        principal_type: PrincipalType,
        principal_id: &str,
        context: &RequestContext,
    ) -> Result<TriggerReport> {
        self.principals.upsert(PrincipalCacheEntry {
            principal_name: name.to_string(),
            principal_type,
            principal_id: principal_id.to_string(),
        })?;

        let links = self.links.by_principal(name, principal_type)?;
        tracing::info!(
            principal = name,
            %principal_type,
            links = links.len(),
            "principal created, re-evaluating links"
        );

        let mut report = TriggerReport::default();
        self.route_links("principal", &links, Action::Create, context, &mut report)
            .await;
        Ok(report)
    }

    /// Links naming a deleted principal can never resolve again, so they are
    /// removed whether or not the principal was ever cached. Confirmed
    /// assignments are left in place.
    async fn principal_deleted(
        &self,
        principal_type: PrincipalType,
        principal_id: &str,
        name_hint: Option<&str>,
    ) -> Result<TriggerReport> {
        let cached = self.principals.remove_by_id(principal_id)?;
        let name = match (cached, name_hint) {
            (Some(entry), _) => Some(entry.principal_name),
            (None, Some(name)) => Some(name.to_string()),
            (None, None) => {
                let identity_store_id = &self.instance.get().await?.identity_store_id;
                self.directory
                    .describe_principal(identity_store_id, principal_type, principal_id)
                    .await?
            }
        };
        let Some(name) = name else {
            tracing::info!(
                principal_id,
                %principal_type,
                "deleted principal has no known name, nothing to do"
            );
            return Ok(TriggerReport::default());
        };

        let links = self.links.by_principal(&name, principal_type)?;
        let mut report = TriggerReport::default();
        for link in &links {
            if self.links.remove(&link.id())?.is_some() {
                report.links_removed += 1;
            }
        }

        tracing::warn!(
            principal = %name,
            principal_id,
            links_removed = report.links_removed,
            "principal deleted; its confirmed assignments are not revoked"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixture::{Fixture, READ_ONLY_ID};
    use super::*;
    use crate::catalog::{LinkStore, PrincipalCache};

    #[tokio::test]
    async fn test_group_created_reemits_links() {
        let mut f = Fixture::new();
        f.provision("ReadOnly", READ_ONLY_ID);
        f.add_link("account.123456789012.ReadOnly.Engineers.ssofile");
        f.add_link("account.210987654321.ReadOnly.Engineers.ssofile");
        f.add_link("account.123456789012.ReadOnly.Auditors.ssofile");

        let report = f
            .triggers
            .handle_principal_event(
                &PrincipalEvent::GroupCreated {
                    group_id: "g-1".into(),
                    display_name: "Engineers".into(),
                },
                RequestContext::root(),
            )
            .await;
        assert_eq!(report.dispatched, 2);
        let dispatches = f.drain_dispatches();
        assert!(dispatches.iter().all(|d| d.principal_id == "g-1"));
        assert!(dispatches.iter().all(|d| d.action == Action::Create));
        assert_eq!(
            f.cache.get("Engineers", PrincipalType::Group).unwrap().as_deref(),
            Some("g-1")
        );
    }

    #[tokio::test]
    async fn test_group_created_still_gated_on_permission_set() {
        let mut f = Fixture::new();
        f.add_link("account.123456789012.ReadOnly.Engineers.ssofile");
        let report = f
            .triggers
            .handle_principal_event(
                &PrincipalEvent::GroupCreated {
                    group_id: "g-1".into(),
                    display_name: "Engineers".into(),
                },
                RequestContext::root(),
            )
            .await;
        assert_eq!(report.deferred, 1);
        assert!(f.drain_dispatches().is_empty());
    }

    #[tokio::test]
    async fn test_user_created_describes_name() {
        let mut f = Fixture::new();
        f.provision("ReadOnly", READ_ONLY_ID);
        f.directory.add_principal(PrincipalType::User, "jane.doe", "u-1");
        let link = crate::link::Link::parse(
            "account.123456789012.ReadOnly.jane.doe.ssofile",
            PrincipalType::User,
        )
        .unwrap();
        f.links.put(link).unwrap();

        let report = f
            .triggers
            .handle_principal_event(
                &PrincipalEvent::UserCreated {
                    user_id: "u-1".into(),
                },
                RequestContext::root(),
            )
            .await;
        assert_eq!(report.dispatched, 1);
        assert_eq!(f.drain_dispatches()[0].principal_id, "u-1");
    }

    #[tokio::test]
    async fn test_group_deleted_removes_its_links() {
        let mut f = Fixture::new();
        f.provision("ReadOnly", READ_ONLY_ID);
        f.cache_group("Engineers", "g-1");
        f.add_link("account.123456789012.ReadOnly.Engineers.ssofile");
        f.add_link("ou_id.ou-ab12-cdefgh34.ReadOnly.Engineers.ssofile");
        f.add_link("account.123456789012.ReadOnly.Auditors.ssofile");

        let report = f
            .triggers
            .handle_principal_event(
                &PrincipalEvent::GroupDeleted {
                    group_id: "g-1".into(),
                    display_name: None,
                },
                RequestContext::root(),
            )
            .await;
        assert_eq!(report.links_removed, 2);
        assert_eq!(report.dispatched, 0);
        assert_eq!(f.links.len(), 1);
        assert!(f.cache.get_by_id("g-1").unwrap().is_none());
        assert!(f.drain_dispatches().is_empty());
    }

    #[tokio::test]
    async fn test_directory_failure_reported_to_sink() {
        let f = Fixture::new();
        f.directory.inject_failure(crate::clients::ApiError::AccessDenied {
            reason: "no".into(),
        });
        let report = f
            .triggers
            .handle_principal_event(
                &PrincipalEvent::UserCreated {
                    user_id: "u-1".into(),
                },
                RequestContext::root(),
            )
            .await;
        assert!(report.failed);
        assert_eq!(f.sink.len(), 1);
        assert_eq!(f.sink.notifications()[0].handler, "principal");
        assert_eq!(f.sink.notifications()[0].event_detail["user_id"], "u-1");
    }

    #[tokio::test]
    async fn test_uncached_group_deletion_uses_event_name() {
        let mut f = Fixture::new();
        f.provision("ReadOnly", READ_ONLY_ID);
        f.add_link("account.123456789012.ReadOnly.Engineers.ssofile");
        f.add_link("root.all.ReadOnly.Engineers.ssofile");
        f.add_link("account.123456789012.ReadOnly.Auditors.ssofile");

        let report = f
            .triggers
            .handle_principal_event(
                &PrincipalEvent::GroupDeleted {
                    group_id: "g-9".into(),
                    display_name: Some("Engineers".into()),
                },
                RequestContext::root(),
            )
            .await;
        assert_eq!(report.links_removed, 2);
        assert!(f
            .links
            .by_principal("Engineers", PrincipalType::Group)
            .unwrap()
            .is_empty());
        assert_eq!(f.links.len(), 1);
        assert!(f.drain_dispatches().is_empty());
    }

    #[tokio::test]
    async fn test_uncached_user_deletion_describes_name() {
        let f = Fixture::new();
        f.directory.add_principal(PrincipalType::User, "jane.doe", "u-1");
        let link = crate::link::Link::parse(
            "account.123456789012.ReadOnly.jane.doe.ssofile",
            PrincipalType::User,
        )
        .unwrap();
        f.links.put(link).unwrap();

        let report = f
            .triggers
            .handle_principal_event(
                &PrincipalEvent::UserDeleted {
                    user_id: "u-1".into(),
                    user_name: None,
                },
                RequestContext::root(),
            )
            .await;
        assert_eq!(report.links_removed, 1);
        assert!(f.links.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_deleted_principal_is_noop() {
        let f = Fixture::new();
        f.add_link("account.123456789012.ReadOnly.Engineers.ssofile");
        let report = f
            .triggers
            .handle_principal_event(
                &PrincipalEvent::GroupDeleted {
                    group_id: "g-404".into(),
                    display_name: None,
                },
                RequestContext::root(),
            )
            .await;
        assert_eq!(report, TriggerReport::default());
        assert_eq!(f.links.len(), 1);
    }
}
