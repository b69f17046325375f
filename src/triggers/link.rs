//! Link lifecycle trigger.

use serde::{Deserialize, Serialize};

use super::{TriggerReport, Triggers};
use crate::assignment::{Action, RequestContext};
use crate::error::Result;
use crate::link::Link;

/// Change feed of the link store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LinkEvent {
    Created { link: Link },
    Deleted { link: Link },
}

impl LinkEvent {
    pub fn link(&self) -> &Link {
        match self {
            LinkEvent::Created { link } | LinkEvent::Deleted { link } => link,
        }
    }

    pub fn action(&self) -> Action {
        match self {
            LinkEvent::Created { .. } => Action::Create,
            LinkEvent::Deleted { .. } => Action::Delete,
        }
    }
}

impl Triggers {
    /// Apply a link change to the store, then route the link with the
    /// matching action if its permission set and principal resolve.
    pub async fn handle_link_event(
        &self,
        event: &LinkEvent,
        context: RequestContext,
    ) -> TriggerReport {
        let result = self
            .bounded("link", self.apply_link_event(event, &context))
            .await;
        self.guard("link", event, &context, result).await
    }

    async fn apply_link_event(
        &self,
        event: &LinkEvent,
        context: &RequestContext,
    ) -> Result<TriggerReport> {
        let link = event.link();
        match event {
            LinkEvent::Created { .. } => self.links.put(link.clone())?,
            LinkEvent::Deleted { .. } => {
                self.links.remove(&link.id())?;
            }
        }
        tracing::info!(link = %link.id(), action = %event.action(), "link changed");

        let mut report = TriggerReport::default();
        match self.resolve_link(link, event.action(), context).await? {
            Some(request) => report.record(self.router.route(request).await?),
            None => report.deferred += 1,
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixture::{Fixture, READ_ONLY_ID};
    use super::*;
    use crate::assignment::PrincipalType;
    use crate::catalog::{LinkStore, PermissionSetCatalog};
    use crate::link::Scope;

    fn created(descriptor: &str) -> LinkEvent {
        LinkEvent::Created {
            link: Link::parse(descriptor, PrincipalType::Group).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_account_link_dispatches_once() {
        let mut f = Fixture::new();
        f.provision("ReadOnly", READ_ONLY_ID);
        f.cache_group("Engineers", "g-1");

        let ctx = RequestContext::root();
        let report = f
            .triggers
            .handle_link_event(&created("account.123456789012.ReadOnly.Engineers.ssofile"), ctx)
            .await;
        assert_eq!(report.dispatched, 1);

        let dispatches = f.drain_dispatches();
        assert_eq!(dispatches.len(), 1);
        let d = &dispatches[0];
        assert_eq!(d.principal_id, "g-1");
        assert_eq!(d.target_account_id, "123456789012");
        assert_eq!(d.permission_set_id.as_str(), READ_ONLY_ID);
        assert_eq!(d.action, Action::Create);
        assert_eq!(d.context.caused_by, Some(ctx.request_id));
        assert_eq!(f.links.len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_carries_catalog_id_verbatim() {
        let mut f = Fixture::new();
        f.provision("ReadOnly", "ReadOnly-id");
        f.cache_group("Engineers", "g-1");

        f.triggers
            .handle_link_event(
                &created("account.123456789012.ReadOnly.Engineers.ssofile"),
                RequestContext::root(),
            )
            .await;
        let dispatches = f.drain_dispatches();
        assert_eq!(dispatches.len(), 1);
        assert_eq!(dispatches[0].principal_id, "g-1");
        assert_eq!(dispatches[0].target_account_id, "123456789012");
        assert_eq!(dispatches[0].permission_set_id.as_str(), "ReadOnly-id");
        assert_eq!(dispatches[0].action, Action::Create);
    }

    #[tokio::test]
    async fn test_ou_link_goes_to_expander() {
        let mut f = Fixture::new();
        f.provision("ReadOnly", READ_ONLY_ID);
        f.cache_group("Engineers", "g-1");

        let report = f
            .triggers
            .handle_link_event(
                &created("ou_id.ou-ab12-cdefgh34.ReadOnly.Engineers.ssofile"),
                RequestContext::root(),
            )
            .await;
        assert_eq!(report.expanding, 1);
        assert!(f.drain_dispatches().is_empty());
        let expansions = f.drain_expansions();
        assert_eq!(
            expansions[0].scope,
            Scope::Ou {
                ou_id: "ou-ab12-cdefgh34".into()
            }
        );
    }

    #[tokio::test]
    async fn test_unprovisioned_permission_set_defers() {
        let mut f = Fixture::new();
        f.catalog
            .put(crate::catalog::PermissionSetRecord::pending("ReadOnly"))
            .unwrap();
        f.cache_group("Engineers", "g-1");

        let report = f
            .triggers
            .handle_link_event(
                &created("account.123456789012.ReadOnly.Engineers.ssofile"),
                RequestContext::root(),
            )
            .await;
        assert_eq!(report.deferred, 1);
        assert!(!report.failed);
        assert!(f.drain_dispatches().is_empty());
        assert!(f.sink.is_empty());
        assert_eq!(f.links.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_principal_defers() {
        let mut f = Fixture::new();
        f.provision("ReadOnly", READ_ONLY_ID);
        let report = f
            .triggers
            .handle_link_event(
                &created("account.123456789012.ReadOnly.Engineers.ssofile"),
                RequestContext::root(),
            )
            .await;
        assert_eq!(report.deferred, 1);
        assert!(f.drain_dispatches().is_empty());
    }

    #[tokio::test]
    async fn test_deleted_link_dispatches_delete() {
        let mut f = Fixture::new();
        f.provision("ReadOnly", READ_ONLY_ID);
        f.cache_group("Engineers", "g-1");
        let link = f.add_link("account.123456789012.ReadOnly.Engineers.ssofile");

        f.triggers
            .handle_link_event(&LinkEvent::Deleted { link: link.clone() }, RequestContext::root())
            .await;
        let dispatches = f.drain_dispatches();
        assert_eq!(dispatches.len(), 1);
        assert_eq!(dispatches[0].action, Action::Delete);
        assert!(f.links.get(&link.id()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_management_account_link_is_excluded() {
        let mut f = Fixture::new();
        f.provision("ReadOnly", READ_ONLY_ID);
        f.cache_group("Engineers", "g-1");
        let report = f
            .triggers
            .handle_link_event(
                &created("account.111111111111.ReadOnly.Engineers.ssofile"),
                RequestContext::root(),
            )
            .await;
        assert_eq!(report.excluded, 1);
        assert!(f.drain_dispatches().is_empty());
    }

    #[test]
    fn test_event_json_shape() {
        let json = r#"{
            "type": "created",
            "link": {
                "descriptor": "root.all.ReadOnly.Auditors.ssofile",
                "principal_type": "GROUP"
            }
        }"#;
        let event: LinkEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.action(), Action::Create);
        assert_eq!(event.link().scope(), &Scope::Root);
    }
}
