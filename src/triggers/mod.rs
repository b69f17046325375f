//! The four event triggers and the routing they share.
//!
//! Every trigger resolves the permission set and principal of each affected
//! link, then routes it: account scopes go straight to dispatch, other
//! scopes go to the expander. A link whose permission set or principal is
//! not yet resolvable is deferred, not failed. Handlers never return an
//! error: failures are published to the error sink with the full event.

pub mod link;
pub mod org;
pub mod permission_set;
pub mod principal;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::assignment::{Action, DispatchRequest, RequestContext};
use crate::catalog::{LinkStore, PermissionSetCatalog, PrincipalCache};
use crate::clients::{DirectoryApi, InstanceLocator, OrganizationApi};
use crate::config::{DirectoryConfig, TraversalDepth};
use crate::directory::DirectoryResolver;
use crate::error::{ReconcileError, Result};
use crate::expand::ExpandRequest;
use crate::ledger::LedgerReader;
use crate::link::Link;
use crate::notify::Notifier;

pub use link::LinkEvent;
pub use org::OrgEvent;
pub use permission_set::PermissionSetEvent;
pub use principal::PrincipalEvent;

/// Any lifecycle notification the reconciler accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum Event {
    Link(LinkEvent),
    Principal(PrincipalEvent),
    PermissionSet(PermissionSetEvent),
    Org(OrgEvent),
}

/// Where a resolved link went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    Dispatched,
    Expanding,
    Excluded,
}

/// Sends resolved work to the next stage.
#[derive(Clone)]
pub struct Router {
    expand: mpsc::Sender<ExpandRequest>,
    dispatch: mpsc::Sender<DispatchRequest>,
    management_account_id: Option<String>,
}

impl Router {
    pub fn new(
        expand: mpsc::Sender<ExpandRequest>,
        dispatch: mpsc::Sender<DispatchRequest>,
        management_account_id: Option<String>,
    ) -> Self {
        Self {
            expand,
            dispatch,
            management_account_id,
        }
    }

    /// Account scopes dispatch immediately; everything else expands.
    pub async fn route(&self, request: ExpandRequest) -> Result<Routed> {
        match request.direct_target() {
            Some(target) => {
                let request = target.into_dispatch(self.management_account());
                self.send_dispatch(request).await
            }
            None => {
                self.expand
                    .send(request)
                    .await
                    .map_err(|_| ReconcileError::ChannelClosed {
                        stage: "expand".into(),
                    })?;
                Ok(Routed::Expanding)
            }
        }
    }

    /// Dispatch a link's assignment for one known account, bypassing
    /// expansion. Used for incremental organization changes.
    pub async fn route_to_account(
        &self,
        request: &ExpandRequest,
        account_id: &str,
    ) -> Result<Routed> {
        let target = request.target(account_id.to_string());
        self.send_dispatch(target.into_dispatch(self.management_account()))
            .await
    }

    /// Send an already-resolved dispatch request.
    pub async fn send_dispatch(&self, request: Option<DispatchRequest>) -> Result<Routed> {
        let Some(request) = request else {
            return Ok(Routed::Excluded);
        };
        self.dispatch
            .send(request)
            .await
            .map_err(|_| ReconcileError::ChannelClosed {
                stage: "dispatch".into(),
            })?;
        Ok(Routed::Dispatched)
    }

    fn management_account(&self) -> Option<&str> {
        self.management_account_id.as_deref()
    }
}

/// Counts of what one trigger invocation produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TriggerReport {
    pub dispatched: usize,
    pub expanding: usize,
    pub excluded: usize,
    pub deferred: usize,
    pub links_removed: usize,

    /// Links whose resolution or routing failed and were reported.
    pub failed_links: usize,
    pub failed: bool,
}

impl TriggerReport {
    fn record(&mut self, routed: Routed) {
        match routed {
            Routed::Dispatched => self.dispatched += 1,
            Routed::Expanding => self.expanding += 1,
            Routed::Excluded => self.excluded += 1,
        }
    }
}

/// Shared collaborators of the four triggers.
pub struct Triggers {
    pub(crate) links: Arc<dyn LinkStore>,
    pub(crate) principals: Arc<dyn PrincipalCache>,
    pub(crate) permission_sets: Arc<dyn PermissionSetCatalog>,
    pub(crate) ledger: Arc<dyn LedgerReader>,
    pub(crate) directory: Arc<dyn DirectoryApi>,
    pub(crate) organization: Arc<dyn OrganizationApi>,
    pub(crate) instance: Arc<InstanceLocator>,
    pub(crate) depth: TraversalDepth,
    pub(crate) resolver: DirectoryResolver,
    pub(crate) router: Router,
    pub(crate) notifier: Notifier,
    pub(crate) resolution_timeout: Duration,
}

#[derive(Clone)]
pub struct TriggerDeps {
    pub links: Arc<dyn LinkStore>,
    pub principals: Arc<dyn PrincipalCache>,
    pub permission_sets: Arc<dyn PermissionSetCatalog>,
    pub ledger: Arc<dyn LedgerReader>,
    pub directory: Arc<dyn DirectoryApi>,
    pub organization: Arc<dyn OrganizationApi>,
    pub instance: Arc<InstanceLocator>,
}

impl Triggers {
    pub fn new(
        deps: TriggerDeps,
        directory_config: DirectoryConfig,
        depth: TraversalDepth,
        router: Router,
        notifier: Notifier,
        resolution_timeout: Duration,
    ) -> Self {
        let resolver = DirectoryResolver::new(
            deps.principals.clone(),
            deps.directory.clone(),
            deps.instance.clone(),
            directory_config,
        );
        Self {
            links: deps.links,
            principals: deps.principals,
            permission_sets: deps.permission_sets,
            ledger: deps.ledger,
            directory: deps.directory,
            organization: deps.organization,
            instance: deps.instance,
            depth,
            resolver,
            router,
            notifier,
            resolution_timeout,
        }
    }

    /// Dispatch an event to its trigger.
    pub async fn handle(&self, event: &Event, context: RequestContext) -> TriggerReport {
        match event {
            Event::Link(e) => self.handle_link_event(e, context).await,
            Event::Principal(e) => self.handle_principal_event(e, context).await,
            Event::PermissionSet(e) => self.handle_permission_set_event(e, context).await,
            Event::Org(e) => self.handle_org_event(e, context).await,
        }
    }

    /// Resolve a link's permission set and principal. `None` defers it.
    pub(crate) async fn resolve_link(
        &self,
        link: &Link,
        action: Action,
        context: &RequestContext,
    ) -> Result<Option<ExpandRequest>> {
        let permission_set_id = match self.permission_sets.get(link.permission_set_name())? {
            Some(record) => record.provisioned_id().cloned(),
            None => None,
        };
        let Some(permission_set_id) = permission_set_id else {
            tracing::info!(
                link = %link.id(),
                permission_set = link.permission_set_name(),
                "permission set not provisioned yet, deferring link"
            );
            return Ok(None);
        };

        let Some(principal_id) = self
            .resolver
            .resolve(link.principal_name(), link.principal_type)
            .await?
        else {
            tracing::info!(
                link = %link.id(),
                principal = link.principal_name(),
                "principal not resolvable yet, deferring link"
            );
            return Ok(None);
        };

        Ok(Some(ExpandRequest {
            scope: link.scope().clone(),
            principal_id,
            principal_type: link.principal_type,
            permission_set_id,
            action,
            context: context.child(),
        }))
    }

    /// Resolve and route every link, counting outcomes into `report`. Each
    /// link is reconciled on its own: a failure is reported with that link
    /// and the remaining links still go through.
    pub(crate) async fn route_links(
        &self,
        handler: &'static str,
        links: &[Link],
        action: Action,
        context: &RequestContext,
        report: &mut TriggerReport,
    ) {
        for link in links {
            let outcome = match self.resolve_link(link, action, context).await {
                Ok(Some(request)) => self.router.route(request).await.map(Some),
                Ok(None) => Ok(None),
                Err(e) => Err(e),
            };
            self.tally_link(handler, link, context, outcome, report)
                .await;
        }
    }

    pub(crate) async fn tally_link(
        &self,
        handler: &'static str,
        link: &Link,
        context: &RequestContext,
        outcome: Result<Option<Routed>>,
        report: &mut TriggerReport,
    ) {
        match outcome {
            Ok(Some(routed)) => report.record(routed),
            Ok(None) => report.deferred += 1,
            Err(e) => {
                report.failed_links += 1;
                tracing::error!(
                    handler,
                    link = %link.id(),
                    status = %crate::assignment::RequestStatus::FailedWithException,
                    "link reconciliation failed: {}",
                    e
                );
                self.notifier.report(handler, context, link, &e).await;
            }
        }
    }

    /// Run the synchronous part of a handler under the resolution bound.
    pub(crate) async fn bounded<T, F>(&self, stage: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.resolution_timeout, fut)
            .await
            .map_err(|_| ReconcileError::ResolutionTimeout {
                stage: stage.to_string(),
                timeout_secs: self.resolution_timeout.as_secs(),
            })?
    }

    /// Handler boundary: report failures with the whole event and return a
    /// report marked as failed.
    pub(crate) async fn guard<E: Serialize>(
        &self,
        handler: &'static str,
        event: &E,
        context: &RequestContext,
        result: Result<TriggerReport>,
    ) -> TriggerReport {
        match result {
            Ok(report) => {
                tracing::info!(
                    handler,
                    dispatched = report.dispatched,
                    expanding = report.expanding,
                    deferred = report.deferred,
                    failed_links = report.failed_links,
                    status = %crate::assignment::RequestStatus::Completed,
                    "event handled"
                );
                report
            }
            Err(e) => {
                tracing::error!(
                    handler,
                    status = %crate::assignment::RequestStatus::FailedWithException,
                    "event handling failed: {}",
                    e
                );
                self.notifier.report(handler, context, event, &e).await;
                TriggerReport {
                    failed: true,
                    ..Default::default()
                }
            }
        }
    }
}
