//! Scope Expander: turns a scope into concrete single-account targets.
//!
//! Account scopes resolve synchronously. Every other scope is walked by
//! [`OrgTraversal`], which emits one [`ResolvedTarget`] per account onto a
//! channel. The listener stage turns each target back into a
//! [`DispatchRequest`], re-joining the tag key that the tag query does not
//! echo.

pub mod traversal;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tracing::Instrument;

use crate::assignment::{
    Action, DispatchRequest, PermissionSetId, PrincipalType, RequestContext,
};
use crate::clients::{account_id_from_resource, OrganizationApi};
use crate::config::TraversalConfig;
use crate::error::{ReconcileError, Result};
use crate::link::descriptor::TAG_SEPARATOR;
use crate::link::Scope;
use crate::notify::Notifier;
use crate::pipeline::drain;
use crate::telemetry::handler_span;

pub use traversal::{OrgTraversal, TargetSink};

/// A resolved principal/permission-set pair waiting for its scope to expand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpandRequest {
    pub scope: Scope,
    pub principal_id: String,
    pub principal_type: PrincipalType,
    pub permission_set_id: PermissionSetId,
    pub action: Action,
    pub context: RequestContext,
}

impl ExpandRequest {
    /// The single target of an account scope. `None` for every other scope.
    pub fn direct_target(&self) -> Option<ResolvedTarget> {
        match &self.scope {
            Scope::Account { account_id } => Some(self.target(account_id.clone())),
            _ => None,
        }
    }

    pub fn target(&self, resource: String) -> ResolvedTarget {
        let tag_key = match &self.scope {
            Scope::AccountTag { key, .. } => Some(key.clone()),
            _ => None,
        };
        ResolvedTarget {
            resource,
            tag_key,
            principal_id: self.principal_id.clone(),
            principal_type: self.principal_type,
            permission_set_id: self.permission_set_id.clone(),
            action: self.action,
            context: self.context.child(),
        }
    }
}

/// One concrete account found by expansion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedTarget {
    /// Account id, or the account resource identifier for tag queries.
    pub resource: String,

    /// Tag key carried alongside the query, for tag scopes.
    pub tag_key: Option<String>,

    pub principal_id: String,
    pub principal_type: PrincipalType,
    pub permission_set_id: PermissionSetId,
    pub action: Action,
    pub context: RequestContext,
}

impl ResolvedTarget {
    pub fn account_id(&self) -> &str {
        account_id_from_resource(&self.resource)
    }

    /// Build the dispatch request for this target. The management account
    /// never produces one.
    pub fn into_dispatch(self, management_account_id: Option<&str>) -> Option<DispatchRequest> {
        let account_id = self.account_id().to_string();
        if management_account_id == Some(account_id.as_str()) {
            tracing::info!(
                %account_id,
                request_id = %self.context.request_id,
                "excluding management account from targets"
            );
            return None;
        }
        let tag_key_lookup = self
            .tag_key
            .map(|key| format!("{key}{TAG_SEPARATOR}{account_id}"));
        Some(DispatchRequest {
            principal_id: self.principal_id,
            principal_type: self.principal_type,
            target_account_id: account_id,
            permission_set_id: self.permission_set_id,
            action: self.action,
            tag_key_lookup,
            context: self.context,
        })
    }
}

struct ChannelSink<'a> {
    request: &'a ExpandRequest,
    out: &'a mpsc::Sender<ResolvedTarget>,
}

#[async_trait]
impl TargetSink for ChannelSink<'_> {
    async fn emit(&self, resource: String) -> Result<()> {
        self.out
            .send(self.request.target(resource))
            .await
            .map_err(|_| ReconcileError::ChannelClosed {
                stage: "resolved targets".into(),
            })
    }
}

pub struct ScopeExpander {
    traversal: OrgTraversal,
    notifier: Notifier,
    max_receive_count: u32,
    redelivery_delay: Duration,
}

impl ScopeExpander {
    pub fn new(
        org: Arc<dyn OrganizationApi>,
        config: TraversalConfig,
        notifier: Notifier,
    ) -> Self {
        Self {
            max_receive_count: config.max_receive_count.max(1),
            redelivery_delay: config.redelivery_delay(),
            traversal: OrgTraversal::new(org, config),
            notifier,
        }
    }

    /// Expand one request, emitting each target onto `out` as it resolves.
    pub async fn expand(
        &self,
        request: &ExpandRequest,
        out: &mpsc::Sender<ResolvedTarget>,
    ) -> Result<usize> {
        let sink = ChannelSink { request, out };
        let count = self.traversal.walk(&request.scope, &sink).await?;
        tracing::info!(
            scope = %request.scope.value(),
            action = %request.action,
            targets = count,
            "scope expanded"
        );
        Ok(count)
    }

    /// Expand with in-place redelivery: a retryable failure receives the
    /// request again after the redelivery delay, up to `max_receive_count`
    /// receives. Targets emitted by an earlier receive are emitted again;
    /// dispatch deduplication and the ledger absorb the repeats.
    pub async fn expand_with_redelivery(
        &self,
        request: &ExpandRequest,
        out: &mpsc::Sender<ResolvedTarget>,
    ) -> Result<usize> {
        let mut receives = 1;
        loop {
            match self.expand(request, out).await {
                Ok(count) => return Ok(count),
                Err(e) if e.is_retryable() && receives < self.max_receive_count => {
                    tracing::warn!(
                        receives,
                        scope = %request.scope.value(),
                        "expansion failed, redelivering: {}",
                        e
                    );
                    tokio::time::sleep(self.redelivery_delay).await;
                    receives += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Consume expansion requests until the channel closes. Each request is
    /// expanded in its own task, at most `concurrency` at a time.
    pub async fn run(
        self: Arc<Self>,
        mut requests: mpsc::Receiver<ExpandRequest>,
        out: mpsc::Sender<ResolvedTarget>,
        concurrency: usize,
    ) {
        let concurrency = concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));

        while let Some(request) = requests.recv().await {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let expander = self.clone();
            let out = out.clone();
            let span = handler_span("expand", &request.context);
            tokio::spawn(
                async move {
                    let _permit = permit;
                    if let Err(e) = expander.expand_with_redelivery(&request, &out).await {
                        let handler = if e.is_retryable() {
                            "expand-dead-letter"
                        } else {
                            "expand"
                        };
                        expander
                            .notifier
                            .report(handler, &request.context, &request, &e)
                            .await;
                    }
                }
                .instrument(span),
            );
        }

        if drain(&semaphore, concurrency).await.is_err() {
            tracing::warn!("expander semaphore closed before in-flight expansions drained");
        }
        tracing::debug!("expander stopped");
    }
}
