//! Organization-structure trigger.
//!
//! Each change touches exactly one account, so only the links that could
//! newly match (or stop matching) that account are re-evaluated, and every
//! resulting dispatch targets that account alone.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{TriggerReport, Triggers};
use crate::assignment::{Action, DispatchRequest, RequestContext};
use crate::clients::ApiError;
use crate::config::TraversalDepth;
use crate::error::Result;
use crate::link::descriptor::{ROOT_VALUE, TAG_SEPARATOR};
use crate::link::{Link, ScopeType};

/// Bound on the ancestor walk; organizations nest OUs at most five deep.
const MAX_OU_DEPTH: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrgEvent {
    AccountCreated {
        account_id: String,
    },
    AccountMoved {
        account_id: String,
        source_parent_id: String,
        destination_parent_id: String,
    },
    /// `tags` is the account's full tag set after the change.
    TagsChanged {
        account_id: String,
        changed_keys: Vec<String>,
        #[serde(default)]
        tags: BTreeMap<String, String>,
    },
}

impl Triggers {
    pub async fn handle_org_event(
        &self,
        event: &OrgEvent,
        context: RequestContext,
    ) -> TriggerReport {
        let result = self
            .bounded("org", self.apply_org_event(event, &context))
            .await;
        self.guard("org", event, &context, result).await
    }

    async fn apply_org_event(
        &self,
        event: &OrgEvent,
        context: &RequestContext,
    ) -> Result<TriggerReport> {
        let mut report = TriggerReport::default();
        match event {
            OrgEvent::AccountCreated { account_id } => {
                let links = self.links.by_scope(ScopeType::Root, ROOT_VALUE)?;
                tracing::info!(%account_id, links = links.len(), "account created");
                self.route_for_account(&links, Action::Create, account_id, context, &mut report)
                    .await;
            }
            OrgEvent::AccountMoved {
                account_id,
                source_parent_id,
                destination_parent_id,
            } => {
                let (left, joined) = self
                    .moved_between(source_parent_id, destination_parent_id)
                    .await?;
                let leaving = self.ou_links(&left)?;
                let joining = self.ou_links(&joined)?;
                tracing::info!(
                    %account_id,
                    from = %source_parent_id,
                    to = %destination_parent_id,
                    leaving = leaving.len(),
                    joining = joining.len(),
                    "account moved"
                );
                self.route_for_account(&leaving, Action::Delete, account_id, context, &mut report)
                    .await;
                self.route_for_account(&joining, Action::Create, account_id, context, &mut report)
                    .await;
            }
            OrgEvent::TagsChanged {
                account_id,
                changed_keys,
                tags,
            } => {
                for key in changed_keys {
                    let links = match tags.get(key) {
                        Some(value) => {
                            let scope_value = format!("{key}{TAG_SEPARATOR}{value}");
                            self.links.by_scope(ScopeType::AccountTag, &scope_value)?
                        }
                        None => Vec::new(),
                    };
                    if links.is_empty() {
                        self.deprovision_tag(key, account_id, context, &mut report)
                            .await?;
                    } else {
                        self.route_for_account(
                            &links,
                            Action::Create,
                            account_id,
                            context,
                            &mut report,
                        )
                        .await;
                    }
                }
            }
        }
        Ok(report)
    }

    /// Organizational units the account stopped and started belonging to.
    /// With nested traversal an OU covers its whole subtree, so every
    /// ancestor not shared by both parents counts.
    async fn moved_between(
        &self,
        source: &str,
        destination: &str,
    ) -> Result<(Vec<String>, Vec<String>)> {
        let (from, to) = match self.depth {
            TraversalDepth::ParentOnly => {
                (vec![source.to_string()], vec![destination.to_string()])
            }
            TraversalDepth::Nested => {
                let from = self.ancestry(source).await?;
                (from, self.ancestry(destination).await?)
            }
        };
        let left = from.iter().filter(|ou| !to.contains(ou)).cloned().collect();
        let joined = to.iter().filter(|ou| !from.contains(ou)).cloned().collect();
        Ok((left, joined))
    }

    /// `ou_id` followed by each of its ancestors up to the root. An unknown
    /// parent ends the chain.
    async fn ancestry(&self, ou_id: &str) -> Result<Vec<String>> {
        let mut chain = vec![ou_id.to_string()];
        let mut current = ou_id.to_string();
        while chain.len() < MAX_OU_DEPTH {
            let parent = match self.organization.parent_of(&current).await {
                Ok(Some(parent)) => parent,
                Ok(None) => break,
                Err(ApiError::NotFound { resource }) => {
                    tracing::debug!(%resource, "parent lookup ended at unknown node");
                    break;
                }
                Err(e) => return Err(e.into()),
            };
            if chain.contains(&parent) {
                break;
            }
            chain.push(parent.clone());
            current = parent;
        }
        Ok(chain)
    }

    fn ou_links(&self, ou_ids: &[String]) -> Result<Vec<Link>> {
        let mut links = Vec::new();
        for ou_id in ou_ids {
            links.extend(self.links.by_scope(ScopeType::Ou, ou_id)?);
        }
        Ok(links)
    }

    async fn route_for_account(
        &self,
        links: &[Link],
        action: Action,
        account_id: &str,
        context: &RequestContext,
        report: &mut TriggerReport,
    ) {
        for link in links {
            let outcome = match self.resolve_link(link, action, context).await {
                Ok(Some(request)) => self
                    .router
                    .route_to_account(&request, account_id)
                    .await
                    .map(Some),
                Ok(None) => Ok(None),
                Err(e) => Err(e),
            };
            self.tally_link("org", link, context, outcome, report).await;
        }
    }

    /// Revoke every confirmed assignment that reached this account through
    /// the tag key.
    async fn deprovision_tag(
        &self,
        key: &str,
        account_id: &str,
        context: &RequestContext,
        report: &mut TriggerReport,
    ) -> Result<()> {
        let lookup = format!("{key}{TAG_SEPARATOR}{account_id}");
        let entries = self.ledger.find_by_tag_lookup(&lookup)?;
        tracing::info!(
            tag_key_lookup = %lookup,
            entries = entries.len(),
            "tag no longer targeted, deprovisioning"
        );
        for entry in entries {
            let request = DispatchRequest {
                permission_set_id: entry.key.permission_set_id(),
                principal_id: entry.key.principal_id,
                principal_type: entry.principal_type,
                target_account_id: entry.key.target_account_id,
                action: Action::Delete,
                tag_key_lookup: entry.tag_key_lookup,
                context: context.child(),
            };
            report.record(self.router.send_dispatch(Some(request)).await?);
        }
        Ok(())
    }
}
