//! Paged, retrying walk of the organization hierarchy.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::clients::{ApiError, ApiResult, OrganizationApi, Page};
use crate::config::{TraversalConfig, TraversalDepth};
use crate::error::Result;
use crate::link::Scope;

/// Receives each resolved account resource as soon as it is known.
#[async_trait]
pub trait TargetSink: Send + Sync {
    async fn emit(&self, resource: String) -> Result<()>;
}

pub struct OrgTraversal {
    org: Arc<dyn OrganizationApi>,
    config: TraversalConfig,
}

impl OrgTraversal {
    pub fn new(org: Arc<dyn OrganizationApi>, config: TraversalConfig) -> Self {
        Self { org, config }
    }

    /// Walk `scope`, emitting each account as soon as its page arrives.
    /// Returns how many were emitted. A parent that no longer exists yields
    /// zero. On error, accounts emitted before the failure stay emitted.
    pub async fn walk(&self, scope: &Scope, sink: &dyn TargetSink) -> Result<usize> {
        let emitted = match scope {
            Scope::Account { account_id } => {
                sink.emit(account_id.clone()).await?;
                Some(1)
            }
            Scope::Root => {
                self.emit_all("accounts", sink, |token| self.org.list_accounts(token))
                    .await?
            }
            Scope::Ou { ou_id } => match self.config.depth {
                TraversalDepth::ParentOnly => self.emit_accounts_under(ou_id, sink).await?,
                TraversalDepth::Nested => self.emit_subtree(ou_id, sink).await?,
            },
            Scope::AccountTag { key, value } => {
                self.emit_all("tagged resources", sink, |token| {
                    self.org.resources_with_tag(key, value, token)
                })
                .await?
            }
        };

        match emitted {
            Some(count) => Ok(count),
            None => {
                tracing::info!(scope = %scope.value(), "scope no longer resolvable, no targets");
                Ok(0)
            }
        }
    }

    async fn emit_accounts_under(
        &self,
        parent_id: &str,
        sink: &dyn TargetSink,
    ) -> Result<Option<usize>> {
        self.emit_all("accounts for parent", sink, |token| {
            self.org.list_accounts_for_parent(parent_id, token)
        })
        .await
    }

    /// Breadth-first walk below `root_ou`, emitting each OU's accounts
    /// before descending further.
    async fn emit_subtree(&self, root_ou: &str, sink: &dyn TargetSink) -> Result<Option<usize>> {
        let Some(mut count) = self.emit_accounts_under(root_ou, sink).await? else {
            return Ok(None);
        };

        let mut pending: VecDeque<String> = VecDeque::from([root_ou.to_string()]);
        while let Some(parent) = pending.pop_front() {
            let children = self
                .collect_all("child organizational units", |token| {
                    self.org.list_child_ous(&parent, token)
                })
                .await?
                .unwrap_or_default();
            for child in children {
                count += self.emit_accounts_under(&child, sink).await?.unwrap_or(0);
                pending.push_back(child);
            }
        }
        Ok(Some(count))
    }

    /// Emit every item of a paged listing as each page arrives. `None` when
    /// the parent is not found.
    async fn emit_all<F, Fut>(
        &self,
        what: &str,
        sink: &dyn TargetSink,
        mut call: F,
    ) -> Result<Option<usize>>
    where
        F: FnMut(Option<String>) -> Fut,
        Fut: Future<Output = ApiResult<Page<String>>>,
    {
        let mut count = 0;
        let mut token = None;
        loop {
            let Some(page) = self.fetch_page(what, &mut call, token.take()).await? else {
                return Ok(None);
            };
            for item in page.items {
                sink.emit(item).await?;
                count += 1;
            }
            match page.next_token {
                Some(next) => token = Some(next),
                None => return Ok(Some(count)),
            }
        }
    }

    /// Drain every page of a listing that is not itself a target.
    async fn collect_all<F, Fut>(&self, what: &str, mut call: F) -> Result<Option<Vec<String>>>
    where
        F: FnMut(Option<String>) -> Fut,
        Fut: Future<Output = ApiResult<Page<String>>>,
    {
        let mut items = Vec::new();
        let mut token = None;
        loop {
            let Some(page) = self.fetch_page(what, &mut call, token.take()).await? else {
                return Ok(None);
            };
            items.extend(page.items);
            match page.next_token {
                Some(next) => token = Some(next),
                None => return Ok(Some(items)),
            }
        }
    }

    async fn fetch_page<F, Fut>(
        &self,
        what: &str,
        call: &mut F,
        token: Option<String>,
    ) -> Result<Option<Page<String>>>
    where
        F: FnMut(Option<String>) -> Fut,
        Fut: Future<Output = ApiResult<Page<String>>>,
    {
        match self.with_retry(what, || call(token.clone())).await {
            Ok(page) => Ok(Some(page)),
            Err(ApiError::NotFound { resource }) => {
                tracing::debug!(%resource, "{} parent not found", what);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn with_retry<F, Fut>(&self, what: &str, mut call: F) -> ApiResult<Page<String>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ApiResult<Page<String>>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(page) => return Ok(page),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.backoff(attempt);
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "listing {} failed, retrying: {}",
                        what,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.config.base_delay_ms.saturating_mul(factor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::memory::{AccountLayout, MemoryOrganization, OrgLayout, OuLayout};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<String>>);

    #[async_trait]
    impl TargetSink for Collect {
        async fn emit(&self, resource: String) -> Result<()> {
            self.0.lock().unwrap().push(resource);
            Ok(())
        }
    }

    fn account(id: &str, parent: &str) -> AccountLayout {
        AccountLayout {
            id: id.into(),
            parent: parent.into(),
            tags: BTreeMap::new(),
        }
    }

    fn org() -> Arc<MemoryOrganization> {
        let layout = OrgLayout {
            root_id: "r-root".into(),
            organizational_units: vec![
                OuLayout {
                    id: "ou-ab12-cdefgh34".into(),
                    parent: "r-root".into(),
                },
                OuLayout {
                    id: "ou-ab12-nested01".into(),
                    parent: "ou-ab12-cdefgh34".into(),
                },
            ],
            accounts: vec![
                account("111111111111", "r-root"),
                account("222222222222", "ou-ab12-cdefgh34"),
                account("333333333333", "ou-ab12-cdefgh34"),
                account("444444444444", "ou-ab12-nested01"),
            ],
            page_size: 1,
        };
        Arc::new(MemoryOrganization::new(&layout, Some("111111111111")))
    }

    fn config(depth: TraversalDepth) -> TraversalConfig {
        TraversalConfig {
            depth,
            max_attempts: 3,
            base_delay_ms: 1,
            ..TraversalConfig::default()
        }
    }

    fn ou() -> Scope {
        Scope::Ou {
            ou_id: "ou-ab12-cdefgh34".into(),
        }
    }

    #[tokio::test]
    async fn test_parent_only_depth() {
        let traversal = OrgTraversal::new(org(), config(TraversalDepth::ParentOnly));
        let sink = Collect::default();
        assert_eq!(traversal.walk(&ou(), &sink).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_nested_depth_includes_subtree() {
        let traversal = OrgTraversal::new(org(), config(TraversalDepth::Nested));
        let sink = Collect::default();
        assert_eq!(traversal.walk(&ou(), &sink).await.unwrap(), 3);
        assert!(sink.0.lock().unwrap().contains(&"444444444444".to_string()));
    }

    #[tokio::test]
    async fn test_root_lists_every_account() {
        let traversal = OrgTraversal::new(org(), config(TraversalDepth::Nested));
        let sink = Collect::default();
        assert_eq!(traversal.walk(&Scope::Root, &sink).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_deleted_ou_yields_nothing() {
        let traversal = OrgTraversal::new(org(), config(TraversalDepth::Nested));
        let sink = Collect::default();
        let gone = Scope::Ou {
            ou_id: "ou-zzzz-zzzzzzzz".into(),
        };
        assert_eq!(traversal.walk(&gone, &sink).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_throttling_is_retried() {
        let org = org();
        org.inject_failure(ApiError::Throttled {
            reason: "rate exceeded".into(),
        });
        org.inject_failure(ApiError::Throttled {
            reason: "rate exceeded".into(),
        });
        let traversal = OrgTraversal::new(org, config(TraversalDepth::ParentOnly));
        let sink = Collect::default();
        assert_eq!(traversal.walk(&ou(), &sink).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_retries_exhausted_is_error() {
        let org = org();
        for _ in 0..3 {
            org.inject_failure(ApiError::Unavailable {
                reason: "down".into(),
            });
        }
        let traversal = OrgTraversal::new(org, config(TraversalDepth::ParentOnly));
        let sink = Collect::default();
        let err = traversal.walk(&ou(), &sink).await.unwrap_err();
        assert!(err.is_retryable());
    }

    /// Serves first pages from the wrapped organization and refuses every
    /// continuation page.
    struct FirstPageOnly(Arc<MemoryOrganization>);

    #[async_trait]
    impl OrganizationApi for FirstPageOnly {
        async fn list_accounts_for_parent(
            &self,
            parent_id: &str,
            next_token: Option<String>,
        ) -> ApiResult<Page<String>> {
            if next_token.is_some() {
                return Err(ApiError::AccessDenied {
                    reason: "continuation refused".into(),
                });
            }
            self.0.list_accounts_for_parent(parent_id, None).await
        }

        async fn list_child_ous(
            &self,
            parent_id: &str,
            next_token: Option<String>,
        ) -> ApiResult<Page<String>> {
            self.0.list_child_ous(parent_id, next_token).await
        }

        async fn parent_of(&self, child_id: &str) -> ApiResult<Option<String>> {
            self.0.parent_of(child_id).await
        }

        async fn list_accounts(&self, next_token: Option<String>) -> ApiResult<Page<String>> {
            self.0.list_accounts(next_token).await
        }

        async fn resources_with_tag(
            &self,
            key: &str,
            value: &str,
            next_token: Option<String>,
        ) -> ApiResult<Page<String>> {
            self.0.resources_with_tag(key, value, next_token).await
        }
    }

    #[tokio::test]
    async fn test_accounts_are_emitted_before_a_later_page_fails() {
        let traversal = OrgTraversal::new(
            Arc::new(FirstPageOnly(org())),
            config(TraversalDepth::ParentOnly),
        );
        let sink = Collect::default();
        assert!(traversal.walk(&ou(), &sink).await.is_err());
        assert_eq!(*sink.0.lock().unwrap(), vec!["222222222222".to_string()]);
    }
}
