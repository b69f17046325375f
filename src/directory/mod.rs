//! Directory Resolver: principal name to opaque principal id.

use std::sync::Arc;

use crate::assignment::PrincipalType;
use crate::catalog::{PrincipalCache, PrincipalCacheEntry};
use crate::clients::{DirectoryApi, InstanceLocator};
use crate::config::DirectoryConfig;
use crate::error::Result;

/// Resolves principal names through the cache, falling back to a
/// just-in-time directory lookup of `name@domain` when the directory is
/// integrated with an external source.
pub struct DirectoryResolver {
    cache: Arc<dyn PrincipalCache>,
    directory: Arc<dyn DirectoryApi>,
    instance: Arc<InstanceLocator>,
    config: DirectoryConfig,
}

impl DirectoryResolver {
    pub fn new(
        cache: Arc<dyn PrincipalCache>,
        directory: Arc<dyn DirectoryApi>,
        instance: Arc<InstanceLocator>,
        config: DirectoryConfig,
    ) -> Self {
        Self {
            cache,
            directory,
            instance,
            config,
        }
    }

    /// `Ok(None)` means the principal is not known yet; the caller defers.
    pub async fn resolve(
        &self,
        principal_name: &str,
        principal_type: PrincipalType,
    ) -> Result<Option<String>> {
        if let Some(id) = self.cache.get(principal_name, principal_type)? {
            tracing::debug!(principal_name, %principal_type, "principal cache hit");
            return Ok(Some(id));
        }

        let Some(domain) = self.config.jit_domain() else {
            tracing::info!(
                principal_name,
                %principal_type,
                "principal not cached and just-in-time lookup disabled, deferring"
            );
            return Ok(None);
        };

        let qualified = format!("{principal_name}@{domain}");
        let identity_store_id = &self.instance.get().await?.identity_store_id;
        let found = self
            .directory
            .find_principal(identity_store_id, principal_type, &qualified)
            .await?;

        match found {
            Some(principal_id) => {
                tracing::info!(
                    principal_name,
                    %principal_type,
                    %principal_id,
                    "resolved principal just-in-time"
                );
                self.cache.upsert(PrincipalCacheEntry {
                    principal_name: principal_name.to_string(),
                    principal_type,
                    principal_id: principal_id.clone(),
                })?;
                Ok(Some(principal_id))
            }
            None => {
                tracing::info!(
                    principal = %qualified,
                    %principal_type,
                    "principal not found in directory, deferring"
                );
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryPrincipalCache;
    use crate::clients::memory::{DirectoryLayout, MemoryAssignmentApi, MemoryDirectory};
    use crate::clients::{ApiError, InstanceInfo};
    use crate::config::DirectoryMode;

    fn info() -> InstanceInfo {
        InstanceInfo {
            instance_id: "arn:aws:sso:::instance/ssoins-1".into(),
            identity_store_id: "d-1".into(),
        }
    }

    fn resolver(
        config: DirectoryConfig,
    ) -> (DirectoryResolver, Arc<MemoryPrincipalCache>, Arc<MemoryDirectory>) {
        let cache = Arc::new(MemoryPrincipalCache::new());
        let directory = Arc::new(MemoryDirectory::new("d-1", &DirectoryLayout::default()));
        let api = Arc::new(MemoryAssignmentApi::new(info(), 1));
        let instance = Arc::new(InstanceLocator::new(api));
        (
            DirectoryResolver::new(cache.clone(), directory.clone(), instance, config),
            cache,
            directory,
        )
    }

    fn integrated() -> DirectoryConfig {
        DirectoryConfig {
            mode: DirectoryMode::Integrated,
            domain_name: Some("corp.example.com".into()),
        }
    }

    #[tokio::test]
    async fn test_cache_hit_skips_directory() {
        let (resolver, cache, directory) = resolver(integrated());
        cache
            .upsert(PrincipalCacheEntry {
                principal_name: "Engineers".into(),
                principal_type: PrincipalType::Group,
                principal_id: "g-1".into(),
            })
            .unwrap();
        let id = resolver
            .resolve("Engineers", PrincipalType::Group)
            .await
            .unwrap();
        assert_eq!(id.as_deref(), Some("g-1"));
        assert_eq!(directory.lookup_count(), 0);
    }

    #[tokio::test]
    async fn test_jit_lookup_populates_cache() {
        let (resolver, cache, directory) = resolver(integrated());
        directory.add_principal(PrincipalType::Group, "Engineers@corp.example.com", "g-9");
        let id = resolver
            .resolve("Engineers", PrincipalType::Group)
            .await
            .unwrap();
        assert_eq!(id.as_deref(), Some("g-9"));
        assert_eq!(
            cache.get("Engineers", PrincipalType::Group).unwrap().as_deref(),
            Some("g-9")
        );
    }

    #[tokio::test]
    async fn test_jit_miss_defers() {
        let (resolver, cache, _) = resolver(integrated());
        assert!(resolver
            .resolve("Ghosts", PrincipalType::Group)
            .await
            .unwrap()
            .is_none());
        assert!(cache.get("Ghosts", PrincipalType::Group).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_native_mode_never_queries_directory() {
        let (resolver, _, directory) = resolver(DirectoryConfig::default());
        directory.add_principal(PrincipalType::Group, "Engineers", "g-1");
        assert!(resolver
            .resolve("Engineers", PrincipalType::Group)
            .await
            .unwrap()
            .is_none());
        assert_eq!(directory.lookup_count(), 0);
    }

    #[tokio::test]
    async fn test_directory_error_propagates() {
        let (resolver, _, directory) = resolver(integrated());
        directory.inject_failure(ApiError::Throttled {
            reason: "slow down".into(),
        });
        let err = resolver
            .resolve("Engineers", PrincipalType::Group)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
