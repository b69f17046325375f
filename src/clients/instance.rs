use std::sync::Arc;

use tokio::sync::OnceCell;

use super::{AssignmentApi, InstanceInfo};
use crate::error::{ReconcileError, Result};

/// Lazily discovers the assignment instance once and shares it.
pub struct InstanceLocator {
    api: Arc<dyn AssignmentApi>,
    cell: OnceCell<InstanceInfo>,
}

impl InstanceLocator {
    pub fn new(api: Arc<dyn AssignmentApi>) -> Self {
        Self {
            api,
            cell: OnceCell::new(),
        }
    }

    /// The first instance reported by the assignment API. A failed lookup
    /// is not cached, so the next caller retries.
    pub async fn get(&self) -> Result<&InstanceInfo> {
        self.cell
            .get_or_try_init(|| async {
                let instances = self.api.list_instances().await?;
                let info = instances.into_iter().next().ok_or(ReconcileError::NoInstance)?;
                tracing::debug!(instance_id = %info.instance_id, "discovered assignment instance");
                Ok::<_, ReconcileError>(info)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::memory::MemoryAssignmentApi;

    #[tokio::test]
    async fn test_discovers_first_instance() {
        let info = InstanceInfo {
            instance_id: "arn:aws:sso:::instance/ssoins-1".into(),
            identity_store_id: "d-1".into(),
        };
        let api = Arc::new(MemoryAssignmentApi::new(info.clone(), 1));
        let locator = InstanceLocator::new(api);
        assert_eq!(locator.get().await.unwrap(), &info);
        assert_eq!(locator.get().await.unwrap().identity_store_id, "d-1");
    }
}
