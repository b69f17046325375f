//! Dispatch Engine: idempotent create/delete of single-account assignments,
//! guarded by the ledger.

pub mod queue;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::assignment::{Action, DispatchRequest};
use crate::clients::{AssignmentApi, AssignmentParams, InstanceLocator};
use crate::error::{ReconcileError, Result};
use crate::ledger::{LedgerKey, LedgerReader};
use crate::notify::Notifier;
use crate::tracker::CompletionTicket;

pub use queue::{DispatchQueue, Enqueued, QueueStats, QueueStatsHandle};

/// What the engine did with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    SkippedManagementAccount,
    /// `create` for a key already in the ledger.
    AlreadyAssigned,
    /// `delete` for a key not in the ledger.
    NotAssigned,
    /// Operation issued and handed to the completion tracker.
    Submitted { operation_id: String },
    /// Permanently invalid; reported to the error sink.
    Rejected,
}

#[derive(Debug, Default)]
struct Counters {
    created: AtomicU64,
    deleted: AtomicU64,
    already_assigned: AtomicU64,
    not_assigned: AtomicU64,
    skipped: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub create_calls: u64,
    pub delete_calls: u64,
    pub already_assigned: u64,
    pub not_assigned: u64,
    pub skipped_management_account: u64,
    pub rejected: u64,
}

pub struct DispatchEngine {
    api: Arc<dyn AssignmentApi>,
    ledger: Arc<dyn LedgerReader>,
    instance: Arc<InstanceLocator>,
    tickets: mpsc::Sender<CompletionTicket>,
    notifier: Notifier,
    management_account_id: Option<String>,
    counters: Counters,
}

impl DispatchEngine {
    pub fn new(
        api: Arc<dyn AssignmentApi>,
        ledger: Arc<dyn LedgerReader>,
        instance: Arc<InstanceLocator>,
        tickets: mpsc::Sender<CompletionTicket>,
        notifier: Notifier,
        management_account_id: Option<String>,
    ) -> Self {
        Self {
            api,
            ledger,
            instance,
            tickets,
            notifier,
            management_account_id,
            counters: Counters::default(),
        }
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Process one request.
    ///
    /// Retryable failures are returned so the queue can redeliver. Permanent
    /// failures are reported to the error sink and yield `Rejected`.
    pub async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchOutcome> {
        if self.management_account_id.as_deref() == Some(request.target_account_id.as_str()) {
            tracing::info!(
                account_id = %request.target_account_id,
                "management account is never assigned, skipping"
            );
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(DispatchOutcome::SkippedManagementAccount);
        }

        match self.try_dispatch(request).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_retryable() => Err(e),
            Err(e) => {
                tracing::error!(
                    action = %request.action,
                    account_id = %request.target_account_id,
                    status = %crate::assignment::RequestStatus::FailedWithError,
                    "dispatch rejected: {}",
                    e
                );
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                self.notifier
                    .report("dispatch", &request.context, request, &e)
                    .await;
                Ok(DispatchOutcome::Rejected)
            }
        }
    }

    async fn try_dispatch(&self, request: &DispatchRequest) -> Result<DispatchOutcome> {
        let key = LedgerKey::derive(
            &request.principal_id,
            &request.target_account_id,
            &request.permission_set_id,
        )?;
        let assigned = self.ledger.contains(&key)?;

        match (request.action, assigned) {
            (Action::Create, true) => {
                tracing::info!(ledger_key = %key, "already assigned, nothing to create");
                self.counters.already_assigned.fetch_add(1, Ordering::Relaxed);
                return Ok(DispatchOutcome::AlreadyAssigned);
            }
            (Action::Delete, false) => {
                tracing::info!(ledger_key = %key, "not assigned, nothing to delete");
                self.counters.not_assigned.fetch_add(1, Ordering::Relaxed);
                return Ok(DispatchOutcome::NotAssigned);
            }
            _ => {}
        }

        let instance = self.instance.get().await?;
        let params = AssignmentParams {
            instance_id: instance.instance_id.clone(),
            target_account_id: request.target_account_id.clone(),
            permission_set_id: request.permission_set_id.clone(),
            principal_type: request.principal_type,
            principal_id: request.principal_id.clone(),
        };

        let handle = match request.action {
            Action::Create => self.api.create_assignment(&params).await?,
            Action::Delete => self.api.delete_assignment(&params).await?,
        };
        match request.action {
            Action::Create => self.counters.created.fetch_add(1, Ordering::Relaxed),
            Action::Delete => self.counters.deleted.fetch_add(1, Ordering::Relaxed),
        };

        tracing::info!(
            ledger_key = %key,
            action = %request.action,
            operation_id = %handle.operation_id,
            status = %crate::assignment::RequestStatus::InProgress,
            "assignment operation submitted"
        );

        let operation_id = handle.operation_id.clone();
        let ticket = CompletionTicket {
            handle,
            ledger_key: key,
            action: request.action,
            principal_type: request.principal_type,
            tag_key_lookup: request.tag_key_lookup.clone(),
            context: request.context.child(),
        };
        self.tickets
            .send(ticket)
            .await
            .map_err(|_| ReconcileError::ChannelClosed {
                stage: "completion tickets".into(),
            })?;

        Ok(DispatchOutcome::Submitted { operation_id })
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            create_calls: self.counters.created.load(Ordering::Relaxed),
            delete_calls: self.counters.deleted.load(Ordering::Relaxed),
            already_assigned: self.counters.already_assigned.load(Ordering::Relaxed),
            not_assigned: self.counters.not_assigned.load(Ordering::Relaxed),
            skipped_management_account: self.counters.skipped.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assignment::{PermissionSetId, PrincipalType, RequestContext};
    use crate::clients::memory::MemoryAssignmentApi;
    use crate::clients::{ApiError, InstanceInfo};
    use crate::ledger::{LedgerWriter, MemoryLedger, ProvisionedEntry};
    use crate::notify::MemorySink;
    use chrono::Utc;

    struct Fixture {
        engine: DispatchEngine,
        api: Arc<MemoryAssignmentApi>,
        ledger: Arc<MemoryLedger>,
        sink: Arc<MemorySink>,
        tickets: mpsc::Receiver<CompletionTicket>,
    }

    fn fixture() -> Fixture {
        let info = InstanceInfo {
            instance_id: "arn:aws:sso:::instance/ssoins-1".into(),
            identity_store_id: "d-1".into(),
        };
        let api = Arc::new(MemoryAssignmentApi::new(info, 1));
        let ledger = Arc::new(MemoryLedger::new());
        let sink = Arc::new(MemorySink::new());
        let (tx, rx) = mpsc::channel(16);
        let engine = DispatchEngine::new(
            api.clone(),
            ledger.clone(),
            Arc::new(InstanceLocator::new(api.clone())),
            tx,
            Notifier::new(sink.clone(), ""),
            Some("111111111111".into()),
        );
        Fixture {
            engine,
            api,
            ledger,
            sink,
            tickets: rx,
        }
    }

    fn request(action: Action, account: &str, ps: &str) -> DispatchRequest {
        DispatchRequest {
            principal_id: "g-1".into(),
            principal_type: PrincipalType::Group,
            target_account_id: account.into(),
            permission_set_id: PermissionSetId::new(ps),
            action,
            tag_key_lookup: None,
            context: RequestContext::root(),
        }
    }

    const PS: &str = "arn:aws:sso:::permissionSet/ssoins-1/ps-1";

    #[tokio::test]
    async fn test_create_submits_and_hands_off_ticket() {
        let mut f = fixture();
        let outcome = f
            .engine
            .dispatch(&request(Action::Create, "123456789012", PS))
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Submitted { .. }));
        let ticket = f.tickets.recv().await.unwrap();
        assert_eq!(ticket.ledger_key.to_string(), "g-1@123456789012@ssoins-1@ps-1");
        assert_eq!(f.api.call_count(Action::Create), 1);
        assert!(f.ledger.is_empty());
    }

    #[tokio::test]
    async fn test_create_for_confirmed_key_is_noop() {
        let f = fixture();
        let req = request(Action::Create, "123456789012", PS);
        f.ledger
            .upsert(ProvisionedEntry {
                key: LedgerKey::derive("g-1", "123456789012", &req.permission_set_id).unwrap(),
                principal_type: PrincipalType::Group,
                tag_key_lookup: None,
                confirmed_at: Utc::now(),
            })
            .unwrap();
        assert_eq!(
            f.engine.dispatch(&req).await.unwrap(),
            DispatchOutcome::AlreadyAssigned
        );
        assert_eq!(f.api.call_count(Action::Create), 0);
    }

    #[tokio::test]
    async fn test_unconfirmed_creates_both_go_out() {
        let f = fixture();
        let req = request(Action::Create, "123456789012", PS);
        f.engine.dispatch(&req).await.unwrap();
        f.engine.dispatch(&req).await.unwrap();
        assert_eq!(f.api.call_count(Action::Create), 2);
    }

    #[tokio::test]
    async fn test_delete_of_absent_key_is_noop() {
        let f = fixture();
        assert_eq!(
            f.engine
                .dispatch(&request(Action::Delete, "123456789012", PS))
                .await
                .unwrap(),
            DispatchOutcome::NotAssigned
        );
        assert_eq!(f.api.call_count(Action::Delete), 0);
    }

    #[tokio::test]
    async fn test_management_account_skipped() {
        let f = fixture();
        assert_eq!(
            f.engine
                .dispatch(&request(Action::Create, "111111111111", PS))
                .await
                .unwrap(),
            DispatchOutcome::SkippedManagementAccount
        );
        assert_eq!(f.engine.stats().skipped_management_account, 1);
    }

    #[tokio::test]
    async fn test_throttling_propagates_for_redelivery() {
        let f = fixture();
        f.api.inject_failure(ApiError::Throttled {
            reason: "rate exceeded".into(),
        });
        let err = f
            .engine
            .dispatch(&request(Action::Create, "123456789012", PS))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(f.sink.is_empty());
    }

    #[tokio::test]
    async fn test_permanent_errors_go_to_sink() {
        let f = fixture();
        f.api.inject_failure(ApiError::Validation {
            reason: "principal does not exist".into(),
        });
        assert_eq!(
            f.engine
                .dispatch(&request(Action::Create, "123456789012", PS))
                .await
                .unwrap(),
            DispatchOutcome::Rejected
        );
        assert_eq!(
            f.engine
                .dispatch(&request(Action::Create, "123456789012", "ReadOnly-id"))
                .await
                .unwrap(),
            DispatchOutcome::Rejected
        );
        assert_eq!(f.sink.len(), 2);
        assert_eq!(f.engine.stats().rejected, 2);
    }
}
