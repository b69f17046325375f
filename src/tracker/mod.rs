//! Completion Tracker: polls assignment operations to a terminal state and
//! is the only component that writes the ledger.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tracing::Instrument;

use crate::assignment::{Action, PrincipalType, RequestContext, RequestStatus};
use crate::clients::{AssignmentApi, OperationHandle, OperationStatus};
use crate::config::TimeoutConfig;
use crate::error::{ReconcileError, Result};
use crate::ledger::{LedgerKey, LedgerWriter, ProvisionedEntry};
use crate::notify::Notifier;
use crate::pipeline::drain;
use crate::telemetry::handler_span;

/// Handed from the dispatch engine to the tracker for every issued operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionTicket {
    pub handle: OperationHandle,
    pub ledger_key: LedgerKey,
    pub action: Action,
    pub principal_type: PrincipalType,
    pub tag_key_lookup: Option<String>,
    pub context: RequestContext,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Succeeded and the ledger now reflects it.
    Confirmed,
    Failed { reason: String },
    TimedOut,
}

#[derive(Debug, Default)]
struct Counters {
    confirmed_creates: AtomicU64,
    confirmed_deletes: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrackerStats {
    pub confirmed_creates: u64,
    pub confirmed_deletes: u64,
    pub failed: u64,
    pub timed_out: u64,
}

pub struct CompletionTracker {
    api: Arc<dyn AssignmentApi>,
    ledger: Arc<dyn LedgerWriter>,
    notifier: Notifier,
    timeouts: TimeoutConfig,
    counters: Counters,
}

impl CompletionTracker {
    pub fn new(
        api: Arc<dyn AssignmentApi>,
        ledger: Arc<dyn LedgerWriter>,
        notifier: Notifier,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            api,
            ledger,
            notifier,
            timeouts,
            counters: Counters::default(),
        }
    }

    /// Poll one operation until it is terminal or the budget is spent, then
    /// apply the result. Failures and timeouts leave the ledger untouched.
    pub async fn track(&self, ticket: &CompletionTicket) -> Result<Completion> {
        let started = Instant::now();
        let budget = self.timeouts.completion_budget();
        let max_delay = self.timeouts.poll_max_delay();
        let mut delay = self.timeouts.poll_min_delay();

        loop {
            match self.api.describe_operation(&ticket.handle).await {
                Ok(OperationStatus::Succeeded) => {
                    self.confirm(ticket)?;
                    return Ok(Completion::Confirmed);
                }
                Ok(OperationStatus::Failed { reason }) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    let err = ReconcileError::OperationFailed {
                        operation_id: ticket.handle.operation_id.clone(),
                        reason: reason.clone(),
                    };
                    tracing::error!(
                        ledger_key = %ticket.ledger_key,
                        status = %RequestStatus::FailedWithError,
                        "{}",
                        err
                    );
                    self.notifier
                        .report("completion", &ticket.context, ticket, &err)
                        .await;
                    return Ok(Completion::Failed { reason });
                }
                Ok(OperationStatus::InProgress) => {}
                Err(e) if e.is_retryable() => {
                    tracing::warn!(
                        operation_id = %ticket.handle.operation_id,
                        "status poll failed, will poll again: {}",
                        e
                    );
                }
                Err(e) => return Err(e.into()),
            }

            let elapsed = started.elapsed();
            if elapsed + delay > budget {
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                let err = ReconcileError::CompletionTimeout {
                    operation_id: ticket.handle.operation_id.clone(),
                    waited_secs: elapsed.as_secs(),
                };
                tracing::error!(
                    ledger_key = %ticket.ledger_key,
                    status = %RequestStatus::Aborted,
                    "{}",
                    err
                );
                self.notifier
                    .report("completion", &ticket.context, ticket, &err)
                    .await;
                return Ok(Completion::TimedOut);
            }

            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(max_delay);
        }
    }

    fn confirm(&self, ticket: &CompletionTicket) -> Result<()> {
        match ticket.action {
            Action::Create => {
                self.ledger.upsert(ProvisionedEntry {
                    key: ticket.ledger_key.clone(),
                    principal_type: ticket.principal_type,
                    tag_key_lookup: ticket.tag_key_lookup.clone(),
                    confirmed_at: Utc::now(),
                })?;
                self.counters.confirmed_creates.fetch_add(1, Ordering::Relaxed);
            }
            Action::Delete => {
                self.ledger.remove(&ticket.ledger_key)?;
                self.counters.confirmed_deletes.fetch_add(1, Ordering::Relaxed);
            }
        }
        tracing::info!(
            ledger_key = %ticket.ledger_key,
            action = %ticket.action,
            status = %RequestStatus::Completed,
            "assignment confirmed"
        );
        Ok(())
    }

    /// Track tickets until the channel closes, `concurrency` at a time.
    pub async fn run(
        self: Arc<Self>,
        mut tickets: mpsc::Receiver<CompletionTicket>,
        concurrency: usize,
    ) {
        let concurrency = concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));

        while let Some(ticket) = tickets.recv().await {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let tracker = self.clone();
            let span = handler_span("completion", &ticket.context);
            tokio::spawn(
                async move {
                    let _permit = permit;
                    if let Err(e) = tracker.track(&ticket).await {
                        tracker
                            .notifier
                            .report("completion", &ticket.context, &ticket, &e)
                            .await;
                    }
                }
                .instrument(span),
            );
        }

        if drain(&semaphore, concurrency).await.is_err() {
            tracing::warn!("tracker semaphore closed before in-flight polls drained");
        }
        tracing::debug!("completion tracker stopped");
    }

    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            confirmed_creates: self.counters.confirmed_creates.load(Ordering::Relaxed),
            confirmed_deletes: self.counters.confirmed_deletes.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
        }
    }
}
