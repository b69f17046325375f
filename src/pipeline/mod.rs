//! Wires the named stages together with typed channels.
//!
//! ```text
//! triggers ──ExpandRequest──▶ expander ──ResolvedTarget──▶ listener ─┐
//!    │                                                               │
//!    └──────────────────────DispatchRequest──────────────────────────┴─▶ queue
//!                                                                         │
//!   ledger ◀── tracker ◀──CompletionTicket── dispatch engine (per shard) ◀┘
//! ```
//!
//! Shutdown closes the trigger side; each stage finishes its in-flight work
//! and drops its senders, so closure cascades down to the tracker.

pub mod simulation;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, AcquireError, Semaphore};
use tokio::task::JoinHandle;

use crate::assignment::{DispatchRequest, RequestContext};
use crate::catalog::{LinkStore, PermissionSetCatalog, PrincipalCache};
use crate::clients::{AssignmentApi, DirectoryApi, InstanceLocator, OrganizationApi};
use crate::config::ReconcilerConfig;
use crate::dispatch::{
    DispatchEngine, DispatchQueue, DispatchStats, Enqueued, QueueStats, QueueStatsHandle,
};
use crate::expand::{ExpandRequest, ResolvedTarget, ScopeExpander};
use crate::ledger::{LedgerReader, LedgerWriter};
use crate::notify::{ErrorSink, Notifier};
use crate::tracker::{CompletionTicket, CompletionTracker, TrackerStats};
use crate::triggers::{
    Event, LinkEvent, OrgEvent, PermissionSetEvent, PrincipalEvent, Router, TriggerDeps,
    TriggerReport, Triggers,
};

pub use simulation::SimulatedWorld;

/// External collaborators and stores, injected at construction.
#[derive(Clone)]
pub struct Collaborators {
    pub assignment: Arc<dyn AssignmentApi>,
    pub directory: Arc<dyn DirectoryApi>,
    pub organization: Arc<dyn OrganizationApi>,
    pub links: Arc<dyn LinkStore>,
    pub principals: Arc<dyn PrincipalCache>,
    pub permission_sets: Arc<dyn PermissionSetCatalog>,
    pub sink: Arc<dyn ErrorSink>,
}

/// A configured reconciler. Cheap to start repeatedly; every run shares the
/// same stores and ledger.
pub struct Reconciler {
    config: Arc<ReconcilerConfig>,
    collaborators: Collaborators,
    instance: Arc<InstanceLocator>,
    ledger_reader: Arc<dyn LedgerReader>,
    ledger_writer: Arc<dyn LedgerWriter>,
}

impl Reconciler {
    pub fn new<L>(config: ReconcilerConfig, collaborators: Collaborators, ledger: Arc<L>) -> Self
    where
        L: LedgerWriter + 'static,
    {
        let instance = Arc::new(InstanceLocator::new(collaborators.assignment.clone()));
        Self {
            config: Arc::new(config),
            collaborators,
            instance,
            ledger_reader: ledger.clone(),
            ledger_writer: ledger,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    fn notifier(&self) -> Notifier {
        Notifier::new(
            self.collaborators.sink.clone(),
            self.config.notifications.subject_prefix.clone(),
        )
    }

    /// Spawn every stage and return a handle for submitting events.
    pub fn start(&self) -> RunningReconciler {
        let config = &self.config;
        let capacity = config.queue.capacity.max(1);
        let notifier = self.notifier();

        let (expand_tx, expand_rx) = mpsc::channel::<ExpandRequest>(capacity);
        let (target_tx, target_rx) = mpsc::channel::<ResolvedTarget>(capacity);
        let (dispatch_tx, dispatch_rx) = mpsc::channel::<DispatchRequest>(capacity);
        let (ticket_tx, ticket_rx) = mpsc::channel::<CompletionTicket>(capacity);

        let tracker = Arc::new(CompletionTracker::new(
            self.collaborators.assignment.clone(),
            self.ledger_writer.clone(),
            notifier.clone(),
            config.timeouts.clone(),
        ));
        let tracker_task = tokio::spawn(
            tracker
                .clone()
                .run(ticket_rx, config.tracker.concurrency),
        );

        let engine = Arc::new(DispatchEngine::new(
            self.collaborators.assignment.clone(),
            self.ledger_reader.clone(),
            self.instance.clone(),
            ticket_tx,
            notifier.clone(),
            config.management_account_id.clone(),
        ));
        let (queue, shard_tasks) = DispatchQueue::start(config.queue.clone(), engine.clone());
        let queue_stats = queue.stats_handle();
        let forwarder_task = tokio::spawn(forward_dispatches(dispatch_rx, queue));

        let expander = Arc::new(ScopeExpander::new(
            self.collaborators.organization.clone(),
            config.traversal.clone(),
            notifier.clone(),
        ));
        let expander_task = tokio::spawn(expander.run(
            expand_rx,
            target_tx,
            config.traversal.concurrency,
        ));
        let listener_task = tokio::spawn(listen_for_targets(
            target_rx,
            dispatch_tx.clone(),
            config.management_account_id.clone(),
        ));

        let deps = TriggerDeps {
            links: self.collaborators.links.clone(),
            principals: self.collaborators.principals.clone(),
            permission_sets: self.collaborators.permission_sets.clone(),
            ledger: self.ledger_reader.clone(),
            directory: self.collaborators.directory.clone(),
            organization: self.collaborators.organization.clone(),
            instance: self.instance.clone(),
        };
        let triggers = Triggers::new(
            deps,
            config.directory.clone(),
            config.traversal.depth,
            Router::new(expand_tx, dispatch_tx, config.management_account_id.clone()),
            notifier,
            config.timeouts.resolution(),
        );

        tracing::info!(
            shards = config.queue.shard_count,
            tracker_concurrency = config.tracker.concurrency,
            "reconciler started"
        );

        RunningReconciler {
            triggers,
            front_tasks: vec![expander_task, listener_task, forwarder_task],
            shard_tasks,
            tracker_task,
            engine,
            tracker,
            queue_stats,
            events: AtomicUsize::new(0),
            failed_events: AtomicUsize::new(0),
        }
    }
}

/// Wait until every permit of a stage's semaphore is back, which means all
/// of its spawned tasks have finished.
pub(crate) async fn drain(semaphore: &Semaphore, permits: usize) -> Result<(), AcquireError> {
    let permits = u32::try_from(permits).unwrap_or(u32::MAX);
    semaphore.acquire_many(permits).await.map(drop)
}

async fn listen_for_targets(
    mut targets: mpsc::Receiver<ResolvedTarget>,
    dispatch: mpsc::Sender<DispatchRequest>,
    management_account_id: Option<String>,
) {
    while let Some(target) = targets.recv().await {
        let Some(request) = target.into_dispatch(management_account_id.as_deref()) else {
            continue;
        };
        if dispatch.send(request).await.is_err() {
            tracing::error!("dispatch stage closed, dropping resolved targets");
            break;
        }
    }
}

async fn forward_dispatches(mut requests: mpsc::Receiver<DispatchRequest>, queue: DispatchQueue) {
    while let Some(request) = requests.recv().await {
        match queue.enqueue(request).await {
            Ok(Enqueued::Accepted { shard }) => tracing::trace!(shard, "dispatch enqueued"),
            Ok(Enqueued::Duplicate) => {}
            Err(e) => {
                tracing::error!("failed to enqueue dispatch: {}", e);
                break;
            }
        }
    }
}

/// Totals for one run, available after shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub events: usize,
    pub failed_events: usize,
    pub dispatch: DispatchStats,
    pub queue: QueueStats,
    pub tracker: TrackerStats,
}

impl RunReport {
    /// Add another run's totals to this one.
    pub fn absorb(&mut self, other: &RunReport) {
        self.events += other.events;
        self.failed_events += other.failed_events;
        self.dispatch.create_calls += other.dispatch.create_calls;
        self.dispatch.delete_calls += other.dispatch.delete_calls;
        self.dispatch.already_assigned += other.dispatch.already_assigned;
        self.dispatch.not_assigned += other.dispatch.not_assigned;
        self.dispatch.skipped_management_account += other.dispatch.skipped_management_account;
        self.dispatch.rejected += other.dispatch.rejected;
        self.queue.accepted += other.queue.accepted;
        self.queue.duplicates += other.queue.duplicates;
        self.queue.redelivered += other.queue.redelivered;
        self.queue.dead_lettered += other.queue.dead_lettered;
        self.tracker.confirmed_creates += other.tracker.confirmed_creates;
        self.tracker.confirmed_deletes += other.tracker.confirmed_deletes;
        self.tracker.failed += other.tracker.failed;
        self.tracker.timed_out += other.tracker.timed_out;
    }
}

pub struct RunningReconciler {
    triggers: Triggers,
    front_tasks: Vec<JoinHandle<()>>,
    shard_tasks: Vec<JoinHandle<()>>,
    tracker_task: JoinHandle<()>,
    engine: Arc<DispatchEngine>,
    tracker: Arc<CompletionTracker>,
    queue_stats: QueueStatsHandle,
    events: AtomicUsize,
    failed_events: AtomicUsize,
}

impl RunningReconciler {
    /// Submit any event; a fresh root request id is minted for it.
    pub async fn submit(&self, event: &Event) -> TriggerReport {
        let report = self.triggers.handle(event, RequestContext::root()).await;
        self.tally(report)
    }

    pub async fn submit_link_event(&self, event: &LinkEvent) -> TriggerReport {
        let report = self
            .triggers
            .handle_link_event(event, RequestContext::root())
            .await;
        self.tally(report)
    }

    pub async fn submit_principal_event(&self, event: &PrincipalEvent) -> TriggerReport {
        let report = self
            .triggers
            .handle_principal_event(event, RequestContext::root())
            .await;
        self.tally(report)
    }

    pub async fn submit_permission_set_event(&self, event: &PermissionSetEvent) -> TriggerReport {
        let report = self
            .triggers
            .handle_permission_set_event(event, RequestContext::root())
            .await;
        self.tally(report)
    }

    pub async fn submit_org_event(&self, event: &OrgEvent) -> TriggerReport {
        let report = self
            .triggers
            .handle_org_event(event, RequestContext::root())
            .await;
        self.tally(report)
    }

    fn tally(&self, report: TriggerReport) -> TriggerReport {
        self.events.fetch_add(1, Ordering::Relaxed);
        if report.failed || report.failed_links > 0 {
            self.failed_events.fetch_add(1, Ordering::Relaxed);
        }
        report
    }

    /// Close the intake and wait for every stage to drain, including
    /// completion polling of operations already issued.
    pub async fn shutdown(self) -> RunReport {
        let RunningReconciler {
            triggers,
            front_tasks,
            shard_tasks,
            tracker_task,
            engine,
            tracker,
            queue_stats,
            events,
            failed_events,
        } = self;

        drop(triggers);
        for task in front_tasks {
            if let Err(e) = task.await {
                tracing::error!("pipeline stage panicked: {}", e);
            }
        }
        for task in shard_tasks {
            if let Err(e) = task.await {
                tracing::error!("dispatch shard panicked: {}", e);
            }
        }

        let dispatch = engine.stats();
        drop(engine);
        if let Err(e) = tracker_task.await {
            tracing::error!("completion tracker panicked: {}", e);
        }

        let report = RunReport {
            events: events.into_inner(),
            failed_events: failed_events.into_inner(),
            dispatch,
            queue: queue_stats.get(),
            tracker: tracker.stats(),
        };
        tracing::info!(
            create_calls = report.dispatch.create_calls,
            delete_calls = report.dispatch.delete_calls,
            confirmed_creates = report.tracker.confirmed_creates,
            confirmed_deletes = report.tracker.confirmed_deletes,
            "reconciler drained"
        );
        report
    }
}
