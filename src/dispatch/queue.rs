//! Sharded FIFO queue in front of the dispatch engine.
//!
//! Requests sharing a partition key land on the same shard and are
//! processed strictly in order; shards run independently. Identical
//! deduplication ids inside the window are dropped at enqueue. A request
//! that fails with a retryable error is redelivered in place, blocking its
//! shard, until it has been received `max_receive_count` times; it is then
//! dead-lettered to the error sink.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::DispatchEngine;
use crate::assignment::{DispatchRequest, RequestStatus};
use crate::config::QueueConfig;
use crate::error::{ReconcileError, Result};
use crate::telemetry::handler_span;

const DEDUP_PURGE_THRESHOLD: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Accepted { shard: usize },
    Duplicate,
}

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    duplicates: AtomicU64,
    redelivered: AtomicU64,
    dead_lettered: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub accepted: u64,
    pub duplicates: u64,
    pub redelivered: u64,
    pub dead_lettered: u64,
}

/// Deduplication ids accepted recently, with the time of acceptance. Once
/// the map grows past the purge threshold, expired ids are dropped.
struct DedupWindow {
    seen: DashMap<String, Instant>,
    window: Duration,
    purge_threshold: usize,
}

impl DedupWindow {
    fn new(window: Duration) -> Self {
        Self {
            seen: DashMap::new(),
            window,
            purge_threshold: DEDUP_PURGE_THRESHOLD,
        }
    }

    /// Record `id` as accepted at `now`. `false` when it was already
    /// accepted inside the window.
    fn admit(&self, id: &str, now: Instant) -> bool {
        if self.seen.len() > self.purge_threshold {
            self.seen
                .retain(|_, accepted| now.duration_since(*accepted) < self.window);
        }
        match self.seen.entry(id.to_string()) {
            Entry::Occupied(mut accepted) => {
                if now.duration_since(*accepted.get()) < self.window {
                    false
                } else {
                    accepted.insert(now);
                    true
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }

    fn len(&self) -> usize {
        self.seen.len()
    }
}

pub struct DispatchQueue {
    shards: Vec<mpsc::Sender<DispatchRequest>>,
    dedup: DedupWindow,
    counters: Arc<Counters>,
}

impl DispatchQueue {
    /// Create the queue and spawn one worker per shard. The workers stop
    /// once the queue is dropped and their shards drain.
    pub fn start(
        config: QueueConfig,
        engine: Arc<DispatchEngine>,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let shard_count = config.shard_count.max(1);
        let counters = Arc::new(Counters::default());
        let mut shards = Vec::with_capacity(shard_count);
        let mut workers = Vec::with_capacity(shard_count);

        for shard in 0..shard_count {
            let (tx, rx) = mpsc::channel(config.capacity.max(1));
            shards.push(tx);
            let worker = ShardWorker {
                shard,
                engine: engine.clone(),
                config: config.clone(),
                counters: counters.clone(),
            };
            workers.push(tokio::spawn(worker.run(rx)));
        }

        tracing::debug!(shard_count, "dispatch queue started");
        (
            Self {
                shards,
                dedup: DedupWindow::new(config.dedup_window()),
                counters,
            },
            workers,
        )
    }

    /// Shard for a partition key: SHA-256 of the key, modulo shard count.
    pub fn shard_for(&self, partition_key: &str) -> usize {
        shard_index(partition_key, self.shards.len())
    }

    pub async fn enqueue(&self, request: DispatchRequest) -> Result<Enqueued> {
        let dedup_id = request.dedup_id();
        if !self.dedup.admit(&dedup_id, Instant::now()) {
            tracing::debug!(%dedup_id, "duplicate dispatch request dropped");
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            return Ok(Enqueued::Duplicate);
        }

        let shard = self.shard_for(&request.partition_key());
        self.shards[shard]
            .send(request)
            .await
            .map_err(|_| ReconcileError::ChannelClosed {
                stage: format!("dispatch shard {shard}"),
            })?;
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);
        Ok(Enqueued::Accepted { shard })
    }

    pub fn stats(&self) -> QueueStats {
        self.counters.snapshot()
    }

    /// A handle for reading stats after the queue itself has been dropped.
    pub fn stats_handle(&self) -> QueueStatsHandle {
        QueueStatsHandle(self.counters.clone())
    }
}

#[derive(Clone)]
pub struct QueueStatsHandle(Arc<Counters>);

impl QueueStatsHandle {
    pub fn get(&self) -> QueueStats {
        self.0.snapshot()
    }
}

impl Counters {
    fn snapshot(&self) -> QueueStats {
        QueueStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            redelivered: self.redelivered.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

fn shard_index(partition_key: &str, shard_count: usize) -> usize {
    let digest = Sha256::digest(partition_key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % shard_count.max(1) as u64) as usize
}

struct ShardWorker {
    shard: usize,
    engine: Arc<DispatchEngine>,
    config: QueueConfig,
    counters: Arc<Counters>,
}

impl ShardWorker {
    async fn run(self, mut rx: mpsc::Receiver<DispatchRequest>) {
        while let Some(request) = rx.recv().await {
            let span = handler_span("dispatch", &request.context);
            self.deliver(request).instrument(span).await;
        }
        tracing::debug!(shard = self.shard, "dispatch shard drained");
    }

    async fn deliver(&self, request: DispatchRequest) {
        let max_receives = self.config.max_receive_count.max(1);
        let mut receive_count = 1;
        loop {
            match self.engine.dispatch(&request).await {
                Ok(outcome) => {
                    tracing::debug!(shard = self.shard, ?outcome, "dispatch handled");
                    return;
                }
                Err(e) if e.is_retryable() && receive_count < max_receives => {
                    tracing::warn!(
                        shard = self.shard,
                        receive_count,
                        "dispatch failed, redelivering: {}",
                        e
                    );
                    self.counters.redelivered.fetch_add(1, Ordering::Relaxed);
                    receive_count += 1;
                    tokio::time::sleep(self.config.redelivery_delay()).await;
                }
                Err(e) => {
                    tracing::error!(
                        shard = self.shard,
                        receive_count,
                        status = %RequestStatus::FailedWithException,
                        "dispatch dead-lettered: {}",
                        e
                    );
                    self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                    self.engine
                        .notifier()
                        .report("dispatch-dead-letter", &request.context, &request, &e)
                        .await;
                    return;
                }
            }
        }
    }
}
