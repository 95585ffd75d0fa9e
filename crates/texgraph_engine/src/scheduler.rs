// SPDX-License-Identifier: MIT OR Apache-2.0
//! Two-phase scheduling.
//!
//! Nodes flagged for asynchronous execution are queued here instead of being
//! processed on the spot. Draining the queue runs in batches: parameter
//! resolution for the whole batch goes to the [`ParamExecutor`] workers,
//! then every GPU call happens back on the thread that owns the graph.
//!
//! Downstream nodes are only queued once their upstream node has published,
//! so a node and its consumers never share a batch.

use crate::evaluation::{ParamJob, Resolved};
use crate::node::NodeId;
use indexmap::IndexSet;
use tokio::runtime::{Builder, Runtime};

/// Pending reprocess requests, deduplicated and kept in request order
#[derive(Debug, Default)]
pub struct Scheduler {
    pending: IndexSet<NodeId>,
    batches: u64,
}

impl Scheduler {
    /// Create an idle scheduler
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a node; returns false when it was already queued
    pub fn schedule(&mut self, node: NodeId) -> bool {
        self.pending.insert(node)
    }

    /// Drop a queued request
    pub fn cancel(&mut self, node: NodeId) -> bool {
        self.pending.shift_remove(&node)
    }

    /// Take everything currently queued
    pub fn take_batch(&mut self) -> Option<Vec<NodeId>> {
        if self.pending.is_empty() {
            return None;
        }
        self.batches += 1;
        Some(self.pending.drain(..).collect())
    }

    /// Whether a node is waiting
    pub fn contains(&self, node: NodeId) -> bool {
        self.pending.contains(&node)
    }

    /// Number of queued nodes
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is queued
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }

    /// Batches handed out so far
    pub fn batches_dispatched(&self) -> u64 {
        self.batches
    }
}

/// Worker pool resolving parameters off the GPU thread
pub struct ParamExecutor {
    runtime: Option<Runtime>,
    workers: usize,
}

impl ParamExecutor {
    /// Start `workers` threads; zero resolves every job on the caller
    pub fn new(workers: usize) -> std::io::Result<Self> {
        let runtime = if workers == 0 {
            None
        } else {
            Some(
                Builder::new_multi_thread()
                    .worker_threads(workers)
                    .thread_name("texgraph-params")
                    .build()?,
            )
        };
        tracing::debug!("Parameter executor started with {} workers", workers);
        Ok(Self { runtime, workers })
    }

    /// Executor that never leaves the calling thread
    pub fn inline() -> Self {
        Self {
            runtime: None,
            workers: 0,
        }
    }

    /// Worker thread count
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Resolve a batch, returning results in job order.
    ///
    /// Blocks until every job finished. Must not be called from inside an
    /// async context.
    pub fn resolve_batch(&self, jobs: Vec<ParamJob>) -> Vec<(NodeId, Resolved)> {
        let Some(runtime) = &self.runtime else {
            return jobs.into_iter().map(ParamJob::resolve).collect();
        };

        let count = jobs.len();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        for (index, job) in jobs.into_iter().enumerate() {
            let tx = tx.clone();
            runtime.spawn(async move {
                let _ = tx.send((index, job.resolve()));
            });
        }
        drop(tx);

        let mut slots: Vec<Option<(NodeId, Resolved)>> = (0..count).map(|_| None).collect();
        while let Some((index, resolved)) = rx.blocking_recv() {
            if let Some(slot) = slots.get_mut(index) {
                *slot = Some(resolved);
            }
        }

        let results: Vec<_> = slots.into_iter().flatten().collect();
        if results.len() != count {
            tracing::warn!("{} parameter jobs did not complete", count - results.len());
        }
        results
    }
}

impl std::fmt::Debug for ParamExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParamExecutor").field("workers", &self.workers).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::ParamRequest;
    use crate::operators::InvertNode;
    use crate::params::{ParamScope, ParamValue};
    use std::sync::Arc;

    fn job(node: NodeId, scope: &Arc<ParamScope>) -> ParamJob {
        ParamJob::new(node, scope.clone(), ParamRequest::Operator(Box::new(InvertNode::default())))
    }

    #[test]
    fn test_queue_dedup_and_batches() {
        let mut scheduler = Scheduler::new();
        let a = NodeId::new();
        let b = NodeId::new();
        assert!(scheduler.schedule(a));
        assert!(!scheduler.schedule(a));
        assert!(scheduler.schedule(b));
        assert!(scheduler.cancel(b));
        assert_eq!(scheduler.pending_count(), 1);

        assert_eq!(scheduler.take_batch(), Some(vec![a]));
        assert!(scheduler.take_batch().is_none());
        assert!(scheduler.is_idle());
        assert_eq!(scheduler.batches_dispatched(), 1);
    }

    #[test]
    fn test_parallel_results_keep_job_order() {
        let executor = ParamExecutor::new(4).unwrap();
        let nodes: Vec<NodeId> = (0..32).map(|_| NodeId::new()).collect();
        let mut scope = ParamScope::new();
        scope.insert(crate::params::ParamKey::new(nodes[3], "Red"), ParamValue::Bool(false));
        let scope = Arc::new(scope);

        let results = executor.resolve_batch(nodes.iter().map(|n| job(*n, &scope)).collect());
        let ids: Vec<NodeId> = results.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, nodes);

        match &results[3].1 {
            Resolved::Operator(op) => assert_eq!(op.params()[0].1, ParamValue::Bool(false)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_inline_executor() {
        let executor = ParamExecutor::inline();
        let node = NodeId::new();
        let results = executor.resolve_batch(vec![job(node, &Arc::new(ParamScope::new()))]);
        assert_eq!(results.len(), 1);
        assert_eq!(executor.workers(), 0);
    }
}
