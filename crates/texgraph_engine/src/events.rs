// SPDX-License-Identifier: MIT OR Apache-2.0
//! Change notifications.
//!
//! Subscribers register per node (or for the whole graph) in an index table
//! owned by the graph. Removing a node drops its subscriber list, so no
//! callback outlives the node it observes.

use crate::node::NodeId;
use crate::params::ParamKey;
use indexmap::IndexMap;
use std::fmt;

/// Something observable happened in a graph
#[derive(Debug, Clone, PartialEq)]
pub enum GraphEvent {
    /// A node produced new output
    Updated(NodeId),
    /// Data published on an output changed; `has_data` is false when cleared
    OutputChanged {
        /// Producing node
        node: NodeId,
        /// Output index
        output: usize,
        /// Whether the output now carries a usable buffer
        has_data: bool,
    },
    /// An input gained a source
    InputAdded {
        /// Consuming node
        node: NodeId,
        /// Input index
        input: usize,
    },
    /// An input lost its source
    InputRemoved {
        /// Consuming node
        node: NodeId,
        /// Input index
        input: usize,
    },
    /// A graph parameter entry was assigned
    ParameterChanged(ParamKey),
    /// A custom parameter was assigned
    CustomParameterChanged(String),
}

impl GraphEvent {
    /// Node the event concerns, if any
    pub fn node(&self) -> Option<NodeId> {
        match self {
            Self::Updated(node)
            | Self::OutputChanged { node, .. }
            | Self::InputAdded { node, .. }
            | Self::InputRemoved { node, .. } => Some(*node),
            Self::ParameterChanged(key) => Some(key.node),
            Self::CustomParameterChanged(_) => None,
        }
    }
}

/// Handle returned by a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Box<dyn FnMut(&GraphEvent)>;

/// Subscriber table
#[derive(Default)]
pub(crate) struct Observers {
    next: u64,
    by_node: IndexMap<NodeId, Vec<(SubscriptionId, Callback)>>,
    global: Vec<(SubscriptionId, Callback)>,
}

impl Observers {
    fn next_id(&mut self) -> SubscriptionId {
        self.next += 1;
        SubscriptionId(self.next)
    }

    pub(crate) fn subscribe(&mut self, node: NodeId, callback: Callback) -> SubscriptionId {
        let id = self.next_id();
        self.by_node.entry(node).or_default().push((id, callback));
        id
    }

    pub(crate) fn subscribe_all(&mut self, callback: Callback) -> SubscriptionId {
        let id = self.next_id();
        self.global.push((id, callback));
        id
    }

    pub(crate) fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.global.len();
        self.global.retain(|(sid, _)| *sid != id);
        if self.global.len() != before {
            return true;
        }
        for list in self.by_node.values_mut() {
            let before = list.len();
            list.retain(|(sid, _)| *sid != id);
            if list.len() != before {
                return true;
            }
        }
        false
    }

    /// Drop every subscription on `node`; returns how many were dropped
    pub(crate) fn remove_node(&mut self, node: NodeId) -> usize {
        self.by_node.swap_remove(&node).map_or(0, |list| list.len())
    }

    pub(crate) fn subscriber_count(&self, node: NodeId) -> usize {
        self.by_node.get(&node).map_or(0, Vec::len)
    }

    pub(crate) fn emit(&mut self, event: &GraphEvent) {
        if let Some(node) = event.node() {
            if let Some(list) = self.by_node.get_mut(&node) {
                for (_, callback) in list.iter_mut() {
                    callback(event);
                }
            }
        }
        for (_, callback) in self.global.iter_mut() {
            callback(event);
        }
    }
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("nodes", &self.by_node.len())
            .field("global", &self.global.len())
            .finish()
    }
}
