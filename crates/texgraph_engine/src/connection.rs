// SPDX-License-Identifier: MIT OR Apache-2.0
//! Connection (edge) definitions for the graph.

use crate::node::NodeId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Create a new random connection ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

/// A connection from an output port to an input port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    /// Unique connection ID
    pub id: ConnectionId,
    /// Source node ID
    pub from_node: NodeId,
    /// Index of the source output
    pub from_output: usize,
    /// Target node ID
    pub to_node: NodeId,
    /// Index of the target input
    pub to_input: usize,
}

impl Connection {
    /// Create a new connection
    pub fn new(from_node: NodeId, from_output: usize, to_node: NodeId, to_input: usize) -> Self {
        Self {
            id: ConnectionId::new(),
            from_node,
            from_output,
            to_node,
            to_input,
        }
    }

    /// Check if this connection involves a specific node
    pub fn involves_node(&self, node_id: NodeId) -> bool {
        self.from_node == node_id || self.to_node == node_id
    }

    /// Check if this connection feeds a specific input
    pub fn feeds(&self, node_id: NodeId, input: usize) -> bool {
        self.to_node == node_id && self.to_input == input
    }

    /// Check if this connection leaves a specific output
    pub fn leaves(&self, node_id: NodeId, output: usize) -> bool {
        self.from_node == node_id && self.from_output == output
    }
}
