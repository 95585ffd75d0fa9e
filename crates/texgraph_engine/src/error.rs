// SPDX-License-Identifier: MIT OR Apache-2.0
//! Error types for the engine.

use crate::connection::ConnectionId;
use crate::node::NodeId;
use crate::params::ParamKey;
use texgraph_gpu::GpuError;

/// Error when editing a graph
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// Node not found
    #[error("Node not found: {0:?}")]
    NodeNotFound(NodeId),

    /// Port not found
    #[error("Port {index} not found on node {node:?}")]
    PortNotFound {
        /// Node that was searched
        node: NodeId,
        /// Requested port index
        index: usize,
    },

    /// Connection not found
    #[error("Connection not found: {0:?}")]
    ConnectionNotFound(ConnectionId),

    /// Incompatible port types
    #[error("Incompatible port types")]
    IncompatiblePorts,

    /// Input already has a source
    #[error("Input {index} of node {node:?} is already connected")]
    PortAlreadyConnected {
        /// Target node
        node: NodeId,
        /// Target input index
        index: usize,
    },

    /// Self-loop not allowed
    #[error("Self-loop not allowed")]
    SelfLoop,

    /// The edit would close a cycle
    #[error("Graph contains a cycle")]
    Cycle,

    /// Structural edit on an embedded graph
    #[error("Graph '{0}' is read-only")]
    ReadOnly(String),

    /// Flag owned by the hosting instance of an embedded graph
    #[error("Graph '{0}' is embedded; its flags follow the hosting instance")]
    Embedded(String),

    /// Node has no such parameter
    #[error("Unknown parameter '{name}' on node {node:?}")]
    UnknownParameter {
        /// Node that was addressed
        node: NodeId,
        /// Parameter name
        name: String,
    },

    /// Graph has no such parameter entry
    #[error("Parameter not found: {0}")]
    ParameterNotFound(ParamKey),

    /// Custom parameter not found
    #[error("Custom parameter not found: {0}")]
    CustomParameterNotFound(String),

    /// Value has the wrong type for the parameter
    #[error("Type mismatch for parameter '{0}'")]
    TypeMismatch(String),

    /// The operation only applies to graph instance nodes
    #[error("Node {0:?} is not a graph instance")]
    NotAnInstance(NodeId),
}

/// Failure while running a node's processor
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The node's program could not be loaded
    #[error("Processor '{0}' is unavailable")]
    MissingProcessor(&'static str),

    /// An input refers to a buffer that cannot be read
    #[error("Input data is not a usable buffer")]
    MalformedInput,

    /// The device rejected the work
    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),
}

/// Failure while resolving or decoding a graph resource
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// Filesystem error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Archive could not be read
    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// Archive was used before `open`
    #[error("Archive '{0}' is not open")]
    ArchiveClosed(String),

    /// Archive does not contain the requested entry
    #[error("Entry '{0}' not found in archive")]
    MissingEntry(String),

    /// Archive entry is not valid UTF-8
    #[error("Entry '{0}' is not valid text")]
    InvalidText(String),

    /// Graph definition could not be decoded
    #[error("Invalid graph definition: {0}")]
    Json(#[from] serde_json::Error),

    /// No resolution step found the resource and there was nothing to fall back on
    #[error("Unresolved graph resource: {0}")]
    Unresolved(String),

    /// The decoded graph is structurally invalid
    #[error("Invalid graph: {0}")]
    Graph(#[from] GraphError),
}

/// Engine setup failure
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration could not be parsed or is invalid
    #[error("Config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// The parameter worker pool could not start
    #[error("Failed to start parameter workers: {0}")]
    Workers(#[from] std::io::Error),
}
