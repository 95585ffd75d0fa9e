// SPDX-License-Identifier: MIT OR Apache-2.0
//! Texture graph engine.
//!
//! This crate evaluates node graphs of GPU image operators:
//! - Change-driven reprocessing: a node reruns when an input, parameter or
//!   setting changes, and its consumers follow
//! - Two-phase scheduling: parameter resolution on worker threads, GPU calls
//!   on the thread owning the graph
//! - Graph instances embedding other graphs, with parameter values pushed
//!   down from every ancestor
//! - Explicit buffer release so deep nesting keeps GPU memory bounded
//!
//! ## Architecture
//!
//! A [`Graph`] owns its [`Node`]s and [`Connection`]s and holds an
//! [`EngineContext`] shared by the whole instance tree. Nodes publish
//! [`texgraph_gpu::Buffer`]s on output ports; consumers read them through
//! the connection table. Graphs persist as JSON and may be bundled with
//! their sub-graphs in zip archives ([`MtgArchive`]).

pub mod archive;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod evaluation;
pub mod events;
pub mod graph;
pub mod instance;
pub mod node;
pub mod operators;
pub mod params;
pub mod port;
pub mod processor;
pub mod record;
pub mod scheduler;

pub use archive::MtgArchive;
pub use config::{ConfigError, EngineConfig};
pub use connection::{Connection, ConnectionId};
pub use context::EngineContext;
pub use error::{EngineError, GraphError, LoadError, ProcessError};
pub use evaluation::PushDown;
pub use events::{GraphEvent, SubscriptionId};
pub use graph::{Graph, GraphId, GraphState, Lineage};
pub use instance::{GraphInstance, LoadSource};
pub use node::{InputNode, Node, NodeId, NodeKind, NodeSettings, OutputNode};
pub use operators::{
    EmbossNode, FillNode, GrayscaleNode, ImageOperator, InvertNode, LevelsNode, NormalsNode, OutputType,
};
pub use params::{GraphParameterValue, ParamFunction, ParamKey, ParamValue};
pub use port::{DataKinds, Port, PortDirection};
pub use record::GraphRecord;
pub use scheduler::Scheduler;
