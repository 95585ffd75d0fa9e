// SPDX-License-Identifier: MIT OR Apache-2.0
//! Persisted graph format.
//!
//! Graphs are stored as JSON. Parameter maps are keyed by
//! `"<nodeId>.<name>"`. Each node lists the connections on both of its
//! sides; loading takes the union, so either side alone is enough.

use crate::archive::MtgArchive;
use crate::context::EngineContext;
use crate::error::LoadError;
use crate::graph::{instance_format, Graph, GraphState, Lineage};
use crate::instance::{graph_from_archive, GraphInstance};
use crate::node::{InputNode, Node, NodeId, NodeKind, NodeSettings, OutputNode};
use crate::operators::{EmbossNode, FillNode, GrayscaleNode, InvertNode, LevelsNode, NormalsNode, OutputType};
use crate::params::{GraphParameterValue, ParamKey, ParamValue};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use texgraph_gpu::PixelFormat;

fn default_size() -> u32 {
    256
}

fn default_tile() -> f32 {
    1.0
}

/// One end of a connection, seen from the node that lists it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionRecord {
    /// Node on the other end
    pub node: NodeId,
    /// Output index on the producing side
    pub output: usize,
    /// Input index on the consuming side
    pub input: usize,
}

/// Saved state of an instance node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Definition of the embedded graph, used when the path cannot be resolved
    #[serde(default)]
    pub raw_data: Option<String>,
    /// Resource path
    #[serde(default)]
    pub path: Option<String>,
    /// Values of the embedded graph's parameters
    #[serde(default)]
    pub parameters: IndexMap<ParamKey, ParamValue>,
    /// Values of the embedded graph's custom parameters
    #[serde(default)]
    pub custom_parameters: IndexMap<String, ParamValue>,
    /// Random seed of the embedded graph
    #[serde(default)]
    pub random_seed: i32,
}

/// Node kind and kind-specific settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum KindRecord {
    /// Graph input
    Input,
    /// Graph output
    Output {
        /// Role of the output
        #[serde(default)]
        out_type: OutputType,
    },
    /// Uniform color
    Fill(FillNode),
    /// Channel inversion
    Invert(InvertNode),
    /// Grayscale conversion
    Grayscale(GrayscaleNode),
    /// Emboss
    Emboss(EmbossNode),
    /// Levels
    Levels(LevelsNode),
    /// Normal map generation
    Normals(NormalsNode),
    /// Embedded graph
    GraphInstance(InstanceRecord),
}

/// Saved node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Node ID
    pub id: NodeId,
    /// Display name
    pub name: String,
    /// Width in pixels
    #[serde(default = "default_size")]
    pub width: u32,
    /// Height in pixels
    #[serde(default = "default_size")]
    pub height: u32,
    /// Horizontal tiling
    #[serde(default = "default_tile")]
    pub tile_x: f32,
    /// Vertical tiling
    #[serde(default = "default_tile")]
    pub tile_y: f32,
    /// Pixel format
    #[serde(default)]
    pub pixel_format: PixelFormat,
    /// Scheduled processing
    #[serde(default)]
    pub asynchronous: bool,
    /// Sources of the node's inputs
    #[serde(default)]
    pub inputs: Vec<ConnectionRecord>,
    /// Consumers of the node's outputs
    #[serde(default)]
    pub outputs: Vec<ConnectionRecord>,
    /// Kind
    pub kind: KindRecord,
}

/// Saved graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphRecord {
    /// Graph name
    pub name: String,
    /// Default node width
    #[serde(default = "default_size")]
    pub width: u32,
    /// Default node height
    #[serde(default = "default_size")]
    pub height: u32,
    /// Default pixel format
    #[serde(default)]
    pub pixel_format: PixelFormat,
    /// Random seed
    #[serde(default)]
    pub random_seed: i32,
    /// Input nodes in port order
    #[serde(default)]
    pub input_nodes: Vec<NodeId>,
    /// Output nodes in port order
    #[serde(default)]
    pub output_nodes: Vec<NodeId>,
    /// Parameter entries
    #[serde(default)]
    pub parameters: IndexMap<ParamKey, GraphParameterValue>,
    /// Custom parameters
    #[serde(default)]
    pub custom_parameters: Vec<GraphParameterValue>,
    /// Nodes
    #[serde(default)]
    pub nodes: Vec<NodeRecord>,
}

impl Graph {
    /// Snapshot the graph
    pub fn to_record(&self) -> GraphRecord {
        GraphRecord {
            name: self.name.clone(),
            width: self.width,
            height: self.height,
            pixel_format: self.pixel_format,
            random_seed: self.random_seed,
            input_nodes: self.input_nodes.clone(),
            output_nodes: self.output_nodes.clone(),
            parameters: self.parameters.clone(),
            custom_parameters: self.custom_parameters.clone(),
            nodes: self.nodes.values().map(|n| self.node_record(n)).collect(),
        }
    }

    fn node_record(&self, node: &Node) -> NodeRecord {
        let inputs = self
            .connections
            .values()
            .filter(|c| c.to_node == node.id)
            .map(|c| ConnectionRecord {
                node: c.from_node,
                output: c.from_output,
                input: c.to_input,
            })
            .collect();
        let outputs = self
            .connections
            .values()
            .filter(|c| c.from_node == node.id)
            .map(|c| ConnectionRecord {
                node: c.to_node,
                output: c.from_output,
                input: c.to_input,
            })
            .collect();
        let kind = match &node.kind {
            NodeKind::Input(_) => KindRecord::Input,
            NodeKind::Output(output) => KindRecord::Output {
                out_type: output.out_type,
            },
            NodeKind::Fill(op) => KindRecord::Fill(op.clone()),
            NodeKind::Invert(op) => KindRecord::Invert(op.clone()),
            NodeKind::Grayscale(op) => KindRecord::Grayscale(op.clone()),
            NodeKind::Emboss(op) => KindRecord::Emboss(op.clone()),
            NodeKind::Levels(op) => KindRecord::Levels(op.clone()),
            NodeKind::Normals(op) => KindRecord::Normals(op.clone()),
            NodeKind::Instance(inst) => KindRecord::GraphInstance(inst.to_record()),
        };
        NodeRecord {
            id: node.id,
            name: node.name.clone(),
            width: node.width,
            height: node.height,
            tile_x: node.tile_x,
            tile_y: node.tile_y,
            pixel_format: node.pixel_format,
            asynchronous: node.asynchronous,
            inputs,
            outputs,
            kind,
        }
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String, LoadError> {
        Ok(serde_json::to_string_pretty(&self.to_record())?)
    }

    /// Decode a top-level graph from JSON
    pub fn from_json(text: &str, ctx: Rc<EngineContext>) -> Result<Self, LoadError> {
        let record: GraphRecord = serde_json::from_str(text)?;
        Self::from_record(record, ctx, Lineage::root(), None, None)
    }

    /// Load a graph file or archive; sub-graph resources resolve next to it
    pub fn load_file(path: &Path, ctx: Rc<EngineContext>) -> Result<Self, LoadError> {
        let cwd = path.parent().map(Path::to_path_buf);
        let (text, archive) = if ctx.config().is_archive_path(&path.to_string_lossy()) {
            let (text, archive) = graph_from_archive(MtgArchive::from_path(path)?, ctx.config())?;
            (text, Some(archive))
        } else {
            (std::fs::read_to_string(path)?, None)
        };
        let record: GraphRecord = serde_json::from_str(&text)?;
        let graph = Self::from_record(record, ctx, Lineage::root(), archive, cwd)?;
        tracing::info!("Loaded graph {} from {}", graph.name, path.display());
        Ok(graph)
    }

    /// Write the graph as JSON
    pub fn save_file(&self, path: &Path) -> Result<(), LoadError> {
        std::fs::write(path, self.to_json()?)?;
        tracing::info!("Saved graph {} to {}", self.name, path.display());
        Ok(())
    }

    /// Rebuild a graph from its record; nothing is processed
    pub(crate) fn from_record(
        record: GraphRecord,
        ctx: Rc<EngineContext>,
        lineage: Lineage,
        archive: Option<MtgArchive>,
        cwd: Option<PathBuf>,
    ) -> Result<Self, LoadError> {
        let mut graph = Self::with_lineage(record.name, ctx, lineage);
        graph.state = GraphState::Loading;
        graph.archive = archive;
        graph.cwd = cwd;
        graph.width = record.width;
        graph.height = record.height;
        graph.pixel_format = record.pixel_format;
        graph.random_seed = record.random_seed;
        graph.parameters = record.parameters;
        graph.custom_parameters = record.custom_parameters;

        let mut links = IndexSet::new();
        for node_record in record.nodes {
            let id = node_record.id;
            for c in &node_record.inputs {
                links.insert((c.node, c.output, id, c.input));
            }
            for c in &node_record.outputs {
                links.insert((id, c.output, c.node, c.input));
            }
            graph.restore_node(node_record)?;
        }

        graph.input_nodes = declared_order(&record.input_nodes, &graph.input_nodes);
        graph.output_nodes = declared_order(&record.output_nodes, &graph.output_nodes);

        for (from, output, to, input) in links {
            if let Err(e) = graph.link(from, output, to, input) {
                tracing::warn!("{}: skipping saved connection: {}", graph.name, e);
            }
        }

        graph.state = GraphState::Idle;
        tracing::debug!(
            "Restored graph {} ({} nodes, {} connections, depth {})",
            graph.name,
            graph.node_count(),
            graph.connection_count(),
            graph.lineage.depth
        );
        Ok(graph)
    }

    fn restore_node(&mut self, record: NodeRecord) -> Result<(), LoadError> {
        let settings = NodeSettings {
            width: record.width,
            height: record.height,
            pixel_format: record.pixel_format,
            asynchronous: record.asynchronous,
        };
        let (kind, instance) = match record.kind {
            KindRecord::Input => (NodeKind::Input(InputNode::default()), None),
            KindRecord::Output { out_type } => (NodeKind::Output(OutputNode::new(out_type)), None),
            KindRecord::Fill(op) => (NodeKind::Fill(op), None),
            KindRecord::Invert(op) => (NodeKind::Invert(op), None),
            KindRecord::Grayscale(op) => (NodeKind::Grayscale(op), None),
            KindRecord::Emboss(op) => (NodeKind::Emboss(op), None),
            KindRecord::Levels(op) => (NodeKind::Levels(op), None),
            KindRecord::Normals(op) => (NodeKind::Normals(op), None),
            KindRecord::GraphInstance(inst) => (NodeKind::instance(), Some(inst)),
        };

        let mut node = Node::with_id(record.id, kind, settings).with_name(record.name);
        node.width = record.width;
        node.height = record.height;
        node.tile_x = record.tile_x;
        node.tile_y = record.tile_y;
        if instance.is_some() {
            node.pixel_format = instance_format(record.pixel_format);
        }
        let id = self.insert_node(node);

        if let Some(saved) = instance {
            let lc = self.load_context(id)?;
            let inst = GraphInstance::from_record(saved, &lc);
            let (inputs, outputs) = inst.ports();
            if let Some(node) = self.node_mut(id) {
                node.inputs = inputs;
                node.outputs = outputs;
                node.kind = NodeKind::Instance(Box::new(inst));
            }
        }
        Ok(())
    }
}

/// Saved order first, then anything the save did not mention
fn declared_order(saved: &[NodeId], found: &[NodeId]) -> Vec<NodeId> {
    let mut order: Vec<NodeId> = saved.iter().filter(|id| found.contains(id)).copied().collect();
    order.extend(found.iter().filter(|id| !order.contains(id)).copied().collect::<Vec<_>>());
    order
}
