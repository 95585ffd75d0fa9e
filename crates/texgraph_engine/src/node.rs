// SPDX-License-Identifier: MIT OR Apache-2.0
//! Node definitions for the graph framework.

use crate::error::GraphError;
use crate::graph::GraphId;
use crate::instance::GraphInstance;
use crate::operators::{
    EmbossNode, FillNode, GrayscaleNode, ImageOperator, InvertNode, LevelsNode, NormalsNode,
    OutputType, ParamError,
};
use crate::params::ParamValue;
use crate::port::{DataKinds, Port};
use crate::processor::{Processor, ShaderProcessor};
use serde::{Deserialize, Serialize};
use texgraph_gpu::{Buffer, GpuDevice, PixelFormat};
use uuid::Uuid;

/// Unique identifier for a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// Create a new random node ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

/// Graph input: hands the data fed by an instance host to the graph
#[derive(Debug, Clone, Default)]
pub struct InputNode {
    pub(crate) feed: Option<Buffer>,
}

impl InputNode {
    /// Data currently fed in
    pub fn feed(&self) -> Option<&Buffer> {
        self.feed.as_ref()
    }
}

/// Graph output: exposes its input to instance hosts and exporters
#[derive(Debug, Clone, Default)]
pub struct OutputNode {
    /// Role of the output
    pub out_type: OutputType,
    pub(crate) exposed: Option<Buffer>,
}

impl OutputNode {
    /// Create an output of the given role
    pub fn new(out_type: OutputType) -> Self {
        Self {
            out_type,
            exposed: None,
        }
    }

    /// Buffer currently exposed
    pub fn exposed(&self) -> Option<&Buffer> {
        self.exposed.as_ref()
    }
}

/// What a node computes
#[derive(Debug)]
pub enum NodeKind {
    /// Graph input
    Input(InputNode),
    /// Graph output
    Output(OutputNode),
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
    /// Embedded sub-graph
    Instance(Box<GraphInstance>),
}

impl NodeKind {
    /// Empty graph instance, ready for loading
    pub fn instance() -> Self {
        Self::Instance(Box::default())
    }

    /// Type name used in logs and records
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Input(_) => "Input",
            Self::Output(_) => "Output",
            Self::Fill(_) => "Fill",
            Self::Invert(_) => "Invert",
            Self::Grayscale(_) => "Grayscale",
            Self::Emboss(_) => "Emboss",
            Self::Levels(_) => "Levels",
            Self::Normals(_) => "Normals",
            Self::Instance(_) => "GraphInstance",
        }
    }

    /// Operator parameters, for kinds backed by a program
    pub fn operator(&self) -> Option<&dyn ImageOperator> {
        match self {
            Self::Fill(op) => Some(op),
            Self::Invert(op) => Some(op),
            Self::Grayscale(op) => Some(op),
            Self::Emboss(op) => Some(op),
            Self::Levels(op) => Some(op),
            Self::Normals(op) => Some(op),
            Self::Input(_) | Self::Output(_) | Self::Instance(_) => None,
        }
    }

    /// Mutable operator parameters
    pub fn operator_mut(&mut self) -> Option<&mut dyn ImageOperator> {
        match self {
            Self::Fill(op) => Some(op),
            Self::Invert(op) => Some(op),
            Self::Grayscale(op) => Some(op),
            Self::Emboss(op) => Some(op),
            Self::Levels(op) => Some(op),
            Self::Normals(op) => Some(op),
            Self::Input(_) | Self::Output(_) | Self::Instance(_) => None,
        }
    }

    fn default_ports(&self) -> (Vec<Port>, Vec<Port>) {
        match self {
            Self::Input(_) => (vec![], vec![Port::output("Output", DataKinds::IMAGE)]),
            Self::Output(_) => (vec![Port::input("Input", DataKinds::IMAGE)], vec![]),
            // Instance ports mirror the embedded graph and are built on load
            Self::Instance(_) => (vec![], vec![]),
            _ => {
                let samples = self.operator().is_some_and(|op| op.samples_input());
                let inputs = if samples {
                    vec![Port::input("Image Input", DataKinds::IMAGE)]
                } else {
                    vec![]
                };
                (inputs, vec![Port::output("Output", DataKinds::IMAGE)])
            }
        }
    }
}

/// Creation-time settings inherited from the graph
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeSettings {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Pixel format
    pub pixel_format: PixelFormat,
    /// Whether the node goes through the scheduler
    pub asynchronous: bool,
}

/// A node instance in the graph
#[derive(Debug)]
pub struct Node {
    pub(crate) id: NodeId,
    /// Display name
    pub name: String,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) tile_x: f32,
    pub(crate) tile_y: f32,
    pub(crate) pixel_format: PixelFormat,
    pub(crate) inputs: Vec<Port>,
    pub(crate) outputs: Vec<Port>,
    pub(crate) asynchronous: bool,
    pub(crate) graph: GraphId,
    pub(crate) buffer: Option<Buffer>,
    pub(crate) processor: Option<ShaderProcessor>,
    pub(crate) kind: NodeKind,
    pub(crate) dirty: bool,
}

impl Node {
    /// Create a node with a fresh id
    pub fn new(kind: NodeKind, settings: NodeSettings) -> Self {
        Self::with_id(NodeId::new(), kind, settings)
    }

    /// Create a node keeping a persisted id
    pub fn with_id(id: NodeId, kind: NodeKind, settings: NodeSettings) -> Self {
        let (inputs, outputs) = kind.default_ports();
        let (width, height) = match kind {
            // Outputs adopt the size of whatever reaches them
            NodeKind::Output(_) => (16, 16),
            _ => (settings.width, settings.height),
        };
        Self {
            id,
            name: kind.type_name().to_string(),
            width,
            height,
            tile_x: 1.0,
            tile_y: 1.0,
            pixel_format: settings.pixel_format,
            inputs,
            outputs,
            asynchronous: settings.asynchronous,
            graph: GraphId::detached(),
            buffer: None,
            processor: None,
            kind,
            dirty: false,
        }
    }

    /// Builder: set the display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Unique ID
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Width in pixels
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Horizontal and vertical tiling
    pub fn tiling(&self) -> (f32, f32) {
        (self.tile_x, self.tile_y)
    }

    /// Pixel format
    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    /// Whether processing goes through the scheduler
    pub fn is_asynchronous(&self) -> bool {
        self.asynchronous
    }

    /// Graph that owns this node
    pub fn graph_id(&self) -> GraphId {
        self.graph
    }

    /// Node kind
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// Embedded sub-graph state, for instance nodes
    pub fn instance(&self) -> Option<&GraphInstance> {
        match &self.kind {
            NodeKind::Instance(inst) => Some(inst),
            _ => None,
        }
    }

    pub(crate) fn instance_mut(&mut self) -> Option<&mut GraphInstance> {
        match &mut self.kind {
            NodeKind::Instance(inst) => Some(inst),
            _ => None,
        }
    }

    /// Input ports
    pub fn inputs(&self) -> &[Port] {
        &self.inputs
    }

    /// Output ports
    pub fn outputs(&self) -> &[Port] {
        &self.outputs
    }

    /// Get an input port by index
    pub fn input(&self, index: usize) -> Option<&Port> {
        self.inputs.get(index)
    }

    /// Get an output port by index
    pub fn output(&self, index: usize) -> Option<&Port> {
        self.outputs.get(index)
    }

    /// Buffer published on an output
    pub fn output_data(&self, index: usize) -> Option<&Buffer> {
        self.outputs.get(index).and_then(Port::data)
    }

    /// Cached buffer the node renders into
    pub fn buffer(&self) -> Option<&Buffer> {
        self.buffer.as_ref()
    }

    /// Whether a reprocess was requested and has not run yet
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Whether the node's program loaded
    pub fn has_processor(&self) -> bool {
        self.processor.is_some()
    }

    /// Local values of the node's promotable properties
    pub fn params(&self) -> Vec<(String, ParamValue)> {
        self.kind
            .operator()
            .map(|op| {
                op.params()
                    .into_iter()
                    .map(|(name, value)| (name.to_string(), value))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Local value of one property
    pub fn param(&self, name: &str) -> Option<ParamValue> {
        self.kind
            .operator()?
            .params()
            .into_iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v)
    }

    /// Store a local property value
    pub(crate) fn set_local_param(&mut self, name: &str, value: &ParamValue) -> Result<(), GraphError> {
        let id = self.id;
        let op = self.kind.operator_mut().ok_or_else(|| GraphError::UnknownParameter {
            node: id,
            name: name.to_string(),
        })?;
        op.set_param(name, value).map_err(|e| match e {
            ParamError::Unknown => GraphError::UnknownParameter {
                node: id,
                name: name.to_string(),
            },
            ParamError::TypeMismatch => GraphError::TypeMismatch(name.to_string()),
        })
    }

    /// Buffer the node currently shows
    pub fn active_buffer(&self) -> Option<&Buffer> {
        let buffer = match &self.kind {
            NodeKind::Input(input) => input.feed.as_ref(),
            NodeKind::Output(output) => output.exposed.as_ref(),
            NodeKind::Instance(_) => self.output_data(0),
            _ => self.buffer.as_ref(),
        };
        buffer.filter(|b| b.is_valid())
    }

    pub(crate) fn load_processor(&mut self, device: &dyn GpuDevice) {
        if let Some(op) = self.kind.operator() {
            self.processor = ShaderProcessor::load(device, op.program());
            if self.processor.is_none() {
                tracing::warn!("Node {} ({:?}): program '{}' unavailable", self.name, self.id, op.program());
            }
        }
    }

    pub(crate) fn release_buffer(&mut self, device: &dyn GpuDevice) {
        if let Some(buffer) = self.buffer.take() {
            device.release_texture(&buffer);
        }
    }

    /// Release everything held on the device and forget published data
    pub(crate) fn dispose(&mut self, device: &dyn GpuDevice) {
        self.release_buffer(device);
        if let Some(mut processor) = self.processor.take() {
            processor.release(device);
        }
        for port in &mut self.outputs {
            port.data = None;
        }
    }
}

/// Current buffer of `slot` when it still matches the requested shape
pub(crate) fn reusable_buffer(slot: Option<&Buffer>, width: u32, height: u32, format: PixelFormat) -> Option<Buffer> {
    slot.filter(|b| b.is_valid() && b.matches(width, height, format)).cloned()
}
