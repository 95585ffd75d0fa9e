// SPDX-License-Identifier: MIT OR Apache-2.0
//! Graph data structure containing nodes and connections.

use crate::archive::MtgArchive;
use crate::connection::{Connection, ConnectionId};
use crate::context::EngineContext;
use crate::error::GraphError;
use crate::events::{GraphEvent, Observers, SubscriptionId};
use crate::instance::{GraphInstance, LoadContext};
use crate::node::{Node, NodeId, NodeKind, NodeSettings};
use crate::params::{GraphParameterValue, ParamFunction, ParamKey, ParamScope, ParamValue};
use crate::port::{DataKinds, Port};
use crate::scheduler::Scheduler;
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use texgraph_gpu::{Buffer, GpuDevice, PixelFormat};
use uuid::Uuid;

/// Unique identifier for a graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GraphId(pub Uuid);

impl GraphId {
    /// Create a new random graph ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Placeholder for nodes not yet added to a graph
    pub fn detached() -> Self {
        Self(Uuid::nil())
    }
}

impl Default for GraphId {
    fn default() -> Self {
        Self::new()
    }
}

/// What the graph is busy with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GraphState {
    /// Edits trigger reprocessing
    #[default]
    Idle,
    /// Parent values are being assigned; parameter edits do not trigger reprocessing
    ResolvingOverrides,
    /// Nodes are being restored; nothing processes
    Loading,
    /// The scheduler is draining
    Processing,
}

/// Position of a graph in an instance tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lineage {
    /// This graph
    pub graph: GraphId,
    /// Outermost graph of the tree
    pub top: GraphId,
    /// Instance node hosting this graph in its parent
    pub parent_node: Option<NodeId>,
    /// Nesting depth, zero at the top
    pub depth: usize,
}

impl Lineage {
    /// Lineage of a top-level graph
    pub fn root() -> Self {
        let graph = GraphId::new();
        Self {
            graph,
            top: graph,
            parent_node: None,
            depth: 0,
        }
    }

    /// Lineage of a graph embedded by `host`
    pub fn child(&self, host: NodeId) -> Self {
        Self {
            graph: GraphId::new(),
            top: self.top,
            parent_node: Some(host),
            depth: self.depth + 1,
        }
    }

    /// Whether this is the outermost graph
    pub fn is_top(&self) -> bool {
        self.parent_node.is_none()
    }
}

/// A node graph.
///
/// A graph is pinned to the thread that created its [`EngineContext`]; every
/// buffer and program it owns is released when it is dropped.
pub struct Graph {
    /// Graph name
    pub name: String,
    pub(crate) ctx: Rc<EngineContext>,
    pub(crate) lineage: Lineage,
    /// Nodes in the graph
    pub(crate) nodes: IndexMap<NodeId, Node>,
    /// Connections between nodes
    pub(crate) connections: IndexMap<ConnectionId, Connection>,
    pub(crate) input_nodes: Vec<NodeId>,
    pub(crate) output_nodes: Vec<NodeId>,
    pub(crate) parameters: IndexMap<ParamKey, GraphParameterValue>,
    pub(crate) custom_parameters: Vec<GraphParameterValue>,
    /// Ancestor values for keys this graph does not own
    pub(crate) inherited: IndexMap<ParamKey, ParamValue>,
    pub(crate) random_seed: i32,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) pixel_format: PixelFormat,
    /// Forces every node to process immediately
    pub(crate) synchronized: bool,
    pub(crate) read_only: bool,
    pub(crate) state: GraphState,
    pub(crate) scheduler: Scheduler,
    pub(crate) observers: Observers,
    pub(crate) scope_cache: Option<Arc<ParamScope>>,
    pub(crate) cwd: Option<PathBuf>,
    pub(crate) archive: Option<MtgArchive>,
}

impl Graph {
    /// Create a new empty top-level graph
    pub fn new(name: impl Into<String>, ctx: Rc<EngineContext>) -> Self {
        Self::with_lineage(name, ctx, Lineage::root())
    }

    pub(crate) fn with_lineage(name: impl Into<String>, ctx: Rc<EngineContext>, lineage: Lineage) -> Self {
        let config = ctx.config();
        let (width, height, pixel_format) = (config.default_width, config.default_height, config.default_pixel_format);
        Self {
            name: name.into(),
            ctx,
            lineage,
            nodes: IndexMap::new(),
            connections: IndexMap::new(),
            input_nodes: Vec::new(),
            output_nodes: Vec::new(),
            parameters: IndexMap::new(),
            custom_parameters: Vec::new(),
            inherited: IndexMap::new(),
            random_seed: 0,
            width,
            height,
            pixel_format,
            synchronized: false,
            read_only: false,
            state: GraphState::Idle,
            scheduler: Scheduler::new(),
            observers: Observers::default(),
            scope_cache: None,
            cwd: None,
            archive: None,
        }
    }

    /// Unique ID
    pub fn id(&self) -> GraphId {
        self.lineage.graph
    }

    /// Position in the instance tree
    pub fn lineage(&self) -> &Lineage {
        &self.lineage
    }

    /// Outermost graph of the tree
    pub fn top_id(&self) -> GraphId {
        self.lineage.top
    }

    /// Current activity
    pub fn state(&self) -> GraphState {
        self.state
    }

    /// Shared engine context
    pub fn context(&self) -> &Rc<EngineContext> {
        &self.ctx
    }

    /// Device the graph draws with
    pub fn device(&self) -> &dyn GpuDevice {
        self.ctx.device()
    }

    /// Whether structural edits are rejected
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Allow or reject structural edits; embedded graphs stay read-only
    pub fn set_read_only(&mut self, read_only: bool) -> Result<(), GraphError> {
        self.ensure_top()?;
        self.read_only = read_only;
        Ok(())
    }

    /// Whether every node processes immediately
    pub fn is_synchronized(&self) -> bool {
        self.synchronized
    }

    /// Process every node immediately, ignoring per-node asynchronous flags.
    ///
    /// Embedded graphs follow their host node; see [`Graph::set_node_asynchronous`].
    pub fn set_synchronized(&mut self, synchronized: bool) -> Result<(), GraphError> {
        self.ensure_top()?;
        self.synchronized = synchronized;
        Ok(())
    }

    /// Default node width
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Default node height
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Default pixel format
    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    /// Random seed
    pub fn random_seed(&self) -> i32 {
        self.random_seed
    }

    /// Directory sub-graph resources are resolved against
    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    /// Set the resource directory
    pub fn set_cwd(&mut self, cwd: impl Into<PathBuf>) {
        self.cwd = Some(cwd.into());
    }

    /// Archive the graph was loaded from
    pub fn archive(&self) -> Option<&MtgArchive> {
        self.archive.as_ref()
    }

    /// Attach the archive the graph came from
    pub fn set_archive(&mut self, archive: Option<MtgArchive>) {
        self.archive = archive;
    }

    /// Requests waiting for [`Graph::process_pending`]
    pub fn pending_count(&self) -> usize {
        self.scheduler.pending_count()
    }

    /// Settings given to new nodes
    pub fn node_settings(&self) -> NodeSettings {
        NodeSettings {
            width: self.width,
            height: self.height,
            pixel_format: self.pixel_format,
            asynchronous: self.ctx.config().default_asynchronous,
        }
    }

    fn ensure_top(&self) -> Result<(), GraphError> {
        if !self.lineage.is_top() {
            return Err(GraphError::Embedded(self.name.clone()));
        }
        Ok(())
    }

    fn ensure_editable(&self) -> Result<(), GraphError> {
        if self.read_only {
            return Err(GraphError::ReadOnly(self.name.clone()));
        }
        Ok(())
    }

    /// Add a node of `kind` with the graph's default settings
    pub fn create_node(&mut self, kind: NodeKind) -> Result<NodeId, GraphError> {
        let node = Node::new(kind, self.node_settings());
        self.add_node(node)
    }

    /// Add a node to the graph
    pub fn add_node(&mut self, node: Node) -> Result<NodeId, GraphError> {
        self.ensure_editable()?;
        Ok(self.insert_node(node))
    }

    pub(crate) fn insert_node(&mut self, mut node: Node) -> NodeId {
        let id = node.id;
        node.graph = self.lineage.graph;
        if node.processor.is_none() {
            node.load_processor(self.ctx.device());
        }
        match node.kind {
            NodeKind::Input(_) => self.input_nodes.push(id),
            NodeKind::Output(_) => self.output_nodes.push(id),
            _ => {}
        }
        tracing::debug!("{}: added {} node {:?}", self.name, node.kind.type_name(), id);
        self.nodes.insert(id, node);
        id
    }

    /// Remove a node, its connections, subscriptions and promoted parameters
    pub fn remove_node(&mut self, node_id: NodeId) -> Result<(), GraphError> {
        self.ensure_editable()?;
        if !self.nodes.contains_key(&node_id) {
            return Err(GraphError::NodeNotFound(node_id));
        }

        let touching: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|c| c.involves_node(node_id))
            .map(|c| c.id)
            .collect();
        for id in touching {
            if let Some(connection) = self.connections.shift_remove(&id) {
                if connection.to_node != node_id {
                    self.on_input_removed(connection.to_node, connection.to_input);
                }
            }
        }

        if let Some(mut node) = self.nodes.shift_remove(&node_id) {
            node.dispose(self.ctx.device());
        }
        self.observers.remove_node(node_id);
        self.scheduler.cancel(node_id);
        self.input_nodes.retain(|id| *id != node_id);
        self.output_nodes.retain(|id| *id != node_id);
        let before = self.parameters.len();
        self.parameters.retain(|key, _| key.node != node_id);
        if self.parameters.len() != before {
            self.scope_cache = None;
        }
        Ok(())
    }

    /// Get a node by ID
    pub fn node(&self, node_id: NodeId) -> Option<&Node> {
        self.nodes.get(&node_id)
    }

    pub(crate) fn node_mut(&mut self, node_id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&node_id)
    }

    /// Get all nodes
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Get all node IDs
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    /// Get the number of nodes
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Input nodes, in port order
    pub fn input_nodes(&self) -> &[NodeId] {
        &self.input_nodes
    }

    /// Output nodes, in port order
    pub fn output_nodes(&self) -> &[NodeId] {
        &self.output_nodes
    }

    /// Whether `node_id` lives in this graph or any graph it instances
    pub fn contains_node_deep(&self, node_id: NodeId) -> bool {
        self.nodes.contains_key(&node_id)
            || self
                .nodes
                .values()
                .filter_map(|n| n.instance().and_then(GraphInstance::graph))
                .any(|child| child.contains_node_deep(node_id))
    }

    /// Graph embedded by an instance node
    pub fn instance_graph(&self, host: NodeId) -> Option<&Graph> {
        self.nodes.get(&host)?.instance()?.graph()
    }

    /// Mutable access to an embedded graph; it stays read-only
    pub fn instance_graph_mut(&mut self, host: NodeId) -> Option<&mut Graph> {
        self.nodes.get_mut(&host)?.instance_mut()?.graph_mut()
    }

    /// Add a connection between ports
    pub fn connect(
        &mut self,
        from_node: NodeId,
        from_output: usize,
        to_node: NodeId,
        to_input: usize,
    ) -> Result<ConnectionId, GraphError> {
        self.ensure_editable()?;
        let id = self.link(from_node, from_output, to_node, to_input)?;
        self.observers.emit(&GraphEvent::InputAdded {
            node: to_node,
            input: to_input,
        });
        self.try_and_process(to_node);
        Ok(id)
    }

    /// Validate and store a connection without notifying anyone
    pub(crate) fn link(
        &mut self,
        from_node: NodeId,
        from_output: usize,
        to_node: NodeId,
        to_input: usize,
    ) -> Result<ConnectionId, GraphError> {
        // Validate nodes exist
        let source_node = self.nodes.get(&from_node).ok_or(GraphError::NodeNotFound(from_node))?;
        let target_node = self.nodes.get(&to_node).ok_or(GraphError::NodeNotFound(to_node))?;

        // Validate ports exist
        let source_port = source_node.output(from_output).ok_or(GraphError::PortNotFound {
            node: from_node,
            index: from_output,
        })?;
        let target_port = target_node.input(to_input).ok_or(GraphError::PortNotFound {
            node: to_node,
            index: to_input,
        })?;

        if !source_port.can_connect(target_port) {
            return Err(GraphError::IncompatiblePorts);
        }

        // An input has at most one source
        if self.connections.values().any(|c| c.feeds(to_node, to_input)) {
            return Err(GraphError::PortAlreadyConnected {
                node: to_node,
                index: to_input,
            });
        }

        if from_node == to_node {
            return Err(GraphError::SelfLoop);
        }

        if self.reaches(to_node, from_node) {
            return Err(GraphError::Cycle);
        }

        let connection = Connection::new(from_node, from_output, to_node, to_input);
        let id = connection.id;
        self.connections.insert(id, connection);
        Ok(id)
    }

    /// Whether `to` is downstream of `from`
    fn reaches(&self, from: NodeId, to: NodeId) -> bool {
        let mut stack = vec![from];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == to {
                return true;
            }
            if seen.insert(current) {
                stack.extend(
                    self.connections
                        .values()
                        .filter(|c| c.from_node == current)
                        .map(|c| c.to_node),
                );
            }
        }
        false
    }

    /// Remove a connection; the consumer clears its output and notifies
    pub fn disconnect(&mut self, connection_id: ConnectionId) -> Result<Connection, GraphError> {
        self.ensure_editable()?;
        let connection = self
            .connections
            .shift_remove(&connection_id)
            .ok_or(GraphError::ConnectionNotFound(connection_id))?;
        self.on_input_removed(connection.to_node, connection.to_input);
        Ok(connection)
    }

    /// Remove whatever feeds an input
    pub fn disconnect_input(&mut self, node_id: NodeId, input: usize) -> Result<Connection, GraphError> {
        let id = self
            .connection_to(node_id, input)
            .map(|c| c.id)
            .ok_or(GraphError::PortNotFound { node: node_id, index: input })?;
        self.disconnect(id)
    }

    fn on_input_removed(&mut self, node_id: NodeId, input: usize) {
        self.observers.emit(&GraphEvent::InputRemoved { node: node_id, input });
        let ctx = self.ctx.clone();
        let Some(node) = self.nodes.get_mut(&node_id) else {
            return;
        };
        node.dirty = false;
        self.scheduler.cancel(node_id);

        let outputs = node.outputs.len();
        match &mut node.kind {
            NodeKind::Output(output) => {
                output.exposed = None;
                self.observers.emit(&GraphEvent::Updated(node_id));
                return;
            }
            NodeKind::Instance(inst) => inst.clear(),
            _ => {}
        }
        node.release_buffer(ctx.device());
        for index in 0..outputs {
            self.publish(node_id, index, None);
        }
    }

    /// Get a connection by ID
    pub fn connection(&self, connection_id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&connection_id)
    }

    /// Get all connections
    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    /// Get connections leaving an output
    pub fn connections_from(&self, node_id: NodeId, output: usize) -> impl Iterator<Item = &Connection> {
        self.connections.values().filter(move |c| c.leaves(node_id, output))
    }

    /// Get the connection feeding an input
    pub fn connection_to(&self, node_id: NodeId, input: usize) -> Option<&Connection> {
        self.connections.values().find(|c| c.feeds(node_id, input))
    }

    /// Get connections involving a node
    pub fn connections_for_node(&self, node_id: NodeId) -> impl Iterator<Item = &Connection> {
        self.connections.values().filter(move |c| c.involves_node(node_id))
    }

    /// Get the number of connections
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Get nodes in topological order (for evaluation)
    pub fn topological_order(&self) -> Result<Vec<NodeId>, GraphError> {
        let mut visited = HashSet::new();
        let mut temp_mark = HashSet::new();
        let mut order = Vec::new();

        for node_id in self.nodes.keys() {
            if !visited.contains(node_id) {
                self.visit(*node_id, &mut visited, &mut temp_mark, &mut order)?;
            }
        }

        Ok(order)
    }

    fn visit(
        &self,
        node_id: NodeId,
        visited: &mut HashSet<NodeId>,
        temp_mark: &mut HashSet<NodeId>,
        order: &mut Vec<NodeId>,
    ) -> Result<(), GraphError> {
        if temp_mark.contains(&node_id) {
            return Err(GraphError::Cycle);
        }
        if visited.contains(&node_id) {
            return Ok(());
        }

        temp_mark.insert(node_id);

        // Visit all nodes that this node depends on
        for connection in self.connections_for_node(node_id) {
            if connection.to_node == node_id {
                self.visit(connection.from_node, visited, temp_mark, order)?;
            }
        }

        temp_mark.remove(&node_id);
        visited.insert(node_id);
        order.push(node_id);

        Ok(())
    }

    /// Assign a node's local property and reprocess it
    pub fn set_node_param(&mut self, node_id: NodeId, name: &str, value: ParamValue) -> Result<(), GraphError> {
        self.nodes
            .get_mut(&node_id)
            .ok_or(GraphError::NodeNotFound(node_id))?
            .set_local_param(name, &value)?;
        self.try_and_process(node_id);
        Ok(())
    }

    /// Rename a node
    pub fn rename_node(&mut self, node_id: NodeId, name: impl Into<String>) -> Result<(), GraphError> {
        self.nodes.get_mut(&node_id).ok_or(GraphError::NodeNotFound(node_id))?.name = name.into();
        Ok(())
    }

    /// Resize a node and reprocess it; instances resize their embedded graph
    pub fn set_node_size(&mut self, node_id: NodeId, width: u32, height: u32) -> Result<(), GraphError> {
        let node = self.nodes.get_mut(&node_id).ok_or(GraphError::NodeNotFound(node_id))?;
        node.width = width;
        node.height = height;
        if let Some(child) = node.instance_mut().and_then(GraphInstance::graph_mut) {
            child.resize_with(width, height);
        }
        self.try_and_process(node_id);
        Ok(())
    }

    /// Change a node's tiling and reprocess it
    pub fn set_node_tiling(&mut self, node_id: NodeId, tile_x: f32, tile_y: f32) -> Result<(), GraphError> {
        let node = self.nodes.get_mut(&node_id).ok_or(GraphError::NodeNotFound(node_id))?;
        node.tile_x = tile_x;
        node.tile_y = tile_y;
        self.try_and_process(node_id);
        Ok(())
    }

    /// Change a node's pixel format and reprocess it.
    ///
    /// Instances cannot render formats their embedded graph does not support;
    /// those fall back to [`PixelFormat::Rgba`].
    pub fn set_node_pixel_format(&mut self, node_id: NodeId, format: PixelFormat) -> Result<(), GraphError> {
        let node = self.nodes.get_mut(&node_id).ok_or(GraphError::NodeNotFound(node_id))?;
        let format = match node.instance_mut() {
            Some(inst) => {
                let format = instance_format(format);
                if let Some(child) = inst.graph_mut() {
                    child.assign_pixel_format(format);
                }
                format
            }
            None => format,
        };
        node.pixel_format = format;
        self.try_and_process(node_id);
        Ok(())
    }

    /// Choose between immediate and scheduled processing for a node
    pub fn set_node_asynchronous(&mut self, node_id: NodeId, asynchronous: bool) -> Result<(), GraphError> {
        let node = self.nodes.get_mut(&node_id).ok_or(GraphError::NodeNotFound(node_id))?;
        node.asynchronous = asynchronous;
        if let Some(child) = node.instance_mut().and_then(GraphInstance::graph_mut) {
            child.synchronized = !asynchronous;
        }
        Ok(())
    }

    /// Resize every node except outputs, recursing into instances
    pub fn resize_with(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        for node in self.nodes.values_mut() {
            if matches!(node.kind, NodeKind::Output(_)) {
                continue;
            }
            node.width = width;
            node.height = height;
            if let Some(child) = node.instance_mut().and_then(GraphInstance::graph_mut) {
                child.resize_with(width, height);
            }
        }
    }

    /// Apply a pixel format to the graph and every node, recursing into instances
    pub fn assign_pixel_format(&mut self, format: PixelFormat) {
        self.pixel_format = format;
        for node in self.nodes.values_mut() {
            node.pixel_format = format;
            if let Some(child) = node.instance_mut().and_then(GraphInstance::graph_mut) {
                child.assign_pixel_format(instance_format(format));
            }
        }
    }

    /// Load the sub-graph of an instance node and rebuild its ports.
    ///
    /// Returns whether a graph was loaded. Connections to ports the new
    /// sub-graph no longer has are dropped.
    pub fn load_instance(&mut self, host: NodeId, path: &str) -> Result<bool, GraphError> {
        self.ensure_editable()?;
        let lc = self.load_context(host)?;
        let node = self.nodes.get_mut(&host).ok_or(GraphError::NodeNotFound(host))?;
        let inst = node.instance_mut().ok_or(GraphError::NotAnInstance(host))?;

        let loaded = inst.load(path, &lc);
        let (inputs, outputs) = inst.ports();
        if let Some(name) = inst.name().map(str::to_string) {
            node.name = name;
        }
        node.inputs = inputs;
        node.outputs = outputs;
        self.prune_connections(host);

        self.try_and_process(host);
        Ok(loaded)
    }

    pub(crate) fn load_context(&self, host: NodeId) -> Result<LoadContext, GraphError> {
        let node = self.nodes.get(&host).ok_or(GraphError::NodeNotFound(host))?;
        Ok(LoadContext {
            ctx: self.ctx.clone(),
            parent: self.lineage,
            host,
            archive: self.archive.clone(),
            cwd: self.cwd.clone(),
            width: node.width,
            height: node.height,
            pixel_format: node.pixel_format,
            asynchronous: node.asynchronous,
        })
    }

    /// Drop connections referring to ports that no longer exist
    fn prune_connections(&mut self, node_id: NodeId) {
        let Some(node) = self.nodes.get(&node_id) else {
            return;
        };
        let (inputs, outputs) = (node.inputs.len(), node.outputs.len());
        let before = self.connections.len();
        self.connections.retain(|_, c| {
            !((c.to_node == node_id && c.to_input >= inputs) || (c.from_node == node_id && c.from_output >= outputs))
        });
        let dropped = before - self.connections.len();
        if dropped > 0 {
            tracing::debug!("{}: dropped {} stale connections on {:?}", self.name, dropped, node_id);
        }
    }

    /// Hand data to an input node without processing it
    pub(crate) fn feed_input(&mut self, node_id: NodeId, data: Option<Buffer>) {
        let Some(node) = self.nodes.get_mut(&node_id) else {
            return;
        };
        let NodeKind::Input(input) = &mut node.kind else {
            return;
        };
        let cleared = data.is_none() && input.feed.is_some();
        input.feed = data;
        if cleared {
            self.publish(node_id, 0, None);
        }
    }

    /// Buffer exposed by an output node
    pub fn exposed_output(&self, node_id: NodeId) -> Option<Buffer> {
        match &self.nodes.get(&node_id)?.kind {
            NodeKind::Output(output) => output.exposed.clone().filter(Buffer::is_valid),
            _ => None,
        }
    }

    /// Forget every buffer, recursing into instances
    pub(crate) fn clear_buffers(&mut self) {
        let ctx = self.ctx.clone();
        for node in self.nodes.values_mut() {
            node.release_buffer(ctx.device());
            for port in &mut node.outputs {
                port.data = None;
            }
            match &mut node.kind {
                NodeKind::Input(input) => input.feed = None,
                NodeKind::Output(output) => output.exposed = None,
                NodeKind::Instance(inst) => inst.clear(),
                _ => {}
            }
        }
    }

    /// Buffer a node currently shows
    pub fn active_buffer(&self, node_id: NodeId) -> Option<Buffer> {
        self.nodes.get(&node_id)?.active_buffer().cloned()
    }

    /// Read back a node's active buffer as RGBA8, scaled to `width` x `height`
    pub fn preview(&self, node_id: NodeId, width: u32, height: u32) -> Option<Vec<u8>> {
        let buffer = self.active_buffer(node_id)?;
        let device = self.ctx.device();
        device.finish();
        match device.read_rgba8(&buffer, width, height) {
            Ok(pixels) => Some(pixels),
            Err(e) => {
                tracing::warn!("{}: preview failed: {}", self.name, e);
                None
            }
        }
    }

    /// Subscribe to events concerning one node
    pub fn subscribe(&mut self, node_id: NodeId, callback: impl FnMut(&GraphEvent) + 'static) -> SubscriptionId {
        self.observers.subscribe(node_id, Box::new(callback))
    }

    /// Subscribe to every event of the graph
    pub fn subscribe_all(&mut self, callback: impl FnMut(&GraphEvent) + 'static) -> SubscriptionId {
        self.observers.subscribe_all(Box::new(callback))
    }

    /// Cancel a subscription
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    /// Subscriptions on a node
    pub fn subscriber_count(&self, node_id: NodeId) -> usize {
        self.observers.subscriber_count(node_id)
    }

    // Parameters

    /// Promote a node property (or an instance's custom parameter) to a graph parameter
    pub fn promote_parameter(&mut self, node_id: NodeId, name: &str) -> Result<ParamKey, GraphError> {
        let node = self.nodes.get(&node_id).ok_or(GraphError::NodeNotFound(node_id))?;
        let value = node
            .param(name)
            .or_else(|| node.instance()?.custom_parameter(name).map(|p| p.value.clone()))
            .ok_or_else(|| GraphError::UnknownParameter {
                node: node_id,
                name: name.to_string(),
            })?;

        let key = ParamKey::new(node_id, name);
        if !self.parameters.contains_key(&key) {
            self.parameters.insert(key.clone(), GraphParameterValue::new(name, value));
            self.scope_cache = None;
            self.observers.emit(&GraphEvent::ParameterChanged(key.clone()));
        }
        Ok(key)
    }

    /// Store a parameter value, converting to the entry's type, and reprocess
    /// whatever reads it. Creates the entry when missing.
    pub fn set_parameter_value(&mut self, node_id: NodeId, name: &str, value: ParamValue) -> Result<(), GraphError> {
        let key = ParamKey::new(node_id, name);
        let changed = match self.parameters.get_mut(&key) {
            Some(param) => param.assign_value(&value)?,
            None => {
                self.parameters.insert(key.clone(), GraphParameterValue::new(name, value));
                true
            }
        };
        if changed {
            self.scope_cache = None;
            self.observers.emit(&GraphEvent::ParameterChanged(key.clone()));
        }
        self.on_parameter_changed(&key);
        Ok(())
    }

    /// Store a function-valued parameter; `template` fixes its type
    pub fn set_parameter_function(
        &mut self,
        node_id: NodeId,
        name: &str,
        template: ParamValue,
        function: ParamFunction,
    ) -> Result<(), GraphError> {
        let key = ParamKey::new(node_id, name);
        self.parameters
            .insert(key.clone(), GraphParameterValue::function(name, template, function));
        self.scope_cache = None;
        self.observers.emit(&GraphEvent::ParameterChanged(key.clone()));
        self.on_parameter_changed(&key);
        Ok(())
    }

    /// Remove a parameter entry; the node goes back to its local value
    pub fn remove_parameter(&mut self, node_id: NodeId, name: &str) -> Option<GraphParameterValue> {
        let key = ParamKey::new(node_id, name);
        let removed = self.parameters.shift_remove(&key)?;
        self.scope_cache = None;
        self.on_parameter_changed(&key);
        Some(removed)
    }

    /// Whether the graph owns or inherits a value for the property
    pub fn has_parameter_value(&self, node_id: NodeId, name: &str) -> bool {
        let key = ParamKey::new(node_id, name);
        self.parameters.contains_key(&key) || self.inherited.contains_key(&key)
    }

    /// Effective value of a property: functions evaluated, ancestors included
    pub fn get_parameter_value(&self, node_id: NodeId, name: &str) -> Option<ParamValue> {
        self.effective_value(&ParamKey::new(node_id, name))
    }

    /// Parameter entry by key
    pub fn parameter(&self, key: &ParamKey) -> Option<&GraphParameterValue> {
        self.parameters.get(key)
    }

    /// All parameter entries
    pub fn parameters(&self) -> impl Iterator<Item = (&ParamKey, &GraphParameterValue)> {
        self.parameters.iter()
    }

    /// Values pushed down by ancestors for keys this graph does not own
    pub fn inherited_parameters(&self) -> &IndexMap<ParamKey, ParamValue> {
        &self.inherited
    }

    /// Stored constants of entries that are not function-valued
    pub fn constant_parameters(&self) -> IndexMap<ParamKey, ParamValue> {
        self.parameters
            .iter()
            .filter(|(_, p)| !p.is_function())
            .map(|(k, p)| (k.clone(), p.value.clone()))
            .collect()
    }

    /// Assign saved values to existing entries without reprocessing
    pub fn assign_parameters(&mut self, values: &IndexMap<ParamKey, ParamValue>) {
        for (key, value) in values {
            match self.parameters.get_mut(key) {
                Some(param) if !param.is_function() => {
                    if let Err(e) = param.assign_value(value) {
                        tracing::warn!("{}: cannot restore {}: {}", self.name, key, e);
                    }
                }
                Some(_) => {}
                None => tracing::debug!("{}: no parameter {} to restore", self.name, key),
            }
        }
        self.scope_cache = None;
    }

    /// Add or replace a custom parameter
    pub fn add_custom_parameter(&mut self, param: GraphParameterValue) -> Result<(), GraphError> {
        self.ensure_editable()?;
        match self.custom_parameters.iter_mut().find(|p| p.name == param.name) {
            Some(existing) => *existing = param,
            None => self.custom_parameters.push(param),
        }
        self.scope_cache = None;
        Ok(())
    }

    /// Remove a custom parameter
    pub fn remove_custom_parameter(&mut self, name: &str) -> Result<GraphParameterValue, GraphError> {
        self.ensure_editable()?;
        let index = self
            .custom_parameters
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| GraphError::CustomParameterNotFound(name.to_string()))?;
        self.scope_cache = None;
        Ok(self.custom_parameters.remove(index))
    }

    /// Assign a custom parameter and reprocess whatever reads it
    pub fn set_custom_parameter(&mut self, name: &str, value: ParamValue) -> Result<(), GraphError> {
        let param = self
            .custom_parameters
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or_else(|| GraphError::CustomParameterNotFound(name.to_string()))?;
        if param.assign_value(&value)? {
            self.scope_cache = None;
            self.observers.emit(&GraphEvent::CustomParameterChanged(name.to_string()));
        }
        if self.state == GraphState::Idle {
            let targets = self.function_readers(|f| f.references_custom(name));
            self.reprocess_all(targets);
        }
        Ok(())
    }

    /// Effective value of a custom parameter, its function evaluated
    pub fn get_custom_parameter_value(&self, name: &str) -> Option<ParamValue> {
        self.effective_custom(name)
    }

    /// Custom parameter by name
    pub fn custom_parameter(&self, name: &str) -> Option<&GraphParameterValue> {
        self.custom_parameters.iter().find(|p| p.name == name)
    }

    /// All custom parameters
    pub fn custom_parameters(&self) -> &[GraphParameterValue] {
        &self.custom_parameters
    }

    /// Current custom parameter values by name
    pub fn custom_parameter_values(&self) -> IndexMap<String, ParamValue> {
        self.custom_parameters
            .iter()
            .map(|p| (p.name.clone(), p.value.clone()))
            .collect()
    }

    /// Assign saved custom values without reprocessing
    pub fn assign_custom_parameters(&mut self, values: &IndexMap<String, ParamValue>) {
        for (name, value) in values {
            let Some(param) = self.custom_parameters.iter_mut().find(|p| &p.name == name) else {
                tracing::debug!("{}: no custom parameter {} to restore", self.name, name);
                continue;
            };
            if let Err(e) = param.assign_value(value) {
                tracing::warn!("{}: cannot restore custom {}: {}", self.name, name, e);
            }
        }
        self.scope_cache = None;
    }

    /// Set the random seed without reprocessing
    pub fn assign_seed(&mut self, seed: i32) {
        self.random_seed = seed;
        self.scope_cache = None;
    }

    /// Set the random seed and reprocess seed readers
    pub fn set_random_seed(&mut self, seed: i32) {
        self.assign_seed(seed);
        let mut targets = self.function_readers(ParamFunction::references_seed);
        for (id, node) in &self.nodes {
            if let Some(inst) = node.instance() {
                if inst.graph().is_some() {
                    targets.insert(*id);
                }
            }
        }
        self.reprocess_all(targets);
    }

    /// Assign a parameter inside an instance's graph and reprocess the instance
    pub fn set_instance_parameter(&mut self, host: NodeId, key: &ParamKey, value: ParamValue) -> Result<(), GraphError> {
        let child = self.embedded_mut(host)?;
        if child.parameter(key).is_none() {
            return Err(GraphError::ParameterNotFound(key.clone()));
        }
        child.quietly(|g| g.set_parameter_value(key.node, &key.name, value))?;
        self.try_and_process(host);
        Ok(())
    }

    /// Assign a custom parameter of an instance's graph and reprocess the instance
    pub fn set_instance_custom_parameter(&mut self, host: NodeId, name: &str, value: ParamValue) -> Result<(), GraphError> {
        let child = self.embedded_mut(host)?;
        child.quietly(|g| g.set_custom_parameter(name, value))?;
        self.try_and_process(host);
        Ok(())
    }

    fn embedded_mut(&mut self, host: NodeId) -> Result<&mut Graph, GraphError> {
        self.nodes
            .get_mut(&host)
            .ok_or(GraphError::NodeNotFound(host))?
            .instance_mut()
            .and_then(GraphInstance::graph_mut)
            .ok_or(GraphError::NotAnInstance(host))
    }

    /// Run `f` with parameter-triggered reprocessing suppressed
    fn quietly<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        let previous = self.state;
        self.state = GraphState::ResolvingOverrides;
        let result = f(self);
        self.state = previous;
        result
    }

    fn on_parameter_changed(&mut self, key: &ParamKey) {
        if self.state != GraphState::Idle {
            return;
        }
        let mut targets = IndexSet::new();
        if self.nodes.contains_key(&key.node) {
            targets.insert(key.node);
        } else {
            for (id, node) in &self.nodes {
                let holds = node
                    .instance()
                    .and_then(GraphInstance::graph)
                    .is_some_and(|child| child.contains_node_deep(key.node));
                if holds {
                    targets.insert(*id);
                }
            }
        }
        targets.extend(self.function_readers(|f| f.references_parameter(key)));
        self.reprocess_all(targets);
    }

    /// Nodes whose function-valued entries satisfy `reads`, directly or
    /// through other function-valued entries
    fn function_readers(&self, reads: impl Fn(&ParamFunction) -> bool) -> IndexSet<NodeId> {
        let mut keys: IndexSet<ParamKey> = IndexSet::new();
        let mut customs: IndexSet<String> = IndexSet::new();
        loop {
            let before = keys.len() + customs.len();
            let affected = |f: &ParamFunction| {
                reads(f)
                    || keys.iter().any(|k| f.references_parameter(k))
                    || customs.iter().any(|c| f.references_custom(c))
            };
            let new_keys: Vec<ParamKey> = self
                .parameters
                .iter()
                .filter(|(k, p)| !keys.contains(*k) && p.function.as_ref().is_some_and(&affected))
                .map(|(k, _)| k.clone())
                .collect();
            let new_customs: Vec<String> = self
                .custom_parameters
                .iter()
                .filter(|p| !customs.contains(&p.name) && p.function.as_ref().is_some_and(&affected))
                .map(|p| p.name.clone())
                .collect();
            keys.extend(new_keys);
            customs.extend(new_customs);
            if keys.len() + customs.len() == before {
                break;
            }
        }
        keys.into_iter()
            .map(|k| k.node)
            .filter(|id| self.nodes.contains_key(id))
            .collect()
    }

    fn reprocess_all(&mut self, targets: IndexSet<NodeId>) {
        for id in targets {
            self.try_and_process(id);
        }
    }
}

/// Formats an embedded graph cannot render fall back to RGBA
pub(crate) fn instance_format(format: PixelFormat) -> PixelFormat {
    if format.is_instance_compatible() {
        format
    } else {
        tracing::warn!("Pixel format {:?} is not supported by graph instances, using Rgba", format);
        PixelFormat::Rgba
    }
}

impl Drop for Graph {
    fn drop(&mut self) {
        let device = self.ctx.device();
        for node in self.nodes.values_mut() {
            node.dispose(device);
        }
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("name", &self.name)
            .field("lineage", &self.lineage)
            .field("nodes", &self.nodes.len())
            .field("connections", &self.connections.len())
            .field("parameters", &self.parameters.len())
            .field("state", &self.state)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

/// Port used for the inputs an instance mirrors from its graph
pub(crate) fn mirrored_input(name: &str) -> Port {
    Port::input(name, DataKinds::IMAGE)
}

/// Port used for the outputs an instance mirrors from its graph
pub(crate) fn mirrored_output(name: &str) -> Port {
    Port::output(name, DataKinds::IMAGE)
}
