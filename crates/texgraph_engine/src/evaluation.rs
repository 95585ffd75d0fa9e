// SPDX-License-Identifier: MIT OR Apache-2.0
//! Graph evaluation and execution.
//!
//! Reprocessing a node has two phases. Phase 1 resolves the node's effective
//! parameters from an immutable [`ParamScope`] snapshot and may run on a
//! worker thread. Phase 2 allocates buffers, issues the draw and publishes
//! the result; it always runs on the thread owning the graph.

use crate::events::GraphEvent;
use crate::graph::{Graph, GraphState};
use crate::node::{reusable_buffer, NodeId, NodeKind};
use crate::operators::ImageOperator;
use crate::params::{GraphParameterValue, ParamEnv, ParamKey, ParamScope, ParamValue};
use crate::processor::Processor;
use indexmap::{IndexMap, IndexSet};
use std::sync::Arc;
use texgraph_gpu::Buffer;

/// What a node needs resolved before it can draw
#[derive(Debug)]
pub enum ParamRequest {
    /// Operator copy to receive the effective values
    Operator(Box<dyn ImageOperator>),
    /// Values to push into an embedded graph
    Instance {
        /// Child entries that accept overrides
        pushable: Vec<ParamKey>,
        /// Child custom parameter names
        customs: Vec<String>,
        /// Every key the child owns, overridable or not
        owned: IndexSet<ParamKey>,
    },
    /// Nothing to resolve
    Passthrough,
}

/// Phase 1 output
#[derive(Debug)]
pub enum Resolved {
    /// Operator carrying effective values
    Operator(Box<dyn ImageOperator>),
    /// Overrides for an embedded graph
    Instance(PushDown),
    /// Nothing resolved
    Passthrough,
}

/// Parameter values an instance hands to its embedded graph
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushDown {
    /// Values for entries the child owns
    pub params: IndexMap<ParamKey, ParamValue>,
    /// Values for the child's custom parameters
    pub customs: IndexMap<String, ParamValue>,
    /// Ancestor values for keys the child does not own, passed further down
    pub inherited: IndexMap<ParamKey, ParamValue>,
}

impl PushDown {
    /// Whether nothing would be pushed
    pub fn is_empty(&self) -> bool {
        self.params.is_empty() && self.customs.is_empty() && self.inherited.is_empty()
    }
}

/// Self-contained Phase 1 work item
#[derive(Debug)]
pub struct ParamJob {
    node: NodeId,
    scope: Arc<ParamScope>,
    request: ParamRequest,
}

impl ParamJob {
    /// Create a job
    pub fn new(node: NodeId, scope: Arc<ParamScope>, request: ParamRequest) -> Self {
        Self { node, scope, request }
    }

    /// Node the job belongs to
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Resolve against the snapshot; touches no graph state
    pub fn resolve(self) -> (NodeId, Resolved) {
        let Self { node, scope, request } = self;
        let resolved = match request {
            ParamRequest::Operator(mut op) => {
                for (name, _) in op.params() {
                    if let Some(value) = scope.lookup(node, name) {
                        if let Err(e) = op.set_param(name, value) {
                            tracing::warn!("Ignoring parameter {}.{}: {}", node.0, name, e);
                        }
                    }
                }
                Resolved::Operator(op)
            }
            ParamRequest::Instance {
                pushable,
                customs,
                owned,
            } => {
                let params = pushable
                    .into_iter()
                    .filter_map(|key| scope.get(&key).cloned().map(|v| (key, v)))
                    .collect();
                let customs = customs
                    .into_iter()
                    .filter_map(|name| scope.lookup(node, &name).cloned().map(|v| (name, v)))
                    .collect();
                let inherited = scope
                    .iter()
                    .filter(|(key, _)| key.node != node && !owned.contains(*key))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                Resolved::Instance(PushDown {
                    params,
                    customs,
                    inherited,
                })
            }
            ParamRequest::Passthrough => Resolved::Passthrough,
        };
        (node, resolved)
    }
}

/// Levels of function-valued entries followed before falling back to templates
const MAX_NESTING: usize = 8;

/// Function evaluation reads other entries, evaluating nested functions
struct GraphEnv<'a> {
    graph: &'a Graph,
    depth: usize,
}

impl<'a> GraphEnv<'a> {
    fn new(graph: &'a Graph) -> Self {
        Self { graph, depth: 0 }
    }

    fn value_of(&self, param: &GraphParameterValue) -> ParamValue {
        if !param.is_function() || self.depth >= MAX_NESTING {
            return param.value.clone();
        }
        param.resolve(&GraphEnv {
            graph: self.graph,
            depth: self.depth + 1,
        })
    }
}

impl ParamEnv for GraphEnv<'_> {
    fn parameter(&self, key: &ParamKey) -> Option<ParamValue> {
        self.graph
            .parameters
            .get(key)
            .map(|p| self.value_of(p))
            .or_else(|| self.graph.inherited.get(key).cloned())
    }

    fn custom(&self, name: &str) -> Option<ParamValue> {
        self.graph
            .custom_parameters
            .iter()
            .find(|p| p.name == name)
            .map(|p| self.value_of(p))
    }

    fn seed(&self) -> i32 {
        self.graph.random_seed
    }
}

impl Graph {
    /// Request reprocessing of a node.
    ///
    /// Nodes without a usable input are skipped. Asynchronous nodes are
    /// queued for [`Graph::process_pending`]; the rest run immediately.
    pub fn try_and_process(&mut self, id: NodeId) {
        if self.state == GraphState::Loading {
            return;
        }
        if !self.has_usable_input(id) {
            tracing::trace!("{}: node {:?} has no usable input", self.name, id);
            return;
        }
        let asynchronous = match self.nodes.get_mut(&id) {
            Some(node) => {
                node.dirty = true;
                node.asynchronous && !self.synchronized
            }
            None => return,
        };

        if asynchronous {
            if self.scheduler.schedule(id) {
                tracing::trace!("{}: queued {:?}", self.name, id);
            }
            return;
        }

        if let Some(job) = self.param_job(id) {
            let (_, resolved) = job.resolve();
            self.run_buffer_phase(id, resolved);
        }
    }

    /// Request reprocessing of every node without inputs, in dependency order
    pub fn try_and_process_all(&mut self) {
        let order = match self.topological_order() {
            Ok(order) => order,
            Err(_) => self.nodes.keys().copied().collect(),
        };
        for id in order {
            let is_root = self.nodes.get(&id).is_some_and(|n| n.inputs.is_empty());
            if is_root {
                self.try_and_process(id);
            }
        }
    }

    /// Process the whole graph, draining queued work
    pub fn process(&mut self) -> usize {
        self.try_and_process_all();
        self.process_pending()
    }

    /// Drain queued nodes batch by batch; returns how many were drawn or published
    pub fn process_pending(&mut self) -> usize {
        if self.state != GraphState::Idle {
            return 0;
        }
        self.state = GraphState::Processing;
        let _span = tracing::debug_span!("process_pending", graph = %self.name).entered();

        let ctx = self.ctx.clone();
        let mut ran = 0;
        while let Some(batch) = self.scheduler.take_batch() {
            let jobs: Vec<ParamJob> = batch.iter().filter_map(|id| self.param_job(*id)).collect();
            tracing::debug!("{}: resolving batch of {}", self.name, jobs.len());
            for (id, resolved) in ctx.executor().resolve_batch(jobs) {
                // Inputs may have been disconnected while the batch was in flight
                if !self.has_usable_input(id) {
                    continue;
                }
                self.run_buffer_phase(id, resolved);
                ran += 1;
            }
        }

        self.state = GraphState::Idle;
        ran
    }

    /// Buffer currently published to an input
    pub fn input_data(&self, id: NodeId, input: usize) -> Option<Buffer> {
        let connection = self.connections.values().find(|c| c.feeds(id, input))?;
        self.nodes
            .get(&connection.from_node)?
            .output_data(connection.from_output)
            .filter(|b| b.is_valid())
            .cloned()
    }

    pub(crate) fn has_usable_input(&self, id: NodeId) -> bool {
        let Some(node) = self.nodes.get(&id) else {
            return false;
        };
        match &node.kind {
            NodeKind::Input(input) => input.feed.as_ref().is_some_and(Buffer::is_valid),
            NodeKind::Instance(_) => {
                node.inputs.is_empty() || (0..node.inputs.len()).any(|i| self.input_data(id, i).is_some())
            }
            _ if node.inputs.is_empty() => true,
            _ => self.input_data(id, 0).is_some(),
        }
    }

    /// Effective parameter values, cached until the next assignment
    pub(crate) fn param_scope(&mut self) -> Arc<ParamScope> {
        if let Some(scope) = &self.scope_cache {
            return scope.clone();
        }
        let mut scope = ParamScope::new();
        for (key, value) in &self.inherited {
            scope.insert(key.clone(), value.clone());
        }
        let env = GraphEnv::new(self);
        for (key, param) in &self.parameters {
            scope.insert(key.clone(), param.resolve(&env));
        }
        let scope = Arc::new(scope);
        self.scope_cache = Some(scope.clone());
        scope
    }

    /// Effective value of one entry, computed without touching the cache
    pub(crate) fn effective_value(&self, key: &ParamKey) -> Option<ParamValue> {
        if let Some(scope) = &self.scope_cache {
            return scope.get(key).cloned();
        }
        match self.parameters.get(key) {
            Some(param) => Some(param.resolve(&GraphEnv::new(self))),
            None => self.inherited.get(key).cloned(),
        }
    }

    /// Effective value of a custom parameter, functions evaluated
    pub(crate) fn effective_custom(&self, name: &str) -> Option<ParamValue> {
        GraphEnv::new(self).custom(name)
    }

    fn param_job(&mut self, id: NodeId) -> Option<ParamJob> {
        let scope = self.param_scope();
        let node = self.nodes.get(&id)?;
        let request = match &node.kind {
            NodeKind::Instance(inst) => match inst.graph() {
                Some(child) => ParamRequest::Instance {
                    pushable: child
                        .parameters
                        .iter()
                        .filter(|(_, p)| !p.is_function())
                        .map(|(k, _)| k.clone())
                        .collect(),
                    customs: child
                        .custom_parameters
                        .iter()
                        .filter(|p| !p.is_function())
                        .map(|p| p.name.clone())
                        .collect(),
                    owned: child.parameters.keys().cloned().collect(),
                },
                None => ParamRequest::Passthrough,
            },
            kind => match kind.operator() {
                Some(op) => ParamRequest::Operator(op.boxed_clone()),
                None => ParamRequest::Passthrough,
            },
        };
        Some(ParamJob::new(id, scope, request))
    }

    fn run_buffer_phase(&mut self, id: NodeId, resolved: Resolved) {
        match resolved {
            Resolved::Operator(op) => self.run_operator(id, op.as_ref()),
            Resolved::Instance(push) => self.run_instance(id, push),
            Resolved::Passthrough => self.run_passthrough(id),
        }
    }

    fn run_operator(&mut self, id: NodeId, op: &dyn ImageOperator) {
        let input = if op.samples_input() {
            match self.input_data(id, 0) {
                Some(buffer) => Some(buffer),
                None => return,
            }
        } else {
            None
        };

        let ctx = self.ctx.clone();
        let device = ctx.device();
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        let Some(processor) = node.processor.as_mut() else {
            tracing::warn!("{}: node {} has no processor, skipping", self.name, node.name);
            return;
        };

        // The published buffer stays intact until its replacement is drawn
        let reused = reusable_buffer(node.buffer.as_ref(), node.width, node.height, node.pixel_format);
        let fresh = reused.is_none();
        let buffer = match reused {
            Some(buffer) => buffer,
            None => match device.create_texture(node.width, node.height, node.pixel_format) {
                Ok(buffer) => buffer,
                Err(e) => {
                    tracing::error!("{}: cannot allocate buffer for {}: {}", self.name, node.name, e);
                    return;
                }
            },
        };

        processor.tile_x = node.tile_x;
        processor.tile_y = node.tile_y;
        processor.bind(op);
        if let Err(e) = processor.process(device, node.width, node.height, input.as_ref(), &buffer) {
            tracing::warn!("{}: node {} failed to process: {}", self.name, node.name, e);
            if fresh {
                device.release_texture(&buffer);
            }
            return;
        }
        processor.complete(device);
        node.dirty = false;
        let previous = if fresh { node.buffer.replace(buffer.clone()) } else { None };

        self.observers.emit(&GraphEvent::Updated(id));
        self.publish(id, 0, Some(buffer));
        if let Some(previous) = previous {
            device.release_texture(&previous);
        }
    }

    fn run_passthrough(&mut self, id: NodeId) {
        let input = self.input_data(id, 0);
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        let publish = match &mut node.kind {
            NodeKind::Input(input_node) => match input_node.feed.clone().filter(Buffer::is_valid) {
                Some(feed) => {
                    node.width = feed.width();
                    node.height = feed.height();
                    Some(feed)
                }
                None => return,
            },
            NodeKind::Output(output) => {
                let Some(buffer) = input else {
                    return;
                };
                node.width = buffer.width();
                node.height = buffer.height();
                output.exposed = Some(buffer);
                None
            }
            _ => return,
        };
        node.dirty = false;

        self.observers.emit(&GraphEvent::Updated(id));
        if let Some(buffer) = publish {
            self.publish(id, 0, Some(buffer));
        }
    }

    fn run_instance(&mut self, id: NodeId, push: PushDown) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        let inputs: Vec<Option<Buffer>> = (0..node.inputs.len()).map(|i| self.input_data(id, i)).collect();

        let _span = tracing::debug_span!("instance", graph = %self.name, node = %node.name).entered();
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        let Some(outputs) = node.instance_mut().and_then(|inst| inst.run(push, &inputs)) else {
            return;
        };
        node.dirty = false;

        self.observers.emit(&GraphEvent::Updated(id));
        for (index, data) in outputs.into_iter().enumerate() {
            self.publish(id, index, data);
        }
    }

    /// Store `data` on an output, notify, and reprocess its consumers
    pub(crate) fn publish(&mut self, id: NodeId, output: usize, data: Option<Buffer>) {
        let Some(port) = self.nodes.get_mut(&id).and_then(|n| n.outputs.get_mut(output)) else {
            return;
        };
        port.data = data;
        let has_data = port.has_data();
        self.observers.emit(&GraphEvent::OutputChanged {
            node: id,
            output,
            has_data,
        });

        let consumers: Vec<NodeId> = self
            .connections
            .values()
            .filter(|c| c.leaves(id, output))
            .map(|c| c.to_node)
            .collect();
        for consumer in consumers {
            self.try_and_process(consumer);
        }
    }

    /// Assign values computed by the parent without triggering reprocessing
    pub(crate) fn apply_pushdown(&mut self, push: PushDown) {
        let previous = self.state;
        self.state = GraphState::ResolvingOverrides;
        for (key, value) in &push.params {
            if let Err(e) = self.set_parameter_value(key.node, &key.name, value.clone()) {
                tracing::warn!("{}: override {} rejected: {}", self.name, key, e);
            }
        }
        for (name, value) in &push.customs {
            if let Err(e) = self.set_custom_parameter(name, value.clone()) {
                tracing::warn!("{}: custom override {} rejected: {}", self.name, name, e);
            }
        }
        self.inherited = push.inherited;
        self.scope_cache = None;
        self.state = previous;
    }

    /// Release every buffer not exposed by an output node, nested graphs included
    pub fn release_intermediate_buffers(&mut self) {
        let keep: Vec<Buffer> = self
            .output_nodes
            .iter()
            .filter_map(|id| self.exposed_output(*id))
            .collect();
        self.release_except(&keep);
    }

    fn release_except(&mut self, keep: &[Buffer]) {
        let ctx = self.ctx.clone();
        let mut released = 0;
        for node in self.nodes.values_mut() {
            let kept = node
                .buffer
                .as_ref()
                .map_or(true, |b| keep.iter().any(|k| k.same_texture(b)));
            if !kept {
                node.release_buffer(ctx.device());
                released += 1;
            }
            if let Some(child) = node.instance_mut().and_then(|inst| inst.graph_mut()) {
                child.release_except(keep);
            }
        }
        if released > 0 {
            tracing::trace!("{}: released {} intermediate buffers", self.name, released);
        }
    }
}
