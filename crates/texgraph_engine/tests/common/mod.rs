// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared fixtures for the engine integration tests.
#![allow(dead_code)]

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use texgraph_engine::{
    EngineConfig, EngineContext, FillNode, Graph, GraphEvent, InvertNode, NodeId, NodeKind, OutputNode,
    OutputType,
};
use texgraph_gpu::{Buffer, GpuDevice, SoftwareDevice};

pub const FILL: [f32; 4] = [0.2, 0.4, 0.6, 1.0];

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn small_config() -> EngineConfig {
    EngineConfig {
        phase1_workers: 0,
        default_width: 4,
        default_height: 4,
        ..EngineConfig::default()
    }
}

/// Device plus a context resolving parameters inline
pub fn setup() -> (Rc<SoftwareDevice>, Rc<EngineContext>) {
    setup_with(small_config(), SoftwareDevice::new())
}

pub fn setup_with(config: EngineConfig, device: SoftwareDevice) -> (Rc<SoftwareDevice>, Rc<EngineContext>) {
    init_tracing();
    let device = Rc::new(device);
    let ctx = EngineContext::new(device.clone(), config).unwrap();
    (device, ctx)
}

pub fn fill(graph: &mut Graph, color: [f32; 4]) -> NodeId {
    graph.create_node(NodeKind::Fill(FillNode { color })).unwrap()
}

pub fn invert(graph: &mut Graph) -> NodeId {
    graph.create_node(NodeKind::Invert(InvertNode::default())).unwrap()
}

pub fn input(graph: &mut Graph) -> NodeId {
    graph.create_node(NodeKind::Input(Default::default())).unwrap()
}

pub fn output(graph: &mut Graph) -> NodeId {
    graph
        .create_node(NodeKind::Output(OutputNode::new(OutputType::BaseColor)))
        .unwrap()
}

/// Connect `nodes` one after another through their first ports
pub fn chain(graph: &mut Graph, nodes: &[NodeId]) {
    for pair in nodes.windows(2) {
        graph.connect(pair[0], 0, pair[1], 0).unwrap();
    }
}

/// Graph of `In -> body... -> Out`, with the body built by `build`
pub fn sub_graph(
    ctx: &Rc<EngineContext>,
    name: &str,
    build: impl FnOnce(&mut Graph) -> Vec<NodeId>,
) -> (Graph, Vec<NodeId>) {
    let mut graph = Graph::new(name, ctx.clone());
    let mut nodes = vec![input(&mut graph)];
    nodes.extend(build(&mut graph));
    nodes.push(output(&mut graph));
    chain(&mut graph, &nodes);
    (graph, nodes)
}

pub fn save(graph: &Graph, dir: &Path, file: &str) -> PathBuf {
    let path = dir.join(file);
    graph.save_file(&path).unwrap();
    path
}

/// Root graph of `Fill -> instance(path) -> Out`; returns (fill, host, out)
pub fn host_graph(ctx: &Rc<EngineContext>, path: &Path, color: [f32; 4]) -> (Graph, [NodeId; 3]) {
    let mut root = Graph::new("root", ctx.clone());
    let fill_id = fill(&mut root, color);
    let host = root.create_node(NodeKind::instance()).unwrap();
    assert!(root.load_instance(host, &path.to_string_lossy()).unwrap());
    let out = output(&mut root);
    chain(&mut root, &[fill_id, host, out]);
    (root, [fill_id, host, out])
}

pub fn texels(device: &SoftwareDevice, buffer: Option<Buffer>) -> Vec<[f32; 4]> {
    device.read_texels(&buffer.unwrap()).unwrap()
}

pub fn first_texel(device: &SoftwareDevice, buffer: Option<Buffer>) -> [f32; 4] {
    texels(device, buffer)[0]
}

pub fn approx(a: f32, b: f32) -> bool {
    (a - b).abs() < 1e-5
}

/// Collect every event of a graph
pub fn record_events(graph: &mut Graph) -> Rc<RefCell<Vec<GraphEvent>>> {
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    graph.subscribe_all(move |e| sink.borrow_mut().push(e.clone()));
    events
}

pub fn draws_of(device: &SoftwareDevice, program: &str) -> usize {
    device.draw_log().iter().filter(|d| d.program == program).count()
}
