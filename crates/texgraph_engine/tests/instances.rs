// SPDX-License-Identifier: MIT OR Apache-2.0
//! Graph instances: port mirroring, override pushdown and buffer release.

mod common;

use common::*;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use texgraph_engine::{
    EngineContext, Graph, GraphError, GraphParameterValue, GrayscaleNode, InvertNode, LoadSource, NodeId,
    NodeKind, ParamFunction, ParamValue,
};
use texgraph_gpu::{GpuDevice, PixelFormat};

const WHITE: [f32; 4] = [1.0, 1.0, 1.0, 1.0];

fn weight(w: f32) -> ParamValue {
    ParamValue::Vector4([w, 0.0, 0.0, 0.0])
}

fn grayscale(graph: &mut Graph) -> NodeId {
    graph
        .create_node(NodeKind::Grayscale(GrayscaleNode::default()))
        .unwrap()
}

/// `In -> instance(inner) -> Out`, saved as `<name>.mtg`
fn wrapper(ctx: &Rc<EngineContext>, dir: &Path, name: &str, inner: &Path) -> (Graph, PathBuf) {
    let mut graph = Graph::new(name, ctx.clone());
    let input_id = input(&mut graph);
    let host = graph.create_node(NodeKind::instance()).unwrap();
    assert!(graph.load_instance(host, &inner.to_string_lossy()).unwrap());
    let out = output(&mut graph);
    chain(&mut graph, &[input_id, host, out]);
    let path = save(&graph, dir, &format!("{name}.mtg"));
    (graph, path)
}

#[test]
fn test_instance_mirrors_embedded_ports() {
    let (device, ctx) = setup();
    let dir = tempfile::tempdir().unwrap();
    let (mut inner, nodes) = sub_graph(&ctx, "inverter", |g| vec![invert(g)]);
    inner.rename_node(nodes[0], "Source").unwrap();
    inner.rename_node(nodes[2], "Result").unwrap();
    let path = save(&inner, dir.path(), "inv.mtg");

    let (mut root, [_, host, out]) = host_graph(&ctx, &path, FILL);
    root.process();

    let node = root.node(host).unwrap();
    assert_eq!(node.name, "inv");
    assert_eq!(node.inputs().len(), 1);
    assert_eq!(node.outputs().len(), 1);
    assert_eq!(node.input(0).unwrap().name, "Source");
    assert_eq!(node.output(0).unwrap().name, "Result");

    let inst = node.instance().unwrap();
    assert_eq!(inst.source(), Some(LoadSource::GraphFile));
    assert_eq!(inst.input_node(0), Some(nodes[0]));
    assert_eq!(inst.output_node(0), Some(nodes[2]));
    assert!(inst.raw_data().is_some());

    let texel = first_texel(&device, root.active_buffer(out));
    assert!(approx(texel[0], 0.8));
    assert!(approx(texel[3], 1.0));
}

#[test]
fn test_outermost_override_wins() {
    let cases = [
        (Some(0.5), Some(0.75), 0.75),
        (Some(0.5), None, 0.5),
        (None, Some(0.75), 0.75),
        (None, None, 0.25),
    ];
    for (middle, outer, expected) in cases {
        let (device, ctx) = setup();
        let dir = tempfile::tempdir().unwrap();

        let (mut g3, nodes) = sub_graph(&ctx, "g3", |g| vec![grayscale(g)]);
        let gray = nodes[1];
        g3.set_parameter_value(gray, "Weight", weight(0.25)).unwrap();
        let p3 = save(&g3, dir.path(), "g3.mtg");

        let mut g2 = Graph::new("g2", ctx.clone());
        let g2_in = input(&mut g2);
        let g2_host = g2.create_node(NodeKind::instance()).unwrap();
        g2.load_instance(g2_host, &p3.to_string_lossy()).unwrap();
        let g2_out = output(&mut g2);
        chain(&mut g2, &[g2_in, g2_host, g2_out]);
        if let Some(v) = middle {
            g2.set_parameter_value(gray, "Weight", weight(v)).unwrap();
        }
        let p2 = save(&g2, dir.path(), "g2.mtg");

        let (_g1, p1) = wrapper(&ctx, dir.path(), "g1", &p2);

        let (mut root, [_, _, out]) = host_graph(&ctx, &p1, WHITE);
        if let Some(v) = outer {
            root.set_parameter_value(gray, "Weight", weight(v)).unwrap();
        }
        root.process();

        let red = first_texel(&device, root.active_buffer(out))[0];
        assert!(
            approx(red, expected),
            "middle {middle:?}, outer {outer:?}: got {red}, expected {expected}"
        );
    }
}

#[test]
fn test_function_parameters_are_not_overridden() {
    let (device, ctx) = setup();
    let dir = tempfile::tempdir().unwrap();
    let (mut inner, nodes) = sub_graph(&ctx, "fixed", |g| vec![grayscale(g)]);
    let gray = nodes[1];
    inner
        .set_parameter_function(gray, "Weight", weight(0.0), ParamFunction::Constant(weight(0.1)))
        .unwrap();
    let path = save(&inner, dir.path(), "fixed.mtg");

    let (mut root, [_, host, out]) = host_graph(&ctx, &path, WHITE);
    root.set_parameter_value(gray, "Weight", weight(0.75)).unwrap();
    root.process();

    assert!(approx(first_texel(&device, root.active_buffer(out))[0], 0.1));
    let child = root.instance_graph(host).unwrap();
    assert!(child.inherited_parameters().is_empty());
}

#[test]
fn test_non_owned_values_are_inherited() {
    let (_device, ctx) = setup();
    let dir = tempfile::tempdir().unwrap();
    let (inner, _) = sub_graph(&ctx, "plain", |g| vec![invert(g)]);
    let path = save(&inner, dir.path(), "plain.mtg");

    let (mut root, [fill_id, host, _]) = host_graph(&ctx, &path, FILL);
    let elsewhere = NodeId::new();
    root.set_parameter_value(elsewhere, "Level", ParamValue::Float(0.5)).unwrap();
    root.set_parameter_value(host, "Ignored", ParamValue::Float(1.0)).unwrap();
    root.set_parameter_value(fill_id, "Color", ParamValue::Color(WHITE)).unwrap();
    root.process();

    let child = root.instance_graph_mut(host).unwrap();
    // Keys addressed at the host itself are consumed as custom parameters
    assert_eq!(child.inherited_parameters().len(), 2);
    assert!(child.has_parameter_value(elsewhere, "Level"));
    assert!(child.has_parameter_value(fill_id, "Color"));
    assert!(!child.has_parameter_value(host, "Ignored"));
    assert_eq!(child.get_parameter_value(elsewhere, "Level"), Some(ParamValue::Float(0.5)));
    assert!(child.parameters().next().is_none());
}

#[test]
fn test_pushdown_does_not_retrigger_embedded_nodes() {
    let (device, ctx) = setup();
    let dir = tempfile::tempdir().unwrap();
    let (mut inner, nodes) = sub_graph(&ctx, "channels", |g| vec![invert(g)]);
    let inv = nodes[1];
    for (name, value) in [("Red", true), ("Green", true), ("Blue", true), ("Alpha", false)] {
        inner.set_parameter_value(inv, name, ParamValue::Bool(value)).unwrap();
    }
    let path = save(&inner, dir.path(), "channels.mtg");

    let (mut root, [_, _, out]) = host_graph(&ctx, &path, FILL);
    root.process();

    for (name, value) in [("Red", false), ("Green", true), ("Blue", true), ("Alpha", false)] {
        device.clear_draw_log();
        root.set_parameter_value(inv, name, ParamValue::Bool(value)).unwrap();
        assert_eq!(draws_of(&device, "invert"), 1, "pushing {name}");
        assert_eq!(draws_of(&device, "uniform_color"), 0);
    }

    let texel = first_texel(&device, root.active_buffer(out));
    assert!(approx(texel[0], 0.2));
    assert!(approx(texel[1], 0.6));
}

#[test]
fn test_nested_instances_keep_two_buffers() {
    let (device, ctx) = setup();
    let dir = tempfile::tempdir().unwrap();
    let (g3, _) = sub_graph(&ctx, "g3", |g| vec![invert(g), invert(g)]);
    let p3 = save(&g3, dir.path(), "g3.mtg");
    let (_g2, p2) = wrapper(&ctx, dir.path(), "g2", &p3);
    let (_g1, p1) = wrapper(&ctx, dir.path(), "g1", &p2);
    assert_eq!(device.live_textures(), 0);

    let (mut root, [fill_id, host, out]) = host_graph(&ctx, &p1, FILL);
    root.process();
    assert_eq!(root.instance_graph(host).unwrap().lineage().depth, 1);
    assert!(approx(first_texel(&device, root.active_buffer(out))[0], 0.2));
    // The fill and the deepest graph's exposed result
    assert_eq!(device.live_textures(), 2);

    for level in [0.1, 0.3, 0.5] {
        root.set_node_param(fill_id, "Color", ParamValue::Color([level, level, level, 1.0]))
            .unwrap();
        assert!(approx(first_texel(&device, root.active_buffer(out))[0], level));
        assert_eq!(device.live_textures(), 2);
    }
}

#[test]
fn test_embedded_graph_is_read_only() {
    let (_device, ctx) = setup();
    let dir = tempfile::tempdir().unwrap();
    let (inner, nodes) = sub_graph(&ctx, "locked", |g| vec![invert(g)]);
    let path = save(&inner, dir.path(), "locked.mtg");
    let (mut root, [_, host, _]) = host_graph(&ctx, &path, FILL);

    let child = root.instance_graph_mut(host).unwrap();
    assert!(child.is_read_only());
    let count = child.node_count();
    assert!(matches!(
        child.create_node(NodeKind::Invert(InvertNode::default())),
        Err(GraphError::ReadOnly(_))
    ));
    assert!(matches!(child.remove_node(nodes[1]), Err(GraphError::ReadOnly(_))));
    assert!(matches!(child.disconnect_input(nodes[1], 0), Err(GraphError::ReadOnly(_))));
    assert_eq!(child.node_count(), count);
    assert_eq!(child.connection_count(), 2);

    assert!(matches!(child.set_read_only(false), Err(GraphError::Embedded(_))));
    assert!(matches!(child.set_synchronized(false), Err(GraphError::Embedded(_))));
    assert!(child.is_read_only());
    assert!(child.is_synchronized());
}

#[test]
fn test_instance_parameter_by_key_and_custom_by_name() {
    let (device, ctx) = setup();
    let dir = tempfile::tempdir().unwrap();
    let (mut inner, nodes) = sub_graph(&ctx, "scaled", |g| vec![grayscale(g)]);
    let gray = nodes[1];
    inner
        .add_custom_parameter(GraphParameterValue::new("Amount", ParamValue::Float(1.0)))
        .unwrap();
    inner
        .set_parameter_function(
            gray,
            "Weight",
            weight(0.0),
            ParamFunction::Mul(
                Box::new(ParamFunction::Constant(weight(1.0))),
                Box::new(ParamFunction::Custom("Amount".to_string())),
            ),
        )
        .unwrap();
    inner.set_parameter_value(nodes[0], "Unused", ParamValue::Int(3)).unwrap();
    let path = save(&inner, dir.path(), "scaled.mtg");

    let (mut root, [_, host, out]) = host_graph(&ctx, &path, WHITE);
    root.process();
    let red = |root: &Graph| first_texel(&device, root.active_buffer(out))[0];
    assert!(approx(red(&root), 1.0));

    root.set_instance_custom_parameter(host, "Amount", ParamValue::Float(0.5))
        .unwrap();
    assert!(approx(red(&root), 0.5));
    let inst = root.node(host).unwrap().instance().unwrap();
    assert_eq!(inst.custom_parameter("Amount").unwrap().value, ParamValue::Float(0.5));

    // A value the host graph owns for the instance overrides the custom parameter
    root.set_parameter_value(host, "Amount", ParamValue::Float(0.25)).unwrap();
    assert!(approx(red(&root), 0.25));

    let key = texgraph_engine::ParamKey::new(nodes[0], "Unused");
    root.set_instance_parameter(host, &key, ParamValue::Int(7)).unwrap();
    let child = root.instance_graph(host).unwrap();
    assert_eq!(child.parameter(&key).unwrap().value, ParamValue::Int(7));

    let missing = texgraph_engine::ParamKey::new(gray, "Nothing");
    assert!(matches!(
        root.set_instance_parameter(host, &missing, ParamValue::Int(1)),
        Err(GraphError::ParameterNotFound(_))
    ));
    assert!(matches!(
        root.set_instance_custom_parameter(host, "Nothing", ParamValue::Int(1)),
        Err(GraphError::CustomParameterNotFound(_))
    ));
}

#[test]
fn test_function_custom_parameter_is_evaluated_and_kept() {
    let (device, ctx) = setup();
    let dir = tempfile::tempdir().unwrap();
    let (mut inner, nodes) = sub_graph(&ctx, "derived", |g| vec![grayscale(g)]);
    inner
        .add_custom_parameter(GraphParameterValue::function(
            "Amount",
            ParamValue::Float(1.0),
            ParamFunction::Constant(ParamValue::Float(0.5)),
        ))
        .unwrap();
    inner
        .set_parameter_function(
            nodes[1],
            "Weight",
            weight(0.0),
            ParamFunction::Mul(
                Box::new(ParamFunction::Constant(weight(1.0))),
                Box::new(ParamFunction::Custom("Amount".to_string())),
            ),
        )
        .unwrap();
    let path = save(&inner, dir.path(), "derived.mtg");

    let (mut root, [_, host, out]) = host_graph(&ctx, &path, WHITE);
    root.process();
    let red = |root: &Graph| first_texel(&device, root.active_buffer(out))[0];
    assert!(approx(red(&root), 0.5));

    root.set_parameter_value(host, "Amount", ParamValue::Float(0.25)).unwrap();
    assert!(approx(red(&root), 0.5));
    let child = root.instance_graph(host).unwrap();
    assert_eq!(child.get_custom_parameter_value("Amount"), Some(ParamValue::Float(0.5)));
    assert_eq!(child.custom_parameter("Amount").unwrap().value, ParamValue::Float(1.0));
}

#[test]
fn test_resize_reaches_embedded_graph() {
    let (device, ctx) = setup();
    let dir = tempfile::tempdir().unwrap();
    let (inner, nodes) = sub_graph(&ctx, "sized", |g| vec![invert(g)]);
    let path = save(&inner, dir.path(), "sized.mtg");
    let (mut root, [fill_id, host, out]) = host_graph(&ctx, &path, FILL);
    root.process();

    root.set_node_size(fill_id, 8, 8).unwrap();
    root.set_node_size(host, 8, 8).unwrap();

    let child = root.instance_graph(host).unwrap();
    assert_eq!(child.width(), 8);
    let inv = child.node(nodes[1]).unwrap();
    assert_eq!((inv.width(), inv.height()), (8, 8));

    let exposed = root.active_buffer(out).unwrap();
    assert_eq!((exposed.width(), exposed.height()), (8, 8));
    assert_eq!(device.read_texels(&exposed).unwrap().len(), 64);
}

#[test]
fn test_instance_pixel_format_falls_back_to_rgba() {
    let (_device, ctx) = setup();
    let dir = tempfile::tempdir().unwrap();
    let (inner, nodes) = sub_graph(&ctx, "format", |g| vec![invert(g)]);
    let path = save(&inner, dir.path(), "format.mtg");
    let (mut root, [_, host, _]) = host_graph(&ctx, &path, FILL);

    root.set_node_pixel_format(host, PixelFormat::Gray).unwrap();
    assert_eq!(root.node(host).unwrap().pixel_format(), PixelFormat::Rgba);
    let child = root.instance_graph(host).unwrap();
    assert_eq!(child.pixel_format(), PixelFormat::Rgba);
    assert_eq!(child.node(nodes[1]).unwrap().pixel_format(), PixelFormat::Rgba);

    root.set_node_pixel_format(host, PixelFormat::Rgb).unwrap();
    let child = root.instance_graph(host).unwrap();
    assert_eq!(child.node(nodes[1]).unwrap().pixel_format(), PixelFormat::Rgb);
}

#[test]
fn test_reloading_drops_stale_connections() {
    let (_device, ctx) = setup();
    let dir = tempfile::tempdir().unwrap();
    let (inner, _) = sub_graph(&ctx, "first", |g| vec![invert(g)]);
    let first = save(&inner, dir.path(), "first.mtg");

    let mut generator = Graph::new("generator", ctx.clone());
    let fill_id = fill(&mut generator, FILL);
    let out = output(&mut generator);
    chain(&mut generator, &[fill_id, out]);
    let second = save(&generator, dir.path(), "second.mtg");

    let (mut root, [_, host, _]) = host_graph(&ctx, &first, FILL);
    assert_eq!(root.connection_count(), 2);

    assert!(root.load_instance(host, &second.to_string_lossy()).unwrap());
    assert!(root.node(host).unwrap().inputs().is_empty());
    assert_eq!(root.node(host).unwrap().name, "second");
    assert_eq!(root.connection_count(), 1);
}
