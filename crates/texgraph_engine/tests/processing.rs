// SPDX-License-Identifier: MIT OR Apache-2.0
//! Change-driven processing of flat graphs.

mod common;

use common::*;
use std::cell::Cell;
use std::rc::Rc;
use texgraph_engine::{EngineConfig, Graph, GraphEvent, GrayscaleNode, NodeKind, ParamValue};
use texgraph_gpu::{GpuDevice, SoftwareDevice};

#[test]
fn test_reprocess_is_idempotent() {
    let (device, ctx) = setup();
    let mut graph = Graph::new("idempotent", ctx);
    let fill_id = fill(&mut graph, FILL);
    let inv = invert(&mut graph);
    let out = output(&mut graph);
    chain(&mut graph, &[fill_id, inv, out]);
    graph.process();

    let first = texels(&device, graph.active_buffer(out));
    let buffer = graph.active_buffer(inv).unwrap();

    let changes = Rc::new(Cell::new(0));
    let counter = changes.clone();
    graph.subscribe(inv, move |e| {
        if matches!(e, GraphEvent::OutputChanged { .. }) {
            counter.set(counter.get() + 1);
        }
    });

    graph.try_and_process(inv);
    assert_eq!(changes.get(), 1);
    graph.try_and_process(inv);
    assert_eq!(changes.get(), 2);

    assert_eq!(texels(&device, graph.active_buffer(out)), first);
    // Same size and format keeps the same texture
    assert!(graph.active_buffer(inv).unwrap().same_texture(&buffer));
    assert!(approx(first[0][0], 0.8));
    assert!(approx(first[0][2], 0.4));
}

#[test]
fn test_consumers_follow_producers() {
    let (device, ctx) = setup();
    let mut graph = Graph::new("sync", ctx);
    let fill_id = fill(&mut graph, FILL);
    let a = invert(&mut graph);
    let b = invert(&mut graph);
    let c = invert(&mut graph);
    chain(&mut graph, &[fill_id, a, b, c]);

    device.clear_draw_log();
    graph
        .set_node_param(fill_id, "Color", ParamValue::Color([0.1, 0.1, 0.1, 1.0]))
        .unwrap();

    let log = device.draw_log();
    let programs: Vec<&str> = log.iter().map(|d| d.program.as_str()).collect();
    assert_eq!(programs, ["uniform_color", "invert", "invert", "invert"]);
    for pair in log.windows(2) {
        assert_eq!(pair[1].source, Some(pair[0].target));
    }
    assert!(approx(first_texel(&device, graph.active_buffer(c))[0], 0.9));
}

#[test]
fn test_async_batches_keep_dependency_order() {
    let config = EngineConfig {
        phase1_workers: 4,
        default_asynchronous: true,
        ..small_config()
    };
    let (device, ctx) = setup_with(config, SoftwareDevice::new());
    let mut graph = Graph::new("async", ctx);
    let fill_id = fill(&mut graph, FILL);
    let mut branches = Vec::new();
    for _ in 0..4 {
        let x = invert(&mut graph);
        let y = graph
            .create_node(NodeKind::Grayscale(GrayscaleNode::default()))
            .unwrap();
        chain(&mut graph, &[fill_id, x, y]);
        branches.push((x, y));
    }
    assert_eq!(graph.process(), 9);

    let events = record_events(&mut graph);
    for round in 0..25 {
        events.borrow_mut().clear();
        let level = round as f32 / 25.0;
        graph
            .set_node_param(fill_id, "Color", ParamValue::Color([level, level, level, 1.0]))
            .unwrap();
        assert_eq!(graph.pending_count(), 1);
        assert_eq!(graph.process_pending(), 9);
        assert_eq!(graph.pending_count(), 0);

        let updated: Vec<_> = events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                GraphEvent::Updated(id) => Some(*id),
                _ => None,
            })
            .collect();
        let position = |id| updated.iter().position(|u| *u == id).unwrap();
        assert_eq!(updated.len(), 9);
        assert_eq!(position(fill_id), 0);
        for (x, y) in &branches {
            assert!(position(*x) < position(*y));
        }

        let gray = first_texel(&device, graph.active_buffer(branches[0].1));
        assert!(approx(gray[0], 1.0 - level));
    }
}

#[test]
fn test_disconnect_clears_output_once() {
    let (device, ctx) = setup();
    let mut graph = Graph::new("disconnect", ctx);
    let fill_id = fill(&mut graph, FILL);
    let inv = invert(&mut graph);
    let out = output(&mut graph);
    chain(&mut graph, &[fill_id, inv, out]);
    graph.process();
    assert!(graph.active_buffer(out).is_some());

    let events = record_events(&mut graph);
    graph.disconnect_input(inv, 0).unwrap();

    let events = events.borrow();
    let cleared: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, GraphEvent::OutputChanged { node, .. } if *node == inv))
        .collect();
    assert_eq!(
        cleared,
        [&GraphEvent::OutputChanged {
            node: inv,
            output: 0,
            has_data: false
        }]
    );
    assert!(events.contains(&GraphEvent::InputRemoved { node: inv, input: 0 }));
    assert!(graph.node(inv).unwrap().output_data(0).is_none());
    assert!(graph.active_buffer(out).is_none());
    // Only the fill keeps a texture
    assert_eq!(device.live_textures(), 1);
}

#[test]
fn test_missing_processor_is_a_no_op() {
    let (device, ctx) = setup_with(small_config(), SoftwareDevice::new().without_program("invert"));
    let mut graph = Graph::new("missing", ctx);
    let fill_id = fill(&mut graph, FILL);
    let inv = invert(&mut graph);
    let out = output(&mut graph);
    let events = record_events(&mut graph);
    chain(&mut graph, &[fill_id, inv, out]);
    graph.process();

    assert!(!graph.node(inv).unwrap().has_processor());
    assert!(graph.node(inv).unwrap().output_data(0).is_none());
    assert!(graph.active_buffer(out).is_none());
    assert!(!events
        .borrow()
        .iter()
        .any(|e| matches!(e, GraphEvent::OutputChanged { node, .. } if *node == inv)));
    assert_eq!(draws_of(&device, "invert"), 0);
    assert!(draws_of(&device, "uniform_color") > 0);
}

#[test]
fn test_failed_redraw_keeps_last_output() {
    let (device, ctx) = setup();
    let mut graph = Graph::new("keep", ctx);
    let fill_id = fill(&mut graph, FILL);
    let inv = invert(&mut graph);
    let out = output(&mut graph);
    chain(&mut graph, &[fill_id, inv, out]);
    graph.process();
    let published = graph.active_buffer(inv).unwrap();
    let before = texels(&device, Some(published.clone()));

    let events = record_events(&mut graph);
    // A zero-sized texture cannot be allocated
    graph.set_node_size(inv, 0, 0).unwrap();

    assert!(published.is_valid());
    assert!(graph.active_buffer(inv).unwrap().same_texture(&published));
    assert!(graph.active_buffer(out).unwrap().same_texture(&published));
    assert_eq!(texels(&device, graph.active_buffer(out)), before);
    assert_eq!(device.live_textures(), 2);
    assert!(!events
        .borrow()
        .iter()
        .any(|e| matches!(e, GraphEvent::OutputChanged { node, .. } if *node == inv)));

    graph.set_node_size(inv, 8, 8).unwrap();
    let resized = graph.active_buffer(inv).unwrap();
    assert!(!resized.same_texture(&published));
    assert!(!published.is_valid());
    assert_eq!((resized.width(), resized.height()), (8, 8));
    assert!(graph.active_buffer(out).unwrap().same_texture(&resized));
    assert_eq!(device.live_textures(), 2);
}

#[test]
fn test_node_without_input_is_skipped() {
    let (device, ctx) = setup();
    let mut graph = Graph::new("lonely", ctx);
    let inv = invert(&mut graph);
    graph.try_and_process(inv);
    graph.process();

    assert!(device.draw_log().is_empty());
    assert_eq!(device.live_textures(), 0);
    assert!(graph.active_buffer(inv).is_none());
}

#[test]
fn test_released_input_is_not_drawn() {
    let (device, ctx) = setup();
    let mut graph = Graph::new("released", ctx);
    let fill_id = fill(&mut graph, FILL);
    let inv = invert(&mut graph);
    chain(&mut graph, &[fill_id, inv]);
    graph.process();

    let source = graph.active_buffer(fill_id).unwrap();
    device.release_texture(&source);
    device.clear_draw_log();
    graph.try_and_process(inv);

    assert!(graph.input_data(inv, 0).is_none());
    assert_eq!(draws_of(&device, "invert"), 0);
}

#[test]
fn test_synchronized_graph_ignores_async_nodes() {
    let config = EngineConfig {
        default_asynchronous: true,
        ..small_config()
    };
    let (device, ctx) = setup_with(config, SoftwareDevice::new());
    let mut graph = Graph::new("sync", ctx);
    graph.set_synchronized(true).unwrap();
    let fill_id = fill(&mut graph, FILL);
    let inv = invert(&mut graph);
    chain(&mut graph, &[fill_id, inv]);
    graph.try_and_process_all();

    assert_eq!(graph.pending_count(), 0);
    assert_eq!(draws_of(&device, "invert"), 1);
}

#[test]
fn test_preview_reads_back_rgba8() {
    let (_device, ctx) = setup();
    let mut graph = Graph::new("preview", ctx);
    let fill_id = fill(&mut graph, [1.0, 0.0, 0.0, 1.0]);
    graph.process();

    let bytes = graph.preview(fill_id, 2, 2).unwrap();
    assert_eq!(bytes.len(), 2 * 2 * 4);
    assert_eq!(&bytes[..4], &[255, 0, 0, 255]);
}
