//! End-to-end scheduler tests against mock IR buffers and backends.


use std::collections::{BTreeMap, BTreeSet};

use rand::{Rng, SeedableRng};

use smelt_ir::{Dep, Device, IndexExpr, LoopRanges, Size};

use crate::test::fake::{context, context_with, dep, BackendOptions, Event, TestBuffer};
use crate::{Config, Scheduler};

fn svec(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

fn schedule_names(scheduler: &Scheduler) -> Vec<String> {
    scheduler
        .schedule()
        .iter()
        .map(|&id| scheduler.node(id).name().to_string())
        .collect()
}

fn user_names(scheduler: &Scheduler, name: &str) -> Vec<String> {
    let id = scheduler.node_id(name).unwrap();
    scheduler
        .node(id)
        .users
        .iter()
        .map(|user| scheduler.user_name(user).to_string())
        .collect()
}

#[test]
fn pointwise_chain_fuses() {
    let _ = simple_logger::init();
    let (cx, fixture) = context(&[], &["z"]);
    let buffers = vec![
        TestBuffer::computed("x").build(),
        TestBuffer::computed("y").reads(&["x"]).build(),
        TestBuffer::computed("z").reads(&["y"]).build(),
    ];
    let mut scheduler = Scheduler::new(buffers, cx).unwrap();
    assert_eq!(schedule_names(&scheduler), svec(&["x_y_z"]));
    assert_eq!(scheduler.node(scheduler.schedule()[0]).node_count(), 3);

    scheduler.codegen().unwrap();
    assert_eq!(fixture.kernels(), vec![svec(&["x", "y", "z"])]);
    // z is pinned as the graph output and must never be freed
    assert_eq!(fixture.freed(), svec(&["x", "y"]));
}

#[test]
fn horizontal_fusion_on_shared_read() {
    let (cx, fixture) = context(&[], &["y", "z"]);
    let buffers = vec![
        TestBuffer::extern_kernel("x").build(),
        TestBuffer::computed("y").reads(&["x"]).build(),
        TestBuffer::computed("z").reads(&["x"]).build(),
    ];
    let mut scheduler = Scheduler::new(buffers, cx).unwrap();
    assert_eq!(schedule_names(&scheduler), svec(&["x", "y_z"]));

    scheduler.codegen().unwrap();
    let events = fixture.events();
    let extern_at = events
        .iter()
        .position(|event| *event == Event::Comment("extern:x".to_string()))
        .unwrap();
    let kernel_at = events
        .iter()
        .position(|event| *event == Event::Kernel(svec(&["y", "z"])))
        .unwrap();
    assert!(extern_at < kernel_at);
    assert_eq!(fixture.freed(), svec(&["x"]));
}

#[test]
fn mutation_serializes_readers() {
    let (cx, _fixture) = context(&[], &["y", "d"]);
    let buffers = vec![
        TestBuffer::computed("x").build(),
        TestBuffer::computed("y").reads(&["x"]).build(),
        TestBuffer::computed("c").reads(&["x"]).mutates("x").build(),
        TestBuffer::computed("d").reads(&["x"]).build(),
    ];
    let scheduler = Scheduler::new(buffers, cx).unwrap();

    assert_eq!(
        scheduler.mutation_renames().get("x"),
        Some(&"c".to_string())
    );
    assert_eq!(
        scheduler.mutation_real_names().get("c"),
        Some(&"x".to_string())
    );

    // the mutation is ordered after the prior writer and every prior reader
    let c_node = scheduler.node(scheduler.node_id("c").unwrap());
    assert!(c_node.read_writes.reads.contains(&Dep::star("x")));
    assert!(c_node.read_writes.reads.contains(&Dep::star("y")));

    // downstream reads of x resolve to the mutation's writer
    let d_node = scheduler.node(scheduler.node_id("d").unwrap());
    assert!(d_node.read_writes.reads.contains(&dep("c")));
    assert!(!d_node.read_writes.reads.contains(&dep("x")));

    assert_eq!(user_names(&scheduler, "x"), svec(&["y", "c"]));
    assert_eq!(schedule_names(&scheduler), svec(&["x_y", "c_d"]));
}

#[test]
fn aliasing_merges_user_lists() {
    let options = BackendOptions {
        allow_vertical: false,
        allow_horizontal: false,
        ..Default::default()
    };
    let (cx, _fixture) = context_with(&[], &["c", "d"], Config::default(), options);
    let buffers = vec![
        TestBuffer::computed("x").build(),
        TestBuffer::computed("y").aliases("x").build(),
        TestBuffer::computed("c").reads(&["x"]).build(),
        TestBuffer::computed("d").reads(&["y"]).build(),
    ];
    let scheduler = Scheduler::new(buffers, cx).unwrap();

    // x and y share one user list, so readers of either see both
    assert_eq!(user_names(&scheduler, "x"), svec(&["c", "d"]));
    assert_eq!(user_names(&scheduler, "y"), svec(&["c", "d"]));

    let order = schedule_names(&scheduler);
    assert_eq!(order, svec(&["x", "y", "c", "d"]));
}

#[test]
fn fusion_that_would_create_a_cycle_is_rejected() {
    let options = BackendOptions {
        allow_vertical: false,
        allow_horizontal: true,
        ..Default::default()
    };
    let (cx, _fixture) = context_with(&["q", "s"], &["t", "w2b"], Config::default(), options);
    let buffers = vec![
        TestBuffer::computed("a").reads(&["s"]).build(),
        TestBuffer::computed("w1b").reads(&["q"]).build(),
        TestBuffer::computed("w2b").reads(&["a", "q"]).build(),
        TestBuffer::computed("t").reads(&["w1b", "s"]).build(),
    ];
    let mut scheduler = Scheduler::new(buffers, cx).unwrap();

    // the middle pair fused; fusing a with t would force the fused node to
    // schedule both before and after the pair
    assert_eq!(schedule_names(&scheduler), svec(&["a", "w1b_w2b", "t"]));
    let a = scheduler.fused_node_id("a").unwrap();
    let t = scheduler.fused_node_id("t").unwrap();
    assert!(scheduler.can_fuse(a, t));
    assert!(scheduler.will_fusion_create_cycle(a, t));
}

#[test]
fn reduction_write_widening_enables_vertical_fusion() {
    let (cx, _fixture) = context(&["inp"], &["c"]);
    let m = Size::sym("m");
    let k = Size::sym("k");
    let reduction = TestBuffer::computed("r")
        .ranges(LoopRanges::reduction(vec![m.clone()], vec![k.clone()]))
        .read_dep(Dep::memory(
            "inp",
            IndexExpr::symbol("x0"),
            vec![m.clone(), k.clone()],
        ))
        .write_deps(vec![Dep::memory(
            "r",
            IndexExpr::symbol("x0"),
            vec![m.clone(), k.clone()],
        )])
        .build();
    let consumer = TestBuffer::computed("c")
        .ranges(LoopRanges::pointwise(vec![m.clone()]))
        .read_dep(Dep::memory("r", IndexExpr::symbol("x0"), vec![m.clone()]))
        .write_deps(vec![Dep::memory(
            "c",
            IndexExpr::symbol("x0"),
            vec![m.clone()],
        )])
        .build();
    let scheduler = Scheduler::new(vec![reduction, consumer], cx).unwrap();

    let r_node = scheduler.node(scheduler.node_id("r").unwrap());
    assert!(r_node.read_writes.writes.contains(&Dep::memory(
        "r",
        IndexExpr::symbol("x0"),
        vec![m.clone(), k.clone()],
    )));
    assert!(r_node.read_writes.writes.contains(&Dep::memory(
        "r",
        IndexExpr::symbol("x0"),
        vec![m.clone()],
    )));

    assert_eq!(schedule_names(&scheduler), svec(&["r_c"]));
    assert!(scheduler.node(scheduler.schedule()[0]).is_reduction());
}

#[test]
fn empty_node_list_makes_an_empty_schedule() {
    let (cx, fixture) = context(&[], &[]);
    let mut scheduler = Scheduler::new(Vec::new(), cx).unwrap();
    assert!(scheduler.schedule().is_empty());
    scheduler.codegen().unwrap();
    assert!(fixture.events().is_empty());
    assert!(fixture.created.borrow().is_empty());
}

#[test]
fn dead_nop_node_is_eliminated() {
    let (cx, _fixture) = context(&[], &[]);
    let scheduler = Scheduler::new(vec![TestBuffer::nop("n").build()], cx).unwrap();
    assert!(scheduler.schedule().is_empty());
    assert!(scheduler.graph().removed_buffers.contains("n"));
}

#[test]
fn mutated_graph_input_is_pinned_and_not_freed() {
    let (cx, fixture) = context(&["x"], &[]);
    let buffers = vec![TestBuffer::computed("m").reads(&["x"]).mutates("x").build()];
    let mut scheduler = Scheduler::new(buffers, cx).unwrap();

    assert!(scheduler.graph().mutated_inputs.contains("x"));
    let m_node = scheduler.node(scheduler.node_id("m").unwrap());
    assert!(m_node.users.iter().any(|user| user.node.is_output()));

    scheduler.codegen().unwrap();
    assert_eq!(fixture.kernels(), vec![svec(&["m"])]);
    assert!(fixture.freed().is_empty());
}

#[test]
fn long_chain_collapses_and_fusion_is_idempotent() {
    let count = 24;
    let names: Vec<String> = (0..count).map(|index| format!("b{:02}", index)).collect();
    let (cx, _fixture) = context(&[], &[names.last().unwrap().as_str()]);
    let mut buffers = vec![TestBuffer::computed(&names[0]).build()];
    for index in 1..count {
        buffers.push(
            TestBuffer::computed(&names[index])
                .reads(&[names[index - 1].as_str()])
                .build(),
        );
    }
    let mut scheduler = Scheduler::new(buffers, cx).unwrap();
    assert_eq!(scheduler.schedule().len(), 1);
    assert_eq!(scheduler.node(scheduler.schedule()[0]).node_count(), count);

    let before = schedule_names(&scheduler);
    scheduler.fuse_nodes().unwrap();
    assert_eq!(schedule_names(&scheduler), before);
}

#[test]
fn topological_sort_is_idempotent() {
    let options = BackendOptions {
        allow_vertical: false,
        allow_horizontal: false,
        ..Default::default()
    };
    let (cx, _fixture) = context_with(&["q", "s"], &["t", "w2b"], Config::default(), options);
    let buffers = vec![
        TestBuffer::computed("a").reads(&["s"]).build(),
        TestBuffer::computed("w1b").reads(&["q"]).build(),
        TestBuffer::computed("w2b").reads(&["a", "q"]).build(),
        TestBuffer::computed("t").reads(&["w1b", "s"]).build(),
    ];
    let mut scheduler = Scheduler::new(buffers, cx).unwrap();
    let first = schedule_names(&scheduler);
    scheduler.topological_sort_schedule().unwrap();
    assert_eq!(schedule_names(&scheduler), first);
    scheduler.topological_sort_schedule().unwrap();
    assert_eq!(schedule_names(&scheduler), first);
}

#[test]
fn template_heads_an_epilogue_fusion() {
    let options = BackendOptions {
        allow_template: true,
        ..Default::default()
    };
    let (cx, fixture) = context_with(&[], &["e"], Config::default(), options);
    let buffers = vec![
        TestBuffer::template("tmpl").build(),
        TestBuffer::computed("e").reads(&["tmpl"]).build(),
    ];
    let mut scheduler = Scheduler::new(buffers, cx).unwrap();

    // the lone star write was canonicalized into a memory dep
    let t_node = scheduler.node(scheduler.node_id("tmpl").unwrap());
    assert!(t_node.read_writes.writes.contains(&dep("tmpl")));
    assert!(!t_node.read_writes.writes.contains(&Dep::star("tmpl")));

    assert_eq!(schedule_names(&scheduler), svec(&["tmpl_e"]));
    assert!(scheduler.node(scheduler.schedule()[0]).is_template());

    scheduler.codegen().unwrap();
    let events = fixture.events();
    assert!(events.contains(&Event::TemplateKernel("tmpl".to_string(), svec(&["e"]))));
    // template outputs allocate even though the kernel cannot do it itself
    assert!(events.contains(&Event::Alloc("tmpl".to_string())));
    assert!(events.contains(&Event::Alloc("e".to_string())));
}

#[test]
fn kernel_local_buffers_are_removed_instead_of_freed() {
    let options = BackendOptions {
        remove_kernel_locals: true,
        ..Default::default()
    };
    let (cx, fixture) = context_with(&[], &["z"], Config::default(), options);
    let buffers = vec![
        TestBuffer::computed("x").build(),
        TestBuffer::computed("y").reads(&["x"]).build(),
        TestBuffer::computed("z").reads(&["y"]).build(),
    ];
    let mut scheduler = Scheduler::new(buffers, cx).unwrap();
    scheduler.codegen().unwrap();

    let removed = &scheduler.graph().removed_buffers;
    assert!(removed.contains("x"));
    assert!(removed.contains("y"));
    assert!(!removed.contains("z"));
    assert!(fixture.freed().is_empty());
    let events = fixture.events();
    assert!(events.contains(&Event::Comment("removed:x".to_string())));
    assert!(events.contains(&Event::Comment("removed:y".to_string())));
}

#[test]
fn independent_nodes_without_shared_data_stay_apart() {
    let (cx, _fixture) = context(&["p", "q"], &["u", "v"]);
    let buffers = vec![
        TestBuffer::computed("u").reads(&["p"]).build(),
        TestBuffer::computed("v").reads(&["q"]).build(),
    ];
    let scheduler = Scheduler::new(buffers, cx).unwrap();
    assert_eq!(schedule_names(&scheduler), svec(&["u", "v"]));
}

#[test]
fn aggressive_fusion_buckets_by_group() {
    let config = Config {
        aggressive_fusion: true,
        ..Default::default()
    };
    let (cx, _fixture) = context_with(&["p", "q"], &["u", "v"], config, Default::default());
    let buffers = vec![
        TestBuffer::computed("u").reads(&["p"]).build(),
        TestBuffer::computed("v").reads(&["q"]).build(),
    ];
    let scheduler = Scheduler::new(buffers, cx).unwrap();
    assert_eq!(schedule_names(&scheduler), svec(&["u_v"]));
}

#[test]
fn origin_comments_are_emitted_once() {
    let config = Config {
        comment_origin: true,
        ..Default::default()
    };
    let (cx, fixture) = context_with(&[], &["x"], config, Default::default());
    let buffers = vec![TestBuffer::computed("x").origin("add", "add_1").build()];
    let mut scheduler = Scheduler::new(buffers, cx).unwrap();
    scheduler.codegen().unwrap();

    let comments: Vec<Event> = fixture
        .events()
        .into_iter()
        .filter(|event| match event {
            Event::Comment(_) => true,
            _ => false,
        })
        .collect();
    assert_eq!(
        comments,
        vec![Event::Comment("origin: add add_1".to_string())]
    );
}

#[test]
fn enabling_inplace_buffers_is_rejected() {
    assert!(!Config::default().inplace_buffers);
    let config = Config {
        inplace_buffers: true,
        ..Default::default()
    };
    let (cx, _fixture) = context_with(&[], &["x"], config, Default::default());
    let buffers = vec![TestBuffer::computed("x").build()];
    let mut scheduler = Scheduler::new(buffers, cx).unwrap();
    assert!(scheduler.codegen().is_err());
}

#[test]
fn devices_do_not_fuse_across() {
    let (cx, _fixture) = context(&["p"], &["u", "v"]);
    let buffers = vec![
        TestBuffer::computed("u").reads(&["p"]).build(),
        TestBuffer::computed("v").reads(&["p"]).on(Device::Gpu(0)).build(),
    ];
    let scheduler = Scheduler::new(buffers, cx).unwrap();
    assert_eq!(scheduler.schedule().len(), 2);
    assert_eq!(scheduler.graph().device_kinds.len(), 2);
}

#[test]
fn random_dags_keep_schedule_invariants() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(1234);
    let count = 30usize;
    let name_of = |index: usize| format!("n{:02}", index);

    let mut reads_of: Vec<Vec<usize>> = Vec::with_capacity(count);
    let mut read_by: BTreeSet<usize> = BTreeSet::new();
    for index in 0..count {
        let mut chosen: BTreeSet<usize> = BTreeSet::new();
        if index > 0 {
            let max_reads = 3.min(index);
            for _ in 0..rng.gen_range(0, max_reads + 1) {
                chosen.insert(rng.gen_range(0, index));
            }
        }
        for &source in &chosen {
            read_by.insert(source);
        }
        reads_of.push(chosen.into_iter().collect());
    }

    let unread: Vec<usize> = (0..count).filter(|index| !read_by.contains(index)).collect();
    assert!(!unread.is_empty());
    let outputs: Vec<String> = unread
        .iter()
        .filter(|&&index| index % 2 == 0)
        .map(|&index| name_of(index))
        .collect();
    let expected_removed: BTreeSet<String> = unread
        .iter()
        .filter(|&&index| index % 2 == 1)
        .map(|&index| name_of(index))
        .collect();
    assert!(!outputs.is_empty());

    let output_refs: Vec<&str> = outputs.iter().map(String::as_str).collect();
    let (cx, fixture) = context(&[], &output_refs);
    let mut buffers = Vec::new();
    for index in 0..count {
        let mut buffer = TestBuffer::computed(&name_of(index));
        for &source in &reads_of[index] {
            buffer = buffer.reads(&[name_of(source).as_str()]);
        }
        buffers.push(buffer.build());
    }
    let mut scheduler = Scheduler::new(buffers, cx).unwrap();

    // dead-code elimination removes exactly the unread non-outputs
    assert_eq!(scheduler.graph().removed_buffers, expected_removed);

    let mut position: BTreeMap<String, usize> = BTreeMap::new();
    for (pos, &id) in scheduler.schedule().iter().enumerate() {
        for name in scheduler.node(id).names() {
            position.insert(name.to_string(), pos);
        }
    }

    for index in 0..count {
        let name = name_of(index);
        let pos = match position.get(&name) {
            Some(&pos) => pos,
            None => continue, // eliminated
        };
        for &source in &reads_of[index] {
            let source_pos = position[&name_of(source)];
            assert!(
                source_pos <= pos,
                "{} scheduled before its input {}",
                name,
                name_of(source)
            );
        }
    }

    for &id in scheduler.schedule() {
        let node = scheduler.node(id);
        // a node never transitively precedes itself
        for name in node.names() {
            assert!(!node.recursive_predecessors.contains(name));
        }
        assert!(node
            .unmet_dependencies
            .iter()
            .all(|unmet| node.read_writes.reads.contains(unmet)));
    }

    // every live node is emitted exactly once
    scheduler.codegen().unwrap();
    let mut emitted: Vec<String> = fixture.kernels().into_iter().flatten().collect();
    emitted.sort();
    let mut live: Vec<String> = position.keys().cloned().collect();
    live.sort();
    assert_eq!(emitted, live);
}
