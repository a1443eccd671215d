//! Multi-runtime harness: N runtimes on one shared loopback fabric, each
//! with its own progress context, driven either by explicit polling from
//! the test thread or by background driver threads around blocking calls.

// Each test binary uses a different slice of the harness.
#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use treecast::{transport::mem::MemFabric, Config, Context, Rank, Runtime};

pub struct Node {
    pub rt: Arc<Runtime>,
    pub ctx: Arc<Context>,
}

/// Bring up `n` runtimes (ranks 0..n) with fully seeded URI tables.
pub fn cluster(n: Rank) -> Vec<Node> {
    cluster_with(n, |_, _| {})
}

/// Same, with a per-rank configuration hook.
pub fn cluster_with(n: Rank, tweak: impl Fn(Rank, &mut Config)) -> Vec<Node> {
    let _ = env_logger::builder().is_test(true).try_init();

    let fabric = MemFabric::new();
    let uris: Vec<(Rank, String)> = (0..n).map(|r| (r, format!("mem://node{}", r))).collect();

    (0..n)
        .map(|rank| {
            let mut cfg = Config::default();
            cfg.providers.register("mem", fabric.factory()).unwrap();
            cfg.info_string = Some(format!("mem://node{}", rank));
            cfg.self_rank = rank;
            cfg.membs = (0..n).collect();
            cfg.uris = uris.clone();
            tweak(rank, &mut cfg);

            let rt = Runtime::init(cfg).unwrap();
            let ctx = rt.context_create(None).unwrap();
            Node { rt, ctx }
        })
        .collect()
}

/// Poll every node until the predicate holds or the deadline passes.
pub fn drive_until(nodes: &[Node], deadline_ms: u64, mut pred: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + Duration::from_millis(deadline_ms);

    loop {
        for node in nodes {
            let _ = node.ctx.progress(0);
        }
        if pred() {
            return true;
        }
        if Instant::now() >= end {
            return false;
        }
        thread::sleep(Duration::from_micros(200));
    }
}

/// Poll only the given nodes (by index) — the others stay frozen.
pub fn drive_only_until(
    nodes: &[Node],
    which: &[usize],
    deadline_ms: u64,
    mut pred: impl FnMut() -> bool,
) -> bool {
    let end = Instant::now() + Duration::from_millis(deadline_ms);

    loop {
        for idx in which {
            let _ = nodes[*idx].ctx.progress(0);
        }
        if pred() {
            return true;
        }
        if Instant::now() >= end {
            return false;
        }
        thread::sleep(Duration::from_micros(200));
    }
}

/// Run `f` on the test thread while every node except `skip` is driven by
/// its own background thread; used around blocking calls (`send_sync`,
/// `group_create`) that only progress the caller's context.
pub fn with_drivers<T>(nodes: &[Node], skip: usize, f: impl FnOnce() -> T) -> T {
    let stop = Arc::new(AtomicBool::new(false));

    let drivers: Vec<_> = nodes
        .iter()
        .enumerate()
        .filter(|(idx, _)| *idx != skip)
        .map(|(_, node)| {
            let ctx = Arc::clone(&node.ctx);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    let _ = ctx.progress(1000);
                }
            })
        })
        .collect();

    let out = f();

    stop.store(true, Ordering::Release);
    for driver in drivers {
        driver.join().unwrap();
    }

    out
}
