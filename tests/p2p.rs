//! Point-to-point scenarios over the loopback fabric: echo, unknown
//! opcode, timeout, abort, inflight caps, one-way requests and address
//! resolution.

mod common;

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Instant,
};

use common::{cluster, cluster_with, drive_only_until, drive_until, with_drivers};
use treecast::{
    Endpoint, Error, FieldDef, FieldKind, ReqFormat, Rpc, RpcHandler, RpcState, Value,
};

static ECHO_FMT: ReqFormat = ReqFormat {
    name: "echo",
    input: &[FieldDef { name: "payload", kind: FieldKind::U64 }],
    output: &[FieldDef { name: "payload", kind: FieldKind::U64 }],
};

static NOTE_FMT: ReqFormat = ReqFormat {
    name: "note",
    input: &[FieldDef { name: "payload", kind: FieldKind::U64 }],
    output: &[],
};

const OPC_ECHO: u32 = 0x100;
const OPC_STRANGER: u32 = 0x999;
const OPC_PARK: u32 = 0x300;
const OPC_NOTE: u32 = 0x400;

fn echo_handler() -> RpcHandler {
    Arc::new(|rpc: &Arc<Rpc>| -> treecast::Result<()> {
        let input = rpc.input().ok_or(Error::Proto)?;
        rpc.set_output(input.as_ref().clone())?;
        rpc.reply_send()
    })
}

/// Handler that holds received requests for the test to answer later.
fn park_handler(parked: Arc<Mutex<VecDeque<Arc<Rpc>>>>, order: Arc<Mutex<Vec<u64>>>) -> RpcHandler {
    Arc::new(move |rpc: &Arc<Rpc>| -> treecast::Result<()> {
        let payload = rpc.input().and_then(|i| i.get(0).and_then(Value::as_u64));
        order.lock().unwrap().push(payload.unwrap_or(u64::MAX));
        parked.lock().unwrap().push_back(Arc::clone(rpc));
        Ok(())
    })
}

fn rc_slot() -> (Arc<Mutex<Option<i32>>>, treecast::CompleteCb) {
    let slot: Arc<Mutex<Option<i32>>> = Arc::new(Mutex::new(None));
    let cb_slot = Arc::clone(&slot);
    let cb: treecast::CompleteCb = Box::new(move |info| {
        *cb_slot.lock().unwrap() = Some(info.rc);
    });
    (slot, cb)
}

#[test]
fn echo_round_trip() {
    let nodes = cluster(2);
    for node in &nodes {
        node.rt.register(OPC_ECHO, &ECHO_FMT, Some(echo_handler())).unwrap();
    }

    let rpc = nodes[0].ctx.rpc_create(&Endpoint::new(1), OPC_ECHO).unwrap();
    rpc.set_input(vec![Value::U64(0xdead_beef_cafe_babe)]).unwrap();

    let (slot, cb) = rc_slot();
    rpc.send(Some(cb)).unwrap();

    assert!(drive_until(&nodes, 2000, || slot.lock().unwrap().is_some()));
    assert_eq!(*slot.lock().unwrap(), Some(0));
    assert_eq!(rpc.state(), RpcState::Completed);

    let out = rpc.output().unwrap();
    assert_eq!(out[0].as_u64(), Some(0xdead_beef_cafe_babe));

    // Every internal owner lets go once the exchange settles.
    assert!(drive_until(&nodes, 1000, || Arc::strong_count(&rpc) == 1));
    assert!(nodes[0].ctx.is_empty());
}

#[test]
fn unregistered_opcode_reported_by_peer() {
    let nodes = cluster(2);
    // Only the client knows this opcode.
    nodes[0].rt.register(OPC_STRANGER, &ECHO_FMT, None).unwrap();

    let rpc = nodes[0].ctx.rpc_create(&Endpoint::new(1), OPC_STRANGER).unwrap();
    rpc.set_input(vec![Value::U64(1)]).unwrap();

    let (slot, cb) = rc_slot();
    rpc.send(Some(cb)).unwrap();

    assert!(drive_until(&nodes, 2000, || slot.lock().unwrap().is_some()));
    assert_eq!(*slot.lock().unwrap(), Some(Error::Unreg.code()));
}

#[test]
fn timeout_without_peer_progress() {
    let nodes = cluster(2);
    for node in &nodes {
        node.rt.register(OPC_ECHO, &ECHO_FMT, Some(echo_handler())).unwrap();
    }

    let rpc = nodes[0].ctx.rpc_create(&Endpoint::new(1), OPC_ECHO).unwrap();
    rpc.set_input(vec![Value::U64(2)]).unwrap();
    rpc.set_timeout(100_000).unwrap();

    let (slot, cb) = rc_slot();
    let started = Instant::now();
    rpc.send(Some(cb)).unwrap();

    // The peer never progresses; only the client context runs.
    assert!(drive_only_until(&nodes, &[0], 2000, || slot.lock().unwrap().is_some()));
    assert_eq!(*slot.lock().unwrap(), Some(Error::TimedOut.code()));
    assert_eq!(rpc.state(), RpcState::TimedOut);
    assert!(started.elapsed().as_millis() < 1000);
    assert!(nodes[0].ctx.is_empty());
}

#[test]
fn abort_completes_with_canceled() {
    let nodes = cluster(2);
    let parked = Arc::new(Mutex::new(VecDeque::new()));
    let order = Arc::new(Mutex::new(Vec::new()));
    for node in &nodes {
        node.rt
            .register(OPC_PARK, &ECHO_FMT, Some(park_handler(Arc::clone(&parked), Arc::clone(&order))))
            .unwrap();
    }

    let rpc = nodes[0].ctx.rpc_create(&Endpoint::new(1), OPC_PARK).unwrap();
    rpc.set_input(vec![Value::U64(3)]).unwrap();

    let (slot, cb) = rc_slot();
    rpc.send(Some(cb)).unwrap();

    // Wait until the server parked the request, then abort client-side.
    assert!(drive_until(&nodes, 2000, || !parked.lock().unwrap().is_empty()));
    rpc.abort().unwrap();

    assert!(drive_until(&nodes, 2000, || slot.lock().unwrap().is_some()));
    assert_eq!(*slot.lock().unwrap(), Some(Error::Canceled.code()));
    assert_eq!(rpc.state(), RpcState::Canceled);

    // A late reply from the parked side is dropped, not delivered twice.
    let late = parked.lock().unwrap().pop_front().unwrap();
    late.set_output(vec![Value::U64(3)]).unwrap();
    late.reply_send().unwrap();
    assert!(!drive_until(&nodes, 100, || false));
    assert_eq!(*slot.lock().unwrap(), Some(Error::Canceled.code()));
}

#[test]
fn inflight_cap_queues_and_promotes_fifo() {
    let nodes = cluster_with(2, |_, cfg| cfg.max_inflight = 2);
    let parked = Arc::new(Mutex::new(VecDeque::new()));
    let order = Arc::new(Mutex::new(Vec::new()));
    for node in &nodes {
        node.rt
            .register(OPC_PARK, &ECHO_FMT, Some(park_handler(Arc::clone(&parked), Arc::clone(&order))))
            .unwrap();
    }

    let mut rpcs = Vec::new();
    let mut slots = Vec::new();
    for payload in 0..5u64 {
        let rpc = nodes[0].ctx.rpc_create(&Endpoint::new(1), OPC_PARK).unwrap();
        rpc.set_input(vec![Value::U64(payload)]).unwrap();
        let (slot, cb) = rc_slot();
        rpc.send(Some(cb)).unwrap();
        rpcs.push(rpc);
        slots.push(slot);
    }

    // Two inflight, three parked on the wait queue.
    assert_eq!(nodes[0].ctx.epi_counts(1), (2, 3));
    assert_eq!(rpcs[2].state(), RpcState::Queued);

    assert!(drive_until(&nodes, 2000, || order.lock().unwrap().len() == 2));

    // Answer whatever is parked; each reply frees a slot and promotes the
    // next waiter.
    assert!(drive_until(&nodes, 5000, || {
        let mut pending = parked.lock().unwrap();
        while let Some(rpc) = pending.pop_front() {
            let input = rpc.input().unwrap();
            rpc.set_output(input.as_ref().clone()).unwrap();
            rpc.reply_send().unwrap();
        }
        drop(pending);
        slots.iter().all(|slot| slot.lock().unwrap().is_some())
    }));

    for slot in &slots {
        assert_eq!(*slot.lock().unwrap(), Some(0));
    }

    // Arrival order at the server matches submission order.
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    assert_eq!(nodes[0].ctx.epi_counts(1), (0, 0));
}

#[test]
fn send_sync_round_trip() {
    let nodes = cluster(2);
    for node in &nodes {
        node.rt.register(OPC_ECHO, &ECHO_FMT, Some(echo_handler())).unwrap();
    }

    let rpc = nodes[0].ctx.rpc_create(&Endpoint::new(1), OPC_ECHO).unwrap();
    rpc.set_input(vec![Value::U64(17)]).unwrap();

    with_drivers(&nodes, 0, || rpc.send_sync(0)).unwrap();
    assert_eq!(rpc.output().unwrap()[0].as_u64(), Some(17));
}

#[test]
fn one_way_completes_on_forward() {
    let nodes = cluster(2);
    let seen = Arc::new(AtomicU32::new(0));

    for node in &nodes {
        let seen = Arc::clone(&seen);
        let handler: RpcHandler = Arc::new(move |_rpc: &Arc<Rpc>| -> treecast::Result<()> {
            seen.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
        node.rt
            .register_full(OPC_NOTE, &NOTE_FMT, Some(handler), None, true)
            .unwrap();
    }

    let rpc = nodes[0].ctx.rpc_create(&Endpoint::new(1), OPC_NOTE).unwrap();
    rpc.set_input(vec![Value::U64(5)]).unwrap();

    let (slot, cb) = rc_slot();
    rpc.send(Some(cb)).unwrap();

    // Completes without any reply from the peer.
    assert!(drive_only_until(&nodes, &[0], 2000, || slot.lock().unwrap().is_some()));
    assert_eq!(*slot.lock().unwrap(), Some(0));

    assert!(drive_until(&nodes, 2000, || seen.load(Ordering::Relaxed) == 1));
}

#[test]
fn tags_select_the_destination_context() {
    let nodes = cluster(2);
    for node in &nodes {
        node.rt.register(OPC_ECHO, &ECHO_FMT, Some(echo_handler())).unwrap();
    }

    // Second context on the server; tag 1 routes to it.
    let server_ctx1 = nodes[1].rt.context_create(None).unwrap();
    assert_eq!(server_ctx1.idx(), 1);

    let rpc = nodes[0]
        .ctx
        .rpc_create(&Endpoint::tagged(1, 1), OPC_ECHO)
        .unwrap();
    rpc.set_input(vec![Value::U64(9)]).unwrap();

    let (slot, cb) = rc_slot();
    rpc.send(Some(cb)).unwrap();

    // Driving the server's context 0 is not enough.
    assert!(!drive_only_until(&nodes, &[0], 200, || slot.lock().unwrap().is_some()));

    let done = {
        let end = Instant::now() + std::time::Duration::from_millis(2000);
        loop {
            let _ = nodes[0].ctx.progress(0);
            let _ = server_ctx1.progress(0);
            if slot.lock().unwrap().is_some() {
                break true;
            }
            if Instant::now() >= end {
                break false;
            }
        }
    };
    assert!(done);
    assert_eq!(*slot.lock().unwrap(), Some(0));
}

/// Spawns every handler on its own thread; completion callbacks still run
/// on the progress thread.
struct SpawnPool;

impl treecast::TaskPool for SpawnPool {
    fn spawn(&self, task: Box<dyn FnOnce() + Send>) -> treecast::Result<()> {
        std::thread::spawn(task);
        Ok(())
    }
}

#[test]
fn pooled_context_runs_handlers_off_thread() {
    let nodes = cluster(2);

    let handler_thread: Arc<Mutex<Option<std::thread::ThreadId>>> = Arc::new(Mutex::new(None));
    let cb_thread = Arc::clone(&handler_thread);
    for node in &nodes {
        let cb_thread = Arc::clone(&cb_thread);
        let handler: RpcHandler = Arc::new(move |rpc: &Arc<Rpc>| -> treecast::Result<()> {
            *cb_thread.lock().unwrap() = Some(std::thread::current().id());
            let input = rpc.input().ok_or(Error::Proto)?;
            rpc.set_output(input.as_ref().clone())?;
            rpc.reply_send()
        });
        node.rt.register(OPC_ECHO, &ECHO_FMT, Some(handler)).unwrap();
    }

    // Pool-backed context on the server; tag 1 routes to it.
    let pooled = nodes[1].rt.context_create(Some(Arc::new(SpawnPool))).unwrap();

    let rpc = nodes[0]
        .ctx
        .rpc_create(&Endpoint::tagged(1, 1), OPC_ECHO)
        .unwrap();
    rpc.set_input(vec![Value::U64(31)]).unwrap();

    let (slot, cb) = rc_slot();
    rpc.send(Some(cb)).unwrap();

    let done = {
        let end = Instant::now() + std::time::Duration::from_millis(2000);
        loop {
            let _ = nodes[0].ctx.progress(0);
            let _ = pooled.progress(0);
            if slot.lock().unwrap().is_some() {
                break true;
            }
            if Instant::now() >= end {
                break false;
            }
        }
    };
    assert!(done);
    assert_eq!(*slot.lock().unwrap(), Some(0));
    assert_eq!(rpc.output().unwrap()[0].as_u64(), Some(31));

    // The handler body ran somewhere else entirely.
    let handler_tid = handler_thread.lock().unwrap().expect("handler ran");
    assert_ne!(handler_tid, std::thread::current().id());
}

#[test]
fn uri_lookup_resolves_unseeded_peers() {
    // Rank 2 only knows rank 0; rank 1 must be resolved over the wire.
    let nodes = cluster_with(3, |rank, cfg| {
        if rank == 2 {
            cfg.uris.retain(|(r, _)| *r == 0);
        }
    });
    for node in &nodes {
        node.rt.register(OPC_ECHO, &ECHO_FMT, Some(echo_handler())).unwrap();
    }

    let out = with_drivers(&nodes, 2, || {
        let rpc = nodes[2].ctx.rpc_create(&Endpoint::new(1), OPC_ECHO)?;
        rpc.set_input(vec![Value::U64(23)])?;
        rpc.send_sync(0)?;
        Ok::<_, Error>(rpc.output())
    })
    .unwrap()
    .unwrap();

    assert_eq!(out[0].as_u64(), Some(23));
}

#[test]
fn multi_fabric_contexts_get_their_own_class() {
    let nodes = cluster_with(1, |_, cfg| cfg.multi_fabric = true);

    let extra = nodes[0].rt.context_create(None).unwrap();
    assert_eq!(extra.idx(), 1);
    assert!(matches!(extra.progress(0), Ok(()) | Err(Error::TimedOut)));
}

#[test]
fn finalize_lifecycle() {
    let nodes = cluster(1);

    nodes[0].rt.finalize().unwrap();
    assert_eq!(nodes[0].rt.finalize().unwrap_err(), Error::NoPerm);
    assert_eq!(
        nodes[0].rt.context_create(None).unwrap_err(),
        Error::Uninit
    );
}
