//! Collective RPC: tree fan-out of a request over a group, aggregation of
//! replies on the way back up. Every node (root included) forwards to its
//! children, runs the local handler, and acknowledges; the last
//! acknowledgement releases the reply to the parent, or the user callback
//! at the root.

use std::sync::Arc;

use crate::{
    proto::CollectiveHdr,
    rpc::{self, CompletionInfo, Endpoint, Rpc, RpcState},
    tree::{self, TreeTopo},
    util::rank_list_sort_uniq,
    Context, Error, Group, Opcode, Rank, Result, Value,
};

pub type AggregateFn = Arc<dyn Fn(&Arc<Rpc>, &Arc<Rpc>) -> Result<()> + Send + Sync>;
pub type PreForwardFn = Arc<dyn Fn(&Arc<Rpc>) -> Result<()> + Send + Sync>;

/// Per-opcode collective callbacks.
///
/// `aggregate(source, result)` folds one child's reply into the node's own
/// reply accumulator; handlers contribute to the same accumulator through
/// [`Rpc::modify_output`], so contributions must commute with aggregation.
#[derive(Clone)]
pub struct CorpcOps {
    pub aggregate: AggregateFn,
    /// Runs at every node before any forwarding.
    pub pre_forward: Option<PreForwardFn>,
    /// Stop folding child replies after the first failure; late replies
    /// land in the discard buffer (counted, never aggregated).
    pub fail_out: bool,
}

pub(crate) struct CorpcInfo {
    pub grp: Arc<Group>,
    pub grp_ver: u32,
    pub excluded: Vec<Rank>,
    pub topo: TreeTopo,
    /// Primary rank of the collective's root.
    pub root: Rank,
    /// Keeps forwarded children alive until the fan-in completes.
    pub child_rpcs: Vec<Arc<Rpc>>,
    /// Children plus the node's own contribution.
    pub child_num: u32,
    pub child_ack_num: u32,
    pub self_acked: bool,
    /// First failure seen anywhere below this node.
    pub rc: i32,
}

impl CorpcInfo {
    fn new(grp: Arc<Group>, grp_ver: u32, excluded: Vec<Rank>, topo: TreeTopo, root: Rank) -> CorpcInfo {
        CorpcInfo {
            grp,
            grp_ver,
            excluded,
            topo,
            root,
            child_rpcs: Vec::new(),
            child_num: 0,
            child_ack_num: 0,
            self_acked: false,
            rc: 0,
        }
    }
}

/// Create a collective request over `grp`, rooted at the caller's rank.
pub(crate) fn corpc_create(
    ctx: &Arc<Context>,
    grp: &Arc<Group>,
    excluded: Option<&[Rank]>,
    opc: Opcode,
    input: Vec<Value>,
    topo: TreeTopo,
) -> Result<Arc<Rpc>> {
    let rt = ctx.runtime()?;

    let info = rt.opc_map().lookup(opc).ok_or_else(|| {
        log::error!("opcode {:#x} not registered", opc);
        Error::Unreg
    })?;
    if info.no_reply {
        log::error!("one-way opcode {:#x} cannot fan in", opc);
        return Err(Error::Inval);
    }
    if !grp.is_service() {
        log::error!("group {:?} is not a service group", grp.id());
        return Err(Error::Inval);
    }

    let self_rank = rt.self_rank();
    if grp.index_of(self_rank).is_none() {
        log::error!("rank {} is not a member of group {:?}", self_rank, grp.id());
        return Err(Error::Inval);
    }

    let mut excluded = excluded.map(<[Rank]>::to_vec).unwrap_or_default();
    rank_list_sort_uniq(&mut excluded);
    if excluded.binary_search(&self_rank).is_ok() {
        log::error!("root rank {} cannot be excluded from its own collective", self_rank);
        return Err(Error::Inval);
    }

    let rpc = rpc::alloc_coll_root(ctx, grp, opc, info)?;
    {
        let mut inner = rpc.inner.lock().unwrap();
        inner.input = Some(Arc::new(input));
        inner.coll_hdr = Some(CollectiveHdr {
            root: self_rank,
            topo,
            grp_ver: grp.version(),
            excluded: excluded.clone(),
        });
    }

    *rpc.corpc.lock().unwrap() = Some(CorpcInfo::new(
        Arc::clone(grp),
        grp.version(),
        excluded,
        topo,
        self_rank,
    ));

    Ok(rpc)
}

/// Server-side entry for a forwarded collective request: rebuild the
/// collective state from the wire section and run the fan-out.
pub(crate) fn common_hdlr(rpc: &Arc<Rpc>) {
    if let Err(err) = setup_from_wire(rpc) {
        log::error!("collective {:#x} rejected: {}", rpc.opc(), err);
        let _ = rpc::transport_reply(rpc, err.code());
    }
}

fn setup_from_wire(rpc: &Arc<Rpc>) -> Result<()> {
    let rt = rpc.context().runtime()?;

    let (coll_hdr, grp_id) = {
        let inner = rpc.inner.lock().unwrap();
        let coll_hdr = inner.coll_hdr.clone().ok_or(Error::Proto)?;
        (coll_hdr, inner.req_hdr.grp_id.clone())
    };

    let grp = rt.groups().lookup(&grp_id).ok_or_else(|| {
        log::error!("collective over unknown group {:?}", grp_id);
        Error::Nonexist
    })?;

    if coll_hdr.grp_ver != grp.version() {
        log::warn!(
            "group {:?} version drift: wire {} local {}",
            grp_id,
            coll_hdr.grp_ver,
            grp.version()
        );
    }

    *rpc.corpc.lock().unwrap() = Some(CorpcInfo::new(
        grp,
        coll_hdr.grp_ver,
        coll_hdr.excluded,
        coll_hdr.topo,
        coll_hdr.root,
    ));

    req_hdlr(rpc)
}

/// Fan out at this node: compute children, forward the shared input to
/// each, then run the local handler. Runs at the root (from `send`) and at
/// every interior node (from the dispatch path).
pub(crate) fn req_hdlr(rpc: &Arc<Rpc>) -> Result<()> {
    let rt = rpc.context().runtime()?;
    let self_rank = rt.self_rank();

    let (grp, excluded, topo, root) = {
        let guard = rpc.corpc.lock().unwrap();
        let info = guard.as_ref().ok_or(Error::Inval)?;
        (Arc::clone(&info.grp), info.excluded.clone(), info.topo, info.root)
    };

    let self_idx = grp.index_of(self_rank).ok_or_else(|| {
        log::error!("rank {} is not a member of group {:?}", self_rank, grp.id());
        Error::Inval
    })?;
    let root_idx = grp.index_of(root).ok_or_else(|| {
        log::error!("root rank {} is not a member of group {:?}", root, grp.id());
        Error::Proto
    })?;

    let excluded = if excluded.is_empty() { None } else { Some(excluded) };
    let children = tree::get_children(&grp, excluded.as_deref(), topo, root_idx, self_idx)?;

    if let Some(ops) = &rpc.info.co_ops {
        if let Some(pre_forward) = &ops.pre_forward {
            pre_forward(rpc)?;
        }
    }

    // The accumulator child replies fold into, before anything arrives.
    rpc.init_zero_output();

    {
        let mut guard = rpc.corpc.lock().unwrap();
        let info = guard.as_mut().expect("created above");
        info.child_num = children.len() as u32 + 1;
    }

    log::debug!(
        "collective {:#x} at rank {}: {} children",
        rpc.opc(),
        self_rank,
        children.len()
    );

    for child_rank in children {
        match forward_child(rpc, child_rank) {
            Ok(child) => {
                let mut guard = rpc.corpc.lock().unwrap();
                guard.as_mut().expect("created above").child_rpcs.push(child);
            }
            Err(err) => {
                log::error!("forward to rank {} failed: {}", child_rank, err);
                let mut guard = rpc.corpc.lock().unwrap();
                let info = guard.as_mut().expect("created above");
                if info.rc == 0 {
                    info.rc = err.code();
                }
                // Counted like a reply; the self ack is still outstanding,
                // so this can never be the final one.
                info.child_ack_num += 1;
            }
        }
    }

    match &rpc.info.handler {
        Some(_) => {
            local_hdlr(rpc);
            Ok(())
        }
        // No local handler: contribute the zeroed accumulator directly.
        None => reply_hdlr(rpc, None, 0),
    }
}

/// Forwarded leg towards one child. The child shares the parent's decoded
/// input and packed bytes; it owns neither.
fn forward_child(parent: &Arc<Rpc>, child_rank: Rank) -> Result<Arc<Rpc>> {
    let ctx = parent.context();
    let rt = ctx.runtime()?;
    let pgrp = rt.primary_group();

    let ep = Endpoint::tagged(child_rank, ctx.idx());
    let child = rpc::create_internal(ctx, &pgrp, &ep, parent.opc(), true)?;

    let body = rpc::packed_input(parent)?;
    {
        let (input, coll_hdr, grp_id, timeout_us) = {
            let inner = parent.inner.lock().unwrap();
            (
                inner.input.clone(),
                inner.coll_hdr.clone(),
                inner.req_hdr.grp_id.clone(),
                inner.timeout_us,
            )
        };

        let mut inner = child.inner.lock().unwrap();
        inner.input = input;
        inner.input_bytes = Some(body);
        inner.coll_hdr = coll_hdr;
        // Route by the collective's group, not the forwarding path's.
        inner.req_hdr.grp_id = grp_id;
        inner.timeout_us = timeout_us;
    }

    let parent_ref = Arc::clone(parent);
    child.send(Some(Box::new(move |info: &CompletionInfo| {
        if let Err(err) = reply_hdlr(&parent_ref, Some(&info.rpc), info.rc) {
            log::error!("collective fan-in failed: {}", err);
        }
    })))?;

    Ok(child)
}

/// Local handler dispatch for a collective node. The handler replies
/// through `reply_send`, which routes back into [`reply_hdlr`] as this
/// node's own acknowledgement.
fn local_hdlr(rpc: &Arc<Rpc>) {
    let handler = Arc::clone(rpc.info.handler.as_ref().expect("caller checked"));

    let task_rpc = Arc::clone(rpc);
    let task = move || {
        if let Err(err) = handler(&task_rpc) {
            log::error!("local handler for {:#x} failed: {}", task_rpc.opc(), err);
            match reply_hdlr(&task_rpc, None, err.code()) {
                Ok(()) | Err(Error::Already) => {}
                Err(err) => log::error!("failed acknowledgement failed: {}", err),
            }
        }
    };

    match rpc.context().pool() {
        Some(pool) => {
            if let Err(err) = pool.spawn(Box::new(task)) {
                log::error!("handler dispatch for {:#x} failed: {}", rpc.opc(), err);
            }
        }
        None => task(),
    }
}

/// One acknowledgement of the fan-in: a child completion (`src` set) or the
/// node's own contribution (`src` empty). The final acknowledgement either
/// replies to the parent or, at the root, fires the user callback.
pub(crate) fn reply_hdlr(rpc: &Arc<Rpc>, src: Option<&Arc<Rpc>>, rc: i32) -> Result<()> {
    let rt = rpc.context().runtime()?;

    let fail_out = rpc.info.co_ops.as_ref().map(|ops| ops.fail_out).unwrap_or(false);
    let aggregate = rpc.info.co_ops.as_ref().map(|ops| Arc::clone(&ops.aggregate));

    let (done, final_rc, is_root) = {
        let mut guard = rpc.corpc.lock().unwrap();
        let info = guard.as_mut().ok_or_else(|| {
            log::error!("reply on a non-collective request");
            Error::Inval
        })?;

        if src.is_none() {
            if info.self_acked {
                log::error!("duplicate local acknowledgement for {:#x}", rpc.opc());
                return Err(Error::Already);
            }
            info.self_acked = true;
        }

        if rc != 0 {
            if info.rc == 0 {
                info.rc = rc;
            }
        } else if let Some(src) = src {
            let short_circuited = info.rc != 0 && fail_out;
            if !short_circuited {
                if let Some(aggregate) = &aggregate {
                    if let Err(err) = aggregate(src, rpc) {
                        log::error!("aggregation for {:#x} failed: {}", rpc.opc(), err);
                        if info.rc == 0 {
                            info.rc = err.code();
                        }
                    }
                }
            }
        }

        info.child_ack_num += 1;
        (
            info.child_num > 0 && info.child_ack_num >= info.child_num,
            info.rc,
            info.root == rt.self_rank(),
        )
    };

    if !done {
        return Ok(());
    }

    if is_root {
        let cb = {
            let mut inner = rpc.inner.lock().unwrap();
            inner.state = RpcState::Completed;
            inner.complete_cb.take()
        };

        if let Some(cb) = cb {
            cb(&CompletionInfo { rpc: Arc::clone(rpc), rc: final_rc });
        }

        Ok(())
    } else {
        rpc::transport_reply(rpc, final_rc)
    }
}
