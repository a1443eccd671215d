//! Group service contract: the primary group every wire rank is relative
//! to, secondary groups created collectively, and the per-context address
//! cache filled through bounded lookups (with the URI_LOOKUP internal RPC
//! answering cache misses between live runtimes).

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, RwLock,
    },
};

use crate::{
    context::{Context, Runtime},
    corpc::{self, CorpcOps},
    proto::{FieldDef, FieldKind, ReqFormat, Value, GRP_ID_MAX},
    registry::{OpcMap, OPC_GRP_CREATE, OPC_GRP_DESTROY, OPC_URI_LOOKUP},
    rpc::{Endpoint, Rpc, RpcHandler},
    transport::{self as trans, Tag, ADDR_STR_MAX_LEN},
    tree::TreeTopo,
    util::{rank_list_index, rank_list_sort_uniq},
    Error, Rank, Result,
};

pub struct Group {
    id: String,
    int_id: u64,
    /// Primary ranks, canonical (sorted, unique). Dense `0..size` for the
    /// primary group itself.
    membs: Vec<Rank>,
    primary: bool,
    service: bool,
    version: AtomicU32,
    /// Rank to base URI, primary group only.
    uris: RwLock<HashMap<Rank, String>>,
    /// (context, rank, tag) to resolved transport address.
    lc: Mutex<HashMap<(u32, Rank, Tag), trans::Addr>>,
}

impl Group {
    pub(crate) fn new_primary(id: &str, mut membs: Vec<Rank>) -> Group {
        rank_list_sort_uniq(&mut membs);
        Group {
            id: id.to_owned(),
            int_id: 0,
            membs,
            primary: true,
            service: true,
            version: AtomicU32::new(1),
            uris: RwLock::new(HashMap::new()),
            lc: Mutex::new(HashMap::new()),
        }
    }

    fn new_secondary(id: &str, int_id: u64, mut membs: Vec<Rank>) -> Group {
        rank_list_sort_uniq(&mut membs);
        Group {
            id: id.to_owned(),
            int_id,
            membs,
            primary: false,
            service: true,
            version: AtomicU32::new(1),
            uris: RwLock::new(HashMap::new()),
            lc: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn int_id(&self) -> u64 {
        self.int_id
    }

    pub fn size(&self) -> u32 {
        self.membs.len() as u32
    }

    pub fn membs(&self) -> &[Rank] {
        &self.membs
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    pub fn is_service(&self) -> bool {
        self.service
    }

    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Relaxed)
    }

    /// Position of a primary rank within this group.
    pub(crate) fn index_of(&self, primary_rank: Rank) -> Option<u32> {
        rank_list_index(&self.membs, primary_rank)
    }

    /// Primary rank at a position within this group.
    pub(crate) fn member_at(&self, idx: Rank) -> Option<Rank> {
        self.membs.get(idx as usize).copied()
    }

    pub(crate) fn seed_uri(&self, rank: Rank, uri: &str) {
        self.uris
            .write()
            .unwrap()
            .insert(rank, uri.to_owned());
    }

    pub(crate) fn uri_cached(&self, rank: Rank) -> Option<String> {
        self.uris.read().unwrap().get(&rank).cloned()
    }

    /// Lowest seeded rank other than `avoid`, our path to the lookup
    /// service.
    fn seeded_service_rank(&self, avoid: &[Rank]) -> Option<Rank> {
        self.uris
            .read()
            .unwrap()
            .keys()
            .copied()
            .filter(|rank| !avoid.contains(rank))
            .min()
    }

    fn lc_cached(&self, key: (u32, Rank, Tag)) -> Option<trans::Addr> {
        self.lc.lock().unwrap().get(&key).cloned()
    }

    fn lc_insert(&self, key: (u32, Rank, Tag), addr: trans::Addr) {
        self.lc.lock().unwrap().insert(key, addr);
    }
}

impl std::fmt::Debug for Group {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Group")
            .field("id", &self.id)
            .field("size", &self.size())
            .field("primary", &self.primary)
            .finish()
    }
}

pub struct GroupTable {
    primary: Arc<Group>,
    secondary: RwLock<HashMap<String, Arc<Group>>>,
}

impl GroupTable {
    pub(crate) fn new(primary: Arc<Group>) -> GroupTable {
        GroupTable {
            primary,
            secondary: RwLock::new(HashMap::new()),
        }
    }

    pub fn primary(&self) -> Arc<Group> {
        Arc::clone(&self.primary)
    }

    pub fn lookup(&self, grp_id: &str) -> Option<Arc<Group>> {
        if grp_id == self.primary.id() {
            return Some(self.primary());
        }
        self.secondary.read().unwrap().get(grp_id).cloned()
    }

    pub(crate) fn create_secondary(
        &self,
        grp_id: &str,
        int_id: u64,
        membs: Vec<Rank>,
    ) -> Result<Arc<Group>> {
        if grp_id.len() >= GRP_ID_MAX {
            log::error!("group id {:?} too long", grp_id);
            return Err(Error::Inval);
        }
        if grp_id == self.primary.id() {
            log::error!("group id {:?} shadows the primary group", grp_id);
            return Err(Error::Exist);
        }
        if membs.is_empty() || membs.iter().any(|r| self.primary.index_of(*r).is_none()) {
            log::error!("membership {:?} not within the primary group", membs);
            return Err(Error::Inval);
        }

        let mut secondary = self.secondary.write().unwrap();
        if secondary.contains_key(grp_id) {
            log::error!("group {:?} already exists", grp_id);
            return Err(Error::Exist);
        }

        let grp = Arc::new(Group::new_secondary(grp_id, int_id, membs));
        secondary.insert(grp_id.to_owned(), Arc::clone(&grp));
        log::debug!("created group {:?} with {} members", grp_id, grp.size());
        Ok(grp)
    }

    pub(crate) fn remove_secondary(&self, grp_id: &str) -> Result<()> {
        let mut secondary = self.secondary.write().unwrap();
        match secondary.remove(grp_id) {
            Some(_) => Ok(()),
            None => {
                log::error!("group {:?} not found", grp_id);
                Err(Error::Nonexist)
            }
        }
    }
}

/// Resolve the transport address of `(group position, tag)` on `ctx`,
/// caching per (context, primary rank, tag). The cache lives on the
/// primary group since all addressing is primary-rank based.
pub(crate) fn lc_lookup(
    rt: &Arc<Runtime>,
    grp: &Arc<Group>,
    ctx: &Arc<Context>,
    rank: Rank,
    tag: Tag,
) -> Result<trans::Addr> {
    let primary_rank = grp.member_at(rank).ok_or_else(|| {
        log::error!("rank {} out of range in group {:?}", rank, grp.id());
        Error::Inval
    })?;

    let pgrp = rt.primary_group();
    let key = (ctx.idx(), primary_rank, tag);
    if let Some(addr) = pgrp.lc_cached(key) {
        return Ok(addr);
    }

    let uri = uri_of(rt, ctx, primary_rank)?;
    let addr = trans::addr_lookup_wait(ctx.trans().as_ref(), &uri, rt.self_rank())?;
    pgrp.lc_insert(key, addr.clone());

    Ok(addr)
}

/// Base URI of a primary rank: the seeded table first, then a URI_LOOKUP
/// round trip to the nearest seeded peer.
fn uri_of(rt: &Arc<Runtime>, ctx: &Arc<Context>, rank: Rank) -> Result<String> {
    if rank == rt.self_rank() {
        return Ok(rt.self_uri().to_owned());
    }

    let pgrp = rt.primary_group();
    if let Some(uri) = pgrp.uri_cached(rank) {
        return Ok(uri);
    }

    let service_rank = pgrp
        .seeded_service_rank(&[rank, rt.self_rank()])
        .ok_or_else(|| {
            log::error!("no seeded peer to resolve rank {} through", rank);
            Error::Nonexist
        })?;

    log::debug!("resolving rank {} through rank {}", rank, service_rank);

    let ep = Endpoint::new(service_rank);
    let rpc = ctx.rpc_create(&ep, OPC_URI_LOOKUP)?;
    rpc.set_input(vec![
        Value::Str(pgrp.id().to_owned()),
        Value::U32(rank),
    ])?;
    rpc.send_sync(0)?;

    let out = rpc.output().ok_or(Error::Proto)?;
    let rc = out.get(1).and_then(Value::as_i32).ok_or(Error::Proto)?;
    if rc != 0 {
        log::error!("rank {} unresolved by rank {}: rc {}", rank, service_rank, rc);
        return Err(Error::from_code(rc).unwrap_or(Error::Misc));
    }

    let uri = out
        .get(0)
        .and_then(Value::as_str)
        .ok_or(Error::Proto)?
        .to_owned();
    pgrp.seed_uri(rank, &uri);

    Ok(uri)
}

/// Collective create of a secondary group over `membs` (primary ranks,
/// initiator included), rooted at the caller.
pub(crate) fn group_create(
    rt: &Arc<Runtime>,
    ctx: &Arc<Context>,
    grp_id: &str,
    membs: &[Rank],
) -> Result<Arc<Group>> {
    let pgrp = rt.primary_group();

    let mut membs = membs.to_vec();
    rank_list_sort_uniq(&mut membs);

    if !membs.contains(&rt.self_rank()) {
        log::error!("initiator rank {} not in new group {:?}", rt.self_rank(), grp_id);
        return Err(Error::Inval);
    }
    if membs.iter().any(|r| pgrp.index_of(*r).is_none()) {
        log::error!("membership {:?} not within the primary group", membs);
        return Err(Error::Inval);
    }
    if rt.group_lookup(grp_id).is_some() {
        log::error!("group {:?} already exists locally", grp_id);
        return Err(Error::Exist);
    }

    let excluded: Vec<Rank> = pgrp
        .membs()
        .iter()
        .copied()
        .filter(|rank| membs.binary_search(rank).is_err())
        .collect();
    let excluded = if excluded.is_empty() { None } else { Some(excluded) };

    let input = vec![
        Value::Str(grp_id.to_owned()),
        Value::U64(rt.next_grp_seq()),
        Value::RankList(membs),
        Value::U32(rt.self_rank()),
    ];

    let rpc = corpc::corpc_create(
        ctx,
        &pgrp,
        excluded.as_deref(),
        OPC_GRP_CREATE,
        input,
        TreeTopo::flat(),
    )?;
    rpc.send_sync(0)?;

    check_group_reply(&rpc, grp_id)?;
    rt.group_lookup(grp_id).ok_or(Error::Misc)
}

/// Collective destroy of a secondary group, rooted at the caller.
pub(crate) fn group_destroy(rt: &Arc<Runtime>, ctx: &Arc<Context>, grp_id: &str) -> Result<()> {
    let pgrp = rt.primary_group();

    let grp = match rt.group_lookup(grp_id) {
        Some(grp) if !grp.is_primary() => grp,
        Some(_) => {
            log::error!("cannot destroy the primary group");
            return Err(Error::Inval);
        }
        None => return Err(Error::Nonexist),
    };

    let excluded: Vec<Rank> = pgrp
        .membs()
        .iter()
        .copied()
        .filter(|rank| grp.index_of(*rank).is_none())
        .collect();
    let excluded = if excluded.is_empty() { None } else { Some(excluded) };

    let input = vec![
        Value::Str(grp_id.to_owned()),
        Value::U32(rt.self_rank()),
    ];

    let rpc = corpc::corpc_create(
        ctx,
        &pgrp,
        excluded.as_deref(),
        OPC_GRP_DESTROY,
        input,
        TreeTopo::flat(),
    )?;
    rpc.send_sync(0)?;

    check_group_reply(&rpc, grp_id)
}

fn check_group_reply(rpc: &Arc<Rpc>, grp_id: &str) -> Result<()> {
    let out = rpc.output().ok_or(Error::Proto)?;
    let rc = out.get(2).and_then(Value::as_i32).ok_or(Error::Proto)?;

    if rc != 0 {
        let failed = out.get(0).and_then(Value::as_rank_list).unwrap_or(&[]);
        log::error!("group {:?} operation failed on ranks {:?}: rc {}", grp_id, failed, rc);
        return Err(Error::from_code(rc).unwrap_or(Error::Misc));
    }

    Ok(())
}

static URI_LOOKUP_FMT: ReqFormat = ReqFormat {
    name: "uri-lookup",
    input: &[
        FieldDef { name: "grp_id", kind: FieldKind::Str(GRP_ID_MAX) },
        FieldDef { name: "rank", kind: FieldKind::U32 },
    ],
    output: &[
        FieldDef { name: "uri", kind: FieldKind::Str(ADDR_STR_MAX_LEN) },
        FieldDef { name: "rc", kind: FieldKind::I32 },
    ],
};

static GRP_CREATE_FMT: ReqFormat = ReqFormat {
    name: "grp-create",
    input: &[
        FieldDef { name: "grp_id", kind: FieldKind::Str(GRP_ID_MAX) },
        FieldDef { name: "int_grp_id", kind: FieldKind::U64 },
        FieldDef { name: "membs", kind: FieldKind::RankList },
        FieldDef { name: "initiator", kind: FieldKind::U32 },
    ],
    output: &[
        FieldDef { name: "failed_ranks", kind: FieldKind::RankList },
        FieldDef { name: "rank", kind: FieldKind::U32 },
        FieldDef { name: "rc", kind: FieldKind::I32 },
    ],
};

static GRP_DESTROY_FMT: ReqFormat = ReqFormat {
    name: "grp-destroy",
    input: &[
        FieldDef { name: "grp_id", kind: FieldKind::Str(GRP_ID_MAX) },
        FieldDef { name: "initiator", kind: FieldKind::U32 },
    ],
    output: &[
        FieldDef { name: "failed_ranks", kind: FieldKind::RankList },
        FieldDef { name: "rank", kind: FieldKind::U32 },
        FieldDef { name: "rc", kind: FieldKind::I32 },
    ],
};

/// Pre-register the runtime's own opcodes.
pub(crate) fn register_internal_rpcs(map: &OpcMap) -> Result<()> {
    let co_ops = CorpcOps {
        aggregate: Arc::new(group_aggregate),
        pre_forward: None,
        fail_out: false,
    };

    let create_hdlr: RpcHandler = Arc::new(grp_create_hdlr);
    let destroy_hdlr: RpcHandler = Arc::new(grp_destroy_hdlr);
    let lookup_hdlr: RpcHandler = Arc::new(uri_lookup_hdlr);

    let table: [(crate::Opcode, &'static ReqFormat, RpcHandler, Option<CorpcOps>); 3] = [
        (OPC_GRP_CREATE, &GRP_CREATE_FMT, create_hdlr, Some(co_ops.clone())),
        (OPC_GRP_DESTROY, &GRP_DESTROY_FMT, destroy_hdlr, Some(co_ops)),
        (OPC_URI_LOOKUP, &URI_LOOKUP_FMT, lookup_hdlr, None),
    ];

    for (opc, fmt, handler, co_ops) in table {
        map.register(opc, fmt, Some(handler), co_ops, false)?;
    }

    Ok(())
}

/// Fold a member's group-operation reply into the local accumulator:
/// union of failed ranks, first failure code wins.
fn group_aggregate(source: &Arc<Rpc>, result: &Arc<Rpc>) -> Result<()> {
    let out = source.output().ok_or(Error::Proto)?;
    let failed = out
        .get(0)
        .and_then(Value::as_rank_list)
        .ok_or(Error::Proto)?
        .to_vec();
    let rc = out.get(2).and_then(Value::as_i32).ok_or(Error::Proto)?;

    result.modify_output(|mine| {
        if let Some(Value::RankList(list)) = mine.get_mut(0) {
            list.extend(failed);
            rank_list_sort_uniq(list);
        }
        if rc != 0 {
            if let Some(Value::I32(cur)) = mine.get_mut(2) {
                if *cur == 0 {
                    *cur = rc;
                }
            }
        }
    });

    Ok(())
}

fn grp_create_hdlr(rpc: &Arc<Rpc>) -> Result<()> {
    let rt = rpc.context().runtime()?;

    let input = rpc.input().ok_or(Error::Proto)?;
    let grp_id = input.get(0).and_then(Value::as_str).ok_or(Error::Proto)?.to_owned();
    let int_id = input.get(1).and_then(Value::as_u64).ok_or(Error::Proto)?;
    let membs = input
        .get(2)
        .and_then(Value::as_rank_list)
        .ok_or(Error::Proto)?
        .to_vec();

    let rc = match rt.groups().create_secondary(&grp_id, int_id, membs) {
        Ok(_) => 0,
        Err(err) => {
            log::error!("create of group {:?} failed here: {}", grp_id, err);
            err.code()
        }
    };

    finish_group_reply(rpc, rt.self_rank(), rc)
}

fn grp_destroy_hdlr(rpc: &Arc<Rpc>) -> Result<()> {
    let rt = rpc.context().runtime()?;

    let input = rpc.input().ok_or(Error::Proto)?;
    let grp_id = input.get(0).and_then(Value::as_str).ok_or(Error::Proto)?.to_owned();

    let rc = match rt.groups().remove_secondary(&grp_id) {
        Ok(()) => 0,
        Err(err) => {
            log::error!("destroy of group {:?} failed here: {}", grp_id, err);
            err.code()
        }
    };

    finish_group_reply(rpc, rt.self_rank(), rc)
}

/// Merge the local outcome into the reply accumulator (children may have
/// aggregated into it already) and kick the reply path.
fn finish_group_reply(rpc: &Arc<Rpc>, self_rank: Rank, rc: i32) -> Result<()> {
    rpc.modify_output(|out| {
        if rc != 0 {
            if let Some(Value::RankList(list)) = out.get_mut(0) {
                list.push(self_rank);
                rank_list_sort_uniq(list);
            }
        }
        if let Some(slot) = out.get_mut(1) {
            *slot = Value::U32(self_rank);
        }
        if rc != 0 {
            if let Some(Value::I32(cur)) = out.get_mut(2) {
                if *cur == 0 {
                    *cur = rc;
                }
            }
        }
    });

    rpc.reply_send()
}

fn uri_lookup_hdlr(rpc: &Arc<Rpc>) -> Result<()> {
    let rt = rpc.context().runtime()?;

    let input = rpc.input().ok_or(Error::Proto)?;
    let grp_id = input.get(0).and_then(Value::as_str).ok_or(Error::Proto)?;
    let rank = input.get(1).and_then(Value::as_u32).ok_or(Error::Proto)?;

    let pgrp = rt.primary_group();
    let (uri, rc) = if grp_id != pgrp.id() {
        (String::new(), Error::Nonexist.code())
    } else if rank == rt.self_rank() {
        (rt.self_uri().to_owned(), 0)
    } else {
        match pgrp.uri_cached(rank) {
            Some(uri) => (uri, 0),
            None => (String::new(), Error::Nonexist.code()),
        }
    };

    rpc.set_output(vec![Value::Str(uri), Value::I32(rc)])?;
    rpc.reply_send()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> GroupTable {
        let primary = Arc::new(Group::new_primary("primary", (0..6).collect()));
        GroupTable::new(primary)
    }

    #[test]
    fn primary_lookup_and_indexing() {
        let table = table();
        let primary = table.lookup("primary").unwrap();

        assert!(primary.is_primary());
        assert_eq!(primary.size(), 6);
        assert_eq!(primary.index_of(4), Some(4));
        assert_eq!(primary.member_at(5), Some(5));
        assert_eq!(primary.member_at(6), None);
    }

    #[test]
    fn secondary_lifecycle() {
        let table = table();

        let grp = table.create_secondary("workers", 7, vec![4, 1, 4, 2]).unwrap();
        assert_eq!(grp.membs(), [1, 2, 4]);
        assert_eq!(grp.index_of(4), Some(2));
        assert!(!grp.is_primary());

        assert_eq!(
            table.create_secondary("workers", 8, vec![1]).unwrap_err(),
            Error::Exist
        );
        assert_eq!(
            table.create_secondary("primary", 9, vec![1]).unwrap_err(),
            Error::Exist
        );
        assert_eq!(
            table.create_secondary("bad", 10, vec![1, 99]).unwrap_err(),
            Error::Inval
        );

        table.remove_secondary("workers").unwrap();
        assert!(table.lookup("workers").is_none());
        assert_eq!(table.remove_secondary("workers").unwrap_err(), Error::Nonexist);
    }

    #[test]
    fn seeded_uri_cache() {
        let table = table();
        let primary = table.primary();

        primary.seed_uri(0, "mem://zero");
        primary.seed_uri(3, "mem://three");

        assert_eq!(primary.uri_cached(3).as_deref(), Some("mem://three"));
        assert_eq!(primary.uri_cached(5), None);
        assert_eq!(primary.seeded_service_rank(&[0]), Some(3));
        assert_eq!(primary.seeded_service_rank(&[0, 3]), None);
    }
}
