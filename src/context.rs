//! Runtime and per-context progress machinery: endpoint inflight tracking,
//! the timeout heap, and the cooperative progress/trigger drive.
//!
//! A context is single-threaded cooperative: exactly one thread may drive
//! `progress` at a time (enforced, not assumed), and every completion
//! callback, timeout sweep and inline handler runs on that thread.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, RwLock, Weak,
    },
};

use crate::{
    corpc::{self, CorpcOps},
    group::{self, Group, GroupTable},
    proto::{self, ReqFormat},
    registry::OpcMap,
    rpc::{self, Endpoint, Rpc, RpcHandler, RpcState},
    transport::{self as trans, ProviderRegistry},
    tree::TreeTopo,
    util::{deadline_us, getenv_bool, monotonic_us},
    Error, Opcode, Rank, Result, Value,
};

pub const DEFAULT_TIMEOUT_US: u64 = 60_000_000;
pub const MAX_INFLIGHT: u32 = 32;
const OPC_MAP_BITS: u32 = 8;

/// Handler execution pool. When attached to a context, handler bodies run
/// on the pool while completion callbacks stay on the progress thread.
pub trait TaskPool: Send + Sync {
    fn spawn(&self, task: Box<dyn FnOnce() + Send>) -> Result<()>;

    /// Called between trigger drains so pooled work can interleave.
    fn yield_now(&self) {}
}

/// Process-wide configuration consumed by [`Runtime::init`].
pub struct Config {
    /// Listen for incoming requests (service process).
    pub server: bool,
    /// Prefer the verbs provider when no info string is given.
    pub verbs: bool,
    /// Transport info string; `bmi+tcp...` is consumed verbatim. `None`
    /// selects `cci+verbs://` or `cci+tcp://` by the `verbs` knob.
    pub info_string: Option<String>,
    pub grp_id: String,
    pub self_rank: Rank,
    /// Primary group membership; defaults to just `self_rank`.
    pub membs: Vec<Rank>,
    /// Seeded rank-to-URI table for the primary group.
    pub uris: Vec<(Rank, String)>,
    pub default_timeout_us: u64,
    pub max_inflight: u32,
    /// Give every context past the first its own transport class.
    pub multi_fabric: bool,
    pub opc_map_bits: u32,
    pub providers: ProviderRegistry,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            server: true,
            verbs: false,
            info_string: None,
            grp_id: String::from("primary"),
            self_rank: 0,
            membs: Vec::new(),
            uris: Vec::new(),
            default_timeout_us: DEFAULT_TIMEOUT_US,
            max_inflight: MAX_INFLIGHT,
            multi_fabric: false,
            opc_map_bits: OPC_MAP_BITS,
            providers: ProviderRegistry::new(),
        }
    }
}

impl Config {
    /// Fold environment knobs over the programmatic settings.
    pub fn apply_env(&mut self) {
        if let Some(verbs) = getenv_bool("TREECAST_VERBS") {
            self.verbs = verbs;
        }
        if let Some(multi) = getenv_bool("TREECAST_MULTI_FABRIC") {
            self.multi_fabric = multi;
        }
    }

    fn resolve_info(&self) -> String {
        match &self.info_string {
            Some(info) => info.clone(),
            None if self.verbs => String::from("cci+verbs://"),
            None => String::from("cci+tcp://"),
        }
    }
}

enum RtState {
    Running,
    Finalized,
}

/// Everything that was process-global in spirit: transport class, opcode
/// map, group table, context list. Built at init, dropped at finalize.
pub struct Runtime {
    server: bool,
    multi_fabric: bool,
    info: String,
    default_timeout_us: u64,
    max_inflight: u32,
    providers: ProviderRegistry,
    class: Arc<dyn trans::Class>,
    self_uri: String,
    self_rank: Rank,
    opc_map: OpcMap,
    groups: GroupTable,
    ctxs: RwLock<Vec<Arc<Context>>>,
    state: Mutex<RtState>,
    seq: AtomicU64,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Runtime")
            .field("rank", &self.self_rank)
            .field("uri", &self.self_uri)
            .finish()
    }
}

impl Runtime {
    pub fn init(cfg: Config) -> Result<Arc<Runtime>> {
        let info = cfg.resolve_info();
        let class = cfg.providers.class_init(&info, cfg.server)?;
        let self_uri = class.self_addr()?;

        let mut membs = cfg.membs;
        if membs.is_empty() {
            membs.push(cfg.self_rank);
        }
        crate::util::rank_list_sort_uniq(&mut membs);
        if !membs.iter().copied().eq(0..membs.len() as Rank) {
            log::error!("primary membership must be the dense ranks 0..{}", membs.len());
            return Err(Error::Inval);
        }
        if !membs.contains(&cfg.self_rank) {
            log::error!("rank {} not in primary membership {:?}", cfg.self_rank, membs);
            return Err(Error::Inval);
        }

        let primary = Arc::new(Group::new_primary(&cfg.grp_id, membs));
        primary.seed_uri(cfg.self_rank, &self_uri);
        for (rank, uri) in &cfg.uris {
            primary.seed_uri(*rank, uri);
        }

        let opc_map = OpcMap::new(cfg.opc_map_bits);
        group::register_internal_rpcs(&opc_map)?;

        log::info!(
            "runtime up: rank {} of group {:?}, listening at {:?}",
            cfg.self_rank,
            primary.id(),
            self_uri
        );

        Ok(Arc::new(Runtime {
            server: cfg.server,
            multi_fabric: cfg.multi_fabric,
            info,
            default_timeout_us: cfg.default_timeout_us,
            max_inflight: cfg.max_inflight,
            providers: cfg.providers,
            class,
            self_uri,
            self_rank: cfg.self_rank,
            opc_map,
            groups: GroupTable::new(primary),
            ctxs: RwLock::new(Vec::new()),
            state: Mutex::new(RtState::Running),
            seq: AtomicU64::new(1),
        }))
    }

    /// Tear down. Refused while any context still tracks requests.
    pub fn finalize(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if matches!(*state, RtState::Finalized) {
            log::error!("finalize of a finalized runtime");
            return Err(Error::NoPerm);
        }

        let ctxs = self.ctxs.read().unwrap();
        if let Some(busy) = ctxs.iter().find(|ctx| !ctx.is_empty()) {
            log::error!("context {} still has requests in flight", busy.idx);
            return Err(Error::Misc);
        }
        drop(ctxs);

        self.ctxs.write().unwrap().clear();
        *state = RtState::Finalized;
        Ok(())
    }

    fn check_running(&self) -> Result<()> {
        match *self.state.lock().unwrap() {
            RtState::Running => Ok(()),
            RtState::Finalized => Err(Error::Uninit),
        }
    }

    /// Create the next progress context, optionally bound to a handler
    /// pool. Context 0 shares the runtime's transport class; later ones get
    /// their own when `multi_fabric` is set. Either way the request
    /// dispatcher is re-bound per context so incoming traffic and
    /// completions land on the context being progressed.
    pub fn context_create(
        self: &Arc<Self>,
        pool: Option<Arc<dyn TaskPool>>,
    ) -> Result<Arc<Context>> {
        self.check_running()?;

        let mut ctxs = self.ctxs.write().unwrap();
        let idx = ctxs.len() as u32;

        let class = if idx == 0 || !self.multi_fabric {
            Arc::clone(&self.class)
        } else {
            // A fresh class listens on its own address, so strip the
            // authority and let the provider assign one.
            let bare = match self.info.split_once("://") {
                Some((scheme, _)) => format!("{}://", scheme),
                None => self.info.clone(),
            };
            let class = self.providers.class_init(&bare, self.server)?;
            log::debug!(
                "context {} gets its own class at {:?}",
                idx,
                class.self_addr().unwrap_or_default()
            );
            class
        };

        let trans_ctx = class.create_context(idx)?;

        let ctx = Arc::new(Context {
            idx,
            runtime: Arc::downgrade(self),
            trans: trans_ctx,
            pool,
            epi: Mutex::new(HashMap::new()),
            timeout: Mutex::new(TimeoutHeap::default()),
            progressing: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&ctx);
        ctx.trans.set_rpc_handler(proto::RPC_ID, Arc::new(move |handle| {
            match weak.upgrade() {
                Some(ctx) => rpc::incoming_rpc(&ctx, handle),
                None => log::warn!("request arrived for a destroyed context"),
            }
        }));

        ctxs.push(Arc::clone(&ctx));
        Ok(ctx)
    }

    /// Drop a context from the runtime. Refused while it tracks requests.
    pub fn context_destroy(&self, ctx: &Arc<Context>) -> Result<()> {
        if !ctx.is_empty() {
            log::error!("context {} busy, not destroying", ctx.idx);
            return Err(Error::Misc);
        }

        let mut ctxs = self.ctxs.write().unwrap();
        match ctxs.iter().position(|c| Arc::ptr_eq(c, ctx)) {
            Some(pos) => {
                ctxs.remove(pos);
                Ok(())
            }
            None => Err(Error::Nonexist),
        }
    }

    /// Register an application opcode.
    pub fn register(
        &self,
        opc: Opcode,
        fmt: &'static ReqFormat,
        handler: Option<RpcHandler>,
    ) -> Result<()> {
        self.check_running()?;
        self.opc_map.register(opc, fmt, handler, None, false)
    }

    /// Register an opcode with collective ops and/or one-way semantics.
    pub fn register_full(
        &self,
        opc: Opcode,
        fmt: &'static ReqFormat,
        handler: Option<RpcHandler>,
        co_ops: Option<CorpcOps>,
        no_reply: bool,
    ) -> Result<()> {
        self.check_running()?;
        self.opc_map.register(opc, fmt, handler, co_ops, no_reply)
    }

    pub fn self_rank(&self) -> Rank {
        self.self_rank
    }

    /// Caller's rank within `grp` (`None` means the primary group).
    pub fn group_rank(&self, grp: Option<&Arc<Group>>) -> Result<Rank> {
        match grp {
            None => Ok(self.self_rank),
            Some(grp) => grp.index_of(self.self_rank).ok_or(Error::Nonexist),
        }
    }

    pub fn self_uri(&self) -> &str {
        &self.self_uri
    }

    pub fn primary_group(&self) -> Arc<Group> {
        self.groups.primary()
    }

    pub fn group_lookup(&self, grp_id: &str) -> Option<Arc<Group>> {
        self.groups.lookup(grp_id)
    }

    /// Collective creation of a secondary group over the members' ranks.
    /// Blocks on `ctx` progress until every member answered.
    pub fn group_create(
        self: &Arc<Self>,
        ctx: &Arc<Context>,
        grp_id: &str,
        membs: &[Rank],
    ) -> Result<Arc<Group>> {
        self.check_running()?;
        group::group_create(self, ctx, grp_id, membs)
    }

    /// Collective teardown of a secondary group.
    pub fn group_destroy(self: &Arc<Self>, ctx: &Arc<Context>, grp_id: &str) -> Result<()> {
        self.check_running()?;
        group::group_destroy(self, ctx, grp_id)
    }

    pub(crate) fn opc_map(&self) -> &OpcMap {
        &self.opc_map
    }

    pub(crate) fn groups(&self) -> &GroupTable {
        &self.groups
    }

    pub(crate) fn default_timeout_us(&self) -> u64 {
        self.default_timeout_us
    }

    pub(crate) fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_grp_seq(&self) -> u64 {
        self.next_seq()
    }
}

#[derive(Default)]
struct Epi {
    inflight_q: VecDeque<Arc<Rpc>>,
    wait_q: VecDeque<Arc<Rpc>>,
    inflight_num: u32,
    wait_num: u32,
}

#[derive(Default)]
struct TimeoutHeap {
    heap: BinaryHeap<Reverse<(u64, u64)>>,
    live: HashMap<u64, Weak<Rpc>>,
}

pub(crate) enum Tracked {
    Inflight,
    Wait,
}

/// One unit of progress: a transport context plus its inflight table and
/// timeout heap.
pub struct Context {
    idx: u32,
    runtime: Weak<Runtime>,
    trans: Arc<dyn trans::Ctx>,
    pool: Option<Arc<dyn TaskPool>>,
    epi: Mutex<HashMap<Rank, Epi>>,
    timeout: Mutex<TimeoutHeap>,
    progressing: AtomicBool,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Context").field("idx", &self.idx).finish()
    }
}

struct ProgressGuard<'a>(&'a AtomicBool);

impl Drop for ProgressGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Context {
    pub fn idx(&self) -> u32 {
        self.idx
    }

    pub(crate) fn runtime(&self) -> Result<Arc<Runtime>> {
        self.runtime.upgrade().ok_or(Error::Uninit)
    }

    pub(crate) fn trans(&self) -> &Arc<dyn trans::Ctx> {
        &self.trans
    }

    pub(crate) fn pool(&self) -> Option<Arc<dyn TaskPool>> {
        self.pool.clone()
    }

    /// No requests tracked on any endpoint of this context.
    pub fn is_empty(&self) -> bool {
        self.epi
            .lock()
            .unwrap()
            .values()
            .all(|epi| epi.inflight_num == 0 && epi.wait_num == 0)
    }

    /// Create a point-to-point request towards `ep`.
    pub fn rpc_create(self: &Arc<Self>, ep: &Endpoint, opc: Opcode) -> Result<Arc<Rpc>> {
        rpc::req_create(self, ep, opc)
    }

    /// Create a collective request over `grp`, rooted here.
    pub fn corpc_create(
        self: &Arc<Self>,
        grp: &Arc<Group>,
        excluded: Option<&[Rank]>,
        opc: Opcode,
        input: Vec<Value>,
        topo: TreeTopo,
    ) -> Result<Arc<Rpc>> {
        corpc::corpc_create(self, grp, excluded, opc, input, topo)
    }

    /// Account a request against its endpoint: inflight if below the cap,
    /// parked on the wait queue otherwise, and armed in the timeout heap
    /// either way.
    pub(crate) fn req_track(&self, rpc: &Arc<Rpc>) -> Result<Tracked> {
        let rt = self.runtime()?;

        let ts = {
            let mut inner = rpc.inner.lock().unwrap();
            inner.timeout_ts = deadline_us(inner.timeout_us);
            inner.tracked = true;
            inner.timeout_ts
        };

        {
            let mut timeout = self.timeout.lock().unwrap();
            timeout.heap.push(Reverse((ts, rpc.seq)));
            timeout.live.insert(rpc.seq, Arc::downgrade(rpc));
        }

        let mut epi_map = self.epi.lock().unwrap();
        let epi = epi_map.entry(rpc.dest).or_default();

        if epi.inflight_num < rt.max_inflight {
            epi.inflight_q.push_back(Arc::clone(rpc));
            epi.inflight_num += 1;
            Ok(Tracked::Inflight)
        } else {
            epi.wait_q.push_back(Arc::clone(rpc));
            epi.wait_num += 1;
            rpc.set_state(RpcState::Queued);
            Ok(Tracked::Wait)
        }
    }

    /// Drop a request from its endpoint accounting and promote wait-queue
    /// heads into the freed inflight slots, FIFO. A promoted request that
    /// fails to forward is completed with the failure in this same call
    /// chain.
    pub(crate) fn req_untrack(&self, rpc: &Arc<Rpc>) {
        {
            let mut timeout = self.timeout.lock().unwrap();
            timeout.live.remove(&rpc.seq);
        }

        let was_tracked = {
            let mut inner = rpc.inner.lock().unwrap();
            std::mem::replace(&mut inner.tracked, false)
        };
        if !was_tracked {
            return;
        }

        let max_inflight = match self.runtime() {
            Ok(rt) => rt.max_inflight,
            Err(_) => return,
        };

        let mut promoted = Vec::new();
        {
            let mut epi_map = self.epi.lock().unwrap();
            let epi = match epi_map.get_mut(&rpc.dest) {
                Some(epi) => epi,
                None => return,
            };

            if let Some(pos) = epi.inflight_q.iter().position(|r| r.seq == rpc.seq) {
                epi.inflight_q.remove(pos);
                epi.inflight_num -= 1;
            } else if let Some(pos) = epi.wait_q.iter().position(|r| r.seq == rpc.seq) {
                epi.wait_q.remove(pos);
                epi.wait_num -= 1;
            }

            while epi.inflight_num < max_inflight && !epi.wait_q.is_empty() {
                let next = epi.wait_q.pop_front().expect("checked non-empty");
                epi.wait_num -= 1;
                epi.inflight_q.push_back(Arc::clone(&next));
                epi.inflight_num += 1;
                promoted.push(next);
            }
        }

        for next in promoted {
            next.set_state(RpcState::ReqSent);
            if let Err(err) = rpc::transport_send(&next) {
                log::error!("promoted forward of {:#x} failed: {}", next.opc(), err);
                rpc::complete_with(&next, err.code());
            }
        }
    }

    /// Drive this context once: sweep expired timeouts, drain ready
    /// completions, make transport progress bounded by `timeout_us`, and
    /// drain again.
    ///
    /// `timeout_us < 0` blocks until activity, `0` polls, positive values
    /// below a millisecond round up to one. Returns `TimedOut` when the
    /// transport saw nothing, and `Inval` if another thread is already
    /// progressing this context.
    pub fn progress(&self, timeout_us: i64) -> Result<()> {
        if self.progressing.swap(true, Ordering::Acquire) {
            log::error!("context {} progressed from two threads", self.idx);
            return Err(Error::Inval);
        }
        let _guard = ProgressGuard(&self.progressing);

        self.sweep_timeouts();

        let timeout_ms: u32 = if timeout_us < 0 {
            u32::MAX
        } else if timeout_us == 0 {
            0
        } else {
            ((timeout_us / 1000) as u32).max(1)
        };

        self.trigger_drain()?;

        match self.trans.progress(timeout_ms) {
            Ok(()) => {}
            Err(Error::TimedOut) => return Err(Error::TimedOut),
            Err(err) => {
                log::error!("transport progress failed: {}", err);
                return Err(Error::Hg);
            }
        }

        if let Some(pool) = &self.pool {
            pool.yield_now();
        }

        self.trigger_drain()
    }

    fn trigger_drain(&self) -> Result<()> {
        loop {
            let count = self.trans.trigger(u32::MAX).map_err(|err| {
                log::error!("transport trigger failed: {}", err);
                Error::Hg
            })?;

            if count == 0 {
                return Ok(());
            }
        }
    }

    fn sweep_timeouts(&self) {
        let now = monotonic_us();

        let expired: Vec<Arc<Rpc>> = {
            let mut timeout = self.timeout.lock().unwrap();
            let mut expired = Vec::new();

            while let Some(Reverse((ts, seq))) = timeout.heap.peek().copied() {
                if ts > now {
                    break;
                }
                timeout.heap.pop();

                // Untracked entries stay in the heap until reaped here.
                if let Some(rpc) = timeout.live.remove(&seq).and_then(|weak| weak.upgrade()) {
                    expired.push(rpc);
                }
            }

            expired
        };

        for rpc in expired {
            rpc::timeout_rpc(&rpc);
        }
    }

    /// Register a scatter-gather list as a bulk handle on this context.
    pub fn bulk_create(
        &self,
        sgl: &trans::SgList,
        perm: trans::BulkPerm,
    ) -> Result<Arc<dyn trans::Bulk>> {
        self.trans.bulk_create(sgl, perm)
    }

    /// Recover the memory behind a bulk handle into `sgl`.
    pub fn bulk_access(&self, bulk: &Arc<dyn trans::Bulk>, sgl: &mut trans::SgList) -> Result<()> {
        self.trans.bulk_access(bulk, sgl)
    }

    /// One-sided transfer; the callback fires from this context's
    /// progress.
    pub fn bulk_transfer(&self, desc: trans::BulkDesc, cb: trans::BulkCb) -> Result<u64> {
        self.trans.bulk_transfer(desc, cb)
    }

    /// Counters of the endpoint record towards `rank`:
    /// `(inflight, waiting)`.
    pub fn epi_counts(&self, rank: Rank) -> (u32, u32) {
        let epi_map = self.epi.lock().unwrap();
        match epi_map.get(&rank) {
            Some(epi) => (epi.inflight_num, epi.wait_num),
            None => (0, 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        proto::{FieldDef, FieldKind},
        transport::mem::MemFabric,
    };

    static PING_FMT: ReqFormat = ReqFormat {
        name: "ping",
        input: &[FieldDef { name: "x", kind: FieldKind::U32 }],
        output: &[FieldDef { name: "x", kind: FieldKind::U32 }],
    };

    fn pair() -> (Arc<Runtime>, Arc<Context>, Arc<Runtime>, Arc<Context>) {
        let fabric = MemFabric::new();
        let uris = vec![
            (0, String::from("mem://t0")),
            (1, String::from("mem://t1")),
        ];

        let make = |rank: Rank| {
            let mut cfg = Config::default();
            cfg.providers.register("mem", fabric.factory()).unwrap();
            cfg.info_string = Some(format!("mem://t{}", rank));
            cfg.self_rank = rank;
            cfg.membs = vec![0, 1];
            cfg.uris = uris.clone();
            Runtime::init(cfg).unwrap()
        };

        let rt0 = make(0);
        let ctx0 = rt0.context_create(None).unwrap();
        let rt1 = make(1);
        let ctx1 = rt1.context_create(None).unwrap();
        (rt0, ctx0, rt1, ctx1)
    }

    #[test]
    fn track_untrack_leaves_counters_unchanged() {
        let (rt0, ctx0, _rt1, _ctx1) = pair();
        rt0.register(0x900, &PING_FMT, None).unwrap();

        let rpc = ctx0.rpc_create(&Endpoint::new(1), 0x900).unwrap();
        rpc.set_input(vec![Value::U32(1)]).unwrap();

        assert_eq!(ctx0.epi_counts(1), (0, 0));
        assert!(matches!(ctx0.req_track(&rpc).unwrap(), Tracked::Inflight));
        assert_eq!(ctx0.epi_counts(1), (1, 0));

        ctx0.req_untrack(&rpc);
        assert_eq!(ctx0.epi_counts(1), (0, 0));
        assert_eq!(rpc.state(), RpcState::Inited);
        assert!(ctx0.is_empty());
    }

    #[test]
    fn rpc_create_validates_the_endpoint() {
        let (rt0, ctx0, _rt1, _ctx1) = pair();
        rt0.register(0x900, &PING_FMT, None).unwrap();

        assert_eq!(
            ctx0.rpc_create(&Endpoint::new(7), 0x900).unwrap_err(),
            Error::Inval
        );
        assert_eq!(
            ctx0.rpc_create(&Endpoint::new(1), 0x901).unwrap_err(),
            Error::Unreg
        );
    }

    #[test]
    fn runtime_rejects_sparse_membership() {
        let fabric = MemFabric::new();
        let mut cfg = Config::default();
        cfg.providers.register("mem", fabric.factory()).unwrap();
        cfg.info_string = Some(String::from("mem://sparse"));
        cfg.self_rank = 2;
        cfg.membs = vec![2, 5];

        assert_eq!(Runtime::init(cfg).unwrap_err(), Error::Inval);
    }
}
