//! RPC lifecycle: creation, send and reply paths, cancellation, the
//! synchronous wait, and the server-side dispatch entry. An RPC is shared
//! as an `Arc`; queues and in-flight transport callbacks hold clones, so it
//! is destroyed exactly when the last owner lets go.

use bytes::{Bytes, BytesMut};
use std::sync::{
    atomic::{AtomicBool, AtomicI32, Ordering},
    Arc, Mutex, MutexGuard,
};

use crate::{
    context::{Context, Tracked},
    corpc::{self, CorpcInfo},
    group::{self, Group},
    proto::{self, CollectiveHdr, Header, HeaderFlags, Value},
    registry::OpcInfo,
    transport::{self as trans, Tag},
    util::{deadline_us, monotonic_us},
    Error, Opcode, Rank, Result,
};

/// Addressing tuple of a request: group (`None` means the primary group),
/// rank within that group, and the destination context tag.
#[derive(Clone)]
pub struct Endpoint {
    pub grp: Option<Arc<Group>>,
    pub rank: Rank,
    pub tag: Tag,
}

impl Endpoint {
    pub fn new(rank: Rank) -> Endpoint {
        Endpoint { grp: None, rank, tag: 0 }
    }

    pub fn tagged(rank: Rank, tag: Tag) -> Endpoint {
        Endpoint { grp: None, rank, tag }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RpcState {
    Inited,
    Queued,
    ReqSent,
    ReplyRecved,
    Completed,
    Canceled,
    TimedOut,
}

impl RpcState {
    fn terminal(&self) -> bool {
        matches!(self, RpcState::Completed | RpcState::Canceled | RpcState::TimedOut)
    }
}

pub struct CompletionInfo {
    pub rpc: Arc<Rpc>,
    /// 0 on success, a negative wire code otherwise.
    pub rc: i32,
}

pub type CompleteCb = Box<dyn FnOnce(&CompletionInfo) + Send>;

/// Server-side handler of a registered opcode.
pub type RpcHandler = Arc<dyn Fn(&Arc<Rpc>) -> Result<()> + Send + Sync>;

pub struct Rpc {
    pub(crate) opc: Opcode,
    pub(crate) info: Arc<OpcInfo>,
    pub(crate) ctx: Arc<Context>,
    /// Runtime-unique; doubles as the wire cookie and the timeout-heap key.
    pub(crate) seq: u64,
    pub(crate) srv: bool,
    pub(crate) forward: bool,
    pub(crate) coll: bool,
    /// Primary rank of the peer (destination on the client side, requester
    /// on the server side). Keys the endpoint-inflight table.
    pub(crate) dest: Rank,
    pub(crate) inner: Mutex<RpcInner>,
    pub(crate) corpc: Mutex<Option<CorpcInfo>>,
}

pub(crate) struct RpcInner {
    pub state: RpcState,
    pub req_hdr: Header,
    pub reply_hdr: Option<Header>,
    /// Decoded input, shared with forwarded children.
    pub input: Option<Arc<Vec<Value>>>,
    /// Packed input body; a forwarded child clones the parent's, so it
    /// never owns the bytes it sends.
    pub input_bytes: Option<Bytes>,
    pub output: Option<Vec<Value>>,
    pub complete_cb: Option<CompleteCb>,
    pub handle: Option<Arc<dyn trans::Handle>>,
    pub coll_hdr: Option<CollectiveHdr>,
    pub timeout_us: u64,
    pub timeout_ts: u64,
    pub tracked: bool,
    pub replied: bool,
}

impl RpcInner {
    fn new(req_hdr: Header, timeout_us: u64) -> RpcInner {
        RpcInner {
            state: RpcState::Inited,
            req_hdr,
            reply_hdr: None,
            input: None,
            input_bytes: None,
            output: None,
            complete_cb: None,
            handle: None,
            coll_hdr: None,
            timeout_us,
            timeout_ts: 0,
            tracked: false,
            replied: false,
        }
    }
}

impl std::fmt::Debug for Rpc {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Rpc")
            .field("opc", &self.opc)
            .field("seq", &self.seq)
            .field("peer", &self.dest)
            .field("state", &self.state())
            .finish()
    }
}

impl Rpc {
    pub fn opc(&self) -> Opcode {
        self.opc
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn is_server(&self) -> bool {
        self.srv
    }

    pub fn is_collective(&self) -> bool {
        self.coll
    }

    /// Rank of the peer in its primary group.
    pub fn peer_rank(&self) -> Rank {
        self.dest
    }

    pub fn state(&self) -> RpcState {
        self.inner.lock().unwrap().state
    }

    pub(crate) fn set_state(&self, state: RpcState) {
        self.inner.lock().unwrap().state = state;
    }

    /// Override the per-RPC timeout; only effective before `send`.
    pub fn set_timeout(&self, timeout_us: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != RpcState::Inited {
            return Err(Error::Inval);
        }
        inner.timeout_us = timeout_us;
        Ok(())
    }

    pub fn input(&self) -> Option<Arc<Vec<Value>>> {
        self.inner.lock().unwrap().input.clone()
    }

    /// Attach request arguments. Client side, before `send`.
    pub fn set_input(&self, input: Vec<Value>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if self.srv || inner.state != RpcState::Inited {
            log::error!("input attached to a live or server-side request");
            return Err(Error::Inval);
        }

        inner.input = Some(Arc::new(input));
        inner.input_bytes = None;
        Ok(())
    }

    pub fn output(&self) -> Option<Vec<Value>> {
        self.inner.lock().unwrap().output.clone()
    }

    /// Attach the reply payload. Server side, before `reply_send`.
    pub fn set_output(&self, output: Vec<Value>) -> Result<()> {
        self.inner.lock().unwrap().output = Some(output);
        Ok(())
    }

    /// Mutate the reply payload in place, materializing a zeroed one on
    /// first touch. This is the accumulator collective aggregation writes
    /// into.
    pub fn modify_output<F: FnOnce(&mut Vec<Value>)>(&self, f: F) {
        let mut inner = self.inner.lock().unwrap();
        let fmt = self.info.fmt;
        let output = inner
            .output
            .get_or_insert_with(|| proto::zero_values(fmt.output));
        f(output);
    }

    pub(crate) fn init_zero_output(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.output.is_none() {
            inner.output = Some(proto::zero_values(self.info.fmt.output));
        }
    }

    /// Header cookie, echoed by the peer in its reply.
    pub fn cookie(&self) -> u64 {
        self.inner.lock().unwrap().req_hdr.cookie
    }

    /// Submit the request. The callback, if any, fires exactly once from
    /// the owning context's progress thread.
    pub fn send(self: &Arc<Self>, complete_cb: Option<CompleteCb>) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != RpcState::Inited {
                log::error!("send on a live request (state {:?})", inner.state);
                return Err(Error::Inval);
            }
            inner.complete_cb = complete_cb;
        }

        if self.coll {
            return corpc::req_hdlr(self);
        }

        match self.ctx.req_track(self)? {
            Tracked::Inflight => {
                // State moves before the forward so a completion racing in
                // from the progress thread sees a sent request.
                self.set_state(RpcState::ReqSent);
                if let Err(err) = transport_send(self) {
                    log::error!("forward of {:#x} failed: {}", self.opc, err);
                    self.set_state(RpcState::Inited);
                    self.ctx.req_untrack(self);
                    return Err(err);
                }
            }
            Tracked::Wait => {}
        }

        Ok(())
    }

    /// Send and block on the owning context's progress until completion or
    /// the deadline. `timeout_us == 0` means the runtime default.
    pub fn send_sync(self: &Arc<Self>, timeout_us: u64) -> Result<()> {
        let flag = Arc::new((AtomicBool::new(false), AtomicI32::new(0)));

        let cb_flag = Arc::clone(&flag);
        self.send(Some(Box::new(move |info| {
            cb_flag.1.store(info.rc, Ordering::Release);
            cb_flag.0.store(true, Ordering::Release);
        })))?;

        let timeout_us = if timeout_us == 0 {
            self.inner.lock().unwrap().timeout_us
        } else {
            timeout_us
        };
        let end = deadline_us(timeout_us);

        loop {
            if flag.0.load(Ordering::Acquire) {
                break;
            }

            match self.ctx.progress(1000) {
                Ok(()) | Err(Error::TimedOut) => {}
                Err(err) => {
                    log::error!("progress failed: {}", err);
                    return Err(err);
                }
            }

            if flag.0.load(Ordering::Acquire) {
                break;
            }
            if monotonic_us() >= end {
                return Err(Error::TimedOut);
            }
        }

        match flag.1.load(Ordering::Acquire) {
            0 => Ok(()),
            rc => Err(Error::from_code(rc).unwrap_or(Error::Misc)),
        }
    }

    /// Send the reply of a received request.
    pub fn reply_send(self: &Arc<Self>) -> Result<()> {
        if self.coll {
            // The node's own contribution to the fan-in.
            return corpc::reply_hdlr(self, None, 0);
        }

        transport_reply(self, 0)
    }

    /// Best-effort abort: submits a cancel and returns. The completion
    /// callback eventually reports `Canceled`.
    pub fn abort(&self) -> Result<()> {
        let handle = self.inner.lock().unwrap().handle.clone();
        match handle {
            Some(handle) => handle.cancel(),
            None => {
                log::error!("abort of {:#x} with no transport handle", self.opc);
                Err(Error::Inval)
            }
        }
    }
}

/// Client-side creation: validate the endpoint, resolve the peer address
/// and create the transport handle. The RPC starts in `Inited`.
pub(crate) fn req_create(ctx: &Arc<Context>, ep: &Endpoint, opc: Opcode) -> Result<Arc<Rpc>> {
    let rt = ctx.runtime()?;

    let grp = match &ep.grp {
        None => rt.primary_group(),
        Some(grp) => {
            if !grp.is_primary() || !grp.is_service() {
                log::error!("endpoint group {:?} is not a primary service group", grp.id());
                return Err(Error::Inval);
            }
            Arc::clone(grp)
        }
    };

    if ep.rank >= grp.size() {
        log::error!(
            "rank {} out of range for group {:?} of size {}",
            ep.rank,
            grp.id(),
            grp.size()
        );
        return Err(Error::Inval);
    }

    create_internal(ctx, &grp, ep, opc, false)
}

/// Shared by the public create and the collective fan-out (forwarded
/// children reuse the parent's input).
pub(crate) fn create_internal(
    ctx: &Arc<Context>,
    grp: &Arc<Group>,
    ep: &Endpoint,
    opc: Opcode,
    forward: bool,
) -> Result<Arc<Rpc>> {
    let rt = ctx.runtime()?;

    let info = rt.opc_map().lookup(opc).ok_or_else(|| {
        log::error!("opcode {:#x} not registered", opc);
        Error::Unreg
    })?;

    let dest = grp.member_at(ep.rank).ok_or(Error::Inval)?;
    let seq = rt.next_seq();
    let req_hdr = Header::request(opc, rt.self_rank(), grp.id(), seq);

    let rpc = Arc::new(Rpc {
        opc,
        info,
        ctx: Arc::clone(ctx),
        seq,
        srv: false,
        forward,
        coll: false,
        dest,
        inner: Mutex::new(RpcInner::new(req_hdr, rt.default_timeout_us())),
        corpc: Mutex::new(None),
    });

    let addr = group::lc_lookup(&rt, grp, ctx, ep.rank, ep.tag)?;
    let handle = ctx.trans().create_handle(&addr, ep.tag, proto::RPC_ID)?;
    rpc.inner.lock().unwrap().handle = Some(handle);

    Ok(rpc)
}

/// Collective root: no single destination, so no transport handle; the
/// fan-out creates one per child.
pub(crate) fn alloc_coll_root(
    ctx: &Arc<Context>,
    grp: &Arc<Group>,
    opc: Opcode,
    info: Arc<OpcInfo>,
) -> Result<Arc<Rpc>> {
    let rt = ctx.runtime()?;
    let seq = rt.next_seq();
    let req_hdr = Header::request(opc, rt.self_rank(), grp.id(), seq);

    Ok(Arc::new(Rpc {
        opc,
        info,
        ctx: Arc::clone(ctx),
        seq,
        srv: false,
        forward: false,
        coll: true,
        dest: rt.self_rank(),
        inner: Mutex::new(RpcInner::new(req_hdr, rt.default_timeout_us())),
        corpc: Mutex::new(None),
    }))
}

fn ensure_input_bytes(rpc: &Rpc, inner: &mut MutexGuard<'_, RpcInner>) -> Result<Bytes> {
    if let Some(bytes) = &inner.input_bytes {
        return Ok(bytes.clone());
    }

    let values: &[Value] = match &inner.input {
        Some(input) => input.as_slice(),
        None => &[],
    };

    let mut buf = BytesMut::new();
    proto::pack_body(rpc.info.fmt.input, values, &mut buf)?;

    let bytes = buf.freeze();
    inner.input_bytes = Some(bytes.clone());
    Ok(bytes)
}

/// Packed request body, materialized once and shared with forwarded
/// children.
pub(crate) fn packed_input(rpc: &Rpc) -> Result<Bytes> {
    let mut inner = rpc.inner.lock().unwrap();
    ensure_input_bytes(rpc, &mut inner)
}

/// Hand the packed request to the transport. The completion callback owns a
/// reference for the duration of the exchange.
pub(crate) fn transport_send(rpc: &Arc<Rpc>) -> Result<()> {
    let (payload, handle) = {
        let mut inner = rpc.inner.lock().unwrap();

        let handle = inner.handle.clone().ok_or(Error::Inval)?;

        let mut hdr = inner.req_hdr.clone();
        if rpc.coll || inner.coll_hdr.is_some() {
            hdr.flags |= HeaderFlags::COLL;
        }
        if rpc.forward {
            hdr.flags |= HeaderFlags::FORWARD;
        }
        if rpc.info.no_reply {
            hdr.flags |= HeaderFlags::NO_REPLY;
        }

        let body = ensure_input_bytes(rpc, &mut inner)?;

        let mut buf = BytesMut::with_capacity(proto::HEADER_SIZE + body.len());
        hdr.pack(&mut buf)?;
        if let Some(coll_hdr) = &inner.coll_hdr {
            coll_hdr.pack(&mut buf);
        }
        buf.extend_from_slice(&body);

        (buf.freeze(), handle)
    };

    let cb_rpc = Arc::clone(rpc);
    handle.forward(
        payload,
        rpc.info.no_reply,
        Box::new(move |info| req_send_cb(&cb_rpc, info)),
    )
}

/// Common completion of a forwarded request, on the progress thread.
fn req_send_cb(rpc: &Arc<Rpc>, info: trans::CbInfo) {
    let mut rc: i32 = 0;
    let canceled = matches!(info.status, Err(Error::Canceled));

    let mut inner = rpc.inner.lock().unwrap();

    match &info.status {
        Ok(()) => {}
        Err(Error::Canceled) => {
            if inner.state == RpcState::TimedOut {
                // The timeout sweep already fired the callback and
                // untracked; this is just its cancel being acknowledged.
                log::debug!("timed out request {:#x} canceled", rpc.opc);
                return;
            }
            rc = Error::Canceled.code();
        }
        Err(err) => {
            log::error!("forward of {:#x} completed in error: {}", rpc.opc, err);
            rc = Error::Hg.code();
        }
    }

    let cb = inner.complete_cb.take();
    if cb.is_none() {
        // No callback registered; the state still settles and the
        // reference bookkeeping is identical.
        inner.state = if canceled { RpcState::Canceled } else { RpcState::Completed };
        drop(inner);
        rpc.ctx.req_untrack(rpc);
        return;
    }

    if rc == 0 {
        inner.state = RpcState::ReplyRecved;
        if !rpc.info.no_reply {
            match unpack_reply(rpc, &mut inner, info.reply) {
                Ok(hdr_rc) => rc = hdr_rc,
                Err(err) => {
                    log::error!("reply of {:#x} undecodable: {}", rpc.opc, err);
                    rc = err.code();
                }
            }
        }
    }
    drop(inner);

    let cb = cb.expect("checked above");
    cb(&CompletionInfo { rpc: Arc::clone(rpc), rc });

    rpc.set_state(if canceled { RpcState::Canceled } else { RpcState::Completed });
    rpc.ctx.req_untrack(rpc);
}

fn unpack_reply(
    rpc: &Rpc,
    inner: &mut MutexGuard<'_, RpcInner>,
    reply: Option<Bytes>,
) -> Result<i32> {
    let mut bytes = reply.ok_or_else(|| {
        log::error!("two-way forward completed without a reply payload");
        Error::Proto
    })?;

    let hdr = Header::unpack(&mut bytes)?;
    if hdr.opc != rpc.opc || hdr.cookie != inner.req_hdr.cookie {
        log::error!("reply {} does not match request {}", hdr, inner.req_hdr);
        return Err(Error::Proto);
    }

    let rc = hdr.rc;
    inner.reply_hdr = Some(hdr);

    if rc == 0 {
        inner.output = Some(proto::unpack_body(rpc.info.fmt.output, &mut bytes)?);
    }

    Ok(rc)
}

/// Respond on the wire. `rc != 0` sends a bodyless error reply. The
/// respond callback holds its own reference until the send completes.
pub(crate) fn transport_reply(rpc: &Arc<Rpc>, rc: i32) -> Result<()> {
    let rt = rpc.ctx.runtime()?;

    let (payload, handle) = {
        let mut inner = rpc.inner.lock().unwrap();

        if inner.replied {
            log::error!("duplicate reply for {:#x}", rpc.opc);
            return Err(Error::Already);
        }

        let handle = inner.handle.clone().ok_or(Error::Inval)?;
        let hdr = inner.req_hdr.reply_to(rt.self_rank(), rc);

        let mut buf = BytesMut::new();
        hdr.pack(&mut buf)?;
        if rc == 0 {
            let fmt = rpc.info.fmt;
            let output = inner
                .output
                .get_or_insert_with(|| proto::zero_values(fmt.output));
            proto::pack_body(fmt.output, output, &mut buf)?;
        }

        inner.replied = true;
        (buf.freeze(), handle)
    };

    let cb_rpc = Arc::clone(rpc);
    handle.respond(
        payload,
        Box::new(move |info| {
            if let Err(err) = info.status {
                log::error!("respond for {:#x} failed: {}", cb_rpc.opc, err);
            }
            cb_rpc.set_state(RpcState::Completed);
        }),
    )
}

/// Error reply for requests that failed before an RPC object existed
/// (unknown opcode, undecodable body).
fn reply_error_raw(handle: &Arc<dyn trans::Handle>, req_hdr: &Header, self_rank: Rank, rc: i32) {
    let hdr = req_hdr.reply_to(self_rank, rc);

    let mut buf = BytesMut::new();
    if hdr.pack(&mut buf).is_err() {
        return;
    }

    let result = handle.respond(
        buf.freeze(),
        Box::new(|info| {
            if let Err(err) = info.status {
                log::debug!("error reply not delivered: {}", err);
            }
        }),
    );

    if let Err(err) = result {
        log::debug!("error reply not sent: {}", err);
    }
}

/// Complete a request locally with `rc` (wait-queue promotion failures and
/// similar paths that never reach the transport).
pub(crate) fn complete_with(rpc: &Arc<Rpc>, rc: i32) {
    let cb = {
        let mut inner = rpc.inner.lock().unwrap();
        if inner.state.terminal() {
            return;
        }
        inner.state = RpcState::Completed;
        inner.complete_cb.take()
    };

    if let Some(cb) = cb {
        cb(&CompletionInfo { rpc: Arc::clone(rpc), rc });
    }

    rpc.ctx.req_untrack(rpc);
}

/// Timeout sweep victim: fire the callback with `TimedOut`, untrack, then
/// cancel whatever the transport still holds. The cancel acknowledgement
/// finds the terminal state and only drops bookkeeping.
pub(crate) fn timeout_rpc(rpc: &Arc<Rpc>) {
    let (cb, was_sent) = {
        let mut inner = rpc.inner.lock().unwrap();
        match inner.state {
            RpcState::ReqSent | RpcState::Queued => {}
            _ => return,
        }

        let was_sent = inner.state == RpcState::ReqSent;
        inner.state = RpcState::TimedOut;
        (inner.complete_cb.take(), was_sent)
    };

    log::warn!("request {:#x} to rank {} timed out", rpc.opc, rpc.dest);

    if let Some(cb) = cb {
        cb(&CompletionInfo {
            rpc: Arc::clone(rpc),
            rc: Error::TimedOut.code(),
        });
    }

    rpc.ctx.req_untrack(rpc);

    if was_sent {
        if let Err(err) = rpc.abort() {
            log::debug!("cancel of timed out {:#x} not submitted: {}", rpc.opc, err);
        }
    }
}

/// Transport-level entry for every incoming request: decode the header,
/// find the opcode and hand off to the point-to-point or collective
/// dispatcher.
pub(crate) fn incoming_rpc(ctx: &Arc<Context>, handle: Arc<dyn trans::Handle>) {
    let rt = match ctx.runtime() {
        Ok(rt) => rt,
        Err(_) => {
            log::error!("request arrived after runtime teardown");
            return;
        }
    };

    let payload = match handle.input() {
        Ok(payload) => payload,
        Err(err) => {
            log::error!("request payload unavailable: {}", err);
            return;
        }
    };

    let mut bytes = payload;
    let hdr = match Header::unpack(&mut bytes) {
        Ok(hdr) => hdr,
        Err(err) => {
            // Not even a cookie to answer to.
            log::error!("dropping undecodable request: {}", err);
            return;
        }
    };

    let no_reply = hdr.flags.contains(HeaderFlags::NO_REPLY);

    let coll_hdr = if hdr.flags.contains(HeaderFlags::COLL) {
        match CollectiveHdr::unpack(&mut bytes) {
            Ok(coll_hdr) => Some(coll_hdr),
            Err(err) => {
                log::error!("bad collective section from rank {}: {}", hdr.rank, err);
                reply_error_raw(&handle, &hdr, rt.self_rank(), err.code());
                return;
            }
        }
    } else {
        None
    };

    let info = match rt.opc_map().lookup(hdr.opc) {
        Some(info) => info,
        None => {
            log::error!("opcode {:#x} not registered here", hdr.opc);
            if !no_reply {
                reply_error_raw(&handle, &hdr, rt.self_rank(), Error::Unreg.code());
            }
            return;
        }
    };

    // The collective path hands these bytes to its children untouched, so
    // keep the packed body alongside the decoded values.
    let body_bytes = bytes.clone();
    let input = match proto::unpack_body(info.fmt.input, &mut bytes) {
        Ok(input) => input,
        Err(err) => {
            log::error!("body of {:#x} from rank {} undecodable: {}", hdr.opc, hdr.rank, err);
            if !no_reply {
                reply_error_raw(&handle, &hdr, rt.self_rank(), err.code());
            }
            return;
        }
    };

    let is_coll = coll_hdr.is_some();
    let timeout_us = rt.default_timeout_us();
    let mut inner = RpcInner::new(hdr.clone(), timeout_us);
    inner.input = Some(Arc::new(input));
    inner.input_bytes = Some(body_bytes);
    inner.handle = Some(handle);
    inner.coll_hdr = coll_hdr;

    let rpc = Arc::new(Rpc {
        opc: hdr.opc,
        info,
        ctx: Arc::clone(ctx),
        seq: rt.next_seq(),
        srv: true,
        forward: false,
        coll: is_coll,
        dest: hdr.rank,
        inner: Mutex::new(inner),
        corpc: Mutex::new(None),
    });

    if is_coll {
        corpc::common_hdlr(&rpc);
    } else {
        common_hdlr(&rpc);
    }
}

/// Run the registered handler, on the context's task pool when one is
/// attached, inline otherwise. Completion callbacks never run here; only
/// handler bodies do.
pub(crate) fn common_hdlr(rpc: &Arc<Rpc>) {
    let handler = match &rpc.info.handler {
        Some(handler) => Arc::clone(handler),
        None => {
            log::error!("opcode {:#x} has no handler", rpc.opc);
            if !rpc.info.no_reply {
                let _ = transport_reply(rpc, Error::Unreg.code());
            }
            return;
        }
    };

    let task_rpc = Arc::clone(rpc);
    let no_reply = rpc.info.no_reply;
    let task = move || {
        if let Err(err) = handler(&task_rpc) {
            log::error!("handler for {:#x} failed: {}", task_rpc.opc, err);
            if !no_reply {
                // Already covers the handler having replied before failing.
                match transport_reply(&task_rpc, err.code()) {
                    Ok(()) | Err(Error::Already) => {}
                    Err(err) => log::error!("error reply failed: {}", err),
                }
            }
        }
    };

    match rpc.ctx.pool() {
        Some(pool) => {
            if let Err(err) = pool.spawn(Box::new(task)) {
                log::error!("handler dispatch for {:#x} failed: {}", rpc.opc, err);
            }
        }
        None => task(),
    }
}
