//! In-process loopback provider. Every class is a node on a shared fabric;
//! a context owns one event queue per (node, tag). Requests and completions
//! are queued events: `progress` moves them to the ready list, `trigger`
//! runs them, which keeps the callback discipline identical to a real
//! network provider.

use bytes::Bytes;
use std::{
    any::Any,
    collections::{HashMap, VecDeque},
    mem::replace,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Condvar, Mutex,
    },
    time::Duration,
};

use super::{
    Addr, Bulk, BulkCb, BulkCbInfo, BulkDesc, BulkOp, BulkPerm, BulkRef, CbInfo, Class,
    ClassFactory, Ctx, ForwardCb, Handle, IncomingHandler, InfoString, LookupCb, RespondCb,
    SgList, Tag,
};
use crate::{Error, Result};

pub struct MemFabric {
    nodes: Mutex<HashMap<String, Arc<MemNode>>>,
    seq: AtomicU64,
}

impl MemFabric {
    pub fn new() -> Arc<MemFabric> {
        Arc::new(MemFabric {
            nodes: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
        })
    }

    /// Factory to register under the `mem` provider name.
    pub fn factory(self: &Arc<Self>) -> ClassFactory {
        let fabric = Arc::clone(self);
        Arc::new(move |info, server| {
            let class: Arc<dyn Class> = MemClass::init(&fabric, info, server)?;
            Ok(class)
        })
    }

    fn node(&self, base: &str) -> Option<Arc<MemNode>> {
        self.nodes.lock().unwrap().get(base).cloned()
    }
}

struct MemNode {
    base: String,
    queues: Mutex<HashMap<Tag, Arc<EventQueue>>>,
    regions: Mutex<HashMap<u64, Arc<MemRegion>>>,
    region_seq: AtomicU64,
}

impl MemNode {
    fn queue(&self, tag: Tag) -> Option<Arc<EventQueue>> {
        self.queues.lock().unwrap().get(&tag).cloned()
    }
}

pub struct MemClass {
    fabric: Arc<MemFabric>,
    node: Arc<MemNode>,
}

impl MemClass {
    fn init(fabric: &Arc<MemFabric>, info: &InfoString, server: bool) -> Result<Arc<MemClass>> {
        let name = if info.authority.is_empty() {
            format!("n{}", fabric.seq.fetch_add(1, Ordering::Relaxed))
        } else {
            info.authority.clone()
        };
        let base = format!("mem://{}", name);

        let node = Arc::new(MemNode {
            base: base.clone(),
            queues: Mutex::new(HashMap::new()),
            regions: Mutex::new(HashMap::new()),
            region_seq: AtomicU64::new(1),
        });

        // Only listening nodes are resolvable by name; replies route back
        // through queue references carried by the request itself.
        if server {
            let mut nodes = fabric.nodes.lock().unwrap();
            if nodes.contains_key(&base) {
                log::error!("fabric address {:?} already in use", base);
                return Err(Error::Exist);
            }
            nodes.insert(base, Arc::clone(&node));
        }

        Ok(Arc::new(MemClass {
            fabric: Arc::clone(fabric),
            node,
        }))
    }
}

impl Class for MemClass {
    fn self_addr(&self) -> Result<String> {
        Ok(self.node.base.clone())
    }

    fn create_context(&self, tag: Tag) -> Result<Arc<dyn Ctx>> {
        let queue = Arc::new(EventQueue::default());

        let mut queues = self.node.queues.lock().unwrap();
        if queues.contains_key(&tag) {
            log::error!("tag {} already bound on {:?}", tag, self.node.base);
            return Err(Error::Exist);
        }
        queues.insert(tag, Arc::clone(&queue));

        Ok(Arc::new(MemCtx {
            fabric: Arc::clone(&self.fabric),
            node: Arc::clone(&self.node),
            queue,
            ready: Mutex::new(VecDeque::new()),
            handler: Mutex::new(None),
            opid: AtomicU64::new(1),
        }))
    }
}

type ReadyFn = Box<dyn FnOnce() + Send>;

enum Event {
    Request {
        id: u32,
        payload: Bytes,
        reply: Option<Arc<ReplySlot>>,
    },
    Ready(ReadyFn),
}

#[derive(Default)]
struct EventQueue {
    inner: Mutex<VecDeque<Event>>,
    cv: Condvar,
}

impl EventQueue {
    fn push(&self, event: Event) {
        self.inner.lock().unwrap().push_back(event);
        self.cv.notify_all();
    }
}

/// One per two-way forward. Owns the forward completion callback until the
/// responder (or a cancel, or a dropped request) claims it.
struct ReplySlot {
    state: Mutex<SlotState>,
    origin: Arc<EventQueue>,
}

enum SlotState {
    Waiting(ForwardCb),
    Done,
}

impl ReplySlot {
    /// Fire the forward completion at the origin context. False if someone
    /// already did.
    fn complete(&self, info: CbInfo) -> bool {
        let cb = {
            let mut state = self.state.lock().unwrap();
            match replace(&mut *state, SlotState::Done) {
                SlotState::Waiting(cb) => cb,
                SlotState::Done => return false,
            }
        };

        self.origin.push(Event::Ready(Box::new(move || cb(info))));
        true
    }
}

impl Drop for ReplySlot {
    fn drop(&mut self) {
        // A request dropped without a response still completes its forward.
        if matches!(*self.state.get_mut().unwrap(), SlotState::Waiting(_)) {
            log::debug!("request dropped without response");
            self.complete(CbInfo {
                status: Err(Error::Hg),
                reply: None,
            });
        }
    }
}

struct MemAddr {
    node: Arc<MemNode>,
}

pub struct MemCtx {
    fabric: Arc<MemFabric>,
    node: Arc<MemNode>,
    queue: Arc<EventQueue>,
    ready: Mutex<VecDeque<ReadyFn>>,
    handler: Mutex<Option<(u32, IncomingHandler)>>,
    opid: AtomicU64,
}

impl MemCtx {
    fn make_ready(&self, event: Event) -> ReadyFn {
        match event {
            Event::Ready(f) => f,
            Event::Request { id, payload, reply } => {
                let handler = self.handler.lock().unwrap().clone();
                let queue = Arc::clone(&self.queue);

                Box::new(move || match handler {
                    Some((bound, handler)) if bound == id => {
                        handler(Arc::new(MemServerHandle {
                            payload,
                            reply: Mutex::new(reply),
                            queue,
                        }));
                    }
                    Some((bound, _)) => {
                        log::warn!("request id {:#x} does not match bound id {:#x}", id, bound);
                        drop(reply);
                    }
                    None => {
                        log::warn!("incoming request dropped: no handler bound");
                        drop(reply);
                    }
                })
            }
        }
    }
}

impl Ctx for MemCtx {
    fn set_rpc_handler(&self, id: u32, handler: IncomingHandler) {
        *self.handler.lock().unwrap() = Some((id, handler));
    }

    fn addr_lookup(&self, name: &str, cb: LookupCb) -> Result<()> {
        let resolved = match self.fabric.node(name) {
            Some(node) => Ok(Addr::new(MemAddr { node })),
            None => {
                log::debug!("no fabric node at {:?}", name);
                Err(Error::Nonexist)
            }
        };

        // Completes through trigger like a real asynchronous lookup.
        self.queue.push(Event::Ready(Box::new(move || cb(resolved))));
        Ok(())
    }

    fn create_handle(&self, addr: &Addr, tag: Tag, id: u32) -> Result<Arc<dyn Handle>> {
        let mem_addr = addr.downcast::<MemAddr>().ok_or_else(|| {
            log::error!("foreign address handed to mem provider");
            Error::Inval
        })?;

        Ok(Arc::new(MemClientHandle {
            dest: Arc::clone(&mem_addr.node),
            tag,
            id,
            origin: Arc::clone(&self.queue),
            slot: Mutex::new(None),
        }))
    }

    fn progress(&self, timeout_ms: u32) -> Result<()> {
        let drained: Vec<Event> = {
            let mut queue = self.queue.inner.lock().unwrap();

            if queue.is_empty() && timeout_ms > 0 {
                let wait = Duration::from_millis(timeout_ms as u64);
                let (guard, _) = self.queue.cv.wait_timeout(queue, wait).unwrap();
                queue = guard;
            }

            if queue.is_empty() {
                return Err(Error::TimedOut);
            }

            queue.drain(..).collect()
        };

        let mut ready = self.ready.lock().unwrap();
        for event in drained {
            ready.push_back(self.make_ready(event));
        }

        Ok(())
    }

    fn trigger(&self, max_count: u32) -> Result<u32> {
        let mut count = 0;

        while count < max_count {
            let next = self.ready.lock().unwrap().pop_front();
            match next {
                Some(callback) => {
                    callback();
                    count += 1;
                }
                None => break,
            }
        }

        Ok(count)
    }

    fn bulk_create(&self, sgl: &SgList, perm: BulkPerm) -> Result<Arc<dyn Bulk>> {
        let segs: Vec<Vec<u8>> = sgl.iovs.iter().cloned().collect();
        let len = sgl.total_len();
        let region = Arc::new(MemRegion {
            segs: Mutex::new(segs),
            perm,
        });

        let id = self.node.region_seq.fetch_add(1, Ordering::Relaxed);
        self.node
            .regions
            .lock()
            .unwrap()
            .insert(id, Arc::clone(&region));

        Ok(Arc::new(MemBulk {
            node: Arc::clone(&self.node),
            region,
            id,
            len,
            nsegs: sgl.iovs.len() as u32,
        }))
    }

    fn bulk_access(&self, bulk: &Arc<dyn Bulk>, sgl: &mut SgList) -> Result<()> {
        let bulk = bulk.as_any().downcast_ref::<MemBulk>().ok_or_else(|| {
            log::error!("foreign bulk handle handed to mem provider");
            Error::Inval
        })?;

        if sgl.num < bulk.nsegs {
            log::debug!("sgl has {} slots, {} required", sgl.num, bulk.nsegs);
            sgl.num_out = bulk.nsegs;
            return Err(Error::Trunc);
        }

        let segs = bulk.region.segs.lock().unwrap();
        sgl.iovs.clear();
        sgl.iovs.extend(segs.iter().cloned());
        sgl.num_out = bulk.nsegs;

        Ok(())
    }

    fn bulk_transfer(&self, desc: BulkDesc, cb: BulkCb) -> Result<u64> {
        let remote_node = self.fabric.node(&desc.remote.origin).ok_or_else(|| {
            log::error!("no fabric node at {:?}", desc.remote.origin);
            Error::Nonexist
        })?;
        let remote = remote_node
            .regions
            .lock()
            .unwrap()
            .get(&desc.remote.region)
            .cloned()
            .ok_or_else(|| {
                log::error!("stale bulk region {} at {:?}", desc.remote.region, desc.remote.origin);
                Error::Nonexist
            })?;

        let local = desc
            .local
            .as_any()
            .downcast_ref::<MemBulk>()
            .ok_or(Error::Inval)?;

        match desc.op {
            BulkOp::Push => {
                if remote.perm != BulkPerm::Rw {
                    log::error!("push into read-only remote region");
                    return Err(Error::NoPerm);
                }
                let data = {
                    let segs = local.region.segs.lock().unwrap();
                    read_range(&segs, desc.local_off, desc.len)?
                };
                let mut segs = remote.segs.lock().unwrap();
                write_range(&mut segs, desc.remote_off, &data)?;
            }
            BulkOp::Pull => {
                if local.region.perm != BulkPerm::Rw {
                    log::error!("pull into read-only local region");
                    return Err(Error::NoPerm);
                }
                let data = {
                    let segs = remote.segs.lock().unwrap();
                    read_range(&segs, desc.remote_off, desc.len)?
                };
                let mut segs = local.region.segs.lock().unwrap();
                write_range(&mut segs, desc.local_off, &data)?;
            }
        }

        let opid = self.opid.fetch_add(1, Ordering::Relaxed);
        self.queue.push(Event::Ready(Box::new(move || {
            cb(BulkCbInfo { desc, rc: 0 });
        })));

        Ok(opid)
    }
}

struct MemClientHandle {
    dest: Arc<MemNode>,
    tag: Tag,
    id: u32,
    origin: Arc<EventQueue>,
    slot: Mutex<Option<Arc<ReplySlot>>>,
}

impl Handle for MemClientHandle {
    fn forward(&self, payload: Bytes, no_reply: bool, cb: ForwardCb) -> Result<()> {
        let dest = self.dest.queue(self.tag).ok_or_else(|| {
            log::error!("no context bound at {:?} tag {}", self.dest.base, self.tag);
            Error::Hg
        })?;

        if no_reply {
            dest.push(Event::Request { id: self.id, payload, reply: None });
            // One-way forwards complete once handed to the wire.
            self.origin.push(Event::Ready(Box::new(move || {
                cb(CbInfo { status: Ok(()), reply: None })
            })));
        } else {
            let slot = Arc::new(ReplySlot {
                state: Mutex::new(SlotState::Waiting(cb)),
                origin: Arc::clone(&self.origin),
            });
            *self.slot.lock().unwrap() = Some(Arc::clone(&slot));
            dest.push(Event::Request { id: self.id, payload, reply: Some(slot) });
        }

        Ok(())
    }

    fn respond(&self, _payload: Bytes, _cb: RespondCb) -> Result<()> {
        Err(Error::Inval)
    }

    fn cancel(&self) -> Result<()> {
        let slot = self.slot.lock().unwrap().clone();
        if let Some(slot) = slot {
            slot.complete(CbInfo {
                status: Err(Error::Canceled),
                reply: None,
            });
        }

        Ok(())
    }

    fn input(&self) -> Result<Bytes> {
        Err(Error::Inval)
    }
}

struct MemServerHandle {
    payload: Bytes,
    reply: Mutex<Option<Arc<ReplySlot>>>,
    queue: Arc<EventQueue>,
}

impl Handle for MemServerHandle {
    fn forward(&self, _payload: Bytes, _no_reply: bool, _cb: ForwardCb) -> Result<()> {
        Err(Error::Inval)
    }

    fn respond(&self, payload: Bytes, cb: RespondCb) -> Result<()> {
        let slot = self.reply.lock().unwrap().take().ok_or_else(|| {
            log::error!("respond on a one-way or already-answered request");
            Error::Inval
        })?;

        if !slot.complete(CbInfo {
            status: Ok(()),
            reply: Some(payload),
        }) {
            log::debug!("reply dropped: peer canceled the request");
        }

        self.queue.push(Event::Ready(Box::new(move || {
            cb(CbInfo { status: Ok(()), reply: None })
        })));

        Ok(())
    }

    fn cancel(&self) -> Result<()> {
        Err(Error::Inval)
    }

    fn input(&self) -> Result<Bytes> {
        Ok(self.payload.clone())
    }
}

struct MemRegion {
    segs: Mutex<Vec<Vec<u8>>>,
    perm: BulkPerm,
}

struct MemBulk {
    node: Arc<MemNode>,
    region: Arc<MemRegion>,
    id: u64,
    len: u64,
    nsegs: u32,
}

impl Bulk for MemBulk {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn wire_ref(&self) -> BulkRef {
        BulkRef {
            origin: self.node.base.clone(),
            region: self.id,
            len: self.len,
        }
    }

    fn seg_count(&self) -> u32 {
        self.nsegs
    }

    fn len(&self) -> u64 {
        self.len
    }
}

impl Drop for MemBulk {
    fn drop(&mut self) {
        self.node.regions.lock().unwrap().remove(&self.id);
    }
}

fn read_range(segs: &[Vec<u8>], off: u64, len: u64) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(len as usize);
    let mut skip = off;
    let mut want = len;

    for seg in segs {
        let seg_len = seg.len() as u64;
        if skip >= seg_len {
            skip -= seg_len;
            continue;
        }

        let take = (seg_len - skip).min(want);
        out.extend_from_slice(&seg[skip as usize..(skip + take) as usize]);
        skip = 0;
        want -= take;
        if want == 0 {
            break;
        }
    }

    if want > 0 {
        log::error!("bulk range [{} + {}] beyond region end", off, len);
        return Err(Error::Inval);
    }

    Ok(out)
}

fn write_range(segs: &mut [Vec<u8>], off: u64, data: &[u8]) -> Result<()> {
    let mut skip = off;
    let mut src = data;

    for seg in segs.iter_mut() {
        let seg_len = seg.len() as u64;
        if skip >= seg_len {
            skip -= seg_len;
            continue;
        }

        let take = ((seg_len - skip) as usize).min(src.len());
        seg[skip as usize..skip as usize + take].copy_from_slice(&src[..take]);
        skip = 0;
        src = &src[take..];
        if src.is_empty() {
            return Ok(());
        }
    }

    if !src.is_empty() {
        log::error!("bulk write [{} + {}] beyond region end", off, data.len());
        return Err(Error::Inval);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{addr_lookup_wait, ProviderRegistry};

    fn class_pair() -> (Arc<dyn Class>, Arc<dyn Class>, Arc<MemFabric>) {
        let fabric = MemFabric::new();
        let registry = ProviderRegistry::new();
        registry.register("mem", fabric.factory()).unwrap();

        let a = registry.class_init("mem://a", true).unwrap();
        let b = registry.class_init("mem://b", true).unwrap();
        (a, b, fabric)
    }

    fn drive(ctx: &Arc<dyn Ctx>) {
        let _ = ctx.progress(0);
        ctx.trigger(u32::MAX).unwrap();
    }

    #[test]
    fn request_reply_round_trip() {
        let (a, b, _fabric) = class_pair();
        let actx = a.create_context(0).unwrap();
        let bctx = b.create_context(0).unwrap();

        // Echo dispatcher on b.
        bctx.set_rpc_handler(7, Arc::new(|handle| {
            let input = handle.input().unwrap();
            handle
                .respond(input, Box::new(|info| assert!(info.status.is_ok())))
                .unwrap();
        }));

        let addr = addr_lookup_wait(actx.as_ref(), "mem://b", 0).unwrap();
        let handle = actx.create_handle(&addr, 0, 7).unwrap();

        let got: Arc<Mutex<Option<Bytes>>> = Arc::new(Mutex::new(None));
        let cb_got = Arc::clone(&got);
        handle
            .forward(
                Bytes::from_static(b"ping"),
                false,
                Box::new(move |info| {
                    info.status.unwrap();
                    *cb_got.lock().unwrap() = info.reply;
                }),
            )
            .unwrap();

        drive(&bctx);
        drive(&actx);

        assert_eq!(got.lock().unwrap().as_deref(), Some(&b"ping"[..]));
    }

    #[test]
    fn cancel_completes_with_canceled() {
        let (a, b, _fabric) = class_pair();
        let actx = a.create_context(0).unwrap();
        let _bctx = b.create_context(0).unwrap();

        let addr = addr_lookup_wait(actx.as_ref(), "mem://b", 0).unwrap();
        let handle = actx.create_handle(&addr, 0, 7).unwrap();

        let status = Arc::new(Mutex::new(None));
        let cb_status = Arc::clone(&status);
        handle
            .forward(
                Bytes::from_static(b"x"),
                false,
                Box::new(move |info| {
                    *cb_status.lock().unwrap() = Some(info.status);
                }),
            )
            .unwrap();

        handle.cancel().unwrap();
        drive(&actx);

        assert_eq!(*status.lock().unwrap(), Some(Err(Error::Canceled)));
    }

    #[test]
    fn lookup_of_missing_node_fails() {
        let (a, _b, _fabric) = class_pair();
        let actx = a.create_context(0).unwrap();

        assert_eq!(
            addr_lookup_wait(actx.as_ref(), "mem://ghost", 3).unwrap_err(),
            Error::Nonexist
        );
    }

    #[test]
    fn bulk_access_recovers_ten_segments() {
        let (a, _b, _fabric) = class_pair();
        let actx = a.create_context(0).unwrap();

        let segments: Vec<Vec<u8>> = (0..10u8).map(|i| vec![i; (i as usize) + 1]).collect();
        let bulk = actx
            .bulk_create(&SgList::of(segments.clone()), BulkPerm::Rw)
            .unwrap();

        // Too few declared slots reports the required count.
        let mut small = SgList::with_capacity(2);
        assert_eq!(actx.bulk_access(&bulk, &mut small), Err(Error::Trunc));
        assert_eq!(small.num_out, 10);

        let mut sgl = SgList::with_capacity(10);
        actx.bulk_access(&bulk, &mut sgl).unwrap();
        assert_eq!(sgl.num_out, 10);
        assert_eq!(sgl.iovs.as_slice(), segments.as_slice());
    }

    #[test]
    fn bulk_push_and_pull_move_bytes() {
        let (a, b, _fabric) = class_pair();
        let actx = a.create_context(0).unwrap();
        let bctx = b.create_context(0).unwrap();

        let local = actx
            .bulk_create(&SgList::of(vec![b"abcdef".to_vec()]), BulkPerm::Rw)
            .unwrap();
        let remote = bctx
            .bulk_create(&SgList::of(vec![vec![0u8; 3], vec![0u8; 3]]), BulkPerm::Rw)
            .unwrap();

        let done = Arc::new(Mutex::new(false));
        let cb_done = Arc::clone(&done);
        actx.bulk_transfer(
            BulkDesc {
                op: BulkOp::Push,
                remote: remote.wire_ref(),
                remote_off: 1,
                local: Arc::clone(&local),
                local_off: 2,
                len: 4,
            },
            Box::new(move |info| {
                assert_eq!(info.rc, 0);
                *cb_done.lock().unwrap() = true;
            }),
        )
        .unwrap();

        drive(&actx);
        assert!(*done.lock().unwrap());

        let mut sgl = SgList::with_capacity(2);
        bctx.bulk_access(&remote, &mut sgl).unwrap();
        assert_eq!(sgl.iovs[0], vec![0, b'c', b'd']);
        assert_eq!(sgl.iovs[1], vec![b'e', b'f', 0]);

        // Pull the edit back into a fresh local region.
        let scratch = actx
            .bulk_create(&SgList::of(vec![vec![0u8; 4]]), BulkPerm::Rw)
            .unwrap();
        actx.bulk_transfer(
            BulkDesc {
                op: BulkOp::Pull,
                remote: remote.wire_ref(),
                remote_off: 1,
                local: Arc::clone(&scratch),
                local_off: 0,
                len: 4,
            },
            Box::new(|info| assert_eq!(info.rc, 0)),
        )
        .unwrap();
        drive(&actx);

        let mut sgl = SgList::with_capacity(1);
        actx.bulk_access(&scratch, &mut sgl).unwrap();
        assert_eq!(sgl.iovs[0], b"cdef".to_vec());
    }
}
