//! Boundary to the network-abstraction layer. The runtime only ever talks
//! to the traits in this module; concrete providers (the in-process
//! [`mem`] fabric here, external tcp/verbs plugins elsewhere) register
//! factories keyed by the provider part of an info string.

use bytes::Bytes;
use smallvec::SmallVec;
use std::{
    any::Any,
    collections::HashMap,
    sync::{Arc, Mutex},
};

use crate::{
    util::{deadline_us, hostname, monotonic_us},
    Error, Rank, Result,
};

pub mod mem;

/// Self/peer address strings never exceed this.
pub const ADDR_STR_MAX_LEN: usize = 256;

/// Inline slots of a scatter-gather list before it spills to the heap.
pub const SGL_STACK: usize = 8;

/// Wall-clock budget of a bounded address lookup.
pub const CONNECT_TIMEOUT_US: u64 = 10_000_000;

const LOOKUP_BACKOFF_CAP_MS: u32 = 512;

/// Destination tag: selects the remote context a message lands on.
pub type Tag = u32;

/// Opaque resolved peer address, owned by the provider.
#[derive(Clone)]
pub struct Addr(Arc<dyn Any + Send + Sync>);

impl std::fmt::Debug for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Addr").finish()
    }
}

impl Addr {
    pub fn new<T: Any + Send + Sync>(inner: T) -> Addr {
        Addr(Arc::new(inner))
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.0).downcast().ok()
    }
}

/// Outcome handed to forward/respond completion callbacks.
pub struct CbInfo {
    pub status: Result<()>,
    /// Reply payload, present on a successfully completed two-way forward.
    pub reply: Option<Bytes>,
}

pub type LookupCb = Box<dyn FnOnce(Result<Addr>) + Send>;
pub type ForwardCb = Box<dyn FnOnce(CbInfo) + Send>;
pub type RespondCb = Box<dyn FnOnce(CbInfo) + Send>;
pub type BulkCb = Box<dyn FnOnce(BulkCbInfo) + Send>;

/// Invoked from `trigger` for every incoming request; the handle gives the
/// request payload and the reply path.
pub type IncomingHandler = Arc<dyn Fn(Arc<dyn Handle>) + Send + Sync>;

pub trait Class: Send + Sync {
    /// Listen address of this class, bounded by [`ADDR_STR_MAX_LEN`].
    fn self_addr(&self) -> Result<String>;

    fn create_context(&self, tag: Tag) -> Result<Arc<dyn Ctx>>;
}

pub trait Ctx: Send + Sync {
    /// Bind the dispatcher for the transport-level message id. Re-bound per
    /// context so completions and incoming requests route to the context
    /// being progressed; every context binds the same id.
    fn set_rpc_handler(&self, id: u32, handler: IncomingHandler);

    /// Start an asynchronous address lookup; the callback fires from a
    /// later `trigger`.
    fn addr_lookup(&self, name: &str, cb: LookupCb) -> Result<()>;

    /// Handle towards a peer for one exchange under message id `id`.
    fn create_handle(&self, addr: &Addr, tag: Tag, id: u32) -> Result<Arc<dyn Handle>>;

    /// Block up to `timeout_ms` for network activity. `0` polls without
    /// blocking; `u32::MAX` waits until something happens. `TimedOut` means
    /// nothing arrived, not failure.
    fn progress(&self, timeout_ms: u32) -> Result<()>;

    /// Run up to `max_count` ready callbacks, returning how many ran.
    fn trigger(&self, max_count: u32) -> Result<u32>;

    fn bulk_create(&self, sgl: &SgList, perm: BulkPerm) -> Result<Arc<dyn Bulk>>;

    fn bulk_access(&self, bulk: &Arc<dyn Bulk>, sgl: &mut SgList) -> Result<()>;

    /// One-sided transfer between a local bulk handle and a remote wire
    /// reference. The descriptor is owned by the completion callback.
    fn bulk_transfer(&self, desc: BulkDesc, cb: BulkCb) -> Result<u64>;
}

pub trait Handle: Send + Sync {
    fn forward(&self, payload: Bytes, no_reply: bool, cb: ForwardCb) -> Result<()>;

    fn respond(&self, payload: Bytes, cb: RespondCb) -> Result<()>;

    /// Best-effort: the forward completion will report `Canceled` if the
    /// cancel won.
    fn cancel(&self) -> Result<()>;

    /// Server side: the request payload.
    fn input(&self) -> Result<Bytes>;
}

pub trait Bulk: Send + Sync {
    fn as_any(&self) -> &dyn Any;

    /// Compact reference that crosses the wire inside a body field.
    fn wire_ref(&self) -> BulkRef;

    fn seg_count(&self) -> u32;

    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BulkPerm {
    Rw,
    Ro,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BulkOp {
    Push,
    Pull,
}

/// Wire form of a registered memory region: where it lives and how to find
/// it there.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BulkRef {
    pub origin: String,
    pub region: u64,
    pub len: u64,
}

pub struct BulkDesc {
    pub op: BulkOp,
    pub remote: BulkRef,
    pub remote_off: u64,
    pub local: Arc<dyn Bulk>,
    pub local_off: u64,
    pub len: u64,
}

pub struct BulkCbInfo {
    pub desc: BulkDesc,
    pub rc: i32,
}

/// Scatter-gather list. `num` is the slot count the caller declared,
/// `num_out` what the last access actually produced; the inline array
/// covers the common small case.
pub struct SgList {
    pub iovs: SmallVec<[Vec<u8>; SGL_STACK]>,
    pub num: u32,
    pub num_out: u32,
}

impl SgList {
    pub fn of(segments: impl IntoIterator<Item = Vec<u8>>) -> SgList {
        let iovs: SmallVec<[Vec<u8>; SGL_STACK]> = segments.into_iter().collect();
        let num = iovs.len() as u32;

        SgList { iovs, num, num_out: 0 }
    }

    /// Empty list declaring `num` slots, for recovery via `bulk_access`.
    pub fn with_capacity(num: u32) -> SgList {
        SgList {
            iovs: SmallVec::new(),
            num,
            num_out: 0,
        }
    }

    pub fn total_len(&self) -> u64 {
        self.iovs.iter().map(|iov| iov.len() as u64).sum()
    }
}

/// `<provider>+<protocol>://<authority>` info string. `bmi+tcp` appears
/// without the separator and is consumed verbatim.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InfoString {
    pub provider: String,
    pub protocol: Option<String>,
    pub authority: String,
}

pub fn parse_info(info: &str) -> Result<InfoString> {
    let (scheme, authority) = match info.split_once("://") {
        Some((scheme, authority)) => (scheme, authority),
        None if info.starts_with("bmi+tcp") => (info, ""),
        None => {
            log::error!("malformed info string {:?}", info);
            return Err(Error::Inval);
        }
    };

    let (provider, protocol) = match scheme.split_once('+') {
        Some((provider, protocol)) => (provider, Some(protocol.to_owned())),
        None => (scheme, None),
    };

    if provider.is_empty() {
        log::error!("info string {:?} has no provider", info);
        return Err(Error::Inval);
    }

    Ok(InfoString {
        provider: provider.to_owned(),
        protocol,
        authority: authority.to_owned(),
    })
}

pub type ClassFactory = Arc<dyn Fn(&InfoString, bool) -> Result<Arc<dyn Class>> + Send + Sync>;

/// Provider name to class factory. Cloning shares the registrations.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    factories: Arc<Mutex<HashMap<String, ClassFactory>>>,
}

impl ProviderRegistry {
    pub fn new() -> ProviderRegistry {
        ProviderRegistry::default()
    }

    pub fn register(&self, provider: &str, factory: ClassFactory) -> Result<()> {
        let mut factories = self.factories.lock().unwrap();
        if factories.contains_key(provider) {
            log::error!("provider {:?} already registered", provider);
            return Err(Error::Already);
        }

        factories.insert(provider.to_owned(), factory);
        Ok(())
    }

    /// Resolve an info string to an initialized class.
    pub fn class_init(&self, info: &str, server: bool) -> Result<Arc<dyn Class>> {
        let parsed = parse_info(info)?;

        let factory = {
            let factories = self.factories.lock().unwrap();
            match factories.get(&parsed.provider) {
                Some(factory) => Arc::clone(factory),
                None => {
                    log::error!("no transport provider {:?}", parsed.provider);
                    return Err(Error::Nonexist);
                }
            }
        };

        let class = factory(&parsed, server)?;

        let addr = class.self_addr()?;
        if addr.len() > ADDR_STR_MAX_LEN {
            log::error!("self address {:?} exceeds {} bytes", addr, ADDR_STR_MAX_LEN);
            return Err(Error::Hg);
        }

        Ok(class)
    }
}

/// Synchronous address resolution on top of the asynchronous lookup:
/// alternate trigger and progress with an exponentially doubling wait until
/// the callback lands or the connect budget runs out.
pub fn addr_lookup_wait(ctx: &dyn Ctx, name: &str, self_rank: Rank) -> Result<Addr> {
    let slot: Arc<Mutex<Option<Result<Addr>>>> = Arc::new(Mutex::new(None));

    let cb_slot = Arc::clone(&slot);
    ctx.addr_lookup(
        name,
        Box::new(move |resolved| {
            *cb_slot.lock().unwrap() = Some(resolved);
        }),
    )?;

    let end = deadline_us(CONNECT_TIMEOUT_US);
    let mut prog_ms: u32 = 1;

    loop {
        while ctx.trigger(1)? > 0 {}

        if let Some(resolved) = slot.lock().unwrap().take() {
            return resolved;
        }

        match ctx.progress(prog_ms) {
            Ok(()) | Err(Error::TimedOut) => {}
            Err(err) => {
                log::error!("progress failed during lookup of {:?}: {}", name, err);
                return Err(Error::Hg);
            }
        }

        if monotonic_us() >= end {
            log::error!(
                "could not connect to {:?} within {} s (rank {}, host {})",
                name,
                CONNECT_TIMEOUT_US / 1_000_000,
                self_rank,
                hostname()
            );
            return Err(Error::TimedOut);
        }

        if prog_ms <= LOOKUP_BACKOFF_CAP_MS {
            prog_ms <<= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_string_forms() {
        assert_eq!(
            parse_info("cci+tcp://").unwrap(),
            InfoString {
                provider: "cci".into(),
                protocol: Some("tcp".into()),
                authority: String::new(),
            }
        );

        assert_eq!(
            parse_info("cci+verbs://host:7777").unwrap(),
            InfoString {
                provider: "cci".into(),
                protocol: Some("verbs".into()),
                authority: "host:7777".into(),
            }
        );

        // Verbatim passthrough form.
        assert_eq!(
            parse_info("bmi+tcp").unwrap(),
            InfoString {
                provider: "bmi".into(),
                protocol: Some("tcp".into()),
                authority: String::new(),
            }
        );

        assert_eq!(
            parse_info("mem://alpha").unwrap(),
            InfoString {
                provider: "mem".into(),
                protocol: None,
                authority: "alpha".into(),
            }
        );

        assert_eq!(parse_info("nonsense"), Err(Error::Inval));
        assert_eq!(parse_info("+tcp://"), Err(Error::Inval));
    }

    #[test]
    fn registry_rejects_duplicates() {
        let registry = ProviderRegistry::new();
        let factory: ClassFactory = Arc::new(|_, _| Err(Error::Misc));

        registry.register("x", Arc::clone(&factory)).unwrap();
        assert_eq!(registry.register("x", factory), Err(Error::Already));
    }

    #[test]
    fn unknown_provider_is_nonexist() {
        let registry = ProviderRegistry::new();
        assert!(matches!(
            registry.class_init("cci+tcp://", true),
            Err(Error::Nonexist)
        ));
    }

    #[test]
    fn sgl_construction() {
        let sgl = SgList::of(vec![vec![1, 2, 3], vec![4]]);
        assert_eq!(sgl.num, 2);
        assert_eq!(sgl.num_out, 0);
        assert_eq!(sgl.total_len(), 4);

        let empty = SgList::with_capacity(10);
        assert_eq!(empty.num, 10);
        assert!(empty.iovs.is_empty());
    }
}
