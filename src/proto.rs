//! Wire codec: the common header every request and reply starts with, and
//! the descriptor-driven body format shared by all registered opcodes.

use bitflags::bitflags;
use bytemuck::{bytes_of, cast_slice, pod_collect_to_vec, pod_read_unaligned};
use bytemuck_derive::{Pod, Zeroable};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::{transport::BulkRef, tree::TreeTopo, Error, Opcode, Rank, Result};

pub const MAGIC: u32 = 0x7eec_a570;
pub const VERSION: u32 = 1;

/// Upper bound of a group identifier, including the terminating zero of its
/// fixed wire slot.
pub const GRP_ID_MAX: usize = 64;

/// Registered formats may not exceed these wire footprints (sum of the
/// per-field base sizes).
pub const MAX_INPUT_SIZE: usize = 1024;
pub const MAX_OUTPUT_SIZE: usize = 1024;

/// The single transport-level message identifier. Every application RPC
/// travels under this id; the application opcode lives in the common header.
pub const RPC_ID: u32 = 0xc0de;

/// Opcodes keep a registration version in their high bits.
pub const OPC_VERSION_SHIFT: u32 = 24;

pub fn opc_make(version: u32, code: u32) -> Opcode {
    (version << OPC_VERSION_SHIFT) | (code & ((1 << OPC_VERSION_SHIFT) - 1))
}

bitflags! {
    pub struct HeaderFlags: u32 {
        /// Collective request: a collective section follows the header.
        const COLL     = 1 << 0;
        /// Forwarded leg of a collective fan-out.
        const FORWARD  = 1 << 1;
        /// One-way request, no reply will be sent.
        const NO_REPLY = 1 << 2;
    }
}

#[derive(Pod, Zeroable, Copy, Clone)]
#[repr(C)]
struct RawHeader {
    magic: u32,
    version: u32,
    opc: u32,
    flags: u32,
    rank: u32,
    rc: i32,
    cookie: u64,
    grp_id: [u8; GRP_ID_MAX],
}

pub const HEADER_SIZE: usize = std::mem::size_of::<RawHeader>();

/// Decoded common header. Requests carry `rc = 0`; replies echo the cookie
/// and report the server-side outcome in `rc`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub opc: Opcode,
    pub flags: HeaderFlags,
    pub rank: Rank,
    pub grp_id: String,
    pub cookie: u64,
    pub rc: i32,
}

impl Header {
    pub fn request(opc: Opcode, rank: Rank, grp_id: &str, cookie: u64) -> Header {
        Header {
            opc,
            flags: HeaderFlags::empty(),
            rank,
            grp_id: grp_id.to_owned(),
            cookie,
            rc: 0,
        }
    }

    /// Reply header for a received request: same opcode and cookie, the
    /// responder's rank, and the outcome code.
    pub fn reply_to(&self, rank: Rank, rc: i32) -> Header {
        Header {
            opc: self.opc,
            flags: HeaderFlags::empty(),
            rank,
            grp_id: self.grp_id.clone(),
            cookie: self.cookie,
            rc,
        }
    }

    pub fn pack(&self, buf: &mut BytesMut) -> Result<()> {
        if self.grp_id.len() >= GRP_ID_MAX {
            log::error!("group id {:?} exceeds {} bytes", self.grp_id, GRP_ID_MAX - 1);
            return Err(Error::Inval);
        }

        let mut grp_id = [0u8; GRP_ID_MAX];
        grp_id[..self.grp_id.len()].copy_from_slice(self.grp_id.as_bytes());

        let raw = RawHeader {
            magic: MAGIC,
            version: VERSION,
            opc: self.opc,
            flags: self.flags.bits(),
            rank: self.rank,
            rc: self.rc,
            cookie: self.cookie,
            grp_id,
        };

        buf.put_slice(bytes_of(&raw));
        Ok(())
    }

    /// Decode a header off the front of `buf`, advancing past it. Magic or
    /// version mismatch is a protocol error, as is a malformed group id.
    pub fn unpack(buf: &mut Bytes) -> Result<Header> {
        if buf.remaining() < HEADER_SIZE {
            log::error!("short header: {} of {} bytes", buf.remaining(), HEADER_SIZE);
            return Err(Error::Proto);
        }

        let raw: RawHeader = pod_read_unaligned(&buf[..HEADER_SIZE]);
        buf.advance(HEADER_SIZE);

        if raw.magic != MAGIC || raw.version != VERSION {
            log::error!(
                "bad header magic {:#x}/version {} (want {:#x}/{})",
                raw.magic,
                raw.version,
                MAGIC,
                VERSION
            );
            return Err(Error::Proto);
        }

        let nul = raw.grp_id.iter().position(|b| *b == 0).ok_or_else(|| {
            log::error!("group id missing terminator");
            Error::Proto
        })?;
        let grp_id = std::str::from_utf8(&raw.grp_id[..nul])
            .map_err(|_| Error::Proto)?
            .to_owned();

        Ok(Header {
            opc: raw.opc,
            flags: HeaderFlags::from_bits_truncate(raw.flags),
            rank: raw.rank,
            grp_id,
            cookie: raw.cookie,
            rc: raw.rc,
        })
    }
}

impl fmt::Display for Header {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            fmt,
            "<{:#x}> #{} rank={} grp={:?} flags={:#x} rc={}",
            self.opc,
            self.cookie,
            self.rank,
            self.grp_id,
            self.flags.bits(),
            self.rc
        )
    }
}

#[derive(Pod, Zeroable, Copy, Clone)]
#[repr(C)]
struct RawCollective {
    root: u32,
    tree_topo: u32,
    grp_ver: u32,
    n_excluded: u32,
}

const COLLECTIVE_FIXED: usize = std::mem::size_of::<RawCollective>();

/// Collective section, present right after the header when `COLL` is set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectiveHdr {
    pub root: Rank,
    pub topo: TreeTopo,
    pub grp_ver: u32,
    pub excluded: Vec<Rank>,
}

impl CollectiveHdr {
    pub fn pack(&self, buf: &mut BytesMut) {
        let raw = RawCollective {
            root: self.root,
            tree_topo: self.topo.raw(),
            grp_ver: self.grp_ver,
            n_excluded: self.excluded.len() as u32,
        };

        buf.put_slice(bytes_of(&raw));
        buf.put_slice(cast_slice(&self.excluded));
    }

    pub fn unpack(buf: &mut Bytes) -> Result<CollectiveHdr> {
        if buf.remaining() < COLLECTIVE_FIXED {
            log::error!("short collective section");
            return Err(Error::Proto);
        }

        let raw: RawCollective = pod_read_unaligned(&buf[..COLLECTIVE_FIXED]);
        buf.advance(COLLECTIVE_FIXED);

        let bytes = raw.n_excluded as usize * std::mem::size_of::<Rank>();
        if buf.remaining() < bytes {
            log::error!("collective section truncated excluded-rank list");
            return Err(Error::Proto);
        }
        let excluded: Vec<Rank> = pod_collect_to_vec(&buf[..bytes]);
        buf.advance(bytes);

        Ok(CollectiveHdr {
            root: raw.root,
            topo: TreeTopo::from_raw(raw.tree_topo)?,
            grp_ver: raw.grp_ver,
            excluded,
        })
    }
}

/// Typed field descriptor. A registered format is an ordered list of these;
/// the codec walks the list, so every wire type is defined exactly once.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FieldKind {
    U32,
    U64,
    I32,
    /// Length-prefixed string bounded to `max` bytes.
    Str(usize),
    RankList,
    Bulk,
}

impl FieldKind {
    /// Fixed wire footprint of the field, not counting variable payload.
    pub fn base_size(&self) -> usize {
        match self {
            FieldKind::U32 | FieldKind::I32 => 4,
            FieldKind::U64 => 8,
            FieldKind::Str(_) => 4,
            FieldKind::RankList => 4,
            FieldKind::Bulk => 20,
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct FieldDef {
    pub name: &'static str,
    pub kind: FieldKind,
}

#[derive(Copy, Clone, Debug)]
pub struct ReqFormat {
    pub name: &'static str,
    pub input: &'static [FieldDef],
    pub output: &'static [FieldDef],
}

impl ReqFormat {
    pub fn input_size(&self) -> usize {
        self.input.iter().map(|f| f.kind.base_size()).sum()
    }

    pub fn output_size(&self) -> usize {
        self.output.iter().map(|f| f.kind.base_size()).sum()
    }
}

/// A decoded field value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    U32(u32),
    U64(u64),
    I32(i32),
    Str(String),
    RankList(Vec<Rank>),
    Bulk(BulkRef),
}

impl Value {
    pub fn kind_matches(&self, kind: FieldKind) -> bool {
        matches!(
            (self, kind),
            (Value::U32(_), FieldKind::U32)
                | (Value::U64(_), FieldKind::U64)
                | (Value::I32(_), FieldKind::I32)
                | (Value::Str(_), FieldKind::Str(_))
                | (Value::RankList(_), FieldKind::RankList)
                | (Value::Bulk(_), FieldKind::Bulk)
        )
    }

    pub fn zero_of(kind: FieldKind) -> Value {
        match kind {
            FieldKind::U32 => Value::U32(0),
            FieldKind::U64 => Value::U64(0),
            FieldKind::I32 => Value::I32(0),
            FieldKind::Str(_) => Value::Str(String::new()),
            FieldKind::RankList => Value::RankList(Vec::new()),
            FieldKind::Bulk => Value::Bulk(BulkRef::default()),
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::U32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_rank_list(&self) -> Option<&[Rank]> {
        match self {
            Value::RankList(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bulk(&self) -> Option<&BulkRef> {
        match self {
            Value::Bulk(v) => Some(v),
            _ => None,
        }
    }
}

/// Zero value for every field of a format, the accumulator collectives
/// aggregate into before any handler has run.
pub fn zero_values(fields: &[FieldDef]) -> Vec<Value> {
    fields.iter().map(|f| Value::zero_of(f.kind)).collect()
}

/// Pack `values` against `fields`. Arity or type mismatch is the caller's
/// bug and fails with `Inval`; callers discard the buffer on error.
pub fn pack_body(fields: &[FieldDef], values: &[Value], buf: &mut BytesMut) -> Result<()> {
    if fields.len() != values.len() {
        log::error!(
            "body arity mismatch: {} fields, {} values",
            fields.len(),
            values.len()
        );
        return Err(Error::Inval);
    }

    for (field, value) in fields.iter().zip(values) {
        if !value.kind_matches(field.kind) {
            log::error!("field {:?} type mismatch: got {:?}", field.name, value);
            return Err(Error::Inval);
        }

        match value {
            Value::U32(v) => buf.put_u32_le(*v),
            Value::U64(v) => buf.put_u64_le(*v),
            Value::I32(v) => buf.put_i32_le(*v),
            Value::Str(v) => {
                let max = match field.kind {
                    FieldKind::Str(max) => max,
                    _ => unreachable!(),
                };
                if v.len() > max {
                    log::error!("field {:?} string exceeds {} bytes", field.name, max);
                    return Err(Error::Inval);
                }
                buf.put_u32_le(v.len() as u32);
                buf.put_slice(v.as_bytes());
            }
            Value::RankList(v) => {
                buf.put_u32_le(v.len() as u32);
                buf.put_slice(cast_slice(v));
            }
            Value::Bulk(v) => {
                buf.put_u32_le(v.origin.len() as u32);
                buf.put_slice(v.origin.as_bytes());
                buf.put_u64_le(v.region);
                buf.put_u64_le(v.len);
            }
        }
    }

    Ok(())
}

/// Unpack a body against `fields`, advancing the cursor. Unpacking may
/// allocate; everything it allocates is owned by the returned values and
/// released when they drop.
pub fn unpack_body(fields: &[FieldDef], buf: &mut Bytes) -> Result<Vec<Value>> {
    let mut values = Vec::with_capacity(fields.len());

    for field in fields {
        let value = match field.kind {
            FieldKind::U32 => Value::U32(get_u32(buf)?),
            FieldKind::U64 => Value::U64(get_u64(buf)?),
            FieldKind::I32 => Value::I32(get_u32(buf)? as i32),
            FieldKind::Str(max) => Value::Str(get_string(buf, max)?),
            FieldKind::RankList => {
                let count = get_u32(buf)? as usize;
                let bytes = count * std::mem::size_of::<Rank>();
                if buf.remaining() < bytes {
                    log::error!("field {:?} truncated rank list", field.name);
                    return Err(Error::Proto);
                }
                let ranks = pod_collect_to_vec(&buf[..bytes]);
                buf.advance(bytes);
                Value::RankList(ranks)
            }
            FieldKind::Bulk => {
                let origin = get_string(buf, crate::transport::ADDR_STR_MAX_LEN)?;
                let region = get_u64(buf)?;
                let len = get_u64(buf)?;
                Value::Bulk(BulkRef { origin, region, len })
            }
        };

        values.push(value);
    }

    Ok(values)
}

fn get_u32(buf: &mut Bytes) -> Result<u32> {
    if buf.remaining() < 4 {
        log::error!("body truncated");
        return Err(Error::Proto);
    }
    Ok(buf.get_u32_le())
}

fn get_u64(buf: &mut Bytes) -> Result<u64> {
    if buf.remaining() < 8 {
        log::error!("body truncated");
        return Err(Error::Proto);
    }
    Ok(buf.get_u64_le())
}

fn get_string(buf: &mut Bytes, max: usize) -> Result<String> {
    let len = get_u32(buf)? as usize;
    if len > max {
        log::error!("string length {} exceeds bound {}", len, max);
        return Err(Error::Proto);
    }
    if buf.remaining() < len {
        log::error!("body truncated inside string");
        return Err(Error::Proto);
    }

    let s = std::str::from_utf8(&buf[..len])
        .map_err(|_| Error::Proto)?
        .to_owned();
    buf.advance(len);
    Ok(s)
}
