//! Collective and point-to-point RPC runtime for HPC-style services:
//! opcode-indexed request/response with zero-copy tree fan-out over a
//! pluggable transport, driven by a cooperative progress loop.
//!
//! `treecast`

#![forbid(unsafe_code)]

pub use crate::{
    context::{Config, Context, Runtime, TaskPool, DEFAULT_TIMEOUT_US, MAX_INFLIGHT},
    corpc::{AggregateFn, CorpcOps, PreForwardFn},
    error::{Error, Result},
    group::{Group, GroupTable},
    proto::{
        FieldDef, FieldKind, Header, HeaderFlags, ReqFormat, Value, GRP_ID_MAX, MAX_INPUT_SIZE,
        MAX_OUTPUT_SIZE,
    },
    registry::{OpcInfo, OpcMap, OPC_GRP_CREATE, OPC_GRP_DESTROY, OPC_URI_LOOKUP},
    rpc::{CompleteCb, CompletionInfo, Endpoint, Rpc, RpcHandler, RpcState},
    tree::{TreeTopo, TreeType},
};

/// Rank within a group. Every rank on the wire is relative to the local
/// primary group.
pub type Rank = u32;

/// Operation identifier; the high bits carry a registration version (see
/// [`proto::opc_make`]).
pub type Opcode = u32;

pub mod context;
pub mod corpc;
pub mod error;
pub mod group;
pub mod proto;
pub mod registry;
pub mod rpc;
pub mod transport;
pub mod tree;

mod util;
