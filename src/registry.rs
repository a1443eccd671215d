//! Opcode registry: opcode to format, handler and collective ops. Written
//! once during registration, read on every dispatch.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use crate::{
    corpc::CorpcOps,
    proto::{ReqFormat, MAX_INPUT_SIZE, MAX_OUTPUT_SIZE},
    rpc::RpcHandler,
    Error, Opcode, Result,
};

/// Opcodes above this bound are reserved for the runtime itself.
pub const OPC_INTERNAL_BASE: Opcode = 0xffff_0000;

pub const OPC_GRP_CREATE: Opcode = OPC_INTERNAL_BASE | 1;
pub const OPC_GRP_DESTROY: Opcode = OPC_INTERNAL_BASE | 2;
pub const OPC_URI_LOOKUP: Opcode = OPC_INTERNAL_BASE | 3;

/// Immutable after registration.
pub struct OpcInfo {
    pub opc: Opcode,
    pub fmt: &'static ReqFormat,
    pub input_size: usize,
    pub output_size: usize,
    pub handler: Option<RpcHandler>,
    pub co_ops: Option<CorpcOps>,
    pub no_reply: bool,
}

pub struct OpcMap {
    map: RwLock<HashMap<Opcode, Arc<OpcInfo>>>,
}

impl OpcMap {
    /// Capacity is `1 << bits`.
    pub fn new(bits: u32) -> OpcMap {
        OpcMap {
            map: RwLock::new(HashMap::with_capacity(1usize << bits)),
        }
    }

    pub fn register(
        &self,
        opc: Opcode,
        fmt: &'static ReqFormat,
        handler: Option<RpcHandler>,
        co_ops: Option<CorpcOps>,
        no_reply: bool,
    ) -> Result<()> {
        let input_size = fmt.input_size();
        let output_size = fmt.output_size();

        if input_size > MAX_INPUT_SIZE || output_size > MAX_OUTPUT_SIZE {
            log::error!(
                "format {:?} too large: in {} (max {}), out {} (max {})",
                fmt.name,
                input_size,
                MAX_INPUT_SIZE,
                output_size,
                MAX_OUTPUT_SIZE
            );
            return Err(Error::Inval);
        }

        let info = Arc::new(OpcInfo {
            opc,
            fmt,
            input_size,
            output_size,
            handler,
            co_ops,
            no_reply,
        });

        let mut map = self.map.write().unwrap();
        if map.contains_key(&opc) {
            log::error!("opcode {:#x} already registered", opc);
            return Err(Error::Exist);
        }

        map.insert(opc, info);
        log::debug!("registered opcode {:#x} ({})", opc, fmt.name);
        Ok(())
    }

    pub fn lookup(&self, opc: Opcode) -> Option<Arc<OpcInfo>> {
        self.map.read().unwrap().get(&opc).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{FieldDef, FieldKind};

    static ECHO_FMT: ReqFormat = ReqFormat {
        name: "echo",
        input: &[FieldDef { name: "payload", kind: FieldKind::U64 }],
        output: &[FieldDef { name: "payload", kind: FieldKind::U64 }],
    };

    static WIDE_FMT: ReqFormat = ReqFormat {
        name: "wide",
        input: &[FieldDef { name: "f", kind: FieldKind::U64 }; 130],
        output: &[],
    };

    #[test]
    fn register_once_then_exist() {
        let map = OpcMap::new(4);

        map.register(0x100, &ECHO_FMT, None, None, false).unwrap();
        assert_eq!(
            map.register(0x100, &ECHO_FMT, None, None, false),
            Err(Error::Exist)
        );

        let info = map.lookup(0x100).unwrap();
        assert_eq!(info.opc, 0x100);
        assert_eq!(info.input_size, 8);
        assert_eq!(info.output_size, 8);
    }

    #[test]
    fn oversized_format_rejected() {
        let map = OpcMap::new(4);
        assert_eq!(
            map.register(0x200, &WIDE_FMT, None, None, false),
            Err(Error::Inval)
        );
    }

    #[test]
    fn lookup_miss() {
        let map = OpcMap::new(4);
        assert!(map.lookup(0x999).is_none());
    }
}
