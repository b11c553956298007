//! Typed, big-endian wire structs shared by the checkpoint and RDMA control
//! protocols. Every struct here derives `FromBytes`/`AsBytes` so the
//! `caps <-> network` and `block <-> network` round trip is one generic
//! helper rather than one hand-rolled encoder per struct.

use zerocopy::byteorder::{U32, U64};
use zerocopy::{AsBytes, BigEndian, FromBytes, FromZeroes};

pub type Be32 = U32<BigEndian>;
pub type Be64 = U64<BigEndian>;

/// Checkpoint framing tokens. `NACK` is `u32::MAX`, deliberately outside
/// the small dense range of the other tokens so a corrupted stream is
/// unlikely to collide with it by chance.
pub mod epoch {
    pub const COMMIT: u32 = 1;
    pub const CANCEL: u32 = 2;
    pub const ACK: u32 = 3;
    pub const NACK: u32 = u32::MAX;
}

bitflags::bitflags! {
    /// Negotiated transport capabilities.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct CapFlags: u32 {
        const PIN_ALL   = 0x01;
        const KEEPALIVE = 0x02;
    }
}

/// RDMA capability negotiation payload, carried in `rdma_conn_param.private_data`.
#[derive(Clone, Copy, Debug, Default, PartialEq, AsBytes, FromZeroes, FromBytes)]
#[repr(C, packed)]
pub struct Caps {
    pub version: Be32,
    pub flags: Be32,
    pub keepalive_rkey: Be32,
    pub keepalive_addr: Be64,
}

impl Caps {
    pub fn new(version: u32, flags: CapFlags, keepalive_rkey: u32, keepalive_addr: u64) -> Self {
        Self {
            version: Be32::new(version),
            flags: Be32::new(flags.bits()),
            keepalive_rkey: Be32::new(keepalive_rkey),
            keepalive_addr: Be64::new(keepalive_addr),
        }
    }

    pub fn flags(&self) -> CapFlags {
        CapFlags::from_bits_truncate(self.flags.get())
    }

    /// Intersect with a locally supported flag set, as the source does after
    /// receiving the destination's advertised capabilities.
    pub fn intersect_flags(&mut self, supported: CapFlags) {
        let masked = self.flags() & supported;
        self.flags = Be32::new(masked.bits());
    }
}

/// Control message types carried by [`Hdr::ty`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ControlType {
    None = 0,
    Error = 1,
    Ready = 2,
    QemuFile = 3,
    RamBlocksRequest = 4,
    RamBlocksResult = 5,
    Compress = 6,
    RegisterRequest = 7,
    RegisterResult = 8,
    RegisterFinished = 9,
    UnregisterRequest = 10,
    UnregisterFinished = 11,
}

impl ControlType {
    pub fn from_u32(v: u32) -> Option<Self> {
        use ControlType::*;
        Some(match v {
            0 => None,
            1 => Error,
            2 => Ready,
            3 => QemuFile,
            4 => RamBlocksRequest,
            5 => RamBlocksResult,
            6 => Compress,
            7 => RegisterRequest,
            8 => RegisterResult,
            9 => RegisterFinished,
            10 => UnregisterRequest,
            11 => UnregisterFinished,
            _ => return Option::None,
        })
    }
}

/// Header prepended to every control SEND payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, AsBytes, FromZeroes, FromBytes)]
#[repr(C, packed)]
pub struct Hdr {
    pub len: Be32,
    pub ty: Be32,
    pub repeat: Be32,
    pub pad: Be32,
}

impl Hdr {
    pub fn new(len: u32, ty: ControlType, repeat: u32) -> Self {
        Self {
            len: Be32::new(len),
            ty: Be32::new(ty as u32),
            repeat: Be32::new(repeat),
            pad: Be32::new(0),
        }
    }

    pub fn control_type(&self) -> Option<ControlType> {
        ControlType::from_u32(self.ty.get())
    }
}

/// Peer RAM block description, one entry per block in a `RAM_BLOCKS_RESULT` body.
#[derive(Clone, Copy, Debug, Default, PartialEq, AsBytes, FromZeroes, FromBytes)]
#[repr(C, packed)]
pub struct RemoteBlockWire {
    pub remote_host_addr: Be64,
    pub offset: Be64,
    pub length: Be64,
    pub remote_rkey: Be32,
    pub pad: Be32,
}

/// `REGISTER_REQUEST` body entry. `key` is either the current write
/// address or a chunk index depending on registration mode.
#[derive(Clone, Copy, Debug, Default, AsBytes, FromZeroes, FromBytes)]
#[repr(C, packed)]
pub struct RdmaRegisterWire {
    pub key: Be64,
    pub block_idx: Be32,
    pub pad: Be32,
    pub chunks: Be64,
}

/// `REGISTER_RESULT` body entry.
#[derive(Clone, Copy, Debug, Default, AsBytes, FromZeroes, FromBytes)]
#[repr(C, packed)]
pub struct RdmaRegisterResultWire {
    pub rkey: Be32,
    pub pad: Be32,
    pub host_addr: Be64,
}

/// `COMPRESS` body entry for the zero-page optimisation.
#[derive(Clone, Copy, Debug, Default, PartialEq, AsBytes, FromZeroes, FromBytes)]
#[repr(C, packed)]
pub struct RdmaCompressWire {
    pub value: Be32,
    pub block_idx: Be32,
    pub offset: Be64,
    pub length: Be64,
}

/// Work-request ID bit layout: `type[0:16] | block[16:30] | chunk[30:64]`.
pub mod wrid {
    const TYPE_SHIFT: u32 = 0;
    const TYPE_BITS: u32 = 16;
    const BLOCK_SHIFT: u32 = 16;
    const BLOCK_BITS: u32 = 14;
    const CHUNK_SHIFT: u32 = 30;

    const TYPE_MASK: u64 = (1u64 << TYPE_BITS) - 1;
    const BLOCK_MASK: u64 = (1u64 << BLOCK_BITS) - 1;

    pub const RECV_CONTROL_BASE: u16 = 4000;
    pub const SEND_CONTROL_BASE: u16 = 2000;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    #[repr(u16)]
    pub enum WridType {
        None = 0,
        WriteRemote = 1,
        WriteLocal = 2,
        Keepalive = 3,
    }

    pub fn encode(ty: u16, block: u16, chunk: u32) -> u64 {
        debug_assert!((block as u64) <= BLOCK_MASK, "block index overflows WRID field");
        ((ty as u64 & TYPE_MASK) << TYPE_SHIFT)
            | ((block as u64 & BLOCK_MASK) << BLOCK_SHIFT)
            | ((chunk as u64) << CHUNK_SHIFT)
    }

    pub fn decode(wrid: u64) -> (u16, u16, u32) {
        let ty = ((wrid >> TYPE_SHIFT) & TYPE_MASK) as u16;
        let block = ((wrid >> BLOCK_SHIFT) & BLOCK_MASK) as u16;
        let chunk = (wrid >> CHUNK_SHIFT) as u32;
        (ty, block, chunk)
    }
}

/// Round-trips any `FromBytes + AsBytes` wire struct through a byte buffer;
/// exercises the identity law generically instead of once per struct.
pub fn roundtrip<T: AsBytes + FromBytes + Copy + PartialEq + std::fmt::Debug>(value: T) -> T {
    let bytes = value.as_bytes().to_vec();
    T::read_from(bytes.as_slice()).expect("struct byte length matches its own encoding")
}
