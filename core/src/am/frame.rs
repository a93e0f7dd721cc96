//! The AM wire frame (spec §3 "AM frame", §6 "AM wire layout"). Byte-exact
//! between peers of the same build, per spec.
//!
//! ```text
//! cmd(1) | category(1) | handler_id(1) | numargs(1)
//! offset(4) | size(4)
//! dest_addr(8)          // Long/AsyncLong only; 0 otherwise (supplement: the
//!                       // distilled layout names `offset`/`size` but not a
//!                       // field wide enough for a 64-bit destination
//!                       // address — see SPEC_FULL.md §4.1)
//! tail[tail_len]        // unaligned Long fragment, tail_len = size % BUCKET_ALIGN
//! args[numargs * 4]     // 32-bit handler arguments
//! payload[size]         // Medium: inline; Long: inline iff size <= packedlong_limit
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{GasnetError, Result};

/// Unit of alignment for Long RDMA staging; tails shorter than this travel
/// inline in the frame's `tail` field (spec §4.1 "Packed-vs-RDMA Long").
pub const BUCKET_ALIGN: usize = 64;

/// The largest number of 32-bit handler arguments a frame may carry (spec
/// §6 accessor `MaxArgs`).
pub const MAX_ARGS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cmd {
    ReqMessage = 0,
    ReplyMessage = 1,
    System = 2,
    /// A reply to a `System` request (SPEC_FULL.md §4.1: `FH_MOVE_REP`,
    /// `SYS_EXIT_*_REP`). Kept distinct from `ReplyMessage` so the engine's
    /// dispatch loop does not replenish a per-peer AM credit for it — system
    /// requests never consumed one in the first place (see
    /// `Engine::am_system_request`).
    SystemReply = 3,
}

impl Cmd {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Cmd::ReqMessage),
            1 => Ok(Cmd::ReplyMessage),
            2 => Ok(Cmd::System),
            3 => Ok(Cmd::SystemReply),
            other => Err(GasnetError::BadArg(format!("unknown frame cmd {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Category {
    Short = 0,
    Medium = 1,
    Long = 2,
    AsyncLong = 3,
}

impl Category {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Category::Short),
            1 => Ok(Category::Medium),
            2 => Ok(Category::Long),
            3 => Ok(Category::AsyncLong),
            other => Err(GasnetError::BadArg(format!("unknown frame category {other}"))),
        }
    }

    pub fn is_long(self) -> bool {
        matches!(self, Category::Long | Category::AsyncLong)
    }
}

/// A decoded (or to-be-encoded) AM frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmFrame {
    pub cmd: Cmd,
    pub category: Category,
    pub handler_id: u8,
    pub offset: u32,
    pub size: u32,
    pub dest_addr: u64,
    pub tail: Bytes,
    pub args: Vec<u32>,
    pub payload: Bytes,
}

impl AmFrame {
    pub fn encode(&self) -> Result<Bytes> {
        if self.args.len() > MAX_ARGS {
            return Err(GasnetError::BadArg(format!(
                "numargs {} exceeds MaxArgs {}",
                self.args.len(),
                MAX_ARGS
            )));
        }
        if self.tail.len() >= BUCKET_ALIGN {
            return Err(GasnetError::BadArg("tail fragment must be < BUCKET_ALIGN".into()));
        }
        let mut buf = BytesMut::with_capacity(
            4 + 8 + 8 + 1 + self.tail.len() + self.args.len() * 4 + self.payload.len(),
        );
        buf.put_u8(self.cmd as u8);
        buf.put_u8(self.category as u8);
        buf.put_u8(self.handler_id);
        buf.put_u8(self.args.len() as u8);
        buf.put_u32(self.offset);
        buf.put_u32(self.size);
        buf.put_u64(self.dest_addr);
        buf.put_u8(self.tail.len() as u8);
        buf.put_slice(&self.tail);
        for a in &self.args {
            buf.put_u32(*a);
        }
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    pub fn decode(mut bytes: Bytes) -> Result<Self> {
        if bytes.len() < 18 {
            return Err(GasnetError::BadArg("frame shorter than fixed header".into()));
        }
        let cmd = Cmd::from_u8(bytes.get_u8())?;
        let category = Category::from_u8(bytes.get_u8())?;
        let handler_id = bytes.get_u8();
        let numargs = bytes.get_u8() as usize;
        if numargs > MAX_ARGS {
            return Err(GasnetError::BadArg(format!(
                "numargs {numargs} exceeds MaxArgs {MAX_ARGS}"
            )));
        }
        let offset = bytes.get_u32();
        let size = bytes.get_u32();
        let dest_addr = bytes.get_u64();
        if bytes.is_empty() {
            return Err(GasnetError::BadArg("frame truncated before tail length".into()));
        }
        let tail_len = bytes.get_u8() as usize;
        if bytes.len() < tail_len + numargs * 4 {
            return Err(GasnetError::BadArg("frame truncated before tail/args".into()));
        }
        let tail = bytes.split_to(tail_len);
        let mut args = Vec::with_capacity(numargs);
        for _ in 0..numargs {
            args.push(bytes.get_u32());
        }
        let payload = bytes;
        Ok(AmFrame {
            cmd,
            category,
            handler_id,
            offset,
            size,
            dest_addr,
            tail,
            args,
            payload,
        })
    }

    pub fn is_request(&self) -> bool {
        matches!(self.cmd, Cmd::ReqMessage | Cmd::System)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_round_trips() {
        let frame = AmFrame {
            cmd: Cmd::ReqMessage,
            category: Category::Short,
            handler_id: 7,
            offset: 0,
            size: 0,
            dest_addr: 0,
            tail: Bytes::new(),
            args: vec![0x1111_1111, 0x2222_2222],
            payload: Bytes::new(),
        };
        let bytes = frame.encode().unwrap();
        let decoded = AmFrame::decode(bytes).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn medium_payload_round_trips() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(1024).collect();
        let frame = AmFrame {
            cmd: Cmd::ReqMessage,
            category: Category::Medium,
            handler_id: 12,
            offset: 0,
            size: payload.len() as u32,
            dest_addr: 0,
            tail: Bytes::new(),
            args: vec![],
            payload: Bytes::from(payload.clone()),
        };
        let decoded = AmFrame::decode(frame.encode().unwrap()).unwrap();
        assert_eq!(decoded.payload, Bytes::from(payload));
    }

    #[test]
    fn rejects_numargs_over_max() {
        let frame = AmFrame {
            cmd: Cmd::ReqMessage,
            category: Category::Short,
            handler_id: 1,
            offset: 0,
            size: 0,
            dest_addr: 0,
            tail: Bytes::new(),
            args: vec![0; MAX_ARGS + 1],
            payload: Bytes::new(),
        };
        assert!(frame.encode().is_err());
    }

    #[test]
    fn long_with_tail_round_trips() {
        let frame = AmFrame {
            cmd: Cmd::ReqMessage,
            category: Category::Long,
            handler_id: 3,
            offset: 0,
            size: 65536,
            dest_addr: 0xdead_beef,
            tail: Bytes::from_static(&[0xAB; 17]),
            args: vec![42],
            payload: Bytes::new(),
        };
        let decoded = AmFrame::decode(frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }
}
