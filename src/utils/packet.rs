//! Wire packet representation: a length-prefix framed payload plus a
//! small header the pipeline stages use to track priority and origin.

use std::net::SocketAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{MixnodeError, Result, MAX_WIRE_PACKET_SIZE};

/// Packet kind, carried as the first header byte on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketKind {
    Data = 0,
    Cover = 1,
}

impl PacketKind {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Data),
            1 => Some(Self::Cover),
            _ => None,
        }
    }
}

/// Metadata that travels alongside a packet through the pipeline, never
/// serialized onto the wire.
#[derive(Debug, Clone, Default)]
pub struct PacketHeader {
    pub priority: u8,
    pub source: Option<SocketAddr>,
}

/// A single mixnet packet: header fields plus its Sphinx-layered payload.
#[derive(Debug, Clone)]
pub struct Packet {
    pub kind: PacketKind,
    pub version: u8,
    pub data: Bytes,
    pub header: PacketHeader,
}

impl Packet {
    pub fn data(payload: Bytes, priority: u8) -> Self {
        Self {
            kind: PacketKind::Data,
            version: crate::MIXNODE_VERSION,
            data: payload,
            header: PacketHeader {
                priority,
                source: None,
            },
        }
    }

    pub fn cover(payload: Bytes) -> Self {
        Self {
            kind: PacketKind::Cover,
            version: crate::MIXNODE_VERSION,
            data: payload,
            header: PacketHeader::default(),
        }
    }

    pub fn is_cover(&self) -> bool {
        self.kind == PacketKind::Cover
    }

    /// Encode as `[version:1][kind:1][len:4][payload]`. Does not include
    /// the outer 4-byte TCP frame length (see `server::tcp`).
    pub fn encode(&self) -> Result<Bytes> {
        if self.data.len() > MAX_WIRE_PACKET_SIZE {
            return Err(MixnodeError::Packet(format!(
                "packet of {} bytes exceeds max wire size {}",
                self.data.len(),
                MAX_WIRE_PACKET_SIZE
            )));
        }
        let mut buf = BytesMut::with_capacity(6 + self.data.len());
        buf.put_u8(self.version);
        buf.put_u8(self.kind as u8);
        buf.put_u32(self.data.len() as u32);
        buf.put_slice(&self.data);
        Ok(buf.freeze())
    }

    pub fn decode(mut bytes: Bytes) -> Result<Self> {
        if bytes.len() < 6 {
            return Err(MixnodeError::Packet("packet too short".into()));
        }
        let version = bytes.get_u8();
        let kind_byte = bytes.get_u8();
        let kind = PacketKind::from_byte(kind_byte)
            .ok_or_else(|| MixnodeError::Packet(format!("unknown packet kind {kind_byte}")))?;
        let len = bytes.get_u32() as usize;
        if bytes.len() < len {
            return Err(MixnodeError::Packet("truncated packet payload".into()));
        }
        let data = bytes.split_to(len);
        Ok(Self {
            kind,
            version,
            data,
            header: PacketHeader::default(),
        })
    }
}
