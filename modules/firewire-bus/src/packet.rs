// Copyright (C) 2019-2021  Pierre Krieger
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Utility functions for building and decoding asynchronous packets.
//!
//! Asynchronous packets are made of a header of three or four quadlets, optionally followed by
//! a payload. The link hands us the header quadlets in host order; the payload is a sequence of
//! big-endian quadlets.
//!
//! ```notrust
//! q0: destination_ID(16) tl(6) rt(2) tcode(4) pri(4)
//! q1: source_ID(16) destination_offset_high(16)        (requests)
//!     source_ID(16) rcode(4) reserved(12)               (responses)
//! q2: destination_offset_low(32)                        (requests)
//! q3: quadlet_data, or data_length(16) extended_tcode(16)
//! ```

use crate::node_id::{Generation, NodeId, Speed};

use alloc::vec::Vec;
use core::convert::TryFrom;

/// Transaction code of an asynchronous packet.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Tcode {
    WriteQuadletRequest,
    WriteBlockRequest,
    WriteResponse,
    ReadQuadletRequest,
    ReadBlockRequest,
    ReadQuadletResponse,
    ReadBlockResponse,
    CycleStart,
    LockRequest,
    Stream,
    LockResponse,
}

impl Tcode {
    pub fn from_raw(raw: u8) -> Option<Tcode> {
        Some(match raw {
            0x0 => Tcode::WriteQuadletRequest,
            0x1 => Tcode::WriteBlockRequest,
            0x2 => Tcode::WriteResponse,
            0x4 => Tcode::ReadQuadletRequest,
            0x5 => Tcode::ReadBlockRequest,
            0x6 => Tcode::ReadQuadletResponse,
            0x7 => Tcode::ReadBlockResponse,
            0x8 => Tcode::CycleStart,
            0x9 => Tcode::LockRequest,
            0xa => Tcode::Stream,
            0xb => Tcode::LockResponse,
            _ => return None,
        })
    }

    pub fn raw(self) -> u8 {
        match self {
            Tcode::WriteQuadletRequest => 0x0,
            Tcode::WriteBlockRequest => 0x1,
            Tcode::WriteResponse => 0x2,
            Tcode::ReadQuadletRequest => 0x4,
            Tcode::ReadBlockRequest => 0x5,
            Tcode::ReadQuadletResponse => 0x6,
            Tcode::ReadBlockResponse => 0x7,
            Tcode::CycleStart => 0x8,
            Tcode::LockRequest => 0x9,
            Tcode::Stream => 0xa,
            Tcode::LockResponse => 0xb,
        }
    }

    pub fn is_request(self) -> bool {
        matches!(
            self,
            Tcode::WriteQuadletRequest
                | Tcode::WriteBlockRequest
                | Tcode::ReadQuadletRequest
                | Tcode::ReadBlockRequest
                | Tcode::LockRequest
        )
    }

    pub fn is_response(self) -> bool {
        matches!(
            self,
            Tcode::WriteResponse
                | Tcode::ReadQuadletResponse
                | Tcode::ReadBlockResponse
                | Tcode::LockResponse
        )
    }
}

/// Response code of a response packet.
#[derive(Debug, Copy, Clone, PartialEq, Eq, derive_more::Display)]
pub enum Rcode {
    #[display(fmt = "complete")]
    Complete,
    #[display(fmt = "conflict error")]
    ConflictError,
    #[display(fmt = "data error")]
    DataError,
    #[display(fmt = "type error")]
    TypeError,
    #[display(fmt = "address error")]
    AddressError,
}

impl Rcode {
    pub fn from_raw(raw: u8) -> Rcode {
        match raw {
            0x0 => Rcode::Complete,
            0x4 => Rcode::ConflictError,
            0x5 => Rcode::DataError,
            0x6 => Rcode::TypeError,
            _ => Rcode::AddressError,
        }
    }

    pub fn raw(self) -> u8 {
        match self {
            Rcode::Complete => 0x0,
            Rcode::ConflictError => 0x4,
            Rcode::DataError => 0x5,
            Rcode::TypeError => 0x6,
            Rcode::AddressError => 0x7,
        }
    }
}

/// Operation of a lock transaction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExtendedTcode {
    MaskSwap,
    CompareSwap,
    FetchAdd,
    LittleAdd,
    BoundedAdd,
    WrapAdd,
}

impl ExtendedTcode {
    pub fn from_raw(raw: u16) -> Option<ExtendedTcode> {
        Some(match raw {
            1 => ExtendedTcode::MaskSwap,
            2 => ExtendedTcode::CompareSwap,
            3 => ExtendedTcode::FetchAdd,
            4 => ExtendedTcode::LittleAdd,
            5 => ExtendedTcode::BoundedAdd,
            6 => ExtendedTcode::WrapAdd,
            _ => return None,
        })
    }

    pub fn raw(self) -> u16 {
        match self {
            ExtendedTcode::MaskSwap => 1,
            ExtendedTcode::CompareSwap => 2,
            ExtendedTcode::FetchAdd => 3,
            ExtendedTcode::LittleAdd => 4,
            ExtendedTcode::BoundedAdd => 5,
            ExtendedTcode::WrapAdd => 6,
        }
    }

    /// True if the request carries an argument in addition to the data value.
    pub fn has_argument(self) -> bool {
        !matches!(self, ExtendedTcode::FetchAdd | ExtendedTcode::LittleAdd)
    }
}

/// 6-bit transaction label correlating a request with its response.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Label(u8);

impl Label {
    /// Number of distinct labels.
    pub const COUNT: usize = 64;

    pub fn new(label: u8) -> Option<Label> {
        if usize::from(label) < Label::COUNT {
            Some(Label(label))
        } else {
            None
        }
    }

    /// Label at the given position of a pool, wrapping around.
    pub fn from_index(index: usize) -> Label {
        Label((index % Label::COUNT) as u8)
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// Content of an asynchronous packet, depending on its transaction code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketBody {
    ReadQuadletRequest,
    ReadBlockRequest { length: u16 },
    WriteQuadletRequest { data: u32 },
    WriteBlockRequest { data: Vec<u8> },
    LockRequest { extended_tcode: ExtendedTcode, data: Vec<u8> },
    WriteResponse,
    ReadQuadletResponse { data: u32 },
    ReadBlockResponse { data: Vec<u8> },
    LockResponse { extended_tcode: ExtendedTcode, data: Vec<u8> },
}

/// Decoded asynchronous packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncPacket {
    pub destination: NodeId,
    pub source: NodeId,
    pub label: Label,
    /// Destination offset of requests. Zero for responses.
    pub offset: u64,
    /// Response code of responses. [`Rcode::Complete`] for requests.
    pub rcode: Rcode,
    pub body: PacketBody,
}

/// Error while decoding a packet.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum DecodeError {
    /// Packet is shorter than its header or than the announced payload.
    Truncated,
    /// Transaction code that doesn't correspond to an asynchronous transaction.
    #[display(fmt = "unsupported tcode 0x{:x}", _0)]
    UnsupportedTcode(u8),
    /// Lock packet with an unknown extended transaction code.
    #[display(fmt = "unknown extended tcode {}", _0)]
    UnknownExtendedTcode(u16),
}

impl AsyncPacket {
    /// Transaction code corresponding to the body.
    pub fn tcode(&self) -> Tcode {
        match self.body {
            PacketBody::ReadQuadletRequest => Tcode::ReadQuadletRequest,
            PacketBody::ReadBlockRequest { .. } => Tcode::ReadBlockRequest,
            PacketBody::WriteQuadletRequest { .. } => Tcode::WriteQuadletRequest,
            PacketBody::WriteBlockRequest { .. } => Tcode::WriteBlockRequest,
            PacketBody::LockRequest { .. } => Tcode::LockRequest,
            PacketBody::WriteResponse => Tcode::WriteResponse,
            PacketBody::ReadQuadletResponse { .. } => Tcode::ReadQuadletResponse,
            PacketBody::ReadBlockResponse { .. } => Tcode::ReadBlockResponse,
            PacketBody::LockResponse { .. } => Tcode::LockResponse,
        }
    }

    /// Decodes a packet from the quadlets delivered by the link.
    pub fn decode(words: &[u32]) -> Result<AsyncPacket, DecodeError> {
        if words.len() < 3 {
            return Err(DecodeError::Truncated);
        }

        let raw_tcode = ((words[0] >> 4) & 0xf) as u8;
        let tcode = Tcode::from_raw(raw_tcode).ok_or(DecodeError::UnsupportedTcode(raw_tcode))?;
        let destination = NodeId::from_raw((words[0] >> 16) as u16);
        let label = Label(((words[0] >> 10) & 0x3f) as u8);
        let source = NodeId::from_raw((words[1] >> 16) as u16);

        let (offset, rcode) = if tcode.is_request() {
            let offset = (u64::from(words[1] & 0xffff) << 32) | u64::from(words[2]);
            (offset, Rcode::Complete)
        } else if tcode.is_response() {
            (0, Rcode::from_raw(((words[1] >> 12) & 0xf) as u8))
        } else {
            return Err(DecodeError::UnsupportedTcode(raw_tcode));
        };

        let quadlet3 = || words.get(3).copied().ok_or(DecodeError::Truncated);
        let block = || -> Result<(u16, u16, Vec<u8>), DecodeError> {
            let q3 = quadlet3()?;
            let length = (q3 >> 16) as u16;
            let extended = (q3 & 0xffff) as u16;
            let payload: Vec<u8> = words[4..]
                .iter()
                .flat_map(|q| q.to_be_bytes().to_vec())
                .collect();
            if payload.len() < usize::from(length) {
                return Err(DecodeError::Truncated);
            }
            Ok((length, extended, payload[..usize::from(length)].to_vec()))
        };

        let body = match tcode {
            Tcode::ReadQuadletRequest => PacketBody::ReadQuadletRequest,
            Tcode::ReadBlockRequest => PacketBody::ReadBlockRequest {
                length: (quadlet3()? >> 16) as u16,
            },
            Tcode::WriteQuadletRequest => PacketBody::WriteQuadletRequest { data: quadlet3()? },
            Tcode::WriteBlockRequest => PacketBody::WriteBlockRequest { data: block()?.2 },
            Tcode::LockRequest => {
                let (_, extended, data) = block()?;
                PacketBody::LockRequest {
                    extended_tcode: ExtendedTcode::from_raw(extended)
                        .ok_or(DecodeError::UnknownExtendedTcode(extended))?,
                    data,
                }
            }
            Tcode::WriteResponse => PacketBody::WriteResponse,
            Tcode::ReadQuadletResponse => PacketBody::ReadQuadletResponse { data: quadlet3()? },
            Tcode::ReadBlockResponse => PacketBody::ReadBlockResponse { data: block()?.2 },
            Tcode::LockResponse => {
                let (_, extended, data) = block()?;
                PacketBody::LockResponse {
                    extended_tcode: ExtendedTcode::from_raw(extended)
                        .ok_or(DecodeError::UnknownExtendedTcode(extended))?,
                    data,
                }
            }
            Tcode::CycleStart | Tcode::Stream => {
                return Err(DecodeError::UnsupportedTcode(raw_tcode))
            }
        };

        Ok(AsyncPacket {
            destination,
            source,
            label,
            offset,
            rcode,
            body,
        })
    }

    /// Encodes the packet as the quadlets a link would deliver.
    pub fn encode(&self) -> Vec<u32> {
        let tcode = self.tcode();
        let mut words = Vec::with_capacity(4);
        words.push(
            (u32::from(self.destination.raw()) << 16)
                | (u32::from(self.label.get()) << 10)
                | (u32::from(tcode.raw()) << 4),
        );
        if tcode.is_request() {
            words.push((u32::from(self.source.raw()) << 16) | ((self.offset >> 32) as u32 & 0xffff));
            words.push(self.offset as u32);
        } else {
            words.push((u32::from(self.source.raw()) << 16) | (u32::from(self.rcode.raw()) << 12));
            words.push(0);
        }

        let push_block = |words: &mut Vec<u32>, extended: u16, data: &[u8]| {
            let length = u16::try_from(data.len()).unwrap_or(u16::max_value());
            words.push((u32::from(length) << 16) | u32::from(extended));
            for chunk in data.chunks(4) {
                let mut quadlet = [0; 4];
                quadlet[..chunk.len()].copy_from_slice(chunk);
                words.push(u32::from_be_bytes(quadlet));
            }
        };

        match &self.body {
            PacketBody::ReadQuadletRequest | PacketBody::WriteResponse => {}
            PacketBody::ReadBlockRequest { length } => words.push(u32::from(*length) << 16),
            PacketBody::WriteQuadletRequest { data }
            | PacketBody::ReadQuadletResponse { data } => words.push(*data),
            PacketBody::WriteBlockRequest { data } | PacketBody::ReadBlockResponse { data } => {
                push_block(&mut words, 0, data)
            }
            PacketBody::LockRequest {
                extended_tcode,
                data,
            }
            | PacketBody::LockResponse {
                extended_tcode,
                data,
            } => push_block(&mut words, extended_tcode.raw(), data),
        }

        words
    }
}

/// Kind of request to emit, as passed to the [`Link`](crate::Link).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    ReadQuadlet,
    ReadBlock { length: u16 },
    WriteQuadlet { data: u32 },
    WriteBlock { data: Vec<u8> },
    Lock { extended_tcode: ExtendedTcode, data: Vec<u8> },
}

impl RequestKind {
    /// Converts into the body of the equivalent request packet.
    pub fn to_body(&self) -> PacketBody {
        match self {
            RequestKind::ReadQuadlet => PacketBody::ReadQuadletRequest,
            RequestKind::ReadBlock { length } => PacketBody::ReadBlockRequest { length: *length },
            RequestKind::WriteQuadlet { data } => PacketBody::WriteQuadletRequest { data: *data },
            RequestKind::WriteBlock { data } => PacketBody::WriteBlockRequest { data: data.clone() },
            RequestKind::Lock {
                extended_tcode,
                data,
            } => PacketBody::LockRequest {
                extended_tcode: *extended_tcode,
                data: data.clone(),
            },
        }
    }
}

/// Request to send to a remote node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub destination: NodeId,
    /// 48-bit destination offset.
    pub offset: u64,
    pub speed: Speed,
    pub label: Label,
    /// Generation the request was built for. The link must drop the request if the bus has
    /// reset in the meantime.
    pub generation: Generation,
    pub kind: RequestKind,
}

/// Response to send to a remote node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundResponse {
    pub destination: NodeId,
    pub label: Label,
    pub speed: Speed,
    pub rcode: Rcode,
    pub body: PacketBody,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(raw: u16) -> NodeId {
        NodeId::from_raw(raw)
    }

    #[test]
    fn read_quadlet_request() {
        let packet = AsyncPacket {
            destination: node(0xffc1),
            source: node(0xffc0),
            label: Label::new(5).unwrap(),
            offset: 0xffff_f000_0400,
            rcode: Rcode::Complete,
            body: PacketBody::ReadQuadletRequest,
        };
        let words = packet.encode();
        assert_eq!(words, [0xffc1_1440, 0xffc0_ffff, 0xf000_0400]);
        assert_eq!(AsyncPacket::decode(&words).unwrap(), packet);
    }

    #[test]
    fn lock_response_payload_is_big_endian() {
        let packet = AsyncPacket {
            destination: node(0xffc0),
            source: node(0xffc2),
            label: Label::new(63).unwrap(),
            offset: 0,
            rcode: Rcode::Complete,
            body: PacketBody::LockResponse {
                extended_tcode: ExtendedTcode::CompareSwap,
                data: alloc::vec![0x12, 0x34, 0x56, 0x78],
            },
        };
        let words = packet.encode();
        assert_eq!(words[3], 0x0004_0002);
        assert_eq!(words[4], 0x1234_5678);
        assert_eq!(AsyncPacket::decode(&words).unwrap(), packet);
    }

    #[test]
    fn response_rcode() {
        let words = [0xffc0_0820, 0xffc1_7000, 0];
        let packet = AsyncPacket::decode(&words).unwrap();
        assert_eq!(packet.tcode(), Tcode::WriteResponse);
        assert_eq!(packet.rcode, Rcode::AddressError);
        assert_eq!(packet.label.get(), 2);
    }

    #[test]
    fn truncated_and_unsupported() {
        assert_eq!(AsyncPacket::decode(&[0]), Err(DecodeError::Truncated));
        assert_eq!(
            AsyncPacket::decode(&[0x0000_0080, 0, 0]),
            Err(DecodeError::UnsupportedTcode(8))
        );
        // Block write announcing 8 bytes but carrying 4.
        assert_eq!(
            AsyncPacket::decode(&[0x0000_0010, 0, 0, 0x0008_0000, 1]),
            Err(DecodeError::Truncated)
        );
    }
}
