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

//! Routing of inbound packets.
//!
//! Requests are served against the local address spaces and produce the matching response.
//! Responses are turned into a transaction outcome, to be delivered to whatever is bound to
//! their label. Requests to the local node go through the same path without touching the link.

use crate::address_space::AddressSpaces;
use crate::csr;
use crate::node_id::{Generation, NodeId, Speed};
use crate::packet::{
    AsyncPacket, DecodeError, Label, OutboundResponse, PacketBody, Rcode, RequestKind,
};
use crate::transactions::{Response, TransactionError};

use alloc::vec::Vec;
use core::convert::TryFrom;

/// What to do with an inbound packet.
#[derive(Debug)]
pub enum Inbound {
    /// A request was served. `response` is `None` if the request was broadcast.
    Request {
        source: NodeId,
        response: Option<OutboundResponse>,
    },
    /// A response to one of our requests. Must be matched against the label pool.
    Response {
        label: Label,
        source: NodeId,
        result: Result<Response, TransactionError>,
    },
}

/// Decodes an inbound packet and serves it if it is a request.
pub fn dispatch_inbound(
    words: &[u32],
    speed: Speed,
    spaces: &mut AddressSpaces,
    generation: Generation,
) -> Result<Inbound, DecodeError> {
    let packet = AsyncPacket::decode(words)?;

    if packet.tcode().is_request() {
        let (rcode, body) = serve_request(spaces, generation, &packet);
        let response = if packet.destination.is_broadcast() {
            None
        } else {
            Some(OutboundResponse {
                destination: packet.source,
                label: packet.label,
                speed,
                rcode,
                body,
            })
        };
        Ok(Inbound::Request {
            source: packet.source,
            response,
        })
    } else {
        Ok(Inbound::Response {
            label: packet.label,
            source: packet.source,
            result: response_result(packet.rcode, packet.body),
        })
    }
}

/// Serves a request against the local address spaces. Returns the response code and body.
pub fn serve_request(
    spaces: &mut AddressSpaces,
    generation: Generation,
    packet: &AsyncPacket,
) -> (Rcode, PacketBody) {
    fn split<T>(result: Result<T, Rcode>, fallback: T) -> (Rcode, T) {
        match result {
            Ok(v) => (Rcode::Complete, v),
            Err(rcode) => (rcode, fallback),
        }
    }

    match &packet.body {
        PacketBody::ReadQuadletRequest => {
            let (rcode, data) = split(
                spaces.read(packet.offset, 4).map(|bytes| be_quadlet(&bytes)),
                0,
            );
            (rcode, PacketBody::ReadQuadletResponse { data })
        }
        PacketBody::ReadBlockRequest { length } => {
            let (rcode, data) = split(
                spaces.read(packet.offset, usize::from(*length)),
                Vec::new(),
            );
            (rcode, PacketBody::ReadBlockResponse { data })
        }
        PacketBody::WriteQuadletRequest { data } => {
            let result = spaces.write(packet.source, generation, packet.offset, &data.to_be_bytes());
            (split(result, ()).0, PacketBody::WriteResponse)
        }
        PacketBody::WriteBlockRequest { data } => {
            let result = spaces.write(packet.source, generation, packet.offset, data);
            (split(result, ()).0, PacketBody::WriteResponse)
        }
        PacketBody::LockRequest {
            extended_tcode,
            data,
        } => {
            let (rcode, data) = split(
                spaces.lock(packet.offset, *extended_tcode, data),
                Vec::new(),
            );
            (
                rcode,
                PacketBody::LockResponse {
                    extended_tcode: *extended_tcode,
                    data,
                },
            )
        }
        // Responses are never served.
        PacketBody::WriteResponse
        | PacketBody::ReadQuadletResponse { .. }
        | PacketBody::ReadBlockResponse { .. }
        | PacketBody::LockResponse { .. } => (Rcode::TypeError, PacketBody::WriteResponse),
    }
}

/// Converts the content of a response packet into a transaction outcome.
pub fn response_result(rcode: Rcode, body: PacketBody) -> Result<Response, TransactionError> {
    if rcode != Rcode::Complete {
        return Err(TransactionError::Response(rcode));
    }

    let data = match body {
        PacketBody::WriteResponse => Vec::new(),
        PacketBody::ReadQuadletResponse { data } => data.to_be_bytes().to_vec(),
        PacketBody::ReadBlockResponse { data } | PacketBody::LockResponse { data, .. } => data,
        _ => return Err(TransactionError::InvalidRequest),
    };
    Ok(Response { data })
}

/// Serves a request addressed to the local node, as if it had come back from the bus.
pub fn loopback(
    spaces: &mut AddressSpaces,
    generation: Generation,
    local: NodeId,
    offset: u64,
    kind: &RequestKind,
) -> Result<Response, TransactionError> {
    let request = AsyncPacket {
        destination: local,
        source: local,
        label: Label::from_index(0),
        offset,
        rcode: Rcode::Complete,
        body: kind.to_body(),
    };
    let request =
        AsyncPacket::decode(&request.encode()).map_err(|_| TransactionError::InvalidRequest)?;
    let (rcode, body) = serve_request(spaces, generation, &request);
    response_result(rcode, body)
}

/// Speed at which a request to `offset` must actually be sent.
pub fn request_speed(offset: u64, requested: Speed) -> Speed {
    if csr::is_irm_register(offset) {
        Speed::LOWEST
    } else {
        requested
    }
}

fn be_quadlet(bytes: &[u8]) -> u32 {
    <[u8; 4]>::try_from(bytes).map_or(0, u32::from_be_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ExtendedTcode;

    const LOCAL: NodeId = NodeId::from_raw(0xffc0);
    const REMOTE: NodeId = NodeId::from_raw(0xffc1);

    fn request(destination: NodeId, offset: u64, body: PacketBody) -> Vec<u32> {
        AsyncPacket {
            destination,
            source: REMOTE,
            label: Label::from_index(9),
            offset,
            rcode: Rcode::Complete,
            body,
        }
        .encode()
    }

    #[test]
    fn read_quadlet_served_from_rom() {
        let mut spaces = AddressSpaces::new(&[0x0404_abcd, csr::BUS_NAME_1394]);
        let words = request(LOCAL, csr::BUS_INFO_BLOCK_HEADER, PacketBody::ReadQuadletRequest);
        match dispatch_inbound(&words, Speed::S400, &mut spaces, Generation(1)).unwrap() {
            Inbound::Request {
                response: Some(response),
                ..
            } => {
                assert_eq!(response.destination, REMOTE);
                assert_eq!(response.label.get(), 9);
                assert_eq!(response.rcode, Rcode::Complete);
                assert_eq!(
                    response.body,
                    PacketBody::ReadQuadletResponse { data: 0x0404_abcd }
                );
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn unknown_address_answers_address_error() {
        let mut spaces = AddressSpaces::new(&[]);
        let words = request(LOCAL, 0x1234, PacketBody::WriteQuadletRequest { data: 1 });
        match dispatch_inbound(&words, Speed::S100, &mut spaces, Generation(1)).unwrap() {
            Inbound::Request {
                response: Some(response),
                ..
            } => assert_eq!(response.rcode, Rcode::AddressError),
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn broadcast_requests_get_no_response() {
        let mut spaces = AddressSpaces::new(&[]);
        let id = spaces.add_fixed(0x4000, 4, false).unwrap();
        let words = request(
            NodeId::from_raw(0xffff),
            0x4000,
            PacketBody::WriteQuadletRequest { data: 0xdead_beef },
        );
        match dispatch_inbound(&words, Speed::S100, &mut spaces, Generation(1)).unwrap() {
            Inbound::Request { response, .. } => assert!(response.is_none()),
            other => panic!("{:?}", other),
        }
        assert_eq!(spaces.data(id), Some(&[0xde, 0xad, 0xbe, 0xef][..]));
    }

    #[test]
    fn response_with_error_rcode() {
        let mut spaces = AddressSpaces::new(&[]);
        let words = AsyncPacket {
            destination: LOCAL,
            source: REMOTE,
            label: Label::from_index(3),
            offset: 0,
            rcode: Rcode::ConflictError,
            body: PacketBody::WriteResponse,
        }
        .encode();
        match dispatch_inbound(&words, Speed::S100, &mut spaces, Generation(1)).unwrap() {
            Inbound::Response { label, result, .. } => {
                assert_eq!(label.get(), 3);
                assert_eq!(result, Err(TransactionError::Response(Rcode::ConflictError)));
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn loopback_lock_on_irm_registers() {
        let mut spaces = AddressSpaces::new(&[]);
        let mut data = Vec::new();
        data.extend_from_slice(&0xffff_ffffu32.to_be_bytes());
        data.extend_from_slice(&0x7fff_ffffu32.to_be_bytes());
        let kind = RequestKind::Lock {
            extended_tcode: ExtendedTcode::CompareSwap,
            data,
        };
        let response = loopback(&mut spaces, Generation(1), LOCAL, csr::CHANNELS_AVAILABLE_HI, &kind)
            .unwrap();
        assert_eq!(response.quadlet(), Some(0xffff_ffff));
        assert_eq!(spaces.irm_register(csr::CHANNELS_AVAILABLE_HI), Some(0x7fff_ffff));
    }

    #[test]
    fn irm_registers_at_lowest_speed() {
        assert_eq!(request_speed(csr::BANDWIDTH_AVAILABLE, Speed::S400), Speed::S100);
        assert_eq!(request_speed(csr::BUS_INFO_BLOCK_HEADER, Speed::S400), Speed::S400);
    }
}
