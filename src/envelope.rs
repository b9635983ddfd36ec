// Copyright © 2026 Rudis Laboratories LLC

//! Outer packet framing for each transport scheme.
//!
//! Standard schemes put the 8-byte header in front of the CBOR payload.
//! CoAP schemes carry the header as a byte string under the `"_h"` key
//! inside the payload map, and the whole map is the wire payload.

use byteorder::{BigEndian, ByteOrder};
use log::debug;
use serde::Serialize;
use serde_cbor::Value;

use crate::error::{Error, Result};
use crate::nmp_hdr::*;

/// Reserved payload key holding the header under CoAP schemes.
pub const COAP_HEADER_KEY: &str = "_h";

/// Extra bytes a CoAP message adds around the SMP payload.
pub const COAP_OVERHEAD: usize = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Ble,
    Udp,
    Serial,
    CoapBle,
    CoapUdp,
}

impl Scheme {
    pub fn is_coap(&self) -> bool {
        matches!(self, Scheme::CoapBle | Scheme::CoapUdp)
    }

    /// Bytes of framing the transport adds beyond the SMP packet itself.
    pub fn framing_overhead(&self) -> usize {
        if self.is_coap() {
            COAP_OVERHEAD
        } else {
            0
        }
    }
}

pub fn build_header(
    version: u8,
    op: NmpOp,
    flags: u8,
    length: usize,
    group: u16,
    seq: u8,
    id: u8,
) -> [u8; NMP_HDR_SIZE] {
    NmpHdr {
        version,
        op,
        flags,
        // payloads above 64 KiB are never built; the transfer engine chunks below that
        len: length as u16,
        group,
        seq,
        id,
    }
    .serialize()
}

pub fn parse_header(bytes: &[u8]) -> Result<NmpHdr> {
    NmpHdr::parse(bytes)
}

/// Build a complete request packet for `scheme`.
pub fn build_packet<T: Serialize>(
    scheme: Scheme,
    op: NmpOp,
    flags: u8,
    group: u16,
    seq: u8,
    id: u8,
    payload: &T,
) -> Result<Vec<u8>> {
    if scheme.is_coap() {
        let mut map = match serde_cbor::value::to_value(payload)? {
            Value::Map(map) => map,
            other => {
                return Err(Error::InvalidArgument(format!(
                    "CoAP payload must be a map, got {other:?}"
                )))
            }
        };
        // the header is embedded with a zero length field
        let header = build_header(SMP_VERSION_2, op, flags, 0, group, seq, id);
        map.insert(
            Value::Text(COAP_HEADER_KEY.to_string()),
            Value::Bytes(header.to_vec()),
        );
        let packet = serde_cbor::to_vec(&Value::Map(map))?;
        debug!("coap packet: {}", hex::encode(&packet));
        Ok(packet)
    } else {
        let body = serde_cbor::to_vec(payload)?;
        let header = build_header(SMP_VERSION_2, op, flags, body.len(), group, seq, id);
        let mut packet = Vec::with_capacity(NMP_HDR_SIZE + body.len());
        packet.extend_from_slice(&header);
        packet.extend(body);
        Ok(packet)
    }
}

/// Recover the request header from an already built packet.
pub fn packet_header(scheme: Scheme, packet: &[u8]) -> Result<NmpHdr> {
    if scheme.is_coap() {
        let value: Value = serde_cbor::from_slice(packet)?;
        coap_header(&value)?
            .ok_or_else(|| Error::MalformedResponse("CoAP packet without header".to_string()))
    } else {
        if packet.len() < NMP_HDR_SIZE {
            return Err(Error::MalformedHeader(packet.len()));
        }
        NmpHdr::parse(&packet[..NMP_HDR_SIZE])
    }
}

/// Extract the `"_h"` header from a decoded CoAP payload map.
pub fn coap_header(value: &Value) -> Result<Option<NmpHdr>> {
    if let Value::Map(map) = value {
        if let Some(Value::Bytes(h)) = map.get(&Value::Text(COAP_HEADER_KEY.to_string())) {
            return NmpHdr::parse(h).map(Some);
        }
    }
    Ok(None)
}

/// Total packet length announced by a (possibly partial) standard header.
pub fn expected_length(scheme: Scheme, bytes: &[u8]) -> Result<usize> {
    if scheme.is_coap() {
        return Err(Error::InvalidArgument(
            "CoAP packets carry no length prefix".to_string(),
        ));
    }
    if bytes.len() < NMP_HDR_SIZE {
        return Err(Error::MalformedHeader(bytes.len()));
    }
    Ok(BigEndian::read_u16(&bytes[2..4]) as usize + NMP_HDR_SIZE)
}
