// Copyright © 2026 Rudis Laboratories LLC

use log::debug;
use serde::de::DeserializeOwned;
use serde_cbor::Value;

use crate::envelope::{coap_header, expected_length, Scheme};
use crate::error::{Error, GroupReturnCode, Result};
use crate::nmp_hdr::{NmpHdr, NMP_HDR_SIZE};

/// Hint for how a response should be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Generic,
    /// Image or file chunk acknowledgement, eligible for the fast path.
    UploadAck,
}

/// One decoded SMP response. Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    scheme: Scheme,
    bytes: Vec<u8>,
    header: Option<NmpHdr>,
    payload_start: usize,
    rc: i32,
    group_rc: Option<GroupReturnCode>,
    offset: Option<u64>,
}

impl Response {
    pub fn decode(scheme: Scheme, bytes: Vec<u8>, kind: ResponseKind) -> Result<Response> {
        let (header, payload_start) = if scheme.is_coap() {
            (None, 0)
        } else {
            if bytes.len() < NMP_HDR_SIZE {
                return Err(Error::MalformedResponse(format!(
                    "response too short: {} bytes",
                    bytes.len()
                )));
            }
            let header = NmpHdr::parse(&bytes[..NMP_HDR_SIZE])?;
            let payload_len = bytes.len() - NMP_HDR_SIZE;
            if header.len as usize != payload_len {
                return Err(Error::MalformedResponse(format!(
                    "header announces {} payload bytes, got {}",
                    header.len, payload_len
                )));
            }
            (Some(header), NMP_HDR_SIZE)
        };

        let payload = &bytes[payload_start..];
        if kind == ResponseKind::UploadAck && !scheme.is_coap() {
            if let Some((rc, off)) = fast_upload_ack(payload) {
                return Ok(Response {
                    scheme,
                    header,
                    payload_start,
                    rc,
                    group_rc: None,
                    offset: Some(off),
                    bytes,
                });
            }
        }

        let value = decode_value(payload)?;
        let header = if scheme.is_coap() {
            coap_header(&value)?
        } else {
            header
        };
        let fields = ResponseFields::from_value(&value)?;
        Ok(Response {
            scheme,
            header,
            payload_start,
            rc: fields.rc,
            group_rc: fields.group_rc,
            offset: fields.off,
            bytes,
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn header(&self) -> Option<&NmpHdr> {
        self.header.as_ref()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[self.payload_start..]
    }

    pub fn rc(&self) -> i32 {
        self.rc
    }

    pub fn group_rc(&self) -> Option<GroupReturnCode> {
        self.group_rc
    }

    pub fn is_success(&self) -> bool {
        self.rc == 0
    }

    /// Fail with `Error::Device` on a non-zero `rc` or group return code.
    pub fn check(self) -> Result<Response> {
        let group_failed = self.group_rc.map_or(false, |g| g.rc != 0);
        if !self.is_success() || group_failed {
            return Err(Error::Device {
                rc: self.rc,
                group_rc: self.group_rc,
            });
        }
        Ok(self)
    }

    /// Device-reported offset of an upload acknowledgement.
    pub fn upload_offset(&self) -> Result<u64> {
        self.offset
            .ok_or_else(|| Error::MalformedResponse("upload response without offset".to_string()))
    }

    /// Decode the payload into a typed body, ignoring unknown fields.
    pub fn body<T: DeserializeOwned>(&self) -> Result<T> {
        let value = decode_value(self.payload())?;
        serde_cbor::value::from_value(value).map_err(|e| {
            Error::MalformedResponse(format!("unexpected answer from device | {e}"))
        })
    }
}

fn decode_value(payload: &[u8]) -> Result<Value> {
    if payload.is_empty() {
        return Ok(Value::Map(Default::default()));
    }
    serde_cbor::from_slice(payload)
        .map_err(|e| Error::MalformedResponse(format!("CBOR decode failed: {e}")))
}

struct ResponseFields {
    rc: i32,
    group_rc: Option<GroupReturnCode>,
    off: Option<u64>,
}

impl ResponseFields {
    fn from_value(value: &Value) -> Result<ResponseFields> {
        let mut fields = ResponseFields {
            rc: 0,
            group_rc: None,
            off: None,
        };
        let map = match value {
            Value::Map(map) => map,
            _ => return Err(Error::MalformedResponse("payload is not a map".to_string())),
        };
        for (key, val) in map.iter() {
            match (key, val) {
                (Value::Text(k), Value::Integer(rc)) if k == "rc" => {
                    fields.rc = i32::try_from(*rc)
                        .map_err(|_| Error::MalformedResponse(format!("rc out of range: {rc}")))?;
                }
                (Value::Text(k), Value::Integer(off)) if k == "off" => {
                    fields.off = Some(u64::try_from(*off).map_err(|_| {
                        Error::MalformedResponse(format!("offset out of range: {off}"))
                    })?);
                }
                (Value::Text(k), Value::Map(err)) if k == "err" => {
                    fields.group_rc = Some(group_return_code(err)?);
                }
                _ => (),
            }
        }
        Ok(fields)
    }
}

fn group_return_code(err: &std::collections::BTreeMap<Value, Value>) -> Result<GroupReturnCode> {
    let int = |name: &str| -> Option<i128> {
        match err.get(&Value::Text(name.to_string())) {
            Some(Value::Integer(i)) => Some(*i),
            _ => None,
        }
    };
    match (int("group"), int("rc")) {
        (Some(group), Some(rc)) => Ok(GroupReturnCode {
            group: u16::try_from(group)
                .map_err(|_| Error::MalformedResponse(format!("group out of range: {group}")))?,
            rc: i32::try_from(rc)
                .map_err(|_| Error::MalformedResponse(format!("group rc out of range: {rc}")))?,
        }),
        _ => Err(Error::MalformedResponse("incomplete err map".to_string())),
    }
}

const KEY_RC: &[u8] = &[0x62, b'r', b'c'];
const KEY_OFF: &[u8] = &[0x63, b'o', b'f', b'f'];

/// Decode `{"rc": uint, "off": uint}` (either order) or `{"off": uint}`
/// straight from the byte layout. `None` means "use the full decoder".
fn fast_upload_ack(payload: &[u8]) -> Option<(i32, u64)> {
    let entries = match payload.first()? {
        0xa1 => 1,
        0xa2 => 2,
        _ => return None,
    };
    let mut pos = 1;
    let mut rc = None;
    let mut off = None;
    for _ in 0..entries {
        let rest = payload.get(pos..)?;
        if rest.starts_with(KEY_RC) && rc.is_none() {
            pos += KEY_RC.len();
            rc = Some(i32::try_from(read_uint(payload, &mut pos)?).ok()?);
        } else if rest.starts_with(KEY_OFF) && off.is_none() {
            pos += KEY_OFF.len();
            off = Some(read_uint(payload, &mut pos)?);
        } else {
            return None;
        }
    }
    if pos != payload.len() {
        return None;
    }
    Some((rc.unwrap_or(0), off?))
}

fn read_uint(bytes: &[u8], pos: &mut usize) -> Option<u64> {
    let initial = *bytes.get(*pos)?;
    *pos += 1;
    if initial >> 5 != 0 {
        return None;
    }
    let width = match initial & 0x1f {
        small @ 0..=23 => return Some(small as u64),
        24 => 1,
        25 => 2,
        26 => 4,
        27 => 8,
        _ => return None,
    };
    let raw = bytes.get(*pos..*pos + width)?;
    *pos += width;
    Some(raw.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64))
}

/// Reassembles a response delivered as several transport fragments.
#[derive(Debug)]
pub struct Reassembler {
    scheme: Scheme,
    buffer: Vec<u8>,
    expected: Option<usize>,
}

impl Reassembler {
    pub fn new(scheme: Scheme) -> Reassembler {
        Reassembler {
            scheme,
            buffer: Vec::new(),
            expected: None,
        }
    }

    /// Feed one fragment; returns the packet once all announced bytes arrived.
    pub fn push(&mut self, fragment: &[u8]) -> Result<Option<Vec<u8>>> {
        self.buffer.extend_from_slice(fragment);
        if self.expected.is_none() && self.buffer.len() >= NMP_HDR_SIZE {
            let expected = expected_length(self.scheme, &self.buffer)?;
            debug!("expected length: {}", expected);
            self.expected = Some(expected);
        }
        match self.expected {
            Some(expected) if self.buffer.len() > expected => {
                let extra = self.buffer.len() - expected;
                self.reset();
                Err(Error::MalformedResponse(format!(
                    "{extra} unexpected bytes after packet end"
                )))
            }
            Some(expected) if self.buffer.len() == expected => {
                self.expected = None;
                Ok(Some(std::mem::take(&mut self.buffer)))
            }
            _ => Ok(None),
        }
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.expected = None;
    }

    pub fn is_active(&self) -> bool {
        !self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::build_packet;
    use crate::nmp_hdr::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct OffRc {
        off: u64,
        rc: i32,
    }

    #[derive(Serialize)]
    struct OffOnly {
        off: u64,
    }

    fn response_packet<T: Serialize>(body: &T) -> Vec<u8> {
        build_packet(
            Scheme::Ble,
            NmpOp::WriteRsp,
            0,
            NmpGroup::Image.into(),
            1,
            NmpIdImage::Upload as u8,
            body,
        )
        .unwrap()
    }

    fn full_upload_ack(payload: &[u8]) -> (i32, u64) {
        let value = decode_value(payload).unwrap();
        let fields = ResponseFields::from_value(&value).unwrap();
        (fields.rc, fields.off.unwrap())
    }

    #[test]
    fn fast_path_matches_full_decoder() {
        let values: [u64; 9] = [0, 1, 23, 24, 255, 256, 65535, 65536, 1 << 33];
        for off in values {
            for rc in [0i32, 1, 6, 24, 300] {
                let payloads = [
                    serde_cbor::to_vec(&UploadAck { rc, off }).unwrap(),
                    serde_cbor::to_vec(&OffRc { off, rc }).unwrap(),
                ];
                for payload in payloads.iter() {
                    assert_eq!(fast_upload_ack(payload), Some(full_upload_ack(payload)));
                }
            }
            let payload = serde_cbor::to_vec(&OffOnly { off }).unwrap();
            assert_eq!(fast_upload_ack(&payload), Some((0, off)));
            assert_eq!(full_upload_ack(&payload), (0, off));
        }
    }

    #[test]
    fn fast_path_declines_other_shapes() {
        #[derive(Serialize)]
        struct WithMatch {
            rc: i32,
            off: u64,
            #[serde(rename = "match")]
            matched: bool,
        }
        let three = serde_cbor::to_vec(&WithMatch {
            rc: 0,
            off: 10,
            matched: true,
        })
        .unwrap();
        assert_eq!(fast_upload_ack(&three), None);

        // negative rc is not an unsigned integer
        let negative = serde_cbor::to_vec(&UploadAck { rc: -1, off: 10 }).unwrap();
        assert_eq!(fast_upload_ack(&negative), None);

        // rc without an offset
        assert_eq!(fast_upload_ack(&[0xa1, 0x62, b'r', b'c', 0x00]), None);

        // truncated
        let full = serde_cbor::to_vec(&UploadAck { rc: 0, off: 70000 }).unwrap();
        assert_eq!(fast_upload_ack(&full[..full.len() - 1]), None);
    }

    #[test]
    fn upload_ack_decodes_through_both_paths() {
        let packet = response_packet(&UploadAck { rc: 0, off: 512 });
        let fast = Response::decode(Scheme::Ble, packet.clone(), ResponseKind::UploadAck).unwrap();
        let full = Response::decode(Scheme::Ble, packet, ResponseKind::Generic).unwrap();
        assert_eq!(fast.upload_offset().unwrap(), 512);
        assert_eq!(full.upload_offset().unwrap(), 512);
        assert_eq!(fast.rc(), full.rc());
        assert_eq!(fast.header(), full.header());
    }

    #[test]
    fn decode_is_idempotent() {
        let packet = response_packet(&ImageStateRsp {
            images: vec![ImageSlot {
                slot: 1,
                hash: vec![1, 2, 3],
                pending: true,
                ..Default::default()
            }],
            split_status: None,
        });
        let a = Response::decode(Scheme::Ble, packet.clone(), ResponseKind::Generic).unwrap();
        let b = Response::decode(Scheme::Ble, packet, ResponseKind::Generic).unwrap();
        assert_eq!(a, b);
        let state: ImageStateRsp = a.body().unwrap();
        assert!(state.images[0].pending);
    }

    #[test]
    fn rc_and_group_errors_surface() {
        #[derive(Serialize)]
        struct GroupErr {
            group: u16,
            rc: i32,
        }
        #[derive(Serialize)]
        struct V2 {
            err: GroupErr,
        }
        let rsp = Response::decode(
            Scheme::Udp,
            response_packet(&V2 {
                err: GroupErr { group: 1, rc: 3 },
            }),
            ResponseKind::Generic,
        )
        .unwrap();
        assert!(rsp.is_success());
        assert_eq!(rsp.group_rc(), Some(GroupReturnCode { group: 1, rc: 3 }));
        assert!(matches!(
            rsp.check(),
            Err(Error::Device {
                rc: 0,
                group_rc: Some(GroupReturnCode { group: 1, rc: 3 })
            })
        ));

        let rsp = Response::decode(
            Scheme::Udp,
            response_packet(&UploadAck { rc: 8, off: 0 }),
            ResponseKind::Generic,
        )
        .unwrap();
        assert!(!rsp.is_success());
        assert_eq!(rsp.check().unwrap_err().return_code(), Some(crate::error::ReturnCode::NotSupported));
    }

    #[test]
    fn short_or_inconsistent_packets_fail() {
        assert!(matches!(
            Response::decode(Scheme::Ble, vec![1, 0, 0], ResponseKind::Generic),
            Err(Error::MalformedResponse(_))
        ));
        let mut packet = response_packet(&UploadAck { rc: 0, off: 1 });
        packet.push(0);
        assert!(Response::decode(Scheme::Ble, packet, ResponseKind::Generic).is_err());
        let mut garbage = NmpHdr::new_req(NmpOp::ReadRsp, 0u16, 0u8);
        garbage.len = 2;
        let mut packet = garbage.serialize().to_vec();
        packet.extend_from_slice(&[0xff, 0xff]);
        assert!(matches!(
            Response::decode(Scheme::Ble, packet, ResponseKind::Generic),
            Err(Error::MalformedResponse(_))
        ));
    }

    #[test]
    fn coap_response_reads_embedded_header() {
        let packet = build_packet(
            Scheme::CoapBle,
            NmpOp::ReadRsp,
            0,
            NmpGroup::Default.into(),
            5,
            NmpIdDef::Echo as u8,
            &EchoRsp {
                r: "hi".to_string(),
            },
        )
        .unwrap();
        let rsp = Response::decode(Scheme::CoapBle, packet, ResponseKind::UploadAck).unwrap();
        assert_eq!(rsp.header().unwrap().seq, 5);
        let echo: EchoRsp = rsp.body().unwrap();
        assert_eq!(echo.r, "hi");
    }

    #[test]
    fn reassembler_joins_fragments() {
        let packet = response_packet(&UploadAck { rc: 0, off: 4096 });
        let mut r = Reassembler::new(Scheme::Ble);
        assert_eq!(r.push(&packet[..3]).unwrap(), None);
        assert!(r.is_active());
        assert_eq!(r.push(&packet[3..9]).unwrap(), None);
        let done = r.push(&packet[9..]).unwrap().unwrap();
        assert_eq!(done, packet);
        assert!(!r.is_active());

        let mut too_long = packet.clone();
        too_long.push(0);
        assert!(r.push(&too_long).is_err());
        assert!(!r.is_active());
    }
}
