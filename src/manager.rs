// Copyright © 2026 Rudis Laboratories LLC

use log::{debug, log_enabled, Level};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::envelope::{build_packet, packet_header, Scheme};
use crate::error::{Error, Result};
use crate::nmp_hdr::*;
use crate::response::{Response, ResponseKind};
use crate::transport::{next_seq_id, ResponseCallback, Transport};

/// Payload for commands that take no arguments.
pub fn empty_request() -> BTreeMap<String, String> {
    BTreeMap::new()
}

/// Verify that `rsp` answers the request `packet`.
pub fn check_answer(scheme: Scheme, packet: &[u8], rsp: &Response) -> Result<()> {
    let request = packet_header(scheme, packet)?;
    match rsp.header() {
        Some(header) if request.matches_response(header) => Ok(()),
        Some(header) => Err(Error::MalformedResponse(format!(
            "wrong answer types: request {request:?}, response {header:?}"
        ))),
        // CoAP responses may omit the embedded header
        None => Ok(()),
    }
}

/// Sends commands of one management group over a shared transport.
#[derive(Clone)]
pub struct SmpManager {
    transport: Arc<dyn Transport>,
    group: u16,
}

impl SmpManager {
    pub fn new(transport: Arc<dyn Transport>, group: impl Into<u16>) -> SmpManager {
        SmpManager {
            transport,
            group: group.into(),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn scheme(&self) -> Scheme {
        self.transport.scheme()
    }

    pub fn group(&self) -> u16 {
        self.group
    }

    /// Build a request packet with a fresh sequence number.
    pub fn build<T: Serialize>(&self, op: NmpOp, id: impl NmpId, payload: &T) -> Result<Vec<u8>> {
        build_packet(
            self.scheme(),
            op,
            0,
            self.group,
            next_seq_id(),
            id.to_u8(),
            payload,
        )
    }

    /// Send a command and fail on any device-reported error.
    pub fn send<T: Serialize>(
        &self,
        op: NmpOp,
        id: impl NmpId,
        payload: &T,
        kind: ResponseKind,
    ) -> Result<Response> {
        let packet = self.build(op, id, payload)?;
        self.send_packet(&packet, kind)
    }

    pub fn send_packet(&self, packet: &[u8], kind: ResponseKind) -> Result<Response> {
        let rsp = self.transport.send(packet, kind)?;
        check_answer(self.scheme(), packet, &rsp)?;
        log_response(&rsp);
        rsp.check()
    }

    /// Send a command and decode its typed response body.
    pub fn request<T: Serialize, R: DeserializeOwned>(
        &self,
        op: NmpOp,
        id: impl NmpId,
        payload: &T,
    ) -> Result<R> {
        self.send(op, id, payload, ResponseKind::Generic)?.body()
    }

    pub fn send_async<T: Serialize>(
        &self,
        op: NmpOp,
        id: impl NmpId,
        payload: &T,
        kind: ResponseKind,
        callback: ResponseCallback,
    ) {
        let packet = match self.build(op, id, payload) {
            Ok(p) => p,
            Err(e) => return callback(Err(e)),
        };
        let scheme = self.scheme();
        let request = packet.clone();
        self.transport.send_async(
            packet,
            kind,
            Box::new(move |result| {
                callback(result.and_then(|rsp| {
                    check_answer(scheme, &request, &rsp)?;
                    log_response(&rsp);
                    rsp.check()
                }))
            }),
        );
    }
}

fn log_response(rsp: &Response) {
    if !log_enabled!(Level::Debug) {
        return;
    }
    match rsp.body::<serde_cbor::Value>() {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(json) => debug!("response_body: {}", json),
            Err(_) => debug!("response_body: {:?}", value),
        },
        Err(_) => debug!("response bytes: {}", hex::encode(rsp.bytes())),
    }
}
