// Copyright © 2026 Rudis Laboratories LLC

//! Pipelined upload with up to N requests in flight.
//!
//! Every request is tagged with the generation it was issued in. When the
//! device reports an offset other than the one a request should have
//! produced, everything issued after that point is void: the generation
//! is bumped, acknowledgements from older generations are dropped, and
//! issuing resumes at the reported offset.

use log::{debug, warn};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{chunk_len, ChunkWriter, Progress, TransferController, TransferState, MAX_STALLED_RESYNCS};
use crate::envelope::packet_header;
use crate::error::{Error, Result};
use crate::nmp_hdr::NmpHdr;
use crate::response::{Response, ResponseKind};

/// How often a waiting uploader rechecks for pause and cancel.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

struct Ack {
    generation: u64,
    offset: usize,
    len: usize,
    request: NmpHdr,
    result: Result<Response>,
}

pub struct WindowUpload<'a> {
    writer: &'a dyn ChunkWriter,
    data: Arc<[u8]>,
    capacity: usize,
    mtu: usize,
    alignment: usize,
}

impl<'a> WindowUpload<'a> {
    pub fn new(
        writer: &'a dyn ChunkWriter,
        data: Arc<[u8]>,
        capacity: usize,
        mtu: usize,
        alignment: usize,
    ) -> Self {
        WindowUpload {
            writer,
            data,
            capacity: capacity.max(1),
            mtu,
            alignment,
        }
    }

    pub fn run(&self, controller: &TransferController, progress: &mut Progress<'_>) -> Result<()> {
        controller.begin()?;
        let total = self.data.len();
        let transport = self.writer.transport();
        let scheme = transport.scheme();
        let (tx, rx) = mpsc::channel::<Ack>();

        let mut generation = 0u64;
        let mut next = 0usize;
        let mut acked = 0usize;
        let mut in_flight = 0usize;
        let mut stalled = 0u32;
        let mut was_paused = false;

        while acked < total {
            controller.check_canceled()?;
            let state = controller.state();

            if state == TransferState::Paused {
                was_paused = true;
            } else if was_paused {
                // anything issued before the pause may have been overtaken
                was_paused = false;
                generation += 1;
                next = acked;
            }

            if state == TransferState::Transfer {
                if next >= total && in_flight == 0 {
                    // the tail was issued in a generation that got dropped
                    generation += 1;
                    next = acked;
                }
                while in_flight < self.capacity && next < total {
                    let len = chunk_len(self.writer, &self.data, next, self.mtu, self.alignment)?;
                    let packet = self.writer.chunk_packet(&self.data, next, len)?;
                    let request = packet_header(scheme, &packet)?;
                    let tx = tx.clone();
                    let (gen, offset) = (generation, next);
                    transport.send_async(
                        packet,
                        ResponseKind::UploadAck,
                        Box::new(move |result| {
                            // the uploader may be gone; its late acks are moot
                            let _ = tx.send(Ack {
                                generation: gen,
                                offset,
                                len,
                                request,
                                result,
                            });
                        }),
                    );
                    in_flight += 1;
                    next += len;
                }
            }

            if in_flight == 0 {
                if state == TransferState::Paused {
                    controller.wait_while_paused()?;
                }
                continue;
            }

            let ack = match rx.recv_timeout(POLL_INTERVAL) {
                Ok(ack) => ack,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::Transport("acknowledgement channel closed".to_string()))
                }
            };
            in_flight -= 1;
            if ack.generation != generation {
                debug!(
                    "dropping ack for {}..{} from generation {}",
                    ack.offset,
                    ack.offset + ack.len,
                    ack.generation
                );
                continue;
            }

            let rsp = ack.result?;
            if let Some(header) = rsp.header() {
                if !ack.request.matches_response(header) {
                    return Err(Error::MalformedResponse(format!(
                        "response {header:?} does not answer request {:?}",
                        ack.request
                    )));
                }
            }
            let off = rsp.check()?.upload_offset()? as usize;
            if off > total {
                return Err(Error::MalformedResponse(format!(
                    "device acknowledged offset {off} beyond length {total}"
                )));
            }

            let expected = ack.offset + ack.len;
            if off != expected {
                warn!(
                    "device at offset {} after chunk {}..{}, resuming from {}",
                    off, ack.offset, expected, off
                );
                if off <= acked {
                    stalled += 1;
                    if stalled > MAX_STALLED_RESYNCS {
                        return Err(Error::MalformedResponse(format!(
                            "device stuck at offset {off}"
                        )));
                    }
                } else {
                    stalled = 0;
                }
                generation += 1;
                next = off;
            } else {
                stalled = 0;
            }

            if off != acked {
                acked = off;
                progress(acked, total, Instant::now());
            }
        }

        controller.close();
        Ok(())
    }
}
