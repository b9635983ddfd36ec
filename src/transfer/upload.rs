// Copyright © 2026 Rudis Laboratories LLC

use log::debug;
use std::sync::Arc;

use super::{chunk_len, ChunkWriter, Transfer};
use crate::error::{Error, Result};
use crate::manager::check_answer;
use crate::response::{Response, ResponseKind};

/// One-request-at-a-time upload.
pub struct Upload<'a> {
    writer: &'a dyn ChunkWriter,
    data: Arc<[u8]>,
    offset: usize,
    mtu: usize,
    alignment: usize,
}

impl<'a> Upload<'a> {
    pub fn new(writer: &'a dyn ChunkWriter, data: Arc<[u8]>, mtu: usize, alignment: usize) -> Self {
        Upload {
            writer,
            data,
            offset: 0,
            mtu,
            alignment,
        }
    }
}

impl Transfer for Upload<'_> {
    fn offset(&self) -> usize {
        self.offset
    }

    fn len(&self) -> Option<usize> {
        Some(self.data.len())
    }

    fn send(&mut self, offset: usize) -> Result<Response> {
        let len = chunk_len(self.writer, &self.data, offset, self.mtu, self.alignment)?;
        let packet = self.writer.chunk_packet(&self.data, offset, len)?;
        let transport = self.writer.transport();
        let rsp = transport.send(&packet, ResponseKind::UploadAck)?;
        check_answer(transport.scheme(), &packet, &rsp)?;
        let rsp = rsp.check()?;

        let off = rsp.upload_offset()? as usize;
        if off > self.data.len() {
            return Err(Error::MalformedResponse(format!(
                "device acknowledged offset {off} beyond length {}",
                self.data.len()
            )));
        }
        if off != offset + len {
            debug!("sent {}..{}, device is at {}", offset, offset + len, off);
        }
        self.offset = off;
        Ok(rsp)
    }
}
