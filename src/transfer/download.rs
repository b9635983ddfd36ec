// Copyright © 2026 Rudis Laboratories LLC

use serde::Deserialize;

use super::{ChunkReader, Transfer};
use crate::error::{Error, Result};
use crate::manager::check_answer;
use crate::response::{Response, ResponseKind};

#[derive(Debug, Deserialize)]
struct DownloadChunk {
    off: u64,
    #[serde(with = "serde_bytes")]
    data: Vec<u8>,
    #[serde(default)]
    len: Option<u64>,
}

/// Largest file length a device may announce.
const MAX_DOWNLOAD_LEN: u64 = u32::MAX as u64;

/// Zeroed buffer for an announced length, refusing lengths no device can hold.
fn allocate(len: u64) -> Result<Vec<u8>> {
    let malformed = || Error::MalformedResponse(format!("announced length {len} is not plausible"));
    if len > MAX_DOWNLOAD_LEN {
        return Err(malformed());
    }
    let len = usize::try_from(len).map_err(|_| malformed())?;
    let mut buffer = Vec::new();
    buffer.try_reserve_exact(len).map_err(|_| malformed())?;
    buffer.resize(len, 0);
    Ok(buffer)
}

/// One-request-at-a-time download. The buffer is sized from the length
/// announced in the first response.
pub struct Download<'a> {
    reader: &'a dyn ChunkReader,
    buffer: Option<Vec<u8>>,
    offset: usize,
}

impl<'a> Download<'a> {
    pub fn new(reader: &'a dyn ChunkReader) -> Self {
        Download {
            reader,
            buffer: None,
            offset: 0,
        }
    }

    pub fn into_data(self) -> Result<Vec<u8>> {
        match self.buffer {
            Some(buffer) if self.offset == buffer.len() => Ok(buffer),
            _ => Err(Error::InvalidArgument("download not finished".to_string())),
        }
    }
}

impl Transfer for Download<'_> {
    fn offset(&self) -> usize {
        self.offset
    }

    fn len(&self) -> Option<usize> {
        self.buffer.as_ref().map(Vec::len)
    }

    fn send(&mut self, offset: usize) -> Result<Response> {
        let packet = self.reader.read_packet(offset)?;
        let transport = self.reader.transport();
        let rsp = transport.send(&packet, ResponseKind::Generic)?;
        check_answer(transport.scheme(), &packet, &rsp)?;
        let rsp = rsp.check()?;
        let chunk: DownloadChunk = rsp.body()?;

        if self.buffer.is_none() {
            let len = chunk.len.ok_or_else(|| {
                Error::MalformedResponse("first chunk does not announce a length".to_string())
            })?;
            self.buffer = Some(allocate(len)?);
        }
        let buffer = self.buffer.as_mut().ok_or_else(|| {
            Error::MalformedResponse("download buffer missing".to_string())
        })?;

        let start = usize::try_from(chunk.off)
            .ok()
            .filter(|&off| off <= buffer.len())
            .ok_or_else(|| {
                Error::MalformedResponse(format!(
                    "chunk offset {} beyond length {}",
                    chunk.off,
                    buffer.len()
                ))
            })?;
        let end = start
            .checked_add(chunk.data.len())
            .filter(|&end| end <= buffer.len())
            .ok_or_else(|| {
                Error::MalformedResponse(format!(
                    "chunk of {} bytes at {start} exceeds length {}",
                    chunk.data.len(),
                    buffer.len()
                ))
            })?;
        if chunk.data.is_empty() && end < buffer.len() {
            return Err(Error::MalformedResponse(format!(
                "empty chunk at offset {start} before end of data"
            )));
        }
        buffer[start..end].copy_from_slice(&chunk.data);
        self.offset = end;
        Ok(rsp)
    }
}
