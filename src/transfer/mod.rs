// Copyright © 2026 Rudis Laboratories LLC

//! Chunked image and file transfers.
//!
//! An upload splits its data into chunks sized to the transport MTU and
//! advances to whatever offset the device acknowledges. Uploads run one
//! request at a time ([`upload::Upload`]) or keep a window of requests in
//! flight ([`window::WindowUpload`]). Downloads run one request at a time.

pub mod controller;
pub mod download;
pub mod mtu;
pub mod upload;
pub mod window;

use log::{info, warn};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

pub use controller::{TransferController, TransferState};

use crate::envelope::Scheme;
use crate::error::{Error, Result};
use crate::response::Response;
use crate::transport::Transport;

/// Consecutive acknowledgements without progress before a transfer gives up.
pub const MAX_STALLED_RESYNCS: u32 = 8;

/// Progress sink: `(bytes done, total bytes, when)`.
pub type Progress<'a> = dyn FnMut(usize, usize, Instant) + Send + 'a;

/// Builds the request packets of an upload.
pub trait ChunkWriter: Send + Sync {
    fn transport(&self) -> &Arc<dyn Transport>;

    /// Request carrying `data[offset..offset + len]`.
    fn chunk_packet(&self, data: &[u8], offset: usize, len: usize) -> Result<Vec<u8>>;
}

/// Builds the request packets of a download.
pub trait ChunkReader: Send + Sync {
    fn transport(&self) -> &Arc<dyn Transport>;

    fn read_packet(&self, offset: usize) -> Result<Vec<u8>>;
}

/// Step-wise transfer driven by [`run`].
pub trait Transfer {
    fn offset(&self) -> usize;

    /// Total length; unknown for a download until the first response.
    fn len(&self) -> Option<usize>;

    fn is_finished(&self) -> bool {
        self.len().map_or(false, |len| self.offset() == len)
    }

    /// Exchange the chunk at `offset` and advance by the device's answer.
    fn send(&mut self, offset: usize) -> Result<Response>;
}

/// Tuning for uploads.
#[derive(Debug, Clone, Copy)]
pub struct UploadOptions {
    /// Requests in flight; 1 selects the one-at-a-time uploader.
    pub window_capacity: usize,
    /// Non-final chunks are a multiple of this many bytes.
    pub memory_alignment: usize,
}

impl Default for UploadOptions {
    fn default() -> Self {
        UploadOptions {
            window_capacity: 1,
            memory_alignment: 1,
        }
    }
}

/// Length in bytes of the CBOR head of a byte string holding `len` bytes.
fn bstr_head_len(len: usize) -> usize {
    match len {
        0..=23 => 1,
        24..=0xff => 2,
        0x100..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

/// Largest chunk at `offset` whose request fits `mtu`.
///
/// The request is first built with an empty chunk to learn the fixed
/// overhead. Chunks other than the last are aligned down to `alignment`.
pub fn chunk_len(
    writer: &dyn ChunkWriter,
    data: &[u8],
    offset: usize,
    mtu: usize,
    alignment: usize,
) -> Result<usize> {
    let remaining = data.len() - offset;
    let scheme: Scheme = writer.transport().scheme();
    // the empty request already holds a one-byte bstr head
    let fixed = writer.chunk_packet(data, offset, 0)?.len() + scheme.framing_overhead() - 1;
    let room = mtu.saturating_sub(fixed);
    let mut len = room.saturating_sub(bstr_head_len(room));
    // a shorter head at a size boundary can leave room for one more byte
    while len + 1 + bstr_head_len(len + 1) <= room {
        len += 1;
    }
    let mut len = len.min(remaining);
    if len < remaining {
        len -= len % alignment.max(1);
    }
    if len == 0 && remaining > 0 {
        let unit = alignment.max(1).min(remaining);
        return Err(Error::InsufficientMtu {
            required: fixed + bstr_head_len(unit) + unit,
            mtu,
        });
    }
    Ok(len)
}

/// Drive `transfer` to completion, honoring pause and cancel.
///
/// The controller is closed on success only; on failure the caller
/// decides whether to retry or close.
pub fn run(
    transfer: &mut dyn Transfer,
    controller: &TransferController,
    progress: &mut Progress<'_>,
) -> Result<()> {
    controller.begin()?;
    let mut stalled = 0;
    while !transfer.is_finished() {
        controller.wait_while_paused()?;
        let offset = transfer.offset();
        transfer.send(offset)?;
        controller.check_canceled()?;
        if transfer.offset() == offset {
            stalled += 1;
            if stalled > MAX_STALLED_RESYNCS {
                return Err(Error::MalformedResponse(format!(
                    "device stuck at offset {offset}"
                )));
            }
        } else {
            stalled = 0;
        }
        progress(transfer.offset(), transfer.len().unwrap_or(0), Instant::now());
    }
    controller.close();
    Ok(())
}

/// Upload `data` with the chunk encoding of `writer`.
///
/// Selects the windowed uploader for capacities above one and restarts
/// once with a smaller MTU if the link rejects a packet as too large.
pub fn upload(
    writer: &dyn ChunkWriter,
    data: Arc<[u8]>,
    options: UploadOptions,
    controller: &TransferController,
    progress: &mut Progress<'_>,
) -> Result<()> {
    if data.is_empty() {
        return Err(Error::InvalidArgument("nothing to upload".to_string()));
    }
    let started = Instant::now();
    let capacity = options.window_capacity.max(1);
    let alignment = options.memory_alignment.max(1);
    mtu::with_mtu_retry(writer.transport().mtu(), |mtu| {
        if capacity > 1 {
            window::WindowUpload::new(writer, data.clone(), capacity, mtu, alignment)
                .run(controller, &mut *progress)
        } else {
            let mut transfer = upload::Upload::new(writer, data.clone(), mtu, alignment);
            run(&mut transfer, controller, &mut *progress)
        }
    })?;
    let elapsed = started.elapsed().as_secs_f64();
    if elapsed > 0.0 {
        info!(
            "uploaded {} bytes in {:.1}s ({:.1} KiB/s)",
            data.len(),
            elapsed,
            data.len() as f64 / 1024.0 / elapsed
        );
    }
    Ok(())
}

/// Terminal and progress notifications of a background transfer.
pub trait TransferCallback<T>: Send {
    fn on_progress(&mut self, _current: usize, _total: usize, _timestamp: Instant) {}
    fn on_completed(&mut self, result: T);
    fn on_failed(&mut self, error: Error);
    /// Called only when a cancel stops the transfer before it ends. A
    /// cancel after completion or failure changes nothing and is not reported.
    fn on_canceled(&mut self);
}

/// Run `job` on its own thread, reporting exactly one terminal callback.
pub fn spawn<T, F, C>(
    controller: Arc<TransferController>,
    job: F,
    mut callback: C,
) -> Result<JoinHandle<()>>
where
    T: Send + 'static,
    F: FnOnce(&TransferController, &mut Progress<'_>) -> Result<T> + Send + 'static,
    C: TransferCallback<T> + 'static,
{
    let handle = thread::Builder::new()
        .name("smp-transfer".to_string())
        .spawn(move || {
            let result = job(&controller, &mut |current, total, at| {
                callback.on_progress(current, total, at)
            });
            match result {
                Ok(value) => callback.on_completed(value),
                Err(Error::Aborted) => callback.on_canceled(),
                Err(e) => {
                    warn!("transfer failed: {}", e);
                    controller.close();
                    callback.on_failed(e)
                }
            }
        })?;
    Ok(handle)
}
