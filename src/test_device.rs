// Copyright © 2026 Rudis Laboratories LLC

//! In-memory SMP server used by the unit tests.
//!
//! Answers the command groups the client speaks with plausible device
//! behaviour: a two-slot image store with MCUboot-style swap on reset,
//! a tiny file system, logs, stats and settings. Faults can be injected
//! per command, and the upload path can reorder or swallow requests to
//! exercise the windowed uploader.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_cbor::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::Duration;

use crate::envelope::{build_packet, Scheme};
use crate::error::{Error, Result, ReturnCode};
use crate::mcuboot::McuBootImage;
use crate::nmp_hdr::*;
use crate::response::{Response, ResponseKind};
use crate::transport::{ConnectCallback, ConnectionObserver, ObserverList, ResponseCallback, Transport};

/// Largest chunk returned by a file download.
const DOWNLOAD_CHUNK: usize = 64;

/// Entries returned per log show request.
const LOG_PAGE: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub op: NmpOp,
    pub group: u16,
    pub id: u8,
}

struct ImageUpload {
    image: u32,
    len: usize,
    data: Vec<u8>,
}

struct LogStore {
    name: String,
    entries: Vec<(u64, String)>,
}

struct State {
    connected: bool,
    mtu: usize,
    link_mtu: Option<usize>,
    mtu_rejections: usize,
    bootloader_mode: Option<i32>,
    reset_count: usize,
    failures: HashMap<(u16, u8), ReturnCode>,
    commands: Vec<Command>,
    slots: Vec<ImageSlot>,
    upload: Option<ImageUpload>,
    upload_offset_skew: usize,
    upload_arrivals: usize,
    swap_upload_at: Option<usize>,
    drop_upload_at: Option<usize>,
    issued_upload_offsets: Vec<usize>,
    rejected_upload_offsets: Vec<usize>,
    in_flight: usize,
    max_in_flight: usize,
    files: HashMap<String, Vec<u8>>,
    settings: HashMap<String, Vec<u8>>,
    logs: Vec<LogStore>,
    next_log_index: u64,
    download_reply: Option<Value>,
}

struct Job {
    packet: Vec<u8>,
    kind: ResponseKind,
    upload_index: Option<usize>,
    callback: ResponseCallback,
}

/// What a request does to the link once its answer is out.
enum Effect {
    None,
    Disconnect,
}

type Reply = std::result::Result<Value, ReturnCode>;

pub struct TestDevice {
    state: Mutex<State>,
    observers: ObserverList,
    jobs: Mutex<Option<mpsc::Sender<Job>>>,
    delay: Duration,
}

fn to_value<T: Serialize>(body: &T) -> Value {
    serde_cbor::value::to_value(body).unwrap()
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> std::result::Result<T, ReturnCode> {
    serde_cbor::from_slice(body).map_err(|_| ReturnCode::InValue)
}

fn ok() -> Reply {
    Ok(Value::Map(BTreeMap::new()))
}

fn factory_slot() -> ImageSlot {
    ImageSlot {
        image_index: 0,
        slot: 0,
        version: "1.0.0".to_string(),
        hash: Sha256::digest(b"factory image").to_vec(),
        bootable: true,
        active: true,
        confirmed: true,
        ..Default::default()
    }
}

impl TestDevice {
    /// A device answering every request on the caller's thread.
    pub fn new() -> Arc<TestDevice> {
        Arc::new(TestDevice::build(Duration::ZERO))
    }

    /// A device answering asynchronous requests from a worker thread,
    /// each after `delay`, so several can be in flight.
    pub fn with_async_delivery(delay: Duration) -> Arc<TestDevice> {
        let device = Arc::new(TestDevice::build(delay));
        let (tx, rx) = mpsc::channel::<Job>();
        *device.jobs.lock().unwrap() = Some(tx);
        let weak = Arc::downgrade(&device);
        thread::spawn(move || worker(weak, rx));
        device
    }

    fn build(delay: Duration) -> TestDevice {
        TestDevice {
            state: Mutex::new(State {
                connected: true,
                mtu: 1024,
                link_mtu: None,
                mtu_rejections: 0,
                bootloader_mode: None,
                reset_count: 0,
                failures: HashMap::new(),
                commands: Vec::new(),
                slots: vec![factory_slot()],
                upload: None,
                upload_offset_skew: 0,
                upload_arrivals: 0,
                swap_upload_at: None,
                drop_upload_at: None,
                issued_upload_offsets: Vec::new(),
                rejected_upload_offsets: Vec::new(),
                in_flight: 0,
                max_in_flight: 0,
                files: HashMap::new(),
                settings: HashMap::new(),
                logs: Vec::new(),
                next_log_index: 0,
                download_reply: None,
            }),
            observers: ObserverList::default(),
            jobs: Mutex::new(None),
            delay,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // knobs

    /// `None` answers bootloader info with NotSupported.
    pub fn set_bootloader_mode(&self, mode: Option<i32>) {
        self.lock().bootloader_mode = mode;
    }

    /// Answer every `group`/`id` request with `rc` from now on.
    pub fn fail_command(&self, group: NmpGroup, id: u8, rc: ReturnCode) {
        self.lock().failures.insert((group as u16, id), rc);
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// MTU reported to the client.
    pub fn set_mtu(&self, mtu: usize) {
        self.lock().mtu = mtu;
    }

    /// Real packet limit of the link; larger packets are refused.
    pub fn set_link_mtu(&self, mtu: Option<usize>) {
        self.lock().link_mtu = mtu;
    }

    /// Report upload offsets this many bytes past the real one.
    pub fn set_upload_offset_skew(&self, skew: usize) {
        self.lock().upload_offset_skew = skew;
    }

    /// Process the upload request arriving after the `index`th one first.
    /// The held request waits for that one without a timeout, so arm this
    /// only for windowed uploads that issue past `index`.
    pub fn swap_upload_requests_at(&self, index: usize) {
        self.lock().swap_upload_at = Some(index);
    }

    /// Acknowledge the `index`th upload request without writing it.
    pub fn drop_upload_request_at(&self, index: usize) {
        self.lock().drop_upload_at = Some(index);
    }

    pub fn clear_upload(&self) {
        self.lock().upload = None;
    }

    /// Replace or add the slot with the same image and slot number.
    pub fn set_slot(&self, slot: ImageSlot) {
        let mut state = self.lock();
        state
            .slots
            .retain(|s| !(s.image_index == slot.image_index && s.slot == slot.slot));
        state.slots.push(slot);
    }

    /// Answer every file download request with `reply` as is.
    pub fn answer_downloads_with(&self, reply: Value) {
        self.lock().download_reply = Some(reply);
    }

    pub fn put_file(&self, path: &str, data: &[u8]) {
        self.lock().files.insert(path.to_string(), data.to_vec());
    }

    pub fn add_log_entries(&self, name: &str, messages: &[&str]) {
        let mut state = self.lock();
        let mut index = state.next_log_index;
        let entries: Vec<(u64, String)> = messages
            .iter()
            .map(|m| {
                index += 1;
                (index - 1, m.to_string())
            })
            .collect();
        state.next_log_index = index;
        match state.logs.iter_mut().find(|l| l.name == name) {
            Some(log) => log.entries.extend(entries),
            None => state.logs.push(LogStore {
                name: name.to_string(),
                entries,
            }),
        }
    }

    // observations

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn reset_count(&self) -> usize {
        self.lock().reset_count
    }

    pub fn commands(&self) -> Vec<Command> {
        self.lock().commands.clone()
    }

    pub fn mtu_rejections(&self) -> usize {
        self.lock().mtu_rejections
    }

    pub fn max_in_flight(&self) -> usize {
        self.lock().max_in_flight
    }

    pub fn issued_upload_offsets(&self) -> Vec<usize> {
        self.lock().issued_upload_offsets.clone()
    }

    pub fn rejected_upload_offsets(&self) -> Vec<usize> {
        self.lock().rejected_upload_offsets.clone()
    }

    /// The image received for `image`, once complete.
    pub fn uploaded_image(&self, image: u32) -> Option<Vec<u8>> {
        match &self.lock().upload {
            Some(u) if u.image == image && u.data.len() == u.len => Some(u.data.clone()),
            _ => None,
        }
    }

    pub fn uploaded_len(&self, image: u32) -> usize {
        match &self.lock().upload {
            Some(u) if u.image == image => u.data.len(),
            _ => 0,
        }
    }

    pub fn slot(&self, image: u32, slot: u32) -> Option<ImageSlot> {
        self.lock()
            .slots
            .iter()
            .find(|s| s.image_index == image && s.slot == slot)
            .cloned()
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(path).cloned()
    }

    // request path

    /// Link checks and bookkeeping done when a request is handed over.
    fn accept(&self, packet: &[u8]) -> Result<Option<usize>> {
        let mut state = self.lock();
        if let Some(link) = state.link_mtu {
            if packet.len() > link {
                state.mtu_rejections += 1;
                return Err(Error::InsufficientMtu {
                    required: packet.len(),
                    mtu: link,
                });
            }
        }
        let header = NmpHdr::parse(&packet[..NMP_HDR_SIZE])?;
        if header.group != NmpGroup::Image as u16 || header.id != NmpIdImage::Upload as u8 {
            return Ok(None);
        }
        let req: ImageUploadReq = serde_cbor::from_slice(&packet[NMP_HDR_SIZE..])?;
        state.issued_upload_offsets.push(req.off as usize);
        let index = state.upload_arrivals;
        state.upload_arrivals += 1;
        Ok(Some(index))
    }

    fn process(&self, packet: &[u8], kind: ResponseKind, upload_index: Option<usize>) -> Result<Response> {
        if !self.is_connected() {
            self.lock().connected = true;
            self.observers.notify_connected();
        }
        let header = NmpHdr::parse(&packet[..NMP_HDR_SIZE])?;
        let body = &packet[NMP_HDR_SIZE..];

        let (reply, effect) = {
            let mut state = self.lock();
            state.commands.push(Command {
                op: header.op,
                group: header.group,
                id: header.id,
            });
            match state.failures.get(&(header.group, header.id)) {
                Some(rc) => (Err(*rc), Effect::None),
                None => state.dispatch(&header, body, upload_index),
            }
        };

        let value = match reply {
            Ok(value) => value,
            Err(rc) => {
                let mut map = BTreeMap::new();
                map.insert(Value::Text("rc".to_string()), Value::Integer(rc as i128));
                Value::Map(map)
            }
        };
        let bytes = build_packet(
            Scheme::Ble,
            header.op.response(),
            0,
            header.group,
            header.seq,
            header.id,
            &value,
        )?;

        if let Effect::Disconnect = effect {
            self.lock().connected = false;
            self.observers.notify_disconnected();
        }
        Response::decode(Scheme::Ble, bytes, kind)
    }

    fn deliver(&self, job: Job) {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        let result = self.process(&job.packet, job.kind, job.upload_index);
        self.lock().in_flight -= 1;
        (job.callback)(result);
    }

    fn holds(&self, job: &Job) -> bool {
        let state = self.lock();
        job.upload_index.is_some() && job.upload_index == state.swap_upload_at
    }
}

fn worker(weak: Weak<TestDevice>, rx: mpsc::Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        let Some(device) = weak.upgrade() else {
            break;
        };
        if !device.holds(&job) {
            device.deliver(job);
            continue;
        }
        // the device owns the sender, so it must not be kept alive while waiting
        drop(device);
        let next = rx.recv();
        let Some(device) = weak.upgrade() else {
            break;
        };
        if let Ok(next) = next {
            device.deliver(next);
        }
        device.deliver(job);
    }
}

impl State {
    fn dispatch(&mut self, header: &NmpHdr, body: &[u8], upload_index: Option<usize>) -> (Reply, Effect) {
        let write = header.op == NmpOp::Write;
        let reply = match (NmpGroup::from_u16(header.group), header.id) {
            (Some(NmpGroup::Default), 0) => decode::<EchoReq>(body).map(|r| to_value(&EchoRsp { r: r.d })),
            (Some(NmpGroup::Default), 2) => Ok(self.task_stat()),
            (Some(NmpGroup::Default), 5) => return (self.reset(), Effect::Disconnect),
            (Some(NmpGroup::Default), 6) => Ok(to_value(&McumgrParamsRsp {
                buf_size: 2048,
                buf_count: 4,
            })),
            (Some(NmpGroup::Default), 7) => Ok(to_value(&OsInfoRsp {
                output: "Zephyr".to_string(),
            })),
            (Some(NmpGroup::Default), 8) => self.bootloader_info(),
            (Some(NmpGroup::Image), 0) if write => decode(body).and_then(|r| self.image_state(r)),
            (Some(NmpGroup::Image), 0) => Ok(self.image_list()),
            (Some(NmpGroup::Image), 1) => decode(body).and_then(|r| self.image_upload(r, upload_index)),
            (Some(NmpGroup::Image), 5) => decode(body).and_then(|r| self.image_erase(r)),
            (Some(NmpGroup::Stat), 0) => decode(body).and_then(|r| self.stat_read(r)),
            (Some(NmpGroup::Stat), 1) => Ok(to_value(&StatListRsp {
                stat_list: vec!["smp_svr_stats".to_string()],
            })),
            (Some(NmpGroup::Config), 0) if write => decode(body).map(|r: SettingsWriteReq| {
                self.settings.insert(r.name, r.val);
                Value::Map(BTreeMap::new())
            }),
            (Some(NmpGroup::Config), 0) => decode(body).and_then(|r: SettingsReadReq| {
                let val = self.settings.get(&r.name).cloned().ok_or(ReturnCode::NoEntry)?;
                Ok(to_value(&SettingsReadRsp { val }))
            }),
            (Some(NmpGroup::Config), 1) => decode(body).and_then(|r: SettingsDeleteReq| {
                self.settings.remove(&r.name).ok_or(ReturnCode::NoEntry)?;
                ok()
            }),
            (Some(NmpGroup::Config), 2) | (Some(NmpGroup::Config), 3) => ok(),
            (Some(NmpGroup::Log), 0) => decode(body).map(|r| self.log_show(r)),
            (Some(NmpGroup::Log), 1) => {
                self.logs.iter_mut().for_each(|l| l.entries.clear());
                ok()
            }
            (Some(NmpGroup::Log), 3) => Ok(to_value(&LogModuleListRsp {
                module_map: [("DEFAULT".to_string(), 0)].into_iter().collect(),
            })),
            (Some(NmpGroup::Log), 4) => Ok(to_value(&LogLevelListRsp {
                level_map: ["DEBUG", "INFO", "WARN", "ERROR", "CRITICAL"]
                    .iter()
                    .enumerate()
                    .map(|(i, l)| (l.to_string(), i as u32))
                    .collect(),
            })),
            (Some(NmpGroup::Log), 5) => Ok(to_value(&LogListRsp {
                log_list: self.logs.iter().map(|l| l.name.clone()).collect(),
            })),
            (Some(NmpGroup::Fs), 0) if write => decode(body).and_then(|r| self.file_upload(r)),
            (Some(NmpGroup::Fs), 0) => decode(body).and_then(|r| self.file_download(r)),
            (Some(NmpGroup::Fs), 1) => decode(body).and_then(|r: FsStatReq| {
                let len = self.files.get(&r.name).ok_or(ReturnCode::NoEntry)?.len();
                Ok(to_value(&FsStatRsp { len: len as u32 }))
            }),
            (Some(NmpGroup::Fs), 2) => decode(body).and_then(|r| self.file_hash(r)),
            (Some(NmpGroup::Fs), 3) => Ok(to_value(&FsSupportedHashTypesRsp {
                types: [("sha256".to_string(), FsHashTypeInfo { format: 1, size: 32 })]
                    .into_iter()
                    .collect(),
            })),
            (Some(NmpGroup::Fs), 4) => ok(),
            (Some(NmpGroup::Shell), 0) => decode(body).map(|r: ShellExecReq| {
                to_value(&ShellExecRsp {
                    o: r.argv.join(" "),
                    ret: 0,
                })
            }),
            (Some(NmpGroup::Basic), 0) => ok(),
            _ => Err(ReturnCode::NotSupported),
        };
        (reply, Effect::None)
    }

    fn task_stat(&self) -> Value {
        let task = TaskInfo {
            prio: 7,
            state: 1,
            stkuse: 300,
            stksiz: 1024,
            cswcnt: 12,
            runtime: 0,
            last_checkin: 0,
            next_checkin: 0,
        };
        to_value(&TaskStatRsp {
            tasks: [("main".to_string(), task)].into_iter().collect(),
        })
    }

    fn bootloader_info(&self) -> Reply {
        let mode = self.bootloader_mode.ok_or(ReturnCode::NotSupported)?;
        Ok(to_value(&BootloaderInfoRsp {
            bootloader: "MCUboot".to_string(),
            mode: Some(mode),
            no_downgrade: Some(false),
        }))
    }

    /// Reboot: a pending secondary swaps into the primary slot; an
    /// unconfirmed primary reverts.
    fn reset(&mut self) -> Reply {
        self.reset_count += 1;
        let images: BTreeSet<u32> = self.slots.iter().map(|s| s.image_index).collect();
        for image in images {
            let secondary = self.slots.iter().position(|s| s.image_index == image && s.slot == 1);
            let primary = self.slots.iter().position(|s| s.image_index == image && s.slot == 0);
            let swap = match (primary, secondary) {
                (_, Some(s)) if self.slots[s].pending => true,
                (Some(p), Some(_)) => !self.slots[p].confirmed,
                _ => false,
            };
            if !swap {
                continue;
            }
            for slot in self.slots.iter_mut().filter(|s| s.image_index == image) {
                let was_secondary = slot.slot == 1;
                slot.slot = if was_secondary { 0 } else { 1 };
                slot.active = was_secondary;
                slot.confirmed = was_secondary && slot.permanent;
                slot.pending = false;
                slot.permanent = false;
            }
        }
        ok()
    }

    fn image_list(&self) -> Value {
        let mut images = self.slots.clone();
        images.sort_by_key(|s| (s.image_index, s.slot));
        to_value(&ImageStateRsp {
            images,
            split_status: None,
        })
    }

    fn image_state(&mut self, req: ImageStateReq) -> Reply {
        let confirm = req.confirm.unwrap_or(false);
        let slot = if req.hash.is_empty() {
            if !confirm {
                return Err(ReturnCode::InValue);
            }
            self.slots.iter_mut().find(|s| s.active)
        } else {
            self.slots.iter_mut().find(|s| s.hash == req.hash)
        }
        .ok_or(ReturnCode::InValue)?;

        match (slot.active, confirm) {
            (true, true) => slot.confirmed = true,
            (true, false) => return Err(ReturnCode::BadState),
            (false, true) => {
                slot.pending = true;
                slot.permanent = true;
            }
            (false, false) => slot.pending = true,
        }
        Ok(self.image_list())
    }

    fn image_upload(&mut self, req: ImageUploadReq, upload_index: Option<usize>) -> Reply {
        let off = req.off as usize;
        if off == 0 {
            if let Some(len) = req.len {
                self.upload = Some(ImageUpload {
                    image: req.image_num.unwrap_or(0),
                    len: len as usize,
                    data: Vec::with_capacity(len as usize),
                });
            }
        }
        let dropped = upload_index.is_some() && upload_index == self.drop_upload_at;
        let upload = self.upload.as_mut().ok_or(ReturnCode::BadState)?;
        let mut written = false;
        if dropped {
            // acknowledged but never written
        } else if off != upload.data.len() {
            self.rejected_upload_offsets.push(off);
        } else if off + req.data.len() > upload.len {
            return Err(ReturnCode::InValue);
        } else {
            upload.data.extend_from_slice(&req.data);
            written = !req.data.is_empty();
        }

        let image = upload.image;
        let off = upload.data.len();
        let complete = written.then(|| upload.data.clone()).filter(|d| d.len() == upload.len);
        if let Some(data) = complete {
            self.install(image, &data);
        }
        Ok(to_value(&UploadAck {
            rc: 0,
            off: (off + self.upload_offset_skew) as u64,
        }))
    }

    fn install(&mut self, image: u32, data: &[u8]) {
        let parsed = McuBootImage::parse(data).ok();
        let hash = parsed
            .as_ref()
            .and_then(|p| p.hash().ok().map(<[u8]>::to_vec))
            .unwrap_or_else(|| Sha256::digest(data).to_vec());
        let version = parsed
            .map(|p| p.header.version.to_string())
            .unwrap_or_else(|| "0.0.0".to_string());
        self.slots.retain(|s| !(s.image_index == image && s.slot == 1));
        self.slots.push(ImageSlot {
            image_index: image,
            slot: 1,
            version,
            hash,
            bootable: true,
            ..Default::default()
        });
    }

    fn image_erase(&mut self, req: ImageEraseReq) -> Reply {
        let slot = req.slot.unwrap_or(1);
        if self.slots.iter().any(|s| s.slot == slot && s.active) {
            return Err(ReturnCode::BadState);
        }
        self.slots.retain(|s| s.slot != slot);
        ok()
    }

    fn stat_read(&self, req: StatReadReq) -> Reply {
        if req.name != "smp_svr_stats" {
            return Err(ReturnCode::NoEntry);
        }
        Ok(to_value(&StatReadRsp {
            name: req.name,
            fields: [("ticks".to_string(), 42)].into_iter().collect(),
        }))
    }

    fn log_show(&self, req: LogShowReq) -> Value {
        let min = req.min_index.unwrap_or(0);
        let mut budget = LOG_PAGE;
        let mut next = min;
        let mut logs = Vec::new();
        for store in self
            .logs
            .iter()
            .filter(|l| req.log_name.as_ref().map_or(true, |n| *n == l.name))
        {
            let entries: Vec<LogEntry> = store
                .entries
                .iter()
                .filter(|(index, _)| *index >= min)
                .take(budget)
                .map(|(index, msg)| LogEntry {
                    msg: Value::Text(msg.clone()),
                    ts: 1_000 * *index as i64,
                    level: 1,
                    index: *index,
                    module: 0,
                })
                .collect();
            budget -= entries.len();
            if let Some(last) = entries.last() {
                next = next.max(last.index + 1);
            }
            logs.push(LogInfo {
                name: store.name.clone(),
                log_type: 0,
                entries,
            });
        }
        to_value(&LogShowRsp {
            next_index: next,
            logs,
        })
    }

    fn file_upload(&mut self, req: FsUploadReq) -> Reply {
        let off = req.off as usize;
        if off == 0 {
            self.files.insert(req.name.clone(), Vec::new());
        }
        let file = self.files.get_mut(&req.name).ok_or(ReturnCode::NoEntry)?;
        if off == file.len() {
            file.extend_from_slice(&req.data);
        }
        Ok(to_value(&UploadAck {
            rc: 0,
            off: file.len() as u64,
        }))
    }

    fn file_download(&self, req: FsDownloadReq) -> Reply {
        if let Some(reply) = &self.download_reply {
            return Ok(reply.clone());
        }
        let file = self.files.get(&req.name).ok_or(ReturnCode::NoEntry)?;
        let off = req.off as usize;
        if off > file.len() {
            return Err(ReturnCode::InValue);
        }
        let end = (off + DOWNLOAD_CHUNK).min(file.len());
        Ok(to_value(&FsDownloadRsp {
            off: req.off,
            data: file[off..end].to_vec(),
            len: (off == 0).then_some(file.len() as u32),
        }))
    }

    fn file_hash(&self, req: FsHashReq) -> Reply {
        let hash_type = req.hash_type.unwrap_or_else(|| "sha256".to_string());
        if hash_type != "sha256" {
            return Err(ReturnCode::NotSupported);
        }
        let file = self.files.get(&req.name).ok_or(ReturnCode::NoEntry)?;
        Ok(to_value(&FsHashRsp {
            hash_type,
            off: 0,
            len: file.len() as u32,
            output: Value::Bytes(Sha256::digest(file).to_vec()),
        }))
    }
}

impl Transport for TestDevice {
    fn scheme(&self) -> Scheme {
        Scheme::Ble
    }

    fn mtu(&self) -> usize {
        self.lock().mtu
    }

    fn send(&self, packet: &[u8], kind: ResponseKind) -> Result<Response> {
        let upload_index = self.accept(packet)?;
        self.process(packet, kind, upload_index)
    }

    fn send_async(&self, packet: Vec<u8>, kind: ResponseKind, callback: ResponseCallback) {
        let upload_index = match self.accept(&packet) {
            Ok(index) => index,
            Err(e) => return callback(Err(e)),
        };
        let jobs = self.jobs.lock().unwrap().clone();
        let Some(jobs) = jobs else {
            return callback(self.process(&packet, kind, upload_index));
        };
        {
            let mut state = self.lock();
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
        }
        let job = Job {
            packet,
            kind,
            upload_index,
            callback,
        };
        if let Err(mpsc::SendError(job)) = jobs.send(job) {
            self.lock().in_flight -= 1;
            (job.callback)(Err(Error::Disconnected));
        }
    }

    fn connect(&self, callback: Option<ConnectCallback>) {
        if !self.is_connected() {
            self.lock().connected = true;
            self.observers.notify_connected();
        }
        if let Some(callback) = callback {
            callback(Ok(()));
        }
    }

    fn release(&self) {
        if self.is_connected() {
            self.lock().connected = false;
            self.observers.notify_disconnected();
        }
    }

    fn add_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        self.observers.add(observer);
    }

    fn remove_observer(&self, observer: &Arc<dyn ConnectionObserver>) {
        self.observers.remove(observer);
    }

    fn set_timeout(&self, _timeout_ms: u32) -> Result<()> {
        Ok(())
    }
}
