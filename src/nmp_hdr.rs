// Copyright © 2023-2024 Vouch.io LLC, 2026 Rudis Laboratories LLC

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use hex_buffer_serde::{Hex as _, HexForm};
use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;

use crate::error::{Error, Result};

/// Size of the fixed SMP header preceding every standard-scheme payload.
pub const NMP_HDR_SIZE: usize = 8;

/// Header version bits for the original SMP protocol.
pub const SMP_VERSION_1: u8 = 0;
/// Header version bits for SMP v2 (group-specific error responses).
pub const SMP_VERSION_2: u8 = 1;

#[repr(u8)]
#[derive(Debug, Clone, Copy, Deserialize, Serialize, FromPrimitive, PartialEq, Eq)]
pub enum NmpOp {
    Read = 0,
    ReadRsp = 1,
    Write = 2,
    WriteRsp = 3,
}

impl NmpOp {
    /// The op a device answers a request with.
    pub fn response(self) -> NmpOp {
        match self {
            NmpOp::Read | NmpOp::ReadRsp => NmpOp::ReadRsp,
            NmpOp::Write | NmpOp::WriteRsp => NmpOp::WriteRsp,
        }
    }
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, FromPrimitive, PartialEq, Eq, Deserialize, Serialize)]
pub enum NmpGroup {
    Default = 0,
    Image = 1,
    Stat = 2,
    Config = 3,
    Log = 4,
    Crash = 5,
    Split = 6,
    Run = 7,
    Fs = 8,
    Shell = 9,
    Basic = 63,
    PerUser = 64,
}

impl NmpGroup {
    pub fn from_u16(group: u16) -> Option<NmpGroup> {
        num::FromPrimitive::from_u16(group)
    }
}

impl From<NmpGroup> for u16 {
    fn from(group: NmpGroup) -> u16 {
        group as u16
    }
}

pub trait NmpId {
    fn to_u8(&self) -> u8;
}

impl NmpId for u8 {
    fn to_u8(&self) -> u8 {
        *self
    }
}

#[repr(u8)]
#[derive(Debug, Copy, Clone)]
#[allow(dead_code)]
pub enum NmpIdDef {
    Echo = 0,
    ConsEchoCtrl = 1,
    TaskStat = 2,
    MpStat = 3,
    DateTimeStr = 4,
    Reset = 5,
    McumgrParams = 6,
    Info = 7,
    BootloaderInfo = 8,
}

#[repr(u8)]
#[derive(Debug, Copy, Clone)]
#[allow(dead_code)]
pub enum NmpIdImage {
    State = 0,
    Upload = 1,
    File = 2,
    CoreList = 3,
    CoreLoad = 4,
    Erase = 5,
    SlotInfo = 6,
}

#[repr(u8)]
#[derive(Debug, Copy, Clone)]
pub enum NmpIdStat {
    Read = 0,
    List = 1,
}

#[repr(u8)]
#[derive(Debug, Copy, Clone)]
pub enum NmpIdConfig {
    Val = 0,
    Delete = 1,
    Commit = 2,
    LoadSave = 3,
}

#[repr(u8)]
#[derive(Debug, Copy, Clone)]
#[allow(dead_code)]
pub enum NmpIdLog {
    Show = 0,
    Clear = 1,
    Append = 2,
    ModuleList = 3,
    LevelList = 4,
    List = 5,
}

#[repr(u8)]
#[derive(Debug, Copy, Clone)]
pub enum NmpIdFs {
    File = 0,
    FileStat = 1,
    FileHash = 2,
    SupportedHashTypes = 3,
    FileClose = 4,
}

#[repr(u8)]
#[derive(Debug, Copy, Clone)]
pub enum NmpIdShell {
    Exec = 0,
}

#[repr(u8)]
#[derive(Debug, Copy, Clone)]
pub enum NmpIdBasic {
    EraseStorage = 0,
}

macro_rules! impl_nmp_id {
    ($($t:ty),*) => {
        $(impl NmpId for $t {
            fn to_u8(&self) -> u8 {
                *self as u8
            }
        })*
    };
}

impl_nmp_id!(NmpIdDef, NmpIdImage, NmpIdStat, NmpIdConfig, NmpIdLog, NmpIdFs, NmpIdShell, NmpIdBasic);

/// The 8-byte SMP header.
///
/// Byte 0: Res(3 bits) | Ver(2 bits) | OP(3 bits)
/// Byte 1: Flags
/// Bytes 2-3: Data Length (big-endian)
/// Bytes 4-5: Group ID (big-endian)
/// Byte 6: Sequence Number
/// Byte 7: Command ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct NmpHdr {
    pub version: u8,
    pub op: NmpOp,
    pub flags: u8,
    pub len: u16,
    pub group: u16,
    pub seq: u8,
    pub id: u8,
}

impl NmpHdr {
    pub fn new_req(op: NmpOp, group: impl Into<u16>, id: impl NmpId) -> NmpHdr {
        NmpHdr {
            version: SMP_VERSION_2,
            op,
            flags: 0,
            len: 0,
            group: group.into(),
            seq: 0,
            id: id.to_u8(),
        }
    }

    pub fn serialize(&self) -> [u8; NMP_HDR_SIZE] {
        let mut buffer = Vec::with_capacity(NMP_HDR_SIZE);
        // writes into a Vec cannot fail
        let _ = buffer.write_u8(((self.version & 0x03) << 3) | (self.op as u8 & 0x07));
        let _ = buffer.write_u8(self.flags);
        let _ = buffer.write_u16::<BigEndian>(self.len);
        let _ = buffer.write_u16::<BigEndian>(self.group);
        let _ = buffer.write_u8(self.seq);
        let _ = buffer.write_u8(self.id);
        let mut out = [0u8; NMP_HDR_SIZE];
        out.copy_from_slice(&buffer);
        out
    }

    /// Parse exactly 8 header bytes.
    pub fn parse(bytes: &[u8]) -> Result<NmpHdr> {
        if bytes.len() != NMP_HDR_SIZE {
            return Err(Error::MalformedHeader(bytes.len()));
        }
        let mut cursor = Cursor::new(bytes);
        let byte0 = cursor.read_u8()?;
        let op = num::FromPrimitive::from_u8(byte0 & 0x07).ok_or_else(|| {
            Error::MalformedResponse(format!("unknown op {}", byte0 & 0x07))
        })?;
        let flags = cursor.read_u8()?;
        let len = cursor.read_u16::<BigEndian>()?;
        let group = cursor.read_u16::<BigEndian>()?;
        let seq = cursor.read_u8()?;
        let id = cursor.read_u8()?;
        Ok(NmpHdr {
            version: (byte0 >> 3) & 0x03,
            op,
            flags,
            len,
            group,
            seq,
            id,
        })
    }

    /// Whether `rsp` answers this request.
    pub fn matches_response(&self, rsp: &NmpHdr) -> bool {
        rsp.seq == self.seq && rsp.op == self.op.response() && rsp.group == self.group
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum SplitStatus {
    NotApplicable = 0,
    NotMatching = 1,
    Matching = 2,
}

// Image Management Group Structures

/// Device-reported state of one image slot.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ImageSlot {
    #[serde(rename = "image", default)]
    pub image_index: u32,
    pub slot: u32,
    #[serde(default)]
    pub version: String,
    #[serde(default, with = "HexForm")]
    pub hash: Vec<u8>,
    #[serde(default)]
    pub bootable: bool,
    #[serde(default)]
    pub pending: bool,
    #[serde(default)]
    pub confirmed: bool,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub permanent: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImageStateReq {
    #[serde(with = "serde_bytes", skip_serializing_if = "Vec::is_empty", default)]
    pub hash: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirm: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ImageStateRsp {
    #[serde(default)]
    pub images: Vec<ImageSlot>,
    #[serde(rename = "splitStatus", default, skip_serializing_if = "Option::is_none")]
    pub split_status: Option<SplitStatus>,
}

impl ImageStateRsp {
    pub fn find_by_hash(&self, hash: &[u8]) -> Option<&ImageSlot> {
        self.images.iter().find(|s| s.hash == hash)
    }

    pub fn find_slot(&self, image_index: u32, slot: u32) -> Option<&ImageSlot> {
        self.images
            .iter()
            .find(|s| s.image_index == image_index && s.slot == slot)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ImageUploadReq {
    #[serde(rename = "data", with = "serde_bytes")]
    pub data: Vec<u8>,
    #[serde(rename = "image", default, skip_serializing_if = "Option::is_none")]
    pub image_num: Option<u32>,
    #[serde(rename = "len", default, skip_serializing_if = "Option::is_none")]
    pub len: Option<u32>,
    #[serde(rename = "off", default)]
    pub off: u32,
    #[serde(
        rename = "sha",
        default,
        skip_serializing_if = "Option::is_none",
        with = "serde_bytes"
    )]
    pub data_sha: Option<Vec<u8>>,
    #[serde(rename = "upgrade", default, skip_serializing_if = "Option::is_none")]
    pub upgrade: Option<bool>,
}

/// Acknowledgement of an image or file chunk write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct UploadAck {
    #[serde(default)]
    pub rc: i32,
    #[serde(default)]
    pub off: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImageEraseReq {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot: Option<u32>,
}

// OS Management Group Structures

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EchoReq {
    pub d: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EchoRsp {
    pub r: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaskStatRsp {
    pub tasks: HashMap<String, TaskInfo>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaskInfo {
    #[serde(default)]
    pub prio: i32,
    #[serde(default)]
    pub state: u64,
    #[serde(default)]
    pub stkuse: u64,
    #[serde(default)]
    pub stksiz: u64,
    #[serde(default)]
    pub cswcnt: u64,
    #[serde(default)]
    pub runtime: u64,
    #[serde(default)]
    pub last_checkin: u64,
    #[serde(default)]
    pub next_checkin: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct McumgrParamsRsp {
    pub buf_size: u32,
    pub buf_count: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OsInfoReq {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OsInfoRsp {
    pub output: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BootloaderInfoReq {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BootloaderInfoRsp {
    #[serde(default)]
    pub bootloader: String,
    #[serde(default)]
    pub mode: Option<i32>,
    #[serde(rename = "no-downgrade", default)]
    pub no_downgrade: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResetReq {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force: Option<u32>,
}

// Shell Management Group Structures

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ShellExecReq {
    #[serde(rename = "argv")]
    pub argv: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ShellExecRsp {
    #[serde(default)]
    pub o: String,
    #[serde(default, rename = "ret")]
    pub ret: i32,
}

// File System Management Group Structures

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FsDownloadReq {
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "off")]
    pub off: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FsDownloadRsp {
    #[serde(rename = "off")]
    pub off: u32,
    #[serde(rename = "data", with = "serde_bytes")]
    pub data: Vec<u8>,
    #[serde(rename = "len", default, skip_serializing_if = "Option::is_none")]
    pub len: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FsUploadReq {
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "off")]
    pub off: u32,
    #[serde(rename = "data", with = "serde_bytes")]
    pub data: Vec<u8>,
    #[serde(rename = "len", skip_serializing_if = "Option::is_none")]
    pub len: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FsStatReq {
    #[serde(rename = "name")]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FsStatRsp {
    #[serde(rename = "len")]
    pub len: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FsHashReq {
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub hash_type: Option<String>,
    #[serde(rename = "off", skip_serializing_if = "Option::is_none")]
    pub off: Option<u32>,
    #[serde(rename = "len", skip_serializing_if = "Option::is_none")]
    pub len: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FsHashRsp {
    #[serde(rename = "type")]
    pub hash_type: String,
    #[serde(rename = "off", default)]
    pub off: u32,
    #[serde(rename = "len")]
    pub len: u32,
    /// Byte string for digests (sha256), integer for checksums (crc32).
    #[serde(rename = "output")]
    pub output: serde_cbor::Value,
}

impl FsHashRsp {
    pub fn output_hex(&self) -> String {
        match &self.output {
            serde_cbor::Value::Bytes(b) => hex::encode(b),
            serde_cbor::Value::Integer(i) => format!("{i:08x}"),
            other => format!("{other:?}"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FsHashTypeInfo {
    #[serde(default)]
    pub format: u32,
    #[serde(default)]
    pub size: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FsSupportedHashTypesRsp {
    #[serde(default)]
    pub types: BTreeMap<String, FsHashTypeInfo>,
}

// Statistics Management Group Structures

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StatListRsp {
    #[serde(default)]
    pub stat_list: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StatReadReq {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StatReadRsp {
    pub name: String,
    #[serde(default)]
    pub fields: HashMap<String, i64>,
}

// Settings/Config Management Group Structures

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SettingsReadReq {
    pub name: String,
    #[serde(rename = "max_size", skip_serializing_if = "Option::is_none")]
    pub max_size: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SettingsReadRsp {
    #[serde(rename = "val", with = "serde_bytes", default)]
    pub val: Vec<u8>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SettingsWriteReq {
    pub name: String,
    #[serde(rename = "val", with = "serde_bytes")]
    pub val: Vec<u8>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SettingsDeleteReq {
    pub name: String,
}

// Log Management Group Structures

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LogShowReq {
    #[serde(rename = "log_name", skip_serializing_if = "Option::is_none")]
    pub log_name: Option<String>,
    #[serde(rename = "index", skip_serializing_if = "Option::is_none")]
    pub min_index: Option<u64>,
    #[serde(rename = "ts", skip_serializing_if = "Option::is_none")]
    pub min_timestamp: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogEntry {
    /// Text or binary payload depending on the log entry type.
    pub msg: serde_cbor::Value,
    #[serde(default)]
    pub ts: i64,
    #[serde(default)]
    pub level: u32,
    #[serde(default)]
    pub index: u64,
    #[serde(default)]
    pub module: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogInfo {
    pub name: String,
    #[serde(rename = "type", default)]
    pub log_type: u32,
    #[serde(default)]
    pub entries: Vec<LogEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogShowRsp {
    #[serde(default)]
    pub next_index: u64,
    #[serde(default)]
    pub logs: Vec<LogInfo>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogModuleListRsp {
    #[serde(default)]
    pub module_map: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogLevelListRsp {
    #[serde(default)]
    pub level_map: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogListRsp {
    #[serde(default)]
    pub log_list: Vec<String>,
}
