// Copyright © 2026 Rudis Laboratories LLC

//! MCUboot image container parsing.
//!
//! Only what the upgrade flow needs: the header fields and the image hash
//! from the unprotected TLV area. Signatures are not verified.

use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

use crate::error::{Error, Result};

pub const IMAGE_MAGIC: u32 = 0x96f3_b83d;
pub const IMAGE_HEADER_SIZE: usize = 32;
pub const TLV_INFO_MAGIC: u16 = 0x6907;
pub const TLV_PROT_INFO_MAGIC: u16 = 0x6908;
const TLV_INFO_SIZE: usize = 4;
const TLV_ENTRY_HEADER_SIZE: usize = 4;

pub const TLV_SHA256: u16 = 0x10;
pub const TLV_SHA384: u16 = 0x11;
pub const TLV_SHA512: u16 = 0x12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageVersion {
    pub major: u8,
    pub minor: u8,
    pub revision: u16,
    pub build_num: u32,
}

impl fmt::Display for ImageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.revision, self.build_num
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    pub load_addr: u32,
    pub hdr_size: u16,
    pub protect_tlv_size: u16,
    pub img_size: u32,
    pub flags: u32,
    pub version: ImageVersion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    pub kind: u16,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McuBootImage {
    pub header: ImageHeader,
    pub tlvs: Vec<Tlv>,
}

impl McuBootImage {
    pub fn parse(data: &[u8]) -> Result<McuBootImage> {
        if data.len() < IMAGE_HEADER_SIZE {
            return Err(invalid(format!("{} bytes is too short for a header", data.len())));
        }
        let magic = LittleEndian::read_u32(&data[0..4]);
        if magic != IMAGE_MAGIC {
            return Err(invalid(format!("bad magic {magic:#010x}")));
        }
        let header = ImageHeader {
            load_addr: LittleEndian::read_u32(&data[4..8]),
            hdr_size: LittleEndian::read_u16(&data[8..10]),
            protect_tlv_size: LittleEndian::read_u16(&data[10..12]),
            img_size: LittleEndian::read_u32(&data[12..16]),
            flags: LittleEndian::read_u32(&data[16..20]),
            version: ImageVersion {
                major: data[20],
                minor: data[21],
                revision: LittleEndian::read_u16(&data[22..24]),
                build_num: LittleEndian::read_u32(&data[24..28]),
            },
        };

        let mut offset = header.hdr_size as usize + header.img_size as usize;
        if header.protect_tlv_size > 0 {
            let (_, size) = tlv_info(data, offset, TLV_PROT_INFO_MAGIC)?;
            if size != header.protect_tlv_size as usize {
                return Err(invalid(format!(
                    "protected TLV area is {size} bytes, header says {}",
                    header.protect_tlv_size
                )));
            }
            offset += size;
        }
        let (start, size) = tlv_info(data, offset, TLV_INFO_MAGIC)?;
        let end = offset + size;
        if end > data.len() {
            return Err(invalid("TLV area runs past end of file".to_string()));
        }

        let mut tlvs = Vec::new();
        let mut pos = start;
        while pos < end {
            if pos + TLV_ENTRY_HEADER_SIZE > end {
                return Err(invalid("truncated TLV entry".to_string()));
            }
            let kind = LittleEndian::read_u16(&data[pos..pos + 2]);
            let len = LittleEndian::read_u16(&data[pos + 2..pos + 4]) as usize;
            pos += TLV_ENTRY_HEADER_SIZE;
            if pos + len > end {
                return Err(invalid(format!("TLV {kind:#x} runs past the TLV area")));
            }
            tlvs.push(Tlv {
                kind,
                value: data[pos..pos + len].to_vec(),
            });
            pos += len;
        }

        Ok(McuBootImage { header, tlvs })
    }

    /// The image hash the bootloader reports for this image.
    pub fn hash(&self) -> Result<&[u8]> {
        self.tlvs
            .iter()
            .find(|t| matches!(t.kind, TLV_SHA256 | TLV_SHA384 | TLV_SHA512))
            .map(|t| t.value.as_slice())
            .ok_or_else(|| invalid("no hash TLV".to_string()))
    }
}

fn tlv_info(data: &[u8], offset: usize, magic: u16) -> Result<(usize, usize)> {
    let info = data
        .get(offset..offset + TLV_INFO_SIZE)
        .ok_or_else(|| invalid(format!("no TLV info at offset {offset}")))?;
    let found = LittleEndian::read_u16(&info[0..2]);
    if found != magic {
        return Err(invalid(format!(
            "expected TLV magic {magic:#06x} at offset {offset}, found {found:#06x}"
        )));
    }
    let total = LittleEndian::read_u16(&info[2..4]) as usize;
    if total < TLV_INFO_SIZE {
        return Err(invalid(format!("TLV area size {total} is too small")));
    }
    Ok((offset + TLV_INFO_SIZE, total))
}

fn invalid(msg: String) -> Error {
    Error::InvalidImage(msg)
}

/// Builds a minimal signed-looking image around `payload` for tests.
#[cfg(test)]
pub(crate) fn build_test_image(payload: &[u8], protected: bool) -> Vec<u8> {
    use byteorder::WriteBytesExt;
    use sha2::{Digest, Sha256};

    let prot: Vec<u8> = if protected {
        let mut area = Vec::new();
        area.write_u16::<LittleEndian>(TLV_PROT_INFO_MAGIC).unwrap();
        area.write_u16::<LittleEndian>(4 + 4 + 4).unwrap();
        area.write_u16::<LittleEndian>(0x50).unwrap();
        area.write_u16::<LittleEndian>(4).unwrap();
        area.extend_from_slice(&[1, 0, 0, 0]);
        area
    } else {
        Vec::new()
    };

    let mut image = Vec::new();
    image.write_u32::<LittleEndian>(IMAGE_MAGIC).unwrap();
    image.write_u32::<LittleEndian>(0).unwrap();
    image.write_u16::<LittleEndian>(IMAGE_HEADER_SIZE as u16).unwrap();
    image.write_u16::<LittleEndian>(prot.len() as u16).unwrap();
    image.write_u32::<LittleEndian>(payload.len() as u32).unwrap();
    image.write_u32::<LittleEndian>(0).unwrap();
    image.extend_from_slice(&[1, 2]);
    image.write_u16::<LittleEndian>(3).unwrap();
    image.write_u32::<LittleEndian>(4).unwrap();
    image.write_u32::<LittleEndian>(0).unwrap();
    image.extend_from_slice(payload);
    image.extend_from_slice(&prot);

    let hash = Sha256::digest(&image);
    image.write_u16::<LittleEndian>(TLV_INFO_MAGIC).unwrap();
    image
        .write_u16::<LittleEndian>((TLV_INFO_SIZE + TLV_ENTRY_HEADER_SIZE + hash.len()) as u16)
        .unwrap();
    image.write_u16::<LittleEndian>(TLV_SHA256).unwrap();
    image.write_u16::<LittleEndian>(hash.len() as u16).unwrap();
    image.extend_from_slice(&hash);
    image
}
