// Copyright © 2023-2024 Vouch.io LLC, 2026 Rudis Laboratories LLC

//! Client engine for the Simple Management Protocol (SMP) spoken by
//! MCU Manager enabled devices: packet framing, per-group command
//! managers, a windowed transfer engine and a firmware upgrade
//! orchestrator, over serial or UDP transports.

pub mod basic;
pub mod config;
pub mod default;
pub mod dfu;
pub mod envelope;
pub mod error;
pub mod fs;
pub mod image;
pub mod logs;
pub mod manager;
pub mod mcuboot;
pub mod nmp_hdr;
pub mod response;
pub mod serial;
pub mod shell;
pub mod stat;
pub mod transfer;
pub mod transport;
pub mod udp;

#[cfg(test)]
mod test_device;

pub use crate::basic::BasicManager;
pub use crate::config::ConfigManager;
pub use crate::default::{mcuboot_mode_name, DefaultManager, McubootMode};
pub use crate::dfu::{
    FirmwareUpgradeCallback, FirmwareUpgradeManager, ImageSet, Mode, Settings, State,
    TargetImage, UpgradeController,
};
pub use crate::envelope::Scheme;
pub use crate::error::{Error, GroupReturnCode, Result, ReturnCode};
pub use crate::fs::FsManager;
pub use crate::image::ImageManager;
pub use crate::logs::LogManager;
pub use crate::mcuboot::McuBootImage;
pub use crate::response::{Response, ResponseKind};
pub use crate::serial::{SerialSpecs, SerialTransport};
pub use crate::shell::ShellManager;
pub use crate::stat::StatsManager;
pub use crate::transfer::{TransferCallback, TransferController, TransferState, UploadOptions};
pub use crate::transport::{connect_blocking, ConnSpec, ConnectionObserver, Transport};
pub use crate::udp::{UdpSpecs, UdpTransport};
