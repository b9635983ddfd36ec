// Copyright © 2023-2024 Vouch.io LLC, 2026 Rudis Laboratories LLC

use log::info;
use num_derive::FromPrimitive;
use std::sync::Arc;

use crate::error::Result;
use crate::manager::{empty_request, SmpManager};
use crate::nmp_hdr::*;
use crate::response::ResponseKind;
use crate::transport::Transport;

/// MCUboot operating mode, as reported by the bootloader info query.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum McubootMode {
    SingleApp = 0,
    SwapScratch = 1,
    Overwrite = 2,
    SwapWithoutScratch = 3,
    DirectXipWithoutRevert = 4,
    DirectXipWithRevert = 5,
    RamLoader = 6,
    FirmwareLoader = 7,
    RamLoadNetCore = 8,
    SwapMove = 9,
}

impl McubootMode {
    pub fn from_i32(mode: i32) -> Option<McubootMode> {
        num::FromPrimitive::from_i32(mode)
    }

    /// The bootloader picks the newest image itself and never reverts,
    /// so test and confirm requests have no effect.
    pub fn confirms_on_boot(&self) -> bool {
        *self == McubootMode::DirectXipWithoutRevert
    }
}

/// MCUboot mode names for display
pub fn mcuboot_mode_name(mode: i32) -> &'static str {
    match McubootMode::from_i32(mode) {
        Some(McubootMode::SingleApp) => "Single application",
        Some(McubootMode::SwapScratch) => "Swap using scratch partition",
        Some(McubootMode::Overwrite) => "Overwrite (upgrade-only)",
        Some(McubootMode::SwapWithoutScratch) => "Swap without scratch",
        Some(McubootMode::DirectXipWithoutRevert) => "Direct XIP without revert",
        Some(McubootMode::DirectXipWithRevert) => "Direct XIP with revert",
        Some(McubootMode::RamLoader) => "RAM loader",
        Some(McubootMode::FirmwareLoader) => "Firmware loader",
        Some(McubootMode::RamLoadNetCore) => "RAM load with network core",
        Some(McubootMode::SwapMove) => "Swap using move",
        None => "Unknown",
    }
}

/// OS management group (group 0).
#[derive(Clone)]
pub struct DefaultManager {
    manager: SmpManager,
}

impl DefaultManager {
    pub fn new(transport: Arc<dyn Transport>) -> DefaultManager {
        DefaultManager {
            manager: SmpManager::new(transport, NmpGroup::Default),
        }
    }

    /// Send an echo request to the device
    pub fn echo(&self, message: &str) -> Result<String> {
        info!("send echo request: {}", message);
        let req = EchoReq {
            d: message.to_string(),
        };
        let rsp: EchoRsp = self.manager.request(NmpOp::Write, NmpIdDef::Echo, &req)?;
        Ok(rsp.r)
    }

    /// Get task/thread statistics from the device
    pub fn taskstat(&self) -> Result<TaskStatRsp> {
        info!("send taskstat request");
        self.manager
            .request(NmpOp::Read, NmpIdDef::TaskStat, &empty_request())
    }

    /// Get MCUmgr buffer parameters from the device
    pub fn mcumgr_params(&self) -> Result<McumgrParamsRsp> {
        info!("send mcumgr_params request");
        self.manager
            .request(NmpOp::Read, NmpIdDef::McumgrParams, &empty_request())
    }

    /// Get OS/application information from the device
    ///
    /// Format specifiers:
    /// - s: Kernel name
    /// - n: Node name
    /// - r: Kernel release
    /// - v: Kernel version
    /// - b: Build date and time
    /// - m: Machine
    /// - p: Processor
    /// - i: Hardware platform
    /// - o: Operating system
    /// - a: All fields
    pub fn os_info(&self, format: Option<&str>) -> Result<String> {
        info!("send os_info request");
        let req = OsInfoReq {
            format: format.map(|s| s.to_string()),
        };
        let rsp: OsInfoRsp = self.manager.request(NmpOp::Read, NmpIdDef::Info, &req)?;
        Ok(rsp.output)
    }

    /// Get bootloader information; `Some("mode")` asks for the MCUboot mode.
    pub fn bootloader_info(&self, query: Option<&str>) -> Result<BootloaderInfoRsp> {
        info!("send bootloader_info request");
        let req = BootloaderInfoReq {
            query: query.map(|s| s.to_string()),
        };
        self.manager
            .request(NmpOp::Read, NmpIdDef::BootloaderInfo, &req)
    }

    /// Ask the device to reboot. `force` overrides application vetoes.
    pub fn reset(&self, force: bool) -> Result<()> {
        info!("send reset request");
        let req = ResetReq {
            force: force.then_some(1),
        };
        self.manager
            .send(NmpOp::Write, NmpIdDef::Reset, &req, ResponseKind::Generic)?;
        info!("reset complete");
        Ok(())
    }
}
