// Copyright © 2026 Rudis Laboratories LLC

use log::info;
use std::sync::Arc;

use crate::error::Result;
use crate::manager::{empty_request, SmpManager};
use crate::nmp_hdr::*;
use crate::response::ResponseKind;
use crate::transport::Transport;

/// Settings (config) management group (group 3).
#[derive(Clone)]
pub struct ConfigManager {
    manager: SmpManager,
}

impl ConfigManager {
    pub fn new(transport: Arc<dyn Transport>) -> ConfigManager {
        ConfigManager {
            manager: SmpManager::new(transport, NmpGroup::Config),
        }
    }

    /// Read a settings value from the device
    pub fn read(&self, name: &str, max_size: Option<u32>) -> Result<Vec<u8>> {
        info!("read setting: {}", name);
        let req = SettingsReadReq {
            name: name.to_string(),
            max_size,
        };
        let rsp: SettingsReadRsp = self.manager.request(NmpOp::Read, NmpIdConfig::Val, &req)?;
        Ok(rsp.val)
    }

    /// Write a settings value to the device
    pub fn write(&self, name: &str, value: Vec<u8>) -> Result<()> {
        info!("write setting: {} = {:?}", name, value);
        let req = SettingsWriteReq {
            name: name.to_string(),
            val: value,
        };
        self.manager
            .send(NmpOp::Write, NmpIdConfig::Val, &req, ResponseKind::Generic)?;
        info!("setting written successfully");
        Ok(())
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        info!("delete setting: {}", name);
        let req = SettingsDeleteReq {
            name: name.to_string(),
        };
        self.manager
            .send(NmpOp::Write, NmpIdConfig::Delete, &req, ResponseKind::Generic)?;
        Ok(())
    }

    /// Apply pending settings changes
    pub fn commit(&self) -> Result<()> {
        info!("commit settings");
        self.manager.send(
            NmpOp::Write,
            NmpIdConfig::Commit,
            &empty_request(),
            ResponseKind::Generic,
        )?;
        Ok(())
    }

    /// Load settings from persistent storage
    pub fn load(&self) -> Result<()> {
        info!("load settings");
        self.manager.send(
            NmpOp::Read,
            NmpIdConfig::LoadSave,
            &empty_request(),
            ResponseKind::Generic,
        )?;
        Ok(())
    }

    /// Save settings to persistent storage
    pub fn save(&self) -> Result<()> {
        info!("save settings");
        self.manager.send(
            NmpOp::Write,
            NmpIdConfig::LoadSave,
            &empty_request(),
            ResponseKind::Generic,
        )?;
        Ok(())
    }
}
