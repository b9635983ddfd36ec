// Copyright © 2026 Rudis Laboratories LLC

use log::info;
use std::sync::Arc;

use crate::error::Result;
use crate::manager::{empty_request, SmpManager};
use crate::nmp_hdr::*;
use crate::transport::Transport;

/// Statistics management group (group 2).
#[derive(Clone)]
pub struct StatsManager {
    manager: SmpManager,
}

impl StatsManager {
    pub fn new(transport: Arc<dyn Transport>) -> StatsManager {
        StatsManager {
            manager: SmpManager::new(transport, NmpGroup::Stat),
        }
    }

    /// List available statistics groups on the device
    pub fn list(&self) -> Result<StatListRsp> {
        info!("send stat list request");
        self.manager
            .request(NmpOp::Read, NmpIdStat::List, &empty_request())
    }

    /// Read statistics from a specific group
    pub fn read(&self, name: &str) -> Result<StatReadRsp> {
        info!("send stat read request: {}", name);
        let req = StatReadReq {
            name: name.to_string(),
        };
        self.manager.request(NmpOp::Read, NmpIdStat::Read, &req)
    }
}
