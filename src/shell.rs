// Copyright © 2026 Rudis Laboratories LLC

use log::info;
use std::sync::Arc;

use crate::error::Result;
use crate::manager::SmpManager;
use crate::nmp_hdr::*;
use crate::transport::Transport;

#[derive(Clone)]
pub struct ShellManager {
    manager: SmpManager,
}

impl ShellManager {
    pub fn new(transport: Arc<dyn Transport>) -> ShellManager {
        ShellManager {
            manager: SmpManager::new(transport, NmpGroup::Shell),
        }
    }

    /// Execute a shell command on the device
    ///
    /// The command is passed as a vector of strings (argv style).
    /// Returns the output and return code from the device.
    pub fn exec(&self, argv: Vec<String>) -> Result<ShellExecRsp> {
        info!("send shell exec request: {:?}", argv);
        let req = ShellExecReq { argv };
        self.manager.request(NmpOp::Write, NmpIdShell::Exec, &req)
    }
}
