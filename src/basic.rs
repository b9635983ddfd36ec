// Copyright © 2026 Rudis Laboratories LLC

use log::info;
use std::sync::Arc;

use crate::error::Result;
use crate::manager::{empty_request, SmpManager};
use crate::nmp_hdr::*;
use crate::response::ResponseKind;
use crate::transport::Transport;

/// Zephyr basic management group (group 63).
#[derive(Clone)]
pub struct BasicManager {
    manager: SmpManager,
}

impl BasicManager {
    pub fn new(transport: Arc<dyn Transport>) -> BasicManager {
        BasicManager {
            manager: SmpManager::new(transport, NmpGroup::Basic),
        }
    }

    /// Erase the application settings partition.
    pub fn erase_storage(&self) -> Result<()> {
        info!("send erase storage request");
        self.manager.send(
            NmpOp::Write,
            NmpIdBasic::EraseStorage,
            &empty_request(),
            ResponseKind::Generic,
        )?;
        Ok(())
    }
}
