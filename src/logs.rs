// Copyright © 2026 Rudis Laboratories LLC

use log::info;
use std::sync::Arc;

use crate::error::Result;
use crate::manager::{empty_request, SmpManager};
use crate::nmp_hdr::*;
use crate::response::ResponseKind;
use crate::transport::Transport;

/// Device log management group (group 4).
#[derive(Clone)]
pub struct LogManager {
    manager: SmpManager,
}

impl LogManager {
    pub fn new(transport: Arc<dyn Transport>) -> LogManager {
        LogManager {
            manager: SmpManager::new(transport, NmpGroup::Log),
        }
    }

    /// Read log entries, optionally starting at `min_index`.
    pub fn show(&self, log_name: Option<&str>, min_index: Option<u64>) -> Result<LogShowRsp> {
        info!("send log show request: {:?}", log_name);
        let req = LogShowReq {
            log_name: log_name.map(|s| s.to_string()),
            min_index,
            min_timestamp: None,
        };
        self.manager.request(NmpOp::Read, NmpIdLog::Show, &req)
    }

    /// Read every entry, following `next_index` until the device runs dry.
    pub fn show_all(&self, log_name: Option<&str>) -> Result<Vec<LogInfo>> {
        let mut logs: Vec<LogInfo> = Vec::new();
        let mut index = None;
        loop {
            let rsp = self.show(log_name, index)?;
            let received: usize = rsp.logs.iter().map(|l| l.entries.len()).sum();
            for log in rsp.logs {
                match logs.iter_mut().find(|l| l.name == log.name) {
                    Some(existing) => existing.entries.extend(log.entries),
                    None => logs.push(log),
                }
            }
            if received == 0 || Some(rsp.next_index) == index {
                return Ok(logs);
            }
            index = Some(rsp.next_index);
        }
    }

    pub fn clear(&self) -> Result<()> {
        info!("send log clear request");
        self.manager.send(
            NmpOp::Write,
            NmpIdLog::Clear,
            &empty_request(),
            ResponseKind::Generic,
        )?;
        Ok(())
    }

    pub fn module_list(&self) -> Result<LogModuleListRsp> {
        self.manager
            .request(NmpOp::Read, NmpIdLog::ModuleList, &empty_request())
    }

    pub fn level_list(&self) -> Result<LogLevelListRsp> {
        self.manager
            .request(NmpOp::Read, NmpIdLog::LevelList, &empty_request())
    }

    pub fn list(&self) -> Result<LogListRsp> {
        self.manager
            .request(NmpOp::Read, NmpIdLog::List, &empty_request())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_device::TestDevice;

    #[test]
    fn show_all_pages_through_entries() {
        let device = TestDevice::new();
        device.add_log_entries("reboot_log", &["boot", "crash", "boot"]);
        let logs = LogManager::new(device.clone());

        let all = logs.show_all(None).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "reboot_log");
        let messages: Vec<_> = all[0]
            .entries
            .iter()
            .map(|e| e.msg.clone())
            .collect();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1], serde_cbor::Value::Text("crash".to_string()));
    }

    #[test]
    fn clear_and_lists() {
        let device = TestDevice::new();
        device.add_log_entries("reboot_log", &["boot"]);
        let logs = LogManager::new(device.clone());
        assert_eq!(logs.list().unwrap().log_list, vec!["reboot_log"]);
        assert_eq!(logs.level_list().unwrap().level_map.get("ERROR"), Some(&3));
        assert!(logs.module_list().unwrap().module_map.contains_key("DEFAULT"));
        logs.clear().unwrap();
        assert!(logs.show_all(None).unwrap().iter().all(|l| l.entries.is_empty()));
    }
}
