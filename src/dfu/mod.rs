// Copyright © 2026 Rudis Laboratories LLC

//! Firmware upgrade orchestration.
//!
//! A session validates the device's image slots, then runs whatever
//! uploads, test/confirm requests and resets are still needed to get the
//! target images running. Steps are queued by priority and executed one
//! at a time on a background thread:
//!
//! ```text
//! ResetBeforeUpload(0) < Validate(1) < Upload(2) < EraseStorage/Test/Confirm(3)
//!     < Reset(10) < ConfirmAfterReset(11)
//! ```

pub mod image_set;
mod performer;
pub mod settings;
mod task;
pub mod validate;

use log::info;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

pub use image_set::{ImageSet, TargetImage, SECONDARY_SLOT};
pub use settings::{Settings, DEFAULT_DISCONNECT_TIMEOUT};
pub use validate::MAX_REVALIDATIONS;

use crate::error::{Error, Result};
use performer::{Performer, Shared};
use task::Task;

/// Caller-visible phase of an upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    None,
    Validate,
    Upload,
    Test,
    Reset,
    Confirm,
}

/// What to do with the images once uploaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Boot the new image once; the bootloader reverts unless it is confirmed later.
    TestOnly,
    /// Make the new image permanent before rebooting into it.
    ConfirmOnly,
    /// Test boot, then confirm once the device is back.
    TestAndConfirm,
    /// Upload only.
    None,
}

/// Notifications of an upgrade session. Everything except
/// `on_upgrade_started` is called from the session thread.
pub trait FirmwareUpgradeCallback: Send {
    fn on_upgrade_started(&mut self, _controller: &UpgradeController) {}
    fn on_state_changed(&mut self, _prev: State, _new: State) {}
    fn on_upload_progress_changed(&mut self, _current: usize, _total: usize, _timestamp: Instant) {}
    fn on_upgrade_completed(&mut self) {}
    fn on_upgrade_failed(&mut self, _state: State, _error: Error) {}
    fn on_upgrade_canceled(&mut self, _state: State) {}
}

/// Pause, resume or cancel a running session.
#[derive(Clone)]
pub struct UpgradeController {
    shared: Arc<Shared>,
}

impl UpgradeController {
    /// Stop after the current step. An upload stops issuing chunks.
    pub fn pause(&self) {
        let mut inner = self.shared.lock();
        if inner.finished || inner.canceled {
            return;
        }
        inner.paused = true;
        if let Some(transfer) = &inner.transfer {
            transfer.pause();
        }
        info!("upgrade paused");
    }

    pub fn resume(&self) {
        let mut inner = self.shared.lock();
        if !inner.paused {
            return;
        }
        inner.paused = false;
        if let Some(transfer) = &inner.transfer {
            transfer.resume();
        }
        drop(inner);
        self.shared.notify();
        info!("upgrade resumed");
    }

    /// Abandon the session. Does nothing once it has ended.
    pub fn cancel(&self) {
        let mut inner = self.shared.lock();
        if inner.finished || inner.canceled {
            return;
        }
        inner.canceled = true;
        inner.queue.clear();
        if let Some(transfer) = &inner.transfer {
            transfer.cancel();
        }
        drop(inner);
        self.shared.notify();
        info!("upgrade canceled");
    }

    pub fn is_paused(&self) -> bool {
        self.shared.lock().paused
    }

    pub fn is_in_progress(&self) -> bool {
        !self.shared.lock().finished
    }

    pub fn state(&self) -> State {
        self.shared.lock().state
    }

    /// Block until the session has reported its outcome.
    pub fn join(&self) {
        self.shared.wait_finished();
    }
}

/// Entry point for one upgrade session.
pub struct FirmwareUpgradeManager {
    settings: Settings,
    callback: Box<dyn FirmwareUpgradeCallback>,
}

impl FirmwareUpgradeManager {
    pub fn new(settings: Settings, callback: impl FirmwareUpgradeCallback + 'static) -> Self {
        FirmwareUpgradeManager {
            settings,
            callback: Box::new(callback),
        }
    }

    /// Start upgrading to `images` on a background thread.
    pub fn start(mut self, images: ImageSet, mode: Mode) -> Result<UpgradeController> {
        images.check()?;
        info!(
            "starting upgrade of {} image(s), mode {:?}, window {}",
            images.len(),
            mode,
            self.settings.window_capacity
        );
        let shared = Arc::new(Shared::new());
        shared.lock().queue.push(Task::Validate { attempt: 0 });
        let controller = UpgradeController {
            shared: shared.clone(),
        };
        self.callback.on_upgrade_started(&controller);

        let performer = Performer {
            shared,
            settings: self.settings,
            images,
            mode,
            callback: self.callback,
        };
        thread::Builder::new()
            .name("smp-dfu".to_string())
            .spawn(move || performer.run())?;
        Ok(controller)
    }
}
