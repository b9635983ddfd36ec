// Copyright © 2026 Rudis Laboratories LLC

//! Runs an upgrade's task queue on a dedicated thread.
//!
//! One task runs at a time. Tasks return the tasks they discovered, which
//! are queued by priority. Callbacks are invoked from the driver thread
//! without the session lock held.

use log::{debug, info, warn};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::image_set::ImageSet;
use super::settings::Settings;
use super::task::{Task, TaskQueue};
use super::validate::Plan;
use super::{FirmwareUpgradeCallback, Mode, State};
use crate::basic::BasicManager;
use crate::default::{DefaultManager, McubootMode};
use crate::error::{Error, Result, ReturnCode};
use crate::image::ImageManager;
use crate::transfer::TransferController;
use crate::transport::{connect_blocking, ConnectionObserver};

/// Granularity of waits that must notice a cancel.
const CANCEL_POLL: Duration = Duration::from_millis(100);

pub(crate) struct Inner {
    pub state: State,
    pub queue: TaskQueue,
    pub transfer: Option<Arc<TransferController>>,
    pub paused: bool,
    pub canceled: bool,
    pub finished: bool,
}

/// Session state shared by the driver thread and the controller.
pub(crate) struct Shared {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl Shared {
    pub fn new() -> Shared {
        Shared {
            inner: Mutex::new(Inner {
                state: State::None,
                queue: TaskQueue::default(),
                transfer: None,
                paused: false,
                canceled: false,
                finished: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn notify(&self) {
        self.cond.notify_all();
    }

    pub fn wait_finished(&self) {
        let mut inner = self.lock();
        while !inner.finished {
            inner = self.cond.wait(inner).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Next task once not paused; `None` when canceled or out of work.
    fn next_task(&self) -> Option<Task> {
        let mut inner = self.lock();
        while inner.paused && !inner.canceled {
            inner = self.cond.wait(inner).unwrap_or_else(PoisonError::into_inner);
        }
        if inner.canceled {
            return None;
        }
        inner.queue.pop()
    }

    fn is_canceled(&self) -> bool {
        self.lock().canceled
    }

    fn check_canceled(&self) -> Result<()> {
        if self.is_canceled() {
            return Err(Error::Aborted);
        }
        Ok(())
    }

    /// Sleep until `deadline`, waking early on cancel.
    fn sleep_until(&self, deadline: Instant) -> Result<()> {
        let mut inner = self.lock();
        loop {
            if inner.canceled {
                return Err(Error::Aborted);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            inner = self
                .cond
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// How a session ended.
enum Outcome {
    Completed,
    Failed(State, Error),
    Canceled(State),
}

struct DisconnectObserver {
    tx: Mutex<mpsc::Sender<Instant>>,
}

impl ConnectionObserver for DisconnectObserver {
    fn on_disconnected(&self) {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = tx.send(Instant::now());
    }
}

pub(crate) struct Performer {
    pub shared: Arc<Shared>,
    pub settings: Settings,
    pub images: ImageSet,
    pub mode: Mode,
    pub callback: Box<dyn FirmwareUpgradeCallback>,
}

impl Performer {
    /// Drive the queue to completion, then report exactly one outcome.
    pub fn run(mut self) {
        let outcome = self.drive();
        let callback = &mut self.callback;
        match outcome {
            Outcome::Completed => {
                info!("upgrade complete");
                callback.on_upgrade_completed();
            }
            Outcome::Failed(state, e) => {
                warn!("upgrade failed in state {:?}: {}", state, e);
                callback.on_upgrade_failed(state, e);
            }
            Outcome::Canceled(state) => {
                info!("upgrade canceled in state {:?}", state);
                callback.on_upgrade_canceled(state);
            }
        }
        let mut inner = self.shared.lock();
        inner.finished = true;
        inner.transfer = None;
        inner.queue.clear();
        drop(inner);
        self.shared.notify();
    }

    fn drive(&mut self) -> Outcome {
        loop {
            let Some(task) = self.shared.next_task() else {
                let inner = self.shared.lock();
                return if inner.canceled {
                    Outcome::Canceled(inner.state)
                } else {
                    Outcome::Completed
                };
            };

            let new = task.state();
            let prev = std::mem::replace(&mut self.shared.lock().state, new);
            if prev != new {
                self.callback.on_state_changed(prev, new);
            }

            debug!("perform {:?}, {} queued", task, self.shared.lock().queue.len());
            match self.perform(&task) {
                Ok(discovered) => {
                    let mut inner = self.shared.lock();
                    if !inner.canceled {
                        for task in discovered {
                            inner.queue.push(task);
                        }
                    }
                }
                Err(_) if self.shared.is_canceled() => return Outcome::Canceled(new),
                Err(Error::Aborted) => return Outcome::Canceled(new),
                Err(e) => {
                    self.shared.lock().queue.clear();
                    return Outcome::Failed(new, e);
                }
            }
        }
    }

    fn perform(&mut self, task: &Task) -> Result<Vec<Task>> {
        let transport = self.settings.transport.clone();
        match task {
            Task::Validate { attempt } => self.validate(*attempt),
            Task::Upload(target) => {
                let controller = Arc::new(TransferController::new());
                {
                    let mut inner = self.shared.lock();
                    if inner.canceled {
                        return Err(Error::Aborted);
                    }
                    if inner.paused {
                        controller.pause();
                    }
                    inner.transfer = Some(controller.clone());
                }
                let callback = &mut self.callback;
                let result = ImageManager::new(transport).upload(
                    target.image_index,
                    target.data.clone(),
                    self.settings.upload_options(),
                    &controller,
                    &mut |current, total, at| callback.on_upload_progress_changed(current, total, at),
                );
                self.shared.lock().transfer = None;
                result.map(|_| Vec::new())
            }
            Task::EraseStorage => match BasicManager::new(transport).erase_storage() {
                Ok(()) => Ok(Vec::new()),
                Err(Error::Device { rc, group_rc })
                    if group_rc.is_some() || rc == ReturnCode::NotSupported as i32 =>
                {
                    warn!("erase storage not available on this device, continuing");
                    Ok(Vec::new())
                }
                Err(e) => Err(e),
            },
            Task::Test(target) => {
                let state = ImageManager::new(transport).test(&target.hash)?;
                match state.find_by_hash(&target.hash) {
                    Some(slot) if slot.pending => Ok(Vec::new()),
                    _ => Err(Error::ImageNotPending),
                }
            }
            Task::Confirm(target) => self.confirm(&target.hash),
            Task::ConfirmAfterReset(target) => {
                connect_blocking(&*transport)?;
                self.confirm(&target.hash)
            }
            Task::Reset | Task::ResetBeforeUpload => {
                self.reset()?;
                Ok(Vec::new())
            }
        }
    }

    fn validate(&self, attempt: u32) -> Result<Vec<Task>> {
        let transport = self.settings.transport.clone();
        let bootloader = match DefaultManager::new(transport.clone()).bootloader_info(Some("mode")) {
            Ok(info) => {
                let mode = info.mode.and_then(McubootMode::from_i32);
                info!("bootloader {} mode {:?}", info.bootloader, mode);
                mode
            }
            Err(e) if !e.is_transport() => {
                debug!("bootloader info unavailable: {}", e);
                None
            }
            Err(e) => return Err(e),
        };
        let slots = ImageManager::new(transport).list()?;
        Plan {
            images: self.images.images(),
            mode: self.mode,
            slots: &slots,
            bootloader,
            erase_app_settings: self.settings.erase_app_settings,
            attempt,
        }
        .tasks()
    }

    fn confirm(&self, hash: &[u8]) -> Result<Vec<Task>> {
        let state = ImageManager::new(self.settings.transport.clone()).confirm(Some(hash))?;
        match state.find_by_hash(hash) {
            Some(slot) if slot.confirmed || slot.permanent => Ok(Vec::new()),
            Some(_) => Err(Error::ImageNotConfirmed),
            None => {
                warn!("confirmed image not listed by the device, assuming success");
                Ok(Vec::new())
            }
        }
    }

    /// Reset and give the bootloader its swap time, counted from the later
    /// of the acknowledgement and the disconnect.
    fn reset(&self) -> Result<()> {
        let transport = self.settings.transport.clone();
        let (tx, rx) = mpsc::channel();
        let observer: Arc<dyn ConnectionObserver> = Arc::new(DisconnectObserver { tx: Mutex::new(tx) });
        transport.add_observer(observer.clone());

        let result = DefaultManager::new(transport.clone()).reset(false);
        let acked = Instant::now();
        let disconnected = match result {
            Ok(()) => self.wait_disconnect(&rx),
            Err(e) if e.is_transport() => {
                // the device may reboot before its answer gets out
                warn!("reset not acknowledged: {}", e);
                self.wait_disconnect(&rx)
            }
            Err(e) => Err(e),
        };
        transport.remove_observer(&observer);

        let reference = match disconnected? {
            Some(at) => at.max(acked),
            None => {
                warn!(
                    "no disconnect within {:?}, timing the swap from the reset acknowledgement",
                    self.settings.disconnect_timeout
                );
                acked
            }
        };
        let deadline = reference + self.settings.estimated_swap_time;
        if deadline > Instant::now() {
            info!("waiting {:?} for the image swap", deadline - Instant::now());
        }
        self.shared.sleep_until(deadline)
    }

    fn wait_disconnect(&self, rx: &mpsc::Receiver<Instant>) -> Result<Option<Instant>> {
        let deadline = Instant::now() + self.settings.disconnect_timeout;
        loop {
            self.shared.check_canceled()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            match rx.recv_timeout(CANCEL_POLL.min(deadline - now)) {
                Ok(at) => return Ok(Some(at)),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Ok(None),
            }
        }
    }
}
