// Copyright © 2026 Rudis Laboratories LLC

use log::debug;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    None,
    Transfer,
    Paused,
    Closed,
}

#[derive(Debug)]
struct Inner {
    state: TransferState,
    canceled: bool,
}

/// Pause/resume/cancel handle shared between a running transfer and its owner.
///
/// ```text
/// None ──start──▶ Transfer ◀──resume── Paused
///                    │ ──pause──────────▶ │
///                    └──cancel/complete/fail──▶ Closed
/// ```
#[derive(Debug)]
pub struct TransferController {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl Default for TransferController {
    fn default() -> Self {
        TransferController::new()
    }
}

impl TransferController {
    pub fn new() -> TransferController {
        TransferController {
            inner: Mutex::new(Inner {
                state: TransferState::None,
                canceled: false,
            }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> TransferState {
        self.lock().state
    }

    pub fn is_canceled(&self) -> bool {
        self.lock().canceled
    }

    /// Stop issuing requests. Requests already on the wire still complete.
    pub fn pause(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            TransferState::None | TransferState::Transfer => {
                inner.state = TransferState::Paused;
                debug!("transfer paused");
                true
            }
            _ => false,
        }
    }

    pub fn resume(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            TransferState::None | TransferState::Paused => {
                inner.state = TransferState::Transfer;
                self.cond.notify_all();
                debug!("transfer resumed");
                true
            }
            _ => false,
        }
    }

    /// Close the transfer. Returns false if it was already closed.
    pub fn cancel(&self) -> bool {
        let mut inner = self.lock();
        if inner.state == TransferState::Closed {
            return false;
        }
        inner.state = TransferState::Closed;
        inner.canceled = true;
        self.cond.notify_all();
        debug!("transfer canceled");
        true
    }

    /// Enter the transfer state. A pause issued before the start is kept.
    pub(crate) fn begin(&self) -> Result<()> {
        let mut inner = self.lock();
        match inner.state {
            TransferState::None => {
                inner.state = TransferState::Transfer;
                Ok(())
            }
            TransferState::Transfer | TransferState::Paused => Ok(()),
            TransferState::Closed if inner.canceled => Err(Error::Aborted),
            TransferState::Closed => Err(Error::InvalidArgument(
                "transfer already closed".to_string(),
            )),
        }
    }

    /// Block while paused. Fails with `Aborted` once canceled.
    pub(crate) fn wait_while_paused(&self) -> Result<()> {
        let mut inner = self.lock();
        loop {
            match inner.state {
                TransferState::Paused => {
                    inner = self.cond.wait(inner).unwrap_or_else(PoisonError::into_inner);
                }
                TransferState::Closed if inner.canceled => return Err(Error::Aborted),
                _ => return Ok(()),
            }
        }
    }

    pub(crate) fn check_canceled(&self) -> Result<()> {
        if self.is_canceled() {
            Err(Error::Aborted)
        } else {
            Ok(())
        }
    }

    pub(crate) fn close(&self) {
        let mut inner = self.lock();
        inner.state = TransferState::Closed;
        self.cond.notify_all();
    }
}
