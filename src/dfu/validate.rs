// Copyright © 2026 Rudis Laboratories LLC

//! Decides which steps an upgrade still needs from the device's slot state.

use log::{info, warn};

use super::image_set::TargetImage;
use super::task::Task;
use super::Mode;
use crate::default::McubootMode;
use crate::error::{Error, Result};
use crate::nmp_hdr::{ImageSlot, ImageStateRsp};

/// Reset-and-revalidate rounds allowed before giving up on a device whose
/// slots never clear.
pub const MAX_REVALIDATIONS: u32 = 3;

pub(crate) struct Plan<'a> {
    pub images: &'a [TargetImage],
    pub mode: Mode,
    pub slots: &'a ImageStateRsp,
    pub bootloader: Option<McubootMode>,
    pub erase_app_settings: bool,
    pub attempt: u32,
}

/// What a target image needs, judged from the slot holding its hash or
/// the slot it would be written to.
enum Verdict {
    /// Running and confirmed.
    Done,
    /// Running but not yet confirmed.
    ConfirmRunning,
    /// Written but not yet marked for boot.
    Mark { upload: bool },
    /// Marked for the next boot with a test or confirm request.
    Marked { permanent: bool },
    /// The target slot is occupied and must be cleared by a reboot.
    Blocked,
    /// The target slot holds the running image.
    Skip,
}

fn judge(target: &TargetImage, slots: &ImageStateRsp) -> Verdict {
    let found = slots
        .images
        .iter()
        .find(|s| s.image_index == target.image_index && s.hash == target.hash);
    if let Some(slot) = found {
        return match slot {
            ImageSlot {
                active: true,
                confirmed: true,
                ..
            } => Verdict::Done,
            ImageSlot { active: true, .. } => Verdict::ConfirmRunning,
            ImageSlot { pending: true, .. } => Verdict::Marked {
                permanent: slot.permanent,
            },
            _ => Verdict::Mark { upload: false },
        };
    }
    match slots.find_slot(target.image_index, target.slot) {
        Some(occupant) if occupant.active => Verdict::Skip,
        Some(occupant) if occupant.pending || occupant.confirmed => Verdict::Blocked,
        _ => Verdict::Mark { upload: true },
    }
}

impl Plan<'_> {
    /// The tasks that follow a validation.
    pub fn tasks(&self) -> Result<Vec<Task>> {
        let confirms_on_boot = self.bootloader.map_or(false, |m| m.confirms_on_boot());
        let mut tasks = Vec::new();
        let mut reset = false;
        let mut blocked = false;

        for target in self.images {
            let index = target.image_index;
            match judge(target, self.slots) {
                Verdict::Done => info!("image {} is already running and confirmed", index),
                Verdict::Skip => warn!(
                    "image {} slot {} holds the running image, skipping",
                    index, target.slot
                ),
                Verdict::Blocked => {
                    info!("image {} slot {} is occupied, reset needed", index, target.slot);
                    blocked = true;
                }
                Verdict::ConfirmRunning => {
                    if matches!(self.mode, Mode::ConfirmOnly | Mode::TestAndConfirm) {
                        tasks.push(Task::Confirm(target.clone()));
                    }
                }
                Verdict::Marked { permanent } => {
                    info!("image {} already marked for the next boot", index);
                    match self.mode {
                        Mode::None => {}
                        Mode::TestOnly => reset = true,
                        Mode::ConfirmOnly => {
                            if !permanent && !confirms_on_boot {
                                tasks.push(Task::Confirm(target.clone()));
                            }
                            reset = true;
                        }
                        Mode::TestAndConfirm => {
                            if !permanent && !confirms_on_boot {
                                tasks.push(Task::ConfirmAfterReset(target.clone()));
                            }
                            reset = true;
                        }
                    }
                }
                Verdict::Mark { upload } => {
                    if upload {
                        tasks.push(Task::Upload(target.clone()));
                    }
                    if self.mode == Mode::None {
                        continue;
                    }
                    reset = true;
                    if confirms_on_boot {
                        continue;
                    }
                    match self.mode {
                        Mode::TestOnly => tasks.push(Task::Test(target.clone())),
                        Mode::ConfirmOnly => tasks.push(Task::Confirm(target.clone())),
                        Mode::TestAndConfirm => {
                            tasks.push(Task::Test(target.clone()));
                            tasks.push(Task::ConfirmAfterReset(target.clone()));
                        }
                        Mode::None => {}
                    }
                }
            }
        }

        if blocked {
            if self.attempt >= MAX_REVALIDATIONS {
                return Err(Error::RevalidationLimitExceeded(self.attempt));
            }
            return Ok(vec![
                Task::ResetBeforeUpload,
                Task::Validate {
                    attempt: self.attempt + 1,
                },
            ]);
        }
        if reset {
            if self.erase_app_settings {
                tasks.push(Task::EraseStorage);
            }
            tasks.push(Task::Reset);
        }
        Ok(tasks)
    }
}
