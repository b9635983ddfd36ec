// Copyright © 2026 Rudis Laboratories LLC

use log::warn;

use crate::error::{Error, Result};

/// Run `attempt` at `mtu`; if the link reports a packet as too large,
/// restart once from scratch below the failing size.
pub fn with_mtu_retry<T>(mtu: usize, mut attempt: impl FnMut(usize) -> Result<T>) -> Result<T> {
    match attempt(mtu) {
        Err(Error::InsufficientMtu { required, mtu: link }) => {
            let lowered = required.min(link).min(mtu).saturating_sub(1);
            warn!(
                "packet of {} bytes rejected (link MTU {}), restarting with MTU {}",
                required, link, lowered
            );
            attempt(lowered)
        }
        other => other,
    }
}
