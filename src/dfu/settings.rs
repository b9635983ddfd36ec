// Copyright © 2026 Rudis Laboratories LLC

use std::sync::Arc;
use std::time::Duration;

use crate::transfer::UploadOptions;
use crate::transport::Transport;

/// How long a reset waits for the link to drop before carrying on.
pub const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Parameters of one upgrade session. Read-only once the session starts.
#[derive(Clone)]
pub struct Settings {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) estimated_swap_time: Duration,
    pub(crate) window_capacity: usize,
    pub(crate) memory_alignment: usize,
    pub(crate) erase_app_settings: bool,
    pub(crate) disconnect_timeout: Duration,
}

impl Settings {
    pub fn new(transport: Arc<dyn Transport>) -> Settings {
        Settings {
            transport,
            estimated_swap_time: Duration::ZERO,
            window_capacity: 1,
            memory_alignment: 1,
            erase_app_settings: false,
            disconnect_timeout: DEFAULT_DISCONNECT_TIMEOUT,
        }
    }

    /// Time the bootloader needs to swap images after a reset.
    pub fn estimated_swap_time(mut self, swap_time: Duration) -> Settings {
        self.estimated_swap_time = swap_time;
        self
    }

    pub fn window_capacity(mut self, capacity: usize) -> Settings {
        self.window_capacity = capacity.max(1);
        self
    }

    pub fn memory_alignment(mut self, alignment: usize) -> Settings {
        self.memory_alignment = alignment.max(1);
        self
    }

    /// Erase application settings before the final reset.
    pub fn erase_app_settings(mut self, erase: bool) -> Settings {
        self.erase_app_settings = erase;
        self
    }

    pub fn disconnect_timeout(mut self, timeout: Duration) -> Settings {
        self.disconnect_timeout = timeout;
        self
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn upload_options(&self) -> UploadOptions {
        UploadOptions {
            window_capacity: self.window_capacity,
            memory_alignment: self.memory_alignment,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_device::TestDevice;

    #[test]
    fn builder_clamps_to_one() {
        let settings = Settings::new(TestDevice::new())
            .window_capacity(0)
            .memory_alignment(0)
            .estimated_swap_time(Duration::from_secs(3));
        let options = settings.upload_options();
        assert_eq!((options.window_capacity, options.memory_alignment), (1, 1));
        assert_eq!(settings.estimated_swap_time, Duration::from_secs(3));
        assert!(!settings.erase_app_settings);
        assert_eq!(settings.disconnect_timeout, DEFAULT_DISCONNECT_TIMEOUT);
    }
}
