// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Strategies for waiting out the device's busy bit.

use embedded_hal::blocking::delay::DelayUs;

use crate::config::PollConfig;

/// Decides what to do each time a status read finds the device busy.
pub trait BusyPoll {
    /// Called after the `attempts`th consecutive busy status read (counting
    /// from 1). Returns `true` to read the status again, or `false` to give
    /// up, in which case the driver reports
    /// [`RpmcError::BusyTimeout`](drv_rpmc_api::RpmcError::BusyTimeout).
    fn retry(&mut self, attempts: u32) -> bool;
}

/// Re-reads the status immediately, forever.
///
/// A device that never clears its busy bit hangs the caller; only use this
/// where a watchdog covers that case.
#[derive(Copy, Clone, Debug, Default)]
pub struct Spin;

impl BusyPoll for Spin {
    fn retry(&mut self, _attempts: u32) -> bool {
        core::hint::spin_loop();
        true
    }
}

/// Sleeps between status reads with exponential backoff, and gives up after
/// a configured number of busy reads.
pub struct Backoff<D> {
    config: PollConfig,
    delay: D,
}

impl<D: DelayUs<u32>> Backoff<D> {
    pub fn new(config: PollConfig, delay: D) -> Self {
        Self { config, delay }
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    pub fn release(self) -> D {
        self.delay
    }
}

impl<D: DelayUs<u32>> BusyPoll for Backoff<D> {
    fn retry(&mut self, attempts: u32) -> bool {
        if self.config.max_attempts != 0 && attempts >= self.config.max_attempts
        {
            return false;
        }
        let us = self.config.delay_for(attempts);
        if us != 0 {
            self.delay.delay_us(us);
        }
        true
    }
}
