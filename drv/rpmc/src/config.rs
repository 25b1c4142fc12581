// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driver configuration.
//!
//! Everything has a sensible default, so a board only needs to spell out
//! what it changes, e.g. in its task's config table:
//!
//! ```toml
//! [poll]
//! max_attempts = 500
//! max_delay_us = 2000
//! ```

use core::fmt;

use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;

use crate::keys::{DomainTag, DOMAIN_TAG_LEN};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub poll: PollConfig,
    pub domain_tag: DomainTag,
}

impl Config {
    pub const DEFAULT: Self = Self {
        poll: PollConfig::DEFAULT,
        domain_tag: DomainTag::DEFAULT,
    };
}

impl Default for Config {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// How long to wait for the device to clear its busy bit.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollConfig {
    /// Number of busy status reads tolerated before giving up; 0 waits
    /// forever.
    pub max_attempts: u32,
    /// Delay after the first busy read. Doubles on each further read.
    pub initial_delay_us: u32,
    pub max_delay_us: u32,
}

impl PollConfig {
    /// Roughly ten seconds worst case, which comfortably covers root key
    /// programming on the parts we have seen.
    pub const DEFAULT: Self = Self {
        max_attempts: 10_000,
        initial_delay_us: 1,
        max_delay_us: 1_000,
    };

    /// Re-reads the status back to back, forever.
    pub const SPIN: Self = Self {
        max_attempts: 0,
        initial_delay_us: 0,
        max_delay_us: 0,
    };

    /// Delay to apply after the `attempts`th busy read.
    pub fn delay_for(&self, attempts: u32) -> u32 {
        let shift = attempts.saturating_sub(1).min(32);
        let us = u64::from(self.initial_delay_us) << shift;
        us.min(u64::from(self.max_delay_us)) as u32
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl<'de> Deserialize<'de> for DomainTag {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        struct TagVisitor;

        impl Visitor<'_> for TagVisitor {
            type Value = DomainTag;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "a tag of at most {DOMAIN_TAG_LEN} bytes")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<DomainTag, E> {
                DomainTag::new(v.as_bytes())
                    .ok_or_else(|| E::invalid_length(v.len(), &self))
            }
        }

        d.deserialize_str(TagVisitor)
    }
}
