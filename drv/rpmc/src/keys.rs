// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Root key and HMAC key derivation.
//!
//! ```text
//! root key = HMAC-SHA256(key = device identity, message = domain tag)
//! HMAC key = HMAC-SHA256(key = root key,        message = 4-byte seed)
//! ```
//!
//! The device computes the second step on its own during Update HMAC Key,
//! so the host must derive its copy with the same seed it sends.

use drv_rpmc_api::{Hmac256, HmacKey, RootKey, Signature, SEED_LEN};
use hmac::{Hmac, Mac};
use sha2::Sha256;

pub const DOMAIN_TAG_LEN: usize = 32;

/// Fixed message used to derive root keys from device identities: an ASCII
/// tag, zero padded to 32 bytes.
///
/// Changing the tag changes every root key derived from it, so it has to
/// stay the same for the lifetime of the parts it was used to provision.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DomainTag([u8; DOMAIN_TAG_LEN]);

impl DomainTag {
    /// The tag used by the vendor's reference firmware; keeping it lets us
    /// talk to parts that were provisioned by it.
    pub const DEFAULT: Self = match Self::new(b"Nuvoton") {
        Some(tag) => tag,
        None => panic!(),
    };

    /// Zero pads `tag` to 32 bytes. Returns `None` if it doesn't fit.
    pub const fn new(tag: &[u8]) -> Option<Self> {
        if tag.len() > DOMAIN_TAG_LEN {
            return None;
        }
        let mut buf = [0; DOMAIN_TAG_LEN];
        let mut i = 0;
        while i < tag.len() {
            buf[i] = tag[i];
            i += 1;
        }
        Some(Self(buf))
    }

    pub fn as_bytes(&self) -> &[u8; DOMAIN_TAG_LEN] {
        &self.0
    }
}

impl Default for DomainTag {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Software HMAC-SHA256 from the `hmac` and `sha2` crates.
#[derive(Copy, Clone, Debug, Default)]
pub struct SoftHmac;

impl Hmac256 for SoftHmac {
    fn hmac_sha256(&mut self, key: &[u8], message: &[u8]) -> Signature {
        let mut mac = match Hmac::<Sha256>::new_from_slice(key) {
            Ok(mac) => mac,
            // HMAC hashes over-long keys and pads short ones.
            Err(_) => unreachable!(),
        };
        mac.update(message);
        mac.finalize().into_bytes().into()
    }
}

pub fn derive_root_key<H: Hmac256 + ?Sized>(
    hmac: &mut H,
    identity: &[u8],
    tag: &DomainTag,
) -> RootKey {
    RootKey::from_bytes(hmac.hmac_sha256(identity, tag.as_bytes()))
}

pub fn derive_hmac_key<H: Hmac256 + ?Sized>(
    hmac: &mut H,
    root: &RootKey,
    seed: &[u8; SEED_LEN],
) -> HmacKey {
    HmacKey::from_bytes(hmac.hmac_sha256(root.as_bytes(), seed))
}
