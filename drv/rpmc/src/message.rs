// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire layouts of the RPMC instructions and of the Request Counter
//! response.
//!
//! Every instruction starts with the same four-byte [`Header`]; the bytes
//! that get signed are exactly the bytes that go on the wire ahead of the
//! signature (for Write Root Key the key itself travels unsigned).

use core::mem::size_of;

use drv_rpmc_api::{
    Checkout, CommandType, Counter, CounterAddress, Hmac256, Opcode,
    Signature, Tag, COUNTER_LEN, HEADER_LEN, SEED_LEN, SIGNATURE_LEN, TAG_LEN,
    TRUNCATED_SIGNATURE_LEN,
};
use static_assertions::const_assert_eq;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, Immutable, Unaligned)]
#[repr(C)]
pub struct Header {
    opcode: u8,
    cmd_type: u8,
    counter_index: u8,
    reserved: u8,
}

impl Header {
    pub fn new(cmd: CommandType, addr: CounterAddress) -> Self {
        Self {
            opcode: Opcode::Instruction.into(),
            cmd_type: cmd.into(),
            counter_index: addr.index(),
            reserved: 0,
        }
    }
}

/// Write Root Key. The 32-byte root key and the truncated signature
/// follow this on the wire.
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, Unaligned)]
#[repr(C)]
pub struct WriteRootKey {
    header: Header,
}

#[derive(Copy, Clone, Debug, IntoBytes, Immutable, Unaligned)]
#[repr(C)]
pub struct UpdateHmacKey {
    header: Header,
    seed: [u8; SEED_LEN],
}

#[derive(Copy, Clone, Debug, IntoBytes, Immutable, Unaligned)]
#[repr(C)]
pub struct IncreaseCounter {
    header: Header,
    counter: [u8; COUNTER_LEN],
}

#[derive(Copy, Clone, Debug, IntoBytes, Immutable, Unaligned)]
#[repr(C)]
pub struct RequestCounter {
    header: Header,
    tag: [u8; TAG_LEN],
}

/// What the device signs when answering Request Counter.
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, Unaligned)]
#[repr(C)]
pub struct CounterResponse {
    tag: [u8; TAG_LEN],
    counter: [u8; COUNTER_LEN],
}

/// The bytes following the status byte in a checkout read.
#[derive(
    Copy, Clone, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
#[repr(C)]
pub struct CheckoutBytes {
    tag: [u8; TAG_LEN],
    counter: [u8; COUNTER_LEN],
    signature: [u8; SIGNATURE_LEN],
}

const_assert_eq!(size_of::<Header>(), HEADER_LEN);
const_assert_eq!(size_of::<WriteRootKey>(), 4);
const_assert_eq!(size_of::<UpdateHmacKey>(), 8);
const_assert_eq!(size_of::<IncreaseCounter>(), 8);
const_assert_eq!(size_of::<RequestCounter>(), 16);
const_assert_eq!(size_of::<CounterResponse>(), 16);
const_assert_eq!(size_of::<CheckoutBytes>(), 48);

impl WriteRootKey {
    pub fn new(addr: CounterAddress) -> Self {
        Self {
            header: Header::new(CommandType::WriteRootKey, addr),
        }
    }
}

impl UpdateHmacKey {
    pub fn new(addr: CounterAddress, seed: &[u8; SEED_LEN]) -> Self {
        Self {
            header: Header::new(CommandType::UpdateHmacKey, addr),
            seed: *seed,
        }
    }
}

impl IncreaseCounter {
    pub fn new(addr: CounterAddress, counter: &Counter) -> Self {
        Self {
            header: Header::new(CommandType::IncreaseCounter, addr),
            counter: *counter.as_bytes(),
        }
    }
}

impl RequestCounter {
    pub fn new(addr: CounterAddress, tag: &Tag) -> Self {
        Self {
            header: Header::new(CommandType::RequestCounter, addr),
            tag: *tag.as_bytes(),
        }
    }
}

impl CounterResponse {
    pub fn new(tag: &Tag, counter: &Counter) -> Self {
        Self {
            tag: *tag.as_bytes(),
            counter: *counter.as_bytes(),
        }
    }
}

impl From<CheckoutBytes> for Checkout {
    fn from(raw: CheckoutBytes) -> Self {
        Checkout {
            tag: Tag(raw.tag),
            counter: Counter::from_be_bytes(raw.counter),
            signature: raw.signature,
        }
    }
}

/// Computes `HMAC-SHA256(key, message)` over the wire bytes of `message`.
pub fn sign<H, M>(hmac: &mut H, key: &[u8], message: &M) -> Signature
where
    H: Hmac256 + ?Sized,
    M: IntoBytes + Immutable,
{
    hmac.hmac_sha256(key, message.as_bytes())
}

/// The part of a Write Root Key signature that goes on the wire: the last
/// 224 bits.
pub fn truncate(signature: &Signature) -> &[u8; TRUNCATED_SIGNATURE_LEN] {
    let (_, tail) = signature.split_at(SIGNATURE_LEN - TRUNCATED_SIGNATURE_LEN);
    match tail.try_into() {
        Ok(tail) => tail,
        Err(_) => unreachable!(),
    }
}

/// Compares two signatures without exiting early on the first difference.
pub fn signatures_match(a: &Signature, b: &Signature) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
