// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! API crate for the RPMC (Replay-Protected Monotonic Counter) driver.
//!
//! This holds the wire constants of the JEDEC RPMC extension to SPI NOR
//! flash, the data model shared between the driver and its callers, and the
//! two collaborator traits the driver is built on: [`RpmcBus`] for the raw
//! byte exchange and [`Hmac256`] for the HMAC-SHA256 primitive.

#![cfg_attr(not(test), no_std)]

use bitflags::bitflags;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of a monotonic counter value on the wire.
pub const COUNTER_LEN: usize = 4;

/// Length of the caller-supplied tag echoed back by Request Counter.
pub const TAG_LEN: usize = 12;

/// Length of a full HMAC-SHA256 signature.
pub const SIGNATURE_LEN: usize = 32;

/// Length of the truncated signature sent with Write Root Key.
pub const TRUNCATED_SIGNATURE_LEN: usize = 28;

/// Length of both root keys and HMAC keys.
pub const KEY_LEN: usize = 32;

/// Length of the key data sent with Update HMAC Key.
pub const SEED_LEN: usize = 4;

/// Length of the RPMC instruction header: opcode, command type, counter
/// index and a reserved byte.
pub const HEADER_LEN: usize = 4;

pub const JEDEC_ID_LEN: usize = 3;
pub const UNIQUE_ID_LEN: usize = 8;

/// Number of independent counters on the parts we support.
pub const COUNTER_SLOTS: u8 = 4;

/// SPI opcodes used by the driver.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Opcode {
    /// Reads the 64-bit factory unique ID; followed by 4 dummy bytes.
    ReadUniqueId = 0x4B,
    /// Reads the RPMC extended status, optionally followed by the tag,
    /// counter and signature produced by the last Request Counter.
    ReadStatus = 0x96,
    /// All four RPMC instructions share this opcode and are told apart by
    /// the command type byte that follows it.
    Instruction = 0x9B,
    ReadJedecId = 0x9F,
}

impl From<Opcode> for u8 {
    fn from(op: Opcode) -> u8 {
        op as u8
    }
}

/// The command type byte following [`Opcode::Instruction`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum CommandType {
    WriteRootKey = 0,
    UpdateHmacKey = 1,
    IncreaseCounter = 2,
    RequestCounter = 3,
}

impl From<CommandType> for u8 {
    fn from(c: CommandType) -> u8 {
        c as u8
    }
}

impl TryFrom<u8> for CommandType {
    type Error = u8;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        Self::from_u8(b).ok_or(b)
    }
}

/// One of the device's counter slots, numbered from 1.
///
/// On the wire the slot is sent as a zero-based index; use
/// [`CounterAddress::index`] for that.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CounterAddress(u8);

/// A counter address outside `1..=COUNTER_SLOTS`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BadCounterAddress(pub u8);

impl CounterAddress {
    pub const ALL: [Self; COUNTER_SLOTS as usize] =
        [Self(1), Self(2), Self(3), Self(4)];

    pub const fn new(addr: u8) -> Option<Self> {
        if addr >= 1 && addr <= COUNTER_SLOTS {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Looks up a slot by its zero-based wire index.
    pub const fn from_index(index: u8) -> Option<Self> {
        if index < COUNTER_SLOTS {
            Some(Self(index + 1))
        } else {
            None
        }
    }

    pub const fn get(self) -> u8 {
        self.0
    }

    pub const fn index(self) -> u8 {
        self.0 - 1
    }
}

impl TryFrom<u8> for CounterAddress {
    type Error = BadCounterAddress;

    fn try_from(addr: u8) -> Result<Self, Self::Error> {
        Self::new(addr).ok_or(BadCounterAddress(addr))
    }
}

/// Freshness input for Request Counter: a nonce, timestamp or serial
/// number chosen by the caller and echoed back by the device.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Tag(pub [u8; TAG_LEN]);

impl Tag {
    pub fn as_bytes(&self) -> &[u8; TAG_LEN] {
        &self.0
    }
}

impl From<[u8; TAG_LEN]> for Tag {
    fn from(bytes: [u8; TAG_LEN]) -> Self {
        Self(bytes)
    }
}

/// A monotonic counter value as the device reports it: four bytes, big
/// endian.
///
/// The bytes are kept as received so that they can be echoed back into an
/// Increase Counter message unchanged.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Counter([u8; COUNTER_LEN]);

impl Counter {
    pub const fn new(value: u32) -> Self {
        Self(value.to_be_bytes())
    }

    pub const fn from_be_bytes(bytes: [u8; COUNTER_LEN]) -> Self {
        Self(bytes)
    }

    pub const fn value(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; COUNTER_LEN] {
        &self.0
    }
}

pub type Signature = [u8; SIGNATURE_LEN];

/// The long-lived secret anchoring a counter slot.
///
/// A root key can be written to a slot exactly once; after that the device
/// only accepts HMAC key updates signed with keys derived from it.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct RootKey([u8; KEY_LEN]);

impl RootKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

/// The session key derived from a [`RootKey`] and a 4-byte seed.
///
/// The host and the device each derive this independently during Update
/// HMAC Key; if the host holds a different key than the device, every
/// subsequent signature fails to verify.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct HmacKey([u8; KEY_LEN]);

impl HmacKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

bitflags! {
    /// The RPMC extended status byte.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct Status: u8 {
        /// The device is still executing the last instruction.
        const BUSY = 1 << 0;
        /// Root key already written to this slot. Also reported for a bad
        /// truncated signature, counter address or payload size on Write
        /// Root Key.
        const ROOT_KEY_OVERWRITE = 1 << 1;
        /// Signature mismatch. Also reported for a bad command type,
        /// counter address or payload size.
        const SIGNATURE_MISMATCH = 1 << 2;
        /// No HMAC key has been established for this slot since power on.
        const HMAC_KEY_UNINITIALIZED = 1 << 3;
        /// The counter sent with Increase Counter is not the current value.
        const COUNTER_MISMATCH = 1 << 4;
        /// The last instruction completed successfully.
        const SUCCESS = 1 << 7;

        const _ = !0;
    }
}

impl Status {
    pub const ERRORS: Self = Self::ROOT_KEY_OVERWRITE
        .union(Self::SIGNATURE_MISMATCH)
        .union(Self::HMAC_KEY_UNINITIALIZED)
        .union(Self::COUNTER_MISMATCH);

    pub fn is_busy(self) -> bool {
        self.contains(Self::BUSY)
    }

    pub fn is_success(self) -> bool {
        self.contains(Self::SUCCESS) && !self.intersects(Self::ERRORS)
    }

    /// Returns only the error bits of this status.
    pub fn errors(self) -> Self {
        self.intersection(Self::ERRORS)
    }
}

impl From<u8> for Status {
    fn from(bits: u8) -> Self {
        Self::from_bits_retain(bits)
    }
}

/// The tag, counter and signature the device emits after the status byte
/// once a Request Counter has completed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Checkout {
    pub tag: Tag,
    pub counter: Counter,
    pub signature: Signature,
}

/// Outcome of comparing a checked-out signature against the one recomputed
/// by the host.
///
/// A mismatch can mean a stale HMAC key, corruption on the bus, or a replay
/// or tamper attempt; the driver does not try to tell these apart.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Challenge {
    Match(Counter),
    Mismatch(Checkout),
    /// The device refused the Request Counter (most often because the HMAC
    /// key is stale or was never established), so there was nothing fresh
    /// to check out.
    Rejected(Status),
}

impl Challenge {
    pub fn is_match(&self) -> bool {
        matches!(self, Challenge::Match(_))
    }
}

/// Which identifier to read when seeding root key derivation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IdentitySource {
    JedecId,
    UniqueId,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DeviceIdentity {
    Jedec([u8; JEDEC_ID_LEN]),
    Unique([u8; UNIQUE_ID_LEN]),
}

impl DeviceIdentity {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            DeviceIdentity::Jedec(id) => id,
            DeviceIdentity::Unique(id) => id,
        }
    }
}

/// Errors that can be produced by the RPMC driver.
///
/// `E` is the error type of the underlying [`RpmcBus`]. Note that a failed
/// signature check is normally reported as [`Challenge::Mismatch`] rather
/// than as an error; [`RpmcError::SignatureMismatch`] is only produced by
/// calls that need a verified counter to go on, such as reading one back
/// or increasing it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RpmcError<E> {
    Bus(E),
    /// The busy-poll strategy gave up before the device went idle.
    BusyTimeout { attempts: u32 },
    BadCounterAddress(u8),
    SignatureMismatch,
    /// The device refused the Request Counter that had to precede the
    /// operation.
    RequestRejected(Status),
}

impl<E> From<BadCounterAddress> for RpmcError<E> {
    fn from(e: BadCounterAddress) -> Self {
        RpmcError::BadCounterAddress(e.0)
    }
}

/// Raw byte exchange with the flash part.
///
/// Everything sent between `select` and `deselect` forms one chip-select
/// window. The driver keeps an entire instruction inside a single window,
/// so an implementation shared between several users must hold the bus
/// for the whole window (the way `Spi::lock(CsState::Asserted)` does).
pub trait RpmcBus {
    type Error: Copy;

    /// Asserts chip select.
    fn select(&mut self) -> Result<(), Self::Error>;

    /// Deasserts chip select.
    fn deselect(&mut self) -> Result<(), Self::Error>;

    /// Clocks `out` onto the bus and returns the byte clocked in at the
    /// same time.
    fn transfer(&mut self, out: u8) -> Result<u8, Self::Error>;
}

impl<B: RpmcBus + ?Sized> RpmcBus for &mut B {
    type Error = B::Error;

    fn select(&mut self) -> Result<(), Self::Error> {
        (**self).select()
    }

    fn deselect(&mut self) -> Result<(), Self::Error> {
        (**self).deselect()
    }

    fn transfer(&mut self, out: u8) -> Result<u8, Self::Error> {
        (**self).transfer(out)
    }
}

/// HMAC-SHA256, in software or in a hash accelerator.
pub trait Hmac256 {
    fn hmac_sha256(&mut self, key: &[u8], message: &[u8]) -> Signature;
}
