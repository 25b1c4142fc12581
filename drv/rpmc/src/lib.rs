// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driver for the JEDEC Replay-Protected Monotonic Counter (RPMC) extension
//! to SPI NOR flash.
//!
//! An RPMC part carries a handful of monotonic counters. Each counter slot
//! is anchored by a root key that can be written exactly once; after that,
//! the host establishes a session HMAC key per slot (Update HMAC Key) and
//! uses it to sign requests to read (Request Counter) and bump (Increase
//! Counter) the slot's counter. The device signs what it returns with the
//! same key, which lets the host tell a genuine counter value from a
//! replayed or forged one.
//!
//! Typical use:
//!
//! ```ignore
//! let mut rpmc = Rpmc::new(bus, SoftHmac, Spin);
//! let id = rpmc.read_identity(IdentitySource::UniqueId)?;
//! let root = rpmc.derive_root_key(&id);
//!
//! // Once, at provisioning time:
//! rpmc.write_root_key(addr, &root)?;
//!
//! // Every boot:
//! let (_, key) = rpmc.update_hmac_key(addr, &root, seed)?;
//! let counter = rpmc.read_counter(addr, &key, &fresh_tag)?;
//! ```
//!
//! # Bus usage
//!
//! Every instruction is sent within a single chip-select window, and the
//! window is closed again even if the exchange fails part way. The driver
//! never interleaves windows of its own, but if the bus is shared the
//! [`RpmcBus`] implementation must keep other users off it for the length
//! of each window.
//!
//! # Waiting
//!
//! Write Root Key, Update HMAC Key, Increase Counter and Request Counter
//! all leave the device busy for a while. How the driver waits is up to the
//! [`BusyPoll`] it is built with: [`Spin`] re-reads the status forever,
//! [`Backoff`] sleeps between reads and eventually gives up with
//! [`RpmcError::BusyTimeout`].
//!
//! # Errors the device reports
//!
//! Status bits other than busy (a root key written twice, a signature the
//! device rejected, a counter mismatch) are handed back to the caller in the
//! returned [`Status`] and never turned into errors here; what to do about
//! them is policy that belongs to the caller. The one exception is
//! [`Rpmc::read_counter`], which has no status to return and reports a
//! refused Request Counter as [`RpmcError::RequestRejected`].

#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod keys;
pub mod message;
pub mod poll;

pub use config::{Config, PollConfig};
pub use drv_rpmc_api::*;
pub use keys::{derive_hmac_key, derive_root_key, DomainTag, SoftHmac};
pub use poll::{Backoff, BusyPoll, Spin};

use embedded_hal::blocking::delay::DelayUs;
use ringbuf::*;
use zerocopy::{FromZeros, IntoBytes};

use message::{
    CheckoutBytes, CounterResponse, IncreaseCounter, RequestCounter,
    UpdateHmacKey, WriteRootKey,
};

#[derive(Copy, Clone, PartialEq)]
enum Trace {
    None,
    Instruction(CommandType, u8),
    Status(u8),
    BusyTimeout(u32),
    Checkout(u32),
    ChallengeMatch(u32),
    ChallengeMismatch { stale_tag: bool },
    RequestRejected(u8),
    BusError,
}

ringbuf!(Trace, 32, Trace::None);

/// Dummy bytes between [`Opcode::ReadUniqueId`] and the ID itself.
const UNIQUE_ID_DUMMY_LEN: usize = 4;

/// An RPMC flash part behind `bus`.
///
/// The driver holds no secrets and no device state between calls: root
/// keys, HMAC keys and checked-out counters all belong to the caller.
pub struct Rpmc<B, H = SoftHmac, P = Spin> {
    bus: B,
    hmac: H,
    poll: P,
    domain_tag: DomainTag,
}

impl<B: RpmcBus, H: Hmac256, D: DelayUs<u32>> Rpmc<B, H, Backoff<D>> {
    /// Builds a driver that waits on the device according to `config`,
    /// sleeping on `delay`.
    pub fn from_config(bus: B, hmac: H, delay: D, config: &Config) -> Self {
        Self::new(bus, hmac, Backoff::new(config.poll, delay))
            .with_domain_tag(config.domain_tag)
    }
}

impl<B: RpmcBus, H: Hmac256, P: BusyPoll> Rpmc<B, H, P> {
    pub fn new(bus: B, hmac: H, poll: P) -> Self {
        Self {
            bus,
            hmac,
            poll,
            domain_tag: DomainTag::DEFAULT,
        }
    }

    /// Replaces the tag used by [`Rpmc::derive_root_key`].
    pub fn with_domain_tag(mut self, domain_tag: DomainTag) -> Self {
        self.domain_tag = domain_tag;
        self
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn release(self) -> B {
        self.bus
    }

    /// Reads the 3-byte JEDEC manufacturer and device ID.
    pub fn read_jedec_id(
        &mut self,
    ) -> Result<[u8; JEDEC_ID_LEN], RpmcError<B::Error>> {
        let mut id = [0; JEDEC_ID_LEN];
        self.exchange(|bus| {
            send(bus, &[u8::from(Opcode::ReadJedecId)])?;
            recv(bus, &mut id)
        })?;
        Ok(id)
    }

    /// Reads the 8-byte factory-programmed unique ID.
    pub fn read_unique_id(
        &mut self,
    ) -> Result<[u8; UNIQUE_ID_LEN], RpmcError<B::Error>> {
        let mut id = [0; UNIQUE_ID_LEN];
        self.exchange(|bus| {
            send(bus, &[u8::from(Opcode::ReadUniqueId)])?;
            send(bus, &[0; UNIQUE_ID_DUMMY_LEN])?;
            recv(bus, &mut id)
        })?;
        Ok(id)
    }

    pub fn read_identity(
        &mut self,
        source: IdentitySource,
    ) -> Result<DeviceIdentity, RpmcError<B::Error>> {
        Ok(match source {
            IdentitySource::JedecId => {
                DeviceIdentity::Jedec(self.read_jedec_id()?)
            }
            IdentitySource::UniqueId => {
                DeviceIdentity::Unique(self.read_unique_id()?)
            }
        })
    }

    /// Derives the root key for a part from its identity and this driver's
    /// domain tag. Every slot on the part gets the same root key.
    pub fn derive_root_key(&mut self, identity: &DeviceIdentity) -> RootKey {
        keys::derive_root_key(
            &mut self.hmac,
            identity.as_bytes(),
            &self.domain_tag,
        )
    }

    /// Derives the HMAC key the device will hold after an Update HMAC Key
    /// with `seed`. This does not touch the device; see
    /// [`Rpmc::update_hmac_key`].
    pub fn derive_hmac_key(
        &mut self,
        root: &RootKey,
        seed: &[u8; SEED_LEN],
    ) -> HmacKey {
        keys::derive_hmac_key(&mut self.hmac, root, seed)
    }

    /// Reads the RPMC extended status.
    pub fn read_status(&mut self) -> Result<Status, RpmcError<B::Error>> {
        let status = self.exchange(|bus| {
            send(bus, &[u8::from(Opcode::ReadStatus), 0])?;
            recv_byte(bus)
        })?;
        let status = Status::from(status);
        ringbuf_entry!(Trace::Status(status.bits()));
        Ok(status)
    }

    /// Reads the RPMC extended status together with the tag, counter and
    /// signature produced by the last Request Counter.
    ///
    /// The device emits these right after the status byte, so they have to
    /// be read in the same window; what they hold when no Request Counter
    /// has completed is up to the device.
    pub fn read_status_checkout(
        &mut self,
    ) -> Result<(Status, Checkout), RpmcError<B::Error>> {
        let mut raw = CheckoutBytes::new_zeroed();
        let status = self.exchange(|bus| {
            send(bus, &[u8::from(Opcode::ReadStatus), 0])?;
            let status = recv_byte(bus)?;
            recv(bus, raw.as_mut_bytes())?;
            Ok(status)
        })?;
        let status = Status::from(status);
        let checkout = Checkout::from(raw);
        ringbuf_entry!(Trace::Status(status.bits()));
        ringbuf_entry!(Trace::Checkout(checkout.counter.value()));
        Ok((status, checkout))
    }

    /// Reads the status until the busy bit clears, as allowed by the
    /// driver's [`BusyPoll`], and returns the first idle status.
    pub fn wait_ready(&mut self) -> Result<Status, RpmcError<B::Error>> {
        let mut attempts = 0u32;
        loop {
            let status = self.read_status()?;
            if !status.is_busy() {
                return Ok(status);
            }
            attempts = attempts.saturating_add(1);
            if !self.poll.retry(attempts) {
                ringbuf_entry!(Trace::BusyTimeout(attempts));
                return Err(RpmcError::BusyTimeout { attempts });
            }
        }
    }

    /// Writes `root` as the root key of `addr` and waits for the device to
    /// finish.
    ///
    /// A slot's root key can only be written once. Writing it again is not
    /// an error as far as the driver is concerned; the device reports it in
    /// the returned status ([`Status::ROOT_KEY_OVERWRITE`]).
    pub fn write_root_key(
        &mut self,
        addr: CounterAddress,
        root: &RootKey,
    ) -> Result<Status, RpmcError<B::Error>> {
        let msg = WriteRootKey::new(addr);
        let signature = message::sign(&mut self.hmac, root.as_bytes(), &msg);

        ringbuf_entry!(Trace::Instruction(
            CommandType::WriteRootKey,
            addr.index()
        ));
        self.exchange(|bus| {
            send(bus, msg.as_bytes())?;
            send(bus, root.as_bytes())?;
            send(bus, message::truncate(&signature))
        })?;

        self.wait_ready()
    }

    /// Establishes a new HMAC key for `addr`, derived from `root` and
    /// `seed`, and returns the host's copy of it once the device is done.
    ///
    /// Hang on to the returned key: Request Counter and Increase Counter
    /// must be signed with it until the next update. If the returned status
    /// reports an error, the device did not take the new key.
    pub fn update_hmac_key(
        &mut self,
        addr: CounterAddress,
        root: &RootKey,
        seed: [u8; SEED_LEN],
    ) -> Result<(Status, HmacKey), RpmcError<B::Error>> {
        let key = keys::derive_hmac_key(&mut self.hmac, root, &seed);
        let msg = UpdateHmacKey::new(addr, &seed);
        let signature = message::sign(&mut self.hmac, key.as_bytes(), &msg);

        ringbuf_entry!(Trace::Instruction(
            CommandType::UpdateHmacKey,
            addr.index()
        ));
        self.exchange(|bus| {
            send(bus, msg.as_bytes())?;
            send(bus, &signature)
        })?;

        let status = self.wait_ready()?;
        Ok((status, key))
    }

    /// Sends Request Counter for `addr` and returns without waiting.
    ///
    /// The answer is collected with [`Rpmc::wait_ready`] followed by
    /// [`Rpmc::read_status_checkout`]; [`Rpmc::challenge`] does all of it.
    pub fn request_counter(
        &mut self,
        addr: CounterAddress,
        key: &HmacKey,
        tag: &Tag,
    ) -> Result<(), RpmcError<B::Error>> {
        let msg = RequestCounter::new(addr, tag);
        let signature = message::sign(&mut self.hmac, key.as_bytes(), &msg);

        ringbuf_entry!(Trace::Instruction(
            CommandType::RequestCounter,
            addr.index()
        ));
        self.exchange(|bus| {
            send(bus, msg.as_bytes())?;
            send(bus, &signature)
        })
    }

    /// Bumps the counter at `addr` by one.
    ///
    /// The device only accepts an increase that names the counter's current
    /// value, so this first reads the counter back with Request Counter
    /// (using `tag`) and echoes exactly what was checked out. There is no
    /// way to ask for a value the device didn't just report.
    ///
    /// Nothing is sent unless that read-back checks out: if the device
    /// refuses the Request Counter its status is returned as is, and a
    /// checkout that doesn't echo `tag` under a valid signature (say, the
    /// response to an earlier request) gives
    /// [`RpmcError::SignatureMismatch`].
    pub fn increase_counter(
        &mut self,
        addr: CounterAddress,
        key: &HmacKey,
        tag: &Tag,
    ) -> Result<Status, RpmcError<B::Error>> {
        let counter = match self.request_checkout(addr, key, tag)? {
            Challenge::Match(counter) => counter,
            Challenge::Mismatch(_) => return Err(RpmcError::SignatureMismatch),
            Challenge::Rejected(status) => return Ok(status),
        };

        let msg = IncreaseCounter::new(addr, &counter);
        let signature = message::sign(&mut self.hmac, key.as_bytes(), &msg);

        ringbuf_entry!(Trace::Instruction(
            CommandType::IncreaseCounter,
            addr.index()
        ));
        self.exchange(|bus| {
            send(bus, msg.as_bytes())?;
            send(bus, &signature)
        })?;

        self.wait_ready()
    }

    /// Reads the counter at `addr` and checks the device's signature over
    /// it.
    ///
    /// The response only matches if the device echoed `tag` and signed the
    /// tag and counter with `key`. A mismatch is not an error: it is
    /// returned as [`Challenge::Mismatch`] along with what the device sent.
    /// If the device refused the request outright, the checkout is not read
    /// at all and the status comes back as [`Challenge::Rejected`].
    pub fn challenge(
        &mut self,
        addr: CounterAddress,
        key: &HmacKey,
        tag: &Tag,
    ) -> Result<Challenge, RpmcError<B::Error>> {
        self.request_checkout(addr, key, tag)
    }

    /// Like [`Rpmc::challenge`], but only returns a counter that checked
    /// out.
    pub fn read_counter(
        &mut self,
        addr: CounterAddress,
        key: &HmacKey,
        tag: &Tag,
    ) -> Result<Counter, RpmcError<B::Error>> {
        match self.challenge(addr, key, tag)? {
            Challenge::Match(counter) => Ok(counter),
            Challenge::Mismatch(_) => Err(RpmcError::SignatureMismatch),
            Challenge::Rejected(status) => {
                Err(RpmcError::RequestRejected(status))
            }
        }
    }

    fn request_checkout(
        &mut self,
        addr: CounterAddress,
        key: &HmacKey,
        tag: &Tag,
    ) -> Result<Challenge, RpmcError<B::Error>> {
        self.request_counter(addr, key, tag)?;
        let status = self.wait_ready()?;
        if !status.is_success() {
            // The checkout still holds whatever the last good request left.
            ringbuf_entry!(Trace::RequestRejected(status.bits()));
            return Ok(Challenge::Rejected(status));
        }

        let (_, checkout) = self.read_status_checkout()?;
        let expected = message::sign(
            &mut self.hmac,
            key.as_bytes(),
            &CounterResponse::new(&checkout.tag, &checkout.counter),
        );
        let fresh = checkout.tag == *tag;
        let signed = message::signatures_match(&expected, &checkout.signature);

        if fresh && signed {
            ringbuf_entry!(Trace::ChallengeMatch(checkout.counter.value()));
            Ok(Challenge::Match(checkout.counter))
        } else {
            ringbuf_entry!(Trace::ChallengeMismatch { stale_tag: !fresh });
            Ok(Challenge::Mismatch(checkout))
        }
    }

    fn exchange<T>(
        &mut self,
        body: impl FnOnce(&mut B) -> Result<T, B::Error>,
    ) -> Result<T, RpmcError<B::Error>> {
        exchange(&mut self.bus, body).map_err(|e| {
            ringbuf_entry!(Trace::BusError);
            RpmcError::Bus(e)
        })
    }
}

/// Runs `body` inside one chip-select window. Chip select is deasserted
/// whether or not `body` succeeds; the first error wins.
fn exchange<B: RpmcBus, T>(
    bus: &mut B,
    body: impl FnOnce(&mut B) -> Result<T, B::Error>,
) -> Result<T, B::Error> {
    bus.select()?;
    let result = body(bus);
    let deselected = bus.deselect();
    let value = result?;
    deselected?;
    Ok(value)
}

fn send<B: RpmcBus>(bus: &mut B, bytes: &[u8]) -> Result<(), B::Error> {
    for &b in bytes {
        bus.transfer(b)?;
    }
    Ok(())
}

fn recv<B: RpmcBus>(bus: &mut B, buf: &mut [u8]) -> Result<(), B::Error> {
    for b in buf {
        *b = bus.transfer(0)?;
    }
    Ok(())
}

fn recv_byte<B: RpmcBus>(bus: &mut B) -> Result<u8, B::Error> {
    bus.transfer(0)
}
