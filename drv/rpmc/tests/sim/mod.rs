// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A simulated RPMC flash part, good enough to drive the engine end to end.
//!
//! Instructions are decoded when chip select is released, the way a real
//! part latches them. Status and checkout bytes are served from whatever
//! the last completed instruction left behind.

#![allow(dead_code)]

use drv_rpmc::{
    CommandType, CounterAddress, Hmac256, Opcode, RpmcBus, SoftHmac, Status,
    COUNTER_SLOTS, JEDEC_ID_LEN, KEY_LEN, UNIQUE_ID_LEN,
};

/// Offset of the first checkout byte in a Read Status window: opcode,
/// dummy, status.
const CHECKOUT_OFFSET: usize = 3;
const CHECKOUT_LEN: usize = 48;
const UNIQUE_ID_OFFSET: usize = 5;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SimError {
    /// Injected transfer failure.
    Fault,
    /// Transfer with chip select deasserted.
    NotSelected,
}

#[derive(Clone, Default)]
struct Slot {
    root_key: Option<[u8; KEY_LEN]>,
    hmac_key: Option<[u8; KEY_LEN]>,
    counter: u32,
}

pub struct SimFlash {
    jedec_id: [u8; JEDEC_ID_LEN],
    unique_id: [u8; UNIQUE_ID_LEN],
    slots: [Slot; COUNTER_SLOTS as usize],
    hmac: SoftHmac,

    selected: bool,
    window: Vec<u8>,

    status: u8,
    checkout: [u8; CHECKOUT_LEN],
    busy_remaining: u32,

    /// Status reads that report busy after every instruction.
    pub busy_reads: u32,
    /// Never leave busy.
    pub stuck_busy: bool,
    /// Flip a bit of every signature produced by Request Counter.
    pub tamper: bool,
    /// Ignore Request Counter and keep serving the previous checkout.
    pub replay: bool,
    /// Fail every transfer after this many have succeeded.
    pub fail_after: Option<usize>,

    transfers: usize,
    /// Counter payloads of every Increase Counter received, by slot index.
    pub increases: Vec<(u8, [u8; 4])>,
    /// Number of chip-select windows seen.
    pub windows: usize,
}

impl SimFlash {
    pub fn new(
        jedec_id: [u8; JEDEC_ID_LEN],
        unique_id: [u8; UNIQUE_ID_LEN],
    ) -> Self {
        Self {
            jedec_id,
            unique_id,
            slots: Default::default(),
            hmac: SoftHmac,
            selected: false,
            window: Vec::new(),
            status: 0,
            checkout: [0; CHECKOUT_LEN],
            busy_remaining: 0,
            busy_reads: 0,
            stuck_busy: false,
            tamper: false,
            replay: false,
            fail_after: None,
            transfers: 0,
            increases: Vec::new(),
            windows: 0,
        }
    }

    pub fn is_selected(&self) -> bool {
        self.selected
    }

    pub fn counter(&self, addr: CounterAddress) -> u32 {
        self.slot(addr).counter
    }

    /// Pretends the counter at `addr` was bumped by someone else.
    pub fn set_counter(&mut self, addr: CounterAddress, value: u32) {
        self.slots[usize::from(addr.index())].counter = value;
    }

    pub fn has_root_key(&self, addr: CounterAddress) -> bool {
        self.slot(addr).root_key.is_some()
    }

    pub fn root_key(&self, addr: CounterAddress) -> Option<[u8; KEY_LEN]> {
        self.slot(addr).root_key
    }

    /// Drops every HMAC key, as a power cycle would.
    pub fn power_cycle(&mut self) {
        for slot in &mut self.slots {
            slot.hmac_key = None;
        }
        self.status = 0;
        self.busy_remaining = 0;
    }

    fn slot(&self, addr: CounterAddress) -> &Slot {
        &self.slots[usize::from(addr.index())]
    }

    fn mac(&mut self, key: &[u8], message: &[u8]) -> [u8; 32] {
        self.hmac.hmac_sha256(key, message)
    }

    fn respond(&self, index: usize) -> u8 {
        let Some(&opcode) = self.window.first() else {
            return 0;
        };
        match opcode {
            op if op == u8::from(Opcode::ReadStatus) => match index {
                2 => {
                    if self.stuck_busy || self.busy_remaining > 0 {
                        Status::BUSY.bits()
                    } else {
                        self.status
                    }
                }
                i if (CHECKOUT_OFFSET..CHECKOUT_OFFSET + CHECKOUT_LEN)
                    .contains(&i) =>
                {
                    self.checkout[i - CHECKOUT_OFFSET]
                }
                _ => 0,
            },
            op if op == u8::from(Opcode::ReadJedecId) => match index {
                1..=3 => self.jedec_id[index - 1],
                _ => 0,
            },
            op if op == u8::from(Opcode::ReadUniqueId) => {
                match index.checked_sub(UNIQUE_ID_OFFSET) {
                    Some(i) if i < UNIQUE_ID_LEN => self.unique_id[i],
                    _ => 0,
                }
            }
            _ => 0,
        }
    }

    fn latch(&mut self) {
        let window = std::mem::take(&mut self.window);
        match window.first() {
            Some(&op) if op == u8::from(Opcode::Instruction) => {
                self.status = self.execute(&window).bits();
                self.busy_remaining = self.busy_reads;
            }
            Some(&op) if op == u8::from(Opcode::ReadStatus) => {
                if window.len() > 2 && self.busy_remaining > 0 {
                    self.busy_remaining -= 1;
                }
            }
            _ => (),
        }
    }

    fn execute(&mut self, frame: &[u8]) -> Status {
        let Some(&cmd) = frame.get(1) else {
            return Status::SIGNATURE_MISMATCH;
        };
        let cmd = match CommandType::try_from(cmd) {
            Ok(cmd) => cmd,
            Err(_) => return Status::SIGNATURE_MISMATCH,
        };
        let addr = frame.get(2).copied().and_then(CounterAddress::from_index);
        let Some(addr) = addr else {
            return match cmd {
                CommandType::WriteRootKey => Status::ROOT_KEY_OVERWRITE,
                _ => Status::SIGNATURE_MISMATCH,
            };
        };
        let i = usize::from(addr.index());

        match cmd {
            CommandType::WriteRootKey => {
                if frame.len() != 64 || self.slots[i].root_key.is_some() {
                    return Status::ROOT_KEY_OVERWRITE;
                }
                let mut key = [0; KEY_LEN];
                key.copy_from_slice(&frame[4..36]);
                let sig = self.mac(&key, &frame[..4]);
                if sig[4..] != frame[36..64] {
                    return Status::ROOT_KEY_OVERWRITE;
                }
                self.slots[i] = Slot {
                    root_key: Some(key),
                    hmac_key: None,
                    counter: 0,
                };
                Status::SUCCESS
            }
            CommandType::UpdateHmacKey => {
                if frame.len() != 40 {
                    return Status::SIGNATURE_MISMATCH;
                }
                let Some(root) = self.slots[i].root_key else {
                    return Status::HMAC_KEY_UNINITIALIZED;
                };
                let key = self.mac(&root, &frame[4..8]);
                if self.mac(&key, &frame[..8]) != frame[8..40] {
                    return Status::SIGNATURE_MISMATCH;
                }
                self.slots[i].hmac_key = Some(key);
                Status::SUCCESS
            }
            CommandType::IncreaseCounter => {
                if frame.len() != 40 {
                    return Status::SIGNATURE_MISMATCH;
                }
                let mut payload = [0; 4];
                payload.copy_from_slice(&frame[4..8]);
                self.increases.push((addr.index(), payload));

                let Some(key) = self.slots[i].hmac_key else {
                    return Status::HMAC_KEY_UNINITIALIZED;
                };
                if self.mac(&key, &frame[..8]) != frame[8..40] {
                    return Status::SIGNATURE_MISMATCH;
                }
                let current = self.slots[i].counter;
                if u32::from_be_bytes(payload) != current {
                    return Status::COUNTER_MISMATCH;
                }
                match current.checked_add(1) {
                    Some(next) => {
                        self.slots[i].counter = next;
                        Status::SUCCESS
                    }
                    None => Status::COUNTER_MISMATCH,
                }
            }
            CommandType::RequestCounter => {
                if frame.len() != 48 {
                    return Status::SIGNATURE_MISMATCH;
                }
                let Some(key) = self.slots[i].hmac_key else {
                    return Status::HMAC_KEY_UNINITIALIZED;
                };
                if self.mac(&key, &frame[..16]) != frame[16..48] {
                    return Status::SIGNATURE_MISMATCH;
                }
                if self.replay {
                    return Status::SUCCESS;
                }

                let mut response = [0; 16];
                response[..12].copy_from_slice(&frame[4..16]);
                response[12..]
                    .copy_from_slice(&self.slots[i].counter.to_be_bytes());
                let mut sig = self.mac(&key, &response);
                if self.tamper {
                    sig[0] ^= 1;
                }
                self.checkout[..16].copy_from_slice(&response);
                self.checkout[16..].copy_from_slice(&sig);
                Status::SUCCESS
            }
        }
    }
}

impl RpmcBus for SimFlash {
    type Error = SimError;

    fn select(&mut self) -> Result<(), SimError> {
        assert!(!self.selected, "chip select asserted twice");
        self.selected = true;
        self.window.clear();
        Ok(())
    }

    fn deselect(&mut self) -> Result<(), SimError> {
        if self.selected {
            self.selected = false;
            self.windows += 1;
            self.latch();
        }
        Ok(())
    }

    fn transfer(&mut self, out: u8) -> Result<u8, SimError> {
        if !self.selected {
            return Err(SimError::NotSelected);
        }
        if self.fail_after.is_some_and(|n| self.transfers >= n) {
            return Err(SimError::Fault);
        }
        self.transfers += 1;

        let index = self.window.len();
        self.window.push(out);
        Ok(self.respond(index))
    }
}
