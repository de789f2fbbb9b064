// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Fixed-capacity arenas backing VM and vcpu lifetimes.
//!
//! Handles are 64-bit ids: the low [`INDEX_BITS`] bits are the slot index, the
//! rest is a generation taken from a per-pool counter, so an id is never handed
//! out twice and a handle to a released slot is detected as stale.

use alloc::boxed::Box;
use core::fmt;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Number of id bits holding the slot index.
pub const INDEX_BITS: u32 = 16;

/// Largest capacity a pool can have.
pub const MAX_POOL_CAPACITY: usize = 1 << INDEX_BITS;

const INDEX_MASK: u64 = (1 << INDEX_BITS) - 1;

macro_rules! def_handle {
    ($(#[$attr:meta])* $name:ident, $prefix:literal) => {
        $(#[$attr])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            pub(crate) const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            /// The raw id.
            pub const fn as_u64(self) -> u64 {
                self.0
            }

            /// Index of the pool slot the object lives in.
            pub const fn index(self) -> usize {
                (self.0 & INDEX_MASK) as usize
            }

            /// Generation of the slot when the object was created.
            pub const fn generation(self) -> u64 {
                self.0 >> INDEX_BITS
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}.{}"), self.index(), self.generation())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(self, f)
            }
        }
    };
}

def_handle!(
    /// Identity of a VM, unique within the lifetime of a monitor.
    VmId,
    "vm"
);

def_handle!(
    /// Identity of a vcpu, unique within the lifetime of a monitor.
    VcpuId,
    "vcpu"
);

/// A claimed but not yet published slot.
#[derive(Debug)]
pub(crate) struct Claim {
    pub index: usize,
    pub id: u64,
}

/// An arena of pre-constructed objects with lock-free slot claiming.
pub(crate) struct Pool<T> {
    slots: Box<[T]>,
    /// Published id of every slot, 0 if the slot is not live.
    ids: Box<[AtomicU64]>,
    /// One bit per slot, set while the slot is claimed.
    occupancy: Box<[AtomicU64]>,
    next_generation: AtomicU64,
    live: AtomicUsize,
}

impl<T> Pool<T> {
    /// Pre-constructs `capacity` slots. This is the only allocation a pool does.
    pub fn new(capacity: usize, make: impl FnMut(usize) -> T) -> Self {
        debug_assert!(capacity <= MAX_POOL_CAPACITY);
        Self {
            slots: (0..capacity).map(make).collect(),
            ids: (0..capacity).map(|_| AtomicU64::new(0)).collect(),
            occupancy: (0..capacity.div_ceil(64)).map(|_| AtomicU64::new(0)).collect(),
            next_generation: AtomicU64::new(1),
            live: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of published slots.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    fn word_mask(&self, word: usize) -> u64 {
        let bits = (self.capacity() - word * 64).min(64);
        if bits == 64 {
            u64::MAX
        } else {
            (1 << bits) - 1
        }
    }

    /// Claims a free slot. The slot is not visible to lookups until [`Pool::commit`].
    pub fn claim(&self) -> Option<Claim> {
        for (word_index, word) in self.occupancy.iter().enumerate() {
            let mask = self.word_mask(word_index);
            let mut bits = word.load(Ordering::Acquire);
            loop {
                let free = !bits & mask;
                if free == 0 {
                    break;
                }
                let bit = free.trailing_zeros() as usize;
                match word.compare_exchange_weak(
                    bits,
                    bits | (1 << bit),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        let index = word_index * 64 + bit;
                        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                        let id = (generation << INDEX_BITS) | index as u64;
                        return Some(Claim { index, id });
                    }
                    Err(current) => bits = current,
                }
            }
        }
        None
    }

    /// The slot of a claim, for initialization before publishing.
    pub fn claimed(&self, claim: &Claim) -> &T {
        &self.slots[claim.index]
    }

    /// Publishes a claimed slot under its id.
    pub fn commit(&self, claim: Claim) {
        self.ids[claim.index].store(claim.id, Ordering::Release);
        self.live.fetch_add(1, Ordering::AcqRel);
    }

    /// Gives back a claimed slot that was never published.
    pub fn abort(&self, claim: Claim) {
        self.clear_bit(claim.index);
    }

    /// Looks up the live slot with the given id.
    pub fn get(&self, id: u64) -> Option<&T> {
        let index = (id & INDEX_MASK) as usize;
        let published = self.ids.get(index)?.load(Ordering::Acquire);
        (published != 0 && published == id).then(|| &self.slots[index])
    }

    /// Looks up the live slot at `index`, with its id.
    pub fn get_index(&self, index: usize) -> Option<(u64, &T)> {
        let id = self.ids.get(index)?.load(Ordering::Acquire);
        (id != 0).then(|| (id, &self.slots[index]))
    }

    /// Unpublishes the slot with the given id, runs `cleanup` on it and frees it.
    ///
    /// Returns `false` if no live slot has this id. Concurrent releases of the
    /// same id are resolved in favor of exactly one caller.
    pub fn release(&self, id: u64, cleanup: impl FnOnce(&T)) -> bool {
        let index = (id & INDEX_MASK) as usize;
        let Some(slot_id) = self.ids.get(index) else {
            return false;
        };
        if slot_id
            .compare_exchange(id, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        cleanup(&self.slots[index]);
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.clear_bit(index);
        true
    }

    fn clear_bit(&self, index: usize) {
        self.occupancy[index / 64].fetch_and(!(1 << (index % 64)), Ordering::AcqRel);
    }
}
