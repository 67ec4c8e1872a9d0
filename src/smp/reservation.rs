// Copyright (c) 2023 Beihang University, Huawei Technologies Co.,Ltd. All rights reserved.
// Rust-AxpMem is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//          http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND,
// EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT,
// MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

use alloc::vec::Vec;

use spin::Mutex;
use static_assertions::const_assert;

use crate::utils::{range_overlap, round_down, round_up};

/// LDx_L/STx_C lock granule.
pub const RESERVATION_GRANULE: u64 = 8;
const_assert!(RESERVATION_GRANULE.is_power_of_two());

/// One CPU's LL reservation, granule-aligned. At most one is live per CPU;
/// `generation` counts how often the slot was re-armed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Reservation {
    pub pa: u64,
    pub size: u64,
    pub valid: bool,
    pub generation: u64,
}

/// Per-CPU reservation slots with overlap clearing.
pub struct ReservationTable {
    slots: Vec<Mutex<Reservation>>,
}

fn granule_range(pa: u64, size: usize) -> (u64, u64) {
    let base = round_down(pa, RESERVATION_GRANULE);
    let len = round_up(pa + size as u64, RESERVATION_GRANULE) - base;
    (base, len)
}

impl ReservationTable {
    pub fn new(max_cpus: usize) -> ReservationTable {
        let mut slots = Vec::with_capacity(max_cpus);
        for _ in 0..max_cpus {
            slots.push(Mutex::new(Reservation::default()));
        }
        ReservationTable { slots }
    }

    /// Arm a reservation over the granules covering `[pa, pa+size)`,
    /// replacing whatever the CPU held before. Returns the new generation.
    pub fn arm(&self, cpu: usize, pa: u64, size: usize) -> u64 {
        let (base, len) = granule_range(pa, size);
        let mut slot = self.slots[cpu].lock();
        let generation = slot.generation + 1;
        *slot = Reservation {
            pa: base,
            size: len,
            valid: true,
            generation,
        };
        generation
    }

    /// Whether the CPU still owns a reservation covering this access.
    pub fn matches(&self, cpu: usize, pa: u64, size: usize) -> bool {
        let (base, len) = granule_range(pa, size);
        let r = self.slots[cpu].lock();
        r.valid && r.pa == base && len <= r.size
    }

    pub fn clear(&self, cpu: usize) {
        self.slots[cpu].lock().valid = false;
    }

    /// Clear every reservation intersecting the written granules, except
    /// the storing CPU's own. Returns how many were broken.
    pub fn clear_overlapping(&self, pa: u64, size: usize, exclude_cpu: Option<usize>) -> u64 {
        let (base, len) = granule_range(pa, size);
        let mut cleared = 0;
        for (id, slot) in self.slots.iter().enumerate() {
            if Some(id) == exclude_cpu {
                continue;
            }
            let mut r = slot.lock();
            if r.valid && range_overlap(base, len, r.pa, r.size) {
                r.valid = false;
                cleared += 1;
            }
        }
        cleared
    }

    /// Snapshot, for diagnostics and tests.
    pub fn get(&self, cpu: usize) -> Reservation {
        *self.slots[cpu].lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arm_aligns_to_granule() {
        let table = ReservationTable::new(2);
        table.arm(0, 0x1004, 4);
        let r = table.get(0);
        assert_eq!(r.pa, 0x1000);
        assert_eq!(r.size, 8);
        assert!(r.valid);
    }

    #[test]
    fn generation_counts_rearms() {
        let table = ReservationTable::new(1);
        assert_eq!(table.arm(0, 0x1000, 8), 1);
        table.clear(0);
        // clearing does not consume a generation, re-arming does
        assert_eq!(table.arm(0, 0x1000, 8), 2);
        assert_eq!(table.get(0).generation, 2);
    }

    #[test]
    fn rearm_replaces() {
        let table = ReservationTable::new(2);
        table.arm(0, 0x1000, 8);
        table.arm(0, 0x2000, 8);
        assert!(!table.matches(0, 0x1000, 8));
        assert!(table.matches(0, 0x2000, 8));
    }

    #[test]
    fn matches_requires_fit() {
        let table = ReservationTable::new(2);
        table.arm(0, 0x1000, 4);
        assert!(table.matches(0, 0x1000, 4));
        assert!(table.matches(0, 0x1004, 4)); // same granule
        assert!(!table.matches(0, 0x1008, 4));
        assert!(!table.matches(1, 0x1000, 4));
    }

    #[test]
    fn overlap_clears_peers_only() {
        let table = ReservationTable::new(3);
        table.arm(0, 0x1000, 8);
        table.arm(1, 0x1000, 8);
        table.arm(2, 0x2000, 8);
        let cleared = table.clear_overlapping(0x1004, 1, Some(0));
        assert_eq!(cleared, 1);
        assert!(table.matches(0, 0x1000, 8));
        assert!(!table.matches(1, 0x1000, 8));
        assert!(table.matches(2, 0x2000, 8));
    }

    #[test]
    fn adjacent_granule_does_not_clear() {
        let table = ReservationTable::new(2);
        table.arm(0, 0x1000, 8);
        assert_eq!(table.clear_overlapping(0x1008, 8, None), 0);
        assert!(table.matches(0, 0x1000, 8));
    }
}
