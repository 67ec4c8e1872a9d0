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

use bitflags::bitflags;

use crate::error::AccessKind;
use crate::utils::{in_range, range_overlap};

bitflags! {
    /// Protection bits carried by a mapping and by every TLB entry.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Prot: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl Prot {
    pub fn allows(self, access: AccessKind) -> bool {
        match access {
            AccessKind::Read => self.contains(Prot::READ),
            AccessKind::Write => self.contains(Prot::WRITE),
            AccessKind::Execute => self.contains(Prot::EXEC),
        }
    }
}

/// One continuous va -> pa window of the guest address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MapRegion {
    pub va: u64,
    pub pa: u64,
    pub size: u64,
    pub prot: Prot,
    /// Global mappings ignore the ASN on TLB match.
    pub global: bool,
}

impl MapRegion {
    pub fn new(va: u64, pa: u64, size: u64, prot: Prot, global: bool) -> MapRegion {
        MapRegion {
            va,
            pa,
            size,
            prot,
            global,
        }
    }

    pub fn translate(&self, va: u64) -> u64 {
        self.pa + (va - self.va)
    }
}

/// The guest memory map. Immutable for the life of a translation call; the
/// coordinator updates it under its own lock.
pub struct MemMap {
    regions: Vec<MapRegion>,
}

impl MemMap {
    pub const fn new() -> MemMap {
        MemMap { regions: Vec::new() }
    }

    /// Insert a region. Overlapping va ranges are rejected and logged, the
    /// map is left untouched.
    pub fn add(&mut self, region: MapRegion) -> bool {
        for r in &self.regions {
            if range_overlap(region.va, region.size, r.va, r.size) {
                warn!(
                    "MemMap::add: va {:#x} size {:#x} overlaps region at {:#x}",
                    region.va, region.size, r.va
                );
                return false;
            }
        }
        self.regions.push(region);
        true
    }

    /// Drop the region containing `va`.
    pub fn remove(&mut self, va: u64) -> Option<MapRegion> {
        let idx = self.regions.iter().position(|r| in_range(va, r.va, r.size))?;
        Some(self.regions.swap_remove(idx))
    }

    pub fn lookup(&self, va: u64) -> Option<&MapRegion> {
        self.regions.iter().find(|r| in_range(va, r.va, r.size))
    }

    pub fn iter(&self) -> impl Iterator<Item = &MapRegion> {
        self.regions.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_and_translate() {
        let mut map = MemMap::new();
        assert!(map.add(MapRegion::new(0x1000, 0x2000, 0x1000, Prot::READ | Prot::WRITE, false)));
        let r = map.lookup(0x1800).unwrap();
        assert_eq!(r.translate(0x1800), 0x2800);
        assert!(map.lookup(0x2000).is_none());
    }

    #[test]
    fn overlap_is_rejected() {
        let mut map = MemMap::new();
        assert!(map.add(MapRegion::new(0x1000, 0x2000, 0x2000, Prot::READ, false)));
        assert!(!map.add(MapRegion::new(0x2000, 0x8000, 0x2000, Prot::READ, false)));
        assert_eq!(map.lookup(0x2800).unwrap().va, 0x1000);
    }

    #[test]
    fn prot_gates_access() {
        let prot = Prot::READ | Prot::EXEC;
        assert!(prot.allows(AccessKind::Read));
        assert!(prot.allows(AccessKind::Execute));
        assert!(!prot.allows(AccessKind::Write));
    }

    #[test]
    fn remove_region() {
        let mut map = MemMap::new();
        map.add(MapRegion::new(0x1000, 0x2000, 0x1000, Prot::READ, false));
        assert!(map.remove(0x1fff).is_some());
        assert!(map.lookup(0x1000).is_none());
        assert!(map.remove(0x1000).is_none());
    }
}
