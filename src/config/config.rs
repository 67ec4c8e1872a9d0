// Copyright (c) 2023 Beihang University, Huawei Technologies Co.,Ltd. All rights reserved.
// Rust-AxpMem is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//          http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND,
// EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT,
// MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

/// This module contains the construction-time configuration of the memory
/// core. Geometry and policy (cache shapes, TLB sets/ways, page size,
/// enforcement switches) are fixed when the coordinator is built; nothing is
/// re-read afterwards.
use crate::error::GeometryError;
use crate::utils::is_pow2;

/// When a store reaches the next cache level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WritePolicy {
    /// Mark the line dirty, write back on eviction or flush.
    WriteBack,
    /// Additionally push the word to the next level immediately.
    WriteThrough,
}

/// Victim selection among valid lines of a full set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplacementPolicy {
    Lru,
    Random,
    Fifo,
}

/// Per-CPU TLB geometry bounds.
#[derive(Clone, Copy, Debug)]
pub struct TlbConfig {
    /// Upper bound for `expand_sets`. Power of two.
    pub max_sets: usize,
    /// Upper bound for `expand_ways`. Power of two.
    pub max_ways: usize,
    /// Sets a freshly registered CPU starts with. Power of two.
    pub initial_sets: usize,
    /// Ways a freshly registered CPU starts with. Power of two.
    pub initial_ways: usize,
    /// Allow `auto_tune` to change the live geometry.
    pub auto_tune: bool,
}

impl TlbConfig {
    pub const fn default() -> TlbConfig {
        TlbConfig {
            max_sets: 256,
            max_ways: 8,
            initial_sets: 64,
            initial_ways: 2,
            auto_tune: true,
        }
    }
}

/// Shapes and policies for the four-level hierarchy.
#[derive(Clone, Copy, Debug)]
pub struct CacheConfig {
    /// Line size in bytes, shared by every level. Power of two.
    pub line_size: u64,
    pub l1i_bytes: u64,
    pub l1d_bytes: u64,
    pub l2_bytes: u64,
    pub l3_bytes: u64,
    pub l1_assoc: usize,
    pub l2_assoc: usize,
    pub l3_assoc: usize,
    pub l1_write_policy: WritePolicy,
    pub l2_write_policy: WritePolicy,
    pub l3_write_policy: WritePolicy,
    pub replacement: ReplacementPolicy,
}

impl CacheConfig {
    pub const fn default() -> CacheConfig {
        CacheConfig {
            line_size: 64,
            l1i_bytes: 64 * 1024,
            l1d_bytes: 64 * 1024,
            l2_bytes: 2 * 1024 * 1024,
            l3_bytes: 8 * 1024 * 1024,
            l1_assoc: 2,
            l2_assoc: 8,
            l3_assoc: 16,
            l1_write_policy: WritePolicy::WriteBack,
            l2_write_policy: WritePolicy::WriteBack,
            l3_write_policy: WritePolicy::WriteBack,
            replacement: ReplacementPolicy::Lru,
        }
    }
}

/// Top-level construction-time configuration.
#[derive(Clone, Copy, Debug)]
pub struct CoreConfig {
    /// Bytes of emulated RAM backing the physical address space.
    pub ram_size: u64,
    /// Guest page size. Power of two, typically 8192 on Alpha.
    pub page_size: u64,
    /// Raise alignment faults on misaligned typed accesses.
    pub enforce_alignment: bool,
    /// Hard cap on `register_cpu`.
    pub max_cpus: usize,
    pub tlb: TlbConfig,
    pub cache: CacheConfig,
}

impl CoreConfig {
    pub const fn default() -> CoreConfig {
        CoreConfig {
            ram_size: 256 * 1024 * 1024,
            page_size: 8192,
            enforce_alignment: true,
            max_cpus: 8,
            tlb: TlbConfig::default(),
            cache: CacheConfig::default(),
        }
    }

    /// Reject geometry the derived index/tag split cannot express.
    pub fn validate(&self) -> Result<(), GeometryError> {
        if !is_pow2(self.page_size) {
            return Err(GeometryError::NotPowerOfTwo("page_size", self.page_size));
        }
        for (name, val) in [
            ("tlb.max_sets", self.tlb.max_sets),
            ("tlb.max_ways", self.tlb.max_ways),
            ("tlb.initial_sets", self.tlb.initial_sets),
            ("tlb.initial_ways", self.tlb.initial_ways),
        ] {
            if !is_pow2(val as u64) {
                return Err(GeometryError::NotPowerOfTwo(name, val as u64));
            }
        }
        if self.tlb.initial_sets > self.tlb.max_sets {
            return Err(GeometryError::TlbLimit(
                "initial_sets",
                self.tlb.initial_sets,
                self.tlb.max_sets,
            ));
        }
        if self.tlb.initial_ways > self.tlb.max_ways {
            return Err(GeometryError::TlbLimit(
                "initial_ways",
                self.tlb.initial_ways,
                self.tlb.max_ways,
            ));
        }
        if !is_pow2(self.cache.line_size) {
            return Err(GeometryError::NotPowerOfTwo("cache.line_size", self.cache.line_size));
        }
        for (name, bytes, assoc) in [
            ("cache.l1i_bytes", self.cache.l1i_bytes, self.cache.l1_assoc),
            ("cache.l1d_bytes", self.cache.l1d_bytes, self.cache.l1_assoc),
            ("cache.l2_bytes", self.cache.l2_bytes, self.cache.l2_assoc),
            ("cache.l3_bytes", self.cache.l3_bytes, self.cache.l3_assoc),
        ] {
            let way_bytes = self.cache.line_size * assoc as u64;
            if way_bytes == 0 || bytes % way_bytes != 0 {
                return Err(GeometryError::CacheShape(name, bytes));
            }
            let num_sets = bytes / way_bytes;
            if !is_pow2(num_sets) {
                return Err(GeometryError::CacheShape(name, bytes));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(CoreConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_odd_geometry() {
        let mut cfg = CoreConfig::default();
        cfg.page_size = 5000;
        assert_eq!(
            cfg.validate(),
            Err(GeometryError::NotPowerOfTwo("page_size", 5000))
        );

        let mut cfg = CoreConfig::default();
        cfg.cache.l2_bytes = 3 * 1000 * 1000;
        assert!(matches!(cfg.validate(), Err(GeometryError::CacheShape(_, _))));

        let mut cfg = CoreConfig::default();
        cfg.tlb.initial_sets = 512;
        assert!(matches!(cfg.validate(), Err(GeometryError::TlbLimit(_, 512, 256))));
    }
}
