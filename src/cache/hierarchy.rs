// Copyright (c) 2023 Beihang University, Huawei Technologies Co.,Ltd. All rights reserved.
// Rust-AxpMem is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//          http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND,
// EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT,
// MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp::min;
use core::result::Result;

use crate::config::{CacheConfig, WritePolicy};
use crate::error::{AccessKind, MemFault};
use crate::mem::PhysMem;

use super::level::{CacheLevel, CacheStats, Writeback};
use super::line::{LineState, SnoopKind};

/// Counter snapshots for one CPU's view of the chain.
#[derive(Clone, Copy, Debug, Default)]
pub struct HierarchyStats {
    pub l1i: CacheStats,
    pub l1d: CacheStats,
    pub l2: CacheStats,
    pub l3: CacheStats,
}

/// The per-CPU cache chain: private L1I/L1D/L2 over the shared L3 and the
/// physical store.
///
/// Lines carry MESI state and payload mirrors; the bytes a guest observes
/// always come from [`PhysMem`], which every store updates under the
/// coordinator's store-order lock. Write policies govern when writeback
/// events fire, not when data becomes visible.
pub struct CacheHierarchy {
    l1i: CacheLevel,
    l1d: CacheLevel,
    l2: CacheLevel,
    l3: Arc<CacheLevel>,
    phys: Arc<PhysMem>,
    line_size: u64,
}

impl CacheHierarchy {
    pub fn new(cfg: &CacheConfig, l3: Arc<CacheLevel>, phys: Arc<PhysMem>) -> CacheHierarchy {
        CacheHierarchy {
            l1i: CacheLevel::new(
                "L1I",
                cfg.l1i_bytes,
                cfg.line_size,
                cfg.l1_assoc,
                cfg.l1_write_policy,
                cfg.replacement,
            ),
            l1d: CacheLevel::new(
                "L1D",
                cfg.l1d_bytes,
                cfg.line_size,
                cfg.l1_assoc,
                cfg.l1_write_policy,
                cfg.replacement,
            ),
            l2: CacheLevel::new(
                "L2",
                cfg.l2_bytes,
                cfg.line_size,
                cfg.l2_assoc,
                cfg.l2_write_policy,
                cfg.replacement,
            ),
            l3,
            phys,
            line_size: cfg.line_size,
        }
    }

    /// Build the L3 level all hierarchies share.
    pub fn shared_l3(cfg: &CacheConfig) -> CacheLevel {
        CacheLevel::new(
            "L3",
            cfg.l3_bytes,
            cfg.line_size,
            cfg.l3_assoc,
            cfg.l3_write_policy,
            cfg.replacement,
        )
    }

    fn line_base(&self, pa: u64) -> u64 {
        pa & !(self.line_size - 1)
    }

    /// Route a dirty victim toward memory, stopping at the first level that
    /// takes ownership of it.
    fn emit_writeback(&self, from_l1: bool, wb: Writeback) -> Result<(), MemFault> {
        if from_l1 && self.l2.absorb_writeback(wb.pa, &wb.data) {
            return Ok(());
        }
        if self.l3.absorb_writeback(wb.pa, &wb.data) {
            return Ok(());
        }
        self.phys.write_bytes(wb.pa, &wb.data)
    }

    /// Pull one line into the chain, filling downward-missed levels on the
    /// return path. `state` is the MESI state the private copies take.
    fn fill_chain(&self, l1: &CacheLevel, base: u64, state: LineState) -> Result<(), MemFault> {
        let mut line_buf = vec![0u8; self.line_size as usize];
        if !self.l2.probe(base) {
            if !self.l3.probe(base) {
                self.phys.read_bytes(base, &mut line_buf)?;
                if let Some(wb) = self.l3.fill(base, &line_buf, LineState::Exclusive) {
                    self.phys.write_bytes(wb.pa, &wb.data)?;
                }
            } else {
                self.phys.read_bytes(base, &mut line_buf)?;
            }
            if let Some(wb) = self.l2.fill(base, &line_buf, state) {
                self.emit_writeback(false, wb)?;
            }
        } else {
            self.phys.read_bytes(base, &mut line_buf)?;
        }
        if let Some(wb) = l1.fill(base, &line_buf, state) {
            self.emit_writeback(true, wb)?;
        }
        Ok(())
    }

    /// Read `buf.len()` bytes at `pa`. `sharers` answers whether a peer's
    /// private levels hold a line; every line that was filled Shared is
    /// appended to `filled` so the coordinator can downgrade those peers.
    pub fn read(
        &self,
        pa: u64,
        buf: &mut [u8],
        kind: AccessKind,
        sharers: &dyn Fn(u64) -> bool,
        filled: &mut Vec<u64>,
    ) -> Result<(), MemFault> {
        let l1 = match kind {
            AccessKind::Execute => &self.l1i,
            _ => &self.l1d,
        };
        let mut done = 0;
        while done < buf.len() {
            let cur = pa + done as u64;
            let base = self.line_base(cur);
            let chunk = min((base + self.line_size - cur) as usize, buf.len() - done);
            if !l1.probe(cur) {
                let state = if sharers(base) {
                    LineState::Shared
                } else {
                    LineState::Exclusive
                };
                self.fill_chain(l1, base, state)?;
                if state == LineState::Shared {
                    filled.push(base);
                }
            }
            self.phys.read_bytes(cur, &mut buf[done..done + chunk])?;
            done += chunk;
        }
        Ok(())
    }

    /// Store `data` at `pa` through the D-side. The physical store is
    /// updated first; peer invalidation is the coordinator's broadcast.
    pub fn write(&self, pa: u64, data: &[u8]) -> Result<(), MemFault> {
        let mut done = 0;
        while done < data.len() {
            let cur = pa + done as u64;
            let base = self.line_base(cur);
            let chunk = min((base + self.line_size - cur) as usize, data.len() - done);
            let piece = &data[done..done + chunk];
            self.phys.write_bytes(cur, piece)?;
            if !self.l1d.probe_write(cur, piece) {
                // write-allocate: the fetched line already holds the store
                self.fill_chain(&self.l1d, base, LineState::Exclusive)?;
                self.l1d.write_resident(cur, piece);
            }
            if self.l1d.write_policy() == WritePolicy::WriteThrough {
                self.l1d.note_writethrough();
                self.l2.write_resident(cur, piece);
                if self.l2.write_policy() == WritePolicy::WriteThrough {
                    self.l2.note_writethrough();
                    self.l3.write_resident(cur, piece);
                    if self.l3.write_policy() == WritePolicy::WriteThrough {
                        self.l3.note_writethrough();
                    }
                }
            }
            done += chunk;
        }
        Ok(())
    }

    /// Whether any private level holds the line at `pa`.
    pub fn holds(&self, pa: u64) -> bool {
        self.l1i.holds(pa) || self.l1d.holds(pa) || self.l2.holds(pa)
    }

    /// D-side L1 state of the line at `pa`, for coherency checks.
    pub fn l1d_state(&self, pa: u64) -> Option<LineState> {
        self.l1d.state_of(pa)
    }

    fn private_levels(&self) -> [&CacheLevel; 3] {
        [&self.l1i, &self.l1d, &self.l2]
    }

    /// Apply a coherency transition to every private line covering
    /// `[pa, pa+size)`, top-down. Dirty payloads drain to memory.
    pub fn snoop_range(&self, pa: u64, size: u64, kind: SnoopKind) -> Result<(), MemFault> {
        if size == 0 {
            return Ok(());
        }
        let mut base = self.line_base(pa);
        while base < pa + size {
            for level in self.private_levels() {
                if let Some(wb) = level.snoop(base, kind) {
                    self.phys.write_bytes(wb.pa, &wb.data)?;
                }
            }
            base += self.line_size;
        }
        Ok(())
    }

    /// Refresh private payload mirrors covering `[pa, pa+size)` from
    /// memory. Writeback-notice path; dirty lines are left alone.
    pub fn refresh_range(&self, pa: u64, size: u64) -> Result<(), MemFault> {
        if size == 0 {
            return Ok(());
        }
        let mut line_buf = vec![0u8; self.line_size as usize];
        let mut base = self.line_base(pa);
        while base < pa + size {
            if self.holds(base) {
                self.phys.read_bytes(base, &mut line_buf)?;
                for level in self.private_levels() {
                    level.refresh_resident(base, &line_buf);
                }
            }
            base += self.line_size;
        }
        Ok(())
    }

    /// Drain dirty private lines to memory, bottom-to-top.
    pub fn drain_writebacks(&self) -> Result<(), MemFault> {
        for level in [&self.l2, &self.l1d, &self.l1i] {
            for wb in level.drain_writebacks() {
                self.phys.write_bytes(wb.pa, &wb.data)?;
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> HierarchyStats {
        HierarchyStats {
            l1i: self.l1i.stats(),
            l1d: self.l1d.stats(),
            l2: self.l2.stats(),
            l3: self.l3.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn harness() -> (CacheHierarchy, Arc<PhysMem>) {
        let cfg = CacheConfig::default();
        let phys = Arc::new(PhysMem::new(0x100000, true));
        let l3 = Arc::new(CacheHierarchy::shared_l3(&cfg));
        (CacheHierarchy::new(&cfg, l3, phys.clone()), phys)
    }

    fn no_sharers(_: u64) -> bool {
        false
    }

    #[test]
    fn read_miss_then_hit() {
        let (hier, phys) = harness();
        phys.write_u64(0x2000, 0x1122_3344_5566_7788).unwrap();

        let mut buf = [0u8; 8];
        let mut filled = Vec::new();
        hier.read(0x2000, &mut buf, AccessKind::Read, &no_sharers, &mut filled).unwrap();
        assert_eq!(u64::from_le_bytes(buf), 0x1122_3344_5566_7788);
        assert!(filled.is_empty());
        assert_eq!(hier.stats().l1d.misses, 1);

        hier.read(0x2000, &mut buf, AccessKind::Read, &no_sharers, &mut filled).unwrap();
        assert_eq!(hier.stats().l1d.hits, 1);
    }

    #[test]
    fn write_then_read_back() {
        let (hier, phys) = harness();
        hier.write(0x3000, &0xdeadbeefu32.to_le_bytes()).unwrap();
        assert_eq!(phys.read_u32(0x3000).unwrap(), 0xdeadbeef);

        let mut buf = [0u8; 4];
        let mut filled = Vec::new();
        hier.read(0x3000, &mut buf, AccessKind::Read, &no_sharers, &mut filled).unwrap();
        assert_eq!(u32::from_le_bytes(buf), 0xdeadbeef);
    }

    #[test]
    fn execute_routes_to_l1i() {
        let (hier, _) = harness();
        let mut buf = [0u8; 4];
        let mut filled = Vec::new();
        hier.read(0x4000, &mut buf, AccessKind::Execute, &no_sharers, &mut filled).unwrap();
        let stats = hier.stats();
        assert_eq!(stats.l1i.misses, 1);
        assert_eq!(stats.l1d.misses, 0);
    }

    #[test]
    fn cross_line_access_splits() {
        let (hier, _) = harness();
        // line size 64: this write covers two lines
        hier.write(0x1038, &[0xaa; 16]).unwrap();
        let mut buf = [0u8; 16];
        let mut filled = Vec::new();
        hier.read(0x1038, &mut buf, AccessKind::Read, &no_sharers, &mut filled).unwrap();
        assert_eq!(buf, [0xaa; 16]);
    }

    #[test]
    fn shared_fill_is_reported() {
        let (hier, _) = harness();
        let mut buf = [0u8; 8];
        let mut filled = Vec::new();
        hier.read(0x5000, &mut buf, AccessKind::Read, &|_| true, &mut filled).unwrap();
        assert_eq!(filled, vec![0x5000]);
    }

    #[test]
    fn snoop_invalidate_forces_refill() {
        let (hier, _) = harness();
        let mut buf = [0u8; 8];
        let mut filled = Vec::new();
        hier.read(0x6000, &mut buf, AccessKind::Read, &no_sharers, &mut filled).unwrap();
        assert!(hier.holds(0x6000));
        hier.snoop_range(0x6000, 8, SnoopKind::Invalidate).unwrap();
        assert!(!hier.holds(0x6000));
    }

    #[test]
    fn unbacked_address_faults() {
        let (hier, _) = harness();
        let mut buf = [0u8; 8];
        let mut filled = Vec::new();
        assert!(hier
            .read(0x100000, &mut buf, AccessKind::Read, &no_sharers, &mut filled)
            .is_err());
    }

    #[test]
    fn writethrough_pushes_immediately() {
        let mut cfg = CacheConfig::default();
        cfg.l1_write_policy = WritePolicy::WriteThrough;
        let phys = Arc::new(PhysMem::new(0x100000, true));
        let l3 = Arc::new(CacheHierarchy::shared_l3(&cfg));
        let hier = CacheHierarchy::new(&cfg, l3, phys);

        hier.write(0x1000, &[1, 2, 3, 4]).unwrap();
        assert_eq!(hier.stats().l1d.writebacks, 1);
        // write-through lines never sit dirty, a drain adds nothing
        hier.drain_writebacks().unwrap();
        assert_eq!(hier.stats().l1d.writebacks, 1);
    }

    #[test]
    fn drain_clears_dirty_lines() {
        let (hier, _) = harness();
        hier.write(0x7000, &[1, 2, 3, 4]).unwrap();
        hier.drain_writebacks().unwrap();
        // a second drain emits nothing new
        let before = hier.stats().l1d.writebacks;
        hier.drain_writebacks().unwrap();
        assert_eq!(hier.stats().l1d.writebacks, before);
    }
}
