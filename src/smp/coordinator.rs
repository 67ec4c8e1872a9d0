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
use core::cmp::{max, min};
use core::sync::atomic::{fence, AtomicU64, Ordering};

use spin::{Mutex, RwLock};

use crate::cache::{CacheHierarchy, CacheLevel, HierarchyStats, LineState, SnoopKind};
use crate::config::CoreConfig;
use crate::error::{
    AccessKind, Fault, GeometryError, MemFault, MemFaultKind, RegistrationError, Result, TlbFault,
    TlbFaultKind,
};
use crate::mem::{MapRegion, MemMap, PhysMem, Prot};
use crate::tlb::{TlbStats, TlbSystem};
use crate::utils::{range_overlap, round_down};

use super::bus::{CoherencyBus, CoherencyEvent, CoherencyMsg};
use super::cpu::{CpuIf, CpuRegistry};
use super::reservation::{Reservation, ReservationTable};

/// Strength of `memory_barrier`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BarrierKind {
    Read,
    Write,
    Full,
}

struct CoordCounters {
    total_accesses: AtomicU64,
    coherency_events: AtomicU64,
    reservation_conflicts: AtomicU64,
    tlb_invalidations: AtomicU64,
}

impl CoordCounters {
    const fn new() -> CoordCounters {
        CoordCounters {
            total_accesses: AtomicU64::new(0),
            coherency_events: AtomicU64::new(0),
            reservation_conflicts: AtomicU64::new(0),
            tlb_invalidations: AtomicU64::new(0),
        }
    }
}

/// Coordinator-wide counter snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CoordStats {
    pub total_accesses: u64,
    pub coherency_events: u64,
    pub reservation_conflicts: u64,
    pub tlb_invalidations: u64,
}

/// The top-level memory system every emulated CPU enters through.
///
/// Owns the CPU registry, the per-CPU TLBs and cache chains, the shared L3,
/// the reservation table, the coherency bus and the physical store. The
/// store path runs under `store_order`, so the (cache write, reservation
/// clear, invalidate broadcast) triple is atomic to peers.
pub struct MemCoordinator {
    cfg: CoreConfig,
    phys: Arc<PhysMem>,
    map: RwLock<MemMap>,
    tlbs: TlbSystem,
    hierarchies: RwLock<Vec<Option<Arc<CacheHierarchy>>>>,
    l3: Arc<CacheLevel>,
    reservations: ReservationTable,
    bus: CoherencyBus,
    registry: CpuRegistry,
    store_order: Mutex<()>,
    access_tick: AtomicU64,
    counters: CoordCounters,
}

macro_rules! define_virtual_access {
    ($read:ident, $write:ident, $ty:ty) => {
        pub fn $read(&self, cpu: usize, va: u64, pc: u64) -> Result<$ty> {
            let mut buf = [0u8; core::mem::size_of::<$ty>()];
            self.read_virtual(cpu, va, &mut buf, pc)?;
            Ok(<$ty>::from_le_bytes(buf))
        }

        pub fn $write(&self, cpu: usize, va: u64, val: $ty, pc: u64) -> Result<()> {
            self.write_virtual(cpu, va, &val.to_le_bytes(), pc)
        }
    };
}

impl MemCoordinator {
    pub fn new(cfg: CoreConfig) -> core::result::Result<MemCoordinator, GeometryError> {
        cfg.validate()?;
        let phys = Arc::new(PhysMem::new(cfg.ram_size, cfg.enforce_alignment));
        let l3 = Arc::new(CacheHierarchy::shared_l3(&cfg.cache));
        info!(
            "memory core up: {} MB ram, page size {}, max {} cpus",
            cfg.ram_size / (1024 * 1024),
            cfg.page_size,
            cfg.max_cpus
        );
        Ok(MemCoordinator {
            phys,
            map: RwLock::new(MemMap::new()),
            tlbs: TlbSystem::new(cfg.tlb, cfg.page_size, cfg.max_cpus),
            hierarchies: RwLock::new(vec![None; cfg.max_cpus]),
            l3,
            reservations: ReservationTable::new(cfg.max_cpus),
            bus: CoherencyBus::new(),
            registry: CpuRegistry::new(cfg.max_cpus),
            store_order: Mutex::new(()),
            access_tick: AtomicU64::new(0),
            counters: CoordCounters::new(),
            cfg,
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.cfg
    }

    // --- CPU lifecycle -----------------------------------------------------

    /// Bring a CPU into the system: TLB, cache chain, reservation slot and
    /// an online registry entry.
    pub fn register_cpu(&self, cpu: usize) -> core::result::Result<(), RegistrationError> {
        self.registry.register(cpu)?;
        if let Err(e) = self.tlbs.register_cpu(cpu) {
            let _ = self.registry.unregister(cpu);
            return Err(e);
        }
        let hier = Arc::new(CacheHierarchy::new(&self.cfg.cache, self.l3.clone(), self.phys.clone()));
        self.hierarchies.write()[cpu] = Some(hier);
        self.reservations.clear(cpu);
        info!("register_cpu: cpu {} online", cpu);
        Ok(())
    }

    pub fn unregister_cpu(&self, cpu: usize) -> core::result::Result<(), RegistrationError> {
        self.registry.unregister(cpu)?;
        self.tlbs.unregister_cpu(cpu)?;
        self.hierarchies.write()[cpu] = None;
        self.reservations.clear(cpu);
        info!("unregister_cpu: cpu {} gone", cpu);
        Ok(())
    }

    /// Feed the MMU context the executor's ASN/PS registers hold.
    pub fn set_cpu_context(&self, cpu: usize, asn: u16, kernel: bool) {
        self.registry.set_context(cpu, asn, kernel);
    }

    pub fn set_cpu_online(&self, cpu: usize, online: bool) {
        self.registry.set_online(cpu, online);
    }

    pub fn set_cpu_vptb(&self, cpu: usize, vptb: u64) {
        self.registry.set_vptb(cpu, vptb);
    }

    pub fn set_cpu_fpen(&self, cpu: usize, fpen: bool) {
        self.registry.set_fpen(cpu, fpen);
    }

    /// Registry snapshot for `cpu`, `None` when unregistered.
    pub fn cpu_info(&self, cpu: usize) -> Option<CpuIf> {
        self.registry.get(cpu)
    }

    pub fn post_interrupt(&self, cpu: usize, irq: u32) {
        self.registry.post_interrupt(cpu, irq);
    }

    pub fn take_interrupts(&self, cpu: usize) -> u64 {
        self.registry.take_interrupts(cpu)
    }

    fn hierarchy(&self, cpu: usize) -> Option<Arc<CacheHierarchy>> {
        self.hierarchies.read().get(cpu)?.clone()
    }

    fn note_access(&self, cpu: usize) {
        let tick = self.access_tick.fetch_add(1, Ordering::Relaxed) + 1;
        self.registry.touch(cpu, tick);
        self.counters.total_accesses.fetch_add(1, Ordering::Relaxed);
    }

    // --- memory map --------------------------------------------------------

    pub fn map_region(&self, region: MapRegion) -> bool {
        self.map.write().add(region)
    }

    /// Remove the region containing `va` and shoot the covered pages out of
    /// every TLB before returning.
    pub fn unmap_region(&self, va: u64) -> Option<MapRegion> {
        let removed = self.map.write().remove(va)?;
        let mut page = round_down(removed.va, self.cfg.page_size);
        while page < removed.va + removed.size {
            self.tlbs.invalidate_entry_all_cpus(page, 0, None);
            page += self.cfg.page_size;
        }
        self.counters.tlb_invalidations.fetch_add(1, Ordering::Relaxed);
        Some(removed)
    }

    // --- translation -------------------------------------------------------

    /// Resolve `va` for `cpu`, installing a TLB entry on miss.
    pub fn translate(&self, cpu: usize, va: u64, access: AccessKind, pc: u64) -> Result<u64> {
        let cpu_if = match self.registry.get(cpu) {
            Some(cpu_if) => cpu_if,
            None => {
                error!("translate: cpu {} not registered", cpu);
                return Err(TlbFault::new(TlbFaultKind::InvalidEntry, cpu, va, 0, pc, access).into());
            }
        };
        let (asn, kernel) = (cpu_if.asn, cpu_if.kernel);
        let is_instr = access == AccessKind::Execute;

        if let Some(pa) = self.tlbs.find_entry(cpu, va, asn, kernel, is_instr, access) {
            return Ok(pa);
        }

        let map = self.map.read();
        let region = match map.lookup(va) {
            Some(region) => region,
            None => {
                return Err(TlbFault::new(TlbFaultKind::InvalidEntry, cpu, va, asn, pc, access).into())
            }
        };
        if !region.prot.allows(access) {
            return Err(TlbFault::new(TlbFaultKind::ProtectionFault, cpu, va, asn, pc, access).into());
        }
        let pa = region.translate(va);
        let (prot, global) = (region.prot, region.global);
        drop(map);

        if let Some(tlb) = self.tlbs.tlb(cpu) {
            tlb.insert(va, pa, asn, prot, kernel, is_instr, global);
            tlb.auto_tune();
        }
        Ok(pa)
    }

    /// Probe-only translation: any failure is `None`, nothing is raised.
    pub fn translate_nonfaulting(&self, cpu: usize, va: u64, access: AccessKind) -> Option<u64> {
        self.translate(cpu, va, access, 0).ok()
    }

    fn check_alignment(&self, cpu: usize, va: u64, size: usize, pc: u64, access: AccessKind) -> Result<()> {
        if self.cfg.enforce_alignment
            && matches!(size, 2 | 4 | 8)
            && va % size as u64 != 0
        {
            let asn = self.registry.get(cpu).map(|c| c.asn).unwrap_or(0);
            return Err(TlbFault::new(TlbFaultKind::AlignmentFault, cpu, va, asn, pc, access).into());
        }
        Ok(())
    }

    // --- reads -------------------------------------------------------------

    fn access_read(&self, cpu: usize, pa: u64, buf: &mut [u8], kind: AccessKind, pc: u64) -> Result<()> {
        let hier = match self.hierarchy(cpu) {
            Some(hier) => hier,
            None => {
                return Err(MemFault::new(MemFaultKind::InvalidAddress, pa, buf.len(), pc).into())
            }
        };
        let mut filled = Vec::new();
        {
            let hiers = self.hierarchies.read();
            let sharers = |line_pa: u64| {
                hiers.iter().enumerate().any(|(id, h)| {
                    id != cpu && h.as_ref().map(|h| h.holds(line_pa)).unwrap_or(false)
                })
            };
            hier.read(pa, buf, kind, &sharers, &mut filled).map_err(|mut f| {
                f.pc = pc;
                Fault::Mem(f)
            })?;
            // downgrade peers that also hold the lines we just filled Shared
            for base in filled {
                for (id, h) in hiers.iter().enumerate() {
                    if id == cpu {
                        continue;
                    }
                    if let Some(h) = h {
                        if let Err(e) = h.snoop_range(base, 1, SnoopKind::Read) {
                            error!("snoop read on cpu {} failed: {}", id, e);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Read guest memory through the D-side of `cpu`'s cache chain.
    pub fn read_virtual(&self, cpu: usize, va: u64, buf: &mut [u8], pc: u64) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        self.check_alignment(cpu, va, buf.len(), pc, AccessKind::Read)?;
        let pa = self.translate(cpu, va, AccessKind::Read, pc)?;
        self.note_access(cpu);
        self.access_read(cpu, pa, buf, AccessKind::Read, pc)
    }

    /// Fetch one instruction word through the I-side.
    pub fn fetch_instruction(&self, cpu: usize, va: u64, pc: u64) -> Result<u32> {
        self.check_alignment(cpu, va, 4, pc, AccessKind::Execute)?;
        let pa = self.translate(cpu, va, AccessKind::Execute, pc)?;
        self.note_access(cpu);
        let mut buf = [0u8; 4];
        self.access_read(cpu, pa, &mut buf, AccessKind::Execute, pc)?;
        Ok(u32::from_le_bytes(buf))
    }

    define_virtual_access!(read_virtual_u8, write_virtual_u8, u8);
    define_virtual_access!(read_virtual_u16, write_virtual_u16, u16);
    define_virtual_access!(read_virtual_u32, write_virtual_u32, u32);
    define_virtual_access!(read_virtual_u64, write_virtual_u64, u64);

    // --- writes ------------------------------------------------------------

    /// The store triple: cache write, reservation clear, invalidate
    /// broadcast. Caller holds `store_order`.
    fn do_store(&self, cpu: usize, pa: u64, data: &[u8], pc: u64) -> Result<()> {
        let hier = match self.hierarchy(cpu) {
            Some(hier) => hier,
            None => return Err(MemFault::new(MemFaultKind::InvalidAddress, pa, data.len(), pc).into()),
        };
        hier.write(pa, data).map_err(|mut f| {
            f.pc = pc;
            if f.kind == MemFaultKind::InvalidAddress {
                Fault::Mem(f)
            } else {
                f.kind = MemFaultKind::WriteError;
                Fault::Mem(f)
            }
        })?;
        let cleared = self.reservations.clear_overlapping(pa, data.len(), Some(cpu));
        self.counters.reservation_conflicts.fetch_add(cleared, Ordering::Relaxed);
        self.broadcast(CoherencyMsg::broadcast(
            CoherencyEvent::InvalidateLine,
            pa,
            data.len() as u64,
            Some(cpu),
        ));
        Ok(())
    }

    /// Store guest memory. After this returns no peer holds a reservation
    /// over the range and no peer cache serves the stale line.
    pub fn write_virtual(&self, cpu: usize, va: u64, data: &[u8], pc: u64) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.check_alignment(cpu, va, data.len(), pc, AccessKind::Write)?;
        let pa = self.translate(cpu, va, AccessKind::Write, pc)?;
        self.note_access(cpu);
        let _store = self.store_order.lock();
        self.do_store(cpu, pa, data, pc)
    }

    // --- LL/SC -------------------------------------------------------------

    /// Load and arm a granule-aligned reservation. The reservation is armed
    /// before the bytes are read: a store racing in between clears it, so a
    /// later `store_conditional` cannot succeed over a stale value.
    pub fn load_locked(&self, cpu: usize, va: u64, size: usize, pc: u64) -> Result<u64> {
        debug_assert!(size == 4 || size == 8);
        self.check_alignment(cpu, va, size, pc, AccessKind::Read)?;
        let pa = self.translate(cpu, va, AccessKind::Read, pc)?;
        self.note_access(cpu);
        self.reservations.arm(cpu, pa, size);
        let mut buf = [0u8; 8];
        self.access_read(cpu, pa, &mut buf[..size], AccessKind::Read, pc)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Store iff the CPU still owns its reservation. Either way the
    /// reservation is gone afterwards.
    pub fn store_conditional(&self, cpu: usize, va: u64, value: u64, size: usize, pc: u64) -> Result<bool> {
        debug_assert!(size == 4 || size == 8);
        self.check_alignment(cpu, va, size, pc, AccessKind::Write)?;
        let pa = self.translate(cpu, va, AccessKind::Write, pc)?;
        let _store = self.store_order.lock();
        if !self.reservations.matches(cpu, pa, size) {
            self.reservations.clear(cpu);
            return Ok(false);
        }
        self.note_access(cpu);
        self.do_store(cpu, pa, &value.to_le_bytes()[..size], pc)?;
        self.reservations.clear(cpu);
        Ok(true)
    }

    // --- physical passthrough (device DMA) ---------------------------------

    pub fn read_physical(&self, pa: u64, buf: &mut [u8]) -> Result<()> {
        self.phys.read_bytes(pa, buf).map_err(Fault::Mem)
    }

    /// Device store into physical memory: breaks every overlapping
    /// reservation and invalidates the lines on every CPU.
    pub fn write_physical(&self, pa: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let _store = self.store_order.lock();
        self.phys.write_bytes(pa, data).map_err(Fault::Mem)?;
        self.broadcast(CoherencyMsg::broadcast(
            CoherencyEvent::ReservationClear,
            pa,
            data.len() as u64,
            None,
        ));
        self.broadcast(CoherencyMsg::broadcast(
            CoherencyEvent::InvalidateLine,
            pa,
            data.len() as u64,
            None,
        ));
        Ok(())
    }

    // --- coherency bus -----------------------------------------------------

    fn broadcast(&self, msg: CoherencyMsg) {
        self.bus.post(msg);
        self.bus.drain(|m| self.deliver(m));
    }

    fn deliver(&self, msg: &CoherencyMsg) {
        self.counters.coherency_events.fetch_add(1, Ordering::Relaxed);
        match msg.event {
            CoherencyEvent::InvalidateLine => {
                self.snoop_peers(msg, SnoopKind::Invalidate);
                self.smc_itlb_shootdown(msg);
            }
            CoherencyEvent::FlushLine => self.snoop_peers(msg, SnoopKind::Flush),
            CoherencyEvent::WriteBack => {
                let hiers = self.hierarchies.read();
                for (id, h) in hiers.iter().enumerate() {
                    if !msg.targets(id) {
                        continue;
                    }
                    if let Some(h) = h {
                        if let Err(e) = h.refresh_range(msg.pa, msg.size) {
                            error!("writeback refresh on cpu {} failed: {}", id, e);
                        }
                    }
                }
            }
            CoherencyEvent::ReservationClear => {
                let cleared =
                    self.reservations.clear_overlapping(msg.pa, msg.size as usize, msg.source_cpu);
                self.counters.reservation_conflicts.fetch_add(cleared, Ordering::Relaxed);
            }
        }
    }

    fn snoop_peers(&self, msg: &CoherencyMsg, kind: SnoopKind) {
        let hiers = self.hierarchies.read();
        for (id, h) in hiers.iter().enumerate() {
            if !msg.targets(id) {
                continue;
            }
            if let Some(h) = h {
                if let Err(e) = h.snoop_range(msg.pa, msg.size, kind) {
                    error!("snoop on cpu {} failed: {}", id, e);
                }
            }
        }
    }

    /// Self-modifying code path: a store into an executable page shoots the
    /// page out of the peers' instruction translations.
    fn smc_itlb_shootdown(&self, msg: &CoherencyMsg) {
        let map = self.map.read();
        for region in map.iter() {
            if !region.prot.contains(Prot::EXEC)
                || !range_overlap(msg.pa, msg.size, region.pa, region.size)
            {
                continue;
            }
            let start = max(msg.pa, region.pa);
            let end = min(msg.pa + msg.size, region.pa + region.size);
            let mut page = round_down(region.va + (start - region.pa), self.cfg.page_size);
            while page < region.va + (end - region.pa) {
                self.tlbs.invalidate_entry_all_cpus(page, 0, msg.source_cpu);
                page += self.cfg.page_size;
            }
        }
    }

    // --- invalidation facades ----------------------------------------------

    /// Shoot one page's translation out of every peer CPU.
    pub fn invalidate_tlb_single(&self, va: u64, source_cpu: usize) {
        self.tlbs.invalidate_entry_all_cpus(va, 0, Some(source_cpu));
        self.counters.tlb_invalidations.fetch_add(1, Ordering::Relaxed);
        trace!("tlb shootdown va {:#x} from cpu {}", va, source_cpu);
    }

    pub fn invalidate_tlb_by_asn(&self, asn: u16, source_cpu: usize) {
        self.tlbs.invalidate_by_asn_all_cpus(asn, Some(source_cpu));
        self.counters.tlb_invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn invalidate_tlb_all(&self, source_cpu: usize) {
        self.tlbs.invalidate_all_cpus(Some(source_cpu));
        self.counters.tlb_invalidations.fetch_add(1, Ordering::Relaxed);
    }

    fn l3_snoop_range(&self, pa: u64, size: u64, kind: SnoopKind) {
        let line = self.cfg.cache.line_size;
        let mut base = round_down(pa, line);
        while base < pa + size {
            if let Some(wb) = self.l3.snoop(base, kind) {
                if let Err(e) = self.phys.write_bytes(wb.pa, &wb.data) {
                    error!("l3 writeback failed: {}", e);
                }
            }
            base += line;
        }
    }

    /// Drop the covered lines from every cache but the source CPU's.
    pub fn invalidate_cache_lines(&self, pa: u64, size: u64, source_cpu: usize) {
        if size == 0 {
            return;
        }
        self.broadcast(CoherencyMsg::broadcast(
            CoherencyEvent::InvalidateLine,
            pa,
            size,
            Some(source_cpu),
        ));
        self.l3_snoop_range(pa, size, SnoopKind::Invalidate);
    }

    /// Push the covered dirty lines to memory everywhere, then tell the
    /// peers the bytes landed.
    pub fn flush_cache_lines(&self, pa: u64, size: u64, source_cpu: usize) {
        if size == 0 {
            return;
        }
        self.broadcast(CoherencyMsg::broadcast(
            CoherencyEvent::FlushLine,
            pa,
            size,
            Some(source_cpu),
        ));
        self.l3_snoop_range(pa, size, SnoopKind::Flush);
        self.broadcast(CoherencyMsg::broadcast(
            CoherencyEvent::WriteBack,
            pa,
            size,
            Some(source_cpu),
        ));
    }

    // --- barriers ----------------------------------------------------------

    /// Drain the bus and, for write/full barriers, the calling CPU's dirty
    /// lines (shared L3 first, then the private levels), then fence.
    pub fn memory_barrier(&self, kind: BarrierKind, cpu: usize) -> Result<()> {
        self.bus.drain(|m| self.deliver(m));
        if kind != BarrierKind::Read {
            for wb in self.l3.drain_writebacks() {
                self.phys.write_bytes(wb.pa, &wb.data).map_err(Fault::Mem)?;
            }
            if let Some(hier) = self.hierarchy(cpu) {
                hier.drain_writebacks().map_err(Fault::Mem)?;
            }
        }
        fence(Ordering::SeqCst);
        Ok(())
    }

    // --- statistics --------------------------------------------------------

    pub fn stats(&self) -> CoordStats {
        CoordStats {
            total_accesses: self.counters.total_accesses.load(Ordering::Relaxed),
            coherency_events: self.counters.coherency_events.load(Ordering::Relaxed),
            reservation_conflicts: self.counters.reservation_conflicts.load(Ordering::Relaxed),
            tlb_invalidations: self.counters.tlb_invalidations.load(Ordering::Relaxed),
        }
    }

    pub fn tlb_stats(&self, cpu: usize) -> Option<TlbStats> {
        Some(self.tlbs.tlb(cpu)?.stats())
    }

    pub fn cache_stats(&self, cpu: usize) -> Option<HierarchyStats> {
        Some(self.hierarchy(cpu)?.stats())
    }

    pub fn reservation(&self, cpu: usize) -> Reservation {
        self.reservations.get(cpu)
    }

    /// L1D coherency state of the line at `pa` on `cpu`.
    pub fn line_state(&self, cpu: usize, pa: u64) -> Option<LineState> {
        self.hierarchy(cpu)?.l1d_state(pa)
    }
}
