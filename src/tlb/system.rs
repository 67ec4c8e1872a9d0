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

use spin::RwLock;

use crate::config::TlbConfig;
use crate::error::{AccessKind, RegistrationError};

use super::translation::Tlb;

/// Registry of the per-CPU TLBs plus the cross-CPU shootdown primitives.
///
/// Broadcasts are synchronous: when a call returns, no registered peer still
/// holds the invalidated mapping.
pub struct TlbSystem {
    tlbs: RwLock<Vec<Option<Arc<Tlb>>>>,
    cfg: TlbConfig,
    page_size: u64,
}

impl TlbSystem {
    pub fn new(cfg: TlbConfig, page_size: u64, max_cpus: usize) -> TlbSystem {
        TlbSystem {
            tlbs: RwLock::new(vec![None; max_cpus]),
            cfg,
            page_size,
        }
    }

    /// Create an empty TLB with the configured geometry for `cpu`.
    pub fn register_cpu(&self, cpu: usize) -> Result<(), RegistrationError> {
        let mut tlbs = self.tlbs.write();
        if cpu >= tlbs.len() {
            return Err(RegistrationError::TooManyCpus(cpu));
        }
        if tlbs[cpu].is_some() {
            return Err(RegistrationError::AlreadyRegistered(cpu));
        }
        tlbs[cpu] = Some(Arc::new(Tlb::new(&self.cfg, self.page_size)));
        Ok(())
    }

    pub fn unregister_cpu(&self, cpu: usize) -> Result<(), RegistrationError> {
        let mut tlbs = self.tlbs.write();
        match tlbs.get_mut(cpu) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(RegistrationError::NotRegistered(cpu)),
        }
    }

    pub fn tlb(&self, cpu: usize) -> Option<Arc<Tlb>> {
        self.tlbs.read().get(cpu)?.clone()
    }

    /// Plain probe of one CPU's TLB; permission checking is the caller's.
    pub fn check_tb(&self, cpu: usize, va: u64, asn: u16, kernel: bool, is_instr: bool) -> Option<u64> {
        self.tlb(cpu)?.lookup(va, asn, kernel, is_instr)
    }

    /// Probe enforcing the protection bit for `access`; a permission
    /// mismatch is absence and counts as a miss on that CPU.
    pub fn find_entry(
        &self,
        cpu: usize,
        va: u64,
        asn: u16,
        kernel: bool,
        is_instr: bool,
        access: AccessKind,
    ) -> Option<u64> {
        self.tlb(cpu)?.find(va, asn, kernel, is_instr, Some(access))
    }

    fn for_each_peer(&self, exclude_cpu: Option<usize>, f: impl Fn(&Tlb)) {
        let tlbs = self.tlbs.read();
        for (id, slot) in tlbs.iter().enumerate() {
            if Some(id) == exclude_cpu {
                continue;
            }
            if let Some(tlb) = slot {
                f(tlb);
            }
        }
    }

    /// Drop the mapping of `va` (ASN-scoped, 0 = wildcard) on every
    /// registered CPU but the excluded one.
    pub fn invalidate_entry_all_cpus(&self, va: u64, asn: u16, exclude_cpu: Option<usize>) {
        self.for_each_peer(exclude_cpu, |tlb| tlb.invalidate_address(va, asn));
    }

    pub fn invalidate_by_asn_all_cpus(&self, asn: u16, exclude_cpu: Option<usize>) {
        self.for_each_peer(exclude_cpu, |tlb| tlb.invalidate_asn(asn));
    }

    pub fn invalidate_all_cpus(&self, exclude_cpu: Option<usize>) {
        self.for_each_peer(exclude_cpu, |tlb| tlb.invalidate_all());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::Prot;

    fn system() -> TlbSystem {
        let sys = TlbSystem::new(TlbConfig::default(), 8192, 4);
        sys.register_cpu(0).unwrap();
        sys.register_cpu(1).unwrap();
        sys
    }

    fn seed(sys: &TlbSystem, cpu: usize, va: u64, pa: u64) {
        sys.tlb(cpu)
            .unwrap()
            .insert(va, pa, 7, Prot::READ | Prot::WRITE, false, false, false);
    }

    #[test]
    fn registration_rules() {
        let sys = system();
        assert_eq!(sys.register_cpu(0), Err(RegistrationError::AlreadyRegistered(0)));
        assert_eq!(sys.register_cpu(9), Err(RegistrationError::TooManyCpus(9)));
        assert!(sys.unregister_cpu(1).is_ok());
        assert_eq!(sys.unregister_cpu(1), Err(RegistrationError::NotRegistered(1)));
        assert!(sys.tlb(1).is_none());
    }

    #[test]
    fn permission_enforced_probe() {
        let sys = system();
        sys.tlb(0).unwrap().insert(0x2000, 0x6000, 7, Prot::READ, false, false, false);
        assert_eq!(sys.find_entry(0, 0x2000, 7, false, false, AccessKind::Read), Some(0x6000));
        assert_eq!(sys.find_entry(0, 0x2000, 7, false, false, AccessKind::Write), None);
    }

    #[test]
    fn shootdown_excludes_initiator() {
        let sys = system();
        seed(&sys, 0, 0x5000 & !8191, 0x9_0000);
        seed(&sys, 1, 0x5000 & !8191, 0x9_0000);
        sys.invalidate_entry_all_cpus(0x5000, 0, Some(0));
        assert!(sys.check_tb(0, 0x5000 & !8191, 7, false, false).is_some());
        assert!(sys.check_tb(1, 0x5000 & !8191, 7, false, false).is_none());
    }

    #[test]
    fn asn_broadcast() {
        let sys = system();
        seed(&sys, 0, 0x4000, 0x8000);
        seed(&sys, 1, 0x4000, 0x8000);
        sys.invalidate_by_asn_all_cpus(7, None);
        assert!(sys.check_tb(0, 0x4000, 7, false, false).is_none());
        assert!(sys.check_tb(1, 0x4000, 7, false, false).is_none());
    }

    #[test]
    fn full_broadcast() {
        let sys = system();
        seed(&sys, 0, 0x4000, 0x8000);
        seed(&sys, 1, 0x6000, 0xa000);
        sys.invalidate_all_cpus(Some(1));
        assert!(sys.check_tb(0, 0x4000, 7, false, false).is_none());
        assert!(sys.check_tb(1, 0x6000, 7, false, false).is_some());
    }
}
