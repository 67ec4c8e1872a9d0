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

use spin::RwLock;

use crate::error::RegistrationError;

#[derive(Copy, Clone, Debug, Eq)]
/// CPU state Enum
pub enum CpuState {
    CpuInv = 0,
    CpuOff = 1,
    CpuIdle = 2,
    CpuRun = 3,
}

impl PartialEq for CpuState {
    fn eq(&self, other: &Self) -> bool {
        *self as usize == *other as usize
    }
}

/// A struct to store the registry information of a CPU
#[derive(Clone, Copy, Debug)]
pub struct CpuIf {
    pub state: CpuState,
    /// Current address space number, fed by the executor's ASN IPR.
    pub asn: u16,
    /// Kernel vs user mode, fed by the executor's PS IPR.
    pub kernel: bool,
    /// Virtual page table base. The core never walks it; the executor's
    /// fault handler reads it back when servicing a TB miss.
    pub vptb: u64,
    /// Floating-point enable, mirrored for the executor's fault path.
    pub fpen: bool,
    /// Pending interrupt bitmask, drained by the IRQ path.
    pub pending_interrupts: u64,
    /// Coordinator access tick of the last memory operation.
    pub last_activity: u64,
}

impl CpuIf {
    pub const fn default() -> CpuIf {
        CpuIf {
            state: CpuState::CpuInv,
            asn: 0,
            kernel: false,
            vptb: 0,
            fpen: false,
            pending_interrupts: 0,
            last_activity: 0,
        }
    }

    pub fn online(&self) -> bool {
        self.state as usize >= CpuState::CpuIdle as usize
    }
}

/// Registry of all CPUs the coordinator knows. Ids are assigned at
/// registration and never reused while the system runs.
pub struct CpuRegistry {
    cpus: RwLock<Vec<CpuIf>>,
}

impl CpuRegistry {
    pub fn new(max_cpus: usize) -> CpuRegistry {
        CpuRegistry {
            cpus: RwLock::new(vec![CpuIf::default(); max_cpus]),
        }
    }

    pub fn register(&self, cpu: usize) -> Result<(), RegistrationError> {
        let mut cpus = self.cpus.write();
        match cpus.get_mut(cpu) {
            None => Err(RegistrationError::TooManyCpus(cpu)),
            Some(cpu_if) if cpu_if.state != CpuState::CpuInv => {
                Err(RegistrationError::AlreadyRegistered(cpu))
            }
            Some(cpu_if) => {
                *cpu_if = CpuIf::default();
                cpu_if.state = CpuState::CpuIdle;
                Ok(())
            }
        }
    }

    pub fn unregister(&self, cpu: usize) -> Result<(), RegistrationError> {
        let mut cpus = self.cpus.write();
        match cpus.get_mut(cpu) {
            Some(cpu_if) if cpu_if.state != CpuState::CpuInv => {
                cpu_if.state = CpuState::CpuInv;
                Ok(())
            }
            _ => Err(RegistrationError::NotRegistered(cpu)),
        }
    }

    pub fn get(&self, cpu: usize) -> Option<CpuIf> {
        self.cpus.read().get(cpu).copied().filter(|c| c.state != CpuState::CpuInv)
    }

    pub fn is_online(&self, cpu: usize) -> bool {
        self.get(cpu).map(|c| c.online()).unwrap_or(false)
    }

    pub fn set_online(&self, cpu: usize, online: bool) {
        let mut cpus = self.cpus.write();
        if let Some(cpu_if) = cpus.get_mut(cpu) {
            if cpu_if.state != CpuState::CpuInv {
                cpu_if.state = if online { CpuState::CpuIdle } else { CpuState::CpuOff };
            }
        }
    }

    /// Update the MMU context (ASN, mode) used for this CPU's translations.
    pub fn set_context(&self, cpu: usize, asn: u16, kernel: bool) {
        let mut cpus = self.cpus.write();
        if let Some(cpu_if) = cpus.get_mut(cpu) {
            cpu_if.asn = asn;
            cpu_if.kernel = kernel;
        }
    }

    pub fn set_vptb(&self, cpu: usize, vptb: u64) {
        let mut cpus = self.cpus.write();
        if let Some(cpu_if) = cpus.get_mut(cpu) {
            cpu_if.vptb = vptb;
        }
    }

    pub fn set_fpen(&self, cpu: usize, fpen: bool) {
        let mut cpus = self.cpus.write();
        if let Some(cpu_if) = cpus.get_mut(cpu) {
            cpu_if.fpen = fpen;
        }
    }

    pub fn touch(&self, cpu: usize, tick: u64) {
        let mut cpus = self.cpus.write();
        if let Some(cpu_if) = cpus.get_mut(cpu) {
            cpu_if.last_activity = tick;
            cpu_if.state = if cpu_if.state == CpuState::CpuIdle {
                CpuState::CpuRun
            } else {
                cpu_if.state
            };
        }
    }

    pub fn post_interrupt(&self, cpu: usize, irq: u32) {
        let mut cpus = self.cpus.write();
        if let Some(cpu_if) = cpus.get_mut(cpu) {
            cpu_if.pending_interrupts |= 1 << irq;
        }
    }

    pub fn take_interrupts(&self, cpu: usize) -> u64 {
        let mut cpus = self.cpus.write();
        match cpus.get_mut(cpu) {
            Some(cpu_if) => core::mem::take(&mut cpu_if.pending_interrupts),
            None => 0,
        }
    }

    /// Ids of every online CPU.
    pub fn online_cpus(&self) -> Vec<usize> {
        self.cpus
            .read()
            .iter()
            .enumerate()
            .filter(|(_, c)| c.online())
            .map(|(id, _)| id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle() {
        let reg = CpuRegistry::new(2);
        assert!(reg.register(0).is_ok());
        assert_eq!(reg.register(0), Err(RegistrationError::AlreadyRegistered(0)));
        assert_eq!(reg.register(5), Err(RegistrationError::TooManyCpus(5)));
        assert!(reg.is_online(0));
        assert!(!reg.is_online(1));

        reg.set_online(0, false);
        assert!(!reg.is_online(0));
        reg.set_online(0, true);
        assert!(reg.is_online(0));

        assert!(reg.unregister(0).is_ok());
        assert_eq!(reg.unregister(0), Err(RegistrationError::NotRegistered(0)));
    }

    #[test]
    fn context_and_interrupts() {
        let reg = CpuRegistry::new(2);
        reg.register(0).unwrap();
        reg.set_context(0, 42, true);
        reg.set_vptb(0, 0x2000_0000);
        reg.set_fpen(0, true);
        let cpu_if = reg.get(0).unwrap();
        assert_eq!(cpu_if.asn, 42);
        assert!(cpu_if.kernel);
        assert_eq!(cpu_if.vptb, 0x2000_0000);
        assert!(cpu_if.fpen);

        reg.post_interrupt(0, 3);
        reg.post_interrupt(0, 7);
        assert_eq!(reg.take_interrupts(0), (1 << 3) | (1 << 7));
        assert_eq!(reg.take_interrupts(0), 0);
    }

    #[test]
    fn online_listing() {
        let reg = CpuRegistry::new(4);
        reg.register(0).unwrap();
        reg.register(2).unwrap();
        reg.set_online(2, false);
        assert_eq!(reg.online_cpus(), vec![0]);
    }
}
