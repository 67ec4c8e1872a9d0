// Copyright (c) 2023 Beihang University, Huawei Technologies Co.,Ltd. All rights reserved.
// Rust-AxpMem is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//          http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND,
// EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT,
// MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

/// What a coherency message asks the targeted CPUs to do.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CoherencyEvent {
    /// Drop the covered lines; write back dirty payloads first.
    InvalidateLine,
    /// Write back dirty payloads, keep the lines.
    FlushLine,
    /// A dirty payload reached memory; resident mirrors may refresh.
    WriteBack,
    /// Break LL reservations over the covered granules.
    ReservationClear,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BusTarget {
    Broadcast,
    Cpu(usize),
}

/// One notice on the bus. Broadcasts skip `source_cpu`; a `source_cpu` of
/// `None` (device DMA) reaches everyone.
#[derive(Copy, Clone, Debug)]
pub struct CoherencyMsg {
    pub event: CoherencyEvent,
    pub pa: u64,
    pub size: u64,
    pub source_cpu: Option<usize>,
    pub target: BusTarget,
}

impl CoherencyMsg {
    pub fn broadcast(event: CoherencyEvent, pa: u64, size: u64, source_cpu: Option<usize>) -> CoherencyMsg {
        CoherencyMsg {
            event,
            pa,
            size,
            source_cpu,
            target: BusTarget::Broadcast,
        }
    }

    /// Whether delivery applies to `cpu`.
    pub fn targets(&self, cpu: usize) -> bool {
        if self.source_cpu == Some(cpu) {
            return false;
        }
        match self.target {
            BusTarget::Broadcast => true,
            BusTarget::Cpu(id) => id == cpu,
        }
    }
}

/// The process-wide, totally ordered coherency queue. Producers post under
/// the FIFO mutex; the coordinator drains to completion, so delivery is
/// synchronous from the producer's view.
pub struct CoherencyBus {
    queue: Mutex<VecDeque<CoherencyMsg>>,
    delivery: Mutex<()>,
    delivered: AtomicU64,
}

impl CoherencyBus {
    pub const fn new() -> CoherencyBus {
        CoherencyBus {
            queue: Mutex::new(VecDeque::new()),
            delivery: Mutex::new(()),
            delivered: AtomicU64::new(0),
        }
    }

    pub fn post(&self, msg: CoherencyMsg) {
        self.queue.lock().push_back(msg);
    }

    /// Deliver queued messages in order until the queue runs dry. The
    /// delivery lock serializes drains, so when this returns the caller's
    /// message has been applied even if a racing drain picked it up.
    pub fn drain(&self, mut deliver: impl FnMut(&CoherencyMsg)) {
        let _delivery = self.delivery.lock();
        loop {
            let msg = self.queue.lock().pop_front();
            match msg {
                Some(msg) => {
                    deliver(&msg);
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn fifo_order() {
        let bus = CoherencyBus::new();
        bus.post(CoherencyMsg::broadcast(CoherencyEvent::InvalidateLine, 0x100, 8, Some(0)));
        bus.post(CoherencyMsg::broadcast(CoherencyEvent::FlushLine, 0x200, 8, Some(1)));

        let mut seen = Vec::new();
        bus.drain(|msg| seen.push((msg.event, msg.pa)));
        assert_eq!(
            seen,
            vec![
                (CoherencyEvent::InvalidateLine, 0x100),
                (CoherencyEvent::FlushLine, 0x200)
            ]
        );
        assert_eq!(bus.pending(), 0);
        assert_eq!(bus.delivered(), 2);
    }

    #[test]
    fn targeting_rules() {
        let broadcast = CoherencyMsg::broadcast(CoherencyEvent::InvalidateLine, 0, 8, Some(1));
        assert!(broadcast.targets(0));
        assert!(!broadcast.targets(1));

        let dma = CoherencyMsg::broadcast(CoherencyEvent::ReservationClear, 0, 8, None);
        assert!(dma.targets(0));
        assert!(dma.targets(1));

        let directed = CoherencyMsg {
            target: BusTarget::Cpu(2),
            ..broadcast
        };
        assert!(directed.targets(2));
        assert!(!directed.targets(0));
    }
}
