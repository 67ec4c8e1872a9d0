// Copyright (c) 2023 Beihang University, Huawei Technologies Co.,Ltd. All rights reserved.
// Rust-AxpMem is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//          http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND,
// EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT,
// MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

//! The SMP memory substrate shared by all emulated Alpha AXP CPUs.
//!
//! Per-CPU translation caches ([`tlb`]), a MESI-coherent cache hierarchy
//! ([`cache`]), LL/SC reservations and the coherency bus ([`smp`]) sit on top
//! of a flat physical store ([`mem`]). The executor enters exclusively
//! through [`MemCoordinator`].

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate alloc;
#[macro_use]
extern crate log;

pub mod cache;
pub mod config;
pub mod error;
pub mod logger;
pub mod mem;
pub mod smp;
pub mod tlb;
pub mod utils;

pub use config::CoreConfig;
pub use error::{AccessKind, Fault, Result};
pub use smp::MemCoordinator;
