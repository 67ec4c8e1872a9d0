//! Defines the fault and error types surfaced by the memory core.
//!
//! Faults are plain data: translation and memory faults carry enough context
//! (CPU, addresses, size, PC, access kind) for the executor to raise the
//! corresponding architectural exception. Nothing in the core unwinds across
//! the crate boundary.

use core::error::Error as CoreError;
use core::fmt;
use core::result::Result as CoreResult;

/// The kind of guest access that triggered an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbFaultKind {
    /// No mapping covers the virtual address.
    InvalidEntry,
    /// A mapping exists but denies the requested access.
    ProtectionFault,
    /// The virtual address is not aligned to the access size.
    AlignmentFault,
}

/// Raised by translation; becomes a TB miss / access violation trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbFault {
    pub kind: TlbFaultKind,
    pub cpu: usize,
    pub va: u64,
    pub asn: u16,
    pub pc: u64,
    pub access: AccessKind,
}

impl TlbFault {
    pub fn new(kind: TlbFaultKind, cpu: usize, va: u64, asn: u16, pc: u64, access: AccessKind) -> Self {
        Self {
            kind,
            cpu,
            va,
            asn,
            pc,
            access,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemFaultKind {
    /// The physical address lies outside the backing store.
    InvalidAddress,
    /// The physical address is not aligned to the access size.
    AlignmentFault,
    /// The physical store rejected the write.
    WriteError,
}

/// Raised when translation succeeded but the physical access cannot be
/// carried out; becomes a machine check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemFault {
    pub kind: MemFaultKind,
    pub pa: u64,
    pub size: usize,
    pub pc: u64,
}

impl MemFault {
    pub fn new(kind: MemFaultKind, pa: u64, size: usize, pc: u64) -> Self {
        Self { kind, pa, size, pc }
    }
}

/// Any fault a coordinator operation can surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Tlb(TlbFault),
    Mem(MemFault),
}

impl Fault {
    pub fn is_alignment(&self) -> bool {
        match self {
            Fault::Tlb(f) => f.kind == TlbFaultKind::AlignmentFault,
            Fault::Mem(f) => f.kind == MemFaultKind::AlignmentFault,
        }
    }
}

impl From<TlbFault> for Fault {
    fn from(f: TlbFault) -> Self {
        Fault::Tlb(f)
    }
}

impl From<MemFault> for Fault {
    fn from(f: MemFault) -> Self {
        Fault::Mem(f)
    }
}

pub type Result<T> = CoreResult<T, Fault>;

/// CPU registration failures. Fatal to the offending call only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationError {
    AlreadyRegistered(usize),
    TooManyCpus(usize),
    NotRegistered(usize),
}

/// Rejected cache or TLB geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryError {
    /// The named parameter must be a power of two.
    NotPowerOfTwo(&'static str, u64),
    /// A TLB resize or configuration exceeds the configured maxima.
    TlbLimit(&'static str, usize, usize),
    /// A cache size is not `line_size * assoc * power_of_two`.
    CacheShape(&'static str, u64),
}

macro_rules! display_via_debug {
    ($($ty:ty),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter) -> CoreResult<(), fmt::Error> {
                    fmt::Debug::fmt(self, f)
                }
            }
            impl CoreError for $ty {}
        )*
    };
}

display_via_debug!(TlbFault, MemFault, Fault, RegistrationError, GeometryError);
