/// Identifies an independent execution context. Translated code is never shared between
/// clusters.
pub type ClusterId = u32;

/// The purpose of a memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessType {
    /// Instruction fetch on behalf of a debugger or the driver, must not have side effects.
    DebugFetch,
    Fetch,
    Read,
    Write,
}

impl AccessType {
    pub fn is_fetch(self) -> bool {
        matches!(self, Self::DebugFetch | Self::Fetch)
    }
}

/// A guest virtual address tagged with the access it is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VirtAddr {
    pub access: AccessType,
    /// Architecture defined address space (e.g. main memory, CSR space).
    pub space: u32,
    pub val: u64,
}

impl VirtAddr {
    pub const fn new(access: AccessType, space: u32, val: u64) -> Self {
        Self { access, space, val }
    }

    pub const fn fetch(val: u64) -> Self {
        Self::new(AccessType::Fetch, 0, val)
    }

    /// Returns the address `bytes` past this one, keeping the access type and space.
    pub fn offset(self, bytes: u64) -> Self {
        Self { val: self.val.wrapping_add(bytes), ..self }
    }
}

impl std::fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.val)
    }
}

/// A guest physical address. Only valid for the translation attempt that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysAddr {
    pub access: AccessType,
    pub space: u32,
    pub val: u64,
}

impl PhysAddr {
    pub const fn new(access: AccessType, space: u32, val: u64) -> Self {
        Self { access, space, val }
    }

    /// The physical address of `addr` for architectures without address translation.
    pub const fn identity(addr: VirtAddr) -> Self {
        Self { access: addr.access, space: addr.space, val: addr.val }
    }
}

impl std::fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.val)
    }
}

/// How the driver should proceed after a translation unit returns.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Continuation {
    /// Fall through to the next sequential address.
    #[default]
    Continue,

    /// Control was transferred, the next address is only known at runtime.
    Branch,

    /// The unit detected a coherence hazard (e.g. self-modifying code): every unit of the cluster
    /// must be discarded.
    Flush,

    /// The unit itself is no longer valid and must be discarded after it returns.
    Trap,
}
