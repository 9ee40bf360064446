/// The stop code an architecture uses to signal a successful end of the simulation.
pub const STOP_CLEAN: i32 = 1;

/// Conditions raised by an architecture, either while a unit is being generated or while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Exception {
    /// A recoverable fault (e.g. a page fault). Execution resumes at the trap vector the
    /// architecture computes for `id`.
    #[error("access trap {id:#x} at {addr:#x}")]
    AccessTrap { id: u32, addr: u64 },

    /// The architecture requested the end of the simulation.
    #[error("simulation stopped with status {0:#x}")]
    SimulationStopped(i32),

    /// No translation exists for the instruction at the given address.
    #[error("failed to decode instruction at {0:#x}")]
    Decode(u64),
}

impl Exception {
    pub fn is_access_trap(&self) -> bool {
        matches!(self, Self::AccessTrap { .. })
    }
}
