use crate::{Exception, ExecPhase, PhysAddr, SyncType, VirtAddr};

/// The location of a register inside the register storage of an architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegSlot {
    /// The index used with [`ArchIf::get_reg`] and [`ArchIf::set_reg`].
    pub index: u32,

    /// Byte offset from [`ArchIf::register_storage_base`].
    pub offset: u32,

    /// Size in bytes, one of 1, 2, 4 or 8.
    pub size: u32,
}

/// Registers the translation core reads and writes directly from generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegLayout {
    /// Address of the instruction currently executing.
    pub pc: RegSlot,

    /// Address of the next instruction to execute, returned to the driver when a unit exits.
    pub next_pc: RegSlot,

    /// Number of instructions executed so far. Must be 8 bytes wide.
    pub icount: RegSlot,

    /// Trap requested by the previous instruction.
    pub pending_trap: RegSlot,

    /// Trap active for the current instruction.
    pub trap_state: RegSlot,

    /// Total number of registers exposed through `get_reg`/`set_reg`.
    pub num_regs: u32,
}

impl RegLayout {
    pub fn slots(&self) -> [RegSlot; 5] {
        [self.pc, self.next_pc, self.icount, self.pending_trap, self.trap_state]
    }

    /// Checks that every slot has a size generated code can access directly.
    pub fn is_valid(&self) -> bool {
        self.icount.size == 8
            && self
                .slots()
                .iter()
                .all(|slot| matches!(slot.size, 1 | 2 | 4 | 8) && slot.index < self.num_regs)
    }
}

/// The architectural state consumed by the driver and by the runtime calls made from generated
/// code.
pub trait ArchIf {
    fn reg_layout(&self) -> RegLayout;

    /// Width in bits of register `idx`.
    fn reg_bit_width(&self, idx: u32) -> u32;

    /// Base of the register storage described by [`ArchIf::reg_layout`].
    ///
    /// The returned pointer must stay valid for as long as `self` is not moved.
    fn register_storage_base(&mut self) -> *mut u8;

    fn current_pc(&self) -> u64;

    fn instruction_count(&self) -> u64;

    /// Translates `addr` to a physical address, raising an access trap if it is not mapped.
    fn translate(&mut self, addr: VirtAddr) -> Result<PhysAddr, Exception>;

    /// Enters the trap handler for `id`, returning the address execution resumes at.
    fn enter_trap(&mut self, id: u32, addr: u64) -> u64;

    /// Synchronization phases the architecture wants to be notified about.
    fn required_sync_phases(&self) -> SyncType {
        SyncType::NONE
    }

    /// Resets the architectural state, optionally starting execution at `addr`.
    fn reset(&mut self, addr: Option<u64>);

    fn get_reg(&self, idx: u32) -> u64;

    fn set_reg(&mut self, idx: u32, value: u64);

    fn get_flag(&self, flag: u32) -> bool;

    fn set_flag(&mut self, flag: u32, value: bool);

    /// Recomputes the flags affected by `op` applied to `a` and `b`.
    fn update_flags(&mut self, op: u32, a: u64, b: u64);

    /// Reads `len` bytes (at most 8) from `addr`, zero-extended.
    fn read_mem(&mut self, addr: VirtAddr, len: usize) -> Result<u64, Exception>;

    /// Writes the low `len` bytes (at most 8) of `value` to `addr`.
    fn write_mem(&mut self, addr: VirtAddr, len: usize, value: u64) -> Result<(), Exception>;

    fn notify_phase(&mut self, _phase: ExecPhase) {}
}
