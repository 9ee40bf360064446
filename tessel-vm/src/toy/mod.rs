//! A small 32-bit architecture with a fixed 4-byte encoding, used to exercise the translation
//! core end to end.

pub mod asm;
mod translate;

use std::ops::Range;

use memoffset::offset_of;
use tessel_cpu::{
    AccessType, ArchIf, Exception, ExecPhase, PhysAddr, RegLayout, RegSlot, SyncType, VirtAddr,
};

pub use self::translate::ToyGenerator;

pub const NUM_GPRS: usize = 8;

pub const REG_PC: u32 = 8;
pub const REG_NEXT_PC: u32 = 9;
pub const REG_PENDING_TRAP: u32 = 10;
pub const REG_TRAP_STATE: u32 = 11;
pub const REG_ICOUNT: u32 = 12;
pub const NUM_REGS: u32 = 13;

/// Set when the result of the last flag-updating instruction was zero.
pub const FLAG_Z: u32 = 0;

/// Flag update performed by additions.
pub const FLAGS_ADD: u32 = 0;

/// Stores to this address stop the simulation with the stored value as the status.
pub const HALT_ADDR: u64 = 0xffff_0000;

pub mod cause {
    pub const FETCH_FAULT: u32 = 1;
    pub const LOAD_FAULT: u32 = 5;
    pub const STORE_FAULT: u32 = 7;
}

#[repr(C)]
#[derive(Debug, Default, Clone)]
pub struct ToyRegs {
    pub gpr: [u32; NUM_GPRS],
    pub pc: u32,
    pub next_pc: u32,
    pub pending_trap: u32,
    pub trap_state: u32,
    pub icount: u64,
}

pub struct ToyCore {
    pub regs: ToyRegs,
    pub zero: bool,

    pub ram: Vec<u8>,
    pub ram_base: u64,

    /// Address execution continues at after a trap.
    pub trap_vector: u64,

    /// Cause and address of the most recent trap.
    pub last_trap: Option<(u32, u64)>,

    /// Phases reported through `notify_phase`.
    pub sync_phases: SyncType,

    /// Number of `notify_phase` calls per phase, indexed by [ExecPhase].
    pub phase_counts: [u64; 2],
}

impl ToyCore {
    pub fn new(ram_base: u64, ram_size: usize) -> Self {
        Self {
            regs: ToyRegs::default(),
            zero: false,
            ram: vec![0; ram_size],
            ram_base,
            trap_vector: ram_base,
            last_trap: None,
            sync_phases: SyncType::NONE,
            phase_counts: [0; 2],
        }
    }

    /// Copies `data` to RAM at `addr`.
    pub fn load(&mut self, addr: u64, data: &[u8]) -> Result<(), Exception> {
        let range = self
            .ram_range(addr, data.len())
            .ok_or(Exception::AccessTrap { id: cause::STORE_FAULT, addr })?;
        self.ram[range].copy_from_slice(data);
        Ok(())
    }

    fn ram_range(&self, addr: u64, len: usize) -> Option<Range<usize>> {
        let start = usize::try_from(addr.checked_sub(self.ram_base)?).ok()?;
        let end = start.checked_add(len)?;
        (end <= self.ram.len()).then_some(start..end)
    }
}

impl ArchIf for ToyCore {
    fn reg_layout(&self) -> RegLayout {
        macro_rules! slot {
            ($index:expr, $field:ident, $size:expr) => {
                RegSlot { index: $index, offset: offset_of!(ToyRegs, $field) as u32, size: $size }
            };
        }
        RegLayout {
            pc: slot!(REG_PC, pc, 4),
            next_pc: slot!(REG_NEXT_PC, next_pc, 4),
            icount: slot!(REG_ICOUNT, icount, 8),
            pending_trap: slot!(REG_PENDING_TRAP, pending_trap, 4),
            trap_state: slot!(REG_TRAP_STATE, trap_state, 4),
            num_regs: NUM_REGS,
        }
    }

    fn reg_bit_width(&self, idx: u32) -> u32 {
        match idx {
            REG_ICOUNT => 64,
            idx if idx < NUM_REGS => 32,
            _ => 0,
        }
    }

    fn register_storage_base(&mut self) -> *mut u8 {
        (&mut self.regs as *mut ToyRegs).cast()
    }

    fn current_pc(&self) -> u64 {
        self.regs.pc as u64
    }

    fn instruction_count(&self) -> u64 {
        self.regs.icount
    }

    fn translate(&mut self, addr: VirtAddr) -> Result<PhysAddr, Exception> {
        if addr.access == AccessType::Fetch && self.ram_range(addr.val, 4).is_none() {
            return Err(Exception::AccessTrap { id: cause::FETCH_FAULT, addr: addr.val });
        }
        Ok(PhysAddr::identity(addr))
    }

    fn enter_trap(&mut self, id: u32, addr: u64) -> u64 {
        tracing::debug!("trap {id} at {addr:#x}, pc={:#x}", self.regs.pc);
        self.last_trap = Some((id, addr));
        self.regs.pending_trap = 0;
        self.regs.pc = self.trap_vector as u32;
        self.regs.next_pc = self.trap_vector as u32;
        self.trap_vector
    }

    fn required_sync_phases(&self) -> SyncType {
        self.sync_phases
    }

    fn reset(&mut self, addr: Option<u64>) {
        self.regs = ToyRegs::default();
        self.zero = false;
        self.last_trap = None;
        if let Some(addr) = addr {
            self.regs.pc = addr as u32;
            self.regs.next_pc = addr as u32;
        }
    }

    fn get_reg(&self, idx: u32) -> u64 {
        match idx {
            REG_PC => self.regs.pc as u64,
            REG_NEXT_PC => self.regs.next_pc as u64,
            REG_PENDING_TRAP => self.regs.pending_trap as u64,
            REG_TRAP_STATE => self.regs.trap_state as u64,
            REG_ICOUNT => self.regs.icount,
            idx => match self.regs.gpr.get(idx as usize) {
                Some(value) => *value as u64,
                None => {
                    tracing::warn!("read from invalid register {idx}");
                    0
                }
            },
        }
    }

    fn set_reg(&mut self, idx: u32, value: u64) {
        match idx {
            REG_PC => self.regs.pc = value as u32,
            REG_NEXT_PC => self.regs.next_pc = value as u32,
            REG_PENDING_TRAP => self.regs.pending_trap = value as u32,
            REG_TRAP_STATE => self.regs.trap_state = value as u32,
            REG_ICOUNT => self.regs.icount = value,
            idx => match self.regs.gpr.get_mut(idx as usize) {
                Some(reg) => *reg = value as u32,
                None => tracing::warn!("write to invalid register {idx}"),
            },
        }
    }

    fn get_flag(&self, flag: u32) -> bool {
        flag == FLAG_Z && self.zero
    }

    fn set_flag(&mut self, flag: u32, value: bool) {
        if flag == FLAG_Z {
            self.zero = value;
        }
    }

    fn update_flags(&mut self, op: u32, a: u64, b: u64) {
        match op {
            FLAGS_ADD => self.zero = (a as u32).wrapping_add(b as u32) == 0,
            _ => tracing::warn!("unknown flag update: {op}"),
        }
    }

    fn read_mem(&mut self, addr: VirtAddr, len: usize) -> Result<u64, Exception> {
        let Some(range) = self.ram_range(addr.val, len)
        else {
            let id = if addr.access.is_fetch() { cause::FETCH_FAULT } else { cause::LOAD_FAULT };
            return Err(Exception::AccessTrap { id, addr: addr.val });
        };
        let mut buf = [0; 8];
        buf[..len].copy_from_slice(&self.ram[range]);
        Ok(u64::from_le_bytes(buf))
    }

    fn write_mem(&mut self, addr: VirtAddr, len: usize, value: u64) -> Result<(), Exception> {
        if addr.val == HALT_ADDR {
            return Err(Exception::SimulationStopped(value as i32));
        }
        let range = self
            .ram_range(addr.val, len)
            .ok_or(Exception::AccessTrap { id: cause::STORE_FAULT, addr: addr.val })?;
        self.ram[range].copy_from_slice(&value.to_le_bytes()[..len]);
        Ok(())
    }

    fn notify_phase(&mut self, phase: ExecPhase) {
        self.phase_counts[phase as usize] += 1;
    }
}
