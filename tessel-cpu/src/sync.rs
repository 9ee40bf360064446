bitflags::bitflags! {
    /// Instruction boundaries at which generated code synchronizes with observers.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SyncType: u32 {
        /// Before the instruction executes.
        const PRE = 1;
        /// After the instruction executes.
        const POST = 2;
        const ALL = Self::PRE.bits() | Self::POST.bits();
    }
}

impl SyncType {
    pub const NONE: Self = Self::empty();
}

/// The execution phase reported to the architecture through `notify_phase`.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecPhase {
    InstructionStart = 0,
    InstructionEnd = 1,
}

impl ExecPhase {
    pub fn from_raw(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::InstructionStart),
            1 => Some(Self::InstructionEnd),
            _ => None,
        }
    }
}

impl From<SyncType> for ExecPhase {
    fn from(sync: SyncType) -> Self {
        // Only a pure "after" synchronization marks the end of an instruction.
        if sync == SyncType::POST { Self::InstructionEnd } else { Self::InstructionStart }
    }
}
