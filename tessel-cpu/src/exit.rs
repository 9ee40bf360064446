use crate::STOP_CLEAN;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum VmExit {
    /// The VM exited because it reached instruction count limit.
    InstructionLimit,

    /// The architecture stopped the simulation with a status code.
    Stopped(i32),

    /// The instruction at the given address could not be decoded.
    DecodeError(u64),
}

impl VmExit {
    /// The status a process running the simulation should exit with.
    pub fn exit_code(&self) -> i32 {
        match *self {
            Self::InstructionLimit => 0,
            Self::Stopped(STOP_CLEAN) => 0,
            Self::Stopped(code) => code,
            Self::DecodeError(_) => -1,
        }
    }
}
