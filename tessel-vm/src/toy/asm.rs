//! Instruction encoding of the toy architecture.
//!
//! Every instruction is a little-endian 32-bit word:
//!
//! ```text
//!  31      24 23  20 19  16 15              0
//! +----------+------+------+-----------------+
//! |  opcode  |  rd  |  rs  |      imm16      |
//! +----------+------+------+-----------------+
//! ```
//!
//! `imm16` is sign-extended. Branch offsets are counted in instructions relative to the branch.

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Nop = 0x0,
    /// `rd = imm`
    Li = 0x1,
    /// `rd = rs + imm`, updates Z
    Addi = 0x2,
    /// `rd = rd + rs`, updates Z
    Add = 0x3,
    /// `rd = mem32[rs + imm]`, updates Z
    Ld = 0x4,
    /// `mem32[rs + imm] = rd`
    St = 0x5,
    /// `if rd == 0 { pc += imm * 4 }`
    Beqz = 0x6,
    /// `pc += imm * 4`
    Jmp = 0x7,
    /// Stops the simulation with status `rd`.
    Halt = 0x8,
    /// Discards every translated unit.
    Flush = 0x9,
    /// Discards the unit containing this instruction.
    Evict = 0xa,
    /// `rd = mem8[rs + imm]`, updates Z
    Ldb = 0xb,
    /// `mem8[rs + imm] = rd`
    Stb = 0xc,
    /// `if Z { pc += imm * 4 }`
    Bz = 0xd,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x0 => Self::Nop,
            0x1 => Self::Li,
            0x2 => Self::Addi,
            0x3 => Self::Add,
            0x4 => Self::Ld,
            0x5 => Self::St,
            0x6 => Self::Beqz,
            0x7 => Self::Jmp,
            0x8 => Self::Halt,
            0x9 => Self::Flush,
            0xa => Self::Evict,
            0xb => Self::Ldb,
            0xc => Self::Stb,
            0xd => Self::Bz,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inst {
    pub op: Opcode,
    pub rd: u8,
    pub rs: u8,
    pub imm: i16,
}

impl Inst {
    pub fn new(op: Opcode, rd: u8, rs: u8, imm: i16) -> Self {
        Self { op, rd, rs, imm }
    }

    /// Decodes `word`, returning `None` for unknown opcodes or register numbers.
    pub fn decode(word: u32) -> Option<Self> {
        let op = Opcode::from_u8((word >> 24) as u8)?;
        let rd = ((word >> 20) & 0xf) as u8;
        let rs = ((word >> 16) & 0xf) as u8;
        if rd as usize >= super::NUM_GPRS || rs as usize >= super::NUM_GPRS {
            return None;
        }
        Some(Self { op, rd, rs, imm: word as u16 as i16 })
    }

    pub fn encode(&self) -> u32 {
        (self.op as u32) << 24
            | (self.rd as u32 & 0xf) << 20
            | (self.rs as u32 & 0xf) << 16
            | self.imm as u16 as u32
    }

    /// The target of a branch at `pc`.
    pub fn branch_target(&self, pc: u64) -> u64 {
        pc.wrapping_add((self.imm as i64 * 4) as u64)
    }
}

pub fn nop() -> u32 {
    Inst::new(Opcode::Nop, 0, 0, 0).encode()
}

pub fn li(rd: u8, imm: i16) -> u32 {
    Inst::new(Opcode::Li, rd, 0, imm).encode()
}

pub fn addi(rd: u8, rs: u8, imm: i16) -> u32 {
    Inst::new(Opcode::Addi, rd, rs, imm).encode()
}

pub fn add(rd: u8, rs: u8) -> u32 {
    Inst::new(Opcode::Add, rd, rs, 0).encode()
}

pub fn ld(rd: u8, base: u8, offset: i16) -> u32 {
    Inst::new(Opcode::Ld, rd, base, offset).encode()
}

pub fn st(src: u8, base: u8, offset: i16) -> u32 {
    Inst::new(Opcode::St, src, base, offset).encode()
}

pub fn ldb(rd: u8, base: u8, offset: i16) -> u32 {
    Inst::new(Opcode::Ldb, rd, base, offset).encode()
}

pub fn stb(src: u8, base: u8, offset: i16) -> u32 {
    Inst::new(Opcode::Stb, src, base, offset).encode()
}

pub fn beqz(rd: u8, offset: i16) -> u32 {
    Inst::new(Opcode::Beqz, rd, 0, offset).encode()
}

pub fn bz(offset: i16) -> u32 {
    Inst::new(Opcode::Bz, 0, 0, offset).encode()
}

pub fn jmp(offset: i16) -> u32 {
    Inst::new(Opcode::Jmp, 0, 0, offset).encode()
}

pub fn halt(rd: u8) -> u32 {
    Inst::new(Opcode::Halt, rd, 0, 0).encode()
}

pub fn flush() -> u32 {
    Inst::new(Opcode::Flush, 0, 0, 0).encode()
}

pub fn evict() -> u32 {
    Inst::new(Opcode::Evict, 0, 0, 0).encode()
}

/// Converts a sequence of instruction words to a loadable image.
pub fn assemble(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|word| word.to_le_bytes()).collect()
}
