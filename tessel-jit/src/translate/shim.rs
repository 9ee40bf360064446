//! Helpers generators use to access architectural state.
//!
//! Registers, flags and memory are only reached through the runtime-call surface so the
//! architecture can instrument or validate every access.

use std::cmp::Ordering;

use cranelift::prelude::*;
use tessel_cpu::RegLayout;

use super::UnitBuilder;

/// The side of a conditional branch expected to be taken. The other side is laid out as cold
/// code.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum BranchHint {
    #[default]
    None,
    Then,
    Else,
}

pub(crate) fn int_type(bits: u32) -> Type {
    match bits {
        8 => types::I8,
        16 => types::I16,
        32 => types::I32,
        64 => types::I64,
        _ => panic!("Invalid integer width {bits}"),
    }
}

/// Resizes `value` to an integer with `bits` bits, truncating or extending as needed.
pub(crate) fn resize_int(
    builder: &mut FunctionBuilder,
    value: Value,
    bits: u32,
    signed: bool,
) -> Value {
    let in_bits = builder.func.dfg.value_type(value).bits() as u32;
    let ty = int_type(bits);
    match in_bits.cmp(&bits) {
        Ordering::Equal => value,
        Ordering::Greater => builder.ins().ireduce(ty, value),
        Ordering::Less if signed => builder.ins().sextend(ty, value),
        Ordering::Less => builder.ins().uextend(ty, value),
    }
}

impl<'a> UnitBuilder<'a> {
    /// Target of the normal exit of the unit.
    pub fn leave_block(&self) -> Block {
        self.leave_block
    }

    /// Target of every path that raised an exception.
    pub fn trap_block(&self) -> Block {
        self.trap_block
    }

    pub fn vm_ptr(&self) -> Value {
        self.vm_ptr.0
    }

    pub fn core_ptr(&self) -> Value {
        self.core_ptr
    }

    pub fn regs_ptr(&self) -> Value {
        self.regs_ptr.0
    }

    pub fn layout(&self) -> RegLayout {
        self.settings.layout
    }

    pub fn gen_const(&mut self, bits: u32, value: u64) -> Value {
        let mask = if bits >= 64 { u64::MAX } else { (1 << bits) - 1 };
        self.builder.ins().iconst(int_type(bits), (value & mask) as i64)
    }

    pub fn gen_ext(&mut self, value: Value, bits: u32, signed: bool) -> Value {
        resize_int(&mut self.builder, value, bits, signed)
    }

    /// Branch-free `cond ? t : f`.
    pub fn gen_cond_assign(&mut self, cond: Value, t: Value, f: Value) -> Value {
        self.builder.ins().select(cond, t, f)
    }

    /// Terminates the current block with a branch on `cond`.
    pub fn gen_cond_branch(
        &mut self,
        cond: Value,
        then_block: Block,
        else_block: Block,
        hint: BranchHint,
    ) {
        match hint {
            BranchHint::Then => self.builder.set_cold_block(else_block),
            BranchHint::Else => self.builder.set_cold_block(then_block),
            BranchHint::None => {}
        }
        self.builder.ins().brif(cond, then_block, &[], else_block, &[]);
    }

    /// Reads register `idx` resized to `bits` bits.
    pub fn gen_get_reg(&mut self, idx: u32, bits: u32) -> Value {
        let idx = self.builder.ins().iconst(types::I32, idx as i64);
        let call = self.builder.ins().call(self.symbols.get_reg, &[self.core_ptr, idx]);
        let value = self.builder.inst_results(call)[0];
        resize_int(&mut self.builder, value, bits, false)
    }

    pub fn gen_set_reg(&mut self, idx: u32, value: Value) {
        let value = resize_int(&mut self.builder, value, 64, false);
        let idx = self.builder.ins().iconst(types::I32, idx as i64);
        self.builder.ins().call(self.symbols.set_reg, &[self.core_ptr, idx, value]);
    }

    /// Reads `flag` as an `i8` that is either 0 or 1.
    pub fn gen_get_flag(&mut self, flag: u32) -> Value {
        let flag = self.builder.ins().iconst(types::I32, flag as i64);
        let call = self.builder.ins().call(self.symbols.get_flag, &[self.core_ptr, flag]);
        let value = self.builder.inst_results(call)[0];
        self.builder.ins().icmp_imm(IntCC::NotEqual, value, 0)
    }

    /// Sets `flag` if `value` is non-zero, otherwise clears it.
    pub fn gen_set_flag(&mut self, flag: u32, value: Value) {
        let value = self.builder.ins().icmp_imm(IntCC::NotEqual, value, 0);
        let value = self.builder.ins().uextend(types::I32, value);
        let flag = self.builder.ins().iconst(types::I32, flag as i64);
        self.builder.ins().call(self.symbols.set_flag, &[self.core_ptr, flag, value]);
    }

    pub fn gen_update_flags(&mut self, op: u32, a: Value, b: Value) {
        let a = resize_int(&mut self.builder, a, 64, false);
        let b = resize_int(&mut self.builder, b, 64, false);
        let op = self.builder.ins().iconst(types::I32, op as i64);
        self.builder.ins().call(self.symbols.update_flags, &[self.core_ptr, op, a, b]);
    }

    /// Reads `bytes` bytes from `addr` in address space `space`. A failed read exits through
    /// the trap block.
    pub fn gen_read_mem(&mut self, space: u32, addr: Value, bytes: u32) -> Value {
        let ty = int_type(bytes * 8);

        let addr = resize_int(&mut self.builder, addr, 64, false);
        let space = self.builder.ins().iconst(types::I32, space as i64);
        let len = self.builder.ins().iconst(types::I32, bytes as i64);
        let call = self
            .builder
            .ins()
            .call(self.symbols.read_mem, &[self.vm_ptr.0, self.core_ptr, space, addr, len]);
        let status = self.builder.inst_results(call)[0];
        self.gen_trap_check(status);

        let value = self.vm_ptr.load_mem_value(&mut self.builder);
        if ty == types::I64 { value } else { self.builder.ins().ireduce(ty, value) }
    }

    /// Writes `value` to `addr` in address space `space`, the width of `value` determines the
    /// number of bytes written. A failed write exits through the trap block.
    pub fn gen_write_mem(&mut self, space: u32, addr: Value, value: Value) {
        let bytes = self.builder.func.dfg.value_type(value).bytes();

        let addr = resize_int(&mut self.builder, addr, 64, false);
        let value = resize_int(&mut self.builder, value, 64, false);
        let space = self.builder.ins().iconst(types::I32, space as i64);
        let len = self.builder.ins().iconst(types::I32, bytes as i64);
        let call = self.builder.ins().call(
            self.symbols.write_mem,
            &[self.vm_ptr.0, self.core_ptr, space, addr, len, value],
        );
        let status = self.builder.inst_results(call)[0];
        self.gen_trap_check(status);
    }

    /// Returns the value of `next_pc` to the driver.
    pub fn gen_default_leave(&mut self) {
        let next_pc = self.gen_get_reg(self.settings.layout.next_pc.index, 64);
        self.builder.ins().return_(&[next_pc]);
    }
}
