use cranelift::prelude::{InstBuilder, IntCC, Value};
use tessel_cpu::{AccessType, ArchIf, Continuation, Exception, VirtAddr};
use tessel_jit::{BranchHint, InstructionGenerator, StepResult, UnitBuilder};

use super::{
    asm::{Inst, Opcode},
    ToyCore, FLAGS_ADD, FLAG_Z, HALT_ADDR, REG_NEXT_PC, REG_PC,
};

/// Translates toy instructions.
#[derive(Debug, Default, Clone, Copy)]
pub struct ToyGenerator;

impl InstructionGenerator<ToyCore> for ToyGenerator {
    fn gen_instruction(
        &mut self,
        core: &mut ToyCore,
        tb: &mut UnitBuilder<'_>,
        pc: &mut VirtAddr,
        _inst_id: u32,
    ) -> StepResult {
        let word = core.read_mem(VirtAddr::new(AccessType::Fetch, pc.space, pc.val), 4)?;
        let inst = Inst::decode(word as u32).ok_or(Exception::Decode(pc.val))?;

        let fallthrough = tb.gen_const(32, pc.val.wrapping_add(4));
        tb.gen_set_reg(REG_NEXT_PC, fallthrough);

        let (rd, rs) = (inst.rd as u32, inst.rs as u32);
        let cont = match inst.op {
            Opcode::Nop => Continuation::Continue,
            Opcode::Li => {
                let value = tb.gen_const(32, inst.imm as i64 as u64);
                tb.gen_set_reg(rd, value);
                Continuation::Continue
            }
            Opcode::Addi => {
                let a = tb.gen_get_reg(rs, 32);
                let b = tb.gen_const(32, inst.imm as i64 as u64);
                gen_add(tb, rd, a, b);
                Continuation::Continue
            }
            Opcode::Add => {
                let a = tb.gen_get_reg(rd, 32);
                let b = tb.gen_get_reg(rs, 32);
                gen_add(tb, rd, a, b);
                Continuation::Continue
            }
            Opcode::Ld | Opcode::Ldb => {
                let bytes = if inst.op == Opcode::Ld { 4 } else { 1 };
                let addr = gen_addr(tb, &inst);
                let value = tb.gen_read_mem(0, addr, bytes);
                let value = tb.gen_ext(value, 32, false);
                tb.gen_set_reg(rd, value);
                let is_zero = tb.builder.ins().icmp_imm(IntCC::Equal, value, 0);
                tb.gen_set_flag(FLAG_Z, is_zero);
                Continuation::Continue
            }
            Opcode::St | Opcode::Stb => {
                let addr = gen_addr(tb, &inst);
                let value = tb.gen_get_reg(rd, 32);
                let value = if inst.op == Opcode::St { value } else { tb.gen_ext(value, 8, false) };
                tb.gen_write_mem(0, addr, value);
                Continuation::Continue
            }
            Opcode::Beqz => {
                let value = tb.gen_get_reg(rd, 32);
                let is_zero = tb.builder.ins().icmp_imm(IntCC::Equal, value, 0);
                let target = tb.gen_const(32, inst.branch_target(pc.val));
                let next_pc = tb.gen_cond_assign(is_zero, target, fallthrough);
                tb.gen_set_reg(REG_NEXT_PC, next_pc);
                Continuation::Branch
            }
            Opcode::Bz => {
                let taken = tb.builder.create_block();
                let done = tb.builder.create_block();

                let zero = tb.gen_get_flag(FLAG_Z);
                tb.gen_cond_branch(zero, taken, done, BranchHint::None);

                tb.builder.switch_to_block(taken);
                tb.builder.seal_block(taken);
                let target = tb.gen_const(32, inst.branch_target(pc.val));
                tb.gen_set_reg(REG_NEXT_PC, target);
                tb.builder.ins().jump(done, &[]);

                tb.builder.switch_to_block(done);
                tb.builder.seal_block(done);
                Continuation::Branch
            }
            Opcode::Jmp => {
                let target = tb.gen_const(32, inst.branch_target(pc.val));
                tb.gen_set_reg(REG_NEXT_PC, target);
                Continuation::Branch
            }
            Opcode::Halt => {
                let addr = tb.gen_const(64, HALT_ADDR);
                let status = tb.gen_get_reg(rd, 32);
                tb.gen_write_mem(0, addr, status);
                Continuation::Branch
            }
            Opcode::Flush => Continuation::Flush,
            Opcode::Evict => Continuation::Trap,
        };

        *pc = pc.offset(4);
        Ok((cont, tb.builder.current_block()))
    }

    fn gen_trap_behavior(&mut self, tb: &mut UnitBuilder<'_>) {
        // Resume at the instruction that raised the exception.
        let pc = tb.gen_get_reg(REG_PC, 64);
        tb.builder.ins().return_(&[pc]);
    }
}

fn gen_addr(tb: &mut UnitBuilder<'_>, inst: &Inst) -> Value {
    let base = tb.gen_get_reg(inst.rs as u32, 32);
    let addr = tb.builder.ins().iadd_imm(base, inst.imm as i64);
    tb.gen_ext(addr, 64, false)
}

fn gen_add(tb: &mut UnitBuilder<'_>, rd: u32, a: Value, b: Value) {
    let result = tb.builder.ins().iadd(a, b);
    tb.gen_update_flags(FLAGS_ADD, a, b);
    tb.gen_set_reg(rd, result);
}
