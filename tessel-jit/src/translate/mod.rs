//! Module for building translation units as Cranelift functions.

mod shim;

use cranelift::{
    codegen::ir::{FuncRef, Function, SourceLoc},
    prelude::*,
};
use cranelift_jit::JITModule;
use cranelift_module::Module;
use memoffset::offset_of;

use tessel_cpu::{
    ArchIf, Continuation, Exception, ExecPhase, PhysAddr, PluginId, RegLayout, RegSlot, SyncType,
    VirtAddr,
};

use crate::{ExecContext, RuntimeFunctions};

pub use self::shim::BranchHint;

/// Result of generating one instruction: how the unit continues, and the block the next
/// instruction should be appended to (`None` if the generator terminated control flow itself).
pub type StepResult = Result<(Continuation, Option<Block>), Exception>;

/// Architecture specific instruction translation.
pub trait InstructionGenerator<A: ArchIf> {
    /// Generates the code for the instruction at `pc` into the current block of `tb`, then
    /// advances `pc` past it.
    ///
    /// If a block is returned it must be the current, unfilled, block of `tb`.
    fn gen_instruction(
        &mut self,
        core: &mut A,
        tb: &mut UnitBuilder<'_>,
        pc: &mut VirtAddr,
        inst_id: u32,
    ) -> StepResult;

    /// Generates the body of the trap block, the current block of `tb`. Must terminate it.
    fn gen_trap_behavior(&mut self, tb: &mut UnitBuilder<'_>);

    /// Generates the body of the leave block, the current block of `tb`. Must terminate it.
    fn gen_leave_behavior(&mut self, tb: &mut UnitBuilder<'_>) {
        tb.gen_default_leave();
    }
}

/// Parameters that control what code is emitted at instruction boundaries.
#[derive(Debug, Clone)]
pub struct UnitSettings {
    pub max_instructions: u32,
    pub core_id: u32,
    pub cluster_id: u32,

    /// Phases reported to the architecture through `notify_phase`.
    pub sync_exec: SyncType,

    /// Call the debugger before every instruction.
    pub debugging: bool,

    /// Leave the unit as soon as the instruction budget is exhausted.
    pub precise_limit: bool,

    pub plugins: Vec<(PluginId, SyncType)>,
    pub layout: RegLayout,
}

/// Describes a unit after it has been built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitInfo {
    pub cont: Continuation,
    pub instructions: u32,

    /// Guest address of each instruction in the unit.
    pub boundaries: Vec<u64>,
}

/// A fresh, empty function with the runtime-call surface declared.
pub struct Container<'a> {
    pub(crate) builder: FunctionBuilder<'a>,
    pub(crate) symbols: Symbols,
    pub(crate) processing: &'a mut Vec<(VirtAddr, PhysAddr)>,
}

pub(crate) struct Symbols {
    get_reg: FuncRef,
    set_reg: FuncRef,
    get_flag: FuncRef,
    set_flag: FuncRef,
    update_flags: FuncRef,
    read_mem: FuncRef,
    write_mem: FuncRef,
    notify_phase: FuncRef,
    pre_instr_sync: FuncRef,
    call_plugin: FuncRef,
}

impl Symbols {
    pub(crate) fn import(
        module: &mut JITModule,
        current: &mut Function,
        funcs: &RuntimeFunctions,
    ) -> Self {
        Self {
            get_reg: module.declare_func_in_func(funcs.get_reg, current),
            set_reg: module.declare_func_in_func(funcs.set_reg, current),
            get_flag: module.declare_func_in_func(funcs.get_flag, current),
            set_flag: module.declare_func_in_func(funcs.set_flag, current),
            update_flags: module.declare_func_in_func(funcs.update_flags, current),
            read_mem: module.declare_func_in_func(funcs.read_mem, current),
            write_mem: module.declare_func_in_func(funcs.write_mem, current),
            notify_phase: module.declare_func_in_func(funcs.notify_phase, current),
            pre_instr_sync: module.declare_func_in_func(funcs.pre_instr_sync, current),
            call_plugin: module.declare_func_in_func(funcs.call_plugin, current),
        }
    }
}

struct VmPtr(Value);

impl VmPtr {
    fn load_icount_limit(&self, builder: &mut FunctionBuilder) -> Value {
        let offset: i32 = offset_of!(ExecContext, icount_limit).try_into().unwrap();
        builder.ins().load(types::I64, MemFlags::trusted(), self.0, offset)
    }

    fn load_mem_value(&self, builder: &mut FunctionBuilder) -> Value {
        let offset: i32 = offset_of!(ExecContext, mem_value).try_into().unwrap();
        builder.ins().load(types::I64, MemFlags::trusted(), self.0, offset)
    }
}

/// Direct access to the register storage of the architecture.
struct RegsPtr(Value);

impl RegsPtr {
    fn load(&self, builder: &mut FunctionBuilder, slot: RegSlot) -> Value {
        let ty = shim::int_type(slot.size * 8);
        builder.ins().load(ty, MemFlags::trusted(), self.0, slot.offset as i32)
    }

    fn store(&self, builder: &mut FunctionBuilder, slot: RegSlot, value: Value) {
        let value = shim::resize_int(builder, value, slot.size * 8, false);
        builder.ins().store(MemFlags::trusted(), value, self.0, slot.offset as i32);
    }
}

/// Emits the code of a single translation unit.
pub struct UnitBuilder<'a> {
    /// The function being built. Generators may emit arbitrary code through it as long as
    /// architectural state is only accessed through the `gen_*` helpers.
    pub builder: FunctionBuilder<'a>,
    symbols: Symbols,
    settings: &'a UnitSettings,

    vm_ptr: VmPtr,
    core_ptr: Value,
    regs_ptr: RegsPtr,

    leave_block: Block,
    trap_block: Block,
}

/// Builds the unit starting at `start` (physical address `phys`) into `container`.
///
/// An access trap raised while generating any instruction but the first ends the unit before
/// that instruction. Every other error is returned and the container is discarded.
pub fn build_unit<A: ArchIf, G: InstructionGenerator<A>>(
    container: Container<'_>,
    core: &mut A,
    generator: &mut G,
    settings: &UnitSettings,
    start: VirtAddr,
    phys: PhysAddr,
) -> Result<UnitInfo, Exception> {
    let Container { builder, symbols, processing } = container;

    processing.push((start, phys));
    let result = UnitBuilder::new(builder, symbols, settings).build(core, generator, processing);
    processing.pop();

    result
}

impl<'a> UnitBuilder<'a> {
    fn new(
        mut builder: FunctionBuilder<'a>,
        symbols: Symbols,
        settings: &'a UnitSettings,
    ) -> Self {
        let entry_block = builder.create_block();
        builder.append_block_params_for_function_params(entry_block);
        builder.switch_to_block(entry_block);
        builder.seal_block(entry_block);

        let (vm_ptr, core_ptr, regs_ptr) = match builder.block_params(entry_block) {
            &[x0, x1, x2] => (x0, x1, x2),
            params => unreachable!("expected 3 params for entry block (got {})", params.len()),
        };

        let leave_block = builder.create_block();
        let trap_block = builder.create_block();
        builder.set_cold_block(trap_block);

        Self {
            builder,
            symbols,
            settings,
            vm_ptr: VmPtr(vm_ptr),
            core_ptr,
            regs_ptr: RegsPtr(regs_ptr),
            leave_block,
            trap_block,
        }
    }

    /// Grows the unit that starts at the top of `processing`.
    fn build<A: ArchIf, G: InstructionGenerator<A>>(
        mut self,
        core: &mut A,
        generator: &mut G,
        processing: &[(VirtAddr, PhysAddr)],
    ) -> Result<UnitInfo, Exception> {
        let &(start, phys) = match processing.last() {
            Some(entry) => entry,
            None => unreachable!("unit built outside of `build_unit`"),
        };

        // Each instruction is generated into its own block which is only linked into the unit
        // once generation succeeded, so a failed instruction leaves nothing reachable behind.
        let mut boundary = self.builder.create_block();
        self.builder.ins().jump(boundary, &[]);

        let mut pc = start;
        let mut cont = Continuation::Continue;
        let mut boundaries = vec![];
        let mut terminated = false;

        let max_instructions = self.settings.max_instructions.max(1) as usize;
        while boundaries.len() < max_instructions {
            let inst_id = boundaries.len() as u32;
            let inst_pc = pc.val;

            let first_inst_block = self.builder.func.dfg.num_blocks();
            let inst_block = self.builder.create_block();
            self.builder.switch_to_block(inst_block);
            self.builder.set_srcloc(SourceLoc::new(inst_id));
            self.gen_sync(SyncType::PRE, inst_id);

            let next = match generator.gen_instruction(core, &mut self, &mut pc, inst_id) {
                Ok((outcome, next)) => {
                    cont = outcome;
                    next
                }
                Err(e) => {
                    self.close_blocks_since(first_inst_block);

                    // There is no earlier boundary to end the unit at if the trap was raised by
                    // the instruction the unit starts with.
                    if inst_pc == start.val || !e.is_access_trap() {
                        // The container is discarded, but the builder context is reused.
                        self.builder.seal_all_blocks();
                        self.builder.finalize();
                        return Err(e);
                    }
                    tracing::debug!(
                        "{e} while translating {inst_pc:#x}, unit {start} ({phys}) ends after {} \
                        instructions",
                        boundaries.len()
                    );
                    break;
                }
            };
            boundaries.push(inst_pc);

            let next_boundary = match next {
                Some(block) => {
                    debug_assert_eq!(self.builder.current_block(), Some(block));
                    self.gen_sync(SyncType::POST, inst_id);
                    let next_boundary = self.builder.create_block();
                    self.builder.ins().jump(next_boundary, &[]);
                    Some(next_boundary)
                }
                None => {
                    if !self.builder.current_block().map_or(false, |block| self.is_terminated(block)) {
                        tracing::warn!("instruction at {inst_pc:#x} left its block open");
                        self.builder.ins().jump(self.leave_block, &[]);
                    }
                    None
                }
            };

            self.builder.switch_to_block(boundary);
            self.builder.ins().jump(inst_block, &[]);
            self.builder.seal_block(inst_block);

            match next_boundary {
                Some(block) => boundary = block,
                None => {
                    terminated = true;
                    break;
                }
            }
            if cont != Continuation::Continue {
                break;
            }
        }

        self.builder.set_srcloc(SourceLoc::default());
        if !terminated {
            self.builder.switch_to_block(boundary);
            self.builder.ins().jump(self.leave_block, &[]);
        }

        self.builder.switch_to_block(self.leave_block);
        generator.gen_leave_behavior(&mut self);

        self.builder.switch_to_block(self.trap_block);
        generator.gen_trap_behavior(&mut self);

        self.builder.seal_all_blocks();
        self.builder.finalize();

        Ok(UnitInfo { cont, instructions: boundaries.len() as u32, boundaries })
    }

    /// Terminates every block created since `first` that is still open, so that the code of an
    /// abandoned instruction is complete but unreachable.
    fn close_blocks_since(&mut self, first: usize) {
        if !self.builder.current_block().map_or(false, |block| self.is_terminated(block)) {
            self.builder.ins().jump(self.leave_block, &[]);
        }
        for index in first..self.builder.func.dfg.num_blocks() {
            let block = Block::from_u32(index as u32);
            if !self.is_terminated(block) {
                self.builder.switch_to_block(block);
                self.builder.ins().jump(self.leave_block, &[]);
            }
        }
    }

    fn is_terminated(&self, block: Block) -> bool {
        let func = &self.builder.func;
        func.layout
            .last_inst(block)
            .map_or(false, |inst| func.dfg.insts[inst].opcode().is_terminator())
    }

    /// Emits the code executed at an instruction boundary for `phase`.
    fn gen_sync(&mut self, phase: SyncType, inst_id: u32) {
        let layout = self.settings.layout;

        if phase == SyncType::PRE {
            if self.settings.precise_limit {
                self.gen_check_icount_limit(layout.icount);
            }

            let icount = self.regs_ptr.load(&mut self.builder, layout.icount);
            let icount = self.builder.ins().iadd_imm(icount, 1);
            self.regs_ptr.store(&mut self.builder, layout.icount, icount);

            let next_pc = self.regs_ptr.load(&mut self.builder, layout.next_pc);
            self.regs_ptr.store(&mut self.builder, layout.pc, next_pc);

            let pending_trap = self.regs_ptr.load(&mut self.builder, layout.pending_trap);
            self.regs_ptr.store(&mut self.builder, layout.trap_state, pending_trap);

            if self.settings.debugging {
                let pc = shim::resize_int(&mut self.builder, next_pc, 64, false);
                let call =
                    self.builder.ins().call(self.symbols.pre_instr_sync, &[self.vm_ptr.0, pc]);
                let status = self.builder.inst_results(call)[0];
                self.gen_trap_check(status);
            }
        }

        if self.settings.sync_exec.intersects(phase) {
            let exec_phase = self.builder.ins().iconst(types::I32, ExecPhase::from(phase) as i64);
            self.builder.ins().call(self.symbols.notify_phase, &[self.core_ptr, exec_phase]);
        }

        for &(PluginId(id), sync) in &self.settings.plugins {
            if !sync.intersects(phase) {
                continue;
            }
            let args = [
                self.vm_ptr.0,
                self.builder.ins().iconst(types::I32, id as i64),
                self.builder.ins().iconst(types::I32, self.settings.core_id as i64),
                self.builder.ins().iconst(types::I32, self.settings.cluster_id as i64),
                self.builder.ins().iconst(types::I32, phase.bits() as i64),
                self.builder.ins().iconst(types::I32, inst_id as i64),
            ];
            self.builder.ins().call(self.symbols.call_plugin, &args);
        }
    }

    /// Leaves the unit before the current instruction if the instruction budget is exhausted.
    fn gen_check_icount_limit(&mut self, icount: RegSlot) {
        let icount = self.regs_ptr.load(&mut self.builder, icount);
        let limit = self.vm_ptr.load_icount_limit(&mut self.builder);
        let exhausted = self.builder.ins().icmp(IntCC::UnsignedGreaterThanOrEqual, icount, limit);

        let next = self.builder.create_block();
        self.builder.ins().brif(exhausted, self.leave_block, &[], next, &[]);
        self.builder.switch_to_block(next);
        self.builder.seal_block(next);
    }

    /// Branches to the trap block if `status` is non-zero.
    fn gen_trap_check(&mut self, status: Value) {
        let ok_block = self.builder.create_block();
        self.builder.ins().brif(status, self.trap_block, &[], ok_block, &[]);
        self.builder.switch_to_block(ok_block);
        self.builder.seal_block(ok_block);
    }
}
