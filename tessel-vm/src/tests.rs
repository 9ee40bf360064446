use std::{cell::RefCell, rc::Rc};

use cranelift::prelude::InstBuilder;
use tessel_cpu::{
    ArchIf, Config, Continuation, Debugger, Exception, ExecPhase, PhaseEvent, SyncType, VirtAddr,
    VmExit, VmPlugin,
};
use tessel_jit::{BuildError, InstructionGenerator, StepResult, UnitBuilder};

use crate::{
    toy::{asm::*, cause, ToyCore, ToyGenerator, FLAG_Z},
    RunSummary, Vm, VmError,
};

const RAM_BASE: u64 = 0x1000;
const RAM_SIZE: usize = 0x1000;

type ToyVm = Vm<ToyCore, ToyGenerator>;

fn load(core: &mut ToyCore, addr: u64, words: &[u32]) {
    core.load(addr, &assemble(words)).unwrap();
}

fn toy_vm(config: Config, mut core: ToyCore) -> ToyVm {
    core.reset(Some(RAM_BASE));
    Vm::new(Box::new(core), ToyGenerator, config).unwrap()
}

fn program_vm(config: Config, program: &[u32]) -> ToyVm {
    let mut core = ToyCore::new(RAM_BASE, RAM_SIZE);
    load(&mut core, RAM_BASE, program);
    toy_vm(config, core)
}

fn run_program(program: &[u32]) -> (ToyVm, VmExit) {
    let mut vm = program_vm(Config::default(), program);
    let exit = vm.run(None).unwrap();
    (vm, exit)
}

/// Records every event it observes.
struct Recorder {
    sync: Option<SyncType>,
    events: Rc<RefCell<Vec<PhaseEvent>>>,
}

impl VmPlugin for Recorder {
    fn registration(&mut self, _version: &str) -> Option<SyncType> {
        self.sync
    }

    fn callback(&mut self, event: &PhaseEvent) {
        self.events.borrow_mut().push(*event);
    }
}

fn recorder(sync: Option<SyncType>) -> (Box<Recorder>, Rc<RefCell<Vec<PhaseEvent>>>) {
    let events = Rc::new(RefCell::new(vec![]));
    (Box::new(Recorder { sync, events: events.clone() }), events)
}

fn pre_events(events: &RefCell<Vec<PhaseEvent>>) -> usize {
    events.borrow().iter().filter(|event| event.phase == SyncType::PRE).count()
}

/// 127 instructions that fall through, then a jump back to the start.
fn loop_program() -> Vec<u32> {
    let mut code = vec![nop(); 127];
    code.push(jmp(-127));
    code
}

#[test]
fn loop_reuses_a_single_unit() {
    let code = loop_program();
    let mut vm = program_vm(Config::default(), &code);
    let (plugin, events) = recorder(Some(SyncType::PRE));
    vm.register_plugin(plugin).unwrap();

    assert_eq!(vm.run(Some(1000)).unwrap(), VmExit::InstructionLimit);
    assert_eq!(vm.core.instruction_count(), 1000);
    assert_eq!(pre_events(&events), 1000);

    assert_eq!(vm.jit.size(0), 1);
    assert_eq!(vm.jit.jit_miss, 1);
    assert_eq!(vm.jit.lookup(0, RAM_BASE).unwrap().instructions, 128);
    assert_eq!(vm.jit.lookup(0, RAM_BASE).unwrap().cont, Continuation::Branch);

    // 1000 = 7 * 128 + 104
    assert_eq!(vm.core.regs.pc as u64, RAM_BASE + 104 * 4);
}

#[test]
fn instruction_limit_is_never_exceeded() {
    for limit in [0, 1, 5, 127, 128, 129, 300] {
        let code = loop_program();
        let mut vm = program_vm(Config::default(), &code);
        let (plugin, events) = recorder(Some(SyncType::PRE));
        vm.register_plugin(plugin).unwrap();

        assert_eq!(vm.run(Some(limit)).unwrap(), VmExit::InstructionLimit);
        assert_eq!(pre_events(&events) as u64, limit, "limit = {limit}");
        assert_eq!(vm.core.instruction_count(), limit);
    }
}

#[test]
fn imprecise_limit_finishes_the_current_unit() {
    let code = loop_program();
    let config = Config { precise_instruction_limit: false, ..Config::default() };
    let mut vm = program_vm(config, &code);

    assert_eq!(vm.run(Some(200)).unwrap(), VmExit::InstructionLimit);
    assert_eq!(vm.core.instruction_count(), 256);
}

#[test]
fn step_resumes_where_it_stopped() {
    let mut vm = program_vm(Config::default(), &[nop(); 8]);

    assert_eq!(vm.step(3).unwrap(), VmExit::InstructionLimit);
    assert_eq!(vm.core.current_pc(), RAM_BASE + 12);

    assert_eq!(vm.step(2).unwrap(), VmExit::InstructionLimit);
    assert_eq!(vm.core.current_pc(), RAM_BASE + 20);
    assert_eq!(vm.core.instruction_count(), 5);
}

#[test]
fn fetch_fault_truncates_unit_and_enters_trap() {
    // The unit at X runs into the end of RAM after 4 instructions.
    let x = RAM_BASE + 0xf0;
    let y = RAM_BASE;
    let mut core = ToyCore::new(RAM_BASE, 0x100);
    load(&mut core, x, &[nop(); 4]);
    load(&mut core, y, &[li(1, 1), halt(1)]);
    core.trap_vector = y;
    let mut vm = toy_vm(Config { max_unit_instructions: 10, ..Config::default() }, core);

    let unit = vm.get_or_build(x).unwrap();
    assert_eq!(unit.instructions, 4);
    assert_eq!(unit.cont, Continuation::Continue);
    assert_eq!(vm.jit.jit_miss, 1);

    let exit = vm.run_from(x, None).unwrap();
    assert_eq!(exit, VmExit::Stopped(1));
    assert_eq!(exit.exit_code(), 0);
    assert_eq!(vm.core.last_trap, Some((cause::FETCH_FAULT, x + 16)));

    // The unit at X was reused, the unit at Y had to be built.
    assert_eq!(vm.jit.jit_hit, 1);
    assert_eq!(vm.jit.jit_miss, 2);
    assert!(vm.jit.lookup(0, y).is_some());
}

#[test]
fn fault_on_first_instruction_is_raised() {
    let mut core = ToyCore::new(RAM_BASE, 0x100);
    load(&mut core, RAM_BASE, &[nop()]);
    let mut vm = toy_vm(Config::default(), core);

    let err = vm.get_or_build(RAM_BASE + 0x100).unwrap_err();
    assert!(matches!(
        err,
        BuildError::Exception(Exception::AccessTrap { id: cause::FETCH_FAULT, .. })
    ));
    assert_eq!(vm.jit.size(0), 0);
}

#[test]
fn load_fault_enters_trap() {
    let handler = RAM_BASE + 0x40;
    let mut core = ToyCore::new(RAM_BASE, RAM_SIZE);
    load(&mut core, RAM_BASE, &[li(1, 3), li(2, 0x7ff0), ld(1, 2, 0), li(1, 4)]);
    load(&mut core, handler, &[li(6, 1), halt(6)]);
    core.trap_vector = handler;
    let mut vm = toy_vm(Config::default(), core);

    assert_eq!(vm.run(None).unwrap(), VmExit::Stopped(1));
    assert_eq!(vm.core.last_trap, Some((cause::LOAD_FAULT, 0x7ff0)));
    // Neither the faulting load nor anything after it completed.
    assert_eq!(vm.core.regs.gpr[1], 3);
}

#[test]
fn store_fault_enters_trap() {
    let handler = RAM_BASE + 0x40;
    let mut core = ToyCore::new(RAM_BASE, RAM_SIZE);
    load(&mut core, RAM_BASE, &[li(2, 0x7ff0), stb(2, 2, 1)]);
    load(&mut core, handler, &[li(6, 1), halt(6)]);
    core.trap_vector = handler;
    let mut vm = toy_vm(Config::default(), core);

    assert_eq!(vm.run(None).unwrap(), VmExit::Stopped(1));
    assert_eq!(vm.core.last_trap, Some((cause::STORE_FAULT, 0x7ff1)));
}

#[test]
fn halt_status_becomes_exit_code() {
    let (_, exit) = run_program(&[li(1, 3), halt(1)]);
    assert_eq!(exit, VmExit::Stopped(3));
    assert_eq!(exit.exit_code(), 3);

    let (_, exit) = run_program(&[li(1, 1), halt(1)]);
    assert_eq!(exit.exit_code(), 0);
}

#[test]
fn decode_error_is_fatal() {
    let (vm, exit) = run_program(&[nop(), 0xff00_0000]);
    assert_eq!(exit, VmExit::DecodeError(RAM_BASE + 4));
    assert_eq!(exit.exit_code(), -1);
    assert_eq!(vm.core.current_pc(), RAM_BASE + 4);
}

#[test]
fn arithmetic_and_memory() {
    let (vm, exit) = run_program(&[
        li(1, 5),
        li(2, 0x1080),
        st(1, 2, 0),
        ld(3, 2, 0),
        addi(3, 3, 2),
        add(3, 1),
        stb(3, 2, 4),
        ldb(4, 2, 4),
        li(7, 1),
        halt(7),
    ]);
    assert_eq!(exit, VmExit::Stopped(1));
    assert_eq!(vm.core.regs.gpr[3], 12);
    assert_eq!(vm.core.regs.gpr[4], 12);
    assert_eq!(&vm.core.ram[0x80..0x85], &[5, 0, 0, 0, 12]);
    assert_eq!(vm.core.instruction_count(), 10);
}

#[test]
fn byte_accesses_truncate() {
    let (vm, _) = run_program(&[li(1, -1), li(2, 0x1080), stb(1, 2, 0), ldb(3, 2, 0), halt(0)]);
    assert_eq!(vm.core.regs.gpr[1], 0xffff_ffff);
    assert_eq!(vm.core.regs.gpr[3], 0xff);
    assert_eq!(&vm.core.ram[0x80..0x82], &[0xff, 0]);
}

#[test]
fn conditional_branches() {
    let (vm, exit) = run_program(&[
        li(1, 3),       // 0x1000
        li(2, 0),       // 0x1004
        addi(2, 2, 1),  // 0x1008
        addi(1, 1, -1), // 0x100c
        bz(2),          // 0x1010
        jmp(-3),        // 0x1014
        beqz(0, 2),     // 0x1018
        li(2, 99),      // 0x101c
        li(5, 1),       // 0x1020
        halt(5),        // 0x1024
    ]);
    assert_eq!(exit, VmExit::Stopped(1));
    assert_eq!(vm.core.regs.gpr[1], 0);
    assert_eq!(vm.core.regs.gpr[2], 3);
    assert!(vm.core.get_flag(FLAG_Z));
}

#[test]
fn loads_update_zero_flag() {
    let (vm, _) = run_program(&[li(2, 0x1080), ld(1, 2, 0), halt(1)]);
    assert!(vm.core.zero);
}

#[test]
fn flush_discards_every_unit() {
    let mut core = ToyCore::new(RAM_BASE, RAM_SIZE);
    load(&mut core, RAM_BASE, &[nop(), flush(), li(1, 1), halt(1)]);
    load(&mut core, RAM_BASE + 0x40, &[nop(), jmp(-1)]);
    let mut vm = toy_vm(Config::default(), core);
    vm.get_or_build(RAM_BASE + 0x40).unwrap();

    assert_eq!(vm.run(None).unwrap(), VmExit::Stopped(1));
    assert!(vm.jit.lookup(0, RAM_BASE).is_none());
    assert!(vm.jit.lookup(0, RAM_BASE + 0x40).is_none());
    assert!(vm.jit.lookup(0, RAM_BASE + 8).is_some());

    // Everything is translated again on the next run.
    assert_eq!(vm.run_from(RAM_BASE, None).unwrap(), VmExit::Stopped(1));
    assert_eq!(vm.jit.jit_miss, 5);
}

#[test]
fn outcome_is_ignored_when_the_limit_ends_a_unit() {
    let mut vm = program_vm(Config::default(), &[nop(), flush(), li(1, 1), halt(1)]);

    assert_eq!(vm.step(1).unwrap(), VmExit::InstructionLimit);
    // `flush` did not run, so the unit survives.
    assert!(vm.jit.lookup(0, RAM_BASE).is_some());
    assert_eq!(vm.jit.lookup(0, RAM_BASE).unwrap().cont, Continuation::Flush);

    assert_eq!(vm.step(1).unwrap(), VmExit::InstructionLimit);
    assert_eq!(vm.jit.size(0), 0);
}

#[test]
fn discarded_code_is_freed() {
    let mut vm = program_vm(Config::default(), &[nop(), flush(), jmp(-2)]);

    assert_eq!(vm.run(Some(3000)).unwrap(), VmExit::InstructionLimit);
    assert_eq!(vm.core.instruction_count(), 3000);
    // Both units are translated again on every iteration of the loop.
    assert_eq!(vm.jit.compiled_units, 2000);
    assert!(vm.jit.dead <= 0x102, "dead = {}", vm.jit.dead);
}

/// Translates toy instructions, but its trap block returns a value of the wrong type.
struct MistypedTrapExit;

impl InstructionGenerator<ToyCore> for MistypedTrapExit {
    fn gen_instruction(
        &mut self,
        core: &mut ToyCore,
        tb: &mut UnitBuilder<'_>,
        pc: &mut VirtAddr,
        inst_id: u32,
    ) -> StepResult {
        ToyGenerator.gen_instruction(core, tb, pc, inst_id)
    }

    fn gen_trap_behavior(&mut self, tb: &mut UnitBuilder<'_>) {
        let value = tb.gen_const(32, 0);
        tb.builder.ins().return_(&[value]);
    }
}

#[test]
fn compile_errors_end_the_run() {
    let mut core = ToyCore::new(RAM_BASE, RAM_SIZE);
    load(&mut core, RAM_BASE, &[li(1, 1), halt(1)]);
    core.reset(Some(RAM_BASE));
    let config = Config { enable_verifier: true, ..Config::default() };
    let mut vm = Vm::new(Box::new(core), MistypedTrapExit, config).unwrap();

    let err = vm.run(None).unwrap_err();
    assert!(matches!(
        err,
        VmError::Compile { cluster: 0, source: BuildError::Compile { addr: RAM_BASE, .. } }
    ));
    assert_eq!(vm.core.instruction_count(), 0);
    assert_eq!(vm.last_run.as_ref().unwrap().instructions, 0);
}

#[test]
fn evict_discards_only_its_unit() {
    let mut vm = program_vm(Config::default(), &[nop(), evict(), li(1, 1), halt(1)]);

    assert_eq!(vm.run(None).unwrap(), VmExit::Stopped(1));
    assert!(vm.jit.lookup(0, RAM_BASE).is_none());
    assert!(vm.jit.lookup(0, RAM_BASE + 8).is_some());
    assert_eq!(vm.jit.size(0), 1);

    assert_eq!(vm.run_from(RAM_BASE, None).unwrap(), VmExit::Stopped(1));
    assert_eq!(vm.jit.jit_miss, 3);
    assert_eq!(vm.jit.jit_hit, 1);
}

#[test]
fn rejected_plugins_are_never_called() {
    let mut vm = program_vm(Config::default(), &[nop(), li(1, 1), halt(1)]);

    let (rejected, rejected_events) = recorder(None);
    assert_eq!(vm.register_plugin(rejected), None);
    let (accepted, accepted_events) = recorder(Some(SyncType::PRE));
    assert!(vm.register_plugin(accepted).is_some());
    assert_eq!(vm.plugins().len(), 1);

    vm.run(None).unwrap();
    assert!(rejected_events.borrow().is_empty());
    assert_eq!(accepted_events.borrow().len(), 3);
}

#[test]
fn plugins_observe_requested_phases() {
    let config = Config { core_id: 2, cluster_id: 1, ..Config::default() };
    let mut vm = program_vm(config, &[li(1, 1), halt(1)]);
    let (plugin, events) = recorder(Some(SyncType::ALL));
    vm.register_plugin(plugin).unwrap();

    assert_eq!(vm.run(None).unwrap(), VmExit::Stopped(1));

    let events = events.borrow();
    let observed: Vec<_> = events.iter().map(|event| (event.phase, event.inst_id)).collect();
    // `halt` exits through the trap path, so it is never reported as completed.
    assert_eq!(observed, vec![(SyncType::PRE, 0), (SyncType::POST, 0), (SyncType::PRE, 1)]);
    assert!(events.iter().all(|event| event.core_id == 2 && event.cluster_id == 1));
    assert_eq!(vm.jit.size(1), 1);
}

#[test]
fn registering_a_plugin_flushes_translated_units() {
    let mut vm = program_vm(Config::default(), &[nop(), li(1, 1), halt(1)]);
    vm.get_or_build(RAM_BASE).unwrap();
    assert_eq!(vm.jit.size(0), 1);

    let (plugin, events) = recorder(Some(SyncType::PRE));
    vm.register_plugin(plugin).unwrap();
    assert_eq!(vm.jit.size(0), 0);

    vm.run(None).unwrap();
    assert_eq!(events.borrow().len(), 3);
}

#[test]
fn architecture_is_notified_of_required_phases() {
    let mut core = ToyCore::new(RAM_BASE, RAM_SIZE);
    load(&mut core, RAM_BASE, &[nop(), nop(), li(1, 1), halt(1)]);
    core.sync_phases = SyncType::ALL;
    let mut vm = toy_vm(Config::default(), core);

    assert_eq!(vm.run(None).unwrap(), VmExit::Stopped(1));
    assert_eq!(vm.core.phase_counts[ExecPhase::InstructionStart as usize], 4);
    assert_eq!(vm.core.phase_counts[ExecPhase::InstructionEnd as usize], 3);
}

struct StopAt {
    addr: u64,
    visited: Rc<RefCell<Vec<u64>>>,
}

impl Debugger for StopAt {
    fn check_continue(&mut self, pc: u64) -> Result<(), Exception> {
        self.visited.borrow_mut().push(pc);
        if pc == self.addr {
            return Err(Exception::SimulationStopped(7));
        }
        Ok(())
    }
}

#[test]
fn debugger_can_stop_execution() {
    let mut vm = program_vm(Config::default(), &[nop(); 8]);
    let visited = Rc::new(RefCell::new(vec![]));
    vm.set_debugger(Box::new(StopAt { addr: RAM_BASE + 8, visited: visited.clone() }));

    assert_eq!(vm.run(None).unwrap(), VmExit::Stopped(7));
    assert_eq!(*visited.borrow(), vec![RAM_BASE, RAM_BASE + 4, RAM_BASE + 8]);
    // The instruction the debugger stopped at is counted but did not complete.
    assert_eq!(vm.core.instruction_count(), 3);
    // Debugging reports the start of every instruction to the architecture.
    assert_eq!(vm.core.phase_counts[ExecPhase::InstructionStart as usize], 2);
}

#[test]
fn reset_discards_units() {
    let (mut vm, _) = run_program(&[li(1, 1), halt(1)]);
    assert_eq!(vm.jit.size(0), 1);

    vm.reset_to(RAM_BASE);
    assert_eq!(vm.jit.size(0), 0);
    assert_eq!(vm.core.instruction_count(), 0);
    assert_eq!(vm.core.current_pc(), RAM_BASE);

    assert_eq!(vm.run(None).unwrap(), VmExit::Stopped(1));
    assert_eq!(vm.jit.jit_miss, 2);
}

#[test]
fn summary_reports_the_last_run() {
    let (vm, _) = run_program(&[nop(), nop(), li(1, 1), halt(1)]);
    let summary = vm.last_run.as_ref().unwrap();
    assert_eq!(summary.start_addr, RAM_BASE);
    assert_eq!(summary.instructions, 4);
    assert_eq!(summary.code_blocks, 1);
    assert!(summary.to_string().starts_with("Executed 4 instructions in 1 code blocks during"));
}

#[test]
fn mips_is_finite() {
    fn check(instructions: u64, micros: u32) -> bool {
        let summary = RunSummary {
            start_addr: 0,
            instructions,
            code_blocks: 0,
            elapsed: std::time::Duration::from_micros(micros as u64),
        };
        let mips = summary.mips();
        mips.is_finite() && mips >= 0.0
    }
    quickcheck::quickcheck(check as fn(u64, u32) -> bool);
}

#[test]
fn il_dump_contains_last_unit() {
    let config = Config { dump_il: true, ..Config::default() };
    let mut vm = program_vm(config, &[nop(), li(1, 1), halt(1)]);
    vm.run(None).unwrap();

    let il = vm.jit.il_dump.as_deref().unwrap();
    assert!(il.contains("; inst #2 @ 0x1008"));
}
