//! Functions called from generated code.
//!
//! Every function takes raw pointers owned by the driver for the duration of a unit call.
//! Failures are parked in [ExecContext::exception] and reported to generated code as a non-zero
//! status, generated code then leaves the unit through its trap block.

use tessel_cpu::{AccessType, ArchIf, ExecPhase, PhaseEvent, PluginId, SyncType, VirtAddr};

use crate::ExecContext;

const STATUS_OK: u32 = 0;
const STATUS_TRAP: u32 = 1;

pub unsafe extern "C" fn get_reg<A: ArchIf>(core: *mut A, idx: u32) -> u64 {
    (*core).get_reg(idx)
}

pub unsafe extern "C" fn set_reg<A: ArchIf>(core: *mut A, idx: u32, value: u64) {
    (*core).set_reg(idx, value)
}

pub unsafe extern "C" fn get_flag<A: ArchIf>(core: *mut A, flag: u32) -> u32 {
    (*core).get_flag(flag) as u32
}

pub unsafe extern "C" fn set_flag<A: ArchIf>(core: *mut A, flag: u32, value: u32) {
    (*core).set_flag(flag, value != 0)
}

pub unsafe extern "C" fn update_flags<A: ArchIf>(core: *mut A, op: u32, a: u64, b: u64) {
    (*core).update_flags(op, a, b)
}

pub unsafe extern "C" fn read_mem<A: ArchIf>(
    ctx: *mut ExecContext,
    core: *mut A,
    space: u32,
    addr: u64,
    len: u32,
) -> u32 {
    let addr = VirtAddr::new(AccessType::Read, space, addr);
    match (*core).read_mem(addr, len as usize) {
        Ok(value) => {
            (*ctx).mem_value = value;
            STATUS_OK
        }
        Err(e) => {
            (*ctx).raise(e);
            STATUS_TRAP
        }
    }
}

pub unsafe extern "C" fn write_mem<A: ArchIf>(
    ctx: *mut ExecContext,
    core: *mut A,
    space: u32,
    addr: u64,
    len: u32,
    value: u64,
) -> u32 {
    let addr = VirtAddr::new(AccessType::Write, space, addr);
    match (*core).write_mem(addr, len as usize, value) {
        Ok(()) => STATUS_OK,
        Err(e) => {
            (*ctx).raise(e);
            STATUS_TRAP
        }
    }
}

pub unsafe extern "C" fn notify_phase<A: ArchIf>(core: *mut A, phase: u32) {
    match ExecPhase::from_raw(phase) {
        Some(phase) => (*core).notify_phase(phase),
        None => tracing::error!("invalid execution phase: {phase}"),
    }
}

pub unsafe extern "C" fn pre_instr_sync(ctx: *mut ExecContext, pc: u64) -> u32 {
    let ctx = &mut *ctx;
    let Some(debugger) = ctx.debugger.as_mut()
    else {
        return STATUS_OK;
    };
    match debugger.check_continue(pc) {
        Ok(()) => STATUS_OK,
        Err(e) => {
            ctx.raise(e);
            STATUS_TRAP
        }
    }
}

pub unsafe extern "C" fn call_plugin(
    ctx: *mut ExecContext,
    plugin: u32,
    core_id: u32,
    cluster_id: u32,
    phase: u32,
    inst_id: u32,
) {
    let event =
        PhaseEvent { core_id, cluster_id, phase: SyncType::from_bits_truncate(phase), inst_id };
    if !(*ctx).plugins.call(PluginId(plugin), &event) {
        tracing::error!("call to unknown plugin: {plugin}");
    }
}
