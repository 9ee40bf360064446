pub mod toy;

#[cfg(test)]
mod tests;

pub use tessel_cpu as cpu;
pub use tessel_cpu::VmExit;
pub use tessel_jit as jit;

use std::time::{Duration, Instant};

use tessel_cpu::{
    ArchIf, ClusterId, Config, Continuation, Debugger, Exception, PluginId, PluginTable,
    RegLayout, SyncType, VirtAddr, VmPlugin,
};
use tessel_jit::{
    build_unit, BuildError, CompiledUnit, ExecContext, InitError, InstructionGenerator, Jit,
    UnitSettings,
};

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("unsupported register layout: {0:?}")]
    InvalidLayout(RegLayout),

    #[error("failed to initialize the JIT")]
    Init(#[from] InitError),

    #[error("failed to translate code for cluster {cluster}")]
    Compile {
        cluster: ClusterId,
        #[source]
        source: BuildError,
    },
}

/// Statistics about a call to [Vm::run].
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub start_addr: u64,

    /// Number of instructions executed during the run.
    pub instructions: u64,

    /// Number of live units in the cluster when the run ended.
    pub code_blocks: usize,

    pub elapsed: Duration,
}

impl RunSummary {
    /// Millions of instructions executed per second.
    pub fn mips(&self) -> f64 {
        let micros = self.elapsed.as_secs_f64() * 1_000_000.0;
        if micros > 0.0 { self.instructions as f64 / micros } else { 0.0 }
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Executed {} instructions in {} code blocks during {}ms resulting in {:.2} MIPS",
            self.instructions,
            self.code_blocks,
            self.elapsed.as_millis(),
            self.mips()
        )
    }
}

/// Exceptions that end a unit, and failures to produce one.
enum UnitExit {
    Exception(Exception),
    Fatal(VmError),
}

impl From<Exception> for UnitExit {
    fn from(e: Exception) -> Self {
        Self::Exception(e)
    }
}

/// Runs the code of an architecture by translating it one unit at a time.
pub struct Vm<A, G> {
    pub core: Box<A>,
    pub generator: G,
    pub jit: Jit,
    pub config: Config,

    /// Summary of the most recent run.
    pub last_run: Option<RunSummary>,

    ctx: Box<ExecContext>,
    settings: UnitSettings,
}

impl<A: ArchIf, G: InstructionGenerator<A>> Vm<A, G> {
    pub fn new(core: Box<A>, generator: G, config: Config) -> Result<Self, VmError> {
        let layout = core.reg_layout();
        if !layout.is_valid() {
            return Err(VmError::InvalidLayout(layout));
        }

        let jit = Jit::new::<A>(&config)?;
        let settings = UnitSettings {
            max_instructions: config.max_unit_instructions,
            core_id: config.core_id,
            cluster_id: config.cluster_id,
            sync_exec: SyncType::NONE,
            debugging: config.debugging,
            precise_limit: config.precise_instruction_limit,
            plugins: vec![],
            layout,
        };

        let mut vm = Self {
            core,
            generator,
            jit,
            config,
            last_run: None,
            ctx: Box::new(ExecContext::new()),
            settings,
        };
        vm.update_sync_exec();
        Ok(vm)
    }

    pub fn cluster(&self) -> ClusterId {
        self.settings.cluster_id
    }

    pub fn plugins(&self) -> &PluginTable {
        &self.ctx.plugins
    }

    /// Registers `plugin` if it accepts the registration handshake.
    ///
    /// Units translated before the plugin was registered are discarded so that every unit
    /// executed afterwards reports to it.
    pub fn register_plugin(&mut self, plugin: Box<dyn VmPlugin>) -> Option<PluginId> {
        let id = self.ctx.plugins.register(plugin)?;
        self.settings.plugins = self.ctx.plugins.iter().collect();
        self.jit.flush(self.cluster());
        Some(id)
    }

    /// Installs `debugger` and enables debugging. Discards every unit translated so far.
    pub fn set_debugger(&mut self, debugger: Box<dyn Debugger>) {
        self.ctx.debugger = Some(debugger);
        self.config.debugging = true;
        self.settings.debugging = true;
        self.update_sync_exec();
        self.jit.flush(self.cluster());
    }

    fn update_sync_exec(&mut self) {
        let mut sync_exec = self.core.required_sync_phases();
        if self.settings.debugging {
            sync_exec |= SyncType::PRE;
        }
        self.settings.sync_exec = sync_exec;
    }

    pub fn reset(&mut self) {
        self.core.reset(None);
        self.jit.flush(self.cluster());
    }

    pub fn reset_to(&mut self, addr: u64) {
        self.core.reset(Some(addr));
        self.jit.flush(self.cluster());
    }

    /// Sets the address of the next instruction to execute.
    pub fn write_pc(&mut self, pc: u64) {
        let layout = self.settings.layout;
        self.core.set_reg(layout.pc.index, pc);
        self.core.set_reg(layout.next_pc.index, pc);
    }

    /// Executes `count` more instructions, unless the simulation stops earlier.
    ///
    /// Without a precise instruction limit, the unit that reaches the limit runs to its end.
    pub fn step(&mut self, count: u64) -> Result<VmExit, VmError> {
        let limit = self.core.instruction_count().saturating_add(count);
        self.run(Some(limit))
    }

    /// Starts executing at `addr`, see [Vm::run].
    pub fn run_from(&mut self, addr: u64, icount_limit: Option<u64>) -> Result<VmExit, VmError> {
        self.write_pc(addr);
        self.run(icount_limit)
    }

    /// Executes from the current program counter until the simulation stops, or the instruction
    /// counter of the architecture reaches `icount_limit`.
    pub fn run(&mut self, icount_limit: Option<u64>) -> Result<VmExit, VmError> {
        let limit = icount_limit.unwrap_or(u64::MAX);
        let start_addr = self.core.current_pc();
        let start_icount = self.core.instruction_count();
        let start = Instant::now();
        tracing::info!("Start at {start_addr:#x}");

        self.ctx.icount_limit = if self.settings.precise_limit { limit } else { u64::MAX };
        let mut pc = start_addr;
        let result = self.run_loop(&mut pc, limit);
        self.ctx.icount_limit = u64::MAX;

        match &result {
            Ok(VmExit::InstructionLimit | VmExit::DecodeError(_)) => self.write_pc(pc),
            Ok(VmExit::Stopped(_)) | Err(_) => {}
        }

        let summary = RunSummary {
            start_addr,
            instructions: self.core.instruction_count().saturating_sub(start_icount),
            code_blocks: self.jit.size(self.cluster()),
            elapsed: start.elapsed(),
        };
        tracing::info!("{summary}");
        self.last_run = Some(summary);

        result
    }

    fn run_loop(&mut self, pc: &mut u64, limit: u64) -> Result<VmExit, VmError> {
        loop {
            if self.core.instruction_count() >= limit {
                return Ok(VmExit::InstructionLimit);
            }

            if self.jit.should_purge() {
                // Safety: no unit is executing between iterations.
                unsafe { self.jit.reset()? };
            }

            match self.execute_unit(*pc) {
                Ok(next) => *pc = next,
                Err(UnitExit::Exception(Exception::AccessTrap { id, addr })) => {
                    *pc = self.core.enter_trap(id, addr);
                }
                Err(UnitExit::Exception(Exception::SimulationStopped(code))) => {
                    tracing::info!("execution stopped with status {code:#x}");
                    return Ok(VmExit::Stopped(code));
                }
                Err(UnitExit::Exception(Exception::Decode(addr))) => {
                    tracing::error!("execution aborted at address {addr:#x}");
                    *pc = addr;
                    return Ok(VmExit::DecodeError(addr));
                }
                Err(UnitExit::Fatal(e)) => return Err(e),
            }

            tracing::trace!("continuing @{:#x}", *pc);
        }
    }

    /// Runs the unit starting at `pc`, returning the address of the next instruction.
    fn execute_unit(&mut self, pc: u64) -> Result<u64, UnitExit> {
        let cluster = self.cluster();
        let unit = match self.get_or_build(pc) {
            Ok(unit) => unit,
            Err(BuildError::Exception(e)) => return Err(e.into()),
            Err(source) => return Err(UnitExit::Fatal(VmError::Compile { cluster, source })),
        };

        self.core.set_reg(self.settings.layout.next_pc.index, pc);
        self.ctx.exception = None;
        let icount = self.core.instruction_count();

        let regs = self.core.register_storage_base();
        let core: *mut A = self.core.as_mut();
        // Safety: the unit was compiled for `A` and only accesses `ctx`, `core` and `regs`, which
        // stay valid for the duration of the call.
        let next = unsafe { (unit.func)(self.ctx.as_mut(), core.cast(), regs) };

        if let Some(e) = self.ctx.exception.take() {
            return Err(e.into());
        }

        // A unit that left at the instruction limit never ran the instruction its outcome
        // belongs to.
        let executed = self.core.instruction_count().wrapping_sub(icount);
        if executed == unit.instructions as u64 {
            match unit.cont {
                Continuation::Flush => self.jit.flush(cluster),
                Continuation::Trap => self.jit.remove(cluster, unit.phys),
                Continuation::Continue | Continuation::Branch => {}
            }
        }

        Ok(next)
    }

    /// Returns the unit starting at `pc`, translating it if it is not in the cache.
    ///
    /// The code of the unit is freed when the JIT is purged at the start of the next iteration
    /// of [Vm::run], so it is not handed out of the crate.
    pub(crate) fn get_or_build(&mut self, pc: u64) -> Result<CompiledUnit, BuildError> {
        let start = VirtAddr::fetch(pc);
        let phys = self.core.translate(start)?;

        let Self { core, generator, jit, settings, .. } = self;
        jit.get_or_build(settings.cluster_id, phys, |container| {
            build_unit(container, core.as_mut(), generator, settings, start, phys)
        })
    }
}
