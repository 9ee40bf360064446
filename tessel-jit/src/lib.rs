mod context;
mod debug;
pub mod runtime;
mod translate;


use std::{collections::HashMap, mem::ManuallyDrop};

use cranelift::{codegen::Context as CodeContext, prelude::*};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module, ModuleError, ModuleResult};

use tessel_cpu::{ArchIf, ClusterId, Config, Continuation, Exception, PhysAddr, VirtAddr};

pub use crate::{
    context::ExecContext,
    translate::{
        build_unit, BranchHint, Container, InstructionGenerator, StepResult, UnitBuilder,
        UnitInfo, UnitSettings,
    },
};

/// Entry point of a translation unit: `(vm_ptr, core_ptr, regs_ptr) -> next_pc`.
pub type JitFunction = unsafe extern "C" fn(*mut ExecContext, *mut u8, *mut u8) -> u64;

pub(crate) struct RuntimeFunctions {
    pub get_reg: FuncId,
    pub set_reg: FuncId,
    pub get_flag: FuncId,
    pub set_flag: FuncId,
    pub update_flags: FuncId,
    pub read_mem: FuncId,
    pub write_mem: FuncId,
    pub notify_phase: FuncId,
    pub pre_instr_sync: FuncId,
    pub call_plugin: FuncId,
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("host machine is not supported: {0}")]
    UnsupportedHost(&'static str),

    #[error("invalid codegen setting `{name}`: {message}")]
    Setting { name: &'static str, message: String },

    #[error("failed to create isa: {0}")]
    Isa(String),

    #[error("failed to declare runtime functions")]
    Module(#[from] ModuleError),
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// Raised while generating the first instruction of the unit (or a fatal condition raised at
    /// any point of generation).
    #[error(transparent)]
    Exception(#[from] Exception),

    #[error("failed to compile unit at {addr:#x}")]
    Compile {
        addr: u64,
        #[source]
        source: ModuleError,
    },
}

/// A unit that can be invoked directly.
#[derive(Clone, Copy, Debug)]
pub struct CompiledUnit {
    pub func: JitFunction,

    /// Physical address of the first instruction.
    pub phys: u64,

    /// The outcome recorded when the unit was built.
    pub cont: Continuation,

    pub instructions: u32,
}

/// Information kept about every compiled unit for debugging.
struct DeclaredUnit {
    id: FuncId,
    name: String,
    size: u32,
    cluster: ClusterId,
    phys: u64,
}

#[derive(Clone)]
struct CodegenSettings {
    enable_verifier: bool,
    opt_level: String,
}

type InitFn = fn(&CodegenSettings) -> Result<(JITModule, RuntimeFunctions), InitError>;

/// Compiles translation units and caches them per cluster.
///
/// Units reference runtime functions instantiated for the architecture passed to [Jit::new], so
/// they must only be invoked with a core of that type.
pub struct Jit {
    /// The function builder context, which is reused across multiple FunctionBuilder instances.
    builder_ctx: FunctionBuilderContext,

    /// Cranelift codegen context.
    code_ctx: CodeContext,

    /// The module, with the jit backend, which manages the JIT'd functions.
    module: ManuallyDrop<JITModule>,

    /// The runtime functions available to the JIT.
    functions: RuntimeFunctions,

    settings: CodegenSettings,
    init: InitFn,

    /// Units currently being translated.
    processing: Vec<(VirtAddr, PhysAddr)>,

    /// Live units, indexed by cluster then physical start address.
    clusters: HashMap<ClusterId, HashMap<u64, CompiledUnit>>,

    /// (debugging) Storage for writting the current IL to after compilation.
    /// If `None`, no IL will be written.
    pub il_dump: Option<String>,

    /// Number of lookups satisfied from the cache.
    pub jit_hit: u64,

    /// Number of lookups that required a new unit to be built.
    pub jit_miss: u64,

    /// Number of units compiled since the JIT was created.
    pub compiled_units: u64,

    /// Number of units discarded since the last reset, their code is still allocated.
    pub dead: usize,

    declared_functions: Vec<DeclaredUnit>,
}

impl Jit {
    pub fn new<A: ArchIf>(config: &Config) -> Result<Self, InitError> {
        let settings = CodegenSettings {
            enable_verifier: config.enable_verifier,
            opt_level: config.opt_level.clone(),
        };
        let init: InitFn = init_module::<A>;
        let (module, functions) = init(&settings)?;

        Ok(Self {
            builder_ctx: FunctionBuilderContext::new(),
            code_ctx: CodeContext::new(),
            module: ManuallyDrop::new(module),
            functions,
            settings,
            init,
            processing: vec![],
            clusters: HashMap::new(),
            il_dump: config.dump_il.then(String::new),
            jit_hit: 0,
            jit_miss: 0,
            compiled_units: 0,
            dead: 0,
            declared_functions: vec![],
        })
    }

    /// Returns a fresh compilation container with the runtime-call surface imported.
    pub fn create_container(&mut self) -> Container<'_> {
        self.module.clear_context(&mut self.code_ctx);

        let ptr_ty = self.module.target_config().pointer_type();
        let func = &mut self.code_ctx.func;
        func.signature.params.push(AbiParam::new(ptr_ty)); // vm_ptr
        func.signature.params.push(AbiParam::new(ptr_ty)); // core_ptr
        func.signature.params.push(AbiParam::new(ptr_ty)); // regs_ptr
        func.signature.returns.push(AbiParam::new(types::I64)); // next_pc

        let symbols = translate::Symbols::import(&mut self.module, func, &self.functions);
        Container {
            builder: FunctionBuilder::new(func, &mut self.builder_ctx),
            symbols,
            processing: &mut self.processing,
        }
    }

    /// Returns the unit starting at `phys` in `cluster`, calling `build` to fill a new container
    /// if there is none.
    pub fn get_or_build(
        &mut self,
        cluster: ClusterId,
        phys: PhysAddr,
        build: impl FnOnce(Container<'_>) -> Result<UnitInfo, Exception>,
    ) -> Result<CompiledUnit, BuildError> {
        if let Some(unit) = self.lookup(cluster, phys.val) {
            self.jit_hit += 1;
            return Ok(unit);
        }
        self.jit_miss += 1;

        let info = build(self.create_container())?;
        debug_assert!(self.processing.is_empty());

        let func = self
            .define_unit(cluster, phys.val, &info)
            .map_err(|source| BuildError::Compile { addr: phys.val, source })?;

        let unit = CompiledUnit {
            func: self.get_jit_func(func),
            phys: phys.val,
            cont: info.cont,
            instructions: info.instructions,
        };
        if self.clusters.entry(cluster).or_default().insert(phys.val, unit).is_some() {
            self.dead += 1;
        }
        Ok(unit)
    }

    pub fn lookup(&self, cluster: ClusterId, phys: u64) -> Option<CompiledUnit> {
        self.clusters.get(&cluster)?.get(&phys).copied()
    }

    /// Discards every unit of `cluster`.
    pub fn flush(&mut self, cluster: ClusterId) {
        if let Some(units) = self.clusters.get_mut(&cluster) {
            tracing::debug!("flushing {} units from cluster {cluster}", units.len());
            self.dead += units.len();
            units.clear();
        }
    }

    /// Discards the unit starting at `phys`.
    pub fn remove(&mut self, cluster: ClusterId, phys: u64) {
        let removed = self.clusters.get_mut(&cluster).and_then(|units| units.remove(&phys));
        if removed.is_some() {
            tracing::debug!("removed unit {cluster}:{phys:#x}");
            self.dead += 1;
        }
    }

    /// Number of live units in `cluster`.
    pub fn size(&self, cluster: ClusterId) -> usize {
        self.clusters.get(&cluster).map_or(0, |units| units.len())
    }

    /// Returns whether enough units have been discarded that their code should be freed.
    pub fn should_purge(&self) -> bool {
        let live: usize = self.clusters.values().map(|units| units.len()).sum();
        self.dead > 0x1000 || (self.dead > 0x100 && self.dead > live)
    }

    /// Fully clear and re-initialize that state of the JIT.
    ///
    /// # Safety
    ///
    /// This frees the code of every unit returned so far, none of them may be called again.
    pub unsafe fn reset(&mut self) -> Result<(), InitError> {
        tracing::debug!("resetting JIT ({} dead units)", self.dead);
        let (module, functions) = (self.init)(&self.settings)?;

        self.code_ctx.clear();
        self.clusters.clear();
        self.declared_functions.clear();
        self.dead = 0;

        let old = std::mem::replace(&mut *self.module, module);
        self.functions = functions;
        old.free_memory();
        Ok(())
    }

    fn get_jit_func(&self, func: FuncId) -> JitFunction {
        let fn_ptr = self.module.get_finalized_function(func);
        // Safety: the function was declared with the signature `JitFunction` describes.
        unsafe { std::mem::transmute::<*const u8, JitFunction>(fn_ptr) }
    }

    /// Compiles the contents of the current container.
    fn define_unit(
        &mut self,
        cluster: ClusterId,
        phys: u64,
        info: &UnitInfo,
    ) -> ModuleResult<FuncId> {
        let name = unit_symbol_name(cluster, phys, self.compiled_units);
        if let Some(out) = &mut self.il_dump {
            *out = debug::debug_il(&self.code_ctx, &name, &info.boundaries);
        }

        let signature = &self.code_ctx.func.signature;
        let func = self.module.declare_function(&name, Linkage::Local, signature)?;
        if let Err(e) = self.module.define_function(func, &mut self.code_ctx) {
            tracing::error!(
                "failed to compile {name}: {e:?}\n{}",
                debug::debug_il(&self.code_ctx, &name, &info.boundaries)
            );
            return Err(e);
        }
        let size = self.code_ctx.compiled_code().map_or(0, |code| code.code_info().total_size);
        self.module.finalize_definitions()?;

        tracing::debug!(
            "compiled {name}: {} instructions, {size} bytes, {:?}",
            info.instructions,
            info.cont
        );
        self.compiled_units += 1;
        self.declared_functions.push(DeclaredUnit { id: func, name, size, cluster, phys });
        Ok(func)
    }

    #[cfg(target_os = "linux")]
    pub fn dump_jit_mapping(&self, path: &std::path::Path) -> std::io::Result<()> {
        use std::io::Write;

        let jitdump_filename = format!("./jit-{}.dump", std::process::id());

        const EM_X86_64: u32 = 62;
        const EM_AARCH64: u32 = 183;

        let e_machine = match self.module.isa().triple().architecture {
            target_lexicon::Architecture::X86_64 => EM_X86_64,
            target_lexicon::Architecture::Aarch64(_) => EM_AARCH64,
            _ => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "Unsupported architecture for JIT mapping",
                ));
            }
        };

        let mut jitdump_file =
            wasmtime_jit_debug::perf_jitdump::JitDumpFile::new(jitdump_filename, e_machine)?;

        let mut writer = std::io::BufWriter::new(std::fs::File::create(path)?);
        for unit in &self.declared_functions {
            let host_addr = self.get_jit_func(unit.id);
            writeln!(writer, "{},{host_addr:#p},{},{:#x}", unit.name, unit.cluster, unit.phys)?;

            let timestamp = jitdump_file.get_time_stamp();
            let pid = std::process::id();
            // Safety: Cranelift produces valid start/len values for the generated code.
            let code =
                unsafe { std::slice::from_raw_parts(host_addr as *const u8, unit.size as usize) };
            jitdump_file.dump_code_load_record(&unit.name, code.as_ptr(), code.len(), timestamp, pid, 0)?;
        }

        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub fn dump_jit_mapping(&self, path: &std::path::Path) -> std::io::Result<()> {
        use std::io::Write;

        let mut writer = std::io::BufWriter::new(std::fs::File::create(path)?);
        for unit in &self.declared_functions {
            let host_addr = self.get_jit_func(unit.id);
            writeln!(writer, "{},{host_addr:#p},{},{:#x}", unit.name, unit.cluster, unit.phys)?;
        }

        Ok(())
    }
}

impl Drop for Jit {
    fn drop(&mut self) {
        // Safety: units are only reachable through the JIT, which is being destroyed.
        unsafe { ManuallyDrop::take(&mut self.module).free_memory() }
    }
}

/// Symbol name for a unit. `seq` keeps names unique when an address is translated again after
/// its previous unit was discarded.
fn unit_symbol_name(cluster: ClusterId, phys: u64, seq: u64) -> String {
    format!("unit_c{cluster}_{phys:016x}_{seq}")
}

fn init_module<A: ArchIf>(
    codegen: &CodegenSettings,
) -> Result<(JITModule, RuntimeFunctions), InitError> {
    let mut flag_builder = cranelift_codegen::settings::builder();
    let mut set = |name: &'static str, value: &str| {
        flag_builder
            .set(name, value)
            .map_err(|e| InitError::Setting { name, message: e.to_string() })
    };

    // We will never relocate the JITed code, so we don't use position-independent-code to avoid
    // needing a GOT.
    set("is_pic", "false")?;

    // Always enable frame pointers to make debugging easier.
    set("preserve_frame_pointers", "true")?;

    set("enable_verifier", if codegen.enable_verifier { "true" } else { "false" })?;
    set("opt_level", &codegen.opt_level)?;

    let flags = settings::Flags::new(flag_builder);
    tracing::trace!("cranelift flags: {}", flags.to_string());

    let isa_builder = cranelift_native::builder().map_err(InitError::UnsupportedHost)?;
    let isa = isa_builder.finish(flags).map_err(|e| InitError::Isa(e.to_string()))?;
    let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());

    macro_rules! define_fn_symbol {
        ($name:expr, $func:path) => {{
            builder.symbol($name, $func as *const u8);
        }};
    }

    define_fn_symbol!("tessel_get_reg", runtime::get_reg::<A>);
    define_fn_symbol!("tessel_set_reg", runtime::set_reg::<A>);
    define_fn_symbol!("tessel_get_flag", runtime::get_flag::<A>);
    define_fn_symbol!("tessel_set_flag", runtime::set_flag::<A>);
    define_fn_symbol!("tessel_update_flags", runtime::update_flags::<A>);
    define_fn_symbol!("tessel_read_mem", runtime::read_mem::<A>);
    define_fn_symbol!("tessel_write_mem", runtime::write_mem::<A>);
    define_fn_symbol!("tessel_notify_phase", runtime::notify_phase::<A>);
    define_fn_symbol!("tessel_pre_instr_sync", runtime::pre_instr_sync);
    define_fn_symbol!("tessel_call_plugin", runtime::call_plugin);

    let mut module = JITModule::new(builder);
    tracing::debug!(
        "JIT module created with isa={:?}, calling conv={:?}",
        module.isa(),
        module.isa().default_call_conv()
    );

    let functions = declare_runtime_functions(&mut module)?;
    Ok((module, functions))
}

fn declare_runtime_functions(module: &mut JITModule) -> ModuleResult<RuntimeFunctions> {
    use types::{I32, I64};

    let call_conv = module.isa().default_call_conv();
    let ptr = module.target_config().pointer_type();

    macro_rules! import_fn {
        ($name:expr, ($($arg_ty:expr),*) -> ($($ret_ty:expr),*)) => {{
            let mut sig = Signature::new(call_conv);
            for arg in &[$($arg_ty),*] {
                sig.params.push(AbiParam::new(*arg));
            }
            for ret in &[$($ret_ty),*] {
                sig.returns.push(AbiParam::new(*ret));
            }
            module.declare_function($name, Linkage::Import, &sig)?
        }};
    }

    Ok(RuntimeFunctions {
        get_reg: import_fn!("tessel_get_reg", (ptr, I32) -> (I64)),
        set_reg: import_fn!("tessel_set_reg", (ptr, I32, I64) -> ()),
        get_flag: import_fn!("tessel_get_flag", (ptr, I32) -> (I32)),
        set_flag: import_fn!("tessel_set_flag", (ptr, I32, I32) -> ()),
        update_flags: import_fn!("tessel_update_flags", (ptr, I32, I64, I64) -> ()),
        read_mem: import_fn!("tessel_read_mem", (ptr, ptr, I32, I64, I32) -> (I32)),
        write_mem: import_fn!("tessel_write_mem", (ptr, ptr, I32, I64, I32, I64) -> (I32)),
        notify_phase: import_fn!("tessel_notify_phase", (ptr, I32) -> ()),
        pre_instr_sync: import_fn!("tessel_pre_instr_sync", (ptr, I64) -> (I32)),
        call_plugin: import_fn!("tessel_call_plugin", (ptr, I32, I32, I32, I32, I32) -> ()),
    })
}
