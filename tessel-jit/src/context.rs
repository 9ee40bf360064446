use tessel_cpu::{Debugger, Exception, PluginTable};

/// State shared between the driver and generated code, passed to every unit as `vm_ptr`.
///
/// Generated code accesses `mem_value` and `icount_limit` directly, everything else is only
/// touched by the runtime calls.
#[repr(C)]
#[derive(Default)]
pub struct ExecContext {
    /// Result of the most recent successful `read_mem` call.
    pub mem_value: u64,

    /// Units leave at the next instruction boundary once the instruction counter reaches this.
    pub icount_limit: u64,

    /// The exception that made the current unit exit through its trap block.
    pub exception: Option<Exception>,

    pub plugins: PluginTable,

    pub debugger: Option<Box<dyn Debugger>>,
}

impl ExecContext {
    pub fn new() -> Self {
        Self { icount_limit: u64::MAX, ..Self::default() }
    }

    pub(crate) fn raise(&mut self, exception: Exception) {
        if let Some(prev) = self.exception.replace(exception) {
            tracing::warn!("{exception} raised with {prev} still pending");
        }
    }
}
