use std::collections::HashSet;

use cranelift::{
    codegen::{write::FuncWriter, Context as CodeContext},
    prelude::*,
};

/// Renders the IL of the function in `code_ctx`, marking where each guest instruction starts.
pub(crate) fn debug_il(code_ctx: &CodeContext, name: &str, boundaries: &[u64]) -> String {
    let mut out = format!("; {name}\n");
    let mut decorator = UnitDecorator { seen: HashSet::new(), boundaries };
    if codegen::write::decorate_function(&mut decorator, &mut out, &code_ctx.func).is_err() {
        out.push_str("; <failed to render function>\n");
    }
    out
}

struct UnitDecorator<'a> {
    seen: HashSet<u32>,
    boundaries: &'a [u64],
}

impl<'a> FuncWriter for UnitDecorator<'a> {
    fn write_block_header(
        &mut self,
        w: &mut dyn std::fmt::Write,
        func: &codegen::ir::Function,
        block: Block,
        indent: usize,
    ) -> std::fmt::Result {
        codegen::write::write_block_header(w, func, block, indent)
    }

    fn write_instruction(
        &mut self,
        w: &mut dyn std::fmt::Write,
        func: &codegen::ir::Function,
        aliases: &codegen::entity::SecondaryMap<Value, Vec<Value>>,
        inst: codegen::ir::Inst,
        indent: usize,
    ) -> std::fmt::Result {
        let srcloc = func.srcloc(inst);
        if !srcloc.is_default() && self.seen.insert(srcloc.bits()) {
            match self.boundaries.get(srcloc.bits() as usize) {
                Some(addr) => writeln!(w, "    ; inst #{} @ {addr:#x}", srcloc.bits())?,
                // An instruction that failed to translate.
                None => writeln!(w, "    ; inst #{} (discarded)", srcloc.bits())?,
            }
        }
        codegen::write::PlainWriter.write_instruction(w, func, aliases, inst, indent)
    }
}
