//! Program-level code generation.
//!
//! Lays out the text region (trap stubs, resume/init routines, import
//! trampolines, function bodies) and the read-only data region (numeric
//! masks, function-pointer table, branch tables), compiles every
//! function, and back-patches calls and table entries.  When an event
//! handler is supplied, the embedder may start executing the compiled
//! prefix while the remaining functions are still being compiled; all
//! later patches are word-aligned atomic stores.

use log::debug;

use crate::codegen::coder::Coder;
use crate::codegen::textbuf::atomic_put_u32;
use crate::codegen::WORD_SIZE;
use crate::error::CompileError;
use crate::isa::MacroAssembler;
use crate::module::{ImportImpl, ImportMap, Module};
use crate::traps::Trap;

/// Fixed text addresses known to the runtime.
pub const TEXT_ADDR_NO_FUNCTION: i32 = 0;
pub const TEXT_ADDR_RESUME: i32 = 16;
pub const TEXT_ADDR_INIT: i32 = 32;

/// Read-only data layout: numeric masks at fixed offsets, then the
/// function-pointer table, then branch tables.
pub const MASK_7F_ADDR_32: i32 = 0x00;
pub const MASK_7F_ADDR_64: i32 = 0x08;
pub const MASK_80_ADDR_32: i32 = 0x10;
pub const MASK_80_ADDR_64: i32 = 0x18;
pub const MASK_5F00_ADDR_32: i32 = 0x20;
pub const MASK_43E0_ADDR_64: i32 = 0x28;
pub const TABLE_ADDR: i32 = 0x30;

/// Compilation milestones reported to the embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The start function and its (embedder-declared) transitive callees
    /// are compiled and relocated; execution may begin.
    Init,
    /// All function bodies are emitted; table entries and call sites of
    /// late functions are about to be patched atomically.
    FunctionBarrier,
}

/// Compilation parameters.
#[derive(Debug, Clone)]
pub struct CompileConfig {
    /// Where the read-only data region is mapped, relative to the text
    /// base address.
    pub rodata_addr: i32,
    /// Number of functions (in the combined import+defined index space)
    /// to compile before the Init event fires.  Raised to cover the
    /// start function.  Ignored without an event handler.
    pub init_func_count: Option<usize>,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            rodata_addr: 0x1000_0000,
            init_func_count: None,
        }
    }
}

/// The compiler's output artifacts.
#[derive(Debug)]
pub struct Compiled {
    pub text: Vec<u8>,
    pub rodata: Vec<u8>,
    pub func_map: Vec<u8>,
    pub call_map: Vec<u8>,
}

/// Compile a module into native text, rodata and address maps.
pub fn compile<M: MacroAssembler>(
    module: &Module,
    imports: &ImportMap,
    config: &CompileConfig,
    mut events: Option<&mut dyn FnMut(Event)>,
) -> Result<Compiled, CompileError> {
    let mut c: Coder<M> = Coder::new(module, config.rodata_addr);

    gen_commons(&mut c)?;

    // trap stub for missing functions sits at text address zero, so a
    // zero displacement is always a safe placeholder
    if c.text.addr() != TEXT_ADDR_NO_FUNCTION {
        panic!("internal: unexpected initial text address");
    }
    c.trap_links[Trap::NoFunction.id() as usize].bind(c.text.addr());
    M::jump_to_trap_handler(&mut c, Trap::NoFunction);

    if c.text.addr() > TEXT_ADDR_RESUME {
        panic!("internal: NoFunction trap stub exceeds its slot");
    }
    c.text.align(M::FUNC_ALIGNMENT, M::PADDING_BYTE);
    debug_assert_eq!(c.text.addr(), TEXT_ADDR_RESUME);
    M::resume(&mut c);

    if c.text.addr() > TEXT_ADDR_INIT {
        panic!("internal: resume routine exceeds its slot");
    }
    c.text.align(M::FUNC_ALIGNMENT, M::PADDING_BYTE);
    debug_assert_eq!(c.text.addr(), TEXT_ADDR_INIT);
    M::init(&mut c);

    // virtual return point for resuming a program which was suspended
    // before execution started; this call site must be at index 0
    c.put_call_site(c.text.addr(), WORD_SIZE * 2);

    let mut init_func_count = match (&events, config.init_func_count) {
        (Some(_), Some(n)) => n,
        _ => module.num_funcs(),
    };

    if let Some(start) = module.start {
        if start >= init_func_count {
            init_func_count = start + 1;
        }
        let ret_addr = M::call_missing(&mut c);
        // stack depth excluding entry args (including link addr)
        c.put_call_site(ret_addr, WORD_SIZE * 2);
        c.func_links[start].label.add_site(ret_addr);
        // the start function returns here and falls through to exit
        M::jump_to_trap_handler(&mut c, Trap::Exit);
    }

    let entry_ret = M::init_call_entry(&mut c);
    c.put_call_site(entry_ret, WORD_SIZE);

    debug!("init routines end at 0x{:x}", c.text.addr());

    for &id in &Trap::ALL[1..] {
        c.text.align(M::FUNC_ALIGNMENT, M::PADDING_BYTE);
        c.trap_links[id.id() as usize].bind(c.text.addr());
        M::jump_to_trap_handler(&mut c, id);
    }

    for i in 0..module.imports.len() {
        let imp = &module.imports[i];
        let sig = &module.signatures[imp.sig];
        let implem = lookup_import(imports, &imp.namespace, &imp.name)?;
        check_import_signature(&imp.namespace, &imp.name, sig, implem)?;
        let variadic_argc = sig.params.len() - implem.params.len();

        c.text.align(M::FUNC_ALIGNMENT, M::PADDING_BYTE);
        let addr = c.text.addr();
        M::enter_import_func(
            &mut c,
            implem.address,
            implem.variadic,
            variadic_argc,
            sig.index.unwrap_or(u32::MAX),
        );
        c.func_links[i].label.bind(addr);
        c.func_map.put_func_addr(addr);
        debug!("import {}.{} trampoline at 0x{addr:x}", imp.namespace, imp.name);
    }

    if init_func_count > module.num_funcs() {
        init_func_count = module.num_funcs();
    }
    if init_func_count < module.imports.len() {
        init_func_count = module.imports.len();
    }

    for i in module.imports.len()..init_func_count {
        let addr = c.gen_function(i - module.imports.len())?;
        c.func_map.put_func_addr(addr);
        M::update_calls(c.text.bytes_mut(), &c.func_links[i].label);
        c.func_links[i].label.clear_sites();
    }

    seed_table(&mut c);

    if init_func_count < module.num_funcs() {
        if let Some(handler) = events.as_mut() {
            handler(Event::Init);
        }

        for i in init_func_count..module.num_funcs() {
            let addr = c.gen_function(i - module.imports.len())?;
            c.func_map.put_func_addr(addr);
        }

        if let Some(handler) = events.as_mut() {
            handler(Event::FunctionBarrier);
        }

        for i in init_func_count..module.num_funcs() {
            let addr = c.func_links[i].label.final_addr() as u32;

            let table_indexes = std::mem::take(&mut c.func_links[i].table_indexes);
            for table_index in table_indexes {
                let offset = TABLE_ADDR + table_index as i32 * 8;
                // overwrite only the address half of the packed entry
                atomic_put_u32(c.rodata.bytes_mut(), offset, addr);
            }

            M::update_calls(c.text.bytes_mut(), &c.func_links[i].label);
            c.func_links[i].label.clear_sites();
        }

        M::clear_insn_cache();
    }

    debug!(
        "program: {} bytes of text, {} bytes of rodata",
        c.text.len(),
        c.rodata.len(),
    );

    Ok(Compiled {
        text: c.text.into_bytes(),
        rodata: c.rodata.into_bytes(),
        func_map: c.func_map.into_bytes(),
        call_map: c.call_map.into_bytes(),
    })
}

/// Materialize the commons: masks at their fixed offsets, then the
/// function-pointer table sized for the module.
fn gen_commons<M: MacroAssembler>(c: &mut Coder<M>) -> Result<(), CompileError> {
    if c.rodata.alloc(TABLE_ADDR as usize, 8) != 0 {
        panic!("internal: commons could not be allocated at rodata offset zero");
    }
    c.rodata.put_u32_at(MASK_7F_ADDR_32, 0x7fff_ffff);
    c.rodata.put_u64_at(MASK_7F_ADDR_64, 0x7fff_ffff_ffff_ffff);
    c.rodata.put_u32_at(MASK_80_ADDR_32, 0x8000_0000);
    c.rodata.put_u64_at(MASK_80_ADDR_64, 0x8000_0000_0000_0000);
    c.rodata.put_u32_at(MASK_5F00_ADDR_32, 0x5f00_0000);
    c.rodata.put_u64_at(MASK_43E0_ADDR_64, 0x43e0_0000_0000_0000);

    let table_size = c.module.table.len() * 8;
    if c.rodata.alloc(table_size, 8) != TABLE_ADDR {
        panic!("internal: table could not be allocated at its designated rodata offset");
    }
    Ok(())
}

/// Write the packed (signature, address) table entries.  Functions not
/// yet compiled get a zero address (the NoFunction stub) and register
/// their slot for later atomic patching.
fn seed_table<M: MacroAssembler>(c: &mut Coder<M>) {
    for slot in 0..c.module.table.len() {
        let func_index = c.module.table[slot] as usize;

        let mut func_addr = 0u32; // NoFunction trap by default
        if func_index < c.func_links.len() {
            let link = &mut c.func_links[func_index];
            func_addr = link.label.addr_or_zero() as u32; // missing if not generated yet
            if func_addr == 0 {
                link.table_indexes.push(slot);
            }
        }

        let sig_index = c
            .module
            .func_sig(func_index)
            .and_then(|s| c.module.signatures[s].index)
            .unwrap_or(u32::MAX);

        let offset = TABLE_ADDR + slot as i32 * 8;
        c.rodata
            .put_u64_at(offset, (u64::from(sig_index) << 32) | u64::from(func_addr));
        debug!(
            "table element {slot}: function {func_index} at 0x{func_addr:x} with signature {sig_index}",
        );
    }
}

fn lookup_import<'a>(
    imports: &'a ImportMap,
    namespace: &str,
    name: &str,
) -> Result<&'a ImportImpl, CompileError> {
    imports
        .get(namespace)
        .and_then(|ns| ns.get(name))
        .ok_or_else(|| CompileError::MissingImport {
            namespace: namespace.to_owned(),
            name: name.to_owned(),
        })
}

fn check_import_signature(
    namespace: &str,
    name: &str,
    sig: &crate::module::Signature,
    implem: &ImportImpl,
) -> Result<(), CompileError> {
    let mismatch = || CompileError::ImportSignatureMismatch {
        namespace: namespace.to_owned(),
        name: name.to_owned(),
    };

    if implem.result != sig.result {
        return Err(mismatch());
    }
    if implem.variadic {
        if implem.params.len() > sig.params.len() {
            return Err(mismatch());
        }
    } else if implem.params.len() != sig.params.len() {
        return Err(mismatch());
    }
    if !sig.params.starts_with(&implem.params) {
        return Err(mismatch());
    }
    Ok(())
}
