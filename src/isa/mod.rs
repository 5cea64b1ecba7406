//! Architecture abstraction.
//!
//! One macro-assembler backend per target, behind a common trait.  The
//! per-function coder is generic over the backend, so dispatch is fixed
//! at build time and the whole capability set inlines.
//!
//! Contract shared by all backends:
//!
//! - Methods MUST NOT update the CPU condition flags, use the result
//!   register or allocate registers unless documented otherwise.  The
//!   coder materializes a flags operand before calling anything that may
//!   clobber the flags.
//! - Methods that produce a value may return either a freshly allocated
//!   register or the reserved result register; consumers must cope with
//!   operands already sitting in the result register.
//! - Any 32-bit integer operation writing a 64-bit register must
//!   zero-extend; returned operands carry the zero-extension flag so
//!   redundant re-extensions can be skipped.
//! - Call-displacement and table-entry rewrites are word-aligned 4-byte
//!   atomic stores: the runtime may execute the surrounding code while
//!   later functions are still being compiled and relocated.

pub mod aarch64;
pub mod x86_64;

pub use aarch64::AArch64;
pub use x86_64::X86_64;

use crate::codegen::coder::Coder;
use crate::codegen::link::Label;
use crate::codegen::operand::Operand;
use crate::codegen::regalloc::Reg;
use crate::module::{BinaryOp, ConvertOp, LoadWidth, StoreWidth, UnaryOp};
use crate::traps::Trap;
use crate::types::ValueType;

/// Stack space reserved below the limit for the runtime's own use.
pub const STACK_RESERVE: i32 = 0x8000;

/// Backend selected for the build target.
#[cfg(target_arch = "aarch64")]
pub type NativeAssembler = AArch64;
#[cfg(not(target_arch = "aarch64"))]
pub type NativeAssembler = X86_64;

/// The per-architecture instruction emitter.
///
/// Methods take the coder as context: the text buffer, register pools,
/// trap links and object maps all live there.
pub trait MacroAssembler: Sized {
    /// Function entry alignment.
    const FUNC_ALIGNMENT: u32;
    /// Byte used to pad between functions; must fault if executed.
    const PADDING_BYTE: u8;
    /// Reserved result register (same number in both categories).
    const RESULT_REG: Reg;
    /// Reserved integer scratch register.
    const SCRATCH_REG: Reg;
    /// Reserved float scratch register.
    const FLOAT_SCRATCH_REG: Reg;
    /// Bitmap of allocatable integer registers.
    const AVAIL_INT_REGS: u32;
    /// Bitmap of allocatable float registers.
    const AVAIL_FLOAT_REGS: u32;

    // ---- program layout ----

    /// Emit a trap stub: load the trap id into the result register and
    /// jump to the runtime trap handler.  MUST NOT exceed 16 bytes.  The
    /// Exit stub packs the exit value into the upper result half instead.
    fn jump_to_trap_handler(c: &mut Coder<Self>, id: Trap);

    /// Resume routine.  MUST NOT exceed 16 bytes.
    fn resume(c: &mut Coder<Self>);

    /// Init routine: establish the stack limit and fall through to the
    /// start-function call.  MUST NOT exceed 16 bytes.
    fn init(c: &mut Coder<Self>);

    /// Entry stub used by the runtime to call an arbitrary function: an
    /// aligned patchable call followed by the exit sequence.  Returns the
    /// call's return address.
    fn init_call_entry(c: &mut Coder<Self>) -> i32;

    /// Import trampoline: set up variadic metadata if applicable, move
    /// the absolute target into the result register and jump.
    fn enter_import_func(c: &mut Coder<Self>, addr: u64, variadic: bool, argc: usize, sig: u32);

    // ---- moves and machine stack ----

    /// Move `x` into `target`, consuming it.  MUST NOT update the flags
    /// when `preserve_flags` is set, unless `x` itself is the flags.
    /// Returns whether an integer target was zero-extended.
    fn move_to_reg(
        c: &mut Coder<Self>,
        t: ValueType,
        target: Reg,
        x: Operand,
        preserve_flags: bool,
    ) -> bool;

    /// Register-to-register move; zero-extends integer targets.
    fn move_reg(c: &mut Coder<Self>, t: ValueType, target: Reg, source: Reg);

    /// Load from the machine stack; zero-extends integer targets.
    fn load_stack(c: &mut Coder<Self>, t: ValueType, target: Reg, offset: i32);

    /// Store an operand to the machine stack, consuming it.
    fn store_stack(c: &mut Coder<Self>, t: ValueType, offset: i32, x: Operand);

    /// Store a register to the machine stack.
    fn store_stack_reg(c: &mut Coder<Self>, t: ValueType, offset: i32, r: Reg);

    /// Push an operand, consuming it.  MUST NOT update the flags unless
    /// the operand is the flags.
    fn push(c: &mut Coder<Self>, t: ValueType, x: Operand);

    /// Push a register.
    fn push_reg(c: &mut Coder<Self>, t: ValueType, r: Reg);

    /// Push an immediate.
    fn push_imm(c: &mut Coder<Self>, value: i64);

    /// Push `n` zero words.  May use the result register and the flags.
    fn push_zeros(c: &mut Coder<Self>, n: usize);

    /// Pop into a register.
    fn pop_reg(c: &mut Coder<Self>, t: ValueType, r: Reg);

    /// Adjust the stack pointer by an immediate.  May update the flags.
    fn add_imm_to_stack_ptr(c: &mut Coder<Self>, offset: i32);

    /// Add a register to the stack pointer.  May update the flags.  The
    /// caller still owns the register.
    fn add_to_stack_ptr(c: &mut Coder<Self>, r: Reg);

    /// Logical right shift by 32; used to extract packed upper halves.
    /// May update the flags.
    fn shift_right_logical32(c: &mut Coder<Self>, r: Reg);

    // ---- computation ----

    /// May allocate registers, use the result register and the flags.
    fn unary(c: &mut Coder<Self>, op: UnaryOp, t: ValueType, x: Operand) -> Operand;

    /// May allocate registers, use the result register and the flags.
    fn binary(c: &mut Coder<Self>, op: BinaryOp, t: ValueType, a: Operand, b: Operand) -> Operand;

    /// May allocate registers, use the result register and the flags.
    fn convert(
        c: &mut Coder<Self>,
        op: ConvertOp,
        to: ValueType,
        from: ValueType,
        x: Operand,
    ) -> Operand;

    /// Bounds-checked linear-memory load.  May allocate registers, use
    /// the result register and the flags.
    fn load(
        c: &mut Coder<Self>,
        width: LoadWidth,
        t: ValueType,
        index: Operand,
        offset: u32,
    ) -> Operand;

    /// Bounds-checked linear-memory store.  Same liberties as `load`.
    fn store(
        c: &mut Coder<Self>,
        width: StoreWidth,
        t: ValueType,
        index: Operand,
        value: Operand,
        offset: u32,
    );

    /// Conditional select.  The cond operand may be the flags.
    fn select(
        c: &mut Coder<Self>,
        t: ValueType,
        a: Operand,
        b: Operand,
        cond: Operand,
    ) -> Operand;

    /// Current linear-memory size in pages.
    fn query_memory_size(c: &mut Coder<Self>) -> Operand;

    /// Grow linear memory; traps on exceeding the grow limit.
    fn grow_memory(c: &mut Coder<Self>, x: Operand) -> Operand;

    // ---- control flow ----

    /// Unconditional branch; returns the patch site (0 addr = unknown).
    fn branch(c: &mut Coder<Self>, addr: i32) -> i32;

    /// Conditional branch on an operand (may be the flags).  `near`
    /// requests 8-bit displacements; only valid when the target is
    /// provably within range.  Returns the patch sites.
    fn branch_if(c: &mut Coder<Self>, x: Operand, yes: bool, near: bool, addr: i32) -> Vec<i32>;

    /// Branch when `index_reg` (treated as signed) is not in [0, upper).
    /// Zero-extends the index register.  Returns the patch site.
    fn branch_if_out_of_bounds(c: &mut Coder<Self>, index_reg: Reg, upper: i32, addr: i32) -> i32;

    /// Jump through a 32-bit text offset in `r` (zero-extended if the
    /// flag says so).  Trashes the register; the caller frees it.
    fn branch_indirect32(c: &mut Coder<Self>, r: Reg, zero_ext: bool);

    /// Load a branch-table entry: `r = rodata[rodata_offset + r << scale]`
    /// of the given type.  Must not allocate registers.  Returns the
    /// zero-extension state of `r`.
    fn load_branch_table_entry(
        c: &mut Coder<Self>,
        t: ValueType,
        r: Reg,
        zero_ext: bool,
        scale: u8,
        rodata_offset: i32,
    ) -> bool;

    /// Direct call; 0 addr emits a word-aligned placeholder that reaches
    /// the NoFunction stub until patched.  Returns the return address.
    fn call(c: &mut Coder<Self>, addr: i32) -> i32;

    /// Placeholder call for a not-yet-compiled function.
    fn call_missing(c: &mut Coder<Self>) -> i32;

    /// Indirect-call dispatch: bounds check, packed table-entry load,
    /// signature check, call through the low half plus text base.  Takes
    /// the function index in `func_index_reg` (may be the result
    /// register).  Returns the return address.
    fn call_indirect(c: &mut Coder<Self>, sig_index: u32, func_index_reg: Reg) -> i32;

    /// Prologue stack check with a placeholder displacement; returns the
    /// site to patch with the final maximum stack usage.
    fn setup_stack_frame(c: &mut Coder<Self>) -> i32;

    /// Drop `num_stack_values` words and return.
    fn ret(c: &mut Coder<Self>, num_stack_values: i32);

    /// Call the trap stub and record the call site.
    fn trap(c: &mut Coder<Self>, id: Trap);

    /// Crash guard emitted at dead ends.
    fn abort(c: &mut Coder<Self>);

    // ---- relocation over finished text ----

    /// Patch all 32-bit branch displacements of a bound label.
    fn update_branches(text: &mut [u8], l: &Label);

    /// Patch call displacements of a bound label, possibly while the
    /// calls are being executed (atomic 4-byte stores).
    fn update_calls(text: &mut [u8], l: &Label);

    /// Patch the prologue stack-check displacement.
    fn update_stack_check(text: &mut [u8], site: i32, max_stack: i32);

    /// Fill a never-executed range with faulting padding.
    fn delete_code(text: &mut [u8], start: i32, end: i32);

    /// Fill an executed-over range with no-ops.
    fn disable_code(text: &mut [u8], start: i32, end: i32);

    /// Synchronize the instruction cache after concurrent patching, on
    /// targets that need it.
    fn clear_insn_cache() {}
}

/// Return either the register already holding `x`, or the result
/// register loaded with it.  The caller owns the returned register
/// exclusively (a var's cache register is never returned).
pub(crate) fn alloc_result_reg<M: MacroAssembler>(
    c: &mut Coder<M>,
    t: ValueType,
    x: Operand,
    preserve_flags: bool,
) -> (Reg, bool) {
    if let Some((reg, zero_ext)) = x.check_temp_reg() {
        (reg, zero_ext)
    } else {
        let reg = c.try_alloc_reg(t).unwrap_or(M::RESULT_REG);
        let zero_ext = M::move_to_reg(c, t, reg, x, preserve_flags);
        (reg, zero_ext)
    }
}

/// Return either the register of `x`, or the scratch register loaded
/// with it.  The boolean says whether the caller must free the register;
/// temporaries in reserved registers are nobody's to free.
pub(crate) fn borrow_scratch_reg<M: MacroAssembler>(
    c: &mut Coder<M>,
    t: ValueType,
    x: Operand,
    preserve_flags: bool,
) -> (Reg, bool, bool) {
    if let Some(reg) = x.check_any_reg() {
        let own = x.check_temp_reg().is_some() && c.is_reg_allocated(t, reg);
        (reg, x.reg_zero_ext(), own)
    } else {
        let reg = match t.category() {
            crate::types::Category::Int => M::SCRATCH_REG,
            crate::types::Category::Float => M::FLOAT_SCRATCH_REG,
        };
        let zero_ext = M::move_to_reg(c, t, reg, x, preserve_flags);
        (reg, zero_ext, false)
    }
}
