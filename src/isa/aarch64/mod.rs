//! AArch64 macro assembler.
//!
//! Register conventions: x0/v0 result, x16/x17 scratches, v1 float
//! scratch, x24 text base, x25 stack limit, x26 memory base, x27 memory
//! limit.  x28 is the virtual stack pointer: the machine SP is left to
//! the embedder, and 8-byte pushes through x28 avoid SP-alignment
//! faults.  Calls emulate the primary target's ABI by pushing an
//! explicit return address, so the stack layout, the call-site map and
//! the resume protocol are identical across backends.  The runtime
//! keeps the trap-handler address at [x25 - 8] and the memory-grow
//! limit at [x25 - 16].

pub mod insn;

use crate::codegen::coder::Coder;
use crate::codegen::link::Label;
use crate::codegen::operand::{Condition, Operand};
use crate::codegen::program::{TABLE_ADDR, TEXT_ADDR_RESUME};
use crate::codegen::regalloc::Reg;
use crate::codegen::textbuf::atomic_put_u32;
use crate::isa::{alloc_result_reg, borrow_scratch_reg, MacroAssembler, STACK_RESERVE};
use crate::module::{BinaryOp, ConvertOp, LoadWidth, StoreWidth, UnaryOp};
use crate::traps::Trap;
use crate::types::{Category, ValueType};

use insn::{FloatOp, FloatUnary, Logic, MemOp, Shift, XZR};

const REG_RESULT: Reg = Reg(0); // x0 / v0
const REG_IMPORT_ARG_COUNT: Reg = Reg(1);
const REG_IMPORT_SIG: Reg = Reg(2);
const REG_SCRATCH: Reg = Reg(16); // ip0
const REG_SCRATCH2: Reg = Reg(17); // ip1
const REG_FLOAT_SCRATCH: Reg = Reg(1); // v1
const REG_TEXT_BASE: Reg = Reg(24);
const REG_STACK_LIMIT: Reg = Reg(25);
const REG_MEMORY_BASE: Reg = Reg(26);
const REG_MEMORY_LIMIT: Reg = Reg(27);
const REG_STACK_PTR: Reg = Reg(28); // virtual

/// Offsets of the runtime slots kept just below the stack limit.
const TRAP_HANDLER_SLOT: i32 = -8;
const GROW_LIMIT_SLOT: i32 = -16;

/// A64 condition code.
fn cond_a64(cond: Condition) -> u8 {
    use Condition::*;
    match cond {
        Eq | OrderedAndEq => 0,  // eq
        Ne | UnorderedOrNe => 1, // ne
        GeU => 2,                // hs
        LtU => 3,                // lo
        OrderedAndLt => 4,       // mi
        UnorderedOrGe => 5,      // pl
        GtU | UnorderedOrGt => 8, // hi
        LeU | OrderedAndLe => 9,  // ls
        GeS | OrderedAndGe => 10, // ge
        LtS | UnorderedOrLt => 11, // lt
        GtS | OrderedAndGt => 12,  // gt
        LeS | UnorderedOrLe => 13, // le
        OrderedAndNe | UnorderedOrEq => {
            panic!("internal: condition {cond:?} has no single A64 encoding")
        }
    }
}

/// dst = src + imm without touching the flags; may clobber dst before
/// the add, so dst must differ from src for large immediates.
fn add_imm_via(c: &mut Coder<AArch64>, dst: Reg, src: Reg, imm: i64) {
    if imm == 0 {
        if dst != src {
            insn::mov_rr(&mut c.text, ValueType::I64, dst, src);
        }
        return;
    }
    if (0..0x1000).contains(&imm) {
        insn::add_ri(&mut c.text, ValueType::I64, dst, src, imm as u32, false);
    } else if imm > 0 && imm < 0x100_0000 {
        insn::add_ri(&mut c.text, ValueType::I64, dst, src, (imm >> 12) as u32, true);
        if imm & 0xfff != 0 {
            insn::add_ri(&mut c.text, ValueType::I64, dst, dst, (imm & 0xfff) as u32, false);
        }
    } else {
        assert_ne!(dst, src, "internal: large immediate needs a distinct register");
        insn::mov_ri(&mut c.text, ValueType::I64, dst, imm);
        insn::add_rr(&mut c.text, ValueType::I64, dst, dst, src);
    }
}

/// Stack-pointer adjustment by a signed immediate.
fn add_sp_imm(c: &mut Coder<AArch64>, offset: i32) {
    if offset == 0 {
        return;
    }
    let magnitude = offset.unsigned_abs();
    if magnitude < 0x1000 {
        if offset > 0 {
            insn::add_ri(&mut c.text, ValueType::I64, REG_STACK_PTR, REG_STACK_PTR, magnitude, false);
        } else {
            insn::sub_ri(&mut c.text, ValueType::I64, REG_STACK_PTR, REG_STACK_PTR, magnitude, false);
        }
    } else {
        insn::mov_ri(&mut c.text, ValueType::I64, REG_SCRATCH, magnitude as i64);
        if offset > 0 {
            insn::add_rr(&mut c.text, ValueType::I64, REG_STACK_PTR, REG_STACK_PTR, REG_SCRATCH);
        } else {
            insn::sub_rr(&mut c.text, ValueType::I64, REG_STACK_PTR, REG_STACK_PTR, REG_SCRATCH);
        }
    }
}

/// Load or store through the virtual stack pointer, falling back to an
/// address computation for offsets beyond the scaled-immediate range.
fn stack_access(c: &mut Coder<AArch64>, t: ValueType, load: bool, r: Reg, offset: i32) {
    let float = t.category() == Category::Float;
    let size_log = if t.size() == 8 { 3 } else { 2 };
    let limit = 4096 << size_log;
    if offset >= 0 && offset < limit && offset & ((1 << size_log) - 1) == 0 {
        insn::mem_imm(&mut c.text, size_log, load, float, r, REG_STACK_PTR, offset as u32);
    } else {
        add_imm_via(c, REG_SCRATCH2, REG_STACK_PTR, offset as i64);
        insn::mem_imm(&mut c.text, size_log, load, float, r, REG_SCRATCH2, 0);
    }
}

/// Push a return address and branch; the shared call shape.  Returns
/// the return address (just past the branch instruction).
fn emit_call(c: &mut Coder<AArch64>, target: i32) -> i32 {
    insn::adr(&mut c.text, REG_SCRATCH2, 12);
    insn::push_word(&mut c.text, false, REG_SCRATCH2, REG_STACK_PTR);
    insn::b_abs(&mut c.text, target)
}

/// Same shape through a register target.
fn emit_call_reg(c: &mut Coder<AArch64>, target: Reg) -> i32 {
    insn::adr(&mut c.text, REG_SCRATCH2, 12);
    insn::push_word(&mut c.text, false, REG_SCRATCH2, REG_STACK_PTR);
    insn::br(&mut c.text, target);
    c.text.addr()
}

/// Skip target for a branch hopping over one trap call (three words).
fn over_trap_call(c: &Coder<AArch64>) -> i32 {
    c.text.addr() + 16
}

/// The AArch64 backend.
pub struct AArch64;

impl MacroAssembler for AArch64 {
    const FUNC_ALIGNMENT: u32 = 16;
    const PADDING_BYTE: u8 = 0x00; // udf #0
    const RESULT_REG: Reg = REG_RESULT;
    const SCRATCH_REG: Reg = REG_SCRATCH;
    const FLOAT_SCRATCH_REG: Reg = REG_FLOAT_SCRATCH;
    // x1..x15, x19..x23
    const AVAIL_INT_REGS: u32 = 0x00f8_fffe;
    // v2..v15
    const AVAIL_FLOAT_REGS: u32 = 0xfffc;

    fn jump_to_trap_handler(c: &mut Coder<Self>, id: Trap) {
        if id == Trap::Exit {
            insn::lsl_ri(&mut c.text, ValueType::I64, REG_RESULT, REG_RESULT, 32);
            insn::add_ri(&mut c.text, ValueType::I64, REG_RESULT, REG_RESULT, id.id() as u32, false);
        } else {
            insn::mov_ri(&mut c.text, ValueType::I32, REG_RESULT, id.id() as i64);
        }
        insn::ldur(&mut c.text, REG_SCRATCH2, REG_STACK_LIMIT, TRAP_HANDLER_SLOT);
        insn::br(&mut c.text, REG_SCRATCH2);
    }

    fn resume(c: &mut Coder<Self>) {
        insn::pop_word(&mut c.text, false, REG_SCRATCH2, REG_STACK_PTR);
        insn::br(&mut c.text, REG_SCRATCH2);
    }

    fn init(c: &mut Coder<Self>) {
        insn::add_ri(
            &mut c.text,
            ValueType::I64,
            REG_STACK_LIMIT,
            REG_STACK_LIMIT,
            (STACK_RESERVE >> 12) as u32,
            true,
        );
        // non-zero result register means a resumed snapshot: simulate a
        // return from the start-function call
        let skip_to = c.text.addr() + 8;
        insn::cbz(&mut c.text, ValueType::I64, false, REG_RESULT, skip_to);
        insn::b_abs(&mut c.text, TEXT_ADDR_RESUME);
    }

    fn init_call_entry(c: &mut Coder<Self>) -> i32 {
        let ret_addr = emit_call(c, 0);
        Self::jump_to_trap_handler(c, Trap::Exit);
        ret_addr
    }

    fn enter_import_func(c: &mut Coder<Self>, addr: u64, variadic: bool, argc: usize, sig: u32) {
        if variadic {
            insn::mov_ri(&mut c.text, ValueType::I64, REG_IMPORT_ARG_COUNT, argc as i64);
            insn::mov_ri(&mut c.text, ValueType::I64, REG_IMPORT_SIG, sig as i64);
        }
        insn::mov_ri(&mut c.text, ValueType::I64, REG_RESULT, addr as i64);
        insn::br(&mut c.text, REG_RESULT);
    }

    fn move_to_reg(
        c: &mut Coder<Self>,
        t: ValueType,
        target: Reg,
        x: Operand,
        _preserve_flags: bool,
    ) -> bool {
        // every move form below leaves the flags alone
        let mut zero_ext = false;

        match t.category() {
            Category::Int => match x {
                Operand::Imm(_) => {
                    insn::mov_ri(&mut c.text, t, target, x.imm_value(t));
                    zero_ext = true;
                }

                Operand::VarMem { offset, .. } => {
                    stack_access(c, t, true, target, offset);
                    zero_ext = true;
                }

                Operand::VarReg { reg, .. } => {
                    if reg != target {
                        insn::mov_rr(&mut c.text, t, target, reg);
                        zero_ext = true;
                    }
                }

                Operand::TempReg { reg, .. } => {
                    if reg != target {
                        insn::mov_rr(&mut c.text, t, target, reg);
                        zero_ext = true;
                    } else if target == REG_RESULT {
                        zero_ext = x.reg_zero_ext();
                    } else {
                        panic!("internal: moving temporary integer register to itself");
                    }
                }

                Operand::Stack => {
                    insn::pop_word(&mut c.text, false, target, REG_STACK_PTR);
                }

                Operand::Flags(cond) => {
                    insn::cset(&mut c.text, ValueType::I32, target, cond_a64(cond));
                    zero_ext = true;
                }

                other => panic!("internal: cannot move {other}"),
            },

            Category::Float => match x {
                Operand::Imm(_) => {
                    let value = x.imm_value(t);
                    if value == 0 {
                        insn::fmov_f_g(&mut c.text, t, target, Reg(XZR));
                    } else {
                        insn::mov_ri(&mut c.text, ValueType::I64, REG_SCRATCH, value);
                        insn::fmov_f_g(&mut c.text, t, target, REG_SCRATCH);
                    }
                }

                Operand::VarMem { offset, .. } => {
                    stack_access(c, t, true, target, offset);
                }

                Operand::VarReg { reg, .. } => {
                    if reg != target {
                        insn::fmov_rr(&mut c.text, t, target, reg);
                    }
                }

                Operand::TempReg { reg, .. } => {
                    if reg != target {
                        insn::fmov_rr(&mut c.text, t, target, reg);
                    } else if target != REG_RESULT {
                        panic!("internal: moving temporary float register to itself");
                    }
                }

                Operand::Stack => {
                    insn::pop_word(&mut c.text, true, target, REG_STACK_PTR);
                }

                other => panic!("internal: cannot move {other}"),
            },
        }

        c.consumed(t, x);
        zero_ext
    }

    fn move_reg(c: &mut Coder<Self>, t: ValueType, target: Reg, source: Reg) {
        match t.category() {
            Category::Int => insn::mov_rr(&mut c.text, t, target, source),
            Category::Float => insn::fmov_rr(&mut c.text, t, target, source),
        }
    }

    fn load_stack(c: &mut Coder<Self>, t: ValueType, target: Reg, offset: i32) {
        stack_access(c, t, true, target, offset);
    }

    fn store_stack(c: &mut Coder<Self>, t: ValueType, offset: i32, x: Operand) {
        let (reg, _, own) = borrow_scratch_reg(c, t, x, true);
        Self::store_stack_reg(c, t, offset, reg);
        if own {
            c.free_reg(t, reg);
        }
    }

    fn store_stack_reg(c: &mut Coder<Self>, t: ValueType, offset: i32, r: Reg) {
        stack_access(c, t, false, r, offset);
    }

    fn push(c: &mut Coder<Self>, t: ValueType, x: Operand) {
        if let Some(reg) = x.check_any_reg() {
            Self::push_reg(c, t, reg);
            c.consumed(t, x);
            return;
        }
        if x.check_imm_value(ValueType::I64) == Some(0) {
            insn::push_word(&mut c.text, false, Reg(XZR), REG_STACK_PTR);
            return;
        }
        let reg = match t.category() {
            Category::Int => REG_SCRATCH,
            Category::Float => REG_FLOAT_SCRATCH,
        };
        Self::move_to_reg(c, t, reg, x, true);
        Self::push_reg(c, t, reg);
    }

    fn push_reg(c: &mut Coder<Self>, t: ValueType, r: Reg) {
        let float = t.category() == Category::Float;
        insn::push_word(&mut c.text, float, r, REG_STACK_PTR);
    }

    fn push_imm(c: &mut Coder<Self>, value: i64) {
        if value == 0 {
            insn::push_word(&mut c.text, false, Reg(XZR), REG_STACK_PTR);
        } else {
            insn::mov_ri(&mut c.text, ValueType::I64, REG_SCRATCH, value);
            insn::push_word(&mut c.text, false, REG_SCRATCH, REG_STACK_PTR);
        }
    }

    fn push_zeros(c: &mut Coder<Self>, n: usize) {
        for _ in 0..n {
            insn::push_word(&mut c.text, false, Reg(XZR), REG_STACK_PTR);
        }
    }

    fn pop_reg(c: &mut Coder<Self>, t: ValueType, r: Reg) {
        let float = t.category() == Category::Float;
        insn::pop_word(&mut c.text, float, r, REG_STACK_PTR);
    }

    fn add_imm_to_stack_ptr(c: &mut Coder<Self>, offset: i32) {
        add_sp_imm(c, offset);
    }

    fn add_to_stack_ptr(c: &mut Coder<Self>, r: Reg) {
        insn::add_rr(&mut c.text, ValueType::I64, REG_STACK_PTR, REG_STACK_PTR, r);
    }

    fn shift_right_logical32(c: &mut Coder<Self>, r: Reg) {
        insn::lsr_ri(&mut c.text, ValueType::I64, r, r, 32);
    }

    fn unary(c: &mut Coder<Self>, op: UnaryOp, t: ValueType, x: Operand) -> Operand {
        match op {
            UnaryOp::Eqz => {
                if let Operand::Flags(cond) = x {
                    return Operand::Flags(cond.invert());
                }
                let (reg, _, own) = borrow_scratch_reg(c, t, x, false);
                insn::cmp_ri(&mut c.text, t, reg, 0);
                if own {
                    c.free_reg(t, reg);
                }
                Operand::Flags(Condition::Eq)
            }

            UnaryOp::Clz => {
                let (r, _) = alloc_result_reg(c, t, x, false);
                insn::clz(&mut c.text, t, r, r);
                Operand::temp_reg(r, t == ValueType::I32)
            }

            UnaryOp::Ctz => {
                let (r, _) = alloc_result_reg(c, t, x, false);
                insn::rbit(&mut c.text, t, REG_SCRATCH, r);
                insn::clz(&mut c.text, t, r, REG_SCRATCH);
                Operand::temp_reg(r, t == ValueType::I32)
            }

            UnaryOp::Popcnt => {
                let (r, zero_ext) = alloc_result_reg(c, t, x, false);
                if t == ValueType::I32 && !zero_ext {
                    insn::mov_rr(&mut c.text, ValueType::I32, r, r);
                }
                insn::fmov_f_g(&mut c.text, ValueType::F64, REG_FLOAT_SCRATCH, r);
                insn::cnt_8b(&mut c.text, REG_FLOAT_SCRATCH, REG_FLOAT_SCRATCH);
                insn::addv_8b(&mut c.text, REG_FLOAT_SCRATCH, REG_FLOAT_SCRATCH);
                insn::umov_b0(&mut c.text, r, REG_FLOAT_SCRATCH);
                Operand::temp_reg(r, true)
            }

            UnaryOp::Neg | UnaryOp::Abs | UnaryOp::Sqrt
            | UnaryOp::Ceil | UnaryOp::Floor | UnaryOp::Trunc | UnaryOp::Nearest => {
                let fu = match op {
                    UnaryOp::Neg => FloatUnary::Neg,
                    UnaryOp::Abs => FloatUnary::Abs,
                    UnaryOp::Sqrt => FloatUnary::Sqrt,
                    UnaryOp::Ceil => FloatUnary::RoundCeil,
                    UnaryOp::Floor => FloatUnary::RoundFloor,
                    UnaryOp::Trunc => FloatUnary::RoundTrunc,
                    _ => FloatUnary::RoundNearest,
                };
                let (r, _) = alloc_result_reg(c, t, x, false);
                insn::float_unary(&mut c.text, fu, t, r, r);
                Operand::temp_reg(r, false)
            }
        }
    }

    fn binary(c: &mut Coder<Self>, op: BinaryOp, t: ValueType, a: Operand, b: Operand) -> Operand {
        use BinaryOp::*;
        match t.category() {
            Category::Int => match op {
                Add | Sub | And | Or | Xor => binary_int_al(c, op, t, a, b),
                Mul => binary_int_mul(c, t, a, b),
                DivS | DivU | RemS | RemU => binary_int_divmod(c, op, t, a, b),
                Shl | ShrS | ShrU | Rotl | Rotr => binary_int_shift(c, op, t, a, b),
                Eq | Ne | LtS | LtU | GtS | GtU | LeS | LeU | GeS | GeU => {
                    binary_int_cmp(c, op, t, a, b)
                }
                other => panic!("internal: {other:?} is not an integer operation"),
            },
            Category::Float => match op {
                Add | Sub | Mul | Div | Min | Max => binary_float_common(c, op, t, a, b),
                CopySign => binary_float_copysign(c, t, a, b),
                Eq | Ne | Lt | Gt | Le | Ge => binary_float_cmp(c, op, t, a, b),
                other => panic!("internal: {other:?} is not a float operation"),
            },
        }
    }

    fn convert(
        c: &mut Coder<Self>,
        op: ConvertOp,
        to: ValueType,
        from: ValueType,
        x: Operand,
    ) -> Operand {
        match op {
            ConvertOp::Wrap => {
                let (r, _) = alloc_result_reg(c, from, x, false);
                insn::mov_rr(&mut c.text, ValueType::I32, r, r);
                Operand::temp_reg(r, true)
            }

            ConvertOp::ExtendS => {
                let (r, _) = alloc_result_reg(c, from, x, false);
                insn::sxtw(&mut c.text, r, r);
                Operand::temp_reg(r, false)
            }

            ConvertOp::ExtendU => {
                let (r, zero_ext) = alloc_result_reg(c, from, x, false);
                if !zero_ext {
                    insn::mov_rr(&mut c.text, ValueType::I32, r, r);
                }
                Operand::temp_reg(r, true)
            }

            ConvertOp::TruncS | ConvertOp::TruncU => {
                let signed = op == ConvertOp::TruncS;
                let (s, _, own) = borrow_scratch_reg(c, from, x, false);
                let r = c.try_alloc_reg(to).unwrap_or(REG_RESULT);
                insn::float_to_int(&mut c.text, from, to, signed, r, s);
                if own {
                    c.free_reg(from, s);
                }
                Operand::temp_reg(r, to == ValueType::I32)
            }

            ConvertOp::ConvertS | ConvertOp::ConvertU => {
                let signed = op == ConvertOp::ConvertS;
                let (s, zero_ext, own) = borrow_scratch_reg(c, from, x, false);
                if from == ValueType::I32 && !signed && !zero_ext {
                    insn::mov_rr(&mut c.text, ValueType::I32, s, s);
                }
                let r = c.try_alloc_reg(to).unwrap_or(REG_RESULT);
                insn::int_to_float(&mut c.text, to, from, signed, r, s);
                if own {
                    c.free_reg(from, s);
                }
                Operand::temp_reg(r, false)
            }

            ConvertOp::Demote | ConvertOp::Promote => {
                let (r, _) = alloc_result_reg(c, from, x, false);
                insn::fcvt(&mut c.text, from, r, r);
                Operand::temp_reg(r, false)
            }

            ConvertOp::Reinterpret => {
                let (s, _, own) = borrow_scratch_reg(c, from, x, false);
                let r = c.try_alloc_reg(to).unwrap_or(REG_RESULT);
                match to.category() {
                    Category::Float => insn::fmov_f_g(&mut c.text, to, r, s),
                    Category::Int => insn::fmov_g_f(&mut c.text, from, r, s),
                }
                if own {
                    c.free_reg(from, s);
                }
                Operand::temp_reg(r, to == ValueType::I32)
            }
        }
    }

    fn load(
        c: &mut Coder<Self>,
        width: LoadWidth,
        t: ValueType,
        index: Operand,
        offset: u32,
    ) -> Operand {
        let (ireg, zx, own) = borrow_scratch_reg(c, ValueType::I32, index, false);
        if !zx {
            insn::mov_rr(&mut c.text, ValueType::I32, ireg, ireg);
        }

        let size = load_size(width, t);
        check_memory_bounds(c, ireg, offset, size);
        let addr_reg = memory_index_reg(c, ireg, offset);

        match t.category() {
            Category::Int => {
                let dst = if own {
                    ireg
                } else {
                    c.try_alloc_reg(t).unwrap_or(REG_RESULT)
                };
                let (mem_op, zero_ext) = load_mem_op(width, t);
                insn::mem_reg(&mut c.text, mem_op, dst, REG_MEMORY_BASE, addr_reg, false);
                Operand::temp_reg(dst, zero_ext)
            }
            Category::Float => {
                let dst = c.try_alloc_reg(t).unwrap_or(REG_RESULT);
                insn::mem_reg_float(&mut c.text, t, true, dst, REG_MEMORY_BASE, addr_reg);
                if own {
                    c.free_reg(ValueType::I32, ireg);
                }
                Operand::temp_reg(dst, false)
            }
        }
    }

    fn store(
        c: &mut Coder<Self>,
        width: StoreWidth,
        t: ValueType,
        index: Operand,
        value: Operand,
        offset: u32,
    ) {
        let (ireg, zx, iown) = borrow_scratch_reg(c, ValueType::I32, index, false);
        if !zx {
            insn::mov_rr(&mut c.text, ValueType::I32, ireg, ireg);
        }

        let size = store_size(width, t);
        check_memory_bounds(c, ireg, offset, size);

        // materialize the value before the address claims the scratches
        let (vreg, vown) = match (t.category(), value.check_any_reg()) {
            (_, Some(reg)) => (
                reg,
                value.check_temp_reg().is_some() && c.is_reg_allocated(t, reg),
            ),
            (Category::Int, None) => {
                Self::move_to_reg(c, t, REG_SCRATCH2, value, false);
                (REG_SCRATCH2, false)
            }
            (Category::Float, None) => {
                Self::move_to_reg(c, t, REG_FLOAT_SCRATCH, value, false);
                (REG_FLOAT_SCRATCH, false)
            }
        };

        let addr_reg = memory_index_reg(c, ireg, offset);

        match t.category() {
            Category::Int => {
                let mem_op = match size {
                    1 => MemOp::Store8,
                    2 => MemOp::Store16,
                    4 => MemOp::Store32,
                    _ => MemOp::Store64,
                };
                insn::mem_reg(&mut c.text, mem_op, vreg, REG_MEMORY_BASE, addr_reg, false);
            }
            Category::Float => {
                insn::mem_reg_float(&mut c.text, t, false, vreg, REG_MEMORY_BASE, addr_reg);
            }
        }

        if vown {
            c.free_reg(t, vreg);
        }
        if iown {
            c.free_reg(ValueType::I32, ireg);
        }
    }

    fn select(c: &mut Coder<Self>, t: ValueType, a: Operand, b: Operand, cond: Operand) -> Operand {
        let condition = match cond {
            Operand::VarMem { offset, .. } => {
                stack_access(c, ValueType::I32, true, REG_SCRATCH, offset);
                insn::cmp_ri(&mut c.text, ValueType::I32, REG_SCRATCH, 0);
                Condition::Ne
            }
            Operand::VarReg { reg, .. } | Operand::TempReg { reg, .. } => {
                insn::cmp_ri(&mut c.text, ValueType::I32, reg, 0);
                Condition::Ne
            }
            Operand::Stack => {
                insn::pop_word(&mut c.text, false, REG_SCRATCH, REG_STACK_PTR);
                insn::cmp_ri(&mut c.text, ValueType::I32, REG_SCRATCH, 0);
                Condition::Ne
            }
            Operand::Flags(cond) => cond,
            Operand::Imm(_) => {
                return if cond.imm_value(ValueType::I32) != 0 {
                    c.consumed(t, b);
                    a
                } else {
                    c.consumed(t, a);
                    b
                };
            }
            other => panic!("internal: select condition is {other}"),
        };
        c.consumed(ValueType::I32, cond);

        let (target, _) = alloc_result_reg(c, t, b, true);
        let code = cond_a64(condition);

        match t.category() {
            Category::Int => {
                let (areg, _, aown) = borrow_scratch_reg(c, t, a, true);
                insn::csel(&mut c.text, t, target, areg, target, code);
                if aown {
                    c.free_reg(t, areg);
                }
                Operand::temp_reg(target, t == ValueType::I32)
            }
            Category::Float => {
                let (areg, _, aown) = borrow_scratch_reg(c, t, a, true);
                insn::fcsel(&mut c.text, t, target, areg, target, code);
                if aown {
                    c.free_reg(t, areg);
                }
                Operand::temp_reg(target, false)
            }
        }
    }

    fn query_memory_size(c: &mut Coder<Self>) -> Operand {
        let reg = c.try_alloc_reg(ValueType::I32).unwrap_or(REG_RESULT);
        insn::sub_rr(&mut c.text, ValueType::I64, reg, REG_MEMORY_LIMIT, REG_MEMORY_BASE);
        insn::lsr_ri(&mut c.text, ValueType::I64, reg, reg, 16);
        Operand::temp_reg(reg, true)
    }

    fn grow_memory(c: &mut Coder<Self>, x: Operand) -> Operand {
        Self::move_to_reg(c, ValueType::I32, REG_SCRATCH, x, false);
        insn::lsl_ri(&mut c.text, ValueType::I64, REG_SCRATCH, REG_SCRATCH, 16);

        let reg = c.try_alloc_reg(ValueType::I32).unwrap_or(REG_RESULT);
        insn::sub_rr(&mut c.text, ValueType::I64, reg, REG_MEMORY_LIMIT, REG_MEMORY_BASE);

        insn::add_rr(&mut c.text, ValueType::I64, REG_SCRATCH, REG_SCRATCH, REG_MEMORY_LIMIT);
        insn::ldur(&mut c.text, REG_SCRATCH2, REG_STACK_LIMIT, GROW_LIMIT_SLOT);
        insn::cmp_rr(&mut c.text, ValueType::I64, REG_SCRATCH, REG_SCRATCH2);
        let skip = over_trap_call(c);
        insn::b_cond(&mut c.text, 9, skip); // ls
        Self::trap(c, Trap::MemoryGrowLimit);

        insn::mov_rr(&mut c.text, ValueType::I64, REG_MEMORY_LIMIT, REG_SCRATCH);
        insn::lsr_ri(&mut c.text, ValueType::I64, reg, reg, 16);
        Operand::temp_reg(reg, true)
    }

    fn branch(c: &mut Coder<Self>, addr: i32) -> i32 {
        insn::b(&mut c.text, addr)
    }

    fn branch_if(c: &mut Coder<Self>, x: Operand, yes: bool, _near: bool, addr: i32) -> Vec<i32> {
        let mut cond = match x {
            Operand::Flags(cond) => cond,
            _ => {
                let (reg, _, own) = borrow_scratch_reg(c, ValueType::I32, x, false);
                insn::cmp_ri(&mut c.text, ValueType::I32, reg, 0);
                if own {
                    c.free_reg(ValueType::I32, reg);
                }
                Condition::Ne
            }
        };
        if !yes {
            cond = cond.invert();
        }
        vec![insn::b_cond(&mut c.text, cond_a64(cond), addr)]
    }

    fn branch_if_out_of_bounds(c: &mut Coder<Self>, index_reg: Reg, upper: i32, addr: i32) -> i32 {
        insn::mov_ri(&mut c.text, ValueType::I32, REG_SCRATCH, upper as i64);
        insn::cmp_ri(&mut c.text, ValueType::I32, index_reg, 0);
        insn::csel(&mut c.text, ValueType::I32, index_reg, REG_SCRATCH, index_reg, 11); // lt
        insn::cmp_rr(&mut c.text, ValueType::I32, REG_SCRATCH, index_reg);
        insn::b_cond(&mut c.text, 13, addr) // le
    }

    fn branch_indirect32(c: &mut Coder<Self>, r: Reg, zero_ext: bool) {
        if !zero_ext {
            insn::mov_rr(&mut c.text, ValueType::I32, r, r);
        }
        insn::add_rr(&mut c.text, ValueType::I64, r, r, REG_TEXT_BASE);
        insn::br(&mut c.text, r);
    }

    fn load_branch_table_entry(
        c: &mut Coder<Self>,
        t: ValueType,
        r: Reg,
        zero_ext: bool,
        scale: u8,
        rodata_offset: i32,
    ) -> bool {
        if !zero_ext {
            insn::mov_rr(&mut c.text, ValueType::I32, r, r);
        }
        let disp = (c.rodata_addr() + rodata_offset) as i64;
        insn::mov_ri(&mut c.text, ValueType::I64, REG_SCRATCH2, disp);
        insn::add_rr(&mut c.text, ValueType::I64, REG_SCRATCH2, REG_SCRATCH2, REG_TEXT_BASE);
        let mem_op = if scale == 3 { MemOp::Load64 } else { MemOp::Load32 };
        insn::mem_reg(&mut c.text, mem_op, r, REG_SCRATCH2, r, true);
        true
    }

    fn call(c: &mut Coder<Self>, addr: i32) -> i32 {
        emit_call(c, addr)
    }

    fn call_missing(c: &mut Coder<Self>) -> i32 {
        emit_call(c, 0)
    }

    fn call_indirect(c: &mut Coder<Self>, sig_index: u32, func_index_reg: Reg) -> i32 {
        let r = func_index_reg;

        let table_len = c.table_len() as i64;
        insn::mov_ri(&mut c.text, ValueType::I32, REG_SCRATCH, table_len);
        insn::cmp_ri(&mut c.text, ValueType::I32, r, 0);
        insn::csel(&mut c.text, ValueType::I32, r, REG_SCRATCH, r, 11); // lt
        insn::cmp_rr(&mut c.text, ValueType::I32, REG_SCRATCH, r);
        let out_of_bounds = insn::b_cond(&mut c.text, 13, 0); // le

        let table = (c.rodata_addr() + TABLE_ADDR) as i64;
        insn::mov_ri(&mut c.text, ValueType::I64, REG_SCRATCH2, table);
        insn::add_rr(&mut c.text, ValueType::I64, REG_SCRATCH2, REG_SCRATCH2, REG_TEXT_BASE);
        insn::mem_reg(&mut c.text, MemOp::Load64, r, REG_SCRATCH2, r, true);
        insn::mov_rr(&mut c.text, ValueType::I32, REG_SCRATCH, r); // function address
        insn::lsr_ri(&mut c.text, ValueType::I64, r, r, 32); // signature index
        insn::mov_ri(&mut c.text, ValueType::I32, REG_SCRATCH2, sig_index as i64);
        insn::cmp_rr(&mut c.text, ValueType::I32, r, REG_SCRATCH2);
        let checks_out = insn::b_cond(&mut c.text, 0, 0); // eq

        Self::trap(c, Trap::IndirectCallSignature);

        let here = c.text.addr();
        insn::patch_b(c.text.bytes_mut(), out_of_bounds, here);
        Self::trap(c, Trap::IndirectCallIndex);

        let here = c.text.addr();
        insn::patch_b(c.text.bytes_mut(), checks_out, here);
        insn::add_rr(&mut c.text, ValueType::I64, REG_SCRATCH, REG_SCRATCH, REG_TEXT_BASE);
        let ret_addr = emit_call_reg(c, REG_SCRATCH);
        c.map_call_site_here();
        ret_addr
    }

    fn setup_stack_frame(c: &mut Coder<Self>) -> i32 {
        // stack reservation with a patchable two-word immediate
        insn::movz(&mut c.text, ValueType::I64, REG_SCRATCH, 0, 0);
        insn::movk(&mut c.text, ValueType::I64, REG_SCRATCH, 0, 1);
        let site = c.text.addr();

        insn::sub_rr(&mut c.text, ValueType::I64, REG_SCRATCH, REG_STACK_PTR, REG_SCRATCH);
        insn::cmp_rr(&mut c.text, ValueType::I64, REG_SCRATCH, REG_STACK_LIMIT);
        let skip = over_trap_call(c);
        insn::b_cond(&mut c.text, 10, skip); // ge
        Self::trap(c, Trap::CallStackExhausted);
        site
    }

    fn ret(c: &mut Coder<Self>, num_stack_values: i32) {
        add_sp_imm(c, num_stack_values * 8);
        insn::pop_word(&mut c.text, false, REG_SCRATCH2, REG_STACK_PTR);
        insn::br(&mut c.text, REG_SCRATCH2);
    }

    fn trap(c: &mut Coder<Self>, id: Trap) {
        let addr = c.trap_stub_addr(id);
        emit_call(c, addr);
        c.map_call_site_here();
    }

    fn abort(c: &mut Coder<Self>) {
        insn::brk(&mut c.text);
    }

    fn update_branches(text: &mut [u8], l: &Label) {
        let addr = l.final_addr();
        for &site in &l.sites {
            insn::patch_b(text, site, addr);
        }
    }

    fn update_calls(text: &mut [u8], l: &Label) {
        let addr = l.final_addr();
        for &site in &l.sites {
            let insn_addr = site - 4;
            let old = u32::from_le_bytes(
                text[insn_addr as usize..site as usize].try_into().unwrap(),
            );
            atomic_put_u32(text, insn_addr, insn::branch_word(old, site, addr));
        }
    }

    fn update_stack_check(text: &mut [u8], site: i32, max_stack: i32) {
        let max = max_stack as u32;
        let movz = 0xd280_0000 | ((max & 0xffff) << 5) | REG_SCRATCH.0 as u32;
        let movk = 0xf2a0_0000 | (((max >> 16) & 0xffff) << 5) | REG_SCRATCH.0 as u32;
        let base = (site - 8) as usize;
        text[base..base + 4].copy_from_slice(&movz.to_le_bytes());
        text[base + 4..base + 8].copy_from_slice(&movk.to_le_bytes());
    }

    fn delete_code(text: &mut [u8], start: i32, end: i32) {
        text[start as usize..end as usize].fill(0x00); // udf #0
    }

    fn disable_code(text: &mut [u8], start: i32, end: i32) {
        let mut addr = start as usize;
        while addr + 4 <= end as usize {
            text[addr..addr + 4].copy_from_slice(&0xd503_201fu32.to_le_bytes()); // nop
            addr += 4;
        }
    }
}

fn load_size(width: LoadWidth, t: ValueType) -> u32 {
    match width {
        LoadWidth::Full => t.size(),
        LoadWidth::I8S | LoadWidth::I8U => 1,
        LoadWidth::I16S | LoadWidth::I16U => 2,
        LoadWidth::I32S | LoadWidth::I32U => 4,
    }
}

fn store_size(width: StoreWidth, t: ValueType) -> u32 {
    match width {
        StoreWidth::Full => t.size(),
        StoreWidth::I8 => 1,
        StoreWidth::I16 => 2,
        StoreWidth::I32 => 4,
    }
}

fn load_mem_op(width: LoadWidth, t: ValueType) -> (MemOp, bool) {
    let to64 = t == ValueType::I64;
    match width {
        LoadWidth::Full => {
            if to64 {
                (MemOp::Load64, false)
            } else {
                (MemOp::Load32, true)
            }
        }
        LoadWidth::I8U => (MemOp::LoadU8, true),
        LoadWidth::I16U => (MemOp::LoadU16, true),
        LoadWidth::I32U => (MemOp::Load32, true),
        LoadWidth::I8S => {
            if to64 {
                (MemOp::LoadS8To64, false)
            } else {
                (MemOp::LoadS8To32, false)
            }
        }
        LoadWidth::I16S => {
            if to64 {
                (MemOp::LoadS16To64, false)
            } else {
                (MemOp::LoadS16To32, false)
            }
        }
        LoadWidth::I32S => (MemOp::LoadS32To64, false),
    }
}

/// Trap unless `memory_base + index + offset + size <= memory_limit`.
fn check_memory_bounds(c: &mut Coder<AArch64>, index_reg: Reg, offset: u32, size: u32) {
    add_imm_via(c, REG_SCRATCH, index_reg, (offset + size) as i64);
    insn::add_rr(&mut c.text, ValueType::I64, REG_SCRATCH, REG_SCRATCH, REG_MEMORY_BASE);
    insn::cmp_rr(&mut c.text, ValueType::I64, REG_SCRATCH, REG_MEMORY_LIMIT);
    let skip = over_trap_call(c);
    insn::b_cond(&mut c.text, 9, skip); // ls
    AArch64::trap(c, Trap::MemoryAccessOutOfBounds);
}

/// The register holding `index + offset` for the access itself.
fn memory_index_reg(c: &mut Coder<AArch64>, index_reg: Reg, offset: u32) -> Reg {
    if offset == 0 {
        index_reg
    } else {
        add_imm_via(c, REG_SCRATCH, index_reg, offset as i64);
        REG_SCRATCH
    }
}

fn binary_int_al(
    c: &mut Coder<AArch64>,
    op: BinaryOp,
    t: ValueType,
    a: Operand,
    b: Operand,
) -> Operand {
    if op == BinaryOp::Sub && a.check_imm_value(t) == Some(0) {
        let (r, _) = alloc_result_reg(c, t, b, false);
        insn::sub_rr(&mut c.text, t, r, Reg(XZR), r);
        return Operand::temp_reg(r, t == ValueType::I32);
    }

    if let Some(value) = b.check_imm_value(t) {
        if (0..0x1000).contains(&value) && matches!(op, BinaryOp::Add | BinaryOp::Sub) {
            let (r, _) = alloc_result_reg(c, t, a, false);
            if op == BinaryOp::Add {
                insn::add_ri(&mut c.text, t, r, r, value as u32, false);
            } else {
                insn::sub_ri(&mut c.text, t, r, r, value as u32, false);
            }
            return Operand::temp_reg(r, t == ValueType::I32);
        }
    }

    let (breg, _, bown) = borrow_scratch_reg(c, t, b, false);
    let (r, _) = alloc_result_reg(c, t, a, false);
    match op {
        BinaryOp::Add => insn::add_rr(&mut c.text, t, r, r, breg),
        BinaryOp::Sub => insn::sub_rr(&mut c.text, t, r, r, breg),
        BinaryOp::And => insn::logic_rr(&mut c.text, Logic::And, t, r, r, breg),
        BinaryOp::Or => insn::logic_rr(&mut c.text, Logic::Orr, t, r, r, breg),
        BinaryOp::Xor => insn::logic_rr(&mut c.text, Logic::Eor, t, r, r, breg),
        _ => unreachable!(),
    }
    if bown {
        c.free_reg(t, breg);
    }
    Operand::temp_reg(r, t == ValueType::I32)
}

fn binary_int_mul(c: &mut Coder<AArch64>, t: ValueType, a: Operand, b: Operand) -> Operand {
    let (breg, _, bown) = borrow_scratch_reg(c, t, b, false);
    let (r, _) = alloc_result_reg(c, t, a, false);
    insn::mul_rr(&mut c.text, t, r, r, breg);
    if bown {
        c.free_reg(t, breg);
    }
    Operand::temp_reg(r, t == ValueType::I32)
}

fn binary_int_divmod(
    c: &mut Coder<AArch64>,
    op: BinaryOp,
    t: ValueType,
    a: Operand,
    b: Operand,
) -> Operand {
    let signed = matches!(op, BinaryOp::DivS | BinaryOp::RemS);
    let remainder = matches!(op, BinaryOp::RemS | BinaryOp::RemU);

    let mut check_zero = true;
    let mut check_overflow = op == BinaryOp::DivS;
    if let Some(value) = b.check_imm_value(t) {
        if value != 0 {
            check_zero = false;
        }
        if value != -1 {
            check_overflow = false;
        }
    }
    if let Some(value) = a.check_imm_value(t) {
        let min = if t == ValueType::I32 {
            i32::MIN as i64
        } else {
            i64::MIN
        };
        if value != min {
            check_overflow = false;
        }
    }

    let (breg, _, bown) = borrow_scratch_reg(c, t, b, false);
    let (r, _) = alloc_result_reg(c, t, a, false);

    if check_zero {
        // the hardware quietly yields zero; the contract is a trap
        let skip = over_trap_call(c);
        insn::cbz(&mut c.text, t, true, breg, skip);
        AArch64::trap(c, Trap::IntegerDivideByZero);
    }

    if check_overflow {
        let min = if t == ValueType::I32 {
            i32::MIN as i64
        } else {
            i64::MIN
        };
        insn::mov_ri(&mut c.text, t, REG_SCRATCH2, min);
        insn::cmp_rr(&mut c.text, t, r, REG_SCRATCH2);
        let ok_dividend = insn::b_cond(&mut c.text, 1, 0); // ne
        insn::cmn_ri(&mut c.text, t, breg, 1);
        let ok_divisor = insn::b_cond(&mut c.text, 1, 0); // ne
        AArch64::trap(c, Trap::IntegerOverflow);
        let here = c.text.addr();
        insn::patch_b(c.text.bytes_mut(), ok_dividend, here);
        insn::patch_b(c.text.bytes_mut(), ok_divisor, here);
    }

    if remainder {
        insn::div_rr(&mut c.text, t, signed, REG_SCRATCH2, r, breg);
        insn::msub(&mut c.text, t, r, REG_SCRATCH2, breg, r);
    } else {
        insn::div_rr(&mut c.text, t, signed, r, r, breg);
    }

    if bown {
        c.free_reg(t, breg);
    }
    Operand::temp_reg(r, t == ValueType::I32)
}

fn binary_int_shift(
    c: &mut Coder<AArch64>,
    op: BinaryOp,
    t: ValueType,
    a: Operand,
    b: Operand,
) -> Operand {
    let bits = t.size() * 8;

    if let Some(value) = b.check_imm_value(ValueType::I32) {
        let count = value as u32 % bits;
        let (r, _) = alloc_result_reg(c, t, a, false);
        match op {
            BinaryOp::Shl => insn::lsl_ri(&mut c.text, t, r, r, count),
            BinaryOp::ShrU => insn::lsr_ri(&mut c.text, t, r, r, count),
            BinaryOp::ShrS => insn::asr_ri(&mut c.text, t, r, r, count),
            BinaryOp::Rotr => insn::ror_ri(&mut c.text, t, r, r, count),
            BinaryOp::Rotl => insn::ror_ri(&mut c.text, t, r, r, (bits - count) % bits),
            _ => unreachable!(),
        }
        return Operand::temp_reg(r, t == ValueType::I32);
    }

    AArch64::move_to_reg(c, ValueType::I32, REG_SCRATCH, b, false);
    let (r, _) = alloc_result_reg(c, t, a, false);
    match op {
        BinaryOp::Shl => insn::shift_rr(&mut c.text, Shift::Lsl, t, r, r, REG_SCRATCH),
        BinaryOp::ShrU => insn::shift_rr(&mut c.text, Shift::Lsr, t, r, r, REG_SCRATCH),
        BinaryOp::ShrS => insn::shift_rr(&mut c.text, Shift::Asr, t, r, r, REG_SCRATCH),
        BinaryOp::Rotr => insn::shift_rr(&mut c.text, Shift::Ror, t, r, r, REG_SCRATCH),
        BinaryOp::Rotl => {
            insn::sub_rr(&mut c.text, ValueType::I32, REG_SCRATCH, Reg(XZR), REG_SCRATCH);
            insn::shift_rr(&mut c.text, Shift::Ror, t, r, r, REG_SCRATCH);
        }
        _ => unreachable!(),
    }
    Operand::temp_reg(r, t == ValueType::I32)
}

fn int_cmp_condition(op: BinaryOp) -> Condition {
    match op {
        BinaryOp::Eq => Condition::Eq,
        BinaryOp::Ne => Condition::Ne,
        BinaryOp::LtS => Condition::LtS,
        BinaryOp::LtU => Condition::LtU,
        BinaryOp::GtS => Condition::GtS,
        BinaryOp::GtU => Condition::GtU,
        BinaryOp::LeS => Condition::LeS,
        BinaryOp::LeU => Condition::LeU,
        BinaryOp::GeS => Condition::GeS,
        BinaryOp::GeU => Condition::GeU,
        _ => unreachable!(),
    }
}

fn binary_int_cmp(
    c: &mut Coder<AArch64>,
    op: BinaryOp,
    t: ValueType,
    a: Operand,
    b: Operand,
) -> Operand {
    if b == Operand::Stack {
        // b sits on top of the machine stack; a was materialized by the
        // caller and lives elsewhere
        insn::pop_word(&mut c.text, false, REG_SCRATCH, REG_STACK_PTR);
        c.consumed(t, Operand::Stack);
        AArch64::move_to_reg(c, t, REG_SCRATCH2, a, false);
        insn::cmp_rr(&mut c.text, t, REG_SCRATCH2, REG_SCRATCH);
        return Operand::Flags(int_cmp_condition(op));
    }

    let (areg, _, aown) = borrow_scratch_reg(c, t, a, false);
    match b {
        Operand::Imm(_) if (0..0x1000).contains(&b.imm_value(t)) => {
            insn::cmp_ri(&mut c.text, t, areg, b.imm_value(t) as u32);
        }
        Operand::VarReg { reg, .. } | Operand::TempReg { reg, .. } => {
            insn::cmp_rr(&mut c.text, t, areg, reg);
            c.consumed(t, b);
        }
        _ => {
            AArch64::move_to_reg(c, t, REG_SCRATCH2, b, false);
            insn::cmp_rr(&mut c.text, t, areg, REG_SCRATCH2);
        }
    }
    if aown {
        c.free_reg(t, areg);
    }
    Operand::Flags(int_cmp_condition(op))
}

fn binary_float_common(
    c: &mut Coder<AArch64>,
    op: BinaryOp,
    t: ValueType,
    a: Operand,
    b: Operand,
) -> Operand {
    let fop = match op {
        BinaryOp::Add => FloatOp::Add,
        BinaryOp::Sub => FloatOp::Sub,
        BinaryOp::Mul => FloatOp::Mul,
        BinaryOp::Div => FloatOp::Div,
        BinaryOp::Min => FloatOp::Min,
        BinaryOp::Max => FloatOp::Max,
        _ => unreachable!(),
    };
    let (r, _) = alloc_result_reg(c, t, a, false);
    let (s, _, own) = borrow_scratch_reg(c, t, b, false);
    insn::float_rr(&mut c.text, fop, t, r, r, s);
    if own {
        c.free_reg(t, s);
    }
    Operand::temp_reg(r, false)
}

fn binary_float_copysign(c: &mut Coder<AArch64>, t: ValueType, a: Operand, b: Operand) -> Operand {
    let it = if t.size() == 4 {
        ValueType::I32
    } else {
        ValueType::I64
    };
    let sign = if t.size() == 4 {
        i32::MIN as i64
    } else {
        i64::MIN
    };
    let (r, _) = alloc_result_reg(c, t, a, false);
    let (s, _, own) = borrow_scratch_reg(c, t, b, false);

    insn::fmov_g_f(&mut c.text, t, REG_SCRATCH, s);
    insn::fmov_g_f(&mut c.text, t, REG_SCRATCH2, r);
    insn::mov_ri(&mut c.text, it, Reg(0), sign); // int result register
    insn::logic_rr(&mut c.text, Logic::And, it, REG_SCRATCH, REG_SCRATCH, Reg(0));
    insn::logic_rr(&mut c.text, Logic::Bic, it, REG_SCRATCH2, REG_SCRATCH2, Reg(0));
    insn::logic_rr(&mut c.text, Logic::Orr, it, REG_SCRATCH2, REG_SCRATCH2, REG_SCRATCH);
    insn::fmov_f_g(&mut c.text, t, r, REG_SCRATCH2);

    if own {
        c.free_reg(t, s);
    }
    Operand::temp_reg(r, false)
}

fn binary_float_cmp(
    c: &mut Coder<AArch64>,
    op: BinaryOp,
    t: ValueType,
    a: Operand,
    b: Operand,
) -> Operand {
    let cond = match op {
        BinaryOp::Eq => Condition::OrderedAndEq,
        BinaryOp::Ne => Condition::UnorderedOrNe,
        BinaryOp::Lt => Condition::OrderedAndLt,
        BinaryOp::Gt => Condition::OrderedAndGt,
        BinaryOp::Le => Condition::OrderedAndLe,
        BinaryOp::Ge => Condition::OrderedAndGe,
        _ => unreachable!(),
    };
    let (r, _) = alloc_result_reg(c, t, a, false);
    let (s, _, own) = borrow_scratch_reg(c, t, b, false);
    insn::fcmp(&mut c.text, t, r, s);
    if own {
        c.free_reg(t, s);
    }
    if c.is_reg_allocated(t, r) {
        c.free_reg(t, r);
    }
    Operand::Flags(cond)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Module;

    fn coder(module: &Module) -> Coder<'_, AArch64> {
        Coder::new(module, 0x1000_0000)
    }

    fn words(text: &[u8]) -> Vec<u32> {
        text.chunks_exact(4)
            .map(|w| u32::from_le_bytes(w.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn test_trap_stub_fits_alignment() {
        let module = Module::default();
        let mut c = coder(&module);
        AArch64::jump_to_trap_handler(&mut c, Trap::Unreachable);
        assert!(c.text.len() <= 16);
        let w = words(c.text.bytes());
        // movz w0, #9; ldur x17, [x25, #-8]; br x17
        assert_eq!(w[0], 0x5280_0120);
        assert_eq!(w[1], 0xf85f_8331);
        assert_eq!(w[2], 0xd61f_0220);
    }

    #[test]
    fn test_exit_stub_fits_alignment() {
        let module = Module::default();
        let mut c = coder(&module);
        AArch64::jump_to_trap_handler(&mut c, Trap::Exit);
        assert_eq!(c.text.len(), 16);
    }

    #[test]
    fn test_resume_is_pop_and_jump() {
        let module = Module::default();
        let mut c = coder(&module);
        AArch64::resume(&mut c);
        let w = words(c.text.bytes());
        assert_eq!(w[0], 0xf840_8791); // ldr x17, [x28], #8
        assert_eq!(w[1], 0xd61f_0220); // br x17
    }

    #[test]
    fn test_call_pushes_return_address() {
        let module = Module::default();
        let mut c = coder(&module);
        let ret = AArch64::call(&mut c, 0x40);
        assert_eq!(ret, 12);
        let w = words(c.text.bytes());
        assert_eq!(w[0], 0x1000_0071); // adr x17, #12
        assert_eq!(w[1], 0xf81f_8f91); // str x17, [x28, #-8]!
        assert_eq!(w[2], 0x1400_000e); // b +0x38 (to 0x40)
    }

    #[test]
    fn test_flags_materialize_as_cset() {
        let module = Module::default();
        let mut c = coder(&module);
        let zx = AArch64::move_to_reg(
            &mut c,
            ValueType::I32,
            Reg(3),
            Operand::Flags(Condition::LtS),
            false,
        );
        assert!(zx);
        // cset w3, lt = csinc w3, wzr, wzr, ge
        assert_eq!(words(c.text.bytes())[0], 0x1a9f_a7e3);
    }

    #[test]
    fn test_stack_check_is_patchable() {
        let module = Module::default();
        let mut c = coder(&module);
        c.trap_links[Trap::CallStackExhausted.id() as usize].bind(0x30);
        let site = AArch64::setup_stack_frame(&mut c);
        assert_eq!(site, 8);
        AArch64::update_stack_check(c.text.bytes_mut(), site, 0x1_0040);
        let w = words(c.text.bytes());
        assert_eq!(w[0], 0xd280_0000 | (0x0040 << 5) | 16); // movz x16, #0x40
        assert_eq!(w[1], 0xf2a0_0000 | (1 << 5) | 16); // movk x16, #1, lsl #16
    }

    #[test]
    fn test_update_calls_is_word_patch() {
        let module = Module::default();
        let mut c = coder(&module);
        let site = AArch64::call_missing(&mut c);
        let mut label = Label::new();
        label.add_site(site);
        label.bind(0x80);
        AArch64::update_calls(c.text.bytes_mut(), &label);
        let w = words(c.text.bytes());
        // b from insn addr 8 to 0x80: offset 30 words
        assert_eq!(w[2], 0x1400_001e);
    }
}
