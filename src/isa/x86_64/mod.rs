//! x86-64 macro assembler.
//!
//! Register conventions: rax is the result register, rdx the scratch,
//! rcx the shift/divisor register; r12 holds the text base, r13 the
//! stack limit, r14 the memory base, r15 the memory limit, r9 the
//! suspend flag.  The trap handler address lives in mm0 and the
//! memory-grow limit in mm1; both survive all generated code.

pub mod insn;

use crate::codegen::coder::Coder;
use crate::codegen::link::Label;
use crate::codegen::operand::{Condition, Operand};
use crate::codegen::regalloc::Reg;
use crate::codegen::program::{
    MASK_43E0_ADDR_64, MASK_5F00_ADDR_32, MASK_7F_ADDR_32, MASK_7F_ADDR_64, MASK_80_ADDR_32,
    MASK_80_ADDR_64, TABLE_ADDR,
};
use crate::codegen::textbuf::{atomic_put_u32, put_u32};
use crate::isa::{alloc_result_reg, borrow_scratch_reg, MacroAssembler, STACK_RESERVE};
use crate::module::{BinaryOp, ConvertOp, LoadWidth, StoreWidth, UnaryOp};
use crate::traps::Trap;
use crate::types::{Category, ValueType};

use insn::Alu;

const REG_RESULT: Reg = Reg(0); // rax / xmm0
const REG_DIVISOR: Reg = Reg(1); // rcx, also shift count
const REG_SCRATCH: Reg = Reg(2); // rdx / xmm2
const REG_IMPORT_SIG: Reg = Reg(3); // rbx
const REG_STACK_PTR: Reg = Reg(4); // rsp
const REG_TEXT_BASE: Reg = Reg(12);
const REG_STACK_LIMIT: Reg = Reg(13);
const REG_MEMORY_BASE: Reg = Reg(14);
const REG_MEMORY_LIMIT: Reg = Reg(15);

const MMX_TRAP_HANDLER: u8 = 0; // mm0
const MMX_GROW_LIMIT: u8 = 1; // mm1

/// Condition code nibble for Jcc/SETcc/CMOVcc.
fn cc(cond: Condition) -> u8 {
    use Condition::*;
    match cond {
        Eq | OrderedAndEq | UnorderedOrEq => 0x4,
        Ne | OrderedAndNe | UnorderedOrNe => 0x5,
        GeS => 0xd,
        GtS => 0xf,
        LeS => 0xe,
        LtS => 0xc,
        GeU | OrderedAndGe | UnorderedOrGe => 0x3,
        GtU | OrderedAndGt | UnorderedOrGt => 0x7,
        LeU | OrderedAndLe | UnorderedOrLe => 0x6,
        LtU | OrderedAndLt | UnorderedOrLt => 0x2,
    }
}

fn int_type(t: ValueType) -> ValueType {
    if t.size() == 4 {
        ValueType::I32
    } else {
        ValueType::I64
    }
}

/// Patch a rel8 stub so it branches to the current text address.
fn bind_stub8(c: &mut Coder<X86_64>, site: i32) {
    let offset = c.text.addr() - site;
    if !(-0x80..0x80).contains(&offset) {
        panic!("internal: local branch displacement out of range");
    }
    c.text.bytes_mut()[site as usize - 1] = offset as u8;
}

/// Pad with multi-byte NOPs so the next 4-byte displacement (one opcode
/// byte away) lands word-aligned; required for atomic call patching.
fn align_call_disp(c: &mut Coder<X86_64>) {
    let misalign = (c.text.addr() + 1) & 3;
    if misalign != 0 {
        let pad = (4 - misalign) as usize;
        c.text.put_bytes(insn::NOP_SEQUENCES[pad - 1]);
    }
}

fn mask80_addr(c: &Coder<X86_64>, t: ValueType) -> i32 {
    c.rodata_addr()
        + if t.size() == 4 {
            MASK_80_ADDR_32
        } else {
            MASK_80_ADDR_64
        }
}

fn mask7f_addr(c: &Coder<X86_64>, t: ValueType) -> i32 {
    c.rodata_addr()
        + if t.size() == 4 {
            MASK_7F_ADDR_32
        } else {
            MASK_7F_ADDR_64
        }
}

/// Load one of the commons masks into the float scratch register.
fn load_float_mask(c: &mut Coder<X86_64>, t: ValueType, disp: i32) {
    insn::movs_r_mem(&mut c.text, t, REG_SCRATCH, REG_TEXT_BASE, None, disp);
}

/// The x86-64 backend.
pub struct X86_64;

impl MacroAssembler for X86_64 {
    const FUNC_ALIGNMENT: u32 = 16;
    const PADDING_BYTE: u8 = 0xcc; // int3
    const RESULT_REG: Reg = REG_RESULT;
    const SCRATCH_REG: Reg = REG_SCRATCH;
    const FLOAT_SCRATCH_REG: Reg = REG_SCRATCH;
    // rbx, rbp, rsi, rdi, r8, r10, r11
    const AVAIL_INT_REGS: u32 = 0x0de8;
    // xmm1, xmm3..xmm15
    const AVAIL_FLOAT_REGS: u32 = 0xfffa;

    fn jump_to_trap_handler(c: &mut Coder<Self>, id: Trap) {
        if id == Trap::Exit {
            // exit value in the upper half, trap id in the lower
            insn::shift_imm(&mut c.text, ValueType::I64, 4, REG_RESULT, 32);
            insn::alu_ri(&mut c.text, Alu::Or, ValueType::I64, REG_RESULT, id.id() as i32);
        } else {
            insn::mov_ri(&mut c.text, ValueType::I32, REG_RESULT, id.id() as i64);
        }
        insn::movq_r_mmx(&mut c.text, REG_SCRATCH, MMX_TRAP_HANDLER);
        insn::jmp_r(&mut c.text, REG_SCRATCH);
    }

    fn resume(c: &mut Coder<Self>) {
        // the runtime re-creates the suspended stack and jumps here; the
        // topmost link word resumes the innermost call
        insn::ret(&mut c.text);
    }

    fn init(c: &mut Coder<Self>) {
        insn::alu_ri(&mut c.text, Alu::Add, ValueType::I64, REG_STACK_LIMIT, STACK_RESERVE);
        // non-zero result register means this is a resumed snapshot:
        // simulate a return from the start-function call
        insn::test_rr(&mut c.text, ValueType::I64, REG_RESULT, REG_RESULT);
        let skip = insn::jmp8_stub(&mut c.text, 0x74); // je
        insn::ret(&mut c.text);
        bind_stub8(c, skip);
    }

    fn init_call_entry(c: &mut Coder<Self>) -> i32 {
        align_call_disp(c);
        let ret_addr = insn::call_missing(&mut c.text);
        // the called function returns here and exits
        Self::jump_to_trap_handler(c, Trap::Exit);
        ret_addr
    }

    fn enter_import_func(c: &mut Coder<Self>, addr: u64, variadic: bool, argc: usize, sig: u32) {
        if variadic {
            insn::mov_ri(&mut c.text, ValueType::I64, REG_SCRATCH, argc as i64);
            insn::mov_ri(&mut c.text, ValueType::I64, REG_IMPORT_SIG, sig as i64);
        }
        insn::mov_ri(&mut c.text, ValueType::I64, REG_RESULT, addr as i64);
        insn::jmp_r(&mut c.text, REG_RESULT);
        // void imports must not leak the jump target through the result
        // register; the runtime clears it around the call
    }

    fn move_to_reg(
        c: &mut Coder<Self>,
        t: ValueType,
        target: Reg,
        x: Operand,
        preserve_flags: bool,
    ) -> bool {
        let mut zero_ext = false;

        match t.category() {
            Category::Int => match x {
                Operand::Imm(_) => {
                    let value = x.imm_value(t);
                    if value == 0 && !preserve_flags {
                        insn::alu_rr(&mut c.text, Alu::Xor, ValueType::I32, target, target);
                    } else {
                        insn::mov_ri(&mut c.text, t, target, value);
                    }
                    zero_ext = true;
                }

                Operand::VarMem { offset, .. } => {
                    insn::mov_r_stack(&mut c.text, t, target, offset);
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
                    insn::pop_r(&mut c.text, target);
                }

                Operand::Flags(cond) => {
                    if t != ValueType::I32 {
                        panic!("internal: condition flags materialized as {t}");
                    }
                    let code = cc(cond);
                    if cond.is_unordered_or() {
                        insn::mov_ri(&mut c.text, t, target, 1); // true
                        let end = insn::jmp8_stub(&mut c.text, 0x7a); // if unordered, else
                        insn::setcc_r(&mut c.text, code, target);
                        bind_stub8(c, end);
                    } else if cond.is_ordered_and() {
                        insn::mov_ri(&mut c.text, t, target, 0); // false
                        let end = insn::jmp8_stub(&mut c.text, 0x7a); // if unordered, else
                        insn::setcc_r(&mut c.text, code, target);
                        bind_stub8(c, end);
                    } else {
                        insn::setcc_r(&mut c.text, code, target);
                        insn::movzx8_rr(&mut c.text, target, target);
                    }
                    zero_ext = true;
                }

                other => panic!("internal: cannot move {other}"),
            },

            Category::Float => match x {
                Operand::Imm(_) => {
                    let value = x.imm_value(t);
                    if value == 0 {
                        insn::pxor_rr(&mut c.text, target, target);
                    } else {
                        insn::mov_ri(&mut c.text, int_type(t), REG_SCRATCH, value);
                        insn::movd_x_r(&mut c.text, int_type(t), target, REG_SCRATCH);
                    }
                }

                Operand::VarMem { offset, .. } => {
                    insn::movs_r_stack(&mut c.text, t, target, offset);
                }

                Operand::VarReg { reg, .. } => {
                    if reg != target {
                        insn::movaps_rr(&mut c.text, target, reg);
                    }
                }

                Operand::TempReg { reg, .. } => {
                    if reg != target {
                        insn::movaps_rr(&mut c.text, target, reg);
                    } else if target != REG_RESULT {
                        panic!("internal: moving temporary float register to itself");
                    }
                }

                Operand::Stack => {
                    insn::movs_r_stack(&mut c.text, t, target, 0);
                    // flag-preserving stack release
                    insn::lea_stack(&mut c.text, REG_STACK_PTR, 8, false);
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
            Category::Float => insn::movaps_rr(&mut c.text, target, source),
        }
    }

    fn load_stack(c: &mut Coder<Self>, t: ValueType, target: Reg, offset: i32) {
        match t.category() {
            Category::Int => insn::mov_r_stack(&mut c.text, t, target, offset),
            Category::Float => insn::movs_r_stack(&mut c.text, t, target, offset),
        }
    }

    fn store_stack(c: &mut Coder<Self>, t: ValueType, offset: i32, x: Operand) {
        let (reg, _, own) = borrow_scratch_reg(c, t, x, true);
        Self::store_stack_reg(c, t, offset, reg);
        if own {
            c.free_reg(t, reg);
        }
    }

    fn store_stack_reg(c: &mut Coder<Self>, t: ValueType, offset: i32, r: Reg) {
        match t.category() {
            Category::Int => insn::mov_stack_r(&mut c.text, t, offset, r),
            Category::Float => insn::movs_stack_r(&mut c.text, t, offset, r),
        }
    }

    fn push(c: &mut Coder<Self>, t: ValueType, x: Operand) {
        if let Some(reg) = x.check_any_reg() {
            Self::push_reg(c, t, reg);
            c.consumed(t, x);
            return;
        }

        if let Operand::Imm(_) = x {
            let value = x.imm_value(t);
            if (-0x80..0x80).contains(&value) {
                insn::push_i8(&mut c.text, value as i8);
                return;
            }
            if (-0x8000_0000..0x8000_0000).contains(&value) {
                insn::push_i32(&mut c.text, value as i32);
                return;
            }
        }

        let reg = match t.category() {
            Category::Int => REG_SCRATCH,
            Category::Float => REG_SCRATCH,
        };
        Self::move_to_reg(c, t, reg, x, true);
        Self::push_reg(c, t, reg);
    }

    fn push_reg(c: &mut Coder<Self>, t: ValueType, r: Reg) {
        match t.category() {
            Category::Int => insn::push_r(&mut c.text, r),
            Category::Float => {
                // flag-preserving stack reserve
                insn::lea_stack(&mut c.text, REG_STACK_PTR, -8, false);
                insn::movs_stack_r(&mut c.text, t, 0, r);
            }
        }
    }

    fn push_imm(c: &mut Coder<Self>, value: i64) {
        if (-0x80..0x80).contains(&value) {
            insn::push_i8(&mut c.text, value as i8);
        } else if (-0x8000_0000..0x8000_0000).contains(&value) {
            insn::push_i32(&mut c.text, value as i32);
        } else {
            insn::mov_ri(&mut c.text, ValueType::I64, REG_SCRATCH, value);
            insn::push_r(&mut c.text, REG_SCRATCH);
        }
    }

    fn push_zeros(c: &mut Coder<Self>, n: usize) {
        for _ in 0..n {
            insn::push_i8(&mut c.text, 0);
        }
    }

    fn pop_reg(c: &mut Coder<Self>, t: ValueType, r: Reg) {
        match t.category() {
            Category::Int => insn::pop_r(&mut c.text, r),
            Category::Float => {
                insn::movs_r_stack(&mut c.text, t, r, 0);
                insn::lea_stack(&mut c.text, REG_STACK_PTR, 8, false);
            }
        }
    }

    fn add_imm_to_stack_ptr(c: &mut Coder<Self>, offset: i32) {
        if offset != 0 {
            insn::alu_ri(&mut c.text, Alu::Add, ValueType::I64, REG_STACK_PTR, offset);
        }
    }

    fn add_to_stack_ptr(c: &mut Coder<Self>, r: Reg) {
        insn::alu_rr(&mut c.text, Alu::Add, ValueType::I64, REG_STACK_PTR, r);
    }

    fn shift_right_logical32(c: &mut Coder<Self>, r: Reg) {
        insn::shift_imm(&mut c.text, ValueType::I64, 5, r, 32);
    }

    fn unary(c: &mut Coder<Self>, op: UnaryOp, t: ValueType, x: Operand) -> Operand {
        match op {
            UnaryOp::Eqz => {
                if let Operand::Flags(cond) = x {
                    return Operand::Flags(cond.invert());
                }
                let (reg, _, own) = borrow_scratch_reg(c, t, x, false);
                insn::test_rr(&mut c.text, t, reg, reg);
                if own {
                    c.free_reg(t, reg);
                }
                Operand::Flags(Condition::Eq)
            }

            UnaryOp::Clz => {
                let (r, _) = alloc_result_reg(c, t, x, false);
                let bits = t.size() as i64 * 8;
                insn::bsr_rr(&mut c.text, t, REG_SCRATCH, r);
                insn::mov_ri(&mut c.text, t, r, bits * 2 - 1);
                insn::cmovcc_rr(&mut c.text, 0x5, t, r, REG_SCRATCH); // cmovne
                insn::alu_ri(&mut c.text, Alu::Xor, t, r, bits as i32 - 1);
                Operand::temp_reg(r, t == ValueType::I32)
            }

            UnaryOp::Ctz => {
                let (r, _) = alloc_result_reg(c, t, x, false);
                let bits = t.size() as i64 * 8;
                insn::bsf_rr(&mut c.text, t, REG_SCRATCH, r);
                insn::mov_ri(&mut c.text, t, r, bits);
                insn::cmovcc_rr(&mut c.text, 0x5, t, r, REG_SCRATCH); // cmovne
                Operand::temp_reg(r, t == ValueType::I32)
            }

            UnaryOp::Popcnt => {
                let (r, _) = alloc_result_reg(c, t, x, false);
                insn::popcnt_rr(&mut c.text, t, r, r);
                Operand::temp_reg(r, t == ValueType::I32)
            }

            UnaryOp::Neg => {
                let (r, _) = alloc_result_reg(c, t, x, false);
                let disp = mask80_addr(c, t);
                load_float_mask(c, t, disp);
                insn::sse_packed_rr(&mut c.text, 0x57, r, REG_SCRATCH); // xorps
                Operand::temp_reg(r, false)
            }

            UnaryOp::Abs => {
                let (r, _) = alloc_result_reg(c, t, x, false);
                let disp = mask7f_addr(c, t);
                load_float_mask(c, t, disp);
                insn::sse_packed_rr(&mut c.text, 0x54, r, REG_SCRATCH); // andps
                Operand::temp_reg(r, false)
            }

            UnaryOp::Ceil | UnaryOp::Floor | UnaryOp::Trunc | UnaryOp::Nearest => {
                let mode = match op {
                    UnaryOp::Nearest => 0,
                    UnaryOp::Floor => 1,
                    UnaryOp::Ceil => 2,
                    _ => 3,
                };
                let (r, _) = alloc_result_reg(c, t, x, false);
                insn::rounds_rr(&mut c.text, t, r, r, mode);
                Operand::temp_reg(r, false)
            }

            UnaryOp::Sqrt => {
                let (r, _) = alloc_result_reg(c, t, x, false);
                insn::sse_scalar_rr(&mut c.text, t, 0x51, r, r);
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
                Add | Sub | Mul | Div => binary_float_common(c, op, t, a, b),
                Min | Max => binary_float_minmax(c, op, t, a, b),
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
        convert_op(c, op, to, from, x)
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
            insn::mov32_rr(&mut c.text, ireg, ireg);
        }

        let size = load_size(width, t);
        check_memory_bounds(c, ireg, offset, size);

        match t.category() {
            Category::Int => {
                let dst = if own {
                    ireg
                } else {
                    c.try_alloc_reg(t).unwrap_or(REG_RESULT)
                };
                let idx = Some((ireg, 0));
                let disp = offset as i32;
                let zero_ext = match width {
                    LoadWidth::Full => {
                        insn::mov_r_mem(&mut c.text, t, dst, REG_MEMORY_BASE, idx, disp);
                        t == ValueType::I32
                    }
                    LoadWidth::I8U => {
                        insn::widen_r_mem(&mut c.text, dst, REG_MEMORY_BASE, idx, disp, 1, false, false);
                        true
                    }
                    LoadWidth::I16U => {
                        insn::widen_r_mem(&mut c.text, dst, REG_MEMORY_BASE, idx, disp, 2, false, false);
                        true
                    }
                    LoadWidth::I32U => {
                        insn::widen_r_mem(&mut c.text, dst, REG_MEMORY_BASE, idx, disp, 4, false, false);
                        true
                    }
                    LoadWidth::I8S => {
                        let to64 = t == ValueType::I64;
                        insn::widen_r_mem(&mut c.text, dst, REG_MEMORY_BASE, idx, disp, 1, true, to64);
                        false
                    }
                    LoadWidth::I16S => {
                        let to64 = t == ValueType::I64;
                        insn::widen_r_mem(&mut c.text, dst, REG_MEMORY_BASE, idx, disp, 2, true, to64);
                        false
                    }
                    LoadWidth::I32S => {
                        insn::widen_r_mem(&mut c.text, dst, REG_MEMORY_BASE, idx, disp, 4, true, true);
                        false
                    }
                };
                Operand::temp_reg(dst, zero_ext)
            }
            Category::Float => {
                let dst = c.try_alloc_reg(t).unwrap_or(REG_RESULT);
                insn::movs_r_mem(&mut c.text, t, dst, REG_MEMORY_BASE, Some((ireg, 0)), offset as i32);
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
            insn::mov32_rr(&mut c.text, ireg, ireg);
        }

        let size = store_size(width, t);
        check_memory_bounds(c, ireg, offset, size);

        let (vreg, _, vown) = borrow_scratch_reg(c, t, value, false);
        match t.category() {
            Category::Int => {
                insn::mov_mem_r(&mut c.text, size, REG_MEMORY_BASE, Some((ireg, 0)), offset as i32, vreg);
            }
            Category::Float => {
                insn::movs_mem_r(&mut c.text, t, REG_MEMORY_BASE, Some((ireg, 0)), offset as i32, vreg);
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
                insn::cmp_stack_i8(&mut c.text, ValueType::I32, offset, 0);
                Condition::Ne
            }
            Operand::VarReg { reg, .. } | Operand::TempReg { reg, .. } => {
                insn::test_rr(&mut c.text, ValueType::I32, reg, reg);
                Condition::Ne
            }
            Operand::Stack => {
                // release the slot before the compare to keep the flags
                insn::alu_ri(&mut c.text, Alu::Add, ValueType::I64, REG_STACK_PTR, 8);
                insn::cmp_stack_i8(&mut c.text, ValueType::I32, -8, 0);
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

        match t.category() {
            Category::Int => {
                let code = cc(condition);
                match a {
                    Operand::VarMem { offset, .. } => {
                        insn::cmovcc_r_stack(&mut c.text, code, t, target, offset);
                    }
                    _ => {
                        let (areg, _, own) = borrow_scratch_reg(c, t, a, true);
                        insn::cmovcc_rr(&mut c.text, code, t, target, areg);
                        if own {
                            c.free_reg(t, areg);
                        }
                    }
                }
            }
            Category::Float => {
                let inverted = condition.invert();
                let not_cc = cc(inverted);

                let mut move_it = None;
                let mut ends = Vec::new();
                if inverted.is_unordered_or() {
                    move_it = Some(insn::jmp8_stub(&mut c.text, 0x7a)); // move it if unordered
                    ends.push(insn::jmp8_stub(&mut c.text, 0x70 + not_cc));
                } else if inverted.is_ordered_and() {
                    ends.push(insn::jmp8_stub(&mut c.text, 0x7a)); // break if unordered
                    ends.push(insn::jmp8_stub(&mut c.text, 0x70 + not_cc));
                } else {
                    ends.push(insn::jmp8_stub(&mut c.text, 0x70 + not_cc));
                }

                if let Some(site) = move_it {
                    bind_stub8(c, site);
                }
                Self::move_to_reg(c, t, target, a, false);
                for site in ends {
                    bind_stub8(c, site);
                }
            }
        }

        // cmov zero-extends the target unconditionally
        Operand::temp_reg(target, t.category() == Category::Int)
    }

    fn query_memory_size(c: &mut Coder<Self>) -> Operand {
        let reg = c.try_alloc_reg(ValueType::I32).unwrap_or(REG_RESULT);
        insn::mov_rr(&mut c.text, ValueType::I64, reg, REG_MEMORY_LIMIT);
        insn::alu_rr(&mut c.text, Alu::Sub, ValueType::I64, reg, REG_MEMORY_BASE);
        insn::shift_imm(&mut c.text, ValueType::I64, 5, reg, 16);
        Operand::temp_reg(reg, true)
    }

    fn grow_memory(c: &mut Coder<Self>, x: Operand) -> Operand {
        // byte delta in the scratch register
        Self::move_to_reg(c, ValueType::I32, REG_SCRATCH, x, false);
        insn::shift_imm(&mut c.text, ValueType::I64, 4, REG_SCRATCH, 16);

        let reg = c.try_alloc_reg(ValueType::I32).unwrap_or(REG_RESULT);
        insn::mov_rr(&mut c.text, ValueType::I64, reg, REG_MEMORY_LIMIT);
        insn::alu_rr(&mut c.text, Alu::Sub, ValueType::I64, reg, REG_MEMORY_BASE);

        insn::alu_rr(&mut c.text, Alu::Add, ValueType::I64, REG_SCRATCH, REG_MEMORY_LIMIT);
        insn::movq_r_mmx(&mut c.text, REG_DIVISOR, MMX_GROW_LIMIT);
        insn::alu_rr(&mut c.text, Alu::Cmp, ValueType::I64, REG_SCRATCH, REG_DIVISOR);
        insn::jmp8_raw(&mut c.text, 0x76, 5); // jbe over the trap call
        Self::trap(c, Trap::MemoryGrowLimit);

        insn::mov_rr(&mut c.text, ValueType::I64, REG_MEMORY_LIMIT, REG_SCRATCH);
        insn::shift_imm(&mut c.text, ValueType::I64, 5, reg, 16); // old size in pages
        Operand::temp_reg(reg, true)
    }

    fn branch(c: &mut Coder<Self>, addr: i32) -> i32 {
        insn::jmp_any(&mut c.text, 0xeb, &[0xe9], addr)
    }

    fn branch_if(c: &mut Coder<Self>, x: Operand, yes: bool, _near: bool, addr: i32) -> Vec<i32> {
        let mut cond = match x {
            Operand::Flags(cond) => cond,
            _ => {
                let (reg, _, own) = borrow_scratch_reg(c, ValueType::I32, x, false);
                insn::test_rr(&mut c.text, ValueType::I32, reg, reg);
                if own {
                    c.free_reg(ValueType::I32, reg);
                }
                Condition::Ne
            }
        };
        if !yes {
            cond = cond.invert();
        }

        let mut sites = Vec::new();
        let mut end = None;

        if cond.is_unordered_or() {
            sites.push(insn::jmp_any(&mut c.text, 0x7a, &[0x0f, 0x8a], addr));
        } else if cond.is_ordered_and() {
            end = Some(insn::jmp8_stub(&mut c.text, 0x7a));
        }

        let code = cc(cond);
        sites.push(insn::jmp_any(
            &mut c.text,
            0x70 + code,
            &[0x0f, 0x80 + code],
            addr,
        ));

        if let Some(site) = end {
            bind_stub8(c, site);
        }
        sites
    }

    fn branch_if_out_of_bounds(c: &mut Coder<Self>, index_reg: Reg, upper: i32, addr: i32) -> i32 {
        compare_bounds(c, index_reg, upper);
        insn::jmp_any(&mut c.text, 0x7e, &[0x0f, 0x8e], addr) // jle
    }

    fn branch_indirect32(c: &mut Coder<Self>, r: Reg, zero_ext: bool) {
        if !zero_ext {
            insn::mov32_rr(&mut c.text, r, r);
        }
        insn::alu_rr(&mut c.text, Alu::Add, ValueType::I64, r, REG_TEXT_BASE);
        insn::jmp_r(&mut c.text, r);
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
            insn::mov32_rr(&mut c.text, r, r);
        }
        let disp = c.rodata_addr() + rodata_offset;
        insn::mov_r_mem(&mut c.text, t, r, REG_TEXT_BASE, Some((r, scale)), disp);
        true
    }

    fn call(c: &mut Coder<Self>, addr: i32) -> i32 {
        if addr == 0 {
            Self::call_missing(c)
        } else {
            insn::call_rel32(&mut c.text, addr)
        }
    }

    fn call_missing(c: &mut Coder<Self>) -> i32 {
        // the displacement slot must be word-aligned for atomic patching
        align_call_disp(c);
        insn::call_missing(&mut c.text)
    }

    fn call_indirect(c: &mut Coder<Self>, sig_index: u32, func_index_reg: Reg) -> i32 {
        let r = func_index_reg;

        let table_len = c.table_len() as i32;
        compare_bounds(c, r, table_len);
        let out_of_bounds = insn::jmp8_stub(&mut c.text, 0x7e); // jle

        let table_disp = c.rodata_addr() + TABLE_ADDR;
        insn::mov_r_mem(&mut c.text, ValueType::I64, r, REG_TEXT_BASE, Some((r, 3)), table_disp);
        insn::mov32_rr(&mut c.text, REG_SCRATCH, r); // zero-extended function address
        insn::shift_imm(&mut c.text, ValueType::I64, 5, r, 32); // signature index
        insn::alu_ri(&mut c.text, Alu::Cmp, ValueType::I32, r, sig_index as i32);
        let checks_out = insn::jmp8_stub(&mut c.text, 0x74); // je

        Self::trap(c, Trap::IndirectCallSignature);

        bind_stub8(c, out_of_bounds);
        Self::trap(c, Trap::IndirectCallIndex);

        bind_stub8(c, checks_out);
        insn::alu_rr(&mut c.text, Alu::Add, ValueType::I64, REG_SCRATCH, REG_TEXT_BASE);
        insn::call_r(&mut c.text, REG_SCRATCH);
        let ret_addr = c.text.addr();
        c.map_call_site_here();
        ret_addr
    }

    fn setup_stack_frame(c: &mut Coder<Self>) -> i32 {
        // stack reservation with a placeholder displacement
        insn::lea_stack(&mut c.text, REG_SCRATCH, i32::MIN, true);
        let site = c.text.addr();

        insn::alu_rr(&mut c.text, Alu::Cmp, ValueType::I64, REG_SCRATCH, REG_STACK_LIMIT);
        let checked = insn::jmp8_stub(&mut c.text, 0x7d); // jge
        Self::trap(c, Trap::CallStackExhausted);
        bind_stub8(c, checked);
        site
    }

    fn ret(c: &mut Coder<Self>, num_stack_values: i32) {
        if num_stack_values != 0 {
            insn::alu_ri(
                &mut c.text,
                Alu::Add,
                ValueType::I64,
                REG_STACK_PTR,
                num_stack_values * 8,
            );
        }
        insn::ret(&mut c.text);
    }

    fn trap(c: &mut Coder<Self>, id: Trap) {
        let addr = c.trap_stub_addr(id);
        insn::call_rel32(&mut c.text, addr);
        c.map_call_site_here();
    }

    fn abort(c: &mut Coder<Self>) {
        insn::int3(&mut c.text);
    }

    fn update_branches(text: &mut [u8], l: &Label) {
        let addr = l.final_addr();
        for &site in &l.sites {
            put_u32(text, site - 4, (addr - site) as u32);
        }
    }

    fn update_calls(text: &mut [u8], l: &Label) {
        let addr = l.final_addr();
        for &site in &l.sites {
            atomic_put_u32(text, site - 4, (addr - site) as u32);
        }
    }

    fn update_stack_check(text: &mut [u8], site: i32, max_stack: i32) {
        put_u32(text, site - 4, (-max_stack) as u32);
    }

    fn delete_code(text: &mut [u8], start: i32, end: i32) {
        text[start as usize..end as usize].fill(0xcc);
    }

    fn disable_code(text: &mut [u8], start: i32, end: i32) {
        text[start as usize..end as usize].fill(0x90);
    }
}

/// Bounds pattern shared by table dispatch: a negative index is first
/// clamped to the upper bound so one signed compare rejects both ends.
fn compare_bounds(c: &mut Coder<X86_64>, index_reg: Reg, upper: i32) {
    insn::mov_ri(&mut c.text, ValueType::I32, REG_SCRATCH, upper as i64);
    insn::test_rr(&mut c.text, ValueType::I32, index_reg, index_reg);
    insn::cmovcc_rr(&mut c.text, 0xc, ValueType::I32, index_reg, REG_SCRATCH); // cmovl
    insn::alu_rr(&mut c.text, Alu::Cmp, ValueType::I32, REG_SCRATCH, index_reg);
}

/// Emit the linear-memory bounds check: trap unless
/// `memory_base + index + offset + size <= memory_limit`.
fn check_memory_bounds(c: &mut Coder<X86_64>, index_reg: Reg, offset: u32, size: u32) {
    let bound = if index_reg == REG_SCRATCH {
        REG_RESULT
    } else {
        REG_SCRATCH
    };
    let end_disp = (offset + size) as i32;
    insn::lea_mem(&mut c.text, bound, REG_MEMORY_BASE, index_reg, end_disp);
    insn::alu_rr(&mut c.text, Alu::Cmp, ValueType::I64, bound, REG_MEMORY_LIMIT);
    insn::jmp8_raw(&mut c.text, 0x76, 5); // jbe over the trap call
    X86_64::trap(c, Trap::MemoryAccessOutOfBounds);
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

fn binary_int_al(
    c: &mut Coder<X86_64>,
    op: BinaryOp,
    t: ValueType,
    a: Operand,
    b: Operand,
) -> Operand {
    let alu = match op {
        BinaryOp::Add => Alu::Add,
        BinaryOp::Sub => Alu::Sub,
        BinaryOp::And => Alu::And,
        BinaryOp::Or => Alu::Or,
        BinaryOp::Xor => Alu::Xor,
        _ => unreachable!(),
    };

    if op == BinaryOp::Sub && a.check_imm_value(t) == Some(0) {
        let (r, _) = alloc_result_reg(c, t, b, false);
        insn::neg_r(&mut c.text, t, r);
        return Operand::temp_reg(r, t == ValueType::I32);
    }

    if let Some(value) = b.check_imm_value(t) {
        if value == 1 && matches!(op, BinaryOp::Add | BinaryOp::Sub) {
            let (r, _) = alloc_result_reg(c, t, a, false);
            if op == BinaryOp::Add {
                insn::inc_r(&mut c.text, t, r);
            } else {
                insn::dec_r(&mut c.text, t, r);
            }
            return Operand::temp_reg(r, t == ValueType::I32);
        }
        if (-0x8000_0000..0x8000_0000).contains(&value) {
            let (r, _) = alloc_result_reg(c, t, a, false);
            insn::alu_ri(&mut c.text, alu, t, r, value as i32);
            return Operand::temp_reg(r, t == ValueType::I32);
        }
    }

    let (breg, _, bown) = borrow_scratch_reg(c, t, b, false);
    let (r, _) = alloc_result_reg(c, t, a, false);
    insn::alu_rr(&mut c.text, alu, t, r, breg);
    if bown {
        c.free_reg(t, breg);
    }
    Operand::temp_reg(r, t == ValueType::I32)
}

fn binary_int_mul(c: &mut Coder<X86_64>, t: ValueType, a: Operand, b: Operand) -> Operand {
    let (breg, _, bown) = borrow_scratch_reg(c, t, b, false);
    let (r, _) = alloc_result_reg(c, t, a, false);
    insn::imul_rr(&mut c.text, t, r, breg);
    if bown {
        c.free_reg(t, breg);
    }
    Operand::temp_reg(r, t == ValueType::I32)
}

fn binary_int_divmod(
    c: &mut Coder<X86_64>,
    op: BinaryOp,
    t: ValueType,
    a: Operand,
    b: Operand,
) -> Operand {
    let signed = matches!(op, BinaryOp::DivS | BinaryOp::RemS);
    let remainder = matches!(op, BinaryOp::RemS | BinaryOp::RemU);

    let mut check_zero = true;
    let mut check_overflow = signed;
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

    // the divisor must stay clear of rax/rdx (dividend and high half)
    let mut divisor = REG_DIVISOR;
    let mut free_divisor = false;
    match b.check_any_reg() {
        Some(r) if r != REG_RESULT && r != REG_SCRATCH => {
            divisor = r;
            free_divisor = b.check_temp_reg().is_some();
        }
        _ => {
            X86_64::move_to_reg(c, t, REG_DIVISOR, b, false);
        }
    }

    X86_64::move_to_reg(c, t, REG_RESULT, a, false);

    if check_zero {
        insn::test_rr(&mut c.text, t, divisor, divisor);
        insn::jmp8_raw(&mut c.text, 0x75, 5); // jne over the trap call
        X86_64::trap(c, Trap::IntegerDivideByZero);
    }

    if signed {
        if check_overflow && remainder {
            // dividing by -1 cannot overflow the remainder: it is zero
            insn::alu_ri(&mut c.text, Alu::Cmp, t, divisor, -1);
            let do_divide = insn::jmp8_stub(&mut c.text, 0x75); // jne
            insn::alu_rr(&mut c.text, Alu::Xor, ValueType::I32, REG_SCRATCH, REG_SCRATCH);
            let done = insn::jmp8_stub(&mut c.text, 0xeb);
            bind_stub8(c, do_divide);
            insn::cdq_cqo(&mut c.text, t);
            insn::mul_div_r(&mut c.text, t, 7, divisor);
            bind_stub8(c, done);
        } else {
            if check_overflow {
                if t == ValueType::I32 {
                    insn::alu_ri(&mut c.text, Alu::Cmp, t, REG_RESULT, i32::MIN);
                } else {
                    let disp = mask80_addr(c, ValueType::F64);
                    insn::alu_r_mem(&mut c.text, Alu::Cmp, t, REG_RESULT, REG_TEXT_BASE, disp);
                }
                let ok_dividend = insn::jmp8_stub(&mut c.text, 0x75); // jne
                insn::alu_ri(&mut c.text, Alu::Cmp, t, divisor, -1);
                let ok_divisor = insn::jmp8_stub(&mut c.text, 0x75); // jne
                X86_64::trap(c, Trap::IntegerOverflow);
                bind_stub8(c, ok_dividend);
                bind_stub8(c, ok_divisor);
            }
            insn::cdq_cqo(&mut c.text, t);
            insn::mul_div_r(&mut c.text, t, 7, divisor);
        }
    } else {
        insn::alu_rr(&mut c.text, Alu::Xor, ValueType::I32, REG_SCRATCH, REG_SCRATCH);
        insn::mul_div_r(&mut c.text, t, 6, divisor);
    }

    if free_divisor {
        c.free_reg(t, divisor);
    }
    if remainder {
        insn::mov_rr(&mut c.text, t, REG_RESULT, REG_SCRATCH);
    }
    Operand::temp_reg(REG_RESULT, t == ValueType::I32)
}

fn binary_int_shift(
    c: &mut Coder<X86_64>,
    op: BinaryOp,
    t: ValueType,
    a: Operand,
    b: Operand,
) -> Operand {
    let ext = match op {
        BinaryOp::Rotl => 0,
        BinaryOp::Rotr => 1,
        BinaryOp::Shl => 4,
        BinaryOp::ShrU => 5,
        BinaryOp::ShrS => 7,
        _ => unreachable!(),
    };
    let bits = t.size() * 8;

    if let Some(value) = b.check_imm_value(ValueType::I32) {
        let (r, _) = alloc_result_reg(c, t, a, false);
        insn::shift_imm(&mut c.text, t, ext, r, (value as u32 % bits) as u8);
        return Operand::temp_reg(r, t == ValueType::I32);
    }

    // variable count goes through cl; the hardware masks it
    X86_64::move_to_reg(c, ValueType::I32, REG_DIVISOR, b, false);
    let (r, _) = alloc_result_reg(c, t, a, false);
    insn::shift_cl(&mut c.text, t, ext, r);
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
    c: &mut Coder<X86_64>,
    op: BinaryOp,
    t: ValueType,
    a: Operand,
    b: Operand,
) -> Operand {
    if b == Operand::Stack {
        // both pushed; b is on top
        insn::pop_r(&mut c.text, REG_SCRATCH);
        c.consumed(t, Operand::Stack);
        X86_64::move_to_reg(c, t, REG_RESULT, a, false);
        insn::alu_rr(&mut c.text, Alu::Cmp, t, REG_RESULT, REG_SCRATCH);
    } else {
        X86_64::move_to_reg(c, t, REG_RESULT, a, false);
        match b {
            Operand::Imm(_) if (-0x8000_0000..0x8000_0000).contains(&b.imm_value(t)) => {
                insn::alu_ri(&mut c.text, Alu::Cmp, t, REG_RESULT, b.imm_value(t) as i32);
            }
            Operand::VarReg { reg, .. } | Operand::TempReg { reg, .. } => {
                insn::alu_rr(&mut c.text, Alu::Cmp, t, REG_RESULT, reg);
                c.consumed(t, b);
            }
            _ => {
                X86_64::move_to_reg(c, t, REG_SCRATCH, b, false);
                insn::alu_rr(&mut c.text, Alu::Cmp, t, REG_RESULT, REG_SCRATCH);
            }
        }
    }
    Operand::Flags(int_cmp_condition(op))
}

fn binary_float_common(
    c: &mut Coder<X86_64>,
    op: BinaryOp,
    t: ValueType,
    a: Operand,
    b: Operand,
) -> Operand {
    let opcode = match op {
        BinaryOp::Add => 0x58,
        BinaryOp::Mul => 0x59,
        BinaryOp::Sub => 0x5c,
        BinaryOp::Div => 0x5e,
        _ => unreachable!(),
    };
    let (r, _) = alloc_result_reg(c, t, a, false);
    let (s, _, own) = borrow_scratch_reg(c, t, b, false);
    insn::sse_scalar_rr(&mut c.text, t, opcode, r, s);
    if own {
        c.free_reg(t, s);
    }
    Operand::temp_reg(r, false)
}

fn binary_float_minmax(
    c: &mut Coder<X86_64>,
    op: BinaryOp,
    t: ValueType,
    a: Operand,
    b: Operand,
) -> Operand {
    // equal operands need the bitwise op so min(-0, +0) picks -0
    let (common_op, zero_op) = match op {
        BinaryOp::Min => (0x5du8, 0x56u8), // minss/orps
        BinaryOp::Max => (0x5f, 0x54),     // maxss/andps
        _ => unreachable!(),
    };
    let (r, _) = alloc_result_reg(c, t, a, false);
    let (s, _, own) = borrow_scratch_reg(c, t, b, false);

    insn::ucomis_rr(&mut c.text, t, r, s);
    let distinct = insn::jmp8_stub(&mut c.text, 0x75); // jne
    insn::sse_packed_rr(&mut c.text, zero_op, r, s);
    let done = insn::jmp8_stub(&mut c.text, 0xeb);
    bind_stub8(c, distinct);
    insn::sse_scalar_rr(&mut c.text, t, common_op, r, s);
    bind_stub8(c, done);

    if own {
        c.free_reg(t, s);
    }
    Operand::temp_reg(r, false)
}

fn binary_float_copysign(c: &mut Coder<X86_64>, t: ValueType, a: Operand, b: Operand) -> Operand {
    let it = int_type(t);
    let (r, _) = alloc_result_reg(c, t, a, false);
    let (s, _, own) = borrow_scratch_reg(c, t, b, false);
    let mask_disp = mask80_addr(c, t);

    insn::movd_r_x(&mut c.text, it, REG_SCRATCH, s);
    insn::alu_r_mem(&mut c.text, Alu::And, it, REG_SCRATCH, REG_TEXT_BASE, mask_disp);
    insn::movd_r_x(&mut c.text, it, REG_RESULT, r);
    insn::alu_r_mem(&mut c.text, Alu::And, it, REG_RESULT, REG_TEXT_BASE, mask_disp);
    insn::alu_rr(&mut c.text, Alu::Cmp, it, REG_RESULT, REG_SCRATCH);
    let done = insn::jmp8_stub(&mut c.text, 0x74); // je: signs agree

    load_float_mask(c, t, mask_disp);
    insn::sse_packed_rr(&mut c.text, 0x57, r, REG_SCRATCH); // xorps
    bind_stub8(c, done);

    if own {
        c.free_reg(t, s);
    }
    Operand::temp_reg(r, false)
}

fn binary_float_cmp(
    c: &mut Coder<X86_64>,
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
    insn::ucomis_rr(&mut c.text, t, r, s);
    if own {
        c.free_reg(t, s);
    }
    if c.is_reg_allocated(t, r) {
        c.free_reg(t, r);
    }
    Operand::Flags(cond)
}

fn convert_op(
    c: &mut Coder<X86_64>,
    op: ConvertOp,
    to: ValueType,
    from: ValueType,
    x: Operand,
) -> Operand {
    match op {
        ConvertOp::Wrap => {
            let (r, _) = alloc_result_reg(c, from, x, false);
            insn::mov32_rr(&mut c.text, r, r);
            Operand::temp_reg(r, true)
        }

        ConvertOp::ExtendS => {
            let (r, _) = alloc_result_reg(c, from, x, false);
            insn::movsxd_rr(&mut c.text, r, r);
            Operand::temp_reg(r, false)
        }

        ConvertOp::ExtendU => {
            let (r, zero_ext) = alloc_result_reg(c, from, x, false);
            if !zero_ext {
                insn::mov32_rr(&mut c.text, r, r);
            }
            Operand::temp_reg(r, true)
        }

        ConvertOp::TruncS => {
            let (s, _, own) = borrow_scratch_reg(c, from, x, false);
            let r = c.try_alloc_reg(to).unwrap_or(REG_RESULT);
            insn::cvtts2si_r_x(&mut c.text, from, to, r, s);
            if own {
                c.free_reg(from, s);
            }
            Operand::temp_reg(r, to == ValueType::I32)
        }

        ConvertOp::TruncU => {
            if to == ValueType::I32 {
                // a 64-bit truncation covers the whole u32 range
                let (s, _, own) = borrow_scratch_reg(c, from, x, false);
                let r = c.try_alloc_reg(to).unwrap_or(REG_RESULT);
                insn::cvtts2si_r_x(&mut c.text, from, ValueType::I64, r, s);
                if own {
                    c.free_reg(from, s);
                }
                Operand::temp_reg(r, true)
            } else {
                convert_trunc_u64(c, from, x)
            }
        }

        ConvertOp::ConvertS => {
            let (s, _, own) = borrow_scratch_reg(c, from, x, false);
            let r = c.try_alloc_reg(to).unwrap_or(REG_RESULT);
            insn::cvtsi2s_x_r(&mut c.text, to, from, r, s);
            if own {
                c.free_reg(from, s);
            }
            Operand::temp_reg(r, false)
        }

        ConvertOp::ConvertU => {
            if from == ValueType::I32 {
                // zero-extend, then convert as a 64-bit signed value
                X86_64::move_to_reg(c, ValueType::I32, REG_SCRATCH, x, false);
                let r = c.try_alloc_reg(to).unwrap_or(REG_RESULT);
                insn::cvtsi2s_x_r(&mut c.text, to, ValueType::I64, r, REG_SCRATCH);
                Operand::temp_reg(r, false)
            } else {
                convert_u64_to_float(c, to, x)
            }
        }

        ConvertOp::Demote => {
            let (r, _) = alloc_result_reg(c, from, x, false);
            insn::cvts2s_rr(&mut c.text, ValueType::F64, r, r);
            Operand::temp_reg(r, false)
        }

        ConvertOp::Promote => {
            let (r, _) = alloc_result_reg(c, from, x, false);
            insn::cvts2s_rr(&mut c.text, ValueType::F32, r, r);
            Operand::temp_reg(r, false)
        }

        ConvertOp::Reinterpret => {
            let (s, _, own) = borrow_scratch_reg(c, from, x, false);
            let r = c.try_alloc_reg(to).unwrap_or(REG_RESULT);
            match to.category() {
                Category::Float => insn::movd_x_r(&mut c.text, from, r, s),
                Category::Int => insn::movd_r_x(&mut c.text, to, r, s),
            }
            if own {
                c.free_reg(from, s);
            }
            let zero_ext = to == ValueType::I32;
            Operand::temp_reg(r, zero_ext)
        }
    }
}

/// Truncate a float to u64: values at or above 2^63 are shifted down by
/// the threshold before conversion and the sign bit is restored after.
fn convert_trunc_u64(c: &mut Coder<X86_64>, from: ValueType, x: Operand) -> Operand {
    X86_64::move_to_reg(c, from, REG_SCRATCH, x, false);

    let thr = c.try_alloc_reg(from).unwrap_or(REG_RESULT);
    let thr_disp = c.rodata_addr()
        + if from == ValueType::F32 {
            MASK_5F00_ADDR_32
        } else {
            MASK_43E0_ADDR_64
        };
    insn::movs_r_mem(&mut c.text, from, thr, REG_TEXT_BASE, None, thr_disp);

    let r = c.try_alloc_reg(ValueType::I64).unwrap_or(REG_RESULT);

    insn::ucomis_rr(&mut c.text, from, REG_SCRATCH, thr);
    let big = insn::jmp8_stub(&mut c.text, 0x73); // jae
    insn::cvtts2si_r_x(&mut c.text, from, ValueType::I64, r, REG_SCRATCH);
    let done = insn::jmp8_stub(&mut c.text, 0xeb);

    bind_stub8(c, big);
    insn::sse_scalar_rr(&mut c.text, from, 0x5c, REG_SCRATCH, thr); // subtract 2^63
    insn::cvtts2si_r_x(&mut c.text, from, ValueType::I64, r, REG_SCRATCH);
    insn::mov_ri(&mut c.text, ValueType::I64, REG_SCRATCH, i64::MIN);
    insn::alu_rr(&mut c.text, Alu::Xor, ValueType::I64, r, REG_SCRATCH);
    bind_stub8(c, done);

    if c.is_reg_allocated(from, thr) {
        c.free_reg(from, thr);
    }
    Operand::temp_reg(r, false)
}

/// Convert u64 to float: large values are halved with a sticky rounding
/// bit, converted, and doubled.
fn convert_u64_to_float(c: &mut Coder<X86_64>, to: ValueType, x: Operand) -> Operand {
    X86_64::move_to_reg(c, ValueType::I64, REG_SCRATCH, x, false);
    let r = c.try_alloc_reg(to).unwrap_or(REG_RESULT);

    insn::test_rr(&mut c.text, ValueType::I64, REG_SCRATCH, REG_SCRATCH);
    let big = insn::jmp8_stub(&mut c.text, 0x78); // js
    insn::cvtsi2s_x_r(&mut c.text, to, ValueType::I64, r, REG_SCRATCH);
    let done = insn::jmp8_stub(&mut c.text, 0xeb);

    bind_stub8(c, big);
    insn::mov_rr(&mut c.text, ValueType::I64, REG_RESULT, REG_SCRATCH);
    insn::shift_imm(&mut c.text, ValueType::I64, 5, REG_RESULT, 1);
    insn::alu_ri(&mut c.text, Alu::And, ValueType::I64, REG_SCRATCH, 1);
    insn::alu_rr(&mut c.text, Alu::Or, ValueType::I64, REG_RESULT, REG_SCRATCH);
    insn::cvtsi2s_x_r(&mut c.text, to, ValueType::I64, r, REG_RESULT);
    insn::sse_scalar_rr(&mut c.text, to, 0x58, r, r); // double it
    bind_stub8(c, done);

    Operand::temp_reg(r, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Module;

    fn coder(module: &Module) -> Coder<'_, X86_64> {
        Coder::new(module, 0x1000_0000)
    }

    #[test]
    fn test_trap_stub_fits_alignment() {
        let module = Module::default();
        let mut c = coder(&module);
        X86_64::jump_to_trap_handler(&mut c, Trap::Unreachable);
        assert!(c.text.len() <= 16);
        // mov eax, 9; movq rdx, mm0; jmp rdx
        assert_eq!(
            c.text.bytes(),
            &[0xc7, 0xc0, 9, 0, 0, 0, 0x48, 0x0f, 0x7e, 0xc2, 0xff, 0xe2]
        );
    }

    #[test]
    fn test_exit_stub_packs_status() {
        let module = Module::default();
        let mut c = coder(&module);
        X86_64::jump_to_trap_handler(&mut c, Trap::Exit);
        assert!(c.text.len() <= 16);
        // shl rax, 32; or rax, 1; movq rdx, mm0; jmp rdx
        assert_eq!(
            &c.text.bytes()[..8],
            &[0x48, 0xc1, 0xe0, 0x20, 0x48, 0x83, 0xc8, 0x01]
        );
    }

    #[test]
    fn test_move_imm_zero_is_xor() {
        let module = Module::default();
        let mut c = coder(&module);
        let zx = X86_64::move_to_reg(&mut c, ValueType::I32, Reg(3), Operand::Imm(0), false);
        assert!(zx);
        // xor ebx, ebx
        assert_eq!(c.text.bytes(), &[0x33, 0xdb]);
    }

    #[test]
    fn test_move_imm_zero_preserving_flags() {
        let module = Module::default();
        let mut c = coder(&module);
        X86_64::move_to_reg(&mut c, ValueType::I32, Reg(3), Operand::Imm(0), true);
        // mov ebx, 0 keeps the flags
        assert_eq!(c.text.bytes(), &[0xc7, 0xc3, 0, 0, 0, 0]);
    }

    #[test]
    fn test_flags_materialization() {
        let module = Module::default();
        let mut c = coder(&module);
        let zx = X86_64::move_to_reg(
            &mut c,
            ValueType::I32,
            Reg(3),
            Operand::Flags(Condition::Eq),
            false,
        );
        assert!(zx);
        // sete bl; movzx ebx, bl
        assert_eq!(c.text.bytes(), &[0x0f, 0x94, 0xc3, 0x0f, 0xb6, 0xdb]);
    }

    #[test]
    fn test_stack_frame_setup_reserves_disp32() {
        let module = Module::default();
        let mut c = coder(&module);
        c.trap_links[Trap::CallStackExhausted.id() as usize].bind(0x30);
        let site = X86_64::setup_stack_frame(&mut c);
        // lea rdx, [rsp+disp32] starts the function
        assert_eq!(&c.text.bytes()[..4], &[0x48, 0x8d, 0x94, 0x24]);
        assert_eq!(site, 8);
        // patching rewrites the displacement with the negated stack size
        X86_64::update_stack_check(c.text.bytes_mut(), site, 0x40);
        assert_eq!(&c.text.bytes()[4..8], &(-0x40i32).to_le_bytes());
    }

    #[test]
    fn test_call_placeholder_is_word_aligned() {
        let module = Module::default();
        let mut c = coder(&module);
        c.text.put_byte(0x90);
        let site = X86_64::call_missing(&mut c);
        assert_eq!(site % 4, 0);
        // displacement reaches text address zero
        let disp = i32::from_le_bytes(
            c.text.bytes()[site as usize - 4..site as usize]
                .try_into()
                .unwrap(),
        );
        assert_eq!(site + disp, 0);
    }

    #[test]
    fn test_branch_if_flags_eq() {
        let module = Module::default();
        let mut c = coder(&module);
        let sites = X86_64::branch_if(&mut c, Operand::Flags(Condition::Eq), true, false, 0);
        assert_eq!(sites.len(), 1);
        // je rel32 placeholder
        assert_eq!(&c.text.bytes()[..2], &[0x0f, 0x84]);
    }

    #[test]
    fn test_update_calls_patches_displacement() {
        let module = Module::default();
        let mut c = coder(&module);
        c.text.put_bytes(&[0x90, 0x90, 0x90]);
        let site = X86_64::call_missing(&mut c);
        let mut label = Label::new();
        label.add_site(site);
        label.bind(0x40);
        X86_64::update_calls(c.text.bytes_mut(), &label);
        let disp = i32::from_le_bytes(
            c.text.bytes()[site as usize - 4..site as usize]
                .try_into()
                .unwrap(),
        );
        assert_eq!(site + disp, 0x40);
    }
}
