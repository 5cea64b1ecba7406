//! x86-64 instruction encoding.
//!
//! Emitters append directly to the text buffer.  Operand-size selection
//! follows the value type: 32-bit forms for I32/F32, REX.W forms for
//! I64/F64.  32-bit register writes zero-extend implicitly.

use crate::codegen::regalloc::Reg;
use crate::codegen::textbuf::TextBuffer;
use crate::types::ValueType;

pub const REG_STACK_PTR: u8 = 4; // rsp

/// Multi-byte NOP sequences indexed by length - 1.
pub const NOP_SEQUENCES: [&[u8]; 9] = [
    &[0x90],
    &[0x66, 0x90],
    &[0x0f, 0x1f, 0x00],
    &[0x0f, 0x1f, 0x40, 0x00],
    &[0x0f, 0x1f, 0x44, 0x00, 0x00],
    &[0x66, 0x0f, 0x1f, 0x44, 0x00, 0x00],
    &[0x0f, 0x1f, 0x80, 0x00, 0x00, 0x00, 0x00],
    &[0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
    &[0x66, 0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
];

// ==================== prefixes and ModR/M ====================

fn rex_w(t: ValueType) -> bool {
    t.size() == 8
}

/// Emit a REX prefix if any of its bits are needed.  `force` emits the
/// bare 0x40 prefix even without extension bits (uniform byte registers).
fn put_rex(text: &mut TextBuffer, w: bool, ro: u8, index: u8, rm: u8, force: bool) {
    let mut rex = 0x40u8;
    if w {
        rex |= 0x08;
    }
    if ro >= 8 {
        rex |= 0x04;
    }
    if index >= 8 {
        rex |= 0x02;
    }
    if rm >= 8 {
        rex |= 0x01;
    }
    if rex != 0x40 || force {
        text.put_byte(rex);
    }
}

fn modrm(mode: u8, ro: u8, rm: u8) -> u8 {
    (mode << 6) | ((ro & 7) << 3) | (rm & 7)
}

fn sib(scale_log: u8, index: u8, base: u8) -> u8 {
    (scale_log << 6) | ((index & 7) << 3) | (base & 7)
}

/// Register-register form: prefix, opcode, ModRM with mode 11.
fn op_reg_reg(text: &mut TextBuffer, opcode: &[u8], w: bool, ro: u8, rm: u8) {
    put_rex(text, w, ro, 0, rm, false);
    text.put_bytes(opcode);
    text.put_byte(modrm(0b11, ro, rm));
}

/// Memory operand `[base + index<<scale + disp]`.  rsp/r12 bases take a
/// SIB byte; rbp/r13 bases always carry a displacement.
fn put_mem(
    text: &mut TextBuffer,
    ro: u8,
    base: u8,
    index: Option<(u8, u8)>, // (register, scale_log)
    disp: i32,
    force_disp32: bool,
) {
    let need_disp = (base & 7) == 5; // rbp/r13
    let (mode, disp_size) = if force_disp32 || disp < -0x80 || disp >= 0x80 {
        (0b10, 4)
    } else if disp != 0 || need_disp {
        (0b01, 1)
    } else {
        (0b00, 0)
    };

    let need_sib = index.is_some() || (base & 7) == 4; // rsp/r12
    if need_sib {
        let (idx, scale_log) = index.unwrap_or((4, 0)); // index 100 = none
        text.put_byte(modrm(mode, ro, 0b100));
        text.put_byte(sib(scale_log, idx, base));
    } else {
        text.put_byte(modrm(mode, ro, base));
    }

    match disp_size {
        1 => text.put_byte(disp as u8),
        4 => text.put_u32(disp as u32),
        _ => {}
    }
}

/// Register-memory form with an optional scaled index.
fn op_reg_mem(
    text: &mut TextBuffer,
    opcode: &[u8],
    w: bool,
    ro: u8,
    base: u8,
    index: Option<(u8, u8)>,
    disp: i32,
    force_disp32: bool,
) {
    let idx = index.map_or(0, |(r, _)| r);
    put_rex(text, w, ro, idx, base, false);
    text.put_bytes(opcode);
    put_mem(text, ro, base, index, disp, force_disp32);
}

// ==================== data movement ====================

/// MOV reg, reg (RM form).
pub fn mov_rr(text: &mut TextBuffer, t: ValueType, dst: Reg, src: Reg) {
    op_reg_reg(text, &[0x8b], rex_w(t), dst.0, src.0);
}

/// MOV r32, r32; zero-extends the destination.
pub fn mov32_rr(text: &mut TextBuffer, dst: Reg, src: Reg) {
    op_reg_reg(text, &[0x8b], false, dst.0, src.0);
}

/// MOV reg, imm in the shortest usable form.
pub fn mov_ri(text: &mut TextBuffer, t: ValueType, dst: Reg, value: i64) {
    if (-0x8000_0000..0x8000_0000).contains(&value) {
        // sign-extended imm32
        put_rex(text, rex_w(t), 0, 0, dst.0, false);
        text.put_byte(0xc7);
        text.put_byte(modrm(0b11, 0, dst.0));
        text.put_u32(value as u32);
    } else if t.size() == 8 && (0..0x1_0000_0000).contains(&value) {
        // mov r32, imm32 zero-extends
        put_rex(text, false, 0, 0, dst.0, false);
        text.put_byte(0xb8 + (dst.0 & 7));
        text.put_u32(value as u32);
    } else {
        put_rex(text, true, 0, 0, dst.0, false);
        text.put_byte(0xb8 + (dst.0 & 7));
        text.put_u64(value as u64);
    }
}

/// MOV reg, [rsp + disp].
pub fn mov_r_stack(text: &mut TextBuffer, t: ValueType, dst: Reg, disp: i32) {
    op_reg_mem(text, &[0x8b], rex_w(t), dst.0, REG_STACK_PTR, None, disp, false);
}

/// MOV [rsp + disp], reg.
pub fn mov_stack_r(text: &mut TextBuffer, t: ValueType, disp: i32, src: Reg) {
    op_reg_mem(text, &[0x89], rex_w(t), src.0, REG_STACK_PTR, None, disp, false);
}

/// MOV reg, [base + index<<scale + disp].
pub fn mov_r_mem(
    text: &mut TextBuffer,
    t: ValueType,
    dst: Reg,
    base: Reg,
    index: Option<(Reg, u8)>,
    disp: i32,
) {
    let index = index.map(|(r, s)| (r.0, s));
    op_reg_mem(text, &[0x8b], rex_w(t), dst.0, base.0, index, disp, false);
}

/// MOV [base + index<<scale + disp], reg, at the given access width.
pub fn mov_mem_r(
    text: &mut TextBuffer,
    size: u32,
    base: Reg,
    index: Option<(Reg, u8)>,
    disp: i32,
    src: Reg,
) {
    let index = index.map(|(r, s)| (r.0, s));
    let idx = index.map_or(0, |(r, _)| r);
    match size {
        1 => {
            // uniform byte registers need a bare REX
            put_rex(text, false, src.0, idx, base.0, src.0 >= 4);
            text.put_byte(0x88);
            put_mem(text, src.0, base.0, index, disp, false);
        }
        2 => {
            text.put_byte(0x66);
            op_reg_mem(text, &[0x89], false, src.0, base.0, index, disp, false);
        }
        4 => op_reg_mem(text, &[0x89], false, src.0, base.0, index, disp, false),
        8 => op_reg_mem(text, &[0x89], true, src.0, base.0, index, disp, false),
        _ => panic!("bad store width {size}"),
    }
}

/// MOVZX / MOVSX / MOVSXD family: sub-word load widened into `dst`.
pub fn widen_r_mem(
    text: &mut TextBuffer,
    dst: Reg,
    base: Reg,
    index: Option<(Reg, u8)>,
    disp: i32,
    mem_size: u32,
    sign: bool,
    to64: bool,
) {
    let index = index.map(|(r, s)| (r.0, s));
    match (mem_size, sign) {
        (1, false) => op_reg_mem(text, &[0x0f, 0xb6], false, dst.0, base.0, index, disp, false),
        (2, false) => op_reg_mem(text, &[0x0f, 0xb7], false, dst.0, base.0, index, disp, false),
        (1, true) => op_reg_mem(text, &[0x0f, 0xbe], to64, dst.0, base.0, index, disp, false),
        (2, true) => op_reg_mem(text, &[0x0f, 0xbf], to64, dst.0, base.0, index, disp, false),
        (4, false) => op_reg_mem(text, &[0x8b], false, dst.0, base.0, index, disp, false),
        (4, true) => op_reg_mem(text, &[0x63], true, dst.0, base.0, index, disp, false),
        _ => panic!("bad load width {mem_size}"),
    }
}

/// MOVZX r32, r8.
pub fn movzx8_rr(text: &mut TextBuffer, dst: Reg, src: Reg) {
    put_rex(text, false, dst.0, 0, src.0, src.0 >= 4);
    text.put_bytes(&[0x0f, 0xb6]);
    text.put_byte(modrm(0b11, dst.0, src.0));
}

/// MOVSXD r64, r32.
pub fn movsxd_rr(text: &mut TextBuffer, dst: Reg, src: Reg) {
    op_reg_reg(text, &[0x63], true, dst.0, src.0);
}

/// LEA reg, [rsp + disp]; `force_disp32` reserves a patchable 32-bit
/// displacement regardless of value.
pub fn lea_stack(text: &mut TextBuffer, dst: Reg, disp: i32, force_disp32: bool) {
    op_reg_mem(text, &[0x8d], true, dst.0, REG_STACK_PTR, None, disp, force_disp32);
}

/// LEA reg, [base + index + disp].
pub fn lea_mem(text: &mut TextBuffer, dst: Reg, base: Reg, index: Reg, disp: i32) {
    op_reg_mem(text, &[0x8d], true, dst.0, base.0, Some((index.0, 0)), disp, false);
}

// ==================== stack ====================

pub fn push_r(text: &mut TextBuffer, r: Reg) {
    if r.0 >= 8 {
        text.put_byte(0x41);
    }
    text.put_byte(0x50 + (r.0 & 7));
}

pub fn pop_r(text: &mut TextBuffer, r: Reg) {
    if r.0 >= 8 {
        text.put_byte(0x41);
    }
    text.put_byte(0x58 + (r.0 & 7));
}

pub fn push_i8(text: &mut TextBuffer, value: i8) {
    text.put_byte(0x6a);
    text.put_byte(value as u8);
}

pub fn push_i32(text: &mut TextBuffer, value: i32) {
    text.put_byte(0x68);
    text.put_u32(value as u32);
}

// ==================== integer ALU ====================

/// Two-operand ALU instruction group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alu {
    Add,
    Or,
    And,
    Sub,
    Xor,
    Cmp,
}

impl Alu {
    fn rm_opcode(self) -> u8 {
        match self {
            Alu::Add => 0x03,
            Alu::Or => 0x0b,
            Alu::And => 0x23,
            Alu::Sub => 0x2b,
            Alu::Xor => 0x33,
            Alu::Cmp => 0x3b,
        }
    }

    fn imm_ext(self) -> u8 {
        match self {
            Alu::Add => 0,
            Alu::Or => 1,
            Alu::And => 4,
            Alu::Sub => 5,
            Alu::Xor => 6,
            Alu::Cmp => 7,
        }
    }
}

/// ALU reg, reg.
pub fn alu_rr(text: &mut TextBuffer, op: Alu, t: ValueType, dst: Reg, src: Reg) {
    op_reg_reg(text, &[op.rm_opcode()], rex_w(t), dst.0, src.0);
}

/// ALU reg, imm (imm8 form when it fits).
pub fn alu_ri(text: &mut TextBuffer, op: Alu, t: ValueType, dst: Reg, value: i32) {
    put_rex(text, rex_w(t), 0, 0, dst.0, false);
    if (-0x80..0x80).contains(&value) {
        text.put_byte(0x83);
        text.put_byte(modrm(0b11, op.imm_ext(), dst.0));
        text.put_byte(value as u8);
    } else {
        text.put_byte(0x81);
        text.put_byte(modrm(0b11, op.imm_ext(), dst.0));
        text.put_u32(value as u32);
    }
}

/// ALU reg, [base + disp].
pub fn alu_r_mem(text: &mut TextBuffer, op: Alu, t: ValueType, dst: Reg, base: Reg, disp: i32) {
    op_reg_mem(text, &[op.rm_opcode()], rex_w(t), dst.0, base.0, None, disp, false);
}

/// CMP dword [rsp + disp], imm8.
pub fn cmp_stack_i8(text: &mut TextBuffer, t: ValueType, disp: i32, value: i8) {
    put_rex(text, rex_w(t), 0, 0, REG_STACK_PTR, false);
    text.put_byte(0x83);
    put_mem(text, 7, REG_STACK_PTR, None, disp, false);
    text.put_byte(value as u8);
}

/// TEST reg, reg.
pub fn test_rr(text: &mut TextBuffer, t: ValueType, a: Reg, b: Reg) {
    op_reg_reg(text, &[0x85], rex_w(t), b.0, a.0);
}

pub fn inc_r(text: &mut TextBuffer, t: ValueType, r: Reg) {
    put_rex(text, rex_w(t), 0, 0, r.0, false);
    text.put_byte(0xff);
    text.put_byte(modrm(0b11, 0, r.0));
}

pub fn dec_r(text: &mut TextBuffer, t: ValueType, r: Reg) {
    put_rex(text, rex_w(t), 0, 0, r.0, false);
    text.put_byte(0xff);
    text.put_byte(modrm(0b11, 1, r.0));
}

pub fn neg_r(text: &mut TextBuffer, t: ValueType, r: Reg) {
    put_rex(text, rex_w(t), 0, 0, r.0, false);
    text.put_byte(0xf7);
    text.put_byte(modrm(0b11, 3, r.0));
}

/// IMUL reg, reg.
pub fn imul_rr(text: &mut TextBuffer, t: ValueType, dst: Reg, src: Reg) {
    op_reg_reg(text, &[0x0f, 0xaf], rex_w(t), dst.0, src.0);
}

/// One-operand F7 group: MUL (/4), DIV (/6), IDIV (/7).
pub fn mul_div_r(text: &mut TextBuffer, t: ValueType, ext: u8, r: Reg) {
    put_rex(text, rex_w(t), 0, 0, r.0, false);
    text.put_byte(0xf7);
    text.put_byte(modrm(0b11, ext, r.0));
}

/// CDQ / CQO: sign-extend the dividend into rdx.
pub fn cdq_cqo(text: &mut TextBuffer, t: ValueType) {
    put_rex(text, rex_w(t), 0, 0, 0, false);
    text.put_byte(0x99);
}

/// Shift/rotate group: ROL /0, ROR /1, SHL /4, SHR /5, SAR /7.
pub fn shift_cl(text: &mut TextBuffer, t: ValueType, ext: u8, r: Reg) {
    put_rex(text, rex_w(t), 0, 0, r.0, false);
    text.put_byte(0xd3);
    text.put_byte(modrm(0b11, ext, r.0));
}

pub fn shift_imm(text: &mut TextBuffer, t: ValueType, ext: u8, r: Reg, count: u8) {
    put_rex(text, rex_w(t), 0, 0, r.0, false);
    text.put_byte(0xc1);
    text.put_byte(modrm(0b11, ext, r.0));
    text.put_byte(count);
}

/// BSF reg, reg.
pub fn bsf_rr(text: &mut TextBuffer, t: ValueType, dst: Reg, src: Reg) {
    op_reg_reg(text, &[0x0f, 0xbc], rex_w(t), dst.0, src.0);
}

/// BSR reg, reg.
pub fn bsr_rr(text: &mut TextBuffer, t: ValueType, dst: Reg, src: Reg) {
    op_reg_reg(text, &[0x0f, 0xbd], rex_w(t), dst.0, src.0);
}

/// POPCNT reg, reg.
pub fn popcnt_rr(text: &mut TextBuffer, t: ValueType, dst: Reg, src: Reg) {
    text.put_byte(0xf3);
    op_reg_reg(text, &[0x0f, 0xb8], rex_w(t), dst.0, src.0);
}

// ==================== conditions ====================

/// SETcc reg8.
pub fn setcc_r(text: &mut TextBuffer, cc: u8, r: Reg) {
    put_rex(text, false, 0, 0, r.0, r.0 >= 4);
    text.put_bytes(&[0x0f, 0x90 + cc]);
    text.put_byte(modrm(0b11, 0, r.0));
}

/// CMOVcc reg, reg.
pub fn cmovcc_rr(text: &mut TextBuffer, cc: u8, t: ValueType, dst: Reg, src: Reg) {
    op_reg_reg(text, &[0x0f, 0x40 + cc], rex_w(t), dst.0, src.0);
}

/// CMOVcc reg, [rsp + disp].
pub fn cmovcc_r_stack(text: &mut TextBuffer, cc: u8, t: ValueType, dst: Reg, disp: i32) {
    op_reg_mem(
        text,
        &[0x0f, 0x40 + cc],
        rex_w(t),
        dst.0,
        REG_STACK_PTR,
        None,
        disp,
        false,
    );
}

// ==================== control flow ====================

/// JMP rel8 (0xeb) or Jcc rel8 (0x70+cc) with a raw offset.
pub fn jmp8_raw(text: &mut TextBuffer, opcode: u8, offset: i8) {
    text.put_byte(opcode);
    text.put_byte(offset as u8);
}

/// Forward rel8 stub: placeholder offset, patched when the target binds.
/// Returns the site (address just past the displacement).
pub fn jmp8_stub(text: &mut TextBuffer, opcode: u8) -> i32 {
    jmp8_raw(text, opcode, -2);
    text.addr()
}

/// JMP rel32; addr 0 emits a self-branch placeholder.
pub fn jmp32(text: &mut TextBuffer, opcode: &[u8], addr: i32) -> i32 {
    text.put_bytes(opcode);
    let site = text.addr() + 4;
    let offset = if addr != 0 { addr - site } else { -4 - opcode.len() as i32 };
    text.put_u32(offset as u32);
    site
}

/// Branch opcode with known-address rel8 preference.
pub fn jmp_any(text: &mut TextBuffer, op8: u8, op32: &[u8], addr: i32) -> i32 {
    if addr != 0 {
        let offset = addr - (text.addr() + 2);
        if (-0x80..0x80).contains(&offset) {
            jmp8_raw(text, op8, offset as i8);
            return text.addr();
        }
    }
    jmp32(text, op32, addr)
}

/// CALL rel32 toward `addr`.
pub fn call_rel32(text: &mut TextBuffer, addr: i32) -> i32 {
    jmp32(text, &[0xe8], addr)
}

/// CALL rel32 whose placeholder displacement reaches text address 0.
pub fn call_missing(text: &mut TextBuffer) -> i32 {
    text.put_byte(0xe8);
    let site = text.addr() + 4;
    text.put_u32((-site) as u32);
    site
}

/// CALL reg.
pub fn call_r(text: &mut TextBuffer, r: Reg) {
    put_rex(text, false, 0, 0, r.0, false);
    text.put_byte(0xff);
    text.put_byte(modrm(0b11, 2, r.0));
}

/// JMP reg.
pub fn jmp_r(text: &mut TextBuffer, r: Reg) {
    put_rex(text, false, 0, 0, r.0, false);
    text.put_byte(0xff);
    text.put_byte(modrm(0b11, 4, r.0));
}

pub fn ret(text: &mut TextBuffer) {
    text.put_byte(0xc3);
}

pub fn int3(text: &mut TextBuffer) {
    text.put_byte(0xcc);
}

/// MOVQ r64, mmx; reads a reserved MMX register.
pub fn movq_r_mmx(text: &mut TextBuffer, dst: Reg, mmx: u8) {
    text.put_byte(0x48 | if dst.0 >= 8 { 1 } else { 0 });
    text.put_bytes(&[0x0f, 0x7e]);
    text.put_byte(modrm(0b11, mmx, dst.0));
}

// ==================== SSE ====================

fn scalar_prefix(t: ValueType) -> u8 {
    match t.size() {
        4 => 0xf3,
        8 => 0xf2,
        _ => unreachable!(),
    }
}

/// Scalar float op xmm, xmm: ADDSx 0x58, MULSx 0x59, SUBSx 0x5c,
/// MINSx 0x5d, DIVSx 0x5e, MAXSx 0x5f, SQRTSx 0x51.
pub fn sse_scalar_rr(text: &mut TextBuffer, t: ValueType, opcode: u8, dst: Reg, src: Reg) {
    text.put_byte(scalar_prefix(t));
    op_reg_reg(text, &[0x0f, opcode], false, dst.0, src.0);
}

/// MOVSx xmm, [rsp + disp].
pub fn movs_r_stack(text: &mut TextBuffer, t: ValueType, dst: Reg, disp: i32) {
    text.put_byte(scalar_prefix(t));
    op_reg_mem(text, &[0x0f, 0x10], false, dst.0, REG_STACK_PTR, None, disp, false);
}

/// MOVSx [rsp + disp], xmm.
pub fn movs_stack_r(text: &mut TextBuffer, t: ValueType, disp: i32, src: Reg) {
    text.put_byte(scalar_prefix(t));
    op_reg_mem(text, &[0x0f, 0x11], false, src.0, REG_STACK_PTR, None, disp, false);
}

/// MOVSx xmm, [base + index<<scale + disp].
pub fn movs_r_mem(
    text: &mut TextBuffer,
    t: ValueType,
    dst: Reg,
    base: Reg,
    index: Option<(Reg, u8)>,
    disp: i32,
) {
    let index = index.map(|(r, s)| (r.0, s));
    text.put_byte(scalar_prefix(t));
    op_reg_mem(text, &[0x0f, 0x10], false, dst.0, base.0, index, disp, false);
}

/// MOVSx [base + index<<scale + disp], xmm.
pub fn movs_mem_r(
    text: &mut TextBuffer,
    t: ValueType,
    base: Reg,
    index: Option<(Reg, u8)>,
    disp: i32,
    src: Reg,
) {
    let index = index.map(|(r, s)| (r.0, s));
    text.put_byte(scalar_prefix(t));
    op_reg_mem(text, &[0x0f, 0x11], false, src.0, base.0, index, disp, false);
}

/// MOVAPS xmm, xmm.
pub fn movaps_rr(text: &mut TextBuffer, dst: Reg, src: Reg) {
    op_reg_reg(text, &[0x0f, 0x28], false, dst.0, src.0);
}

/// MOVD/MOVQ xmm, r.
pub fn movd_x_r(text: &mut TextBuffer, t: ValueType, dst: Reg, src: Reg) {
    text.put_byte(0x66);
    op_reg_reg(text, &[0x0f, 0x6e], rex_w(t), dst.0, src.0);
}

/// MOVD/MOVQ r, xmm.
pub fn movd_r_x(text: &mut TextBuffer, t: ValueType, dst: Reg, src: Reg) {
    text.put_byte(0x66);
    op_reg_reg(text, &[0x0f, 0x7e], rex_w(t), src.0, dst.0);
}

/// Packed bitwise op xmm, xmm: ANDPS 0x54, ANDNPS 0x55, ORPS 0x56,
/// XORPS 0x57.
pub fn sse_packed_rr(text: &mut TextBuffer, opcode: u8, dst: Reg, src: Reg) {
    op_reg_reg(text, &[0x0f, opcode], false, dst.0, src.0);
}

/// PXOR xmm, xmm.
pub fn pxor_rr(text: &mut TextBuffer, dst: Reg, src: Reg) {
    text.put_byte(0x66);
    op_reg_reg(text, &[0x0f, 0xef], false, dst.0, src.0);
}

/// UCOMISx xmm, xmm.
pub fn ucomis_rr(text: &mut TextBuffer, t: ValueType, a: Reg, b: Reg) {
    if t.size() == 8 {
        text.put_byte(0x66);
    }
    op_reg_reg(text, &[0x0f, 0x2e], false, a.0, b.0);
}

/// ROUNDSx xmm, xmm, mode (SSE4.1).
pub fn rounds_rr(text: &mut TextBuffer, t: ValueType, dst: Reg, src: Reg, mode: u8) {
    text.put_byte(0x66);
    let opcode = if t.size() == 4 { 0x0a } else { 0x0b };
    put_rex(text, false, dst.0, 0, src.0, false);
    text.put_bytes(&[0x0f, 0x3a, opcode]);
    text.put_byte(modrm(0b11, dst.0, src.0));
    text.put_byte(mode);
}

/// CVTSI2Sx xmm, r (int width from `int_t`).
pub fn cvtsi2s_x_r(text: &mut TextBuffer, float_t: ValueType, int_t: ValueType, dst: Reg, src: Reg) {
    text.put_byte(scalar_prefix(float_t));
    op_reg_reg(text, &[0x0f, 0x2a], rex_w(int_t), dst.0, src.0);
}

/// CVTTSx2SI r, xmm (truncating; int width from `int_t`).
pub fn cvtts2si_r_x(text: &mut TextBuffer, float_t: ValueType, int_t: ValueType, dst: Reg, src: Reg) {
    text.put_byte(scalar_prefix(float_t));
    op_reg_reg(text, &[0x0f, 0x2c], rex_w(int_t), dst.0, src.0);
}

/// CVTSS2SD / CVTSD2SS.
pub fn cvts2s_rr(text: &mut TextBuffer, from: ValueType, dst: Reg, src: Reg) {
    text.put_byte(scalar_prefix(from));
    op_reg_reg(text, &[0x0f, 0x5a], false, dst.0, src.0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ValueType::{F32, F64, I32, I64};

    fn emitted(f: impl FnOnce(&mut TextBuffer)) -> Vec<u8> {
        let mut text = TextBuffer::new();
        f(&mut text);
        text.into_bytes()
    }

    #[test]
    fn test_mov_rr() {
        // MOV RAX, RBX = 48 8B C3
        assert_eq!(emitted(|t| mov_rr(t, I64, Reg(0), Reg(3))), [0x48, 0x8b, 0xc3]);
        // MOV R9, R8 = 4D 8B C8
        assert_eq!(emitted(|t| mov_rr(t, I64, Reg(9), Reg(8))), [0x4d, 0x8b, 0xc8]);
        // MOV EAX, EBX = 8B C3
        assert_eq!(emitted(|t| mov_rr(t, I32, Reg(0), Reg(3))), [0x8b, 0xc3]);
    }

    #[test]
    fn test_mov_ri_forms() {
        // MOV RAX, 1 (imm32 sign-extended) = 48 C7 C0 01 00 00 00
        assert_eq!(
            emitted(|t| mov_ri(t, I64, Reg(0), 1)),
            [0x48, 0xc7, 0xc0, 1, 0, 0, 0]
        );
        // MOV EAX, 0x90000000 via r32 form = B8 00 00 00 90
        assert_eq!(
            emitted(|t| mov_ri(t, I64, Reg(0), 0x9000_0000)),
            [0xb8, 0x00, 0x00, 0x00, 0x90]
        );
        // MOV RAX, imm64 = 48 B8 ..
        assert_eq!(
            emitted(|t| mov_ri(t, I64, Reg(0), 0x1_0000_0001)),
            [0x48, 0xb8, 1, 0, 0, 0, 1, 0, 0, 0]
        );
    }

    #[test]
    fn test_stack_addressing() {
        // MOV RAX, [RSP] = 48 8B 04 24
        assert_eq!(
            emitted(|t| mov_r_stack(t, I64, Reg(0), 0)),
            [0x48, 0x8b, 0x04, 0x24]
        );
        // MOV RAX, [RSP+16] = 48 8B 44 24 10
        assert_eq!(
            emitted(|t| mov_r_stack(t, I64, Reg(0), 16)),
            [0x48, 0x8b, 0x44, 0x24, 0x10]
        );
        // MOV [RSP+0x100], RCX = 48 89 8C 24 00 01 00 00
        assert_eq!(
            emitted(|t| mov_stack_r(t, I64, 0x100, Reg(1))),
            [0x48, 0x89, 0x8c, 0x24, 0x00, 0x01, 0x00, 0x00]
        );
    }

    #[test]
    fn test_indexed_addressing() {
        // MOV RAX, [R14 + RAX*1] = 49 8B 04 06
        assert_eq!(
            emitted(|t| mov_r_mem(t, I64, Reg(0), Reg(14), Some((Reg(0), 0)), 0)),
            [0x49, 0x8b, 0x04, 0x06]
        );
        // MOV RAX, [R12 + RAX*8 + 0x30] = 49 8B 44 C4 30
        assert_eq!(
            emitted(|t| mov_r_mem(t, I64, Reg(0), Reg(12), Some((Reg(0), 3)), 0x30)),
            [0x49, 0x8b, 0x44, 0xc4, 0x30]
        );
    }

    #[test]
    fn test_byte_store_rex() {
        // MOV [R14+RSI], SIL: SIL forces a REX prefix (0x40 | B for R14)
        assert_eq!(
            emitted(|t| mov_mem_r(t, 1, Reg(14), Some((Reg(6), 0)), 0, Reg(6))),
            [0x41, 0x88, 0x34, 0x36]
        );
        // MOV [R14], BL keeps the bare-REX path off = 41 88 1E
        assert_eq!(
            emitted(|t| mov_mem_r(t, 1, Reg(14), None, 0, Reg(3))),
            [0x41, 0x88, 0x1e]
        );
    }

    #[test]
    fn test_alu() {
        // ADD RAX, RBX = 48 03 C3
        assert_eq!(
            emitted(|t| alu_rr(t, Alu::Add, I64, Reg(0), Reg(3))),
            [0x48, 0x03, 0xc3]
        );
        // SUB RSP, 32 = 48 83 EC 20
        assert_eq!(
            emitted(|t| alu_ri(t, Alu::Sub, I64, Reg(4), 32)),
            [0x48, 0x83, 0xec, 0x20]
        );
        // ADD RAX, 256 = 48 81 C0 00 01 00 00
        assert_eq!(
            emitted(|t| alu_ri(t, Alu::Add, I64, Reg(0), 256)),
            [0x48, 0x81, 0xc0, 0x00, 0x01, 0x00, 0x00]
        );
        // CMP RAX, RBX = 48 3B C3
        assert_eq!(
            emitted(|t| alu_rr(t, Alu::Cmp, I64, Reg(0), Reg(3))),
            [0x48, 0x3b, 0xc3]
        );
        // XOR EAX, EAX = 33 C0
        assert_eq!(emitted(|t| alu_rr(t, Alu::Xor, I32, Reg(0), Reg(0))), [0x33, 0xc0]);
    }

    #[test]
    fn test_test_and_flags() {
        // TEST RAX, RAX = 48 85 C0
        assert_eq!(emitted(|t| test_rr(t, I64, Reg(0), Reg(0))), [0x48, 0x85, 0xc0]);
        // SETE BL = 0F 94 C3
        assert_eq!(emitted(|t| setcc_r(t, 0x4, Reg(3))), [0x0f, 0x94, 0xc3]);
        // SETE SIL = 40 0F 94 C6
        assert_eq!(emitted(|t| setcc_r(t, 0x4, Reg(6))), [0x40, 0x0f, 0x94, 0xc6]);
        // CMOVL EAX, ECX = 0F 4C C1
        assert_eq!(
            emitted(|t| cmovcc_rr(t, 0xc, I32, Reg(0), Reg(1))),
            [0x0f, 0x4c, 0xc1]
        );
    }

    #[test]
    fn test_muldiv() {
        // IMUL RAX, RBX = 48 0F AF C3
        assert_eq!(
            emitted(|t| imul_rr(t, I64, Reg(0), Reg(3))),
            [0x48, 0x0f, 0xaf, 0xc3]
        );
        // IDIV RCX = 48 F7 F9
        assert_eq!(emitted(|t| mul_div_r(t, I64, 7, Reg(1))), [0x48, 0xf7, 0xf9]);
        // CQO = 48 99; CDQ = 99
        assert_eq!(emitted(|t| cdq_cqo(t, I64)), [0x48, 0x99]);
        assert_eq!(emitted(|t| cdq_cqo(t, I32)), [0x99]);
    }

    #[test]
    fn test_shifts() {
        // SHL RAX, CL = 48 D3 E0
        assert_eq!(emitted(|t| shift_cl(t, I64, 4, Reg(0))), [0x48, 0xd3, 0xe0]);
        // SHR RAX, 32 = 48 C1 E8 20
        assert_eq!(
            emitted(|t| shift_imm(t, I64, 5, Reg(0), 32)),
            [0x48, 0xc1, 0xe8, 0x20]
        );
    }

    #[test]
    fn test_control_flow() {
        // JMP rel32 +0x10 (to addr 0x15 from 0) = E9 10 00 00 00
        assert_eq!(emitted(|t| {
            jmp32(t, &[0xe9], 0x15);
        }), [0xe9, 0x10, 0x00, 0x00, 0x00]);
        // Placeholder JMP = E9 FB FF FF FF (self loop)
        assert_eq!(emitted(|t| {
            jmp32(t, &[0xe9], 0);
        }), [0xe9, 0xfb, 0xff, 0xff, 0xff]);
        // Unknown target always takes the rel32 form
        assert_eq!(emitted(|t| {
            jmp_any(t, 0x74, &[0x0f, 0x84], 0);
        }).len(), 6);
        // CALL missing: displacement reaches text address 0
        let code = emitted(|t| {
            t.put_byte(0x90);
            call_missing(t);
        });
        assert_eq!(&code[1..], &[0xe8, 0xfa, 0xff, 0xff, 0xff]);
        // CALL RAX = FF D0; JMP RDX = FF E2
        assert_eq!(emitted(|t| call_r(t, Reg(0))), [0xff, 0xd0]);
        assert_eq!(emitted(|t| jmp_r(t, Reg(2))), [0xff, 0xe2]);
    }

    #[test]
    fn test_rel8_backward() {
        let code = emitted(|t| {
            t.put_byte(0x90);
            t.put_byte(0x90);
            jmp_any(t, 0xeb, &[0xe9], 1); // target addr 1, site ends at 4
        });
        assert_eq!(&code[2..], &[0xeb, 0xfd]);
    }

    #[test]
    fn test_mmx_and_sse_moves() {
        // MOVQ RDX, MM0 = 48 0F 7E C2
        assert_eq!(emitted(|t| movq_r_mmx(t, Reg(2), 0)), [0x48, 0x0f, 0x7e, 0xc2]);
        // MOVAPS XMM1, XMM3 = 0F 28 CB
        assert_eq!(emitted(|t| movaps_rr(t, Reg(1), Reg(3))), [0x0f, 0x28, 0xcb]);
        // MOVQ XMM0, RAX = 66 48 0F 6E C0
        assert_eq!(
            emitted(|t| movd_x_r(t, I64, Reg(0), Reg(0))),
            [0x66, 0x48, 0x0f, 0x6e, 0xc0]
        );
        // MOVD EAX form: MOVD XMM0, EAX = 66 0F 6E C0
        assert_eq!(
            emitted(|t| movd_x_r(t, I32, Reg(0), Reg(0))),
            [0x66, 0x0f, 0x6e, 0xc0]
        );
        // MOVQ RAX, XMM0 = 66 48 0F 7E C0
        assert_eq!(
            emitted(|t| movd_r_x(t, I64, Reg(0), Reg(0))),
            [0x66, 0x48, 0x0f, 0x7e, 0xc0]
        );
    }

    #[test]
    fn test_sse_arith() {
        // ADDSD XMM0, XMM1 = F2 0F 58 C1
        assert_eq!(
            emitted(|t| sse_scalar_rr(t, F64, 0x58, Reg(0), Reg(1))),
            [0xf2, 0x0f, 0x58, 0xc1]
        );
        // ADDSS XMM0, XMM1 = F3 0F 58 C1
        assert_eq!(
            emitted(|t| sse_scalar_rr(t, F32, 0x58, Reg(0), Reg(1))),
            [0xf3, 0x0f, 0x58, 0xc1]
        );
        // UCOMISD XMM0, XMM1 = 66 0F 2E C1
        assert_eq!(
            emitted(|t| ucomis_rr(t, F64, Reg(0), Reg(1))),
            [0x66, 0x0f, 0x2e, 0xc1]
        );
        // UCOMISS XMM0, XMM1 = 0F 2E C1
        assert_eq!(emitted(|t| ucomis_rr(t, F32, Reg(0), Reg(1))), [0x0f, 0x2e, 0xc1]);
    }

    #[test]
    fn test_conversions() {
        // CVTSI2SD XMM0, RAX = F2 48 0F 2A C0
        assert_eq!(
            emitted(|t| cvtsi2s_x_r(t, F64, I64, Reg(0), Reg(0))),
            [0xf2, 0x48, 0x0f, 0x2a, 0xc0]
        );
        // CVTTSD2SI RAX, XMM0 = F2 48 0F 2C C0
        assert_eq!(
            emitted(|t| cvtts2si_r_x(t, F64, I64, Reg(0), Reg(0))),
            [0xf2, 0x48, 0x0f, 0x2c, 0xc0]
        );
        // CVTSS2SD XMM0, XMM1 = F3 0F 5A C1
        assert_eq!(
            emitted(|t| cvts2s_rr(t, F32, Reg(0), Reg(1))),
            [0xf3, 0x0f, 0x5a, 0xc1]
        );
        // ROUNDSD XMM0, XMM0, 1 = 66 0F 3A 0B C0 01
        assert_eq!(
            emitted(|t| rounds_rr(t, F64, Reg(0), Reg(0), 1)),
            [0x66, 0x0f, 0x3a, 0x0b, 0xc0, 0x01]
        );
    }

    #[test]
    fn test_push_pop() {
        let code = emitted(|t| {
            push_r(t, Reg(3));
            push_r(t, Reg(12));
            pop_r(t, Reg(12));
            pop_r(t, Reg(3));
        });
        assert_eq!(code, [0x53, 0x41, 0x54, 0x41, 0x5c, 0x5b]);
        assert_eq!(emitted(|t| push_i8(t, -1)), [0x6a, 0xff]);
        assert_eq!(emitted(|t| push_i32(t, 0x100)), [0x68, 0x00, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn test_lea_stack_placeholder() {
        // LEA RDX, [RSP + disp32] keeps a patchable 4-byte displacement
        let code = emitted(|t| lea_stack(t, Reg(2), 0, true));
        assert_eq!(code, [0x48, 0x8d, 0x94, 0x24, 0, 0, 0, 0]);
    }

    #[test]
    fn test_widen_loads() {
        // MOVZX EAX, byte [R14+RCX] = 41 0F B6 04 0E
        assert_eq!(
            emitted(|t| widen_r_mem(t, Reg(0), Reg(14), Some((Reg(1), 0)), 0, 1, false, false)),
            [0x41, 0x0f, 0xb6, 0x04, 0x0e]
        );
        // MOVSXD RAX, dword [R14+RCX] = 49 63 04 0E
        assert_eq!(
            emitted(|t| widen_r_mem(t, Reg(0), Reg(14), Some((Reg(1), 0)), 0, 4, true, true)),
            [0x49, 0x63, 0x04, 0x0e]
        );
    }
}
