//! Per-function code generation.
//!
//! The coder walks a function's expression tree recursively, emitting
//! native instructions through the macro assembler while tracking where
//! every live value currently resides: immediates, registers, variable
//! caches, the machine stack, or the CPU condition flags.
//!
//! Live operands that must survive a sub-expression's evaluation are
//! pinned into a coder-owned registry.  Register stealing and local
//! invalidation rewrite the pinned entries in place; when a caller
//! unpins, it receives the possibly-relocated operand back.

use std::marker::PhantomData;

use log::trace;

use crate::codegen::link::{FuncLink, Label, LabelId};
use crate::codegen::objmap::{CallSiteMap, FuncMap};
use crate::codegen::operand::Operand;
use crate::codegen::regalloc::{Reg, RegPool};
use crate::codegen::textbuf::{DataArena, TextBuffer};
use crate::codegen::WORD_SIZE;
use crate::error::CompileError;
use crate::isa::MacroAssembler;
use crate::module::{BinaryOp, Expr, Module, Signature, UnaryOp};
use crate::traps::{Trap, NUM_TRAPS};
use crate::types::{Category, ValueType};

/// An operand kept alive across nested evaluation, with its type.
#[derive(Debug, Clone, Copy)]
pub struct LiveOperand {
    pub ty: ValueType,
    pub op: Operand,
}

/// Handle returned by pinning; untracked operands pass through by value.
enum Pinned {
    Tracked(usize),
    Untracked(Operand),
}

/// Per-variable state: current cached location, whether the cache has
/// unwritten changes, and how many live operands reference the cache.
#[derive(Debug, Clone, Copy)]
struct VarState {
    cache: Operand,
    dirty: bool,
    ref_count: i32,
}

impl VarState {
    fn reset(&mut self) {
        self.cache = Operand::Nowhere;
        self.dirty = false;
    }
}

/// A branch destination on the target stack.
#[derive(Debug, Clone)]
struct BranchTarget {
    label: LabelId,
    name: Option<String>,
    expect: ValueType,
    stack_offset: i32,
    function_end: bool,
}

/// A lowered `br_table` awaiting its rodata entries.
struct BranchTableJob {
    rodata_offset: i32,
    /// (label, stack offset at target push) per entry.
    targets: Vec<(LabelId, i32)>,
    /// Stack offset at branch time; None when all targets share one.
    code_stack_offset: Option<i32>,
}

/// Code generator state shared across one program.
pub struct Coder<'m, M: MacroAssembler> {
    pub(crate) module: &'m Module,
    pub text: TextBuffer,
    pub rodata: DataArena,
    rodata_addr: i32,
    pub(crate) func_links: Vec<FuncLink>,
    pub(crate) trap_links: Vec<Label>,
    pub(crate) func_map: FuncMap,
    pub(crate) call_map: CallSiteMap,

    regs_int: RegPool,
    regs_float: RegPool,

    labels: Vec<Label>,
    live: Vec<LiveOperand>,
    immutable_live: usize,
    targets: Vec<BranchTarget>,
    branch_tables: Vec<BranchTableJob>,

    // reset for each function
    func_params: &'m [ValueType],
    func_locals: &'m [ValueType],
    func_result: ValueType,
    vars: Vec<VarState>,
    pushed_locals: usize,
    pub(crate) stack_offset: i32,
    max_stack_offset: i32,

    _isa: PhantomData<M>,
}

impl<'m, M: MacroAssembler> Coder<'m, M> {
    pub fn new(module: &'m Module, rodata_addr: i32) -> Self {
        Self {
            module,
            text: TextBuffer::with_capacity(4096),
            rodata: DataArena::new(),
            rodata_addr,
            func_links: (0..module.num_funcs()).map(|_| FuncLink::default()).collect(),
            trap_links: (0..NUM_TRAPS).map(|_| Label::new()).collect(),
            func_map: FuncMap::new(),
            call_map: CallSiteMap::new(),
            regs_int: RegPool::new(M::AVAIL_INT_REGS, "integer"),
            regs_float: RegPool::new(M::AVAIL_FLOAT_REGS, "float"),
            labels: Vec::new(),
            live: Vec::new(),
            immutable_live: 0,
            targets: Vec::new(),
            branch_tables: Vec::new(),
            func_params: &[],
            func_locals: &[],
            func_result: ValueType::Void,
            vars: Vec::new(),
            pushed_locals: 0,
            stack_offset: 0,
            max_stack_offset: 0,
            _isa: PhantomData,
        }
    }

    // ---- state shared with the macro assembler ----

    pub fn rodata_addr(&self) -> i32 {
        self.rodata_addr
    }

    pub fn table_len(&self) -> usize {
        self.module.table.len()
    }

    /// Address of a trap stub; stubs are emitted before any function body.
    pub fn trap_stub_addr(&self, id: Trap) -> i32 {
        self.trap_links[id.id() as usize].final_addr()
    }

    /// Record a call site at the current text address with the current
    /// stack depth (including the link word).
    pub fn map_call_site_here(&mut self) {
        let depth = self.stack_offset + WORD_SIZE;
        self.call_map.put_call_site(self.text.addr(), depth);
    }

    pub(crate) fn put_call_site(&mut self, ret_addr: i32, depth: i32) {
        self.call_map.put_call_site(ret_addr, depth);
    }

    fn regs(&mut self, t: ValueType) -> &mut RegPool {
        match t.category() {
            Category::Int => &mut self.regs_int,
            Category::Float => &mut self.regs_float,
        }
    }

    pub fn try_alloc_reg(&mut self, t: ValueType) -> Option<Reg> {
        self.regs(t).try_alloc()
    }

    pub fn free_reg(&mut self, t: ValueType, reg: Reg) {
        self.regs(t).free(reg);
    }

    pub fn is_reg_allocated(&self, t: ValueType, reg: Reg) -> bool {
        match t.category() {
            Category::Int => self.regs_int.is_allocated(reg),
            Category::Float => self.regs_float.is_allocated(reg),
        }
    }

    /// An operand's register or stack claim has been absorbed into an
    /// emitted instruction.  A temporary in a reserved register (the
    /// result register) is not pool-managed and needs no release.
    pub fn consumed(&mut self, t: ValueType, x: Operand) {
        match x {
            Operand::TempReg { reg, .. } if self.is_reg_allocated(t, reg) => {
                self.free_reg(t, reg);
            }
            Operand::TempReg { .. } => {}
            Operand::Stack => self.stack_offset -= WORD_SIZE,
            _ => {}
        }
    }

    /// Drop an operand without using its value.
    pub fn discard(&mut self, t: ValueType, x: Operand) {
        match x {
            Operand::TempReg { reg, .. } if self.is_reg_allocated(t, reg) => {
                self.free_reg(t, reg);
            }
            Operand::TempReg { .. } => {}
            Operand::Stack => self.op_add_imm_to_stack_ptr(WORD_SIZE),
            _ => {}
        }
    }

    // ---- operand resolution ----

    /// Replace a variable reference with the variable's current home.
    fn resolve(&self, x: Operand) -> Operand {
        if let Operand::VarRef(index) = x {
            let v = &self.vars[index];
            if let Operand::Nowhere = v.cache {
                Operand::VarMem {
                    index,
                    offset: self.var_stack_offset(index),
                }
            } else {
                v.cache
            }
        } else {
            x
        }
    }

    /// Collapse concrete variable homes back into abstract references.
    fn as_var_ref(&self, x: Operand) -> Operand {
        match x {
            Operand::VarReg { index, .. } | Operand::VarMem { index, .. } => Operand::VarRef(index),
            _ => x,
        }
    }

    fn var_type(&self, index: usize) -> ValueType {
        if index < self.func_params.len() {
            self.func_params[index]
        } else {
            self.func_locals[index - self.func_params.len()]
        }
    }

    /// Stack offset of a variable's home slot at the current stack depth.
    fn var_stack_offset(&self, index: usize) -> i32 {
        let offset = if index < self.func_params.len() {
            let pos = (self.func_params.len() - index - 1) as i32;
            // params sit above the return address
            self.stack_offset + WORD_SIZE + pos * WORD_SIZE
        } else {
            let local = (index - self.func_params.len()) as i32;
            self.stack_offset - (local + 1) * WORD_SIZE
        };
        if offset < 0 {
            panic!("internal: effective stack offset of variable #{index} is negative");
        }
        offset
    }

    // ---- moves, materialization ----

    /// Move an operand into a register.  Must not allocate registers.
    fn move_to(&mut self, t: ValueType, target: Reg, x: Operand, preserve_flags: bool) -> bool {
        if t == ValueType::Void && x != Operand::Nowhere {
            panic!("internal: moving {x} into a register as void");
        }
        if t != ValueType::Void && x == Operand::Nowhere {
            panic!("internal: no operand to move as {t}");
        }
        let x = self.resolve(x);
        M::move_to_reg(self, t, target, x, preserve_flags)
    }

    /// Get an operand into a register, off the stack and out of the flags.
    fn materialize(&mut self, t: ValueType, x: Operand) -> Operand {
        let x = self.preload(t, x);
        match x {
            Operand::Stack | Operand::Flags(_) => {
                let reg = self.alloc_reg_saving(t, &mut []);
                let zero_ext = self.move_to(t, reg, x, false);
                Operand::temp_reg(reg, zero_ext)
            }
            _ => x,
        }
    }

    /// Resolve a variable operand, promoting a stack-resident variable
    /// into a register cache when one is available.
    fn preload(&mut self, t: ValueType, x: Operand) -> Operand {
        let x = self.resolve(x);
        if let Operand::VarMem { index, .. } = x {
            if let Some(reg) = self.try_alloc_var_reg(t) {
                let zero_ext = self.move_to(t, reg, x, false);
                let cached = Operand::var_reg(index, reg, zero_ext);
                self.vars[index].cache = cached;
                self.vars[index].dirty = false;
                return cached;
            }
        }
        x
    }

    // ---- register pressure ----

    /// Allocate a register, stealing one from live operands if the pool
    /// is empty.  Operands in `save` are pinned across the theft.
    fn alloc_reg_saving(&mut self, t: ValueType, save: &mut [LiveOperand]) -> Reg {
        if let Some(reg) = self.try_alloc_reg(t) {
            return reg;
        }
        let mut pins = Vec::with_capacity(save.len());
        for s in save.iter() {
            pins.push(self.pin_live(s.ty, s.op));
        }
        let reg = self.steal_reg(t);
        for (s, pin) in save.iter_mut().zip(pins.into_iter()).rev() {
            s.op = self.unpin_live(pin);
        }
        reg
    }

    fn try_alloc_var_reg(&mut self, t: ValueType) -> Option<Reg> {
        self.try_alloc_reg(t).or_else(|| self.try_steal_var_reg(t))
    }

    /// Free a register by evicting a live operand.  Does not change the
    /// pool's allocation state: the returned register keeps its busy
    /// marking on behalf of the caller.
    fn steal_reg(&mut self, need: ValueType) -> Reg {
        trace!("stealing {need} register");

        if let Some(reg) = self.try_steal_idle_var_reg(need) {
            return reg;
        }

        // push live operands to the machine stack until a register of the
        // right category turns up
        let mut i = self.immutable_live;
        while i < self.live.len() {
            let live = self.live[i];
            let type_match = live.ty.category() == need.category();
            let mut found = None;

            match live.op {
                Operand::Imm(_) => {}

                Operand::VarRef(index) => {
                    let v = self.vars[index];
                    let cached_reg = v.cache.check_var_reg().map(|(_, r, _)| r);
                    if type_match && cached_reg.is_some() && v.ref_count == 1 {
                        // the pin keeps its count; the reference now
                        // resolves to the variable's stack slot
                        if v.dirty {
                            self.store_var(live.ty, index, Operand::VarRef(index));
                        }
                        found = cached_reg;
                        self.vars[index].reset();
                    } else {
                        self.init_locals();
                        let x = self.resolve(live.op);
                        M::push(self, live.ty, x);
                        self.incr_stack_offset();
                        self.live[i].op = Operand::Stack;
                        self.vars[index].ref_count -= 1;
                        if self.vars[index].ref_count < 0 {
                            panic!("internal: negative reference count on variable #{index}");
                        }
                    }
                }

                Operand::TempReg { reg, .. } => {
                    self.init_locals();
                    M::push_reg(self, live.ty, reg);
                    self.incr_stack_offset();
                    self.live[i].op = Operand::Stack;
                    if type_match {
                        // the register keeps its busy marking for the caller
                        found = Some(reg);
                    } else {
                        self.free_reg(live.ty, reg);
                    }
                }

                Operand::Stack => {}

                other => panic!("internal: unexpected live operand during steal: {other}"),
            }

            self.immutable_live += 1;
            i += 1;

            if let Some(reg) = found {
                return reg;
            }
        }

        panic!("internal: no registers to steal");
    }

    /// Steal the cache register of a live but singly-referenced variable.
    /// Stops at the first operand that cannot be taken over.
    fn try_steal_var_reg(&mut self, need: ValueType) -> Option<Reg> {
        if let Some(reg) = self.try_steal_idle_var_reg(need) {
            return Some(reg);
        }

        let mut i = self.immutable_live;
        while i < self.live.len() {
            let live = self.live[i];
            let mut taken = None;

            match live.op {
                Operand::Imm(_) | Operand::Stack => {}

                Operand::VarRef(index) => {
                    if live.ty.category() != need.category() {
                        return None;
                    }
                    let v = self.vars[index];
                    if v.ref_count > 1 {
                        return None;
                    }
                    let (_, reg, _) = v.cache.check_var_reg()?;
                    // the pin keeps its count; the reference now resolves
                    // to the variable's stack slot
                    if v.dirty {
                        self.store_var(live.ty, index, Operand::VarRef(index));
                    }
                    self.vars[index].reset();
                    taken = Some(reg);
                }

                Operand::TempReg { .. } => return None,

                other => panic!("internal: unexpected live operand during steal: {other}"),
            }

            self.immutable_live += 1;
            i += 1;

            if taken.is_some() {
                return taken;
            }
        }

        None
    }

    /// Commit an unreferenced variable's register cache to its stack
    /// slot and take the register.
    fn try_steal_idle_var_reg(&mut self, need: ValueType) -> Option<Reg> {
        for i in 0..self.vars.len() {
            let v = self.vars[i];
            if v.ref_count != 0 {
                continue;
            }
            let Some((_, reg, _)) = v.cache.check_var_reg() else {
                continue;
            };
            let t = self.var_type(i);
            if t.category() != need.category() {
                continue;
            }
            if v.dirty {
                self.store_var(t, i, Operand::VarRef(i));
            }
            self.vars[i].reset();
            return Some(reg);
        }
        None
    }

    // ---- live-operand registry ----

    /// Pin an operand so it survives arbitrary code emission.  A flags
    /// operand is materialized into a register; an unallocated temporary
    /// register (the result register) is moved into an allocated one.
    fn pin_live(&mut self, t: ValueType, op: Operand) -> Pinned {
        let mut op = op;
        match op {
            Operand::Nowhere | Operand::Imm(_) => return Pinned::Untracked(op),

            Operand::VarRef(index) => {
                self.vars[index].ref_count += 1;
            }

            Operand::TempReg { reg, .. } if self.is_reg_allocated(t, reg) => {}

            Operand::TempReg { .. } | Operand::Flags(_) => {
                let reg = self.alloc_reg_saving(t, &mut []);
                let zero_ext = self.move_to(t, reg, op, false);
                op = Operand::temp_reg(reg, zero_ext);
            }

            other => panic!("internal: cannot pin operand {other}"),
        }

        self.live.push(LiveOperand { ty: t, op });
        Pinned::Tracked(self.live.len() - 1)
    }

    /// Release the most recently pinned operand, returning its current
    /// (possibly relocated) location.
    fn unpin_live(&mut self, pin: Pinned) -> Operand {
        let index = match pin {
            Pinned::Untracked(op) => return op,
            Pinned::Tracked(index) => index,
        };
        if index + 1 != self.live.len() {
            panic!("internal: unpinned operand is not the most recently pinned one");
        }
        let live = self.live.pop().unwrap();
        if let Operand::VarRef(vi) = live.op {
            self.vars[vi].ref_count -= 1;
            if self.vars[vi].ref_count < 0 {
                panic!("internal: negative reference count on variable #{vi}");
            }
        }
        if self.immutable_live > self.live.len() {
            self.immutable_live = self.live.len();
        }
        live.op
    }

    /// Push every live temporary register to the machine stack so that
    /// branches and calls may clobber the register file.
    fn save_temp_operands(&mut self) {
        let mut pushed = false;
        for i in self.immutable_live..self.live.len() {
            let live = self.live[i];
            match live.op {
                Operand::TempReg { .. } => {
                    self.init_locals();
                    let x = self.resolve(live.op);
                    M::push(self, live.ty, x);
                    self.incr_stack_offset();
                    self.live[i].op = Operand::Stack;
                    pushed = true;
                }
                Operand::Stack => {
                    if pushed {
                        panic!("internal: saved operand found after newly saved operand");
                    }
                }
                _ => {}
            }
        }
        self.immutable_live = self.live.len();
    }

    /// Write dirty variable caches to their stack slots; with `forget`,
    /// also drop the register caches.
    fn flush_reg_vars(&mut self, forget: bool) {
        for i in 0..self.vars.len() {
            let t = self.var_type(i);
            if self.vars[i].dirty {
                self.store_var(t, i, Operand::VarRef(i));
                self.vars[i].dirty = false;
            }
            if forget {
                if let Some((_, reg, _)) = self.vars[i].cache.check_var_reg() {
                    self.free_reg(t, reg);
                }
                self.vars[i].reset();
            }
        }
    }

    /// Store an operand into a variable's stack slot, materializing the
    /// slot first if the local has never been pushed.
    fn store_var(&mut self, t: ValueType, index: usize, x: Operand) {
        let x = self.resolve(x);
        let local = index as i64 - self.func_params.len() as i64;
        if local >= 0 && local as usize >= self.pushed_locals {
            self.init_locals_until(local as usize, x);
        } else {
            let offset = self.var_stack_offset(index);
            M::store_stack(self, t, offset, x);
        }
    }

    // ---- lazy local initialization ----

    fn init_locals(&mut self) {
        self.init_locals_until(self.func_locals.len(), Operand::Nowhere);
    }

    /// Push locals up to and including `last_local`, substituting
    /// `last_value` for its value.  Runs of still-zero locals are pushed
    /// as grouped zero words.
    fn init_locals_until(&mut self, last_local: usize, last_value: Operand) {
        let mut zero_run = 0usize;
        while self.pushed_locals <= last_local && self.pushed_locals < self.func_locals.len() {
            let local = self.pushed_locals;
            let index = self.func_params.len() + local;

            let v = self.vars[index];
            if v.cache == Operand::Nowhere {
                panic!("internal: variable without cached value during locals initialization");
            }
            if !v.dirty {
                panic!("internal: variable not dirty during locals initialization");
            }

            let mut x = v.cache;
            if local == last_local {
                x = last_value;
            }

            let is_zero = x.check_imm_value(ValueType::I64) == Some(0);
            if is_zero {
                zero_run += 1;
            } else {
                if zero_run > 0 {
                    M::push_zeros(self, zero_run);
                    zero_run = 0;
                }
                let t = self.func_locals[local];
                M::push(self, t, x);
            }

            self.incr_stack_offset();
            self.vars[index].dirty = false;
            self.pushed_locals += 1;
        }
        if zero_run > 0 {
            M::push_zeros(self, zero_run);
        }
    }

    fn incr_stack_offset(&mut self) {
        self.stack_offset += WORD_SIZE;
        if self.stack_offset > self.max_stack_offset {
            self.max_stack_offset = self.stack_offset;
        }
    }

    fn add_stack_usage(&mut self, size: i32) {
        if self.stack_offset + size > self.max_stack_offset {
            self.max_stack_offset = self.stack_offset + size;
        }
    }

    /// Stack-pointer adjustment that keeps the virtual offset in sync.
    fn op_add_imm_to_stack_ptr(&mut self, offset: i32) {
        self.stack_offset -= offset;
        M::add_imm_to_stack_ptr(self, offset);
    }

    // ---- labels and branch targets ----

    pub(crate) fn new_label(&mut self) -> LabelId {
        self.labels.push(Label::new());
        self.labels.len() - 1
    }

    /// Bind a label at the current address after normalizing machine
    /// state (temporaries saved, variable caches flushed), then patch
    /// its pending branches.
    fn bind_label_here(&mut self, id: LabelId) {
        self.save_temp_operands();
        self.flush_reg_vars(true);
        let addr = self.text.addr();
        self.labels[id].bind(addr);
        M::update_branches(self.text.bytes_mut(), &self.labels[id]);
        self.labels[id].clear_sites();
    }

    fn op_branch(&mut self, id: LabelId) {
        let addr = self.labels[id].addr_or_zero();
        let site = M::branch(self, addr);
        if !self.labels[id].is_bound() {
            self.labels[id].add_site(site);
        }
    }

    fn op_branch_if(&mut self, x: Operand, yes: bool, id: LabelId) {
        let x = self.resolve(x);
        let addr = self.labels[id].addr_or_zero();
        let sites = M::branch_if(self, x, yes, false, addr);
        if !self.labels[id].is_bound() {
            for site in sites {
                self.labels[id].add_site(site);
            }
        }
    }

    fn op_branch_if_out_of_bounds(&mut self, index_reg: Reg, upper: i32, id: LabelId) {
        let addr = self.labels[id].addr_or_zero();
        let site = M::branch_if_out_of_bounds(self, index_reg, upper, addr);
        if !self.labels[id].is_bound() {
            self.labels[id].add_site(site);
        }
    }

    fn push_target(&mut self, label: LabelId, name: Option<&str>, expect: ValueType, function_end: bool) {
        let mut offset = self.stack_offset;
        if self.pushed_locals < self.func_locals.len() {
            // locals are still being initialized lazily, but any branch
            // will have pushed them all first
            offset = self.func_locals.len() as i32 * WORD_SIZE;
        }
        if let Some(name) = name {
            trace!("branch target {name:?} at stack offset {offset}");
        }
        self.targets.push(BranchTarget {
            label,
            name: name.map(str::to_owned),
            expect,
            stack_offset: offset,
            function_end,
        });
    }

    fn pop_target(&mut self) -> bool {
        let target = self.targets.pop().expect("internal: branch target stack underflow");
        self.labels[target.label].is_live()
    }

    fn branch_target(&self, depth: usize) -> Result<&BranchTarget, CompileError> {
        if depth >= self.targets.len() {
            return Err(CompileError::BranchDepthOutOfRange { depth });
        }
        Ok(&self.targets[self.targets.len() - 1 - depth])
    }

    // ---- function generation ----

    /// Generate one defined function's body; returns its entry address.
    pub fn gen_function(&mut self, defined_index: usize) -> Result<i32, CompileError> {
        let module: &'m Module = self.module;
        let func = &module.functions[defined_index];
        let sig: &'m Signature = module
            .signatures
            .get(func.sig)
            .ok_or(CompileError::UnknownSignature(func.sig))?;

        self.func_params = &sig.params;
        self.func_locals = &func.locals;
        self.func_result = sig.result;

        let num_vars = sig.params.len() + func.locals.len();
        self.vars.clear();
        self.vars.resize(
            num_vars,
            VarState {
                cache: Operand::Nowhere,
                dirty: false,
                ref_count: 0,
            },
        );
        for (local, &t) in func.locals.iter().enumerate() {
            let index = sig.params.len() + local;
            self.vars[index].cache = Operand::imm(t, 0);
            self.vars[index].dirty = true;
        }

        self.pushed_locals = 0;
        self.stack_offset = 0;
        self.max_stack_offset = 0;

        self.text.align(M::FUNC_ALIGNMENT, M::PADDING_BYTE);
        let mut invoke_addr = self.text.addr();
        let stack_check_site = M::setup_stack_frame(self);
        let stack_check_end = self.text.addr();

        let end = self.new_label();
        self.push_target(end, func.name.as_deref(), sig.result, true);

        let mut deadend = false;
        for (i, child) in func.body.iter().enumerate() {
            let fin = i == func.body.len() - 1;
            let t = if fin { sig.result } else { ValueType::Void };

            let (result, de) = self.gen_expr(child, t, fin)?;
            if de {
                deadend = true;
                break;
            }
            if t != ValueType::Void {
                self.move_to(t, M::RESULT_REG, result, false);
            }
        }

        if self.pop_target() {
            deadend = false;
            self.bind_label_here(end);
        }

        if !deadend {
            let num_stack_values = self.stack_offset / WORD_SIZE;
            M::ret(self, num_stack_values);
            self.stack_offset = 0;
        }

        for i in 0..self.vars.len() {
            let v = self.vars[i];
            if v.ref_count != 0 {
                panic!("internal: variable #{i} reference count is non-zero at end of function");
            }
            if let Some((_, reg, _)) = v.cache.check_var_reg() {
                let t = self.var_type(i);
                self.free_reg(t, reg);
            }
            self.vars[i].reset();
        }

        self.regs_int.post_check();
        self.regs_float.post_check();

        if !self.live.is_empty() {
            panic!("internal: live operands exist at end of function");
        }
        if !self.targets.is_empty() {
            panic!("internal: branch target stack is not empty at end of function");
        }

        if self.max_stack_offset > 0 {
            M::update_stack_check(self.text.bytes_mut(), stack_check_site, self.max_stack_offset);
        } else {
            // the stack check is dead weight; retire it
            let new_addr = stack_check_end & !(M::FUNC_ALIGNMENT as i32 - 1);
            M::delete_code(self.text.bytes_mut(), invoke_addr, new_addr);
            M::disable_code(self.text.bytes_mut(), new_addr, stack_check_end);
            invoke_addr = new_addr;
        }

        self.resolve_branch_tables();

        let link = &mut self.func_links[self.module.imports.len() + defined_index];
        link.label.bind(invoke_addr);

        trace!(
            "function {}: entry 0x{:x}, {} bytes, max stack {}",
            self.module.imports.len() + defined_index,
            invoke_addr,
            self.text.addr() - invoke_addr,
            self.max_stack_offset,
        );

        Ok(invoke_addr)
    }

    /// Write the entries of every branch table recorded by this
    /// function, now that all target labels are bound.
    fn resolve_branch_tables(&mut self) {
        let jobs = std::mem::take(&mut self.branch_tables);
        for job in jobs {
            let mut offset = job.rodata_offset;
            for (label, target_offset) in job.targets {
                let addr = self.labels[label].final_addr() as u32;
                match job.code_stack_offset {
                    None => {
                        self.rodata.put_u32_at(offset, addr);
                        offset += 4;
                    }
                    Some(code_offset) => {
                        let delta = (code_offset - target_offset) as u32 as u64;
                        self.rodata.put_u64_at(offset, (delta << 32) | addr as u64);
                        offset += 8;
                    }
                }
            }
        }
    }

    // ---- expression lowering ----

    /// Lower one expression with operands pinned across its evaluation.
    fn gen_expr_saving(
        &mut self,
        x: &'m Expr,
        expect: ValueType,
        final_pos: bool,
        saved: &mut [LiveOperand],
    ) -> Result<(Operand, bool), CompileError> {
        if saved.is_empty() || x.is_pure_leaf() {
            return self.gen_expr(x, expect, final_pos);
        }
        let mut pins = Vec::with_capacity(saved.len());
        for s in saved.iter() {
            pins.push(self.pin_live(s.ty, s.op));
        }
        let result = self.gen_expr(x, expect, final_pos);
        for (s, pin) in saved.iter_mut().zip(pins.into_iter()).rev() {
            s.op = self.unpin_live(pin);
        }
        result
    }

    /// Lower one expression.  Returns its result operand and whether the
    /// code path can continue past it.
    fn gen_expr(
        &mut self,
        x: &'m Expr,
        expect: ValueType,
        final_pos: bool,
    ) -> Result<(Operand, bool), CompileError> {
        let (result, deadend, void_result) = self.gen_expr_inner(x, expect, final_pos)?;

        if result == Operand::Stack {
            panic!("internal: expression result operand is on the machine stack");
        }
        if deadend {
            M::abort(self);
            return Ok((Operand::Nowhere, true));
        }
        if void_result && expect != ValueType::Void {
            return Err(CompileError::MissingValue {
                context: "expression",
                want: expect,
            });
        }
        if (expect == ValueType::Void) != (result == Operand::Nowhere) {
            panic!("internal: expression type is {expect} but result is {result}");
        }
        Ok((result, false))
    }

    fn gen_expr_inner(
        &mut self,
        x: &'m Expr,
        expect: ValueType,
        final_pos: bool,
    ) -> Result<(Operand, bool, bool), CompileError> {
        match x {
            Expr::Const { ty, bits } => {
                let result = self.finish_typed("constant", *ty, expect, Operand::Imm(*bits))?;
                Ok((result, false, false))
            }

            Expr::GetLocal(index) => self.gen_get_local(*index, expect),

            Expr::SetLocal(index, value) => {
                let deadend = self.gen_set_local(*index, value)?;
                Ok((Operand::Nowhere, deadend, true))
            }

            Expr::Unary { op, ty, arg } => self.gen_unary(*op, *ty, arg, expect),

            Expr::Binary { op, ty, lhs, rhs } => self.gen_binary(*op, *ty, lhs, rhs, expect),

            Expr::Convert { op, to, from, arg } => {
                let (x, deadend) = self.gen_expr(arg, *from, false)?;
                if deadend {
                    return Ok((Operand::Nowhere, true, false));
                }
                let x = self.preload(*from, x);
                let result = M::convert(self, *op, *to, *from, x);
                let result = self.as_var_ref(result);
                let result = self.finish_typed("conversion", *to, expect, result)?;
                Ok((result, false, false))
            }

            Expr::Load {
                ty,
                width,
                offset,
                index,
                ..
            } => {
                let (idx, deadend) = self.gen_expr(index, ValueType::I32, false)?;
                if deadend {
                    return Ok((Operand::Nowhere, true, false));
                }
                let idx = self.preload(ValueType::I32, idx);
                let result = M::load(self, *width, *ty, idx, *offset);
                let result = self.as_var_ref(result);
                let result = self.finish_typed("load", *ty, expect, result)?;
                Ok((result, false, false))
            }

            Expr::Store {
                ty,
                width,
                offset,
                index,
                value,
                ..
            } => {
                let (idx, deadend) = self.gen_expr(index, ValueType::I32, false)?;
                if deadend {
                    return Ok((Operand::Nowhere, true, false));
                }
                let mut saved = [LiveOperand {
                    ty: ValueType::I32,
                    op: idx,
                }];
                let (val, deadend) = self.gen_expr_saving(value, *ty, false, &mut saved)?;
                if deadend {
                    self.discard(ValueType::I32, saved[0].op);
                    return Ok((Operand::Nowhere, true, false));
                }
                let idx = self.materialize(ValueType::I32, saved[0].op);
                let val = self.preload(*ty, val);
                M::store(self, *width, *ty, idx, val, *offset);
                let result = self.finish_typed("store", ValueType::Void, expect, Operand::Nowhere)?;
                Ok((result, false, false))
            }

            Expr::Block { ty, name, body } => {
                let (result, deadend) =
                    self.gen_block("block", *ty, name.as_deref(), body, expect, final_pos, None)?;
                Ok((result, deadend, false))
            }

            Expr::Loop { ty, name, body } => {
                let before = self.new_label();
                self.bind_label_here(before);
                let (result, deadend) = self.gen_block(
                    "loop",
                    *ty,
                    name.as_deref(),
                    body,
                    expect,
                    final_pos,
                    Some(before),
                )?;
                Ok((result, deadend, false))
            }

            Expr::If { ty, cond, then, els } => self.gen_if(*ty, cond, then, els.as_deref(), expect, final_pos),

            Expr::Br { depth, value } => {
                let deadend = self.gen_br(*depth, value.as_deref())?;
                Ok((Operand::Nowhere, deadend, true))
            }

            Expr::BrIf { depth, value, cond } => {
                let deadend = self.gen_br_if(*depth, value.as_deref(), cond)?;
                Ok((Operand::Nowhere, deadend, true))
            }

            Expr::BrTable {
                targets,
                default,
                value,
                cond,
            } => {
                let deadend = if targets.is_empty() {
                    // degenerate table: evaluate the index for effect,
                    // then branch unconditionally
                    let (idx, de) = self.gen_expr(cond, ValueType::I32, false)?;
                    if de {
                        true
                    } else {
                        self.discard(ValueType::I32, idx);
                        self.gen_br(*default, value.as_deref())?
                    }
                } else {
                    self.gen_br_table(targets, *default, value.as_deref(), cond)?
                };
                Ok((Operand::Nowhere, deadend, true))
            }

            Expr::Return(value) => {
                self.gen_return(value.as_deref())?;
                Ok((Operand::Nowhere, true, true))
            }

            Expr::Call { func, args } => {
                let (result, deadend) = self.gen_call(*func, args, expect)?;
                Ok((result, deadend, false))
            }

            Expr::CallIndirect { sig, index, args } => {
                let (result, deadend) = self.gen_call_indirect(*sig, index, args, expect)?;
                Ok((result, deadend, false))
            }

            Expr::Select { a, b, cond } => self.gen_select(a, b, cond, expect),

            Expr::Drop(arg) => {
                let (_, deadend) = self.gen_expr(arg, ValueType::Void, final_pos)?;
                Ok((Operand::Nowhere, deadend, true))
            }

            Expr::Nop => Ok((Operand::Nowhere, false, true)),

            Expr::Unreachable => {
                M::trap(self, Trap::Unreachable);
                Ok((Operand::Nowhere, true, true))
            }

            Expr::MemorySize => {
                if expect != ValueType::I32 {
                    return Err(CompileError::TypeMismatch {
                        context: "memory size query",
                        got: ValueType::I32,
                        want: expect,
                    });
                }
                let result = M::query_memory_size(self);
                Ok((result, false, false))
            }

            Expr::MemoryGrow(arg) => {
                if expect != ValueType::I32 {
                    return Err(CompileError::TypeMismatch {
                        context: "memory grow",
                        got: ValueType::I32,
                        want: expect,
                    });
                }
                let (x, deadend) = self.gen_expr(arg, ValueType::I32, false)?;
                if deadend {
                    return Ok((Operand::Nowhere, true, false));
                }
                let x = self.preload(ValueType::I32, x);
                let result = M::grow_memory(self, x);
                Ok((result, false, false))
            }
        }
    }

    /// Apply the expected-type rule shared by all value-producing
    /// operations: statement position discards, otherwise types must
    /// agree exactly.
    fn finish_typed(
        &mut self,
        context: &'static str,
        out_type: ValueType,
        expect: ValueType,
        result: Operand,
    ) -> Result<Operand, CompileError> {
        if expect == ValueType::Void {
            self.discard(out_type, result);
            Ok(Operand::Nowhere)
        } else if out_type != expect {
            Err(CompileError::TypeMismatch {
                context,
                got: out_type,
                want: expect,
            })
        } else {
            Ok(result)
        }
    }

    fn gen_get_local(
        &mut self,
        index: usize,
        expect: ValueType,
    ) -> Result<(Operand, bool, bool), CompileError> {
        if index >= self.vars.len() {
            return Err(CompileError::UnknownVariable(index));
        }
        let t = self.var_type(index);
        let result = match self.vars[index].cache {
            Operand::Nowhere | Operand::VarReg { .. } => Operand::VarRef(index),
            imm @ Operand::Imm(_) => imm,
            other => panic!("internal: variable #{index} cache is {other}"),
        };
        let result = self.finish_typed("local variable", t, expect, result)?;
        Ok((result, false, false))
    }

    fn gen_unary(
        &mut self,
        op: UnaryOp,
        t: ValueType,
        arg: &'m Expr,
        expect: ValueType,
    ) -> Result<(Operand, bool, bool), CompileError> {
        let out_type = if op == UnaryOp::Eqz { ValueType::I32 } else { t };

        let (x, deadend) = self.gen_expr(arg, t, false)?;
        if deadend {
            return Ok((Operand::Nowhere, true, false));
        }

        if let Some(value) = x.check_imm_value(t) {
            if op == UnaryOp::Eqz {
                let folded = Operand::imm(ValueType::I32, (value == 0) as i64);
                let result = self.finish_typed("unary operator", out_type, expect, folded)?;
                return Ok((result, false, false));
            }
        }

        let x = self.preload(t, x);
        let result = M::unary(self, op, t, x);
        let result = self.as_var_ref(result);
        let result = self.finish_typed("unary operator", out_type, expect, result)?;
        Ok((result, false, false))
    }

    fn gen_binary(
        &mut self,
        op: BinaryOp,
        t: ValueType,
        lhs: &'m Expr,
        rhs: &'m Expr,
        expect: ValueType,
    ) -> Result<(Operand, bool, bool), CompileError> {
        let out_type = if op.is_comparison() { ValueType::I32 } else { t };

        let (a, deadend) = self.gen_expr(lhs, t, false)?;
        if deadend {
            return Ok((Operand::Nowhere, true, false));
        }

        let mut saved = [LiveOperand { ty: t, op: a }];
        let (b, deadend) = self.gen_expr_saving(rhs, t, false, &mut saved)?;
        if deadend {
            self.discard(t, saved[0].op);
            return Ok((Operand::Nowhere, true, false));
        }
        let mut a = saved[0].op;
        let mut b = b;

        // commutative immediates go on the right
        if matches!(a, Operand::Imm(_)) && !matches!(b, Operand::Imm(_)) {
            if matches!(op, BinaryOp::Add | BinaryOp::And | BinaryOp::Or | BinaryOp::Xor) {
                std::mem::swap(&mut a, &mut b);
            }
        }

        if let Some(value) = b.check_imm_value(t) {
            match op {
                BinaryOp::Add | BinaryOp::Or | BinaryOp::Sub | BinaryOp::Xor if value == 0 => {
                    let result = self.finish_typed("binary operator", out_type, expect, a)?;
                    return Ok((result, false, false));
                }
                BinaryOp::Mul if value == 0 => {
                    self.discard(t, a);
                    let zero = Operand::imm(t, 0);
                    let result = self.finish_typed("binary operator", out_type, expect, zero)?;
                    return Ok((result, false, false));
                }
                BinaryOp::Mul if value == 1 => {
                    let result = self.finish_typed("binary operator", out_type, expect, a)?;
                    return Ok((result, false, false));
                }
                _ => {}
            }
        }

        let a = self.materialize(t, a);
        let b = self.preload(t, b);

        let result = M::binary(self, op, t, a, b);
        let result = self.as_var_ref(result);
        let result = self.finish_typed("binary operator", out_type, expect, result)?;
        Ok((result, false, false))
    }

    fn gen_set_local(&mut self, index: usize, value: &'m Expr) -> Result<bool, CompileError> {
        if index >= self.vars.len() {
            return Err(CompileError::UnknownVariable(index));
        }
        let t = self.var_type(index);

        let (result, deadend) = self.gen_expr(value, t, false)?;
        if deadend {
            return Ok(true);
        }

        // assigning a variable to itself is a no-op
        if result.check_var() == Some(index) {
            return Ok(false);
        }

        let mut old_cache = self.vars[index].cache;
        trace!("set local #{index}: ref count {}", self.vars[index].ref_count);

        if self.vars[index].ref_count > 0 {
            match old_cache {
                Operand::Nowhere | Operand::VarReg { .. } => {
                    // relocate every live reference before the cache is
                    // invalidated: registers first, stack as a fallback
                    let mut alloc_failed = false;
                    let mut i = self.live.len();
                    while i > self.immutable_live && self.vars[index].ref_count > 0 {
                        i -= 1;
                        if self.live[i].op.check_var() != Some(index) {
                            continue;
                        }
                        match self.try_alloc_reg(t) {
                            None => {
                                alloc_failed = true;
                                break;
                            }
                            Some(reg) => {
                                let zero_ext = self.move_to(t, reg, Operand::VarRef(index), true);
                                self.live[i].op = Operand::temp_reg(reg, zero_ext);
                                self.vars[index].ref_count -= 1;
                                if self.vars[index].ref_count < 0 {
                                    panic!("internal: inconsistent variable reference count");
                                }
                            }
                        }
                    }

                    if alloc_failed && self.vars[index].ref_count > 0 {
                        self.init_locals();
                        for i in self.immutable_live..self.live.len() {
                            if self.live[i].op.check_var() != Some(index) {
                                continue;
                            }
                            let x = self.resolve(self.live[i].op);
                            M::push(self, t, x);
                            self.incr_stack_offset();
                            self.live[i].op = Operand::Stack;
                            self.vars[index].ref_count -= 1;
                            if self.vars[index].ref_count < 0 {
                                panic!("internal: inconsistent variable reference count");
                            }
                        }
                    }
                }
                other => panic!("internal: referenced variable cached as {other}"),
            }

            if self.vars[index].ref_count != 0 {
                panic!("internal: could not find all variable references");
            }
        }

        match result {
            Operand::Imm(_) => {
                self.vars[index].cache = result;
                self.vars[index].dirty = true;
            }

            Operand::VarRef(_) | Operand::Stack | Operand::Flags(_) => {
                let reg = if let Some((_, reg, _)) = old_cache.check_var_reg() {
                    // reusing the cache register, don't free it
                    old_cache = Operand::Nowhere;
                    Some(reg)
                } else {
                    self.try_alloc_var_reg(t)
                };

                match reg {
                    Some(reg) => {
                        let zero_ext = self.move_to(t, reg, result, false);
                        self.vars[index].cache = Operand::var_reg(index, reg, zero_ext);
                        self.vars[index].dirty = true;
                    }
                    None => {
                        self.store_var(t, index, result);
                        self.vars[index].cache = Operand::Nowhere;
                        self.vars[index].dirty = false;
                    }
                }
            }

            Operand::TempReg { reg, zero_ext } => {
                if self.is_reg_allocated(t, reg) {
                    // repurpose the register that already holds the value
                    self.vars[index].cache = Operand::var_reg(index, reg, zero_ext);
                    self.vars[index].dirty = true;
                } else {
                    // the value sits in a reserved register and cannot stay
                    let cache_reg = if let Some((_, r, _)) = old_cache.check_var_reg() {
                        old_cache = Operand::Nowhere;
                        Some(r)
                    } else {
                        self.try_alloc_var_reg(t)
                    };
                    match cache_reg {
                        Some(r) => {
                            let zero_ext = self.move_to(t, r, result, false);
                            self.vars[index].cache = Operand::var_reg(index, r, zero_ext);
                            self.vars[index].dirty = true;
                        }
                        None => {
                            self.store_var(t, index, result);
                            self.vars[index].cache = Operand::Nowhere;
                            self.vars[index].dirty = false;
                        }
                    }
                }
            }

            other => panic!("internal: cannot assign local from {other}"),
        }

        match old_cache {
            Operand::Nowhere | Operand::Imm(_) => {}
            Operand::VarReg { reg, .. } => self.free_reg(t, reg),
            other => panic!("internal: stale variable cache is {other}"),
        }

        Ok(false)
    }

    #[allow(clippy::too_many_arguments)]
    fn gen_block(
        &mut self,
        context: &'static str,
        block_type: ValueType,
        name: Option<&str>,
        body: &'m [Expr],
        expect: ValueType,
        final_sibling: bool,
        before: Option<LabelId>,
    ) -> Result<(Operand, bool), CompileError> {
        if expect != ValueType::Void && block_type != expect {
            return Err(CompileError::TypeMismatch {
                context,
                got: block_type,
                want: expect,
            });
        }

        let after = self.new_label();
        self.push_target(after, name, expect, final_sibling);
        if let Some(before) = before {
            self.push_target(before, name, ValueType::Void, false);
        }

        let mut result = Operand::Nowhere;
        let mut deadend = false;
        for (i, child) in body.iter().enumerate() {
            let final_child = i == body.len() - 1;
            let t = if final_child { expect } else { ValueType::Void };
            let (r, de) = self.gen_expr(child, t, final_sibling && final_child)?;
            result = r;
            if de {
                deadend = true;
                break;
            }
        }

        if before.is_some() {
            self.pop_target();
        }

        if self.pop_target() {
            if !deadend && expect != ValueType::Void {
                self.move_to(expect, M::RESULT_REG, result, false);
            }
            deadend = false;
            if expect != ValueType::Void {
                result = Operand::temp_reg(M::RESULT_REG, false);
            } else {
                result = Operand::Nowhere;
            }
            self.bind_label_here(after);
        } else if deadend {
            result = Operand::Nowhere;
        }

        Ok((result, deadend))
    }

    fn gen_if(
        &mut self,
        if_type: ValueType,
        cond: &'m Expr,
        then: &'m [Expr],
        els: Option<&'m [Expr]>,
        expect: ValueType,
        final_pos: bool,
    ) -> Result<(Operand, bool, bool), CompileError> {
        if expect != ValueType::Void && if_type != expect {
            return Err(CompileError::TypeMismatch {
                context: "if",
                got: if_type,
                want: expect,
            });
        }

        let (cond_op, deadend) = self.gen_expr(cond, ValueType::I32, false)?;
        if deadend {
            return Ok((Operand::Nowhere, true, false));
        }

        self.save_temp_operands();
        self.init_locals();
        self.flush_reg_vars(false);

        let end = self.new_label();
        let mut end_reachable = false;

        if let Some(els) = els {
            let after_else = self.new_label();
            self.op_branch_if(cond_op, true, after_else);

            let (else_deadend, end_reachable_from_else) =
                self.gen_if_arm(els, end, expect, final_pos)?;
            if !else_deadend {
                if final_pos {
                    let num_stack_values = self.stack_offset / WORD_SIZE;
                    M::ret(self, num_stack_values);
                } else {
                    self.save_temp_operands();
                    self.flush_reg_vars(true);
                    self.op_branch(end);
                    end_reachable = true;
                }
            }
            if end_reachable_from_else {
                end_reachable = true;
            }

            self.bind_label_here(after_else);
        } else {
            self.op_branch_if(cond_op, false, end);
            end_reachable = true;
        }

        let (then_deadend, end_reachable_from_then) = self.gen_if_arm(then, end, expect, final_pos)?;
        if !then_deadend || end_reachable_from_then {
            end_reachable = true;
        }

        if end_reachable {
            self.bind_label_here(end);
            let result = if expect != ValueType::Void {
                Operand::temp_reg(M::RESULT_REG, false)
            } else {
                Operand::Nowhere
            };
            Ok((result, false, false))
        } else {
            Ok((Operand::Nowhere, true, false))
        }
    }

    /// Lower one arm of an if.  Returns (deadend, end label reached).
    fn gen_if_arm(
        &mut self,
        body: &'m [Expr],
        end: LabelId,
        expect: ValueType,
        final_sibling: bool,
    ) -> Result<(bool, bool), CompileError> {
        if body.is_empty() {
            return Ok((false, false));
        }

        self.push_target(end, None, expect, final_sibling);

        let mut result = Operand::Nowhere;
        let mut deadend = false;
        for (i, child) in body.iter().enumerate() {
            let final_child = i == body.len() - 1;
            let t = if final_child { expect } else { ValueType::Void };
            let (r, de) = self.gen_expr(child, t, final_sibling && final_child)?;
            result = r;
            if de {
                deadend = true;
                break;
            }
        }

        if !deadend && expect != ValueType::Void {
            self.move_to(expect, M::RESULT_REG, result, false);
        }

        let end_reached = self.pop_target();
        Ok((deadend, end_reached))
    }

    /// Shared head of all branch forms: resolve the target's value type
    /// and evaluate the carried value.
    fn gen_branch_value(
        &mut self,
        value_type: ValueType,
        value: Option<&'m Expr>,
    ) -> Result<Option<Operand>, CompileError> {
        match (value, value_type) {
            (Some(v), _) => {
                let (op, deadend) = self.gen_expr(v, value_type, false)?;
                if deadend {
                    return Ok(None);
                }
                Ok(Some(op))
            }
            (None, ValueType::Void) => Ok(Some(Operand::Nowhere)),
            (None, t) => Err(CompileError::MissingValue {
                context: "branch",
                want: t,
            }),
        }
    }

    fn gen_br(&mut self, depth: usize, value: Option<&'m Expr>) -> Result<bool, CompileError> {
        let target = self.branch_target(depth)?.clone();
        let vt = target.expect;

        let Some(op) = self.gen_branch_value(vt, value)? else {
            return Ok(true);
        };

        if vt != ValueType::Void {
            self.move_to(vt, M::RESULT_REG, op, true);
        }

        if target.function_end {
            let num_stack_values = self.stack_offset / WORD_SIZE;
            M::ret(self, num_stack_values);
        } else {
            self.save_temp_operands();
            self.init_locals();
            self.flush_reg_vars(true);

            let delta = self.stack_offset - target.stack_offset;
            M::add_imm_to_stack_ptr(self, delta);
            self.op_branch(target.label);
        }

        Ok(true)
    }

    fn gen_br_if(
        &mut self,
        depth: usize,
        value: Option<&'m Expr>,
        cond: &'m Expr,
    ) -> Result<bool, CompileError> {
        let target = self.branch_target(depth)?.clone();
        let vt = target.expect;

        let Some(value_op) = self.gen_branch_value(vt, value)? else {
            return Ok(true);
        };

        let mut saved = [LiveOperand {
            ty: vt,
            op: value_op,
        }];
        let (cond_op, deadend) = self.gen_expr_saving(cond, ValueType::I32, false, &mut saved)?;
        if deadend {
            self.discard(vt, saved[0].op);
            return Ok(true);
        }
        let mut cond_op = cond_op;

        // the value move below may claim the result register, and the
        // stack adjustment may clobber the flags; relocate the condition
        // when either would destroy it
        if vt != ValueType::Void {
            if let Some((r, _)) = cond_op.check_temp_reg() {
                if !self.is_reg_allocated(ValueType::I32, r) {
                    cond_op = self.relocate_condition(cond_op);
                }
            }
        }
        if matches!(cond_op, Operand::Flags(_)) && self.stack_adjustment_pending(target.stack_offset)
        {
            cond_op = self.relocate_condition(cond_op);
        }

        if vt != ValueType::Void {
            self.move_to(vt, M::RESULT_REG, saved[0].op, true);
        }

        self.save_temp_operands();
        self.init_locals();
        self.flush_reg_vars(false);

        let delta = self.stack_offset - target.stack_offset;
        M::add_imm_to_stack_ptr(self, delta);
        self.op_branch_if(cond_op, true, target.label);
        M::add_imm_to_stack_ptr(self, -delta);

        Ok(false)
    }

    /// Whether normalizing for a branch to a target at `target_offset`
    /// will emit a stack-pointer adjustment (which clobbers the flags).
    fn stack_adjustment_pending(&self, target_offset: i32) -> bool {
        self.stack_offset != target_offset
            || self.pushed_locals < self.func_locals.len()
            || self.live[self.immutable_live..]
                .iter()
                .any(|l| matches!(l.op, Operand::TempReg { .. }))
    }

    /// Move a condition operand into a freshly allocated register.
    fn relocate_condition(&mut self, cond: Operand) -> Operand {
        let reg = self.alloc_reg_saving(ValueType::I32, &mut []);
        let zero_ext = self.move_to(ValueType::I32, reg, cond, false);
        Operand::temp_reg(reg, zero_ext)
    }

    fn gen_br_table(
        &mut self,
        table: &[usize],
        default: usize,
        value: Option<&'m Expr>,
        cond: &'m Expr,
    ) -> Result<bool, CompileError> {
        let default_target = self.branch_target(default)?.clone();
        let mut value_type = default_target.expect;

        let mut table_targets = Vec::with_capacity(table.len());
        for &depth in table {
            let target = self.branch_target(depth)?.clone();
            self.labels[target.label].set_live();

            if target.expect != ValueType::Void {
                if value_type == ValueType::Void {
                    value_type = target.expect;
                } else if value_type != target.expect {
                    return Err(CompileError::InconsistentBranchTypes {
                        a: value_type,
                        b: target.expect,
                    });
                }
            }
            table_targets.push(target);
        }

        let Some(value_op) = self.gen_branch_value(value_type, value)? else {
            return Ok(true);
        };

        let mut saved = [LiveOperand {
            ty: value_type,
            op: value_op,
        }];
        let (cond_op, deadend) = self.gen_expr_saving(cond, ValueType::I32, false, &mut saved)?;
        if deadend {
            self.discard(value_type, saved[0].op);
            return Ok(true);
        }
        let mut cond_op = cond_op;

        // the value move below may claim the result register
        if value_type != ValueType::Void {
            if let Some((r, _)) = cond_op.check_temp_reg() {
                if !self.is_reg_allocated(ValueType::I32, r) {
                    cond_op = self.relocate_condition(cond_op);
                }
            }
        }

        if value_type != ValueType::Void {
            self.move_to(value_type, M::RESULT_REG, saved[0].op, true);
        }

        let common_stack_offset = {
            let first = table_targets[0].stack_offset;
            if table_targets.iter().all(|t| t.stack_offset == first) {
                Some(first)
            } else {
                None
            }
        };

        let (table_type, scale) = if common_stack_offset.is_some() {
            (ValueType::I32, 2u8)
        } else {
            (ValueType::I64, 3u8)
        };

        let table_size = table_targets.len() << scale;
        let rodata_offset = self.rodata.alloc(table_size, 1 << scale);
        trace!(
            "branch table at rodata 0x{rodata_offset:x}: {} entries of {} bytes",
            table_targets.len(),
            1 << scale,
        );

        self.save_temp_operands();

        let mut cond_live = [LiveOperand {
            ty: ValueType::I32,
            op: cond_op,
        }];
        let delta_reg = if common_stack_offset.is_none() {
            let r = self.alloc_reg_saving(ValueType::I32, &mut cond_live);
            cond_op = cond_live[0].op;
            Some(r)
        } else {
            None
        };

        // land the branch index in a register that survives the flushes
        let mut own_reg = false;
        let mut reg_zero_ext = false;
        let reg = if let Some(index) = cond_op.check_var() {
            match self.vars[index].cache {
                Operand::VarReg { reg, .. } => Some(reg),
                _ => None,
            }
        } else if let Some((reg, zero_ext)) = cond_op.check_temp_reg() {
            own_reg = true;
            reg_zero_ext = zero_ext;
            Some(reg)
        } else {
            None
        };
        let reg = match reg {
            Some(reg) => reg,
            None => {
                let mut cond_live = [LiveOperand {
                    ty: ValueType::I32,
                    op: cond_op,
                }];
                let r = self.alloc_reg_saving(ValueType::I32, &mut cond_live);
                own_reg = true;
                reg_zero_ext = self.move_to(ValueType::I32, r, cond_live[0].op, false);
                r
            }
        };

        self.init_locals();
        self.flush_reg_vars(true);

        // if the index came from a variable's cache register, the
        // register was just released but retains its value; nothing
        // below may allocate until the indirect jump is emitted

        let default_delta = self.stack_offset - default_target.stack_offset;
        M::add_imm_to_stack_ptr(self, default_delta);
        let table_stack_offset = self.stack_offset - default_delta;

        self.op_branch_if_out_of_bounds(reg, table_targets.len() as i32, default_target.label);
        let mut zero_ext =
            M::load_branch_table_entry(self, table_type, reg, reg_zero_ext, scale, rodata_offset);

        match common_stack_offset {
            Some(common) => {
                M::add_imm_to_stack_ptr(self, table_stack_offset - common);
            }
            None => {
                let delta_reg = delta_reg.unwrap();
                M::move_reg(self, ValueType::I64, delta_reg, reg);
                M::shift_right_logical32(self, delta_reg);
                M::add_to_stack_ptr(self, delta_reg);
                zero_ext = false;
            }
        }

        M::branch_indirect32(self, reg, zero_ext);

        if let Some(r) = delta_reg {
            self.free_reg(ValueType::I32, r);
        }
        if own_reg && self.is_reg_allocated(ValueType::I32, reg) {
            self.free_reg(ValueType::I32, reg);
        }

        self.branch_tables.push(BranchTableJob {
            rodata_offset,
            targets: table_targets
                .iter()
                .map(|t| (t.label, t.stack_offset))
                .collect(),
            code_stack_offset: if common_stack_offset.is_some() {
                None
            } else {
                Some(table_stack_offset)
            },
        });

        Ok(true)
    }

    fn gen_return(&mut self, value: Option<&'m Expr>) -> Result<(), CompileError> {
        let expect = self.func_result;

        if expect != ValueType::Void && value.is_none() {
            return Err(CompileError::MissingValue {
                context: "return",
                want: expect,
            });
        }

        if let Some(v) = value {
            let (result, deadend) = self.gen_expr(v, expect, true)?;
            if deadend {
                return Ok(());
            }
            if expect != ValueType::Void {
                self.move_to(expect, M::RESULT_REG, result, false);
            }
        }

        let num_stack_values = self.stack_offset / WORD_SIZE;
        M::ret(self, num_stack_values);
        Ok(())
    }

    fn gen_call(
        &mut self,
        func: usize,
        args: &'m [Expr],
        expect: ValueType,
    ) -> Result<(Operand, bool), CompileError> {
        let module: &'m Module = self.module;
        let sig_index = module
            .func_sig(func)
            .ok_or(CompileError::UnknownFunction(func))?;
        let sig: &'m Signature = &module.signatures[sig_index];

        if expect != ValueType::Void && sig.result != expect {
            return Err(CompileError::TypeMismatch {
                context: "call",
                got: sig.result,
                want: expect,
            });
        }

        self.save_temp_operands();
        self.init_locals();

        let Some(args_size) = self.push_call_args(&format!("function {func}"), sig, args)? else {
            return Ok((Operand::Nowhere, true));
        };

        self.flush_reg_vars(true);

        let addr = self.func_links[func].label.addr_or_zero();
        let ret_addr = M::call(self, addr);
        self.map_call_site_here();
        if !self.func_links[func].label.is_bound() {
            self.func_links[func].label.add_site(ret_addr);
        }

        self.op_add_imm_to_stack_ptr(args_size);

        let result = if expect != ValueType::Void {
            Operand::temp_reg(M::RESULT_REG, false)
        } else {
            Operand::Nowhere
        };
        Ok((result, false))
    }

    fn gen_call_indirect(
        &mut self,
        sig: usize,
        index: &'m Expr,
        args: &'m [Expr],
        expect: ValueType,
    ) -> Result<(Operand, bool), CompileError> {
        let module: &'m Module = self.module;
        let signature: &'m Signature = module
            .signatures
            .get(sig)
            .ok_or(CompileError::UnknownSignature(sig))?;
        let sig_index = signature
            .index
            .ok_or(CompileError::SignatureNotIndexed(sig))?;

        if expect != ValueType::Void && signature.result != expect {
            return Err(CompileError::TypeMismatch {
                context: "indirect call",
                got: signature.result,
                want: expect,
            });
        }

        let (mut index_op, deadend) = self.gen_expr(index, ValueType::I32, false)?;
        if deadend {
            return Ok((Operand::Nowhere, true));
        }

        let mut index_stack_offset = 0;
        match index_op {
            Operand::Imm(_) | Operand::VarRef(_) => {
                // stays valid until needed
            }
            Operand::TempReg { .. } | Operand::Flags(_) => {
                M::push(self, ValueType::I32, index_op);
                self.incr_stack_offset();
                index_op = Operand::Stack;
                index_stack_offset = self.stack_offset;
            }
            Operand::Stack => {
                index_stack_offset = self.stack_offset;
            }
            other => panic!("internal: indirect call index is {other}"),
        }

        self.save_temp_operands();
        self.init_locals();

        let Some(args_size) = self.push_call_args(&format!("signature {sig}"), signature, args)?
        else {
            self.discard(ValueType::I32, index_op);
            return Ok((Operand::Nowhere, true));
        };

        if index_op == Operand::Stack {
            let effective = self.stack_offset - index_stack_offset;
            M::load_stack(self, ValueType::I32, M::RESULT_REG, effective);
        } else {
            self.move_to(ValueType::I32, M::RESULT_REG, index_op, false);
        }

        self.flush_reg_vars(true);

        M::call_indirect(self, sig_index, M::RESULT_REG);

        if index_op == Operand::Stack {
            self.op_add_imm_to_stack_ptr(args_size + WORD_SIZE);
        } else {
            self.op_add_imm_to_stack_ptr(args_size);
        }

        let result = if expect != ValueType::Void {
            Operand::temp_reg(M::RESULT_REG, false)
        } else {
            Operand::Nowhere
        };
        Ok((result, false))
    }

    /// Evaluate and push call arguments left to right.  Returns the
    /// pushed size, or None when an argument was a dead end.
    fn push_call_args(
        &mut self,
        target: &str,
        sig: &Signature,
        args: &'m [Expr],
    ) -> Result<Option<i32>, CompileError> {
        if sig.params.len() != args.len() {
            return Err(CompileError::ArgumentCountMismatch {
                target: target.to_owned(),
                got: args.len(),
                want: sig.params.len(),
            });
        }

        let initial = self.stack_offset;

        for (arg, &t) in args.iter().zip(sig.params.iter()) {
            let (x, deadend) = self.gen_expr(arg, t, false)?;
            if deadend {
                self.stack_offset = initial;
                return Ok(None);
            }
            let x = self.resolve(x);
            M::push(self, t, x);
            self.incr_stack_offset();
        }

        // account for the return address
        self.add_stack_usage(WORD_SIZE);

        Ok(Some(self.stack_offset - initial))
    }

    fn gen_select(
        &mut self,
        a_expr: &'m Expr,
        b_expr: &'m Expr,
        cond_expr: &'m Expr,
        t: ValueType,
    ) -> Result<(Operand, bool, bool), CompileError> {
        let (a, deadend) = self.gen_expr(a_expr, t, false)?;
        if deadend {
            return Ok((Operand::Nowhere, true, false));
        }

        let mut saved_a = [LiveOperand { ty: t, op: a }];
        let save_a: &mut [LiveOperand] = if t != ValueType::Void {
            &mut saved_a
        } else {
            &mut []
        };
        let (b, deadend) = self.gen_expr_saving(b_expr, t, false, save_a)?;
        if deadend {
            self.discard(t, saved_a[0].op);
            return Ok((Operand::Nowhere, true, false));
        }

        let mut saved_ab = [saved_a[0], LiveOperand { ty: t, op: b }];
        let save_ab: &mut [LiveOperand] = if t != ValueType::Void {
            &mut saved_ab
        } else {
            &mut []
        };
        let (cond, deadend) = self.gen_expr_saving(cond_expr, ValueType::I32, false, save_ab)?;
        if deadend {
            self.discard(t, saved_ab[1].op);
            self.discard(t, saved_ab[0].op);
            return Ok((Operand::Nowhere, true, false));
        }
        let a = saved_ab[0].op;
        let b = saved_ab[1].op;

        if let Some(value) = cond.check_imm_value(ValueType::I32) {
            let result = if value != 0 {
                self.discard(t, b);
                a
            } else {
                self.discard(t, a);
                b
            };
            return Ok((result, false, false));
        }

        if t == ValueType::Void {
            self.discard(ValueType::I32, cond);
            return Ok((Operand::Nowhere, false, false));
        }

        let b = self.materialize(t, b);
        let a = self.materialize(t, a);
        let cond = self.preload(ValueType::I32, cond);
        let result = M::select(self, t, a, b, cond);
        Ok((result, false, false))
    }
}
