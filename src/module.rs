//! Input model: the parsed module and its typed expression trees.
//!
//! This representation is produced by a module parser (out of scope here)
//! and consumed by the code generator.  Expression nodes are a tagged sum;
//! branch targets are de Bruijn depths counted from the innermost
//! enclosing block.

use std::collections::HashMap;

use crate::types::ValueType;

/// Function signature.  `index` is the signature's slot in the runtime's
/// indirect-call signature space; only signatures used by `call_indirect`
/// need one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub params: Vec<ValueType>,
    pub result: ValueType,
    pub index: Option<u32>,
}

impl Signature {
    pub fn new(params: Vec<ValueType>, result: ValueType) -> Self {
        Self {
            params,
            result,
            index: None,
        }
    }

    pub fn with_index(params: Vec<ValueType>, result: ValueType, index: u32) -> Self {
        Self {
            params,
            result,
            index: Some(index),
        }
    }
}

/// A function imported from the embedder.
#[derive(Debug, Clone)]
pub struct Import {
    pub namespace: String,
    pub name: String,
    pub sig: usize,
}

/// Embedder-supplied implementation of an import.
///
/// `params` may be shorter than the import's declared parameter list, in
/// which case the implementation is variadic and receives the surplus
/// argument count in a register.
#[derive(Debug, Clone)]
pub struct ImportImpl {
    pub address: u64,
    pub params: Vec<ValueType>,
    pub result: ValueType,
    pub variadic: bool,
}

/// Import resolution map: namespace -> name -> implementation.
pub type ImportMap = HashMap<String, HashMap<String, ImportImpl>>;

/// Linear memory limits in 64 KiB pages.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryLimits {
    pub min_pages: u32,
    pub max_pages: Option<u32>,
}

/// A defined (non-imported) function.
#[derive(Debug, Clone)]
pub struct FuncDef {
    pub name: Option<String>,
    pub sig: usize,
    pub locals: Vec<ValueType>,
    pub body: Vec<Expr>,
}

/// A parsed module.
///
/// Function index space is imports first, then defined functions, in
/// declaration order.  `table` holds function indices for indirect calls.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub signatures: Vec<Signature>,
    pub imports: Vec<Import>,
    pub functions: Vec<FuncDef>,
    pub table: Vec<u32>,
    pub start: Option<usize>,
    pub memory: MemoryLimits,
}

impl Module {
    /// Total number of functions (imports + defined).
    pub fn num_funcs(&self) -> usize {
        self.imports.len() + self.functions.len()
    }

    /// Signature index of function `index` in the combined index space.
    pub fn func_sig(&self, index: usize) -> Option<usize> {
        if index < self.imports.len() {
            Some(self.imports[index].sig)
        } else {
            self.functions
                .get(index - self.imports.len())
                .map(|f| f.sig)
        }
    }
}

/// Integer and float unary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    // integer
    Eqz,
    Clz,
    Ctz,
    Popcnt,
    // float
    Neg,
    Abs,
    Ceil,
    Floor,
    Trunc,
    Nearest,
    Sqrt,
}

/// Binary operations.  The comparison group yields I32 regardless of the
/// operand type; `Lt`/`Gt`/`Le`/`Ge` without a sign suffix are the float
/// orderings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    DivS,
    DivU,
    RemS,
    RemU,
    And,
    Or,
    Xor,
    Shl,
    ShrS,
    ShrU,
    Rotl,
    Rotr,
    // float arithmetic
    Div,
    Min,
    Max,
    CopySign,
    // comparisons
    Eq,
    Ne,
    LtS,
    LtU,
    GtS,
    GtU,
    LeS,
    LeU,
    GeS,
    GeU,
    Lt,
    Gt,
    Le,
    Ge,
}

impl BinaryOp {
    /// Comparisons produce an I32 truth value instead of the operand type.
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::Ne
                | BinaryOp::LtS
                | BinaryOp::LtU
                | BinaryOp::GtS
                | BinaryOp::GtU
                | BinaryOp::LeS
                | BinaryOp::LeU
                | BinaryOp::GeS
                | BinaryOp::GeU
                | BinaryOp::Lt
                | BinaryOp::Gt
                | BinaryOp::Le
                | BinaryOp::Ge
        )
    }
}

/// Type conversions.  Source and destination types are carried on the
/// expression node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvertOp {
    Wrap,
    ExtendS,
    ExtendU,
    TruncS,
    TruncU,
    ConvertS,
    ConvertU,
    Demote,
    Promote,
    Reinterpret,
}

/// Memory access width for loads; sub-word loads carry their extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadWidth {
    /// Full width of the result type.
    Full,
    I8S,
    I8U,
    I16S,
    I16U,
    I32S,
    I32U,
}

/// Memory access width for stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreWidth {
    Full,
    I8,
    I16,
    I32,
}

/// A typed expression node.
#[derive(Debug, Clone)]
pub enum Expr {
    Const {
        ty: ValueType,
        bits: u64,
    },
    GetLocal(usize),
    SetLocal(usize, Box<Expr>),
    Unary {
        op: UnaryOp,
        ty: ValueType,
        arg: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        ty: ValueType,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Convert {
        op: ConvertOp,
        to: ValueType,
        from: ValueType,
        arg: Box<Expr>,
    },
    Load {
        ty: ValueType,
        width: LoadWidth,
        align: u32,
        offset: u32,
        index: Box<Expr>,
    },
    Store {
        ty: ValueType,
        width: StoreWidth,
        align: u32,
        offset: u32,
        index: Box<Expr>,
        value: Box<Expr>,
    },
    Block {
        ty: ValueType,
        name: Option<String>,
        body: Vec<Expr>,
    },
    Loop {
        ty: ValueType,
        name: Option<String>,
        body: Vec<Expr>,
    },
    If {
        ty: ValueType,
        cond: Box<Expr>,
        then: Vec<Expr>,
        els: Option<Vec<Expr>>,
    },
    Br {
        depth: usize,
        value: Option<Box<Expr>>,
    },
    BrIf {
        depth: usize,
        value: Option<Box<Expr>>,
        cond: Box<Expr>,
    },
    BrTable {
        targets: Vec<usize>,
        default: usize,
        value: Option<Box<Expr>>,
        cond: Box<Expr>,
    },
    Return(Option<Box<Expr>>),
    Call {
        func: usize,
        args: Vec<Expr>,
    },
    CallIndirect {
        sig: usize,
        index: Box<Expr>,
        args: Vec<Expr>,
    },
    Select {
        a: Box<Expr>,
        b: Box<Expr>,
        cond: Box<Expr>,
    },
    Drop(Box<Expr>),
    Nop,
    Unreachable,
    MemorySize,
    MemoryGrow(Box<Expr>),
}

impl Expr {
    /// Nodes with no side effects; live operands need not be pinned
    /// across their evaluation.
    pub fn is_pure_leaf(&self) -> bool {
        matches!(
            self,
            Expr::Const { .. } | Expr::GetLocal(_) | Expr::Nop | Expr::Unreachable
        )
    }

    pub fn i32_const(value: i32) -> Expr {
        Expr::Const {
            ty: ValueType::I32,
            bits: value as u32 as u64,
        }
    }

    pub fn i64_const(value: i64) -> Expr {
        Expr::Const {
            ty: ValueType::I64,
            bits: value as u64,
        }
    }

    pub fn f32_const(value: f32) -> Expr {
        Expr::Const {
            ty: ValueType::F32,
            bits: value.to_bits() as u64,
        }
    }

    pub fn f64_const(value: f64) -> Expr {
        Expr::Const {
            ty: ValueType::F64,
            bits: value.to_bits(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_const_bit_patterns() {
        match Expr::i32_const(-1) {
            Expr::Const { bits, .. } => assert_eq!(bits, 0xffff_ffff),
            _ => unreachable!(),
        }
        match Expr::f32_const(1.0) {
            Expr::Const { bits, .. } => assert_eq!(bits, 0x3f80_0000),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_func_index_space() {
        let m = Module {
            signatures: vec![Signature::new(vec![], ValueType::Void)],
            imports: vec![Import {
                namespace: "env".into(),
                name: "f".into(),
                sig: 0,
            }],
            functions: vec![FuncDef {
                name: None,
                sig: 0,
                locals: vec![],
                body: vec![],
            }],
            ..Default::default()
        };
        assert_eq!(m.num_funcs(), 2);
        assert_eq!(m.func_sig(0), Some(0));
        assert_eq!(m.func_sig(1), Some(0));
        assert_eq!(m.func_sig(2), None);
    }

    #[test]
    fn test_pure_leaves() {
        assert!(Expr::i32_const(0).is_pure_leaf());
        assert!(Expr::GetLocal(0).is_pure_leaf());
        assert!(!Expr::Drop(Box::new(Expr::Nop)).is_pure_leaf());
    }
}
