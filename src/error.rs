//! Compilation errors.
//!
//! Only malformed input modules surface as `CompileError`; violations of
//! internal code-generator invariants panic with an `internal:` message,
//! since the coder has no well-defined state to continue from.

use crate::types::ValueType;

/// Error produced while compiling a malformed module.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("wrong number of function bodies: {got} (should be: {want})")]
    FunctionCountMismatch { got: usize, want: usize },

    #[error("argument count mismatch in call to {target}: {got} (signature has {want})")]
    ArgumentCountMismatch {
        target: String,
        got: usize,
        want: usize,
    },

    #[error("branch targets have inconsistent value types: {a} vs. {b}")]
    InconsistentBranchTypes { a: ValueType, b: ValueType },

    #[error("branch depth {depth} exceeds target stack")]
    BranchDepthOutOfRange { depth: usize },

    #[error("{context}: expression type is {got} but parent expects {want}")]
    TypeMismatch {
        context: &'static str,
        got: ValueType,
        want: ValueType,
    },

    #[error("{context}: parent expects {want} but expression does not yield a value")]
    MissingValue {
        context: &'static str,
        want: ValueType,
    },

    #[error("unknown function index {0}")]
    UnknownFunction(usize),

    #[error("unknown signature index {0}")]
    UnknownSignature(usize),

    #[error("unknown variable index {0}")]
    UnknownVariable(usize),

    #[error("signature {0} has no index for indirect calls")]
    SignatureNotIndexed(usize),

    #[error("import {namespace}.{name} has no implementation")]
    MissingImport { namespace: String, name: String },

    #[error("import {namespace}.{name} signature does not match its implementation")]
    ImportSignatureMismatch { namespace: String, name: String },
}
