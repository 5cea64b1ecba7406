//! ingot - an ahead-of-time compiler core.
//!
//! Translates a typed, WebAssembly-like expression tree into native
//! machine code for x86-64 (primary) or AArch64, producing a contiguous
//! executable text buffer, a read-only data buffer (function-pointer
//! table, numeric masks and branch tables), a function entry-address
//! map, and a call-site stack-depth map for the hosting runtime.
//!
//! ```no_run
//! use ingot::{compile, CompileConfig, Module, X86_64};
//! use std::collections::HashMap;
//!
//! let module = Module::default();
//! let compiled = compile::<X86_64>(
//!     &module,
//!     &HashMap::new(),
//!     &CompileConfig::default(),
//!     None,
//! ).unwrap();
//! assert!(!compiled.text.is_empty());
//! ```

pub mod codegen;
pub mod error;
pub mod isa;
pub mod module;
pub mod traps;
pub mod types;

pub use codegen::{compile, CompileConfig, Compiled, Event};
pub use error::CompileError;
pub use isa::{AArch64, MacroAssembler, NativeAssembler, X86_64};
pub use module::{
    BinaryOp, ConvertOp, Expr, FuncDef, Import, ImportImpl, ImportMap, LoadWidth, MemoryLimits,
    Module, Signature, StoreWidth, UnaryOp,
};
pub use traps::Trap;
pub use types::ValueType;
