//! Code generation: operand tracking, register pools, labels, the
//! per-function coder and the program-level driver.

pub mod coder;
pub mod link;
pub mod objmap;
pub mod operand;
pub mod program;
pub mod regalloc;
pub mod textbuf;

/// Width of one virtual-stack slot in bytes.  Every pushed value
/// occupies a full word regardless of its type.
pub const WORD_SIZE: i32 = 8;

pub use program::{compile, Compiled, CompileConfig, Event};
