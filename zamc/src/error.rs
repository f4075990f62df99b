//! Compile-time and driver error types.

use thiserror::Error;

use crate::instr::Opcode;

/// Fatal lifter errors. None of these are recoverable within the compiler;
/// callers report them and stop.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("unresolvable stack access in block {block} (depth {depth})")]
    StackAccess { block: usize, depth: i64 },

    #[error("closure target {target} at instruction {at} is not a function entry")]
    BadClosureTarget { target: usize, at: usize },

    #[error("unhandled opcode {op:?} at instruction {at}")]
    UnhandledOpcode { op: Opcode, at: usize },

    #[error(
        "CLOSUREREC with {funcs} function(s) and {vars} captured variable(s) \
         at instruction {at} is not supported"
    )]
    ClosureRecShape { funcs: i32, vars: i32, at: usize },

    #[error("branch target {target} at instruction {at} crosses a function boundary")]
    CrossFunctionBranch { target: usize, at: usize },

    #[error("block at {block} falls through past the end of its function")]
    FallthroughOutOfRange { block: usize },

    #[error("backend error: {0}")]
    Backend(String),
}

/// Errors surfaced by the driver around a compile: loading, runtime setup,
/// and post-run crash reporting.
#[derive(Debug, Error)]
pub enum ZamError {
    #[error(transparent)]
    Asm(#[from] crate::asm::AsmError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("primitive {index} ({name}) is not provided by the runtime")]
    UnknownPrim { index: usize, name: String },

    #[error("uncaught exception: {0}")]
    Uncaught(i64),

    #[error("runtime error: {0}")]
    Runtime(String),
}
