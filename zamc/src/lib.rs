//! ZAM JIT: a just-in-time compiler for a stack-based functional-language
//! bytecode.
//!
//! The pipeline: the loader ([`asm`]) produces an annotated instruction
//! stream; [`program`] partitions it into functions at closure boundaries;
//! [`cfg`] builds per-function basic blocks; [`codegen`] symbolically
//! executes each block against a compile-time stack/accumulator, lifting
//! the implicit machine state into LLVM SSA, and executes the result. The
//! generated code calls into the `zam-rt` runtime for allocation, closure
//! application, globals, primitives and exceptions.

pub mod asm;
pub mod cfg;
pub mod codegen;
pub mod error;
pub mod instr;
pub mod program;

pub use error::{CompileError, ZamError};

use zam_rt::natives;
use zam_rt::value::{int_val, is_int};

/// Parse, compile and execute a bytecode listing. Returns the final
/// accumulator as a raw tagged word.
pub fn run_source(text: &str, trace: bool) -> Result<u64, ZamError> {
    let source = asm::parse_source(text)?;
    run(&source, trace)
}

/// Compile and execute a loaded program.
pub fn run(source: &asm::Source, trace: bool) -> Result<u64, ZamError> {
    let program = program::partition(&source.instrs, source.initial_accu)?;
    let jit = codegen::compile(&program, trace)?;

    natives::reset();
    natives::init_globals(source.globals);
    for (idx, name) in &source.prims {
        natives::register_prim(*idx, name).map_err(|_| ZamError::UnknownPrim {
            index: *idx,
            name: name.clone(),
        })?;
    }

    let raw = jit.run() as u64;
    if let Some(v) = natives::take_uncaught() {
        let shown = if is_int(v) { int_val(v) } else { v as i64 };
        return Err(ZamError::Uncaught(shown));
    }
    if let Some(msg) = natives::take_error() {
        return Err(ZamError::Runtime(msg));
    }
    Ok(raw)
}
