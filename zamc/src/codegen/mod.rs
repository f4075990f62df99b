//! LLVM JIT backend for ZAM bytecode.
//!
//! Compiles a partitioned program to native code via inkwell: declare
//! every function's direct and applier symbols, lift each function's
//! blocks with the symbolic executor, verify the module, then hand it to
//! MCJIT. Runtime symbols resolve to `zam-rt` addresses registered by
//! name on the execution engine.

mod block;
mod function;
mod runtime;

#[cfg(test)]
mod tests;

use inkwell::OptimizationLevel;
use inkwell::context::Context;
use inkwell::execution_engine::{ExecutionEngine, JitFunction};
use inkwell::targets::{InitializationConfig, Target};
use inkwell::values::FunctionValue;

use crate::cfg;
use crate::error::CompileError;
use crate::program::Program;

use function::FnGen;
use runtime::Runtime;

type EntryFn = unsafe extern "C" fn() -> i64;

/// A compiled program, ready to execute.
pub struct JitProgram {
    /// Keeps the engine (and code pages) alive.
    _engine: ExecutionEngine<'static>,
    entry_fn: JitFunction<'static, EntryFn>,
    /// Leaked context — lives for the duration of the program.
    _context: &'static Context,
}

impl JitProgram {
    /// Execute the entry symbol; the result is the final accumulator.
    pub fn run(&self) -> i64 {
        unsafe { self.entry_fn.call() }
    }
}

/// The two native symbols of one function: the direct body with its true
/// arity as formal parameters, and the uniform `(closure, argc, argv)`
/// applier.
#[derive(Clone, Copy)]
pub(crate) struct FnDecl {
    pub direct: FunctionValue<'static>,
    pub applier: FunctionValue<'static>,
    pub arity: usize,
}

/// Compile a partitioned program to native code.
pub fn compile(program: &Program, trace: bool) -> Result<JitProgram, CompileError> {
    Target::initialize_native(&InitializationConfig::default()).map_err(|e| {
        CompileError::Backend(format!("failed to initialize LLVM native target: {}", e))
    })?;

    // Leak the context so values and blocks are 'static across the
    // compilation structures.
    let context: &'static Context = Box::leak(Box::new(Context::create()));
    let module = context.create_module("zam");
    let builder = context.create_builder();
    let i64_type = context.i64_type();

    let rt = Runtime::declare(context, &module);

    // Phase 1: declare all symbols, so closure sites can reference
    // functions that have not been compiled yet.
    let mut decls: Vec<FnDecl> = Vec::with_capacity(program.functions.len());
    for func in &program.functions {
        let name = if func.id == 0 {
            "main".to_string()
        } else {
            format!("fn_{}", func.id)
        };
        let params: Vec<_> = (0..func.arity).map(|_| i64_type.into()).collect();
        let direct = module.add_function(&name, i64_type.fn_type(&params, false), None);
        let applier_params = [i64_type.into(), i64_type.into(), i64_type.into()];
        let applier = module.add_function(
            &format!("{name}_apply"),
            i64_type.fn_type(&applier_params, false),
            None,
        );
        decls.push(FnDecl {
            direct,
            applier,
            arity: func.arity,
        });
    }

    // Phase 2: lift each function.
    for func in &program.functions {
        let cfg = cfg::build(func)?;
        FnGen::new(context, &builder, &rt, program, &decls, func, cfg, trace).compile()?;
    }

    module.verify().map_err(|e| {
        CompileError::Backend(format!("LLVM verification failed: {}", e.to_string()))
    })?;

    if trace {
        eprintln!("--- LLVM IR ---");
        eprintln!("{}", module.print_to_string().to_string());
    }

    // MCJIT applies its own optimization pipeline during compilation.
    let engine = module
        .create_jit_execution_engine(OptimizationLevel::Aggressive)
        .map_err(|e| {
            CompileError::Backend(format!("failed to create LLVM JIT engine: {}", e.to_string()))
        })?;
    rt.map_symbols(&engine);

    let entry_fn: JitFunction<EntryFn> = unsafe {
        engine
            .get_function("main")
            .map_err(|e| CompileError::Backend(format!("failed to get entry function: {}", e)))?
    };

    if trace {
        eprintln!("JIT: module ready, {} functions", program.functions.len());
    }

    Ok(JitProgram {
        _engine: engine,
        entry_fn,
        _context: context,
    })
}
