//! Runtime ABI declarations.
//!
//! Every symbol the generated code may call is declared in the LLVM module
//! up front and bound to its `zam-rt` address when the execution engine is
//! created. Signatures are machine-word unified: every parameter and
//! return is i64, except `_setjmp` which returns the C `int`.

use std::collections::HashMap;

use inkwell::attributes::{Attribute, AttributeLoc};
use inkwell::context::Context;
use inkwell::execution_engine::ExecutionEngine;
use inkwell::module::Module;
use inkwell::types::BasicMetadataTypeEnum;
use inkwell::values::FunctionValue;

/// Names of all runtime symbols we declare.
pub(super) const RUNTIME_NAMES: &[&str] = &[
    "getField",
    "setField",
    "getEnv",
    "setEnv",
    "getGlobal",
    "setGlobal",
    "getAtom",
    "makeBlock1",
    "makeBlock2",
    "makeBlock3",
    "makeBlock",
    "makeClosure",
    "closureSetVar",
    "apply",
    "primCall1",
    "primCall2",
    "primCall3",
    "primCall4",
    "primCall5",
    "primCalln",
    "getNewBuffer",
    "removeExceptionContext",
    "getExceptionValue",
    "throwException",
    "debug",
    "_setjmp",
];

fn param_count(name: &str) -> usize {
    match name {
        "getEnv" | "getNewBuffer" | "removeExceptionContext" | "getExceptionValue" => 0,
        "setEnv" | "getGlobal" | "getAtom" | "throwException" | "debug" | "_setjmp" => 1,
        "getField" | "setGlobal" | "makeBlock1" | "primCall1" => 2,
        "setField" | "makeBlock2" | "makeBlock" | "makeClosure" | "closureSetVar" | "apply"
        | "primCall2" | "primCalln" => 3,
        "makeBlock3" | "primCall3" => 4,
        "primCall4" => 5,
        "primCall5" => 6,
        _ => unreachable!("unknown runtime symbol {name}"),
    }
}

pub(super) struct Runtime {
    fns: HashMap<&'static str, FunctionValue<'static>>,
}

impl Runtime {
    pub(super) fn declare(context: &'static Context, module: &Module<'static>) -> Runtime {
        let i64t = context.i64_type();
        let i32t = context.i32_type();
        let mut fns = HashMap::new();
        for &name in RUNTIME_NAMES {
            let params: Vec<BasicMetadataTypeEnum> =
                (0..param_count(name)).map(|_| i64t.into()).collect();
            let ty = if name == "_setjmp" {
                i32t.fn_type(&params, false)
            } else {
                i64t.fn_type(&params, false)
            };
            let f = module.add_function(name, ty, None);
            if name == "_setjmp" {
                // The save point returns twice; without this attribute LLVM
                // may keep values in registers across the second return.
                let kind = Attribute::get_named_enum_kind_id("returns_twice");
                f.add_attribute(AttributeLoc::Function, context.create_enum_attribute(kind, 0));
            }
            fns.insert(name, f);
        }
        Runtime { fns }
    }

    pub(super) fn get(&self, name: &str) -> FunctionValue<'static> {
        self.fns[name]
    }

    /// Bind every declared symbol to its `zam-rt` address.
    pub(super) fn map_symbols(&self, engine: &ExecutionEngine<'static>) {
        use zam_rt::natives;
        let addrs: &[(&str, usize)] = &[
            ("getField", natives::getField as usize),
            ("setField", natives::setField as usize),
            ("getEnv", natives::getEnv as usize),
            ("setEnv", natives::setEnv as usize),
            ("getGlobal", natives::getGlobal as usize),
            ("setGlobal", natives::setGlobal as usize),
            ("getAtom", natives::getAtom as usize),
            ("makeBlock1", natives::makeBlock1 as usize),
            ("makeBlock2", natives::makeBlock2 as usize),
            ("makeBlock3", natives::makeBlock3 as usize),
            ("makeBlock", natives::makeBlock as usize),
            ("makeClosure", natives::makeClosure as usize),
            ("closureSetVar", natives::closureSetVar as usize),
            ("apply", natives::apply as usize),
            ("primCall1", natives::primCall1 as usize),
            ("primCall2", natives::primCall2 as usize),
            ("primCall3", natives::primCall3 as usize),
            ("primCall4", natives::primCall4 as usize),
            ("primCall5", natives::primCall5 as usize),
            ("primCalln", natives::primCalln as usize),
            ("getNewBuffer", natives::getNewBuffer as usize),
            ("removeExceptionContext", natives::removeExceptionContext as usize),
            ("getExceptionValue", natives::getExceptionValue as usize),
            ("throwException", natives::throwException as usize),
            ("debug", natives::debug as usize),
            ("_setjmp", natives::setjmp_symbol()),
        ];
        for &(name, addr) in addrs {
            engine.add_global_mapping(&self.fns[name], addr);
        }
    }
}
