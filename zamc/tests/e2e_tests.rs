//! End-to-end scenarios through the public API: assemble a listing,
//! compile it to native code, execute, and check the final accumulator.

use zam_rt::value::{int_val, is_int};
use zamc::ZamError;

fn run(src: &str) -> i64 {
    let raw = zamc::run_source(src, false).expect("compile+run failed");
    assert!(is_int(raw), "expected a tagged integer, got {raw:#x}");
    int_val(raw)
}

#[test]
fn scenario_constant() {
    assert_eq!(run("CONST1\nRETURN"), 1);
}

#[test]
fn scenario_addition() {
    assert_eq!(run("CONST2\nPUSH\nCONST3\nADDINT\nRETURN"), 5);
}

#[test]
fn scenario_subtraction() {
    assert_eq!(run("CONST3\nPUSHCONST2\nSUBINT\nRETURN"), 1);
}

#[test]
fn scenario_conditional_branch() {
    let src = "
        CONST0
        BRANCHIFNOT else
        CONST1
        BRANCH done
    else:
        CONST2
    done:
        RETURN
    ";
    assert_eq!(run(src), 2);
}

#[test]
fn scenario_closure_application() {
    let src = "
        CONSTINT 4
        PUSH
        CLOSURE 0 f
        APPLY1
        RETURN
    f:
        ACC0
        PUSHCONST1
        ADDINT
        RETURN
    ";
    assert_eq!(run(src), 5);
}

#[test]
fn scenario_exception_handler() {
    let src = "
        PUSHTRAP handler
        CONST1
        RAISE
        POPTRAP
        RETURN
    handler:
        RETURN
    ";
    assert_eq!(run(src), 1);
}

#[test]
fn curried_application_through_the_runtime() {
    // apply a two-argument function one argument at a time
    let src = "
        CONSTINT 40
        PUSH
        CLOSURE 0 add 2
        APPLY1
        PUSH
        CONSTINT 2
        PUSH
        ACC1
        APPLY1
        RETURN
    add:
        ACC0
        PUSH
        ACC2
        ADDINT
        RETURN
    ";
    assert_eq!(run(src), 42);
}

#[test]
fn recursion_via_self_closure() {
    let src = "
        CLOSUREREC 1 0 fib
        CONSTINT 10
        PUSH
        ACC1
        APPLY1
        RETURN
    fib:
        ACC0
        BGTINT 2 small
        ACC0
        OFFSETINT -1
        PUSH
        OFFSETCLOSURE0
        APPLY1
        PUSH
        ACC1
        OFFSETINT -2
        PUSH
        OFFSETCLOSURE0
        APPLY1
        PUSH
        ACC1
        ADDINT
        RETURN
    small:
        ACC0
        RETURN
    ";
    assert_eq!(run(src), 55);
}

#[test]
fn uncaught_exception_reaches_the_host() {
    match zamc::run_source("CONSTINT 7\nRAISE", false) {
        Err(ZamError::Uncaught(7)) => {}
        other => panic!("expected an uncaught exception, got {:?}", other.map(|_| ())),
    }
}
