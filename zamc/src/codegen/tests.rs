//! End-to-end tests: assemble, lift, execute, check the accumulator.

use crate::error::{CompileError, ZamError};
use zam_rt::value::{int_val, is_int, is_ptr};

fn run_raw(src: &str) -> u64 {
    crate::run_source(src, false).expect("compile+run failed")
}

fn run_int(src: &str) -> i64 {
    let raw = run_raw(src);
    assert!(is_int(raw), "expected a tagged integer, got {raw:#x}");
    int_val(raw)
}

#[test]
fn constant_returns() {
    assert_eq!(run_int("CONST1\nRETURN"), 1);
}

#[test]
fn push_then_add() {
    let src = "
        CONST2
        PUSH
        CONST3
        ADDINT
        RETURN
    ";
    assert_eq!(run_int(src), 5);
}

#[test]
fn sub_takes_stack_top_minus_accumulator() {
    let src = "
        CONST3
        PUSHCONST2
        SUBINT
        RETURN
    ";
    assert_eq!(run_int(src), 1);
}

#[test]
fn arithmetic_keeps_the_tag() {
    assert_eq!(run_int("CONSTINT 6\nPUSH\nCONSTINT 7\nMULINT\nRETURN"), 42);
    assert_eq!(run_int("CONSTINT 3\nPUSH\nCONSTINT 42\nDIVINT\nRETURN"), 14);
    assert_eq!(run_int("CONSTINT 5\nPUSH\nCONSTINT 42\nMODINT\nRETURN"), 2);
    assert_eq!(run_int("CONSTINT 42\nNEGINT\nRETURN"), -42);
    assert_eq!(run_int("CONSTINT 40\nOFFSETINT 2\nRETURN"), 42);
    assert_eq!(run_int("CONSTINT 1\nOFFSETINT -1\nRETURN"), 0);
    assert_eq!(run_int("CONSTINT -6\nPUSH\nCONSTINT -7\nMULINT\nRETURN"), 42);
}

#[test]
fn comparisons_yield_tagged_booleans() {
    assert_eq!(run_int("CONSTINT 3\nPUSH\nCONSTINT 7\nGTINT\nRETURN"), 1);
    assert_eq!(run_int("CONSTINT 3\nPUSH\nCONSTINT 7\nLTINT\nRETURN"), 0);
    assert_eq!(run_int("CONSTINT 7\nPUSH\nCONSTINT 7\nEQ\nRETURN"), 1);
    assert_eq!(run_int("CONSTINT 7\nPUSH\nCONSTINT 7\nNEQ\nRETURN"), 0);
    // -1 is unsigned-huge: not below 5
    assert_eq!(run_int("CONSTINT 5\nPUSH\nCONSTINT -1\nULTINT\nRETURN"), 0);
    assert_eq!(run_int("CONSTINT 5\nPUSH\nCONSTINT -1\nUGEINT\nRETURN"), 1);
}

#[test]
fn branchifnot_on_false_takes_the_branch() {
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
    assert_eq!(run_int(src), 2);
}

#[test]
fn branchif_on_true_takes_the_branch() {
    let src = "
        CONST1
        BRANCHIF yes
        CONST0
        RETURN
    yes:
        CONSTINT 42
        RETURN
    ";
    assert_eq!(run_int(src), 42);
}

#[test]
fn immediate_comparison_branches() {
    let src = "
        CONSTINT 5
        BEQ 5 hit
        CONST0
        RETURN
    hit:
        CONST1
        RETURN
    ";
    assert_eq!(run_int(src), 1);

    // BLTINT branches when imm < accu
    let src = "
        CONSTINT 5
        BLTINT 3 hit
        CONST0
        RETURN
    hit:
        CONST1
        RETURN
    ";
    assert_eq!(run_int(src), 1);

    let src = "
        CONSTINT 2
        BGEINT 3 hit
        CONST0
        RETURN
    hit:
        CONST1
        RETURN
    ";
    assert_eq!(run_int(src), 1);
}

#[test]
fn stack_slot_join_across_a_diamond() {
    let src = "
        CONST0
        BRANCHIFNOT left
        CONSTINT 10
        PUSH
        BRANCH merge
    left:
        CONSTINT 20
        PUSH
        BRANCH merge
    merge:
        ACC0
        RETURN
    ";
    assert_eq!(run_int(src), 20);
}

#[test]
fn deep_read_through_a_block_chain() {
    let src = "
        CONSTINT 9
        PUSH
        BRANCH a
    a:
        BRANCH b
    b:
        ACC0
        RETURN
    ";
    assert_eq!(run_int(src), 9);
}

#[test]
fn assign_is_visible_through_the_mutation_map() {
    let src = "
        CONST1
        PUSH
        CONSTINT 5
        ASSIGN 0
        ACC0
        RETURN
    ";
    assert_eq!(run_int(src), 5);
}

#[test]
fn countdown_loop_converges() {
    let src = "
        CONSTINT 10
        PUSH
    loop:
        ACC0
        BRANCHIFNOT exit
        ACC0
        OFFSETINT -1
        ASSIGN 0
        BRANCH loop
    exit:
        ACC0
        RETURN
    ";
    assert_eq!(run_int(src), 0);
}

#[test]
fn summing_loop_carries_two_slots() {
    // stack[0] = sum, stack[1] = i; sum += i while i != 0
    let src = "
        CONSTINT 5
        PUSH
        CONST0
        PUSH
    loop:
        ACC1
        BRANCHIFNOT exit
        ACC0
        PUSH
        ACC2
        ADDINT
        ASSIGN 0
        ACC1
        OFFSETINT -1
        ASSIGN 1
        BRANCH loop
    exit:
        ACC0
        RETURN
    ";
    assert_eq!(run_int(src), 15);
}

#[test]
fn closure_direct_call() {
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
    assert_eq!(run_int(src), 5);
}

#[test]
fn direct_call_passes_arguments_in_stack_order() {
    // f(a, b) = a - b with a at stack[0] of the call site
    let src = "
        CONSTINT 2
        PUSH
        CONSTINT 44
        PUSH
        CLOSURE 0 f 2
        APPLY2
        RETURN
    f:
        ACC0
        PUSH
        ACC2
        SUBINT
        RETURN
    ";
    assert_eq!(run_int(src), 42);
}

#[test]
fn captured_variable_goes_through_the_trampoline() {
    let src = "
        CONSTINT 10
        CLOSURE 1 f
        PUSH
        CONSTINT 32
        PUSH
        ACC1
        APPLY1
        RETURN
    f:
        ACC0
        PUSH
        ENVACC1
        ADDINT
        RETURN
    ";
    assert_eq!(run_int(src), 42);
}

#[test]
fn under_application_builds_a_partial_application() {
    let src = "
        CONSTINT 40
        PUSH
        CLOSURE 0 f 2
        APPLY1
        PUSH
        CONSTINT 2
        PUSH
        ACC1
        APPLY1
        RETURN
    f:
        ACC0
        PUSH
        ACC2
        ADDINT
        RETURN
    ";
    assert_eq!(run_int(src), 42);
}

#[test]
fn over_application_applies_the_returned_closure() {
    let src = "
        CONSTINT 2
        PUSH
        CONSTINT 40
        PUSH
        CLOSURE 0 f
        APPLY2
        RETURN
    f:
        ACC0
        CLOSURE 1 g
        RETURN
    g:
        ACC0
        PUSH
        ENVACC1
        ADDINT
        RETURN
    ";
    assert_eq!(run_int(src), 42);
}

#[test]
fn recursive_closure_computes_factorial() {
    let src = "
        CLOSUREREC 1 0 fact
        CONSTINT 5
        PUSH
        ACC1
        APPLY1
        RETURN
    fact:
        ACC0
        BRANCHIFNOT base
        ACC0
        OFFSETINT -1
        PUSH
        OFFSETCLOSURE0
        APPLY1
        PUSH
        ACC1
        MULINT
        RETURN
    base:
        CONST1
        RETURN
    ";
    assert_eq!(run_int(src), 120);
}

#[test]
fn appterm_tail_calls_the_callee() {
    let src = "
        CONSTINT 41
        PUSH
        CLOSURE 0 f
        APPLY1
        RETURN
    f:
        ACC0
        PUSH
        CLOSURE 0 g
        APPTERM1
    g:
        ACC0
        OFFSETINT 1
        RETURN
    ";
    assert_eq!(run_int(src), 42);
}

#[test]
fn makeblock_and_field_access() {
    let src = "
        CONST2
        PUSH
        CONST1
        MAKEBLOCK2 0
        GETFIELD1
        RETURN
    ";
    assert_eq!(run_int(src), 2);
}

#[test]
fn setfield_updates_in_place() {
    let src = "
        CONST2
        PUSH
        CONST1
        MAKEBLOCK2 0
        PUSH
        CONSTINT 9
        PUSH
        ACC1
        SETFIELD0
        GETFIELD0
        RETURN
    ";
    assert_eq!(run_int(src), 9);
}

#[test]
fn generic_makeblock_collects_accu_and_stack() {
    let src = "
        CONSTINT 13
        PUSH
        CONSTINT 12
        PUSH
        CONSTINT 11
        PUSH
        CONSTINT 10
        MAKEBLOCK 4 0
        GETFIELD3
        RETURN
    ";
    assert_eq!(run_int(src), 13);
}

#[test]
fn atoms_are_pointers() {
    let raw = run_raw("ATOM 3\nRETURN");
    assert!(is_ptr(raw));
}

#[test]
fn globals_round_trip() {
    let src = "
        GLOBALS 1
        CONSTINT 7
        SETGLOBAL 0
        CONST0
        GETGLOBAL 0
        RETURN
    ";
    assert_eq!(run_int(src), 7);
}

#[test]
fn primitive_call_dispatches_by_index() {
    let src = "
        PRIM 2 abs_int
        CONSTINT -12
        C_CALL1 2
        RETURN
    ";
    assert_eq!(run_int(src), 12);
}

#[test]
fn initial_accumulator_comes_from_the_loader() {
    assert_eq!(run_int("ACCU 41\nOFFSETINT 1\nRETURN"), 42);
}

#[test]
fn retaddr_sentinels_balance_with_pop() {
    let src = "
        PUSH_RETADDR
        POP 3
        CONST1
        CHECK_SIGNALS
        RETURN
    ";
    assert_eq!(run_int(src), 1);
}

#[test]
fn pushacc_duplicates_and_reads() {
    let src = "
        CONSTINT 5
        PUSH
        CONSTINT 3
        PUSHACC1
        ADDINT
        RETURN
    ";
    assert_eq!(run_int(src), 8);
}

#[test]
fn trap_delivers_the_raised_value() {
    let src = "
        PUSHTRAP handler
        CONST1
        RAISE
        POPTRAP
        RETURN
    handler:
        RETURN
    ";
    assert_eq!(run_int(src), 1);
}

#[test]
fn poptrap_on_the_normal_path() {
    let src = "
        PUSHTRAP handler
        CONST2
        POPTRAP
        RETURN
    handler:
        CONST3
        RETURN
    ";
    assert_eq!(run_int(src), 2);
}

#[test]
fn nested_traps_unwind_to_the_innermost() {
    let src = "
        PUSHTRAP outer
        PUSHTRAP inner
        CONSTINT 5
        RAISE
    inner:
        OFFSETINT 1
        RAISE
    outer:
        RETURN
    ";
    assert_eq!(run_int(src), 6);
}

#[test]
fn handler_reads_locals_below_the_trap_frame() {
    let src = "
        CONSTINT 5
        PUSH
        PUSHTRAP handler
        CONST1
        RAISE
    handler:
        ACC0
        RETURN
    ";
    assert_eq!(run_int(src), 5);
}

#[test]
fn uncaught_raise_is_a_crash() {
    let src = "
        CONSTINT 9
        RAISE
    ";
    match crate::run_source(src, false) {
        Err(ZamError::Uncaught(9)) => {}
        other => panic!("expected an uncaught exception, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn reading_an_absent_slot_is_rejected() {
    match crate::run_source("ACC0\nRETURN", false) {
        Err(ZamError::Compile(CompileError::StackAccess { block: 0, depth: 0 })) => {}
        other => panic!("expected a stack access error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn unsupported_closurerec_shape_is_rejected() {
    let src = "
        CLOSUREREC 2 1 f
        RETURN
    f:
        RETURN
    ";
    match crate::run_source(src, false) {
        Err(ZamError::Compile(CompileError::ClosureRecShape { funcs: 2, vars: 1, .. })) => {}
        other => panic!("expected a CLOSUREREC shape error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn unknown_primitive_is_reported() {
    let src = "
        PRIM 0 no_such_prim
        CONST0
        RETURN
    ";
    assert!(matches!(
        crate::run_source(src, false),
        Err(ZamError::UnknownPrim { index: 0, .. })
    ));
}
