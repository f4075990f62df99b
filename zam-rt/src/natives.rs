//! The `extern "C"` symbol surface the generated code calls into.
//!
//! Conventions: values are tagged machine words; indices, counts and tags
//! are raw integers; argument vectors are passed as the address of a word
//! array. All cross-call state (globals, environment, trap stack, pending
//! exception, primitive table) is thread-local, so concurrent runs on
//! separate threads are isolated.

use std::cell::{Cell, RefCell};

use crate::heap::{self, PAP_TAG};
use crate::value::{UNIT, Word, int_val, is_int, is_ptr, val_int};

// ---------------------------------------------------------------------------
// Thread-local machine state
// ---------------------------------------------------------------------------

thread_local! {
    static GLOBALS: RefCell<Vec<Word>> = const { RefCell::new(Vec::new()) };
    static ENV: Cell<Word> = const { Cell::new(UNIT) };
    static TRAPS: RefCell<Vec<TrapFrame>> = const { RefCell::new(Vec::new()) };
    static PENDING_EXN: Cell<Word> = const { Cell::new(UNIT) };
    static UNCAUGHT: Cell<Option<Word>> = const { Cell::new(None) };
    static PRIMS: RefCell<Vec<Option<Prim>>> = const { RefCell::new(Vec::new()) };
    static RT_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// A `jmp_buf` large enough for any libc we target (glibc x86_64 uses 200
/// bytes; aarch64 a bit more).
#[repr(C, align(16))]
struct JmpBuf([u8; 512]);

/// One installed exception handler: the jump buffer `_setjmp` filled in and
/// the environment current when the handler was installed. The environment
/// is restored before unwinding so handler code observes the installing
/// function's closure, not the raising one's.
struct TrapFrame {
    buf: Box<JmpBuf>,
    saved_env: Word,
}

unsafe extern "C" {
    fn longjmp(buf: *mut JmpBuf, val: i32) -> !;
    fn _setjmp(buf: *mut JmpBuf) -> i32;
}

/// Address of libc's `_setjmp`, for registration with the JIT by name.
pub fn setjmp_symbol() -> usize {
    _setjmp as usize
}

/// Record a runtime error. Checked by the host after execution.
pub fn set_error(msg: String) {
    RT_ERROR.with(|e| *e.borrow_mut() = Some(msg));
}

/// Take and clear any pending runtime error.
pub fn take_error() -> Option<String> {
    RT_ERROR.with(|e| e.borrow_mut().take())
}

/// Take the value of an uncaught raise, if the last run ended in one.
pub fn take_uncaught() -> Option<Word> {
    UNCAUGHT.take()
}

/// Size the global table to `n` unit entries.
pub fn init_globals(n: usize) {
    GLOBALS.with(|g| {
        let mut g = g.borrow_mut();
        g.clear();
        g.resize(n, UNIT);
    });
}

/// Clear all machine state between runs. Outstanding heap pointers from the
/// previous run become dangling.
pub fn reset() {
    GLOBALS.with(|g| g.borrow_mut().clear());
    ENV.set(UNIT);
    TRAPS.with(|t| t.borrow_mut().clear());
    PENDING_EXN.set(UNIT);
    UNCAUGHT.set(None);
    PRIMS.with(|p| p.borrow_mut().clear());
    RT_ERROR.with(|e| *e.borrow_mut() = None);
    heap::reset();
}

// ---------------------------------------------------------------------------
// Primitive table
// ---------------------------------------------------------------------------

/// A native primitive, dispatched by index through `primCall*`.
#[derive(Clone, Copy)]
pub enum Prim {
    P1(fn(Word) -> Word),
    P2(fn(Word, Word) -> Word),
    P3(fn(Word, Word, Word) -> Word),
    N(fn(*const Word, usize) -> Word),
}

fn prim_print_int(v: Word) -> Word {
    print!("{}", int_val(v));
    UNIT
}

fn prim_print_char(v: Word) -> Word {
    if let Some(c) = char::from_u32(int_val(v) as u32) {
        print!("{}", c);
    }
    UNIT
}

fn prim_print_newline(_: Word) -> Word {
    println!();
    UNIT
}

fn prim_abs_int(v: Word) -> Word {
    val_int(int_val(v).abs())
}

fn builtin(name: &str) -> Option<Prim> {
    match name {
        "print_int" => Some(Prim::P1(prim_print_int)),
        "print_char" => Some(Prim::P1(prim_print_char)),
        "print_newline" => Some(Prim::P1(prim_print_newline)),
        "abs_int" => Some(Prim::P1(prim_abs_int)),
        _ => None,
    }
}

/// Bind primitive index `idx` to the named builtin.
pub fn register_prim(idx: usize, name: &str) -> Result<(), String> {
    let prim = builtin(name).ok_or_else(|| format!("unknown primitive '{}'", name))?;
    PRIMS.with(|p| {
        let mut p = p.borrow_mut();
        if p.len() <= idx {
            p.resize(idx + 1, None);
        }
        p[idx] = Some(prim);
    });
    Ok(())
}

fn prim_at(idx: u64) -> Option<Prim> {
    PRIMS.with(|p| p.borrow().get(idx as usize).copied().flatten())
}

fn prim_missing(idx: u64) -> Word {
    log::warn!("primitive {} is not registered", idx);
    set_error(format!("primitive {} is not registered", idx));
    UNIT
}

// ---------------------------------------------------------------------------
// Record and global access
// ---------------------------------------------------------------------------

#[unsafe(no_mangle)]
pub extern "C" fn getField(obj: Word, i: u64) -> Word {
    heap::field(obj, i as usize)
}

#[unsafe(no_mangle)]
pub extern "C" fn setField(obj: Word, i: u64, v: Word) -> Word {
    heap::set_field(obj, i as usize, v);
    UNIT
}

#[unsafe(no_mangle)]
pub extern "C" fn getEnv() -> Word {
    ENV.get()
}

#[unsafe(no_mangle)]
pub extern "C" fn setEnv(e: Word) -> Word {
    ENV.set(e);
    UNIT
}

#[unsafe(no_mangle)]
pub extern "C" fn getGlobal(i: u64) -> Word {
    GLOBALS.with(|g| g.borrow().get(i as usize).copied().unwrap_or(UNIT))
}

#[unsafe(no_mangle)]
pub extern "C" fn setGlobal(i: u64, v: Word) -> Word {
    GLOBALS.with(|g| {
        let mut g = g.borrow_mut();
        if g.len() <= i as usize {
            g.resize(i as usize + 1, UNIT);
        }
        g[i as usize] = v;
    });
    UNIT
}

#[unsafe(no_mangle)]
pub extern "C" fn getAtom(tag: u64) -> Word {
    heap::atom(tag as usize)
}

// ---------------------------------------------------------------------------
// Allocation
// ---------------------------------------------------------------------------

#[unsafe(no_mangle)]
pub extern "C" fn makeBlock1(tag: u64, a: Word) -> Word {
    let b = heap::alloc_block(1, tag as u8, 0);
    heap::set_field(b, 0, a);
    b
}

#[unsafe(no_mangle)]
pub extern "C" fn makeBlock2(tag: u64, a: Word, b2: Word) -> Word {
    let b = heap::alloc_block(2, tag as u8, 0);
    heap::set_field(b, 0, a);
    heap::set_field(b, 1, b2);
    b
}

#[unsafe(no_mangle)]
pub extern "C" fn makeBlock3(tag: u64, a: Word, b2: Word, c: Word) -> Word {
    let b = heap::alloc_block(3, tag as u8, 0);
    heap::set_field(b, 0, a);
    heap::set_field(b, 1, b2);
    heap::set_field(b, 2, c);
    b
}

/// Generic allocation: `argv` points at `size` field words.
#[unsafe(no_mangle)]
pub extern "C" fn makeBlock(tag: u64, size: u64, argv: Word) -> Word {
    let b = heap::alloc_block(size as usize, tag as u8, 0);
    for i in 0..size as usize {
        heap::set_field(b, i, unsafe { *(argv as *const Word).add(i) });
    }
    b
}

#[unsafe(no_mangle)]
pub extern "C" fn makeClosure(nvars: u64, code: Word, arity: u64) -> Word {
    heap::alloc_closure(nvars as usize, code, arity as usize)
}

#[unsafe(no_mangle)]
pub extern "C" fn closureSetVar(clos: Word, i: u64, v: Word) -> Word {
    heap::set_field(clos, 1 + i as usize, v);
    UNIT
}

// ---------------------------------------------------------------------------
// Application
// ---------------------------------------------------------------------------

/// Call the applier stored in a closure with exactly `argc` arguments,
/// switching the current environment to the closure for the duration.
fn dispatch(clos: Word, args: *const Word, argc: usize) -> Word {
    let code = heap::field(clos, 0);
    let f: extern "C" fn(Word, Word, Word) -> Word =
        unsafe { std::mem::transmute(code as usize) };
    let saved = ENV.get();
    ENV.set(clos);
    let r = f(clos, argc as Word, args as Word);
    ENV.set(saved);
    r
}

fn apply_words(clos: Word, args: *const Word, argc: usize) -> Word {
    if is_int(clos) {
        set_error("apply of a non-closure value".to_string());
        return UNIT;
    }
    // Partial application: prepend the saved arguments and retry on the
    // inner closure. The combined vector lives in the arena, not this
    // frame, so a raise below can unwind past us.
    if heap::tag_of(clos) == PAP_TAG {
        let saved = heap::size_of(clos) - 1;
        let buf = heap::alloc_scratch(saved + argc);
        for i in 0..saved {
            unsafe { *buf.add(i) = heap::field(clos, 1 + i) };
        }
        for i in 0..argc {
            unsafe { *buf.add(saved + i) = *args.add(i) };
        }
        return apply_words(heap::field(clos, 0), buf, saved + argc);
    }
    let arity = heap::arity_of(clos);
    if argc == arity {
        dispatch(clos, args, argc)
    } else if argc < arity {
        let pap = heap::alloc_block(argc + 1, PAP_TAG, 0);
        heap::set_field(pap, 0, clos);
        for i in 0..argc {
            heap::set_field(pap, 1 + i, unsafe { *args.add(i) });
        }
        pap
    } else {
        let r = dispatch(clos, args, arity);
        apply_words(r, unsafe { args.add(arity) }, argc - arity)
    }
}

/// Trampoline entry: apply `clos` to the `argc` arguments at `argv`,
/// currying as needed.
#[unsafe(no_mangle)]
pub extern "C" fn apply(clos: Word, argc: u64, argv: Word) -> Word {
    apply_words(clos, argv as *const Word, argc as usize)
}

// ---------------------------------------------------------------------------
// Primitive calls
// ---------------------------------------------------------------------------

#[unsafe(no_mangle)]
pub extern "C" fn primCall1(idx: u64, a: Word) -> Word {
    match prim_at(idx) {
        Some(Prim::P1(f)) => f(a),
        Some(Prim::N(f)) => f(&a, 1),
        _ => prim_missing(idx),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn primCall2(idx: u64, a: Word, b: Word) -> Word {
    match prim_at(idx) {
        Some(Prim::P2(f)) => f(a, b),
        Some(Prim::N(f)) => f([a, b].as_ptr(), 2),
        _ => prim_missing(idx),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn primCall3(idx: u64, a: Word, b: Word, c: Word) -> Word {
    match prim_at(idx) {
        Some(Prim::P3(f)) => f(a, b, c),
        Some(Prim::N(f)) => f([a, b, c].as_ptr(), 3),
        _ => prim_missing(idx),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn primCall4(idx: u64, a: Word, b: Word, c: Word, d: Word) -> Word {
    match prim_at(idx) {
        Some(Prim::N(f)) => f([a, b, c, d].as_ptr(), 4),
        _ => prim_missing(idx),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn primCall5(idx: u64, a: Word, b: Word, c: Word, d: Word, e: Word) -> Word {
    match prim_at(idx) {
        Some(Prim::N(f)) => f([a, b, c, d, e].as_ptr(), 5),
        _ => prim_missing(idx),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn primCalln(idx: u64, argc: u64, argv: Word) -> Word {
    match prim_at(idx) {
        Some(Prim::N(f)) => f(argv as *const Word, argc as usize),
        _ => prim_missing(idx),
    }
}

// ---------------------------------------------------------------------------
// Exceptions
// ---------------------------------------------------------------------------

/// Push a fresh trap frame and return the address of its jump buffer. The
/// generated code passes it straight to `_setjmp`.
#[unsafe(no_mangle)]
pub extern "C" fn getNewBuffer() -> Word {
    let mut frame = TrapFrame {
        buf: Box::new(JmpBuf([0; 512])),
        saved_env: ENV.get(),
    };
    let ptr = frame.buf.as_mut() as *mut JmpBuf;
    TRAPS.with(|t| t.borrow_mut().push(frame));
    ptr as Word
}

/// Pop the innermost trap frame.
#[unsafe(no_mangle)]
pub extern "C" fn removeExceptionContext() -> Word {
    TRAPS.with(|t| t.borrow_mut().pop());
    UNIT
}

/// The value carried by the exception being handled.
#[unsafe(no_mangle)]
pub extern "C" fn getExceptionValue() -> Word {
    PENDING_EXN.get()
}

/// Raise `v`: unwind to the innermost trap frame, or record an uncaught
/// exception and return so the generated `ret` terminates the frame.
#[unsafe(no_mangle)]
pub extern "C" fn throwException(v: Word) -> Word {
    PENDING_EXN.set(v);
    let target = TRAPS.with(|t| {
        t.borrow()
            .last()
            .map(|f| (f.buf.as_ref() as *const JmpBuf as *mut JmpBuf, f.saved_env))
    });
    match target {
        Some((buf, saved_env)) => {
            ENV.set(saved_env);
            // The frames skipped are generated code plus this one; nothing
            // with a destructor is live across the jump.
            unsafe { longjmp(buf, 1) }
        }
        None => {
            UNCAUGHT.set(Some(v));
            v
        }
    }
}

/// Print a value to stderr. Wired into generated code under `--trace`.
#[unsafe(no_mangle)]
pub extern "C" fn debug(v: Word) -> Word {
    if is_int(v) {
        eprintln!("[zam] int {} (raw {:#x})", int_val(v), v);
    } else if is_ptr(v) && v != 0 {
        eprintln!("[zam] block tag={} size={}", heap::tag_of(v), heap::size_of(v));
    } else {
        eprintln!("[zam] raw {:#x}", v);
    }
    UNIT
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn add2_applier(_clos: Word, argc: Word, argv: Word) -> Word {
        assert_eq!(argc, 2);
        let args = argv as *const Word;
        let (a, b) = unsafe { (*args, *args.add(1)) };
        val_int(int_val(a) + int_val(b))
    }

    extern "C" fn make_adder_applier(_clos: Word, _argc: Word, argv: Word) -> Word {
        let a = unsafe { *(argv as *const Word) };
        let c = heap::alloc_closure(1, add_captured_applier as usize as Word, 1);
        heap::set_field(c, 1, a);
        c
    }

    extern "C" fn add_captured_applier(clos: Word, _argc: Word, argv: Word) -> Word {
        let b = unsafe { *(argv as *const Word) };
        val_int(int_val(heap::field(clos, 1)) + int_val(b))
    }

    fn call(clos: Word, args: &[Word]) -> Word {
        apply(clos, args.len() as u64, args.as_ptr() as Word)
    }

    #[test]
    fn globals_round_trip() {
        init_globals(2);
        setGlobal(1, val_int(99));
        assert_eq!(int_val(getGlobal(1)), 99);
        assert_eq!(getGlobal(0), UNIT);
        reset();
    }

    #[test]
    fn apply_exact_arity() {
        let c = heap::alloc_closure(0, add2_applier as usize as Word, 2);
        let r = call(c, &[val_int(40), val_int(2)]);
        assert_eq!(int_val(r), 42);
        reset();
    }

    #[test]
    fn apply_under_then_complete() {
        let c = heap::alloc_closure(0, add2_applier as usize as Word, 2);
        let pap = call(c, &[val_int(40)]);
        assert_eq!(heap::tag_of(pap), PAP_TAG);
        let r = call(pap, &[val_int(2)]);
        assert_eq!(int_val(r), 42);
        reset();
    }

    #[test]
    fn apply_over_arity() {
        let c = heap::alloc_closure(0, make_adder_applier as usize as Word, 1);
        let r = call(c, &[val_int(40), val_int(2)]);
        assert_eq!(int_val(r), 42);
        reset();
    }

    #[test]
    fn env_switches_during_dispatch() {
        let c = heap::alloc_closure(1, env_probe_applier as usize as Word, 0);
        heap::set_field(c, 1, val_int(7));
        setEnv(val_int(0));
        let r = call(c, &[]);
        assert_eq!(int_val(r), 7);
        // restored after dispatch
        assert_eq!(getEnv(), val_int(0));
        reset();
    }

    extern "C" fn env_probe_applier(_clos: Word, _argc: Word, _argv: Word) -> Word {
        heap::field(getEnv(), 1)
    }

    #[test]
    fn uncaught_raise_is_recorded() {
        let r = throwException(val_int(9));
        assert_eq!(int_val(r), 9);
        assert_eq!(take_uncaught(), Some(val_int(9)));
        assert_eq!(take_uncaught(), None);
        reset();
    }

    #[test]
    fn trap_frames_push_and_pop() {
        let b1 = getNewBuffer();
        let b2 = getNewBuffer();
        assert_ne!(b1, b2);
        removeExceptionContext();
        removeExceptionContext();
        // empty again: a raise now is uncaught
        throwException(val_int(1));
        assert!(take_uncaught().is_some());
        reset();
    }

    #[test]
    fn primitives_dispatch_by_index() {
        register_prim(3, "abs_int").unwrap();
        assert_eq!(int_val(primCall1(3, val_int(-12))), 12);
        assert!(register_prim(0, "no_such_prim").is_err());
        // unregistered index records an error and yields unit
        assert_eq!(primCall1(9, val_int(1)), UNIT);
        assert!(take_error().is_some());
        reset();
    }
}
