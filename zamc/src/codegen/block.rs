//! Per-block symbolic execution.
//!
//! Interprets a block's instructions against a compile-time machine state
//! (operand stack of SSA values, accumulator, mutation map) and emits LLVM
//! instructions as side effects. Reads past the local stack are delegated
//! to the join machinery in `function.rs`.

use std::collections::{HashMap, VecDeque};

use inkwell::basic_block::BasicBlock;
use inkwell::values::{BasicMetadataValueEnum, IntValue, PhiValue};
use inkwell::{AddressSpace, IntPredicate};

use zam_rt::value::val_int;

use crate::error::CompileError;
use crate::instr::{Instruction, Opcode};

use super::function::{ClosureInfo, FnGen, call_value};

/// Stack snapshot exposed to a handler block: the operand stack as of the
/// installing PUSHTRAP, not the protected body's final state.
#[derive(Clone)]
pub(super) struct TrapView {
    pub stack: VecDeque<IntValue<'static>>,
    pub consumed: usize,
}

/// Compile-time state of one basic block.
pub(super) struct BlockState {
    /// Backend blocks: first is the primary (joins live at its head), last
    /// is where emission currently lands. PUSHTRAP grows the list.
    pub llvm: Vec<BasicBlock<'static>>,
    /// Local operand stack, front = top.
    pub stack: VecDeque<IntValue<'static>>,
    pub accu: Option<IntValue<'static>>,
    /// Slots conceptually popped from the predecessors' exposed stacks.
    pub consumed: usize,
    /// In-place assignment overrides, applied transitively on every read.
    pub mutated: Vec<(IntValue<'static>, IntValue<'static>)>,
    /// Resolved out-of-range reads, by predecessor-relative depth.
    pub cache: HashMap<i64, IntValue<'static>>,
    /// Joins awaiting incoming edges; depth -1 denotes the accumulator.
    pub pending: Vec<(PhiValue<'static>, i64)>,
    /// Snapshots exposed to handler blocks, keyed by handler id.
    pub trap_views: HashMap<usize, TrapView>,
    /// Backend block each handler edge leaves from.
    pub trap_sources: HashMap<usize, BasicBlock<'static>>,
}

impl BlockState {
    pub fn new(primary: BasicBlock<'static>) -> BlockState {
        BlockState {
            llvm: vec![primary],
            stack: VecDeque::new(),
            accu: None,
            consumed: 0,
            mutated: Vec::new(),
            cache: HashMap::new(),
            pending: Vec::new(),
            trap_views: HashMap::new(),
            trap_sources: HashMap::new(),
        }
    }

    pub fn primary(&self) -> BasicBlock<'static> {
        self.llvm[0]
    }

    pub fn current(&self) -> BasicBlock<'static> {
        *self.llvm.last().expect("block has a backend block")
    }
}

impl<'a> FnGen<'a> {
    // -- Emission helpers ----------------------------------------------------

    fn iconst(&self, v: u64) -> IntValue<'static> {
        self.i64t.const_int(v, false)
    }

    /// A tagged integer constant: `2n + 1`.
    fn tagged(&self, n: i64) -> IntValue<'static> {
        self.i64t.const_int(val_int(n), false)
    }

    /// Untag an integer: arithmetic shift right by one.
    fn untag(&self, v: IntValue<'static>) -> Result<IntValue<'static>, CompileError> {
        self.builder
            .build_right_shift(v, self.iconst(1), true, "untag")
            .map_err(Self::backend)
    }

    /// Retag an integer: `(v << 1) + 1`.
    fn retag(&self, v: IntValue<'static>) -> Result<IntValue<'static>, CompileError> {
        let shifted = self
            .builder
            .build_left_shift(v, self.iconst(1), "shl")
            .map_err(Self::backend)?;
        self.builder
            .build_int_add(shifted, self.iconst(1), "retag")
            .map_err(Self::backend)
    }

    /// Widen an i1 comparison into a tagged boolean.
    fn tag_bool(&self, cmp: IntValue<'static>) -> Result<IntValue<'static>, CompileError> {
        let wide = self
            .builder
            .build_int_z_extend(cmp, self.i64t, "bool")
            .map_err(Self::backend)?;
        self.retag(wide)
    }

    pub(super) fn call_rt(
        &mut self,
        name: &str,
        args: &[IntValue<'static>],
    ) -> Result<IntValue<'static>, CompileError> {
        let f = self.rt.get(name);
        let meta: Vec<BasicMetadataValueEnum> = args.iter().map(|&v| v.into()).collect();
        let call = self.builder.build_call(f, &meta, name).map_err(Self::backend)?;
        call_value(call)
    }

    /// Spill values into a stack-allocated word array and return its
    /// address as a machine word.
    fn spill(&mut self, vals: &[IntValue<'static>]) -> Result<IntValue<'static>, CompileError> {
        let arr = self.i64t.array_type(vals.len().max(1) as u32);
        let slot = self.builder.build_alloca(arr, "args").map_err(Self::backend)?;
        let base = self
            .builder
            .build_ptr_to_int(slot, self.i64t, "args_addr")
            .map_err(Self::backend)?;
        let ptr_t = self.i64t.ptr_type(AddressSpace::default());
        for (i, &v) in vals.iter().enumerate() {
            let addr = self
                .builder
                .build_int_add(base, self.iconst((i * 8) as u64), "slot_addr")
                .map_err(Self::backend)?;
            let p = self
                .builder
                .build_int_to_ptr(addr, ptr_t, "slot")
                .map_err(Self::backend)?;
            self.builder.build_store(p, v).map_err(Self::backend)?;
        }
        Ok(base)
    }

    // -- Abstract machine state ----------------------------------------------

    /// Follow the block's mutation map to a fixed point. Terminates in at
    /// most `|map|` steps; assignments never map a value to itself.
    fn resolve_mutated(&self, bid: usize, mut v: IntValue<'static>) -> IntValue<'static> {
        let map = &self.blocks[&bid].mutated;
        for _ in 0..=map.len() {
            match map.iter().find(|(old, _)| *old == v) {
                Some(&(_, newer)) => v = newer,
                None => break,
            }
        }
        v
    }

    /// The block's effective stack at slot `n`: local entries first, then
    /// the predecessors' exposed stacks, all through the mutation map.
    pub(super) fn stack_at(
        &mut self,
        bid: usize,
        n: usize,
    ) -> Result<IntValue<'static>, CompileError> {
        let st = &self.blocks[&bid];
        let v = if n < st.stack.len() {
            st.stack[n]
        } else {
            let depth = (n - st.stack.len() + st.consumed) as i64;
            self.pred_slot(bid, depth)?
        };
        Ok(self.resolve_mutated(bid, v))
    }

    /// Like [`stack_at`], but against a trap-time snapshot of the block.
    pub(super) fn slot_in_view(
        &mut self,
        bid: usize,
        n: usize,
        view: &TrapView,
    ) -> Result<IntValue<'static>, CompileError> {
        let v = if n < view.stack.len() {
            view.stack[n]
        } else {
            let depth = (n - view.stack.len() + view.consumed) as i64;
            self.pred_slot(bid, depth)?
        };
        Ok(self.resolve_mutated(bid, v))
    }

    fn set_accu(&mut self, bid: usize, v: IntValue<'static>) {
        self.blocks.get_mut(&bid).unwrap().accu = Some(v);
    }

    fn push(&mut self, bid: usize) -> Result<(), CompileError> {
        let a = self.final_accu(bid)?;
        self.blocks.get_mut(&bid).unwrap().stack.push_front(a);
        Ok(())
    }

    fn push_raw(&mut self, bid: usize, v: IntValue<'static>) {
        self.blocks.get_mut(&bid).unwrap().stack.push_front(v);
    }

    fn pop(&mut self, bid: usize) -> Result<IntValue<'static>, CompileError> {
        let v = self.stack_at(bid, 0)?;
        let st = self.blocks.get_mut(&bid).unwrap();
        if st.stack.pop_front().is_none() {
            st.consumed += 1;
        }
        Ok(v)
    }

    fn acc(&mut self, bid: usize, n: usize) -> Result<(), CompileError> {
        let v = self.stack_at(bid, n)?;
        self.set_accu(bid, v);
        Ok(())
    }

    fn env_acc(&mut self, bid: usize, n: u64) -> Result<(), CompileError> {
        let env = self.call_rt("getEnv", &[])?;
        let v = self.call_rt("getField", &[env, self.iconst(n)])?;
        self.set_accu(bid, v);
        Ok(())
    }

    // -- Block driver --------------------------------------------------------

    pub(super) fn gen_block(&mut self, bid: usize) -> Result<(), CompileError> {
        self.builder.position_at_end(self.blocks[&bid].current());

        if self.trace {
            let id = self.iconst(bid as u64);
            self.call_rt("debug", &[id])?;
        }

        // Handler blocks begin by fetching the delivered exception into the
        // accumulator and popping the handler context.
        if self.handlers.contains(&bid) {
            let exn = self.call_rt("getExceptionValue", &[])?;
            self.call_rt("removeExceptionContext", &[])?;
            self.set_accu(bid, exn);
        }

        let (start, end) = {
            let b = &self.cfg.blocks[&bid];
            (b.start, b.end)
        };
        for at in start..end {
            let inst = self.func.at(at).clone();
            self.gen_inst(bid, at, &inst)?;
        }

        // A block whose last instruction neither jumps nor returns branches
        // to its declared fall-through successor.
        let last = self.func.at(end - 1);
        if !(last.op.is_jump() || last.op.is_return()) {
            let fall = self.succ_primary(self.cfg.blocks[&bid].fall, bid)?;
            self.builder
                .build_unconditional_branch(fall)
                .map_err(Self::backend)?;
        }
        Ok(())
    }

    fn succ_primary(
        &self,
        id: Option<usize>,
        bid: usize,
    ) -> Result<BasicBlock<'static>, CompileError> {
        id.and_then(|i| self.blocks.get(&i))
            .map(|b| b.primary())
            .ok_or(CompileError::FallthroughOutOfRange { block: bid })
    }

    fn cond_branch(&mut self, bid: usize, cond: IntValue<'static>) -> Result<(), CompileError> {
        let taken = self.succ_primary(self.cfg.blocks[&bid].taken, bid)?;
        let fall = self.succ_primary(self.cfg.blocks[&bid].fall, bid)?;
        if taken == fall {
            self.builder
                .build_unconditional_branch(taken)
                .map_err(Self::backend)?;
        } else {
            self.builder
                .build_conditional_branch(cond, taken, fall)
                .map_err(Self::backend)?;
        }
        Ok(())
    }

    /// Compare the accumulator with the popped stack top and leave a tagged
    /// boolean in the accumulator.
    fn compare(&mut self, bid: usize, pred: IntPredicate) -> Result<(), CompileError> {
        let top = self.pop(bid)?;
        let a = self.final_accu(bid)?;
        let cmp = self
            .builder
            .build_int_compare(pred, a, top, "cmp")
            .map_err(Self::backend)?;
        let b = self.tag_bool(cmp)?;
        self.set_accu(bid, b);
        Ok(())
    }

    /// Compare a tagged immediate with the accumulator and branch on the
    /// 1-bit result.
    fn compare_branch(
        &mut self,
        bid: usize,
        pred: IntPredicate,
        imm: i64,
    ) -> Result<(), CompileError> {
        let a = self.final_accu(bid)?;
        let cmp = self
            .builder
            .build_int_compare(pred, self.tagged(imm), a, "cmp")
            .map_err(Self::backend)?;
        self.cond_branch(bid, cmp)
    }

    /// Branch on the accumulator's truth value: anything but tagged zero.
    fn truth_branch(&mut self, bid: usize, when_zero: bool) -> Result<(), CompileError> {
        let a = self.final_accu(bid)?;
        let pred = if when_zero { IntPredicate::EQ } else { IntPredicate::NE };
        let cmp = self
            .builder
            .build_int_compare(pred, a, self.tagged(0), "truthy")
            .map_err(Self::backend)?;
        self.cond_branch(bid, cmp)
    }

    fn emit_return(&mut self, bid: usize) -> Result<(), CompileError> {
        let a = self.final_accu(bid)?;
        self.builder.build_return(Some(&a)).map_err(Self::backend)?;
        Ok(())
    }

    // -- The instruction set -------------------------------------------------

    fn gen_inst(&mut self, bid: usize, at: usize, inst: &Instruction) -> Result<(), CompileError> {
        use Opcode::*;
        match inst.op {
            Const0 => self.set_accu(bid, self.tagged(0)),
            Const1 => self.set_accu(bid, self.tagged(1)),
            Const2 => self.set_accu(bid, self.tagged(2)),
            Const3 => self.set_accu(bid, self.tagged(3)),
            ConstInt => self.set_accu(bid, self.tagged(inst.args[0] as i64)),
            PushConst0 => {
                self.push(bid)?;
                self.set_accu(bid, self.tagged(0));
            }
            PushConst1 => {
                self.push(bid)?;
                self.set_accu(bid, self.tagged(1));
            }
            PushConst2 => {
                self.push(bid)?;
                self.set_accu(bid, self.tagged(2));
            }
            PushConst3 => {
                self.push(bid)?;
                self.set_accu(bid, self.tagged(3));
            }
            PushConstInt => {
                self.push(bid)?;
                self.set_accu(bid, self.tagged(inst.args[0] as i64));
            }

            Push => self.push(bid)?,
            Pop => {
                for _ in 0..inst.args[0] {
                    self.pop(bid)?;
                }
            }
            PushRetAddr => {
                let sentinel = self.tagged(0);
                for _ in 0..3 {
                    self.push_raw(bid, sentinel);
                }
            }

            Acc0 => self.acc(bid, 0)?,
            Acc1 => self.acc(bid, 1)?,
            Acc2 => self.acc(bid, 2)?,
            Acc3 => self.acc(bid, 3)?,
            Acc4 => self.acc(bid, 4)?,
            Acc5 => self.acc(bid, 5)?,
            Acc6 => self.acc(bid, 6)?,
            Acc7 => self.acc(bid, 7)?,
            Acc => self.acc(bid, inst.args[0] as usize)?,
            PushAcc0 => {
                self.push(bid)?;
                self.acc(bid, 0)?;
            }
            PushAcc1 => {
                self.push(bid)?;
                self.acc(bid, 1)?;
            }
            PushAcc2 => {
                self.push(bid)?;
                self.acc(bid, 2)?;
            }
            PushAcc3 => {
                self.push(bid)?;
                self.acc(bid, 3)?;
            }
            PushAcc4 => {
                self.push(bid)?;
                self.acc(bid, 4)?;
            }
            PushAcc5 => {
                self.push(bid)?;
                self.acc(bid, 5)?;
            }
            PushAcc6 => {
                self.push(bid)?;
                self.acc(bid, 6)?;
            }
            PushAcc7 => {
                self.push(bid)?;
                self.acc(bid, 7)?;
            }
            PushAcc => {
                self.push(bid)?;
                self.acc(bid, inst.args[0] as usize)?;
            }

            EnvAcc1 => self.env_acc(bid, 1)?,
            EnvAcc2 => self.env_acc(bid, 2)?,
            EnvAcc3 => self.env_acc(bid, 3)?,
            EnvAcc4 => self.env_acc(bid, 4)?,
            EnvAcc => self.env_acc(bid, inst.args[0] as u64)?,
            PushEnvAcc1 => {
                self.push(bid)?;
                self.env_acc(bid, 1)?;
            }
            PushEnvAcc2 => {
                self.push(bid)?;
                self.env_acc(bid, 2)?;
            }
            PushEnvAcc3 => {
                self.push(bid)?;
                self.env_acc(bid, 3)?;
            }
            PushEnvAcc4 => {
                self.push(bid)?;
                self.env_acc(bid, 4)?;
            }
            PushEnvAcc => {
                self.push(bid)?;
                self.env_acc(bid, inst.args[0] as u64)?;
            }

            Assign => {
                let old = self.stack_at(bid, inst.args[0] as usize)?;
                let a = self.final_accu(bid)?;
                if old != a {
                    self.blocks.get_mut(&bid).unwrap().mutated.push((old, a));
                }
            }

            // Tagged arithmetic: 2a+1 ⊕ 2b+1 adjusted to stay tagged.
            AddInt => {
                let top = self.pop(bid)?;
                let a = self.final_accu(bid)?;
                let t = self
                    .builder
                    .build_int_sub(top, self.iconst(1), "detag")
                    .map_err(Self::backend)?;
                let r = self.builder.build_int_add(a, t, "add").map_err(Self::backend)?;
                self.set_accu(bid, r);
            }
            SubInt => {
                let top = self.pop(bid)?;
                let a = self.final_accu(bid)?;
                let d = self.builder.build_int_sub(top, a, "sub").map_err(Self::backend)?;
                let r = self
                    .builder
                    .build_int_add(d, self.iconst(1), "fixtag")
                    .map_err(Self::backend)?;
                self.set_accu(bid, r);
            }
            MulInt => {
                let top = self.pop(bid)?;
                let a = self.final_accu(bid)?;
                let (ua, ut) = (self.untag(a)?, self.untag(top)?);
                let m = self.builder.build_int_mul(ua, ut, "mul").map_err(Self::backend)?;
                let r = self.retag(m)?;
                self.set_accu(bid, r);
            }
            DivInt => {
                let top = self.pop(bid)?;
                let a = self.final_accu(bid)?;
                let (ua, ut) = (self.untag(a)?, self.untag(top)?);
                let q = self
                    .builder
                    .build_int_signed_div(ua, ut, "div")
                    .map_err(Self::backend)?;
                let r = self.retag(q)?;
                self.set_accu(bid, r);
            }
            ModInt => {
                let top = self.pop(bid)?;
                let a = self.final_accu(bid)?;
                let (ua, ut) = (self.untag(a)?, self.untag(top)?);
                let m = self
                    .builder
                    .build_int_signed_rem(ua, ut, "rem")
                    .map_err(Self::backend)?;
                let r = self.retag(m)?;
                self.set_accu(bid, r);
            }
            NegInt => {
                let a = self.final_accu(bid)?;
                let r = self
                    .builder
                    .build_int_sub(self.iconst(2), a, "neg")
                    .map_err(Self::backend)?;
                self.set_accu(bid, r);
            }
            OffsetInt => {
                let a = self.final_accu(bid)?;
                let off = self.i64t.const_int(((inst.args[0] as i64) << 1) as u64, false);
                let r = self.builder.build_int_add(a, off, "offset").map_err(Self::backend)?;
                self.set_accu(bid, r);
            }

            Eq => self.compare(bid, IntPredicate::EQ)?,
            Neq => self.compare(bid, IntPredicate::NE)?,
            LtInt => self.compare(bid, IntPredicate::SLT)?,
            LeInt => self.compare(bid, IntPredicate::SLE)?,
            GtInt => self.compare(bid, IntPredicate::SGT)?,
            GeInt => self.compare(bid, IntPredicate::SGE)?,
            UltInt => self.compare(bid, IntPredicate::ULT)?,
            UgeInt => self.compare(bid, IntPredicate::UGE)?,

            GetGlobal => {
                let g = self.call_rt("getGlobal", &[self.iconst(inst.args[0] as u64)])?;
                self.set_accu(bid, g);
            }
            PushGetGlobal => {
                self.push(bid)?;
                let g = self.call_rt("getGlobal", &[self.iconst(inst.args[0] as u64)])?;
                self.set_accu(bid, g);
            }
            SetGlobal => {
                let a = self.final_accu(bid)?;
                self.call_rt("setGlobal", &[self.iconst(inst.args[0] as u64), a])?;
            }

            Atom0 => {
                let v = self.call_rt("getAtom", &[self.iconst(0)])?;
                self.set_accu(bid, v);
            }
            Atom => {
                let v = self.call_rt("getAtom", &[self.iconst(inst.args[0] as u64)])?;
                self.set_accu(bid, v);
            }
            PushAtom0 => {
                self.push(bid)?;
                let v = self.call_rt("getAtom", &[self.iconst(0)])?;
                self.set_accu(bid, v);
            }
            PushAtom => {
                self.push(bid)?;
                let v = self.call_rt("getAtom", &[self.iconst(inst.args[0] as u64)])?;
                self.set_accu(bid, v);
            }

            MakeBlock1 => {
                let a = self.final_accu(bid)?;
                let b = self.call_rt("makeBlock1", &[self.iconst(inst.args[0] as u64), a])?;
                self.set_accu(bid, b);
            }
            MakeBlock2 => {
                let a = self.final_accu(bid)?;
                let s0 = self.stack_at(bid, 0)?;
                let b = self.call_rt("makeBlock2", &[self.iconst(inst.args[0] as u64), a, s0])?;
                self.pop(bid)?;
                self.set_accu(bid, b);
            }
            MakeBlock3 => {
                let a = self.final_accu(bid)?;
                let s0 = self.stack_at(bid, 0)?;
                let s1 = self.stack_at(bid, 1)?;
                let b =
                    self.call_rt("makeBlock3", &[self.iconst(inst.args[0] as u64), a, s0, s1])?;
                self.pop(bid)?;
                self.pop(bid)?;
                self.set_accu(bid, b);
            }
            MakeBlock => {
                let size = inst.args[0].max(1) as usize;
                let tag = inst.args[1] as u64;
                let mut fields = vec![self.final_accu(bid)?];
                for i in 0..size - 1 {
                    fields.push(self.stack_at(bid, i)?);
                }
                let argv = self.spill(&fields)?;
                let b = self.call_rt(
                    "makeBlock",
                    &[self.iconst(tag), self.iconst(size as u64), argv],
                )?;
                for _ in 0..size - 1 {
                    self.pop(bid)?;
                }
                self.set_accu(bid, b);
            }

            GetField0 => self.get_field(bid, 0)?,
            GetField1 => self.get_field(bid, 1)?,
            GetField2 => self.get_field(bid, 2)?,
            GetField3 => self.get_field(bid, 3)?,
            GetField => self.get_field(bid, inst.args[0] as u64)?,
            SetField0 => self.set_field(bid, 0)?,
            SetField1 => self.set_field(bid, 1)?,
            SetField2 => self.set_field(bid, 2)?,
            SetField3 => self.set_field(bid, 3)?,
            SetField => self.set_field(bid, inst.args[0] as u64)?,

            Closure => {
                self.make_closure(bid, inst.args[0].max(0) as usize, inst.args[1] as usize, at)?;
            }
            ClosureRec => {
                // Only the bare self-recursive shape is lowered; anything
                // else would silently miscompile.
                if inst.args[0] == 1 && inst.args[1] == 0 && inst.rec.len() == 1 {
                    self.make_closure(bid, 0, inst.rec[0] as usize, at)?;
                    self.push(bid)?;
                } else {
                    return Err(CompileError::ClosureRecShape {
                        funcs: inst.args[0],
                        vars: inst.args[1],
                        at,
                    });
                }
            }
            OffsetClosure0 => {
                let env = self.call_rt("getEnv", &[])?;
                self.set_accu(bid, env);
                self.closures.push((
                    env,
                    ClosureInfo {
                        func_id: self.func.id,
                        bare: true,
                    },
                ));
            }
            PushOffsetClosure0 => {
                self.push(bid)?;
                let env = self.call_rt("getEnv", &[])?;
                self.set_accu(bid, env);
                self.closures.push((
                    env,
                    ClosureInfo {
                        func_id: self.func.id,
                        bare: true,
                    },
                ));
            }

            CCall1 => self.prim_call(bid, 1, inst.args[0])?,
            CCall2 => self.prim_call(bid, 2, inst.args[0])?,
            CCall3 => self.prim_call(bid, 3, inst.args[0])?,
            CCall4 => self.prim_call(bid, 4, inst.args[0])?,
            CCall5 => self.prim_call(bid, 5, inst.args[0])?,
            CCallN => {
                let argc = inst.args[0].max(1) as usize;
                let prim = inst.args[1];
                let mut vals = vec![self.final_accu(bid)?];
                for i in 0..argc - 1 {
                    vals.push(self.stack_at(bid, i)?);
                }
                let argv = self.spill(&vals)?;
                let r = self.call_rt(
                    "primCalln",
                    &[self.iconst(prim as u64), self.iconst(argc as u64), argv],
                )?;
                for _ in 0..argc - 1 {
                    self.pop(bid)?;
                }
                self.set_accu(bid, r);
            }

            Apply1 => self.make_apply(bid, 1)?,
            Apply2 => self.make_apply(bid, 2)?,
            Apply3 => self.make_apply(bid, 3)?,
            Apply => self.make_apply(bid, inst.args[0].max(0) as usize)?,
            Appterm1 => {
                self.make_apply(bid, 1)?;
                self.emit_return(bid)?;
            }
            Appterm2 => {
                self.make_apply(bid, 2)?;
                self.emit_return(bid)?;
            }
            Appterm3 => {
                self.make_apply(bid, 3)?;
                self.emit_return(bid)?;
            }
            Appterm => {
                self.make_apply(bid, inst.args[0].max(0) as usize)?;
                self.emit_return(bid)?;
            }

            Return | Stop => self.emit_return(bid)?,
            Raise => {
                let a = self.final_accu(bid)?;
                self.call_rt("throwException", &[a])?;
                // Unreachable when a handler is installed, but terminates
                // the block either way.
                self.builder.build_return(Some(&a)).map_err(Self::backend)?;
            }

            Branch => {
                let taken = self.succ_primary(self.cfg.blocks[&bid].taken, bid)?;
                self.builder
                    .build_unconditional_branch(taken)
                    .map_err(Self::backend)?;
            }
            BranchIf => self.truth_branch(bid, false)?,
            BranchIfNot => self.truth_branch(bid, true)?,
            Beq => self.compare_branch(bid, IntPredicate::EQ, inst.args[0] as i64)?,
            Bneq => self.compare_branch(bid, IntPredicate::NE, inst.args[0] as i64)?,
            BltInt => self.compare_branch(bid, IntPredicate::SLT, inst.args[0] as i64)?,
            BleInt => self.compare_branch(bid, IntPredicate::SLE, inst.args[0] as i64)?,
            BgtInt => self.compare_branch(bid, IntPredicate::SGT, inst.args[0] as i64)?,
            BgeInt => self.compare_branch(bid, IntPredicate::SGE, inst.args[0] as i64)?,
            BultInt => self.compare_branch(bid, IntPredicate::ULT, inst.args[0] as i64)?,
            BugeInt => self.compare_branch(bid, IntPredicate::UGE, inst.args[0] as i64)?,

            PushTrap => self.push_trap(bid, inst.args[0] as usize, at)?,
            PopTrap => {
                self.call_rt("removeExceptionContext", &[])?;
                for _ in 0..4 {
                    self.pop(bid)?;
                }
            }

            CheckSignals => {} // no preemption points in generated code
        }
        Ok(())
    }

    // -- Compound lowerings --------------------------------------------------

    fn get_field(&mut self, bid: usize, n: u64) -> Result<(), CompileError> {
        let a = self.final_accu(bid)?;
        let v = self.call_rt("getField", &[a, self.iconst(n)])?;
        self.set_accu(bid, v);
        Ok(())
    }

    fn set_field(&mut self, bid: usize, n: u64) -> Result<(), CompileError> {
        let a = self.final_accu(bid)?;
        let v = self.pop(bid)?;
        self.call_rt("setField", &[a, self.iconst(n), v])?;
        Ok(())
    }

    /// Allocate a closure over the target function's applier and record its
    /// ClosureInfo for direct-call decisions.
    fn make_closure(
        &mut self,
        bid: usize,
        nvars: usize,
        target: usize,
        at: usize,
    ) -> Result<(), CompileError> {
        let &func_id = self
            .program
            .fn_by_entry
            .get(&target)
            .ok_or(CompileError::BadClosureTarget { target, at })?;
        let decl = self.decls[func_id];
        let code_ptr = decl.applier.as_global_value().as_pointer_value();
        let code = self
            .builder
            .build_ptr_to_int(code_ptr, self.i64t, "code")
            .map_err(Self::backend)?;
        let clos = self.call_rt(
            "makeClosure",
            &[
                self.iconst(nvars as u64),
                code,
                self.iconst(decl.arity as u64),
            ],
        )?;
        if nvars > 0 {
            self.push(bid)?;
        }
        for i in 0..nvars {
            let v = self.pop(bid)?;
            self.call_rt("closureSetVar", &[clos, self.iconst(i as u64), v])?;
        }
        self.set_accu(bid, clos);
        self.closures.push((
            clos,
            ClosureInfo {
                func_id,
                bare: nvars == 0,
            },
        ));
        Ok(())
    }

    /// Application. A statically-known bare closure applied at its exact
    /// arity is direct-called (with the environment switched around the
    /// call); everything else goes through the runtime trampoline.
    fn make_apply(&mut self, bid: usize, n: usize) -> Result<(), CompileError> {
        let clos = self.final_accu(bid)?;
        let info = self
            .closures
            .iter()
            .find(|(v, _)| *v == clos)
            .map(|&(_, i)| i)
            .filter(|i| i.bare && self.decls[i.func_id].arity == n);

        let mut args = Vec::with_capacity(n);
        for i in 0..n {
            args.push(self.stack_at(bid, i)?);
        }

        let result = match info {
            Some(info) => {
                let saved = self.call_rt("getEnv", &[])?;
                self.call_rt("setEnv", &[clos])?;
                let meta: Vec<BasicMetadataValueEnum> =
                    args.iter().map(|&v| v.into()).collect();
                let call = self
                    .builder
                    .build_call(self.decls[info.func_id].direct, &meta, "call")
                    .map_err(Self::backend)?;
                let r = call_value(call)?;
                self.call_rt("setEnv", &[saved])?;
                r
            }
            None => {
                let argv = self.spill(&args)?;
                self.call_rt("apply", &[clos, self.iconst(n as u64), argv])?
            }
        };

        for _ in 0..n {
            self.pop(bid)?;
        }
        self.set_accu(bid, result);
        Ok(())
    }

    fn prim_call(&mut self, bid: usize, n: usize, prim: i32) -> Result<(), CompileError> {
        let mut args = vec![self.iconst(prim as u64), self.final_accu(bid)?];
        for _ in 1..n {
            let v = self.pop(bid)?;
            args.push(v);
        }
        let name = ["primCall1", "primCall2", "primCall3", "primCall4", "primCall5"][n - 1];
        let r = self.call_rt(name, &args)?;
        self.set_accu(bid, r);
        Ok(())
    }

    /// Install an exception handler: save the unwind point, branch into the
    /// handler when the save point returns a second time, otherwise resume
    /// in a fresh backend block with the four-slot trap frame pushed.
    fn push_trap(&mut self, bid: usize, handler: usize, at: usize) -> Result<(), CompileError> {
        let buf = self.call_rt("getNewBuffer", &[])?;
        let setjmp = self.rt.get("_setjmp");
        let call = self
            .builder
            .build_call(setjmp, &[buf.into()], "_setjmp")
            .map_err(Self::backend)?;
        let res = call_value(call)?;
        let zero = self.ctx.i32_type().const_zero();
        let unwound = self
            .builder
            .build_int_compare(IntPredicate::NE, res, zero, "unwound")
            .map_err(Self::backend)?;

        let handler_bb = match self.blocks.get(&handler) {
            Some(b) => b.primary(),
            None => {
                return Err(CompileError::CrossFunctionBranch {
                    target: handler,
                    at,
                });
            }
        };

        let (snapshot, from_bb) = {
            let st = &self.blocks[&bid];
            (
                TrapView {
                    stack: st.stack.clone(),
                    consumed: st.consumed,
                },
                st.current(),
            )
        };

        let cont = self
            .ctx
            .append_basic_block(self.decls[self.func.id].direct, &format!("b{bid}_trap"));
        self.builder
            .build_conditional_branch(unwound, handler_bb, cont)
            .map_err(Self::backend)?;
        self.builder.position_at_end(cont);

        let st = self.blocks.get_mut(&bid).unwrap();
        st.trap_views.insert(handler, snapshot);
        st.trap_sources.insert(handler, from_bb);
        st.llvm.push(cont);

        let sentinel = self.tagged(0);
        for _ in 0..4 {
            self.push_raw(bid, sentinel);
        }
        Ok(())
    }
}
