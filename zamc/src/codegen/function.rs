//! Per-function code generation.
//!
//! `FnGen` drives one function: it creates the backend blocks, runs the
//! symbolic executor over each basic block in reverse postorder, resolves
//! cross-block reads into join (phi) nodes, discharges the pending joins
//! once every block is emitted, and builds the applier trampoline.

use std::collections::{BTreeMap, HashSet};

use inkwell::basic_block::BasicBlock;
use inkwell::builder::Builder;
use inkwell::context::Context;
use inkwell::types::IntType;
use inkwell::values::{BasicMetadataValueEnum, CallSiteValue, IntValue, PhiValue};
use inkwell::AddressSpace;

use crate::cfg::Cfg;
use crate::error::CompileError;
use crate::program::{Function, Program};

use super::FnDecl;
use super::block::BlockState;
use super::runtime::Runtime;

/// What the lifter statically knows about an SSA value holding a closure.
/// Decides direct versus trampolined application.
#[derive(Clone, Copy)]
pub(super) struct ClosureInfo {
    pub func_id: usize,
    /// True iff the closure captures no variables.
    pub bare: bool,
}

pub(super) struct FnGen<'a> {
    pub ctx: &'static Context,
    pub builder: &'a Builder<'static>,
    pub rt: &'a Runtime,
    pub program: &'a Program,
    pub decls: &'a [FnDecl],
    pub func: &'a Function,
    pub cfg: Cfg,
    pub blocks: BTreeMap<usize, BlockState>,
    /// SSA values statically known to be closures.
    pub closures: Vec<(IntValue<'static>, ClosureInfo)>,
    /// Blocks entered through an exception edge.
    pub handlers: HashSet<usize>,
    pub i64t: IntType<'static>,
    pub trace: bool,
}

pub(super) fn call_value(call: CallSiteValue<'static>) -> Result<IntValue<'static>, CompileError> {
    match call.try_as_basic_value() {
        inkwell::Either::Left(v) => Ok(v.into_int_value()),
        inkwell::Either::Right(_) => {
            Err(CompileError::Backend("call returned no value".into()))
        }
    }
}

impl<'a> FnGen<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        ctx: &'static Context,
        builder: &'a Builder<'static>,
        rt: &'a Runtime,
        program: &'a Program,
        decls: &'a [FnDecl],
        func: &'a Function,
        cfg: Cfg,
        trace: bool,
    ) -> FnGen<'a> {
        let handlers = cfg
            .blocks
            .values()
            .flat_map(|b| b.traps.iter().copied())
            .collect();
        FnGen {
            ctx,
            builder,
            rt,
            program,
            decls,
            func,
            cfg,
            blocks: BTreeMap::new(),
            closures: Vec::new(),
            handlers,
            i64t: ctx.i64_type(),
            trace,
        }
    }

    pub(super) fn backend<E: std::fmt::Display>(e: E) -> CompileError {
        CompileError::Backend(e.to_string())
    }

    pub(super) fn compile(mut self) -> Result<(), CompileError> {
        let decl = self.decls[self.func.id];

        // One backend block per basic block, in bytecode order; a separate
        // entry block keeps the LLVM entry free of predecessors even when
        // the first bytecode block is a branch target.
        let entry_bb = self.ctx.append_basic_block(decl.direct, "entry");
        let ids: Vec<usize> = self.cfg.blocks.keys().copied().collect();
        for &id in &ids {
            let bb = self.ctx.append_basic_block(decl.direct, &format!("b{id}"));
            self.blocks.insert(id, BlockState::new(bb));
        }

        self.builder.position_at_end(entry_bb);
        let first = self.blocks[&self.cfg.entry].primary();
        self.builder
            .build_unconditional_branch(first)
            .map_err(Self::backend)?;

        // Seed the first block: formal parameters become the initial
        // operand stack (slot i = argument i); the entry function gets the
        // loader's initial accumulator.
        let head = self.blocks.get_mut(&self.cfg.entry).unwrap();
        for p in 0..decl.arity {
            let param = decl
                .direct
                .get_nth_param(p as u32)
                .expect("declared arity matches params")
                .into_int_value();
            head.stack.push_back(param);
        }
        if self.func.id == 0 {
            head.accu = Some(self.i64t.const_int(self.program.initial_accu, false));
        }

        for id in self.rpo() {
            self.gen_block(id)?;
        }
        self.discharge_joins()?;
        self.build_applier()?;

        if self.trace {
            eprintln!(
                "JIT: compiled fn {} ({} blocks, {} params)",
                self.func.id,
                ids.len(),
                decl.arity
            );
        }
        Ok(())
    }

    /// Reverse postorder over the CFG. Guarantees every predecessor except
    /// back-edge sources is emitted before its successors, so cross-block
    /// reads observe final predecessor stacks; back-edge reads always hit
    /// a multi-predecessor block and become joins.
    fn rpo(&self) -> Vec<usize> {
        fn dfs(id: usize, cfg: &Cfg, seen: &mut HashSet<usize>, out: &mut Vec<usize>) {
            if !seen.insert(id) {
                return;
            }
            let succs: Vec<usize> = cfg.blocks[&id].succs().collect();
            for s in succs {
                if cfg.blocks.contains_key(&s) {
                    dfs(s, cfg, seen, out);
                }
            }
            out.push(id);
        }
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        dfs(self.cfg.entry, &self.cfg, &mut seen, &mut out);
        out.reverse();
        out
    }

    // -- Join resolution -----------------------------------------------------

    /// Insert a join node at the head of the block's primary backend block,
    /// leaving the builder where it was.
    pub(super) fn make_join(&mut self, bid: usize) -> Result<PhiValue<'static>, CompileError> {
        let target = self.blocks[&bid].primary();
        let saved = self.builder.get_insert_block();
        match target.get_first_instruction() {
            Some(first) => self.builder.position_at(target, &first),
            None => self.builder.position_at_end(target),
        }
        let phi = self.builder.build_phi(self.i64t, "join").map_err(Self::backend)?;
        if let Some(b) = saved {
            self.builder.position_at_end(b);
        }
        Ok(phi)
    }

    /// Serve a read of the block's exposed stack at `depth` slots past its
    /// local stack: recurse through a single predecessor, or join over
    /// several. The per-depth cache both dedupes joins and breaks cycles
    /// around loops.
    pub(super) fn pred_slot(
        &mut self,
        bid: usize,
        depth: i64,
    ) -> Result<IntValue<'static>, CompileError> {
        if let Some(&v) = self.blocks[&bid].cache.get(&depth) {
            return Ok(v);
        }
        let preds = self.cfg.blocks[&bid].preds.clone();
        match preds.len() {
            0 => Err(CompileError::StackAccess { block: bid, depth }),
            1 => {
                let v = self.exposed_slot(preds[0], bid, depth as usize)?;
                self.blocks.get_mut(&bid).unwrap().cache.insert(depth, v);
                Ok(v)
            }
            _ => {
                let phi = self.make_join(bid)?;
                let v = phi.as_basic_value().into_int_value();
                let st = self.blocks.get_mut(&bid).unwrap();
                st.cache.insert(depth, v);
                st.pending.push((phi, depth));
                Ok(v)
            }
        }
    }

    /// A predecessor's stack slot as seen from `reader`: handler edges see
    /// the snapshot taken when their trap was installed, everything else
    /// sees the predecessor's final stack.
    pub(super) fn exposed_slot(
        &mut self,
        pred: usize,
        reader: usize,
        n: usize,
    ) -> Result<IntValue<'static>, CompileError> {
        if let Some(view) = self.blocks[&pred].trap_views.get(&reader).cloned() {
            return self.slot_in_view(pred, n, &view);
        }
        self.stack_at(pred, n)
    }

    /// The block's final accumulator, materializing at most one join.
    pub(super) fn final_accu(&mut self, bid: usize) -> Result<IntValue<'static>, CompileError> {
        if let Some(a) = self.blocks[&bid].accu {
            return Ok(a);
        }
        let preds = self.cfg.blocks[&bid].preds.clone();
        match preds.len() {
            0 => Err(CompileError::StackAccess { block: bid, depth: -1 }),
            1 => {
                let v = self.final_accu(preds[0])?;
                self.blocks.get_mut(&bid).unwrap().accu = Some(v);
                Ok(v)
            }
            _ => {
                let phi = self.make_join(bid)?;
                let v = phi.as_basic_value().into_int_value();
                let st = self.blocks.get_mut(&bid).unwrap();
                st.accu = Some(v);
                st.pending.push((phi, -1));
                Ok(v)
            }
        }
    }

    /// Fill the incoming edges of every pending join. Worklist: resolving
    /// one request can mint new joins in upstream blocks.
    fn discharge_joins(&mut self) -> Result<(), CompileError> {
        loop {
            let mut item = None;
            for (&id, st) in self.blocks.iter_mut() {
                if let Some(p) = st.pending.pop() {
                    item = Some((id, p));
                    break;
                }
            }
            let Some((bid, (phi, depth))) = item else {
                return Ok(());
            };
            let preds = self.cfg.blocks[&bid].preds.clone();
            for pred in preds {
                let val = if depth < 0 {
                    self.final_accu(pred)?
                } else {
                    self.exposed_slot(pred, bid, depth as usize)?
                };
                let from = self.edge_source(pred, bid);
                phi.add_incoming(&[(&val, from)]);
            }
        }
    }

    /// The backend block a CFG edge `pred -> succ` actually leaves from:
    /// the block holding the trap conditional for handler edges, the
    /// predecessor's final backend block otherwise.
    fn edge_source(&self, pred: usize, succ: usize) -> BasicBlock<'static> {
        let st = &self.blocks[&pred];
        st.trap_sources.get(&succ).copied().unwrap_or_else(|| st.current())
    }

    // -- Applier trampoline --------------------------------------------------

    /// `(closure, argc, argv) -> value`: load `argv[0..arity]` and
    /// tail-call the direct symbol. Arity mismatches never reach the
    /// applier; the runtime's `apply` handles currying first.
    fn build_applier(&mut self) -> Result<(), CompileError> {
        let decl = self.decls[self.func.id];
        let entry = self.ctx.append_basic_block(decl.applier, "entry");
        self.builder.position_at_end(entry);

        let argv = decl
            .applier
            .get_nth_param(2)
            .expect("applier has three params")
            .into_int_value();
        let ptr_t = self.i64t.ptr_type(AddressSpace::default());

        let mut args: Vec<BasicMetadataValueEnum> = Vec::with_capacity(decl.arity);
        for i in 0..decl.arity {
            let off = self.i64t.const_int((i * 8) as u64, false);
            let addr = self
                .builder
                .build_int_add(argv, off, "arg_addr")
                .map_err(Self::backend)?;
            let p = self
                .builder
                .build_int_to_ptr(addr, ptr_t, "arg_ptr")
                .map_err(Self::backend)?;
            let v = self
                .builder
                .build_load(p, "arg")
                .map_err(Self::backend)?;
            args.push(v.into_int_value().into());
        }

        let call = self
            .builder
            .build_call(decl.direct, &args, "call")
            .map_err(Self::backend)?;
        call.set_tail_call(true);
        let ret = call_value(call)?;
        self.builder.build_return(Some(&ret)).map_err(Self::backend)?;
        Ok(())
    }
}
