//! Basic-block construction.
//!
//! Splits a function's instruction span at leaders, wires
//! predecessor/successor edges (two-way for conditional branches, a
//! handler edge for PUSHTRAP that does not consume fallthrough), and
//! prunes blocks that cannot be reached. Blocks are keyed by the absolute
//! index of their leader, so branch targets double as block ids; edges are
//! stored as indices, never as references.

use std::collections::{BTreeMap, BTreeSet};

use log::trace;

use crate::error::CompileError;
use crate::instr::Opcode;
use crate::program::Function;

#[derive(Debug)]
pub struct Block {
    /// Absolute index of the leader; also the block id.
    pub start: usize,
    /// Absolute index one past the last instruction.
    pub end: usize,
    pub preds: Vec<usize>,
    /// Successor reached when the terminating branch is taken.
    pub taken: Option<usize>,
    /// Textually next successor (fall-through, or the untaken side of a
    /// conditional branch).
    pub fall: Option<usize>,
    /// Handler blocks installed by PUSHTRAPs inside this block.
    pub traps: Vec<usize>,
}

impl Block {
    pub fn succs(&self) -> impl Iterator<Item = usize> + '_ {
        self.taken
            .into_iter()
            .chain(self.fall)
            .chain(self.traps.iter().copied())
    }
}

#[derive(Debug)]
pub struct Cfg {
    pub entry: usize,
    pub blocks: BTreeMap<usize, Block>,
}

pub fn build(func: &Function) -> Result<Cfg, CompileError> {
    let mut leaders: Vec<usize> = (func.entry..func.end)
        .filter(|&i| i == func.entry || func.at(i).leader)
        .collect();
    leaders.sort_unstable();

    let mut blocks: BTreeMap<usize, Block> = BTreeMap::new();
    for (i, &start) in leaders.iter().enumerate() {
        let end = leaders.get(i + 1).copied().unwrap_or(func.end);
        blocks.insert(
            start,
            Block {
                start,
                end,
                preds: Vec::new(),
                taken: None,
                fall: None,
                traps: Vec::new(),
            },
        );
    }

    let in_function = |t: usize| t >= func.entry && t < func.end;

    // Successor edges.
    let ids: Vec<usize> = blocks.keys().copied().collect();
    for &id in &ids {
        let end = blocks[&id].end;
        let last = func.at(end - 1);
        let mut taken = None;
        let mut fall = None;
        if last.op.is_jump() {
            let target = last.target().unwrap_or(func.end);
            if !in_function(target) {
                return Err(CompileError::CrossFunctionBranch {
                    target,
                    at: end - 1,
                });
            }
            taken = Some(target);
            if last.op.is_cond_jump() {
                if end >= func.end {
                    return Err(CompileError::FallthroughOutOfRange { block: id });
                }
                fall = Some(end);
            }
        } else if !last.op.is_return() {
            if end >= func.end {
                return Err(CompileError::FallthroughOutOfRange { block: id });
            }
            fall = Some(end);
        }

        let mut traps = Vec::new();
        for at in id..end {
            let inst = func.at(at);
            if inst.op == Opcode::PushTrap {
                let handler = inst.target().unwrap_or(func.end);
                if !in_function(handler) {
                    return Err(CompileError::CrossFunctionBranch {
                        target: handler,
                        at,
                    });
                }
                traps.push(handler);
            }
        }

        let block = blocks.get_mut(&id).unwrap();
        block.taken = taken;
        block.fall = fall;
        block.traps = traps;
    }

    // Predecessor edges, deduplicated.
    for &id in &ids {
        let succs: Vec<usize> = blocks[&id].succs().collect();
        for s in succs {
            let preds = &mut blocks.get_mut(&s).unwrap().preds;
            if !preds.contains(&id) {
                preds.push(id);
            }
        }
    }

    prune_unreachable(&mut blocks, func.entry);
    trace!(
        "function {}: {} blocks after pruning",
        func.id,
        blocks.len()
    );
    Ok(Cfg {
        entry: func.entry,
        blocks,
    })
}

/// Remove blocks unreachable from the entry. Dead continuations after
/// RAISE would otherwise be codegenned and fail with an unresolvable
/// stack access (and dead cycles would never get a terminator).
fn prune_unreachable(blocks: &mut BTreeMap<usize, Block>, entry: usize) {
    let mut reachable = BTreeSet::new();
    let mut work = vec![entry];
    while let Some(id) = work.pop() {
        if !reachable.insert(id) {
            continue;
        }
        if let Some(block) = blocks.get(&id) {
            work.extend(block.succs());
        }
    }
    blocks.retain(|id, _| reachable.contains(id));
    for block in blocks.values_mut() {
        block.preds.retain(|p| reachable.contains(p));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::{Instruction, annotate};
    use crate::program::partition;

    fn function_of(ops: Vec<Instruction>) -> Function {
        let mut instrs = ops;
        annotate(&mut instrs);
        let mut program = partition(&instrs, 0).unwrap();
        program.functions.remove(0)
    }

    fn mk(op: Opcode, args: &[i32]) -> Instruction {
        Instruction::with_args(op, args)
    }

    #[test]
    fn straight_line_is_one_block() {
        let func = function_of(vec![
            mk(Opcode::Const1, &[]),
            mk(Opcode::Push, &[]),
            mk(Opcode::Return, &[]),
        ]);
        let cfg = build(&func).unwrap();
        assert_eq!(cfg.blocks.len(), 1);
        let b = &cfg.blocks[&0];
        assert_eq!((b.taken, b.fall), (None, None));
    }

    #[test]
    fn conditional_has_taken_and_fallthrough() {
        // 0: CONST0
        // 1: BRANCHIFNOT 4
        // 2: CONST1
        // 3: BRANCH 5
        // 4: CONST2
        // 5: RETURN
        let func = function_of(vec![
            mk(Opcode::Const0, &[]),
            mk(Opcode::BranchIfNot, &[4]),
            mk(Opcode::Const1, &[]),
            mk(Opcode::Branch, &[5]),
            mk(Opcode::Const2, &[]),
            mk(Opcode::Return, &[]),
        ]);
        let cfg = build(&func).unwrap();
        assert_eq!(cfg.blocks.len(), 4);
        let head = &cfg.blocks[&0];
        assert_eq!((head.taken, head.fall), (Some(4), Some(2)));
        assert_eq!(cfg.blocks[&2].taken, Some(5));
        assert_eq!(cfg.blocks[&4].fall, Some(5));
        let join = &cfg.blocks[&5];
        assert_eq!(join.preds, vec![2, 4]);
    }

    #[test]
    fn fallthrough_block_gets_a_declared_successor() {
        // A block ending in a plain instruction falls to the next leader.
        let func = function_of(vec![
            mk(Opcode::Const1, &[]),
            mk(Opcode::Branch, &[2]),
            mk(Opcode::Const2, &[]),
            mk(Opcode::Return, &[]),
        ]);
        let cfg = build(&func).unwrap();
        assert_eq!(cfg.blocks[&0].taken, Some(2));
        assert_eq!(cfg.blocks[&2].preds, vec![0]);
    }

    #[test]
    fn loops_wire_back_edges() {
        // 0: CONSTINT 10
        // 1: BRANCHIFNOT 3   <- loop head
        // 2: BRANCH 1
        // 3: RETURN
        let func = function_of(vec![
            mk(Opcode::ConstInt, &[10]),
            mk(Opcode::BranchIfNot, &[3]),
            mk(Opcode::Branch, &[1]),
            mk(Opcode::Return, &[]),
        ]);
        let cfg = build(&func).unwrap();
        let head = &cfg.blocks[&1];
        assert_eq!(head.preds, vec![0, 2]);
        assert_eq!(cfg.blocks[&2].taken, Some(1));
    }

    #[test]
    fn pushtrap_adds_handler_edge_without_consuming_fallthrough() {
        // 0: PUSHTRAP 3
        // 1: CONST1
        // 2: RAISE
        // 3: RETURN        <- handler
        let func = function_of(vec![
            mk(Opcode::PushTrap, &[3]),
            mk(Opcode::Const1, &[]),
            mk(Opcode::Raise, &[]),
            mk(Opcode::Return, &[]),
        ]);
        let cfg = build(&func).unwrap();
        let body = &cfg.blocks[&0];
        assert_eq!(body.end, 3, "PUSHTRAP must not split the block");
        assert_eq!(body.traps, vec![3]);
        assert_eq!(cfg.blocks[&3].preds, vec![0]);
    }

    #[test]
    fn dead_continuation_after_raise_is_pruned() {
        // 0: PUSHTRAP 5
        // 1: CONST1
        // 2: RAISE
        // 3: POPTRAP        <- unreachable
        // 4: RETURN
        // 5: RETURN         <- handler
        let func = function_of(vec![
            mk(Opcode::PushTrap, &[5]),
            mk(Opcode::Const1, &[]),
            mk(Opcode::Raise, &[]),
            mk(Opcode::PopTrap, &[]),
            mk(Opcode::Return, &[]),
            mk(Opcode::Return, &[]),
        ]);
        let cfg = build(&func).unwrap();
        assert!(!cfg.blocks.contains_key(&3));
        assert!(cfg.blocks.contains_key(&5));
    }

    #[test]
    fn branch_out_of_function_is_rejected() {
        let mut instrs = vec![mk(Opcode::Branch, &[7]), mk(Opcode::Return, &[])];
        annotate(&mut instrs);
        let mut program = partition(&instrs, 0).unwrap();
        let func = program.functions.remove(0);
        assert!(matches!(
            build(&func),
            Err(CompileError::CrossFunctionBranch { target: 7, at: 0 })
        ));
    }

    #[test]
    fn missing_fallthrough_is_rejected() {
        let mut instrs = vec![mk(Opcode::Const1, &[])];
        annotate(&mut instrs);
        let mut program = partition(&instrs, 0).unwrap();
        let func = program.functions.remove(0);
        assert!(matches!(
            build(&func),
            Err(CompileError::FallthroughOutOfRange { block: 0 })
        ));
    }
}
