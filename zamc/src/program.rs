//! Function partitioning.
//!
//! Walks the instruction stream and segments it into functions at
//! closure-creation boundaries: the entry function runs from the head to
//! the first closure target, and every target starts a new function whose
//! span ends at the next target (or the end of the stream). Arity comes
//! from the closure opcode; the entry function has arity 0.

use std::collections::HashMap;

use log::debug;

use crate::error::CompileError;
use crate::instr::{Instruction, Opcode};

/// One logical function: its id, arity, and the absolute span of
/// instructions it owns. Instruction indices stay absolute throughout the
/// pipeline; `instrs[i - entry]` is the instruction at absolute index `i`.
#[derive(Debug)]
pub struct Function {
    pub id: usize,
    pub arity: usize,
    pub entry: usize,
    pub end: usize,
    pub instrs: Vec<Instruction>,
}

impl Function {
    pub fn at(&self, abs: usize) -> &Instruction {
        &self.instrs[abs - self.entry]
    }
}

/// The partitioned program. Function 0 is the entry function.
#[derive(Debug)]
pub struct Program {
    pub functions: Vec<Function>,
    pub fn_by_entry: HashMap<usize, usize>,
    pub initial_accu: u64,
}

/// Closure sites in the stream: (site index, target, arity).
fn closure_sites(instrs: &[Instruction]) -> Vec<(usize, usize, usize)> {
    let mut sites = Vec::new();
    for (i, inst) in instrs.iter().enumerate() {
        match inst.op {
            Opcode::Closure => {
                sites.push((i, inst.args[1] as usize, inst.args[2].max(0) as usize));
            }
            Opcode::ClosureRec => {
                for &t in &inst.rec {
                    sites.push((i, t as usize, inst.args[2].max(0) as usize));
                }
            }
            _ => {}
        }
    }
    sites
}

pub fn partition(instrs: &[Instruction], initial_accu: i64) -> Result<Program, CompileError> {
    let len = instrs.len();
    let mut arities: HashMap<usize, usize> = HashMap::new();
    let mut targets: Vec<usize> = Vec::new();

    for (at, target, arity) in closure_sites(instrs) {
        if target == 0 || target >= len {
            return Err(CompileError::BadClosureTarget { target, at });
        }
        arities.entry(target).or_insert(arity);
        targets.push(target);
    }
    targets.sort_unstable();
    targets.dedup();

    let mut functions = Vec::new();
    let mut fn_by_entry = HashMap::new();

    let first_boundary = targets.first().copied().unwrap_or(len);
    let mut spans = vec![(0usize, first_boundary, 0usize)];
    for (i, &entry) in targets.iter().enumerate() {
        let end = targets.get(i + 1).copied().unwrap_or(len);
        spans.push((entry, end, arities[&entry]));
    }

    for (id, (entry, end, arity)) in spans.into_iter().enumerate() {
        fn_by_entry.insert(entry, id);
        functions.push(Function {
            id,
            arity,
            entry,
            end,
            instrs: instrs[entry..end].to_vec(),
        });
    }

    debug!("partitioned {} instructions into {} functions", len, functions.len());
    Ok(Program {
        functions,
        fn_by_entry,
        initial_accu: zam_rt::value::val_int(initial_accu),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::annotate;

    fn mk(op: Opcode, args: &[i32]) -> Instruction {
        Instruction::with_args(op, args)
    }

    #[test]
    fn splits_at_closure_targets() {
        // 0: CLOSURE 0 -> 3 (arity 2)
        // 1: APPLY2
        // 2: RETURN
        // 3: ACC0           (function 1)
        // 4: RETURN
        let mut instrs = vec![
            mk(Opcode::Closure, &[0, 3, 2]),
            mk(Opcode::Apply2, &[]),
            mk(Opcode::Return, &[]),
            mk(Opcode::Acc0, &[]),
            mk(Opcode::Return, &[]),
        ];
        annotate(&mut instrs);
        let program = partition(&instrs, 0).unwrap();
        assert_eq!(program.functions.len(), 2);
        let entry = &program.functions[0];
        assert_eq!((entry.entry, entry.end, entry.arity), (0, 3, 0));
        let f = &program.functions[1];
        assert_eq!((f.entry, f.end, f.arity), (3, 5, 2));
        assert_eq!(program.fn_by_entry[&3], 1);
    }

    #[test]
    fn recursive_closure_targets_partition_too() {
        let mut instrs = vec![
            {
                let mut i = mk(Opcode::ClosureRec, &[1, 0, 1]);
                i.rec.push(2);
                i
            },
            mk(Opcode::Return, &[]),
            mk(Opcode::Acc0, &[]),
            mk(Opcode::Return, &[]),
        ];
        annotate(&mut instrs);
        let program = partition(&instrs, 0).unwrap();
        assert_eq!(program.functions.len(), 2);
        assert_eq!(program.functions[1].entry, 2);
        assert_eq!(program.functions[1].arity, 1);
    }

    #[test]
    fn rejects_targets_outside_the_stream() {
        let instrs = vec![mk(Opcode::Closure, &[0, 9, 1]), mk(Opcode::Return, &[])];
        assert!(matches!(
            partition(&instrs, 0),
            Err(CompileError::BadClosureTarget { target: 9, at: 0 })
        ));
    }
}
