//! Textual bytecode loader.
//!
//! Parses a line-oriented listing into an annotated instruction stream:
//! one instruction per line, `label:` definitions (alone or prefixing an
//! instruction), label operands in target positions, `;` comments.
//!
//! Directives, which occupy no instruction slot:
//!   `GLOBALS n`     size of the global table
//!   `PRIM idx name` primitive table entry
//!   `ACCU n`        initial accumulator integer (default 0)

use std::collections::HashMap;

use log::debug;
use thiserror::Error;

use crate::instr::{Instruction, OPCODES, Opcode, annotate};

#[derive(Debug, Error)]
pub enum AsmError {
    #[error("line {line}: unknown opcode '{name}'")]
    UnknownOpcode { line: usize, name: String },

    #[error("line {line}: unknown label '{name}'")]
    UnknownLabel { line: usize, name: String },

    #[error("line {line}: label '{name}' defined twice")]
    DuplicateLabel { line: usize, name: String },

    #[error("line {line}: bad operand '{token}'")]
    BadOperand { line: usize, token: String },

    #[error("line {line}: {op} needs at least {want} operand(s)")]
    MissingOperand { line: usize, op: String, want: usize },

    #[error("line {line}: too many operands")]
    TooManyOperands { line: usize },

    #[error("line {line}: malformed directive")]
    BadDirective { line: usize },
}

/// A loaded program: the annotated instruction stream plus the loader-owned
/// environment (global table size, primitive table, initial accumulator).
#[derive(Debug, Default)]
pub struct Source {
    pub instrs: Vec<Instruction>,
    pub globals: usize,
    pub prims: Vec<(usize, String)>,
    pub initial_accu: i64,
}

fn opcode_from_name(name: &str) -> Option<Opcode> {
    OPCODES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, op)| *op)
}

fn min_operands(op: Opcode) -> usize {
    use Opcode::*;
    match op {
        ConstInt | PushConstInt | Pop | Acc | PushAcc | EnvAcc | PushEnvAcc | Assign
        | OffsetInt | GetGlobal | PushGetGlobal | SetGlobal | Atom | PushAtom | MakeBlock1
        | MakeBlock2 | MakeBlock3 | GetField | SetField | CCall1 | CCall2 | CCall3 | CCall4
        | CCall5 | Apply | Appterm | Branch | BranchIf | BranchIfNot | PushTrap => 1,
        MakeBlock | CCallN | Closure | Beq | Bneq | BltInt | BleInt | BgtInt | BgeInt
        | BultInt | BugeInt => 2,
        ClosureRec => 3,
        _ => 0,
    }
}

/// Strip the comment and split a line into tokens.
fn tokens(line: &str) -> Vec<&str> {
    let code = line.split(';').next().unwrap_or("");
    code.split_whitespace().collect()
}

struct Line<'a> {
    number: usize,
    labels: Vec<&'a str>,
    rest: Vec<&'a str>,
}

/// Separate leading `label:` tokens from the instruction/directive tokens.
fn split_line(number: usize, toks: Vec<&str>) -> Line<'_> {
    let mut labels = Vec::new();
    let mut rest = Vec::new();
    for (i, tok) in toks.iter().enumerate() {
        if rest.is_empty()
            && let Some(name) = tok.strip_suffix(':')
        {
            labels.push(name);
        } else {
            rest.extend_from_slice(&toks[i..]);
            break;
        }
    }
    Line {
        number,
        labels,
        rest,
    }
}

fn is_directive(tok: &str) -> bool {
    matches!(tok, "GLOBALS" | "PRIM" | "ACCU")
}

/// Parse a listing into an annotated instruction stream.
pub fn parse_source(text: &str) -> Result<Source, AsmError> {
    let lines: Vec<Line> = text
        .lines()
        .enumerate()
        .map(|(i, l)| split_line(i + 1, tokens(l)))
        .collect();

    // First pass: label -> instruction index.
    let mut labels: HashMap<&str, usize> = HashMap::new();
    let mut index = 0usize;
    for line in &lines {
        for &name in &line.labels {
            if labels.insert(name, index).is_some() {
                return Err(AsmError::DuplicateLabel {
                    line: line.number,
                    name: name.to_string(),
                });
            }
        }
        if !line.rest.is_empty() && !is_directive(line.rest[0]) {
            index += 1;
        }
    }

    // Second pass: instructions and directives.
    let mut source = Source::default();
    for line in &lines {
        let Some(&head) = line.rest.first() else {
            continue;
        };
        let operands = &line.rest[1..];
        match head {
            "GLOBALS" => {
                source.globals = parse_directive_int(line, operands)? as usize;
            }
            "ACCU" => {
                source.initial_accu = parse_directive_int(line, operands)?;
            }
            "PRIM" => {
                if operands.len() != 2 {
                    return Err(AsmError::BadDirective { line: line.number });
                }
                let idx = operands[0]
                    .parse::<usize>()
                    .map_err(|_| AsmError::BadDirective { line: line.number })?;
                source.prims.push((idx, operands[1].to_string()));
            }
            name => {
                let op = opcode_from_name(name).ok_or_else(|| AsmError::UnknownOpcode {
                    line: line.number,
                    name: name.to_string(),
                })?;
                source
                    .instrs
                    .push(parse_instruction(line, op, operands, &labels)?);
            }
        }
    }

    annotate(&mut source.instrs);
    debug!(
        "loaded {} instructions, {} globals, {} prims",
        source.instrs.len(),
        source.globals,
        source.prims.len()
    );
    Ok(source)
}

fn parse_directive_int(line: &Line, operands: &[&str]) -> Result<i64, AsmError> {
    if operands.len() != 1 {
        return Err(AsmError::BadDirective { line: line.number });
    }
    operands[0]
        .parse::<i64>()
        .map_err(|_| AsmError::BadDirective { line: line.number })
}

fn parse_instruction(
    line: &Line,
    op: Opcode,
    operands: &[&str],
    labels: &HashMap<&str, usize>,
) -> Result<Instruction, AsmError> {
    let want = min_operands(op);
    if operands.len() < want {
        return Err(AsmError::MissingOperand {
            line: line.number,
            op: op.name().to_string(),
            want,
        });
    }

    // CLOSUREREC routes its target operand into the extension list and its
    // trailing arity into the third argument slot.
    let (target_operand, rec_operand) = match op {
        Opcode::ClosureRec => (None, Some(2)),
        _ => (op.target_slot(), None),
    };

    let mut inst = Instruction::new(op);
    let mut arg_slot = 0usize;
    for (i, tok) in operands.iter().enumerate() {
        let is_target = target_operand == Some(i) || rec_operand == Some(i);
        let value: i64 = match tok.parse::<i64>() {
            Ok(v) => v,
            Err(_) if is_target => {
                *labels
                    .get(tok)
                    .ok_or_else(|| AsmError::UnknownLabel {
                        line: line.number,
                        name: tok.to_string(),
                    })? as i64
            }
            Err(_) => {
                return Err(AsmError::BadOperand {
                    line: line.number,
                    token: tok.to_string(),
                });
            }
        };
        if rec_operand == Some(i) {
            inst.rec.push(value as u32);
            continue;
        }
        if arg_slot >= 3 {
            return Err(AsmError::TooManyOperands { line: line.number });
        }
        inst.args[arg_slot] = value as i32;
        arg_slot += 1;
    }

    // Unstated closure arity defaults to 1: the machine is curried.
    if matches!(op, Opcode::Closure) && operands.len() < 3 {
        inst.args[2] = 1;
    }
    if matches!(op, Opcode::ClosureRec) && operands.len() < 4 {
        inst.args[2] = 1;
    }
    Ok(inst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_labels_and_targets() {
        let src = "
            CONST0
            BRANCHIFNOT else    ; conditional
            CONST1
            BRANCH done
        else:
            CONST2
        done:
            RETURN
        ";
        let source = parse_source(src).unwrap();
        assert_eq!(source.instrs.len(), 6);
        assert_eq!(source.instrs[1].op, Opcode::BranchIfNot);
        assert_eq!(source.instrs[1].target(), Some(4));
        assert_eq!(source.instrs[3].target(), Some(5));
        assert!(source.instrs[4].leader);
        assert!(source.instrs[5].leader);
    }

    #[test]
    fn label_prefix_on_instruction_line() {
        let src = "loop: CONST1\nBRANCH loop";
        let source = parse_source(src).unwrap();
        assert_eq!(source.instrs[1].target(), Some(0));
    }

    #[test]
    fn directives_do_not_consume_indices() {
        let src = "
            GLOBALS 4
            PRIM 0 print_int
            ACCU 7
        start:
            RETURN
        ";
        let source = parse_source(src).unwrap();
        assert_eq!(source.globals, 4);
        assert_eq!(source.prims, vec![(0, "print_int".to_string())]);
        assert_eq!(source.initial_accu, 7);
        assert_eq!(source.instrs.len(), 1);
    }

    #[test]
    fn closure_defaults_to_arity_one() {
        let src = "
            CLOSURE 0 f
            RETURN
        f:
            RETURN
        ";
        let source = parse_source(src).unwrap();
        assert_eq!(source.instrs[0].args, [0, 2, 1]);
    }

    #[test]
    fn closurerec_target_goes_to_extension_list() {
        let src = "
            CLOSUREREC 1 0 f 2
            RETURN
        f:
            RETURN
        ";
        let source = parse_source(src).unwrap();
        let inst = &source.instrs[0];
        assert_eq!(inst.rec, vec![2]);
        assert_eq!(inst.args, [1, 0, 2]);
    }

    #[test]
    fn errors_name_the_line() {
        match parse_source("CONST0\nFROB 1") {
            Err(AsmError::UnknownOpcode { line, name }) => {
                assert_eq!(line, 2);
                assert_eq!(name, "FROB");
            }
            other => panic!("expected UnknownOpcode, got {:?}", other),
        }
        assert!(matches!(
            parse_source("BRANCH nowhere"),
            Err(AsmError::UnknownLabel { .. })
        ));
        assert!(matches!(
            parse_source("BRANCH"),
            Err(AsmError::MissingOperand { .. })
        ));
        assert!(matches!(
            parse_source("x: CONST0\nx: RETURN"),
            Err(AsmError::DuplicateLabel { .. })
        ));
    }
}
