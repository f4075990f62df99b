//! The ZAM instruction set and stream annotation.
//!
//! Instructions arrive from the loader with branch targets already resolved
//! to absolute indices into the stream. [`annotate`] marks basic-block
//! leaders; jump/return/target classification is derived from the opcode.

/// Bytecode instructions of the stack machine.
///
/// Numbered variants (`Acc0`..`Acc7`, ...) are the immediate-free
/// specializations the bytecode format uses for common small operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    // -- Constants --
    Const0,
    Const1,
    Const2,
    Const3,
    ConstInt,
    PushConst0,
    PushConst1,
    PushConst2,
    PushConst3,
    PushConstInt,

    // -- Stack manipulation --
    Push,
    /// Discard the top n slots.
    Pop,
    /// Push three sentinel slots standing in for a return frame; the native
    /// calling convention carries the actual continuation.
    PushRetAddr,

    // -- Accumulator <-> stack --
    Acc0,
    Acc1,
    Acc2,
    Acc3,
    Acc4,
    Acc5,
    Acc6,
    Acc7,
    Acc,
    PushAcc0,
    PushAcc1,
    PushAcc2,
    PushAcc3,
    PushAcc4,
    PushAcc5,
    PushAcc6,
    PushAcc7,
    PushAcc,

    // -- Environment access --
    EnvAcc1,
    EnvAcc2,
    EnvAcc3,
    EnvAcc4,
    EnvAcc,
    PushEnvAcc1,
    PushEnvAcc2,
    PushEnvAcc3,
    PushEnvAcc4,
    PushEnvAcc,

    /// In-place update of stack slot n with the accumulator.
    Assign,

    // -- Tagged integer arithmetic --
    AddInt,
    SubInt,
    MulInt,
    DivInt,
    ModInt,
    NegInt,
    OffsetInt,

    // -- Comparison (result is a tagged boolean) --
    Eq,
    Neq,
    LtInt,
    LeInt,
    GtInt,
    GeInt,
    UltInt,
    UgeInt,

    // -- Globals --
    GetGlobal,
    PushGetGlobal,
    SetGlobal,

    // -- Atoms --
    Atom0,
    Atom,
    PushAtom0,
    PushAtom,

    // -- Blocks --
    MakeBlock1,
    MakeBlock2,
    MakeBlock3,
    /// Generic allocation: args are (size, tag).
    MakeBlock,
    GetField0,
    GetField1,
    GetField2,
    GetField3,
    GetField,
    SetField0,
    SetField1,
    SetField2,
    SetField3,
    SetField,

    // -- Closures --
    /// args are (nvars, target, arity).
    Closure,
    /// args are (nfuncs, nvars, arity); targets in the extension list.
    /// Only the single bare recursive shape (1, 0) is lowered.
    ClosureRec,
    OffsetClosure0,
    PushOffsetClosure0,

    // -- Primitive calls --
    CCall1,
    CCall2,
    CCall3,
    CCall4,
    CCall5,
    /// args are (argc, prim).
    CCallN,

    // -- Application --
    Apply1,
    Apply2,
    Apply3,
    Apply,
    Appterm1,
    Appterm2,
    Appterm3,
    Appterm,

    // -- Returns --
    Return,
    Stop,

    // -- Branches --
    Branch,
    BranchIf,
    BranchIfNot,
    /// args are (immediate, target); compares the tagged immediate with the
    /// accumulator and branches on the result.
    Beq,
    Bneq,
    BltInt,
    BleInt,
    BgtInt,
    BgeInt,
    BultInt,
    BugeInt,

    // -- Exceptions --
    /// Install a handler at the target; does not end the block.
    PushTrap,
    /// Discard the innermost handler and its four-slot trap frame.
    PopTrap,
    Raise,

    /// Bytecode-level preemption point; intentionally a no-op.
    CheckSignals,
}

impl Opcode {
    /// True for opcodes that transfer control to a branch target and end
    /// their block.
    pub fn is_jump(self) -> bool {
        matches!(
            self,
            Opcode::Branch
                | Opcode::BranchIf
                | Opcode::BranchIfNot
                | Opcode::Beq
                | Opcode::Bneq
                | Opcode::BltInt
                | Opcode::BleInt
                | Opcode::BgtInt
                | Opcode::BgeInt
                | Opcode::BultInt
                | Opcode::BugeInt
        )
    }

    /// True for opcodes with both a taken and a fall-through successor.
    pub fn is_cond_jump(self) -> bool {
        self.is_jump() && self != Opcode::Branch
    }

    /// True for opcodes that terminate their block with a return.
    pub fn is_return(self) -> bool {
        matches!(
            self,
            Opcode::Return
                | Opcode::Stop
                | Opcode::Raise
                | Opcode::Appterm1
                | Opcode::Appterm2
                | Opcode::Appterm3
                | Opcode::Appterm
        )
    }

    /// Which argument slot holds a branch/handler target, if any.
    /// `CLOSUREREC` targets live in the extension list instead.
    pub fn target_slot(self) -> Option<usize> {
        match self {
            Opcode::Branch | Opcode::BranchIf | Opcode::BranchIfNot | Opcode::PushTrap => Some(0),
            Opcode::Beq
            | Opcode::Bneq
            | Opcode::BltInt
            | Opcode::BleInt
            | Opcode::BgtInt
            | Opcode::BgeInt
            | Opcode::BultInt
            | Opcode::BugeInt
            | Opcode::Closure => Some(1),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        OPCODES
            .iter()
            .find(|(_, op)| *op == self)
            .map(|(name, _)| *name)
            .unwrap_or("?")
    }
}

/// Textual names, as the loader spells them.
pub const OPCODES: &[(&str, Opcode)] = &[
    ("CONST0", Opcode::Const0),
    ("CONST1", Opcode::Const1),
    ("CONST2", Opcode::Const2),
    ("CONST3", Opcode::Const3),
    ("CONSTINT", Opcode::ConstInt),
    ("PUSHCONST0", Opcode::PushConst0),
    ("PUSHCONST1", Opcode::PushConst1),
    ("PUSHCONST2", Opcode::PushConst2),
    ("PUSHCONST3", Opcode::PushConst3),
    ("PUSHCONSTINT", Opcode::PushConstInt),
    ("PUSH", Opcode::Push),
    ("POP", Opcode::Pop),
    ("PUSH_RETADDR", Opcode::PushRetAddr),
    ("ACC0", Opcode::Acc0),
    ("ACC1", Opcode::Acc1),
    ("ACC2", Opcode::Acc2),
    ("ACC3", Opcode::Acc3),
    ("ACC4", Opcode::Acc4),
    ("ACC5", Opcode::Acc5),
    ("ACC6", Opcode::Acc6),
    ("ACC7", Opcode::Acc7),
    ("ACC", Opcode::Acc),
    ("PUSHACC0", Opcode::PushAcc0),
    ("PUSHACC1", Opcode::PushAcc1),
    ("PUSHACC2", Opcode::PushAcc2),
    ("PUSHACC3", Opcode::PushAcc3),
    ("PUSHACC4", Opcode::PushAcc4),
    ("PUSHACC5", Opcode::PushAcc5),
    ("PUSHACC6", Opcode::PushAcc6),
    ("PUSHACC7", Opcode::PushAcc7),
    ("PUSHACC", Opcode::PushAcc),
    ("ENVACC1", Opcode::EnvAcc1),
    ("ENVACC2", Opcode::EnvAcc2),
    ("ENVACC3", Opcode::EnvAcc3),
    ("ENVACC4", Opcode::EnvAcc4),
    ("ENVACC", Opcode::EnvAcc),
    ("PUSHENVACC1", Opcode::PushEnvAcc1),
    ("PUSHENVACC2", Opcode::PushEnvAcc2),
    ("PUSHENVACC3", Opcode::PushEnvAcc3),
    ("PUSHENVACC4", Opcode::PushEnvAcc4),
    ("PUSHENVACC", Opcode::PushEnvAcc),
    ("ASSIGN", Opcode::Assign),
    ("ADDINT", Opcode::AddInt),
    ("SUBINT", Opcode::SubInt),
    ("MULINT", Opcode::MulInt),
    ("DIVINT", Opcode::DivInt),
    ("MODINT", Opcode::ModInt),
    ("NEGINT", Opcode::NegInt),
    ("OFFSETINT", Opcode::OffsetInt),
    ("EQ", Opcode::Eq),
    ("NEQ", Opcode::Neq),
    ("LTINT", Opcode::LtInt),
    ("LEINT", Opcode::LeInt),
    ("GTINT", Opcode::GtInt),
    ("GEINT", Opcode::GeInt),
    ("ULTINT", Opcode::UltInt),
    ("UGEINT", Opcode::UgeInt),
    ("GETGLOBAL", Opcode::GetGlobal),
    ("PUSHGETGLOBAL", Opcode::PushGetGlobal),
    ("SETGLOBAL", Opcode::SetGlobal),
    ("ATOM0", Opcode::Atom0),
    ("ATOM", Opcode::Atom),
    ("PUSHATOM0", Opcode::PushAtom0),
    ("PUSHATOM", Opcode::PushAtom),
    ("MAKEBLOCK1", Opcode::MakeBlock1),
    ("MAKEBLOCK2", Opcode::MakeBlock2),
    ("MAKEBLOCK3", Opcode::MakeBlock3),
    ("MAKEBLOCK", Opcode::MakeBlock),
    ("GETFIELD0", Opcode::GetField0),
    ("GETFIELD1", Opcode::GetField1),
    ("GETFIELD2", Opcode::GetField2),
    ("GETFIELD3", Opcode::GetField3),
    ("GETFIELD", Opcode::GetField),
    ("SETFIELD0", Opcode::SetField0),
    ("SETFIELD1", Opcode::SetField1),
    ("SETFIELD2", Opcode::SetField2),
    ("SETFIELD3", Opcode::SetField3),
    ("SETFIELD", Opcode::SetField),
    ("CLOSURE", Opcode::Closure),
    ("CLOSUREREC", Opcode::ClosureRec),
    ("OFFSETCLOSURE0", Opcode::OffsetClosure0),
    ("PUSHOFFSETCLOSURE0", Opcode::PushOffsetClosure0),
    ("C_CALL1", Opcode::CCall1),
    ("C_CALL2", Opcode::CCall2),
    ("C_CALL3", Opcode::CCall3),
    ("C_CALL4", Opcode::CCall4),
    ("C_CALL5", Opcode::CCall5),
    ("C_CALLN", Opcode::CCallN),
    ("APPLY1", Opcode::Apply1),
    ("APPLY2", Opcode::Apply2),
    ("APPLY3", Opcode::Apply3),
    ("APPLY", Opcode::Apply),
    ("APPTERM1", Opcode::Appterm1),
    ("APPTERM2", Opcode::Appterm2),
    ("APPTERM3", Opcode::Appterm3),
    ("APPTERM", Opcode::Appterm),
    ("RETURN", Opcode::Return),
    ("STOP", Opcode::Stop),
    ("BRANCH", Opcode::Branch),
    ("BRANCHIF", Opcode::BranchIf),
    ("BRANCHIFNOT", Opcode::BranchIfNot),
    ("BEQ", Opcode::Beq),
    ("BNEQ", Opcode::Bneq),
    ("BLTINT", Opcode::BltInt),
    ("BLEINT", Opcode::BleInt),
    ("BGTINT", Opcode::BgtInt),
    ("BGEINT", Opcode::BgeInt),
    ("BULTINT", Opcode::BultInt),
    ("BUGEINT", Opcode::BugeInt),
    ("PUSHTRAP", Opcode::PushTrap),
    ("POPTRAP", Opcode::PopTrap),
    ("RAISE", Opcode::Raise),
    ("CHECK_SIGNALS", Opcode::CheckSignals),
];

/// A decoded instruction. Branch targets in `args` are absolute indices;
/// `rec` carries the target list of recursive-closure opcodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub op: Opcode,
    pub args: [i32; 3],
    pub rec: Vec<u32>,
    pub leader: bool,
}

impl Instruction {
    pub fn new(op: Opcode) -> Self {
        Instruction {
            op,
            args: [0; 3],
            rec: Vec::new(),
            leader: false,
        }
    }

    pub fn with_args(op: Opcode, args: &[i32]) -> Self {
        let mut inst = Instruction::new(op);
        for (i, &a) in args.iter().take(3).enumerate() {
            inst.args[i] = a;
        }
        inst
    }

    /// The branch/handler target, if this opcode carries one.
    pub fn target(&self) -> Option<usize> {
        self.op.target_slot().map(|slot| self.args[slot] as usize)
    }
}

/// Mark basic-block leaders: the stream head, every branch or handler
/// target, every closure target (a function entry), and the instruction
/// following a jump or return.
pub fn annotate(instrs: &mut [Instruction]) {
    if let Some(first) = instrs.first_mut() {
        first.leader = true;
    }
    let len = instrs.len();
    let mut leaders = Vec::new();
    for (i, inst) in instrs.iter().enumerate() {
        if let Some(t) = inst.target()
            && t < len
        {
            leaders.push(t);
        }
        for &t in &inst.rec {
            if (t as usize) < len {
                leaders.push(t as usize);
            }
        }
        if (inst.op.is_jump() || inst.op.is_return()) && i + 1 < len {
            leaders.push(i + 1);
        }
    }
    for t in leaders {
        instrs[t].leader = true;
    }
}
