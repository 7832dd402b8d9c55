//! Target machine instructions.
//!
//! A closed variant rather than a class hierarchy: every consumer —
//! liveness def/use extraction, linearization, spill rewriting, rendering —
//! matches exhaustively, so adding an instruction cannot silently miss a
//! consumer. Instructions report the registers they define and use, and
//! classify into the four shapes the dataflow phase cares about.

use crate::asm::addressing::Addressing;
use crate::ir::constant::Constant;
use crate::ir::register::Register;
use std::collections::HashMap;

/// Condition codes of conditional jumps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JumpCondition {
    Eq,
    NEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Zero,
    NotZero,
}

impl JumpCondition {
    /// The opposite polarity; used when a branch's condition is inverted
    /// instead of materialized.
    pub fn inverted(self) -> JumpCondition {
        match self {
            JumpCondition::Eq => JumpCondition::NEq,
            JumpCondition::NEq => JumpCondition::Eq,
            JumpCondition::Lt => JumpCondition::GtEq,
            JumpCondition::LtEq => JumpCondition::Gt,
            JumpCondition::Gt => JumpCondition::LtEq,
            JumpCondition::GtEq => JumpCondition::Lt,
            JumpCondition::Zero => JumpCondition::NotZero,
            JumpCondition::NotZero => JumpCondition::Zero,
        }
    }

    fn mnemonic(self) -> &'static str {
        match self {
            JumpCondition::Eq => "je",
            JumpCondition::NEq => "jne",
            JumpCondition::Lt => "jl",
            JumpCondition::LtEq => "jle",
            JumpCondition::Gt => "jg",
            JumpCondition::GtEq => "jge",
            JumpCondition::Zero => "jz",
            JumpCondition::NotZero => "jnz",
        }
    }
}

/// Condition codes of `set<cc>`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetCondition {
    Eq,
    NEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl SetCondition {
    fn mnemonic(self) -> &'static str {
        match self {
            SetCondition::Eq => "sete",
            SetCondition::NEq => "setne",
            SetCondition::Lt => "setl",
            SetCondition::LtEq => "setle",
            SetCondition::Gt => "setg",
            SetCondition::GtEq => "setge",
        }
    }
}

/// The control-flow shape of an instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstructionKind {
    /// Falls through to the next instruction.
    InPlace,
    /// Always transfers to its label.
    UnconditionalJump,
    /// Transfers to its label or falls through.
    ConditionalJump,
    /// Ends the instruction stream (ret, computed jump).
    Terminal,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Instruction {
    // Moves.
    /// MOV dst, src
    MoveRR { dst: Register, src: Register },
    /// MOV dst, mem
    MoveRM { dst: Register, src: Addressing },
    /// MOV mem, src
    MoveMR { dst: Addressing, src: Register },
    /// MOV dst, constant
    MoveRI { dst: Register, constant: Constant },
    /// LEA reg, mem
    Lea { reg: Register, address: Addressing },

    // Calls. The used/defined lists carry the calling convention's
    // argument and clobber registers into liveness analysis.
    /// CALL reg
    CallR {
        reg: Register,
        used: Vec<Register>,
        defined: Vec<Register>,
    },
    /// CALL label
    CallL {
        label: String,
        used: Vec<Register>,
        defined: Vec<Register>,
    },

    // Stack.
    /// PUSH reg
    PushR { reg: Register },
    /// PUSH mem
    PushM { address: Addressing },
    /// PUSH imm
    PushI { constant: Constant },
    /// POP reg
    PopR { reg: Register },
    /// POP mem
    PopM { address: Addressing },

    // Arithmetic.
    /// NEG reg
    NegR { reg: Register },
    /// ADD reg0, reg1
    AddRR { reg0: Register, reg1: Register },
    /// SUB reg0, reg1
    SubRR { reg0: Register, reg1: Register },
    /// IMUL reg0, reg1
    MulRR { reg0: Register, reg1: Register },
    /// IDIV reg — RAX ← RDX:RAX / reg, RDX ← RDX:RAX % reg
    DivR { reg: Register },
    /// CQO — sign-extend RAX into RDX
    Cqo,

    // Bitwise.
    /// NOT reg
    NotR { reg: Register },
    /// AND reg0, reg1
    AndRR { reg0: Register, reg1: Register },
    /// OR reg0, reg1
    OrRR { reg0: Register, reg1: Register },
    /// XOR reg0, reg1
    XorRR { reg0: Register, reg1: Register },
    /// SAL reg, CL
    ShiftLeftR { reg: Register },
    /// SAR reg, CL
    ShiftRightR { reg: Register },

    // Comparisons.
    /// CMP reg0, reg1
    CmpRR { reg0: Register, reg1: Register },
    /// TEST reg0, reg1
    TestRR { reg0: Register, reg1: Register },
    /// SET<cc> reg8
    SetCc { cond: SetCondition, reg: Register },

    // Jumps.
    /// JMP label
    Jmp { target: String },
    /// J<cc> label
    JmpCc {
        cond: JumpCondition,
        target: String,
    },

    // Terminals.
    /// RET; `used` carries the registers the caller expects intact.
    Ret { used: Vec<Register> },
    /// JMP reg (resume dispatch)
    JmpR { reg: Register },

    /// Placeholder for tests; not renderable.
    Dummy {
        used: Vec<Register>,
        defined: Vec<Register>,
    },
}

impl Instruction {
    pub fn kind(&self) -> InstructionKind {
        match self {
            Instruction::Jmp { .. } => InstructionKind::UnconditionalJump,
            Instruction::JmpCc { .. } => InstructionKind::ConditionalJump,
            Instruction::Ret { .. } | Instruction::JmpR { .. } => InstructionKind::Terminal,
            _ => InstructionKind::InPlace,
        }
    }

    /// Jump target label, for either jump shape.
    pub fn target_label(&self) -> Option<&str> {
        match self {
            Instruction::Jmp { target } | Instruction::JmpCc { target, .. } => Some(target),
            _ => None,
        }
    }

    /// Registers this instruction reads.
    pub fn regs_used(&self) -> Vec<Register> {
        match self {
            Instruction::MoveRR { src, .. } => vec![*src],
            Instruction::MoveRM { src, .. } => src.regs_used(),
            Instruction::MoveMR { dst, src } => {
                let mut regs = vec![*src];
                regs.extend(dst.regs_used());
                regs
            }
            Instruction::MoveRI { .. } => vec![],
            Instruction::Lea { address, .. } => address.regs_used(),
            Instruction::CallR { reg, used, .. } => {
                let mut regs = used.clone();
                if !regs.contains(reg) {
                    regs.push(*reg);
                }
                regs
            }
            Instruction::CallL { used, .. } => used.clone(),
            Instruction::PushR { reg } => vec![*reg],
            Instruction::PushM { address } => address.regs_used(),
            Instruction::PushI { .. } => vec![],
            Instruction::PopR { .. } => vec![],
            Instruction::PopM { address } => address.regs_used(),
            Instruction::NegR { reg } | Instruction::NotR { reg } => vec![*reg],
            Instruction::AddRR { reg0, reg1 }
            | Instruction::SubRR { reg0, reg1 }
            | Instruction::MulRR { reg0, reg1 }
            | Instruction::AndRR { reg0, reg1 }
            | Instruction::OrRR { reg0, reg1 }
            | Instruction::XorRR { reg0, reg1 }
            | Instruction::CmpRR { reg0, reg1 }
            | Instruction::TestRR { reg0, reg1 } => vec![*reg0, *reg1],
            Instruction::DivR { reg } => vec![Register::RAX, Register::RDX, *reg],
            Instruction::Cqo => vec![Register::RAX],
            Instruction::ShiftLeftR { reg } | Instruction::ShiftRightR { reg } => {
                vec![*reg, Register::RCX]
            }
            Instruction::SetCc { reg, .. } => vec![*reg],
            Instruction::Jmp { .. } | Instruction::JmpCc { .. } => vec![],
            Instruction::Ret { used } => used.clone(),
            Instruction::JmpR { reg } => vec![*reg],
            Instruction::Dummy { used, .. } => used.clone(),
        }
    }

    /// Registers this instruction writes.
    pub fn regs_defined(&self) -> Vec<Register> {
        match self {
            Instruction::MoveRR { dst, .. }
            | Instruction::MoveRM { dst, .. }
            | Instruction::MoveRI { dst, .. } => vec![*dst],
            Instruction::MoveMR { .. } => vec![],
            Instruction::Lea { reg, .. } => vec![*reg],
            Instruction::CallR { defined, .. } | Instruction::CallL { defined, .. } => {
                defined.clone()
            }
            Instruction::PushR { .. }
            | Instruction::PushM { .. }
            | Instruction::PushI { .. }
            | Instruction::PopM { .. } => vec![],
            Instruction::PopR { reg } => vec![*reg],
            Instruction::NegR { reg } | Instruction::NotR { reg } => vec![*reg],
            Instruction::AddRR { reg0, .. }
            | Instruction::SubRR { reg0, .. }
            | Instruction::MulRR { reg0, .. }
            | Instruction::AndRR { reg0, .. }
            | Instruction::OrRR { reg0, .. }
            | Instruction::XorRR { reg0, .. } => vec![*reg0],
            Instruction::DivR { .. } => vec![Register::RAX, Register::RDX],
            Instruction::Cqo => vec![Register::RDX],
            Instruction::ShiftLeftR { reg } | Instruction::ShiftRightR { reg } => vec![*reg],
            Instruction::CmpRR { .. } | Instruction::TestRR { .. } => vec![],
            Instruction::SetCc { reg, .. } => vec![*reg],
            Instruction::Jmp { .. }
            | Instruction::JmpCc { .. }
            | Instruction::Ret { .. }
            | Instruction::JmpR { .. } => vec![],
            Instruction::Dummy { defined, .. } => defined.clone(),
        }
    }

    /// Rebuild the instruction with every register replaced through `f`.
    /// Used by spill rewriting to substitute reserved registers.
    pub fn map_registers(&self, f: &dyn Fn(Register) -> Register) -> Instruction {
        let map_all = |regs: &Vec<Register>| regs.iter().map(|r| f(*r)).collect::<Vec<_>>();
        match self {
            Instruction::MoveRR { dst, src } => Instruction::MoveRR {
                dst: f(*dst),
                src: f(*src),
            },
            Instruction::MoveRM { dst, src } => Instruction::MoveRM {
                dst: f(*dst),
                src: src.map_registers(f),
            },
            Instruction::MoveMR { dst, src } => Instruction::MoveMR {
                dst: dst.map_registers(f),
                src: f(*src),
            },
            Instruction::MoveRI { dst, constant } => Instruction::MoveRI {
                dst: f(*dst),
                constant: constant.clone(),
            },
            Instruction::Lea { reg, address } => Instruction::Lea {
                reg: f(*reg),
                address: address.map_registers(f),
            },
            Instruction::CallR { reg, used, defined } => Instruction::CallR {
                reg: f(*reg),
                used: map_all(used),
                defined: map_all(defined),
            },
            Instruction::CallL {
                label,
                used,
                defined,
            } => Instruction::CallL {
                label: label.clone(),
                used: map_all(used),
                defined: map_all(defined),
            },
            Instruction::PushR { reg } => Instruction::PushR { reg: f(*reg) },
            Instruction::PushM { address } => Instruction::PushM {
                address: address.map_registers(f),
            },
            Instruction::PushI { constant } => Instruction::PushI {
                constant: constant.clone(),
            },
            Instruction::PopR { reg } => Instruction::PopR { reg: f(*reg) },
            Instruction::PopM { address } => Instruction::PopM {
                address: address.map_registers(f),
            },
            Instruction::NegR { reg } => Instruction::NegR { reg: f(*reg) },
            Instruction::AddRR { reg0, reg1 } => Instruction::AddRR {
                reg0: f(*reg0),
                reg1: f(*reg1),
            },
            Instruction::SubRR { reg0, reg1 } => Instruction::SubRR {
                reg0: f(*reg0),
                reg1: f(*reg1),
            },
            Instruction::MulRR { reg0, reg1 } => Instruction::MulRR {
                reg0: f(*reg0),
                reg1: f(*reg1),
            },
            Instruction::DivR { reg } => Instruction::DivR { reg: f(*reg) },
            Instruction::Cqo => Instruction::Cqo,
            Instruction::NotR { reg } => Instruction::NotR { reg: f(*reg) },
            Instruction::AndRR { reg0, reg1 } => Instruction::AndRR {
                reg0: f(*reg0),
                reg1: f(*reg1),
            },
            Instruction::OrRR { reg0, reg1 } => Instruction::OrRR {
                reg0: f(*reg0),
                reg1: f(*reg1),
            },
            Instruction::XorRR { reg0, reg1 } => Instruction::XorRR {
                reg0: f(*reg0),
                reg1: f(*reg1),
            },
            Instruction::ShiftLeftR { reg } => Instruction::ShiftLeftR { reg: f(*reg) },
            Instruction::ShiftRightR { reg } => Instruction::ShiftRightR { reg: f(*reg) },
            Instruction::CmpRR { reg0, reg1 } => Instruction::CmpRR {
                reg0: f(*reg0),
                reg1: f(*reg1),
            },
            Instruction::TestRR { reg0, reg1 } => Instruction::TestRR {
                reg0: f(*reg0),
                reg1: f(*reg1),
            },
            Instruction::SetCc { cond, reg } => Instruction::SetCc {
                cond: *cond,
                reg: f(*reg),
            },
            Instruction::Jmp { target } => Instruction::Jmp {
                target: target.clone(),
            },
            Instruction::JmpCc { cond, target } => Instruction::JmpCc {
                cond: *cond,
                target: target.clone(),
            },
            Instruction::Ret { used } => Instruction::Ret { used: map_all(used) },
            Instruction::JmpR { reg } => Instruction::JmpR { reg: f(*reg) },
            Instruction::Dummy { used, defined } => Instruction::Dummy {
                used: map_all(used),
                defined: map_all(defined),
            },
        }
    }

    pub fn to_asm(&self, registers: &HashMap<Register, Register>) -> String {
        let r = |register: &Register| registers[register].to_asm();
        let r8 = |register: &Register| registers[register].to_8bit_lower();
        match self {
            Instruction::MoveRR { dst, src } => format!("mov {}, {}", r(dst), r(src)),
            Instruction::MoveRM { dst, src } => {
                format!("mov {}, {}", r(dst), src.to_asm(registers))
            }
            Instruction::MoveMR { dst, src } => {
                format!("mov {}, {}", dst.to_asm(registers), r(src))
            }
            Instruction::MoveRI { dst, constant } => {
                format!("mov {}, {}", r(dst), constant.value())
            }
            Instruction::Lea { reg, address } => {
                format!("lea {}, {}", r(reg), address.to_asm(registers))
            }
            Instruction::CallR { reg, .. } => format!("call {}", r(reg)),
            Instruction::CallL { label, .. } => format!("call {}", label),
            Instruction::PushR { reg } => format!("push {}", r(reg)),
            Instruction::PushM { address } => format!("push {}", address.to_asm(registers)),
            Instruction::PushI { constant } => format!("push {}", constant.value()),
            Instruction::PopR { reg } => format!("pop {}", r(reg)),
            Instruction::PopM { address } => format!("pop {}", address.to_asm(registers)),
            Instruction::NegR { reg } => format!("neg {}", r(reg)),
            Instruction::AddRR { reg0, reg1 } => format!("add {}, {}", r(reg0), r(reg1)),
            Instruction::SubRR { reg0, reg1 } => format!("sub {}, {}", r(reg0), r(reg1)),
            Instruction::MulRR { reg0, reg1 } => format!("imul {}, {}", r(reg0), r(reg1)),
            Instruction::DivR { reg } => format!("idiv {}", r(reg)),
            Instruction::Cqo => "cqo".to_string(),
            Instruction::NotR { reg } => format!("not {}", r(reg)),
            Instruction::AndRR { reg0, reg1 } => format!("and {}, {}", r(reg0), r(reg1)),
            Instruction::OrRR { reg0, reg1 } => format!("or {}, {}", r(reg0), r(reg1)),
            Instruction::XorRR { reg0, reg1 } => format!("xor {}, {}", r(reg0), r(reg1)),
            Instruction::ShiftLeftR { reg } => format!("sal {}, cl", r(reg)),
            Instruction::ShiftRightR { reg } => format!("sar {}, cl", r(reg)),
            Instruction::CmpRR { reg0, reg1 } => format!("cmp {}, {}", r(reg0), r(reg1)),
            Instruction::TestRR { reg0, reg1 } => format!("test {}, {}", r(reg0), r(reg1)),
            Instruction::SetCc { cond, reg } => format!("{} {}", cond.mnemonic(), r8(reg)),
            Instruction::Jmp { target } => format!("jmp {}", target),
            Instruction::JmpCc { cond, target } => format!("{} {}", cond.mnemonic(), target),
            Instruction::Ret { .. } => "ret".to_string(),
            Instruction::JmpR { reg } => format!("jmp {}", r(reg)),
            Instruction::Dummy { .. } => panic!("dummy instruction is not printable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::MemoryAddress;

    #[test]
    fn test_use_def_sets() {
        let a = Register::fresh();
        let b = Register::fresh();

        let mov = Instruction::MoveRR { dst: a, src: b };
        assert_eq!(mov.regs_defined(), vec![a]);
        assert_eq!(mov.regs_used(), vec![b]);

        let add = Instruction::AddRR { reg0: a, reg1: b };
        assert_eq!(add.regs_defined(), vec![a]);
        assert_eq!(add.regs_used(), vec![a, b]);

        let div = Instruction::DivR { reg: b };
        assert!(div.regs_defined().contains(&Register::RAX));
        assert!(div.regs_defined().contains(&Register::RDX));
        assert!(div.regs_used().contains(&b));

        let cmp = Instruction::CmpRR { reg0: a, reg1: b };
        assert!(cmp.regs_defined().is_empty());
    }

    #[test]
    fn test_kinds() {
        assert_eq!(
            Instruction::Jmp { target: "_0".into() }.kind(),
            InstructionKind::UnconditionalJump
        );
        assert_eq!(
            Instruction::JmpCc {
                cond: JumpCondition::Eq,
                target: "_0".into()
            }
            .kind(),
            InstructionKind::ConditionalJump
        );
        assert_eq!(Instruction::Ret { used: vec![] }.kind(), InstructionKind::Terminal);
        assert_eq!(Instruction::Cqo.kind(), InstructionKind::InPlace);
    }

    #[test]
    fn test_rendering_with_mapping() {
        let v = Register::fresh();
        let registers = HashMap::from([(v, Register::RBX), (Register::RBP, Register::RBP)]);

        let mov = Instruction::MoveRM {
            dst: v,
            src: Addressing::base_displaced(Register::RBP, MemoryAddress::Const(-16)),
        };
        assert_eq!(mov.to_asm(&registers), "mov rbx, [rbp - 16]");

        let jcc = Instruction::JmpCc {
            cond: JumpCondition::NotZero,
            target: "_3".into(),
        };
        assert_eq!(jcc.to_asm(&HashMap::new()), "jnz _3");
    }

    #[test]
    fn test_inverted_conditions() {
        assert_eq!(JumpCondition::Lt.inverted(), JumpCondition::GtEq);
        assert_eq!(JumpCondition::Zero.inverted(), JumpCondition::NotZero);
        assert_eq!(JumpCondition::Eq.inverted().inverted(), JumpCondition::Eq);
    }
}
