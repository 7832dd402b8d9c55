//! The default x86-64 instruction pattern table.
//!
//! Each entry matches a tree shape and emits NASM-level instructions; the
//! covering picks the cheapest combination. Specialised entries (constant
//! operands, label-relative addressing, pop-into-register) coexist with
//! generic fallbacks, which is what makes the dynamic programming worth
//! running. Conditional entries emit a conditional jump directly instead of
//! materializing a boolean; `invert` folds into the opposite condition
//! code.

use crate::asm::addressing::{Addressing, MemoryAddress};
use crate::asm::instr::{Instruction, JumpCondition, SetCondition};
use crate::codegen::{Match, Pattern};
use crate::ir::node::IrNode;
use crate::ir::{IrTree, Register};

/// Contexts in which a table entry participates.
#[derive(Clone, Copy)]
struct Contexts {
    value: bool,
    unconditional: bool,
    conditional: bool,
}

const VALUE_AND_UNCONDITIONAL: Contexts = Contexts {
    value: true,
    unconditional: true,
    conditional: false,
};

const CONDITIONAL_ONLY: Contexts = Contexts {
    value: false,
    unconditional: false,
    conditional: true,
};

/// The branch target handed to conditional matchers.
#[derive(Clone, Copy)]
struct Branch<'a> {
    target: &'a str,
    invert: bool,
}

impl Branch<'_> {
    fn jump(&self, cond: JumpCondition) -> Instruction {
        Instruction::JmpCc {
            cond: if self.invert { cond.inverted() } else { cond },
            target: self.target.to_string(),
        }
    }
}

struct TablePattern<F> {
    contexts: Contexts,
    matcher: F,
}

impl<F> Pattern for TablePattern<F>
where
    F: Fn(&IrTree, Option<Branch<'_>>) -> Option<Match>,
{
    fn match_value(&self, node: &IrTree) -> Option<Match> {
        if self.contexts.value {
            (self.matcher)(node, None)
        } else {
            None
        }
    }

    fn match_unconditional(&self, node: &IrTree) -> Option<Match> {
        if self.contexts.unconditional {
            (self.matcher)(node, None)
        } else {
            None
        }
    }

    fn match_conditional(&self, node: &IrTree, target_label: &str, invert: bool) -> Option<Match> {
        if self.contexts.conditional {
            (self.matcher)(
                node,
                Some(Branch {
                    target: target_label,
                    invert,
                }),
            )
        } else {
            None
        }
    }
}

fn pattern(
    matcher: impl Fn(&IrTree, Option<Branch<'_>>) -> Option<Match> + 'static,
) -> Box<dyn Pattern> {
    Box::new(TablePattern {
        contexts: VALUE_AND_UNCONDITIONAL,
        matcher,
    })
}

fn conditional(
    matcher: impl Fn(&IrTree, Option<Branch<'_>>) -> Option<Match> + 'static,
) -> Box<dyn Pattern> {
    Box::new(TablePattern {
        contexts: CONDITIONAL_ONLY,
        matcher,
    })
}

/// A two-register arithmetic tile: `op reg0, reg1; mov out, reg0`.
fn two_reg(
    left: &IrTree,
    right: &IrTree,
    op: impl Fn(Register, Register) -> Instruction + 'static,
) -> Match {
    Match::new(vec![left.clone(), right.clone()], 1, move |ins, out| {
        vec![
            op(ins[0], ins[1]),
            Instruction::MoveRR {
                dst: out,
                src: ins[0],
            },
        ]
    })
}

/// A comparison materialized as 0/1: `xor out, out; cmp; set<cc> out`.
fn compare_value(left: &IrTree, right: &IrTree, cond: SetCondition) -> Match {
    Match::new(vec![left.clone(), right.clone()], 1, move |ins, out| {
        vec![
            Instruction::XorRR {
                reg0: out,
                reg1: out,
            },
            Instruction::CmpRR {
                reg0: ins[0],
                reg1: ins[1],
            },
            Instruction::SetCc { cond, reg: out },
        ]
    })
}

/// A comparison in branch context: `cmp; j<cc> target`.
fn compare_branch(left: &IrTree, right: &IrTree, cond: JumpCondition, branch: Branch<'_>) -> Match {
    let jump = branch.jump(cond);
    Match::new(vec![left.clone(), right.clone()], 1, move |ins, _| {
        vec![
            Instruction::CmpRR {
                reg0: ins[0],
                reg1: ins[1],
            },
            jump,
        ]
    })
}

/// The full default pattern table.
pub fn instruction_set() -> Vec<Box<dyn Pattern>> {
    vec![
        // MOV out, [reg0]
        pattern(|node, _| match &**node {
            IrNode::MemoryRead(address) => {
                Some(Match::new(vec![address.clone()], 1, |ins, out| {
                    vec![Instruction::MoveRM {
                        dst: out,
                        src: Addressing::base(ins[0]),
                    }]
                }))
            }
            _ => None,
        }),
        // LEA out, [label]
        pattern(|node, _| match &**node {
            IrNode::MemoryLabel(label) => {
                let label = label.clone();
                Some(Match::new(vec![], 1, move |_, out| {
                    vec![Instruction::Lea {
                        reg: out,
                        address: Addressing::label(label),
                    }]
                }))
            }
            _ => None,
        }),
        // MOV out, reg
        pattern(|node, _| match &**node {
            IrNode::RegisterRead(register) => {
                let register = *register;
                Some(Match::new(vec![], 1, move |_, out| {
                    vec![Instruction::MoveRR {
                        dst: out,
                        src: register,
                    }]
                }))
            }
            _ => None,
        }),
        // MOV out, const
        pattern(|node, _| match &**node {
            IrNode::Const(constant) => {
                let constant = constant.clone();
                Some(Match::new(vec![], 1, move |_, out| {
                    vec![Instruction::MoveRI {
                        dst: out,
                        constant,
                    }]
                }))
            }
            _ => None,
        }),
        // MOV [label + reg0], reg1
        pattern(|node, _| match &**node {
            IrNode::MemoryWrite(address, value) => match &**address {
                IrNode::Add(left, right) => match &**left {
                    IrNode::MemoryLabel(label) => {
                        let label = label.clone();
                        Some(Match::new(
                            vec![right.clone(), value.clone()],
                            1,
                            move |ins, _| {
                                vec![Instruction::MoveMR {
                                    dst: Addressing::base_displaced(
                                        ins[0],
                                        MemoryAddress::Label(label),
                                    ),
                                    src: ins[1],
                                }]
                            },
                        ))
                    }
                    _ => None,
                },
                _ => None,
            },
            _ => None,
        }),
        // MOV [reg0], reg1
        pattern(|node, _| match &**node {
            IrNode::MemoryWrite(address, value) => Some(Match::new(
                vec![address.clone(), value.clone()],
                1,
                |ins, _| {
                    vec![Instruction::MoveMR {
                        dst: Addressing::base(ins[0]),
                        src: ins[1],
                    }]
                },
            )),
            _ => None,
        }),
        // MOV reg, const
        pattern(|node, _| match &**node {
            IrNode::RegisterWrite(register, value) => match &**value {
                IrNode::Const(constant) => {
                    let register = *register;
                    let constant = constant.clone();
                    Some(Match::new(vec![], 1, move |_, _| {
                        vec![Instruction::MoveRI {
                            dst: register,
                            constant,
                        }]
                    }))
                }
                _ => None,
            },
            _ => None,
        }),
        // MOV reg_dest, reg_src
        pattern(|node, _| match &**node {
            IrNode::RegisterWrite(register, value) => match &**value {
                IrNode::RegisterRead(source) => {
                    let (dst, src) = (*register, *source);
                    Some(Match::new(vec![], 1, move |_, _| {
                        vec![Instruction::MoveRR { dst, src }]
                    }))
                }
                _ => None,
            },
            _ => None,
        }),
        // POP reg
        pattern(|node, _| match &**node {
            IrNode::RegisterWrite(register, value) => match &**value {
                IrNode::StackPop => {
                    let register = *register;
                    Some(Match::new(vec![], 1, move |_, _| {
                        vec![Instruction::PopR { reg: register }]
                    }))
                }
                _ => None,
            },
            _ => None,
        }),
        // MOV reg, reg0
        pattern(|node, _| match &**node {
            IrNode::RegisterWrite(register, value) => {
                let register = *register;
                Some(Match::new(vec![value.clone()], 1, move |ins, _| {
                    vec![Instruction::MoveRR {
                        dst: register,
                        src: ins[0],
                    }]
                }))
            }
            _ => None,
        }),
        // PUSH reg
        pattern(|node, _| match &**node {
            IrNode::StackPush(value) => match &**value {
                IrNode::RegisterRead(register) => {
                    let register = *register;
                    Some(Match::new(vec![], 1, move |_, _| {
                        vec![Instruction::PushR { reg: register }]
                    }))
                }
                _ => None,
            },
            _ => None,
        }),
        // PUSH reg0
        pattern(|node, _| match &**node {
            IrNode::StackPush(value) => Some(Match::new(vec![value.clone()], 1, |ins, _| {
                vec![Instruction::PushR { reg: ins[0] }]
            })),
            _ => None,
        }),
        // POP out
        pattern(|node, _| match &**node {
            IrNode::StackPop => Some(Match::new(vec![], 1, |_, out| {
                vec![Instruction::PopR { reg: out }]
            })),
            _ => None,
        }),
        // JMP reg
        pattern(|node, _| match &**node {
            IrNode::JumpToRegister(register) => {
                let register = *register;
                Some(Match::new(vec![], 1, move |_, _| {
                    vec![Instruction::JmpR { reg: register }]
                }))
            }
            _ => None,
        }),
        // CALL label
        pattern(|node, _| match &**node {
            IrNode::Call {
                address,
                used_registers,
                defined_registers,
            } => match &**address {
                IrNode::MemoryLabel(label) => {
                    let label = label.clone();
                    let used = used_registers.clone();
                    let defined = defined_registers.clone();
                    Some(Match::new(vec![], 1, move |_, _| {
                        vec![Instruction::CallL {
                            label,
                            used,
                            defined,
                        }]
                    }))
                }
                _ => None,
            },
            _ => None,
        }),
        // CALL reg0
        pattern(|node, _| match &**node {
            IrNode::Call {
                address,
                used_registers,
                defined_registers,
            } => {
                let used = used_registers.clone();
                let defined = defined_registers.clone();
                Some(Match::new(vec![address.clone()], 1, move |ins, _| {
                    vec![Instruction::CallR {
                        reg: ins[0],
                        used,
                        defined,
                    }]
                }))
            }
            _ => None,
        }),
        // RET
        pattern(|node, _| match &**node {
            IrNode::Return { used_registers } => {
                let used = used_registers.clone();
                Some(Match::new(vec![], 1, move |_, _| {
                    vec![Instruction::Ret { used }]
                }))
            }
            _ => None,
        }),
        // NoOp covers to nothing.
        pattern(|node, _| match &**node {
            IrNode::NoOp => Some(Match::new(vec![], 1, |_, _| vec![])),
            _ => None,
        }),
        // MOV out, reg0; NEG out
        pattern(|node, _| match &**node {
            IrNode::Negation(operand) => Some(Match::new(vec![operand.clone()], 1, |ins, out| {
                vec![
                    Instruction::MoveRR {
                        dst: out,
                        src: ins[0],
                    },
                    Instruction::NegR { reg: out },
                ]
            })),
            _ => None,
        }),
        // Arithmetic and bitwise two-register tiles.
        pattern(|node, _| match &**node {
            IrNode::Add(left, right) => Some(two_reg(left, right, |reg0, reg1| {
                Instruction::AddRR { reg0, reg1 }
            })),
            IrNode::Subtract(left, right) => Some(two_reg(left, right, |reg0, reg1| {
                Instruction::SubRR { reg0, reg1 }
            })),
            IrNode::Multiply(left, right) => Some(two_reg(left, right, |reg0, reg1| {
                Instruction::MulRR { reg0, reg1 }
            })),
            IrNode::BitAnd(left, right) => Some(two_reg(left, right, |reg0, reg1| {
                Instruction::AndRR { reg0, reg1 }
            })),
            IrNode::BitOr(left, right) => Some(two_reg(left, right, |reg0, reg1| {
                Instruction::OrRR { reg0, reg1 }
            })),
            IrNode::BitXor(left, right) | IrNode::LogicalXor(left, right) => {
                Some(two_reg(left, right, |reg0, reg1| Instruction::XorRR {
                    reg0,
                    reg1,
                }))
            }
            _ => None,
        }),
        // MOV rax, reg0; CQO; IDIV reg1; MOV out, rax/rdx
        pattern(|node, _| {
            let (left, right, result) = match &**node {
                IrNode::Divide(left, right) => (left, right, Register::RAX),
                IrNode::Modulo(left, right) => (left, right, Register::RDX),
                _ => return None,
            };
            Some(Match::new(
                vec![left.clone(), right.clone()],
                1,
                move |ins, out| {
                    vec![
                        Instruction::MoveRR {
                            dst: Register::RAX,
                            src: ins[0],
                        },
                        Instruction::Cqo,
                        Instruction::DivR { reg: ins[1] },
                        Instruction::MoveRR {
                            dst: out,
                            src: result,
                        },
                    ]
                },
            ))
        }),
        // NOT reg0; MOV out, reg0
        pattern(|node, _| match &**node {
            IrNode::BitNegation(operand) => {
                Some(Match::new(vec![operand.clone()], 1, |ins, out| {
                    vec![
                        Instruction::NotR { reg: ins[0] },
                        Instruction::MoveRR {
                            dst: out,
                            src: ins[0],
                        },
                    ]
                }))
            }
            _ => None,
        }),
        // Shifts go through CL.
        pattern(|node, _| {
            let (left, right, shift): (_, _, fn(Register) -> Instruction) = match &**node {
                IrNode::BitShiftLeft(left, right) => {
                    (left, right, |reg| Instruction::ShiftLeftR { reg })
                }
                IrNode::BitShiftRight(left, right) => {
                    (left, right, |reg| Instruction::ShiftRightR { reg })
                }
                _ => return None,
            };
            Some(Match::new(
                vec![left.clone(), right.clone()],
                1,
                move |ins, out| {
                    vec![
                        Instruction::MoveRR {
                            dst: Register::RCX,
                            src: ins[1],
                        },
                        shift(ins[0]),
                        Instruction::MoveRR {
                            dst: out,
                            src: ins[0],
                        },
                    ]
                },
            ))
        }),
        // MOV out, 1; XOR out, reg0
        pattern(|node, _| match &**node {
            IrNode::LogicalNegation(operand) => {
                Some(Match::new(vec![operand.clone()], 1, |ins, out| {
                    vec![
                        Instruction::MoveRI {
                            dst: out,
                            constant: 1.into(),
                        },
                        Instruction::XorRR {
                            reg0: out,
                            reg1: ins[0],
                        },
                    ]
                }))
            }
            _ => None,
        }),
        // Comparisons as 0/1 values.
        pattern(|node, _| match &**node {
            IrNode::Equals(left, right) | IrNode::LogicalIff(left, right) => {
                Some(compare_value(left, right, SetCondition::Eq))
            }
            IrNode::NotEquals(left, right) => Some(compare_value(left, right, SetCondition::NEq)),
            IrNode::LessThan(left, right) => Some(compare_value(left, right, SetCondition::Lt)),
            IrNode::LessThanOrEquals(left, right) => {
                Some(compare_value(left, right, SetCondition::LtEq))
            }
            IrNode::GreaterThan(left, right) => Some(compare_value(left, right, SetCondition::Gt)),
            IrNode::GreaterThanOrEquals(left, right) => {
                Some(compare_value(left, right, SetCondition::GtEq))
            }
            _ => None,
        }),
        // Comparisons as branches.
        conditional(|node, branch| {
            let branch = branch?;
            match &**node {
                IrNode::Equals(left, right) | IrNode::LogicalIff(left, right) => {
                    Some(compare_branch(left, right, JumpCondition::Eq, branch))
                }
                IrNode::NotEquals(left, right) => {
                    Some(compare_branch(left, right, JumpCondition::NEq, branch))
                }
                IrNode::LessThan(left, right) => {
                    Some(compare_branch(left, right, JumpCondition::Lt, branch))
                }
                IrNode::LessThanOrEquals(left, right) => {
                    Some(compare_branch(left, right, JumpCondition::LtEq, branch))
                }
                IrNode::GreaterThan(left, right) => {
                    Some(compare_branch(left, right, JumpCondition::Gt, branch))
                }
                IrNode::GreaterThanOrEquals(left, right) => {
                    Some(compare_branch(left, right, JumpCondition::GtEq, branch))
                }
                _ => None,
            }
        }),
        // TEST reg0, reg0; the logical negation cancels against `invert`.
        conditional(|node, branch| {
            let branch = branch?;
            match &**node {
                IrNode::LogicalNegation(operand) => {
                    let jump = branch.jump(JumpCondition::NotZero.inverted());
                    Some(Match::new(vec![operand.clone()], 1, move |ins, _| {
                        vec![
                            Instruction::TestRR {
                                reg0: ins[0],
                                reg1: ins[0],
                            },
                            jump,
                        ]
                    }))
                }
                _ => None,
            }
        }),
        // XOR reg0, reg1; JNZ target
        conditional(|node, branch| {
            let branch = branch?;
            match &**node {
                IrNode::LogicalXor(left, right) => {
                    let jump = branch.jump(JumpCondition::NotZero);
                    Some(Match::new(
                        vec![left.clone(), right.clone()],
                        1,
                        move |ins, _| {
                            vec![
                                Instruction::XorRR {
                                    reg0: ins[0],
                                    reg1: ins[1],
                                },
                                jump,
                            ]
                        },
                    ))
                }
                _ => None,
            }
        }),
        // Fallback branch tiles: test the value against itself.
        conditional(|node, branch| {
            let branch = branch?;
            match &**node {
                IrNode::RegisterRead(register) => {
                    let register = *register;
                    let jump = branch.jump(JumpCondition::NotZero);
                    Some(Match::new(vec![], 1, move |_, _| {
                        vec![
                            Instruction::TestRR {
                                reg0: register,
                                reg1: register,
                            },
                            jump,
                        ]
                    }))
                }
                IrNode::MemoryRead(address) => {
                    let jump = branch.jump(JumpCondition::NotZero);
                    Some(Match::new(vec![address.clone()], 1, move |ins, _| {
                        let scratch = Register::fresh();
                        vec![
                            Instruction::MoveRM {
                                dst: scratch,
                                src: Addressing::base(ins[0]),
                            },
                            Instruction::TestRR {
                                reg0: scratch,
                                reg1: scratch,
                            },
                            jump,
                        ]
                    }))
                }
                IrNode::Const(constant) => {
                    let constant = constant.clone();
                    let jump = branch.jump(JumpCondition::NotZero);
                    Some(Match::new(vec![], 1, move |_, _| {
                        let scratch = Register::fresh();
                        vec![
                            Instruction::MoveRI {
                                dst: scratch,
                                constant,
                            },
                            Instruction::TestRR {
                                reg0: scratch,
                                reg1: scratch,
                            },
                            jump,
                        ]
                    }))
                }
                _ => None,
            }
        }),
    ]
}
