//! Tests for instruction selection and linearization.

use crate::asm::instr::{Instruction, JumpCondition};
use crate::asm::Asmable;
use crate::codegen::instruction_set::instruction_set;
use crate::codegen::{Covering, DynamicCoveringBuilder, Match, Pattern, linearize};
use crate::ir::builder::ControlFlowGraphBuilder;
use crate::ir::cfg::CfgLinkType;
use crate::ir::node::{IrNode, IrTree};
use crate::ir::register::Register;
use std::rc::Rc;

fn cover_value(node: &IrTree) -> Vec<Instruction> {
    let table = instruction_set();
    DynamicCoveringBuilder::new(&table).cover_unconditional(node)
}

// ── Covering ────────────────────────────────────────────────────────────

#[test]
fn test_register_write_of_constant_uses_specialised_pattern() {
    let register = Register::fresh();
    let node = IrNode::register_write(register, IrNode::constant(5));

    let covered = cover_value(&node);

    // One `mov reg, 5`, not a materialize-then-move pair.
    assert_eq!(covered.len(), 1);
    assert!(matches!(
        &covered[0],
        Instruction::MoveRI { dst, constant } if *dst == register && constant.value() == 5
    ));
}

#[test]
fn test_covering_threads_child_registers() {
    let node = IrNode::add(IrNode::constant(1), IrNode::constant(2));

    let covered = cover_value(&node);

    // mov r_a, 1; mov r_b, 2; add r_a, r_b; mov out, r_a
    assert_eq!(covered.len(), 4);
    let Instruction::MoveRI { dst: left, .. } = &covered[0] else {
        panic!("expected constant load, got {:?}", covered[0]);
    };
    let Instruction::MoveRI { dst: right, .. } = &covered[1] else {
        panic!("expected constant load, got {:?}", covered[1]);
    };
    assert!(matches!(
        &covered[2],
        Instruction::AddRR { reg0, reg1 } if reg0 == left && reg1 == right
    ));
    assert!(matches!(
        &covered[3],
        Instruction::MoveRR { src, .. } if src == left
    ));
}

#[test]
fn test_conditional_covering_emits_direct_jump() {
    let a = Register::fresh();
    let b = Register::fresh();
    let node = IrNode::equals(IrNode::register_read(a), IrNode::register_read(b));

    let table = instruction_set();
    let covering = DynamicCoveringBuilder::new(&table);

    let covered = covering.cover_conditional(&node, "_target", false);
    assert!(matches!(
        covered.last(),
        Some(Instruction::JmpCc { cond: JumpCondition::Eq, target }) if target == "_target"
    ));
    // No set<cc>: the boolean is never materialized in branch context.
    assert!(
        !covered
            .iter()
            .any(|instruction| matches!(instruction, Instruction::SetCc { .. }))
    );

    let inverted = covering.cover_conditional(&node, "_target", true);
    assert!(matches!(
        inverted.last(),
        Some(Instruction::JmpCc { cond: JumpCondition::NEq, .. })
    ));
}

#[test]
fn test_division_pins_hardware_registers() {
    let node = Rc::new(IrNode::Divide(IrNode::constant(10), IrNode::constant(3)));

    let covered = cover_value(&node);

    assert!(covered.contains(&Instruction::Cqo));
    assert!(
        covered
            .iter()
            .any(|instruction| matches!(instruction, Instruction::DivR { .. }))
    );
    // The quotient comes out of RAX.
    assert!(matches!(
        covered.last(),
        Some(Instruction::MoveRR { src, .. }) if *src == Register::RAX
    ));
}

#[test]
#[should_panic(expected = "no instruction pattern matches")]
fn test_missing_pattern_is_a_programming_error() {
    let empty: Vec<Box<dyn Pattern>> = vec![];
    DynamicCoveringBuilder::new(&empty).cover_unconditional(&IrNode::constant(1));
}

#[test]
fn test_cheaper_tiling_wins() {
    // A pattern table with an expensive catch-all for constants and a
    // cheap specialised tile for Add(Const, Const): the covering must pick
    // the single cheap tile over three expensive ones.
    struct ExpensiveConst;
    impl Pattern for ExpensiveConst {
        fn match_value(&self, node: &IrTree) -> Option<Match> {
            match &**node {
                IrNode::Const(constant) => {
                    let constant = constant.clone();
                    Some(Match::new(vec![], 10, move |_, out| {
                        vec![Instruction::MoveRI { dst: out, constant }]
                    }))
                }
                _ => None,
            }
        }
        fn match_unconditional(&self, node: &IrTree) -> Option<Match> {
            self.match_value(node)
        }
        fn match_conditional(&self, _: &IrTree, _: &str, _: bool) -> Option<Match> {
            None
        }
    }

    struct GenericAdd;
    impl Pattern for GenericAdd {
        fn match_value(&self, node: &IrTree) -> Option<Match> {
            match &**node {
                IrNode::Add(left, right) => {
                    Some(Match::new(vec![left.clone(), right.clone()], 10, |ins, out| {
                        vec![
                            Instruction::AddRR {
                                reg0: ins[0],
                                reg1: ins[1],
                            },
                            Instruction::MoveRR {
                                dst: out,
                                src: ins[0],
                            },
                        ]
                    }))
                }
                _ => None,
            }
        }
        fn match_unconditional(&self, node: &IrTree) -> Option<Match> {
            self.match_value(node)
        }
        fn match_conditional(&self, _: &IrTree, _: &str, _: bool) -> Option<Match> {
            None
        }
    }

    struct FusedConstAdd;
    impl Pattern for FusedConstAdd {
        fn match_value(&self, node: &IrTree) -> Option<Match> {
            match &**node {
                IrNode::Add(left, right) => match (&**left, &**right) {
                    (IrNode::Const(a), IrNode::Const(b)) => {
                        let folded = a.value() + b.value();
                        Some(Match::new(vec![], 1, move |_, out| {
                            vec![Instruction::MoveRI {
                                dst: out,
                                constant: folded.into(),
                            }]
                        }))
                    }
                    _ => None,
                },
                _ => None,
            }
        }
        fn match_unconditional(&self, node: &IrTree) -> Option<Match> {
            self.match_value(node)
        }
        fn match_conditional(&self, _: &IrTree, _: &str, _: bool) -> Option<Match> {
            None
        }
    }

    let table: Vec<Box<dyn Pattern>> =
        vec![Box::new(ExpensiveConst), Box::new(GenericAdd), Box::new(FusedConstAdd)];
    let covered = DynamicCoveringBuilder::new(&table)
        .cover_unconditional(&IrNode::add(IrNode::constant(1), IrNode::constant(2)));

    assert_eq!(covered.len(), 1);
    assert!(matches!(
        &covered[0],
        Instruction::MoveRI { constant, .. } if constant.value() == 3
    ));
}

// ── Linearization ───────────────────────────────────────────────────────

fn instructions_of(stream: &[Asmable]) -> Vec<&Instruction> {
    stream.iter().filter_map(Asmable::as_instruction).collect()
}

#[test]
fn test_linearize_empty_graph() {
    let cfg = ControlFlowGraphBuilder::new().build();
    let table = instruction_set();
    assert!(linearize(&cfg, &DynamicCoveringBuilder::new(&table)).is_empty());
}

#[test]
fn test_linearize_straight_line_has_no_jumps() {
    let first = IrNode::register_write(Register::fresh(), IrNode::constant(1));
    let second = IrNode::register_write(Register::fresh(), IrNode::constant(2));
    let mut builder = ControlFlowGraphBuilder::new();
    builder.add_single_tree(first);
    builder.add_single_tree(second);

    let table = instruction_set();
    let stream = linearize(&builder.build(), &DynamicCoveringBuilder::new(&table));

    assert!(stream.iter().all(|asmable| !asmable.is_label()));
    assert!(
        instructions_of(&stream)
            .iter()
            .all(|instruction| instruction.target_label().is_none())
    );
}

#[test]
fn test_linearize_if_else_emits_one_conditional_jump() {
    // cond ? a : b, both joining at a common continuation.
    let cond = IrNode::register_read(Register::fresh());
    let when_true = IrNode::register_write(Register::fresh(), IrNode::constant(1));
    let when_false = IrNode::register_write(Register::fresh(), IrNode::constant(2));
    let join = IrNode::register_write(Register::fresh(), IrNode::constant(3));

    let mut builder = ControlFlowGraphBuilder::new();
    builder.add_link(None, cond.clone(), true);
    builder.add_link(
        Some((cond.clone(), CfgLinkType::ConditionalTrue)),
        when_true.clone(),
        true,
    );
    builder.add_link(
        Some((cond, CfgLinkType::ConditionalFalse)),
        when_false.clone(),
        true,
    );
    builder.add_link(
        Some((when_true, CfgLinkType::Unconditional)),
        join.clone(),
        true,
    );
    builder.add_link(Some((when_false, CfgLinkType::Unconditional)), join, true);

    let table = instruction_set();
    let stream = linearize(&builder.build(), &DynamicCoveringBuilder::new(&table));

    let conditional_jumps = instructions_of(&stream)
        .iter()
        .filter(|instruction| matches!(instruction, Instruction::JmpCc { .. }))
        .count();
    assert_eq!(conditional_jumps, 1, "one side of the branch falls through");

    // The join is emitted once and reached by exactly one explicit jump.
    let moves_of_three = instructions_of(&stream)
        .iter()
        .filter(|instruction| {
            matches!(instruction, Instruction::MoveRI { constant, .. } if constant.value() == 3)
        })
        .count();
    assert_eq!(moves_of_three, 1, "join code must not be duplicated");
}

/// The always-taken-break scenario: `while (false) { if (true) break }`
/// followed by evaluating `456`. The loop's conditional must produce
/// exactly one backward jump to the loop header, and the break target must
/// fall through into the continuation without duplicating it.
#[test]
fn test_linearize_loop_with_break_falls_through() {
    let loop_condition = IrNode::constant(0);
    let break_condition = IrNode::constant(1);
    let join = IrNode::no_op();
    let continuation = IrNode::register_write(Register::fresh(), IrNode::constant(456));

    let mut builder = ControlFlowGraphBuilder::new();
    builder.add_link(None, loop_condition.clone(), true);
    builder.add_link(
        Some((loop_condition.clone(), CfgLinkType::ConditionalTrue)),
        break_condition.clone(),
        true,
    );
    builder.add_link(
        Some((loop_condition.clone(), CfgLinkType::ConditionalFalse)),
        join.clone(),
        true,
    );
    // `break` jumps to the join; the empty false branch loops back.
    builder.add_link(
        Some((break_condition.clone(), CfgLinkType::ConditionalTrue)),
        join.clone(),
        true,
    );
    builder.add_link(
        Some((break_condition, CfgLinkType::ConditionalFalse)),
        loop_condition,
        true,
    );
    builder.add_link(Some((join, CfgLinkType::Unconditional)), continuation, true);

    let table = instruction_set();
    let stream = linearize(&builder.build(), &DynamicCoveringBuilder::new(&table));

    let unconditional_jumps: Vec<_> = instructions_of(&stream)
        .iter()
        .filter_map(|instruction| match instruction {
            Instruction::Jmp { target } => Some(target.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(
        unconditional_jumps.len(),
        1,
        "only the loop-back edge needs an explicit jump"
    );
    // It jumps backwards to the loop header, which is the entry label.
    let first_label = stream.iter().find_map(|asmable| match asmable {
        Asmable::Label(label) => Some(label.clone()),
        _ => None,
    });
    assert_eq!(first_label.as_deref(), Some(unconditional_jumps[0].as_str()));

    // The continuation exists exactly once and is not jumped to: the break
    // target falls through.
    let moves_of_456 = instructions_of(&stream)
        .iter()
        .filter(|instruction| {
            matches!(instruction, Instruction::MoveRI { constant, .. } if constant.value() == 456)
        })
        .count();
    assert_eq!(moves_of_456, 1);
}

#[test]
fn test_linearize_keeps_pinned_labels() {
    // A LabeledNode keeps its label even without jumps to it, because
    // outside code (the yield call) references it.
    let pinned = IrNode::labeled(
        ".yield",
        IrNode::register_write(Register::fresh(), IrNode::stack_pop()),
    );
    let mut builder = ControlFlowGraphBuilder::new();
    builder.add_single_tree(pinned);

    let table = instruction_set();
    let stream = linearize(&builder.build(), &DynamicCoveringBuilder::new(&table));

    assert!(
        stream
            .iter()
            .any(|asmable| matches!(asmable, Asmable::Label(label) if label == ".yield"))
    );
    // The wrapped node is covered normally.
    assert!(
        instructions_of(&stream)
            .iter()
            .any(|instruction| matches!(instruction, Instruction::PopR { .. }))
    );
}

#[test]
fn test_linearize_revisited_node_gets_backward_jump() {
    // a → b → a: the second visit of `a` must become a jump, not a copy.
    let a = IrNode::register_write(Register::fresh(), IrNode::constant(1));
    let b = IrNode::register_write(Register::fresh(), IrNode::constant(2));
    let mut builder = ControlFlowGraphBuilder::new();
    builder.add_link(None, a.clone(), true);
    builder.add_link(Some((a.clone(), CfgLinkType::Unconditional)), b.clone(), true);
    builder.add_link(Some((b, CfgLinkType::Unconditional)), a, true);

    let table = instruction_set();
    let stream = linearize(&builder.build(), &DynamicCoveringBuilder::new(&table));

    let ones = instructions_of(&stream)
        .iter()
        .filter(|instruction| {
            matches!(instruction, Instruction::MoveRI { constant, .. } if constant.value() == 1)
        })
        .count();
    assert_eq!(ones, 1, "revisited code must not be re-emitted");
    assert_eq!(
        instructions_of(&stream)
            .iter()
            .filter(|instruction| matches!(instruction, Instruction::Jmp { .. }))
            .count(),
        1
    );
}
