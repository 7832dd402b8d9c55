//! Optimal tree tiling by dynamic programming.
//!
//! For each node, every pattern whose shape matches is costed as its own
//! cost plus the cheapest coverings of its unmatched subtrees; the minimum
//! wins. Costs are memoized by node identity, so shared subtrees are costed
//! once. Emission then walks the chosen tiling depth-first, children before
//! parents, threading each child's output register into the parent tile.
//!
//! Finding no matching pattern for some subtree is an incomplete pattern
//! table — a bug in the target description, not in the input program — and
//! panics.

use crate::asm::Instruction;
use crate::codegen::{Covering, Match, Pattern};
use crate::ir::node::NodeRef;
use crate::ir::{IrTree, Register};
use std::collections::HashMap;

/// Covering over a fixed pattern table; assumes every possible IR tree has
/// at least one viable tiling within the table.
pub struct DynamicCoveringBuilder<'a> {
    instruction_set: &'a [Box<dyn Pattern>],
}

/// How the root of the current covering is being matched. Anything below
/// the root is always matched as a value, because jumps can only be
/// performed from the root of a tree.
#[derive(Clone, Copy)]
enum RootContext<'a> {
    Unconditional,
    Conditional { target_label: &'a str, invert: bool },
}

impl RootContext<'_> {
    fn match_root(&self, pattern: &dyn Pattern, node: &IrTree) -> Option<Match> {
        match self {
            RootContext::Unconditional => pattern.match_unconditional(node),
            RootContext::Conditional {
                target_label,
                invert,
            } => pattern.match_conditional(node, target_label, *invert),
        }
    }
}

impl<'a> DynamicCoveringBuilder<'a> {
    pub fn new(instruction_set: &'a [Box<dyn Pattern>]) -> Self {
        DynamicCoveringBuilder { instruction_set }
    }

    /// Minimum total cost and the index of the winning pattern, memoized by
    /// node identity. `root_context` is `Some` only for the covering root.
    fn best_pattern(
        &self,
        node: &IrTree,
        root_context: Option<RootContext<'_>>,
        choices: &mut HashMap<NodeRef, (u32, usize)>,
    ) -> u32 {
        if root_context.is_none()
            && let Some(&(cost, _)) = choices.get(&NodeRef::from(node))
        {
            return cost;
        }

        let mut best: Option<(u32, usize)> = None;
        for (index, pattern) in self.instruction_set.iter().enumerate() {
            let matched = match root_context {
                Some(context) => context.match_root(pattern.as_ref(), node),
                None => pattern.match_value(node),
            };
            let Some(matched) = matched else { continue };

            let subtree_cost: u32 = matched
                .subtrees
                .iter()
                .map(|subtree| self.best_pattern(subtree, None, choices))
                .sum();
            let total = matched.cost + subtree_cost;

            if best.is_none_or(|(cost, _)| total < cost) {
                best = Some((total, index));
            }
        }

        let (cost, index) =
            best.unwrap_or_else(|| panic!("no instruction pattern matches IR node {:?}", node));
        choices.insert(NodeRef::from(node), (cost, index));
        cost
    }

    /// Emit the instructions of the chosen tiling, depth-first. Returns the
    /// register holding the node's value.
    fn emit(
        &self,
        node: &IrTree,
        root_context: Option<RootContext<'_>>,
        choices: &HashMap<NodeRef, (u32, usize)>,
        out: &mut Vec<Instruction>,
    ) -> Register {
        let (_, index) = choices[&NodeRef::from(node)];
        let pattern = self.instruction_set[index].as_ref();
        let matched = match root_context {
            Some(context) => context.match_root(pattern, node),
            None => pattern.match_value(node),
        }
        .expect("chosen pattern must still match");

        let child_registers: Vec<Register> = matched
            .subtrees
            .iter()
            .map(|subtree| self.emit(subtree, None, choices, out))
            .collect();

        let out_register = Register::fresh();
        out.extend((matched.instructions)(child_registers, out_register));
        out_register
    }

    fn cover(&self, node: &IrTree, root_context: RootContext<'_>) -> Vec<Instruction> {
        let mut choices = HashMap::new();
        self.best_pattern(node, Some(root_context), &mut choices);

        let mut instructions = Vec::new();
        self.emit(node, Some(root_context), &choices, &mut instructions);
        instructions
    }
}

impl Covering for DynamicCoveringBuilder<'_> {
    fn cover_unconditional(&self, node: &IrTree) -> Vec<Instruction> {
        self.cover(node, RootContext::Unconditional)
    }

    fn cover_conditional(
        &self,
        node: &IrTree,
        target_label: &str,
        invert: bool,
    ) -> Vec<Instruction> {
        self.cover(
            node,
            RootContext::Conditional {
                target_label,
                invert,
            },
        )
    }
}
