//! Flattening a CFG into a jump/label stream.
//!
//! A depth-first walk over the edge structure covers each tree root and
//! decides where jumps and labels are actually needed: a node visited
//! immediately after its only predecessor falls through, a revisited node
//! gets a backward jump to its existing label, and a conditional whose
//! false side is about to fall through carries only the true-side jump
//! (with the condition polarity folded in). Generated labels that end up
//! unreferenced are dropped; labels pinned by [`IrNode::LabeledNode`] are
//! always kept, since outside code refers to them.

use crate::asm::{Asmable, Instruction};
use crate::codegen::Covering;
use crate::ir::cfg::{CfgLinkType, ControlFlowGraph};
use crate::ir::node::{IrNode, IrTree, NodeRef};
use std::collections::{HashMap, HashSet};

struct Linearizer<'a> {
    cfg: &'a ControlFlowGraph,
    covering: &'a dyn Covering,
    instructions: Vec<Asmable>,
    labels: HashMap<NodeRef, String>,
    used_labels: HashSet<String>,
}

/// Strip a label wrapper before covering; edges stay keyed on the wrapper.
fn unwrap_labeled(node: &IrTree) -> &IrTree {
    match &**node {
        IrNode::LabeledNode { node: inner, .. } => inner,
        _ => node,
    }
}

impl Linearizer<'_> {
    fn assign_label(&mut self, node: &IrTree) -> String {
        let label = match &**node {
            IrNode::LabeledNode { label, .. } => {
                // Pinned labels are referenced from outside the stream.
                self.used_labels.insert(label.clone());
                label.clone()
            }
            _ => format!("_{}", self.labels.len()),
        };
        self.labels.insert(NodeRef::from(node), label.clone());
        label
    }

    fn add_conditional(&mut self, node: &IrTree, when_true: bool, target_label: &str) {
        let covered = self
            .covering
            .cover_conditional(unwrap_labeled(node), target_label, !when_true);
        self.instructions
            .extend(covered.into_iter().map(Asmable::Instruction));
        self.used_labels.insert(target_label.to_string());
    }

    fn add_jump(&mut self, target_label: &str, next_label: &str) {
        if target_label != next_label {
            self.instructions.push(Asmable::Instruction(Instruction::Jmp {
                target: target_label.to_string(),
            }));
            self.used_labels.insert(target_label.to_string());
        }
    }

    /// Emit `node` and everything reachable from it that is still
    /// unvisited. `next_label` names the node that will follow this
    /// subtree in emission order, so jumps to it can be elided.
    fn visit(&mut self, node: &IrTree, next_label: &str) {
        let label = match self.labels.get(&NodeRef::from(node)) {
            Some(label) => label.clone(),
            None => self.assign_label(node),
        };
        self.instructions.push(Asmable::Label(label));

        let key = NodeRef::from(node);
        let unconditional = self.cfg.unconditional_links.get(&key).cloned();
        let conditional_true = self.cfg.conditional_true_links.get(&key).cloned();
        let conditional_false = self.cfg.conditional_false_links.get(&key).cloned();

        if let Some(target) = unconditional {
            let covered = self.covering.cover_unconditional(unwrap_labeled(node));
            self.instructions
                .extend(covered.into_iter().map(Asmable::Instruction));

            if let Some(target_label) = self.labels.get(&NodeRef::from(&target)).cloned() {
                self.add_jump(&target_label, next_label);
            } else {
                self.visit(&target, next_label);
            }
        } else if let (Some(target_true), Some(target_false)) =
            (conditional_true.clone(), conditional_false.clone())
        {
            let label_true = self.labels.get(&NodeRef::from(&target_true)).cloned();
            let label_false = self.labels.get(&NodeRef::from(&target_false)).cloned();

            match (label_true, label_false) {
                (Some(label_true), Some(label_false)) => {
                    self.add_conditional(node, true, &label_true);
                    self.add_jump(&label_false, next_label);
                }
                (Some(label_true), None) => {
                    self.add_conditional(node, true, &label_true);
                    self.visit(&target_false, next_label);
                }
                (None, Some(label_false)) => {
                    self.add_conditional(node, false, &label_false);
                    self.visit(&target_true, next_label);
                }
                (None, None) => {
                    // Defer the false side to fall through after the true
                    // side finishes.
                    let label = self.assign_label(&target_false);
                    self.add_conditional(node, false, &label);
                    self.visit(&target_true, &label);
                    self.visit(&target_false, next_label);
                }
            }
        } else if conditional_true.is_some() || conditional_false.is_some() {
            panic!("tree root has only one side of a conditional link");
        } else {
            // A final root; its covering ends in ret or a computed jump.
            let covered = self.covering.cover_unconditional(unwrap_labeled(node));
            self.instructions
                .extend(covered.into_iter().map(Asmable::Instruction));
        }
    }
}

/// Convert a CFG into an ordered instruction/label stream.
pub fn linearize(cfg: &ControlFlowGraph, covering: &dyn Covering) -> Vec<Asmable> {
    let Some(entry) = &cfg.entry_tree_root else {
        return vec![];
    };

    let mut linearizer = Linearizer {
        cfg,
        covering,
        instructions: Vec::new(),
        labels: HashMap::new(),
        used_labels: HashSet::new(),
    };
    linearizer.visit(entry, "");

    let used = linearizer.used_labels;
    linearizer
        .instructions
        .into_iter()
        .filter(|asmable| match asmable {
            Asmable::Label(label) => used.contains(label),
            Asmable::Instruction(_) => true,
        })
        .collect()
}
