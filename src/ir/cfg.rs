//! The control-flow graph over intermediate-form tree roots.
//!
//! Edges are stored in adjacency maps keyed by node identity, never as
//! owning parent→child pointers, so loops back to earlier roots are
//! representable. A root has at most one outgoing edge kind: either one
//! unconditional edge, or a true/false pair. Roots with a missing outgoing
//! edge are *final*.

use crate::ir::node::{IrTree, NodeRef};
use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CfgLinkType {
    Unconditional,
    ConditionalTrue,
    ConditionalFalse,
}

/// An immutable control-flow graph, built once through
/// [`crate::ir::builder::ControlFlowGraphBuilder`].
#[derive(Clone, Debug, Default)]
pub struct ControlFlowGraph {
    /// All tree roots, in insertion order.
    pub tree_roots: Vec<IrTree>,
    /// The unique entry root; `None` only for an empty graph.
    pub entry_tree_root: Option<IrTree>,
    pub unconditional_links: HashMap<NodeRef, IrTree>,
    pub conditional_true_links: HashMap<NodeRef, IrTree>,
    pub conditional_false_links: HashMap<NodeRef, IrTree>,
}

impl ControlFlowGraph {
    /// Roots missing an outgoing edge, each paired with the link type that
    /// is still open: a half-linked conditional reports the missing side,
    /// anything else reports an open unconditional edge.
    pub fn final_tree_roots(&self) -> Vec<(IrTree, CfgLinkType)> {
        self.tree_roots
            .iter()
            .filter(|root| {
                let key = NodeRef::from(*root);
                !self.unconditional_links.contains_key(&key)
                    && (!self.conditional_true_links.contains_key(&key)
                        || !self.conditional_false_links.contains_key(&key))
            })
            .map(|root| {
                let key = NodeRef::from(root);
                let link_type = if self.conditional_true_links.contains_key(&key) {
                    CfgLinkType::ConditionalFalse
                } else if self.conditional_false_links.contains_key(&key) {
                    CfgLinkType::ConditionalTrue
                } else {
                    CfgLinkType::Unconditional
                };
                (root.clone(), link_type)
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entry_tree_root.is_none()
    }

    /// Successor of `root` along `link_type`, if linked.
    pub fn link(&self, root: &IrTree, link_type: CfgLinkType) -> Option<&IrTree> {
        let key = NodeRef::from(root);
        match link_type {
            CfgLinkType::Unconditional => self.unconditional_links.get(&key),
            CfgLinkType::ConditionalTrue => self.conditional_true_links.get(&key),
            CfgLinkType::ConditionalFalse => self.conditional_false_links.get(&key),
        }
    }
}
