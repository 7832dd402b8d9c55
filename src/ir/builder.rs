//! Mutable accumulator for control-flow graphs.
//!
//! The builder is the only legal way to construct a
//! [`ControlFlowGraph`]; every higher layer composes graphs exclusively
//! through its primitives, which guarantees the single-entry and
//! single-outgoing-edge-kind invariants by construction. A builder is
//! exclusively owned by the lowering routine building one graph and is
//! consumed conceptually by [`ControlFlowGraphBuilder::build`].
//!
//! Contract violations — setting a second entry root, conditionally merging
//! from a half-linked root — are bugs in this crate, not in the input
//! program, and panic immediately.

use crate::ir::cfg::{CfgLinkType, ControlFlowGraph};
use crate::ir::node::{IrTree, NodeRef};
use std::collections::{HashMap, HashSet};

/// Panic message prefix for builder contract violations.
pub const INCORRECT_CFG: &str = "IncorrectControlFlowGraphError";

#[derive(Default)]
pub struct ControlFlowGraphBuilder {
    entry_tree_root: Option<IrTree>,
    unconditional_links: HashMap<NodeRef, IrTree>,
    conditional_true_links: HashMap<NodeRef, IrTree>,
    conditional_false_links: HashMap<NodeRef, IrTree>,
    tree_roots: Vec<IrTree>,
    known_roots: HashSet<NodeRef>,
}

impl ControlFlowGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with a given entry root.
    pub fn with_entry(entry_tree_root: IrTree) -> Self {
        let mut builder = Self::new();
        builder.add_tree_root(&entry_tree_root);
        builder.entry_tree_root = Some(entry_tree_root);
        builder
    }

    fn add_tree_root(&mut self, root: &IrTree) {
        if self.known_roots.insert(NodeRef::from(root)) {
            self.tree_roots.push(root.clone());
        }
    }

    fn set_entry_tree_root(&mut self, root: IrTree) {
        if self.entry_tree_root.is_some() {
            panic!("{INCORRECT_CFG}: tried to set a second entry tree root");
        }
        self.add_tree_root(&root);
        self.entry_tree_root = Some(root);
    }

    /// Record an edge `from → to`.
    ///
    /// With `from == None`, `to` becomes the entry root instead (and it is
    /// an error if an entry already exists). `add_destination` controls
    /// whether `to` is added to the root set — merges pass `false` because
    /// the destination arrives via [`Self::add_all_from`].
    pub fn add_link(
        &mut self,
        from: Option<(IrTree, CfgLinkType)>,
        to: IrTree,
        add_destination: bool,
    ) {
        if add_destination {
            self.add_tree_root(&to);
        }

        if let Some((source, link_type)) = from {
            self.add_tree_root(&source);
            let links = match link_type {
                CfgLinkType::Unconditional => &mut self.unconditional_links,
                CfgLinkType::ConditionalTrue => &mut self.conditional_true_links,
                CfgLinkType::ConditionalFalse => &mut self.conditional_false_links,
            };
            links.insert(NodeRef::from(&source), to);
        } else if self.entry_tree_root.is_none() && add_destination {
            self.set_entry_tree_root(to);
        }
    }

    /// Link every current final root to `to` via `link_type`.
    ///
    /// Half-linked conditional roots are completed through their missing
    /// side; asking for a specific conditional side on a root whose open
    /// side differs is a contract violation.
    pub fn add_links_from_all_final_roots(&mut self, link_type: CfgLinkType, to: IrTree) {
        for (root, open_link_type) in self.build().final_tree_roots() {
            if open_link_type == CfgLinkType::Unconditional {
                self.add_link(Some((root, link_type)), to.clone(), true);
            } else if link_type == CfgLinkType::Unconditional || link_type == open_link_type {
                self.add_link(Some((root, open_link_type)), to.clone(), true);
            } else {
                panic!(
                    "{INCORRECT_CFG}: root is open on {:?}, cannot link it via {:?}",
                    open_link_type, link_type
                );
            }
        }

        if self.entry_tree_root.is_none() {
            self.set_entry_tree_root(to);
        }
    }

    /// Merge another graph's roots and edges, without linking anything.
    /// The current entry is kept; with `set_entry_point`, an absent entry is
    /// taken over from `cfg`.
    pub fn add_all_from(&mut self, cfg: &ControlFlowGraph, set_entry_point: bool) {
        if self.entry_tree_root.is_none() && set_entry_point {
            self.entry_tree_root = cfg.entry_tree_root.clone();
        }
        for root in &cfg.tree_roots {
            self.add_tree_root(root);
        }
        self.unconditional_links
            .extend(cfg.unconditional_links.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.conditional_true_links
            .extend(cfg.conditional_true_links.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.conditional_false_links
            .extend(cfg.conditional_false_links.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    /// Link every current final root unconditionally to `cfg`'s entry and
    /// absorb `cfg`.
    pub fn merge_unconditionally(&mut self, cfg: &ControlFlowGraph) -> &mut Self {
        if let Some(entry) = cfg.entry_tree_root.clone() {
            for (root, link_type) in self.build().final_tree_roots() {
                self.add_link(Some((root, link_type)), entry.clone(), false);
            }
            if self.entry_tree_root.is_none() {
                self.entry_tree_root = Some(entry);
            }
        }
        self.add_all_from(cfg, true);
        self
    }

    /// Link every current final root via true/false edges to the two
    /// graphs' entries and absorb both. All current final roots must be
    /// open unconditionally (they are the condition trees).
    pub fn merge_conditionally(
        &mut self,
        cfg_true: &ControlFlowGraph,
        cfg_false: &ControlFlowGraph,
    ) -> &mut Self {
        let true_entry = cfg_true
            .entry_tree_root
            .clone()
            .unwrap_or_else(|| panic!("{INCORRECT_CFG}: conditional merge with empty true graph"));
        let false_entry = cfg_false
            .entry_tree_root
            .clone()
            .unwrap_or_else(|| panic!("{INCORRECT_CFG}: conditional merge with empty false graph"));

        for (root, link_type) in self.build().final_tree_roots() {
            if link_type != CfgLinkType::Unconditional {
                panic!("{INCORRECT_CFG}: conditional merge from a half-linked conditional root");
            }
            self.add_link(
                Some((root.clone(), CfgLinkType::ConditionalTrue)),
                true_entry.clone(),
                false,
            );
            self.add_link(
                Some((root, CfgLinkType::ConditionalFalse)),
                false_entry.clone(),
                false,
            );
        }
        self.add_all_from(cfg_true, true);
        self.add_all_from(cfg_false, true);
        self
    }

    /// Append a single tree as an unconditional continuation.
    pub fn add_single_tree(&mut self, node: IrTree) -> &mut Self {
        let mut single = ControlFlowGraphBuilder::new();
        single.add_link(None, node, true);
        let single = single.build();
        self.merge_unconditionally(&single)
    }

    pub fn is_empty(&self) -> bool {
        self.entry_tree_root.is_none()
    }

    /// Snapshot the current state as an immutable graph.
    pub fn build(&self) -> ControlFlowGraph {
        ControlFlowGraph {
            tree_roots: self.tree_roots.clone(),
            entry_tree_root: self.entry_tree_root.clone(),
            unconditional_links: self.unconditional_links.clone(),
            conditional_true_links: self.conditional_true_links.clone(),
            conditional_false_links: self.conditional_false_links.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::node::IrNode;
    use std::rc::Rc;

    #[test]
    fn test_empty_graph() {
        let cfg = ControlFlowGraphBuilder::new().build();
        assert!(cfg.is_empty());
        assert!(cfg.tree_roots.is_empty());
        assert!(cfg.final_tree_roots().is_empty());
    }

    #[test]
    fn test_first_destination_becomes_entry() {
        let node = IrNode::constant(1);
        let mut builder = ControlFlowGraphBuilder::new();
        builder.add_link(None, node.clone(), true);
        let cfg = builder.build();

        assert!(cfg.entry_tree_root.as_ref().is_some_and(|e| Rc::ptr_eq(e, &node)));
        assert_eq!(cfg.tree_roots.len(), 1);
    }

    #[test]
    #[should_panic(expected = "second entry tree root")]
    fn test_second_entry_panics() {
        let mut builder = ControlFlowGraphBuilder::new();
        builder.add_link(None, IrNode::constant(1), true);
        builder.add_link(None, IrNode::constant(2), true);
    }

    #[test]
    fn test_structurally_equal_roots_stay_distinct() {
        let first = IrNode::constant(7);
        let second = IrNode::constant(7);
        let mut builder = ControlFlowGraphBuilder::new();
        builder.add_link(None, first.clone(), true);
        builder.add_link(
            Some((first, CfgLinkType::Unconditional)),
            second,
            true,
        );
        let cfg = builder.build();

        assert_eq!(cfg.tree_roots.len(), 2);
        assert_eq!(cfg.unconditional_links.len(), 1);
        assert_eq!(cfg.final_tree_roots().len(), 1);
    }

    #[test]
    fn test_merge_unconditionally_links_all_final_roots() {
        let condition = IrNode::constant(0);
        let when_true = IrNode::constant(1);
        let when_false = IrNode::constant(2);
        let join = IrNode::no_op();

        let mut builder = ControlFlowGraphBuilder::new();
        builder.add_link(None, condition.clone(), true);
        builder.add_link(
            Some((condition.clone(), CfgLinkType::ConditionalTrue)),
            when_true.clone(),
            true,
        );
        builder.add_link(
            Some((condition, CfgLinkType::ConditionalFalse)),
            when_false.clone(),
            true,
        );

        let mut join_builder = ControlFlowGraphBuilder::new();
        join_builder.add_link(None, join.clone(), true);
        builder.merge_unconditionally(&join_builder.build());

        let cfg = builder.build();
        assert!(
            cfg.unconditional_links
                .get(&NodeRef::from(&when_true))
                .is_some_and(|t| Rc::ptr_eq(t, &join))
        );
        assert!(
            cfg.unconditional_links
                .get(&NodeRef::from(&when_false))
                .is_some_and(|t| Rc::ptr_eq(t, &join))
        );
        let finals = cfg.final_tree_roots();
        assert_eq!(finals.len(), 1);
        assert!(Rc::ptr_eq(&finals[0].0, &join));
    }

    #[test]
    fn test_merge_conditionally() {
        let condition = IrNode::constant(0);
        let when_true = IrNode::constant(1);
        let when_false = IrNode::constant(2);

        let mut builder = ControlFlowGraphBuilder::new();
        builder.add_link(None, condition.clone(), true);

        let mut true_builder = ControlFlowGraphBuilder::new();
        true_builder.add_link(None, when_true.clone(), true);
        let mut false_builder = ControlFlowGraphBuilder::new();
        false_builder.add_link(None, when_false.clone(), true);

        builder.merge_conditionally(&true_builder.build(), &false_builder.build());
        let cfg = builder.build();

        let key = NodeRef::from(&condition);
        assert!(cfg.conditional_true_links.get(&key).is_some_and(|t| Rc::ptr_eq(t, &when_true)));
        assert!(cfg.conditional_false_links.get(&key).is_some_and(|t| Rc::ptr_eq(t, &when_false)));
        // No root carries both an unconditional and a conditional edge.
        for root in &cfg.tree_roots {
            let r = NodeRef::from(root);
            let unconditional = cfg.unconditional_links.contains_key(&r);
            let conditional = cfg.conditional_true_links.contains_key(&r)
                || cfg.conditional_false_links.contains_key(&r);
            assert!(!(unconditional && conditional));
        }
    }

    #[test]
    fn test_half_conditional_final_root_reports_missing_side() {
        let condition = IrNode::constant(0);
        let target = IrNode::constant(1);
        let mut builder = ControlFlowGraphBuilder::new();
        builder.add_link(None, condition.clone(), true);
        builder.add_link(
            Some((condition.clone(), CfgLinkType::ConditionalTrue)),
            target,
            true,
        );

        let finals = builder.build().final_tree_roots();
        let entry = finals
            .iter()
            .find(|(root, _)| Rc::ptr_eq(root, &condition))
            .expect("condition should still be final");
        assert_eq!(entry.1, CfgLinkType::ConditionalFalse);
    }

    #[test]
    fn test_every_linked_root_is_member() {
        let a = IrNode::constant(1);
        let b = IrNode::constant(2);
        let mut builder = ControlFlowGraphBuilder::new();
        builder.add_link(Some((a, CfgLinkType::Unconditional)), b, true);
        let cfg = builder.build();

        for key in cfg
            .unconditional_links
            .keys()
            .chain(cfg.conditional_true_links.keys())
            .chain(cfg.conditional_false_links.keys())
        {
            assert!(cfg.tree_roots.iter().any(|root| key.refers_to(root)));
        }
    }
}
