//! The coalescing worklist over the interference graph.
//!
//! Implements the simplify / coalesce / freeze / potential-spill phases of
//! Appel-style graph coloring ("Modern Compiler Implementation", ch. 11).
//! Nodes start as single registers and grow by conservative coalescing
//! (Briggs between two virtual nodes, George against a pre-colored node);
//! removed nodes are pushed on a stack that the coloring phase later pops.
//! Hash-based sets keep the per-step operations O(1); worklists are kept in
//! ordered sets so runs are deterministic.

use crate::dataflow::LivenessGraphs;
use crate::ir::Register;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// A (possibly merged) node as it was removed from the graph.
#[derive(Clone, Debug)]
pub struct CoalescedNode {
    /// All registers this node stands for.
    pub registers: BTreeSet<Register>,
    /// Whether one of them is a pre-colored hardware register.
    pub contains_self_colored: bool,
}

impl CoalescedNode {
    /// The hardware register this node is pinned to, if any.
    pub fn self_color(&self, self_colored: &HashSet<Register>) -> Option<Register> {
        self.registers
            .iter()
            .copied()
            .find(|register| self_colored.contains(register))
    }
}

pub struct RegisterGraph {
    k: usize,
    /// Pre-colored registers whose color is *not* available, so merging
    /// them into anything would force an unusable color.
    forbidden_colors: HashSet<Register>,

    registers: Vec<BTreeSet<Register>>,
    contains_self_colored: Vec<bool>,
    alive: HashSet<usize>,
    interference: Vec<HashSet<usize>>,
    copy: Vec<HashSet<usize>>,

    simplify_candidates: BTreeSet<usize>,
    freeze_candidates: BTreeSet<usize>,
    spill_candidates: BTreeSet<usize>,
    coalesce_candidates: VecDeque<(usize, usize)>,
}

impl RegisterGraph {
    /// Run the whole simplification phase and return the removal stack
    /// (bottom first). Every register of the liveness graphs ends up in
    /// exactly one returned node.
    pub fn process(
        graphs: &LivenessGraphs,
        self_colored: &[Register],
        available_colors: &[Register],
    ) -> Vec<CoalescedNode> {
        let mut graph = RegisterGraph::new(graphs, self_colored, available_colors);
        let mut stack = Vec::new();

        while !graph.alive.is_empty() {
            if let Some(&node) = graph.simplify_candidates.iter().next() {
                stack.push(graph.remove(node));
            } else if !graph.coalesce_candidates.is_empty() {
                graph.coalesce();
            } else if let Some(node) = graph.min_degree(&graph.freeze_candidates) {
                stack.push(graph.remove(node));
            } else {
                let node = graph
                    .min_degree(&graph.spill_candidates)
                    .expect("alive node must be in some worklist");
                stack.push(graph.remove(node));
            }
        }

        stack
    }

    fn new(
        graphs: &LivenessGraphs,
        self_colored: &[Register],
        available_colors: &[Register],
    ) -> Self {
        let self_colored: HashSet<Register> = self_colored.iter().copied().collect();
        let available: HashSet<Register> = available_colors.iter().copied().collect();
        let forbidden_colors: HashSet<Register> = self_colored
            .iter()
            .filter(|register| !available.contains(register))
            .copied()
            .collect();

        // Deterministic node numbering.
        let mut all_registers: Vec<Register> =
            graphs.interference_graph.keys().copied().collect();
        all_registers.sort();
        let index_of: HashMap<Register, usize> = all_registers
            .iter()
            .enumerate()
            .map(|(index, register)| (*register, index))
            .collect();

        let count = all_registers.len();
        let mut interference: Vec<HashSet<usize>> = vec![HashSet::new(); count];
        let mut copy: Vec<HashSet<usize>> = vec![HashSet::new(); count];
        for (register, neighbours) in &graphs.interference_graph {
            for neighbour in neighbours {
                interference[index_of[register]].insert(index_of[neighbour]);
            }
        }
        for (register, neighbours) in &graphs.copy_graph {
            let Some(&register_index) = index_of.get(register) else {
                continue;
            };
            for neighbour in neighbours {
                if let Some(&neighbour_index) = index_of.get(neighbour) {
                    copy[register_index].insert(neighbour_index);
                }
            }
        }
        // Copy edges between interfering registers cannot be coalesced.
        for node in 0..count {
            let interfering: Vec<usize> =
                copy[node].intersection(&interference[node]).copied().collect();
            for other in interfering {
                copy[node].remove(&other);
                copy[other].remove(&node);
            }
        }

        let mut graph = RegisterGraph {
            k: available_colors.len(),
            forbidden_colors,
            contains_self_colored: all_registers
                .iter()
                .map(|register| self_colored.contains(register))
                .collect(),
            registers: all_registers
                .iter()
                .map(|register| BTreeSet::from([*register]))
                .collect(),
            alive: (0..count).collect(),
            interference,
            copy,
            simplify_candidates: BTreeSet::new(),
            freeze_candidates: BTreeSet::new(),
            spill_candidates: BTreeSet::new(),
            coalesce_candidates: VecDeque::new(),
        };

        for node in 0..count {
            graph.classify(node);
        }
        let initially_moves: HashSet<usize> = (0..count)
            .filter(|&node| !graph.copy[node].is_empty())
            .collect();
        graph.enable_moves(&initially_moves);

        graph
    }

    fn degree(&self, node: usize) -> usize {
        self.interference[node].len()
    }

    fn min_degree(&self, candidates: &BTreeSet<usize>) -> Option<usize> {
        candidates
            .iter()
            .copied()
            .min_by_key(|&node| (self.degree(node), node))
    }

    fn worklist_of(&mut self, node: usize) -> &mut BTreeSet<usize> {
        if self.degree(node) >= self.k {
            &mut self.spill_candidates
        } else if self.copy[node].is_empty() {
            &mut self.simplify_candidates
        } else {
            &mut self.freeze_candidates
        }
    }

    fn classify(&mut self, node: usize) {
        self.worklist_of(node).insert(node);
    }

    fn declassify(&mut self, node: usize) {
        self.simplify_candidates.remove(&node);
        self.freeze_candidates.remove(&node);
        self.spill_candidates.remove(&node);
    }

    fn reclassify(&mut self, node: usize) {
        self.declassify(node);
        self.classify(node);
    }

    fn enable_moves(&mut self, nodes: &HashSet<usize>) {
        for &node in nodes {
            for &other in &self.copy[node] {
                self.coalesce_candidates.push_back((node, other));
            }
        }
    }

    /// Detach `node` from both graphs and return its snapshot.
    fn remove(&mut self, node: usize) -> CoalescedNode {
        let neighbours: Vec<usize> = self.interference[node].iter().copied().collect();
        for &neighbour in &neighbours {
            self.interference[neighbour].remove(&node);
        }
        self.interference[node].clear();
        let copy_neighbours: Vec<usize> = self.copy[node].iter().copied().collect();
        for neighbour in copy_neighbours {
            self.copy[neighbour].remove(&node);
        }
        self.copy[node].clear();
        self.declassify(node);
        self.alive.remove(&node);

        for &neighbour in &neighbours {
            self.reclassify(neighbour);
        }
        // Dropping to K-1 may have made new coalesces viable.
        let mut unblocked: HashSet<usize> = HashSet::new();
        for &neighbour in &neighbours {
            if self.degree(neighbour) == self.k.saturating_sub(1) {
                unblocked.insert(neighbour);
                unblocked.extend(self.interference[neighbour].iter().copied());
            }
        }
        self.enable_moves(&unblocked);

        CoalescedNode {
            registers: std::mem::take(&mut self.registers[node]),
            contains_self_colored: self.contains_self_colored[node],
        }
    }

    fn add_interference_edge(&mut self, a: usize, b: usize) {
        if a != b {
            self.interference[a].insert(b);
            self.interference[b].insert(a);
        }
    }

    fn add_copy_edge(&mut self, a: usize, b: usize) {
        if a != b && !self.interference[a].contains(&b) {
            self.copy[a].insert(b);
            self.copy[b].insert(a);
        }
    }

    fn remove_copy_edge(&mut self, a: usize, b: usize) {
        self.copy[a].remove(&b);
        self.copy[b].remove(&a);
    }

    /// George: merging `other` into the pre-colored `pinned` is safe when
    /// every neighbour of `other` is insignificant, pre-colored, or already
    /// a neighbour of `pinned`.
    fn george_condition(&self, pinned: usize, other: usize) -> bool {
        self.interference[other].iter().all(|&neighbour| {
            self.degree(neighbour) < self.k
                || self.contains_self_colored[neighbour]
                || self.interference[pinned].contains(&neighbour)
        })
    }

    /// Briggs: the merged node must have fewer than K significant
    /// neighbours. Shared neighbours of exactly degree K lose a degree
    /// through the merge and stop being significant.
    fn briggs_condition(&self, first: usize, second: usize) -> bool {
        let common_of_degree_k = self.interference[first]
            .intersection(&self.interference[second])
            .filter(|&&node| self.degree(node) == self.k)
            .count();
        let all_of_degree_ge_k = self.interference[first]
            .union(&self.interference[second])
            .filter(|&&node| self.degree(node) >= self.k)
            .count();
        all_of_degree_ge_k - common_of_degree_k < self.k
    }

    fn coalesce(&mut self) {
        let Some((a, b)) = self.coalesce_candidates.pop_front() else {
            return;
        };
        // Orient a possibly pre-colored node first.
        let (first, second) = if self.alive.contains(&b) && self.contains_self_colored[b] {
            (b, a)
        } else {
            (a, b)
        };

        if !self.alive.contains(&first) || !self.alive.contains(&second) {
            return;
        }
        if self.interference[first].contains(&second)
            || self.contains_self_colored[second]
            || self.registers[first]
                .iter()
                .any(|register| self.forbidden_colors.contains(register))
        {
            // This move can never be coalesced.
            self.remove_copy_edge(first, second);
            return;
        }

        let able = if self.contains_self_colored[first] {
            // Pre-colored nodes can have huge degree; George keeps the
            // check linear in the other node's degree.
            self.george_condition(first, second)
        } else {
            self.briggs_condition(first, second)
        };
        if !able {
            return;
        }

        // Merge `second` into `first`.
        self.remove_copy_edge(first, second);
        let merged_registers = std::mem::take(&mut self.registers[second]);
        self.registers[first].extend(merged_registers);
        let interference_of_second: Vec<usize> =
            self.interference[second].iter().copied().collect();
        for neighbour in interference_of_second {
            self.add_interference_edge(neighbour, first);
        }
        let copies_of_second: Vec<usize> = self.copy[second].iter().copied().collect();
        for neighbour in copies_of_second {
            self.add_copy_edge(neighbour, first);
            self.coalesce_candidates.push_back((neighbour, first));
        }
        self.remove(second);
        self.reclassify(first);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graphs_from(
        interference: &[(Register, Register)],
        copies: &[(Register, Register)],
        registers: &[Register],
    ) -> LivenessGraphs {
        let mut graphs = LivenessGraphs::default();
        for register in registers {
            graphs.interference_graph.entry(*register).or_default();
            graphs.copy_graph.entry(*register).or_default();
        }
        for (a, b) in interference {
            graphs.interference_graph.entry(*a).or_default().insert(*b);
            graphs.interference_graph.entry(*b).or_default().insert(*a);
        }
        for (a, b) in copies {
            graphs.copy_graph.entry(*a).or_default().insert(*b);
            graphs.copy_graph.entry(*b).or_default().insert(*a);
        }
        graphs
    }

    #[test]
    fn test_every_register_lands_in_exactly_one_node() {
        let regs: Vec<Register> = (0..4).map(|_| Register::fresh()).collect();
        let graphs = graphs_from(
            &[(regs[0], regs[1]), (regs[1], regs[2])],
            &[(regs[2], regs[3])],
            &regs,
        );
        let colors = [Register::RAX, Register::RBX];
        let stack = RegisterGraph::process(&graphs, &[], &colors);

        let mut seen = BTreeSet::new();
        for node in &stack {
            for register in &node.registers {
                assert!(seen.insert(*register), "register in two nodes");
            }
        }
        for register in &regs {
            assert!(seen.contains(register));
        }
    }

    #[test]
    fn test_copy_related_registers_coalesce() {
        let a = Register::fresh();
        let b = Register::fresh();
        let other = Register::fresh();
        // a and b are move-related and do not interfere; they should end
        // up in one node.
        let graphs = graphs_from(&[(a, other)], &[(a, b)], &[a, b, other]);
        let colors = [Register::RAX, Register::RBX];
        let stack = RegisterGraph::process(&graphs, &[], &colors);

        let combined = stack
            .iter()
            .find(|node| node.registers.contains(&a))
            .unwrap();
        assert!(
            combined.registers.contains(&b),
            "move-related registers should coalesce"
        );
    }

    #[test]
    fn test_interfering_move_is_not_coalesced() {
        let a = Register::fresh();
        let b = Register::fresh();
        let graphs = graphs_from(&[(a, b)], &[(a, b)], &[a, b]);
        let colors = [Register::RAX, Register::RBX];
        let stack = RegisterGraph::process(&graphs, &[], &colors);

        assert_eq!(stack.len(), 2);
    }
}
