//! Color assignment over the coalesced graph.
//!
//! Pops the simplification stack produced by
//! [`RegisterGraph::process`] and assigns each node a color no
//! interfering neighbour holds. Copy-graph neighbours steer the choice so
//! that moves which survived coalescing still tend to become self-moves.
//! Pre-colored nodes keep exactly their hardware register — recoloring one
//! is a contract violation. A node with no available color is spilled,
//! never an error.

use crate::dataflow::LivenessGraphs;
use crate::ir::Register;
use crate::regalloc::AllocationResult;
use crate::regalloc::graph::RegisterGraph;
use std::collections::{HashMap, HashSet};

pub struct GraphColoring;

impl GraphColoring {
    pub fn color(
        graphs: &LivenessGraphs,
        self_colored: &[Register],
        accessible_registers: &[Register],
    ) -> AllocationResult {
        let stack = RegisterGraph::process(graphs, self_colored, accessible_registers);
        let self_colored_set: HashSet<Register> = self_colored.iter().copied().collect();

        // Rebuild the interference and copy graphs over coalesced nodes.
        let mut node_of: HashMap<Register, usize> = HashMap::new();
        for (index, node) in stack.iter().enumerate() {
            for register in &node.registers {
                node_of.insert(*register, index);
            }
        }
        let mut interference: Vec<HashSet<usize>> = vec![HashSet::new(); stack.len()];
        let mut copies: Vec<HashSet<usize>> = vec![HashSet::new(); stack.len()];
        for (register, neighbours) in &graphs.interference_graph {
            for neighbour in neighbours {
                let (a, b) = (node_of[register], node_of[neighbour]);
                if a != b {
                    interference[a].insert(b);
                    interference[b].insert(a);
                }
            }
        }
        for (register, neighbours) in &graphs.copy_graph {
            for neighbour in neighbours {
                let (Some(&a), Some(&b)) = (node_of.get(register), node_of.get(neighbour)) else {
                    continue;
                };
                if a != b && !interference[a].contains(&b) {
                    copies[a].insert(b);
                    copies[b].insert(a);
                }
            }
        }

        let mut coloring = Coloring {
            interference: &interference,
            accessible: accessible_registers.to_vec(),
            colors: vec![None; stack.len()],
            taken: vec![HashSet::new(); stack.len()],
            spilled: Vec::new(),
        };

        // Pre-color nodes pinned to hardware registers, available or not —
        // RBP and RSP keep themselves too.
        for (index, node) in stack.iter().enumerate() {
            if let Some(color) = node.self_color(&self_colored_set) {
                coloring.assign(index, color);
            }
        }

        // Color in reverse removal order.
        for index in (0..stack.len()).rev() {
            if coloring.colors[index].is_some() {
                continue;
            }
            if coloring.available(index).is_empty() {
                coloring.spilled.push(index);
                continue;
            }

            let choice = coloring
                .best_fit_colored_copy_neighbours(index, &copies)
                .or_else(|| coloring.best_fit_uncolored_copy_neighbours(index, &copies))
                .unwrap_or_else(|| coloring.available(index)[0]);
            coloring.assign(index, choice);
        }

        let mut allocated_registers = HashMap::new();
        for (index, node) in stack.iter().enumerate() {
            if let Some(color) = coloring.colors[index] {
                for register in &node.registers {
                    allocated_registers.insert(*register, color);
                }
            }
        }
        let mut spilled_registers: Vec<Register> = coloring
            .spilled
            .iter()
            .flat_map(|&index| stack[index].registers.iter().copied())
            .collect();
        spilled_registers.sort();

        AllocationResult {
            allocated_registers,
            spilled_registers,
        }
    }
}

struct Coloring<'a> {
    interference: &'a [HashSet<usize>],
    accessible: Vec<Register>,
    colors: Vec<Option<Register>>,
    /// Colors already held by interfering neighbours.
    taken: Vec<HashSet<Register>>,
    spilled: Vec<usize>,
}

impl Coloring<'_> {
    fn assign(&mut self, node: usize, color: Register) {
        if let Some(previous) = self.colors[node] {
            assert_eq!(
                previous, color,
                "pre-colored register node must keep its color"
            );
            return;
        }
        assert!(
            !self.taken[node].contains(&color) || !self.accessible.contains(&color),
            "assigned a color already held by an interfering neighbour"
        );
        self.colors[node] = Some(color);
        for &neighbour in &self.interference[node] {
            self.taken[neighbour].insert(color);
        }
    }

    /// Accessible colors not held by any colored interfering neighbour, in
    /// the configured register order.
    fn available(&self, node: usize) -> Vec<Register> {
        self.accessible
            .iter()
            .filter(|color| !self.taken[node].contains(color))
            .copied()
            .collect()
    }

    /// The most common color among already-colored copy neighbours that is
    /// still available here.
    fn best_fit_colored_copy_neighbours(
        &self,
        node: usize,
        copies: &[HashSet<usize>],
    ) -> Option<Register> {
        let available = self.available(node);
        let mut counts: HashMap<Register, usize> = HashMap::new();
        for &neighbour in &copies[node] {
            if let Some(color) = self.colors[neighbour]
                && available.contains(&color)
            {
                *counts.entry(color).or_insert(0) += 1;
            }
        }
        most_common(counts)
    }

    /// A color shared with the available sets of the most uncolored copy
    /// neighbours, so a later assignment can still match it.
    fn best_fit_uncolored_copy_neighbours(
        &self,
        node: usize,
        copies: &[HashSet<usize>],
    ) -> Option<Register> {
        let available: HashSet<Register> = self.available(node).into_iter().collect();
        let mut counts: HashMap<Register, usize> = HashMap::new();
        for &neighbour in &copies[node] {
            if self.colors[neighbour].is_some() || self.spilled.contains(&neighbour) {
                continue;
            }
            for color in self.available(neighbour) {
                if available.contains(&color) {
                    *counts.entry(color).or_insert(0) += 1;
                }
            }
        }
        most_common(counts)
    }
}

/// Deterministic argmax: highest count, ties broken by register order.
fn most_common(counts: HashMap<Register, usize>) -> Option<Register> {
    counts
        .into_iter()
        .max_by_key(|&(register, count)| (count, std::cmp::Reverse(register)))
        .map(|(register, _)| register)
}
