//! Dataflow analysis over linear programs.
//!
//! [`DataFlowAnalyzer`] is a generic monotone-fixpoint engine: an analysis
//! supplies its direction, lattice and transfer function, and the engine
//! resolves labels to positions, forms the successor graph (sequential
//! order plus explicit jump targets) and iterates to a fixed point.
//! Termination follows from the lattice being finite and the transfer
//! functions monotone.

pub mod liveness;

pub use liveness::{Liveness, LivenessGraphs};

use crate::asm::instr::InstructionKind;
use crate::asm::{Asmable, Instruction};
use std::collections::HashMap;

/// Per-instruction analysis results, indexed by the instruction's position
/// among instructions (labels excluded).
pub struct DataFlowResult<L> {
    pub in_values: Vec<L>,
    pub out_values: Vec<L>,
}

pub trait DataFlowAnalyzer {
    type Lattice: Clone + PartialEq;

    fn backward(&self) -> bool;

    /// Value at the analysis entry points.
    fn entry_point_value(&self) -> Self::Lattice;

    /// Initial value everywhere else.
    fn lattice_max_element(&self) -> Self::Lattice;

    fn meet(&self, elements: &[Self::Lattice]) -> Self::Lattice;

    fn transfer(&self, instruction: &Instruction, in_value: &Self::Lattice) -> Self::Lattice;

    fn analyze(&self, linear_program: &[Asmable]) -> DataFlowResult<Self::Lattice> {
        let instructions: Vec<&Instruction> = linear_program
            .iter()
            .filter_map(Asmable::as_instruction)
            .collect();
        let count = instructions.len();

        let predecessors = direction_adjusted_predecessors(linear_program, self.backward());

        let entry_points: Vec<bool> = if self.backward() {
            instructions
                .iter()
                .map(|instruction| instruction.kind() == InstructionKind::Terminal)
                .collect()
        } else {
            (0..count).map(|index| index == 0).collect()
        };

        let mut in_states: Vec<Self::Lattice> = (0..count)
            .map(|index| {
                if entry_points[index] {
                    self.entry_point_value()
                } else {
                    self.lattice_max_element()
                }
            })
            .collect();
        let mut out_states: Vec<Self::Lattice> = vec![self.lattice_max_element(); count];

        loop {
            let mut changed = false;

            for (index, instruction) in instructions.iter().enumerate() {
                out_states[index] = self.transfer(instruction, &in_states[index]);
            }

            for index in 0..count {
                if predecessors[index].is_empty() {
                    continue;
                }
                let incoming: Vec<Self::Lattice> = predecessors[index]
                    .iter()
                    .map(|&predecessor| out_states[predecessor].clone())
                    .collect();
                let new_in = self.meet(&incoming);
                if new_in != in_states[index] {
                    changed = true;
                    in_states[index] = new_in;
                }
            }

            if !changed {
                break;
            }
        }

        if self.backward() {
            // For a backward analysis the transfer runs against successors,
            // so the roles of the two vectors swap.
            DataFlowResult {
                in_values: out_states,
                out_values: in_states,
            }
        } else {
            DataFlowResult {
                in_values: in_states,
                out_values: out_states,
            }
        }
    }
}

/// Predecessor lists per instruction, already flipped for a backward
/// analysis (i.e. successors become predecessors).
fn direction_adjusted_predecessors(linear_program: &[Asmable], backward: bool) -> Vec<Vec<usize>> {
    // Map each label to the instruction that follows it.
    let mut label_to_instruction: HashMap<&str, usize> = HashMap::new();
    {
        let mut next_instruction = 0usize;
        let mut pending_labels: Vec<&str> = Vec::new();
        for asmable in linear_program {
            match asmable {
                Asmable::Label(label) => pending_labels.push(label),
                Asmable::Instruction(_) => {
                    for label in pending_labels.drain(..) {
                        label_to_instruction.insert(label, next_instruction);
                    }
                    next_instruction += 1;
                }
            }
        }
    }

    let instructions: Vec<&Instruction> = linear_program
        .iter()
        .filter_map(Asmable::as_instruction)
        .collect();
    let count = instructions.len();
    let mut predecessors: Vec<Vec<usize>> = vec![Vec::new(); count];

    let mut add_edge = |from: usize, to: usize| {
        if backward {
            predecessors[from].push(to);
        } else {
            predecessors[to].push(from);
        }
    };

    for (index, instruction) in instructions.iter().enumerate() {
        match instruction.kind() {
            InstructionKind::ConditionalJump => {
                let target = label_to_instruction[instruction.target_label().unwrap()];
                add_edge(index, target);
                if index + 1 < count {
                    add_edge(index, index + 1);
                }
            }
            InstructionKind::UnconditionalJump => {
                let target = label_to_instruction[instruction.target_label().unwrap()];
                add_edge(index, target);
            }
            InstructionKind::Terminal => {}
            InstructionKind::InPlace => {
                if index + 1 < count {
                    add_edge(index, index + 1);
                }
            }
        }
    }

    predecessors
}
