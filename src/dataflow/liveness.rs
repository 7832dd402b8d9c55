//! Liveness analysis.
//!
//! Backward dataflow to fixpoint:
//!
//! - live-out(i) = ∪ live-in(successors(i))
//! - live-in(i) = (live-out(i) \ defs(i)) ∪ uses(i)
//!
//! From the per-instruction live sets two symmetric graphs are built over
//! every register appearing in the program:
//!
//! - **interference**: an edge between two registers whenever both are live
//!   immediately after an instruction defining at least one of them — except
//!   that a register-to-register move never creates an edge between its own
//!   source and destination, which is what leaves coalescing possible;
//! - **copy**: an edge between the source and destination of every move
//!   whose operands do not already interfere.

use crate::asm::{Asmable, Instruction};
use crate::dataflow::DataFlowAnalyzer;
use crate::ir::Register;
use std::collections::{HashMap, HashSet};

#[derive(Clone, Debug, Default)]
pub struct LivenessGraphs {
    pub interference_graph: HashMap<Register, HashSet<Register>>,
    pub copy_graph: HashMap<Register, HashSet<Register>>,
}

struct LivenessDataFlowAnalyzer;

impl DataFlowAnalyzer for LivenessDataFlowAnalyzer {
    type Lattice = HashSet<Register>;

    fn backward(&self) -> bool {
        true
    }

    fn entry_point_value(&self) -> HashSet<Register> {
        HashSet::new()
    }

    fn lattice_max_element(&self) -> HashSet<Register> {
        HashSet::new()
    }

    fn meet(&self, elements: &[HashSet<Register>]) -> HashSet<Register> {
        let mut union = HashSet::new();
        for element in elements {
            union.extend(element.iter().copied());
        }
        union
    }

    fn transfer(
        &self,
        instruction: &Instruction,
        live_out: &HashSet<Register>,
    ) -> HashSet<Register> {
        let kill: HashSet<Register> = instruction.regs_defined().into_iter().collect();
        let mut live_in: HashSet<Register> = instruction.regs_used().into_iter().collect();
        live_in.extend(live_out.iter().filter(|register| !kill.contains(register)));
        live_in
    }
}

pub struct Liveness;

impl Liveness {
    /// Compute the interference and copy graphs of a linear program.
    pub fn compute(linear_program: &[Asmable]) -> LivenessGraphs {
        let instructions: Vec<&Instruction> = linear_program
            .iter()
            .filter_map(Asmable::as_instruction)
            .collect();

        // Every register mentioned anywhere gets a vertex, even if its
        // live range turns out empty.
        let mut graphs = LivenessGraphs::default();
        for instruction in &instructions {
            for register in instruction
                .regs_defined()
                .into_iter()
                .chain(instruction.regs_used())
            {
                graphs.interference_graph.entry(register).or_default();
                graphs.copy_graph.entry(register).or_default();
            }
        }

        let dataflow = LivenessDataFlowAnalyzer.analyze(linear_program);

        for (index, instruction) in instructions.iter().enumerate() {
            // Registers live immediately after this instruction, including
            // the ones it just defined.
            let mut live_after: HashSet<Register> = dataflow.out_values[index].clone();
            live_after.extend(instruction.regs_defined());

            for defined in instruction.regs_defined() {
                for &live in &live_after {
                    if defined == live {
                        continue;
                    }
                    if let Instruction::MoveRR { dst, src } = instruction
                        && *dst == defined
                        && *src == live
                    {
                        continue;
                    }
                    graphs
                        .interference_graph
                        .entry(defined)
                        .or_default()
                        .insert(live);
                    graphs
                        .interference_graph
                        .entry(live)
                        .or_default()
                        .insert(defined);
                }
            }
        }

        for instruction in &instructions {
            if let Instruction::MoveRR { dst, src } = instruction
                && dst != src
                && !graphs.interference_graph[dst].contains(src)
            {
                graphs.copy_graph.entry(*dst).or_default().insert(*src);
                graphs.copy_graph.entry(*src).or_default().insert(*dst);
            }
        }

        graphs
    }

    /// Restriction of a graph to a subset of its vertices.
    pub fn induced_subgraph(
        graph: &HashMap<Register, HashSet<Register>>,
        subset: &HashSet<Register>,
    ) -> HashMap<Register, HashSet<Register>> {
        graph
            .iter()
            .filter(|(vertex, _)| subset.contains(vertex))
            .map(|(vertex, neighbours)| {
                (
                    *vertex,
                    neighbours
                        .iter()
                        .filter(|neighbour| subset.contains(neighbour))
                        .copied()
                        .collect(),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::instr::JumpCondition;

    fn instr(instruction: Instruction) -> Asmable {
        Asmable::Instruction(instruction)
    }

    fn interferes(graphs: &LivenessGraphs, a: Register, b: Register) -> bool {
        graphs
            .interference_graph
            .get(&a)
            .is_some_and(|set| set.contains(&b))
            && graphs
                .interference_graph
                .get(&b)
                .is_some_and(|set| set.contains(&a))
    }

    #[test]
    fn test_dead_def_has_no_interference() {
        let a = Register::fresh();
        let b = Register::fresh();
        // `a` is defined and never used afterwards.
        let program = vec![
            instr(Instruction::MoveRI {
                dst: a,
                constant: 1.into(),
            }),
            instr(Instruction::MoveRI {
                dst: b,
                constant: 2.into(),
            }),
            instr(Instruction::Ret { used: vec![b] }),
        ];

        let graphs = Liveness::compute(&program);
        assert!(graphs.interference_graph[&a].is_empty());
    }

    #[test]
    fn test_simultaneously_live_registers_interfere() {
        let a = Register::fresh();
        let b = Register::fresh();
        let program = vec![
            instr(Instruction::MoveRI {
                dst: a,
                constant: 1.into(),
            }),
            instr(Instruction::MoveRI {
                dst: b,
                constant: 2.into(),
            }),
            instr(Instruction::AddRR { reg0: a, reg1: b }),
            instr(Instruction::Ret { used: vec![a] }),
        ];

        let graphs = Liveness::compute(&program);
        assert!(interferes(&graphs, a, b));
    }

    #[test]
    fn test_move_does_not_make_its_operands_interfere() {
        let a = Register::fresh();
        let b = Register::fresh();
        let program = vec![
            instr(Instruction::MoveRI {
                dst: a,
                constant: 1.into(),
            }),
            instr(Instruction::MoveRR { dst: b, src: a }),
            instr(Instruction::Ret { used: vec![b] }),
        ];

        let graphs = Liveness::compute(&program);
        assert!(!interferes(&graphs, a, b));
        assert!(graphs.copy_graph[&a].contains(&b));
        assert!(graphs.copy_graph[&b].contains(&a));
    }

    #[test]
    fn test_copy_edge_suppressed_when_operands_interfere() {
        let a = Register::fresh();
        let b = Register::fresh();
        // b ← a, but a is used again afterwards while b is live.
        let program = vec![
            instr(Instruction::MoveRI {
                dst: a,
                constant: 1.into(),
            }),
            instr(Instruction::MoveRR { dst: b, src: a }),
            instr(Instruction::AddRR { reg0: b, reg1: a }),
            instr(Instruction::Ret { used: vec![a, b] }),
        ];

        let graphs = Liveness::compute(&program);
        assert!(interferes(&graphs, a, b));
        assert!(!graphs.copy_graph[&a].contains(&b));
    }

    #[test]
    fn test_liveness_follows_jumps() {
        let a = Register::fresh();
        let b = Register::fresh();
        // `a` is only used on the jump target, so it must stay live across
        // the branch that defines `b`.
        let program = vec![
            instr(Instruction::MoveRI {
                dst: a,
                constant: 1.into(),
            }),
            instr(Instruction::JmpCc {
                cond: JumpCondition::Zero,
                target: "_use".into(),
            }),
            instr(Instruction::MoveRI {
                dst: b,
                constant: 2.into(),
            }),
            Asmable::Label("_use".into()),
            instr(Instruction::AddRR { reg0: b, reg1: a }),
            instr(Instruction::Ret { used: vec![b] }),
        ];

        let graphs = Liveness::compute(&program);
        assert!(interferes(&graphs, a, b));
    }
}
