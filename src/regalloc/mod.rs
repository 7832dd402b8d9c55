//! Register allocation.
//!
//! [`ColoringAllocation`] maps registers to hardware registers by
//! conservative graph coloring with coalescing; registers it cannot color
//! are *spilled*. [`Allocation`] drives the full
//! allocate → spill → reallocate cycle: it reserves registers for spill
//! traffic, rewrites spilled accesses into loads and stores against a
//! dedicated region of the activation frame, and repeats until a pass
//! produces no instruction needing more reserved registers than are set
//! aside. Allocation as a whole never fails — spilling is a normal control
//! path, not an error path.

pub mod coloring;
pub mod graph;

pub use coloring::GraphColoring;
pub use graph::RegisterGraph;

use crate::asm::addressing::{Addressing, MemoryAddress};
use crate::asm::{Asmable, Instruction};
use crate::dataflow::{Liveness, LivenessGraphs};
use crate::ir::Register;
use std::collections::{HashMap, HashSet};

/// Bytes per spill slot / machine word.
pub const MEMORY_UNIT_SIZE: u64 = 8;

/// All hardware registers, in allocation preference order.
pub const HARDWARE_REGISTERS: [Register; 16] = [
    Register::R15,
    Register::R14,
    Register::R13,
    Register::R12,
    Register::R11,
    Register::R10,
    Register::RBP,
    Register::RSP,
    Register::R9,
    Register::R8,
    Register::RDI,
    Register::RSI,
    Register::RDX,
    Register::RCX,
    Register::RBX,
    Register::RAX,
];

/// Registers the allocator may hand out (everything but RBP/RSP).
pub const AVAILABLE_REGISTERS: [Register; 14] = [
    Register::R15,
    Register::R14,
    Register::R13,
    Register::R12,
    Register::R11,
    Register::R10,
    Register::R9,
    Register::R8,
    Register::RDI,
    Register::RSI,
    Register::RDX,
    Register::RCX,
    Register::RBX,
    Register::RAX,
];

/// Registers that may be withdrawn from allocation to carry spill traffic,
/// in reservation order.
pub const POTENTIAL_SPILL_HANDLING_REGISTERS: [Register; 7] = [
    Register::R11,
    Register::R10,
    Register::R15,
    Register::R14,
    Register::R13,
    Register::R12,
    Register::RBX,
];

/// Output of one coloring pass.
#[derive(Clone, Debug)]
pub struct AllocationResult {
    /// Total on every register that received a color.
    pub allocated_registers: HashMap<Register, Register>,
    /// Registers left uncolored; their accesses go through memory.
    pub spilled_registers: Vec<Register>,
}

/// A single coloring pass; spills are reported, not resolved.
pub trait PartialAllocation {
    fn allocate_registers(
        &self,
        graphs: &LivenessGraphs,
        self_colored_registers: &[Register],
        accessible_registers: &[Register],
    ) -> AllocationResult;
}

/// Graph coloring with coalescing as the partial allocator.
pub struct ColoringAllocation;

impl PartialAllocation for ColoringAllocation {
    fn allocate_registers(
        &self,
        graphs: &LivenessGraphs,
        self_colored_registers: &[Register],
        accessible_registers: &[Register],
    ) -> AllocationResult {
        GraphColoring::color(graphs, self_colored_registers, accessible_registers)
    }
}

/// Final allocation output: the register mapping, the rewritten program,
/// and the spill-region size the frame must reserve.
pub struct AllocationOutcome {
    pub allocated_registers: HashMap<Register, Register>,
    pub code: Vec<Asmable>,
    pub spilled_offset: u64,
}

/// The spill-handling driver around a [`PartialAllocation`].
pub struct Allocation<'a> {
    allocator: &'a dyn PartialAllocation,
}

struct SpilledInstruction {
    instruction: Instruction,
    spilled_used: Vec<Register>,
    spilled_defined: Vec<Register>,
}

impl SpilledInstruction {
    /// Distinct spilled registers this instruction touches, uses first.
    fn spilled_registers(&self) -> Vec<Register> {
        let mut registers = self.spilled_used.clone();
        for register in &self.spilled_defined {
            if !registers.contains(register) {
                registers.push(*register);
            }
        }
        registers
    }
}

impl<'a> Allocation<'a> {
    pub fn new(allocator: &'a dyn PartialAllocation) -> Self {
        Allocation { allocator }
    }

    /// Allocate registers for `linear_program`, rewriting spilled accesses
    /// until the program is fully covered.
    ///
    /// Each round reserves one more of `potential_spill_handling_registers`
    /// and retries with the rest; the process terminates because withdrawn
    /// registers stop competing for colors while the per-instruction demand
    /// for reserved registers is bounded by the instruction set.
    pub fn allocate_registers_with_spills_handling(
        &self,
        linear_program: &[Asmable],
        graphs: &LivenessGraphs,
        hardware_registers: &[Register],
        available_registers: &[Register],
        potential_spill_handling_registers: &[Register],
        spilled_registers_region_offset: u64,
    ) -> AllocationOutcome {
        for reserved_count in 0..=potential_spill_handling_registers.len() {
            let spill_handling = &potential_spill_handling_registers[..reserved_count];
            let actually_available: Vec<Register> = available_registers
                .iter()
                .filter(|register| !spill_handling.contains(register))
                .copied()
                .collect();

            let result =
                self.allocator
                    .allocate_registers(graphs, hardware_registers, &actually_available);
            let spilled: HashSet<Register> = result.spilled_registers.iter().copied().collect();

            let spilled_instructions: HashMap<usize, SpilledInstruction> = linear_program
                .iter()
                .enumerate()
                .filter_map(|(index, asmable)| {
                    let instruction = asmable.as_instruction()?;
                    let spilled_instruction = to_spilled_instruction(instruction, &spilled);
                    (!spilled_instruction.spilled_registers().is_empty())
                        .then_some((index, spilled_instruction))
                })
                .collect();
            let max_instruction_spill = spilled_instructions
                .values()
                .map(|spilled| spilled.spilled_registers().len())
                .max()
                .unwrap_or(0);

            if max_instruction_spill > reserved_count {
                continue;
            }

            let slot_coloring = self.color_spilled_registers(&spilled, graphs);
            let slot_count = slot_coloring.values().max().copied().unwrap_or(0);

            let mut allocated_registers = result.allocated_registers;
            for register in spill_handling {
                allocated_registers.insert(*register, *register);
            }

            let code = transform_program(
                linear_program,
                &spilled_instructions,
                &allocated_registers,
                spill_handling,
                &slot_coloring,
                spilled_registers_region_offset,
            );

            return AllocationOutcome {
                allocated_registers,
                code,
                spilled_offset: slot_count * MEMORY_UNIT_SIZE,
            };
        }

        panic!("instruction touches more registers than can be reserved for spill handling");
    }

    /// Color the spilled registers against each other so non-overlapping
    /// ones share a spill slot. Slots are numbered from 1.
    fn color_spilled_registers(
        &self,
        spilled: &HashSet<Register>,
        graphs: &LivenessGraphs,
    ) -> HashMap<Register, u64> {
        if spilled.is_empty() {
            return HashMap::new();
        }

        let mut spilled_sorted: Vec<Register> = spilled.iter().copied().collect();
        spilled_sorted.sort();
        let slot_colors: Vec<Register> = spilled_sorted.iter().map(|_| Register::fresh()).collect();
        let induced = LivenessGraphs {
            interference_graph: Liveness::induced_subgraph(&graphs.interference_graph, spilled),
            copy_graph: Liveness::induced_subgraph(&graphs.copy_graph, spilled),
        };
        let coloring = self
            .allocator
            .allocate_registers(&induced, &slot_colors, &slot_colors);

        let used_colors: Vec<Register> = slot_colors
            .iter()
            .filter(|color| coloring.allocated_registers.values().any(|c| c == *color))
            .copied()
            .collect();
        coloring
            .allocated_registers
            .iter()
            .map(|(register, color)| {
                let slot = used_colors.iter().position(|c| c == color).unwrap() as u64 + 1;
                (*register, slot)
            })
            .collect()
    }
}

fn to_spilled_instruction(
    instruction: &Instruction,
    spilled: &HashSet<Register>,
) -> SpilledInstruction {
    let mut spilled_used: Vec<Register> = Vec::new();
    for register in instruction.regs_used() {
        if spilled.contains(&register) && !spilled_used.contains(&register) {
            spilled_used.push(register);
        }
    }
    let mut spilled_defined: Vec<Register> = Vec::new();
    for register in instruction.regs_defined() {
        if spilled.contains(&register) && !spilled_defined.contains(&register) {
            spilled_defined.push(register);
        }
    }
    SpilledInstruction {
        instruction: instruction.clone(),
        spilled_used,
        spilled_defined,
    }
}

/// Rewrite the program: loads before and stores after every spilled
/// instruction, with the spilled registers substituted by reserved ones
/// inside the instruction itself. Moves made redundant by allocation are
/// dropped.
fn transform_program(
    linear_program: &[Asmable],
    spilled_instructions: &HashMap<usize, SpilledInstruction>,
    allocated_registers: &HashMap<Register, Register>,
    reserved_registers: &[Register],
    slot_coloring: &HashMap<Register, u64>,
    region_offset: u64,
) -> Vec<Asmable> {
    let spill_address = |register: &Register| -> Addressing {
        let displacement = region_offset + slot_coloring[register] * MEMORY_UNIT_SIZE;
        Addressing::base_displaced(Register::RBP, MemoryAddress::Const(-(displacement as i64)))
    };

    let mut code: Vec<Asmable> = Vec::new();
    for (index, asmable) in linear_program.iter().enumerate() {
        let Some(spilled) = spilled_instructions.get(&index) else {
            code.push(asmable.clone());
            continue;
        };

        // Assign this instruction's spilled registers to reserved ones.
        let substitution: HashMap<Register, Register> = spilled
            .spilled_registers()
            .into_iter()
            .zip(reserved_registers.iter().copied())
            .collect();

        for register in &spilled.spilled_used {
            code.push(Asmable::Instruction(Instruction::MoveRM {
                dst: substitution[register],
                src: spill_address(register),
            }));
        }
        code.push(Asmable::Instruction(spilled.instruction.map_registers(
            &|register| substitution.get(&register).copied().unwrap_or(register),
        )));
        for register in &spilled.spilled_defined {
            code.push(Asmable::Instruction(Instruction::MoveMR {
                dst: spill_address(register),
                src: substitution[register],
            }));
        }
    }

    code.into_iter()
        .filter(|asmable| match asmable {
            Asmable::Instruction(Instruction::MoveRR { dst, src }) => {
                allocated_registers.get(dst) != allocated_registers.get(src)
                    || allocated_registers.get(dst).is_none()
            }
            _ => true,
        })
        .collect()
}
