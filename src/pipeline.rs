//! The per-program compilation driver.
//!
//! # Pipeline stages
//!
//! ```text
//! AST + semantic facts (Program, ProgramAnalysis)
//!     │
//!     ▼ lower
//! per-function ControlFlowGraph (+ prologue/epilogue,
//!     or init/resume/finalize for generators)
//!     │
//!     ▼ linearize (covering against the pattern table)
//! Vec<Asmable>
//!     │
//!     ▼ liveness
//! interference/copy graphs
//!     │
//!     ▼ allocation (+ iterated spilling)
//! Vec<Asmable> over physical registers
//! ```
//!
//! Each function is an independent, deterministic unit of work; the driver
//! processes them sequentially.

use crate::asm::Asmable;
use crate::codegen::instruction_set::instruction_set;
use crate::codegen::{Covering, DynamicCoveringBuilder, Pattern, linearize};
use crate::common::analysis::ProgramAnalysis;
use crate::common::ast::Program;
use crate::common::diagnostics::Diagnostics;
use crate::dataflow::Liveness;
use crate::ir::{ControlFlowGraph, Register};
use crate::lower::function::FunctionDetailsGenerator;
use crate::lower::globals::GlobalVariableAccessGenerator;
use crate::lower::{
    LoweringContext, attach_prologue_and_epilogue, create_details_generators,
    create_graphs_for_functions,
};
use crate::lower::array::DefaultArrayMemoryManagement;
use crate::regalloc::{
    AVAILABLE_REGISTERS, Allocation, ColoringAllocation, HARDWARE_REGISTERS,
    POTENTIAL_SPILL_HANDLING_REGISTERS,
};
use std::collections::HashMap;
use std::rc::Rc;

/// Target description: the physical register lists the allocator works
/// with and the instruction pattern table driving selection.
pub struct TargetConfig {
    pub hardware_registers: Vec<Register>,
    pub available_registers: Vec<Register>,
    pub spill_handling_registers: Vec<Register>,
    pub instruction_set: Vec<Box<dyn Pattern>>,
}

impl Default for TargetConfig {
    fn default() -> Self {
        TargetConfig {
            hardware_registers: HARDWARE_REGISTERS.to_vec(),
            available_registers: AVAILABLE_REGISTERS.to_vec(),
            spill_handling_registers: POTENTIAL_SPILL_HANDLING_REGISTERS.to_vec(),
            instruction_set: instruction_set(),
        }
    }
}

/// One finished function: its code label, the final instruction stream and
/// the mapping applied to print it.
pub struct CompiledFunction {
    pub identifier: String,
    pub code: Vec<Asmable>,
    pub allocated_registers: HashMap<Register, Register>,
}

impl CompiledFunction {
    /// Render the function as NASM text.
    pub fn to_asm(&self) -> String {
        let mut output = format!("{}:\n", self.identifier);
        for asmable in &self.code {
            match asmable {
                Asmable::Label(_) => output.push_str(&asmable.to_asm(&self.allocated_registers)),
                Asmable::Instruction(_) => {
                    output.push_str("    ");
                    output.push_str(&asmable.to_asm(&self.allocated_registers));
                }
            }
            output.push('\n');
        }
        output
    }
}

/// Compile every local function of the program down to instructions over
/// physical registers. Diagnostics are collected, not thrown; the caller
/// decides whether errors abort the build.
pub fn compile_program(
    program: &Program,
    analysis: &ProgramAnalysis,
    diagnostics: &Diagnostics,
    target: &TargetConfig,
) -> Vec<CompiledFunction> {
    let (function_details, generator_details) = create_details_generators(program, analysis);
    let globals_access = GlobalVariableAccessGenerator::new(&analysis.variable_properties);
    let array_memory = DefaultArrayMemoryManagement;

    let ctx = LoweringContext {
        analysis,
        function_details: &function_details,
        generator_details: &generator_details,
        array_memory: &array_memory,
        globals_access: &globals_access,
        diagnostics,
    };

    let body_graphs = create_graphs_for_functions(&ctx, program);
    let covering = DynamicCoveringBuilder::new(&target.instruction_set);

    let mut compiled = Vec::new();
    for (function, body) in body_graphs {
        if function.is_generator {
            let details = &generator_details[&function];
            let entries: [(Rc<dyn FunctionDetailsGenerator>, ControlFlowGraph); 3] = [
                (details.init_details(), details.gen_init()),
                (details.resume_details(), details.gen_resume(&body)),
                (details.finalize_details(), details.gen_finalize()),
            ];
            for (entry_details, cfg) in entries {
                compiled.push(compile_function(&cfg, entry_details.as_ref(), &covering, target));
            }
        } else {
            let details = &function_details[&function];
            let cfg = attach_prologue_and_epilogue(
                &body,
                &details.gen_prologue(),
                &details.gen_epilogue(),
            );
            compiled.push(compile_function(&cfg, details.as_ref(), &covering, target));
        }
    }
    compiled
}

/// Linearize, analyze and allocate one function's CFG.
fn compile_function(
    cfg: &ControlFlowGraph,
    details: &dyn FunctionDetailsGenerator,
    covering: &dyn Covering,
    target: &TargetConfig,
) -> CompiledFunction {
    let linear_program = linearize(cfg, covering);
    let graphs = Liveness::compute(&linear_program);

    let outcome = Allocation::new(&ColoringAllocation).allocate_registers_with_spills_handling(
        &linear_program,
        &graphs,
        &target.hardware_registers,
        &target.available_registers,
        &target.spill_handling_registers,
        details.spilled_registers_region_offset(),
    );

    // The prologue's frame reservation references this placeholder.
    details
        .spilled_registers_region_size()
        .settle(outcome.spilled_offset as i64);

    CompiledFunction {
        identifier: details.identifier().to_string(),
        code: outcome.code,
        allocated_registers: outcome.allocated_registers,
    }
}
