//! The linear program representation: instructions and labels.

pub mod addressing;
pub mod instr;

pub use addressing::{Addressing, MemoryAddress};
pub use instr::{Instruction, InstructionKind, JumpCondition, SetCondition};

use crate::ir::register::Register;
use std::collections::HashMap;

/// One element of the linear program: a target instruction or a named
/// program point.
#[derive(Clone, Debug, PartialEq)]
pub enum Asmable {
    Instruction(Instruction),
    Label(String),
}

impl Asmable {
    pub fn as_instruction(&self) -> Option<&Instruction> {
        match self {
            Asmable::Instruction(instruction) => Some(instruction),
            Asmable::Label(_) => None,
        }
    }

    pub fn is_label(&self) -> bool {
        matches!(self, Asmable::Label(_))
    }

    /// NASM rendering given the final virtual→hardware register mapping.
    pub fn to_asm(&self, registers: &HashMap<Register, Register>) -> String {
        match self {
            Asmable::Instruction(instruction) => instruction.to_asm(registers),
            Asmable::Label(label) => format!("{}:", label),
        }
    }
}

impl From<Instruction> for Asmable {
    fn from(instruction: Instruction) -> Self {
        Asmable::Instruction(instruction)
    }
}
