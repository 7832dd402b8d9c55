//! x86-64 addressing modes.

use crate::ir::register::Register;
use std::collections::HashMap;
use std::fmt;

#[derive(Clone, Debug, PartialEq)]
pub enum MemoryAddress {
    Const(i64),
    Label(String),
}

impl fmt::Display for MemoryAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryAddress::Const(value) => write!(f, "{}", value),
            MemoryAddress::Label(label) => write!(f, "{}", label),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Addressing {
    /// `[displacement]`
    Displacement { displacement: MemoryAddress },
    /// `[base + displacement]` or `[base]`
    Base {
        base: Register,
        displacement: MemoryAddress,
    },
    /// `[base + index * scale + displacement]`, scale one of 1/2/4/8
    BaseAndIndex {
        base: Register,
        index: Register,
        scale: u8,
        displacement: MemoryAddress,
    },
    /// `[index * scale + displacement]`
    IndexAndDisplacement {
        index: Register,
        scale: u8,
        displacement: MemoryAddress,
    },
}

impl Addressing {
    pub fn base(base: Register) -> Addressing {
        Addressing::Base {
            base,
            displacement: MemoryAddress::Const(0),
        }
    }

    pub fn base_displaced(base: Register, displacement: MemoryAddress) -> Addressing {
        Addressing::Base { base, displacement }
    }

    pub fn label(label: impl Into<String>) -> Addressing {
        Addressing::Displacement {
            displacement: MemoryAddress::Label(label.into()),
        }
    }

    /// Registers the address computation reads.
    pub fn regs_used(&self) -> Vec<Register> {
        match self {
            Addressing::Displacement { .. } => vec![],
            Addressing::Base { base, .. } => vec![*base],
            Addressing::BaseAndIndex { base, index, .. } => vec![*base, *index],
            Addressing::IndexAndDisplacement { index, .. } => vec![*index],
        }
    }

    pub fn map_registers(&self, f: &dyn Fn(Register) -> Register) -> Addressing {
        match self {
            Addressing::Displacement { displacement } => Addressing::Displacement {
                displacement: displacement.clone(),
            },
            Addressing::Base { base, displacement } => Addressing::Base {
                base: f(*base),
                displacement: displacement.clone(),
            },
            Addressing::BaseAndIndex {
                base,
                index,
                scale,
                displacement,
            } => Addressing::BaseAndIndex {
                base: f(*base),
                index: f(*index),
                scale: *scale,
                displacement: displacement.clone(),
            },
            Addressing::IndexAndDisplacement {
                index,
                scale,
                displacement,
            } => Addressing::IndexAndDisplacement {
                index: f(*index),
                scale: *scale,
                displacement: displacement.clone(),
            },
        }
    }

    pub fn to_asm(&self, registers: &HashMap<Register, Register>) -> String {
        let resolve = |register: &Register| registers[register].to_asm();
        match self {
            Addressing::Displacement { displacement } => format!("[{}]", displacement),
            Addressing::Base { base, displacement } => {
                if *displacement == MemoryAddress::Const(0) {
                    format!("[{}]", resolve(base))
                } else if let MemoryAddress::Const(value) = displacement
                    && *value < 0
                {
                    format!("[{} - {}]", resolve(base), -value)
                } else {
                    format!("[{} + {}]", resolve(base), displacement)
                }
            }
            Addressing::BaseAndIndex {
                base,
                index,
                scale,
                displacement,
            } => {
                let index_part = if *scale == 1 {
                    resolve(index).to_string()
                } else {
                    format!("({} * {})", resolve(index), scale)
                };
                if *displacement == MemoryAddress::Const(0) {
                    format!("[{} + {}]", resolve(base), index_part)
                } else {
                    format!("[{} + {} + {}]", resolve(base), index_part, displacement)
                }
            }
            Addressing::IndexAndDisplacement {
                index,
                scale,
                displacement,
            } => {
                if *displacement == MemoryAddress::Const(0) {
                    format!("[({} * {})]", resolve(index), scale)
                } else {
                    format!("[({} * {}) + {}]", resolve(index), scale, displacement)
                }
            }
        }
    }
}
