//! Intermediate form: expression/effect trees, registers, constants, and
//! the control-flow graph connecting tree roots.

pub mod builder;
pub mod cfg;
pub mod constant;
pub mod node;
pub mod register;

pub use builder::ControlFlowGraphBuilder;
pub use cfg::{CfgLinkType, ControlFlowGraph};
pub use constant::{Constant, ConstantPlaceholder};
pub use node::{IrNode, IrTree, NodeRef, UNIT_VALUE};
pub use register::Register;
