//! Access to global variables.
//!
//! Globals live in a static block at the `globals` label, one word each,
//! ordered by name so the layout is stable. Reads of constant globals fold
//! to their literal values and need no storage at all.

use crate::common::analysis::{VariableOwner, VariableProperties};
use crate::common::ast::{NamedNode, VariableKind};
use crate::ir::node::{IrNode, IrTree};
use crate::lower::function::{MEMORY_UNIT_SIZE, VariableAccessGenerator};
use std::collections::HashMap;

pub const GLOBALS_MEMORY_LABEL: &str = "globals";

pub struct GlobalVariableAccessGenerator {
    offsets: HashMap<NamedNode, i64>,
}

impl GlobalVariableAccessGenerator {
    pub fn new(variable_properties: &HashMap<NamedNode, VariableProperties>) -> Self {
        let mut globals: Vec<NamedNode> = variable_properties
            .iter()
            .filter(|(node, properties)| {
                properties.owner == VariableOwner::Global
                    && !matches!(node, NamedNode::Variable(variable)
                        if variable.kind == VariableKind::Constant)
            })
            .map(|(node, _)| node.clone())
            .collect();
        globals.sort_by(|a, b| a.name().cmp(b.name()));

        GlobalVariableAccessGenerator {
            offsets: globals
                .into_iter()
                .enumerate()
                .map(|(index, node)| (node, index as i64 * MEMORY_UNIT_SIZE as i64))
                .collect(),
        }
    }

    fn memory_address(&self, named_node: &NamedNode) -> IrTree {
        IrNode::add(
            IrNode::memory_label(GLOBALS_MEMORY_LABEL),
            IrNode::constant(self.offsets[named_node]),
        )
    }

    /// Size of the globals block in bytes.
    pub fn region_size(&self) -> u64 {
        self.offsets.len() as u64 * MEMORY_UNIT_SIZE
    }
}

impl VariableAccessGenerator for GlobalVariableAccessGenerator {
    fn gen_read(&self, named_node: &NamedNode, _is_direct: bool) -> IrTree {
        if self.offsets.contains_key(named_node) {
            IrNode::memory_read(self.memory_address(named_node))
        } else {
            // A constant global: fold to its initializer.
            let NamedNode::Variable(variable) = named_node else {
                panic!("global parameter cannot be constant");
            };
            let value = variable
                .value
                .as_ref()
                .and_then(|value| value.literal_value())
                .expect("constant global must have a literal initializer");
            IrNode::constant(value)
        }
    }

    fn gen_write(&self, named_node: &NamedNode, value: IrTree, _is_direct: bool) -> IrTree {
        IrNode::memory_write(self.memory_address(named_node), value)
    }
}
