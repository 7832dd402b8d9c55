//! Lowering: from the AST and its semantic facts to per-function CFGs.
//!
//! # Modules
//!
//! - `expr`: expression lowering (evaluation order, short-circuiting,
//!   calls, array reference counting)
//! - `stmt`: statement lowering (loops, escapes, foreach over generators,
//!   scope cleanup)
//! - `function`: calling convention, prologue/epilogue, variable access
//! - `generator`: the init/resume/finalize state machine of generators
//! - `array`: reference-counted array memory management
//! - `globals`: access to global variables
//! - `details`: construction of the per-function details generators

pub mod array;
pub mod details;
pub mod expr;
pub mod function;
pub mod generator;
pub mod globals;
pub mod stmt;

#[cfg(test)]
mod tests;

pub use details::create_details_generators;
pub use expr::{create_graph_for_expression, create_graph_for_expression_with_access};
pub use stmt::create_graphs_for_functions;

use crate::common::analysis::{ProgramAnalysis, VariableOwner};
use crate::common::ast::{Function, NamedNode, Variable};
use crate::common::diagnostics::Diagnostics;
use crate::common::reference::Ref;
use crate::ir::builder::ControlFlowGraphBuilder;
use crate::ir::cfg::{CfgLinkType, ControlFlowGraph};
use crate::ir::node::{IrTree, NodeRef};
use crate::lower::array::ArrayMemoryManagement;
use crate::lower::function::{FunctionDetailsGenerator, VariableAccessGenerator};
use crate::lower::generator::GeneratorDetailsGenerator;
use crate::lower::globals::GlobalVariableAccessGenerator;
use std::collections::HashMap;
use std::rc::Rc;

/// Where an expression's value is stored, if anywhere.
pub enum AssignmentTarget {
    Variable(Ref<Variable>),
    ArrayElement {
        expression: Rc<crate::common::ast::Expression>,
        index: Rc<crate::common::ast::Expression>,
    },
}

/// Everything the lowering routines read while translating one program.
pub struct LoweringContext<'a> {
    pub analysis: &'a ProgramAnalysis,
    pub function_details: &'a HashMap<Ref<Function>, Rc<dyn FunctionDetailsGenerator>>,
    pub generator_details: &'a HashMap<Ref<Function>, Rc<dyn GeneratorDetailsGenerator>>,
    pub array_memory: &'a dyn ArrayMemoryManagement,
    pub globals_access: &'a GlobalVariableAccessGenerator,
    pub diagnostics: &'a Diagnostics,
}

impl LoweringContext<'_> {
    /// The access generator responsible for a variable owner's storage.
    pub fn access_generator(&self, owner: &VariableOwner) -> &dyn VariableAccessGenerator {
        match owner {
            VariableOwner::Global => self.globals_access,
            VariableOwner::Function(function) => {
                if function.is_generator {
                    self.generator_details[function].as_ref()
                } else {
                    self.function_details[function].as_ref()
                }
            }
        }
    }

    /// Read a named variable from wherever its owner keeps it.
    pub fn read_named(&self, named_node: &NamedNode, current_function: &Ref<Function>) -> IrTree {
        let owner = &self.analysis.variable_properties[named_node].owner;
        self.access_generator(owner)
            .gen_read(named_node, owner.is_function(current_function))
    }

    /// Write a named variable into wherever its owner keeps it.
    pub fn write_named(
        &self,
        named_node: &NamedNode,
        value: IrTree,
        current_function: &Ref<Function>,
    ) -> IrTree {
        let owner = &self.analysis.variable_properties[named_node].owner;
        self.access_generator(owner)
            .gen_write(named_node, value, owner.is_function(current_function))
    }

    pub fn read_variable(&self, variable: &Ref<Variable>, current_function: &Ref<Function>) -> IrTree {
        self.read_named(&NamedNode::Variable(variable.clone()), current_function)
    }

    pub fn write_variable(
        &self,
        variable: &Ref<Variable>,
        value: IrTree,
        current_function: &Ref<Function>,
    ) -> IrTree {
        self.write_named(&NamedNode::Variable(variable.clone()), value, current_function)
    }

    pub fn generator_details_of(&self, function: &Ref<Function>) -> &dyn GeneratorDetailsGenerator {
        self.generator_details[function].as_ref()
    }
}

/// Wrap a function body with its prologue and epilogue.
///
/// The prologue links unconditionally to the body's entry; every final
/// root *and* every dangling conditional branch of the body is linked to
/// the epilogue, so all control paths terminate there exactly once.
pub fn attach_prologue_and_epilogue(
    body: &ControlFlowGraph,
    prologue: &ControlFlowGraph,
    epilogue: &ControlFlowGraph,
) -> ControlFlowGraph {
    let mut builder = ControlFlowGraphBuilder::new();
    builder.add_all_from(prologue, true);

    let epilogue_entry = epilogue
        .entry_tree_root
        .clone()
        .expect("epilogue is never empty");

    if let Some(body_entry) = &body.entry_tree_root {
        builder.add_links_from_all_final_roots(CfgLinkType::Unconditional, body_entry.clone());
        builder.add_all_from(body, true);
        builder.add_links_from_all_final_roots(CfgLinkType::Unconditional, epilogue_entry.clone());

        // Complete half-open conditionals straight into the epilogue.
        for root in &body.tree_roots {
            let key = NodeRef::from(root);
            let has_true = body.conditional_true_links.contains_key(&key);
            let has_false = body.conditional_false_links.contains_key(&key);
            if has_false && !has_true {
                builder.add_link(
                    Some((root.clone(), CfgLinkType::ConditionalTrue)),
                    epilogue_entry.clone(),
                    true,
                );
            }
            if has_true && !has_false {
                builder.add_link(
                    Some((root.clone(), CfgLinkType::ConditionalFalse)),
                    epilogue_entry.clone(),
                    true,
                );
            }
        }
    } else {
        builder.add_links_from_all_final_roots(CfgLinkType::Unconditional, epilogue_entry);
    }

    builder.add_all_from(epilogue, true);
    builder.build()
}
