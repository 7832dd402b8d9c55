//! Construction of the per-function details generators.
//!
//! Walks the program once to mangle unique identifiers for (possibly
//! nested) functions, classify each variable as register- or
//! memory-resident, and instantiate the right details generator: default or
//! foreign, function or generator.

use crate::common::analysis::{ProgramAnalysis, VariableOwner};
use crate::common::ast::{
    Function, Implementation, NamedNode, Program, Statement, Type,
};
use crate::common::reference::Ref;
use crate::ir::node::IrNode;
use crate::lower::function::{
    DISPLAY_LABEL_IN_MEMORY, DefaultFunctionDetailsGenerator, ForeignFunctionDetailsGenerator,
    FunctionDetailsGenerator, VariableLocationType,
};
use crate::lower::generator::{
    DefaultGeneratorDetailsGenerator, ForeignGeneratorDetailsGenerator, GeneratorDetailsGenerator,
};
use std::collections::HashMap;
use std::rc::Rc;

/// Mangled code labels for all local functions: `parent$child`, with
/// block-scoped siblings disambiguated by block number.
pub fn create_unique_identifiers(program: &Program) -> HashMap<Ref<Function>, String> {
    let mut identifiers: HashMap<Ref<Function>, String> = HashMap::new();

    fn sanitize(name: &str) -> String {
        name.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '#' })
            .collect()
    }

    fn visit(
        function: &Ref<Function>,
        path: Option<&str>,
        identifiers: &mut HashMap<Ref<Function>, String>,
    ) {
        if !function.is_local() {
            return;
        }
        let identifier = match path {
            Some(path) => format!("{path}${}", sanitize(&function.name)),
            None => sanitize(&function.name),
        };
        identifiers.insert(function.clone(), identifier.clone());

        let mut block_number = 0usize;
        visit_block(&function.body, &identifier, &mut block_number, identifiers);
    }

    fn visit_block(
        block: &[Ref<Statement>],
        path: &str,
        block_number: &mut usize,
        identifiers: &mut HashMap<Ref<Function>, String>,
    ) {
        for statement in block {
            match &**statement {
                Statement::FunctionDefinition { function, .. } => {
                    visit(function, Some(path), identifiers);
                }
                Statement::Block { block, .. } => {
                    let nested = format!("{path}@block{}", *block_number);
                    *block_number += 1;
                    let mut inner = 0usize;
                    visit_block(block, &nested, &mut inner, identifiers);
                }
                Statement::Conditional {
                    action_when_true,
                    action_when_false,
                    ..
                } => {
                    let nested = format!("{path}@block{}", *block_number);
                    *block_number += 1;
                    let mut inner = 0usize;
                    visit_block(action_when_true, &nested, &mut inner, identifiers);
                    if let Some(action_when_false) = action_when_false {
                        let nested = format!("{path}@block{}", *block_number);
                        *block_number += 1;
                        let mut inner = 0usize;
                        visit_block(action_when_false, &nested, &mut inner, identifiers);
                    }
                }
                Statement::Loop { action, .. } | Statement::ForeachLoop { action, .. } => {
                    let nested = format!("{path}@block{}", *block_number);
                    *block_number += 1;
                    let mut inner = 0usize;
                    visit_block(action, &nested, &mut inner, identifiers);
                }
                _ => {}
            }
        }
    }

    for function in program.local_functions() {
        visit(function, None, &mut identifiers);
    }
    identifiers
}

type DetailsMaps = (
    HashMap<Ref<Function>, Rc<dyn FunctionDetailsGenerator>>,
    HashMap<Ref<Function>, Rc<dyn GeneratorDetailsGenerator>>,
);

/// Build the details generators for every function of the program.
pub fn create_details_generators(program: &Program, analysis: &ProgramAnalysis) -> DetailsMaps {
    let identifiers = create_unique_identifiers(program);
    let mut function_details: HashMap<Ref<Function>, Rc<dyn FunctionDetailsGenerator>> =
        HashMap::new();
    let mut generator_details: HashMap<Ref<Function>, Rc<dyn GeneratorDetailsGenerator>> =
        HashMap::new();

    // Variables accessed or written by any other function cannot stay in
    // registers: register-resident storage is invisible across frames.
    let variable_locations = |function: &Ref<Function>| -> Vec<(NamedNode, VariableLocationType)> {
        let mut variables: Vec<(NamedNode, VariableLocationType)> = analysis
            .variable_properties
            .iter()
            .filter(|(_, properties)| {
                properties.owner == VariableOwner::Function(function.clone())
            })
            .map(|(node, properties)| {
                let escapes = properties
                    .accessed_in
                    .iter()
                    .chain(properties.written_in.iter())
                    .any(|accessor| accessor != function);
                let location = if escapes {
                    VariableLocationType::Memory
                } else {
                    VariableLocationType::Register
                };
                (node.clone(), location)
            })
            .collect();
        variables.sort_by(|(a, _), (b, _)| a.name().cmp(b.name()));
        variables
    };

    fn identifier_of(
        function: &Ref<Function>,
        identifiers: &HashMap<Ref<Function>, String>,
    ) -> String {
        match &function.implementation {
            Implementation::Foreign(foreign_name) => foreign_name.clone(),
            Implementation::Local => identifiers[function].clone(),
        }
    }

    let mut create = |function: &Ref<Function>, depth: u64| {
        let identifier = identifier_of(function, &identifiers);
        if function.is_generator {
            let details: Rc<dyn GeneratorDetailsGenerator> = match function.implementation {
                Implementation::Foreign(_) => Rc::new(ForeignGeneratorDetailsGenerator::new(
                    &format!("{identifier}_init"),
                    &format!("{identifier}_resume"),
                    &format!("{identifier}_finalize"),
                )),
                Implementation::Local => {
                    let nested_loops = analysis
                        .foreach_loops_in_generators
                        .get(function)
                        .cloned()
                        .unwrap_or_default()
                        .into_iter()
                        .map(|foreach_loop| {
                            let callee = match &*foreach_loop {
                                Statement::ForeachLoop { generator_call, .. } => {
                                    &analysis.call_resolution[&Ref::from(generator_call)]
                                }
                                _ => panic!("nested foreach list holds a non-foreach statement"),
                            };
                            let finalize_label =
                                format!("{}_finalize", identifier_of(callee, &identifiers));
                            (foreach_loop, finalize_label)
                        })
                        .collect();
                    Rc::new(DefaultGeneratorDetailsGenerator::new(
                        function
                            .parameters
                            .iter()
                            .map(|parameter| NamedNode::Parameter(parameter.clone()))
                            .collect(),
                        &identifier,
                        depth,
                        variable_locations(function),
                        IrNode::memory_label(DISPLAY_LABEL_IN_MEMORY),
                        nested_loops,
                    ))
                }
            };
            generator_details.insert(function.clone(), details);
        } else {
            let details: Rc<dyn FunctionDetailsGenerator> = match function.implementation {
                Implementation::Foreign(_) => Rc::new(ForeignFunctionDetailsGenerator::new(
                    identifier,
                    u8::from(function.return_type != Type::Unit),
                )),
                Implementation::Local => Rc::new(DefaultFunctionDetailsGenerator::new(
                    function
                        .parameters
                        .iter()
                        .map(|parameter| NamedNode::Parameter(parameter.clone()))
                        .collect(),
                    analysis
                        .function_return_variables
                        .get(function)
                        .map(|variable| NamedNode::Variable(variable.clone())),
                    identifier,
                    depth,
                    variable_locations(function),
                    IrNode::memory_label(DISPLAY_LABEL_IN_MEMORY),
                )),
            };
            function_details.insert(function.clone(), details);
        }
    };

    fn walk(
        function: &Ref<Function>,
        depth: u64,
        create: &mut dyn FnMut(&Ref<Function>, u64),
    ) {
        create(function, depth);
        walk_block(&function.body, depth, create);
    }

    fn walk_block(
        block: &[Ref<Statement>],
        depth: u64,
        create: &mut dyn FnMut(&Ref<Function>, u64),
    ) {
        for statement in block {
            match &**statement {
                Statement::FunctionDefinition { function, .. } => {
                    walk(function, depth + 1, create);
                }
                Statement::Block { block, .. } => walk_block(block, depth, create),
                Statement::Conditional {
                    action_when_true,
                    action_when_false,
                    ..
                } => {
                    walk_block(action_when_true, depth, create);
                    if let Some(action_when_false) = action_when_false {
                        walk_block(action_when_false, depth, create);
                    }
                }
                Statement::Loop { action, .. } | Statement::ForeachLoop { action, .. } => {
                    walk_block(action, depth, create)
                }
                _ => {}
            }
        }
    }

    for global in &program.globals {
        if let crate::common::ast::Global::FunctionDefinition(function) = global {
            walk(function, 0, &mut create);
        }
    }

    (function_details, generator_details)
}
