//! Semantic facts produced by upstream analysis.
//!
//! The back end never recomputes name resolution, types, or ownership — it
//! consumes the maps below as read-only inputs. All maps are keyed by node
//! identity ([`Ref`]).

use crate::common::ast::{Argument, Expression, Function, NamedNode, Parameter, Statement, Type, Variable};
use crate::common::reference::Ref;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

/// The lexical owner of a variable: a function's frame, or global storage.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum VariableOwner {
    Global,
    Function(Ref<Function>),
}

impl VariableOwner {
    pub fn is_function(&self, function: &Ref<Function>) -> bool {
        matches!(self, VariableOwner::Function(owner) if owner == function)
    }
}

/// Ownership and access facts for one variable or parameter.
#[derive(Clone, Debug)]
pub struct VariableProperties {
    pub owner: VariableOwner,
    /// Functions that read the variable.
    pub accessed_in: HashSet<Ref<Function>>,
    /// Functions that write the variable.
    pub written_in: HashSet<Ref<Function>>,
}

/// Everything the lowering phase needs to know about a program beyond its
/// AST shape.
#[derive(Default)]
pub struct ProgramAnalysis {
    /// `Expression::Variable` use site → resolved declaration.
    pub variable_resolution: HashMap<Ref<Expression>, NamedNode>,
    /// `Expression::FunctionCall` site → resolved callee.
    pub call_resolution: HashMap<Ref<Expression>, Ref<Function>>,
    /// `Statement::Assignment` to a variable → resolved target.
    pub assignment_resolution: HashMap<Ref<Statement>, Ref<Variable>>,
    /// Call-site argument → the parameter it binds (handles named args).
    pub argument_resolution: HashMap<Ref<Argument>, Ref<Parameter>>,
    /// Checked type of every expression.
    pub expression_types: HashMap<Ref<Expression>, Type>,
    /// Ownership/access facts per variable and parameter.
    pub variable_properties: HashMap<NamedNode, VariableProperties>,
    /// Transitive call graph restricted to local functions.
    pub call_graph: HashMap<Ref<Function>, HashSet<Ref<Function>>>,
    /// Parameter → the synthesized variable holding its default value.
    pub default_parameter_mapping: HashMap<Ref<Parameter>, Ref<Variable>>,
    /// Function → the synthesized variable its `return` statements write.
    pub function_return_variables: HashMap<Ref<Function>, Ref<Variable>>,
    /// Generator → its directly nested foreach loops, in source order.
    pub foreach_loops_in_generators: HashMap<Ref<Function>, Vec<Ref<Statement>>>,
    /// Maximum static nesting depth of the program (sizes the display).
    pub static_depth: u64,
}

impl ProgramAnalysis {
    pub fn new() -> Self {
        Self::default()
    }

    /// Type of an expression; available for every checked expression.
    pub fn type_of(&self, expression: &Rc<Expression>) -> Option<&Type> {
        self.expression_types.get(&Ref::from(expression))
    }
}
