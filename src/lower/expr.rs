//! Expression lowering.
//!
//! Evaluation order is strictly left to right. Because a call (or a branch
//! that contains one) can overwrite a variable after it was read, lowering
//! runs in two stages: a first pass finds every variable read that some
//! later-evaluated subexpression may invalidate and marks it for
//! snapshotting into a fresh temporary register at the point of read; the
//! second pass builds the CFG, spilling those reads into temporaries and
//! dropping the temporaries again wherever the invalidation actually
//! happens.
//!
//! Short-circuit `and`/`or` and the ternary conditional lower to
//! conditional merges that write their result into one shared fresh
//! register; array values are reference-counted at every ownership
//! transfer.

use crate::common::ast::{
    BinaryOperationKind, Expression, Function, NamedNode, Type, UnaryOperationKind,
};
use crate::common::reference::Ref;
use crate::ir::builder::ControlFlowGraphBuilder;
use crate::ir::cfg::{CfgLinkType, ControlFlowGraph};
use crate::ir::node::{IrNode, IrTree, UNIT_VALUE};
use crate::ir::register::Register;
use crate::lower::function::MEMORY_UNIT_SIZE;
use crate::lower::{AssignmentTarget, LoweringContext};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

/// Pending continuation points: graph positions the next tree links from.
/// A `None` element stands for "the graph is still empty" — linking from it
/// makes the next tree the entry.
pub(crate) type LastRoots = Vec<Option<(IrTree, CfgLinkType)>>;

pub(crate) fn map_link_type(last: &LastRoots, link_type: CfgLinkType) -> LastRoots {
    last.iter()
        .map(|entry| {
            entry
                .as_ref()
                .map(|(root, _)| (root.clone(), link_type))
        })
        .collect()
}

/// Lower `expression`, writing its value to `target` (or appending the
/// value tree when there is no target).
pub fn create_graph_for_expression(
    ctx: &LoweringContext<'_>,
    expression: &Rc<Expression>,
    target: Option<&AssignmentTarget>,
    current_function: &Ref<Function>,
) -> ControlFlowGraph {
    ExpressionLowerer::new(ctx, current_function, expression, target)
        .lower(expression, target, false)
        .0
}

/// Lower `expression` for a caller that consumes the value node itself:
/// the result tree is returned instead of appended, and no unused-result
/// reference-count adjustment happens.
pub fn create_graph_for_expression_with_access(
    ctx: &LoweringContext<'_>,
    expression: &Rc<Expression>,
    current_function: &Ref<Function>,
) -> (ControlFlowGraph, IrTree) {
    ExpressionLowerer::new(ctx, current_function, expression, None).lower(expression, None, true)
}

struct ExpressionLowerer<'a, 'c> {
    ctx: &'a LoweringContext<'c>,
    current_function: Ref<Function>,

    usages_requiring_temporaries: HashSet<Ref<Expression>>,
    invalidated_variables: HashMap<Ref<Expression>, HashSet<NamedNode>>,

    builder: ControlFlowGraphBuilder,
    last: LastRoots,
    /// Live snapshots of invalidatable variables. Persistent so branches
    /// can save and restore it in O(1).
    temporaries: im::HashMap<NamedNode, Register>,
}

impl<'a, 'c> ExpressionLowerer<'a, 'c> {
    fn new(
        ctx: &'a LoweringContext<'c>,
        current_function: &Ref<Function>,
        expression: &Rc<Expression>,
        target: Option<&AssignmentTarget>,
    ) -> Self {
        let mut lowerer = ExpressionLowerer {
            ctx,
            current_function: current_function.clone(),
            usages_requiring_temporaries: HashSet::new(),
            invalidated_variables: HashMap::new(),
            builder: ControlFlowGraphBuilder::new(),
            last: vec![None],
            temporaries: im::HashMap::new(),
        };

        // Stage one; later-evaluated subexpressions are walked first, so
        // `modified` always holds what will change after the walked point.
        let modified = lowerer.gather_usage_info(expression, HashSet::new());
        if let Some(AssignmentTarget::ArrayElement { expression, index }) = target {
            let modified_after_index = lowerer.gather_usage_info(index, modified);
            lowerer.gather_usage_info(expression, modified_after_index);
        }

        lowerer
    }

    /// Variables possibly written by calling `function` (transitively).
    fn variables_modified_by(&self, function: &Ref<Function>) -> HashSet<NamedNode> {
        let mut possibly_called: HashSet<Ref<Function>> = self
            .ctx
            .analysis
            .call_graph
            .get(function)
            .cloned()
            .unwrap_or_default();
        possibly_called.insert(function.clone());

        self.ctx
            .analysis
            .variable_properties
            .iter()
            .filter(|(_, properties)| {
                properties
                    .written_in
                    .iter()
                    .any(|writer| possibly_called.contains(writer))
            })
            .map(|(node, _)| node.clone())
            .collect()
    }

    /// Stage one: which variable reads need temporaries, and which
    /// expressions invalidate which variables. `modified` is the set of
    /// variables some later-evaluated part of the surrounding expression
    /// will write; the return value extends it with this subtree's writes.
    fn gather_usage_info(
        &mut self,
        expression: &Rc<Expression>,
        modified: HashSet<NamedNode>,
    ) -> HashSet<NamedNode> {
        match &**expression {
            Expression::UnitLiteral { .. }
            | Expression::BooleanLiteral { .. }
            | Expression::NumberLiteral { .. } => modified,

            Expression::Variable { .. } => {
                let resolved = &self.ctx.analysis.variable_resolution[&Ref::from(expression)];
                if modified.contains(resolved) {
                    self.usages_requiring_temporaries.insert(Ref::from(expression));
                }
                modified
            }

            Expression::UnaryOperation { operand, .. } => self.gather_usage_info(operand, modified),

            Expression::BinaryOperation {
                kind, left, right, ..
            } => {
                if matches!(kind, BinaryOperationKind::And | BinaryOperationKind::Or) {
                    let modified_in_left = self.gather_usage_info(left, HashSet::new());
                    let modified_in_right = self.gather_usage_info(right, HashSet::new());

                    self.invalidated_variables
                        .insert(Ref::from(expression), modified_in_right.clone());
                    let mut union = modified;
                    union.extend(modified_in_left);
                    union.extend(modified_in_right);
                    union
                } else {
                    let modified_after_right = self.gather_usage_info(right, modified);
                    self.gather_usage_info(left, modified_after_right)
                }
            }

            Expression::FunctionCall { arguments, .. } => {
                let mut modified_in_arguments = HashSet::new();
                for argument in arguments.iter().rev() {
                    modified_in_arguments =
                        self.gather_usage_info(&argument.value, modified_in_arguments);
                }

                let callee = self.ctx.analysis.call_resolution[&Ref::from(expression)].clone();
                let modified_by_call = self.variables_modified_by(&callee);
                self.invalidated_variables
                    .insert(Ref::from(expression), modified_by_call.clone());

                let mut union = modified;
                union.extend(modified_in_arguments);
                union.extend(modified_by_call);
                union
            }

            Expression::Conditional {
                condition,
                result_when_true,
                result_when_false,
                ..
            } => {
                let modified_in_condition = self.gather_usage_info(condition, HashSet::new());
                let modified_in_true = self.gather_usage_info(result_when_true, HashSet::new());
                let modified_in_false = self.gather_usage_info(result_when_false, HashSet::new());

                let mut invalidated = modified_in_true.clone();
                invalidated.extend(modified_in_false.iter().cloned());
                self.invalidated_variables
                    .insert(Ref::from(expression), invalidated);

                let mut union = modified;
                union.extend(modified_in_condition);
                union.extend(modified_in_true);
                union.extend(modified_in_false);
                union
            }

            Expression::ArrayLength { expression, .. } => {
                self.gather_usage_info(expression, modified)
            }

            Expression::ArrayElement {
                expression: array,
                index,
                ..
            } => {
                let modified_after_index = self.gather_usage_info(index, modified);
                self.gather_usage_info(array, modified_after_index)
            }

            Expression::ArrayAllocation {
                size,
                initialization,
                ..
            } => {
                let mut modified_in_initializers = HashSet::new();
                for value in initialization.iter().rev() {
                    modified_in_initializers =
                        self.gather_usage_info(value, modified_in_initializers);
                }
                let modified_after_initializers =
                    self.gather_usage_info(size, modified_in_initializers);

                let mut union = modified;
                union.extend(modified_after_initializers);
                union
            }
        }
    }

    // ── Stage two: CFG assembly ─────────────────────────────────────────

    fn add_next_cfg(&mut self, cfg: &ControlFlowGraph) {
        if let Some(entry) = &cfg.entry_tree_root {
            for from in std::mem::take(&mut self.last) {
                self.builder.add_link(from, entry.clone(), true);
            }
            self.last = cfg.final_tree_roots()
                .into_iter()
                .map(Some)
                .collect();
        }
        self.builder.add_all_from(cfg, true);
    }

    fn add_next_tree(&mut self, tree: IrTree) {
        let mut single = ControlFlowGraphBuilder::new();
        single.add_link(None, tree, true);
        self.add_next_cfg(&single.build());
    }

    fn make_read_node(&self, named_node: &NamedNode) -> IrTree {
        self.ctx.read_named(named_node, &self.current_function)
    }

    fn type_of(&self, expression: &Rc<Expression>) -> Option<&Type> {
        self.ctx.analysis.type_of(expression)
    }

    /// Build the CFG of one subexpression; returns the tree computing its
    /// value. Side effects (calls, branch merges, snapshots) are appended
    /// to the builder as separate trees along the way.
    fn subtree(&mut self, expression: &Rc<Expression>) -> IrTree {
        match &**expression {
            Expression::UnitLiteral { .. } => IrNode::constant(UNIT_VALUE),
            Expression::BooleanLiteral { value, .. } => {
                IrNode::constant(if *value { 1 } else { 0 })
            }
            Expression::NumberLiteral { value, .. } => IrNode::constant(*value),

            Expression::Variable { .. } => {
                let resolved =
                    self.ctx.analysis.variable_resolution[&Ref::from(expression)].clone();

                // An array gains a reference for the duration of its use;
                // consumers (argument passing, element/length reads, the
                // unused-result path) give it back.
                if resolved.has_array_type() {
                    let increment = self
                        .ctx
                        .array_memory
                        .gen_ref_count_increment(self.make_read_node(&resolved));
                    self.add_next_cfg(&increment);
                }

                if !self.usages_requiring_temporaries.contains(&Ref::from(expression)) {
                    self.make_read_node(&resolved)
                } else {
                    if !self.temporaries.contains_key(&resolved) {
                        let value_node = self.make_read_node(&resolved);
                        let temporary = Register::fresh();
                        self.temporaries.insert(resolved.clone(), temporary);
                        self.add_next_tree(IrNode::register_write(temporary, value_node));
                    }
                    let temporary = *self
                        .temporaries
                        .get(&resolved)
                        .expect("temporary exists for snapshotted read");
                    IrNode::register_read(temporary)
                }
            }

            Expression::UnaryOperation { kind, operand, .. } => {
                let operand = self.subtree(operand);
                match kind {
                    UnaryOperationKind::Not => Rc::new(IrNode::LogicalNegation(operand)),
                    UnaryOperationKind::Plus => operand,
                    UnaryOperationKind::Minus => Rc::new(IrNode::Negation(operand)),
                    UnaryOperationKind::BitNot => Rc::new(IrNode::BitNegation(operand)),
                }
            }

            Expression::BinaryOperation {
                kind, left, right, ..
            } => match kind {
                BinaryOperationKind::And | BinaryOperationKind::Or => {
                    self.lower_short_circuit(expression, *kind, left, right)
                }
                _ => {
                    let left = self.subtree(left);
                    let right = self.subtree(right);
                    make_operator_node(*kind, left, right)
                }
            },

            Expression::FunctionCall { arguments, .. } => {
                let function = self.ctx.analysis.call_resolution[&Ref::from(expression)].clone();

                // Arguments evaluate in source order; results are then
                // rearranged into parameter order.
                let mut explicit: HashMap<Ref<crate::common::ast::Parameter>, IrTree> =
                    HashMap::new();
                for argument in arguments {
                    let parameter = self.ctx.analysis.argument_resolution[argument].clone();
                    let value = self.subtree(&argument.value);
                    explicit.insert(parameter, value);
                }

                let mut parameter_values: Vec<IrTree> = Vec::new();
                for parameter in &function.parameters {
                    let named = NamedNode::Parameter(parameter.clone());
                    if let Some(value) = explicit.get(parameter) {
                        if named.has_array_type() {
                            // Pin the array argument so the later refcount
                            // decrement sees the same value.
                            let temporary = Register::fresh();
                            self.add_next_tree(IrNode::register_write(temporary, value.clone()));
                            parameter_values.push(IrNode::register_read(temporary));
                        } else {
                            parameter_values.push(value.clone());
                        }
                    } else {
                        let default_variable =
                            self.ctx.analysis.default_parameter_mapping[parameter].clone();
                        let read_node =
                            self.make_read_node(&NamedNode::Variable(default_variable));
                        if named.has_array_type() {
                            let increment =
                                self.ctx.array_memory.gen_ref_count_increment(read_node.clone());
                            self.add_next_cfg(&increment);
                        }
                        parameter_values.push(read_node);
                    }
                }

                let call = if function.is_generator {
                    self.ctx
                        .generator_details_of(&function)
                        .gen_init_call(parameter_values.clone())
                } else {
                    self.ctx.function_details[&function].gen_call(parameter_values.clone())
                };
                self.add_next_cfg(&call.call_graph);

                for invalidated in &self.invalidated_variables[&Ref::from(expression)] {
                    self.temporaries.remove(invalidated);
                }

                // Give back the references taken for array arguments.
                for (parameter, value) in function.parameters.iter().zip(&parameter_values) {
                    if parameter.type_.is_array() {
                        let decrement = self
                            .ctx
                            .array_memory
                            .gen_ref_count_decrement(value.clone(), &parameter.type_);
                        self.add_next_cfg(&decrement);
                    }
                }

                match call.result {
                    Some(result) => {
                        let temporary = Register::fresh();
                        self.add_next_tree(IrNode::register_write(temporary, result));
                        IrNode::register_read(temporary)
                    }
                    None => IrNode::constant(UNIT_VALUE),
                }
            }

            Expression::Conditional {
                condition,
                result_when_true,
                result_when_false,
                ..
            } => {
                let condition = self.subtree(condition);
                self.add_next_tree(condition);
                let last_after_condition = self.last.clone();
                let saved_temporaries = self.temporaries.clone();
                let result_register = Register::fresh();

                self.last = map_link_type(&last_after_condition, CfgLinkType::ConditionalTrue);
                let true_result = self.subtree(result_when_true);
                self.add_next_tree(IrNode::register_write(result_register, true_result));
                self.temporaries = saved_temporaries;
                let last_after_true = self.last.clone();

                self.last = map_link_type(&last_after_condition, CfgLinkType::ConditionalFalse);
                let false_result = self.subtree(result_when_false);
                self.add_next_tree(IrNode::register_write(result_register, false_result));
                let last_after_false = self.last.clone();

                for invalidated in &self.invalidated_variables[&Ref::from(expression)] {
                    self.temporaries.remove(invalidated);
                }
                self.last = last_after_true.into_iter().chain(last_after_false).collect();
                IrNode::register_read(result_register)
            }

            Expression::ArrayLength { expression: array, .. } => {
                let array_type = self.type_of(array).cloned().expect("array has a checked type");
                let array = self.subtree(array);
                let result_register = Register::fresh();
                // The size word sits one unit before the first element.
                self.add_next_tree(IrNode::register_write(
                    result_register,
                    IrNode::memory_read(Rc::new(IrNode::Subtract(
                        array.clone(),
                        IrNode::constant(MEMORY_UNIT_SIZE as i64),
                    ))),
                ));
                let decrement = self.ctx.array_memory.gen_ref_count_decrement(array, &array_type);
                self.add_next_cfg(&decrement);
                IrNode::register_read(result_register)
            }

            Expression::ArrayElement {
                expression: array,
                index,
                ..
            } => {
                let array_type = self.type_of(array).cloned().expect("array has a checked type");
                let array_register = Register::fresh();
                let array_value = self.subtree(array);
                self.add_next_tree(IrNode::register_write(array_register, array_value));
                let index = self.subtree(index);

                let element_address = IrNode::add(
                    IrNode::register_read(array_register),
                    IrNode::multiply(index, IrNode::constant(MEMORY_UNIT_SIZE as i64)),
                );
                let result_register = Register::fresh();
                self.add_next_tree(IrNode::register_write(
                    result_register,
                    IrNode::memory_read(element_address.clone()),
                ));

                // A nested array flowing out of its parent needs its own
                // reference before the parent's is released.
                if array_type.element_type().is_some_and(Type::is_array) {
                    let increment = self
                        .ctx
                        .array_memory
                        .gen_ref_count_increment(IrNode::memory_read(element_address));
                    self.add_next_cfg(&increment);
                }
                let decrement = self
                    .ctx
                    .array_memory
                    .gen_ref_count_decrement(IrNode::register_read(array_register), &array_type);
                self.add_next_cfg(&decrement);
                IrNode::register_read(result_register)
            }

            Expression::ArrayAllocation {
                size,
                initialization,
                mode,
                ..
            } => {
                let array_type = self
                    .type_of(expression)
                    .cloned()
                    .expect("allocation has a checked type");
                let size = self.subtree(size);
                let values: Vec<IrTree> = initialization
                    .iter()
                    .map(|value| self.subtree(value))
                    .collect();

                let (allocation, address) =
                    self.ctx
                        .array_memory
                        .gen_allocation(size, &values, &array_type, *mode);
                self.add_next_cfg(&allocation);

                // The allocation took its own references to the values.
                if array_type.element_type().is_some_and(Type::is_array) {
                    let element_type = array_type.element_type().unwrap().clone();
                    for value in values {
                        let decrement = self
                            .ctx
                            .array_memory
                            .gen_ref_count_decrement(value, &element_type);
                        self.add_next_cfg(&decrement);
                    }
                }
                address
            }
        }
    }

    fn lower_short_circuit(
        &mut self,
        expression: &Rc<Expression>,
        kind: BinaryOperationKind,
        left: &Rc<Expression>,
        right: &Rc<Expression>,
    ) -> IrTree {
        // `and` evaluates the right side when true and short-circuits to 0;
        // `or` evaluates it when false and short-circuits to 1.
        let (right_link, short_circuit_link, short_circuit_value) = match kind {
            BinaryOperationKind::And => (
                CfgLinkType::ConditionalTrue,
                CfgLinkType::ConditionalFalse,
                0,
            ),
            BinaryOperationKind::Or => (
                CfgLinkType::ConditionalFalse,
                CfgLinkType::ConditionalTrue,
                1,
            ),
            _ => unreachable!("only and/or short-circuit"),
        };

        let left = self.subtree(left);
        self.add_next_tree(left);
        let last_after_left = self.last.clone();
        let result_register = Register::fresh();

        self.last = map_link_type(&last_after_left, right_link);
        let right_result = self.subtree(right);
        self.add_next_tree(IrNode::register_write(result_register, right_result));
        let last_after_right = self.last.clone();

        self.last = map_link_type(&last_after_left, short_circuit_link);
        self.add_next_tree(IrNode::register_write(
            result_register,
            IrNode::constant(short_circuit_value),
        ));
        let last_after_short_circuit = self.last.clone();

        for invalidated in &self.invalidated_variables[&Ref::from(expression)] {
            self.temporaries.remove(invalidated);
        }
        self.last = last_after_right
            .into_iter()
            .chain(last_after_short_circuit)
            .collect();
        IrNode::register_read(result_register)
    }

    /// Stage two driver; `keep_access` suppresses appending the result.
    fn lower(
        mut self,
        expression: &Rc<Expression>,
        target: Option<&AssignmentTarget>,
        keep_access: bool,
    ) -> (ControlFlowGraph, IrTree) {
        // An array-element target evaluates its array and index before the
        // assigned value.
        let (target_array, target_index) = match target {
            Some(AssignmentTarget::ArrayElement { expression, index }) => {
                (Some(self.subtree(expression)), Some(self.subtree(index)))
            }
            _ => (None, None),
        };

        let result = self.subtree(expression);

        match target {
            Some(AssignmentTarget::Variable(variable)) => {
                let current_function = self.current_function.clone();
                let write = self
                    .ctx
                    .write_variable(variable, result.clone(), &current_function);
                self.add_next_tree(write);
            }
            Some(AssignmentTarget::ArrayElement { expression: array, .. }) => {
                let array_type = self
                    .type_of(array)
                    .cloned()
                    .expect("assignment target has a checked type");
                let element_address = IrNode::add(
                    target_array.clone().unwrap(),
                    IrNode::multiply(
                        target_index.unwrap(),
                        IrNode::constant(MEMORY_UNIT_SIZE as i64),
                    ),
                );
                // Release the overwritten element if elements are arrays.
                if array_type.element_type().is_some_and(Type::is_array) {
                    let decrement = self.ctx.array_memory.gen_ref_count_decrement(
                        IrNode::memory_read(element_address.clone()),
                        array_type.element_type().unwrap(),
                    );
                    self.add_next_cfg(&decrement);
                }
                self.add_next_tree(IrNode::memory_write(element_address, result.clone()));
                let decrement = self
                    .ctx
                    .array_memory
                    .gen_ref_count_decrement(target_array.unwrap(), &array_type);
                self.add_next_cfg(&decrement);
            }
            None => {
                if !keep_access {
                    // An unused array value drops the reference its
                    // evaluation took.
                    if let Some(type_) = self.type_of(expression)
                        && type_.is_array()
                    {
                        let type_ = type_.clone();
                        let decrement = self
                            .ctx
                            .array_memory
                            .gen_ref_count_decrement(result.clone(), &type_);
                        self.add_next_cfg(&decrement);
                    }
                    self.add_next_tree(result.clone());
                }
            }
        }

        (self.builder.build(), result)
    }
}

fn make_operator_node(kind: BinaryOperationKind, left: IrTree, right: IrTree) -> IrTree {
    Rc::new(match kind {
        BinaryOperationKind::And | BinaryOperationKind::Or => {
            unreachable!("short-circuit operators have no IR node")
        }
        BinaryOperationKind::Iff => IrNode::LogicalIff(left, right),
        BinaryOperationKind::Xor => IrNode::LogicalXor(left, right),
        BinaryOperationKind::Add => IrNode::Add(left, right),
        BinaryOperationKind::Subtract => IrNode::Subtract(left, right),
        BinaryOperationKind::Multiply => IrNode::Multiply(left, right),
        BinaryOperationKind::Divide => IrNode::Divide(left, right),
        BinaryOperationKind::Modulo => IrNode::Modulo(left, right),
        BinaryOperationKind::BitAnd => IrNode::BitAnd(left, right),
        BinaryOperationKind::BitOr => IrNode::BitOr(left, right),
        BinaryOperationKind::BitXor => IrNode::BitXor(left, right),
        BinaryOperationKind::BitShiftLeft => IrNode::BitShiftLeft(left, right),
        BinaryOperationKind::BitShiftRight => IrNode::BitShiftRight(left, right),
        BinaryOperationKind::Equals => IrNode::Equals(left, right),
        BinaryOperationKind::NotEquals => IrNode::NotEquals(left, right),
        BinaryOperationKind::LessThan => IrNode::LessThan(left, right),
        BinaryOperationKind::LessThanOrEquals => IrNode::LessThanOrEquals(left, right),
        BinaryOperationKind::GreaterThan => IrNode::GreaterThan(left, right),
        BinaryOperationKind::GreaterThanOrEquals => IrNode::GreaterThanOrEquals(left, right),
    })
}
