//! Statement lowering: one CFG per function body.
//!
//! Statements compose sequentially; `if` merges conditionally; loops link
//! the loop body back to the condition entry and break out through a `NoOp`
//! join node. Early exits (`return`, `break`, `continue`) jump into
//! *escape trees*: per-exit-kind chains of cleanup graphs, extended at the
//! front whenever a scope declares something needing destruction, so each
//! exit runs exactly the destructors of the scopes it leaves — in reverse
//! declaration order — before control departs.
//!
//! `break`/`continue` outside a loop and statements made unreachable by a
//! preceding escape are reported as diagnostics; the offending statement is
//! still lowered for structural completeness but never linked into the
//! live graph.

use crate::common::ast::{
    Function, LValue, Program, Statement, StatementBlock, Type, Variable,
};
use crate::common::diagnostics::Diagnostic;
use crate::common::reference::Ref;
use crate::ir::builder::ControlFlowGraphBuilder;
use crate::ir::cfg::{CfgLinkType, ControlFlowGraph};
use crate::ir::node::{IrNode, IrTree};
use crate::ir::register::Register;
use crate::lower::expr::{LastRoots, map_link_type};
use crate::lower::{
    AssignmentTarget, LoweringContext, create_graph_for_expression,
    create_graph_for_expression_with_access,
};

/// Lower every local function (including nested ones) of the program.
pub fn create_graphs_for_functions(
    ctx: &LoweringContext<'_>,
    program: &Program,
) -> Vec<(Ref<Function>, ControlFlowGraph)> {
    let mut graphs = Vec::new();
    for function in program.local_functions() {
        FunctionLowerer::process(ctx, function, &mut graphs);
    }
    graphs
}

/// The head of one escape chain. Jumping to `value` runs every cleanup
/// added so far, innermost first, and then whatever the chain originally
/// pointed at (the loop anchor or the function's return point).
#[derive(Clone)]
struct EscapeTreeHead {
    value: IrTree,
}

struct FunctionLowerer<'a, 'c> {
    ctx: &'a LoweringContext<'c>,
    function: Ref<Function>,
    builder: ControlFlowGraphBuilder,
    last: LastRoots,
}

impl<'a, 'c> FunctionLowerer<'a, 'c> {
    fn process(
        ctx: &'a LoweringContext<'c>,
        function: &Ref<Function>,
        graphs: &mut Vec<(Ref<Function>, ControlFlowGraph)>,
    ) {
        let mut lowerer = FunctionLowerer {
            ctx,
            function: function.clone(),
            builder: ControlFlowGraphBuilder::new(),
            last: vec![None],
        };

        // All returns funnel through one detached node that the epilogue
        // (or the generator machinery) later picks up as the body's end.
        let return_tree_root = IrNode::no_op();
        lowerer.add_detached_node(return_tree_root.clone());
        let mut return_head = EscapeTreeHead {
            value: return_tree_root.clone(),
        };
        lowerer.process_block(&function.body, &mut return_head, None, None, graphs);
        lowerer.add_node(return_tree_root);

        graphs.push((function.clone(), lowerer.builder.build()));
    }

    fn add_cfg(&mut self, cfg: &ControlFlowGraph) -> Option<IrTree> {
        let entry = cfg.entry_tree_root.clone();
        if let Some(entry) = &entry {
            for from in std::mem::take(&mut self.last) {
                self.builder.add_link(from, entry.clone(), true);
            }
            self.last = cfg.final_tree_roots().into_iter().map(Some).collect();
        }
        self.builder.add_all_from(cfg, true);
        entry
    }

    fn add_node(&mut self, node: IrTree) {
        let mut single = ControlFlowGraphBuilder::new();
        single.add_single_tree(node);
        self.add_cfg(&single.build());
    }

    /// Add a node to the graph without linking it anywhere yet.
    fn add_detached_node(&mut self, node: IrTree) {
        let mut single = ControlFlowGraphBuilder::new();
        single.add_single_tree(node);
        self.builder.add_all_from(&single.build(), false);
    }

    fn add_expression(
        &mut self,
        expression: &std::rc::Rc<crate::common::ast::Expression>,
        target: Option<&AssignmentTarget>,
    ) -> Option<IrTree> {
        let cfg = create_graph_for_expression(self.ctx, expression, target, &self.function);
        self.add_cfg(&cfg)
    }

    /// Like [`Self::add_expression`], but hands back the value node
    /// instead of appending it.
    fn add_expression_with_access(
        &mut self,
        expression: &std::rc::Rc<crate::common::ast::Expression>,
    ) -> IrTree {
        let (cfg, access) =
            create_graph_for_expression_with_access(self.ctx, expression, &self.function);
        self.add_cfg(&cfg);
        access
    }

    /// Link every pending root to `target` without touching `last`.
    fn add_links_from_last(&mut self, target: &IrTree) {
        for from in self.last.clone() {
            self.builder.add_link(from, target.clone(), true);
        }
    }

    /// Prepend a cleanup graph to an escape chain.
    fn add_to_escape_tree(&mut self, cleanup: &ControlFlowGraph, head: Option<&mut EscapeTreeHead>) {
        let Some(head) = head else { return };
        let Some(entry) = cleanup.entry_tree_root.clone() else {
            return;
        };
        self.builder.add_all_from(cleanup, false);
        for (root, link_type) in cleanup.final_tree_roots() {
            self.builder
                .add_link(Some((root, link_type)), head.value.clone(), false);
        }
        head.value = entry;
    }

    /// The cleanup graph run when `variable` goes out of scope.
    fn destructor_of(&self, variable: &Ref<Variable>) -> ControlFlowGraph {
        match &variable.type_ {
            Type::Array(_) => {
                let mut builder = ControlFlowGraphBuilder::new();
                builder.merge_unconditionally(&self.ctx.array_memory.gen_ref_count_decrement(
                    self.ctx.read_variable(variable, &self.function),
                    &variable.type_,
                ));
                // Clear the slot so a re-entered scope starts fresh.
                builder.add_single_tree(self.ctx.write_variable(
                    variable,
                    IrNode::constant(0),
                    &self.function,
                ));
                builder.build()
            }
            _ => ControlFlowGraphBuilder::new().build(),
        }
    }

    /// A loop skeleton around `condition_entry`: the body is generated by
    /// the callback with fresh break/continue chains, its ends loop back
    /// to the condition, and the false edge falls out to a `NoOp` join.
    fn add_loop(
        &mut self,
        condition_entry: IrTree,
        generate_body: impl FnOnce(&mut Self, &mut EscapeTreeHead, &mut EscapeTreeHead),
    ) {
        let condition_end = self.last.clone();

        let final_no_op = IrNode::no_op();
        self.add_detached_node(final_no_op.clone());
        let mut break_head = EscapeTreeHead {
            value: final_no_op.clone(),
        };
        let mut continue_head = EscapeTreeHead {
            value: condition_entry.clone(),
        };

        self.last = map_link_type(&condition_end, CfgLinkType::ConditionalTrue);
        generate_body(self, &mut break_head, &mut continue_head);

        for from in self.last.clone() {
            self.builder.add_link(from, condition_entry.clone(), true);
        }
        self.last = map_link_type(&condition_end, CfgLinkType::ConditionalFalse);
        self.add_node(final_no_op);
    }

    fn process_block(
        &mut self,
        block: &StatementBlock,
        return_head: &mut EscapeTreeHead,
        mut break_head: Option<&mut EscapeTreeHead>,
        mut continue_head: Option<&mut EscapeTreeHead>,
        graphs: &mut Vec<(Ref<Function>, ControlFlowGraph)>,
    ) {
        // Cleanups for this block's normal fall-through exit, pushed in
        // declaration order and popped in reverse at the block's end.
        let mut destructors_stack: Vec<ControlFlowGraph> = Vec::new();

        for statement in block {
            if self.last.is_empty() {
                self.ctx.diagnostics.report(Diagnostic::UnreachableStatement {
                    span: statement.span(),
                });
            }

            match &**statement {
                Statement::Evaluation { expression, .. } => {
                    self.add_expression(expression, None);
                }

                Statement::VariableDefinition { variable, .. } => {
                    // Array slots start at zero so a destructor reached
                    // before initialization decrements nothing.
                    if variable.type_.is_array() {
                        let write = self.ctx.write_variable(
                            variable,
                            IrNode::constant(0),
                            &self.function,
                        );
                        self.add_node(write);
                    }
                    if variable.kind != crate::common::ast::VariableKind::Constant
                        && let Some(value) = &variable.value
                    {
                        let target = AssignmentTarget::Variable(variable.clone());
                        self.add_expression(value, Some(&target));
                    }

                    destructors_stack.push(self.destructor_of(variable));
                    let destructor = self.destructor_of(variable);
                    self.add_to_escape_tree(&destructor, Some(&mut *return_head));
                    let destructor = self.destructor_of(variable);
                    self.add_to_escape_tree(&destructor, break_head.as_deref_mut());
                    let destructor = self.destructor_of(variable);
                    self.add_to_escape_tree(&destructor, continue_head.as_deref_mut());
                }

                Statement::FunctionDefinition { function, .. } => {
                    for parameter in &function.parameters {
                        if let Some(default_value) = &parameter.default_value {
                            let variable =
                                self.ctx.analysis.default_parameter_mapping[parameter].clone();
                            let target = AssignmentTarget::Variable(variable.clone());
                            self.add_expression(default_value, Some(&target));

                            destructors_stack.push(self.destructor_of(&variable));
                            let destructor = self.destructor_of(&variable);
                            self.add_to_escape_tree(&destructor, Some(&mut *return_head));
                            let destructor = self.destructor_of(&variable);
                            self.add_to_escape_tree(&destructor, break_head.as_deref_mut());
                            let destructor = self.destructor_of(&variable);
                            self.add_to_escape_tree(&destructor, continue_head.as_deref_mut());
                        }
                    }

                    if function.is_local() {
                        FunctionLowerer::process(self.ctx, function, graphs);
                    }
                }

                Statement::Assignment { lvalue, value, .. } => {
                    let target = match lvalue {
                        LValue::Variable(_) => AssignmentTarget::Variable(
                            self.ctx.analysis.assignment_resolution[statement].clone(),
                        ),
                        LValue::ArrayElement { expression, index } => {
                            AssignmentTarget::ArrayElement {
                                expression: expression.clone(),
                                index: index.clone(),
                            }
                        }
                    };
                    self.add_expression(value, Some(&target));
                }

                Statement::Block { block, .. } => {
                    let mut inner_return = return_head.clone();
                    let mut inner_break = break_head.as_deref().cloned();
                    let mut inner_continue = continue_head.as_deref().cloned();
                    self.process_block(
                        block,
                        &mut inner_return,
                        inner_break.as_mut(),
                        inner_continue.as_mut(),
                        graphs,
                    );
                }

                Statement::Conditional {
                    condition,
                    action_when_true,
                    action_when_false,
                    ..
                } => {
                    self.add_expression(condition, None);
                    let condition_end = self.last.clone();

                    self.last = map_link_type(&condition_end, CfgLinkType::ConditionalTrue);
                    let mut inner_return = return_head.clone();
                    let mut inner_break = break_head.as_deref().cloned();
                    let mut inner_continue = continue_head.as_deref().cloned();
                    self.process_block(
                        action_when_true,
                        &mut inner_return,
                        inner_break.as_mut(),
                        inner_continue.as_mut(),
                        graphs,
                    );
                    let true_branch_end = self.last.clone();

                    self.last = map_link_type(&condition_end, CfgLinkType::ConditionalFalse);
                    if let Some(action_when_false) = action_when_false {
                        let mut inner_return = return_head.clone();
                        let mut inner_break = break_head.as_deref().cloned();
                        let mut inner_continue = continue_head.as_deref().cloned();
                        self.process_block(
                            action_when_false,
                            &mut inner_return,
                            inner_break.as_mut(),
                            inner_continue.as_mut(),
                            graphs,
                        );
                    }
                    let false_branch_end = self.last.clone();

                    self.last = true_branch_end
                        .into_iter()
                        .chain(false_branch_end)
                        .collect();
                }

                Statement::Loop {
                    condition, action, ..
                } => {
                    let condition_entry = self
                        .add_expression(condition, None)
                        .expect("loop condition is never an empty graph");
                    self.add_loop(condition_entry, |lowerer, inner_break, inner_continue| {
                        let mut inner_return = return_head.clone();
                        lowerer.process_block(
                            action,
                            &mut inner_return,
                            Some(inner_break),
                            Some(inner_continue),
                            graphs,
                        );
                    });
                }

                Statement::LoopBreak { span } => {
                    match break_head.as_deref() {
                        Some(head) => {
                            let target = head.value.clone();
                            self.add_links_from_last(&target);
                        }
                        None => self
                            .ctx
                            .diagnostics
                            .report(Diagnostic::BreakOutsideOfLoop { span: *span }),
                    }
                    self.last = vec![];
                }

                Statement::LoopContinuation { span } => {
                    match continue_head.as_deref() {
                        Some(head) => {
                            let target = head.value.clone();
                            self.add_links_from_last(&target);
                        }
                        None => self
                            .ctx
                            .diagnostics
                            .report(Diagnostic::ContinuationOutsideOfLoop { span: *span }),
                    }
                    self.last = vec![];
                }

                Statement::FunctionReturn { value, .. } => {
                    let target = self
                        .ctx
                        .analysis
                        .function_return_variables
                        .get(&self.function)
                        .cloned()
                        .map(AssignmentTarget::Variable);
                    self.add_expression(value, target.as_ref());
                    let return_target = return_head.value.clone();
                    self.add_links_from_last(&return_target);
                    self.last = vec![];
                }

                Statement::ForeachLoop {
                    receiving_variable,
                    generator_call,
                    action,
                    ..
                } => {
                    self.lower_foreach(
                        statement,
                        receiving_variable,
                        generator_call,
                        action,
                        return_head,
                        graphs,
                    );
                }

                Statement::GeneratorYield { value, .. } => {
                    let access = self.add_expression_with_access(value);
                    let yield_graph = self
                        .ctx
                        .generator_details_of(&self.function)
                        .gen_yield(access);
                    self.add_cfg(&yield_graph);
                }
            }
        }

        while let Some(destructor) = destructors_stack.pop() {
            self.add_cfg(&destructor);
        }
    }

    /// `foreach v in g(args) { body }`:
    /// call init; loop resuming with the saved state, branching on the
    /// has-more flag into the body (binding the yielded value) or out to
    /// finalize. When the foreach itself sits inside a generator, the
    /// spawned generator's id lives in the enclosing generator's frame so
    /// it survives suspension — and gets finalized by the enclosing
    /// generator's own finalize if the loop never finishes.
    fn lower_foreach(
        &mut self,
        statement: &Ref<Statement>,
        receiving_variable: &Ref<Variable>,
        generator_call: &std::rc::Rc<crate::common::ast::Expression>,
        action: &StatementBlock,
        return_head: &mut EscapeTreeHead,
        graphs: &mut Vec<(Ref<Function>, ControlFlowGraph)>,
    ) {
        let callee = self.ctx.analysis.call_resolution[&Ref::from(generator_call)].clone();
        let details = &self.ctx.generator_details[&callee];

        let frame_memory_address = if self.function.is_generator {
            self.ctx
                .generator_details_of(&self.function.clone())
                .nested_foreach_frame_pointer_address(statement)
        } else {
            None
        };

        // Initialization: keep the new generator's id in a register, or in
        // the enclosing generator's frame slot.
        let init_access = self.add_expression_with_access(generator_call);
        let generator_id = match &frame_memory_address {
            None => {
                let id_register = Register::fresh();
                self.add_node(IrNode::register_write(id_register, init_access));
                IrNode::register_read(id_register)
            }
            Some(address) => {
                self.add_node(IrNode::memory_write(address.clone(), init_access));
                IrNode::memory_read(address.clone())
            }
        };

        // Saved resume state, initially 0.
        let last_position = Register::fresh();
        self.add_node(IrNode::register_write(last_position, IrNode::constant(0)));

        let resume = details.gen_resume_call(
            generator_id.clone(),
            IrNode::register_read(last_position),
        );
        let resume_entry = self
            .add_cfg(&resume.call_graph)
            .expect("resume call graph is never empty");
        let has_more = resume
            .second_result
            .expect("resume returns the has-more flag");
        self.add_node(IrNode::not_equals(has_more.clone(), IrNode::constant(0)));

        let finalize_cfg = || -> ControlFlowGraph {
            let mut builder = ControlFlowGraphBuilder::new();
            builder.add_all_from(
                &details.gen_finalize_call(generator_id.clone()).call_graph,
                true,
            );
            if let Some(address) = &frame_memory_address {
                builder.add_single_tree(IrNode::memory_write(
                    address.clone(),
                    IrNode::constant(0),
                ));
            }
            builder.build()
        };

        let yielded_value = resume.result.expect("resume returns the yielded value");
        let receive = self.ctx.write_variable(
            receiving_variable,
            yielded_value,
            &self.function.clone(),
        );
        self.add_loop(resume_entry, |lowerer, inner_break, inner_continue| {
            lowerer.add_node(IrNode::register_write(last_position, has_more.clone()));
            lowerer.add_node(receive);

            // Returning from inside the loop must finalize this generator.
            let mut inner_return = return_head.clone();
            lowerer.add_to_escape_tree(&finalize_cfg(), Some(&mut inner_return));
            lowerer.process_block(
                action,
                &mut inner_return,
                Some(inner_break),
                Some(inner_continue),
                graphs,
            );
        });

        // Normal exhaustion or break lands here.
        self.add_cfg(&finalize_cfg());
    }
}
