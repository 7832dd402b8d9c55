//! Tests for statement/expression lowering.
//!
//! Fixtures build a small AST plus the semantic facts the lowering
//! consumes; the assertions then inspect the produced CFG's shape through
//! the edge maps.

use crate::common::analysis::{ProgramAnalysis, VariableOwner, VariableProperties};
use crate::common::ast::{
    Expression, Function, Global, Implementation, NamedNode, Program, Statement, Type, Variable,
    VariableKind,
};
use crate::common::diagnostics::{Diagnostic, Diagnostics};
use crate::common::reference::Ref;
use crate::ir::cfg::{CfgLinkType, ControlFlowGraph};
use crate::ir::node::{IrNode, IrTree, NodeRef};
use crate::lower::array::DefaultArrayMemoryManagement;
use crate::lower::globals::GlobalVariableAccessGenerator;
use crate::lower::{
    LoweringContext, attach_prologue_and_epilogue, create_details_generators,
    create_graph_for_expression, create_graphs_for_functions,
};
use std::collections::HashSet;
use std::rc::Rc;

// ── fixture helpers ─────────────────────────────────────────────────────

fn number(value: i64) -> Rc<Expression> {
    Rc::new(Expression::NumberLiteral { value, span: None })
}

fn boolean(value: bool) -> Rc<Expression> {
    Rc::new(Expression::BooleanLiteral { value, span: None })
}

fn read(name: &str) -> Rc<Expression> {
    Rc::new(Expression::Variable {
        name: name.to_string(),
        span: None,
    })
}

fn stmt(statement: Statement) -> Ref<Statement> {
    Ref::new(statement)
}

fn evaluation(expression: Rc<Expression>) -> Ref<Statement> {
    stmt(Statement::Evaluation {
        expression,
        span: None,
    })
}

fn local_variable(name: &str, type_: Type) -> Ref<Variable> {
    Ref::new(Variable {
        kind: VariableKind::Variable,
        name: name.to_string(),
        type_,
        value: None,
        span: None,
    })
}

fn function(name: &str, body: Vec<Ref<Statement>>) -> Ref<Function> {
    Ref::new(Function {
        name: name.to_string(),
        parameters: vec![],
        return_type: Type::Unit,
        implementation: Implementation::Local,
        is_generator: false,
        body,
        span: None,
    })
}

struct Fixture {
    program: Program,
    analysis: ProgramAnalysis,
    diagnostics: Diagnostics,
}

impl Fixture {
    fn new(main: Ref<Function>) -> Self {
        Fixture {
            program: Program {
                globals: vec![Global::FunctionDefinition(main)],
            },
            analysis: ProgramAnalysis::new(),
            diagnostics: Diagnostics::new(),
        }
    }

    fn main(&self) -> Ref<Function> {
        match &self.program.globals[0] {
            Global::FunctionDefinition(function) => function.clone(),
            _ => unreachable!(),
        }
    }

    /// Register a function-owned variable used only locally.
    fn own_variable(&mut self, variable: &Ref<Variable>, owner: &Ref<Function>) {
        self.analysis.variable_properties.insert(
            NamedNode::Variable(variable.clone()),
            VariableProperties {
                owner: VariableOwner::Function(owner.clone()),
                accessed_in: HashSet::from([owner.clone()]),
                written_in: HashSet::from([owner.clone()]),
            },
        );
    }

    fn resolve_variable(&mut self, use_site: &Rc<Expression>, variable: &Ref<Variable>) {
        self.analysis.variable_resolution.insert(
            Ref::from(use_site),
            NamedNode::Variable(variable.clone()),
        );
    }

    fn lower(&self) -> Vec<(Ref<Function>, ControlFlowGraph)> {
        let (function_details, generator_details) =
            create_details_generators(&self.program, &self.analysis);
        let globals_access = GlobalVariableAccessGenerator::new(&self.analysis.variable_properties);
        let ctx = LoweringContext {
            analysis: &self.analysis,
            function_details: &function_details,
            generator_details: &generator_details,
            array_memory: &DefaultArrayMemoryManagement,
            globals_access: &globals_access,
            diagnostics: &self.diagnostics,
        };
        create_graphs_for_functions(&ctx, &self.program)
    }

    fn lower_main(&self) -> ControlFlowGraph {
        let main = self.main();
        self.lower()
            .into_iter()
            .find(|(function, _)| function == &main)
            .expect("main function was lowered")
            .1
    }
}

fn successor(cfg: &ControlFlowGraph, root: &IrTree, link_type: CfgLinkType) -> IrTree {
    cfg.link(root, link_type)
        .unwrap_or_else(|| panic!("expected {:?} link", link_type))
        .clone()
}

fn is_const(node: &IrTree, value: i64) -> bool {
    matches!(&**node, IrNode::Const(constant) if constant.value() == value)
}

/// Roots that are calls to the given label.
fn call_roots<'a>(cfg: &'a ControlFlowGraph, label: &str) -> Vec<&'a IrTree> {
    cfg.tree_roots
        .iter()
        .filter(|root| match &***root {
            IrNode::Call { address, .. } => {
                matches!(&**address, IrNode::MemoryLabel(l) if l == label)
            }
            _ => false,
        })
        .collect()
}

/// Roots reachable from the entry by following the edge maps.
fn reachable(cfg: &ControlFlowGraph) -> Vec<IrTree> {
    let mut seen: HashSet<NodeRef> = HashSet::new();
    let mut queue: Vec<IrTree> = cfg.entry_tree_root.iter().cloned().collect();
    let mut order = Vec::new();
    while let Some(root) = queue.pop() {
        if !seen.insert(NodeRef::from(&root)) {
            continue;
        }
        order.push(root.clone());
        for link_type in [
            CfgLinkType::Unconditional,
            CfgLinkType::ConditionalTrue,
            CfgLinkType::ConditionalFalse,
        ] {
            if let Some(target) = cfg.link(&root, link_type) {
                queue.push(target.clone());
            }
        }
    }
    order
}

fn is_decrement_call(root: &IrTree) -> bool {
    matches!(&**root, IrNode::Call { address, .. }
        if matches!(&**address, IrNode::MemoryLabel(l) if l == "_$array_ref_count_decrement"))
}

// ── statement lowering ──────────────────────────────────────────────────

#[test]
fn test_single_evaluation_links_to_return_point() {
    let fixture = Fixture::new(function("f", vec![evaluation(number(456))]));
    let cfg = fixture.lower_main();

    let entry = cfg.entry_tree_root.clone().expect("graph is not empty");
    assert!(is_const(&entry, 456));

    // The literal flows into the shared return point (a NoOp).
    let next = successor(&cfg, &entry, CfgLinkType::Unconditional);
    assert!(matches!(&*next, IrNode::NoOp));
    assert!(cfg.final_tree_roots().iter().all(|(root, _)| Rc::ptr_eq(root, &next)));
}

#[test]
fn test_conditional_statement_shape() {
    let condition = boolean(true);
    let fixture = Fixture::new(function(
        "f",
        vec![stmt(Statement::Conditional {
            condition: condition.clone(),
            action_when_true: vec![evaluation(number(10))],
            action_when_false: Some(vec![evaluation(number(20))]),
            span: None,
        })],
    ));
    let cfg = fixture.lower_main();

    let entry = cfg.entry_tree_root.clone().expect("graph is not empty");
    assert!(is_const(&entry, 1), "condition is lowered first");

    let when_true = successor(&cfg, &entry, CfgLinkType::ConditionalTrue);
    let when_false = successor(&cfg, &entry, CfgLinkType::ConditionalFalse);
    assert!(is_const(&when_true, 10));
    assert!(is_const(&when_false, 20));

    // Both branches join at the return point.
    let join_true = successor(&cfg, &when_true, CfgLinkType::Unconditional);
    let join_false = successor(&cfg, &when_false, CfgLinkType::Unconditional);
    assert!(Rc::ptr_eq(&join_true, &join_false));
}

/// An always-taken break: `while (false) { if (true) break }`
/// followed by `456`. The loop body's fallthrough loops back to the
/// condition, the break edge targets the loop's join node, and the join
/// continues into the `456` evaluation — which is not duplicated.
#[test]
fn test_loop_with_break_shape() {
    let fixture = Fixture::new(function(
        "f",
        vec![
            stmt(Statement::Loop {
                condition: boolean(false),
                action: vec![stmt(Statement::Conditional {
                    condition: boolean(true),
                    action_when_true: vec![stmt(Statement::LoopBreak { span: None })],
                    action_when_false: None,
                    span: None,
                })],
                span: None,
            }),
            evaluation(number(456)),
        ],
    ));
    let cfg = fixture.lower_main();

    let loop_condition = cfg.entry_tree_root.clone().expect("graph is not empty");
    assert!(is_const(&loop_condition, 0));

    let break_condition = successor(&cfg, &loop_condition, CfgLinkType::ConditionalTrue);
    assert!(is_const(&break_condition, 1));
    let join = successor(&cfg, &loop_condition, CfgLinkType::ConditionalFalse);
    assert!(matches!(&*join, IrNode::NoOp));

    // break → join; empty false branch → back to the condition.
    let break_target = successor(&cfg, &break_condition, CfgLinkType::ConditionalTrue);
    assert!(Rc::ptr_eq(&break_target, &join));
    let loop_back = successor(&cfg, &break_condition, CfgLinkType::ConditionalFalse);
    assert!(Rc::ptr_eq(&loop_back, &loop_condition));

    // The continuation appears exactly once, after the join.
    let continuation = successor(&cfg, &join, CfgLinkType::Unconditional);
    assert!(is_const(&continuation, 456));
    assert_eq!(
        cfg.tree_roots.iter().filter(|root| is_const(root, 456)).count(),
        1
    );
    assert!(!fixture.diagnostics.has_any_error());
}

#[test]
fn test_break_outside_loop_is_diagnosed_not_fatal() {
    let fixture = Fixture::new(function(
        "f",
        vec![stmt(Statement::LoopBreak { span: None }), evaluation(number(1))],
    ));
    let cfg = fixture.lower_main();

    assert!(
        fixture
            .diagnostics
            .reported()
            .contains(&Diagnostic::BreakOutsideOfLoop { span: None })
    );
    // The break is a no-op; the graph still exists.
    assert!(cfg.entry_tree_root.is_some());
}

#[test]
fn test_unreachable_statement_is_warned_and_still_lowered() {
    let fixture = Fixture::new(function(
        "f",
        vec![stmt(Statement::Loop {
            condition: boolean(true),
            action: vec![
                stmt(Statement::LoopBreak { span: None }),
                evaluation(number(7)),
            ],
            span: None,
        })],
    ));
    let cfg = fixture.lower_main();

    assert!(
        fixture
            .diagnostics
            .reported()
            .contains(&Diagnostic::UnreachableStatement { span: None })
    );
    // Lowered for structural completeness, but not linked from the entry.
    assert_eq!(
        cfg.tree_roots.iter().filter(|root| is_const(root, 7)).count(),
        1
    );
}

// ── array lifetime cleanup ──────────────────────────────────────────────

#[test]
fn test_array_local_gets_cleanup_on_scope_exit() {
    let array = local_variable("xs", Type::Array(Rc::new(Type::Number)));
    let mut fixture = Fixture::new(function(
        "f",
        vec![stmt(Statement::VariableDefinition {
            variable: array.clone(),
            span: None,
        })],
    ));
    fixture.own_variable(&array, &fixture.main());
    let cfg = fixture.lower_main();

    // Two cleanup copies exist (fall-through plus the return escape), but
    // only the fall-through one is reachable — nothing returns early.
    let decrements = call_roots(&cfg, "_$array_ref_count_decrement");
    assert_eq!(decrements.len(), 2);
    let reachable_decrements = reachable(&cfg)
        .iter()
        .filter(|root| is_decrement_call(root))
        .count();
    assert_eq!(reachable_decrements, 1);

    // Declaration zero-initializes the slot before anything can escape.
    let entry = cfg.entry_tree_root.clone().expect("graph is not empty");
    assert!(matches!(&*entry, IrNode::RegisterWrite(_, value) if is_const(value, 0)));
}

#[test]
fn test_early_return_duplicates_cleanup_path() {
    // { xs: [number]; if (c) { return unit }; }  — the return path and the
    // fall-through path each run their own copy of the cleanup.
    let array = local_variable("xs", Type::Array(Rc::new(Type::Number)));
    let mut fixture = Fixture::new(function(
        "f",
        vec![
            stmt(Statement::VariableDefinition {
                variable: array.clone(),
                span: None,
            }),
            stmt(Statement::Conditional {
                condition: boolean(true),
                action_when_true: vec![stmt(Statement::FunctionReturn {
                    value: Rc::new(Expression::UnitLiteral { span: None }),
                    span: None,
                })],
                action_when_false: None,
                span: None,
            }),
        ],
    ));
    fixture.own_variable(&array, &fixture.main());
    let cfg = fixture.lower_main();

    // Both copies are live now: one on the return path, one on the
    // fall-through path.
    let decrements = call_roots(&cfg, "_$array_ref_count_decrement");
    assert_eq!(decrements.len(), 2);
    let reachable_decrements = reachable(&cfg)
        .iter()
        .filter(|root| is_decrement_call(root))
        .count();
    assert_eq!(
        reachable_decrements, 2,
        "return exit and fall-through exit each run their own cleanup"
    );
}

// ── expression lowering ─────────────────────────────────────────────────

fn expression_fixture() -> (Fixture, Ref<Function>) {
    let fixture = Fixture::new(function("f", vec![]));
    let main = fixture.main();
    (fixture, main)
}

fn lower_expression(fixture: &Fixture, expression: &Rc<Expression>) -> ControlFlowGraph {
    let (function_details, generator_details) =
        create_details_generators(&fixture.program, &fixture.analysis);
    let globals_access = GlobalVariableAccessGenerator::new(&fixture.analysis.variable_properties);
    let ctx = LoweringContext {
        analysis: &fixture.analysis,
        function_details: &function_details,
        generator_details: &generator_details,
        array_memory: &DefaultArrayMemoryManagement,
        globals_access: &globals_access,
        diagnostics: &fixture.diagnostics,
    };
    create_graph_for_expression(&ctx, expression, None, &fixture.main())
}

#[test]
fn test_short_circuit_and_merges_conditionally() {
    let (mut fixture, main) = expression_fixture();
    let a = local_variable("a", Type::Boolean);
    let b = local_variable("b", Type::Boolean);
    fixture.own_variable(&a, &main);
    fixture.own_variable(&b, &main);

    let left = read("a");
    let right = read("b");
    fixture.resolve_variable(&left, &a);
    fixture.resolve_variable(&right, &b);
    let and = Rc::new(Expression::BinaryOperation {
        kind: crate::common::ast::BinaryOperationKind::And,
        left,
        right,
        span: None,
    });

    let cfg = lower_expression(&fixture, &and);

    // The left operand branches: true → evaluate right, false → constant 0.
    let entry = cfg.entry_tree_root.clone().expect("graph is not empty");
    assert!(matches!(&*entry, IrNode::RegisterRead(_)));
    let when_true = successor(&cfg, &entry, CfgLinkType::ConditionalTrue);
    let when_false = successor(&cfg, &entry, CfgLinkType::ConditionalFalse);

    let (IrNode::RegisterWrite(true_target, _), IrNode::RegisterWrite(false_target, false_value)) =
        (&*when_true, &*when_false)
    else {
        panic!("both branches must write the shared result register");
    };
    assert_eq!(true_target, false_target);
    assert!(is_const(false_value, 0), "`and` short-circuits to 0");

    // Both writers continue into the same result read.
    let continue_true = successor(&cfg, &when_true, CfgLinkType::Unconditional);
    let continue_false = successor(&cfg, &when_false, CfgLinkType::Unconditional);
    assert!(Rc::ptr_eq(&continue_true, &continue_false));
}

#[test]
fn test_call_invalidated_read_is_snapshotted() {
    // v + g(): g writes the global v, so v must be copied to a temporary
    // before the call and the sum must read the temporary.
    let (mut fixture, main) = expression_fixture();

    let callee = Ref::new(Function {
        name: "g".to_string(),
        parameters: vec![],
        return_type: Type::Number,
        implementation: Implementation::Foreign("g".to_string()),
        is_generator: false,
        body: vec![],
        span: None,
    });
    fixture.program.globals.push(Global::FunctionDefinition(callee.clone()));

    let global = local_variable("v", Type::Number);
    fixture.analysis.variable_properties.insert(
        NamedNode::Variable(global.clone()),
        VariableProperties {
            owner: VariableOwner::Global,
            accessed_in: HashSet::from([main.clone()]),
            written_in: HashSet::from([callee.clone()]),
        },
    );

    let v_read = read("v");
    fixture.resolve_variable(&v_read, &global);
    let call = Rc::new(Expression::FunctionCall {
        name: "g".to_string(),
        arguments: vec![],
        span: None,
    });
    fixture
        .analysis
        .call_resolution
        .insert(Ref::from(&call), callee.clone());
    fixture
        .analysis
        .call_graph
        .insert(main.clone(), HashSet::from([callee]));

    let sum = Rc::new(Expression::BinaryOperation {
        kind: crate::common::ast::BinaryOperationKind::Add,
        left: v_read,
        right: call,
        span: None,
    });

    let cfg = lower_expression(&fixture, &sum);

    // Entry snapshots the global into a register before the call.
    let entry = cfg.entry_tree_root.clone().expect("graph is not empty");
    let IrNode::RegisterWrite(temporary, snapshot) = &*entry else {
        panic!("expected the snapshot write first, got {:?}", entry);
    };
    assert!(matches!(&**snapshot, IrNode::MemoryRead(_)));

    // The final sum reads the temporary, not the (possibly overwritten)
    // global.
    let sum_root = cfg
        .tree_roots
        .iter()
        .find(|root| matches!(&***root, IrNode::Add(..)))
        .expect("sum tree exists");
    let IrNode::Add(left, _) = &**sum_root else {
        unreachable!()
    };
    assert!(matches!(&**left, IrNode::RegisterRead(register) if register == temporary));

    // And the call comes after the snapshot, before the sum.
    assert_eq!(call_roots(&cfg, "g").len(), 1);
}

// ── foreach over a generator ────────────────────────────────────────────

#[test]
fn test_foreach_lowers_to_init_resume_finalize() {
    let receiving = local_variable("x", Type::Number);
    let generator_call = Rc::new(Expression::FunctionCall {
        name: "g".to_string(),
        arguments: vec![],
        span: None,
    });
    let foreach = stmt(Statement::ForeachLoop {
        receiving_variable: receiving.clone(),
        generator_call: generator_call.clone(),
        action: vec![evaluation(number(1))],
        span: None,
    });

    let mut fixture = Fixture::new(function("f", vec![foreach]));
    let main = fixture.main();
    fixture.own_variable(&receiving, &main);

    let generator = Ref::new(Function {
        name: "g".to_string(),
        parameters: vec![],
        return_type: Type::Number,
        implementation: Implementation::Foreign("g".to_string()),
        is_generator: true,
        body: vec![],
        span: None,
    });
    fixture
        .program
        .globals
        .push(Global::FunctionDefinition(generator.clone()));
    fixture
        .analysis
        .call_resolution
        .insert(Ref::from(&generator_call), generator);

    let cfg = fixture.lower_main();

    assert_eq!(call_roots(&cfg, "g_init").len(), 1, "one init call");
    assert_eq!(call_roots(&cfg, "g_resume").len(), 1, "one resume call");
    // Finalize exists twice: once after the loop, once on the return
    // escape path — but only the loop-exit one is reachable here.
    assert_eq!(call_roots(&cfg, "g_finalize").len(), 2);
    let reachable_finalizes = reachable(&cfg)
        .iter()
        .filter(|root| {
            matches!(&***root, IrNode::Call { address, .. }
                if matches!(&**address, IrNode::MemoryLabel(l) if l == "g_finalize"))
        })
        .count();
    assert_eq!(reachable_finalizes, 1, "only the loop-exit finalize is live");

    // The has-more check branches: body on true, finalize side on false.
    let has_more_check = cfg
        .tree_roots
        .iter()
        .find(|root| matches!(&***root, IrNode::NotEquals(..)))
        .expect("resume flag check exists");
    assert!(cfg.link(has_more_check, CfgLinkType::ConditionalTrue).is_some());
    assert!(cfg.link(has_more_check, CfgLinkType::ConditionalFalse).is_some());
}

// ── prologue/epilogue attachment ────────────────────────────────────────

#[test]
fn test_attach_prologue_and_epilogue_completes_dangling_branches() {
    use crate::ir::builder::ControlFlowGraphBuilder;

    // Body: a condition with only its true side linked.
    let condition = IrNode::register_read(crate::ir::register::Register::fresh());
    let when_true = IrNode::constant(1);
    let mut body = ControlFlowGraphBuilder::new();
    body.add_link(None, condition.clone(), true);
    body.add_link(
        Some((condition.clone(), CfgLinkType::ConditionalTrue)),
        when_true.clone(),
        true,
    );

    let mut prologue = ControlFlowGraphBuilder::new();
    let prologue_node = IrNode::no_op();
    prologue.add_single_tree(prologue_node.clone());
    let mut epilogue = ControlFlowGraphBuilder::new();
    let epilogue_node = Rc::new(IrNode::Return {
        used_registers: vec![],
    });
    epilogue.add_single_tree(epilogue_node.clone());

    let attached =
        attach_prologue_and_epilogue(&body.build(), &prologue.build(), &epilogue.build());

    // Prologue leads into the body's entry.
    assert!(
        attached
            .entry_tree_root
            .as_ref()
            .is_some_and(|entry| Rc::ptr_eq(entry, &prologue_node))
    );
    let into_body = successor(&attached, &prologue_node, CfgLinkType::Unconditional);
    assert!(Rc::ptr_eq(&into_body, &condition));

    // Both the final root and the dangling false branch reach the
    // epilogue.
    let from_true = successor(&attached, &when_true, CfgLinkType::Unconditional);
    assert!(Rc::ptr_eq(&from_true, &epilogue_node));
    let from_false = successor(&attached, &condition, CfgLinkType::ConditionalFalse);
    assert!(Rc::ptr_eq(&from_false, &epilogue_node));

    // The epilogue is the only final root.
    let finals = attached.final_tree_roots();
    assert_eq!(finals.len(), 1);
    assert!(Rc::ptr_eq(&finals[0].0, &epilogue_node));

    // No root ended up with both edge kinds.
    for root in &attached.tree_roots {
        let key = NodeRef::from(root);
        let unconditional = attached.unconditional_links.contains_key(&key);
        let conditional = attached.conditional_true_links.contains_key(&key)
            || attached.conditional_false_links.contains_key(&key);
        assert!(!(unconditional && conditional));
    }
}
