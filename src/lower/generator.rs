//! Generator details: lowering coroutines into three ordinary functions.
//!
//! A generator `g` compiles to `g_init`, `g_resume` and `g_finalize`:
//!
//! - `g_init(args…)` mallocs a heap frame (locals plus one slot per nested
//!   foreach loop), copies the arguments in, zeroes the nested-loop slots
//!   and returns the frame pointer as the generator id;
//! - `g_resume(frame, state)` installs RBP at the end of the heap frame,
//!   then either enters the body (state 0) or jumps straight to the saved
//!   resume point. A `yield` calls a local `.yield` label: the return
//!   address it pushes *is* the next resume state, handed back in RDX with
//!   the yielded value in RAX. Falling off the body returns RDX = 0;
//! - `g_finalize(frame)` finalizes still-running nested foreach generators
//!   and frees the frame.
//!
//! The state machine is explicit and fully synchronous — no host coroutine
//! runtime is involved, and a suspended generator is just a heap frame plus
//! a saved code address.

use crate::common::ast::{NamedNode, Parameter, Statement, Type, Variable, VariableKind};
use crate::common::reference::Ref;
use crate::ir::builder::ControlFlowGraphBuilder;
use crate::ir::cfg::{CfgLinkType, ControlFlowGraph};
use crate::ir::constant::Constant;
use crate::ir::node::{IrNode, IrTree};
use crate::ir::register::Register;
use crate::lower::function::{
    ARGUMENT_REGISTERS, CALLEE_SAVED_REGISTERS_WITHOUT_RSP_AND_RBP, CALLER_SAVED_REGISTERS,
    DefaultFunctionDetailsGenerator, ForeignFunctionDetailsGenerator, FunctionCallIntermediateForm,
    FunctionDetailsGenerator, MEMORY_UNIT_SIZE, SysV64CallingConvention, VariableAccessGenerator,
    VariableLocationType,
};
use std::rc::Rc;

/// Local label of the yield trampoline inside `g_resume`.
const YIELD_LABEL: &str = ".yield";

pub trait GeneratorDetailsGenerator: VariableAccessGenerator {
    // Caller side.
    fn gen_init_call(&self, args: Vec<IrTree>) -> FunctionCallIntermediateForm;
    fn gen_resume_call(&self, frame_pointer: IrTree, saved_state: IrTree)
    -> FunctionCallIntermediateForm;
    fn gen_finalize_call(&self, frame_pointer: IrTree) -> FunctionCallIntermediateForm;

    // Callee side.
    fn gen_init(&self) -> ControlFlowGraph;
    fn gen_resume(&self, main_body: &ControlFlowGraph) -> ControlFlowGraph;
    fn gen_yield(&self, value: IrTree) -> ControlFlowGraph;
    fn gen_finalize(&self) -> ControlFlowGraph;

    /// Frame slot holding the id of the generator spawned by a foreach
    /// loop nested in this generator; `None` if the loop is not nested
    /// here. The slot replaces a register so the id survives suspension.
    fn nested_foreach_frame_pointer_address(&self, foreach_loop: &Ref<Statement>)
    -> Option<IrTree>;

    fn init_details(&self) -> Rc<dyn FunctionDetailsGenerator>;
    fn resume_details(&self) -> Rc<dyn FunctionDetailsGenerator>;
    fn finalize_details(&self) -> Rc<dyn FunctionDetailsGenerator>;
}

pub struct DefaultGeneratorDetailsGenerator {
    parameters: Vec<NamedNode>,
    resume_identifier: String,
    /// Nested foreach loops paired with the finalize label of the
    /// generator each one iterates.
    nested_foreach_loops: Vec<(Ref<Statement>, String)>,

    inner: Rc<DefaultFunctionDetailsGenerator>,
    init: Rc<DefaultFunctionDetailsGenerator>,
    finalize: Rc<DefaultFunctionDetailsGenerator>,
    init_result_variable: NamedNode,
    finalize_frame_parameter: NamedNode,
    frame_size: Constant,
}

impl DefaultGeneratorDetailsGenerator {
    pub fn new(
        parameters: Vec<NamedNode>,
        identifier: &str,
        depth: u64,
        variables: Vec<(NamedNode, VariableLocationType)>,
        display_address: IrTree,
        nested_foreach_loops: Vec<(Ref<Statement>, String)>,
    ) -> Self {
        // Parameters live in the heap frame so the body can be resumed.
        let mut inner_variables = variables;
        for parameter in &parameters {
            if !inner_variables.iter().any(|(node, _)| node == parameter) {
                inner_variables.push((parameter.clone(), VariableLocationType::Memory));
            } else {
                for entry in &mut inner_variables {
                    if &entry.0 == parameter {
                        entry.1 = VariableLocationType::Memory;
                    }
                }
            }
        }
        let inner = Rc::new(DefaultFunctionDetailsGenerator::new(
            parameters.clone(),
            None,
            // Never called through this generator; resume has its own entry.
            String::new(),
            depth,
            inner_variables,
            display_address.clone(),
        ));

        let init_result_variable = NamedNode::Variable(Ref::new(Variable {
            kind: VariableKind::Variable,
            name: format!("{identifier}$frame"),
            type_: Type::Number,
            value: None,
            span: None,
        }));
        let mut init_variables: Vec<(NamedNode, VariableLocationType)> = parameters
            .iter()
            .map(|parameter| (parameter.clone(), VariableLocationType::Register))
            .collect();
        init_variables.push((init_result_variable.clone(), VariableLocationType::Register));
        let init = Rc::new(DefaultFunctionDetailsGenerator::new(
            parameters.clone(),
            Some(init_result_variable.clone()),
            format!("{identifier}_init"),
            depth,
            init_variables,
            display_address.clone(),
        ));

        let finalize_frame_parameter = NamedNode::Parameter(Ref::new(Parameter {
            name: "frame_pointer".to_string(),
            type_: Type::Number,
            default_value: None,
            span: None,
        }));
        let finalize = Rc::new(DefaultFunctionDetailsGenerator::new(
            vec![finalize_frame_parameter.clone()],
            None,
            format!("{identifier}_finalize"),
            depth,
            vec![(
                finalize_frame_parameter.clone(),
                VariableLocationType::Register,
            )],
            display_address,
        ));

        let frame_size = Constant::sum(
            Constant::Fixed((nested_foreach_loops.len() as u64 * MEMORY_UNIT_SIZE) as i64),
            inner.required_memory_below_rbp(),
        );

        DefaultGeneratorDetailsGenerator {
            parameters,
            resume_identifier: format!("{identifier}_resume"),
            nested_foreach_loops,
            inner,
            init,
            finalize,
            init_result_variable,
            finalize_frame_parameter,
            frame_size,
        }
    }
}

impl VariableAccessGenerator for DefaultGeneratorDetailsGenerator {
    fn gen_read(&self, named_node: &NamedNode, is_direct: bool) -> IrTree {
        self.inner.gen_read(named_node, is_direct)
    }

    fn gen_write(&self, named_node: &NamedNode, value: IrTree, is_direct: bool) -> IrTree {
        self.inner.gen_write(named_node, value, is_direct)
    }
}

impl GeneratorDetailsGenerator for DefaultGeneratorDetailsGenerator {
    fn gen_init_call(&self, args: Vec<IrTree>) -> FunctionCallIntermediateForm {
        self.init.gen_call(args)
    }

    fn gen_resume_call(
        &self,
        frame_pointer: IrTree,
        saved_state: IrTree,
    ) -> FunctionCallIntermediateForm {
        SysV64CallingConvention::gen_call(
            &self.resume_identifier,
            vec![frame_pointer, saved_state],
            2,
        )
    }

    fn gen_finalize_call(&self, frame_pointer: IrTree) -> FunctionCallIntermediateForm {
        self.finalize.gen_call(vec![frame_pointer])
    }

    fn gen_init(&self) -> ControlFlowGraph {
        let mut builder = ControlFlowGraphBuilder::new();
        builder.merge_unconditionally(&self.init.gen_prologue());

        // The "stack frame" lives on the heap so it survives suspension.
        let malloc_call =
            ForeignFunctionDetailsGenerator::new("malloc", 1).gen_call(vec![IrNode::const_of(
                self.frame_size.clone(),
            )]);
        builder.merge_unconditionally(&malloc_call.call_graph);
        builder.add_single_tree(self.init.gen_write(
            &self.init_result_variable,
            malloc_call.result.expect("malloc returns a value"),
            true,
        ));

        // The frame grows downward from its end, like a stack frame.
        let custom_base = Register::RCX;
        builder.add_single_tree(IrNode::register_write(
            custom_base,
            IrNode::add(
                self.init.gen_read(&self.init_result_variable, true),
                IrNode::const_of(self.frame_size.clone()),
            ),
        ));

        for parameter in &self.parameters {
            builder.add_single_tree(self.inner.gen_direct_write_with_custom_base(
                parameter,
                self.init.gen_read(parameter, true),
                custom_base,
            ));
        }

        // A zero slot marks "no nested generator running here".
        for (foreach_loop, _) in &self.nested_foreach_loops {
            let address = self
                .nested_foreach_frame_pointer_address(foreach_loop)
                .expect("loop is nested in this generator");
            // Address is RBP-relative; during init the frame is addressed
            // through the custom base instead.
            let address = substitute_rbp(&address, custom_base);
            builder.add_single_tree(IrNode::memory_write(address, IrNode::constant(0)));
        }

        builder.merge_unconditionally(&self.init.gen_epilogue());
        builder.build()
    }

    fn gen_resume(&self, main_body: &ControlFlowGraph) -> ControlFlowGraph {
        let mut builder = ControlFlowGraphBuilder::new();
        let frame_pointer_register = ARGUMENT_REGISTERS[0];
        let saved_state_register = ARGUMENT_REGISTERS[1];

        // Prologue: RBP points at the end of the heap frame.
        builder.add_single_tree(IrNode::stack_push(IrNode::register_read(Register::RBP)));
        builder.add_single_tree(IrNode::register_write(
            Register::RBP,
            IrNode::add(
                IrNode::register_read(frame_pointer_register),
                IrNode::const_of(self.frame_size.clone()),
            ),
        ));
        builder.merge_unconditionally(&self.inner.gen_display_update());
        builder.merge_unconditionally(&self.inner.gen_callee_saved_registers_backup());

        // State 0 starts the body; anything else is a resume address.
        builder.add_single_tree(IrNode::equals(
            IrNode::register_read(saved_state_register),
            IrNode::constant(0),
        ));
        let mut dispatch = ControlFlowGraphBuilder::new();
        dispatch.add_single_tree(Rc::new(IrNode::JumpToRegister(saved_state_register)));
        builder.merge_conditionally(main_body, &dispatch.build());

        // Epilogue: RDX = 0 signals exhaustion.
        builder.add_single_tree(IrNode::register_write(Register::RDX, IrNode::constant(0)));

        let restore = self.inner.gen_callee_saved_registers_restore();
        let restore_entry = restore
            .entry_tree_root
            .clone()
            .expect("restore graph is never empty");
        builder.merge_unconditionally(&restore);
        builder.merge_unconditionally(&self.inner.gen_display_restore());
        builder.add_single_tree(IrNode::register_write(Register::RBP, IrNode::stack_pop()));
        let mut used: Vec<Register> = vec![Register::RAX, Register::RDX];
        used.extend(CALLEE_SAVED_REGISTERS_WITHOUT_RSP_AND_RBP);
        builder.add_single_tree(Rc::new(IrNode::Return {
            used_registers: used,
        }));

        // The yield trampoline: the return address pushed by the call in
        // gen_yield becomes the next resume state.
        let yield_target = IrNode::labeled(
            YIELD_LABEL,
            IrNode::register_write(Register::RDX, IrNode::stack_pop()),
        );
        let mut yield_graph = ControlFlowGraphBuilder::new();
        yield_graph.add_single_tree(yield_target.clone());
        builder.add_all_from(&yield_graph.build(), false);
        builder.add_link(
            Some((yield_target, CfgLinkType::Unconditional)),
            restore_entry,
            false,
        );

        builder.build()
    }

    fn gen_yield(&self, value: IrTree) -> ControlFlowGraph {
        let mut builder = ControlFlowGraphBuilder::new();
        builder.add_single_tree(IrNode::register_write(Register::RAX, value));
        let mut defined: Vec<Register> = CALLER_SAVED_REGISTERS.to_vec();
        defined.extend(CALLEE_SAVED_REGISTERS_WITHOUT_RSP_AND_RBP);
        builder.add_single_tree(Rc::new(IrNode::Call {
            address: IrNode::memory_label(YIELD_LABEL),
            used_registers: vec![Register::RAX],
            defined_registers: defined,
        }));
        builder.build()
    }

    fn gen_finalize(&self) -> ControlFlowGraph {
        let mut builder = ControlFlowGraphBuilder::new();
        builder.merge_unconditionally(&self.finalize.gen_prologue());

        // A running nested generator left a nonzero frame pointer in its
        // slot; finalize it recursively.
        let frame = self.finalize.gen_read(&self.finalize_frame_parameter, true);
        for (foreach_loop, nested_finalize_label) in &self.nested_foreach_loops {
            let slot = self
                .nested_foreach_frame_pointer_address(foreach_loop)
                .expect("loop is nested in this generator");
            // The frame being finalized is not the active one, so the slot
            // is addressed from the frame argument, not RBP.
            let slot = substitute_rbp_with_tree(
                &slot,
                IrNode::add(frame.clone(), IrNode::const_of(self.frame_size.clone())),
            );
            let check = IrNode::equals(IrNode::memory_read(slot.clone()), IrNode::constant(0));
            builder.add_single_tree(check.clone());
            let call = ForeignFunctionDetailsGenerator::new(nested_finalize_label.clone(), 0)
                .gen_call(vec![IrNode::memory_read(slot)]);
            builder.add_all_from(&call.call_graph, false);
            builder.add_link(
                Some((check, CfgLinkType::ConditionalFalse)),
                call.call_graph
                    .entry_tree_root
                    .clone()
                    .expect("finalize call graph is never empty"),
                false,
            );
        }

        builder.merge_unconditionally(
            &ForeignFunctionDetailsGenerator::new("free", 0)
                .gen_call(vec![frame])
                .call_graph,
        );
        builder.merge_unconditionally(&self.finalize.gen_epilogue());
        builder.build()
    }

    fn nested_foreach_frame_pointer_address(
        &self,
        foreach_loop: &Ref<Statement>,
    ) -> Option<IrTree> {
        let index = self
            .nested_foreach_loops
            .iter()
            .position(|(nested, _)| nested == foreach_loop)?;
        Some(Rc::new(IrNode::Subtract(
            IrNode::register_read(Register::RBP),
            IrNode::const_of(Constant::sum(
                Constant::Fixed(((index as u64 + 1) * MEMORY_UNIT_SIZE) as i64),
                self.inner.required_memory_below_rbp(),
            )),
        )))
    }

    fn init_details(&self) -> Rc<dyn FunctionDetailsGenerator> {
        self.init.clone()
    }

    fn resume_details(&self) -> Rc<dyn FunctionDetailsGenerator> {
        self.inner.clone()
    }

    fn finalize_details(&self) -> Rc<dyn FunctionDetailsGenerator> {
        self.finalize.clone()
    }
}

/// Rewrite RBP reads in an address tree to another register.
fn substitute_rbp(address: &IrTree, base: Register) -> IrTree {
    substitute_rbp_with_tree(address, IrNode::register_read(base))
}

/// Rewrite RBP reads in an address tree to an arbitrary base tree.
fn substitute_rbp_with_tree(address: &IrTree, base: IrTree) -> IrTree {
    match &**address {
        IrNode::RegisterRead(register) if *register == Register::RBP => base,
        IrNode::Add(left, right) => IrNode::add(
            substitute_rbp_with_tree(left, base.clone()),
            substitute_rbp_with_tree(right, base),
        ),
        IrNode::Subtract(left, right) => Rc::new(IrNode::Subtract(
            substitute_rbp_with_tree(left, base.clone()),
            substitute_rbp_with_tree(right, base),
        )),
        IrNode::MemoryRead(inner) => IrNode::memory_read(substitute_rbp_with_tree(inner, base)),
        _ => address.clone(),
    }
}

/// Details generator for foreign generators: the three entry points exist
/// as extern labels.
pub struct ForeignGeneratorDetailsGenerator {
    init: Rc<ForeignFunctionDetailsGenerator>,
    resume: Rc<ForeignFunctionDetailsGenerator>,
    finalize: Rc<ForeignFunctionDetailsGenerator>,
}

impl ForeignGeneratorDetailsGenerator {
    pub fn new(init_label: &str, resume_label: &str, finalize_label: &str) -> Self {
        ForeignGeneratorDetailsGenerator {
            init: Rc::new(ForeignFunctionDetailsGenerator::new(init_label, 1)),
            resume: Rc::new(ForeignFunctionDetailsGenerator::new(resume_label, 2)),
            finalize: Rc::new(ForeignFunctionDetailsGenerator::new(finalize_label, 0)),
        }
    }
}

impl VariableAccessGenerator for ForeignGeneratorDetailsGenerator {
    fn gen_read(&self, _named_node: &NamedNode, _is_direct: bool) -> IrTree {
        panic!("foreign generators own no variables")
    }

    fn gen_write(&self, _named_node: &NamedNode, _value: IrTree, _is_direct: bool) -> IrTree {
        panic!("foreign generators own no variables")
    }
}

impl GeneratorDetailsGenerator for ForeignGeneratorDetailsGenerator {
    fn gen_init_call(&self, args: Vec<IrTree>) -> FunctionCallIntermediateForm {
        self.init.gen_call(args)
    }

    fn gen_resume_call(
        &self,
        frame_pointer: IrTree,
        saved_state: IrTree,
    ) -> FunctionCallIntermediateForm {
        self.resume.gen_call(vec![frame_pointer, saved_state])
    }

    fn gen_finalize_call(&self, frame_pointer: IrTree) -> FunctionCallIntermediateForm {
        self.finalize.gen_call(vec![frame_pointer])
    }

    fn gen_init(&self) -> ControlFlowGraph {
        panic!("foreign generators are not lowered here")
    }

    fn gen_resume(&self, _main_body: &ControlFlowGraph) -> ControlFlowGraph {
        panic!("foreign generators are not lowered here")
    }

    fn gen_yield(&self, _value: IrTree) -> ControlFlowGraph {
        panic!("foreign generators are not lowered here")
    }

    fn gen_finalize(&self) -> ControlFlowGraph {
        panic!("foreign generators are not lowered here")
    }

    fn nested_foreach_frame_pointer_address(
        &self,
        _foreach_loop: &Ref<Statement>,
    ) -> Option<IrTree> {
        None
    }

    fn init_details(&self) -> Rc<dyn FunctionDetailsGenerator> {
        self.init.clone()
    }

    fn resume_details(&self) -> Rc<dyn FunctionDetailsGenerator> {
        self.resume.clone()
    }

    fn finalize_details(&self) -> Rc<dyn FunctionDetailsGenerator> {
        self.finalize.clone()
    }
}
