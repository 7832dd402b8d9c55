//! Function details: calling convention, prologue/epilogue, frame layout
//! and variable access.
//!
//! A [`FunctionDetailsGenerator`] owns everything callers and the lowered
//! body need to know about one function: how to call it, how its frame is
//! laid out, and how to read or write its variables — directly from its own
//! frame and registers, or through the *display* (a global array of
//! per-nesting-depth frame pointers) from nested functions.

use crate::common::ast::NamedNode;
use crate::ir::builder::ControlFlowGraphBuilder;
use crate::ir::cfg::{CfgLinkType, ControlFlowGraph};
use crate::ir::constant::{Constant, ConstantPlaceholder};
use crate::ir::node::{IrNode, IrTree};
use crate::ir::register::Register;
use std::collections::HashMap;
use std::rc::Rc;

/// Bytes per machine word; also the size of every variable.
pub const MEMORY_UNIT_SIZE: u64 = 8;

/// Required RSP alignment at call boundaries.
pub const STACK_ALIGNMENT_IN_BYTES: i64 = 16;

/// Label of the display array in static memory.
pub const DISPLAY_LABEL_IN_MEMORY: &str = "display";

/// Argument registers, in parameter order; further arguments go on the
/// stack in reverse order.
pub const ARGUMENT_REGISTERS: [Register; 6] = [
    Register::RDI,
    Register::RSI,
    Register::RDX,
    Register::RCX,
    Register::R8,
    Register::R9,
];

pub const CALLER_SAVED_REGISTERS: [Register; 9] = [
    Register::RAX,
    Register::RCX,
    Register::RDX,
    Register::RSI,
    Register::RDI,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
];

pub const CALLEE_SAVED_REGISTERS_WITHOUT_RSP_AND_RBP: [Register; 5] = [
    Register::RBX,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
];

/// Where a variable lives within its owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VariableLocationType {
    Memory,
    Register,
}

/// Reads and writes of named variables, resolved against some owner's
/// storage. `is_direct` tells whether the access comes from the owner
/// itself or from a nested function (which must go through the display).
pub trait VariableAccessGenerator {
    fn gen_read(&self, named_node: &NamedNode, is_direct: bool) -> IrTree;

    fn gen_write(&self, named_node: &NamedNode, value: IrTree, is_direct: bool) -> IrTree;
}

/// A call lowered to a CFG plus the nodes reading its results.
pub struct FunctionCallIntermediateForm {
    pub call_graph: ControlFlowGraph,
    /// Primary result (RAX), if the callee returns one.
    pub result: Option<IrTree>,
    /// Secondary result (RDX); generators' resume returns two values.
    pub second_result: Option<IrTree>,
}

pub trait FunctionDetailsGenerator: VariableAccessGenerator {
    /// Caller side, for both normal functions and generator entries.
    fn gen_call(&self, args: Vec<IrTree>) -> FunctionCallIntermediateForm;

    /// Callee side of a normal function.
    fn gen_prologue(&self) -> ControlFlowGraph;
    fn gen_epilogue(&self) -> ControlFlowGraph;

    /// Offset of the spill region below RBP, after the local variables.
    fn spilled_registers_region_offset(&self) -> u64;

    /// Placeholder for the spill-region size, settled after allocation.
    fn spilled_registers_region_size(&self) -> ConstantPlaceholder;

    /// The function's label in the emitted code.
    fn identifier(&self) -> &str;
}

/// The shared caller-side calling convention: first arguments in
/// [`ARGUMENT_REGISTERS`], the rest pushed in reverse order and popped by
/// the caller afterwards; results in RAX (and RDX for the second).
pub struct SysV64CallingConvention;

impl SysV64CallingConvention {
    pub fn gen_call(
        target_label: &str,
        args: Vec<IrTree>,
        returned_values_count: u8,
    ) -> FunctionCallIntermediateForm {
        let mut builder = ControlFlowGraphBuilder::new();

        let register_args = args.len().min(ARGUMENT_REGISTERS.len());
        let mut used_registers: Vec<Register> = Vec::new();
        for (arg, register) in args.iter().take(register_args).zip(ARGUMENT_REGISTERS) {
            builder.add_links_from_all_final_roots(
                CfgLinkType::Unconditional,
                IrNode::register_write(register, arg.clone()),
            );
            used_registers.push(register);
        }

        let mut pushed_to_stack = 0i64;
        for arg in args.iter().skip(register_args).rev() {
            builder.add_links_from_all_final_roots(
                CfgLinkType::Unconditional,
                IrNode::stack_push(arg.clone()),
            );
            pushed_to_stack += 1;
        }

        builder.add_links_from_all_final_roots(
            CfgLinkType::Unconditional,
            std::rc::Rc::new(IrNode::Call {
                address: IrNode::memory_label(target_label),
                used_registers,
                defined_registers: CALLER_SAVED_REGISTERS.to_vec(),
            }),
        );

        // Abandon the arguments that went through the stack.
        if pushed_to_stack > 0 {
            builder.add_links_from_all_final_roots(
                CfgLinkType::Unconditional,
                IrNode::register_write(
                    Register::RSP,
                    IrNode::add(
                        IrNode::register_read(Register::RSP),
                        IrNode::constant(pushed_to_stack * MEMORY_UNIT_SIZE as i64),
                    ),
                ),
            );
        }

        FunctionCallIntermediateForm {
            call_graph: builder.build(),
            result: (returned_values_count >= 1).then(|| IrNode::register_read(Register::RAX)),
            second_result: (returned_values_count >= 2)
                .then(|| IrNode::register_read(Register::RDX)),
        }
    }
}

/// Details generator for locally implemented functions.
pub struct DefaultFunctionDetailsGenerator {
    parameters: Vec<NamedNode>,
    variable_to_store_function_result: Option<NamedNode>,
    identifier: String,
    depth: u64,
    variables_location_types: HashMap<NamedNode, VariableLocationType>,
    display_address: IrTree,

    variables_stack_offsets: HashMap<NamedNode, u64>,
    variables_registers: HashMap<NamedNode, Register>,
    variables_region_size: u64,
    previous_display_entry_register: Register,
    callee_saved_backup_registers: Vec<Register>,
    spilled_registers_region_size: ConstantPlaceholder,
}

impl DefaultFunctionDetailsGenerator {
    /// `variables` lists every variable and parameter owned by the
    /// function together with its storage class, in a stable order that
    /// fixes the frame layout.
    pub fn new(
        parameters: Vec<NamedNode>,
        variable_to_store_function_result: Option<NamedNode>,
        identifier: String,
        depth: u64,
        variables: Vec<(NamedNode, VariableLocationType)>,
        display_address: IrTree,
    ) -> Self {
        let mut variables_stack_offsets = HashMap::new();
        let mut variables_registers = HashMap::new();
        let mut variables_region_size = 0u64;
        let mut variables_location_types = HashMap::new();

        for (variable, location_type) in variables {
            match location_type {
                VariableLocationType::Memory => {
                    variables_region_size += MEMORY_UNIT_SIZE;
                    variables_stack_offsets.insert(variable.clone(), variables_region_size);
                }
                VariableLocationType::Register => {
                    variables_registers.insert(variable.clone(), Register::fresh());
                }
            }
            variables_location_types.insert(variable, location_type);
        }

        DefaultFunctionDetailsGenerator {
            parameters,
            variable_to_store_function_result,
            identifier,
            depth,
            variables_location_types,
            display_address,
            variables_stack_offsets,
            variables_registers,
            variables_region_size,
            previous_display_entry_register: Register::fresh(),
            callee_saved_backup_registers: CALLEE_SAVED_REGISTERS_WITHOUT_RSP_AND_RBP
                .iter()
                .map(|_| Register::fresh())
                .collect(),
            spilled_registers_region_size: ConstantPlaceholder::new(),
        }
    }

    /// Everything the frame reserves below RBP: locals plus the (not yet
    /// settled) spill region.
    pub fn required_memory_below_rbp(&self) -> Constant {
        Constant::sum(
            Constant::Fixed(self.variables_region_size as i64),
            Constant::Placeholder(self.spilled_registers_region_size.clone()),
        )
    }

    fn display_element_address(&self) -> IrTree {
        IrNode::add(
            self.display_address.clone(),
            IrNode::constant((MEMORY_UNIT_SIZE * self.depth) as i64),
        )
    }

    /// Save the previous display entry for this depth and install RBP.
    pub fn gen_display_update(&self) -> ControlFlowGraph {
        let mut builder = ControlFlowGraphBuilder::new();
        builder.add_links_from_all_final_roots(
            CfgLinkType::Unconditional,
            IrNode::register_write(
                self.previous_display_entry_register,
                IrNode::memory_read(self.display_element_address()),
            ),
        );
        builder.add_links_from_all_final_roots(
            CfgLinkType::Unconditional,
            IrNode::memory_write(
                self.display_element_address(),
                IrNode::register_read(Register::RBP),
            ),
        );
        builder.build()
    }

    pub fn gen_display_restore(&self) -> ControlFlowGraph {
        let mut builder = ControlFlowGraphBuilder::new();
        builder.add_links_from_all_final_roots(
            CfgLinkType::Unconditional,
            IrNode::memory_write(
                self.display_element_address(),
                IrNode::register_read(self.previous_display_entry_register),
            ),
        );
        builder.build()
    }

    /// Callee-saved registers are backed up into virtual registers: if the
    /// allocator keeps them there, the moves coalesce away.
    pub fn gen_callee_saved_registers_backup(&self) -> ControlFlowGraph {
        let mut builder = ControlFlowGraphBuilder::new();
        for (hardware, backup) in
            CALLEE_SAVED_REGISTERS_WITHOUT_RSP_AND_RBP.iter().zip(&self.callee_saved_backup_registers)
        {
            builder.add_links_from_all_final_roots(
                CfgLinkType::Unconditional,
                IrNode::register_write(*backup, IrNode::register_read(*hardware)),
            );
        }
        builder.build()
    }

    pub fn gen_callee_saved_registers_restore(&self) -> ControlFlowGraph {
        let mut builder = ControlFlowGraphBuilder::new();
        for (hardware, backup) in
            CALLEE_SAVED_REGISTERS_WITHOUT_RSP_AND_RBP.iter().zip(&self.callee_saved_backup_registers)
        {
            builder.add_links_from_all_final_roots(
                CfgLinkType::Unconditional,
                IrNode::register_write(*hardware, IrNode::register_read(*backup)),
            );
        }
        builder.build()
    }

    fn gen_access(
        &self,
        named_node: &NamedNode,
        is_direct: bool,
        base_register: Register,
        make_register_access: &dyn Fn(Register) -> IrTree,
        make_memory_access: &dyn Fn(IrTree) -> IrTree,
    ) -> IrTree {
        let location_type = self.variables_location_types[named_node];
        if is_direct {
            match location_type {
                VariableLocationType::Memory => make_memory_access(Rc::new(IrNode::Subtract(
                    IrNode::register_read(base_register),
                    IrNode::constant(self.variables_stack_offsets[named_node] as i64),
                ))),
                VariableLocationType::Register => {
                    make_register_access(self.variables_registers[named_node])
                }
            }
        } else {
            if location_type == VariableLocationType::Register {
                panic!(
                    "indirect access to register-resident variable '{}'",
                    named_node.name()
                );
            }
            make_memory_access(Rc::new(IrNode::Subtract(
                IrNode::memory_read(self.display_element_address()),
                IrNode::constant(self.variables_stack_offsets[named_node] as i64),
            )))
        }
    }

    /// Direct access with a base other than RBP; generator init writes the
    /// heap frame through this.
    pub fn gen_direct_read_with_custom_base(
        &self,
        named_node: &NamedNode,
        base_register: Register,
    ) -> IrTree {
        self.gen_access(
            named_node,
            true,
            base_register,
            &IrNode::register_read,
            &IrNode::memory_read,
        )
    }

    pub fn gen_direct_write_with_custom_base(
        &self,
        named_node: &NamedNode,
        value: IrTree,
        base_register: Register,
    ) -> IrTree {
        self.gen_access(
            named_node,
            true,
            base_register,
            &|register| IrNode::register_write(register, value.clone()),
            &|address| IrNode::memory_write(address, value.clone()),
        )
    }
}

impl VariableAccessGenerator for DefaultFunctionDetailsGenerator {
    fn gen_read(&self, named_node: &NamedNode, is_direct: bool) -> IrTree {
        self.gen_access(
            named_node,
            is_direct,
            Register::RBP,
            &IrNode::register_read,
            &IrNode::memory_read,
        )
    }

    fn gen_write(&self, named_node: &NamedNode, value: IrTree, is_direct: bool) -> IrTree {
        self.gen_access(
            named_node,
            is_direct,
            Register::RBP,
            &|register| IrNode::register_write(register, value.clone()),
            &|address| IrNode::memory_write(address, value.clone()),
        )
    }
}

impl FunctionDetailsGenerator for DefaultFunctionDetailsGenerator {
    fn gen_call(&self, args: Vec<IrTree>) -> FunctionCallIntermediateForm {
        let returns = u8::from(self.variable_to_store_function_result.is_some());
        SysV64CallingConvention::gen_call(&self.identifier, args, returns)
    }

    fn gen_prologue(&self) -> ControlFlowGraph {
        let mut builder = ControlFlowGraphBuilder::new();

        // Back up and update RBP.
        builder.add_links_from_all_final_roots(
            CfgLinkType::Unconditional,
            IrNode::stack_push(IrNode::register_read(Register::RBP)),
        );
        builder.add_links_from_all_final_roots(
            CfgLinkType::Unconditional,
            IrNode::register_write(Register::RBP, IrNode::register_read(Register::RSP)),
        );

        // Reserve frame memory, keeping the stack aligned. The pushed
        // return address and RBP backup account for two words.
        builder.add_links_from_all_final_roots(
            CfgLinkType::Unconditional,
            IrNode::register_write(
                Register::RSP,
                Rc::new(IrNode::Subtract(
                    IrNode::register_read(Register::RSP),
                    IrNode::const_of(Constant::aligned(
                        self.required_memory_below_rbp(),
                        STACK_ALIGNMENT_IN_BYTES,
                        STACK_ALIGNMENT_IN_BYTES - 2 * MEMORY_UNIT_SIZE as i64,
                    )),
                )),
            ),
        );

        builder.merge_unconditionally(&self.gen_display_update());

        // Move arguments into their variables.
        for (parameter, register) in self.parameters.iter().zip(ARGUMENT_REGISTERS) {
            builder.add_links_from_all_final_roots(
                CfgLinkType::Unconditional,
                self.gen_write(parameter, IrNode::register_read(register), true),
            );
        }
        for (index, parameter) in self
            .parameters
            .iter()
            .skip(ARGUMENT_REGISTERS.len())
            .enumerate()
        {
            // Skip the pushed RBP and the return address.
            builder.add_links_from_all_final_roots(
                CfgLinkType::Unconditional,
                self.gen_write(
                    parameter,
                    IrNode::memory_read(IrNode::add(
                        IrNode::register_read(Register::RBP),
                        IrNode::constant((index as i64 + 2) * MEMORY_UNIT_SIZE as i64),
                    )),
                    true,
                ),
            );
        }

        builder.merge_unconditionally(&self.gen_callee_saved_registers_backup());

        builder.build()
    }

    fn gen_epilogue(&self) -> ControlFlowGraph {
        let mut builder = ControlFlowGraphBuilder::new();

        builder.merge_unconditionally(&self.gen_display_restore());

        if let Some(result_variable) = &self.variable_to_store_function_result {
            builder.add_links_from_all_final_roots(
                CfgLinkType::Unconditional,
                IrNode::register_write(Register::RAX, self.gen_read(result_variable, true)),
            );
        }

        builder.merge_unconditionally(&self.gen_callee_saved_registers_restore());

        // Restore RSP and RBP, then return.
        builder.add_links_from_all_final_roots(
            CfgLinkType::Unconditional,
            IrNode::register_write(Register::RSP, IrNode::register_read(Register::RBP)),
        );
        builder.add_links_from_all_final_roots(
            CfgLinkType::Unconditional,
            IrNode::register_write(Register::RBP, IrNode::stack_pop()),
        );

        let mut used: Vec<Register> = vec![Register::RAX];
        used.extend(CALLEE_SAVED_REGISTERS_WITHOUT_RSP_AND_RBP);
        builder.add_links_from_all_final_roots(
            CfgLinkType::Unconditional,
            Rc::new(IrNode::Return {
                used_registers: used,
            }),
        );

        builder.build()
    }

    fn spilled_registers_region_offset(&self) -> u64 {
        self.variables_region_size
    }

    fn spilled_registers_region_size(&self) -> ConstantPlaceholder {
        self.spilled_registers_region_size.clone()
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}

/// Details generator for foreign (extern) functions — call side only.
pub struct ForeignFunctionDetailsGenerator {
    identifier: String,
    returned_values_count: u8,
}

impl ForeignFunctionDetailsGenerator {
    pub fn new(identifier: impl Into<String>, returned_values_count: u8) -> Self {
        ForeignFunctionDetailsGenerator {
            identifier: identifier.into(),
            returned_values_count,
        }
    }
}

impl VariableAccessGenerator for ForeignFunctionDetailsGenerator {
    fn gen_read(&self, _named_node: &NamedNode, _is_direct: bool) -> IrTree {
        panic!("foreign functions own no variables")
    }

    fn gen_write(&self, _named_node: &NamedNode, _value: IrTree, _is_direct: bool) -> IrTree {
        panic!("foreign functions own no variables")
    }
}

impl FunctionDetailsGenerator for ForeignFunctionDetailsGenerator {
    fn gen_call(&self, args: Vec<IrTree>) -> FunctionCallIntermediateForm {
        SysV64CallingConvention::gen_call(&self.identifier, args, self.returned_values_count)
    }

    fn gen_prologue(&self) -> ControlFlowGraph {
        panic!("foreign functions have no lowered prologue")
    }

    fn gen_epilogue(&self) -> ControlFlowGraph {
        panic!("foreign functions have no lowered epilogue")
    }

    fn spilled_registers_region_offset(&self) -> u64 {
        panic!("foreign functions have no frame")
    }

    fn spilled_registers_region_size(&self) -> ConstantPlaceholder {
        panic!("foreign functions have no frame")
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}
