//! Reference-counted array memory management.
//!
//! Array layout in memory is `[refcount, size, elements…]`, with the public
//! address pointing at the first element. Allocation and the recursive
//! decrement live in the runtime library; the increment is cheap enough to
//! inline.

use crate::common::ast::{InitializationType, Type};
use crate::ir::builder::ControlFlowGraphBuilder;
use crate::ir::cfg::ControlFlowGraph;
use crate::ir::node::{IrNode, IrTree};
use crate::ir::register::Register;
use crate::lower::function::{
    ForeignFunctionDetailsGenerator, FunctionDetailsGenerator, MEMORY_UNIT_SIZE,
};

const MALLOC_LABEL: &str = "_$checked_malloc";
const POPULATE_LABEL: &str = "_$populate_dynamic_array";
const REF_COUNT_DECREMENT_LABEL: &str = "_$array_ref_count_decrement";

pub trait ArrayMemoryManagement {
    /// Allocate a new array; returns the CFG and the address of the first
    /// element.
    fn gen_allocation(
        &self,
        size: IrTree,
        initialization: &[IrTree],
        type_: &Type,
        mode: InitializationType,
    ) -> (ControlFlowGraph, IrTree);

    fn gen_ref_count_increment(&self, address: IrTree) -> ControlFlowGraph;

    /// Decrement recurses through `type_`'s nesting levels in the runtime,
    /// freeing when the count reaches zero.
    fn gen_ref_count_decrement(&self, address: IrTree, type_: &Type) -> ControlFlowGraph;
}

pub struct DefaultArrayMemoryManagement;

impl DefaultArrayMemoryManagement {
    fn write_at(builder: &mut ControlFlowGraphBuilder, base: Register, index: i64, value: IrTree) {
        builder.add_single_tree(IrNode::memory_write(
            IrNode::add(
                IrNode::register_read(base),
                IrNode::constant(index * MEMORY_UNIT_SIZE as i64),
            ),
            value,
        ));
    }
}

impl ArrayMemoryManagement for DefaultArrayMemoryManagement {
    fn gen_allocation(
        &self,
        size: IrTree,
        initialization: &[IrTree],
        type_: &Type,
        mode: InitializationType,
    ) -> (ControlFlowGraph, IrTree) {
        let element_type = type_
            .element_type()
            .expect("array allocation must have an array type");
        let mut builder = ControlFlowGraphBuilder::new();

        // Two header words in front of the elements.
        let table_size: IrTree = match mode {
            InitializationType::OneValue => IrNode::add(size, IrNode::constant(2)),
            InitializationType::AllValues => IrNode::constant(initialization.len() as i64 + 2),
        };
        let size_arg = IrNode::multiply(
            table_size.clone(),
            IrNode::constant(MEMORY_UNIT_SIZE as i64),
        );

        let malloc_call =
            ForeignFunctionDetailsGenerator::new(MALLOC_LABEL, 1).gen_call(vec![size_arg]);
        builder.merge_unconditionally(&malloc_call.call_graph);
        let array_register = Register::fresh();
        builder.add_single_tree(IrNode::register_write(
            array_register,
            malloc_call.result.expect("malloc returns a value"),
        ));

        Self::write_at(&mut builder, array_register, 0, IrNode::constant(1));
        Self::write_at(&mut builder, array_register, 1, table_size);
        let public_address = IrNode::add(
            IrNode::register_read(array_register),
            IrNode::constant(2 * MEMORY_UNIT_SIZE as i64),
        );

        match mode {
            InitializationType::AllValues => {
                for (index, value) in initialization.iter().enumerate() {
                    Self::write_at(&mut builder, array_register, index as i64 + 2, value.clone());
                    if element_type.is_array() {
                        builder.merge_unconditionally(&self.gen_ref_count_increment(value.clone()));
                    }
                }
            }
            InitializationType::OneValue => {
                let init_element = initialization
                    .first()
                    .expect("one-value initialization carries the value")
                    .clone();
                let increment_elements = i64::from(element_type.is_array());
                builder.merge_unconditionally(
                    &ForeignFunctionDetailsGenerator::new(POPULATE_LABEL, 0)
                        .gen_call(vec![
                            public_address.clone(),
                            init_element,
                            IrNode::constant(increment_elements),
                        ])
                        .call_graph,
                );
            }
        }

        (builder.build(), public_address)
    }

    fn gen_ref_count_increment(&self, address: IrTree) -> ControlFlowGraph {
        let mut builder = ControlFlowGraphBuilder::new();
        let ref_count_address = std::rc::Rc::new(IrNode::Subtract(
            address,
            IrNode::constant(2 * MEMORY_UNIT_SIZE as i64),
        ));
        builder.add_single_tree(IrNode::memory_write(
            ref_count_address.clone(),
            IrNode::add(IrNode::constant(1), IrNode::memory_read(ref_count_address)),
        ));
        builder.build()
    }

    fn gen_ref_count_decrement(&self, address: IrTree, type_: &Type) -> ControlFlowGraph {
        ForeignFunctionDetailsGenerator::new(REF_COUNT_DECREMENT_LABEL, 0)
            .gen_call(vec![address, IrNode::constant(type_.array_level())])
            .call_graph
    }
}
