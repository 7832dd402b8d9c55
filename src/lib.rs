//! Tessera — a code-generation back end for an imperative language with
//! nested functions, generators and reference-counted arrays.
//!
//! Given a type-checked, name-resolved AST together with the semantic facts
//! produced by upstream analysis, the crate lowers each function to a
//! control-flow graph of intermediate-form trees, tiles the trees with
//! target instruction patterns, linearizes the graph into a jump/label
//! stream, and assigns physical registers by graph coloring with iterated
//! spilling.
//!
//! # Pipeline
//!
//! AST + analysis facts
//!   → lowering ([`lower`]) → per-function [`ir::ControlFlowGraph`]
//!   → linearization ([`codegen`]) → linear [`asm::Asmable`] stream
//!   → liveness ([`dataflow`]) → interference/copy graphs
//!   → allocation ([`regalloc`]) → instructions over physical registers
//!
//! Lexing, parsing, semantic analysis and textual assembly emission are
//! external collaborators; [`common`] defines the interface types consumed
//! from them.

pub mod asm;
pub mod codegen;
pub mod common;
pub mod dataflow;
pub mod ir;
pub mod lower;
pub mod pipeline;
pub mod regalloc;

pub use pipeline::{CompiledFunction, TargetConfig, compile_program};
