//! An assembly-level analysis and transformation framework for x86/x86-64.
//!
//! The framework consumes a stream of parsed assembly entries belonging to
//! a compilation unit, organises them into functions and basic blocks,
//! builds control flow graphs, recognises loop structure, computes
//! instruction sizes via iterative relaxation, performs register-level
//! dataflow analyses, and drives a pluggable pass manager that rewrites the
//! intermediate representation.
//!
//! The main pieces:
//!
//! - [ir]: the entry stream (instructions, labels, directives) in a doubly
//!   linked chain owned by a [ir::Unit], with mutation primitives that keep
//!   the chain and ownership invariants intact.
//! - [x86]: the register/opcode oracle answering predicates over opaque
//!   instruction records.
//! - [cfg]: the control flow graph builder, including recognition of jump
//!   tables and the va_arg dispatch pattern behind indirect jumps.
//! - [loops]: Havlak's loop nesting algorithm over a CFG.
//! - [relax]: fixed-point computation of per-entry sizes and offsets.
//! - [dataflow], [liveness], [reaching_defs]: the bit-vector dataflow
//!   engine and its two standard instances.
//! - [passes]: pass registration, typed options, and the pass driver.
//!
//! Assembly parsing and binary emission live outside this crate; entries
//! arrive fully decoded and leave as a rewritten entry stream.

pub use cranelift_entity as entity;

pub mod bitstring;
pub mod cfg;
pub mod cfg_printer;
pub mod dataflow;
pub mod fx;
pub mod ir;
pub mod liveness;
pub mod loops;
pub mod passes;
pub mod reaching_defs;
pub mod relax;
pub mod x86;

mod testutil;
