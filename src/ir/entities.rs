//! Entity references for the IR.
//!
//! Entries, functions, sections and subsections live in arenas owned by the
//! [Unit](crate::ir::Unit); everything else refers to them through these
//! small index types. Basic blocks and edges are owned per-CFG, loops per
//! loop forest.

use cranelift_entity::entity_impl;

/// An opaque reference to one element of the entry stream.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Entry(u32);
entity_impl!(Entry, "ent");

/// An opaque reference to a function.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Func(u32);
entity_impl!(Func, "func");

/// An opaque reference to a section.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Section(u32);
entity_impl!(Section, "sec");

/// An opaque reference to a subsection.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct SubSec(u32);
entity_impl!(SubSec, "ss");

/// An opaque reference to a basic block in a control flow graph.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Bb(u32);
entity_impl!(Bb, "bb");

/// An opaque reference to a CFG edge.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct CfgEdge(u32);
entity_impl!(CfgEdge, "edge");

/// An opaque reference to a loop in a loop structure graph.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct LoopId(u32);
entity_impl!(LoopId, "loop");
