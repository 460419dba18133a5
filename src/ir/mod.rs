//! The intermediate representation.
//!
//! The IR is a stream of entries (instructions, labels, directives) owned by
//! a [Unit], partitioned into sections/subsections and carved into named
//! functions. See the module docs on [unit] for the chain invariants.

pub mod entities;
pub mod entry;
pub mod function;
pub mod section;
pub mod unit;

pub use entities::{Bb, CfgEdge, Entry, Func, LoopId, Section, SubSec};
pub use entry::{
    DirOperand, DirectiveEntry, DirectiveOp, EntryData, Expr, InsnEntry, LabelEntry, RelocKind,
};
pub use function::FunctionData;
pub use section::{EntrySizeMap, SectionData, SubSectionData};
pub use unit::{EntryNode, EntryRange, Unit};
