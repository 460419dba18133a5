//! Functions.

use cranelift_entity::packed_option::PackedOption;

use crate::cfg::ControlFlowGraph;
use crate::ir::entities::{Entry, SubSec};
use crate::loops::LoopStructureGraph;

/// A named contiguous range of entries in one subsection. The function
/// lazily owns a control flow graph and a loop structure graph; both are
/// discarded together when the entry range is mutated.
pub struct FunctionData {
    pub name: Box<str>,
    pub subsec: SubSec,
    pub(crate) first_entry: PackedOption<Entry>,
    pub(crate) last_entry: PackedOption<Entry>,
    pub(crate) cfg: Option<ControlFlowGraph>,
    pub(crate) lsg: Option<LoopStructureGraph>,
}

impl FunctionData {
    pub fn new(name: &str, subsec: SubSec) -> Self {
        Self {
            name: name.into(),
            subsec,
            first_entry: None.into(),
            last_entry: None.into(),
            cfg: None,
            lsg: None,
        }
    }

    /// First entry of the function's range.
    pub fn first_entry(&self) -> Option<Entry> {
        self.first_entry.expand()
    }

    /// Last entry of the function's range.
    pub fn last_entry(&self) -> Option<Entry> {
        self.last_entry.expand()
    }

    /// The cached CFG, if one has been built.
    pub fn cfg(&self) -> Option<&ControlFlowGraph> {
        self.cfg.as_ref()
    }

    /// The cached loop structure graph, if one has been built.
    pub fn lsg(&self) -> Option<&LoopStructureGraph> {
        self.lsg.as_ref()
    }

    /// Drop the cached CFG. The loop forest was built over it, so it goes
    /// too.
    pub fn invalidate_cfg(&mut self) {
        self.cfg = None;
        self.lsg = None;
    }
}
