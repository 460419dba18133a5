//! The compilation unit.
//!
//! The `Unit` owns every entry in an arena and threads them into doubly
//! linked chains, one per subsection. Back-pointers are entity indices, so
//! no entry holds a reference into another; the chain invariants
//! (`e.next.prev == e`, contiguous function ranges, owner endpoints kept in
//! sync) are maintained by the four mutation primitives and nothing else.

use core::ops::{Index, IndexMut};
use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::PrimaryMap;

use crate::fx::FxHashMap;
use crate::ir::entities::{Entry, Func, Section, SubSec};
use crate::ir::entry::{DirOperand, DirectiveEntry, DirectiveOp, EntryData, InsnEntry, LabelEntry};
use crate::ir::function::FunctionData;
use crate::ir::section::{SectionData, SubSectionData};
use crate::x86;

/// One arena slot: the payload plus chain links and ownership.
pub struct EntryNode {
    pub data: EntryData,
    /// Source line this entry came from; diagnostic only.
    pub line_number: u32,
    /// Verbatim source text; diagnostic only.
    pub line_verbatim: Option<Box<str>>,
    pub(crate) prev: PackedOption<Entry>,
    pub(crate) next: PackedOption<Entry>,
    pub(crate) func: PackedOption<Func>,
    pub(crate) subsec: PackedOption<SubSec>,
}

impl EntryNode {
    /// The function owning this entry, if it lies in one.
    pub fn func(&self) -> Option<Func> {
        self.func.expand()
    }

    /// The subsection owning this entry.
    pub fn subsec(&self) -> Option<SubSec> {
        self.subsec.expand()
    }
}

/// The compilation unit: arena of entries, containers, and symbol table.
pub struct Unit {
    entries: PrimaryMap<Entry, EntryNode>,
    pub funcs: PrimaryMap<Func, FunctionData>,
    pub sections: PrimaryMap<Section, SectionData>,
    pub subsections: PrimaryMap<SubSec, SubSectionData>,
    /// Label name to label entry. Names are unit-unique.
    labels: FxHashMap<Box<str>, Entry>,
    /// `.set`/`.equ` aliases: target label name to the alias names.
    equivs: FxHashMap<Box<str>, Vec<Box<str>>>,
    /// Monotone counter feeding synthesised label names.
    synth_counter: u32,
    /// Entries queued by `mark_for_delete`, unlinked by the next sweep.
    marked_for_delete: Vec<Entry>,
}

impl Index<Entry> for Unit {
    type Output = EntryNode;

    fn index(&self, e: Entry) -> &EntryNode {
        &self.entries[e]
    }
}

impl IndexMut<Entry> for Unit {
    fn index_mut(&mut self, e: Entry) -> &mut EntryNode {
        &mut self.entries[e]
    }
}

impl Unit {
    pub fn new() -> Self {
        Self {
            entries: PrimaryMap::new(),
            funcs: PrimaryMap::new(),
            sections: PrimaryMap::new(),
            subsections: PrimaryMap::new(),
            labels: FxHashMap::default(),
            equivs: FxHashMap::default(),
            synth_counter: 0,
            marked_for_delete: Vec::new(),
        }
    }

    /// Number of entries ever created, including unlinked ones.
    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    // ------------------------------------------------------------------
    // Containers.
    // ------------------------------------------------------------------

    /// Create a new named section.
    pub fn create_section(&mut self, name: &str) -> Section {
        self.sections.push(SectionData::new(name))
    }

    /// Create a new subsection at the end of `section`.
    pub fn create_subsection(&mut self, section: Section) -> SubSec {
        let ss = self.subsections.push(SubSectionData::new(section));
        self.sections[section].subsections.push(ss);
        ss
    }

    /// Declare the function `name` over the contiguous range
    /// `[first, last]`. The range must lie in a single subsection and all
    /// its entries become owned by the new function.
    pub fn define_function(&mut self, name: &str, first: Entry, last: Entry) -> Func {
        let subsec = self.entries[first]
            .subsec
            .expand()
            .expect("function start is not in a subsection");
        let func = self.funcs.push(FunctionData::new(name, subsec));
        let mut cur = Some(first);
        loop {
            let e = cur.expect("function range is not contiguous");
            assert_eq!(
                self.entries[e].subsec.expand(),
                Some(subsec),
                "function range crosses a subsection boundary"
            );
            self.entries[e].func = func.into();
            if e == last {
                break;
            }
            cur = self.entries[e].next.expand();
        }
        self.funcs[func].first_entry = first.into();
        self.funcs[func].last_entry = last.into();
        func
    }

    /// Find a function by name.
    pub fn find_function(&self, name: &str) -> Option<Func> {
        self.funcs
            .iter()
            .find(|(_, data)| &*data.name == name)
            .map(|(func, _)| func)
    }

    // ------------------------------------------------------------------
    // Entry creation.
    // ------------------------------------------------------------------

    fn new_entry(&mut self, data: EntryData, line_number: u32) -> Entry {
        self.entries.push(EntryNode {
            data,
            line_number,
            line_verbatim: None,
            prev: None.into(),
            next: None.into(),
            func: None.into(),
            subsec: None.into(),
        })
    }

    /// Create an unlinked instruction entry.
    pub fn create_insn(&mut self, insn: x86::Insn, mode: x86::ExecMode) -> Entry {
        self.new_entry(
            EntryData::Insn(InsnEntry {
                insn,
                mode,
                exec_count: None,
            }),
            0,
        )
    }

    /// Create an unlinked directive entry.
    pub fn create_directive(&mut self, op: DirectiveOp, operands: &[DirOperand]) -> Entry {
        self.new_entry(EntryData::Directive(DirectiveEntry::new(op, operands)), 0)
    }

    /// Create an unlinked label entry and record it in the symbol table.
    /// Label names are unit-unique; a duplicate is a bug in the producer.
    pub fn new_label(&mut self, name: &str, from_assembly: bool) -> Entry {
        assert!(
            !self.labels.contains_key(name),
            "duplicate label name: {}",
            name
        );
        let e = self.new_entry(
            EntryData::Label(LabelEntry {
                name: name.into(),
                from_assembly,
            }),
            0,
        );
        self.labels.insert(name.into(), e);
        e
    }

    /// Synthesise a label owned by the framework. The entry is created
    /// unlinked with `from_assembly = false`; the caller links it.
    pub fn create_label(&mut self, name: &str, func: Option<Func>, subsec: Option<SubSec>) -> Entry {
        let e = self.new_label(name, false);
        self.entries[e].func = func.into();
        self.entries[e].subsec = subsec.into();
        e
    }

    /// A fresh name for a synthesised label, from a monotone counter.
    pub fn gen_label_name(&mut self) -> String {
        let name = format!(".LafBB{}", self.synth_counter);
        self.synth_counter += 1;
        name
    }

    /// The label entry for `name`, if the unit defines it.
    pub fn label_entry(&self, name: &str) -> Option<Entry> {
        self.labels.get(name).copied()
    }

    /// Record `alias` as defined equal to `target` (`.set`/`.equ`).
    pub fn add_symbol_alias(&mut self, alias: &str, target: &str) {
        self.equivs
            .entry(target.into())
            .or_default()
            .push(alias.into());
    }

    /// Aliases defined equal to `target`.
    pub fn aliases_of(&self, target: &str) -> &[Box<str>] {
        self.equivs.get(target).map(|v| v.as_slice()).unwrap_or(&[])
    }

    // ------------------------------------------------------------------
    // Chain navigation.
    // ------------------------------------------------------------------

    /// The entry after `e` in its chain.
    pub fn next(&self, e: Entry) -> Option<Entry> {
        self.entries[e].next.expand()
    }

    /// The entry before `e` in its chain.
    pub fn prev(&self, e: Entry) -> Option<Entry> {
        self.entries[e].prev.expand()
    }

    /// The next entry, if it is an instruction.
    pub fn next_insn(&self, e: Entry) -> Option<Entry> {
        self.next(e).filter(|&n| self.entries[n].data.is_insn())
    }

    /// The previous entry, if it is an instruction.
    pub fn prev_insn(&self, e: Entry) -> Option<Entry> {
        self.prev(e).filter(|&p| self.entries[p].data.is_insn())
    }

    /// Iterate the range `[first, last]` in chain order.
    pub fn entry_range(&self, first: Option<Entry>, last: Option<Entry>) -> EntryRange<'_> {
        EntryRange {
            unit: self,
            head: first,
            tail: last,
        }
    }

    /// Iterate a function's entries.
    pub fn function_entries(&self, func: Func) -> EntryRange<'_> {
        let data = &self.funcs[func];
        self.entry_range(data.first_entry.expand(), data.last_entry.expand())
    }

    /// Iterate a subsection's entries.
    pub fn subsection_entries(&self, ss: SubSec) -> EntryRange<'_> {
        let data = &self.subsections[ss];
        self.entry_range(data.first_entry.expand(), data.last_entry.expand())
    }

    /// Iterate all entries of a section, subsection by subsection.
    pub fn section_entries(&self, section: Section) -> impl Iterator<Item = Entry> + '_ {
        self.sections[section]
            .subsections
            .clone()
            .into_iter()
            .flat_map(move |ss| self.subsection_entries(ss))
    }

    // ------------------------------------------------------------------
    // Mutation primitives.
    // ------------------------------------------------------------------

    /// Append an entry to the end of a subsection's chain.
    pub fn append(&mut self, ss: SubSec, e: Entry) {
        debug_assert!(self.entries[e].prev.is_none() && self.entries[e].next.is_none());
        self.entries[e].subsec = ss.into();
        match self.subsections[ss].last_entry.expand() {
            None => {
                self.subsections[ss].first_entry = e.into();
                self.subsections[ss].last_entry = e.into();
            }
            Some(last) => {
                self.entries[last].next = e.into();
                self.entries[e].prev = last.into();
                self.subsections[ss].last_entry = e.into();
            }
        }
    }

    /// Last entry of the chain starting at `e`. Panics on a cycle.
    fn last_of_chain(&self, e: Entry) -> Entry {
        let mut last = e;
        while let Some(next) = self.entries[last].next.expand() {
            assert_ne!(next, e, "cycle detected in entry chain");
            last = next;
        }
        last
    }

    fn adopt_chain(&mut self, first: Entry, last: Entry, anchor: Entry) {
        let func = self.entries[anchor].func;
        let subsec = self.entries[anchor].subsec;
        let mut cur = first;
        loop {
            self.entries[cur].func = func;
            self.entries[cur].subsec = subsec;
            if cur == last {
                break;
            }
            cur = self.entries[cur].next.expand().unwrap();
        }
    }

    /// Splice the chain starting at `chain` immediately before `anchor`.
    /// The chain entries take on `anchor`'s function and subsection; the
    /// owners' first-entry pointers move when `anchor` was first.
    pub fn link_before(&mut self, anchor: Entry, chain: Entry) {
        let chain_last = self.last_of_chain(chain);
        self.adopt_chain(chain, chain_last, anchor);

        let before = self.entries[anchor].prev;
        self.entries[chain_last].next = anchor.into();
        self.entries[chain].prev = before;
        if let Some(b) = before.expand() {
            self.entries[b].next = chain.into();
        }
        self.entries[anchor].prev = chain_last.into();

        if let Some(func) = self.entries[anchor].func.expand() {
            if self.funcs[func].first_entry.expand() == Some(anchor) {
                self.funcs[func].first_entry = chain.into();
            }
        }
        let ss = self.entries[anchor]
            .subsec
            .expand()
            .expect("anchor entry is not in a subsection");
        if self.subsections[ss].first_entry.expand() == Some(anchor) {
            self.subsections[ss].first_entry = chain.into();
        }
    }

    /// Splice the chain starting at `chain` immediately after `anchor`.
    pub fn link_after(&mut self, anchor: Entry, chain: Entry) {
        let chain_last = self.last_of_chain(chain);
        self.adopt_chain(chain, chain_last, anchor);

        let after = self.entries[anchor].next;
        self.entries[chain_last].next = after;
        self.entries[chain].prev = anchor.into();
        if let Some(a) = after.expand() {
            self.entries[a].prev = chain_last.into();
        }
        self.entries[anchor].next = chain.into();

        if let Some(func) = self.entries[anchor].func.expand() {
            if self.funcs[func].last_entry.expand() == Some(anchor) {
                self.funcs[func].last_entry = chain_last.into();
            }
        }
        let ss = self.entries[anchor]
            .subsec
            .expand()
            .expect("anchor entry is not in a subsection");
        if self.subsections[ss].last_entry.expand() == Some(anchor) {
            self.subsections[ss].last_entry = chain_last.into();
        }
    }

    /// Remove a single entry from its chain, updating owner endpoints.
    /// The entry stays in the arena and can be relinked.
    pub fn unlink(&mut self, e: Entry) {
        let prev = self.entries[e].prev;
        let next = self.entries[e].next;
        if let Some(p) = prev.expand() {
            self.entries[p].next = next;
        }
        if let Some(n) = next.expand() {
            self.entries[n].prev = prev;
        }
        if let Some(func) = self.entries[e].func.expand() {
            if self.funcs[func].first_entry.expand() == Some(e) {
                self.funcs[func].first_entry = next;
            }
            if self.funcs[func].last_entry.expand() == Some(e) {
                self.funcs[func].last_entry = prev;
            }
        }
        if let Some(ss) = self.entries[e].subsec.expand() {
            if self.subsections[ss].first_entry.expand() == Some(e) {
                self.subsections[ss].first_entry = next;
            }
            if self.subsections[ss].last_entry.expand() == Some(e) {
                self.subsections[ss].last_entry = prev;
            }
        }
        self.entries[e].prev = None.into();
        self.entries[e].next = None.into();
        self.entries[e].func = None.into();
        self.entries[e].subsec = None.into();
    }

    /// Remove the contiguous chain `[first, last]`. Both ends must lie in
    /// the same function and subsection; straddling a boundary is a bug.
    pub fn unlink_range(&mut self, first: Entry, last: Entry) {
        assert_eq!(
            self.entries[first].func, self.entries[last].func,
            "unlink_range across a function boundary"
        );
        assert_eq!(
            self.entries[first].subsec, self.entries[last].subsec,
            "unlink_range across a subsection boundary"
        );
        let prev = self.entries[first].prev;
        let next = self.entries[last].next;
        if let Some(p) = prev.expand() {
            self.entries[p].next = next;
        }
        if let Some(n) = next.expand() {
            self.entries[n].prev = prev;
        }
        if let Some(func) = self.entries[first].func.expand() {
            if self.funcs[func].first_entry.expand() == Some(first) {
                self.funcs[func].first_entry = next;
            }
            if self.funcs[func].last_entry.expand() == Some(last) {
                self.funcs[func].last_entry = prev;
            }
        }
        if let Some(ss) = self.entries[first].subsec.expand() {
            if self.subsections[ss].first_entry.expand() == Some(first) {
                self.subsections[ss].first_entry = next;
            }
            if self.subsections[ss].last_entry.expand() == Some(last) {
                self.subsections[ss].last_entry = prev;
            }
        }
        self.entries[first].prev = None.into();
        self.entries[last].next = None.into();
        let mut cur = Some(first);
        while let Some(e) = cur {
            self.entries[e].func = None.into();
            self.entries[e].subsec = None.into();
            cur = if e == last {
                None
            } else {
                self.entries[e].next.expand()
            };
        }
    }

    /// Synthesise a `.p2align` directive and link it before `entry`.
    /// `fill` of `None` leaves the fill byte to the assembler.
    pub fn align_to(&mut self, entry: Entry, log2: i64, fill: Option<i64>, max_skip: i64) {
        let operands = [
            DirOperand::Int(log2),
            fill.map_or(DirOperand::Empty, DirOperand::Int),
            DirOperand::Int(max_skip),
        ];
        let align = self.create_directive(DirectiveOp::P2Align, &operands);
        self.link_before(entry, align);
    }

    // ------------------------------------------------------------------
    // Deferred deletion.
    // ------------------------------------------------------------------

    /// Queue `e` for deletion. The entry stays linked until the pass
    /// manager sweeps at the end of the running pass.
    pub fn mark_for_delete(&mut self, e: Entry) {
        self.marked_for_delete.push(e);
    }

    /// Unlink every entry queued by `mark_for_delete`.
    pub fn sweep_deletions(&mut self) {
        let marked = core::mem::take(&mut self.marked_for_delete);
        for e in marked {
            self.unlink(e);
        }
    }

    /// Entries currently queued for deletion.
    pub fn num_marked_for_delete(&self) -> usize {
        self.marked_for_delete.len()
    }
}

impl Default for Unit {
    fn default() -> Self {
        Self::new()
    }
}

/// Double-ended iterator over a `[first, last]` entry range.
pub struct EntryRange<'a> {
    unit: &'a Unit,
    head: Option<Entry>,
    tail: Option<Entry>,
}

impl<'a> Iterator for EntryRange<'a> {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        let rval = self.head;
        if let Some(e) = rval {
            if self.head == self.tail {
                self.head = None;
                self.tail = None;
            } else {
                self.head = self.unit.next(e);
            }
        }
        rval
    }
}

impl<'a> DoubleEndedIterator for EntryRange<'a> {
    fn next_back(&mut self) -> Option<Entry> {
        let rval = self.tail;
        if let Some(e) = rval {
            if self.head == self.tail {
                self.head = None;
                self.tail = None;
            } else {
                self.tail = self.unit.prev(e);
            }
        }
        rval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x86::{Insn, Op};

    fn nop(unit: &mut Unit) -> Entry {
        unit.create_insn(Insn::new(Op::Nop), x86::ExecMode::Code64)
    }

    /// Check both directions of the chain against the expected order, and
    /// that owner endpoints are consistent.
    fn verify(unit: &Unit, ss: SubSec, expected: &[Entry]) {
        let forward: Vec<Entry> = unit.subsection_entries(ss).collect();
        assert_eq!(forward, expected);
        let backward: Vec<Entry> = unit.subsection_entries(ss).rev().collect();
        let mut reversed = expected.to_vec();
        reversed.reverse();
        assert_eq!(backward, reversed);
        for window in expected.windows(2) {
            assert_eq!(unit.next(window[0]), Some(window[1]));
            assert_eq!(unit.prev(window[1]), Some(window[0]));
        }
        if let Some(&first) = expected.first() {
            assert_eq!(unit.subsections[ss].first_entry(), Some(first));
            assert_eq!(unit.prev(first), None);
        }
        if let Some(&last) = expected.last() {
            assert_eq!(unit.subsections[ss].last_entry(), Some(last));
            assert_eq!(unit.next(last), None);
        }
    }

    fn fixture() -> (Unit, SubSec, Vec<Entry>) {
        let mut unit = Unit::new();
        let sec = unit.create_section(".text");
        let ss = unit.create_subsection(sec);
        let entries: Vec<Entry> = (0..4)
            .map(|_| {
                let e = nop(&mut unit);
                unit.append(ss, e);
                e
            })
            .collect();
        (unit, ss, entries)
    }

    #[test]
    fn append_builds_chain() {
        let (unit, ss, entries) = fixture();
        verify(&unit, ss, &entries);
    }

    #[test]
    fn link_before_and_after() {
        let (mut unit, ss, entries) = fixture();
        let a = nop(&mut unit);
        unit.link_before(entries[0], a);
        verify(&unit, ss, &[a, entries[0], entries[1], entries[2], entries[3]]);
        assert_eq!(unit[a].subsec(), Some(ss));

        let b = nop(&mut unit);
        unit.link_after(entries[3], b);
        verify(
            &unit,
            ss,
            &[a, entries[0], entries[1], entries[2], entries[3], b],
        );

        let c = nop(&mut unit);
        unit.link_after(entries[1], c);
        verify(
            &unit,
            ss,
            &[a, entries[0], entries[1], c, entries[2], entries[3], b],
        );
    }

    #[test]
    fn link_chain_of_two() {
        let (mut unit, ss, entries) = fixture();
        let a = nop(&mut unit);
        let b = nop(&mut unit);
        // Manually form a two-entry chain, then splice it in.
        unit[a].next = b.into();
        unit[b].prev = a.into();
        unit.link_before(entries[2], a);
        verify(
            &unit,
            ss,
            &[entries[0], entries[1], a, b, entries[2], entries[3]],
        );
    }

    #[test]
    fn unlink_middle_and_ends() {
        let (mut unit, ss, entries) = fixture();
        unit.unlink(entries[1]);
        verify(&unit, ss, &[entries[0], entries[2], entries[3]]);
        assert_eq!(unit[entries[1]].subsec(), None);
        unit.unlink(entries[0]);
        verify(&unit, ss, &[entries[2], entries[3]]);
        unit.unlink(entries[3]);
        verify(&unit, ss, &[entries[2]]);
        unit.unlink(entries[2]);
        verify(&unit, ss, &[]);
    }

    #[test]
    fn unlink_range_updates_endpoints() {
        let (mut unit, ss, entries) = fixture();
        let func = unit.define_function("f", entries[0], entries[3]);
        unit.unlink_range(entries[1], entries[2]);
        verify(&unit, ss, &[entries[0], entries[3]]);
        assert_eq!(unit.funcs[func].first_entry(), Some(entries[0]));
        assert_eq!(unit.funcs[func].last_entry(), Some(entries[3]));

        unit.unlink_range(entries[0], entries[3]);
        verify(&unit, ss, &[]);
        assert_eq!(unit.funcs[func].first_entry(), None);
        assert_eq!(unit.funcs[func].last_entry(), None);
    }

    #[test]
    #[should_panic(expected = "function boundary")]
    fn unlink_range_across_functions_panics() {
        let (mut unit, _ss, entries) = fixture();
        unit.define_function("f", entries[0], entries[1]);
        unit.define_function("g", entries[2], entries[3]);
        unit.unlink_range(entries[1], entries[2]);
    }

    #[test]
    fn function_endpoints_track_mutation() {
        let (mut unit, _ss, entries) = fixture();
        let func = unit.define_function("f", entries[0], entries[3]);
        let a = nop(&mut unit);
        unit.link_before(entries[0], a);
        assert_eq!(unit.funcs[func].first_entry(), Some(a));
        assert_eq!(unit[a].func(), Some(func));
        let b = nop(&mut unit);
        unit.link_after(entries[3], b);
        assert_eq!(unit.funcs[func].last_entry(), Some(b));
        let collected: Vec<Entry> = unit.function_entries(func).collect();
        assert_eq!(
            collected,
            vec![a, entries[0], entries[1], entries[2], entries[3], b]
        );
    }

    #[test]
    fn labels_are_unique_and_mapped() {
        let mut unit = Unit::new();
        let l = unit.new_label(".L1", true);
        assert_eq!(unit.label_entry(".L1"), Some(l));
        assert_eq!(unit.label_entry(".L2"), None);
        assert!(unit[l].data.as_label().from_assembly);
        let synth = unit.create_label(".LafBB0", None, None);
        assert!(!unit[synth].data.as_label().from_assembly);
    }

    #[test]
    #[should_panic(expected = "duplicate label")]
    fn duplicate_label_panics() {
        let mut unit = Unit::new();
        unit.new_label(".L1", true);
        unit.new_label(".L1", true);
    }

    #[test]
    fn deferred_deletion() {
        let (mut unit, ss, entries) = fixture();
        unit.mark_for_delete(entries[1]);
        unit.mark_for_delete(entries[2]);
        // Still linked until the sweep.
        verify(&unit, ss, &entries);
        unit.sweep_deletions();
        verify(&unit, ss, &[entries[0], entries[3]]);
        assert_eq!(unit.num_marked_for_delete(), 0);
    }

    #[test]
    fn align_to_links_p2align() {
        let (mut unit, ss, entries) = fixture();
        unit.align_to(entries[2], 4, None, 15);
        let all: Vec<Entry> = unit.subsection_entries(ss).collect();
        assert_eq!(all.len(), 5);
        let align = all[2];
        let directive = unit[align].data.as_directive();
        assert_eq!(directive.op, DirectiveOp::P2Align);
        assert_eq!(directive.operand(0).int(), 4);
        assert_eq!(directive.operand(2).int(), 15);
    }
}
