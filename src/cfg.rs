//! Control flow graphs over the entry stream.
//!
//! A CFG partitions one function's entries into basic blocks and connects
//! them with explicit edges. Two sentinel blocks, `<SOURCE>` and `<SINK>`,
//! bracket the graph and are not mapped by label. Indirect jumps are
//! resolved through pattern recognition (jump tables in four shapes, the
//! va_arg register-save dispatch); what cannot be resolved is counted, not
//! fatal.

use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::PrimaryMap;
use log::{debug, trace};
use smallvec::SmallVec;

use crate::fx::FxHashMap;
use crate::ir::{Bb, CfgEdge, Entry, EntryData, EntryRange, Func, Unit};
use crate::x86::{self, Op};

/// A basic block: a label, an entry range, and its edge lists.
pub struct BasicBlockData {
    pub label: Box<str>,
    pub(crate) first_entry: PackedOption<Entry>,
    pub(crate) last_entry: PackedOption<Entry>,
    pub in_edges: Vec<CfgEdge>,
    pub out_edges: Vec<CfgEdge>,
    /// Set when the block is a target of a chained indirect jump (the
    /// va_arg dispatch pattern); such blocks must keep their layout order.
    pub chained_indirect_jump_target: bool,
    /// Set when data directives were found inside the block.
    pub found_data_directives: bool,
}

impl BasicBlockData {
    fn new(label: &str) -> Self {
        Self {
            label: label.into(),
            first_entry: None.into(),
            last_entry: None.into(),
            in_edges: Vec::new(),
            out_edges: Vec::new(),
            chained_indirect_jump_target: false,
            found_data_directives: false,
        }
    }

    /// First entry of the block's range.
    pub fn first_entry(&self) -> Option<Entry> {
        self.first_entry.expand()
    }

    /// Last entry of the block's range.
    pub fn last_entry(&self) -> Option<Entry> {
        self.last_entry.expand()
    }
}

/// An ordered edge between two basic blocks.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct EdgeData {
    pub source: Bb,
    pub dest: Bb,
    pub fallthrough: bool,
}

/// Statistics about jump resolution, accumulated while building.
#[derive(Default, Clone)]
pub struct CfgStats {
    pub direct_jumps: u32,
    pub indirect_jumps: u32,
    pub unresolved_jumps: u32,
    pub jump_table_patterns: u32,
    pub vaarg_patterns: u32,
    pub tail_calls: u32,
}

impl CfgStats {
    fn log_summary(&self, func_name: &str) {
        debug!(
            "cfg {}: {} direct, {} indirect ({} unresolved), {} table, {} va_arg, {} tail calls",
            func_name,
            self.direct_jumps,
            self.indirect_jumps,
            self.unresolved_jumps,
            self.jump_table_patterns,
            self.vaarg_patterns,
            self.tail_calls
        );
    }
}

/// The control flow graph of one function.
pub struct ControlFlowGraph {
    blocks: PrimaryMap<Bb, BasicBlockData>,
    edges: PrimaryMap<CfgEdge, EdgeData>,
    /// Blocks reachable by label name. The sentinels are not mapped.
    mapped: FxHashMap<Box<str>, Bb>,
    /// Parsed jump tables, keyed by the table's label entry. `None` records
    /// a table that could not be parsed.
    jump_tables: FxHashMap<Entry, Option<Vec<Entry>>>,
    source: Bb,
    sink: Bb,
    conservative: bool,
    num_external_jumps: u32,
    num_unresolved_jumps: u32,
    pub stats: CfgStats,
}

impl ControlFlowGraph {
    fn new(conservative: bool) -> Self {
        let mut blocks = PrimaryMap::new();
        let source = blocks.push(BasicBlockData::new("<SOURCE>"));
        let sink = blocks.push(BasicBlockData::new("<SINK>"));
        Self {
            blocks,
            edges: PrimaryMap::new(),
            mapped: FxHashMap::default(),
            jump_tables: FxHashMap::default(),
            source,
            sink,
            conservative,
            num_external_jumps: 0,
            num_unresolved_jumps: 0,
            stats: CfgStats::default(),
        }
    }

    /// Build the CFG for `func`. In conservative mode every original label
    /// starts a block, so passes may redirect any of them.
    pub fn build(unit: &mut Unit, func: Func, conservative: bool) -> ControlFlowGraph {
        Self::build_with(unit, func, conservative, false)
    }

    /// Build with an explicit `respect_orig_labels` request; conservative
    /// mode forces it on regardless.
    pub fn build_with(
        unit: &mut Unit,
        func: Func,
        conservative: bool,
        respect_orig_labels: bool,
    ) -> ControlFlowGraph {
        CfgBuilder::new(func, conservative, respect_orig_labels).build(unit)
    }

    /// The cached CFG for `func`, building it first if the cache is empty
    /// or was built under a different `conservative` flag.
    pub fn get_or_build(unit: &mut Unit, func: Func, conservative: bool) -> &ControlFlowGraph {
        let needs_build = match &unit.funcs[func].cfg {
            Some(cfg) => cfg.conservative != conservative,
            None => true,
        };
        if needs_build {
            let cfg = ControlFlowGraph::build(unit, func, conservative);
            unit.funcs[func].cfg = Some(cfg);
        }
        unit.funcs[func].cfg.as_ref().unwrap()
    }

    /// Drop the cached CFG (and the loop forest built over it).
    pub fn invalidate(unit: &mut Unit, func: Func) {
        unit.funcs[func].invalidate_cfg();
    }

    /// The `<SOURCE>` sentinel.
    pub fn source(&self) -> Bb {
        self.source
    }

    /// The `<SINK>` sentinel.
    pub fn sink(&self) -> Bb {
        self.sink
    }

    /// Was this graph built in conservative mode?
    pub fn conservative(&self) -> bool {
        self.conservative
    }

    /// Number of blocks, sentinels included.
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Iterate over all blocks in creation order, sentinels first.
    pub fn blocks(&self) -> impl Iterator<Item = Bb> + '_ {
        self.blocks.keys()
    }

    /// The data of `bb`.
    pub fn block(&self, bb: Bb) -> &BasicBlockData {
        &self.blocks[bb]
    }

    /// The data of `edge`.
    pub fn edge(&self, edge: CfgEdge) -> &EdgeData {
        &self.edges[edge]
    }

    /// The block mapped at `label`, if any.
    pub fn find_block(&self, label: &str) -> Option<Bb> {
        self.mapped.get(label).copied()
    }

    /// Successor blocks of `bb`, one per out-edge.
    pub fn succs(&self, bb: Bb) -> impl Iterator<Item = Bb> + '_ {
        self.blocks[bb]
            .out_edges
            .iter()
            .map(move |&e| self.edges[e].dest)
    }

    /// Predecessor blocks of `bb`, one per in-edge.
    pub fn preds(&self, bb: Bb) -> impl Iterator<Item = Bb> + '_ {
        self.blocks[bb]
            .in_edges
            .iter()
            .map(move |&e| self.edges[e].source)
    }

    /// Iterate the entries of `bb`.
    pub fn bb_entries<'a>(&self, unit: &'a Unit, bb: Bb) -> EntryRange<'a> {
        let data = &self.blocks[bb];
        unit.entry_range(data.first_entry.expand(), data.last_entry.expand())
    }

    /// Number of entries in `bb`.
    pub fn num_entries(&self, unit: &Unit, bb: Bb) -> usize {
        self.bb_entries(unit, bb).count()
    }

    /// First instruction of `bb`, skipping labels and directives.
    pub fn first_insn(&self, unit: &Unit, bb: Bb) -> Option<Entry> {
        self.bb_entries(unit, bb).find(|&e| unit[e].data.is_insn())
    }

    /// Last instruction of `bb`.
    pub fn last_insn(&self, unit: &Unit, bb: Bb) -> Option<Entry> {
        self.bb_entries(unit, bb)
            .rev()
            .find(|&e| unit[e].data.is_insn())
    }

    /// Does `a` directly precede `b` in the entry chain?
    pub fn directly_precedes(&self, unit: &Unit, a: Bb, b: Bb) -> bool {
        match (self.blocks[a].last_entry.expand(), self.blocks[b].first_entry.expand()) {
            (Some(last), Some(first)) => unit.next(last) == Some(first),
            _ => false,
        }
    }

    /// Does `a` directly follow `b` in the entry chain?
    pub fn directly_follows(&self, unit: &Unit, a: Bb, b: Bb) -> bool {
        self.directly_precedes(unit, b, a)
    }

    /// Jumps whose target lies outside this function or unit.
    pub fn num_external_jumps(&self) -> u32 {
        self.num_external_jumps
    }

    /// Indirect jumps whose targets could not be resolved.
    pub fn num_unresolved_jumps(&self) -> u32 {
        self.num_unresolved_jumps
    }

    /// A graph is well formed when it holds at least one instruction, every
    /// control transfer was resolved (or explicitly counted as external),
    /// and no edge dangles. Passes that need exact control flow skip
    /// functions that fail this.
    pub fn is_well_formed(&self, unit: &Unit) -> bool {
        if self.num_unresolved_jumps != 0 {
            return false;
        }
        self.blocks
            .keys()
            .any(|bb| self.first_insn(unit, bb).is_some())
    }

    fn link(&mut self, source: Bb, dest: Bb, fallthrough: bool) -> CfgEdge {
        let edge = self.edges.push(EdgeData {
            source,
            dest,
            fallthrough,
        });
        self.blocks[source].out_edges.push(edge);
        self.blocks[dest].in_edges.push(edge);
        edge
    }

    /// Parse the jump table at `table_label` and return its target label
    /// entries. Results, including failures, are cached per label.
    fn jump_table_targets(&mut self, unit: &Unit, table_label: Entry) -> Option<&Vec<Entry>> {
        if !self.jump_tables.contains_key(&table_label) {
            let mut targets: Vec<Entry> = Vec::new();
            let mut ok = true;
            let mut cursor = unit.next(table_label);
            while let Some(e) = cursor {
                let directive = match &unit[e].data {
                    EntryData::Directive(d) => d,
                    _ => break,
                };
                if !directive.is_jump_table_entry() {
                    break;
                }
                match directive
                    .jump_table_target()
                    .and_then(|name| unit.label_entry(name))
                {
                    Some(label) => {
                        if !targets.contains(&label) {
                            targets.push(label);
                        }
                    }
                    None => {
                        ok = false;
                        break;
                    }
                }
                cursor = unit.next(e);
            }
            self.jump_tables
                .insert(table_label, if ok { Some(targets) } else { None });
        }
        self.jump_tables[&table_label].as_ref()
    }
}

/// Builds a CFG in one walk over a function's entry stream.
struct CfgBuilder {
    cfg: ControlFlowGraph,
    func: Func,
    respect_orig_labels: bool,
    /// Every label seen so far, mapped to the block that contains it. Used
    /// to split already-built blocks when a branch targets their middle.
    label_map: FxHashMap<Box<str>, Bb>,
    next_bb_name: u32,
}

impl CfgBuilder {
    fn new(func: Func, conservative: bool, respect_orig_labels: bool) -> Self {
        Self {
            cfg: ControlFlowGraph::new(conservative),
            func,
            respect_orig_labels: respect_orig_labels || conservative,
            label_map: FxHashMap::default(),
            next_bb_name: 0,
        }
    }

    fn create_block(&mut self, label: &str) -> Bb {
        self.cfg.blocks.push(BasicBlockData::new(label))
    }

    fn map_block(&mut self, label: &str, bb: Bb) {
        self.cfg.mapped.insert(label.into(), bb);
    }

    fn gen_bb_name(&mut self) -> String {
        let name = format!("<bb-{}>", self.next_bb_name);
        self.next_bb_name += 1;
        name
    }

    fn build(mut self, unit: &mut Unit) -> ControlFlowGraph {
        let source = self.cfg.source;
        let sink = self.cfg.sink;
        let mut previous = source;
        let mut current: Option<Bb> = None;
        let mut create_fall_through = true;
        let mut last_entry: Option<Entry> = None;

        let func_last = unit.funcs[self.func].last_entry();
        let mut cursor = unit.funcs[self.func].first_entry();
        while let Some(e) = cursor {
            trace!("cfg: working on {}", unit[e].data);

            // Directives do not belong to basic blocks, but data directives
            // taint the block they appear in.
            if let EntryData::Directive(d) = &unit[e].data {
                if let Some(cur) = current {
                    if d.op.is_data_directive() {
                        self.cfg.blocks[cur].found_data_directives = true;
                    }
                }
                cursor = self.advance(unit, e, func_last);
                continue;
            }

            last_entry = Some(e);

            // A label starts a new block when the graph already expects one
            // there, or when the builder keeps all original labels.
            if let EntryData::Label(l) = &unit[e].data {
                if current.is_some()
                    && (self.respect_orig_labels || self.cfg.find_block(&l.name).is_some())
                {
                    create_fall_through = true;
                    previous = current.take().unwrap();
                }
            }

            if current.is_none() {
                let label_name = match &unit[e].data {
                    EntryData::Label(l) => {
                        // A label immediately before a `.size` directive
                        // marks the end of the function.
                        if let Some(next) = unit.next(e) {
                            if matches!(&unit[next].data, EntryData::Directive(d)
                                        if d.op == crate::ir::DirectiveOp::Size)
                            {
                                break;
                            }
                        }
                        l.name.to_string()
                    }
                    _ => self.gen_bb_name(),
                };
                let bb = match self.cfg.find_block(&label_name) {
                    Some(bb) => bb,
                    None => {
                        let bb = self.create_block(&label_name);
                        self.map_block(&label_name, bb);
                        bb
                    }
                };
                if create_fall_through {
                    self.cfg.link(previous, bb, true);
                }
                create_fall_through = false;
                current = Some(bb);
            }

            let cur = current.unwrap();
            if self.cfg.blocks[cur].first_entry.is_none() {
                self.cfg.blocks[cur].first_entry = e.into();
            }
            self.cfg.blocks[cur].last_entry = e.into();

            if let EntryData::Label(l) = &unit[e].data {
                self.label_map.insert(l.name.clone(), cur);
            }

            let mut inserted_edges = 0;
            let is_transfer = match &unit[e].data {
                EntryData::Insn(i) => i.insn.is_control_transfer() && !i.insn.is_call(),
                _ => false,
            };
            if is_transfer {
                let (targets, va_arg) = self.get_targets(unit, e);
                for name in &targets {
                    let target = self.resolve_target(unit, name, &mut current);
                    if va_arg {
                        self.cfg.blocks[target].chained_indirect_jump_target = true;
                    }
                    self.cfg.link(current.unwrap(), target, false);
                    inserted_edges += 1;
                }
            }

            if self.ends_basic_block(&unit[e].data) {
                create_fall_through = match &unit[e].data {
                    EntryData::Insn(i) => i.insn.has_fallthrough(),
                    _ => false,
                };
                previous = current.take().unwrap();
                if inserted_edges == 0 && !create_fall_through {
                    self.cfg.link(previous, sink, true);
                }
            }

            cursor = self.advance(unit, e, func_last);
        }

        if create_fall_through {
            self.cfg.link(previous, sink, true);
        }

        // A function may end in a block whose last instruction falls
        // through (e.g. a nop at the end).
        if let (Some(cur), Some(last)) = (current, last_entry) {
            if matches!(&unit[last].data, EntryData::Insn(i) if i.insn.has_fallthrough()) {
                self.cfg.link(cur, sink, true);
            }
        }

        self.cfg.stats.log_summary(&unit.funcs[self.func].name);
        self.cfg
    }

    fn advance(&self, unit: &Unit, e: Entry, func_last: Option<Entry>) -> Option<Entry> {
        if Some(e) == func_last {
            None
        } else {
            unit.next(e)
        }
    }

    fn ends_basic_block(&self, data: &EntryData) -> bool {
        match data {
            EntryData::Insn(i) => {
                (i.insn.is_control_transfer() && !i.insn.is_call()) || !i.insn.has_fallthrough()
            }
            _ => false,
        }
    }

    /// Find or create the block for a branch target, splitting an existing
    /// block when the target label sits in its middle.
    fn resolve_target(&mut self, unit: &Unit, name: &str, current: &mut Option<Bb>) -> Bb {
        if let Some(bb) = self.cfg.find_block(name) {
            return bb;
        }
        match self.label_map.get(name).copied() {
            None => {
                // First time this label is seen. It may live later in this
                // function, in another function, or outside the unit.
                match unit.label_entry(name) {
                    None => self.cfg.num_external_jumps += 1,
                    Some(label) => {
                        if unit[label].func() != Some(self.func) {
                            self.cfg.num_external_jumps += 1;
                        }
                    }
                }
                let bb = self.create_block(name);
                self.map_block(name, bb);
                bb
            }
            Some(inside) => {
                if &*self.cfg.blocks[inside].label == name {
                    return inside;
                }
                let current_is_target = *current == Some(inside);
                let label = unit
                    .label_entry(name)
                    .unwrap_or_else(|| panic!("unable to find label: {}", name));
                let new_bb = self.break_up_bb_at_label(unit, inside, label);

                // Labels in the moved tail now live in the new block.
                let first = self.cfg.blocks[new_bb].first_entry.expand();
                let last = self.cfg.blocks[new_bb].last_entry.expand();
                let moved: Vec<Entry> = unit.entry_range(first, last).collect();
                for e in moved {
                    if let EntryData::Label(l) = &unit[e].data {
                        self.label_map.insert(l.name.clone(), new_bb);
                    }
                }

                if current_is_target {
                    *current = Some(new_bb);
                }
                new_bb
            }
        }
    }

    /// Split `bb` at `label`: the new block takes the tail entries and all
    /// outgoing edges; a fallthrough edge joins the halves.
    fn break_up_bb_at_label(&mut self, unit: &Unit, bb: Bb, label: Entry) -> Bb {
        let name = unit[label].data.as_label().name.clone();
        let new_bb = self.create_block(&name);
        self.map_block(&name, new_bb);

        let old_last = self.cfg.blocks[bb].last_entry;
        self.cfg.blocks[new_bb].first_entry = label.into();
        self.cfg.blocks[new_bb].last_entry = old_last;
        self.cfg.blocks[bb].last_entry = unit.prev(label).into();

        let moved = core::mem::take(&mut self.cfg.blocks[bb].out_edges);
        for &edge in &moved {
            self.cfg.edges[edge].source = new_bb;
        }
        self.cfg.blocks[new_bb].out_edges = moved;

        self.cfg.link(bb, new_bb, true);
        new_bb
    }

    /// Compute the branch targets of the control transfer at `e`. The
    /// second result is true when the targets come from a va_arg dispatch
    /// and must be flagged as chained indirect jump targets.
    fn get_targets(&mut self, unit: &mut Unit, e: Entry) -> (SmallVec<[String; 4]>, bool) {
        let insn = unit[e].data.as_insn().insn.clone();
        let mut targets: SmallVec<[String; 4]> = SmallVec::new();
        let mut processed = false;

        if insn.is_indirect_jump() {
            self.cfg.stats.indirect_jumps += 1;
        }

        // A plain direct branch.
        if !insn.is_call() && !insn.is_return() && !insn.is_indirect_jump() {
            let target = insn
                .target()
                .unwrap_or_else(|| panic!("unable to find target for branch: {}", insn));
            targets.push(target.to_string());
            processed = true;
            self.cfg.stats.direct_jumps += 1;
        }

        // An indirect jump directly after `leave` is a tail call; control
        // leaves the function, so no edges.
        if !processed && self.is_tail_call(unit, e, &insn) {
            self.cfg.stats.tail_calls += 1;
            processed = true;
        }

        if !processed {
            if let Some(table_label) = self.table_jump_label(unit, e, &insn) {
                match self.cfg.jump_table_targets(unit, table_label).cloned() {
                    Some(found) => {
                        for label in found {
                            targets.push(unit[label].data.as_label().name.to_string());
                            processed = true;
                        }
                    }
                    None => {
                        trace!("cfg: unable to identify the targets in jump table");
                        self.cfg.num_unresolved_jumps += 1;
                        self.cfg.stats.unresolved_jumps += 1;
                    }
                }
                if processed {
                    self.cfg.stats.jump_table_patterns += 1;
                }
            }
        }

        let mut va_arg = false;
        if !processed {
            let pattern = self.vaarg_pattern(unit, e, &insn);
            if !pattern.is_empty() {
                va_arg = true;
                for p in pattern {
                    let name = match unit.prev(p) {
                        Some(prev) if unit[prev].data.is_label() => {
                            unit[prev].data.as_label().name.to_string()
                        }
                        _ => {
                            // Synthesise a label in front of the target.
                            let name = unit.gen_label_name();
                            let func = unit[p].func();
                            let subsec = unit[p].subsec();
                            let label = unit.create_label(&name, func, subsec);
                            unit.link_before(p, label);
                            name
                        }
                    };
                    targets.push(name);
                    processed = true;
                }
                self.cfg.stats.vaarg_patterns += 1;
            }
        }

        if insn.is_indirect_jump() && !processed {
            self.cfg.num_external_jumps += 1;
            self.cfg.num_unresolved_jumps += 1;
            self.cfg.stats.unresolved_jumps += 1;
            trace!("cfg: unable to find targets for indirect jump: {}", insn);
        }

        (targets, va_arg)
    }

    fn is_tail_call(&self, unit: &Unit, e: Entry, insn: &x86::Insn) -> bool {
        insn.is_indirect_jump()
            && match unit.prev(e) {
                Some(prev) => {
                    matches!(&unit[prev].data, EntryData::Insn(i) if i.insn.op() == Op::Leave)
                }
                None => false,
            }
    }

    /// Try the four jump-table shapes in order; return the label at the
    /// head of the table on a match.
    fn table_jump_label(&self, unit: &Unit, e: Entry, insn: &x86::Insn) -> Option<Entry> {
        if !insn.is_indirect_jump() {
            return None;
        }
        self.table_pattern_1(unit, insn)
            .or_else(|| self.table_pattern_2(unit, e, insn))
            .or_else(|| self.table_pattern_3(unit, e, insn))
            .or_else(|| self.table_pattern_4(unit, e, insn))
    }

    /// `jmp .LT(,%reg,8)`: the table label is the displacement of the
    /// single memory operand.
    fn table_pattern_1(&self, unit: &Unit, insn: &x86::Insn) -> Option<Entry> {
        if insn.num_operands() == 1 && insn.is_memory_operand(0) && insn.has_displacement(0) {
            let name = insn.displacement(0).symbol_name()?;
            let label = unit
                .label_entry(name)
                .unwrap_or_else(|| panic!("unable to find label: {}", name));
            return Some(label);
        }
        None
    }

    /// `mov .LT(,%reg,8), %r ; jmp *%r`
    fn table_pattern_2(&self, unit: &Unit, e: Entry, insn: &x86::Insn) -> Option<Entry> {
        if !insn.is_register_operand(0) {
            return None;
        }
        let prev = unit.prev(e)?;
        let prev_insn = match &unit[prev].data {
            EntryData::Insn(i) => &i.insn,
            _ => return None,
        };
        if prev_insn.op() == Op::Mov
            && prev_insn.num_operands() == 2
            && prev_insn.is_register_operand(1)
            && prev_insn.is_memory_operand(0)
            && prev_insn.register_operand(1) == insn.register_operand(0)
            && prev_insn.has_displacement(0)
        {
            let name = prev_insn.displacement(0).symbol_name()?;
            // The table may live in another translation unit.
            return unit.label_entry(name);
        }
        None
    }

    /// The PIC-64 shape:
    ///
    /// ```text
    /// leaq   .LT(%rip), %rb
    /// [mov/movzbl ..., %x]          (optional, must not write %rb)
    /// movslq (%rb,%ri,4), %ri
    /// addq   %rb, %ri
    /// jmp    *%ri
    /// ```
    fn table_pattern_3(&self, unit: &Unit, e: Entry, insn: &x86::Insn) -> Option<Entry> {
        if !insn.is_register_operand(0) {
            return None;
        }
        let r_ri = insn.register_operand(0);

        let mut insts: Vec<&x86::Insn> = Vec::new();
        let mut cursor = unit.prev(e);
        for _ in 0..4 {
            match cursor {
                Some(p) => match &unit[p].data {
                    EntryData::Insn(i) => {
                        insts.push(&i.insn);
                        cursor = unit.prev(p);
                    }
                    _ => break,
                },
                None => break,
            }
        }
        if insts.len() < 4 {
            return None;
        }

        let add = insts[0];
        if !(add.op() == Op::Add
            && add.num_operands() == 2
            && add.is_register_operand(0)
            && add.is_register_operand(1)
            && add.register_operand(1) == r_ri)
        {
            return None;
        }
        let r_rb = add.register_operand(0);

        let movslq = insts[1];
        if !(movslq.op() == Op::Movslq
            && movslq.num_operands() == 2
            && movslq.is_register_operand(1)
            && movslq.register_operand(1) == r_ri)
        {
            return None;
        }

        // Step over the optional move, which must target some other
        // register.
        let mut lea_ix = 2;
        let opt = insts[2];
        if (opt.op() == Op::Mov || opt.op() == Op::Movzbl)
            && opt.num_operands() == 2
            && opt.is_register_operand(1)
            && opt.register_operand(1) != r_rb
        {
            lea_ix = 3;
        }

        let lea = insts[lea_ix];
        if !(lea.op() == Op::Lea
            && lea.num_operands() == 2
            && lea.is_register_operand(1)
            && lea.register_operand(1) == r_rb)
        {
            return None;
        }
        if !lea.has_displacement(0) {
            return None;
        }
        let name = lea.displacement(0).symbol_name()?;
        let label = unit
            .label_entry(name)
            .unwrap_or_else(|| panic!("unable to find label: {}", name));
        Some(label)
    }

    /// Variant of pattern 3 where the `leaq` sits further up the function.
    /// Requires that exactly one instruction in the function defines the
    /// base register and that the register is not an ABI argument register
    /// (those may be written by the caller).
    fn table_pattern_4(&self, unit: &Unit, e: Entry, insn: &x86::Insn) -> Option<Entry> {
        if !insn.is_register_operand(0) {
            return None;
        }
        let r_ri = insn.register_operand(0);

        let prev = unit.prev(e)?;
        let add = match &unit[prev].data {
            EntryData::Insn(i) => &i.insn,
            _ => return None,
        };
        if !(add.op() == Op::Add
            && add.num_operands() == 2
            && add.is_register_operand(0)
            && add.is_register_operand(1)
            && add.register_operand(1) == r_ri)
        {
            return None;
        }
        let r_rb = add.register_operand(0);
        let rmask = x86::mask_with_parents(r_rb);
        if !(&x86::calling_convention_def_mask() & &rmask).is_null() {
            trace!("cfg: jump table base register conflicts with an argument register");
            return None;
        }

        let prev2 = unit.prev(prev)?;
        let movslq = match &unit[prev2].data {
            EntryData::Insn(i) => &i.insn,
            _ => return None,
        };
        if !(movslq.op() == Op::Movslq
            && movslq.num_operands() == 2
            && movslq.is_register_operand(1)
            && movslq.register_operand(1) == r_ri)
        {
            return None;
        }

        // Scan the function for definitions of the base register. Exactly
        // one may exist: the table-address load.
        let mut def_entry: Option<Entry> = None;
        let mut num_defs = 0;
        let mut cursor = Some(e);
        while let Some(cur) = cursor {
            if unit[cur].func() != Some(self.func) {
                break;
            }
            if let EntryData::Insn(i) = &unit[cur].data {
                let defs = x86::register_def_mask(&i.insn);
                if defs.is_undef() {
                    return None;
                }
                if !(&defs & &rmask).is_null() {
                    def_entry = Some(cur);
                    num_defs += 1;
                }
            }
            cursor = unit.prev(cur);
        }
        if num_defs != 1 {
            return None;
        }
        let def = def_entry.unwrap();
        let def_insn = &unit[def].data.as_insn().insn;
        if !def_insn.has_displacement(0) {
            return None;
        }
        let name = def_insn.displacement(0).symbol_name()?;
        let label = unit
            .label_entry(name)
            .unwrap_or_else(|| panic!("unable to find label: {}", name));
        Some(label)
    }

    /// The va_arg register-save dispatch:
    ///
    /// ```text
    ///     jmp *%reg
    /// [label:]
    ///     movaps %xmmN, IMM(%rax)     (one or more)
    ///     ...
    ///     <next instruction>
    /// ```
    ///
    /// Every `movaps` and the following instruction are possible targets.
    fn vaarg_pattern(&self, unit: &Unit, e: Entry, insn: &x86::Insn) -> Vec<Entry> {
        let mut pattern = Vec::new();
        if !insn.is_indirect_jump() || !insn.is_register_operand(0) {
            return pattern;
        }
        let mut cursor = unit.next(e);
        if let Some(n) = cursor {
            if unit[n].data.is_label() {
                cursor = unit.next(n);
            }
        }
        while let Some(n) = cursor {
            match &unit[n].data {
                EntryData::Insn(i) if i.insn.op() == Op::Movaps => {
                    pattern.push(n);
                    cursor = unit.next(n);
                }
                _ => break,
            }
        }
        // The instruction following the movaps run is also a target.
        while let Some(n) = cursor {
            if unit[n].data.is_insn() {
                break;
            }
            cursor = unit.next(n);
        }
        if let Some(n) = cursor {
            pattern.push(n);
        }
        if pattern.len() > 1 {
            pattern
        } else {
            Vec::new()
        }
    }
}
