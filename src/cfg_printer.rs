//! Text renderings of a CFG for offline viewing, in DOT and VCG form.

use core::fmt::{self, Write};
use cranelift_entity::EntityRef;

use crate::cfg::ControlFlowGraph;
use crate::ir::Unit;

/// Escape a line for inclusion in a DOT or VCG label: `<`, `>` and `"` are
/// escaped, tabs become spaces.
fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => out.push_str("\\<"),
            '>' => out.push_str("\\>"),
            '"' => out.push_str("\\\""),
            '\t' => out.push(' '),
            _ => out.push(c),
        }
    }
    out
}

/// A utility for pretty-printing the CFG of a function.
pub struct CfgPrinter<'a> {
    unit: &'a Unit,
    cfg: &'a ControlFlowGraph,
    include_entries: bool,
}

impl<'a> CfgPrinter<'a> {
    /// Create a printer. With `include_entries` the body of every block is
    /// rendered into the node label.
    pub fn new(unit: &'a Unit, cfg: &'a ControlFlowGraph, include_entries: bool) -> Self {
        Self {
            unit,
            cfg,
            include_entries,
        }
    }

    fn node_label(&self, bb: crate::ir::Bb) -> String {
        let block = self.cfg.block(bb);
        let mut label = format!("bb{}: {}", bb.index(), escape(&block.label));
        if self.include_entries {
            for e in self.cfg.bb_entries(self.unit, bb) {
                label.push_str("\\n");
                label.push_str(&escape(&self.unit[e].data.to_string()));
            }
        }
        label
    }

    /// Write the graph in DOT format.
    pub fn write_dot(&self, w: &mut dyn Write) -> fmt::Result {
        writeln!(w, "digraph \"CFG\" {{")?;
        writeln!(w, "  node [shape=box]")?;
        for bb in self.cfg.blocks() {
            writeln!(
                w,
                "  bb{} [label=\"{}\"{}]",
                bb.index(),
                self.node_label(bb),
                if bb.index() < 2 { " color=red" } else { "" }
            )?;
        }
        for bb in self.cfg.blocks() {
            for &edge in &self.cfg.block(bb).out_edges {
                let data = self.cfg.edge(edge);
                writeln!(
                    w,
                    "  bb{} -> bb{}{}",
                    data.source.index(),
                    data.dest.index(),
                    if data.fallthrough { " [style=dotted]" } else { "" }
                )?;
            }
        }
        writeln!(w, "}}")
    }

    /// Write the graph in VCG format.
    pub fn write_vcg(&self, w: &mut dyn Write) -> fmt::Result {
        writeln!(w, "graph: {{ title: \"CFG\"")?;
        writeln!(w, "splines: yes")?;
        writeln!(w, "layoutalgorithm: dfs")?;
        writeln!(w)?;
        writeln!(w, "node.color: lightyellow")?;
        writeln!(w, "node.textcolor: blue")?;
        writeln!(w, "edge.arrowsize: 15")?;
        for bb in self.cfg.blocks() {
            writeln!(
                w,
                "node: {{ title: \"bb{}\" label: \"{}\" {}}}",
                bb.index(),
                self.node_label(bb),
                if bb.index() < 2 { "color: red " } else { "" }
            )?;
            for &edge in &self.cfg.block(bb).out_edges {
                let data = self.cfg.edge(edge);
                writeln!(
                    w,
                    "edge: {{ sourcename: \"bb{}\" targetname: \"bb{}\" }}",
                    data.source.index(),
                    data.dest.index()
                )?;
            }
        }
        writeln!(w, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{branch, build_func, rr, E};
    use crate::x86::{Insn, Op};

    fn rendered(include_entries: bool) -> (String, String) {
        let mut f = build_func(vec![
            E::L(".L1"),
            E::I(rr(Op::Mov, "eax", "ebx")),
            E::I(branch(Op::Jmp, ".L2")),
            E::L(".L2"),
            E::I(Insn::new(Op::Ret)),
        ]);
        let cfg = ControlFlowGraph::build(&mut f.unit, f.func, false);
        let printer = CfgPrinter::new(&f.unit, &cfg, include_entries);
        let mut dot = String::new();
        printer.write_dot(&mut dot).unwrap();
        let mut vcg = String::new();
        printer.write_vcg(&mut vcg).unwrap();
        (dot, vcg)
    }

    #[test]
    fn dot_output_shape() {
        let (dot, _) = rendered(true);
        assert!(dot.starts_with("digraph"));
        assert!(dot.contains("bb2 [label=\"bb2: .L1"));
        assert!(dot.contains("bb2 -> bb3"));
        // Sentinel names are escaped, instructions use spaces for tabs.
        assert!(dot.contains("\\<SOURCE\\>"));
        assert!(dot.contains(" mov %eax, %ebx"));
        assert!(!dot.contains('\t'));
    }

    #[test]
    fn vcg_output_shape() {
        let (_, vcg) = rendered(false);
        assert!(vcg.starts_with("graph: { title: \"CFG\""));
        assert!(vcg.contains("node: { title: \"bb0\""));
        assert!(vcg.contains("edge: { sourcename:"));
        assert!(vcg.ends_with("}\n"));
    }
}
