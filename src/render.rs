//! Graphviz document generation and the external `dot` invocation.
//!
//! Rendering happens in two passes. The first snapshots the largest
//! visit count into every node so color choice becomes a pure function
//! of node state; the second walks the nodes in ascending key order and
//! emits definitions, then relations, so structurally equal graphs
//! always produce byte-identical documents.

use std::path::Path;
use std::process::Command;

use crate::error::{Error, Result};
use crate::graph::FlowGraph;
use crate::node::Node;

/// Fixed document preamble declaring the default node styling.
const DIGRAPH_PREFIX: &str = r#"
digraph control_flow_graph {
	node [
		shape = box
		color = black
		arrowhead = diamond
		style = filled
		fontname = "Source Code Pro"
		arrowtail = normal
	]
"#;

/// Size of the blues9 color scheme palette.
const PALETTE_SIZE: usize = 9;

impl FlowGraph {
    /// Render the whole graph as a Graphviz document.
    pub fn graphviz(&mut self) -> String {
        self.set_max_visits();

        let mut document = String::from(DIGRAPH_PREFIX);
        for node in self.nodes.values() {
            document.push_str(&node.graphviz_definition());
        }
        for node in self.nodes.values() {
            document.push_str(&node.graphviz_relation());
        }
        document.push_str("\n}");
        document
    }

    /// Snapshot the largest visit count into every node.
    fn set_max_visits(&mut self) {
        let max = self
            .nodes
            .values()
            .map(|node| u64::from(node.visits))
            .max()
            .unwrap_or(0);
        for node in self.nodes.values_mut() {
            node.max_visits_in_graph = max;
        }
    }
}

impl Node {
    /// Quoted-name form of the entry address.
    pub fn name(&self) -> String {
        format!("0x{:08X}", self.entry)
    }

    /// Definition lines declaring this node, its label and its color.
    pub fn graphviz_definition(&self) -> String {
        format!(
            "\n\t\"{}\" [\n\t\t{}\n\t\t{}\n\t]\n",
            self.name(),
            self.graphviz_label(),
            self.graphviz_color()
        )
    }

    /// Relation lines for the outgoing edges, taken path first.
    pub fn graphviz_relation(&self) -> String {
        let mut relations = String::new();
        if self.true_succ != 0 {
            relations.push_str(&format!(
                "\"0x{:08X}\" -> \"0x{:08X}\" [color=green penwidth=2.0] \n",
                self.entry, self.true_succ
            ));
        }
        if self.false_succ != 0 {
            relations.push_str(&format!(
                "\"0x{:08X}\" -> \"0x{:08X}\" [color=red penwidth=2.0] \n",
                self.entry, self.false_succ
            ));
        }
        relations
    }

    fn graphviz_label(&self) -> String {
        let mut code_block = format!("{}\\l", self.name());
        if !self.body.is_empty() {
            code_block.push_str("\\l");
        }
        for inst in &self.body {
            code_block.push_str(&inst.display_text());
            code_block.push_str("\\l");
        }
        format!("label = \"{code_block}\"")
    }

    fn graphviz_color(&self) -> String {
        if self.is_terminal() {
            return "color = \"plum1\"".to_string();
        }

        let color = pick_color(self.max_visits_in_graph, self.visits);
        let mut attrs = format!("colorscheme = blues9\n\t\tcolor = {color}");
        if color >= 7 {
            attrs.push_str("\n\t\tfontcolor = white");
        }
        attrs.push('\n');
        attrs
    }
}

/// Choose a blues9 palette index from a visit count relative to the
/// graph-wide maximum.
///
/// The percentage scale is split into nine intervals of equal width,
/// with the last upper bound pulled back to 99 so a full-frequency
/// block still lands inside the palette. A value in the lowest interval
/// picks 1, one at or above the start of the highest picks 9, anything
/// else rounds to the nearer of the two indices meeting at its
/// interval's midpoint.
fn pick_color(max: u64, visits: u32) -> u32 {
    if max == 1 && visits == 1 {
        return 1;
    }
    if max == 0 {
        return 1;
    }

    let split = 100.0 / PALETTE_SIZE as f64;
    let lo = |i: usize| split * i as f64;
    let hi = |i: usize| {
        if i == PALETTE_SIZE - 1 {
            99.0
        } else {
            split * (i + 1) as f64
        }
    };

    // Scaling before dividing keeps the boundary percentages bit-equal
    // to the interval bounds they are compared against.
    let percent = f64::from(visits) * 100.0 / max as f64;

    if percent <= hi(0) {
        return 1;
    }
    if percent >= lo(PALETTE_SIZE - 1) {
        return PALETTE_SIZE as u32;
    }

    for i in 1..PALETTE_SIZE - 1 {
        let (low, high) = (lo(i), hi(i));
        if percent >= low && percent <= high {
            let half = (low + high) / 2.0;
            return if percent <= half { i as u32 + 1 } else { i as u32 + 2 };
        }
    }

    1
}

/// Run the external diagram tool over an emitted `.dot` file.
///
/// Anything on stderr, or an abnormal exit, is reported as a renderer
/// failure; the in-memory graph is unaffected either way.
pub fn render_png(dot_path: &Path, png_path: &Path) -> Result<()> {
    let output = Command::new("dot")
        .arg("-Tpng")
        .arg(dot_path)
        .arg(format!("-o{}", png_path.display()))
        .output()
        .map_err(|err| Error::RendererFailure(err.to_string()))?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.is_empty() {
        return Err(Error::RendererFailure(stderr.into_owned()));
    }
    if !output.status.success() {
        return Err(Error::RendererFailure(format!(
            "dot exited with {}",
            output.status
        )));
    }
    Ok(())
}
