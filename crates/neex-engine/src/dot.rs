use std::io;

use petgraph::visit::EdgeRef;

use crate::{Built, Engine};

impl Engine<Built> {
    /// Render the task graph as Graphviz DOT, edges pointing from each
    /// task to what it waits on. Output is sorted so the rendering is
    /// stable across runs.
    pub fn dot_graph<W: io::Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(b"digraph tasks {\n")?;

        let mut nodes: Vec<String> = self
            .task_graph
            .node_weights()
            .map(|task| format!("\t\"{task}\""))
            .collect();
        nodes.sort();
        for node in nodes {
            writer.write_all(node.as_bytes())?;
            writer.write_all(b"\n")?;
        }

        let mut edges: Vec<String> = self
            .task_graph
            .edge_references()
            .map(|edge| {
                let source = &self.task_graph[edge.source()];
                let target = &self.task_graph[edge.target()];
                format!("\t\"{source}\" -> \"{target}\"")
            })
            .collect();
        edges.sort();
        for edge in edges {
            writer.write_all(edge.as_bytes())?;
            writer.write_all(b"\n")?;
        }

        writer.write_all(b"}\n")?;
        Ok(())
    }
}
