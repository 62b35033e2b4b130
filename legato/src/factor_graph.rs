//! Segmentation lattice of a single string.

use std::io::Write;

use hashbrown::HashSet;

use crate::common::{char_positions, Vocab};
use crate::errors::Result;
use crate::lexicon::Lexicon;

/// Arc of a factor graph.
#[derive(Debug, Clone)]
pub(crate) struct Arc {
    pub(crate) source: u32,
    pub(crate) target: u32,
    /// Written by the dynamic-programming passes; not part of the structure.
    pub(crate) cost: f64,
    removed: bool,
}

/// Node of a factor graph, pointing at a span of the text. The sentinels
/// have `len == 0` and stand for the boundary symbol.
#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub(crate) start_pos: usize,
    pub(crate) len: usize,
    pub(crate) incoming: Vec<u32>,
    pub(crate) outgoing: Vec<u32>,
}

/// A directed acyclic lattice enumerating every segmentation of a string
/// into factors of a lexicon.
///
/// Node 0 is the start sentinel and the last node is the end sentinel; both
/// carry the boundary symbol. Nodes are stored in topological order. A
/// string with no legal segmentation yields an empty graph.
pub struct FactorGraph {
    text: String,
    boundary: String,
    pub(crate) nodes: Vec<Node>,
    pub(crate) arcs: Vec<Arc>,
}

impl FactorGraph {
    /// Builds the lattice of `text` over a trie-indexed lexicon.
    pub fn new(text: &str, boundary: &str, lexicon: &Lexicon, utf8: bool) -> Self {
        let mut graph = Self {
            text: text.to_string(),
            boundary: boundary.to_string(),
            nodes: vec![],
            arcs: vec![],
        };
        if text.is_empty() {
            return graph;
        }

        let mut incoming: Vec<HashSet<usize>> = vec![HashSet::new(); text.len() + 1];
        incoming[0].insert(0);

        graph.nodes.push(Node {
            start_pos: 0,
            len: 0,
            incoming: vec![],
            outgoing: vec![],
        });
        let bytes = text.as_bytes();
        for start in char_positions(text, utf8) {
            if incoming[start].is_empty() {
                continue;
            }
            for m in lexicon.common_prefix_iterator(&bytes[start..]) {
                let end = start + m.end_byte;
                graph.nodes.push(Node {
                    start_pos: start,
                    len: end - start,
                    incoming: vec![],
                    outgoing: vec![],
                });
                incoming[end].insert(start);
            }
        }

        graph.finish(incoming);
        graph
    }

    /// Builds the lattice of `text` from a plain vocabulary map, considering
    /// factors of up to `max_len` characters.
    pub fn from_vocab_map(
        text: &str,
        boundary: &str,
        vocab: &Vocab,
        max_len: usize,
        utf8: bool,
    ) -> Self {
        let mut graph = Self {
            text: text.to_string(),
            boundary: boundary.to_string(),
            nodes: vec![],
            arcs: vec![],
        };
        if text.is_empty() {
            return graph;
        }

        let mut incoming: Vec<HashSet<usize>> = vec![HashSet::new(); text.len() + 1];
        incoming[0].insert(0);

        graph.nodes.push(Node {
            start_pos: 0,
            len: 0,
            incoming: vec![],
            outgoing: vec![],
        });
        let positions = char_positions(text, utf8);
        for (i, &start) in positions.iter().enumerate() {
            if incoming[start].is_empty() {
                continue;
            }
            for j in i..positions.len().min(i + max_len) {
                let end = if j + 1 < positions.len() {
                    positions[j + 1]
                } else {
                    text.len()
                };
                if vocab.contains_key(&text[start..end]) {
                    graph.nodes.push(Node {
                        start_pos: start,
                        len: end - start,
                        incoming: vec![],
                        outgoing: vec![],
                    });
                    incoming[end].insert(start);
                }
            }
        }

        graph.finish(incoming);
        graph
    }

    /// Reachability prune and arc creation shared by the constructors.
    fn finish(&mut self, incoming: Vec<HashSet<usize>>) {
        let text_len = self.text.len();
        if incoming[text_len].is_empty() {
            self.nodes.clear();
            return;
        }

        // Positions lying on some complete path, collected right to left.
        let mut possible_starts: HashSet<usize> = HashSet::new();
        possible_starts.insert(text_len);
        for i in (0..incoming.len()).rev() {
            if !possible_starts.contains(&i) {
                continue;
            }
            for &src in &incoming[i] {
                possible_starts.insert(src);
            }
        }

        self.nodes.retain(|node| {
            possible_starts.contains(&node.start_pos)
                && possible_starts.contains(&(node.start_pos + node.len))
        });

        self.nodes.push(Node {
            start_pos: text_len,
            len: 0,
            incoming: vec![],
            outgoing: vec![],
        });

        let mut nodes_by_start: Vec<Vec<u32>> = vec![vec![]; text_len + 1];
        for i in 1..self.nodes.len() {
            nodes_by_start[self.nodes[i].start_pos].push(i as u32);
        }

        for i in 0..self.nodes.len() - 1 {
            let end_pos = self.nodes[i].start_pos + self.nodes[i].len;
            for j in 0..nodes_by_start[end_pos].len() {
                let target = nodes_by_start[end_pos][j];
                let arc = self.arcs.len() as u32;
                self.arcs.push(Arc {
                    source: i as u32,
                    target,
                    cost: 0.0,
                    removed: false,
                });
                self.nodes[i].outgoing.push(arc);
                self.nodes[target as usize].incoming.push(arc);
            }
        }
    }

    /// The string this lattice was built for.
    #[inline(always)]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// The boundary symbol carried by the sentinel nodes.
    #[inline(always)]
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// True when the string had no legal segmentation.
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of nodes, sentinels included.
    #[inline(always)]
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Number of live arcs.
    pub fn num_arcs(&self) -> usize {
        self.arcs.iter().filter(|a| !a.removed).count()
    }

    /// The factor carried by a node.
    pub fn factor(&self, node: usize) -> &str {
        let node = &self.nodes[node];
        if node.len == 0 {
            &self.boundary
        } else {
            &self.text[node.start_pos..node.start_pos + node.len]
        }
    }

    /// Counts the distinct segmentations.
    pub fn num_paths(&self) -> u64 {
        if self.nodes.is_empty() {
            return 0;
        }
        let mut path_counts = vec![0u64; self.nodes.len()];
        path_counts[0] = 1;
        for i in 0..self.nodes.len() {
            for &arc in &self.nodes[i].outgoing {
                path_counts[self.arcs[arc as usize].target as usize] += path_counts[i];
            }
        }
        *path_counts.last().unwrap_or(&0)
    }

    /// Enumerates every segmentation, boundary symbols included. Exponential
    /// in the worst case; callers bound the input length.
    pub fn paths(&self) -> Vec<Vec<String>> {
        let mut paths = vec![];
        if self.nodes.is_empty() {
            return paths;
        }
        self.advance(&mut paths, &mut vec![], 0);
        paths
    }

    fn advance(&self, paths: &mut Vec<Vec<String>>, current: &mut Vec<String>, node: usize) {
        current.push(self.factor(node).to_string());
        if node == self.nodes.len() - 1 {
            paths.push(current.clone());
        } else {
            for &arc in &self.nodes[node].outgoing {
                let mut branch = current.clone();
                self.advance(paths, &mut branch, self.arcs[arc as usize].target as usize);
            }
        }
    }

    fn remove_arc(&mut self, arc: u32) {
        let (source, target) = {
            let a = &mut self.arcs[arc as usize];
            a.removed = true;
            (a.source, a.target)
        };
        self.nodes[source as usize].outgoing.retain(|&a| a != arc);
        self.nodes[target as usize].incoming.retain(|&a| a != arc);
    }

    /// Removes every arc in or out of nodes carrying `factor`, then prunes
    /// dangling arcs until every remaining node lies on a complete path.
    pub fn remove_arcs(&mut self, factor: &str) {
        for node in 0..self.nodes.len() {
            if self.factor(node) != factor {
                continue;
            }
            while let Some(&arc) = self.nodes[node].incoming.first() {
                self.remove_arc(arc);
            }
            while let Some(&arc) = self.nodes[node].outgoing.first() {
                self.remove_arc(arc);
            }
        }
        self.prune_dangling();
    }

    /// Removes every arc whose endpoints carry the given factor pair, then
    /// prunes dangling arcs as [`FactorGraph::remove_arcs`] does.
    pub fn remove_arcs_between(&mut self, source: &str, target: &str) {
        for node in 0..self.nodes.len() {
            if self.factor(node) != source {
                continue;
            }
            for i in 0..self.nodes[node].outgoing.len() {
                let arc = self.nodes[node].outgoing[i];
                if self.factor(self.arcs[arc as usize].target as usize) == target {
                    self.remove_arc(arc);
                    break;
                }
            }
        }
        self.prune_dangling();
    }

    fn prune_dangling(&mut self) {
        loop {
            let mut changed = false;
            for node in 0..self.nodes.len() {
                if self.nodes[node].len == 0 {
                    continue;
                }
                if self.nodes[node].incoming.is_empty() {
                    while let Some(&arc) = self.nodes[node].outgoing.first() {
                        self.remove_arc(arc);
                        changed = true;
                    }
                } else if self.nodes[node].outgoing.is_empty() {
                    while let Some(&arc) = self.nodes[node].incoming.first() {
                        self.remove_arc(arc);
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// Structural equality: same node order and the same arc lists.
    pub fn assert_equal(&self, other: &Self) -> bool {
        if self.nodes.len() != other.nodes.len() {
            return false;
        }
        for (a, b) in self.nodes.iter().zip(other.nodes.iter()) {
            if a.start_pos != b.start_pos || a.len != b.len {
                return false;
            }
            if a.incoming.len() != b.incoming.len() || a.outgoing.len() != b.outgoing.len() {
                return false;
            }
            let ends = |graph: &Self, arcs: &[u32]| -> Vec<(u32, u32)> {
                arcs.iter()
                    .map(|&i| {
                        let arc = &graph.arcs[i as usize];
                        (arc.source, arc.target)
                    })
                    .collect()
            };
            if ends(self, &a.incoming) != ends(other, &b.incoming)
                || ends(self, &a.outgoing) != ends(other, &b.outgoing)
            {
                return false;
            }
        }
        true
    }

    /// Writes the lattice as a Graphviz digraph.
    pub fn write_dot<W>(&self, wtr: &mut W) -> Result<()>
    where
        W: Write,
    {
        writeln!(wtr, "digraph {{")?;
        writeln!(wtr, "\trankdir=LR;")?;
        for node in 0..self.nodes.len() {
            writeln!(wtr, "\t{} [label=\"{}\"]", node, self.factor(node))?;
        }
        for arc in self.arcs.iter().filter(|a| !a.removed) {
            writeln!(wtr, "\t{} -> {};", arc.source, arc.target)?;
        }
        writeln!(wtr, "}}")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab(entries: &[(&str, f64)]) -> Vocab {
        entries
            .iter()
            .map(|(f, s)| (f.to_string(), *s))
            .collect()
    }

    fn lexicon(entries: &[(&str, f64)]) -> Lexicon {
        Lexicon::from_vocab(&vocab(entries), true)
    }

    #[test]
    fn test_construction() {
        let lex = lexicon(&[("a", -1.0), ("b", -1.0), ("c", -1.0), ("bc", -1.0)]);
        let fg = FactorGraph::new("abc", "*", &lex, false);
        // start, a, b, bc, c, end
        assert_eq!(fg.num_nodes(), 6);
        assert_eq!(fg.num_paths(), 2);
        assert_eq!(fg.factor(0), "*");
        assert_eq!(fg.factor(fg.num_nodes() - 1), "*");
    }

    #[test]
    fn test_unreachable_nodes_are_pruned() {
        // "b" matches inside the text but lies on no complete path.
        let lex = lexicon(&[("a", -1.0), ("abc", -1.0), ("b", -1.0)]);
        let fg = FactorGraph::new("abc", "*", &lex, false);
        assert_eq!(fg.num_nodes(), 3);
        assert_eq!(fg.num_paths(), 1);
        assert_eq!(fg.paths(), vec![vec!["*", "abc", "*"]]);
    }

    #[test]
    fn test_unsegmentable_text_gives_empty_graph() {
        let lex = lexicon(&[("a", -1.0)]);
        let fg = FactorGraph::new("ab", "*", &lex, false);
        assert!(fg.is_empty());
        assert_eq!(fg.num_paths(), 0);
        assert!(fg.paths().is_empty());
    }

    #[test]
    fn test_from_vocab_map_matches_lexicon_construction() {
        let v = vocab(&[("k", -1.0), ("i", -1.0), ("s", -1.0), ("sa", -1.0), ("kis", -1.0)]);
        let lex = Lexicon::from_vocab(&v, true);
        let a = FactorGraph::new("kissa", "*", &lex, false);
        let b = FactorGraph::from_vocab_map("kissa", "*", &v, 3, false);
        assert!(a.assert_equal(&b));
    }

    #[test]
    fn test_max_len_bounds_map_construction() {
        let v = vocab(&[("a", -1.0), ("ab", -1.0), ("b", -1.0)]);
        let fg = FactorGraph::from_vocab_map("ab", "*", &v, 1, false);
        // "ab" is ruled out by max_len = 1.
        assert_eq!(fg.num_paths(), 1);
    }

    #[test]
    fn test_paths() {
        let lex = lexicon(&[("a", -1.0), ("b", -1.0), ("ab", -1.0)]);
        let fg = FactorGraph::new("ab", "*", &lex, false);
        let mut paths = fg.paths();
        paths.sort();
        assert_eq!(
            paths,
            vec![vec!["*", "a", "b", "*"], vec!["*", "ab", "*"]]
        );
    }

    #[test]
    fn test_remove_arcs_factor() {
        let lex = lexicon(&[("a", -1.0), ("b", -1.0), ("ab", -1.0)]);
        let mut fg = FactorGraph::new("ab", "*", &lex, false);
        fg.remove_arcs("ab");
        assert_eq!(fg.num_paths(), 1);
        assert_eq!(fg.paths(), vec![vec!["*", "a", "b", "*"]]);
        for node in 0..fg.num_nodes() {
            if fg.factor(node) == "ab" {
                assert!(fg.nodes[node].incoming.is_empty());
                assert!(fg.nodes[node].outgoing.is_empty());
            }
        }
    }

    #[test]
    fn test_remove_arcs_cascades() {
        // Removing "b" must also disconnect "a", which then has no
        // continuation.
        let lex = lexicon(&[("a", -1.0), ("b", -1.0), ("ab", -1.0)]);
        let mut fg = FactorGraph::new("ab", "*", &lex, false);
        fg.remove_arcs("b");
        assert_eq!(fg.num_paths(), 1);
        for node in 0..fg.num_nodes() {
            if fg.factor(node) == "a" {
                assert!(fg.nodes[node].incoming.is_empty());
                assert!(fg.nodes[node].outgoing.is_empty());
            }
        }
    }

    #[test]
    fn test_remove_arcs_between() {
        let lex = lexicon(&[("a", -1.0), ("b", -1.0), ("c", -1.0), ("bc", -1.0)]);
        let mut fg = FactorGraph::new("abc", "*", &lex, false);
        fg.remove_arcs_between("b", "c");
        assert_eq!(fg.num_paths(), 1);
        assert_eq!(fg.paths(), vec![vec!["*", "a", "bc", "*"]]);
    }

    #[test]
    fn test_utf8_boundaries() {
        let lex = lexicon(&[("ä", -1.0), ("k", -1.0), ("si", -1.0)]);
        let fg = FactorGraph::new("käsi", "*", &lex, true);
        assert_eq!(fg.num_paths(), 1);
        assert_eq!(fg.paths(), vec![vec!["*", "k", "ä", "si", "*"]]);
    }
}
