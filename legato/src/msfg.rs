//! Multi-string factor graph: the merged segmentation lattice of a corpus.

use std::collections::BinaryHeap;
use std::cmp::Reverse;
use std::io::{BufRead, BufReader, Read, Write};

use hashbrown::{HashMap, HashSet};
use log::warn;

use crate::common::Vocab;
use crate::errors::{LegatoError, Result};
use crate::factor_graph::FactorGraph;
use crate::transitions::{CellId, Transitions, INVALID_CELL};

/// Arc of a multi-string factor graph. The cost is a handle into the cell
/// store of the table the graph was last scored with.
#[derive(Debug, Clone)]
pub(crate) struct Arc {
    pub(crate) source: u32,
    pub(crate) target: u32,
    pub(crate) cell: CellId,
    removed: bool,
}

/// Node of a multi-string factor graph.
#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub(crate) factor: String,
    pub(crate) incoming: Vec<u32>,
    pub(crate) outgoing: Vec<u32>,
}

/// The vertex-merged union of the factor graphs of many strings.
///
/// Node 0 is the shared start sentinel; every added string gets its own end
/// sentinel, reachable by following the string's segmentations. The graph is
/// built once, re-scored cheaply between EM iterations through the arc cell
/// handles, and shrunk by arc removal as the vocabulary is pruned.
pub struct Msfg {
    boundary: String,
    pub(crate) nodes: Vec<Node>,
    pub(crate) arcs: Vec<Arc>,
    /// Indices of the nodes carrying each factor, in creation order.
    pub(crate) factor_node_map: HashMap<String, Vec<u32>>,
    /// (text, end node) pairs in insertion order; the canonical sweep order.
    texts: Vec<(String, u32)>,
    text_index: HashMap<String, usize>,
    /// Cached topological order over node indices.
    topo: Vec<u32>,
    topo_dirty: bool,
    num_live_arcs: usize,
}

impl Msfg {
    /// Creates a graph holding only the start sentinel.
    pub fn new(boundary: &str) -> Self {
        let mut factor_node_map: HashMap<String, Vec<u32>> = HashMap::new();
        factor_node_map.insert(boundary.to_string(), vec![0]);
        Self {
            boundary: boundary.to_string(),
            nodes: vec![Node {
                factor: boundary.to_string(),
                incoming: vec![],
                outgoing: vec![],
            }],
            arcs: vec![],
            factor_node_map,
            texts: vec![],
            text_index: HashMap::new(),
            topo: vec![0],
            topo_dirty: false,
            num_live_arcs: 0,
        }
    }

    /// The boundary symbol carried by the sentinel nodes.
    #[inline(always)]
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Number of nodes ever created, orphaned ones included.
    #[inline(always)]
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Number of live arcs.
    #[inline(always)]
    pub fn num_arcs(&self) -> usize {
        self.num_live_arcs
    }

    /// The registered strings with their end nodes, in insertion order.
    #[inline(always)]
    pub fn texts(&self) -> &[(String, u32)] {
        &self.texts
    }

    /// The end node of a string, if it was added.
    pub fn string_end_node(&self, text: &str) -> Option<u32> {
        self.text_index.get(text).map(|&i| self.texts[i].1)
    }

    /// The factor of a node.
    pub fn factor(&self, node: u32) -> &str {
        &self.nodes[node as usize].factor
    }

    fn create_arc(&mut self, source: u32, target: u32) {
        let arc = self.arcs.len() as u32;
        self.arcs.push(Arc {
            source,
            target,
            cell: INVALID_CELL,
            removed: false,
        });
        self.nodes[source as usize].outgoing.push(arc);
        self.nodes[target as usize].incoming.push(arc);
        self.num_live_arcs += 1;
    }

    fn remove_arc(&mut self, arc: u32) {
        let (source, target) = {
            let a = &mut self.arcs[arc as usize];
            debug_assert!(!a.removed);
            a.removed = true;
            (a.source, a.target)
        };
        self.nodes[source as usize].outgoing.retain(|&a| a != arc);
        self.nodes[target as usize].incoming.retain(|&a| a != arc);
        self.num_live_arcs -= 1;
    }

    /// Merges the factor graph of one string into the shared lattice.
    ///
    /// Sub-paths already present from earlier strings are reused; only the
    /// divergent parts create new nodes. Fails when the graph is empty or
    /// its end sentinel cannot be reached.
    pub fn add(&mut self, fg: &FactorGraph) -> Result<()> {
        if fg.is_empty() {
            return Err(LegatoError::model(format!(
                "unsegmentable string: {}",
                fg.text()
            )));
        }

        // Factor-graph node -> node of this graph, for the current string.
        let mut created: HashMap<u32, u32> = HashMap::new();
        created.insert(0, 0);

        for u in 0..fg.nodes.len() as u32 {
            let mu = match created.get(&u) {
                Some(&mu) => mu,
                None => continue,
            };
            for i in 0..fg.nodes[u as usize].outgoing.len() {
                let fg_arc = fg.nodes[u as usize].outgoing[i];
                let t = fg.arcs[fg_arc as usize].target;
                if let Some(&mt) = created.get(&t) {
                    let exists = self.nodes[mu as usize]
                        .outgoing
                        .iter()
                        .any(|&a| self.arcs[a as usize].target == mt);
                    if !exists {
                        self.create_arc(mu, mt);
                    }
                    continue;
                }

                let factor = fg.factor(t as usize);
                let shared = self.nodes[mu as usize].outgoing.iter().find_map(|&a| {
                    let target = self.arcs[a as usize].target;
                    (self.nodes[target as usize].factor == factor).then_some(target)
                });
                match shared {
                    Some(mt) => {
                        created.insert(t, mt);
                    }
                    None => {
                        let mt = self.nodes.len() as u32;
                        self.nodes.push(Node {
                            factor: factor.to_string(),
                            incoming: vec![],
                            outgoing: vec![],
                        });
                        self.factor_node_map
                            .entry_ref(factor)
                            .or_default()
                            .push(mt);
                        created.insert(t, mt);
                        self.create_arc(mu, mt);
                    }
                }
            }
        }

        let end = created
            .get(&(fg.nodes.len() as u32 - 1))
            .copied()
            .ok_or_else(|| {
                LegatoError::model(format!("end node was not reached for: {}", fg.text()))
            })?;

        match self.text_index.get(fg.text()) {
            Some(&i) => self.texts[i].1 = end,
            None => {
                self.text_index.insert(fg.text().to_string(), self.texts.len());
                self.texts.push((fg.text().to_string(), end));
            }
        }

        self.topo_dirty = true;
        Ok(())
    }

    /// Recomputes the cached topological order if the graph grew since the
    /// last sweep. Fails if the graph contains a cycle, which can only come
    /// from a corrupt serialized file.
    pub fn ensure_topological_order(&mut self) -> Result<()> {
        if !self.topo_dirty {
            return Ok(());
        }
        let mut indegree = vec![0u32; self.nodes.len()];
        for arc in self.arcs.iter().filter(|a| !a.removed) {
            indegree[arc.target as usize] += 1;
        }
        let mut ready: BinaryHeap<Reverse<u32>> = (0..self.nodes.len() as u32)
            .filter(|&n| indegree[n as usize] == 0)
            .map(Reverse)
            .collect();
        let mut topo = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(n)) = ready.pop() {
            topo.push(n);
            for &arc in &self.nodes[n as usize].outgoing {
                let target = self.arcs[arc as usize].target;
                indegree[target as usize] -= 1;
                if indegree[target as usize] == 0 {
                    ready.push(Reverse(target));
                }
            }
        }
        if topo.len() != self.nodes.len() {
            return Err(LegatoError::model("the graph contains a cycle"));
        }
        self.topo = topo;
        self.topo_dirty = false;
        Ok(())
    }

    /// The cached topological order. Sweeps must not run on a stale order.
    #[inline(always)]
    pub(crate) fn topo(&self) -> &[u32] {
        debug_assert!(!self.topo_dirty);
        &self.topo
    }

    /// Nodes lying on some path to `end`, collected over incoming arcs.
    pub(crate) fn reachable_from_end(&self, end: u32) -> HashSet<u32> {
        let mut reachable = HashSet::new();
        let mut stack = vec![end];
        reachable.insert(end);
        while let Some(node) = stack.pop() {
            for &arc in &self.nodes[node as usize].incoming {
                let source = self.arcs[arc as usize].source;
                if reachable.insert(source) {
                    stack.push(source);
                }
            }
        }
        reachable
    }

    /// Stamps every arc with the cell handle of its bigram score and drops
    /// the arcs whose (src, tgt) pair is missing from the table, as well as
    /// every factor the table does not know as a source.
    ///
    /// Fails when the table has a row for a factor the graph does not carry;
    /// the model and the lattice are then out of sync.
    pub fn assign_scores(&mut self, transitions: &Transitions) -> Result<()> {
        self.ensure_topological_order()?;

        for arc in self.arcs.iter_mut() {
            arc.cell = INVALID_CELL;
        }

        for src in transitions.sources_sorted() {
            let node_indices = self.factor_node_map.get(&src).cloned().ok_or_else(|| {
                LegatoError::model(format!("transition row for unknown factor: {}", src))
            })?;
            let row = transitions.row(&src).expect("row exists by construction");
            for &n in &node_indices {
                for i in 0..self.nodes[n as usize].outgoing.len() {
                    let arc = self.nodes[n as usize].outgoing[i];
                    let target = self.arcs[arc as usize].target;
                    if let Some(&cell) = row.get(&self.nodes[target as usize].factor) {
                        self.arcs[arc as usize].cell = cell;
                    }
                }
            }
        }

        self.drop_unscored_arcs();
        self.drop_unknown_factors(|factor| transitions.contains_src(factor));
        Ok(())
    }

    /// Stamps every arc with the unigram score of its target factor and
    /// returns the cell store the handles point into. Arcs into factors
    /// missing from the vocabulary are dropped.
    pub fn assign_unigram_scores(&mut self, vocab: &Vocab) -> Result<Vec<f64>> {
        self.ensure_topological_order()?;

        for arc in self.arcs.iter_mut() {
            arc.cell = INVALID_CELL;
        }

        let mut factors: Vec<_> = self.factor_node_map.keys().cloned().collect();
        factors.sort_unstable();

        let mut cells = Vec::with_capacity(factors.len());
        for factor in &factors {
            let score = match vocab.get(factor) {
                Some(&score) => score,
                None => continue,
            };
            let cell = cells.len() as CellId;
            cells.push(score);
            let node_indices = self.factor_node_map[factor].clone();
            for &n in &node_indices {
                for i in 0..self.nodes[n as usize].incoming.len() {
                    let arc = self.nodes[n as usize].incoming[i];
                    self.arcs[arc as usize].cell = cell;
                }
            }
        }

        self.drop_unscored_arcs();
        self.drop_unknown_factors(|factor| vocab.contains_key(factor));
        Ok(cells)
    }

    fn drop_unscored_arcs(&mut self) {
        for arc in 0..self.arcs.len() as u32 {
            if !self.arcs[arc as usize].removed && self.arcs[arc as usize].cell == INVALID_CELL {
                self.remove_arc(arc);
            }
        }
    }

    fn drop_unknown_factors<F>(&mut self, known: F)
    where
        F: Fn(&str) -> bool,
    {
        let mut unknown: Vec<_> = self
            .factor_node_map
            .keys()
            .filter(|f| f.as_str() != self.boundary && !known(f))
            .cloned()
            .collect();
        unknown.sort_unstable();
        for factor in &unknown {
            self.remove_arcs(factor);
        }
    }

    /// Removes every arc in or out of the nodes carrying `factor` and prunes
    /// dangling arcs until every remaining node is either connected through
    /// or orphaned. The factor disappears from the factor-node map.
    pub fn remove_arcs(&mut self, factor: &str) {
        if factor == self.boundary {
            warn!("refusing to remove the boundary symbol from the graph");
            return;
        }
        let node_indices = match self.factor_node_map.get(factor) {
            Some(indices) => indices.clone(),
            None => return,
        };
        for n in node_indices {
            while let Some(&arc) = self.nodes[n as usize].incoming.first() {
                self.remove_arc(arc);
            }
            while let Some(&arc) = self.nodes[n as usize].outgoing.first() {
                self.remove_arc(arc);
            }
        }
        self.factor_node_map.remove(factor);
        self.prune_unreachable();
    }

    /// Removes arcs for every factor that is not a source of `transitions`.
    pub fn prune_unused(&mut self, transitions: &Transitions) {
        self.drop_unknown_factors(|factor| transitions.contains_src(factor));
    }

    fn prune_unreachable(&mut self) {
        loop {
            let mut changed = false;
            for n in 0..self.nodes.len() {
                if self.nodes[n].factor == self.boundary {
                    continue;
                }
                if self.nodes[n].incoming.is_empty() {
                    while let Some(&arc) = self.nodes[n].outgoing.first() {
                        self.remove_arc(arc);
                        changed = true;
                    }
                } else if self.nodes[n].outgoing.is_empty() {
                    while let Some(&arc) = self.nodes[n].incoming.first() {
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

    /// Counts the distinct segmentations of a registered string.
    pub fn num_paths(&self, text: &str) -> u64 {
        let end = match self.string_end_node(text) {
            Some(end) => end,
            None => return 0,
        };
        let mut memo: HashMap<u32, u64> = HashMap::new();
        let mut stack = vec![end];
        while let Some(&node) = stack.last() {
            if memo.contains_key(&node) {
                stack.pop();
                continue;
            }
            if node == 0 {
                memo.insert(0, 1);
                stack.pop();
                continue;
            }
            let mut ready = true;
            let mut count = 0;
            for &arc in &self.nodes[node as usize].incoming {
                let source = self.arcs[arc as usize].source;
                match memo.get(&source) {
                    Some(&c) => count += c,
                    None => {
                        ready = false;
                        stack.push(source);
                    }
                }
            }
            if ready {
                memo.insert(node, count);
                stack.pop();
            }
        }
        memo[&end]
    }

    /// The set of factors appearing in some segmentation of a registered
    /// string.
    pub fn collect_factors(&self, text: &str) -> Result<HashSet<String>> {
        let end = self.string_end_node(text).ok_or_else(|| {
            LegatoError::model(format!("string is not in the graph: {}", text))
        })?;
        Ok(self
            .reachable_from_end(end)
            .into_iter()
            .map(|n| self.nodes[n as usize].factor.clone())
            .collect())
    }

    /// Writes the graph in its textual format.
    pub fn write<W>(&self, wtr: &mut W) -> Result<()>
    where
        W: Write,
    {
        writeln!(
            wtr,
            "{} {} {}",
            self.nodes.len(),
            self.num_live_arcs,
            self.texts.len()
        )?;
        for (i, node) in self.nodes.iter().enumerate() {
            writeln!(wtr, "n {} {}", i, node.factor)?;
        }
        // Creation order, so that the per-node arc lists survive the round
        // trip exactly.
        for arc in self.arcs.iter().filter(|a| !a.removed) {
            writeln!(wtr, "a {} {}", arc.source, arc.target)?;
        }
        for (text, end) in &self.texts {
            writeln!(wtr, "e {} {}", text, end)?;
        }
        Ok(())
    }

    /// Reads a graph from its textual format. The file must carry dense node
    /// ids starting at 0, node 0 must be the boundary sentinel and the arcs
    /// must form no cycle.
    pub fn read<R>(rdr: R, boundary: &str) -> Result<Self>
    where
        R: Read,
    {
        let mut lines = BufReader::new(rdr).lines();
        let header = lines
            .next()
            .transpose()?
            .ok_or_else(|| LegatoError::invalid_format("msfg", "missing header"))?;
        let mut fields = header.split_whitespace();
        let (num_nodes, num_arcs, num_texts) = match (fields.next(), fields.next(), fields.next())
        {
            (Some(n), Some(a), Some(e)) => (
                n.parse::<usize>()?,
                a.parse::<usize>()?,
                e.parse::<usize>()?,
            ),
            _ => return Err(LegatoError::invalid_format("msfg", "malformed header")),
        };

        let mut msfg = Self::new(boundary);
        msfg.nodes.clear();
        msfg.factor_node_map.clear();
        msfg.topo_dirty = true;

        for i in 0..num_nodes {
            let line = lines
                .next()
                .transpose()?
                .ok_or_else(|| LegatoError::invalid_format("msfg", "truncated node records"))?;
            let mut fields = line.split_whitespace();
            let (id, factor) = match (fields.next(), fields.next(), fields.next()) {
                (Some("n"), Some(id), Some(factor)) => (id.parse::<usize>()?, factor),
                _ => {
                    return Err(LegatoError::invalid_format(
                        "msfg",
                        format!("expected node record: {}", line),
                    ))
                }
            };
            if id != i {
                return Err(LegatoError::invalid_format(
                    "msfg",
                    format!("node ids must be dense, got {} at {}", id, i),
                ));
            }
            msfg.nodes.push(Node {
                factor: factor.to_string(),
                incoming: vec![],
                outgoing: vec![],
            });
            msfg.factor_node_map
                .entry_ref(factor)
                .or_default()
                .push(i as u32);
        }
        if msfg.nodes.is_empty() || msfg.nodes[0].factor != boundary {
            return Err(LegatoError::invalid_format(
                "msfg",
                "node 0 must be the boundary sentinel",
            ));
        }

        for _ in 0..num_arcs {
            let line = lines
                .next()
                .transpose()?
                .ok_or_else(|| LegatoError::invalid_format("msfg", "truncated arc records"))?;
            let mut fields = line.split_whitespace();
            let (source, target) = match (fields.next(), fields.next(), fields.next()) {
                (Some("a"), Some(source), Some(target)) => {
                    (source.parse::<u32>()?, target.parse::<u32>()?)
                }
                _ => {
                    return Err(LegatoError::invalid_format(
                        "msfg",
                        format!("expected arc record: {}", line),
                    ))
                }
            };
            if source as usize >= msfg.nodes.len() || target as usize >= msfg.nodes.len() {
                return Err(LegatoError::invalid_format(
                    "msfg",
                    format!("arc endpoint out of range: {} {}", source, target),
                ));
            }
            msfg.create_arc(source, target);
        }

        for _ in 0..num_texts {
            let line = lines
                .next()
                .transpose()?
                .ok_or_else(|| LegatoError::invalid_format("msfg", "truncated end records"))?;
            let mut fields = line.split_whitespace();
            let (text, end) = match (fields.next(), fields.next(), fields.next()) {
                (Some("e"), Some(text), Some(end)) => (text, end.parse::<u32>()?),
                _ => {
                    return Err(LegatoError::invalid_format(
                        "msfg",
                        format!("expected end record: {}", line),
                    ))
                }
            };
            if end as usize >= msfg.nodes.len() {
                return Err(LegatoError::invalid_format(
                    "msfg",
                    format!("end node out of range: {}", end),
                ));
            }
            msfg.text_index.insert(text.to_string(), msfg.texts.len());
            msfg.texts.push((text.to_string(), end));
        }

        msfg.ensure_topological_order()?;
        Ok(msfg)
    }

    /// Structural equality: same nodes, arcs and end-node registrations.
    pub fn assert_equal(&self, other: &Self) -> bool {
        if self.nodes.len() != other.nodes.len() || self.texts != other.texts {
            return false;
        }
        for (a, b) in self.nodes.iter().zip(other.nodes.iter()) {
            if a.factor != b.factor {
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

    /// Writes the graph as a Graphviz digraph; per-string end sentinels are
    /// filled grey and labeled with their string.
    pub fn write_dot<W>(&self, wtr: &mut W) -> Result<()>
    where
        W: Write,
    {
        let mut end_texts: HashMap<u32, &str> = HashMap::new();
        for (text, end) in &self.texts {
            end_texts.insert(*end, text);
        }

        writeln!(wtr, "digraph {{")?;
        writeln!(wtr, "\trankdir=LR;")?;
        for (i, node) in self.nodes.iter().enumerate() {
            match end_texts.get(&(i as u32)) {
                Some(text) => writeln!(
                    wtr,
                    "\t{} [label=\"{} / {}\", style=filled, fillcolor=grey]",
                    i, node.factor, text
                )?,
                None => writeln!(wtr, "\t{} [label=\"{}\"]", i, node.factor)?,
            }
        }
        for arc in self.arcs.iter().filter(|a| !a.removed) {
            writeln!(wtr, "\t{} -> {};", arc.source, arc.target)?;
        }
        writeln!(wtr, "}}")?;
        Ok(())
    }
}
