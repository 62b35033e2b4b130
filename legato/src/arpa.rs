//! ARPA n-gram model reader for the string-scoring utility.
//!
//! The model is stored as a prefix tree with sorted arc arrays and backoff
//! links. Probabilities are kept in log10 as the ARPA format defines them;
//! callers convert to natural log at use.

use std::io::{BufRead, BufReader, Read};

use hashbrown::HashMap;

use crate::errors::{LegatoError, Result};

const NO_ARC: u32 = u32::MAX;

#[derive(Clone)]
struct Node {
    prob: f64,
    backoff_prob: f64,
    backoff_node: u32,
    first_arc: u32,
    last_arc: u32,
}

impl Default for Node {
    fn default() -> Self {
        Self {
            prob: 0.0,
            backoff_prob: 0.0,
            backoff_node: 0,
            first_arc: NO_ARC,
            last_arc: NO_ARC,
        }
    }
}

struct NgramInfo {
    ngram: Vec<u32>,
    prob: f64,
    backoff_prob: f64,
}

/// A backoff n-gram model read from an ARPA file.
pub struct Ngram {
    nodes: Vec<Node>,
    arc_words: Vec<u32>,
    arc_targets: Vec<u32>,
    vocabulary: Vec<String>,
    lookup: HashMap<String, u32>,
    max_order: usize,
}

impl Ngram {
    /// Index of the empty-context root node.
    pub const ROOT: u32 = 0;

    /// The highest n-gram order of the model.
    #[inline(always)]
    pub fn max_order(&self) -> usize {
        self.max_order
    }

    /// Number of distinct unigram symbols.
    #[inline(always)]
    pub fn num_symbols(&self) -> usize {
        self.vocabulary.len()
    }

    /// The symbol id of a word, if the model knows it.
    pub fn symbol(&self, word: &str) -> Option<u32> {
        self.lookup.get(word).copied()
    }

    fn find_node(&self, node: u32, word: u32) -> Option<u32> {
        let node = &self.nodes[node as usize];
        if node.first_arc == NO_ARC {
            return None;
        }
        let first = node.first_arc as usize;
        let last = node.last_arc as usize + 1;
        let arcs = &self.arc_words[first..last];
        arcs.binary_search(&word)
            .ok()
            .map(|i| self.arc_targets[first + i])
    }

    /// Scores one symbol in the given context node, backing off as needed.
    /// Returns the context node for the next symbol and the added log10
    /// probability.
    pub fn score(&self, mut node: u32, word: u32) -> (u32, f64) {
        let mut score = 0.0;
        loop {
            if let Some(next) = self.find_node(node, word) {
                score += self.nodes[next as usize].prob;
                let context = if self.nodes[next as usize].first_arc == NO_ARC {
                    self.nodes[next as usize].backoff_node
                } else {
                    next
                };
                return (context, score);
            }
            score += self.nodes[node as usize].backoff_prob;
            if node == Self::ROOT {
                // Unknown symbols never reach here through `symbol`.
                return (Self::ROOT, score);
            }
            node = self.nodes[node as usize].backoff_node;
        }
    }

    /// Reads a standard ARPA file: `\data\` header with per-order counts,
    /// then one `\N-grams:` section per order. Probabilities must be
    /// non-positive log10 values; duplicate n-grams and n-grams missing
    /// their lower-order prefix are rejected.
    pub fn read_arpa<R>(rdr: R) -> Result<Self>
    where
        R: Read,
    {
        fn next_line<B: BufRead>(lines: &mut std::io::Lines<B>) -> Result<String> {
            lines
                .next()
                .transpose()?
                .ok_or_else(|| LegatoError::invalid_format("arpa", "unexpected end of file"))
        }

        let mut lines = BufReader::new(rdr).lines();
        let mut line = next_line(&mut lines)?;
        while line.trim().is_empty() {
            line = next_line(&mut lines)?;
        }
        if !line.contains("\\data\\") {
            return Err(LegatoError::invalid_format("arpa", "missing \\data\\ header"));
        }

        let mut counts_per_order = vec![];
        line = next_line(&mut lines)?;
        while !line.trim().is_empty() {
            let count = line
                .strip_prefix("ngram ")
                .and_then(|rest| rest.split('=').nth(1))
                .ok_or_else(|| {
                    LegatoError::invalid_format("arpa", format!("bad count line: {}", line))
                })?;
            counts_per_order.push(count.trim().parse::<usize>()?);
            line = next_line(&mut lines)?;
        }
        if counts_per_order.is_empty() {
            return Err(LegatoError::invalid_format("arpa", "no n-gram counts"));
        }

        let total_count: usize = counts_per_order.iter().sum();
        let mut model = Self {
            nodes: vec![Node::default(); total_count + 1],
            arc_words: vec![0; total_count],
            arc_targets: vec![0; total_count],
            vocabulary: vec![],
            lookup: HashMap::new(),
            max_order: 0,
        };

        let mut next_node = 1u32;
        let mut next_arc = 0u32;
        for (order_idx, &expected) in counts_per_order.iter().enumerate() {
            let order = order_idx + 1;
            line = next_line(&mut lines)?;
            while line.trim().is_empty() {
                line = next_line(&mut lines)?;
            }
            if !line.contains("-grams") {
                return Err(LegatoError::invalid_format(
                    "arpa",
                    format!("expected a -grams: section, got: {}", line),
                ));
            }

            let mut order_ngrams = vec![];
            loop {
                line = match lines.next().transpose()? {
                    Some(line) => line,
                    None => break,
                };
                if line.trim().is_empty() {
                    break;
                }
                order_ngrams.push(model.parse_ngram_line(&line, order)?);
            }
            if order_ngrams.len() != expected {
                return Err(LegatoError::invalid_format(
                    "arpa",
                    format!(
                        "order {} promises {} n-grams but carries {}",
                        order,
                        expected,
                        order_ngrams.len()
                    ),
                ));
            }

            order_ngrams.sort_by(|a, b| a.ngram.cmp(&b.ngram));
            model.insert_order(&order_ngrams, &mut next_node, &mut next_arc)?;
            model.max_order = order;
        }

        Ok(model)
    }

    fn parse_ngram_line(&mut self, line: &str, order: usize) -> Result<NgramInfo> {
        let mut fields = line.split_whitespace();
        let prob = fields
            .next()
            .ok_or_else(|| LegatoError::invalid_format("arpa", "empty n-gram line"))?
            .parse::<f64>()?;
        if prob > 0.0 {
            return Err(LegatoError::invalid_format(
                "arpa",
                format!("positive log probability: {}", line),
            ));
        }

        let mut ngram = Vec::with_capacity(order);
        for _ in 0..order {
            let word = fields.next().ok_or_else(|| {
                LegatoError::invalid_format("arpa", format!("truncated n-gram: {}", line))
            })?;
            if order == 1 && !self.lookup.contains_key(word) {
                self.lookup
                    .insert(word.to_string(), self.vocabulary.len() as u32);
                self.vocabulary.push(word.to_string());
            }
            let sym = self.lookup.get(word).copied().ok_or_else(|| {
                LegatoError::model(format!("n-gram over unknown word: {}", line))
            })?;
            ngram.push(sym);
        }

        let backoff_prob = match fields.next() {
            Some(backoff) => backoff.parse::<f64>()?,
            None => 0.0,
        };
        Ok(NgramInfo {
            ngram,
            prob,
            backoff_prob,
        })
    }

    fn insert_order(
        &mut self,
        order_ngrams: &[NgramInfo],
        next_node: &mut u32,
        next_arc: &mut u32,
    ) -> Result<()> {
        for info in order_ngrams {
            let mut parent = Self::ROOT;
            for &word in &info.ngram[..info.ngram.len() - 1] {
                parent = self.find_node(parent, word).ok_or_else(|| {
                    LegatoError::model("n-gram is missing its lower-order prefix".to_string())
                })?;
            }
            let last_word = *info.ngram.last().expect("n-grams are never empty");
            if self.find_node(parent, last_word).is_some() {
                return Err(LegatoError::model(format!(
                    "duplicate n-gram in the model: {}",
                    info.ngram
                        .iter()
                        .map(|&w| self.vocabulary[w as usize].as_str())
                        .collect::<Vec<_>>()
                        .join(" ")
                )));
            }

            let node = *next_node;
            let arc = *next_arc;
            *next_node += 1;
            *next_arc += 1;

            if self.nodes[parent as usize].first_arc == NO_ARC {
                self.nodes[parent as usize].first_arc = arc;
            }
            self.nodes[parent as usize].last_arc = arc;
            self.arc_words[arc as usize] = last_word;
            self.arc_targets[arc as usize] = node;
            self.nodes[node as usize].prob = info.prob;
            self.nodes[node as usize].backoff_prob = info.backoff_prob;

            // The backoff context is the longest proper suffix the model
            // knows.
            let mut ctxt_start = 1;
            loop {
                let mut backoff = Self::ROOT;
                let mut i = ctxt_start;
                while i < info.ngram.len() {
                    match self.find_node(backoff, info.ngram[i]) {
                        Some(next) => backoff = next,
                        None => break,
                    }
                    i += 1;
                }
                if i >= info.ngram.len() {
                    self.nodes[node as usize].backoff_node = backoff;
                    break;
                }
                ctxt_start += 1;
            }
        }
        Ok(())
    }
}
