//! Letter-tree index over the subword vocabulary.

use crate::common::{add_log, Vocab, SMALL_LP};
use crate::errors::{LegatoError, Result};

const NONE: u32 = u32::MAX;

/// Arc of the letter tree. A terminal arc carries the score of the factor
/// spelled by the path from the root.
struct Arc {
    byte: u8,
    target: u32,
    sibling: u32,
    terminal: bool,
    score: f64,
}

/// Node of the letter tree; just an anchor for a sibling-linked arc list.
struct Node {
    first_arc: u32,
}

/// A set of (factor, score) pairs in a letter-tree format supporting the
/// per-position prefix queries of the lattice builders.
///
/// Removal clears the terminal marker but leaves the arc shape intact, so a
/// removed factor can be re-added cheaply during candidate ranking.
pub struct Lexicon {
    nodes: Vec<Node>,
    arcs: Vec<Arc>,
    max_factor_len: usize,
}

/// A factor found by [`Lexicon::common_prefix_iterator`].
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct LexMatch {
    /// Exclusive end offset of the match within the queried input.
    pub end_byte: usize,
    /// Score of the matched factor.
    pub score: f64,
}

impl Default for Lexicon {
    fn default() -> Self {
        Self {
            nodes: vec![Node { first_arc: NONE }],
            arcs: vec![],
            max_factor_len: 0,
        }
    }
}

impl Lexicon {
    /// Builds a lexicon from a vocabulary and orders sibling arcs by
    /// descending cumulative mass. `log_domain` selects the semiring of the
    /// ordering pass.
    pub fn from_vocab(vocab: &Vocab, log_domain: bool) -> Self {
        let mut lexicon = Self::default();
        let mut factors: Vec<_> = vocab.keys().collect();
        factors.sort_unstable();
        for factor in factors {
            lexicon.add(factor, vocab[factor]);
        }
        lexicon.optimize_arcs(log_domain);
        lexicon
    }

    /// Length in bytes of the longest factor ever inserted.
    #[inline(always)]
    pub fn max_factor_len(&self) -> usize {
        self.max_factor_len
    }

    fn find_arc(&self, byte: u8, node: u32) -> Option<u32> {
        let mut arc = self.nodes[node as usize].first_arc;
        while arc != NONE {
            if self.arcs[arc as usize].byte == byte {
                return Some(arc);
            }
            arc = self.arcs[arc as usize].sibling;
        }
        None
    }

    fn find_terminal(&self, factor: &str) -> Option<u32> {
        let mut node = 0;
        let mut last = None;
        for &byte in factor.as_bytes() {
            let arc = self.find_arc(byte, node)?;
            node = self.arcs[arc as usize].target;
            last = Some(arc);
        }
        last.filter(|&a| self.arcs[a as usize].terminal)
    }

    /// Checks if the factor is in the set.
    pub fn contains(&self, factor: &str) -> bool {
        self.find_terminal(factor).is_some()
    }

    /// Gets the score of a factor.
    pub fn score(&self, factor: &str) -> Result<f64> {
        self.find_terminal(factor)
            .map(|a| self.arcs[a as usize].score)
            .ok_or_else(|| LegatoError::not_found(factor))
    }

    /// Adds a factor, overwriting the score if it is already present.
    pub fn add(&mut self, factor: &str, score: f64) {
        let bytes = factor.as_bytes();
        let mut node = 0;
        for (i, &byte) in bytes.iter().enumerate() {
            let last = i + 1 == bytes.len();
            node = self.insert(byte, last, score, node);
        }
        self.max_factor_len = self.max_factor_len.max(bytes.len());
    }

    /// Removes a factor and returns its previous score. The arcs stay in the
    /// tree; only the terminal marker is cleared.
    pub fn remove(&mut self, factor: &str) -> Result<f64> {
        let arc = self
            .find_terminal(factor)
            .ok_or_else(|| LegatoError::not_found(factor))?;
        let arc = &mut self.arcs[arc as usize];
        arc.terminal = false;
        let score = arc.score;
        arc.score = 0.0;
        Ok(score)
    }

    /// Re-scores every terminal named in `scores`. Fails on the first factor
    /// that is not present.
    pub fn assign_scores(&mut self, scores: &Vocab) -> Result<()> {
        let mut factors: Vec<_> = scores.keys().collect();
        factors.sort_unstable();
        for factor in factors {
            let arc = self
                .find_terminal(factor)
                .ok_or_else(|| LegatoError::not_found(factor.as_str()))?;
            self.arcs[arc as usize].score = scores[factor];
        }
        Ok(())
    }

    /// All factors of the set that are prefixes of `input`, shortest first.
    pub fn common_prefix_iterator<'a>(
        &'a self,
        input: &'a [u8],
    ) -> impl Iterator<Item = LexMatch> + 'a {
        let mut node = Some(0);
        input.iter().enumerate().filter_map(move |(i, &byte)| {
            let arc = self.find_arc(byte, node?);
            match arc {
                Some(arc) => {
                    let arc = &self.arcs[arc as usize];
                    node = Some(arc.target);
                    arc.terminal.then(|| LexMatch {
                        end_byte: i + 1,
                        score: arc.score,
                    })
                }
                None => {
                    node = None;
                    None
                }
            }
        })
    }

    fn insert(&mut self, byte: u8, terminal: bool, score: f64, node: u32) -> u32 {
        if let Some(arc) = self.find_arc(byte, node) {
            let arc = &mut self.arcs[arc as usize];
            if terminal {
                arc.terminal = true;
                arc.score = score;
            }
            return arc.target;
        }
        let target = self.nodes.len() as u32;
        self.nodes.push(Node { first_arc: NONE });
        let arc = self.arcs.len() as u32;
        self.arcs.push(Arc {
            byte,
            target,
            sibling: self.nodes[node as usize].first_arc,
            terminal,
            score: if terminal { score } else { 0.0 },
        });
        self.nodes[node as usize].first_arc = arc;
        target
    }

    /// Reorders every sibling list by descending cumulative terminal mass
    /// reachable through the arc, so that searches can visit the most
    /// probable continuations first. Returns the total mass under the root.
    pub fn optimize_arcs(&mut self, log_domain: bool) -> f64 {
        self.optimize_node(0, log_domain)
    }

    fn optimize_node(&mut self, node: u32, log_domain: bool) -> f64 {
        let mut total = if log_domain { SMALL_LP } else { 0.0 };
        let mut ordered: Vec<(f64, u32)> = vec![];

        let mut arc = self.nodes[node as usize].first_arc;
        while arc != NONE {
            let target = self.arcs[arc as usize].target;
            let mut cumsum = self.optimize_node(target, log_domain);
            let (terminal, score) = {
                let a = &self.arcs[arc as usize];
                (a.terminal, a.score)
            };
            if log_domain {
                if terminal {
                    cumsum = add_log(cumsum, score);
                }
                total = add_log(cumsum, total);
            } else {
                if terminal {
                    cumsum += score;
                }
                total += cumsum;
            }
            ordered.push((cumsum, arc));
            arc = self.arcs[arc as usize].sibling;
        }

        ordered.sort_by(|a, b| b.0.total_cmp(&a.0));
        let mut next = NONE;
        for &(_, arc) in ordered.iter().rev() {
            self.arcs[arc as usize].sibling = next;
            next = arc;
        }
        self.nodes[node as usize].first_arc = next;

        total
    }

    /// Unlinks arcs that lead to no terminal. The underlying storage is kept;
    /// only the sibling links are rebuilt.
    pub fn prune(&mut self) {
        self.prune_node(0);
    }

    fn prune_node(&mut self, node: u32) -> bool {
        let mut kept: Vec<u32> = vec![];
        let mut arc = self.nodes[node as usize].first_arc;
        while arc != NONE {
            let target = self.arcs[arc as usize].target;
            let unused = self.prune_node(target);
            if !unused || self.arcs[arc as usize].terminal {
                kept.push(arc);
            }
            arc = self.arcs[arc as usize].sibling;
        }

        let mut next = NONE;
        for &arc in kept.iter().rev() {
            self.arcs[arc as usize].sibling = next;
            next = arc;
        }
        self.nodes[node as usize].first_arc = next;

        kept.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Lexicon {
        let mut lexicon = Lexicon::default();
        lexicon.add("a", -1.0);
        lexicon.add("ab", -2.0);
        lexicon.add("abc", -3.0);
        lexicon.add("b", -4.0);
        lexicon
    }

    #[test]
    fn test_contains_and_score() {
        let lexicon = sample();
        assert!(lexicon.contains("ab"));
        assert!(!lexicon.contains("ac"));
        assert!(!lexicon.contains("abcd"));
        assert_eq!(lexicon.score("abc").unwrap(), -3.0);
        assert!(lexicon.score("c").is_err());
        assert_eq!(lexicon.max_factor_len(), 3);
    }

    #[test]
    fn test_prefix_of_factor_is_not_a_factor() {
        let mut lexicon = Lexicon::default();
        lexicon.add("abc", -1.0);
        assert!(lexicon.contains("abc"));
        assert!(!lexicon.contains("ab"));
        assert!(!lexicon.contains("a"));
    }

    #[test]
    fn test_add_overwrites() {
        let mut lexicon = sample();
        lexicon.add("ab", -8.0);
        assert_eq!(lexicon.score("ab").unwrap(), -8.0);
    }

    #[test]
    fn test_remove_keeps_shape() {
        let mut lexicon = sample();
        assert_eq!(lexicon.remove("ab").unwrap(), -2.0);
        assert!(!lexicon.contains("ab"));
        assert!(lexicon.contains("abc"));
        assert!(lexicon.remove("ab").is_err());
        lexicon.add("ab", -2.5);
        assert_eq!(lexicon.score("ab").unwrap(), -2.5);
    }

    #[test]
    fn test_assign_scores() {
        let mut lexicon = sample();
        let mut scores = Vocab::default();
        scores.insert("a".to_string(), -0.5);
        scores.insert("abc".to_string(), -0.25);
        lexicon.assign_scores(&scores).unwrap();
        assert_eq!(lexicon.score("a").unwrap(), -0.5);
        assert_eq!(lexicon.score("abc").unwrap(), -0.25);
        assert_eq!(lexicon.score("ab").unwrap(), -2.0);

        scores.insert("zz".to_string(), -0.1);
        assert!(lexicon.assign_scores(&scores).is_err());
    }

    #[test]
    fn test_common_prefix_iterator() {
        let lexicon = sample();
        let matches: Vec<_> = lexicon.common_prefix_iterator(b"abcd").collect();
        assert_eq!(
            matches,
            vec![
                LexMatch {
                    end_byte: 1,
                    score: -1.0
                },
                LexMatch {
                    end_byte: 2,
                    score: -2.0
                },
                LexMatch {
                    end_byte: 3,
                    score: -3.0
                },
            ]
        );
        assert_eq!(lexicon.common_prefix_iterator(b"ba").count(), 1);
        assert_eq!(lexicon.common_prefix_iterator(b"c").count(), 0);
    }

    #[test]
    fn test_prune_removed_branch() {
        let mut lexicon = sample();
        lexicon.remove("abc").unwrap();
        lexicon.prune();
        assert!(lexicon.contains("a"));
        assert!(lexicon.contains("ab"));
        assert_eq!(lexicon.common_prefix_iterator(b"abc").count(), 2);
    }

    #[test]
    fn test_optimize_arcs_total() {
        let mut vocab = Vocab::default();
        vocab.insert("a".to_string(), 0.25_f64.ln());
        vocab.insert("b".to_string(), 0.75_f64.ln());
        let mut lexicon = Lexicon::from_vocab(&vocab, true);
        let total = lexicon.optimize_arcs(true);
        // SMALL_LP seeds every node, so the mass is only approximately one.
        assert!((total.exp() - 1.0).abs() < 1e-10);
    }
}
