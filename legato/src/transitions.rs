//! Bigram transition table.

use std::io::{BufRead, BufReader, Read, Write};

use hashbrown::HashMap;
use log::warn;

use crate::common::{add_log, Vocab, MIN_LP};
use crate::errors::{LegatoError, Result};

/// Handle of a score cell; multi-string factor graph arcs store these so
/// that re-scoring the whole lattice costs table lookups, not hash probes.
pub type CellId = u32;

/// Sentinel for an arc whose score cell has not been assigned.
pub const INVALID_CELL: CellId = CellId::MAX;

/// A mapping `src factor -> (tgt factor -> log-prob)` over a dense cell
/// store. The same container holds expectation counts during stat
/// collection; [`Transitions::freqs_to_logprobs`] turns counts into a
/// normalized model in place, without invalidating cell handles.
#[derive(Default)]
pub struct Transitions {
    rows: HashMap<String, HashMap<String, CellId>>,
    cells: Vec<f64>,
}

impl Transitions {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets the value of a cell.
    #[inline(always)]
    pub fn get(&self, src: &str, tgt: &str) -> Option<f64> {
        self.cell(src, tgt).map(|c| self.cells[c as usize])
    }

    /// Gets the cell handle of a pair.
    #[inline(always)]
    pub fn cell(&self, src: &str, tgt: &str) -> Option<CellId> {
        self.rows.get(src)?.get(tgt).copied()
    }

    /// Reads a cell through its handle.
    #[inline(always)]
    pub fn cell_value(&self, cell: CellId) -> f64 {
        self.cells[cell as usize]
    }

    /// The dense cell store, indexed by the handles stamped on lattice arcs.
    #[inline(always)]
    pub fn cells(&self) -> &[f64] {
        &self.cells
    }

    /// Sets the value of a pair, creating the cell if needed.
    pub fn set(&mut self, src: &str, tgt: &str, value: f64) {
        let cell = self.cell_or_insert(src, tgt);
        self.cells[cell as usize] = value;
    }

    /// Accumulates `delta` onto a pair, creating the cell at zero if needed.
    pub fn add(&mut self, src: &str, tgt: &str, delta: f64) {
        let cell = self.cell_or_insert(src, tgt);
        self.cells[cell as usize] += delta;
    }

    fn cell_or_insert(&mut self, src: &str, tgt: &str) -> CellId {
        let row = self.rows.entry_ref(src).or_default();
        if let Some(&cell) = row.get(tgt) {
            return cell;
        }
        let cell = self.cells.len() as CellId;
        self.cells.push(0.0);
        row.insert(tgt.to_string(), cell);
        cell
    }

    /// Accumulates every entry of `other`, scaled by `weight`.
    pub fn add_all(&mut self, other: &Transitions, weight: f64) {
        for src in other.sources_sorted() {
            for (tgt, value) in other.row_sorted(&src) {
                self.add(&src, &tgt, weight * value);
            }
        }
    }

    /// Checks if the table has a row for `src`.
    #[inline(always)]
    pub fn contains_src(&self, src: &str) -> bool {
        self.rows.contains_key(src)
    }

    /// Number of rows, i.e. the vocabulary size of the model.
    #[inline(always)]
    pub fn num_sources(&self) -> usize {
        self.rows.len()
    }

    /// Total number of (src, tgt) pairs.
    pub fn transition_count(&self) -> usize {
        self.rows.values().map(|row| row.len()).sum()
    }

    /// Row keys in lexicographic order.
    pub fn sources_sorted(&self) -> Vec<String> {
        let mut sources: Vec<_> = self.rows.keys().cloned().collect();
        sources.sort_unstable();
        sources
    }

    /// One row as (target, value) pairs in lexicographic target order.
    pub fn row_sorted(&self, src: &str) -> Vec<(String, f64)> {
        let mut row: Vec<_> = match self.rows.get(src) {
            Some(row) => row
                .iter()
                .map(|(tgt, &cell)| (tgt.clone(), self.cells[cell as usize]))
                .collect(),
            None => vec![],
        };
        row.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        row
    }

    pub(crate) fn row(&self, src: &str) -> Option<&HashMap<String, CellId>> {
        self.rows.get(src)
    }

    /// Turns expectation counts into floored log-probabilities, row by row.
    /// Rows whose mass vanishes are made uniform at the floor with a warning.
    pub fn freqs_to_logprobs(&mut self, floor: f64) {
        for src in self.sources_sorted() {
            let row = &self.rows[&src];
            let mut targets: Vec<_> = row.keys().cloned().collect();
            targets.sort_unstable();

            let mut total = 0.0;
            for tgt in &targets {
                let count = self.cells[row[tgt] as usize];
                if count.is_finite() {
                    total += count;
                }
            }
            let normalizer = total.ln();
            if !normalizer.is_finite() {
                warn!("row {} lost all probability mass, flooring", src);
            }

            let mut floored = false;
            for tgt in &targets {
                let cell = row[tgt] as usize;
                let lp = self.cells[cell].ln() - normalizer;
                self.cells[cell] = if lp.is_finite() && lp >= floor {
                    lp
                } else {
                    floored = true;
                    floor
                };
            }

            if floored {
                self.renormalize_row(&src, &targets);
            }
        }
    }

    /// Shifts every row so that it sums to one in the probability domain.
    pub fn renormalize(&mut self) {
        for src in self.sources_sorted() {
            let mut targets: Vec<_> = self.rows[&src].keys().cloned().collect();
            targets.sort_unstable();
            self.renormalize_row(&src, &targets);
        }
    }

    fn renormalize_row(&mut self, src: &str, targets: &[String]) {
        let row = &self.rows[src];
        let mut normalizer = MIN_LP;
        for tgt in targets {
            normalizer = add_log(normalizer, self.cells[row[tgt] as usize]);
        }
        for tgt in targets {
            self.cells[row[tgt] as usize] -= normalizer;
        }
    }

    /// Removes the given factors as sources and as targets, drops rows left
    /// empty and renormalizes the remainder.
    pub fn remove_factors(&mut self, to_remove: &[String]) {
        for factor in to_remove {
            self.rows.remove(factor);
        }
        for row in self.rows.values_mut() {
            for factor in to_remove {
                row.remove(factor);
            }
        }
        self.rows.retain(|_, row| !row.is_empty());
        self.renormalize();
    }

    /// The table with every (src, tgt) pair flipped.
    pub fn reversed(&self) -> Transitions {
        let mut reversed = Transitions::new();
        for src in self.sources_sorted() {
            for (tgt, value) in self.row_sorted(&src) {
                reversed.set(&tgt, &src, value);
            }
        }
        reversed
    }

    /// The set of source factors as a vocabulary with zero scores.
    pub fn to_vocab(&self) -> Vocab {
        self.rows.keys().map(|src| (src.clone(), 0.0)).collect()
    }

    /// Per-factor totals of incoming mass: `stats[tgt] = sum over src`.
    pub fn unigram_stats(&self) -> Vocab {
        let mut stats = Vocab::default();
        for row in self.rows.values() {
            for (tgt, &cell) in row {
                *stats.entry_ref(tgt.as_str()).or_insert(0.0) += self.cells[cell as usize];
            }
        }
        stats
    }

    /// Kneser-Ney smoothing of a count table with absolute discount
    /// `discount`: the mass removed from seen bigrams of each row is
    /// redistributed along lower-order continuation probabilities. Values
    /// are floored at `floor`; renormalize separately if exact row sums are
    /// needed.
    pub fn kn_smoothed(&self, discount: f64, floor: f64) -> Transitions {
        let mut continuations = Vocab::default();
        for row in self.rows.values() {
            for tgt in row.keys() {
                *continuations.entry_ref(tgt.as_str()).or_insert(0.0) += 1.0;
            }
        }
        let total_bigram_types: f64 = continuations.values().sum();

        let mut smoothed = Transitions::new();
        for src in self.sources_sorted() {
            let row = self.row_sorted(&src);
            let total: f64 = row.iter().map(|(_, c)| c).sum();
            if total <= 0.0 {
                warn!("row {} has no mass, dropped by smoothing", src);
                continue;
            }
            let reserved = discount * row.len() as f64 / total;
            for (tgt, count) in row {
                let continuation = continuations[&tgt] / total_bigram_types;
                let p = (count - discount).max(0.0) / total + reserved * continuation;
                smoothed.set(&src, &tgt, p.ln().max(floor));
            }
        }
        smoothed
    }

    /// Reads a table from `<src> <tgt> <value>` records. Duplicate pairs are
    /// rejected.
    pub fn read<R>(rdr: R) -> Result<Self>
    where
        R: Read,
    {
        let mut transitions = Transitions::new();
        for line in BufReader::new(rdr).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (src, tgt, value) = match (fields.next(), fields.next(), fields.next()) {
                (Some(src), Some(tgt), Some(value)) => (src, tgt, value),
                _ => {
                    return Err(LegatoError::invalid_format(
                        "transitions",
                        format!("expected `src tgt value`: {}", line),
                    ))
                }
            };
            if transitions.cell(src, tgt).is_some() {
                return Err(LegatoError::invalid_format(
                    "transitions",
                    format!("duplicate transition: {} {}", src, tgt),
                ));
            }
            transitions.set(src, tgt, value.parse::<f64>()?);
        }
        Ok(transitions)
    }

    /// Writes the table, one `<src> <tgt> <log-prob>` record per line, or
    /// `<src> <tgt>\t<count>` when `count_style` is set.
    pub fn write<W>(&self, wtr: &mut W, count_style: bool) -> Result<()>
    where
        W: Write,
    {
        for src in self.sources_sorted() {
            for (tgt, value) in self.row_sorted(&src) {
                if count_style {
                    writeln!(wtr, "{} {}\t{}", src, tgt, value)?;
                } else {
                    writeln!(wtr, "{} {} {}", src, tgt, value)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts() -> Transitions {
        let mut t = Transitions::new();
        t.set("*", "a", 3.0);
        t.set("*", "b", 1.0);
        t.set("a", "b", 2.0);
        t.set("a", "*", 2.0);
        t.set("b", "*", 1.0);
        t
    }

    fn row_mass(t: &Transitions, src: &str) -> f64 {
        t.row_sorted(src).iter().map(|(_, lp)| lp.exp()).sum()
    }

    #[test]
    fn test_set_get_add() {
        let mut t = counts();
        assert_eq!(t.get("*", "a"), Some(3.0));
        assert_eq!(t.get("a", "a"), None);
        t.add("*", "a", 0.5);
        assert_eq!(t.get("*", "a"), Some(3.5));
        assert_eq!(t.num_sources(), 3);
        assert_eq!(t.transition_count(), 5);
    }

    #[test]
    fn test_cell_handles_survive_rescoring() {
        let mut t = counts();
        let cell = t.cell("*", "a").unwrap();
        t.freqs_to_logprobs(crate::common::FLOOR_LP);
        assert!((t.cell_value(cell) - 0.75_f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn test_freqs_to_logprobs_normalizes() {
        let mut t = counts();
        t.freqs_to_logprobs(crate::common::FLOOR_LP);
        for src in ["*", "a", "b"] {
            assert!((row_mass(&t, src) - 1.0).abs() < 1e-9);
        }
        assert!((t.get("*", "a").unwrap() - 0.75_f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn test_freqs_to_logprobs_floors_and_renormalizes() {
        let mut t = Transitions::new();
        t.set("a", "b", 1.0);
        t.set("a", "c", 1e-30);
        t.freqs_to_logprobs(-20.0);
        // ln(1e-30) is far below the floor, so the entry is clamped and the
        // row renormalized once more.
        let c = t.get("a", "c").unwrap();
        assert!(c > -21.0 && c <= -19.0);
        assert!((row_mass(&t, "a") - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_remove_factors() {
        let mut t = counts();
        t.freqs_to_logprobs(crate::common::FLOOR_LP);
        t.remove_factors(&["b".to_string()]);
        assert!(!t.contains_src("b"));
        assert_eq!(t.get("a", "b"), None);
        assert!((row_mass(&t, "*") - 1.0).abs() < 1e-9);
        assert!((row_mass(&t, "a") - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_reversed_and_unigram_stats() {
        let t = counts();
        let r = t.reversed();
        assert_eq!(r.get("a", "*"), Some(3.0));
        assert_eq!(r.get("*", "a"), Some(2.0));
        let stats = t.unigram_stats();
        assert_eq!(stats["*"], 3.0);
        assert_eq!(stats["b"], 3.0);
    }

    #[test]
    fn test_kn_smoothed_rows_sum_to_one() {
        let t = counts();
        let mut kn = t.kn_smoothed(0.1, crate::common::FLOOR_LP);
        kn.renormalize();
        for src in ["*", "a", "b"] {
            assert!((row_mass(&kn, src) - 1.0).abs() < 1e-9);
        }
        // Discounting moves mass from the frequent pair to the rare one.
        let plain = {
            let mut p = counts();
            p.freqs_to_logprobs(crate::common::FLOOR_LP);
            p
        };
        assert!(kn.get("*", "a").unwrap() < plain.get("*", "a").unwrap());
        assert!(kn.get("*", "b").unwrap() > plain.get("*", "b").unwrap());
    }

    #[test]
    fn test_round_trip() {
        let mut t = counts();
        t.freqs_to_logprobs(crate::common::FLOOR_LP);
        let mut buf = vec![];
        t.write(&mut buf, false).unwrap();
        let back = Transitions::read(buf.as_slice()).unwrap();
        assert_eq!(back.transition_count(), t.transition_count());
        for src in t.sources_sorted() {
            for (tgt, value) in t.row_sorted(&src) {
                assert!((back.get(&src, &tgt).unwrap() - value).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_read_rejects_duplicates() {
        let input = "a b -1.0\na b -2.0\n";
        assert!(Transitions::read(input.as_bytes()).is_err());
    }

    #[test]
    fn test_read_rejects_garbage() {
        assert!(Transitions::read("a b\n".as_bytes()).is_err());
        assert!(Transitions::read("a b x\n".as_bytes()).is_err());
    }
}
