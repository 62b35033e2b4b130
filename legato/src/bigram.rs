//! Bigram trainer: stat collection over the shared lattice, re-estimation
//! and likelihood-guided pruning.

use std::collections::BTreeMap;

use hashbrown::{HashMap, HashSet};
use log::{info, warn};
use rayon::prelude::*;

use crate::common::{factor_length, Vocab, FLOOR_LP, MIN_LP};
use crate::em;
use crate::errors::{LegatoError, Result};
use crate::msfg::Msfg;
use crate::transitions::Transitions;
use crate::unigram::sort_vocab;

/// How the transition table is re-estimated from the collected counts.
#[derive(Debug, Clone, Copy)]
pub enum Reestimate {
    /// Plain maximum likelihood: normalize the counts row by row.
    MaxLikelihood,
    /// Kneser-Ney smoothing with an absolute discount; `renormalize` makes
    /// the rows sum to one afterwards.
    KneserNey {
        /// The absolute discount subtracted from every seen bigram count.
        discount: f64,
        /// Whether to renormalize the smoothed rows.
        renormalize: bool,
    },
}

/// Outcome of one prune-and-retrain iteration.
#[derive(Debug)]
pub struct PruneReport {
    /// Corpus log-likelihood of the EM pass that opened the iteration.
    pub likelihood: f64,
    /// Number of subwords removed.
    pub removed: usize,
    /// Vocabulary size after the removals.
    pub vocab_size: usize,
}

/// Trainer of the bigram subword model over a multi-string factor graph.
pub struct BigramTrainer {
    forward_backward: bool,
    utf8: bool,
    threads: usize,
    normalize_by_bigrams: bool,
    reestimate: Reestimate,
}

impl Default for BigramTrainer {
    fn default() -> Self {
        Self {
            forward_backward: false,
            utf8: false,
            threads: 4,
            normalize_by_bigrams: false,
            reestimate: Reestimate::MaxLikelihood,
        }
    }
}

impl BigramTrainer {
    /// Creates a trainer with Viterbi stat collection, four worker threads
    /// and maximum-likelihood re-estimation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Switches stat collection between forward-backward and Viterbi.
    pub fn forward_backward(mut self, enable: bool) -> Self {
        self.forward_backward = enable;
        self
    }

    /// Switches factor lengths to UTF-8 codepoints.
    pub fn utf8(mut self, utf8: bool) -> Self {
        self.utf8 = utf8;
        self
    }

    /// Number of workers for the per-string backward passes. The merge
    /// order is fixed, so the stats do not depend on the worker count.
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// Divides candidate scores by the number of bigrams touching the
    /// candidate, penalizing high-connectivity factors.
    pub fn normalize_by_bigrams(mut self, enable: bool) -> Self {
        self.normalize_by_bigrams = enable;
        self
    }

    /// Selects the re-estimation rule applied after every EM pass.
    pub fn reestimate(mut self, reestimate: Reestimate) -> Self {
        self.reestimate = reestimate;
        self
    }

    /// Collects bigram expectation counts over every registered string.
    /// The graph must have been scored with `transitions` beforehand.
    ///
    /// Returns the weighted corpus log-likelihood, the transition counts
    /// and the per-factor unigram counts.
    pub fn collect_stats(
        &self,
        words: &Vocab,
        msfg: &Msfg,
        transitions: &Transitions,
    ) -> Result<(f64, Transitions, Vocab)> {
        let costs = transitions.cells();
        let mut stats = Transitions::new();

        let total_lp = if self.forward_backward {
            self.collect_stats_fb(words, msfg, costs, &mut stats)?
        } else {
            em::viterbi_msfg(msfg, costs, words, &mut stats)?
        };

        let unigram_stats = stats.unigram_stats();
        Ok((total_lp, stats, unigram_stats))
    }

    fn collect_stats_fb(
        &self,
        words: &Vocab,
        msfg: &Msfg,
        costs: &[f64],
        stats: &mut Transitions,
    ) -> Result<f64> {
        let texts = msfg.texts();
        let mut weights = Vec::with_capacity(texts.len());
        for (text, _) in texts {
            weights.push(*words.get(text).ok_or_else(|| {
                LegatoError::model(format!("string has no corpus weight: {}", text))
            })?);
        }

        let mut fw = vec![];
        em::forward_msfg(msfg, costs, &mut fw);

        if self.threads == 1 || texts.len() < 2 {
            let mut total_lp = 0.0;
            for (i, (text, _)) in texts.iter().enumerate() {
                let lp = em::backward_msfg_text(
                    msfg,
                    costs,
                    text,
                    |n| fw[n as usize],
                    stats,
                    weights[i],
                )?;
                if lp == MIN_LP {
                    warn!("no segmentation for string: {}", text);
                    continue;
                }
                total_lp += weights[i] * lp;
            }
            return Ok(total_lp);
        }

        // Contiguous chunks in the canonical string order; worker-private
        // accumulators are merged back in chunk order so the result does
        // not depend on scheduling.
        let chunk_size = (texts.len() + self.threads - 1) / self.threads;
        let ranges: Vec<_> = (0..texts.len())
            .step_by(chunk_size)
            .map(|lo| (lo, texts.len().min(lo + chunk_size)))
            .collect();
        let partials: Result<Vec<(f64, Transitions)>> = ranges
            .into_par_iter()
            .map(|(lo, hi)| {
                let mut local = Transitions::new();
                let mut lp_sum = 0.0;
                for i in lo..hi {
                    let lp = em::backward_msfg_text(
                        msfg,
                        costs,
                        &texts[i].0,
                        |n| fw[n as usize],
                        &mut local,
                        weights[i],
                    )?;
                    if lp == MIN_LP {
                        warn!("no segmentation for string: {}", texts[i].0);
                        continue;
                    }
                    lp_sum += weights[i] * lp;
                }
                Ok((lp_sum, local))
            })
            .collect();

        let mut total_lp = 0.0;
        for (lp_sum, local) in partials? {
            total_lp += lp_sum;
            stats.add_all(&local, 1.0);
        }
        Ok(total_lp)
    }

    fn reestimated(&self, mut stats: Transitions) -> Transitions {
        match self.reestimate {
            Reestimate::MaxLikelihood => {
                stats.freqs_to_logprobs(FLOOR_LP);
                stats
            }
            Reestimate::KneserNey {
                discount,
                renormalize,
            } => {
                let mut smoothed = stats.kn_smoothed(discount, FLOOR_LP);
                if renormalize {
                    smoothed.renormalize();
                }
                smoothed
            }
        }
    }

    /// Runs pure EM iterations without pruning: score the lattice, collect
    /// counts, re-estimate. Returns the last corpus log-likelihood.
    pub fn iterate(
        &self,
        words: &Vocab,
        msfg: &mut Msfg,
        transitions: &mut Transitions,
        iterations: usize,
    ) -> Result<f64> {
        let mut ll = MIN_LP;
        for _ in 0..iterations {
            msfg.assign_scores(transitions)?;
            let (lp, stats, _) = self.collect_stats(words, msfg, transitions)?;
            *transitions = self.reestimated(stats);
            ll = lp;
        }
        Ok(ll)
    }

    /// Picks up to `n_candidates` removal candidates with the lowest
    /// unigram counts, skipping short and stoplisted factors. Scores start
    /// at zero and are filled in by [`BigramTrainer::rank_candidates`].
    pub fn init_candidates(
        &self,
        n_candidates: usize,
        unigram_stats: &Vocab,
        stoplist: &HashSet<String>,
        min_length: usize,
    ) -> BTreeMap<String, f64> {
        let mut candidates = BTreeMap::new();
        for (factor, _) in sort_vocab(unigram_stats, false) {
            if candidates.len() >= n_candidates {
                break;
            }
            if factor_length(&factor, self.utf8) < min_length || stoplist.contains(&factor) {
                continue;
            }
            candidates.insert(factor, 0.0);
        }
        candidates
    }

    /// For every factor, the registered strings whose lattice contains it,
    /// in the canonical string order.
    pub fn backpointers(
        &self,
        msfg: &Msfg,
        min_length: usize,
    ) -> Result<HashMap<String, Vec<String>>> {
        let mut backpointers: HashMap<String, Vec<String>> = HashMap::new();
        for (text, _) in msfg.texts() {
            let mut factors: Vec<_> = msfg.collect_factors(text)?.into_iter().collect();
            factors.sort_unstable();
            for factor in factors {
                if factor == msfg.boundary() || factor_length(&factor, self.utf8) < min_length {
                    continue;
                }
                backpointers.entry(factor).or_default().push(text.clone());
            }
        }
        Ok(backpointers)
    }

    /// Scores every candidate with the likelihood change its removal would
    /// cause over the strings whose lattice contains it, estimated with the
    /// blocked-factor backward sweep. The graph must have been scored with
    /// `transitions` beforehand.
    pub fn rank_candidates(
        &self,
        words: &Vocab,
        msfg: &Msfg,
        transitions: &Transitions,
        candidates: &mut BTreeMap<String, f64>,
    ) -> Result<()> {
        let costs = transitions.cells();
        let backpointers = self.backpointers(msfg, 1)?;

        // Bigram fan counts for the optional connectivity penalty.
        let mut fan_counts: HashMap<String, usize> = HashMap::new();
        if self.normalize_by_bigrams {
            for src in transitions.sources_sorted() {
                for (tgt, _) in transitions.row_sorted(&src) {
                    *fan_counts.entry_ref(src.as_str()).or_insert(0) += 1;
                    *fan_counts.entry_ref(tgt.as_str()).or_insert(0) += 1;
                }
            }
        }

        for (factor, score) in candidates.iter_mut() {
            let texts = match backpointers.get(factor) {
                Some(texts) => texts,
                None => {
                    // Nothing uses the factor; removing it costs nothing.
                    *score = 0.0;
                    continue;
                }
            };

            let mut delta = 0.0;
            for text in texts {
                let weight = *words.get(text).ok_or_else(|| {
                    LegatoError::model(format!("string has no corpus weight: {}", text))
                })?;
                let orig =
                    em::likelihood_msfg_text(msfg, costs, text, self.forward_backward)?;
                if orig == MIN_LP {
                    continue;
                }
                let blocked = em::likelihood_blocked_msfg_text(
                    msfg,
                    costs,
                    text,
                    Some(factor.as_str()),
                    self.forward_backward,
                )?;
                if blocked == MIN_LP {
                    // The factor is essential for this string.
                    delta = MIN_LP;
                    break;
                }
                delta += weight * (blocked - orig);
            }

            if self.normalize_by_bigrams && delta != MIN_LP {
                let fan = fan_counts.get(factor).copied().unwrap_or(0).max(1);
                delta /= fan as f64;
            }
            *score = delta;
        }
        Ok(())
    }

    /// Picks the top-scored candidates for removal, keeping the vocabulary
    /// size aligned to the removal stride: selection stops at the first
    /// point where the remaining size is a stride multiple and at least
    /// half a stride has been selected.
    pub fn select_removals(
        &self,
        candidates: &BTreeMap<String, f64>,
        vocab_size: usize,
        removals_per_iter: usize,
    ) -> Vec<String> {
        let removals_per_iter = removals_per_iter.max(1);
        let mut sorted: Vec<_> = candidates.iter().map(|(f, &s)| (f.clone(), s)).collect();
        sorted.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let mut to_remove = vec![];
        for (factor, _) in sorted {
            to_remove.push(factor);
            if (vocab_size - to_remove.len()) % removals_per_iter == 0
                && to_remove.len() >= removals_per_iter / 2
            {
                break;
            }
        }
        to_remove
    }

    /// Removes the `num_removals` least common subwords from the table and
    /// the lattice. Returns the number of removals.
    pub fn remove_least_common(
        &self,
        unigram_stats: &Vocab,
        num_removals: usize,
        transitions: &mut Transitions,
        msfg: &mut Msfg,
        min_length: usize,
    ) -> usize {
        let mut to_remove = vec![];
        for (factor, _) in sort_vocab(unigram_stats, false) {
            if factor_length(&factor, self.utf8) < min_length {
                continue;
            }
            to_remove.push(factor);
            if to_remove.len() >= num_removals {
                break;
            }
        }
        self.commit_removals(&to_remove, transitions, msfg);
        to_remove.len()
    }

    /// Removes every subword whose unigram count falls below `cutoff`.
    /// Returns the number of removals.
    pub fn cutoff(
        &self,
        unigram_stats: &Vocab,
        cutoff: f64,
        transitions: &mut Transitions,
        msfg: &mut Msfg,
        min_length: usize,
    ) -> usize {
        let mut to_remove = vec![];
        for (factor, count) in sort_vocab(unigram_stats, false) {
            if count >= cutoff {
                break;
            }
            if factor_length(&factor, self.utf8) < min_length {
                continue;
            }
            to_remove.push(factor);
        }
        self.commit_removals(&to_remove, transitions, msfg);
        to_remove.len()
    }

    fn commit_removals(
        &self,
        to_remove: &[String],
        transitions: &mut Transitions,
        msfg: &mut Msfg,
    ) {
        transitions.remove_factors(to_remove);
        for factor in to_remove {
            msfg.remove_arcs(factor);
        }
    }

    /// One prune-and-retrain iteration: EM pass, re-estimation, candidate
    /// selection and ranking, scored removal, and one settling EM pass.
    #[allow(clippy::too_many_arguments)]
    pub fn prune_step(
        &self,
        words: &Vocab,
        msfg: &mut Msfg,
        transitions: &mut Transitions,
        n_candidates: usize,
        removals_per_iter: usize,
        min_length: usize,
        stoplist: &HashSet<String>,
    ) -> Result<PruneReport> {
        msfg.assign_scores(transitions)?;
        let (likelihood, stats, unigram_stats) = self.collect_stats(words, msfg, transitions)?;
        *transitions = self.reestimated(stats);
        info!(
            "bigram likelihood {}, vocabulary size {}, transitions {}",
            likelihood,
            transitions.num_sources(),
            transitions.transition_count()
        );

        let mut candidates =
            self.init_candidates(n_candidates, &unigram_stats, stoplist, min_length);
        msfg.assign_scores(transitions)?;
        self.rank_candidates(words, msfg, transitions, &mut candidates)?;

        let to_remove =
            self.select_removals(&candidates, transitions.num_sources(), removals_per_iter);
        if to_remove.is_empty() {
            warn!("no removable candidates were found");
        }
        self.commit_removals(&to_remove, transitions, msfg);

        self.iterate(words, msfg, transitions, 1)?;
        msfg.prune_unused(transitions);

        Ok(PruneReport {
            likelihood,
            removed: to_remove.len(),
            vocab_size: transitions.num_sources(),
        })
    }
}
