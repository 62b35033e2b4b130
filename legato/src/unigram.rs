//! Unigram trainer: resegmentation, normalization and scored removal.

use std::collections::BTreeSet;
use std::io::{BufRead, BufReader, Read, Write};

use hashbrown::{HashMap, HashSet};
use log::warn;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::common::{factor_length, sub_log, Vocab, MIN_LP, SMALL_LP};
use crate::em;
use crate::errors::{LegatoError, Result};
use crate::lexicon::Lexicon;

/// Which algorithm resegments the corpus during an EM iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegMethod {
    /// Count only the single best segmentation of each string.
    Viterbi,
    /// Collect expected counts over all legal segmentations.
    ForwardBackward,
}

/// Trainer of the unigram subword model.
pub struct UnigramTrainer {
    method: SegMethod,
    utf8: bool,
    special: HashSet<String>,
}

impl Default for UnigramTrainer {
    fn default() -> Self {
        Self {
            method: SegMethod::Viterbi,
            utf8: false,
            special: HashSet::new(),
        }
    }
}

impl UnigramTrainer {
    /// Creates a trainer using Viterbi resegmentation and byte boundaries.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the resegmentation algorithm.
    pub fn segmentation_method(mut self, method: SegMethod) -> Self {
        self.method = method;
        self
    }

    /// Switches factor lengths and lattice positions to UTF-8 codepoints.
    pub fn utf8(mut self, utf8: bool) -> Self {
        self.utf8 = utf8;
        self
    }

    /// Registers strings such as sentence-boundary tokens that bypass
    /// segmentation and count directly as themselves.
    pub fn special_words<I, S>(mut self, words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.special = words.into_iter().map(Into::into).collect();
        self
    }

    fn segment(&self, lexicon: &Lexicon, text: &str, stats: &mut Vocab) -> f64 {
        match self.method {
            SegMethod::Viterbi => em::viterbi_stats(lexicon, text, self.utf8, stats),
            SegMethod::ForwardBackward => em::forward_backward(lexicon, text, self.utf8, stats),
        }
    }

    /// Resegments a weighted word list under the vocabulary. Returns the
    /// corpus log-likelihood and the collected factor frequencies. Words
    /// with no segmentation are skipped with a warning.
    pub fn resegment(&self, words: &Vocab, vocab: &Vocab) -> (f64, Vocab) {
        let lexicon = Lexicon::from_vocab(vocab, true);
        self.resegment_lexicon(words, &lexicon)
    }

    /// [`UnigramTrainer::resegment`] over a prebuilt lexicon.
    pub fn resegment_lexicon(&self, words: &Vocab, lexicon: &Lexicon) -> (f64, Vocab) {
        let mut freqs = Vocab::default();
        let mut ll = 0.0;

        let mut sorted: Vec<_> = words.keys().collect();
        sorted.sort_unstable();
        for word in sorted {
            let weight = words[word];
            if self.special.contains(word) {
                *freqs.entry_ref(word.as_str()).or_insert(0.0) += weight;
                continue;
            }
            let mut stats = Vocab::default();
            let lp = self.segment(lexicon, word, &mut stats);
            if stats.is_empty() {
                warn!("no segmentation for word: {}", word);
                continue;
            }
            ll += weight * lp;
            for (factor, count) in stats {
                *freqs.entry(factor).or_insert(0.0) += weight * count;
            }
        }

        (ll, freqs)
    }

    /// Resegments an ordered sentence corpus; every sentence has unit
    /// weight.
    pub fn resegment_sents(&self, sents: &[String], vocab: &Vocab) -> (f64, Vocab) {
        let lexicon = Lexicon::from_vocab(vocab, true);
        let mut freqs = Vocab::default();
        let mut ll = 0.0;

        for sent in sents {
            let mut stats = Vocab::default();
            let lp = self.segment(&lexicon, sent, &mut stats);
            if stats.is_empty() {
                warn!("no segmentation for sentence: {}", sent);
                continue;
            }
            ll += lp;
            for (factor, count) in stats {
                *freqs.entry(factor).or_insert(0.0) += count;
            }
        }

        (ll, freqs)
    }

    /// Runs EM iterations: resegment, swap in the collected frequencies and
    /// renormalize. Returns the last log-likelihood.
    pub fn iterate(&self, words: &Vocab, vocab: &mut Vocab, iterations: usize) -> f64 {
        let mut ll = 0.0;
        for _ in 0..iterations {
            let (iter_ll, freqs) = self.resegment(words, vocab);
            ll = iter_ll;
            *vocab = freqs;
            freqs_to_logprobs(vocab, SMALL_LP);
        }
        ll
    }

    /// [`UnigramTrainer::iterate`] over a sentence corpus.
    pub fn iterate_sents(&self, sents: &[String], vocab: &mut Vocab, iterations: usize) -> f64 {
        let mut ll = 0.0;
        for _ in 0..iterations {
            let (iter_ll, freqs) = self.resegment_sents(sents, vocab);
            ll = iter_ll;
            *vocab = freqs;
            freqs_to_logprobs(vocab, SMALL_LP);
        }
        ll
    }

    /// Drops factors whose frequency is at or below `limit`, except short
    /// factors and stoplisted ones. Returns the number of removals.
    pub fn cutoff(
        &self,
        freqs: &mut Vocab,
        limit: f64,
        stoplist: &HashSet<String>,
        min_length: usize,
    ) -> usize {
        let before = freqs.len();
        freqs.retain(|factor, count| {
            *count > limit
                || factor_length(factor, self.utf8) < min_length
                || stoplist.contains(factor)
        });
        before - freqs.len()
    }

    /// Picks removal candidates from the least frequent end of the
    /// vocabulary until `n_candidates` are collected.
    pub fn candidates_by_frequency(
        &self,
        vocab: &Vocab,
        candidates: &mut BTreeSet<String>,
        n_candidates: usize,
        stoplist: &HashSet<String>,
        min_length: usize,
    ) -> usize {
        let mut selected = 0;
        for (factor, _) in sort_vocab(vocab, false) {
            if candidates.len() >= n_candidates {
                break;
            }
            if factor_length(&factor, self.utf8) < min_length
                || stoplist.contains(&factor)
                || !candidates.insert(factor)
            {
                continue;
            }
            selected += 1;
        }
        selected
    }

    /// Picks removal candidates uniformly at random, reproducibly from
    /// `seed`.
    pub fn candidates_by_random(
        &self,
        vocab: &Vocab,
        candidates: &mut BTreeSet<String>,
        n_candidates: usize,
        stoplist: &HashSet<String>,
        min_length: usize,
        seed: u64,
    ) -> usize {
        let mut shuffled: Vec<_> = vocab.keys().cloned().collect();
        shuffled.sort_unstable();
        shuffled.shuffle(&mut StdRng::seed_from_u64(seed));

        let mut selected = 0;
        for factor in shuffled {
            if candidates.len() >= n_candidates {
                break;
            }
            if factor_length(&factor, self.utf8) < min_length
                || stoplist.contains(&factor)
                || !candidates.insert(factor)
            {
                continue;
            }
            selected += 1;
        }
        selected
    }

    /// Picks removal candidates by the occupancy count in unit-weight
    /// segmentations, least used first. Factors used more than `max_usage`
    /// times are never candidates.
    pub fn candidates_by_usage(
        &self,
        words: &Vocab,
        vocab: &Vocab,
        candidates: &mut BTreeSet<String>,
        n_candidates: usize,
        stoplist: &HashSet<String>,
        min_length: usize,
        max_usage: f64,
    ) -> usize {
        let unit_words: Vocab = words.keys().map(|w| (w.clone(), 1.0)).collect();
        let (_, type_occ) = self.resegment(&unit_words, vocab);

        let mut selected = 0;
        for (factor, occ) in sort_vocab(&type_occ, false) {
            if occ > max_usage || candidates.len() >= n_candidates {
                break;
            }
            if factor_length(&factor, self.utf8) < min_length
                || stoplist.contains(&factor)
                || !candidates.insert(factor)
            {
                continue;
            }
            selected += 1;
        }
        selected
    }

    /// Ranks removal candidates by the corpus likelihood change their
    /// removal would cause, adjusted for the renormalization of the
    /// remaining distribution. Candidates are hypothetically removed from
    /// the lexicon one at a time and restored afterwards.
    ///
    /// Returns the current corpus log-likelihood and the candidates sorted
    /// descending, least harmful removal first. The factor frequencies of
    /// the baseline segmentation are collected into `freqs`.
    pub fn rank_candidates(
        &self,
        words: &Vocab,
        vocab: &Vocab,
        candidates: &BTreeSet<String>,
        freqs: &mut Vocab,
    ) -> (f64, Vec<(String, f64)>) {
        freqs.clear();
        let mut lexicon = Lexicon::from_vocab(vocab, true);
        let mut ll_diffs: HashMap<String, f64> = HashMap::new();
        let mut token_diffs: HashMap<String, f64> = HashMap::new();
        let mut curr_ll = 0.0;
        let mut token_count = 0.0;

        let mut sorted: Vec<_> = words.keys().collect();
        sorted.sort_unstable();
        for word in sorted {
            let weight = words[word];
            let mut stats = Vocab::default();
            let orig_score = self.segment(&lexicon, word, &mut stats);
            if stats.is_empty() {
                warn!("no segmentation for word: {}", word);
                continue;
            }
            curr_ll += weight * orig_score;
            token_count += weight * stats.len() as f64;
            for (factor, count) in &stats {
                *freqs.entry_ref(factor.as_str()).or_insert(0.0) += weight * count;
            }

            // Hypothesize the segmentations without each candidate factor
            // this word uses.
            let mut used: Vec<_> = stats.keys().collect();
            used.sort_unstable();
            for factor in used {
                if !candidates.contains(factor) {
                    continue;
                }
                let stored = match lexicon.remove(factor) {
                    Ok(score) => score,
                    Err(_) => continue,
                };
                let mut hypo_stats = Vocab::default();
                let hypo_score = self.segment(&lexicon, word, &mut hypo_stats);
                if hypo_stats.is_empty() {
                    // The factor is essential for this word; make its
                    // removal maximally harmful.
                    ll_diffs.insert(factor.clone(), MIN_LP);
                } else {
                    *ll_diffs.entry_ref(factor.as_str()).or_insert(0.0) +=
                        weight * (hypo_score - orig_score);
                    *token_diffs.entry_ref(factor.as_str()).or_insert(0.0) +=
                        weight * (hypo_stats.len() as f64 - stats.len() as f64);
                }
                lexicon.add(factor, stored);
            }
        }

        let mut removal_scores: Vec<(String, f64)> = vec![];
        let mut ranked: Vec<_> = ll_diffs.keys().cloned().collect();
        ranked.sort_unstable();
        for factor in ranked {
            let diff = ll_diffs[&factor];
            let score = match sub_log(0.0, vocab[&factor]) {
                Ok(renormalizer) => {
                    let hypo_token_count = token_count + token_diffs.get(&factor).unwrap_or(&0.0);
                    diff + hypo_token_count * -renormalizer
                }
                Err(_) => {
                    warn!("removal of {} would empty the vocabulary", factor);
                    MIN_LP
                }
            };
            removal_scores.push((factor, score));
        }
        removal_scores.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        (curr_ll, removal_scores)
    }
}

/// Turns frequencies into log-probabilities summing to one, flooring at
/// `min_lp` and renormalizing once when flooring added mass.
pub fn freqs_to_logprobs(vocab: &mut Vocab, min_lp: f64) {
    let mut factors: Vec<_> = vocab.keys().cloned().collect();
    factors.sort_unstable();

    let mut total = 0.0;
    for factor in &factors {
        let count = vocab[factor];
        if count.is_finite() {
            total += count;
        }
    }
    let densum = total.ln();

    let mut floored = false;
    for factor in &factors {
        let lp = vocab[factor].ln() - densum;
        vocab.insert(
            factor.clone(),
            if lp.is_finite() && lp >= min_lp {
                lp
            } else {
                floored = true;
                min_lp
            },
        );
    }

    if floored {
        let mut normalizer = MIN_LP;
        for factor in &factors {
            normalizer = crate::common::add_log(normalizer, vocab[factor]);
        }
        for factor in &factors {
            *vocab.get_mut(factor).expect("key set above") -= normalizer;
        }
    }
}

/// Ensures every given factor is present with at least `min_lp`.
pub fn assert_factors<'a, I>(vocab: &mut Vocab, factors: I, min_lp: f64)
where
    I: IntoIterator<Item = &'a String>,
{
    for factor in factors {
        let entry = vocab.entry_ref(factor.as_str()).or_insert(min_lp);
        if *entry < min_lp {
            *entry = min_lp;
        }
    }
}

/// Sorts a vocabulary by score, ties broken lexicographically.
pub fn sort_vocab(vocab: &Vocab, descending: bool) -> Vec<(String, f64)> {
    let mut sorted: Vec<_> = vocab.iter().map(|(f, &s)| (f.clone(), s)).collect();
    if descending {
        sorted.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    } else {
        sorted.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    }
    sorted
}

/// Reads a vocabulary or word list. Both field orders are accepted:
/// `<count> <factor>` and `<factor> <count>`. Lines starting with `#` are
/// comments. Returns the table and the longest factor length in characters.
pub fn read_vocab<R>(rdr: R, utf8: bool) -> Result<(Vocab, usize)>
where
    R: Read,
{
    let mut vocab = Vocab::default();
    let mut max_len = 0;
    for line in BufReader::new(rdr).lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let fields: Vec<_> = trimmed.split_whitespace().collect();
        if fields.len() != 2 {
            return Err(LegatoError::invalid_format(
                "vocabulary",
                format!("expected two fields: {}", line),
            ));
        }
        let (factor, count) = match fields[0].parse::<f64>() {
            Ok(count) => (fields[1], count),
            Err(_) => (fields[0], fields[1].parse::<f64>()?),
        };
        vocab.insert(factor.to_string(), count);
        max_len = max_len.max(factor_length(factor, utf8));
    }
    Ok((vocab, max_len))
}

/// Writes a vocabulary as `<log-prob>\t<factor>` lines sorted descending by
/// score, or `<factor>\t<count>` when `count_style` is set.
pub fn write_vocab<W>(wtr: &mut W, vocab: &Vocab, count_style: bool) -> Result<()>
where
    W: Write,
{
    for (factor, score) in sort_vocab(vocab, true) {
        if count_style {
            writeln!(wtr, "{}\t{}", factor, score)?;
        } else {
            writeln!(wtr, "{}\t{}", score, factor)?;
        }
    }
    Ok(())
}

/// Reads a sentence corpus, one sentence per line, order preserved.
pub fn read_sents<R>(rdr: R) -> Result<Vec<String>>
where
    R: Read,
{
    let mut sents = vec![];
    for line in BufReader::new(rdr).lines() {
        sents.push(line?);
    }
    Ok(sents)
}
