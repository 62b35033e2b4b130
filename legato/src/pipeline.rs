//! End-to-end training pipeline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hashbrown::HashSet;
use log::info;

use crate::bigram::{BigramTrainer, Reestimate};
use crate::common::{find_short_factors, Vocab, DEFAULT_BOUNDARY, ONE_CHAR_MIN_LP};
use crate::errors::Result;
use crate::factor_graph::FactorGraph;
use crate::lexicon::Lexicon;
use crate::msfg::Msfg;
use crate::transitions::Transitions;
use crate::unigram::{assert_factors, SegMethod, UnigramTrainer};

/// Knobs of the training pipeline.
pub struct PipelineConfig {
    /// The reserved boundary symbol.
    pub boundary: String,
    /// Treat strings as UTF-8 codepoint sequences.
    pub utf8: bool,
    /// Collect stats with forward-backward instead of Viterbi.
    pub forward_backward: bool,
    /// Unigram EM iterations run before the bigram model is seeded.
    pub unigram_warmup_iters: usize,
    /// Removal candidates evaluated per prune iteration.
    pub n_candidates: usize,
    /// Subwords removed per prune iteration.
    pub removals_per_iter: usize,
    /// Minimum character length of removable subwords.
    pub min_removal_length: usize,
    /// Stop pruning once the vocabulary is this small.
    pub target_vocab_size: usize,
    /// Emit a checkpoint whenever the vocabulary size crosses a multiple of
    /// this; zero disables checkpoints.
    pub temp_vocab_interval: usize,
    /// Kneser-Ney discount; `None` selects plain maximum likelihood.
    pub kn_discount: Option<f64>,
    /// Worker threads of the bigram stat collection.
    pub threads: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            boundary: DEFAULT_BOUNDARY.to_string(),
            utf8: false,
            forward_backward: false,
            unigram_warmup_iters: 2,
            n_candidates: 5000,
            removals_per_iter: 500,
            min_removal_length: 2,
            target_vocab_size: 1000,
            temp_vocab_interval: 0,
            kn_discount: None,
            threads: 4,
        }
    }
}

/// The phases of the training state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Sanitize the initial vocabulary: boundary symbol and character
    /// coverage.
    LoadInitialVocab,
    /// Merge the per-string lattices into the shared graph.
    BuildMsfg,
    /// Unigram EM warmup iterations.
    UnigramWarmup,
    /// Seed bigram counts from the unigram model.
    SeedBigram,
    /// Iterate bigram EM and pruning until the target size is reached.
    BigramEmAndPrune,
    /// Final model ready to be written.
    EmitFinalModel,
    /// Nothing left to do.
    Done,
}

/// Checkpoint callback: the current transition table and vocabulary size.
pub type CheckpointFn = Box<dyn FnMut(&Transitions, usize) -> Result<()>>;

/// Drives training from an initial vocabulary to the final bigram model.
/// Each [`Pipeline::step`] performs one phase transition (one prune
/// iteration while pruning), so a stop flag is honored between iterations
/// but never inside an EM sweep.
pub struct Pipeline {
    config: PipelineConfig,
    phase: Phase,
    words: Vocab,
    vocab: Vocab,
    transitions: Transitions,
    msfg: Msfg,
    stoplist: HashSet<String>,
    stop: Arc<AtomicBool>,
    checkpoint: Option<CheckpointFn>,
    next_checkpoint_size: usize,
}

impl Pipeline {
    /// Creates a pipeline over a weighted word list and an initial
    /// vocabulary.
    pub fn new(words: Vocab, initial_vocab: Vocab, config: PipelineConfig) -> Self {
        let msfg = Msfg::new(&config.boundary);
        Self {
            config,
            phase: Phase::LoadInitialVocab,
            words,
            vocab: initial_vocab,
            transitions: Transitions::new(),
            msfg,
            stoplist: HashSet::new(),
            stop: Arc::new(AtomicBool::new(false)),
            checkpoint: None,
            next_checkpoint_size: 0,
        }
    }

    /// Subwords that must never be removed.
    pub fn stoplist<I, S>(mut self, factors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stoplist = factors.into_iter().map(Into::into).collect();
        self
    }

    /// Installs a callback invoked at every checkpoint interval.
    pub fn on_checkpoint(&mut self, checkpoint: CheckpointFn) {
        self.checkpoint = Some(checkpoint);
    }

    /// A flag that cancels [`Pipeline::run`] between iterations.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// The current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The current unigram vocabulary.
    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    /// The current transition table.
    pub fn transitions(&self) -> &Transitions {
        &self.transitions
    }

    fn unigram_trainer(&self) -> UnigramTrainer {
        let method = if self.config.forward_backward {
            SegMethod::ForwardBackward
        } else {
            SegMethod::Viterbi
        };
        UnigramTrainer::new()
            .segmentation_method(method)
            .utf8(self.config.utf8)
    }

    fn bigram_trainer(&self) -> BigramTrainer {
        let reestimate = match self.config.kn_discount {
            Some(discount) => Reestimate::KneserNey {
                discount,
                renormalize: true,
            },
            None => Reestimate::MaxLikelihood,
        };
        BigramTrainer::new()
            .forward_backward(self.config.forward_backward)
            .utf8(self.config.utf8)
            .threads(self.config.threads)
            .reestimate(reestimate)
    }

    /// The single characters of the corpus, as strings.
    fn corpus_chars(&self) -> Vec<String> {
        let mut chars: Vec<String> = self
            .words
            .keys()
            .flat_map(|word| word.chars().map(|c| c.to_string()))
            .collect();
        chars.sort_unstable();
        chars.dedup();
        chars
    }

    /// Performs one phase transition and returns the phase that follows.
    pub fn step(&mut self) -> Result<Phase> {
        match self.phase {
            Phase::LoadInitialVocab => {
                self.vocab.insert(self.config.boundary.clone(), 0.0);
                let chars = self.corpus_chars();
                assert_factors(&mut self.vocab, &chars, ONE_CHAR_MIN_LP);
                info!("initial vocabulary size {}", self.vocab.len());
                self.phase = Phase::BuildMsfg;
            }
            Phase::BuildMsfg => {
                let lexicon = Lexicon::from_vocab(&self.vocab, true);
                let mut sorted: Vec<_> = self.words.keys().cloned().collect();
                sorted.sort_unstable();
                for word in sorted {
                    let fg =
                        FactorGraph::new(&word, &self.config.boundary, &lexicon, self.config.utf8);
                    self.msfg.add(&fg)?;
                }
                info!(
                    "built a graph of {} nodes and {} arcs for {} strings",
                    self.msfg.num_nodes(),
                    self.msfg.num_arcs(),
                    self.msfg.texts().len()
                );
                self.phase = Phase::UnigramWarmup;
            }
            Phase::UnigramWarmup => {
                let trainer = self.unigram_trainer();
                let ll = trainer.iterate(
                    &self.words,
                    &mut self.vocab,
                    self.config.unigram_warmup_iters,
                );
                self.vocab.insert(self.config.boundary.clone(), 0.0);
                let chars = self.corpus_chars();
                assert_factors(&mut self.vocab, &chars, ONE_CHAR_MIN_LP);
                info!("unigram warmup likelihood {}", ll);
                self.phase = Phase::SeedBigram;
            }
            Phase::SeedBigram => {
                let cells = self.msfg.assign_unigram_scores(&self.vocab)?;
                let mut stats = Transitions::new();
                let lp = if self.config.forward_backward {
                    crate::em::forward_backward_msfg(&self.msfg, &cells, &self.words, &mut stats)?
                } else {
                    crate::em::viterbi_msfg(&self.msfg, &cells, &self.words, &mut stats)?
                };
                stats.freqs_to_logprobs(crate::common::FLOOR_LP);
                self.transitions = stats;
                info!(
                    "seeded {} transitions at likelihood {}",
                    self.transitions.transition_count(),
                    lp
                );
                let interval = self.config.temp_vocab_interval;
                if interval > 0 {
                    self.next_checkpoint_size =
                        self.transitions.num_sources() / interval * interval;
                }
                self.phase = Phase::BigramEmAndPrune;
            }
            Phase::BigramEmAndPrune => {
                let trainer = self.bigram_trainer();
                let mut stoplist = self.stoplist.clone();
                stoplist.extend(find_short_factors(
                    &self.transitions.to_vocab(),
                    self.config.min_removal_length,
                    self.config.utf8,
                ));
                let report = trainer.prune_step(
                    &self.words,
                    &mut self.msfg,
                    &mut self.transitions,
                    self.config.n_candidates,
                    self.config.removals_per_iter,
                    self.config.min_removal_length,
                    &stoplist,
                )?;
                info!(
                    "pruned {} subwords, vocabulary size {}",
                    report.removed, report.vocab_size
                );

                let interval = self.config.temp_vocab_interval;
                if interval > 0
                    && report.vocab_size <= self.next_checkpoint_size
                    && report.vocab_size > self.config.target_vocab_size
                {
                    if let Some(checkpoint) = self.checkpoint.as_mut() {
                        checkpoint(&self.transitions, report.vocab_size)?;
                    }
                    self.next_checkpoint_size = self.next_checkpoint_size.saturating_sub(interval);
                }

                if report.vocab_size <= self.config.target_vocab_size || report.removed == 0 {
                    self.phase = Phase::EmitFinalModel;
                }
            }
            Phase::EmitFinalModel => {
                self.phase = Phase::Done;
            }
            Phase::Done => {}
        }
        Ok(self.phase)
    }

    /// Runs phases until the model is final or the stop flag is raised.
    pub fn run(&mut self) -> Result<()> {
        while self.phase != Phase::Done && !self.stop.load(Ordering::Relaxed) {
            self.step()?;
        }
        Ok(())
    }
}
