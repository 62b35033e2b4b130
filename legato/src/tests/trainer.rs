use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hashbrown::HashSet;

use super::vocab;
use crate::bigram::{BigramTrainer, Reestimate};
use crate::common::Vocab;
use crate::em;
use crate::errors::Result;
use crate::factor_graph::FactorGraph;
use crate::lexicon::Lexicon;
use crate::msfg::Msfg;
use crate::pipeline::{Phase, Pipeline, PipelineConfig};
use crate::transitions::Transitions;

fn corpus() -> Vocab {
    vocab(&[("kissa", 1.0), ("kisa", 2.0), ("kissaa", 3.0)])
}

fn initial_vocab() -> Vocab {
    let mut v = vocab(&[
        ("k", 1.0),
        ("i", 1.0),
        ("s", 1.0),
        ("a", 1.0),
        ("ki", 1.0),
        ("is", 1.0),
        ("sa", 1.0),
        ("ss", 1.0),
        ("aa", 1.0),
        ("kis", 1.0),
    ]);
    crate::unigram::freqs_to_logprobs(&mut v, crate::common::SMALL_LP);
    v
}

fn seeded_model() -> Result<(Msfg, Transitions)> {
    let mut v = initial_vocab();
    v.insert("*".to_string(), 0.0);
    let lexicon = Lexicon::from_vocab(&v, true);
    let mut msfg = Msfg::new("*");
    let mut words: Vec<_> = corpus().keys().cloned().collect();
    words.sort_unstable();
    for word in &words {
        let fg = FactorGraph::new(word, "*", &lexicon, false);
        msfg.add(&fg)?;
    }
    let cells = msfg.assign_unigram_scores(&v)?;
    let mut stats = Transitions::new();
    em::forward_backward_msfg(&msfg, &cells, &corpus(), &mut stats)?;
    stats.freqs_to_logprobs(crate::common::FLOOR_LP);
    Ok((msfg, stats))
}

#[test]
fn test_collect_stats_is_deterministic_across_thread_counts() {
    let (mut msfg, transitions) = seeded_model().unwrap();
    msfg.assign_scores(&transitions).unwrap();

    let single = BigramTrainer::new().forward_backward(true).threads(1);
    let (ll_1, stats_1, _) = single.collect_stats(&corpus(), &msfg, &transitions).unwrap();

    let parallel = BigramTrainer::new().forward_backward(true).threads(4);
    let (ll_4, stats_4, _) = parallel
        .collect_stats(&corpus(), &msfg, &transitions)
        .unwrap();

    assert!((ll_1 - ll_4).abs() < 1e-12);
    assert_eq!(stats_1.transition_count(), stats_4.transition_count());
    for src in stats_1.sources_sorted() {
        for (tgt, value) in stats_1.row_sorted(&src) {
            let other = stats_4.get(&src, &tgt).unwrap();
            assert!((value - other).abs() < 1e-12, "{} {}", src, tgt);
        }
    }
}

#[test]
fn test_pure_em_likelihood_is_monotone() {
    let (mut msfg, mut transitions) = seeded_model().unwrap();
    let trainer = BigramTrainer::new().forward_backward(true).threads(1);

    let corpus_size: f64 = corpus().values().sum();
    let mut previous = trainer
        .iterate(&corpus(), &mut msfg, &mut transitions, 1)
        .unwrap();
    for _ in 0..4 {
        let ll = trainer
            .iterate(&corpus(), &mut msfg, &mut transitions, 1)
            .unwrap();
        assert!(ll >= previous - 1e-6 * corpus_size);
        previous = ll;
    }
}

#[test]
fn test_viterbi_collection_not_above_forward_backward() {
    let (mut msfg, transitions) = seeded_model().unwrap();
    msfg.assign_scores(&transitions).unwrap();

    let viterbi = BigramTrainer::new().threads(1);
    let (ll_v, _, _) = viterbi.collect_stats(&corpus(), &msfg, &transitions).unwrap();
    let fb = BigramTrainer::new().forward_backward(true).threads(1);
    let (ll_fb, _, _) = fb.collect_stats(&corpus(), &msfg, &transitions).unwrap();
    assert!(ll_v <= ll_fb + 1e-12);
}

#[test]
fn test_kneser_ney_reestimation_normalizes() {
    let (mut msfg, mut transitions) = seeded_model().unwrap();
    let trainer = BigramTrainer::new()
        .forward_backward(true)
        .threads(1)
        .reestimate(Reestimate::KneserNey {
            discount: 0.1,
            renormalize: true,
        });
    trainer
        .iterate(&corpus(), &mut msfg, &mut transitions, 1)
        .unwrap();
    for src in transitions.sources_sorted() {
        let mass: f64 = transitions
            .row_sorted(&src)
            .iter()
            .map(|(_, lp)| lp.exp())
            .sum();
        assert!((mass - 1.0).abs() < 1e-9, "{}", src);
    }
}

#[test]
fn test_rank_candidates_scores_unused_factor_as_free() {
    let (mut msfg, transitions) = seeded_model().unwrap();
    msfg.assign_scores(&transitions).unwrap();
    let trainer = BigramTrainer::new().forward_backward(true).threads(1);

    let mut candidates = std::collections::BTreeMap::new();
    candidates.insert("zz".to_string(), -1.0);
    candidates.insert("kis".to_string(), 0.0);
    trainer
        .rank_candidates(&corpus(), &msfg, &transitions, &mut candidates)
        .unwrap();
    assert_eq!(candidates["zz"], 0.0);
    // Losing a real factor always loses likelihood.
    assert!(candidates["kis"] < 0.0);
}

#[test]
fn test_prune_step_shrinks_vocabulary() {
    let (mut msfg, mut transitions) = seeded_model().unwrap();
    let before = transitions.num_sources();
    let trainer = BigramTrainer::new().forward_backward(true).threads(1);
    let report = trainer
        .prune_step(
            &corpus(),
            &mut msfg,
            &mut transitions,
            10,
            2,
            2,
            &HashSet::new(),
        )
        .unwrap();
    assert!(report.removed > 0);
    assert!(report.vocab_size < before);
    assert_eq!(report.vocab_size, transitions.num_sources());
}

#[test]
fn test_pruning_pipeline_reaches_target_size() {
    let config = PipelineConfig {
        forward_backward: true,
        unigram_warmup_iters: 2,
        n_candidates: 10,
        removals_per_iter: 2,
        min_removal_length: 2,
        // The boundary symbol and the four single characters can never be
        // removed, so five rows is the floor.
        target_vocab_size: 5,
        threads: 1,
        ..PipelineConfig::default()
    };
    let mut pipeline = Pipeline::new(corpus(), initial_vocab(), config);
    pipeline.run().unwrap();
    assert_eq!(pipeline.phase(), Phase::Done);

    let transitions = pipeline.transitions();
    assert_eq!(transitions.num_sources(), 5);
    for factor in ["*", "k", "i", "s", "a"] {
        assert!(transitions.contains_src(factor), "{}", factor);
    }

    // Every training string is still segmentable under the final model.
    let final_vocab = transitions.to_vocab();
    let lexicon = Lexicon::from_vocab(&final_vocab, false);
    for word in corpus().keys() {
        let (lp, path) = em::viterbi(&lexicon, word, false);
        assert!(lp > crate::common::MIN_LP, "{}", word);
        assert!(!path.is_empty());
    }

    // And the written transition table round-trips.
    let mut buf = vec![];
    transitions.write(&mut buf, false).unwrap();
    let back = Transitions::read(buf.as_slice()).unwrap();
    assert_eq!(back.transition_count(), transitions.transition_count());
    for src in transitions.sources_sorted() {
        for (tgt, value) in transitions.row_sorted(&src) {
            assert!((back.get(&src, &tgt).unwrap() - value).abs() < 1e-12);
        }
    }
}

#[test]
fn test_pipeline_emits_checkpoints() {
    let config = PipelineConfig {
        forward_backward: true,
        unigram_warmup_iters: 1,
        n_candidates: 10,
        removals_per_iter: 2,
        min_removal_length: 2,
        target_vocab_size: 5,
        temp_vocab_interval: 2,
        threads: 1,
        ..PipelineConfig::default()
    };
    let mut pipeline = Pipeline::new(corpus(), initial_vocab(), config);
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    pipeline.on_checkpoint(Box::new(move |_, _| {
        seen.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }));
    pipeline.run().unwrap();
    assert!(calls.load(Ordering::Relaxed) > 0);
}

#[test]
fn test_pipeline_stop_flag_halts_early() {
    let config = PipelineConfig {
        forward_backward: true,
        target_vocab_size: 5,
        threads: 1,
        ..PipelineConfig::default()
    };
    let mut pipeline = Pipeline::new(corpus(), initial_vocab(), config);
    pipeline.stop_flag().store(true, Ordering::Relaxed);
    pipeline.run().unwrap();
    assert_eq!(pipeline.phase(), Phase::LoadInitialVocab);
}
